use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use intent_ledger_domain::{BudgetReport, StageUsage};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// One size tier. `max_tests = None` accepts any test count.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct BudgetTier {
    pub name: String,
    #[serde(default)]
    pub max_tests: Option<usize>,
    pub max_total_tokens: u64,
    pub max_duration_ms: u64,
    pub max_llm_calls: u64,
}

#[must_use]
pub fn default_tiers() -> Vec<BudgetTier> {
    vec![
        BudgetTier {
            name: "small".to_string(),
            max_tests: Some(50),
            max_total_tokens: 200_000,
            max_duration_ms: 10 * 60 * 1000,
            max_llm_calls: 120,
        },
        BudgetTier {
            name: "medium".to_string(),
            max_tests: Some(250),
            max_total_tokens: 1_000_000,
            max_duration_ms: 30 * 60 * 1000,
            max_llm_calls: 600,
        },
        BudgetTier {
            name: "large".to_string(),
            max_tests: None,
            max_total_tokens: 4_000_000,
            max_duration_ms: 90 * 60 * 1000,
            max_llm_calls: 2_000,
        },
    ]
}

/// Smallest tier whose `max_tests` admits `test_count`; the last tier otherwise.
///
/// Tiers are expected sorted by ascending `max_tests` with the unbounded tier last.
#[must_use]
pub fn select_tier(tiers: &[BudgetTier], test_count: usize) -> Option<&BudgetTier> {
    tiers
        .iter()
        .find(|tier| tier.max_tests.map_or(true, |max| test_count <= max))
        .or_else(|| tiers.last())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BudgetStage {
    InferAtoms,
    GroupMolecules,
}

impl BudgetStage {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InferAtoms => "infer_atoms",
            Self::GroupMolecules => "group_molecules",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetVerdict {
    Within,
    /// Over budget but at most 2x; the run continues with a warning.
    Soft,
    /// Over 2x; the run must fail.
    Hard,
}

#[must_use]
pub fn classify_ratio(ratio: f64) -> BudgetVerdict {
    if ratio <= 1.0 {
        BudgetVerdict::Within
    } else if ratio <= 2.0 {
        BudgetVerdict::Soft
    } else {
        BudgetVerdict::Hard
    }
}

#[allow(clippy::cast_precision_loss)]
fn dimension_ratio(observed: u64, budget: u64) -> f64 {
    if budget == 0 {
        return if observed == 0 { 0.0 } else { f64::INFINITY };
    }
    observed as f64 / budget as f64
}

fn dimensions(tier: &BudgetTier, usage: &StageUsage) -> [(&'static str, u64, u64); 3] {
    [
        ("tokens", usage.tokens, tier.max_total_tokens),
        ("duration_ms", usage.duration_ms, tier.max_duration_ms),
        ("llm_calls", usage.calls, tier.max_llm_calls),
    ]
}

/// Largest observed/budget ratio over tokens, duration and call count.
#[must_use]
pub fn budget_ratio(tier: &BudgetTier, usage: &StageUsage) -> f64 {
    dimensions(tier, usage)
        .iter()
        .map(|(_, observed, budget)| dimension_ratio(*observed, *budget))
        .fold(0.0, f64::max)
}

/// One message per dimension over budget, e.g. `tokens 2.35x of budget (470000/200000)`.
#[must_use]
pub fn violation_messages(tier: &BudgetTier, usage: &StageUsage) -> Vec<String> {
    dimensions(tier, usage)
        .iter()
        .filter_map(|(label, observed, budget)| {
            let ratio = dimension_ratio(*observed, *budget);
            (ratio > 1.0).then(|| format!("{label} {ratio:.2}x of budget ({observed}/{budget})"))
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Granted,
    Refused(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct BudgetOutcome {
    pub verdict: BudgetVerdict,
    pub ratio: f64,
    /// Set the first time a stage pushes the run into a soft violation.
    pub warning: Option<String>,
    /// Set when the run crossed into a hard violation.
    pub violation: Option<String>,
}

#[derive(Debug, Default)]
struct BudgetState {
    total: StageUsage,
    stages: BTreeMap<BudgetStage, StageUsage>,
    in_flight: u64,
    warned_stages: BTreeSet<BudgetStage>,
    hard_exceeded: bool,
}

/// Per-run usage counters shared by inference workers.
///
/// Every mutation happens under one lock so concurrent calls serialize their
/// increments and admission decisions.
#[derive(Debug)]
pub struct BudgetEnforcer {
    tier: BudgetTier,
    started: Instant,
    state: Mutex<BudgetState>,
}

impl BudgetEnforcer {
    #[must_use]
    pub fn new(tier: BudgetTier) -> Self {
        Self {
            tier,
            started: Instant::now(),
            state: Mutex::new(BudgetState::default()),
        }
    }

    #[must_use]
    pub fn tier(&self) -> &BudgetTier {
        &self.tier
    }

    fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn usage_now(&self, state: &BudgetState) -> StageUsage {
        StageUsage {
            tokens: state.total.tokens,
            calls: state.total.calls,
            duration_ms: self.elapsed_ms(),
        }
    }

    /// Reserve one call. Refused once the call budget is spent (counting calls
    /// still in flight) or any dimension has reached its budget.
    pub fn admit(&self, stage: BudgetStage) -> Admission {
        let mut state = self.state.lock();
        if state.hard_exceeded {
            return Admission::Refused("budget hard limit already exceeded".to_string());
        }
        if state.total.calls + state.in_flight >= self.tier.max_llm_calls {
            return Admission::Refused(format!(
                "llm call budget of {} reached for tier {}",
                self.tier.max_llm_calls, self.tier.name
            ));
        }
        let ratio = budget_ratio(&self.tier, &self.usage_now(&state));
        if ratio >= 1.0 {
            return Admission::Refused(format!(
                "{} budget exhausted ({ratio:.2}x of tier {})",
                stage.as_str(),
                self.tier.name
            ));
        }
        state.in_flight += 1;
        Admission::Granted
    }

    /// Record a finished call that was previously admitted, then classify.
    pub fn record(&self, stage: BudgetStage, tokens: u64, duration: Duration) -> BudgetOutcome {
        let mut state = self.state.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        self.absorb(&mut state, stage, tokens, duration)
    }

    fn absorb(
        &self,
        state: &mut BudgetState,
        stage: BudgetStage,
        tokens: u64,
        duration: Duration,
    ) -> BudgetOutcome {
        let duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        state.total.tokens = state.total.tokens.saturating_add(tokens);
        state.total.calls += 1;
        state.total.duration_ms = state.total.duration_ms.saturating_add(duration_ms);
        let entry = state.stages.entry(stage).or_default();
        entry.tokens = entry.tokens.saturating_add(tokens);
        entry.calls += 1;
        entry.duration_ms = entry.duration_ms.saturating_add(duration_ms);

        let usage = self.usage_now(state);
        let ratio = budget_ratio(&self.tier, &usage);
        let verdict = classify_ratio(ratio);
        let detail = violation_messages(&self.tier, &usage).join("; ");

        let mut outcome = BudgetOutcome {
            verdict,
            ratio,
            warning: None,
            violation: None,
        };
        match verdict {
            BudgetVerdict::Within => {}
            BudgetVerdict::Soft => {
                if state.warned_stages.insert(stage) {
                    tracing::warn!(stage = stage.as_str(), ratio, "soft budget violation");
                    outcome.warning = Some(format!(
                        "soft budget violation in {} for tier {}: {detail}",
                        stage.as_str(),
                        self.tier.name
                    ));
                }
            }
            BudgetVerdict::Hard => {
                state.hard_exceeded = true;
                tracing::warn!(stage = stage.as_str(), ratio, "hard budget violation");
                outcome.violation = Some(format!(
                    "run exceeded 2x budget in {} for tier {}: {detail}",
                    stage.as_str(),
                    self.tier.name
                ));
            }
        }
        outcome
    }

    #[must_use]
    pub fn is_hard_exceeded(&self) -> bool {
        self.state.lock().hard_exceeded
    }

    #[must_use]
    pub fn report(&self) -> BudgetReport {
        let state = self.state.lock();
        let usage = self.usage_now(&state);
        build_report(&self.tier, usage, &state.stages)
    }
}

fn build_report(
    tier: &BudgetTier,
    usage: StageUsage,
    stages: &BTreeMap<BudgetStage, StageUsage>,
) -> BudgetReport {
    let ratio = budget_ratio(tier, &usage);
    BudgetReport {
        tier: tier.name.clone(),
        violations: violation_messages(tier, &usage),
        stages: stages
            .iter()
            .map(|(stage, usage)| (stage.as_str().to_string(), usage.clone()))
            .collect(),
        usage,
        ratio,
        within_budget: ratio <= 1.0,
        within_2x: ratio <= 2.0,
    }
}

/// Report for externally observed usage, used when reconstructing a summary.
#[must_use]
pub fn report_for_usage(tier: &BudgetTier, usage: StageUsage) -> BudgetReport {
    build_report(tier, usage, &BTreeMap::new())
}
