use intent_ledger_domain::{
    AtomRecommendation, EvidenceInventory, LedgerError, LedgerResult, MoleculeRecommendation,
    MAX_SCORE,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QualityAssessment {
    pub score: u8,
    pub issues: Vec<String>,
}

/// Maps a recommendation to a 0..=100 quality score.
pub trait QualityScorer: Send + Sync {
    fn name(&self) -> &'static str;

    fn score_atom(
        &self,
        recommendation: &AtomRecommendation,
        inventory: &EvidenceInventory,
    ) -> QualityAssessment;

    fn score_molecule(&self, molecule: &MoleculeRecommendation, member_scores: &[u8]) -> u8;
}

const COMPOUND_MARKERS: [&str; 4] = [" and ", " or ", ";", " as well as "];
const MIN_DESCRIPTION_CHARS: usize = 12;
const MAX_DESCRIPTION_CHARS: usize = 280;

/// Weights inference confidence together with evidence strength.
///
/// | component | points |
/// |---|---|
/// | confidence | confidence / 2 |
/// | observable outcomes | 0 / 20 / 25 for none / one / several |
/// | atomic description | 15, or 5 when compound |
/// | description length within 12..=280 chars | 5 |
/// | source line known | 3 |
/// | related doc present in the inventory | 2 |
/// | each ambiguity reason | -5 |
#[derive(Debug, Clone, Copy, Default)]
pub struct EvidenceWeightedScorer;

impl QualityScorer for EvidenceWeightedScorer {
    fn name(&self) -> &'static str {
        "evidence_weighted.v1"
    }

    fn score_atom(
        &self,
        recommendation: &AtomRecommendation,
        inventory: &EvidenceInventory,
    ) -> QualityAssessment {
        let mut issues = Vec::new();
        let mut score = i32::from(recommendation.confidence.min(MAX_SCORE)) / 2;

        score += match recommendation.observable_outcomes.len() {
            0 => {
                issues.push("no observable outcomes".to_string());
                0
            }
            1 => 20,
            _ => 25,
        };

        let description = recommendation.description.to_lowercase();
        if COMPOUND_MARKERS
            .iter()
            .any(|marker| description.contains(marker))
        {
            issues.push("description is not atomic (compound statement)".to_string());
            score += 5;
        } else {
            score += 15;
        }

        let length = recommendation.description.trim().chars().count();
        if (MIN_DESCRIPTION_CHARS..=MAX_DESCRIPTION_CHARS).contains(&length) {
            score += 5;
        } else {
            issues.push(format!(
                "description length {length} outside {MIN_DESCRIPTION_CHARS}..={MAX_DESCRIPTION_CHARS}"
            ));
        }

        if recommendation.source_test.line_number > 0 {
            score += 3;
        }
        if recommendation
            .related_docs
            .iter()
            .any(|doc| inventory.contains_doc(doc))
        {
            score += 2;
        }

        for reason in &recommendation.ambiguity_reasons {
            issues.push(format!("ambiguous: {reason}"));
            score -= 5;
        }

        QualityAssessment {
            score: clamp_score(score),
            issues,
        }
    }

    fn score_molecule(&self, molecule: &MoleculeRecommendation, member_scores: &[u8]) -> u8 {
        if member_scores.is_empty() {
            return 0;
        }
        let total: u32 = member_scores.iter().map(|score| u32::from(*score)).sum();
        let count = u32::try_from(member_scores.len()).unwrap_or(u32::MAX);
        let mean = u8::try_from(total / count).unwrap_or(MAX_SCORE);
        molecule.confidence.min(mean).min(MAX_SCORE)
    }
}

fn clamp_score(value: i32) -> u8 {
    u8::try_from(value.clamp(0, i32::from(MAX_SCORE))).unwrap_or(0)
}

#[must_use]
pub fn passes_threshold(score: u8, threshold: u8) -> bool {
    score >= threshold
}

#[must_use]
pub fn auto_rejection_reason(score: u8, threshold: u8) -> String {
    format!("quality score {score} below threshold {threshold}")
}

/// An atom may only be accepted when it names at least one observable outcome.
///
/// # Errors
/// Returns [`LedgerError::Validation`] for atoms without observable outcomes.
pub fn ensure_acceptable(recommendation: &AtomRecommendation) -> LedgerResult<()> {
    if recommendation.observable_outcomes.is_empty() {
        return Err(LedgerError::Validation(format!(
            "atom recommendation {} has no observable outcomes and cannot be accepted",
            recommendation.temp_id
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatePolicy {
    pub threshold: u8,
    pub require_review: bool,
    pub force_interrupt_on_quality_fail: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    AutoFinalize,
    Interrupt { reason: String },
}

/// Decide whether scored recommendations are finalized or handed to a reviewer.
///
/// Nothing to review never interrupts.
#[must_use]
pub fn evaluate_gate(policy: &GatePolicy, pass_count: usize, fail_count: usize) -> GateDecision {
    if pass_count + fail_count == 0 {
        return GateDecision::AutoFinalize;
    }
    if policy.require_review {
        return GateDecision::Interrupt {
            reason: "review required by run options".to_string(),
        };
    }
    if policy.force_interrupt_on_quality_fail && fail_count > pass_count {
        return GateDecision::Interrupt {
            reason: format!(
                "{fail_count} recommendations below threshold {} outnumber {pass_count} passing",
                policy.threshold
            ),
        };
    }
    GateDecision::AutoFinalize
}
