#![forbid(unsafe_code)]

use intent_ledger_config::ConfigEnvelope;
use intent_ledger_policy::{default_tiers, BudgetTier};

mod closure;
mod conflict;
mod events;
mod evidence;
mod filter;
mod pool;
mod review;
mod run;

pub use closure::{plan_closure, ClosureDecision, ClosurePlan, PlannedTest};
pub use conflict::{
    ConflictOutcome, ConflictScanReport, ConflictService, NewConflict, ResolveRequest,
};
pub use events::{verify_chain, ChainReport, EventLog};
pub use evidence::{EvidenceSource, JsonFileEvidenceSource, StaticEvidenceSource};
pub use filter::PathFilter;
pub use pool::{run_pool, WorkItem, WorkResult};
pub use review::review_fingerprint;
pub use run::{RunDetails, RunOrchestrator, StartRequest};

pub const ORCHESTRATOR_ACTOR: &str = "orchestrator";

/// Engine limits that do not vary per run.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    pub max_concurrency: usize,
    pub max_atom_recommendations: usize,
    pub max_molecule_recommendations: usize,
    pub budget_tiers: Vec<BudgetTier>,
    pub semantic_overlap_threshold: f64,
    pub detect_conflicts_on_completion: bool,
    pub config_hash: Option<String>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            max_atom_recommendations: 200,
            max_molecule_recommendations: 100,
            budget_tiers: default_tiers(),
            semantic_overlap_threshold: 0.8,
            detect_conflicts_on_completion: false,
            config_hash: None,
        }
    }
}

impl EngineSettings {
    #[must_use]
    pub fn from_envelope(envelope: &ConfigEnvelope) -> Self {
        let config = &envelope.config;
        Self {
            max_concurrency: config.max_concurrency,
            max_atom_recommendations: config.max_atom_recommendations,
            max_molecule_recommendations: config.max_molecule_recommendations,
            budget_tiers: config.budget_tiers.clone(),
            semantic_overlap_threshold: config.conflicts.semantic_overlap_threshold,
            detect_conflicts_on_completion: config.conflicts.detect_on_completion,
            config_hash: Some(envelope.normalized_hash.clone()),
        }
    }
}
