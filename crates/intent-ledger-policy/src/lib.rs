#![forbid(unsafe_code)]

mod budget;
mod quality;

pub use budget::{
    budget_ratio, classify_ratio, default_tiers, report_for_usage, select_tier,
    violation_messages, Admission, BudgetEnforcer, BudgetOutcome, BudgetStage, BudgetTier,
    BudgetVerdict,
};
pub use quality::{
    auto_rejection_reason, ensure_acceptable, evaluate_gate, passes_threshold,
    EvidenceWeightedScorer, GateDecision, GatePolicy, QualityAssessment, QualityScorer,
};
