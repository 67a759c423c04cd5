#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use ulid::Ulid;

mod error;
mod evidence;

pub use error::{LedgerError, LedgerResult};
pub use evidence::{
    test_key, ApiEndpointEvidence, CoverageGap, DocEvidence, EvidenceInventory, ExportEvidence,
    FileEvidence, TestEvidence,
};

pub type DateTimeUtc = OffsetDateTime;

pub const DEFAULT_QUALITY_THRESHOLD: u8 = 80;
pub const MAX_SCORE: u8 = 100;

macro_rules! ulid_id {
    ($name:ident, $label:literal) => {
        #[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name(pub Ulid);

        impl $name {
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }

            /// Parse the canonical ULID text form.
            ///
            /// # Errors
            /// Returns [`LedgerError::Validation`] when the input is not a ULID.
            pub fn parse(value: &str) -> LedgerResult<Self> {
                Ulid::from_str(value.trim()).map(Self).map_err(|err| {
                    LedgerError::Validation(format!("invalid {} ULID '{value}': {err}", $label))
                })
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

ulid_id!(RunId, "run_id");
ulid_id!(TestRecordId, "test_record_id");
ulid_id!(AtomId, "atom_id");
ulid_id!(MoleculeId, "molecule_id");
ulid_id!(ConflictId, "conflict_id");

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum RunMode {
    FullScan,
    Delta,
}

impl RunMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FullScan => "full-scan",
            Self::Delta => "delta",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "full-scan" => Some(Self::FullScan),
            "delta" => Some(Self::Delta),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    WaitingForReview,
    Completed,
    Failed,
}

impl RunStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::WaitingForReview => "waiting_for_review",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "waiting_for_review" => Some(Self::WaitingForReview),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether `self -> next` is an edge of the run state machine.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running | Self::Failed)
                | (
                    Self::Running,
                    Self::Completed | Self::WaitingForReview | Self::Failed
                )
                | (Self::WaitingForReview, Self::Running | Self::Failed)
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TestRecordStatus {
    Pending,
    Accepted,
    Rejected,
    Skipped,
}

impl TestRecordStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
            Self::Skipped => "skipped",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "accepted" => Some(Self::Accepted),
            "rejected" => Some(Self::Rejected),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_closed(self) -> bool {
        matches!(self, Self::Accepted | Self::Rejected)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationStatus {
    Pending,
    Accepted,
    Rejected,
}

impl RecommendationStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "accepted" => Some(Self::Accepted),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    SameTest,
    SemanticOverlap,
    Contradiction,
    CrossBoundary,
}

impl ConflictType {
    pub const ALL: [Self; 4] = [
        Self::SameTest,
        Self::SemanticOverlap,
        Self::Contradiction,
        Self::CrossBoundary,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SameTest => "same_test",
            Self::SemanticOverlap => "semantic_overlap",
            Self::Contradiction => "contradiction",
            Self::CrossBoundary => "cross_boundary",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "same_test" => Some(Self::SameTest),
            "semantic_overlap" => Some(Self::SemanticOverlap),
            "contradiction" => Some(Self::Contradiction),
            "cross_boundary" => Some(Self::CrossBoundary),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    Open,
    Resolved,
    Escalated,
}

impl ConflictStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Resolved => "resolved",
            Self::Escalated => "escalated",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "open" => Some(Self::Open),
            "resolved" => Some(Self::Resolved),
            "escalated" => Some(Self::Escalated),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionAction {
    SupersedeA,
    SupersedeB,
    SplitTest,
    RejectA,
    RejectB,
    Clarify,
}

impl ResolutionAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SupersedeA => "supersede_a",
            Self::SupersedeB => "supersede_b",
            Self::SplitTest => "split_test",
            Self::RejectA => "reject_a",
            Self::RejectB => "reject_b",
            Self::Clarify => "clarify",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "supersede_a" => Some(Self::SupersedeA),
            "supersede_b" => Some(Self::SupersedeB),
            "split_test" => Some(Self::SplitTest),
            "reject_a" => Some(Self::RejectA),
            "reject_b" => Some(Self::RejectB),
            "clarify" => Some(Self::Clarify),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AtomStatus {
    Committed,
    Superseded,
    Rejected,
}

impl AtomStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Committed => "committed",
            Self::Superseded => "superseded",
            Self::Rejected => "rejected",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "committed" => Some(Self::Committed),
            "superseded" => Some(Self::Superseded),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunEventType {
    RunCreated,
    RunStarted,
    EvidenceLoaded,
    ClosureEvaluated,
    InferenceFinished,
    GroupingFinished,
    QualityGateEvaluated,
    ReviewRequested,
    ReviewApplied,
    BudgetWarning,
    RunResumed,
    RunCompleted,
    RunFailed,
    Warning,
}

impl RunEventType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RunCreated => "run_created",
            Self::RunStarted => "run_started",
            Self::EvidenceLoaded => "evidence_loaded",
            Self::ClosureEvaluated => "closure_evaluated",
            Self::InferenceFinished => "inference_finished",
            Self::GroupingFinished => "grouping_finished",
            Self::QualityGateEvaluated => "quality_gate_evaluated",
            Self::ReviewRequested => "review_requested",
            Self::ReviewApplied => "review_applied",
            Self::BudgetWarning => "budget_warning",
            Self::RunResumed => "run_resumed",
            Self::RunCompleted => "run_completed",
            Self::RunFailed => "run_failed",
            Self::Warning => "warning",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "run_created" => Some(Self::RunCreated),
            "run_started" => Some(Self::RunStarted),
            "evidence_loaded" => Some(Self::EvidenceLoaded),
            "closure_evaluated" => Some(Self::ClosureEvaluated),
            "inference_finished" => Some(Self::InferenceFinished),
            "grouping_finished" => Some(Self::GroupingFinished),
            "quality_gate_evaluated" => Some(Self::QualityGateEvaluated),
            "review_requested" => Some(Self::ReviewRequested),
            "review_applied" => Some(Self::ReviewApplied),
            "budget_warning" => Some(Self::BudgetWarning),
            "run_resumed" => Some(Self::RunResumed),
            "run_completed" => Some(Self::RunCompleted),
            "run_failed" => Some(Self::RunFailed),
            "warning" => Some(Self::Warning),
            _ => None,
        }
    }
}

/// Prior state a delta run diffs against. At least one field must be set.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DeltaBaseline {
    #[serde(default)]
    pub run_id: Option<RunId>,
    #[serde(default)]
    pub commit_hash: Option<String>,
}

impl DeltaBaseline {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.run_id.is_none()
            && self
                .commit_hash
                .as_deref()
                .map_or(true, |hash| hash.trim().is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RunOptions {
    #[serde(default = "default_quality_threshold")]
    pub quality_threshold: u8,
    #[serde(default)]
    pub include_paths: Vec<String>,
    #[serde(default)]
    pub exclude_paths: Vec<String>,
    #[serde(default)]
    pub require_review: bool,
    #[serde(default)]
    pub force_interrupt_on_quality_fail: bool,
    #[serde(default)]
    pub max_tests: Option<usize>,
    #[serde(default)]
    pub detect_conflicts: bool,
}

fn default_quality_threshold() -> u8 {
    DEFAULT_QUALITY_THRESHOLD
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            quality_threshold: DEFAULT_QUALITY_THRESHOLD,
            include_paths: Vec::new(),
            exclude_paths: Vec::new(),
            require_review: false,
            force_interrupt_on_quality_fail: false,
            max_tests: None,
            detect_conflicts: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StageUsage {
    pub tokens: u64,
    pub calls: u64,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BudgetReport {
    pub tier: String,
    pub usage: StageUsage,
    pub stages: BTreeMap<String, StageUsage>,
    pub ratio: f64,
    pub within_budget: bool,
    pub within_2x: bool,
    pub violations: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RunSummary {
    pub total_tests: usize,
    pub total_orphan_tests: usize,
    pub linked_tests: usize,
    pub filtered_out: usize,
    pub skipped_closed: usize,
    pub reprocessed_changed: usize,
    pub analyzed_new: usize,
    pub deferred: usize,
    pub inference_failures: usize,
    pub grounding_violations: usize,
    pub atoms_proposed: usize,
    pub molecules_proposed: usize,
    pub atoms_accepted: usize,
    pub atoms_rejected: usize,
    pub molecules_accepted: usize,
    pub molecules_rejected: usize,
    #[serde(default)]
    pub budget: Option<BudgetReport>,
}

/// One mutation of the atom/molecule ledger applied on behalf of a run.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PatchOp {
    CreateAtom { temp_id: String, atom_id: AtomId },
    RejectAtom { temp_id: String, reason: String },
    CreateMolecule { temp_id: String, molecule_id: MoleculeId },
    RejectMolecule { temp_id: String, reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RunErrorEntry {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub test_key: Option<String>,
    pub recorded_at: DateTimeUtc,
}

impl RunErrorEntry {
    #[must_use]
    pub fn new(code: &str, message: impl Into<String>, test_key: Option<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            test_key,
            recorded_at: now_utc(),
        }
    }

    #[must_use]
    pub fn from_error(err: &LedgerError, test_key: Option<String>) -> Self {
        Self::new(err.code(), err.to_string(), test_key)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconciliationRun {
    pub run_id: RunId,
    pub root_directory: String,
    pub mode: RunMode,
    pub delta_baseline: Option<DeltaBaseline>,
    /// Baseline run the closure engine actually diffed against.
    pub baseline_run_id: Option<RunId>,
    pub commit_hash: Option<String>,
    pub status: RunStatus,
    pub options: RunOptions,
    pub summary: RunSummary,
    pub patch_ops: Vec<PatchOp>,
    pub errors: Vec<RunErrorEntry>,
    pub error_message: Option<String>,
    pub config_hash: Option<String>,
    pub created_at: DateTimeUtc,
    pub completed_at: Option<DateTimeUtc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SourceTestRef {
    pub file_path: String,
    pub test_name: String,
    pub line_number: u32,
}

impl SourceTestRef {
    #[must_use]
    pub fn key(&self) -> String {
        test_key(&self.file_path, &self.test_name)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.file_path.trim().is_empty() || self.test_name.trim().is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TestRecord {
    pub test_record_id: TestRecordId,
    pub run_id: RunId,
    pub file_path: String,
    pub test_name: String,
    pub line_number: u32,
    pub content_hash: String,
    pub status: TestRecordStatus,
    /// Closed status carried forward when this record was skipped as closed.
    pub inherited_status: Option<TestRecordStatus>,
    pub recommendation_temp_id: Option<String>,
    pub has_atom_annotation: bool,
    pub changed_since_baseline: bool,
    pub deferred: bool,
    pub closure_reason: Option<String>,
}

impl TestRecord {
    #[must_use]
    pub fn key(&self) -> String {
        test_key(&self.file_path, &self.test_name)
    }

    /// Closed either directly or through a closure inherited from a baseline.
    #[must_use]
    pub fn effective_closed_status(&self) -> Option<TestRecordStatus> {
        if self.status.is_closed() {
            return Some(self.status);
        }
        if self.status == TestRecordStatus::Skipped {
            return self.inherited_status.filter(|status| status.is_closed());
        }
        None
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AtomRecommendation {
    pub run_id: RunId,
    pub temp_id: String,
    pub description: String,
    pub category: String,
    pub confidence: u8,
    pub reasoning: String,
    pub source_test: SourceTestRef,
    pub observable_outcomes: Vec<String>,
    pub related_docs: Vec<String>,
    pub ambiguity_reasons: Vec<String>,
    pub quality_score: Option<u8>,
    pub quality_issues: Vec<String>,
    pub status: RecommendationStatus,
    pub rejection_reason: Option<String>,
    pub atom_id: Option<AtomId>,
    pub created_at: DateTimeUtc,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct MoleculeRecommendation {
    pub run_id: RunId,
    pub temp_id: String,
    pub name: String,
    pub description: String,
    pub atom_temp_ids: Vec<String>,
    pub confidence: u8,
    pub reasoning: String,
    pub quality_score: Option<u8>,
    pub status: RecommendationStatus,
    pub rejection_reason: Option<String>,
    pub molecule_id: Option<MoleculeId>,
    pub created_at: DateTimeUtc,
}

/// A committed atom in the ledger.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Atom {
    pub atom_id: AtomId,
    pub description: String,
    pub category: String,
    pub source_test: SourceTestRef,
    pub status: AtomStatus,
    pub superseded_by: Option<AtomId>,
    pub created_from_run_id: Option<RunId>,
    pub created_at: DateTimeUtc,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Molecule {
    pub molecule_id: MoleculeId,
    pub name: String,
    pub description: String,
    pub atom_ids: Vec<AtomId>,
    pub created_from_run_id: Option<RunId>,
    pub created_at: DateTimeUtc,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Decision {
    Approve {
        #[serde(default)]
        reason: Option<String>,
    },
    Reject {
        reason: String,
    },
}

impl Decision {
    #[must_use]
    pub fn target_status(&self) -> RecommendationStatus {
        match self {
            Self::Approve { .. } => RecommendationStatus::Accepted,
            Self::Reject { .. } => RecommendationStatus::Rejected,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RecommendationDecision {
    pub temp_id: String,
    pub decision: Decision,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ReviewSubmission {
    #[serde(default)]
    pub atom_decisions: Vec<RecommendationDecision>,
    #[serde(default)]
    pub molecule_decisions: Vec<RecommendationDecision>,
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ReviewSummary {
    pub total_atoms: usize,
    pub total_molecules: usize,
    pub pass_count: usize,
    pub fail_count: usize,
    pub threshold: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct PendingAtom {
    pub temp_id: String,
    pub description: String,
    pub source_test: SourceTestRef,
    pub quality_score: u8,
    pub passes: bool,
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct PendingMolecule {
    pub temp_id: String,
    pub name: String,
    pub atom_temp_ids: Vec<String>,
    pub quality_score: u8,
    pub passes: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct PendingReview {
    pub summary: ReviewSummary,
    pub pending_atoms: Vec<PendingAtom>,
    pub pending_molecules: Vec<PendingMolecule>,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunResult {
    pub run_id: RunId,
    pub status: RunStatus,
    pub summary: RunSummary,
    pub pending_review: Option<PendingReview>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ConflictResolution {
    pub action: ResolutionAction,
    pub resolved_by: String,
    pub resolved_at: DateTimeUtc,
    pub reason: Option<String>,
    pub clarification_artifact_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConflictRecord {
    pub conflict_id: ConflictId,
    pub conflict_type: ConflictType,
    pub atom_id_a: AtomId,
    pub atom_id_b: AtomId,
    pub test_record_id: Option<TestRecordId>,
    pub similarity_score: Option<f64>,
    pub description: String,
    pub status: ConflictStatus,
    pub resolution: Option<ConflictResolution>,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

impl ConflictRecord {
    /// Order-independent identity used for the open-conflict uniqueness rule.
    #[must_use]
    pub fn pair_key(&self) -> (AtomId, AtomId, ConflictType) {
        conflict_pair_key(self.atom_id_a, self.atom_id_b, self.conflict_type)
    }
}

#[must_use]
pub fn conflict_pair_key(
    a: AtomId,
    b: AtomId,
    conflict_type: ConflictType,
) -> (AtomId, AtomId, ConflictType) {
    if a <= b {
        (a, b, conflict_type)
    } else {
        (b, a, conflict_type)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct ConflictTypeCounts {
    pub total: usize,
    pub open: usize,
    pub resolved: usize,
    pub escalated: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct ConflictMetrics {
    pub total: usize,
    pub open: usize,
    pub resolved: usize,
    pub escalated: usize,
    pub by_type: BTreeMap<String, ConflictTypeCounts>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RunEvent {
    pub event_id: Ulid,
    pub run_id: RunId,
    pub event_type: RunEventType,
    pub occurred_at: DateTimeUtc,
    pub actor: String,
    pub payload_json: Value,
    pub payload_hash: String,
    pub prev_event_hash: Option<String>,
    pub event_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct EventRow {
    pub event_seq: i64,
    pub event: RunEvent,
}

#[must_use]
pub fn now_utc() -> DateTimeUtc {
    OffsetDateTime::now_utc()
}

#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Hash a JSON value with stable `serde_json` serialization + SHA-256.
///
/// # Errors
/// Returns an error if JSON serialization fails.
pub fn hash_json(value: &Value) -> anyhow::Result<String> {
    let bytes = serde_json::to_vec(value)?;
    Ok(hash_bytes(&bytes))
}

/// Hash a run event envelope; `event_hash` must be empty while hashing.
///
/// # Errors
/// Returns an error if the event cannot be serialized.
pub fn compute_event_hash(event: &RunEvent) -> anyhow::Result<String> {
    let value = serde_json::to_value(event)?;
    hash_json(&value)
}

/// Ensure a string field is non-empty after trimming.
///
/// # Errors
/// Returns [`LedgerError::Validation`] when the value is empty/whitespace.
pub fn ensure_non_empty(field_name: &str, value: &str) -> LedgerResult<()> {
    if value.trim().is_empty() {
        return Err(LedgerError::Validation(format!(
            "{field_name} MUST be non-empty"
        )));
    }
    Ok(())
}

fn short_digest(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0_u8]);
    }
    hex::encode(hasher.finalize()).chars().take(12).collect()
}

/// Deterministic run-scoped id for the `index`-th candidate inferred from a test.
#[must_use]
pub fn atom_temp_id(file_path: &str, test_name: &str, index: usize) -> String {
    format!(
        "atom-{}",
        short_digest(&[file_path, test_name, &index.to_string()])
    )
}

#[must_use]
pub fn molecule_temp_id(name: &str, member_temp_ids: &[String]) -> String {
    let mut members: Vec<&str> = member_temp_ids.iter().map(String::as_str).collect();
    members.sort_unstable();
    members.dedup();
    let mut parts = vec![name];
    parts.extend(members);
    format!("molecule-{}", short_digest(&parts))
}

/// Format a timestamp as RFC 3339.
///
/// # Errors
/// Returns an error if the timestamp cannot be formatted.
pub fn format_rfc3339(value: DateTimeUtc) -> anyhow::Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| anyhow::anyhow!("invalid datetime format: {err}"))
}

/// Parse an RFC 3339 timestamp.
///
/// # Errors
/// Returns an error if the input is not RFC 3339.
pub fn parse_rfc3339(value: &str) -> anyhow::Result<DateTimeUtc> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| anyhow::anyhow!("invalid RFC3339 datetime: {err}"))
}
