#![forbid(unsafe_code)]

use anyhow::Result;
use intent_ledger_domain::{
    Atom, AtomId, AtomRecommendation, AtomStatus, ConflictId, ConflictRecord, ConflictStatus,
    ConflictType, EventRow, Molecule, MoleculeRecommendation, ReconciliationRun, RunEvent, RunId,
    RunResult, RunStatus, TestRecord,
};

/// Persistence for runs and everything a run owns.
///
/// Implementations are single-connection and not shared across threads; the
/// orchestrator is the only writer during a run.
pub trait LedgerStore {
    #[allow(clippy::missing_errors_doc)]
    fn migrate(&self) -> Result<()>;

    /// Run `work` atomically. Nested calls join the outer unit of work.
    #[allow(clippy::missing_errors_doc)]
    fn in_transaction(&self, work: &mut dyn FnMut() -> Result<()>) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn insert_run(&self, run: &ReconciliationRun) -> Result<()>;

    /// Overwrite the mutable columns of an existing run row.
    #[allow(clippy::missing_errors_doc)]
    fn update_run(&self, run: &ReconciliationRun) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn get_run(&self, run_id: RunId) -> Result<Option<ReconciliationRun>>;

    /// Runs in any of `statuses`, newest first. An empty slice lists every run.
    #[allow(clippy::missing_errors_doc)]
    fn list_runs(&self, statuses: &[RunStatus]) -> Result<Vec<ReconciliationRun>>;

    #[allow(clippy::missing_errors_doc)]
    fn latest_completed_run_for_commit(
        &self,
        commit_hash: &str,
    ) -> Result<Option<ReconciliationRun>>;

    #[allow(clippy::missing_errors_doc)]
    fn delete_run(&self, run_id: RunId) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn insert_test_record(&self, record: &TestRecord) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn update_test_record(&self, record: &TestRecord) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn list_test_records(&self, run_id: RunId) -> Result<Vec<TestRecord>>;

    #[allow(clippy::missing_errors_doc)]
    fn insert_atom_recommendation(&self, recommendation: &AtomRecommendation) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn update_atom_recommendation(&self, recommendation: &AtomRecommendation) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn list_atom_recommendations(&self, run_id: RunId) -> Result<Vec<AtomRecommendation>>;

    #[allow(clippy::missing_errors_doc)]
    fn insert_molecule_recommendation(&self, recommendation: &MoleculeRecommendation)
        -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn update_molecule_recommendation(&self, recommendation: &MoleculeRecommendation)
        -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn list_molecule_recommendations(&self, run_id: RunId) -> Result<Vec<MoleculeRecommendation>>;

    #[allow(clippy::missing_errors_doc)]
    fn insert_atom(&self, atom: &Atom) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn get_atom(&self, atom_id: AtomId) -> Result<Option<Atom>>;

    #[allow(clippy::missing_errors_doc)]
    fn update_atom_status(
        &self,
        atom_id: AtomId,
        status: AtomStatus,
        superseded_by: Option<AtomId>,
    ) -> Result<()>;

    /// Atoms in `status`, ordered by creation.
    #[allow(clippy::missing_errors_doc)]
    fn list_atoms(&self, status: Option<AtomStatus>) -> Result<Vec<Atom>>;

    #[allow(clippy::missing_errors_doc)]
    fn insert_molecule(&self, molecule: &Molecule) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn list_molecules_for_run(&self, run_id: RunId) -> Result<Vec<Molecule>>;

    #[allow(clippy::missing_errors_doc)]
    fn append_event(&self, event: &RunEvent) -> Result<i64>;

    #[allow(clippy::missing_errors_doc)]
    fn list_events_for_run(&self, run_id: RunId) -> Result<Vec<EventRow>>;

    #[allow(clippy::missing_errors_doc)]
    fn find_review_submission(&self, run_id: RunId, fingerprint: &str)
        -> Result<Option<RunResult>>;

    #[allow(clippy::missing_errors_doc)]
    fn record_review_submission(
        &self,
        run_id: RunId,
        fingerprint: &str,
        result: &RunResult,
    ) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictInsert {
    Inserted,
    /// An open conflict for the same unordered pair and type already exists.
    Duplicate(ConflictId),
}

/// Conflict persistence. Conflicts mutate atoms on resolution, so this shares
/// the ledger's connection and transaction scope.
pub trait ConflictStore: LedgerStore {
    #[allow(clippy::missing_errors_doc)]
    fn insert_conflict(&self, conflict: &ConflictRecord) -> Result<ConflictInsert>;

    #[allow(clippy::missing_errors_doc)]
    fn update_conflict(&self, conflict: &ConflictRecord) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn get_conflict(&self, conflict_id: ConflictId) -> Result<Option<ConflictRecord>>;

    #[allow(clippy::missing_errors_doc)]
    fn find_open_conflict(
        &self,
        atom_id_a: AtomId,
        atom_id_b: AtomId,
        conflict_type: ConflictType,
    ) -> Result<Option<ConflictId>>;

    #[allow(clippy::missing_errors_doc)]
    fn list_conflicts(&self, status: Option<ConflictStatus>) -> Result<Vec<ConflictRecord>>;
}
