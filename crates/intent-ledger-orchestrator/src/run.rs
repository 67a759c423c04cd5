//! The reconciliation run state machine.
//!
//! A run moves `pending -> running -> completed | waiting_for_review | failed`.
//! Every stage persists its output before the next one starts, so a run left
//! in `running` by a crash can be resumed from what is already stored.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use anyhow::anyhow;
use intent_ledger_domain::{
    atom_temp_id, ensure_non_empty, molecule_temp_id, now_utc, AtomRecommendation,
    DeltaBaseline, EvidenceInventory, LedgerError, LedgerResult, Molecule, MoleculeRecommendation,
    PendingReview, RecommendationStatus, ReconciliationRun, RunErrorEntry, RunEventType, RunId,
    RunMode, RunOptions, RunResult, RunStatus, RunSummary, TestEvidence, TestRecord,
    TestRecordStatus, MAX_SCORE,
};
use intent_ledger_inference::{
    ground_candidate, validate_molecule, AtomInferenceOutput, AtomInferenceRequest,
    GroupingAtom, GroupingRequest, InferenceCapability,
};
use intent_ledger_policy::{
    evaluate_gate, select_tier, Admission, BudgetEnforcer, BudgetOutcome, BudgetStage,
    GateDecision, GatePolicy, QualityScorer,
};
use intent_ledger_store_core::ConflictStore;
use serde::Serialize;
use serde_json::{json, Value};

use crate::closure::plan_closure;
use crate::conflict::ConflictService;
use crate::events::{verify_chain, ChainReport, EventLog};
use crate::evidence::EvidenceSource;
use crate::filter::PathFilter;
use crate::pool::{run_pool, WorkItem, WorkResult};
use crate::review::{build_pending_review, count_passing};
use crate::{EngineSettings, ORCHESTRATOR_ACTOR};

pub(crate) type RunLog<'s> = EventLog<'s, dyn ConflictStore + 's>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartRequest {
    pub root_directory: String,
    pub mode: RunMode,
    pub delta_baseline: Option<DeltaBaseline>,
    /// Commit the inventory must describe; taken from the inventory when absent.
    pub commit_hash: Option<String>,
    pub options: RunOptions,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RunDetails {
    pub run: ReconciliationRun,
    pub test_records: Vec<TestRecord>,
    pub atom_recommendations: Vec<AtomRecommendation>,
    pub molecule_recommendations: Vec<MoleculeRecommendation>,
    /// Molecules committed by this run, with their member atoms.
    pub molecules: Vec<Molecule>,
    pub pending_review: Option<PendingReview>,
}

pub struct RunOrchestrator<'a> {
    pub(crate) store: &'a dyn ConflictStore,
    evidence: &'a dyn EvidenceSource,
    capability: &'a dyn InferenceCapability,
    pub(crate) scorer: &'a dyn QualityScorer,
    pub(crate) settings: EngineSettings,
}

#[derive(Debug, Default)]
struct InferenceProgress {
    atom_count: usize,
    externally_failed: bool,
    hard_violation: Option<String>,
    bound_violation: Option<String>,
}

impl InferenceProgress {
    fn halted(&self) -> bool {
        self.externally_failed || self.bound_violation.is_some()
    }
}

impl<'a> RunOrchestrator<'a> {
    #[must_use]
    pub fn new(
        store: &'a dyn ConflictStore,
        evidence: &'a dyn EvidenceSource,
        capability: &'a dyn InferenceCapability,
        scorer: &'a dyn QualityScorer,
        settings: EngineSettings,
    ) -> Self {
        Self {
            store,
            evidence,
            capability,
            scorer,
            settings,
        }
    }

    /// Create a run and drive it until it completes, fails or needs review.
    ///
    /// Pipeline failures (budget, output bound, missing evidence) fail the run
    /// and are reported through the returned status.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] or [`LedgerError::NotFound`] before
    /// any state is written, and [`LedgerError::Storage`] when persistence fails.
    pub fn start(&self, request: StartRequest) -> LedgerResult<RunResult> {
        self.validate_start(&request)?;
        let baseline_run_id = self.resolve_baseline(&request)?;

        let mut run = ReconciliationRun {
            run_id: RunId::new(),
            root_directory: request.root_directory.trim().to_string(),
            mode: request.mode,
            delta_baseline: request.delta_baseline,
            baseline_run_id,
            commit_hash: request.commit_hash,
            status: RunStatus::Pending,
            options: request.options,
            summary: RunSummary::default(),
            patch_ops: Vec::new(),
            errors: Vec::new(),
            error_message: None,
            config_hash: self.settings.config_hash.clone(),
            created_at: now_utc(),
            completed_at: None,
        };
        self.store.insert_run(&run)?;

        let mut log = EventLog::fresh(self.store, run.run_id);
        log.emit(
            RunEventType::RunCreated,
            ORCHESTRATOR_ACTOR,
            json!({
                "root_directory": run.root_directory,
                "mode": run.mode.as_str(),
                "baseline_run_id": run.baseline_run_id.map(|id| id.to_string()),
                "options": run.options,
                "config_hash": run.config_hash,
            }),
        )?;
        tracing::info!(run_id = %run.run_id, mode = run.mode.as_str(), "run created");

        self.transition(&mut run, RunStatus::Running, &mut log, RunEventType::RunStarted, json!({}))?;
        self.load_and_execute(&mut run, &mut log)
    }

    /// Continue a run interrupted by a crash.
    ///
    /// # Errors
    /// Returns [`LedgerError::InvalidState`] unless the run is `pending` or
    /// `running`, and [`LedgerError::NotFound`] for unknown runs.
    pub fn resume(&self, run_id: RunId) -> LedgerResult<RunResult> {
        let mut run = self.load_run(run_id)?;
        let mut log = EventLog::open(self.store, run_id)?;
        match run.status {
            RunStatus::Pending => {
                self.transition(&mut run, RunStatus::Running, &mut log, RunEventType::RunStarted, json!({}))?;
            }
            RunStatus::Running => {
                log.emit(
                    RunEventType::RunResumed,
                    ORCHESTRATOR_ACTOR,
                    json!({ "trigger": "resume" }),
                )?;
                tracing::info!(run_id = %run_id, "resuming interrupted run");
            }
            RunStatus::WaitingForReview => {
                return Err(LedgerError::invalid_state(format!(
                    "run {run_id} is waiting for review; submit review decisions instead"
                )));
            }
            RunStatus::Completed | RunStatus::Failed => {
                return Err(LedgerError::invalid_state(format!(
                    "run {run_id} is already {}",
                    run.status.as_str()
                )));
            }
        }
        self.load_and_execute(&mut run, &mut log)
    }

    /// Fail a non-terminal run from outside the pipeline. In-flight inference
    /// results of that run are discarded when they arrive.
    ///
    /// # Errors
    /// Returns [`LedgerError::InvalidState`] for completed or failed runs.
    pub fn mark_failed(&self, run_id: RunId, reason: &str) -> LedgerResult<RunResult> {
        ensure_non_empty("reason", reason)?;
        let mut run = self.load_run(run_id)?;
        if run.status.is_terminal() {
            return Err(LedgerError::invalid_state(format!(
                "run {run_id} is already {}",
                run.status.as_str()
            )));
        }
        let mut log = EventLog::open(self.store, run_id)?;
        run.errors
            .push(RunErrorEntry::new("marked_failed", reason.trim(), None));
        run.error_message = Some(reason.trim().to_string());
        self.transition(
            &mut run,
            RunStatus::Failed,
            &mut log,
            RunEventType::RunFailed,
            json!({ "code": "marked_failed", "message": reason.trim() }),
        )?;
        Ok(result_for(&run, None))
    }

    /// Runs that are pending, running or waiting for review, newest first.
    ///
    /// # Errors
    /// Returns [`LedgerError::Storage`] when the store cannot be read.
    pub fn get_active_runs(&self) -> LedgerResult<Vec<ReconciliationRun>> {
        Ok(self.store.list_runs(&[
            RunStatus::Pending,
            RunStatus::Running,
            RunStatus::WaitingForReview,
        ])?)
    }

    /// # Errors
    /// Returns [`LedgerError::NotFound`] for unknown runs.
    pub fn get_run_details(&self, run_id: RunId) -> LedgerResult<RunDetails> {
        let run = self.load_run(run_id)?;
        let pending_review = self.pending_review_for(&run)?;
        Ok(RunDetails {
            test_records: self.store.list_test_records(run_id)?,
            atom_recommendations: self.store.list_atom_recommendations(run_id)?,
            molecule_recommendations: self.store.list_molecule_recommendations(run_id)?,
            molecules: self.store.list_molecules_for_run(run_id)?,
            pending_review,
            run,
        })
    }

    /// # Errors
    /// Returns [`LedgerError::NotFound`] for unknown runs.
    pub fn verify_event_chain(&self, run_id: RunId) -> LedgerResult<ChainReport> {
        self.load_run(run_id)?;
        Ok(verify_chain(self.store, run_id)?)
    }

    pub(crate) fn load_run(&self, run_id: RunId) -> LedgerResult<ReconciliationRun> {
        self.store
            .get_run(run_id)?
            .ok_or_else(|| LedgerError::not_found(format!("run {run_id}")))
    }

    fn validate_start(&self, request: &StartRequest) -> LedgerResult<()> {
        ensure_non_empty("root_directory", &request.root_directory)?;
        match (request.mode, request.delta_baseline.as_ref()) {
            (RunMode::Delta, None) => {
                return Err(LedgerError::validation("delta mode requires a delta baseline"));
            }
            (RunMode::Delta, Some(baseline)) if baseline.is_empty() => {
                return Err(LedgerError::validation(
                    "delta baseline needs a run id or a commit hash",
                ));
            }
            (RunMode::FullScan, Some(_)) => {
                return Err(LedgerError::validation(
                    "a delta baseline is only valid in delta mode",
                ));
            }
            _ => {}
        }
        if request.options.quality_threshold > MAX_SCORE {
            return Err(LedgerError::Validation(format!(
                "quality_threshold {} must be within 0..={MAX_SCORE}",
                request.options.quality_threshold
            )));
        }
        if request.options.max_tests == Some(0) {
            return Err(LedgerError::validation("max_tests must be positive"));
        }
        PathFilter::new(&request.options.include_paths, &request.options.exclude_paths)?;
        if self.settings.budget_tiers.is_empty() {
            return Err(LedgerError::validation("no budget tiers configured"));
        }
        Ok(())
    }

    fn resolve_baseline(&self, request: &StartRequest) -> LedgerResult<Option<RunId>> {
        let Some(baseline) = request.delta_baseline.as_ref() else {
            return Ok(None);
        };
        if let Some(run_id) = baseline.run_id {
            let run = self
                .store
                .get_run(run_id)?
                .ok_or_else(|| LedgerError::not_found(format!("baseline run {run_id}")))?;
            return Ok(Some(run.run_id));
        }
        let commit = baseline.commit_hash.as_deref().unwrap_or_default().trim();
        let run = self
            .store
            .latest_completed_run_for_commit(commit)?
            .ok_or_else(|| {
                LedgerError::not_found(format!("no completed run for baseline commit {commit}"))
            })?;
        Ok(Some(run.run_id))
    }

    pub(crate) fn transition(
        &self,
        run: &mut ReconciliationRun,
        next: RunStatus,
        log: &mut RunLog<'_>,
        event_type: RunEventType,
        payload: Value,
    ) -> LedgerResult<()> {
        if !run.status.can_transition_to(next) {
            return Err(LedgerError::InvalidState(format!(
                "run {} cannot move from {} to {}",
                run.run_id,
                run.status.as_str(),
                next.as_str()
            )));
        }
        let previous = run.status;
        run.status = next;
        if next.is_terminal() {
            run.completed_at = Some(now_utc());
        }
        self.store.update_run(run)?;
        log.emit(event_type, ORCHESTRATOR_ACTOR, payload)?;
        tracing::info!(
            run_id = %run.run_id,
            from = previous.as_str(),
            to = next.as_str(),
            "run transitioned"
        );
        Ok(())
    }

    fn load_and_execute(
        &self,
        run: &mut ReconciliationRun,
        log: &mut RunLog<'_>,
    ) -> LedgerResult<RunResult> {
        let inventory = match self
            .evidence
            .inventory(&run.root_directory, run.commit_hash.as_deref())
        {
            Ok(inventory) => inventory,
            Err(err) => {
                let err = LedgerError::Storage(err.context("evidence inventory unavailable"));
                return self.fail_run(run, log, &err, None);
            }
        };
        self.execute(run, &inventory, log)
    }

    fn execute(
        &self,
        run: &mut ReconciliationRun,
        inventory: &EvidenceInventory,
        log: &mut RunLog<'_>,
    ) -> LedgerResult<RunResult> {
        if run.commit_hash.is_none() {
            run.commit_hash.clone_from(&inventory.commit_hash);
        }
        log.emit(
            RunEventType::EvidenceLoaded,
            ORCHESTRATOR_ACTOR,
            json!({
                "commit_hash": run.commit_hash,
                "tests": inventory.tests.len(),
                "files": inventory.files.len(),
                "docs": inventory.docs.len(),
            }),
        )?;

        let filter = PathFilter::new(&run.options.include_paths, &run.options.exclude_paths)?;
        let baseline_records = match run.baseline_run_id {
            Some(baseline_run_id) => self.store.list_test_records(baseline_run_id)?,
            None => Vec::new(),
        };
        let plan = plan_closure(
            run.mode,
            inventory,
            &baseline_records,
            &filter,
            run.options.max_tests,
        );
        plan.apply_to_summary(&mut run.summary);
        run.summary.inference_failures = 0;
        run.summary.grounding_violations = 0;

        let existing: BTreeMap<String, TestRecord> = self
            .store
            .list_test_records(run.run_id)?
            .into_iter()
            .map(|record| (record.key(), record))
            .collect();
        let mut records: BTreeMap<String, TestRecord> = BTreeMap::new();
        let mut fresh_records = Vec::new();
        for planned in &plan.tests {
            let key = planned.key();
            if let Some(record) = existing.get(&key) {
                records.insert(key, record.clone());
            } else if let Some(record) = planned.to_record(run.run_id) {
                fresh_records.push(record.clone());
                records.insert(key, record);
            }
        }
        {
            let snapshot: &ReconciliationRun = run;
            self.store.in_transaction(&mut || {
                for record in &fresh_records {
                    self.store.insert_test_record(record)?;
                }
                self.store.update_run(snapshot)
            })?;
        }
        log.emit(
            RunEventType::ClosureEvaluated,
            ORCHESTRATOR_ACTOR,
            json!({
                "total_tests": run.summary.total_tests,
                "total_orphan_tests": run.summary.total_orphan_tests,
                "linked_tests": run.summary.linked_tests,
                "filtered_out": run.summary.filtered_out,
                "skipped_closed": run.summary.skipped_closed,
                "reprocessed_changed": run.summary.reprocessed_changed,
                "analyzed_new": run.summary.analyzed_new,
                "deferred": run.summary.deferred,
            }),
        )?;

        let items: Vec<WorkItem> = plan
            .to_analyze()
            .filter(|planned| {
                records.get(&planned.key()).is_some_and(|record| {
                    record.status == TestRecordStatus::Pending
                        && record.recommendation_temp_id.is_none()
                })
            })
            .map(|planned| WorkItem {
                key: planned.key(),
                request: inference_request(run, inventory, planned.evidence, &planned.content_hash),
            })
            .collect();

        let tier = select_tier(&self.settings.budget_tiers, plan.analyze_count())
            .cloned()
            .ok_or_else(|| LedgerError::validation("no budget tiers configured"))?;
        tracing::info!(
            run_id = %run.run_id,
            tier = %tier.name,
            dispatched = items.len(),
            "inference stage starting"
        );
        let enforcer = BudgetEnforcer::new(tier);
        let cancel = AtomicBool::new(false);
        let mut progress = InferenceProgress {
            atom_count: self.store.list_atom_recommendations(run.run_id)?.len(),
            ..InferenceProgress::default()
        };

        run_pool(
            self.capability,
            &enforcer,
            &cancel,
            self.settings.max_concurrency,
            items,
            &mut |result| {
                self.absorb_result(run, &mut records, inventory, &mut progress, log, &cancel, result)
            },
        )?;

        if progress.externally_failed {
            tracing::warn!(run_id = %run.run_id, "run was failed externally; in-flight results discarded");
            let stored = self.load_run(run.run_id)?;
            return Ok(result_for(&stored, None));
        }

        run.summary.budget = Some(enforcer.report());
        log.emit(
            RunEventType::InferenceFinished,
            ORCHESTRATOR_ACTOR,
            json!({
                "atoms": progress.atom_count,
                "inference_failures": run.summary.inference_failures,
                "grounding_violations": run.summary.grounding_violations,
                "budget_ratio": enforcer.report().ratio,
            }),
        )?;

        if let Some(message) = progress.bound_violation.take() {
            return self.fail_run(run, log, &LedgerError::OutputBoundExceeded(message), Some(&enforcer));
        }
        if let Some(message) = progress.hard_violation.take() {
            return self.fail_run(run, log, &LedgerError::BudgetExceeded(message), Some(&enforcer));
        }

        if let Some(err) = self.group_molecules(run, &enforcer, log)? {
            return self.fail_run(run, log, &err, Some(&enforcer));
        }
        run.summary.budget = Some(enforcer.report());

        self.quality_gate(run, inventory, log)
    }

    #[allow(clippy::too_many_arguments)]
    fn absorb_result(
        &self,
        run: &mut ReconciliationRun,
        records: &mut BTreeMap<String, TestRecord>,
        inventory: &EvidenceInventory,
        progress: &mut InferenceProgress,
        log: &mut RunLog<'_>,
        cancel: &AtomicBool,
        result: WorkResult,
    ) -> anyhow::Result<()> {
        if progress.halted() {
            return Ok(());
        }
        let current = self.store.get_run(run.run_id)?.map(|stored| stored.status);
        if current != Some(RunStatus::Running) {
            progress.externally_failed = true;
            cancel.store(true, Ordering::SeqCst);
            return Ok(());
        }

        match result {
            WorkResult::Cancelled { key } => {
                self.defer(run, records, &key, "cancelled after budget violation")?;
            }
            WorkResult::Refused { key, reason } => {
                self.defer(run, records, &key, &reason)?;
            }
            WorkResult::Completed {
                key,
                result,
                budget,
            } => {
                self.absorb_budget(run, progress, log, &budget)?;
                match result {
                    Ok(output) => {
                        self.persist_candidates(run, records, inventory, progress, cancel, &key, output)?;
                    }
                    Err(err) => {
                        run.summary.inference_failures += 1;
                        tracing::warn!(run_id = %run.run_id, test = %key, error = %err, "inference call failed");
                        run.errors.push(RunErrorEntry::new(
                            "inference_failed",
                            format!("{err:#}"),
                            Some(key),
                        ));
                        self.store.update_run(run)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn absorb_budget(
        &self,
        run: &mut ReconciliationRun,
        progress: &mut InferenceProgress,
        log: &mut RunLog<'_>,
        budget: &BudgetOutcome,
    ) -> anyhow::Result<()> {
        if let Some(warning) = &budget.warning {
            run.errors
                .push(RunErrorEntry::new("budget_warning", warning.clone(), None));
            log.emit(
                RunEventType::BudgetWarning,
                ORCHESTRATOR_ACTOR,
                json!({ "message": warning, "ratio": budget.ratio }),
            )?;
        }
        if let Some(violation) = &budget.violation {
            if progress.hard_violation.is_none() {
                progress.hard_violation = Some(violation.clone());
            }
        }
        Ok(())
    }

    fn defer(
        &self,
        run: &mut ReconciliationRun,
        records: &mut BTreeMap<String, TestRecord>,
        key: &str,
        reason: &str,
    ) -> anyhow::Result<()> {
        let record = records
            .get_mut(key)
            .ok_or_else(|| anyhow!("no test record for {key}"))?;
        record.deferred = true;
        record.closure_reason = Some(reason.to_string());
        run.summary.deferred += 1;
        tracing::debug!(run_id = %run.run_id, test = %key, reason, "test deferred");
        let record: &TestRecord = record;
        let snapshot: &ReconciliationRun = run;
        self.store.in_transaction(&mut || {
            self.store.update_test_record(record)?;
            self.store.update_run(snapshot)
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn persist_candidates(
        &self,
        run: &mut ReconciliationRun,
        records: &mut BTreeMap<String, TestRecord>,
        inventory: &EvidenceInventory,
        progress: &mut InferenceProgress,
        cancel: &AtomicBool,
        key: &str,
        output: AtomInferenceOutput,
    ) -> anyhow::Result<()> {
        let record = records
            .get_mut(key)
            .ok_or_else(|| anyhow!("no test record for {key}"))?;

        let mut grounded = Vec::new();
        for candidate in &output.atoms {
            match ground_candidate(candidate, inventory, key) {
                Ok(atom) => {
                    if !atom.dropped_docs.is_empty() {
                        tracing::debug!(test = %key, dropped = ?atom.dropped_docs, "dropped unknown related docs");
                    }
                    grounded.push(atom);
                }
                Err(err) => {
                    if matches!(err, LedgerError::GroundingViolation(_)) {
                        run.summary.grounding_violations += 1;
                    }
                    tracing::warn!(run_id = %run.run_id, test = %key, error = %err, "candidate dropped");
                    run.errors
                        .push(RunErrorEntry::from_error(&err, Some(key.to_string())));
                }
            }
        }

        if progress.atom_count + grounded.len() > self.settings.max_atom_recommendations {
            progress.bound_violation = Some(format!(
                "run produced more than {} atom recommendations",
                self.settings.max_atom_recommendations
            ));
            cancel.store(true, Ordering::SeqCst);
            return Ok(());
        }

        let created_at = now_utc();
        let recommendations: Vec<AtomRecommendation> = grounded
            .into_iter()
            .enumerate()
            .map(|(index, atom)| AtomRecommendation {
                run_id: run.run_id,
                temp_id: atom_temp_id(&record.file_path, &record.test_name, index),
                description: atom.candidate.description,
                category: atom.candidate.category,
                confidence: atom.confidence,
                reasoning: atom.candidate.reasoning,
                source_test: atom.candidate.source_test,
                observable_outcomes: atom.candidate.observable_outcomes,
                related_docs: atom.candidate.related_docs,
                ambiguity_reasons: atom.candidate.ambiguity_reasons,
                quality_score: None,
                quality_issues: Vec::new(),
                status: RecommendationStatus::Pending,
                rejection_reason: None,
                atom_id: None,
                created_at,
            })
            .collect();

        record.deferred = false;
        match recommendations.first() {
            Some(first) => record.recommendation_temp_id = Some(first.temp_id.clone()),
            None => {
                record.status = TestRecordStatus::Rejected;
                record.closure_reason = Some("no_grounded_candidates".to_string());
            }
        }

        let record: &TestRecord = record;
        let snapshot: &ReconciliationRun = run;
        self.store.in_transaction(&mut || {
            for recommendation in &recommendations {
                self.store.insert_atom_recommendation(recommendation)?;
            }
            self.store.update_test_record(record)?;
            self.store.update_run(snapshot)
        })?;
        progress.atom_count += recommendations.len();
        Ok(())
    }

    /// Ask for molecule groupings once per run. Returns the error that should
    /// fail the run, if any.
    fn group_molecules(
        &self,
        run: &mut ReconciliationRun,
        enforcer: &BudgetEnforcer,
        log: &mut RunLog<'_>,
    ) -> LedgerResult<Option<LedgerError>> {
        if !self
            .store
            .list_molecule_recommendations(run.run_id)?
            .is_empty()
        {
            return Ok(None);
        }
        let atoms: Vec<AtomRecommendation> = self
            .store
            .list_atom_recommendations(run.run_id)?
            .into_iter()
            .filter(|atom| atom.status != RecommendationStatus::Rejected)
            .collect();
        if atoms.len() < 2 {
            return Ok(None);
        }

        if let Admission::Refused(reason) = enforcer.admit(BudgetStage::GroupMolecules) {
            tracing::warn!(run_id = %run.run_id, reason = %reason, "grouping skipped");
            run.errors
                .push(RunErrorEntry::new("grouping_deferred", reason, None));
            self.store.update_run(run)?;
            return Ok(None);
        }

        let request = GroupingRequest {
            run_id: run.run_id,
            atoms: atoms
                .iter()
                .map(|atom| GroupingAtom {
                    temp_id: atom.temp_id.clone(),
                    description: atom.description.clone(),
                    category: atom.category.clone(),
                    source_test: atom.source_test.clone(),
                })
                .collect(),
        };
        let started = Instant::now();
        let response = self.capability.group_atoms(&request);
        let elapsed = started.elapsed();

        let output = match response {
            Ok(output) => output,
            Err(err) => {
                enforcer.record(BudgetStage::GroupMolecules, 0, elapsed);
                tracing::warn!(run_id = %run.run_id, error = %err, "grouping call failed");
                run.errors
                    .push(RunErrorEntry::new("grouping_failed", format!("{err:#}"), None));
                self.store.update_run(run)?;
                return Ok(None);
            }
        };
        let budget = enforcer.record(
            BudgetStage::GroupMolecules,
            output.usage.total_tokens(),
            output.usage.latency().max(elapsed),
        );
        let mut progress = InferenceProgress::default();
        self.absorb_budget(run, &mut progress, log, &budget)?;

        let known: BTreeSet<String> = atoms.iter().map(|atom| atom.temp_id.clone()).collect();
        let created_at = now_utc();
        let mut molecules: BTreeMap<String, MoleculeRecommendation> = BTreeMap::new();
        for candidate in &output.molecules {
            match validate_molecule(candidate, &known) {
                Ok((members, confidence)) => {
                    let temp_id = molecule_temp_id(&candidate.name, &members);
                    molecules
                        .entry(temp_id.clone())
                        .or_insert_with(|| MoleculeRecommendation {
                            run_id: run.run_id,
                            temp_id,
                            name: candidate.name.trim().to_string(),
                            description: candidate.description.clone(),
                            atom_temp_ids: members,
                            confidence,
                            reasoning: candidate.reasoning.clone(),
                            quality_score: None,
                            status: RecommendationStatus::Pending,
                            rejection_reason: None,
                            molecule_id: None,
                            created_at,
                        });
                }
                Err(err) => {
                    tracing::warn!(run_id = %run.run_id, molecule = %candidate.name, error = %err, "molecule dropped");
                    run.errors.push(RunErrorEntry::from_error(&err, None));
                }
            }
        }

        if molecules.len() > self.settings.max_molecule_recommendations {
            return Ok(Some(LedgerError::OutputBoundExceeded(format!(
                "run produced {} molecule recommendations, limit is {}",
                molecules.len(),
                self.settings.max_molecule_recommendations
            ))));
        }

        {
            let snapshot: &ReconciliationRun = run;
            self.store.in_transaction(&mut || {
                for molecule in molecules.values() {
                    self.store.insert_molecule_recommendation(molecule)?;
                }
                self.store.update_run(snapshot)
            })?;
        }
        log.emit(
            RunEventType::GroupingFinished,
            ORCHESTRATOR_ACTOR,
            json!({ "molecules": molecules.len(), "proposed": output.molecules.len() }),
        )?;

        Ok(progress.hard_violation.map(LedgerError::BudgetExceeded))
    }

    fn quality_gate(
        &self,
        run: &mut ReconciliationRun,
        inventory: &EvidenceInventory,
        log: &mut RunLog<'_>,
    ) -> LedgerResult<RunResult> {
        let mut atoms = self.store.list_atom_recommendations(run.run_id)?;
        let mut molecules = self.store.list_molecule_recommendations(run.run_id)?;

        for atom in atoms
            .iter_mut()
            .filter(|atom| atom.status == RecommendationStatus::Pending)
        {
            let assessment = self.scorer.score_atom(atom, inventory);
            atom.quality_score = Some(assessment.score);
            atom.quality_issues = assessment.issues;
        }
        let scores: BTreeMap<&str, u8> = atoms
            .iter()
            .filter_map(|atom| atom.quality_score.map(|score| (atom.temp_id.as_str(), score)))
            .collect();
        for molecule in molecules
            .iter_mut()
            .filter(|molecule| molecule.status == RecommendationStatus::Pending)
        {
            let member_scores: Vec<u8> = molecule
                .atom_temp_ids
                .iter()
                .filter_map(|member| scores.get(member.as_str()).copied())
                .collect();
            molecule.quality_score = Some(self.scorer.score_molecule(molecule, &member_scores));
        }
        self.store.in_transaction(&mut || {
            for atom in atoms
                .iter()
                .filter(|atom| atom.status == RecommendationStatus::Pending)
            {
                self.store.update_atom_recommendation(atom)?;
            }
            for molecule in molecules
                .iter()
                .filter(|molecule| molecule.status == RecommendationStatus::Pending)
            {
                self.store.update_molecule_recommendation(molecule)?;
            }
            Ok(())
        })?;

        let threshold = run.options.quality_threshold;
        let (pass_count, fail_count) = count_passing(&atoms, &molecules, threshold);
        let policy = GatePolicy {
            threshold,
            require_review: run.options.require_review,
            force_interrupt_on_quality_fail: run.options.force_interrupt_on_quality_fail,
        };
        let decision = evaluate_gate(&policy, pass_count, fail_count);
        log.emit(
            RunEventType::QualityGateEvaluated,
            ORCHESTRATOR_ACTOR,
            json!({
                "scorer": self.scorer.name(),
                "threshold": threshold,
                "pass_count": pass_count,
                "fail_count": fail_count,
                "interrupt": matches!(decision, GateDecision::Interrupt { .. }),
            }),
        )?;

        match decision {
            GateDecision::Interrupt { reason } => {
                self.request_review(run, log, &atoms, &molecules, &reason)
            }
            GateDecision::AutoFinalize => {
                self.atomically(|| {
                    self.auto_finalize(run, &atoms, &molecules)?;
                    self.complete(run, log)
                })
            }
        }
    }

    pub(crate) fn request_review(
        &self,
        run: &mut ReconciliationRun,
        log: &mut RunLog<'_>,
        atoms: &[AtomRecommendation],
        molecules: &[MoleculeRecommendation],
        reason: &str,
    ) -> LedgerResult<RunResult> {
        let pending = build_pending_review(atoms, molecules, run.options.quality_threshold, reason);
        self.refresh_counts(run)?;
        self.transition(
            run,
            RunStatus::WaitingForReview,
            log,
            RunEventType::ReviewRequested,
            json!({
                "reason": reason,
                "pending_atoms": pending.pending_atoms.len(),
                "pending_molecules": pending.pending_molecules.len(),
                "pass_count": pending.summary.pass_count,
                "fail_count": pending.summary.fail_count,
            }),
        )?;
        Ok(result_for(run, Some(pending)))
    }

    pub(crate) fn complete(
        &self,
        run: &mut ReconciliationRun,
        log: &mut RunLog<'_>,
    ) -> LedgerResult<RunResult> {
        self.refresh_counts(run)?;
        if run.options.detect_conflicts || self.settings.detect_conflicts_on_completion {
            let service = ConflictService::new(self.store, self.settings.semantic_overlap_threshold);
            match service.scan() {
                Ok(report) => {
                    tracing::info!(
                        run_id = %run.run_id,
                        created = report.created,
                        duplicates = report.duplicates,
                        "conflict scan finished"
                    );
                }
                Err(err) => run.errors.push(RunErrorEntry::from_error(&err, None)),
            }
        }
        self.transition(
            run,
            RunStatus::Completed,
            log,
            RunEventType::RunCompleted,
            json!({
                "atoms_accepted": run.summary.atoms_accepted,
                "atoms_rejected": run.summary.atoms_rejected,
                "molecules_accepted": run.summary.molecules_accepted,
                "molecules_rejected": run.summary.molecules_rejected,
                "errors": run.errors.len(),
            }),
        )?;
        Ok(result_for(run, None))
    }

    fn fail_run(
        &self,
        run: &mut ReconciliationRun,
        log: &mut RunLog<'_>,
        err: &LedgerError,
        enforcer: Option<&BudgetEnforcer>,
    ) -> LedgerResult<RunResult> {
        tracing::warn!(run_id = %run.run_id, code = err.code(), error = %err, "run failed");
        run.errors.push(RunErrorEntry::from_error(err, None));
        run.error_message = Some(err.to_string());
        if let Some(enforcer) = enforcer {
            run.summary.budget = Some(enforcer.report());
        }
        self.refresh_counts(run)?;
        self.transition(
            run,
            RunStatus::Failed,
            log,
            RunEventType::RunFailed,
            json!({ "code": err.code(), "message": err.to_string() }),
        )?;
        Ok(result_for(run, None))
    }

    /// Recompute the recommendation counters from what is stored.
    pub(crate) fn refresh_counts(&self, run: &mut ReconciliationRun) -> LedgerResult<()> {
        let atoms = self.store.list_atom_recommendations(run.run_id)?;
        let molecules = self.store.list_molecule_recommendations(run.run_id)?;
        let records = self.store.list_test_records(run.run_id)?;
        let summary = &mut run.summary;
        summary.atoms_proposed = atoms.len();
        summary.atoms_accepted = count_status(atoms.iter().map(|atom| atom.status), RecommendationStatus::Accepted);
        summary.atoms_rejected = count_status(atoms.iter().map(|atom| atom.status), RecommendationStatus::Rejected);
        summary.molecules_proposed = molecules.len();
        summary.molecules_accepted = count_status(
            molecules.iter().map(|molecule| molecule.status),
            RecommendationStatus::Accepted,
        );
        summary.molecules_rejected = count_status(
            molecules.iter().map(|molecule| molecule.status),
            RecommendationStatus::Rejected,
        );
        summary.deferred = records
            .iter()
            .filter(|record| record.deferred && record.status == TestRecordStatus::Pending)
            .count();
        Ok(())
    }

    pub(crate) fn pending_review_for(
        &self,
        run: &ReconciliationRun,
    ) -> LedgerResult<Option<PendingReview>> {
        if run.status != RunStatus::WaitingForReview {
            return Ok(None);
        }
        let reason = self
            .store
            .list_events_for_run(run.run_id)?
            .iter()
            .rev()
            .find(|row| row.event.event_type == RunEventType::ReviewRequested)
            .and_then(|row| row.event.payload_json.get("reason"))
            .and_then(Value::as_str)
            .unwrap_or("awaiting review")
            .to_string();
        let atoms = self.store.list_atom_recommendations(run.run_id)?;
        let molecules = self.store.list_molecule_recommendations(run.run_id)?;
        Ok(Some(build_pending_review(
            &atoms,
            &molecules,
            run.options.quality_threshold,
            &reason,
        )))
    }

    /// Run `work` inside one store transaction, keeping its typed error.
    pub(crate) fn atomically<T>(
        &self,
        mut work: impl FnMut() -> LedgerResult<T>,
    ) -> LedgerResult<T> {
        let mut output = None;
        let outcome = self.store.in_transaction(&mut || {
            output = Some(work().map_err(anyhow::Error::from)?);
            Ok(())
        });
        match outcome {
            Ok(()) => output.ok_or_else(|| LedgerError::Storage(anyhow!("transaction produced no result"))),
            Err(err) => Err(err
                .downcast::<LedgerError>()
                .unwrap_or_else(LedgerError::Storage)),
        }
    }
}

pub(crate) fn result_for(run: &ReconciliationRun, pending_review: Option<PendingReview>) -> RunResult {
    RunResult {
        run_id: run.run_id,
        status: run.status,
        summary: run.summary.clone(),
        pending_review,
        error_message: run.error_message.clone(),
    }
}

fn count_status(
    statuses: impl Iterator<Item = RecommendationStatus>,
    wanted: RecommendationStatus,
) -> usize {
    statuses.filter(|status| *status == wanted).count()
}

fn inference_request(
    run: &ReconciliationRun,
    inventory: &EvidenceInventory,
    evidence: &TestEvidence,
    content_hash: &str,
) -> AtomInferenceRequest {
    let dir = parent_dir(&evidence.file_path);
    let mut test = evidence.clone();
    test.content_hash = Some(content_hash.to_string());
    AtomInferenceRequest {
        run_id: run.run_id,
        commit_hash: run.commit_hash.clone(),
        related_docs: inventory.related_docs_for(&evidence.file_path),
        exports: inventory
            .exports
            .iter()
            .filter(|export| parent_dir(&export.file_path) == dir)
            .cloned()
            .collect(),
        coverage_gaps: inventory
            .coverage_gaps
            .iter()
            .filter(|gap| parent_dir(&gap.file_path) == dir)
            .cloned()
            .collect(),
        test,
    }
}

fn parent_dir(path: &str) -> &str {
    path.rsplit_once('/').map_or("", |(dir, _)| dir)
}
