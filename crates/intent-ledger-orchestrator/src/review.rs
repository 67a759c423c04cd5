//! Review interrupts, decision application and auto-finalization.

use std::collections::{BTreeMap, BTreeSet};

use intent_ledger_domain::{
    atom_temp_id, ensure_non_empty, hash_json, now_utc, Atom, AtomId, AtomRecommendation,
    AtomStatus, Decision, LedgerError, LedgerResult, Molecule, MoleculeId,
    MoleculeRecommendation, PatchOp, PendingAtom, PendingMolecule, PendingReview,
    ReconciliationRun, RecommendationDecision, RecommendationStatus, ReviewSubmission,
    ReviewSummary, RunEventType, RunId, RunResult, RunStatus, TestRecordStatus,
};
use intent_ledger_policy::{auto_rejection_reason, ensure_acceptable, passes_threshold};
use serde_json::json;

use crate::events::EventLog;
use crate::run::RunOrchestrator;

pub const REVIEWER_ACTOR: &str = "reviewer";
const UNDECIDED_REASON: &str = "undecided recommendations remain";

/// Identity of a submission: the hash of its decisions. The comment does not
/// participate, so a retried request with a reworded comment is still a retry.
///
/// # Errors
/// Returns an error when the decisions cannot be serialized.
pub fn review_fingerprint(submission: &ReviewSubmission) -> anyhow::Result<String> {
    hash_json(&json!({
        "atom_decisions": submission.atom_decisions,
        "molecule_decisions": submission.molecule_decisions,
    }))
}

/// Pass and fail counts over the still-pending recommendations.
pub(crate) fn count_passing(
    atoms: &[AtomRecommendation],
    molecules: &[MoleculeRecommendation],
    threshold: u8,
) -> (usize, usize) {
    let scores = atoms
        .iter()
        .filter(|atom| atom.status == RecommendationStatus::Pending)
        .map(|atom| atom.quality_score.unwrap_or(0))
        .chain(
            molecules
                .iter()
                .filter(|molecule| molecule.status == RecommendationStatus::Pending)
                .map(|molecule| molecule.quality_score.unwrap_or(0)),
        );
    scores.fold((0, 0), |(pass, fail), score| {
        if passes_threshold(score, threshold) {
            (pass + 1, fail)
        } else {
            (pass, fail + 1)
        }
    })
}

pub(crate) fn build_pending_review(
    atoms: &[AtomRecommendation],
    molecules: &[MoleculeRecommendation],
    threshold: u8,
    reason: &str,
) -> PendingReview {
    let pending_atoms: Vec<PendingAtom> = atoms
        .iter()
        .filter(|atom| atom.status == RecommendationStatus::Pending)
        .map(|atom| {
            let quality_score = atom.quality_score.unwrap_or(0);
            PendingAtom {
                temp_id: atom.temp_id.clone(),
                description: atom.description.clone(),
                source_test: atom.source_test.clone(),
                quality_score,
                passes: passes_threshold(quality_score, threshold),
                issues: atom.quality_issues.clone(),
            }
        })
        .collect();
    let pending_molecules: Vec<PendingMolecule> = molecules
        .iter()
        .filter(|molecule| molecule.status == RecommendationStatus::Pending)
        .map(|molecule| {
            let quality_score = molecule.quality_score.unwrap_or(0);
            PendingMolecule {
                temp_id: molecule.temp_id.clone(),
                name: molecule.name.clone(),
                atom_temp_ids: molecule.atom_temp_ids.clone(),
                quality_score,
                passes: passes_threshold(quality_score, threshold),
            }
        })
        .collect();
    let (pass_count, fail_count) = count_passing(atoms, molecules, threshold);
    PendingReview {
        summary: ReviewSummary {
            total_atoms: pending_atoms.len(),
            total_molecules: pending_molecules.len(),
            pass_count,
            fail_count,
            threshold,
        },
        pending_atoms,
        pending_molecules,
        reason: reason.to_string(),
    }
}

/// Decisions that still need applying, in submission order.
#[derive(Debug, Default)]
struct ReviewPlan {
    atoms: Vec<(AtomRecommendation, Decision)>,
    molecules: Vec<(MoleculeRecommendation, Decision)>,
    skipped: usize,
}

/// Resolve one decision list against the run's recommendations.
///
/// Returns the recommendations that still need the decision. Exact repeats and
/// decisions that match the stored status are skipped.
fn plan_decisions<'r, R>(
    kind: &str,
    decisions: &[RecommendationDecision],
    by_temp_id: &BTreeMap<&str, &'r R>,
    status_of: impl Fn(&R) -> RecommendationStatus,
    skipped: &mut usize,
) -> LedgerResult<Vec<(&'r R, Decision)>> {
    let mut seen: BTreeMap<&str, &Decision> = BTreeMap::new();
    let mut planned = Vec::new();
    for item in decisions {
        let temp_id = item.temp_id.as_str();
        let Some(recommendation) = by_temp_id.get(temp_id).copied() else {
            return Err(LedgerError::UnknownRecommendation(format!(
                "{kind} {temp_id} is not part of this run"
            )));
        };
        if let Some(previous) = seen.get(temp_id) {
            if previous.target_status() != item.decision.target_status() {
                return Err(LedgerError::Validation(format!(
                    "conflicting decisions for {kind} {temp_id}"
                )));
            }
            *skipped += 1;
            continue;
        }
        seen.insert(temp_id, &item.decision);

        let current = status_of(recommendation);
        if current == item.decision.target_status() {
            *skipped += 1;
            continue;
        }
        if current != RecommendationStatus::Pending {
            return Err(LedgerError::InvalidState(format!(
                "{kind} {temp_id} is already {}",
                current.as_str()
            )));
        }
        if let Decision::Reject { reason } = &item.decision {
            ensure_non_empty("reason", reason)?;
        }
        planned.push((recommendation, item.decision.clone()));
    }
    Ok(planned)
}

fn validate_review(
    atoms: &[AtomRecommendation],
    molecules: &[MoleculeRecommendation],
    submission: &ReviewSubmission,
) -> LedgerResult<ReviewPlan> {
    let mut skipped = 0;
    let atoms_by_id: BTreeMap<&str, &AtomRecommendation> = atoms
        .iter()
        .map(|atom| (atom.temp_id.as_str(), atom))
        .collect();
    let planned_atoms = plan_decisions(
        "atom recommendation",
        &submission.atom_decisions,
        &atoms_by_id,
        |atom| atom.status,
        &mut skipped,
    )?;
    for (atom, decision) in &planned_atoms {
        if matches!(decision, Decision::Approve { .. }) {
            ensure_acceptable(atom)?;
        }
    }

    let mut approved: BTreeSet<&str> = atoms
        .iter()
        .filter(|atom| atom.status == RecommendationStatus::Accepted)
        .map(|atom| atom.temp_id.as_str())
        .collect();
    approved.extend(
        planned_atoms
            .iter()
            .filter(|(_, decision)| matches!(decision, Decision::Approve { .. }))
            .map(|(atom, _)| atom.temp_id.as_str()),
    );

    let molecules_by_id: BTreeMap<&str, &MoleculeRecommendation> = molecules
        .iter()
        .map(|molecule| (molecule.temp_id.as_str(), molecule))
        .collect();
    let planned_molecules = plan_decisions(
        "molecule recommendation",
        &submission.molecule_decisions,
        &molecules_by_id,
        |molecule| molecule.status,
        &mut skipped,
    )?;
    for (molecule, decision) in &planned_molecules {
        if !matches!(decision, Decision::Approve { .. }) {
            continue;
        }
        if let Some(missing) = molecule
            .atom_temp_ids
            .iter()
            .find(|member| !approved.contains(member.as_str()))
        {
            return Err(LedgerError::Validation(format!(
                "molecule {} cannot be accepted: member {missing} is not accepted",
                molecule.temp_id
            )));
        }
    }

    Ok(ReviewPlan {
        atoms: planned_atoms
            .into_iter()
            .map(|(atom, decision)| (atom.clone(), decision))
            .collect(),
        molecules: planned_molecules
            .into_iter()
            .map(|(molecule, decision)| (molecule.clone(), decision))
            .collect(),
        skipped,
    })
}

fn accepted_atom_ids(atoms: &[AtomRecommendation]) -> BTreeMap<String, AtomId> {
    atoms
        .iter()
        .filter(|atom| atom.status == RecommendationStatus::Accepted)
        .filter_map(|atom| atom.atom_id.map(|atom_id| (atom.temp_id.clone(), atom_id)))
        .collect()
}

impl RunOrchestrator<'_> {
    /// Apply reviewer decisions to a run that is waiting for review.
    ///
    /// Submissions are idempotent: a repeated submission returns the result
    /// recorded the first time, whatever state the run is in now.
    ///
    /// # Errors
    /// - [`LedgerError::NotFound`] for unknown runs.
    /// - [`LedgerError::InvalidState`] when the run is not waiting for review.
    /// - [`LedgerError::UnknownRecommendation`] for ids outside the run.
    /// - [`LedgerError::Validation`] for decisions that cannot be applied.
    pub fn submit_review(
        &self,
        run_id: RunId,
        submission: &ReviewSubmission,
    ) -> LedgerResult<RunResult> {
        let mut run = self.load_run(run_id)?;
        let fingerprint = review_fingerprint(submission)?;
        if let Some(previous) = self.store.find_review_submission(run_id, &fingerprint)? {
            tracing::info!(run_id = %run_id, fingerprint = %fingerprint, "review already applied");
            return Ok(previous);
        }
        if run.status != RunStatus::WaitingForReview {
            return Err(LedgerError::InvalidState(format!(
                "run {run_id} is {}, not waiting for review",
                run.status.as_str()
            )));
        }

        let atoms = self.store.list_atom_recommendations(run_id)?;
        let molecules = self.store.list_molecule_recommendations(run_id)?;
        let plan = validate_review(&atoms, &molecules, submission)?;

        let mut log = EventLog::open(self.store, run_id)?;
        self.atomically(|| {
            self.transition(
                &mut run,
                RunStatus::Running,
                &mut log,
                RunEventType::RunResumed,
                json!({ "trigger": "review", "fingerprint": fingerprint }),
            )?;
            self.apply_review(&mut run, &plan)?;
            log.emit(
                RunEventType::ReviewApplied,
                REVIEWER_ACTOR,
                json!({
                    "fingerprint": fingerprint,
                    "atom_decisions": plan.atoms.len(),
                    "molecule_decisions": plan.molecules.len(),
                    "skipped": plan.skipped,
                    "comment": submission.comment,
                }),
            )?;

            let atoms = self.store.list_atom_recommendations(run_id)?;
            let molecules = self.store.list_molecule_recommendations(run_id)?;
            let undecided = atoms
                .iter()
                .any(|atom| atom.status == RecommendationStatus::Pending)
                || molecules
                    .iter()
                    .any(|molecule| molecule.status == RecommendationStatus::Pending);
            let result = if undecided {
                self.request_review(&mut run, &mut log, &atoms, &molecules, UNDECIDED_REASON)?
            } else {
                self.complete(&mut run, &mut log)?
            };
            self.store
                .record_review_submission(run_id, &fingerprint, &result)?;
            Ok(result)
        })
    }

    fn apply_review(&self, run: &mut ReconciliationRun, plan: &ReviewPlan) -> LedgerResult<()> {
        for (atom, decision) in &plan.atoms {
            match decision {
                Decision::Approve { .. } => {
                    self.accept_atom(run, atom)?;
                }
                Decision::Reject { reason } => self.reject_atom(run, atom, reason.trim())?,
            }
        }
        if !plan.molecules.is_empty() {
            let atom_ids = accepted_atom_ids(&self.store.list_atom_recommendations(run.run_id)?);
            for (molecule, decision) in &plan.molecules {
                match decision {
                    Decision::Approve { .. } => self.accept_molecule(run, molecule, &atom_ids)?,
                    Decision::Reject { reason } => {
                        self.reject_molecule(run, molecule, reason.trim())?;
                    }
                }
            }
        }
        self.recompute_test_records(run.run_id)?;
        self.store.update_run(run)?;
        Ok(())
    }

    /// Accept passing recommendations and reject the rest.
    pub(crate) fn auto_finalize(
        &self,
        run: &mut ReconciliationRun,
        atoms: &[AtomRecommendation],
        molecules: &[MoleculeRecommendation],
    ) -> LedgerResult<()> {
        let threshold = run.options.quality_threshold;
        for atom in atoms
            .iter()
            .filter(|atom| atom.status == RecommendationStatus::Pending)
        {
            let score = atom.quality_score.unwrap_or(0);
            if !passes_threshold(score, threshold) {
                self.reject_atom(run, atom, &auto_rejection_reason(score, threshold))?;
            } else if atom.observable_outcomes.is_empty() {
                self.reject_atom(run, atom, "no observable outcomes")?;
            } else {
                self.accept_atom(run, atom)?;
            }
        }

        let atom_ids = accepted_atom_ids(&self.store.list_atom_recommendations(run.run_id)?);
        for molecule in molecules
            .iter()
            .filter(|molecule| molecule.status == RecommendationStatus::Pending)
        {
            let score = molecule.quality_score.unwrap_or(0);
            if !passes_threshold(score, threshold) {
                self.reject_molecule(run, molecule, &auto_rejection_reason(score, threshold))?;
            } else if molecule
                .atom_temp_ids
                .iter()
                .all(|member| atom_ids.contains_key(member))
            {
                self.accept_molecule(run, molecule, &atom_ids)?;
            } else {
                self.reject_molecule(run, molecule, "member atoms were not accepted")?;
            }
        }

        self.recompute_test_records(run.run_id)?;
        self.store.update_run(run)?;
        Ok(())
    }

    fn accept_atom(
        &self,
        run: &mut ReconciliationRun,
        recommendation: &AtomRecommendation,
    ) -> LedgerResult<AtomId> {
        ensure_acceptable(recommendation)?;
        let atom = Atom {
            atom_id: AtomId::new(),
            description: recommendation.description.clone(),
            category: recommendation.category.clone(),
            source_test: recommendation.source_test.clone(),
            status: AtomStatus::Committed,
            superseded_by: None,
            created_from_run_id: Some(run.run_id),
            created_at: now_utc(),
        };
        self.store.insert_atom(&atom)?;

        let mut accepted = recommendation.clone();
        accepted.status = RecommendationStatus::Accepted;
        accepted.rejection_reason = None;
        accepted.atom_id = Some(atom.atom_id);
        self.store.update_atom_recommendation(&accepted)?;

        run.patch_ops.push(PatchOp::CreateAtom {
            temp_id: recommendation.temp_id.clone(),
            atom_id: atom.atom_id,
        });
        tracing::debug!(run_id = %run.run_id, temp_id = %recommendation.temp_id, atom_id = %atom.atom_id, "atom accepted");
        Ok(atom.atom_id)
    }

    fn reject_atom(
        &self,
        run: &mut ReconciliationRun,
        recommendation: &AtomRecommendation,
        reason: &str,
    ) -> LedgerResult<()> {
        let mut rejected = recommendation.clone();
        rejected.status = RecommendationStatus::Rejected;
        rejected.rejection_reason = Some(reason.to_string());
        self.store.update_atom_recommendation(&rejected)?;
        run.patch_ops.push(PatchOp::RejectAtom {
            temp_id: recommendation.temp_id.clone(),
            reason: reason.to_string(),
        });
        Ok(())
    }

    fn accept_molecule(
        &self,
        run: &mut ReconciliationRun,
        recommendation: &MoleculeRecommendation,
        atom_ids: &BTreeMap<String, AtomId>,
    ) -> LedgerResult<()> {
        let members = recommendation
            .atom_temp_ids
            .iter()
            .map(|member| {
                atom_ids.get(member).copied().ok_or_else(|| {
                    LedgerError::invalid_state(format!(
                        "molecule {} member {member} has no accepted atom",
                        recommendation.temp_id
                    ))
                })
            })
            .collect::<LedgerResult<Vec<AtomId>>>()?;
        let molecule = Molecule {
            molecule_id: MoleculeId::new(),
            name: recommendation.name.clone(),
            description: recommendation.description.clone(),
            atom_ids: members,
            created_from_run_id: Some(run.run_id),
            created_at: now_utc(),
        };
        self.store.insert_molecule(&molecule)?;

        let mut accepted = recommendation.clone();
        accepted.status = RecommendationStatus::Accepted;
        accepted.rejection_reason = None;
        accepted.molecule_id = Some(molecule.molecule_id);
        self.store.update_molecule_recommendation(&accepted)?;

        run.patch_ops.push(PatchOp::CreateMolecule {
            temp_id: recommendation.temp_id.clone(),
            molecule_id: molecule.molecule_id,
        });
        Ok(())
    }

    fn reject_molecule(
        &self,
        run: &mut ReconciliationRun,
        recommendation: &MoleculeRecommendation,
        reason: &str,
    ) -> LedgerResult<()> {
        let mut rejected = recommendation.clone();
        rejected.status = RecommendationStatus::Rejected;
        rejected.rejection_reason = Some(reason.to_string());
        self.store.update_molecule_recommendation(&rejected)?;
        run.patch_ops.push(PatchOp::RejectMolecule {
            temp_id: recommendation.temp_id.clone(),
            reason: reason.to_string(),
        });
        Ok(())
    }

    /// Close test records whose recommendations are all decided.
    fn recompute_test_records(&self, run_id: RunId) -> LedgerResult<()> {
        let atoms = self.store.list_atom_recommendations(run_id)?;
        let by_temp_id: BTreeMap<&str, RecommendationStatus> = atoms
            .iter()
            .map(|atom| (atom.temp_id.as_str(), atom.status))
            .collect();

        for mut record in self.store.list_test_records(run_id)? {
            if record.status != TestRecordStatus::Pending || record.recommendation_temp_id.is_none() {
                continue;
            }
            let statuses: Vec<RecommendationStatus> = (0..)
                .map(|index| atom_temp_id(&record.file_path, &record.test_name, index))
                .map_while(|temp_id| by_temp_id.get(temp_id.as_str()).copied())
                .collect();
            if statuses.contains(&RecommendationStatus::Accepted) {
                record.status = TestRecordStatus::Accepted;
                record.closure_reason = Some("recommendation_accepted".to_string());
            } else if !statuses.is_empty()
                && statuses
                    .iter()
                    .all(|status| *status == RecommendationStatus::Rejected)
            {
                record.status = TestRecordStatus::Rejected;
                record.closure_reason = Some("recommendations_rejected".to_string());
            } else {
                continue;
            }
            self.store.update_test_record(&record)?;
        }
        Ok(())
    }
}
