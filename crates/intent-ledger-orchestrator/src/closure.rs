//! Decides, per test, whether a run may skip it or must (re-)analyze it.

use std::collections::BTreeMap;

use intent_ledger_domain::{
    EvidenceInventory, RunId, RunMode, RunSummary, TestEvidence, TestRecord, TestRecordId,
    TestRecordStatus,
};

use crate::filter::PathFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosureDecision {
    /// Outside the run's path filters. A baseline closure for the same
    /// content is carried so later runs still see the test as closed.
    FilteredOut { carried: Option<TestRecordStatus> },
    /// Already linked to an atom through an annotation in the source.
    Linked,
    /// Closed in the baseline with the same content hash.
    SkipClosed { inherited: TestRecordStatus },
    /// Closed in the baseline but the body changed since.
    Reprocess,
    Analyze,
    /// Selected for analysis but beyond the run's `max_tests` cap.
    Deferred { changed: bool },
}

impl ClosureDecision {
    #[must_use]
    pub fn needs_inference(self) -> bool {
        matches!(self, Self::Reprocess | Self::Analyze)
    }
}

#[derive(Debug, Clone)]
pub struct PlannedTest<'e> {
    pub evidence: &'e TestEvidence,
    pub content_hash: String,
    pub decision: ClosureDecision,
}

impl PlannedTest<'_> {
    #[must_use]
    pub fn key(&self) -> String {
        self.evidence.key()
    }

    /// The record persisted for this test, or `None` when it was filtered out
    /// with no closure to carry.
    #[must_use]
    pub fn to_record(&self, run_id: RunId) -> Option<TestRecord> {
        let mut record = TestRecord {
            test_record_id: TestRecordId::new(),
            run_id,
            file_path: self.evidence.file_path.clone(),
            test_name: self.evidence.test_name.clone(),
            line_number: self.evidence.line_number,
            content_hash: self.content_hash.clone(),
            status: TestRecordStatus::Pending,
            inherited_status: None,
            recommendation_temp_id: None,
            has_atom_annotation: self.evidence.has_atom_annotation,
            changed_since_baseline: false,
            deferred: false,
            closure_reason: None,
        };
        match self.decision {
            ClosureDecision::FilteredOut { carried: None } => return None,
            ClosureDecision::FilteredOut {
                carried: Some(inherited),
            } => {
                record.status = TestRecordStatus::Skipped;
                record.inherited_status = Some(inherited);
                record.closure_reason = Some("filtered_closed_in_baseline".to_string());
            }
            ClosureDecision::Linked => {
                record.status = TestRecordStatus::Skipped;
                record.closure_reason = Some("linked_by_annotation".to_string());
            }
            ClosureDecision::SkipClosed { inherited } => {
                record.status = TestRecordStatus::Skipped;
                record.inherited_status = Some(inherited);
                record.closure_reason = Some("closed_in_baseline".to_string());
            }
            ClosureDecision::Reprocess => record.changed_since_baseline = true,
            ClosureDecision::Analyze => {}
            ClosureDecision::Deferred { changed } => {
                record.changed_since_baseline = changed;
                record.deferred = true;
                record.closure_reason = Some("max_tests_reached".to_string());
            }
        }
        Some(record)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ClosurePlan<'e> {
    pub tests: Vec<PlannedTest<'e>>,
}

impl<'e> ClosurePlan<'e> {
    pub fn to_analyze(&self) -> impl Iterator<Item = &PlannedTest<'e>> {
        self.tests
            .iter()
            .filter(|planned| planned.decision.needs_inference())
    }

    #[must_use]
    pub fn analyze_count(&self) -> usize {
        self.to_analyze().count()
    }

    /// Overwrite the closure counters of `summary`.
    pub fn apply_to_summary(&self, summary: &mut RunSummary) {
        summary.total_tests = self.tests.len();
        summary.filtered_out = 0;
        summary.linked_tests = 0;
        summary.total_orphan_tests = 0;
        summary.skipped_closed = 0;
        summary.reprocessed_changed = 0;
        summary.analyzed_new = 0;
        summary.deferred = 0;
        for planned in &self.tests {
            match planned.decision {
                ClosureDecision::FilteredOut { .. } => summary.filtered_out += 1,
                ClosureDecision::Linked => summary.linked_tests += 1,
                ClosureDecision::SkipClosed { .. } => summary.skipped_closed += 1,
                ClosureDecision::Reprocess => summary.reprocessed_changed += 1,
                ClosureDecision::Analyze => summary.analyzed_new += 1,
                ClosureDecision::Deferred { .. } => summary.deferred += 1,
            }
        }
        summary.total_orphan_tests = summary.skipped_closed
            + summary.reprocessed_changed
            + summary.analyzed_new
            + summary.deferred;
    }
}

/// Classify every inventory test against the baseline's records.
///
/// Full-scan mode ignores `baseline` entirely. Tests are visited in key order
/// and duplicate keys keep their first occurrence.
#[must_use]
pub fn plan_closure<'e>(
    mode: RunMode,
    inventory: &'e EvidenceInventory,
    baseline: &[TestRecord],
    filter: &PathFilter,
    max_tests: Option<usize>,
) -> ClosurePlan<'e> {
    let baseline_by_key: BTreeMap<String, &TestRecord> = match mode {
        RunMode::FullScan => BTreeMap::new(),
        RunMode::Delta => baseline.iter().map(|record| (record.key(), record)).collect(),
    };

    let mut selected = 0_usize;
    let tests = inventory
        .tests_by_key()
        .into_values()
        .map(|evidence| {
            let content_hash = evidence.effective_content_hash();
            let prior = baseline_by_key.get(&evidence.key()).and_then(|record| {
                record
                    .effective_closed_status()
                    .map(|status| (status, record.content_hash == content_hash))
            });
            let decision = if !filter.matches(&evidence.file_path) {
                ClosureDecision::FilteredOut {
                    carried: prior.and_then(|(status, unchanged)| unchanged.then_some(status)),
                }
            } else if evidence.has_atom_annotation {
                ClosureDecision::Linked
            } else {
                match prior {
                    Some((inherited, true)) => ClosureDecision::SkipClosed { inherited },
                    Some((_, false)) => ClosureDecision::Reprocess,
                    None => ClosureDecision::Analyze,
                }
            };

            let decision = if decision.needs_inference() {
                selected += 1;
                if max_tests.is_some_and(|cap| selected > cap) {
                    ClosureDecision::Deferred {
                        changed: decision == ClosureDecision::Reprocess,
                    }
                } else {
                    decision
                }
            } else {
                decision
            };

            PlannedTest {
                evidence,
                content_hash,
                decision,
            }
        })
        .collect();

    ClosurePlan { tests }
}
