use std::path::{Path, PathBuf};

use anyhow::Result;
use intent_ledger_domain::{
    now_utc, AtomStatus, ConflictStatus, ConflictType, Decision, DeltaBaseline,
    EvidenceInventory, LedgerError, ReconciliationRun, RecommendationDecision,
    RecommendationStatus, ResolutionAction, ReviewSubmission, RunEventType, RunId, RunMode,
    RunOptions, RunStatus, RunSummary, SourceTestRef, TestEvidence, TestRecordStatus,
};
use intent_ledger_inference::{
    AtomInferenceOutput, AtomInferenceRequest, CandidateAtom, GroupingOutput, GroupingRequest,
    InferenceCapability, MockInference, MockScript,
};
use intent_ledger_orchestrator::{
    ConflictService, EngineSettings, ResolveRequest, RunOrchestrator, StartRequest,
    StaticEvidenceSource,
};
use intent_ledger_policy::{BudgetTier, EvidenceWeightedScorer};
use intent_ledger_store_core::LedgerStore;
use intent_ledger_store_sqlite::SqliteLedgerStore;
use parking_lot::Mutex;
use ulid::Ulid;

const ROOT: &str = "/repo";
const CART: &str = "src/cart.test.ts";

fn temp_db_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!(
        "intent-ledger-orchestrator-test-{name}-{}.sqlite",
        Ulid::new()
    ))
}

fn must<T, E: std::fmt::Debug>(result: Result<T, E>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => panic!("test failure: {err:?}"),
    }
}

fn open_store(path: &Path) -> SqliteLedgerStore {
    let store = must(SqliteLedgerStore::open(path));
    must(store.migrate());
    store
}

fn test_evidence(name: &str) -> TestEvidence {
    TestEvidence {
        file_path: CART.to_string(),
        test_name: name.to_string(),
        line_number: 7,
        body: format!("expect(cart.{}).toBeTruthy()", name.replace(' ', "_")),
        content_hash: None,
        has_atom_annotation: false,
        assertions: Vec::new(),
    }
}

fn cart_inventory(names: &[&str]) -> EvidenceInventory {
    EvidenceInventory {
        commit_hash: Some("c0ffee".to_string()),
        tests: names.iter().map(|name| test_evidence(name)).collect(),
        ..EvidenceInventory::default()
    }
}

const THREE_TESTS: [&str; 3] = [
    "adds item to cart",
    "removes item from cart",
    "computes cart subtotal",
];

fn full_scan(options: RunOptions) -> StartRequest {
    StartRequest {
        root_directory: ROOT.to_string(),
        mode: RunMode::FullScan,
        delta_baseline: None,
        commit_hash: None,
        options,
    }
}

fn lenient() -> RunOptions {
    RunOptions {
        quality_threshold: 70,
        ..RunOptions::default()
    }
}

fn single_tier(max_total_tokens: u64) -> EngineSettings {
    EngineSettings {
        max_concurrency: 1,
        budget_tiers: vec![BudgetTier {
            name: "tight".to_string(),
            max_tests: None,
            max_total_tokens,
            max_duration_ms: 600_000,
            max_llm_calls: 10,
        }],
        ..EngineSettings::default()
    }
}

fn scripted_atom(test_name: &str, description: &str, confidence: f64, outcomes: &[&str]) -> CandidateAtom {
    CandidateAtom {
        description: description.to_string(),
        category: "functional".to_string(),
        confidence,
        reasoning: "asserted in the test body".to_string(),
        source_test: SourceTestRef {
            file_path: CART.to_string(),
            test_name: test_name.to_string(),
            line_number: 0,
        },
        observable_outcomes: outcomes.iter().map(ToString::to_string).collect(),
        related_docs: Vec::new(),
        ambiguity_reasons: Vec::new(),
    }
}

fn test_key(name: &str) -> String {
    format!("{CART}::{name}")
}

#[test]
fn full_scan_completes_and_records_every_orphan_test() {
    let store = open_store(&temp_db_path("full-scan"));
    let evidence = StaticEvidenceSource::new(ROOT, cart_inventory(&THREE_TESTS));
    let provider = MockInference::default();
    let scorer = EvidenceWeightedScorer;
    let engine = RunOrchestrator::new(&store, &evidence, &provider, &scorer, EngineSettings::default());

    let result = must(engine.start(full_scan(lenient())));
    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.summary.total_orphan_tests, 3);
    assert_eq!(result.summary.analyzed_new, 3);
    assert_eq!(result.summary.atoms_proposed, 3);
    assert_eq!(result.summary.atoms_accepted, 3);
    assert_eq!(result.summary.molecules_accepted, 1);
    assert_eq!(provider.atom_calls(), 3);
    assert_eq!(provider.group_calls(), 1);

    let details = must(engine.get_run_details(result.run_id));
    assert_eq!(details.run.commit_hash.as_deref(), Some("c0ffee"));
    assert!(details.run.completed_at.is_some());
    assert!(details
        .test_records
        .iter()
        .all(|record| record.status == TestRecordStatus::Accepted));
    assert!(details.atom_recommendations.iter().all(|atom| {
        atom.status == RecommendationStatus::Accepted && atom.atom_id.is_some()
    }));
    assert_eq!(details.run.patch_ops.len(), 4);
    assert!(details.pending_review.is_none());
    assert_eq!(details.molecules.len(), 1);
    assert_eq!(details.molecules[0].created_from_run_id, Some(result.run_id));
    assert_eq!(details.molecules[0].atom_ids.len(), 3);

    let chain = must(engine.verify_event_chain(result.run_id));
    assert!(chain.chain_valid);
    let events = must(store.list_events_for_run(result.run_id));
    assert_eq!(events.first().map(|row| row.event.event_type), Some(RunEventType::RunCreated));
    assert_eq!(events.last().map(|row| row.event.event_type), Some(RunEventType::RunCompleted));
    assert!(must(engine.get_active_runs()).is_empty());
}

#[test]
fn review_interrupt_then_approval_completes_the_run() {
    let store = open_store(&temp_db_path("review"));
    let evidence = StaticEvidenceSource::new(ROOT, cart_inventory(&["applies discount code"]));
    let provider = MockInference::default().with_script(
        &test_key("applies discount code"),
        MockScript::Atoms(vec![scripted_atom(
            "applies discount code",
            "Discount code lowers the cart total",
            40.0,
            &["total drops by ten percent"],
        )]),
    );
    let scorer = EvidenceWeightedScorer;
    let engine = RunOrchestrator::new(&store, &evidence, &provider, &scorer, EngineSettings::default());

    let waiting = must(engine.start(full_scan(RunOptions {
        require_review: true,
        ..RunOptions::default()
    })));
    assert_eq!(waiting.status, RunStatus::WaitingForReview);
    let pending = waiting.pending_review.clone();
    assert!(pending.is_some());
    let pending = pending.unwrap_or_else(|| unreachable!());
    assert!(pending.summary.fail_count >= 1);
    assert_eq!(pending.pending_atoms.len(), 1);
    assert!(pending.pending_atoms[0].quality_score < 80);

    let active = must(engine.get_active_runs());
    assert_eq!(active.len(), 1);
    let details = must(engine.get_run_details(waiting.run_id));
    assert_eq!(
        details.pending_review.map(|review| review.reason),
        Some("review required by run options".to_string())
    );

    let unknown = ReviewSubmission {
        atom_decisions: vec![RecommendationDecision {
            temp_id: "atom-missing".to_string(),
            decision: Decision::Approve { reason: None },
        }],
        ..ReviewSubmission::default()
    };
    assert!(matches!(
        engine.submit_review(waiting.run_id, &unknown),
        Err(LedgerError::UnknownRecommendation(_))
    ));

    let approval = ReviewSubmission {
        atom_decisions: vec![RecommendationDecision {
            temp_id: pending.pending_atoms[0].temp_id.clone(),
            decision: Decision::Approve {
                reason: Some("accurate despite the score".to_string()),
            },
        }],
        molecule_decisions: Vec::new(),
        comment: Some("approved".to_string()),
    };
    let completed = must(engine.submit_review(waiting.run_id, &approval));
    assert_eq!(completed.status, RunStatus::Completed);
    assert_eq!(completed.summary.atoms_accepted, 1);
    let atoms = must(store.list_atoms(Some(AtomStatus::Committed)));
    assert_eq!(atoms.len(), 1);
    assert_eq!(atoms[0].description, "Discount code lowers the cart total");
    assert_eq!(atoms[0].source_test.line_number, 7);

    let retried = must(engine.submit_review(waiting.run_id, &approval));
    assert_eq!(retried.status, RunStatus::Completed);
    assert_eq!(retried.summary.atoms_accepted, 1);
    assert_eq!(must(store.list_atoms(None)).len(), 1);

    let different = ReviewSubmission {
        atom_decisions: vec![RecommendationDecision {
            temp_id: pending.pending_atoms[0].temp_id.clone(),
            decision: Decision::Reject {
                reason: "too late".to_string(),
            },
        }],
        ..ReviewSubmission::default()
    };
    assert!(matches!(
        engine.submit_review(waiting.run_id, &different),
        Err(LedgerError::InvalidState(_))
    ));
    assert!(must(engine.verify_event_chain(waiting.run_id)).chain_valid);
}

#[test]
fn partial_review_interrupts_again() {
    let store = open_store(&temp_db_path("partial-review"));
    let names = ["adds item to cart", "removes item from cart"];
    let evidence = StaticEvidenceSource::new(ROOT, cart_inventory(&names));
    let provider = MockInference::default();
    let scorer = EvidenceWeightedScorer;
    let engine = RunOrchestrator::new(&store, &evidence, &provider, &scorer, EngineSettings::default());

    let waiting = must(engine.start(full_scan(RunOptions {
        require_review: true,
        ..lenient()
    })));
    assert_eq!(waiting.status, RunStatus::WaitingForReview);
    let pending = waiting.pending_review.unwrap_or_else(|| unreachable!());
    assert_eq!(pending.pending_atoms.len(), 2);
    assert_eq!(pending.pending_molecules.len(), 1);

    let first = ReviewSubmission {
        atom_decisions: vec![RecommendationDecision {
            temp_id: pending.pending_atoms[0].temp_id.clone(),
            decision: Decision::Reject {
                reason: "duplicate of an existing atom".to_string(),
            },
        }],
        ..ReviewSubmission::default()
    };
    let again = must(engine.submit_review(waiting.run_id, &first));
    assert_eq!(again.status, RunStatus::WaitingForReview);
    let remaining = again.pending_review.unwrap_or_else(|| unreachable!());
    assert_eq!(remaining.reason, "undecided recommendations remain");
    assert_eq!(remaining.pending_atoms.len(), 1);

    let records = must(store.list_test_records(waiting.run_id));
    let rejected = records
        .iter()
        .filter(|record| record.status == TestRecordStatus::Rejected)
        .count();
    assert_eq!(rejected, 1);

    let second = ReviewSubmission {
        atom_decisions: vec![RecommendationDecision {
            temp_id: remaining.pending_atoms[0].temp_id.clone(),
            decision: Decision::Approve { reason: None },
        }],
        molecule_decisions: vec![RecommendationDecision {
            temp_id: pending.pending_molecules[0].temp_id.clone(),
            decision: Decision::Reject {
                reason: "only one member survived".to_string(),
            },
        }],
        comment: None,
    };
    let done = must(engine.submit_review(waiting.run_id, &second));
    assert_eq!(done.status, RunStatus::Completed);
    assert_eq!(done.summary.atoms_accepted, 1);
    assert_eq!(done.summary.atoms_rejected, 1);
    assert_eq!(done.summary.molecules_rejected, 1);
}

#[test]
fn delta_run_skips_tests_closed_in_the_baseline() {
    let store = open_store(&temp_db_path("delta"));
    let mut evidence = StaticEvidenceSource::new(ROOT, cart_inventory(&THREE_TESTS));
    let provider = MockInference::default();
    let scorer = EvidenceWeightedScorer;

    let baseline = {
        let engine = RunOrchestrator::new(&store, &evidence, &provider, &scorer, EngineSettings::default());
        must(engine.start(full_scan(lenient())))
    };
    assert_eq!(baseline.status, RunStatus::Completed);

    let delta = |baseline: DeltaBaseline| StartRequest {
        root_directory: ROOT.to_string(),
        mode: RunMode::Delta,
        delta_baseline: Some(baseline),
        commit_hash: None,
        options: lenient(),
    };

    let unchanged = {
        let engine = RunOrchestrator::new(&store, &evidence, &provider, &scorer, EngineSettings::default());
        must(engine.start(delta(DeltaBaseline {
            run_id: Some(baseline.run_id),
            commit_hash: None,
        })))
    };
    assert_eq!(unchanged.status, RunStatus::Completed);
    assert_eq!(unchanged.summary.skipped_closed, 3);
    assert_eq!(unchanged.summary.analyzed_new, 0);
    assert_eq!(unchanged.summary.atoms_proposed, 0);
    assert_eq!(provider.atom_calls(), 3);

    let mut changed = cart_inventory(&THREE_TESTS);
    changed.tests[0].body.push_str("\nexpect(cart.size).toBe(1)");
    changed.tests.push(test_evidence("empties the cart"));
    evidence.set(ROOT, changed);
    let engine = RunOrchestrator::new(&store, &evidence, &provider, &scorer, EngineSettings::default());
    let by_commit = must(engine.start(delta(DeltaBaseline {
        run_id: None,
        commit_hash: Some("c0ffee".to_string()),
    })));
    assert_eq!(by_commit.status, RunStatus::Completed);
    assert_eq!(by_commit.summary.skipped_closed, 2);
    assert_eq!(by_commit.summary.reprocessed_changed, 1);
    assert_eq!(by_commit.summary.analyzed_new, 1);
    assert_eq!(by_commit.summary.total_orphan_tests, 4);
    assert_eq!(provider.atom_calls(), 5);

    let records = must(store.list_test_records(by_commit.run_id));
    let inherited = records
        .iter()
        .filter(|record| record.inherited_status == Some(TestRecordStatus::Accepted))
        .count();
    assert_eq!(inherited, 2);
}

#[test]
fn closure_survives_a_filtered_delta_run() {
    let store = open_store(&temp_db_path("filtered-delta"));
    let mut inventory = cart_inventory(&["adds item to cart"]);
    let mut login = test_evidence("logs in with valid password");
    login.file_path = "auth/login.test.ts".to_string();
    inventory.tests.push(login);
    let evidence = StaticEvidenceSource::new(ROOT, inventory);
    let provider = MockInference::default();
    let scorer = EvidenceWeightedScorer;
    let engine = RunOrchestrator::new(&store, &evidence, &provider, &scorer, EngineSettings::default());

    let first = must(engine.start(full_scan(lenient())));
    assert_eq!(first.status, RunStatus::Completed);
    assert_eq!(first.summary.atoms_accepted, 2);
    let committed = must(store.list_atoms(Some(AtomStatus::Committed))).len();

    let delta = |baseline_run: RunId, include_paths: Vec<String>| StartRequest {
        root_directory: ROOT.to_string(),
        mode: RunMode::Delta,
        delta_baseline: Some(DeltaBaseline {
            run_id: Some(baseline_run),
            commit_hash: None,
        }),
        commit_hash: None,
        options: RunOptions {
            include_paths,
            ..lenient()
        },
    };

    let auth_only = must(engine.start(delta(first.run_id, vec!["auth/**".to_string()])));
    assert_eq!(auth_only.status, RunStatus::Completed);
    assert_eq!(auth_only.summary.filtered_out, 1);
    assert_eq!(auth_only.summary.skipped_closed, 1);
    let carried = must(store.list_test_records(auth_only.run_id));
    assert_eq!(carried.len(), 2);
    assert!(carried.iter().all(|record| {
        record.status == TestRecordStatus::Skipped
            && record.inherited_status == Some(TestRecordStatus::Accepted)
    }));

    let unfiltered = must(engine.start(delta(auth_only.run_id, Vec::new())));
    assert_eq!(unfiltered.status, RunStatus::Completed);
    assert_eq!(unfiltered.summary.skipped_closed, 2);
    assert_eq!(unfiltered.summary.analyzed_new, 0);
    assert_eq!(unfiltered.summary.atoms_proposed, 0);
    assert_eq!(provider.atom_calls(), 2);
    assert_eq!(must(store.list_atoms(Some(AtomStatus::Committed))).len(), committed);
}

#[test]
fn invalid_requests_fail_before_any_state_is_written() {
    let store = open_store(&temp_db_path("validation"));
    let evidence = StaticEvidenceSource::new(ROOT, cart_inventory(&THREE_TESTS));
    let provider = MockInference::default();
    let scorer = EvidenceWeightedScorer;
    let engine = RunOrchestrator::new(&store, &evidence, &provider, &scorer, EngineSettings::default());

    let mut missing_baseline = full_scan(RunOptions::default());
    missing_baseline.mode = RunMode::Delta;
    assert!(matches!(
        engine.start(missing_baseline),
        Err(LedgerError::Validation(_))
    ));

    let mut baseline_in_full_scan = full_scan(RunOptions::default());
    baseline_in_full_scan.delta_baseline = Some(DeltaBaseline {
        run_id: Some(RunId::new()),
        commit_hash: None,
    });
    assert!(matches!(
        engine.start(baseline_in_full_scan),
        Err(LedgerError::Validation(_))
    ));

    assert!(matches!(
        engine.start(full_scan(RunOptions {
            quality_threshold: 101,
            ..RunOptions::default()
        })),
        Err(LedgerError::Validation(_))
    ));
    assert!(matches!(
        engine.start(full_scan(RunOptions {
            include_paths: vec!["  ".to_string()],
            ..RunOptions::default()
        })),
        Err(LedgerError::Validation(_))
    ));

    let mut unknown_baseline = full_scan(RunOptions::default());
    unknown_baseline.mode = RunMode::Delta;
    unknown_baseline.delta_baseline = Some(DeltaBaseline {
        run_id: Some(RunId::new()),
        commit_hash: None,
    });
    assert!(matches!(
        engine.start(unknown_baseline),
        Err(LedgerError::NotFound(_))
    ));

    assert!(must(store.list_runs(&[])).is_empty());
    assert!(matches!(
        engine.get_run_details(RunId::new()),
        Err(LedgerError::NotFound(_))
    ));
}

#[test]
fn soft_budget_violation_defers_remaining_tests() {
    let store = open_store(&temp_db_path("soft-budget"));
    let evidence = StaticEvidenceSource::new(ROOT, cart_inventory(&THREE_TESTS[..2]));
    let provider = MockInference::default().with_tokens_per_call(150);
    let scorer = EvidenceWeightedScorer;
    let engine = RunOrchestrator::new(&store, &evidence, &provider, &scorer, single_tier(100));

    let result = must(engine.start(full_scan(lenient())));
    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.summary.deferred, 1);
    assert_eq!(result.summary.atoms_proposed, 1);
    assert_eq!(provider.atom_calls(), 1);
    let budget = result.summary.budget.clone().unwrap_or_else(|| unreachable!());
    assert!(!budget.within_budget);

    let details = must(engine.get_run_details(result.run_id));
    assert!(details.run.errors.iter().any(|entry| entry.code == "budget_warning"));
    let deferred: Vec<_> = details
        .test_records
        .iter()
        .filter(|record| record.deferred)
        .collect();
    assert_eq!(deferred.len(), 1);
    assert_eq!(deferred[0].status, TestRecordStatus::Pending);
    let events = must(store.list_events_for_run(result.run_id));
    assert!(events
        .iter()
        .any(|row| row.event.event_type == RunEventType::BudgetWarning));
}

#[test]
fn hard_budget_violation_fails_the_run() {
    let store = open_store(&temp_db_path("hard-budget"));
    let evidence = StaticEvidenceSource::new(ROOT, cart_inventory(&THREE_TESTS));
    let provider = MockInference::default().with_tokens_per_call(250);
    let scorer = EvidenceWeightedScorer;
    let engine = RunOrchestrator::new(&store, &evidence, &provider, &scorer, single_tier(100));

    let result = must(engine.start(full_scan(lenient())));
    assert_eq!(result.status, RunStatus::Failed);
    let message = result.error_message.clone().unwrap_or_default();
    assert!(message.contains("2.50x"), "{message}");
    assert_eq!(provider.atom_calls(), 1);

    let details = must(engine.get_run_details(result.run_id));
    assert!(details.run.errors.iter().any(|entry| entry.code == "budget_exceeded"));
    assert!(details.run.completed_at.is_some());
    assert!(matches!(
        engine.resume(result.run_id),
        Err(LedgerError::InvalidState(_))
    ));
}

#[test]
fn output_bound_fails_the_run_and_keeps_persisted_work() {
    let store = open_store(&temp_db_path("bound"));
    let evidence = StaticEvidenceSource::new(ROOT, cart_inventory(&THREE_TESTS));
    let provider = MockInference::default();
    let scorer = EvidenceWeightedScorer;
    let settings = EngineSettings {
        max_concurrency: 1,
        max_atom_recommendations: 2,
        ..EngineSettings::default()
    };
    let engine = RunOrchestrator::new(&store, &evidence, &provider, &scorer, settings);

    let result = must(engine.start(full_scan(lenient())));
    assert_eq!(result.status, RunStatus::Failed);
    assert!(result
        .error_message
        .as_deref()
        .is_some_and(|message| message.contains("output bound exceeded")));
    assert_eq!(must(store.list_atom_recommendations(result.run_id)).len(), 2);
}

#[test]
fn ungrounded_and_failed_inference_are_recorded_not_fatal() {
    let store = open_store(&temp_db_path("grounding"));
    let evidence = StaticEvidenceSource::new(ROOT, cart_inventory(&THREE_TESTS));
    let mut ghost = scripted_atom("adds item to cart", "Ghost behavior from nowhere", 90.0, &["x"]);
    ghost.source_test.test_name = "does not exist".to_string();
    let provider = MockInference::default()
        .with_script(&test_key("adds item to cart"), MockScript::Atoms(vec![ghost]))
        .with_script(
            &test_key("removes item from cart"),
            MockScript::Fail("provider timeout".to_string()),
        );
    let scorer = EvidenceWeightedScorer;
    let engine = RunOrchestrator::new(&store, &evidence, &provider, &scorer, EngineSettings::default());

    let result = must(engine.start(full_scan(lenient())));
    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.summary.grounding_violations, 1);
    assert_eq!(result.summary.inference_failures, 1);
    assert_eq!(result.summary.atoms_proposed, 1);

    let details = must(engine.get_run_details(result.run_id));
    let status_of = |name: &str| {
        details
            .test_records
            .iter()
            .find(|record| record.test_name == name)
            .map(|record| record.status)
    };
    assert_eq!(status_of("adds item to cart"), Some(TestRecordStatus::Rejected));
    assert_eq!(status_of("removes item from cart"), Some(TestRecordStatus::Pending));
    assert_eq!(status_of("computes cart subtotal"), Some(TestRecordStatus::Accepted));
    let codes: Vec<&str> = details.run.errors.iter().map(|entry| entry.code.as_str()).collect();
    assert!(codes.contains(&"grounding_violation"));
    assert!(codes.contains(&"inference_failed"));
}

#[test]
fn candidates_citing_another_test_are_dropped() {
    let store = open_store(&temp_db_path("foreign-citation"));
    let mut inventory = cart_inventory(&["adds item to cart"]);
    let mut legacy = test_evidence("legacy checkout");
    legacy.has_atom_annotation = true;
    inventory.tests.push(legacy);
    let evidence = StaticEvidenceSource::new(ROOT, inventory);
    let provider = MockInference::default().with_script(
        &test_key("adds item to cart"),
        MockScript::Atoms(vec![scripted_atom(
            "legacy checkout",
            "Legacy checkout charges the stored card",
            95.0,
            &["card is charged"],
        )]),
    );
    let scorer = EvidenceWeightedScorer;
    let engine = RunOrchestrator::new(&store, &evidence, &provider, &scorer, EngineSettings::default());

    let result = must(engine.start(full_scan(lenient())));
    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.summary.grounding_violations, 1);
    assert_eq!(result.summary.atoms_proposed, 0);

    let details = must(engine.get_run_details(result.run_id));
    assert!(details.atom_recommendations.is_empty());
    let cart = details
        .test_records
        .iter()
        .find(|record| record.test_name == "adds item to cart");
    assert!(cart.is_some_and(|record| {
        record.status == TestRecordStatus::Rejected && record.recommendation_temp_id.is_none()
    }));
    let legacy = details
        .test_records
        .iter()
        .find(|record| record.test_name == "legacy checkout");
    assert!(legacy.is_some_and(|record| record.status == TestRecordStatus::Skipped));
    assert!(must(store.list_atoms(None)).is_empty());
}

/// Fails the run through a second connection while its first call is in flight.
struct FailsRunMidFlight {
    inner: MockInference,
    side_channel: Mutex<SqliteLedgerStore>,
}

impl InferenceCapability for FailsRunMidFlight {
    fn provider_name(&self) -> &'static str {
        "fails_run_mid_flight"
    }

    fn infer_atoms(&self, request: &AtomInferenceRequest) -> Result<AtomInferenceOutput> {
        let store = self.side_channel.lock();
        if let Some(mut run) = store.get_run(request.run_id)? {
            run.status = RunStatus::Failed;
            run.error_message = Some("cancelled by operator".to_string());
            run.completed_at = Some(now_utc());
            store.update_run(&run)?;
        }
        drop(store);
        self.inner.infer_atoms(request)
    }

    fn group_atoms(&self, request: &GroupingRequest) -> Result<GroupingOutput> {
        self.inner.group_atoms(request)
    }
}

#[test]
fn external_failure_discards_in_flight_results() {
    let path = temp_db_path("external-fail");
    let store = open_store(&path);
    let evidence = StaticEvidenceSource::new(ROOT, cart_inventory(&THREE_TESTS));
    let provider = FailsRunMidFlight {
        inner: MockInference::default(),
        side_channel: Mutex::new(must(SqliteLedgerStore::open(&path))),
    };
    let scorer = EvidenceWeightedScorer;
    let settings = EngineSettings {
        max_concurrency: 1,
        ..EngineSettings::default()
    };
    let engine = RunOrchestrator::new(&store, &evidence, &provider, &scorer, settings);

    let result = must(engine.start(full_scan(lenient())));
    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.error_message.as_deref(), Some("cancelled by operator"));
    assert!(must(store.list_atom_recommendations(result.run_id)).is_empty());
}

#[test]
fn mark_failed_and_resume_follow_the_state_machine() {
    let store = open_store(&temp_db_path("resume"));
    let evidence = StaticEvidenceSource::new(ROOT, cart_inventory(&THREE_TESTS));
    let provider = MockInference::default();
    let scorer = EvidenceWeightedScorer;
    let engine = RunOrchestrator::new(&store, &evidence, &provider, &scorer, EngineSettings::default());

    let interrupted = ReconciliationRun {
        run_id: RunId::new(),
        root_directory: ROOT.to_string(),
        mode: RunMode::FullScan,
        delta_baseline: None,
        baseline_run_id: None,
        commit_hash: None,
        status: RunStatus::Running,
        options: lenient(),
        summary: RunSummary::default(),
        patch_ops: Vec::new(),
        errors: Vec::new(),
        error_message: None,
        config_hash: None,
        created_at: now_utc(),
        completed_at: None,
    };
    must(store.insert_run(&interrupted));
    let resumed = must(engine.resume(interrupted.run_id));
    assert_eq!(resumed.status, RunStatus::Completed);
    assert_eq!(resumed.summary.atoms_accepted, 3);
    let events = must(store.list_events_for_run(interrupted.run_id));
    assert_eq!(events.first().map(|row| row.event.event_type), Some(RunEventType::RunResumed));
    assert!(must(engine.verify_event_chain(interrupted.run_id)).chain_valid);

    let waiting = must(engine.start(full_scan(RunOptions {
        require_review: true,
        ..lenient()
    })));
    assert_eq!(waiting.status, RunStatus::WaitingForReview);
    assert!(matches!(
        engine.resume(waiting.run_id),
        Err(LedgerError::InvalidState(_))
    ));
    assert!(matches!(
        engine.mark_failed(waiting.run_id, " "),
        Err(LedgerError::Validation(_))
    ));
    let failed = must(engine.mark_failed(waiting.run_id, "abandoned by operator"));
    assert_eq!(failed.status, RunStatus::Failed);
    assert!(matches!(
        engine.mark_failed(waiting.run_id, "again"),
        Err(LedgerError::InvalidState(_))
    ));
    assert!(matches!(
        engine.submit_review(waiting.run_id, &ReviewSubmission::default()),
        Err(LedgerError::InvalidState(_))
    ));
    assert!(must(engine.get_active_runs()).is_empty());
}

#[test]
fn completion_scan_detects_same_test_conflicts() {
    let store = open_store(&temp_db_path("conflicts"));
    let evidence = StaticEvidenceSource::new(ROOT, cart_inventory(&["rejects expired coupons"]));
    let provider = MockInference::default().with_script(
        &test_key("rejects expired coupons"),
        MockScript::Atoms(vec![
            scripted_atom(
                "rejects expired coupons",
                "Expired coupons are refused at checkout",
                90.0,
                &["error banner shown", "total unchanged"],
            ),
            scripted_atom(
                "rejects expired coupons",
                "Coupon expiry is checked against server time",
                90.0,
                &["server clock used", "client clock ignored"],
            ),
        ]),
    );
    let scorer = EvidenceWeightedScorer;
    let engine = RunOrchestrator::new(&store, &evidence, &provider, &scorer, EngineSettings::default());

    let result = must(engine.start(full_scan(RunOptions {
        detect_conflicts: true,
        ..lenient()
    })));
    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.summary.atoms_accepted, 2);

    let service = ConflictService::new(&store, 0.8);
    let open = must(service.list(Some(ConflictStatus::Open)));
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].conflict_type, ConflictType::SameTest);
    assert!(open[0].test_record_id.is_some());

    let resolved = must(service.resolve(
        open[0].conflict_id,
        ResolveRequest {
            action: ResolutionAction::SupersedeA,
            resolved_by: "reviewer@example.com".to_string(),
            reason: Some("B is the precise statement".to_string()),
            clarification_artifact_id: None,
        },
    ));
    assert_eq!(resolved.status, ConflictStatus::Resolved);
    let superseded = must(store.get_atom(open[0].atom_id_a));
    assert!(superseded.is_some_and(|atom| atom.status == AtomStatus::Superseded));

    let metrics = must(service.get_metrics());
    assert_eq!(metrics.resolved, 1);
    assert_eq!(metrics.open, 0);
    let rescan = must(service.scan());
    assert_eq!(rescan.created, 0);
}
