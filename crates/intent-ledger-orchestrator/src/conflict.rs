//! Conflict creation, resolution and the pairwise detection scan.

use std::collections::{BTreeMap, BTreeSet};

use intent_ledger_domain::{
    ensure_non_empty, now_utc, Atom, AtomId, AtomStatus, ConflictId, ConflictMetrics,
    ConflictRecord, ConflictResolution, ConflictStatus, ConflictType, LedgerError, LedgerResult,
    ResolutionAction, RunId, TestRecord, TestRecordId,
};
use intent_ledger_store_core::{ConflictInsert, ConflictStore};
use serde::Serialize;

const NEGATIONS: [&str; 5] = ["not", "never", "no", "cannot", "without"];
const CROSS_BOUNDARY_OVERLAP: f64 = 0.5;

#[derive(Debug, Clone, PartialEq)]
pub struct NewConflict {
    pub conflict_type: ConflictType,
    pub atom_id_a: AtomId,
    pub atom_id_b: AtomId,
    pub description: String,
    pub test_record_id: Option<TestRecordId>,
    /// Similarity in `0.0..=1.0`.
    pub similarity_score: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConflictOutcome {
    Created(ConflictRecord),
    /// An open conflict for the same pair and type already existed.
    Existing(ConflictRecord),
}

impl ConflictOutcome {
    #[must_use]
    pub fn record(&self) -> &ConflictRecord {
        match self {
            Self::Created(record) | Self::Existing(record) => record,
        }
    }

    #[must_use]
    pub fn is_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveRequest {
    pub action: ResolutionAction,
    pub resolved_by: String,
    pub reason: Option<String>,
    pub clarification_artifact_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConflictScanReport {
    pub examined_pairs: usize,
    pub created: usize,
    pub duplicates: usize,
}

pub struct ConflictService<'a> {
    store: &'a dyn ConflictStore,
    overlap_threshold: f64,
}

impl<'a> ConflictService<'a> {
    #[must_use]
    pub fn new(store: &'a dyn ConflictStore, overlap_threshold: f64) -> Self {
        Self {
            store,
            overlap_threshold,
        }
    }

    /// Record a conflict between two atoms. Creating a conflict that is
    /// already open for the same unordered pair and type is a no-op.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] for malformed input and
    /// [`LedgerError::NotFound`] when either atom does not exist.
    pub fn create(&self, conflict: NewConflict) -> LedgerResult<ConflictOutcome> {
        if conflict.atom_id_a == conflict.atom_id_b {
            return Err(LedgerError::validation(
                "a conflict needs two different atoms",
            ));
        }
        ensure_non_empty("description", &conflict.description)?;
        if let Some(score) = conflict.similarity_score {
            if !(0.0..=1.0).contains(&score) {
                return Err(LedgerError::Validation(format!(
                    "similarity_score {score} must be within 0.0..=1.0"
                )));
            }
        }
        for atom_id in [conflict.atom_id_a, conflict.atom_id_b] {
            if self.store.get_atom(atom_id)?.is_none() {
                return Err(LedgerError::not_found(format!("atom {atom_id}")));
            }
        }

        if let Some(existing) = self.store.find_open_conflict(
            conflict.atom_id_a,
            conflict.atom_id_b,
            conflict.conflict_type,
        )? {
            return Ok(ConflictOutcome::Existing(self.get(existing)?));
        }

        let now = now_utc();
        let record = ConflictRecord {
            conflict_id: ConflictId::new(),
            conflict_type: conflict.conflict_type,
            atom_id_a: conflict.atom_id_a,
            atom_id_b: conflict.atom_id_b,
            test_record_id: conflict.test_record_id,
            similarity_score: conflict.similarity_score,
            description: conflict.description.trim().to_string(),
            status: ConflictStatus::Open,
            resolution: None,
            created_at: now,
            updated_at: now,
        };
        match self.store.insert_conflict(&record)? {
            ConflictInsert::Inserted => {
                tracing::info!(
                    conflict_id = %record.conflict_id,
                    conflict_type = record.conflict_type.as_str(),
                    "conflict recorded"
                );
                Ok(ConflictOutcome::Created(record))
            }
            ConflictInsert::Duplicate(existing) => Ok(ConflictOutcome::Existing(self.get(existing)?)),
        }
    }

    /// Close an open conflict and apply its action to the atoms involved.
    ///
    /// # Errors
    /// Returns [`LedgerError::InvalidState`] unless the conflict is open.
    pub fn resolve(
        &self,
        conflict_id: ConflictId,
        request: ResolveRequest,
    ) -> LedgerResult<ConflictRecord> {
        ensure_non_empty("resolved_by", &request.resolved_by)?;
        let mut conflict = self.get(conflict_id)?;
        if conflict.status != ConflictStatus::Open {
            return Err(LedgerError::InvalidState(format!(
                "conflict {conflict_id} is {}",
                conflict.status.as_str()
            )));
        }

        let now = now_utc();
        conflict.status = ConflictStatus::Resolved;
        conflict.updated_at = now;
        conflict.resolution = Some(ConflictResolution {
            action: request.action,
            resolved_by: request.resolved_by.trim().to_string(),
            resolved_at: now,
            reason: request.reason.map(|reason| reason.trim().to_string()),
            clarification_artifact_id: request.clarification_artifact_id,
        });

        let (a, b) = (conflict.atom_id_a, conflict.atom_id_b);
        let resolved = &conflict;
        self.store.in_transaction(&mut || {
            match request.action {
                ResolutionAction::SupersedeA => {
                    self.store.update_atom_status(a, AtomStatus::Superseded, Some(b))?;
                }
                ResolutionAction::SupersedeB => {
                    self.store.update_atom_status(b, AtomStatus::Superseded, Some(a))?;
                }
                ResolutionAction::RejectA => {
                    self.store.update_atom_status(a, AtomStatus::Rejected, None)?;
                }
                ResolutionAction::RejectB => {
                    self.store.update_atom_status(b, AtomStatus::Rejected, None)?;
                }
                ResolutionAction::SplitTest | ResolutionAction::Clarify => {}
            }
            self.store.update_conflict(resolved)
        })?;
        tracing::info!(
            conflict_id = %conflict_id,
            action = request.action.as_str(),
            "conflict resolved"
        );
        Ok(conflict)
    }

    /// # Errors
    /// Returns [`LedgerError::InvalidState`] unless the conflict is open.
    pub fn escalate(&self, conflict_id: ConflictId) -> LedgerResult<ConflictRecord> {
        let mut conflict = self.get(conflict_id)?;
        if conflict.status != ConflictStatus::Open {
            return Err(LedgerError::InvalidState(format!(
                "conflict {conflict_id} is {}",
                conflict.status.as_str()
            )));
        }
        conflict.status = ConflictStatus::Escalated;
        conflict.updated_at = now_utc();
        self.store.update_conflict(&conflict)?;
        Ok(conflict)
    }

    /// # Errors
    /// Returns [`LedgerError::NotFound`] for unknown ids.
    pub fn get(&self, conflict_id: ConflictId) -> LedgerResult<ConflictRecord> {
        self.store
            .get_conflict(conflict_id)?
            .ok_or_else(|| LedgerError::not_found(format!("conflict {conflict_id}")))
    }

    /// # Errors
    /// Returns [`LedgerError::Storage`] when the store cannot be read.
    pub fn list(&self, status: Option<ConflictStatus>) -> LedgerResult<Vec<ConflictRecord>> {
        Ok(self.store.list_conflicts(status)?)
    }

    /// Counts by status, overall and per type. Every type is present.
    ///
    /// # Errors
    /// Returns [`LedgerError::Storage`] when the store cannot be read.
    pub fn get_metrics(&self) -> LedgerResult<ConflictMetrics> {
        let mut metrics = ConflictMetrics {
            by_type: ConflictType::ALL
                .iter()
                .map(|conflict_type| (conflict_type.as_str().to_string(), Default::default()))
                .collect(),
            ..ConflictMetrics::default()
        };
        for conflict in self.store.list_conflicts(None)? {
            metrics.total += 1;
            let counts = metrics
                .by_type
                .entry(conflict.conflict_type.as_str().to_string())
                .or_default();
            counts.total += 1;
            match conflict.status {
                ConflictStatus::Open => {
                    metrics.open += 1;
                    counts.open += 1;
                }
                ConflictStatus::Resolved => {
                    metrics.resolved += 1;
                    counts.resolved += 1;
                }
                ConflictStatus::Escalated => {
                    metrics.escalated += 1;
                    counts.escalated += 1;
                }
            }
        }
        Ok(metrics)
    }

    /// Compare every pair of committed atoms and record what looks conflicting.
    ///
    /// # Errors
    /// Returns [`LedgerError::Storage`] when the store cannot be read or written.
    pub fn scan(&self) -> LedgerResult<ConflictScanReport> {
        let atoms = self.store.list_atoms(Some(AtomStatus::Committed))?;
        let tokens: Vec<BTreeSet<String>> = atoms
            .iter()
            .map(|atom| tokenize(&atom.description))
            .collect();
        let mut records_by_run: BTreeMap<RunId, Vec<TestRecord>> = BTreeMap::new();
        let mut report = ConflictScanReport::default();

        for i in 0..atoms.len() {
            for j in (i + 1)..atoms.len() {
                report.examined_pairs += 1;
                let Some(finding) = self.classify(&atoms[i], &atoms[j], &tokens[i], &tokens[j])
                else {
                    continue;
                };
                let finding = if finding.conflict_type == ConflictType::SameTest {
                    NewConflict {
                        test_record_id: self.test_record_for(&atoms[j], &mut records_by_run)?,
                        ..finding
                    }
                } else {
                    finding
                };
                if self.create(finding)?.is_created() {
                    report.created += 1;
                } else {
                    report.duplicates += 1;
                }
            }
        }
        tracing::debug!(
            examined = report.examined_pairs,
            created = report.created,
            duplicates = report.duplicates,
            "conflict scan"
        );
        Ok(report)
    }

    fn classify(
        &self,
        a: &Atom,
        b: &Atom,
        tokens_a: &BTreeSet<String>,
        tokens_b: &BTreeSet<String>,
    ) -> Option<NewConflict> {
        let similarity = jaccard(tokens_a, tokens_b);
        let finding = |conflict_type: ConflictType, description: String| NewConflict {
            conflict_type,
            atom_id_a: a.atom_id,
            atom_id_b: b.atom_id,
            description,
            test_record_id: None,
            similarity_score: Some(similarity),
        };

        if a.source_test.file_path == b.source_test.file_path
            && a.source_test.test_name == b.source_test.test_name
        {
            return Some(finding(
                ConflictType::SameTest,
                format!("both atoms derive from {}", a.source_test.key()),
            ));
        }
        if is_contradiction(tokens_a, tokens_b) {
            return Some(finding(
                ConflictType::Contradiction,
                format!("'{}' negates '{}'", a.description, b.description),
            ));
        }
        let top_a = top_level_dir(&a.source_test.file_path);
        let top_b = top_level_dir(&b.source_test.file_path);
        if similarity >= CROSS_BOUNDARY_OVERLAP && top_a != top_b {
            return Some(finding(
                ConflictType::CrossBoundary,
                format!("similar intent claimed by {top_a} and {top_b}"),
            ));
        }
        if similarity >= self.overlap_threshold {
            return Some(finding(
                ConflictType::SemanticOverlap,
                format!("descriptions overlap at {similarity:.2}"),
            ));
        }
        None
    }

    fn test_record_for(
        &self,
        atom: &Atom,
        cache: &mut BTreeMap<RunId, Vec<TestRecord>>,
    ) -> LedgerResult<Option<TestRecordId>> {
        let Some(run_id) = atom.created_from_run_id else {
            return Ok(None);
        };
        if !cache.contains_key(&run_id) {
            cache.insert(run_id, self.store.list_test_records(run_id)?);
        }
        Ok(cache.get(&run_id).and_then(|records| {
            records
                .iter()
                .find(|record| {
                    record.file_path == atom.source_test.file_path
                        && record.test_name == atom.source_test.test_name
                })
                .map(|record| record.test_record_id)
        }))
    }
}

fn tokenize(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    #[allow(clippy::cast_precision_loss)]
    let score = a.intersection(b).count() as f64 / union as f64;
    score
}

fn is_contradiction(a: &BTreeSet<String>, b: &BTreeSet<String>) -> bool {
    let negated = |tokens: &BTreeSet<String>| tokens.iter().any(|t| NEGATIONS.contains(&t.as_str()));
    let stripped = |tokens: &BTreeSet<String>| -> BTreeSet<String> {
        tokens
            .iter()
            .filter(|t| !NEGATIONS.contains(&t.as_str()))
            .cloned()
            .collect()
    };
    negated(a) != negated(b) && !stripped(a).is_empty() && stripped(a) == stripped(b)
}

fn top_level_dir(path: &str) -> &str {
    path.split_once('/').map_or("", |(top, _)| top)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::{
        is_contradiction, jaccard, tokenize, ConflictOutcome, ConflictService, NewConflict,
        ResolveRequest,
    };
    use intent_ledger_domain::{
        now_utc, Atom, AtomId, AtomStatus, ConflictStatus, ConflictType, LedgerError,
        ResolutionAction, SourceTestRef,
    };
    use intent_ledger_store_core::LedgerStore;
    use intent_ledger_store_sqlite::SqliteLedgerStore;
    use proptest::prelude::*;
    use ulid::Ulid;

    fn temp_db_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "intent-ledger-conflict-test-{name}-{}.sqlite",
            Ulid::new()
        ))
    }

    fn must<T, E: std::fmt::Debug>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:?}"),
        }
    }

    fn open_store(name: &str) -> SqliteLedgerStore {
        let store = must(SqliteLedgerStore::open(&temp_db_path(name)));
        must(store.migrate());
        store
    }

    fn insert_atom(store: &SqliteLedgerStore, file: &str, test: &str, description: &str) -> AtomId {
        let atom = Atom {
            atom_id: AtomId::new(),
            description: description.to_string(),
            category: "functional".to_string(),
            source_test: SourceTestRef {
                file_path: file.to_string(),
                test_name: test.to_string(),
                line_number: 1,
            },
            status: AtomStatus::Committed,
            superseded_by: None,
            created_from_run_id: None,
            created_at: now_utc(),
        };
        must(store.insert_atom(&atom));
        atom.atom_id
    }

    fn new_conflict(a: AtomId, b: AtomId, conflict_type: ConflictType) -> NewConflict {
        NewConflict {
            conflict_type,
            atom_id_a: a,
            atom_id_b: b,
            description: "overlapping intent".to_string(),
            test_record_id: None,
            similarity_score: Some(0.9),
        }
    }

    #[test]
    fn duplicate_creation_returns_existing_conflict() {
        let store = open_store("duplicate");
        let a = insert_atom(&store, "src/a.test.ts", "one", "cart total includes tax");
        let b = insert_atom(&store, "src/b.test.ts", "two", "cart total includes vat");
        let service = ConflictService::new(&store, 0.8);

        let first = must(service.create(new_conflict(a, b, ConflictType::SemanticOverlap)));
        let second = must(service.create(new_conflict(b, a, ConflictType::SemanticOverlap)));
        assert!(first.is_created());
        assert!(matches!(second, ConflictOutcome::Existing(_)));
        assert_eq!(first.record().conflict_id, second.record().conflict_id);

        let other_type = must(service.create(new_conflict(a, b, ConflictType::Contradiction)));
        assert!(other_type.is_created());
    }

    #[test]
    fn create_validates_input() {
        let store = open_store("validate");
        let a = insert_atom(&store, "src/a.test.ts", "one", "cart total includes tax");
        let service = ConflictService::new(&store, 0.8);

        assert!(matches!(
            service.create(new_conflict(a, a, ConflictType::SameTest)),
            Err(LedgerError::Validation(_))
        ));
        assert!(matches!(
            service.create(new_conflict(a, AtomId::new(), ConflictType::SameTest)),
            Err(LedgerError::NotFound(_))
        ));
        let b = insert_atom(&store, "src/b.test.ts", "two", "cart total");
        let mut bad_score = new_conflict(a, b, ConflictType::SemanticOverlap);
        bad_score.similarity_score = Some(1.5);
        assert!(matches!(service.create(bad_score), Err(LedgerError::Validation(_))));
    }

    #[test]
    fn resolution_actions_update_atoms() {
        let store = open_store("resolve");
        let a = insert_atom(&store, "src/a.test.ts", "one", "login locks after three failures");
        let b = insert_atom(&store, "src/a.test.ts", "one", "login locks after five failures");
        let service = ConflictService::new(&store, 0.8);
        let created = must(service.create(new_conflict(a, b, ConflictType::SameTest)));

        let resolved = must(service.resolve(
            created.record().conflict_id,
            ResolveRequest {
                action: ResolutionAction::SupersedeA,
                resolved_by: "alex".to_string(),
                reason: Some("five is current policy".to_string()),
                clarification_artifact_id: None,
            },
        ));
        assert_eq!(resolved.status, ConflictStatus::Resolved);
        let superseded = must(store.get_atom(a));
        assert!(superseded.is_some_and(|atom| {
            atom.status == AtomStatus::Superseded && atom.superseded_by == Some(b)
        }));

        let again = service.resolve(
            created.record().conflict_id,
            ResolveRequest {
                action: ResolutionAction::Clarify,
                resolved_by: "alex".to_string(),
                reason: None,
                clarification_artifact_id: None,
            },
        );
        assert!(matches!(again, Err(LedgerError::InvalidState(_))));
        assert!(matches!(
            service.escalate(created.record().conflict_id),
            Err(LedgerError::InvalidState(_))
        ));
    }

    #[test]
    fn scan_classifies_pairs_and_is_idempotent() {
        let store = open_store("scan");
        insert_atom(&store, "src/cart.test.ts", "totals", "cart total includes tax");
        insert_atom(&store, "src/cart.test.ts", "totals", "cart total rounds up");
        insert_atom(&store, "src/auth.test.ts", "lockout", "account is locked after failures");
        insert_atom(&store, "src/auth.test.ts", "unlock", "account is not locked after failures");
        insert_atom(&store, "api/orders.test.ts", "ship", "orders ship within two days");
        insert_atom(&store, "web/orders.test.ts", "ship", "orders ship within three days");
        let service = ConflictService::new(&store, 0.8);

        let first = must(service.scan());
        assert_eq!(first.examined_pairs, 15);
        assert_eq!(first.created, 3);
        let second = must(service.scan());
        assert_eq!(second.created, 0);
        assert_eq!(second.duplicates, 3);

        let metrics = must(service.get_metrics());
        assert_eq!(metrics.total, 3);
        assert_eq!(metrics.open, 3);
        assert_eq!(metrics.by_type.len(), 4);
        for kind in ["same_test", "contradiction", "cross_boundary"] {
            assert_eq!(metrics.by_type.get(kind).map(|counts| counts.total), Some(1));
        }
        assert_eq!(
            metrics.by_type.get("semantic_overlap").map(|counts| counts.total),
            Some(0)
        );
    }

    #[test]
    fn similarity_helpers() {
        let a = tokenize("Cart total, includes tax!");
        let b = tokenize("cart total includes VAT");
        assert!((jaccard(&a, &b) - 0.6).abs() < 1e-9);
        assert!(!is_contradiction(
            &tokenize("user can log in"),
            &tokenize("user cannot log in")
        ));
        assert!(is_contradiction(
            &tokenize("session expires"),
            &tokenize("session never expires")
        ));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn prop_one_open_conflict_per_pair_and_type(
            picks in proptest::collection::vec((0usize..4, 0usize..4, 0usize..4), 1..24)
        ) {
            let store = open_store("prop");
            let atoms: Vec<AtomId> = (0..4)
                .map(|i| insert_atom(&store, "src/p.test.ts", &format!("t{i}"), &format!("atom {i}")))
                .collect();
            let service = ConflictService::new(&store, 0.8);
            let mut expected = std::collections::BTreeSet::new();
            for (x, y, kind) in picks {
                if x == y {
                    continue;
                }
                let conflict_type = ConflictType::ALL[kind];
                let outcome = service.create(new_conflict(atoms[x], atoms[y], conflict_type));
                prop_assert!(outcome.is_ok());
                expected.insert((x.min(y), x.max(y), kind));
            }
            let open = must(service.list(Some(ConflictStatus::Open)));
            prop_assert_eq!(open.len(), expected.len());
        }
    }
}
