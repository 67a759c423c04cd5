#![forbid(unsafe_code)]

use std::fmt::Write as _;
use std::path::Path;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use intent_ledger_domain::{
    conflict_pair_key, now_utc, Atom, AtomId, AtomRecommendation, AtomStatus, ConflictId,
    ConflictRecord, ConflictStatus, ConflictType, EventRow, Molecule, MoleculeId,
    MoleculeRecommendation, RecommendationStatus, ReconciliationRun, RunEvent, RunEventType,
    RunId, RunMode, RunResult, RunStatus, SourceTestRef, TestRecord, TestRecordId,
    TestRecordStatus,
};
use intent_ledger_store_core::{ConflictInsert, ConflictStore, LedgerStore};
use rusqlite::{params, params_from_iter, Connection, ErrorCode, OptionalExtension, Row};
use time::OffsetDateTime;
use ulid::Ulid;

const LEDGER_SCHEMA_VERSION: i64 = 2;

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS runs (
  run_id TEXT PRIMARY KEY,
  root_directory TEXT NOT NULL,
  mode TEXT NOT NULL CHECK (mode IN ('full-scan','delta')),
  delta_baseline_json TEXT,
  delta_baseline_run_id TEXT,
  baseline_run_id TEXT,
  commit_hash TEXT,
  status TEXT NOT NULL CHECK (status IN ('pending','running','waiting_for_review','completed','failed')),
  options_json TEXT NOT NULL,
  summary_json TEXT NOT NULL,
  patch_ops_json TEXT NOT NULL,
  errors_json TEXT NOT NULL,
  error_message TEXT,
  created_at TEXT NOT NULL,
  completed_at TEXT,
  FOREIGN KEY (delta_baseline_run_id) REFERENCES runs(run_id) ON DELETE SET NULL,
  FOREIGN KEY (baseline_run_id) REFERENCES runs(run_id) ON DELETE SET NULL
);

CREATE TABLE IF NOT EXISTS test_records (
  test_record_id TEXT PRIMARY KEY,
  run_id TEXT NOT NULL,
  file_path TEXT NOT NULL,
  test_name TEXT NOT NULL,
  line_number INTEGER NOT NULL,
  content_hash TEXT NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('pending','accepted','rejected','skipped')),
  inherited_status TEXT CHECK (inherited_status IS NULL OR inherited_status IN ('accepted','rejected')),
  recommendation_temp_id TEXT,
  has_atom_annotation INTEGER NOT NULL CHECK (has_atom_annotation IN (0,1)),
  changed_since_baseline INTEGER NOT NULL CHECK (changed_since_baseline IN (0,1)),
  deferred INTEGER NOT NULL CHECK (deferred IN (0,1)),
  closure_reason TEXT,
  UNIQUE(run_id, file_path, test_name),
  FOREIGN KEY (run_id) REFERENCES runs(run_id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS atoms (
  atom_id TEXT PRIMARY KEY,
  description TEXT NOT NULL,
  category TEXT NOT NULL,
  source_file_path TEXT NOT NULL CHECK (length(trim(source_file_path)) > 0),
  source_test_name TEXT NOT NULL CHECK (length(trim(source_test_name)) > 0),
  source_line INTEGER NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('committed','superseded','rejected')),
  superseded_by TEXT,
  created_from_run_id TEXT,
  created_at TEXT NOT NULL,
  FOREIGN KEY (superseded_by) REFERENCES atoms(atom_id) ON DELETE RESTRICT
);

CREATE TABLE IF NOT EXISTS molecules (
  molecule_id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  description TEXT NOT NULL,
  created_from_run_id TEXT,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS molecule_atoms (
  molecule_id TEXT NOT NULL,
  atom_id TEXT NOT NULL,
  position INTEGER NOT NULL,
  PRIMARY KEY (molecule_id, atom_id),
  FOREIGN KEY (molecule_id) REFERENCES molecules(molecule_id) ON DELETE CASCADE,
  FOREIGN KEY (atom_id) REFERENCES atoms(atom_id) ON DELETE RESTRICT
);

CREATE TABLE IF NOT EXISTS atom_recommendations (
  run_id TEXT NOT NULL,
  temp_id TEXT NOT NULL,
  description TEXT NOT NULL,
  category TEXT NOT NULL,
  confidence INTEGER NOT NULL CHECK (confidence BETWEEN 0 AND 100),
  reasoning TEXT NOT NULL,
  source_file_path TEXT NOT NULL CHECK (length(trim(source_file_path)) > 0),
  source_test_name TEXT NOT NULL CHECK (length(trim(source_test_name)) > 0),
  source_line INTEGER NOT NULL,
  observable_outcomes_json TEXT NOT NULL,
  related_docs_json TEXT NOT NULL,
  ambiguity_reasons_json TEXT NOT NULL,
  quality_score INTEGER CHECK (quality_score IS NULL OR quality_score BETWEEN 0 AND 100),
  quality_issues_json TEXT NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('pending','accepted','rejected')),
  rejection_reason TEXT,
  atom_id TEXT,
  created_at TEXT NOT NULL,
  PRIMARY KEY (run_id, temp_id),
  FOREIGN KEY (run_id) REFERENCES runs(run_id) ON DELETE CASCADE,
  FOREIGN KEY (atom_id) REFERENCES atoms(atom_id) ON DELETE RESTRICT
);

CREATE TABLE IF NOT EXISTS molecule_recommendations (
  run_id TEXT NOT NULL,
  temp_id TEXT NOT NULL,
  name TEXT NOT NULL,
  description TEXT NOT NULL,
  confidence INTEGER NOT NULL CHECK (confidence BETWEEN 0 AND 100),
  reasoning TEXT NOT NULL,
  quality_score INTEGER CHECK (quality_score IS NULL OR quality_score BETWEEN 0 AND 100),
  status TEXT NOT NULL CHECK (status IN ('pending','accepted','rejected')),
  rejection_reason TEXT,
  molecule_id TEXT,
  created_at TEXT NOT NULL,
  PRIMARY KEY (run_id, temp_id),
  FOREIGN KEY (run_id) REFERENCES runs(run_id) ON DELETE CASCADE,
  FOREIGN KEY (molecule_id) REFERENCES molecules(molecule_id) ON DELETE RESTRICT
);

CREATE TABLE IF NOT EXISTS molecule_recommendation_members (
  run_id TEXT NOT NULL,
  molecule_temp_id TEXT NOT NULL,
  atom_temp_id TEXT NOT NULL,
  position INTEGER NOT NULL,
  PRIMARY KEY (run_id, molecule_temp_id, atom_temp_id),
  FOREIGN KEY (run_id, molecule_temp_id)
    REFERENCES molecule_recommendations(run_id, temp_id) ON DELETE CASCADE,
  FOREIGN KEY (run_id, atom_temp_id)
    REFERENCES atom_recommendations(run_id, temp_id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS run_events (
  event_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  event_id TEXT NOT NULL UNIQUE,
  run_id TEXT NOT NULL,
  event_type TEXT NOT NULL,
  occurred_at TEXT NOT NULL,
  recorded_at TEXT NOT NULL,
  actor TEXT NOT NULL,
  payload_json TEXT NOT NULL,
  payload_hash TEXT NOT NULL,
  prev_event_hash TEXT,
  event_hash TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS review_submissions (
  run_id TEXT NOT NULL,
  fingerprint TEXT NOT NULL,
  result_json TEXT NOT NULL,
  submitted_at TEXT NOT NULL,
  PRIMARY KEY (run_id, fingerprint),
  FOREIGN KEY (run_id) REFERENCES runs(run_id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS conflicts (
  conflict_id TEXT PRIMARY KEY,
  conflict_type TEXT NOT NULL CHECK (conflict_type IN ('same_test','semantic_overlap','contradiction','cross_boundary')),
  atom_id_a TEXT NOT NULL,
  atom_id_b TEXT NOT NULL,
  pair_low TEXT NOT NULL,
  pair_high TEXT NOT NULL,
  test_record_id TEXT,
  similarity_score REAL CHECK (similarity_score IS NULL OR (similarity_score >= 0 AND similarity_score <= 1)),
  description TEXT NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('open','resolved','escalated')),
  resolution_json TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  CHECK (atom_id_a <> atom_id_b),
  FOREIGN KEY (atom_id_a) REFERENCES atoms(atom_id) ON DELETE RESTRICT,
  FOREIGN KEY (atom_id_b) REFERENCES atoms(atom_id) ON DELETE RESTRICT
);

CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status, created_at);
CREATE INDEX IF NOT EXISTS idx_runs_commit ON runs(commit_hash, status);
CREATE INDEX IF NOT EXISTS idx_test_records_run ON test_records(run_id, file_path, test_name);
CREATE INDEX IF NOT EXISTS idx_atoms_status ON atoms(status, created_at);
CREATE INDEX IF NOT EXISTS idx_run_events_run_seq ON run_events(run_id, event_seq);
CREATE INDEX IF NOT EXISTS idx_conflicts_status ON conflicts(status, created_at);
CREATE UNIQUE INDEX IF NOT EXISTS idx_conflicts_open_pair
  ON conflicts(pair_low, pair_high, conflict_type) WHERE status = 'open';

CREATE TRIGGER IF NOT EXISTS trg_run_events_no_update
BEFORE UPDATE ON run_events
BEGIN
  SELECT RAISE(FAIL, 'run_events is append-only');
END;
CREATE TRIGGER IF NOT EXISTS trg_run_events_no_delete
BEFORE DELETE ON run_events
BEGIN
  SELECT RAISE(FAIL, 'run_events is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_conflicts_no_delete
BEFORE DELETE ON conflicts
BEGIN
  SELECT RAISE(FAIL, 'conflicts are never deleted');
END;

CREATE TRIGGER IF NOT EXISTS trg_atom_recommendations_grounded_accept
BEFORE UPDATE OF status ON atom_recommendations
WHEN NEW.status = 'accepted' AND NEW.atom_id IS NULL
BEGIN
  SELECT RAISE(FAIL, 'accepted atom recommendations require atom_id');
END;
";

const RUN_COLUMNS: &str = "run_id, root_directory, mode, delta_baseline_json, baseline_run_id,
    commit_hash, status, options_json, summary_json, patch_ops_json, errors_json,
    error_message, config_hash, created_at, completed_at";

const TEST_RECORD_COLUMNS: &str = "test_record_id, run_id, file_path, test_name, line_number,
    content_hash, status, inherited_status, recommendation_temp_id, has_atom_annotation,
    changed_since_baseline, deferred, closure_reason";

const ATOM_RECOMMENDATION_COLUMNS: &str = "run_id, temp_id, description, category, confidence,
    reasoning, source_file_path, source_test_name, source_line, observable_outcomes_json,
    related_docs_json, ambiguity_reasons_json, quality_score, quality_issues_json, status,
    rejection_reason, atom_id, created_at";

const MOLECULE_RECOMMENDATION_COLUMNS: &str = "run_id, temp_id, name, description, confidence,
    reasoning, quality_score, status, rejection_reason, molecule_id, created_at";

const ATOM_COLUMNS: &str = "atom_id, description, category, source_file_path, source_test_name,
    source_line, status, superseded_by, created_from_run_id, created_at";

const CONFLICT_COLUMNS: &str = "conflict_id, conflict_type, atom_id_a, atom_id_b,
    test_record_id, similarity_score, description, status, resolution_json,
    created_at, updated_at";

pub struct SqliteLedgerStore {
    conn: Connection,
}

impl SqliteLedgerStore {
    /// Open or create a `SQLite` ledger database and configure local pragmas.
    ///
    /// # Errors
    /// Returns an error if opening the database or applying pragmas fails.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    fn replace_molecule_members(&self, recommendation: &MoleculeRecommendation) -> Result<()> {
        let run_id = recommendation.run_id.to_string();
        self.conn
            .execute(
                "DELETE FROM molecule_recommendation_members
                 WHERE run_id = ?1 AND molecule_temp_id = ?2",
                params![run_id, recommendation.temp_id],
            )
            .context("failed to clear molecule recommendation members")?;

        for (position, member) in recommendation.atom_temp_ids.iter().enumerate() {
            self.conn
                .execute(
                    "INSERT INTO molecule_recommendation_members(
                        run_id, molecule_temp_id, atom_temp_id, position
                     ) VALUES (?1, ?2, ?3, ?4)",
                    params![
                        run_id,
                        recommendation.temp_id,
                        member,
                        i64::try_from(position).map_err(|_| anyhow!("position overflow"))?,
                    ],
                )
                .with_context(|| {
                    format!(
                        "molecule recommendation {} references unknown atom recommendation {member}",
                        recommendation.temp_id
                    )
                })?;
        }
        Ok(())
    }

    fn molecule_members(&self, run_id: RunId, temp_id: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT atom_temp_id FROM molecule_recommendation_members
             WHERE run_id = ?1 AND molecule_temp_id = ?2
             ORDER BY position ASC",
        )?;
        let mut rows = stmt.query(params![run_id.to_string(), temp_id])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row.get(0)?);
        }
        Ok(out)
    }

    fn molecule_atom_ids(&self, molecule_id: MoleculeId) -> Result<Vec<AtomId>> {
        let mut stmt = self.conn.prepare(
            "SELECT atom_id FROM molecule_atoms WHERE molecule_id = ?1 ORDER BY position ASC",
        )?;
        let mut rows = stmt.query(params![molecule_id.to_string()])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(parse_atom_id(&row.get::<_, String>(0)?)?);
        }
        Ok(out)
    }

    fn query_runs(&self, sql: &str, values: &[String]) -> Result<Vec<ReconciliationRun>> {
        let mut stmt = self.conn.prepare(sql)?;
        let mut rows = stmt.query(params_from_iter(values.iter()))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(run_from_row(row)?);
        }
        Ok(out)
    }
}

impl LedgerStore for SqliteLedgerStore {
    fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(SCHEMA)
            .context("failed to apply ledger schema")?;

        // Added after the first schema version shipped.
        ensure_column(&self.conn, "runs", "config_hash", "TEXT")?;

        let now = rfc3339(now_utc())?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![LEDGER_SCHEMA_VERSION, now],
            )
            .context("failed to record ledger migration")?;

        Ok(())
    }

    fn in_transaction(&self, work: &mut dyn FnMut() -> Result<()>) -> Result<()> {
        self.conn
            .execute_batch("SAVEPOINT ledger_unit")
            .context("failed to open savepoint")?;

        match work() {
            Ok(()) => {
                self.conn
                    .execute_batch("RELEASE SAVEPOINT ledger_unit")
                    .context("failed to release savepoint")?;
                Ok(())
            }
            Err(err) => {
                if let Err(rollback_err) = self
                    .conn
                    .execute_batch("ROLLBACK TO SAVEPOINT ledger_unit; RELEASE SAVEPOINT ledger_unit")
                {
                    tracing::error!(error = %rollback_err, "savepoint rollback failed");
                    return Err(err.context(format!("rollback failed: {rollback_err}")));
                }
                Err(err)
            }
        }
    }

    fn insert_run(&self, run: &ReconciliationRun) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO runs(
                    run_id, root_directory, mode, delta_baseline_json, delta_baseline_run_id,
                    baseline_run_id, commit_hash, status, options_json, summary_json,
                    patch_ops_json, errors_json, error_message, config_hash,
                    created_at, completed_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                params![
                    run.run_id.to_string(),
                    run.root_directory,
                    run.mode.as_str(),
                    run.delta_baseline
                        .as_ref()
                        .map(serde_json::to_string)
                        .transpose()?,
                    run.delta_baseline
                        .as_ref()
                        .and_then(|baseline| baseline.run_id)
                        .map(|id| id.to_string()),
                    run.baseline_run_id.map(|id| id.to_string()),
                    run.commit_hash,
                    run.status.as_str(),
                    serde_json::to_string(&run.options)?,
                    serde_json::to_string(&run.summary)?,
                    serde_json::to_string(&run.patch_ops)?,
                    serde_json::to_string(&run.errors)?,
                    run.error_message,
                    run.config_hash,
                    rfc3339(run.created_at)?,
                    run.completed_at.map(rfc3339).transpose()?,
                ],
            )
            .context("failed to insert run")?;
        Ok(())
    }

    fn update_run(&self, run: &ReconciliationRun) -> Result<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE runs SET
                    baseline_run_id = ?2,
                    commit_hash = ?3,
                    status = ?4,
                    summary_json = ?5,
                    patch_ops_json = ?6,
                    errors_json = ?7,
                    error_message = ?8,
                    completed_at = ?9
                 WHERE run_id = ?1",
                params![
                    run.run_id.to_string(),
                    run.baseline_run_id.map(|id| id.to_string()),
                    run.commit_hash,
                    run.status.as_str(),
                    serde_json::to_string(&run.summary)?,
                    serde_json::to_string(&run.patch_ops)?,
                    serde_json::to_string(&run.errors)?,
                    run.error_message,
                    run.completed_at.map(rfc3339).transpose()?,
                ],
            )
            .context("failed to update run")?;
        if changed == 0 {
            return Err(anyhow!("run {} does not exist", run.run_id));
        }
        Ok(())
    }

    fn get_run(&self, run_id: RunId) -> Result<Option<ReconciliationRun>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {RUN_COLUMNS} FROM runs WHERE run_id = ?1"))?;
        let mut rows = stmt.query(params![run_id.to_string()])?;
        match rows.next()? {
            Some(row) => Ok(Some(run_from_row(row)?)),
            None => Ok(None),
        }
    }

    fn list_runs(&self, statuses: &[RunStatus]) -> Result<Vec<ReconciliationRun>> {
        let mut sql = format!("SELECT {RUN_COLUMNS} FROM runs");
        if !statuses.is_empty() {
            let placeholders = (1..=statuses.len())
                .map(|index| format!("?{index}"))
                .collect::<Vec<_>>()
                .join(", ");
            let _ = write!(sql, " WHERE status IN ({placeholders})");
        }
        sql.push_str(" ORDER BY created_at DESC, run_id DESC");

        let values: Vec<String> = statuses
            .iter()
            .map(|status| status.as_str().to_string())
            .collect();
        self.query_runs(&sql, &values)
    }

    fn latest_completed_run_for_commit(
        &self,
        commit_hash: &str,
    ) -> Result<Option<ReconciliationRun>> {
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM runs
             WHERE status = 'completed' AND commit_hash = ?1
             ORDER BY completed_at DESC, run_id DESC
             LIMIT 1"
        );
        Ok(self
            .query_runs(&sql, &[commit_hash.to_string()])?
            .into_iter()
            .next())
    }

    fn delete_run(&self, run_id: RunId) -> Result<()> {
        self.conn
            .execute(
                "DELETE FROM runs WHERE run_id = ?1",
                params![run_id.to_string()],
            )
            .with_context(|| format!("failed to delete run {run_id}"))?;
        Ok(())
    }

    fn insert_test_record(&self, record: &TestRecord) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO test_records(
                    test_record_id, run_id, file_path, test_name, line_number,
                    content_hash, status, inherited_status, recommendation_temp_id,
                    has_atom_annotation, changed_since_baseline, deferred, closure_reason
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    record.test_record_id.to_string(),
                    record.run_id.to_string(),
                    record.file_path,
                    record.test_name,
                    i64::from(record.line_number),
                    record.content_hash,
                    record.status.as_str(),
                    record.inherited_status.map(TestRecordStatus::as_str),
                    record.recommendation_temp_id,
                    bool_to_sql(record.has_atom_annotation),
                    bool_to_sql(record.changed_since_baseline),
                    bool_to_sql(record.deferred),
                    record.closure_reason,
                ],
            )
            .with_context(|| format!("failed to insert test record {}", record.key()))?;
        Ok(())
    }

    fn update_test_record(&self, record: &TestRecord) -> Result<()> {
        self.conn
            .execute(
                "UPDATE test_records SET
                    status = ?2,
                    inherited_status = ?3,
                    recommendation_temp_id = ?4,
                    deferred = ?5,
                    closure_reason = ?6
                 WHERE test_record_id = ?1",
                params![
                    record.test_record_id.to_string(),
                    record.status.as_str(),
                    record.inherited_status.map(TestRecordStatus::as_str),
                    record.recommendation_temp_id,
                    bool_to_sql(record.deferred),
                    record.closure_reason,
                ],
            )
            .with_context(|| format!("failed to update test record {}", record.key()))?;
        Ok(())
    }

    fn list_test_records(&self, run_id: RunId) -> Result<Vec<TestRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {TEST_RECORD_COLUMNS} FROM test_records
             WHERE run_id = ?1
             ORDER BY file_path ASC, test_name ASC"
        ))?;
        let mut rows = stmt.query(params![run_id.to_string()])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(test_record_from_row(row)?);
        }
        Ok(out)
    }

    fn insert_atom_recommendation(&self, recommendation: &AtomRecommendation) -> Result<()> {
        self.conn
            .execute(
                &format!(
                    "INSERT INTO atom_recommendations({ATOM_RECOMMENDATION_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)"
                ),
                params![
                    recommendation.run_id.to_string(),
                    recommendation.temp_id,
                    recommendation.description,
                    recommendation.category,
                    i64::from(recommendation.confidence),
                    recommendation.reasoning,
                    recommendation.source_test.file_path,
                    recommendation.source_test.test_name,
                    i64::from(recommendation.source_test.line_number),
                    serde_json::to_string(&recommendation.observable_outcomes)?,
                    serde_json::to_string(&recommendation.related_docs)?,
                    serde_json::to_string(&recommendation.ambiguity_reasons)?,
                    recommendation.quality_score.map(i64::from),
                    serde_json::to_string(&recommendation.quality_issues)?,
                    recommendation.status.as_str(),
                    recommendation.rejection_reason,
                    recommendation.atom_id.map(|id| id.to_string()),
                    rfc3339(recommendation.created_at)?,
                ],
            )
            .with_context(|| {
                format!(
                    "failed to insert atom recommendation {}",
                    recommendation.temp_id
                )
            })?;
        Ok(())
    }

    fn update_atom_recommendation(&self, recommendation: &AtomRecommendation) -> Result<()> {
        self.conn
            .execute(
                "UPDATE atom_recommendations SET
                    quality_score = ?3,
                    quality_issues_json = ?4,
                    status = ?5,
                    rejection_reason = ?6,
                    atom_id = ?7
                 WHERE run_id = ?1 AND temp_id = ?2",
                params![
                    recommendation.run_id.to_string(),
                    recommendation.temp_id,
                    recommendation.quality_score.map(i64::from),
                    serde_json::to_string(&recommendation.quality_issues)?,
                    recommendation.status.as_str(),
                    recommendation.rejection_reason,
                    recommendation.atom_id.map(|id| id.to_string()),
                ],
            )
            .with_context(|| {
                format!(
                    "failed to update atom recommendation {}",
                    recommendation.temp_id
                )
            })?;
        Ok(())
    }

    fn list_atom_recommendations(&self, run_id: RunId) -> Result<Vec<AtomRecommendation>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ATOM_RECOMMENDATION_COLUMNS} FROM atom_recommendations
             WHERE run_id = ?1
             ORDER BY source_file_path ASC, source_test_name ASC, temp_id ASC"
        ))?;
        let mut rows = stmt.query(params![run_id.to_string()])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(atom_recommendation_from_row(row)?);
        }
        Ok(out)
    }

    fn insert_molecule_recommendation(
        &self,
        recommendation: &MoleculeRecommendation,
    ) -> Result<()> {
        self.conn
            .execute(
                &format!(
                    "INSERT INTO molecule_recommendations({MOLECULE_RECOMMENDATION_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
                ),
                params![
                    recommendation.run_id.to_string(),
                    recommendation.temp_id,
                    recommendation.name,
                    recommendation.description,
                    i64::from(recommendation.confidence),
                    recommendation.reasoning,
                    recommendation.quality_score.map(i64::from),
                    recommendation.status.as_str(),
                    recommendation.rejection_reason,
                    recommendation.molecule_id.map(|id| id.to_string()),
                    rfc3339(recommendation.created_at)?,
                ],
            )
            .with_context(|| {
                format!(
                    "failed to insert molecule recommendation {}",
                    recommendation.temp_id
                )
            })?;
        self.replace_molecule_members(recommendation)
    }

    fn update_molecule_recommendation(
        &self,
        recommendation: &MoleculeRecommendation,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE molecule_recommendations SET
                    quality_score = ?3,
                    status = ?4,
                    rejection_reason = ?5,
                    molecule_id = ?6
                 WHERE run_id = ?1 AND temp_id = ?2",
                params![
                    recommendation.run_id.to_string(),
                    recommendation.temp_id,
                    recommendation.quality_score.map(i64::from),
                    recommendation.status.as_str(),
                    recommendation.rejection_reason,
                    recommendation.molecule_id.map(|id| id.to_string()),
                ],
            )
            .with_context(|| {
                format!(
                    "failed to update molecule recommendation {}",
                    recommendation.temp_id
                )
            })?;
        Ok(())
    }

    fn list_molecule_recommendations(&self, run_id: RunId) -> Result<Vec<MoleculeRecommendation>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {MOLECULE_RECOMMENDATION_COLUMNS} FROM molecule_recommendations
             WHERE run_id = ?1
             ORDER BY temp_id ASC"
        ))?;
        let mut rows = stmt.query(params![run_id.to_string()])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut recommendation = molecule_recommendation_from_row(row)?;
            recommendation.atom_temp_ids =
                self.molecule_members(recommendation.run_id, &recommendation.temp_id)?;
            out.push(recommendation);
        }
        Ok(out)
    }

    fn insert_atom(&self, atom: &Atom) -> Result<()> {
        self.conn
            .execute(
                &format!(
                    "INSERT INTO atoms({ATOM_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
                ),
                params![
                    atom.atom_id.to_string(),
                    atom.description,
                    atom.category,
                    atom.source_test.file_path,
                    atom.source_test.test_name,
                    i64::from(atom.source_test.line_number),
                    atom.status.as_str(),
                    atom.superseded_by.map(|id| id.to_string()),
                    atom.created_from_run_id.map(|id| id.to_string()),
                    rfc3339(atom.created_at)?,
                ],
            )
            .with_context(|| format!("failed to insert atom {}", atom.atom_id))?;
        Ok(())
    }

    fn get_atom(&self, atom_id: AtomId) -> Result<Option<Atom>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {ATOM_COLUMNS} FROM atoms WHERE atom_id = ?1"))?;
        let mut rows = stmt.query(params![atom_id.to_string()])?;
        match rows.next()? {
            Some(row) => Ok(Some(atom_from_row(row)?)),
            None => Ok(None),
        }
    }

    fn update_atom_status(
        &self,
        atom_id: AtomId,
        status: AtomStatus,
        superseded_by: Option<AtomId>,
    ) -> Result<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE atoms SET status = ?2, superseded_by = ?3 WHERE atom_id = ?1",
                params![
                    atom_id.to_string(),
                    status.as_str(),
                    superseded_by.map(|id| id.to_string()),
                ],
            )
            .with_context(|| format!("failed to update atom {atom_id}"))?;
        if changed == 0 {
            return Err(anyhow!("atom {atom_id} does not exist"));
        }
        Ok(())
    }

    fn list_atoms(&self, status: Option<AtomStatus>) -> Result<Vec<Atom>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ATOM_COLUMNS} FROM atoms
             WHERE (?1 IS NULL OR status = ?1)
             ORDER BY created_at ASC, atom_id ASC"
        ))?;
        let mut rows = stmt.query(params![status.map(AtomStatus::as_str)])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(atom_from_row(row)?);
        }
        Ok(out)
    }

    fn insert_molecule(&self, molecule: &Molecule) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO molecules(
                    molecule_id, name, description, created_from_run_id, created_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    molecule.molecule_id.to_string(),
                    molecule.name,
                    molecule.description,
                    molecule.created_from_run_id.map(|id| id.to_string()),
                    rfc3339(molecule.created_at)?,
                ],
            )
            .with_context(|| format!("failed to insert molecule {}", molecule.molecule_id))?;

        for (position, atom_id) in molecule.atom_ids.iter().enumerate() {
            self.conn
                .execute(
                    "INSERT INTO molecule_atoms(molecule_id, atom_id, position)
                     VALUES (?1, ?2, ?3)",
                    params![
                        molecule.molecule_id.to_string(),
                        atom_id.to_string(),
                        i64::try_from(position).map_err(|_| anyhow!("position overflow"))?,
                    ],
                )
                .with_context(|| {
                    format!(
                        "failed to link atom {atom_id} into molecule {}",
                        molecule.molecule_id
                    )
                })?;
        }
        Ok(())
    }

    fn list_molecules_for_run(&self, run_id: RunId) -> Result<Vec<Molecule>> {
        let mut stmt = self.conn.prepare(
            "SELECT molecule_id, name, description, created_from_run_id, created_at
             FROM molecules
             WHERE created_from_run_id = ?1
             ORDER BY created_at ASC, molecule_id ASC",
        )?;
        let mut rows = stmt.query(params![run_id.to_string()])?;
        let mut staged = Vec::new();
        while let Some(row) = rows.next()? {
            let molecule_id = parse_molecule_id(&row.get::<_, String>(0)?)?;
            staged.push(Molecule {
                molecule_id,
                name: row.get(1)?,
                description: row.get(2)?,
                atom_ids: Vec::new(),
                created_from_run_id: row
                    .get::<_, Option<String>>(3)?
                    .map(|value| parse_run_id(&value))
                    .transpose()?,
                created_at: parse_rfc3339(&row.get::<_, String>(4)?)?,
            });
        }
        drop(rows);
        drop(stmt);

        for molecule in &mut staged {
            molecule.atom_ids = self.molecule_atom_ids(molecule.molecule_id)?;
        }
        Ok(staged)
    }

    fn append_event(&self, event: &RunEvent) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO run_events(
                    event_id, run_id, event_type, occurred_at, recorded_at, actor,
                    payload_json, payload_hash, prev_event_hash, event_hash
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    event.event_id.to_string(),
                    event.run_id.to_string(),
                    event.event_type.as_str(),
                    rfc3339(event.occurred_at)?,
                    rfc3339(now_utc())?,
                    event.actor,
                    serde_json::to_string(&event.payload_json)?,
                    event.payload_hash,
                    event.prev_event_hash,
                    event.event_hash,
                ],
            )
            .context("failed to append run event")?;
        Ok(self.conn.last_insert_rowid())
    }

    fn list_events_for_run(&self, run_id: RunId) -> Result<Vec<EventRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT
                event_seq, event_id, run_id, event_type, occurred_at, actor,
                payload_json, payload_hash, prev_event_hash, event_hash
             FROM run_events
             WHERE run_id = ?1
             ORDER BY event_seq ASC",
        )?;

        let mut rows = stmt.query(params![run_id.to_string()])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let event_id_raw: String = row.get(1)?;
            let run_id_raw: String = row.get(2)?;
            let event_type_raw: String = row.get(3)?;
            let payload_raw: String = row.get(6)?;
            out.push(EventRow {
                event_seq: row.get(0)?,
                event: RunEvent {
                    event_id: Ulid::from_str(&event_id_raw)
                        .map_err(|err| anyhow!("invalid event_id ULID: {err}"))?,
                    run_id: parse_run_id(&run_id_raw)?,
                    event_type: RunEventType::parse(&event_type_raw)
                        .ok_or_else(|| anyhow!("unknown event_type: {event_type_raw}"))?,
                    occurred_at: parse_rfc3339(&row.get::<_, String>(4)?)?,
                    actor: row.get(5)?,
                    payload_json: serde_json::from_str(&payload_raw)
                        .context("invalid payload_json")?,
                    payload_hash: row.get(7)?,
                    prev_event_hash: row.get(8)?,
                    event_hash: row.get(9)?,
                },
            });
        }
        Ok(out)
    }

    fn find_review_submission(
        &self,
        run_id: RunId,
        fingerprint: &str,
    ) -> Result<Option<RunResult>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT result_json FROM review_submissions
                 WHERE run_id = ?1 AND fingerprint = ?2",
                params![run_id.to_string(), fingerprint],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|value| serde_json::from_str(&value).context("invalid review result_json"))
            .transpose()
    }

    fn record_review_submission(
        &self,
        run_id: RunId,
        fingerprint: &str,
        result: &RunResult,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO review_submissions(run_id, fingerprint, result_json, submitted_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    run_id.to_string(),
                    fingerprint,
                    serde_json::to_string(result)?,
                    rfc3339(now_utc())?,
                ],
            )
            .context("failed to record review submission")?;
        Ok(())
    }
}

impl ConflictStore for SqliteLedgerStore {
    fn insert_conflict(&self, conflict: &ConflictRecord) -> Result<ConflictInsert> {
        if let Some(existing) = self.find_open_conflict(
            conflict.atom_id_a,
            conflict.atom_id_b,
            conflict.conflict_type,
        )? {
            return Ok(ConflictInsert::Duplicate(existing));
        }

        let (low, high, _) = conflict.pair_key();
        let inserted = self.conn.execute(
            "INSERT INTO conflicts(
                conflict_id, conflict_type, atom_id_a, atom_id_b, pair_low, pair_high,
                test_record_id, similarity_score, description, status, resolution_json,
                created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                conflict.conflict_id.to_string(),
                conflict.conflict_type.as_str(),
                conflict.atom_id_a.to_string(),
                conflict.atom_id_b.to_string(),
                low.to_string(),
                high.to_string(),
                conflict.test_record_id.map(|id| id.to_string()),
                conflict.similarity_score,
                conflict.description,
                conflict.status.as_str(),
                conflict
                    .resolution
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                rfc3339(conflict.created_at)?,
                rfc3339(conflict.updated_at)?,
            ],
        );

        match inserted {
            Ok(_) => Ok(ConflictInsert::Inserted),
            Err(rusqlite::Error::SqliteFailure(failure, _))
                if failure.code == ErrorCode::ConstraintViolation =>
            {
                // Lost a race against another writer for the open-pair index.
                match self.find_open_conflict(
                    conflict.atom_id_a,
                    conflict.atom_id_b,
                    conflict.conflict_type,
                )? {
                    Some(existing) => Ok(ConflictInsert::Duplicate(existing)),
                    None => Err(anyhow!(
                        "conflict insert violated a constraint: {}",
                        failure
                    )),
                }
            }
            Err(err) => Err(anyhow::Error::from(err).context("failed to insert conflict")),
        }
    }

    fn update_conflict(&self, conflict: &ConflictRecord) -> Result<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE conflicts SET
                    status = ?2,
                    resolution_json = ?3,
                    updated_at = ?4
                 WHERE conflict_id = ?1",
                params![
                    conflict.conflict_id.to_string(),
                    conflict.status.as_str(),
                    conflict
                        .resolution
                        .as_ref()
                        .map(serde_json::to_string)
                        .transpose()?,
                    rfc3339(conflict.updated_at)?,
                ],
            )
            .with_context(|| format!("failed to update conflict {}", conflict.conflict_id))?;
        if changed == 0 {
            return Err(anyhow!("conflict {} does not exist", conflict.conflict_id));
        }
        Ok(())
    }

    fn get_conflict(&self, conflict_id: ConflictId) -> Result<Option<ConflictRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {CONFLICT_COLUMNS} FROM conflicts WHERE conflict_id = ?1"
        ))?;
        let mut rows = stmt.query(params![conflict_id.to_string()])?;
        match rows.next()? {
            Some(row) => Ok(Some(conflict_from_row(row)?)),
            None => Ok(None),
        }
    }

    fn find_open_conflict(
        &self,
        atom_id_a: AtomId,
        atom_id_b: AtomId,
        conflict_type: ConflictType,
    ) -> Result<Option<ConflictId>> {
        let (low, high, _) = conflict_pair_key(atom_id_a, atom_id_b, conflict_type);
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT conflict_id FROM conflicts
                 WHERE pair_low = ?1 AND pair_high = ?2 AND conflict_type = ?3
                   AND status = 'open'",
                params![low.to_string(), high.to_string(), conflict_type.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|value| parse_conflict_id(&value)).transpose()
    }

    fn list_conflicts(&self, status: Option<ConflictStatus>) -> Result<Vec<ConflictRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {CONFLICT_COLUMNS} FROM conflicts
             WHERE (?1 IS NULL OR status = ?1)
             ORDER BY created_at ASC, conflict_id ASC"
        ))?;
        let mut rows = stmt.query(params![status.map(ConflictStatus::as_str)])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(conflict_from_row(row)?);
        }
        Ok(out)
    }
}

fn run_from_row(row: &Row<'_>) -> Result<ReconciliationRun> {
    let run_id_raw: String = row.get(0)?;
    let mode_raw: String = row.get(2)?;
    let baseline_raw: Option<String> = row.get(3)?;
    let status_raw: String = row.get(6)?;
    let options_raw: String = row.get(7)?;
    let summary_raw: String = row.get(8)?;
    let patch_ops_raw: String = row.get(9)?;
    let errors_raw: String = row.get(10)?;
    Ok(ReconciliationRun {
        run_id: parse_run_id(&run_id_raw)?,
        root_directory: row.get(1)?,
        mode: RunMode::parse(&mode_raw).ok_or_else(|| anyhow!("unknown run mode: {mode_raw}"))?,
        delta_baseline: baseline_raw
            .map(|value| serde_json::from_str(&value).context("invalid delta_baseline_json"))
            .transpose()?,
        baseline_run_id: row
            .get::<_, Option<String>>(4)?
            .map(|value| parse_run_id(&value))
            .transpose()?,
        commit_hash: row.get(5)?,
        status: RunStatus::parse(&status_raw)
            .ok_or_else(|| anyhow!("unknown run status: {status_raw}"))?,
        options: serde_json::from_str(&options_raw).context("invalid options_json")?,
        summary: serde_json::from_str(&summary_raw).context("invalid summary_json")?,
        patch_ops: serde_json::from_str(&patch_ops_raw).context("invalid patch_ops_json")?,
        errors: serde_json::from_str(&errors_raw).context("invalid errors_json")?,
        error_message: row.get(11)?,
        config_hash: row.get(12)?,
        created_at: parse_rfc3339(&row.get::<_, String>(13)?)?,
        completed_at: row
            .get::<_, Option<String>>(14)?
            .map(|value| parse_rfc3339(&value))
            .transpose()?,
    })
}

fn test_record_from_row(row: &Row<'_>) -> Result<TestRecord> {
    let status_raw: String = row.get(6)?;
    let inherited_raw: Option<String> = row.get(7)?;
    Ok(TestRecord {
        test_record_id: parse_test_record_id(&row.get::<_, String>(0)?)?,
        run_id: parse_run_id(&row.get::<_, String>(1)?)?,
        file_path: row.get(2)?,
        test_name: row.get(3)?,
        line_number: sql_to_u32(row.get(4)?, "line_number")?,
        content_hash: row.get(5)?,
        status: parse_test_record_status(&status_raw)?,
        inherited_status: inherited_raw
            .map(|value| parse_test_record_status(&value))
            .transpose()?,
        recommendation_temp_id: row.get(8)?,
        has_atom_annotation: sql_to_bool(row.get(9)?),
        changed_since_baseline: sql_to_bool(row.get(10)?),
        deferred: sql_to_bool(row.get(11)?),
        closure_reason: row.get(12)?,
    })
}

fn atom_recommendation_from_row(row: &Row<'_>) -> Result<AtomRecommendation> {
    let outcomes_raw: String = row.get(9)?;
    let docs_raw: String = row.get(10)?;
    let ambiguity_raw: String = row.get(11)?;
    let issues_raw: String = row.get(13)?;
    let status_raw: String = row.get(14)?;
    Ok(AtomRecommendation {
        run_id: parse_run_id(&row.get::<_, String>(0)?)?,
        temp_id: row.get(1)?,
        description: row.get(2)?,
        category: row.get(3)?,
        confidence: sql_to_score(row.get(4)?, "confidence")?,
        reasoning: row.get(5)?,
        source_test: SourceTestRef {
            file_path: row.get(6)?,
            test_name: row.get(7)?,
            line_number: sql_to_u32(row.get(8)?, "source_line")?,
        },
        observable_outcomes: serde_json::from_str(&outcomes_raw)
            .context("invalid observable_outcomes_json")?,
        related_docs: serde_json::from_str(&docs_raw).context("invalid related_docs_json")?,
        ambiguity_reasons: serde_json::from_str(&ambiguity_raw)
            .context("invalid ambiguity_reasons_json")?,
        quality_score: row
            .get::<_, Option<i64>>(12)?
            .map(|value| sql_to_score(value, "quality_score"))
            .transpose()?,
        quality_issues: serde_json::from_str(&issues_raw).context("invalid quality_issues_json")?,
        status: parse_recommendation_status(&status_raw)?,
        rejection_reason: row.get(15)?,
        atom_id: row
            .get::<_, Option<String>>(16)?
            .map(|value| parse_atom_id(&value))
            .transpose()?,
        created_at: parse_rfc3339(&row.get::<_, String>(17)?)?,
    })
}

fn molecule_recommendation_from_row(row: &Row<'_>) -> Result<MoleculeRecommendation> {
    let status_raw: String = row.get(7)?;
    Ok(MoleculeRecommendation {
        run_id: parse_run_id(&row.get::<_, String>(0)?)?,
        temp_id: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        atom_temp_ids: Vec::new(),
        confidence: sql_to_score(row.get(4)?, "confidence")?,
        reasoning: row.get(5)?,
        quality_score: row
            .get::<_, Option<i64>>(6)?
            .map(|value| sql_to_score(value, "quality_score"))
            .transpose()?,
        status: parse_recommendation_status(&status_raw)?,
        rejection_reason: row.get(8)?,
        molecule_id: row
            .get::<_, Option<String>>(9)?
            .map(|value| parse_molecule_id(&value))
            .transpose()?,
        created_at: parse_rfc3339(&row.get::<_, String>(10)?)?,
    })
}

fn atom_from_row(row: &Row<'_>) -> Result<Atom> {
    let status_raw: String = row.get(6)?;
    Ok(Atom {
        atom_id: parse_atom_id(&row.get::<_, String>(0)?)?,
        description: row.get(1)?,
        category: row.get(2)?,
        source_test: SourceTestRef {
            file_path: row.get(3)?,
            test_name: row.get(4)?,
            line_number: sql_to_u32(row.get(5)?, "source_line")?,
        },
        status: AtomStatus::parse(&status_raw)
            .ok_or_else(|| anyhow!("unknown atom status: {status_raw}"))?,
        superseded_by: row
            .get::<_, Option<String>>(7)?
            .map(|value| parse_atom_id(&value))
            .transpose()?,
        created_from_run_id: row
            .get::<_, Option<String>>(8)?
            .map(|value| parse_run_id(&value))
            .transpose()?,
        created_at: parse_rfc3339(&row.get::<_, String>(9)?)?,
    })
}

fn conflict_from_row(row: &Row<'_>) -> Result<ConflictRecord> {
    let type_raw: String = row.get(1)?;
    let status_raw: String = row.get(7)?;
    let resolution_raw: Option<String> = row.get(8)?;
    Ok(ConflictRecord {
        conflict_id: parse_conflict_id(&row.get::<_, String>(0)?)?,
        conflict_type: ConflictType::parse(&type_raw)
            .ok_or_else(|| anyhow!("unknown conflict type: {type_raw}"))?,
        atom_id_a: parse_atom_id(&row.get::<_, String>(2)?)?,
        atom_id_b: parse_atom_id(&row.get::<_, String>(3)?)?,
        test_record_id: row
            .get::<_, Option<String>>(4)?
            .map(|value| parse_test_record_id(&value))
            .transpose()?,
        similarity_score: row.get(5)?,
        description: row.get(6)?,
        status: ConflictStatus::parse(&status_raw)
            .ok_or_else(|| anyhow!("unknown conflict status: {status_raw}"))?,
        resolution: resolution_raw
            .map(|value| serde_json::from_str(&value).context("invalid resolution_json"))
            .transpose()?,
        created_at: parse_rfc3339(&row.get::<_, String>(9)?)?,
        updated_at: parse_rfc3339(&row.get::<_, String>(10)?)?,
    })
}

fn ensure_column(conn: &Connection, table: &str, column: &str, sql_type: &str) -> Result<()> {
    if table_has_column(conn, table, column)? {
        return Ok(());
    }

    conn.execute(
        &format!("ALTER TABLE {table} ADD COLUMN {column} {sql_type}"),
        [],
    )
    .with_context(|| format!("failed to add missing column {table}.{column}"))?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .with_context(|| format!("failed to inspect table info for {table}"))?;

    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

fn parse_test_record_status(value: &str) -> Result<TestRecordStatus> {
    TestRecordStatus::parse(value).ok_or_else(|| anyhow!("unknown test record status: {value}"))
}

fn parse_recommendation_status(value: &str) -> Result<RecommendationStatus> {
    RecommendationStatus::parse(value)
        .ok_or_else(|| anyhow!("unknown recommendation status: {value}"))
}

fn parse_run_id(value: &str) -> Result<RunId> {
    let ulid = Ulid::from_str(value).map_err(|err| anyhow!("invalid run_id ULID: {err}"))?;
    Ok(RunId(ulid))
}

fn parse_test_record_id(value: &str) -> Result<TestRecordId> {
    let ulid =
        Ulid::from_str(value).map_err(|err| anyhow!("invalid test_record_id ULID: {err}"))?;
    Ok(TestRecordId(ulid))
}

fn parse_atom_id(value: &str) -> Result<AtomId> {
    let ulid = Ulid::from_str(value).map_err(|err| anyhow!("invalid atom_id ULID: {err}"))?;
    Ok(AtomId(ulid))
}

fn parse_molecule_id(value: &str) -> Result<MoleculeId> {
    let ulid = Ulid::from_str(value).map_err(|err| anyhow!("invalid molecule_id ULID: {err}"))?;
    Ok(MoleculeId(ulid))
}

fn parse_conflict_id(value: &str) -> Result<ConflictId> {
    let ulid = Ulid::from_str(value).map_err(|err| anyhow!("invalid conflict_id ULID: {err}"))?;
    Ok(ConflictId(ulid))
}

fn sql_to_u32(value: i64, field: &str) -> Result<u32> {
    u32::try_from(value).map_err(|_| anyhow!("{field} out of range: {value}"))
}

fn sql_to_score(value: i64, field: &str) -> Result<u8> {
    match u8::try_from(value) {
        Ok(score) if score <= 100 => Ok(score),
        _ => Err(anyhow!("{field} out of range: {value}")),
    }
}

fn bool_to_sql(value: bool) -> i64 {
    i64::from(value)
}

fn sql_to_bool(value: i64) -> bool {
    value != 0
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| anyhow!("invalid datetime format: {err}"))
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| anyhow!("invalid RFC3339 datetime: {err}"))
}

#[cfg(test)]
mod tests {
    use super::SqliteLedgerStore;
    use anyhow::{anyhow, Result};
    use intent_ledger_domain::{
        now_utc, Atom, AtomId, AtomRecommendation, AtomStatus, ConflictId, ConflictRecord,
        ConflictStatus, ConflictType, MoleculeRecommendation, RecommendationStatus,
        ReconciliationRun, RunEvent, RunEventType, RunId, RunMode, RunOptions, RunStatus,
        RunSummary, SourceTestRef, TestRecord, TestRecordId, TestRecordStatus,
    };
    use intent_ledger_store_core::{ConflictInsert, ConflictStore, LedgerStore};
    use proptest::prelude::*;
    use rusqlite::params;
    use serde_json::json;
    use ulid::Ulid;

    fn temp_db_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!(
            "intent-ledger-sqlite-test-{}-{}.sqlite",
            name,
            Ulid::new()
        ))
    }

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    fn fixture_store(name: &str) -> SqliteLedgerStore {
        let store = must(SqliteLedgerStore::open(&temp_db_path(name)));
        must(store.migrate());
        store
    }

    fn fixture_run(run_id: RunId) -> ReconciliationRun {
        ReconciliationRun {
            run_id,
            root_directory: "/repo".to_string(),
            mode: RunMode::FullScan,
            delta_baseline: None,
            baseline_run_id: None,
            commit_hash: Some("c1".to_string()),
            status: RunStatus::Running,
            options: RunOptions::default(),
            summary: RunSummary::default(),
            patch_ops: Vec::new(),
            errors: Vec::new(),
            error_message: None,
            config_hash: None,
            created_at: now_utc(),
            completed_at: None,
        }
    }

    fn fixture_test_record(run_id: RunId, name: &str) -> TestRecord {
        TestRecord {
            test_record_id: TestRecordId::new(),
            run_id,
            file_path: "src/auth/login.test.ts".to_string(),
            test_name: name.to_string(),
            line_number: 4,
            content_hash: "hash".to_string(),
            status: TestRecordStatus::Pending,
            inherited_status: None,
            recommendation_temp_id: None,
            has_atom_annotation: false,
            changed_since_baseline: false,
            deferred: false,
            closure_reason: None,
        }
    }

    fn fixture_recommendation(run_id: RunId, temp_id: &str) -> AtomRecommendation {
        AtomRecommendation {
            run_id,
            temp_id: temp_id.to_string(),
            description: "User can log in with valid credentials".to_string(),
            category: "functional".to_string(),
            confidence: 90,
            reasoning: "asserts session creation".to_string(),
            source_test: SourceTestRef {
                file_path: "src/auth/login.test.ts".to_string(),
                test_name: "logs in".to_string(),
                line_number: 4,
            },
            observable_outcomes: vec!["session cookie is set".to_string()],
            related_docs: Vec::new(),
            ambiguity_reasons: Vec::new(),
            quality_score: None,
            quality_issues: Vec::new(),
            status: RecommendationStatus::Pending,
            rejection_reason: None,
            atom_id: None,
            created_at: now_utc(),
        }
    }

    fn fixture_atom(test_name: &str) -> Atom {
        Atom {
            atom_id: AtomId::new(),
            description: format!("atom for {test_name}"),
            category: "functional".to_string(),
            source_test: SourceTestRef {
                file_path: "src/auth/login.test.ts".to_string(),
                test_name: test_name.to_string(),
                line_number: 1,
            },
            status: AtomStatus::Committed,
            superseded_by: None,
            created_from_run_id: None,
            created_at: now_utc(),
        }
    }

    fn fixture_conflict(a: AtomId, b: AtomId, conflict_type: ConflictType) -> ConflictRecord {
        let now = now_utc();
        ConflictRecord {
            conflict_id: ConflictId::new(),
            conflict_type,
            atom_id_a: a,
            atom_id_b: b,
            test_record_id: None,
            similarity_score: None,
            description: "fixture".to_string(),
            status: ConflictStatus::Open,
            resolution: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn migrate_is_idempotent_and_late_columns_exist() {
        let store = fixture_store("migrate");
        assert!(store.migrate().is_ok());
        assert!(super::table_has_column(&store.conn, "runs", "config_hash").unwrap_or(false));

        let versions: i64 = store
            .conn
            .query_row("SELECT COUNT(*) FROM schema_migrations", [], |row| row.get(0))
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(versions, 1);
    }

    #[test]
    fn run_round_trips_through_update() {
        let store = fixture_store("run-update");
        let run_id = RunId::new();
        let mut run = fixture_run(run_id);
        must(store.insert_run(&run));

        run.status = RunStatus::Completed;
        run.summary.total_orphan_tests = 3;
        run.completed_at = Some(now_utc());
        must(store.update_run(&run));

        let loaded = must(store.get_run(run_id));
        let loaded = match loaded {
            Some(value) => value,
            None => panic!("run missing after update"),
        };
        assert_eq!(loaded.status, RunStatus::Completed);
        assert_eq!(loaded.summary.total_orphan_tests, 3);

        let completed = must(store.latest_completed_run_for_commit("c1"));
        assert_eq!(completed.map(|value| value.run_id), Some(run_id));
        assert!(must(store.list_runs(&[RunStatus::Running])).is_empty());
        assert_eq!(must(store.list_runs(&[])).len(), 1);
    }

    #[test]
    fn run_events_are_append_only() {
        let store = fixture_store("append-only");
        let run_id = RunId::new();
        must(store.insert_run(&fixture_run(run_id)));

        let event = RunEvent {
            event_id: Ulid::new(),
            run_id,
            event_type: RunEventType::RunStarted,
            occurred_at: now_utc(),
            actor: "test".to_string(),
            payload_json: json!({"k": "v"}),
            payload_hash: "payload".to_string(),
            prev_event_hash: None,
            event_hash: "event".to_string(),
        };
        let seq = must(store.append_event(&event));
        assert!(seq > 0);

        let update = store
            .conn
            .execute("UPDATE run_events SET actor = 'x' WHERE event_seq = ?1", params![seq]);
        assert!(update.is_err());
        let delete = store
            .conn
            .execute("DELETE FROM run_events WHERE event_seq = ?1", params![seq]);
        assert!(delete.is_err());

        let events = must(store.list_events_for_run(run_id));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.payload_json, json!({"k": "v"}));
    }

    #[test]
    fn deleting_a_run_cascades_to_owned_rows() {
        let store = fixture_store("cascade");
        let run_id = RunId::new();
        must(store.insert_run(&fixture_run(run_id)));
        must(store.insert_test_record(&fixture_test_record(run_id, "logs in")));
        must(store.insert_atom_recommendation(&fixture_recommendation(run_id, "atom-1")));

        must(store.delete_run(run_id));
        assert!(must(store.list_test_records(run_id)).is_empty());
        assert!(must(store.list_atom_recommendations(run_id)).is_empty());
    }

    #[test]
    fn referenced_atoms_cannot_be_deleted() {
        let store = fixture_store("restrict");
        let run_id = RunId::new();
        must(store.insert_run(&fixture_run(run_id)));
        let atom = fixture_atom("logs in");
        must(store.insert_atom(&atom));

        let mut recommendation = fixture_recommendation(run_id, "atom-1");
        must(store.insert_atom_recommendation(&recommendation));
        recommendation.status = RecommendationStatus::Accepted;
        recommendation.atom_id = Some(atom.atom_id);
        must(store.update_atom_recommendation(&recommendation));

        let delete = store.conn.execute(
            "DELETE FROM atoms WHERE atom_id = ?1",
            params![atom.atom_id.to_string()],
        );
        assert!(delete.is_err());
    }

    #[test]
    fn accepting_without_atom_id_is_rejected() {
        let store = fixture_store("accept-needs-atom");
        let run_id = RunId::new();
        must(store.insert_run(&fixture_run(run_id)));
        let mut recommendation = fixture_recommendation(run_id, "atom-1");
        must(store.insert_atom_recommendation(&recommendation));

        recommendation.status = RecommendationStatus::Accepted;
        assert!(store.update_atom_recommendation(&recommendation).is_err());
    }

    #[test]
    fn molecule_members_must_exist_in_the_run() {
        let store = fixture_store("molecule-members");
        let run_id = RunId::new();
        must(store.insert_run(&fixture_run(run_id)));
        must(store.insert_atom_recommendation(&fixture_recommendation(run_id, "atom-1")));
        must(store.insert_atom_recommendation(&fixture_recommendation(run_id, "atom-2")));

        let molecule = MoleculeRecommendation {
            run_id,
            temp_id: "molecule-1".to_string(),
            name: "Authentication".to_string(),
            description: "login flow".to_string(),
            atom_temp_ids: vec!["atom-1".to_string(), "atom-2".to_string()],
            confidence: 80,
            reasoning: "same file".to_string(),
            quality_score: None,
            status: RecommendationStatus::Pending,
            rejection_reason: None,
            molecule_id: None,
            created_at: now_utc(),
        };
        must(store.insert_molecule_recommendation(&molecule));
        let listed = must(store.list_molecule_recommendations(run_id));
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].atom_temp_ids, molecule.atom_temp_ids);

        let dangling = MoleculeRecommendation {
            temp_id: "molecule-2".to_string(),
            atom_temp_ids: vec!["atom-1".to_string(), "atom-404".to_string()],
            ..molecule
        };
        let result = store.in_transaction(&mut || store.insert_molecule_recommendation(&dangling));
        assert!(result.is_err());
        assert_eq!(must(store.list_molecule_recommendations(run_id)).len(), 1);
    }

    #[test]
    fn failed_transactions_roll_back() {
        let store = fixture_store("rollback");
        let run_id = RunId::new();
        let result = store.in_transaction(&mut || {
            store.insert_run(&fixture_run(run_id))?;
            Err(anyhow!("boom"))
        });
        assert!(result.is_err());
        assert!(must(store.get_run(run_id)).is_none());
    }

    #[test]
    fn open_conflicts_are_unique_per_unordered_pair() {
        let store = fixture_store("conflict-unique");
        let a = fixture_atom("a");
        let b = fixture_atom("b");
        must(store.insert_atom(&a));
        must(store.insert_atom(&b));

        let first = fixture_conflict(a.atom_id, b.atom_id, ConflictType::SameTest);
        assert_eq!(must(store.insert_conflict(&first)), ConflictInsert::Inserted);

        let reversed = fixture_conflict(b.atom_id, a.atom_id, ConflictType::SameTest);
        assert_eq!(
            must(store.insert_conflict(&reversed)),
            ConflictInsert::Duplicate(first.conflict_id)
        );

        let other_type = fixture_conflict(b.atom_id, a.atom_id, ConflictType::Contradiction);
        assert_eq!(
            must(store.insert_conflict(&other_type)),
            ConflictInsert::Inserted
        );

        let mut resolved = first.clone();
        resolved.status = ConflictStatus::Resolved;
        must(store.update_conflict(&resolved));
        assert_eq!(
            must(store.insert_conflict(&reversed)),
            ConflictInsert::Inserted
        );
        assert_eq!(must(store.list_conflicts(Some(ConflictStatus::Open))).len(), 2);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn prop_never_two_open_conflicts_for_a_pair(
            attempts in prop::collection::vec((any::<bool>(), 0u8..4, any::<bool>()), 1..24)
        ) {
            let store = must(SqliteLedgerStore::open(std::path::Path::new(":memory:")));
            must(store.migrate());
            let a = fixture_atom("a");
            let b = fixture_atom("b");
            must(store.insert_atom(&a));
            must(store.insert_atom(&b));

            for (swap, type_code, resolve_after) in attempts {
                let conflict_type = ConflictType::ALL[usize::from(type_code)];
                let (left, right) = if swap { (b.atom_id, a.atom_id) } else { (a.atom_id, b.atom_id) };
                let conflict = fixture_conflict(left, right, conflict_type);
                if must(store.insert_conflict(&conflict)) == ConflictInsert::Inserted && resolve_after {
                    let mut resolved = conflict.clone();
                    resolved.status = ConflictStatus::Resolved;
                    must(store.update_conflict(&resolved));
                }
            }

            let open = must(store.list_conflicts(Some(ConflictStatus::Open)));
            let mut keys: Vec<_> = open.iter().map(ConflictRecord::pair_key).collect();
            let before = keys.len();
            keys.sort();
            keys.dedup();
            prop_assert_eq!(before, keys.len());
        }
    }
}
