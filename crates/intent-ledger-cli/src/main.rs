#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use intent_ledger_config::{load_config_or_default, ConfigEnvelope, DEFAULT_CONFIG_FILE};
use intent_ledger_domain::{
    AtomId, ConflictId, ConflictStatus, ConflictType, DeltaBaseline, ResolutionAction,
    ReviewSubmission, RunId, RunMode, RunOptions, RunResult, TestRecordId,
};
use intent_ledger_inference::build_capability;
use intent_ledger_orchestrator::{
    ConflictService, EngineSettings, JsonFileEvidenceSource, NewConflict, ResolveRequest,
    RunOrchestrator, StartRequest,
};
use intent_ledger_policy::EvidenceWeightedScorer;
use intent_ledger_store_core::LedgerStore;
use intent_ledger_store_sqlite::SqliteLedgerStore;
use serde_json::Value;

mod logging;

const DEFAULT_EVIDENCE_FILE: &str = "evidence.json";

#[derive(Debug, Parser)]
#[command(name = "intent-ledger")]
#[command(about = "Reconcile tests into a requirements ledger with SQLite audit events")]
struct Cli {
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
    /// Overrides `database_path` from the configuration file.
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    /// Print full JSON documents instead of key=value lines.
    #[arg(long, global = true, default_value_t = false)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Run(RunArgs),
    Conflict(ConflictArgs),
}

#[derive(Debug, Args)]
struct RunArgs {
    #[command(subcommand)]
    command: RunSubcommand,
}

#[derive(Debug, Subcommand)]
enum RunSubcommand {
    Start(StartArgs),
    Review {
        #[arg(long)]
        run_id: String,
        /// JSON file holding `atom_decisions` and `molecule_decisions`.
        #[arg(long)]
        decisions: PathBuf,
        #[arg(long)]
        comment: Option<String>,
        #[arg(long, default_value = DEFAULT_EVIDENCE_FILE)]
        evidence: PathBuf,
    },
    Show {
        #[arg(long)]
        run_id: String,
    },
    Active,
    Fail {
        #[arg(long)]
        run_id: String,
        #[arg(long)]
        reason: String,
    },
    Resume {
        #[arg(long)]
        run_id: String,
        #[arg(long, default_value = DEFAULT_EVIDENCE_FILE)]
        evidence: PathBuf,
    },
    Verify {
        #[arg(long)]
        run_id: String,
    },
}

#[derive(Debug, Args)]
struct StartArgs {
    #[arg(long)]
    root: String,
    #[arg(long, default_value = "full-scan")]
    mode: String,
    /// Evidence inventory JSON; relative paths resolve against `--root`.
    #[arg(long, default_value = DEFAULT_EVIDENCE_FILE)]
    evidence: PathBuf,
    #[arg(long)]
    baseline_run: Option<String>,
    #[arg(long)]
    baseline_commit: Option<String>,
    #[arg(long)]
    commit: Option<String>,
    #[arg(long)]
    threshold: Option<u8>,
    #[arg(long = "include")]
    include_paths: Vec<String>,
    #[arg(long = "exclude")]
    exclude_paths: Vec<String>,
    #[arg(long, default_value_t = false)]
    require_review: bool,
    #[arg(long, default_value_t = false)]
    force_interrupt: bool,
    #[arg(long)]
    max_tests: Option<usize>,
    #[arg(long, default_value_t = false)]
    detect_conflicts: bool,
}

#[derive(Debug, Args)]
struct ConflictArgs {
    #[command(subcommand)]
    command: ConflictSubcommand,
}

#[derive(Debug, Subcommand)]
enum ConflictSubcommand {
    Create {
        #[arg(long = "type")]
        conflict_type: String,
        #[arg(long)]
        atom_a: String,
        #[arg(long)]
        atom_b: String,
        #[arg(long)]
        description: String,
        #[arg(long)]
        test_record: Option<String>,
        #[arg(long)]
        score: Option<f64>,
    },
    Resolve {
        #[arg(long)]
        conflict_id: String,
        #[arg(long)]
        action: String,
        #[arg(long)]
        by: String,
        #[arg(long)]
        reason: Option<String>,
        #[arg(long)]
        artifact: Option<String>,
    },
    Escalate {
        #[arg(long)]
        conflict_id: String,
    },
    Show {
        #[arg(long)]
        conflict_id: String,
    },
    List {
        #[arg(long)]
        status: Option<String>,
    },
    Metrics,
    Scan,
}

/// Everything a command needs once configuration is loaded.
struct Session {
    config: ConfigEnvelope,
    store: SqliteLedgerStore,
    json: bool,
}

impl Session {
    fn conflicts(&self) -> ConflictService<'_> {
        ConflictService::new(
            &self.store,
            self.config.config.conflicts.semantic_overlap_threshold,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config_or_default(&cli.config)?;
    logging::init_tracing(&config.config.logging)?;

    let db_path = cli
        .db
        .clone()
        .unwrap_or_else(|| PathBuf::from(&config.config.database_path));
    let store = SqliteLedgerStore::open(&db_path)?;
    store.migrate()?;
    tracing::debug!(db = %db_path.display(), config_hash = %config.normalized_hash, "ledger opened");

    let session = Session {
        config,
        store,
        json: cli.json,
    };
    match cli.command {
        Commands::Run(args) => run_command(&session, args),
        Commands::Conflict(args) => conflict_command(&session, args),
    }
}

fn run_command(session: &Session, args: RunArgs) -> Result<()> {
    match args.command {
        RunSubcommand::Start(start) => {
            let request = start_request(session, &start)?;
            let result = with_orchestrator(session, &start.evidence, |orchestrator| {
                Ok(orchestrator.start(request)?)
            })?;
            print_result(session, &result)
        }
        RunSubcommand::Review {
            run_id,
            decisions,
            comment,
            evidence,
        } => {
            let run_id = RunId::parse(&run_id)?;
            let mut submission = read_submission(&decisions)?;
            if comment.is_some() {
                submission.comment = comment;
            }
            let result = with_orchestrator(session, &evidence, |orchestrator| {
                Ok(orchestrator.submit_review(run_id, &submission)?)
            })?;
            print_result(session, &result)
        }
        RunSubcommand::Show { run_id } => {
            let run_id = RunId::parse(&run_id)?;
            let details = with_orchestrator(session, Path::new(DEFAULT_EVIDENCE_FILE), |orchestrator| {
                Ok(orchestrator.get_run_details(run_id)?)
            })?;
            println!("{}", serde_json::to_string_pretty(&details)?);
            Ok(())
        }
        RunSubcommand::Active => {
            let runs = with_orchestrator(session, Path::new(DEFAULT_EVIDENCE_FILE), |orchestrator| {
                Ok(orchestrator.get_active_runs()?)
            })?;
            for run in runs {
                if session.json {
                    println!("{}", serde_json::to_string(&run)?);
                } else {
                    println!(
                        "run_id={} status={} mode={} root={}",
                        run.run_id,
                        run.status.as_str(),
                        run.mode.as_str(),
                        run.root_directory
                    );
                }
            }
            Ok(())
        }
        RunSubcommand::Fail { run_id, reason } => {
            let run_id = RunId::parse(&run_id)?;
            let result = with_orchestrator(session, Path::new(DEFAULT_EVIDENCE_FILE), |orchestrator| {
                Ok(orchestrator.mark_failed(run_id, &reason)?)
            })?;
            print_result(session, &result)
        }
        RunSubcommand::Resume { run_id, evidence } => {
            let run_id = RunId::parse(&run_id)?;
            let result = with_orchestrator(session, &evidence, |orchestrator| {
                Ok(orchestrator.resume(run_id)?)
            })?;
            print_result(session, &result)
        }
        RunSubcommand::Verify { run_id } => {
            let run_id = RunId::parse(&run_id)?;
            let report = with_orchestrator(session, Path::new(DEFAULT_EVIDENCE_FILE), |orchestrator| {
                Ok(orchestrator.verify_event_chain(run_id)?)
            })?;
            if session.json {
                println!("{}", serde_json::to_string(&report)?);
            } else {
                println!(
                    "run_id={} events={} chain_valid={}",
                    report.run_id, report.events, report.chain_valid
                );
            }
            Ok(())
        }
    }
}

fn conflict_command(session: &Session, args: ConflictArgs) -> Result<()> {
    let service = session.conflicts();
    match args.command {
        ConflictSubcommand::Create {
            conflict_type,
            atom_a,
            atom_b,
            description,
            test_record,
            score,
        } => {
            let outcome = service.create(NewConflict {
                conflict_type: parse_conflict_type(&conflict_type)?,
                atom_id_a: AtomId::parse(&atom_a)?,
                atom_id_b: AtomId::parse(&atom_b)?,
                description,
                test_record_id: test_record.as_deref().map(TestRecordId::parse).transpose()?,
                similarity_score: score,
            })?;
            let record = outcome.record();
            if session.json {
                println!("{}", serde_json::to_string(record)?);
            } else {
                println!(
                    "conflict_id={} status={} created={}",
                    record.conflict_id,
                    record.status.as_str(),
                    outcome.is_created()
                );
            }
        }
        ConflictSubcommand::Resolve {
            conflict_id,
            action,
            by,
            reason,
            artifact,
        } => {
            let conflict_id = ConflictId::parse(&conflict_id)?;
            let action = ResolutionAction::parse(&action).ok_or_else(|| {
                anyhow!("invalid action '{action}'; use supersede_a, supersede_b, split_test, reject_a, reject_b or clarify")
            })?;
            let record = service.resolve(
                conflict_id,
                ResolveRequest {
                    action,
                    resolved_by: by,
                    reason,
                    clarification_artifact_id: artifact,
                },
            )?;
            print_conflict(session, &record)?;
        }
        ConflictSubcommand::Escalate { conflict_id } => {
            let record = service.escalate(ConflictId::parse(&conflict_id)?)?;
            print_conflict(session, &record)?;
        }
        ConflictSubcommand::Show { conflict_id } => {
            let record = service.get(ConflictId::parse(&conflict_id)?)?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        ConflictSubcommand::List { status } => {
            let status = status
                .as_deref()
                .map(|value| {
                    ConflictStatus::parse(value).ok_or_else(|| {
                        anyhow!("invalid status '{value}'; use open, resolved or escalated")
                    })
                })
                .transpose()?;
            for record in service.list(status)? {
                print_conflict(session, &record)?;
            }
        }
        ConflictSubcommand::Metrics => {
            let metrics = service.get_metrics()?;
            if session.json {
                println!("{}", serde_json::to_string(&metrics)?);
            } else {
                println!(
                    "total={} open={} resolved={} escalated={}",
                    metrics.total, metrics.open, metrics.resolved, metrics.escalated
                );
                for (conflict_type, counts) in &metrics.by_type {
                    println!(
                        "type={conflict_type} total={} open={} resolved={} escalated={}",
                        counts.total, counts.open, counts.resolved, counts.escalated
                    );
                }
            }
        }
        ConflictSubcommand::Scan => {
            let report = service.scan()?;
            if session.json {
                println!("{}", serde_json::to_string(&report)?);
            } else {
                println!(
                    "examined_pairs={} created={} duplicates={}",
                    report.examined_pairs, report.created, report.duplicates
                );
            }
        }
    }
    Ok(())
}

fn with_orchestrator<T>(
    session: &Session,
    evidence: &Path,
    action: impl FnOnce(&RunOrchestrator<'_>) -> Result<T>,
) -> Result<T> {
    let capability = build_capability(&session.config.config.inference)?;
    let evidence = JsonFileEvidenceSource::new(evidence);
    let scorer = EvidenceWeightedScorer;
    let orchestrator = RunOrchestrator::new(
        &session.store,
        &evidence,
        capability.as_ref(),
        &scorer,
        EngineSettings::from_envelope(&session.config),
    );
    action(&orchestrator)
}

fn start_request(session: &Session, args: &StartArgs) -> Result<StartRequest> {
    let mode = RunMode::parse(&args.mode)
        .ok_or_else(|| anyhow!("invalid mode '{}'; use 'full-scan' or 'delta'", args.mode))?;
    let baseline_run = args.baseline_run.as_deref().map(RunId::parse).transpose()?;
    let delta_baseline = (baseline_run.is_some() || args.baseline_commit.is_some()).then(|| {
        DeltaBaseline {
            run_id: baseline_run,
            commit_hash: args.baseline_commit.clone(),
        }
    });

    Ok(StartRequest {
        root_directory: args.root.clone(),
        mode,
        delta_baseline,
        commit_hash: args.commit.clone(),
        options: RunOptions {
            quality_threshold: args
                .threshold
                .unwrap_or(session.config.config.quality_threshold),
            include_paths: args.include_paths.clone(),
            exclude_paths: args.exclude_paths.clone(),
            require_review: args.require_review,
            force_interrupt_on_quality_fail: args.force_interrupt,
            max_tests: args.max_tests,
            detect_conflicts: args.detect_conflicts,
        },
    })
}

fn read_submission(path: &Path) -> Result<ReviewSubmission> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read review decisions {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("invalid review decisions {}", path.display()))
}

fn parse_conflict_type(input: &str) -> Result<ConflictType> {
    ConflictType::parse(input).ok_or_else(|| {
        let known = ConflictType::ALL
            .iter()
            .map(|kind| kind.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        anyhow!("invalid conflict type '{input}'; use one of {known}")
    })
}

fn print_result(session: &Session, result: &RunResult) -> Result<()> {
    if session.json {
        println!("{}", serde_json::to_string(result)?);
        return Ok(());
    }

    let summary = &result.summary;
    println!(
        "run_id={} status={} total_tests={} skipped_closed={} atoms_proposed={} atoms_accepted={} atoms_rejected={} molecules_proposed={} molecules_accepted={}",
        result.run_id,
        result.status.as_str(),
        summary.total_tests,
        summary.skipped_closed,
        summary.atoms_proposed,
        summary.atoms_accepted,
        summary.atoms_rejected,
        summary.molecules_proposed,
        summary.molecules_accepted
    );
    if let Some(pending) = &result.pending_review {
        println!(
            "pending_atoms={} pending_molecules={} pass_count={} fail_count={} reason={}",
            pending.pending_atoms.len(),
            pending.pending_molecules.len(),
            pending.summary.pass_count,
            pending.summary.fail_count,
            pending.reason
        );
    }
    if let Some(error) = &result.error_message {
        println!("error={}", Value::String(error.clone()));
    }
    Ok(())
}

fn print_conflict(session: &Session, record: &intent_ledger_domain::ConflictRecord) -> Result<()> {
    if session.json {
        println!("{}", serde_json::to_string(record)?);
    } else {
        println!(
            "conflict_id={} type={} status={} atom_a={} atom_b={}",
            record.conflict_id,
            record.conflict_type.as_str(),
            record.status.as_str(),
            record.atom_id_a,
            record.atom_id_b
        );
    }
    Ok(())
}
