use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Instant;

use anyhow::{anyhow, Result};
use crossbeam_channel::{bounded, unbounded};
use intent_ledger_inference::{AtomInferenceOutput, AtomInferenceRequest, InferenceCapability};
use intent_ledger_policy::{Admission, BudgetEnforcer, BudgetOutcome, BudgetStage, BudgetVerdict};

#[derive(Debug, Clone)]
pub struct WorkItem {
    pub key: String,
    pub request: AtomInferenceRequest,
}

#[derive(Debug)]
pub enum WorkResult {
    Completed {
        key: String,
        result: Result<AtomInferenceOutput>,
        budget: BudgetOutcome,
    },
    /// The budget refused the call; the test is deferred.
    Refused { key: String, reason: String },
    /// Taken off the queue after cancellation; never sent to inference.
    Cancelled { key: String },
}

impl WorkResult {
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::Completed { key, .. } | Self::Refused { key, .. } | Self::Cancelled { key } => {
                key
            }
        }
    }
}

/// Bounded inference pool. Every item yields exactly one [`WorkResult`],
/// delivered to `on_result` on the calling thread in completion order.
///
/// A hard budget violation or an `on_result` error raises `cancel`; queued
/// items then come back as [`WorkResult::Cancelled`].
///
/// # Errors
/// Returns the first error from `on_result`, or a thread spawn failure.
pub fn run_pool(
    capability: &dyn InferenceCapability,
    budget: &BudgetEnforcer,
    cancel: &AtomicBool,
    workers: usize,
    items: Vec<WorkItem>,
    on_result: &mut dyn FnMut(WorkResult) -> Result<()>,
) -> Result<()> {
    if items.is_empty() {
        return Ok(());
    }
    let workers = workers.clamp(1, items.len());
    let (job_tx, job_rx) = bounded::<WorkItem>(workers * 2);
    let (result_tx, result_rx) = unbounded::<WorkResult>();

    thread::scope(|scope| {
        thread::Builder::new()
            .name("intent-ledger-feeder".to_string())
            .spawn_scoped(scope, move || {
                for item in items {
                    if job_tx.send(item).is_err() {
                        break;
                    }
                }
            })
            .map_err(|err| anyhow!("failed to spawn feeder thread: {err}"))?;

        for index in 0..workers {
            let job_rx = job_rx.clone();
            let result_tx = result_tx.clone();
            thread::Builder::new()
                .name(format!("intent-ledger-infer-{index}"))
                .spawn_scoped(scope, move || {
                    for item in &job_rx {
                        let result = process(capability, budget, cancel, item);
                        if result_tx.send(result).is_err() {
                            break;
                        }
                    }
                })
                .map_err(|err| anyhow!("failed to spawn inference worker: {err}"))?;
        }
        drop(job_rx);
        drop(result_tx);

        let mut first_error = None;
        for result in &result_rx {
            if first_error.is_some() {
                continue;
            }
            if let Err(err) = on_result(result) {
                cancel.store(true, Ordering::SeqCst);
                first_error = Some(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    })
}

fn process(
    capability: &dyn InferenceCapability,
    budget: &BudgetEnforcer,
    cancel: &AtomicBool,
    item: WorkItem,
) -> WorkResult {
    if cancel.load(Ordering::SeqCst) {
        return WorkResult::Cancelled { key: item.key };
    }
    match budget.admit(BudgetStage::InferAtoms) {
        Admission::Refused(reason) => WorkResult::Refused {
            key: item.key,
            reason,
        },
        Admission::Granted => {
            let started = Instant::now();
            let result = capability.infer_atoms(&item.request);
            let elapsed = started.elapsed();
            let (tokens, duration) = match &result {
                Ok(output) => (output.usage.total_tokens(), output.usage.latency().max(elapsed)),
                Err(_) => (0, elapsed),
            };
            let outcome = budget.record(BudgetStage::InferAtoms, tokens, duration);
            if outcome.verdict == BudgetVerdict::Hard {
                cancel.store(true, Ordering::SeqCst);
            }
            tracing::debug!(test = %item.key, tokens, ok = result.is_ok(), "inference call returned");
            WorkResult::Completed {
                key: item.key,
                result,
                budget: outcome,
            }
        }
    }
}
