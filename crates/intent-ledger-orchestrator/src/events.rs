use anyhow::Result;
use intent_ledger_domain::{
    compute_event_hash, hash_json, now_utc, EventRow, RunEvent, RunEventType, RunId,
};
use intent_ledger_store_core::LedgerStore;
use serde::Serialize;
use serde_json::Value;
use ulid::Ulid;

/// Appends hash-chained events for one run, continuing any existing chain.
pub struct EventLog<'s, S: LedgerStore + ?Sized> {
    store: &'s S,
    run_id: RunId,
    prev_event_hash: Option<String>,
}

impl<'s, S: LedgerStore + ?Sized> EventLog<'s, S> {
    /// Continue the chain after the last persisted event of `run_id`.
    ///
    /// # Errors
    /// Returns an error when existing events cannot be read.
    pub fn open(store: &'s S, run_id: RunId) -> Result<Self> {
        let prev_event_hash = store
            .list_events_for_run(run_id)?
            .last()
            .map(|row| row.event.event_hash.clone());
        Ok(Self {
            store,
            run_id,
            prev_event_hash,
        })
    }

    #[must_use]
    pub fn fresh(store: &'s S, run_id: RunId) -> Self {
        Self {
            store,
            run_id,
            prev_event_hash: None,
        }
    }

    /// # Errors
    /// Returns an error when hashing or persistence fails.
    pub fn emit(&mut self, event_type: RunEventType, actor: &str, payload: Value) -> Result<EventRow> {
        let mut event = RunEvent {
            event_id: Ulid::new(),
            run_id: self.run_id,
            event_type,
            occurred_at: now_utc(),
            actor: actor.to_string(),
            payload_hash: hash_json(&payload)?,
            payload_json: payload,
            prev_event_hash: self.prev_event_hash.clone(),
            event_hash: String::new(),
        };
        event.event_hash = compute_event_hash(&event)?;

        let event_seq = self.store.append_event(&event)?;
        self.prev_event_hash = Some(event.event_hash.clone());
        tracing::debug!(run_id = %self.run_id, event = event_type.as_str(), event_seq, "run event");
        Ok(EventRow { event_seq, event })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainReport {
    pub run_id: RunId,
    pub events: usize,
    pub chain_valid: bool,
    /// Sequence number of the first event that fails verification.
    pub first_invalid_seq: Option<i64>,
}

/// Re-hash every event of a run and check the links between them.
///
/// # Errors
/// Returns an error when events cannot be read or hashed.
pub fn verify_chain<S: LedgerStore + ?Sized>(store: &S, run_id: RunId) -> Result<ChainReport> {
    let events = store.list_events_for_run(run_id)?;
    let mut prev: Option<String> = None;
    for row in &events {
        let mut unsealed = row.event.clone();
        unsealed.event_hash = String::new();
        let intact = row.event.prev_event_hash == prev
            && hash_json(&row.event.payload_json)? == row.event.payload_hash
            && compute_event_hash(&unsealed)? == row.event.event_hash;
        if !intact {
            return Ok(ChainReport {
                run_id,
                events: events.len(),
                chain_valid: false,
                first_invalid_seq: Some(row.event_seq),
            });
        }
        prev = Some(row.event.event_hash.clone());
    }
    Ok(ChainReport {
        run_id,
        events: events.len(),
        chain_valid: true,
        first_invalid_seq: None,
    })
}
