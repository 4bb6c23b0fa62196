//! Load coordination
//!
//! Decides, per `(database, table)` key, whether a load request runs now or
//! waits, and which waiting request runs next. The coordinator keeps no state
//! of its own between calls; everything lives in the [`StateStore`], and
//! every mutation is a conditional write so concurrent callers can only ever
//! lose a race, never corrupt the key.
//!
//! ```text
//! IDLE    --admit-------------------->  RUNNING
//! RUNNING --enqueue------------------>  RUNNING (PENDING += 1)
//! RUNNING --complete, no pending----->  IDLE
//! RUNNING --complete, pending exists->  RUNNING (oldest PENDING promoted)
//! ```
//!
//! PENDING order follows the lexical order of execution names, which embed a
//! millisecond stamp and a random nonce. That is approximately FIFO, not
//! strictly: two requests minted in the same millisecond are ordered by nonce.
//!
//! A request that is queued while the running load retires can land PENDING
//! on a key that has just gone idle. Completion re-reads the queue after
//! retiring and promotes anything it finds, but an enqueue whose write lands
//! after that re-read still waits for the next admission on the key or an
//! operator completion.

use chrono::Utc;
use loadq_common::{ExecutionName, LoadKey};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::tracker::{
    ConditionalDelete, PayloadRef, PutOutcome, RecordKey, StateStore, StatusSlot, StoreError,
    TrackingRecord, TransactWrite,
};

/// Default upper bound on PENDING records folded into one execution.
pub const DEFAULT_MAX_COALESCE: usize = 100;

/// Chunk size for discarding already-executed PENDING records.
pub const DRAIN_DELETE_CHUNK: usize = 10;

/// Chunk size for operator purges of PENDING records.
pub const CLEAR_DELETE_CHUNK: usize = 20;

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{execution} no longer owns the RUNNING slot of {load_key}")]
    NotRunning {
        load_key: LoadKey,
        execution: ExecutionName,
    },
}

impl CoordinatorError {
    pub fn is_transient(&self) -> bool {
        match self {
            CoordinatorError::Store(e) => e.is_transient(),
            CoordinatorError::NotRunning { .. } => false,
        }
    }
}

pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

/// One logical load request.
///
/// The execution name is minted once in [`LoadRequest::new`] and reused on
/// every retry, which is what makes retried admissions idempotent.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadRequest {
    pub load_key: LoadKey,
    pub execution_name: ExecutionName,
    pub payload: PayloadRef,
    pub source_ref: String,
}

impl LoadRequest {
    pub fn new(load_key: LoadKey, payload: PayloadRef, source_ref: impl Into<String>) -> Self {
        let execution_name = ExecutionName::generate(&load_key);
        Self {
            load_key,
            execution_name,
            payload,
            source_ref: source_ref.into(),
        }
    }

    /// The request a tracking record stands for.
    pub fn from_record(record: &TrackingRecord) -> Self {
        Self {
            load_key: record.load_key.clone(),
            execution_name: record.execution_name.clone(),
            payload: record.payload.clone(),
            source_ref: record.source_ref.clone(),
        }
    }

    fn record(&self, slot: StatusSlot) -> TrackingRecord {
        TrackingRecord {
            load_key: self.load_key.clone(),
            slot,
            execution_name: self.execution_name.clone(),
            payload: self.payload.clone(),
            source_ref: self.source_ref.clone(),
            coalesced_count: None,
            created_at: Utc::now(),
        }
    }

    pub fn running_record(&self) -> TrackingRecord {
        self.record(StatusSlot::Running)
    }

    pub fn pending_record(&self) -> TrackingRecord {
        self.record(StatusSlot::Pending(self.execution_name.clone()))
    }
}

/// Outcome of [`LoadCoordinator::begin_or_enqueue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// The caller owns the RUNNING slot and must dispatch now.
    Admitted(ExecutionName),
    /// Another load is running; the request waits as PENDING.
    Queued(ExecutionName),
}

impl Admission {
    pub fn execution_name(&self) -> &ExecutionName {
        match self {
            Admission::Admitted(name) | Admission::Queued(name) => name,
        }
    }
}

/// Payloads to execute under one admitted name.
#[derive(Debug, Clone, PartialEq)]
pub struct Coalesced {
    pub execution_name: ExecutionName,
    /// The admitted payload first, then the folded PENDING payloads oldest first
    pub payloads: Vec<PayloadRef>,
    pub folded: u32,
}

/// Why a completion did not change the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictReason {
    /// The RUNNING slot changed between read and write: overlapping completions.
    PromotionAnomaly,
    /// The completion names an execution that is no longer RUNNING.
    StaleCompletion,
}

impl ConflictReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictReason::PromotionAnomaly => "promotion_anomaly",
            ConflictReason::StaleCompletion => "stale_completion",
        }
    }
}

/// Outcome of completing the RUNNING execution of a key.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    /// No PENDING work left; the key holds no records.
    Idle,
    /// This record now owns the RUNNING slot and must be dispatched.
    Promoted(TrackingRecord),
    Conflict(ConflictReason),
}

/// Outcome of [`LoadCoordinator::requeue_admitted`]. Either way the request
/// is PENDING afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requeue {
    /// The request released the RUNNING slot it held.
    Released,
    /// The request no longer held RUNNING; its PENDING record was written
    /// on its own.
    Reinserted,
}

/// Read-only view of a key.
#[derive(Debug, Clone, Serialize)]
pub struct KeySnapshot {
    pub load_key: LoadKey,
    pub running: Option<TrackingRecord>,
    pub pending: Vec<TrackingRecord>,
}

#[derive(Clone)]
pub struct LoadCoordinator {
    store: Arc<dyn StateStore>,
    max_coalesce: usize,
}

impl LoadCoordinator {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            max_coalesce: DEFAULT_MAX_COALESCE,
        }
    }

    pub fn with_max_coalesce(mut self, max_coalesce: usize) -> Self {
        self.max_coalesce = max_coalesce;
        self
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Claim the RUNNING slot for `request`, or queue it behind the current load.
    #[instrument(skip_all, fields(load_key = %request.load_key, execution = %request.execution_name))]
    pub async fn begin_or_enqueue(&self, request: &LoadRequest) -> CoordinatorResult<Admission> {
        let name = request.execution_name.clone();

        if self.store.put_if_absent(&request.running_record()).await?.is_written() {
            // An earlier attempt may have queued this request before the key
            // went idle; it must not be folded into its own execution.
            let own = [StatusSlot::Pending(name.clone())];
            if self.store.delete_batch(&request.load_key, &own).await? > 0 {
                debug!("Removed PENDING record left by an earlier attempt");
            }
            info!("Load admitted");
            return Ok(Admission::Admitted(name));
        }

        // A retry whose first admission write landed before the error surfaced.
        let running = self
            .store
            .get(&request.load_key, &StatusSlot::Running)
            .await?;
        if running.is_some_and(|r| r.execution_name == name) {
            debug!("RUNNING slot already held by this request");
            return Ok(Admission::Admitted(name));
        }

        self.store.put(&request.pending_record()).await?;
        info!("Load queued behind running execution");
        Ok(Admission::Queued(name))
    }

    /// Fold the current PENDING records into the admitted execution.
    ///
    /// The folded records are not deleted here; completion discards them via
    /// the `coalesced_count` stored on the RUNNING record.
    #[instrument(skip_all, fields(load_key = %request.load_key, execution = %request.execution_name))]
    pub async fn coalesce_pending(&self, request: &LoadRequest) -> CoordinatorResult<Coalesced> {
        let pending = self
            .store
            .query_pending(&request.load_key, Some(self.max_coalesce))
            .await?;
        let folded = u32::try_from(pending.len()).unwrap_or(u32::MAX);

        let outcome = self
            .store
            .set_coalesced_count(&request.load_key, &request.execution_name, folded)
            .await?;
        if !outcome.is_written() {
            return Err(CoordinatorError::NotRunning {
                load_key: request.load_key.clone(),
                execution: request.execution_name.clone(),
            });
        }

        let payloads = std::iter::once(request.payload.clone())
            .chain(pending.into_iter().map(|record| record.payload))
            .collect();

        if folded > 0 {
            info!(folded, "Coalesced pending loads into execution");
        }

        Ok(Coalesced {
            execution_name: request.execution_name.clone(),
            payloads,
            folded,
        })
    }

    /// Discard the PENDING records folded into the RUNNING execution.
    ///
    /// Returns how many records were deleted.
    #[instrument(skip_all, fields(load_key = %key))]
    pub async fn drain_coalesced(&self, key: &LoadKey) -> CoordinatorResult<usize> {
        match self.store.get(key, &StatusSlot::Running).await? {
            Some(running) => self.drain_running(&running).await,
            None => Ok(0),
        }
    }

    async fn drain_running(&self, running: &TrackingRecord) -> CoordinatorResult<usize> {
        let folded = running.coalesced_count.unwrap_or(0);
        if folded == 0 {
            return Ok(0);
        }

        // Claim the count first so an overlapping completion cannot drain the
        // same key twice.
        let claimed = self
            .store
            .claim_coalesced(&running.load_key, &running.execution_name, folded)
            .await?;
        if !claimed.is_written() {
            debug!(folded, "Coalesced records already claimed");
            return Ok(0);
        }

        let doomed: Vec<StatusSlot> = self
            .store
            .query_pending(&running.load_key, Some(folded as usize))
            .await?
            .into_iter()
            .map(|record| record.slot)
            .collect();

        let mut deleted = 0;
        for chunk in doomed.chunks(DRAIN_DELETE_CHUNK) {
            deleted += self.store.delete_batch(&running.load_key, chunk).await?;
        }

        info!(folded, deleted, "Drained coalesced pending records");
        Ok(deleted)
    }

    /// Retire the RUNNING execution and promote the oldest PENDING request.
    #[instrument(skip_all, fields(load_key = %key))]
    pub async fn complete_and_promote(&self, key: &LoadKey) -> CoordinatorResult<Completion> {
        self.complete(key, None).await
    }

    /// Like [`complete_and_promote`](Self::complete_and_promote), but only if
    /// `execution` is the load currently RUNNING.
    #[instrument(skip_all, fields(load_key = %key, execution = %execution))]
    pub async fn complete_execution(
        &self,
        key: &LoadKey,
        execution: &ExecutionName,
    ) -> CoordinatorResult<Completion> {
        self.complete(key, Some(execution.base())).await
    }

    async fn complete(
        &self,
        key: &LoadKey,
        expected: Option<ExecutionName>,
    ) -> CoordinatorResult<Completion> {
        let running = self.store.get(key, &StatusSlot::Running).await?;

        if let (Some(expected), Some(current)) = (&expected, &running) {
            if &current.execution_name != expected {
                warn!(
                    running = %current.execution_name,
                    completed = %expected,
                    "Ignoring completion for an execution that is not running"
                );
                return Ok(Completion::Conflict(ConflictReason::StaleCompletion));
            }
        }

        if let Some(running) = &running {
            self.drain_running(running).await?;
        }

        let next = self.store.query_pending(key, Some(1)).await?.into_iter().next();

        match (running, next) {
            (None, None) => {
                debug!("Nothing running and nothing pending");
                Ok(Completion::Idle)
            }
            (Some(running), None) => {
                let outcome = self.store.delete_if(&running.as_expected_delete()).await?;
                if outcome.is_written() {
                    // An enqueue racing the retirement may have landed since
                    // the queue was read.
                    if let Some(late) = self.store.query_pending(key, Some(1)).await?.pop() {
                        info!(
                            execution = %running.execution_name,
                            next = %late.execution_name,
                            "Pending load arrived while retiring"
                        );
                        return self.promote(None, late).await;
                    }
                    info!(execution = %running.execution_name, "Key is idle");
                    Ok(Completion::Idle)
                } else {
                    warn!(
                        execution = %running.execution_name,
                        "RUNNING record changed while retiring it"
                    );
                    Ok(Completion::Conflict(ConflictReason::PromotionAnomaly))
                }
            }
            (running, Some(next)) => self.promote(running, next).await,
        }
    }

    async fn promote(
        &self,
        running: Option<TrackingRecord>,
        next: TrackingRecord,
    ) -> CoordinatorResult<Completion> {
        if running.is_none() {
            debug!(next = %next.execution_name, "Promoting pending record on an idle key");
        }

        let deletes = running
            .iter()
            .map(TrackingRecord::as_expected_delete)
            .chain(std::iter::once(next.as_expected_delete()))
            .collect();
        let promoted = next.promoted();
        let write = TransactWrite {
            deletes,
            put: promoted.clone(),
        };

        match self.store.transact(&write).await? {
            PutOutcome::Written => {
                info!(execution = %promoted.execution_name, "Promoted pending load");
                Ok(Completion::Promoted(promoted))
            }
            PutOutcome::Conflict => {
                warn!(
                    next = %next.execution_name,
                    "Promotion lost a race with an overlapping completion"
                );
                Ok(Completion::Conflict(ConflictReason::PromotionAnomaly))
            }
        }
    }

    /// Release the RUNNING slot held by `request` and queue it again.
    ///
    /// Used when dispatching an admitted or promoted execution fails, so the
    /// request is retained as PENDING instead of being lost. If the slot was
    /// already taken from it (an operator completion landing mid-dispatch),
    /// the PENDING record is written unconditionally.
    #[instrument(skip_all, fields(load_key = %request.load_key, execution = %request.execution_name))]
    pub async fn requeue_admitted(&self, request: &LoadRequest) -> CoordinatorResult<Requeue> {
        let write = TransactWrite {
            deletes: vec![ConditionalDelete {
                key: RecordKey::running(&request.load_key),
                expected_execution: Some(request.execution_name.clone()),
            }],
            put: request.pending_record(),
        };

        match self.store.transact(&write).await? {
            PutOutcome::Written => {
                info!("Returned admitted load to the pending queue");
                Ok(Requeue::Released)
            }
            PutOutcome::Conflict => {
                self.store.put(&request.pending_record()).await?;
                warn!("RUNNING slot no longer held; queued load as PENDING");
                Ok(Requeue::Reinserted)
            }
        }
    }

    /// Delete every PENDING record of `key`.
    #[instrument(skip_all, fields(load_key = %key))]
    pub async fn clear_pending(&self, key: &LoadKey) -> CoordinatorResult<usize> {
        let slots: Vec<StatusSlot> = self
            .store
            .query_pending(key, None)
            .await?
            .into_iter()
            .map(|record| record.slot)
            .collect();

        let mut deleted = 0;
        for chunk in slots.chunks(CLEAR_DELETE_CHUNK) {
            deleted += self.store.delete_batch(key, chunk).await?;
        }

        info!(deleted, "Cleared pending loads");
        Ok(deleted)
    }

    pub async fn running(&self, key: &LoadKey) -> CoordinatorResult<Option<TrackingRecord>> {
        Ok(self.store.get(key, &StatusSlot::Running).await?)
    }

    pub async fn snapshot(&self, key: &LoadKey) -> CoordinatorResult<KeySnapshot> {
        let running = self.store.get(key, &StatusSlot::Running).await?;
        let pending = self.store.query_pending(key, None).await?;
        Ok(KeySnapshot {
            load_key: key.clone(),
            running,
            pending,
        })
    }
}
