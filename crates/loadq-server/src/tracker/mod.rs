//! Load tracking state store
//!
//! Every `(database, table)` key owns a small set of tracking records: at most
//! one `RUNNING` record for the load currently executing, plus zero or more
//! `PENDING#<execution-name>` records for requests waiting their turn.
//!
//! All mutual exclusion between concurrent admitters and completers is done by
//! the store through conditional writes. A lost race is reported as
//! [`PutOutcome::Conflict`], never as an error; [`StoreError`] is reserved for
//! the store being unreachable or returning data it should not.
//!
//! Two backends implement [`StateStore`]:
//!
//! - [`PgStateStore`]: PostgreSQL `load_tracker` table (production)
//! - [`MemoryStateStore`]: a mutex-guarded ordered map (tests, local runs)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use loadq_common::{ExecutionName, LoadKey};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub mod memory;
pub mod postgres;

pub use memory::MemoryStateStore;
pub use postgres::PgStateStore;

/// Slot literal of the record for the executing load.
pub const RUNNING_SLOT: &str = "RUNNING";

/// Prefix of every queued record's slot.
pub const PENDING_PREFIX: &str = "PENDING#";

/// Errors raised by a state store backend.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("State store query failed: {0}")]
    Database(#[from] sqlx::Error),

    #[error("State store lock poisoned")]
    LockPoisoned,

    #[error("Corrupt tracking record for {db_table}/{status_slot}: {reason}")]
    Corrupt {
        db_table: String,
        status_slot: String,
        reason: String,
    },
}

impl StoreError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Database(e) => matches!(
                e,
                sqlx::Error::Io(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
                    | sqlx::Error::Protocol(_)
                    | sqlx::Error::Tls(_)
            ),
            StoreError::LockPoisoned | StoreError::Corrupt { .. } => false,
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Which slot of a key's partition a record occupies.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StatusSlot {
    Running,
    Pending(ExecutionName),
}

impl StatusSlot {
    pub fn is_running(&self) -> bool {
        matches!(self, StatusSlot::Running)
    }
}

impl fmt::Display for StatusSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusSlot::Running => f.write_str(RUNNING_SLOT),
            StatusSlot::Pending(name) => write!(f, "{}{}", PENDING_PREFIX, name),
        }
    }
}

impl FromStr for StatusSlot {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == RUNNING_SLOT {
            return Ok(StatusSlot::Running);
        }
        let name = s
            .strip_prefix(PENDING_PREFIX)
            .ok_or_else(|| format!("unknown status slot '{}'", s))?;
        name.parse()
            .map(StatusSlot::Pending)
            .map_err(|e: loadq_common::LoadqError| e.to_string())
    }
}

impl Serialize for StatusSlot {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for StatusSlot {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Location of the durable manifest a load executes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PayloadRef {
    pub bucket: String,
    pub key: String,
}

impl PayloadRef {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for PayloadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s3://{}/{}", self.bucket, self.key)
    }
}

/// Primary key of a tracking record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordKey {
    pub load_key: LoadKey,
    pub slot: StatusSlot,
}

impl RecordKey {
    pub fn running(load_key: &LoadKey) -> Self {
        Self {
            load_key: load_key.clone(),
            slot: StatusSlot::Running,
        }
    }
}

/// One row of the tracking table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingRecord {
    pub load_key: LoadKey,
    pub slot: StatusSlot,
    pub execution_name: ExecutionName,
    pub payload: PayloadRef,
    /// Producer identifier (queue ARN) used to re-resolve loader config
    pub source_ref: String,
    /// RUNNING only: PENDING records already folded into this execution
    pub coalesced_count: Option<u32>,
    pub created_at: DateTime<Utc>,
}

impl TrackingRecord {
    pub fn record_key(&self) -> RecordKey {
        RecordKey {
            load_key: self.load_key.clone(),
            slot: self.slot.clone(),
        }
    }

    /// The RUNNING record that replaces this one when it is promoted.
    pub fn promoted(&self) -> TrackingRecord {
        TrackingRecord {
            slot: StatusSlot::Running,
            coalesced_count: None,
            created_at: Utc::now(),
            ..self.clone()
        }
    }

    /// Delete condition matching exactly this record.
    pub fn as_expected_delete(&self) -> ConditionalDelete {
        ConditionalDelete {
            key: self.record_key(),
            expected_execution: Some(self.execution_name.clone()),
        }
    }
}

/// Result of a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Written,
    /// The precondition did not hold; nothing changed.
    Conflict,
}

impl PutOutcome {
    pub fn is_written(self) -> bool {
        matches!(self, PutOutcome::Written)
    }
}

/// Delete that only applies when the record exists and, optionally, still
/// carries the expected execution name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionalDelete {
    pub key: RecordKey,
    pub expected_execution: Option<ExecutionName>,
}

/// All-or-nothing write: every delete must match, then `put` must land in an
/// empty slot.
#[derive(Debug, Clone)]
pub struct TransactWrite {
    pub deletes: Vec<ConditionalDelete>,
    pub put: TrackingRecord,
}

/// Storage contract consumed by the load coordinator.
#[async_trait]
pub trait StateStore: Send + Sync + 'static {
    /// Strongly consistent point read.
    async fn get(&self, key: &LoadKey, slot: &StatusSlot) -> StoreResult<Option<TrackingRecord>>;

    /// PENDING records of `key` in byte-wise slot order, oldest name first.
    async fn query_pending(
        &self,
        key: &LoadKey,
        limit: Option<usize>,
    ) -> StoreResult<Vec<TrackingRecord>>;

    /// Insert only if the `(load_key, slot)` pair is free.
    async fn put_if_absent(&self, record: &TrackingRecord) -> StoreResult<PutOutcome>;

    /// Unconditional upsert.
    async fn put(&self, record: &TrackingRecord) -> StoreResult<()>;

    /// Set the RUNNING record's `coalesced_count` if it still carries `execution`.
    async fn set_coalesced_count(
        &self,
        key: &LoadKey,
        execution: &ExecutionName,
        count: u32,
    ) -> StoreResult<PutOutcome>;

    /// Reset the RUNNING record's `coalesced_count` to zero, but only if it
    /// still carries `execution` and currently equals `expected`.
    async fn claim_coalesced(
        &self,
        key: &LoadKey,
        execution: &ExecutionName,
        expected: u32,
    ) -> StoreResult<PutOutcome>;

    async fn transact(&self, write: &TransactWrite) -> StoreResult<PutOutcome>;

    async fn delete_if(&self, delete: &ConditionalDelete) -> StoreResult<PutOutcome>;

    /// Delete the given slots in one round trip; missing slots are skipped.
    /// Returns how many records were removed.
    async fn delete_batch(&self, key: &LoadKey, slots: &[StatusSlot]) -> StoreResult<usize>;

    /// Connectivity check.
    async fn ping(&self) -> StoreResult<()>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_status_slot_round_trip() {
        let key = LoadKey::new("db1", "orders").unwrap();
        let name = ExecutionName::at(&key, 1_700_000_000_000);
        let slot = StatusSlot::Pending(name.clone());

        assert_eq!(slot.to_string(), format!("PENDING#{}", name));
        assert_eq!(slot.to_string().parse::<StatusSlot>().unwrap(), slot);
        assert_eq!("RUNNING".parse::<StatusSlot>().unwrap(), StatusSlot::Running);
    }

    #[test]
    fn test_status_slot_rejects_unknown() {
        assert!("DONE".parse::<StatusSlot>().is_err());
        assert!("PENDING#garbage".parse::<StatusSlot>().is_err());
    }

    #[test]
    fn test_pending_slots_sort_by_stamp() {
        let key = LoadKey::new("db1", "orders").unwrap();
        let older = StatusSlot::Pending(ExecutionName::at(&key, 10)).to_string();
        let newer = StatusSlot::Pending(ExecutionName::at(&key, 11)).to_string();
        assert!(older < newer);
    }

    #[test]
    fn test_transient_classification() {
        assert!(StoreError::Database(sqlx::Error::PoolTimedOut).is_transient());
        assert!(!StoreError::Database(sqlx::Error::RowNotFound).is_transient());
        assert!(!StoreError::LockPoisoned.is_transient());
    }

    #[test]
    fn test_promoted_record_takes_running_slot() {
        let key = LoadKey::new("db1", "orders").unwrap();
        let name = ExecutionName::at(&key, 5);
        let pending = TrackingRecord {
            load_key: key,
            slot: StatusSlot::Pending(name.clone()),
            execution_name: name.clone(),
            payload: PayloadRef::new("manifests", "orders/a_1"),
            source_ref: "arn:aws:sqs:eu-west-1:1:orders".to_string(),
            coalesced_count: None,
            created_at: Utc::now(),
        };

        let promoted = pending.promoted();
        assert!(promoted.slot.is_running());
        assert_eq!(promoted.execution_name, name);
        assert_eq!(promoted.payload, pending.payload);
        assert_eq!(promoted.coalesced_count, None);
    }
}
