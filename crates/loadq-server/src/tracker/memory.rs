//! In-process state store.
//!
//! One mutex over an ordered map keyed by `(db_table, status_slot)` strings, so
//! iteration order matches the byte-wise ordering PostgreSQL uses for the
//! `status_slot` column. Every trait call holds the lock for its whole
//! duration, which makes each call atomic with respect to the others.

use async_trait::async_trait;
use loadq_common::{ExecutionName, LoadKey};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{
    ConditionalDelete, PutOutcome, StateStore, StatusSlot, StoreError, StoreResult,
    TrackingRecord, TransactWrite, PENDING_PREFIX,
};

type Rows = BTreeMap<(String, String), TrackingRecord>;

#[derive(Debug, Default, Clone)]
pub struct MemoryStateStore {
    rows: Arc<Mutex<Rows>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Rows>> {
        self.rows.lock().map_err(|_| StoreError::LockPoisoned)
    }

    /// Every record currently held, in key order.
    pub fn dump(&self) -> StoreResult<Vec<TrackingRecord>> {
        Ok(self.lock()?.values().cloned().collect())
    }
}

fn row_key(key: &LoadKey, slot: &StatusSlot) -> (String, String) {
    (key.partition(), slot.to_string())
}

fn delete_matches(rows: &Rows, delete: &ConditionalDelete) -> bool {
    match rows.get(&row_key(&delete.key.load_key, &delete.key.slot)) {
        None => false,
        Some(existing) => delete
            .expected_execution
            .as_ref()
            .map_or(true, |expected| &existing.execution_name == expected),
    }
}

fn running_mut<'a>(
    rows: &'a mut Rows,
    key: &LoadKey,
    execution: &ExecutionName,
) -> Option<&'a mut TrackingRecord> {
    rows.get_mut(&row_key(key, &StatusSlot::Running))
        .filter(|record| &record.execution_name == execution)
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, key: &LoadKey, slot: &StatusSlot) -> StoreResult<Option<TrackingRecord>> {
        Ok(self.lock()?.get(&row_key(key, slot)).cloned())
    }

    async fn query_pending(
        &self,
        key: &LoadKey,
        limit: Option<usize>,
    ) -> StoreResult<Vec<TrackingRecord>> {
        let rows = self.lock()?;
        let partition = key.partition();
        let start = (partition.clone(), PENDING_PREFIX.to_string());

        Ok(rows
            .range(start..)
            .take_while(|((db_table, slot), _)| {
                db_table == &partition && slot.starts_with(PENDING_PREFIX)
            })
            .take(limit.unwrap_or(usize::MAX))
            .map(|(_, record)| record.clone())
            .collect())
    }

    async fn put_if_absent(&self, record: &TrackingRecord) -> StoreResult<PutOutcome> {
        let mut rows = self.lock()?;
        let key = row_key(&record.load_key, &record.slot);
        if rows.contains_key(&key) {
            return Ok(PutOutcome::Conflict);
        }
        rows.insert(key, record.clone());
        Ok(PutOutcome::Written)
    }

    async fn put(&self, record: &TrackingRecord) -> StoreResult<()> {
        self.lock()?
            .insert(row_key(&record.load_key, &record.slot), record.clone());
        Ok(())
    }

    async fn set_coalesced_count(
        &self,
        key: &LoadKey,
        execution: &ExecutionName,
        count: u32,
    ) -> StoreResult<PutOutcome> {
        let mut rows = self.lock()?;
        Ok(match running_mut(&mut rows, key, execution) {
            Some(record) => {
                record.coalesced_count = Some(count);
                PutOutcome::Written
            }
            None => PutOutcome::Conflict,
        })
    }

    async fn claim_coalesced(
        &self,
        key: &LoadKey,
        execution: &ExecutionName,
        expected: u32,
    ) -> StoreResult<PutOutcome> {
        let mut rows = self.lock()?;
        Ok(
            match running_mut(&mut rows, key, execution)
                .filter(|record| record.coalesced_count == Some(expected))
            {
                Some(record) => {
                    record.coalesced_count = Some(0);
                    PutOutcome::Written
                }
                None => PutOutcome::Conflict,
            },
        )
    }

    async fn transact(&self, write: &TransactWrite) -> StoreResult<PutOutcome> {
        let mut rows = self.lock()?;

        if !write.deletes.iter().all(|delete| delete_matches(&rows, delete)) {
            return Ok(PutOutcome::Conflict);
        }

        let put_key = row_key(&write.put.load_key, &write.put.slot);
        let freed = write
            .deletes
            .iter()
            .any(|delete| row_key(&delete.key.load_key, &delete.key.slot) == put_key);
        if rows.contains_key(&put_key) && !freed {
            return Ok(PutOutcome::Conflict);
        }

        for delete in &write.deletes {
            rows.remove(&row_key(&delete.key.load_key, &delete.key.slot));
        }
        rows.insert(put_key, write.put.clone());

        Ok(PutOutcome::Written)
    }

    async fn delete_if(&self, delete: &ConditionalDelete) -> StoreResult<PutOutcome> {
        let mut rows = self.lock()?;
        if !delete_matches(&rows, delete) {
            return Ok(PutOutcome::Conflict);
        }
        rows.remove(&row_key(&delete.key.load_key, &delete.key.slot));
        Ok(PutOutcome::Written)
    }

    async fn delete_batch(&self, key: &LoadKey, slots: &[StatusSlot]) -> StoreResult<usize> {
        let mut rows = self.lock()?;
        Ok(slots
            .iter()
            .filter_map(|slot| rows.remove(&row_key(key, slot)))
            .count())
    }

    async fn ping(&self) -> StoreResult<()> {
        self.lock().map(|_| ())
    }
}
