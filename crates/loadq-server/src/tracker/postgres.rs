//! PostgreSQL state store over the `load_tracker` table.
//!
//! Conditional inserts use `ON CONFLICT DO NOTHING` and report a conflict when
//! no row was affected. [`StateStore::transact`] runs inside one SQL
//! transaction and rolls back on the first statement whose condition is not
//! met. Row locks taken by the deletes serialize overlapping transactions on
//! the same key, so the loser re-evaluates against committed state and sees
//! zero affected rows.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use loadq_common::{ExecutionName, LoadKey};
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{debug, instrument};

use super::{
    ConditionalDelete, PayloadRef, PutOutcome, StateStore, StatusSlot, StoreError, StoreResult,
    TrackingRecord, TransactWrite, RUNNING_SLOT,
};

const SELECT_COLUMNS: &str = "db_table, status_slot, execution_name, manifest_bucket, \
     manifest_key, source_ref, coalesced_count, created_at";

#[derive(Debug, sqlx::FromRow)]
struct TrackerRow {
    db_table: String,
    status_slot: String,
    execution_name: String,
    manifest_bucket: String,
    manifest_key: String,
    source_ref: String,
    coalesced_count: Option<i32>,
    created_at: DateTime<Utc>,
}

impl TryFrom<TrackerRow> for TrackingRecord {
    type Error = StoreError;

    fn try_from(row: TrackerRow) -> Result<Self, Self::Error> {
        let corrupt = |reason: String| StoreError::Corrupt {
            db_table: row.db_table.clone(),
            status_slot: row.status_slot.clone(),
            reason,
        };

        let load_key: LoadKey = row.db_table.parse().map_err(|e| corrupt(format!("{}", e)))?;
        let slot: StatusSlot = row.status_slot.parse().map_err(corrupt)?;
        let execution_name: ExecutionName = row
            .execution_name
            .parse()
            .map_err(|e| corrupt(format!("{}", e)))?;
        let coalesced_count = row
            .coalesced_count
            .map(u32::try_from)
            .transpose()
            .map_err(|_| corrupt("negative coalesced_count".to_string()))?;

        Ok(TrackingRecord {
            load_key,
            slot,
            execution_name,
            payload: PayloadRef::new(row.manifest_bucket, row.manifest_key),
            source_ref: row.source_ref,
            coalesced_count,
            created_at: row.created_at,
        })
    }
}

fn count_param(count: u32) -> i32 {
    i32::try_from(count).unwrap_or(i32::MAX)
}

#[derive(Debug, Clone)]
pub struct PgStateStore {
    pool: PgPool,
}

impl PgStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn delete_in(
        tx: &mut Transaction<'_, Postgres>,
        delete: &ConditionalDelete,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM load_tracker
            WHERE db_table = $1
              AND status_slot = $2
              AND ($3::TEXT IS NULL OR execution_name = $3)
            "#,
        )
        .bind(delete.key.load_key.partition())
        .bind(delete.key.slot.to_string())
        .bind(delete.expected_execution.as_ref().map(|name| name.to_string()))
        .execute(&mut **tx)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl StateStore for PgStateStore {
    #[instrument(skip_all, fields(load_key = %key, slot = %slot))]
    async fn get(&self, key: &LoadKey, slot: &StatusSlot) -> StoreResult<Option<TrackingRecord>> {
        let sql = format!(
            "SELECT {} FROM load_tracker WHERE db_table = $1 AND status_slot = $2",
            SELECT_COLUMNS
        );
        sqlx::query_as::<_, TrackerRow>(&sql)
            .bind(key.partition())
            .bind(slot.to_string())
            .fetch_optional(&self.pool)
            .await?
            .map(TrackingRecord::try_from)
            .transpose()
    }

    #[instrument(skip_all, fields(load_key = %key))]
    async fn query_pending(
        &self,
        key: &LoadKey,
        limit: Option<usize>,
    ) -> StoreResult<Vec<TrackingRecord>> {
        let sql = format!(
            "SELECT {} FROM load_tracker \
             WHERE db_table = $1 AND status_slot LIKE 'PENDING#%' \
             ORDER BY status_slot COLLATE \"C\" \
             LIMIT $2",
            SELECT_COLUMNS
        );
        let limit = limit.map(|l| i64::try_from(l).unwrap_or(i64::MAX));

        let rows = sqlx::query_as::<_, TrackerRow>(&sql)
            .bind(key.partition())
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(TrackingRecord::try_from).collect()
    }

    #[instrument(skip_all, fields(load_key = %record.load_key, slot = %record.slot))]
    async fn put_if_absent(&self, record: &TrackingRecord) -> StoreResult<PutOutcome> {
        let result = sqlx::query(
            r#"
            INSERT INTO load_tracker
                (db_table, status_slot, execution_name, manifest_bucket, manifest_key,
                 source_ref, coalesced_count, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (db_table, status_slot) DO NOTHING
            "#,
        )
        .bind(record.load_key.partition())
        .bind(record.slot.to_string())
        .bind(record.execution_name.to_string())
        .bind(&record.payload.bucket)
        .bind(&record.payload.key)
        .bind(&record.source_ref)
        .bind(record.coalesced_count.map(count_param))
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;

        Ok(if result.rows_affected() == 1 {
            PutOutcome::Written
        } else {
            PutOutcome::Conflict
        })
    }

    #[instrument(skip_all, fields(load_key = %record.load_key, slot = %record.slot))]
    async fn put(&self, record: &TrackingRecord) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO load_tracker
                (db_table, status_slot, execution_name, manifest_bucket, manifest_key,
                 source_ref, coalesced_count, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (db_table, status_slot) DO UPDATE SET
                execution_name = EXCLUDED.execution_name,
                manifest_bucket = EXCLUDED.manifest_bucket,
                manifest_key = EXCLUDED.manifest_key,
                source_ref = EXCLUDED.source_ref,
                coalesced_count = EXCLUDED.coalesced_count
            "#,
        )
        .bind(record.load_key.partition())
        .bind(record.slot.to_string())
        .bind(record.execution_name.to_string())
        .bind(&record.payload.bucket)
        .bind(&record.payload.key)
        .bind(&record.source_ref)
        .bind(record.coalesced_count.map(count_param))
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[instrument(skip_all, fields(load_key = %key, execution = %execution))]
    async fn set_coalesced_count(
        &self,
        key: &LoadKey,
        execution: &ExecutionName,
        count: u32,
    ) -> StoreResult<PutOutcome> {
        let result = sqlx::query(
            r#"
            UPDATE load_tracker
            SET coalesced_count = $3
            WHERE db_table = $1 AND status_slot = $4 AND execution_name = $2
            "#,
        )
        .bind(key.partition())
        .bind(execution.to_string())
        .bind(count_param(count))
        .bind(RUNNING_SLOT)
        .execute(&self.pool)
        .await?;

        Ok(if result.rows_affected() == 1 {
            PutOutcome::Written
        } else {
            PutOutcome::Conflict
        })
    }

    #[instrument(skip_all, fields(load_key = %key, execution = %execution))]
    async fn claim_coalesced(
        &self,
        key: &LoadKey,
        execution: &ExecutionName,
        expected: u32,
    ) -> StoreResult<PutOutcome> {
        let result = sqlx::query(
            r#"
            UPDATE load_tracker
            SET coalesced_count = 0
            WHERE db_table = $1
              AND status_slot = $4
              AND execution_name = $2
              AND coalesced_count = $3
            "#,
        )
        .bind(key.partition())
        .bind(execution.to_string())
        .bind(count_param(expected))
        .bind(RUNNING_SLOT)
        .execute(&self.pool)
        .await?;

        Ok(if result.rows_affected() == 1 {
            PutOutcome::Written
        } else {
            PutOutcome::Conflict
        })
    }

    #[instrument(skip_all, fields(load_key = %write.put.load_key, deletes = write.deletes.len()))]
    async fn transact(&self, write: &TransactWrite) -> StoreResult<PutOutcome> {
        let mut tx = self.pool.begin().await?;

        for delete in &write.deletes {
            if !Self::delete_in(&mut tx, delete).await? {
                debug!(slot = %delete.key.slot, "Transaction delete condition not met");
                tx.rollback().await?;
                return Ok(PutOutcome::Conflict);
            }
        }

        let put = &write.put;
        let inserted = sqlx::query(
            r#"
            INSERT INTO load_tracker
                (db_table, status_slot, execution_name, manifest_bucket, manifest_key,
                 source_ref, coalesced_count, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (db_table, status_slot) DO NOTHING
            "#,
        )
        .bind(put.load_key.partition())
        .bind(put.slot.to_string())
        .bind(put.execution_name.to_string())
        .bind(&put.payload.bucket)
        .bind(&put.payload.key)
        .bind(&put.source_ref)
        .bind(put.coalesced_count.map(count_param))
        .bind(put.created_at)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            debug!(slot = %put.slot, "Transaction destination slot occupied");
            tx.rollback().await?;
            return Ok(PutOutcome::Conflict);
        }

        tx.commit().await?;
        Ok(PutOutcome::Written)
    }

    #[instrument(skip_all, fields(load_key = %delete.key.load_key, slot = %delete.key.slot))]
    async fn delete_if(&self, delete: &ConditionalDelete) -> StoreResult<PutOutcome> {
        let mut tx = self.pool.begin().await?;
        let deleted = Self::delete_in(&mut tx, delete).await?;
        tx.commit().await?;

        Ok(if deleted {
            PutOutcome::Written
        } else {
            PutOutcome::Conflict
        })
    }

    #[instrument(skip_all, fields(load_key = %key, slots = slots.len()))]
    async fn delete_batch(&self, key: &LoadKey, slots: &[StatusSlot]) -> StoreResult<usize> {
        if slots.is_empty() {
            return Ok(0);
        }

        let slots: Vec<String> = slots.iter().map(ToString::to_string).collect();
        let result = sqlx::query(
            "DELETE FROM load_tracker WHERE db_table = $1 AND status_slot = ANY($2)",
        )
        .bind(key.partition())
        .bind(slots)
        .execute(&self.pool)
        .await?;

        Ok(usize::try_from(result.rows_affected()).unwrap_or(usize::MAX))
    }

    async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
