//! Shared fixtures for loadq server integration tests.
//!
//! - [`TestPostgres`]: PostgreSQL container with the `load_tracker` migration
//!   applied (requires Docker)
//! - [`Harness`]: dispatcher wired to in-memory stores and a recording
//!   warehouse
//! - [`GatedStore`], [`FlakyStore`] and [`InterleavingStore`]: state store
//!   wrappers that force interleavings and lost acknowledgements

#![allow(dead_code)]

use anyhow::{Context, Result};
use async_trait::async_trait;
use loadq_common::{ExecutionName, LoadKey};
use loadq_server::coordinator::LoadCoordinator;
use loadq_server::dispatch::{CompletionEvent, DispatchSettings, Dispatcher, RetryPolicy};
use loadq_server::loader_config::ConfigResolver;
use loadq_server::manifest::ManifestStore;
use loadq_server::notifications::NotificationBatch;
use loadq_server::storage::{MemoryObjectStore, ObjectStore};
use loadq_server::tracker::{
    ConditionalDelete, MemoryStateStore, PayloadRef, PutOutcome, RecordKey, StateStore,
    StatusSlot, StoreError, StoreResult, TrackingRecord, TransactWrite,
};
use loadq_server::warehouse::RecordingWarehouse;
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use testcontainers::{core::IntoContainerPort, runners::AsyncRunner, ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::Barrier;
use tracing::{debug, info};

pub const ORDERS_QUEUE: &str = "arn:aws:sqs:us-east-1:123456789012:orders-loader";
pub const EVENTS_QUEUE: &str = "arn:aws:sqs:us-east-1:123456789012:events-loader";
pub const COPY_ROLE: &str = "arn:aws:iam::123456789012:role/copy";
pub const CONFIG_BUCKET: &str = "loader-config";
pub const MANIFEST_BUCKET: &str = "loader-manifests";

pub fn orders_key() -> LoadKey {
    LoadKey::new("db1", "orders").expect("valid key")
}

/// A request for `key` whose name is stamped `millis`, so tests control order.
pub fn request_at(key: &LoadKey, millis: i64) -> loadq_server::coordinator::LoadRequest {
    loadq_server::coordinator::LoadRequest {
        load_key: key.clone(),
        execution_name: ExecutionName::at(key, millis),
        payload: PayloadRef::new(MANIFEST_BUCKET, format!("manifests/{}/{}", key.table(), millis)),
        source_ref: ORDERS_QUEUE.to_string(),
    }
}

pub fn pending_names(store: &MemoryStateStore) -> Vec<ExecutionName> {
    store
        .dump()
        .expect("dump")
        .into_iter()
        .filter(|r| !r.slot.is_running())
        .map(|r| r.execution_name)
        .collect()
}

pub fn running_record(store: &MemoryStateStore) -> Option<TrackingRecord> {
    store
        .dump()
        .expect("dump")
        .into_iter()
        .find(|r| r.slot.is_running())
}

// ============================================================================
// PostgreSQL Test Container
// ============================================================================

/// PostgreSQL test container with migrations applied
pub struct TestPostgres {
    container: ContainerAsync<Postgres>,
    pool: PgPool,
}

impl TestPostgres {
    pub async fn start() -> Result<Self> {
        info!("Starting PostgreSQL test container...");

        let container = Postgres::default()
            .with_tag("16-alpine")
            .start()
            .await
            .context("Failed to start PostgreSQL container")?;

        let host = container
            .get_host()
            .await
            .context("Failed to get container host")?;
        let port = container
            .get_host_port_ipv4(5432.tcp())
            .await
            .context("Failed to get container port")?;

        let connection_string =
            format!("postgresql://postgres:postgres@{}:{}/postgres", host, port);
        debug!("PostgreSQL connection: {}", connection_string);

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&connection_string)
            .await
            .context("Failed to connect to PostgreSQL")?;

        loadq_server::db::run_migrations(&pool)
            .await
            .context("Failed to run migrations")?;

        Ok(Self { container, pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn pool_clone(&self) -> PgPool {
        self.pool.clone()
    }
}

// ============================================================================
// Dispatcher harness
// ============================================================================

/// Dispatcher over in-memory collaborators.
pub struct Harness {
    pub store: MemoryStateStore,
    pub objects: Arc<MemoryObjectStore>,
    pub warehouse: RecordingWarehouse,
    pub dispatcher: Dispatcher,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_store(MemoryStateStore::new()).await
    }

    pub async fn with_store(store: MemoryStateStore) -> Self {
        Self::with_wrapped_store(store, |inner| inner).await
    }

    /// Dispatcher over `wrap(store)`; `store` stays inspectable through
    /// [`Harness::store`].
    pub async fn with_wrapped_store(
        store: MemoryStateStore,
        wrap: impl FnOnce(Arc<dyn StateStore>) -> Arc<dyn StateStore>,
    ) -> Self {
        let objects = Arc::new(MemoryObjectStore::new());
        let warehouse = RecordingWarehouse::new();

        put_loader_config(&objects, "orders-loader", "db1", "orders", true).await;
        put_loader_config(&objects, "events-loader", "db1", "events", false).await;

        let coordinator = LoadCoordinator::new(wrap(Arc::new(store.clone())));
        let configs = ConfigResolver::new(objects.clone(), CONFIG_BUCKET, "loaders/");
        let manifests = ManifestStore::new(objects.clone(), MANIFEST_BUCKET, "manifests/");
        let dispatcher = Dispatcher::new(
            coordinator,
            configs,
            manifests,
            Arc::new(warehouse.clone()),
        )
        .with_retry(RetryPolicy::new(3, Duration::from_millis(1)))
        .with_settings(DispatchSettings {
            statement_retry_wait: Duration::ZERO,
            fallback_role_arn: Some(COPY_ROLE.to_string()),
            ..DispatchSettings::default()
        });

        Self {
            store,
            objects,
            warehouse,
            dispatcher,
        }
    }
}

pub async fn put_loader_config(
    objects: &MemoryObjectStore,
    queue: &str,
    database: &str,
    table: &str,
    merge_duplicate_pks: bool,
) {
    let config = json!({
        "copy": {"options": "", "role_arn": COPY_ROLE, "table_name": table},
        "cluster": {"identifier": "analytics", "db_name": database},
        "options": {
            "merge_duplicate_pks": merge_duplicate_pks,
            "merge_pk": "id",
            "merge_timestamp": "updated_at"
        }
    });
    objects
        .put_object(
            CONFIG_BUCKET,
            &format!("loaders/{}.json", queue),
            config.to_string().into_bytes(),
            Some("application/json"),
        )
        .await
        .expect("write loader config");
}

/// A queue batch with one S3 object per `(queue, key)` pair.
pub fn notification_batch(objects: &[(&str, &str)]) -> NotificationBatch {
    let records: Vec<_> = objects
        .iter()
        .map(|(queue, key)| {
            json!({
                "eventSourceARN": queue,
                "body": json!({
                    "Records": [{
                        "s3": {
                            "bucket": {"name": "landing"},
                            "object": {"key": key, "size": 100}
                        }
                    }]
                })
                .to_string()
            })
        })
        .collect();
    serde_json::from_value(json!({ "Records": records })).expect("batch")
}

pub fn completion_event(statement_name: &str, statement_id: &str, state: &str) -> CompletionEvent {
    serde_json::from_value(json!({
        "source": "aws.redshift-data",
        "detail-type": "Redshift Data Statement Status Change",
        "detail": {
            "statementName": statement_name,
            "statementId": statement_id,
            "state": state
        }
    }))
    .expect("event")
}

// ============================================================================
// State store wrappers
// ============================================================================

/// Holds every `transact` and `delete_if` call at a barrier until `parties`
/// callers have arrived, so overlapping completions all read before any
/// writes.
pub struct GatedStore {
    inner: Arc<dyn StateStore>,
    barrier: Barrier,
}

impl GatedStore {
    pub fn new(inner: Arc<dyn StateStore>, parties: usize) -> Self {
        Self {
            inner,
            barrier: Barrier::new(parties),
        }
    }
}

#[async_trait]
impl StateStore for GatedStore {
    async fn get(&self, key: &LoadKey, slot: &StatusSlot) -> StoreResult<Option<TrackingRecord>> {
        self.inner.get(key, slot).await
    }

    async fn query_pending(
        &self,
        key: &LoadKey,
        limit: Option<usize>,
    ) -> StoreResult<Vec<TrackingRecord>> {
        self.inner.query_pending(key, limit).await
    }

    async fn put_if_absent(&self, record: &TrackingRecord) -> StoreResult<PutOutcome> {
        self.inner.put_if_absent(record).await
    }

    async fn put(&self, record: &TrackingRecord) -> StoreResult<()> {
        self.inner.put(record).await
    }

    async fn set_coalesced_count(
        &self,
        key: &LoadKey,
        execution: &ExecutionName,
        count: u32,
    ) -> StoreResult<PutOutcome> {
        self.inner.set_coalesced_count(key, execution, count).await
    }

    async fn claim_coalesced(
        &self,
        key: &LoadKey,
        execution: &ExecutionName,
        expected: u32,
    ) -> StoreResult<PutOutcome> {
        self.inner.claim_coalesced(key, execution, expected).await
    }

    async fn transact(&self, write: &TransactWrite) -> StoreResult<PutOutcome> {
        self.barrier.wait().await;
        self.inner.transact(write).await
    }

    async fn delete_if(&self, delete: &ConditionalDelete) -> StoreResult<PutOutcome> {
        self.barrier.wait().await;
        self.inner.delete_if(delete).await
    }

    async fn delete_batch(&self, key: &LoadKey, slots: &[StatusSlot]) -> StoreResult<usize> {
        self.inner.delete_batch(key, slots).await
    }

    async fn ping(&self) -> StoreResult<()> {
        self.inner.ping().await
    }
}

/// Applies writes of `put_if_absent` and `put`, then reports a transient
/// error for the first few of each as if the acknowledgement was lost.
pub struct FlakyStore {
    inner: Arc<dyn StateStore>,
    put_if_absent_failures: AtomicU32,
    put_failures: AtomicU32,
}

impl FlakyStore {
    pub fn new(inner: Arc<dyn StateStore>) -> Self {
        Self {
            inner,
            put_if_absent_failures: AtomicU32::new(0),
            put_failures: AtomicU32::new(0),
        }
    }

    pub fn failing_put_if_absent(self, times: u32) -> Self {
        self.put_if_absent_failures.store(times, Ordering::SeqCst);
        self
    }

    pub fn failing_put(self, times: u32) -> Self {
        self.put_failures.store(times, Ordering::SeqCst);
        self
    }
}

fn take(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

fn lost_ack() -> StoreError {
    StoreError::Database(sqlx::Error::PoolTimedOut)
}

#[async_trait]
impl StateStore for FlakyStore {
    async fn get(&self, key: &LoadKey, slot: &StatusSlot) -> StoreResult<Option<TrackingRecord>> {
        self.inner.get(key, slot).await
    }

    async fn query_pending(
        &self,
        key: &LoadKey,
        limit: Option<usize>,
    ) -> StoreResult<Vec<TrackingRecord>> {
        self.inner.query_pending(key, limit).await
    }

    async fn put_if_absent(&self, record: &TrackingRecord) -> StoreResult<PutOutcome> {
        let outcome = self.inner.put_if_absent(record).await?;
        if take(&self.put_if_absent_failures) {
            return Err(lost_ack());
        }
        Ok(outcome)
    }

    async fn put(&self, record: &TrackingRecord) -> StoreResult<()> {
        self.inner.put(record).await?;
        if take(&self.put_failures) {
            return Err(lost_ack());
        }
        Ok(())
    }

    async fn set_coalesced_count(
        &self,
        key: &LoadKey,
        execution: &ExecutionName,
        count: u32,
    ) -> StoreResult<PutOutcome> {
        self.inner.set_coalesced_count(key, execution, count).await
    }

    async fn claim_coalesced(
        &self,
        key: &LoadKey,
        execution: &ExecutionName,
        expected: u32,
    ) -> StoreResult<PutOutcome> {
        self.inner.claim_coalesced(key, execution, expected).await
    }

    async fn transact(&self, write: &TransactWrite) -> StoreResult<PutOutcome> {
        self.inner.transact(write).await
    }

    async fn delete_if(&self, delete: &ConditionalDelete) -> StoreResult<PutOutcome> {
        self.inner.delete_if(delete).await
    }

    async fn delete_batch(&self, key: &LoadKey, slots: &[StatusSlot]) -> StoreResult<usize> {
        self.inner.delete_batch(key, slots).await
    }

    async fn ping(&self) -> StoreResult<()> {
        self.inner.ping().await
    }
}

/// Lands another caller's write right after one of ours, once:
///
/// - `retiring_after_coalesce`: the RUNNING record is deleted as soon as its
///   coalesced count is written, like an operator completion arriving while
///   the execution is being submitted
/// - `enqueue_after_retire`: a PENDING record is written as soon as a RUNNING
///   record is retired, like an enqueue racing the completion
pub struct InterleavingStore {
    inner: Arc<dyn StateStore>,
    retire_after_coalesce: AtomicU32,
    enqueue_after_retire: Mutex<Option<TrackingRecord>>,
}

impl InterleavingStore {
    pub fn new(inner: Arc<dyn StateStore>) -> Self {
        Self {
            inner,
            retire_after_coalesce: AtomicU32::new(0),
            enqueue_after_retire: Mutex::new(None),
        }
    }

    pub fn retiring_after_coalesce(self) -> Self {
        self.retire_after_coalesce.store(1, Ordering::SeqCst);
        self
    }

    pub fn enqueue_after_retire(self, record: TrackingRecord) -> Self {
        *self.enqueue_after_retire.lock().expect("lock") = Some(record);
        self
    }
}

#[async_trait]
impl StateStore for InterleavingStore {
    async fn get(&self, key: &LoadKey, slot: &StatusSlot) -> StoreResult<Option<TrackingRecord>> {
        self.inner.get(key, slot).await
    }

    async fn query_pending(
        &self,
        key: &LoadKey,
        limit: Option<usize>,
    ) -> StoreResult<Vec<TrackingRecord>> {
        self.inner.query_pending(key, limit).await
    }

    async fn put_if_absent(&self, record: &TrackingRecord) -> StoreResult<PutOutcome> {
        self.inner.put_if_absent(record).await
    }

    async fn put(&self, record: &TrackingRecord) -> StoreResult<()> {
        self.inner.put(record).await
    }

    async fn set_coalesced_count(
        &self,
        key: &LoadKey,
        execution: &ExecutionName,
        count: u32,
    ) -> StoreResult<PutOutcome> {
        let outcome = self.inner.set_coalesced_count(key, execution, count).await?;
        if outcome.is_written() && take(&self.retire_after_coalesce) {
            let retire = ConditionalDelete {
                key: RecordKey::running(key),
                expected_execution: Some(execution.clone()),
            };
            self.inner.delete_if(&retire).await?;
        }
        Ok(outcome)
    }

    async fn claim_coalesced(
        &self,
        key: &LoadKey,
        execution: &ExecutionName,
        expected: u32,
    ) -> StoreResult<PutOutcome> {
        self.inner.claim_coalesced(key, execution, expected).await
    }

    async fn transact(&self, write: &TransactWrite) -> StoreResult<PutOutcome> {
        self.inner.transact(write).await
    }

    async fn delete_if(&self, delete: &ConditionalDelete) -> StoreResult<PutOutcome> {
        let outcome = self.inner.delete_if(delete).await?;
        if outcome.is_written() {
            let late = self.enqueue_after_retire.lock().expect("lock").take();
            if let Some(record) = late {
                self.inner.put(&record).await?;
            }
        }
        Ok(outcome)
    }

    async fn delete_batch(&self, key: &LoadKey, slots: &[StatusSlot]) -> StoreResult<usize> {
        self.inner.delete_batch(key, slots).await
    }

    async fn ping(&self) -> StoreResult<()> {
        self.inner.ping().await
    }
}
