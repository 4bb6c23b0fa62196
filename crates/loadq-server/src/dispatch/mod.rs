//! Dispatcher: the glue between transport events and the coordinator.
//!
//! - notification batches become manifests and load requests
//! - admitted or promoted requests are coalesced, rendered to SQL and
//!   submitted to the warehouse
//! - completion events retire the running execution and dispatch whatever
//!   was promoted in its place
//!
//! Any failure between winning the RUNNING slot and a successful submission
//! hands the request back to the PENDING queue through
//! [`LoadCoordinator::requeue_admitted`], so a request is never dropped while
//! the key stays blocked.

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use loadq_common::{ExecutionName, LoadKey};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

use crate::coordinator::{Admission, Completion, ConflictReason, LoadCoordinator, LoadRequest};
use crate::loader_config::{ConfigResolver, InvocationContext, LoaderConfig, MergeSettings};
use crate::manifest::ManifestStore;
use crate::notifications::{manifests_by_source, NotificationBatch};
use crate::sql::{
    build_bulk_statements, build_load_statements, refill_iam_role, BulkStatementParams,
    LoadStatementParams,
};
use crate::tracker::PayloadRef;
use crate::warehouse::{
    ExecutionRequest, StatementDescription, StatementId, StatementStatus, Warehouse,
    DEFAULT_DB_USER,
};

pub mod retry;

pub use retry::RetryPolicy;

/// Default pause before resubmitting a batch that lost a serialization race.
pub const DEFAULT_STATEMENT_RETRY_WAIT_SECS: u64 = 30;

/// Default resubmissions of one execution after serialization failures.
pub const DEFAULT_MAX_STATEMENT_RETRIES: u32 = 3;

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub db_user: String,
    /// Role used to re-fill redacted COPY credentials when the loader config
    /// of the running execution cannot be resolved
    pub fallback_role_arn: Option<String>,
    pub statement_retry_wait: Duration,
    pub max_statement_retries: u32,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            db_user: DEFAULT_DB_USER.to_string(),
            fallback_role_arn: None,
            statement_retry_wait: Duration::from_secs(DEFAULT_STATEMENT_RETRY_WAIT_SECS),
            max_statement_retries: DEFAULT_MAX_STATEMENT_RETRIES,
        }
    }
}

/// What happened to a request that owned the RUNNING slot.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DispatchOutcome {
    Submitted {
        execution: ExecutionName,
        statement_id: StatementId,
        folded: u32,
    },
    /// Submission failed; the request is PENDING again.
    Requeued {
        execution: ExecutionName,
        error: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationReport {
    pub source_ref: String,
    pub load_key: LoadKey,
    pub execution: ExecutionName,
    pub manifest: PayloadRef,
    pub files: usize,
    pub queued: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dispatch: Option<DispatchOutcome>,
}

/// Warehouse "statement status change" event.
#[derive(Debug, Clone, Deserialize)]
pub struct CompletionEvent {
    pub detail: StatementStatusDetail,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatementStatusDetail {
    #[serde(default)]
    pub statement_name: Option<String>,
    pub statement_id: String,
    pub state: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CompletionReport {
    Ignored {
        reason: String,
    },
    Idle {
        #[serde(skip_serializing_if = "Option::is_none")]
        execution: Option<ExecutionName>,
    },
    Promoted {
        #[serde(skip_serializing_if = "Option::is_none")]
        execution: Option<ExecutionName>,
        promoted: ExecutionName,
        dispatch: DispatchOutcome,
    },
    Conflict {
        #[serde(skip_serializing_if = "Option::is_none")]
        execution: Option<ExecutionName>,
        reason: ConflictReason,
    },
    /// A resubmission was scheduled; the key stays RUNNING.
    Retrying {
        execution: ExecutionName,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct BulkCopySettings {
    pub role_arn: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BulkClusterSettings {
    pub identifier: String,
    pub db_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BulkPath {
    pub s3_path: String,
    pub table: String,
    pub options: MergeSettings,
}

/// One-shot load of explicit paths, outside the coordinator.
#[derive(Debug, Clone, Deserialize)]
pub struct BulkLoadRequest {
    pub copy: BulkCopySettings,
    pub cluster: BulkClusterSettings,
    #[serde(default)]
    pub paths: Vec<BulkPath>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BulkLoadReport {
    pub s3_path: String,
    pub table: String,
    pub statement_id: StatementId,
}

#[derive(Clone)]
pub struct Dispatcher {
    coordinator: LoadCoordinator,
    configs: ConfigResolver,
    manifests: ManifestStore,
    warehouse: Arc<dyn Warehouse>,
    retry: RetryPolicy,
    settings: DispatchSettings,
}

impl Dispatcher {
    pub fn new(
        coordinator: LoadCoordinator,
        configs: ConfigResolver,
        manifests: ManifestStore,
        warehouse: Arc<dyn Warehouse>,
    ) -> Self {
        Self {
            coordinator,
            configs,
            manifests,
            warehouse,
            retry: RetryPolicy::default(),
            settings: DispatchSettings::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_settings(mut self, settings: DispatchSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn coordinator(&self) -> &LoadCoordinator {
        &self.coordinator
    }

    pub fn manifests(&self) -> &ManifestStore {
        &self.manifests
    }

    /// Turn a notification batch into one load request per source queue.
    #[instrument(skip_all, fields(records = batch.records.len()))]
    pub async fn handle_notifications(
        &self,
        batch: &NotificationBatch,
    ) -> Result<Vec<NotificationReport>> {
        let mut ctx = self.configs.context();
        let mut reports = Vec::new();

        for (source_ref, manifest) in manifests_by_source(batch) {
            let config = ctx.config(&source_ref).await?;
            let load_key = config.load_key()?;
            let payload = self.manifests.write(load_key.table(), &manifest).await?;
            let request = LoadRequest::new(load_key.clone(), payload.clone(), source_ref.clone());

            let coordinator = &self.coordinator;
            let pending = &request;
            let admission = self
                .retry
                .run("begin_or_enqueue", move || coordinator.begin_or_enqueue(pending))
                .await?;

            let dispatch = match admission {
                Admission::Admitted(_) => Some(self.submit_admitted(&request, &config).await?),
                Admission::Queued(_) => None,
            };

            reports.push(NotificationReport {
                source_ref,
                load_key,
                execution: request.execution_name.clone(),
                manifest: payload,
                files: manifest.entries.len(),
                queued: dispatch.is_none(),
                dispatch,
            });
        }

        info!(requests = reports.len(), "Notification batch handled");
        Ok(reports)
    }

    /// Coalesce and submit a request that owns the RUNNING slot.
    async fn submit_admitted(
        &self,
        request: &LoadRequest,
        config: &LoaderConfig,
    ) -> Result<DispatchOutcome> {
        match self.try_submit(request, config).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => self.requeue(request, e).await,
        }
    }

    async fn try_submit(
        &self,
        request: &LoadRequest,
        config: &LoaderConfig,
    ) -> Result<DispatchOutcome> {
        let coordinator = &self.coordinator;
        let coalesced = self
            .retry
            .run("coalesce_pending", move || coordinator.coalesce_pending(request))
            .await?;

        let staging_table = request.execution_name.staging_table();
        let sqls = build_load_statements(&LoadStatementParams {
            table: &config.copy.table_name,
            staging_table: &staging_table,
            merge_pk: &config.options.merge_pk,
            merge_timestamp: &config.options.merge_timestamp,
            manifests: &coalesced.payloads,
            role_arn: &config.copy.role_arn,
            copy_options: &config.copy.options,
            dedup: config.options.dedup_mode(),
        });

        let statement_id = self
            .warehouse
            .submit(ExecutionRequest {
                cluster_identifier: config.cluster.identifier.clone(),
                database: config.cluster.db_name.clone(),
                db_user: self.settings.db_user.clone(),
                sqls,
                statement_name: Some(request.execution_name.to_string()),
                with_event: true,
            })
            .await?;

        info!(
            execution = %request.execution_name,
            statement_id = %statement_id,
            folded = coalesced.folded,
            "Load submitted"
        );
        Ok(DispatchOutcome::Submitted {
            execution: request.execution_name.clone(),
            statement_id,
            folded: coalesced.folded,
        })
    }

    async fn requeue(&self, request: &LoadRequest, cause: anyhow::Error) -> Result<DispatchOutcome> {
        error!(
            execution = %request.execution_name,
            error = %cause,
            "Dispatch failed, returning load to the pending queue"
        );

        let coordinator = &self.coordinator;
        let requeue = self
            .retry
            .run("requeue_admitted", move || coordinator.requeue_admitted(request))
            .await
            .context("Failed to requeue load after dispatch failure")?;
        debug!(execution = %request.execution_name, ?requeue, "Load is PENDING again");

        Ok(DispatchOutcome::Requeued {
            execution: request.execution_name.clone(),
            error: format!("{:#}", cause),
        })
    }

    /// Dispatch a record that was just promoted to RUNNING.
    async fn dispatch_promoted(
        &self,
        ctx: &mut InvocationContext<'_>,
        request: &LoadRequest,
    ) -> Result<DispatchOutcome> {
        match ctx.config(&request.source_ref).await {
            Ok(config) => self.submit_admitted(request, &config).await,
            Err(e) => self.requeue(request, e).await,
        }
    }

    /// React to a warehouse statement reaching a new state.
    #[instrument(skip_all, fields(statement_id = %event.detail.statement_id, state = %event.detail.state))]
    pub async fn handle_completion(&self, event: &CompletionEvent) -> Result<CompletionReport> {
        let detail = &event.detail;
        let Some(raw_name) = detail.statement_name.as_deref() else {
            return Ok(ignored("statement has no name"));
        };
        let execution: ExecutionName = match raw_name.parse() {
            Ok(name) => name,
            Err(_) => {
                debug!(statement_name = raw_name, "Not a coordinated load");
                return Ok(ignored(format!("'{}' is not an execution name", raw_name)));
            }
        };

        let state = StatementStatus::parse(&detail.state);
        if !state.is_terminal() {
            return Ok(ignored(format!("state {} is not terminal", detail.state)));
        }

        if state == StatementStatus::Failed {
            let statement_id = StatementId(detail.statement_id.clone());
            if let Some(report) = self.maybe_retry(&execution, &statement_id).await? {
                return Ok(report);
            }
        }

        self.finish(&execution).await
    }

    /// Complete `execution` and dispatch whatever is promoted after it.
    async fn finish(&self, execution: &ExecutionName) -> Result<CompletionReport> {
        let key = &execution.load_key();
        let coordinator = &self.coordinator;
        let completion = self
            .retry
            .run("complete_execution", move || coordinator.complete_execution(key, execution))
            .await?;

        self.settle(Some(execution), completion).await
    }

    /// Retire whatever runs on `key` without naming it, and dispatch the
    /// next load. Also promotes PENDING records left behind on an idle key.
    #[instrument(skip_all, fields(load_key = %key))]
    pub async fn force_complete(&self, key: &LoadKey) -> Result<CompletionReport> {
        let coordinator = &self.coordinator;
        let completion = self
            .retry
            .run("complete_and_promote", move || coordinator.complete_and_promote(key))
            .await?;

        self.settle(None, completion).await
    }

    async fn settle(
        &self,
        execution: Option<&ExecutionName>,
        completion: Completion,
    ) -> Result<CompletionReport> {
        let execution = execution.cloned();
        let report = match completion {
            Completion::Idle => CompletionReport::Idle { execution },
            Completion::Conflict(reason) => CompletionReport::Conflict { execution, reason },
            Completion::Promoted(record) => {
                let request = LoadRequest::from_record(&record);
                let mut ctx = self.configs.context();
                let dispatch = self.dispatch_promoted(&mut ctx, &request).await?;
                CompletionReport::Promoted {
                    execution,
                    promoted: record.execution_name,
                    dispatch,
                }
            }
        };
        Ok(report)
    }

    /// Schedule a resubmission if the failure was a serialization race and
    /// the execution still owns its key.
    async fn maybe_retry(
        &self,
        execution: &ExecutionName,
        statement_id: &StatementId,
    ) -> Result<Option<CompletionReport>> {
        let description = self.warehouse.describe(statement_id).await?;
        if !description.is_serializable_violation() {
            error!(
                execution = %execution,
                error = ?description.error,
                "Load statement failed"
            );
            return Ok(None);
        }
        if execution.attempt() >= self.settings.max_statement_retries {
            error!(
                execution = %execution,
                attempts = execution.attempt(),
                "Serialization retries exhausted"
            );
            return Ok(None);
        }

        let key = execution.load_key();
        let Some(running) = self.coordinator.running(&key).await? else {
            return Ok(None);
        };
        if !running.execution_name.same_load(execution) {
            // Stale event; let completion report it.
            return Ok(None);
        }

        let role_arn = match self.configs.resolve(&running.source_ref).await {
            Ok(config) => config.copy.role_arn,
            Err(e) => {
                warn!(error = %e, "Loader config unavailable for retry, using fallback role");
                self.settings
                    .fallback_role_arn
                    .clone()
                    .ok_or_else(|| anyhow!("No role available to re-fill COPY credentials"))?
            }
        };

        let next = execution.next_attempt();
        warn!(
            execution = %execution,
            retry = %next,
            wait_secs = self.settings.statement_retry_wait.as_secs(),
            "Serializable isolation violation, scheduling resubmission"
        );

        let this = self.clone();
        let retry_name = next.clone();
        tokio::spawn(async move {
            if let Err(e) = this.resubmit(&retry_name, description, &role_arn).await {
                error!(execution = %retry_name, error = %e, "Resubmission failed, completing load");
                if let Err(e) = this.finish(&retry_name).await {
                    error!(execution = %retry_name, error = %e, "Failed to complete load after resubmission failure");
                }
            }
        });

        Ok(Some(CompletionReport::Retrying { execution: next }))
    }

    async fn resubmit(
        &self,
        execution: &ExecutionName,
        description: StatementDescription,
        role_arn: &str,
    ) -> Result<StatementId> {
        tokio::time::sleep(self.settings.statement_retry_wait).await;

        let cluster_identifier = description
            .cluster_identifier
            .clone()
            .ok_or_else(|| anyhow!("Statement description has no cluster identifier"))?;
        let sqls = description
            .statements
            .iter()
            .map(|sql| refill_iam_role(sql, role_arn))
            .collect();

        let statement_id = self
            .warehouse
            .submit(ExecutionRequest {
                cluster_identifier,
                database: execution.load_key().database().to_string(),
                db_user: self.settings.db_user.clone(),
                sqls,
                statement_name: Some(execution.to_string()),
                with_event: true,
            })
            .await?;

        info!(execution = %execution, statement_id = %statement_id, "Load resubmitted");
        Ok(statement_id)
    }

    /// Submit an uncoordinated load per path. These statements are unnamed,
    /// so their completion events are ignored.
    #[instrument(skip_all, fields(paths = request.paths.len()))]
    pub async fn bulk_load(&self, request: &BulkLoadRequest) -> Result<Vec<BulkLoadReport>> {
        let mut reports = Vec::with_capacity(request.paths.len());

        for path in &request.paths {
            let staging_table = format!("{}_{}", path.table, Utc::now().timestamp_millis());
            let sqls = build_bulk_statements(&BulkStatementParams {
                table: &path.table,
                staging_table: &staging_table,
                merge_pk: &path.options.merge_pk,
                merge_timestamp: &path.options.merge_timestamp,
                s3_path: &path.s3_path,
                role_arn: &request.copy.role_arn,
                dedup: path.options.dedup_mode(),
            });

            let statement_id = self
                .warehouse
                .submit(ExecutionRequest {
                    cluster_identifier: request.cluster.identifier.clone(),
                    database: request.cluster.db_name.clone(),
                    db_user: self.settings.db_user.clone(),
                    sqls,
                    statement_name: None,
                    with_event: true,
                })
                .await
                .with_context(|| format!("Failed to submit bulk load of {}", path.s3_path))?;

            info!(table = %path.table, s3_path = %path.s3_path, statement_id = %statement_id, "Bulk load submitted");
            reports.push(BulkLoadReport {
                s3_path: path.s3_path.clone(),
                table: path.table.clone(),
                statement_id,
            });
        }

        Ok(reports)
    }
}

fn ignored(reason: impl Into<String>) -> CompletionReport {
    CompletionReport::Ignored {
        reason: reason.into(),
    }
}
