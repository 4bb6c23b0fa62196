use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use super::{ExecutionRequest, StatementDescription, StatementId, StatementStatus, Warehouse};

#[derive(Debug, Default)]
struct Inner {
    submitted: Vec<(StatementId, ExecutionRequest)>,
    descriptions: HashMap<StatementId, StatementDescription>,
    failures: VecDeque<String>,
    next_id: u64,
}

/// In-process [`Warehouse`] that records every submission.
///
/// Submitted batches are described back as `SUBMITTED` with their statement
/// text unless a description was scripted with [`set_description`]. Failures
/// queued with [`fail_next_submit`] are returned by the next submissions in
/// order.
///
/// [`set_description`]: RecordingWarehouse::set_description
/// [`fail_next_submit`]: RecordingWarehouse::fail_next_submit
#[derive(Debug, Default, Clone)]
pub struct RecordingWarehouse {
    inner: Arc<Mutex<Inner>>,
}

impl RecordingWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(|_| anyhow!("warehouse lock poisoned"))
    }

    pub fn submitted(&self) -> Vec<ExecutionRequest> {
        self.lock()
            .map(|inner| inner.submitted.iter().map(|(_, r)| r.clone()).collect())
            .unwrap_or_default()
    }

    /// Statement names of every named submission, in order.
    pub fn submitted_names(&self) -> Vec<String> {
        self.submitted()
            .into_iter()
            .filter_map(|r| r.statement_name)
            .collect()
    }

    pub fn set_description(&self, id: StatementId, description: StatementDescription) {
        if let Ok(mut inner) = self.lock() {
            inner.descriptions.insert(id, description);
        }
    }

    pub fn fail_next_submit(&self, message: impl Into<String>) {
        if let Ok(mut inner) = self.lock() {
            inner.failures.push_back(message.into());
        }
    }
}

#[async_trait]
impl Warehouse for RecordingWarehouse {
    async fn submit(&self, request: ExecutionRequest) -> Result<StatementId> {
        let mut inner = self.lock()?;
        if let Some(message) = inner.failures.pop_front() {
            bail!(message);
        }

        inner.next_id += 1;
        let id = StatementId(format!("stmt-{}", inner.next_id));
        inner.submitted.push((id.clone(), request));
        Ok(id)
    }

    async fn describe(&self, id: &StatementId) -> Result<StatementDescription> {
        let inner = self.lock()?;
        if let Some(description) = inner.descriptions.get(id) {
            return Ok(description.clone());
        }

        inner
            .submitted
            .iter()
            .find(|(submitted, _)| submitted == id)
            .map(|(_, request)| StatementDescription {
                status: Some(StatementStatus::Submitted),
                error: None,
                cluster_identifier: Some(request.cluster_identifier.clone()),
                database: Some(request.database.clone()),
                statements: request.sqls.clone(),
            })
            .ok_or_else(|| anyhow!("statement {} not found", id))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn request(name: &str) -> ExecutionRequest {
        ExecutionRequest {
            cluster_identifier: "analytics".into(),
            database: "dev".into(),
            db_user: "loader".into(),
            sqls: vec!["select 1".into()],
            statement_name: Some(name.into()),
            with_event: true,
        }
    }

    #[tokio::test]
    async fn test_records_and_describes_submissions() {
        let warehouse = RecordingWarehouse::new();
        let id = warehouse.submit(request("dev/orders_1")).await.unwrap();

        assert_eq!(warehouse.submitted_names(), vec!["dev/orders_1"]);
        let description = warehouse.describe(&id).await.unwrap();
        assert_eq!(description.status, Some(StatementStatus::Submitted));
        assert_eq!(description.statements, vec!["select 1"]);
    }

    #[tokio::test]
    async fn test_scripted_failure_is_consumed_once() {
        let warehouse = RecordingWarehouse::new();
        warehouse.fail_next_submit("throttled");

        assert!(warehouse.submit(request("a")).await.is_err());
        assert!(warehouse.submit(request("b")).await.is_ok());
        assert_eq!(warehouse.submitted_names(), vec!["b"]);
    }
}
