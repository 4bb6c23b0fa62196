//! Warehouse statement execution.
//!
//! Loads run as named statement batches. Submission returns immediately; the
//! warehouse reports the final state later through a completion event that
//! carries the statement name, which is how a finished batch is tied back to
//! the execution that owns the RUNNING slot.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod recording;
pub mod redshift;

pub use recording::RecordingWarehouse;
pub use redshift::{RedshiftDataWarehouse, WarehouseConfig};

/// Error text the warehouse reports when a batch lost a serialization race.
pub const SERIALIZABLE_VIOLATION: &str = "Serializable isolation violation";

/// Default database user statements run as.
pub const DEFAULT_DB_USER: &str = "redshift_data_api_user";

/// Identifier the warehouse assigns to a submitted batch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatementId(pub String);

impl fmt::Display for StatementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRequest {
    pub cluster_identifier: String,
    pub database: String,
    pub db_user: String,
    pub sqls: Vec<String>,
    /// Unnamed batches produce no completion the coordinator acts on
    pub statement_name: Option<String>,
    pub with_event: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatementStatus {
    Submitted,
    Picked,
    Started,
    Finished,
    Failed,
    Aborted,
    Unknown,
}

impl StatementStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.to_ascii_uppercase().as_str() {
            "SUBMITTED" => StatementStatus::Submitted,
            "PICKED" => StatementStatus::Picked,
            "STARTED" => StatementStatus::Started,
            "FINISHED" => StatementStatus::Finished,
            "FAILED" => StatementStatus::Failed,
            "ABORTED" => StatementStatus::Aborted,
            _ => StatementStatus::Unknown,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StatementStatus::Finished | StatementStatus::Failed | StatementStatus::Aborted
        )
    }
}

/// What the warehouse remembers about a submitted batch.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatementDescription {
    pub status: Option<StatementStatus>,
    pub error: Option<String>,
    pub cluster_identifier: Option<String>,
    pub database: Option<String>,
    /// Statement texts in submission order; credentials come back redacted
    pub statements: Vec<String>,
}

impl StatementDescription {
    pub fn is_serializable_violation(&self) -> bool {
        self.error
            .as_deref()
            .is_some_and(|e| e.contains(SERIALIZABLE_VIOLATION))
    }
}

#[async_trait]
pub trait Warehouse: Send + Sync + 'static {
    async fn submit(&self, request: ExecutionRequest) -> Result<StatementId>;

    async fn describe(&self, id: &StatementId) -> Result<StatementDescription>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_parse() {
        assert_eq!(StatementStatus::parse("FINISHED"), StatementStatus::Finished);
        assert_eq!(StatementStatus::parse("failed"), StatementStatus::Failed);
        assert_eq!(StatementStatus::parse("WAT"), StatementStatus::Unknown);
        assert!(StatementStatus::Aborted.is_terminal());
        assert!(!StatementStatus::Started.is_terminal());
    }

    #[test]
    fn test_serializable_violation_detection() {
        let description = StatementDescription {
            error: Some("ERROR: 1023 DETAIL: Serializable isolation violation on table".into()),
            ..Default::default()
        };
        assert!(description.is_serializable_violation());
        assert!(!StatementDescription::default().is_serializable_violation());
    }
}
