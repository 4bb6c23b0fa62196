//! Wire types of the loadq server API

use chrono::{DateTime, Utc};
use loadq_common::{ExecutionName, LoadKey};
use serde::{Deserialize, Serialize};

/// Success envelope
#[derive(Debug, Clone, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: T,
    #[serde(default)]
    pub meta: Option<serde_json::Value>,
}

/// Error envelope: `{"error": {"message", "status"}}`
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ErrorDetail {
    pub message: String,
    pub status: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadRef {
    pub bucket: String,
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ManifestFile {
    pub url: String,
    #[serde(default)]
    pub meta: Option<ManifestFileMeta>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ManifestFileMeta {
    pub content_length: u64,
}

/// One tracking record as reported by the status endpoint.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TrackedLoad {
    pub slot: String,
    pub execution_name: ExecutionName,
    pub payload: PayloadRef,
    pub source_ref: String,
    #[serde(default)]
    pub coalesced_count: Option<u32>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub files: Option<Vec<ManifestFile>>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LoadStatus {
    pub load_key: LoadKey,
    pub running: Option<TrackedLoad>,
    #[serde(default)]
    pub pending: Vec<TrackedLoad>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ClearedPending {
    pub load_key: LoadKey,
    pub deleted: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DispatchOutcome {
    Submitted {
        execution: ExecutionName,
        statement_id: String,
        folded: u32,
    },
    Requeued {
        execution: ExecutionName,
        error: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CompletionReport {
    Ignored {
        reason: String,
    },
    Idle {
        #[serde(default)]
        execution: Option<ExecutionName>,
    },
    Promoted {
        #[serde(default)]
        execution: Option<ExecutionName>,
        promoted: ExecutionName,
        dispatch: DispatchOutcome,
    },
    Conflict {
        #[serde(default)]
        execution: Option<ExecutionName>,
        reason: String,
    },
    Retrying {
        execution: ExecutionName,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkCopySettings {
    pub role_arn: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkClusterSettings {
    pub identifier: String,
    pub db_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkMergeOptions {
    #[serde(default)]
    pub merge_duplicate_pks: bool,
    pub merge_pk: String,
    pub merge_timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkPath {
    pub s3_path: String,
    pub table: String,
    pub options: BulkMergeOptions,
}

/// Body of `POST /api/v1/bulk-loads`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkLoadRequest {
    pub copy: BulkCopySettings,
    pub cluster: BulkClusterSettings,
    pub paths: Vec<BulkPath>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BulkLoadReport {
    pub s3_path: String,
    pub table: String,
    pub statement_id: String,
}
