//! `loadq-admin bulk-load` command implementation
//!
//! Submits explicit S3 paths for loading outside the coordinator. The request
//! is read from a JSON file shaped like the `POST /api/v1/bulk-loads` body.

use crate::api::types::BulkLoadRequest;
use crate::api::AdminClient;
use crate::error::{AdminError, Result};
use std::path::Path;

pub async fn read_request(path: &Path) -> Result<BulkLoadRequest> {
    let raw = tokio::fs::read_to_string(path).await?;
    let request: BulkLoadRequest = serde_json::from_str(&raw)?;
    if request.paths.is_empty() {
        return Err(AdminError::invalid_argument(format!(
            "{} lists no paths",
            path.display()
        )));
    }
    Ok(request)
}

pub async fn run(client: &AdminClient, file: &Path) -> Result<()> {
    let request = read_request(file).await?;
    let reports = client.bulk_load(&request).await?;

    for report in &reports {
        println!("{} -> {} (statement {})", report.s3_path, report.table, report.statement_id);
    }
    println!("Submitted {} bulk load(s)", reports.len());
    Ok(())
}
