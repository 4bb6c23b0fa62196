//! HTTP client for the loadq server

use crate::api::{endpoints, types::*};
use crate::error::{AdminError, Result};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

/// Default timeout for API requests in seconds.
pub const DEFAULT_API_TIMEOUT_SECS: u64 = 30;

/// Default server URL when not specified on the command line or environment.
pub const DEFAULT_SERVER_URL: &str = "http://localhost:8000";

pub struct AdminClient {
    client: Client,
    base_url: String,
}

impl AdminClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `true` when the server reports its state store reachable.
    pub async fn health_check(&self) -> Result<bool> {
        let url = endpoints::health_url(&self.base_url);

        match self.client.get(&url).send().await {
            Ok(response) => Ok(response.status().is_success()),
            Err(e) => {
                debug!(error = %e, "Health check request failed");
                Ok(false)
            }
        }
    }

    pub async fn load_status(
        &self,
        database: &str,
        table: &str,
        expand_files: bool,
    ) -> Result<LoadStatus> {
        let url = endpoints::load_status_url(&self.base_url, database, table, expand_files);
        let response = self.client.get(&url).send().await?;
        parse(response).await
    }

    /// Retire the running load of a key and dispatch the next one.
    pub async fn complete(&self, database: &str, table: &str) -> Result<CompletionReport> {
        let url = endpoints::complete_url(&self.base_url, database, table);
        let response = self.client.post(&url).send().await?;
        parse(response).await
    }

    /// Drop every queued request of a key.
    pub async fn clear_pending(&self, database: &str, table: &str) -> Result<ClearedPending> {
        let url = endpoints::pending_url(&self.base_url, database, table);
        let response = self.client.delete(&url).send().await?;
        parse(response).await
    }

    pub async fn bulk_load(&self, request: &BulkLoadRequest) -> Result<Vec<BulkLoadReport>> {
        let url = endpoints::bulk_loads_url(&self.base_url);
        let response = self.client.post(&url).json(request).send().await?;
        parse(response).await
    }
}

/// Unwrap the success envelope, or turn the error envelope into
/// [`AdminError::Api`].
async fn parse<T: DeserializeOwned>(response: Response) -> Result<T> {
    let status = response.status();
    let body = response.text().await?;

    if !status.is_success() {
        let message = serde_json::from_str::<ErrorResponse>(&body)
            .map(|e| e.error.message)
            .unwrap_or(body);
        return Err(AdminError::api(status.as_u16(), message));
    }

    let envelope: ApiResponse<T> = serde_json::from_str(&body)?;
    if !envelope.success {
        return Err(AdminError::api(status.as_u16(), "server reported failure"));
    }
    Ok(envelope.data)
}
