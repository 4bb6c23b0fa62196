use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use aws_sdk_redshiftdata::{config::Region, Client};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use super::{ExecutionRequest, StatementDescription, StatementId, StatementStatus, Warehouse};

/// Data API connection settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WarehouseConfig {
    pub region: Option<String>,
    /// Override for LocalStack and similar endpoints
    pub endpoint: Option<String>,
}

impl WarehouseConfig {
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            region: lookup("REDSHIFT_REGION").or_else(|| lookup("AWS_REGION")),
            endpoint: lookup("REDSHIFT_ENDPOINT"),
        }
    }
}

/// [`Warehouse`] backed by the Redshift Data API.
#[derive(Clone)]
pub struct RedshiftDataWarehouse {
    client: Client,
}

impl RedshiftDataWarehouse {
    pub async fn new(config: &WarehouseConfig) -> Result<Self> {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = &config.region {
            loader = loader.region(Region::new(region.clone()));
        }
        if let Some(endpoint) = &config.endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let shared = loader.load().await;

        info!(region = ?config.region, endpoint = ?config.endpoint, "Warehouse client initialized");
        Ok(Self {
            client: Client::new(&shared),
        })
    }
}

#[async_trait]
impl Warehouse for RedshiftDataWarehouse {
    #[instrument(skip_all, fields(cluster = %request.cluster_identifier, statement_name = ?request.statement_name, statements = request.sqls.len()))]
    async fn submit(&self, request: ExecutionRequest) -> Result<StatementId> {
        let output = self
            .client
            .batch_execute_statement()
            .cluster_identifier(&request.cluster_identifier)
            .database(&request.database)
            .db_user(&request.db_user)
            .set_sqls(Some(request.sqls))
            .set_statement_name(request.statement_name)
            .with_event(request.with_event)
            .send()
            .await
            .context("Failed to submit statement batch")?;

        let id = output
            .id()
            .ok_or_else(|| anyhow!("Warehouse returned no statement id"))?;
        debug!(statement_id = %id, "Statement batch submitted");
        Ok(StatementId(id.to_string()))
    }

    #[instrument(skip(self))]
    async fn describe(&self, id: &StatementId) -> Result<StatementDescription> {
        let output = self
            .client
            .describe_statement()
            .id(&id.0)
            .send()
            .await
            .with_context(|| format!("Failed to describe statement {}", id))?;

        let mut statements: Vec<String> = output
            .sub_statements()
            .iter()
            .filter_map(|sub| sub.query_string().map(str::to_string))
            .collect();
        if statements.is_empty() {
            statements.extend(output.query_string().map(str::to_string));
        }

        Ok(StatementDescription {
            status: output.status().map(|s| StatementStatus::parse(s.as_str())),
            error: output.error().map(str::to_string),
            cluster_identifier: output.cluster_identifier().map(str::to_string),
            database: output.database().map(str::to_string),
            statements,
        })
    }
}
