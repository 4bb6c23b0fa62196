//! Per-queue loader configuration.
//!
//! Each source queue has a JSON document at `{config_prefix}{queue}.json` in
//! the config bucket describing the target table and cluster. Lookups are
//! cached only for the lifetime of an [`InvocationContext`], so a config edit
//! takes effect on the next request without a restart.

use anyhow::{Context, Result};
use loadq_common::LoadKey;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::sql::DedupMode;
use crate::storage::ObjectStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopySettings {
    /// Extra options appended to every COPY statement
    #[serde(default)]
    pub options: String,
    pub role_arn: String,
    pub table_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSettings {
    pub identifier: String,
    pub db_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeSettings {
    #[serde(default)]
    pub merge_duplicate_pks: bool,
    pub merge_pk: String,
    pub merge_timestamp: String,
}

impl MergeSettings {
    pub fn dedup_mode(&self) -> DedupMode {
        DedupMode::from_flag(self.merge_duplicate_pks)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoaderConfig {
    pub copy: CopySettings,
    pub cluster: ClusterSettings,
    pub options: MergeSettings,
}

impl LoaderConfig {
    /// The key every load driven by this config serializes on.
    pub fn load_key(&self) -> loadq_common::Result<LoadKey> {
        LoadKey::new(&self.cluster.db_name, &self.copy.table_name)
    }
}

/// Queue name of a source ARN: the text after the last `:`.
pub fn queue_name(source_ref: &str) -> &str {
    source_ref
        .rsplit_once(':')
        .map_or(source_ref, |(_, queue)| queue)
}

/// Fetches loader configs from the config bucket.
#[derive(Clone)]
pub struct ConfigResolver {
    objects: Arc<dyn ObjectStore>,
    bucket: String,
    prefix: String,
}

impl ConfigResolver {
    /// `prefix` must already end with `/` (or be empty).
    pub fn new(objects: Arc<dyn ObjectStore>, bucket: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            objects,
            bucket: bucket.into(),
            prefix: prefix.into(),
        }
    }

    pub fn config_key(&self, source_ref: &str) -> String {
        format!("{}{}.json", self.prefix, queue_name(source_ref))
    }

    /// Fetch the config for `source_ref`, bypassing any cache.
    #[instrument(skip(self))]
    pub async fn resolve(&self, source_ref: &str) -> Result<LoaderConfig> {
        let key = self.config_key(source_ref);
        let body = self
            .objects
            .get_object(&self.bucket, &key)
            .await
            .with_context(|| format!("Failed to fetch loader config s3://{}/{}", self.bucket, key))?;

        let config: LoaderConfig = serde_json::from_slice(&body)
            .with_context(|| format!("Malformed loader config s3://{}/{}", self.bucket, key))?;

        debug!(table = %config.copy.table_name, db = %config.cluster.db_name, "Loader config resolved");
        Ok(config)
    }

    pub fn context(&self) -> InvocationContext<'_> {
        InvocationContext::new(self)
    }
}

/// Config lookups scoped to one incoming request.
pub struct InvocationContext<'a> {
    resolver: &'a ConfigResolver,
    configs: HashMap<String, Arc<LoaderConfig>>,
}

impl<'a> InvocationContext<'a> {
    pub fn new(resolver: &'a ConfigResolver) -> Self {
        Self {
            resolver,
            configs: HashMap::new(),
        }
    }

    pub async fn config(&mut self, source_ref: &str) -> Result<Arc<LoaderConfig>> {
        let queue = queue_name(source_ref).to_string();
        if let Some(config) = self.configs.get(&queue) {
            return Ok(Arc::clone(config));
        }

        let config = Arc::new(self.resolver.resolve(source_ref).await?);
        self.configs.insert(queue, Arc::clone(&config));
        Ok(config)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::storage::MemoryObjectStore;
    use serde_json::json;

    const ORDERS_QUEUE: &str = "arn:aws:sqs:us-east-1:123456789012:orders-loader";

    fn orders_config() -> serde_json::Value {
        json!({
            "copy": {
                "options": "gzip",
                "role_arn": "arn:aws:iam::123456789012:role/copy",
                "table_name": "orders"
            },
            "cluster": {"identifier": "analytics", "db_name": "dev"},
            "options": {"merge_duplicate_pks": true, "merge_pk": "id", "merge_timestamp": "updated_at"}
        })
    }

    async fn resolver_with(config: serde_json::Value) -> (ConfigResolver, Arc<MemoryObjectStore>) {
        let objects = Arc::new(MemoryObjectStore::new());
        objects
            .put_object("config", "loaders/orders-loader.json", config.to_string().into_bytes(), None)
            .await
            .unwrap();
        (ConfigResolver::new(objects.clone(), "config", "loaders/"), objects)
    }

    #[test]
    fn test_queue_name() {
        assert_eq!(queue_name(ORDERS_QUEUE), "orders-loader");
        assert_eq!(queue_name("bare"), "bare");
    }

    #[tokio::test]
    async fn test_resolve_reads_queue_document() {
        let (resolver, _) = resolver_with(orders_config()).await;
        let config = resolver.resolve(ORDERS_QUEUE).await.unwrap();

        assert_eq!(config.copy.table_name, "orders");
        assert_eq!(config.cluster.identifier, "analytics");
        assert_eq!(config.options.dedup_mode(), DedupMode::MergeDuplicatePks);
        assert_eq!(config.load_key().unwrap().to_string(), "dev#orders");
    }

    #[tokio::test]
    async fn test_context_caches_per_invocation() {
        let (resolver, objects) = resolver_with(orders_config()).await;
        let mut ctx = resolver.context();
        let first = ctx.config(ORDERS_QUEUE).await.unwrap();

        let mut edited = orders_config();
        edited["copy"]["table_name"] = json!("orders_v2");
        objects
            .put_object("config", "loaders/orders-loader.json", edited.to_string().into_bytes(), None)
            .await
            .unwrap();

        let cached = ctx.config(ORDERS_QUEUE).await.unwrap();
        assert!(Arc::ptr_eq(&first, &cached));

        let mut next_request = resolver.context();
        let fresh = next_request.config(ORDERS_QUEUE).await.unwrap();
        assert_eq!(fresh.copy.table_name, "orders_v2");
    }

    #[tokio::test]
    async fn test_missing_config_is_an_error() {
        let (resolver, _) = resolver_with(orders_config()).await;
        let err = resolver.resolve("arn:aws:sqs:us-east-1:1:unknown").await.unwrap_err();
        assert!(err.to_string().contains("unknown.json"));
    }
}
