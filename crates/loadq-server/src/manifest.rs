//! COPY manifests.
//!
//! A manifest lists the files one load request covers, in the JSON layout the
//! warehouse `COPY ... manifest` command reads:
//!
//! ```json
//! {"entries":[{"url":"s3://bucket/key","mandatory":true,"meta":{"content_length":123}}]}
//! ```

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::storage::ObjectStore;
use crate::tracker::PayloadRef;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestMeta {
    pub content_length: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub url: String,
    pub mandatory: bool,
    pub meta: ManifestMeta,
}

impl ManifestEntry {
    pub fn s3(bucket: &str, key: &str, size: u64) -> Self {
        Self {
            url: format!("s3://{}/{}", bucket, key),
            mandatory: true,
            meta: ManifestMeta {
                content_length: size,
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub entries: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.entries.iter().map(|e| e.meta.content_length).sum()
    }
}

/// Reads and writes manifests in the manifest bucket.
#[derive(Clone)]
pub struct ManifestStore {
    objects: Arc<dyn ObjectStore>,
    bucket: String,
    prefix: String,
}

impl ManifestStore {
    /// `prefix` must already end with `/` (or be empty).
    pub fn new(objects: Arc<dyn ObjectStore>, bucket: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            objects,
            bucket: bucket.into(),
            prefix: prefix.into(),
        }
    }

    /// Key for a new manifest of `table`: `{prefix}{table}/{uuid}_{millis}`.
    pub fn manifest_key(&self, table: &str) -> String {
        format!(
            "{}{}/{}_{}",
            self.prefix,
            table,
            Uuid::new_v4(),
            Utc::now().timestamp_millis()
        )
    }

    #[instrument(skip(self, manifest), fields(entries = manifest.entries.len()))]
    pub async fn write(&self, table: &str, manifest: &Manifest) -> Result<PayloadRef> {
        let key = self.manifest_key(table);
        let body = serde_json::to_vec(manifest).context("Failed to serialize manifest")?;

        self.objects
            .put_object(&self.bucket, &key, body, Some("application/json"))
            .await
            .context("Failed to write manifest")?;

        debug!(bucket = %self.bucket, key = %key, "Manifest written");
        Ok(PayloadRef::new(self.bucket.clone(), key))
    }

    #[instrument(skip(self), fields(payload = %payload))]
    pub async fn read(&self, payload: &PayloadRef) -> Result<Manifest> {
        let body = self
            .objects
            .get_object(&payload.bucket, &payload.key)
            .await
            .with_context(|| format!("Failed to read manifest {}", payload))?;

        serde_json::from_slice(&body).with_context(|| format!("Malformed manifest {}", payload))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::storage::MemoryObjectStore;

    #[test]
    fn test_manifest_json_layout() {
        let manifest = Manifest {
            entries: vec![ManifestEntry::s3("landing", "orders/part-0.parquet", 2048)],
        };

        let json = serde_json::to_value(&manifest).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "entries": [{
                    "url": "s3://landing/orders/part-0.parquet",
                    "mandatory": true,
                    "meta": {"content_length": 2048}
                }]
            })
        );
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let objects = Arc::new(MemoryObjectStore::new());
        let store = ManifestStore::new(objects.clone(), "manifests", "loads/");
        let manifest = Manifest {
            entries: vec![
                ManifestEntry::s3("landing", "a.parquet", 10),
                ManifestEntry::s3("landing", "b.parquet", 20),
            ],
        };

        let payload = store.write("orders", &manifest).await.unwrap();
        assert_eq!(payload.bucket, "manifests");
        assert!(payload.key.starts_with("loads/orders/"));

        let read_back = store.read(&payload).await.unwrap();
        assert_eq!(read_back, manifest);
        assert_eq!(read_back.total_bytes(), 30);
    }

    #[test]
    fn test_manifest_key_shape() {
        let store = ManifestStore::new(Arc::new(MemoryObjectStore::new()), "m", "p/");
        let key = store.manifest_key("orders");
        let file = key.strip_prefix("p/orders/").unwrap();
        let (uuid, millis) = file.rsplit_once('_').unwrap();
        assert!(Uuid::parse_str(uuid).is_ok());
        assert!(millis.parse::<i64>().is_ok());
    }
}
