//! Object-created notifications delivered in queue batches.
//!
//! A batch carries records from one or more queues. Each record body is an S3
//! event notification; every object it names becomes one manifest entry, and
//! entries are grouped by the queue they arrived on since the queue selects
//! the loader config.

use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::manifest::{Manifest, ManifestEntry};

/// Queue batch as delivered to `POST /api/v1/notifications`.
#[derive(Debug, Clone, Deserialize)]
pub struct NotificationBatch {
    #[serde(rename = "Records", default)]
    pub records: Vec<QueueRecord>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueRecord {
    #[serde(rename = "eventSourceARN", default)]
    pub event_source_arn: Option<String>,
    #[serde(default)]
    pub body: String,
}

#[derive(Debug, Deserialize)]
struct S3Event {
    #[serde(rename = "Records", default)]
    records: Vec<S3EventRecord>,
}

#[derive(Debug, Deserialize)]
struct S3EventRecord {
    s3: S3Entity,
}

#[derive(Debug, Deserialize)]
struct S3Entity {
    bucket: S3Bucket,
    object: S3Object,
}

#[derive(Debug, Deserialize)]
struct S3Bucket {
    name: String,
}

#[derive(Debug, Deserialize)]
struct S3Object {
    key: String,
    #[serde(default)]
    size: u64,
}

/// Decode an object key as it appears in an S3 event (form-encoded).
pub fn decode_object_key(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    match urlencoding::decode(&spaced) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => spaced,
    }
}

fn is_queue_source(arn: &str) -> bool {
    arn.contains("sqs")
}

/// Group the objects of a batch into one manifest per source queue.
///
/// Records from non-queue sources, unparsable bodies and bodies without
/// object records (such as the S3 test event) are skipped.
pub fn manifests_by_source(batch: &NotificationBatch) -> BTreeMap<String, Manifest> {
    let mut manifests: BTreeMap<String, Manifest> = BTreeMap::new();

    for record in &batch.records {
        let Some(arn) = record.event_source_arn.as_deref().filter(|arn| is_queue_source(arn))
        else {
            debug!(source = ?record.event_source_arn, "Skipping record from non-queue source");
            continue;
        };

        let event: S3Event = match serde_json::from_str(&record.body) {
            Ok(event) => event,
            Err(e) => {
                warn!(source = %arn, error = %e, "Skipping unparsable notification body");
                continue;
            }
        };

        for s3_record in event.records {
            let key = decode_object_key(&s3_record.s3.object.key);
            manifests
                .entry(arn.to_string())
                .or_default()
                .entries
                .push(ManifestEntry::s3(
                    &s3_record.s3.bucket.name,
                    &key,
                    s3_record.s3.object.size,
                ));
        }
    }

    manifests.retain(|_, manifest| !manifest.is_empty());
    manifests
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    const ORDERS_QUEUE: &str = "arn:aws:sqs:us-east-1:123456789012:orders-loader";
    const EVENTS_QUEUE: &str = "arn:aws:sqs:us-east-1:123456789012:events-loader";

    fn s3_body(bucket: &str, key: &str, size: u64) -> String {
        json!({
            "Records": [{
                "s3": {
                    "bucket": {"name": bucket},
                    "object": {"key": key, "size": size}
                }
            }]
        })
        .to_string()
    }

    fn batch(records: serde_json::Value) -> NotificationBatch {
        serde_json::from_value(json!({ "Records": records })).unwrap()
    }

    #[test]
    fn test_decode_object_key() {
        assert_eq!(decode_object_key("dt%3D2024-01-01/part+0.parquet"), "dt=2024-01-01/part 0.parquet");
        assert_eq!(decode_object_key("plain/key.parquet"), "plain/key.parquet");
    }

    #[test]
    fn test_groups_entries_by_source() {
        let batch = batch(json!([
            {"eventSourceARN": ORDERS_QUEUE, "body": s3_body("landing", "orders/a.parquet", 10)},
            {"eventSourceARN": EVENTS_QUEUE, "body": s3_body("landing", "events/x.parquet", 5)},
            {"eventSourceARN": ORDERS_QUEUE, "body": s3_body("landing", "orders/b.parquet", 20)},
        ]));

        let manifests = manifests_by_source(&batch);
        assert_eq!(manifests.len(), 2);

        let orders = &manifests[ORDERS_QUEUE];
        let urls: Vec<&str> = orders.entries.iter().map(|e| e.url.as_str()).collect();
        assert_eq!(urls, vec!["s3://landing/orders/a.parquet", "s3://landing/orders/b.parquet"]);
        assert_eq!(orders.total_bytes(), 30);
        assert!(orders.entries.iter().all(|e| e.mandatory));
    }

    #[test]
    fn test_skips_foreign_sources_and_test_events() {
        let batch = batch(json!([
            {"eventSourceARN": "arn:aws:kinesis:us-east-1:1:stream/x", "body": s3_body("b", "k", 1)},
            {"eventSourceARN": ORDERS_QUEUE, "body": json!({"Event": "s3:TestEvent"}).to_string()},
            {"eventSourceARN": ORDERS_QUEUE, "body": "not json"},
            {"body": s3_body("b", "k", 1)},
        ]));

        assert!(manifests_by_source(&batch).is_empty());
    }
}
