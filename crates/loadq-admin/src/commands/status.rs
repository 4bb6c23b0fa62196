//! `loadq-admin status` command implementation
//!
//! Shows the running load and the pending queue of one key.

use crate::api::types::{LoadStatus, TrackedLoad};
use crate::api::AdminClient;
use crate::error::Result;
use colored::Colorize;
use std::fmt::Write;

pub async fn run(client: &AdminClient, database: &str, table: &str, files: bool) -> Result<()> {
    let status = client.load_status(database, table, files).await?;
    print!("{}", render(&status));
    Ok(())
}

fn render_load(out: &mut String, load: &TrackedLoad) {
    let _ = writeln!(out, "  {}", load.execution_name.to_string().green());
    let _ = writeln!(out, "    Manifest: s3://{}/{}", load.payload.bucket, load.payload.key);
    let _ = writeln!(out, "    Source:   {}", load.source_ref);
    let _ = writeln!(out, "    Created:  {}", load.created_at.to_rfc3339());
    if let Some(folded) = load.coalesced_count {
        let _ = writeln!(out, "    Folded:   {}", folded);
    }
    if let Some(files) = &load.files {
        let _ = writeln!(out, "    Files:    {}", files.len());
        for file in files {
            let _ = writeln!(out, "      {}", file.url);
        }
    }
}

pub fn render(status: &LoadStatus) -> String {
    let mut out = String::new();
    let key = &status.load_key;
    let _ = writeln!(out, "{} {}.{}", "Load key:".cyan().bold(), key.database(), key.table());
    let _ = writeln!(out);

    let _ = writeln!(out, "{}", "Running:".cyan().bold());
    match &status.running {
        Some(load) => render_load(&mut out, load),
        None => {
            let _ = writeln!(out, "  (idle)");
        }
    }
    let _ = writeln!(out);

    let _ = writeln!(out, "{} {}", "Pending:".cyan().bold(), status.pending.len());
    for load in &status.pending {
        render_load(&mut out, load);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn status(running: serde_json::Value, pending: serde_json::Value) -> LoadStatus {
        serde_json::from_value(json!({
            "load_key": {"database": "dev", "table": "orders"},
            "running": running,
            "pending": pending
        }))
        .unwrap()
    }

    fn load(name: &str) -> serde_json::Value {
        json!({
            "slot": "RUNNING",
            "execution_name": name,
            "payload": {"bucket": "manifests", "key": "manifests/orders/a"},
            "source_ref": "arn:aws:sqs:us-east-1:1:orders-loader",
            "coalesced_count": 2,
            "created_at": "2024-07-01T00:00:00Z"
        })
    }

    #[test]
    fn test_render_idle_key() {
        colored::control::set_override(false);
        let text = render(&status(json!(null), json!([])));
        assert!(text.contains("Load key: dev.orders"));
        assert!(text.contains("(idle)"));
        assert!(text.contains("Pending: 0"));
    }

    #[test]
    fn test_render_running_and_pending() {
        colored::control::set_override(false);
        let text = render(&status(
            load("dev/orders_1719792000000-aaaaaaaa"),
            json!([load("dev/orders_1719792000500-bbbbbbbb")]),
        ));
        assert!(text.contains("dev/orders_1719792000000-aaaaaaaa"));
        assert!(text.contains("Folded:   2"));
        assert!(text.contains("Pending: 1"));
        assert!(text.contains("s3://manifests/manifests/orders/a"));
    }
}
