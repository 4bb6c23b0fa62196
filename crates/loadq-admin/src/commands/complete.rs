//! `loadq-admin complete` command implementation
//!
//! Retires whatever runs on a key and dispatches the next queued load. Also
//! the way to restart a key whose requests were requeued after a failed
//! dispatch.

use crate::api::types::{CompletionReport, DispatchOutcome};
use crate::api::AdminClient;
use crate::error::Result;
use colored::Colorize;

pub async fn run(client: &AdminClient, database: &str, table: &str) -> Result<()> {
    let report = client.complete(database, table).await?;
    println!("{}", describe(&report));
    Ok(())
}

pub fn describe(report: &CompletionReport) -> String {
    match report {
        CompletionReport::Idle { .. } => "Key is idle; nothing was pending.".to_string(),
        CompletionReport::Promoted {
            promoted, dispatch, ..
        } => match dispatch {
            DispatchOutcome::Submitted {
                statement_id,
                folded,
                ..
            } => format!(
                "{} {} (statement {}, {} folded)",
                "Promoted".green(),
                promoted,
                statement_id,
                folded
            ),
            DispatchOutcome::Requeued { error, .. } => format!(
                "{} {} but dispatch failed and it was requeued: {}",
                "Promoted".yellow(),
                promoted,
                error
            ),
        },
        CompletionReport::Conflict { reason, .. } => {
            format!("{} {}", "Conflict:".red(), reason)
        }
        CompletionReport::Retrying { execution } => {
            format!("Resubmission of {} scheduled", execution)
        }
        CompletionReport::Ignored { reason } => format!("Ignored: {}", reason),
    }
}
