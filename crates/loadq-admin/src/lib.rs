//! loadq admin CLI library
//!
//! Operator tooling for a running loadq server:
//!
//! - **Status**: show the running load and pending queue of a key
//! - **Complete**: retire the running load and dispatch the next one
//! - **Clear pending**: drop every queued request of a key
//! - **Bulk load**: submit explicit S3 paths outside the coordinator

pub mod api;
pub mod commands;
pub mod error;

pub use api::AdminClient;
pub use error::{AdminError, Result};

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// loadq admin - inspect and steer per-table load queues
#[derive(Parser, Debug)]
#[command(name = "loadq-admin")]
#[command(author, version, about, long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Server URL
    #[arg(long, env = "LOADQ_SERVER_URL", default_value = api::client::DEFAULT_SERVER_URL, global = true)]
    pub server_url: String,

    /// Request timeout in seconds
    #[arg(long, env = "LOADQ_API_TIMEOUT_SECS", default_value_t = api::client::DEFAULT_API_TIMEOUT_SECS, global = true)]
    pub timeout_secs: u64,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Check server health
    Health,

    /// Show the running and pending loads of a table
    Status {
        database: String,
        table: String,

        /// Include manifest file lists
        #[arg(long)]
        files: bool,
    },

    /// Complete the running load and dispatch the next queued one
    Complete { database: String, table: String },

    /// Delete every pending load of a table
    ClearPending {
        database: String,
        table: String,

        /// Skip confirmation
        #[arg(short, long)]
        yes: bool,
    },

    /// Submit an uncoordinated load of explicit S3 paths
    BulkLoad {
        /// JSON file with `copy`, `cluster` and `paths`
        #[arg(short, long)]
        file: PathBuf,
    },
}
