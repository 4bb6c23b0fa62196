//! loadq admin CLI - Main entry point

use clap::Parser;
use loadq_admin::{commands, AdminClient, Cli, Commands};
use loadq_common::logging::{init_logging, LogConfig, LogLevel, LogOutput};
use std::process;
use std::time::Duration;
use tracing::error;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let log_config = LogConfig::builder()
        .level(if cli.verbose {
            LogLevel::Debug
        } else {
            LogLevel::Warn
        })
        .output(LogOutput::Console)
        .log_file_prefix("loadq-admin")
        .build();

    // Environment variables take precedence
    let log_config = LogConfig::from_env_over(log_config.clone()).unwrap_or(log_config);

    // The CLI works without logging
    let _guard = init_logging(&log_config).ok();

    if let Err(e) = execute(&cli).await {
        error!(error = %e, "Command failed");
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

async fn execute(cli: &Cli) -> loadq_admin::Result<()> {
    let client = AdminClient::new(&cli.server_url, Duration::from_secs(cli.timeout_secs))?;

    match &cli.command {
        Commands::Health => {
            if client.health_check().await? {
                println!("{} is healthy", client.base_url());
                Ok(())
            } else {
                Err(loadq_admin::AdminError::api(503, "server is unhealthy or unreachable"))
            }
        }
        Commands::Status {
            database,
            table,
            files,
        } => commands::status::run(&client, database, table, *files).await,
        Commands::Complete { database, table } => {
            commands::complete::run(&client, database, table).await
        }
        Commands::ClearPending {
            database,
            table,
            yes,
        } => commands::pending::clear(&client, database, table, *yes).await,
        Commands::BulkLoad { file } => commands::bulk_load::run(&client, file).await,
    }
}
