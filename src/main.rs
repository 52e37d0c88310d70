//! Scoped DB - admin entry point.
//!
//! Creates, drops or checks the databases given with `--database`.

use scoped_db::config::{Command, Config};
use scoped_db::db::Connections;
use scoped_db::error::DbError;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber
            .with(fmt::layer().with_target(true).with_thread_ids(false))
            .init();
    }
}

async fn run(config: &Config) -> Result<(), DbError> {
    let connections = Connections::new();
    for conn_config in config.parse_databases()? {
        info!(
            connection = %conn_config.name,
            url = %conn_config.masked_url(),
            "Registering database"
        );
        connections.register(conn_config)?;
    }

    for name in connections.list() {
        let client = connections.get(&name)?;
        match config.command {
            Command::Create => {
                client.db_create().await?;
                println!("{name}: created {}", client.config().database);
            }
            Command::Drop => {
                client.db_delete().await?;
                println!("{name}: dropped {}", client.config().database);
            }
            Command::Check => {
                let rows = client.execute_query("SELECT 1").await?;
                let status = client.pool_status().await;
                println!(
                    "{name}: ok ({} row, {})",
                    rows.len(),
                    client.capabilities()
                );
                if let Some(status) = status {
                    println!(
                        "{name}: pool size {} idle {}",
                        status.size, status.idle
                    );
                }
            }
        }
    }

    if !connections.close_all().await {
        error!("Some connections did not close within their grace period");
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    // Parse configuration from command line and environment
    let config = Config::parse_args();

    // Initialize logging
    init_tracing(&config);

    info!(
        command = ?config.command,
        databases = config.databases.len(),
        "Starting scoped-db v{}",
        env!("CARGO_PKG_VERSION")
    );

    if let Err(e) = run(&config).await {
        error!(error = %e, "Command failed");
        eprintln!("Error: {e}");
        if let Some(suggestion) = e.suggestion() {
            eprintln!("Hint: {suggestion}");
        }
        std::process::exit(1);
    }
}
