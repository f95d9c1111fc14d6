use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use trainalert_storage::sqlite::SqliteStore;
use trainalert_storage::RuleStore;

use trainalert_server::config::{self, RulesSeedFile};
use trainalert_server::service::{AlertService, Stores};

#[allow(clippy::print_stderr)]
fn print_usage() {
    eprintln!("Usage:");
    eprintln!("  trainalert-server [config.toml]                          Start the alert engine");
    eprintln!("  trainalert-server init-rules <config.toml> <rules.json>  Initialize alert rules from seed file");
}

#[tokio::main]
async fn main() -> Result<()> {
    trainalert_common::id::init(1, 1);

    let mut filter = EnvFilter::from_default_env();
    for directive in [
        "trainalert_server=info",
        "trainalert_alert=info",
        "trainalert_notify=info",
        "trainalert_storage=info",
    ] {
        filter = filter.add_directive(directive.parse()?);
    }
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args: Vec<String> = std::env::args().collect();

    match args.get(1).map(|s| s.as_str()) {
        Some("init-rules") => {
            let config_path = args.get(2).ok_or_else(|| {
                print_usage();
                anyhow::anyhow!("init-rules requires <config.toml> and <rules.json> arguments")
            })?;
            let seed_path = args.get(3).ok_or_else(|| {
                print_usage();
                anyhow::anyhow!("init-rules requires <rules.json> argument")
            })?;
            run_init_rules(config_path, seed_path).await
        }
        Some("--help" | "-h") => {
            print_usage();
            Ok(())
        }
        _ => {
            let config_path = args
                .get(1)
                .map(|s| s.as_str())
                .unwrap_or("config/server.toml");
            run_server(config_path).await
        }
    }
}

/// Load alert rules from a JSON seed file into the SQLite rule table.
async fn run_init_rules(config_path: &str, seed_path: &str) -> Result<()> {
    let config = config::ServerConfig::load(config_path)?;
    let store = SqliteStore::open(Path::new(&config.storage.database_path))?;

    let seed_content = std::fs::read_to_string(seed_path)
        .map_err(|e| anyhow::anyhow!("Failed to read seed file '{}': {}", seed_path, e))?;
    let seed: RulesSeedFile = serde_json::from_str(&seed_content)
        .map_err(|e| anyhow::anyhow!("Failed to parse seed file '{}': {}", seed_path, e))?;

    // Existing rule names, for dedup of seeds without an explicit id
    let existing = store.load_active_rules().await?;
    let existing_names: std::collections::HashSet<String> =
        existing.iter().map(|r| r.name.clone()).collect();

    let mut created = 0u32;
    let mut skipped = 0u32;

    for rule in seed.rules {
        if rule.id.is_none() && existing_names.contains(&rule.name) {
            tracing::warn!(name = %rule.name, "Alert rule already exists, skipping");
            skipped += 1;
            continue;
        }

        let name = rule.name.clone();
        let record = match rule.into_record() {
            Ok(record) => record,
            Err(e) => {
                tracing::error!(name = %name, error = %e, "Invalid alert rule in seed file");
                skipped += 1;
                continue;
            }
        };

        match store.insert_rule(&record) {
            Ok(id) => {
                tracing::info!(name = %name, id, "Alert rule created");
                created += 1;
            }
            Err(e) => {
                tracing::error!(name = %name, error = %e, "Failed to create alert rule");
            }
        }
    }

    tracing::info!(created, skipped, "init-rules completed");
    Ok(())
}

async fn run_server(config_path: &str) -> Result<()> {
    let config = config::ServerConfig::load(config_path)?;
    let store = Arc::new(SqliteStore::open(Path::new(&config.storage.database_path))?);

    let service = AlertService::new(&config, Stores::shared(store));
    let cancel = CancellationToken::new();
    let handles = service.start(cancel.clone()).await?;

    signal::ctrl_c().await?;
    tracing::info!("Shutting down gracefully");
    cancel.cancel();

    for handle in handles {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "Background task panicked");
        }
    }
    tracing::info!("Server stopped");

    Ok(())
}
