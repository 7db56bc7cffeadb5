// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2020 Joyent, Inc.
// Copyright 2026 Edgecast Cloud LLC.

//! Rebalancer Manager Service
//!
//! The rebalancer manager orchestrates object evacuation jobs across
//! storage nodes. It:
//!
//! - Receives job creation requests (evacuate a storage node)
//! - Discovers objects on the source node through the locator
//! - Creates assignments and dispatches them to rebalancer agents
//! - Updates object metadata once copies are in place
//! - Tracks job progress in PostgreSQL

use std::sync::Arc;

use anyhow::{Context, Result};
use dropshot::{ConfigDropshot, ConfigLogging, ConfigLoggingLevel, HttpServerStarter};
use tokio::sync::watch;
use tracing::info;

use rebalancer_manager::RebalancerManagerImpl;
use rebalancer_manager::catalog::CatalogClient;
use rebalancer_manager::config::ManagerConfig;
use rebalancer_manager::context::{self, ApiContext};
use rebalancer_manager::db::Database;
use rebalancer_manager::jobs::Services;
use rebalancer_manager::jobs::evacuate::agent::HttpAgentClient;
use rebalancer_manager::jobs::evacuate::db::EvacuateDb;
use rebalancer_manager::locator::LocatorClient;
use rebalancer_manager::metrics;
use rebalancer_manager::storinfo::StorinfoClient;

/// Default bind address for the HTTP server.
const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8878";

/// Default maximum request body size (bytes).
const DEFAULT_BODY_MAX_BYTES: usize = 10 * 1024 * 1024; // 10MB

fn print_version() {
    let version = env!("CARGO_PKG_VERSION");
    let name = env!("CARGO_PKG_NAME");
    let buildstamp = option_env!("STAMP").unwrap_or("no-STAMP");
    println!("{} {} ({})", name, version, buildstamp);
}

fn print_usage(program: &str) {
    print_version();
    println!("Usage: {} [OPTIONS]", program);
    println!();
    println!("Options:");
    println!("  -h, --help       Display this information");
    println!("  -V, --version    Display the program's version number");
    println!();
    println!("Environment variables:");
    println!(
        "  BIND_ADDRESS     Server bind address (default: {})",
        DEFAULT_BIND_ADDRESS
    );
    println!("  DATABASE_URL     PostgreSQL connection URL (required)");
    println!("  STORINFO_URL     Storinfo service URL (required)");
    println!("  LOCATOR_URL      Object locator service URL (required)");
    println!("  CATALOG_URL      Object metadata service URL (required)");
    println!("  AGENT_PORT       Port the rebalancer agents listen on (default: 7878)");
    println!("  CONFIG_FILE      Path to JSON config file for SIGUSR1 reloading (optional)");
    println!("  RUST_LOG         Log filter (default: rebalancer_manager=info,dropshot=info)");
}

#[tokio::main]
async fn main() -> Result<()> {
    // Handle --version and --help
    let args: Vec<String> = std::env::args().collect();
    #[allow(clippy::never_loop)] // Intentional: early return on first recognized arg
    for arg in &args[1..] {
        match arg.as_str() {
            "-V" | "--version" => {
                print_version();
                return Ok(());
            }
            "-h" | "--help" => {
                print_usage(&args[0]);
                return Ok(());
            }
            _ => {
                eprintln!("Unknown option: {}", arg);
                std::process::exit(1);
            }
        }
    }

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "rebalancer_manager=info,dropshot=info".to_string()),
        ))
        .init();

    print_version();

    // Load configuration. The file, when present, supplies the tunables.
    let mut config = ManagerConfig::from_env().context("Failed to load configuration")?;
    let config_file = std::env::var("CONFIG_FILE").ok().map(std::path::PathBuf::from);
    if let Some(path) = &config_file {
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            let file_config = ManagerConfig::from_file(path).await?;
            config.merge_reloadable(&file_config);
        } else {
            tracing::warn!(
                config_file = %path.display(),
                "CONFIG_FILE specified but file does not exist, config reloading disabled"
            );
        }
    }
    info!("Database URL: {}", config.database_url_display());
    info!("Storinfo URL: {}", config.storinfo_url);
    info!("Locator URL: {}", config.locator_url);
    info!("Catalog URL: {}", config.catalog_url);

    metrics::register_metrics().context("Failed to register metrics")?;

    // Persistence
    let database = Database::new(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    let objects = EvacuateDb::new(database.pool())
        .await
        .context("Failed to initialize object tables")?;

    // A previous process may have died mid-job.
    let interrupted = context::recover_interrupted_jobs(&database)
        .await
        .context("Failed to recover interrupted jobs")?;
    if !interrupted.is_empty() {
        info!(count = interrupted.len(), "Marked interrupted jobs as failed");
    }

    // Remote services
    let timeout = config.http_timeout_secs;
    let services = Services {
        jobs: Arc::new(database),
        objects: Arc::new(objects),
        storinfo: Arc::new(
            StorinfoClient::new(config.storinfo_url.clone(), timeout)
                .context("Failed to create storinfo client")?,
        ),
        locator: Arc::new(
            LocatorClient::new(config.locator_url.clone(), timeout)
                .context("Failed to create locator client")?,
        ),
        catalog: Arc::new(
            CatalogClient::new(config.catalog_url.clone(), timeout)
                .context("Failed to create catalog client")?,
        ),
        agents: Arc::new(
            HttpAgentClient::new(config.agent_port, timeout)
                .context("Failed to create agent client")?,
        ),
    };

    let (config_tx, config_rx) = watch::channel(config.clone());

    // Start config file watcher if CONFIG_FILE is set (Unix only)
    #[cfg(unix)]
    if let Some(path) = config_file {
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            info!(
                config_file = %path.display(),
                "Config watcher started - send SIGUSR1 to reload"
            );
            tokio::spawn(ManagerConfig::start_config_watcher(
                path,
                config.clone(),
                config_tx,
            ));
        }
    }
    #[cfg(not(unix))]
    drop((config_file, config_tx));

    let api_context = ApiContext::new(services, config_rx);

    // Get API description from the trait implementation
    let api = rebalancer_manager_api::rebalancer_manager_api_mod::api_description::<
        RebalancerManagerImpl,
    >()
    .map_err(|e| anyhow::anyhow!("Failed to create API description: {}", e))?;

    // Configure the server
    let bind_address = std::env::var("BIND_ADDRESS")
        .unwrap_or_else(|_| DEFAULT_BIND_ADDRESS.to_string())
        .parse()
        .context("Invalid BIND_ADDRESS")?;

    let config_dropshot = ConfigDropshot {
        bind_address,
        default_request_body_max_bytes: DEFAULT_BODY_MAX_BYTES,
        default_handler_task_mode: dropshot::HandlerTaskMode::Detached,
        ..Default::default()
    };

    let config_logging = ConfigLogging::StderrTerminal {
        level: ConfigLoggingLevel::Info,
    };

    let log = config_logging
        .to_logger("rebalancer-manager")
        .map_err(|error| anyhow::anyhow!("failed to create logger: {}", error))?;

    // Start the server
    let server = HttpServerStarter::new(&config_dropshot, api, api_context, &log)
        .map_err(|error| anyhow::anyhow!("failed to create server: {}", error))?
        .start();

    info!("Rebalancer manager running on http://{}", bind_address);

    server
        .await
        .map_err(|error| anyhow::anyhow!("server failed: {}", error))
}
