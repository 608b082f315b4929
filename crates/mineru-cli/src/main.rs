mod config;
mod serve_cmd;

#[cfg(test)]
mod test_util;

use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use mineru_core::{Principal, QueueDefaults, QueueService};
use mineru_core::maintenance::{self, MaintenanceConfig};
use mineru_core::worker::{self, WorkerConfig};
use mineru_db::models::TaskStatus;
use mineru_db::pool;

use config::MineruConfig;

/// Exit code classes per the CLI's error contract: 0 success, 1 config
/// error, 2 store unreachable, 3 port conflict.
enum CliError {
    Config(anyhow::Error),
    StoreUnreachable(anyhow::Error),
    PortConflict(anyhow::Error),
}

impl CliError {
    fn exit_code(&self) -> i32 {
        match self {
            CliError::Config(_) => 1,
            CliError::StoreUnreachable(_) => 2,
            CliError::PortConflict(_) => 3,
        }
    }

    fn inner(&self) -> &anyhow::Error {
        match self {
            CliError::Config(e) | CliError::StoreUnreachable(e) | CliError::PortConflict(e) => e,
        }
    }
}

#[derive(Parser)]
#[command(name = "mineru", about = "Document-preprocessing task orchestration core")]
struct Cli {
    /// Database URL (overrides MINERU_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a mineru config file (no database required)
    Init {
        /// PostgreSQL connection URL
        #[arg(long, default_value = "postgresql://localhost:5432/mineru")]
        db_url: String,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Initialize the mineru database (requires config file or env vars)
    DbInit,
    /// Run the API facade and in-process maintenance loop
    Serve {
        #[arg(long, default_value = "0.0.0.0")]
        bind: String,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run one worker runtime process bound to a backend
    Worker {
        /// Backend name this worker claims tasks for
        #[arg(long, default_value = "default")]
        backend: String,
        /// Worker identity recorded on claimed tasks
        #[arg(long)]
        worker_id: Option<String>,
    },
    /// Queue inspection
    Queue {
        #[command(subcommand)]
        command: QueueCommands,
    },
    /// Operator maintenance triggers
    Admin {
        #[command(subcommand)]
        command: AdminCommands,
    },
}

#[derive(Subcommand)]
enum QueueCommands {
    /// Queue-wide statistics
    Stats,
    /// List tasks, optionally filtered by status
    List {
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: i64,
        #[arg(long, default_value_t = 0)]
        offset: i64,
    },
}

#[derive(Subcommand)]
enum AdminCommands {
    /// Reclaim tasks stuck in `processing` past the stale timeout
    ResetStale {
        #[arg(long, default_value_t = 60)]
        timeout_minutes: i64,
    },
    /// Purge terminal-state tasks past the retention window
    Cleanup {
        #[arg(long, default_value_t = 7)]
        retention_days: i64,
    },
}

fn cmd_init(db_url: &str, force: bool) -> Result<(), CliError> {
    let path = config::config_path();

    if path.exists() && !force {
        return Err(CliError::Config(anyhow::anyhow!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        )));
    }

    let cfg = config::ConfigFile {
        database: config::DatabaseSection {
            url: Some(db_url.to_string()),
        },
        server: config::ServerSection::default(),
        worker: config::WorkerSection::default(),
    };

    config::save_config(&cfg).map_err(CliError::Config)?;

    println!("Config written to {}", path.display());
    println!("  database.url = {db_url}");
    println!();
    println!("Next: run `mineru db-init` to create and migrate the database.");

    Ok(())
}

async fn cmd_db_init(cli_db_url: Option<&str>) -> Result<(), CliError> {
    let resolved = MineruConfig::resolve(cli_db_url).map_err(CliError::Config)?;

    println!("Initializing mineru database...");

    pool::ensure_database_exists(&resolved.db_config)
        .await
        .map_err(CliError::StoreUnreachable)?;

    let db_pool = pool::create_pool(&resolved.db_config)
        .await
        .map_err(CliError::StoreUnreachable)?;

    let migrations_path = pool::default_migrations_path();
    pool::run_migrations(&db_pool, migrations_path)
        .await
        .map_err(CliError::StoreUnreachable)?;

    let counts = pool::table_counts(&db_pool)
        .await
        .map_err(CliError::StoreUnreachable)?;
    println!("Database ready. Tables:");
    for (table, count) in &counts {
        println!("  {table}: {count} rows");
    }

    db_pool.close().await;

    println!("mineru db-init complete.");
    Ok(())
}

/// Verify the bind address is free before standing up the rest of the
/// facade, so a port conflict fails fast with its own exit code rather
/// than surfacing as a generic startup error deep inside `axum::serve`.
async fn check_port_available(bind: &str, port: u16) -> Result<(), CliError> {
    let addr = format!("{bind}:{port}");
    match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => {
            drop(listener);
            Ok(())
        }
        Err(e) => Err(CliError::PortConflict(anyhow::anyhow!(
            "cannot bind {addr}: {e}"
        ))),
    }
}

async fn cmd_serve(resolved: &MineruConfig, bind: &str, port: Option<u16>) -> Result<(), CliError> {
    let port = port.unwrap_or(resolved.api_port);
    check_port_available(bind, port).await?;

    let db_pool = pool::create_pool(&resolved.db_config)
        .await
        .map_err(CliError::StoreUnreachable)?;

    tokio::fs::create_dir_all(&resolved.output_root)
        .await
        .map_err(|e| CliError::Config(e.into()))?;
    tokio::fs::create_dir_all(&resolved.upload_root)
        .await
        .map_err(|e| CliError::Config(e.into()))?;

    let queue = Arc::new(QueueService::new(
        db_pool.clone(),
        QueueDefaults::default(),
        resolved.known_backends.clone(),
    ));
    let state = serve_cmd::AppState {
        queue,
        upload_root: resolved.upload_root.clone(),
        max_upload_size_bytes: resolved.max_upload_size_bytes,
    };

    let cancel = tokio_util::sync::CancellationToken::new();
    let maintenance_config = MaintenanceConfig {
        stale_timeout_minutes: resolved.stale_timeout_minutes,
        purge_retention_days: resolved.purge_retention_days,
        reset_interval: std::time::Duration::from_secs(
            resolved.maintenance_reset_interval_minutes * 60,
        ),
        purge_interval: std::time::Duration::from_secs(
            resolved.maintenance_purge_interval_hours * 3600,
        ),
        ..MaintenanceConfig::default()
    };
    let maintenance_pool = db_pool.clone();
    let maintenance_cancel = cancel.clone();
    tokio::spawn(async move {
        maintenance::run_maintenance(maintenance_pool, maintenance_config, maintenance_cancel).await;
    });

    let result = serve_cmd::run_serve(state, bind, port).await;
    cancel.cancel();
    db_pool.close().await;
    result.map_err(CliError::StoreUnreachable)
}

/// Run one worker process. It binds every (device, slot) pair from the
/// resolved config as its own long-lived `run_worker` task, all claiming
/// against the same `backend` and sharing one engine registry and pool.
async fn cmd_worker(
    resolved: &MineruConfig,
    backend: String,
    worker_id: Option<String>,
) -> Result<(), CliError> {
    let db_pool = pool::create_pool(&resolved.db_config)
        .await
        .map_err(CliError::StoreUnreachable)?;
    let registry = Arc::new(
        build_engine_registry(resolved, &backend).map_err(CliError::Config)?,
    );

    let cancel = tokio_util::sync::CancellationToken::new();
    let shutdown_cancel = cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        shutdown_cancel.cancel();
    });

    let base_id = worker_id.unwrap_or_else(|| format!("{}-{}", backend, std::process::id()));
    let mut handles = Vec::new();
    for device in &resolved.devices {
        for slot in 0..resolved.workers_per_device {
            let config = WorkerConfig {
                worker_id: format!("{base_id}-dev{device}-{slot}"),
                backend: backend.clone(),
                device: Some(device.clone()),
                poll_interval: std::time::Duration::from_millis(resolved.poll_interval_ms),
                output_root: resolved.output_root.clone(),
            };
            handles.push(tokio::spawn(worker::run_worker(
                db_pool.clone(),
                registry.clone(),
                config,
                cancel.clone(),
            )));
        }
    }

    for handle in handles {
        let _ = handle.await;
    }
    db_pool.close().await;
    Ok(())
}

/// Build the engine registry for a worker process. Currently ships a
/// single `ProcessEngineAdapter` registered under the worker's backend
/// name; `[engines]` config-file overrides land here when added.
fn build_engine_registry(
    _resolved: &MineruConfig,
    backend: &str,
) -> Result<mineru_core::engine::EngineRegistry> {
    let mut registry = mineru_core::engine::EngineRegistry::new();
    let adapter = mineru_core::engine::ProcessEngineAdapter::new(
        backend,
        "mineru-engine",
        vec![],
        std::time::Duration::from_secs(300),
    );
    registry.register(adapter);
    Ok(registry)
}

async fn cmd_queue(resolved: &MineruConfig, command: QueueCommands) -> Result<(), CliError> {
    let db_pool = pool::create_pool(&resolved.db_config)
        .await
        .map_err(CliError::StoreUnreachable)?;
    let queue = QueueService::new(db_pool.clone(), QueueDefaults::default(), resolved.known_backends.clone());
    let principal = Principal::local_superuser();

    match command {
        QueueCommands::Stats => {
            let stats = queue
                .stats(&principal)
                .await
                .map_err(|e| CliError::StoreUnreachable(anyhow::anyhow!(e.to_string())))?;
            println!(
                "{}",
                serde_json::to_string_pretty(&stats).map_err(|e| CliError::Config(e.into()))?
            );
        }
        QueueCommands::List { status, limit, offset } => {
            let status: Option<TaskStatus> = status
                .map(|s| s.parse())
                .transpose()
                .map_err(|e: mineru_db::models::TaskStatusParseError| {
                    CliError::Config(anyhow::anyhow!(e.to_string()))
                })?;
            let tasks = queue
                .list(&principal, None, status, limit, offset)
                .await
                .map_err(|e| CliError::StoreUnreachable(anyhow::anyhow!(e.to_string())))?;
            println!(
                "{}",
                serde_json::to_string_pretty(&tasks).map_err(|e| CliError::Config(e.into()))?
            );
        }
    }

    db_pool.close().await;
    Ok(())
}

async fn cmd_admin(resolved: &MineruConfig, command: AdminCommands) -> Result<(), CliError> {
    let db_pool = pool::create_pool(&resolved.db_config)
        .await
        .map_err(CliError::StoreUnreachable)?;
    let queue = QueueService::new(db_pool.clone(), QueueDefaults::default(), resolved.known_backends.clone());
    let principal = Principal::local_superuser();

    match command {
        AdminCommands::ResetStale { timeout_minutes } => {
            let count = queue
                .reset_stale(&principal, timeout_minutes)
                .await
                .map_err(|e| CliError::StoreUnreachable(anyhow::anyhow!(e.to_string())))?;
            println!("Reclaimed {count} stale task(s).");
        }
        AdminCommands::Cleanup { retention_days } => {
            let count = queue
                .purge_old(&principal, retention_days)
                .await
                .map_err(|e| CliError::StoreUnreachable(anyhow::anyhow!(e.to_string())))?;
            println!("Purged {count} task(s) past retention.");
        }
    }

    db_pool.close().await;
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("{:#}", e.inner());
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    match cli.command {
        Commands::Init { db_url, force } => {
            cmd_init(&db_url, force)?;
        }
        Commands::DbInit => {
            cmd_db_init(cli.database_url.as_deref()).await?;
        }
        Commands::Serve { bind, port } => {
            let resolved = MineruConfig::resolve(cli.database_url.as_deref())
                .map_err(CliError::Config)?;
            cmd_serve(&resolved, &bind, port).await?;
        }
        Commands::Worker { backend, worker_id } => {
            let resolved = MineruConfig::resolve(cli.database_url.as_deref())
                .map_err(CliError::Config)?;
            cmd_worker(&resolved, backend, worker_id).await?;
        }
        Commands::Queue { command } => {
            let resolved = MineruConfig::resolve(cli.database_url.as_deref())
                .map_err(CliError::Config)?;
            cmd_queue(&resolved, command).await?;
        }
        Commands::Admin { command } => {
            let resolved = MineruConfig::resolve(cli.database_url.as_deref())
                .map_err(CliError::Config)?;
            cmd_admin(&resolved, command).await?;
        }
    }

    Ok(())
}
