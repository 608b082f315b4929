//! Configuration file management for mineru.
//!
//! Provides a TOML-based config file at `~/.config/mineru/config.toml` and a
//! resolution chain: CLI flag > env var > config file > default.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use mineru_db::config::DbConfig;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize, Default)]
pub struct ConfigFile {
    #[serde(default)]
    pub database: DatabaseSection,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub worker: WorkerSection,
}

#[derive(Debug, Serialize, Deserialize, Default)]
pub struct DatabaseSection {
    pub url: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ServerSection {
    pub api_port: Option<u16>,
    pub max_request_timeout_seconds: Option<u64>,
    pub max_upload_size_bytes: Option<u64>,
    pub output_root: Option<String>,
    pub upload_root: Option<String>,
    pub maintenance_reset_interval_minutes: Option<u64>,
    pub maintenance_purge_interval_hours: Option<u64>,
    pub stale_timeout_minutes: Option<i64>,
    pub purge_retention_days: Option<i64>,
    /// Comma-separated backend names tasks may be submitted against. Empty
    /// or absent means no allow-list is enforced at submit time.
    pub known_backends: Option<String>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            api_port: None,
            max_request_timeout_seconds: None,
            max_upload_size_bytes: None,
            output_root: None,
            upload_root: None,
            maintenance_reset_interval_minutes: None,
            maintenance_purge_interval_hours: None,
            stale_timeout_minutes: None,
            purge_retention_days: None,
            known_backends: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Default)]
pub struct WorkerSection {
    pub worker_port: Option<u16>,
    pub devices: Option<String>,
    pub workers_per_device: Option<u32>,
    pub poll_interval_ms: Option<u64>,
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the mineru config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/mineru` or `~/.config/mineru`.
/// We intentionally ignore the platform-specific `dirs::config_dir()`
/// (which returns `~/Library/Application Support` on macOS).
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("mineru");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("mineru")
}

/// Return the path to the mineru config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file. Returns an error if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
/// Sets file permissions to 0600 on Unix.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Fully resolved configuration, ready for use. One instance covers both
/// the `serve` and `worker` subcommands; each reads only the fields it
/// needs.
#[derive(Debug, Clone)]
pub struct MineruConfig {
    pub db_config: DbConfig,
    pub api_port: u16,
    pub worker_port: u16,
    pub devices: Vec<String>,
    pub workers_per_device: u32,
    pub poll_interval_ms: u64,
    pub stale_timeout_minutes: i64,
    pub purge_retention_days: i64,
    pub maintenance_reset_interval_minutes: u64,
    pub maintenance_purge_interval_hours: u64,
    pub max_request_timeout_seconds: u64,
    pub max_upload_size_bytes: u64,
    pub output_root: PathBuf,
    pub upload_root: PathBuf,
    pub known_backends: Vec<String>,
}

impl MineruConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config
    /// file > default. Only the database URL takes a CLI override today;
    /// the rest come from env/config/default, following the same chain.
    pub fn resolve(cli_db_url: Option<&str>) -> Result<Self> {
        let file_config = load_config().unwrap_or_default();

        let db_url = if let Some(url) = cli_db_url {
            url.to_string()
        } else if let Ok(url) = std::env::var("MINERU_DATABASE_URL") {
            url
        } else if let Some(url) = file_config.database.url.clone() {
            url
        } else {
            DbConfig::DEFAULT_URL.to_string()
        };
        let db_config = DbConfig::new(db_url);

        let server = file_config.server;
        let worker = file_config.worker;

        Ok(Self {
            db_config,
            api_port: server.api_port.unwrap_or(8000),
            worker_port: worker.worker_port.unwrap_or(9000),
            devices: worker
                .devices
                .unwrap_or_else(|| "0".to_string())
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            workers_per_device: worker.workers_per_device.unwrap_or(1),
            poll_interval_ms: worker.poll_interval_ms.unwrap_or(500),
            stale_timeout_minutes: server.stale_timeout_minutes.unwrap_or(60),
            purge_retention_days: server.purge_retention_days.unwrap_or(7),
            maintenance_reset_interval_minutes: server
                .maintenance_reset_interval_minutes
                .unwrap_or(5),
            maintenance_purge_interval_hours: server.maintenance_purge_interval_hours.unwrap_or(6),
            max_request_timeout_seconds: server.max_request_timeout_seconds.unwrap_or(300),
            max_upload_size_bytes: server.max_upload_size_bytes.unwrap_or(500 * 1024 * 1024),
            output_root: server
                .output_root
                .map(PathBuf::from)
                .unwrap_or_else(|| config_dir().join("output")),
            upload_root: server
                .upload_root
                .map(PathBuf::from)
                .unwrap_or_else(|| config_dir().join("uploads")),
            known_backends: server
                .known_backends
                .unwrap_or_default()
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        })
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
