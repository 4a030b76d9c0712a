//! Configuration file management for corral.
//!
//! Provides a TOML-based config file at `~/.config/corral/config.toml` and
//! a resolution chain: CLI flag > env var > config file > default.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use corral_core::config::EngineConfig;
use corral_db::config::DbConfig;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    pub database: DatabaseSection,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub engine: EngineSection,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct DatabaseSection {
    pub url: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ServerSection {
    pub bind: String,
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_owned(),
            port: 8080,
        }
    }
}

/// Optional overrides for the engine tunables. Anything unset falls back
/// to the built-in default.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct EngineSection {
    pub default_lease_secs: Option<u64>,
    pub max_lease_secs: Option<u64>,
    pub heartbeat_interval_secs: Option<u64>,
    pub stale_orchestrator_secs: Option<u64>,
    pub default_page_size: Option<i64>,
    pub max_page_size: Option<i64>,
    pub burnout_turn_threshold: Option<i32>,
    pub max_turn_limit: Option<i32>,
    pub reconcile_interval_secs: Option<u64>,
}

impl EngineSection {
    /// Overlay this section on the built-in defaults.
    pub fn to_engine_config(&self) -> EngineConfig {
        let defaults = EngineConfig::default();
        EngineConfig {
            default_lease_secs: self.default_lease_secs.unwrap_or(defaults.default_lease_secs),
            max_lease_secs: self.max_lease_secs.unwrap_or(defaults.max_lease_secs),
            heartbeat_interval_secs: self
                .heartbeat_interval_secs
                .unwrap_or(defaults.heartbeat_interval_secs),
            stale_orchestrator_secs: self
                .stale_orchestrator_secs
                .unwrap_or(defaults.stale_orchestrator_secs),
            default_page_size: self.default_page_size.unwrap_or(defaults.default_page_size),
            max_page_size: self.max_page_size.unwrap_or(defaults.max_page_size),
            burnout_turn_threshold: self
                .burnout_turn_threshold
                .unwrap_or(defaults.burnout_turn_threshold),
            max_turn_limit: self.max_turn_limit.unwrap_or(defaults.max_turn_limit),
            reconcile_interval_secs: self
                .reconcile_interval_secs
                .unwrap_or(defaults.reconcile_interval_secs),
        }
    }
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the corral config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/corral` or `~/.config/corral`.
/// We intentionally ignore the platform-specific `dirs::config_dir()`
/// (which returns `~/Library/Application Support` on macOS).
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("corral");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("corral")
}

/// Return the path to the corral config file.
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

    // Set permissions to 0600 (owner read/write only) on Unix.
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

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct CorralConfig {
    pub db_config: DbConfig,
    pub engine_config: EngineConfig,
    pub server: ServerSection,
}

impl CorralConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config
    /// file > default.
    pub fn resolve(cli_db_url: Option<&str>) -> Result<Self> {
        let file_config = load_config().ok();

        let db_url = if let Some(url) = cli_db_url {
            url.to_owned()
        } else if let Ok(url) = std::env::var("CORRAL_DATABASE_URL") {
            url
        } else if let Some(ref file) = file_config {
            file.database.url.clone()
        } else {
            DbConfig::DEFAULT_URL.to_owned()
        };

        let engine_config = file_config
            .as_ref()
            .map(|f| f.engine.to_engine_config())
            .unwrap_or_default();

        let server = file_config.map(|f| f.server).unwrap_or_default();

        Ok(Self {
            db_config: DbConfig::new(db_url),
            engine_config,
            server,
        })
    }
}
