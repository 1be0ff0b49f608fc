//! Configuration module.
//!
//! Handles loading, validating, and merging `bakehouse.toml`. User values are
//! merged over stock defaults, so a config file only needs the keys it wants
//! to change. Command-line flags and `BAKEHOUSE_*` environment variables
//! override the path settings on top of that (see `main.rs`).
//!
//! ## Configuration Options
//!
//! ```toml
//! # All options are optional - defaults shown below
//!
//! [paths]
//! content_dir = "content"     # Source records, one JSON file per record
//! baked_dir = "baked"         # Output tree; becomes a git working tree
//! queue_file = ".queue"       # Deploy queue, one JSON object per line
//! pending_file = ".pending"   # In-flight batch; present only mid-deploy
//!
//! [baking]
//! max_workers = 8             # Concurrent render jobs (clamped to CPU cores)
//!
//! [renderer]
//! command = ["bakehouse-render"]
//! timeout_secs = 120
//!
//! [deploy]
//! remote = "origin"
//! branch = "master"
//! publish_timeout_secs = 300
//! netlify_command = ["netlify", "deploy", "-d", ".", "--prod"]
//! # committer_name = "Site Bot"
//! # committer_email = "bot@example.org"
//!
//! [watch]
//! debounce_secs = 10
//! poll_interval_secs = 2
//!
//! [logging]
//! level = "info"              # RUST_LOG overrides
//! format = "compact"          # or "json"
//! ```
//!
//! Unknown keys are rejected to catch typos early.

use crate::bake::DEFAULT_MAX_WORKERS;
use crate::publish::Author;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// Configuration loaded from `bakehouse.toml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BakehouseConfig {
    pub paths: PathsConfig,
    pub baking: BakingConfig,
    pub renderer: RendererConfig,
    pub deploy: DeployConfig,
    pub watch: WatchConfig,
    pub logging: LoggingConfig,
}

impl BakehouseConfig {
    /// Validate config values are within acceptable ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |msg: &str| Err(ConfigError::Validation(msg.into()));
        if self.baking.max_workers == Some(0) {
            return fail("baking.max_workers must be at least 1");
        }
        if self.renderer.command.is_empty() {
            return fail("renderer.command must not be empty");
        }
        if self.renderer.timeout_secs == 0 {
            return fail("renderer.timeout_secs must be non-zero");
        }
        if self.deploy.remote.trim().is_empty() || self.deploy.branch.trim().is_empty() {
            return fail("deploy.remote and deploy.branch must not be empty");
        }
        if self.deploy.publish_timeout_secs == 0 {
            return fail("deploy.publish_timeout_secs must be non-zero");
        }
        if self.deploy.committer_name.is_some() != self.deploy.committer_email.is_some() {
            return fail("deploy.committer_name and deploy.committer_email must be set together");
        }
        if self.watch.poll_interval_secs == 0 {
            return fail("watch.poll_interval_secs must be non-zero");
        }
        if self.paths.queue_file == self.paths.pending_file {
            return fail("paths.queue_file and paths.pending_file must differ");
        }
        Ok(())
    }
}

/// Filesystem locations. Relative paths resolve against the working directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PathsConfig {
    pub content_dir: PathBuf,
    pub baked_dir: PathBuf,
    pub queue_file: PathBuf,
    pub pending_file: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            content_dir: "content".into(),
            baked_dir: "baked".into(),
            queue_file: ".queue".into(),
            pending_file: ".pending".into(),
        }
    }
}

/// Render worker settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BakingConfig {
    /// Maximum number of concurrent render jobs.
    /// Values larger than the core count are clamped down.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_workers: Option<usize>,
}

impl Default for BakingConfig {
    fn default() -> Self {
        Self {
            max_workers: Some(DEFAULT_MAX_WORKERS),
        }
    }
}

/// Resolve the effective worker count from config.
///
/// - `None` → [`DEFAULT_MAX_WORKERS`]
/// - `Some(n)` → `n`
///
/// Either way the result is capped at the available cores: the user can
/// constrain down, not up.
pub fn effective_workers(config: &BakingConfig) -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    config
        .max_workers
        .unwrap_or(DEFAULT_MAX_WORKERS)
        .clamp(1, cores)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RendererConfig {
    /// Program and leading arguments; the artifact sub-command is appended.
    pub command: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            command: vec!["bakehouse-render".into()],
            timeout_secs: 120,
        }
    }
}

impl RendererConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeployConfig {
    pub remote: String,
    pub branch: String,
    /// Per-command limit for the upload, git and push steps.
    pub publish_timeout_secs: u64,
    /// Direct-upload command, run when the baked dir has `.netlify/state.json`.
    /// Empty disables it.
    pub netlify_command: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub committer_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub committer_email: Option<String>,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            remote: "origin".into(),
            branch: "master".into(),
            publish_timeout_secs: 300,
            netlify_command: ["netlify", "deploy", "-d", ".", "--prod"]
                .map(String::from)
                .to_vec(),
            committer_name: None,
            committer_email: None,
        }
    }
}

impl DeployConfig {
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_secs(self.publish_timeout_secs)
    }

    pub fn committer(&self) -> Option<Author> {
        match (&self.committer_name, &self.committer_email) {
            (Some(name), Some(email)) => Some(Author::new(name, email)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WatchConfig {
    /// Quiet period after the last queue change before a drain starts.
    pub debounce_secs: u64,
    /// Stat-poll fallback for missed filesystem notifications.
    pub poll_interval_secs: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            debounce_secs: 10,
            poll_interval_secs: 2,
        }
    }
}

impl WatchConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_secs(self.debounce_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` wins when set.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: LogFormat::Compact,
        }
    }
}

/// Returns the stock default config as a `toml::Value::Table`.
///
/// This is the base layer for merging user overrides on top.
pub fn stock_defaults_value() -> Result<toml::Value, ConfigError> {
    Ok(toml::Value::try_from(BakehouseConfig::default())?)
}

/// Recursively merge `overlay` on top of `base`.
///
/// - Tables are merged key-by-key (overlay keys override base keys).
/// - Non-table values in overlay replace base values entirely.
/// - Keys in base that are not in overlay are preserved.
pub fn merge_toml(base: toml::Value, overlay: toml::Value) -> toml::Value {
    match (base, overlay) {
        (toml::Value::Table(mut base_table), toml::Value::Table(overlay_table)) => {
            for (key, overlay_val) in overlay_table {
                let merged = match base_table.remove(&key) {
                    Some(base_val) => merge_toml(base_val, overlay_val),
                    None => overlay_val,
                };
                base_table.insert(key, merged);
            }
            toml::Value::Table(base_table)
        }
        (_, overlay) => overlay,
    }
}

/// Load a config file as a raw TOML value.
///
/// Returns `Ok(None)` if the file does not exist.
pub fn load_raw_config(path: &Path) -> Result<Option<toml::Value>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path)?;
    Ok(Some(toml::from_str(&content)?))
}

/// Merge an optional overlay onto a base value, then deserialize and validate.
pub fn resolve_config(
    base: toml::Value,
    overlay: Option<toml::Value>,
) -> Result<BakehouseConfig, ConfigError> {
    let merged = match overlay {
        Some(ov) => merge_toml(base, ov),
        None => base,
    };
    let config: BakehouseConfig = merged.try_into()?;
    config.validate()?;
    Ok(config)
}

/// Load config from `path`, falling back to stock defaults when it is absent.
pub fn load_config(path: &Path) -> Result<BakehouseConfig, ConfigError> {
    resolve_config(stock_defaults_value()?, load_raw_config(path)?)
}

/// Returns a fully-commented stock `bakehouse.toml`.
///
/// Used by the `gen-config` CLI command.
pub fn stock_config_toml() -> &'static str {
    r##"# Bakehouse Configuration
# =======================
# All settings are optional. Remove or comment out any you don't need.
# Values shown below are the defaults. Unknown keys will cause an error.

# ---------------------------------------------------------------------------
# Paths (relative to the working directory)
# ---------------------------------------------------------------------------
[paths]
# Source records: <content_dir>/{posts,charts,pages,redirects,feeds,sitemaps}/*.json
content_dir = "content"
# Output tree. Published as a git working tree.
baked_dir = "baked"
# Deploy queue: one JSON object per line, appended by `bakehouse enqueue`.
queue_file = ".queue"
# Batch being deployed. Left behind by a crash; recovered on next drain.
pending_file = ".pending"

# ---------------------------------------------------------------------------
# Baking
# ---------------------------------------------------------------------------
[baking]
# Maximum concurrent render jobs. Clamped to the number of CPU cores.
max_workers = 8

# ---------------------------------------------------------------------------
# Renderer
# ---------------------------------------------------------------------------
[renderer]
# Program plus leading arguments. Bakehouse appends one of
# page | svg | png | variables and writes the record JSON to stdin.
command = ["bakehouse-render"]
# Seconds before a hung render is killed and counted as a failed job.
timeout_secs = 120

# ---------------------------------------------------------------------------
# Deploy
# ---------------------------------------------------------------------------
[deploy]
remote = "origin"
branch = "master"
# Seconds allowed for each publish command (upload, git add/commit/push).
publish_timeout_secs = 300
# Direct upload, run only when <baked_dir>/.netlify/state.json exists.
# Set to [] to disable.
netlify_command = ["netlify", "deploy", "-d", ".", "--prod"]
# Committer identity for hosts without a global git config.
# committer_name = "Site Bot"
# committer_email = "bot@example.org"

# ---------------------------------------------------------------------------
# Watch
# ---------------------------------------------------------------------------
[watch]
# Quiet period after the last queue change before deploying.
debounce_secs = 10
# Stat-poll interval, in case filesystem notifications are missed.
poll_interval_secs = 2

# ---------------------------------------------------------------------------
# Logging
# ---------------------------------------------------------------------------
[logging]
# tracing filter directive, e.g. "info" or "bakehouse=debug". RUST_LOG wins.
level = "info"
# "compact" for humans, "json" for log shippers.
format = "compact"
"##
}
