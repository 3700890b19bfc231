//! Configuration: process bootstrap config plus the runtime config provider.
//!
//! Two independent layers, matching the two config notions of the system
//! this crate is modeled on: a small static bootstrap file read once at
//! startup (this module), and the schema-driven, versioned, mutable
//! runtime configuration exposed over HTTP ([`runtime`]).

pub mod runtime;
pub mod schema;

use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Small process-level config: listen address, data directories, log
/// filter override. Trimmed down from the teacher's `Config` (no database,
/// embedding-provider, or connector sections — this system has none of
/// those).
#[derive(Debug, Clone, Deserialize)]
pub struct BootstrapConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub log_filter: Option<String>,
    /// Admission bound (C8 §4.8) on tasks that are queued or running at
    /// once.
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            data_dir: default_data_dir(),
            log_filter: None,
            max_concurrent_tasks: default_max_concurrent_tasks(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8787".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_max_concurrent_tasks() -> usize {
    1
}

impl BootstrapConfig {
    pub fn runtime_config_path(&self) -> PathBuf {
        self.data_dir.join("runtime_config.json")
    }

    pub fn progress_store_path(&self) -> PathBuf {
        self.data_dir.join("progress.json")
    }

    pub fn asset_output_dir(&self) -> PathBuf {
        self.data_dir.join("assets")
    }
}

/// Load the bootstrap config from `path` if present; an absent file is not
/// an error, it simply yields defaults (this file is optional by design).
pub fn load_bootstrap(path: &Path) -> anyhow::Result<BootstrapConfig> {
    if !path.exists() {
        return Ok(BootstrapConfig::default());
    }
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read config file {}: {e}", path.display()))?;
    let config: BootstrapConfig = toml::from_str(&content)
        .map_err(|e| anyhow::anyhow!("failed to parse config file {}: {e}", path.display()))?;
    Ok(config)
}
