//! Configuration schema, defaults, and layered loading.
//!
//! Precedence: defaults < TOML file < environment (`XFERQ_`) < CLI.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::core::{ConflictPolicy, TransferOptions};

pub const DEFAULT_CONFIG_FILE: &str = "xferq.toml";
pub const MIN_BLOCK_SIZE: usize = 512;
pub const MAX_BLOCK_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LogSettings {
    pub json: bool,
    pub verbose: bool,
}

/// Fully resolved application configuration after all layers merge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Merge new batches into a queued job for the same endpoints.
    pub append_transfers: bool,
    pub one_transfer_at_a_time: bool,
    /// Limit on running jobs when `one_transfer_at_a_time` is off.
    pub max_active_jobs: usize,
    pub preserve_permissions: bool,
    pub preserve_time: bool,
    /// Suggest Overwrite instead of Resume for smaller destination files.
    pub overwrite_default: bool,
    pub conflict_policy: ConflictPolicy,
    pub compare_mtime: bool,
    /// Bytes per chunk.
    pub trans_blksize: usize,
    /// Seconds.
    pub network_timeout: u64,
    pub retries: u32,
    /// Seconds between a failure and the reconnect.
    pub sleep_time: u64,
    pub stop_on_error: bool,
    pub reuse_connections: bool,
    /// Seconds.
    pub pool_idle_timeout: u64,
    /// fsync local destination files.
    pub sync_files: bool,
    pub log: LogSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            append_transfers: true,
            one_transfer_at_a_time: true,
            max_active_jobs: 4,
            preserve_permissions: false,
            preserve_time: false,
            overwrite_default: false,
            conflict_policy: ConflictPolicy::Ask,
            compare_mtime: false,
            trans_blksize: 32 * 1024,
            network_timeout: 30,
            retries: 3,
            sleep_time: 10,
            stop_on_error: false,
            reuse_connections: true,
            pool_idle_timeout: 300,
            sync_files: false,
            log: LogSettings::default(),
        }
    }
}

impl AppConfig {
    /// Load defaults, then `path` (or `xferq.toml`), then `XFERQ_*`
    /// variables, then `overrides`. A missing file is not an error.
    pub fn load<T: Serialize>(path: Option<&Path>, overrides: Option<&T>) -> Result<Self> {
        let path: PathBuf = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

        let mut figment = Figment::new()
            .merge(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(&path))
            .merge(Env::prefixed("XFERQ_").split("__"));
        if let Some(overrides) = overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }

        let config: AppConfig = figment
            .extract()
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot work with.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            (MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&self.trans_blksize),
            "Invalid config: trans_blksize must be between {MIN_BLOCK_SIZE} and {MAX_BLOCK_SIZE}"
        );
        ensure!(
            self.max_active_jobs >= 1,
            "Invalid config: max_active_jobs must be >= 1"
        );
        ensure!(
            self.network_timeout >= 1,
            "Invalid config: network_timeout must be >= 1 second"
        );
        Ok(())
    }

    /// Engine options for this configuration.
    pub fn transfer_options(&self) -> TransferOptions {
        TransferOptions {
            append_transfers: self.append_transfers,
            max_active_jobs: if self.one_transfer_at_a_time {
                1
            } else {
                self.max_active_jobs
            },
            preserve_permissions: self.preserve_permissions,
            preserve_time: self.preserve_time,
            overwrite_default: self.overwrite_default,
            conflict_policy: self.conflict_policy,
            compare_mtime: self.compare_mtime,
            block_size: self.trans_blksize,
            network_timeout: Duration::from_secs(self.network_timeout),
            retries: self.retries,
            retry_sleep: Duration::from_secs(self.sleep_time),
            stop_on_error: self.stop_on_error,
            reuse_connections: self.reuse_connections,
            pool_idle_timeout: Duration::from_secs(self.pool_idle_timeout),
            ..TransferOptions::default()
        }
    }

    /// The merged configuration as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }
}
