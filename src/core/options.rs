use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::models::ConflictAction;

/// How the resolver settles a conflicting destination file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    /// Ask the sink for every conflict, honoring "apply to all".
    #[default]
    Ask,
    /// Take the suggested action without asking.
    Suggested,
    Overwrite,
    Resume,
    Skip,
}

impl ConflictPolicy {
    /// The fixed action for the "always use" policies.
    pub fn fixed_action(self) -> Option<ConflictAction> {
        match self {
            Self::Overwrite => Some(ConflictAction::Overwrite),
            Self::Resume => Some(ConflictAction::Resume),
            Self::Skip => Some(ConflictAction::Skip),
            Self::Ask | Self::Suggested => None,
        }
    }
}

/// Engine-facing options; built from `AppConfig` by the binary.
#[derive(Debug, Clone)]
pub struct TransferOptions {
    /// Merge new batches into an idle job for the same endpoint pair.
    pub append_transfers: bool,
    /// Upper bound on jobs with a running worker.
    pub max_active_jobs: usize,
    pub preserve_permissions: bool,
    pub preserve_time: bool,
    /// Suggest Overwrite even where Resume would be possible.
    pub overwrite_default: bool,
    pub conflict_policy: ConflictPolicy,
    /// Also suggest Skip when sizes match and the destination is not older.
    pub compare_mtime: bool,
    pub block_size: usize,
    pub network_timeout: Duration,
    /// Reconnect attempts per file after a retryable failure.
    pub retries: u32,
    pub retry_sleep: Duration,
    pub stop_on_error: bool,
    pub reuse_connections: bool,
    pub pool_idle_timeout: Duration,
    /// Minimum gap between progress events for one file.
    pub progress_interval: Duration,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            append_transfers: true,
            max_active_jobs: 1,
            preserve_permissions: false,
            preserve_time: false,
            overwrite_default: false,
            conflict_policy: ConflictPolicy::Ask,
            compare_mtime: false,
            block_size: 32 * 1024,
            network_timeout: Duration::from_secs(30),
            retries: 3,
            retry_sleep: Duration::from_secs(10),
            stop_on_error: false,
            reuse_connections: true,
            pool_idle_timeout: Duration::from_secs(300),
            progress_interval: Duration::from_millis(500),
        }
    }
}
