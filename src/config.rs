#![forbid(unsafe_code)]

//! Store configuration, read from TOML.
//!
//! ```toml
//! data_dir = "/var/lib/tessera"
//! partitions = 4
//! role = "primary"
//! sync_mode = "immediate"
//!
//! [retry]
//! max_attempts = 5
//! base_backoff_ms = 10
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::admin::{AdminError, Result};
use crate::coordinator::RetryPolicy;
use crate::partition::{EngineKind, PartitionOptions, Role};
use crate::primitives::wal::WalSyncMode;
use crate::types::PartitionId;

/// File name looked up under the platform config directory.
pub const CONFIG_FILE: &str = "tessera.toml";

/// Settings shared by every partition of a store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    /// Root of the partition directories; absent keeps everything in memory.
    pub data_dir: Option<PathBuf>,
    pub partitions: u32,
    pub role: Role,
    /// Prefix of the name replicas acknowledge under.
    pub replica_name: String,
    pub catch_up_lag_threshold: u64,
    pub catch_up_fetch_limit: usize,
    pub sync_mode: WalSyncMode,
    /// Capacity reported per partition.
    pub capacity_bytes: u64,
    /// Backups kept per partition by `retain_latest`.
    pub backup_retention: usize,
    pub scan_chunk_rows: usize,
    pub retry: RetryPolicy,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            partitions: 1,
            role: Role::Primary,
            replica_name: "replica".to_string(),
            catch_up_lag_threshold: 16,
            catch_up_fetch_limit: 256,
            sync_mode: WalSyncMode::Immediate,
            capacity_bytes: 64 << 30,
            backup_retention: 4,
            scan_chunk_rows: 1024,
            retry: RetryPolicy::default(),
        }
    }
}

impl StoreConfig {
    /// Reads and validates a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: StoreConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.partitions == 0 {
            return Err(AdminError::Message("partitions must be at least 1".into()));
        }
        if self.catch_up_fetch_limit == 0 {
            return Err(AdminError::Message(
                "catch_up_fetch_limit must be at least 1".into(),
            ));
        }
        if self.scan_chunk_rows == 0 {
            return Err(AdminError::Message("scan_chunk_rows must be at least 1".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(AdminError::Message("retry.max_attempts must be at least 1".into()));
        }
        Ok(())
    }

    /// Directory of partition `id`, when the store is on disk.
    pub fn partition_dir(&self, id: PartitionId) -> Option<PathBuf> {
        self.data_dir
            .as_ref()
            .map(|dir| dir.join(format!("partition-{:05}", id.0)))
    }

    /// Options for opening partition `id` of this store.
    pub fn partition_options(&self, id: PartitionId) -> PartitionOptions {
        let engine = match self.partition_dir(id) {
            Some(dir) => EngineKind::Disk { dir },
            None => EngineKind::Memory,
        };
        PartitionOptions::new(id, engine)
            .role(self.role)
            .replica_name(format!("{}-{}", self.replica_name, id.0))
            .sync_mode(self.sync_mode)
            .catch_up_lag_threshold(self.catch_up_lag_threshold)
            .catch_up_fetch_limit(self.catch_up_fetch_limit)
            .capacity_bytes(self.capacity_bytes)
            .scan_chunk_rows(self.scan_chunk_rows)
    }
}

/// `tessera.toml` under the platform config directory, if there is one.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("tessera").join(CONFIG_FILE))
}
