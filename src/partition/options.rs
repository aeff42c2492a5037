#![forbid(unsafe_code)]

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::primitives::io::{BlobStore, FileIo};
use crate::primitives::wal::WalSyncMode;
use crate::types::PartitionId;

/// Replica role of a partition.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Accepts batches from the coordinator.
    #[default]
    Primary,
    /// Follows a primary through catch-up.
    Secondary,
}

/// Storage backend selected when the partition opens.
#[derive(Clone)]
pub enum EngineKind {
    /// Volatile log and blobs; state is lost on drop.
    Memory,
    /// Log at `dir/oplog.wal`, blobs under `dir/blobs/`.
    Disk {
        /// Partition directory.
        dir: PathBuf,
    },
    /// Caller-supplied log file and blob store.
    Custom {
        /// Operation log backend.
        log: Arc<dyn FileIo>,
        /// Checkpoint, backup and load blob backend.
        blobs: Arc<dyn BlobStore>,
    },
}

impl fmt::Debug for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineKind::Memory => f.write_str("Memory"),
            EngineKind::Disk { dir } => f.debug_struct("Disk").field("dir", dir).finish(),
            EngineKind::Custom { .. } => f.write_str("Custom"),
        }
    }
}

/// Options for opening a [`super::Partition`].
#[derive(Clone, Debug)]
pub struct PartitionOptions {
    pub id: PartitionId,
    pub engine: EngineKind,
    pub role: Role,
    /// Name this replica acknowledges progress under.
    pub replica_name: String,
    pub sync_mode: WalSyncMode,
    /// Lag (in snapshots) above which a secondary enters catching-up.
    pub catch_up_lag_threshold: u64,
    /// Batches fetched from the primary per round trip.
    pub catch_up_fetch_limit: usize,
    /// Capacity reported as total space.
    pub capacity_bytes: u64,
    /// Rows read per lock acquisition during backups and checkpoints.
    pub scan_chunk_rows: usize,
}

impl PartitionOptions {
    pub fn new(id: PartitionId, engine: EngineKind) -> Self {
        Self {
            id,
            engine,
            role: Role::Primary,
            replica_name: format!("replica-{}", id.0),
            sync_mode: WalSyncMode::Immediate,
            catch_up_lag_threshold: 16,
            catch_up_fetch_limit: 256,
            capacity_bytes: 64 << 30,
            scan_chunk_rows: 1024,
        }
    }

    /// In-memory partition with fsync disabled, for tests and tools.
    pub fn in_memory(id: PartitionId) -> Self {
        Self::new(id, EngineKind::Memory).sync_mode(WalSyncMode::Off)
    }

    pub fn role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    pub fn replica_name(mut self, name: impl Into<String>) -> Self {
        self.replica_name = name.into();
        self
    }

    pub fn sync_mode(mut self, mode: WalSyncMode) -> Self {
        self.sync_mode = mode;
        self
    }

    pub fn catch_up_lag_threshold(mut self, lag: u64) -> Self {
        self.catch_up_lag_threshold = lag;
        self
    }

    pub fn catch_up_fetch_limit(mut self, limit: usize) -> Self {
        self.catch_up_fetch_limit = limit.max(1);
        self
    }

    pub fn capacity_bytes(mut self, bytes: u64) -> Self {
        self.capacity_bytes = bytes;
        self
    }

    pub fn scan_chunk_rows(mut self, rows: usize) -> Self {
        self.scan_chunk_rows = rows.max(1);
        self
    }
}
