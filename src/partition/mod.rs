#![forbid(unsafe_code)]

//! Graph partitions: the single-writer state machine that applies the
//! operation log.
//!
//! A partition opens in [`PartitionState::Opening`], recovers from its last
//! checkpoint plus the log, and then serves. A secondary that falls too far
//! behind its primary switches to [`PartitionState::CatchingUp`] until it
//! has replayed the gap. [`PartitionState::Closed`] is terminal.

use std::fmt;

use serde::Serialize;

use crate::backup::BackupEngine;
use crate::operation::OperationBatch;
use crate::storage::ExternalStorage;
use crate::types::{LogOffset, PartitionId, Result, SnapshotId, TableId};

mod apply;
mod engine;
mod options;
mod reader;

pub use apply::load_blob_name;
pub use engine::{Partition, PinGuard, CHECKPOINT_BLOB};
pub use options::{EngineKind, PartitionOptions, Role};
pub use reader::{EdgeView, PartitionReader, VertexView};

pub(crate) use engine::ApplyMode;

/// Lifecycle state of a partition.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionState {
    /// Recovering local state.
    Opening,
    /// Accepting batches and serving reads.
    Serving,
    /// Replaying a primary's log; reads may be stale, writes are rejected.
    CatchingUp,
    /// Shut down.
    Closed,
}

impl fmt::Display for PartitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PartitionState::Opening => "opening",
            PartitionState::Serving => "serving",
            PartitionState::CatchingUp => "catching_up",
            PartitionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Space accounting reported through `GetStoreState`.
#[derive(Copy, Clone, Debug, Default, Serialize, PartialEq, Eq)]
pub struct StoreState {
    /// Configured capacity.
    pub total_space: u64,
    /// Capacity minus rows, log and blobs.
    pub usable_space: u64,
}

/// What a garbage-collection pass did.
#[derive(Clone, Debug, Default, Serialize)]
pub struct GcReport {
    /// Snapshot the caller asked to collect up to.
    pub requested: SnapshotId,
    /// Snapshot actually used after clamping to watermark, backup pins and
    /// replica acknowledgements.
    pub horizon: SnapshotId,
    /// Snapshot of the checkpoint written before truncating the log.
    pub checkpoint: SnapshotId,
    pub versions_dropped: u64,
    pub keys_dropped: u64,
    pub keys_purged: u64,
    pub log_records_dropped: u64,
    pub load_files_dropped: u64,
}

/// Progress of a catch-up or reopen.
#[derive(Clone, Debug, Serialize)]
pub struct CatchUpReport {
    /// Watermark before.
    pub from: SnapshotId,
    /// Watermark after.
    pub to: SnapshotId,
    /// Primary watermark observed at the start.
    pub primary: SnapshotId,
    /// Batches applied from the primary's log.
    pub batches: u64,
    /// Snapshot of a primary checkpoint installed first, if any.
    pub installed_checkpoint: Option<SnapshotId>,
    /// State after the call.
    pub state: PartitionState,
}

/// Result of [`GraphPartition::ingest_external_file`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum IngestOutcome {
    /// The file was staged for the pending load.
    Staged {
        /// Load table.
        table: TableId,
        /// Rows in the file.
        rows: u64,
    },
    /// An identical file was already staged.
    AlreadyStaged {
        /// Load table.
        table: TableId,
    },
    /// The load was already committed.
    AlreadyCommitted {
        /// Load table.
        table: TableId,
    },
}

/// Point-in-time description of a partition, for admin tooling.
#[derive(Clone, Debug, Serialize)]
pub struct PartitionStatus {
    pub id: PartitionId,
    pub role: Role,
    pub state: PartitionState,
    pub watermark: SnapshotId,
    pub schema_version: u64,
    pub log_base: SnapshotId,
    pub log_tail: SnapshotId,
    pub log_bytes: u64,
    pub store_bytes: u64,
    pub store_keys: usize,
    pub snapshot_pins: usize,
    pub store_state: StoreState,
}

/// Capabilities every partition engine provides.
pub trait GraphPartition: Send + Sync {
    /// Fixed partition id.
    fn id(&self) -> PartitionId;

    /// Applies `batch` if `snapshot_id` is exactly one past the watermark.
    ///
    /// Returns whether the batch contained DDL. A batch at or below the
    /// watermark is an idempotent no-op. Any failure leaves the partition
    /// untouched.
    fn write_batch(&self, snapshot_id: SnapshotId, batch: &OperationBatch) -> Result<bool>;

    /// Validates `batch` against the current schema without applying it.
    fn check_batch(&self, batch: &OperationBatch) -> Result<()>;

    /// Serialized current schema.
    fn graph_def_blob(&self) -> Result<Vec<u8>>;

    /// Stages an externally built bulk file for its prepared load.
    fn ingest_external_file(&self, storage: &dyn ExternalStorage, path: &str)
        -> Result<IngestOutcome>;

    /// Drops the staged file of an uncommitted load.
    fn clear_ingest(&self, table: TableId) -> Result<bool>;

    /// Handle for creating and restoring backups.
    fn open_backup_engine(&self) -> BackupEngine<'_>;

    /// Reclaims versions, log records and load files no longer needed at or
    /// below `snapshot_id`, never past what backups and replicas still need.
    fn garbage_collect(&self, snapshot_id: SnapshotId) -> Result<GcReport>;

    /// Pulls and applies batches the primary has and this replica lacks.
    fn try_catch_up_with_primary(&self) -> Result<CatchUpReport>;

    /// Installs the primary's newer checkpoint, reconciles the watermark and
    /// catches up on the rest.
    fn reopen_secondary(&self) -> Result<CatchUpReport>;

    /// Highest fully applied snapshot.
    fn watermark(&self) -> SnapshotId;

    fn state(&self) -> PartitionState;

    fn store_state(&self) -> Result<StoreState>;

    /// Snapshots logged at or after `offset` and `timestamp_ms`.
    fn replay_records(&self, offset: LogOffset, timestamp_ms: u64) -> Result<Vec<SnapshotId>>;

    /// Flushes and closes; later writes fail with `Closed`.
    fn close(&self) -> Result<()>;
}
