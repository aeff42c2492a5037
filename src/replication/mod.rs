#![forbid(unsafe_code)]

//! Primary/secondary replication.
//!
//! A secondary pulls batches from its primary through a [`PrimaryLink`] and
//! applies them through the same path as live writes, then acknowledges its
//! new watermark. The primary keeps the acknowledgements in a
//! [`ReplicaTracker`] so garbage collection never truncates log records a
//! known replica still needs.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::operation::OperationBatch;
use crate::partition::{
    load_blob_name, ApplyMode, CatchUpReport, GraphPartition, Partition, PartitionState,
    CHECKPOINT_BLOB,
};
use crate::storage::CheckpointImage;
use crate::types::{Result, SnapshotId, TableId, TesseraError};

/// What a secondary needs from its primary.
pub trait PrimaryLink: Send + Sync {
    /// Up to `limit` batches with snapshot greater than `after`, in order.
    ///
    /// Fails with [`TesseraError::SnapshotGap`] when the primary no longer
    /// retains the batch right after `after`.
    fn fetch(&self, after: SnapshotId, limit: usize) -> Result<Vec<OperationBatch>>;

    /// The primary's applied watermark.
    fn watermark(&self) -> Result<SnapshotId>;

    /// Records that `replica` has applied everything up to `snapshot`.
    fn acknowledge(&self, replica: &str, snapshot: SnapshotId) -> Result<()>;

    /// The primary's latest checkpoint image, if it has written one.
    fn latest_checkpoint(&self) -> Result<Option<Bytes>>;

    /// The staged bulk file of load `table`.
    fn fetch_load(&self, table: TableId) -> Result<Option<Bytes>>;
}

/// [`PrimaryLink`] to a primary partition in the same process.
#[derive(Clone)]
pub struct LocalPrimary {
    primary: Arc<Partition>,
}

impl LocalPrimary {
    pub fn new(primary: Arc<Partition>) -> Self {
        Self { primary }
    }

    fn reachable(&self) -> Result<&Partition> {
        if self.primary.state() == PartitionState::Closed {
            return Err(TesseraError::PrimaryUnreachable(format!(
                "primary partition {} is closed",
                self.primary.id()
            )));
        }
        Ok(&self.primary)
    }
}

impl PrimaryLink for LocalPrimary {
    fn fetch(&self, after: SnapshotId, limit: usize) -> Result<Vec<OperationBatch>> {
        let primary = self.reachable()?;
        let watermark = primary.watermark();
        let mut out = Vec::new();
        for batch in primary.log().replay_from(after)?.take(limit) {
            let batch = batch?;
            if batch.latest_snapshot_id() > watermark {
                break;
            }
            out.push(batch);
        }
        Ok(out)
    }

    fn watermark(&self) -> Result<SnapshotId> {
        Ok(self.reachable()?.watermark())
    }

    fn acknowledge(&self, replica: &str, snapshot: SnapshotId) -> Result<()> {
        self.reachable()?.replicas().acknowledge(replica, snapshot);
        Ok(())
    }

    fn latest_checkpoint(&self) -> Result<Option<Bytes>> {
        self.reachable()?.blobs().get(CHECKPOINT_BLOB)
    }

    fn fetch_load(&self, table: TableId) -> Result<Option<Bytes>> {
        self.reachable()?.blobs().get(&load_blob_name(table))
    }
}

/// Last snapshot acknowledged by each replica of a primary.
#[derive(Debug, Default)]
pub struct ReplicaTracker {
    acked: Mutex<BTreeMap<String, SnapshotId>>,
}

impl ReplicaTracker {
    /// Records an acknowledgement; acknowledgements never move backwards.
    pub fn acknowledge(&self, replica: &str, snapshot: SnapshotId) {
        let mut acked = self.acked.lock();
        let entry = acked.entry(replica.to_string()).or_insert(snapshot);
        if snapshot > *entry {
            *entry = snapshot;
        }
        debug!(replica, snapshot = entry.0, "replication.ack");
    }

    /// Lowest acknowledged snapshot across replicas.
    pub fn min_acknowledged(&self) -> Option<SnapshotId> {
        self.acked.lock().values().min().copied()
    }

    /// Stops holding back garbage collection for `replica`.
    pub fn forget(&self, replica: &str) -> bool {
        let removed = self.acked.lock().remove(replica).is_some();
        if removed {
            info!(replica, "replication.replica.forgotten");
        }
        removed
    }

    pub fn snapshot(&self) -> BTreeMap<String, SnapshotId> {
        self.acked.lock().clone()
    }
}

/// Installs the primary's checkpoint when it is ahead of `partition`.
/// The caller holds the writer lock.
pub(crate) fn install_newer_checkpoint(
    partition: &Partition,
    link: &dyn PrimaryLink,
) -> Result<Option<SnapshotId>> {
    let Some(blob) = link.latest_checkpoint()? else {
        return Ok(None);
    };
    let image = CheckpointImage::decode(&blob)?;
    let local = partition.watermark();
    if image.snapshot <= local {
        debug!(
            partition = partition.id().0,
            checkpoint = image.snapshot.0,
            watermark = local.0,
            "replication.reopen.checkpoint_not_newer"
        );
        return Ok(None);
    }
    let snapshot = image.snapshot;
    partition.install_image(&blob, image)?;
    info!(
        partition = partition.id().0,
        from = local.0,
        to = snapshot.0,
        "replication.reopen.reconciled"
    );
    Ok(Some(snapshot))
}

/// Applies the batches `link` has beyond the local watermark. The caller
/// holds the writer lock.
///
/// A lag above the configured threshold moves the partition to
/// `CatchingUp` until the primary's watermark (as observed at the start)
/// is reached; a failure leaves it there.
pub(crate) fn catch_up(
    partition: &Partition,
    link: &dyn PrimaryLink,
    installed_checkpoint: Option<SnapshotId>,
) -> Result<CatchUpReport> {
    let from = partition.watermark();
    let primary = link.watermark()?;
    let lag = primary.0.saturating_sub(from.0);
    if lag > partition.options().catch_up_lag_threshold {
        partition.set_state(PartitionState::CatchingUp);
    }
    let batches = match pull(partition, link, primary) {
        Ok(batches) => batches,
        Err(err) => {
            match &err {
                TesseraError::SnapshotGap { needed, oldest } => warn!(
                    partition = partition.id().0,
                    needed = needed.0,
                    oldest = oldest.0,
                    "replication.catch_up.gap"
                ),
                other => warn!(
                    partition = partition.id().0,
                    watermark = partition.watermark().0,
                    error = %other,
                    "replication.catch_up.failed"
                ),
            }
            return Err(err);
        }
    };
    let to = partition.watermark();
    link.acknowledge(&partition.options().replica_name, to)?;
    partition.set_state(PartitionState::Serving);
    info!(
        partition = partition.id().0,
        from = from.0,
        to = to.0,
        primary = primary.0,
        batches,
        "replication.catch_up.done"
    );
    Ok(CatchUpReport {
        from,
        to,
        primary,
        batches,
        installed_checkpoint,
        state: partition.state(),
    })
}

fn pull(partition: &Partition, link: &dyn PrimaryLink, target: SnapshotId) -> Result<u64> {
    let limit = partition.options().catch_up_fetch_limit;
    let mut applied = 0;
    while partition.watermark() < target {
        let fetched = link.fetch(partition.watermark(), limit)?;
        if fetched.is_empty() {
            break;
        }
        for batch in &fetched {
            partition.apply_locked(batch, ApplyMode::Replicated, Some(link))?;
            applied += 1;
        }
    }
    Ok(applied)
}
