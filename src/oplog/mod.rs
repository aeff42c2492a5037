#![forbid(unsafe_code)]

//! Operation log: [`OperationBatch`]es stored in the snapshot-keyed WAL.
//!
//! A batch is durable once [`OperationLog::append`] returns. Replay yields
//! batches strictly in snapshot order up to the tail captured when the
//! replay started; dropping the iterator part-way is always safe.

use std::sync::Arc;

use tracing::debug;

use crate::operation::OperationBatch;
use crate::primitives::io::FileIo;
use crate::primitives::wal::{Wal, WalIter, WalOptions, WalRecord, WalStats};
use crate::types::{LogOffset, PartitionId, Result, SnapshotId, TesseraError};

/// Durable, snapshot-ordered log of operation batches owned by one partition.
pub struct OperationLog {
    wal: Wal,
}

impl OperationLog {
    /// Opens the log stored in `io`.
    pub fn open(io: Arc<dyn FileIo>, options: WalOptions) -> Result<Self> {
        Ok(Self {
            wal: Wal::open(io, options)?,
        })
    }

    /// Durably appends `batch`.
    ///
    /// Fails with [`TesseraError::OutOfOrderSnapshot`] unless the batch's
    /// snapshot immediately follows the tail, and with
    /// [`TesseraError::Closed`] once the log is closed.
    pub fn append(&self, batch: &OperationBatch) -> Result<LogOffset> {
        let encoded = batch.encode()?;
        let offset = self.wal.append(batch.latest_snapshot_id(), &encoded)?;
        debug!(
            partition = self.wal.partition().0,
            snapshot = batch.latest_snapshot_id().0,
            offset = offset.0,
            ops = batch.len(),
            trace_id = batch.trace_id(),
            "oplog.append"
        );
        Ok(offset)
    }

    /// Batches with snapshot greater than `after`, in order.
    pub fn replay_from(&self, after: SnapshotId) -> Result<Replay> {
        Ok(Replay {
            inner: self.wal.iter_from(after)?,
        })
    }

    /// Like [`OperationLog::replay_from`], with each batch's log offset.
    pub fn replay_entries(
        &self,
        after: SnapshotId,
    ) -> Result<impl Iterator<Item = Result<(LogOffset, OperationBatch)>>> {
        Ok(self.wal.iter_from(after)?.map(|record| {
            record.and_then(|record| {
                let offset = record.offset;
                Replay::decode(record).map(|batch| (offset, batch))
            })
        }))
    }

    /// Raw records with snapshot greater than `after`.
    pub fn records_from(&self, after: SnapshotId) -> Result<WalIter> {
        self.wal.iter_from(after)
    }

    /// Snapshots of retained records at or after `offset` that were
    /// appended at or after `timestamp_ms`.
    pub fn snapshots_since(&self, offset: LogOffset, timestamp_ms: u64) -> Result<Vec<SnapshotId>> {
        let mut out = Vec::new();
        for record in self.wal.iter_from(self.wal.base())? {
            let record = record?;
            if record.offset >= offset && record.appended_at_ms >= timestamp_ms {
                out.push(record.snapshot);
            }
        }
        Ok(out)
    }

    /// Drops batches below `snapshot`; see [`Wal::truncate_before`].
    pub fn truncate_before(&self, snapshot: SnapshotId) -> Result<u64> {
        self.wal.truncate_before(snapshot)
    }

    /// Drops batches above `snapshot`; see [`Wal::truncate_after`].
    pub fn truncate_after(&self, snapshot: SnapshotId) -> Result<u64> {
        self.wal.truncate_after(snapshot)
    }

    /// Drops every batch and continues after `base`.
    pub fn reset(&self, base: SnapshotId) -> Result<()> {
        self.wal.reset(base)
    }

    /// Snapshot of the newest batch.
    pub fn tail(&self) -> SnapshotId {
        self.wal.tail()
    }

    /// Snapshot below the oldest retained batch.
    pub fn base(&self) -> SnapshotId {
        self.wal.base()
    }

    /// First snapshot still replayable.
    pub fn oldest_available(&self) -> SnapshotId {
        self.wal.base().next()
    }

    /// Offset of the first record after `snapshot`, or the next offset to
    /// be assigned when nothing follows it yet.
    pub fn offset_after(&self, snapshot: SnapshotId) -> LogOffset {
        self.wal
            .offset_of(snapshot.next())
            .unwrap_or_else(|| self.wal.next_offset())
    }

    pub fn partition(&self) -> PartitionId {
        self.wal.partition()
    }

    pub fn record_count(&self) -> usize {
        self.wal.record_count()
    }

    pub fn len_bytes(&self) -> Result<u64> {
        self.wal.len_bytes()
    }

    pub fn stats(&self) -> WalStats {
        self.wal.stats()
    }

    /// Closes the log; later appends fail with [`TesseraError::Closed`].
    pub fn close(&self) -> Result<()> {
        self.wal.close()
    }
}

/// Lazy iterator over logged batches.
pub struct Replay {
    inner: WalIter,
}

impl Replay {
    fn decode(record: WalRecord) -> Result<OperationBatch> {
        let batch = OperationBatch::decode(&record.payload)
            .map_err(|_| TesseraError::Corruption("logged batch failed to decode"))?;
        if batch.latest_snapshot_id() != record.snapshot {
            return Err(TesseraError::Corruption("logged batch snapshot mismatch"));
        }
        Ok(batch)
    }
}

impl Iterator for Replay {
    type Item = Result<OperationBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner
            .next()
            .map(|record| record.and_then(Replay::decode))
    }
}
