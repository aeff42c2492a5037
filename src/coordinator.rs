#![forbid(unsafe_code)]

//! Global snapshot assignment and fan-out to partitions.
//!
//! The coordinator numbers each submitted batch with the next global
//! snapshot and delivers a batch for that snapshot to every partition:
//! DDL goes to all of them, DML only to the partition its key routes to,
//! and a partition with nothing to do receives a marker so its watermark
//! keeps pace. The counter advances only after every partition has
//! acknowledged; a failed delivery is kept and redelivered unchanged,
//! which partitions that already applied it treat as a no-op.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::backup::BackupInfo;
use crate::operation::{Operation, OperationBatch};
use crate::partition::{GcReport, GraphPartition};
use crate::types::{BackupId, Result, SnapshotId, TesseraError};

/// Backoff for transient delivery failures.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts per partition, including the first.
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff_ms: 10,
            max_backoff_ms: 1_000,
        }
    }
}

impl RetryPolicy {
    /// Exponential delay before retry `attempt` (1-based), with up to 50%
    /// random jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .base_backoff_ms
            .saturating_mul(1u64 << attempt.saturating_sub(1).min(16))
            .min(self.max_backoff_ms);
        let jitter = if exp > 1 {
            rand::thread_rng().gen_range(0..=exp / 2)
        } else {
            0
        };
        Duration::from_millis(exp.saturating_sub(jitter))
    }
}

/// Snapshot and schema effect of a delivered batch.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Receipt {
    pub snapshot: SnapshotId,
    pub has_ddl: bool,
}

struct Sequencer {
    last: SnapshotId,
    pending: Option<OperationBatch>,
}

/// Assigns snapshots and delivers batches to a fixed set of partitions.
pub struct Coordinator {
    partitions: Vec<Arc<dyn GraphPartition>>,
    retry: RetryPolicy,
    sequencer: Mutex<Sequencer>,
}

impl Coordinator {
    /// Starts numbering after the highest watermark among `partitions`.
    pub fn new(partitions: Vec<Arc<dyn GraphPartition>>, retry: RetryPolicy) -> Result<Self> {
        if partitions.is_empty() {
            return Err(TesseraError::Invalid("coordinator needs at least one partition"));
        }
        let last = partitions
            .iter()
            .map(|p| p.watermark())
            .max()
            .unwrap_or(SnapshotId::ZERO);
        for partition in &partitions {
            if partition.watermark() < last {
                warn!(
                    partition = partition.id().0,
                    watermark = partition.watermark().0,
                    global = last.0,
                    "coordinator.partition.lagging"
                );
            }
        }
        Ok(Self {
            partitions,
            retry,
            sequencer: Mutex::new(Sequencer {
                last,
                pending: None,
            }),
        })
    }

    pub fn partitions(&self) -> &[Arc<dyn GraphPartition>] {
        &self.partitions
    }

    /// Last snapshot every partition acknowledged.
    pub fn snapshot(&self) -> SnapshotId {
        self.sequencer.lock().last
    }

    /// Whether a batch is waiting for redelivery.
    pub fn has_pending(&self) -> bool {
        self.sequencer.lock().pending.is_some()
    }

    /// Validates `operations`, assigns the next snapshot and delivers.
    ///
    /// A batch rejected by validation consumes no snapshot. A pending batch
    /// from an earlier failed delivery goes out first.
    pub fn submit(&self, operations: Vec<Operation>, trace_id: &str) -> Result<Receipt> {
        let mut seq = self.sequencer.lock();
        self.flush_pending(&mut seq)?;
        let snapshot = seq.last.next();
        let batch = OperationBatch::new(snapshot, trace_id, operations);
        self.partitions[0].check_batch(&batch)?;
        seq.pending = Some(batch.clone());
        let has_ddl = self.deliver(&batch)?;
        seq.pending = None;
        seq.last = snapshot;
        info!(
            snapshot = snapshot.0,
            ops = batch.len(),
            ddl = has_ddl,
            trace_id,
            "coordinator.submit"
        );
        Ok(Receipt { snapshot, has_ddl })
    }

    /// Redelivers the pending batch, if any.
    pub fn retry_pending(&self) -> Result<Option<Receipt>> {
        let mut seq = self.sequencer.lock();
        self.flush_pending(&mut seq)
    }

    fn flush_pending(&self, seq: &mut Sequencer) -> Result<Option<Receipt>> {
        let Some(batch) = seq.pending.clone() else {
            return Ok(None);
        };
        debug!(snapshot = batch.latest_snapshot_id().0, "coordinator.redeliver");
        let has_ddl = self.deliver(&batch)?;
        seq.pending = None;
        seq.last = batch.latest_snapshot_id();
        Ok(Some(Receipt {
            snapshot: seq.last,
            has_ddl,
        }))
    }

    fn deliver(&self, batch: &OperationBatch) -> Result<bool> {
        let mut has_ddl = false;
        for (index, partition) in self.partitions.iter().enumerate() {
            let routed = self.route(batch, index);
            has_ddl |= self.write_with_retry(partition.as_ref(), &routed)?;
        }
        Ok(has_ddl)
    }

    /// The slice of `batch` partition `index` applies, in batch order.
    pub fn route(&self, batch: &OperationBatch, index: usize) -> OperationBatch {
        let count = self.partitions.len() as u64;
        let ops: Vec<Operation> = batch
            .operations()
            .iter()
            .filter(|op| op.op_type().is_ddl() || op.partition_key() % count == index as u64)
            .cloned()
            .collect();
        if ops.is_empty() {
            return OperationBatch::marker(batch.latest_snapshot_id(), batch.trace_id());
        }
        OperationBatch::new(batch.latest_snapshot_id(), batch.trace_id(), ops)
    }

    fn write_with_retry(&self, partition: &dyn GraphPartition, batch: &OperationBatch) -> Result<bool> {
        let snapshot = batch.latest_snapshot_id();
        let mut attempt = 1;
        loop {
            match partition.write_batch(snapshot, batch) {
                Ok(has_ddl) => return Ok(has_ddl),
                Err(err) if err.is_retryable() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.backoff(attempt);
                    warn!(
                        partition = partition.id().0,
                        snapshot = snapshot.0,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "coordinator.write_batch.retry"
                    );
                    thread::sleep(delay);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Backs up every partition at the current global snapshot.
    ///
    /// Submissions are held off for the duration so all partitions pin the
    /// same snapshot.
    pub fn create_backup(&self) -> Result<BackupInfo> {
        let seq = self.sequencer.lock();
        if seq.pending.is_some() {
            return Err(TesseraError::Invalid(
                "a batch is awaiting redelivery; retry it before backing up",
            ));
        }
        let mut infos = Vec::with_capacity(self.partitions.len());
        for partition in &self.partitions {
            infos.push(partition.open_backup_engine().create_backup()?);
        }
        let global = infos
            .iter()
            .map(|info| info.global_backup_id)
            .max()
            .unwrap_or(BackupId(0));
        let merged = BackupInfo::merge(global, infos)?;
        info!(
            backup = global.0,
            snapshot = merged.snapshot_id.0,
            partitions = merged.partition_backups.len(),
            "coordinator.backup"
        );
        Ok(merged)
    }

    /// Restores every partition to `info` and continues numbering after it.
    pub fn restore_backup(&self, info: &BackupInfo) -> Result<()> {
        let mut seq = self.sequencer.lock();
        for partition in &self.partitions {
            partition.open_backup_engine().restore(info)?;
        }
        seq.pending = None;
        seq.last = info.snapshot_id;
        Ok(())
    }

    /// Replays what every partition's log kept after a restore to `info`
    /// and continues numbering after the highest watermark reached.
    pub fn replay_after_restore(&self, info: &BackupInfo) -> Result<SnapshotId> {
        let mut seq = self.sequencer.lock();
        for partition in &self.partitions {
            let replayed = partition.open_backup_engine().replay_after(info)?;
            debug!(
                partition = partition.id().0,
                replayed,
                watermark = partition.watermark().0,
                "coordinator.replay"
            );
        }
        let last = self
            .partitions
            .iter()
            .map(|p| p.watermark())
            .max()
            .unwrap_or(seq.last);
        for partition in &self.partitions {
            if partition.watermark() < last {
                warn!(
                    partition = partition.id().0,
                    watermark = partition.watermark().0,
                    global = last.0,
                    "coordinator.partition.lagging"
                );
            }
        }
        seq.last = last;
        Ok(last)
    }

    /// Collects every partition up to `snapshot`.
    pub fn garbage_collect(&self, snapshot: SnapshotId) -> Result<Vec<GcReport>> {
        self.partitions
            .iter()
            .map(|partition| partition.garbage_collect(snapshot))
            .collect()
    }
}
