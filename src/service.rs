#![forbid(unsafe_code)]

//! In-process form of the store's RPC surface.
//!
//! [`StoreService`] owns the partitions of one store node and answers the
//! wire calls (`WriteBatch`, `GetStoreState`, `IngestData`, `ClearIngest`,
//! `CompactDB`, `ReopenSecondary`, `ReplayRecords`) against them. Transport
//! is left to the embedder.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::StoreConfig;
use crate::coordinator::{Coordinator, RetryPolicy};
use crate::operation::OperationBatch;
use crate::partition::{
    CatchUpReport, GcReport, GraphPartition, IngestOutcome, Partition, PartitionStatus,
    StoreState,
};
use crate::replication::LocalPrimary;
use crate::storage::ExternalStorage;
use crate::types::{LogOffset, PartitionId, Result, SnapshotId, TableId, TesseraError};

/// Path of partition `id`'s bulk file inside an ingest directory.
pub fn ingest_file_path(data_path: &str, id: PartitionId) -> String {
    format!("{}/part-{:05}.tsbl", data_path.trim_end_matches('/'), id.0)
}

/// Partitions of one store node plus the bookkeeping of in-flight ingests.
pub struct StoreService {
    partitions: Vec<Arc<Partition>>,
    retry: RetryPolicy,
    backup_retention: usize,
    ingests: Mutex<BTreeMap<String, Vec<(PartitionId, TableId)>>>,
}

impl StoreService {
    /// Opens every partition the configuration describes.
    pub fn open(config: &StoreConfig) -> Result<Self> {
        let mut partitions = Vec::with_capacity(config.partitions as usize);
        for id in 0..config.partitions {
            let options = config.partition_options(PartitionId(id));
            partitions.push(Arc::new(Partition::open(options)?));
        }
        info!(
            partitions = partitions.len(),
            role = ?config.role,
            data_dir = ?config.data_dir,
            "service.open"
        );
        let mut service = Self::with_partitions(partitions, config.retry.clone());
        service.backup_retention = config.backup_retention;
        Ok(service)
    }

    /// Serves already opened partitions.
    pub fn with_partitions(partitions: Vec<Arc<Partition>>, retry: RetryPolicy) -> Self {
        Self {
            partitions,
            retry,
            backup_retention: StoreConfig::default().backup_retention,
            ingests: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn partitions(&self) -> &[Arc<Partition>] {
        &self.partitions
    }

    pub fn partition(&self, id: PartitionId) -> Result<&Arc<Partition>> {
        self.partitions
            .iter()
            .find(|p| p.id() == id)
            .ok_or(TesseraError::NotFound)
    }

    /// Coordinator over this node's partitions.
    pub fn coordinator(&self) -> Result<Coordinator> {
        let partitions = self
            .partitions
            .iter()
            .map(|p| Arc::clone(p) as Arc<dyn GraphPartition>)
            .collect();
        Coordinator::new(partitions, self.retry.clone())
    }

    /// Makes each partition here a follower of the same partition in
    /// `primary`.
    pub fn follow(&self, primary: &StoreService) -> Result<()> {
        for partition in &self.partitions {
            let leader = primary.partition(partition.id())?;
            partition.set_primary(Arc::new(LocalPrimary::new(Arc::clone(leader))));
        }
        Ok(())
    }

    /// `WriteBatch`: returns whether the batch contained DDL.
    pub fn write_batch(
        &self,
        partition: PartitionId,
        snapshot_id: SnapshotId,
        batch: &OperationBatch,
    ) -> Result<bool> {
        self.partition(partition)?.write_batch(snapshot_id, batch)
    }

    /// `GetStoreState`.
    pub fn get_store_state(&self) -> Result<BTreeMap<u32, StoreState>> {
        self.partitions
            .iter()
            .map(|p| Ok((p.id().0, p.store_state()?)))
            .collect()
    }

    /// `IngestData`: stages `part-NNNNN.tsbl` from `data_path` on every
    /// partition that has one.
    pub fn ingest_data(
        &self,
        data_path: &str,
        storage: &dyn ExternalStorage,
    ) -> Result<Vec<(PartitionId, IngestOutcome)>> {
        let mut outcomes = Vec::new();
        let mut tables = Vec::new();
        for partition in &self.partitions {
            let path = ingest_file_path(data_path, partition.id());
            let outcome = match partition.ingest_external_file(storage, &path) {
                Ok(outcome) => outcome,
                Err(TesseraError::Io(err)) if err.kind() == ErrorKind::NotFound => {
                    debug!(partition = partition.id().0, path, "service.ingest.no_file");
                    continue;
                }
                Err(err) => return Err(err),
            };
            let table = match &outcome {
                IngestOutcome::Staged { table, .. }
                | IngestOutcome::AlreadyStaged { table }
                | IngestOutcome::AlreadyCommitted { table } => *table,
            };
            tables.push((partition.id(), table));
            outcomes.push((partition.id(), outcome));
        }
        info!(data_path, files = outcomes.len(), "service.ingest");
        self.ingests
            .lock()
            .entry(data_path.to_string())
            .or_default()
            .extend(tables);
        Ok(outcomes)
    }

    /// `ClearIngest`: drops what `ingest_data(data_path)` staged and has
    /// not been committed. Returns false for an unknown path.
    pub fn clear_ingest(&self, data_path: &str) -> Result<bool> {
        let Some(tables) = self.ingests.lock().remove(data_path) else {
            return Ok(false);
        };
        for (id, table) in tables {
            self.partition(id)?.clear_ingest(table)?;
        }
        info!(data_path, "service.clear_ingest");
        Ok(true)
    }

    /// `CompactDB`: collects every partition up to its watermark and trims
    /// old backups to the configured retention.
    pub fn compact_db(&self) -> Result<Vec<GcReport>> {
        let mut reports = Vec::with_capacity(self.partitions.len());
        for partition in &self.partitions {
            let engine = partition.open_backup_engine();
            engine.retain_latest(self.backup_retention)?;
            reports.push(partition.garbage_collect(partition.watermark())?);
        }
        Ok(reports)
    }

    /// `ReopenSecondary`.
    pub fn reopen_secondary(&self) -> Result<Vec<CatchUpReport>> {
        self.partitions
            .iter()
            .map(|p| p.reopen_secondary())
            .collect()
    }

    /// Runs incremental catch-up on every partition.
    pub fn catch_up(&self) -> Result<Vec<CatchUpReport>> {
        self.partitions
            .iter()
            .map(|p| p.try_catch_up_with_primary())
            .collect()
    }

    /// `ReplayRecords`: snapshots logged at or after `offset` and
    /// `timestamp_ms` on any partition, ascending and deduplicated.
    pub fn replay_records(&self, offset: LogOffset, timestamp_ms: u64) -> Result<Vec<SnapshotId>> {
        let mut snapshots = Vec::new();
        for partition in &self.partitions {
            snapshots.extend(partition.replay_records(offset, timestamp_ms)?);
        }
        snapshots.sort();
        snapshots.dedup();
        Ok(snapshots)
    }

    pub fn statuses(&self) -> Result<Vec<PartitionStatus>> {
        self.partitions.iter().map(|p| p.status()).collect()
    }

    pub fn close(&self) -> Result<()> {
        for partition in &self.partitions {
            partition.close()?;
        }
        Ok(())
    }
}
