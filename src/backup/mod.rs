#![forbid(unsafe_code)]

//! Point-in-time backups of a partition.
//!
//! A backup pins the published snapshot, streams the store at that snapshot
//! into a checkpoint image in chunks and stores the image next to a JSON
//! [`BackupInfo`]. Writers keep committing newer versions while the scan
//! runs; garbage collection keeps every version the pinned snapshot needs.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::partition::{GraphPartition, Partition};
use crate::schema::GraphDef;
use crate::storage::CheckpointImage;
use crate::types::{BackupId, LogOffset, Result, SnapshotId, TesseraError};

const IMAGE_PREFIX: &str = "backup-";
const IMAGE_SUFFIX: &str = ".img";
const INFO_SUFFIX: &str = ".json";

fn image_name(id: BackupId) -> String {
    format!("{IMAGE_PREFIX}{:08}{IMAGE_SUFFIX}", id.0)
}

fn info_name(id: BackupId) -> String {
    format!("{IMAGE_PREFIX}{:08}{INFO_SUFFIX}", id.0)
}

/// Description of a backup.
///
/// A partition's backup engine produces one with a single entry in each
/// map; [`BackupInfo::merge`] combines them into the global backup of a
/// store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BackupInfo {
    pub global_backup_id: BackupId,
    pub snapshot_id: SnapshotId,
    pub graph_def: GraphDef,
    /// Partition id to the log offset of the first batch after the snapshot.
    pub partition_offsets: BTreeMap<u32, u64>,
    /// Partition id to the partition-local backup id.
    pub partition_backups: BTreeMap<u32, u64>,
}

impl BackupInfo {
    /// Combines per-partition backups taken at the same snapshot.
    pub fn merge(global_backup_id: BackupId, infos: Vec<BackupInfo>) -> Result<BackupInfo> {
        let mut infos = infos.into_iter();
        let mut merged = infos
            .next()
            .ok_or(TesseraError::Invalid("no partition backups to merge"))?;
        merged.global_backup_id = global_backup_id;
        for info in infos {
            if info.snapshot_id != merged.snapshot_id {
                return Err(TesseraError::InvalidOwned(format!(
                    "partition backups disagree on snapshot: {} vs {}",
                    merged.snapshot_id, info.snapshot_id
                )));
            }
            merged.partition_offsets.extend(info.partition_offsets);
            merged.partition_backups.extend(info.partition_backups);
        }
        Ok(merged)
    }

    /// Local backup id recorded for `partition`.
    pub fn local_id(&self, partition: u32) -> Result<BackupId> {
        self.partition_backups
            .get(&partition)
            .map(|id| BackupId(*id))
            .ok_or(TesseraError::NotFound)
    }
}

/// Backup handle of one partition.
pub struct BackupEngine<'a> {
    partition: &'a Partition,
}

impl<'a> BackupEngine<'a> {
    pub(crate) fn new(partition: &'a Partition) -> Self {
        Self { partition }
    }

    /// Captures the published snapshot without blocking writers.
    pub fn create_backup(&self) -> Result<BackupInfo> {
        let partition = self.partition;
        let (pin, def) = partition.pin_view();
        let snapshot = pin.snapshot();
        let (image, rows) = partition.encode_image(snapshot, &def)?;

        let _sequence = partition.backup_sequence();
        let id = BackupId(self.ids()?.last().map_or(1, |last| last.0 + 1));
        let pid = partition.id().0;
        let info = BackupInfo {
            global_backup_id: id,
            snapshot_id: snapshot,
            graph_def: def.as_ref().clone(),
            partition_offsets: BTreeMap::from([(pid, partition.log().offset_after(snapshot).0)]),
            partition_backups: BTreeMap::from([(pid, id.0)]),
        };
        let blobs = partition.blobs();
        blobs.put(&image_name(id), &image)?;
        blobs.put(
            &info_name(id),
            &serde_json::to_vec(&info)
                .map_err(|err| TesseraError::InvalidOwned(format!("backup info: {err}")))?,
        )?;
        drop(pin);
        info!(
            partition = pid,
            backup = id.0,
            snapshot = snapshot.0,
            rows,
            bytes = image.len(),
            "backup.create"
        );
        Ok(info)
    }

    /// Replaces this partition's state with the backup.
    ///
    /// The watermark becomes the backup's snapshot, even when that moves it
    /// backwards. Batches the log still holds after that snapshot are kept:
    /// [`BackupEngine::replay_after`] re-applies them, while a new batch
    /// for the next snapshot replaces them.
    pub fn restore(&self, info: &BackupInfo) -> Result<()> {
        let image = self.export(info)?;
        self.restore_image(info, &image)
    }

    /// Re-applies the logged batches that followed `info`'s snapshot,
    /// starting at the offset the backup recorded for this partition.
    /// Returns the number of batches applied.
    pub fn replay_after(&self, info: &BackupInfo) -> Result<u64> {
        let offset = info
            .partition_offsets
            .get(&self.partition.id().0)
            .copied()
            .ok_or(TesseraError::NotFound)?;
        self.partition.replay_log(LogOffset(offset))
    }

    /// Restores from an image exported elsewhere, such as another replica
    /// of the same partition.
    pub fn restore_image(&self, info: &BackupInfo, encoded: &[u8]) -> Result<()> {
        let image = CheckpointImage::decode(encoded)?;
        check_image(info, &image)?;
        let partition = self.partition;
        let _writer = partition.lock_writer();
        let from = partition.watermark();
        partition.install_image(encoded, image)?;
        info!(
            partition = partition.id().0,
            backup = info.global_backup_id.0,
            from = from.0,
            to = info.snapshot_id.0,
            "backup.restore"
        );
        Ok(())
    }

    /// Raw image bytes of this partition's part of `info`.
    pub fn export(&self, info: &BackupInfo) -> Result<Bytes> {
        let id = info.local_id(self.partition.id().0)?;
        self.partition
            .blobs()
            .get(&image_name(id))?
            .ok_or(TesseraError::NotFound)
    }

    /// Checks the stored image against `info`: checksum, partition,
    /// snapshot and schema.
    pub fn verify(&self, info: &BackupInfo) -> Result<()> {
        let encoded = self.export(info)?;
        let image = CheckpointImage::decode(&encoded)?;
        check_image(info, &image)?;
        if image.partition != self.partition.id() {
            return Err(TesseraError::Corruption("backup image belongs to another partition"));
        }
        debug!(
            partition = self.partition.id().0,
            backup = info.global_backup_id.0,
            rows = image.rows.len(),
            "backup.verify"
        );
        Ok(())
    }

    /// Backups stored for this partition, oldest first.
    pub fn list(&self) -> Result<Vec<BackupInfo>> {
        let blobs = self.partition.blobs();
        let mut infos = Vec::new();
        for id in self.ids()? {
            let Some(raw) = blobs.get(&info_name(id))? else {
                continue;
            };
            let info: BackupInfo = serde_json::from_slice(&raw)
                .map_err(|_| TesseraError::Corruption("backup info is not valid JSON"))?;
            infos.push(info);
        }
        Ok(infos)
    }

    /// Deletes a backup; returns whether it existed.
    pub fn purge(&self, id: BackupId) -> Result<bool> {
        let blobs = self.partition.blobs();
        let image = blobs.remove(&image_name(id))?;
        let info = blobs.remove(&info_name(id))?;
        if image || info {
            info!(partition = self.partition.id().0, backup = id.0, "backup.purge");
        }
        Ok(image || info)
    }

    /// Keeps the newest `keep` backups and purges the rest.
    pub fn retain_latest(&self, keep: usize) -> Result<Vec<BackupId>> {
        let ids = self.ids()?;
        let excess = ids.len().saturating_sub(keep);
        let mut purged = Vec::with_capacity(excess);
        for id in ids.into_iter().take(excess) {
            self.purge(id)?;
            purged.push(id);
        }
        Ok(purged)
    }

    fn ids(&self) -> Result<Vec<BackupId>> {
        let mut ids: Vec<BackupId> = self
            .partition
            .blobs()
            .list(IMAGE_PREFIX)?
            .iter()
            .filter_map(|name| {
                name.strip_prefix(IMAGE_PREFIX)?
                    .strip_suffix(INFO_SUFFIX)?
                    .parse()
                    .ok()
                    .map(BackupId)
            })
            .collect();
        ids.sort();
        Ok(ids)
    }
}

fn check_image(info: &BackupInfo, image: &CheckpointImage) -> Result<()> {
    if image.snapshot != info.snapshot_id {
        return Err(TesseraError::Corruption("backup image snapshot does not match its info"));
    }
    if image.graph_def != info.graph_def {
        return Err(TesseraError::Corruption("backup image schema does not match its info"));
    }
    Ok(())
}
