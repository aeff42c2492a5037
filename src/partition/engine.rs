#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard, RwLock};
use tracing::{debug, info, warn};

use super::apply::{load_blob_name, BatchApplier, StagedBatch};
use super::options::{EngineKind, PartitionOptions, Role};
use super::reader::PartitionReader;
use super::{
    CatchUpReport, GcReport, GraphPartition, IngestOutcome, PartitionState, PartitionStatus,
    StoreState,
};
use crate::backup::BackupEngine;
use crate::oplog::OperationLog;
use crate::operation::OperationBatch;
use crate::primitives::io::{BlobStore, DirBlobStore, FileIo, MemBlobStore, MemFileIo, StdFileIo};
use crate::primitives::wal::WalOptions;
use crate::replication::{self, PrimaryLink, ReplicaTracker};
use crate::schema::GraphDef;
use crate::storage::bulk::BulkFile;
use crate::storage::keys::{key_owner, KeyOwner};
use crate::storage::{CheckpointImage, CheckpointWriter, ExternalStorage, VersionedStore};
use crate::types::{LogOffset, PartitionId, Result, SnapshotId, TableId, TesseraError};

/// Blob holding the latest local checkpoint.
pub const CHECKPOINT_BLOB: &str = "checkpoint";

/// Blob holding the last snapshot recovery may replay to, written by a
/// restore that left later batches in the log.
const REPLAY_LIMIT_BLOB: &str = "replay-limit";

const LOG_FILE: &str = "oplog.wal";
const BLOB_DIR: &str = "blobs";

/// How a batch reached the apply path.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum ApplyMode {
    /// From the coordinator; logged before it becomes visible.
    Live,
    /// Re-applied from the local log during recovery; not logged again.
    Replay,
    /// Pulled from the primary; logged locally like a live batch.
    Replicated,
}

struct Published {
    watermark: SnapshotId,
    def: Arc<GraphDef>,
}

#[derive(Default)]
struct PinState {
    next: u64,
    pins: BTreeMap<u64, SnapshotId>,
}

/// Snapshots held by readers and in-flight backups; garbage collection
/// stays at or below them.
#[derive(Default)]
pub(crate) struct PinRegistry {
    inner: Mutex<PinState>,
}

impl PinRegistry {
    fn pin(&self, snapshot: SnapshotId) -> PinGuard<'_> {
        let mut state = self.inner.lock();
        state.next += 1;
        let id = state.next;
        state.pins.insert(id, snapshot);
        PinGuard {
            registry: self,
            id,
            snapshot,
        }
    }

    fn min(&self) -> Option<SnapshotId> {
        self.inner.lock().pins.values().min().copied()
    }

    fn len(&self) -> usize {
        self.inner.lock().pins.len()
    }
}

/// Keeps a snapshot readable until dropped.
pub struct PinGuard<'a> {
    registry: &'a PinRegistry,
    id: u64,
    snapshot: SnapshotId,
}

impl PinGuard<'_> {
    /// The pinned snapshot.
    pub fn snapshot(&self) -> SnapshotId {
        self.snapshot
    }
}

impl Drop for PinGuard<'_> {
    fn drop(&mut self) {
        self.registry.inner.lock().pins.remove(&self.id);
    }
}

/// A graph partition over a versioned store, an operation log and a blob
/// store.
///
/// `write_batch`, catch-up, restore and garbage collection serialize on a
/// single writer lock. Readers take the published `(watermark, schema)`
/// pair and read the store at that watermark, so they never see a partly
/// applied batch.
pub struct Partition {
    options: PartitionOptions,
    writer: Mutex<()>,
    state: RwLock<PartitionState>,
    published: RwLock<Published>,
    store: VersionedStore,
    log: OperationLog,
    blobs: Arc<dyn BlobStore>,
    pins: PinRegistry,
    replicas: ReplicaTracker,
    primary: RwLock<Option<Arc<dyn PrimaryLink>>>,
    backup_seq: Mutex<()>,
}

impl Partition {
    /// Opens the partition and recovers it from checkpoint and log.
    pub fn open(options: PartitionOptions) -> Result<Self> {
        let (log_io, blobs): (Arc<dyn FileIo>, Arc<dyn BlobStore>) = match &options.engine {
            EngineKind::Memory => (Arc::new(MemFileIo::new()), Arc::new(MemBlobStore::new())),
            EngineKind::Disk { dir } => {
                fs::create_dir_all(dir)?;
                (
                    Arc::new(StdFileIo::open(dir.join(LOG_FILE))?),
                    Arc::new(DirBlobStore::open(dir.join(BLOB_DIR))?),
                )
            }
            EngineKind::Custom { log, blobs } => (Arc::clone(log), Arc::clone(blobs)),
        };
        let log = OperationLog::open(log_io, WalOptions::new(options.id, options.sync_mode))?;
        let partition = Self {
            options,
            writer: Mutex::new(()),
            state: RwLock::new(PartitionState::Opening),
            published: RwLock::new(Published {
                watermark: SnapshotId::ZERO,
                def: Arc::new(GraphDef::new()),
            }),
            store: VersionedStore::new(),
            log,
            blobs,
            pins: PinRegistry::default(),
            replicas: ReplicaTracker::default(),
            primary: RwLock::new(None),
            backup_seq: Mutex::new(()),
        };
        {
            let _writer = partition.writer.lock();
            partition.recover()?;
        }
        partition.set_state(PartitionState::Serving);
        info!(
            partition = partition.id().0,
            role = ?partition.options.role,
            engine = ?partition.options.engine,
            watermark = partition.watermark().0,
            "partition.open"
        );
        Ok(partition)
    }

    fn recover(&self) -> Result<()> {
        let limit = self.replay_limit()?;
        let mut start = SnapshotId::ZERO;
        if let Some(blob) = self.blobs.get(CHECKPOINT_BLOB)? {
            let image = CheckpointImage::decode(&blob)?;
            if image.partition != self.id() {
                return Err(TesseraError::Corruption("checkpoint belongs to another partition"));
            }
            start = image.snapshot;
            let rows = image.rows.len();
            self.store.replace_all(image.rows, image.snapshot);
            self.publish(image.snapshot, Arc::new(image.graph_def));
            debug!(
                partition = self.id().0,
                snapshot = start.0,
                rows,
                "partition.recovery.checkpoint"
            );
        }
        if self.log.tail() < start {
            warn!(
                partition = self.id().0,
                log_tail = self.log.tail().0,
                checkpoint = start.0,
                "partition.recovery.log_behind_checkpoint"
            );
            self.log.reset(start)?;
        } else if self.log.base() > start {
            if limit != Some(start) {
                return Err(TesseraError::Corruption(
                    "operation log starts after the checkpoint",
                ));
            }
            // A restore installed its image but did not get to reset the log.
            warn!(
                partition = self.id().0,
                log_base = self.log.base().0,
                checkpoint = start.0,
                "partition.recovery.finish_restore"
            );
            self.log.reset(start)?;
            self.set_replay_limit(None)?;
        }
        let mut replayed = 0u64;
        for batch in self.log.replay_from(start)? {
            let batch = batch?;
            if limit.is_some_and(|limit| batch.latest_snapshot_id() > limit) {
                break;
            }
            self.apply_locked(&batch, ApplyMode::Replay, None)?;
            replayed += 1;
        }
        info!(
            partition = self.id().0,
            checkpoint = start.0,
            replayed,
            watermark = self.watermark().0,
            log_tail = self.log.tail().0,
            "partition.recovery.replayed"
        );
        Ok(())
    }

    fn replay_limit(&self) -> Result<Option<SnapshotId>> {
        let Some(raw) = self.blobs.get(REPLAY_LIMIT_BLOB)? else {
            return Ok(None);
        };
        let bytes: [u8; 8] = raw
            .as_ref()
            .try_into()
            .map_err(|_| TesseraError::Corruption("replay limit blob is not 8 bytes"))?;
        Ok(Some(SnapshotId(u64::from_be_bytes(bytes))))
    }

    fn set_replay_limit(&self, limit: Option<SnapshotId>) -> Result<()> {
        match limit {
            Some(limit) => self.blobs.put(REPLAY_LIMIT_BLOB, &limit.0.to_be_bytes()),
            None => self.blobs.remove(REPLAY_LIMIT_BLOB).map(|_| ()),
        }
    }

    /// Drops logged batches above `watermark` that a restore left behind;
    /// a new batch at `watermark + 1` supersedes them.
    fn drop_unapplied_suffix(&self, watermark: SnapshotId) -> Result<()> {
        if self.log.tail() <= watermark {
            return Ok(());
        }
        let dropped = self.log.truncate_after(watermark)?;
        self.set_replay_limit(None)?;
        info!(
            partition = self.id().0,
            watermark = watermark.0,
            dropped,
            "partition.log.superseded"
        );
        Ok(())
    }

    /// Re-applies the batches the log holds above the watermark, starting
    /// with the one at offset `from`, up to the log tail.
    ///
    /// After a restore this brings the partition back to currency from its
    /// own log. Fails without applying anything when the first batch to
    /// replay sits before `from`. Returns the number of batches applied.
    pub fn replay_log(&self, from: LogOffset) -> Result<u64> {
        self.ensure_open()?;
        let _writer = self.writer.lock();
        let before = self.watermark();
        let mut replayed = 0u64;
        let outcome = self.replay_retained(before, from, &mut replayed);
        let watermark = self.watermark();
        self.set_replay_limit((self.log.tail() > watermark).then_some(watermark))?;
        outcome?;
        info!(
            partition = self.id().0,
            from = before.0,
            to = watermark.0,
            offset = from.0,
            replayed,
            "partition.log.replayed"
        );
        Ok(replayed)
    }

    fn replay_retained(&self, after: SnapshotId, from: LogOffset, replayed: &mut u64) -> Result<()> {
        for entry in self.log.replay_entries(after)? {
            let (offset, batch) = entry?;
            if offset < from {
                return Err(TesseraError::InvalidOwned(format!(
                    "batch {} at log offset {} precedes replay offset {}",
                    batch.latest_snapshot_id(),
                    offset.0,
                    from.0
                )));
            }
            self.apply_locked(&batch, ApplyMode::Replay, None)?;
            *replayed += 1;
        }
        Ok(())
    }

    pub fn options(&self) -> &PartitionOptions {
        &self.options
    }

    pub fn role(&self) -> Role {
        self.options.role
    }

    /// Connects this replica to its primary.
    pub fn set_primary(&self, link: Arc<dyn PrimaryLink>) {
        *self.primary.write() = Some(link);
    }

    pub(crate) fn primary(&self) -> Option<Arc<dyn PrimaryLink>> {
        self.primary.read().clone()
    }

    /// Current schema.
    pub fn graph_def(&self) -> Arc<GraphDef> {
        Arc::clone(&self.published.read().def)
    }

    /// Consistent `(watermark, schema)` pair.
    pub fn view(&self) -> (SnapshotId, Arc<GraphDef>) {
        let published = self.published.read();
        (published.watermark, Arc::clone(&published.def))
    }

    /// Pins the published snapshot and returns it with its schema.
    ///
    /// The pin is taken under the same lock that publishes new watermarks,
    /// so a concurrent garbage collection either sees it or runs with a
    /// horizon at or below the pinned snapshot.
    pub fn pin_view(&self) -> (PinGuard<'_>, Arc<GraphDef>) {
        let published = self.published.read();
        let guard = self.pins.pin(published.watermark);
        (guard, Arc::clone(&published.def))
    }

    /// Snapshot reader over the published state; holds a pin until dropped.
    pub fn reader(&self) -> PartitionReader<'_> {
        let (pin, def) = self.pin_view();
        PartitionReader::new(&self.store, def, pin)
    }

    pub(crate) fn log(&self) -> &OperationLog {
        &self.log
    }

    pub(crate) fn blobs(&self) -> &dyn BlobStore {
        self.blobs.as_ref()
    }

    pub(crate) fn replicas(&self) -> &ReplicaTracker {
        &self.replicas
    }

    pub(crate) fn lock_writer(&self) -> MutexGuard<'_, ()> {
        self.writer.lock()
    }

    pub(crate) fn backup_sequence(&self) -> MutexGuard<'_, ()> {
        self.backup_seq.lock()
    }

    pub(crate) fn set_state(&self, next: PartitionState) {
        let mut state = self.state.write();
        if *state == next || *state == PartitionState::Closed {
            return;
        }
        info!(
            partition = self.id().0,
            from = %*state,
            to = %next,
            "partition.state"
        );
        *state = next;
    }

    fn publish(&self, watermark: SnapshotId, def: Arc<GraphDef>) {
        let mut published = self.published.write();
        published.watermark = watermark;
        published.def = def;
    }

    fn stage(
        &self,
        batch: &OperationBatch,
        read_at: SnapshotId,
        def: Arc<GraphDef>,
        snapshot: SnapshotId,
        source: Option<&dyn PrimaryLink>,
    ) -> Result<StagedBatch> {
        BatchApplier::new(&self.store, self.blobs.as_ref(), def, read_at, snapshot)
            .with_load_source(source)
            .stage(batch.operations())
    }

    /// Applies one batch. The caller holds the writer lock.
    ///
    /// Order: idempotence and ordering checks, staging (all validation),
    /// durable log append, store commit, publish.
    pub(crate) fn apply_locked(
        &self,
        batch: &OperationBatch,
        mode: ApplyMode,
        source: Option<&dyn PrimaryLink>,
    ) -> Result<bool> {
        let (watermark, def) = self.view();
        let snapshot = batch.latest_snapshot_id();
        if snapshot <= watermark {
            debug!(
                partition = self.id().0,
                snapshot = snapshot.0,
                watermark = watermark.0,
                "partition.write_batch.duplicate"
            );
            return Ok(batch.has_ddl());
        }
        let expected = watermark.next();
        if snapshot != expected {
            return Err(TesseraError::OutOfOrderSnapshot {
                expected,
                got: snapshot,
            });
        }
        let staged = self.stage(batch, watermark, def, snapshot, source)?;
        if mode != ApplyMode::Replay {
            self.drop_unapplied_suffix(watermark)?;
            self.log.append(batch)?;
        }
        let keys = staged.writes.len();
        self.store.commit(staged.writes, snapshot);
        let schema_version = staged.def.version();
        self.publish(snapshot, staged.def);
        debug!(
            partition = self.id().0,
            snapshot = snapshot.0,
            ops = batch.len(),
            keys,
            ddl = staged.has_ddl,
            schema_version,
            mode = ?mode,
            trace_id = batch.trace_id(),
            "partition.write_batch.applied"
        );
        Ok(staged.has_ddl)
    }

    /// Encodes the store at `snapshot` with `def` into an image, scanning
    /// in chunks and leaving out rows of dropped types. `snapshot` must be
    /// pinned or the writer lock held.
    pub(crate) fn encode_image(
        &self,
        snapshot: SnapshotId,
        def: &GraphDef,
    ) -> Result<(Bytes, u64)> {
        let mut writer =
            CheckpointWriter::new(self.id(), snapshot, self.log.offset_after(snapshot), def)?;
        let chunk = self.options.scan_chunk_rows;
        let mut after: Option<Bytes> = None;
        loop {
            let rows = self.store.scan_chunk(after.as_deref(), snapshot, chunk);
            let Some((last, _)) = rows.last() else {
                break;
            };
            let last = last.clone();
            for (key, value) in &rows {
                if retired_at(def, key).is_none() {
                    writer.push(key, value)?;
                }
            }
            after = Some(last);
        }
        let rows = writer.rows();
        Ok((writer.finish()?, rows))
    }

    /// Replaces the partition state with `image`. The caller holds the
    /// writer lock.
    ///
    /// The image becomes the local checkpoint. Logged batches that directly
    /// follow its snapshot stay in the log for [`Partition::replay_log`],
    /// and recovery stops at the image until they are replayed or
    /// superseded. Otherwise the log restarts after the image's snapshot.
    pub(crate) fn install_image(&self, encoded: &[u8], image: CheckpointImage) -> Result<()> {
        if image.partition != self.id() {
            return Err(TesseraError::InvalidOwned(format!(
                "image of partition {} cannot be installed on partition {}",
                image.partition,
                self.id()
            )));
        }
        let snapshot = image.snapshot;
        let keeps_suffix = self.log.base() <= snapshot && snapshot < self.log.tail();
        self.set_replay_limit(Some(snapshot))?;
        self.blobs.put(CHECKPOINT_BLOB, encoded)?;
        if !keeps_suffix {
            self.log.reset(snapshot)?;
            self.set_replay_limit(None)?;
        }
        let rows = image.rows.len();
        self.store.replace_all(image.rows, snapshot);
        self.publish(snapshot, Arc::new(image.graph_def));
        info!(
            partition = self.id().0,
            snapshot = snapshot.0,
            rows,
            retained = self.log.tail().0.saturating_sub(snapshot.0),
            "partition.image.installed"
        );
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if *self.state.read() == PartitionState::Closed {
            return Err(TesseraError::Closed);
        }
        Ok(())
    }

    fn gc_horizon(&self, requested: SnapshotId) -> SnapshotId {
        let mut horizon = requested.min(self.watermark());
        if let Some(pinned) = self.pins.min() {
            horizon = horizon.min(pinned);
        }
        if let Some(acked) = self.replicas.min_acknowledged() {
            horizon = horizon.min(acked);
        }
        horizon
    }

    /// Point-in-time status for admin reports.
    pub fn status(&self) -> Result<PartitionStatus> {
        let (watermark, def) = self.view();
        Ok(PartitionStatus {
            id: self.id(),
            role: self.role(),
            state: self.state(),
            watermark,
            schema_version: def.version(),
            log_base: self.log.base(),
            log_tail: self.log.tail(),
            log_bytes: self.log.len_bytes()?,
            store_bytes: self.store.size_bytes(),
            store_keys: self.store.key_count(),
            snapshot_pins: self.pins.len(),
            store_state: self.store_state()?,
        })
    }
}

/// Snapshot at which the owner of a row key was dropped, if it was.
fn retired_at(def: &GraphDef, key: &[u8]) -> Option<SnapshotId> {
    match key_owner(key).ok()? {
        KeyOwner::Vertex(label) => def.retired_labels().get(&label).copied(),
        KeyOwner::Edge(table) => def.retired_tables().get(&table).copied(),
    }
}

impl GraphPartition for Partition {
    fn id(&self) -> PartitionId {
        self.options.id
    }

    fn write_batch(&self, snapshot_id: SnapshotId, batch: &OperationBatch) -> Result<bool> {
        if snapshot_id != batch.latest_snapshot_id() {
            return Err(TesseraError::InvalidOwned(format!(
                "snapshot {snapshot_id} does not match batch snapshot {}",
                batch.latest_snapshot_id()
            )));
        }
        let _writer = self.writer.lock();
        match self.state() {
            PartitionState::Serving => {}
            PartitionState::Closed => return Err(TesseraError::Closed),
            other => return Err(TesseraError::NotServing(other)),
        }
        self.apply_locked(batch, ApplyMode::Live, None)
    }

    fn check_batch(&self, batch: &OperationBatch) -> Result<()> {
        let (watermark, def) = self.view();
        self.stage(batch, watermark, def, watermark.next(), None)
            .map(|_| ())
    }

    fn graph_def_blob(&self) -> Result<Vec<u8>> {
        self.graph_def().to_blob()
    }

    fn ingest_external_file(
        &self,
        storage: &dyn ExternalStorage,
        path: &str,
    ) -> Result<IngestOutcome> {
        self.ensure_open()?;
        let data = storage.fetch(path)?;
        let file = BulkFile::parse(&data)?;
        let table = file.table;
        let _writer = self.writer.lock();
        let def = self.graph_def();
        if def.committed_load(table).is_some() {
            debug!(partition = self.id().0, table = table.0, path, "partition.ingest.already_committed");
            return Ok(IngestOutcome::AlreadyCommitted { table });
        }
        match def.pending_target(table) {
            Some(target) if *target == file.target => {}
            Some(target) => {
                return Err(TesseraError::malformed(format!(
                    "bulk file for {} does not match pending load of {target}",
                    file.target
                )))
            }
            None => {
                return Err(TesseraError::malformed(format!(
                    "table {table} has no pending data load"
                )))
            }
        }
        let name = load_blob_name(table);
        if let Some(existing) = self.blobs.get(&name)? {
            if BulkFile::checksum_of(&existing) == Some(file.checksum) {
                debug!(partition = self.id().0, table = table.0, path, "partition.ingest.already_staged");
                return Ok(IngestOutcome::AlreadyStaged { table });
            }
        }
        self.blobs.put(&name, &data)?;
        let rows = file.rows.len() as u64;
        info!(
            partition = self.id().0,
            table = table.0,
            target = %file.target,
            rows,
            path,
            "partition.ingest.staged"
        );
        Ok(IngestOutcome::Staged { table, rows })
    }

    fn clear_ingest(&self, table: TableId) -> Result<bool> {
        self.ensure_open()?;
        let _writer = self.writer.lock();
        if self.graph_def().pending_target(table).is_none() {
            debug!(partition = self.id().0, table = table.0, "partition.ingest.clear_skipped");
            return Ok(false);
        }
        let removed = self.blobs.remove(&load_blob_name(table))?;
        info!(partition = self.id().0, table = table.0, removed, "partition.ingest.cleared");
        Ok(removed)
    }

    fn open_backup_engine(&self) -> BackupEngine<'_> {
        BackupEngine::new(self)
    }

    fn garbage_collect(&self, snapshot_id: SnapshotId) -> Result<GcReport> {
        self.ensure_open()?;
        let _writer = self.writer.lock();
        let (watermark, def) = self.view();
        let horizon = self.gc_horizon(snapshot_id);
        info!(
            partition = self.id().0,
            requested = snapshot_id.0,
            horizon = horizon.0,
            watermark = watermark.0,
            "gc.horizon"
        );
        let compacted = self
            .store
            .compact(horizon, |key| retired_at(&def, key).is_some_and(|at| at <= horizon));

        let (image, _) = self.encode_image(watermark, &def)?;
        self.blobs.put(CHECKPOINT_BLOB, &image)?;
        let log_records_dropped = self.log.truncate_before(horizon.next())?;

        let mut load_files_dropped = 0;
        for (table, load) in def.committed_loads() {
            if load.snapshot <= horizon && self.blobs.remove(&load_blob_name(*table))? {
                load_files_dropped += 1;
            }
        }
        let report = GcReport {
            requested: snapshot_id,
            horizon,
            checkpoint: watermark,
            versions_dropped: compacted.versions_dropped,
            keys_dropped: compacted.keys_dropped,
            keys_purged: compacted.keys_purged,
            log_records_dropped,
            load_files_dropped,
        };
        info!(
            partition = self.id().0,
            horizon = horizon.0,
            versions_dropped = report.versions_dropped,
            log_records_dropped,
            load_files_dropped,
            "gc.done"
        );
        Ok(report)
    }

    fn try_catch_up_with_primary(&self) -> Result<CatchUpReport> {
        self.ensure_open()?;
        let link = self
            .primary()
            .ok_or(TesseraError::Invalid("partition has no primary to catch up with"))?;
        let _writer = self.writer.lock();
        replication::catch_up(self, link.as_ref(), None)
    }

    fn reopen_secondary(&self) -> Result<CatchUpReport> {
        self.ensure_open()?;
        let link = self
            .primary()
            .ok_or(TesseraError::Invalid("partition has no primary to reopen from"))?;
        let _writer = self.writer.lock();
        let installed = replication::install_newer_checkpoint(self, link.as_ref())?;
        replication::catch_up(self, link.as_ref(), installed)
    }

    fn watermark(&self) -> SnapshotId {
        self.published.read().watermark
    }

    fn state(&self) -> PartitionState {
        *self.state.read()
    }

    fn store_state(&self) -> Result<StoreState> {
        let used = self.store.size_bytes() + self.log.len_bytes()? + self.blobs.size_bytes()?;
        Ok(StoreState {
            total_space: self.options.capacity_bytes,
            usable_space: self.options.capacity_bytes.saturating_sub(used),
        })
    }

    fn replay_records(&self, offset: LogOffset, timestamp_ms: u64) -> Result<Vec<SnapshotId>> {
        self.ensure_open()?;
        self.log.snapshots_since(offset, timestamp_ms)
    }

    fn close(&self) -> Result<()> {
        let _writer = self.writer.lock();
        if self.state() == PartitionState::Closed {
            return Ok(());
        }
        self.log.close()?;
        self.set_state(PartitionState::Closed);
        info!(partition = self.id().0, watermark = self.watermark().0, "partition.close");
        Ok(())
    }
}
