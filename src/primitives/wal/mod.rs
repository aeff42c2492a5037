#![forbid(unsafe_code)]

//! Append-only record log keyed by snapshot id.
//!
//! The file starts with a fixed header (magic, format version, owning
//! partition, base snapshot and base offset) followed by records. Every
//! record carries its snapshot id, its log offset, the wall-clock append
//! time and a CRC32 over header fields and payload. Records must arrive in
//! dense snapshot order: the record after snapshot `n` is snapshot `n + 1`.
//! A torn or corrupt tail ends the log and is cut off on the next open.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::primitives::io::FileIo;
use crate::types::{crc32, LogOffset, PartitionId, Result, SnapshotId, TesseraError};

const WAL_MAGIC: [u8; 4] = *b"TSOL";
const WAL_FORMAT_VERSION: u16 = 1;
/// Size of the file header in bytes.
pub const FILE_HEADER_LEN: usize = 32;
const RECORD_HEADER_LEN: usize = 32;
const MAX_RECORD_LEN: u32 = 256 * 1024 * 1024;
const COPY_CHUNK: usize = 1 << 20;

/// Durability applied to each append.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WalSyncMode {
    /// fsync before acknowledging the append.
    #[default]
    Immediate,
    /// Never fsync (tests and throwaway stores only).
    Off,
}

/// Options for opening a [`Wal`].
#[derive(Clone, Debug, Default)]
pub struct WalOptions {
    /// Partition the log belongs to; `None` accepts whatever the header says.
    pub partition: Option<PartitionId>,
    /// Sync behaviour for appends.
    pub sync_mode: WalSyncMode,
    /// Inspect only: never create, repair or append.
    pub read_only: bool,
}

impl WalOptions {
    /// Options for the log of `partition`.
    pub fn new(partition: PartitionId, sync_mode: WalSyncMode) -> Self {
        Self {
            partition: Some(partition),
            sync_mode,
            read_only: false,
        }
    }

    /// Options for inspecting an existing log without modifying it.
    pub fn read_only() -> Self {
        Self {
            read_only: true,
            ..Self::default()
        }
    }
}

/// Counters describing log activity since open.
#[derive(Clone, Debug, Default, Serialize)]
pub struct WalStats {
    /// Records appended.
    pub records_appended: u64,
    /// Payload and header bytes appended.
    pub bytes_appended: u64,
    /// fsync calls issued.
    pub syncs: u64,
    /// Truncations (prefix drops or resets).
    pub truncations: u64,
    /// Bytes cut off the tail during open.
    pub torn_tail_bytes: u64,
}

#[derive(Clone, Debug)]
struct FileHeader {
    partition: PartitionId,
    base_snapshot: SnapshotId,
    base_offset: LogOffset,
}

impl FileHeader {
    fn encode(&self) -> [u8; FILE_HEADER_LEN] {
        let mut buf = [0u8; FILE_HEADER_LEN];
        buf[0..4].copy_from_slice(&WAL_MAGIC);
        buf[4..6].copy_from_slice(&WAL_FORMAT_VERSION.to_be_bytes());
        buf[8..12].copy_from_slice(&self.partition.0.to_be_bytes());
        buf[12..20].copy_from_slice(&self.base_snapshot.0.to_be_bytes());
        buf[20..28].copy_from_slice(&self.base_offset.0.to_be_bytes());
        let crc = crc32(&[&buf[..28]]);
        buf[28..32].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    fn decode(src: &[u8; FILE_HEADER_LEN]) -> Result<Self> {
        if src[0..4] != WAL_MAGIC {
            return Err(TesseraError::Corruption("wal magic mismatch"));
        }
        if be_u16(&src[4..6]) != WAL_FORMAT_VERSION {
            return Err(TesseraError::Corruption("wal format version mismatch"));
        }
        if src[6..8] != [0, 0] {
            return Err(TesseraError::Corruption("wal reserved header bytes non-zero"));
        }
        if crc32(&[&src[..28]]) != be_u32(&src[28..32]) {
            return Err(TesseraError::Corruption("wal header crc mismatch"));
        }
        Ok(Self {
            partition: PartitionId(be_u32(&src[8..12])),
            base_snapshot: SnapshotId(be_u64(&src[12..20])),
            base_offset: LogOffset(be_u64(&src[20..28])),
        })
    }
}

struct RecordHeader {
    len: u32,
    snapshot: SnapshotId,
    offset: LogOffset,
    appended_at_ms: u64,
}

impl RecordHeader {
    fn encode(&self, payload: &[u8]) -> [u8; RECORD_HEADER_LEN] {
        let mut buf = [0u8; RECORD_HEADER_LEN];
        buf[0..4].copy_from_slice(&self.len.to_be_bytes());
        buf[8..16].copy_from_slice(&self.snapshot.0.to_be_bytes());
        buf[16..24].copy_from_slice(&self.offset.0.to_be_bytes());
        buf[24..32].copy_from_slice(&self.appended_at_ms.to_be_bytes());
        let crc = crc32(&[&buf[0..4], &buf[8..32], payload]);
        buf[4..8].copy_from_slice(&crc.to_be_bytes());
        buf
    }
}

/// One record read back from the log.
#[derive(Clone, Debug)]
pub struct WalRecord {
    /// Snapshot the record advances the log to.
    pub snapshot: SnapshotId,
    /// Sequence number of the record.
    pub offset: LogOffset,
    /// Milliseconds since the Unix epoch at append time.
    pub appended_at_ms: u64,
    /// Opaque payload.
    pub payload: Bytes,
}

#[derive(Clone, Copy, Debug)]
struct IndexEntry {
    snapshot: SnapshotId,
    offset: LogOffset,
    pos: u64,
}

struct WalState {
    header: FileHeader,
    append_pos: u64,
    index: Vec<IndexEntry>,
    closed: bool,
    stats: WalStats,
}

impl WalState {
    fn tail(&self) -> SnapshotId {
        self.index
            .last()
            .map(|e| e.snapshot)
            .unwrap_or(self.header.base_snapshot)
    }

    fn next_offset(&self) -> LogOffset {
        self.index
            .last()
            .map(|e| LogOffset(e.offset.0 + 1))
            .unwrap_or(self.header.base_offset)
    }

    fn locate(&self, snapshot: SnapshotId) -> Option<IndexEntry> {
        self.index
            .binary_search_by_key(&snapshot, |e| e.snapshot)
            .ok()
            .map(|idx| self.index[idx])
    }
}

struct Shared {
    io: Arc<dyn FileIo>,
    state: Mutex<WalState>,
}

/// Durable, snapshot-ordered record log.
pub struct Wal {
    shared: Arc<Shared>,
    sync_mode: WalSyncMode,
    read_only: bool,
}

impl Wal {
    /// Opens or creates a log, validating every record and cutting a torn tail.
    pub fn open(io: Arc<dyn FileIo>, options: WalOptions) -> Result<Self> {
        let len = io.len()?;
        if options.read_only && len < FILE_HEADER_LEN as u64 {
            return Err(TesseraError::Corruption("wal file shorter than its header"));
        }
        let header = if len < FILE_HEADER_LEN as u64 {
            let header = FileHeader {
                partition: options.partition.unwrap_or_default(),
                base_snapshot: SnapshotId::ZERO,
                base_offset: LogOffset(0),
            };
            io.write_at(0, &header.encode())?;
            io.truncate(FILE_HEADER_LEN as u64)?;
            io.sync_all()?;
            header
        } else {
            let mut buf = [0u8; FILE_HEADER_LEN];
            io.read_at(0, &mut buf)?;
            let header = FileHeader::decode(&buf)?;
            if let Some(partition) = options.partition {
                if header.partition != partition {
                    return Err(TesseraError::Corruption("wal partition mismatch"));
                }
            }
            header
        };

        let file_len = io.len()?;
        let mut index = Vec::new();
        let mut pos = FILE_HEADER_LEN as u64;
        let mut expected = header.base_snapshot.next();
        let mut expected_offset = header.base_offset;
        while let Some((rec, _)) = read_record(io.as_ref(), pos, file_len)? {
            if rec.snapshot != expected || rec.offset != expected_offset {
                break;
            }
            index.push(IndexEntry {
                snapshot: rec.snapshot,
                offset: rec.offset,
                pos,
            });
            pos += RECORD_HEADER_LEN as u64 + u64::from(rec.len);
            expected = expected.next();
            expected_offset = LogOffset(expected_offset.0 + 1);
        }
        let mut stats = WalStats::default();
        if pos < file_len {
            warn!(
                partition = header.partition.0,
                valid_up_to = pos,
                file_len,
                "wal.open.torn_tail"
            );
            if !options.read_only {
                io.truncate(pos)?;
                io.sync_all()?;
            }
            stats.torn_tail_bytes = file_len - pos;
        }
        debug!(
            partition = header.partition.0,
            base = header.base_snapshot.0,
            records = index.len(),
            "wal.open"
        );
        Ok(Self {
            shared: Arc::new(Shared {
                io,
                state: Mutex::new(WalState {
                    header,
                    append_pos: pos,
                    index,
                    closed: false,
                    stats,
                }),
            }),
            sync_mode: options.sync_mode,
            read_only: options.read_only,
        })
    }

    /// Appends `payload` as the record for `snapshot`.
    ///
    /// `snapshot` must be exactly one past the current tail. With
    /// [`WalSyncMode::Immediate`] the record is on stable storage when this
    /// returns.
    pub fn append(&self, snapshot: SnapshotId, payload: &[u8]) -> Result<LogOffset> {
        if self.read_only {
            return Err(TesseraError::Invalid("wal opened read-only"));
        }
        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(TesseraError::Closed);
        }
        let expected = state.tail().next();
        if snapshot != expected {
            return Err(TesseraError::OutOfOrderSnapshot {
                expected,
                got: snapshot,
            });
        }
        let len = u32::try_from(payload.len())
            .ok()
            .filter(|len| *len <= MAX_RECORD_LEN)
            .ok_or(TesseraError::Invalid("wal record exceeds maximum length"))?;
        let offset = state.next_offset();
        let header = RecordHeader {
            len,
            snapshot,
            offset,
            appended_at_ms: now_ms(),
        };
        let mut frame = Vec::with_capacity(RECORD_HEADER_LEN + payload.len());
        frame.extend_from_slice(&header.encode(payload));
        frame.extend_from_slice(payload);
        let pos = state.append_pos;
        if let Err(err) = self.write_frame(pos, &frame) {
            // Leave nothing half-written behind the tail.
            let _ = self.shared.io.truncate(pos);
            return Err(err);
        }
        if self.sync_mode == WalSyncMode::Immediate {
            state.stats.syncs += 1;
        }
        state.index.push(IndexEntry {
            snapshot,
            offset,
            pos,
        });
        state.append_pos += frame.len() as u64;
        state.stats.records_appended += 1;
        state.stats.bytes_appended += frame.len() as u64;
        debug!(
            partition = state.header.partition.0,
            snapshot = snapshot.0,
            offset = offset.0,
            bytes = frame.len(),
            "wal.append"
        );
        Ok(offset)
    }

    fn write_frame(&self, pos: u64, frame: &[u8]) -> Result<()> {
        self.shared.io.write_at(pos, frame)?;
        if self.sync_mode == WalSyncMode::Immediate {
            self.shared.io.sync_all()?;
        }
        Ok(())
    }

    /// Iterates records with snapshot greater than `after`, up to the
    /// tail as of this call.
    pub fn iter_from(&self, after: SnapshotId) -> Result<WalIter> {
        let state = self.shared.state.lock();
        if after < state.header.base_snapshot {
            return Err(TesseraError::SnapshotGap {
                needed: after.next(),
                oldest: state.header.base_snapshot.next(),
            });
        }
        Ok(WalIter {
            shared: Arc::clone(&self.shared),
            next: after.next(),
            end: state.tail(),
            failed: false,
        })
    }

    /// Drops every record with snapshot below `snapshot`.
    ///
    /// The kept records are written with a new header to a fresh file that
    /// replaces the log in one step, so a crash leaves the old or the new
    /// log. Returns the number of records removed. Iterators positioned
    /// inside the dropped prefix fail with [`TesseraError::SnapshotGap`].
    pub fn truncate_before(&self, snapshot: SnapshotId) -> Result<u64> {
        if self.read_only {
            return Err(TesseraError::Invalid("wal opened read-only"));
        }
        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(TesseraError::Closed);
        }
        let keep_from = state.index.partition_point(|e| e.snapshot < snapshot);
        let new_base = SnapshotId(snapshot.0.saturating_sub(1)).min(state.tail());
        if new_base <= state.header.base_snapshot {
            return Ok(0);
        }
        let src_start = state
            .index
            .get(keep_from)
            .map(|e| e.pos)
            .unwrap_or(state.append_pos);
        let new_base_offset = state
            .index
            .get(keep_from)
            .map(|e| e.offset)
            .unwrap_or_else(|| state.next_offset());
        let moved = state.append_pos - src_start;
        let header = FileHeader {
            partition: state.header.partition,
            base_snapshot: new_base,
            base_offset: new_base_offset,
        };
        let kept_len = usize::try_from(moved)
            .map_err(|_| TesseraError::Invalid("wal suffix exceeds addressable memory"))?;
        let mut contents = Vec::with_capacity(FILE_HEADER_LEN + kept_len);
        contents.extend_from_slice(&header.encode());
        contents.resize(FILE_HEADER_LEN + kept_len, 0);
        let io = self.shared.io.as_ref();
        for (n, chunk) in contents[FILE_HEADER_LEN..].chunks_mut(COPY_CHUNK).enumerate() {
            io.read_at(src_start + (n * COPY_CHUNK) as u64, chunk)?;
        }
        io.replace(&contents)?;

        let shift = src_start - FILE_HEADER_LEN as u64;
        let dropped = keep_from as u64;
        state.index.drain(..keep_from);
        for entry in state.index.iter_mut() {
            entry.pos -= shift;
        }
        state.header = header;
        state.append_pos = FILE_HEADER_LEN as u64 + moved;
        state.stats.truncations += 1;
        info!(
            partition = state.header.partition.0,
            base = new_base.0,
            dropped,
            "wal.truncate_before"
        );
        Ok(dropped)
    }

    /// Drops every record with snapshot above `snapshot`; the next append
    /// continues at `snapshot + 1`.
    ///
    /// Returns the number of records removed. `snapshot` must not be below
    /// the base.
    pub fn truncate_after(&self, snapshot: SnapshotId) -> Result<u64> {
        if self.read_only {
            return Err(TesseraError::Invalid("wal opened read-only"));
        }
        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(TesseraError::Closed);
        }
        if snapshot < state.header.base_snapshot {
            return Err(TesseraError::SnapshotGap {
                needed: snapshot.next(),
                oldest: state.header.base_snapshot.next(),
            });
        }
        let keep = state.index.partition_point(|e| e.snapshot <= snapshot);
        let Some(cut) = state.index.get(keep).map(|e| e.pos) else {
            return Ok(0);
        };
        let io = self.shared.io.as_ref();
        io.truncate(cut)?;
        io.sync_all()?;
        let dropped = (state.index.len() - keep) as u64;
        state.index.truncate(keep);
        state.append_pos = cut;
        state.stats.truncations += 1;
        info!(
            partition = state.header.partition.0,
            tail = snapshot.0,
            dropped,
            "wal.truncate_after"
        );
        Ok(dropped)
    }

    /// Discards every record and restarts the log after `base`.
    pub fn reset(&self, base: SnapshotId) -> Result<()> {
        if self.read_only {
            return Err(TesseraError::Invalid("wal opened read-only"));
        }
        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(TesseraError::Closed);
        }
        let header = FileHeader {
            partition: state.header.partition,
            base_snapshot: base,
            base_offset: state.next_offset(),
        };
        let io = self.shared.io.as_ref();
        io.write_at(0, &header.encode())?;
        io.truncate(FILE_HEADER_LEN as u64)?;
        io.sync_all()?;
        state.header = header;
        state.index.clear();
        state.append_pos = FILE_HEADER_LEN as u64;
        state.stats.truncations += 1;
        info!(
            partition = state.header.partition.0,
            base = base.0,
            "wal.reset"
        );
        Ok(())
    }

    /// Marks the log closed; later appends fail with [`TesseraError::Closed`].
    pub fn close(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        if self.read_only {
            return Ok(());
        }
        self.shared.io.sync_all()
    }

    /// Snapshot of the newest record (or the base when empty).
    pub fn tail(&self) -> SnapshotId {
        self.shared.state.lock().tail()
    }

    /// Snapshot just below the oldest retained record.
    pub fn base(&self) -> SnapshotId {
        self.shared.state.lock().header.base_snapshot
    }

    /// Partition recorded in the file header.
    pub fn partition(&self) -> PartitionId {
        self.shared.state.lock().header.partition
    }

    /// Offset the next appended record will receive.
    pub fn next_offset(&self) -> LogOffset {
        self.shared.state.lock().next_offset()
    }

    /// Offset of the record for `snapshot`, if retained.
    pub fn offset_of(&self, snapshot: SnapshotId) -> Option<LogOffset> {
        self.shared.state.lock().locate(snapshot).map(|e| e.offset)
    }

    /// Number of retained records.
    pub fn record_count(&self) -> usize {
        self.shared.state.lock().index.len()
    }

    /// Current file length in bytes.
    pub fn len_bytes(&self) -> Result<u64> {
        self.shared.io.len()
    }

    /// Counters since open.
    pub fn stats(&self) -> WalStats {
        self.shared.state.lock().stats.clone()
    }
}

/// Lazy iterator over log records; dropping it at any point is safe.
pub struct WalIter {
    shared: Arc<Shared>,
    next: SnapshotId,
    end: SnapshotId,
    failed: bool,
}

impl WalIter {
    /// Reads the next record, or `None` once the captured tail is reached.
    pub fn next_record(&mut self) -> Result<Option<WalRecord>> {
        if self.failed || self.next > self.end {
            return Ok(None);
        }
        let state = self.shared.state.lock();
        if state.closed {
            return Err(TesseraError::Closed);
        }
        let Some(entry) = state.locate(self.next) else {
            if self.next <= state.header.base_snapshot {
                return Err(TesseraError::SnapshotGap {
                    needed: self.next,
                    oldest: state.header.base_snapshot.next(),
                });
            }
            // Log was reset underneath us; nothing more to replay.
            return Ok(None);
        };
        let end = state.append_pos;
        let Some((rec, payload)) = read_record(self.shared.io.as_ref(), entry.pos, end)? else {
            return Err(TesseraError::Corruption("wal record failed validation"));
        };
        drop(state);
        self.next = self.next.next();
        Ok(Some(WalRecord {
            snapshot: rec.snapshot,
            offset: rec.offset,
            appended_at_ms: rec.appended_at_ms,
            payload: Bytes::from(payload),
        }))
    }
}

impl Iterator for WalIter {
    type Item = Result<WalRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_record() {
            Ok(record) => record.map(Ok),
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}

fn read_record(io: &dyn FileIo, pos: u64, end: u64) -> Result<Option<(RecordHeader, Vec<u8>)>> {
    if pos + RECORD_HEADER_LEN as u64 > end {
        return Ok(None);
    }
    let mut head = [0u8; RECORD_HEADER_LEN];
    io.read_at(pos, &mut head)?;
    let len = be_u32(&head[0..4]);
    if len > MAX_RECORD_LEN || pos + (RECORD_HEADER_LEN as u64) + u64::from(len) > end {
        return Ok(None);
    }
    let mut payload = vec![0u8; len as usize];
    io.read_at(pos + RECORD_HEADER_LEN as u64, &mut payload)?;
    if crc32(&[&head[0..4], &head[8..32], &payload]) != be_u32(&head[4..8]) {
        return Ok(None);
    }
    Ok(Some((
        RecordHeader {
            len,
            snapshot: SnapshotId(be_u64(&head[8..16])),
            offset: LogOffset(be_u64(&head[16..24])),
            appended_at_ms: be_u64(&head[24..32]),
        },
        payload,
    )))
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn be_u16(src: &[u8]) -> u16 {
    u16::from_be_bytes([src[0], src[1]])
}

fn be_u32(src: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&src[..4]);
    u32::from_be_bytes(buf)
}

fn be_u64(src: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&src[..8]);
    u64::from_be_bytes(buf)
}
