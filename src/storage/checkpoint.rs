#![forbid(unsafe_code)]

//! Full-state images: the local recovery checkpoint and backup images.
//!
//! Layout: magic `TSCK`, format version, partition, snapshot, log offset,
//! the GraphDef blob, a row count patched in once all rows are written,
//! the rows as length-prefixed key/value pairs and a trailing CRC32 over
//! everything before it.

use bytes::Bytes;

use crate::primitives::bytes::{ByteReader, ByteWriter};
use crate::schema::GraphDef;
use crate::types::{crc32, LogOffset, PartitionId, Result, SnapshotId, TesseraError};

const CHECKPOINT_MAGIC: [u8; 4] = *b"TSCK";
const CHECKPOINT_VERSION: u16 = 1;

/// Decoded checkpoint or backup image.
#[derive(Debug, Clone)]
pub struct CheckpointImage {
    /// Partition the image was taken from.
    pub partition: PartitionId,
    /// Snapshot the image reflects.
    pub snapshot: SnapshotId,
    /// Next log offset of the partition when the image was taken.
    pub log_offset: LogOffset,
    /// Schema at `snapshot`.
    pub graph_def: GraphDef,
    /// Live rows at `snapshot`, in key order.
    pub rows: Vec<(Bytes, Bytes)>,
}

impl CheckpointImage {
    /// Parses and validates an image.
    pub fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < 4 {
            return Err(TesseraError::Corruption("checkpoint truncated"));
        }
        let (body, trailer) = src.split_at(src.len() - 4);
        let mut crc = [0u8; 4];
        crc.copy_from_slice(trailer);
        if crc32(&[body]) != u32::from_be_bytes(crc) {
            return Err(TesseraError::Corruption("checkpoint crc mismatch"));
        }
        decode_body(body).map_err(|err| match err {
            TesseraError::MalformedOperation(_) => TesseraError::Corruption("checkpoint truncated"),
            other => other,
        })
    }
}

fn decode_body(body: &[u8]) -> Result<CheckpointImage> {
    let mut src = ByteReader::new(body, "checkpoint");
    if src.take(4)? != CHECKPOINT_MAGIC {
        return Err(TesseraError::Corruption("checkpoint magic mismatch"));
    }
    if src.get_u16()? != CHECKPOINT_VERSION {
        return Err(TesseraError::Corruption("checkpoint version mismatch"));
    }
    src.get_u16()?;
    let partition = PartitionId(src.get_u32()?);
    let snapshot = SnapshotId(src.get_u64()?);
    let log_offset = LogOffset(src.get_u64()?);
    let graph_def = GraphDef::from_blob(src.get_len_prefixed()?)?;
    let count = src.get_u64()?;
    let mut rows = Vec::with_capacity(count.min(1 << 20) as usize);
    for _ in 0..count {
        let key = Bytes::copy_from_slice(src.get_len_prefixed()?);
        let value = Bytes::copy_from_slice(src.get_len_prefixed()?);
        rows.push((key, value));
    }
    src.expect_end()?;
    Ok(CheckpointImage {
        partition,
        snapshot,
        log_offset,
        graph_def,
        rows,
    })
}

/// Streaming encoder for a [`CheckpointImage`].
pub struct CheckpointWriter {
    out: ByteWriter,
    count_at: usize,
    rows: u64,
}

impl CheckpointWriter {
    /// Starts an image; rows follow through [`CheckpointWriter::push`].
    pub fn new(
        partition: PartitionId,
        snapshot: SnapshotId,
        log_offset: LogOffset,
        graph_def: &GraphDef,
    ) -> Result<Self> {
        let mut out = ByteWriter::with_capacity(4096);
        out.put_bytes(&CHECKPOINT_MAGIC);
        out.put_u16(CHECKPOINT_VERSION);
        out.put_u16(0);
        out.put_u32(partition.0);
        out.put_u64(snapshot.0);
        out.put_u64(log_offset.0);
        out.put_len_prefixed(&graph_def.to_blob()?)?;
        let count_at = out.len();
        out.put_u64(0);
        Ok(Self {
            out,
            count_at,
            rows: 0,
        })
    }

    pub fn push(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.out.put_len_prefixed(key)?;
        self.out.put_len_prefixed(value)?;
        self.rows += 1;
        Ok(())
    }

    /// Rows pushed so far.
    pub fn rows(&self) -> u64 {
        self.rows
    }

    /// Patches the row count, appends the CRC and freezes the image.
    pub fn finish(mut self) -> Result<Bytes> {
        self.out.write_u64(self.count_at, self.rows);
        let crc = crc32(&[self.out.as_slice()]);
        self.out.put_u32(crc);
        let len = self.out.len();
        self.out.finish(len)
    }
}
