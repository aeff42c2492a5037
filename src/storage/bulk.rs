#![forbid(unsafe_code)]

//! Bulk load files built offline and side-loaded into a partition.
//!
//! Layout: magic `TSBL`, format version, table id, load target, row count,
//! rows, CRC32 trailer over everything before it. Rows are named property
//! lists; edge rows also carry the endpoint primary keys.

use std::path::Path;

use bytes::Bytes;

use crate::operation::payload::{get_properties, put_properties};
use crate::operation::{LoadTarget, Properties};
use crate::primitives::bytes::{ByteReader, ByteWriter};
use crate::types::{crc32, Result, TableId, TesseraError};

const BULK_MAGIC: [u8; 4] = *b"TSBL";
const BULK_VERSION: u16 = 1;

/// One row of a bulk file.
#[derive(Clone, Debug, PartialEq)]
pub enum BulkRow {
    /// Vertex row.
    Vertex {
        /// Primary-key values.
        pk: Properties,
        /// Other values.
        properties: Properties,
    },
    /// Edge row.
    Edge {
        /// Source vertex primary key.
        src_pk: Properties,
        /// Destination vertex primary key.
        dst_pk: Properties,
        /// Edge values.
        properties: Properties,
    },
}

/// Parsed bulk file.
#[derive(Clone, Debug)]
pub struct BulkFile {
    /// Table the load was prepared under.
    pub table: TableId,
    /// Type or edge kind the rows belong to.
    pub target: LoadTarget,
    /// Rows in file order.
    pub rows: Vec<BulkRow>,
    /// CRC32 trailer; identifies the file contents.
    pub checksum: u32,
}

impl BulkFile {
    /// Validates and parses a bulk file.
    pub fn parse(src: &[u8]) -> Result<Self> {
        if src.len() < 4 {
            return Err(TesseraError::malformed("bulk file truncated"));
        }
        let (body, trailer) = src.split_at(src.len() - 4);
        let mut raw = [0u8; 4];
        raw.copy_from_slice(trailer);
        let checksum = u32::from_be_bytes(raw);
        if crc32(&[body]) != checksum {
            return Err(TesseraError::malformed("bulk file crc mismatch"));
        }
        let mut reader = ByteReader::new(body, "bulk file");
        if reader.take(4)? != BULK_MAGIC {
            return Err(TesseraError::malformed("bulk file magic mismatch"));
        }
        if reader.get_u16()? != BULK_VERSION {
            return Err(TesseraError::malformed("bulk file version mismatch"));
        }
        let table = TableId(reader.get_u64()?);
        let target = LoadTarget::decode(&mut reader)?;
        let count = reader.get_u64()?;
        let mut rows = Vec::with_capacity(count.min(1 << 16) as usize);
        for _ in 0..count {
            let row = match target {
                LoadTarget::Vertex(_) => BulkRow::Vertex {
                    pk: get_properties(&mut reader)?,
                    properties: get_properties(&mut reader)?,
                },
                LoadTarget::Edge(_) => BulkRow::Edge {
                    src_pk: get_properties(&mut reader)?,
                    dst_pk: get_properties(&mut reader)?,
                    properties: get_properties(&mut reader)?,
                },
            };
            rows.push(row);
        }
        reader.expect_end()?;
        Ok(Self {
            table,
            target,
            rows,
            checksum,
        })
    }

    /// Reads the CRC trailer without parsing the rows.
    pub fn checksum_of(src: &[u8]) -> Option<u32> {
        let trailer = src.get(src.len().checked_sub(4)?..)?;
        let mut raw = [0u8; 4];
        raw.copy_from_slice(trailer);
        Some(u32::from_be_bytes(raw))
    }
}

/// Offline-loader side: accumulates rows and produces a bulk file.
pub struct BulkFileWriter {
    target: LoadTarget,
    out: ByteWriter,
    count_at: usize,
    rows: u64,
}

impl BulkFileWriter {
    /// Starts a file for the load prepared as `table` on `target`.
    pub fn new(table: TableId, target: LoadTarget) -> Result<Self> {
        let mut out = ByteWriter::new();
        out.put_bytes(&BULK_MAGIC);
        out.put_u16(BULK_VERSION);
        out.put_u64(table.0);
        target.encode(&mut out)?;
        let count_at = out.len();
        out.put_u64(0);
        Ok(Self {
            target,
            out,
            count_at,
            rows: 0,
        })
    }

    /// Appends a row; its shape must match the target.
    pub fn push(&mut self, row: BulkRow) -> Result<()> {
        match (&self.target, row) {
            (LoadTarget::Vertex(_), BulkRow::Vertex { pk, properties }) => {
                put_properties(&mut self.out, &pk)?;
                put_properties(&mut self.out, &properties)?;
            }
            (
                LoadTarget::Edge(_),
                BulkRow::Edge {
                    src_pk,
                    dst_pk,
                    properties,
                },
            ) => {
                put_properties(&mut self.out, &src_pk)?;
                put_properties(&mut self.out, &dst_pk)?;
                put_properties(&mut self.out, &properties)?;
            }
            _ => return Err(TesseraError::Invalid("bulk row does not match load target")),
        }
        self.rows += 1;
        Ok(())
    }

    /// Finishes the file.
    pub fn finish(mut self) -> Result<Bytes> {
        self.out.write_u64(self.count_at, self.rows);
        let crc = crc32(&[self.out.as_slice()]);
        self.out.put_u32(crc);
        Ok(self.out.into_bytes())
    }

    /// Finishes the file and writes it to `path`.
    pub fn write_to(self, path: impl AsRef<Path>) -> Result<()> {
        let bytes = self.finish()?;
        std::fs::write(path, &bytes)?;
        Ok(())
    }
}
