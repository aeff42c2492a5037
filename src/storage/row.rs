#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use bytes::Bytes;

use crate::operation::PropertyValue;
use crate::primitives::bytes::{ByteReader, ByteWriter};
use crate::types::{PropertyId, Result, TesseraError};

/// Property values of one vertex or edge, keyed by property id.
pub type Row = BTreeMap<PropertyId, PropertyValue>;

/// Encodes a row as `count u16` then `(id u32, value)` pairs.
pub fn encode_row(row: &Row) -> Result<Bytes> {
    let count = u16::try_from(row.len())
        .map_err(|_| TesseraError::Invalid("row has more than 65535 properties"))?;
    let mut out = ByteWriter::with_capacity(2 + row.len() * 10);
    out.put_u16(count);
    for (id, value) in row {
        out.put_u32(id.0);
        value.encode(&mut out)?;
    }
    Ok(out.into_bytes())
}

pub fn decode_row(src: &[u8]) -> Result<Row> {
    let mut reader = ByteReader::new(src, "row");
    let count = reader.get_u16()?;
    let mut row = Row::new();
    for _ in 0..count {
        let id = PropertyId(reader.get_u32()?);
        row.insert(id, PropertyValue::decode(&mut reader)?);
    }
    reader
        .expect_end()
        .map_err(|_| TesseraError::Corruption("row has trailing bytes"))?;
    Ok(row)
}
