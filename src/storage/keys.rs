#![forbid(unsafe_code)]

//! Row key layout.
//!
//! Vertex: `'V' | label_id u32 | pk`.
//! Edge: `'E' | kind table_id u64 | src_pk len u32 | src_pk | dst_pk`.
//! Primary-key bytes are the tagged encodings of the key values in
//! primary-key order.

use bytes::Bytes;

use crate::operation::PropertyValue;
use crate::primitives::bytes::{ByteReader, ByteWriter};
use crate::types::{LabelId, Result, TableId, TesseraError};

const VERTEX_TAG: u8 = b'V';
const EDGE_TAG: u8 = b'E';

/// Which type or table a row key belongs to.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum KeyOwner {
    /// Vertex row of a label.
    Vertex(LabelId),
    /// Edge row of an edge kind table.
    Edge(TableId),
}

/// Encodes primary-key values.
pub fn encode_pk(values: &[PropertyValue]) -> Result<Bytes> {
    let mut out = ByteWriter::new();
    for value in values {
        value.encode(&mut out)?;
    }
    Ok(out.into_bytes())
}

/// Decodes primary-key bytes back into values.
pub fn decode_pk(pk: &[u8]) -> Result<Vec<PropertyValue>> {
    let mut src = ByteReader::new(pk, "primary key");
    let mut values = Vec::new();
    while src.remaining() > 0 {
        values.push(PropertyValue::decode(&mut src)?);
    }
    Ok(values)
}

pub fn vertex_prefix(label: LabelId) -> Vec<u8> {
    let mut key = Vec::with_capacity(5);
    key.push(VERTEX_TAG);
    key.extend_from_slice(&label.0.to_be_bytes());
    key
}

pub fn vertex_key(label: LabelId, pk: &[u8]) -> Bytes {
    let mut key = vertex_prefix(label);
    key.extend_from_slice(pk);
    Bytes::from(key)
}

pub fn edge_prefix(table: TableId) -> Vec<u8> {
    let mut key = Vec::with_capacity(9);
    key.push(EDGE_TAG);
    key.extend_from_slice(&table.0.to_be_bytes());
    key
}

pub fn edge_key(table: TableId, src_pk: &[u8], dst_pk: &[u8]) -> Result<Bytes> {
    let src_len = u32::try_from(src_pk.len())
        .map_err(|_| TesseraError::Invalid("source key too long"))?;
    let mut key = edge_prefix(table);
    key.extend_from_slice(&src_len.to_be_bytes());
    key.extend_from_slice(src_pk);
    key.extend_from_slice(dst_pk);
    Ok(Bytes::from(key))
}

/// Owner of a row key.
pub fn key_owner(key: &[u8]) -> Result<KeyOwner> {
    match key.first() {
        Some(&VERTEX_TAG) if key.len() >= 5 => {
            let mut raw = [0u8; 4];
            raw.copy_from_slice(&key[1..5]);
            Ok(KeyOwner::Vertex(LabelId(u32::from_be_bytes(raw))))
        }
        Some(&EDGE_TAG) if key.len() >= 9 => {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&key[1..9]);
            Ok(KeyOwner::Edge(TableId(u64::from_be_bytes(raw))))
        }
        _ => Err(TesseraError::Corruption("unrecognised row key")),
    }
}

/// Primary-key bytes of a vertex key.
pub fn vertex_pk(key: &[u8]) -> &[u8] {
    key.get(5..).unwrap_or_default()
}

/// Source and destination primary-key bytes of an edge key.
pub fn edge_pks(key: &[u8]) -> Result<(&[u8], &[u8])> {
    let body = key
        .get(9..)
        .ok_or(TesseraError::Corruption("edge key truncated"))?;
    let mut src = ByteReader::new(body, "edge key");
    let src_pk = src
        .get_len_prefixed()
        .map_err(|_| TesseraError::Corruption("edge key truncated"))?;
    Ok((src_pk, &body[4 + src_pk.len()..]))
}
