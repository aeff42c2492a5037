#![forbid(unsafe_code)]

//! Operations, operation batches and their binary form.
//!
//! An [`Operation`] is an op type, a routing key and an opaque payload; the
//! payload is decoded into a [`Payload`] on demand. An [`OperationBatch`]
//! is the unit appended to the operation log and replicated to secondaries.

use bytes::Bytes;
use serde::Serialize;

use crate::primitives::bytes::{ByteReader, ByteWriter};
use crate::types::{crc32, Result, SnapshotId, TesseraError};

pub mod payload;
pub mod value;

pub use payload::{EdgeKindSpec, LoadTarget, Payload, Properties, PropertySpec, TypeSpec};
pub use value::{DataType, PropertyValue};

/// Kind of an operation.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum OpType {
    /// Advances the snapshot without touching state.
    Marker = 0,
    /// Replace a vertex (missing properties take defaults).
    OverwriteVertex = 1,
    /// Merge properties into a vertex, creating it if absent.
    UpdateVertex = 2,
    /// Remove a vertex.
    DeleteVertex = 3,
    /// Replace an edge.
    OverwriteEdge = 4,
    /// Merge properties into an edge, creating it if absent.
    UpdateEdge = 5,
    /// Remove an edge.
    DeleteEdge = 6,
    /// Remove named properties from a vertex.
    ClearVertexProperties = 7,
    /// Remove named properties from an edge.
    ClearEdgeProperties = 8,
    /// Define a vertex type.
    CreateVertexType = 16,
    /// Define an edge type.
    CreateEdgeType = 17,
    /// Attach a (source, relation, destination) kind to an edge type.
    AddEdgeKind = 18,
    /// Drop a vertex type.
    DropVertexType = 19,
    /// Drop an edge type.
    DropEdgeType = 20,
    /// Detach an edge kind.
    RemoveEdgeKind = 21,
    /// Append properties to a vertex type.
    AddVertexTypeProperties = 22,
    /// Append properties to an edge type.
    AddEdgeTypeProperties = 23,
    /// Open an external data load.
    PrepareDataLoad = 24,
    /// Publish an external data load.
    CommitDataLoad = 25,
}

impl OpType {
    /// Every op type, in tag order.
    pub const ALL: [OpType; 19] = [
        OpType::Marker,
        OpType::OverwriteVertex,
        OpType::UpdateVertex,
        OpType::DeleteVertex,
        OpType::OverwriteEdge,
        OpType::UpdateEdge,
        OpType::DeleteEdge,
        OpType::ClearVertexProperties,
        OpType::ClearEdgeProperties,
        OpType::CreateVertexType,
        OpType::CreateEdgeType,
        OpType::AddEdgeKind,
        OpType::DropVertexType,
        OpType::DropEdgeType,
        OpType::RemoveEdgeKind,
        OpType::AddVertexTypeProperties,
        OpType::AddEdgeTypeProperties,
        OpType::PrepareDataLoad,
        OpType::CommitDataLoad,
    ];

    /// Decodes a tag byte.
    pub fn from_u8(tag: u8) -> Option<Self> {
        OpType::ALL.iter().copied().find(|op| *op as u8 == tag)
    }

    /// Whether the op mutates the schema.
    pub fn is_ddl(self) -> bool {
        (self as u8) >= OpType::CreateVertexType as u8
    }

    /// Upper-case name used in logs and dumps.
    pub fn name(self) -> &'static str {
        match self {
            OpType::Marker => "MARKER",
            OpType::OverwriteVertex => "OVERWRITE_VERTEX",
            OpType::UpdateVertex => "UPDATE_VERTEX",
            OpType::DeleteVertex => "DELETE_VERTEX",
            OpType::OverwriteEdge => "OVERWRITE_EDGE",
            OpType::UpdateEdge => "UPDATE_EDGE",
            OpType::DeleteEdge => "DELETE_EDGE",
            OpType::ClearVertexProperties => "CLEAR_VERTEX_PROPERTIES",
            OpType::ClearEdgeProperties => "CLEAR_EDGE_PROPERTIES",
            OpType::CreateVertexType => "CREATE_VERTEX_TYPE",
            OpType::CreateEdgeType => "CREATE_EDGE_TYPE",
            OpType::AddEdgeKind => "ADD_EDGE_KIND",
            OpType::DropVertexType => "DROP_VERTEX_TYPE",
            OpType::DropEdgeType => "DROP_EDGE_TYPE",
            OpType::RemoveEdgeKind => "REMOVE_EDGE_KIND",
            OpType::AddVertexTypeProperties => "ADD_VERTEX_TYPE_PROPERTIES",
            OpType::AddEdgeTypeProperties => "ADD_EDGE_TYPE_PROPERTIES",
            OpType::PrepareDataLoad => "PREPARE_DATA_LOAD",
            OpType::CommitDataLoad => "COMMIT_DATA_LOAD",
        }
    }
}

impl std::fmt::Display for OpType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One typed mutation. Immutable once built.
#[derive(Clone, Debug, PartialEq)]
pub struct Operation {
    op_type: OpType,
    partition_key: u64,
    data: Bytes,
}

impl Operation {
    /// Wraps an already-encoded payload.
    pub fn from_parts(op_type: OpType, partition_key: u64, data: Bytes) -> Self {
        Self {
            op_type,
            partition_key,
            data,
        }
    }

    fn ddl(op_type: OpType, payload: &Payload) -> Result<Self> {
        Ok(Self::from_parts(op_type, 0, payload.encode()?))
    }

    /// Op type.
    pub fn op_type(&self) -> OpType {
        self.op_type
    }

    /// Routing key; zero and meaningless for DDL.
    pub fn partition_key(&self) -> u64 {
        self.partition_key
    }

    /// Raw payload bytes.
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Decodes the payload.
    pub fn payload(&self) -> Result<Payload> {
        Payload::decode(self.op_type, &self.data)
    }

    /// MARKER operation.
    pub fn marker() -> Self {
        Self::from_parts(OpType::Marker, 0, Bytes::new())
    }

    /// CREATE_VERTEX_TYPE.
    pub fn create_vertex_type(label: &str, properties: Vec<PropertySpec>) -> Result<Self> {
        Self::ddl(
            OpType::CreateVertexType,
            &Payload::CreateType(TypeSpec {
                label: label.to_owned(),
                properties,
            }),
        )
    }

    /// CREATE_EDGE_TYPE.
    pub fn create_edge_type(label: &str, properties: Vec<PropertySpec>) -> Result<Self> {
        Self::ddl(
            OpType::CreateEdgeType,
            &Payload::CreateType(TypeSpec {
                label: label.to_owned(),
                properties,
            }),
        )
    }

    /// ADD_EDGE_KIND.
    pub fn add_edge_kind(kind: EdgeKindSpec) -> Result<Self> {
        Self::ddl(OpType::AddEdgeKind, &Payload::AddEdgeKind(kind))
    }

    /// REMOVE_EDGE_KIND.
    pub fn remove_edge_kind(kind: EdgeKindSpec) -> Result<Self> {
        Self::ddl(OpType::RemoveEdgeKind, &Payload::RemoveEdgeKind(kind))
    }

    /// DROP_VERTEX_TYPE.
    pub fn drop_vertex_type(label: &str) -> Result<Self> {
        Self::ddl(
            OpType::DropVertexType,
            &Payload::DropType {
                label: label.to_owned(),
            },
        )
    }

    /// DROP_EDGE_TYPE.
    pub fn drop_edge_type(label: &str) -> Result<Self> {
        Self::ddl(
            OpType::DropEdgeType,
            &Payload::DropType {
                label: label.to_owned(),
            },
        )
    }

    /// ADD_VERTEX_TYPE_PROPERTIES.
    pub fn add_vertex_type_properties(label: &str, properties: Vec<PropertySpec>) -> Result<Self> {
        Self::ddl(
            OpType::AddVertexTypeProperties,
            &Payload::AddProperties {
                label: label.to_owned(),
                properties,
            },
        )
    }

    /// ADD_EDGE_TYPE_PROPERTIES.
    pub fn add_edge_type_properties(label: &str, properties: Vec<PropertySpec>) -> Result<Self> {
        Self::ddl(
            OpType::AddEdgeTypeProperties,
            &Payload::AddProperties {
                label: label.to_owned(),
                properties,
            },
        )
    }

    /// PREPARE_DATA_LOAD.
    pub fn prepare_data_load(target: LoadTarget) -> Result<Self> {
        Self::ddl(OpType::PrepareDataLoad, &Payload::DataLoad(target))
    }

    /// COMMIT_DATA_LOAD.
    pub fn commit_data_load(target: LoadTarget) -> Result<Self> {
        Self::ddl(OpType::CommitDataLoad, &Payload::DataLoad(target))
    }

    /// OVERWRITE_VERTEX.
    pub fn overwrite_vertex(label: &str, pk: Properties, properties: Properties) -> Result<Self> {
        Self::vertex_write(OpType::OverwriteVertex, label, pk, properties)
    }

    /// UPDATE_VERTEX.
    pub fn update_vertex(label: &str, pk: Properties, properties: Properties) -> Result<Self> {
        Self::vertex_write(OpType::UpdateVertex, label, pk, properties)
    }

    fn vertex_write(
        op_type: OpType,
        label: &str,
        pk: Properties,
        properties: Properties,
    ) -> Result<Self> {
        let key = vertex_partition_key(label, &pk)?;
        let payload = Payload::VertexWrite {
            label: label.to_owned(),
            pk,
            properties,
        };
        Ok(Self::from_parts(op_type, key, payload.encode()?))
    }

    /// DELETE_VERTEX.
    pub fn delete_vertex(label: &str, pk: Properties) -> Result<Self> {
        let key = vertex_partition_key(label, &pk)?;
        let payload = Payload::VertexDelete {
            label: label.to_owned(),
            pk,
        };
        Ok(Self::from_parts(OpType::DeleteVertex, key, payload.encode()?))
    }

    /// CLEAR_VERTEX_PROPERTIES.
    pub fn clear_vertex_properties(label: &str, pk: Properties, names: Vec<String>) -> Result<Self> {
        let key = vertex_partition_key(label, &pk)?;
        let payload = Payload::VertexClear {
            label: label.to_owned(),
            pk,
            names,
        };
        Ok(Self::from_parts(
            OpType::ClearVertexProperties,
            key,
            payload.encode()?,
        ))
    }

    /// OVERWRITE_EDGE.
    pub fn overwrite_edge(
        kind: EdgeKindSpec,
        src_pk: Properties,
        dst_pk: Properties,
        properties: Properties,
    ) -> Result<Self> {
        Self::edge_write(OpType::OverwriteEdge, kind, src_pk, dst_pk, properties)
    }

    /// UPDATE_EDGE.
    pub fn update_edge(
        kind: EdgeKindSpec,
        src_pk: Properties,
        dst_pk: Properties,
        properties: Properties,
    ) -> Result<Self> {
        Self::edge_write(OpType::UpdateEdge, kind, src_pk, dst_pk, properties)
    }

    fn edge_write(
        op_type: OpType,
        kind: EdgeKindSpec,
        src_pk: Properties,
        dst_pk: Properties,
        properties: Properties,
    ) -> Result<Self> {
        let key = vertex_partition_key(&kind.src_label, &src_pk)?;
        let payload = Payload::EdgeWrite {
            kind,
            src_pk,
            dst_pk,
            properties,
        };
        Ok(Self::from_parts(op_type, key, payload.encode()?))
    }

    /// DELETE_EDGE.
    pub fn delete_edge(kind: EdgeKindSpec, src_pk: Properties, dst_pk: Properties) -> Result<Self> {
        let key = vertex_partition_key(&kind.src_label, &src_pk)?;
        let payload = Payload::EdgeDelete {
            kind,
            src_pk,
            dst_pk,
        };
        Ok(Self::from_parts(OpType::DeleteEdge, key, payload.encode()?))
    }

    /// CLEAR_EDGE_PROPERTIES.
    pub fn clear_edge_properties(
        kind: EdgeKindSpec,
        src_pk: Properties,
        dst_pk: Properties,
        names: Vec<String>,
    ) -> Result<Self> {
        let key = vertex_partition_key(&kind.src_label, &src_pk)?;
        let payload = Payload::EdgeClear {
            kind,
            src_pk,
            dst_pk,
            names,
        };
        Ok(Self::from_parts(
            OpType::ClearEdgeProperties,
            key,
            payload.encode()?,
        ))
    }
}

/// Routing key of a vertex: CRC32 over its label and primary-key values.
///
/// Columns are hashed in name order and values in their widest form, so
/// every spelling that resolves to the same stored key routes the same way.
/// Edges route with their source vertex.
pub fn vertex_partition_key(label: &str, pk: &[(String, PropertyValue)]) -> Result<u64> {
    let mut columns: Vec<&(String, PropertyValue)> = pk.iter().collect();
    columns.sort_by(|a, b| a.0.cmp(&b.0));
    let mut out = ByteWriter::new();
    out.put_utf(label)?;
    for (name, value) in columns {
        out.put_utf(name)?;
        routing_form(value).encode(&mut out)?;
    }
    Ok(u64::from(crc32(&[&out.into_bytes()])))
}

/// Widening coercions are lossless, so the widest type names the value.
fn routing_form(value: &PropertyValue) -> PropertyValue {
    match value {
        PropertyValue::Short(v) => PropertyValue::Long(i64::from(*v)),
        PropertyValue::Int(v) => PropertyValue::Long(i64::from(*v)),
        PropertyValue::Float(v) => PropertyValue::Double(f64::from(*v)),
        other => other.clone(),
    }
}

/// Ordered operations stamped with the snapshot they advance the log to.
#[derive(Clone, Debug, PartialEq)]
pub struct OperationBatch {
    latest_snapshot_id: SnapshotId,
    trace_id: String,
    operations: Vec<Operation>,
}

impl OperationBatch {
    /// Builds a batch.
    pub fn new(
        latest_snapshot_id: SnapshotId,
        trace_id: impl Into<String>,
        operations: Vec<Operation>,
    ) -> Self {
        Self {
            latest_snapshot_id,
            trace_id: trace_id.into(),
            operations,
        }
    }

    /// Batch holding a single MARKER.
    pub fn marker(latest_snapshot_id: SnapshotId, trace_id: impl Into<String>) -> Self {
        Self::new(latest_snapshot_id, trace_id, vec![Operation::marker()])
    }

    /// Snapshot this batch advances the log to.
    pub fn latest_snapshot_id(&self) -> SnapshotId {
        self.latest_snapshot_id
    }

    /// Diagnostic trace id.
    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    /// Operations in application order.
    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    /// Number of operations.
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// True when the batch carries no operations.
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Whether any operation is DDL.
    pub fn has_ddl(&self) -> bool {
        self.operations.iter().any(|op| op.op_type.is_ddl())
    }

    /// Copy of the batch restamped with another snapshot.
    pub fn with_snapshot(&self, snapshot: SnapshotId) -> Self {
        Self {
            latest_snapshot_id: snapshot,
            ..self.clone()
        }
    }

    /// Binary form stored in the operation log.
    pub fn encode(&self) -> Result<Bytes> {
        let size: usize = self.operations.iter().map(|op| op.data.len() + 13).sum();
        let mut out = ByteWriter::with_capacity(size + self.trace_id.len() + 16);
        out.put_u64(self.latest_snapshot_id.0);
        out.put_utf(&self.trace_id)?;
        let count = u32::try_from(self.operations.len())
            .map_err(|_| TesseraError::Invalid("batch has too many operations"))?;
        out.put_u32(count);
        for op in &self.operations {
            out.put_u8(op.op_type as u8);
            out.put_u64(op.partition_key);
            out.put_len_prefixed(&op.data)?;
        }
        let len = out.len();
        out.finish(len)
    }

    /// Parses bytes produced by [`OperationBatch::encode`].
    pub fn decode(src: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(src, "operation batch");
        let latest_snapshot_id = SnapshotId(reader.get_u64()?);
        let trace_id = reader.get_utf()?;
        let count = reader.get_u32()?;
        let mut operations = Vec::with_capacity(count.min(4096) as usize);
        for _ in 0..count {
            let tag = reader.get_u8()?;
            let op_type = OpType::from_u8(tag)
                .ok_or_else(|| TesseraError::malformed(format!("unknown op type {tag}")))?;
            let partition_key = reader.get_u64()?;
            let data = Bytes::copy_from_slice(reader.get_len_prefixed()?);
            operations.push(Operation::from_parts(op_type, partition_key, data));
        }
        reader.expect_end()?;
        Ok(Self {
            latest_snapshot_id,
            trace_id,
            operations,
        })
    }
}
