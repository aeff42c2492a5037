#![forbid(unsafe_code)]

//! Typed bodies of operations and their binary encoding.
//!
//! Which [`Payload`] variant an operation carries is fully determined by its
//! [`OpType`]; decoding never consults the schema.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::value::{DataType, PropertyValue};
use super::OpType;
use crate::primitives::bytes::{ByteReader, ByteWriter};
use crate::types::{Result, TesseraError};

/// Named property values, in caller order.
pub type Properties = Vec<(String, PropertyValue)>;

/// Definition of one property in a DDL payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PropertySpec {
    /// Property name, unique within its type.
    pub name: String,
    /// Declared column type.
    pub data_type: DataType,
    /// Whether the property is part of the primary key.
    pub primary_key: bool,
    /// Value written by an overwrite that omits the property.
    pub default: Option<PropertyValue>,
}

impl PropertySpec {
    /// Plain, nullable property without a default.
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            primary_key: false,
            default: None,
        }
    }

    /// Primary-key property.
    pub fn primary_key(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            primary_key: true,
            ..Self::new(name, data_type)
        }
    }

    /// Sets the default value.
    pub fn with_default(mut self, default: PropertyValue) -> Self {
        self.default = Some(default);
        self
    }

    fn encode(&self, out: &mut ByteWriter) -> Result<()> {
        out.put_utf(&self.name)?;
        self.data_type.encode(out);
        out.put_bool(self.primary_key);
        match &self.default {
            Some(value) => {
                out.put_bool(true);
                value.encode(out)?;
            }
            None => out.put_bool(false),
        }
        Ok(())
    }

    fn decode(src: &mut ByteReader<'_>) -> Result<Self> {
        let name = src.get_utf()?;
        let data_type = DataType::decode(src)?;
        let primary_key = src.get_bool()?;
        let default = if src.get_bool()? {
            Some(PropertyValue::decode(src)?)
        } else {
            None
        };
        Ok(Self {
            name,
            data_type,
            primary_key,
            default,
        })
    }
}

/// Label and ordered properties of a type being created.
#[derive(Clone, Debug, PartialEq)]
pub struct TypeSpec {
    /// Type label.
    pub label: String,
    /// Properties in declaration order.
    pub properties: Vec<PropertySpec>,
}

/// A (source type, relation, destination type) triple by label.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct EdgeKindSpec {
    /// Edge type label.
    pub edge_label: String,
    /// Source vertex type label.
    pub src_label: String,
    /// Destination vertex type label.
    pub dst_label: String,
}

impl EdgeKindSpec {
    /// Builds a kind from its three labels.
    pub fn new(
        edge_label: impl Into<String>,
        src_label: impl Into<String>,
        dst_label: impl Into<String>,
    ) -> Self {
        Self {
            edge_label: edge_label.into(),
            src_label: src_label.into(),
            dst_label: dst_label.into(),
        }
    }

    fn encode(&self, out: &mut ByteWriter) -> Result<()> {
        out.put_utf(&self.edge_label)?;
        out.put_utf(&self.src_label)?;
        out.put_utf(&self.dst_label)
    }

    fn decode(src: &mut ByteReader<'_>) -> Result<Self> {
        Ok(Self {
            edge_label: src.get_utf()?,
            src_label: src.get_utf()?,
            dst_label: src.get_utf()?,
        })
    }
}

impl std::fmt::Display for EdgeKindSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-[{}]->{}", self.src_label, self.edge_label, self.dst_label)
    }
}

/// What a data load targets.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadTarget {
    /// Rows of a vertex type.
    Vertex(String),
    /// Rows of an edge kind.
    Edge(EdgeKindSpec),
}

impl LoadTarget {
    pub(crate) fn encode(&self, out: &mut ByteWriter) -> Result<()> {
        match self {
            LoadTarget::Vertex(label) => {
                out.put_u8(0);
                out.put_utf(label)
            }
            LoadTarget::Edge(kind) => {
                out.put_u8(1);
                kind.encode(out)
            }
        }
    }

    pub(crate) fn decode(src: &mut ByteReader<'_>) -> Result<Self> {
        match src.get_u8()? {
            0 => Ok(LoadTarget::Vertex(src.get_utf()?)),
            1 => Ok(LoadTarget::Edge(EdgeKindSpec::decode(src)?)),
            other => Err(TesseraError::malformed(format!(
                "unknown load target tag {other}"
            ))),
        }
    }
}

impl std::fmt::Display for LoadTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadTarget::Vertex(label) => f.write_str(label),
            LoadTarget::Edge(kind) => write!(f, "{kind}"),
        }
    }
}

/// Decoded body of an [`super::Operation`].
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    /// No-op that only advances the snapshot.
    Marker,
    /// CREATE_VERTEX_TYPE / CREATE_EDGE_TYPE.
    CreateType(TypeSpec),
    /// ADD_EDGE_KIND.
    AddEdgeKind(EdgeKindSpec),
    /// REMOVE_EDGE_KIND.
    RemoveEdgeKind(EdgeKindSpec),
    /// DROP_VERTEX_TYPE / DROP_EDGE_TYPE.
    DropType {
        /// Label of the type to drop.
        label: String,
    },
    /// ADD_VERTEX_TYPE_PROPERTIES / ADD_EDGE_TYPE_PROPERTIES.
    AddProperties {
        /// Type to extend.
        label: String,
        /// New properties, appended in order.
        properties: Vec<PropertySpec>,
    },
    /// PREPARE_DATA_LOAD / COMMIT_DATA_LOAD.
    DataLoad(LoadTarget),
    /// OVERWRITE_VERTEX / UPDATE_VERTEX.
    VertexWrite {
        /// Vertex type.
        label: String,
        /// Primary-key values.
        pk: Properties,
        /// Non-key values.
        properties: Properties,
    },
    /// DELETE_VERTEX.
    VertexDelete {
        /// Vertex type.
        label: String,
        /// Primary-key values.
        pk: Properties,
    },
    /// CLEAR_VERTEX_PROPERTIES.
    VertexClear {
        /// Vertex type.
        label: String,
        /// Primary-key values.
        pk: Properties,
        /// Properties to remove.
        names: Vec<String>,
    },
    /// OVERWRITE_EDGE / UPDATE_EDGE.
    EdgeWrite {
        /// Edge kind.
        kind: EdgeKindSpec,
        /// Source vertex primary key.
        src_pk: Properties,
        /// Destination vertex primary key.
        dst_pk: Properties,
        /// Edge property values.
        properties: Properties,
    },
    /// DELETE_EDGE.
    EdgeDelete {
        /// Edge kind.
        kind: EdgeKindSpec,
        /// Source vertex primary key.
        src_pk: Properties,
        /// Destination vertex primary key.
        dst_pk: Properties,
    },
    /// CLEAR_EDGE_PROPERTIES.
    EdgeClear {
        /// Edge kind.
        kind: EdgeKindSpec,
        /// Source vertex primary key.
        src_pk: Properties,
        /// Destination vertex primary key.
        dst_pk: Properties,
        /// Properties to remove.
        names: Vec<String>,
    },
}

impl Payload {
    /// Encodes the payload body (the op type is stored beside it).
    pub fn encode(&self) -> Result<Bytes> {
        let mut out = ByteWriter::new();
        match self {
            Payload::Marker => {}
            Payload::CreateType(spec) => {
                out.put_utf(&spec.label)?;
                put_specs(&mut out, &spec.properties)?;
            }
            Payload::AddEdgeKind(kind) | Payload::RemoveEdgeKind(kind) => kind.encode(&mut out)?,
            Payload::DropType { label } => out.put_utf(label)?,
            Payload::AddProperties { label, properties } => {
                out.put_utf(label)?;
                put_specs(&mut out, properties)?;
            }
            Payload::DataLoad(target) => target.encode(&mut out)?,
            Payload::VertexWrite {
                label,
                pk,
                properties,
            } => {
                out.put_utf(label)?;
                put_properties(&mut out, pk)?;
                put_properties(&mut out, properties)?;
            }
            Payload::VertexDelete { label, pk } => {
                out.put_utf(label)?;
                put_properties(&mut out, pk)?;
            }
            Payload::VertexClear { label, pk, names } => {
                out.put_utf(label)?;
                put_properties(&mut out, pk)?;
                put_names(&mut out, names)?;
            }
            Payload::EdgeWrite {
                kind,
                src_pk,
                dst_pk,
                properties,
            } => {
                kind.encode(&mut out)?;
                put_properties(&mut out, src_pk)?;
                put_properties(&mut out, dst_pk)?;
                put_properties(&mut out, properties)?;
            }
            Payload::EdgeDelete {
                kind,
                src_pk,
                dst_pk,
            } => {
                kind.encode(&mut out)?;
                put_properties(&mut out, src_pk)?;
                put_properties(&mut out, dst_pk)?;
            }
            Payload::EdgeClear {
                kind,
                src_pk,
                dst_pk,
                names,
            } => {
                kind.encode(&mut out)?;
                put_properties(&mut out, src_pk)?;
                put_properties(&mut out, dst_pk)?;
                put_names(&mut out, names)?;
            }
        }
        let len = out.len();
        out.finish(len)
    }

    /// Decodes the body of an operation of type `op_type`.
    pub fn decode(op_type: OpType, data: &[u8]) -> Result<Self> {
        let mut src = ByteReader::new(data, op_type.name());
        let payload = match op_type {
            OpType::Marker => Payload::Marker,
            OpType::CreateVertexType | OpType::CreateEdgeType => Payload::CreateType(TypeSpec {
                label: src.get_utf()?,
                properties: get_specs(&mut src)?,
            }),
            OpType::AddEdgeKind => Payload::AddEdgeKind(EdgeKindSpec::decode(&mut src)?),
            OpType::RemoveEdgeKind => Payload::RemoveEdgeKind(EdgeKindSpec::decode(&mut src)?),
            OpType::DropVertexType | OpType::DropEdgeType => Payload::DropType {
                label: src.get_utf()?,
            },
            OpType::AddVertexTypeProperties | OpType::AddEdgeTypeProperties => {
                Payload::AddProperties {
                    label: src.get_utf()?,
                    properties: get_specs(&mut src)?,
                }
            }
            OpType::PrepareDataLoad | OpType::CommitDataLoad => {
                Payload::DataLoad(LoadTarget::decode(&mut src)?)
            }
            OpType::OverwriteVertex | OpType::UpdateVertex => Payload::VertexWrite {
                label: src.get_utf()?,
                pk: get_properties(&mut src)?,
                properties: get_properties(&mut src)?,
            },
            OpType::DeleteVertex => Payload::VertexDelete {
                label: src.get_utf()?,
                pk: get_properties(&mut src)?,
            },
            OpType::ClearVertexProperties => Payload::VertexClear {
                label: src.get_utf()?,
                pk: get_properties(&mut src)?,
                names: get_names(&mut src)?,
            },
            OpType::OverwriteEdge | OpType::UpdateEdge => Payload::EdgeWrite {
                kind: EdgeKindSpec::decode(&mut src)?,
                src_pk: get_properties(&mut src)?,
                dst_pk: get_properties(&mut src)?,
                properties: get_properties(&mut src)?,
            },
            OpType::DeleteEdge => Payload::EdgeDelete {
                kind: EdgeKindSpec::decode(&mut src)?,
                src_pk: get_properties(&mut src)?,
                dst_pk: get_properties(&mut src)?,
            },
            OpType::ClearEdgeProperties => Payload::EdgeClear {
                kind: EdgeKindSpec::decode(&mut src)?,
                src_pk: get_properties(&mut src)?,
                dst_pk: get_properties(&mut src)?,
                names: get_names(&mut src)?,
            },
        };
        src.expect_end()?;
        Ok(payload)
    }
}

pub(crate) fn put_properties(out: &mut ByteWriter, props: &[(String, PropertyValue)]) -> Result<()> {
    out.put_u16(count_u16(props.len())?);
    for (name, value) in props {
        out.put_utf(name)?;
        value.encode(out)?;
    }
    Ok(())
}

pub(crate) fn get_properties(src: &mut ByteReader<'_>) -> Result<Properties> {
    let count = src.get_u16()?;
    let mut props = Vec::with_capacity(usize::from(count));
    for _ in 0..count {
        let name = src.get_utf()?;
        props.push((name, PropertyValue::decode(src)?));
    }
    Ok(props)
}

fn put_specs(out: &mut ByteWriter, specs: &[PropertySpec]) -> Result<()> {
    out.put_u16(count_u16(specs.len())?);
    specs.iter().try_for_each(|spec| spec.encode(out))
}

fn get_specs(src: &mut ByteReader<'_>) -> Result<Vec<PropertySpec>> {
    let count = src.get_u16()?;
    (0..count).map(|_| PropertySpec::decode(src)).collect()
}

fn put_names(out: &mut ByteWriter, names: &[String]) -> Result<()> {
    out.put_u16(count_u16(names.len())?);
    names.iter().try_for_each(|name| out.put_utf(name))
}

fn get_names(src: &mut ByteReader<'_>) -> Result<Vec<String>> {
    let count = src.get_u16()?;
    (0..count).map(|_| src.get_utf()).collect()
}

fn count_u16(len: usize) -> Result<u16> {
    u16::try_from(len).map_err(|_| TesseraError::Invalid("more than 65535 entries in payload"))
}
