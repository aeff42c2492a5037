#![forbid(unsafe_code)]

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::operation::{DataType, PropertyValue};
use crate::types::{LabelId, PropertyId};

/// Whether a type describes vertices or edges.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypeKind {
    /// Vertex type.
    Vertex,
    /// Edge type.
    Edge,
}

/// One property of a type, with its permanently allocated id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PropertyDef {
    /// Allocated id; never reused.
    pub id: PropertyId,
    /// Name, unique within the type.
    pub name: String,
    /// Declared column type.
    pub data_type: DataType,
    /// Part of the primary key.
    pub primary_key: bool,
    /// Value an overwrite fills in when the property is omitted.
    pub default: Option<PropertyValue>,
}

/// Immutable definition of one graph type.
///
/// The primary-key positions and the name and id lookup tables are derived
/// once in [`TypeDef::new`]. Adding properties yields a new `TypeDef`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(from = "TypeDefRepr", into = "TypeDefRepr")]
pub struct TypeDef {
    label: String,
    label_id: LabelId,
    kind: TypeKind,
    properties: Vec<PropertyDef>,
    pk_idxs: Vec<usize>,
    name_to_idx: HashMap<String, usize>,
    id_to_idx: HashMap<PropertyId, usize>,
}

#[derive(Serialize, Deserialize)]
struct TypeDefRepr {
    label: String,
    label_id: LabelId,
    kind: TypeKind,
    properties: Vec<PropertyDef>,
}

impl From<TypeDefRepr> for TypeDef {
    fn from(repr: TypeDefRepr) -> Self {
        TypeDef::new(repr.label, repr.label_id, repr.kind, repr.properties)
    }
}

impl From<TypeDef> for TypeDefRepr {
    fn from(def: TypeDef) -> Self {
        TypeDefRepr {
            label: def.label,
            label_id: def.label_id,
            kind: def.kind,
            properties: def.properties,
        }
    }
}

impl PartialEq for TypeDef {
    fn eq(&self, other: &Self) -> bool {
        self.label == other.label
            && self.label_id == other.label_id
            && self.kind == other.kind
            && self.properties == other.properties
    }
}

impl TypeDef {
    /// Builds a type and derives its lookup tables.
    pub fn new(
        label: impl Into<String>,
        label_id: LabelId,
        kind: TypeKind,
        properties: Vec<PropertyDef>,
    ) -> Self {
        let pk_idxs = properties
            .iter()
            .enumerate()
            .filter(|(_, p)| p.primary_key)
            .map(|(idx, _)| idx)
            .collect();
        let name_to_idx = properties
            .iter()
            .enumerate()
            .map(|(idx, p)| (p.name.clone(), idx))
            .collect();
        let id_to_idx = properties
            .iter()
            .enumerate()
            .map(|(idx, p)| (p.id, idx))
            .collect();
        Self {
            label: label.into(),
            label_id,
            kind,
            properties,
            pk_idxs,
            name_to_idx,
            id_to_idx,
        }
    }

    /// New definition with `extra` appended after the existing properties.
    pub fn with_properties(&self, extra: Vec<PropertyDef>) -> TypeDef {
        let mut properties = self.properties.clone();
        properties.extend(extra);
        TypeDef::new(self.label.clone(), self.label_id, self.kind, properties)
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn label_id(&self) -> LabelId {
        self.label_id
    }

    pub fn kind(&self) -> TypeKind {
        self.kind
    }

    /// Properties in declaration order.
    pub fn properties(&self) -> &[PropertyDef] {
        &self.properties
    }

    /// Positions of the primary-key properties.
    pub fn pk_idxs(&self) -> &[usize] {
        &self.pk_idxs
    }

    /// Primary-key properties in key order.
    pub fn pk_properties(&self) -> impl Iterator<Item = &PropertyDef> {
        self.pk_idxs.iter().map(|idx| &self.properties[*idx])
    }

    pub fn property(&self, name: &str) -> Option<&PropertyDef> {
        self.name_to_idx.get(name).map(|idx| &self.properties[*idx])
    }

    pub fn property_by_id(&self, id: PropertyId) -> Option<&PropertyDef> {
        self.id_to_idx.get(&id).map(|idx| &self.properties[*idx])
    }
}
