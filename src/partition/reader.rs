#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use super::apply::resolve_pk;
use super::engine::PinGuard;
use crate::operation::{EdgeKindSpec, Properties, PropertyValue};
use crate::schema::{GraphDef, TypeDef, TypeKind};
use crate::storage::keys::{decode_pk, edge_key, edge_pks, edge_prefix, vertex_key, vertex_prefix};
use crate::storage::row::{decode_row, Row};
use crate::storage::VersionedStore;
use crate::types::{LabelId, Result, SnapshotId, TesseraError};

/// A vertex with its properties resolved to names.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct VertexView {
    pub label: String,
    pub properties: BTreeMap<String, PropertyValue>,
}

/// An edge with its endpoint keys decoded.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EdgeView {
    pub kind: EdgeKindSpec,
    pub src_pk: Vec<PropertyValue>,
    pub dst_pk: Vec<PropertyValue>,
    pub properties: BTreeMap<String, PropertyValue>,
}

/// Read-only view of a partition fixed at one published snapshot.
///
/// The snapshot stays pinned while the reader lives, so garbage collection
/// never reclaims versions it can still see.
pub struct PartitionReader<'a> {
    store: &'a VersionedStore,
    def: Arc<GraphDef>,
    at: SnapshotId,
    _pin: PinGuard<'a>,
}

impl<'a> PartitionReader<'a> {
    pub(crate) fn new(store: &'a VersionedStore, def: Arc<GraphDef>, pin: PinGuard<'a>) -> Self {
        Self {
            store,
            def,
            at: pin.snapshot(),
            _pin: pin,
        }
    }

    /// Snapshot this reader sees.
    pub fn snapshot(&self) -> SnapshotId {
        self.at
    }

    pub fn graph_def(&self) -> &GraphDef {
        &self.def
    }

    pub fn get_vertex(&self, label: &str, pk: &Properties) -> Result<Option<VertexView>> {
        let ty = self.def.expect_type(label, TypeKind::Vertex)?;
        let (pk_bytes, _) = resolve_pk(ty, pk)?;
        self.store
            .get(&vertex_key(ty.label_id(), &pk_bytes), self.at)
            .map(|raw| Ok(vertex_view(ty, decode_row(&raw)?)))
            .transpose()
    }

    pub fn get_edge(
        &self,
        kind: &EdgeKindSpec,
        src_pk: &Properties,
        dst_pk: &Properties,
    ) -> Result<Option<EdgeView>> {
        let resolved = self.def.edge_kind(kind)?;
        let (edge_ty, src_ty, dst_ty) = (
            self.type_of(resolved.edge_label_id)?,
            self.type_of(resolved.src_label_id)?,
            self.type_of(resolved.dst_label_id)?,
        );
        let (src, _) = resolve_pk(src_ty, src_pk)?;
        let (dst, _) = resolve_pk(dst_ty, dst_pk)?;
        let Some(raw) = self
            .store
            .get(&edge_key(resolved.table_id, &src, &dst)?, self.at)
        else {
            return Ok(None);
        };
        Ok(Some(EdgeView {
            kind: kind.clone(),
            src_pk: decode_pk(&src)?,
            dst_pk: decode_pk(&dst)?,
            properties: named(edge_ty, decode_row(&raw)?),
        }))
    }

    /// All vertices of `label`, in primary-key byte order.
    pub fn scan_vertices(&self, label: &str) -> Result<Vec<VertexView>> {
        let ty = self.def.expect_type(label, TypeKind::Vertex)?;
        self.store
            .scan_prefix(&vertex_prefix(ty.label_id()), self.at)
            .into_iter()
            .map(|(_, raw)| Ok(vertex_view(ty, decode_row(&raw)?)))
            .collect()
    }

    /// All edges of one kind.
    pub fn scan_edges(&self, kind: &EdgeKindSpec) -> Result<Vec<EdgeView>> {
        let resolved = self.def.edge_kind(kind)?;
        let edge_ty = self.type_of(resolved.edge_label_id)?;
        self.store
            .scan_prefix(&edge_prefix(resolved.table_id), self.at)
            .into_iter()
            .map(|(key, raw)| {
                let (src, dst) = edge_pks(&key)?;
                Ok(EdgeView {
                    kind: kind.clone(),
                    src_pk: decode_pk(src)?,
                    dst_pk: decode_pk(dst)?,
                    properties: named(edge_ty, decode_row(&raw)?),
                })
            })
            .collect()
    }

    pub fn count_vertices(&self, label: &str) -> Result<usize> {
        let ty = self.def.expect_type(label, TypeKind::Vertex)?;
        Ok(self
            .store
            .scan_prefix(&vertex_prefix(ty.label_id()), self.at)
            .len())
    }

    fn type_of(&self, id: LabelId) -> Result<&TypeDef> {
        self.def
            .type_by_id(id)
            .ok_or(TesseraError::Corruption("edge kind references a missing type"))
    }
}

fn vertex_view(ty: &TypeDef, row: Row) -> VertexView {
    VertexView {
        label: ty.label().to_string(),
        properties: named(ty, row),
    }
}

fn named(ty: &TypeDef, row: Row) -> BTreeMap<String, PropertyValue> {
    row.into_iter()
        .filter_map(|(id, value)| ty.property_by_id(id).map(|p| (p.name.clone(), value)))
        .collect()
}
