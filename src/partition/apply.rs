#![forbid(unsafe_code)]

//! Staging of one batch against a snapshot of the partition.
//!
//! Every operation is validated and its effect buffered in a [`WriteSet`]
//! plus a candidate [`GraphDef`]; nothing touches the store until the whole
//! batch has staged, so a failing operation leaves no trace. DML resolves
//! types against the candidate schema, which already includes DDL staged
//! earlier in the same batch.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::operation::{
    EdgeKindSpec, LoadTarget, OpType, Operation, Payload, Properties, PropertyValue,
};
use crate::primitives::io::BlobStore;
use crate::replication::PrimaryLink;
use crate::schema::{DdlEffect, GraphDef, TypeDef, TypeKind};
use crate::storage::bulk::{BulkFile, BulkRow};
use crate::storage::keys::{edge_key, encode_pk, vertex_key};
use crate::storage::row::{decode_row, encode_row, Row};
use crate::storage::{VersionedStore, WriteSet};
use crate::types::{PropertyId, Result, SnapshotId, TableId, TesseraError};

/// Blob name of the staged bulk file for `table`.
pub fn load_blob_name(table: TableId) -> String {
    format!("load-{:08}.tsbl", table.0)
}

/// Outcome of staging a batch.
pub(crate) struct StagedBatch {
    pub def: Arc<GraphDef>,
    pub writes: WriteSet,
    pub has_ddl: bool,
}

pub(crate) struct BatchApplier<'a> {
    store: &'a VersionedStore,
    blobs: &'a dyn BlobStore,
    load_source: Option<&'a dyn PrimaryLink>,
    read_at: SnapshotId,
    snapshot: SnapshotId,
    def: Arc<GraphDef>,
    writes: WriteSet,
    has_ddl: bool,
}

impl<'a> BatchApplier<'a> {
    /// Applier for the batch at `snapshot` over state published at `read_at`.
    pub fn new(
        store: &'a VersionedStore,
        blobs: &'a dyn BlobStore,
        def: Arc<GraphDef>,
        read_at: SnapshotId,
        snapshot: SnapshotId,
    ) -> Self {
        Self {
            store,
            blobs,
            load_source: None,
            read_at,
            snapshot,
            def,
            writes: WriteSet::new(),
            has_ddl: false,
        }
    }

    /// Falls back to `source` for bulk files missing locally.
    pub fn with_load_source(mut self, source: Option<&'a dyn PrimaryLink>) -> Self {
        self.load_source = source;
        self
    }

    pub fn stage(mut self, ops: &[Operation]) -> Result<StagedBatch> {
        let snapshot = self.snapshot;
        for (idx, op) in ops.iter().enumerate() {
            self.stage_op(op).map_err(|err| {
                debug!(
                    snapshot = snapshot.0,
                    op_index = idx,
                    op = op.op_type().name(),
                    error = %err,
                    "partition.apply.rejected"
                );
                err
            })?;
        }
        Ok(StagedBatch {
            def: self.def,
            writes: self.writes,
            has_ddl: self.has_ddl,
        })
    }

    fn stage_op(&mut self, op: &Operation) -> Result<()> {
        let op_type = op.op_type();
        let payload = op.payload()?;
        if op_type.is_ddl() {
            let outcome = self.def.apply_ddl(op_type, &payload, self.snapshot)?;
            self.def = Arc::new(outcome.def);
            self.has_ddl = true;
            if let DdlEffect::LoadCommitted { table, .. } = outcome.effect {
                self.commit_load(table)?;
            }
            return Ok(());
        }
        match payload {
            Payload::Marker => Ok(()),
            Payload::VertexWrite {
                label,
                pk,
                properties,
            } => self.write_vertex(op_type == OpType::OverwriteVertex, &label, &pk, properties),
            Payload::VertexDelete { label, pk } => {
                let key = self.vertex_key(&label, &pk)?;
                if self.current_row(&key)?.is_some() {
                    self.writes.delete(key);
                }
                Ok(())
            }
            Payload::VertexClear { label, pk, names } => {
                let def = Arc::clone(&self.def);
                let ty = def.expect_type(&label, TypeKind::Vertex)?;
                let key = self.vertex_key(&label, &pk)?;
                self.clear(ty, key, &names)
            }
            Payload::EdgeWrite {
                kind,
                src_pk,
                dst_pk,
                properties,
            } => self.write_edge(
                op_type == OpType::OverwriteEdge,
                &kind,
                &src_pk,
                &dst_pk,
                properties,
            ),
            Payload::EdgeDelete {
                kind,
                src_pk,
                dst_pk,
            } => {
                let (_, key) = self.edge_key(&kind, &src_pk, &dst_pk)?;
                if self.current_row(&key)?.is_some() {
                    self.writes.delete(key);
                }
                Ok(())
            }
            Payload::EdgeClear {
                kind,
                src_pk,
                dst_pk,
                names,
            } => {
                let (edge_ty, key) = self.edge_key(&kind, &src_pk, &dst_pk)?;
                self.clear(&edge_ty, key, &names)
            }
            other => Err(TesseraError::malformed(format!(
                "{op_type} carries unexpected payload {other:?}"
            ))),
        }
    }

    fn write_vertex(
        &mut self,
        overwrite: bool,
        label: &str,
        pk: &Properties,
        properties: Properties,
    ) -> Result<()> {
        let def = Arc::clone(&self.def);
        let ty = def.expect_type(label, TypeKind::Vertex)?;
        let (pk_bytes, pk_values) = resolve_pk(ty, pk)?;
        let key = vertex_key(ty.label_id(), &pk_bytes);
        let mut row = if overwrite {
            Row::new()
        } else {
            self.current_row(&key)?.unwrap_or_default()
        };
        for (id, value) in pk_values {
            row.insert(id, value);
        }
        merge_properties(ty, &mut row, properties)?;
        if overwrite {
            fill_defaults(ty, &mut row);
        }
        self.writes.put(key, encode_row(&row)?);
        Ok(())
    }

    fn write_edge(
        &mut self,
        overwrite: bool,
        kind: &EdgeKindSpec,
        src_pk: &Properties,
        dst_pk: &Properties,
        properties: Properties,
    ) -> Result<()> {
        let (edge_ty, key) = self.edge_key(kind, src_pk, dst_pk)?;
        let mut row = if overwrite {
            Row::new()
        } else {
            self.current_row(&key)?.unwrap_or_default()
        };
        merge_properties(&edge_ty, &mut row, properties)?;
        if overwrite {
            fill_defaults(&edge_ty, &mut row);
        }
        self.writes.put(key, encode_row(&row)?);
        Ok(())
    }

    fn clear(&mut self, ty: &TypeDef, key: Bytes, names: &[String]) -> Result<()> {
        let mut ids = Vec::with_capacity(names.len());
        for name in names {
            let prop = ty.property(name).ok_or_else(|| {
                TesseraError::malformed(format!("{} has no property {name}", ty.label()))
            })?;
            if prop.primary_key {
                return Err(TesseraError::malformed(format!(
                    "cannot clear primary key {name} of {}",
                    ty.label()
                )));
            }
            ids.push(prop.id);
        }
        let Some(mut row) = self.current_row(&key)? else {
            return Ok(());
        };
        for id in ids {
            row.remove(&id);
        }
        self.writes.put(key, encode_row(&row)?);
        Ok(())
    }

    fn vertex_key(&self, label: &str, pk: &Properties) -> Result<Bytes> {
        let ty = self.def.expect_type(label, TypeKind::Vertex)?;
        let (pk_bytes, _) = resolve_pk(ty, pk)?;
        Ok(vertex_key(ty.label_id(), &pk_bytes))
    }

    fn edge_key(
        &self,
        kind: &EdgeKindSpec,
        src_pk: &Properties,
        dst_pk: &Properties,
    ) -> Result<(TypeDef, Bytes)> {
        let resolved = self.def.edge_kind(kind)?;
        let lookup = |id| {
            self.def
                .type_by_id(id)
                .ok_or(TesseraError::Corruption("edge kind references a missing type"))
        };
        let edge_ty = lookup(resolved.edge_label_id)?;
        let (src, _) = resolve_pk(lookup(resolved.src_label_id)?, src_pk)?;
        let (dst, _) = resolve_pk(lookup(resolved.dst_label_id)?, dst_pk)?;
        Ok((edge_ty.clone(), edge_key(resolved.table_id, &src, &dst)?))
    }

    fn current_row(&self, key: &[u8]) -> Result<Option<Row>> {
        let raw = match self.writes.get(key) {
            Some(staged) => staged.cloned(),
            None => self.store.get(key, self.read_at),
        };
        raw.map(|bytes| decode_row(&bytes)).transpose()
    }

    fn commit_load(&mut self, table: TableId) -> Result<()> {
        let name = load_blob_name(table);
        let mut blob = self.blobs.get(&name)?;
        if blob.is_none() {
            if let Some(source) = self.load_source {
                if let Some(fetched) = source.fetch_load(table)? {
                    self.blobs.put(&name, &fetched)?;
                    blob = Some(fetched);
                }
            }
        }
        let Some(blob) = blob else {
            warn!(
                table = table.0,
                snapshot = self.snapshot.0,
                "partition.load.missing_file"
            );
            return Ok(());
        };
        let file = BulkFile::parse(&blob)?;
        if file.table != table {
            return Err(TesseraError::Corruption("staged bulk file belongs to another table"));
        }
        let rows = file.rows.len();
        for row in file.rows {
            match (&file.target, row) {
                (LoadTarget::Vertex(label), BulkRow::Vertex { pk, properties }) => {
                    self.write_vertex(true, label, &pk, properties)?
                }
                (
                    LoadTarget::Edge(kind),
                    BulkRow::Edge {
                        src_pk,
                        dst_pk,
                        properties,
                    },
                ) => self.write_edge(true, kind, &src_pk, &dst_pk, properties)?,
                _ => return Err(TesseraError::Corruption("bulk row does not match its target")),
            }
        }
        debug!(
            table = table.0,
            rows,
            snapshot = self.snapshot.0,
            "partition.load.committed"
        );
        Ok(())
    }
}

/// Encodes the primary key of `ty` from named values.
///
/// Exactly the key properties must be supplied, none null; values are
/// coerced to the declared column types.
pub(crate) fn resolve_pk(
    ty: &TypeDef,
    pk: &Properties,
) -> Result<(Bytes, Vec<(PropertyId, PropertyValue)>)> {
    if ty.pk_idxs().is_empty() {
        if pk.is_empty() {
            return Ok((Bytes::new(), Vec::new()));
        }
        return Err(TesseraError::malformed(format!(
            "{} has no primary key",
            ty.label()
        )));
    }
    if pk.len() != ty.pk_idxs().len() {
        return Err(TesseraError::malformed(format!(
            "{} expects {} primary key values, got {}",
            ty.label(),
            ty.pk_idxs().len(),
            pk.len()
        )));
    }
    let mut values = Vec::with_capacity(pk.len());
    let mut resolved = Vec::with_capacity(pk.len());
    for prop in ty.pk_properties() {
        let value = pk
            .iter()
            .find(|(name, _)| *name == prop.name)
            .map(|(_, v)| v.clone())
            .ok_or_else(|| {
                TesseraError::malformed(format!(
                    "missing primary key {} of {}",
                    prop.name,
                    ty.label()
                ))
            })?
            .coerce_to(prop.data_type)?;
        if value.is_null() {
            return Err(TesseraError::malformed(format!(
                "primary key {} of {} is null",
                prop.name,
                ty.label()
            )));
        }
        values.push(value.clone());
        resolved.push((prop.id, value));
    }
    Ok((encode_pk(&values)?, resolved))
}

fn merge_properties(ty: &TypeDef, row: &mut Row, properties: Properties) -> Result<()> {
    for (name, value) in properties {
        let prop = ty.property(&name).ok_or_else(|| {
            TesseraError::malformed(format!("{} has no property {name}", ty.label()))
        })?;
        if prop.primary_key {
            return Err(TesseraError::malformed(format!(
                "primary key {name} of {} cannot be written as a property",
                ty.label()
            )));
        }
        match value.coerce_to(prop.data_type)? {
            PropertyValue::Null => {
                row.remove(&prop.id);
            }
            value => {
                row.insert(prop.id, value);
            }
        }
    }
    Ok(())
}

fn fill_defaults(ty: &TypeDef, row: &mut Row) {
    for prop in ty.properties() {
        if let Some(default) = &prop.default {
            row.entry(prop.id).or_insert_with(|| default.clone());
        }
    }
}
