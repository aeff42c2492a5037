#![forbid(unsafe_code)]

//! DDL application: one operation in, one new [`GraphDef`] out.

use std::collections::HashSet;

use tracing::debug;

use super::{CommittedLoad, EdgeKindDef, GraphDef, PropertyDef, TypeDef, TypeKind};
use crate::operation::{EdgeKindSpec, LoadTarget, OpType, Payload, PropertySpec, TypeSpec};
use crate::types::{LabelId, PropertyId, Result, SnapshotId, TableId, TesseraError};

/// Side effect the partition must carry out alongside a schema change.
#[derive(Clone, Debug, PartialEq)]
pub enum DdlEffect {
    /// Schema change only.
    None,
    /// A data load was committed; its staged rows become visible.
    LoadCommitted {
        /// Table the rows were staged under.
        table: TableId,
        /// Type or kind the rows belong to.
        target: LoadTarget,
    },
}

/// Result of applying one DDL operation.
#[derive(Clone, Debug)]
pub struct DdlOutcome {
    /// The new schema (equal to the old one for no-op DDL).
    pub def: GraphDef,
    /// Work the caller must perform.
    pub effect: DdlEffect,
}

impl GraphDef {
    /// Validates `payload` as an `op_type` DDL against this schema and
    /// returns the next schema version.
    ///
    /// `at` is the snapshot the operation belongs to; drops record it so
    /// garbage collection knows when retired rows fall below the horizon.
    pub fn apply_ddl(&self, op_type: OpType, payload: &Payload, at: SnapshotId) -> Result<DdlOutcome> {
        let mut next = self.clone();
        let mut effect = DdlEffect::None;
        match (op_type, payload) {
            (OpType::CreateVertexType, Payload::CreateType(spec)) => {
                next.create_type(spec, TypeKind::Vertex)?
            }
            (OpType::CreateEdgeType, Payload::CreateType(spec)) => {
                next.create_type(spec, TypeKind::Edge)?
            }
            (OpType::AddEdgeKind, Payload::AddEdgeKind(spec)) => next.add_edge_kind(spec)?,
            (OpType::RemoveEdgeKind, Payload::RemoveEdgeKind(spec)) => {
                let removed = next
                    .edge_kinds
                    .remove(spec)
                    .ok_or_else(|| TesseraError::UnknownLabel(spec.to_string()))?;
                next.retire_table(removed.table_id, at);
                if let Some(table) = next.pending_loads.remove(&LoadTarget::Edge(spec.clone())) {
                    next.retire_table(table, at);
                }
            }
            (OpType::DropVertexType, Payload::DropType { label }) => {
                next.drop_type(label, TypeKind::Vertex, at)?
            }
            (OpType::DropEdgeType, Payload::DropType { label }) => {
                next.drop_type(label, TypeKind::Edge, at)?
            }
            (OpType::AddVertexTypeProperties, Payload::AddProperties { label, properties }) => {
                next.add_properties(label, TypeKind::Vertex, properties)?
            }
            (OpType::AddEdgeTypeProperties, Payload::AddProperties { label, properties }) => {
                next.add_properties(label, TypeKind::Edge, properties)?
            }
            (OpType::PrepareDataLoad, Payload::DataLoad(target)) => {
                self.check_load_target(target)?;
                if self.pending_loads.contains_key(target) {
                    debug!(%target, "schema.prepare_data_load.already_pending");
                    return Ok(DdlOutcome {
                        def: next,
                        effect,
                    });
                }
                let table = next.allocate_table();
                next.pending_loads.insert(target.clone(), table);
            }
            (OpType::CommitDataLoad, Payload::DataLoad(target)) => {
                self.check_load_target(target)?;
                let table = next.pending_loads.remove(target).ok_or_else(|| {
                    TesseraError::malformed(format!("no pending data load for {target}"))
                })?;
                next.committed_loads.insert(
                    table,
                    CommittedLoad {
                        target: target.clone(),
                        snapshot: at,
                    },
                );
                effect = DdlEffect::LoadCommitted {
                    table,
                    target: target.clone(),
                };
            }
            (op_type, _) => {
                return Err(TesseraError::malformed(format!(
                    "{op_type} does not carry a schema change"
                )))
            }
        }
        next.version += 1;
        debug!(
            op = op_type.name(),
            version = next.version,
            label_idx = next.label_idx,
            property_idx = next.property_idx,
            table_idx = next.table_idx,
            "schema.ddl.applied"
        );
        Ok(DdlOutcome { def: next, effect })
    }

    fn create_type(&mut self, spec: &TypeSpec, kind: TypeKind) -> Result<()> {
        if spec.label.is_empty() {
            return Err(TesseraError::malformed("type label is empty"));
        }
        if self.label_to_id.contains_key(&spec.label) {
            return Err(TesseraError::DuplicateLabel(spec.label.clone()));
        }
        if kind == TypeKind::Vertex && !spec.properties.iter().any(|p| p.primary_key) {
            return Err(TesseraError::malformed(format!(
                "vertex type {} has no primary key",
                spec.label
            )));
        }
        check_unique_names(&spec.label, std::iter::empty(), &spec.properties)?;
        let properties = self.allocate_properties(&spec.properties)?;
        self.label_idx += 1;
        let label_id = LabelId(self.label_idx);
        self.label_to_id.insert(spec.label.clone(), label_id);
        self.types.insert(
            label_id,
            TypeDef::new(spec.label.clone(), label_id, kind, properties),
        );
        Ok(())
    }

    fn add_edge_kind(&mut self, spec: &EdgeKindSpec) -> Result<()> {
        let edge_label_id = self.expect_type(&spec.edge_label, TypeKind::Edge)?.label_id();
        let src_label_id = self.expect_type(&spec.src_label, TypeKind::Vertex)?.label_id();
        let dst_label_id = self.expect_type(&spec.dst_label, TypeKind::Vertex)?.label_id();
        if self.edge_kinds.contains_key(spec) {
            return Err(TesseraError::DuplicateLabel(spec.to_string()));
        }
        let table_id = self.allocate_table();
        self.edge_kinds.insert(
            spec.clone(),
            EdgeKindDef {
                spec: spec.clone(),
                edge_label_id,
                src_label_id,
                dst_label_id,
                table_id,
            },
        );
        Ok(())
    }

    fn drop_type(&mut self, label: &str, kind: TypeKind, at: SnapshotId) -> Result<()> {
        let label_id = self.expect_type(label, kind)?.label_id();
        let in_use = self.edge_kinds.keys().any(|spec| match kind {
            TypeKind::Vertex => spec.src_label == label || spec.dst_label == label,
            TypeKind::Edge => spec.edge_label == label,
        });
        if in_use {
            return Err(TesseraError::EdgeKindInUse(label.to_owned()));
        }
        self.types.remove(&label_id);
        self.label_to_id.remove(label);
        self.retired_labels.insert(label_id, at);
        let target = LoadTarget::Vertex(label.to_owned());
        if let Some(table) = self.pending_loads.remove(&target) {
            self.retire_table(table, at);
        }
        Ok(())
    }

    fn add_properties(&mut self, label: &str, kind: TypeKind, specs: &[PropertySpec]) -> Result<()> {
        let current = self.expect_type(label, kind)?.clone();
        if let Some(pk) = specs.iter().find(|p| p.primary_key) {
            return Err(TesseraError::malformed(format!(
                "cannot add primary key property {} to existing type {label}",
                pk.name
            )));
        }
        check_unique_names(
            label,
            current.properties().iter().map(|p| p.name.as_str()),
            specs,
        )?;
        let label_id = current.label_id();
        let extra = self.allocate_properties(specs)?;
        let widened = current.with_properties(extra);
        self.types.insert(label_id, widened);
        Ok(())
    }

    fn check_load_target(&self, target: &LoadTarget) -> Result<()> {
        match target {
            LoadTarget::Vertex(label) => self.expect_type(label, TypeKind::Vertex).map(|_| ()),
            LoadTarget::Edge(spec) => self.edge_kind(spec).map(|_| ()),
        }
    }

    fn allocate_properties(&mut self, specs: &[PropertySpec]) -> Result<Vec<PropertyDef>> {
        specs
            .iter()
            .map(|spec| {
                let default = match &spec.default {
                    Some(value) => Some(value.clone().coerce_to(spec.data_type)?),
                    None => None,
                };
                self.property_idx += 1;
                Ok(PropertyDef {
                    id: PropertyId(self.property_idx),
                    name: spec.name.clone(),
                    data_type: spec.data_type,
                    primary_key: spec.primary_key,
                    default,
                })
            })
            .collect()
    }

    fn allocate_table(&mut self) -> TableId {
        self.table_idx += 1;
        TableId(self.table_idx)
    }

    fn retire_table(&mut self, table: TableId, at: SnapshotId) {
        self.retired_tables.insert(table, at);
    }
}

fn check_unique_names<'a>(
    label: &str,
    existing: impl Iterator<Item = &'a str>,
    specs: &[PropertySpec],
) -> Result<()> {
    let mut seen: HashSet<&str> = existing.collect();
    for spec in specs {
        if spec.name.is_empty() || !seen.insert(spec.name.as_str()) {
            return Err(TesseraError::malformed(format!(
                "duplicate or empty property name {:?} on {label}",
                spec.name
            )));
        }
    }
    Ok(())
}
