#![forbid(unsafe_code)]

//! Versioned graph schema.
//!
//! A [`GraphDef`] is an immutable value. DDL never edits one in place: it
//! produces a new definition with a higher version and bumped id counters,
//! which the partition then publishes atomically. Label, property and table
//! ids come from monotonic counters and are never handed out twice, even
//! after the type or kind that held them is dropped.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::operation::{EdgeKindSpec, LoadTarget};
use crate::types::{LabelId, Result, SnapshotId, TableId, TesseraError};

mod ddl;
mod typedef;

pub use ddl::{DdlEffect, DdlOutcome};
pub use typedef::{PropertyDef, TypeDef, TypeKind};

/// A resolved edge kind with the table its rows live in.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EdgeKindDef {
    /// Labels of the kind.
    pub spec: EdgeKindSpec,
    /// Edge type id.
    pub edge_label_id: LabelId,
    /// Source vertex type id.
    pub src_label_id: LabelId,
    /// Destination vertex type id.
    pub dst_label_id: LabelId,
    /// Table allocated when the kind was added.
    pub table_id: TableId,
}

/// A committed data load.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommittedLoad {
    /// Type or kind the rows were loaded into.
    pub target: LoadTarget,
    /// Snapshot of the COMMIT_DATA_LOAD.
    pub snapshot: SnapshotId,
}

/// Schema snapshot: types, edge kinds, load bookkeeping and id counters.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "GraphDefRepr", into = "GraphDefRepr")]
pub struct GraphDef {
    version: u64,
    types: BTreeMap<LabelId, TypeDef>,
    label_to_id: BTreeMap<String, LabelId>,
    edge_kinds: BTreeMap<EdgeKindSpec, EdgeKindDef>,
    retired_labels: BTreeMap<LabelId, SnapshotId>,
    retired_tables: BTreeMap<TableId, SnapshotId>,
    pending_loads: BTreeMap<LoadTarget, TableId>,
    committed_loads: BTreeMap<TableId, CommittedLoad>,
    label_idx: u32,
    property_idx: u32,
    table_idx: u64,
}

#[derive(Serialize, Deserialize)]
struct GraphDefRepr {
    version: u64,
    types: Vec<TypeDef>,
    edge_kinds: Vec<EdgeKindDef>,
    retired_labels: Vec<(LabelId, SnapshotId)>,
    retired_tables: Vec<(TableId, SnapshotId)>,
    pending_loads: Vec<(LoadTarget, TableId)>,
    committed_loads: Vec<(TableId, CommittedLoad)>,
    label_idx: u32,
    property_idx: u32,
    table_idx: u64,
}

impl From<GraphDefRepr> for GraphDef {
    fn from(repr: GraphDefRepr) -> Self {
        let label_to_id = repr
            .types
            .iter()
            .map(|t| (t.label().to_owned(), t.label_id()))
            .collect();
        GraphDef {
            version: repr.version,
            types: repr.types.into_iter().map(|t| (t.label_id(), t)).collect(),
            label_to_id,
            edge_kinds: repr
                .edge_kinds
                .into_iter()
                .map(|k| (k.spec.clone(), k))
                .collect(),
            retired_labels: repr.retired_labels.into_iter().collect(),
            retired_tables: repr.retired_tables.into_iter().collect(),
            pending_loads: repr.pending_loads.into_iter().collect(),
            committed_loads: repr.committed_loads.into_iter().collect(),
            label_idx: repr.label_idx,
            property_idx: repr.property_idx,
            table_idx: repr.table_idx,
        }
    }
}

impl From<GraphDef> for GraphDefRepr {
    fn from(def: GraphDef) -> Self {
        GraphDefRepr {
            version: def.version,
            types: def.types.into_values().collect(),
            edge_kinds: def.edge_kinds.into_values().collect(),
            retired_labels: def.retired_labels.into_iter().collect(),
            retired_tables: def.retired_tables.into_iter().collect(),
            pending_loads: def.pending_loads.into_iter().collect(),
            committed_loads: def.committed_loads.into_iter().collect(),
            label_idx: def.label_idx,
            property_idx: def.property_idx,
            table_idx: def.table_idx,
        }
    }
}

impl GraphDef {
    /// Empty schema at version zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Schema version; bumped by every effective DDL operation.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Last allocated label id.
    pub fn label_idx(&self) -> u32 {
        self.label_idx
    }

    /// Last allocated property id.
    pub fn property_idx(&self) -> u32 {
        self.property_idx
    }

    /// Last allocated table id.
    pub fn table_idx(&self) -> u64 {
        self.table_idx
    }

    /// Live types ordered by label id.
    pub fn types(&self) -> impl Iterator<Item = &TypeDef> {
        self.types.values()
    }

    pub fn type_by_label(&self, label: &str) -> Option<&TypeDef> {
        self.label_to_id
            .get(label)
            .and_then(|id| self.types.get(id))
    }

    pub fn type_by_id(&self, id: LabelId) -> Option<&TypeDef> {
        self.types.get(&id)
    }

    /// Live type of the given kind, or [`TesseraError::UnknownLabel`].
    pub fn expect_type(&self, label: &str, kind: TypeKind) -> Result<&TypeDef> {
        self.type_by_label(label)
            .filter(|def| def.kind() == kind)
            .ok_or_else(|| TesseraError::UnknownLabel(label.to_owned()))
    }

    /// Edge kinds in label order.
    pub fn edge_kinds(&self) -> impl Iterator<Item = &EdgeKindDef> {
        self.edge_kinds.values()
    }

    /// Resolves an edge kind, or [`TesseraError::UnknownLabel`].
    pub fn edge_kind(&self, spec: &EdgeKindSpec) -> Result<&EdgeKindDef> {
        self.edge_kinds
            .get(spec)
            .ok_or_else(|| TesseraError::UnknownLabel(spec.to_string()))
    }

    /// Edge kind stored in `table`.
    pub fn edge_kind_by_table(&self, table: TableId) -> Option<&EdgeKindDef> {
        self.edge_kinds.values().find(|k| k.table_id == table)
    }

    /// Labels retired by drops, with the snapshot of the drop.
    pub fn retired_labels(&self) -> &BTreeMap<LabelId, SnapshotId> {
        &self.retired_labels
    }

    /// Tables retired by kind removals, with the snapshot of the removal.
    pub fn retired_tables(&self) -> &BTreeMap<TableId, SnapshotId> {
        &self.retired_tables
    }

    /// Table of the prepared, uncommitted load for `target`.
    pub fn pending_load(&self, target: &LoadTarget) -> Option<TableId> {
        self.pending_loads.get(target).copied()
    }

    /// Pending loads keyed by target.
    pub fn pending_loads(&self) -> &BTreeMap<LoadTarget, TableId> {
        &self.pending_loads
    }

    /// Target of a pending load table.
    pub fn pending_target(&self, table: TableId) -> Option<&LoadTarget> {
        self.pending_loads
            .iter()
            .find(|(_, t)| **t == table)
            .map(|(target, _)| target)
    }

    /// A committed load table.
    pub fn committed_load(&self, table: TableId) -> Option<&CommittedLoad> {
        self.committed_loads.get(&table)
    }

    /// Committed loads keyed by table.
    pub fn committed_loads(&self) -> &BTreeMap<TableId, CommittedLoad> {
        &self.committed_loads
    }

    /// Serialized form stored in checkpoints and backups.
    pub fn to_blob(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|err| TesseraError::InvalidOwned(format!("graph def encode: {err}")))
    }

    /// Parses a blob produced by [`GraphDef::to_blob`].
    pub fn from_blob(blob: &[u8]) -> Result<Self> {
        serde_json::from_slice(blob).map_err(|_| TesseraError::Corruption("graph def blob"))
    }
}
