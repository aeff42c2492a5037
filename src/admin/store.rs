use std::collections::BTreeMap;
use std::path::Path;

use serde::Serialize;

use crate::admin::error::AdminError;
use crate::admin::Result;
use crate::config::StoreConfig;
use crate::operation::{EdgeKindSpec, LoadTarget, Operation};
use crate::partition::{GcReport, IngestOutcome, PartitionStatus, StoreState};
use crate::service::StoreService;
use crate::storage::LocalExternalStorage;
use crate::types::{SnapshotId, TableId};

/// Status of every partition of a store.
#[derive(Clone, Debug, Serialize)]
pub struct StateReport {
    pub data_dir: Option<String>,
    pub partitions: Vec<PartitionStatus>,
    pub store_state: BTreeMap<u32, StoreState>,
}

/// What a `compact` run reclaimed.
#[derive(Clone, Debug, Serialize)]
pub struct CompactReport {
    pub data_dir: Option<String>,
    pub partitions: Vec<GcReport>,
}

fn open(config: &StoreConfig) -> Result<StoreService> {
    if let Some(dir) = &config.data_dir {
        if !dir.exists() {
            return Err(AdminError::missing_data_dir(dir));
        }
    }
    Ok(StoreService::open(config)?)
}

/// Opens the store, recovering each partition, and reports its state.
pub fn state(config: &StoreConfig) -> Result<StateReport> {
    let service = open(config)?;
    let report = StateReport {
        data_dir: config.data_dir.as_ref().map(|d| d.display().to_string()),
        partitions: service.statuses()?,
        store_state: service.get_store_state()?,
    };
    service.close()?;
    Ok(report)
}

/// Runs `CompactDB` on the store.
pub fn compact(config: &StoreConfig) -> Result<CompactReport> {
    let service = open(config)?;
    let partitions = service.compact_db()?;
    service.close()?;
    Ok(CompactReport {
        data_dir: config.data_dir.as_ref().map(|d| d.display().to_string()),
        partitions,
    })
}

/// Files an `ingest` run staged.
#[derive(Clone, Debug, Serialize)]
pub struct IngestReport {
    pub data_path: String,
    pub partitions: Vec<IngestEntry>,
}

#[derive(Clone, Debug, Serialize)]
pub struct IngestEntry {
    pub partition: u32,
    #[serde(flatten)]
    pub outcome: IngestOutcome,
}

/// Snapshot at which a `commit` made a load visible.
#[derive(Clone, Debug, Serialize)]
pub struct CommitReport {
    pub target: String,
    pub table: TableId,
    pub snapshot: SnapshotId,
}

/// Stages `<storage_root>/<data_path>/part-NNNNN.tsbl` on every partition
/// that has a file.
pub fn ingest(config: &StoreConfig, storage_root: &Path, data_path: &str) -> Result<IngestReport> {
    if !storage_root.is_dir() {
        return Err(AdminError::Missing {
            kind: "ingest root",
            path: storage_root.to_path_buf(),
        });
    }
    let service = open(config)?;
    let storage = LocalExternalStorage::new(storage_root);
    let outcomes = service.ingest_data(data_path, &storage)?;
    service.close()?;
    if outcomes.is_empty() {
        return Err(AdminError::Message(format!(
            "no partition files under {}",
            storage_root.join(data_path).display()
        )));
    }
    Ok(IngestReport {
        data_path: data_path.to_string(),
        partitions: outcomes
            .into_iter()
            .map(|(id, outcome)| IngestEntry {
                partition: id.0,
                outcome,
            })
            .collect(),
    })
}

/// Submits `COMMIT_DATA_LOAD` for the pending load of `target`.
pub fn commit(config: &StoreConfig, target: LoadTarget) -> Result<CommitReport> {
    let service = open(config)?;
    let table = service
        .partitions()
        .first()
        .and_then(|p| p.graph_def().pending_load(&target))
        .ok_or_else(|| AdminError::Message(format!("no pending data load of {target}")))?;
    let coordinator = service.coordinator()?;
    let receipt =
        coordinator.submit(vec![Operation::commit_data_load(target.clone())?], "commit")?;
    service.close()?;
    Ok(CommitReport {
        target: target.to_string(),
        table,
        snapshot: receipt.snapshot,
    })
}

/// Parses `LABEL` as a vertex type or `EDGE:SRC:DST` as an edge kind.
pub fn parse_load_target(text: &str) -> Result<LoadTarget> {
    let parts: Vec<&str> = text.split(':').collect();
    match parts.as_slice() {
        [label] if !label.is_empty() => Ok(LoadTarget::Vertex(label.to_string())),
        [edge, src, dst] if !edge.is_empty() && !src.is_empty() && !dst.is_empty() => {
            Ok(LoadTarget::Edge(EdgeKindSpec::new(*edge, *src, *dst)))
        }
        _ => Err(AdminError::Message(format!(
            "load target {text:?} is neither LABEL nor EDGE:SRC:DST"
        ))),
    }
}
