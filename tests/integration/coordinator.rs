#![allow(missing_docs)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tessera::backup::BackupEngine;
use tessera::coordinator::{Coordinator, RetryPolicy};
use tessera::operation::{DataType, OpType, Operation, OperationBatch, Properties, PropertySpec, PropertyValue};
use tessera::partition::{
    CatchUpReport, GcReport, GraphPartition, IngestOutcome, Partition, PartitionOptions,
    PartitionState, StoreState,
};
use tessera::storage::ExternalStorage;
use tessera::types::{LogOffset, PartitionId, Result, SnapshotId, TableId, TesseraError};

/// Fails the next `failures` writes with a transient error.
struct Flaky {
    inner: Partition,
    failures: AtomicU32,
    attempts: AtomicU32,
}

impl Flaky {
    fn new(id: u32) -> Result<Self> {
        Ok(Self {
            inner: Partition::open(PartitionOptions::in_memory(PartitionId(id)))?,
            failures: AtomicU32::new(0),
            attempts: AtomicU32::new(0),
        })
    }

    fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }
}

impl GraphPartition for Flaky {
    fn id(&self) -> PartitionId {
        self.inner.id()
    }

    fn write_batch(&self, snapshot_id: SnapshotId, batch: &OperationBatch) -> Result<bool> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let left = self.failures.load(Ordering::SeqCst);
        if left > 0 {
            self.failures.store(left - 1, Ordering::SeqCst);
            return Err(TesseraError::PrimaryUnreachable("injected".into()));
        }
        self.inner.write_batch(snapshot_id, batch)
    }

    fn check_batch(&self, batch: &OperationBatch) -> Result<()> {
        self.inner.check_batch(batch)
    }

    fn graph_def_blob(&self) -> Result<Vec<u8>> {
        self.inner.graph_def_blob()
    }

    fn ingest_external_file(&self, storage: &dyn ExternalStorage, path: &str) -> Result<IngestOutcome> {
        self.inner.ingest_external_file(storage, path)
    }

    fn clear_ingest(&self, table: TableId) -> Result<bool> {
        self.inner.clear_ingest(table)
    }

    fn open_backup_engine(&self) -> BackupEngine<'_> {
        self.inner.open_backup_engine()
    }

    fn garbage_collect(&self, snapshot_id: SnapshotId) -> Result<GcReport> {
        self.inner.garbage_collect(snapshot_id)
    }

    fn try_catch_up_with_primary(&self) -> Result<CatchUpReport> {
        self.inner.try_catch_up_with_primary()
    }

    fn reopen_secondary(&self) -> Result<CatchUpReport> {
        self.inner.reopen_secondary()
    }

    fn watermark(&self) -> SnapshotId {
        self.inner.watermark()
    }

    fn state(&self) -> PartitionState {
        self.inner.state()
    }

    fn store_state(&self) -> Result<StoreState> {
        self.inner.store_state()
    }

    fn replay_records(&self, offset: LogOffset, timestamp_ms: u64) -> Result<Vec<SnapshotId>> {
        self.inner.replay_records(offset, timestamp_ms)
    }

    fn close(&self) -> Result<()> {
        self.inner.close()
    }
}

fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_backoff_ms: 1,
        max_backoff_ms: 4,
    }
}

fn cluster(n: u32, retry: RetryPolicy) -> Result<(Vec<Arc<Flaky>>, Coordinator)> {
    let parts = (0..n).map(|id| Flaky::new(id).map(Arc::new)).collect::<Result<Vec<_>>>()?;
    let dyn_parts = parts
        .iter()
        .map(|p| Arc::clone(p) as Arc<dyn GraphPartition>)
        .collect();
    Ok((parts, Coordinator::new(dyn_parts, retry)?))
}

fn pk(id: i64) -> Properties {
    vec![("id".into(), PropertyValue::Long(id))]
}

fn schema() -> Result<Vec<Operation>> {
    Ok(vec![Operation::create_vertex_type(
        "user",
        vec![
            PropertySpec::primary_key("id", DataType::Long),
            PropertySpec::new("score", DataType::Long),
        ],
    )?])
}

fn upsert(id: i64) -> Result<Operation> {
    Operation::overwrite_vertex("user", pk(id), vec![("score".into(), PropertyValue::Long(id * 10))])
}

#[test]
fn ddl_reaches_every_partition_and_dml_is_routed() -> Result<()> {
    let (parts, coordinator) = cluster(3, fast_retry(1))?;
    let receipt = coordinator.submit(schema()?, "schema")?;
    assert_eq!(receipt.snapshot, SnapshotId(1));
    assert!(receipt.has_ddl);
    let blob = parts[0].graph_def_blob()?;
    assert!(parts.iter().all(|p| p.graph_def_blob().ok() == Some(blob.clone())));

    let ops = (0..30).map(upsert).collect::<Result<Vec<_>>>()?;
    let homes: Vec<usize> = ops.iter().map(|op| (op.partition_key() % 3) as usize).collect();
    let receipt = coordinator.submit(ops, "load")?;
    assert!(!receipt.has_ddl);
    assert!(parts.iter().all(|p| p.watermark() == SnapshotId(2)));

    for (id, home) in homes.iter().enumerate() {
        for (index, part) in parts.iter().enumerate() {
            let found = part.inner.reader().get_vertex("user", &pk(id as i64))?.is_some();
            assert_eq!(found, index == *home, "user {id} on partition {index}");
        }
    }
    let total: usize = parts
        .iter()
        .map(|p| p.inner.reader().count_vertices("user"))
        .sum::<Result<usize>>()?;
    assert_eq!(total, 30);
    Ok(())
}

#[test]
fn same_vertex_lands_on_one_partition_whatever_the_key_width() -> Result<()> {
    let (parts, coordinator) = cluster(2, fast_retry(1))?;
    coordinator.submit(schema()?, "schema")?;
    for id in 0..8 {
        let narrow = vec![("id".to_string(), PropertyValue::Int(id))];
        coordinator.submit(vec![Operation::overwrite_vertex("user", narrow, vec![])?], "int")?;
        coordinator.submit(
            vec![Operation::update_vertex(
                "user",
                pk(i64::from(id)),
                vec![("score".into(), PropertyValue::Long(1))],
            )?],
            "long",
        )?;
    }
    for id in 0..8 {
        let copies = parts
            .iter()
            .map(|p| p.inner.reader().get_vertex("user", &pk(id)))
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .flatten()
            .collect::<Vec<_>>();
        assert_eq!(copies.len(), 1, "user {id}");
        assert_eq!(copies[0].properties["score"], PropertyValue::Long(1));
    }

    coordinator.submit(vec![Operation::delete_vertex("user", pk(3))?], "delete")?;
    let total: usize = parts
        .iter()
        .map(|p| p.inner.reader().count_vertices("user"))
        .sum::<Result<usize>>()?;
    assert_eq!(total, 7);
    Ok(())
}

#[test]
fn partitions_without_work_receive_a_marker() -> Result<()> {
    let (parts, coordinator) = cluster(4, fast_retry(1))?;
    coordinator.submit(schema()?, "schema")?;
    let op = upsert(7)?;
    let home = (op.partition_key() % 4) as usize;

    let batch = OperationBatch::new(SnapshotId(2), "one", vec![op.clone()]);
    for index in 0..4 {
        let routed = coordinator.route(&batch, index);
        assert_eq!(routed.latest_snapshot_id(), SnapshotId(2));
        assert_eq!(routed.trace_id(), "one");
        if index == home {
            assert_eq!(routed.len(), 1);
        } else {
            assert_eq!(routed.operations()[0].op_type(), OpType::Marker);
        }
    }

    coordinator.submit(vec![op], "one")?;
    assert!(parts.iter().all(|p| p.watermark() == SnapshotId(2)));
    Ok(())
}

#[test]
fn invalid_batches_consume_no_snapshot() -> Result<()> {
    let (parts, coordinator) = cluster(2, fast_retry(1))?;
    let err = coordinator.submit(vec![upsert(1)?], "too-early");
    assert!(matches!(err, Err(TesseraError::UnknownLabel(_))));
    assert_eq!(coordinator.snapshot(), SnapshotId::ZERO);
    assert!(!coordinator.has_pending());

    let receipt = coordinator.submit(schema()?, "schema")?;
    assert_eq!(receipt.snapshot, SnapshotId(1));
    assert!(parts.iter().all(|p| p.watermark() == SnapshotId(1)));
    Ok(())
}

#[test]
fn transient_failures_are_retried_with_backoff() -> Result<()> {
    let (parts, coordinator) = cluster(2, fast_retry(5))?;
    parts[1].fail_next(3);
    coordinator.submit(schema()?, "schema")?;
    assert_eq!(parts[1].attempts.load(Ordering::SeqCst), 4);
    assert!(parts.iter().all(|p| p.watermark() == SnapshotId(1)));
    Ok(())
}

#[test]
fn undelivered_batch_is_redelivered_before_the_next_one() -> Result<()> {
    let (parts, coordinator) = cluster(2, fast_retry(2))?;
    coordinator.submit(schema()?, "schema")?;
    parts[1].fail_next(10);

    let err = coordinator.submit(vec![upsert(1)?, upsert(2)?], "stuck");
    assert!(matches!(err, Err(TesseraError::PrimaryUnreachable(_))));
    assert!(coordinator.has_pending());
    assert_eq!(coordinator.snapshot(), SnapshotId(1));
    assert_eq!(parts[0].watermark(), SnapshotId(2));
    assert_eq!(parts[1].watermark(), SnapshotId(1));

    parts[1].fail_next(0);
    let receipt = coordinator.retry_pending()?.ok_or(TesseraError::NotFound)?;
    assert_eq!(receipt.snapshot, SnapshotId(2));
    assert!(!coordinator.has_pending());
    assert_eq!(coordinator.retry_pending()?, None);

    let next = coordinator.submit(vec![upsert(3)?], "next")?;
    assert_eq!(next.snapshot, SnapshotId(3));
    assert!(parts.iter().all(|p| p.watermark() == SnapshotId(3)));
    Ok(())
}

#[test]
fn pending_batch_goes_out_first_on_submit() -> Result<()> {
    let (parts, coordinator) = cluster(2, fast_retry(1))?;
    coordinator.submit(schema()?, "schema")?;
    parts[0].fail_next(1);
    assert!(coordinator.submit(vec![upsert(5)?], "first").is_err());

    let receipt = coordinator.submit(vec![upsert(6)?], "second")?;
    assert_eq!(receipt.snapshot, SnapshotId(3));
    let user5 = (0..2).any(|i| {
        parts[i]
            .inner
            .reader()
            .get_vertex("user", &pk(5))
            .ok()
            .flatten()
            .is_some()
    });
    assert!(user5);
    Ok(())
}

#[test]
fn backup_and_restore_cover_all_partitions() -> Result<()> {
    let (parts, coordinator) = cluster(3, fast_retry(1))?;
    coordinator.submit(schema()?, "schema")?;
    coordinator.submit((0..9).map(upsert).collect::<Result<Vec<_>>>()?, "load")?;

    let info = coordinator.create_backup()?;
    assert_eq!(info.snapshot_id, SnapshotId(2));
    assert_eq!(info.partition_backups.len(), 3);
    assert_eq!(info.partition_offsets.len(), 3);

    coordinator.submit(vec![Operation::delete_vertex("user", pk(0))?], "delete")?;
    coordinator.restore_backup(&info)?;
    assert_eq!(coordinator.snapshot(), SnapshotId(2));
    assert!(parts.iter().all(|p| p.watermark() == SnapshotId(2)));
    let total: usize = parts
        .iter()
        .map(|p| p.inner.reader().count_vertices("user"))
        .sum::<Result<usize>>()?;
    assert_eq!(total, 9);

    let receipt = coordinator.submit(vec![upsert(100)?], "after-restore")?;
    assert_eq!(receipt.snapshot, SnapshotId(3));

    let reports = coordinator.garbage_collect(SnapshotId(3))?;
    assert_eq!(reports.len(), 3);
    assert!(reports.iter().all(|r| r.horizon == SnapshotId(3)));
    Ok(())
}

#[test]
fn restored_cluster_replays_its_logs_back_to_currency() -> Result<()> {
    let (parts, coordinator) = cluster(3, fast_retry(1))?;
    coordinator.submit(schema()?, "schema")?;
    coordinator.submit((0..9).map(upsert).collect::<Result<Vec<_>>>()?, "load")?;
    let info = coordinator.create_backup()?;
    coordinator.submit(vec![Operation::delete_vertex("user", pk(0))?], "delete-0")?;
    coordinator.submit(vec![Operation::delete_vertex("user", pk(1))?], "delete-1")?;

    coordinator.restore_backup(&info)?;
    assert_eq!(coordinator.snapshot(), SnapshotId(2));
    assert_eq!(coordinator.replay_after_restore(&info)?, SnapshotId(4));
    assert!(parts.iter().all(|p| p.watermark() == SnapshotId(4)));
    let total: usize = parts
        .iter()
        .map(|p| p.inner.reader().count_vertices("user"))
        .sum::<Result<usize>>()?;
    assert_eq!(total, 7);
    assert_eq!(coordinator.submit(vec![upsert(50)?], "next")?.snapshot, SnapshotId(5));
    Ok(())
}

#[test]
fn restarted_coordinator_continues_after_the_highest_watermark() -> Result<()> {
    let (parts, coordinator) = cluster(2, fast_retry(1))?;
    coordinator.submit(schema()?, "schema")?;
    parts[1].fail_next(1);
    assert!(coordinator.submit(vec![upsert(1)?, upsert(2)?], "lost").is_err());
    drop(coordinator);

    let dyn_parts = parts
        .iter()
        .map(|p| Arc::clone(p) as Arc<dyn GraphPartition>)
        .collect();
    let restarted = Coordinator::new(dyn_parts, fast_retry(1))?;
    assert_eq!(restarted.snapshot(), SnapshotId(2));
    assert!(Coordinator::new(Vec::new(), fast_retry(1)).is_err());
    Ok(())
}
