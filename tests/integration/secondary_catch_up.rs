#![allow(missing_docs)]

use std::sync::Arc;

use tessera::operation::{DataType, Operation, OperationBatch, Properties, PropertySpec, PropertyValue};
use tessera::partition::{GraphPartition, Partition, PartitionOptions, PartitionState, Role};
use tessera::replication::LocalPrimary;
use tessera::types::{PartitionId, Result, SnapshotId, TesseraError};

fn primary() -> Result<Arc<Partition>> {
    Ok(Arc::new(Partition::open(PartitionOptions::in_memory(PartitionId(0)))?))
}

fn secondary(primary: &Arc<Partition>, name: &str, lag_threshold: u64) -> Result<Partition> {
    let partition = Partition::open(
        PartitionOptions::in_memory(PartitionId(0))
            .role(Role::Secondary)
            .replica_name(name)
            .catch_up_lag_threshold(lag_threshold)
            .catch_up_fetch_limit(3),
    )?;
    partition.set_primary(Arc::new(LocalPrimary::new(Arc::clone(primary))));
    Ok(partition)
}

fn pk(id: i64) -> Properties {
    vec![("id".into(), PropertyValue::Long(id))]
}

fn batch(snapshot: u64) -> Result<OperationBatch> {
    let op = match snapshot {
        1 => Operation::create_vertex_type(
            "page",
            vec![
                PropertySpec::primary_key("id", DataType::Long),
                PropertySpec::new("hits", DataType::Long),
            ],
        )?,
        s if s % 10 == 0 => Operation::add_vertex_type_properties(
            "page",
            vec![PropertySpec::new(format!("tag{s}"), DataType::String)],
        )?,
        s => Operation::update_vertex(
            "page",
            pk(s as i64 % 4),
            vec![("hits".into(), PropertyValue::Long(s as i64))],
        )?,
    };
    Ok(OperationBatch::new(SnapshotId(snapshot), format!("s{snapshot}"), vec![op]))
}

fn write_through(partition: &Partition, from: u64, to: u64) -> Result<()> {
    for s in from..=to {
        partition.write_batch(SnapshotId(s), &batch(s)?)?;
    }
    Ok(())
}

fn assert_same_state(a: &Partition, b: &Partition) -> Result<()> {
    assert_eq!(a.watermark(), b.watermark());
    assert_eq!(a.graph_def_blob()?, b.graph_def_blob()?);
    assert_eq!(
        a.reader().scan_vertices("page")?,
        b.reader().scan_vertices("page")?
    );
    Ok(())
}

#[test]
fn catch_up_applies_missing_batches_in_order() -> Result<()> {
    let primary = primary()?;
    write_through(&primary, 1, 12)?;
    let replica = secondary(&primary, "r1", 100)?;

    let report = replica.try_catch_up_with_primary()?;
    assert_eq!(report.from, SnapshotId::ZERO);
    assert_eq!(report.to, SnapshotId(12));
    assert_eq!(report.batches, 12);
    assert_eq!(report.state, PartitionState::Serving);
    assert_same_state(&primary, &replica)?;

    write_through(&primary, 13, 15)?;
    let report = replica.try_catch_up_with_primary()?;
    assert_eq!(report.batches, 3);
    assert_same_state(&primary, &replica)?;

    let idle = replica.try_catch_up_with_primary()?;
    assert_eq!(idle.batches, 0);
    Ok(())
}

#[test]
fn lagging_secondary_rejects_writes_until_caught_up() -> Result<()> {
    let primary = primary()?;
    write_through(&primary, 1, 30)?;
    let replica = secondary(&primary, "r1", 4)?;
    primary.garbage_collect(SnapshotId(30))?;

    let err = replica.try_catch_up_with_primary();
    assert!(matches!(err, Err(TesseraError::SnapshotGap { .. })));
    assert_eq!(replica.state(), PartitionState::CatchingUp);
    assert!(matches!(
        replica.write_batch(SnapshotId(1), &batch(1)?),
        Err(TesseraError::NotServing(PartitionState::CatchingUp))
    ));

    let report = replica.reopen_secondary()?;
    assert_eq!(report.installed_checkpoint, Some(SnapshotId(30)));
    assert_eq!(report.state, PartitionState::Serving);
    assert_same_state(&primary, &replica)?;
    Ok(())
}

#[test]
fn replica_acknowledgements_hold_back_primary_gc() -> Result<()> {
    let primary = primary()?;
    write_through(&primary, 1, 8)?;
    let replica = secondary(&primary, "r1", 100)?;
    replica.try_catch_up_with_primary()?;

    write_through(&primary, 9, 20)?;
    let report = primary.garbage_collect(SnapshotId(20))?;
    assert_eq!(report.horizon, SnapshotId(8));

    let report = replica.try_catch_up_with_primary()?;
    assert_eq!(report.to, SnapshotId(20));
    assert_same_state(&primary, &replica)?;
    assert_eq!(primary.garbage_collect(SnapshotId(20))?.horizon, SnapshotId(20));
    Ok(())
}

#[test]
fn reopen_converges_with_log_catch_up() -> Result<()> {
    let primary = primary()?;
    write_through(&primary, 1, 8)?;
    let by_log = secondary(&primary, "by-log", 100)?;
    by_log.try_catch_up_with_primary()?;
    let by_reopen = secondary(&primary, "by-reopen", 100)?;

    write_through(&primary, 9, 25)?;
    primary.garbage_collect(SnapshotId(25))?;
    by_log.try_catch_up_with_primary()?;
    let report = by_reopen.reopen_secondary()?;
    assert_eq!(report.installed_checkpoint, Some(SnapshotId(25)));

    assert_same_state(&by_log, &by_reopen)?;
    assert_same_state(&primary, &by_reopen)?;

    // Without a newer checkpoint, reopening falls back to the log.
    write_through(&primary, 26, 27)?;
    let report = by_reopen.reopen_secondary()?;
    assert_eq!(report.installed_checkpoint, None);
    assert_eq!(report.batches, 2);
    assert_same_state(&primary, &by_reopen)?;
    Ok(())
}

#[test]
fn unreachable_primary_is_retryable_and_leaves_state_alone() -> Result<()> {
    let primary = primary()?;
    write_through(&primary, 1, 3)?;
    let replica = secondary(&primary, "r1", 0)?;
    replica.try_catch_up_with_primary()?;
    primary.close()?;

    let err = replica.try_catch_up_with_primary().map(|_| ());
    let Err(err) = err else {
        panic!("catch-up against a closed primary succeeded");
    };
    assert!(matches!(err, TesseraError::PrimaryUnreachable(_)));
    assert!(err.is_retryable());
    assert_eq!(replica.state(), PartitionState::Serving);
    assert_eq!(replica.watermark(), SnapshotId(3));
    Ok(())
}

#[test]
fn partition_without_primary_cannot_catch_up() -> Result<()> {
    let partition = Partition::open(PartitionOptions::in_memory(PartitionId(0)))?;
    assert!(matches!(
        partition.try_catch_up_with_primary(),
        Err(TesseraError::Invalid(_))
    ));
    assert!(matches!(partition.reopen_secondary(), Err(TesseraError::Invalid(_))));
    Ok(())
}
