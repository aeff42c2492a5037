#![allow(missing_docs)]

use std::sync::Arc;
use std::thread;

use tessera::operation::{DataType, Operation, OperationBatch, Properties, PropertySpec, PropertyValue};
use tessera::partition::{EngineKind, GraphPartition, Partition, PartitionOptions};
use tessera::primitives::io::{MemBlobStore, MemFileIo};
use tessera::primitives::wal::WalSyncMode;
use tessera::types::{BackupId, LogOffset, PartitionId, Result, SnapshotId, TesseraError};

fn open() -> Result<Partition> {
    Partition::open(PartitionOptions::in_memory(PartitionId(0)).scan_chunk_rows(4))
}

/// Opens partition 0 over shared in-memory files so it can be reopened.
fn open_on(log: &MemFileIo, blobs: &MemBlobStore) -> Result<Partition> {
    Partition::open(
        PartitionOptions::new(
            PartitionId(0),
            EngineKind::Custom {
                log: Arc::new(log.clone()),
                blobs: Arc::new(blobs.clone()),
            },
        )
        .sync_mode(WalSyncMode::Off),
    )
}

fn snapshots(from: u64, to: u64) -> Vec<SnapshotId> {
    (from..=to).map(SnapshotId).collect()
}

fn pk(id: i64) -> Properties {
    vec![("id".into(), PropertyValue::Long(id))]
}

/// Batch 1 creates the type; batch `s > 1` inserts vertex `s - 1`, so a
/// consistent image at snapshot `s` holds exactly `s - 1` vertices.
fn batch(snapshot: u64) -> Result<OperationBatch> {
    let op = if snapshot == 1 {
        Operation::create_vertex_type(
            "event",
            vec![
                PropertySpec::primary_key("id", DataType::Long),
                PropertySpec::new("at", DataType::Long),
            ],
        )?
    } else {
        Operation::overwrite_vertex(
            "event",
            pk(snapshot as i64 - 1),
            vec![("at".into(), PropertyValue::Long(snapshot as i64))],
        )?
    };
    Ok(OperationBatch::new(SnapshotId(snapshot), "backup-test", vec![op]))
}

fn write_through(partition: &Partition, from: u64, to: u64) -> Result<()> {
    for s in from..=to {
        partition.write_batch(SnapshotId(s), &batch(s)?)?;
    }
    Ok(())
}

#[test]
fn restore_moves_the_watermark_back_and_accepts_resubmission() -> Result<()> {
    let partition = open()?;
    write_through(&partition, 1, 6)?;
    let info = partition.open_backup_engine().create_backup()?;
    assert_eq!(info.snapshot_id, SnapshotId(6));
    assert_eq!(info.global_backup_id, BackupId(1));
    write_through(&partition, 7, 10)?;

    partition.open_backup_engine().restore(&info)?;
    assert_eq!(partition.watermark(), SnapshotId(6));
    assert_eq!(partition.reader().count_vertices("event")?, 5);
    assert!(partition.reader().get_vertex("event", &pk(8))?.is_none());

    assert!(matches!(
        partition.write_batch(SnapshotId(8), &batch(8)?),
        Err(TesseraError::OutOfOrderSnapshot { .. })
    ));
    write_through(&partition, 7, 10)?;
    assert_eq!(partition.reader().count_vertices("event")?, 9);
    Ok(())
}

#[test]
fn restore_keeps_later_batches_for_replay() -> Result<()> {
    let partition = open()?;
    write_through(&partition, 1, 6)?;
    let info = partition.open_backup_engine().create_backup()?;
    write_through(&partition, 7, 10)?;

    let engine = partition.open_backup_engine();
    engine.restore(&info)?;
    assert_eq!(partition.watermark(), SnapshotId(6));
    assert_eq!(partition.reader().count_vertices("event")?, 5);
    assert_eq!(partition.replay_records(LogOffset(0), 0)?, snapshots(1, 10));

    assert_eq!(engine.replay_after(&info)?, 4);
    assert_eq!(partition.watermark(), SnapshotId(10));
    assert_eq!(partition.reader().count_vertices("event")?, 9);
    assert_eq!(engine.replay_after(&info)?, 0);
    write_through(&partition, 11, 11)?;
    Ok(())
}

#[test]
fn replay_refuses_an_offset_past_the_restored_point() -> Result<()> {
    let partition = open()?;
    write_through(&partition, 1, 4)?;
    let early = partition.open_backup_engine().create_backup()?;
    write_through(&partition, 5, 6)?;
    let late = partition.open_backup_engine().create_backup()?;
    write_through(&partition, 7, 8)?;

    let engine = partition.open_backup_engine();
    engine.restore(&early)?;
    assert!(matches!(engine.replay_after(&late), Err(TesseraError::InvalidOwned(_))));
    assert_eq!(partition.watermark(), SnapshotId(4));
    assert_eq!(engine.replay_after(&early)?, 4);
    Ok(())
}

#[test]
fn new_batch_after_restore_replaces_the_kept_ones() -> Result<()> {
    let (log, blobs) = (MemFileIo::new(), MemBlobStore::new());
    let partition = open_on(&log, &blobs)?;
    write_through(&partition, 1, 6)?;
    let info = partition.open_backup_engine().create_backup()?;
    write_through(&partition, 7, 10)?;
    partition.open_backup_engine().restore(&info)?;

    let replacement = Operation::delete_vertex("event", pk(1))?;
    partition.write_batch(
        SnapshotId(7),
        &OperationBatch::new(SnapshotId(7), "after-restore", vec![replacement]),
    )?;
    assert_eq!(partition.replay_records(LogOffset(0), 0)?, snapshots(1, 7));
    assert_eq!(partition.open_backup_engine().replay_after(&info)?, 0);
    partition.close()?;

    let reopened = open_on(&log, &blobs)?;
    assert_eq!(reopened.watermark(), SnapshotId(7));
    assert_eq!(reopened.reader().count_vertices("event")?, 4);
    assert!(reopened.reader().get_vertex("event", &pk(6))?.is_none());
    Ok(())
}

#[test]
fn reopening_after_restore_stays_at_the_backup() -> Result<()> {
    let (log, blobs) = (MemFileIo::new(), MemBlobStore::new());
    let partition = open_on(&log, &blobs)?;
    write_through(&partition, 1, 6)?;
    let info = partition.open_backup_engine().create_backup()?;
    write_through(&partition, 7, 10)?;
    partition.open_backup_engine().restore(&info)?;
    partition.close()?;

    let reopened = open_on(&log, &blobs)?;
    assert_eq!(reopened.watermark(), SnapshotId(6));
    assert_eq!(reopened.reader().count_vertices("event")?, 5);
    assert_eq!(reopened.open_backup_engine().replay_after(&info)?, 4);
    reopened.close()?;

    let current = open_on(&log, &blobs)?;
    assert_eq!(current.watermark(), SnapshotId(10));
    assert_eq!(current.reader().count_vertices("event")?, 9);
    Ok(())
}

#[test]
fn backups_are_listed_verified_and_purged() -> Result<()> {
    let partition = open()?;
    write_through(&partition, 1, 2)?;
    let engine = partition.open_backup_engine();
    let first = engine.create_backup()?;
    write_through(&partition, 3, 4)?;
    let second = engine.create_backup()?;
    let third = engine.create_backup()?;
    assert_eq!(
        [first.global_backup_id, second.global_backup_id, third.global_backup_id],
        [BackupId(1), BackupId(2), BackupId(3)]
    );
    engine.verify(&second)?;
    assert_eq!(engine.list()?, vec![first.clone(), second.clone(), third]);

    assert_eq!(engine.retain_latest(2)?, vec![BackupId(1)]);
    assert!(matches!(engine.restore(&first), Err(TesseraError::NotFound)));
    assert!(engine.purge(BackupId(2))?);
    assert!(!engine.purge(BackupId(2))?);
    assert_eq!(engine.list()?.len(), 1);
    Ok(())
}

#[test]
fn backup_image_is_portable_to_a_fresh_replica() -> Result<()> {
    let source = open()?;
    write_through(&source, 1, 5)?;
    let info = source.open_backup_engine().create_backup()?;
    let image = source.open_backup_engine().export(&info)?;

    let target = open()?;
    target.open_backup_engine().restore_image(&info, &image)?;
    assert_eq!(target.watermark(), SnapshotId(5));
    assert_eq!(target.graph_def_blob()?, source.graph_def_blob()?);
    assert_eq!(
        target.reader().scan_vertices("event")?,
        source.reader().scan_vertices("event")?
    );

    let other = Partition::open(PartitionOptions::in_memory(PartitionId(3)))?;
    assert!(other.open_backup_engine().restore_image(&info, &image).is_err());
    Ok(())
}

#[test]
fn concurrent_backups_capture_whole_batches() -> Result<()> {
    let partition = Arc::new(open()?);
    write_through(&partition, 1, 1)?;
    let last = 200u64;

    let infos = thread::scope(|scope| -> Result<Vec<_>> {
        let writer = Arc::clone(&partition);
        let handle = scope.spawn(move || write_through(&writer, 2, last));
        let mut infos = Vec::new();
        for _ in 0..8 {
            infos.push(partition.open_backup_engine().create_backup()?);
            thread::yield_now();
        }
        handle
            .join()
            .map_err(|_| TesseraError::Invalid("writer thread panicked"))??;
        Ok(infos)
    })?;
    assert_eq!(partition.watermark(), SnapshotId(last));

    for info in infos {
        let replica = open()?;
        replica.open_backup_engine().restore_image(
            &info,
            &partition.open_backup_engine().export(&info)?,
        )?;
        let expected = info.snapshot_id.0.saturating_sub(1) as usize;
        assert_eq!(replica.reader().count_vertices("event")?, expected);
    }
    Ok(())
}

#[test]
fn gc_keeps_versions_a_pinned_backup_needs() -> Result<()> {
    let partition = open()?;
    write_through(&partition, 1, 4)?;
    let (pin, _) = partition.pin_view();
    let pinned_reader = partition.reader();
    assert_eq!(pin.snapshot(), SnapshotId(4));
    write_through(&partition, 5, 9)?;

    let report = partition.garbage_collect(SnapshotId(9))?;
    assert_eq!(report.horizon, SnapshotId(4));
    assert_eq!(pinned_reader.count_vertices("event")?, 3);
    drop(pin);
    assert_eq!(partition.garbage_collect(SnapshotId(9))?.horizon, SnapshotId(4));
    drop(pinned_reader);

    let report = partition.garbage_collect(SnapshotId(9))?;
    assert_eq!(report.horizon, SnapshotId(9));
    assert_eq!(partition.reader().count_vertices("event")?, 8);
    Ok(())
}

#[test]
fn restore_survives_gc_of_everything_before_it() -> Result<()> {
    let partition = open()?;
    write_through(&partition, 1, 3)?;
    let info = partition.open_backup_engine().create_backup()?;
    write_through(&partition, 4, 7)?;
    partition.garbage_collect(SnapshotId(7))?;

    partition.open_backup_engine().restore(&info)?;
    assert_eq!(partition.watermark(), SnapshotId(3));
    assert_eq!(partition.reader().count_vertices("event")?, 2);
    write_through(&partition, 4, 4)?;
    Ok(())
}
