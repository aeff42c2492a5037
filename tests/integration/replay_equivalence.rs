#![allow(missing_docs)]

use std::sync::Arc;

use proptest::prelude::*;
use tessera::operation::{
    DataType, EdgeKindSpec, Operation, OperationBatch, Properties, PropertySpec, PropertyValue,
};
use tessera::partition::{EngineKind, GraphPartition, Partition, PartitionOptions};
use tessera::primitives::io::{MemBlobStore, MemFileIo};
use tessera::primitives::wal::WalSyncMode;
use tessera::types::{PartitionId, SnapshotId, TesseraError};

#[derive(Debug, Clone)]
enum Step {
    Overwrite { id: i64, age: i32 },
    Update { id: i64, age: Option<i32> },
    Delete { id: i64 },
    ClearAge { id: i64 },
    Link { src: i64, dst: i64, weight: i64 },
    Unlink { src: i64, dst: i64 },
    AddColumn,
    Invalid { id: i64 },
}

#[derive(Debug, Clone)]
enum Action {
    Batch(Vec<Step>),
    Gc { behind: u64 },
}

fn arb_step() -> impl Strategy<Value = Step> {
    let id = 0i64..6;
    prop_oneof![
        4 => (id.clone(), any::<i32>()).prop_map(|(id, age)| Step::Overwrite { id, age }),
        3 => (id.clone(), proptest::option::of(any::<i32>()))
            .prop_map(|(id, age)| Step::Update { id, age }),
        2 => id.clone().prop_map(|id| Step::Delete { id }),
        1 => id.clone().prop_map(|id| Step::ClearAge { id }),
        3 => (id.clone(), id.clone(), any::<i64>())
            .prop_map(|(src, dst, weight)| Step::Link { src, dst, weight }),
        1 => (id.clone(), id.clone()).prop_map(|(src, dst)| Step::Unlink { src, dst }),
        1 => Just(Step::AddColumn),
        1 => id.prop_map(|id| Step::Invalid { id }),
    ]
}

fn arb_action() -> impl Strategy<Value = Action> {
    prop_oneof![
        8 => prop::collection::vec(arb_step(), 1..5).prop_map(Action::Batch),
        1 => (0u64..4).prop_map(|behind| Action::Gc { behind }),
    ]
}

fn knows() -> EdgeKindSpec {
    EdgeKindSpec::new("knows", "person", "person")
}

fn pk(id: i64) -> Properties {
    vec![("id".into(), PropertyValue::Long(id))]
}

fn schema_batch() -> OperationBatch {
    let ops = vec![
        Operation::create_vertex_type(
            "person",
            vec![
                PropertySpec::primary_key("id", DataType::Long),
                PropertySpec::new("age", DataType::Int).with_default(PropertyValue::Int(0)),
            ],
        )
        .unwrap(),
        Operation::create_edge_type("knows", vec![PropertySpec::new("weight", DataType::Long)])
            .unwrap(),
        Operation::add_edge_kind(knows()).unwrap(),
    ];
    OperationBatch::new(SnapshotId(1), "schema", ops)
}

/// `index` is the step's position in its batch, so columns added by one
/// batch get distinct names.
fn to_operation(step: &Step, snapshot: SnapshotId, index: usize) -> Operation {
    match step {
        Step::Overwrite { id, age } => Operation::overwrite_vertex(
            "person",
            pk(*id),
            vec![("age".into(), PropertyValue::Int(*age))],
        ),
        Step::Update { id, age } => Operation::update_vertex(
            "person",
            pk(*id),
            vec![(
                "age".into(),
                age.map(PropertyValue::Int).unwrap_or(PropertyValue::Null),
            )],
        ),
        Step::Delete { id } => Operation::delete_vertex("person", pk(*id)),
        Step::ClearAge { id } => {
            Operation::clear_vertex_properties("person", pk(*id), vec!["age".into()])
        }
        Step::Link { src, dst, weight } => Operation::overwrite_edge(
            knows(),
            pk(*src),
            pk(*dst),
            vec![("weight".into(), PropertyValue::Long(*weight))],
        ),
        Step::Unlink { src, dst } => Operation::delete_edge(knows(), pk(*src), pk(*dst)),
        Step::AddColumn => Operation::add_vertex_type_properties(
            "person",
            vec![PropertySpec::new(format!("c{}_{index}", snapshot.0), DataType::String)],
        ),
        Step::Invalid { id } => Operation::overwrite_vertex(
            "person",
            pk(*id),
            vec![("age".into(), PropertyValue::from("not a number"))],
        ),
    }
    .unwrap()
}

fn open(log: &MemFileIo, blobs: &MemBlobStore) -> Partition {
    Partition::open(
        PartitionOptions::new(
            PartitionId(0),
            EngineKind::Custom {
                log: Arc::new(log.clone()),
                blobs: Arc::new(blobs.clone()),
            },
        )
        .sync_mode(WalSyncMode::Off)
        .scan_chunk_rows(3),
    )
    .unwrap()
}

#[test]
fn one_batch_can_add_several_columns_and_recover_them() {
    let log = MemFileIo::new();
    let blobs = MemBlobStore::new();
    let live = open(&log, &blobs);
    live.write_batch(SnapshotId(1), &schema_batch()).unwrap();

    let two = SnapshotId(2);
    let ops = (0..2).map(|index| to_operation(&Step::AddColumn, two, index)).collect();
    live.write_batch(two, &OperationBatch::new(two, "columns", ops)).unwrap();

    let three = SnapshotId(3);
    let same_name = vec![
        to_operation(&Step::AddColumn, three, 0),
        to_operation(&Step::AddColumn, three, 0),
    ];
    assert!(matches!(
        live.write_batch(three, &OperationBatch::new(three, "dup", same_name)),
        Err(TesseraError::MalformedOperation(_))
    ));
    assert_eq!(live.watermark(), two);

    let blob = live.graph_def_blob().unwrap();
    drop(live);
    let recovered = open(&log, &blobs);
    assert_eq!(recovered.watermark(), two);
    assert_eq!(recovered.graph_def_blob().unwrap(), blob);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_recovery_reproduces_live_state(actions in prop::collection::vec(arb_action(), 1..30)) {
        let log = MemFileIo::new();
        let blobs = MemBlobStore::new();
        let live = open(&log, &blobs);
        live.write_batch(SnapshotId(1), &schema_batch()).unwrap();

        for action in &actions {
            match action {
                Action::Batch(steps) => {
                    let snapshot = live.watermark().next();
                    let ops = steps
                        .iter()
                        .enumerate()
                        .map(|(index, s)| to_operation(s, snapshot, index))
                        .collect();
                    let batch = OperationBatch::new(snapshot, "prop", ops);
                    let expect_failure = steps.iter().any(|s| matches!(s, Step::Invalid { .. }));
                    let result = live.write_batch(snapshot, &batch);
                    prop_assert_eq!(result.is_err(), expect_failure);
                    if expect_failure {
                        prop_assert_eq!(live.watermark().next(), snapshot);
                    }
                }
                Action::Gc { behind } => {
                    let requested = SnapshotId(live.watermark().0.saturating_sub(*behind));
                    let report = live.garbage_collect(requested).unwrap();
                    prop_assert!(report.horizon <= requested);
                }
            }
        }

        let watermark = live.watermark();
        let schema = live.graph_def_blob().unwrap();
        let vertices = live.reader().scan_vertices("person").unwrap();
        let edges = live.reader().scan_edges(&knows()).unwrap();
        live.close().unwrap();

        let recovered = open(&log, &blobs);
        prop_assert_eq!(recovered.watermark(), watermark);
        prop_assert_eq!(recovered.graph_def_blob().unwrap(), schema);
        prop_assert_eq!(recovered.reader().scan_vertices("person").unwrap(), vertices);
        prop_assert_eq!(recovered.reader().scan_edges(&knows()).unwrap(), edges);
    }
}
