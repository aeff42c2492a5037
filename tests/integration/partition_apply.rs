#![allow(missing_docs)]

use std::collections::BTreeMap;

use tessera::operation::{
    DataType, EdgeKindSpec, Operation, OperationBatch, Properties, PropertySpec, PropertyValue,
};
use tessera::partition::{GraphPartition, Partition, PartitionOptions};
use tessera::schema::{GraphDef, TypeKind};
use tessera::types::{PartitionId, Result, SnapshotId, TesseraError};

fn open() -> Partition {
    Partition::open(PartitionOptions::in_memory(PartitionId(0))).expect("open partition")
}

fn pk(id: i64) -> Properties {
    vec![("id".into(), PropertyValue::Long(id))]
}

fn person_type() -> Result<Operation> {
    Operation::create_vertex_type(
        "person",
        vec![
            PropertySpec::primary_key("id", DataType::Long),
            PropertySpec::new("name", DataType::String),
            PropertySpec::new("age", DataType::Int).with_default(PropertyValue::Int(0)),
        ],
    )
}

fn knows() -> EdgeKindSpec {
    EdgeKindSpec::new("knows", "person", "person")
}

fn apply(partition: &Partition, snapshot: u64, ops: Vec<Operation>) -> Result<bool> {
    let batch = OperationBatch::new(SnapshotId(snapshot), format!("trace-{snapshot}"), ops);
    partition.write_batch(SnapshotId(snapshot), &batch)
}

fn vertex(partition: &Partition, id: i64) -> Result<Option<BTreeMap<String, PropertyValue>>> {
    Ok(partition
        .reader()
        .get_vertex("person", &pk(id))?
        .map(|v| v.properties))
}

#[test]
fn ddl_then_dml_in_the_same_batch_applies_in_order() -> Result<()> {
    let partition = open();
    let has_ddl = apply(
        &partition,
        1,
        vec![
            person_type()?,
            Operation::overwrite_vertex("person", pk(1), vec![("name".into(), "ada".into())])?,
        ],
    )?;
    assert!(has_ddl);
    assert_eq!(partition.watermark(), SnapshotId(1));
    let row = vertex(&partition, 1)?.expect("vertex written");
    assert_eq!(row["name"], PropertyValue::from("ada"));
    assert_eq!(row["age"], PropertyValue::Int(0));
    Ok(())
}

#[test]
fn dml_before_its_ddl_is_rejected_with_unknown_label() -> Result<()> {
    let partition = open();
    let dml = Operation::overwrite_vertex("person", pk(1), vec![])?;
    let err = apply(&partition, 1, vec![dml.clone()]).unwrap_err();
    assert!(matches!(err, TesseraError::UnknownLabel(ref l) if l == "person"));
    assert_eq!(partition.watermark(), SnapshotId::ZERO);

    assert!(apply(&partition, 1, vec![person_type()?])?);
    assert!(!apply(&partition, 2, vec![dml])?);
    assert!(vertex(&partition, 1)?.is_some());
    Ok(())
}

#[test]
fn resubmitting_an_applied_batch_is_a_no_op() -> Result<()> {
    let partition = open();
    apply(&partition, 1, vec![person_type()?])?;
    let write = vec![Operation::overwrite_vertex(
        "person",
        pk(1),
        vec![("name".into(), "ada".into())],
    )?];
    apply(&partition, 2, write)?;
    let before = partition.graph_def_blob()?;

    // Same snapshot, different content: still a no-op.
    let replay = vec![Operation::overwrite_vertex(
        "person",
        pk(1),
        vec![("name".into(), "changed".into())],
    )?];
    assert!(!apply(&partition, 2, replay)?);
    assert!(apply(&partition, 1, vec![person_type()?])?);

    assert_eq!(partition.watermark(), SnapshotId(2));
    assert_eq!(partition.graph_def_blob()?, before);
    assert_eq!(
        vertex(&partition, 1)?.map(|row| row["name"].clone()),
        Some(PropertyValue::from("ada"))
    );
    assert_eq!(partition.replay_records(Default::default(), 0)?.len(), 2);
    Ok(())
}

#[test]
fn gaps_in_the_snapshot_sequence_are_rejected() -> Result<()> {
    let partition = open();
    apply(&partition, 1, vec![person_type()?])?;
    let err = apply(&partition, 3, vec![Operation::marker()]).unwrap_err();
    assert!(matches!(
        err,
        TesseraError::OutOfOrderSnapshot { expected, got }
            if expected == SnapshotId(2) && got == SnapshotId(3)
    ));
    assert_eq!(partition.watermark(), SnapshotId(1));
    apply(&partition, 2, vec![Operation::marker()])?;
    Ok(())
}

#[test]
fn a_failing_operation_leaves_no_trace_of_the_batch() -> Result<()> {
    let partition = open();
    apply(&partition, 1, vec![person_type()?])?;
    let schema_before = partition.graph_def_blob()?;

    let err = apply(
        &partition,
        2,
        vec![
            Operation::create_vertex_type(
                "dog",
                vec![PropertySpec::primary_key("id", DataType::Long)],
            )?,
            Operation::overwrite_vertex("person", pk(1), vec![("name".into(), "ada".into())])?,
            Operation::overwrite_vertex("person", pk(2), vec![("age".into(), "old".into())])?,
        ],
    )
    .unwrap_err();
    assert!(matches!(err, TesseraError::MalformedOperation(_)));

    assert_eq!(partition.watermark(), SnapshotId(1));
    assert_eq!(partition.graph_def_blob()?, schema_before);
    assert!(partition.graph_def().type_by_label("dog").is_none());
    assert!(vertex(&partition, 1)?.is_none());
    assert_eq!(partition.replay_records(Default::default(), 0)?, vec![SnapshotId(1)]);
    Ok(())
}

#[test]
fn dropping_a_type_without_edge_kinds_then_writing_it_fails() -> Result<()> {
    let partition = open();
    apply(&partition, 1, vec![person_type()?])?;
    apply(&partition, 2, vec![Operation::overwrite_vertex("person", pk(1), vec![])?])?;
    assert!(apply(&partition, 3, vec![Operation::drop_vertex_type("person")?])?);
    let err = apply(
        &partition,
        4,
        vec![Operation::overwrite_vertex("person", pk(2), vec![])?],
    )
    .unwrap_err();
    assert!(matches!(err, TesseraError::UnknownLabel(_)));
    assert_eq!(partition.watermark(), SnapshotId(3));
    Ok(())
}

#[test]
fn vertex_type_referenced_by_an_edge_kind_cannot_be_dropped() -> Result<()> {
    let partition = open();
    apply(
        &partition,
        1,
        vec![
            person_type()?,
            Operation::create_edge_type("knows", vec![PropertySpec::new("since", DataType::Int)])?,
            Operation::add_edge_kind(knows())?,
        ],
    )?;
    let err = apply(&partition, 2, vec![Operation::drop_vertex_type("person")?]).unwrap_err();
    assert!(matches!(err, TesseraError::EdgeKindInUse(_)));

    apply(
        &partition,
        2,
        vec![
            Operation::remove_edge_kind(knows())?,
            Operation::drop_vertex_type("person")?,
        ],
    )?;
    assert!(partition.graph_def().type_by_label("person").is_none());
    Ok(())
}

#[test]
fn a_recreated_label_gets_a_fresh_label_id() -> Result<()> {
    let partition = open();
    apply(&partition, 1, vec![person_type()?])?;
    apply(&partition, 2, vec![Operation::overwrite_vertex("person", pk(1), vec![])?])?;
    let old = partition.graph_def().expect_type("person", TypeKind::Vertex)?.label_id();
    apply(
        &partition,
        3,
        vec![Operation::drop_vertex_type("person")?, person_type()?],
    )?;
    let def = partition.graph_def();
    let new = def.expect_type("person", TypeKind::Vertex)?.label_id();
    assert_ne!(old, new);
    assert!(def.retired_labels().contains_key(&old));
    // Rows of the dropped type do not show through the new one.
    assert!(vertex(&partition, 1)?.is_none());
    Ok(())
}

#[test]
fn update_merges_null_removes_and_clear_drops_properties() -> Result<()> {
    let partition = open();
    apply(&partition, 1, vec![person_type()?])?;
    apply(
        &partition,
        2,
        vec![Operation::overwrite_vertex(
            "person",
            pk(1),
            vec![("name".into(), "ada".into()), ("age".into(), PropertyValue::Int(36))],
        )?],
    )?;
    apply(
        &partition,
        3,
        vec![Operation::update_vertex(
            "person",
            pk(1),
            vec![("name".into(), PropertyValue::Null)],
        )?],
    )?;
    let row = vertex(&partition, 1)?.expect("vertex");
    assert!(!row.contains_key("name"));
    assert_eq!(row["age"], PropertyValue::Int(36));

    apply(
        &partition,
        4,
        vec![Operation::clear_vertex_properties("person", pk(1), vec!["age".into()])?],
    )?;
    let row = vertex(&partition, 1)?.expect("vertex");
    assert_eq!(row.keys().collect::<Vec<_>>(), vec!["id"]);

    let err = apply(
        &partition,
        5,
        vec![Operation::clear_vertex_properties("person", pk(1), vec!["id".into()])?],
    )
    .unwrap_err();
    assert!(matches!(err, TesseraError::MalformedOperation(_)));

    apply(&partition, 5, vec![Operation::delete_vertex("person", pk(1))?])?;
    assert!(vertex(&partition, 1)?.is_none());
    Ok(())
}

#[test]
fn edges_are_keyed_by_kind_and_endpoints() -> Result<()> {
    let partition = open();
    apply(
        &partition,
        1,
        vec![
            person_type()?,
            Operation::create_edge_type("knows", vec![PropertySpec::new("since", DataType::Int)])?,
            Operation::add_edge_kind(knows())?,
            Operation::overwrite_vertex("person", pk(1), vec![])?,
            Operation::overwrite_vertex("person", pk(2), vec![])?,
            Operation::overwrite_edge(knows(), pk(1), pk(2), vec![("since".into(), 2001.into())])?,
        ],
    )?;
    let reader = partition.reader();
    let edge = reader.get_edge(&knows(), &pk(1), &pk(2))?.expect("edge");
    assert_eq!(edge.src_pk, vec![PropertyValue::Long(1)]);
    assert_eq!(edge.properties["since"], PropertyValue::Int(2001));
    assert!(reader.get_edge(&knows(), &pk(2), &pk(1))?.is_none());

    apply(
        &partition,
        2,
        vec![Operation::update_edge(knows(), pk(1), pk(2), vec![("since".into(), 1999.into())])?],
    )?;
    let edges = partition.reader().scan_edges(&knows())?;
    assert_eq!(edges.len(), 1);
    assert_eq!(edges[0].properties["since"], PropertyValue::Int(1999));

    apply(&partition, 3, vec![Operation::delete_edge(knows(), pk(1), pk(2))?])?;
    assert!(partition.reader().scan_edges(&knows())?.is_empty());

    let unknown = EdgeKindSpec::new("knows", "person", "robot");
    let err = apply(
        &partition,
        4,
        vec![Operation::overwrite_edge(unknown, pk(1), pk(2), vec![])?],
    )
    .unwrap_err();
    assert!(matches!(err, TesseraError::UnknownLabel(_)));
    Ok(())
}

#[test]
fn added_properties_are_ddl_and_usable_in_the_same_batch() -> Result<()> {
    let partition = open();
    apply(&partition, 1, vec![person_type()?])?;
    let version = partition.graph_def().version();
    let has_ddl = apply(
        &partition,
        2,
        vec![
            Operation::add_vertex_type_properties(
                "person",
                vec![PropertySpec::new("email", DataType::String)],
            )?,
            Operation::overwrite_vertex("person", pk(7), vec![("email".into(), "a@b".into())])?,
        ],
    )?;
    assert!(has_ddl);
    assert_eq!(partition.graph_def().version(), version + 1);
    let row = vertex(&partition, 7)?.expect("vertex");
    assert_eq!(row["email"], PropertyValue::from("a@b"));
    Ok(())
}

#[test]
fn schema_blob_round_trips_and_check_batch_does_not_apply() -> Result<()> {
    let partition = open();
    let batch = OperationBatch::new(SnapshotId(1), "t", vec![person_type()?]);
    partition.check_batch(&batch)?;
    assert_eq!(partition.watermark(), SnapshotId::ZERO);
    assert!(partition.graph_def().type_by_label("person").is_none());

    partition.write_batch(SnapshotId(1), &batch)?;
    let def = GraphDef::from_blob(&partition.graph_def_blob()?)?;
    assert_eq!(def, *partition.graph_def());
    assert!(def.type_by_label("person").is_some());
    Ok(())
}
