#![allow(missing_docs)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use assert_cmd::cargo::cargo_bin_cmd;
use serde_json::Value;
use tempfile::TempDir;
use tessera::config::StoreConfig;
use tessera::operation::{DataType, LoadTarget, Operation, PropertySpec, PropertyValue};
use tessera::primitives::io::StdFileIo;
use tessera::primitives::wal::{Wal, WalOptions, WalSyncMode};
use tessera::service::{ingest_file_path, StoreService};
use tessera::storage::{BulkFileWriter, BulkRow};
use tessera::types::{PartitionId, SnapshotId, TableId};

/// Store with two partitions and three applied snapshots; returns the
/// config file path.
fn seed_store(dir: &Path) -> PathBuf {
    let data_dir = dir.join("data");
    fs::create_dir_all(&data_dir).expect("data dir");
    let config_path = dir.join("tessera.toml");
    fs::write(
        &config_path,
        format!(
            "data_dir = {:?}\npartitions = 2\nsync_mode = \"off\"\n",
            data_dir.display().to_string()
        ),
    )
    .expect("write config");

    let config = StoreConfig::load(&config_path).expect("load config");
    let service = StoreService::open(&config).expect("open store");
    let coordinator = service.coordinator().expect("coordinator");
    coordinator
        .submit(
            vec![Operation::create_vertex_type(
                "city",
                vec![
                    PropertySpec::primary_key("name", DataType::String),
                    PropertySpec::new("population", DataType::Long),
                ],
            )
            .expect("ddl")],
            "schema",
        )
        .expect("submit schema");
    for (snapshot, city) in [(2, "Lyon"), (3, "Oslo")] {
        let op = Operation::overwrite_vertex(
            "city",
            vec![("name".into(), PropertyValue::from(city))],
            vec![("population".into(), PropertyValue::Long(500_000))],
        )
        .expect("dml");
        let receipt = coordinator.submit(vec![op], city).expect("submit");
        assert_eq!(receipt.snapshot, SnapshotId(snapshot));
    }
    service.close().expect("close");
    config_path
}

fn partition_log(dir: &Path, partition: u32) -> PathBuf {
    dir.join("data")
        .join(format!("partition-{partition:05}"))
        .join("oplog.wal")
}

fn json_output(args: &[&str], path: &Path) -> Value {
    let output = cargo_bin_cmd!("tessera")
        .args(["--format", "json"])
        .args(args)
        .arg(path)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    serde_json::from_slice(&output).expect("valid json")
}

#[test]
fn dump_log_lists_every_batch() {
    let dir = TempDir::new().expect("tempdir");
    seed_store(dir.path());
    let json = json_output(&["dump-log"], &partition_log(dir.path(), 0));
    assert_eq!(json["partition"], 0);
    assert_eq!(json["tail"], 3);
    let records = json["records"].as_array().expect("records");
    assert_eq!(records.len(), 3);
    assert_eq!(records[0]["ddl"], true);
    assert_eq!(records[0]["op_types"][0], "CREATE_VERTEX_TYPE");
    assert_eq!(records[1]["trace_id"], "Lyon");
}

#[test]
fn dump_log_text_mentions_snapshots() {
    let dir = TempDir::new().expect("tempdir");
    seed_store(dir.path());
    let output = cargo_bin_cmd!("tessera")
        .arg("dump-log")
        .arg(partition_log(dir.path(), 1))
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8_lossy(&output);
    assert!(text.contains("partition=1"));
    assert!(text.contains("snapshot=3"));
}

#[test]
fn verify_log_accepts_a_healthy_log_and_warns_on_a_torn_tail() {
    let dir = TempDir::new().expect("tempdir");
    seed_store(dir.path());
    let log = partition_log(dir.path(), 0);
    let json = json_output(&["verify-log"], &log);
    assert_eq!(json["success"], true);
    assert_eq!(json["records"], 3);

    let len = fs::metadata(&log).expect("metadata").len();
    fs::OpenOptions::new()
        .write(true)
        .open(&log)
        .expect("open log")
        .set_len(len - 3)
        .expect("truncate");
    let json = json_output(&["verify-log"], &log);
    assert_eq!(json["success"], true);
    assert_eq!(json["records"], 2);
    assert_eq!(json["findings"][0]["severity"], "warning");
    // Verification is read-only; the torn bytes are still there.
    assert_eq!(fs::metadata(&log).expect("metadata").len(), len - 3);
}

#[test]
fn verify_log_fails_on_undecodable_batches() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("bad.wal");
    {
        let io = StdFileIo::open(&path).expect("open file");
        let wal = Wal::open(Arc::new(io), WalOptions::new(PartitionId(4), WalSyncMode::Off))
            .expect("open wal");
        wal.append(SnapshotId(1), b"not an operation batch").expect("append");
    }
    let output = cargo_bin_cmd!("tessera")
        .args(["--format", "json", "verify-log"])
        .arg(&path)
        .assert()
        .code(2)
        .get_output()
        .stdout
        .clone();
    let json: Value = serde_json::from_slice(&output).expect("valid json");
    assert_eq!(json["success"], false);
    assert_eq!(json["partition"], 4);
    assert_eq!(json["findings"][0]["severity"], "error");
}

#[test]
fn missing_log_is_an_error() {
    let dir = TempDir::new().expect("tempdir");
    let output = cargo_bin_cmd!("tessera")
        .arg("dump-log")
        .arg(dir.path().join("absent.wal"))
        .assert()
        .code(1)
        .get_output()
        .stderr
        .clone();
    assert!(String::from_utf8_lossy(&output).contains("error:"));
}

#[test]
fn state_reports_every_partition() {
    let dir = TempDir::new().expect("tempdir");
    let config = seed_store(dir.path());
    let json = json_output(&["state", "--config"], &config);
    let partitions = json["partitions"].as_array().expect("partitions");
    assert_eq!(partitions.len(), 2);
    for partition in partitions {
        assert_eq!(partition["watermark"], 3);
        assert_eq!(partition["log_tail"], 3);
    }
    assert!(json["store_state"]["0"]["usable_space"].is_number());
}

#[test]
fn state_reads_config_from_the_environment() {
    let dir = TempDir::new().expect("tempdir");
    let config = seed_store(dir.path());
    let output = cargo_bin_cmd!("tessera")
        .arg("state")
        .env("TESSERA_CONFIG", &config)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    assert!(String::from_utf8_lossy(&output).contains("watermark=3"));
}

#[test]
fn compact_truncates_logs_and_keeps_state() {
    let dir = TempDir::new().expect("tempdir");
    let config = seed_store(dir.path());
    let json = json_output(&["compact", "--config"], &config);
    let reports = json["partitions"].as_array().expect("partitions");
    assert_eq!(reports.len(), 2);
    for report in reports {
        assert_eq!(report["horizon"], 3);
        assert_eq!(report["log_records_dropped"], 3);
    }

    let dump = json_output(&["dump-log"], &partition_log(dir.path(), 0));
    assert_eq!(dump["base"], 3);
    assert!(dump["records"].as_array().expect("records").is_empty());

    let state = json_output(&["state", "--config"], &config);
    assert_eq!(state["partitions"][0]["watermark"], 3);
}

#[test]
fn state_without_data_dir_fails() {
    let dir = TempDir::new().expect("tempdir");
    let config = dir.path().join("tessera.toml");
    fs::write(
        &config,
        format!("data_dir = {:?}\n", dir.path().join("nowhere").display().to_string()),
    )
    .expect("write config");
    cargo_bin_cmd!("tessera")
        .args(["state", "--config"])
        .arg(&config)
        .assert()
        .code(1);
}

/// Prepares a load of `city` on the seeded store and writes partition 0's
/// bulk file under `<dir>/bulk/load`; returns the load table.
fn prepare_city_load(dir: &Path, config: &Path) -> TableId {
    let config = StoreConfig::load(config).expect("load config");
    let service = StoreService::open(&config).expect("open store");
    service
        .coordinator()
        .expect("coordinator")
        .submit(
            vec![Operation::prepare_data_load(LoadTarget::Vertex("city".into())).expect("ddl")],
            "prepare",
        )
        .expect("submit prepare");
    let table = service
        .partition(PartitionId(0))
        .expect("partition")
        .graph_def()
        .pending_load(&LoadTarget::Vertex("city".into()))
        .expect("pending load");
    service.close().expect("close");

    let path = dir.join("bulk").join(ingest_file_path("load", PartitionId(0)));
    fs::create_dir_all(path.parent().expect("parent")).expect("bulk dir");
    let mut writer =
        BulkFileWriter::new(table, LoadTarget::Vertex("city".into())).expect("writer");
    for city in ["Bergen", "Turin"] {
        writer
            .push(BulkRow::Vertex {
                pk: vec![("name".into(), PropertyValue::from(city))],
                properties: vec![("population".into(), PropertyValue::Long(250_000))],
            })
            .expect("push row");
    }
    writer.write_to(&path).expect("write bulk file");
    table
}

fn cities_on_partition_zero(config: &Path) -> usize {
    let config = StoreConfig::load(config).expect("load config");
    let service = StoreService::open(&config).expect("open store");
    let count = service
        .partition(PartitionId(0))
        .expect("partition")
        .reader()
        .count_vertices("city")
        .expect("count");
    service.close().expect("close");
    count
}

fn run_json(args: &[&str], config: &Path) -> Value {
    let output = cargo_bin_cmd!("tessera")
        .args(["--format", "json"])
        .args(args)
        .arg("--config")
        .arg(config)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    serde_json::from_slice(&output).expect("valid json")
}

#[test]
fn ingest_then_commit_makes_bulk_rows_visible() {
    let dir = TempDir::new().expect("tempdir");
    let config = seed_store(dir.path());
    let table = prepare_city_load(dir.path(), &config);
    let before = cities_on_partition_zero(&config);
    let root = dir.path().join("bulk");
    let root = root.to_str().expect("utf-8 path");

    let staged = run_json(&["ingest", "--root", root, "load"], &config);
    assert_eq!(staged["data_path"], "load");
    let partitions = staged["partitions"].as_array().expect("partitions");
    assert_eq!(partitions.len(), 1);
    assert_eq!(partitions[0]["partition"], 0);
    assert_eq!(partitions[0]["outcome"], "staged");
    assert_eq!(partitions[0]["rows"], 2);
    assert_eq!(cities_on_partition_zero(&config), before);

    let again = run_json(&["ingest", "--root", root, "load"], &config);
    assert_eq!(again["partitions"][0]["outcome"], "already_staged");

    let committed = run_json(&["commit", "city"], &config);
    assert_eq!(committed["target"], "city");
    assert_eq!(committed["table"], table.0);
    assert_eq!(committed["snapshot"], 5);
    assert_eq!(cities_on_partition_zero(&config), before + 2);
}

#[test]
fn commit_without_a_prepared_load_fails() {
    let dir = TempDir::new().expect("tempdir");
    let config = seed_store(dir.path());
    let output = cargo_bin_cmd!("tessera")
        .args(["commit", "city", "--config"])
        .arg(&config)
        .assert()
        .code(1)
        .get_output()
        .stderr
        .clone();
    assert!(String::from_utf8_lossy(&output).contains("no pending data load of city"));
}

#[test]
fn ingest_from_an_empty_directory_fails() {
    let dir = TempDir::new().expect("tempdir");
    let config = seed_store(dir.path());
    fs::create_dir_all(dir.path().join("bulk/load")).expect("empty dir");
    cargo_bin_cmd!("tessera")
        .args(["ingest", "--root"])
        .arg(dir.path().join("bulk"))
        .args(["load", "--config"])
        .arg(&config)
        .assert()
        .code(1);
}
