//! Binary entry point for the tessera administrative CLI.
#![forbid(unsafe_code)]

use std::error::Error;
use std::io::IsTerminal;
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tessera::admin::{
    commit, compact, dump_log, ingest, parse_load_target, state, verify_log, AdminError,
    CommitReport, CompactReport, IngestReport, LogDump, LogVerifyReport, StateReport,
};
use tessera::config::{default_config_path, StoreConfig};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "tessera",
    version,
    about = "Administrative CLI for tessera partition stores",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for structured responses"
    )]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the batches in an operation log file.
    DumpLog {
        #[arg(value_name = "LOG")]
        log_path: PathBuf,
    },
    /// Decode every record of an operation log file.
    VerifyLog {
        #[arg(value_name = "LOG")]
        log_path: PathBuf,
    },
    /// Recover every partition of a store and report its state.
    State {
        #[arg(long, env = "TESSERA_CONFIG", value_name = "FILE")]
        config: Option<PathBuf>,
    },
    /// Garbage-collect every partition up to its watermark.
    Compact {
        #[arg(long, env = "TESSERA_CONFIG", value_name = "FILE")]
        config: Option<PathBuf>,
    },
    /// Stage the bulk files of a prepared data load on every partition.
    Ingest {
        #[arg(long, env = "TESSERA_CONFIG", value_name = "FILE")]
        config: Option<PathBuf>,
        /// Directory the data path is resolved against.
        #[arg(long, value_name = "DIR")]
        root: PathBuf,
        /// Directory holding `part-NNNNN.tsbl` files, relative to the root.
        #[arg(value_name = "DATA_PATH")]
        data_path: String,
        /// Commit this load target once staging succeeds (LABEL or EDGE:SRC:DST).
        #[arg(long, value_name = "TARGET")]
        commit: Option<String>,
    },
    /// Make a staged data load visible at the next snapshot.
    Commit {
        #[arg(long, env = "TESSERA_CONFIG", value_name = "FILE")]
        config: Option<PathBuf>,
        /// Load target: a vertex LABEL or an EDGE:SRC:DST edge kind.
        #[arg(value_name = "TARGET")]
        target: String,
    },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

fn main() {
    init_tracing();
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tessera=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .init();
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    match cli.command {
        Command::DumpLog { log_path } => {
            let dump = dump_log(&log_path)?;
            emit(cli.format, &dump, || print_dump_text(&dump))?;
        }
        Command::VerifyLog { log_path } => {
            let report = verify_log(&log_path)?;
            emit(cli.format, &report, || print_verify_text(&report))?;
            if !report.success {
                std::process::exit(2);
            }
        }
        Command::State { config } => {
            let config = load_config(config)?;
            let report = state(&config)?;
            emit(cli.format, &report, || print_state_text(&report))?;
        }
        Command::Compact { config } => {
            let config = load_config(config)?;
            let report = compact(&config)?;
            emit(cli.format, &report, || print_compact_text(&report))?;
        }
        Command::Ingest {
            config,
            root,
            data_path,
            commit: target,
        } => {
            let target = target.as_deref().map(parse_load_target).transpose()?;
            let config = load_config(config)?;
            let report = ingest(&config, &root, &data_path)?;
            emit(cli.format, &report, || print_ingest_text(&report))?;
            if let Some(target) = target {
                let report = commit(&config, target)?;
                emit(cli.format, &report, || print_commit_text(&report))?;
            }
        }
        Command::Commit { config, target } => {
            let target = parse_load_target(&target)?;
            let config = load_config(config)?;
            let report = commit(&config, target)?;
            emit(cli.format, &report, || print_commit_text(&report))?;
        }
    }
    Ok(())
}

fn load_config(explicit: Option<PathBuf>) -> Result<StoreConfig, AdminError> {
    if let Some(path) = explicit {
        return StoreConfig::load(path);
    }
    match default_config_path() {
        Some(path) if path.exists() => StoreConfig::load(path),
        _ => Err(AdminError::Message(
            "no --config given and no tessera.toml in the config directory".into(),
        )),
    }
}

fn emit<T, F>(format: OutputFormat, value: &T, printer: F) -> Result<(), Box<dyn Error>>
where
    T: serde::Serialize,
    F: Fn(),
{
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{json}");
        }
        OutputFormat::Text => printer(),
    }
    Ok(())
}

fn print_dump_text(dump: &LogDump) {
    println!(
        "Log {} partition={} base={} tail={} records={}",
        dump.path,
        dump.partition,
        dump.base,
        dump.tail,
        dump.records.len()
    );
    if dump.torn_tail_bytes > 0 {
        println!("  torn tail: {} bytes", dump.torn_tail_bytes);
    }
    for record in &dump.records {
        println!(
            "  snapshot={} offset={} ops={} ddl={} trace_id={} [{}]",
            record.snapshot,
            record.offset,
            record.ops,
            record.ddl,
            record.trace_id,
            record.op_types.join(",")
        );
    }
}

fn print_verify_text(report: &LogVerifyReport) {
    println!(
        "Verify {} => success={} partition={} base={} tail={} records={} operations={}",
        report.path,
        report.success,
        report.partition,
        report.base,
        report.tail,
        report.records,
        report.operations
    );
    for finding in &report.findings {
        println!("- {:?}: {}", finding.severity, finding.message);
    }
}

fn print_state_text(report: &StateReport) {
    println!(
        "Store: data_dir={}",
        report.data_dir.as_deref().unwrap_or("(memory)")
    );
    for status in &report.partitions {
        println!(
            "  partition {}: role={:?} state={} watermark={} schema_version={} log=({}, {}] log_bytes={} keys={} usable={}/{}",
            status.id,
            status.role,
            status.state,
            status.watermark,
            status.schema_version,
            status.log_base,
            status.log_tail,
            status.log_bytes,
            status.store_keys,
            status.store_state.usable_space,
            status.store_state.total_space
        );
    }
}

fn print_compact_text(report: &CompactReport) {
    for gc in &report.partitions {
        println!(
            "Compacted horizon={} checkpoint={} versions_dropped={} keys_purged={} log_records_dropped={} load_files_dropped={}",
            gc.horizon,
            gc.checkpoint,
            gc.versions_dropped,
            gc.keys_purged,
            gc.log_records_dropped,
            gc.load_files_dropped
        );
    }
}

fn print_ingest_text(report: &IngestReport) {
    println!("Ingest {} files={}", report.data_path, report.partitions.len());
    for entry in &report.partitions {
        println!("  partition {}: {:?}", entry.partition, entry.outcome);
    }
}

fn print_commit_text(report: &CommitReport) {
    println!(
        "Committed {} table={} snapshot={}",
        report.target, report.table, report.snapshot
    );
}
