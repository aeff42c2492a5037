#![forbid(unsafe_code)]

//! Store administration: log inspection and verification, partition state
//! and compaction reports for the `tessera` CLI.

mod error;
mod log;
mod store;

/// Error types for administrative operations.
pub use error::{AdminError, Result};

/// Read-only inspection of operation log files.
pub use log::{
    dump_log, verify_log, LogDump, LogRecordSummary, LogVerifyReport, VerifyFinding,
    VerifySeverity,
};

/// Reports over a configured store.
pub use store::{
    commit, compact, ingest, parse_load_target, state, CommitReport, CompactReport, IngestEntry,
    IngestReport, StateReport,
};
