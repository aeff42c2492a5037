use std::path::Path;
use std::sync::Arc;

use serde::Serialize;

use crate::admin::error::AdminError;
use crate::admin::Result;
use crate::oplog::OperationLog;
use crate::operation::OperationBatch;
use crate::primitives::io::StdFileIo;
use crate::primitives::wal::WalOptions;

const MAX_FINDINGS: usize = 32;

/// One logged batch.
#[derive(Clone, Debug, Serialize)]
pub struct LogRecordSummary {
    pub snapshot: u64,
    pub offset: u64,
    pub appended_at_ms: u64,
    pub ops: usize,
    pub ddl: bool,
    pub trace_id: String,
    /// Operation type names, in batch order.
    pub op_types: Vec<&'static str>,
}

/// Contents of a log file.
#[derive(Clone, Debug, Serialize)]
pub struct LogDump {
    pub path: String,
    pub partition: u32,
    /// Snapshot the retained records start after.
    pub base: u64,
    pub tail: u64,
    /// Bytes past the last valid record.
    pub torn_tail_bytes: u64,
    pub records: Vec<LogRecordSummary>,
}

/// Severity of a verification finding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifySeverity {
    Warning,
    Error,
}

/// A single issue discovered during verification.
#[derive(Clone, Debug, Serialize)]
pub struct VerifyFinding {
    pub severity: VerifySeverity,
    pub message: String,
}

impl VerifyFinding {
    fn error(message: impl Into<String>) -> Self {
        Self {
            severity: VerifySeverity::Error,
            message: message.into(),
        }
    }

    fn warning(message: impl Into<String>) -> Self {
        Self {
            severity: VerifySeverity::Warning,
            message: message.into(),
        }
    }
}

/// Result of checking every record of a log file.
#[derive(Clone, Debug, Serialize)]
pub struct LogVerifyReport {
    pub path: String,
    /// No error findings.
    pub success: bool,
    pub partition: u32,
    pub base: u64,
    pub tail: u64,
    pub records: u64,
    pub operations: u64,
    pub findings: Vec<VerifyFinding>,
}

fn open_log(path: &Path) -> Result<OperationLog> {
    if !path.exists() {
        return Err(AdminError::missing_log(path));
    }
    let io = StdFileIo::open_read_only(path)?;
    Ok(OperationLog::open(Arc::new(io), WalOptions::read_only())?)
}

/// Lists every retained record without modifying the file.
pub fn dump_log(path: impl AsRef<Path>) -> Result<LogDump> {
    let path = path.as_ref();
    let log = open_log(path)?;
    let mut records = Vec::with_capacity(log.record_count());
    for record in log.records_from(log.base())? {
        let record = record?;
        let batch = OperationBatch::decode(&record.payload)?;
        records.push(LogRecordSummary {
            snapshot: record.snapshot.0,
            offset: record.offset.0,
            appended_at_ms: record.appended_at_ms,
            ops: batch.len(),
            ddl: batch.has_ddl(),
            trace_id: batch.trace_id().to_string(),
            op_types: batch.operations().iter().map(|op| op.op_type().name()).collect(),
        });
    }
    Ok(LogDump {
        path: path.display().to_string(),
        partition: log.partition().0,
        base: log.base().0,
        tail: log.tail().0,
        torn_tail_bytes: log.stats().torn_tail_bytes,
        records,
    })
}

/// Decodes every record and every operation payload.
///
/// Record framing and checksums are checked when the log opens; a torn
/// tail is reported as a warning since reopening the log repairs it.
pub fn verify_log(path: impl AsRef<Path>) -> Result<LogVerifyReport> {
    let path = path.as_ref();
    let log = open_log(path)?;
    let mut findings = Vec::new();
    let mut push = |finding: VerifyFinding| {
        if findings.len() < MAX_FINDINGS {
            findings.push(finding);
        }
    };
    let torn = log.stats().torn_tail_bytes;
    if torn > 0 {
        push(VerifyFinding::warning(format!(
            "{torn} bytes after the last valid record would be truncated on open"
        )));
    }
    let mut records = 0;
    let mut operations = 0;
    for record in log.records_from(log.base())? {
        let record = match record {
            Ok(record) => record,
            Err(err) => {
                push(VerifyFinding::error(format!("record read failed: {err}")));
                break;
            }
        };
        records += 1;
        let batch = match OperationBatch::decode(&record.payload) {
            Ok(batch) => batch,
            Err(err) => {
                push(VerifyFinding::error(format!(
                    "snapshot {}: batch does not decode: {err}",
                    record.snapshot
                )));
                continue;
            }
        };
        if batch.latest_snapshot_id() != record.snapshot {
            push(VerifyFinding::error(format!(
                "record for snapshot {} holds batch {}",
                record.snapshot,
                batch.latest_snapshot_id()
            )));
        }
        for (index, op) in batch.operations().iter().enumerate() {
            operations += 1;
            if let Err(err) = op.payload() {
                push(VerifyFinding::error(format!(
                    "snapshot {} op {index} ({}): {err}",
                    record.snapshot,
                    op.op_type()
                )));
            }
        }
    }
    let success = !findings
        .iter()
        .any(|f| f.severity == VerifySeverity::Error);
    Ok(LogVerifyReport {
        path: path.display().to_string(),
        success,
        partition: log.partition().0,
        base: log.base().0,
        tail: log.tail().0,
        records,
        operations,
        findings,
    })
}
