#![forbid(unsafe_code)]

//! Identifiers, the crate-wide error type and checksum helpers.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::partition::PartitionState;

pub mod checksum;

pub use checksum::crc32;

/// Globally ordered point in the mutation history.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, Serialize, Deserialize,
)]
pub struct SnapshotId(pub u64);

impl SnapshotId {
    /// The snapshot every partition starts at before the first batch.
    pub const ZERO: SnapshotId = SnapshotId(0);

    /// Returns the snapshot that immediately follows this one.
    pub fn next(self) -> SnapshotId {
        SnapshotId(self.0.saturating_add(1))
    }
}

/// Fixed identifier of a graph partition.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, Serialize, Deserialize,
)]
pub struct PartitionId(pub u32);

/// Numeric id allocated to a vertex or edge type label.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, Serialize, Deserialize,
)]
pub struct LabelId(pub u32);

/// Numeric id allocated to a property definition.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, Serialize, Deserialize,
)]
pub struct PropertyId(pub u32);

/// Table id allocated to edge kinds and data loads.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, Serialize, Deserialize,
)]
pub struct TableId(pub u64);

/// Identifier of a backup, local to a partition or global across partitions.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, Serialize, Deserialize,
)]
pub struct BackupId(pub u64);

/// Sequence number of a record in a partition's operation log.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, Serialize, Deserialize,
)]
pub struct LogOffset(pub u64);

macro_rules! display_inner {
    ($($ty:ty),*) => {
        $(
            impl fmt::Display for $ty {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, "{}", self.0)
                }
            }
        )*
    };
}

display_inner!(SnapshotId, PartitionId, LabelId, PropertyId, TableId, BackupId, LogOffset);

/// Errors produced by the partition write path.
#[derive(thiserror::Error, Debug)]
pub enum TesseraError {
    /// Underlying storage or log I/O failed.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// Persisted bytes failed validation.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// Caller supplied an invalid argument.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// Caller supplied an invalid argument (owned message).
    #[error("invalid argument: {0}")]
    InvalidOwned(String),
    /// Requested item does not exist.
    #[error("not found")]
    NotFound,
    /// A batch did not immediately follow the current tail.
    #[error("out of order snapshot: expected {expected}, got {got}")]
    OutOfOrderSnapshot {
        /// Snapshot the log or partition was waiting for.
        expected: SnapshotId,
        /// Snapshot that was submitted.
        got: SnapshotId,
    },
    /// A type with this label already exists.
    #[error("duplicate label: {0}")]
    DuplicateLabel(String),
    /// No type (or edge kind) with this label exists.
    #[error("unknown label: {0}")]
    UnknownLabel(String),
    /// A type cannot be dropped while edge kinds still reference it.
    #[error("edge kinds still reference {0}")]
    EdgeKindInUse(String),
    /// An operation payload could not be decoded or validated.
    #[error("malformed operation: {0}")]
    MalformedOperation(String),
    /// The primary replica could not be reached.
    #[error("primary unreachable: {0}")]
    PrimaryUnreachable(String),
    /// The primary no longer retains batches the caller needs.
    #[error("snapshot gap: need {needed}, oldest retained is {oldest}")]
    SnapshotGap {
        /// First snapshot the caller needs.
        needed: SnapshotId,
        /// Oldest snapshot still replayable from the log.
        oldest: SnapshotId,
    },
    /// The partition (or its log) has been closed.
    #[error("partition closed")]
    Closed,
    /// The partition is not accepting writes in its current state.
    #[error("partition not serving writes ({0})")]
    NotServing(PartitionState),
}

impl TesseraError {
    /// Builds a [`TesseraError::MalformedOperation`] from any message.
    pub fn malformed(msg: impl Into<String>) -> Self {
        TesseraError::MalformedOperation(msg.into())
    }

    /// Whether the caller may retry the same request after backing off.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TesseraError::Io(_) | TesseraError::PrimaryUnreachable(_)
        )
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, TesseraError>;
