//! Partition write and replication core of a partitioned graph store.
//!
//! Batches of typed operations, numbered by a global snapshot id, are
//! appended to a per-partition operation log and applied in order by a
//! single-writer [`partition::Partition`]. Secondaries follow a primary
//! through [`replication`], backups capture pinned snapshots through
//! [`backup`], and garbage collection never reclaims what a backup or a
//! replica still needs.

#![warn(missing_docs)]

pub mod admin;
pub mod backup;
pub mod config;
pub mod coordinator;
pub mod operation;
pub mod oplog;
pub mod partition;
pub mod primitives;
pub mod replication;
pub mod schema;
pub mod service;
pub mod storage;
pub mod types;

pub use operation::{Operation, OperationBatch};
pub use partition::{GraphPartition, Partition, PartitionOptions};
pub use types::{Result, SnapshotId, TesseraError};
