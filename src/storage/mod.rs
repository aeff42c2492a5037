//! Row storage: the versioned key/value store, row and key encodings,
//! full-state images and bulk load files.

pub mod bulk;
pub mod checkpoint;
pub mod external;
pub mod keys;
pub mod row;
pub mod versioned;

pub use bulk::{BulkFile, BulkFileWriter, BulkRow};
pub use checkpoint::{CheckpointImage, CheckpointWriter};
pub use external::{ExternalStorage, LocalExternalStorage};
pub use row::Row;
pub use versioned::{CompactStats, VersionedStore, WriteSet};
