//! Low-level primitives the partition engine is built from.
//!
//! Includes byte encoding helpers, positional file and blob I/O, and the
//! snapshot-keyed record log.

/// Big-endian byte encoding and decoding.
pub mod bytes;

/// Positional file I/O and named blob stores.
pub mod io;

/// Append-only, snapshot-ordered record log.
pub mod wal;
