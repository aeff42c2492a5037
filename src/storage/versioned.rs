#![forbid(unsafe_code)]

//! Multi-version key/value store with snapshot reads.
//!
//! Each key maps to an ascending chain of `(snapshot, value)` versions where
//! `None` is a tombstone. A read at snapshot `s` sees the newest version at
//! or below `s`. Commits stamp a whole [`WriteSet`] with one snapshot under
//! the write lock, so readers observe either all of a batch or none of it.

use std::collections::BTreeMap;
use std::ops::Bound;

use bytes::Bytes;
use parking_lot::RwLock;
use serde::Serialize;
use smallvec::SmallVec;
use tracing::debug;

use crate::types::SnapshotId;

type Chain = SmallVec<[(SnapshotId, Option<Bytes>); 2]>;

/// Buffered writes of one batch, keyed by row key.
///
/// Later writes to the same key replace earlier ones, so the applier can
/// read its own uncommitted writes through [`WriteSet::get`].
#[derive(Clone, Debug, Default)]
pub struct WriteSet {
    writes: BTreeMap<Bytes, Option<Bytes>>,
}

impl WriteSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: Bytes, value: Bytes) {
        self.writes.insert(key, Some(value));
    }

    pub fn delete(&mut self, key: Bytes) {
        self.writes.insert(key, None);
    }

    /// Staged value: `Some(None)` is a staged delete, `None` means untouched.
    pub fn get(&self, key: &[u8]) -> Option<Option<&Bytes>> {
        self.writes.get(key).map(Option::as_ref)
    }

    /// Staged keys starting with `prefix`.
    pub fn keys_with_prefix<'a>(&'a self, prefix: &'a [u8]) -> impl Iterator<Item = &'a Bytes> {
        self.writes
            .range::<[u8], _>((Bound::Included(prefix), Bound::Unbounded))
            .map(|(k, _)| k)
            .take_while(move |k| k.starts_with(prefix))
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }
}

/// Counters returned by [`VersionedStore::compact`].
#[derive(Clone, Copy, Debug, Default, Serialize, PartialEq, Eq)]
pub struct CompactStats {
    /// Superseded versions dropped.
    pub versions_dropped: u64,
    /// Keys removed entirely.
    pub keys_dropped: u64,
    /// Keys removed because their owner was retired.
    pub keys_purged: u64,
}

/// In-process multi-version row store.
#[derive(Default)]
pub struct VersionedStore {
    rows: RwLock<BTreeMap<Bytes, Chain>>,
}

impl VersionedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Value of `key` as of snapshot `at`.
    pub fn get(&self, key: &[u8], at: SnapshotId) -> Option<Bytes> {
        let rows = self.rows.read();
        rows.get(key).and_then(|chain| visible(chain, at))
    }

    /// Live rows under `prefix` as of `at`, in key order.
    pub fn scan_prefix(&self, prefix: &[u8], at: SnapshotId) -> Vec<(Bytes, Bytes)> {
        let rows = self.rows.read();
        rows.range::<[u8], _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .filter_map(|(k, chain)| visible(chain, at).map(|v| (k.clone(), v)))
            .collect()
    }

    /// Up to `limit` live rows after `after` as of `at`.
    ///
    /// The read lock is held only for one chunk, so a long scan lets
    /// commits through between chunks.
    pub fn scan_chunk(
        &self,
        after: Option<&[u8]>,
        at: SnapshotId,
        limit: usize,
    ) -> Vec<(Bytes, Bytes)> {
        let rows = self.rows.read();
        let lower = match after {
            Some(key) => Bound::Excluded(key),
            None => Bound::Unbounded,
        };
        rows.range::<[u8], _>((lower, Bound::Unbounded))
            .filter_map(|(k, chain)| visible(chain, at).map(|v| (k.clone(), v)))
            .take(limit)
            .collect()
    }

    /// Installs `writes` as the versions at snapshot `at`.
    pub fn commit(&self, writes: WriteSet, at: SnapshotId) {
        if writes.is_empty() {
            return;
        }
        let count = writes.len();
        let mut rows = self.rows.write();
        for (key, value) in writes.writes {
            let chain = rows.entry(key).or_default();
            match chain.last_mut() {
                Some(last) if last.0 == at => last.1 = value,
                _ => {
                    debug_assert!(chain.last().map_or(true, |last| last.0 < at));
                    chain.push((at, value));
                }
            }
        }
        debug!(snapshot = at.0, keys = count, "store.commit");
    }

    /// Drops versions no reader at or above `horizon` can observe.
    ///
    /// Per key, the newest version at or below the horizon survives together
    /// with everything above it; a surviving base that is a tombstone is
    /// dropped too. Keys for which `purge` returns true are removed
    /// outright.
    pub fn compact(&self, horizon: SnapshotId, purge: impl Fn(&[u8]) -> bool) -> CompactStats {
        let mut stats = CompactStats::default();
        let mut rows = self.rows.write();
        rows.retain(|key, chain| {
            if purge(&key[..]) {
                stats.keys_purged += 1;
                return false;
            }
            let base = chain.iter().rposition(|(s, _)| *s <= horizon);
            if let Some(base) = base {
                if base > 0 {
                    chain.drain(..base);
                    stats.versions_dropped += base as u64;
                }
                if chain[0].1.is_none() {
                    chain.remove(0);
                    stats.versions_dropped += 1;
                }
            }
            if chain.is_empty() {
                stats.keys_dropped += 1;
                return false;
            }
            true
        });
        debug!(
            horizon = horizon.0,
            versions_dropped = stats.versions_dropped,
            keys_dropped = stats.keys_dropped,
            keys_purged = stats.keys_purged,
            "store.compact"
        );
        stats
    }

    /// Replaces the whole store with `rows`, all visible from `at`.
    pub fn replace_all(&self, rows: impl IntoIterator<Item = (Bytes, Bytes)>, at: SnapshotId) {
        let fresh: BTreeMap<Bytes, Chain> = rows
            .into_iter()
            .map(|(k, v)| {
                let mut chain = Chain::new();
                chain.push((at, Some(v)));
                (k, chain)
            })
            .collect();
        *self.rows.write() = fresh;
    }

    /// Bytes held across all keys and versions.
    pub fn size_bytes(&self) -> u64 {
        let rows = self.rows.read();
        rows.iter()
            .map(|(k, chain)| {
                let versions: usize = chain
                    .iter()
                    .map(|(_, v)| 8 + v.as_ref().map_or(0, Bytes::len))
                    .sum();
                (k.len() + versions) as u64
            })
            .sum()
    }

    /// Number of keys, including ones whose newest version is a tombstone.
    pub fn key_count(&self) -> usize {
        self.rows.read().len()
    }

    /// Total versions across all keys.
    pub fn version_count(&self) -> usize {
        self.rows.read().values().map(|c| c.len()).sum()
    }
}

fn visible(chain: &Chain, at: SnapshotId) -> Option<Bytes> {
    chain
        .iter()
        .rev()
        .find(|(s, _)| *s <= at)
        .and_then(|(_, v)| v.clone())
}
