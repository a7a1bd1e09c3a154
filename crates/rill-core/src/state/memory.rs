//! `BTreeMap`-backed state store.

use bytes::Bytes;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::ops::{Bound, Range};

use super::{CommitMarker, StateError, StateSnapshot, StateStore, WriteBatch, WriteOp};

/// Compute the lexicographic successor of a byte prefix.
///
/// Returns `None` if no successor exists (empty prefix or all bytes are 0xFF).
fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    if prefix.is_empty() {
        return None;
    }
    let mut successor = prefix.to_vec();
    while let Some(last) = successor.last_mut() {
        if *last < 0xFF {
            *last += 1;
            return Some(successor);
        }
        successor.pop();
    }
    None
}

/// In-memory state store using `BTreeMap` for sorted key access.
///
/// Snapshots iterate in key order, so two stores holding the same entries
/// always produce identical snapshots.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    data: BTreeMap<Vec<u8>, Bytes>,
    size_bytes: usize,
    last_commit: Option<CommitMarker>,
}

impl InMemoryStore {
    /// Creates a new empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a single operation; in-memory writes cannot fail.
    pub(crate) fn apply(&mut self, op: WriteOp) {
        match op {
            WriteOp::Put { key, value } => self.insert(key, Bytes::from(value)),
            WriteOp::Delete { key } => self.remove(&key),
        }
    }

    fn insert(&mut self, key: Vec<u8>, value: Bytes) {
        let value_len = value.len();
        match self.data.entry(key) {
            Entry::Occupied(mut entry) => {
                self.size_bytes -= entry.get().len();
                self.size_bytes += value_len;
                *entry.get_mut() = value;
            }
            Entry::Vacant(entry) => {
                self.size_bytes += entry.key().len() + value_len;
                entry.insert(value);
            }
        }
    }

    fn remove(&mut self, key: &[u8]) {
        if let Some(old_value) = self.data.remove(key) {
            self.size_bytes -= key.len() + old_value.len();
        }
    }
}

impl StateStore for InMemoryStore {
    #[inline]
    fn get(&self, key: &[u8]) -> Option<Bytes> {
        self.data.get(key).cloned()
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), StateError> {
        self.insert(key.to_vec(), Bytes::copy_from_slice(value));
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), StateError> {
        self.remove(key);
        Ok(())
    }

    fn prefix_scan<'a>(
        &'a self,
        prefix: &'a [u8],
    ) -> Box<dyn Iterator<Item = (Bytes, Bytes)> + 'a> {
        let upper = match prefix_successor(prefix) {
            Some(end) => Bound::Excluded(end),
            None => Bound::Unbounded,
        };
        Box::new(
            self.data
                .range::<[u8], _>((Bound::Included(prefix), upper.as_ref().map(Vec::as_slice)))
                .filter(move |(k, _)| k.starts_with(prefix))
                .map(|(k, v)| (Bytes::copy_from_slice(k), v.clone())),
        )
    }

    fn range_scan<'a>(
        &'a self,
        range: Range<&'a [u8]>,
    ) -> Box<dyn Iterator<Item = (Bytes, Bytes)> + 'a> {
        Box::new(
            self.data
                .range::<[u8], _>((Bound::Included(range.start), Bound::Excluded(range.end)))
                .map(|(k, v)| (Bytes::copy_from_slice(k), v.clone())),
        )
    }

    #[inline]
    fn contains(&self, key: &[u8]) -> bool {
        self.data.contains_key(key)
    }

    fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    fn len(&self) -> usize {
        self.data.len()
    }

    fn snapshot(&self) -> StateSnapshot {
        let data = self
            .data
            .iter()
            .map(|(k, v)| (k.clone(), v.to_vec()))
            .collect();
        StateSnapshot::new(data, self.last_commit.clone())
    }

    fn restore(&mut self, snapshot: StateSnapshot) {
        self.clear();
        let (data, commit) = snapshot.into_parts();
        for (key, value) in data {
            self.insert(key, Bytes::from(value));
        }
        self.last_commit = commit;
    }

    fn clear(&mut self) {
        self.data.clear();
        self.size_bytes = 0;
        self.last_commit = None;
    }

    fn write_batch(&mut self, batch: WriteBatch) -> Result<(), StateError> {
        let (ops, commit) = batch.into_parts();
        for op in ops {
            self.apply(op);
        }
        if commit.is_some() {
            self.last_commit = commit;
        }
        Ok(())
    }

    fn last_commit(&self) -> Option<&CommitMarker> {
        self.last_commit.as_ref()
    }
}
