use super::entry::Entry;
use super::key::DmemKey;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::sync::atomic::Ordering;

/// Sequence value of an entry that is not on the list.
pub(crate) const UNLINKED: u64 = u64::MAX;

/// Backend-wide LRU list.
///
/// Entries are keyed by a monotonic sequence number stamped on insertion:
/// the head is the highest sequence, the tail the lowest. Each entry
/// remembers its own sequence, which makes unlinking O(log n) without an
/// intrusive list. Only touched under the backend's LRU lock.
pub(crate) struct Lru<K: DmemKey> {
    entries: BTreeMap<u64, Arc<Entry<K>>>,
    next_seq: u64,
}

impl<K: DmemKey> Lru<K> {
    pub(crate) const fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            next_seq: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn push_head(&mut self, entry: &Arc<Entry<K>>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        entry.lru_seq.store(seq, Ordering::Relaxed);
        self.entries.insert(seq, Arc::clone(entry));
    }

    /// Remove `entry` if it is linked. Returns whether it was.
    pub(crate) fn unlink(&mut self, entry: &Entry<K>) -> bool {
        let seq = entry.lru_seq.swap(UNLINKED, Ordering::Relaxed);
        if seq == UNLINKED {
            return false;
        }
        self.entries.remove(&seq);
        true
    }

    /// Move a linked entry to the head; unlinked entries stay off the list.
    pub(crate) fn touch(&mut self, entry: &Arc<Entry<K>>) {
        if self.unlink(entry) {
            self.push_head(entry);
        }
    }

    /// Unlink and return the least recently used entry.
    pub(crate) fn pop_tail(&mut self) -> Option<Arc<Entry<K>>> {
        let (_, entry) = self.entries.pop_first()?;
        entry.lru_seq.store(UNLINKED, Ordering::Relaxed);
        Some(entry)
    }

    #[cfg(test)]
    pub(crate) fn keys_from_tail(&self) -> alloc::vec::Vec<K> {
        self.entries.values().map(|e| e.key().clone()).collect()
    }
}
