//! In-memory caches mirroring on-disk state.
//!
//! All three caches are rebuildable from the tables on disk; losing them
//! costs a rescan, never data. The engine is responsible for keeping them
//! in lockstep with every allocation, free, and rename.

use nestfs_error::{EfsError, Result};
use nestfs_types::InodeId;

/// Bit-per-id used/free cache for inode and block ids.
///
/// Ids are 1-based; id 0 is a sentinel and is never set. Growing the
/// container resizes the bitset in place, preserving existing bits.
#[derive(Debug, Clone)]
pub struct UsedBitset {
    bits: Vec<u8>,
    count: u32,
}

impl UsedBitset {
    /// Bitset covering ids `1..=count`.
    #[must_use]
    pub fn new(count: u32) -> Self {
        let bytes = (count as usize + 1).div_ceil(8);
        Self {
            bits: vec![0; bytes],
            count,
        }
    }

    /// Change the id range, keeping the state of surviving ids.
    pub fn resize(&mut self, count: u32) {
        let bytes = (count as usize + 1).div_ceil(8);
        self.bits.resize(bytes, 0);
        if count < self.count {
            // Clear bits past the new end so a later regrow starts clean.
            for id in count + 1..=self.count {
                let idx = id as usize;
                if let Some(byte) = self.bits.get_mut(idx / 8) {
                    *byte &= !(1 << (idx % 8));
                }
            }
        }
        self.count = count;
    }

    #[must_use]
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Mark `id` used or free. Id 0 and out-of-range ids are rejected.
    pub fn set(&mut self, id: u32, used: bool) -> Result<()> {
        if id == 0 || id > self.count {
            return Err(EfsError::Range(format!(
                "id {id} outside bitset range 1..={}",
                self.count
            )));
        }
        let idx = id as usize;
        let mask = 1 << (idx % 8);
        if used {
            self.bits[idx / 8] |= mask;
        } else {
            self.bits[idx / 8] &= !mask;
        }
        Ok(())
    }

    /// O(1) membership test. Id 0 and out-of-range ids report free.
    #[must_use]
    pub fn is_used(&self, id: u32) -> bool {
        if id == 0 || id > self.count {
            return false;
        }
        let idx = id as usize;
        self.bits[idx / 8] & (1 << (idx % 8)) != 0
    }
}

/// One hash cache slot.
#[derive(Debug, Clone, Copy)]
struct HashEntry {
    hash: u64,
    id: InodeId,
    hits: u32,
}

/// hash(filename) → inode id index, sorted by hash for binary search.
///
/// Inserts mark the cache dirty; the next lookup sorts first. Bulk loaders
/// should insert everything, then call [`NameHashCache::sort`] once.
/// Distinct ids mapping to one hash are a hard error: there is no chaining.
#[derive(Debug, Clone)]
pub struct NameHashCache {
    entries: Vec<HashEntry>,
    sorted: bool,
    capacity: u32,
}

impl NameHashCache {
    /// Empty cache holding at most `capacity` entries (one per inode slot).
    #[must_use]
    pub fn new(capacity: u32) -> Self {
        Self {
            entries: Vec::new(),
            sorted: true,
            capacity,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Index of the leftmost entry with `hash`, if any. Requires sorted.
    fn leftmost(&self, hash: u64) -> Option<usize> {
        let idx = self.entries.partition_point(|e| e.hash < hash);
        (idx < self.entries.len() && self.entries[idx].hash == hash).then_some(idx)
    }

    fn find(&mut self, hash: u64) -> Option<usize> {
        if self.sorted {
            self.leftmost(hash)
        } else {
            self.entries.iter().position(|e| e.hash == hash)
        }
    }

    /// Register `hash` as resolving to `id`.
    ///
    /// Re-inserting the same pair is a no-op; the same hash under a
    /// different id is `Internal` (a genuine collision, unresolvable
    /// here); a full cache is `Alloc`.
    pub fn insert(&mut self, hash: u64, id: InodeId) -> Result<()> {
        if let Some(idx) = self.find(hash) {
            let existing = self.entries[idx].id;
            if existing == id {
                return Ok(());
            }
            return Err(EfsError::Internal(format!(
                "name hash {hash:#018x} collides: inode {existing} vs inode {id}"
            )));
        }
        if self.entries.len() >= self.capacity as usize {
            return Err(EfsError::Alloc(format!(
                "name hash cache full at {} entries",
                self.capacity
            )));
        }
        self.entries.push(HashEntry { hash, id, hits: 0 });
        self.sorted = false;
        Ok(())
    }

    /// Restore hash order after a batch of inserts.
    pub fn sort(&mut self) {
        if !self.sorted {
            self.entries.sort_unstable_by_key(|e| e.hash);
            self.sorted = true;
        }
    }

    /// Resolve `hash`, bumping the entry's hit count. Sorts first when
    /// dirty.
    pub fn lookup(&mut self, hash: u64) -> Option<InodeId> {
        self.sort();
        let idx = self.leftmost(hash)?;
        self.entries[idx].hits = self.entries[idx].hits.saturating_add(1);
        Some(self.entries[idx].id)
    }

    /// Drop the entry for `hash`, if present. Preserves sort order.
    pub fn remove(&mut self, hash: u64) {
        if let Some(idx) = self.find(hash) {
            self.entries.remove(idx);
        }
    }

    /// Shed cold entries when at least half the allocated slots sit
    /// unused: keep the hotter half by hit count, release the rest, and
    /// restore hash order.
    pub fn chomp(&mut self) {
        if self.entries.is_empty() || self.entries.len() * 2 > self.entries.capacity() {
            return;
        }
        self.entries.sort_unstable_by(|a, b| b.hits.cmp(&a.hits));
        let keep = self.entries.len().div_ceil(2);
        self.entries.truncate(keep);
        self.entries.shrink_to_fit();
        self.entries.sort_unstable_by_key(|e| e.hash);
        self.sorted = true;
    }

    /// Drop everything, keeping the capacity ceiling.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.entries.shrink_to_fit();
        self.sorted = true;
    }
}

/// Fixed-slot filename cache indexed by inode id.
///
/// One slot per id, slot width `filename_length + 1` (a length byte plus
/// the name bytes). The buffer grows only as far as the highest id ever
/// cached; "the buffer does not cover this id" is how "not cached" is
/// distinguished from "cached empty".
#[derive(Debug, Clone)]
pub struct StringCache {
    buf: Vec<u8>,
    slot_width: usize,
}

impl StringCache {
    #[must_use]
    pub fn new(filename_length: u16) -> Self {
        Self {
            buf: Vec::new(),
            slot_width: usize::from(filename_length) + 1,
        }
    }

    fn slot_start(&self, id: InodeId) -> usize {
        id.0 as usize * self.slot_width
    }

    /// Whether the buffer has grown to cover `id`.
    #[must_use]
    pub fn covers(&self, id: InodeId) -> bool {
        !id.is_none() && self.slot_start(id) + self.slot_width <= self.buf.len()
    }

    /// Cache `name` for `id`, growing the buffer up to `id`'s slot.
    pub fn set(&mut self, id: InodeId, name: &[u8]) -> Result<()> {
        if id.is_none() {
            return Err(EfsError::Arg("cannot cache a name for inode 0"));
        }
        if name.len() >= self.slot_width {
            return Err(EfsError::Range(format!(
                "name of {} bytes exceeds slot width {}",
                name.len(),
                self.slot_width - 1
            )));
        }
        let start = self.slot_start(id);
        let end = start + self.slot_width;
        if self.buf.len() < end {
            self.buf.resize(end, 0);
        }
        self.buf[start] = name.len() as u8;
        self.buf[start + 1..start + 1 + name.len()].copy_from_slice(name);
        self.buf[start + 1 + name.len()..end].fill(0);
        Ok(())
    }

    /// Cached name for `id`: `None` when uncached, `Some(b"")` when cached
    /// as empty.
    #[must_use]
    pub fn get(&self, id: InodeId) -> Option<&[u8]> {
        if !self.covers(id) {
            return None;
        }
        let start = self.slot_start(id);
        let len = usize::from(self.buf[start]);
        Some(&self.buf[start + 1..start + 1 + len])
    }

    /// Reset `id`'s slot to empty (keeps coverage).
    pub fn forget(&mut self, id: InodeId) {
        if self.covers(id) {
            let start = self.slot_start(id);
            self.buf[start..start + self.slot_width].fill(0);
        }
    }

    /// Drop the whole buffer.
    pub fn clear(&mut self) {
        self.buf.clear();
        self.buf.shrink_to_fit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitset_tracks_ids_one_based() {
        let mut bits = UsedBitset::new(10);
        assert!(!bits.is_used(0));
        assert!(!bits.is_used(1));

        bits.set(1, true).expect("set");
        bits.set(10, true).expect("set");
        assert!(bits.is_used(1));
        assert!(bits.is_used(10));
        assert!(!bits.is_used(2));

        bits.set(1, false).expect("clear");
        assert!(!bits.is_used(1));

        assert!(matches!(bits.set(0, true), Err(EfsError::Range(_))));
        assert!(matches!(bits.set(11, true), Err(EfsError::Range(_))));
    }

    #[test]
    fn bitset_resize_preserves_surviving_bits() {
        let mut bits = UsedBitset::new(4);
        bits.set(3, true).expect("set");
        bits.set(4, true).expect("set");

        bits.resize(16);
        assert!(bits.is_used(3));
        assert!(bits.is_used(4));
        assert!(!bits.is_used(16));
        bits.set(16, true).expect("set");

        bits.resize(3);
        assert!(bits.is_used(3));
        assert!(!bits.is_used(4));
        // Regrowing must not resurrect cleared bits.
        bits.resize(16);
        assert!(!bits.is_used(4));
        assert!(!bits.is_used(16));
    }

    #[test]
    fn hash_cache_lookup_after_batch_insert() {
        let mut cache = NameHashCache::new(8);
        cache.insert(30, InodeId(3)).expect("insert");
        cache.insert(10, InodeId(1)).expect("insert");
        cache.insert(20, InodeId(2)).expect("insert");
        cache.sort();

        assert_eq!(cache.lookup(10), Some(InodeId(1)));
        assert_eq!(cache.lookup(20), Some(InodeId(2)));
        assert_eq!(cache.lookup(30), Some(InodeId(3)));
        assert_eq!(cache.lookup(40), None);
    }

    #[test]
    fn hash_collision_between_distinct_ids_is_internal() {
        let mut cache = NameHashCache::new(8);
        cache.insert(42, InodeId(2)).expect("insert");
        // Same pair again is fine.
        cache.insert(42, InodeId(2)).expect("reinsert");
        assert!(matches!(
            cache.insert(42, InodeId(3)),
            Err(EfsError::Internal(_))
        ));
    }

    #[test]
    fn hash_cache_capacity_is_alloc_error() {
        let mut cache = NameHashCache::new(2);
        cache.insert(1, InodeId(1)).expect("insert");
        cache.insert(2, InodeId(2)).expect("insert");
        assert!(matches!(
            cache.insert(3, InodeId(3)),
            Err(EfsError::Alloc(_))
        ));
    }

    #[test]
    fn hash_cache_remove_keeps_lookups_working() {
        let mut cache = NameHashCache::new(8);
        cache.insert(10, InodeId(1)).expect("insert");
        cache.insert(20, InodeId(2)).expect("insert");
        assert_eq!(cache.lookup(10), Some(InodeId(1)));

        cache.remove(10);
        assert_eq!(cache.lookup(10), None);
        assert_eq!(cache.lookup(20), Some(InodeId(2)));
    }

    #[test]
    fn chomp_keeps_the_hotter_half() {
        let mut cache = NameHashCache::new(64);
        for i in 1..=8_u64 {
            cache.insert(i * 10, InodeId(i as u32)).expect("insert");
        }
        // Heat up the high hashes.
        for _ in 0..3 {
            for i in 5..=8_u64 {
                assert!(cache.lookup(i * 10).is_some());
            }
        }
        // Make half the allocated slots unused, then shed.
        cache.remove(10);
        cache.remove(20);
        cache.remove(30);
        cache.remove(40);
        cache.chomp();

        assert_eq!(cache.len(), 2);
        for i in 1..=4_u64 {
            assert_eq!(cache.lookup(i * 10), None);
        }
    }

    #[test]
    fn string_cache_distinguishes_uncached_from_empty() {
        let mut cache = StringCache::new(16);
        assert_eq!(cache.get(InodeId(3)), None);
        assert!(!cache.covers(InodeId(3)));

        cache.set(InodeId(3), b"hello").expect("set");
        assert_eq!(cache.get(InodeId(3)), Some(&b"hello"[..]));
        // Growing to id 3 covers the lower slots as "cached empty".
        assert_eq!(cache.get(InodeId(1)), Some(&b""[..]));
        assert_eq!(cache.get(InodeId(4)), None);

        cache.forget(InodeId(3));
        assert_eq!(cache.get(InodeId(3)), Some(&b""[..]));
        assert!(cache.covers(InodeId(3)));
    }

    #[test]
    fn string_cache_rejects_oversized_names() {
        let mut cache = StringCache::new(4);
        cache.set(InodeId(1), b"abcd").expect("fits");
        assert!(matches!(
            cache.set(InodeId(1), b"abcde"),
            Err(EfsError::Range(_))
        ));
    }
}
