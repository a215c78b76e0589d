//! Per-transaction read and write logs.
//!
//! The read log is an ordinary growable array of `(version, lock)` pairs.
//! The write log is different: owned lock words point *into* its storage,
//! so the buffer must not move while any entry holds a stripe. It grows
//! only from the rollback path, after every lock has been released, which
//! is why a full write log aborts with `EXTEND_WS` instead of reallocating
//! in place.
//!
//! Both logs are scanned linearly. Transactions are typically small and a
//! warm cache line beats any indexed structure at these sizes.

use std::mem;
use std::sync::atomic::AtomicUsize;

use crate::lock::Word;

/// Initial capacity of both logs.
pub(crate) const RW_SET_SIZE: usize = 4096;

pub(crate) struct ReadEntry {
    /// Version observed at read time.
    pub(crate) version: Word,
    /// Stripe lock, kept for fast re-validation.
    pub(crate) lock: *const AtomicUsize,
}

pub(crate) struct ReadSet {
    entries: Vec<ReadEntry>,
}

impl ReadSet {
    pub(crate) fn new() -> Self {
        Self {
            entries: Vec::with_capacity(RW_SET_SIZE),
        }
    }

    #[inline]
    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    /// Record an observed version. Doubles the storage when full; the read
    /// log has no external pointers into it, so growing in place is safe
    /// at any point.
    #[inline]
    pub(crate) fn append(&mut self, version: Word, lock: *const AtomicUsize) {
        self.entries.push(ReadEntry { version, lock });
    }

    /// Has this stripe been read before? First match wins.
    pub(crate) fn has_read(&self, lock: *const AtomicUsize) -> bool {
        self.entries.iter().any(|r| core::ptr::eq(r.lock, lock))
    }

    #[inline]
    pub(crate) fn iter(&self) -> core::slice::Iter<'_, ReadEntry> {
        self.entries.iter()
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.entries.capacity()
    }
}

/// One buffered write. `next` chains entries whose addresses hash onto the
/// same stripe; chains only ever point forward within the same buffer, and
/// only the chain tail releases the stripe at commit or rollback.
#[repr(C)]
pub(crate) struct WriteEntry {
    pub(crate) addr: *mut Word,
    pub(crate) value: Word,
    pub(crate) mask: Word,
    /// Version the stripe carried before acquisition.
    pub(crate) version: Word,
    pub(crate) lock: *const AtomicUsize,
    pub(crate) next: *mut WriteEntry,
}

/// Insertion-ordered write log backed by raw stable storage.
///
/// Entry addresses are published in lock words while stripes are owned.
/// Foreign transactions only ever compare those addresses against their
/// own buffer range, they never dereference them, but the owning
/// transaction does follow them. Either way the storage must stay put for
/// the whole transaction.
pub(crate) struct WriteSet {
    entries: *mut WriteEntry,
    size: usize,
    nb_entries: usize,
    has_writes: usize,
}

fn alloc_entries(size: usize) -> *mut WriteEntry {
    let mut v: Vec<WriteEntry> = Vec::with_capacity(size);
    let p = v.as_mut_ptr();
    mem::forget(v);
    p
}

impl WriteSet {
    pub(crate) fn new() -> Self {
        Self {
            entries: alloc_entries(RW_SET_SIZE),
            size: RW_SET_SIZE,
            nb_entries: 0,
            has_writes: 0,
        }
    }

    #[inline]
    pub(crate) fn clear(&mut self) {
        self.nb_entries = 0;
        self.has_writes = 0;
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.nb_entries
    }

    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.size
    }

    /// Number of writes recorded since the last reset. Tracked separately
    /// from `len` so priming entries and merges stay distinguishable.
    #[allow(dead_code)]
    #[inline]
    pub(crate) fn has_writes(&self) -> usize {
        self.has_writes
    }

    #[inline]
    pub(crate) fn is_full(&self) -> bool {
        self.nb_entries == self.size
    }

    /// Does `p` point into the live part of this log? This is how a
    /// transaction recognizes its own lock ownership.
    #[inline]
    pub(crate) fn contains(&self, p: *const WriteEntry) -> bool {
        let base = self.entries as usize;
        let end = base + self.nb_entries * mem::size_of::<WriteEntry>();
        (p as usize) >= base && (p as usize) < end
    }

    /// Entry at `i`. The slot is only initialized for `i < len()`.
    #[inline]
    pub(crate) fn entry(&self, i: usize) -> *mut WriteEntry {
        debug_assert!(i < self.size);
        unsafe { self.entries.add(i) }
    }

    /// Slot that the next `append` will occupy. Published to the lock word
    /// before it is initialized; nobody dereferences it until then.
    #[inline]
    pub(crate) fn next_slot(&self) -> *mut WriteEntry {
        debug_assert!(!self.is_full());
        unsafe { self.entries.add(self.nb_entries) }
    }

    #[inline]
    pub(crate) fn bump(&mut self) {
        self.nb_entries += 1;
        self.has_writes += 1;
    }

    /// Double the storage. Callable only from a quiescent point, after a
    /// rollback has released every owned stripe: the old log is dead at
    /// that moment, so nothing is copied over.
    pub(crate) fn grow(&mut self) {
        let old = self.entries;
        let old_size = self.size;
        self.size *= 2;
        self.entries = alloc_entries(self.size);
        self.nb_entries = 0;
        self.has_writes = 0;
        unsafe {
            drop(Vec::from_raw_parts(old, 0, old_size));
        }
    }
}

impl Drop for WriteSet {
    fn drop(&mut self) {
        // Entries are plain data, nothing to run; just return the buffer.
        unsafe {
            drop(Vec::from_raw_parts(self.entries, 0, self.size));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_set_records_and_grows() {
        let mut rs = ReadSet::new();
        let locks: Vec<AtomicUsize> = (0..8).map(|_| AtomicUsize::new(0)).collect();
        for (i, l) in locks.iter().enumerate() {
            rs.append(i, l);
        }
        assert_eq!(rs.len(), 8);
        assert!(rs.has_read(&locks[3]));
        let other = AtomicUsize::new(0);
        assert!(!rs.has_read(&other));
        rs.clear();
        assert_eq!(rs.len(), 0);
        assert!(rs.capacity() >= RW_SET_SIZE);
    }

    #[test]
    fn write_set_containment_tracks_live_entries() {
        let mut ws = WriteSet::new();
        let slot = ws.next_slot();
        // Not yet appended: the slot is outside the live range.
        assert!(!ws.contains(slot));
        unsafe {
            slot.write(WriteEntry {
                addr: core::ptr::null_mut(),
                value: 0,
                mask: 0,
                version: 0,
                lock: core::ptr::null(),
                next: core::ptr::null_mut(),
            });
        }
        ws.bump();
        assert!(ws.contains(slot));
        assert_eq!(ws.len(), 1);
        assert_eq!(ws.has_writes(), 1);
    }

    #[test]
    fn grow_doubles_and_drains() {
        let mut ws = WriteSet::new();
        ws.bump();
        ws.grow();
        assert_eq!(ws.capacity(), 2 * RW_SET_SIZE);
        assert_eq!(ws.len(), 0);
        assert!(!ws.is_full());
    }
}
