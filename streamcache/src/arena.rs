//! A fixed-capacity arena of [LINE_SIZE] slots shared by every session of a cache.
//!
//! # Slot Table
//!
//! Slot memory is a single contiguous, page-aligned allocation. Each slot is described by an entry
//! in a table of `capacity + 1` entries, where entry `0` is a sentinel with no backing memory. The
//! entries are threaded by one circular, doubly-linked list of table indices:
//!
//! ```text
//! [0] <-> [least recently unlocked] <-> ... <-> [most recently unlocked] <-> [0]
//! ```
//!
//! A slot is on the list iff its lock count is zero, so every slot on the list is a candidate for
//! reuse and picking a victim never requires a scan. Locking a slot (0 -> 1) unlinks it, unlocking
//! it (1 -> 0) appends it at the tail. New occupants are always taken from the head.
//!
//! # Locking
//!
//! All mutations of the table happen through [Slots], which is only reachable via the guard
//! returned by [Arena::lock]. Callers performing multi-step sequences hold one guard across all of
//! them.

use crate::block::{LineId, SlotId, LINE_SIZE};
use prometheus_client::metrics::{counter::Counter, gauge::Gauge};
use std::{
    alloc::{alloc_zeroed, dealloc, Layout},
    mem,
    num::NonZeroUsize,
    ptr::NonNull,
    sync::{Mutex, MutexGuard, Weak},
};
use tracing::debug;

/// Alignment of slot memory.
const ALIGNMENT: usize = 4096;

/// Index of the sentinel entry.
const HEAD: u32 = 0;

/// Receives notice that one of its lines no longer occupies a slot.
pub(crate) trait Evict: Send + Sync {
    /// Called (with the arena locked) right before the slot holding `line` is reassigned.
    fn evict(&self, line: LineId);
}

/// The session that placed a line in a slot.
#[derive(Clone)]
pub(crate) struct Owner {
    pub(crate) id: u64,
    pub(crate) handle: Weak<dyn Evict>,
}

/// Contiguous, aligned memory backing every slot.
struct Memory {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: Memory owns its allocation and can be sent between threads.
unsafe impl Send for Memory {}
// SAFETY: Memory hands out disjoint per-slot regions whose access is coordinated by slot locks
// and line completions (see [Arena::fill] and [Arena::memory]).
unsafe impl Sync for Memory {}

impl Memory {
    /// Allocates `size` zeroed bytes.
    ///
    /// # Panics
    ///
    /// Panics if allocation fails.
    fn new(size: usize) -> Self {
        let layout = Layout::from_size_align(size, ALIGNMENT).expect("invalid layout");

        // SAFETY: Layout is valid and non-zero in size.
        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).expect("allocation failed");

        Self { ptr, layout }
    }

    /// Returns a pointer to the first byte of `slot`.
    #[inline]
    fn slot_ptr(&self, slot: SlotId) -> *mut u8 {
        let offset = (slot.index() as usize - 1) * LINE_SIZE;
        debug_assert!(offset + LINE_SIZE <= self.layout.size());
        // SAFETY: slot indices are bounded by the table, which is sized to the allocation.
        unsafe { self.ptr.as_ptr().add(offset) }
    }
}

impl Drop for Memory {
    fn drop(&mut self) {
        // SAFETY: ptr was allocated with this layout.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

/// Metrics for the arena.
#[derive(Default)]
pub(crate) struct Metrics {
    /// Lines served from a slot they already occupied.
    pub(crate) hits: Counter,
    /// Lines that required a slot to be populated.
    pub(crate) misses: Counter,
    /// Lines evicted from their slot.
    pub(crate) evictions: Counter,
    /// Reads served outside the arena because of insufficient free slots.
    pub(crate) uncached: Counter,
    /// Lines populated by preloading.
    pub(crate) preloaded: Counter,
    /// Slots with no locks.
    pub(crate) free: Gauge,
}

impl Metrics {
    /// Create the arena's metrics and register them with `context`.
    pub(crate) fn init<M: commonware_runtime::Metrics>(context: &M) -> Self {
        let metrics = Self::default();
        context.register(
            "hits",
            "Lines served from a slot they already occupied",
            metrics.hits.clone(),
        );
        context.register(
            "misses",
            "Lines that required a slot to be populated",
            metrics.misses.clone(),
        );
        context.register(
            "evictions",
            "Lines evicted from their slot",
            metrics.evictions.clone(),
        );
        context.register(
            "uncached_reads",
            "Reads served outside the arena because of insufficient free slots",
            metrics.uncached.clone(),
        );
        context.register(
            "preloaded_lines",
            "Lines populated by preloading",
            metrics.preloaded.clone(),
        );
        context.register("free_slots", "Slots with no locks", metrics.free.clone());
        metrics
    }
}

/// Bookkeeping for a single slot.
struct Entry {
    owner: Option<Owner>,
    line: LineId,
    locks: u32,
    next: u32,
    prev: u32,
}

/// The slot table. See the [module documentation](self).
pub(crate) struct Slots {
    entries: Vec<Entry>,
    free: usize,
    evictions: Counter,
    free_gauge: Gauge,
}

impl Slots {
    fn new(capacity: usize, evictions: Counter, free_gauge: Gauge) -> Self {
        assert!(capacity < u32::MAX as usize, "too many slots: {capacity}");
        let len = capacity + 1;
        let entries = (0..len)
            .map(|index| Entry {
                owner: None,
                line: LineId::INVALID,
                locks: 0,
                next: ((index + 1) % len) as u32,
                prev: ((index + len - 1) % len) as u32,
            })
            .collect();
        free_gauge.set(capacity as i64);
        Self {
            entries,
            free: capacity,
            evictions,
            free_gauge,
        }
    }

    /// Number of slots with no locks.
    pub(crate) fn free(&self) -> usize {
        self.free
    }

    /// Returns true if `slot` has at least one lock.
    pub(crate) fn is_locked(&self, slot: SlotId) -> bool {
        self.entry(slot).locks > 0
    }

    /// Returns the session id and line occupying `slot`, if any.
    pub(crate) fn occupant(&self, slot: SlotId) -> Option<(u64, LineId)> {
        let entry = self.entry(slot);
        entry.owner.as_ref().map(|owner| (owner.id, entry.line))
    }

    /// Take the least recently unlocked slot for `line`, evicting its previous occupant (if any),
    /// and return it with a single lock.
    ///
    /// # Panics
    ///
    /// Panics if there are no free slots. Callers must check [Slots::free] first.
    pub(crate) fn acquire(&mut self, owner: Owner, line: LineId) -> SlotId {
        assert!(self.free > 0, "no free slots");
        let index = self.entries[HEAD as usize].next;
        assert_ne!(index, HEAD, "free list is empty");
        self.unlink(index);
        self.set_free(self.free - 1);

        let entry = &mut self.entries[index as usize];
        debug_assert_eq!(entry.locks, 0);
        let previous = entry.owner.take();
        let previous_line = mem::replace(&mut entry.line, line);
        entry.owner = Some(owner);
        entry.locks = 1;
        if let Some(previous) = previous {
            self.notify(previous, previous_line);
        }

        SlotId::new(index)
    }

    /// Add a lock to `slot`, removing it from the free list if it was unlocked.
    pub(crate) fn lock(&mut self, slot: SlotId) {
        let index = slot.index();
        let entry = &mut self.entries[index as usize];
        entry.locks += 1;
        if entry.locks == 1 {
            assert!(self.free > 0, "locking slot {slot} with no free slots");
            self.unlink(index);
            self.set_free(self.free - 1);
        }
    }

    /// Remove a lock from `slot`, returning it to the tail of the free list once unlocked.
    ///
    /// # Panics
    ///
    /// Panics if `slot` is not locked.
    pub(crate) fn unlock(&mut self, slot: SlotId) {
        let index = slot.index();
        let entry = &mut self.entries[index as usize];
        assert!(entry.locks > 0, "unlocking slot {slot} with no locks");
        entry.locks -= 1;
        if entry.locks == 0 {
            self.push_back(index);
            self.set_free(self.free + 1);
        }
    }

    /// Evict every unlocked line (or only those owned by `session`) and move their slots to the
    /// head of the free list.
    ///
    /// Returns false if any matching line could not be evicted because it is locked.
    pub(crate) fn evict_all(&mut self, session: Option<u64>) -> bool {
        let mut evicted = true;
        for index in 1..self.entries.len() as u32 {
            let entry = &mut self.entries[index as usize];
            let Some(owner) = &entry.owner else {
                continue;
            };
            if session.is_some_and(|id| id != owner.id) {
                continue;
            }
            if entry.locks > 0 {
                evicted = false;
                continue;
            }
            let owner = entry.owner.take().expect("occupied slot");
            let line = mem::replace(&mut entry.line, LineId::INVALID);
            self.notify(owner, line);
            self.unlink(index);
            self.push_front(index);
        }
        evicted
    }

    fn notify(&self, owner: Owner, line: LineId) {
        self.evictions.inc();
        debug!(session = owner.id, line = line.index(), "evicted line");
        if let Some(handle) = owner.handle.upgrade() {
            handle.evict(line);
        }
    }

    fn entry(&self, slot: SlotId) -> &Entry {
        assert!(
            slot.is_valid() && slot.index() != HEAD,
            "invalid slot {slot}"
        );
        &self.entries[slot.index() as usize]
    }

    fn set_free(&mut self, free: usize) {
        self.free = free;
        self.free_gauge.set(free as i64);
    }

    fn unlink(&mut self, index: u32) {
        let Entry { next, prev, .. } = self.entries[index as usize];
        self.entries[prev as usize].next = next;
        self.entries[next as usize].prev = prev;
        let entry = &mut self.entries[index as usize];
        entry.next = index;
        entry.prev = index;
    }

    fn push_back(&mut self, index: u32) {
        let tail = self.entries[HEAD as usize].prev;
        self.entries[index as usize].prev = tail;
        self.entries[index as usize].next = HEAD;
        self.entries[tail as usize].next = index;
        self.entries[HEAD as usize].prev = index;
    }

    fn push_front(&mut self, index: u32) {
        let first = self.entries[HEAD as usize].next;
        self.entries[index as usize].next = first;
        self.entries[index as usize].prev = HEAD;
        self.entries[first as usize].prev = index;
        self.entries[HEAD as usize].next = index;
    }

    /// Slot indices on the free list, from head to tail.
    #[cfg(test)]
    pub(crate) fn free_list(&self) -> Vec<u32> {
        let mut indices = Vec::new();
        let mut index = self.entries[HEAD as usize].next;
        while index != HEAD {
            indices.push(index);
            index = self.entries[index as usize].next;
        }
        indices
    }

    /// Assert the table's invariants.
    #[cfg(test)]
    pub(crate) fn check(&self) {
        let listed = self.free_list();
        assert_eq!(listed.len(), self.free);
        for &index in &listed {
            assert_eq!(self.entries[index as usize].locks, 0);
        }
        let unlocked = self.entries[1..].iter().filter(|e| e.locks == 0).count();
        assert_eq!(unlocked, self.free);
    }
}

/// A fixed number of [LINE_SIZE] slots shared by every session of a cache.
pub(crate) struct Arena {
    memory: Memory,
    slots: Mutex<Slots>,
    capacity: usize,
    pub(crate) metrics: Metrics,
}

impl Arena {
    /// Create an arena of `capacity` slots that reports to `metrics`.
    pub(crate) fn new(capacity: NonZeroUsize, metrics: Metrics) -> Self {
        let capacity = capacity.get();
        let slots = Slots::new(capacity, metrics.evictions.clone(), metrics.free.clone());
        Self {
            memory: Memory::new(capacity * LINE_SIZE),
            slots: Mutex::new(slots),
            capacity,
            metrics,
        }
    }

    /// Lock the slot table.
    pub(crate) fn lock(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap()
    }

    /// Number of slots in the arena.
    pub(crate) const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total bytes of slot memory.
    pub(crate) const fn size_bytes(&self) -> u64 {
        (self.capacity * LINE_SIZE) as u64
    }

    /// Returns the memory of `slot`.
    ///
    /// Callers may only read bytes of a line whose population has completed successfully, and
    /// must hold a lock on `slot` for as long as the returned slice is alive.
    ///
    /// # Panics
    ///
    /// Panics if `slot` is not locked.
    pub(crate) fn memory(&self, slot: SlotId) -> &[u8] {
        assert!(self.lock().is_locked(slot), "reading unlocked slot {slot}");
        // SAFETY: the slot is locked and populated, so it cannot be reassigned or written until
        // every lock (including the caller's) is released.
        unsafe { std::slice::from_raw_parts(self.memory.slot_ptr(slot), LINE_SIZE) }
    }

    /// Copy `data` into the start of `slot` and zero the rest of it.
    ///
    /// Must only be called by the read populating the line that currently occupies `slot`, while
    /// that read holds a lock on it and before the line's completion resolves.
    ///
    /// # Panics
    ///
    /// Panics if `slot` is not locked or `data` is larger than a slot.
    pub(crate) fn fill(&self, slot: SlotId, data: &[u8]) {
        assert!(data.len() <= LINE_SIZE, "line data exceeds slot size");
        assert!(self.lock().is_locked(slot), "filling unlocked slot {slot}");
        // SAFETY: the populating read is the only writer of a locked slot whose completion has
        // not resolved, and readers refuse to access a line until it has resolved successfully.
        unsafe {
            let ptr = self.memory.slot_ptr(slot);
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr, data.len());
            std::ptr::write_bytes(ptr.add(data.len()), 0, LINE_SIZE - data.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_macros::test_traced;
    use std::sync::{Arc, Mutex};

    /// Records every line it is asked to evict.
    #[derive(Default)]
    struct Recorder {
        evicted: Mutex<Vec<LineId>>,
    }

    impl Evict for Recorder {
        fn evict(&self, line: LineId) {
            self.evicted.lock().unwrap().push(line);
        }
    }

    impl Recorder {
        fn evicted(&self) -> Vec<LineId> {
            self.evicted.lock().unwrap().clone()
        }
    }

    fn owner(id: u64, recorder: &Arc<Recorder>) -> Owner {
        let recorder = Arc::downgrade(recorder);
        let handle: Weak<dyn Evict> = recorder;
        Owner { id, handle }
    }

    fn arena(capacity: usize) -> Arena {
        Arena::new(NonZeroUsize::new(capacity).unwrap(), Metrics::default())
    }

    #[test_traced]
    fn test_acquire_in_lru_order() {
        let arena = arena(3);
        let recorder = Arc::new(Recorder::default());
        let mut slots = arena.lock();
        assert_eq!(slots.free(), 3);
        assert_eq!(slots.free_list(), vec![1, 2, 3]);

        let a = slots.acquire(owner(1, &recorder), LineId::new(0));
        let b = slots.acquire(owner(1, &recorder), LineId::new(1));
        let c = slots.acquire(owner(1, &recorder), LineId::new(2));
        assert_eq!((a.index(), b.index(), c.index()), (1, 2, 3));
        assert_eq!(slots.free(), 0);
        slots.check();

        // Unlock in a different order than acquired.
        slots.unlock(c);
        slots.unlock(a);
        slots.unlock(b);
        assert_eq!(slots.free_list(), vec![3, 1, 2]);
        slots.check();

        // The least recently unlocked slot is reused first, evicting its line.
        let d = slots.acquire(owner(1, &recorder), LineId::new(9));
        assert_eq!(d, c);
        assert_eq!(recorder.evicted(), vec![LineId::new(2)]);
        assert_eq!(slots.occupant(d), Some((1, LineId::new(9))));
        slots.check();
    }

    #[test_traced]
    fn test_lock_unlock_idempotent() {
        let arena = arena(2);
        let recorder = Arc::new(Recorder::default());
        let mut slots = arena.lock();
        let slot = slots.acquire(owner(7, &recorder), LineId::new(0));
        slots.unlock(slot);
        assert!(!slots.is_locked(slot));
        assert_eq!(slots.free(), 2);

        for _ in 0..5 {
            slots.lock(slot);
        }
        assert!(slots.is_locked(slot));
        assert_eq!(slots.free(), 1);
        for _ in 0..5 {
            slots.unlock(slot);
        }
        assert!(!slots.is_locked(slot));
        assert_eq!(slots.free(), 2);
        assert_eq!(slots.occupant(slot), Some((7, LineId::new(0))));
        slots.check();
    }

    #[test_traced]
    fn test_evict_all() {
        let arena = arena(4);
        let first = Arc::new(Recorder::default());
        let second = Arc::new(Recorder::default());
        let mut slots = arena.lock();
        let a = slots.acquire(owner(1, &first), LineId::new(0));
        let b = slots.acquire(owner(1, &first), LineId::new(1));
        let c = slots.acquire(owner(2, &second), LineId::new(0));
        slots.unlock(a);
        slots.unlock(c);

        // Only session 1's unlocked line is evicted, and its locked line blocks completion.
        assert!(!slots.evict_all(Some(1)));
        assert_eq!(first.evicted(), vec![LineId::new(0)]);
        assert!(second.evicted().is_empty());
        assert_eq!(slots.occupant(a), None);
        assert_eq!(slots.occupant(b), Some((1, LineId::new(1))));

        // Evicted slots move to the head of the free list.
        assert_eq!(slots.free_list()[0], a.index());
        slots.check();

        slots.unlock(b);
        assert!(slots.evict_all(None));
        assert_eq!(first.evicted(), vec![LineId::new(0), LineId::new(1)]);
        assert_eq!(second.evicted(), vec![LineId::new(0)]);
        assert_eq!(slots.free(), 4);
        slots.check();

        // Nothing left to evict.
        assert!(slots.evict_all(None));
        assert_eq!(arena.metrics.evictions.get(), 3);
    }

    #[test_traced]
    fn test_evict_dropped_owner() {
        let arena = arena(1);
        let recorder = Arc::new(Recorder::default());
        let mut slots = arena.lock();
        let slot = slots.acquire(owner(1, &recorder), LineId::new(0));
        slots.unlock(slot);
        drop(recorder);

        // Reassigning a slot whose owner is gone is silent.
        let other = Arc::new(Recorder::default());
        assert_eq!(slots.acquire(owner(2, &other), LineId::new(3)), slot);
        assert_eq!(slots.occupant(slot), Some((2, LineId::new(3))));
    }

    #[test_traced]
    fn test_fill_and_read() {
        let arena = arena(2);
        let recorder = Arc::new(Recorder::default());
        let slot = arena.lock().acquire(owner(1, &recorder), LineId::new(0));
        arena.fill(slot, &[7; LINE_SIZE]);
        assert!(arena.memory(slot).iter().all(|&b| b == 7));

        // A short line clears whatever the slot held before.
        arena.fill(slot, &[1, 2, 3]);
        assert_eq!(&arena.memory(slot)[..4], &[1, 2, 3, 0]);
        assert!(arena.memory(slot)[3..].iter().all(|&b| b == 0));
        assert_eq!(arena.memory(slot).len(), LINE_SIZE);
        assert_eq!(arena.size_bytes(), 2 * LINE_SIZE as u64);
    }

    #[test]
    #[should_panic(expected = "no free slots")]
    fn test_acquire_without_free_slots() {
        let arena = arena(1);
        let recorder = Arc::new(Recorder::default());
        let mut slots = arena.lock();
        slots.acquire(owner(1, &recorder), LineId::new(0));
        slots.acquire(owner(1, &recorder), LineId::new(1));
    }

    #[test]
    #[should_panic(expected = "with no locks")]
    fn test_unlock_unlocked() {
        let arena = arena(1);
        let mut slots = arena.lock();
        slots.unlock(SlotId::new(1));
    }

    #[test]
    #[should_panic(expected = "reading unlocked slot")]
    fn test_memory_of_unlocked_slot() {
        let arena = arena(1);
        arena.memory(SlotId::new(1));
    }
}
