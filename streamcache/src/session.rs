//! Per-file mapping of lines onto the shared arena.
//!
//! # Design
//!
//! A [Session] keeps, for every line of its file that has ever been touched, the slot it currently
//! occupies (if any) and the completion of the read that populated it. Lines are only populated
//! on demand, by [Session::read] or [Session::preload], and the file size is queried once in the
//! background when the session starts. Reads issued before the size is known are scheduled
//! behind that query.
//!
//! Populating a line pins its slot for the duration of the read, so a slot is never reassigned
//! (and its line never evicted) while bytes are being written into it.
//!
//! # Locking
//!
//! The arena's slot table is always locked before the session's line table, and the line table
//! is never held while calling into the arena (eviction calls back into the owning session).

use crate::{
    arena::{Evict, Owner},
    block::{LineId, SlotId, LINE_SIZE},
    cache::Cache,
    completion::{dispatch, dispatch_after, join, Completer, Completion},
    reaper::Request,
    view::View,
    Error, File, Priority,
};
use commonware_runtime::Spawner;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use tracing::{debug, error, trace, warn};

const LINE_SIZE_U64: u64 = LINE_SIZE as u64;

/// Mapping of lines to slots.
#[derive(Default)]
struct Lines {
    slots: Vec<SlotId>,
    pending: Vec<Option<Completion>>,
    tasks: Vec<Completion>,
    count: Option<usize>,
}

impl Lines {
    /// Grow the table so that it covers `last`.
    fn ensure(&mut self, last: LineId) {
        let len = last.index() as usize + 1;
        if self.slots.len() < len {
            self.slots.resize(len, SlotId::INVALID);
            self.pending.resize(len, None);
        }
    }

    /// Returns the slot `line` occupies and the completion of its most recent read.
    fn get(&self, line: LineId) -> (SlotId, Option<Completion>) {
        let index = line.index() as usize;
        (self.slots[index], self.pending[index].clone())
    }

    fn assign(&mut self, line: LineId, slot: SlotId, completion: Completion) {
        let index = line.index() as usize;
        self.slots[index] = slot;
        self.pending[index] = Some(completion);
    }

    /// Track a background task so the session can wait for it before closing.
    fn track(&mut self, task: Completion) {
        self.tasks.retain(|task| !task.is_complete());
        self.tasks.push(task);
    }
}

/// Line table shared with the arena, which notifies it of evictions.
struct Table {
    id: u64,
    lines: Mutex<Lines>,
}

impl Evict for Table {
    fn evict(&self, line: LineId) {
        let mut lines = self.lines.lock().unwrap();
        let index = line.index() as usize;
        if index >= lines.slots.len() {
            return;
        }
        if let Some(completion) = lines.pending[index].take() {
            assert!(
                completion.is_complete(),
                "evicted line {line} with a read in flight"
            );
        }
        lines.slots[index] = SlotId::INVALID;
        trace!(session = self.id, %line, "line evicted");
    }
}

/// Cached, asynchronous reads of a single file.
///
/// Sessions are created with [Cache::open] or [Cache::session] and should be finished with
/// [Session::close], which waits for outstanding reads, releases every unpinned line, and closes
/// the file.
pub struct Session<F: File, S: Spawner> {
    cache: Cache<S>,
    file: F,
    table: Arc<Table>,
    size: Arc<OnceLock<u64>>,
    size_query: Completion,
    closed: bool,
}

impl<F: File, S: Spawner> Session<F, S> {
    pub(crate) fn new(cache: Cache<S>, id: u64, file: F) -> Self {
        let size = Arc::new(OnceLock::new());
        let size_query = dispatch(&cache.spawner, {
            let file = file.clone();
            let size = size.clone();
            async move {
                match file.size().await {
                    Ok(len) => {
                        let _ = size.set(len);
                        debug!(session = id, size = len, "resolved file size");
                        Ok(())
                    }
                    Err(err) => {
                        error!(session = id, ?err, "failed to query file size");
                        Err(err)
                    }
                }
            }
        });
        Self {
            cache,
            file,
            table: Arc::new(Table {
                id,
                lines: Mutex::new(Lines::default()),
            }),
            size,
            size_query,
            closed: false,
        }
    }

    /// Size of the file, if it is already known.
    pub fn size(&self) -> Option<u64> {
        self.size.get().copied()
    }

    /// Wait for the size query issued when the session started and return the file size.
    pub async fn wait_size(&self) -> Result<u64, Error> {
        let _ = self.size_query.clone().await;
        self.size().ok_or(Error::SizeUnavailable)
    }

    /// Number of lines currently occupying a slot.
    pub fn resident(&self) -> usize {
        let lines = self.table.lines.lock().unwrap();
        let resident = lines.slots.iter().filter(|slot| slot.is_valid()).count();
        resident
    }

    /// Read `len` bytes starting at `offset`.
    ///
    /// Returns a [View] over the requested bytes along with the completions that must resolve
    /// before it can be read (empty if every line was already resident). If the arena lacks enough
    /// free slots to hold every line of the range, the read bypasses the arena and the returned
    /// view is backed by a private buffer instead.
    ///
    /// Fails with [Error::OutOfRange] if the file size is known and the range extends beyond it.
    /// If the size is not yet known, one of the returned completions fails instead once the size
    /// shows the range to extend beyond the end of the file.
    pub fn read(
        &self,
        offset: u64,
        len: usize,
        priority: Priority,
    ) -> Result<(View, Vec<Completion>), Error> {
        let arena = &self.cache.arena;
        let mut slots = arena.lock();
        self.resolve();
        let size = self.size();
        self.validate(size, offset, len as u64)?;
        if len == 0 {
            let bounds = self.bounds(size, offset, 0);
            let dependencies = unresolved([&bounds]);
            let view = View::cached(arena.clone(), Vec::new(), bounds, 0, 0);
            return Ok((view, dependencies));
        }
        let first = LineId::containing(offset);
        let last = LineId::containing(offset + len as u64 - 1);

        // Lines without a locked slot each take one slot off the free list.
        let needed = {
            let mut lines = self.table.lines.lock().unwrap();
            lines.ensure(last);
            let needed = LineId::range(first, last)
                .filter(|&line| {
                    let (slot, _) = lines.get(line);
                    !slot.is_valid() || !slots.is_locked(slot)
                })
                .count();
            needed
        };
        if needed > slots.free() {
            let free = slots.free();
            drop(slots);
            debug!(
                session = self.table.id,
                offset, len, needed, free, "insufficient free slots, reading uncached"
            );
            arena.metrics.uncached.inc();
            return Ok(self.read_uncached(offset, len, priority));
        }

        // Pin resident lines before acquiring slots for missing ones, so that no acquisition
        // evicts a line of the same range.
        let mut pinned = Vec::with_capacity((last.index() - first.index()) as usize + 1);
        let mut missing = Vec::new();
        for line in LineId::range(first, last) {
            let (slot, pending) = self.table.lines.lock().unwrap().get(line);
            if !slot.is_valid() {
                missing.push(pinned.len());
                pinned.push((slot, None));
                continue;
            }
            slots.lock(slot);
            let completion = match pending {
                // Drained after a successful read.
                None => {
                    arena.metrics.hits.inc();
                    Completion::ready(true)
                }
                Some(completion) if !completion.failed() => {
                    arena.metrics.hits.inc();
                    completion
                }
                Some(_) => {
                    arena.metrics.misses.inc();
                    slots.lock(slot);
                    self.populate(slot, line, priority)
                }
            };
            pinned.push((slot, Some(completion)));
        }
        for index in missing {
            let line = LineId::new(first.index() + index as u32);
            arena.metrics.misses.inc();
            let slot = slots.acquire(self.owner(), line);
            slots.lock(slot);
            pinned[index] = (slot, Some(self.populate(slot, line, priority)));
        }
        let bounds = self.bounds(size, offset, len as u64);
        drop(slots);

        let pinned: Vec<(SlotId, Completion)> = pinned
            .into_iter()
            .filter_map(|(slot, completion)| Some((slot, completion?)))
            .collect();
        let dependencies = unresolved(
            pinned
                .iter()
                .map(|(_, completion)| completion)
                .chain([&bounds]),
        );
        trace!(
            session = self.table.id,
            offset,
            len,
            lines = pinned.len(),
            dependencies = dependencies.len(),
            "read"
        );
        let start = (offset % LINE_SIZE_U64) as usize;
        let view = View::cached(arena.clone(), pinned, bounds, start, len);
        Ok((view, dependencies))
    }

    /// Start populating every line touched by `entries` (pairs of offset and length, sorted and
    /// non-overlapping) until the arena runs out of free slots.
    ///
    /// Lines that are already resident or being read are skipped (and count as recently used).
    /// Returns a completion that resolves once every read this call started has finished (and
    /// released its slot), or `None` if no work remains outstanding.
    pub fn preload(
        &self,
        entries: &[(u64, usize)],
        priority: Priority,
    ) -> Result<Option<Completion>, Error> {
        for pair in entries.windows(2) {
            let (offset, len) = pair[0];
            assert!(
                offset.saturating_add(len as u64) <= pair[1].0,
                "preload entries must be sorted and non-overlapping"
            );
        }

        let arena = &self.cache.arena;
        let mut slots = arena.lock();
        self.resolve();
        let size = self.size();
        for &(offset, len) in entries {
            self.validate(size, offset, len as u64)?;
        }

        // Pin resident lines for the duration of the call, so that no slot acquired for a missing
        // line evicts one of them.
        let mut resident = Vec::new();
        let mut missing = Vec::new();
        let mut previous = None;
        for &(offset, len) in entries {
            if len == 0 {
                continue;
            }
            let first = LineId::containing(offset);
            let last = LineId::containing(offset + len as u64 - 1);
            let mut lines = self.table.lines.lock().unwrap();
            lines.ensure(last);
            for line in LineId::range(first, last) {
                if previous == Some(line) {
                    continue;
                }
                previous = Some(line);
                let (slot, pending) = lines.get(line);
                if !slot.is_valid() || pending.as_ref().is_some_and(Completion::failed) {
                    missing.push((line, slot));
                } else if !slots.is_locked(slot) {
                    slots.lock(slot);
                    resident.push(slot);
                }
            }
        }

        let mut acquired = Vec::new();
        let mut reads = Vec::new();
        for (line, slot) in missing {
            // A failed line keeps its slot, which only needs a free slot if nothing pins it.
            let retry = slot.is_valid();
            if !(retry && slots.is_locked(slot)) && slots.free() == 0 {
                debug!(
                    session = self.table.id,
                    %line,
                    "no free slots, truncating preload"
                );
                break;
            }
            let slot = if retry {
                slots.lock(slot);
                slot
            } else {
                slots.acquire(self.owner(), line)
            };
            slots.lock(slot);
            reads.push(self.populate(slot, line, priority));
            acquired.push(slot);
            arena.metrics.preloaded.inc();
        }
        for slot in resident {
            slots.unlock(slot);
        }

        if acquired.is_empty() {
            return Ok(None);
        }
        if reads.iter().all(Completion::is_complete) {
            for slot in acquired {
                slots.unlock(slot);
            }
            return Ok(None);
        }
        drop(slots);

        debug!(
            session = self.table.id,
            lines = acquired.len(),
            "preloading"
        );
        let release = dispatch(&self.cache.spawner, {
            let arena = arena.clone();
            let reads = join(reads);
            async move {
                let result = reads.await;
                let mut slots = arena.lock();
                for slot in acquired {
                    slots.unlock(slot);
                }
                result
            }
        });
        self.table.lines.lock().unwrap().track(release.clone());
        Ok(Some(release))
    }

    /// Wait for every read this session has started, then drop the bookkeeping of those that
    /// succeeded.
    pub async fn wait_all(&self) {
        let outstanding: Vec<_> = {
            let lines = self.table.lines.lock().unwrap();
            let outstanding = lines
                .pending
                .iter()
                .flatten()
                .chain(lines.tasks.iter())
                .cloned()
                .collect();
            outstanding
        };
        let _ = join(outstanding).await;

        let mut lines = self.table.lines.lock().unwrap();
        for pending in lines.pending.iter_mut() {
            if pending.as_ref().is_some_and(Completion::succeeded) {
                *pending = None;
            }
        }
        lines.tasks.retain(|task| !task.is_complete());
    }

    /// Wait for outstanding reads, evict every unpinned line, and close the file.
    ///
    /// Lines still pinned by live views stay in the arena until those views are dropped and the
    /// slots are reused.
    pub async fn close(mut self) -> Result<(), Error> {
        self.closed = true;
        let id = self.table.id;
        let _ = self.size_query.clone().await;
        self.wait_all().await;

        if !self.cache.arena.lock().evict_all(Some(id)) {
            debug!(session = id, "pinned lines remain after close");
        }
        self.cache.reaper.flush();
        debug!(session = id, "closed session");
        self.file.clone().close().await
    }

    fn owner(&self) -> Owner {
        let handle: Weak<dyn Evict> = Arc::downgrade(&self.table) as Weak<dyn Evict>;
        Owner {
            id: self.table.id,
            handle,
        }
    }

    /// Once the file size is known, size the line table to match it.
    fn resolve(&self) {
        let mut lines = self.table.lines.lock().unwrap();
        if lines.count.is_some() {
            return;
        }
        let Some(&size) = self.size.get() else {
            return;
        };
        let count = size.div_ceil(LINE_SIZE_U64);
        assert!(count < u32::MAX as u64, "file too large: {size}");
        let count = count as usize;
        lines.count = Some(count);
        if lines.slots.len() <= count {
            lines.slots.resize(count, SlotId::INVALID);
            lines.pending.resize(count, None);
            return;
        }
        while lines.slots.len() > count && !lines.slots[lines.slots.len() - 1].is_valid() {
            lines.slots.pop();
            lines.pending.pop();
        }
        if lines.slots.len() > count {
            warn!(
                session = self.table.id,
                lines = count,
                mapped = lines.slots.len(),
                "lines mapped beyond end of file"
            );
        }
    }

    /// Reject ranges that extend beyond the end of the file, if its `size` is known.
    fn validate(&self, size: Option<u64>, offset: u64, len: u64) -> Result<(), Error> {
        match (offset.checked_add(len), size) {
            (Some(end), Some(size)) if end <= size => Ok(()),
            (Some(_), None) => Ok(()),
            (_, size) => Err(Error::OutOfRange {
                offset,
                len,
                size: size.unwrap_or(u64::MAX),
            }),
        }
    }

    /// Returns a completion that fails if the range turns out to extend beyond the end of the
    /// file once its size is known.
    ///
    /// Ranges validated against a known `size` resolve immediately.
    fn bounds(&self, size: Option<u64>, offset: u64, len: u64) -> Completion {
        if size.is_some() {
            return Completion::ready(true);
        }
        let id = self.table.id;
        let size = self.size.clone();
        dispatch_after(&self.cache.spawner, self.size_query.clone(), async move {
            let size = *size.get().ok_or(Error::SizeUnavailable)?;
            check_range(id, size, offset, len)
        })
    }

    /// Schedule a read of `line` into `slot` and record it as the line's most recent read.
    ///
    /// The caller must hold the arena lock and a lock on `slot` that the read releases once it
    /// finishes.
    fn populate(&self, slot: SlotId, line: LineId, priority: Priority) -> Completion {
        let (completer, completion) = Completer::new();
        let id = self.table.id;
        let task = dispatch_after(&self.cache.spawner, self.size_query.clone(), {
            let arena = self.cache.arena.clone();
            let reaper = self.cache.reaper.clone();
            let file = self.file.clone();
            let size = self.size.clone();
            let completion = completion.clone();
            async move {
                let result: Result<Vec<u8>, Error> = async {
                    let size = *size.get().ok_or(Error::SizeUnavailable)?;
                    let len = line.size_within(size);
                    if len == 0 {
                        return Err(Error::OutOfRange {
                            offset: line.offset(),
                            len: line.size(),
                            size,
                        });
                    }
                    let buf = file
                        .read_at(reaper.buffer(len as usize), line.offset(), priority)
                        .await?;
                    arena.fill(slot, &buf);
                    Ok(buf)
                }
                .await;

                let buffer = match result {
                    Ok(buf) => {
                        trace!(session = id, %line, %slot, "populated line");
                        completer.complete(true);
                        Some(buf)
                    }
                    Err(err) => {
                        error!(session = id, %line, ?err, "failed to read line");
                        completer.complete(false);
                        None
                    }
                };
                arena.lock().unlock(slot);
                reaper.push(Request::new(completion, buffer));
                Ok(())
            }
        });

        let mut lines = self.table.lines.lock().unwrap();
        lines.assign(line, slot, completion.clone());
        lines.track(task);
        completion
    }

    fn read_uncached(&self, offset: u64, len: usize, priority: Priority) -> (View, Vec<Completion>) {
        let result = Arc::new(Mutex::new(None));
        let id = self.table.id;
        let completion = dispatch_after(&self.cache.spawner, self.size_query.clone(), {
            let file = self.file.clone();
            let size = self.size.clone();
            let result = result.clone();
            async move {
                let size = *size.get().ok_or(Error::SizeUnavailable)?;
                check_range(id, size, offset, len as u64)?;
                match file.read_at(vec![0; len], offset, priority).await {
                    Ok(buf) => {
                        *result.lock().unwrap() = Some(buf);
                        Ok(())
                    }
                    Err(err) => {
                        error!(session = id, offset, len, ?err, "failed uncached read");
                        Err(err)
                    }
                }
            }
        });
        self.table.lines.lock().unwrap().track(completion.clone());
        (
            View::uncached(completion.clone(), result, len),
            vec![completion],
        )
    }
}

/// Fail if `offset + len` extends beyond a file of `size` bytes.
fn check_range(session: u64, size: u64, offset: u64, len: u64) -> Result<(), Error> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => {
            warn!(session, offset, len, size, "read extends beyond end of file");
            Err(Error::OutOfRange { offset, len, size })
        }
    }
}

/// Clones of the `completions` that have not resolved yet.
fn unresolved<'a>(completions: impl IntoIterator<Item = &'a Completion>) -> Vec<Completion> {
    completions
        .into_iter()
        .filter(|completion| !completion.is_complete())
        .cloned()
        .collect()
}

impl<F: File, S: Spawner> Drop for Session<F, S> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        warn!(session = self.table.id, "session dropped without close");
        self.cache.arena.lock().evict_all(Some(self.table.id));
    }
}
