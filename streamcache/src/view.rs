//! Read-only windows over the bytes returned by [crate::Session::read].

use crate::{
    arena::Arena,
    block::{SlotId, LINE_SIZE},
    completion::Completion,
};
use bytes::Buf;
use std::sync::{Arc, Mutex, OnceLock};

/// A window over `len` bytes of a file.
///
/// A view only becomes readable once every dependency returned alongside it has resolved
/// successfully. Reading a view whose data is not ready panics, as does reading a view that
/// turned out to extend beyond the end of its file.
///
/// A cached view pins the slots it spans until it is dropped. An uncached view (returned when the
/// arena lacked free slots) owns a private buffer instead.
pub struct View {
    kind: Kind,
}

enum Kind {
    Cached(Cached),
    Uncached(Uncached),
}

struct Cached {
    arena: Arc<Arena>,
    lines: Vec<(SlotId, Completion)>,
    bounds: Completion,
    start: usize,
    len: usize,
}

impl Cached {
    fn read(&self, offset: usize, len: usize) -> &[u8] {
        if len == 0 {
            return &[];
        }
        assert!(
            self.bounds.succeeded(),
            "view of {} bytes is not ready to be read (range unchecked or beyond end of file)",
            self.len
        );
        let absolute = self.start + offset;
        let within = absolute % LINE_SIZE;
        let len = len.min(LINE_SIZE - within);
        let (slot, completion) = &self.lines[absolute / LINE_SIZE];
        assert!(
            completion.succeeded(),
            "line in slot {slot} is not ready to be read"
        );
        &self.arena.memory(*slot)[within..within + len]
    }
}

impl Drop for Cached {
    fn drop(&mut self) {
        if self.lines.is_empty() {
            return;
        }
        let mut slots = self.arena.lock();
        for (slot, _) in self.lines.drain(..) {
            slots.unlock(slot);
        }
    }
}

struct Uncached {
    completion: Completion,
    result: Arc<Mutex<Option<Vec<u8>>>>,
    data: OnceLock<Vec<u8>>,
    len: usize,
}

impl Uncached {
    fn buffer(&self) -> &[u8] {
        self.data.get_or_init(|| {
            if let Err(err) = self.completion.wait() {
                panic!("uncached read is not ready to be read: {err}");
            }
            self.result
                .lock()
                .unwrap()
                .take()
                .expect("uncached read resolved without a buffer")
        })
    }
}

impl View {
    /// A view over `lines`, readable once each line's completion and `bounds` (which fails if the
    /// range extends beyond the end of the file) have succeeded.
    pub(crate) fn cached(
        arena: Arc<Arena>,
        lines: Vec<(SlotId, Completion)>,
        bounds: Completion,
        start: usize,
        len: usize,
    ) -> Self {
        debug_assert!(start < LINE_SIZE || lines.is_empty());
        Self {
            kind: Kind::Cached(Cached {
                arena,
                lines,
                bounds,
                start,
                len,
            }),
        }
    }

    pub(crate) fn uncached(
        completion: Completion,
        result: Arc<Mutex<Option<Vec<u8>>>>,
        len: usize,
    ) -> Self {
        Self {
            kind: Kind::Uncached(Uncached {
                completion,
                result,
                data: OnceLock::new(),
                len,
            }),
        }
    }

    /// Number of bytes in the view.
    pub fn len(&self) -> usize {
        match &self.kind {
            Kind::Cached(cached) => cached.len,
            Kind::Uncached(uncached) => uncached.len,
        }
    }

    /// Returns true if the view spans no bytes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if the view references slots of the shared arena.
    pub fn is_cached(&self) -> bool {
        matches!(self.kind, Kind::Cached(_))
    }

    /// Returns up to `len` contiguous bytes starting at `offset` (relative to the start of the
    /// view).
    ///
    /// The returned slice may be shorter than requested: it ends at the end of the view or at the
    /// next line boundary, whichever comes first. Callers wanting more continue from
    /// `offset + returned.len()`.
    ///
    /// # Panics
    ///
    /// Panics if `offset` is beyond the end of the view or the view's data is not ready.
    pub fn read(&self, offset: usize, len: usize) -> &[u8] {
        let total = self.len();
        assert!(
            offset <= total,
            "offset {offset} beyond view of {total} bytes"
        );
        let len = len.min(total - offset);
        match &self.kind {
            Kind::Cached(cached) => cached.read(offset, len),
            Kind::Uncached(uncached) => {
                if len == 0 {
                    return &[];
                }
                &uncached.buffer()[offset..offset + len]
            }
        }
    }

    /// Returns a [Buf] over the bytes of the view.
    pub fn reader(&self) -> Reader<'_> {
        Reader {
            view: self,
            position: 0,
        }
    }

    /// Copy the bytes of the view into a new vector.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut data = vec![0; self.len()];
        self.reader().copy_to_slice(&mut data);
        data
    }
}

/// A [Buf] over the bytes of a [View].
pub struct Reader<'a> {
    view: &'a View,
    position: usize,
}

impl Buf for Reader<'_> {
    fn remaining(&self) -> usize {
        self.view.len() - self.position
    }

    fn chunk(&self) -> &[u8] {
        self.view.read(self.position, self.remaining())
    }

    fn advance(&mut self, cnt: usize) {
        assert!(cnt <= self.remaining(), "advance beyond end of view");
        self.position += cnt;
    }
}
