use crate::{
    arena::{Arena, Metrics as ArenaMetrics},
    reaper::Reaper,
    session::Session,
    Error, File, Storage,
};
use commonware_runtime::{Metrics, Spawner};
use std::{
    num::NonZeroUsize,
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tracing::{debug, info};

/// Configuration for a [Cache].
#[derive(Clone, Debug)]
pub struct Config {
    /// Number of [crate::LINE_SIZE] slots in the shared arena.
    ///
    /// The arena is allocated in full when the cache is created.
    pub slots: NonZeroUsize,

    /// Number of finished reads to accumulate before reclaiming them in the background.
    pub reap_batch: NonZeroUsize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            slots: NonZeroUsize::new(256).unwrap(),
            reap_batch: NonZeroUsize::new(32).unwrap(),
        }
    }
}

impl Config {
    /// Total bytes of slot memory a cache with this configuration allocates.
    pub const fn size_bytes(&self) -> u64 {
        (self.slots.get() * crate::LINE_SIZE) as u64
    }
}

/// A shared arena of slots and the sessions reading through it.
///
/// Cloning a [Cache] is cheap and every clone refers to the same arena.
#[derive(Clone)]
pub struct Cache<S: Spawner> {
    pub(crate) spawner: S,
    pub(crate) arena: Arc<Arena>,
    pub(crate) reaper: Reaper<S>,
    next_id: Arc<AtomicU64>,
}

impl<S: Spawner + Metrics> Cache<S> {
    /// Allocate the arena described by `cfg` and register the cache's metrics with `context`.
    ///
    /// Reads, size queries and reclamation of finished requests are spawned on `context`.
    pub fn new(context: S, cfg: Config) -> Self {
        let metrics = ArenaMetrics::init(&context);
        let arena = Arc::new(Arena::new(cfg.slots, metrics));
        info!(
            slots = cfg.slots.get(),
            bytes = cfg.size_bytes(),
            "initialized cache"
        );
        Self {
            reaper: Reaper::new(context.clone(), cfg.reap_batch),
            spawner: context,
            arena,
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Open the file at `path` in `storage` and start a [Session] over it.
    pub async fn open<T: Storage>(
        &self,
        storage: &T,
        path: impl AsRef<Path>,
    ) -> Result<Session<T::File, S>, Error> {
        let file = storage.open(path.as_ref()).await?;
        Ok(self.session(file))
    }

    /// Start a [Session] over an already opened `file`.
    ///
    /// The session takes ownership of `file` and closes it in [Session::close].
    pub fn session<F: File>(&self, file: F) -> Session<F, S> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        Session::new(self.clone(), id, file)
    }

    /// Evict every unpinned line of every session.
    ///
    /// Returns false if some lines could not be evicted because they are pinned.
    pub fn evict_all(&self) -> bool {
        let evicted = self.arena.lock().evict_all(None);
        debug!(evicted, "evicted all lines");
        evicted
    }

    /// Total bytes of slot memory.
    pub fn size_bytes(&self) -> u64 {
        self.arena.size_bytes()
    }

    /// Number of slots in the arena.
    pub fn capacity(&self) -> usize {
        self.arena.capacity()
    }

    /// Number of slots not pinned by any view or read.
    pub fn free_slots(&self) -> usize {
        self.arena.lock().free()
    }
}
