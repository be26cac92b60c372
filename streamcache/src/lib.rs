//! Cache fixed-size lines of large files in a shared slot arena.
//!
//! A [Cache] owns a single, fixed-capacity arena of [LINE_SIZE] slots that is shared by every
//! [Session] opened through it. Sessions map byte ranges of one file onto lines, populate missing
//! lines with asynchronous reads, and hand back [View]s that pin the slots they reference until
//! dropped. Unpinned slots are recycled in least-recently-unpinned order.
//!
//! # Collaborators
//!
//! The cache does not perform I/O or scheduling itself. Background work runs on a runtime context
//! ([commonware_runtime::Spawner], with metrics registered through [commonware_runtime::Metrics])
//! and files are opened through a [Storage]. The [fs] module reads files from the local filesystem and [mocks]
//! provides in-memory files for testing.
//!
//! # Example
//!
//! ```rust
//! use commonware_runtime::{deterministic, Runner};
//! use streamcache::{completion::join, mocks, Cache, Config, Priority};
//!
//! let executor = deterministic::Runner::default();
//! executor.start(|context| async move {
//!     let cache = Cache::new(context, Config::default());
//!
//!     let storage = mocks::Storage::default();
//!     storage.insert("data.bin", vec![7u8; 100_000]);
//!     let session = cache.open(&storage, "data.bin").await.unwrap();
//!
//!     let (view, dependencies) = session.read(0, 100_000, Priority::Normal).unwrap();
//!     join(dependencies).await.unwrap();
//!     assert_eq!(view.to_vec(), vec![7u8; 100_000]);
//!
//!     drop(view);
//!     session.close().await.unwrap();
//! });
//! ```
//!
//! # Status
//!
//! `streamcache` is **ALPHA** software and is not yet recommended for production use. Developers
//! should expect breaking changes and occasional instability.

use std::{future::Future, io::Error as IoError, path::Path};
use thiserror::Error;

mod arena;
pub mod block;
mod cache;
pub mod completion;
pub mod fs;
pub mod mocks;
mod reaper;
mod session;
mod view;

pub use block::{LineId, SlotId, LINE_SIZE};
pub use cache::{Cache, Config};
pub use completion::{Completer, Completion};
pub use session::Session;
pub use view::{Reader, View};

/// Errors that can occur when interacting with the cache.
#[derive(Error, Debug)]
pub enum Error {
    #[error("open failed: {0} error: {1}")]
    OpenFailed(String, IoError),
    #[error("read failed")]
    ReadFailed,
    #[error("file size unavailable")]
    SizeUnavailable,
    #[error("range out of bounds: offset={offset} len={len} size={size}")]
    OutOfRange { offset: u64, len: u64, size: u64 },
    #[error("closed")]
    Closed,
    #[error("io error: {0}")]
    Io(#[from] IoError),
}

/// Urgency hint forwarded to the [File] for each read the cache issues.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// Interface to open files for cached reading.
pub trait Storage: Clone + Send + Sync + 'static {
    /// The readable file handle opened by this [Storage].
    type File: File;

    /// Open the file at `path` for reading.
    fn open(&self, path: &Path) -> impl Future<Output = Result<Self::File, Error>> + Send;
}

/// Interface to read from a file.
///
/// Cloning a file is similar to sharing a single file descriptor: all clones refer to the same
/// underlying handle and [File::close] closes it for every clone.
#[allow(clippy::len_without_is_empty)]
pub trait File: Clone + Send + Sync + 'static {
    /// Return the current size of the file in bytes.
    fn size(&self) -> impl Future<Output = Result<u64, Error>> + Send;

    /// Read `buf.len()` bytes starting at `offset` into `buf`.
    ///
    /// `read_at` does not return the number of bytes read because it only returns once the
    /// entire buffer has been filled. Ownership of the filled buffer transfers to the caller.
    fn read_at(
        &self,
        buf: Vec<u8>,
        offset: u64,
        priority: Priority,
    ) -> impl Future<Output = Result<Vec<u8>, Error>> + Send;

    /// Close the file. No reads may be in flight when this is called.
    fn close(self) -> impl Future<Output = Result<(), Error>> + Send;
}
