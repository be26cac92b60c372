//! In-memory collaborators for testing.
//!
//! Files created with [Storage::insert] record every read issued against them and can hold back
//! reads (or size queries) until the test releases them, which makes otherwise racy interleavings
//! deterministic.

use crate::{Error, Priority};
use async_lock::{RwLock, RwLockWriteGuardArc};
use std::{
    collections::HashMap,
    io::{Error as IoError, ErrorKind},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

/// Holds back reads (or size queries) of a [File] until dropped.
pub type Hold = RwLockWriteGuardArc<()>;

/// A read issued against a [File].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Request {
    pub offset: u64,
    pub len: usize,
    pub priority: Priority,
}

struct State {
    data: Vec<u8>,
    reads: Arc<RwLock<()>>,
    sizes: Arc<RwLock<()>>,
    requests: Mutex<Vec<Request>>,
    in_flight: AtomicUsize,
    fail: AtomicBool,
    closed: AtomicBool,
}

/// An in-memory [crate::Storage].
#[derive(Clone, Default)]
pub struct Storage {
    files: Arc<Mutex<HashMap<PathBuf, File>>>,
}

impl Storage {
    /// Create (or replace) the file at `path` with `data`, returning a handle to inspect it.
    pub fn insert(&self, path: impl AsRef<Path>, data: Vec<u8>) -> File {
        let file = File {
            state: Arc::new(State {
                data,
                reads: Arc::new(RwLock::new(())),
                sizes: Arc::new(RwLock::new(())),
                requests: Mutex::new(Vec::new()),
                in_flight: AtomicUsize::new(0),
                fail: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
        };
        self.files
            .lock()
            .unwrap()
            .insert(path.as_ref().to_path_buf(), file.clone());
        file
    }
}

impl crate::Storage for Storage {
    type File = File;

    async fn open(&self, path: &Path) -> Result<File, Error> {
        self.files
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| {
                Error::OpenFailed(
                    path.to_string_lossy().to_string(),
                    IoError::from(ErrorKind::NotFound),
                )
            })
    }
}

/// An in-memory [crate::File].
#[derive(Clone)]
pub struct File {
    state: Arc<State>,
}

impl File {
    /// Hold back all reads until the returned guard is dropped.
    ///
    /// # Panics
    ///
    /// Panics if reads are already held.
    pub fn hold_reads(&self) -> Hold {
        self.state
            .reads
            .try_write_arc()
            .expect("reads already held")
    }

    /// Hold back all size queries until the returned guard is dropped.
    ///
    /// # Panics
    ///
    /// Panics if size queries are already held.
    pub fn hold_size(&self) -> Hold {
        self.state
            .sizes
            .try_write_arc()
            .expect("size queries already held")
    }

    /// Make every subsequent read fail (or succeed again).
    pub fn fail_reads(&self, fail: bool) {
        self.state.fail.store(fail, Ordering::SeqCst);
    }

    /// Every read issued so far, in the order issued.
    pub fn requests(&self) -> Vec<Request> {
        self.state.requests.lock().unwrap().clone()
    }

    /// Number of reads that have started but not finished.
    pub fn in_flight(&self) -> usize {
        self.state.in_flight.load(Ordering::SeqCst)
    }

    /// Returns true once [crate::File::close] has been called.
    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }
}

/// Decrements the in-flight count when a read finishes, however it finishes.
struct Tracker<'a>(&'a AtomicUsize);

impl<'a> Tracker<'a> {
    fn new(count: &'a AtomicUsize) -> Self {
        count.fetch_add(1, Ordering::SeqCst);
        Self(count)
    }
}

impl Drop for Tracker<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl crate::File for File {
    async fn size(&self) -> Result<u64, Error> {
        let _permit = self.state.sizes.read().await;
        Ok(self.state.data.len() as u64)
    }

    async fn read_at(
        &self,
        mut buf: Vec<u8>,
        offset: u64,
        priority: Priority,
    ) -> Result<Vec<u8>, Error> {
        let _tracker = Tracker::new(&self.state.in_flight);
        self.state.requests.lock().unwrap().push(Request {
            offset,
            len: buf.len(),
            priority,
        });

        let _permit = self.state.reads.read().await;
        if self.state.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        if self.state.fail.load(Ordering::SeqCst) {
            return Err(Error::ReadFailed);
        }
        let start = usize::try_from(offset).map_err(|_| Error::ReadFailed)?;
        let end = start.checked_add(buf.len()).ok_or(Error::ReadFailed)?;
        let data = self.state.data.get(start..end).ok_or(Error::ReadFailed)?;
        buf.copy_from_slice(data);
        Ok(buf)
    }

    async fn close(self) -> Result<(), Error> {
        assert_eq!(self.in_flight(), 0, "file closed with reads in flight");
        self.state.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{File as _, Storage as _};
    use futures::{executor::block_on, FutureExt};

    #[test]
    fn test_read_and_record() {
        let storage = Storage::default();
        let handle = storage.insert("a", (0..100u8).collect());
        let file = block_on(storage.open(Path::new("a"))).unwrap();
        assert_eq!(block_on(file.size()).unwrap(), 100);

        let buf = block_on(file.read_at(vec![0; 4], 10, Priority::High)).unwrap();
        assert_eq!(buf, vec![10, 11, 12, 13]);
        assert_eq!(
            handle.requests(),
            vec![Request {
                offset: 10,
                len: 4,
                priority: Priority::High
            }]
        );
        assert!(block_on(file.read_at(vec![0; 4], 98, Priority::Low)).is_err());

        block_on(file.close()).unwrap();
        assert!(handle.is_closed());
    }

    #[test]
    fn test_hold_reads() {
        let storage = Storage::default();
        let file = storage.insert("a", vec![1; 10]);
        let hold = file.hold_reads();

        let mut read = Box::pin(file.read_at(vec![0; 2], 0, Priority::Normal));
        assert!(read.as_mut().now_or_never().is_none());
        assert_eq!(file.in_flight(), 1);

        drop(hold);
        assert_eq!(block_on(read).unwrap(), vec![1, 1]);
        assert_eq!(file.in_flight(), 0);
    }

    #[test]
    fn test_fail_reads() {
        let storage = Storage::default();
        let file = storage.insert("a", vec![1; 10]);
        file.fail_reads(true);
        assert!(block_on(file.read_at(vec![0; 2], 0, Priority::Normal)).is_err());
        file.fail_reads(false);
        assert!(block_on(file.read_at(vec![0; 2], 0, Priority::Normal)).is_ok());
    }

    #[test]
    fn test_open_missing() {
        let storage = Storage::default();
        assert!(matches!(
            block_on(storage.open(Path::new("missing"))),
            Err(Error::OpenFailed(_, _))
        ));
    }
}
