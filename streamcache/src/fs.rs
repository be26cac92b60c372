//! Files on the local filesystem.
//!
//! Reads run on [Tokio](https://tokio.rs)'s blocking thread pool, so files must be read from
//! within a Tokio-backed runtime (such as [commonware_runtime::tokio::Runner]).
//!
//! # Example
//!
//! ```rust
//! use commonware_runtime::{tokio, Runner};
//! use streamcache::{fs::Storage, Cache, Config};
//!
//! let executor = tokio::Runner::default();
//! executor.start(|context| async move {
//!     let cache = Cache::new(context, Config::default());
//!     let storage = Storage::new(std::env::temp_dir());
//!     assert!(cache.open(&storage, "streamcache-missing-file").await.is_err());
//! });
//! ```

use crate::{Error, Priority};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{fs, task};
use tracing::trace;

/// A [crate::Storage] that opens files relative to a root directory.
#[derive(Clone, Debug)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Default for Storage {
    fn default() -> Self {
        Self::new(".")
    }
}

impl crate::Storage for Storage {
    type File = File;

    async fn open(&self, path: &Path) -> Result<File, Error> {
        let path = self.root.join(path);
        let file = fs::File::open(&path)
            .await
            .map_err(|e| Error::OpenFailed(path.to_string_lossy().to_string(), e))?;
        trace!(path = %path.display(), "opened file");
        Ok(File {
            path: path.to_string_lossy().into(),
            file: Arc::new(file.into_std().await),
        })
    }
}

/// A read-only handle to a file on the local filesystem.
///
/// Reads are serviced by the blocking thread pool in submission order. [Priority] is accepted but
/// not used to reorder them.
#[derive(Clone)]
pub struct File {
    path: Arc<str>,
    file: Arc<std::fs::File>,
}

impl crate::File for File {
    async fn size(&self) -> Result<u64, Error> {
        let file = self.file.clone();
        let metadata = task::spawn_blocking(move || file.metadata())
            .await
            .map_err(|_| Error::SizeUnavailable)??;
        Ok(metadata.len())
    }

    async fn read_at(
        &self,
        mut buf: Vec<u8>,
        offset: u64,
        _priority: Priority,
    ) -> Result<Vec<u8>, Error> {
        let file = self.file.clone();
        task::spawn_blocking(move || {
            #[cfg(unix)]
            {
                use std::os::unix::fs::FileExt;
                file.read_exact_at(&mut buf, offset)
                    .map_err(|_| Error::ReadFailed)?;
            }
            #[cfg(windows)]
            {
                use std::os::windows::fs::FileExt;
                let mut read = 0;
                while read < buf.len() {
                    let n = file
                        .seek_read(&mut buf[read..], offset + read as u64)
                        .map_err(|_| Error::ReadFailed)?;
                    if n == 0 {
                        return Err(Error::ReadFailed);
                    }
                    read += n;
                }
            }
            Ok(buf)
        })
        .await
        .map_err(|_| Error::ReadFailed)?
    }

    async fn close(self) -> Result<(), Error> {
        trace!(path = %self.path, "closed file");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{completion::join, Cache, Config, File as _, Storage as _};
    use commonware_macros::test_traced;
    use commonware_runtime::{tokio as runtime, Runner};

    /// Write `data` to a uniquely named scratch file and return its directory and name.
    fn scratch(name: &str, data: &[u8]) -> (PathBuf, String) {
        let dir = std::env::temp_dir();
        let name = format!("streamcache-{}-{name}", std::process::id());
        std::fs::write(dir.join(&name), data).unwrap();
        (dir, name)
    }

    #[test_traced]
    fn test_read_file() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let (dir, name) = scratch("read", &data);
        let executor = runtime::Runner::default();
        executor.start(|_| {
            let dir = dir.clone();
            let name = name.clone();
            let data = data.clone();
            async move {
                let storage = Storage::new(&dir);
                let file = storage.open(Path::new(&name)).await.unwrap();
                assert_eq!(file.size().await.unwrap(), 10_000);

                let buf = file
                    .read_at(vec![0; 100], 5_000, Priority::High)
                    .await
                    .unwrap();
                assert_eq!(buf, &data[5_000..5_100]);

                // Reading past the end fails.
                assert!(matches!(
                    file.read_at(vec![0; 100], 9_950, Priority::Normal).await,
                    Err(Error::ReadFailed)
                ));
                file.close().await.unwrap();
            }
        });
        std::fs::remove_file(dir.join(name)).unwrap();
    }

    #[test_traced]
    fn test_open_missing() {
        let executor = runtime::Runner::default();
        executor.start(|_| async move {
            let storage = Storage::new(std::env::temp_dir());
            let result = storage
                .open(Path::new("streamcache-does-not-exist"))
                .await;
            assert!(matches!(result, Err(Error::OpenFailed(_, _))));
        });
    }

    #[test_traced]
    fn test_cached_read() {
        let data: Vec<u8> = (0..3 * crate::LINE_SIZE as u32)
            .map(|i| (i % 241) as u8)
            .collect();
        let (dir, name) = scratch("cached", &data);
        let executor = runtime::Runner::default();
        executor.start(|context| {
            let dir = dir.clone();
            let name = name.clone();
            let data = data.clone();
            async move {
                let cache = Cache::new(context, Config::default());
                let storage = Storage::new(&dir);
                let session = cache.open(&storage, &name).await.unwrap();
                assert_eq!(session.wait_size().await.unwrap(), data.len() as u64);

                let (view, dependencies) = session
                    .read(1_000, 2 * crate::LINE_SIZE, Priority::Normal)
                    .unwrap();
                join(dependencies).await.unwrap();
                assert_eq!(view.to_vec(), &data[1_000..1_000 + 2 * crate::LINE_SIZE]);

                drop(view);
                session.close().await.unwrap();
            }
        });
        std::fs::remove_file(dir.join(name)).unwrap();
    }
}
