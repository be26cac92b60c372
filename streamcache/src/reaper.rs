//! Deferred reclamation of finished read requests.
//!
//! Every read the cache issues leaves behind a small request record (its completion and, for
//! successful reads, the buffer the file filled). Rather than releasing each record on the task
//! that produced it, records are queued and released in batches by a background task. Records
//! are only queued once their completion has resolved, so draining never blocks on I/O.
//!
//! Reclaimed buffers are kept on a bounded free list and handed out again by [Reaper::buffer], so
//! steady-state line reads do not allocate.

use crate::{block::LINE_SIZE, completion::Completion};
use commonware_runtime::Spawner;
use crossbeam_queue::{ArrayQueue, SegQueue};
use std::{
    num::NonZeroUsize,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};
use tracing::trace;

/// A finished read awaiting reclamation.
pub(crate) struct Request {
    completion: Completion,
    buffer: Option<Vec<u8>>,
}

impl Request {
    pub(crate) fn new(completion: Completion, buffer: Option<Vec<u8>>) -> Self {
        Self { completion, buffer }
    }
}

/// Queued requests and the buffers recovered from them.
struct Queues {
    requests: SegQueue<Request>,
    buffers: ArrayQueue<Vec<u8>>,
}

impl Queues {
    /// Release `request`, keeping its buffer if the free list has room.
    fn reclaim(&self, request: Request) {
        debug_assert!(request.completion.is_complete());
        if let Some(buffer) = request.buffer {
            let _ = self.buffers.push(buffer);
        }
    }
}

/// Reclaims [Request]s in batches.
#[derive(Clone)]
pub(crate) struct Reaper<S: Spawner> {
    spawner: S,
    queues: Arc<Queues>,
    pushed: Arc<AtomicUsize>,
    batch: usize,
}

impl<S: Spawner> Reaper<S> {
    /// Create a reaper that drains every `batch` pushes and keeps up to `batch` buffers.
    pub(crate) fn new(spawner: S, batch: NonZeroUsize) -> Self {
        Self {
            spawner,
            queues: Arc::new(Queues {
                requests: SegQueue::new(),
                buffers: ArrayQueue::new(batch.get()),
            }),
            pushed: Arc::new(AtomicUsize::new(0)),
            batch: batch.get(),
        }
    }

    /// Returns a zeroed buffer of `len` bytes, reusing a reclaimed one when available.
    pub(crate) fn buffer(&self, len: usize) -> Vec<u8> {
        debug_assert!(len <= LINE_SIZE);
        match self.queues.buffers.pop() {
            Some(mut buffer) => {
                buffer.clear();
                buffer.resize(len, 0);
                buffer
            }
            None => {
                let mut buffer = Vec::with_capacity(LINE_SIZE);
                buffer.resize(len, 0);
                buffer
            }
        }
    }

    /// Queue `request`, spawning a drain every `batch` pushes.
    pub(crate) fn push(&self, request: Request) {
        self.queues.requests.push(request);
        let pushed = self.pushed.fetch_add(1, Ordering::Relaxed) + 1;
        if pushed % self.batch != 0 {
            return;
        }
        let queues = self.queues.clone();
        self.spawner.clone().spawn(move |_| async move {
            let mut reaped = 0;
            while let Some(request) = queues.requests.pop() {
                let _ = request.completion.clone().await;
                queues.reclaim(request);
                reaped += 1;
            }
            trace!(reaped, "reaped requests");
        });
    }

    /// Synchronously reclaim everything queued, returning the number of requests reclaimed.
    pub(crate) fn flush(&self) -> usize {
        let mut reaped = 0;
        while let Some(request) = self.queues.requests.pop() {
            let _ = request.completion.wait();
            self.queues.reclaim(request);
            reaped += 1;
        }
        if reaped > 0 {
            trace!(reaped, "flushed requests");
        }
        reaped
    }

    /// Number of requests awaiting reclamation.
    pub(crate) fn pending(&self) -> usize {
        self.queues.requests.len()
    }

    /// Number of reclaimed buffers ready for reuse.
    pub(crate) fn spare(&self) -> usize {
        self.queues.buffers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::Completion;
    use commonware_macros::test_traced;
    use commonware_runtime::{deterministic, Clock, Runner};
    use std::time::Duration;

    fn request() -> Request {
        Request::new(Completion::ready(true), Some(vec![1; 16]))
    }

    #[test_traced]
    fn test_flush() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let reaper = Reaper::new(context, NonZeroUsize::new(32).unwrap());
            for _ in 0..5 {
                reaper.push(request());
            }
            assert_eq!(reaper.pending(), 5);
            assert_eq!(reaper.flush(), 5);
            assert_eq!(reaper.pending(), 0);
            assert_eq!(reaper.flush(), 0);
            assert_eq!(reaper.spare(), 5);
        });
    }

    #[test_traced]
    fn test_batch_drains_in_background() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let reaper = Reaper::new(context.clone(), NonZeroUsize::new(4).unwrap());
            for _ in 0..3 {
                reaper.push(request());
            }
            context.sleep(Duration::from_millis(10)).await;
            assert_eq!(reaper.pending(), 3);

            // The fourth push triggers a drain.
            reaper.push(request());
            context.sleep(Duration::from_millis(10)).await;
            assert_eq!(reaper.pending(), 0);
            assert_eq!(reaper.spare(), 4);
        });
    }

    #[test_traced]
    fn test_buffers_reused() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let reaper = Reaper::new(context, NonZeroUsize::new(2).unwrap());

            // Failed reads leave no buffer behind.
            reaper.push(Request::new(Completion::ready(false), None));
            reaper.flush();
            assert_eq!(reaper.spare(), 0);

            // Reclaimed buffers come back zeroed and sized to the request.
            let buffer = reaper.buffer(LINE_SIZE);
            assert_eq!(buffer.len(), LINE_SIZE);
            let pointer = buffer.as_ptr();
            reaper.push(Request::new(Completion::ready(true), Some(vec![9; 8])));
            reaper.push(Request::new(Completion::ready(true), Some(buffer)));
            reaper.flush();
            assert_eq!(reaper.spare(), 2);

            let small = reaper.buffer(4);
            assert_eq!(small, vec![0; 4]);
            let reused = reaper.buffer(100);
            assert_eq!(reused, vec![0; 100]);
            assert_eq!(reused.as_ptr(), pointer);
            assert_eq!(reaper.spare(), 0);

            // The free list is bounded.
            for _ in 0..4 {
                reaper.push(request());
            }
            reaper.flush();
            assert_eq!(reaper.spare(), 2);
        });
    }
}
