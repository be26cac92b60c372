//! One-shot completion events that many tasks can wait on.
//!
//! A [Completer] resolves every clone of its [Completion] exactly once. Completion is two-phase:
//! the outcome is recorded before any waiter is woken, so [Completion::is_complete] and
//! [Completion::succeeded] can be polled without blocking and a [Completion::wait] issued after
//! the outcome is known returns immediately.
//!
//! # Example
//!
//! ```rust
//! use streamcache::completion::{join, Completer};
//!
//! let (first, a) = Completer::new();
//! let (second, b) = Completer::new();
//! let both = join([a.clone(), b]);
//!
//! first.complete(true);
//! assert!(a.is_complete());
//! assert!(!both.is_complete());
//!
//! second.complete(true);
//! assert!(both.wait().is_ok());
//! ```

use crate::Error;
use commonware_runtime::Spawner;
use futures::{
    channel::oneshot,
    future::{FutureExt, Shared},
};
use std::{
    future::Future,
    pin::Pin,
    sync::{Arc, OnceLock},
    task::{Context, Poll},
};

/// Outcome shared by a [Completer] and all clones of its [Completion].
struct State {
    succeeded: OnceLock<bool>,
}

/// Resolves a [Completion].
///
/// Dropping a [Completer] without calling [Completer::complete] resolves its [Completion] as
/// failed.
pub struct Completer {
    state: Arc<State>,
    _tx: oneshot::Sender<()>,
}

impl Completer {
    /// Create a new [Completer] and the [Completion] it resolves.
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> (Self, Completion) {
        let (tx, rx) = oneshot::channel();
        let state = Arc::new(State {
            succeeded: OnceLock::new(),
        });
        let completion = Completion {
            inner: Inner::Event {
                state: state.clone(),
                rx: rx.shared(),
            },
        };
        (Self { state, _tx: tx }, completion)
    }

    /// Record the outcome and wake all waiters.
    pub fn complete(self, succeeded: bool) {
        let _ = self.state.succeeded.set(succeeded);
    }
}

impl Drop for Completer {
    fn drop(&mut self) {
        // Record failure (if nothing was recorded yet) before the sender is dropped and wakes
        // every waiter.
        let _ = self.state.succeeded.set(false);
    }
}

#[derive(Clone)]
enum Inner {
    Event {
        state: Arc<State>,
        rx: Shared<oneshot::Receiver<()>>,
    },
    All(Vec<Completion>),
}

/// An event that resolves once some asynchronous work has finished.
///
/// Awaiting a [Completion] yields `Ok(())` if the work succeeded and [Error::ReadFailed]
/// otherwise.
#[derive(Clone)]
pub struct Completion {
    inner: Inner,
}

impl Completion {
    /// Returns a [Completion] that has already resolved with the given outcome.
    pub fn ready(succeeded: bool) -> Self {
        let (completer, completion) = Completer::new();
        completer.complete(succeeded);
        completion
    }

    /// Returns true if the outcome is known. Never blocks.
    pub fn is_complete(&self) -> bool {
        match &self.inner {
            Inner::Event { state, .. } => state.succeeded.get().is_some(),
            Inner::All(children) => children.iter().all(Completion::is_complete),
        }
    }

    /// Returns true if the outcome is known and successful. Never blocks.
    pub fn succeeded(&self) -> bool {
        match &self.inner {
            Inner::Event { state, .. } => state.succeeded.get() == Some(&true),
            Inner::All(children) => children.iter().all(Completion::succeeded),
        }
    }

    /// Returns true if the outcome is known and unsuccessful. Never blocks.
    pub fn failed(&self) -> bool {
        self.is_complete() && !self.succeeded()
    }

    /// Block the current thread until the outcome is known.
    ///
    /// Returns immediately if the outcome is already known. Must not be called from a task whose
    /// executor is responsible for resolving this [Completion].
    pub fn wait(&self) -> Result<(), Error> {
        if !self.is_complete() {
            return futures::executor::block_on(self.clone());
        }
        self.outcome()
    }

    fn outcome(&self) -> Result<(), Error> {
        if self.succeeded() {
            Ok(())
        } else {
            Err(Error::ReadFailed)
        }
    }
}

impl Future for Completion {
    type Output = Result<(), Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.inner {
            Inner::Event { state, rx } => {
                if state.succeeded.get().is_none() {
                    // The sender is only dropped after the outcome is recorded.
                    if rx.poll_unpin(cx).is_pending() {
                        return Poll::Pending;
                    }
                }
            }
            Inner::All(children) => {
                let mut pending = false;
                for child in children.iter_mut() {
                    if !child.is_complete() && child.poll_unpin(cx).is_pending() {
                        pending = true;
                    }
                }
                if pending {
                    return Poll::Pending;
                }
            }
        }
        Poll::Ready(self.outcome())
    }
}

/// Combine `completions` into a single [Completion] that resolves once all of them have, and
/// succeeds only if all of them succeed.
pub fn join(completions: impl IntoIterator<Item = Completion>) -> Completion {
    Completion {
        inner: Inner::All(completions.into_iter().collect()),
    }
}

/// Run `future` in the background and return a [Completion] that resolves with its outcome.
pub fn dispatch<S, F>(spawner: &S, future: F) -> Completion
where
    S: Spawner,
    F: Future<Output = Result<(), Error>> + Send + 'static,
{
    let (completer, completion) = Completer::new();
    spawner.clone().spawn(move |_| async move {
        let succeeded = future.await.is_ok();
        completer.complete(succeeded);
    });
    completion
}

/// Like [dispatch], but `future` only starts once `prerequisite` has resolved (successfully or
/// not).
pub fn dispatch_after<S, F>(spawner: &S, prerequisite: Completion, future: F) -> Completion
where
    S: Spawner,
    F: Future<Output = Result<(), Error>> + Send + 'static,
{
    if prerequisite.is_complete() {
        return dispatch(spawner, future);
    }
    dispatch(spawner, async move {
        let _ = prerequisite.await;
        future.await
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_macros::test_traced;
    use commonware_runtime::{deterministic, Clock, Runner};
    use std::{
        sync::atomic::{AtomicBool, Ordering},
        time::Duration,
    };

    #[test_traced]
    fn test_completion_resolves() {
        let (completer, completion) = Completer::new();
        assert!(!completion.is_complete());
        assert!(!completion.succeeded());

        let waiter = completion.clone();
        completer.complete(true);
        assert!(waiter.is_complete());
        assert!(waiter.succeeded());
        assert!(futures::executor::block_on(waiter).is_ok());

        // Waiting again after resolution returns immediately.
        assert!(completion.wait().is_ok());
        assert!(completion.wait().is_ok());
    }

    #[test_traced]
    fn test_completion_failure() {
        let (completer, completion) = Completer::new();
        completer.complete(false);
        assert!(completion.failed());
        assert!(matches!(completion.wait(), Err(Error::ReadFailed)));
    }

    #[test_traced]
    fn test_completion_dropped_completer() {
        let (completer, completion) = Completer::new();
        drop(completer);
        assert!(completion.is_complete());
        assert!(futures::executor::block_on(completion).is_err());
    }

    #[test_traced]
    fn test_completion_ready() {
        assert!(Completion::ready(true).succeeded());
        assert!(Completion::ready(false).failed());
    }

    #[test_traced]
    fn test_join() {
        let (first, a) = Completer::new();
        let (second, b) = Completer::new();
        let all = join([a, b]);
        assert!(!all.is_complete());

        first.complete(true);
        assert!(!all.is_complete());
        second.complete(false);
        assert!(all.is_complete());
        assert!(all.failed());
        assert!(futures::executor::block_on(all).is_err());

        // An empty join has nothing to wait for.
        assert!(join([]).succeeded());
    }

    #[test_traced]
    fn test_dispatch_after() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (gate, prerequisite) = Completer::new();
            let ran = Arc::new(AtomicBool::new(false));
            let task = dispatch_after(&context, prerequisite, {
                let ran = ran.clone();
                async move {
                    ran.store(true, Ordering::SeqCst);
                    Ok(())
                }
            });

            // The task cannot run before its prerequisite resolves.
            context.sleep(Duration::from_millis(10)).await;
            assert!(!ran.load(Ordering::SeqCst));
            assert!(!task.is_complete());

            // A failed prerequisite still releases the task.
            gate.complete(false);
            task.clone().await.unwrap();
            assert!(ran.load(Ordering::SeqCst));
            assert!(task.succeeded());
        });
    }

    #[test_traced]
    fn test_dispatch_failure() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let task = dispatch(&context, async { Err(Error::ReadFailed) });
            assert!(task.await.is_err());
        });
    }
}
