use core::fmt::{self, Debug, Formatter};
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};

use std::panic::{self, AssertUnwindSafe};

use futures::future::FusedFuture;

use crate::error::JoinError;

type LazyFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// An asynchronous computation that does not start until first awaited.
///
/// [`LazyTask::new`] only captures the frame; the body begins executing at
/// the consumer's first poll, with the consumer's waker already installed as
/// the continuation. Because the consumer is in place before the computation
/// can possibly finish, completion resumes it unconditionally and no atomic
/// handoff is needed.
///
/// Dropping a task that was never awaited destroys the captured state
/// without the body ever running.
///
/// # Examples
///
/// ```
/// use cotask::LazyTask;
///
/// #[tokio::main]
/// async fn main() {
///     let lazy = LazyTask::new(async { 2 * 3 });
///
///     assert!(!lazy.is_ready());
///     assert_eq!(lazy.await.unwrap(), 6);
/// }
/// ```
pub struct LazyTask<T> {
    future: Option<LazyFuture<T>>,

    // Filled by `when_ready` so a later consuming await can still retrieve
    // the result.
    result: Option<Result<T, JoinError>>,
}

impl<T: Send + 'static> LazyTask<T> {
    /// Captures `future` without starting it.
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        Self {
            future: Some(Box::pin(future)),
            result: None,
        }
    }
}

impl<T> LazyTask<T> {
    /// Returns `true` if the result is available.
    ///
    /// A handle without a backing computation is always ready.
    #[inline]
    pub fn is_ready(&self) -> bool {
        self.future.is_none()
    }

    /// Waits for the task to complete without retrieving its result.
    ///
    /// Drives the computation like a consuming await would, but stores the
    /// result for later retrieval and never surfaces a stored failure.
    pub fn when_ready(&mut self) -> WhenReady<'_, T> {
        WhenReady {
            task: self,
            done: false,
        }
    }
}

impl<T> Default for LazyTask<T> {
    /// Creates a task without a backing computation.
    ///
    /// Awaiting it yields the completion-missing error.
    #[inline]
    fn default() -> Self {
        Self {
            future: None,
            result: None,
        }
    }
}

// The result value is stored by value and moved out; nothing is pinned
// through it.
impl<T> Unpin for LazyTask<T> {}

impl<T> Future for LazyTask<T> {
    type Output = Result<T, JoinError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if let Some(result) = this.result.take() {
            return Poll::Ready(result);
        }

        let Some(future) = this.future.as_mut() else {
            return Poll::Ready(Err(JoinError::incomplete()));
        };

        let poll = panic::catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(cx)));

        match poll {
            Ok(Poll::Pending) => Poll::Pending,
            Ok(Poll::Ready(value)) => {
                this.future = None;
                Poll::Ready(Ok(value))
            }
            Err(payload) => {
                this.future = None;
                Poll::Ready(Err(JoinError::panicked(payload)))
            }
        }
    }
}

impl<T> Debug for LazyTask<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyTask")
            .field("ready", &self.is_ready())
            .finish()
    }
}

/// A future awaiting the completion of a [`LazyTask`] without consuming it.
///
/// Returned from [`LazyTask::when_ready`]. Completes with `()` even when the
/// computation failed; the stored failure stays retrievable.
pub struct WhenReady<'a, T> {
    task: &'a mut LazyTask<T>,
    done: bool,
}

impl<T> Future for WhenReady<'_, T> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if this.task.result.is_some() {
            this.done = true;
            return Poll::Ready(());
        }

        let Some(future) = this.task.future.as_mut() else {
            this.done = true;
            return Poll::Ready(());
        };

        let poll = panic::catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(cx)));

        match poll {
            Ok(Poll::Pending) => Poll::Pending,
            Ok(Poll::Ready(value)) => {
                this.task.future = None;
                this.task.result = Some(Ok(value));
                this.done = true;
                Poll::Ready(())
            }
            Err(payload) => {
                this.task.future = None;
                this.task.result = Some(Err(JoinError::panicked(payload)));
                this.done = true;
                Poll::Ready(())
            }
        }
    }
}

impl<T> FusedFuture for WhenReady<'_, T> {
    #[inline]
    fn is_terminated(&self) -> bool {
        self.done
    }
}

#[cfg(test)]
mod tests {
    use core::future::Future;
    use core::pin::Pin;
    use core::sync::atomic::{AtomicBool, Ordering};
    use core::task::{Context, Poll};

    use std::sync::Arc;

    use futures::task::noop_waker;

    use crate::event::Event;
    use crate::task::Task;

    use super::LazyTask;

    fn poll_once<F>(future: &mut F) -> Poll<F::Output>
    where
        F: Future + Unpin,
    {
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);

        Pin::new(future).poll(&mut cx)
    }

    #[test]
    fn test_does_not_start_until_awaited() {
        let started = Arc::new(AtomicBool::new(false));

        let mut lazy = {
            let started = started.clone();
            LazyTask::new(async move {
                started.store(true, Ordering::SeqCst);
                7
            })
        };

        assert!(!started.load(Ordering::SeqCst));
        assert!(!lazy.is_ready());

        assert!(matches!(poll_once(&mut lazy), Poll::Ready(Ok(7))));
        assert!(started.load(Ordering::SeqCst));
    }

    #[test]
    fn test_never_awaited_drops_captured_state() {
        let probe = Arc::new(());
        let started = Arc::new(AtomicBool::new(false));

        let lazy = {
            let probe = probe.clone();
            let started = started.clone();

            LazyTask::new(async move {
                started.store(true, Ordering::SeqCst);
                probe
            })
        };

        assert_eq!(Arc::strong_count(&probe), 2);

        drop(lazy);

        assert_eq!(Arc::strong_count(&probe), 1);
        assert!(!started.load(Ordering::SeqCst));
    }

    #[test]
    fn test_default_task_incomplete() {
        let mut lazy = LazyTask::<u32>::default();

        assert!(lazy.is_ready());

        match poll_once(&mut lazy) {
            Poll::Ready(Err(err)) => assert!(err.is_incomplete()),
            _ => panic!("expected the completion-missing error"),
        }
    }

    #[test]
    fn test_completes_asynchronously() {
        let event = Arc::new(Event::new());
        let before = Arc::new(AtomicBool::new(false));
        let after = Arc::new(AtomicBool::new(false));

        let lazy = {
            let event = event.clone();
            let before = before.clone();
            let after = after.clone();

            LazyTask::new(async move {
                before.store(true, Ordering::SeqCst);
                event.wait().await;
                after.store(true, Ordering::SeqCst);
            })
        };

        assert!(!before.load(Ordering::SeqCst));

        // The first await, from inside an eager task, starts the body.
        let mut consumer = Task::new(async move { lazy.await });

        assert!(before.load(Ordering::SeqCst));
        assert!(!after.load(Ordering::SeqCst));
        assert!(!consumer.is_ready());

        event.set();

        assert!(consumer.is_ready());
        assert!(after.load(Ordering::SeqCst));

        match poll_once(&mut consumer) {
            Poll::Ready(Ok(Ok(()))) => {}
            _ => panic!("lazy result was not forwarded"),
        }
    }

    #[test]
    fn test_when_ready_ignores_failure() {
        let mut lazy = LazyTask::<u32>::new(async { panic!("nope") });

        {
            let mut when_ready = lazy.when_ready();
            assert_eq!(poll_once(&mut when_ready), Poll::Ready(()));
        }

        assert!(lazy.is_ready());

        match poll_once(&mut lazy) {
            Poll::Ready(Err(err)) => {
                assert!(err.is_panic());
                assert_eq!(err.panic_message(), Some("nope"));
            }
            _ => panic!("expected the captured panic"),
        }
    }

    #[test]
    fn test_when_ready_keeps_result() {
        let probe = Arc::new(());

        let mut lazy = {
            let probe = probe.clone();
            LazyTask::new(async move { probe })
        };

        {
            let mut when_ready = lazy.when_ready();
            assert_eq!(poll_once(&mut when_ready), Poll::Ready(()));
        }

        assert!(lazy.is_ready());
        assert_eq!(Arc::strong_count(&probe), 2);

        drop(lazy);
        assert_eq!(Arc::strong_count(&probe), 1);
    }

    #[tokio::test]
    async fn test_await_on_runtime() {
        let lazy = LazyTask::new(async { String::from("lazy") });

        assert_eq!(lazy.await.unwrap(), "lazy");
    }
}
