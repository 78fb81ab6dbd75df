use core::cell::UnsafeCell;
use core::fmt::{self, Debug, Formatter};
use core::future::Future;
use core::pin::Pin;
use core::sync::atomic::{AtomicU8, Ordering};
use core::task::{Context, Poll};

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use futures::future::FusedFuture;
use futures::task::{self as futures_task, ArcWake};
use parking_lot::Mutex;

use crate::error::JoinError;
use crate::shared::SharedTask;
use crate::waker_slot::WakerSlot;

type TaskFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

// Bits of `Inner::poll_state` serializing access to the frame.
const POLLING: u8 = 0b01;
const REPOLL: u8 = 0b10;

/// An eagerly started asynchronous computation with a single consumer.
///
/// [`Task::new`] polls the frame synchronously up to its first suspension
/// point before returning, so side effects up to that point are observable
/// immediately. Afterwards the frame resumes on whichever context wakes it;
/// the library never spawns threads or schedules anything itself.
///
/// Awaiting the task consumes the handle and moves the result out. Awaiting
/// a default-constructed task, or one whose computation panicked, yields a
/// [`JoinError`] instead. Dropping an unfinished task abandons the frame:
/// captured state is destroyed and the computation never completes.
///
/// # Examples
///
/// ```
/// use cotask::Task;
///
/// #[tokio::main]
/// async fn main() {
///     let task = Task::new(async { 1 + 2 });
///
///     assert!(task.is_ready());
///     assert_eq!(task.await.unwrap(), 3);
/// }
/// ```
pub struct Task<T> {
    inner: Option<Arc<Inner<T>>>,
}

impl<T: Send + 'static> Task<T> {
    /// Starts a new task, running `future` up to its first suspension point.
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        let inner = Arc::new(Inner {
            poll_state: AtomicU8::new(0),
            future: Mutex::new(Some(Box::pin(future))),
            result: UnsafeCell::new(None),
            consumer: WakerSlot::new(),
        });

        inner.schedule();

        Self { inner: Some(inner) }
    }
}

impl<T: Clone + Send + Sync + 'static> Task<T> {
    /// Promotes this task into a [`SharedTask`], consuming the handle.
    ///
    /// The computation keeps running unchanged; any number of shared handles
    /// may then observe its result.
    pub fn into_shared(self) -> SharedTask<T> {
        SharedTask::promote(self)
    }
}

impl<T> Task<T> {
    /// Returns `true` if the result is available.
    ///
    /// A handle without a backing computation is always ready.
    pub fn is_ready(&self) -> bool {
        match &self.inner {
            Some(inner) => inner.consumer.is_notified(),
            None => true,
        }
    }

    /// Waits for the task to complete without retrieving its result.
    ///
    /// Unlike awaiting the task itself this neither consumes the handle nor
    /// surfaces a stored failure.
    pub fn when_ready(&self) -> WhenReady<'_, T> {
        WhenReady {
            task: self,
            done: false,
        }
    }
}

impl<T> Default for Task<T> {
    /// Creates a task without a backing computation.
    ///
    /// Awaiting it yields the completion-missing error.
    #[inline]
    fn default() -> Self {
        Self { inner: None }
    }
}

impl<T> Future for Task<T> {
    type Output = Result<T, JoinError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        let Some(inner) = &this.inner else {
            return Poll::Ready(Err(JoinError::incomplete()));
        };

        if inner.consumer.register(cx.waker()) {
            return Poll::Pending;
        }

        // SAFETY: The slot is notified and this is the sole consumer; the
        // producer published the result before notifying.
        let result = unsafe { (*inner.result.get()).take() };
        this.inner = None;

        match result {
            Some(result) => Poll::Ready(result),
            None => Poll::Ready(Err(JoinError::incomplete())),
        }
    }
}

impl<T> Drop for Task<T> {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            inner.close();
        }
    }
}

impl<T> Debug for Task<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("ready", &self.is_ready())
            .finish()
    }
}

struct Inner<T> {
    /// POLLING and REPOLL bits; at most one context polls the frame at a
    /// time, wake-ups arriving meanwhile make the active poller loop.
    poll_state: AtomicU8,

    /// The asynchronous frame. Taken out on completion or abandonment.
    future: Mutex<Option<TaskFuture<T>>>,

    /// Written once by the completing poll, moved out by the consumer.
    result: UnsafeCell<Option<Result<T, JoinError>>>,

    /// Continuation handoff with the consumer.
    consumer: WakerSlot,
}

impl<T: Send + 'static> Inner<T> {
    /// Claims the right to poll the frame, or records that the active
    /// poller must go around again.
    fn schedule(self: &Arc<Self>) {
        if self.poll_state.fetch_or(POLLING | REPOLL, Ordering::SeqCst) & POLLING == 0 {
            self.run();
        }
    }

    fn run(self: &Arc<Self>) {
        let waker = futures_task::waker_ref(self);
        let mut cx = Context::from_waker(&waker);

        loop {
            self.poll_state.fetch_and(!REPOLL, Ordering::SeqCst);

            // The frame is taken out of the slot for the duration of the
            // poll; the lock stays held, so abandonment cannot observe the
            // empty slot in between.
            let mut frame = self.future.lock();
            let Some(mut future) = frame.take() else {
                // Completed or abandoned; nothing left to resume.
                drop(frame);
                self.poll_state.store(0, Ordering::SeqCst);
                return;
            };

            let poll = panic::catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx)));

            let result = match poll {
                Ok(Poll::Pending) => {
                    *frame = Some(future);
                    drop(frame);

                    // Release the claim unless a wake-up raced in during the
                    // poll.
                    let res = self.poll_state.compare_exchange(
                        POLLING,
                        0,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    );

                    if res.is_ok() {
                        return;
                    }

                    continue;
                }
                Ok(Poll::Ready(value)) => Ok(value),
                Err(payload) => Err(JoinError::panicked(payload)),
            };

            // The frame and its lock must be gone before the consumer is
            // woken: a resumed consumer may drop this task on the same call
            // stack.
            drop(future);
            drop(frame);
            self.poll_state.store(0, Ordering::SeqCst);

            // SAFETY: Only the completing poll writes the slot, and the
            // consumer reads it only after `notify`.
            unsafe {
                *self.result.get() = Some(result);
            }
            self.consumer.notify();

            return;
        }
    }
}

impl<T> Inner<T> {
    /// Abandons the computation: destroys the frame and any unread result.
    fn close(&self) {
        let frame = self.future.lock().take();
        drop(frame);

        if self.consumer.is_notified() {
            // SAFETY: Completion is terminal; the sole consumer is the
            // caller, which is going away.
            unsafe {
                *self.result.get() = None;
            }
        }
    }
}

impl<T: Send + 'static> ArcWake for Inner<T> {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.schedule();
    }
}

unsafe impl<T: Send> Send for Inner<T> {}
unsafe impl<T: Send> Sync for Inner<T> {}

/// A future awaiting the completion of a [`Task`] without consuming it.
///
/// Returned from [`Task::when_ready`]. Completes with `()` even when the
/// computation failed; the stored failure stays untouched.
#[derive(Debug)]
pub struct WhenReady<'a, T> {
    task: &'a Task<T>,
    done: bool,
}

impl<T> Future for WhenReady<'_, T> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        let Some(inner) = &this.task.inner else {
            this.done = true;
            return Poll::Ready(());
        };

        if inner.consumer.register(cx.waker()) {
            Poll::Pending
        } else {
            this.done = true;
            Poll::Ready(())
        }
    }
}

impl<T> FusedFuture for WhenReady<'_, T> {
    #[inline]
    fn is_terminated(&self) -> bool {
        self.done
    }
}

impl<T> Drop for WhenReady<'_, T> {
    fn drop(&mut self) {
        if !self.done {
            if let Some(inner) = &self.task.inner {
                inner.consumer.unregister();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use core::future::Future;
    use core::pin::Pin;
    use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use core::task::{Context, Poll};

    use std::sync::Arc;

    use futures::task::noop_waker;

    use crate::event::Event;

    use super::Task;

    fn poll_once<F>(future: &mut F) -> Poll<F::Output>
    where
        F: Future + Unpin,
    {
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);

        Pin::new(future).poll(&mut cx)
    }

    #[test]
    fn test_runs_to_first_suspension() {
        let reached = Arc::new(AtomicBool::new(false));
        let event = Arc::new(Event::new());

        let task = {
            let reached = reached.clone();
            let event = event.clone();

            Task::new(async move {
                reached.store(true, Ordering::SeqCst);
                event.wait().await;
            })
        };

        assert!(reached.load(Ordering::SeqCst));
        assert!(!task.is_ready());

        event.set();
        assert!(task.is_ready());
    }

    #[test]
    fn test_synchronous_completion() {
        let mut task = Task::new(async { 5 });

        assert!(task.is_ready());
        assert!(matches!(poll_once(&mut task), Poll::Ready(Ok(5))));
    }

    #[test]
    fn test_move_only_result() {
        let mut task = Task::new(async { Box::new(123) });

        match poll_once(&mut task) {
            Poll::Ready(Ok(value)) => assert_eq!(*value, 123),
            _ => panic!("task did not complete"),
        }
    }

    #[test]
    fn test_default_task_incomplete() {
        let mut task = Task::<u32>::default();

        assert!(task.is_ready());

        match poll_once(&mut task) {
            Poll::Ready(Err(err)) => assert!(err.is_incomplete()),
            _ => panic!("expected the completion-missing error"),
        }
    }

    #[test]
    fn test_delayed_completion_chain() {
        let event = Arc::new(Event::new());
        let reached_a = Arc::new(AtomicBool::new(false));
        let reached_b = Arc::new(AtomicBool::new(false));
        let reached_c = Arc::new(AtomicBool::new(false));
        let reached_d = Arc::new(AtomicBool::new(false));

        let mut outer = {
            let event = event.clone();
            let reached_a = reached_a.clone();
            let reached_b = reached_b.clone();
            let reached_c = reached_c.clone();
            let reached_d = reached_d.clone();

            Task::new(async move {
                reached_c.store(true, Ordering::SeqCst);

                let inner = Task::new(async move {
                    reached_a.store(true, Ordering::SeqCst);
                    event.wait().await;
                    reached_b.store(true, Ordering::SeqCst);
                    1
                });

                let value = inner.await;
                reached_d.store(true, Ordering::SeqCst);
                value
            })
        };

        assert!(!outer.is_ready());
        assert!(reached_a.load(Ordering::SeqCst));
        assert!(!reached_b.load(Ordering::SeqCst));
        assert!(reached_c.load(Ordering::SeqCst));
        assert!(!reached_d.load(Ordering::SeqCst));

        event.set();

        assert!(outer.is_ready());
        assert!(reached_b.load(Ordering::SeqCst));
        assert!(reached_d.load(Ordering::SeqCst));

        match poll_once(&mut outer) {
            Poll::Ready(Ok(Ok(1))) => {}
            _ => panic!("inner result was not forwarded"),
        }
    }

    #[test]
    fn test_panic_is_captured() {
        let mut task = Task::<u32>::new(async { panic!("boom") });

        assert!(task.is_ready());

        match poll_once(&mut task) {
            Poll::Ready(Err(err)) => {
                assert!(err.is_panic());
                assert_eq!(err.panic_message(), Some("boom"));
            }
            _ => panic!("expected the captured panic"),
        }
    }

    #[test]
    fn test_when_ready_ignores_failure() {
        let task = Task::<u32>::new(async { panic!("boom") });

        let mut when_ready = task.when_ready();
        assert_eq!(poll_once(&mut when_ready), Poll::Ready(()));
    }

    #[test]
    fn test_when_ready_then_await() {
        let event = Arc::new(Event::new());

        let mut task = {
            let event = event.clone();
            Task::new(async move {
                event.wait().await;
                9
            })
        };

        {
            let mut when_ready = task.when_ready();
            assert_eq!(poll_once(&mut when_ready), Poll::Pending);

            event.set();
            assert_eq!(poll_once(&mut when_ready), Poll::Ready(()));
        }

        assert!(matches!(poll_once(&mut task), Poll::Ready(Ok(9))));
    }

    #[test]
    fn test_drop_abandons_frame() {
        let probe = Arc::new(());
        let event = Arc::new(Event::new());

        let task = {
            let probe = probe.clone();
            let event = event.clone();

            Task::new(async move {
                let _probe = probe;
                event.wait().await;
            })
        };

        assert_eq!(Arc::strong_count(&probe), 2);

        drop(task);
        assert_eq!(Arc::strong_count(&probe), 1);

        // The stale continuation must be ignored, not resumed into a
        // destroyed frame.
        event.set();
        assert_eq!(Arc::strong_count(&probe), 1);
    }

    #[test]
    fn test_drop_completed_task_drops_result() {
        let probe = Arc::new(());

        let task = {
            let probe = probe.clone();
            Task::new(async move { probe })
        };

        assert!(task.is_ready());
        assert_eq!(Arc::strong_count(&probe), 2);

        drop(task);
        assert_eq!(Arc::strong_count(&probe), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_await_cross_thread_completion() {
        let event = Arc::new(Event::new());

        let task = {
            let event = event.clone();
            Task::new(async move {
                event.wait().await;
                7
            })
        };

        let setter = {
            let event = event.clone();
            tokio::task::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                event.set();
            })
        };

        assert_eq!(task.await.unwrap(), 7);
        setter.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_completion_race() {
        // Race the consumer attaching against the producer finishing; the
        // consumer must resume exactly once whichever side wins.
        for _ in 0..100 {
            let event = Arc::new(Event::new());

            let task = {
                let event = event.clone();
                Task::new(async move {
                    event.wait().await;
                    1u32
                })
            };

            let setter = {
                let event = event.clone();
                tokio::task::spawn(async move {
                    event.set();
                })
            };

            assert_eq!(task.await.unwrap(), 1);
            setter.await.unwrap();
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_body_side_effects_observed_once() {
        let counter = Arc::new(AtomicUsize::new(0));
        let event = Arc::new(Event::new());

        let task = {
            let counter = counter.clone();
            let event = event.clone();

            Task::new(async move {
                event.wait().await;
                counter.fetch_add(1, Ordering::SeqCst);
            })
        };

        event.set();
        task.await.unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
