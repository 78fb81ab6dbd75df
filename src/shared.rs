use core::cell::UnsafeCell;
use core::fmt::{self, Debug, Formatter};
use core::future::Future;
use core::pin::Pin;
use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use core::task::{Context, Poll};

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use futures::future::FusedFuture;
use futures::task::{self as futures_task, ArcWake};
use parking_lot::Mutex;

use crate::error::JoinError;
use crate::task::Task;
use crate::wait_queue::{WaitQueue, Waiter};

type SharedFuture<T> = Pin<Box<dyn Future<Output = Result<T, JoinError>> + Send + 'static>>;

// Bits of `Shared::state`.
const POLLING: u8 = 0b001;
const REPOLL: u8 = 0b010;
const COMPLETE: u8 = 0b100;

/// An eagerly started asynchronous computation observable by any number of
/// consumers.
///
/// Cloning the handle is cheap and shares the underlying frame; the body
/// runs at most once no matter how many handles exist. Consumers may await
/// before or after completion, concurrently or sequentially, and all observe
/// the same result by clone (never by move). The frame and its result are
/// destroyed when the last handle is dropped.
///
/// Two handles compare equal when they refer to the same frame; equal
/// results from distinct frames do not make the handles equal.
///
/// # Examples
///
/// ```
/// use cotask::SharedTask;
///
/// #[tokio::main]
/// async fn main() {
///     let task = SharedTask::new(async { 42 });
///
///     let copy = task.clone();
///     assert_eq!(copy.await.unwrap(), 42);
///     assert_eq!(task.await.unwrap(), 42);
/// }
/// ```
pub struct SharedTask<T> {
    shared: Option<Arc<Shared<T>>>,

    /// Node for this handle in the frame's waiter queue. Only inside the
    /// queue while `state == WaitState::Pending`.
    waiter: Waiter,

    state: WaitState,
}

#[derive(Debug, PartialEq, Eq)]
enum WaitState {
    Init,
    Pending,
    Done,
}

impl<T: Clone + Send + Sync + 'static> SharedTask<T> {
    /// Starts a new shared task, running `future` up to its first suspension
    /// point.
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        Self::start(Box::pin(async move { Ok(future.await) }))
    }

    /// Transfers ownership of an eager task's frame into a new shared task.
    pub(crate) fn promote(task: Task<T>) -> Self {
        Self::start(Box::pin(task))
    }

    fn start(future: SharedFuture<T>) -> Self {
        let shared = Arc::new(Shared {
            state: AtomicU8::new(0),
            handles: AtomicUsize::new(1),
            future: Mutex::new(Some(future)),
            waiters: Mutex::new(WaitQueue::new()),
            result: UnsafeCell::new(None),
        });

        shared.schedule();

        Self {
            shared: Some(shared),
            waiter: Waiter::new(),
            state: WaitState::Init,
        }
    }
}

impl<T> SharedTask<T> {
    /// Returns `true` if the result is available.
    ///
    /// A handle without a backing computation is always ready.
    pub fn is_ready(&self) -> bool {
        match &self.shared {
            Some(shared) => shared.state.load(Ordering::SeqCst) & COMPLETE != 0,
            None => true,
        }
    }
}

impl<T> Default for SharedTask<T> {
    /// Creates a shared task without a backing computation.
    ///
    /// Awaiting it yields the completion-missing error.
    fn default() -> Self {
        Self {
            shared: None,
            waiter: Waiter::new(),
            state: WaitState::Init,
        }
    }
}

impl<T> Clone for SharedTask<T> {
    fn clone(&self) -> Self {
        if let Some(shared) = &self.shared {
            shared.handles.fetch_add(1, Ordering::SeqCst);
        }

        Self {
            shared: self.shared.clone(),
            waiter: Waiter::new(),
            state: WaitState::Init,
        }
    }
}

impl<T> PartialEq for SharedTask<T> {
    fn eq(&self, other: &Self) -> bool {
        match (&self.shared, &other.shared) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }
}

impl<T> Eq for SharedTask<T> {}

impl<T: Clone> Future for SharedTask<T> {
    type Output = Result<T, JoinError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // SAFETY: The parked waiter is never moved out of `this`; the handle
        // stays pinned while it is linked.
        let this = unsafe { self.get_unchecked_mut() };

        match this.state {
            WaitState::Init => {
                let Some(shared) = &this.shared else {
                    this.state = WaitState::Done;
                    return Poll::Ready(Err(JoinError::incomplete()));
                };

                let mut waiters = shared.waiters.lock();

                // Checked under the queue lock: completion drains the queue
                // under the same lock, so the result cannot slip by between
                // this check and parking.
                if shared.state.load(Ordering::SeqCst) & COMPLETE != 0 {
                    drop(waiters);
                    this.state = WaitState::Done;
                    return Poll::Ready(shared.clone_result());
                }

                unsafe {
                    this.waiter.get().waker = Some(cx.waker().clone());
                    waiters.push_back(this.waiter.as_ptr());
                }

                drop(waiters);

                this.state = WaitState::Pending;
                Poll::Pending
            }
            WaitState::Pending => {
                let Some(shared) = &this.shared else {
                    this.state = WaitState::Done;
                    return Poll::Ready(Err(JoinError::incomplete()));
                };

                let mut waiters = shared.waiters.lock();

                let waiter = unsafe { this.waiter.get() };
                if waiter.woken {
                    unsafe {
                        waiters.remove(this.waiter.as_ptr());
                    }

                    drop(waiters);

                    this.state = WaitState::Done;
                    Poll::Ready(shared.clone_result())
                } else {
                    // Update the waker if necessary.
                    let update = match &waiter.waker {
                        Some(waker) => !waker.will_wake(cx.waker()),
                        None => true,
                    };

                    if update {
                        waiter.waker = Some(cx.waker().clone());
                    }

                    drop(waiters);

                    Poll::Pending
                }
            }
            WaitState::Done => match &this.shared {
                Some(shared) => Poll::Ready(shared.clone_result()),
                None => Poll::Ready(Err(JoinError::incomplete())),
            },
        }
    }
}

impl<T: Clone> FusedFuture for SharedTask<T> {
    #[inline]
    fn is_terminated(&self) -> bool {
        self.state == WaitState::Done
    }
}

impl<T> Drop for SharedTask<T> {
    fn drop(&mut self) {
        if let Some(shared) = &self.shared {
            // Unpark first if this handle is still suspended on the frame.
            if self.state == WaitState::Pending {
                let mut waiters = shared.waiters.lock();
                unsafe {
                    waiters.remove(self.waiter.as_ptr());
                }
            }

            if shared.handles.fetch_sub(1, Ordering::SeqCst) == 1 {
                shared.close();
            }
        }
    }
}

impl<T> Debug for SharedTask<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedTask")
            .field("ready", &self.is_ready())
            .finish()
    }
}

struct Shared<T> {
    /// POLLING and REPOLL serialize access to the frame; COMPLETE is the
    /// terminal bit set once the result is stored.
    state: AtomicU8,

    /// Live `SharedTask` handles. The frame and result die with the last
    /// one, even if stray wakers keep the allocation alive longer.
    handles: AtomicUsize,

    /// The asynchronous frame. Taken out on completion or abandonment.
    future: Mutex<Option<SharedFuture<T>>>,

    /// Consumers suspended on the frame.
    waiters: Mutex<WaitQueue>,

    /// Written once before COMPLETE is set, read (and cloned) by consumers
    /// afterwards.
    result: UnsafeCell<Option<Result<T, JoinError>>>,
}

impl<T: Clone> Shared<T> {
    fn clone_result(&self) -> Result<T, JoinError> {
        // SAFETY: COMPLETE is terminal and the slot is written before it is
        // set; consumers only read afterwards.
        match unsafe { &*self.result.get() } {
            Some(result) => result.clone(),
            None => Err(JoinError::incomplete()),
        }
    }
}

impl<T: Send + Sync + 'static> Shared<T> {
    /// Claims the right to poll the frame, or records that the active
    /// poller must go around again.
    fn schedule(self: &Arc<Self>) {
        if self.state.fetch_or(POLLING | REPOLL, Ordering::SeqCst) & (POLLING | COMPLETE) == 0 {
            self.run();
        }
    }

    fn run(self: &Arc<Self>) {
        let waker = futures_task::waker_ref(self);
        let mut cx = Context::from_waker(&waker);

        loop {
            self.state.fetch_and(!REPOLL, Ordering::SeqCst);

            // The frame is taken out of the slot for the duration of the
            // poll; the lock stays held, so abandonment cannot observe the
            // empty slot in between.
            let mut frame = self.future.lock();
            let Some(mut future) = frame.take() else {
                // Completed or abandoned; nothing left to resume.
                drop(frame);
                self.state.fetch_and(!(POLLING | REPOLL), Ordering::SeqCst);
                return;
            };

            let poll = panic::catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx)));

            let result = match poll {
                Ok(Poll::Pending) => {
                    *frame = Some(future);
                    drop(frame);

                    // Release the claim unless a wake-up raced in during the
                    // poll.
                    let res = self.state.compare_exchange(
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
                Ok(Poll::Ready(result)) => result,
                Err(payload) => Err(JoinError::panicked(payload)),
            };

            // The frame and its lock must be gone before any consumer is
            // woken: resumed consumers may run (and drop handles) on this
            // stack.
            drop(future);
            drop(frame);

            self.complete(result);

            return;
        }
    }

    fn complete(&self, result: Result<T, JoinError>) {
        // SAFETY: Only the completing poll writes the slot, before COMPLETE
        // becomes visible.
        unsafe {
            *self.result.get() = Some(result);
        }

        self.state.fetch_or(COMPLETE, Ordering::SeqCst);
        self.state.fetch_and(!(POLLING | REPOLL), Ordering::SeqCst);

        // Wakers are invoked only after the queue lock is released; each may
        // resume its consumer on this call stack.
        let mut wakers = Vec::new();

        let mut waiters = self.waiters.lock();
        unsafe {
            waiters.for_each(|waiter| {
                waiter.woken = true;

                if let Some(waker) = waiter.waker.take() {
                    wakers.push(waker);
                }
            });
        }
        drop(waiters);

        for waker in wakers {
            waker.wake();
        }
    }
}

impl<T> Shared<T> {
    /// Called when the last handle goes away: destroys the frame and, if the
    /// computation already finished, its result.
    fn close(&self) {
        let frame = self.future.lock().take();
        drop(frame);

        if self.state.load(Ordering::SeqCst) & COMPLETE != 0 {
            // SAFETY: No handles remain, so no consumer can read the slot.
            unsafe {
                *self.result.get() = None;
            }
        }
    }
}

impl<T: Send + Sync + 'static> ArcWake for Shared<T> {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.schedule();
    }
}

unsafe impl<T: Send + Sync> Send for Shared<T> {}
unsafe impl<T: Send + Sync> Sync for Shared<T> {}
