use core::cell::UnsafeCell;
use core::fmt::{self, Debug, Formatter};
use core::future::Future;
use core::ops::{Deref, DerefMut};
use core::pin::Pin;
use core::sync::atomic::{AtomicBool, Ordering};
use core::task::{Context, Poll, Waker};

use futures::future::FusedFuture;

use crate::wait_queue::{WaitQueue, Waiter};

/// An asynchronous mutual-exclusion lock.
///
/// Acquisition suspends the calling task instead of blocking a thread.
/// Waiters are granted the lock in strict FIFO order: releasing a guard
/// hands ownership directly to the queue head while the mutex stays
/// logically locked, so no later arrival can slip in between release and
/// handoff. The guard releases the lock on every exit path, including
/// unwinding.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use cotask::Mutex;
///
/// #[tokio::main]
/// async fn main() {
///     let mutex = Arc::new(Mutex::new(0));
///
///     {
///         let mut value = mutex.lock().await;
///         *value += 1;
///     }
///
///     assert_eq!(*mutex.lock().await, 1);
/// }
/// ```
pub struct Mutex<T> {
    /// `true` while a guard exists or the lock is mid-handoff.
    locked: AtomicBool,

    waiters: parking_lot::Mutex<WaitQueue>,

    value: UnsafeCell<T>,
}

impl<T> Mutex<T> {
    /// Creates a new unlocked `Mutex` holding `value`.
    pub fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            waiters: parking_lot::Mutex::new(WaitQueue::new()),
            value: UnsafeCell::new(value),
        }
    }

    /// Acquires the lock, suspending until it is granted.
    ///
    /// If the mutex is unlocked and no waiter is queued, the returned future
    /// completes on its first poll without suspending.
    pub fn lock(&self) -> Lock<'_, T> {
        Lock {
            mutex: self,
            waiter: Waiter::new(),
            state: State::Init,
        }
    }

    /// Tries to acquire the lock without suspending.
    ///
    /// A lock that is mid-handoff to a queued waiter counts as held; this
    /// can never overtake a waiter.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        let res = self
            .locked
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst);

        match res {
            Ok(_) => Some(MutexGuard { mutex: self }),
            Err(_) => None,
        }
    }

    /// Returns `true` if the lock is currently held.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }

    /// Returns a mutable reference to the value without locking.
    #[inline]
    pub fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }

    /// Consumes the mutex, returning the value.
    #[inline]
    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }

    fn unlock(&self) {
        let mut waiters = self.waiters.lock();
        let waker = self.grant_next(&mut waiters);
        drop(waiters);

        // The woken waiter may resume on this call stack; the queue lock
        // must already be released.
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Transfers the lock to the queue head, or unlocks if nobody waits.
    ///
    /// The caller must hold the queue lock and own the mutex.
    fn grant_next(&self, waiters: &mut WaitQueue) -> Option<Waker> {
        match waiters.front() {
            Some(waiter) => {
                // Ownership moves to the head waiter; `locked` stays `true`
                // across the handoff.
                let waiter = unsafe { waiter.get() };
                waiter.woken = true;
                waiter.waker.take()
            }
            None => {
                self.locked.store(false, Ordering::SeqCst);
                None
            }
        }
    }
}

impl<T: Default> Default for Mutex<T> {
    #[inline]
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> Debug for Mutex<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutex")
            .field("locked", &self.is_locked())
            .finish()
    }
}

unsafe impl<T: Send> Send for Mutex<T> {}
unsafe impl<T: Send> Sync for Mutex<T> {}

#[derive(Debug, PartialEq, Eq)]
enum State {
    Init,
    Waiting,
    Done,
}

/// A future acquiring a [`Mutex`]. Returned from [`Mutex::lock`].
#[derive(Debug)]
pub struct Lock<'a, T> {
    mutex: &'a Mutex<T>,

    /// Only inside the waiter queue while `state == State::Waiting`.
    waiter: Waiter,

    state: State,
}

impl<'a, T> Future for Lock<'a, T> {
    type Output = MutexGuard<'a, T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // SAFETY: The parked waiter is never moved out of `this`; the future
        // stays pinned while it is linked.
        let this = unsafe { self.get_unchecked_mut() };

        match this.state {
            State::Init => {
                let mut waiters = this.mutex.waiters.lock();

                // Acquire directly only when nobody is queued; anything else
                // would overtake earlier arrivals.
                if waiters.is_empty() {
                    let res = this.mutex.locked.compare_exchange(
                        false,
                        true,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    );

                    if res.is_ok() {
                        drop(waiters);
                        this.state = State::Done;
                        return Poll::Ready(MutexGuard { mutex: this.mutex });
                    }
                }

                unsafe {
                    this.waiter.get().waker = Some(cx.waker().clone());
                    waiters.push_back(this.waiter.as_ptr());
                }

                drop(waiters);

                this.state = State::Waiting;
                Poll::Pending
            }
            State::Waiting => {
                let mut waiters = this.mutex.waiters.lock();

                let waiter = unsafe { this.waiter.get() };
                if waiter.woken {
                    // The releasing guard already transferred ownership.
                    unsafe {
                        waiters.remove(this.waiter.as_ptr());
                    }

                    drop(waiters);

                    this.state = State::Done;
                    Poll::Ready(MutexGuard { mutex: this.mutex })
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
            // A second guard must never be handed out.
            State::Done => panic!("`Lock` polled after completion"),
        }
    }
}

impl<T> FusedFuture for Lock<'_, T> {
    #[inline]
    fn is_terminated(&self) -> bool {
        self.state == State::Done
    }
}

impl<T> Drop for Lock<'_, T> {
    fn drop(&mut self) {
        if self.state != State::Waiting {
            return;
        }

        let mut waiters = self.mutex.waiters.lock();

        let woken = unsafe { self.waiter.get().woken };
        unsafe {
            waiters.remove(self.waiter.as_ptr());
        }

        if !woken {
            return;
        }

        // The lock was already handed to this waiter; pass it onward.
        let waker = self.mutex.grant_next(&mut waiters);
        drop(waiters);

        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

/// Scoped ownership of a [`Mutex`].
///
/// The protected value is reachable through [`Deref`] and [`DerefMut`]. The
/// lock is released when the guard drops, on every exit path.
pub struct MutexGuard<'a, T> {
    mutex: &'a Mutex<T>,
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // SAFETY: The guard holds the lock.
        unsafe { &*self.mutex.value.get() }
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: The guard holds the lock.
        unsafe { &mut *self.mutex.value.get() }
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    #[inline]
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

impl<T: Debug> Debug for MutexGuard<'_, T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Debug::fmt(&**self, f)
    }
}

unsafe impl<T: Send> Send for MutexGuard<'_, T> {}
unsafe impl<T: Send + Sync> Sync for MutexGuard<'_, T> {}
