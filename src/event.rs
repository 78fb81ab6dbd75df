use core::future::Future;
use core::pin::Pin;
use core::sync::atomic::{AtomicBool, Ordering};
use core::task::{Context, Poll};

use futures::future::FusedFuture;

use crate::waker_slot::WakerSlot;

/// A one-shot event a single consumer can wait on.
///
/// The event starts unset. [`set`] makes the one-way transition to set and
/// resumes the waiting consumer, if any; waiting on an already set event
/// completes without suspending. `set` may be called from any context,
/// including a different thread racing against the consumer's registration.
///
/// At most one consumer may wait at a time. Parking a second waiter while
/// another is still registered is a contract violation and panics.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use cotask::{Event, Task};
///
/// let event = Arc::new(Event::new());
///
/// let waiting = event.clone();
/// let task = Task::new(async move {
///     waiting.wait().await;
///     42
/// });
///
/// assert!(!task.is_ready());
/// event.set();
/// assert!(task.is_ready());
/// ```
///
/// [`set`]: Self::set
#[derive(Debug)]
pub struct Event {
    slot: WakerSlot,

    // A `Wait` future is currently parked in `slot`.
    waiting: AtomicBool,
}

impl Event {
    /// Creates a new, unset `Event`.
    #[inline]
    pub const fn new() -> Self {
        Self {
            slot: WakerSlot::new(),
            waiting: AtomicBool::new(false),
        }
    }

    /// Sets the event, resuming the parked consumer if there is one.
    ///
    /// Calling `set` on an already set event has no effect.
    pub fn set(&self) {
        self.slot.notify();
    }

    /// Returns `true` if the event has been set.
    #[inline]
    pub fn is_set(&self) -> bool {
        self.slot.is_notified()
    }

    /// Waits for the event to be set.
    ///
    /// If the event is already set, the returned future completes without
    /// suspending.
    pub fn wait(&self) -> Wait<'_> {
        Wait {
            event: self,
            state: State::Init,
        }
    }
}

impl Default for Event {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, PartialEq, Eq)]
enum State {
    Init,
    Pending,
    Done,
}

/// A future waiting for an [`Event`] to be set. Returned from [`Event::wait`].
#[derive(Debug)]
pub struct Wait<'a> {
    event: &'a Event,
    state: State,
}

impl Future for Wait<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        match this.state {
            State::Init => {
                if this.event.slot.is_notified() {
                    this.state = State::Done;
                    return Poll::Ready(());
                }

                if this.event.waiting.swap(true, Ordering::SeqCst) {
                    panic!("`Event` already has a registered waiter");
                }

                if this.event.slot.register(cx.waker()) {
                    this.state = State::Pending;
                    Poll::Pending
                } else {
                    // The event was set while the waker was being published.
                    this.event.waiting.store(false, Ordering::SeqCst);
                    this.state = State::Done;
                    Poll::Ready(())
                }
            }
            State::Pending => {
                if this.event.slot.register(cx.waker()) {
                    Poll::Pending
                } else {
                    this.event.waiting.store(false, Ordering::SeqCst);
                    this.state = State::Done;
                    Poll::Ready(())
                }
            }
            State::Done => Poll::Ready(()),
        }
    }
}

impl FusedFuture for Wait<'_> {
    #[inline]
    fn is_terminated(&self) -> bool {
        self.state == State::Done
    }
}

impl Drop for Wait<'_> {
    fn drop(&mut self) {
        if self.state == State::Pending {
            self.event.slot.unregister();
            self.event.waiting.store(false, Ordering::SeqCst);
        }
    }
}
