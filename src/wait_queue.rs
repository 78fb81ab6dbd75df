use core::cell::UnsafeCell;
use core::marker::PhantomPinned;
use core::ptr::NonNull;
use core::task::Waker;

/// A node parked in a [`WaitQueue`], embedded in the suspended future.
///
/// The embedding future must stay pinned from the moment the node is pushed
/// until it has been removed again.
#[derive(Debug)]
pub(crate) struct Waiter {
    inner: UnsafeCell<WaiterInner>,

    _pin: PhantomPinned,
}

#[derive(Debug)]
pub(crate) struct WaiterInner {
    /// Continuation of the suspended consumer.
    pub waker: Option<Waker>,

    /// Set by the producer when this waiter has been resumed (or granted
    /// ownership); the waiter unlinks itself on its next poll.
    pub woken: bool,

    next: Option<NonNull<Waiter>>,
    prev: Option<NonNull<Waiter>>,
}

impl Waiter {
    pub fn new() -> Self {
        Self {
            inner: UnsafeCell::new(WaiterInner {
                waker: None,
                woken: false,
                next: None,
                prev: None,
            }),
            _pin: PhantomPinned,
        }
    }

    /// Returns mutable access to the node state.
    ///
    /// # Safety
    ///
    /// The caller must hold the lock guarding the queue this node may be
    /// linked into; that lock is what makes the access exclusive.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get(&self) -> &mut WaiterInner {
        &mut *self.inner.get()
    }

    #[inline]
    pub fn as_ptr(&self) -> NonNull<Waiter> {
        NonNull::from(self)
    }
}

// Nodes are only ever touched under the owning queue's lock.
unsafe impl Send for Waiter {}
unsafe impl Sync for Waiter {}

/// An intrusive FIFO of suspended waiters.
///
/// The queue itself is unsynchronized; owners wrap it in a mutex and hold
/// that mutex across every access to the queue and its nodes.
#[derive(Debug)]
pub(crate) struct WaitQueue {
    head: Option<NonNull<Waiter>>,
    tail: Option<NonNull<Waiter>>,

    #[cfg(debug_assertions)]
    len: usize,
}

impl WaitQueue {
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,

            #[cfg(debug_assertions)]
            len: 0,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Appends a waiter at the tail.
    ///
    /// # Safety
    ///
    /// The node must stay pinned and alive until it is removed again.
    /// Dropping a linked node is undefined behavior.
    pub unsafe fn push_back(&mut self, waiter: NonNull<Waiter>) {
        let inner = (*waiter.as_ptr()).get();
        inner.next = None;
        inner.prev = self.tail;

        match self.tail {
            Some(tail) => (*tail.as_ptr()).get().next = Some(waiter),
            None => self.head = Some(waiter),
        }

        self.tail = Some(waiter);

        #[cfg(debug_assertions)]
        {
            self.len += 1;
        }
    }

    /// Unlinks a waiter.
    ///
    /// # Safety
    ///
    /// `waiter` must currently be linked into this queue.
    pub unsafe fn remove(&mut self, waiter: NonNull<Waiter>) {
        let inner = (*waiter.as_ptr()).get();

        match inner.next {
            Some(next) => (*next.as_ptr()).get().prev = inner.prev,
            None => self.tail = inner.prev,
        }

        match inner.prev {
            Some(prev) => (*prev.as_ptr()).get().next = inner.next,
            None => self.head = inner.next,
        }

        inner.next = None;
        inner.prev = None;

        #[cfg(debug_assertions)]
        {
            self.len -= 1;
        }
    }

    /// Returns the head of the queue without unlinking it.
    pub fn front(&self) -> Option<&Waiter> {
        // SAFETY: Linked nodes outlive their queue membership.
        self.head.map(|ptr| unsafe { &*ptr.as_ptr() })
    }

    /// Calls `f` on every parked waiter, front to back.
    ///
    /// # Safety
    ///
    /// The queue lock must be held. `f` must not unlink nodes.
    pub unsafe fn for_each(&mut self, mut f: impl FnMut(&mut WaiterInner)) {
        let mut cur = self.head;

        while let Some(ptr) = cur {
            let inner = (*ptr.as_ptr()).get();
            cur = inner.next;
            f(inner);
        }
    }
}

impl Drop for WaitQueue {
    fn drop(&mut self) {
        // Every waiter unlinks itself on wake-up or drop; a non-empty queue
        // here means a node now dangles.
        #[cfg(debug_assertions)]
        {
            assert_eq!(self.len, 0);
            assert!(self.is_empty());
        }
    }
}

unsafe impl Send for WaitQueue {}
unsafe impl Sync for WaitQueue {}
