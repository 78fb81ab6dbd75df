use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU8, Ordering};
use core::task::Waker;

const EMPTY: u8 = 0;
const REGISTERING: u8 = 1;
const WAITING: u8 = 2;
const NOTIFIED: u8 = 3;

/// A one-shot handoff cell between a single suspending consumer and a
/// producer signalling completion.
///
/// The consumer publishes its waker with [`register`]; the producer makes the
/// terminal transition with [`notify`]. Both may run concurrently from
/// different threads: exactly one of the two observes the other side having
/// already happened and performs the resumption. A registration that loses
/// the race returns `false` and the consumer proceeds without suspending; a
/// notification that wins the race takes the published waker and wakes it.
///
/// [`register`]: Self::register
/// [`notify`]: Self::notify
#[derive(Debug)]
pub(crate) struct WakerSlot {
    state: AtomicU8,

    // Written by the consumer while the state is REGISTERING, read by the
    // producer only after observing WAITING. Never accessed otherwise.
    waker: UnsafeCell<Option<Waker>>,
}

impl WakerSlot {
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(EMPTY),
            waker: UnsafeCell::new(None),
        }
    }

    /// Publishes `waker` as the continuation to resume on [`notify`].
    ///
    /// Returns `false` if the slot is already notified; the caller must then
    /// complete without suspending. Re-registering refreshes the stored waker.
    pub fn register(&self, waker: &Waker) -> bool {
        let mut state = self.state.load(Ordering::SeqCst);

        loop {
            match state {
                NOTIFIED => return false,
                EMPTY | WAITING => {
                    let res = self.state.compare_exchange(
                        state,
                        REGISTERING,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    );

                    match res {
                        Ok(_) => break,
                        Err(actual) => state = actual,
                    }
                }
                _ => panic!("a continuation is already being registered"),
            }
        }

        // SAFETY: The REGISTERING state grants this consumer exclusive access.
        unsafe {
            let cell = &mut *self.waker.get();

            let update = match cell {
                Some(old) => !old.will_wake(waker),
                None => true,
            };

            if update {
                *cell = Some(waker.clone());
            }
        }

        let res =
            self.state
                .compare_exchange(REGISTERING, WAITING, Ordering::SeqCst, Ordering::SeqCst);

        match res {
            Ok(_) => true,
            // The producer completed while the waker was being published. It
            // did not touch the cell; the consumer resumes itself.
            Err(_) => {
                // SAFETY: The producer never reads the cell once it has
                // observed REGISTERING.
                unsafe {
                    *self.waker.get() = None;
                }

                false
            }
        }
    }

    /// Removes a previously registered waker without notifying.
    pub fn unregister(&self) {
        let res =
            self.state
                .compare_exchange(WAITING, REGISTERING, Ordering::SeqCst, Ordering::SeqCst);

        if res.is_ok() {
            // SAFETY: REGISTERING grants exclusive access (see `register`).
            unsafe {
                *self.waker.get() = None;
            }

            // A concurrent `notify` may have made the slot terminal already.
            let _ = self.state.compare_exchange(
                REGISTERING,
                EMPTY,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
        }
    }

    /// Makes the terminal transition, resuming a registered continuation.
    ///
    /// Safe to call from any context, concurrently with the consumer's
    /// registration. Calling it again on a notified slot has no effect.
    pub fn notify(&self) {
        match self.state.swap(NOTIFIED, Ordering::SeqCst) {
            WAITING => {
                // SAFETY: The consumer only touches the cell in REGISTERING,
                // which it can no longer enter.
                let waker = unsafe { (*self.waker.get()).take() };

                if let Some(waker) = waker {
                    waker.wake();
                }
            }
            // EMPTY: the consumer will observe NOTIFIED when it registers.
            // REGISTERING: the consumer's transition to WAITING fails and it
            // resumes itself. NOTIFIED: already terminal.
            _ => {}
        }
    }

    /// Returns `true` once [`notify`] has been called.
    ///
    /// [`notify`]: Self::notify
    #[inline]
    pub fn is_notified(&self) -> bool {
        self.state.load(Ordering::SeqCst) == NOTIFIED
    }
}

unsafe impl Send for WakerSlot {}
unsafe impl Sync for WakerSlot {}
