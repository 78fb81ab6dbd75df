use core::fmt::{self, Display, Formatter};

use std::any::Any;
use std::error::Error;
use std::sync::Arc;

/// Error returned when awaiting a task does not produce a value.
///
/// Awaiting a task yields `Result<T, JoinError>`. The error distinguishes a
/// handle with no backing computation (default-constructed or already
/// abandoned) from a computation that panicked. The error is cheap to clone,
/// so a shared task hands the identical failure to every consumer.
#[derive(Clone, Debug)]
pub struct JoinError {
    kind: Kind,
}

#[derive(Clone, Debug)]
enum Kind {
    Incomplete,
    Panicked(Option<Arc<str>>),
}

impl JoinError {
    #[inline]
    pub(crate) fn incomplete() -> Self {
        Self {
            kind: Kind::Incomplete,
        }
    }

    pub(crate) fn panicked(payload: Box<dyn Any + Send>) -> Self {
        // Panic payloads are neither `Sync` nor `Clone`; keep the message
        // when the payload is one of the stringly types `panic!` produces.
        let message = payload
            .downcast_ref::<&'static str>()
            .map(|msg| Arc::from(*msg))
            .or_else(|| payload.downcast_ref::<String>().map(|msg| Arc::from(msg.as_str())));

        Self {
            kind: Kind::Panicked(message),
        }
    }

    /// Returns `true` if the awaited handle had no backing computation.
    #[inline]
    pub fn is_incomplete(&self) -> bool {
        matches!(self.kind, Kind::Incomplete)
    }

    /// Returns `true` if the computation panicked.
    #[inline]
    pub fn is_panic(&self) -> bool {
        matches!(self.kind, Kind::Panicked(_))
    }

    /// Returns the panic message, if the computation panicked with one.
    pub fn panic_message(&self) -> Option<&str> {
        match &self.kind {
            Kind::Panicked(Some(message)) => Some(message),
            _ => None,
        }
    }
}

impl Display for JoinError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match &self.kind {
            Kind::Incomplete => f.write_str("task incomplete"),
            Kind::Panicked(Some(message)) => write!(f, "task panicked: {}", message),
            Kind::Panicked(None) => f.write_str("task panicked"),
        }
    }
}

impl Error for JoinError {}
