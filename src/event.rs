use std::fmt;

use crate::error::Error;

/// Opaque, stable identity of a connection within one engine.
///
/// Handles are never reused, so a stale handle can only ever miss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(pub(crate) u64);

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What a handler sees. Per connection the sequence is always
/// `Connected? Message* Error? Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event<'a> {
    Connected,
    /// One complete message. The slice borrows the connection's buffer and is
    /// only valid for the duration of the call.
    Message(&'a [u8]),
    /// The sticky status of a connection that failed.
    Error(&'a Error),
    Disconnected,
}

pub trait Handler {
    fn on_event(&mut self, handle: Handle, event: Event<'_>);
}

/// Adapter turning a closure into a [`Handler`].
pub struct FnHandler<F>(F);

impl<F> Handler for FnHandler<F>
where
    F: FnMut(Handle, Event<'_>),
{
    fn on_event(&mut self, handle: Handle, event: Event<'_>) {
        (self.0)(handle, event)
    }
}

pub fn callback<F>(f: F) -> FnHandler<F>
where
    F: FnMut(Handle, Event<'_>),
{
    FnHandler(f)
}
