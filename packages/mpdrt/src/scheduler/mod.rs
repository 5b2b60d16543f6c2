//! The event loop primitives a connection is driven by.
//!
//! A [`Scheduler`] owns sockets and timers and calls back into the connection when something
//! happens. Callbacks are never invoked synchronously from within the call that registered them.

pub mod manual;
#[cfg(feature = "tokio")]
pub mod runtime;

pub use self::manual::{ManualPeer, ManualScheduler};
#[cfg(feature = "tokio")]
pub use self::runtime::TokioScheduler;

use std::{io, time::Duration};

/// Readiness or failure of a socket opened by [`Scheduler::connect_and_poll`].
#[derive(Debug)]
pub enum SocketEvent {
    /// The connection was established. Sent at most once, before any other event.
    Connected,
    /// Data may be available to read.
    Readable,
    /// Data may be writable. Only sent while write interest is set.
    Writable,
    /// The socket failed, either while connecting or afterwards. No further events follow.
    Error(io::Error),
}

/// Receives a socket's events.
pub type EventHandler = Box<dyn FnMut(SocketEvent)>;

/// Non-blocking socket owned by a connection.
pub trait Socket {
    /// Read available bytes. `Ok(0)` means the peer closed, `WouldBlock` means nothing is
    /// available.
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write as many bytes as the socket accepts without blocking.
    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Set whether [`SocketEvent::Writable`] should be delivered.
    fn set_write_interest(&mut self, interested: bool);

    /// Close the socket. Its handler is dropped and receives no further events.
    fn close(&mut self);
}

/// Identifies a registered timeout.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TimerId(pub u64);

/// Event loop hooks a connection needs.
pub trait Scheduler {
    /// Start connecting to `host:port`, delivering subsequent events to `handler`.
    ///
    /// Errors only if connecting could not even be started. Failures to establish the connection
    /// are delivered as [`SocketEvent::Error`].
    fn connect_and_poll(
        &self,
        host: &str,
        port: u16,
        handler: EventHandler,
    ) -> io::Result<Box<dyn Socket>>;

    /// Run `callback` once after `delay`. A zero delay runs it on the next turn of the loop.
    fn add_timeout(&self, delay: Duration, callback: Box<dyn FnOnce()>) -> TimerId;

    /// Cancel a timeout. No-op if it already fired or was removed.
    fn remove_timeout(&self, timer: TimerId);
}
