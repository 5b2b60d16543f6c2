//! Deterministic scheduler with a virtual clock and in-memory sockets.
//!
//! Useful for embedding the runtime into a foreign event loop, and for testing. Nothing happens
//! until the owner calls [`ManualScheduler::run_until_stalled`] or [`ManualScheduler::advance`],
//! or drives a socket through its [`ManualPeer`].

use super::*;
use bytes::{Buf, BytesMut};
use std::{
    cell::{Cell, RefCell},
    collections::BTreeMap,
    io,
    rc::Rc,
    time::Duration,
};

/// Scheduler driven entirely by its owner.
pub struct ManualScheduler {
    state: RefCell<ManualState>,
}

struct ManualState {
    now: Duration,
    next_timer: u64,
    // keyed by deadline then id, so equal deadlines fire in the order they were added
    timers: BTreeMap<(Duration, TimerId), Box<dyn FnOnce()>>,
    peers: Vec<ManualPeer>,
    connect_error: Option<io::ErrorKind>,
}

impl ManualScheduler {
    pub fn new() -> Rc<Self> {
        Rc::new(ManualScheduler {
            state: RefCell::new(ManualState {
                now: Duration::ZERO,
                next_timer: 0,
                timers: BTreeMap::new(),
                peers: Vec::new(),
                connect_error: None,
            }),
        })
    }

    /// Virtual time elapsed since construction.
    pub fn now(&self) -> Duration {
        self.state.borrow().now
    }

    /// Number of timeouts not yet fired or removed.
    pub fn pending_timers(&self) -> usize {
        self.state.borrow().timers.len()
    }

    /// Fire every timeout due now, including ones added by the callbacks fired.
    ///
    /// Returns how many callbacks ran.
    pub fn run_until_stalled(&self) -> usize {
        let mut fired = 0;
        while let Some(callback) = self.pop_due(self.now()) {
            callback();
            fired += 1;
        }
        fired
    }

    /// Move the clock forward, firing timeouts in deadline order as it passes them.
    ///
    /// Returns how many callbacks ran.
    pub fn advance(&self, by: Duration) -> usize {
        let target = self.now() + by;
        let mut fired = 0;
        while let Some(callback) = self.pop_due(target) {
            callback();
            fired += 1;
        }
        self.state.borrow_mut().now = target;
        fired
    }

    /// Make subsequent [`Scheduler::connect_and_poll`] calls fail synchronously, or stop doing so.
    pub fn fail_connects(&self, error: Option<io::ErrorKind>) {
        self.state.borrow_mut().connect_error = error;
    }

    /// The remote end of the most recently opened socket.
    pub fn peer(&self) -> Option<ManualPeer> {
        self.state.borrow().peers.last().cloned()
    }

    /// The remote ends of every socket opened so far, oldest first.
    pub fn peers(&self) -> Vec<ManualPeer> {
        self.state.borrow().peers.clone()
    }

    fn pop_due(&self, limit: Duration) -> Option<Box<dyn FnOnce()>> {
        let mut state = self.state.borrow_mut();
        let (&(deadline, id), _) = state.timers.first_key_value()?;
        if deadline > limit {
            return None;
        }
        state.now = state.now.max(deadline);
        state.timers.remove(&(deadline, id))
    }
}

impl Scheduler for ManualScheduler {
    fn connect_and_poll(
        &self,
        host: &str,
        port: u16,
        handler: EventHandler,
    ) -> io::Result<Box<dyn Socket>> {
        let mut state = self.state.borrow_mut();
        if let Some(kind) = state.connect_error {
            return Err(kind.into());
        }
        let wire = Rc::new(Wire {
            host: host.to_owned(),
            port,
            handler: RefCell::new(Some(handler)),
            inbound: RefCell::new(BytesMut::new()),
            outbound: RefCell::new(Vec::new()),
            accepted: Cell::new(false),
            remote_closed: Cell::new(false),
            closed: Cell::new(false),
            write_budget: Cell::new(None),
            write_interest: Cell::new(false),
        });
        state.peers.push(ManualPeer(Rc::clone(&wire)));
        Ok(Box::new(ManualSocket(wire)))
    }

    fn add_timeout(&self, delay: Duration, callback: Box<dyn FnOnce()>) -> TimerId {
        let mut state = self.state.borrow_mut();
        let id = TimerId(state.next_timer);
        state.next_timer += 1;
        let deadline = state.now + delay;
        state.timers.insert((deadline, id), callback);
        id
    }

    fn remove_timeout(&self, timer: TimerId) {
        let mut state = self.state.borrow_mut();
        let key = state.timers.keys().find(|&&(_, id)| id == timer).copied();
        if let Some(key) = key {
            state.timers.remove(&key);
        }
    }
}

// state shared by both ends of an in-memory socket
struct Wire {
    host: String,
    port: u16,
    // taken out while being called
    handler: RefCell<Option<EventHandler>>,
    inbound: RefCell<BytesMut>,
    outbound: RefCell<Vec<u8>>,
    accepted: Cell<bool>,
    remote_closed: Cell<bool>,
    closed: Cell<bool>,
    // remaining bytes the socket accepts before blocking, unlimited if None
    write_budget: Cell<Option<usize>>,
    write_interest: Cell<bool>,
}

impl Wire {
    fn fire(&self, event: SocketEvent) {
        if self.closed.get() {
            return;
        }
        let handler = self.handler.borrow_mut().take();
        let Some(mut handler) = handler else {
            return;
        };
        handler(event);
        if !self.closed.get() {
            *self.handler.borrow_mut() = Some(handler);
        }
    }
}

struct ManualSocket(Rc<Wire>);

impl Socket for ManualSocket {
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let wire = &self.0;
        if !wire.accepted.get() || wire.closed.get() {
            return Err(io::ErrorKind::NotConnected.into());
        }
        let mut inbound = wire.inbound.borrow_mut();
        if inbound.is_empty() {
            return if wire.remote_closed.get() {
                Ok(0)
            } else {
                Err(io::ErrorKind::WouldBlock.into())
            };
        }
        let n = buf.len().min(inbound.len());
        buf[..n].copy_from_slice(&inbound[..n]);
        inbound.advance(n);
        Ok(n)
    }

    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let wire = &self.0;
        if !wire.accepted.get() || wire.closed.get() {
            return Err(io::ErrorKind::NotConnected.into());
        }
        if wire.remote_closed.get() {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        let n = match wire.write_budget.get() {
            Some(0) => return Err(io::ErrorKind::WouldBlock.into()),
            Some(budget) => {
                let n = budget.min(buf.len());
                wire.write_budget.set(Some(budget - n));
                n
            }
            None => buf.len(),
        };
        wire.outbound.borrow_mut().extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn set_write_interest(&mut self, interested: bool) {
        self.0.write_interest.set(interested);
    }

    fn close(&mut self) {
        self.0.closed.set(true);
        let handler = self.0.handler.borrow_mut().take();
        drop(handler);
    }
}

impl Drop for ManualSocket {
    fn drop(&mut self) {
        self.close();
    }
}

/// Remote end of a socket opened through a [`ManualScheduler`].
///
/// Events are delivered synchronously from the method that causes them.
#[derive(Clone)]
pub struct ManualPeer(Rc<Wire>);

impl ManualPeer {
    pub fn host(&self) -> &str {
        &self.0.host
    }

    pub fn port(&self) -> u16 {
        self.0.port
    }

    /// Complete the connection.
    pub fn accept(&self) {
        self.0.accepted.set(true);
        self.0.fire(SocketEvent::Connected);
    }

    /// Fail the socket, whether connected yet or not.
    pub fn fail(&self, kind: io::ErrorKind) {
        self.0.fire(SocketEvent::Error(kind.into()));
    }

    /// Send bytes to the client.
    pub fn send(&self, data: &str) {
        self.0.inbound.borrow_mut().extend_from_slice(data.as_bytes());
        self.0.fire(SocketEvent::Readable);
    }

    /// Close the remote end, so the client reads end of stream.
    pub fn close_remote(&self) {
        self.0.remote_closed.set(true);
        self.0.fire(SocketEvent::Readable);
    }

    /// Take everything the client wrote so far.
    pub fn take_written(&self) -> String {
        let written = std::mem::take(&mut *self.0.outbound.borrow_mut());
        String::from_utf8_lossy(&written).into_owned()
    }

    /// Accept at most `budget` more bytes before writes block.
    pub fn block_writes(&self, budget: usize) {
        self.0.write_budget.set(Some(budget));
    }

    /// Let writes through again, notifying the client if it is waiting to write.
    pub fn unblock_writes(&self) {
        self.0.write_budget.set(None);
        if self.0.write_interest.get() {
            self.0.fire(SocketEvent::Writable);
        }
    }

    /// Whether the client asked to be told when it can write.
    pub fn wants_write(&self) -> bool {
        self.0.write_interest.get()
    }

    /// Whether the client closed the socket.
    pub fn is_closed(&self) -> bool {
        self.0.closed.get()
    }
}
