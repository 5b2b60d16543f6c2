//! Scheduler backed by a tokio `LocalSet`.

use super::*;
use crate::util::abort_on_drop::AbortOnDrop;
use std::{
    cell::{Cell, OnceCell, RefCell},
    collections::HashMap,
    io,
    rc::{Rc, Weak},
    time::Duration,
};
use tokio::{
    io::Interest,
    net::TcpStream,
    sync::Notify,
};


/// [`Scheduler`] running sockets and timers as local tasks on the current tokio `LocalSet`.
///
/// Must be used from within `LocalSet::run_until`, or from a task spawned onto a `LocalSet`.
/// Timers use tokio's clock, so a runtime with the time driver enabled is required.
pub struct TokioScheduler {
    this: Weak<TokioScheduler>,
    next_timer: Cell<u64>,
    timers: RefCell<HashMap<TimerId, AbortOnDrop>>,
}

impl TokioScheduler {
    pub fn new() -> Rc<Self> {
        Rc::new_cyclic(|this| TokioScheduler {
            this: this.clone(),
            next_timer: Cell::new(0),
            timers: RefCell::new(HashMap::new()),
        })
    }
}

impl Scheduler for TokioScheduler {
    fn connect_and_poll(
        &self,
        host: &str,
        port: u16,
        handler: EventHandler,
    ) -> io::Result<Box<dyn Socket>> {
        let shared = Rc::new(SocketShared::default());
        let pump = AbortOnDrop::spawn_local(pump(host.to_owned(), port, Rc::clone(&shared), handler));
        Ok(Box::new(TokioSocket {
            shared,
            pump: Some(pump),
        }))
    }

    fn add_timeout(&self, delay: Duration, callback: Box<dyn FnOnce()>) -> TimerId {
        let id = TimerId(self.next_timer.get());
        self.next_timer.set(id.0 + 1);
        let this = self.this.clone();
        let task = AbortOnDrop::spawn_local(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            // about to finish anyways, and dropping it would abort us before the callback runs
            if let Some(this) = this.upgrade() {
                let entry = this.timers.borrow_mut().remove(&id);
                if let Some(entry) = entry {
                    entry.disarm();
                }
            }
            callback();
        });
        self.timers.borrow_mut().insert(id, task);
        id
    }

    fn remove_timeout(&self, timer: TimerId) {
        let removed = self.timers.borrow_mut().remove(&timer);
        drop(removed);
    }
}

// state shared between a socket and the task pumping its readiness
#[derive(Default)]
struct SocketShared {
    // set once connected
    stream: OnceCell<TcpStream>,
    write_interest: Cell<bool>,
    closed: Cell<bool>,
    // wakes the pump to reconsider its interest
    notify: Notify,
}

// connect, then translate readiness into events until closed
async fn pump(host: String, port: u16, shared: Rc<SocketShared>, mut handler: EventHandler) {
    let stream = match TcpStream::connect((host.as_str(), port)).await {
        Ok(stream) => stream,
        Err(e) => {
            if !shared.closed.get() {
                handler(SocketEvent::Error(e));
            }
            return;
        }
    };
    if let Err(e) = stream.set_nodelay(true) {
        debug!(%e, "failed to set TCP_NODELAY");
    }
    if shared.stream.set(stream).is_err() || shared.closed.get() {
        return;
    }
    trace!(%host, port, "socket connected");
    handler(SocketEvent::Connected);

    while !shared.closed.get() {
        let Some(stream) = shared.stream.get() else {
            return;
        };
        let mut interest = Interest::READABLE;
        if shared.write_interest.get() {
            interest = interest.add(Interest::WRITABLE);
        }
        let ready = tokio::select! {
            ready = stream.ready(interest) => Some(ready),
            () = shared.notify.notified() => None,
        };
        let Some(ready) = ready else {
            continue;
        };
        match ready {
            Ok(ready) => {
                if (ready.is_readable() || ready.is_read_closed()) && !shared.closed.get() {
                    handler(SocketEvent::Readable);
                }
                if ready.is_writable() && !shared.closed.get() {
                    handler(SocketEvent::Writable);
                }
            }
            Err(e) => {
                if !shared.closed.get() {
                    handler(SocketEvent::Error(e));
                }
                return;
            }
        }
    }
}

struct TokioSocket {
    shared: Rc<SocketShared>,
    pump: Option<AbortOnDrop>,
}

impl TokioSocket {
    fn stream(&self) -> io::Result<&TcpStream> {
        self.shared
            .stream
            .get()
            .ok_or_else(|| io::ErrorKind::NotConnected.into())
    }
}

impl Socket for TokioSocket {
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream()?.try_read(buf)
    }

    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream()?.try_write(buf)
    }

    fn set_write_interest(&mut self, interested: bool) {
        self.shared.write_interest.set(interested);
        self.shared.notify.notify_one();
    }

    fn close(&mut self) {
        self.shared.closed.set(true);
        self.shared.notify.notify_one();
        self.pump.take();
    }
}

impl Drop for TokioSocket {
    fn drop(&mut self) {
        self.close();
    }
}
