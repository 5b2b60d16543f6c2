//! The connection: wire framing, request dispatch, condition matching, and task stepping.
//!
//! All state lives in one `Inner` behind an `Rc<RefCell<_>>`. The borrow is never held while
//! user code runs, which means task bodies, exit callbacks, and the error hook. Scheduler
//! callbacks and handles reach it through weak references.

mod active;
mod delivery;
mod passive;
#[cfg(test)]
mod tests;

use self::{
    active::{ActiveEntry, ActiveQueue, Completion, IdleFilter, Op},
    delivery::{Delivery, DeliveryQueue},
    passive::{ArmedTimer, PassiveEntry, PassiveSet, WakeState},
};
use crate::{
    condition::{Condition, Subsystem},
    error::{DisconnectReason, Error, ProtocolError, ReplyError, UsageError},
    group::{GroupId, TaskGroup},
    request::{Request, Resume, TaskCell},
    scheduler::{EventHandler, Scheduler, Socket, SocketEvent},
    target::Target,
    task::{TaskContext, TaskHandle, TaskId, TaskResult},
};
use bytes::{Buf, BytesMut};
use futures::{future::LocalBoxFuture, task::noop_waker_ref};
use mpdwire::{write_line, Ack, LineBuffer, DEFAULT_MAX_LINE_LEN, NOIDLE};
use smallvec::SmallVec;
use std::{
    cell::{Cell, RefCell},
    collections::{BTreeSet, HashMap},
    fmt::{self, Debug, Formatter},
    future::Future,
    io,
    rc::{Rc, Weak},
    task::{Context, Poll},
    time::Duration,
};


pub(crate) type Shared = Rc<RefCell<Inner>>;
pub(crate) type WeakShared = Weak<RefCell<Inner>>;

type ErrorHook = Rc<dyn Fn(TaskId, &anyhow::Error)>;

// size of the stack buffer socket reads go through
const READ_CHUNK: usize = 4096;

/// Lifecycle state of a [`Connection`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    /// The socket is being established, or the greeting and password exchange is in progress.
    Connecting,
    Connected,
}

/// Tunables for a [`Connection`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Longest inbound line accepted before disconnecting with a protocol error.
    pub max_line_len: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_line_len: DEFAULT_MAX_LINE_LEN,
        }
    }
}

/// How a task ended.
pub(crate) enum Exit {
    Returned,
    Failed(anyhow::Error),
    Killed,
}

pub(crate) struct Inner {
    this: WeakShared,
    scheduler: Rc<dyn Scheduler>,
    // shared with task contexts, so they can reject commands without borrowing
    state: Rc<Cell<ConnectionState>>,
    // distinguishes a socket's events from those of sockets it replaced
    generation: u64,
    socket: Option<Box<dyn Socket>>,
    // whether the socket finished connecting and may be written
    socket_open: bool,
    write_interest: bool,
    password: Option<String>,
    server_version: Option<String>,
    input: LineBuffer,
    output: BytesMut,

    active: ActiveQueue,
    passive: PassiveSet,
    delivery: DeliveryQueue,
    // whether a tick is scheduled or running. it drains deliveries queued in the meantime
    tick_pending: bool,

    tasks: HashMap<TaskId, TaskState>,
    groups: HashMap<GroupId, GroupState>,
    next_task_id: u64,
    next_group_id: u64,
    next_wait_serial: u64,
    error_hook: ErrorHook,
}

struct TaskState {
    group: GroupId,
    // taken out while being polled
    body: Option<LocalBoxFuture<'static, TaskResult>>,
    cell: Rc<TaskCell>,
    exit_callbacks: Vec<Box<dyn FnOnce()>>,
    owned_groups: Vec<GroupId>,
}

struct GroupState {
    tasks: BTreeSet<TaskId>,
    // task whose end closes this group
    owner: Option<TaskId>,
}

fn log_task_error(task: TaskId, e: &anyhow::Error) {
    error!(%task, error = %e, "task failed with uncaught error");
}

/// Client connection that runs tasks against one server.
///
/// Cloning yields another handle to the same connection.
#[derive(Clone)]
pub struct Connection(Shared);

impl Connection {
    /// Construct disconnected, driven by `scheduler`.
    pub fn new(scheduler: Rc<dyn Scheduler>) -> Self {
        Self::with_config(scheduler, Config::default())
    }

    pub fn with_config(scheduler: Rc<dyn Scheduler>, config: Config) -> Self {
        Connection(Rc::new_cyclic(|this| {
            RefCell::new(Inner {
                this: this.clone(),
                scheduler,
                state: Rc::new(Cell::new(ConnectionState::Disconnected)),
                generation: 0,
                socket: None,
                socket_open: false,
                write_interest: false,
                password: None,
                server_version: None,
                input: LineBuffer::with_max_line_len(config.max_line_len),
                output: BytesMut::new(),
                active: ActiveQueue::default(),
                passive: PassiveSet::default(),
                delivery: DeliveryQueue::default(),
                tick_pending: false,
                tasks: HashMap::new(),
                groups: HashMap::new(),
                next_task_id: 0,
                next_group_id: 0,
                next_wait_serial: 0,
                error_hook: Rc::new(log_task_error),
            })
        }))
    }

    /// Start connecting to `target`.
    ///
    /// If not disconnected, first disconnects with [`DisconnectReason::Reconnect`]. Errors only if
    /// connecting could not even be started, in which case the connection is disconnected with
    /// [`DisconnectReason::FailedConnect`].
    pub fn connect(&self, target: &Target) -> Result<(), Error> {
        self.0.borrow_mut().connect(target)
    }

    /// Drop the connection, failing every pending request with `reason`.
    pub fn disconnect(&self, reason: DisconnectReason) {
        self.0.borrow_mut().disconnect(reason);
    }

    /// Disconnect with [`DisconnectReason::Shutdown`], then close every task group.
    pub fn shutdown(&self) {
        self.disconnect(DisconnectReason::Shutdown);
        let groups: Vec<GroupId> = self.0.borrow().groups.keys().copied().collect();
        for group in groups {
            close_group(&self.0, group);
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.0.borrow().state.get()
    }

    /// Whether an `idle` is on the wire and its reply is not yet complete.
    pub fn awaiting_idle_reply(&self) -> bool {
        self.0.borrow().active.awaiting_idle_reply()
    }

    /// Protocol version from the server's greeting, once received.
    pub fn server_version(&self) -> Option<String> {
        self.0.borrow().server_version.clone()
    }

    /// Create a top-level task group. It lives until closed or until [`Connection::shutdown`],
    /// however many of its handles are dropped.
    pub fn new_task_group(&self) -> TaskGroup {
        let id = self.0.borrow_mut().create_group(None);
        TaskGroup::new(id, Rc::downgrade(&self.0))
    }

    /// Replace the hook that receives errors returned by task bodies.
    ///
    /// By default they are logged.
    pub fn set_error_hook<F>(&self, hook: F)
    where
        F: Fn(TaskId, &anyhow::Error) + 'static,
    {
        self.0.borrow_mut().error_hook = Rc::new(hook);
    }
}

impl Debug for Connection {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let inner = self.0.borrow();
        f.debug_struct("Connection")
            .field("state", &inner.state.get())
            .field("tasks", &inner.tasks.len())
            .field("active", &inner.active.len())
            .field("passive", &inner.passive.len())
            .field("deliveries", &inner.delivery.len())
            .finish()
    }
}

// ==== socket events ====

fn on_socket_event(shared: &Shared, generation: u64, event: SocketEvent) {
    let mut inner = shared.borrow_mut();
    if inner.generation != generation || inner.socket.is_none() {
        trace!(?event, "ignoring event from replaced socket");
        return;
    }
    match event {
        SocketEvent::Connected => {
            trace!("socket connected");
            inner.socket_open = true;
            inner.settle(&[]);
        }
        SocketEvent::Readable => inner.on_readable(),
        SocketEvent::Writable => inner.flush(),
        SocketEvent::Error(e) => {
            let reason = match inner.state.get() {
                ConnectionState::Connecting => DisconnectReason::FailedConnect,
                _ => DisconnectReason::Error,
            };
            warn!(%e, %reason, "socket error");
            inner.disconnect(reason);
        }
    }
}

fn on_wait_timeout(shared: &Shared, task: TaskId, serial: u64, condition: usize) {
    let mut inner = shared.borrow_mut();
    if inner.passive.mark_elapsed(task, serial, condition) {
        trace!(%task, "wait timed out");
        inner.settle(&[]);
    }
}

impl Inner {
    fn connect(&mut self, target: &Target) -> Result<(), Error> {
        if self.state.get() != ConnectionState::Disconnected {
            self.disconnect(DisconnectReason::Reconnect);
        }
        self.generation += 1;
        let generation = self.generation;
        let this = self.this.clone();
        let handler: EventHandler = Box::new(move |event| {
            if let Some(shared) = this.upgrade() {
                on_socket_event(&shared, generation, event);
            }
        });

        info!(host = %target.host, port = target.port, "connecting");
        self.state.set(ConnectionState::Connecting);
        self.password = target.password.clone();
        self.server_version = None;
        match self.scheduler.connect_and_poll(&target.host, target.port, handler) {
            Ok(socket) => {
                self.socket = Some(socket);
                self.active.push_back(ActiveEntry::new(None, Op::Greeting));
                Ok(())
            }
            Err(e) => {
                warn!(%e, "failed to start connecting");
                self.disconnect(DisconnectReason::FailedConnect);
                Err(Error::Disconnect(DisconnectReason::FailedConnect))
            }
        }
    }

    fn disconnect(&mut self, reason: DisconnectReason) {
        let was = self.state.replace(ConnectionState::Disconnected);
        if let Some(mut socket) = self.socket.take() {
            socket.close();
        }
        self.socket_open = false;
        self.write_interest = false;
        self.input.clear();
        self.output.clear();

        let mut pending = self.active.drain_owners();
        for entry in self.passive.drain() {
            self.cancel_timers(&entry);
            pending.push(entry.task);
        }
        debug_assert!(
            self.active.is_empty() && self.passive.is_empty(),
            "requests survived disconnect (internal bug)"
        );
        if was != ConnectionState::Disconnected {
            info!(%reason, pending = pending.len(), "disconnected");
        } else {
            debug!(%reason, pending = pending.len(), "disconnect while already disconnected");
        }
        for task in pending {
            self.deliver(task, Delivery::Resume(Err(Error::Disconnect(reason))));
        }
    }

    fn protocol_error(&mut self, e: ProtocolError) {
        error!(%e, "protocol error");
        self.disconnect(DisconnectReason::Error);
    }

    fn on_readable(&mut self) {
        let mut buf = [0; READ_CHUNK];
        let mut eof = false;
        loop {
            let Some(socket) = self.socket.as_mut() else {
                return;
            };
            match socket.try_read(&mut buf) {
                Ok(0) => {
                    eof = true;
                    break;
                }
                Ok(n) => self.input.extend(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => (),
                Err(e) => {
                    warn!(%e, "read failed");
                    self.disconnect(DisconnectReason::Error);
                    return;
                }
            }
        }

        // lines which arrived before the end of stream are still processed
        while self.socket.is_some() {
            let line = match self.input.next_line() {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => return self.protocol_error(e.into()),
            };
            trace!(%line, "received");
            if let Err(e) = self.on_line(&line) {
                return self.protocol_error(e);
            }
        }

        if eof && self.socket.is_some() {
            info!("server closed the connection");
            self.disconnect(DisconnectReason::Error);
        }
    }

    fn on_line(&mut self, line: &str) -> Result<(), ProtocolError> {
        let head = match self.active.front_mut() {
            Some(head) if head.written => head,
            _ => return Err(ProtocolError::Unsolicited(line.to_owned())),
        };
        let Some(completion) = head.feed(line)? else {
            return Ok(());
        };
        let owner = head.owner;
        self.active.pop_front();

        let mut changed = Vec::new();
        match completion {
            Completion::Greeting(version) => {
                debug!(%version, "received greeting");
                self.server_version = Some(version);
                match self.password.clone() {
                    Some(password) => {
                        self.active.push_front(ActiveEntry::new(None, Op::Password(password)))
                    }
                    None => self.set_connected(),
                }
            }
            Completion::Password(Ok(())) => self.set_connected(),
            Completion::Password(Err(ack)) => {
                warn!(%ack, "password rejected");
                self.disconnect(DisconnectReason::BadPassword);
                return Ok(());
            }
            Completion::Reply(result) => {
                let result = result.map(Resume::Reply).map_err(|ack| ReplyError(ack).into());
                self.resolve(owner, result);
            }
            Completion::Replies(result) => {
                let result = result.map(Resume::Replies).map_err(|ack| ReplyError(ack).into());
                self.resolve(owner, result);
            }
            Completion::Idle(subsystems) => {
                trace!(?subsystems, "idle returned");
                changed = subsystems;
            }
            Completion::IdleFailed { filter, ack } => self.fail_idle_waiters(&filter, ack),
        }
        self.settle(&changed);
        Ok(())
    }

    fn set_connected(&mut self) {
        self.state.set(ConnectionState::Connected);
        info!(version = ?self.server_version, "connected");
    }

    fn resolve(&mut self, owner: Option<TaskId>, result: Result<Resume, Error>) {
        match owner {
            Some(task) => self.deliver(task, Delivery::Resume(result)),
            None => trace!("discarding reply to withdrawn request"),
        }
    }

    // ==== bringing the wire up to date ====

    // run after anything that may have changed what is queued, what is waited on, or what holds.
    // while a tick is pending, the tasks it steps may still queue requests, so the idle is left
    // alone until the tick ends
    fn settle(&mut self, changed: &[Subsystem]) {
        self.wake(changed);
        if !self.tick_pending {
            self.sync_idle();
        }
        self.pump();
        self.flush();
    }

    fn wake_state<'a>(
        &self,
        changed: &'a [Subsystem],
        alive: &'a dyn Fn(TaskId) -> bool,
    ) -> WakeState<'a> {
        WakeState {
            changed,
            connected: self.state.get() == ConnectionState::Connected,
            quiescent: self.active.is_quiescent(),
            alive,
        }
    }

    // resume every waiter with a condition that holds
    fn wake(&mut self, changed: &[Subsystem]) {
        let tasks = &self.tasks;
        let alive = |task: TaskId| tasks.contains_key(&task);
        let state = self.wake_state(changed, &alive);
        let matched = self.passive.take_matched(&state);
        for (entry, conditions) in matched {
            self.cancel_timers(&entry);
            trace!(task = %entry.task, ?conditions, "wait satisfied");
            self.deliver(entry.task, Delivery::Resume(Ok(Resume::Conditions(conditions))));
        }
    }

    // issue or cancel the shared idle so that one is outstanding exactly when connected, some
    // waiter needs one, and nothing else is queued
    fn sync_idle(&mut self) {
        if self.state.get() != ConnectionState::Connected {
            return;
        }
        let wanted = self.passive.idle_filter();
        let commands_queued = !self.active.is_quiescent();
        match self.active.front_mut() {
            Some(ActiveEntry {
                op: Op::Idle { filter, cancelling, .. },
                written: true,
                ..
            }) => {
                let covered = wanted.as_ref().is_some_and(|wanted| filter.covers(wanted));
                if !*cancelling && (commands_queued || !covered) {
                    trace!(?filter, ?wanted, commands_queued, "cancelling idle");
                    *cancelling = true;
                    write_line(&mut self.output, NOIDLE);
                }
            }
            Some(_) => (),
            None => {
                if let Some(filter) = wanted {
                    trace!(?filter, "issuing idle");
                    self.active.push_back(ActiveEntry::idle(filter));
                }
            }
        }
    }

    // write the head if it is not yet written
    fn pump(&mut self) {
        if !self.socket_open {
            return;
        }
        let Some(head) = self.active.front_mut() else {
            return;
        };
        if head.written {
            return;
        }
        head.write(&mut self.output);
        trace!(op = head.op.describe(), "request written");
    }

    fn flush(&mut self) {
        if !self.socket_open {
            return;
        }
        while !self.output.is_empty() {
            let Some(socket) = self.socket.as_mut() else {
                return;
            };
            match socket.try_write(&self.output) {
                Ok(0) => {
                    warn!("socket accepted no bytes");
                    self.disconnect(DisconnectReason::Error);
                    return;
                }
                Ok(n) => self.output.advance(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if !self.write_interest {
                        self.write_interest = true;
                        socket.set_write_interest(true);
                    }
                    return;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => (),
                Err(e) => {
                    warn!(%e, "write failed");
                    self.disconnect(DisconnectReason::Error);
                    return;
                }
            }
        }
        if self.write_interest {
            self.write_interest = false;
            if let Some(socket) = self.socket.as_mut() {
                socket.set_write_interest(false);
            }
        }
    }

    // ==== deliveries ====

    fn deliver(&mut self, task: TaskId, delivery: Delivery) {
        if !self.delivery.push(task, delivery) {
            trace!(%task, "task already has a delivery queued, dropping");
        }
        self.ensure_tick();
    }

    fn ensure_tick(&mut self) {
        if self.tick_pending || self.delivery.is_empty() {
            return;
        }
        self.tick_pending = true;
        let this = self.this.clone();
        self.scheduler.add_timeout(
            Duration::ZERO,
            Box::new(move || {
                if let Some(shared) = this.upgrade() {
                    run_tick(&shared);
                }
            }),
        );
    }

    // ==== requests ====

    fn dispatch(&mut self, task: TaskId, request: Request) {
        match request {
            Request::Command(_) | Request::CommandList(_)
                if self.state.get() == ConnectionState::Disconnected =>
            {
                self.deliver(task, Delivery::Resume(Err(UsageError::NotConnected.into())));
            }
            Request::Command(text) => {
                trace!(%task, %text, "command queued");
                self.active.push_back(ActiveEntry::command(task, text));
            }
            Request::CommandList(commands) if commands.is_empty() => {
                self.deliver(task, Delivery::Resume(Ok(Resume::Replies(Vec::new()))));
            }
            Request::CommandList(commands) => {
                trace!(%task, len = commands.len(), "command list queued");
                self.active.push_back(ActiveEntry::command_list(task, commands));
            }
            Request::CurrentTask => {
                let handle = TaskHandle::new(task, self.this.clone());
                self.deliver(task, Delivery::Resume(Ok(Resume::Task(handle))));
            }
            Request::WaitFor(conditions) => self.register_wait(task, conditions),
        }
        self.settle(&[]);
    }

    fn register_wait(&mut self, task: TaskId, conditions: Vec<Condition>) {
        if conditions.is_empty() {
            let error = UsageError::NoConditions.into();
            return self.deliver(task, Delivery::Resume(Err(error)));
        }

        let tasks = &self.tasks;
        let alive = |task: TaskId| tasks.contains_key(&task);
        let state = self.wake_state(&[], &alive);
        let matched = state.matching(&conditions, &[]);
        if !matched.is_empty() {
            trace!(%task, ?matched, "wait already satisfied");
            return self.deliver(task, Delivery::Resume(Ok(Resume::Conditions(matched))));
        }

        let serial = self.next_wait_serial;
        self.next_wait_serial += 1;
        let mut timers = SmallVec::new();
        for (index, condition) in conditions.iter().enumerate() {
            if let Condition::Timeout(delay) = condition {
                let this = self.this.clone();
                let id = self.scheduler.add_timeout(
                    *delay,
                    Box::new(move || {
                        if let Some(shared) = this.upgrade() {
                            on_wait_timeout(&shared, task, serial, index);
                        }
                    }),
                );
                timers.push(ArmedTimer {
                    id,
                    condition: index,
                    elapsed: false,
                });
            }
        }
        trace!(%task, ?conditions, "waiting");
        self.passive.insert(PassiveEntry {
            task,
            serial,
            conditions,
            timers,
        });
    }

    // the connection stays up. waiters whose subsystems went into the rejected filter fail, and the
    // rest get a fresh idle on the next settle
    fn fail_idle_waiters(&mut self, filter: &IdleFilter, ack: Ack) {
        let failed = self.passive.take_if(|entry| {
            entry.conditions.iter().any(|condition| filter.includes(condition))
        });
        warn!(%ack, ?filter, waiters = failed.len(), "idle rejected");
        for entry in failed {
            self.cancel_timers(&entry);
            let error = ReplyError(ack.clone()).into();
            self.deliver(entry.task, Delivery::Resume(Err(error)));
        }
    }

    fn cancel_timers(&self, entry: &PassiveEntry) {
        for timer in entry.timers.iter().filter(|timer| !timer.elapsed) {
            self.scheduler.remove_timeout(timer.id);
        }
    }

    // ==== tasks and groups ====

    fn create_group(&mut self, owner: Option<TaskId>) -> GroupId {
        self.next_group_id += 1;
        let id = GroupId(self.next_group_id);
        self.groups.insert(
            id,
            GroupState {
                tasks: BTreeSet::new(),
                owner,
            },
        );
        if let Some(state) = owner.and_then(|owner| self.tasks.get_mut(&owner)) {
            state.owned_groups.push(id);
        }
        trace!(group = %id, ?owner, "task group created");
        id
    }

    // remove every trace of a task that just left the task table
    fn withdraw(&mut self, task: TaskId, group: GroupId) {
        if let Some(group) = self.groups.get_mut(&group) {
            group.tasks.remove(&task);
        }
        self.active.withdraw(task);
        if let Some(entry) = self.passive.remove(task) {
            self.cancel_timers(&entry);
        }
        self.delivery.remove(task);
    }
}

fn run_tick(shared: &Shared) {
    loop {
        let next = shared.borrow_mut().delivery.pop();
        let Some((task, delivery)) = next else {
            break;
        };
        step_task(shared, task, delivery);
    }
    let mut inner = shared.borrow_mut();
    inner.tick_pending = false;
    inner.settle(&[]);
}

// poll a task's body once, then act on what it suspended with
fn step_task(shared: &Shared, task: TaskId, delivery: Delivery) {
    let taken = {
        let mut inner = shared.borrow_mut();
        match inner.tasks.get_mut(&task) {
            Some(state) => state.body.take().map(|body| (body, Rc::clone(&state.cell))),
            None => None,
        }
    };
    let Some((mut body, cell)) = taken else {
        trace!(%task, "dropping delivery to finished task");
        return;
    };

    if let Delivery::Resume(result) = delivery {
        *cell.resume.borrow_mut() = Some(result);
    }
    let poll = body
        .as_mut()
        .poll(&mut Context::from_waker(noop_waker_ref()));

    match poll {
        Poll::Ready(result) => {
            drop(body);
            let exit = match result {
                Ok(()) => Exit::Returned,
                Err(e) => Exit::Failed(e),
            };
            finish_task(shared, task, exit);
        }
        Poll::Pending => {
            let request = cell.request.borrow_mut().take();
            let mut inner = shared.borrow_mut();
            if !inner.tasks.contains_key(&task) {
                // killed from within its own body
                drop(inner);
                drop(body);
                return;
            }
            if let Some(state) = inner.tasks.get_mut(&task) {
                state.body = Some(body);
            }
            match request {
                Some(request) => inner.dispatch(task, request),
                None => {
                    drop(inner);
                    warn!(%task, "task suspended on something other than a request");
                    let error = Error::from(UsageError::ForeignAwait);
                    finish_task(shared, task, Exit::Failed(error.into()));
                }
            }
        }
    }
}

pub(crate) fn spawn<F, Fut>(shared: &Shared, group: GroupId, body: F) -> Result<TaskHandle, Error>
where
    F: FnOnce(TaskContext) -> Fut,
    Fut: Future<Output = TaskResult> + 'static,
{
    let cx = {
        let mut inner = shared.borrow_mut();
        if !inner.groups.contains_key(&group) {
            return Err(UsageError::GroupClosed.into());
        }
        inner.next_task_id += 1;
        let id = TaskId(inner.next_task_id);
        if let Some(group_state) = inner.groups.get_mut(&group) {
            group_state.tasks.insert(id);
        }

        let cell = Rc::new(TaskCell::default());
        let cx = TaskContext::new(
            id,
            Rc::clone(&cell),
            Rc::downgrade(shared),
            Rc::clone(&inner.state),
        );
        inner.tasks.insert(
            id,
            TaskState {
                group,
                body: None,
                cell,
                exit_callbacks: Vec::new(),
                owned_groups: Vec::new(),
            },
        );
        debug!(task = %id, %group, "task spawned");
        cx
    };
    let id = cx.id();

    // constructing the body runs user code, so happens outside the borrow
    let body: LocalBoxFuture<'static, TaskResult> = Box::pin(body(cx));

    let mut inner = shared.borrow_mut();
    if inner.tasks.contains_key(&id) {
        if let Some(state) = inner.tasks.get_mut(&id) {
            state.body = Some(body);
        }
        inner.deliver(id, Delivery::Start);
    } else {
        // killed before its body existed
        drop(inner);
        drop(body);
    }
    Ok(TaskHandle::new(id, Rc::downgrade(shared)))
}

/// End a task, if it has not ended yet.
pub(crate) fn finish_task(shared: &Shared, task: TaskId, exit: Exit) {
    let (state, hook) = {
        let mut inner = shared.borrow_mut();
        let Some(state) = inner.tasks.remove(&task) else {
            return;
        };
        inner.withdraw(task, state.group);
        match &exit {
            Exit::Returned => debug!(%task, "task finished"),
            Exit::Failed(e) => debug!(%task, error = %e, "task failed"),
            Exit::Killed => debug!(%task, "task killed"),
        }
        // its end may satisfy worker conditions, and its withdrawal may leave the idle stale
        inner.settle(&[]);
        (state, Rc::clone(&inner.error_hook))
    };

    let TaskState {
        body,
        exit_callbacks,
        owned_groups,
        ..
    } = state;
    drop(body);
    for group in owned_groups {
        close_group(shared, group);
    }
    for callback in exit_callbacks {
        callback();
    }
    if let Exit::Failed(e) = exit {
        hook(task, &e);
    }
}

pub(crate) fn close_group(shared: &Shared, group: GroupId) {
    let tasks = {
        let mut inner = shared.borrow_mut();
        let Some(state) = inner.groups.remove(&group) else {
            return;
        };
        if let Some(owner) = state.owner.and_then(|owner| inner.tasks.get_mut(&owner)) {
            owner.owned_groups.retain(|&owned| owned != group);
        }
        debug!(%group, tasks = state.tasks.len(), "task group closed");
        state.tasks
    };
    for task in tasks {
        finish_task(shared, task, Exit::Killed);
    }
}

/// Create a group owned by a live task.
pub(crate) fn new_group(shared: &Shared, owner: TaskId) -> Result<TaskGroup, Error> {
    let mut inner = shared.borrow_mut();
    if !inner.tasks.contains_key(&owner) {
        return Err(UsageError::GroupClosed.into());
    }
    let id = inner.create_group(Some(owner));
    Ok(TaskGroup::new(id, Rc::downgrade(shared)))
}

pub(crate) fn task_alive(shared: &Shared, task: TaskId) -> bool {
    shared.borrow().tasks.contains_key(&task)
}

/// Register an exit callback, handing it back if the task already ended.
pub(crate) fn add_exit_callback(
    shared: &Shared,
    task: TaskId,
    callback: Box<dyn FnOnce()>,
) -> Result<(), Box<dyn FnOnce()>> {
    let mut inner = shared.borrow_mut();
    let Some(state) = inner.tasks.get_mut(&task) else {
        return Err(callback);
    };
    state.exit_callbacks.push(callback);
    Ok(())
}

/// The live tasks of a group, or none if it is closed.
pub(crate) fn group_tasks(shared: &Shared, group: GroupId) -> Option<Vec<TaskId>> {
    let inner = shared.borrow();
    let state = inner.groups.get(&group)?;
    Some(state.tasks.iter().copied().collect())
}
