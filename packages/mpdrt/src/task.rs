// task identity, handles, and the context a task body issues requests through.

use crate::{
    condition::Condition,
    connection::{self, ConnectionState, WeakShared},
    error::{Error, UsageError},
    group::TaskGroup,
    request::{Request, RequestFut, TaskCell},
};
use mpdwire::{is_single_line, Reply};
use std::{
    cell::Cell,
    fmt::{self, Debug, Display, Formatter},
    rc::Rc,
};

/// What a task body returns. Errors are reported to the connection's error hook.
pub type TaskResult = anyhow::Result<()>;

/// Identifier of a task, unique for the lifetime of its connection.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TaskId(pub(crate) u64);

impl TaskId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Display for TaskId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle to a task, which may have finished.
#[derive(Clone)]
pub struct TaskHandle {
    id: TaskId,
    conn: WeakShared,
}

impl TaskHandle {
    pub(crate) fn new(id: TaskId, conn: WeakShared) -> Self {
        TaskHandle { id, conn }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Whether the task has neither finished nor been killed.
    pub fn is_alive(&self) -> bool {
        self.conn
            .upgrade()
            .is_some_and(|shared| connection::task_alive(&shared, self.id))
    }

    /// End the task without resuming it. No-op if it already ended.
    ///
    /// Its pending request is withdrawn, its exit callbacks run, and task groups it owns are
    /// closed. May be called from within the task's own body, in which case the body is dropped
    /// once it next suspends.
    pub fn kill(&self) {
        if let Some(shared) = self.conn.upgrade() {
            connection::finish_task(&shared, self.id, connection::Exit::Killed);
        }
    }

    /// Register a callback to run when the task ends, for any reason.
    ///
    /// Callbacks run in registration order. If the task already ended, runs the callback now.
    pub fn add_exit_callback<F: FnOnce() + 'static>(&self, callback: F) {
        let callback: Box<dyn FnOnce()> = Box::new(callback);
        let unregistered = match self.conn.upgrade() {
            Some(shared) => connection::add_exit_callback(&shared, self.id, callback).err(),
            None => Some(callback),
        };
        if let Some(callback) = unregistered {
            callback();
        }
    }

    /// Condition for this task having ended.
    pub fn finished(&self) -> Condition {
        Condition::Worker(vec![self.id])
    }
}

impl PartialEq for TaskHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.conn.ptr_eq(&other.conn)
    }
}

impl Eq for TaskHandle {}

impl Debug for TaskHandle {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_tuple("TaskHandle").field(&self.id).finish()
    }
}

/// Passed to a task body, through which it issues requests.
pub struct TaskContext {
    id: TaskId,
    cell: Rc<TaskCell>,
    conn: WeakShared,
    state: Rc<Cell<ConnectionState>>,
}

impl TaskContext {
    pub(crate) fn new(
        id: TaskId,
        cell: Rc<TaskCell>,
        conn: WeakShared,
        state: Rc<Cell<ConnectionState>>,
    ) -> Self {
        TaskContext {
            id,
            cell,
            conn,
            state,
        }
    }

    /// Id of the task this context belongs to.
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Send a command and resolve to its reply.
    ///
    /// Fails immediately with [`UsageError::NotConnected`] while disconnected. Commands issued
    /// while connecting are queued until the handshake completes.
    pub fn command(&self, text: impl Into<String>) -> RequestFut<Reply> {
        let text = text.into();
        if let Err(e) = self.check_sendable(&text) {
            return RequestFut::rejected(&self.cell, e);
        }
        RequestFut::new(&self.cell, Request::Command(text))
    }

    /// Send several commands as one command list and resolve to one reply per command.
    ///
    /// An `ACK` for any command fails the whole list, with the failing position in the error.
    pub fn command_list<I, S>(&self, commands: I) -> RequestFut<Vec<Reply>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let commands: Vec<String> = commands.into_iter().map(Into::into).collect();
        if let Err(e) = commands.iter().try_for_each(|text| self.check_sendable(text)) {
            return RequestFut::rejected(&self.cell, e);
        }
        RequestFut::new(&self.cell, Request::CommandList(commands))
    }

    /// Wait until at least one of the conditions holds, resolving to all those that matched, in
    /// the order given.
    ///
    /// Fails immediately with [`UsageError::InvalidSubsystem`] if a subsystem name could not be
    /// sent to the server.
    pub fn wait_for<I>(&self, conditions: I) -> RequestFut<Vec<Condition>>
    where
        I: IntoIterator<Item = Condition>,
    {
        let conditions: Vec<Condition> = conditions.into_iter().collect();
        if conditions.is_empty() {
            return RequestFut::rejected(&self.cell, UsageError::NoConditions.into());
        }
        let invalid = conditions.iter().find_map(|condition| match condition {
            Condition::Subsystem(subsystem) if !subsystem.is_valid() => Some(subsystem),
            _ => None,
        });
        if let Some(subsystem) = invalid {
            let error = UsageError::InvalidSubsystem(subsystem.as_str().to_owned());
            return RequestFut::rejected(&self.cell, error.into());
        }
        RequestFut::new(&self.cell, Request::WaitFor(conditions))
    }

    /// Resolve to a handle to this task.
    pub fn current_task(&self) -> RequestFut<TaskHandle> {
        RequestFut::new(&self.cell, Request::CurrentTask)
    }

    /// Create a task group owned by this task, closed when this task ends.
    pub fn new_task_group(&self) -> Result<TaskGroup, Error> {
        let shared = self.conn.upgrade().ok_or(UsageError::GroupClosed)?;
        connection::new_group(&shared, self.id)
    }

    fn check_sendable(&self, text: &str) -> Result<(), Error> {
        if !is_single_line(text) {
            return Err(UsageError::InvalidCommand(text.to_owned()).into());
        }
        if self.state.get() == ConnectionState::Disconnected {
            return Err(UsageError::NotConnected.into());
        }
        Ok(())
    }
}

impl Debug for TaskContext {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("TaskContext").field("id", &self.id).finish()
    }
}
