// task groups own tasks and kill them all when closed.

use crate::{
    connection::{self, WeakShared},
    error::{Error, UsageError},
    task::{TaskContext, TaskHandle, TaskResult},
};
use std::{
    fmt::{self, Debug, Display, Formatter},
    future::Future,
};

#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub(crate) struct GroupId(pub(crate) u64);

impl Display for GroupId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Owner of a set of tasks on one connection.
///
/// Closing the group kills every task in it, and a closed group accepts no new tasks. Groups
/// created from a [`TaskContext`] are closed when their owning task ends.
///
/// Dropping the last handle to a group does not close it. Tasks in a top-level group keep running
/// until [`TaskGroup::close`] or [`Connection::shutdown`](crate::Connection::shutdown).
#[derive(Clone)]
pub struct TaskGroup {
    id: GroupId,
    conn: WeakShared,
}

impl TaskGroup {
    pub(crate) fn new(id: GroupId, conn: WeakShared) -> Self {
        TaskGroup { id, conn }
    }

    /// Spawn a task running `body`.
    ///
    /// The body is first polled on the next scheduling tick, never synchronously. Fails with
    /// [`UsageError::GroupClosed`] if the group is closed.
    pub fn spawn<F, Fut>(&self, body: F) -> Result<TaskHandle, Error>
    where
        F: FnOnce(TaskContext) -> Fut,
        Fut: Future<Output = TaskResult> + 'static,
    {
        let shared = self.conn.upgrade().ok_or(UsageError::GroupClosed)?;
        connection::spawn(&shared, self.id, body)
    }

    /// Kill every task in the group and reject further spawns. No-op if already closed.
    pub fn close(&self) {
        if let Some(shared) = self.conn.upgrade() {
            connection::close_group(&shared, self.id);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.conn
            .upgrade()
            .map_or(true, |shared| connection::group_tasks(&shared, self.id).is_none())
    }

    /// Handles to the live tasks in the group, in spawn order.
    pub fn tasks(&self) -> Vec<TaskHandle> {
        self.conn
            .upgrade()
            .and_then(|shared| connection::group_tasks(&shared, self.id))
            .unwrap_or_default()
            .into_iter()
            .map(|id| TaskHandle::new(id, self.conn.clone()))
            .collect()
    }
}

impl Debug for TaskGroup {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_tuple("TaskGroup").field(&self.id).finish()
    }
}
