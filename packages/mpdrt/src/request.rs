// requests are the only things a task body awaits. awaiting one deposits it in the task's cell and
// returns Pending, the connection picks it up after the poll, and the outcome comes back through
// the same cell before the body is polled again.

use crate::{
    condition::Condition,
    error::{Error, UsageError},
    task::TaskHandle,
};
use mpdwire::Reply;
use std::{
    cell::{Cell, RefCell},
    future::Future,
    marker::PhantomData,
    mem,
    pin::Pin,
    rc::Rc,
    task::{Context, Poll},
};

/// A suspension request raised by a task.
#[derive(Debug)]
pub(crate) enum Request {
    Command(String),
    CommandList(Vec<String>),
    CurrentTask,
    WaitFor(Vec<Condition>),
}

/// Value a task is resumed with.
#[derive(Debug)]
pub(crate) enum Resume {
    Reply(Reply),
    Replies(Vec<Reply>),
    Conditions(Vec<Condition>),
    Task(TaskHandle),
}

/// Mailbox between a task body and the connection stepping it.
#[derive(Debug, Default)]
pub(crate) struct TaskCell {
    pub(crate) request: RefCell<Option<Request>>,
    pub(crate) resume: RefCell<Option<Result<Resume, Error>>>,
    // whether a request has been issued and not yet resumed
    pub(crate) outstanding: Cell<bool>,
}

pub(crate) trait FromResume: Sized {
    fn from_resume(resume: Resume) -> Self;
}

impl FromResume for Reply {
    fn from_resume(resume: Resume) -> Self {
        match resume {
            Resume::Reply(reply) => reply,
            other => unreachable!("resumed with {:?} for a command (internal bug)", other),
        }
    }
}

impl FromResume for Vec<Reply> {
    fn from_resume(resume: Resume) -> Self {
        match resume {
            Resume::Replies(replies) => replies,
            other => unreachable!("resumed with {:?} for a command list (internal bug)", other),
        }
    }
}

impl FromResume for Vec<Condition> {
    fn from_resume(resume: Resume) -> Self {
        match resume {
            Resume::Conditions(conditions) => conditions,
            other => unreachable!("resumed with {:?} for a wait (internal bug)", other),
        }
    }
}

impl FromResume for TaskHandle {
    fn from_resume(resume: Resume) -> Self {
        match resume {
            Resume::Task(handle) => handle,
            other => unreachable!("resumed with {:?} for current task (internal bug)", other),
        }
    }
}

enum Stage {
    Unissued(Request),
    Rejected(Error),
    Issued,
    Done,
}

/// Future for a request issued through a [`TaskContext`](crate::TaskContext).
///
/// Must be awaited from within the body of the task that created it. Only one request per task
/// may be outstanding at a time.
#[must_use = "requests do nothing unless awaited"]
pub struct RequestFut<T> {
    cell: Rc<TaskCell>,
    stage: Stage,
    _output: PhantomData<fn() -> T>,
}

impl<T> RequestFut<T> {
    pub(crate) fn new(cell: &Rc<TaskCell>, request: Request) -> Self {
        RequestFut {
            cell: Rc::clone(cell),
            stage: Stage::Unissued(request),
            _output: PhantomData,
        }
    }

    /// Request which fails upon first poll without suspending.
    pub(crate) fn rejected(cell: &Rc<TaskCell>, error: Error) -> Self {
        RequestFut {
            cell: Rc::clone(cell),
            stage: Stage::Rejected(error),
            _output: PhantomData,
        }
    }
}

impl<T: FromResume> Future for RequestFut<T> {
    type Output = Result<T, Error>;

    fn poll(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match mem::replace(&mut this.stage, Stage::Done) {
            Stage::Rejected(e) => Poll::Ready(Err(e)),
            Stage::Unissued(request) => {
                if this.cell.outstanding.get() {
                    return Poll::Ready(Err(UsageError::ConcurrentRequest.into()));
                }
                this.cell.outstanding.set(true);
                *this.cell.request.borrow_mut() = Some(request);
                this.stage = Stage::Issued;
                Poll::Pending
            }
            Stage::Issued => match this.cell.resume.borrow_mut().take() {
                Some(result) => {
                    this.cell.outstanding.set(false);
                    Poll::Ready(result.map(T::from_resume))
                }
                None => {
                    // polled by something other than the connection, such as a join
                    this.stage = Stage::Issued;
                    Poll::Pending
                }
            },
            Stage::Done => panic!("RequestFut polled after completion"),
        }
    }
}
