// the ordered queue of operations that occupy the wire. only the head is ever written, and every
// inbound line belongs to the head.

use crate::{
    condition::{Condition, Subsystem},
    error::ProtocolError,
    task::TaskId,
};
use bytes::BytesMut;
use mpdwire::{
    idle_command,
    password_command,
    split_pair,
    write_command_list,
    write_line,
    Ack,
    Reply,
    ReplyLine,
};
use std::{
    collections::{BTreeSet, VecDeque},
    mem,
};


#[derive(Default)]
pub(crate) struct ActiveQueue(VecDeque<ActiveEntry>);

pub(crate) struct ActiveEntry {
    // task to resume with the outcome. none for internal operations, and for an entry whose task
    // was killed after the entry was written, whose reply must still be consumed
    pub(crate) owner: Option<TaskId>,
    pub(crate) op: Op,
    pub(crate) written: bool,
}

/// Subsystems an outstanding `idle` reports on.
#[derive(Debug, Clone, Eq, PartialEq)]
pub(crate) enum IdleFilter {
    All,
    Only(BTreeSet<Subsystem>),
}

impl IdleFilter {
    /// Whether an idle with this filter reports every change `wanted` asks for.
    pub(crate) fn covers(&self, wanted: &IdleFilter) -> bool {
        match (self, wanted) {
            (IdleFilter::All, _) => true,
            (IdleFilter::Only(_), IdleFilter::All) => false,
            (IdleFilter::Only(have), IdleFilter::Only(want)) => want.is_subset(have),
        }
    }

    /// Whether waiting on `condition` contributed to this filter.
    pub(crate) fn includes(&self, condition: &Condition) -> bool {
        match (self, condition) {
            (IdleFilter::All, condition) => condition.needs_idle(),
            (IdleFilter::Only(subsystems), Condition::Subsystem(subsystem)) => {
                subsystems.contains(subsystem)
            }
            (IdleFilter::Only(_), _) => false,
        }
    }
}

pub(crate) enum Op {
    // consumes the line sent upon connecting. counts as written from the start
    Greeting,
    Password(String),
    Command {
        text: String,
        reply: Reply,
    },
    List {
        commands: Vec<String>,
        replies: Vec<Reply>,
        current: Reply,
    },
    Idle {
        filter: IdleFilter,
        changed: Vec<Subsystem>,
        // whether noidle was sent
        cancelling: bool,
    },
}

/// Outcome of an operation whose reply is complete.
#[derive(Debug)]
pub(crate) enum Completion {
    Greeting(String),
    Password(Result<(), Ack>),
    Reply(Result<Reply, Ack>),
    Replies(Result<Vec<Reply>, Ack>),
    Idle(Vec<Subsystem>),
    // the server refused the idle, usually over a subsystem name it does not know
    IdleFailed { filter: IdleFilter, ack: Ack },
}

impl Op {
    pub(crate) fn describe(&self) -> &'static str {
        match self {
            Op::Greeting => "greeting",
            Op::Password(_) => "password reply",
            Op::Command { .. } => "command reply",
            Op::List { .. } => "command list reply",
            Op::Idle { .. } => "idle reply",
        }
    }

    pub(crate) fn is_idle(&self) -> bool {
        matches!(self, Op::Idle { .. })
    }

    // append the wire form to buf
    fn encode(&self, buf: &mut BytesMut) {
        match self {
            Op::Greeting => (),
            Op::Password(password) => write_line(buf, &password_command(password)),
            Op::Command { text, .. } => write_line(buf, text),
            Op::List { commands, .. } => {
                write_command_list(buf, commands.iter().map(String::as_str))
            }
            Op::Idle { filter, .. } => {
                let names: Vec<String> = match filter {
                    IdleFilter::All => Vec::new(),
                    IdleFilter::Only(subsystems) => {
                        subsystems.iter().map(Subsystem::wire_name).collect()
                    }
                };
                write_line(buf, &idle_command(names.iter().map(String::as_str)));
            }
        }
    }
}

impl ActiveEntry {
    pub(crate) fn new(owner: Option<TaskId>, op: Op) -> Self {
        let written = matches!(op, Op::Greeting);
        ActiveEntry { owner, op, written }
    }

    pub(crate) fn command(owner: TaskId, text: String) -> Self {
        Self::new(Some(owner), Op::Command { text, reply: Reply::new() })
    }

    pub(crate) fn command_list(owner: TaskId, commands: Vec<String>) -> Self {
        Self::new(
            Some(owner),
            Op::List {
                replies: Vec::with_capacity(commands.len()),
                commands,
                current: Reply::new(),
            },
        )
    }

    pub(crate) fn idle(filter: IdleFilter) -> Self {
        Self::new(
            None,
            Op::Idle {
                filter,
                changed: Vec::new(),
                cancelling: false,
            },
        )
    }

    /// Write the entry to buf, marking it written.
    pub(crate) fn write(&mut self, buf: &mut BytesMut) {
        debug_assert!(!self.written, "entry written twice (internal bug)");
        self.op.encode(buf);
        self.written = true;
    }

    /// Feed the next inbound line, returning the outcome if the reply is complete.
    pub(crate) fn feed(&mut self, line: &str) -> Result<Option<Completion>, ProtocolError> {
        let unexpected = |expecting: &'static str| ProtocolError::Unexpected {
            expecting,
            line: line.to_owned(),
        };
        let classified = ReplyLine::classify(line)?;
        Ok(match (&mut self.op, classified) {
            (Op::Greeting, ReplyLine::Greeting(version)) => {
                Some(Completion::Greeting(version.to_owned()))
            }
            (Op::Greeting, _) => return Err(ProtocolError::BadGreeting(line.to_owned())),

            (Op::Password(_), ReplyLine::Ok) => Some(Completion::Password(Ok(()))),
            (Op::Password(_), ReplyLine::Ack(ack)) => Some(Completion::Password(Err(ack))),

            (Op::Command { reply, .. }, ReplyLine::Data(data)) => {
                reply.push_line(data.to_owned());
                None
            }
            (Op::Command { reply, .. }, ReplyLine::Ok) => {
                Some(Completion::Reply(Ok(mem::take(reply))))
            }
            (Op::Command { .. }, ReplyLine::Ack(ack)) => Some(Completion::Reply(Err(ack))),

            (Op::List { current, .. }, ReplyLine::Data(data)) => {
                current.push_line(data.to_owned());
                None
            }
            (Op::List { commands, replies, current }, ReplyLine::ListOk) => {
                if replies.len() >= commands.len() {
                    return Err(unexpected("command list reply"));
                }
                replies.push(mem::take(current));
                None
            }
            (Op::List { commands, replies, current }, ReplyLine::Ok) => {
                if replies.len() != commands.len() || !current.is_empty() {
                    return Err(unexpected("command list reply"));
                }
                Some(Completion::Replies(Ok(mem::take(replies))))
            }
            (Op::List { .. }, ReplyLine::Ack(ack)) => Some(Completion::Replies(Err(ack))),

            (Op::Idle { changed, .. }, ReplyLine::Data(data)) => match split_pair(data) {
                Some(("changed", name)) => {
                    changed.push(Subsystem::new(name));
                    None
                }
                _ => return Err(unexpected("idle reply")),
            },
            (Op::Idle { changed, .. }, ReplyLine::Ok) => Some(Completion::Idle(mem::take(changed))),
            (Op::Idle { filter, .. }, ReplyLine::Ack(ack)) => Some(Completion::IdleFailed {
                filter: filter.clone(),
                ack,
            }),

            (op, _) => return Err(unexpected(op.describe())),
        })
    }
}

impl ActiveQueue {
    pub(crate) fn len(&self) -> usize {
        self.0.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn front_mut(&mut self) -> Option<&mut ActiveEntry> {
        self.0.front_mut()
    }

    pub(crate) fn push_back(&mut self, entry: ActiveEntry) {
        self.0.push_back(entry);
    }

    pub(crate) fn push_front(&mut self, entry: ActiveEntry) {
        self.0.push_front(entry);
    }

    pub(crate) fn pop_front(&mut self) -> Option<ActiveEntry> {
        self.0.pop_front()
    }

    /// Whether nothing other than an idle is queued.
    pub(crate) fn is_quiescent(&self) -> bool {
        self.0.iter().all(|entry| entry.op.is_idle())
    }

    /// Whether an idle was written and its reply is not yet complete.
    pub(crate) fn awaiting_idle_reply(&self) -> bool {
        self.0
            .front()
            .is_some_and(|head| head.written && head.op.is_idle())
    }

    /// Withdraw a task's entries.
    ///
    /// Unwritten entries are dropped. A written entry stays in place with no owner, so its reply
    /// is consumed and discarded.
    pub(crate) fn withdraw(&mut self, task: TaskId) {
        self.0.retain(|entry| entry.owner != Some(task) || entry.written);
        for entry in self.0.iter_mut().filter(|entry| entry.owner == Some(task)) {
            entry.owner = None;
        }
    }

    /// Remove every entry, returning the tasks that were owed an outcome.
    pub(crate) fn drain_owners(&mut self) -> Vec<TaskId> {
        self.0.drain(..).filter_map(|entry| entry.owner).collect()
    }
}
