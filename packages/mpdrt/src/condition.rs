//! Conditions a task can wait for.

use crate::task::TaskId;
use std::{
    borrow::Cow,
    fmt::{self, Display, Formatter},
    str::FromStr,
    time::Duration,
};
use thiserror::Error;

/// Server-side subsystem name, as reported by `idle`.
///
/// Names are normalized to uppercase. They are lowercased again when sent to the server.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Subsystem(Cow<'static, str>);

macro_rules! subsystems {
    ($($konst:ident = $name:literal,)*) => {
        impl Subsystem {
            $(
                pub const $konst: Subsystem = Subsystem(Cow::Borrowed($name));
            )*
        }
    };
}

subsystems! {
    DATABASE = "DATABASE",
    UPDATE = "UPDATE",
    STORED_PLAYLIST = "STORED_PLAYLIST",
    PLAYLIST = "PLAYLIST",
    PLAYER = "PLAYER",
    MIXER = "MIXER",
    OUTPUT = "OUTPUT",
    OPTIONS = "OPTIONS",
    PARTITION = "PARTITION",
    STICKER = "STICKER",
    SUBSCRIPTION = "SUBSCRIPTION",
    MESSAGE = "MESSAGE",
    NEIGHBOR = "NEIGHBOR",
    MOUNT = "MOUNT",
}

impl Subsystem {
    /// Construct from a name in any case.
    ///
    /// Any name is accepted, but only [valid](Self::is_valid) ones may be waited for.
    pub fn new(name: &str) -> Self {
        Subsystem(Cow::Owned(name.to_ascii_uppercase()))
    }

    /// Whether `name` may go on the wire: non-empty ASCII letters, digits and underscores.
    pub fn is_valid_name(name: &str) -> bool {
        !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
    }

    pub fn is_valid(&self) -> bool {
        Self::is_valid_name(&self.0)
    }

    /// Normalized, uppercase name.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name as the server spells it.
    pub fn wire_name(&self) -> String {
        self.0.to_ascii_lowercase()
    }
}

impl Display for Subsystem {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Something a task can wait for with [`TaskContext::wait_for`](crate::TaskContext::wait_for).
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum Condition {
    /// The server reported a change in this subsystem.
    Subsystem(Subsystem),
    /// The server reported a change in any subsystem.
    Any,
    /// The connection is connected.
    Connect,
    /// The connection is connected and no request is queued besides a shared `idle`.
    Idle,
    /// The given time has passed since the wait began.
    Timeout(Duration),
    /// None of the given tasks is alive.
    Worker(Vec<TaskId>),
}

impl Condition {
    /// Condition for a subsystem given by name in any case.
    pub fn subsystem(name: &str) -> Self {
        Condition::Subsystem(Subsystem::new(name))
    }

    /// Condition for every one of the given tasks having finished.
    pub fn worker<I: IntoIterator<Item = TaskId>>(tasks: I) -> Self {
        Condition::Worker(tasks.into_iter().collect())
    }

    /// Whether satisfying this condition requires an outstanding `idle` command.
    pub(crate) fn needs_idle(&self) -> bool {
        matches!(self, Condition::Subsystem(_) | Condition::Any)
    }
}

impl From<Subsystem> for Condition {
    fn from(subsystem: Subsystem) -> Self {
        Condition::Subsystem(subsystem)
    }
}

impl Display for Condition {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Condition::Subsystem(subsystem) => write!(f, "{}", subsystem),
            Condition::Any => f.write_str("ANY"),
            Condition::Connect => f.write_str("CONNECT"),
            Condition::Idle => f.write_str("IDLE"),
            Condition::Timeout(duration) => write!(f, "TIMEOUT({})", duration.as_millis()),
            Condition::Worker(tasks) => {
                f.write_str("WORKER(")?;
                for (i, task) in tasks.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{}", task)?;
                }
                f.write_str(")")
            }
        }
    }
}

/// Error for parsing a [`Condition`] from text.
#[derive(Error, Debug, Clone, Eq, PartialEq)]
#[error("invalid condition: {0:?}")]
pub struct ParseConditionError(pub String);

impl FromStr for Condition {
    type Err = ParseConditionError;

    /// Parse the form produced by `Display`. Any other bare word is a subsystem name.
    fn from_str(s: &str) -> Result<Self, ParseConditionError> {
        let invalid = || ParseConditionError(s.to_owned());
        let s = s.trim();
        let upper = s.to_ascii_uppercase();
        if let Some(args) = upper
            .strip_prefix("TIMEOUT(")
            .and_then(|rest| rest.strip_suffix(')'))
        {
            let millis: u64 = args.trim().parse().map_err(|_| invalid())?;
            return Ok(Condition::Timeout(Duration::from_millis(millis)));
        }
        if let Some(args) = upper
            .strip_prefix("WORKER(")
            .and_then(|rest| rest.strip_suffix(')'))
        {
            return args
                .split(',')
                .map(|id| id.trim().parse().map(TaskId).map_err(|_| invalid()))
                .collect::<Result<_, _>>()
                .map(Condition::Worker);
        }
        match upper.as_str() {
            "ANY" => Ok(Condition::Any),
            "CONNECT" => Ok(Condition::Connect),
            "IDLE" => Ok(Condition::Idle),
            name if Subsystem::is_valid_name(name) => {
                Ok(Condition::Subsystem(Subsystem::new(name)))
            }
            _ => Err(invalid()),
        }
    }
}
