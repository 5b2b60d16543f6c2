// error types surfaced to tasks and callers.

use mpdwire::{Ack, LineError, ParseAckError};
use std::fmt::{self, Display, Formatter};
use thiserror::Error;

/// Any error a request or connection operation can fail with
#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum Error {
    /// The server answered this task's command with a failure
    #[error(transparent)]
    Reply(#[from] ReplyError),
    /// The server sent data the framing layer could not interpret
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    /// The connection dropped while the request was pending
    #[error("disconnected ({0})")]
    Disconnect(DisconnectReason),
    /// The API was misused
    #[error(transparent)]
    Usage(#[from] UsageError),
}

impl Error {
    /// The disconnect reason, if this is a disconnect error.
    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        match *self {
            Error::Disconnect(reason) => Some(reason),
            _ => None,
        }
    }
}

/// Error for a command the server rejected with an `ACK` line
#[derive(Error, Debug, Clone, Eq, PartialEq)]
#[error("command {:?} failed: {} (code {}, index {})", .0.command, .0.message, .0.code, .0.index)]
pub struct ReplyError(pub Ack);

impl ReplyError {
    pub fn ack(&self) -> &Ack {
        &self.0
    }

    pub fn code(&self) -> u32 {
        self.0.code
    }

    /// Position of the failing command within its command list.
    pub fn index(&self) -> usize {
        self.0.index
    }
}

/// Error for inbound data that does not fit the reply framing
///
/// Never delivered to a single task. The connection logs it and disconnects with
/// [`DisconnectReason::Error`].
#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum ProtocolError {
    #[error("unsolicited line with no request outstanding: {0:?}")]
    Unsolicited(String),
    #[error("expected greeting, got {0:?}")]
    BadGreeting(String),
    #[error("unexpected line in {expecting}: {line:?}")]
    Unexpected {
        expecting: &'static str,
        line: String,
    },
    #[error(transparent)]
    Line(#[from] LineError),
    #[error(transparent)]
    Ack(#[from] ParseAckError),
}

/// Why a connection was dropped
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum DisconnectReason {
    /// `disconnect` was called
    Requested,
    /// `connect` was called on a connection that was not disconnected
    Reconnect,
    /// The socket could not be established
    FailedConnect,
    /// `shutdown` was called
    Shutdown,
    /// The server rejected the password
    BadPassword,
    /// A socket or protocol error occurred
    Error,
}

impl Display for DisconnectReason {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str(match self {
            DisconnectReason::Requested => "requested",
            DisconnectReason::Reconnect => "reconnecting",
            DisconnectReason::FailedConnect => "failed to connect",
            DisconnectReason::Shutdown => "shutting down",
            DisconnectReason::BadPassword => "bad password",
            DisconnectReason::Error => "connection error",
        })
    }
}

/// Error for misusing the API
#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum UsageError {
    #[error("command issued while disconnected")]
    NotConnected,
    #[error("command text must be a single line: {0:?}")]
    InvalidCommand(String),
    #[error("invalid subsystem name: {0:?}")]
    InvalidSubsystem(String),
    #[error("task group is closed")]
    GroupClosed,
    #[error("wait requested with no conditions")]
    NoConditions,
    #[error("task awaited something other than a request")]
    ForeignAwait,
    #[error("task issued a request while another was outstanding")]
    ConcurrentRequest,
}
