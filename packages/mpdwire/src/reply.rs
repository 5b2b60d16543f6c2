//! Classifying reply lines and holding reply bodies.

use std::{
    fmt::{self, Display, Formatter},
    str::FromStr,
};
use thiserror::Error;

/// One inbound line, classified by its role in reply framing.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ReplyLine<'a> {
    /// `OK`: terminates a reply.
    Ok,
    /// `list_OK`: terminates one section of a command list reply.
    ListOk,
    /// `ACK ...`: terminates a reply with a failure.
    Ack(Ack),
    /// `OK MPD <version>`: the greeting sent upon connecting.
    Greeting(&'a str),
    /// Any other line, usually `key: value`.
    Data(&'a str),
}

impl<'a> ReplyLine<'a> {
    pub fn classify(line: &'a str) -> Result<Self, ParseAckError> {
        Ok(if line == "OK" {
            ReplyLine::Ok
        } else if line == "list_OK" {
            ReplyLine::ListOk
        } else if let Some(version) = line.strip_prefix("OK MPD ") {
            ReplyLine::Greeting(version)
        } else if line == "ACK" || line.starts_with("ACK ") {
            ReplyLine::Ack(line.parse()?)
        } else {
            ReplyLine::Data(line)
        })
    }
}

/// Well-known ACK error codes.
pub mod ack_code {
    pub const NOT_LIST: u32 = 1;
    pub const ARG: u32 = 2;
    pub const PASSWORD: u32 = 3;
    pub const PERMISSION: u32 = 4;
    pub const UNKNOWN: u32 = 5;
    pub const NO_EXIST: u32 = 50;
    pub const PLAYLIST_MAX: u32 = 51;
    pub const SYSTEM: u32 = 52;
    pub const PLAYLIST_LOAD: u32 = 53;
    pub const UPDATE_ALREADY: u32 = 54;
    pub const PLAYER_SYNC: u32 = 55;
    pub const EXIST: u32 = 56;
}

/// A parsed `ACK [code@index] {command} message` line.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Ack {
    pub code: u32,
    /// Position of the failing command within a command list, 0 for a lone command.
    pub index: usize,
    pub command: String,
    pub message: String,
}

impl FromStr for Ack {
    type Err = ParseAckError;

    fn from_str(line: &str) -> Result<Self, ParseAckError> {
        let malformed = || ParseAckError(line.to_owned());
        let rest = line.strip_prefix("ACK [").ok_or_else(malformed)?;
        let (code_index, rest) = rest.split_once(']').ok_or_else(malformed)?;
        let (code, index) = code_index.split_once('@').ok_or_else(malformed)?;
        let code = code.parse().map_err(|_| malformed())?;
        let index = index.parse().map_err(|_| malformed())?;
        let rest = rest.trim_start().strip_prefix('{').ok_or_else(malformed)?;
        let (command, message) = rest.split_once('}').ok_or_else(malformed)?;
        Ok(Ack {
            code,
            index,
            command: command.to_owned(),
            message: message.trim_start().to_owned(),
        })
    }
}

impl Display for Ack {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "ACK [{}@{}] {{{}}} {}", self.code, self.index, self.command, self.message)
    }
}

/// Error for an `ACK` line that does not follow the expected layout.
#[derive(Error, Debug, Clone, Eq, PartialEq)]
#[error("malformed ACK line: {0:?}")]
pub struct ParseAckError(pub String);

/// Body of one successful reply section, excluding its terminator.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct Reply {
    lines: Vec<String>,
}

impl Reply {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_line(&mut self, line: String) {
        self.lines.push(line);
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Iterate over the `key: value` lines, skipping any line that is not a pair.
    pub fn pairs(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.lines.iter().filter_map(|line| split_pair(line))
    }

    /// Value of the first pair with the given key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs().find(|&(k, _)| k == key).map(|(_, v)| v)
    }

    /// Values of every pair with the given key, in order.
    pub fn get_all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.pairs().filter(move |&(k, _)| k == key).map(|(_, v)| v)
    }
}

impl FromIterator<String> for Reply {
    fn from_iter<I: IntoIterator<Item = String>>(lines: I) -> Self {
        Reply {
            lines: lines.into_iter().collect(),
        }
    }
}

/// Split a `key: value` line.
pub fn split_pair(line: &str) -> Option<(&str, &str)> {
    let (key, value) = line.split_once(':')?;
    if key.is_empty() || key.contains(' ') {
        return None;
    }
    Some((key, value.strip_prefix(' ').unwrap_or(value)))
}
