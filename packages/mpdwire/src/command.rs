//! Encoding outbound commands.

use bytes::{BufMut, BytesMut};
use std::{
    borrow::Cow,
    fmt::{self, Display, Formatter},
};

pub const IDLE: &str = "idle";
pub const NOIDLE: &str = "noidle";
pub const COMMAND_LIST_OK_BEGIN: &str = "command_list_ok_begin";
pub const COMMAND_LIST_END: &str = "command_list_end";

/// Builder for a single command line with properly quoted arguments.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Command {
    line: String,
}

impl Command {
    pub fn new(name: &str) -> Self {
        Command {
            line: name.to_owned(),
        }
    }

    /// Append an argument, quoting it if necessary.
    pub fn arg(mut self, arg: impl AsRef<str>) -> Self {
        self.line.push(' ');
        self.line.push_str(&quote(arg.as_ref()));
        self
    }

    pub fn as_str(&self) -> &str {
        &self.line
    }

    pub fn into_string(self) -> String {
        self.line
    }
}

impl Display for Command {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str(&self.line)
    }
}

impl From<Command> for String {
    fn from(command: Command) -> String {
        command.line
    }
}

/// Quote an argument if it is empty or contains whitespace, quotes or backslashes.
pub fn quote(arg: &str) -> Cow<'_, str> {
    let needs_quoting = arg.is_empty()
        || arg
            .chars()
            .any(|c| c.is_whitespace() || c == '"' || c == '\'' || c == '\\');
    if !needs_quoting {
        return Cow::Borrowed(arg);
    }
    let mut quoted = String::with_capacity(arg.len() + 2);
    quoted.push('"');
    for c in arg.chars() {
        if c == '"' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    Cow::Owned(quoted)
}

/// Whether text can be sent as one command line.
pub fn is_single_line(text: &str) -> bool {
    !text.contains(['\n', '\r'])
}

/// The `idle` command, restricted to the given subsystems if any are given.
pub fn idle_command<'a, I>(subsystems: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let mut line = IDLE.to_owned();
    for subsystem in subsystems {
        line.push(' ');
        line.push_str(subsystem);
    }
    line
}

/// The `password` command.
pub fn password_command(password: &str) -> String {
    Command::new("password").arg(password).into_string()
}

/// Write one line and its terminator.
pub fn write_line(buf: &mut BytesMut, line: &str) {
    buf.reserve(line.len() + 1);
    buf.put_slice(line.as_bytes());
    buf.put_u8(b'\n');
}

/// Write a command list whose reply separates sections with `list_OK`.
pub fn write_command_list<'a, I>(buf: &mut BytesMut, commands: I)
where
    I: IntoIterator<Item = &'a str>,
{
    write_line(buf, COMMAND_LIST_OK_BEGIN);
    for command in commands {
        write_line(buf, command);
    }
    write_line(buf, COMMAND_LIST_END);
}
