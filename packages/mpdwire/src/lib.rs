//! Wire framing for the MPD-style line protocol.
//!
//! This crate knows nothing about tasks or sockets. It turns an inbound byte stream into lines,
//! classifies reply lines, and encodes outbound commands.

pub extern crate bytes;

mod command;
mod line;
mod reply;

pub use crate::{
    command::*,
    line::*,
    reply::*,
};
