//! Cooperative task runtime for an MPD-style client connection.
//!
//! A [`Connection`] multiplexes many [`TaskGroup`]-owned tasks over one socket. Each task is an
//! async body whose only await points are the requests it issues through its [`TaskContext`]:
//!
//! - [`TaskContext::command`] and [`TaskContext::command_list`] go on the wire and resolve to
//!   their replies, in the order they were issued.
//! - [`TaskContext::wait_for`] waits for the first of several [`Condition`]s. Every waiter
//!   interested in server-side changes shares one outstanding `idle` command.
//! - [`TaskContext::current_task`] resolves to the task's own [`TaskHandle`].
//!
//! Everything runs on one thread. The connection is driven by a [`scheduler::Scheduler`], either
//! [`scheduler::TokioScheduler`] inside a tokio `LocalSet`, or [`scheduler::ManualScheduler`]
//! when embedding into another event loop.
//!
//! ```rust,no_run
//! use mpdrt::{scheduler::TokioScheduler, Condition, Connection, Subsystem, Target};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> anyhow::Result<()> {
//!     let local = tokio::task::LocalSet::new();
//!     local.run_until(async {
//!         let conn = Connection::new(TokioScheduler::new());
//!         conn.connect(&"localhost:6600".parse::<Target>()?)?;
//!         let group = conn.new_task_group();
//!         group.spawn(|cx| async move {
//!             cx.wait_for([Condition::Connect]).await?;
//!             loop {
//!                 let status = cx.command("status").await?;
//!                 println!("state: {:?}", status.get("state"));
//!                 cx.wait_for([Condition::from(Subsystem::PLAYER)]).await?;
//!             }
//!         })?;
//!         std::future::pending::<anyhow::Result<()>>().await
//!     }).await
//! }
//! ```

#[macro_use]
extern crate tracing;

pub extern crate mpdwire;

mod condition;
mod connection;
mod error;
mod group;
mod request;
mod target;
mod task;
pub mod scheduler;
pub mod util;

pub use crate::{
    condition::*,
    connection::{Config, Connection, ConnectionState},
    error::*,
    group::TaskGroup,
    request::RequestFut,
    target::*,
    task::{TaskContext, TaskHandle, TaskId, TaskResult},
};
pub use mpdwire::{Ack, Reply};
