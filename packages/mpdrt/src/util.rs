//! Small utilities.

#[cfg(feature = "tokio")]
pub mod abort_on_drop;
