//! Tokio utility.

use std::future::Future;
use tokio::task::{
    spawn_local,
    AbortHandle,
};


/// Wrapper around a local tokio task that aborts it if dropped.
pub struct AbortOnDrop(Option<AbortHandle>);

impl AbortOnDrop {
    /// Spawn a task onto the current `LocalSet` and wrap with self.
    pub fn spawn_local<F>(f: F) -> Self
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        AbortOnDrop(Some(spawn_local(f).abort_handle()))
    }

    /// Drop without aborting the task, letting it run to completion.
    pub fn disarm(mut self) {
        self.0 = None;
    }
}

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            handle.abort();
        }
    }
}
