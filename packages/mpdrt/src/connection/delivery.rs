// tasks that are ready to be stepped, in the order they became ready.

use crate::{
    error::Error,
    request::Resume,
    task::TaskId,
};
use std::collections::{HashSet, VecDeque};


/// Why a task is being stepped.
#[derive(Debug)]
pub(crate) enum Delivery {
    // first poll of a freshly spawned body
    Start,
    Resume(Result<Resume, Error>),
}

/// FIFO of pending deliveries, holding at most one per task.
#[derive(Default)]
pub(crate) struct DeliveryQueue {
    queue: VecDeque<(TaskId, Delivery)>,
    queued: HashSet<TaskId>,
}

impl DeliveryQueue {
    /// Enqueue a delivery, returning false and dropping it if the task already has one queued.
    pub(crate) fn push(&mut self, task: TaskId, delivery: Delivery) -> bool {
        if !self.queued.insert(task) {
            return false;
        }
        self.queue.push_back((task, delivery));
        true
    }

    pub(crate) fn pop(&mut self) -> Option<(TaskId, Delivery)> {
        let (task, delivery) = self.queue.pop_front()?;
        self.queued.remove(&task);
        Some((task, delivery))
    }

    pub(crate) fn remove(&mut self, task: TaskId) {
        if self.queued.remove(&task) {
            self.queue.retain(|&(queued, _)| queued != task);
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }
}
