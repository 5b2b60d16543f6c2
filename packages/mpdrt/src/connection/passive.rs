// tasks suspended on conditions, and deciding which of them a change wakes.

use super::active::IdleFilter;
use crate::{
    condition::{Condition, Subsystem},
    scheduler::TimerId,
    task::TaskId,
};
use smallvec::SmallVec;
use std::{collections::BTreeSet, mem};


/// Tasks waiting on conditions, at most one entry per task.
#[derive(Default)]
pub(crate) struct PassiveSet(Vec<PassiveEntry>);

pub(crate) struct PassiveEntry {
    pub(crate) task: TaskId,
    // distinguishes successive waits by the same task, so a late timer is not mistaken for the
    // current wait's
    pub(crate) serial: u64,
    pub(crate) conditions: Vec<Condition>,
    pub(crate) timers: SmallVec<[ArmedTimer; 1]>,
}

/// Scheduler timeout armed for a `Timeout` condition.
pub(crate) struct ArmedTimer {
    pub(crate) id: TimerId,
    // index into the entry's conditions
    pub(crate) condition: usize,
    pub(crate) elapsed: bool,
}

/// What conditions are evaluated against.
pub(crate) struct WakeState<'a> {
    // subsystems the idle reply just reported, usually empty
    pub(crate) changed: &'a [Subsystem],
    pub(crate) connected: bool,
    // whether nothing is queued besides an idle
    pub(crate) quiescent: bool,
    pub(crate) alive: &'a dyn Fn(TaskId) -> bool,
}

impl WakeState<'_> {
    // timeouts other than zero only hold through their armed timer
    fn holds(&self, condition: &Condition) -> bool {
        match condition {
            Condition::Subsystem(subsystem) => self.changed.contains(subsystem),
            Condition::Any => !self.changed.is_empty(),
            Condition::Connect => self.connected,
            Condition::Idle => self.connected && self.quiescent,
            Condition::Timeout(delay) => delay.is_zero(),
            Condition::Worker(tasks) => tasks.iter().all(|&task| !(self.alive)(task)),
        }
    }

    /// The conditions which hold, in the order given.
    pub(crate) fn matching(&self, conditions: &[Condition], timers: &[ArmedTimer]) -> Vec<Condition> {
        conditions
            .iter()
            .enumerate()
            .filter(|&(i, condition)| {
                self.holds(condition)
                    || timers.iter().any(|timer| timer.condition == i && timer.elapsed)
            })
            .map(|(_, condition)| condition.clone())
            .collect()
    }
}

impl PassiveSet {
    pub(crate) fn len(&self) -> usize {
        self.0.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn insert(&mut self, entry: PassiveEntry) {
        debug_assert!(
            self.0.iter().all(|other| other.task != entry.task),
            "task waiting twice (internal bug)"
        );
        self.0.push(entry);
    }

    pub(crate) fn remove(&mut self, task: TaskId) -> Option<PassiveEntry> {
        let i = self.0.iter().position(|entry| entry.task == task)?;
        Some(self.0.remove(i))
    }

    /// Mark a timer as elapsed, returning whether it belongs to a current wait.
    pub(crate) fn mark_elapsed(&mut self, task: TaskId, serial: u64, condition: usize) -> bool {
        let timer = self
            .0
            .iter_mut()
            .filter(|entry| entry.task == task && entry.serial == serial)
            .flat_map(|entry| entry.timers.iter_mut())
            .find(|timer| timer.condition == condition);
        match timer {
            Some(timer) => {
                timer.elapsed = true;
                true
            }
            None => false,
        }
    }

    /// Remove every entry with at least one condition holding, in one pass, returning each with
    /// its matched conditions.
    pub(crate) fn take_matched(&mut self, state: &WakeState) -> Vec<(PassiveEntry, Vec<Condition>)> {
        let mut matched = Vec::new();
        for entry in mem::take(&mut self.0) {
            let conditions = state.matching(&entry.conditions, &entry.timers);
            if conditions.is_empty() {
                self.0.push(entry);
            } else {
                matched.push((entry, conditions));
            }
        }
        matched
    }

    /// Remove every entry for which `pred` holds.
    pub(crate) fn take_if<F>(&mut self, mut pred: F) -> Vec<PassiveEntry>
    where
        F: FnMut(&PassiveEntry) -> bool,
    {
        let (taken, kept): (Vec<_>, Vec<_>) =
            mem::take(&mut self.0).into_iter().partition(|entry| pred(entry));
        self.0 = kept;
        taken
    }

    pub(crate) fn drain(&mut self) -> Vec<PassiveEntry> {
        mem::take(&mut self.0)
    }

    /// The idle filter that would serve every waiter, if any waiter needs an idle at all.
    pub(crate) fn idle_filter(&self) -> Option<IdleFilter> {
        let mut subsystems = BTreeSet::new();
        let mut any_needed = false;
        let conditions = self.0.iter().flat_map(|entry| &entry.conditions);
        for condition in conditions.filter(|condition| condition.needs_idle()) {
            any_needed = true;
            match condition {
                Condition::Subsystem(subsystem) => {
                    subsystems.insert(subsystem.clone());
                }
                _ => return Some(IdleFilter::All),
            }
        }
        any_needed.then_some(IdleFilter::Only(subsystems))
    }
}
