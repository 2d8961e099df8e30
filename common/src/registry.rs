use std::{cell::RefCell, rc::Rc};

use log::{debug, warn};

use crate::{
    error::TimerError,
    task::{address_of, TaskContext, TaskId, TaskRef},
    timespec::TimeSpec,
};

/// Upper bound on live registrations unless configured otherwise.
pub const DEFAULT_MAX_TASKS: usize = 32;

#[derive(Debug)]
struct Registration {
    id: TaskId,
    // `None` while the task is executing.
    task: Option<TaskRef>,
    shared_address: Option<*const ()>,
    period: TimeSpec,
    next_due: TimeSpec,
    removal_requested: bool,
}

impl Registration {
    fn is_live(&self) -> bool {
        !self.removal_requested
    }
}

/// Ordered set of periodic registrations.
///
/// Slots are only vacated (set to `None`) while a due pass is in progress
/// and are compacted once it ends, so positions stay stable under the pass.
///
/// A shared task whose cell is borrowed when it is removed cannot be released
/// yet. It is parked in `unreleased` and retried after every due pass and on
/// every `clear`.
#[derive(Debug)]
pub struct Registry {
    entries: Vec<Option<Registration>>,
    unreleased: Vec<(TaskId, TaskRef)>,
    max_tasks: usize,
    next_id: u64,
    in_pass: bool,
}

impl Registry {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_TASKS)
    }

    pub fn with_capacity(max_tasks: usize) -> Self {
        Self {
            entries: Vec::new(),
            unreleased: Vec::new(),
            max_tasks,
            next_id: 0,
            in_pass: false,
        }
    }

    pub fn max_tasks(&self) -> usize {
        self.max_tasks
    }

    pub fn len(&self) -> usize {
        self.live().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removed tasks still waiting for their release.
    pub fn pending_releases(&self) -> usize {
        self.unreleased.len()
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.live().any(|entry| entry.id == id)
    }

    pub fn next_due(&self, id: TaskId) -> Option<TimeSpec> {
        self.live()
            .find(|entry| entry.id == id)
            .map(|entry| entry.next_due)
    }

    /// Registers `task` to run every `period`, first due at `now`.
    pub fn insert(
        &mut self,
        task: TaskRef,
        period: TimeSpec,
        now: TimeSpec,
    ) -> Result<TaskId, TimerError> {
        if period.is_zero() {
            warn!("rejecting registration with zero period");
            return Err(TimerError::InvalidPeriod);
        }

        let shared_address = task.shared_address();
        if shared_address.is_some() && self.holds_shared(shared_address) {
            warn!("rejecting duplicate registration of a shared task");
            return Err(TimerError::InvalidTask);
        }

        if self.len() >= self.max_tasks || self.entries.try_reserve(1).is_err() {
            warn!("timer registry full ({} tasks)", self.max_tasks);
            return Err(TimerError::AllocationFailure);
        }

        let id = TaskId::new(self.next_id);
        self.next_id += 1;
        self.entries.push(Some(Registration {
            id,
            task: Some(task),
            shared_address,
            period,
            next_due: now,
            removal_requested: false,
        }));
        debug!("registered {id} every {period}");
        Ok(id)
    }

    pub fn remove(&mut self, id: TaskId) -> Result<(), TimerError> {
        let index = self
            .position(|entry| entry.id == id)
            .ok_or(TimerError::NotFound)?;
        self.detach(index);
        Ok(())
    }

    pub fn remove_shared<T: ?Sized>(&mut self, task: &Rc<RefCell<T>>) -> Result<(), TimerError> {
        let address = Some(address_of(task));
        let index = self
            .position(|entry| entry.shared_address == address)
            .ok_or(TimerError::NotFound)?;
        self.detach(index);
        Ok(())
    }

    /// Runs every registration present at the start of the pass whose due
    /// time is at or before `now`, in registration order, then moves its
    /// due time past `now`. Returns how many tasks ran.
    ///
    /// A shared task whose cell is borrowed elsewhere is skipped and keeps
    /// its due time, so it runs on the next pass.
    pub fn run_due(&mut self, now: TimeSpec) -> usize {
        let pending = self.entries.len();
        let mut executed = 0;
        self.in_pass = true;

        for index in 0..pending {
            let (id, mut task) = match self.entries[index].as_mut() {
                Some(entry) if entry.is_live() && entry.next_due <= now => {
                    match entry.task.take() {
                        Some(task) => (entry.id, task),
                        None => continue,
                    }
                }
                _ => continue,
            };

            let ran = task.execute(&mut TaskContext::new(self, id, now));
            if ran {
                executed += 1;
            }

            match self.entries[index].as_mut() {
                Some(entry) if !entry.removal_requested => {
                    entry.task = Some(task);
                    if ran {
                        entry.next_due = entry.next_due.next_due_after(now, entry.period);
                    }
                }
                _ => {
                    self.entries[index] = None;
                    self.release(id, task);
                }
            }
        }

        self.in_pass = false;
        self.entries.retain(Option::is_some);
        self.retry_releases();
        executed
    }

    /// Releases every remaining registration exactly once.
    pub fn clear(&mut self) {
        let drained: Vec<Registration> = self.entries.drain(..).flatten().collect();
        if !drained.is_empty() {
            debug!("tearing down {} registrations", drained.len());
        }
        self.retry_releases();
        for registration in drained {
            if let Some(task) = registration.task {
                self.release(registration.id, task);
            }
        }
    }

    fn live(&self) -> impl Iterator<Item = &Registration> {
        self.entries.iter().flatten().filter(|entry| entry.is_live())
    }

    // Includes registrations awaiting removal or release: the same cell must
    // not be registered twice until its release has run.
    fn holds_shared(&self, address: Option<*const ()>) -> bool {
        self.entries
            .iter()
            .flatten()
            .any(|entry| entry.shared_address == address)
            || self
                .unreleased
                .iter()
                .any(|(_, task)| task.shared_address() == address)
    }

    fn position(&self, predicate: impl Fn(&Registration) -> bool) -> Option<usize> {
        self.entries.iter().position(|slot| {
            slot.as_ref()
                .is_some_and(|entry| entry.is_live() && predicate(entry))
        })
    }

    fn detach(&mut self, index: usize) {
        let Some(entry) = self.entries[index].as_mut() else {
            return;
        };

        if entry.task.is_none() {
            debug!("deferring removal of running {}", entry.id);
            entry.removal_requested = true;
            return;
        }

        let registration = if self.in_pass {
            self.entries[index].take()
        } else {
            self.entries.remove(index)
        };
        if let Some(Registration {
            id,
            task: Some(task),
            ..
        }) = registration
        {
            self.release(id, task);
        }
    }

    fn release(&mut self, id: TaskId, mut task: TaskRef) {
        if task.release() {
            debug!("released {id}");
        } else {
            warn!("{id} is borrowed elsewhere; release postponed");
            self.unreleased.push((id, task));
        }
    }

    fn retry_releases(&mut self) {
        self.unreleased.retain_mut(|(id, task)| {
            let released = task.release();
            if released {
                debug!("released {id}");
            }
            !released
        });
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.clear();
        for (id, _) in &self.unreleased {
            warn!("{id} still borrowed at teardown; release skipped");
        }
    }
}
