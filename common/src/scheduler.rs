use std::{cell::RefCell, rc::Rc};

use log::trace;

use crate::{
    clock::MonotonicClock,
    error::TimerError,
    registry::{Registry, DEFAULT_MAX_TASKS},
    task::{ClosureTask, FnTask, Task, TaskId, TaskRef},
    timespec::TimeSpec,
};

/// Cooperative scheduler for periodic tasks on a single execution loop.
///
/// The embedding main loop calls [`TimerSystem::tick`] once per iteration.
/// Each tick folds the elapsed hardware time into the scheduler clock and
/// runs whatever is due. A task that missed several periods runs once and
/// its schedule realigns to the current time.
///
/// A tick holds `&mut self` for its whole pass, so the scheduler is either
/// idle or inside exactly one tick. Tasks reach it only through their
/// [`TaskContext`](crate::task::TaskContext).
pub struct TimerSystem<C: MonotonicClock> {
    clock: C,
    current: TimeSpec,
    last_wakeup: u32,
    registry: Registry,
}

impl<C: MonotonicClock> TimerSystem<C> {
    pub fn new(clock: C) -> Self {
        Self::with_capacity(clock, DEFAULT_MAX_TASKS)
    }

    pub fn with_capacity(clock: C, max_tasks: usize) -> Self {
        let last_wakeup = clock.now_ms();
        Self {
            clock,
            current: TimeSpec::ZERO,
            last_wakeup,
            registry: Registry::with_capacity(max_tasks),
        }
    }

    /// Scheduler clock, advanced only by [`TimerSystem::tick`].
    pub fn now(&self) -> TimeSpec {
        self.current
    }

    pub fn count(&self) -> usize {
        self.registry.len()
    }

    pub fn next_due(&self, id: TaskId) -> Option<TimeSpec> {
        self.registry.next_due(id)
    }

    pub fn add<T: Task + 'static>(&mut self, task: T, period: TimeSpec) -> Result<TaskId, TimerError> {
        self.registry
            .insert(TaskRef::owned(task), period, self.current)
    }

    pub fn add_shared<T: Task + 'static>(
        &mut self,
        task: &Rc<RefCell<T>>,
        period: TimeSpec,
    ) -> Result<TaskId, TimerError> {
        self.registry
            .insert(TaskRef::shared(task), period, self.current)
    }

    pub fn add_fn<F: FnMut() + 'static>(
        &mut self,
        callback: F,
        period: TimeSpec,
    ) -> Result<TaskId, TimerError> {
        self.add(ClosureTask::new(callback), period)
    }

    pub fn add_callback(&mut self, callback: fn(), period: TimeSpec) -> Result<TaskId, TimerError> {
        self.add(FnTask::new(Some(callback)), period)
    }

    pub fn remove(&mut self, id: TaskId) -> Result<(), TimerError> {
        self.registry.remove(id)
    }

    pub fn remove_shared<T: ?Sized>(&mut self, task: &Rc<RefCell<T>>) -> Result<(), TimerError> {
        self.registry.remove_shared(task)
    }

    /// One pass of the main loop. Returns the number of tasks that ran.
    pub fn tick(&mut self) -> usize {
        let now_ms = self.clock.now_ms();
        let elapsed = now_ms.wrapping_sub(self.last_wakeup);
        self.last_wakeup = now_ms;
        self.current.add_millis(elapsed);

        let executed = self.registry.run_due(self.current);
        if executed > 0 {
            trace!("tick at {} ran {executed} task(s)", self.current);
        }

        executed
    }

    /// Removes and releases every registration. Shared tasks whose cells are
    /// borrowed right now are released by a later `tick` or `reset`.
    pub fn reset(&mut self) {
        self.registry.clear();
    }
}
