use std::{cell::RefCell, fmt, rc::Rc};

use log::warn;

use crate::{error::TimerError, registry::Registry, timespec::TimeSpec};

/// Identity of a registration. Handed out by the registry and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(u64);

impl TaskId {
    pub(crate) const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// A cooperative unit of work driven by the timer system.
///
/// `execute` runs each time the registration falls due. It must return
/// promptly and must handle its own errors; nothing it reports travels
/// back through the scheduler.
///
/// `release` runs exactly once, when the registration is torn down. It gets
/// no access to the registry.
pub trait Task {
    fn execute(&mut self, ctx: &mut TaskContext<'_>);

    fn release(&mut self) {}
}

impl<T: Task + ?Sized> Task for Box<T> {
    fn execute(&mut self, ctx: &mut TaskContext<'_>) {
        (**self).execute(ctx);
    }

    fn release(&mut self) {
        (**self).release();
    }
}

/// What a running task can see of the scheduler.
///
/// Tasks added through the context are not considered before the next tick.
/// Removing the running task only marks it; the registry releases it once
/// `execute` has returned.
pub struct TaskContext<'a> {
    registry: &'a mut Registry,
    task_id: TaskId,
    now: TimeSpec,
}

impl<'a> TaskContext<'a> {
    pub(crate) fn new(registry: &'a mut Registry, task_id: TaskId, now: TimeSpec) -> Self {
        Self {
            registry,
            task_id,
            now,
        }
    }

    pub fn now(&self) -> TimeSpec {
        self.now
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn count(&self) -> usize {
        self.registry.len()
    }

    pub fn add<T: Task + 'static>(&mut self, task: T, period: TimeSpec) -> Result<TaskId, TimerError> {
        self.registry.insert(TaskRef::owned(task), period, self.now)
    }

    pub fn add_shared<T: Task + 'static>(
        &mut self,
        task: &Rc<RefCell<T>>,
        period: TimeSpec,
    ) -> Result<TaskId, TimerError> {
        self.registry.insert(TaskRef::shared(task), period, self.now)
    }

    pub fn add_fn<F: FnMut() + 'static>(
        &mut self,
        callback: F,
        period: TimeSpec,
    ) -> Result<TaskId, TimerError> {
        self.add(ClosureTask::new(callback), period)
    }

    pub fn remove(&mut self, id: TaskId) -> Result<(), TimerError> {
        self.registry.remove(id)
    }

    pub fn remove_shared<T: ?Sized>(&mut self, task: &Rc<RefCell<T>>) -> Result<(), TimerError> {
        self.registry.remove_shared(task)
    }

    pub fn remove_self(&mut self) {
        if self.registry.remove(self.task_id).is_err() {
            warn!("{} requested its own removal twice", self.task_id);
        }
    }
}

/// Ownership of a registered task.
///
/// `Owned` tasks belong to the registry and are dropped after `release`.
/// `Shared` tasks stay reachable through the caller's handle; their identity
/// is the address of the shared cell.
pub enum TaskRef {
    Owned(Box<dyn Task>),
    Shared(Rc<RefCell<dyn Task>>),
}

impl TaskRef {
    pub fn owned<T: Task + 'static>(task: T) -> Self {
        Self::Owned(Box::new(task))
    }

    pub fn shared<T: Task + 'static>(task: &Rc<RefCell<T>>) -> Self {
        let task: Rc<RefCell<dyn Task>> = task.clone();
        Self::Shared(task)
    }

    pub(crate) fn shared_address(&self) -> Option<*const ()> {
        match self {
            Self::Owned(_) => None,
            Self::Shared(task) => Some(address_of(task)),
        }
    }

    /// Returns `false` if a shared task was borrowed elsewhere and did not run.
    pub(crate) fn execute(&mut self, ctx: &mut TaskContext<'_>) -> bool {
        match self {
            Self::Owned(task) => task.execute(ctx),
            Self::Shared(task) => match task.try_borrow_mut() {
                Ok(mut task) => task.execute(ctx),
                Err(_) => {
                    warn!("{} is borrowed elsewhere; retrying next tick", ctx.task_id());
                    return false;
                }
            },
        }
        true
    }

    /// Returns `false` if a shared task was borrowed elsewhere; the caller
    /// still owes it a release.
    pub(crate) fn release(&mut self) -> bool {
        match self {
            Self::Owned(task) => task.release(),
            Self::Shared(task) => match task.try_borrow_mut() {
                Ok(mut task) => task.release(),
                Err(_) => return false,
            },
        }
        true
    }
}

impl fmt::Debug for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Owned(_) => f.write_str("TaskRef::Owned"),
            Self::Shared(task) => write!(f, "TaskRef::Shared({:p})", address_of(task)),
        }
    }
}

pub(crate) fn address_of<T: ?Sized>(task: &Rc<RefCell<T>>) -> *const () {
    Rc::as_ptr(task) as *const ()
}

/// Function-pointer task. Stateless apart from counting how often it ran.
#[derive(Debug, Clone, Default)]
pub struct FnTask {
    callback: Option<fn()>,
    expire_count: u64,
}

impl FnTask {
    pub fn new(callback: Option<fn()>) -> Self {
        Self {
            callback,
            expire_count: 0,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expire_count != 0
    }

    pub fn expire_count(&self) -> u64 {
        self.expire_count
    }

    pub fn reset(&mut self) {
        self.expire_count = 0;
    }
}

impl Task for FnTask {
    fn execute(&mut self, _ctx: &mut TaskContext<'_>) {
        self.expire_count = self.expire_count.saturating_add(1);
        if let Some(callback) = self.callback {
            callback();
        }
    }
}

/// Wraps an argument-less closure. The captured state lives until the
/// registration is released.
pub struct ClosureTask<F> {
    callback: Option<F>,
}

impl<F: FnMut()> ClosureTask<F> {
    pub fn new(callback: F) -> Self {
        Self {
            callback: Some(callback),
        }
    }

    pub fn is_released(&self) -> bool {
        self.callback.is_none()
    }
}

impl<F: FnMut()> Task for ClosureTask<F> {
    fn execute(&mut self, _ctx: &mut TaskContext<'_>) {
        if let Some(callback) = self.callback.as_mut() {
            callback();
        }
    }

    fn release(&mut self) {
        self.callback = None;
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    fn run_once(task: &mut dyn Task) {
        let mut registry = Registry::new();
        let mut ctx = TaskContext::new(&mut registry, TaskId::new(0), TimeSpec::ZERO);
        task.execute(&mut ctx);
    }

    #[test]
    fn fn_task_counts_expirations_without_callback() {
        let mut task = FnTask::new(None);
        assert!(!task.is_expired());

        run_once(&mut task);
        run_once(&mut task);
        assert_eq!(task.expire_count(), 2);

        task.reset();
        assert!(!task.is_expired());
    }

    #[test]
    fn fn_task_invokes_pointer() {
        thread_local! {
            static CALLS: Cell<u32> = const { Cell::new(0) };
        }
        fn bump() {
            CALLS.with(|calls| calls.set(calls.get() + 1));
        }

        let mut task = FnTask::new(Some(bump));
        run_once(&mut task);
        assert_eq!(CALLS.with(Cell::get), 1);
    }

    #[test]
    fn closure_task_drops_captured_state_on_release() {
        let hits = Rc::new(Cell::new(0));
        let captured = hits.clone();
        let mut task = ClosureTask::new(move || captured.set(captured.get() + 1));

        run_once(&mut task);
        assert_eq!(hits.get(), 1);
        assert_eq!(Rc::strong_count(&hits), 2);

        task.release();
        assert!(task.is_released());
        assert_eq!(Rc::strong_count(&hits), 1);

        run_once(&mut task);
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn shared_refs_compare_by_address() {
        let first = Rc::new(RefCell::new(FnTask::default()));
        let second = Rc::new(RefCell::new(FnTask::default()));

        let a = TaskRef::shared(&first);
        let b = TaskRef::shared(&first);
        let c = TaskRef::shared(&second);

        assert_eq!(a.shared_address(), b.shared_address());
        assert_ne!(a.shared_address(), c.shared_address());
        assert_eq!(TaskRef::owned(FnTask::default()).shared_address(), None);
    }
}
