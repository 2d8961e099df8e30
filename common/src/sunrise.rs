use log::debug;

use crate::{
    task::{Task, TaskContext},
    timespec::TimeSpec,
};

/// Fades a channel up from dark to `max` over `duration`.
///
/// Brightness follows a quadratic curve so the first minutes stay dim. The
/// ramp measures elapsed time from its first run, hands each new level to
/// `emit`, and unregisters itself once full brightness is reached.
pub struct SunriseRamp<F> {
    duration: TimeSpec,
    max: u16,
    started: Option<TimeSpec>,
    last: Option<u16>,
    emit: F,
}

impl<F: FnMut(u16)> SunriseRamp<F> {
    pub fn new(duration: TimeSpec, max: u16, emit: F) -> Self {
        Self {
            duration,
            max,
            started: None,
            last: None,
            emit,
        }
    }

    pub fn level_at(&self, elapsed: TimeSpec) -> u16 {
        let total = self.duration.as_nanos();
        if total == 0 || elapsed.as_nanos() >= total {
            return self.max;
        }
        let progress = elapsed.as_nanos() as f64 / total as f64;
        (f64::from(self.max) * progress * progress) as u16
    }

    pub fn is_finished(&self) -> bool {
        self.last == Some(self.max)
    }

    fn emit_if_changed(&mut self, level: u16) {
        if self.last != Some(level) {
            self.last = Some(level);
            (self.emit)(level);
        }
    }
}

impl<F: FnMut(u16)> Task for SunriseRamp<F> {
    fn execute(&mut self, ctx: &mut TaskContext<'_>) {
        let now = ctx.now();
        let started = *self.started.get_or_insert(now);
        let elapsed = now.saturating_sub(started);

        if elapsed >= self.duration {
            self.emit_if_changed(self.max);
            debug!("sunrise complete after {elapsed}");
            ctx.remove_self();
            return;
        }

        let level = self.level_at(elapsed);
        self.emit_if_changed(level);
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc};

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{clock::ManualClock, scheduler::TimerSystem};

    fn recorder() -> (Rc<RefCell<Vec<u16>>>, impl FnMut(u16) + 'static) {
        let levels = Rc::new(RefCell::new(Vec::new()));
        let sink = levels.clone();
        (levels, move |level| sink.borrow_mut().push(level))
    }

    #[test]
    fn curve_is_quadratic() {
        let ramp = SunriseRamp::new(TimeSpec::from_secs(100), 1_000, |_| {});

        assert_eq!(ramp.level_at(TimeSpec::ZERO), 0);
        assert_eq!(ramp.level_at(TimeSpec::from_secs(50)), 250);
        assert_eq!(ramp.level_at(TimeSpec::from_secs(100)), 1_000);
        assert_eq!(ramp.level_at(TimeSpec::from_secs(500)), 1_000);
    }

    #[test]
    fn ramps_up_and_removes_itself() {
        let clock = ManualClock::new(0);
        let mut timers = TimerSystem::new(clock.clone());
        let (levels, sink) = recorder();

        timers
            .add(
                SunriseRamp::new(TimeSpec::from_millis(400), 160, sink),
                TimeSpec::from_millis(100),
            )
            .unwrap();

        for _ in 0..5 {
            timers.tick();
            clock.advance(100);
        }

        assert_eq!(*levels.borrow(), vec![0, 10, 40, 90, 160]);
        assert_eq!(timers.count(), 0);
    }

    #[test]
    fn repeated_levels_are_not_emitted() {
        let clock = ManualClock::new(0);
        let mut timers = TimerSystem::new(clock.clone());
        let (levels, sink) = recorder();

        timers
            .add(
                SunriseRamp::new(TimeSpec::from_secs(10), 1, sink),
                TimeSpec::from_millis(1_000),
            )
            .unwrap();

        for _ in 0..4 {
            timers.tick();
            clock.advance(1_000);
        }

        assert_eq!(*levels.borrow(), vec![0]);
        assert_eq!(timers.count(), 1);
    }

    #[test]
    fn zero_duration_finishes_on_first_run() {
        let mut timers = TimerSystem::new(ManualClock::new(0));
        let (levels, sink) = recorder();

        timers
            .add(SunriseRamp::new(TimeSpec::ZERO, 255, sink), TimeSpec::from_millis(10))
            .unwrap();
        timers.tick();

        assert_eq!(*levels.borrow(), vec![255]);
        assert_eq!(timers.count(), 0);
    }
}
