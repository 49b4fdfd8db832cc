//! Single-threaded cooperative scheduler.
//!
//! Tasks are plain closures run to completion, so everything they touch is
//! consistent between two task runs. The only suspension point is the sleep
//! between due instants.

use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Shortest period a task can run at.
pub const MIN_PERIOD: Duration = Duration::from_millis(1);

pub type TaskFn<C> = Box<dyn FnMut(&mut C)>;

struct PeriodicTask<C> {
    name: &'static str,
    period: Duration,
    next_due: Instant,
    run: TaskFn<C>,
}

pub struct Scheduler<C> {
    tasks: Vec<PeriodicTask<C>>,
}

impl<C> Default for Scheduler<C> {
    fn default() -> Self {
        Scheduler { tasks: Vec::new() }
    }
}

impl<C> Scheduler<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a task first due at `start`, then every `period` (at least
    /// [`MIN_PERIOD`]).
    pub fn every(
        &mut self,
        name: &'static str,
        period: Duration,
        start: Instant,
        run: impl FnMut(&mut C) + 'static,
    ) -> &mut Self {
        if period < MIN_PERIOD {
            warn!("Task {} period {:?} raised to {:?}", name, period, MIN_PERIOD);
        }
        let period = period.max(MIN_PERIOD);
        debug!("Registering task {} every {:?}", name, period);
        self.tasks.push(PeriodicTask {
            name,
            period,
            next_due: start,
            run: Box::new(run),
        });
        self
    }

    /// Runs every task due at `now` once, in registration order. Returns
    /// the number of tasks run.
    pub fn run_pending(&mut self, ctx: &mut C, now: Instant) -> usize {
        let mut ran = 0;
        for task in self.tasks.iter_mut().filter(|t| t.next_due <= now) {
            (task.run)(ctx);
            // Skip missed periods instead of bursting to catch up.
            while task.next_due <= now {
                task.next_due += task.period;
            }
            ran += 1;
        }
        ran
    }

    pub fn next_due(&self) -> Option<Instant> {
        self.tasks.iter().map(|t| t.next_due).min()
    }

    /// Drives the tasks until `stop` returns true, sleeping between due instants.
    pub fn run_until(&mut self, ctx: &mut C, mut stop: impl FnMut(&C) -> bool) {
        info!("Scheduler started with {} tasks", self.tasks.len());
        while !stop(&*ctx) {
            self.run_pending(ctx, Instant::now());
            if let Some(due) = self.next_due() {
                let now = Instant::now();
                if due > now {
                    std::thread::sleep(due - now);
                }
            } else {
                break;
            }
        }
        info!("Scheduler stopped");
    }

    /// Drives the tasks for `duration`, or until `stop` returns true.
    pub fn run_for(&mut self, ctx: &mut C, duration: Duration, mut stop: impl FnMut(&C) -> bool) {
        let deadline = Instant::now() + duration;
        self.run_until(ctx, |c| Instant::now() >= deadline || stop(c));
    }

    pub fn task_names(&self) -> Vec<&'static str> {
        self.tasks.iter().map(|t| t.name).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_due_tasks_in_registration_order() {
        let t0 = Instant::now();
        let mut s: Scheduler<Vec<&str>> = Scheduler::new();
        s.every("fast", Duration::from_millis(10), t0, |log| log.push("fast"));
        s.every("slow", Duration::from_millis(30), t0, |log| log.push("slow"));

        let mut log = Vec::new();
        assert_eq!(s.run_pending(&mut log, t0), 2);
        assert_eq!(s.run_pending(&mut log, t0 + Duration::from_millis(5)), 0);
        assert_eq!(s.run_pending(&mut log, t0 + Duration::from_millis(10)), 1);
        assert_eq!(s.run_pending(&mut log, t0 + Duration::from_millis(30)), 2);
        assert_eq!(log, vec!["fast", "slow", "fast", "fast", "slow"]);
    }

    #[test]
    fn missed_periods_run_once() {
        let t0 = Instant::now();
        let mut s: Scheduler<u32> = Scheduler::new();
        s.every("tick", Duration::from_millis(10), t0, |n| *n += 1);
        let mut n = 0;
        s.run_pending(&mut n, t0 + Duration::from_millis(95));
        assert_eq!(n, 1);
        assert_eq!(s.next_due(), Some(t0 + Duration::from_millis(100)));
    }

    #[test]
    fn zero_period_is_raised_to_minimum() {
        let t0 = Instant::now();
        let mut s: Scheduler<u32> = Scheduler::new();
        s.every("busy", Duration::ZERO, t0, |n| *n += 1);
        let mut n = 0;
        assert_eq!(s.run_pending(&mut n, t0 + Duration::from_millis(3)), 1);
        assert_eq!(n, 1);
        assert_eq!(s.next_due(), Some(t0 + Duration::from_millis(4)));
    }

    #[test]
    fn run_until_stops_on_condition() {
        let mut s: Scheduler<u32> = Scheduler::new();
        s.every("tick", Duration::from_millis(1), Instant::now(), |n| *n += 1);
        let mut n = 0;
        s.run_until(&mut n, |n| *n >= 3);
        assert_eq!(n, 3);
        assert_eq!(s.task_names(), vec!["tick"]);
    }

    #[test]
    fn run_for_stops_at_deadline() {
        let mut s: Scheduler<u32> = Scheduler::new();
        s.every("tick", Duration::from_millis(5), Instant::now(), |n| *n += 1);
        let mut n = 0;
        let started = Instant::now();
        s.run_for(&mut n, Duration::from_millis(20), |_| false);
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert!(n >= 1);
    }
}
