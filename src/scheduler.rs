// ============================================================================
// Frame scheduler: cooperative, self re-arming refresh loop
// ============================================================================
//
// Stands in for requestAnimationFrame: the owner calls `run_due(now)` from its
// event loop and every due tick runs exactly once, on the calling thread.
// A tick decides whether it runs again; the next run is scheduled only after
// it returns, so ticks never overlap or queue up behind a slow one.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// What a tick wants after it ran.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickOutcome {
    /// Run again on the next refresh.
    Rearm,
    /// Do not run again.
    Stop,
}

/// Identifies one started loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FrameHandle(u64);

type Tick = Box<dyn FnMut() -> TickOutcome>;

struct Slot {
    handle: FrameHandle,
    due: Instant,
    /// `None` while the tick is running.
    tick: Option<Tick>,
}

struct SchedulerInner {
    interval: Duration,
    next_id: u64,
    slots: Vec<Slot>,
    started: u64,
    stopped: u64,
}

/// Cloneable handle to one scheduler; clones share the same loops.
#[derive(Clone)]
pub struct FrameScheduler {
    inner: Rc<RefCell<SchedulerInner>>,
}

impl FrameScheduler {
    /// `frame_rate` refreshes per second; zero is treated as one.
    pub fn new(frame_rate: u32) -> Self {
        let interval = Duration::from_secs_f64(1.0 / frame_rate.max(1) as f64);
        Self {
            inner: Rc::new(RefCell::new(SchedulerInner {
                interval,
                next_id: 1,
                slots: Vec::new(),
                started: 0,
                stopped: 0,
            })),
        }
    }

    pub fn interval(&self) -> Duration {
        self.inner.borrow().interval
    }

    /// Schedule `tick` for the next refresh. The first run is due immediately.
    pub fn start(&self, tick: impl FnMut() -> TickOutcome + 'static) -> FrameHandle {
        let mut inner = self.inner.borrow_mut();
        let handle = FrameHandle(inner.next_id);
        inner.next_id += 1;
        inner.started += 1;
        inner.slots.push(Slot {
            handle,
            due: Instant::now(),
            tick: Some(Box::new(tick)),
        });
        crate::log_info!("Frame loop {} started", handle.0);
        handle
    }

    /// Cancel a loop. Returns `false` if it had already finished or been stopped.
    /// Safe to call from inside the loop's own tick.
    pub fn stop(&self, handle: FrameHandle) -> bool {
        let mut inner = self.inner.borrow_mut();
        let Some(pos) = inner.slots.iter().position(|s| s.handle == handle) else {
            return false;
        };
        inner.slots.remove(pos);
        inner.stopped += 1;
        crate::log_info!("Frame loop {} stopped", handle.0);
        true
    }

    pub fn is_active(&self, handle: FrameHandle) -> bool {
        self.inner.borrow().slots.iter().any(|s| s.handle == handle)
    }

    /// Number of loops still scheduled.
    pub fn active(&self) -> usize {
        self.inner.borrow().slots.len()
    }

    /// Total `start` calls.
    pub fn started_count(&self) -> u64 {
        self.inner.borrow().started
    }

    /// Total successful `stop` calls.
    pub fn stopped_count(&self) -> u64 {
        self.inner.borrow().stopped
    }

    /// Earliest time any loop is due.
    pub fn next_due(&self) -> Option<Instant> {
        self.inner.borrow().slots.iter().map(|s| s.due).min()
    }

    /// Run every tick due at `now`, each at most once. Returns how many ran.
    pub fn run_due(&self, now: Instant) -> usize {
        let due: Vec<FrameHandle> = self
            .inner
            .borrow()
            .slots
            .iter()
            .filter(|s| s.due <= now && s.tick.is_some())
            .map(|s| s.handle)
            .collect();

        let mut ran = 0;
        for handle in due {
            // Take the tick out so it can call start/stop on this scheduler.
            let taken = {
                let mut inner = self.inner.borrow_mut();
                inner
                    .slots
                    .iter_mut()
                    .find(|s| s.handle == handle)
                    .and_then(|s| s.tick.take())
            };
            let Some(mut tick) = taken else { continue };

            let outcome = tick();
            ran += 1;

            let mut inner = self.inner.borrow_mut();
            let interval = inner.interval;
            let Some(pos) = inner.slots.iter().position(|s| s.handle == handle) else {
                // Stopped during its own tick.
                continue;
            };
            match outcome {
                TickOutcome::Rearm => {
                    let slot = &mut inner.slots[pos];
                    let next = slot.due + interval;
                    slot.due = if next <= now { now + interval } else { next };
                    slot.tick = Some(tick);
                }
                TickOutcome::Stop => {
                    inner.slots.remove(pos);
                    crate::log_info!("Frame loop {} finished", handle.0);
                }
            }
        }
        ran
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn first_tick_is_due_immediately() {
        let scheduler = FrameScheduler::new(60);
        let count = Rc::new(Cell::new(0));
        let c = count.clone();
        scheduler.start(move || {
            c.set(c.get() + 1);
            TickOutcome::Rearm
        });
        assert_eq!(scheduler.run_due(Instant::now()), 1);
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn rearmed_tick_waits_one_interval() {
        let scheduler = FrameScheduler::new(10);
        let count = Rc::new(Cell::new(0));
        let c = count.clone();
        scheduler.start(move || {
            c.set(c.get() + 1);
            TickOutcome::Rearm
        });
        let now = Instant::now();
        scheduler.run_due(now);
        assert_eq!(scheduler.run_due(now), 0);
        assert_eq!(scheduler.run_due(now + Duration::from_millis(100)), 1);
        assert_eq!(count.get(), 2);
    }

    #[test]
    fn slow_consumer_does_not_build_a_backlog() {
        let scheduler = FrameScheduler::new(100);
        let count = Rc::new(Cell::new(0));
        let c = count.clone();
        scheduler.start(move || {
            c.set(c.get() + 1);
            TickOutcome::Rearm
        });
        let now = Instant::now();
        scheduler.run_due(now);
        // A whole second late: still only one run.
        assert_eq!(scheduler.run_due(now + Duration::from_secs(1)), 1);
        assert_eq!(count.get(), 2);
    }

    #[test]
    fn stop_is_idempotent() {
        let scheduler = FrameScheduler::new(60);
        let handle = scheduler.start(|| TickOutcome::Rearm);
        assert!(scheduler.stop(handle));
        assert!(!scheduler.stop(handle));
        assert_eq!(scheduler.run_due(Instant::now()), 0);
        assert_eq!(scheduler.stopped_count(), 1);
    }

    #[test]
    fn stop_returning_tick_ends_the_loop() {
        let scheduler = FrameScheduler::new(60);
        let handle = scheduler.start(|| TickOutcome::Stop);
        scheduler.run_due(Instant::now());
        assert!(!scheduler.is_active(handle));
        assert!(!scheduler.stop(handle));
    }

    #[test]
    fn tick_can_stop_itself() {
        let scheduler = FrameScheduler::new(60);
        let own = Rc::new(Cell::new(None));
        let (s, o) = (scheduler.clone(), own.clone());
        let handle = scheduler.start(move || {
            if let Some(h) = o.get() {
                s.stop(h);
            }
            TickOutcome::Rearm
        });
        own.set(Some(handle));
        scheduler.run_due(Instant::now());
        assert_eq!(scheduler.active(), 0);
    }

    #[test]
    fn loop_started_inside_a_tick_waits_for_the_next_pass() {
        let scheduler = FrameScheduler::new(60);
        let s = scheduler.clone();
        scheduler.start(move || {
            s.start(|| TickOutcome::Stop);
            TickOutcome::Stop
        });
        assert_eq!(scheduler.run_due(Instant::now()), 1);
        assert_eq!(scheduler.active(), 1);
    }
}
