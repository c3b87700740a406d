use tracing::{debug, trace, warn};

use crate::timer::Timer;
use crate::{min_opt, Millis};

/// Debounced deferred single-shot work.
///
/// `schedule()` requests one dispatch. The dispatch happens when the owning
/// loop goes idle, or at the deadline at the latest. After a dispatch the
/// work cools down; schedules arriving during cooldown coalesce into exactly
/// one dispatch once the cooldown expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkState {
    Idle,
    Pending,
    CoolingDown,
    CoolingDownAndPending,
}

#[derive(Debug)]
pub struct Work {
    state: WorkState,
    deadline_ms: Millis,
    cooldown_ms: Millis,
    timer: Timer,
    name: String,
}

impl Work {
    pub fn new(name: impl Into<String>, deadline_ms: Millis, cooldown_ms: Millis) -> Self {
        Self {
            state: WorkState::Idle,
            deadline_ms,
            cooldown_ms,
            timer: Timer::disarmed(),
            name: name.into(),
        }
    }

    pub fn state(&self) -> WorkState {
        self.state
    }

    pub fn set_deadline_ms(&mut self, t: Millis) {
        debug!(work = %self.name, from = self.deadline_ms, to = t, "work: deadline");
        self.deadline_ms = t;
    }

    pub fn set_cooldown_ms(&mut self, t: Millis) {
        debug!(work = %self.name, from = self.cooldown_ms, to = t, "work: cooldown");
        self.cooldown_ms = t;
    }

    pub fn schedule(&mut self, now: Millis) {
        match self.state {
            WorkState::Idle => self.plan(now),
            WorkState::Pending => (),
            WorkState::CoolingDown => self.plan_again(),
            WorkState::CoolingDownAndPending => (),
        }
    }

    pub fn cancel(&mut self) {
        if self.state == WorkState::Idle {
            return;
        }
        trace!(work = %self.name, "work: cancel");
        self.timer.disarm();
        self.state = WorkState::Idle;
    }

    fn plan(&mut self, now: Millis) {
        trace!(work = %self.name, "work: plan");
        self.timer.arm_at(now + self.deadline_ms);
        self.state = WorkState::Pending;
    }

    fn plan_again(&mut self) {
        trace!(work = %self.name, "work: plan again");
        self.state = WorkState::CoolingDownAndPending;
    }

    fn call(&mut self, now: Millis) {
        trace!(work = %self.name, "work: call");
        self.timer.arm_at(now + self.cooldown_ms);
        self.state = WorkState::CoolingDown;
    }

    fn settle(&mut self) {
        trace!(work = %self.name, "work: settle");
        self.state = WorkState::Idle;
    }

    /// Advance the state machine. Returns true when the bound callback must
    /// run now. `idle` says whether the owning loop has drained its event
    /// batch; the deadline timer forces progress when it never does.
    pub fn poll(&mut self, now: Millis, idle: bool) -> bool {
        match self.state {
            WorkState::Idle => false,
            WorkState::Pending => {
                if idle || self.timer.is_expired(now) {
                    self.call(now);
                    true
                } else {
                    false
                }
            }
            WorkState::CoolingDown => {
                if self.timer.take_expired(now) {
                    self.settle();
                }
                false
            }
            WorkState::CoolingDownAndPending => {
                if self.timer.take_expired(now) {
                    self.settle();
                    self.schedule(now);
                    // Dispatch on the next idle pass, same as a fresh
                    // schedule would.
                    return self.poll(now, idle);
                }
                false
            }
        }
    }

    pub fn next_wakeup(&self) -> Option<Millis> {
        match self.state {
            WorkState::Idle => None,
            _ => {
                if !self.timer.is_armed() {
                    warn!(work = %self.name, state = ?self.state, "work: timer unexpectedly disarmed");
                }
                self.timer.fires_at()
            }
        }
    }
}

/// Minimum over the wakeups of a set of work units.
pub fn earliest_wakeup<'a>(works: impl Iterator<Item = &'a Work>) -> Option<Millis> {
    works.fold(None, |acc, w| min_opt(acc, w.next_wakeup()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_once_per_burst() {
        let mut w = Work::new("t", 3000, 3000);
        w.schedule(0);
        w.schedule(1);
        w.schedule(2);
        assert!(w.poll(10, true));
        assert_eq!(w.state(), WorkState::CoolingDown);
        assert!(!w.poll(11, true));
    }

    #[test]
    fn deadline_forces_progress() {
        let mut w = Work::new("t", 3000, 3000);
        w.schedule(0);
        // Loop never goes idle; deadline must still dispatch.
        assert!(!w.poll(2999, false));
        assert!(w.poll(3000, false));
    }

    #[test]
    fn cooldown_spaces_dispatches() {
        let mut w = Work::new("t", 3000, 3000);
        w.schedule(0);
        assert!(w.poll(0, true));
        w.schedule(1);
        assert_eq!(w.state(), WorkState::CoolingDownAndPending);
        // Still cooling down: no dispatch.
        assert!(!w.poll(2999, true));
        // Cooldown expired: the pending schedule dispatches.
        assert!(w.poll(3000, true));
        assert_eq!(w.state(), WorkState::CoolingDown);
    }

    #[test]
    fn schedule_during_cooldown_coalesces() {
        let mut w = Work::new("t", 3000, 3000);
        w.schedule(0);
        assert!(w.poll(0, true));
        w.schedule(10);
        w.schedule(20);
        w.schedule(30);
        let mut fired = 0;
        for t in 0..7000 {
            if w.poll(t, true) {
                fired += 1;
            }
        }
        assert_eq!(fired, 1);
    }

    #[test]
    fn cancel_from_any_state() {
        let mut w = Work::new("t", 3000, 3000);
        w.cancel();
        assert_eq!(w.state(), WorkState::Idle);

        w.schedule(0);
        w.cancel();
        assert_eq!(w.state(), WorkState::Idle);
        assert!(!w.poll(5000, true));

        w.schedule(0);
        assert!(w.poll(0, true));
        w.schedule(1);
        w.cancel();
        assert!(!w.poll(10_000, true));
        assert_eq!(w.next_wakeup(), None);
    }

    #[test]
    fn cooldown_settles_back_to_idle() {
        let mut w = Work::new("t", 3000, 3000);
        w.schedule(0);
        assert!(w.poll(0, true));
        assert!(!w.poll(3000, true));
        assert_eq!(w.state(), WorkState::Idle);
    }
}
