use crate::timer::Timer;
use crate::{min_opt, Millis};

/// Per-entity recalc gate: the observe/derive/act cadence used by the
/// backhaul reconcilers.
///
/// Observers `mark()` the gate when a report field actually changed; the
/// engine then asks `try_fire()` on every loop pass. A fire clears the work
/// flag and arms a backoff that spaces consecutive derivations; work marked
/// during backoff runs when the backoff expires. The deadline timer bounds
/// dispatch latency when the loop never goes idle.
#[derive(Debug)]
pub struct RecalcGate {
    work: bool,
    deadline: Timer,
    backoff: Timer,
    deadline_ms: Millis,
    backoff_ms: Millis,
}

impl RecalcGate {
    pub fn new(deadline_ms: Millis, backoff_ms: Millis) -> Self {
        Self {
            work: false,
            deadline: Timer::disarmed(),
            backoff: Timer::disarmed(),
            deadline_ms,
            backoff_ms,
        }
    }

    /// Request a recalc without raising the work flag. The next `try_fire`
    /// still consumes whatever work is already outstanding.
    pub fn arm(&mut self, now: Millis) {
        if !self.deadline.is_armed() {
            self.deadline.arm_at(now + self.deadline_ms);
        }
    }

    /// Raise the work flag and request a recalc.
    pub fn mark(&mut self, now: Millis) {
        self.work = true;
        self.arm(now);
    }

    pub fn has_work(&self) -> bool {
        self.work
    }

    /// Gate check, mirroring the recalc entry conditions: no work means
    /// nothing to do; an armed backoff postpones until it expires. A true
    /// return consumes the work flag and arms the backoff, so the caller
    /// must run the derivation exactly when this returns true.
    pub fn try_fire(&mut self, now: Millis) -> bool {
        self.backoff.take_expired(now);
        if !self.work {
            self.deadline.disarm();
            return false;
        }
        if self.backoff.is_armed() {
            return false;
        }
        self.work = false;
        self.deadline.disarm();
        self.backoff.arm_at(now + self.backoff_ms);
        true
    }

    pub fn cancel(&mut self) {
        self.work = false;
        self.deadline.disarm();
        self.backoff.disarm();
    }

    pub fn next_wakeup(&self) -> Option<Millis> {
        if !self.work {
            return None;
        }
        if self.backoff.is_armed() {
            return min_opt(self.backoff.fires_at(), self.deadline.fires_at());
        }
        self.deadline.fires_at()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_work_no_fire() {
        let mut g = RecalcGate::new(3000, 3000);
        assert!(!g.try_fire(0));
        g.arm(0);
        assert!(!g.try_fire(0));
    }

    #[test]
    fn mark_fires_once() {
        let mut g = RecalcGate::new(3000, 3000);
        g.mark(0);
        assert!(g.try_fire(0));
        assert!(!g.try_fire(1));
    }

    #[test]
    fn backoff_postpones_second_fire() {
        let mut g = RecalcGate::new(3000, 3000);
        g.mark(0);
        assert!(g.try_fire(0));
        g.mark(100);
        // Backoff armed at t=0 for 3000ms, so nothing until then.
        assert!(!g.try_fire(2999));
        assert!(g.try_fire(3000));
    }

    #[test]
    fn wakeup_tracks_backoff_when_blocked() {
        let mut g = RecalcGate::new(3000, 3000);
        g.mark(0);
        assert!(g.try_fire(0));
        g.mark(100);
        assert_eq!(g.next_wakeup(), Some(3000));
        assert!(g.try_fire(3000));
        assert_eq!(g.next_wakeup(), None);
    }

    #[test]
    fn marks_coalesce() {
        let mut g = RecalcGate::new(3000, 3000);
        g.mark(0);
        g.mark(1);
        g.mark(2);
        let mut fired = 0;
        for t in 0..3000 {
            if g.try_fire(t) {
                fired += 1;
            }
        }
        assert_eq!(fired, 1);
    }
}
