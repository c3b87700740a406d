//! Deferred-work primitives shared by the reconcilers.
//!
//! Everything here runs on a virtual millisecond clock: callers pass `now`
//! explicitly and ask `next_wakeup()` when to come back. That keeps the
//! state machines deterministic and lets tests replay time without sleeping.
//! The daemon binary maps the virtual clock onto tokio timers.

pub mod gate;
pub mod timer;
pub mod work;

pub use gate::RecalcGate;
pub use timer::Timer;
pub use work::{Work, WorkState};

/// Virtual monotonic time, in milliseconds.
pub type Millis = u64;

pub(crate) fn min_opt(a: Option<Millis>, b: Option<Millis>) -> Option<Millis> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.min(y)),
        (Some(x), None) => Some(x),
        (None, y) => y,
    }
}
