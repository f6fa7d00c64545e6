//! Monotonic timestamps that cross process and wire boundaries.
//!
//! Task timing uses `CLOCK_MONOTONIC` readings rather than `std::time::
//! Instant`: the raw `(secs, nanos)` pair is written to the wire and to the
//! completion log, and readings taken by the server, its spawned tasks and
//! the submitting client are all comparable because every participant runs
//! on the same machine.

use std::fmt;

use nix::time::{clock_gettime, ClockId};

/// The five lifecycle stages a task is timestamped at, in causal order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(usize)]
pub enum TimeStage {
    /// Client wall point: the submission message was built.
    Sent = 0,
    /// The orchestrator received the submission.
    Arrived = 1,
    /// The task left the queue for a slot.
    Dispatched = 2,
    /// The runner finished awaiting every pipeline stage.
    Ended = 3,
    /// The orchestrator observed the completion notification.
    Completed = 4,
}

impl TimeStage {
    /// All stages, in causal order.
    pub const ALL: [TimeStage; 5] = [
        TimeStage::Sent,
        TimeStage::Arrived,
        TimeStage::Dispatched,
        TimeStage::Ended,
        TimeStage::Completed,
    ];

    /// Number of stages.
    pub const COUNT: usize = 5;
}

/// A `CLOCK_MONOTONIC` reading.
///
/// The all-zero value is reserved as "unset" in serialized forms; a genuine
/// zero reading cannot occur on a running system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct MonoTime {
    pub secs: u64,
    pub nanos: u32,
}

impl MonoTime {
    /// Read the monotonic clock.
    pub fn now() -> Self {
        match clock_gettime(ClockId::CLOCK_MONOTONIC) {
            Ok(ts) => Self {
                secs: ts.tv_sec() as u64,
                nanos: ts.tv_nsec() as u32,
            },
            // The monotonic clock is always available on the platforms the
            // FIFO transport supports; treat a failure like the original
            // treated a clock_gettime error and fall back to the reserved
            // zero value.
            Err(_) => Self::default(),
        }
    }

    /// Whether this is the reserved "unset" value.
    pub fn is_zero(&self) -> bool {
        self.secs == 0 && self.nanos == 0
    }

    /// Total microseconds since the clock origin, as a float.
    fn as_micros_f64(&self) -> f64 {
        self.secs as f64 * 1_000_000.0 + self.nanos as f64 / 1_000.0
    }
}

impl fmt::Display for MonoTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.secs, self.nanos)
    }
}

/// `a - b` in microseconds, or NaN when either endpoint is unset.
///
/// NaN is the wire representation of "this interval is undefined" (e.g. a
/// queued task has no executing time yet).
pub fn micros_between(later: Option<MonoTime>, earlier: Option<MonoTime>) -> f64 {
    match (later, earlier) {
        (Some(a), Some(b)) => a.as_micros_f64() - b.as_micros_f64(),
        _ => f64::NAN,
    }
}
