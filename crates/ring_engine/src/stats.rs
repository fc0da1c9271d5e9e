// ring_engine/src/stats.rs
//! Engine counters
//!
//! Counters are bumped with relaxed atomics on the hot paths and read as a
//! consistent-enough [`EngineStats`] snapshot.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::sqpoll::SqPollState;

/// Snapshot of a context's counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EngineStats {
    /// Entries admitted
    pub submitted: u64,
    /// Completions written to the ring
    pub completed: u64,
    /// Completions lost to a full ring
    pub overflowed: u64,
    /// Entries skipped for an out-of-range index
    pub dropped: u64,
    /// Requests handed to offload workers
    pub punted: u64,
    /// Requests merged into a running sequential batch
    pub merged: u64,
    /// Requests held on the defer list
    pub deferred: u64,
    /// Chain members cancelled by a failed predecessor
    pub links_failed: u64,
    /// Timers that expired
    pub timeouts_fired: u64,
    /// Readiness registrations armed
    pub polls_armed: u64,
    /// Busy-poll completions reaped
    pub iopoll_reaped: u64,
    /// Submission thread wakeups
    pub sqpoll_wakeups: u64,
    /// Submission thread idle parks
    pub sqpoll_idle: u64,
    /// Submission thread state
    pub sqpoll_state: Option<SqPollState>,
}

macro_rules! counters {
    ($($name:ident),* $(,)?) => {
        #[derive(Debug, Default)]
        pub(crate) struct Counters {
            $(pub(crate) $name: AtomicU64,)*
        }

        impl Counters {
            pub(crate) fn snapshot(&self) -> EngineStats {
                EngineStats {
                    $($name: self.$name.load(Ordering::Relaxed),)*
                    sqpoll_state: None,
                }
            }
        }
    };
}

counters!(
    submitted,
    completed,
    overflowed,
    dropped,
    punted,
    merged,
    deferred,
    links_failed,
    timeouts_fired,
    polls_armed,
    iopoll_reaped,
    sqpoll_wakeups,
    sqpoll_idle,
);

/// Bump a counter by one
#[inline]
pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}
