// ring_engine/src/sqpoll.rs
//! Dedicated submission thread
//!
//! With [`SetupFlags::SQPOLL`] a thread owned by the context consumes the
//! submission ring, so the client can submit by only advancing the tail.
//!
//! # States
//!
//! ```text
//!            spawn                          shutdown
//! Stopped ─────────► Polling ◄──────┐    ─────────► Stopping ─► Stopped
//!                      │ idle for   │ entries / wakeup
//!                      ▼ sq_thread_idle
//!                  SleepPrepare ── set NEED_WAKEUP, fence, re-check tail
//!                      │ still empty
//!                      ▼
//!                    Parked
//! ```
//!
//! The client must check [`SqRingFlags::NEED_WAKEUP`] after publishing its
//! tail and call `enter` with `SQ_WAKEUP` when it is set.
//!
//! The owner's address space is attached lazily when entries arrive and
//! dropped before the thread spins idle or parks. If the owner exited, every
//! entry of the batch completes with `-EFAULT`.
//!
//! [`SetupFlags::SQPOLL`]: ring_abi::SetupFlags::SQPOLL
//! [`SqRingFlags::NEED_WAKEUP`]: ring_abi::SqRingFlags::NEED_WAKEUP

use std::hint;
use std::sync::atomic::{fence, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use log::{debug, trace, warn};
use ring_abi::{RingError, RingResult, SetupFlags, SqRingFlags};

use crate::context::Ctx;
use crate::doorbell::Doorbell;
use crate::env::EnvAttachment;
use crate::stats::bump;

/// Submission thread state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SqPollState {
    /// Not running
    Stopped = 0,
    /// Consuming entries or spinning within the idle period
    Polling = 1,
    /// `NEED_WAKEUP` published, re-checking the ring
    SleepPrepare = 2,
    /// Asleep until woken
    Parked = 3,
    /// Shutting down
    Stopping = 4,
}

impl From<u8> for SqPollState {
    fn from(v: u8) -> Self {
        match v {
            1 => Self::Polling,
            2 => Self::SleepPrepare,
            3 => Self::Parked,
            4 => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

/// State shared with the submission thread
#[derive(Debug, Default)]
pub(crate) struct SqPollShared {
    /// Wakes a parked thread
    pub(crate) bell: Doorbell,
    state: AtomicU8,
}

impl SqPollShared {
    pub(crate) fn state(&self) -> SqPollState {
        SqPollState::from(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: SqPollState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

impl Ctx {
    /// Wake a parked submission thread
    pub(crate) fn sqpoll_wake(&self) {
        if self.flags.contains(SetupFlags::SQPOLL) {
            self.sqpoll.bell.ring();
        }
    }

    fn sq_pending_now(&self) -> u32 {
        self.rings
            .sq_pending(self.cached_sq_head.load(Ordering::Acquire))
    }
}

fn pin_to_cpu(cpu: usize) {
    let core = core_affinity::get_core_ids()
        .and_then(|ids| ids.into_iter().find(|core| core.id == cpu));
    match core {
        Some(core) if core_affinity::set_for_current(core) => {
            debug!("[sqpoll] pinned to cpu {}", cpu);
        }
        _ => warn!("[sqpoll] could not pin to cpu {}", cpu),
    }
}

fn sq_thread(ctx: &Arc<Ctx>) {
    if let Some(cpu) = ctx.sq_thread_cpu {
        pin_to_cpu(cpu);
    }
    let sq = &ctx.sqpoll;
    sq.set_state(SqPollState::Polling);
    let iopoll = ctx.flags.contains(SetupFlags::IOPOLL);
    let spin_batch = ctx.config.sqpoll_spin_batch;

    let mut inflight = 0u32;
    let mut idle_at = Instant::now() + ctx.sq_thread_idle;
    let mut attached: Option<EnvAttachment> = None;
    let mut spins = 0u32;

    while !ctx.is_shutdown() {
        if inflight > 0 {
            let nr_events = if iopoll {
                // Nothing listed means whatever we submitted finished or
                // was dropped.
                if ctx.poll_list.lock().is_empty() {
                    inflight
                } else {
                    ctx.iopoll_reap_nowait()
                }
            } else {
                // Completions post themselves; count everything as done.
                inflight
            };
            inflight = inflight.saturating_sub(nr_events);
            if inflight == 0 {
                idle_at = Instant::now() + ctx.sq_thread_idle;
            }
        }

        let mut to_submit = ctx.sq_pending_now();
        if to_submit == 0 {
            attached = None;

            spins += 1;
            if spins < spin_batch {
                hint::spin_loop();
                continue;
            }
            spins = 0;
            if inflight > 0 || Instant::now() < idle_at {
                thread::yield_now();
                continue;
            }

            sq.set_state(SqPollState::SleepPrepare);
            ctx.rings.set_sq_ring_flag(SqRingFlags::NEED_WAKEUP);
            // The flag must be visible before the tail is re-read.
            fence(Ordering::SeqCst);

            to_submit = ctx.sq_pending_now();
            if to_submit == 0 {
                sq.set_state(SqPollState::Parked);
                bump(&ctx.stats.sqpoll_idle);
                trace!("[sqpoll] parked");
                sq.bell
                    .wait_while(None, || ctx.sq_pending_now() == 0 && !ctx.is_shutdown());
                ctx.rings.clear_sq_ring_flag(SqRingFlags::NEED_WAKEUP);
                sq.set_state(SqPollState::Polling);
                bump(&ctx.stats.sqpoll_wakeups);
                trace!("[sqpoll] woken");
                continue;
            }
            ctx.rings.clear_sq_ring_flag(SqRingFlags::NEED_WAKEUP);
            sq.set_state(SqPollState::Polling);
        }

        let mut mm_fault = false;
        if attached.is_none() {
            match ctx.env.attach(true) {
                Ok(att) => attached = Some(att),
                Err(_) => mm_fault = true,
            }
        }

        let to_submit = to_submit.min(ctx.rings.sq_entries());
        let submitted = {
            let _guard = ctx.uring_lock.lock();
            ctx.submit_sqes(&ctx.env, to_submit, true, mm_fault)
        };
        match submitted {
            Ok(n) => inflight += n,
            // Out of requests or quiescing; let completions catch up.
            Err(_) => thread::yield_now(),
        }
    }

    drop(attached);
    sq.set_state(SqPollState::Stopping);
    debug!("[sqpoll] thread exit");
    sq.set_state(SqPollState::Stopped);
}

/// Start the submission thread
///
/// # Errors
/// `OutOfMemory` if the thread cannot be spawned.
pub(crate) fn spawn(ctx: &Arc<Ctx>) -> RingResult<JoinHandle<()>> {
    let ctx = Arc::clone(ctx);
    thread::Builder::new()
        .name("ring-sqpoll".into())
        .spawn(move || sq_thread(&ctx))
        .map_err(|_| RingError::OutOfMemory)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqpoll_state_conversion() {
        assert_eq!(SqPollState::from(0), SqPollState::Stopped);
        assert_eq!(SqPollState::from(1), SqPollState::Polling);
        assert_eq!(SqPollState::from(2), SqPollState::SleepPrepare);
        assert_eq!(SqPollState::from(3), SqPollState::Parked);
        assert_eq!(SqPollState::from(4), SqPollState::Stopping);
        assert_eq!(SqPollState::from(255), SqPollState::Stopped);
    }

    #[test]
    fn test_shared_state_roundtrip() {
        let shared = SqPollShared::default();
        assert_eq!(shared.state(), SqPollState::Stopped);
        shared.set_state(SqPollState::Parked);
        assert_eq!(shared.state(), SqPollState::Parked);
    }
}
