// ring_engine/src/completion.rs
//! Completion posting
//!
//! Every completion passes through the completion lock:
//!
//! ```text
//! lock ─► fill_event (cqe or overflow) ─► commit_cqring ─► unlock ─► ev_posted
//!                                           ├─ kill satisfied timers
//!                                           ├─ publish cq tail (release)
//!                                           └─ release drained requests
//! ```
//!
//! Requests whose last reference is dropped while the lock is held are
//! parked on a reap list and put after the lock is released.

use std::collections::VecDeque;
use std::mem;
use std::sync::atomic::Ordering;

use ring_abi::{CompletionEntry, RingError, RingResult, SetupFlags};

use crate::context::Ctx;
use crate::env::{OwnerEnv, SigMask};
use crate::request::{ReqFlags, ReqRef};
use crate::stats::bump;

/// Half the sequence space; positions this far behind count as reached
const SEQ_HALF: u32 = 1 << 31;

/// State guarded by the completion lock
#[derive(Debug, Default)]
pub(crate) struct CompletionState {
    /// Private producer position of the completion ring
    pub(crate) cached_cq_tail: u32,
    /// Drain-ordered requests waiting for earlier completions
    pub(crate) defer_list: VecDeque<ReqRef>,
    /// Timers ordered by target sequence; count-less timers last
    pub(crate) timeout_list: VecDeque<ReqRef>,
    reap: Vec<ReqRef>,
}

impl CompletionState {
    /// Put `req` once the lock is released
    pub(crate) fn put_later(&mut self, req: ReqRef) {
        self.reap.push(req);
    }
}

impl Ctx {
    /// Run `f` under the completion lock, then put reaped requests
    pub(crate) fn with_completion<R>(&self, f: impl FnOnce(&mut CompletionState) -> R) -> R {
        let (out, reap) = {
            let mut st = self.completion.lock();
            let out = f(&mut st);
            (out, mem::take(&mut st.reap))
        };
        for req in &reap {
            self.put_req(req);
        }
        out
    }

    /// Whether every request before sequence `seq` has produced a completion
    pub(crate) fn seq_reached(&self, st: &CompletionState, seq: u32) -> bool {
        let done = st
            .cached_cq_tail
            .wrapping_add(self.cached_sq_dropped.load(Ordering::Acquire))
            .wrapping_add(self.cached_cq_overflow.load(Ordering::Acquire));
        done.wrapping_sub(seq) < SEQ_HALF
    }

    /// Whether a drain-ordered request must still wait
    pub(crate) fn seq_defer(&self, st: &CompletionState, req: &ReqRef) -> bool {
        let drain = req.flags() & (ReqFlags::IO_DRAIN | ReqFlags::IO_DRAINED);
        drain == ReqFlags::IO_DRAIN && !self.seq_reached(st, req.sequence())
    }

    /// Write one completion, or count it as overflow when the ring is full
    pub(crate) fn fill_event(&self, st: &mut CompletionState, tag: u64, res: i32) {
        if self.rings.cq_has_space(st.cached_cq_tail) {
            // SAFETY: the completion lock makes this the only producer and
            // the slot at cached_cq_tail is free.
            unsafe {
                self.rings
                    .write_cqe(st.cached_cq_tail, CompletionEntry::new(tag, res));
            }
            st.cached_cq_tail = st.cached_cq_tail.wrapping_add(1);
            bump(&self.stats.completed);
        } else {
            let overflow = self
                .cached_cq_overflow
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                    Some(n.saturating_add(1))
                })
                .map_or(u32::MAX, |n| n.saturating_add(1));
            self.rings.cq_overflow().store(overflow, Ordering::Release);
            bump(&self.stats.overflowed);
        }
    }

    /// Publish filled completions and release what they unblocked
    pub(crate) fn commit_cqring(&self, st: &mut CompletionState) {
        while let Some(req) = st.timeout_list.front() {
            if req.has(ReqFlags::TIMEOUT_NOSEQ) || !self.seq_reached(st, req.sequence()) {
                break;
            }
            if let Some(req) = st.timeout_list.pop_front() {
                self.kill_timeout(st, req, 0);
            }
        }

        self.rings.commit_cq_tail(st.cached_cq_tail);

        while let Some(req) = st.defer_list.front() {
            if self.seq_defer(st, req) {
                break;
            }
            let Some(req) = st.defer_list.pop_front() else {
                break;
            };
            if req.has(ReqFlags::SHADOW_DRAIN) {
                st.put_later(req);
            } else {
                req.set(ReqFlags::IO_DRAINED);
                self.queue_async_work(&req);
            }
        }
    }

    /// Wake everyone interested in new completions
    pub(crate) fn ev_posted(&self) {
        self.cq_wait.ring();
        self.waker.wake();
        if self.flags.contains(SetupFlags::SQPOLL) {
            self.sqpoll.bell.ring();
        }
        let notifier = self.notifier.lock().clone();
        if let Some(notifier) = notifier {
            notifier.notify();
        }
    }

    /// Post one completion
    pub(crate) fn add_event(&self, tag: u64, res: i32) {
        self.with_completion(|st| {
            self.fill_event(st, tag, res);
            self.commit_cqring(st);
        });
        self.ev_posted();
    }

    /// Finish a request that went to a backend
    ///
    /// Safe to call more than once; only the first call posts.
    pub(crate) fn complete_rw(&self, req: &ReqRef, res: i32) {
        if !req.claim() {
            return;
        }
        if self.flags.contains(SetupFlags::IOPOLL) {
            req.set_result(res);
            if res == RingError::WouldBlock.as_result() {
                req.unclaim();
            } else {
                Self::check_link_result(req, res);
                req.set(ReqFlags::IOPOLL_COMPLETED);
            }
            return;
        }

        Self::check_link_result(req, res);
        self.add_event(req.tag(), res);
        self.put_req(req);
    }

    /// Fail the rest of a chain on an error or a short transfer
    fn check_link_result(req: &ReqRef, res: i32) {
        let expect = req.expect();
        if req.has(ReqFlags::LINK) && (res < 0 || (expect >= 0 && res != expect)) {
            req.set(ReqFlags::FAIL_LINK);
        }
    }

    /// Wait for completions on behalf of `enter`
    ///
    /// Returns once `min` completions are visible, a timer expired, or an
    /// unblocked signal arrived.
    ///
    /// # Errors
    /// `Interrupted` if a signal to `env` ended the wait with the ring still
    /// empty.
    pub(crate) fn cq_wait_events(
        &self,
        env: &OwnerEnv,
        min: u32,
        mask: SigMask,
    ) -> RingResult<()> {
        if self.rings.cq_ready() >= min {
            return Ok(());
        }
        let signals = env.signals();
        let timeouts = self.cq_timeouts.load(Ordering::Acquire);
        let should_wake = || {
            self.rings.cq_ready() >= min
                || self.cq_timeouts.load(Ordering::Acquire) != timeouts
        };

        signals.subscribe(&self.cq_wait);
        self.cq_wait
            .wait_while(None, || !should_wake() && !signals.has_unblocked(mask));
        signals.unsubscribe(&self.cq_wait);

        if should_wake() {
            return Ok(());
        }
        if signals.take_unblocked(mask).is_some() && self.rings.cq_ready() == 0 {
            return Err(RingError::Interrupted);
        }
        Ok(())
    }
}
