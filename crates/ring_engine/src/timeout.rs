// ring_engine/src/timeout.rs
//! Timeout requests
//!
//! A timeout completes on whichever comes first:
//!
//! - its deadline passes: the timer thread posts `-ETIME`
//! - `count` other completions are posted: commit kills it with result 0
//!
//! Both paths race for the request's completion claim, so exactly one
//! posts. Counting timeouts sit on the timeout list ordered by target
//! sequence; deadline-only timeouts (`count == 0`) go to the tail and are
//! never satisfied by completions.
//!
//! ```text
//!  timeout_list:  [seq 5] [seq 9] [seq 12] [noseq] [noseq]
//!                   ▲ checked on every commit
//! ```

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, trace};
use parking_lot::{Condvar, Mutex};
use ring_abi::{RingError, RingResult, SetupFlags};

use crate::completion::CompletionState;
use crate::context::Ctx;
use crate::request::{ReqFlags, ReqRef};
use crate::stats::bump;

#[derive(Default)]
struct TimerState {
    armed: BTreeMap<(Instant, u64), ReqRef>,
    stopped: bool,
}

/// Deadlines served by the timer thread
#[derive(Default)]
pub(crate) struct TimerQueue {
    state: Mutex<TimerState>,
    cv: Condvar,
}

impl TimerQueue {
    /// Arm `req` to fire at `at`
    fn arm(&self, req: &ReqRef, at: Instant) {
        req.set_deadline(at);
        let mut st = self.state.lock();
        let earliest = st.armed.keys().next().map(|&(t, _)| t);
        st.armed.insert((at, req.id), Arc::clone(req));
        if earliest.map_or(true, |t| at < t) {
            self.cv.notify_one();
        }
    }

    /// Cancel the timer of `req`
    ///
    /// Returns `false` if it already fired or was never armed.
    fn disarm(&self, req: &ReqRef) -> bool {
        let Some(at) = req.deadline() else {
            return false;
        };
        self.state.lock().armed.remove(&(at, req.id)).is_some()
    }

    /// Stop the timer thread
    pub(crate) fn stop(&self) {
        let mut st = self.state.lock();
        st.stopped = true;
        st.armed.clear();
        self.cv.notify_all();
    }

    /// Wait for the next batch of expired timers
    ///
    /// Returns `None` once stopped.
    fn wait_expired(&self) -> Option<Vec<ReqRef>> {
        let mut st = self.state.lock();
        loop {
            if st.stopped {
                return None;
            }
            let now = Instant::now();
            let mut fired = Vec::new();
            while let Some(entry) = st.armed.first_entry() {
                if entry.key().0 > now {
                    break;
                }
                fired.push(entry.remove());
            }
            if !fired.is_empty() {
                return Some(fired);
            }
            match st.armed.keys().next().map(|&(t, _)| t) {
                Some(at) => {
                    self.cv.wait_until(&mut st, at);
                }
                None => self.cv.wait(&mut st),
            }
        }
    }

    #[cfg(test)]
    fn armed(&self) -> usize {
        self.state.lock().armed.len()
    }
}

impl Ctx {
    /// Queue a timeout request
    ///
    /// `addr` holds the relative deadline in nanoseconds, `off` the
    /// completion count (0 for a pure deadline).
    pub(crate) fn timeout_arm(&self, req: &ReqRef) -> RingResult<()> {
        if self.flags.contains(SetupFlags::IOPOLL) {
            return Err(RingError::InvalidArgument);
        }
        let sqe = &req.sqe;
        if sqe.flags != 0
            || sqe.ioprio != 0
            || sqe.buf_index != 0
            || sqe.op_flags != 0
            || sqe.len != 1
        {
            return Err(RingError::InvalidArgument);
        }
        req.set(ReqFlags::TIMEOUT);

        // Counts beyond the sequence space never trigger.
        let count = u32::try_from(sqe.off).unwrap_or(u32::MAX);
        let at = Instant::now() + Duration::from_nanos(sqe.addr);

        self.with_completion(|st| {
            if count == 0 {
                req.set(ReqFlags::TIMEOUT_NOSEQ);
                st.timeout_list.push_back(Arc::clone(req));
            } else {
                let pos = self.timeout_insert_pos(st, count);
                let mut span = 0u32;
                for later in st.timeout_list.range(pos..) {
                    if !later.has(ReqFlags::TIMEOUT_NOSEQ) {
                        // Each timeout consumes a completion slot.
                        later.bump_sequence();
                        span += 1;
                    }
                }
                let head = self.cached_sq_head.load(Ordering::Acquire);
                req.set_sequence(head.wrapping_add(count - 1).wrapping_sub(span));
                st.timeout_list.insert(pos, Arc::clone(req));
            }
            // Armed under the completion lock so a commit cannot kill it
            // before the timer exists.
            self.timers.arm(req, at);
        });
        trace!("[timeout] armed tag {} count {}", req.tag(), count);
        Ok(())
    }

    /// Position of a new counting timeout in the timeout list
    ///
    /// Scans from the back, skipping deadline-only entries, and stops after
    /// the last counting timeout that targets an earlier position.
    fn timeout_insert_pos(&self, st: &CompletionState, count: u32) -> usize {
        let head = i64::from(self.cached_sq_head.load(Ordering::Acquire));
        for (i, nxt) in st.timeout_list.iter().enumerate().rev() {
            if nxt.has(ReqFlags::TIMEOUT_NOSEQ) {
                continue;
            }
            let nxt_count = u32::try_from(nxt.sqe.off).unwrap_or(u32::MAX);
            let nxt_head = nxt.sequence().wrapping_sub(nxt_count).wrapping_add(1);
            let mut tmp = head + i64::from(count) - 1;
            let tmp_nxt = i64::from(nxt_head) + i64::from(nxt_count) - 1;
            // The submission head wrapped since `nxt` was queued.
            if head < i64::from(nxt_head) {
                tmp += i64::from(u32::MAX);
            }
            if tmp > tmp_nxt {
                return i + 1;
            }
        }
        0
    }

    /// Cancel a satisfied (or torn down) timeout and post `res`
    ///
    /// Runs under the completion lock; `req` is already off the list.
    pub(crate) fn kill_timeout(&self, st: &mut CompletionState, req: ReqRef, res: i32) {
        if !req.claim() {
            // The timer thread won; it posts -ETIME.
            return;
        }
        self.timers.disarm(&req);
        self.cq_timeouts.fetch_add(1, Ordering::AcqRel);
        self.fill_event(st, req.tag(), res);
        st.put_later(req);
    }

    /// Deadline expiry, on the timer thread
    fn timeout_fire(&self, req: &ReqRef) {
        if !req.claim() {
            return;
        }
        self.cq_timeouts.fetch_add(1, Ordering::AcqRel);
        bump(&self.stats.timeouts_fired);
        self.with_completion(|st| {
            if let Some(pos) = st.timeout_list.iter().position(|r| Arc::ptr_eq(r, req)) {
                // Entries ahead of this one lose the slot it is about to use.
                for prev in st.timeout_list.range(..pos) {
                    prev.bump_sequence();
                }
                st.timeout_list.remove(pos);
            }
            self.fill_event(st, req.tag(), RingError::TimerExpired.as_result());
            self.commit_cqring(st);
        });
        self.ev_posted();
        trace!("[timeout] fired tag {}", req.tag());
        if req.has(ReqFlags::LINK) {
            req.set(ReqFlags::FAIL_LINK);
        }
        self.put_req(req);
    }

    /// Cancel every queued timeout with `-ECANCELED`
    pub(crate) fn kill_timeouts(&self) {
        let killed = self.with_completion(|st| {
            let list = std::mem::take(&mut st.timeout_list);
            let n = list.len();
            for req in list {
                self.kill_timeout(st, req, RingError::Cancelled.as_result());
            }
            self.commit_cqring(st);
            n
        });
        if killed != 0 {
            debug!("[timeout] cancelled {} timeouts", killed);
            self.ev_posted();
        }
    }
}

/// Start the timer thread
///
/// # Errors
/// `OutOfMemory` if the thread cannot be spawned.
pub(crate) fn spawn_timer(ctx: &Arc<Ctx>) -> RingResult<JoinHandle<()>> {
    let ctx = Arc::clone(ctx);
    thread::Builder::new()
        .name("ring-timer".into())
        .spawn(move || {
            while let Some(fired) = ctx.timers.wait_expired() {
                for req in &fired {
                    ctx.timeout_fire(req);
                }
            }
            debug!("[timeout] timer thread exit");
        })
        .map_err(|_| RingError::OutOfMemory)
}

#[cfg(test)]
mod tests {
    use ring_abi::SubmissionEntry;

    use super::*;
    use crate::env::OwnerEnv;
    use crate::request::Request;
    use crate::resource::ResourceMap;

    fn req(id: u64) -> ReqRef {
        let env = OwnerEnv::new(Arc::new(ResourceMap::new()));
        Arc::new(Request::new(id, SubmissionEntry::timeout(0, 0, id), env))
    }

    #[test]
    fn test_timer_queue_order() {
        let q = TimerQueue::default();
        let now = Instant::now();
        let late = req(1);
        let early = req(2);
        q.arm(&late, now + Duration::from_millis(5));
        q.arm(&early, now);
        assert_eq!(q.armed(), 2);
        let fired = q.wait_expired().unwrap();
        assert_eq!(fired[0].id, 2);
    }

    #[test]
    fn test_timer_disarm() {
        let q = TimerQueue::default();
        let r = req(1);
        assert!(!q.disarm(&r));
        q.arm(&r, Instant::now() + Duration::from_secs(60));
        assert!(q.disarm(&r));
        assert!(!q.disarm(&r));
        assert_eq!(q.armed(), 0);
    }

    #[test]
    fn test_stop_ends_wait() {
        let q = Arc::new(TimerQueue::default());
        let waiter = {
            let q = Arc::clone(&q);
            thread::spawn(move || q.wait_expired().is_none())
        };
        thread::sleep(Duration::from_millis(10));
        q.stop();
        assert!(waiter.join().unwrap());
    }
}
