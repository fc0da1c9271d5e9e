// ring_engine/src/iopoll.rs
//! Busy-poll completion mode
//!
//! With [`SetupFlags::IOPOLL`] the backend does not post completions.
//! It only records the result on the request (see `complete_rw`); the
//! engine finds finished requests by walking the poll list and asking
//! backends to make progress.
//!
//! ```text
//! poll_list:  [done] [done] [pending] [pending]
//!               └──────┴─► reaped in one commit
//!                                 └─ Resource::iopoll(spin) when nothing is done
//! ```
//!
//! Spinning is only allowed while every listed request targets the same
//! resource and fewer than `min` events have been found.
//!
//! [`SetupFlags::IOPOLL`]: ring_abi::SetupFlags::IOPOLL

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;

use log::{debug, trace};
use parking_lot::MutexGuard;
use ring_abi::RingResult;

use crate::context::Ctx;
use crate::request::{ReqFlags, ReqRef};
use crate::resource::Resource;
use crate::stats::bump;

/// Polls between fair releases of the admission lock
const ITERS_PER_BREATHER: u32 = 8;

/// Issued busy-poll requests
#[derive(Debug, Default)]
pub(crate) struct PollList {
    list: VecDeque<ReqRef>,
    /// Requests on more than one resource are listed
    multi_file: bool,
}

impl PollList {
    pub(crate) fn is_empty(&self) -> bool {
        self.list.is_empty()
    }
}

fn same_resource(a: &Arc<dyn Resource>, b: &Arc<dyn Resource>) -> bool {
    Arc::as_ptr(a).cast::<()>() == Arc::as_ptr(b).cast::<()>()
}

enum Step {
    Poll(Arc<dyn Resource>),
    Stop,
}

impl Ctx {
    /// Track a request the backend accepted in busy-poll mode
    pub(crate) fn iopoll_req_issued(&self, req: &ReqRef) {
        let mut pl = self.poll_list.lock();
        if pl.list.is_empty() {
            pl.multi_file = false;
        } else if !pl.multi_file {
            let first = pl.list.front().and_then(|r| r.resource());
            if let (Some(first), Some(res)) = (first, req.resource()) {
                if !same_resource(&first, &res) {
                    pl.multi_file = true;
                }
            }
        }
        // Already-finished requests go first so the next pass finds them.
        if req.has(ReqFlags::IOPOLL_COMPLETED) {
            pl.list.push_front(Arc::clone(req));
        } else {
            pl.list.push_back(Arc::clone(req));
        }
    }

    /// Post a batch of reaped requests in one commit
    fn iopoll_complete(&self, done: Vec<ReqRef>, nr_events: &mut u32) {
        let n = done.len();
        self.with_completion(|st| {
            for req in done {
                self.fill_event(st, req.tag(), req.result());
                st.put_later(req);
            }
            self.commit_cqring(st);
        });
        *nr_events += u32::try_from(n).unwrap_or(u32::MAX);
        for _ in 0..n {
            bump(&self.stats.iopoll_reaped);
        }
        self.ev_posted();
        trace!("[iopoll] reaped {}", n);
    }

    /// One pass over the poll list
    ///
    /// # Errors
    /// The first error a backend poll returns.
    fn do_iopoll(&self, nr_events: &mut u32, min: u32) -> RingResult<()> {
        let mut spin = !self.poll_list.lock().multi_file && *nr_events < min;
        let mut done = Vec::new();
        let mut idx = 0;
        let mut res = Ok(());
        loop {
            let step = {
                let mut pl = self.poll_list.lock();
                loop {
                    let Some(req) = pl.list.get(idx) else {
                        break Step::Stop;
                    };
                    if req.has(ReqFlags::IOPOLL_COMPLETED) {
                        if let Some(req) = pl.list.remove(idx) {
                            done.push(req);
                        }
                        continue;
                    }
                    // Stop at the first unfinished request once something is done.
                    if !done.is_empty() {
                        break Step::Stop;
                    }
                    let res = req.resource();
                    idx += 1;
                    if let Some(res) = res {
                        break Step::Poll(res);
                    }
                }
            };
            let Step::Poll(backend) = step else {
                break;
            };
            match backend.iopoll(spin) {
                Ok(found) => {
                    if found != 0 {
                        spin = false;
                    }
                }
                Err(e) => {
                    res = Err(e);
                    break;
                }
            }
        }
        if !done.is_empty() {
            self.iopoll_complete(done, nr_events);
        }
        res
    }

    /// Poll until `min` events were found or the list empties
    ///
    /// Returns `true` if the list is empty.
    fn iopoll_getevents(&self, nr_events: &mut u32, min: u32) -> RingResult<bool> {
        while !self.poll_list.lock().is_empty() {
            self.do_iopoll(nr_events, min)?;
            if min == 0 || *nr_events >= min {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Reap busy-poll completions for `enter`
    ///
    /// Returns the number of completions posted. With `min > 0` keeps
    /// polling until at least one was found.
    ///
    /// # Errors
    /// A backend poll error.
    pub(crate) fn iopoll_check(&self, min: u32) -> RingResult<u32> {
        let mut nr_events = 0;
        let mut guard = self.uring_lock.lock();
        let mut iters = 0u32;
        loop {
            // Completions already posted (errors, punts) end the wait.
            if self.rings.cq_ready() != 0 {
                break;
            }
            iters = iters.wrapping_add(1);
            if iters % ITERS_PER_BREATHER == 0 {
                // Offloaded issues may be waiting for the lock.
                MutexGuard::bump(&mut guard);
            }
            let tmin = min.saturating_sub(nr_events);
            if !self.iopoll_getevents(&mut nr_events, tmin)? {
                break;
            }
            if min == 0 || nr_events != 0 || self.is_shutdown() {
                break;
            }
            // Nothing listed yet; an offloaded request may still join.
            thread::yield_now();
        }
        Ok(nr_events)
    }

    /// Reap every listed request (teardown and registration)
    pub(crate) fn iopoll_reap_events(&self) {
        let _guard = self.uring_lock.lock();
        let mut total = 0;
        while !self.poll_list.lock().is_empty() {
            let mut nr_events = 0;
            if self.iopoll_getevents(&mut nr_events, 1).is_err() {
                thread::yield_now();
            }
            total += nr_events;
        }
        if total != 0 {
            debug!("[iopoll] reaped {} on quiesce", total);
        }
    }

    /// Reap without waiting, for the submission thread
    ///
    /// Returns the number of completions posted.
    pub(crate) fn iopoll_reap_nowait(&self) -> u32 {
        let mut nr_events = 0;
        let _guard = self.uring_lock.lock();
        if let Err(e) = self.iopoll_getevents(&mut nr_events, 0) {
            trace!("[iopoll] poll failed: {:?}", e);
        }
        nr_events
    }
}
