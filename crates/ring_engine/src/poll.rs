// ring_engine/src/poll.rs
//! Readiness registrations
//!
//! `POLL_ADD` registers a one-shot waiter with the target resource and
//! completes with the ready event mask. `POLL_REMOVE` cancels the
//! registration whose tag equals its `addr`.
//!
//! ```text
//! poll_add ─► cancel_list.push ─► Resource::poll_arm(waiter)
//!                                   ├─ Some(mask)  post mask now
//!                                   └─ None        backend keeps waiter
//!                                                    └─ wake(mask) ─► poll_fire
//! ```
//!
//! The firing waiter, `POLL_REMOVE` and teardown race for the request's
//! completion claim; the loser does nothing.

use std::sync::Arc;

use log::{debug, trace};
use ring_abi::{PollEvents, RingError, RingResult, SetupFlags};

use crate::context::Ctx;
use crate::request::ReqRef;
use crate::resource::{PollWaiter, ResourceCaps};
use crate::stats::bump;

/// Readiness reported by resources without poll support
const DEFAULT_POLLMASK: PollEvents = PollEvents::IN
    .union(PollEvents::OUT)
    .union(PollEvents::RDNORM)
    .union(PollEvents::WRNORM);

impl Ctx {
    fn unlist_poll(&self, req: &ReqRef) -> bool {
        let mut list = self.cancel_list.lock();
        match list.iter().position(|r| Arc::ptr_eq(r, req)) {
            Some(pos) => {
                list.swap_remove(pos);
                true
            }
            None => false,
        }
    }

    /// Post a registration's result and drop its completion reference
    fn poll_complete(&self, req: &ReqRef, res: i32) {
        self.add_event(req.tag(), res);
        self.put_req(req);
    }

    pub(crate) fn poll_add(self: &Arc<Self>, req: &ReqRef) -> RingResult<()> {
        if self.flags.contains(SetupFlags::IOPOLL) {
            return Err(RingError::InvalidArgument);
        }
        let sqe = &req.sqe;
        if sqe.addr != 0 || sqe.ioprio != 0 || sqe.off != 0 || sqe.len != 0 || sqe.buf_index != 0
        {
            return Err(RingError::InvalidArgument);
        }
        let res = req.resource().ok_or(RingError::BadDescriptor)?;
        let events = sqe.poll_events() | PollEvents::ERR | PollEvents::HUP;

        if !res.caps().contains(ResourceCaps::POLL) {
            let mask = DEFAULT_POLLMASK & events;
            self.poll_complete(req, i32::from(mask.bits()));
            return Ok(());
        }

        self.cancel_list.lock().push(Arc::clone(req));
        bump(&self.stats.polls_armed);
        if let Some(mask) = res.poll_arm(PollWaiter::new(self, req, events)) {
            if req.claim() {
                self.unlist_poll(req);
                self.poll_complete(req, i32::from((mask & events).bits()));
            }
        } else {
            trace!("[ring] poll armed for tag {}", req.tag());
        }
        Ok(())
    }

    /// Readiness reported by a backend waiter
    pub(crate) fn poll_fire(&self, req: &ReqRef, mask: PollEvents) {
        if !req.claim() {
            return;
        }
        self.unlist_poll(req);
        self.poll_complete(req, i32::from(mask.bits()));
    }

    /// Cancel one armed registration; `false` if it already completed
    fn poll_cancel(&self, target: &ReqRef) -> bool {
        if let Some(res) = target.resource() {
            res.poll_disarm(target.id);
        }
        if !target.claim() {
            return false;
        }
        self.poll_complete(target, RingError::Cancelled.as_result());
        true
    }

    pub(crate) fn poll_remove(&self, req: &ReqRef) -> RingResult<()> {
        if self.flags.contains(SetupFlags::IOPOLL) {
            return Err(RingError::InvalidArgument);
        }
        let sqe = &req.sqe;
        if sqe.ioprio != 0
            || sqe.off != 0
            || sqe.len != 0
            || sqe.buf_index != 0
            || sqe.op_flags != 0
        {
            return Err(RingError::InvalidArgument);
        }

        let target = {
            let mut list = self.cancel_list.lock();
            list.iter()
                .position(|r| r.tag() == sqe.addr)
                .map(|pos| list.swap_remove(pos))
        };
        let res = match target {
            Some(target) => {
                self.poll_cancel(&target);
                0
            }
            None => RingError::NotFound.as_result(),
        };
        self.add_event(req.tag(), res);
        self.put_req(req);
        Ok(())
    }

    /// Cancel every armed registration
    pub(crate) fn poll_remove_all(&self) {
        let armed = std::mem::take(&mut *self.cancel_list.lock());
        let n = armed.iter().filter(|r| self.poll_cancel(r)).count();
        if n != 0 {
            debug!("[ring] cancelled {} poll registrations", n);
        }
    }
}
