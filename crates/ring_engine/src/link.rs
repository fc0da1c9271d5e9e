// ring_engine/src/link.rs
//! Request release and dependency chains
//!
//! An entry with `IO_LINK` makes the next entry its dependent. The head of
//! a chain owns the remaining members; when the head is freed either the
//! next member is released to an offload worker (carrying the rest of the
//! chain) or, if the head failed, every member completes with
//! `-ECANCELED`.
//!
//! ```text
//! head(LINK) ─► [m1, m2, m3]
//!   success:  m1(LINK, LINK_DONE) ─► [m2, m3]    queued
//!   failure:  m1, m2, m3 ─► -ECANCELED
//! ```

use std::mem;

use log::trace;
use ring_abi::RingError;

use crate::context::Ctx;
use crate::request::{ReqFlags, ReqRef};
use crate::stats::bump;

impl Ctx {
    /// Drop one reference; frees the request on the last one
    pub(crate) fn put_req(&self, req: &ReqRef) {
        if req.put_ref() {
            self.free_req(req);
        }
    }

    /// Finish a request: resolve its chain and release what it holds
    pub(crate) fn free_req(&self, req: &ReqRef) {
        if req.has(ReqFlags::LINK) {
            if req.has(ReqFlags::FAIL_LINK) {
                self.fail_links(req);
            } else {
                self.link_next(req);
            }
        }
        self.release_req(req);
    }

    /// Release the resource, gate reference and pool credit
    pub(crate) fn release_req(&self, req: &ReqRef) {
        drop(req.take_resource());
        self.pool.release(1);
        self.gate.put();
    }

    fn fail_links(&self, req: &ReqRef) {
        let members = mem::take(&mut *req.link_list());
        for member in members {
            trace!("[ring] cancel linked tag {}", member.tag());
            bump(&self.stats.links_failed);
            self.add_event(member.tag(), RingError::Cancelled.as_result());
            self.release_req(&member);
        }
    }

    fn link_next(&self, req: &ReqRef) {
        let next = {
            let mut list = req.link_list();
            let Some(next) = list.pop_front() else {
                return;
            };
            if !list.is_empty() {
                *next.link_list() = mem::take(&mut *list);
                next.set(ReqFlags::LINK);
            }
            next
        };
        next.set(ReqFlags::LINK_DONE);
        self.queue_async_work(&next);
    }
}
