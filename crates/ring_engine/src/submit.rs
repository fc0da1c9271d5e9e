// ring_engine/src/submit.rs
//! Admission pipeline
//!
//! Entries are consumed from the submission ring in order. For each one:
//!
//! ```text
//! sq_array[head] ─► index in range? ──no──► dropped (counted, batch goes on)
//!        │ yes
//!        ▼
//!  close pending chain? ─► flags valid? ──no──► -EINVAL completion
//!        │
//!        ▼
//!  allocate request ──fail──► stop, entry stays queued
//!        │
//!        ▼
//!  resolve resource ──fail──► -EBADF completion
//!        │
//!        ▼
//!  chain member? ─► append to head
//!  chain head?   ─► hold until the chain closes
//!  otherwise     ─► drain check ─► issue non-blocking ─► offload on WouldBlock
//! ```
//!
//! Requests are taken from the pool in small batches when the submitter
//! passes more than a few entries at once.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::{trace, warn};
use ring_abi::{EnterFlags, OpCode, RingError, RingResult, SetupFlags, SqeFlags};

use crate::context::Ctx;
use crate::env::{OwnerEnv, SigMask};
use crate::request::{ReqFlags, ReqRef, Request};
use crate::resource::Resource;
use crate::stats::bump;
use crate::worker::async_list_index;

/// Per-batch allocation and descriptor cache
struct SubmitState<'a> {
    ctx: &'a Ctx,
    /// Pool credits reserved but not yet used
    free_reqs: u32,
    ios_left: u32,
    bulk: bool,
    /// Last leased descriptor
    file: Option<(i32, Arc<dyn Resource>)>,
}

impl<'a> SubmitState<'a> {
    fn new(ctx: &'a Ctx, nr: u32) -> Self {
        Self {
            ctx,
            free_reqs: 0,
            ios_left: nr,
            bulk: nr > ctx.config.plug_threshold,
            file: None,
        }
    }

    /// Take a gate reference and a pool credit for one request
    ///
    /// # Errors
    /// `NoDevice` if the context is quiescing, `WouldBlock` if the pool is
    /// exhausted.
    fn alloc(&mut self) -> RingResult<()> {
        if !self.ctx.gate.tryget() {
            return Err(RingError::NoDevice);
        }
        if self.free_reqs == 0 {
            let pool = &self.ctx.pool;
            let batch = if self.bulk {
                self.ios_left.min(self.ctx.config.submit_batch).max(1)
            } else {
                1
            };
            if batch > 1 && pool.reserve(batch) {
                self.free_reqs = batch;
            } else if pool.reserve(1) {
                self.free_reqs = 1;
            } else {
                self.ctx.gate.put();
                return Err(RingError::WouldBlock);
            }
        }
        self.free_reqs -= 1;
        self.ios_left = self.ios_left.saturating_sub(1);
        Ok(())
    }

    fn lease(&mut self, env: &OwnerEnv, fd: i32) -> Option<Arc<dyn Resource>> {
        if let Some((cached, res)) = &self.file {
            if *cached == fd {
                return Some(Arc::clone(res));
            }
        }
        let res = env.files().lease(fd)?;
        self.file = Some((fd, Arc::clone(&res)));
        Some(res)
    }
}

impl Drop for SubmitState<'_> {
    fn drop(&mut self) {
        self.ctx.pool.release(self.free_reqs);
    }
}

/// Dependency chain being assembled
#[derive(Default)]
struct PendingLink {
    head: Option<ReqRef>,
    shadow: Option<ReqRef>,
}

impl Ctx {
    /// Consume up to `nr` entries from the submission ring
    ///
    /// Must be called with `uring_lock` held.
    ///
    /// # Arguments
    /// * `env` - Owner the entries are submitted for
    /// * `fixed_only` - Reject entries that do not use the fixed table
    /// * `mm_fault` - The owner's address space is gone; fail every entry
    ///
    /// # Returns
    /// The number of entries consumed, not counting dropped ones.
    ///
    /// # Errors
    /// `WouldBlock` or `NoDevice` if no request could be allocated for the
    /// first entry.
    pub(crate) fn submit_sqes(
        self: &Arc<Self>,
        env: &OwnerEnv,
        nr: u32,
        fixed_only: bool,
        mm_fault: bool,
    ) -> RingResult<u32> {
        let mut state = SubmitState::new(self, nr);
        let mut link = PendingLink::default();
        let mut prev_was_link = false;
        let mut submitted = 0u32;
        let mut starved = None;
        let mut head = self.cached_sq_head.load(Ordering::Acquire);

        for _ in 0..nr {
            if self.rings.sq_pending(head) == 0 {
                break;
            }
            let index = self.rings.sq_array(head).load(Ordering::Relaxed);
            let Some(sqe) = self.rings.read_sqe(index) else {
                head = head.wrapping_add(1);
                self.cached_sq_head.store(head, Ordering::Release);
                let dropped = self.cached_sq_dropped.fetch_add(1, Ordering::AcqRel) + 1;
                self.rings.sq_dropped().store(dropped, Ordering::Release);
                bump(&self.stats.dropped);
                warn!("[submit] dropped entry with index {}", index);
                continue;
            };

            if !prev_was_link {
                if let Some(chain) = link.head.take() {
                    self.queue_link_head(&chain, link.shadow.take());
                }
            }
            prev_was_link = sqe.sqe_flags_truncate().contains(SqeFlags::IO_LINK);

            if link.head.is_some() && sqe.sqe_flags_truncate().contains(SqeFlags::IO_DRAIN) {
                if link.shadow.is_none() {
                    match self.alloc_shadow(env) {
                        Ok(shadow) => link.shadow = Some(shadow),
                        Err(e) => {
                            starved = Some(e);
                            break;
                        }
                    }
                }
                if let Some(shadow) = &link.shadow {
                    shadow.set_sequence(head);
                }
            }

            if mm_fault {
                head = head.wrapping_add(1);
                self.cached_sq_head.store(head, Ordering::Release);
                self.add_event(sqe.user_data, RingError::BadAddress.as_result());
                continue;
            }

            if sqe.sqe_flags().is_none() {
                head = head.wrapping_add(1);
                self.cached_sq_head.store(head, Ordering::Release);
                submitted += 1;
                bump(&self.stats.submitted);
                trace!("[submit] tag {} has unknown flags {:#x}", sqe.user_data, sqe.flags);
                self.add_event(sqe.user_data, RingError::InvalidArgument.as_result());
                continue;
            }

            if let Err(e) = state.alloc() {
                starved = Some(e);
                break;
            }

            let seq = head;
            head = head.wrapping_add(1);
            self.cached_sq_head.store(head, Ordering::Release);
            submitted += 1;
            bump(&self.stats.submitted);

            let req = Arc::new(Request::new(self.pool.next_id(), sqe, env.clone()));
            req.set_sequence(seq);
            self.submit_sqe(req, &mut state, &mut link.head, fixed_only);
        }

        if let Some(chain) = link.head.take() {
            self.queue_link_head(&chain, link.shadow.take());
        } else if let Some(shadow) = link.shadow.take() {
            self.release_req(&shadow);
        }
        drop(state);
        self.rings.commit_sq_head(head);

        match starved {
            Some(e) if submitted == 0 => {
                trace!("[submit] no request available: {:?}", e);
                Err(e)
            }
            _ => Ok(submitted),
        }
    }

    /// Drain placeholder for a chain with a drain-marked member
    fn alloc_shadow(&self, env: &OwnerEnv) -> RingResult<ReqRef> {
        if !self.gate.tryget() {
            return Err(RingError::NoDevice);
        }
        if !self.pool.reserve(1) {
            self.gate.put();
            return Err(RingError::WouldBlock);
        }
        Ok(Arc::new(Request::shadow(self.pool.next_id(), env.clone(), 0)))
    }

    /// Attach the target resource and record drain marking
    fn req_set_resource(
        &self,
        req: &ReqRef,
        state: &mut SubmitState<'_>,
        fixed_only: bool,
    ) -> RingResult<()> {
        let flags = req.sqe.sqe_flags_truncate();
        if flags.contains(SqeFlags::IO_DRAIN) {
            req.set(ReqFlags::IO_DRAIN);
        }
        if !req.op.is_some_and(OpCode::needs_resource) {
            return Ok(());
        }

        let fd = req.sqe.fd;
        let res = if flags.contains(SqeFlags::FIXED_FILE) {
            let res = self
                .registry
                .read()
                .file(fd)
                .ok_or(RingError::BadDescriptor)?;
            req.set(ReqFlags::FIXED_FILE);
            res
        } else {
            if fixed_only {
                return Err(RingError::BadDescriptor);
            }
            state.lease(&req.env, fd).ok_or(RingError::BadDescriptor)?
        };
        req.set_resource(res);
        Ok(())
    }

    fn submit_sqe(
        self: &Arc<Self>,
        req: ReqRef,
        state: &mut SubmitState<'_>,
        link: &mut Option<ReqRef>,
        fixed_only: bool,
    ) {
        if let Err(e) = self.req_set_resource(&req, state, fixed_only) {
            if let Some(chain) = link.as_ref() {
                chain.set(ReqFlags::FAIL_LINK);
            }
            trace!("[submit] tag {} failed admission: {:?}", req.tag(), e);
            self.add_event(req.tag(), e.as_result());
            self.release_req(&req);
            return;
        }

        let linked = req.sqe.sqe_flags_truncate().contains(SqeFlags::IO_LINK);
        if let Some(chain) = link.as_ref() {
            chain.link_list().push_back(req);
        } else if linked {
            req.set(ReqFlags::LINK);
            *link = Some(req);
        } else {
            self.queue_sqe(&req);
        }
    }

    /// Put a drain-ordered request on the defer list if it must wait
    ///
    /// Returns `true` if the request was deferred.
    fn req_defer(&self, req: &ReqRef) -> bool {
        self.with_completion(|st| {
            if !self.seq_defer(st, req) && st.defer_list.is_empty() {
                return false;
            }
            st.defer_list.push_back(Arc::clone(req));
            bump(&self.stats.deferred);
            trace!("[submit] deferred tag {}", req.tag());
            true
        })
    }

    fn queue_sqe(self: &Arc<Self>, req: &ReqRef) {
        if !self.req_defer(req) {
            self.queue_inline(req);
        }
    }

    /// Queue a closed chain
    ///
    /// With a shadow the head waits for everything before it and the shadow
    /// holds back everything after the chain.
    fn queue_link_head(self: &Arc<Self>, head: &ReqRef, shadow: Option<ReqRef>) {
        let Some(shadow) = shadow else {
            self.queue_sqe(head);
            return;
        };
        head.set(ReqFlags::IO_DRAIN);
        let deferred = self.with_completion(|st| {
            let deferred = self.seq_defer(st, head) || !st.defer_list.is_empty();
            if deferred {
                st.defer_list.push_back(Arc::clone(head));
                bump(&self.stats.deferred);
            }
            st.defer_list.push_back(shadow);
            deferred
        });
        if !deferred {
            self.queue_inline(head);
        }
    }

    /// Issue non-blocking, offloading on `WouldBlock`
    fn queue_inline(self: &Arc<Self>, req: &ReqRef) {
        let res = match self.issue(req, true) {
            Err(RingError::WouldBlock)
                if !req.has(ReqFlags::NOWAIT) || req.has(ReqFlags::MUST_PUNT) =>
            {
                let idx = async_list_index(req);
                if idx.is_some_and(|idx| self.add_to_prev_work(idx, req)) {
                    return;
                }
                if self.offload_full(req) {
                    warn!("[submit] offload queue full, failing tag {}", req.tag());
                    Err(RingError::WouldBlock)
                } else {
                    if let Some(idx) = idx {
                        self.async_list_start(idx);
                    }
                    self.queue_async_work(req);
                    return;
                }
            }
            other => other,
        };

        // Drop the submission reference.
        self.put_req(req);
        if let Err(e) = res {
            if req.has(ReqFlags::LINK) {
                req.set(ReqFlags::FAIL_LINK);
            }
            self.add_event(req.tag(), e.as_result());
            self.put_req(req);
        }
    }

    /// Submit and wait on behalf of `env`
    ///
    /// # Errors
    /// Allocation or wait errors when nothing was submitted.
    pub(crate) fn enter(
        self: &Arc<Self>,
        env: &OwnerEnv,
        to_submit: u32,
        min_complete: u32,
        flags: EnterFlags,
        mask: SigMask,
    ) -> RingResult<u32> {
        let mut submitted = 0;
        if self.flags.contains(SetupFlags::SQPOLL) {
            if flags.contains(EnterFlags::SQ_WAKEUP) {
                self.sqpoll_wake();
            }
            submitted = to_submit;
        } else if to_submit != 0 {
            let to_submit = to_submit.min(self.rings.sq_entries());
            let n = {
                let _guard = self.uring_lock.lock();
                let _attached = env.attach(false)?;
                self.submit_sqes(env, to_submit, false, false)?
            };
            submitted = n;
            if n != to_submit {
                return Ok(n);
            }
        }

        if flags.contains(EnterFlags::GETEVENTS) {
            let min = min_complete.min(self.rings.cq_entries());
            let waited = if self.flags.contains(SetupFlags::IOPOLL) {
                self.iopoll_check(min).map(drop)
            } else {
                self.cq_wait_events(env, min, mask)
            };
            if let Err(e) = waited {
                if submitted == 0 {
                    return Err(e);
                }
            }
        }
        Ok(submitted)
    }
}
