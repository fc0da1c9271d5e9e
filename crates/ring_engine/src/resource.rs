// ring_engine/src/resource.rs
//! Resource backends
//!
//! The engine never performs I/O itself. Every operation that targets a
//! descriptor is handed to a [`Resource`] through an [`IoOp`]; the backend
//! either finishes inline, reports `WouldBlock`, or takes an
//! [`IoCompletion`] and finishes later from any thread.
//!
//! ```text
//! issue ─► Resource::submit(&IoOp)
//!            ├─ Ok(Done(n))          completion posted inline
//!            ├─ Err(WouldBlock)      punted to an offload worker
//!            ├─ Err(e)               completion posted with -e
//!            └─ Ok(Queued)           backend holds an IoCompletion
//!                                      └─ complete(res) ─► posted
//! ```

use std::cell::Cell;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use bitflags::bitflags;
use log::warn;
use ring_abi::{OpCode, PollEvents, RingError, RingResult, RwFlags};

use crate::context::Ctx;
use crate::request::{ReqFlags, ReqRef};

bitflags! {
    /// What a backend resource supports
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ResourceCaps: u32 {
        /// Readable
        const READ = 1 << 0;
        /// Writable
        const WRITE = 1 << 1;
        /// Honors non-blocking attempts (returns `WouldBlock` instead of sleeping)
        const NOWAIT = 1 << 2;
        /// Regular file; short reads at the end of data are final
        const REGULAR = 1 << 3;
        /// Opened non-blocking; every attempt is non-blocking
        const NONBLOCK = 1 << 4;
        /// Direct I/O; writes never dirty a shared cache
        const DIRECT = 1 << 5;
        /// Completions can be reaped by busy-polling
        const IOPOLL = 1 << 6;
        /// Supports readiness registrations
        const POLL = 1 << 7;
    }
}

/// Inline outcome of [`Resource::submit`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submitted {
    /// Finished with this many bytes (or 0 for non-data operations)
    Done(u32),
    /// In flight; the backend took an [`IoCompletion`]
    Queued,
}

/// A backend the engine issues operations against
pub trait Resource: Send + Sync {
    /// Capabilities of this resource
    fn caps(&self) -> ResourceCaps;

    /// Start or perform an operation
    ///
    /// When [`IoOp::is_nonblocking`] is set the backend must not sleep and
    /// should return `WouldBlock` instead.
    ///
    /// # Errors
    /// Any [`RingError`]; it is posted as the completion result.
    fn submit(&self, op: &IoOp<'_>) -> RingResult<Submitted>;

    /// Reap busy-polled completions
    ///
    /// Called for resources with [`ResourceCaps::IOPOLL`] in busy-poll
    /// contexts. Returns how many completions were found.
    ///
    /// # Errors
    /// `NotSupported` by default.
    fn iopoll(&self, spin: bool) -> RingResult<u32> {
        let _ = spin;
        Err(RingError::NotSupported)
    }

    /// Register a readiness waiter
    ///
    /// Returns the current mask if the resource is already ready for any of
    /// `waiter.events()`, in which case the waiter is dropped. Otherwise the
    /// backend keeps the waiter and calls [`PollWaiter::wake`] later.
    fn poll_arm(&self, waiter: PollWaiter) -> Option<PollEvents> {
        let _ = waiter;
        Some(PollEvents::NVAL)
    }

    /// Forget the waiter with this id
    ///
    /// Returns `true` if the waiter was still registered.
    fn poll_disarm(&self, id: u64) -> bool {
        let _ = id;
        false
    }
}

/// Where non-fixed descriptors are leased from
pub trait ResourceTable: Send + Sync {
    /// Take a reference to the resource behind `fd`
    fn lease(&self, fd: i32) -> Option<Arc<dyn Resource>>;
}

/// A simple descriptor table
#[derive(Default)]
pub struct ResourceMap {
    slots: spin::RwLock<BTreeMap<i32, Arc<dyn Resource>>>,
}

impl ResourceMap {
    /// Create an empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a resource under `fd`, returning the previous one
    pub fn insert(&self, fd: i32, res: Arc<dyn Resource>) -> Option<Arc<dyn Resource>> {
        self.slots.write().insert(fd, res)
    }

    /// Close `fd`
    ///
    /// Requests that already leased the resource keep it alive.
    pub fn remove(&self, fd: i32) -> Option<Arc<dyn Resource>> {
        self.slots.write().remove(&fd)
    }
}

impl ResourceTable for ResourceMap {
    fn lease(&self, fd: i32) -> Option<Arc<dyn Resource>> {
        self.slots.read().get(&fd).cloned()
    }
}

impl core::fmt::Debug for ResourceMap {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ResourceMap")
            .field("fds", &self.slots.read().keys().collect::<Vec<_>>())
            .finish()
    }
}

/// A registered buffer slice an operation reads into or writes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedBuffer {
    /// Index in the registered buffer table
    pub index: u16,
    /// Start of the slice
    pub addr: u64,
    /// Length of the slice
    pub len: u32,
}

/// One operation as seen by a backend
pub struct IoOp<'a> {
    op: OpCode,
    ctx: &'a Arc<Ctx>,
    req: &'a ReqRef,
    fixed: Option<FixedBuffer>,
    nonblock: bool,
    hipri: bool,
    deferred: Cell<bool>,
}

impl<'a> IoOp<'a> {
    pub(crate) const fn new(
        op: OpCode,
        ctx: &'a Arc<Ctx>,
        req: &'a ReqRef,
        fixed: Option<FixedBuffer>,
        nonblock: bool,
        hipri: bool,
    ) -> Self {
        Self {
            op,
            ctx,
            req,
            fixed,
            nonblock,
            hipri,
            deferred: Cell::new(false),
        }
    }

    /// Operation code
    #[must_use]
    pub const fn opcode(&self) -> OpCode {
        self.op
    }

    /// Offset in the resource
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.req.sqe.off
    }

    /// Buffer, iovec or message address
    #[must_use]
    pub fn addr(&self) -> u64 {
        self.req.sqe.addr
    }

    /// Buffer length or iovec count
    #[must_use]
    pub fn len(&self) -> u32 {
        self.req.sqe.len
    }

    /// Raw operation flags
    #[must_use]
    pub fn op_flags(&self) -> u32 {
        self.req.sqe.op_flags
    }

    /// Read/write flags
    #[must_use]
    pub fn rw_flags(&self) -> RwFlags {
        self.req.sqe.rw_flags()
    }

    /// I/O priority
    #[must_use]
    pub fn ioprio(&self) -> u16 {
        self.req.sqe.ioprio
    }

    /// The submitter's correlation tag
    #[must_use]
    pub fn tag(&self) -> u64 {
        self.req.tag()
    }

    /// Registered buffer slice for fixed operations
    #[must_use]
    pub const fn fixed_buffer(&self) -> Option<FixedBuffer> {
        self.fixed
    }

    /// The backend must not sleep
    #[must_use]
    pub const fn is_nonblocking(&self) -> bool {
        self.nonblock
    }

    /// High-priority polled submission
    #[must_use]
    pub const fn is_hipri(&self) -> bool {
        self.hipri
    }

    /// Teardown asked this operation to stop
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.req.has(ReqFlags::CANCEL)
    }

    /// Take ownership of the completion and return [`Submitted::Queued`]
    #[must_use]
    pub fn defer_completion(&self) -> IoCompletion {
        self.deferred.set(true);
        IoCompletion {
            ctx: Arc::clone(self.ctx),
            req: Some(Arc::clone(self.req)),
        }
    }

    pub(crate) fn was_deferred(&self) -> bool {
        self.deferred.get()
    }
}

impl core::fmt::Debug for IoOp<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IoOp")
            .field("opcode", &self.opcode())
            .field("tag", &self.tag())
            .field("nonblock", &self.nonblock)
            .field("hipri", &self.hipri)
            .finish_non_exhaustive()
    }
}

/// Handle a backend uses to finish a queued operation
///
/// Dropping it without calling [`complete`](Self::complete) finishes the
/// operation with `-ECANCELED`.
pub struct IoCompletion {
    ctx: Arc<Ctx>,
    req: Option<ReqRef>,
}

impl IoCompletion {
    /// Correlation tag of the operation
    #[must_use]
    pub fn tag(&self) -> u64 {
        self.req.as_ref().map_or(0, |r| r.tag())
    }

    /// Finish the operation
    ///
    /// # Arguments
    /// * `res` - Bytes transferred, or a negated errno
    pub fn complete(mut self, res: i32) {
        if let Some(req) = self.req.take() {
            self.ctx.complete_rw(&req, res);
        }
    }

    /// Finish the operation with a result
    pub fn complete_with(self, res: RingResult<u32>) {
        let res = match res {
            Ok(n) => i32::try_from(n).unwrap_or(i32::MAX),
            Err(e) => e.as_result(),
        };
        self.complete(res);
    }
}

impl Drop for IoCompletion {
    fn drop(&mut self) {
        if let Some(req) = self.req.take() {
            warn!("[ring] completion for tag {} dropped, cancelling", req.tag());
            self.ctx.complete_rw(&req, RingError::Cancelled.as_result());
        }
    }
}

impl core::fmt::Debug for IoCompletion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IoCompletion")
            .field("tag", &self.tag())
            .finish_non_exhaustive()
    }
}

/// Readiness waiter handed to [`Resource::poll_arm`]
pub struct PollWaiter {
    ctx: Weak<Ctx>,
    req: ReqRef,
    events: PollEvents,
}

impl PollWaiter {
    pub(crate) fn new(ctx: &Arc<Ctx>, req: &ReqRef, events: PollEvents) -> Self {
        Self {
            ctx: Arc::downgrade(ctx),
            req: Arc::clone(req),
            events,
        }
    }

    /// Identity used with [`Resource::poll_disarm`]
    #[must_use]
    pub fn id(&self) -> u64 {
        self.req.id
    }

    /// Events the waiter is interested in (always includes ERR and HUP)
    #[must_use]
    pub const fn events(&self) -> PollEvents {
        self.events
    }

    /// Report readiness
    ///
    /// An empty mask means "something changed" and always completes.
    /// Returns `true` if the registration completed and the backend should
    /// forget the waiter.
    pub fn wake(&self, ready: PollEvents) -> bool {
        if !ready.is_empty() && !ready.intersects(self.events) {
            return false;
        }
        match self.ctx.upgrade() {
            Some(ctx) => {
                ctx.poll_fire(&self.req, ready & self.events);
                true
            }
            None => true,
        }
    }
}

impl core::fmt::Debug for PollWaiter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PollWaiter")
            .field("id", &self.id())
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Inert;

    impl Resource for Inert {
        fn caps(&self) -> ResourceCaps {
            ResourceCaps::READ
        }

        fn submit(&self, _op: &IoOp<'_>) -> RingResult<Submitted> {
            Ok(Submitted::Done(0))
        }
    }

    #[test]
    fn test_resource_map_lease() {
        let map = ResourceMap::new();
        assert!(map.lease(3).is_none());
        assert!(map.insert(3, Arc::new(Inert)).is_none());
        let leased = map.lease(3).unwrap();
        assert_eq!(leased.caps(), ResourceCaps::READ);
        assert!(map.remove(3).is_some());
        assert!(map.lease(3).is_none());
        // The lease outlives the close.
        assert_eq!(leased.caps(), ResourceCaps::READ);
    }

    #[test]
    fn test_default_hooks() {
        assert_eq!(Inert.iopoll(true), Err(RingError::NotSupported));
        assert!(!Inert.poll_disarm(1));
    }
}
