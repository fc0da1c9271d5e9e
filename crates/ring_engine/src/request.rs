// ring_engine/src/request.rs
//! In-flight requests
//!
//! A request is created for every admitted submission entry and lives
//! until both of its references are dropped:
//!
//! ```text
//!        admission            (refs = 2)
//!            │
//!   ┌────────┴─────────┐
//!   submit path         completion path
//!   put after issue     put after posting
//!            └────────┬─────────┘
//!                  free_req            (refs = 0)
//!          link successor / fail chain
//!          release resource, gate ref, pool credit
//! ```
//!
//! Requests are shared as `Arc<Request>`; the explicit reference count
//! decides when the request is *finished*, the `Arc` only keeps the memory
//! alive for lists and timers that still hold a pointer.

use std::collections::VecDeque;
use std::sync::atomic::{fence, AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::Thread;
use std::time::Instant;

use bitflags::bitflags;
use ring_abi::{OpCode, SubmissionEntry};

use crate::env::OwnerEnv;
use crate::resource::Resource;

bitflags! {
    /// Engine-private request state
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub(crate) struct ReqFlags: u32 {
        /// Never offload; report `WouldBlock` to the submitter
        const NOWAIT = 1 << 0;
        /// Busy-poll completion recorded, waiting to be reaped
        const IOPOLL_COMPLETED = 1 << 1;
        /// Resource came from the fixed table
        const FIXED_FILE = 1 << 2;
        /// Merged into an earlier offload batch
        const SEQ_PREV = 1 << 3;
        /// Start after every earlier request completed
        const IO_DRAIN = 1 << 4;
        /// Released from the defer list
        const IO_DRAINED = 1 << 5;
        /// Head or member of a dependency chain with successors
        const LINK = 1 << 6;
        /// Released by a completed predecessor
        const LINK_DONE = 1 << 7;
        /// Fail the remaining chain with `-ECANCELED`
        const FAIL_LINK = 1 << 8;
        /// Placeholder holding back the entries after a drained chain
        const SHADOW_DRAIN = 1 << 9;
        /// Timer request
        const TIMEOUT = 1 << 10;
        /// Resource is a regular file
        const ISREG = 1 << 11;
        /// Must go to an offload worker
        const MUST_PUNT = 1 << 12;
        /// Timer without a completion count
        const TIMEOUT_NOSEQ = 1 << 13;
        /// Teardown asked the request to stop
        const CANCEL = 1 << 14;
        /// Completion claimed; posts at most once
        const COMPLETED = 1 << 15;
    }
}

/// Shared handle to a request
pub(crate) type ReqRef = Arc<Request>;

/// Expected byte count is unknown
pub(crate) const EXPECT_UNKNOWN: i32 = -1;

/// One admitted submission entry
pub(crate) struct Request {
    /// Engine-unique id
    pub(crate) id: u64,
    /// Copy of the entry taken at admission
    pub(crate) sqe: SubmissionEntry,
    /// Decoded op code, `None` for unknown codes
    pub(crate) op: Option<OpCode>,
    /// Environment of the submitter
    pub(crate) env: OwnerEnv,
    sequence: AtomicU32,
    flags: AtomicU32,
    result: AtomicI32,
    expect: AtomicI32,
    refs: AtomicU32,
    resource: spin::Mutex<Option<Arc<dyn Resource>>>,
    link_list: spin::Mutex<VecDeque<ReqRef>>,
    worker: spin::Mutex<Option<Thread>>,
    deadline: spin::Mutex<Option<Instant>>,
}

impl Request {
    /// Create a request with its two references
    pub(crate) fn new(id: u64, sqe: SubmissionEntry, env: OwnerEnv) -> Self {
        Self {
            id,
            op: sqe.op(),
            sqe,
            env,
            sequence: AtomicU32::new(0),
            flags: AtomicU32::new(0),
            result: AtomicI32::new(0),
            expect: AtomicI32::new(EXPECT_UNKNOWN),
            refs: AtomicU32::new(2),
            resource: spin::Mutex::new(None),
            link_list: spin::Mutex::new(VecDeque::new()),
            worker: spin::Mutex::new(None),
            deadline: spin::Mutex::new(None),
        }
    }

    /// Create a drain placeholder at `sequence`
    ///
    /// A placeholder is never issued and never posts; it only holds back
    /// later requests on the defer list.
    pub(crate) fn shadow(id: u64, env: OwnerEnv, sequence: u32) -> Self {
        let req = Self::new(id, SubmissionEntry::new(), env);
        req.refs.store(1, Ordering::Relaxed);
        req.sequence.store(sequence, Ordering::Relaxed);
        req.set(ReqFlags::IO_DRAIN | ReqFlags::SHADOW_DRAIN);
        req
    }

    /// Correlation tag
    #[inline]
    pub(crate) const fn tag(&self) -> u64 {
        self.sqe.user_data
    }

    #[inline]
    pub(crate) fn flags(&self) -> ReqFlags {
        ReqFlags::from_bits_retain(self.flags.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn has(&self, flag: ReqFlags) -> bool {
        self.flags().intersects(flag)
    }

    #[inline]
    pub(crate) fn set(&self, flag: ReqFlags) {
        self.flags.fetch_or(flag.bits(), Ordering::AcqRel);
    }

    #[inline]
    pub(crate) fn clear(&self, flag: ReqFlags) {
        self.flags.fetch_and(!flag.bits(), Ordering::AcqRel);
    }

    /// Claim the right to post this request's completion
    ///
    /// Returns `false` if it was already claimed.
    pub(crate) fn claim(&self) -> bool {
        let prev = self.flags.fetch_or(ReqFlags::COMPLETED.bits(), Ordering::AcqRel);
        prev & ReqFlags::COMPLETED.bits() == 0
    }

    /// Give a claim back (busy-poll `WouldBlock` retries)
    pub(crate) fn unclaim(&self) {
        self.clear(ReqFlags::COMPLETED);
    }

    /// Ask the request to stop and kick its worker
    pub(crate) fn mark_cancelled(&self) {
        self.flags.fetch_or(ReqFlags::CANCEL.bits(), Ordering::SeqCst);
        // Pairs with the fence after a worker publishes itself.
        fence(Ordering::SeqCst);
        if let Some(worker) = self.worker.lock().as_ref() {
            worker.unpark();
        }
    }

    /// Position in the submission order
    #[inline]
    pub(crate) fn sequence(&self) -> u32 {
        self.sequence.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_sequence(&self, seq: u32) {
        self.sequence.store(seq, Ordering::Release);
    }

    /// Move a timer's target back by one position
    #[inline]
    pub(crate) fn bump_sequence(&self) {
        self.sequence.fetch_add(1, Ordering::AcqRel);
    }

    /// Stored busy-poll result
    pub(crate) fn result(&self) -> i32 {
        self.result.load(Ordering::Acquire)
    }

    pub(crate) fn set_result(&self, res: i32) {
        self.result.store(res, Ordering::Release);
    }

    /// Expected byte count of a chained transfer
    pub(crate) fn expect(&self) -> i32 {
        self.expect.load(Ordering::Acquire)
    }

    pub(crate) fn set_expect(&self, n: i32) {
        self.expect.store(n, Ordering::Release);
    }

    /// Take an additional reference
    pub(crate) fn get_ref(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop a reference; `true` when it was the last
    pub(crate) fn put_ref(&self) -> bool {
        let prev = self.refs.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev != 0, "request reference underflow");
        prev == 1
    }

    #[cfg(test)]
    pub(crate) fn refs(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }

    /// Leased resource
    pub(crate) fn resource(&self) -> Option<Arc<dyn Resource>> {
        self.resource.lock().clone()
    }

    pub(crate) fn set_resource(&self, res: Arc<dyn Resource>) {
        *self.resource.lock() = Some(res);
    }

    pub(crate) fn take_resource(&self) -> Option<Arc<dyn Resource>> {
        self.resource.lock().take()
    }

    /// Dependent requests chained behind this one
    pub(crate) fn link_list(&self) -> spin::MutexGuard<'_, VecDeque<ReqRef>> {
        self.link_list.lock()
    }

    /// Record (or clear) the thread executing this request
    pub(crate) fn set_worker(&self, thread: Option<Thread>) {
        *self.worker.lock() = thread;
    }

    pub(crate) fn deadline(&self) -> Option<Instant> {
        *self.deadline.lock()
    }

    pub(crate) fn set_deadline(&self, at: Instant) {
        *self.deadline.lock() = Some(at);
    }
}

impl core::fmt::Debug for Request {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("op", &self.op)
            .field("tag", &self.tag())
            .field("seq", &self.sequence())
            .field("flags", &self.flags())
            .finish_non_exhaustive()
    }
}

/// Credit pool bounding the number of live requests
#[derive(Debug)]
pub(crate) struct RequestPool {
    limit: u32,
    live: AtomicU32,
    next_id: AtomicU64,
}

impl RequestPool {
    pub(crate) const fn new(limit: u32) -> Self {
        Self {
            limit,
            live: AtomicU32::new(0),
            next_id: AtomicU64::new(1),
        }
    }

    /// Reserve `n` credits, all or nothing
    pub(crate) fn reserve(&self, n: u32) -> bool {
        self.live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                live.checked_add(n).filter(|&total| total <= self.limit)
            })
            .is_ok()
    }

    /// Return `n` credits
    pub(crate) fn release(&self, n: u32) {
        if n != 0 {
            self.live.fetch_sub(n, Ordering::AcqRel);
        }
    }

    /// Credits currently held
    pub(crate) fn live(&self) -> u32 {
        self.live.load(Ordering::Acquire)
    }

    pub(crate) fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ResourceMap;

    fn env() -> OwnerEnv {
        OwnerEnv::new(Arc::new(ResourceMap::new()))
    }

    #[test]
    fn test_request_refs() {
        let req = Request::new(1, SubmissionEntry::nop(9), env());
        assert_eq!(req.refs(), 2);
        assert_eq!(req.tag(), 9);
        assert_eq!(req.op, Some(OpCode::Nop));
        assert!(!req.put_ref());
        assert!(req.put_ref());
    }

    #[test]
    fn test_claim_once() {
        let req = Request::new(1, SubmissionEntry::nop(0), env());
        assert!(req.claim());
        assert!(!req.claim());
        req.unclaim();
        assert!(req.claim());
    }

    #[test]
    fn test_shadow_request() {
        let shadow = Request::shadow(2, env(), 17);
        assert_eq!(shadow.refs(), 1);
        assert_eq!(shadow.sequence(), 17);
        assert!(shadow.has(ReqFlags::SHADOW_DRAIN));
        assert!(shadow.has(ReqFlags::IO_DRAIN));
    }

    #[test]
    fn test_pool_limit() {
        let pool = RequestPool::new(4);
        assert!(pool.reserve(3));
        assert!(!pool.reserve(2));
        assert!(pool.reserve(1));
        assert!(!pool.reserve(1));
        pool.release(4);
        assert_eq!(pool.live(), 0);
        assert_ne!(pool.next_id(), pool.next_id());
    }
}
