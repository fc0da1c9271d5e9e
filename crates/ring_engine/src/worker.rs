// ring_engine/src/worker.rs
//! Offload worker pools
//!
//! Requests that cannot finish without blocking are punted to one of two
//! pools: buffered writes go to the write pool, everything else to the read
//! pool. Workers run each request in blocking mode on behalf of its owner.
//!
//! # Sequential batching
//!
//! Each pool has an async list tracking the last punted byte range. A new
//! punt that lands in the same resource and page range is *merged*: instead
//! of becoming a separate work item it is appended to the async list, and
//! the worker already running the range picks it up when it finishes.
//!
//! ```text
//! submitter                          worker
//!   note(range) ─► SEQ_PREV?           run req
//!   cnt > 0 ─► append to list ───────► splice list, run each
//!   else cnt += 1, queue               cnt -= 1; restart if list refilled
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{fence, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use crossbeam_queue::ArrayQueue;
use log::{debug, trace};
use ring_abi::{OpCode, RingError, RingResult};

use crate::context::Ctx;
use crate::doorbell::Doorbell;
use crate::env::{EnvAttachment, OwnerId};
use crate::request::{ReqFlags, ReqRef};
use crate::resource::{Resource, ResourceCaps};
use crate::stats::bump;

/// Page granularity of the merge window
const PAGE_SIZE: u64 = 4096;

/// Largest merged range
const MAX_MERGE_BYTES: u64 = 1 << 20;

/// Read-class pool index
pub(crate) const READ_CLASS: usize = 0;

/// Write-class pool index
pub(crate) const WRITE_CLASS: usize = 1;

/// Bounded work queue of one pool
pub(crate) struct OffloadQueue {
    queue: ArrayQueue<ReqRef>,
    spill: spin::Mutex<VecDeque<ReqRef>>,
    bell: Doorbell,
}

impl OffloadQueue {
    pub(crate) fn new(depth: usize) -> Self {
        Self {
            queue: ArrayQueue::new(depth.max(1)),
            spill: spin::Mutex::new(VecDeque::new()),
            bell: Doorbell::new(),
        }
    }

    fn push(&self, req: ReqRef) {
        if let Err(req) = self.queue.push(req) {
            self.spill.lock().push_back(req);
        }
        self.bell.ring();
    }

    fn pop(&self) -> Option<ReqRef> {
        self.queue.pop().or_else(|| self.spill.lock().pop_front())
    }

    fn is_empty(&self) -> bool {
        self.queue.is_empty() && self.spill.lock().is_empty()
    }

    /// Whether a submitter punt would overflow the bounded queue
    fn is_full(&self) -> bool {
        self.queue.is_full()
    }

    pub(crate) fn wake_all(&self) {
        self.bell.ring();
    }
}

#[derive(Default)]
struct AsyncState {
    file: Option<Weak<dyn Resource>>,
    io_start: u64,
    io_len: u64,
    list: VecDeque<ReqRef>,
}

impl AsyncState {
    fn same_file(&self, res: &Arc<dyn Resource>) -> bool {
        self.file
            .as_ref()
            .is_some_and(|f| Weak::ptr_eq(f, &Arc::downgrade(res)))
    }

    /// Whether `pos` falls in the pages of the tracked range
    fn in_window(&self, pos: u64) -> bool {
        let start = self.io_start & !(PAGE_SIZE - 1);
        let end = (self.io_start + self.io_len + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        pos >= start && pos <= end
    }
}

/// Sequential batch state of one pool
#[derive(Default)]
pub(crate) struct AsyncList {
    /// Workers currently draining this list
    cnt: AtomicU32,
    state: spin::Mutex<AsyncState>,
}

impl AsyncList {
    fn take_all(&self) -> VecDeque<ReqRef> {
        std::mem::take(&mut self.state.lock().list)
    }

    fn has_pending(&self) -> bool {
        !self.state.lock().list.is_empty()
    }
}

/// Async list of a read or write request
pub(crate) fn async_list_index(req: &ReqRef) -> Option<usize> {
    match req.op? {
        OpCode::Readv | OpCode::ReadFixed => Some(READ_CLASS),
        OpCode::Writev | OpCode::WriteFixed => Some(WRITE_CLASS),
        _ => None,
    }
}

impl Ctx {
    fn offload_class(req: &ReqRef) -> usize {
        let buffered_write = req.op.is_some_and(OpCode::is_write)
            && req
                .resource()
                .is_some_and(|r| !r.caps().contains(ResourceCaps::DIRECT));
        if buffered_write {
            WRITE_CLASS
        } else {
            READ_CLASS
        }
    }

    /// Whether the pool `req` would be punted to has no room
    pub(crate) fn offload_full(&self, req: &ReqRef) -> bool {
        self.offload[Self::offload_class(req)].is_full()
    }

    /// Hand a request to an offload worker
    ///
    /// Requests released internally (drain, chains) may exceed the queue
    /// depth; they wait on the spill list.
    pub(crate) fn queue_async_work(&self, req: &ReqRef) {
        req.set_worker(None);
        self.task_list.lock().insert(req.id, Arc::clone(req));
        bump(&self.stats.punted);
        trace!("[worker] punt tag {}", req.tag());
        self.offload[Self::offload_class(req)].push(Arc::clone(req));
    }

    /// Record a punted range for later merging
    ///
    /// Sets `SEQ_PREV` on `req` if it continues the tracked range.
    pub(crate) fn async_list_note(
        &self,
        idx: usize,
        req: &ReqRef,
        res: &Arc<dyn Resource>,
        len: u64,
    ) {
        let pos = req.sqe.off;
        let mut st = self.async_list[idx].state.lock();
        if st.same_file(res) && st.in_window(pos) {
            if st.io_len + len <= MAX_MERGE_BYTES {
                req.set(ReqFlags::SEQ_PREV);
                st.io_len += len;
            } else {
                st.file = None;
            }
        } else {
            st.file = None;
        }
        if !st.same_file(res) {
            st.io_start = pos;
            st.io_len = len;
            st.file = Some(Arc::downgrade(res));
        }
    }

    /// Append a merged request to a running batch
    ///
    /// Returns `false` if no worker is draining the list.
    pub(crate) fn add_to_prev_work(&self, idx: usize, req: &ReqRef) -> bool {
        if !req.has(ReqFlags::SEQ_PREV) {
            return false;
        }
        let list = &self.async_list[idx];
        if list.cnt.load(Ordering::Acquire) == 0 {
            return false;
        }
        let mut st = list.state.lock();
        st.list.push_back(Arc::clone(req));
        fence(Ordering::SeqCst);
        if list.cnt.load(Ordering::Acquire) == 0 {
            st.list.pop_back();
            return false;
        }
        drop(st);
        self.task_list.lock().insert(req.id, Arc::clone(req));
        bump(&self.stats.merged);
        true
    }

    /// Count a new batch on the async list
    pub(crate) fn async_list_start(&self, idx: usize) {
        self.async_list[idx].cnt.fetch_add(1, Ordering::AcqRel);
    }

    /// Ask offloaded requests to stop
    ///
    /// # Arguments
    /// * `owner` - Only requests of this owner; `None` for all
    pub(crate) fn cancel_async_work(&self, owner: Option<OwnerId>) {
        let tasks = self.task_list.lock();
        for req in tasks.values() {
            if owner.is_some_and(|o| req.env.owner() != o) {
                continue;
            }
            req.mark_cancelled();
        }
    }

    /// Execute one offloaded request in blocking mode
    fn run_one(self: &Arc<Self>, req: &ReqRef, env: &mut Option<BatchEnv>) {
        let res: RingResult<()> = BatchEnv::cover(env, req).and_then(|()| {
            req.set_worker(Some(thread::current()));
            // Pairs with the fence in mark_cancelled.
            fence(Ordering::SeqCst);
            if self.cancel_all.load(Ordering::SeqCst) {
                req.set(ReqFlags::CANCEL);
            }
            if req.has(ReqFlags::CANCEL) {
                return Err(RingError::Cancelled);
            }
            loop {
                match self.issue(req, false) {
                    Err(RingError::WouldBlock) if req.has(ReqFlags::CANCEL) => {
                        break Err(RingError::Cancelled);
                    }
                    Err(RingError::WouldBlock) => thread::yield_now(),
                    other => break other,
                }
            }
        });

        self.task_list.lock().remove(&req.id);
        req.set_worker(None);
        self.put_req(req);

        if let Err(e) = res {
            if req.has(ReqFlags::LINK) {
                req.set(ReqFlags::FAIL_LINK);
            }
            self.add_event(req.tag(), e.as_result());
            self.put_req(req);
        }
    }

    /// Run a work item and any requests merged behind it
    ///
    /// The owner environment stays attached until the batch is drained.
    fn run_work(self: &Arc<Self>, first: ReqRef) {
        let mut env = None;
        self.run_batch(first, &mut env);
    }

    fn run_batch(self: &Arc<Self>, first: ReqRef, env: &mut Option<BatchEnv>) {
        let idx = async_list_index(&first);
        let mut next = Some(first);
        let mut batch = VecDeque::new();
        loop {
            while let Some(req) = next.take() {
                let flags = req.flags();
                self.run_one(&req, env);
                // Released by a drain or a chain; never counted on the list.
                if flags.intersects(ReqFlags::IO_DRAINED | ReqFlags::LINK_DONE) {
                    return;
                }
                let Some(idx) = idx else {
                    break;
                };
                next = batch.pop_front();
                if next.is_none() {
                    batch = self.async_list[idx].take_all();
                    next = batch.pop_front();
                }
            }

            let Some(idx) = idx else {
                return;
            };
            // A submitter may have appended after the last splice.
            let list = &self.async_list[idx];
            let mut left = list.cnt.fetch_sub(1, Ordering::AcqRel) - 1;
            while left == 0 && list.has_pending() {
                list.cnt.fetch_add(1, Ordering::AcqRel);
                batch = list.take_all();
                next = batch.pop_front();
                if next.is_some() {
                    break;
                }
                left = list.cnt.fetch_sub(1, Ordering::AcqRel) - 1;
            }
            if next.is_none() {
                return;
            }
        }
    }
}

/// Owner environment a worker holds across one batch
struct BatchEnv {
    owner: OwnerId,
    has_mm: bool,
    _attached: EnvAttachment,
}

impl BatchEnv {
    /// Make sure the environment `req` needs is attached
    ///
    /// Keeps the current attachment when it belongs to the same owner and
    /// already carries the address space if `req` needs it.
    fn cover(slot: &mut Option<Self>, req: &ReqRef) -> RingResult<()> {
        let needs_mm = req.op.is_some_and(OpCode::needs_user_memory);
        let owner = req.env.owner();
        if slot
            .as_ref()
            .is_some_and(|cur| cur.owner == owner && (cur.has_mm || !needs_mm))
        {
            return Ok(());
        }
        // Detach before attaching so the previous environment is restored.
        *slot = None;
        let attached = req.env.attach(needs_mm)?;
        *slot = Some(Self {
            owner,
            has_mm: needs_mm,
            _attached: attached,
        });
        Ok(())
    }
}

fn worker_loop(ctx: &Arc<Ctx>, class: usize) {
    let queue = &ctx.offload[class];
    loop {
        if let Some(req) = queue.pop() {
            ctx.run_work(req);
            continue;
        }
        if ctx.is_shutdown() {
            break;
        }
        queue
            .bell
            .wait_while(None, || queue.is_empty() && !ctx.is_shutdown());
    }
}

/// Start the read and write pools
///
/// # Errors
/// `OutOfMemory` if a thread cannot be spawned.
pub(crate) fn spawn_pools(ctx: &Arc<Ctx>) -> RingResult<Vec<JoinHandle<()>>> {
    let pools = [
        (READ_CLASS, ctx.config.read_workers, "rd"),
        (WRITE_CLASS, ctx.config.write_workers, "wr"),
    ];
    let mut handles = Vec::new();
    for (class, count, tag) in pools {
        for i in 0..count {
            let ctx = Arc::clone(ctx);
            let handle = thread::Builder::new()
                .name(format!("ring-{tag}-{i}"))
                .spawn(move || worker_loop(&ctx, class))
                .map_err(|_| RingError::OutOfMemory)?;
            handles.push(handle);
        }
    }
    debug!(
        "[worker] started {} read and {} write workers",
        ctx.config.read_workers, ctx.config.write_workers
    );
    Ok(handles)
}
