// ring_engine/tests/common/mod.rs
//! Shared fixtures: a scriptable backend and ring helpers

#![allow(dead_code)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use ring_engine::ring_abi::{
    CompletionEntry, EnterFlags, OpCode, Params, PollEvents, RingError, RingResult, SetupFlags,
    SubmissionEntry,
};
use ring_engine::{
    AttachedEnv, Context, EngineConfig, FixedBuffer, IoCompletion, IoOp, OwnerEnv, PollWaiter,
    Resource, ResourceCaps, ResourceMap, Submitted, current,
};

/// How a [`MockFile`] answers a submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Finish inline with the configured byte count
    Inline,
    /// Report `WouldBlock` to non-blocking attempts, finish otherwise
    BlockingOnly,
    /// Fail with this error
    Fail(RingError),
    /// Keep the completion for the test (or `iopoll`) to finish
    Queue,
    /// Finish with fewer bytes than asked for
    Short(u32),
    /// Block until the gate opens or the request is cancelled
    Gated,
}

/// One observed submission
#[derive(Debug, Clone)]
pub struct Call {
    pub tag: u64,
    pub op: OpCode,
    pub nonblocking: bool,
    pub offset: u64,
    pub fixed: Option<FixedBuffer>,
    pub env: Option<AttachedEnv>,
    pub thread: Option<String>,
}

/// Scriptable backend resource
pub struct MockFile {
    caps: ResourceCaps,
    bytes: u32,
    behavior: Mutex<Behavior>,
    calls: Mutex<Vec<Call>>,
    queued: Mutex<Vec<IoCompletion>>,
    waiters: Mutex<Vec<PollWaiter>>,
    ready: Mutex<PollEvents>,
    gate: Mutex<bool>,
    gate_cv: Condvar,
    cancelled: Mutex<u32>,
}

impl MockFile {
    pub fn new(caps: ResourceCaps, behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            caps,
            bytes: 512,
            behavior: Mutex::new(behavior),
            calls: Mutex::new(Vec::new()),
            queued: Mutex::new(Vec::new()),
            waiters: Mutex::new(Vec::new()),
            ready: Mutex::new(PollEvents::empty()),
            gate: Mutex::new(false),
            gate_cv: Condvar::new(),
            cancelled: Mutex::new(0),
        })
    }

    /// Readable, writable, non-blocking-capable regular file
    pub fn regular(behavior: Behavior) -> Arc<Self> {
        Self::new(
            ResourceCaps::READ | ResourceCaps::WRITE | ResourceCaps::NOWAIT | ResourceCaps::REGULAR,
            behavior,
        )
    }

    /// Byte count reported by inline completions
    pub fn bytes(&self) -> u32 {
        self.bytes
    }

    pub fn set_behavior(&self, behavior: Behavior) {
        *self.behavior.lock() = behavior;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    /// Wait until at least `n` submissions were observed
    pub fn wait_calls(&self, n: usize) -> Vec<Call> {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let calls = self.calls();
            if calls.len() >= n || Instant::now() > deadline {
                return calls;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Requests that saw a cancellation while gated
    pub fn cancelled(&self) -> u32 {
        *self.cancelled.lock()
    }

    pub fn open_gate(&self) {
        *self.gate.lock() = true;
        self.gate_cv.notify_all();
    }

    /// Finish every queued completion with `res`
    pub fn complete_queued(&self, res: i32) -> usize {
        let queued = std::mem::take(&mut *self.queued.lock());
        let n = queued.len();
        for done in queued {
            done.complete(res);
        }
        n
    }

    /// Drop queued completions without finishing them
    pub fn drop_queued(&self) {
        self.queued.lock().clear();
    }

    pub fn queued(&self) -> usize {
        self.queued.lock().len()
    }

    /// Set readiness and wake matching waiters
    pub fn fire(&self, mask: PollEvents) {
        *self.ready.lock() = mask;
        self.waiters.lock().retain(|w| !w.wake(mask));
    }

    pub fn waiters(&self) -> usize {
        self.waiters.lock().len()
    }

    fn record(&self, op: &IoOp<'_>) {
        self.calls.lock().push(Call {
            tag: op.tag(),
            op: op.opcode(),
            nonblocking: op.is_nonblocking(),
            offset: op.offset(),
            fixed: op.fixed_buffer(),
            env: current(),
            thread: thread::current().name().map(str::to_owned),
        });
    }

    fn gated(&self, op: &IoOp<'_>) -> RingResult<Submitted> {
        let mut open = self.gate.lock();
        while !*open {
            if op.is_cancelled() {
                *self.cancelled.lock() += 1;
                return Err(RingError::Cancelled);
            }
            self.gate_cv.wait_for(&mut open, Duration::from_millis(5));
        }
        Ok(self.done(op))
    }

    /// Data operations transfer `bytes`; everything else reports 0
    fn done(&self, op: &IoOp<'_>) -> Submitted {
        if op.opcode().is_rw() {
            Submitted::Done(self.bytes)
        } else {
            Submitted::Done(0)
        }
    }
}

impl Resource for MockFile {
    fn caps(&self) -> ResourceCaps {
        self.caps
    }

    fn submit(&self, op: &IoOp<'_>) -> RingResult<Submitted> {
        self.record(op);
        let behavior = *self.behavior.lock();
        match behavior {
            Behavior::Inline => Ok(self.done(op)),
            Behavior::BlockingOnly if op.is_nonblocking() => Err(RingError::WouldBlock),
            Behavior::BlockingOnly => Ok(self.done(op)),
            Behavior::Fail(e) => Err(e),
            Behavior::Queue => {
                self.queued.lock().push(op.defer_completion());
                Ok(Submitted::Queued)
            }
            Behavior::Short(n) => Ok(Submitted::Done(n)),
            Behavior::Gated => self.gated(op),
        }
    }

    fn iopoll(&self, _spin: bool) -> RingResult<u32> {
        let n = self.complete_queued(i32::try_from(self.bytes).unwrap());
        Ok(u32::try_from(n).unwrap())
    }

    fn poll_arm(&self, waiter: PollWaiter) -> Option<PollEvents> {
        let ready = *self.ready.lock();
        if ready.intersects(waiter.events()) {
            return Some(ready);
        }
        self.waiters.lock().push(waiter);
        None
    }

    fn poll_disarm(&self, id: u64) -> bool {
        let mut waiters = self.waiters.lock();
        let before = waiters.len();
        waiters.retain(|w| w.id() != id);
        waiters.len() != before
    }
}

/// A ring with its owner's descriptor table
pub struct Fixture {
    pub ring: Context,
    pub files: Arc<ResourceMap>,
    pub env: OwnerEnv,
}

impl Fixture {
    pub fn new(entries: u32, flags: SetupFlags) -> Self {
        Self::with_params(Params::new(flags).with_sq_entries(entries))
    }

    pub fn with_params(params: Params) -> Self {
        Self::build(params, EngineConfig::default(), |env| env)
    }

    pub fn with_config(entries: u32, flags: SetupFlags, config: EngineConfig) -> Self {
        Self::build(Params::new(flags).with_sq_entries(entries), config, |env| env)
    }

    /// Full control: parameters, tuning and the owner environment
    pub fn build(
        mut params: Params,
        config: EngineConfig,
        env: impl FnOnce(OwnerEnv) -> OwnerEnv,
    ) -> Self {
        let files = Arc::new(ResourceMap::new());
        let env = env(OwnerEnv::new(files.clone()));
        let ring = Context::with_config(&mut params, env.clone(), config).unwrap();
        Self { ring, files, env }
    }

    /// Wake the submission thread if it parked
    pub fn kick(&self) {
        if self.ring.submission().needs_wakeup() {
            self.ring.enter(0, 0, EnterFlags::SQ_WAKEUP.bits()).unwrap();
        }
    }

    /// Install `file` under `fd`
    pub fn install(&self, fd: i32, file: &Arc<MockFile>) {
        self.files.insert(fd, file.clone());
    }

    /// Push entries and submit them
    ///
    /// With a submission thread this only wakes it when parked.
    pub fn submit(&self, sqes: &[SubmissionEntry]) -> RingResult<u32> {
        let n = self.ring.submission().push_all(sqes);
        let mut flags = EnterFlags::empty();
        if self.ring.submission().needs_wakeup() {
            flags |= EnterFlags::SQ_WAKEUP;
        }
        self.ring.enter(u32::try_from(n).unwrap(), 0, flags.bits())
    }

    /// Wait for `n` completions and consume them
    pub fn reap(&self, n: usize) -> Vec<CompletionEntry> {
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut out = Vec::new();
        while out.len() < n {
            out.extend(self.ring.completion());
            if out.len() >= n {
                break;
            }
            assert!(Instant::now() < deadline, "timed out with {out:?}");
            let want = u32::try_from(n - out.len()).unwrap();
            match self.ring.enter(0, want, EnterFlags::GETEVENTS.bits()) {
                Ok(_) | Err(RingError::Interrupted) => {}
                Err(e) => panic!("enter failed: {e:?}"),
            }
        }
        out
    }

    /// Completions ready right now
    pub fn ready(&self) -> Vec<CompletionEntry> {
        self.ring.completion().collect()
    }
}

/// Result for a completion with `tag`
pub fn result_of(cqes: &[CompletionEntry], tag: u64) -> i32 {
    cqes.iter()
        .find(|c| c.user_data == tag)
        .map(|c| c.res)
        .unwrap_or_else(|| panic!("no completion for tag {tag} in {cqes:?}"))
}

/// Position of `tag` in `cqes`
pub fn position_of(cqes: &[CompletionEntry], tag: u64) -> usize {
    cqes.iter()
        .position(|c| c.user_data == tag)
        .unwrap_or_else(|| panic!("no completion for tag {tag} in {cqes:?}"))
}
