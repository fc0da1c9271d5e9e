// ring_engine/src/context.rs
//! Ring context
//!
//! A context owns one pair of rings and everything that serves them:
//!
//! ```text
//!                    ┌───────────────────── Ctx ─────────────────────┐
//!  client ─ sq ─────►│ uring_lock: admission (enter / sqpoll thread) │
//!                    │ completion lock: cq tail, defer, timeouts     │
//!  client ◄─ cq ─────│ offload pools [read, write], async lists      │
//!                    │ busy-poll list, poll registrations, tasks     │
//!                    │ gate, request pool, fixed tables, notifier    │
//!                    └───────────────────────────────────────────────┘
//!                          ▲            ▲              ▲
//!                     offload      submission        timer
//!                     workers        thread          thread
//! ```
//!
//! [`Context`] is the public handle. Dropping it (or calling
//! [`close`](Context::close)) cancels outstanding work, waits for every
//! request to finish, and stops the helper threads.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use futures_util::task::AtomicWaker;
use log::{debug, info, warn};
use parking_lot::Mutex;
use ring_abi::{
    DEFAULT_SQ_THREAD_IDLE_MS, EnterFlags, Features, MAX_ENTRIES, Params, PollEvents, RingError,
    RingResult, SetupFlags,
};

use crate::completion::CompletionState;
use crate::config::EngineConfig;
use crate::doorbell::Doorbell;
use crate::env::{OwnerEnv, OwnerId, SigMask};
use crate::future::CompletionFuture;
use crate::gate::RefGate;
use crate::iopoll::PollList;
use crate::queue::{CompletionQueue, SubmissionQueue};
use crate::registry::{CompletionNotify, FixedTables, Registration, RegistryStats};
use crate::request::{ReqRef, RequestPool};
use crate::ring::Rings;
use crate::sqpoll::{self, SqPollShared};
use crate::stats::{Counters, EngineStats};
use crate::timeout::{self, TimerQueue};
use crate::worker::{self, AsyncList, OffloadQueue};

/// Shared engine state of one context
pub(crate) struct Ctx {
    pub(crate) flags: SetupFlags,
    pub(crate) config: EngineConfig,
    pub(crate) rings: Rings,
    pub(crate) env: OwnerEnv,
    pub(crate) sq_thread_idle: Duration,
    pub(crate) sq_thread_cpu: Option<usize>,

    /// Serializes admission
    pub(crate) uring_lock: Mutex<()>,
    /// Private consumer position of the submission ring
    pub(crate) cached_sq_head: AtomicU32,
    pub(crate) cached_sq_dropped: AtomicU32,
    pub(crate) cached_cq_overflow: AtomicU32,
    /// Timers that expired or were satisfied
    pub(crate) cq_timeouts: AtomicU32,

    pub(crate) completion: spin::Mutex<CompletionState>,
    pub(crate) poll_list: spin::Mutex<PollList>,
    /// Armed readiness registrations
    pub(crate) cancel_list: spin::Mutex<Vec<ReqRef>>,
    /// Requests running on offload workers, by request id
    pub(crate) task_list: spin::Mutex<BTreeMap<u64, ReqRef>>,

    pub(crate) pool: RequestPool,
    pub(crate) gate: RefGate,
    pub(crate) registry: spin::RwLock<FixedTables>,
    pub(crate) notifier: spin::Mutex<Option<Arc<dyn CompletionNotify>>>,

    /// Rung whenever completions are posted
    pub(crate) cq_wait: Arc<Doorbell>,
    pub(crate) waker: AtomicWaker,

    pub(crate) offload: [OffloadQueue; 2],
    pub(crate) async_list: [AsyncList; 2],
    pub(crate) sqpoll: SqPollShared,
    pub(crate) timers: TimerQueue,
    pub(crate) stats: Counters,
    /// Teardown started; offloaded work must not run
    pub(crate) cancel_all: AtomicBool,
    pub(crate) shutdown: AtomicBool,
}

impl Ctx {
    fn new(
        params: &Params,
        flags: SetupFlags,
        rings: Rings,
        env: OwnerEnv,
        config: EngineConfig,
    ) -> Self {
        let idle_ms = match params.sq_thread_idle {
            0 => DEFAULT_SQ_THREAD_IDLE_MS,
            ms => ms,
        };
        let sq_thread_cpu = flags
            .contains(SetupFlags::SQ_AFF)
            .then_some(params.sq_thread_cpu as usize);
        Self {
            flags,
            config,
            env,
            sq_thread_idle: Duration::from_millis(u64::from(idle_ms)),
            sq_thread_cpu,
            uring_lock: Mutex::new(()),
            cached_sq_head: AtomicU32::new(0),
            cached_sq_dropped: AtomicU32::new(0),
            cached_cq_overflow: AtomicU32::new(0),
            cq_timeouts: AtomicU32::new(0),
            completion: spin::Mutex::new(CompletionState::default()),
            poll_list: spin::Mutex::new(PollList::default()),
            cancel_list: spin::Mutex::new(Vec::new()),
            task_list: spin::Mutex::new(BTreeMap::new()),
            pool: RequestPool::new(config.request_limit),
            gate: RefGate::new(),
            registry: spin::RwLock::new(FixedTables::default()),
            notifier: spin::Mutex::new(None),
            cq_wait: Arc::new(Doorbell::new()),
            waker: AtomicWaker::new(),
            offload: [
                OffloadQueue::new(config.offload_depth),
                OffloadQueue::new(config.offload_depth),
            ],
            async_list: [AsyncList::default(), AsyncList::default()],
            sqpoll: SqPollShared::default(),
            timers: TimerQueue::default(),
            stats: Counters::default(),
            cancel_all: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            rings,
        }
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Run a register operation with the context quiesced
    fn register(&self, reg: Registration) -> RingResult<()> {
        let mut guard = self.uring_lock.lock();
        if self.gate.is_dying() {
            return Err(RingError::NoDevice);
        }
        self.gate.kill();
        // The submission thread and busy-poll reaping take the lock.
        parking_lot::MutexGuard::unlocked(&mut guard, || {
            if self.flags.contains(SetupFlags::IOPOLL) {
                self.iopoll_reap_events();
            }
            self.gate.wait_zero();
        });

        let res = match reg {
            Registration::Buffers(regions) => self.registry.write().register_buffers(&regions),
            Registration::UnregisterBuffers => self.registry.write().unregister_buffers(),
            Registration::Files(fds) => self.registry.write().register_files(&self.env, &fds),
            Registration::UnregisterFiles => self.registry.write().unregister_files(),
            Registration::EventNotifier(notify) => {
                let mut slot = self.notifier.lock();
                if slot.is_some() {
                    Err(RingError::Busy)
                } else {
                    *slot = Some(notify);
                    Ok(())
                }
            }
            Registration::UnregisterEventNotifier => {
                self.notifier.lock().take().map(drop).ok_or(RingError::NoDevice)
            }
        };

        self.gate.reinit();
        drop(guard);
        res
    }

    /// Quiesce the context: cancel, reap and wait for every request
    fn quiesce(&self) {
        {
            let _guard = self.uring_lock.lock();
            self.gate.kill();
        }
        // Requests released later by a drain or a chain see this in run_one.
        self.cancel_all.store(true, Ordering::SeqCst);
        self.cancel_async_work(None);
        self.kill_timeouts();
        self.poll_remove_all();
        if self.flags.contains(SetupFlags::IOPOLL) {
            self.iopoll_reap_events();
        }
        self.gate.wait_zero();
    }

    /// Tell every helper thread to exit
    fn stop_threads(&self) {
        self.shutdown.store(true, Ordering::Release);
        for q in &self.offload {
            q.wake_all();
        }
        self.sqpoll_wake();
        self.timers.stop();
    }
}

/// A ring context
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use ring_engine::ring_abi::{EnterFlags, Params, SetupFlags, SubmissionEntry};
/// use ring_engine::{Context, OwnerEnv, ResourceMap};
///
/// let env = OwnerEnv::new(Arc::new(ResourceMap::new()));
/// let mut params = Params::new(SetupFlags::empty());
/// params.sq_entries = 8;
/// let ring = Context::create(&mut params, env).unwrap();
///
/// ring.submission().push(&SubmissionEntry::nop(42)).unwrap();
/// ring.enter(1, 1, EnterFlags::GETEVENTS.bits()).unwrap();
/// let cqe = ring.completion().next().unwrap();
/// assert_eq!(cqe.user_data, 42);
/// ```
pub struct Context {
    ctx: Arc<Ctx>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    sq_lock: Mutex<()>,
    cq_lock: Mutex<()>,
    closed: AtomicBool,
}

impl Context {
    /// Create a context with the default engine configuration
    ///
    /// See [`with_config`](Self::with_config).
    ///
    /// # Errors
    /// As [`with_config`](Self::with_config).
    pub fn create(params: &mut Params, env: OwnerEnv) -> RingResult<Self> {
        Self::with_config(params, env, EngineConfig::default())
    }

    /// Create a context
    ///
    /// `params.sq_entries` is rounded up to a power of two and the
    /// completion ring gets twice as many entries. On success the entry
    /// counts, ring offsets and features are written back into `params`.
    ///
    /// # Arguments
    /// * `params` - Setup parameters, updated in place
    /// * `env` - Environment of the owner submitting through this context
    /// * `config` - Engine tuning
    ///
    /// # Errors
    /// `InvalidArgument` for unknown flags, non-zero reserved fields, an
    /// entry count outside `1..=32768`, `SQ_AFF` without `SQPOLL`, or a CPU
    /// that does not exist. `OutOfMemory` if rings or threads cannot be
    /// created.
    pub fn with_config(
        params: &mut Params,
        env: OwnerEnv,
        config: EngineConfig,
    ) -> RingResult<Self> {
        let flags = params.setup_flags().ok_or(RingError::InvalidArgument)?;
        if params.resv.iter().any(|&r| r != 0) {
            return Err(RingError::InvalidArgument);
        }
        if params.sq_entries == 0 || params.sq_entries > MAX_ENTRIES {
            return Err(RingError::InvalidArgument);
        }
        if flags.contains(SetupFlags::SQ_AFF) {
            if !flags.contains(SetupFlags::SQPOLL) {
                return Err(RingError::InvalidArgument);
            }
            let cpus = thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
            if params.sq_thread_cpu as usize >= cpus {
                return Err(RingError::InvalidArgument);
            }
        }

        let sq_entries = params.sq_entries.next_power_of_two();
        let cq_entries = sq_entries * 2;
        let rings = Rings::new(sq_entries, cq_entries)?;

        params.sq_entries = sq_entries;
        params.cq_entries = cq_entries;
        params.sq_off = rings.sq_offsets();
        params.cq_off = rings.cq_offsets();
        params.features = Features::SINGLE_MMAP.bits();

        let config = config.resolve(sq_entries, cq_entries);
        let ctx = Arc::new(Ctx::new(params, flags, rings, env, config));
        let ring = Self {
            ctx,
            threads: Mutex::new(Vec::new()),
            sq_lock: Mutex::new(()),
            cq_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        };
        ring.start_threads()?;

        info!(
            "[ring] created: sq={} cq={} flags={:?} workers={}+{}",
            sq_entries, cq_entries, flags, config.read_workers, config.write_workers
        );
        Ok(ring)
    }

    fn start_threads(&self) -> RingResult<()> {
        let spawned = self.spawn_helpers();
        if spawned.is_err() {
            warn!("[ring] helper thread spawn failed");
            self.shutdown();
        }
        spawned
    }

    fn spawn_helpers(&self) -> RingResult<()> {
        let mut threads = self.threads.lock();
        threads.push(timeout::spawn_timer(&self.ctx)?);
        threads.extend(worker::spawn_pools(&self.ctx)?);
        if self.ctx.flags.contains(SetupFlags::SQPOLL) {
            threads.push(sqpoll::spawn(&self.ctx)?);
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn ctx(&self) -> &Arc<Ctx> {
        &self.ctx
    }

    /// The shared ring region
    #[must_use]
    pub fn rings(&self) -> &Rings {
        &self.ctx.rings
    }

    /// Setup flags in effect
    #[must_use]
    pub fn flags(&self) -> SetupFlags {
        self.ctx.flags
    }

    /// Producer view of the submission ring
    ///
    /// Blocks while another thread holds a submission view.
    pub fn submission(&self) -> SubmissionQueue<'_> {
        SubmissionQueue::new(&self.ctx.rings, self.sq_lock.lock())
    }

    /// Consumer view of the completion ring
    ///
    /// Blocks while another thread holds a completion view.
    pub fn completion(&self) -> CompletionQueue<'_> {
        CompletionQueue::new(&self.ctx.rings, self.cq_lock.lock())
    }

    /// Submit entries and optionally wait for completions
    ///
    /// # Arguments
    /// * `to_submit` - Entries to admit from the submission ring
    /// * `min_complete` - With `GETEVENTS`, completions to wait for
    /// * `flags` - Raw [`EnterFlags`] bits
    ///
    /// # Returns
    /// The number of entries admitted if non-zero, otherwise 0.
    ///
    /// # Errors
    /// `InvalidArgument` for unknown flags, `NoDevice` while the context is
    /// closing or being registered, `WouldBlock` when no request could be
    /// allocated, `Interrupted` when a signal arrives before any completion.
    pub fn enter(&self, to_submit: u32, min_complete: u32, flags: u32) -> RingResult<u32> {
        self.enter_with_sigmask(to_submit, min_complete, flags, SigMask::empty())
    }

    /// [`enter`](Self::enter) with signals in `mask` blocked during the wait
    ///
    /// # Errors
    /// As [`enter`](Self::enter).
    pub fn enter_with_sigmask(
        &self,
        to_submit: u32,
        min_complete: u32,
        flags: u32,
        mask: SigMask,
    ) -> RingResult<u32> {
        let flags = EnterFlags::from_bits(flags).ok_or(RingError::InvalidArgument)?;
        if !self.ctx.gate.tryget() {
            return Err(RingError::NoDevice);
        }
        let res = self
            .ctx
            .enter(&self.ctx.env, to_submit, min_complete, flags, mask);
        self.ctx.gate.put();
        res
    }

    /// [`enter`](Self::enter) on behalf of another owner
    ///
    /// Entries admitted by this call lease descriptors from `env`'s table and
    /// run with its credentials; the wait is interrupted by signals raised
    /// on `env`.
    ///
    /// # Errors
    /// As [`enter`](Self::enter).
    pub fn enter_as(
        &self,
        env: &OwnerEnv,
        to_submit: u32,
        min_complete: u32,
        flags: u32,
    ) -> RingResult<u32> {
        let flags = EnterFlags::from_bits(flags).ok_or(RingError::InvalidArgument)?;
        if !self.ctx.gate.tryget() {
            return Err(RingError::NoDevice);
        }
        let res = self
            .ctx
            .enter(env, to_submit, min_complete, flags, SigMask::empty());
        self.ctx.gate.put();
        res
    }

    /// Register or unregister fixed resources, buffers or a notifier
    ///
    /// The context is quiesced for the duration: new entries are refused
    /// and the call waits until every in-flight request has finished.
    ///
    /// # Errors
    /// `NoDevice` if the context is closing or nothing is registered for an
    /// unregister; `Busy` if already registered; validation errors from the
    /// tables.
    pub fn register(&self, reg: Registration) -> RingResult<()> {
        debug!("[ring] register {:?}", reg);
        self.ctx.register(reg)
    }

    /// Readiness of the context itself
    ///
    /// `OUT` while the submission ring has room, `IN` while completions are
    /// ready.
    #[must_use]
    pub fn readiness(&self) -> PollEvents {
        let rings = &self.ctx.rings;
        let mut mask = PollEvents::empty();
        let queued = rings
            .sq_tail()
            .load(Ordering::Acquire)
            .wrapping_sub(self.ctx.cached_sq_head.load(Ordering::Acquire));
        if queued != rings.sq_entries() {
            mask |= PollEvents::OUT | PollEvents::WRNORM;
        }
        if rings.cq_ready() != 0 {
            mask |= PollEvents::IN | PollEvents::RDNORM;
        }
        mask
    }

    /// Cancel offloaded work submitted by `owner`
    ///
    /// Requests not yet started complete with `-ECANCELED`; running ones are
    /// asked to stop.
    pub fn cancel_owner(&self, owner: OwnerId) {
        self.ctx.cancel_async_work(Some(owner));
    }

    /// Future resolving once at least `min` completions are visible
    ///
    /// Only one task can wait on a context at a time; a second future
    /// replaces the first one's waker.
    #[must_use]
    pub fn ready(&self, min: u32) -> CompletionFuture<'_> {
        CompletionFuture::new(&self.ctx, min)
    }

    /// Counter snapshot
    #[must_use]
    pub fn stats(&self) -> EngineStats {
        let mut stats = self.ctx.stats.snapshot();
        if self.ctx.flags.contains(SetupFlags::SQPOLL) {
            stats.sqpoll_state = Some(self.ctx.sqpoll.state());
        }
        stats
    }

    /// Registered resource and buffer counts
    #[must_use]
    pub fn registry_stats(&self) -> RegistryStats {
        self.ctx.registry.read().stats()
    }

    /// Close the context, waiting for outstanding work
    pub fn close(self) {
        // Drop does the work.
    }

    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("[ring] closing");
        self.ctx.quiesce();
        self.ctx.stop_threads();
        for handle in self.threads.lock().drain(..) {
            if handle.join().is_err() {
                warn!("[ring] helper thread panicked");
            }
        }
        info!("[ring] closed");
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl core::fmt::Debug for Context {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Context")
            .field("flags", &self.ctx.flags)
            .field("rings", &self.ctx.rings)
            .field("live", &self.ctx.pool.live())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use ring_abi::SubmissionEntry;

    use super::*;
    use crate::resource::ResourceMap;

    fn env() -> OwnerEnv {
        OwnerEnv::new(Arc::new(ResourceMap::new()))
    }

    fn params(entries: u32, flags: SetupFlags) -> Params {
        let mut p = Params::new(flags);
        p.sq_entries = entries;
        p
    }

    #[test]
    fn test_create_rounds_entries() {
        let mut p = params(3, SetupFlags::empty());
        let ring = Context::create(&mut p, env()).unwrap();
        assert_eq!(p.sq_entries, 4);
        assert_eq!(p.cq_entries, 8);
        assert_eq!(p.features, Features::SINGLE_MMAP.bits());
        assert_eq!(p.sq_off, ring.rings().sq_offsets());
    }

    #[test]
    fn test_create_rejects_bad_params() {
        let mut p = params(0, SetupFlags::empty());
        assert_eq!(Context::create(&mut p, env()).unwrap_err(), RingError::InvalidArgument);

        let mut p = params(MAX_ENTRIES + 1, SetupFlags::empty());
        assert_eq!(Context::create(&mut p, env()).unwrap_err(), RingError::InvalidArgument);

        let mut p = params(4, SetupFlags::empty());
        p.resv[2] = 1;
        assert_eq!(Context::create(&mut p, env()).unwrap_err(), RingError::InvalidArgument);

        let mut p = params(4, SetupFlags::SQ_AFF);
        assert_eq!(Context::create(&mut p, env()).unwrap_err(), RingError::InvalidArgument);

        let mut p = params(4, SetupFlags::SQPOLL | SetupFlags::SQ_AFF).with_sq_thread_cpu(u32::MAX);
        assert_eq!(Context::create(&mut p, env()).unwrap_err(), RingError::InvalidArgument);

        let mut p = params(4, SetupFlags::empty());
        p.flags = 0x80;
        assert_eq!(Context::create(&mut p, env()).unwrap_err(), RingError::InvalidArgument);
    }

    #[test]
    fn test_readiness() {
        let mut p = params(1, SetupFlags::empty());
        let ring = Context::create(&mut p, env()).unwrap();
        assert_eq!(ring.readiness(), PollEvents::OUT | PollEvents::WRNORM);
        ring.submission().push(&SubmissionEntry::nop(1)).unwrap();
        assert!(!ring.readiness().contains(PollEvents::OUT));
        assert_eq!(ring.enter(1, 0, 0), Ok(1));
        assert!(ring.readiness().contains(PollEvents::IN | PollEvents::OUT));
    }

    #[test]
    fn test_enter_rejects_unknown_flags() {
        let mut p = params(2, SetupFlags::empty());
        let ring = Context::create(&mut p, env()).unwrap();
        assert_eq!(ring.enter(0, 0, 0x4), Err(RingError::InvalidArgument));
    }

    #[test]
    fn test_notifier_registration() {
        struct Count(AtomicU32);
        impl CompletionNotify for Count {
            fn notify(&self) {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }

        let mut p = params(2, SetupFlags::empty());
        let ring = Context::create(&mut p, env()).unwrap();
        let count = Arc::new(Count(AtomicU32::new(0)));
        ring.register(Registration::EventNotifier(count.clone())).unwrap();
        assert_eq!(
            ring.register(Registration::EventNotifier(count.clone())),
            Err(RingError::Busy)
        );
        ring.submission().push(&SubmissionEntry::nop(1)).unwrap();
        ring.enter(1, 0, 0).unwrap();
        assert_eq!(count.0.load(Ordering::Relaxed), 1);
        ring.register(Registration::UnregisterEventNotifier).unwrap();
        assert_eq!(
            ring.register(Registration::UnregisterEventNotifier),
            Err(RingError::NoDevice)
        );
    }
}
