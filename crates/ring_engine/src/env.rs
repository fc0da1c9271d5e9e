// ring_engine/src/env.rs
//! Owner environment
//!
//! Work that leaves the submitting thread (offload workers, the submission
//! thread) runs on behalf of an owner. The owner's environment is borrowed
//! for the duration of each operation:
//!
//! - **Address space**: needed by any operation that touches caller memory.
//!   It can disappear (the owner exited); attaching then fails and the
//!   request completes with `-EFAULT`.
//! - **Credentials** and **working namespace**: visible to backends through
//!   [`current`] while attached.
//! - **Resource table**: where non-fixed descriptors are leased from.
//! - **Signals**: interrupt blocking waits in `enter`.

use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use ring_abi::{RingError, RingResult};

use crate::doorbell::Doorbell;
use crate::resource::ResourceTable;

/// Identity of a submitting owner
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OwnerId(u64);

impl OwnerId {
    /// Allocate a fresh owner id
    #[must_use]
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw id value
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

/// Owner credentials
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Credentials {
    /// User id
    pub uid: u32,
    /// Group id
    pub gid: u32,
}

/// An owner's address space
///
/// Tracks how many engine threads currently have it attached and whether
/// the owner is still alive.
#[derive(Debug)]
pub struct AddressSpace {
    alive: AtomicBool,
    users: AtomicUsize,
}

impl AddressSpace {
    /// Create a live address space
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            alive: AtomicBool::new(true),
            users: AtomicUsize::new(0),
        })
    }

    /// Tear the address space down; later attaches fail
    pub fn exit(&self) {
        self.alive.store(false, Ordering::Release);
    }

    /// Whether the owner is still alive
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Engine threads currently attached
    #[must_use]
    pub fn attached(&self) -> usize {
        self.users.load(Ordering::Acquire)
    }

    /// Take a user reference if the space is still alive
    pub(crate) fn try_attach(self: &Arc<Self>) -> Option<MmGuard> {
        self.users.fetch_add(1, Ordering::AcqRel);
        if !self.is_alive() {
            self.users.fetch_sub(1, Ordering::Release);
            return None;
        }
        Some(MmGuard {
            mm: Arc::clone(self),
        })
    }
}

/// A live attachment to an [`AddressSpace`]
#[derive(Debug)]
pub(crate) struct MmGuard {
    mm: Arc<AddressSpace>,
}

impl Drop for MmGuard {
    fn drop(&mut self) {
        self.mm.users.fetch_sub(1, Ordering::Release);
    }
}

/// Working namespace (current directory)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsContext {
    cwd: PathBuf,
}

impl FsContext {
    /// Create a namespace rooted at `cwd`
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self { cwd: cwd.into() }
    }

    /// Current directory
    #[must_use]
    pub fn cwd(&self) -> &Path {
        &self.cwd
    }
}

impl Default for FsContext {
    fn default() -> Self {
        Self::new("/")
    }
}

/// Set of blocked signal numbers (1..=64)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SigMask(u64);

impl SigMask {
    /// Block nothing
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Also block `signo`
    #[must_use]
    pub const fn with(self, signo: u32) -> Self {
        match sig_bit(signo) {
            Some(bit) => Self(self.0 | bit),
            None => self,
        }
    }

    /// Whether `signo` is blocked
    #[must_use]
    pub const fn contains(self, signo: u32) -> bool {
        match sig_bit(signo) {
            Some(bit) => self.0 & bit != 0,
            None => false,
        }
    }
}

const fn sig_bit(signo: u32) -> Option<u64> {
    if signo == 0 || signo > 64 {
        None
    } else {
        Some(1 << (signo - 1))
    }
}

/// Pending signals of an owner
#[derive(Debug, Default)]
pub(crate) struct Signals {
    pending: AtomicU64,
    waiters: spin::Mutex<Vec<Arc<Doorbell>>>,
}

impl Signals {
    /// First pending signal not in `mask`, consumed
    pub(crate) fn take_unblocked(&self, mask: SigMask) -> Option<u32> {
        let mut pending = self.pending.load(Ordering::Acquire);
        loop {
            let deliverable = pending & !mask.0;
            if deliverable == 0 {
                return None;
            }
            let bit = deliverable & deliverable.wrapping_neg();
            match self.pending.compare_exchange_weak(
                pending,
                pending & !bit,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(bit.trailing_zeros() + 1),
                Err(now) => pending = now,
            }
        }
    }

    /// Whether an unblocked signal is pending
    pub(crate) fn has_unblocked(&self, mask: SigMask) -> bool {
        self.pending.load(Ordering::Acquire) & !mask.0 != 0
    }

    pub(crate) fn subscribe(&self, bell: &Arc<Doorbell>) {
        self.waiters.lock().push(Arc::clone(bell));
    }

    pub(crate) fn unsubscribe(&self, bell: &Arc<Doorbell>) {
        self.waiters.lock().retain(|b| !Arc::ptr_eq(b, bell));
    }
}

/// The environment requests borrow while they execute
#[derive(Clone)]
pub struct OwnerEnv {
    owner: OwnerId,
    creds: Credentials,
    mm: Arc<AddressSpace>,
    fs: Arc<FsContext>,
    files: Arc<dyn ResourceTable>,
    signals: Arc<Signals>,
}

impl OwnerEnv {
    /// Create an environment for a fresh owner
    ///
    /// # Arguments
    /// * `files` - Table non-fixed descriptors are leased from
    pub fn new(files: Arc<dyn ResourceTable>) -> Self {
        Self {
            owner: OwnerId::next(),
            creds: Credentials::default(),
            mm: AddressSpace::new(),
            fs: Arc::new(FsContext::default()),
            files,
            signals: Arc::new(Signals::default()),
        }
    }

    /// Replace the credentials
    #[must_use]
    pub const fn with_credentials(mut self, creds: Credentials) -> Self {
        self.creds = creds;
        self
    }

    /// Replace the working namespace
    #[must_use]
    pub fn with_fs(mut self, fs: FsContext) -> Self {
        self.fs = Arc::new(fs);
        self
    }

    /// Owner identity
    #[must_use]
    pub const fn owner(&self) -> OwnerId {
        self.owner
    }

    /// Credentials
    #[must_use]
    pub const fn credentials(&self) -> Credentials {
        self.creds
    }

    /// Address space
    #[must_use]
    pub fn address_space(&self) -> &Arc<AddressSpace> {
        &self.mm
    }

    /// Working namespace
    #[must_use]
    pub fn fs(&self) -> &FsContext {
        &self.fs
    }

    /// Resource table
    #[must_use]
    pub fn files(&self) -> &Arc<dyn ResourceTable> {
        &self.files
    }

    /// Deliver a signal to the owner
    ///
    /// Blocked `enter` waits of this owner return `EINTR` unless the signal
    /// is masked.
    pub fn raise(&self, signo: u32) {
        let Some(bit) = sig_bit(signo) else {
            return;
        };
        self.signals.pending.fetch_or(bit, Ordering::AcqRel);
        for bell in self.signals.waiters.lock().iter() {
            bell.ring();
        }
    }

    pub(crate) fn signals(&self) -> &Signals {
        &self.signals
    }

    /// Make this environment current on the calling thread
    ///
    /// # Arguments
    /// * `need_mm` - Also attach the address space
    ///
    /// # Errors
    /// `BadAddress` if the address space is required and gone.
    pub(crate) fn attach(&self, need_mm: bool) -> RingResult<EnvAttachment> {
        let mm = if need_mm {
            Some(self.mm.try_attach().ok_or(RingError::BadAddress)?)
        } else {
            None
        };
        let attached = AttachedEnv {
            owner: self.owner,
            creds: self.creds,
            fs: Arc::clone(&self.fs),
            has_mm: mm.is_some(),
        };
        let prev = CURRENT.with(|cur| cur.borrow_mut().replace(attached));
        Ok(EnvAttachment { prev, _mm: mm })
    }
}

impl core::fmt::Debug for OwnerEnv {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("OwnerEnv")
            .field("owner", &self.owner)
            .field("creds", &self.creds)
            .field("fs", &self.fs)
            .field("mm_alive", &self.mm.is_alive())
            .finish_non_exhaustive()
    }
}

/// Snapshot of the environment attached to the current thread
#[derive(Debug, Clone)]
pub struct AttachedEnv {
    /// Owner the thread is working for
    pub owner: OwnerId,
    /// Borrowed credentials
    pub creds: Credentials,
    /// Borrowed working namespace
    pub fs: Arc<FsContext>,
    /// Whether the owner's address space is attached
    pub has_mm: bool,
}

thread_local! {
    static CURRENT: RefCell<Option<AttachedEnv>> = const { RefCell::new(None) };
}

/// Environment attached to the calling thread, if any
///
/// Backends call this from [`Resource::submit`](crate::Resource::submit) to
/// find out whom they are working for.
#[must_use]
pub fn current() -> Option<AttachedEnv> {
    CURRENT.with(|cur| cur.borrow().clone())
}

/// Restores the previous environment on drop
#[derive(Debug)]
pub(crate) struct EnvAttachment {
    prev: Option<AttachedEnv>,
    _mm: Option<MmGuard>,
}

impl Drop for EnvAttachment {
    fn drop(&mut self) {
        let prev = self.prev.take();
        CURRENT.with(|cur| *cur.borrow_mut() = prev);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::Resource;

    struct NoFiles;

    impl ResourceTable for NoFiles {
        fn lease(&self, _fd: i32) -> Option<Arc<dyn Resource>> {
            None
        }
    }

    #[test]
    fn test_attach_sets_current() {
        let env = OwnerEnv::new(Arc::new(NoFiles))
            .with_credentials(Credentials { uid: 7, gid: 8 })
            .with_fs(FsContext::new("/srv"));
        assert!(current().is_none());
        {
            let _att = env.attach(true).unwrap();
            let cur = current().unwrap();
            assert_eq!(cur.owner, env.owner());
            assert_eq!(cur.creds.uid, 7);
            assert_eq!(cur.fs.cwd(), Path::new("/srv"));
            assert!(cur.has_mm);
            assert_eq!(env.address_space().attached(), 1);
        }
        assert!(current().is_none());
        assert_eq!(env.address_space().attached(), 0);
    }

    #[test]
    fn test_attach_after_exit_faults() {
        let env = OwnerEnv::new(Arc::new(NoFiles));
        env.address_space().exit();
        assert_eq!(env.attach(true).unwrap_err(), RingError::BadAddress);
        assert!(env.attach(false).is_ok());
    }

    #[test]
    fn test_signal_masking() {
        let env = OwnerEnv::new(Arc::new(NoFiles));
        env.raise(10);
        let mask = SigMask::empty().with(10);
        assert!(!env.signals().has_unblocked(mask));
        assert_eq!(env.signals().take_unblocked(mask), None);
        assert_eq!(env.signals().take_unblocked(SigMask::empty()), Some(10));
        assert_eq!(env.signals().take_unblocked(SigMask::empty()), None);
    }

    #[test]
    fn test_sigmask_bounds() {
        assert!(!SigMask::empty().with(0).contains(0));
        assert!(SigMask::empty().with(64).contains(64));
        assert!(!SigMask::empty().with(65).contains(65));
    }
}
