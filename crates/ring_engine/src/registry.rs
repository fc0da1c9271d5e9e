// ring_engine/src/registry.rs
//! Registered resources and buffers
//!
//! Registration validates descriptors and buffer regions once, so later
//! entries can name them by index:
//!
//! ```text
//! 1. Client registers fds / buffer regions (context quiesced)
//! 2. Engine leases every fd and checks every region
//! 3. Entries with FIXED_FILE name files by index;
//!    READ_FIXED / WRITE_FIXED name buffers by buf_index
//! 4. Unregister drops the leases
//! ```

use std::sync::Arc;

use log::debug;
use ring_abi::{MAX_FIXED_BUFFERS, MAX_FIXED_BUFFER_LEN, MAX_FIXED_FILES, RingError, RingResult};

use crate::env::OwnerEnv;
use crate::resource::{FixedBuffer, Resource};

/// A caller memory region to register
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferRegion {
    /// Start address (non-null)
    pub addr: u64,
    /// Length in bytes (1 ..= 1 GiB)
    pub len: u64,
}

impl BufferRegion {
    /// Describe a region
    #[must_use]
    pub const fn new(addr: u64, len: u64) -> Self {
        Self { addr, len }
    }

    fn validate(&self) -> RingResult<()> {
        if self.addr == 0 || self.len == 0 || self.len > MAX_FIXED_BUFFER_LEN {
            return Err(RingError::BadAddress);
        }
        self.addr
            .checked_add(self.len)
            .map(|_| ())
            .ok_or(RingError::BadAddress)
    }
}

/// Receives a signal every time completions are posted
pub trait CompletionNotify: Send + Sync {
    /// Completions were posted
    fn notify(&self);
}

/// Operations accepted by [`Context::register`](crate::Context::register)
#[derive(Clone)]
pub enum Registration {
    /// Register caller buffer regions for fixed operations
    Buffers(Vec<BufferRegion>),
    /// Drop the registered buffers
    UnregisterBuffers,
    /// Register resource descriptors for `FIXED_FILE` entries
    Files(Vec<i32>),
    /// Drop the registered resources
    UnregisterFiles,
    /// Install a completion notifier
    EventNotifier(Arc<dyn CompletionNotify>),
    /// Remove the completion notifier
    UnregisterEventNotifier,
}

impl core::fmt::Debug for Registration {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Buffers(b) => f.debug_tuple("Buffers").field(&b.len()).finish(),
            Self::UnregisterBuffers => f.write_str("UnregisterBuffers"),
            Self::Files(fds) => f.debug_tuple("Files").field(fds).finish(),
            Self::UnregisterFiles => f.write_str("UnregisterFiles"),
            Self::EventNotifier(_) => f.write_str("EventNotifier"),
            Self::UnregisterEventNotifier => f.write_str("UnregisterEventNotifier"),
        }
    }
}

/// Registry statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Registered resources
    pub files: usize,
    /// Registered buffers
    pub buffers: usize,
    /// Total registered buffer bytes
    pub buffer_bytes: u64,
}

/// Fixed resource and buffer tables of one context
#[derive(Default)]
pub(crate) struct FixedTables {
    files: Option<Vec<Arc<dyn Resource>>>,
    buffers: Option<Vec<BufferRegion>>,
}

impl FixedTables {
    /// Lease every descriptor into the fixed table
    ///
    /// # Errors
    /// `Busy` if already registered, `InvalidArgument` if empty,
    /// `TooManyOpen` beyond the limit, `BadDescriptor` if a lease fails.
    pub(crate) fn register_files(&mut self, env: &OwnerEnv, fds: &[i32]) -> RingResult<()> {
        if self.files.is_some() {
            return Err(RingError::Busy);
        }
        if fds.is_empty() {
            return Err(RingError::InvalidArgument);
        }
        if fds.len() > MAX_FIXED_FILES as usize {
            return Err(RingError::TooManyOpen);
        }
        let files = fds
            .iter()
            .map(|&fd| env.files().lease(fd).ok_or(RingError::BadDescriptor))
            .collect::<RingResult<Vec<_>>>()?;
        debug!("[ring] registered {} files", files.len());
        self.files = Some(files);
        Ok(())
    }

    /// # Errors
    /// `NoDevice` if nothing is registered.
    pub(crate) fn unregister_files(&mut self) -> RingResult<()> {
        self.files.take().map(drop).ok_or(RingError::NoDevice)
    }

    /// Resource at a fixed index
    pub(crate) fn file(&self, index: i32) -> Option<Arc<dyn Resource>> {
        let index = usize::try_from(index).ok()?;
        self.files.as_ref()?.get(index).cloned()
    }

    /// # Errors
    /// `Busy` if already registered, `InvalidArgument` if empty or beyond
    /// the limit, `BadAddress` for a bad region.
    pub(crate) fn register_buffers(&mut self, regions: &[BufferRegion]) -> RingResult<()> {
        if self.buffers.is_some() {
            return Err(RingError::Busy);
        }
        if regions.is_empty() || regions.len() > MAX_FIXED_BUFFERS as usize {
            return Err(RingError::InvalidArgument);
        }
        regions.iter().try_for_each(BufferRegion::validate)?;
        debug!("[ring] registered {} buffers", regions.len());
        self.buffers = Some(regions.to_vec());
        Ok(())
    }

    /// # Errors
    /// `NoDevice` if nothing is registered.
    pub(crate) fn unregister_buffers(&mut self) -> RingResult<()> {
        self.buffers.take().map(drop).ok_or(RingError::NoDevice)
    }

    /// Resolve a fixed operation's slice inside a registered region
    ///
    /// # Errors
    /// `BadAddress` if no table exists, the index is out of range, the
    /// slice overflows, or the slice leaves the region.
    pub(crate) fn import_fixed(&self, index: u16, addr: u64, len: u32) -> RingResult<FixedBuffer> {
        let region = self
            .buffers
            .as_ref()
            .and_then(|b| b.get(usize::from(index)))
            .ok_or(RingError::BadAddress)?;
        let end = addr.checked_add(u64::from(len)).ok_or(RingError::BadAddress)?;
        if addr < region.addr || end > region.addr + region.len {
            return Err(RingError::BadAddress);
        }
        Ok(FixedBuffer { index, addr, len })
    }

    pub(crate) fn stats(&self) -> RegistryStats {
        let buffers = self.buffers.as_deref().unwrap_or_default();
        RegistryStats {
            files: self.files.as_ref().map_or(0, Vec::len),
            buffers: buffers.len(),
            buffer_bytes: buffers.iter().map(|b| b.len).sum(),
        }
    }
}
