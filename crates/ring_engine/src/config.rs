// ring_engine/src/config.rs
//! Engine tuning knobs
//!
//! [`Params`](ring_abi::Params) carries what the client negotiates with the
//! engine; `EngineConfig` carries what the embedding application tunes.
//! Every field has a default derived from the ring depth, so
//! `EngineConfig::default()` is what [`Context::create`](crate::Context::create)
//! uses.

use std::thread;

/// Requests reserved per bulk allocation
pub const SUBMIT_BATCH: u32 = 8;

/// Batches at or below this size allocate one request at a time
pub const PLUG_THRESHOLD: u32 = 2;

/// Parallelism of the write-class offload pool
pub const WRITE_WORKERS: usize = 2;

/// Engine configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Read-class workers; 0 selects `min(sq_entries - 1, 2 * cpus)`
    pub read_workers: usize,

    /// Write-class workers
    pub write_workers: usize,

    /// Slots in each offload queue; 0 selects `cq_entries`
    pub offload_depth: usize,

    /// Maximum live requests; 0 selects `4 * cq_entries`
    pub request_limit: u32,

    /// Requests reserved per bulk allocation
    pub submit_batch: u32,

    /// Batches larger than this use bulk allocation
    pub plug_threshold: u32,

    /// Idle-spin iterations of the submission thread between clock checks
    pub sqpoll_spin_batch: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            read_workers: 0,
            write_workers: WRITE_WORKERS,
            offload_depth: 0,
            request_limit: 0,
            submit_batch: SUBMIT_BATCH,
            plug_threshold: PLUG_THRESHOLD,
            sqpoll_spin_batch: 64,
        }
    }
}

impl EngineConfig {
    /// Set the number of read-class workers
    #[must_use]
    pub const fn with_read_workers(mut self, n: usize) -> Self {
        self.read_workers = n;
        self
    }

    /// Set the number of write-class workers
    #[must_use]
    pub const fn with_write_workers(mut self, n: usize) -> Self {
        self.write_workers = n;
        self
    }

    /// Set the depth of each offload queue
    #[must_use]
    pub const fn with_offload_depth(mut self, depth: usize) -> Self {
        self.offload_depth = depth;
        self
    }

    /// Cap the number of live requests
    #[must_use]
    pub const fn with_request_limit(mut self, limit: u32) -> Self {
        self.request_limit = limit;
        self
    }

    /// Set the bulk allocation size
    #[must_use]
    pub const fn with_submit_batch(mut self, batch: u32) -> Self {
        self.submit_batch = batch;
        self
    }

    /// Resolve zero fields against the negotiated ring depths
    ///
    /// # Arguments
    /// * `sq_entries` - Submission ring depth
    /// * `cq_entries` - Completion ring depth
    pub(crate) fn resolve(mut self, sq_entries: u32, cq_entries: u32) -> Self {
        if self.read_workers == 0 {
            let cpus = thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
            let depth = sq_entries.saturating_sub(1) as usize;
            self.read_workers = depth.min(2 * cpus).max(1);
        }
        self.write_workers = self.write_workers.max(1);
        if self.offload_depth == 0 {
            self.offload_depth = cq_entries as usize;
        }
        if self.request_limit == 0 {
            self.request_limit = cq_entries.saturating_mul(4);
        }
        self.submit_batch = self.submit_batch.max(1);
        self.sqpoll_spin_batch = self.sqpoll_spin_batch.max(1);
        self
    }
}
