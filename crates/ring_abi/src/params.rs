// ring_abi/src/params.rs
//! Context setup parameters and published ring offsets

use crate::flags::{Features, SetupFlags};

/// Largest accepted submission ring depth
pub const MAX_ENTRIES: u32 = 32768;

/// Largest number of registered resources
pub const MAX_FIXED_FILES: u32 = 1024;

/// Largest number of registered buffers
pub const MAX_FIXED_BUFFERS: u32 = 1024;

/// Largest single registered buffer (1 GiB)
pub const MAX_FIXED_BUFFER_LEN: u64 = 1 << 30;

/// Default idle period of the submission thread, in milliseconds
pub const DEFAULT_SQ_THREAD_IDLE_MS: u32 = 1000;

/// Byte offsets of the submission ring fields inside the shared region
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SqRingOffsets {
    /// Consumer index (engine-written)
    pub head: u32,
    /// Producer index (client-written)
    pub tail: u32,
    /// Index mask
    pub ring_mask: u32,
    /// Number of slots
    pub ring_entries: u32,
    /// Runtime flags (see [`SqRingFlags`](crate::SqRingFlags))
    pub flags: u32,
    /// Count of entries dropped for an out-of-range index
    pub dropped: u32,
    /// Indirection array of entry indices
    pub array: u32,
    /// Reserved
    pub resv1: u32,
    /// Reserved
    pub resv2: u64,
}

/// Byte offsets of the completion ring fields inside the shared region
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CqRingOffsets {
    /// Consumer index (client-written)
    pub head: u32,
    /// Producer index (engine-written)
    pub tail: u32,
    /// Index mask
    pub ring_mask: u32,
    /// Number of slots
    pub ring_entries: u32,
    /// Count of completions dropped because the ring was full
    pub overflow: u32,
    /// Completion entry array
    pub cqes: u32,
    /// Reserved
    pub resv: [u64; 2],
}

/// Parameters for context creation
///
/// The caller fills `flags`, `sq_thread_cpu` and `sq_thread_idle`; the
/// engine fills in the remaining fields.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Params {
    /// Submission ring depth (output, power of two)
    pub sq_entries: u32,
    /// Completion ring depth (output, `2 * sq_entries`)
    pub cq_entries: u32,
    /// Setup flags (see [`SetupFlags`])
    pub flags: u32,
    /// CPU for the submission thread with `SQ_AFF`
    pub sq_thread_cpu: u32,
    /// Submission thread idle period in milliseconds; 0 selects the default
    pub sq_thread_idle: u32,
    /// Supported features (output)
    pub features: u32,
    /// Reserved, must be zero
    pub resv: [u32; 4],
    /// Submission ring offsets (output)
    pub sq_off: SqRingOffsets,
    /// Completion ring offsets (output)
    pub cq_off: CqRingOffsets,
}

impl Params {
    /// Create parameters with the given setup flags
    #[must_use]
    pub const fn new(flags: SetupFlags) -> Self {
        Self {
            sq_entries: 0,
            cq_entries: 0,
            flags: flags.bits(),
            sq_thread_cpu: 0,
            sq_thread_idle: 0,
            features: 0,
            resv: [0; 4],
            sq_off: SqRingOffsets {
                head: 0,
                tail: 0,
                ring_mask: 0,
                ring_entries: 0,
                flags: 0,
                dropped: 0,
                array: 0,
                resv1: 0,
                resv2: 0,
            },
            cq_off: CqRingOffsets {
                head: 0,
                tail: 0,
                ring_mask: 0,
                ring_entries: 0,
                overflow: 0,
                cqes: 0,
                resv: [0; 2],
            },
        }
    }

    /// Decode the setup flags; `None` if unknown bits are set
    #[must_use]
    pub const fn setup_flags(&self) -> Option<SetupFlags> {
        SetupFlags::from_bits(self.flags)
    }

    /// Decode the reported features
    #[must_use]
    pub const fn features(&self) -> Features {
        Features::from_bits_truncate(self.features)
    }

    /// Request a submission ring depth (rounded up at setup)
    #[must_use]
    pub const fn with_sq_entries(mut self, entries: u32) -> Self {
        self.sq_entries = entries;
        self
    }

    /// Set the submission thread idle period
    #[must_use]
    pub const fn with_sq_thread_idle(mut self, millis: u32) -> Self {
        self.sq_thread_idle = millis;
        self
    }

    /// Pin the submission thread to a CPU (requires `SQ_AFF`)
    #[must_use]
    pub const fn with_sq_thread_cpu(mut self, cpu: u32) -> Self {
        self.sq_thread_cpu = cpu;
        self
    }
}
