// ring_abi/src/flags.rs
//! Flag sets shared between the client and the engine.
//!
//! Bit positions follow the Linux 5.4 ring ABI.

use bitflags::bitflags;

bitflags! {
    /// Per-entry submission flags (`SubmissionEntry::flags`)
    ///
    /// Any bit outside this set makes the entry complete with `-EINVAL`.
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SqeFlags: u8 {
        /// `fd` is an index into the registered resource table
        const FIXED_FILE = 1 << 0;
        /// Start only after every earlier entry has completed
        const IO_DRAIN = 1 << 1;
        /// The next entry depends on this one
        const IO_LINK = 1 << 2;
    }
}

bitflags! {
    /// Context setup flags (`Params::flags`)
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SetupFlags: u32 {
        /// Busy-poll for completions instead of waiting for callbacks
        const IOPOLL = 1 << 0;
        /// Run a dedicated submission thread
        const SQPOLL = 1 << 1;
        /// Pin the submission thread to `sq_thread_cpu`
        const SQ_AFF = 1 << 2;
    }
}

bitflags! {
    /// Flags accepted by the enter call
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EnterFlags: u32 {
        /// Wait for `min_complete` completions before returning
        const GETEVENTS = 1 << 0;
        /// Wake the dedicated submission thread
        const SQ_WAKEUP = 1 << 1;
    }
}

bitflags! {
    /// Runtime flags published in the submission ring header
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SqRingFlags: u32 {
        /// The submission thread is parked; enter with `SQ_WAKEUP`
        const NEED_WAKEUP = 1 << 0;
    }
}

bitflags! {
    /// Capabilities reported back in `Params::features`
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Features: u32 {
        /// Both rings live in a single shared region
        const SINGLE_MMAP = 1 << 0;
    }
}

bitflags! {
    /// Per-operation read/write flags (`op_flags` for rw op codes)
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RwFlags: u32 {
        /// High priority request, poll if possible
        const HIPRI = 0x0000_0001;
        /// Per-write data sync
        const DSYNC = 0x0000_0002;
        /// Per-write full sync
        const SYNC = 0x0000_0004;
        /// Fail instead of waiting; never offload
        const NOWAIT = 0x0000_0008;
        /// Append regardless of offset
        const APPEND = 0x0000_0010;
    }
}

bitflags! {
    /// `op_flags` for [`OpCode::Fsync`](crate::OpCode::Fsync)
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FsyncFlags: u32 {
        /// Only flush data, not metadata
        const DATASYNC = 1 << 0;
    }
}

bitflags! {
    /// Readiness mask for poll registrations (low 16 bits of `op_flags`)
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PollEvents: u16 {
        /// Data to read
        const IN = 0x0001;
        /// Urgent data
        const PRI = 0x0002;
        /// Writable
        const OUT = 0x0004;
        /// Error condition (always reported)
        const ERR = 0x0008;
        /// Hang up (always reported)
        const HUP = 0x0010;
        /// Invalid request
        const NVAL = 0x0020;
        /// Normal data readable
        const RDNORM = 0x0040;
        /// Normal data writable
        const WRNORM = 0x0100;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_sqe_bits_rejected() {
        assert!(SqeFlags::from_bits(0x07).is_some());
        assert!(SqeFlags::from_bits(0x08).is_none());
        assert!(SqeFlags::from_bits(0x80 | 0x01).is_none());
    }

    #[test]
    fn test_setup_flags_values() {
        assert_eq!(SetupFlags::IOPOLL.bits(), 1);
        assert_eq!(SetupFlags::SQPOLL.bits(), 2);
        assert_eq!(SetupFlags::SQ_AFF.bits(), 4);
        assert_eq!(EnterFlags::all().bits(), 3);
    }
}
