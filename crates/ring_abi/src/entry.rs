// ring_abi/src/entry.rs
//! Submission and completion entry layouts
//!
//! # Memory Layout
//!
//! ```text
//! SubmissionEntry (64 bytes, repr(C), align(64)):
//! +0   opcode (1)
//! +1   flags (1)
//! +2   ioprio (2)
//! +4   fd (4)
//! +8   off (8)            <- timeout: completion count
//! +16  addr (8)           <- timeout: relative deadline in nanoseconds
//! +24  len (4)
//! +28  op_flags (4)       <- rw / fsync / poll / msg / timeout flags
//! +32  user_data (8)
//! +40  buf_index (2)
//! +42  _pad (6)
//! +48  _reserved (16)
//! = 64 bytes
//!
//! CompletionEntry (16 bytes, repr(C)):
//! +0   user_data (8)
//! +8   res (4)
//! +12  flags (4)
//! = 16 bytes
//! ```

use crate::error::{RingError, RingResult};
use crate::flags::{FsyncFlags, PollEvents, RwFlags, SqeFlags};
use crate::opcode::OpCode;

/// Submission Queue Entry
///
/// Written by the client into the entry array; the engine copies it out
/// exactly once at admission and never reads the slot again.
#[repr(C, align(64))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmissionEntry {
    /// Operation code (see [`OpCode`])
    pub opcode: u8,

    /// Submission flags (see [`SqeFlags`])
    pub flags: u8,

    /// I/O priority
    pub ioprio: u16,

    /// Resource descriptor, or fixed table index with `FIXED_FILE`
    pub fd: i32,

    /// Offset in the resource; completion count for timeouts
    pub off: u64,

    /// Buffer, iovec or message address; deadline for timeouts;
    /// target tag for poll removal
    pub addr: u64,

    /// Buffer length or iovec count
    pub len: u32,

    /// Operation-specific flags
    pub op_flags: u32,

    /// Correlation tag, copied verbatim into the completion
    pub user_data: u64,

    /// Registered buffer index for fixed operations
    pub buf_index: u16,

    _pad: [u16; 3],

    _reserved: [u64; 2],
}

// Compile-time size check
const _: () = assert!(
    core::mem::size_of::<SubmissionEntry>() == 64,
    "SubmissionEntry must be 64 bytes"
);

impl SubmissionEntry {
    /// Create a zeroed entry
    #[must_use]
    pub const fn new() -> Self {
        Self {
            opcode: 0,
            flags: 0,
            ioprio: 0,
            fd: -1,
            off: 0,
            addr: 0,
            len: 0,
            op_flags: 0,
            user_data: 0,
            buf_index: 0,
            _pad: [0; 3],
            _reserved: [0; 2],
        }
    }

    /// Create a NOP entry
    #[must_use]
    pub const fn nop(user_data: u64) -> Self {
        Self {
            opcode: OpCode::Nop as u8,
            user_data,
            ..Self::new()
        }
    }

    /// Create a vectored read entry
    #[must_use]
    pub const fn readv(fd: i32, iovecs: u64, nr_vecs: u32, off: u64, user_data: u64) -> Self {
        Self {
            opcode: OpCode::Readv as u8,
            fd,
            addr: iovecs,
            len: nr_vecs,
            off,
            user_data,
            ..Self::new()
        }
    }

    /// Create a vectored write entry
    #[must_use]
    pub const fn writev(fd: i32, iovecs: u64, nr_vecs: u32, off: u64, user_data: u64) -> Self {
        Self {
            opcode: OpCode::Writev as u8,
            fd,
            addr: iovecs,
            len: nr_vecs,
            off,
            user_data,
            ..Self::new()
        }
    }

    /// Create a read into a registered buffer
    #[must_use]
    pub const fn read_fixed(
        fd: i32,
        buf: u64,
        len: u32,
        off: u64,
        buf_index: u16,
        user_data: u64,
    ) -> Self {
        Self {
            opcode: OpCode::ReadFixed as u8,
            fd,
            addr: buf,
            len,
            off,
            buf_index,
            user_data,
            ..Self::new()
        }
    }

    /// Create a write from a registered buffer
    #[must_use]
    pub const fn write_fixed(
        fd: i32,
        buf: u64,
        len: u32,
        off: u64,
        buf_index: u16,
        user_data: u64,
    ) -> Self {
        Self {
            opcode: OpCode::WriteFixed as u8,
            fd,
            addr: buf,
            len,
            off,
            buf_index,
            user_data,
            ..Self::new()
        }
    }

    /// Create an fsync entry
    #[must_use]
    pub const fn fsync(fd: i32, flags: FsyncFlags, user_data: u64) -> Self {
        Self {
            opcode: OpCode::Fsync as u8,
            fd,
            op_flags: flags.bits(),
            user_data,
            ..Self::new()
        }
    }

    /// Create a range sync entry
    #[must_use]
    pub const fn sync_file_range(fd: i32, off: u64, len: u32, flags: u32, user_data: u64) -> Self {
        Self {
            opcode: OpCode::SyncFileRange as u8,
            fd,
            off,
            len,
            op_flags: flags,
            user_data,
            ..Self::new()
        }
    }

    /// Create a message send entry
    #[must_use]
    pub const fn sendmsg(fd: i32, msg: u64, msg_flags: u32, user_data: u64) -> Self {
        Self {
            opcode: OpCode::SendMsg as u8,
            fd,
            addr: msg,
            len: 1,
            op_flags: msg_flags,
            user_data,
            ..Self::new()
        }
    }

    /// Create a message receive entry
    #[must_use]
    pub const fn recvmsg(fd: i32, msg: u64, msg_flags: u32, user_data: u64) -> Self {
        Self {
            opcode: OpCode::RecvMsg as u8,
            fd,
            addr: msg,
            len: 1,
            op_flags: msg_flags,
            user_data,
            ..Self::new()
        }
    }

    /// Create a readiness registration
    #[must_use]
    pub const fn poll_add(fd: i32, events: PollEvents, user_data: u64) -> Self {
        Self {
            opcode: OpCode::PollAdd as u8,
            fd,
            op_flags: events.bits() as u32,
            user_data,
            ..Self::new()
        }
    }

    /// Create a readiness registration removal for `target`
    #[must_use]
    pub const fn poll_remove(target: u64, user_data: u64) -> Self {
        Self {
            opcode: OpCode::PollRemove as u8,
            addr: target,
            user_data,
            ..Self::new()
        }
    }

    /// Create a timeout entry
    ///
    /// Fires after `nanos` nanoseconds, or completes with 0 once `count`
    /// completions have been posted. A `count` of 0 makes it a pure deadline.
    #[must_use]
    pub const fn timeout(nanos: u64, count: u64, user_data: u64) -> Self {
        Self {
            opcode: OpCode::Timeout as u8,
            addr: nanos,
            off: count,
            len: 1,
            user_data,
            ..Self::new()
        }
    }

    /// Replace the submission flags
    #[must_use]
    pub const fn with_flags(mut self, flags: SqeFlags) -> Self {
        self.flags = flags.bits();
        self
    }

    /// Replace the read/write flags
    #[must_use]
    pub const fn with_rw_flags(mut self, flags: RwFlags) -> Self {
        self.op_flags = flags.bits();
        self
    }

    /// Set the I/O priority
    #[must_use]
    pub const fn with_ioprio(mut self, ioprio: u16) -> Self {
        self.ioprio = ioprio;
        self
    }

    /// Decode the operation code
    #[must_use]
    pub const fn op(&self) -> Option<OpCode> {
        OpCode::from_u8(self.opcode)
    }

    /// Decode the submission flags; `None` if unknown bits are set
    #[must_use]
    pub const fn sqe_flags(&self) -> Option<SqeFlags> {
        SqeFlags::from_bits(self.flags)
    }

    /// Submission flags with unknown bits dropped
    #[must_use]
    pub const fn sqe_flags_truncate(&self) -> SqeFlags {
        SqeFlags::from_bits_truncate(self.flags)
    }

    /// Readiness mask of a poll registration
    #[must_use]
    pub const fn poll_events(&self) -> PollEvents {
        PollEvents::from_bits_truncate(self.op_flags as u16)
    }

    /// Read/write flags
    #[must_use]
    pub const fn rw_flags(&self) -> RwFlags {
        RwFlags::from_bits_retain(self.op_flags)
    }
}

impl Default for SubmissionEntry {
    fn default() -> Self {
        Self::new()
    }
}

/// Completion Queue Entry
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CompletionEntry {
    /// Correlation tag from the submission
    pub user_data: u64,

    /// Result: non-negative on success, `-errno` on failure
    pub res: i32,

    /// Completion flags (currently always 0)
    pub flags: u32,
}

const _: () = assert!(
    core::mem::size_of::<CompletionEntry>() == 16,
    "CompletionEntry must be 16 bytes"
);

impl CompletionEntry {
    /// Create a completion entry
    #[must_use]
    pub const fn new(user_data: u64, res: i32) -> Self {
        Self {
            user_data,
            res,
            flags: 0,
        }
    }

    /// Check if the operation succeeded
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        self.res >= 0
    }

    /// Decode the error, if any
    ///
    /// Unknown negative values map to [`RingError::IoError`].
    #[must_use]
    pub const fn error(&self) -> Option<RingError> {
        if self.res >= 0 {
            return None;
        }
        match RingError::from_result(self.res) {
            Some(e) => Some(e),
            None => Some(RingError::IoError),
        }
    }

    /// Convert into a Result
    ///
    /// # Errors
    ///
    /// Returns the decoded error when `res` is negative.
    pub const fn into_result(self) -> RingResult<u32> {
        match self.error() {
            Some(e) => Err(e),
            None => Ok(self.res.unsigned_abs()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqe_layout_offsets() {
        assert_eq!(core::mem::offset_of!(SubmissionEntry, fd), 4);
        assert_eq!(core::mem::offset_of!(SubmissionEntry, off), 8);
        assert_eq!(core::mem::offset_of!(SubmissionEntry, addr), 16);
        assert_eq!(core::mem::offset_of!(SubmissionEntry, len), 24);
        assert_eq!(core::mem::offset_of!(SubmissionEntry, op_flags), 28);
        assert_eq!(core::mem::offset_of!(SubmissionEntry, user_data), 32);
        assert_eq!(core::mem::offset_of!(SubmissionEntry, buf_index), 40);
        assert_eq!(core::mem::align_of::<SubmissionEntry>(), 64);
    }

    #[test]
    fn test_sqe_creation() {
        let sqe = SubmissionEntry::read_fixed(3, 0x1000, 512, 4096, 2, 42)
            .with_flags(SqeFlags::IO_LINK | SqeFlags::FIXED_FILE);

        assert_eq!(sqe.op(), Some(OpCode::ReadFixed));
        assert_eq!(sqe.fd, 3);
        assert_eq!(sqe.buf_index, 2);
        assert_eq!(sqe.len, 512);
        assert_eq!(sqe.user_data, 42);
        assert_eq!(
            sqe.sqe_flags(),
            Some(SqeFlags::IO_LINK | SqeFlags::FIXED_FILE)
        );
    }

    #[test]
    fn test_timeout_encoding() {
        let sqe = SubmissionEntry::timeout(1_000_000, 3, 7);
        assert_eq!(sqe.op(), Some(OpCode::Timeout));
        assert_eq!(sqe.addr, 1_000_000);
        assert_eq!(sqe.off, 3);
        assert_eq!(sqe.len, 1);
    }

    #[test]
    fn test_cqe_success() {
        let cqe = CompletionEntry::new(42, 1024);
        assert!(cqe.is_ok());
        assert_eq!(cqe.error(), None);
        assert_eq!(cqe.into_result(), Ok(1024));
    }

    #[test]
    fn test_cqe_error() {
        let cqe = CompletionEntry::new(42, RingError::Cancelled.as_result());
        assert!(!cqe.is_ok());
        assert_eq!(cqe.into_result(), Err(RingError::Cancelled));

        let odd = CompletionEntry::new(1, -4000);
        assert_eq!(odd.error(), Some(RingError::IoError));
    }
}
