// ring_abi/src/opcode.rs
//! Operation codes carried in [`SubmissionEntry::opcode`](crate::SubmissionEntry).
//!
//! Numbering matches the Linux 5.4 ring ABI so entries built by existing
//! tooling decode unchanged.

/// I/O operation codes
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    /// No operation; completes with result 0
    Nop = 0,
    /// Vectored read (`addr` points at an iovec array of `len` entries)
    Readv = 1,
    /// Vectored write
    Writev = 2,
    /// Flush resource data to stable storage
    Fsync = 3,
    /// Read into a registered buffer
    ReadFixed = 4,
    /// Write from a registered buffer
    WriteFixed = 5,
    /// Arm a one-shot readiness registration
    PollAdd = 6,
    /// Cancel a readiness registration by tag
    PollRemove = 7,
    /// Flush a byte range
    SyncFileRange = 8,
    /// Send a message on a socket-like resource
    SendMsg = 9,
    /// Receive a message from a socket-like resource
    RecvMsg = 10,
    /// Deadline or completion-count timer
    Timeout = 11,
}

impl OpCode {
    /// Convert from raw u8 value
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Nop),
            1 => Some(Self::Readv),
            2 => Some(Self::Writev),
            3 => Some(Self::Fsync),
            4 => Some(Self::ReadFixed),
            5 => Some(Self::WriteFixed),
            6 => Some(Self::PollAdd),
            7 => Some(Self::PollRemove),
            8 => Some(Self::SyncFileRange),
            9 => Some(Self::SendMsg),
            10 => Some(Self::RecvMsg),
            11 => Some(Self::Timeout),
            _ => None,
        }
    }

    /// Whether the operation targets a resource descriptor
    #[must_use]
    pub const fn needs_resource(self) -> bool {
        !matches!(self, Self::Nop | Self::PollRemove | Self::Timeout)
    }

    /// Whether the operation may touch caller memory through `addr`
    ///
    /// Fixed-buffer operations reference pre-registered regions and do not.
    #[must_use]
    pub const fn needs_user_memory(self) -> bool {
        !matches!(self, Self::ReadFixed | Self::WriteFixed)
    }

    /// Whether the operation is a data read or write
    #[must_use]
    pub const fn is_rw(self) -> bool {
        matches!(
            self,
            Self::Readv | Self::Writev | Self::ReadFixed | Self::WriteFixed
        )
    }

    /// Whether the operation writes data to the resource
    #[must_use]
    pub const fn is_write(self) -> bool {
        matches!(self, Self::Writev | Self::WriteFixed)
    }

    /// Whether the operation uses a registered buffer
    #[must_use]
    pub const fn uses_fixed_buffer(self) -> bool {
        matches!(self, Self::ReadFixed | Self::WriteFixed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_decode() {
        for raw in 0..=11u8 {
            let op = OpCode::from_u8(raw);
            assert!(op.is_some());
            assert_eq!(op.map(|o| o as u8), Some(raw));
        }
        assert_eq!(OpCode::from_u8(12), None);
        assert_eq!(OpCode::from_u8(255), None);
    }

    #[test]
    fn test_opcode_classes() {
        assert!(!OpCode::Nop.needs_resource());
        assert!(!OpCode::Timeout.needs_resource());
        assert!(OpCode::PollAdd.needs_resource());
        assert!(OpCode::WriteFixed.is_write());
        assert!(!OpCode::ReadFixed.needs_user_memory());
        assert!(OpCode::Readv.needs_user_memory());
        assert!(!OpCode::Fsync.is_rw());
    }
}
