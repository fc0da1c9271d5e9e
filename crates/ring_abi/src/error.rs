// ring_abi/src/error.rs
//! Ring Error Codes
//!
//! Every failure the engine reports travels to the client in one of two
//! ways: as a negative `res` in a [`CompletionEntry`](crate::CompletionEntry)
//! or as the return value of an enter/register call. Both use the same
//! errno numbering, so this enum is the single source of truth for it.
//!
//! # Example
//!
//! ```
//! use ring_abi::RingError;
//!
//! let res = RingError::Cancelled.as_result();
//! assert_eq!(res, -125);
//! assert_eq!(RingError::from_result(res), Some(RingError::Cancelled));
//! ```

/// Engine error type
///
/// The discriminant is the errno value. Completion entries carry the
/// negated discriminant.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RingError {
    // === General Errors ===
    /// Operation not permitted
    PermissionDenied = 1,

    /// No matching entry (e.g. poll removal target not found)
    NotFound = 2,

    /// Blocking wait interrupted by a signal
    Interrupted = 4,

    /// Generic I/O error reported by a backend
    IoError = 5,

    /// Context is being torn down or has nothing registered
    NoDevice = 6,

    /// Bad resource descriptor or fixed index
    BadDescriptor = 9,

    /// Operation would block, or a transient shortage
    WouldBlock = 11,

    /// Out of memory
    OutOfMemory = 12,

    /// Bad user address or owning address space gone
    BadAddress = 14,

    /// Resource already registered
    Busy = 16,

    /// Invalid argument
    InvalidArgument = 22,

    /// Too many registered resources
    TooManyOpen = 24,

    // === Ring Errors ===
    /// Timer expired before its completion count was reached
    TimerExpired = 62,

    /// Value too large for the ring layout
    Overflow = 75,

    /// Operation not supported by this context or backend
    NotSupported = 95,

    /// Request cancelled before it ran
    Cancelled = 125,
}

impl RingError {
    /// Convert from a positive errno value
    #[must_use]
    pub const fn from_errno(errno: i32) -> Option<Self> {
        match errno {
            1 => Some(Self::PermissionDenied),
            2 => Some(Self::NotFound),
            4 => Some(Self::Interrupted),
            5 => Some(Self::IoError),
            6 => Some(Self::NoDevice),
            9 => Some(Self::BadDescriptor),
            11 => Some(Self::WouldBlock),
            12 => Some(Self::OutOfMemory),
            14 => Some(Self::BadAddress),
            16 => Some(Self::Busy),
            22 => Some(Self::InvalidArgument),
            24 => Some(Self::TooManyOpen),
            62 => Some(Self::TimerExpired),
            75 => Some(Self::Overflow),
            95 => Some(Self::NotSupported),
            125 => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Convert from a completion result (`res < 0`)
    #[must_use]
    pub const fn from_result(res: i32) -> Option<Self> {
        if res >= 0 {
            return None;
        }
        Self::from_errno(res.wrapping_neg())
    }

    /// Get the positive errno value
    #[must_use]
    pub const fn errno(self) -> i32 {
        self as i32
    }

    /// Get the value placed in a completion entry's `res` field
    #[must_use]
    pub const fn as_result(self) -> i32 {
        -(self as i32)
    }

    /// Get the error category
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::WouldBlock | Self::OutOfMemory | Self::Busy | Self::TooManyOpen => {
                ErrorCategory::Resource
            }
            Self::InvalidArgument
            | Self::BadDescriptor
            | Self::BadAddress
            | Self::Overflow
            | Self::NotSupported
            | Self::PermissionDenied => ErrorCategory::Argument,
            Self::Cancelled | Self::TimerExpired | Self::Interrupted => ErrorCategory::Lifecycle,
            Self::IoError | Self::NotFound => ErrorCategory::Io,
            Self::NoDevice => ErrorCategory::Context,
        }
    }

    /// Check if retrying the same call later may succeed
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::WouldBlock | Self::Interrupted | Self::Busy | Self::OutOfMemory
        )
    }

    /// Get a human-readable description
    #[must_use]
    pub const fn description(&self) -> &'static str {
        match self {
            Self::PermissionDenied => "operation not permitted",
            Self::NotFound => "no such entry",
            Self::Interrupted => "interrupted",
            Self::IoError => "I/O error",
            Self::NoDevice => "context unavailable",
            Self::BadDescriptor => "bad descriptor",
            Self::WouldBlock => "operation would block",
            Self::OutOfMemory => "out of memory",
            Self::BadAddress => "bad address",
            Self::Busy => "resource busy",
            Self::InvalidArgument => "invalid argument",
            Self::TooManyOpen => "too many registered resources",
            Self::TimerExpired => "timer expired",
            Self::Overflow => "value too large",
            Self::NotSupported => "operation not supported",
            Self::Cancelled => "operation cancelled",
        }
    }
}

impl core::fmt::Display for RingError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{} (errno {})", self.description(), self.errno())
    }
}

impl core::error::Error for RingError {}

/// Error category for grouping related errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Malformed entry or call arguments
    Argument,
    /// Transient shortage of a resource
    Resource,
    /// Cancellation, expiry or interruption
    Lifecycle,
    /// Backend-reported failure
    Io,
    /// Context-level state
    Context,
}

/// Type alias for engine results
pub type RingResult<T> = Result<T, RingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_roundtrip() {
        let errors = [
            RingError::InvalidArgument,
            RingError::BadDescriptor,
            RingError::WouldBlock,
            RingError::Cancelled,
            RingError::TimerExpired,
        ];

        for err in errors {
            assert_eq!(RingError::from_errno(err.errno()), Some(err));
            assert_eq!(RingError::from_result(err.as_result()), Some(err));
        }
    }

    #[test]
    fn test_linux_compatible_values() {
        assert_eq!(RingError::InvalidArgument.as_result(), -22);
        assert_eq!(RingError::BadDescriptor.as_result(), -9);
        assert_eq!(RingError::WouldBlock.as_result(), -11);
        assert_eq!(RingError::TimerExpired.as_result(), -62);
        assert_eq!(RingError::Cancelled.as_result(), -125);
    }

    #[test]
    fn test_non_negative_result_is_not_error() {
        assert_eq!(RingError::from_result(0), None);
        assert_eq!(RingError::from_result(4096), None);
        assert_eq!(RingError::from_result(-9999), None);
    }

    #[test]
    fn test_error_categories() {
        assert_eq!(RingError::InvalidArgument.category(), ErrorCategory::Argument);
        assert_eq!(RingError::WouldBlock.category(), ErrorCategory::Resource);
        assert_eq!(RingError::Cancelled.category(), ErrorCategory::Lifecycle);
        assert_eq!(RingError::IoError.category(), ErrorCategory::Io);
        assert_eq!(RingError::NoDevice.category(), ErrorCategory::Context);
    }

    #[test]
    fn test_retriable_errors() {
        assert!(RingError::WouldBlock.is_retriable());
        assert!(RingError::Interrupted.is_retriable());
        assert!(RingError::Busy.is_retriable());
        assert!(!RingError::InvalidArgument.is_retriable());
        assert!(!RingError::Cancelled.is_retriable());
    }

    #[test]
    fn test_error_size() {
        assert_eq!(
            core::mem::size_of::<RingError>(),
            core::mem::size_of::<i32>()
        );
    }
}
