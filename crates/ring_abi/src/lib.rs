//! Shared ABI definitions for the ring submission/completion engine
//!
//! This crate provides the data layouts shared between a client and the
//! engine.
//!
//! # Architecture
//!
//! The interface uses two ring buffers:
//! - **Submission Queue (SQ)**: client writes requests, engine reads
//! - **Completion Queue (CQ)**: engine writes results, client reads
//!
//! This design allows batching of I/O operations, reducing call overhead
//! from O(n) to O(1) for n operations.
//!
//! # Modules
//!
//! - [`error`]: errno-coded error type
//! - [`opcode`]: operation codes
//! - [`flags`]: submission, setup, enter and ring flag sets
//! - [`entry`]: submission and completion entry layouts
//! - [`params`]: setup parameters and published ring offsets

#![no_std]
#![warn(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod entry;
pub mod error;
pub mod flags;
pub mod opcode;
pub mod params;

// Re-export commonly used types
pub use entry::{CompletionEntry, SubmissionEntry};
pub use error::{ErrorCategory, RingError, RingResult};
pub use flags::{
    EnterFlags, Features, FsyncFlags, PollEvents, RwFlags, SetupFlags, SqRingFlags, SqeFlags,
};
pub use opcode::OpCode;
pub use params::{
    CqRingOffsets, DEFAULT_SQ_THREAD_IDLE_MS, MAX_ENTRIES, MAX_FIXED_BUFFERS,
    MAX_FIXED_BUFFER_LEN, MAX_FIXED_FILES, Params, SqRingOffsets,
};
