// ring_engine/src/lib.rs
//! Shared-ring asynchronous I/O engine
//!
//! A client and the engine share two rings: the client publishes
//! submission entries, the engine executes them against pluggable
//! [`Resource`] backends and publishes one completion entry per admitted
//! submission, carrying the submitter's tag.
//!
//! # Architecture
//!
//! ```text
//!  client                 engine                          backends
//!  ┌──────────┐  enter   ┌───────────────────────────┐
//!  │ sq tail ─┼────────► │ admission ─► issue ───────┼──► Resource::submit
//!  │          │          │    │           │ WouldBlock│
//!  │          │          │ drain/link   offload pools│◄── IoCompletion
//!  │ cq head ◄┼───────── │ completion poster ◄───────┘
//!  └──────────┘          │ timer thread, sqpoll thread│
//!                        └───────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `ring`, `queue`: the shared region and client views of it
//! - `submit`, `ops`: admission and dispatch
//! - `completion`, `link`: posting, drain ordering and dependency chains
//! - `worker`: blocking offload pools with sequential batching
//! - `sqpoll`, `iopoll`: submission thread and busy-poll reaping
//! - `timeout`, `poll`: timer and readiness requests
//! - `registry`: fixed resources, buffers and the event notifier
//! - `context`: lifecycle and the public [`Context`] handle

#![warn(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]

mod completion;
mod config;
mod context;
mod doorbell;
mod env;
mod future;
mod gate;
mod iopoll;
mod link;
mod ops;
mod poll;
mod queue;
mod registry;
mod request;
mod resource;
mod ring;
mod sqpoll;
mod stats;
mod submit;
mod timeout;
mod worker;

pub use config::{EngineConfig, PLUG_THRESHOLD, SUBMIT_BATCH, WRITE_WORKERS};
pub use context::Context;
pub use doorbell::Doorbell;
pub use env::{
    AddressSpace, AttachedEnv, Credentials, FsContext, OwnerEnv, OwnerId, SigMask, current,
};
pub use future::CompletionFuture;
pub use ops::MSG_DONTWAIT;
pub use queue::{CompletionQueue, SubmissionQueue};
pub use registry::{BufferRegion, CompletionNotify, Registration, RegistryStats};
pub use resource::{
    FixedBuffer, IoCompletion, IoOp, PollWaiter, Resource, ResourceCaps, ResourceMap,
    ResourceTable, Submitted,
};
pub use ring::Rings;
pub use sqpoll::SqPollState;
pub use stats::EngineStats;

pub use ring_abi;
