// ring_engine/src/ops.rs
//! Operation dispatch
//!
//! [`Ctx::issue`] runs one request. It is called twice at most: first from
//! the submitter with `force_nonblock`, then (if that reported
//! `WouldBlock`) from an offload worker in blocking mode.
//!
//! An `Err` from `issue` means the request has *not* posted a completion:
//! `WouldBlock` asks for an offload, any other error is posted by the
//! caller. `Ok` means the request completed or is in flight.

use std::sync::Arc;

use log::warn;
use ring_abi::{FsyncFlags, OpCode, RingError, RingResult, RwFlags, SetupFlags};

use crate::context::Ctx;
use crate::request::{ReqFlags, ReqRef};
use crate::resource::{FixedBuffer, IoOp, Resource, ResourceCaps, Submitted};
use crate::worker::{READ_CLASS, WRITE_CLASS};

/// `MSG_DONTWAIT` in message operation flags
pub const MSG_DONTWAIT: u32 = 0x40;

fn clamp_result(n: u32) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

impl Ctx {
    /// Run one request
    ///
    /// # Errors
    /// `WouldBlock` to request an offload; anything else is to be posted.
    pub(crate) fn issue(self: &Arc<Self>, req: &ReqRef, force_nonblock: bool) -> RingResult<()> {
        let Some(op) = req.op else {
            return Err(RingError::InvalidArgument);
        };
        match op {
            OpCode::Nop => self.io_nop(req),
            OpCode::Readv | OpCode::Writev if req.sqe.buf_index != 0 => {
                Err(RingError::InvalidArgument)
            }
            OpCode::Readv | OpCode::ReadFixed => self.io_rw(op, req, force_nonblock, false),
            OpCode::Writev | OpCode::WriteFixed => self.io_rw(op, req, force_nonblock, true),
            OpCode::Fsync => self.io_fsync(req, force_nonblock),
            OpCode::SyncFileRange => self.io_sync_range(req, force_nonblock),
            OpCode::SendMsg | OpCode::RecvMsg => self.io_msg(op, req, force_nonblock),
            OpCode::PollAdd => self.poll_add(req),
            OpCode::PollRemove => self.poll_remove(req),
            OpCode::Timeout => self.timeout_arm(req),
        }?;

        if self.flags.contains(SetupFlags::IOPOLL) && op.is_rw() {
            if req.result() == RingError::WouldBlock.as_result() {
                return Err(RingError::WouldBlock);
            }
            self.iopoll_req_issued(req);
        }
        Ok(())
    }

    fn io_nop(&self, req: &ReqRef) -> RingResult<()> {
        if self.flags.contains(SetupFlags::IOPOLL) {
            return Err(RingError::InvalidArgument);
        }
        self.add_event(req.tag(), 0);
        self.put_req(req);
        Ok(())
    }

    /// Post the outcome of a backend call
    fn finish_backend(&self, req: &ReqRef, io: &IoOp<'_>, outcome: RingResult<Submitted>) {
        match outcome {
            Ok(Submitted::Done(n)) => self.complete_rw(req, clamp_result(n)),
            Ok(Submitted::Queued) if io.was_deferred() => {}
            Ok(Submitted::Queued) => {
                warn!(
                    "[ring] backend queued tag {} without taking its completion",
                    req.tag()
                );
                self.complete_rw(req, RingError::IoError.as_result());
            }
            Err(e) => self.complete_rw(req, e.as_result()),
        }
    }

    fn io_rw(
        self: &Arc<Self>,
        op: OpCode,
        req: &ReqRef,
        force_nonblock: bool,
        write: bool,
    ) -> RingResult<()> {
        let res = req.resource().ok_or(RingError::BadDescriptor)?;
        let caps = res.caps();
        if caps.contains(ResourceCaps::REGULAR) {
            req.set(ReqFlags::ISREG);
        }
        if force_nonblock && !caps.contains(ResourceCaps::NOWAIT) {
            req.set(ReqFlags::MUST_PUNT);
            return Err(RingError::WouldBlock);
        }

        let rw = RwFlags::from_bits(req.sqe.op_flags).ok_or(RingError::NotSupported)?;
        if rw.contains(RwFlags::NOWAIT) || caps.contains(ResourceCaps::NONBLOCK) {
            req.set(ReqFlags::NOWAIT);
        }

        let iopoll = self.flags.contains(SetupFlags::IOPOLL);
        if iopoll {
            if !caps.contains(ResourceCaps::DIRECT | ResourceCaps::IOPOLL) {
                return Err(RingError::NotSupported);
            }
            req.set_result(0);
        } else if rw.contains(RwFlags::HIPRI) {
            return Err(RingError::InvalidArgument);
        }

        let mode = if write {
            ResourceCaps::WRITE
        } else {
            ResourceCaps::READ
        };
        if !caps.contains(mode) {
            return Err(RingError::BadDescriptor);
        }

        let fixed: Option<FixedBuffer> = if op.uses_fixed_buffer() {
            Some(
                self.registry
                    .read()
                    .import_fixed(req.sqe.buf_index, req.sqe.addr, req.sqe.len)?,
            )
        } else {
            None
        };
        let read_size = fixed.map(|f| clamp_result(f.len));
        if req.has(ReqFlags::LINK) {
            if let Some(size) = read_size {
                req.set_expect(size);
            }
        }

        let len = u64::from(req.sqe.len);
        let class = if write { WRITE_CLASS } else { READ_CLASS };
        if write && force_nonblock && !caps.contains(ResourceCaps::DIRECT) {
            self.async_list_note(class, req, &res, len);
            return Err(RingError::WouldBlock);
        }

        let nonblock = force_nonblock || req.has(ReqFlags::NOWAIT);
        let io = IoOp::new(op, self, req, fixed, nonblock, iopoll);
        match res.submit(&io) {
            Ok(Submitted::Done(n)) => {
                let n = clamp_result(n);
                let short = !write
                    && force_nonblock
                    && !req.has(ReqFlags::NOWAIT)
                    && req.has(ReqFlags::ISREG)
                    && read_size.is_some_and(|size| n > 0 && n < size);
                if short {
                    // Finish the whole read in blocking mode.
                    self.async_list_note(class, req, &res, len);
                    return Err(RingError::WouldBlock);
                }
                self.complete_rw(req, n);
            }
            Err(RingError::WouldBlock) if force_nonblock => {
                self.async_list_note(class, req, &res, len);
                return Err(RingError::WouldBlock);
            }
            outcome => self.finish_backend(req, &io, outcome),
        }
        Ok(())
    }

    /// Shared validation of the flush operations
    fn prep_sync(&self, req: &ReqRef) -> RingResult<Arc<dyn Resource>> {
        let res = req.resource().ok_or(RingError::BadDescriptor)?;
        if self.flags.contains(SetupFlags::IOPOLL) {
            return Err(RingError::InvalidArgument);
        }
        if req.sqe.addr != 0 || req.sqe.ioprio != 0 || req.sqe.buf_index != 0 {
            return Err(RingError::InvalidArgument);
        }
        Ok(res)
    }

    /// Run a flush in blocking mode
    fn sync_blocking(
        self: &Arc<Self>,
        op: OpCode,
        req: &ReqRef,
        res: &Arc<dyn Resource>,
        force_nonblock: bool,
    ) -> RingResult<()> {
        // Flushes always need a blocking context.
        if force_nonblock {
            return Err(RingError::WouldBlock);
        }
        let io = IoOp::new(op, self, req, None, false, false);
        let outcome = res.submit(&io);
        self.finish_backend(req, &io, outcome);
        Ok(())
    }

    fn io_fsync(self: &Arc<Self>, req: &ReqRef, force_nonblock: bool) -> RingResult<()> {
        FsyncFlags::from_bits(req.sqe.op_flags).ok_or(RingError::InvalidArgument)?;
        let res = self.prep_sync(req)?;
        self.sync_blocking(OpCode::Fsync, req, &res, force_nonblock)
    }

    fn io_sync_range(self: &Arc<Self>, req: &ReqRef, force_nonblock: bool) -> RingResult<()> {
        let res = self.prep_sync(req)?;
        self.sync_blocking(OpCode::SyncFileRange, req, &res, force_nonblock)
    }

    fn io_msg(self: &Arc<Self>, op: OpCode, req: &ReqRef, force_nonblock: bool) -> RingResult<()> {
        if self.flags.contains(SetupFlags::IOPOLL) {
            return Err(RingError::InvalidArgument);
        }
        let res = req.resource().ok_or(RingError::BadDescriptor)?;
        let dontwait = req.sqe.op_flags & MSG_DONTWAIT != 0;
        if dontwait {
            req.set(ReqFlags::NOWAIT);
        }
        let io = IoOp::new(op, self, req, None, force_nonblock || dontwait, false);
        match res.submit(&io) {
            Err(RingError::WouldBlock) if force_nonblock => Err(RingError::WouldBlock),
            outcome => {
                self.finish_backend(req, &io, outcome);
                Ok(())
            }
        }
    }
}
