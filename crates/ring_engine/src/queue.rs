// ring_engine/src/queue.rs
//! Client-side views of the shared rings
//!
//! A [`SubmissionQueue`] is the single producer of submission entries and a
//! [`CompletionQueue`] is the single consumer of completions. Each view
//! holds a lock for its lifetime, so two threads never drive the same side
//! of a ring at once.
//!
//! ```text
//! SubmissionQueue            engine              CompletionQueue
//!   push() ─► slot/array
//!   sync() ─► tail (release) ─► admission
//!                               post ─► cqe/tail ─► next() ─► head (release)
//! ```

use std::sync::atomic::{fence, Ordering};

use parking_lot::MutexGuard;
use ring_abi::{CompletionEntry, RingError, RingResult, SqRingFlags, SubmissionEntry};

use crate::ring::Rings;

/// Producer view of the submission ring
///
/// Entries pushed through the view become visible to the engine on
/// [`sync`](Self::sync) or when the view is dropped.
pub struct SubmissionQueue<'a> {
    rings: &'a Rings,
    tail: u32,
    _guard: MutexGuard<'a, ()>,
}

impl<'a> SubmissionQueue<'a> {
    pub(crate) fn new(rings: &'a Rings, guard: MutexGuard<'a, ()>) -> Self {
        // Only this view writes the tail.
        let tail = rings.sq_tail().load(Ordering::Relaxed);
        Self {
            rings,
            tail,
            _guard: guard,
        }
    }

    /// Ring depth
    #[must_use]
    pub const fn capacity(&self) -> u32 {
        self.rings.sq_entries()
    }

    /// Entries pushed and not yet consumed by the engine
    #[must_use]
    pub fn len(&self) -> u32 {
        self.tail
            .wrapping_sub(self.rings.sq_head().load(Ordering::Acquire))
    }

    /// Whether no entries are pending
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether another push would fail
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity()
    }

    /// Append an entry
    ///
    /// # Errors
    /// `Busy` when the ring is full.
    pub fn push(&mut self, sqe: &SubmissionEntry) -> RingResult<()> {
        if self.is_full() {
            return Err(RingError::Busy);
        }
        let index = self.tail & (self.capacity() - 1);
        // SAFETY: position `tail` is beyond the published tail and within
        // one ring of the head, so the engine does not reference this slot.
        unsafe { self.rings.write_sqe(index, sqe) };
        self.rings.sq_array(self.tail).store(index, Ordering::Relaxed);
        self.tail = self.tail.wrapping_add(1);
        Ok(())
    }

    /// Append several entries, stopping when the ring fills
    ///
    /// Returns the number of entries pushed.
    pub fn push_all(&mut self, sqes: &[SubmissionEntry]) -> usize {
        sqes.iter()
            .take_while(|sqe| self.push(sqe).is_ok())
            .count()
    }

    /// Append a raw indirection index without writing an entry
    ///
    /// An index at or beyond the ring depth is counted as dropped by the
    /// engine.
    ///
    /// # Errors
    /// `Busy` when the ring is full.
    ///
    /// # Safety
    ///
    /// An in-range index must name a slot that no other pending position
    /// references and that the caller will not rewrite before the engine
    /// consumes this position.
    pub unsafe fn push_index(&mut self, index: u32) -> RingResult<()> {
        if self.is_full() {
            return Err(RingError::Busy);
        }
        self.rings.sq_array(self.tail).store(index, Ordering::Relaxed);
        self.tail = self.tail.wrapping_add(1);
        Ok(())
    }

    /// Publish pushed entries to the engine
    pub fn sync(&mut self) {
        self.rings.sq_tail().store(self.tail, Ordering::Release);
    }

    /// Whether the submission thread is parked and needs `SQ_WAKEUP`
    #[must_use]
    pub fn needs_wakeup(&self) -> bool {
        // Pairs with the fence between setting the flag and re-reading the
        // tail on the submission thread.
        fence(Ordering::SeqCst);
        self.rings.sq_ring_flags().contains(SqRingFlags::NEED_WAKEUP)
    }

    /// Entries dropped for an out-of-range index
    #[must_use]
    pub fn dropped(&self) -> u32 {
        self.rings.sq_dropped().load(Ordering::Acquire)
    }
}

impl Drop for SubmissionQueue<'_> {
    fn drop(&mut self) {
        self.sync();
    }
}

/// Consumer view of the completion ring
pub struct CompletionQueue<'a> {
    rings: &'a Rings,
    head: u32,
    _guard: MutexGuard<'a, ()>,
}

impl<'a> CompletionQueue<'a> {
    pub(crate) fn new(rings: &'a Rings, guard: MutexGuard<'a, ()>) -> Self {
        let head = rings.cq_head().load(Ordering::Relaxed);
        Self {
            rings,
            head,
            _guard: guard,
        }
    }

    /// Ring depth
    #[must_use]
    pub const fn capacity(&self) -> u32 {
        self.rings.cq_entries()
    }

    /// Completions ready to be consumed
    #[must_use]
    pub fn len(&self) -> u32 {
        self.rings
            .cq_tail()
            .load(Ordering::Acquire)
            .wrapping_sub(self.head)
    }

    /// Whether no completion is ready
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Completions lost because the ring was full (saturating)
    #[must_use]
    pub fn overflow(&self) -> u32 {
        self.rings.cq_overflow().load(Ordering::Acquire)
    }

    /// Look at the next completion without consuming it
    #[must_use]
    pub fn peek(&self) -> Option<CompletionEntry> {
        if self.is_empty() {
            return None;
        }
        // SAFETY: head < tail (acquire) and this view is the only consumer
        Some(unsafe { self.rings.read_cqe(self.head) })
    }

    /// Drain every ready completion into a vector
    pub fn drain_all(&mut self) -> Vec<CompletionEntry> {
        self.by_ref().collect()
    }
}

impl Iterator for CompletionQueue<'_> {
    type Item = CompletionEntry;

    fn next(&mut self) -> Option<CompletionEntry> {
        let cqe = self.peek()?;
        self.head = self.head.wrapping_add(1);
        // The slot has been copied; the engine may reuse it.
        self.rings.cq_head().store(self.head, Ordering::Release);
        Some(cqe)
    }
}
