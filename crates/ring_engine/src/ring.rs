// ring_engine/src/ring.rs
//! Shared ring region
//!
//! Both rings' indices and the completion array live in one allocation,
//! addressed through the offsets published in [`Params`](ring_abi::Params).
//! Submission entries live in a second array, as with the separate entry
//! mapping of the kernel ABI.
//!
//! ## Memory Layout
//!
//! ```text
//! +0     sq.head  sq.tail            (own cache line)
//! +64    cq.head  cq.tail            (own cache line)
//! +128   sq_ring_mask  cq_ring_mask  sq_ring_entries  cq_ring_entries
//!        sq_dropped  sq_flags  cq_overflow
//! +192   cqes[cq_entries]            (16 bytes each)
//! ...    sq_array[sq_entries]        (u32 indices into the entry array)
//! ```
//!
//! ## Ordering
//!
//! The producer of either ring writes entries first and then publishes the
//! tail with a release store; the consumer loads the tail with acquire
//! before reading entries and publishes consumption with a release store of
//! the head. A completion slot is never rewritten before the consumer's
//! head has moved past it.

use std::alloc::{self, Layout};
use std::cell::UnsafeCell;
use std::mem::{offset_of, size_of};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};

use ring_abi::{
    CompletionEntry, CqRingOffsets, RingError, RingResult, SqRingFlags, SqRingOffsets,
    SubmissionEntry,
};

#[repr(C, align(64))]
struct IndexPair {
    head: AtomicU32,
    tail: AtomicU32,
}

#[repr(C)]
struct RingHeader {
    sq: IndexPair,
    cq: IndexPair,
    sq_ring_mask: AtomicU32,
    cq_ring_mask: AtomicU32,
    sq_ring_entries: AtomicU32,
    cq_ring_entries: AtomicU32,
    sq_dropped: AtomicU32,
    sq_flags: AtomicU32,
    cq_overflow: AtomicU32,
}

const _: () = assert!(size_of::<RingHeader>() == 192);
const _: () = assert!(size_of::<CompletionEntry>() % 4 == 0);

fn offset32(value: usize) -> RingResult<u32> {
    u32::try_from(value).map_err(|_| RingError::InvalidArgument)
}

/// The shared submission/completion ring pair
pub struct Rings {
    region: NonNull<u8>,
    layout: Layout,
    sqes: Box<[UnsafeCell<SubmissionEntry>]>,
    sq_off: SqRingOffsets,
    cq_off: CqRingOffsets,
    sq_entries: u32,
    cq_entries: u32,
}

// SAFETY: `region` is owned by this value and only reached through atomics,
// or through slot accessors whose callers uphold the head/tail protocol
// described in the module documentation. The entry array follows the same
// protocol.
unsafe impl Send for Rings {}
// SAFETY: see above.
unsafe impl Sync for Rings {}

impl Rings {
    /// Allocate a ring pair
    ///
    /// # Arguments
    /// * `sq_entries` - Submission depth, a power of two
    /// * `cq_entries` - Completion depth, a power of two
    ///
    /// # Errors
    /// `InvalidArgument` if a depth is not a power of two or the region
    /// would not be addressable with 32-bit offsets, `OutOfMemory` if the
    /// allocation fails.
    pub fn new(sq_entries: u32, cq_entries: u32) -> RingResult<Self> {
        if !sq_entries.is_power_of_two() || !cq_entries.is_power_of_two() {
            return Err(RingError::InvalidArgument);
        }

        let cqes = size_of::<RingHeader>();
        let array = size_of::<CompletionEntry>()
            .checked_mul(cq_entries as usize)
            .and_then(|n| n.checked_add(cqes))
            .ok_or(RingError::InvalidArgument)?;
        let total = (sq_entries as usize)
            .checked_mul(size_of::<u32>())
            .and_then(|n| n.checked_add(array))
            .ok_or(RingError::InvalidArgument)?;
        let layout = Layout::from_size_align(total, std::mem::align_of::<RingHeader>())
            .map_err(|_| RingError::InvalidArgument)?;

        let sq_off = SqRingOffsets {
            head: offset32(offset_of!(RingHeader, sq) + offset_of!(IndexPair, head))?,
            tail: offset32(offset_of!(RingHeader, sq) + offset_of!(IndexPair, tail))?,
            ring_mask: offset32(offset_of!(RingHeader, sq_ring_mask))?,
            ring_entries: offset32(offset_of!(RingHeader, sq_ring_entries))?,
            flags: offset32(offset_of!(RingHeader, sq_flags))?,
            dropped: offset32(offset_of!(RingHeader, sq_dropped))?,
            array: offset32(array)?,
            resv1: 0,
            resv2: 0,
        };
        let cq_off = CqRingOffsets {
            head: offset32(offset_of!(RingHeader, cq) + offset_of!(IndexPair, head))?,
            tail: offset32(offset_of!(RingHeader, cq) + offset_of!(IndexPair, tail))?,
            ring_mask: offset32(offset_of!(RingHeader, cq_ring_mask))?,
            ring_entries: offset32(offset_of!(RingHeader, cq_ring_entries))?,
            overflow: offset32(offset_of!(RingHeader, cq_overflow))?,
            cqes: offset32(cqes)?,
            resv: [0; 2],
        };

        // SAFETY: the layout has a non-zero size (the header alone is 192 bytes)
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let region = NonNull::new(raw).ok_or(RingError::OutOfMemory)?;

        let rings = Self {
            region,
            layout,
            sqes: (0..sq_entries)
                .map(|_| UnsafeCell::new(SubmissionEntry::new()))
                .collect(),
            sq_off,
            cq_off,
            sq_entries,
            cq_entries,
        };
        // Zeroed memory is a valid bit pattern for every field; only the
        // geometry words need values.
        rings.word(sq_off.ring_mask).store(sq_entries - 1, Ordering::Relaxed);
        rings.word(sq_off.ring_entries).store(sq_entries, Ordering::Relaxed);
        rings.word(cq_off.ring_mask).store(cq_entries - 1, Ordering::Relaxed);
        rings.word(cq_off.ring_entries).store(cq_entries, Ordering::Relaxed);
        Ok(rings)
    }

    /// Resolve a published offset to its index word
    fn word(&self, offset: u32) -> &AtomicU32 {
        debug_assert!(offset as usize + size_of::<u32>() <= self.layout.size());
        // SAFETY: every offset handed to this function comes from the
        // published tables, which name 4-byte aligned words inside the
        // region; the region lives as long as `self`.
        unsafe { &*self.region.as_ptr().add(offset as usize).cast::<AtomicU32>() }
    }

    /// Submission ring depth
    #[inline]
    #[must_use]
    pub const fn sq_entries(&self) -> u32 {
        self.sq_entries
    }

    /// Completion ring depth
    #[inline]
    #[must_use]
    pub const fn cq_entries(&self) -> u32 {
        self.cq_entries
    }

    /// Published submission ring offsets
    #[must_use]
    pub const fn sq_offsets(&self) -> SqRingOffsets {
        self.sq_off
    }

    /// Published completion ring offsets
    #[must_use]
    pub const fn cq_offsets(&self) -> CqRingOffsets {
        self.cq_off
    }

    pub(crate) fn sq_head(&self) -> &AtomicU32 {
        self.word(self.sq_off.head)
    }

    pub(crate) fn sq_tail(&self) -> &AtomicU32 {
        self.word(self.sq_off.tail)
    }

    pub(crate) fn sq_flags(&self) -> &AtomicU32 {
        self.word(self.sq_off.flags)
    }

    pub(crate) fn sq_dropped(&self) -> &AtomicU32 {
        self.word(self.sq_off.dropped)
    }

    pub(crate) fn cq_head(&self) -> &AtomicU32 {
        self.word(self.cq_off.head)
    }

    pub(crate) fn cq_tail(&self) -> &AtomicU32 {
        self.word(self.cq_off.tail)
    }

    pub(crate) fn cq_overflow(&self) -> &AtomicU32 {
        self.word(self.cq_off.overflow)
    }

    /// Indirection slot for ring position `pos`
    pub(crate) fn sq_array(&self, pos: u32) -> &AtomicU32 {
        let slot = pos & (self.sq_entries - 1);
        self.word(self.sq_off.array + slot * 4)
    }

    fn cqe_ptr(&self, pos: u32) -> *mut CompletionEntry {
        let slot = (pos & (self.cq_entries - 1)) as usize;
        let offset = self.cq_off.cqes as usize + slot * size_of::<CompletionEntry>();
        // SAFETY: slot < cq_entries, so the entry lies inside the cqe array
        unsafe { self.region.as_ptr().add(offset).cast::<CompletionEntry>() }
    }

    /// Copy submission entry `index` out of the entry array
    ///
    /// Returns `None` for an out-of-range index.
    pub(crate) fn read_sqe(&self, index: u32) -> Option<SubmissionEntry> {
        let cell = self.sqes.get(index as usize)?;
        // SAFETY: the producer wrote this slot before its release store of
        // the tail, which the caller observed with acquire; the slot is not
        // rewritten until the engine publishes a head past it.
        Some(unsafe { cell.get().read() })
    }

    /// Store a submission entry into slot `index`
    ///
    /// # Safety
    ///
    /// The slot must not be referenced by any position in
    /// `[sq.head, published tail)`.
    pub(crate) unsafe fn write_sqe(&self, index: u32, sqe: &SubmissionEntry) {
        let cell = &self.sqes[(index & (self.sq_entries - 1)) as usize];
        // SAFETY: guaranteed by the caller
        unsafe { cell.get().write(*sqe) };
    }

    /// Store a completion entry at position `pos`
    ///
    /// # Safety
    ///
    /// The caller must be the only completion producer and must have checked
    /// that `pos - cq.head < cq_entries`.
    pub(crate) unsafe fn write_cqe(&self, pos: u32, cqe: CompletionEntry) {
        // SAFETY: guaranteed by the caller
        unsafe { self.cqe_ptr(pos).write(cqe) };
    }

    /// Copy the completion entry at position `pos`
    ///
    /// # Safety
    ///
    /// `pos` must lie in `[cq.head, cq.tail)` with the tail loaded with
    /// acquire ordering, and the caller must be the only consumer.
    pub(crate) unsafe fn read_cqe(&self, pos: u32) -> CompletionEntry {
        // SAFETY: guaranteed by the caller
        unsafe { self.cqe_ptr(pos).read() }
    }

    /// Entries published by the producer and not yet consumed
    ///
    /// # Arguments
    /// * `cached_head` - The engine's private consumer position
    pub(crate) fn sq_pending(&self, cached_head: u32) -> u32 {
        self.sq_tail().load(Ordering::Acquire).wrapping_sub(cached_head)
    }

    /// Publish consumption of submission entries
    pub(crate) fn commit_sq_head(&self, cached_head: u32) {
        if self.sq_head().load(Ordering::Relaxed) != cached_head {
            // Entry reads are complete; the client may reuse the slots.
            self.sq_head().store(cached_head, Ordering::Release);
        }
    }

    /// Whether the completion ring has a free slot at `cached_tail`
    pub(crate) fn cq_has_space(&self, cached_tail: u32) -> bool {
        cached_tail.wrapping_sub(self.cq_head().load(Ordering::Acquire)) < self.cq_entries
    }

    /// Publish completion entries written up to `cached_tail`
    ///
    /// Returns `true` if the visible tail moved.
    pub(crate) fn commit_cq_tail(&self, cached_tail: u32) -> bool {
        if self.cq_tail().load(Ordering::Relaxed) == cached_tail {
            return false;
        }
        self.cq_tail().store(cached_tail, Ordering::Release);
        true
    }

    /// Completions visible to the consumer
    #[must_use]
    pub fn cq_ready(&self) -> u32 {
        let tail = self.cq_tail().load(Ordering::Acquire);
        tail.wrapping_sub(self.cq_head().load(Ordering::Acquire))
    }

    /// Current submission ring flags
    #[must_use]
    pub fn sq_ring_flags(&self) -> SqRingFlags {
        SqRingFlags::from_bits_truncate(self.sq_flags().load(Ordering::Acquire))
    }

    pub(crate) fn set_sq_ring_flag(&self, flag: SqRingFlags) {
        self.sq_flags().fetch_or(flag.bits(), Ordering::Relaxed);
    }

    pub(crate) fn clear_sq_ring_flag(&self, flag: SqRingFlags) {
        self.sq_flags().fetch_and(!flag.bits(), Ordering::Relaxed);
    }
}

impl Drop for Rings {
    fn drop(&mut self) {
        // SAFETY: `region` came from `alloc_zeroed` with this layout
        unsafe { alloc::dealloc(self.region.as_ptr(), self.layout) };
    }
}

impl core::fmt::Debug for Rings {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Rings")
            .field("sq_entries", &self.sq_entries)
            .field("cq_entries", &self.cq_entries)
            .field("sq_head", &self.sq_head().load(Ordering::Relaxed))
            .field("sq_tail", &self.sq_tail().load(Ordering::Relaxed))
            .field("cq_head", &self.cq_head().load(Ordering::Relaxed))
            .field("cq_tail", &self.cq_tail().load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_non_power_of_two() {
        assert_eq!(Rings::new(3, 6).unwrap_err(), RingError::InvalidArgument);
    }

    #[test]
    fn test_offsets_are_distinct() {
        let rings = Rings::new(4, 8).unwrap();
        let sq = rings.sq_offsets();
        let cq = rings.cq_offsets();
        let mut offs = vec![
            sq.head,
            sq.tail,
            sq.ring_mask,
            sq.ring_entries,
            sq.flags,
            sq.dropped,
            cq.head,
            cq.tail,
            cq.ring_mask,
            cq.ring_entries,
            cq.overflow,
        ];
        offs.sort_unstable();
        offs.dedup();
        assert_eq!(offs.len(), 11);
        assert_eq!(cq.cqes, 192);
        assert_eq!(sq.array, 192 + 8 * 16);
        assert_eq!(rings.word(sq.ring_mask).load(Ordering::Relaxed), 3);
        assert_eq!(rings.word(cq.ring_entries).load(Ordering::Relaxed), 8);
    }

    #[test]
    fn test_cq_space_accounting() {
        let rings = Rings::new(1, 2).unwrap();
        assert!(rings.cq_has_space(0));
        assert!(rings.cq_has_space(1));
        assert!(!rings.cq_has_space(2));
        rings.cq_head().store(1, Ordering::Release);
        assert!(rings.cq_has_space(2));
    }

    #[test]
    fn test_cqe_slot_wraps() {
        let rings = Rings::new(1, 2).unwrap();
        // SAFETY: single-threaded test, positions within capacity
        unsafe {
            rings.write_cqe(0, CompletionEntry::new(7, 1));
            rings.write_cqe(3, CompletionEntry::new(9, -2));
            assert_eq!(rings.read_cqe(2).user_data, 7);
            assert_eq!(rings.read_cqe(1).res, -2);
        }
        assert!(rings.commit_cq_tail(2));
        assert!(!rings.commit_cq_tail(2));
        assert_eq!(rings.cq_ready(), 2);
    }

    #[test]
    fn test_read_sqe_bounds() {
        let rings = Rings::new(2, 4).unwrap();
        assert!(rings.read_sqe(1).is_some());
        assert!(rings.read_sqe(2).is_none());
    }
}
