// ring_engine/src/gate.rs
//! Teardown reference gate
//!
//! Every live request and every `enter` call holds a reference on the
//! context gate. Killing the gate refuses new references and drops the base
//! reference; the killer then sleeps until the count reaches zero. Register
//! operations kill, wait and then re-open the gate.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::doorbell::Doorbell;

const DYING: usize = 1 << (usize::BITS - 1);

/// Counting gate with a dying mark
#[derive(Debug)]
pub(crate) struct RefGate {
    count: AtomicUsize,
    zero: Doorbell,
}

impl RefGate {
    /// Create an open gate holding its base reference
    pub(crate) const fn new() -> Self {
        Self {
            count: AtomicUsize::new(1),
            zero: Doorbell::new(),
        }
    }

    /// Take a reference unless the gate is dying
    pub(crate) fn tryget(&self) -> bool {
        self.count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                (c & DYING == 0).then_some(c + 1)
            })
            .is_ok()
    }

    /// Drop a reference
    pub(crate) fn put(&self) {
        let prev = self.count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev & !DYING != 0, "gate reference underflow");
        if prev & !DYING == 1 {
            self.zero.ring();
        }
    }

    /// Refuse new references and drop the base reference
    ///
    /// Returns `false` if the gate was already dying.
    pub(crate) fn kill(&self) -> bool {
        let prev = self.count.fetch_or(DYING, Ordering::AcqRel);
        if prev & DYING != 0 {
            return false;
        }
        self.put();
        true
    }

    /// Whether the gate refuses new references
    pub(crate) fn is_dying(&self) -> bool {
        self.count.load(Ordering::Acquire) & DYING != 0
    }

    /// Outstanding references
    pub(crate) fn live(&self) -> usize {
        self.count.load(Ordering::Acquire) & !DYING
    }

    /// Sleep until a killed gate has drained
    pub(crate) fn wait_zero(&self) {
        self.zero.wait_while(None, || self.live() != 0);
    }

    /// Re-open a drained gate with a fresh base reference
    pub(crate) fn reinit(&self) {
        debug_assert_eq!(self.live(), 0);
        self.count.store(1, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn test_tryget_refused_when_dying() {
        let gate = RefGate::new();
        assert!(gate.tryget());
        assert!(gate.kill());
        assert!(!gate.kill());
        assert!(gate.is_dying());
        assert!(!gate.tryget());
        assert_eq!(gate.live(), 1);
        gate.put();
        gate.wait_zero();
        gate.reinit();
        assert!(!gate.is_dying());
        assert!(gate.tryget());
    }

    #[test]
    fn test_wait_zero_blocks_until_put() {
        let gate = Arc::new(RefGate::new());
        assert!(gate.tryget());
        gate.kill();
        let holder = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || gate.put())
        };
        gate.wait_zero();
        holder.join().unwrap();
        assert_eq!(gate.live(), 0);
    }
}
