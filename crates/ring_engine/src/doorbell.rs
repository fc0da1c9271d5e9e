// ring_engine/src/doorbell.rs
//! Doorbell: the engine's sleep/wake primitive
//!
//! A doorbell is a ring counter plus a condition variable. Producers of an
//! event change their state first and then [`ring`](Doorbell::ring) the
//! bell; sleepers re-check their condition under the bell's lock, so a ring
//! that lands between the check and the sleep is never lost.
//!
//! ```text
//! producer                      sleeper
//!   state change                  sleepers += 1, fence
//!   ring += 1, fence              lock; while blocked(): wait
//!   if sleepers: lock + notify    sleepers -= 1
//! ```
//!
//! Used for completion waiters in `enter`, the parked submission thread,
//! idle offload workers and signal delivery.

use std::sync::atomic::{fence, AtomicU32, Ordering};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

/// Doorbell shared between an event source and its sleepers
#[derive(Debug, Default)]
pub struct Doorbell {
    /// Rings since the last [`check_and_clear`](Self::check_and_clear)
    rings: AtomicU32,
    /// Threads inside [`wait_while`](Self::wait_while)
    sleepers: AtomicU32,
    lock: Mutex<()>,
    cv: Condvar,
}

impl Doorbell {
    /// Create a silent doorbell
    #[must_use]
    pub const fn new() -> Self {
        Self {
            rings: AtomicU32::new(0),
            sleepers: AtomicU32::new(0),
            lock: Mutex::new(()),
            cv: Condvar::new(),
        }
    }

    /// Ring the doorbell, waking every sleeper
    pub fn ring(&self) {
        self.rings.fetch_add(1, Ordering::Release);
        fence(Ordering::SeqCst);
        if self.sleepers.load(Ordering::Relaxed) != 0 {
            let _guard = self.lock.lock();
            self.cv.notify_all();
        }
    }

    /// Rings since the last clear, without clearing
    #[inline]
    #[must_use]
    pub fn peek(&self) -> u32 {
        self.rings.load(Ordering::Acquire)
    }

    /// Read and clear the ring counter
    #[inline]
    pub fn check_and_clear(&self) -> u32 {
        self.rings.swap(0, Ordering::AcqRel)
    }

    /// Sleep while `blocked` holds
    ///
    /// # Arguments
    /// * `deadline` - Give up at this instant; `None` waits indefinitely
    /// * `blocked` - Re-evaluated after every wakeup, under the bell's lock
    ///
    /// # Returns
    /// `true` if `blocked` turned false, `false` on deadline.
    pub fn wait_while<F>(&self, deadline: Option<Instant>, mut blocked: F) -> bool
    where
        F: FnMut() -> bool,
    {
        let mut guard = self.lock.lock();
        self.sleepers.fetch_add(1, Ordering::SeqCst);
        fence(Ordering::SeqCst);
        let woken = loop {
            if !blocked() {
                break true;
            }
            match deadline {
                Some(at) => {
                    if self.cv.wait_until(&mut guard, at).timed_out() && blocked() {
                        break false;
                    }
                }
                None => self.cv.wait(&mut guard),
            }
        };
        self.sleepers.fetch_sub(1, Ordering::Release);
        woken
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_doorbell_new() {
        let db = Doorbell::new();
        assert_eq!(db.peek(), 0);
    }

    #[test]
    fn test_check_and_clear() {
        let db = Doorbell::new();
        db.ring();
        db.ring();
        db.ring();
        assert_eq!(db.check_and_clear(), 3);
        assert_eq!(db.peek(), 0);
    }

    #[test]
    fn test_wait_times_out() {
        let db = Doorbell::new();
        let at = Instant::now() + Duration::from_millis(20);
        assert!(!db.wait_while(Some(at), || true));
        assert!(db.wait_while(Some(at), || false));
    }

    #[test]
    fn test_ring_wakes_sleeper() {
        let db = Arc::new(Doorbell::new());
        let flag = Arc::new(AtomicBool::new(false));
        let sleeper = {
            let db = Arc::clone(&db);
            let flag = Arc::clone(&flag);
            thread::spawn(move || db.wait_while(None, || !flag.load(Ordering::Acquire)))
        };
        thread::sleep(Duration::from_millis(10));
        flag.store(true, Ordering::Release);
        db.ring();
        assert!(sleeper.join().unwrap());
    }
}
