//! Futex registry.
//!
//! Process-wide table mapping guest addresses to host condvars. A WAIT
//! parks the calling host thread while the guest word still holds the
//! expected value; WAKE notifies up to N waiters registered on the same
//! guest address. Guests pair the two themselves (the word is changed by
//! guest stores before the wake), so the registry only has to get the
//! sleep/notify handshake right.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};

/// One registered futex.
pub struct Futex {
    /// Guest address of the 32-bit futex word.
    pub guest_addr: u64,
    lock: Mutex<()>,
    cv: Condvar,
}

/// The process-wide registry.
pub struct FutexTable {
    entries: Mutex<HashMap<u64, Arc<Futex>>>,
}

impl FutexTable {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entry(&self, guest_addr: u64) -> Arc<Futex> {
        let mut entries = self.entries.lock().expect("futex table lock");
        entries
            .entry(guest_addr)
            .or_insert_with(|| {
                Arc::new(Futex {
                    guest_addr,
                    lock: Mutex::new(()),
                    cv: Condvar::new(),
                })
            })
            .clone()
    }

    /// Blocks while `*word == expected` and `abort()` stays false.
    ///
    /// `word` is the host view of the guest futex word. The abort
    /// predicate lets shutdown interrupt parked guests.
    pub fn wait(&self, guest_addr: u64, word: *const u32, expected: u32, abort: impl Fn() -> bool) {
        let futex = self.entry(guest_addr);
        // SAFETY: the caller translated `word` from a mapped guest address;
        // the mapping lives for the emulator's lifetime. Concurrent guest
        // stores are the whole point, hence the atomic view.
        let word = unsafe { &*word.cast::<AtomicU32>() };

        let mut guard = futex.lock.lock().expect("futex lock");
        while word.load(Ordering::SeqCst) == expected && !abort() {
            guard = futex.cv.wait(guard).expect("futex wait");
        }
        drop(guard);
    }

    /// Wakes up to `count` waiters registered on `guest_addr`.
    pub fn wake(&self, guest_addr: u64, count: u64) {
        let entry = {
            let entries = self.entries.lock().expect("futex table lock");
            entries.get(&guest_addr).cloned()
        };
        if let Some(futex) = entry {
            // Taking the futex lock orders the notify after any in-flight
            // predicate check, so no waiter can miss its wakeup.
            let guard = futex.lock.lock().expect("futex lock");
            for _ in 0..count {
                futex.cv.notify_one();
            }
            drop(guard);
        }
    }

    /// Notifies every waiter on every registered futex.
    pub fn wake_all(&self) {
        let entries: Vec<Arc<Futex>> = self
            .entries
            .lock()
            .expect("futex table lock")
            .values()
            .cloned()
            .collect();
        for futex in entries {
            let guard = futex.lock.lock().expect("futex lock");
            futex.cv.notify_all();
            drop(guard);
        }
    }
}

impl Default for FutexTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    #[test]
    fn wait_returns_once_the_word_changes_and_a_wake_arrives() {
        let table = Arc::new(FutexTable::new());
        let word = Arc::new(AtomicU32::new(7));
        let woke = Arc::new(AtomicBool::new(false));

        let waiter = {
            let table = Arc::clone(&table);
            let word = Arc::clone(&word);
            let woke = Arc::clone(&woke);
            std::thread::spawn(move || {
                table.wait(0x1000, word.as_ptr().cast_const(), 7, || false);
                woke.store(true, Ordering::SeqCst);
            })
        };

        // Give the waiter time to park; it must not return while the word
        // still matches.
        std::thread::sleep(Duration::from_millis(50));
        assert!(!woke.load(Ordering::SeqCst));

        word.store(0, Ordering::SeqCst);
        table.wake(0x1000, 1);
        waiter.join().expect("waiter panicked");
        assert!(woke.load(Ordering::SeqCst));
    }

    #[test]
    fn wait_with_mismatched_value_returns_immediately() {
        let table = FutexTable::new();
        let word = AtomicU32::new(3);
        table.wait(0x2000, word.as_ptr().cast_const(), 7, || false);
    }

    #[test]
    fn wake_without_waiters_is_a_no_op() {
        let table = FutexTable::new();
        table.wake(0x3000, 16);
        table.wake_all();
    }
}
