//! Subprocess slot arbitration: a counting semaphore bounds concurrent
//! recipes, and an exclusive slot drains it entirely so a recipe marked
//! exclusive runs with no siblings in flight.

use std::sync::{Condvar, Mutex, MutexGuard};

pub struct SlotPool {
    allowed: usize,
    running: Mutex<usize>,
    freed: Condvar,
    exclusive: Mutex<()>,
}

/// Holds either one shared slot or the exclusive slot; released on drop.
pub struct SlotGuard<'a> {
    pool: &'a SlotPool,
    exclusive: Option<MutexGuard<'a, ()>>,
}

impl SlotPool {
    pub fn new(allowed: usize) -> SlotPool {
        SlotPool {
            allowed: allowed.max(1),
            running: Mutex::new(0),
            freed: Condvar::new(),
            exclusive: Mutex::new(()),
        }
    }

    /// Wait for a shared subprocess slot.
    pub fn acquire(&self) -> SlotGuard<'_> {
        let mut running = self.running.lock().expect("slot lock");
        while *running >= self.allowed {
            running = self.freed.wait(running).expect("slot lock");
        }
        *running += 1;
        SlotGuard {
            pool: self,
            exclusive: None,
        }
    }

    /// Wait for the exclusive slot, stealing every shared slot so nothing
    /// else runs until it is released.
    pub fn acquire_exclusive(&self) -> SlotGuard<'_> {
        let exclusive = self.exclusive.lock().expect("exclusive lock");
        let mut running = self.running.lock().expect("slot lock");
        let mut stolen = self.allowed - *running;
        *running = self.allowed;
        while stolen < self.allowed {
            running = self.freed.wait(running).expect("slot lock");
            stolen += self.allowed - *running;
            *running = self.allowed;
        }
        SlotGuard {
            pool: self,
            exclusive: Some(exclusive),
        }
    }
}

impl<'a> Drop for SlotGuard<'a> {
    fn drop(&mut self) {
        let mut running = self.pool.running.lock().expect("slot lock");
        if self.exclusive.is_some() {
            *running = 0;
        } else {
            *running -= 1;
        }
        self.pool.freed.notify_all();
    }
}
