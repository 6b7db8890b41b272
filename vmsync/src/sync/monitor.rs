use std::{
    mem::ManuallyDrop,
    num::NonZeroU64,
    ops::Deref,
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
    time::{Duration, Instant},
};

use parking_lot::{Mutex, MutexGuard};

use super::wait_queue::{WaitOutcome, WaitQueue};
use crate::error::WaitError;

fn get_thread_id() -> NonZeroU64 {
    thread_local! {
        static KEY: u64 = 0;
    }
    KEY.with(|x| {
        NonZeroU64::new(x as *const _ as u64).expect("thread-local variable address is null")
    })
}

/// Heavy lock and condition variable pairing used for object wait/notify and thread parking.
///
/// The lock is a `parking_lot::Mutex`; the condition variable is a [`WaitQueue`], so waiters
/// are woken in FIFO order and block on their own event.
/// <ul>
/// <li>The lock is reentrant: the holding thread may call [`lock`](Monitor::lock) again.</li>
/// <li>A wait releases the lock completely, whatever the recursion depth, and restores the
///     depth once the lock is re-acquired.</li>
/// <li>This struct does not provide mutable access to the protected data as it is unsound,
///     instead use `Cell`/`RefCell` to mutate the protected data.</li>
/// </ul>
pub struct Monitor<T> {
    mutex: Mutex<T>,
    waiters: WaitQueue,
    rec_count: AtomicUsize,
    holder: AtomicU64,
}

impl<T> Monitor<T> {
    pub fn new(value: T) -> Self {
        Self {
            mutex: Mutex::new(value),
            waiters: WaitQueue::new(),
            rec_count: AtomicUsize::new(0),
            holder: AtomicU64::new(0),
        }
    }

    pub fn lock(&self) -> MonitorGuard<'_, T> {
        let my_slot = get_thread_id().get();
        let guard = if self.holder.load(Ordering::Relaxed) != my_slot {
            let guard = self.mutex.lock();
            self.holder.store(my_slot, Ordering::Release);
            MonitorGuard {
                monitor: self,
                guard: ManuallyDrop::new(guard),
            }
        } else {
            MonitorGuard {
                monitor: self,
                guard: unsafe { ManuallyDrop::new(self.mutex.make_guard_unchecked()) },
            }
        };
        self.rec_count.fetch_add(1, Ordering::Relaxed);
        guard
    }

    pub fn try_lock(&self) -> Option<MonitorGuard<'_, T>> {
        let my_slot = get_thread_id().get();
        if self.holder.load(Ordering::Relaxed) == my_slot {
            return Some(self.lock());
        }
        let guard = self.mutex.try_lock()?;
        self.holder.store(my_slot, Ordering::Release);
        self.rec_count.fetch_add(1, Ordering::Relaxed);
        Some(MonitorGuard {
            monitor: self,
            guard: ManuallyDrop::new(guard),
        })
    }

    /// Is the calling thread holding this monitor?
    pub fn is_held_by_current_thread(&self) -> bool {
        self.holder.load(Ordering::Relaxed) == get_thread_id().get()
    }

    pub fn notify(&self) -> bool {
        self.waiters.notify_one()
    }

    pub fn notify_all(&self) -> usize {
        self.waiters.notify_all()
    }

    pub fn waiter_count(&self) -> usize {
        self.waiters.waiter_count()
    }
}

pub struct MonitorGuard<'a, T> {
    monitor: &'a Monitor<T>,
    guard: ManuallyDrop<MutexGuard<'a, T>>,
}

impl<T> Deref for MonitorGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl<'a, T> MonitorGuard<'a, T> {
    pub fn wait(&mut self) -> Result<WaitOutcome, WaitError> {
        self.wait_until(None)
    }

    pub fn wait_for(&mut self, timeout: Duration) -> Result<WaitOutcome, WaitError> {
        self.wait_until(Instant::now().checked_add(timeout))
    }

    pub fn wait_until(&mut self, deadline: Option<Instant>) -> Result<WaitOutcome, WaitError> {
        let rec_count = self.monitor.rec_count.swap(0, Ordering::Relaxed);
        let holder = self.monitor.holder.swap(0, Ordering::Relaxed);
        let result = self.monitor.waiters.wait_until(&mut *self.guard, deadline);
        self.monitor.rec_count.store(rec_count, Ordering::Relaxed);
        self.monitor.holder.store(holder, Ordering::Relaxed);
        result
    }

    pub fn notify(&self) -> bool {
        self.monitor.waiters.notify_one()
    }

    pub fn notify_all(&self) -> usize {
        self.monitor.waiters.notify_all()
    }

    pub fn monitor(&self) -> &Monitor<T> {
        self.monitor
    }

    /// Current recursion depth of the monitor.
    pub fn recursion_count(&self) -> usize {
        self.monitor.rec_count.load(Ordering::Relaxed)
    }
}

impl<'a, T> Drop for MonitorGuard<'a, T> {
    fn drop(&mut self) {
        if self.monitor.rec_count.fetch_sub(1, Ordering::Relaxed) == 1 {
            self.monitor.holder.store(0, Ordering::Relaxed);
            unsafe { ManuallyDrop::drop(&mut self.guard) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn lock_is_reentrant() {
        let monitor = Monitor::new(Cell::new(0));
        let outer = monitor.lock();
        assert!(monitor.is_held_by_current_thread());
        {
            let inner = monitor.lock();
            inner.set(inner.get() + 1);
            assert_eq!(inner.recursion_count(), 2);
        }
        assert_eq!(outer.recursion_count(), 1);
        assert_eq!(outer.get(), 1);
        drop(outer);
        assert!(!monitor.is_held_by_current_thread());
        assert!(monitor.try_lock().is_some());
    }

    #[test]
    fn timed_wait_restores_recursion() {
        let monitor = Monitor::new(());
        let _outer = monitor.lock();
        let mut inner = monitor.lock();
        let outcome = inner.wait_for(Duration::from_millis(10)).unwrap();
        assert!(outcome.timed_out());
        assert_eq!(inner.recursion_count(), 2);
        assert!(monitor.is_held_by_current_thread());
    }
}
