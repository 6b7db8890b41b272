//! Condition variable built from a mutex and per-waiter manual-reset events.
//!
//! Waiters are kept in FIFO order in a circular doubly linked list. The list lives in an arena
//! (slot 0 is the sentinel, links are slot indices) and is protected by an internal mutex that
//! is only ever held for O(1) list surgery, never while blocked.
//!
//! The lost-wakeup rule: a waiter links itself into the list *before* it releases the caller's
//! mutex. A notifier holds that same mutex while it changes the protected state and calls
//! `notify_*`, so it either sees the waiter linked or the waiter has not decided to wait yet.
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard};

use super::event::{Event, EventStatus, RawEvent};
use crate::error::WaitError;

/// Successful outcome of [`WaitQueue::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// A notifier unlinked this waiter and set its event.
    Notified,
    /// The deadline passed before any notifier reached this waiter.
    TimedOut,
}

impl WaitOutcome {
    pub fn timed_out(self) -> bool {
        self == WaitOutcome::TimedOut
    }
}

const SENTINEL: u32 = 0;

struct Link<E> {
    prev: u32,
    next: u32,
    generation: u32,
    event: Option<Arc<E>>,
}

/// Identifies one `wait` call's entry. A stale token (its slot was unlinked and reused) no
/// longer matches the slot's generation.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
struct WaitToken {
    index: u32,
    generation: u32,
}

struct WaitList<E> {
    links: Vec<Link<E>>,
    free: Vec<u32>,
    len: usize,
}

impl<E> WaitList<E> {
    fn new() -> Self {
        Self {
            links: vec![Link {
                prev: SENTINEL,
                next: SENTINEL,
                generation: 0,
                event: None,
            }],
            free: Vec::new(),
            len: 0,
        }
    }

    fn is_empty(&self) -> bool {
        self.links[SENTINEL as usize].next == SENTINEL
    }

    fn push_back(&mut self, event: Arc<E>) -> WaitToken {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.links.push(Link {
                    prev: SENTINEL,
                    next: SENTINEL,
                    generation: 0,
                    event: None,
                });
                (self.links.len() - 1) as u32
            }
        };

        let last = self.links[SENTINEL as usize].prev;
        let link = &mut self.links[index as usize];
        link.generation = link.generation.wrapping_add(1);
        link.prev = last;
        link.next = SENTINEL;
        link.event = Some(event);
        let generation = link.generation;

        self.links[last as usize].next = index;
        self.links[SENTINEL as usize].prev = index;
        self.len += 1;

        WaitToken { index, generation }
    }

    fn unlink(&mut self, index: u32) -> Arc<E> {
        debug_assert_ne!(index, SENTINEL);
        let (prev, next) = {
            let link = &self.links[index as usize];
            (link.prev, link.next)
        };
        self.links[prev as usize].next = next;
        self.links[next as usize].prev = prev;
        self.len -= 1;
        self.free.push(index);

        let link = &mut self.links[index as usize];
        link.prev = index;
        link.next = index;
        link.event
            .take()
            .expect("linked wait node must carry an event")
    }

    /// Unlinks the oldest waiter.
    fn pop_front(&mut self) -> Option<Arc<E>> {
        let first = self.links[SENTINEL as usize].next;
        if first == SENTINEL {
            None
        } else {
            Some(self.unlink(first))
        }
    }

    /// Unlinks `token` if it is still linked. Returns false if a notifier got to it first.
    fn remove(&mut self, token: WaitToken) -> bool {
        let link = &self.links[token.index as usize];
        if link.generation != token.generation || link.event.is_none() {
            return false;
        }
        self.unlink(token.index);
        true
    }
}

/// A FIFO condition variable for use with a caller-owned [`parking_lot::Mutex`].
///
/// Unlike `parking_lot::Condvar`, the blocking itself goes through a [`RawEvent`] (a futex word
/// by default), one per waiting thread. [`notify_one`](Self::notify_one) always wakes the
/// longest-waiting thread.
pub struct WaitQueue<E: RawEvent = Event> {
    list: Mutex<WaitList<E>>,
}

impl WaitQueue<Event> {
    pub fn new() -> Self {
        Self::with_event()
    }
}

impl<E: RawEvent> WaitQueue<E> {
    /// Creates an empty queue whose waiters block on events of type `E`.
    pub fn with_event() -> Self {
        Self {
            list: Mutex::new(WaitList::new()),
        }
    }

    /// Releases the mutex behind `guard`, blocks until notified or until `timeout` elapses,
    /// then re-acquires the mutex.
    ///
    /// The mutex is held again when this returns, whatever the outcome.
    pub fn wait<T>(
        &self,
        guard: &mut MutexGuard<'_, T>,
        timeout: Option<Duration>,
    ) -> Result<WaitOutcome, WaitError> {
        let deadline = timeout.and_then(|timeout| Instant::now().checked_add(timeout));
        self.wait_until(guard, deadline)
    }

    /// Like [`wait`](Self::wait), with an absolute deadline.
    pub fn wait_until<T>(
        &self,
        guard: &mut MutexGuard<'_, T>,
        deadline: Option<Instant>,
    ) -> Result<WaitOutcome, WaitError> {
        let event = Arc::new(E::new().map_err(WaitError::EventCreation)?);

        // Link first, then let go of the caller's mutex.
        let token = self.list.lock().push_back(event.clone());
        let status = MutexGuard::unlocked(guard, || event.wait_until(deadline));

        let self_unlinked = self.list.lock().remove(token);
        drop(event);

        if !self_unlinked {
            return Ok(WaitOutcome::Notified);
        }
        match status {
            EventStatus::Signaled => Ok(WaitOutcome::Notified),
            EventStatus::TimedOut => {
                log::trace!("wait queue: waiter timed out, unlinked itself");
                Ok(WaitOutcome::TimedOut)
            }
            EventStatus::Failed(err) => {
                log::debug!("wait queue: event wait failed ({err}), unlinked waiter");
                Err(WaitError::Os(err))
            }
        }
    }

    /// Wakes the longest-waiting thread. Returns false if nobody was waiting.
    ///
    /// The caller is expected to hold the mutex the waiters passed to [`wait`](Self::wait).
    pub fn notify_one(&self) -> bool {
        let mut list = self.list.lock();
        match list.pop_front() {
            Some(event) => {
                event.set();
                true
            }
            None => false,
        }
    }

    /// Wakes every thread currently waiting. Returns how many were woken.
    pub fn notify_all(&self) -> usize {
        let mut list = self.list.lock();
        let mut woken = 0;
        while let Some(event) = list.pop_front() {
            event.set();
            woken += 1;
        }
        woken
    }

    pub fn waiter_count(&self) -> usize {
        self.list.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.list.lock().is_empty()
    }

    /// Destroys the queue.
    ///
    /// # Panics
    ///
    /// Panics if any thread is still waiting.
    pub fn destroy(self) {
        drop(self);
    }
}

impl<E: RawEvent> Default for WaitQueue<E> {
    fn default() -> Self {
        Self::with_event()
    }
}

impl<E: RawEvent> Drop for WaitQueue<E> {
    fn drop(&mut self) {
        let waiters = self.list.get_mut().len;
        if waiters != 0 {
            log::error!("wait queue destroyed with {waiters} active waiter(s)");
            if std::thread::panicking() {
                std::process::abort();
            }
            panic!("wait queue destroyed with {waiters} active waiter(s)");
        }
    }
}

impl<E: RawEvent> fmt::Debug for WaitQueue<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitQueue")
            .field("waiters", &self.waiter_count())
            .finish()
    }
}
