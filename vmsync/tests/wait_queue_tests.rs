use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use errno::Errno;
use parking_lot::Mutex;
use vmsync::sync::{EventStatus, RawEvent};
use vmsync::{WaitError, WaitOutcome, WaitQueue};

const LONG_WAIT: Duration = Duration::from_secs(10);

/// Polls `condition` until it holds or `timeout` passes.
fn eventually(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    condition()
}

#[test]
fn timed_wait_without_notify_times_out_holding_mutex() {
    let queue = WaitQueue::new();
    let mutex = Mutex::new(0);
    let mut guard = mutex.lock();

    let start = Instant::now();
    let outcome = queue.wait(&mut guard, Some(Duration::from_millis(50))).unwrap();
    let elapsed = start.elapsed();

    assert_eq!(outcome, WaitOutcome::TimedOut);
    assert!(elapsed >= Duration::from_millis(50));
    assert!(elapsed <= Duration::from_millis(200), "took {elapsed:?}");
    assert!(mutex.is_locked());
    *guard += 1;
    assert!(queue.is_empty());
}

#[test]
fn notify_without_waiters_is_a_no_op() {
    let queue = WaitQueue::new();
    assert!(!queue.notify_one());
    assert_eq!(queue.notify_all(), 0);
    assert_eq!(queue.waiter_count(), 0);
    queue.destroy();
}

#[test]
fn notify_one_wakes_the_oldest_waiter() {
    let queue = Arc::new(WaitQueue::new());
    let woken = Arc::new(Mutex::new(Vec::new()));

    let spawn_waiter = |id: u32| {
        let queue = queue.clone();
        let woken = woken.clone();
        thread::spawn(move || {
            let mut guard = woken.lock();
            let outcome = queue.wait(&mut guard, Some(LONG_WAIT)).unwrap();
            guard.push(id);
            outcome
        })
    };

    let first = spawn_waiter(1);
    assert!(eventually(LONG_WAIT, || queue.waiter_count() == 1));
    let second = spawn_waiter(2);
    assert!(eventually(LONG_WAIT, || queue.waiter_count() == 2));

    {
        let _guard = woken.lock();
        assert!(queue.notify_one());
    }
    assert!(eventually(LONG_WAIT, || woken.lock().len() == 1));
    assert_eq!(*woken.lock(), vec![1]);
    assert_eq!(queue.waiter_count(), 1);

    {
        let _guard = woken.lock();
        assert!(queue.notify_one());
    }
    assert_eq!(first.join().unwrap(), WaitOutcome::Notified);
    assert_eq!(second.join().unwrap(), WaitOutcome::Notified);
    assert_eq!(*woken.lock(), vec![1, 2]);
}

#[test]
fn notify_after_waiter_links_is_never_lost() {
    for _ in 0..100 {
        let queue = Arc::new(WaitQueue::new());
        let state = Arc::new(Mutex::new(false));

        let waiter = {
            let queue = queue.clone();
            let state = state.clone();
            thread::spawn(move || {
                let mut ready = state.lock();
                let mut outcome = WaitOutcome::TimedOut;
                while !*ready {
                    outcome = queue.wait(&mut ready, Some(LONG_WAIT)).unwrap();
                }
                outcome
            })
        };

        // The waiter is linked before it lets go of the mutex, so once it shows up in the
        // queue the notifier below cannot slip in between.
        assert!(eventually(LONG_WAIT, || queue.waiter_count() == 1));
        {
            let mut ready = state.lock();
            *ready = true;
            queue.notify_one();
        }

        let start = Instant::now();
        while !waiter.is_finished() {
            assert!(start.elapsed() < Duration::from_millis(100), "waiter missed its wakeup");
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(waiter.join().unwrap(), WaitOutcome::Notified);
    }
}

#[test]
fn notify_all_wakes_current_waiters_only() {
    const WAITERS: usize = 6;
    let queue = Arc::new(WaitQueue::new());
    let mutex = Arc::new(Mutex::new(()));

    let waiters: Vec<_> = (0..WAITERS)
        .map(|_| {
            let queue = queue.clone();
            let mutex = mutex.clone();
            thread::spawn(move || {
                let mut guard = mutex.lock();
                queue.wait(&mut guard, Some(LONG_WAIT)).unwrap()
            })
        })
        .collect();
    assert!(eventually(LONG_WAIT, || queue.waiter_count() == WAITERS));

    {
        let _guard = mutex.lock();
        assert_eq!(queue.notify_all(), WAITERS);
    }
    for waiter in waiters {
        assert_eq!(waiter.join().unwrap(), WaitOutcome::Notified);
    }

    // A wait that starts after notify_all returned is not affected by it.
    let mut guard = mutex.lock();
    let outcome = queue.wait(&mut guard, Some(Duration::from_millis(30))).unwrap();
    assert_eq!(outcome, WaitOutcome::TimedOut);
}

#[test]
fn timed_out_waiter_does_not_consume_a_later_notify() {
    let queue = Arc::new(WaitQueue::new());
    let mutex = Arc::new(Mutex::new(()));

    {
        let mut guard = mutex.lock();
        assert!(queue.wait(&mut guard, Some(Duration::from_millis(5))).unwrap().timed_out());
    }
    assert!(queue.is_empty());

    let waiter = {
        let queue = queue.clone();
        let mutex = mutex.clone();
        thread::spawn(move || {
            let mut guard = mutex.lock();
            queue.wait(&mut guard, Some(LONG_WAIT)).unwrap()
        })
    };
    assert!(eventually(LONG_WAIT, || queue.waiter_count() == 1));
    {
        let _guard = mutex.lock();
        assert!(queue.notify_one());
    }
    assert_eq!(waiter.join().unwrap(), WaitOutcome::Notified);
}

/// Event whose wait always fails, as if the OS primitive broke.
struct BrokenEvent;

impl RawEvent for BrokenEvent {
    fn new() -> Result<Self, Errno> {
        Ok(BrokenEvent)
    }

    fn set(&self) {}

    fn reset(&self) {}

    fn is_set(&self) -> bool {
        false
    }

    fn wait_until(&self, _deadline: Option<Instant>) -> EventStatus {
        EventStatus::Failed(Errno(libc::EIO))
    }
}

#[test]
fn os_failure_unlinks_waiter_and_restores_mutex() {
    let queue = WaitQueue::<BrokenEvent>::with_event();
    let mutex = Mutex::new(());
    let mut guard = mutex.lock();

    let result = queue.wait(&mut guard, None);

    assert_eq!(result, Err(WaitError::Os(Errno(libc::EIO))));
    assert!(mutex.is_locked());
    assert!(queue.is_empty());
    assert!(!queue.notify_one());
}

static CREATION_FAILS: AtomicBool = AtomicBool::new(true);

struct UncreatableEvent;

impl RawEvent for UncreatableEvent {
    fn new() -> Result<Self, Errno> {
        if CREATION_FAILS.load(Ordering::Relaxed) {
            Err(Errno(libc::ENOMEM))
        } else {
            Ok(UncreatableEvent)
        }
    }

    fn set(&self) {}

    fn reset(&self) {}

    fn is_set(&self) -> bool {
        false
    }

    fn wait_until(&self, _deadline: Option<Instant>) -> EventStatus {
        EventStatus::TimedOut
    }
}

#[test]
fn event_creation_failure_leaves_everything_untouched() {
    let queue = WaitQueue::<UncreatableEvent>::with_event();
    let mutex = Mutex::new(());
    let mut guard = mutex.lock();

    let result = queue.wait(&mut guard, Some(Duration::from_millis(1)));
    assert_eq!(result, Err(WaitError::EventCreation(Errno(libc::ENOMEM))));
    assert!(mutex.is_locked());
    assert!(queue.is_empty());
}
