//! Manual-reset waitable events.
//!
//! An event is a boolean that starts unset; [`RawEvent::set`] wakes every thread blocked in
//! [`RawEvent::wait_until`] and leaves the event set until [`RawEvent::reset`]. The wait queue
//! creates one per blocked thread.
//!
//! On Linux and Android [`Event`] is a single futex word. Elsewhere it falls back to a
//! `parking_lot` mutex and condition variable.
use std::time::Instant;

use errno::Errno;

/// Outcome of blocking on an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    Signaled,
    TimedOut,
    Failed(Errno),
}

pub trait RawEvent: Sized + Send + Sync {
    /// Creates an event in the unset state.
    fn new() -> Result<Self, Errno>;

    /// Sets the event and wakes all waiters.
    fn set(&self);

    fn reset(&self);

    fn is_set(&self) -> bool;

    /// Blocks until the event is set or `deadline` passes. Never returns `Signaled` spuriously.
    fn wait_until(&self, deadline: Option<Instant>) -> EventStatus;
}

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        use std::ptr;
        use std::sync::atomic::{AtomicU32, Ordering};
        use std::time::Duration;

        const UNSET: u32 = 0;
        const SET: u32 = 1;

        pub struct Event {
            state: AtomicU32,
        }

        impl Event {
            fn futex_wait(&self, timeout: Option<Duration>) -> Result<(), Errno> {
                let timespec = timeout.map(|timeout| libc::timespec {
                    tv_sec: timeout.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
                    tv_nsec: timeout.subsec_nanos() as _,
                });
                let timespec_ptr = timespec
                    .as_ref()
                    .map_or(ptr::null(), |t| t as *const libc::timespec);
                let result = unsafe {
                    libc::syscall(
                        libc::SYS_futex,
                        self.state.as_ptr(),
                        libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
                        UNSET,
                        timespec_ptr,
                    )
                };
                if result == -1 {
                    Err(errno::errno())
                } else {
                    Ok(())
                }
            }

            fn futex_wake_all(&self) {
                let result = unsafe {
                    libc::syscall(
                        libc::SYS_futex,
                        self.state.as_ptr(),
                        libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
                        i32::MAX,
                    )
                };
                if result == -1 {
                    let err = errno::errno();
                    log::error!("futex wake failed: {err}");
                    panic!("futex wake failed: {}", err);
                }
            }
        }

        impl RawEvent for Event {
            fn new() -> Result<Self, Errno> {
                Ok(Self {
                    state: AtomicU32::new(UNSET),
                })
            }

            fn set(&self) {
                if self.state.swap(SET, Ordering::Release) == UNSET {
                    self.futex_wake_all();
                }
            }

            fn reset(&self) {
                self.state.store(UNSET, Ordering::Release);
            }

            fn is_set(&self) -> bool {
                self.state.load(Ordering::Acquire) == SET
            }

            fn wait_until(&self, deadline: Option<Instant>) -> EventStatus {
                loop {
                    if self.is_set() {
                        return EventStatus::Signaled;
                    }
                    let timeout = match deadline {
                        Some(deadline) => match deadline.checked_duration_since(Instant::now()) {
                            Some(remaining) if !remaining.is_zero() => Some(remaining),
                            _ => return EventStatus::TimedOut,
                        },
                        None => None,
                    };
                    match self.futex_wait(timeout) {
                        Ok(()) => {}
                        // Woken, raced with `set`, interrupted, or timed out: re-check above.
                        Err(err) if matches!(err.0, libc::EINTR | libc::EAGAIN | libc::ETIMEDOUT) => {}
                        Err(err) => return EventStatus::Failed(err),
                    }
                }
            }
        }
    } else {
        use parking_lot::{Condvar, Mutex};

        pub struct Event {
            state: Mutex<bool>,
            cvar: Condvar,
        }

        impl RawEvent for Event {
            fn new() -> Result<Self, Errno> {
                Ok(Self {
                    state: Mutex::new(false),
                    cvar: Condvar::new(),
                })
            }

            fn set(&self) {
                let mut state = self.state.lock();
                if !*state {
                    *state = true;
                    self.cvar.notify_all();
                }
            }

            fn reset(&self) {
                *self.state.lock() = false;
            }

            fn is_set(&self) -> bool {
                *self.state.lock()
            }

            fn wait_until(&self, deadline: Option<Instant>) -> EventStatus {
                let mut state = self.state.lock();
                while !*state {
                    match deadline {
                        Some(deadline) => {
                            if self.cvar.wait_until(&mut state, deadline).timed_out() {
                                return if *state {
                                    EventStatus::Signaled
                                } else {
                                    EventStatus::TimedOut
                                };
                            }
                        }
                        None => self.cvar.wait(&mut state),
                    }
                }
                EventStatus::Signaled
            }
        }
    }
}
