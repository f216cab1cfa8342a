// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Fd readiness and deadlines.
//!
//! The poller turns kernel readiness and timer expiry into task
//! resumptions. Three interchangeable backends share one contract
//! (`add`/`rm`/`clean`/`wait`); the choice is made at compile time and
//! nothing above this module depends on which one is in use:
//! - `epoll`  — Linux
//! - `kqueue` — BSD / macOS
//! - `poll`   — portable fallback, or forced with the `portable-poll`
//!   feature

use std::ops::{BitOr, BitOrAssign};
use std::os::fd::RawFd;

use crate::sched::{resume, rt, suspend, Runtime};
use crate::task::{State, Task};
use crate::timer;

#[cfg(all(target_os = "linux", not(feature = "portable-poll")))]
mod epoll;
#[cfg(all(target_os = "linux", not(feature = "portable-poll")))]
pub(crate) use epoll::Pollset;

#[cfg(all(
    any(
        target_os = "macos",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "dragonfly"
    ),
    not(feature = "portable-poll")
))]
mod kqueue;
#[cfg(all(
    any(
        target_os = "macos",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "dragonfly"
    ),
    not(feature = "portable-poll")
))]
pub(crate) use kqueue::Pollset;

#[cfg(any(
    feature = "portable-poll",
    not(any(
        target_os = "linux",
        target_os = "macos",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "dragonfly"
    ))
))]
mod poll;
#[cfg(any(
    feature = "portable-poll",
    not(any(
        target_os = "linux",
        target_os = "macos",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "dragonfly"
    ))
))]
pub(crate) use poll::Pollset;

/// Set of fd readiness conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Events(i32);

impl Events {
    /// Readable.
    pub const IN: Events = Events(1);
    /// Writable.
    pub const OUT: Events = Events(2);
    /// Error condition; reported whenever the OS raises it.
    pub const ERR: Events = Events(4);

    pub const fn empty() -> Events {
        Events(0)
    }

    pub const fn from_bits(bits: i32) -> Events {
        Events(bits)
    }

    pub fn bits(self) -> i32 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: Events) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Events {
    type Output = Events;
    fn bitor(self, rhs: Events) -> Events {
        Events(self.0 | rhs.0)
    }
}

impl BitOrAssign for Events {
    fn bitor_assign(&mut self, rhs: Events) {
        self.0 |= rhs.0;
    }
}

/// Create the backend pollset if this runtime does not have one yet.
pub(crate) unsafe fn init(r: *mut Runtime) -> Result<(), crate::error::Error> {
    if (*r).poller.is_none() {
        (*r).poller = Some(Pollset::new()?);
    }
    Ok(())
}

unsafe fn fdwait_deadline_cb(task: *mut Task) {
    let r = rt();
    if (*task).fd >= 0 {
        (*r).poller.as_mut().unwrap().rm(task);
        (*task).fd = -1;
    }
    resume(r, task, -1);
}

/// Wait until `fd` is ready for any of `events`, or until `deadline`
/// passes. Returns the events observed, or an empty set on deadline.
/// A negative `fd` waits on the deadline alone; a negative `deadline`
/// waits forever. Registering a second waiter for a direction already
/// taken on the same fd is a contract violation.
pub fn fd_wait(fd: RawFd, events: Events, deadline: i64) -> Events {
    unsafe {
        let r = rt();
        init(r).expect("failed to initialise the poller");
        let task = (*r).running;
        if deadline >= 0 {
            timer::add(r, task, deadline, fdwait_deadline_cb);
        }
        if fd >= 0 {
            (*r).poller.as_mut().unwrap().add(fd, events, task);
            (*task).fd = fd;
            (*task).state = State::FdWaiting;
        } else {
            (*task).state = State::Sleeping;
        }
        let rc = suspend(r);
        if rc >= 0 {
            // Woken by the fd; the backend dropped the registration and
            // the wake path cancelled the timer.
            debug_assert!(!(*task).timer.armed);
            return Events(rc);
        }
        // Deadline expired.
        debug_assert!((*task).fd < 0);
        Events::empty()
    }
}

/// Suspend the running task until the monotonic clock reaches
/// `deadline`. Returns immediately if it already has.
pub fn msleep(deadline: i64) {
    let _ = fd_wait(-1, Events::empty(), deadline);
}

/// Drop any state the poller holds for `fd`. Must be called before the
/// fd is closed. It is a contract violation to clean an fd some task is
/// still waiting on.
pub fn fd_clean(fd: RawFd) {
    unsafe {
        let r = rt();
        if let Some(p) = (*r).poller.as_mut() {
            p.clean(fd);
        }
    }
}

/// Let timers and fd events resume tasks. With `block` set, sleeps
/// until at least one task has been resumed; otherwise polls once.
pub(crate) unsafe fn wait(r: *mut Runtime, block: bool) {
    init(r).expect("failed to initialise the poller");
    let mut fired: Vec<(*mut Task, Events)> = Vec::new();
    loop {
        let timeout = if block { timer::next(r) } else { 0 };
        if block && timeout < 0 && (*r).poller.as_ref().unwrap().waiters() == 0 {
            panic!("all tasks are blocked: nothing can ever wake them (global deadlock)");
        }
        fired.clear();
        let fd_fired = (*r).poller.as_mut().unwrap().wait(timeout, &mut fired);
        let timer_fired = timer::fire(r);
        // Expired deadlines are delivered before fd readiness. A task
        // whose deadline and readiness land in the same tick has been
        // resumed by its timer already and its staged event is dropped.
        for &(task, evs) in &fired {
            if (*task).is_ready {
                continue;
            }
            if (*task).timer.armed {
                timer::rm(r, task);
            }
            resume(r, task, evs.bits());
        }
        if !block || fd_fired || timer_fired {
            return;
        }
        // The timeout was hit but no timer was actually due; system
        // timers are not precise, poll again.
    }
}
