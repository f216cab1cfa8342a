// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Deadline timers.
//!
//! One ordered doubly-linked list of per-task timers. Insertion walks
//! from the head, which is O(n) but the list is expected to stay short.
//! Timers that expire at the same millisecond fire in insertion order.

use crate::list::{list_next, List, ListItem};
use crate::sched::Runtime;
use crate::task::Task;

/// Per-task timer state, embedded in [`Task`].
pub(crate) struct Timer {
    pub(crate) item: ListItem,
    pub(crate) expiry: i64,
    pub(crate) cb: Option<unsafe fn(*mut Task)>,
    pub(crate) armed: bool,
}

impl Timer {
    pub(crate) const fn new() -> Self {
        Self {
            item: ListItem::new(),
            expiry: -1,
            cb: None,
            armed: false,
        }
    }
}

/// Milliseconds on the monotonic clock.
pub fn now() -> i64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    assert_eq!(rc, 0);
    ts.tv_sec as i64 * 1000 + ts.tv_nsec as i64 / 1_000_000
}

unsafe fn owner(it: *mut ListItem) -> *mut Task {
    let off = std::mem::offset_of!(Task, timer) + std::mem::offset_of!(Timer, item);
    (it as *mut u8).sub(off) as *mut Task
}

/// Arm `task`'s timer for the absolute `deadline`.
pub(crate) unsafe fn add(
    r: *mut Runtime,
    task: *mut Task,
    deadline: i64,
    cb: unsafe fn(*mut Task),
) {
    debug_assert!(deadline >= 0);
    debug_assert!(!(*task).timer.armed);
    (*task).timer.expiry = deadline;
    (*task).timer.cb = Some(cb);
    // Walk to the first strictly later deadline; ties keep insertion
    // order, so earlier registrations fire first.
    let mut it = (*r).timers.begin();
    while !it.is_null() {
        if (*owner(it)).timer.expiry > deadline {
            break;
        }
        it = list_next(it);
    }
    (*r).timers.insert(&mut (*task).timer.item, it);
    (*task).timer.armed = true;
}

/// Disarm a timer that has not fired.
pub(crate) unsafe fn rm(r: *mut Runtime, task: *mut Task) {
    debug_assert!((*task).timer.armed);
    (*r).timers.erase(&mut (*task).timer.item);
    (*task).timer.armed = false;
    (*task).timer.expiry = -1;
    (*task).timer.cb = None;
}

/// Milliseconds until the nearest deadline, 0 if it already passed,
/// -1 if no timer is armed.
pub(crate) unsafe fn next(r: *mut Runtime) -> i32 {
    if (*r).timers.is_empty() {
        return -1;
    }
    let expiry = (*owner((*r).timers.begin())).timer.expiry;
    let nw = now();
    if nw >= expiry {
        0
    } else {
        (expiry - nw) as i32
    }
}

/// Fire every expired timer. Returns whether any fired.
pub(crate) unsafe fn fire(r: *mut Runtime) -> bool {
    if (*r).timers.is_empty() {
        return false;
    }
    let nw = now();
    let mut fired = false;
    while !(*r).timers.is_empty() {
        let task = owner((*r).timers.begin());
        if (*task).timer.expiry > nw {
            break;
        }
        (*r).timers.erase(&mut (*task).timer.item);
        (*task).timer.armed = false;
        (*task).timer.expiry = -1;
        let cb = (*task).timer.cb.take().expect("armed timer without callback");
        cb(task);
        fired = true;
    }
    fired
}

/// Drop all timers; used in the child after fork.
pub(crate) unsafe fn postfork(r: *mut Runtime) {
    (*r).timers = List::new();
}
