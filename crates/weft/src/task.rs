// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Task bookkeeping.
//!
//! A task owns its stack and lives at the top of it; everything else in
//! this structure is membership bookkeeping for the runtime's lists.
//! The value buffer is the landing zone for channel messages whose
//! destination is only known once the task resumes: small values use
//! the inline array, larger ones spill to the heap.

use std::os::fd::RawFd;

use crate::choose::ChooseData;
use crate::ctx::Context;
use crate::list::SListItem;
use crate::timer::Timer;

/// Inline capacity of the per-task value buffer.
pub(crate) const VALBUF_SIZE: usize = 128;

/// What a task is currently blocked on (or not).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum State {
    /// In the ready queue, waiting for the CPU.
    Ready,
    /// Executing right now.
    Running,
    /// In the timer list.
    Sleeping,
    /// Registered with the poller.
    FdWaiting,
    /// Blocked on a channel operation (send, recv or choose).
    ChanOp,
}

/// Identifier of a spawned task, unique within the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(pub(crate) u64);

impl TaskId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

pub(crate) struct Task {
    pub(crate) id: u64,
    pub(crate) state: State,
    /// Set while the task sits in the ready queue; guards double resume.
    pub(crate) is_ready: bool,
    /// Ready-queue link.
    pub(crate) ready_item: SListItem,
    /// Timer-list membership and deadline.
    pub(crate) timer: Timer,
    /// Scratch state of an in-progress choose operation.
    pub(crate) choose: ChooseData,
    /// Saved execution state while the task is not running.
    pub(crate) ctx: Context,
    /// Value handed over by whoever resumes the task.
    pub(crate) result: i32,
    /// Fd this task is registered with in the poller, -1 if none.
    pub(crate) fd: RawFd,
    /// Inline part of the value buffer.
    pub(crate) valbuf_inline: [u8; VALBUF_SIZE],
    /// Heap spill-over for values larger than the inline buffer.
    pub(crate) valbuf_heap: Vec<u8>,
    /// Task-local storage slot.
    pub(crate) cls: *mut libc::c_void,
    /// Top of the stack allocation this task lives in; null for the
    /// main task, whose stack belongs to the OS thread.
    pub(crate) stack_top: *mut u8,
    /// Entry point, consumed by the trampoline on first run.
    pub(crate) body: Option<Box<dyn FnOnce()>>,
}

impl Task {
    pub(crate) fn new(id: u64, stack_top: *mut u8, body: Option<Box<dyn FnOnce()>>) -> Self {
        Self {
            id,
            state: State::Ready,
            is_ready: false,
            ready_item: SListItem::new(),
            timer: Timer::new(),
            choose: ChooseData::new(),
            ctx: Context::empty(),
            result: 0,
            fd: -1,
            valbuf_inline: [0; VALBUF_SIZE],
            valbuf_heap: Vec::new(),
            cls: std::ptr::null_mut(),
            stack_top,
            body,
        }
    }

    /// The pseudo-task representing the thread that owns the runtime.
    pub(crate) fn main() -> Self {
        let mut t = Self::new(0, std::ptr::null_mut(), None);
        t.state = State::Running;
        t
    }

    /// Pointer to a value buffer at least `size` bytes long.
    pub(crate) fn valbuf(&mut self, size: usize) -> *mut u8 {
        if size <= VALBUF_SIZE {
            return self.valbuf_inline.as_mut_ptr();
        }
        if self.valbuf_heap.len() < size {
            self.valbuf_heap.resize(size, 0);
        }
        self.valbuf_heap.as_mut_ptr()
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("fd", &self.fd)
            .finish()
    }
}
