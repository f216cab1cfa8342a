// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! The scheduler.
//!
//! Single-threaded, cooperative, run-to-suspension. The head of the
//! ready queue is the running task; suspension pops it, resumption
//! appends at the tail. Every OS thread that touches the runtime gets
//! its own independent instance, held in thread-local storage.

use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;

use log::trace;

use crate::ctx::Context;
use crate::error::Error;
use crate::list::{cont, List, SList};
use crate::poller::{self, Pollset};
use crate::stack::StackCache;
use crate::task::{State, Task, TaskId};
use crate::timer;

/// Force a non-blocking poll after this many suspensions, so fd events
/// and timers are noticed even when the ready queue never drains.
const POLL_TICK: u32 = 103;

pub(crate) struct Runtime {
    /// Tasks eligible to run, FIFO.
    pub(crate) ready: SList,
    /// The task executing right now; null only inside the scheduler
    /// while a finished task's successor is being picked.
    pub(crate) running: *mut Task,
    /// Pseudo-task for the thread that owns this runtime.
    main: *mut Task,
    /// Suspensions since the last poll.
    counter: u32,
    /// Pending timers, ordered by expiry.
    pub(crate) timers: List,
    /// Lazily created fd poller.
    pub(crate) poller: Option<Pollset>,
    pub(crate) stacks: StackCache,
    /// Live tasks beside the main one.
    num_tasks: usize,
    next_task_id: u64,
    /// Sequence number of the choose operation being initialised.
    pub(crate) choose_seqnum: u64,
    rng: u64,
}

impl Runtime {
    fn new() -> Box<Self> {
        let main = Box::into_raw(Box::new(Task::main()));
        // Golden-ratio offset keeps the xorshift state well away from
        // the degenerate all-zeroes orbit.
        let seed = (timer::now() as u64 ^ ((unsafe { libc::getpid() } as u64) << 32))
            .wrapping_add(0x9E3779B97F4A7C15)
            | 1;
        Box::new(Self {
            ready: SList::new(),
            running: main,
            main,
            counter: 0,
            timers: List::new(),
            poller: None,
            stacks: StackCache::new(),
            num_tasks: 0,
            next_task_id: 1,
            choose_seqnum: 0,
            rng: seed,
        })
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        // Live non-main tasks (if any) leak along with their stacks;
        // the thread is going away and their fds with it.
        unsafe {
            drop(Box::from_raw(self.main));
        }
    }
}

thread_local! {
    static RT: std::cell::UnsafeCell<Option<Box<Runtime>>> =
        const { std::cell::UnsafeCell::new(None) };
}

/// This thread's runtime, created on first use. The pointer stays valid
/// for the lifetime of the thread.
pub(crate) fn rt() -> *mut Runtime {
    RT.with(|cell| {
        let slot = unsafe { &mut *cell.get() };
        match slot {
            Some(r) => &mut **r as *mut Runtime,
            None => {
                *slot = Some(Runtime::new());
                &mut **slot.as_mut().unwrap() as *mut Runtime
            }
        }
    })
}

fn xorshift64(state: &mut u64) -> u64 {
    let mut x = *state;
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    *state = x;
    x
}

/// Uniformly random number in `[0, n)`.
pub(crate) unsafe fn random_below(r: *mut Runtime, n: u64) -> u64 {
    if n <= 1 {
        return 0;
    }
    xorshift64(&mut (*r).rng) % n
}

/// Put a suspended task back on the ready queue. `result` is what the
/// task's pending `suspend` call will return.
pub(crate) unsafe fn resume(r: *mut Runtime, task: *mut Task, result: i32) {
    debug_assert!(!(*task).is_ready);
    (*task).result = result;
    (*task).state = State::Ready;
    (*task).is_ready = true;
    (*r).ready.push_back(&mut (*task).ready_item);
}

/// Suspend the running task and run whatever is ready. Returns the
/// result passed to [`resume`] once somebody resumes this task.
///
/// The caller has already parked the task wherever it is waiting (timer
/// list, poller, channel endpoint); a task parked nowhere that is also
/// never resumed is a deadlock.
pub(crate) unsafe fn suspend(r: *mut Runtime) -> i32 {
    // Even a CPU-bound ready queue must observe external events from
    // time to time.
    if (*r).counter >= POLL_TICK {
        poller::wait(r, false);
        (*r).counter = 0;
    }
    let this = (*r).running;
    loop {
        if !(*r).ready.is_empty() {
            (*r).counter += 1;
            let item = (*r).ready.pop();
            let next = cont!(item, Task, ready_item);
            debug_assert!((*next).is_ready);
            (*next).is_ready = false;
            (*next).state = State::Running;
            (*r).running = next;
            if this.is_null() {
                // A finished task's stack is already in the cache; jump
                // away without saving anything.
                Context::set(&(*next).ctx);
            }
            if next != this {
                Context::swap(&mut (*this).ctx, &(*next).ctx);
            }
            return (*this).result;
        }
        // Nothing ready: wait for timers and fd events.
        poller::wait(r, true);
        debug_assert!(!(*r).ready.is_empty());
        (*r).counter = 0;
    }
}

extern "C" fn task_trampoline() {
    unsafe {
        let r = rt();
        let task = (*r).running;
        let body = (*task).body.take().expect("task started twice");
        // The bottom of a task stack is not unwindable; a panic that
        // escapes the task body takes the process down, like any other
        // contract violation.
        if panic::catch_unwind(AssertUnwindSafe(body)).is_err() {
            eprintln!("weft: task {{{}}} panicked; aborting", (*task).id);
            std::process::abort();
        }
        epilogue(r);
    }
}

/// Tear down the finished running task and move on. Actual release of
/// the memory we are executing on is deferred: the stack goes to the
/// cache and only a different, older stack may be freed.
unsafe fn epilogue(r: *mut Runtime) -> ! {
    let task = (*r).running;
    trace!("{{{}}} done", (*task).id);
    let top = (*task).stack_top;
    ptr::drop_in_place(task);
    (*r).num_tasks -= 1;
    (*r).stacks.free(top);
    (*r).running = ptr::null_mut();
    suspend(r);
    unreachable!("dead task rescheduled");
}

/// Start a new task. The child runs immediately; the caller is pushed
/// to the tail of the ready queue and resumes once the queue comes
/// around to it.
pub fn spawn<F>(body: F) -> Result<TaskId, Error>
where
    F: FnOnce() + 'static,
{
    unsafe {
        let r = rt();
        let top = (*r).stacks.alloc()?;
        let total = (*r).stacks.total_size();
        let page = (*r).stacks.page_size();
        let base = top.sub(total);

        // The task record lives at the top of its own stack; the usable
        // stack runs from just above the guard page to the record.
        let tsize = mem::size_of::<Task>();
        let talign = mem::align_of::<Task>();
        let task = ((top as usize - tsize) & !(talign - 1)) as *mut Task;
        let stack_lo = base.add(page);
        let stack_len = task as usize - stack_lo as usize;

        let id = (*r).next_task_id;
        (*r).next_task_id += 1;
        ptr::write(task, Task::new(id, top, Some(Box::new(body))));
        (*task).ctx.init(stack_lo, stack_len, task_trampoline);
        (*r).num_tasks += 1;
        trace!("{{{}}}=spawn()", id);

        let parent = (*r).running;
        resume(r, parent, 0);
        (*r).running = task;
        (*task).state = State::Running;
        Context::swap(&mut (*parent).ctx, &(*task).ctx);
        Ok(TaskId(id))
    }
}

/// Move the running task to the back of the ready queue and let the
/// head run. A no-op when nothing else is ready.
pub fn yield_now() {
    unsafe {
        let r = rt();
        trace!("yield()");
        // Resuming the running task before suspending it is fine: the
        // pop in suspend() notices when it picked the caller itself.
        resume(r, (*r).running, 0);
        suspend(r);
    }
}

/// The running task's local storage slot.
pub fn task_local() -> *mut libc::c_void {
    unsafe { (*(*rt()).running).cls }
}

/// Set the running task's local storage slot.
pub fn set_task_local(val: *mut libc::c_void) {
    unsafe {
        (*(*rt()).running).cls = val;
    }
}

/// Warm the runtime up front: initialise the poller and preallocate
/// `count` stacks of `stack_size` bytes. Only allowed while the main
/// task is the sole task.
pub fn prepare(count: usize, stack_size: usize) -> Result<(), Error> {
    unsafe {
        let r = rt();
        if (*r).num_tasks > 0 {
            return Err(Error::Busy);
        }
        poller::init(r)?;
        (*r).stacks.prepare(count, stack_size)
    }
}

/// Outcome of [`fork`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkResult {
    /// In the parent; carries the child's pid.
    Parent(libc::pid_t),
    /// In the child, running on a fresh scheduler.
    Child,
}

/// Fork the process. The parent is undisturbed. In the child the
/// calling task becomes the only task: the ready queue and timer list
/// are dropped and the poller is recreated on next use.
pub fn fork() -> Result<ForkResult, Error> {
    unsafe {
        let r = rt();
        let pid = libc::fork();
        if pid < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        if pid > 0 {
            return Ok(ForkResult::Parent(pid));
        }
        // Child: every task but the running one is gone. Their stacks
        // leak, which is fine; the address space is a copy.
        (*r).ready.clear();
        (*r).num_tasks = 0;
        timer::postfork(r);
        // Closing the inherited pollset fd detaches the child from the
        // parent's kernel state; a fresh one appears on next use.
        (*r).poller = None;
        Ok(ForkResult::Child)
    }
}
