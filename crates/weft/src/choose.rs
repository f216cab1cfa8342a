// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Multi-way selection over channel operations.
//!
//! A choose runs in three passes: scan the clauses for ones that could
//! proceed right now, commit (random pick among the available ones, the
//! otherwise branch, or block with every clause linked into its
//! endpoint), and clean up once the task resumes. Cleanup happens on
//! the waking side: whoever resumes the task unlinks its clauses first,
//! so a returned choose leaves nothing behind.

use std::marker::PhantomData;
use std::mem::{self, MaybeUninit};
use std::ptr;

use log::trace;

use crate::chan::{dequeue, enqueue, getchan, Chan, Clause, Ep, EpKind, RawChan};
use crate::list::{cont, slist_next, SList};
use crate::sched::{random_below, resume, rt, suspend, Runtime};
use crate::task::{State, Task};
use crate::timer;

/// Per-task scratch for the choose in progress, embedded in the task.
pub(crate) struct ChooseData {
    /// Clauses of the current choose, in declaration order.
    pub(crate) clauses: SList,
    /// An otherwise branch is present.
    pub(crate) othws: bool,
    /// Deadline of the current choose, -1 if none.
    pub(crate) ddline: i64,
    /// Clauses that were immediately available at registration.
    pub(crate) available: u32,
}

impl ChooseData {
    pub(crate) const fn new() -> Self {
        Self {
            clauses: SList::new(),
            othws: false,
            ddline: -1,
            available: 0,
        }
    }
}

pub(crate) unsafe fn choose_init(r: *mut Runtime, task: *mut Task) {
    (*task).choose.clauses.clear();
    (*task).choose.othws = false;
    (*task).choose.ddline = -1;
    (*task).choose.available = 0;
    (*r).choose_seqnum += 1;
}

/// Track how many clauses of the choose being initialised refer to the
/// same endpoint; the blocking pass uses the count to pick one sibling
/// at random.
unsafe fn ep_register(r: *mut Runtime, ep: *mut Ep) {
    if (*ep).seqnum == (*r).choose_seqnum {
        (*ep).refs += 1;
        return;
    }
    (*ep).seqnum = (*r).choose_seqnum;
    (*ep).refs = 1;
    (*ep).tmp = -1;
}

/// Register a receive clause.
pub(crate) unsafe fn choose_in(
    r: *mut Runtime,
    task: *mut Task,
    cl: *mut Clause,
    ch: *mut RawChan,
    idx: i32,
) {
    let available =
        (*ch).done || !(*ch).sender.clauses.is_empty() || (*ch).items > 0;
    if available {
        (*task).choose.available += 1;
    }
    // Once something is available the clauses that are not can never be
    // picked; skip the bookkeeping for them entirely.
    if !available && (*task).choose.available > 0 {
        return;
    }
    (*cl).task = task;
    (*cl).ep = &mut (*ch).receiver;
    (*cl).val = ptr::null_mut();
    (*cl).idx = idx;
    (*cl).available = available;
    (*cl).used = true;
    (*task).choose.clauses.push_back(&mut (*cl).ch_item);
    ep_register(r, (*cl).ep);
}

/// Register a send clause; `val` points at `sz` bytes owned elsewhere.
pub(crate) unsafe fn choose_out(
    r: *mut Runtime,
    task: *mut Task,
    cl: *mut Clause,
    ch: *mut RawChan,
    val: *mut u8,
    idx: i32,
) {
    if (*ch).done {
        panic!("send to a done-with channel");
    }
    let available = !(*ch).receiver.clauses.is_empty() || (*ch).items < (*ch).bufsz;
    if available {
        (*task).choose.available += 1;
    }
    if !available && (*task).choose.available > 0 {
        return;
    }
    (*cl).task = task;
    (*cl).ep = &mut (*ch).sender;
    (*cl).val = val;
    (*cl).idx = idx;
    (*cl).available = available;
    (*cl).used = true;
    (*task).choose.clauses.push_back(&mut (*cl).ch_item);
    ep_register(r, (*cl).ep);
}

/// Deadline expired: unlink whatever was linked and wake with -1.
unsafe fn choose_deadline_cb(task: *mut Task) {
    let r = rt();
    let mut it = (*task).choose.clauses.begin();
    while !it.is_null() {
        let cl = cont!(it, Clause, ch_item);
        if (*cl).used {
            (*(*cl).ep).clauses.erase(&mut (*cl).ep_item);
        }
        it = slist_next(it);
    }
    (*task).choose.ddline = -1;
    resume(r, task, -1);
}

/// Commit the choose and block if necessary. Returns the index of the
/// clause that fired, or -1 for the otherwise/deadline outcome.
pub(crate) unsafe fn choose_wait(r: *mut Runtime, task: *mut Task) -> i32 {
    // Something can proceed right now: pick uniformly among the
    // available clauses, execute the transfer and schedule ourselves
    // so the FIFO stays honest.
    if (*task).choose.available > 0 {
        let mut chosen = random_below(r, (*task).choose.available as u64) as u32;
        let mut it = (*task).choose.clauses.begin();
        let mut cl: *mut Clause = ptr::null_mut();
        while !it.is_null() {
            cl = cont!(it, Clause, ch_item);
            if (*cl).available {
                if chosen == 0 {
                    break;
                }
                chosen -= 1;
            }
            it = slist_next(it);
        }
        debug_assert!(!cl.is_null());
        let ch = getchan((*cl).ep);
        match (*(*cl).ep).kind {
            EpKind::Sender => enqueue(r, ch, (*cl).val),
            EpKind::Receiver => {
                let dst = (*task).valbuf((*ch).sz);
                dequeue(r, ch, dst);
            }
        }
        resume(r, task, (*cl).idx);
        return suspend(r);
    }

    if (*task).choose.othws {
        resume(r, task, -1);
        return suspend(r);
    }

    if (*task).choose.ddline >= 0 {
        timer::add(r, task, (*task).choose.ddline, choose_deadline_cb);
    }

    // Block: link each clause into its endpoint. When several clauses
    // of this choose target the same endpoint, pre-commit to a random
    // sibling now; the peer later pops the head of the endpoint list,
    // which keeps inter-task order FIFO and intra-task choice fair.
    let mut it = (*task).choose.clauses.begin();
    while !it.is_null() {
        let cl = cont!(it, Clause, ch_item);
        it = slist_next(it);
        let ep = (*cl).ep;
        if (*ep).refs > 1 {
            if (*ep).tmp == -1 {
                (*ep).tmp = random_below(r, (*ep).refs as u64) as i32;
            }
            if (*ep).tmp != 0 {
                (*ep).tmp -= 1;
                (*cl).used = false;
                continue;
            }
            (*ep).tmp = -2;
        }
        (*ep).clauses.insert(&mut (*cl).ep_item, ptr::null_mut());
    }
    suspend(r)
}

unsafe fn payload_fin<T>(p: *mut u8, fired: bool) {
    let mut b = Box::from_raw(p as *mut MaybeUninit<T>);
    if !fired {
        // The value never left; drop it before the slot goes away.
        ptr::drop_in_place(b.as_mut_ptr());
    }
    // Dropping the box frees the slot without touching the value.
}

unsafe fn deliver_into<T>(slot: *mut u8, src: *mut u8) {
    // The source is the task's value buffer: plain bytes, unaligned.
    let v = ptr::read_unaligned(src as *const T);
    *(slot as *mut Option<T>) = Some(v);
}

enum Dir {
    Send,
    Recv,
}

struct Entry {
    ch: *mut RawChan,
    dir: Dir,
    /// Boxed `MaybeUninit<T>` holding a pending send value.
    payload: *mut u8,
    payload_fin: Option<unsafe fn(*mut u8, bool)>,
    /// `&mut Option<T>` receiving slot.
    slot: *mut u8,
    deliver: Option<unsafe fn(*mut u8, *mut u8)>,
    fired: bool,
    clause: Clause,
}

/// Builder for a multi-way channel operation.
///
/// Clauses are numbered in the order they are added, starting at 0;
/// [`Choose::wait`] returns the number of the clause that fired, or -1
/// when the otherwise branch or the deadline did. At most one of
/// `otherwise` and `deadline` may be given.
///
/// ```no_run
/// use weft::{Chan, Choose};
///
/// let ch: Chan<i32> = Chan::new(0);
/// let mut got: Option<i32> = None;
/// let idx = Choose::new()
///     .recv(&ch, &mut got)
///     .otherwise()
///     .wait();
/// assert_eq!(idx, -1);
/// ```
pub struct Choose<'a> {
    entries: Vec<Entry>,
    othws: bool,
    ddline: i64,
    _marker: PhantomData<&'a mut ()>,
}

impl<'a> Choose<'a> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            othws: false,
            ddline: -1,
            _marker: PhantomData,
        }
    }

    /// Add a receive clause. If it fires, the received value shows up
    /// in `slot`.
    pub fn recv<T: 'static>(mut self, ch: &'a Chan<T>, slot: &'a mut Option<T>) -> Self {
        *slot = None;
        self.entries.push(Entry {
            ch: ch.raw(),
            dir: Dir::Recv,
            payload: ptr::null_mut(),
            payload_fin: None,
            slot: slot as *mut Option<T> as *mut u8,
            deliver: Some(deliver_into::<T>),
            fired: false,
            clause: Clause::new(),
        });
        self
    }

    /// Add a send clause. The value is consumed if the clause fires and
    /// dropped otherwise.
    pub fn send<T: 'static>(mut self, ch: &'a Chan<T>, val: T) -> Self {
        let payload = Box::into_raw(Box::new(MaybeUninit::new(val))) as *mut u8;
        self.entries.push(Entry {
            ch: ch.raw(),
            dir: Dir::Send,
            payload,
            payload_fin: Some(payload_fin::<T>),
            slot: ptr::null_mut(),
            deliver: None,
            fired: false,
            clause: Clause::new(),
        });
        self
    }

    /// Fire immediately with -1 when no clause can proceed.
    pub fn otherwise(mut self) -> Self {
        if self.othws || self.ddline >= 0 {
            panic!("multiple otherwise/deadline branches in one choose");
        }
        self.othws = true;
        self
    }

    /// Fire with -1 once the monotonic clock passes `deadline`. A
    /// negative deadline can never fire and is ignored.
    pub fn deadline(mut self, deadline: i64) -> Self {
        if self.othws || self.ddline >= 0 {
            panic!("multiple otherwise/deadline branches in one choose");
        }
        if deadline >= 0 {
            self.ddline = deadline;
        }
        self
    }

    /// Run the choose to completion.
    pub fn wait(mut self) -> i32 {
        unsafe {
            let r = rt();
            let task = (*r).running;
            trace!("choose()");
            (*task).state = State::ChanOp;
            choose_init(r, task);
            let mut entries = mem::take(&mut self.entries);
            let othws = self.othws;
            let ddline = self.ddline;
            drop(self);
            for (i, e) in entries.iter_mut().enumerate() {
                match e.dir {
                    Dir::Recv => choose_in(r, task, &mut e.clause, e.ch, i as i32),
                    Dir::Send => choose_out(r, task, &mut e.clause, e.ch, e.payload, i as i32),
                }
            }
            (*task).choose.othws = othws;
            (*task).choose.ddline = ddline;
            let idx = choose_wait(r, task);
            if idx >= 0 {
                let e = &mut entries[idx as usize];
                e.fired = true;
                if let Dir::Recv = e.dir {
                    let src = (*task).valbuf((*e.ch).sz);
                    (e.deliver.expect("receive clause without delivery"))(e.slot, src);
                }
            }
            for e in entries.iter_mut() {
                if let Some(fin) = e.payload_fin.take() {
                    fin(e.payload, e.fired);
                }
            }
            idx
        }
    }
}

impl Default for Choose<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Choose<'_> {
    fn drop(&mut self) {
        // A choose that was built but never waited on still owns its
        // pending send values.
        unsafe {
            for e in self.entries.iter_mut() {
                if let Some(fin) = e.payload_fin.take() {
                    fin(e.payload, e.fired);
                }
            }
        }
    }
}
