// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Typed channels.
//!
//! The surface is typed (`Chan<T>`), the transfer core is not: values
//! travel as `elem_size` raw bytes between clause payloads, the
//! circular buffer, and the value buffer of the task being woken. One
//! extra slot at the end of the buffer holds the terminal value set by
//! [`Chan::done`]. A channel is destroyed when its last handle is
//! dropped; dropping it while tasks still wait on it is a contract
//! violation.

use std::marker::PhantomData;
use std::mem::{self, ManuallyDrop};
use std::ptr;

use log::trace;

use crate::choose::{choose_in, choose_init, choose_out, choose_wait};
use crate::list::{cont, slist_next, List, ListItem, SListItem};
use crate::sched::{resume, rt, Runtime};
use crate::task::{State, Task};
use crate::timer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EpKind {
    Sender,
    Receiver,
}

/// One side of a channel: the list of clauses blocked on it plus the
/// bookkeeping for registration-time randomisation among sibling
/// clauses of a single choose.
pub(crate) struct Ep {
    pub(crate) kind: EpKind,
    /// Sequence number of the choose operation being initialised.
    pub(crate) seqnum: u64,
    /// Clauses of that choose which refer to this endpoint.
    pub(crate) refs: u32,
    /// Countdown to the sibling that actually gets linked.
    pub(crate) tmp: i32,
    /// Clauses waiting on this endpoint.
    pub(crate) clauses: List,
}

impl Ep {
    fn new(kind: EpKind, seqnum: u64) -> Self {
        Self {
            kind,
            seqnum,
            refs: 0,
            tmp: 0,
            clauses: List::new(),
        }
    }
}

/// One clause of a choose operation; plain send and recv are one-clause
/// chooses. Lives on the stack of the task that issued the operation.
pub(crate) struct Clause {
    /// Membership in the endpoint's waiter list.
    pub(crate) ep_item: ListItem,
    /// Membership in the issuing task's clause chain.
    pub(crate) ch_item: SListItem,
    pub(crate) task: *mut Task,
    pub(crate) ep: *mut Ep,
    /// Value to transmit; null for receive clauses.
    pub(crate) val: *mut u8,
    /// What the task's suspend call returns when this clause fires.
    pub(crate) idx: i32,
    /// The clause could proceed without blocking at registration time.
    pub(crate) available: bool,
    /// The clause is (or will be) linked into the endpoint's list and
    /// must be unlinked on cleanup.
    pub(crate) used: bool,
}

impl Clause {
    pub(crate) fn new() -> Self {
        Self {
            ep_item: ListItem::new(),
            ch_item: SListItem::new(),
            task: ptr::null_mut(),
            ep: ptr::null_mut(),
            val: ptr::null_mut(),
            idx: 0,
            available: false,
            used: false,
        }
    }
}

/// The untyped channel body.
pub(crate) struct RawChan {
    /// Bytes per message.
    pub(crate) sz: usize,
    pub(crate) sender: Ep,
    pub(crate) receiver: Ep,
    refcount: usize,
    pub(crate) done: bool,
    /// Message capacity; zero makes the channel synchronous.
    pub(crate) bufsz: usize,
    /// Messages currently buffered.
    pub(crate) items: usize,
    /// Read index into the circular buffer.
    pub(crate) first: usize,
    /// `(bufsz + 1) * sz` bytes; the extra slot holds the terminal
    /// value once the channel is done.
    buf: Vec<u8>,
    /// Drops one element in place; type-erased from the constructor.
    drop_elem: unsafe fn(*mut u8),
    /// Clones the terminal value into a destination; set by `done`.
    clone_term: Option<unsafe fn(*const u8, *mut u8)>,
}

pub(crate) unsafe fn getchan(ep: *mut Ep) -> *mut RawChan {
    match (*ep).kind {
        EpKind::Sender => cont!(ep, RawChan, sender),
        EpKind::Receiver => cont!(ep, RawChan, receiver),
    }
}

unsafe fn slot(ch: *mut RawChan, pos: usize) -> *mut u8 {
    (*ch).buf.as_mut_ptr().add(pos * (*ch).sz)
}

/// Unblock the task behind `cl`: unlink every clause of its choose that
/// made it into an endpoint list, cancel its deadline and schedule it
/// with the clause's index as the result.
pub(crate) unsafe fn unblock(r: *mut Runtime, cl: *mut Clause) {
    let task = (*cl).task;
    let mut it = (*task).choose.clauses.begin();
    while !it.is_null() {
        let itcl = cont!(it, Clause, ch_item);
        if (*itcl).used {
            (*(*itcl).ep).clauses.erase(&mut (*itcl).ep_item);
        }
        it = slist_next(it);
    }
    if (*task).choose.ddline >= 0 {
        timer::rm(r, task);
        (*task).choose.ddline = -1;
    }
    resume(r, task, (*cl).idx);
}

/// Hand a value to the channel: directly to a waiting receiver if there
/// is one, into the buffer otherwise. The caller has established that
/// one of the two is possible.
pub(crate) unsafe fn enqueue(r: *mut Runtime, ch: *mut RawChan, val: *const u8) {
    if !(*ch).receiver.clauses.is_empty() {
        debug_assert_eq!((*ch).items, 0);
        let cl = cont!((*ch).receiver.clauses.begin(), Clause, ep_item);
        let dst = (*(*cl).task).valbuf((*ch).sz);
        ptr::copy_nonoverlapping(val, dst, (*ch).sz);
        unblock(r, cl);
        return;
    }
    debug_assert!((*ch).items < (*ch).bufsz);
    let pos = ((*ch).first + (*ch).items) % (*ch).bufsz;
    ptr::copy_nonoverlapping(val, slot(ch, pos), (*ch).sz);
    (*ch).items += 1;
}

/// Take a value out of the channel into `dst`. The caller has
/// established that a value is obtainable: buffered, from a blocked
/// sender, or the terminal value of a done channel.
pub(crate) unsafe fn dequeue(r: *mut Runtime, ch: *mut RawChan, dst: *mut u8) {
    let senders = &(*ch).sender.clauses;
    let cl: *mut Clause = if senders.is_empty() {
        ptr::null_mut()
    } else {
        cont!(senders.begin(), Clause, ep_item)
    };
    if (*ch).items == 0 {
        if (*ch).done {
            debug_assert!(cl.is_null());
            let term = slot(ch, (*ch).bufsz);
            let clone = (*ch).clone_term.expect("done channel without a terminal value");
            clone(term, dst);
            return;
        }
        debug_assert!(!cl.is_null());
        ptr::copy_nonoverlapping((*cl).val, dst, (*ch).sz);
        unblock(r, cl);
        return;
    }
    ptr::copy_nonoverlapping(slot(ch, (*ch).first), dst, (*ch).sz);
    (*ch).first = ((*ch).first + 1) % (*ch).bufsz;
    (*ch).items -= 1;
    // A blocked sender moves its value into the slot just vacated.
    if !cl.is_null() {
        debug_assert!((*ch).items < (*ch).bufsz);
        let pos = ((*ch).first + (*ch).items) % (*ch).bufsz;
        ptr::copy_nonoverlapping((*cl).val, slot(ch, pos), (*ch).sz);
        (*ch).items += 1;
        unblock(r, cl);
    }
}

// The buffer and the value buffers are byte arrays, so every typed
// access below has to assume the bytes are unaligned for T.

unsafe fn drop_elem_shim<T>(p: *mut u8) {
    drop(ptr::read_unaligned(p as *const T));
}

unsafe fn clone_term_shim<T: Clone>(src: *const u8, dst: *mut u8) {
    let tmp = ManuallyDrop::new(ptr::read_unaligned(src as *const T));
    ptr::write_unaligned(dst as *mut T, T::clone(&tmp));
}

/// A handle to a channel carrying values of type `T`.
///
/// Cloning a handle increments the channel's reference count; dropping
/// the last handle destroys the channel. Handles stay on the thread
/// that created them, like everything else in this runtime.
pub struct Chan<T: 'static> {
    raw: *mut RawChan,
    _marker: PhantomData<*mut T>,
}

impl<T: 'static> Chan<T> {
    /// Create a channel with room for `bufsz` messages. Zero makes it
    /// a rendezvous channel: send and recv meet synchronously.
    pub fn new(bufsz: usize) -> Self {
        let r = rt();
        let seqnum = unsafe { (*r).choose_seqnum };
        let sz = mem::size_of::<T>();
        let raw = Box::into_raw(Box::new(RawChan {
            sz,
            sender: Ep::new(EpKind::Sender, seqnum),
            receiver: Ep::new(EpKind::Receiver, seqnum),
            refcount: 1,
            done: false,
            bufsz,
            items: 0,
            first: 0,
            buf: vec![0u8; (bufsz + 1) * sz],
            drop_elem: drop_elem_shim::<T>,
            clone_term: None,
        }));
        trace!("<{:p}>=chmake({})", raw, bufsz);
        Chan {
            raw,
            _marker: PhantomData,
        }
    }

    pub(crate) fn raw(&self) -> *mut RawChan {
        self.raw
    }

    /// Block until the value has been handed to a receiver or buffered.
    /// Sending to a done channel is a contract violation.
    pub fn send(&self, val: T) {
        unsafe {
            let r = rt();
            let task = (*r).running;
            trace!("chs(<{:p}>)", self.raw);
            (*task).state = State::ChanOp;
            choose_init(r, task);
            let v = ManuallyDrop::new(val);
            let mut cl = Clause::new();
            choose_out(
                r,
                task,
                &mut cl,
                self.raw,
                &v as *const ManuallyDrop<T> as *mut u8,
                0,
            );
            choose_wait(r, task);
            // The bytes of `v` have moved to the peer or the buffer.
        }
    }

    /// Block until a value is available and return it. Once the channel
    /// is done, every call returns a clone of the terminal value.
    pub fn recv(&self) -> T {
        unsafe {
            let r = rt();
            let task = (*r).running;
            trace!("chr(<{:p}>)", self.raw);
            (*task).state = State::ChanOp;
            choose_init(r, task);
            let mut cl = Clause::new();
            choose_in(r, task, &mut cl, self.raw, 0);
            choose_wait(r, task);
            ptr::read_unaligned((*task).valbuf((*self.raw).sz) as *const T)
        }
    }

    /// Mark the channel done. Every receiver blocked right now, and
    /// every future receive that finds the buffer empty, gets a clone
    /// of `val`. Doing this twice, or with senders still queued, is a
    /// contract violation.
    pub fn done(&self, val: T)
    where
        T: Clone,
    {
        unsafe {
            let r = rt();
            let ch = self.raw;
            trace!("chdone(<{:p}>)", ch);
            if (*ch).done {
                panic!("done on an already done-with channel");
            }
            if !(*ch).sender.clauses.is_empty() {
                panic!("done on a channel with blocked senders");
            }
            (*ch).done = true;
            (*ch).clone_term = Some(clone_term_shim::<T>);
            let term = slot(ch, (*ch).bufsz);
            let v = ManuallyDrop::new(val);
            ptr::copy_nonoverlapping(&v as *const ManuallyDrop<T> as *const u8, term, (*ch).sz);
            // Wake everyone currently blocked on the receive side.
            while !(*ch).receiver.clauses.is_empty() {
                let cl = cont!((*ch).receiver.clauses.begin(), Clause, ep_item);
                let dst = (*(*cl).task).valbuf((*ch).sz);
                clone_term_shim::<T>(term, dst);
                unblock(r, cl);
            }
        }
    }
}

impl<T: 'static> Clone for Chan<T> {
    /// Another handle to the same channel.
    fn clone(&self) -> Self {
        unsafe {
            (*self.raw).refcount += 1;
        }
        trace!("chdup(<{:p}>)", self.raw);
        Chan {
            raw: self.raw,
            _marker: PhantomData,
        }
    }
}

impl<T: 'static> Drop for Chan<T> {
    fn drop(&mut self) {
        unsafe {
            let ch = self.raw;
            (*ch).refcount -= 1;
            if (*ch).refcount > 0 {
                return;
            }
            trace!("chclose(<{:p}>)", ch);
            if !(*ch).sender.clauses.is_empty() || !(*ch).receiver.clauses.is_empty() {
                panic!("closing a channel that tasks are still waiting on");
            }
            // Values still in flight belong to the channel now.
            for i in 0..(*ch).items {
                let pos = ((*ch).first + i) % (*ch).bufsz;
                ((*ch).drop_elem)(slot(ch, pos));
            }
            if (*ch).done {
                ((*ch).drop_elem)(slot(ch, (*ch).bufsz));
            }
            drop(Box::from_raw(ch));
        }
    }
}
