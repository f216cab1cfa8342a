// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! kqueue(2) pollset (BSD, macOS).
//!
//! Each direction is registered as a oneshot kevent filter, so a fired
//! registration disappears from the kernel by itself; only an early
//! removal (deadline beat the fd) needs an explicit delete.

use std::io;
use std::os::fd::RawFd;
use std::ptr;

use super::Events;
use crate::task::Task;

const BATCH: usize = 64;

#[derive(Clone, Copy)]
struct FdItem {
    inw: *mut Task,
    outw: *mut Task,
}

impl FdItem {
    const EMPTY: FdItem = FdItem {
        inw: ptr::null_mut(),
        outw: ptr::null_mut(),
    };
}

pub(crate) struct Pollset {
    kq: RawFd,
    items: Vec<FdItem>,
    waiters: usize,
}

impl Pollset {
    pub(crate) fn new() -> io::Result<Self> {
        let kq = unsafe { libc::kqueue() };
        if kq < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            kq,
            items: Vec::new(),
            waiters: 0,
        })
    }

    fn ensure(&mut self, fd: RawFd) {
        let needed = fd as usize + 1;
        if self.items.len() < needed {
            let cap = needed.max(self.items.len() * 2).max(16);
            self.items.resize(cap, FdItem::EMPTY);
        }
    }

    fn change(&self, fd: RawFd, filter: i16, flags: u16) {
        let ev = libc::kevent {
            ident: fd as usize,
            filter,
            flags,
            fflags: 0,
            data: 0,
            udata: ptr::null_mut(),
        };
        let rc = unsafe { libc::kevent(self.kq, &ev, 1, ptr::null_mut(), 0, ptr::null()) };
        assert!(rc >= 0, "kevent failed: {}", io::Error::last_os_error());
    }

    pub(crate) unsafe fn add(&mut self, fd: RawFd, events: Events, task: *mut Task) {
        self.ensure(fd);
        let mut item = self.items[fd as usize];
        if events.contains(Events::IN) {
            if !item.inw.is_null() {
                panic!("two tasks waiting for input on fd {}", fd);
            }
            item.inw = task;
            self.change(fd, libc::EVFILT_READ, libc::EV_ADD | libc::EV_ONESHOT);
            self.waiters += 1;
        }
        if events.contains(Events::OUT) {
            if !item.outw.is_null() {
                panic!("two tasks waiting for output on fd {}", fd);
            }
            item.outw = task;
            self.change(fd, libc::EVFILT_WRITE, libc::EV_ADD | libc::EV_ONESHOT);
            self.waiters += 1;
        }
        self.items[fd as usize] = item;
    }

    pub(crate) unsafe fn rm(&mut self, task: *mut Task) {
        let fd = (*task).fd;
        debug_assert!(fd >= 0);
        let mut item = self.items[fd as usize];
        if item.inw == task {
            item.inw = ptr::null_mut();
            self.change(fd, libc::EVFILT_READ, libc::EV_DELETE);
            self.waiters -= 1;
        }
        if item.outw == task {
            item.outw = ptr::null_mut();
            self.change(fd, libc::EVFILT_WRITE, libc::EV_DELETE);
            self.waiters -= 1;
        }
        self.items[fd as usize] = item;
    }

    pub(crate) fn clean(&mut self, fd: RawFd) {
        if fd as usize >= self.items.len() {
            return;
        }
        let item = self.items[fd as usize];
        assert!(
            item.inw.is_null() && item.outw.is_null(),
            "cleaning fd {} while tasks are waiting on it",
            fd
        );
        // Oneshot filters vanish on their own; closing the fd drops any
        // that have not fired yet.
    }

    pub(crate) fn waiters(&self) -> usize {
        self.waiters
    }

    pub(crate) unsafe fn wait(
        &mut self,
        timeout: i32,
        fired: &mut Vec<(*mut Task, Events)>,
    ) -> bool {
        let ts;
        let tsp = if timeout < 0 {
            ptr::null()
        } else {
            ts = libc::timespec {
                tv_sec: (timeout / 1000) as libc::time_t,
                tv_nsec: (timeout % 1000) as libc::c_long * 1_000_000,
            };
            &ts as *const libc::timespec
        };
        let mut evs: [libc::kevent; BATCH] = std::mem::zeroed();
        let n = loop {
            let n = libc::kevent(self.kq, ptr::null(), 0, evs.as_mut_ptr(), BATCH as i32, tsp);
            if n >= 0 {
                break n as usize;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                panic!("kevent failed: {}", err);
            }
            break 0;
        };
        for ev in &evs[..n] {
            let fd = ev.ident as RawFd;
            let mut item = self.items[fd as usize];
            let mut errs = Events::empty();
            if ev.flags & (libc::EV_ERROR | libc::EV_EOF) != 0 {
                errs |= Events::ERR;
            }
            if ev.filter == libc::EVFILT_READ {
                let t = item.inw;
                if !t.is_null() {
                    item.inw = ptr::null_mut();
                    self.waiters -= 1;
                    if item.outw == t {
                        // Same task also parked on the write filter;
                        // the resume covers both directions.
                        item.outw = ptr::null_mut();
                        self.change(fd, libc::EVFILT_WRITE, libc::EV_DELETE);
                        self.waiters -= 1;
                    }
                    (*t).fd = -1;
                    fired.push((t, Events::IN | errs));
                }
            } else if ev.filter == libc::EVFILT_WRITE {
                let t = item.outw;
                if !t.is_null() {
                    item.outw = ptr::null_mut();
                    self.waiters -= 1;
                    if item.inw == t {
                        item.inw = ptr::null_mut();
                        self.change(fd, libc::EVFILT_READ, libc::EV_DELETE);
                        self.waiters -= 1;
                    }
                    (*t).fd = -1;
                    fired.push((t, Events::OUT | errs));
                }
            }
            self.items[fd as usize] = item;
        }
        !fired.is_empty()
    }
}

impl Drop for Pollset {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.kq);
        }
    }
}
