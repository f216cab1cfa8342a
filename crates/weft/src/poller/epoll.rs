// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! epoll(7) pollset (Linux).
//!
//! Registrations live in an fd-indexed table of waiter pairs, one slot
//! per direction; the epoll interest mask mirrors the occupied slots.

use std::io;
use std::os::fd::RawFd;
use std::ptr;

use super::Events;
use crate::task::Task;

const BATCH: usize = 64;

#[derive(Clone, Copy)]
struct FdItem {
    /// Task waiting for readability, if any.
    inw: *mut Task,
    /// Task waiting for writability, if any.
    outw: *mut Task,
    /// Interest mask currently installed in the kernel.
    currevs: u32,
}

impl FdItem {
    const EMPTY: FdItem = FdItem {
        inw: ptr::null_mut(),
        outw: ptr::null_mut(),
        currevs: 0,
    };

    fn mask(&self) -> u32 {
        let mut m = 0;
        if !self.inw.is_null() {
            m |= libc::EPOLLIN as u32;
        }
        if !self.outw.is_null() {
            m |= libc::EPOLLOUT as u32;
        }
        m
    }
}

pub(crate) struct Pollset {
    epfd: RawFd,
    items: Vec<FdItem>,
    waiters: usize,
}

impl Pollset {
    pub(crate) fn new() -> io::Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            epfd,
            items: Vec::new(),
            waiters: 0,
        })
    }

    fn ensure(&mut self, fd: RawFd) {
        let needed = fd as usize + 1;
        if self.items.len() < needed {
            // Grow geometrically so a burst of high fds stays cheap.
            let cap = needed.max(self.items.len() * 2).max(16);
            self.items.resize(cap, FdItem::EMPTY);
        }
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, mask: u32) {
        let mut ev = libc::epoll_event {
            events: mask,
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        assert_eq!(rc, 0, "epoll_ctl failed: {}", io::Error::last_os_error());
    }

    /// Reconcile the kernel interest mask for `fd` with the table.
    fn update(&mut self, fd: RawFd) {
        let item = self.items[fd as usize];
        let newevs = item.mask();
        if newevs == item.currevs {
            return;
        }
        if item.currevs == 0 {
            self.ctl(libc::EPOLL_CTL_ADD, fd, newevs);
        } else if newevs == 0 {
            self.ctl(libc::EPOLL_CTL_DEL, fd, 0);
        } else {
            self.ctl(libc::EPOLL_CTL_MOD, fd, newevs);
        }
        self.items[fd as usize].currevs = newevs;
    }

    pub(crate) unsafe fn add(&mut self, fd: RawFd, events: Events, task: *mut Task) {
        self.ensure(fd);
        let mut item = self.items[fd as usize];
        if events.contains(Events::IN) {
            if !item.inw.is_null() {
                panic!("two tasks waiting for input on fd {}", fd);
            }
            item.inw = task;
            self.waiters += 1;
        }
        if events.contains(Events::OUT) {
            if !item.outw.is_null() {
                panic!("two tasks waiting for output on fd {}", fd);
            }
            item.outw = task;
            self.waiters += 1;
        }
        self.items[fd as usize] = item;
        self.update(fd);
    }

    /// Forget a task's registration, e.g. when its deadline expired.
    pub(crate) unsafe fn rm(&mut self, task: *mut Task) {
        let fd = (*task).fd;
        debug_assert!(fd >= 0);
        let mut item = self.items[fd as usize];
        if item.inw == task {
            item.inw = ptr::null_mut();
            self.waiters -= 1;
        }
        if item.outw == task {
            item.outw = ptr::null_mut();
            self.waiters -= 1;
        }
        self.items[fd as usize] = item;
        self.update(fd);
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
        if item.currevs != 0 {
            self.ctl(libc::EPOLL_CTL_DEL, fd, 0);
            self.items[fd as usize].currevs = 0;
        }
    }

    pub(crate) fn waiters(&self) -> usize {
        self.waiters
    }

    /// Block up to `timeout` ms (-1 = until something happens) and
    /// stage one resume entry per woken waiter into `fired`. Staged
    /// registrations are dropped here; delivery order follows the
    /// kernel's.
    pub(crate) unsafe fn wait(
        &mut self,
        timeout: i32,
        fired: &mut Vec<(*mut Task, Events)>,
    ) -> bool {
        let mut evs: [libc::epoll_event; BATCH] = std::mem::zeroed();
        let n = loop {
            let n = libc::epoll_wait(self.epfd, evs.as_mut_ptr(), BATCH as i32, timeout);
            if n >= 0 {
                break n as usize;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                panic!("epoll_wait failed: {}", err);
            }
            // Interrupted by a signal; the caller's retry loop picks a
            // fresh timeout.
            break 0;
        };
        for ev in &evs[..n] {
            let fd = ev.u64 as RawFd;
            let m = ev.events;
            let errbits = (libc::EPOLLERR | libc::EPOLLHUP) as u32;
            let mut in_evs = Events::empty();
            if m & libc::EPOLLIN as u32 != 0 {
                in_evs |= Events::IN;
            }
            let mut out_evs = Events::empty();
            if m & libc::EPOLLOUT as u32 != 0 {
                out_evs |= Events::OUT;
            }
            if m & errbits != 0 {
                in_evs |= Events::ERR;
                out_evs |= Events::ERR;
            }
            let mut item = self.items[fd as usize];
            let t_in = item.inw;
            let t_out = item.outw;
            if !t_in.is_null() && t_in == t_out {
                // One task waiting for both directions.
                let both = in_evs | out_evs;
                if !both.is_empty() {
                    item.inw = ptr::null_mut();
                    item.outw = ptr::null_mut();
                    self.waiters -= 2;
                    (*t_in).fd = -1;
                    fired.push((t_in, both));
                }
            } else {
                if !t_in.is_null() && !in_evs.is_empty() {
                    item.inw = ptr::null_mut();
                    self.waiters -= 1;
                    (*t_in).fd = -1;
                    fired.push((t_in, in_evs));
                }
                if !t_out.is_null() && !out_evs.is_empty() {
                    item.outw = ptr::null_mut();
                    self.waiters -= 1;
                    (*t_out).fd = -1;
                    fired.push((t_out, out_evs));
                }
            }
            self.items[fd as usize] = item;
            self.update(fd);
        }
        !fired.is_empty()
    }
}

impl Drop for Pollset {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}
