// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! poll(2) pollset (portable fallback).
//!
//! A dense array of `pollfd` entries plus an fd-indexed table mapping
//! each fd to its waiters and its position in the array. The array is
//! compacted by swap-removal whenever an fd loses its last waiter.

use std::io;
use std::os::fd::RawFd;
use std::ptr;

use super::Events;
use crate::task::Task;

#[derive(Clone, Copy)]
struct FdItem {
    inw: *mut Task,
    outw: *mut Task,
    /// Index into `pollfds`, -1 when the fd is not in the array.
    idx: i32,
}

impl FdItem {
    const EMPTY: FdItem = FdItem {
        inw: ptr::null_mut(),
        outw: ptr::null_mut(),
        idx: -1,
    };
}

pub(crate) struct Pollset {
    pollfds: Vec<libc::pollfd>,
    items: Vec<FdItem>,
    waiters: usize,
}

impl Pollset {
    pub(crate) fn new() -> io::Result<Self> {
        Ok(Self {
            pollfds: Vec::new(),
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

    pub(crate) unsafe fn add(&mut self, fd: RawFd, events: Events, task: *mut Task) {
        self.ensure(fd);
        let mut item = self.items[fd as usize];
        if item.idx < 0 {
            self.pollfds.push(libc::pollfd {
                fd,
                events: 0,
                revents: 0,
            });
            item.idx = (self.pollfds.len() - 1) as i32;
        }
        let pfd = &mut self.pollfds[item.idx as usize];
        if events.contains(Events::IN) {
            if !item.inw.is_null() {
                panic!("two tasks waiting for input on fd {}", fd);
            }
            item.inw = task;
            pfd.events |= libc::POLLIN;
            self.waiters += 1;
        }
        if events.contains(Events::OUT) {
            if !item.outw.is_null() {
                panic!("two tasks waiting for output on fd {}", fd);
            }
            item.outw = task;
            pfd.events |= libc::POLLOUT;
            self.waiters += 1;
        }
        self.items[fd as usize] = item;
    }

    /// Drop `fd`'s array entry when no direction is wanted any more.
    fn compact(&mut self, fd: RawFd) {
        let item = self.items[fd as usize];
        if !item.inw.is_null() || !item.outw.is_null() || item.idx < 0 {
            return;
        }
        let idx = item.idx as usize;
        self.pollfds.swap_remove(idx);
        self.items[fd as usize].idx = -1;
        if idx < self.pollfds.len() {
            let moved_fd = self.pollfds[idx].fd;
            self.items[moved_fd as usize].idx = idx as i32;
        }
    }

    pub(crate) unsafe fn rm(&mut self, task: *mut Task) {
        let fd = (*task).fd;
        debug_assert!(fd >= 0);
        let mut item = self.items[fd as usize];
        let pfd = &mut self.pollfds[item.idx as usize];
        if item.inw == task {
            item.inw = ptr::null_mut();
            pfd.events &= !libc::POLLIN;
            self.waiters -= 1;
        }
        if item.outw == task {
            item.outw = ptr::null_mut();
            pfd.events &= !libc::POLLOUT;
            self.waiters -= 1;
        }
        self.items[fd as usize] = item;
        self.compact(fd);
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
        // With no waiters the array entry is gone already; nothing else
        // is held for the fd.
        debug_assert!(item.idx < 0);
    }

    pub(crate) fn waiters(&self) -> usize {
        self.waiters
    }

    pub(crate) unsafe fn wait(
        &mut self,
        timeout: i32,
        fired: &mut Vec<(*mut Task, Events)>,
    ) -> bool {
        let n = loop {
            let n = libc::poll(
                self.pollfds.as_mut_ptr(),
                self.pollfds.len() as libc::nfds_t,
                timeout,
            );
            if n >= 0 {
                break n;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                panic!("poll failed: {}", err);
            }
            break 0;
        };
        if n == 0 {
            return false;
        }
        // Collect ready fds first; waking a waiter mutates the array.
        let mut ready: Vec<(RawFd, libc::c_short)> = Vec::new();
        for pfd in &self.pollfds {
            if pfd.revents != 0 {
                ready.push((pfd.fd, pfd.revents));
            }
        }
        for (fd, revents) in ready {
            let errbits = libc::POLLERR | libc::POLLHUP | libc::POLLNVAL;
            let mut in_evs = Events::empty();
            if revents & libc::POLLIN != 0 {
                in_evs |= Events::IN;
            }
            let mut out_evs = Events::empty();
            if revents & libc::POLLOUT != 0 {
                out_evs |= Events::OUT;
            }
            if revents & errbits != 0 {
                in_evs |= Events::ERR;
                out_evs |= Events::ERR;
            }
            let mut item = self.items[fd as usize];
            let idx = item.idx as usize;
            let t_in = item.inw;
            let t_out = item.outw;
            if !t_in.is_null() && t_in == t_out {
                let both = in_evs | out_evs;
                if !both.is_empty() {
                    item.inw = ptr::null_mut();
                    item.outw = ptr::null_mut();
                    self.pollfds[idx].events = 0;
                    self.waiters -= 2;
                    (*t_in).fd = -1;
                    fired.push((t_in, both));
                }
            } else {
                if !t_in.is_null() && !in_evs.is_empty() {
                    item.inw = ptr::null_mut();
                    self.pollfds[idx].events &= !libc::POLLIN;
                    self.waiters -= 1;
                    (*t_in).fd = -1;
                    fired.push((t_in, in_evs));
                }
                if !t_out.is_null() && !out_evs.is_empty() {
                    item.outw = ptr::null_mut();
                    self.pollfds[idx].events &= !libc::POLLOUT;
                    self.waiters -= 1;
                    (*t_out).fd = -1;
                    fired.push((t_out, out_evs));
                }
            }
            self.items[fd as usize] = item;
            self.compact(fd);
        }
        !fired.is_empty()
    }
}
