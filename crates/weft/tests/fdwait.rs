// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! fd readiness: waking, timeouts, and poller bookkeeping.

use std::os::fd::RawFd;

use weft::{fd_clean, fd_wait, msleep, now, spawn, Events};

fn socketpair() -> (RawFd, RawFd) {
    let mut fds = [0 as RawFd; 2];
    let rc = unsafe {
        libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
    };
    assert_eq!(rc, 0);
    (fds[0], fds[1])
}

fn close_pair(a: RawFd, b: RawFd) {
    fd_clean(a);
    fd_clean(b);
    unsafe {
        libc::close(a);
        libc::close(b);
    }
}

fn write_byte(fd: RawFd, byte: u8) {
    let n = unsafe { libc::write(fd, &byte as *const u8 as *const libc::c_void, 1) };
    assert_eq!(n, 1);
}

#[test]
fn wait_times_out_when_nothing_happens() {
    let (a, b) = socketpair();
    let start = now();
    let evs = fd_wait(a, Events::IN, start + 100);
    assert!(evs.is_empty());
    let elapsed = now() - start;
    assert!((80..400).contains(&elapsed), "elapsed {} ms", elapsed);
    close_pair(a, b);
}

#[test]
fn wait_wakes_on_readability() {
    let (a, b) = socketpair();
    let start = now();
    spawn(move || {
        msleep(start + 30);
        write_byte(b, b'A');
    })
    .unwrap();
    let evs = fd_wait(a, Events::IN, start + 1000);
    assert!(evs.contains(Events::IN));
    let elapsed = now() - start;
    assert!((20..500).contains(&elapsed), "elapsed {} ms", elapsed);
    // Drain so the pair can be reused and closed cleanly.
    let mut buf = [0u8; 1];
    let n = unsafe { libc::read(a, buf.as_mut_ptr() as *mut libc::c_void, 1) };
    assert_eq!(n, 1);
    assert_eq!(buf[0], b'A');
    close_pair(a, b);
}

#[test]
fn writable_socket_reports_out_immediately() {
    let (a, b) = socketpair();
    let evs = fd_wait(a, Events::OUT, now() + 1000);
    assert!(evs.contains(Events::OUT));
    close_pair(a, b);
}

#[test]
fn combined_interest_reports_the_ready_direction() {
    let (a, b) = socketpair();
    // An idle socket is writable but not readable.
    let evs = fd_wait(a, Events::IN | Events::OUT, now() + 1000);
    assert!(evs.contains(Events::OUT));
    assert!(!evs.contains(Events::IN));
    close_pair(a, b);
}

#[test]
fn two_waiters_on_different_directions_coexist() {
    let (a, b) = socketpair();
    let start = now();
    spawn(move || {
        // Waits for input on `a` while main waits for output on it.
        let evs = fd_wait(a, Events::IN, start + 1000);
        assert!(evs.contains(Events::IN));
        let mut buf = [0u8; 1];
        let n = unsafe { libc::read(a, buf.as_mut_ptr() as *mut libc::c_void, 1) };
        assert_eq!(n, 1);
    })
    .unwrap();
    let evs = fd_wait(a, Events::OUT, start + 1000);
    assert!(evs.contains(Events::OUT));
    write_byte(b, b'x');
    // Let the reader finish before tearing the pair down.
    msleep(now() + 30);
    close_pair(a, b);
}

#[test]
fn peer_close_wakes_the_reader() {
    let (a, b) = socketpair();
    spawn(move || {
        msleep(now() + 20);
        unsafe {
            libc::close(b);
        }
    })
    .unwrap();
    let evs = fd_wait(a, Events::IN, now() + 1000);
    // EOF surfaces as readability, an error condition, or both.
    assert!(!evs.is_empty());
    fd_clean(a);
    unsafe {
        libc::close(a);
    }
}

#[test]
fn sequential_waits_on_one_fd_work() {
    let (a, b) = socketpair();
    for i in 0..5u8 {
        let start = now();
        spawn(move || {
            msleep(start + 10);
            write_byte(b, i);
        })
        .unwrap();
        let evs = fd_wait(a, Events::IN, start + 1000);
        assert!(evs.contains(Events::IN));
        let mut buf = [0u8; 1];
        let n = unsafe { libc::read(a, buf.as_mut_ptr() as *mut libc::c_void, 1) };
        assert_eq!(n, 1);
        assert_eq!(buf[0], i);
    }
    close_pair(a, b);
}
