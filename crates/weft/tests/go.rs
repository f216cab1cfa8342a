// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Task lifecycle: spawn ordering, yielding, and the ping-pong loop.

use std::cell::RefCell;
use std::rc::Rc;

use weft::{spawn, yield_now, Chan};

#[test]
fn spawned_task_runs_first() {
    let log = Rc::new(RefCell::new(Vec::new()));
    let l = log.clone();
    spawn(move || {
        l.borrow_mut().push("child");
    })
    .unwrap();
    log.borrow_mut().push("parent");
    // The child ran to completion before spawn returned control.
    assert_eq!(*log.borrow(), vec!["child", "parent"]);
}

#[test]
fn yield_interleaves_tasks() {
    let log = Rc::new(RefCell::new(Vec::new()));
    for id in 0..3 {
        let l = log.clone();
        spawn(move || {
            l.borrow_mut().push((id, 0));
            yield_now();
            l.borrow_mut().push((id, 1));
        })
        .unwrap();
    }
    // Main yields until everyone is done.
    while log.borrow().len() < 6 {
        yield_now();
    }
    let log = log.borrow();
    // Every task got both halves in, in its own order.
    for id in 0..3 {
        let first = log.iter().position(|&e| e == (id, 0)).unwrap();
        let second = log.iter().position(|&e| e == (id, 1)).unwrap();
        assert!(first < second);
    }
}

#[test]
fn many_tasks_all_run() {
    let counter = Rc::new(RefCell::new(0));
    for _ in 0..100 {
        let c = counter.clone();
        spawn(move || {
            *c.borrow_mut() += 1;
        })
        .unwrap();
    }
    yield_now();
    assert_eq!(*counter.borrow(), 100);
}

#[test]
fn stacks_are_recycled_across_generations() {
    // More total tasks than the stack cache holds, in waves.
    for _ in 0..10 {
        let counter = Rc::new(RefCell::new(0));
        for _ in 0..20 {
            let c = counter.clone();
            spawn(move || {
                yield_now();
                *c.borrow_mut() += 1;
            })
            .unwrap();
        }
        while *counter.borrow() < 20 {
            yield_now();
        }
    }
}

#[test]
fn ping_pong() {
    let ch: Chan<i32> = Chan::new(0);
    let peer = ch.clone();
    spawn(move || loop {
        let v = peer.recv();
        peer.send(v + 1);
    })
    .unwrap();
    for i in 0..10 {
        ch.send(i);
        let got = ch.recv();
        assert_eq!(got, i + 1);
    }
}

#[test]
#[should_panic(expected = "global deadlock")]
fn blocking_with_no_peers_is_a_deadlock() {
    let ch: Chan<i32> = Chan::new(0);
    // The channel outlives the panicking receive below.
    std::mem::forget(ch.clone());
    // Nobody can ever send: no tasks, no timers, no fds.
    let _ = ch.recv();
}
