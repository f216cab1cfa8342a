// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Channel semantics: rendezvous, buffering, typing, and done.

use weft::{spawn, yield_now, Chan};

#[derive(Debug, Clone, Copy, PartialEq)]
struct Pair {
    first: i32,
    second: i32,
}

fn sender(ch: Chan<i32>, do_yield: bool, val: i32) {
    spawn(move || {
        if do_yield {
            yield_now();
        }
        ch.send(val);
    })
    .unwrap();
}

fn receiver(ch: Chan<i32>, expected: i32) {
    spawn(move || {
        assert_eq!(ch.recv(), expected);
    })
    .unwrap();
}

#[test]
fn receiver_waits_for_sender() {
    let ch: Chan<i32> = Chan::new(0);
    sender(ch.clone(), true, 333);
    assert_eq!(ch.recv(), 333);
}

#[test]
fn sender_waits_for_receiver() {
    let ch: Chan<i32> = Chan::new(0);
    sender(ch.clone(), false, 444);
    assert_eq!(ch.recv(), 444);
}

#[test]
fn two_simultaneous_senders_are_fifo() {
    let ch: Chan<i32> = Chan::new(0);
    sender(ch.clone(), false, 888);
    sender(ch.clone(), false, 999);
    assert_eq!(ch.recv(), 888);
    yield_now();
    assert_eq!(ch.recv(), 999);
}

#[test]
fn two_simultaneous_receivers_are_fifo() {
    let ch: Chan<i32> = Chan::new(0);
    receiver(ch.clone(), 333);
    receiver(ch.clone(), 444);
    ch.send(333);
    ch.send(444);
}

#[test]
fn channels_carry_arbitrary_types() {
    let ch: Chan<u8> = Chan::new(0);
    let tx = ch.clone();
    spawn(move || tx.send(111)).unwrap();
    assert_eq!(ch.recv(), 111u8);

    let ch: Chan<Pair> = Chan::new(0);
    let tx = ch.clone();
    spawn(move || {
        tx.send(Pair {
            first: 555,
            second: 222,
        })
    })
    .unwrap();
    let got = ch.recv();
    assert_eq!(
        got,
        Pair {
            first: 555,
            second: 222
        }
    );
}

#[test]
fn owned_values_move_through() {
    let ch: Chan<String> = Chan::new(1);
    let tx = ch.clone();
    spawn(move || {
        tx.send(String::from("hello"));
        tx.send(String::from("world"));
    })
    .unwrap();
    assert_eq!(ch.recv(), "hello");
    assert_eq!(ch.recv(), "world");
}

#[test]
fn buffered_values_drop_with_the_channel() {
    // A buffered value that is never received must still be freed when
    // the last handle goes away (miri/asan would flag a leak or double
    // free here).
    let ch: Chan<String> = Chan::new(2);
    ch.send(String::from("abandoned"));
}

#[test]
fn buffering_keeps_order() {
    let ch: Chan<i32> = Chan::new(2);
    ch.send(222);
    ch.send(333);
    assert_eq!(ch.recv(), 222);
    assert_eq!(ch.recv(), 333);
    ch.send(444);
    assert_eq!(ch.recv(), 444);
    ch.send(555);
    ch.send(666);
    assert_eq!(ch.recv(), 555);
    assert_eq!(ch.recv(), 666);
}

#[test]
fn buffered_single_producer_consumer_is_fifo() {
    let ch: Chan<i32> = Chan::new(4);
    let tx = ch.clone();
    spawn(move || {
        for i in 0..50 {
            tx.send(i);
        }
    })
    .unwrap();
    for i in 0..50 {
        assert_eq!(ch.recv(), i);
    }
}

#[test]
fn done_delivers_terminal_value_forever() {
    let ch: Chan<i32> = Chan::new(0);
    ch.done(777);
    assert_eq!(ch.recv(), 777);
    assert_eq!(ch.recv(), 777);
    assert_eq!(ch.recv(), 777);

    let ch: Chan<i32> = Chan::new(10);
    ch.done(888);
    assert_eq!(ch.recv(), 888);
    assert_eq!(ch.recv(), 888);
}

#[test]
fn done_drains_buffer_first() {
    let ch: Chan<i32> = Chan::new(10);
    ch.send(999);
    ch.done(111);
    assert_eq!(ch.recv(), 999);
    assert_eq!(ch.recv(), 111);
    assert_eq!(ch.recv(), 111);

    let ch: Chan<i32> = Chan::new(1);
    ch.send(222);
    ch.done(333);
    assert_eq!(ch.recv(), 222);
    assert_eq!(ch.recv(), 333);
}

#[test]
fn done_unblocks_every_receiver() {
    let ch: Chan<i32> = Chan::new(0);
    let back: Chan<i32> = Chan::new(0);
    for _ in 0..2 {
        let rx = ch.clone();
        let ack = back.clone();
        spawn(move || {
            assert_eq!(rx.recv(), 444);
            ack.send(0);
        })
        .unwrap();
    }
    ch.done(444);
    assert_eq!(back.recv(), 0);
    assert_eq!(back.recv(), 0);
}

#[test]
fn blocked_sender_combines_with_buffered_item() {
    let ch: Chan<i32> = Chan::new(1);
    ch.send(1);
    sender(ch.clone(), false, 2);
    assert_eq!(ch.recv(), 1);
    assert_eq!(ch.recv(), 2);
}

#[test]
fn large_values_take_the_heap_path() {
    // Bigger than the inline value buffer.
    let ch: Chan<[u64; 64]> = Chan::new(1);
    let tx = ch.clone();
    spawn(move || {
        let mut v = [0u64; 64];
        for (i, slot) in v.iter_mut().enumerate() {
            *slot = i as u64;
        }
        tx.send(v);
    })
    .unwrap();
    let got = ch.recv();
    assert_eq!(got[0], 0);
    assert_eq!(got[63], 63);
}

#[test]
#[should_panic(expected = "done-with")]
fn send_after_done_panics() {
    let ch: Chan<i32> = Chan::new(1);
    ch.done(1);
    ch.send(2);
}

#[test]
#[should_panic(expected = "done-with")]
fn double_done_panics() {
    let ch: Chan<i32> = Chan::new(0);
    ch.done(1);
    ch.done(2);
}
