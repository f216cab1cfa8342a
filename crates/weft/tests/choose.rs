// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Multi-way selection: immediate and blocking paths, otherwise and
//! deadline branches, and the fairness guarantees.

use weft::{msleep, now, spawn, yield_now, Chan, Choose};

#[derive(Debug, Clone, Copy)]
struct Large {
    buf: [u8; 1024],
}

#[test]
fn recv_clause_with_ready_sender() {
    let ch: Chan<i32> = Chan::new(0);
    let tx = ch.clone();
    spawn(move || tx.send(555)).unwrap();
    let mut val: Option<i32> = None;
    let idx = Choose::new().recv(&ch, &mut val).wait();
    assert_eq!(idx, 0);
    assert_eq!(val, Some(555));
}

#[test]
fn recv_clause_blocks_until_sender_arrives() {
    let ch: Chan<i32> = Chan::new(0);
    let tx = ch.clone();
    spawn(move || {
        yield_now();
        tx.send(666);
    })
    .unwrap();
    let mut val: Option<i32> = None;
    let idx = Choose::new().recv(&ch, &mut val).wait();
    assert_eq!(idx, 0);
    assert_eq!(val, Some(666));
}

#[test]
fn send_clause_with_ready_receiver() {
    let ch: Chan<i32> = Chan::new(0);
    let rx = ch.clone();
    spawn(move || assert_eq!(rx.recv(), 777)).unwrap();
    let idx = Choose::new().send(&ch, 777).wait();
    assert_eq!(idx, 0);
}

#[test]
fn send_clause_blocks_until_receiver_arrives() {
    let ch: Chan<i32> = Chan::new(0);
    let rx = ch.clone();
    spawn(move || {
        yield_now();
        assert_eq!(rx.recv(), 888);
    })
    .unwrap();
    let idx = Choose::new().send(&ch, 888).wait();
    assert_eq!(idx, 0);
}

#[test]
fn only_the_ready_channel_fires() {
    let quiet: Chan<i32> = Chan::new(0);
    let busy: Chan<i32> = Chan::new(0);
    let tx = busy.clone();
    spawn(move || tx.send(555)).unwrap();
    let mut a: Option<i32> = None;
    let mut b: Option<i32> = None;
    let idx = Choose::new().recv(&quiet, &mut a).recv(&busy, &mut b).wait();
    assert_eq!(idx, 1);
    assert_eq!(a, None);
    assert_eq!(b, Some(555));

    // And the blocking variant.
    let tx = quiet.clone();
    spawn(move || {
        yield_now();
        tx.send(666);
    })
    .unwrap();
    let mut a: Option<i32> = None;
    let mut b: Option<i32> = None;
    let idx = Choose::new().recv(&quiet, &mut a).recv(&busy, &mut b).wait();
    assert_eq!(idx, 0);
    assert_eq!(a, Some(666));
    assert_eq!(b, None);
}

#[test]
fn selection_among_ready_channels_is_random() {
    let cha: Chan<i32> = Chan::new(0);
    let chb: Chan<i32> = Chan::new(0);
    for (ch, val) in [(cha.clone(), 111), (chb.clone(), 222)] {
        spawn(move || loop {
            ch.send(val);
            yield_now();
        })
        .unwrap();
    }
    let mut first = 0;
    let mut second = 0;
    for _ in 0..100 {
        let mut a: Option<i32> = None;
        let mut b: Option<i32> = None;
        let idx = Choose::new().recv(&cha, &mut a).recv(&chb, &mut b).wait();
        match idx {
            0 => {
                assert_eq!(a, Some(111));
                first += 1;
            }
            1 => {
                assert_eq!(b, Some(222));
                second += 1;
            }
            other => panic!("unexpected index {}", other),
        }
        yield_now();
    }
    assert!(first > 1 && second > 1);
}

#[test]
fn otherwise_fires_when_nothing_is_ready() {
    let ch: Chan<i32> = Chan::new(0);
    let mut val: Option<i32> = None;
    let idx = Choose::new().recv(&ch, &mut val).otherwise().wait();
    assert_eq!(idx, -1);
    assert_eq!(val, None);

    // An otherwise branch on its own fires too.
    let idx = Choose::new().otherwise().wait();
    assert_eq!(idx, -1);
}

#[test]
fn blocked_senders_are_served_in_order() {
    let ch: Chan<i32> = Chan::new(0);
    for val in [888, 999] {
        let tx = ch.clone();
        spawn(move || tx.send(val)).unwrap();
    }
    for expected in [888, 999] {
        let mut v: Option<i32> = None;
        let idx = Choose::new().recv(&ch, &mut v).wait();
        assert_eq!(idx, 0);
        assert_eq!(v, Some(expected));
    }
}

#[test]
fn blocked_receivers_are_served_in_order() {
    let ch: Chan<i32> = Chan::new(0);
    for expected in [333, 444] {
        let rx = ch.clone();
        spawn(move || assert_eq!(rx.recv(), expected)).unwrap();
    }
    assert_eq!(Choose::new().send(&ch, 333).wait(), 0);
    assert_eq!(Choose::new().send(&ch, 444).wait(), 0);
}

#[test]
fn choose_meets_choose() {
    let ch: Chan<i32> = Chan::new(0);
    let tx = ch.clone();
    spawn(move || {
        let idx = Choose::new().send(&tx, 111).wait();
        assert_eq!(idx, 0);
    })
    .unwrap();
    let mut v: Option<i32> = None;
    assert_eq!(Choose::new().recv(&ch, &mut v).wait(), 0);
    assert_eq!(v, Some(111));
}

#[test]
fn choose_uses_the_buffer() {
    let ch: Chan<i32> = Chan::new(2);
    assert_eq!(Choose::new().send(&ch, 999).wait(), 0);
    let mut v: Option<i32> = None;
    assert_eq!(Choose::new().recv(&ch, &mut v).wait(), 0);
    assert_eq!(v, Some(999));
}

#[test]
fn sibling_send_clauses_alternate() {
    // Two send clauses on one channel; the values chosen must mix.
    let ch: Chan<i32> = Chan::new(0);
    let tx = ch.clone();
    spawn(move || loop {
        let idx = Choose::new().send(&tx, 666).send(&tx, 777).wait();
        assert!(idx == 0 || idx == 1);
    })
    .unwrap();
    let mut first = 0;
    let mut second = 0;
    for _ in 0..100 {
        match ch.recv() {
            666 => first += 1,
            777 => second += 1,
            other => panic!("unexpected value {}", other),
        }
    }
    assert!(first > 1 && second > 1);
}

#[test]
fn sibling_recv_clauses_alternate_when_blocking() {
    // Three receive clauses on the same channel, never immediately
    // available; the pre-committed random sibling must vary.
    let ch: Chan<i32> = Chan::new(0);
    let tx = ch.clone();
    spawn(move || loop {
        msleep(now() + 10);
        tx.send(3333);
    })
    .unwrap();
    let mut counts = [0u32; 3];
    for _ in 0..100 {
        let mut a: Option<i32> = None;
        let mut b: Option<i32> = None;
        let mut c: Option<i32> = None;
        let idx = Choose::new()
            .recv(&ch, &mut a)
            .recv(&ch, &mut b)
            .recv(&ch, &mut c)
            .wait();
        counts[idx as usize] += 1;
    }
    assert!(counts.iter().all(|&c| c > 1), "skewed: {:?}", counts);
}

#[test]
fn sibling_send_clauses_alternate_when_blocking() {
    let ch: Chan<i32> = Chan::new(0);
    let tx = ch.clone();
    spawn(move || loop {
        let idx = Choose::new()
            .send(&tx, 1)
            .send(&tx, 2)
            .send(&tx, 3)
            .wait();
        assert!((0..3).contains(&idx));
    })
    .unwrap();
    let mut counts = [0u32; 3];
    for _ in 0..100 {
        msleep(now() + 10);
        let v = ch.recv();
        counts[(v - 1) as usize] += 1;
    }
    assert!(counts.iter().all(|&c| c > 1), "skewed: {:?}", counts);
}

#[test]
fn mixed_element_sizes_in_one_choose() {
    let small: Chan<i32> = Chan::new(1);
    let large: Chan<Large> = Chan::new(1);
    let tx = small.clone();
    spawn(move || {
        yield_now();
        tx.send(1111);
    })
    .unwrap();
    let mut s: Option<i32> = None;
    let mut l: Option<Large> = None;
    let idx = Choose::new().recv(&small, &mut s).recv(&large, &mut l).wait();
    assert_eq!(idx, 0);
    assert_eq!(s, Some(1111));
    assert!(l.is_none());
}

#[test]
fn large_value_through_choose() {
    let ch: Chan<Large> = Chan::new(1);
    ch.send(Large { buf: [7; 1024] });
    let mut v: Option<Large> = None;
    let idx = Choose::new().recv(&ch, &mut v).wait();
    assert_eq!(idx, 0);
    assert_eq!(v.unwrap().buf[1023], 7);
}

#[test]
fn done_channel_fires_in_choose() {
    let ch: Chan<i32> = Chan::new(0);
    ch.done(2222);
    let mut v: Option<i32> = None;
    let idx = Choose::new().recv(&ch, &mut v).wait();
    assert_eq!(idx, 0);
    assert_eq!(v, Some(2222));
}

#[test]
fn deadline_fires_when_nothing_arrives() {
    let ch: Chan<i32> = Chan::new(0);
    let start = now();
    let mut v: Option<i32> = None;
    let idx = Choose::new().recv(&ch, &mut v).deadline(start + 50).wait();
    assert_eq!(idx, -1);
    assert_eq!(v, None);
    let elapsed = now() - start;
    assert!((30..200).contains(&elapsed), "elapsed {} ms", elapsed);
}

#[test]
fn deadline_does_not_fire_when_a_peer_arrives() {
    let ch: Chan<i32> = Chan::new(0);
    let start = now();
    let tx = ch.clone();
    spawn(move || {
        msleep(start + 50);
        tx.send(4444);
    })
    .unwrap();
    let mut v: Option<i32> = None;
    let idx = Choose::new()
        .recv(&ch, &mut v)
        .deadline(start + 1000)
        .wait();
    assert_eq!(idx, 0);
    assert_eq!(v, Some(4444));
    let elapsed = now() - start;
    assert!((30..500).contains(&elapsed), "elapsed {} ms", elapsed);
}

#[test]
fn unfired_send_values_are_dropped_exactly_once() {
    // The fired clause consumes its value, the other one drops it.
    let cha: Chan<String> = Chan::new(1);
    let chb: Chan<String> = Chan::new(1);
    let idx = Choose::new()
        .send(&cha, String::from("a"))
        .send(&chb, String::from("b"))
        .wait();
    assert!(idx == 0 || idx == 1);
    let fired = if idx == 0 { &cha } else { &chb };
    let mut v: Option<String> = None;
    assert_eq!(Choose::new().recv(fired, &mut v).wait(), 0);
    assert!(v.is_some());
}

#[test]
#[should_panic(expected = "otherwise/deadline")]
fn otherwise_and_deadline_together_panic() {
    let _ = Choose::new().otherwise().deadline(now() + 10);
}
