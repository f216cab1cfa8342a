// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Task-local storage slot.

use weft::{set_task_local, spawn, task_local, yield_now};

#[test]
fn slot_starts_null_and_holds_what_was_set() {
    assert!(task_local().is_null());
    let boxed = Box::into_raw(Box::new(42i64));
    set_task_local(boxed as *mut libc::c_void);
    assert_eq!(task_local() as *mut i64, boxed);
    // Back to a clean slot; reclaim the allocation.
    set_task_local(std::ptr::null_mut());
    unsafe { drop(Box::from_raw(boxed)) };
}

#[test]
fn slot_is_per_task() {
    let main_val = Box::into_raw(Box::new(1i32));
    set_task_local(main_val as *mut libc::c_void);
    spawn(|| {
        // A fresh task inherits nothing.
        assert!(task_local().is_null());
        let mine = Box::into_raw(Box::new(2i32));
        set_task_local(mine as *mut libc::c_void);
        yield_now();
        assert_eq!(task_local() as *mut i32, mine);
        unsafe { drop(Box::from_raw(mine)) };
    })
    .unwrap();
    assert_eq!(task_local() as *mut i32, main_val);
    yield_now();
    assert_eq!(task_local() as *mut i32, main_val);
    set_task_local(std::ptr::null_mut());
    unsafe { drop(Box::from_raw(main_val)) };
}
