// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Machine context save/restore.
//!
//! Stackful switching through the ucontext family (`getcontext` /
//! `makecontext` / `swapcontext`), the asm-free route. A context is
//! valid to resume as long as the stack it points into stays allocated.

use std::mem;

/// Saved register state of a suspended task.
pub(crate) struct Context {
    uc: libc::ucontext_t,
}

impl Context {
    /// A context that has never been saved into. Must be filled by
    /// [`Context::init`] or by a switch away before it is resumed.
    pub(crate) fn empty() -> Self {
        Self {
            // ucontext_t is a plain C structure; getcontext/swapcontext
            // overwrite every field that matters before first use.
            uc: unsafe { mem::zeroed() },
        }
    }

    /// Arrange for this context to start executing `entry` on the stack
    /// `[stack_lo, stack_lo + stack_len)`. `entry` must never return.
    pub(crate) unsafe fn init(
        &mut self,
        stack_lo: *mut u8,
        stack_len: usize,
        entry: extern "C" fn(),
    ) {
        let rc = libc::getcontext(&mut self.uc);
        assert_eq!(rc, 0, "getcontext failed");
        self.uc.uc_stack.ss_sp = stack_lo as *mut libc::c_void;
        self.uc.uc_stack.ss_size = stack_len;
        self.uc.uc_stack.ss_flags = 0;
        self.uc.uc_link = std::ptr::null_mut();
        libc::makecontext(&mut self.uc, entry, 0);
    }

    /// Save the current execution state into `save` and resume `to`.
    /// Returns when something later switches back into `save`.
    pub(crate) unsafe fn swap(save: *mut Context, to: *const Context) {
        let rc = libc::swapcontext(&mut (*save).uc, &(*to).uc);
        assert_eq!(rc, 0, "swapcontext failed");
    }

    /// Resume `to` without saving the current state. Never returns.
    pub(crate) unsafe fn set(to: *const Context) -> ! {
        libc::setcontext(&(*to).uc);
        unreachable!("setcontext returned");
    }
}
