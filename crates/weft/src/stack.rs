// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Task stack allocation.
//!
//! Stacks are page-aligned blocks with the lowest page mprotect-ed to
//! PROT_NONE, so running off the end of a stack faults instead of
//! silently corrupting the heap. Freed stacks are kept in a bounded
//! cache; the cache link is written at the top of the cached stack
//! itself so an allocation touches pages that are about to be used
//! anyway.

use crate::error::Error;
use crate::list::{SList, SListItem};

/// Default stack size. A few bytes short of 256 KiB so the allocation
/// together with allocator bookkeeping stays under a round power of two.
pub(crate) const DEFAULT_STACK_SIZE: usize = 256 * 1024 - 256;

/// Default bound on the number of cached unused stacks.
const DEFAULT_MAX_CACHED: usize = 64;

pub(crate) struct StackCache {
    /// Stack size as requested by the user.
    stack_size: usize,
    /// Page-rounded size including the guard page; 0 until computed.
    sanitised_size: usize,
    page_size: usize,
    max_cached: usize,
    num_cached: usize,
    cache: SList,
}

impl StackCache {
    pub(crate) fn new() -> Self {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) };
        assert!(page_size > 0);
        Self {
            stack_size: DEFAULT_STACK_SIZE,
            sanitised_size: 0,
            page_size: page_size as usize,
            max_cached: DEFAULT_MAX_CACHED,
            num_cached: 0,
            cache: SList::new(),
        }
    }

    pub(crate) fn page_size(&self) -> usize {
        self.page_size
    }

    /// Whole allocation size: requested size rounded up to a page
    /// multiple, plus one guard page.
    pub(crate) fn total_size(&mut self) -> usize {
        if self.sanitised_size == 0 {
            assert!(self.stack_size > self.page_size);
            let sz = (self.stack_size + self.page_size - 1) & !(self.page_size - 1);
            self.sanitised_size = sz + self.page_size;
        }
        self.sanitised_size
    }

    /// Allocate fresh stack memory. Returns a pointer one past the top
    /// of the allocation, or null if memory or guard-page setup failed.
    unsafe fn alloc_mem(&mut self) -> *mut u8 {
        let total = self.total_size();
        let mut ptr: *mut libc::c_void = std::ptr::null_mut();
        let rc = libc::posix_memalign(&mut ptr, self.page_size, total);
        if rc != 0 {
            return std::ptr::null_mut();
        }
        // Guard page at the low end of the block.
        let rc = libc::mprotect(ptr, self.page_size, libc::PROT_NONE);
        if rc != 0 {
            libc::free(ptr);
            return std::ptr::null_mut();
        }
        (ptr as *mut u8).add(total)
    }

    /// Get a stack, from the cache if possible. Returns the top.
    pub(crate) unsafe fn alloc(&mut self) -> Result<*mut u8, Error> {
        if !self.cache.is_empty() {
            self.num_cached -= 1;
            let item = self.cache.pop();
            return Ok((item as *mut u8).add(std::mem::size_of::<SListItem>()));
        }
        let top = self.alloc_mem();
        if top.is_null() {
            return Err(Error::OutOfMemory);
        }
        Ok(top)
    }

    /// Return a stack to the cache. When the cache is over its bound the
    /// oldest cached stack is released instead of the incoming one: the
    /// incoming stack may be the one the caller is still executing on.
    pub(crate) unsafe fn free(&mut self, top: *mut u8) {
        let item = (top as *mut SListItem).sub(1);
        std::ptr::write(item, SListItem::new());
        self.cache.push_back(item);
        if self.num_cached < self.max_cached {
            self.num_cached += 1;
            return;
        }
        let evicted = self.cache.pop();
        debug_assert!(!evicted.is_null());
        let evicted_top = (evicted as *mut u8).add(std::mem::size_of::<SListItem>());
        self.release(evicted_top);
    }

    /// Unprotect the guard page and hand the block back to the allocator.
    unsafe fn release(&mut self, top: *mut u8) {
        let total = self.total_size();
        let base = top.sub(total);
        let rc = libc::mprotect(
            base as *mut libc::c_void,
            self.page_size,
            libc::PROT_READ | libc::PROT_WRITE,
        );
        assert_eq!(rc, 0);
        libc::free(base as *mut libc::c_void);
    }

    /// Drop every cached stack.
    pub(crate) unsafe fn purge(&mut self) {
        loop {
            let item = self.cache.pop();
            if item.is_null() {
                break;
            }
            let top = (item as *mut u8).add(std::mem::size_of::<SListItem>());
            self.release(top);
        }
        self.num_cached = 0;
    }

    /// Resize stacks and preallocate `count` of them. On failure nothing
    /// is preallocated and the previous configuration is restored.
    pub(crate) unsafe fn prepare(&mut self, count: usize, stack_size: usize) -> Result<(), Error> {
        self.purge();
        let old_stack_size = self.stack_size;
        let old_sanitised = self.sanitised_size;
        self.stack_size = stack_size;
        self.sanitised_size = 0;
        for _ in 0..count {
            let top = self.alloc_mem();
            if top.is_null() {
                self.purge();
                self.stack_size = old_stack_size;
                self.sanitised_size = old_sanitised;
                return Err(Error::OutOfMemory);
            }
            let item = (top as *mut SListItem).sub(1);
            std::ptr::write(item, SListItem::new());
            self.cache.push_back(item);
        }
        self.num_cached = count;
        // Pin the preallocated stacks in the cache; the deallocation
        // path still needs one slot to park the caller's own stack.
        self.max_cached = count.max(1);
        Ok(())
    }
}

impl Drop for StackCache {
    fn drop(&mut self) {
        unsafe { self.purge() };
    }
}
