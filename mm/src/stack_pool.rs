//! Task stack allocation with deferred release.
//!
//! Stacks are carved from the real-time heap. A deleted task's stack
//! cannot be freed while its CPU may still be running on it, so deletion
//! parks the pointer in a fixed ring that is drained later from
//! non-real-time context (the host domain, or a test fixture).

use core::ffi::c_void;
use core::ptr;

use quartz_abi::config::STACK_DEFAULT_SIZE;
use quartz_lib::IrqMutex;
use quartz_lib::klog_warn;

use crate::heap::{rt_free, rt_malloc};

const MAX_DEFERRED_STACKS: usize = 64;

struct DeferredRing {
    slots: [*mut c_void; MAX_DEFERRED_STACKS],
    head: usize,
    tail: usize,
}

// SAFETY: pointers in the ring are owned by the ring until drained;
// access is serialized by the IrqMutex.
unsafe impl Send for DeferredRing {}

impl DeferredRing {
    const fn new() -> Self {
        Self {
            slots: [ptr::null_mut(); MAX_DEFERRED_STACKS],
            head: 0,
            tail: 0,
        }
    }

    fn push(&mut self, p: *mut c_void) -> bool {
        let next = (self.head + 1) % MAX_DEFERRED_STACKS;
        if next == self.tail {
            return false;
        }
        self.slots[self.head] = p;
        self.head = next;
        true
    }

    fn pop(&mut self) -> Option<*mut c_void> {
        if self.tail == self.head {
            return None;
        }
        let p = self.slots[self.tail];
        self.tail = (self.tail + 1) % MAX_DEFERRED_STACKS;
        Some(p)
    }
}

static DEFERRED: IrqMutex<DeferredRing> = IrqMutex::new(DeferredRing::new());

/// Allocate a task stack. Zero size means `STACK_DEFAULT_SIZE`. The
/// returned base is 16-aligned; the usable top is `base + size`.
pub fn alloc_stack(size: usize) -> *mut u8 {
    let size = if size == 0 { STACK_DEFAULT_SIZE } else { size };
    rt_malloc(size)
}

/// Park a dead task's stack for later release. Never blocks; if the ring
/// is full the stack leaks with a log line, which beats freeing under a
/// live stack pointer.
pub fn defer_free_stack(base: *mut u8) {
    if base.is_null() {
        return;
    }
    if !DEFERRED.lock().push(base as *mut c_void) {
        klog_warn!("MM: deferred stack ring full, leaking {:p}", base);
    }
}

/// Release every parked stack. Must run outside real-time context.
/// Returns the number of stacks freed.
pub fn drain_deferred_frees() -> usize {
    let mut freed = 0;
    loop {
        let next = DEFERRED.lock().pop();
        match next {
            Some(p) => {
                rt_free(p as *mut u8);
                freed += 1;
            }
            None => return freed,
        }
    }
}
