//! Heap allocator tests: bucket behavior, alignment, exhaustion, and the
//! deferred stack ring.

use quartz_abi::config::{HEAP_MIN_ALIGN, HEAP_PAGE_SIZE};
use quartz_lib::testing::TestResult;
use quartz_lib::{define_test_suite, fail};

use crate::heap::{heap_init, rt_free, rt_malloc};
use crate::stack_pool::{alloc_stack, defer_free_stack, drain_deferred_frees};

pub fn test_alloc_is_aligned() -> TestResult {
    heap_init();
    for size in [1usize, 17, 64, 500, 4000] {
        let p = rt_malloc(size);
        if p.is_null() {
            return fail!("alloc of {} failed", size);
        }
        if (p as usize) % HEAP_MIN_ALIGN != 0 {
            return fail!("alloc of {} misaligned: {:p}", size, p);
        }
        rt_free(p);
    }
    TestResult::Pass
}

pub fn test_free_then_realloc_reuses_block() -> TestResult {
    heap_init();
    let a = rt_malloc(100);
    if a.is_null() {
        return fail!();
    }
    rt_free(a);
    let b = rt_malloc(100);
    // Same bucket, LIFO free list: the block must come straight back.
    if a != b {
        return fail!("expected block reuse, got {:p} then {:p}", a, b);
    }
    rt_free(b);
    TestResult::Pass
}

pub fn test_large_alloc_takes_whole_pages() -> TestResult {
    heap_init();
    let p = rt_malloc(3 * HEAP_PAGE_SIZE);
    if p.is_null() {
        return fail!("multi-page alloc failed");
    }
    rt_free(p);
    // The pages must be reusable afterwards.
    let q = rt_malloc(3 * HEAP_PAGE_SIZE);
    if q.is_null() {
        return fail!("pages not returned on free");
    }
    rt_free(q);
    TestResult::Pass
}

pub fn test_zero_and_foreign_free_are_rejected() -> TestResult {
    heap_init();
    if !rt_malloc(0).is_null() {
        return fail!("zero-size alloc should fail");
    }
    // Freeing a pointer outside the pool must not corrupt anything.
    rt_free(0x1000 as *mut u8);
    let p = rt_malloc(64);
    if p.is_null() {
        return fail!("heap corrupted by foreign free");
    }
    rt_free(p);
    TestResult::Pass
}

pub fn test_deferred_stack_ring_drains() -> TestResult {
    heap_init();
    let mut stacks = [core::ptr::null_mut(); 4];
    for slot in stacks.iter_mut() {
        *slot = alloc_stack(0);
        if slot.is_null() {
            return fail!("stack alloc failed");
        }
    }
    for stack in stacks {
        defer_free_stack(stack);
    }
    if drain_deferred_frees() != 4 {
        return fail!("expected 4 deferred frees");
    }
    if drain_deferred_frees() != 0 {
        return fail!("ring should be empty after drain");
    }
    TestResult::Pass
}

define_test_suite!(
    mm_heap,
    [
        test_alloc_is_aligned,
        test_free_then_realloc_reuses_block,
        test_large_alloc_takes_whole_pages,
        test_zero_and_foreign_free_are_rejected,
        test_deferred_stack_ring_drains,
    ]
);
