//! Preemption control.
//!
//! RAII guards over the per-CPU preempt counter. A reschedule requested
//! while any guard is held is deferred and replayed through a registered
//! callback when the outermost guard drops.

use core::marker::PhantomData;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

use crate::pcr;

static RESCHEDULE_CALLBACK: AtomicPtr<()> = AtomicPtr::new(ptr::null_mut());

/// Nestable preemption-disable guard. !Send/!Sync: must stay on the CPU
/// that created it.
#[must_use = "if unused, preemption is immediately re-enabled"]
pub struct PreemptGuard {
    _marker: PhantomData<*mut ()>,
}

impl PreemptGuard {
    #[inline]
    pub fn new() -> Self {
        pcr::cpu_record(pcr::current_cpu_id())
            .preempt_count
            .fetch_add(1, Ordering::Relaxed);
        Self {
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn is_active() -> bool {
        pcr::cpu_record(pcr::current_cpu_id())
            .preempt_count
            .load(Ordering::Relaxed)
            > 0
    }

    #[inline]
    pub fn count() -> u32 {
        pcr::cpu_record(pcr::current_cpu_id())
            .preempt_count
            .load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_reschedule_pending() {
        pcr::cpu_record(pcr::current_cpu_id())
            .reschedule_pending
            .store(true, Ordering::Release);
    }

    #[inline]
    pub fn clear_reschedule_pending() {
        pcr::cpu_record(pcr::current_cpu_id())
            .reschedule_pending
            .store(false, Ordering::Release);
    }
}

impl Default for PreemptGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PreemptGuard {
    #[inline]
    fn drop(&mut self) {
        let record = pcr::cpu_record(pcr::current_cpu_id());
        let prev = record.preempt_count.fetch_sub(1, Ordering::Release);
        debug_assert!(prev > 0, "preempt_count underflow");

        if prev == 1 && record.reschedule_pending.swap(false, Ordering::AcqRel) {
            let fn_ptr = RESCHEDULE_CALLBACK.load(Ordering::Acquire);
            if !fn_ptr.is_null() {
                // SAFETY: set via register_reschedule_callback with a fn().
                let callback: fn() = unsafe { core::mem::transmute(fn_ptr) };
                callback();
            }
        }
    }
}

pub fn register_reschedule_callback(callback: fn()) {
    RESCHEDULE_CALLBACK.store(callback as *mut (), Ordering::Release);
}

#[inline]
pub fn is_preemption_disabled() -> bool {
    PreemptGuard::is_active()
}

#[inline]
pub fn preempt_count() -> u32 {
    PreemptGuard::count()
}
