//! Recursive spinlocks.
//!
//! Owner-identity spinlocks for short critical sections shared between
//! task and interrupt context. Re-entry by the owning task nests; the
//! interrupt flag is stashed on the first acquisition and restored on
//! the outermost release, so nesting sections compose without enabling
//! interrupts early.

use core::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, Ordering};

use quartz_abi::RtError;
use quartz_abi::error::RtResult;
use quartz_lib::{cpu, tsc};
use quartz_sched::api::whoami;
use quartz_sched::task::NO_TASK;

pub struct SpinLock {
    owner: AtomicU16,
    depth: AtomicU32,
    saved_flags: AtomicU64,
}

impl SpinLock {
    pub const fn new() -> Self {
        Self {
            owner: AtomicU16::new(NO_TASK),
            depth: AtomicU32::new(0),
            saved_flags: AtomicU64::new(0),
        }
    }
}

impl Default for SpinLock {
    fn default() -> Self {
        Self::new()
    }
}

pub fn spl_init(spl: &SpinLock) {
    spl.owner.store(NO_TASK, Ordering::Release);
    spl.depth.store(0, Ordering::Release);
}

/// Acquire, spinning. Re-entry by the current owner nests.
pub fn spl_lock(spl: &SpinLock) {
    let flags = cpu::save_flags_cli();
    let me = whoami().raw();
    if spl.owner.load(Ordering::Acquire) == me {
        spl.depth.fetch_add(1, Ordering::Relaxed);
        return;
    }
    while spl
        .owner
        .compare_exchange_weak(NO_TASK, me, Ordering::Acquire, Ordering::Relaxed)
        .is_err()
    {
        core::hint::spin_loop();
    }
    spl.saved_flags.store(flags, Ordering::Relaxed);
}

/// Try to acquire without spinning.
pub fn spl_lock_if(spl: &SpinLock) -> RtResult<()> {
    let flags = cpu::save_flags_cli();
    let me = whoami().raw();
    if spl.owner.load(Ordering::Acquire) == me {
        spl.depth.fetch_add(1, Ordering::Relaxed);
        return Ok(());
    }
    if spl
        .owner
        .compare_exchange(NO_TASK, me, Ordering::Acquire, Ordering::Relaxed)
        .is_ok()
    {
        spl.saved_flags.store(flags, Ordering::Relaxed);
        Ok(())
    } else {
        cpu::restore_flags(flags);
        Err(RtError::WouldBlock)
    }
}

/// Acquire, giving up after `ns` nanoseconds of spinning.
pub fn spl_lock_timed(spl: &SpinLock, ns: i64) -> RtResult<()> {
    let flags = cpu::save_flags_cli();
    let me = whoami().raw();
    if spl.owner.load(Ordering::Acquire) == me {
        spl.depth.fetch_add(1, Ordering::Relaxed);
        return Ok(());
    }
    let tuned = quartz_hal::clock::tuned();
    let budget = if tuned.cpu_freq != 0 {
        quartz_lib::llimd(ns, tuned.cpu_freq as u32, 1_000_000_000)
    } else {
        ns
    };
    let end = tsc::rdtsc() as i64 + budget;
    loop {
        if spl
            .owner
            .compare_exchange_weak(NO_TASK, me, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            spl.saved_flags.store(flags, Ordering::Relaxed);
            return Ok(());
        }
        if (tsc::rdtsc() as i64) >= end {
            cpu::restore_flags(flags);
            return Err(RtError::Timeout);
        }
        core::hint::spin_loop();
    }
}

// --- Named spinlocks ---------------------------------------------------------

const MAX_NAMED_SPLS: usize = 16;

static NAMED_SPLS: [SpinLock; MAX_NAMED_SPLS] = {
    const INIT: SpinLock = SpinLock::new();
    [INIT; MAX_NAMED_SPLS]
};

/// Allocation bitmap for the named spinlock pool.
static NAMED_SPL_MAP: AtomicU32 = AtomicU32::new(0);

/// Find-or-create a named spinlock.
pub fn named_spl_init(name: &str) -> RtResult<&'static SpinLock> {
    let num = quartz_sched::registry::nam2num(name);
    if let Some(adr) = quartz_sched::registry::get_adr(num) {
        return NAMED_SPLS.get(adr as usize).ok_or(RtError::InvalidArg);
    }

    let slot = loop {
        let map = NAMED_SPL_MAP.load(Ordering::Acquire);
        let free = !map & ((1 << MAX_NAMED_SPLS) - 1);
        if free == 0 {
            return Err(RtError::NoResource);
        }
        let bit = free.trailing_zeros() as usize;
        if NAMED_SPL_MAP
            .compare_exchange_weak(map, map | (1 << bit), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            break bit;
        }
    };

    match quartz_sched::registry::register(
        num,
        quartz_abi::task::ObjectType::SpinLock,
        slot as *mut core::ffi::c_void,
        u16::MAX,
        0,
    ) {
        Ok(_) => {
            spl_init(&NAMED_SPLS[slot]);
            Ok(&NAMED_SPLS[slot])
        }
        Err(err) => {
            NAMED_SPL_MAP.fetch_and(!(1 << slot), Ordering::AcqRel);
            Err(err)
        }
    }
}

pub fn named_spl_delete(name: &str) -> RtResult<()> {
    let num = quartz_sched::registry::nam2num(name);
    let adr = quartz_sched::registry::get_adr(num).ok_or(RtError::InvalidArg)?;
    let slot = adr as usize;
    if slot < MAX_NAMED_SPLS {
        NAMED_SPL_MAP.fetch_and(!(1 << slot), Ordering::AcqRel);
    }
    quartz_sched::registry::drop_name(num)
}

/// Release one nesting level; the outermost release restores the
/// interrupt flag stashed at first acquisition.
pub fn spl_unlock(spl: &SpinLock) -> RtResult<()> {
    let flags = cpu::save_flags_cli();
    let me = whoami().raw();
    if spl.owner.load(Ordering::Acquire) != me {
        cpu::restore_flags(flags);
        return Err(RtError::Busy);
    }
    if spl.depth.load(Ordering::Relaxed) > 0 {
        spl.depth.fetch_sub(1, Ordering::Relaxed);
        return Ok(());
    }
    let saved = spl.saved_flags.load(Ordering::Relaxed);
    spl.owner.store(NO_TASK, Ordering::Release);
    cpu::restore_flags(saved);
    Ok(())
}
