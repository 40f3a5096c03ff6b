//! The interrupt pipeline: per-IRQ virtualization and the dispatch walk.
//!
//! Every hardware IRQ enters [`dispatch_irq`], which posts it to the
//! highest-priority domain and then synchronizes the pipeline: each
//! domain's pending IRQs are delivered in priority order, stopping at
//! the first domain whose stage is disabled on this CPU. Re-enabling a
//! stage resumes the walk, so a domain sees each posting exactly once
//! and never before every higher domain has seen it.
//!
//! The dispatcher holds physical interrupts off only across its own
//! bookkeeping; handlers run with whatever interrupt state they were
//! installed to expect.

use core::ffi::c_void;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicUsize, Ordering};

use quartz_abi::RtError;
use quartz_abi::error::RtResult;
use quartz_abi::task::MAX_CPUS;
use quartz_lib::{IrqMutex, klog_info, tsc};

use crate::clock;
use crate::domain::{
    self, DOMAIN_TABLE, DomainId, MAX_DOMAINS, NR_IRQS, post_pending, stage_is_disabled,
    take_pending,
};

/// First IRQ number reserved for software-only (virtual) IRQs.
pub const FIRST_VIRQ: u32 = 32;

pub type IrqHandler = fn(irq: u32, cookie: *mut c_void);
pub type AckHandler = fn(irq: u32);

bitflags::bitflags! {
    /// Post-handler propagation control for a virtualized IRQ.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct IrqMode: u8 {
        /// Forward to the next domain unconditionally after the handler.
        const PASS    = 0x01;
        /// The handler decides; it forwards via an explicit `propagate`.
        const HANDLE  = 0x02;
        /// Like HANDLE but the decision is made per delivery.
        const DYNAMIC = 0x04;
        /// Swallow the IRQ entirely.
        const DISCARD = 0x08;
    }
}

#[derive(Clone, Copy)]
struct IrqSlot {
    handler: Option<IrqHandler>,
    cookie: *mut c_void,
    ack: Option<AckHandler>,
    mode: IrqMode,
    hits: u64,
}

impl IrqSlot {
    const fn empty() -> Self {
        Self {
            handler: None,
            cookie: ptr::null_mut(),
            ack: None,
            mode: IrqMode::PASS,
            hits: 0,
        }
    }
}

/// Per-domain handler tables. Slots hold raw cookies installed by
/// drivers; access is serialized by the IrqMutex.
struct SlotTable {
    slots: [[IrqSlot; NR_IRQS]; MAX_DOMAINS],
}

// SAFETY: cookies are opaque driver pointers, only handed back to the
// handler they were installed with; the mutex serializes table access.
unsafe impl Send for SlotTable {}

impl SlotTable {
    const fn new() -> Self {
        const SLOT: IrqSlot = IrqSlot::empty();
        const ROW: [IrqSlot; NR_IRQS] = [SLOT; NR_IRQS];
        Self {
            slots: [ROW; MAX_DOMAINS],
        }
    }
}

static SLOTS: IrqMutex<SlotTable> = IrqMutex::new(SlotTable::new());

/// Allocation bitmap for virtual IRQ numbers.
static VIRQ_MAP: AtomicU64 = AtomicU64::new(0);

/// Index (into the walk order) of the domain currently being delivered
/// to, per CPU. `propagate` uses it to find "the next domain down".
static CURRENT_STAGE: [AtomicUsize; MAX_CPUS] = {
    const INIT: AtomicUsize = AtomicUsize::new(usize::MAX);
    [INIT; MAX_CPUS]
};

/// One-shot "unknown IRQ" reporting, per line.
static REPORTED_UNKNOWN: [AtomicBool; NR_IRQS] = {
    const INIT: AtomicBool = AtomicBool::new(false);
    [INIT; NR_IRQS]
};

// --- Watchdog hook -----------------------------------------------------------

/// Called when a real-time handler overruns `watchdog_threshold_ns`.
pub type WatchdogKick = fn(cpu: usize, irq: u32);

static WATCHDOG_KICK: AtomicPtr<()> = AtomicPtr::new(ptr::null_mut());
static WATCHDOG_THRESHOLD_TSC: AtomicU64 = AtomicU64::new(0);

pub fn register_watchdog_kick(kick: WatchdogKick, threshold_ns: i64) {
    let tuned = clock::tuned();
    let ticks = if tuned.cpu_freq != 0 && threshold_ns > 0 {
        quartz_lib::math::llimd(threshold_ns, tuned.cpu_freq as u32, 1_000_000_000) as u64
    } else {
        0
    };
    WATCHDOG_THRESHOLD_TSC.store(ticks, Ordering::Release);
    WATCHDOG_KICK.store(kick as *mut (), Ordering::Release);
}

pub fn unregister_watchdog_kick() {
    WATCHDOG_KICK.store(ptr::null_mut(), Ordering::Release);
    WATCHDOG_THRESHOLD_TSC.store(0, Ordering::Release);
}

// --- Installation ------------------------------------------------------------

/// Install `handler` for `irq` in `domain`, with an optional `ack`
/// callback that runs before any handler and replaces the host's own
/// acknowledge path for this line.
pub fn virtualize_irq_from(
    domain: DomainId,
    irq: u32,
    handler: Option<IrqHandler>,
    cookie: *mut c_void,
    ack: Option<AckHandler>,
    mode: IrqMode,
) -> RtResult<()> {
    if domain >= MAX_DOMAINS || irq as usize >= NR_IRQS {
        return Err(RtError::InvalidArg);
    }
    if mode.contains(IrqMode::DISCARD) && handler.is_some() {
        return Err(RtError::InvalidArg);
    }
    {
        let table = DOMAIN_TABLE.lock();
        if !table.domains[domain].registered {
            return Err(RtError::InvalidArg);
        }
    }
    let mut slots = SLOTS.lock();
    let slot = &mut slots.slots[domain][irq as usize];
    if handler.is_some() && slot.handler.is_some() {
        return Err(RtError::Busy);
    }
    *slot = IrqSlot {
        handler,
        cookie,
        ack,
        mode,
        hits: 0,
    };
    REPORTED_UNKNOWN[irq as usize].store(false, Ordering::Relaxed);
    Ok(())
}

/// Tear down a virtualized IRQ; further deliveries pass through.
pub fn release_irq(domain: DomainId, irq: u32) -> RtResult<()> {
    if domain >= MAX_DOMAINS || irq as usize >= NR_IRQS {
        return Err(RtError::InvalidArg);
    }
    let mut slots = SLOTS.lock();
    slots.slots[domain][irq as usize] = IrqSlot::empty();
    Ok(())
}

pub fn irq_hits(domain: DomainId, irq: u32) -> u64 {
    if domain >= MAX_DOMAINS || irq as usize >= NR_IRQS {
        return 0;
    }
    SLOTS.lock().slots[domain][irq as usize].hits
}

// --- Virtual IRQs ------------------------------------------------------------

/// Allocate a software-only IRQ number.
pub fn alloc_virq() -> RtResult<u32> {
    loop {
        let map = VIRQ_MAP.load(Ordering::Acquire);
        let free = !map;
        if free == 0 {
            return Err(RtError::NoResource);
        }
        let bit = free.trailing_zeros();
        if FIRST_VIRQ + bit >= NR_IRQS as u32 {
            return Err(RtError::NoResource);
        }
        if VIRQ_MAP
            .compare_exchange_weak(map, map | (1 << bit), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            return Ok(FIRST_VIRQ + bit);
        }
    }
}

pub fn free_virq(virq: u32) -> RtResult<()> {
    if !(FIRST_VIRQ..NR_IRQS as u32).contains(&virq) {
        return Err(RtError::InvalidArg);
    }
    VIRQ_MAP.fetch_and(!(1 << (virq - FIRST_VIRQ)), Ordering::AcqRel);
    Ok(())
}

// --- Dispatch ----------------------------------------------------------------

/// Hardware entry point: post `irq` at the top of the pipeline and
/// synchronize. Unknown lines are dropped with a once-per-line log.
pub fn dispatch_irq(irq: u32) {
    let cpu = quartz_lib::current_cpu_id();
    quartz_lib::pcr::cpu_record(cpu).irq_count.fetch_add(1, Ordering::Relaxed);

    if irq as usize >= NR_IRQS {
        if !REPORTED_UNKNOWN[NR_IRQS - 1].swap(true, Ordering::Relaxed) {
            klog_info!("HAL: dropping out-of-range IRQ {}", irq);
        }
        return;
    }

    let top = {
        let table = DOMAIN_TABLE.lock();
        if table.count == 0 {
            return;
        }
        table.order[0]
    };
    post_pending(top, irq, cpu);
    sync_stages(cpu);
}

/// Post a (usually virtual) IRQ at the top of the pipeline. Used for
/// cross-domain wake-ups, including "hand control back to the host now".
pub fn trigger(irq: u32) {
    dispatch_irq(irq);
}

/// From within a handler: hand the IRQ to the next lower-priority
/// domain. Outside of dispatch this posts to the lowest domain.
pub fn propagate(irq: u32) {
    let cpu = quartz_lib::current_cpu_id();
    if irq as usize >= NR_IRQS {
        return;
    }
    let target = {
        let table = DOMAIN_TABLE.lock();
        if table.count == 0 {
            return;
        }
        let stage = CURRENT_STAGE[cpu].load(Ordering::Relaxed);
        if stage < table.count - 1 {
            table.order[stage + 1]
        } else if stage == usize::MAX {
            table.order[table.count - 1]
        } else {
            return; // already at the lowest domain
        }
    };
    post_pending(target, irq, cpu);
}

/// Walk the pipeline for this CPU, delivering pending IRQs in priority
/// order and stopping at the first stage-disabled domain.
///
/// The top stage has no delivery guard: its handlers are written
/// re-entrant (the timer ISR may switch stacks mid-handler and fire
/// again on the new stack). Every lower stage masks itself while it
/// drains, so a dispatch nested inside one of its handlers defers back
/// to the active drain instead of re-entering it; if the drain is
/// suspended by preemption, the stage stays masked until that context
/// resumes, which is exactly the "host never runs under real-time
/// activity" rule.
pub fn sync_stages(cpu: usize) {
    loop {
        let mut delivered = false;
        let (order, count) = {
            let table = DOMAIN_TABLE.lock();
            (table.order, table.count)
        };

        'walk: for stage in 0..count {
            let dom = order[stage];
            if stage_is_disabled(dom, cpu) {
                break 'walk;
            }
            if !domain::has_pending(dom, cpu) {
                continue;
            }

            let guard_stage = stage != 0;
            if guard_stage && domain::stage_save_disable(dom) {
                // Someone below us on this stack is already draining.
                break 'walk;
            }

            while let Some(irq) = take_pending(dom, cpu) {
                CURRENT_STAGE[cpu].store(stage, Ordering::Relaxed);
                deliver(dom, stage, irq, cpu, count, &order);
                CURRENT_STAGE[cpu].store(usize::MAX, Ordering::Relaxed);
                delivered = true;
            }

            if guard_stage {
                domain::stage_clear(dom, cpu);
            }
            // A handler may have disabled our own stage for real.
            if stage_is_disabled(dom, cpu) {
                break 'walk;
            }
        }

        if !delivered {
            return;
        }
    }
}

fn deliver(dom: DomainId, stage: usize, irq: u32, cpu: usize, count: usize, order: &[DomainId]) {
    domain::mark_active(dom, cpu);

    let (slot, entry) = {
        let mut slots = SLOTS.lock();
        slots.slots[dom][irq as usize].hits += 1;
        let slot = slots.slots[dom][irq as usize];
        let entry = DOMAIN_TABLE.lock().domains[dom].entry;
        (slot, entry)
    };

    if let Some(ack) = slot.ack {
        ack(irq);
    }

    if slot.mode.contains(IrqMode::DISCARD) {
        return;
    }

    match slot.handler {
        Some(handler) => {
            let start = tsc::rdtsc();
            handler(irq, slot.cookie);
            let threshold = WATCHDOG_THRESHOLD_TSC.load(Ordering::Acquire);
            if threshold != 0 && tsc::rdtsc().wrapping_sub(start) > threshold {
                let kick = WATCHDOG_KICK.load(Ordering::Acquire);
                if !kick.is_null() {
                    // SAFETY: only WatchdogKick values are stored.
                    let kick: WatchdogKick = unsafe { core::mem::transmute(kick) };
                    kick(cpu, irq);
                }
            }
            if slot.mode.contains(IrqMode::PASS) && stage + 1 < count {
                post_pending(order[stage + 1], irq, cpu);
            }
        }
        None => match entry {
            Some(entry) => entry(irq),
            None if stage + 1 < count => post_pending(order[stage + 1], irq, cpu),
            None => {
                if !REPORTED_UNKNOWN[irq as usize].swap(true, Ordering::Relaxed) {
                    klog_info!("HAL: IRQ {} reached the bottom of the pipeline unhandled", irq);
                }
            }
        },
    }
}

/// Reset pipeline state (test fixtures).
pub fn reset_pipeline() {
    let mut slots = SLOTS.lock();
    const SLOT: IrqSlot = IrqSlot::empty();
    const ROW: [IrqSlot; NR_IRQS] = [SLOT; NR_IRQS];
    slots.slots = [ROW; MAX_DOMAINS];
    drop(slots);
    VIRQ_MAP.store(0, Ordering::Release);
    for cpu in 0..MAX_CPUS {
        CURRENT_STAGE[cpu].store(usize::MAX, Ordering::Relaxed);
    }
    for line in REPORTED_UNKNOWN.iter() {
        line.store(false, Ordering::Relaxed);
    }
    unregister_watchdog_kick();
    domain::reset_domains();
}
