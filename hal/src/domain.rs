//! Pipeline domains.
//!
//! A domain is one priority level in the interrupt pipeline: an optional
//! catch-all entry point, a per-CPU stage flag, and a per-CPU pending
//! bitmap. Hardware delivery is never suppressed; "interrupts off" for a
//! domain is just its stage bit, so toggling it costs one atomic store
//! and the real-time domain above it keeps receiving everything.
//!
//! Domains are registered once at init (the real-time domain by the
//! pipeline itself, the host domain through the host hooks) and walked
//! in descending priority by the dispatcher in `pipeline`.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use quartz_abi::task::MAX_CPUS;
use quartz_lib::{IrqMutex, klog_info};

pub const MAX_DOMAINS: usize = 4;
pub const NR_IRQS: usize = 64;

pub type DomainId = usize;

/// Catch-all entry invoked for IRQs the domain has no per-IRQ handler
/// for. The host domain's entry is the host OS's own IRQ entry point.
pub type DomainEntry = fn(irq: u32);

pub(crate) struct DomainDesc {
    #[allow(dead_code)]
    pub name: &'static str,
    pub priority: i32,
    pub entry: Option<DomainEntry>,
    pub registered: bool,
}

impl DomainDesc {
    const fn empty() -> Self {
        Self {
            name: "",
            priority: 0,
            entry: None,
            registered: false,
        }
    }
}

pub(crate) struct DomainTable {
    pub domains: [DomainDesc; MAX_DOMAINS],
    /// Registered domain ids sorted by descending priority; the
    /// dispatcher walks this.
    pub order: [DomainId; MAX_DOMAINS],
    pub count: usize,
}

impl DomainTable {
    const fn new() -> Self {
        const INIT: DomainDesc = DomainDesc::empty();
        Self {
            domains: [INIT; MAX_DOMAINS],
            order: [0; MAX_DOMAINS],
            count: 0,
        }
    }

    fn resort(&mut self) {
        let mut order = [0usize; MAX_DOMAINS];
        let mut n = 0;
        for (id, dom) in self.domains.iter().enumerate() {
            if dom.registered {
                order[n] = id;
                n += 1;
            }
        }
        // Insertion sort by descending priority; MAX_DOMAINS is tiny.
        let mut i = 1;
        while i < n {
            let mut j = i;
            while j > 0 && self.domains[order[j - 1]].priority < self.domains[order[j]].priority {
                order.swap(j - 1, j);
                j -= 1;
            }
            i += 1;
        }
        self.order = order;
        self.count = n;
    }
}

pub(crate) static DOMAIN_TABLE: IrqMutex<DomainTable> = IrqMutex::new(DomainTable::new());

// Stage flags and pending bitmaps live outside the table lock: the whole
// point of the pipeline is that toggling a stage is a single atomic op.

static STAGE_DISABLED: [[AtomicBool; MAX_CPUS]; MAX_DOMAINS] = {
    const CPU: AtomicBool = AtomicBool::new(false);
    const ROW: [AtomicBool; MAX_CPUS] = [CPU; MAX_CPUS];
    [ROW; MAX_DOMAINS]
};

static PENDING: [[AtomicU64; MAX_CPUS]; MAX_DOMAINS] = {
    const CPU: AtomicU64 = AtomicU64::new(0);
    const ROW: [AtomicU64; MAX_CPUS] = [CPU; MAX_CPUS];
    [ROW; MAX_DOMAINS]
};

/// Permanent record of the CPUs each domain has run on.
static ACTIVE_CPUS: [AtomicU32; MAX_DOMAINS] = {
    const INIT: AtomicU32 = AtomicU32::new(0);
    [INIT; MAX_DOMAINS]
};

/// Register a domain. Returns its id, or None if the table is full.
pub fn register_domain(
    name: &'static str,
    priority: i32,
    entry: Option<DomainEntry>,
) -> Option<DomainId> {
    let mut table = DOMAIN_TABLE.lock();
    let id = table.domains.iter().position(|d| !d.registered)?;
    table.domains[id] = DomainDesc {
        name,
        priority,
        entry,
        registered: true,
    };
    table.resort();
    klog_info!("HAL: domain '{}' registered at priority {}", name, priority);
    Some(id)
}

/// Remove a domain from the walk. Pending bits for it are discarded.
pub fn unregister_domain(id: DomainId) {
    if id >= MAX_DOMAINS {
        return;
    }
    let mut table = DOMAIN_TABLE.lock();
    table.domains[id].registered = false;
    table.resort();
    for cpu in 0..MAX_CPUS {
        PENDING[id][cpu].store(0, Ordering::Release);
        STAGE_DISABLED[id][cpu].store(false, Ordering::Release);
    }
}

/// Atomically disable a domain's stage on the calling CPU. This is what
/// the host's cli becomes.
#[inline]
pub fn stage_disable(id: DomainId) {
    let cpu = quartz_lib::current_cpu_id();
    STAGE_DISABLED[id][cpu].store(true, Ordering::Release);
}

/// Re-enable the stage and drain anything that was deferred while it
/// was off. This is what the host's sti becomes.
#[inline]
pub fn stage_enable(id: DomainId) {
    let cpu = quartz_lib::current_cpu_id();
    STAGE_DISABLED[id][cpu].store(false, Ordering::Release);
    crate::pipeline::sync_stages(cpu);
}

#[inline]
pub fn stage_is_disabled(id: DomainId, cpu: usize) -> bool {
    STAGE_DISABLED[id][cpu].load(Ordering::Acquire)
}

/// Save the stage flag and disable it; pairs with [`stage_restore`].
#[inline]
pub fn stage_save_disable(id: DomainId) -> bool {
    let cpu = quartz_lib::current_cpu_id();
    STAGE_DISABLED[id][cpu].swap(true, Ordering::AcqRel)
}

#[inline]
pub fn stage_restore(id: DomainId, was_disabled: bool) {
    if !was_disabled {
        stage_enable(id);
    }
}

/// Clear the stage flag without draining; the dispatcher's own drain
/// loop uses this so re-enabling does not recurse into it.
#[inline]
pub(crate) fn stage_clear(id: DomainId, cpu: usize) {
    STAGE_DISABLED[id][cpu].store(false, Ordering::Release);
}

/// Post an IRQ into a domain's pending bitmap. Delivery happens when the
/// dispatcher reaches the domain with its stage enabled.
#[inline]
pub(crate) fn post_pending(id: DomainId, irq: u32, cpu: usize) {
    PENDING[id][cpu].fetch_or(1u64 << irq, Ordering::AcqRel);
}

/// Take the lowest pending IRQ off a domain's bitmap, if any.
pub(crate) fn take_pending(id: DomainId, cpu: usize) -> Option<u32> {
    let pending = &PENDING[id][cpu];
    loop {
        let bits = pending.load(Ordering::Acquire);
        if bits == 0 {
            return None;
        }
        let irq = bits.trailing_zeros();
        if pending
            .compare_exchange_weak(bits, bits & !(1 << irq), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            return Some(irq);
        }
    }
}

#[inline]
pub(crate) fn has_pending(id: DomainId, cpu: usize) -> bool {
    PENDING[id][cpu].load(Ordering::Acquire) != 0
}

pub(crate) fn mark_active(id: DomainId, cpu: usize) {
    ACTIVE_CPUS[id].fetch_or(1 << cpu, Ordering::Relaxed);
}

pub fn active_cpus(id: DomainId) -> u32 {
    ACTIVE_CPUS[id].load(Ordering::Relaxed)
}

/// Reset all domains (test fixtures).
pub fn reset_domains() {
    let mut table = DOMAIN_TABLE.lock();
    for dom in table.domains.iter_mut() {
        *dom = DomainDesc::empty();
    }
    table.order = [0; MAX_DOMAINS];
    table.count = 0;
    for id in 0..MAX_DOMAINS {
        ACTIVE_CPUS[id].store(0, Ordering::Relaxed);
        for cpu in 0..MAX_CPUS {
            PENDING[id][cpu].store(0, Ordering::Release);
            STAGE_DISABLED[id][cpu].store(false, Ordering::Release);
        }
    }
}
