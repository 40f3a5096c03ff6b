//! The host-OS contract.
//!
//! The host exposes exactly four hooks to the pipeline, and the pipeline
//! exposes the virtualized interrupt flag back to the host:
//!
//! 1. [`install_host_domain`]: register the host's IRQ entry point as
//!    the lowest-priority domain.
//! 2. [`propagate_irq`]: hand an IRQ to the host domain.
//! 3. [`alloc_virq`] / [`free_virq`]: software-only IRQ numbers.
//! 4. [`set_root_affinity`]: pin the host to a CPU subset during
//!    init/teardown.
//!
//! After installation the host's cli/sti must be redirected to
//! [`host_cli`]/[`host_sti`]: the stage flag is the only "mask" the host
//! ever gets, so it can never delay a real-time interrupt.

use core::sync::atomic::{AtomicI64, AtomicU32, AtomicUsize, Ordering};

use quartz_abi::RtError;
use quartz_abi::error::RtResult;
use quartz_lib::klog_info;

use crate::domain::{self, DomainEntry, DomainId};
use crate::pipeline;

pub use crate::pipeline::{alloc_virq, free_virq};

pub const RT_DOMAIN_PRIORITY: i32 = 100;
pub const HOST_DOMAIN_PRIORITY: i32 = 0;

const NO_DOMAIN: usize = usize::MAX;

static RT_DOMAIN: AtomicUsize = AtomicUsize::new(NO_DOMAIN);
static HOST_DOMAIN: AtomicUsize = AtomicUsize::new(NO_DOMAIN);
static ROOT_AFFINITY: AtomicU32 = AtomicU32::new(u32::MAX);

/// Host tick period fed to the tick-recovery logic. 100 Hz default.
static HOST_TICK_NS: AtomicI64 = AtomicI64::new(10_000_000);

/// Register the real-time domain at the top of the pipeline. Idempotent.
pub fn install_rt_domain() -> RtResult<DomainId> {
    let existing = RT_DOMAIN.load(Ordering::Acquire);
    if existing != NO_DOMAIN {
        return Ok(existing);
    }
    let id = domain::register_domain("realtime", RT_DOMAIN_PRIORITY, None)
        .ok_or(RtError::NoResource)?;
    RT_DOMAIN.store(id, Ordering::Release);
    Ok(id)
}

/// Hook 1: register the host's IRQ entry point below the real-time
/// domain. The returned id is what `host_cli`/`host_sti` act on.
pub fn install_host_domain(entry: DomainEntry) -> RtResult<DomainId> {
    let existing = HOST_DOMAIN.load(Ordering::Acquire);
    if existing != NO_DOMAIN {
        return Err(RtError::Busy);
    }
    let id = domain::register_domain("host", HOST_DOMAIN_PRIORITY, Some(entry))
        .ok_or(RtError::NoResource)?;
    HOST_DOMAIN.store(id, Ordering::Release);
    klog_info!("HAL: host domain installed");
    Ok(id)
}

pub fn rt_domain() -> Option<DomainId> {
    match RT_DOMAIN.load(Ordering::Acquire) {
        NO_DOMAIN => None,
        id => Some(id),
    }
}

pub fn host_domain() -> Option<DomainId> {
    match HOST_DOMAIN.load(Ordering::Acquire) {
        NO_DOMAIN => None,
        id => Some(id),
    }
}

/// Hook 2: post an IRQ to the host domain's pending bitmap. It is
/// delivered when the host stage is enabled and the CPU is not busy with
/// real-time work above it.
pub fn propagate_irq(irq: u32) {
    let id = HOST_DOMAIN.load(Ordering::Acquire);
    if id == NO_DOMAIN {
        return;
    }
    let cpu = quartz_lib::current_cpu_id();
    crate::domain::post_pending(id, irq, cpu);
}

/// Hook 4: pin the host to a CPU subset during init/teardown.
pub fn set_root_affinity(cpu_mask: u32) {
    ROOT_AFFINITY.store(cpu_mask, Ordering::Release);
}

pub fn root_affinity() -> u32 {
    ROOT_AFFINITY.load(Ordering::Acquire)
}

/// The host's redirected cli: one atomic bit, no hardware masking.
#[inline]
pub fn host_cli() {
    let id = HOST_DOMAIN.load(Ordering::Acquire);
    if id != NO_DOMAIN {
        domain::stage_disable(id);
    }
}

/// The host's redirected sti: re-enable the stage and drain whatever
/// the real-time side deferred onto it.
#[inline]
pub fn host_sti() {
    let id = HOST_DOMAIN.load(Ordering::Acquire);
    if id != NO_DOMAIN {
        domain::stage_enable(id);
    }
}

pub fn set_host_tick_ns(ns: i64) {
    HOST_TICK_NS.store(ns.max(1), Ordering::Release);
}

pub fn host_tick_ns() -> i64 {
    HOST_TICK_NS.load(Ordering::Acquire)
}

/// Deliver any pending host-domain work now; used by the scheduler when
/// the CPU drops back to the host task.
pub fn sync_host_stage() {
    pipeline::sync_stages(quartz_lib::current_cpu_id());
}

/// Reset host glue (test fixtures).
pub fn reset_host() {
    RT_DOMAIN.store(NO_DOMAIN, Ordering::Release);
    HOST_DOMAIN.store(NO_DOMAIN, Ordering::Release);
    ROOT_AFFINITY.store(u32::MAX, Ordering::Release);
    HOST_TICK_NS.store(10_000_000, Ordering::Release);
}
