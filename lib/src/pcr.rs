//! Per-CPU control records.
//!
//! The co-kernel does not own the boot path, so it cannot rely on a GS
//! base of its own. CPU identity and cross-CPU IPIs are provided by the
//! host integration layer through registered function pointers; until
//! registration everything reports CPU 0 and a single online CPU, which
//! is also what the test harness runs under.

use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, Ordering};

pub use quartz_abi::task::MAX_CPUS;

pub type CpuIdFn = fn() -> usize;
pub type SendIpiFn = fn(cpu: usize, vector: u8);

static CPU_ID_FN: AtomicPtr<()> = AtomicPtr::new(ptr::null_mut());
static SEND_IPI_FN: AtomicPtr<()> = AtomicPtr::new(ptr::null_mut());
static CPU_COUNT: AtomicU32 = AtomicU32::new(1);

/// Per-CPU record: flags the scheduler and pipeline need from any context.
#[repr(C, align(64))]
pub struct CpuRecord {
    pub online: AtomicBool,
    /// True while this CPU runs a real-time task (not the host task).
    pub realtime: AtomicBool,
    pub preempt_count: AtomicU32,
    pub reschedule_pending: AtomicBool,
    pub irq_count: AtomicU64,
}

impl CpuRecord {
    const fn new() -> Self {
        Self {
            online: AtomicBool::new(false),
            realtime: AtomicBool::new(false),
            preempt_count: AtomicU32::new(0),
            reschedule_pending: AtomicBool::new(false),
            irq_count: AtomicU64::new(0),
        }
    }
}

static CPU_RECORDS: [CpuRecord; MAX_CPUS] = {
    const INIT: CpuRecord = CpuRecord::new();
    [INIT; MAX_CPUS]
};

pub fn register_cpu_id_fn(f: CpuIdFn) {
    CPU_ID_FN.store(f as *mut (), Ordering::Release);
}

pub fn register_send_ipi_fn(f: SendIpiFn) {
    SEND_IPI_FN.store(f as *mut (), Ordering::Release);
}

#[inline]
pub fn current_cpu_id() -> usize {
    let ptr = CPU_ID_FN.load(Ordering::Acquire);
    if ptr.is_null() {
        return 0;
    }
    // SAFETY: only `CpuIdFn` values are stored.
    let f: CpuIdFn = unsafe { core::mem::transmute(ptr) };
    f().min(MAX_CPUS - 1)
}

/// Ask a remote CPU to rerun its scheduling decision. A no-op until the
/// host integration registers an IPI sender.
pub fn send_ipi_to_cpu(cpu: usize, vector: u8) {
    let ptr = SEND_IPI_FN.load(Ordering::Acquire);
    if ptr.is_null() || cpu >= MAX_CPUS {
        return;
    }
    // SAFETY: only `SendIpiFn` values are stored.
    let f: SendIpiFn = unsafe { core::mem::transmute(ptr) };
    f(cpu, vector);
}

pub fn set_cpu_count(count: usize) {
    CPU_COUNT.store(count.clamp(1, MAX_CPUS) as u32, Ordering::Release);
}

#[inline]
pub fn cpu_count() -> usize {
    CPU_COUNT.load(Ordering::Acquire) as usize
}

#[inline]
pub fn cpu_record(cpu: usize) -> &'static CpuRecord {
    &CPU_RECORDS[cpu.min(MAX_CPUS - 1)]
}

pub fn mark_cpu_online(cpu: usize) {
    cpu_record(cpu).online.store(true, Ordering::Release);
}

pub fn mark_cpu_offline(cpu: usize) {
    cpu_record(cpu).online.store(false, Ordering::Release);
}

#[inline]
pub fn is_cpu_online(cpu: usize) -> bool {
    cpu < MAX_CPUS && CPU_RECORDS[cpu].online.load(Ordering::Acquire)
}

/// Flip the "this CPU is executing real-time work" marker. The pipeline
/// consults it when deciding whether host-domain IRQs may be delivered
/// synchronously.
pub fn mark_cpu_realtime(cpu: usize, realtime: bool) {
    cpu_record(cpu).realtime.store(realtime, Ordering::Release);
}

#[inline]
pub fn is_cpu_realtime(cpu: usize) -> bool {
    cpu < MAX_CPUS && CPU_RECORDS[cpu].realtime.load(Ordering::Acquire)
}
