//! Pipeline dispatch tests: domain ordering, stage deferral, propagation,
//! ACK discipline, and virtual IRQ bookkeeping.

use core::ffi::c_void;
use core::sync::atomic::{AtomicU64, Ordering};

use quartz_lib::testing::TestResult;
use quartz_lib::{define_test_suite, fail};

use crate::domain::{stage_disable, stage_enable};
use crate::host::{self, install_host_domain, install_rt_domain, propagate_irq};
use crate::pipeline::{self, IrqMode, alloc_virq, dispatch_irq, free_virq, virtualize_irq_from};

// Event log: a monotonically increasing sequence number per event kind
// lets tests assert ordering without a real trace buffer.
static SEQ: AtomicU64 = AtomicU64::new(0);
static RT_HANDLER_SEQ: AtomicU64 = AtomicU64::new(0);
static RT_HANDLER_HITS: AtomicU64 = AtomicU64::new(0);
static HOST_ENTRY_SEQ: AtomicU64 = AtomicU64::new(0);
static HOST_ENTRY_HITS: AtomicU64 = AtomicU64::new(0);
static ACK_SEQ: AtomicU64 = AtomicU64::new(0);

fn next_seq() -> u64 {
    SEQ.fetch_add(1, Ordering::Relaxed) + 1
}

fn rt_handler(_irq: u32, _cookie: *mut c_void) {
    RT_HANDLER_SEQ.store(next_seq(), Ordering::Relaxed);
    RT_HANDLER_HITS.fetch_add(1, Ordering::Relaxed);
}

fn rt_handler_propagating(irq: u32, _cookie: *mut c_void) {
    RT_HANDLER_SEQ.store(next_seq(), Ordering::Relaxed);
    RT_HANDLER_HITS.fetch_add(1, Ordering::Relaxed);
    propagate_irq(irq);
}

fn host_entry(_irq: u32) {
    HOST_ENTRY_SEQ.store(next_seq(), Ordering::Relaxed);
    HOST_ENTRY_HITS.fetch_add(1, Ordering::Relaxed);
}

fn ack_fn(_irq: u32) {
    ACK_SEQ.store(next_seq(), Ordering::Relaxed);
}

struct PipelineFixture;

impl PipelineFixture {
    fn new() -> Self {
        pipeline::reset_pipeline();
        host::reset_host();
        SEQ.store(0, Ordering::Relaxed);
        RT_HANDLER_SEQ.store(0, Ordering::Relaxed);
        RT_HANDLER_HITS.store(0, Ordering::Relaxed);
        HOST_ENTRY_SEQ.store(0, Ordering::Relaxed);
        HOST_ENTRY_HITS.store(0, Ordering::Relaxed);
        ACK_SEQ.store(0, Ordering::Relaxed);
        Self
    }
}

impl Drop for PipelineFixture {
    fn drop(&mut self) {
        pipeline::reset_pipeline();
        host::reset_host();
    }
}

pub fn test_rt_domain_sees_irq_host_does_not() -> TestResult {
    let _fixture = PipelineFixture::new();
    let rt = install_rt_domain().unwrap_or(usize::MAX);
    if install_host_domain(host_entry).is_err() {
        return fail!("host domain install failed");
    }
    if virtualize_irq_from(rt, 7, Some(rt_handler), core::ptr::null_mut(), None, IrqMode::HANDLE)
        .is_err()
    {
        return fail!("virtualize failed");
    }

    dispatch_irq(7);

    if RT_HANDLER_HITS.load(Ordering::Relaxed) != 1 {
        return fail!("rt handler should run exactly once");
    }
    if HOST_ENTRY_HITS.load(Ordering::Relaxed) != 0 {
        return fail!("HANDLE mode must not auto-forward to host");
    }
    TestResult::Pass
}

pub fn test_propagated_irq_reaches_host_once_after_rt() -> TestResult {
    let _fixture = PipelineFixture::new();
    let rt = install_rt_domain().unwrap_or(usize::MAX);
    if install_host_domain(host_entry).is_err() {
        return fail!("host domain install failed");
    }
    let _ = virtualize_irq_from(
        rt,
        7,
        Some(rt_handler_propagating),
        core::ptr::null_mut(),
        None,
        IrqMode::HANDLE,
    );

    dispatch_irq(7);

    if RT_HANDLER_HITS.load(Ordering::Relaxed) != 1 || HOST_ENTRY_HITS.load(Ordering::Relaxed) != 1
    {
        return fail!(
            "expected one rt + one host delivery, got {}/{}",
            RT_HANDLER_HITS.load(Ordering::Relaxed),
            HOST_ENTRY_HITS.load(Ordering::Relaxed)
        );
    }
    if HOST_ENTRY_SEQ.load(Ordering::Relaxed) <= RT_HANDLER_SEQ.load(Ordering::Relaxed) {
        return fail!("host ISR must run after the rt handler returns");
    }
    TestResult::Pass
}

pub fn test_disabled_host_stage_defers_delivery() -> TestResult {
    let _fixture = PipelineFixture::new();
    let rt = install_rt_domain().unwrap_or(usize::MAX);
    let host = match install_host_domain(host_entry) {
        Ok(id) => id,
        Err(_) => return fail!("host domain install failed"),
    };
    let _ = virtualize_irq_from(
        rt,
        3,
        Some(rt_handler_propagating),
        core::ptr::null_mut(),
        None,
        IrqMode::HANDLE,
    );

    stage_disable(host);
    dispatch_irq(3);
    if HOST_ENTRY_HITS.load(Ordering::Relaxed) != 0 {
        return fail!("delivery must defer while the stage is disabled");
    }

    stage_enable(host);
    if HOST_ENTRY_HITS.load(Ordering::Relaxed) != 1 {
        return fail!("stage_enable must drain exactly one pending delivery");
    }

    // A second enable must not replay the posting.
    stage_disable(host);
    stage_enable(host);
    if HOST_ENTRY_HITS.load(Ordering::Relaxed) != 1 {
        return fail!("posting delivered more than once");
    }
    TestResult::Pass
}

pub fn test_pass_mode_forwards_unconditionally() -> TestResult {
    let _fixture = PipelineFixture::new();
    let rt = install_rt_domain().unwrap_or(usize::MAX);
    let _ = install_host_domain(host_entry);
    let _ =
        virtualize_irq_from(rt, 5, Some(rt_handler), core::ptr::null_mut(), None, IrqMode::PASS);

    dispatch_irq(5);

    if RT_HANDLER_HITS.load(Ordering::Relaxed) != 1 || HOST_ENTRY_HITS.load(Ordering::Relaxed) != 1
    {
        return fail!("PASS must run the handler and forward");
    }
    TestResult::Pass
}

pub fn test_discard_swallows_irq() -> TestResult {
    let _fixture = PipelineFixture::new();
    let rt = install_rt_domain().unwrap_or(usize::MAX);
    let _ = install_host_domain(host_entry);
    let _ = virtualize_irq_from(rt, 9, None, core::ptr::null_mut(), None, IrqMode::DISCARD);

    dispatch_irq(9);

    if HOST_ENTRY_HITS.load(Ordering::Relaxed) != 0 {
        return fail!("DISCARD leaked to the host");
    }
    TestResult::Pass
}

pub fn test_ack_runs_before_handler() -> TestResult {
    let _fixture = PipelineFixture::new();
    let rt = install_rt_domain().unwrap_or(usize::MAX);
    let _ = install_host_domain(host_entry);
    let _ = virtualize_irq_from(
        rt,
        4,
        Some(rt_handler),
        core::ptr::null_mut(),
        Some(ack_fn),
        IrqMode::HANDLE,
    );

    dispatch_irq(4);

    let ack = ACK_SEQ.load(Ordering::Relaxed);
    let handler = RT_HANDLER_SEQ.load(Ordering::Relaxed);
    if ack == 0 || handler == 0 || ack >= handler {
        return fail!("ack seq {} must precede handler seq {}", ack, handler);
    }
    TestResult::Pass
}

pub fn test_unrouted_irq_falls_through_to_host() -> TestResult {
    let _fixture = PipelineFixture::new();
    let _ = install_rt_domain();
    let _ = install_host_domain(host_entry);

    dispatch_irq(11);

    if HOST_ENTRY_HITS.load(Ordering::Relaxed) != 1 {
        return fail!("unrouted IRQ should reach the host entry");
    }
    TestResult::Pass
}

pub fn test_virq_allocation_is_unique() -> TestResult {
    let _fixture = PipelineFixture::new();
    let a = match alloc_virq() {
        Ok(v) => v,
        Err(_) => return fail!("virq alloc failed"),
    };
    let b = match alloc_virq() {
        Ok(v) => v,
        Err(_) => return fail!("second virq alloc failed"),
    };
    if a == b {
        return fail!("duplicate virq {}", a);
    }
    if free_virq(a).is_err() || free_virq(b).is_err() {
        return fail!("virq free failed");
    }
    // Freed numbers are reusable.
    match alloc_virq() {
        Ok(v) if v == a || v == b => TestResult::Pass,
        Ok(v) => {
            let _ = free_virq(v);
            fail!("freed virq not reused, got {}", v)
        }
        Err(_) => fail!("realloc failed"),
    }
}

define_test_suite!(
    hal_pipeline,
    [
        test_rt_domain_sees_irq_host_does_not,
        test_propagated_irq_reaches_host_once_after_rt,
        test_disabled_host_stage_defers_delivery,
        test_pass_mode_forwards_unconditionally,
        test_discard_swallows_irq,
        test_ack_runs_before_handler,
        test_unrouted_irq_falls_through_to_host,
        test_virq_allocation_is_unique,
    ]
);
