// Test harness types: TestSuiteResult, TestSuiteDesc, TestRunSummary.
// Suites are auto-registered via #[link_section = ".test_registry"] in
// define_test_suite!.

use core::ffi::{c_char, c_int};
use core::ptr;
use core::sync::atomic::{AtomicU64, Ordering};

/// Maximum number of test suites that can be registered.
pub const HARNESS_MAX_SUITES: usize = 40;

/// Default cycles per millisecond estimate (3 GHz).
const DEFAULT_CYCLES_PER_MS: u64 = 3_000_000;

/// Result of executing a single test suite.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct TestSuiteResult {
    pub name: *const c_char,
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
    pub elapsed_ms: u32,
}

impl Default for TestSuiteResult {
    fn default() -> Self {
        Self {
            name: ptr::null(),
            total: 0,
            passed: 0,
            failed: 0,
            elapsed_ms: 0,
        }
    }
}

impl TestSuiteResult {
    pub fn all_passed(&self) -> bool {
        self.failed == 0
    }
}

pub type SuiteRunnerFn = extern "C" fn(*const (), *mut TestSuiteResult) -> i32;

#[repr(C)]
#[derive(Clone, Copy)]
pub struct TestSuiteDesc {
    pub name: *const c_char,
    pub run: Option<SuiteRunnerFn>,
}

// SAFETY: only raw pointers to static data and function pointers,
// read-only after registration.
unsafe impl Sync for TestSuiteDesc {}

/// Aggregated results across all suites.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct TestRunSummary {
    pub suites: [TestSuiteResult; HARNESS_MAX_SUITES],
    pub suite_count: usize,
    pub total_tests: u32,
    pub passed: u32,
    pub failed: u32,
    pub elapsed_ms: u32,
}

impl Default for TestRunSummary {
    fn default() -> Self {
        Self {
            suites: [TestSuiteResult::default(); HARNESS_MAX_SUITES],
            suite_count: 0,
            total_tests: 0,
            passed: 0,
            failed: 0,
            elapsed_ms: 0,
        }
    }
}

impl TestRunSummary {
    pub fn add_suite_result(&mut self, result: &TestSuiteResult) {
        if self.suite_count < HARNESS_MAX_SUITES {
            self.suites[self.suite_count] = *result;
            self.suite_count += 1;
        }
        self.total_tests = self.total_tests.saturating_add(result.total);
        self.passed = self.passed.saturating_add(result.passed);
        self.failed = self.failed.saturating_add(result.failed);
        self.elapsed_ms = self.elapsed_ms.saturating_add(result.elapsed_ms);
    }

    pub fn all_passed(&self) -> bool {
        self.failed == 0
    }

    pub fn exit_code(&self) -> c_int {
        if self.all_passed() { 0 } else { -1 }
    }
}

// =============================================================================
// Time measurement
// =============================================================================

static CACHED_CYCLES_PER_MS: AtomicU64 = AtomicU64::new(0);

/// Estimate CPU cycles per millisecond using CPUID leaf 0x16 when present.
pub fn estimate_cycles_per_ms() -> u64 {
    let cached = CACHED_CYCLES_PER_MS.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }

    let mut cycles_per_ms = DEFAULT_CYCLES_PER_MS;
    // SAFETY: CPUID is unprivileged on x86_64.
    let max_leaf = core::arch::x86_64::__cpuid(0).eax;
    if max_leaf >= 0x16 {
        let freq_mhz = core::arch::x86_64::__cpuid(0x16).eax;
        if freq_mhz != 0 {
            cycles_per_ms = freq_mhz as u64 * 1_000;
        }
    }

    CACHED_CYCLES_PER_MS.store(cycles_per_ms, Ordering::Relaxed);
    cycles_per_ms
}

/// Elapsed milliseconds between two TSC readings.
#[inline]
pub fn measure_elapsed_ms(start: u64, end: u64) -> u32 {
    let cycles_per_ms = estimate_cycles_per_ms();
    if cycles_per_ms == 0 {
        return 0;
    }
    let ms = end.wrapping_sub(start) / cycles_per_ms;
    ms.min(u32::MAX as u64) as u32
}
