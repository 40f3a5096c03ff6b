//! Suite runner.
//!
//! `define_test_suite!` places a descriptor for every suite in the
//! `.test_registry` link section; the linker brackets that section with
//! start/stop symbols, and this runner walks the bracket and executes
//! everything it finds. The kernel entry that wants self-tests calls
//! [`run_all_suites`] once the scheduler fixture state is available.

use quartz_lib::klog_info;
use quartz_lib::testing::{TestRunSummary, TestSuiteDesc, TestSuiteResult};

unsafe extern "C" {
    static __start_test_registry: TestSuiteDesc;
    static __stop_test_registry: TestSuiteDesc;
}

fn registered_suites() -> &'static [TestSuiteDesc] {
    // SAFETY: the linker guarantees the bracket symbols delimit an
    // array of TestSuiteDesc contributed by define_test_suite!.
    unsafe {
        let start = &__start_test_registry as *const TestSuiteDesc;
        let stop = &__stop_test_registry as *const TestSuiteDesc;
        let count = stop.offset_from(start).max(0) as usize;
        core::slice::from_raw_parts(start, count)
    }
}

/// Run every registered suite, logging a summary line per suite and an
/// aggregate at the end.
pub fn run_all_suites() -> TestRunSummary {
    let mut summary = TestRunSummary::default();
    for desc in registered_suites() {
        let Some(run) = desc.run else { continue };
        let mut result = TestSuiteResult::default();
        let _ = run(core::ptr::null(), &mut result);
        if !result.name.is_null() {
            // SAFETY: suite names are static NUL-terminated byte strings.
            let name = unsafe { core::ffi::CStr::from_ptr(result.name) };
            klog_info!(
                "TEST SUITE {:?}: {}/{} passed in {}ms",
                name,
                result.passed,
                result.total,
                result.elapsed_ms,
            );
        }
        summary.add_suite_result(&result);
    }
    klog_info!(
        "TEST TOTAL: {}/{} passed across {} suites",
        summary.passed,
        summary.total_tests,
        summary.suite_count,
    );
    summary
}
