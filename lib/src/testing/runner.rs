//! Single-test execution with uniform logging.

use crate::klog_info;
use crate::testing::TestResult;

/// Run one test function, logging its outcome under a stable prefix so
/// the serial log can be grepped for failures.
pub fn run_single_test(name: &str, test: impl FnOnce() -> TestResult) -> TestResult {
    let result = test();
    match result {
        TestResult::Pass => klog_info!("TEST [PASS] {}", name),
        TestResult::Fail => klog_info!("TEST [FAIL] {}", name),
        TestResult::Skipped => klog_info!("TEST [SKIP] {}", name),
    }
    result
}
