//! In-kernel test harness.
//!
//! Suites are plain functions returning [`TestResult`], grouped with
//! `define_test_suite!` into descriptors collected in the
//! `.test_registry` link section. A runner (the `tests` member or the
//! host integration) walks the section and executes every suite.

use core::ffi::c_int;

pub mod harness;
mod runner;

pub use harness::{
    HARNESS_MAX_SUITES, TestRunSummary, TestSuiteDesc, TestSuiteResult, measure_elapsed_ms,
};
pub use runner::run_single_test;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TestResult {
    Pass,
    Fail,
    Skipped,
}

impl TestResult {
    #[inline]
    pub fn is_pass(&self) -> bool {
        matches!(self, Self::Pass)
    }

    #[inline]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Fail)
    }

    #[inline]
    pub fn to_c_int(self) -> c_int {
        match self {
            Self::Pass | Self::Skipped => 0,
            Self::Fail => -1,
        }
    }
}

#[macro_export]
macro_rules! pass {
    () => {
        $crate::testing::TestResult::Pass
    };
}

#[macro_export]
macro_rules! fail {
    () => {
        $crate::testing::TestResult::Fail
    };
    ($msg:expr) => {{
        $crate::klog_info!("TEST FAIL: {}", $msg);
        $crate::testing::TestResult::Fail
    }};
    ($fmt:expr, $($arg:tt)*) => {{
        $crate::klog_info!(concat!("TEST FAIL: ", $fmt), $($arg)*);
        $crate::testing::TestResult::Fail
    }};
}

#[macro_export]
macro_rules! run_test {
    ($passed:expr, $total:expr, $test_fn:expr) => {{
        $total += 1;
        let result = $crate::testing::run_single_test(stringify!($test_fn), || $test_fn());
        if result.is_pass() {
            $passed += 1;
        }
        result
    }};

    ($test_fn:expr) => {{ $crate::testing::run_single_test(stringify!($test_fn), || $test_fn()) }};
}

#[macro_export]
macro_rules! define_test_suite {
    ($suite_name:ident, [$($test_fn:path),* $(,)?]) => {
        $crate::paste::paste! {
            const [<$suite_name:upper _NAME>]: &[u8] = concat!(stringify!($suite_name), "\0").as_bytes();

            extern "C" fn [<run_ $suite_name _suite>](
                _config: *const (),
                out: *mut $crate::testing::TestSuiteResult,
            ) -> i32 {
                let start = $crate::tsc::rdtsc();
                let mut passed = 0u32;
                let mut total = 0u32;

                $(
                    $crate::run_test!(passed, total, $test_fn);
                )*

                let elapsed = $crate::testing::measure_elapsed_ms(start, $crate::tsc::rdtsc());

                if let Some(out_ref) = unsafe { out.as_mut() } {
                    out_ref.name = [<$suite_name:upper _NAME>].as_ptr() as *const core::ffi::c_char;
                    out_ref.total = total;
                    out_ref.passed = passed;
                    out_ref.failed = total.saturating_sub(passed);
                    out_ref.elapsed_ms = elapsed;
                }

                if passed == total { 0 } else { -1 }
            }

            #[used]
            #[unsafe(link_section = ".test_registry")]
            pub static [<$suite_name:upper _SUITE_DESC>]: $crate::testing::TestSuiteDesc = $crate::testing::TestSuiteDesc {
                name: [<$suite_name:upper _NAME>].as_ptr() as *const core::ffi::c_char,
                run: Some([<run_ $suite_name _suite>]),
            };
        }
    };
}
