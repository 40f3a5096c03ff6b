//! Timebase tests: unit conversion laws and timer arming boundaries.

use core::sync::atomic::Ordering;

use quartz_abi::config::TunedParams;
use quartz_lib::testing::TestResult;
use quartz_lib::{define_test_suite, fail};

use crate::clock::{self, count2nano_cpu, nano2count_cpu, set_tuned};
use crate::timer::{MockTimer, arm_absolute, install_timer_device, rt_set_timer_delay};

static MOCK: MockTimer = MockTimer::new();

fn tuned_fixture() -> TunedParams {
    let mut tuned = TunedParams::new();
    tuned.cpu_freq = 2_000_000_000;
    tuned.timer_freq = 100_000_000;
    // 2 us setup, 1 us latency, in CPU ticks and timer counts.
    tuned.setup_time_cpu = 4_000;
    tuned.setup_time_timer = 200;
    tuned.latency = 2_000;
    tuned
}

struct ClockFixture;

impl ClockFixture {
    fn new() -> Self {
        set_tuned(tuned_fixture());
        clock::set_oneshot(0, true);
        clock::reset_times(0);
        MOCK.reset();
        install_timer_device(&MOCK);
        Self
    }
}

pub fn test_ns_tick_round_trip() -> TestResult {
    let _fixture = ClockFixture::new();
    for ns in [0i64, 1, 999, 1_000_000, 1_000_000_000, -5_000_000] {
        let ticks = nano2count_cpu(ns, 0);
        let back = count2nano_cpu(ticks, 0);
        if (back - ns).abs() > 1 {
            return fail!("round trip {} -> {} -> {}", ns, ticks, back);
        }
    }
    TestResult::Pass
}

pub fn test_periodic_mode_converts_in_timer_counts() -> TestResult {
    let _fixture = ClockFixture::new();
    clock::set_oneshot(0, false);
    // 1 ms at 100 MHz timer = 100_000 counts.
    let counts = nano2count_cpu(1_000_000, 0);
    if counts != 100_000 {
        return fail!("expected 100000 counts, got {}", counts);
    }
    TestResult::Pass
}

pub fn test_arm_future_deadline_programs_once() -> TestResult {
    let _fixture = ClockFixture::new();
    let now = 1_000_000;
    // 1 ms out at 2 GHz = 2_000_000 CPU ticks.
    let effective = arm_absolute(now + 2_000_000, now);
    if effective != now + 2_000_000 {
        return fail!("future deadline must not be rewritten");
    }
    if MOCK.programmings.load(Ordering::Relaxed) != 1 {
        return fail!("exactly one programming expected");
    }
    // delay(2_000_000 - latency 2_000) at timer freq 1/20 of cpu freq.
    let programmed = MOCK.last_count.load(Ordering::Relaxed) as i64;
    if (programmed - 99_900).abs() > 1 {
        return fail!("programmed {} counts, expected ~99900", programmed);
    }
    TestResult::Pass
}

pub fn test_arm_past_deadline_fires_within_setup_time() -> TestResult {
    let _fixture = ClockFixture::new();
    let now = 5_000_000;
    // Deadline already passed: the shot must not be lost, and the
    // effective expiry is pushed to now + setup_time.
    let effective = arm_absolute(now - 10_000, now);
    if effective != now + 4_000 {
        return fail!("expected now+setup_time, got {}", effective - now);
    }
    let programmed = MOCK.last_count.load(Ordering::Relaxed);
    if programmed != 200 {
        return fail!("expected minimum programmable delay, got {}", programmed);
    }
    TestResult::Pass
}

pub fn test_zero_delay_is_noop_in_periodic_mode() -> TestResult {
    let _fixture = ClockFixture::new();
    clock::set_oneshot(0, false);
    MOCK.reset();
    rt_set_timer_delay(0);
    if MOCK.programmings.load(Ordering::Relaxed) != 0 {
        return fail!("periodic reload must not be reprogrammed");
    }
    TestResult::Pass
}

define_test_suite!(
    hal_clock,
    [
        test_ns_tick_round_trip,
        test_periodic_mode_converts_in_timer_counts,
        test_arm_future_deadline_programs_once,
        test_arm_past_deadline_fires_within_setup_time,
        test_zero_delay_is_noop_in_periodic_mode,
    ]
);
