#![no_std]
#![allow(unsafe_op_in_unsafe_fn)]

pub mod api;
pub mod scheduler;
pub mod queues;
pub mod registry;
pub mod switch;
pub mod task;

#[cfg(feature = "itests")]
pub mod sched_tests;

pub use api::{init_scheduler, schedule_stats};
pub use scheduler::{Decision, schedule, schedule_decision, start_rt_timer, stop_rt_timer, timer_isr};
pub use task::{TaskHandle, with_core};
