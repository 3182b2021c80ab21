// src/scheduler/mod.rs - clock sources for the sync loop
pub mod std_time_sync;

pub use rtc_shared::TimeInterface;
pub use std_time_sync::StdTimeSync;
