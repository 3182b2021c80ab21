// rtc_simulator: a simulated RTC board and virtual clock for exercising the host sync loop

pub mod simulator;

pub use simulator::event_queue::SimClock;
pub use simulator::{SimDeviceConfig, SimDeviceHandle, SimulatedRtc};
