// rtc-sync: synchronize a serial-attached RTC board to the host clock
pub mod communication;
pub mod config;
pub mod scheduler;
pub mod sync;

pub use communication::SerialChannel;
pub use config::{Config, ConfigError, load_config, read_config};
pub use scheduler::StdTimeSync;
pub use sync::{OffsetEstimate, SyncConfig, SyncError, SyncReport, SyncSession};
