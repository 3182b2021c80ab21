// rtc_shared: wire types and traits shared by the host and the simulated device

pub mod channel;
pub mod protocol;
pub mod timestamp;

pub use channel::{ChannelError, DeviceChannel, ReadDeadline};
pub use protocol::{DeviceCommand, ProtocolError, WireProtocol};
pub use timestamp::Timestamp;

use async_trait::async_trait;

// --- Shared Traits ---

/// Clock capabilities used by the sync loop.
///
/// `now_monotonic` is for measuring elapsed durations only, `now_wallclock` is for
/// the absolute values that get compared against the device clock. Never substitute
/// one for the other.
#[async_trait]
pub trait TimeInterface: Send + Sync {
    fn now_monotonic(&self) -> std::time::Instant;
    fn now_wallclock(&self) -> std::time::SystemTime;
    async fn sleep(&self, duration: std::time::Duration);
}
