//! Fire-and-forget seeding of the device clock.

use std::time::Duration;

use rtc_shared::{DeviceChannel, DeviceCommand, TimeInterface, Timestamp, WireProtocol};
use serde::Serialize;

use crate::sync::{SyncConfig, SyncError};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BroadcastSummary {
    pub messages_sent: u32,
    pub last_sent: Option<Timestamp>,
}

/// Repeatedly writes the host wall time to the device for a bounded duration.
///
/// Nothing is read back, so device-side failures go unnoticed here; the estimator
/// is what finds out whether the seed took.
#[derive(Debug, Clone)]
pub struct TimeBroadcaster {
    protocol: WireProtocol,
    duration: Duration,
    interval: Duration,
}

impl TimeBroadcaster {
    pub fn new(protocol: WireProtocol, duration: Duration, interval: Duration) -> Self {
        Self {
            protocol,
            duration,
            interval: interval.max(Duration::from_millis(1)),
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.protocol, config.seed_duration, config.interval)
    }

    pub fn protocol(&self) -> WireProtocol {
        self.protocol
    }

    /// Broadcast until `duration` of monotonic time has passed.
    ///
    /// Elapsed time comes from `now_monotonic` only; the transmitted value comes from
    /// `now_wallclock` only. Each send is followed by a sleep to the next interval
    /// boundary measured from the start, so slow writes do not stretch the cadence.
    pub async fn broadcast(
        &self,
        channel: &mut dyn DeviceChannel,
        time: &dyn TimeInterface,
    ) -> Result<BroadcastSummary, SyncError> {
        let denominator = self.protocol.fraction_denominator();
        let start = time.now_monotonic();
        let mut summary = BroadcastSummary { messages_sent: 0, last_sent: None };

        while time.now_monotonic().duration_since(start) < self.duration {
            let stamp = Timestamp::from_system_time(time.now_wallclock(), denominator);
            channel.write_line(&DeviceCommand::SetTime(stamp).encode(self.protocol)).await?;
            summary.messages_sent += 1;
            summary.last_sent = Some(stamp);
            tracing::debug!("seed #{} sent: {}", summary.messages_sent, stamp);

            let next_boundary = self.interval.saturating_mul(summary.messages_sent);
            let elapsed = time.now_monotonic().duration_since(start);
            time.sleep(next_boundary.saturating_sub(elapsed)).await;
        }

        tracing::info!(
            "Seeded device clock with {} message(s) over {:?}",
            summary.messages_sent,
            self.duration
        );
        Ok(summary)
    }
}
