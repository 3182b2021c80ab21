// src/sync/mod.rs - host side of the RTC clock synchronization protocol
pub mod broadcaster;
pub mod clock_sync;
pub mod estimator;

pub use broadcaster::{BroadcastSummary, TimeBroadcaster};
pub use clock_sync::{SyncReport, SyncSession, SyncState};
pub use estimator::{OffsetAccumulator, OffsetEstimate, OffsetEstimator, Sample, query_device_time, round_trip_offset};

use std::time::Duration;

use rtc_shared::{ChannelError, ProtocolError, WireProtocol};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Transport failure. Fatal for the session.
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),
    #[error("timed out waiting for {waiting_for}")]
    ProtocolTimeout { waiting_for: &'static str },
    #[error("malformed reply: {0}")]
    MalformedReply(#[from] ProtocolError),
    #[error("no convergence after {rounds} correction rounds (last offset: {})", describe_last(.last_estimate))]
    ConvergenceFailed {
        rounds: u32,
        last_estimate: Option<OffsetEstimate>,
        #[source]
        cause: Option<Box<SyncError>>,
    },
}

impl SyncError {
    /// Errors a single trial may be retried after.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::ProtocolTimeout { .. } | SyncError::MalformedReply(_))
    }

    /// Short name of the failure kind for reports.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::Channel(_) => "channel-error",
            SyncError::ProtocolTimeout { .. } => "protocol-timeout",
            SyncError::MalformedReply(_) => "malformed-reply",
            SyncError::ConvergenceFailed { .. } => "convergence-failed",
        }
    }
}

fn describe_last(last: &Option<OffsetEstimate>) -> String {
    match last {
        Some(estimate) => format!("{:+.6} s", estimate.mean),
        None => "none".to_string(),
    }
}

/// Parameters of one synchronization session.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    /// Decides the fraction denominator and seed line format.
    pub protocol: WireProtocol,
    /// How long the seeding broadcast runs.
    pub seed_duration: Duration,
    /// Cadence of seed messages.
    pub interval: Duration,
    /// Converged once `|mean offset| <= tolerance` seconds.
    pub tolerance: f64,
    pub trials_per_batch: usize,
    pub max_correction_rounds: u32,
    /// Bound on every wait for a device line.
    pub read_timeout: Duration,
    pub max_trial_retries: u32,
    pub max_consecutive_timeouts: u32,
    /// Wait after opening the port before the first command.
    pub settle_delay: Duration,
}

impl SyncConfig {
    pub fn fraction_denominator(&self) -> u32 {
        self.protocol.fraction_denominator()
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            protocol: WireProtocol::Micros,
            seed_duration: Duration::from_millis(50),
            interval: Duration::from_millis(50),
            tolerance: 0.02,
            trials_per_batch: 100,
            max_correction_rounds: 10,
            read_timeout: Duration::from_secs(1),
            max_trial_retries: 3,
            max_consecutive_timeouts: 5,
            settle_delay: Duration::from_millis(500),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(SyncError::ProtocolTimeout { waiting_for: "request marker" }.is_retryable());
        assert!(SyncError::MalformedReply(ProtocolError::NotUtf8).is_retryable());
        assert!(!SyncError::Channel(ChannelError::Closed).is_retryable());
        let failed = SyncError::ConvergenceFailed { rounds: 3, last_estimate: None, cause: None };
        assert!(!failed.is_retryable());
        assert_eq!(failed.kind(), "convergence-failed");
    }

    #[test]
    fn test_convergence_failure_message_names_last_offset() {
        let failed = SyncError::ConvergenceFailed {
            rounds: 2,
            last_estimate: Some(OffsetEstimate { mean: -0.5, std_dev: 0.0, samples: 10, mean_delay: 0.001 }),
            cause: None,
        };
        assert_eq!(failed.to_string(), "no convergence after 2 correction rounds (last offset: -0.500000 s)");
    }
}
