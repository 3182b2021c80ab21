//! Round-trip offset estimation (Cristian-style ping exchange).
//!
//! One trial:
//!
//! 1. discard both channel buffers
//! 2. host sends `ping`
//! 3. device sends `request` and notes its own time `t0`
//! 4. host sees the marker at `t1`, sends `response`, notes `t2` once the write is done
//! 5. device notes `t3` on receipt and replies `t0 t3` as four integers
//!
//! `offset = ((t1 - t0) + (t2 - t3)) / 2` is host minus device: the number of
//! seconds to add to the device clock. Symmetric link delay cancels out.

use std::time::Duration;

use rtc_shared::protocol::{self, ProtocolError};
use rtc_shared::{ChannelError, DeviceChannel, DeviceCommand, ReadDeadline, TimeInterface, Timestamp, WireProtocol};
use serde::Serialize;

use crate::sync::{SyncConfig, SyncError};

/// Offset for one exchange, host minus device, in seconds.
pub fn round_trip_offset(t0: &Timestamp, t1: &Timestamp, t2: &Timestamp, t3: &Timestamp) -> f64 {
    (t1.seconds_since(t0) + t2.seconds_since(t3)) / 2.0
}

/// The four timestamps of one round trip. `t0`/`t3` are device clock readings,
/// `t1`/`t2` host wall-clock readings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub t0: Timestamp,
    pub t1: Timestamp,
    pub t2: Timestamp,
    pub t3: Timestamp,
}

impl Sample {
    pub fn offset(&self) -> f64 {
        round_trip_offset(&self.t0, &self.t1, &self.t2, &self.t3)
    }

    /// One-way link delay, assuming it is the same in both directions.
    pub fn one_way_delay(&self) -> f64 {
        (self.t1.seconds_since(&self.t0) - self.t2.seconds_since(&self.t3)) / 2.0
    }
}

/// Aggregate of one batch of trials.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OffsetEstimate {
    /// Mean host-minus-device offset in seconds.
    pub mean: f64,
    /// Sample standard deviation of the per-trial offsets.
    pub std_dev: f64,
    pub samples: usize,
    /// Mean one-way delay in seconds, for diagnostics.
    pub mean_delay: f64,
}

impl OffsetEstimate {
    /// Device clock minus host clock; positive when the device runs ahead.
    pub fn device_lead(&self) -> f64 {
        -self.mean
    }

    pub fn within(&self, tolerance: f64) -> bool {
        self.mean.abs() <= tolerance
    }
}

/// Running mean and variance (Welford), so samples can be dropped as soon as
/// they are folded in.
#[derive(Debug, Clone, Default)]
pub struct OffsetAccumulator {
    count: usize,
    mean: f64,
    m2: f64,
    delay_sum: f64,
}

impl OffsetAccumulator {
    pub fn push(&mut self, sample: &Sample) {
        let offset = sample.offset();
        self.count += 1;
        let delta = offset - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (offset - self.mean);
        self.delay_sum += sample.one_way_delay();
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn estimate(&self) -> OffsetEstimate {
        let std_dev = if self.count > 1 { (self.m2 / (self.count - 1) as f64).sqrt() } else { 0.0 };
        let mean_delay = if self.count > 0 { self.delay_sum / self.count as f64 } else { 0.0 };
        OffsetEstimate { mean: self.mean, std_dev, samples: self.count, mean_delay }
    }
}

/// Runs batches of ping exchanges against the device.
#[derive(Debug, Clone)]
pub struct OffsetEstimator {
    protocol: WireProtocol,
    read_timeout: Duration,
    max_trial_retries: u32,
    max_consecutive_timeouts: u32,
}

impl OffsetEstimator {
    pub fn new(protocol: WireProtocol, read_timeout: Duration) -> Self {
        let defaults = SyncConfig::default();
        Self {
            protocol,
            read_timeout,
            max_trial_retries: defaults.max_trial_retries,
            max_consecutive_timeouts: defaults.max_consecutive_timeouts,
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.protocol, config.read_timeout)
            .with_retry_limits(config.max_trial_retries, config.max_consecutive_timeouts)
    }

    /// `max_trial_retries` extra attempts per trial; a batch gives up once
    /// `max_consecutive_timeouts` attempts have timed out with no clean trial (one
    /// that succeeded on its first attempt) in between. The count carries across
    /// trials, so a device that keeps dropping one ping in two still fails the batch.
    pub fn with_retry_limits(mut self, max_trial_retries: u32, max_consecutive_timeouts: u32) -> Self {
        self.max_trial_retries = max_trial_retries;
        self.max_consecutive_timeouts = max_consecutive_timeouts.max(1);
        self
    }

    /// Run `trials` exchanges (at least one) and average their offsets.
    ///
    /// Timeouts and malformed replies retry the trial. A trial out of retries, or a
    /// run of timeouts not broken by a clean trial, fails the batch with the last
    /// trial error.
    /// Channel errors fail immediately.
    pub async fn estimate(
        &self,
        channel: &mut dyn DeviceChannel,
        time: &dyn TimeInterface,
        trials: usize,
    ) -> Result<OffsetEstimate, SyncError> {
        let trials = trials.max(1);
        let progress_every = (trials / 5).max(1);
        let mut accumulator = OffsetAccumulator::default();
        let mut consecutive_timeouts = 0u32;

        for trial in 0..trials {
            let mut attempt = 0u32;
            let mut timed_out = false;
            loop {
                match self.run_trial(channel, time).await {
                    Ok(sample) => {
                        if !timed_out {
                            consecutive_timeouts = 0;
                        }
                        tracing::trace!(trial, offset = sample.offset(), "trial complete");
                        accumulator.push(&sample);
                        break;
                    }
                    Err(e) if e.is_retryable() => {
                        if matches!(e, SyncError::ProtocolTimeout { .. }) {
                            consecutive_timeouts += 1;
                            timed_out = true;
                        }
                        if consecutive_timeouts >= self.max_consecutive_timeouts || attempt >= self.max_trial_retries {
                            tracing::error!(trial, attempt, "giving up on batch: {}", e);
                            return Err(e);
                        }
                        attempt += 1;
                        tracing::warn!(trial, attempt, "retrying trial: {}", e);
                    }
                    Err(e) => return Err(e),
                }
            }

            if (trial + 1) % progress_every == 0 {
                tracing::info!("{}/{} trials to check time accuracy completed", trial + 1, trials);
            }
        }

        let estimate = accumulator.estimate();
        tracing::info!(
            "Average offset in seconds: {:+.6} (std dev {:.6}, mean one-way delay {:.6})",
            estimate.mean,
            estimate.std_dev,
            estimate.mean_delay
        );
        Ok(estimate)
    }

    /// One ping exchange.
    pub async fn run_trial(
        &self,
        channel: &mut dyn DeviceChannel,
        time: &dyn TimeInterface,
    ) -> Result<Sample, SyncError> {
        channel.reset_input_buffer().await?;
        channel.reset_output_buffer().await?;
        channel.write_line(&DeviceCommand::Ping.encode(self.protocol)).await?;

        let discarded = wait_for_marker(channel, ReadDeadline::after(self.read_timeout)).await?;
        let t1 = Timestamp::from_system_time(time.now_wallclock(), Timestamp::NANOS);
        if discarded > 0 {
            tracing::debug!("skipped {} line(s) before request marker", discarded);
        }

        channel.write_line(&DeviceCommand::Response.encode(self.protocol)).await?;
        let t2 = Timestamp::from_system_time(time.now_wallclock(), Timestamp::NANOS);

        let reply = read_reply(channel, ReadDeadline::after(self.read_timeout), "timestamp reply").await?;
        let (t0, t3) = protocol::parse_round_trip_reply(&reply)?;
        Ok(Sample { t0, t1, t2, t3 })
    }
}

/// Read lines until one is exactly the request marker. Returns how many lines were
/// thrown away first. The deadline covers the whole scan, not each line.
pub async fn wait_for_marker(channel: &mut dyn DeviceChannel, deadline: ReadDeadline) -> Result<usize, SyncError> {
    let mut discarded = 0;
    loop {
        match channel.read_line(deadline).await {
            Ok(line) if protocol::is_request_marker(&line) => return Ok(discarded),
            Ok(line) => {
                tracing::trace!("discarding {:?}", line);
                discarded += 1;
            }
            Err(ChannelError::InvalidUtf8(_)) => discarded += 1,
            Err(ChannelError::TimedOut) => return Err(SyncError::ProtocolTimeout { waiting_for: "request marker" }),
            Err(e) => return Err(e.into()),
        }
    }
}

async fn read_reply(
    channel: &mut dyn DeviceChannel,
    deadline: ReadDeadline,
    waiting_for: &'static str,
) -> Result<String, SyncError> {
    match channel.read_line(deadline).await {
        Ok(line) => Ok(line),
        Err(ChannelError::TimedOut) => Err(SyncError::ProtocolTimeout { waiting_for }),
        Err(ChannelError::InvalidUtf8(_)) => Err(ProtocolError::NotUtf8.into()),
        Err(e) => Err(e.into()),
    }
}

/// Ask the device for its clock with `get_time`. Unrelated lines (echo, prompts)
/// are skipped until the deadline.
pub async fn query_device_time(
    channel: &mut dyn DeviceChannel,
    protocol: WireProtocol,
    read_timeout: Duration,
) -> Result<Timestamp, SyncError> {
    channel.reset_input_buffer().await?;
    channel.write_line(&DeviceCommand::GetTime.encode(protocol)).await?;
    let deadline = ReadDeadline::after(read_timeout);
    loop {
        let line = read_reply(channel, deadline, "time report").await?;
        match protocol::parse_time_report(&line) {
            Ok(ts) => return Ok(ts),
            Err(ProtocolError::UnknownCommand(_)) => tracing::trace!("skipping {:?}", line),
            Err(e) => return Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(seconds: u64, micros: u32) -> Timestamp {
        Timestamp::new(seconds, micros, Timestamp::MICROS).unwrap()
    }

    #[test]
    fn test_offset_of_skewed_device_with_symmetric_delay() {
        // Device runs 2.5 s behind the host, 10 ms each way.
        let sample = Sample {
            t0: ts(997, 500_000),
            t1: ts(1000, 10_000),
            t2: ts(1000, 20_000),
            t3: ts(997, 530_000),
        };
        assert!((sample.offset() - 2.5).abs() < 1e-9);
        assert!((sample.one_way_delay() - 0.010).abs() < 1e-9);
    }

    #[test]
    fn test_offset_negates_when_roles_swap() {
        let (t0, t1, t2, t3) = (ts(100, 0), ts(100, 400_000), ts(100, 450_000), ts(100, 700_000));
        let forward = round_trip_offset(&t0, &t1, &t2, &t3);
        let swapped = round_trip_offset(&t1, &t0, &t3, &t2);
        assert!((forward + swapped).abs() < 1e-12);
        assert!(forward.abs() > 0.0);
    }

    #[test]
    fn test_accumulator_mean_and_sample_std_dev() {
        let mut acc = OffsetAccumulator::default();
        for offset_micros in [100_000u32, 200_000, 300_000] {
            acc.push(&Sample { t0: ts(10, 0), t1: ts(10, offset_micros), t2: ts(10, offset_micros), t3: ts(10, 0) });
        }
        let estimate = acc.estimate();
        assert_eq!(estimate.samples, 3);
        assert!((estimate.mean - 0.2).abs() < 1e-12);
        assert!((estimate.std_dev - 0.1).abs() < 1e-12);
        assert!((estimate.device_lead() + 0.2).abs() < 1e-12);
        assert!(estimate.within(0.2 + 1e-9));
        assert!(!estimate.within(0.19));
    }

    #[test]
    fn test_single_sample_has_zero_spread() {
        let mut acc = OffsetAccumulator::default();
        acc.push(&Sample { t0: ts(1, 0), t1: ts(1, 5), t2: ts(1, 5), t3: ts(1, 0) });
        assert_eq!(acc.estimate().std_dev, 0.0);
        assert_eq!(acc.count(), 1);
    }
}
