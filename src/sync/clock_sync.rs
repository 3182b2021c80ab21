//! Host/RTC clock synchronization session.
//!
//! ```text
//! Seeding -> Measuring -> Converged
//!                ^   |
//!                |   v
//!             Correcting
//! ```

use std::sync::Arc;

use rtc_shared::{DeviceChannel, DeviceCommand, TimeInterface, Timestamp};
use serde::Serialize;
use tracing::Instrument;
use uuid::Uuid;

use crate::sync::broadcaster::TimeBroadcaster;
use crate::sync::estimator::{self, OffsetEstimate, OffsetEstimator};
use crate::sync::{SyncConfig, SyncError};

#[derive(Debug, Clone, PartialEq)]
pub enum SyncState {
    Seeding,
    Measuring,
    Correcting(OffsetEstimate),
    Converged(OffsetEstimate),
}

/// Outcome of a converged session.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub session_id: Uuid,
    pub offset: OffsetEstimate,
    pub correction_rounds: u32,
    pub seed_messages: u32,
}

/// One synchronization run against one device.
///
/// The session owns the channel exclusively for its whole life; nothing else may
/// read or write it until [`SyncSession::close`] or drop.
pub struct SyncSession {
    id: Uuid,
    channel: Box<dyn DeviceChannel>,
    time: Arc<dyn TimeInterface>,
    config: SyncConfig,
    broadcaster: TimeBroadcaster,
    estimator: OffsetEstimator,
    state: SyncState,
    last_estimate: Option<OffsetEstimate>,
    correction_rounds: u32,
    seed_messages: u32,
}

impl SyncSession {
    pub fn new(channel: Box<dyn DeviceChannel>, time: Arc<dyn TimeInterface>, config: SyncConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            broadcaster: TimeBroadcaster::from_config(&config),
            estimator: OffsetEstimator::from_config(&config),
            channel,
            time,
            config,
            state: SyncState::Seeding,
            last_estimate: None,
            correction_rounds: 0,
            seed_messages: 0,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> &SyncState {
        &self.state
    }

    pub fn last_estimate(&self) -> Option<&OffsetEstimate> {
        self.last_estimate.as_ref()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Seed, measure and correct until the offset is within tolerance.
    ///
    /// Estimator failures (timeouts, malformed replies past their retry caps) end the
    /// session as [`SyncError::ConvergenceFailed`] with the failure as its cause;
    /// channel errors are returned as they are.
    pub async fn run(&mut self) -> Result<SyncReport, SyncError> {
        let span = tracing::info_span!("sync_session", id = %self.id);
        self.run_inner().instrument(span).await
    }

    async fn run_inner(&mut self) -> Result<SyncReport, SyncError> {
        self.prepare_channel().await?;
        loop {
            match self.state.clone() {
                SyncState::Seeding => {
                    let summary = self.broadcaster.broadcast(self.channel.as_mut(), self.time.as_ref()).await?;
                    self.seed_messages += summary.messages_sent;
                    self.transition(SyncState::Measuring);
                }
                SyncState::Measuring => {
                    let estimate = match self
                        .estimator
                        .estimate(self.channel.as_mut(), self.time.as_ref(), self.config.trials_per_batch)
                        .await
                    {
                        Ok(estimate) => estimate,
                        Err(SyncError::Channel(e)) => return Err(SyncError::Channel(e)),
                        Err(e) => return Err(self.failure(Some(e))),
                    };
                    self.last_estimate = Some(estimate.clone());
                    if estimate.within(self.config.tolerance) {
                        self.transition(SyncState::Converged(estimate));
                    } else if self.correction_rounds >= self.config.max_correction_rounds {
                        return Err(self.failure(None));
                    } else {
                        self.transition(SyncState::Correcting(estimate));
                    }
                }
                SyncState::Correcting(estimate) => {
                    let command = DeviceCommand::ChangeTime(estimate.mean);
                    self.channel.write_line(&command.encode(self.config.protocol)).await?;
                    self.correction_rounds += 1;
                    tracing::info!("correction #{} sent: change_time {:+.6}", self.correction_rounds, estimate.mean);
                    self.transition(SyncState::Measuring);
                }
                SyncState::Converged(estimate) => {
                    tracing::info!(
                        "Converged: offset {:+.6} s after {} correction round(s)",
                        estimate.mean,
                        self.correction_rounds
                    );
                    return Ok(SyncReport {
                        session_id: self.id,
                        offset: estimate,
                        correction_rounds: self.correction_rounds,
                        seed_messages: self.seed_messages,
                    });
                }
            }
        }
    }

    /// Opening the port resets the board; give it time before the first command.
    async fn prepare_channel(&mut self) -> Result<(), SyncError> {
        if !self.config.settle_delay.is_zero() {
            tracing::info!("waiting {:?} for the device to settle", self.config.settle_delay);
            self.time.sleep(self.config.settle_delay).await;
        }
        self.channel.reset_input_buffer().await?;
        self.channel.reset_output_buffer().await?;
        Ok(())
    }

    fn transition(&mut self, next: SyncState) {
        tracing::debug!("state {} -> {}", state_name(&self.state), state_name(&next));
        self.state = next;
    }

    fn failure(&self, cause: Option<SyncError>) -> SyncError {
        let error = SyncError::ConvergenceFailed {
            rounds: self.correction_rounds,
            last_estimate: self.last_estimate.clone(),
            cause: cause.map(Box::new),
        };
        tracing::error!("{}", error);
        error
    }

    /// Read the device clock with `get_time`.
    pub async fn query_device_time(&mut self) -> Result<Timestamp, SyncError> {
        estimator::query_device_time(self.channel.as_mut(), self.config.protocol, self.config.read_timeout).await
    }

    pub async fn close(mut self) -> Result<(), SyncError> {
        self.channel.close().await?;
        Ok(())
    }
}

fn state_name(state: &SyncState) -> &'static str {
    match state {
        SyncState::Seeding => "seeding",
        SyncState::Measuring => "measuring",
        SyncState::Correcting(_) => "correcting",
        SyncState::Converged(_) => "converged",
    }
}
