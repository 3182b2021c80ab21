pub mod event_queue;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rtc_shared::protocol::{self, DeviceCommand, REQUEST_MARKER};
use rtc_shared::{ChannelError, DeviceChannel, ReadDeadline, Timestamp, WireProtocol};
use serde::Deserialize;

use crate::simulator::event_queue::{SimClock, SimEventQueue};

/// How the simulated board behaves.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SimDeviceConfig {
    pub protocol: WireProtocol,
    /// Initial device clock minus host clock, in seconds.
    pub skew_seconds: f64,
    /// One-way transmission delay in each direction.
    pub latency_ms: f64,
    /// Extra uniformly distributed one-way delay, `0..=jitter_ms`.
    pub jitter_ms: f64,
    pub rng_seed: u64,
    /// Lines emitted before every `request` marker.
    pub noise_lines: Vec<String>,
    /// Never answer anything.
    pub silent: bool,
    /// Leave this many pings unanswered before behaving.
    pub unanswered_pings: usize,
    /// Leave every n-th ping unanswered, for ever (0 disables).
    pub lost_ping_period: usize,
    /// Send this many truncated timestamp replies before behaving.
    pub malformed_replies: usize,
    /// Accept `change_time` but do not apply it.
    pub ignore_corrections: bool,
}

impl Default for SimDeviceConfig {
    fn default() -> Self {
        Self {
            protocol: WireProtocol::Micros,
            skew_seconds: 0.0,
            latency_ms: 1.0,
            jitter_ms: 0.0,
            rng_seed: 0,
            noise_lines: Vec::new(),
            silent: false,
            unanswered_pings: 0,
            lost_ping_period: 0,
            malformed_replies: 0,
            ignore_corrections: false,
        }
    }
}

#[derive(Debug)]
struct DeviceState {
    config: SimDeviceConfig,
    skew_nanos: i128,
    /// Device time at which the last `request` left, while a response is pending.
    pending_request: Option<Timestamp>,
    outbox: SimEventQueue,
    received: Vec<String>,
    unanswered_pings: usize,
    pings_seen: usize,
    malformed_replies: usize,
    closed: bool,
    rng: StdRng,
}

impl DeviceState {
    fn one_way_delay(&mut self) -> Duration {
        let jitter = if self.config.jitter_ms > 0.0 {
            self.rng.random_range(0.0..=self.config.jitter_ms)
        } else {
            0.0
        };
        Duration::from_nanos(((self.config.latency_ms.max(0.0) + jitter) * 1e6).round() as u64)
    }

    /// The board keeps microseconds internally whatever the seed line format.
    fn device_time(&self, clock: &SimClock, at: Duration) -> Timestamp {
        Timestamp::from_nanos(clock.wall_nanos_at(at) + self.skew_nanos, Timestamp::MICROS)
    }

    fn send(&mut self, departed: Duration, line: String) {
        let arrival = departed + self.one_way_delay();
        self.outbox.push(arrival, line);
    }

    fn handle(&mut self, clock: &SimClock, line: &str, arrival: Duration) {
        self.received.push(line.trim_end().to_string());
        if self.config.silent {
            return;
        }
        let command = match DeviceCommand::parse(line, self.config.protocol) {
            Ok(command) => command,
            Err(e) => {
                tracing::debug!("simulated device rejected {:?}: {}", line, e);
                self.send(arrival, "Invalid command".to_string());
                return;
            }
        };
        match command {
            DeviceCommand::SetTime(ts) => {
                self.skew_nanos = ts.to_nanos() - clock.wall_nanos_at(arrival);
            }
            DeviceCommand::ChangeTime(offset) => {
                if !self.config.ignore_corrections {
                    self.skew_nanos += (offset * 1e9).round() as i128;
                }
            }
            DeviceCommand::GetTime => {
                let now = self.device_time(clock, arrival);
                self.send(arrival, protocol::format_time_report(&now));
            }
            DeviceCommand::Ping => {
                self.pings_seen += 1;
                if self.unanswered_pings > 0 {
                    self.unanswered_pings -= 1;
                    return;
                }
                let period = self.config.lost_ping_period;
                if period > 0 && self.pings_seen % period == 0 {
                    return;
                }
                for noise in self.config.noise_lines.clone() {
                    self.send(arrival, noise);
                }
                self.pending_request = Some(self.device_time(clock, arrival));
                self.send(arrival, REQUEST_MARKER.to_string());
            }
            DeviceCommand::Response => {
                let Some(t0) = self.pending_request.take() else {
                    return;
                };
                let t3 = self.device_time(clock, arrival);
                let reply = if self.malformed_replies > 0 {
                    self.malformed_replies -= 1;
                    format!("{} {} {}", t0.seconds, t0.ticks, t3.seconds)
                } else {
                    protocol::format_round_trip_reply(&t0, &t3)
                };
                self.send(arrival, reply);
            }
        }
    }
}

/// Inspection handle that stays valid after the device is boxed into a session.
#[derive(Debug, Clone)]
pub struct SimDeviceHandle {
    state: Arc<Mutex<DeviceState>>,
    clock: SimClock,
}

impl SimDeviceHandle {
    /// Every line the device has received, terminators stripped.
    pub fn received(&self) -> Vec<String> {
        lock(&self.state).received.clone()
    }

    /// Current device clock minus host clock, in seconds.
    pub fn skew_seconds(&self) -> f64 {
        lock(&self.state).skew_nanos as f64 / 1e9
    }

    /// What the device clock reads right now.
    pub fn device_now(&self) -> Timestamp {
        let state = lock(&self.state);
        state.device_time(&self.clock, self.clock.current_time())
    }

    pub fn pending_lines(&self) -> usize {
        lock(&self.state).outbox.len()
    }
}

/// Simulated RTC board behind a [`DeviceChannel`].
///
/// Writes arrive at the device one delay later and are acted on at once; replies
/// reach the host one delay after that. Reading a line advances the shared
/// [`SimClock`] to the line's arrival time.
#[derive(Debug)]
pub struct SimulatedRtc {
    state: Arc<Mutex<DeviceState>>,
    clock: SimClock,
    /// Last read deadline seen and the simulation time it expires at.
    deadline_anchor: Option<(tokio::time::Instant, Duration)>,
}

impl SimulatedRtc {
    pub fn new(config: SimDeviceConfig, clock: SimClock) -> Self {
        let state = DeviceState {
            skew_nanos: (config.skew_seconds * 1e9).round() as i128,
            pending_request: None,
            outbox: SimEventQueue::new(),
            received: Vec::new(),
            unanswered_pings: config.unanswered_pings,
            pings_seen: 0,
            malformed_replies: config.malformed_replies,
            closed: false,
            rng: StdRng::seed_from_u64(config.rng_seed),
            config,
        };
        tracing::info!("Simulated RTC initialized at time: {:?}", clock.current_time());
        Self { state: Arc::new(Mutex::new(state)), clock, deadline_anchor: None }
    }

    pub fn handle(&self) -> SimDeviceHandle {
        SimDeviceHandle { state: self.state.clone(), clock: self.clock.clone() }
    }

    /// Simulation time at which `deadline` expires.
    ///
    /// A deadline is anchored the first time a read sees it: the real time left on it
    /// becomes simulated time from that read on. Later reads under the same deadline
    /// (a marker scan through noise lines) share the anchor, so the budget shrinks as
    /// simulated time moves.
    fn expiry(&mut self, deadline: ReadDeadline) -> Option<Duration> {
        let ReadDeadline::At(instant) = deadline else {
            return None;
        };
        match self.deadline_anchor {
            Some((anchored, expires)) if anchored == instant && expires >= self.clock.current_time() => Some(expires),
            _ => {
                let left = instant.saturating_duration_since(tokio::time::Instant::now());
                let expires = self.clock.current_time() + left;
                self.deadline_anchor = Some((instant, expires));
                Some(expires)
            }
        }
    }
}

#[async_trait]
impl DeviceChannel for SimulatedRtc {
    async fn write_line(&mut self, line: &str) -> Result<(), ChannelError> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(ChannelError::Closed);
        }
        let arrival = self.clock.current_time() + state.one_way_delay();
        state.handle(&self.clock, line, arrival);
        Ok(())
    }

    async fn read_line(&mut self, deadline: ReadDeadline) -> Result<String, ChannelError> {
        let expires = self.expiry(deadline);
        let next = {
            let mut state = lock(&self.state);
            if state.closed {
                return Err(ChannelError::Closed);
            }
            match (state.outbox.pop(), expires) {
                // Still in flight at the deadline; it stays queued for a later read.
                (Some(event), Some(expires)) if event.timestamp > expires => {
                    state.outbox.requeue(event);
                    self.clock.advance_to(expires);
                    self.deadline_anchor = None;
                    return Err(ChannelError::TimedOut);
                }
                (next, _) => next,
            }
        };
        match next {
            Some(event) => {
                self.clock.advance_to(event.timestamp);
                Ok(event.line)
            }
            None => {
                // Nothing will ever arrive; wait out the deadline like a quiet UART.
                let waited = deadline.bound(std::future::pending::<()>()).await;
                if let Some(expires) = expires {
                    self.clock.advance_to(expires);
                }
                self.deadline_anchor = None;
                waited?;
                Err(ChannelError::TimedOut)
            }
        }
    }

    async fn reset_input_buffer(&mut self) -> Result<(), ChannelError> {
        let now = self.clock.current_time();
        let dropped = lock(&self.state).outbox.discard_arrived(now);
        if dropped > 0 {
            tracing::trace!("simulated device discarded {} stale lines", dropped);
        }
        Ok(())
    }

    async fn reset_output_buffer(&mut self) -> Result<(), ChannelError> {
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ChannelError> {
        lock(&self.state).closed = true;
        Ok(())
    }
}

fn lock(state: &Mutex<DeviceState>) -> std::sync::MutexGuard<'_, DeviceState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
