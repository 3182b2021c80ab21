//! Event queue and simulation clock for the RTC simulator

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use rtc_shared::TimeInterface;

/// A line in flight from the device to the host.
#[derive(Debug, Clone)]
pub struct SimEvent {
    /// Simulation time at which the host can read the line.
    pub timestamp: Duration,
    pub seq: u64,
    pub line: String,
}

impl PartialEq for SimEvent {
    fn eq(&self, other: &Self) -> bool {
        self.timestamp == other.timestamp && self.seq == other.seq
    }
}
impl Eq for SimEvent {}
impl PartialOrd for SimEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for SimEvent {
    // Reversed: BinaryHeap is a max-heap and the earliest arrival must pop first.
    fn cmp(&self, other: &Self) -> Ordering {
        other.timestamp.cmp(&self.timestamp).then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Device-to-host lines ordered by arrival time, FIFO on ties.
#[derive(Debug, Default)]
pub struct SimEventQueue {
    pub queue: BinaryHeap<SimEvent>,
    next_seq: u64,
}

impl SimEventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, timestamp: Duration, line: String) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.push(SimEvent { timestamp, seq, line });
    }

    pub fn pop(&mut self) -> Option<SimEvent> {
        self.queue.pop()
    }

    /// Put a popped event back in its original place.
    pub fn requeue(&mut self, event: SimEvent) {
        self.queue.push(event);
    }

    /// Drop every line that has already arrived by `now`. Lines still in flight
    /// survive, the way a UART flush cannot catch bytes not yet received.
    pub fn discard_arrived(&mut self, now: Duration) -> usize {
        let before = self.queue.len();
        self.queue.retain(|event| event.timestamp > now);
        before - self.queue.len()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[derive(Debug)]
struct ClockState {
    current_time: Duration,
}

/// Virtual time shared by the simulated device and the host under test.
///
/// `sleep` advances the clock instead of waiting, so a whole sync session runs in
/// microseconds of real time.
#[derive(Debug, Clone)]
pub struct SimClock {
    state: Arc<Mutex<ClockState>>,
    wall_start: SystemTime,
    mono_start: Instant,
}

impl SimClock {
    /// Clock whose wall time reads `wall_start` at simulation time zero.
    pub fn new(wall_start: SystemTime) -> Self {
        Self {
            state: Arc::new(Mutex::new(ClockState { current_time: Duration::ZERO })),
            wall_start,
            mono_start: Instant::now(),
        }
    }

    pub fn current_time(&self) -> Duration {
        self.lock().current_time
    }

    pub fn advance(&self, dt: Duration) {
        self.lock().current_time += dt;
    }

    /// Move forward to `t`; never moves backwards.
    pub fn advance_to(&self, t: Duration) {
        let mut state = self.lock();
        if t > state.current_time {
            state.current_time = t;
        }
    }

    /// Host wall time at simulation time `t`, in nanoseconds since the epoch.
    pub fn wall_nanos_at(&self, t: Duration) -> i128 {
        let start = self
            .wall_start
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        (start + t).as_nanos() as i128
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ClockState> {
        // A poisoned clock only means another test thread panicked mid-advance.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl TimeInterface for SimClock {
    fn now_monotonic(&self) -> Instant {
        self.mono_start + self.current_time()
    }

    fn now_wallclock(&self) -> SystemTime {
        self.wall_start + self.current_time()
    }

    async fn sleep(&self, duration: Duration) {
        self.advance(duration);
        tokio::task::yield_now().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_pops_earliest_then_fifo() {
        let mut queue = SimEventQueue::new();
        queue.push(Duration::from_millis(20), "late".to_string());
        queue.push(Duration::from_millis(10), "first".to_string());
        queue.push(Duration::from_millis(10), "second".to_string());
        let order: Vec<String> = std::iter::from_fn(|| queue.pop()).map(|e| e.line).collect();
        assert_eq!(order, vec!["first", "second", "late"]);
    }

    #[test]
    fn test_discard_arrived_keeps_in_flight() {
        let mut queue = SimEventQueue::new();
        queue.push(Duration::from_millis(5), "stale".to_string());
        queue.push(Duration::from_millis(50), "in flight".to_string());
        assert_eq!(queue.discard_arrived(Duration::from_millis(10)), 1);
        assert_eq!(queue.pop().map(|e| e.line), Some("in flight".to_string()));
    }

    #[tokio::test]
    async fn test_sleep_advances_both_clocks() {
        let clock = SimClock::new(SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000));
        let mono = clock.now_monotonic();
        let wall = clock.now_wallclock();
        clock.sleep(Duration::from_millis(250)).await;
        assert_eq!(clock.now_monotonic() - mono, Duration::from_millis(250));
        assert_eq!(clock.now_wallclock().duration_since(wall).unwrap(), Duration::from_millis(250));
        clock.advance_to(Duration::from_millis(100));
        assert_eq!(clock.current_time(), Duration::from_millis(250));
    }
}
