use async_trait::async_trait;
use rtc_shared::TimeInterface;

/// Standard time source built on std::time and tokio.
/// Implements the TimeInterface trait for real hardware sessions.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdTimeSync;

#[async_trait]
impl TimeInterface for StdTimeSync {
    /// Returns the current monotonic time as std::time::Instant.
    fn now_monotonic(&self) -> std::time::Instant {
        std::time::Instant::now()
    }

    /// Returns the current wallclock time as std::time::SystemTime.
    fn now_wallclock(&self) -> std::time::SystemTime {
        std::time::SystemTime::now()
    }

    /// Suspends the current task for the specified duration.
    async fn sleep(&self, duration: std::time::Duration) {
        tokio::time::sleep(duration).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_sleep_elapses_monotonic_time() {
        let clock = StdTimeSync;
        let start = clock.now_monotonic();
        clock.sleep(Duration::from_millis(5)).await;
        assert!(clock.now_monotonic().duration_since(start) >= Duration::from_millis(5));
    }
}
