use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("channel closed")]
    Closed,
    #[error("timed out waiting for a line")]
    TimedOut,
    #[error("device sent invalid UTF-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
}

/// Bound on a single blocking read.
///
/// There is no `Default`: waiting forever has to be asked for by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadDeadline {
    At(tokio::time::Instant),
    Never,
}

impl ReadDeadline {
    pub fn after(timeout: Duration) -> Self {
        ReadDeadline::At(tokio::time::Instant::now() + timeout)
    }

    /// Drive `fut` until it finishes or the deadline passes.
    pub async fn bound<F: Future>(self, fut: F) -> Result<F::Output, ChannelError> {
        match self {
            ReadDeadline::At(deadline) => tokio::time::timeout_at(deadline, fut)
                .await
                .map_err(|_| ChannelError::TimedOut),
            ReadDeadline::Never => Ok(fut.await),
        }
    }

    pub fn has_passed(&self) -> bool {
        match self {
            ReadDeadline::At(deadline) => tokio::time::Instant::now() >= *deadline,
            ReadDeadline::Never => false,
        }
    }
}

/// Line-oriented duplex link to the RTC board.
///
/// A channel is owned by exactly one session. Buffer resets and line framing are
/// not safe to interleave, so implementations take `&mut self` and are never shared.
#[async_trait]
pub trait DeviceChannel: Send {
    /// Write `line` as-is; the caller supplies the terminator.
    async fn write_line(&mut self, line: &str) -> Result<(), ChannelError>;
    /// Next complete line with its terminator stripped.
    async fn read_line(&mut self, deadline: ReadDeadline) -> Result<String, ChannelError>;
    async fn reset_input_buffer(&mut self) -> Result<(), ChannelError>;
    async fn reset_output_buffer(&mut self) -> Result<(), ChannelError>;
    async fn close(&mut self) -> Result<(), ChannelError>;
}
