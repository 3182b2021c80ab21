// src/communication/serial.rs - line-framed serial link to the RTC board
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use rtc_shared::{ChannelError, DeviceChannel, ReadDeadline};
use serial2_tokio::SerialPort;

/// Baud rate the board's UART is configured for.
pub const DEFAULT_BAUD: u32 = 115_200;

/// Bound on one `write_line` unless [`SerialChannel::with_write_timeout`] says otherwise.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

const READ_CHUNK: usize = 256;

/// [`DeviceChannel`] over a serial port.
///
/// Bytes are accumulated until a `\n`; a trailing `\r` is stripped, so CRLF and LF
/// device lines are both accepted. The port is released on [`DeviceChannel::close`]
/// and any later call fails with [`ChannelError::Closed`].
pub struct SerialChannel {
    port: Option<SerialPort>,
    path: String,
    pending: Vec<u8>,
    write_timeout: Duration,
}

impl SerialChannel {
    pub fn open(path: &str, baud: u32) -> Result<Self, ChannelError> {
        tracing::info!("Opening RTC serial port {} at {} baud", path, baud);
        let port = SerialPort::open(path, baud)?;
        Ok(Self {
            port: Some(port),
            path: path.to_string(),
            pending: Vec::new(),
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        })
    }

    /// A write that cannot drain within `timeout` (flow control stuck, USB bridge gone)
    /// fails with [`ChannelError::TimedOut`].
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn available_ports() -> Vec<String> {
        match SerialPort::available_ports() {
            Ok(paths) => paths.iter().map(|p| p.display().to_string()).collect(),
            Err(e) => {
                tracing::warn!("could not enumerate serial ports: {}", e);
                vec![]
            }
        }
    }

    fn port(&self) -> Result<&SerialPort, ChannelError> {
        self.port.as_ref().ok_or(ChannelError::Closed)
    }

    /// Pop one complete line off the front of the buffer.
    fn take_line(&mut self) -> Option<Vec<u8>> {
        let end = self.pending.iter().position(|&b| b == b'\n')?;
        let mut line: Vec<u8> = self.pending.drain(..=end).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(line)
    }
}

#[async_trait]
impl DeviceChannel for SerialChannel {
    async fn write_line(&mut self, line: &str) -> Result<(), ChannelError> {
        tracing::debug!("RTC <- {}", line.trim_end());
        let deadline = ReadDeadline::after(self.write_timeout);
        bounded_write(deadline, self.port()?.write_all(line.as_bytes())).await
    }

    async fn read_line(&mut self, deadline: ReadDeadline) -> Result<String, ChannelError> {
        loop {
            if let Some(raw) = self.take_line() {
                let line = String::from_utf8(raw)?;
                tracing::debug!("RTC -> {}", line);
                return Ok(line);
            }
            let mut buf = [0u8; READ_CHUNK];
            let port = self.port.as_ref().ok_or(ChannelError::Closed)?;
            let n = deadline.bound(port.read(&mut buf)).await??;
            if n == 0 {
                return Err(ChannelError::Closed);
            }
            self.pending.extend_from_slice(&buf[..n]);
        }
    }

    async fn reset_input_buffer(&mut self) -> Result<(), ChannelError> {
        self.pending.clear();
        self.port()?.discard_input_buffer()?;
        Ok(())
    }

    async fn reset_output_buffer(&mut self) -> Result<(), ChannelError> {
        self.port()?.discard_output_buffer()?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ChannelError> {
        if self.port.take().is_some() {
            tracing::info!("Closed RTC serial port {}", self.path);
        }
        self.pending.clear();
        Ok(())
    }
}

async fn bounded_write<F>(deadline: ReadDeadline, write: F) -> Result<(), ChannelError>
where
    F: Future<Output = std::io::Result<()>>,
{
    deadline.bound(write).await??;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detached(pending: &[u8]) -> SerialChannel {
        SerialChannel {
            port: None,
            path: "/dev/null".to_string(),
            pending: pending.to_vec(),
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }

    #[test]
    fn test_take_line_strips_crlf_and_lf() {
        let mut channel = detached(b"noise\r\nrequest\n1 2 3 4\r\npart");
        assert_eq!(channel.take_line().as_deref(), Some(&b"noise"[..]));
        assert_eq!(channel.take_line().as_deref(), Some(&b"request"[..]));
        assert_eq!(channel.take_line().as_deref(), Some(&b"1 2 3 4"[..]));
        assert_eq!(channel.take_line(), None);
        assert_eq!(channel.pending, b"part");
    }

    #[tokio::test]
    async fn test_buffered_line_is_returned_without_port_io() {
        let mut channel = detached(b"request\r\n");
        let line = channel.read_line(ReadDeadline::Never).await.unwrap();
        assert_eq!(line, "request");
    }

    #[tokio::test]
    async fn test_closed_channel_reports_closed() {
        let mut channel = detached(b"");
        channel.close().await.unwrap();
        assert!(matches!(channel.write_line("ping\r\n").await, Err(ChannelError::Closed)));
        assert!(matches!(
            channel.read_line(ReadDeadline::after(Duration::from_millis(5))).await,
            Err(ChannelError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_stalled_write_times_out() {
        let deadline = ReadDeadline::after(Duration::from_millis(10));
        let stalled = std::future::pending::<std::io::Result<()>>();
        assert!(matches!(bounded_write(deadline, stalled).await, Err(ChannelError::TimedOut)));

        let failed = async { Err::<(), _>(std::io::Error::from(std::io::ErrorKind::BrokenPipe)) };
        assert!(matches!(bounded_write(ReadDeadline::after(Duration::from_secs(1)), failed).await, Err(ChannelError::Io(_))));
        assert!(bounded_write(ReadDeadline::Never, async { Ok::<(), std::io::Error>(()) }).await.is_ok());
    }

    #[test]
    fn test_write_timeout_is_configurable() {
        let channel = detached(b"").with_write_timeout(Duration::from_millis(250));
        assert_eq!(channel.write_timeout, Duration::from_millis(250));
        assert_eq!(detached(b"").write_timeout, DEFAULT_WRITE_TIMEOUT);
    }

    #[tokio::test]
    async fn test_invalid_utf8_surfaces_as_error() {
        let mut channel = detached(&[0xff, 0xfe, b'\n']);
        assert!(matches!(channel.read_line(ReadDeadline::Never).await, Err(ChannelError::InvalidUtf8(_))));
    }
}
