//! Line-oriented ASCII protocol spoken with the RTC board.
//!
//! | Direction | Line |
//! |---|---|
//! | host -> device | `set_time <seconds> <ticks>` (or bare `<seconds> <ticks>` for [`WireProtocol::LegacyCentis`]) |
//! | host -> device | `ping` |
//! | device -> host | `request` |
//! | host -> device | `response` |
//! | device -> host | `<t0 seconds> <t0 micros> <t3 seconds> <t3 micros>` |
//! | host -> device | `change_time <seconds as float>` |
//! | host -> device | `get_time` |
//! | device -> host | `RTC's current time: <seconds> seconds, <micros> microseconds` |
//!
//! Host lines end in CRLF under [`WireProtocol::Micros`] and LF under
//! [`WireProtocol::LegacyCentis`]. Device lines are accepted with either terminator.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::timestamp::Timestamp;

/// Literal line the device sends after receiving `ping`.
pub const REQUEST_MARKER: &str = "request";

const TIME_REPORT_PREFIX: &str = "RTC's current time:";

#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    #[error("expected {expected} fields, found {found} in {line:?}")]
    WrongFieldCount { expected: usize, found: usize, line: String },
    #[error("invalid integer {token:?} in {line:?}")]
    InvalidInteger { token: String, line: String },
    #[error("invalid number {token:?} in {line:?}")]
    InvalidNumber { token: String, line: String },
    #[error("fraction {ticks} out of range for denominator {denominator}")]
    FractionOutOfRange { ticks: u32, denominator: u32 },
    #[error("unknown command {0:?}")]
    UnknownCommand(String),
    #[error("line is not valid UTF-8")]
    NotUtf8,
}

/// Protocol version. Decides the fraction denominator, the seed line format and
/// the host line terminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WireProtocol {
    /// Microsecond fractions, `set_time` verb, CRLF.
    #[default]
    Micros,
    /// Hundredth-of-a-second fractions, bare seed line, LF.
    LegacyCentis,
}

impl WireProtocol {
    pub fn fraction_denominator(self) -> u32 {
        match self {
            WireProtocol::Micros => Timestamp::MICROS,
            WireProtocol::LegacyCentis => Timestamp::CENTIS,
        }
    }

    pub fn line_terminator(self) -> &'static str {
        match self {
            WireProtocol::Micros => "\r\n",
            WireProtocol::LegacyCentis => "\n",
        }
    }
}

/// Commands the host sends to the device.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceCommand {
    SetTime(Timestamp),
    Ping,
    Response,
    /// Add this many seconds to the device clock.
    ChangeTime(f64),
    GetTime,
}

impl DeviceCommand {
    /// Render without the terminator. `SetTime` is rescaled to the protocol's
    /// denominator first.
    pub fn to_line(&self, protocol: WireProtocol) -> String {
        match self {
            DeviceCommand::SetTime(ts) => {
                let ts = ts.rescaled(protocol.fraction_denominator());
                match protocol {
                    WireProtocol::Micros => format!("set_time {} {}", ts.seconds, ts.ticks),
                    WireProtocol::LegacyCentis => format!("{} {}", ts.seconds, ts.ticks),
                }
            }
            DeviceCommand::Ping => "ping".to_string(),
            DeviceCommand::Response => "response".to_string(),
            DeviceCommand::ChangeTime(offset) => format!("change_time {}", offset),
            DeviceCommand::GetTime => "get_time".to_string(),
        }
    }

    /// Render with the protocol's terminator, ready for the wire.
    pub fn encode(&self, protocol: WireProtocol) -> String {
        format!("{}{}", self.to_line(protocol), protocol.line_terminator())
    }

    /// Parse a host line as the device's command interpreter would.
    pub fn parse(line: &str, protocol: WireProtocol) -> Result<Self, ProtocolError> {
        let line = line.trim();
        let tokens: Vec<&str> = line.split_whitespace().collect();
        match tokens.as_slice() {
            ["ping"] => Ok(DeviceCommand::Ping),
            ["response"] => Ok(DeviceCommand::Response),
            ["get_time"] => Ok(DeviceCommand::GetTime),
            ["set_time", rest @ ..] if protocol == WireProtocol::Micros => {
                expect_fields(rest.len(), 2, line)?;
                Ok(DeviceCommand::SetTime(parse_timestamp(rest[0], rest[1], protocol, line)?))
            }
            ["change_time", rest @ ..] => {
                expect_fields(rest.len(), 1, line)?;
                let offset = rest[0].parse::<f64>().map_err(|_| ProtocolError::InvalidNumber {
                    token: rest[0].to_string(),
                    line: line.to_string(),
                })?;
                Ok(DeviceCommand::ChangeTime(offset))
            }
            [seconds, ticks] if protocol == WireProtocol::LegacyCentis => {
                Ok(DeviceCommand::SetTime(parse_timestamp(seconds, ticks, protocol, line)?))
            }
            _ => Err(ProtocolError::UnknownCommand(line.to_string())),
        }
    }
}

/// True when `line` is exactly the request marker once its terminator is removed.
pub fn is_request_marker(line: &str) -> bool {
    line.trim_end_matches(['\r', '\n']) == REQUEST_MARKER
}

/// Parse the device's `t0 t0_ticks t3 t3_ticks` reply. The firmware prints these
/// fractions in microseconds under every protocol version; only seed lines change scale.
pub fn parse_round_trip_reply(line: &str) -> Result<(Timestamp, Timestamp), ProtocolError> {
    let line = line.trim();
    let tokens: Vec<&str> = line.split_whitespace().collect();
    expect_fields(tokens.len(), 4, line)?;
    let t0 = parse_timestamp(tokens[0], tokens[1], WireProtocol::Micros, line)?;
    let t3 = parse_timestamp(tokens[2], tokens[3], WireProtocol::Micros, line)?;
    Ok((t0, t3))
}

pub fn format_round_trip_reply(t0: &Timestamp, t3: &Timestamp) -> String {
    let (t0, t3) = (t0.rescaled(Timestamp::MICROS), t3.rescaled(Timestamp::MICROS));
    format!("{} {} {} {}", t0.seconds, t0.ticks, t3.seconds, t3.ticks)
}

/// Parse the firmware's `get_time` answer. The firmware always prints microseconds,
/// whatever protocol version the seed lines use.
pub fn parse_time_report(line: &str) -> Result<Timestamp, ProtocolError> {
    let line = line.trim();
    let body = line
        .strip_prefix(TIME_REPORT_PREFIX)
        .ok_or_else(|| ProtocolError::UnknownCommand(line.to_string()))?;
    let tokens: Vec<&str> = body.split(|c: char| c.is_whitespace() || c == ',').filter(|t| !t.is_empty()).collect();
    match tokens.as_slice() {
        [seconds, "seconds", micros, "microseconds"] => parse_timestamp(seconds, micros, WireProtocol::Micros, line),
        _ => Err(ProtocolError::WrongFieldCount { expected: 4, found: tokens.len(), line: line.to_string() }),
    }
}

pub fn format_time_report(ts: &Timestamp) -> String {
    let ts = ts.rescaled(Timestamp::MICROS);
    format!("{} {} seconds, {} microseconds", TIME_REPORT_PREFIX, ts.seconds, ts.ticks)
}

fn expect_fields(found: usize, expected: usize, line: &str) -> Result<(), ProtocolError> {
    if found != expected {
        return Err(ProtocolError::WrongFieldCount { expected, found, line: line.to_string() });
    }
    Ok(())
}

fn parse_timestamp(seconds: &str, ticks: &str, protocol: WireProtocol, line: &str) -> Result<Timestamp, ProtocolError> {
    let invalid = |token: &str| ProtocolError::InvalidInteger { token: token.to_string(), line: line.to_string() };
    let secs = seconds.parse::<u64>().map_err(|_| invalid(seconds))?;
    let ticks = ticks.parse::<u32>().map_err(|_| invalid(ticks))?;
    Timestamp::new(secs, ticks, protocol.fraction_denominator())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_seed_per_protocol() {
        let ts = Timestamp::new(1_000_000, 500_000, Timestamp::MICROS).unwrap();
        assert_eq!(DeviceCommand::SetTime(ts).encode(WireProtocol::Micros), "set_time 1000000 500000\r\n");
        assert_eq!(DeviceCommand::SetTime(ts).encode(WireProtocol::LegacyCentis), "1000000 50\n");
    }

    #[test]
    fn test_encode_fixed_commands() {
        assert_eq!(DeviceCommand::Ping.encode(WireProtocol::Micros), "ping\r\n");
        assert_eq!(DeviceCommand::Response.encode(WireProtocol::Micros), "response\r\n");
        assert_eq!(DeviceCommand::ChangeTime(-0.125).encode(WireProtocol::Micros), "change_time -0.125\r\n");
        assert_eq!(DeviceCommand::ChangeTime(0.0000005).to_line(WireProtocol::Micros), "change_time 0.0000005");
    }

    #[test]
    fn test_parse_accepts_what_encode_produces() {
        let ts = Timestamp::new(12, 34, Timestamp::CENTIS).unwrap();
        let line = DeviceCommand::SetTime(ts).encode(WireProtocol::LegacyCentis);
        assert_eq!(DeviceCommand::parse(&line, WireProtocol::LegacyCentis), Ok(DeviceCommand::SetTime(ts)));
        assert_eq!(
            DeviceCommand::parse("change_time 0.25\r\n", WireProtocol::Micros),
            Ok(DeviceCommand::ChangeTime(0.25))
        );
    }

    #[test]
    fn test_parse_rejects_bare_seed_under_micros() {
        assert!(matches!(
            DeviceCommand::parse("1000 20", WireProtocol::Micros),
            Err(ProtocolError::UnknownCommand(_))
        ));
        assert!(matches!(
            DeviceCommand::parse("set_time 1000", WireProtocol::Micros),
            Err(ProtocolError::WrongFieldCount { expected: 2, found: 1, .. })
        ));
    }

    #[test]
    fn test_request_marker_is_exact() {
        assert!(is_request_marker("request\r\n"));
        assert!(is_request_marker("request\n"));
        assert!(is_request_marker("request"));
        assert!(!is_request_marker("requests"));
        assert!(!is_request_marker(" request"));
        assert!(!is_request_marker("noise"));
    }

    #[test]
    fn test_parse_round_trip_reply() {
        let (t0, t3) = parse_round_trip_reply("1000 250000 1000 750000\r\n").unwrap();
        assert_eq!((t0.seconds, t0.ticks), (1000, 250_000));
        assert_eq!((t3.seconds, t3.ticks), (1000, 750_000));
        assert_eq!(t0.denominator, Timestamp::MICROS);
    }

    #[test]
    fn test_round_trip_reply_is_micros_even_for_legacy_seeding() {
        // Legacy boards take hundredths in the seed line but still answer pings in microseconds.
        let seed = DeviceCommand::SetTime(Timestamp::new(1000, 250_000, Timestamp::MICROS).unwrap());
        assert_eq!(seed.to_line(WireProtocol::LegacyCentis), "1000 25");
        let t0 = Timestamp::new(1000, 25, Timestamp::CENTIS).unwrap();
        let t3 = Timestamp::new(1000, 750_000, Timestamp::MICROS).unwrap();
        let line = format_round_trip_reply(&t0, &t3);
        assert_eq!(line, "1000 250000 1000 750000");
        let (parsed_t0, parsed_t3) = parse_round_trip_reply(&line).unwrap();
        assert_eq!(parsed_t0.as_secs_f64(), 1000.25);
        assert_eq!(parsed_t3, t3);
    }

    #[test]
    fn test_malformed_round_trip_reply() {
        assert!(matches!(
            parse_round_trip_reply("1 2 3"),
            Err(ProtocolError::WrongFieldCount { expected: 4, found: 3, .. })
        ));
        assert!(matches!(
            parse_round_trip_reply("1 2 x 4"),
            Err(ProtocolError::InvalidInteger { .. })
        ));
        assert!(matches!(
            parse_round_trip_reply("1 2 3 1000000"),
            Err(ProtocolError::FractionOutOfRange { ticks: 1_000_000, denominator: 1_000_000 })
        ));
    }

    #[test]
    fn test_time_report() {
        let ts = Timestamp::new(1_000_003_000, 40, Timestamp::MICROS).unwrap();
        let line = format_time_report(&ts);
        assert_eq!(line, "RTC's current time: 1000003000 seconds, 40 microseconds");
        assert_eq!(parse_time_report(&format!("{}\r\n", line)), Ok(ts));
        assert!(parse_time_report("alarm enabled").is_err());
    }
}
