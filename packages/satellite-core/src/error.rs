//! Centralized error type for the satellite runtime.
//!
//! Every fallible operation in this crate returns [`SatelliteResult`]. Each
//! variant maps to one of the error kinds in the design: configuration
//! errors are fatal, transport/framing errors are recovered locally by the
//! owning peer, protocol/hook/DSP errors are logged and skipped.

use std::io;

use thiserror::Error;

/// Stable machine-readable tag for an error, carried into the `Error{text}`
/// lifecycle event's `data.code` field.
pub trait ErrorCode {
    fn code(&self) -> &'static str;
}

#[derive(Debug, Error)]
pub enum SatelliteError {
    /// Invalid or contradictory configuration; fatal, exit code 2.
    #[error("configuration error: {0}")]
    Config(String),

    /// Malformed Wyoming framing on a peer's socket; resets that peer.
    #[error("framing error: {0}")]
    Framing(#[from] FramingError),

    /// Transport-level failure (connect, read, write) on a peer; resets
    /// that peer and triggers backoff-retry.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// An unexpected or unknown message was received; logged and skipped,
    /// never fatal.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Subprocess hook failed to spawn or timed out.
    #[error("hook error: {0}")]
    Hook(String),

    /// An optional DSP stage raised; the stage is skipped for this chunk.
    #[error("dsp error: {0}")]
    Dsp(String),

    /// Local mic/snd capture subprocess could not be started.
    #[error("device busy: {0}")]
    DeviceBusy(String),
}

impl ErrorCode for SatelliteError {
    fn code(&self) -> &'static str {
        match self {
            SatelliteError::Config(_) => "config",
            SatelliteError::Framing(_) => "framing",
            SatelliteError::Transport(_) => "transport",
            SatelliteError::Protocol(_) => "protocol",
            SatelliteError::Hook(_) => "hook",
            SatelliteError::Dsp(_) => "dsp",
            SatelliteError::DeviceBusy(_) => "device_busy",
        }
    }
}

#[derive(Debug, Error)]
pub enum FramingError {
    #[error("connection closed before a complete header line")]
    TruncatedHeader,
    #[error("malformed header JSON: {0}")]
    InvalidHeaderJson(#[from] serde_json::Error),
    #[error("short read on {section} section: expected {expected} bytes, got {got}")]
    ShortRead {
        section: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("header missing required field `type`")]
    MissingType,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("unsupported bind/connect uri: {0}")]
    UnsupportedUri(String),
    #[error("peer cancelled")]
    Cancelled,
    #[error("ping timeout: no traffic for {0:?}")]
    PingTimeout(std::time::Duration),
}

pub type SatelliteResult<T> = Result<T, SatelliteError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_code() {
        let e = SatelliteError::Config("bad uri".into());
        assert_eq!(e.code(), "config");
    }

    #[test]
    fn framing_error_converts() {
        let fe = FramingError::MissingType;
        let e: SatelliteError = fe.into();
        assert_eq!(e.code(), "framing");
    }

    #[test]
    fn transport_error_converts() {
        let te = TransportError::Io(io::Error::new(io::ErrorKind::Other, "boom"));
        let e: SatelliteError = te.into();
        assert_eq!(e.code(), "transport");
    }
}
