// MIT License - Copyright (c) 2026 Peter Wright

use std::fmt;

/// Device-reported error codes, unified across both drivers.
///
/// The Omni panel naks with a reason byte; the VRCOP reports a three-digit
/// decimal code after its `E` response character. Both are folded into this
/// enum so the request/reply engines can share retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceErrorCode {
    /// Omni nak with no further detail.
    Nak,
    /// VRCOP: command rejected, parse failure.
    BadCommand,
    /// VRCOP: node id out of range or not in the controller's table.
    NoSuchNode,
    /// VRCOP: RF transmit failed (no ack from the target node).
    TransmitFailed,
    /// VRCOP: controller busy, command queue full.
    Busy,
    /// VRCOP: checksum failure on the serial link.
    Checksum,
    /// Any other code, carried verbatim.
    Other(u16),
}

impl DeviceErrorCode {
    /// Map a VRCOP three-digit code to a known variant.
    pub fn from_vrcop_code(code: u16) -> Self {
        match code {
            1 => Self::BadCommand,
            2 => Self::NoSuchNode,
            4 => Self::Checksum,
            5 => Self::Busy,
            10 => Self::TransmitFailed,
            other => Self::Other(other),
        }
    }

    /// Whether the request/reply engine may immediately retry on this code.
    ///
    /// Only congestion-class outcomes are retried; anything that indicates a
    /// malformed or unsupported request fails at once.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Busy | Self::TransmitFailed)
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Nak => "request rejected by panel",
            Self::BadCommand => "command not understood",
            Self::NoSuchNode => "no such node",
            Self::TransmitFailed => "RF transmit failed",
            Self::Busy => "controller busy",
            Self::Checksum => "serial checksum error",
            Self::Other(_) => "device error",
        }
    }
}

impl fmt::Display for DeviceErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Other(code) => write!(f, "device error code {}", code),
            other => f.write_str(other.description()),
        }
    }
}

/// All errors surfaced by the driver core.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No frame arrived within the deadline. Retried a bounded number of
    /// times by the request/reply engine, then surfaced.
    #[error("timed out waiting for {waiting_for}")]
    Timeout { waiting_for: String },

    /// Frame too short, bad CRC, or a continuation line that does not match
    /// its prefix. The frame is discarded; never retried.
    #[error("malformed frame: {details}")]
    Malformed { details: String },

    /// The device explicitly rejected the request.
    #[error("device error: {0}")]
    Device(DeviceErrorCode),

    /// A non-zero received sequence number did not match the expected one.
    /// Indicates a corrupted session; only a reconnect can fix it.
    #[error("out of sync: expected sequence {expected}, received {received}")]
    OutOfSync { expected: u16, received: u16 },

    /// Unknown unit, command, or model. Rejected locally.
    #[error("unsupported: {details}")]
    Unsupported { details: String },

    #[error("connection closed by peer")]
    Disconnected,

    #[error("session handshake failed: {details}")]
    HandshakeFailed { details: String },

    #[error("duplicate unit: {details}")]
    DuplicateUnit { details: String },

    #[error("invalid configuration: {details}")]
    InvalidConfig { details: String },
}

impl DriverError {
    pub fn malformed(details: impl Into<String>) -> Self {
        Self::Malformed { details: details.into() }
    }

    pub fn unsupported(details: impl Into<String>) -> Self {
        Self::Unsupported { details: details.into() }
    }

    pub fn timeout(waiting_for: impl Into<String>) -> Self {
        Self::Timeout { waiting_for: waiting_for.into() }
    }

    /// Whether this error ends the connection. The host lifecycle reacts to
    /// these by tearing down and reconnecting; everything else is local to
    /// one exchange.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            Self::Io(_)
                | Self::Disconnected
                | Self::OutOfSync { .. }
                | Self::HandshakeFailed { .. }
        )
    }

    /// Whether the outer lifecycle should attempt a reconnect after this.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::Disconnected | Self::Timeout { .. } | Self::OutOfSync { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, DriverError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_codes() {
        assert!(DeviceErrorCode::Busy.is_transient());
        assert!(DeviceErrorCode::TransmitFailed.is_transient());
        assert!(!DeviceErrorCode::Nak.is_transient());
        assert!(!DeviceErrorCode::BadCommand.is_transient());
        assert!(!DeviceErrorCode::Other(99).is_transient());
    }

    #[test]
    fn vrcop_code_mapping() {
        assert_eq!(DeviceErrorCode::from_vrcop_code(2), DeviceErrorCode::NoSuchNode);
        assert_eq!(DeviceErrorCode::from_vrcop_code(10), DeviceErrorCode::TransmitFailed);
        assert_eq!(DeviceErrorCode::from_vrcop_code(77), DeviceErrorCode::Other(77));
    }

    #[test]
    fn fatality_classes() {
        assert!(DriverError::Disconnected.is_connection_fatal());
        assert!(DriverError::OutOfSync { expected: 3, received: 7 }.is_connection_fatal());
        assert!(!DriverError::timeout("ack").is_connection_fatal());
        assert!(!DriverError::malformed("short").is_connection_fatal());
        assert!(!DriverError::Device(DeviceErrorCode::Nak).is_connection_fatal());
    }
}
