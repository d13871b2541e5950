//! Custom error types for the crate.
//!
//! This module defines the primary error type, `LabError`, shared by the
//! transport, session, bus and register layers. Using the `thiserror` crate, it
//! gives every failure a distinct variant so callers can tell a malformed
//! register specifier from a device that did not acknowledge its address.
//!
//! ## Error Hierarchy
//!
//! - **Usage errors** are detected locally and never reach a device:
//!   `InvalidRegisterSpec`, `UnrecognizedTransport`, `InvalidIdentifier`,
//!   `Configuration`, `ConfigLoad`, `ValueOutOfRange`, `AddressOutOfRange` and
//!   `FeatureNotEnabled`.
//! - **Recoverable errors** leave the connection usable: `Timeout`, `BusNack`
//!   and `BusTimeout`. Whether to retry is the caller's decision; blindly
//!   re-issuing a command to physical equipment can re-trigger a measurement.
//! - **Fatal errors** mean the transport can no longer be trusted: `Io`,
//!   `Transport`, `Protocol` and `NotConnected`. A session drops its transport
//!   when it sees one of these.
//!
//! [`LabError::class`] exposes this grouping as an [`ErrorClass`].

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, LabError>;

/// Coarse grouping of [`LabError`] variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Caller input or configuration was rejected before any I/O.
    Usage,
    /// The device did not answer in time or refused the bus cycle; the link is intact.
    Recoverable,
    /// The link itself failed or was never established.
    Fatal,
}

/// Every failure the library reports.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum LabError {
    /// A register specifier did not parse or does not fit the register.
    #[error("Invalid register specifier '{spec}': {reason}")]
    InvalidRegisterSpec {
        /// Specifier as given
        spec: String,
        /// What is wrong with it
        reason: String,
    },

    /// The identifier names no known transport.
    #[error("Unrecognized transport in instrument identifier '{0}' (expected IP:, GPIB:, USB or COM)")]
    UnrecognizedTransport(String),

    /// The transport prefix is known but its payload is not.
    #[error("Invalid instrument identifier '{identifier}': {reason}")]
    InvalidIdentifier {
        /// Identifier as given
        identifier: String,
        /// What is wrong with it
        reason: String,
    },

    /// Loaded settings failed validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Settings could not be read or merged.
    #[error("Configuration load error: {0}")]
    ConfigLoad(#[from] Box<figment::Error>),

    /// A value is wider than its field or register.
    #[error("Value {value:#x} does not fit in a {bits}-bit field")]
    ValueOutOfRange {
        /// Rejected value
        value: u64,
        /// Available width
        bits: u32,
    },

    /// A register address is wider than the configured address encoding.
    #[error("Register address {address:#x} does not fit in {width} address byte(s)")]
    AddressOutOfRange {
        /// Rejected address
        address: u32,
        /// Address width in bytes
        width: usize,
    },

    /// No live transport.
    #[error("Instrument '{0}' is not connected")]
    NotConnected(String),

    /// A reply did not arrive in time.
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        /// What was being waited for
        operation: String,
        /// Limit that expired
        timeout: Duration,
    },

    /// The addressed I2C slave did not acknowledge.
    #[error("I2C slave {slave:#04x} did not acknowledge")]
    BusNack {
        /// 7-bit slave address
        slave: u8,
    },

    /// The bridge did not answer a frame.
    #[error("I2C bus stalled: no reply from bridge within {0:?}")]
    BusTimeout(Duration),

    /// Operating system I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Backend failure other than plain I/O.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The bridge sent something the frame protocol does not allow.
    #[error("Bridge protocol error: {0}")]
    Protocol(String),

    /// The backend was compiled out.
    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),
}

impl LabError {
    /// Classify the error as usage, recoverable or fatal.
    pub fn class(&self) -> ErrorClass {
        match self {
            LabError::InvalidRegisterSpec { .. }
            | LabError::UnrecognizedTransport(_)
            | LabError::InvalidIdentifier { .. }
            | LabError::Configuration(_)
            | LabError::ConfigLoad(_)
            | LabError::ValueOutOfRange { .. }
            | LabError::AddressOutOfRange { .. }
            | LabError::FeatureNotEnabled(_) => ErrorClass::Usage,
            LabError::Timeout { .. } | LabError::BusNack { .. } | LabError::BusTimeout(_) => {
                ErrorClass::Recoverable
            }
            LabError::NotConnected(_)
            | LabError::Io(_)
            | LabError::Transport(_)
            | LabError::Protocol(_) => ErrorClass::Fatal,
        }
    }

    /// True for errors that leave the underlying link usable.
    pub fn is_recoverable(&self) -> bool {
        self.class() == ErrorClass::Recoverable
    }

    /// True for configuration errors (identifier or settings), as opposed to
    /// anything that happened on a connection.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            LabError::UnrecognizedTransport(_)
                | LabError::InvalidIdentifier { .. }
                | LabError::Configuration(_)
                | LabError::ConfigLoad(_)
        )
    }

    pub(crate) fn timeout(operation: impl Into<String>, timeout: Duration) -> Self {
        LabError::Timeout {
            operation: operation.into(),
            timeout,
        }
    }
}

impl From<figment::Error> for LabError {
    fn from(err: figment::Error) -> Self {
        LabError::ConfigLoad(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = LabError::BusNack { slave: 0x2e };
        assert_eq!(err.to_string(), "I2C slave 0x2e did not acknowledge");

        let err = LabError::ValueOutOfRange { value: 5, bits: 2 };
        assert_eq!(err.to_string(), "Value 0x5 does not fit in a 2-bit field");
    }

    #[test]
    fn test_error_classes() {
        assert_eq!(
            LabError::timeout("query '*IDN?'", Duration::from_secs(1)).class(),
            ErrorClass::Recoverable
        );
        assert!(LabError::BusTimeout(Duration::from_millis(5)).is_recoverable());
        assert_eq!(
            LabError::NotConnected("GPIB:2".into()).class(),
            ErrorClass::Fatal
        );
        assert_eq!(
            LabError::UnrecognizedTransport("FOO:bar".into()).class(),
            ErrorClass::Usage
        );
        assert!(LabError::UnrecognizedTransport("FOO:bar".into()).is_config_error());
        assert!(!LabError::Transport("gone".into()).is_config_error());
    }
}
