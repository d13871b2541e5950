//! Instrument identifier resolution
//!
//! Instruments are named by short identifier strings:
//!
//! | Identifier            | Transport | VISA resource                       |
//! |-----------------------|-----------|-------------------------------------|
//! | `IP:192.168.12.238`   | network   | `TCPIP0::192.168.12.238::inst0::INSTR` |
//! | `GPIB:2`              | GPIB      | `GPIB0::2::INSTR`                   |
//! | `USB:0x1AB1::0x04CE::DS1ZA1::INSTR` | USB | `USB0::0x1AB1::0x04CE::DS1ZA1::INSTR` |
//! | `USB0::0x1AB1::...::INSTR` | USB  | unchanged                           |
//! | `COM7`                | serial    | `ASRL7::INSTR`                      |
//!
//! The prefix is inspected exactly once, in [`resolve`]; afterwards the
//! transport kind travels as the [`ConnectionParams`] variant.

use crate::error::{AppResult, LabError};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// Highest primary address on a GPIB bus.
pub const GPIB_MAX_ADDRESS: u8 = 30;

/// Transport family of an identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// LAN instrument
    Network,
    /// IEEE-488 instrument
    Gpib,
    /// USBTMC instrument
    Usb,
    /// RS-232 / virtual COM port
    Serial,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportKind::Network => "network",
            TransportKind::Gpib => "gpib",
            TransportKind::Usb => "usb",
            TransportKind::Serial => "serial",
        };
        f.write_str(name)
    }
}

/// Resolved connection parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ConnectionParams {
    /// Host name or IP address of a LAN instrument
    Network {
        /// Host name or address
        host: String,
    },
    /// GPIB board and primary address
    Gpib {
        /// Interface board number
        board: u8,
        /// Primary address (0-30)
        address: u8,
    },
    /// USB descriptor, passed to VISA
    Usb {
        /// Descriptor as written after `USB:` (or the whole VISA resource)
        descriptor: String,
    },
    /// Serial port name
    Serial {
        /// Port name, e.g. `COM7`
        port: String,
    },
}

impl ConnectionParams {
    /// Transport family.
    pub fn kind(&self) -> TransportKind {
        match self {
            ConnectionParams::Network { .. } => TransportKind::Network,
            ConnectionParams::Gpib { .. } => TransportKind::Gpib,
            ConnectionParams::Usb { .. } => TransportKind::Usb,
            ConnectionParams::Serial { .. } => TransportKind::Serial,
        }
    }

    /// VISA resource string for these parameters.
    pub fn visa_resource(&self) -> String {
        match self {
            ConnectionParams::Network { host } => format!("TCPIP0::{}::inst0::INSTR", host),
            ConnectionParams::Gpib { board, address } => {
                format!("GPIB{}::{}::INSTR", board, address)
            }
            ConnectionParams::Usb { descriptor } => {
                let mut resource = if descriptor.to_ascii_uppercase().starts_with("USB") {
                    descriptor.clone()
                } else {
                    format!("USB0::{}", descriptor)
                };
                if !resource.to_ascii_uppercase().ends_with("::INSTR") {
                    resource.push_str("::INSTR");
                }
                resource
            }
            ConnectionParams::Serial { port } => match port.strip_prefix("COM") {
                Some(n) => format!("ASRL{}::INSTR", n),
                None => port.clone(),
            },
        }
    }
}

impl fmt::Display for ConnectionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionParams::Network { host } => write!(f, "network host {}", host),
            ConnectionParams::Gpib { board, address } => {
                write!(f, "gpib board {} address {}", board, address)
            }
            ConnectionParams::Usb { descriptor } => write!(f, "usb {}", descriptor),
            ConnectionParams::Serial { port } => write!(f, "serial port {}", port),
        }
    }
}

/// An identifier string together with its resolved parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrumentIdentifier {
    raw: String,
    params: ConnectionParams,
}

impl InstrumentIdentifier {
    /// Parse and resolve an identifier.
    pub fn parse(raw: &str) -> AppResult<Self> {
        let params = resolve(raw)?;
        Ok(Self {
            raw: raw.trim().to_string(),
            params,
        })
    }

    /// The identifier as given (trimmed).
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Resolved parameters.
    pub fn params(&self) -> &ConnectionParams {
        &self.params
    }

    /// Transport family.
    pub fn kind(&self) -> TransportKind {
        self.params.kind()
    }
}

impl FromStr for InstrumentIdentifier {
    type Err = LabError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for InstrumentIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

fn invalid(identifier: &str, reason: impl Into<String>) -> LabError {
    LabError::InvalidIdentifier {
        identifier: identifier.to_string(),
        reason: reason.into(),
    }
}

/// Resolve an identifier string to connection parameters.
///
/// Fails with [`LabError::UnrecognizedTransport`] when the prefix is not one
/// of `IP:`, `GPIB:`, `USB`, `COM`, and with [`LabError::InvalidIdentifier`]
/// when the prefix is known but the payload is unusable. No I/O happens here.
pub fn resolve(identifier: &str) -> AppResult<ConnectionParams> {
    let id = identifier.trim();

    if let Some(host) = id.strip_prefix("IP:") {
        if host.is_empty() || host.chars().any(char::is_whitespace) {
            return Err(invalid(id, "expected IP:<host>"));
        }
        return Ok(ConnectionParams::Network {
            host: host.to_string(),
        });
    }

    if let Some(addr) = id.strip_prefix("GPIB:") {
        let address: u8 = addr
            .parse()
            .map_err(|_| invalid(id, "GPIB address must be a decimal number"))?;
        if address > GPIB_MAX_ADDRESS {
            return Err(invalid(
                id,
                format!("GPIB address must be 0-{}", GPIB_MAX_ADDRESS),
            ));
        }
        return Ok(ConnectionParams::Gpib { board: 0, address });
    }

    if let Some(rest) = id.strip_prefix("USB") {
        let descriptor = match rest.strip_prefix(':') {
            // USB:<descriptor>, but not a bare VISA resource such as USB::0x...
            Some(d) if !d.starts_with(':') => d,
            _ => id,
        };
        if descriptor.is_empty() || rest.is_empty() {
            return Err(invalid(id, "expected USB:<descriptor>"));
        }
        return Ok(ConnectionParams::Usb {
            descriptor: descriptor.to_string(),
        });
    }

    if let Some(n) = id.strip_prefix("COM") {
        let number: u32 = n
            .parse()
            .map_err(|_| invalid(id, "expected COM<n>"))?;
        if number == 0 {
            return Err(invalid(id, "COM port numbers start at 1"));
        }
        return Ok(ConnectionParams::Serial {
            port: id.to_string(),
        });
    }

    Err(LabError::UnrecognizedTransport(id.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_network() {
        let params = resolve("IP:192.168.12.238").unwrap();
        assert_eq!(
            params,
            ConnectionParams::Network {
                host: "192.168.12.238".to_string()
            }
        );
        assert_eq!(
            params.visa_resource(),
            "TCPIP0::192.168.12.238::inst0::INSTR"
        );
    }

    #[test]
    fn test_resolve_gpib() {
        let params = resolve("GPIB:2").unwrap();
        assert_eq!(params, ConnectionParams::Gpib { board: 0, address: 2 });
        assert_eq!(params.visa_resource(), "GPIB0::2::INSTR");
        assert_eq!(params.kind(), TransportKind::Gpib);
    }

    #[test]
    fn test_resolve_serial() {
        let params = resolve("COM7").unwrap();
        assert_eq!(
            params,
            ConnectionParams::Serial {
                port: "COM7".to_string()
            }
        );
        assert_eq!(params.visa_resource(), "ASRL7::INSTR");
    }

    #[test]
    fn test_resolve_usb_forms() {
        let params = resolve("USB:0x1AB1::0x04CE::DS1ZA123456789").unwrap();
        assert_eq!(
            params.visa_resource(),
            "USB0::0x1AB1::0x04CE::DS1ZA123456789::INSTR"
        );

        let params = resolve("USB0::0x1AB1::0x04CE::DS1ZA123456789::INSTR").unwrap();
        assert_eq!(
            params,
            ConnectionParams::Usb {
                descriptor: "USB0::0x1AB1::0x04CE::DS1ZA123456789::INSTR".to_string()
            }
        );
        assert_eq!(
            params.visa_resource(),
            "USB0::0x1AB1::0x04CE::DS1ZA123456789::INSTR"
        );
    }

    #[test]
    fn test_unrecognized_prefix() {
        let err = resolve("FOO:bar").unwrap_err();
        assert!(matches!(err, LabError::UnrecognizedTransport(_)));
        assert!(err.is_config_error());

        // The prefix must start the identifier.
        assert!(resolve("MY-IP:10.0.0.1").is_err());
        assert!(resolve("TCPIP0::10.0.0.1::INSTR").is_err());
    }

    #[test]
    fn test_invalid_payloads() {
        assert!(matches!(
            resolve("IP:").unwrap_err(),
            LabError::InvalidIdentifier { .. }
        ));
        assert!(matches!(
            resolve("GPIB:x").unwrap_err(),
            LabError::InvalidIdentifier { .. }
        ));
        assert!(matches!(
            resolve("GPIB:31").unwrap_err(),
            LabError::InvalidIdentifier { .. }
        ));
        assert!(matches!(
            resolve("USB:").unwrap_err(),
            LabError::InvalidIdentifier { .. }
        ));
        assert!(matches!(
            resolve("USB").unwrap_err(),
            LabError::InvalidIdentifier { .. }
        ));
        assert!(matches!(
            resolve("COM").unwrap_err(),
            LabError::InvalidIdentifier { .. }
        ));
        assert!(matches!(
            resolve("COM0").unwrap_err(),
            LabError::InvalidIdentifier { .. }
        ));
    }

    #[test]
    fn test_identifier_keeps_raw_text() {
        let id: InstrumentIdentifier = " GPIB:12 ".parse().unwrap();
        assert_eq!(id.as_str(), "GPIB:12");
        assert_eq!(id.kind(), TransportKind::Gpib);
        assert_eq!(id.to_string(), "GPIB:12");
    }
}
