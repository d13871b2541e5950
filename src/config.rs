//! Configuration System using Figment
//!
//! Settings are layered, lowest precedence first:
//! 1. Built-in defaults ([`Settings::default`])
//! 2. TOML configuration file (default: `config/labwire.toml`, optional)
//! 3. Environment variables prefixed with `LABWIRE_`
//!
//! # Environment Variable Overrides
//!
//! Nested keys are separated with a double underscore so that field names
//! containing underscores stay intact:
//!
//! ```text
//! LABWIRE_APPLICATION__LOG_LEVEL=debug
//! LABWIRE_TIMEOUTS__QUERY_TIMEOUT_MS=5000
//! LABWIRE_BRIDGE__SLAVE_ADDRESS=152
//! ```
//!
//! # Example
//!
//! ```no_run
//! use labwire::config::Settings;
//!
//! let settings = Settings::load()?;
//! println!("Query timeout: {:?}", settings.timeouts.query_timeout());
//! # Ok::<(), labwire::error::LabError>(())
//! ```

use crate::error::{AppResult, LabError};
use crate::register::{ByteOrder, OverflowPolicy};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/labwire.toml";

/// Prefix for environment variable overrides.
pub const ENV_PREFIX: &str = "LABWIRE_";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Application settings
    pub application: ApplicationSettings,
    /// Timeouts shared by every transport
    pub timeouts: TimeoutSettings,
    /// Network (IP:) instruments
    pub network: NetworkSettings,
    /// Serial (COM) instruments
    pub serial: SerialSettings,
    /// VISA-backed instruments (GPIB, USB, VXI-11)
    pub visa: VisaSettings,
    /// USB-to-I2C bridge
    pub bridge: BridgeSettings,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationSettings {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ApplicationSettings {
    fn default() -> Self {
        Self {
            name: "labwire".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Timeouts in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    /// Upper bound on waiting for a query reply
    pub query_timeout_ms: u64,
    /// Upper bound on opening a transport
    pub connect_timeout_ms: u64,
    /// Poll interval of the blocking serial read loop
    pub serial_read_timeout_ms: u64,
    /// Upper bound on waiting for a bridge status or data reply
    pub bus_timeout_ms: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            query_timeout_ms: 2000,
            connect_timeout_ms: 3000,
            serial_read_timeout_ms: 100,
            bus_timeout_ms: 1000,
        }
    }
}

impl TimeoutSettings {
    /// Query timeout as a [`Duration`].
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    /// Connect timeout as a [`Duration`].
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Serial poll interval as a [`Duration`].
    pub fn serial_read_timeout(&self) -> Duration {
        Duration::from_millis(self.serial_read_timeout_ms)
    }

    /// Bus reply timeout as a [`Duration`].
    pub fn bus_timeout(&self) -> Duration {
        Duration::from_millis(self.bus_timeout_ms)
    }
}

/// Which backend serves `IP:` identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkBackend {
    /// Raw SCPI socket (no native library required)
    Socket,
    /// VISA VXI-11 resource `TCPIP0::<host>::inst0::INSTR`
    Visa,
}

/// Network instrument settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    /// Backend used for `IP:` identifiers
    pub backend: NetworkBackend,
    /// TCP port of the raw SCPI socket
    pub port: u16,
    /// Terminator appended to every command
    pub line_terminator: String,
    /// Character that ends a reply
    pub response_delimiter: char,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            backend: NetworkBackend::Socket,
            port: 5025,
            line_terminator: "\n".to_string(),
            response_delimiter: '\n',
        }
    }
}

/// Serial instrument settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSettings {
    /// Baud rate (e.g., 9600, 115200)
    pub baud_rate: u32,
    /// Terminator appended to every command
    pub line_terminator: String,
    /// Character that ends a reply
    pub response_delimiter: char,
    /// Maps `COM<n>` names to OS device paths (e.g. `COM7 = "/dev/ttyUSB0"`)
    pub aliases: BTreeMap<String, String>,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            line_terminator: "\r\n".to_string(),
            response_delimiter: '\n',
            aliases: BTreeMap::new(),
        }
    }
}

impl SerialSettings {
    /// OS device path for a `COM<n>` port name, honoring aliases.
    pub fn device_path<'a>(&'a self, port: &'a str) -> &'a str {
        self.aliases.get(port).map(String::as_str).unwrap_or(port)
    }
}

/// VISA settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VisaSettings {
    /// Terminator appended to every command (typically "\n" for SCPI)
    pub line_terminator: String,
    /// Character that ends a reply
    pub response_delimiter: char,
}

impl Default for VisaSettings {
    fn default() -> Self {
        Self {
            line_terminator: "\n".to_string(),
            response_delimiter: '\n',
        }
    }
}

/// USB-to-I2C bridge settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeSettings {
    /// Slave address in 8-bit (write address) notation, e.g. 0x5C
    pub slave_address: u8,
    /// SCL frequency in Hz
    pub frequency_hz: u32,
    /// Register address width in bytes (1 or 2)
    pub address_width: usize,
    /// Send multi-byte register addresses most significant byte first
    pub address_big_endian: bool,
    /// Register data width in bytes (1..=8)
    pub data_width: usize,
    /// Byte order of multi-byte register data
    pub data_byte_order: ByteOrder,
    /// What to do with field values wider than their bit range
    pub overflow: OverflowPolicy,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            slave_address: 0x5C,
            frequency_hz: 100_000,
            address_width: 1,
            address_big_endian: false,
            data_width: 1,
            data_byte_order: ByteOrder::Little,
            overflow: OverflowPolicy::Reject,
        }
    }
}

impl Settings {
    /// Load configuration from `config/labwire.toml` and environment variables.
    ///
    /// A missing file is not an error; defaults apply.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path, then validate it.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let settings: Self = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Validate configuration after loading.
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Timeouts are non-zero
    /// - Serial baud rate is non-zero and terminators are not empty
    /// - Reply delimiters are ASCII
    /// - Bridge address/data widths are supported
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(LabError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let timeouts = [
            ("query_timeout_ms", self.timeouts.query_timeout_ms),
            ("connect_timeout_ms", self.timeouts.connect_timeout_ms),
            ("serial_read_timeout_ms", self.timeouts.serial_read_timeout_ms),
            ("bus_timeout_ms", self.timeouts.bus_timeout_ms),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(LabError::Configuration(format!(
                    "{} must be greater than zero",
                    name
                )));
            }
        }

        if self.serial.baud_rate == 0 {
            return Err(LabError::Configuration(
                "serial.baud_rate must be greater than zero".to_string(),
            ));
        }

        let terminators = [
            ("network", &self.network.line_terminator),
            ("serial", &self.serial.line_terminator),
            ("visa", &self.visa.line_terminator),
        ];
        for (section, terminator) in terminators {
            if terminator.is_empty() {
                return Err(LabError::Configuration(format!(
                    "{}.line_terminator cannot be empty",
                    section
                )));
            }
        }

        let delimiters = [
            ("network", self.network.response_delimiter),
            ("serial", self.serial.response_delimiter),
            ("visa", self.visa.response_delimiter),
        ];
        for (section, delimiter) in delimiters {
            if !delimiter.is_ascii() {
                return Err(LabError::Configuration(format!(
                    "{}.response_delimiter must be a single ASCII character",
                    section
                )));
            }
        }

        if !(1..=2).contains(&self.bridge.address_width) {
            return Err(LabError::Configuration(format!(
                "Invalid bridge.address_width {}. Must be 1 or 2",
                self.bridge.address_width
            )));
        }
        if !(1..=8).contains(&self.bridge.data_width) {
            return Err(LabError::Configuration(format!(
                "Invalid bridge.data_width {}. Must be 1-8",
                self.bridge.data_width
            )));
        }
        if self.bridge.slave_address & 0x01 != 0 {
            return Err(LabError::Configuration(format!(
                "bridge.slave_address {:#04x} must be an 8-bit write address (even)",
                self.bridge.slave_address
            )));
        }
        if self.bridge.frequency_hz == 0 {
            return Err(LabError::Configuration(
                "bridge.frequency_hz must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml(&self) -> AppResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| LabError::Configuration(format!("Cannot render settings: {}", e)))
    }
}
