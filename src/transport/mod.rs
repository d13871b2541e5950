//! Transport abstraction
//!
//! A [`Transport`] is a byte channel that is already open to one device: a
//! TCP socket, a serial line, a VISA session, or a USB-I2C bridge's virtual
//! COM port. Everything above this module (sessions, the I2C bus, register
//! access) talks to devices only through this trait, so backends can be
//! swapped without touching the core.
//!
//! A [`Connector`] turns resolved [`ConnectionParams`] into an open transport.
//! [`DefaultConnector`] dispatches on the parameter variant once; there is no
//! string inspection after an identifier has been resolved.

pub mod discovery;
pub mod identifier;
pub mod mock;
#[cfg(feature = "instrument_serial")]
pub mod serial;
pub mod stream;
#[cfg(feature = "instrument_visa")]
pub mod visa;

pub use discovery::{discover, BackendScan, DiscoveryReport, Listing};
pub use identifier::{resolve, ConnectionParams, InstrumentIdentifier, TransportKind};
pub use mock::{MockConnector, MockTransport};
pub use stream::{StreamTransport, TcpTransport};

use crate::config::{NetworkBackend, Settings};
use crate::error::{AppResult, LabError};
use async_trait::async_trait;
use bytes::BytesMut;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Byte-oriented channel to a single device.
///
/// Implementations never retry; a failed call reports exactly what happened.
#[async_trait]
pub trait Transport: Send {
    /// Write all of `bytes`.
    async fn write_bytes(&mut self, bytes: &[u8]) -> AppResult<()>;

    /// Read between 1 and `max_len` bytes.
    ///
    /// Returns as soon as any data is available. Fails with
    /// [`LabError::Timeout`] if nothing arrives within `timeout`.
    async fn read_bytes(&mut self, max_len: usize, timeout: Duration) -> AppResult<Vec<u8>>;

    /// Release the underlying resource. Further I/O fails.
    async fn close(&mut self) -> AppResult<()>;

    /// Human-readable description (port name, resource string, peer address).
    fn describe(&self) -> String;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Box<T> {
    async fn write_bytes(&mut self, bytes: &[u8]) -> AppResult<()> {
        (**self).write_bytes(bytes).await
    }

    async fn read_bytes(&mut self, max_len: usize, timeout: Duration) -> AppResult<Vec<u8>> {
        (**self).read_bytes(max_len, timeout).await
    }

    async fn close(&mut self) -> AppResult<()> {
        (**self).close().await
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

/// Opens transports for resolved connection parameters.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a transport to the device described by `params`.
    async fn open(&self, params: &ConnectionParams) -> AppResult<Box<dyn Transport>>;
}

/// Read exactly `len` bytes, failing with [`LabError::Timeout`] if the total
/// wait exceeds `timeout`. Bytes received before the deadline are discarded on
/// failure.
pub async fn read_exact<T: Transport + ?Sized>(
    transport: &mut T,
    len: usize,
    timeout: Duration,
) -> AppResult<Vec<u8>> {
    let deadline = Instant::now() + timeout;
    let mut out = Vec::with_capacity(len);

    while out.len() < len {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(LabError::timeout(
                format!("reading {} byte(s) from {}", len, transport.describe()),
                timeout,
            ));
        }
        let chunk = match transport.read_bytes(len - out.len(), remaining).await {
            Ok(chunk) => chunk,
            Err(LabError::Timeout { .. }) => {
                return Err(LabError::timeout(
                    format!("reading {} byte(s) from {}", len, transport.describe()),
                    timeout,
                ))
            }
            Err(e) => return Err(e),
        };
        out.extend_from_slice(&chunk);
    }

    Ok(out)
}

/// Read until `delimiter` has been received and return everything up to and
/// including its first occurrence.
///
/// `buffer` carries bytes between calls: whatever arrived after the delimiter
/// stays in it and is consumed by the next call before the transport is read
/// again.
///
/// Fails with [`LabError::Timeout`] if no delimiter arrives within `timeout`
/// (bytes received so far stay buffered), and with [`LabError::Protocol`] if
/// more than `max_len` bytes accumulate without one (the buffer is cleared).
pub async fn read_until<T: Transport + ?Sized>(
    transport: &mut T,
    buffer: &mut BytesMut,
    delimiter: u8,
    max_len: usize,
    timeout: Duration,
) -> AppResult<Vec<u8>> {
    let deadline = Instant::now() + timeout;

    loop {
        if let Some(pos) = buffer.iter().position(|&b| b == delimiter) {
            return Ok(buffer.split_to(pos + 1).to_vec());
        }
        if buffer.len() > max_len {
            buffer.clear();
            return Err(LabError::Protocol(format!(
                "reply from {} exceeded {} bytes without a delimiter",
                transport.describe(),
                max_len
            )));
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(LabError::timeout(
                format!("waiting for reply from {}", transport.describe()),
                timeout,
            ));
        }
        let chunk = match transport.read_bytes(max_len.max(1), remaining).await {
            Ok(chunk) => chunk,
            Err(LabError::Timeout { .. }) => {
                return Err(LabError::timeout(
                    format!("waiting for reply from {}", transport.describe()),
                    timeout,
                ))
            }
            Err(e) => return Err(e),
        };
        buffer.extend_from_slice(&chunk);
    }
}

/// Opens the concrete backend matching each [`ConnectionParams`] variant.
#[derive(Debug, Clone)]
pub struct DefaultConnector {
    settings: Settings,
}

impl DefaultConnector {
    /// Create a connector using the given settings.
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }

    /// Settings used for every open.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    #[cfg(feature = "instrument_visa")]
    async fn open_visa(&self, resource: String) -> AppResult<Box<dyn Transport>> {
        let transport = visa::VisaTransport::open(resource, self.settings.timeouts.connect_timeout())
            .await?;
        Ok(Box::new(transport))
    }

    #[cfg(not(feature = "instrument_visa"))]
    async fn open_visa(&self, _resource: String) -> AppResult<Box<dyn Transport>> {
        Err(LabError::FeatureNotEnabled("instrument_visa".to_string()))
    }

    #[cfg(feature = "instrument_serial")]
    async fn open_serial(&self, port: &str) -> AppResult<Box<dyn Transport>> {
        let path = self.settings.serial.device_path(port);
        let transport = serial::SerialTransport::open(
            path,
            self.settings.serial.baud_rate,
            self.settings.timeouts.serial_read_timeout(),
        )
        .await?;
        Ok(Box::new(transport))
    }

    #[cfg(not(feature = "instrument_serial"))]
    async fn open_serial(&self, _port: &str) -> AppResult<Box<dyn Transport>> {
        Err(LabError::FeatureNotEnabled("instrument_serial".to_string()))
    }
}

#[async_trait]
impl Connector for DefaultConnector {
    async fn open(&self, params: &ConnectionParams) -> AppResult<Box<dyn Transport>> {
        debug!(params = ?params, "Opening transport");
        match params {
            ConnectionParams::Network { host } => match self.settings.network.backend {
                NetworkBackend::Socket => {
                    let transport = TcpTransport::connect(
                        host,
                        self.settings.network.port,
                        self.settings.timeouts.connect_timeout(),
                    )
                    .await?;
                    Ok(Box::new(transport))
                }
                NetworkBackend::Visa => self.open_visa(params.visa_resource()).await,
            },
            ConnectionParams::Gpib { .. } | ConnectionParams::Usb { .. } => {
                self.open_visa(params.visa_resource()).await
            }
            ConnectionParams::Serial { port } => self.open_serial(port).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_exact_collects_fragments() {
        let mock = MockTransport::new();
        mock.push_reply(b"\x01\x02");
        mock.push_reply(b"\x03");
        let mut transport = mock.clone();

        let data = read_exact(&mut transport, 3, Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(data, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_read_exact_times_out_on_short_reply() {
        let mock = MockTransport::new();
        mock.push_reply(b"\x01");
        let mut transport = mock.clone();

        let err = read_exact(&mut transport, 2, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, LabError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_read_until_stops_at_delimiter() {
        let mock = MockTransport::new();
        mock.push_reply(b"1.25");
        mock.push_reply(b"0\n");
        let mut transport = mock.clone();
        let mut buffer = BytesMut::new();

        let line = read_until(&mut transport, &mut buffer, b'\n', 64, Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(line, b"1.250\n".to_vec());
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn test_read_until_keeps_bytes_after_delimiter() {
        let mock = MockTransport::new();
        mock.push_reply(b"+1.0\n+2.0\n+3");
        let mut transport = mock.clone();
        let mut buffer = BytesMut::new();
        let timeout = Duration::from_millis(20);

        let first = read_until(&mut transport, &mut buffer, b'\n', 64, timeout)
            .await
            .unwrap();
        assert_eq!(first, b"+1.0\n".to_vec());
        assert_eq!(&buffer[..], b"+2.0\n+3");

        let second = read_until(&mut transport, &mut buffer, b'\n', 64, timeout)
            .await
            .unwrap();
        assert_eq!(second, b"+2.0\n".to_vec());
        assert_eq!(mock.read_count(), 1);

        let err = read_until(&mut transport, &mut buffer, b'\n', 64, timeout)
            .await
            .unwrap_err();
        assert!(matches!(err, LabError::Timeout { .. }));
        assert_eq!(&buffer[..], b"+3");
    }

    #[tokio::test]
    async fn test_read_until_rejects_runaway_reply() {
        let mock = MockTransport::new();
        mock.push_reply(b"0123456789");
        let mut transport = mock.clone();
        let mut buffer = BytesMut::new();

        let err = read_until(&mut transport, &mut buffer, b'\n', 4, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, LabError::Protocol(_)));
        assert!(buffer.is_empty());
    }

    #[cfg(not(feature = "instrument_visa"))]
    #[tokio::test]
    async fn test_gpib_without_visa_feature() {
        let connector = DefaultConnector::new(Settings::default());
        let params = resolve("GPIB:2").unwrap();
        let err = connector.open(&params).await.err().unwrap();
        assert!(matches!(err, LabError::FeatureNotEnabled(_)));
    }
}
