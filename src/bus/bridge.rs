//! USB-to-I2C bridge bus
//!
//! [`BridgeBus`] speaks the frame protocol in [`super::frame`] over any
//! [`Transport`], typically the bridge's virtual COM port. It owns the
//! transport, the current slave address and the register-address encoding.
//!
//! Round trips per operation:
//!
//! | operation     | frames                | round trips |
//! |---------------|-----------------------|-------------|
//! | `write`       | `WRITE`               | 1           |
//! | `write_fast`  | `WRITE_REG`           | 1           |
//! | `read`        | `SELECT`, `READ`      | 2           |
//! | `read_fast`   | `READ_REG`            | 1           |
//!
//! Both write frames produce the same bus cycle; the fast variant lets the
//! bridge assemble the address phase itself.
//!
//! After a [`LabError::BusTimeout`] or an unreadable status byte the bridge
//! may still answer the abandoned frame. The next frame first discards
//! whatever arrives within one bus timeout, so a late answer is never taken
//! for the reply to a newer frame.

use super::frame::{Request, Status, MAX_TRANSFER};
use super::{BusTransaction, RegisterAddress, SlaveAddress};
use crate::config::Settings;
use crate::error::{AppResult, LabError};
use crate::observer::{default_observer, IoEvent, SharedObserver};
use crate::transport::{read_exact, Transport};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default bus reply timeout.
pub const DEFAULT_BUS_TIMEOUT: Duration = Duration::from_secs(1);

/// I2C bus reached through a USB-to-I2C bridge.
pub struct BridgeBus<T> {
    transport: T,
    slave: SlaveAddress,
    address_width: usize,
    address_big_endian: bool,
    timeout: Duration,
    observer: SharedObserver,
    stale: bool,
}

impl<T: Transport> BridgeBus<T> {
    /// Bus addressing `slave`, with one-byte register addresses.
    pub fn new(transport: T, slave: SlaveAddress) -> Self {
        Self {
            transport,
            slave,
            address_width: 1,
            address_big_endian: false,
            timeout: DEFAULT_BUS_TIMEOUT,
            observer: default_observer(),
            stale: false,
        }
    }

    /// Bus configured from the `[bridge]` and `[timeouts]` sections.
    pub fn from_settings(transport: T, settings: &Settings) -> AppResult<Self> {
        let mut bus = Self::new(
            transport,
            SlaveAddress::from_8bit(settings.bridge.slave_address),
        )
        .with_timeout(settings.timeouts.bus_timeout());
        bus.configure_register(
            settings.bridge.address_big_endian,
            settings.bridge.address_width,
        )?;
        Ok(bus)
    }

    /// Bus configured from settings, with the bridge set to the configured
    /// `bridge.frequency_hz`.
    pub async fn open(transport: T, settings: &Settings) -> AppResult<Self> {
        let mut bus = Self::from_settings(transport, settings)?;
        bus.set_frequency(settings.bridge.frequency_hz).await?;
        Ok(bus)
    }

    /// Set the reply timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Send bus events to `observer`.
    pub fn with_observer(mut self, observer: SharedObserver) -> Self {
        self.observer = observer;
        self
    }

    /// Current slave address.
    pub fn slave(&self) -> SlaveAddress {
        self.slave
    }

    /// Address a different slave from now on.
    pub fn set_slave_address(&mut self, slave: SlaveAddress) {
        debug!(from = %self.slave, to = %slave, "Switching I2C slave");
        self.slave = slave;
    }

    /// Set the register-address encoding: `width` bytes (1 or 2), most
    /// significant byte first when `big_endian`.
    pub fn configure_register(&mut self, big_endian: bool, width: usize) -> AppResult<()> {
        if !(1..=2).contains(&width) {
            return Err(LabError::Configuration(format!(
                "register address width must be 1 or 2 bytes, got {}",
                width
            )));
        }
        self.address_width = width;
        self.address_big_endian = big_endian;
        Ok(())
    }

    /// Register address width in bytes.
    pub fn address_width(&self) -> usize {
        self.address_width
    }

    /// Change the SCL frequency.
    pub async fn set_frequency(&mut self, hz: u32) -> AppResult<()> {
        match self.exchange(&Request::SetFrequency { hz }).await? {
            (Status::Ack, _) => {
                info!(hz, "I2C frequency set");
                Ok(())
            }
            (Status::Nack, _) => Err(LabError::Protocol(format!(
                "bridge rejected bus frequency {} Hz",
                hz
            ))),
        }
    }

    /// Read `length` bytes from the slave without selecting a register first.
    pub async fn read_raw(&mut self, length: usize) -> AppResult<Vec<u8>> {
        let request = Request::Read {
            slave: self.slave,
            length,
        };
        self.acked(&request, "raw read").await
    }

    /// Write `data` to the slave as-is, with no register address.
    pub async fn write_raw(&mut self, data: &[u8]) -> AppResult<()> {
        let request = Request::Write {
            slave: self.slave,
            payload: data.to_vec(),
        };
        self.acked(&request, "raw write").await.map(|_| ())
    }

    /// The underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Release the bus and return the transport.
    pub fn into_inner(self) -> T {
        self.transport
    }

    /// Close the underlying transport.
    pub async fn close(&mut self) -> AppResult<()> {
        self.transport.close().await
    }

    fn encode_address(&self, address: RegisterAddress) -> AppResult<Vec<u8>> {
        let limit = 1u64 << (8 * self.address_width);
        if u64::from(address) >= limit {
            return Err(LabError::AddressOutOfRange {
                address,
                width: self.address_width,
            });
        }
        let bytes = address.to_be_bytes();
        let mut encoded = bytes[bytes.len() - self.address_width..].to_vec();
        if !self.address_big_endian {
            encoded.reverse();
        }
        Ok(encoded)
    }

    fn bus_timeout(&mut self, err: LabError) -> LabError {
        match err {
            LabError::Timeout { .. } => {
                self.stale = true;
                LabError::BusTimeout(self.timeout)
            }
            other => other,
        }
    }

    /// Drop replies to frames that were given up on.
    async fn discard_stale_replies(&mut self) -> AppResult<()> {
        let mut dropped = 0;
        loop {
            match self.transport.read_bytes(MAX_TRANSFER + 1, self.timeout).await {
                Ok(bytes) => dropped += bytes.len(),
                Err(LabError::Timeout { .. }) => break,
                Err(e) => return Err(e),
            }
        }
        if dropped > 0 {
            warn!(slave = %self.slave, dropped, "Discarded late bridge reply");
        }
        self.stale = false;
        Ok(())
    }

    /// Send one frame and collect its status and data.
    async fn exchange(&mut self, request: &Request) -> AppResult<(Status, Vec<u8>)> {
        let frame = request.encode()?;
        if self.stale {
            self.discard_stale_replies().await?;
        }
        self.transport.write_bytes(&frame).await?;

        let status = read_exact(&mut self.transport, 1, self.timeout)
            .await
            .map_err(|e| self.bus_timeout(e))?;
        let status = match Status::from_byte(status[0]) {
            Ok(status) => status,
            Err(e) => {
                self.stale = true;
                return Err(e);
            }
        };

        let expected = request.reply_data_len();
        if status == Status::Nack || expected == 0 {
            return Ok((status, Vec::new()));
        }
        let data = read_exact(&mut self.transport, expected, self.timeout)
            .await
            .map_err(|e| self.bus_timeout(e))?;
        Ok((status, data))
    }

    /// Exchange a frame that must be acknowledged by the slave.
    async fn acked(&mut self, request: &Request, operation: &str) -> AppResult<Vec<u8>> {
        let result = match self.exchange(request).await {
            Ok((Status::Ack, data)) => Ok(data),
            Ok((Status::Nack, _)) => Err(LabError::BusNack {
                slave: self.slave.value(),
            }),
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            self.observer.on_event(&IoEvent::Failure {
                target: format!("i2c:{}", self.slave),
                operation: operation.to_string(),
                error: e.to_string(),
            });
        }
        result
    }

    fn report_write(&self, address: RegisterAddress, data: &[u8], fast: bool) {
        self.observer.on_event(&IoEvent::BusWrite {
            slave: self.slave.value(),
            address,
            data: data.to_vec(),
            fast,
        });
    }

    fn report_read(&self, address: RegisterAddress, data: &[u8], fast: bool) {
        self.observer.on_event(&IoEvent::BusRead {
            slave: self.slave.value(),
            address,
            data: data.to_vec(),
            fast,
        });
    }
}

#[async_trait]
impl<T: Transport> BusTransaction for BridgeBus<T> {
    async fn write(&mut self, address: RegisterAddress, data: &[u8]) -> AppResult<()> {
        let mut payload = self.encode_address(address)?;
        payload.extend_from_slice(data);
        let request = Request::Write {
            slave: self.slave,
            payload,
        };
        self.acked(&request, "register write").await?;
        self.report_write(address, data, false);
        Ok(())
    }

    async fn read(&mut self, address: RegisterAddress, length: usize) -> AppResult<Vec<u8>> {
        let select = Request::Select {
            slave: self.slave,
            address: self.encode_address(address)?,
        };
        self.acked(&select, "register select").await?;

        let read = Request::Read {
            slave: self.slave,
            length,
        };
        let data = self.acked(&read, "register read").await?;
        self.report_read(address, &data, false);
        Ok(data)
    }

    async fn write_fast(&mut self, address: RegisterAddress, data: &[u8]) -> AppResult<()> {
        let request = Request::WriteReg {
            slave: self.slave,
            address: self.encode_address(address)?,
            data: data.to_vec(),
        };
        self.acked(&request, "register write").await?;
        self.report_write(address, data, true);
        Ok(())
    }

    async fn read_fast(&mut self, address: RegisterAddress, length: usize) -> AppResult<Vec<u8>> {
        let request = Request::ReadReg {
            slave: self.slave,
            address: self.encode_address(address)?,
            length,
        };
        let data = self.acked(&request, "register read").await?;
        self.report_read(address, &data, true);
        Ok(data)
    }

    async fn probe(&mut self) -> AppResult<()> {
        self.write_raw(&[]).await
    }
}
