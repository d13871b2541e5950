//! I2C bus transactions
//!
//! [`BusTransaction`] is the byte-level primitive the register engine is built
//! on: one method per complete bus cycle, each of which either finishes or
//! reports why it did not. The `_fast` variants describe the same bus traffic
//! as their standard counterparts but ask the bridge to combine the address
//! and data phases into a single command, saving transport round trips.
//!
//! [`bridge::BridgeBus`] implements the trait for a USB-to-I2C bridge reached
//! through any [`Transport`](crate::transport::Transport);
//! [`emulator::BridgeEmulator`] is an in-process bridge used by tests and
//! dry runs.

pub mod bridge;
pub mod emulator;
pub mod frame;

pub use bridge::BridgeBus;
pub use emulator::{BridgeEmulator, BusCycle};

use crate::error::{AppResult, LabError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Address of one register on the target device.
pub type RegisterAddress = u32;

/// 7-bit I2C slave address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlaveAddress(u8);

impl SlaveAddress {
    /// Build from a 7-bit address.
    pub fn new(address: u8) -> AppResult<Self> {
        if address > 0x7F {
            return Err(LabError::Configuration(format!(
                "I2C slave address {:#04x} exceeds 7 bits",
                address
            )));
        }
        Ok(Self(address))
    }

    /// Build from the 8-bit write-address notation used by most datasheets
    /// (`0x5C` is 7-bit `0x2E`). The R/W bit is ignored.
    pub fn from_8bit(address: u8) -> Self {
        Self(address >> 1)
    }

    /// The 7-bit address.
    pub fn value(self) -> u8 {
        self.0
    }

    /// Address byte for a write cycle (R/W = 0).
    pub fn write_byte(self) -> u8 {
        self.0 << 1
    }

    /// Address byte for a read cycle (R/W = 1).
    pub fn read_byte(self) -> u8 {
        (self.0 << 1) | 0x01
    }
}

impl fmt::Display for SlaveAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}

/// Complete I2C bus cycles against one slave.
///
/// Every method bounds its wait by the bus timeout. A cycle interrupted by a
/// timeout is not rolled back: a write may or may not have reached the device.
#[async_trait]
pub trait BusTransaction: Send {
    /// START, SLA+W, register address, `data`, STOP.
    async fn write(&mut self, address: RegisterAddress, data: &[u8]) -> AppResult<()>;

    /// Select `address`, then read exactly `length` bytes.
    async fn read(&mut self, address: RegisterAddress, length: usize) -> AppResult<Vec<u8>>;

    /// Same bus cycle as [`write`](Self::write) in a single bridge command.
    async fn write_fast(&mut self, address: RegisterAddress, data: &[u8]) -> AppResult<()>;

    /// Same bus cycles as [`read`](Self::read) in a single bridge command.
    async fn read_fast(&mut self, address: RegisterAddress, length: usize) -> AppResult<Vec<u8>>;

    /// Address the slave with an empty write.
    ///
    /// `Ok` when it acknowledges, [`LabError::BusNack`] when nothing answers.
    async fn probe(&mut self) -> AppResult<()>;
}

#[async_trait]
impl<B: BusTransaction + ?Sized> BusTransaction for Box<B> {
    async fn write(&mut self, address: RegisterAddress, data: &[u8]) -> AppResult<()> {
        (**self).write(address, data).await
    }

    async fn read(&mut self, address: RegisterAddress, length: usize) -> AppResult<Vec<u8>> {
        (**self).read(address, length).await
    }

    async fn write_fast(&mut self, address: RegisterAddress, data: &[u8]) -> AppResult<()> {
        (**self).write_fast(address, data).await
    }

    async fn read_fast(&mut self, address: RegisterAddress, length: usize) -> AppResult<Vec<u8>> {
        (**self).read_fast(address, length).await
    }

    async fn probe(&mut self) -> AppResult<()> {
        (**self).probe().await
    }
}
