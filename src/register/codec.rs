//! Bit-field read-modify-write over a [`BusTransaction`]

use super::spec::{low_ones, RegisterSpec};
use crate::bus::{BusTransaction, RegisterAddress};
use crate::config::BridgeSettings;
use crate::error::{AppResult, LabError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

/// Byte order of multi-byte register data on the bus.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ByteOrder {
    /// Least significant byte at the register address
    #[default]
    Little,
    /// Most significant byte at the register address
    Big,
}

/// What [`RegisterCodec::write_field`] does with a value wider than its field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Fail with [`LabError::ValueOutOfRange`] before touching the bus.
    #[default]
    Reject,
    /// Write anyway; excess bits land in the neighboring bits above the field,
    /// truncated to the register width.
    Bleed,
}

/// Which bus primitives a register operation uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessPath {
    /// [`BusTransaction::read`] / [`BusTransaction::write`]
    #[default]
    Standard,
    /// [`BusTransaction::read_fast`] / [`BusTransaction::write_fast`]
    Fast,
}

impl AccessPath {
    /// `Fast` when `fast` is set.
    pub fn from_flag(fast: bool) -> Self {
        if fast {
            AccessPath::Fast
        } else {
            AccessPath::Standard
        }
    }
}

/// Reads and writes bit fields of fixed-width registers.
///
/// The codec holds no bus; every operation borrows one, so a single codec can
/// serve several buses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterCodec {
    width_bytes: usize,
    byte_order: ByteOrder,
    overflow: OverflowPolicy,
}

impl Default for RegisterCodec {
    fn default() -> Self {
        Self {
            width_bytes: 1,
            byte_order: ByteOrder::Little,
            overflow: OverflowPolicy::Reject,
        }
    }
}

impl RegisterCodec {
    /// Codec for registers `width_bytes` wide (1..=8).
    pub fn new(width_bytes: usize) -> AppResult<Self> {
        if !(1..=8).contains(&width_bytes) {
            return Err(LabError::Configuration(format!(
                "register width must be 1-8 bytes, got {}",
                width_bytes
            )));
        }
        Ok(Self {
            width_bytes,
            ..Self::default()
        })
    }

    /// Codec configured from the `[bridge]` section.
    pub fn from_settings(settings: &BridgeSettings) -> AppResult<Self> {
        Ok(Self::new(settings.data_width)?
            .with_byte_order(settings.data_byte_order)
            .with_overflow(settings.overflow))
    }

    /// Set the data byte order of multi-byte registers.
    pub fn with_byte_order(mut self, byte_order: ByteOrder) -> Self {
        self.byte_order = byte_order;
        self
    }

    /// Set how oversized field values are handled.
    pub fn with_overflow(mut self, overflow: OverflowPolicy) -> Self {
        self.overflow = overflow;
        self
    }

    /// Register width in bytes.
    pub fn width_bytes(&self) -> usize {
        self.width_bytes
    }

    /// Register width in bits.
    pub fn width_bits(&self) -> u32 {
        (self.width_bytes * 8) as u32
    }

    /// Policy for oversized field values.
    pub fn overflow(&self) -> OverflowPolicy {
        self.overflow
    }

    /// Parse a specifier against this codec's register width.
    pub fn parse_spec(&self, text: &str) -> AppResult<RegisterSpec> {
        RegisterSpec::parse_with_width(text, self.width_bits())
    }

    fn check_spec(&self, spec: &RegisterSpec) -> AppResult<()> {
        if spec.range.fits(self.width_bits()) {
            Ok(())
        } else {
            Err(LabError::InvalidRegisterSpec {
                spec: spec.to_string(),
                reason: format!("bit range is outside a {}-bit register", self.width_bits()),
            })
        }
    }

    /// Bus bytes for a register word.
    pub fn encode_word(&self, value: u64) -> Vec<u8> {
        let bytes = value.to_le_bytes();
        let mut word = bytes[..self.width_bytes].to_vec();
        if self.byte_order == ByteOrder::Big {
            word.reverse();
        }
        word
    }

    /// Register word from bus bytes.
    pub fn decode_word(&self, bytes: &[u8]) -> AppResult<u64> {
        if bytes.len() != self.width_bytes {
            return Err(LabError::Protocol(format!(
                "expected {} register byte(s), got {}",
                self.width_bytes,
                bytes.len()
            )));
        }
        let fold = |acc: u64, b: &u8| (acc << 8) | u64::from(*b);
        Ok(match self.byte_order {
            ByteOrder::Big => bytes.iter().fold(0, fold),
            ByteOrder::Little => bytes.iter().rev().fold(0, fold),
        })
    }

    /// Read a whole register.
    pub async fn read_register<B>(
        &self,
        bus: &mut B,
        address: RegisterAddress,
        path: AccessPath,
    ) -> AppResult<u64>
    where
        B: BusTransaction + ?Sized,
    {
        let bytes = match path {
            AccessPath::Standard => bus.read(address, self.width_bytes).await?,
            AccessPath::Fast => bus.read_fast(address, self.width_bytes).await?,
        };
        self.decode_word(&bytes)
    }

    /// Write a whole register.
    pub async fn write_register<B>(
        &self,
        bus: &mut B,
        address: RegisterAddress,
        value: u64,
        path: AccessPath,
    ) -> AppResult<()>
    where
        B: BusTransaction + ?Sized,
    {
        if value > low_ones(self.width_bits()) {
            return Err(LabError::ValueOutOfRange {
                value,
                bits: self.width_bits(),
            });
        }
        let word = self.encode_word(value);
        match path {
            AccessPath::Standard => bus.write(address, &word).await,
            AccessPath::Fast => bus.write_fast(address, &word).await,
        }
    }

    /// Extract the field named by `spec`.
    pub async fn read_field<B>(
        &self,
        bus: &mut B,
        spec: &RegisterSpec,
        path: AccessPath,
    ) -> AppResult<u64>
    where
        B: BusTransaction + ?Sized,
    {
        self.check_spec(spec)?;
        let raw = self.read_register(bus, spec.address, path).await?;
        let value = (raw & spec.range.field_mask(self.width_bits())) >> spec.range.low();
        debug!(spec = %spec, raw, value, "Field read");
        Ok(value)
    }

    /// Replace the field named by `spec` with `value`, keeping every other bit.
    ///
    /// This is a read, a local merge, and a write. It is not atomic: another
    /// bus master changing the register in between is overwritten. If the
    /// write times out, the device may or may not hold the new value.
    pub async fn write_field<B>(
        &self,
        bus: &mut B,
        spec: &RegisterSpec,
        value: u64,
        path: AccessPath,
    ) -> AppResult<()>
    where
        B: BusTransaction + ?Sized,
    {
        self.check_spec(spec)?;
        let range = spec.range;
        if self.overflow == OverflowPolicy::Reject && value > range.max_value() {
            return Err(LabError::ValueOutOfRange {
                value,
                bits: range.bits(),
            });
        }

        let width_bits = self.width_bits();
        let old = self.read_register(bus, spec.address, path).await?;
        let shifted = value.checked_shl(range.low()).unwrap_or(0);
        let new = ((old & range.preserve_mask(width_bits)) | shifted) & low_ones(width_bits);
        debug!(spec = %spec, old, new, "Field write");
        self.write_register(bus, spec.address, new, path).await
    }
}

/// A bus shared between tasks.
///
/// Field operations hold the lock for the whole read-modify-write, so two
/// tasks updating different fields of one register cannot lose each other's
/// changes.
pub struct SharedBus<B> {
    inner: Arc<Mutex<B>>,
    lock_timeout: Option<Duration>,
}

impl<B> Clone for SharedBus<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            lock_timeout: self.lock_timeout,
        }
    }
}

impl<B: BusTransaction> SharedBus<B> {
    /// Share `bus` between tasks.
    pub fn new(bus: B) -> Self {
        Self {
            inner: Arc::new(Mutex::new(bus)),
            lock_timeout: None,
        }
    }

    /// Give up with [`LabError::Timeout`] if the bus stays busy this long.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    /// Exclusive access for a custom sequence of bus operations.
    pub async fn lock(&self) -> AppResult<MutexGuard<'_, B>> {
        match self.lock_timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.inner.lock())
                .await
                .map_err(|_| LabError::timeout("waiting for shared bus", timeout)),
            None => Ok(self.inner.lock().await),
        }
    }

    /// [`RegisterCodec::read_field`] under the bus lock.
    pub async fn read_field(
        &self,
        codec: &RegisterCodec,
        spec: &RegisterSpec,
        path: AccessPath,
    ) -> AppResult<u64> {
        let mut bus = self.lock().await?;
        codec.read_field(&mut *bus, spec, path).await
    }

    /// [`RegisterCodec::write_field`] with the lock held across the read-modify-write.
    pub async fn write_field(
        &self,
        codec: &RegisterCodec,
        spec: &RegisterSpec,
        value: u64,
        path: AccessPath,
    ) -> AppResult<()> {
        let mut bus = self.lock().await?;
        codec.write_field(&mut *bus, spec, value, path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BridgeBus, BridgeEmulator, SlaveAddress};

    fn setup() -> (BridgeEmulator, BridgeBus<BridgeEmulator>) {
        let sla = SlaveAddress::from_8bit(0x5C);
        let emu = BridgeEmulator::new(sla);
        let bus = BridgeBus::new(emu.clone(), sla).with_timeout(Duration::from_millis(20));
        (emu, bus)
    }

    #[tokio::test]
    async fn test_write_field_preserves_neighbors() {
        let (emu, mut bus) = setup();
        emu.set_register(0x10, 0b1010_0101);
        let codec = RegisterCodec::default();
        let spec = codec.parse_spec("0x10[4:3]").unwrap();

        codec
            .write_field(&mut bus, &spec, 0b11, AccessPath::Standard)
            .await
            .unwrap();
        assert_eq!(emu.register(0x10), 0b1011_1101);
        assert_eq!(
            codec
                .read_field(&mut bus, &spec, AccessPath::Fast)
                .await
                .unwrap(),
            0b11
        );
    }

    #[tokio::test]
    async fn test_reject_oversized_value_before_bus_access() {
        let (emu, mut bus) = setup();
        let codec = RegisterCodec::default();
        let spec = codec.parse_spec("0x10[1:0]").unwrap();

        let err = codec
            .write_field(&mut bus, &spec, 4, AccessPath::Standard)
            .await
            .unwrap_err();
        assert!(matches!(err, LabError::ValueOutOfRange { value: 4, bits: 2 }));
        assert_eq!(emu.round_trips(), 0);
    }

    #[tokio::test]
    async fn test_bleed_spills_into_upper_neighbors() {
        let (emu, mut bus) = setup();
        emu.set_register(0x10, 0x00);
        let codec = RegisterCodec::default().with_overflow(OverflowPolicy::Bleed);
        let spec = codec.parse_spec("0x10[7:6]").unwrap();

        // 0b111 << 6 leaves only the two field bits inside 8 bits.
        codec
            .write_field(&mut bus, &spec, 0b111, AccessPath::Standard)
            .await
            .unwrap();
        assert_eq!(emu.register(0x10), 0b1100_0000);

        let spec = codec.parse_spec("0x10[1:0]").unwrap();
        codec
            .write_field(&mut bus, &spec, 0b111, AccessPath::Standard)
            .await
            .unwrap();
        assert_eq!(emu.register(0x10), 0b1100_0111);
    }

    #[tokio::test]
    async fn test_multi_byte_register_byte_orders() {
        let (emu, mut bus) = setup();
        let little = RegisterCodec::new(2).unwrap();
        little
            .write_register(&mut bus, 0x20, 0x1234, AccessPath::Fast)
            .await
            .unwrap();
        assert_eq!((emu.register(0x20), emu.register(0x21)), (0x34, 0x12));

        let big = RegisterCodec::new(2)
            .unwrap()
            .with_byte_order(ByteOrder::Big);
        assert_eq!(
            big.read_register(&mut bus, 0x20, AccessPath::Standard)
                .await
                .unwrap(),
            0x3412
        );

        let spec = big.parse_spec("0x20[15:8]").unwrap();
        big.write_field(&mut bus, &spec, 0xAB, AccessPath::Standard)
            .await
            .unwrap();
        assert_eq!((emu.register(0x20), emu.register(0x21)), (0xAB, 0x12));
    }

    #[tokio::test]
    async fn test_spec_wider_than_codec_rejected() {
        let (_emu, mut bus) = setup();
        let codec = RegisterCodec::default();
        let spec = RegisterSpec::parse_with_width("0x10[15:8]", 16).unwrap();
        let err = codec
            .read_field(&mut bus, &spec, AccessPath::Standard)
            .await
            .unwrap_err();
        assert!(matches!(err, LabError::InvalidRegisterSpec { .. }));
    }

    #[test]
    fn test_word_encoding() {
        let codec = RegisterCodec::new(3).unwrap();
        assert_eq!(codec.encode_word(0x0A0B0C), vec![0x0C, 0x0B, 0x0A]);
        assert_eq!(codec.decode_word(&[0x0C, 0x0B, 0x0A]).unwrap(), 0x0A0B0C);
        assert!(codec.decode_word(&[0x01]).is_err());
        assert!(RegisterCodec::new(9).is_err());
    }

    #[tokio::test]
    async fn test_shared_bus_serializes_field_updates() {
        let (emu, bus) = setup();
        let shared = SharedBus::new(bus);
        let codec = RegisterCodec::default();

        let mut handles = Vec::new();
        for bit in 0..8u32 {
            let shared = shared.clone();
            let spec = RegisterSpec::parse(&format!("0x30[{}:{}]", bit, bit)).unwrap();
            handles.push(tokio::spawn(async move {
                shared
                    .write_field(&codec, &spec, 1, AccessPath::Fast)
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(emu.register(0x30), 0xFF);
    }
}
