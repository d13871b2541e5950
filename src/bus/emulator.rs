//! In-process USB-to-I2C bridge
//!
//! [`BridgeEmulator`] is a [`Transport`] that decodes bridge frames and serves
//! them from a byte-addressed register file belonging to a single slave, the
//! way a typical I2C peripheral behaves: writes set the register pointer from
//! the leading address bytes, then store data with auto-increment; reads
//! return data from the pointer with auto-increment.
//!
//! Every electrical bus cycle is recorded as a [`BusCycle`], and every frame
//! as one transport round trip, so tests can compare the traffic of different
//! access paths. [`BridgeEmulator::stall`] makes the bridge swallow frames
//! without answering; [`BridgeEmulator::hold_replies`] executes them but
//! delays the answers, like a bridge that replies after the host gave up.

use super::frame::{Request, Status};
use super::SlaveAddress;
use crate::error::{AppResult, LabError};
use crate::transport::Transport;
use async_trait::async_trait;
use bytes::BytesMut;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::warn;

/// Status byte the emulated bridge sends for frames it cannot parse.
pub const STATUS_FRAME_ERROR: u8 = 0xEE;

/// One electrical transaction on the emulated bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusCycle {
    /// SLA+W acknowledged, followed by `bytes`.
    Write {
        /// 7-bit slave address
        slave: u8,
        /// Bytes written after the address byte
        bytes: Vec<u8>,
    },
    /// SLA+R acknowledged, `bytes` clocked out of the slave.
    Read {
        /// 7-bit slave address
        slave: u8,
        /// Bytes read
        bytes: Vec<u8>,
    },
    /// Nobody acknowledged `slave`.
    Nack {
        /// 7-bit slave address
        slave: u8,
    },
}

#[derive(Debug)]
struct EmulatorState {
    slave: SlaveAddress,
    present: bool,
    address_width: usize,
    address_big_endian: bool,
    registers: BTreeMap<u32, u8>,
    pointer: u32,
    frequency_hz: u32,
    inbox: BytesMut,
    outbox: VecDeque<u8>,
    held: Vec<u8>,
    holding: bool,
    cycles: Vec<BusCycle>,
    round_trips: usize,
    stalled: bool,
    closed: bool,
}

impl EmulatorState {
    fn address_mask(&self) -> u32 {
        match self.address_width {
            1 => 0xFF,
            _ => 0xFFFF,
        }
    }

    fn decode_address(&self, bytes: &[u8]) -> u32 {
        let fold = |acc: u32, b: &u8| (acc << 8) | u32::from(*b);
        if self.address_big_endian {
            bytes.iter().fold(0, fold)
        } else {
            bytes.iter().rev().fold(0, fold)
        }
    }

    fn acknowledges(&mut self, slave: SlaveAddress) -> bool {
        if self.present && slave == self.slave {
            true
        } else {
            self.cycles.push(BusCycle::Nack {
                slave: slave.value(),
            });
            false
        }
    }

    /// Bus write cycle: leading address bytes set the pointer.
    fn bus_write(&mut self, slave: SlaveAddress, bytes: &[u8]) -> Status {
        if !self.acknowledges(slave) {
            return Status::Nack;
        }
        self.cycles.push(BusCycle::Write {
            slave: slave.value(),
            bytes: bytes.to_vec(),
        });

        if bytes.len() >= self.address_width {
            let (address, data) = bytes.split_at(self.address_width);
            self.pointer = self.decode_address(address) & self.address_mask();
            for &byte in data {
                self.registers.insert(self.pointer, byte);
                self.pointer = self.pointer.wrapping_add(1) & self.address_mask();
            }
        }
        Status::Ack
    }

    /// Bus read cycle from the current pointer.
    fn bus_read(&mut self, slave: SlaveAddress, length: usize) -> Option<Vec<u8>> {
        if !self.acknowledges(slave) {
            return None;
        }
        let mut data = Vec::with_capacity(length);
        for _ in 0..length {
            data.push(self.registers.get(&self.pointer).copied().unwrap_or(0));
            self.pointer = self.pointer.wrapping_add(1) & self.address_mask();
        }
        self.cycles.push(BusCycle::Read {
            slave: slave.value(),
            bytes: data.clone(),
        });
        Some(data)
    }

    fn reply(&mut self, status: Status, data: Option<Vec<u8>>) {
        let mut bytes = vec![status.to_byte()];
        bytes.extend(data.unwrap_or_default());
        if self.holding {
            self.held.extend(bytes);
        } else {
            self.outbox.extend(bytes);
        }
    }

    fn handle(&mut self, request: Request) {
        match request {
            Request::Select { slave, address } | Request::Write {
                slave,
                payload: address,
            } => {
                let status = self.bus_write(slave, &address);
                self.reply(status, None);
            }
            Request::WriteReg {
                slave,
                mut address,
                data,
            } => {
                address.extend_from_slice(&data);
                let status = self.bus_write(slave, &address);
                self.reply(status, None);
            }
            Request::Read { slave, length } => match self.bus_read(slave, length) {
                Some(data) => self.reply(Status::Ack, Some(data)),
                None => self.reply(Status::Nack, None),
            },
            Request::ReadReg {
                slave,
                address,
                length,
            } => {
                // Address phase, repeated START, data phase.
                if self.bus_write(slave, &address) == Status::Nack {
                    self.reply(Status::Nack, None);
                    return;
                }
                match self.bus_read(slave, length) {
                    Some(data) => self.reply(Status::Ack, Some(data)),
                    None => self.reply(Status::Nack, None),
                }
            }
            Request::SetFrequency { hz } => {
                let status = if hz == 0 || hz > 3_400_000 {
                    Status::Nack
                } else {
                    self.frequency_hz = hz;
                    Status::Ack
                };
                self.reply(status, None);
            }
        }
    }
}

/// Emulated bridge with one attached slave.
#[derive(Debug, Clone)]
pub struct BridgeEmulator {
    state: Arc<Mutex<EmulatorState>>,
}

impl BridgeEmulator {
    /// Bridge with `slave` attached, one-byte little-endian register addresses.
    pub fn new(slave: SlaveAddress) -> Self {
        Self {
            state: Arc::new(Mutex::new(EmulatorState {
                slave,
                present: true,
                address_width: 1,
                address_big_endian: false,
                registers: BTreeMap::new(),
                pointer: 0,
                frequency_hz: 100_000,
                inbox: BytesMut::new(),
                outbox: VecDeque::new(),
                held: Vec::new(),
                holding: false,
                cycles: Vec::new(),
                round_trips: 0,
                stalled: false,
                closed: false,
            })),
        }
    }

    /// Set how the slave interprets register address bytes.
    pub fn with_address_format(self, width: usize, big_endian: bool) -> Self {
        {
            let mut state = self.state();
            state.address_width = width.clamp(1, 2);
            state.address_big_endian = big_endian;
        }
        self
    }

    fn state(&self) -> MutexGuard<'_, EmulatorState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Store one register byte directly, bypassing the bus.
    pub fn set_register(&self, address: u32, value: u8) {
        self.state().registers.insert(address, value);
    }

    /// Store consecutive register bytes starting at `address`.
    pub fn load(&self, address: u32, bytes: &[u8]) {
        let mut state = self.state();
        for (offset, &byte) in bytes.iter().enumerate() {
            state.registers.insert(address.wrapping_add(offset as u32), byte);
        }
    }

    /// Current content of one register byte (0 if never written).
    pub fn register(&self, address: u32) -> u8 {
        self.state().registers.get(&address).copied().unwrap_or(0)
    }

    /// Snapshot of the whole register file.
    pub fn registers(&self) -> BTreeMap<u32, u8> {
        self.state().registers.clone()
    }

    /// Bus cycles since creation or the last [`clear_log`](Self::clear_log).
    pub fn cycles(&self) -> Vec<BusCycle> {
        self.state().cycles.clone()
    }

    /// Frames received since creation or the last [`clear_log`](Self::clear_log).
    pub fn round_trips(&self) -> usize {
        self.state().round_trips
    }

    /// Forget recorded cycles and round trips.
    pub fn clear_log(&self) {
        let mut state = self.state();
        state.cycles.clear();
        state.round_trips = 0;
    }

    /// While stalled the bridge consumes frames without replying.
    pub fn stall(&self, stalled: bool) {
        self.state().stalled = stalled;
    }

    /// While holding, frames are executed but their replies are kept back.
    /// Turning holding off releases every kept reply at once.
    pub fn hold_replies(&self, holding: bool) {
        let mut state = self.state();
        state.holding = holding;
        if !holding {
            let held = std::mem::take(&mut state.held);
            state.outbox.extend(held);
        }
    }

    /// Detach or re-attach the slave. A detached slave never acknowledges.
    pub fn set_present(&self, present: bool) {
        self.state().present = present;
    }

    /// Last frequency accepted by the bridge.
    pub fn frequency_hz(&self) -> u32 {
        self.state().frequency_hz
    }
}

#[async_trait]
impl Transport for BridgeEmulator {
    async fn write_bytes(&mut self, bytes: &[u8]) -> AppResult<()> {
        let mut state = self.state();
        if state.closed {
            return Err(LabError::NotConnected("bridge emulator".to_string()));
        }
        state.inbox.extend_from_slice(bytes);

        loop {
            match Request::decode(&mut state.inbox) {
                Ok(Some(request)) => {
                    state.round_trips += 1;
                    if !state.stalled {
                        state.handle(request);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Emulated bridge dropped a malformed frame");
                    state.inbox.clear();
                    state.round_trips += 1;
                    if !state.stalled {
                        state.outbox.push_back(STATUS_FRAME_ERROR);
                    }
                    break;
                }
            }
        }
        Ok(())
    }

    async fn read_bytes(&mut self, max_len: usize, timeout: Duration) -> AppResult<Vec<u8>> {
        let ready = {
            let mut state = self.state();
            if state.closed {
                return Err(LabError::NotConnected("bridge emulator".to_string()));
            }
            let n = state.outbox.len().min(max_len.max(1));
            state.outbox.drain(..n).collect::<Vec<u8>>()
        };

        if ready.is_empty() {
            tokio::time::sleep(timeout).await;
            return Err(LabError::timeout("reading from bridge emulator", timeout));
        }
        Ok(ready)
    }

    async fn close(&mut self) -> AppResult<()> {
        self.state().closed = true;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("bridge emulator (slave {})", self.state().slave)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sla() -> SlaveAddress {
        SlaveAddress::from_8bit(0x5C)
    }

    async fn roundtrip(emu: &mut BridgeEmulator, request: Request) -> Vec<u8> {
        emu.write_bytes(&request.encode().unwrap()).await.unwrap();
        emu.read_bytes(64, Duration::from_millis(5)).await.unwrap()
    }

    #[tokio::test]
    async fn test_write_then_read_with_pointer() {
        let mut emu = BridgeEmulator::new(sla());
        let reply = roundtrip(
            &mut emu,
            Request::Write {
                slave: sla(),
                payload: vec![0x10, 0xAB, 0xCD],
            },
        )
        .await;
        assert_eq!(reply, vec![0x01]);
        assert_eq!(emu.register(0x10), 0xAB);
        assert_eq!(emu.register(0x11), 0xCD);

        let reply = roundtrip(
            &mut emu,
            Request::ReadReg {
                slave: sla(),
                address: vec![0x10],
                length: 2,
            },
        )
        .await;
        assert_eq!(reply, vec![0x01, 0xAB, 0xCD]);
        assert_eq!(emu.round_trips(), 2);
    }

    #[tokio::test]
    async fn test_wrong_slave_is_nacked() {
        let mut emu = BridgeEmulator::new(sla());
        let other = SlaveAddress::from_8bit(0x98);
        let reply = roundtrip(
            &mut emu,
            Request::Write {
                slave: other,
                payload: vec![],
            },
        )
        .await;
        assert_eq!(reply, vec![0x00]);
        assert_eq!(emu.cycles(), vec![BusCycle::Nack { slave: 0x4C }]);
    }

    #[tokio::test]
    async fn test_stall_swallows_frames() {
        let mut emu = BridgeEmulator::new(sla());
        emu.stall(true);
        let frame = Request::Write {
            slave: sla(),
            payload: vec![0x00, 0x01],
        }
        .encode()
        .unwrap();
        emu.write_bytes(&frame).await.unwrap();
        let err = emu
            .read_bytes(1, Duration::from_millis(5))
            .await
            .unwrap_err();
        assert!(matches!(err, LabError::Timeout { .. }));
        assert_eq!(emu.register(0x00), 0);
        assert_eq!(emu.round_trips(), 1);
    }

    #[tokio::test]
    async fn test_held_replies_are_released_late() {
        let mut emu = BridgeEmulator::new(sla());
        emu.hold_replies(true);
        let frame = Request::Write {
            slave: sla(),
            payload: vec![0x02, 0x7F],
        }
        .encode()
        .unwrap();
        emu.write_bytes(&frame).await.unwrap();
        assert!(emu.read_bytes(4, Duration::from_millis(5)).await.is_err());
        assert_eq!(emu.register(0x02), 0x7F);

        emu.hold_replies(false);
        let reply = emu.read_bytes(4, Duration::from_millis(5)).await.unwrap();
        assert_eq!(reply, vec![0x01]);
    }

    #[tokio::test]
    async fn test_malformed_frame_gets_error_status() {
        let mut emu = BridgeEmulator::new(sla());
        emu.write_bytes(&[0x99]).await.unwrap();
        let reply = emu.read_bytes(4, Duration::from_millis(5)).await.unwrap();
        assert_eq!(reply, vec![STATUS_FRAME_ERROR]);
    }

    #[tokio::test]
    async fn test_frequency_limits() {
        let mut emu = BridgeEmulator::new(sla());
        let reply = roundtrip(&mut emu, Request::SetFrequency { hz: 400_000 }).await;
        assert_eq!(reply, vec![0x01]);
        assert_eq!(emu.frequency_hz(), 400_000);

        let reply = roundtrip(&mut emu, Request::SetFrequency { hz: 0 }).await;
        assert_eq!(reply, vec![0x00]);
        assert_eq!(emu.frequency_hz(), 400_000);
    }
}
