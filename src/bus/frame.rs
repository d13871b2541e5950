//! Bridge command frames
//!
//! The USB-to-I2C bridge is driven by short binary frames. Every frame starts
//! with an opcode; counts are single bytes, so no single transfer carries more
//! than 255 data bytes.
//!
//! ```text
//! SELECT    0x53  sla_w  n   addr[n]                  -> status
//! READ      0x54  sla_r  n                            -> status [data[n]]
//! WRITE     0x55  sla_w  n   payload[n]               -> status
//! WRITE_REG 0x56  sla_w  na  addr[na]  nd  data[nd]   -> status
//! READ_REG  0x57  sla_w  na  addr[na]  nd             -> status [data[nd]]
//! SET_FREQ  0x5A  hz (u32, big endian)                -> status
//! ```
//!
//! `SELECT` addresses a register without a STOP condition, so the `READ` that
//! follows is issued after a repeated START. `WRITE_REG` and `READ_REG` tell
//! the bridge to do the same address and data phases on its own.
//!
//! The status byte is `0x01` (ACK) or `0x00` (NACK). Data bytes follow only an
//! ACK. Any other status byte is a protocol violation.

use super::SlaveAddress;
use crate::error::{AppResult, LabError};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Status byte: slave acknowledged.
pub const STATUS_ACK: u8 = 0x01;
/// Status byte: slave did not acknowledge.
pub const STATUS_NACK: u8 = 0x00;

/// Largest count a single frame can carry.
pub const MAX_TRANSFER: usize = u8::MAX as usize;

/// Frame opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Address a register, no STOP
    Select = 0x53,
    /// Read after a repeated START
    Read = 0x54,
    /// Plain write cycle
    Write = 0x55,
    /// Address and data in one frame
    WriteReg = 0x56,
    /// Address, repeated START and read in one frame
    ReadReg = 0x57,
    /// Change SCL frequency
    SetFrequency = 0x5A,
}

impl TryFrom<u8> for Opcode {
    type Error = LabError;

    fn try_from(value: u8) -> AppResult<Self> {
        match value {
            0x53 => Ok(Opcode::Select),
            0x54 => Ok(Opcode::Read),
            0x55 => Ok(Opcode::Write),
            0x56 => Ok(Opcode::WriteReg),
            0x57 => Ok(Opcode::ReadReg),
            0x5A => Ok(Opcode::SetFrequency),
            other => Err(LabError::Protocol(format!(
                "unknown bridge opcode {:#04x}",
                other
            ))),
        }
    }
}

/// Outcome reported in a status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Slave acknowledged
    Ack,
    /// Nobody acknowledged
    Nack,
}

impl Status {
    /// Decode a status byte.
    pub fn from_byte(byte: u8) -> AppResult<Self> {
        match byte {
            STATUS_ACK => Ok(Status::Ack),
            STATUS_NACK => Ok(Status::Nack),
            other => Err(LabError::Protocol(format!(
                "unexpected bridge status byte {:#04x}",
                other
            ))),
        }
    }

    /// Encode as a status byte.
    pub fn to_byte(self) -> u8 {
        match self {
            Status::Ack => STATUS_ACK,
            Status::Nack => STATUS_NACK,
        }
    }
}

/// One host-to-bridge command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// `SELECT`: write the register address without a STOP.
    Select {
        /// Target slave
        slave: SlaveAddress,
        /// Encoded register address
        address: Vec<u8>,
    },
    /// `READ`: clock `length` bytes out of the slave.
    Read {
        /// Target slave
        slave: SlaveAddress,
        /// Bytes to read
        length: usize,
    },
    /// `WRITE`: one write cycle carrying `payload` as-is.
    Write {
        /// Target slave
        slave: SlaveAddress,
        /// Bytes after SLA+W
        payload: Vec<u8>,
    },
    /// `WRITE_REG`: address and data phases in one frame.
    WriteReg {
        /// Target slave
        slave: SlaveAddress,
        /// Encoded register address
        address: Vec<u8>,
        /// Register data
        data: Vec<u8>,
    },
    /// `READ_REG`: address phase, repeated START and read in one frame.
    ReadReg {
        /// Target slave
        slave: SlaveAddress,
        /// Encoded register address
        address: Vec<u8>,
        /// Bytes to read
        length: usize,
    },
    /// `SET_FREQ`: change the SCL frequency.
    SetFrequency {
        /// Frequency in Hz
        hz: u32,
    },
}

fn count(len: usize, what: &str) -> AppResult<u8> {
    u8::try_from(len).map_err(|_| {
        LabError::Protocol(format!(
            "{} of {} bytes exceeds the {}-byte frame limit",
            what, len, MAX_TRANSFER
        ))
    })
}

/// Read the address byte and check its R/W bit against the opcode.
fn take_slave(frame: &mut BytesMut, opcode: Opcode) -> AppResult<SlaveAddress> {
    let sla = frame.get_u8();
    let is_read = sla & 0x01 == 0x01;
    if is_read != (opcode == Opcode::Read) {
        return Err(LabError::Protocol(format!(
            "{:?} frame carries address byte {:#04x} with the wrong R/W bit",
            opcode, sla
        )));
    }
    Ok(SlaveAddress::from_8bit(sla))
}

impl Request {
    /// Opcode of this request.
    pub fn opcode(&self) -> Opcode {
        match self {
            Request::Select { .. } => Opcode::Select,
            Request::Read { .. } => Opcode::Read,
            Request::Write { .. } => Opcode::Write,
            Request::WriteReg { .. } => Opcode::WriteReg,
            Request::ReadReg { .. } => Opcode::ReadReg,
            Request::SetFrequency { .. } => Opcode::SetFrequency,
        }
    }

    /// Data bytes that follow an ACK in the reply.
    pub fn reply_data_len(&self) -> usize {
        match self {
            Request::Read { length, .. } | Request::ReadReg { length, .. } => *length,
            _ => 0,
        }
    }

    /// Serialize the frame.
    pub fn encode(&self) -> AppResult<Bytes> {
        let mut buf = BytesMut::with_capacity(8);
        buf.put_u8(self.opcode() as u8);

        match self {
            Request::Select { slave, address } => {
                buf.put_u8(slave.write_byte());
                buf.put_u8(count(address.len(), "register address")?);
                buf.put_slice(address);
            }
            Request::Read { slave, length } => {
                buf.put_u8(slave.read_byte());
                buf.put_u8(count(*length, "read")?);
            }
            Request::Write { slave, payload } => {
                buf.put_u8(slave.write_byte());
                buf.put_u8(count(payload.len(), "write")?);
                buf.put_slice(payload);
            }
            Request::WriteReg {
                slave,
                address,
                data,
            } => {
                buf.put_u8(slave.write_byte());
                buf.put_u8(count(address.len(), "register address")?);
                buf.put_slice(address);
                buf.put_u8(count(data.len(), "write")?);
                buf.put_slice(data);
            }
            Request::ReadReg {
                slave,
                address,
                length,
            } => {
                buf.put_u8(slave.write_byte());
                buf.put_u8(count(address.len(), "register address")?);
                buf.put_slice(address);
                buf.put_u8(count(*length, "read")?);
            }
            Request::SetFrequency { hz } => buf.put_u32(*hz),
        }

        Ok(buf.freeze())
    }

    /// Decode one frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` and leaves `buf` untouched until a complete frame is
    /// available; consumes exactly one frame otherwise.
    pub fn decode(buf: &mut BytesMut) -> AppResult<Option<Request>> {
        let Some(&first) = buf.first() else {
            return Ok(None);
        };
        let opcode = Opcode::try_from(first)?;

        // Total frame length, or None while the header is still incomplete.
        let total = match opcode {
            Opcode::SetFrequency => Some(5),
            Opcode::Read => Some(3),
            Opcode::Select | Opcode::Write => buf.get(2).map(|&n| 3 + n as usize),
            Opcode::WriteReg => buf.get(2).and_then(|&na| {
                buf.get(3 + na as usize)
                    .map(|&nd| 4 + na as usize + nd as usize)
            }),
            Opcode::ReadReg => buf.get(2).map(|&na| 4 + na as usize),
        };
        let Some(total) = total else {
            return Ok(None);
        };
        if buf.len() < total {
            return Ok(None);
        }

        let mut frame = buf.split_to(total);
        frame.advance(1);

        let request = match opcode {
            Opcode::SetFrequency => Request::SetFrequency {
                hz: frame.get_u32(),
            },
            Opcode::Select => {
                let slave = take_slave(&mut frame, opcode)?;
                let n = frame.get_u8() as usize;
                Request::Select {
                    slave,
                    address: frame.split_to(n).to_vec(),
                }
            }
            Opcode::Read => Request::Read {
                slave: take_slave(&mut frame, opcode)?,
                length: frame.get_u8() as usize,
            },
            Opcode::Write => {
                let slave = take_slave(&mut frame, opcode)?;
                let n = frame.get_u8() as usize;
                Request::Write {
                    slave,
                    payload: frame.split_to(n).to_vec(),
                }
            }
            Opcode::WriteReg => {
                let slave = take_slave(&mut frame, opcode)?;
                let na = frame.get_u8() as usize;
                let address = frame.split_to(na).to_vec();
                let nd = frame.get_u8() as usize;
                Request::WriteReg {
                    slave,
                    address,
                    data: frame.split_to(nd).to_vec(),
                }
            }
            Opcode::ReadReg => {
                let slave = take_slave(&mut frame, opcode)?;
                let na = frame.get_u8() as usize;
                let address = frame.split_to(na).to_vec();
                Request::ReadReg {
                    slave,
                    address,
                    length: frame.get_u8() as usize,
                }
            }
        };
        Ok(Some(request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sla() -> SlaveAddress {
        SlaveAddress::from_8bit(0x5C)
    }

    #[test]
    fn test_write_reg_layout() {
        let frame = Request::WriteReg {
            slave: sla(),
            address: vec![0x10],
            data: vec![0xAB, 0xCD],
        }
        .encode()
        .unwrap();
        assert_eq!(&frame[..], &[0x56, 0x5C, 0x01, 0x10, 0x02, 0xAB, 0xCD]);
    }

    #[test]
    fn test_read_uses_read_address_byte() {
        let frame = Request::Read {
            slave: sla(),
            length: 2,
        }
        .encode()
        .unwrap();
        assert_eq!(&frame[..], &[0x54, 0x5D, 0x02]);
    }

    #[test]
    fn test_decode_waits_for_complete_frame() {
        let mut buf = BytesMut::from(&[0x56, 0x5C, 0x01, 0x10][..]);
        assert_eq!(Request::decode(&mut buf).unwrap(), None);
        assert_eq!(buf.len(), 4);

        buf.extend_from_slice(&[0x01, 0x7F, 0x54]);
        let request = Request::decode(&mut buf).unwrap().unwrap();
        assert_eq!(
            request,
            Request::WriteReg {
                slave: sla(),
                address: vec![0x10],
                data: vec![0x7F],
            }
        );
        // Start of the next frame stays buffered.
        assert_eq!(&buf[..], &[0x54]);
    }

    #[test]
    fn test_decode_rejects_unknown_opcode() {
        let mut buf = BytesMut::from(&[0x99, 0x00][..]);
        assert!(matches!(
            Request::decode(&mut buf),
            Err(LabError::Protocol(_))
        ));
    }

    #[test]
    fn test_decode_rejects_wrong_rw_bit() {
        let mut buf = BytesMut::from(&[0x54, 0x5C, 0x01][..]);
        assert!(Request::decode(&mut buf).is_err());
    }

    #[test]
    fn test_oversized_transfer_rejected() {
        let err = Request::Write {
            slave: sla(),
            payload: vec![0; 300],
        }
        .encode()
        .unwrap_err();
        assert!(matches!(err, LabError::Protocol(_)));
    }

    #[test]
    fn test_status_bytes() {
        assert_eq!(Status::from_byte(0x01).unwrap(), Status::Ack);
        assert_eq!(Status::from_byte(0x00).unwrap(), Status::Nack);
        assert!(Status::from_byte(0x7F).is_err());
    }
}
