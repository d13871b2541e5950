//! Bit-addressable register access
//!
//! Registers are addressed with specifiers such as `"0x10[7:6]"` (register
//! 0x10, bits 7 down to 6). [`RegisterCodec`] turns a field read into one
//! register read plus a mask and shift, and a field write into a
//! read-modify-write that leaves every bit outside the field untouched.
//!
//! ```no_run
//! use labwire::bus::{BridgeBus, BridgeEmulator, SlaveAddress};
//! use labwire::register::{AccessPath, RegisterCodec};
//!
//! # async fn demo() -> labwire::error::AppResult<()> {
//! let slave = SlaveAddress::from_8bit(0x5C);
//! let mut bus = BridgeBus::new(BridgeEmulator::new(slave), slave);
//! let codec = RegisterCodec::default();
//! let spec = codec.parse_spec("0x10[7:6]")?;
//!
//! codec.write_field(&mut bus, &spec, 0b10, AccessPath::Fast).await?;
//! assert_eq!(codec.read_field(&mut bus, &spec, AccessPath::Fast).await?, 0b10);
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod spec;

pub use codec::{AccessPath, ByteOrder, OverflowPolicy, RegisterCodec, SharedBus};
pub use spec::{BitRange, RegisterSpec, BYTE_REGISTER_BITS};
