//! Core library for labwire.
//!
//! Two layers shared by laboratory instrument drivers:
//!
//! - [`session`]: connect to an instrument by identifier (`IP:<host>`,
//!   `GPIB:<n>`, `USB:<descriptor>`, `COM<n>`), send commands and query
//!   replies, with failures classified as usage, recoverable or fatal.
//! - [`register`]: bit-field read-modify-write over an I2C bus reached
//!   through a USB-to-I2C bridge ([`bus`]).
//!
//! Both sit on the [`transport`] layer, which hides the concrete backend
//! (TCP socket, serial line, VISA) behind one trait.

pub mod bus;
pub mod config;
pub mod error;
pub mod observer;
pub mod register;
pub mod session;
pub mod transport;

pub use error::{AppResult, ErrorClass, LabError};
pub use session::{CommandChannel, InstrumentSession, SessionState};
