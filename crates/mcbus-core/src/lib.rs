//! # mcbus core library
//!
//! Host-side tooling for addressable microcontroller units sharing one
//! half-duplex serial bus.
//!
//! This library provides:
//! - the bus frame codec and a typed request/response client
//!   ([`protocol`])
//! - slot-based enumeration of units with address deconfliction
//!   ([`discovery`])
//! - a firmware update engine speaking the units' bootloader protocol,
//!   fed by an Intel HEX parser ([`firmware`])
//!
//! The bus is physically half-duplex and shared by every unit, so all I/O
//! is synchronous and strictly one request in flight; every read is
//! bounded by an explicit timeout.
//!
//! ## Example
//!
//! ```rust,no_run
//! use mcbus_core::protocol::{open_port, BusClient, SerialChannel};
//!
//! # fn main() -> Result<(), mcbus_core::protocol::ProtocolError> {
//! let port = open_port("/dev/ttyUSB0", None)?;
//! let mut client = BusClient::new(SerialChannel::new(port));
//! let response = client.read(0x10, 0x22)?;
//! println!("payload: {:02x?}", response.payload);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod discovery;
pub mod firmware;
pub mod protocol;
