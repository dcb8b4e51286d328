//! Bus protocol communication
//!
//! Implements the addressed, checksummed request/response frame protocol
//! spoken by units on the shared half-duplex serial bus, plus the typed
//! parameter operations built on top of it.

pub mod client;
mod error;
pub mod frame;
pub mod serial;
pub mod stream;

pub use client::{BusClient, ChipInfo, TemperatureReading};
pub use error::ProtocolError;
pub use frame::{checksum, escape, BusResponse, Frame};
pub use serial::{list_ports, open_port, PortInfo};
pub use stream::{BusStream, SerialChannel};

/// Address every unit listens to
pub const BROADCAST_ADDRESS: u8 = 0xFF;

/// Command byte of a parameter read request
pub const CMD_READ: u8 = 0x01;

/// Command byte of a parameter write request
pub const CMD_WRITE: u8 = 0x81;

/// Command byte marking a device-reported error response
pub const CMD_ERROR: u8 = 0xFF;

/// Parameter holding the unit's bus address; writing `[new_address, next_slot]`
/// renames the unit whose last reported enumeration token matches `next_slot`
pub const PARAM_ADDRESS: u8 = 0x01;

/// Parameter telling a unit to ignore bus traffic until the line has been
/// quiet for a few seconds
pub const PARAM_SILENCE: u8 = 0x03;

/// Parameter that makes the unit jump into its bootloader; no response follows
pub const PARAM_BOOTLOADER: u8 = 0x04;

/// Parameter holding the unit's clock as u32 little-endian Unix seconds
pub const PARAM_CLOCK: u8 = 0x05;

/// Parameter used by the discovery protocol for slot announcement and polling
pub const PARAM_SLOT: u8 = 0x08;

/// Parameter exposing fuse, lock, signature and calibration bytes
pub const PARAM_CHIP_INFO: u8 = 0x0A;

/// Parameter exposing the temperature sensor reading
pub const PARAM_TEMPERATURE: u8 = 0x22;

/// Default baud rate of the bus
pub const DEFAULT_BAUD_RATE: u32 = 19200;

/// Default timeout for responses in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 2000;
