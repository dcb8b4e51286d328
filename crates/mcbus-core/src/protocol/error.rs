//! Protocol errors

use thiserror::Error;

/// Errors that can occur during bus communication
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Serial port error: {0}")]
    Serial(String),

    #[error("Port not found: {0}")]
    PortNotFound(String),

    #[error("Payload of {0} bytes does not fit in a frame")]
    PayloadTooLong(usize),

    #[error("No usable response from unit {address:#04x} for parameter {parameter:#04x}")]
    NoResponse { address: u8, parameter: u8 },

    #[error("Unit {address:#04x} reported an error: {message}")]
    UnitError { address: u8, message: String },

    #[error("Unexpected payload from unit {address:#04x}: {detail}")]
    UnexpectedPayload { address: u8, detail: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
