//! Frame encoding/decoding
//!
//! Implements the bus frame format:
//! - 1 byte: unit address (0xFF = broadcast)
//! - 1 byte: command (0x01 read, 0x81 write, 0xFF error response)
//! - 1 byte: parameter
//! - 1 byte: payload length
//! - N bytes: payload
//! - 1 byte: checksum (sum of all preceding bytes modulo 256)

use super::{CMD_ERROR, CMD_READ, CMD_WRITE};

/// Sum of all bytes modulo 256
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |sum, b| sum.wrapping_add(*b))
}

/// Format a payload for logs: quoted text when printable, hex otherwise
pub fn escape(data: &[u8]) -> String {
    if data.is_empty() {
        return "<empty>".to_string();
    }
    if data.iter().all(|&b| (30..128).contains(&b)) {
        if let Ok(text) = std::str::from_utf8(data) {
            return format!("\"{text}\"");
        }
    }
    let hex: String = data.iter().map(|b| format!("{b:02x}")).collect();
    format!("0x{hex}")
}

/// A request frame on the bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Destination unit address
    pub address: u8,
    /// Command byte
    pub command: u8,
    /// Parameter being accessed
    pub parameter: u8,
    /// Payload, at most 255 bytes
    pub payload: Vec<u8>,
}

impl Frame {
    /// Build a parameter read request
    pub fn read(address: u8, parameter: u8, payload: Vec<u8>) -> Self {
        Self { address, command: CMD_READ, parameter, payload }
    }

    /// Build a parameter write request
    pub fn write(address: u8, parameter: u8, payload: Vec<u8>) -> Self {
        Self { address, command: CMD_WRITE, parameter, payload }
    }

    /// Encode the frame to raw bytes.
    ///
    /// The payload must fit the one-byte length field; `BusClient` rejects
    /// longer payloads before a frame is ever constructed.
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(5 + self.payload.len());
        bytes.push(self.address);
        bytes.push(self.command);
        bytes.push(self.parameter);
        bytes.push(self.payload.len() as u8);
        bytes.extend_from_slice(&self.payload);
        bytes.push(checksum(&bytes));
        bytes
    }
}

/// A parsed response, always fully populated with an explicit validity flag.
///
/// A malformed response is not discarded: the parsed fields are filled in
/// best-effort and the raw bytes are retained so callers can inspect them.
/// The scalar fields are `None` only when fewer than 5 bytes arrived.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BusResponse {
    /// Responding unit address
    pub address: Option<u8>,
    /// Echoed command byte; [`CMD_ERROR`] marks a device-reported error
    pub command: Option<u8>,
    /// Echoed parameter
    pub parameter: Option<u8>,
    /// Declared payload length
    pub length: Option<u8>,
    /// Payload bytes actually captured
    pub payload: Vec<u8>,
    /// Received checksum byte
    pub checksum: Option<u8>,
    /// True only if the frame was complete, checksummed correctly, carried
    /// the declared payload length and was not an error response
    pub ok: bool,
    /// Every byte read off the wire for this response
    pub raw: Vec<u8>,
}

impl BusResponse {
    /// Parse the raw bytes of one response.
    ///
    /// Never fails: short reads, checksum mismatches, length mismatches and
    /// device-reported errors all come back as `ok == false`.
    pub fn parse(raw: Vec<u8>) -> Self {
        if raw.len() < 5 {
            return Self { payload: Vec::new(), ok: false, raw, ..Default::default() };
        }

        let address = raw[0];
        let command = raw[1];
        let parameter = raw[2];
        let length = raw[3];
        let received_checksum = raw[raw.len() - 1];
        let payload = raw[4..raw.len() - 1].to_vec();

        let mut ok = true;
        if checksum(&raw[..raw.len() - 1]) != received_checksum {
            ok = false;
        }
        if length as usize + 5 != raw.len() {
            ok = false;
        }
        if command == CMD_ERROR {
            ok = false;
        }

        Self {
            address: Some(address),
            command: Some(command),
            parameter: Some(parameter),
            length: Some(length),
            payload,
            checksum: Some(received_checksum),
            ok,
            raw,
        }
    }

    /// True if this response is a device-reported error frame
    pub fn is_unit_error(&self) -> bool {
        self.command == Some(CMD_ERROR)
    }
}
