//! Bus client
//!
//! Typed request/response operations on top of the frame codec. The bus is
//! half-duplex and shared, so every operation is strictly one request frame
//! followed by at most one bounded response read; there is no pipelining.

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, trace};

use super::frame::{escape, BusResponse, Frame};
use super::stream::BusStream;
use super::{
    ProtocolError, BROADCAST_ADDRESS, DEFAULT_TIMEOUT_MS, PARAM_ADDRESS, PARAM_CHIP_INFO,
    PARAM_CLOCK, PARAM_SILENCE, PARAM_TEMPERATURE,
};

/// Fuse, lock, signature and calibration bytes of a unit's MCU
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChipInfo {
    pub fuse_low: u8,
    pub fuse_high: u8,
    pub fuse_extended: u8,
    pub lock: u8,
    pub signature: [u8; 3],
    pub calibration: u8,
}

/// A temperature sensor reading
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TemperatureReading {
    /// Temperature in degrees Celsius
    pub celsius: f32,
    /// Sensor serial number as a hex string
    pub sensor_id: String,
}

/// Client for one serial bus.
///
/// Owns the byte stream while bus-protocol framing is in effect; the
/// firmware engine borrows the stream exclusively for the duration of a
/// programming session.
pub struct BusClient<S: BusStream> {
    stream: S,
    response_timeout: Duration,
}

impl<S: BusStream> BusClient<S> {
    /// Create a client with the default response timeout
    pub fn new(stream: S) -> Self {
        Self::with_timeout(stream, Duration::from_millis(DEFAULT_TIMEOUT_MS))
    }

    /// Create a client with a specific default response timeout
    pub fn with_timeout(stream: S, response_timeout: Duration) -> Self {
        Self { stream, response_timeout }
    }

    /// Default timeout used by [`read`](Self::read) and [`write`](Self::write)
    pub fn response_timeout(&self) -> Duration {
        self.response_timeout
    }

    /// Exclusive access to the underlying stream (used by the firmware
    /// engine once a unit has switched to its bootloader protocol)
    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Consume the client, returning the stream
    pub fn into_stream(self) -> S {
        self.stream
    }

    fn check_payload(payload: &[u8]) -> Result<(), ProtocolError> {
        if payload.len() > u8::MAX as usize {
            return Err(ProtocolError::PayloadTooLong(payload.len()));
        }
        Ok(())
    }

    fn transact(&mut self, frame: &Frame, timeout: Duration) -> Result<BusResponse, ProtocolError> {
        let bytes = frame.encode();
        trace!(address = frame.address, "sending {}", escape(&bytes));
        self.stream.clear_input()?;
        self.stream.write_all(&bytes)?;
        self.receive(timeout)
    }

    /// Read one response frame off the stream within `timeout`.
    ///
    /// Short reads, checksum and length mismatches and error responses are
    /// not errors here: they come back as a non-ok [`BusResponse`] with the
    /// raw bytes retained. Retry policy belongs to callers.
    pub fn receive(&mut self, timeout: Duration) -> Result<BusResponse, ProtocolError> {
        let mut header = [0u8; 5];
        let got = self.stream.read_timeout(&mut header, timeout)?;
        let mut raw = header[..got].to_vec();

        if got == 5 {
            let length = header[3] as usize;
            if length > 0 {
                let mut payload = vec![0u8; length];
                let n = self.stream.read_timeout(&mut payload, timeout)?;
                raw.extend_from_slice(&payload[..n]);
            }
        }

        let response = BusResponse::parse(raw);
        match (response.ok, response.address) {
            (true, Some(address)) => {
                debug!(address, "response {}", escape(&response.payload))
            }
            _ if response.raw.is_empty() => trace!("no response"),
            _ => debug!("bad response {}", escape(&response.raw)),
        }
        Ok(response)
    }

    /// Read a parameter using the default timeout
    pub fn read(&mut self, address: u8, parameter: u8) -> Result<BusResponse, ProtocolError> {
        self.read_with(address, parameter, &[], self.response_timeout)
    }

    /// Read a parameter with a request payload and an explicit timeout
    pub fn read_with(
        &mut self,
        address: u8,
        parameter: u8,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<BusResponse, ProtocolError> {
        Self::check_payload(payload)?;
        self.transact(&Frame::read(address, parameter, payload.to_vec()), timeout)
    }

    /// Write a parameter using the default timeout
    pub fn write(
        &mut self,
        address: u8,
        parameter: u8,
        payload: &[u8],
    ) -> Result<BusResponse, ProtocolError> {
        self.write_with(address, parameter, payload, self.response_timeout)
    }

    /// Write a parameter with an explicit timeout
    pub fn write_with(
        &mut self,
        address: u8,
        parameter: u8,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<BusResponse, ProtocolError> {
        Self::check_payload(payload)?;
        self.transact(&Frame::write(address, parameter, payload.to_vec()), timeout)
    }

    /// Write a parameter without waiting for any response.
    ///
    /// Used for commands that eliminate the responder, such as telling a
    /// unit to jump into its bootloader or broadcast writes nobody answers.
    pub fn write_no_reply(
        &mut self,
        address: u8,
        parameter: u8,
        payload: &[u8],
    ) -> Result<(), ProtocolError> {
        Self::check_payload(payload)?;
        let bytes = Frame::write(address, parameter, payload.to_vec()).encode();
        trace!(address, "sending {} (no reply expected)", escape(&bytes));
        self.stream.clear_input()?;
        self.stream.write_all(&bytes)?;
        Ok(())
    }

    fn expect_ok(
        response: BusResponse,
        address: u8,
        parameter: u8,
    ) -> Result<BusResponse, ProtocolError> {
        if response.ok {
            return Ok(response);
        }
        if response.is_unit_error() {
            return Err(ProtocolError::UnitError {
                address,
                message: escape(&response.payload),
            });
        }
        Err(ProtocolError::NoResponse { address, parameter })
    }

    /// Read the unit's clock (u32 little-endian Unix seconds)
    pub fn read_clock(&mut self, address: u8) -> Result<DateTime<Utc>, ProtocolError> {
        let response = self.read(address, PARAM_CLOCK)?;
        let response = Self::expect_ok(response, address, PARAM_CLOCK)?;
        let secs: [u8; 4] = response.payload.as_slice().try_into().map_err(|_| {
            ProtocolError::UnexpectedPayload {
                address,
                detail: format!("clock payload {}", escape(&response.payload)),
            }
        })?;
        let secs = u32::from_le_bytes(secs);
        Utc.timestamp_opt(i64::from(secs), 0)
            .single()
            .ok_or(ProtocolError::UnexpectedPayload {
                address,
                detail: format!("timestamp {secs} out of range"),
            })
    }

    /// Set the unit's clock; `None` means the host's current time
    pub fn write_clock(
        &mut self,
        address: u8,
        time: Option<DateTime<Utc>>,
    ) -> Result<(), ProtocolError> {
        let secs = time.unwrap_or_else(Utc::now).timestamp() as u32;
        let response = self.write(address, PARAM_CLOCK, &secs.to_le_bytes())?;
        Self::expect_ok(response, address, PARAM_CLOCK)?;
        Ok(())
    }

    /// Read the unit's temperature sensor
    pub fn read_temperature(&mut self, address: u8) -> Result<TemperatureReading, ProtocolError> {
        let response = self.read(address, PARAM_TEMPERATURE)?;
        let response = Self::expect_ok(response, address, PARAM_TEMPERATURE)?;
        if response.payload.len() < 2 {
            return Err(ProtocolError::UnexpectedPayload {
                address,
                detail: format!("temperature payload {}", escape(&response.payload)),
            });
        }
        // Raw value is sixteenths of a degree, sensor id trails in
        // reversed byte order
        let raw = u16::from_le_bytes([response.payload[0], response.payload[1]]);
        let sensor_id: String = response.payload[2..]
            .iter()
            .rev()
            .map(|b| format!("{b:02x}"))
            .collect();
        Ok(TemperatureReading { celsius: f32::from(raw) / 16.0, sensor_id })
    }

    /// Read fuse, lock, signature and calibration bytes
    pub fn read_chip_info(&mut self, address: u8) -> Result<ChipInfo, ProtocolError> {
        let response = self.read(address, PARAM_CHIP_INFO)?;
        let response = Self::expect_ok(response, address, PARAM_CHIP_INFO)?;
        let data = &response.payload;
        if data.len() < 8 {
            return Err(ProtocolError::UnexpectedPayload {
                address,
                detail: format!("chip info payload {}", escape(data)),
            });
        }
        Ok(ChipInfo {
            fuse_low: data[0],
            fuse_high: data[1],
            fuse_extended: data[2],
            lock: data[3],
            signature: [data[4], data[5], data[6]],
            calibration: data[7],
        })
    }

    /// Tell one unit to ignore bus traffic until the line has been quiet
    /// for a few seconds
    pub fn silence(&mut self, address: u8) -> Result<(), ProtocolError> {
        // The unit goes deaf on reception; no response follows
        self.write_no_reply(address, PARAM_SILENCE, &[])
    }

    /// Silence every unit except `keep`, so the next command only has one
    /// listener on the bus
    pub fn silence_all_except(&mut self, keep: u8) -> Result<(), ProtocolError> {
        self.write_no_reply(BROADCAST_ADDRESS, PARAM_SILENCE, &[keep])
    }

    /// Rename the unit currently at `old_address` whose last reported
    /// enumeration token equals `next_slot`.
    ///
    /// Several physical units may share `old_address`; the token selects
    /// which of them accepts the rename.
    pub fn rename(
        &mut self,
        old_address: u8,
        new_address: u8,
        next_slot: u8,
    ) -> Result<(), ProtocolError> {
        let response = self.write(old_address, PARAM_ADDRESS, &[new_address, next_slot])?;
        if !response.ok {
            debug!(old_address, new_address, "rename not acknowledged");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{checksum, CMD_ERROR, CMD_READ};
    use std::collections::VecDeque;
    use std::io;

    /// Scripted in-memory stream: collects writes, serves canned responses
    struct ScriptedStream {
        written: Vec<u8>,
        responses: VecDeque<Vec<u8>>,
        pending: Vec<u8>,
    }

    impl ScriptedStream {
        fn new(responses: Vec<Vec<u8>>) -> Self {
            Self {
                written: Vec::new(),
                responses: responses.into(),
                pending: Vec::new(),
            }
        }
    }

    impl BusStream for ScriptedStream {
        fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
            self.written.extend_from_slice(buf);
            if self.pending.is_empty() {
                if let Some(next) = self.responses.pop_front() {
                    self.pending = next;
                }
            }
            Ok(())
        }

        fn read_timeout(&mut self, buf: &mut [u8], _timeout: Duration) -> io::Result<usize> {
            let n = buf.len().min(self.pending.len());
            buf[..n].copy_from_slice(&self.pending[..n]);
            self.pending.drain(..n);
            Ok(n)
        }

        fn clear_input(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn response(address: u8, command: u8, parameter: u8, payload: &[u8]) -> Vec<u8> {
        let mut bytes = vec![address, command, parameter, payload.len() as u8];
        bytes.extend_from_slice(payload);
        bytes.push(checksum(&bytes));
        bytes
    }

    #[test]
    fn read_sends_request_and_parses_reply() {
        let reply = response(0x10, CMD_READ, 0x22, &[0x00, 0x01]);
        let stream = ScriptedStream::new(vec![reply]);
        let mut client = BusClient::new(stream);

        let resp = client.read(0x10, 0x22).unwrap();
        assert!(resp.ok);
        assert_eq!(resp.payload, vec![0x00, 0x01]);
        assert_eq!(
            client.stream_mut().written,
            vec![0x10, 0x01, 0x22, 0x00, 0x33]
        );
    }

    #[test]
    fn timeout_yields_non_ok_response() {
        let stream = ScriptedStream::new(vec![]);
        let mut client = BusClient::new(stream);
        let resp = client.read(0x10, 0x22).unwrap();
        assert!(!resp.ok);
        assert!(resp.raw.is_empty());
    }

    #[test]
    fn write_no_reply_reads_nothing() {
        // A queued response must stay unread
        let reply = response(0x10, CMD_READ, 0x04, &[]);
        let stream = ScriptedStream::new(vec![reply.clone()]);
        let mut client = BusClient::new(stream);
        client.write_no_reply(0x10, 0x04, &[1]).unwrap();
        assert_eq!(client.stream_mut().pending, reply);
    }

    #[test]
    fn oversized_payload_rejected_before_io() {
        let stream = ScriptedStream::new(vec![]);
        let mut client = BusClient::new(stream);
        let payload = vec![0u8; 256];
        let err = client.write(0x10, 0x07, &payload).unwrap_err();
        assert!(matches!(err, ProtocolError::PayloadTooLong(256)));
        assert!(client.stream_mut().written.is_empty());
    }

    #[test]
    fn clock_roundtrip_encoding() {
        let reply = response(0x12, CMD_READ, PARAM_CLOCK, &0x6543_2100u32.to_le_bytes());
        let stream = ScriptedStream::new(vec![reply]);
        let mut client = BusClient::new(stream);
        let time = client.read_clock(0x12).unwrap();
        assert_eq!(time.timestamp(), 0x6543_2100);
    }

    #[test]
    fn unit_error_surfaces_as_typed_failure() {
        let reply = response(0x12, CMD_ERROR, PARAM_CLOCK, b"no clock");
        let stream = ScriptedStream::new(vec![reply]);
        let mut client = BusClient::new(stream);
        let err = client.read_clock(0x12).unwrap_err();
        match err {
            ProtocolError::UnitError { address, message } => {
                assert_eq!(address, 0x12);
                assert_eq!(message, "\"no clock\"");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn temperature_scaling_and_sensor_id() {
        // 0x019B sixteenths = 25.6875 degC, id bytes reversed
        let reply = response(
            0x20,
            CMD_READ,
            PARAM_TEMPERATURE,
            &[0x9B, 0x01, 0xAA, 0xBB, 0xCC],
        );
        let stream = ScriptedStream::new(vec![reply]);
        let mut client = BusClient::new(stream);
        let reading = client.read_temperature(0x20).unwrap();
        assert!((reading.celsius - 25.6875).abs() < f32::EPSILON);
        assert_eq!(reading.sensor_id, "ccbbaa");
    }

    #[test]
    fn chip_info_field_order() {
        let reply = response(
            0x20,
            CMD_READ,
            PARAM_CHIP_INFO,
            &[0xE2, 0xD9, 0x07, 0xFF, 0x1E, 0x95, 0x0F, 0xB3],
        );
        let stream = ScriptedStream::new(vec![reply]);
        let mut client = BusClient::new(stream);
        let info = client.read_chip_info(0x20).unwrap();
        assert_eq!(info.fuse_low, 0xE2);
        assert_eq!(info.fuse_high, 0xD9);
        assert_eq!(info.fuse_extended, 0x07);
        assert_eq!(info.lock, 0xFF);
        assert_eq!(info.signature, [0x1E, 0x95, 0x0F]);
        assert_eq!(info.calibration, 0xB3);
    }
}
