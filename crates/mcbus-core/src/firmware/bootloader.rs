//! Bootloader programming protocol
//!
//! Once a unit has jumped into its bootloader it no longer speaks bus
//! frames: the bootloader uses its own synchronous command protocol
//! (single-letter commands terminated by a space, replies framed by a
//! leading in-sync byte and a trailing status byte). This module owns the
//! stream's framing interpretation for the duration of a
//! [`ProgrammingSession`]; entering and leaving the session are the only
//! points where that interpretation changes.

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{FlashError, FlashOptions};
use crate::protocol::{escape, BusClient, BusStream, PARAM_ADDRESS, PARAM_BOOTLOADER};

/// Bootloader protocol constants
pub mod stk {
    pub const RESP_OK: u8 = 0x10;
    pub const RESP_FAILED: u8 = 0x11;
    pub const RESP_UNKNOWN: u8 = 0x12;
    pub const RESP_NODEVICE: u8 = 0x13;
    pub const RESP_IN_SYNC: u8 = 0x14;
    pub const RESP_NOSYNC: u8 = 0x15;

    pub const PARM_SW_MAJOR: u8 = 0x81;
    pub const PARM_SW_MINOR: u8 = 0x82;

    pub const GET_SYNC: u8 = b'0';
    pub const GET_PARAMETER: u8 = b'A';
    pub const LOAD_ADDRESS: u8 = b'U';
    pub const PROG_PAGE: u8 = b'd';
    pub const READ_PAGE: u8 = b't';
    pub const READ_SIGNATURE: u8 = b'u';
    pub const LEAVE_PROG_MODE: u8 = b'Q';

    /// Command terminator ("end of packet")
    pub const EOP: u8 = b' ';

    /// Memory type tag for flash
    pub const MEMTYPE_FLASH: u8 = b'F';
}

/// Largest page the bootloader transfers in one command
pub const MAX_PAGE_BYTES: usize = 256;

/// Wait for a framed bootloader reply
const REPLY_TIMEOUT: Duration = Duration::from_millis(250);

/// Wait used by the throwaway probes of the normal sync strategy
const SYNC_PROBE_TIMEOUT: Duration = Duration::from_millis(10);

/// Wait per attempt of the forced sync loop
const FORCED_SYNC_TIMEOUT: Duration = Duration::from_secs(1);

/// Cap for replies of unknown length
const MAX_REPLY: usize = 512;

/// An active bootloader programming session.
///
/// Created by [`enter`](Self::enter), which switches the target unit from
/// the bus protocol to its bootloader; destroyed by
/// [`leave`](Self::leave). Dropping a session without leaving performs a
/// best-effort leave, so every exit path (including failures propagated
/// with `?`) returns the unit to its normal listening state instead of
/// stranding the bus with a deaf unit.
pub struct ProgrammingSession<'a, S: BusStream> {
    client: &'a mut BusClient<S>,
    address: u8,
    left: bool,
}

impl<'a, S: BusStream> ProgrammingSession<'a, S> {
    /// Put the unit at `address` into programming mode and get in sync
    /// with its bootloader.
    pub fn enter(
        client: &'a mut BusClient<S>,
        address: u8,
        options: &FlashOptions,
    ) -> Result<Self, FlashError> {
        if !options.force_sync {
            // Make sure somebody is actually listening before we start
            let response = client.read(address, PARAM_ADDRESS)?;
            if !response.ok {
                return Err(FlashError::NoContact(address));
            }
        }

        if options.silence_others {
            // Everyone else goes deaf until the bus has been quiet a while,
            // so only our unit hears the jump command
            client.silence_all_except(address)?;
        }

        // Jump into the bootloader. The normal protocol handler is gone
        // after this, so no response will ever arrive.
        client.write_no_reply(address, PARAM_BOOTLOADER, &[1])?;

        // The bootloader takes a moment to start listening
        std::thread::sleep(options.settle_delay);

        let mut session = Self { client, address, left: false };
        let result = if options.force_sync {
            session.sync_forced(options.sync_attempts)
        } else {
            session.sync_quick()
        };
        match result {
            Ok(()) => Ok(session),
            // Drop runs the best-effort leave
            Err(e) => Err(e),
        }
    }

    fn stream(&mut self) -> &mut S {
        self.client.stream_mut()
    }

    /// Write one bootloader command body followed by the terminator
    fn send_command(&mut self, body: &[u8]) -> Result<(), FlashError> {
        let mut buf = Vec::with_capacity(body.len() + 1);
        buf.extend_from_slice(body);
        buf.push(stk::EOP);
        self.stream().write_all(&buf)?;
        Ok(())
    }

    /// Read one framed reply and validate its envelope.
    ///
    /// With `expected`, exactly that many bytes must arrive; without, up to
    /// [`MAX_REPLY`] bytes are drained. The reply must begin with the
    /// in-sync byte and end with the OK status byte; any violation is
    /// fatal to the current operation.
    fn read_reply(&mut self, expected: Option<usize>) -> Result<Vec<u8>, FlashError> {
        let mut buf = vec![0u8; expected.unwrap_or(MAX_REPLY)];
        let got = self.stream().read_timeout(&mut buf, REPLY_TIMEOUT)?;
        buf.truncate(got);

        if let Some(len) = expected {
            if got < len {
                return Err(FlashError::ShortReply { expected: len, got });
            }
        }
        if buf.first() != Some(&stk::RESP_IN_SYNC) {
            return Err(FlashError::NotInSync(escape(&buf)));
        }
        if buf.last() != Some(&stk::RESP_OK) {
            return Err(FlashError::NotOk(escape(&buf)));
        }
        Ok(buf)
    }

    /// Sync the way a host normally does: the first one or two probes eat
    /// any framing mismatch left over from startup noise, the third
    /// exchange must validate strictly.
    fn sync_quick(&mut self) -> Result<(), FlashError> {
        for _ in 0..2 {
            self.send_command(&[stk::GET_SYNC])?;
            let mut scratch = [0u8; 100];
            self.stream().read_timeout(&mut scratch, SYNC_PROBE_TIMEOUT)?;
        }
        self.send_command(&[stk::GET_SYNC])?;
        self.strict_sync_exchange(3)
    }

    /// Probe for up to `attempts` seconds, accepting any reply whose tail
    /// is in-sync + OK. Intended for recovering a unit stuck in its
    /// bootloader: a human resets the device while this loop runs.
    fn sync_forced(&mut self, attempts: u32) -> Result<(), FlashError> {
        info!("press reset on the unit until it gets in sync");
        for attempt in 1..=attempts {
            self.send_command(&[stk::GET_SYNC])?;
            let mut buf = [0u8; 100];
            let got = self.stream().read_timeout(&mut buf, FORCED_SYNC_TIMEOUT)?;
            if got >= 2 && buf[got - 2..got] == [stk::RESP_IN_SYNC, stk::RESP_OK] {
                info!(attempt, "found sync");
                self.send_command(&[stk::GET_SYNC])?;
                return self.strict_sync_exchange(attempt);
            }
            debug!(attempt, "no sync yet");
        }
        Err(FlashError::SyncFailed { attempts })
    }

    fn strict_sync_exchange(&mut self, attempts: u32) -> Result<(), FlashError> {
        match self.read_reply(Some(2)) {
            Ok(_) => Ok(()),
            Err(FlashError::Io(e)) => Err(FlashError::Io(e)),
            Err(_) => Err(FlashError::SyncFailed { attempts }),
        }
    }

    /// Address of the unit being programmed
    pub fn address(&self) -> u8 {
        self.address
    }

    /// Read the 3 device signature bytes
    pub fn read_signature(&mut self) -> Result<[u8; 3], FlashError> {
        self.send_command(&[stk::READ_SIGNATURE])?;
        let reply = self.read_reply(Some(5))?;
        Ok([reply[1], reply[2], reply[3]])
    }

    fn get_parameter(&mut self, parameter: u8) -> Result<u8, FlashError> {
        self.send_command(&[stk::GET_PARAMETER, parameter])?;
        let reply = self.read_reply(None)?;
        if reply.len() < 3 {
            return Err(FlashError::ShortReply { expected: 3, got: reply.len() });
        }
        Ok(reply[1])
    }

    /// Read the bootloader software version as (major, minor)
    pub fn sw_version(&mut self) -> Result<(u8, u8), FlashError> {
        let major = self.get_parameter(stk::PARM_SW_MAJOR)?;
        let minor = self.get_parameter(stk::PARM_SW_MINOR)?;
        Ok((major, minor))
    }

    /// Load the current address for the next page operation.
    ///
    /// The bootloader takes a 16-bit word address, so the byte address is
    /// shifted right once and sent little-endian.
    fn load_address(&mut self, byte_address: usize) -> Result<(), FlashError> {
        let word = (byte_address >> 1) as u16;
        let mut body = [stk::LOAD_ADDRESS, 0, 0];
        LittleEndian::write_u16(&mut body[1..], word);
        self.send_command(&body)?;
        self.read_reply(Some(2))?;
        Ok(())
    }

    /// Program one flash page at `byte_address`
    pub fn program_page(&mut self, byte_address: usize, data: &[u8]) -> Result<(), FlashError> {
        if data.len() > MAX_PAGE_BYTES {
            return Err(FlashError::PageTooLarge(data.len()));
        }
        self.load_address(byte_address)?;

        let mut body = Vec::with_capacity(4 + data.len());
        body.push(stk::PROG_PAGE);
        let mut count = [0u8; 2];
        BigEndian::write_u16(&mut count, data.len() as u16);
        body.extend_from_slice(&count);
        body.push(stk::MEMTYPE_FLASH);
        body.extend_from_slice(data);
        self.send_command(&body)?;
        self.read_reply(Some(2))?;
        debug!(byte_address, len = data.len(), "programmed page");
        Ok(())
    }

    /// Read `count` bytes of flash starting at `byte_address`
    pub fn read_page(&mut self, byte_address: usize, count: usize) -> Result<Vec<u8>, FlashError> {
        if count > MAX_PAGE_BYTES {
            return Err(FlashError::PageTooLarge(count));
        }
        self.load_address(byte_address)?;

        let mut body = [stk::READ_PAGE, 0, 0, stk::MEMTYPE_FLASH];
        BigEndian::write_u16(&mut body[1..3], count as u16);
        self.send_command(&body)?;

        let mut reply = self.read_reply(Some(count + 2))?;
        // Strip the in-sync and status envelope
        reply.pop();
        reply.remove(0);
        Ok(reply)
    }

    fn send_leave(&mut self) -> Result<(), FlashError> {
        self.left = true;
        self.send_command(&[stk::LEAVE_PROG_MODE])?;
        self.read_reply(None)?;
        Ok(())
    }

    /// Leave programming mode, returning the unit to the bus protocol
    pub fn leave(mut self) -> Result<(), FlashError> {
        self.send_leave()
    }
}

impl<S: BusStream> Drop for ProgrammingSession<'_, S> {
    fn drop(&mut self) {
        if !self.left {
            if let Err(e) = self.send_leave() {
                warn!(address = self.address, "best-effort leave failed: {e}");
            }
        }
    }
}
