//! Firmware engine tests against a simulated bootloader.
//!
//! The simulated unit speaks the bus protocol until it receives the
//! jump-to-bootloader command, then switches to the bootloader command
//! protocol with a page-addressable flash array.

use pretty_assertions::assert_eq;
use std::io;
use std::time::Duration;

use mcbus_core::firmware::{
    self, stk, FlashError, FlashOptions, MemoryImage, PAGE_SIZE,
};
use mcbus_core::protocol::{
    checksum, BusClient, BusStream, CMD_READ, CMD_WRITE, PARAM_ADDRESS, PARAM_BOOTLOADER,
};

#[derive(PartialEq)]
enum Mode {
    Bus,
    Bootloader,
}

struct SimDevice {
    address: u8,
    mode: Mode,
    flash: Vec<u8>,
    word_address: u16,
    signature: [u8; 3],
    sw_version: (u8, u8),
    answer_contact: bool,
    /// Number of sync probes to ignore before answering
    sync_after: u32,
    sync_seen: u32,
    fail_program: bool,
    leaves: u32,
    out: Vec<u8>,
}

impl SimDevice {
    fn new(address: u8) -> Self {
        Self {
            address,
            mode: Mode::Bus,
            flash: vec![0xFF; 2048],
            word_address: 0,
            signature: [0x1E, 0x95, 0x0F],
            sw_version: (4, 4),
            answer_contact: true,
            sync_after: 0,
            sync_seen: 0,
            fail_program: false,
            leaves: 0,
            out: Vec::new(),
        }
    }

    fn handle_bus_frame(&mut self, frame: &[u8]) {
        if frame.len() < 5 || frame[0] != self.address {
            return;
        }
        match (frame[1], frame[2]) {
            (CMD_READ, PARAM_ADDRESS) if self.answer_contact => {
                let mut reply = vec![self.address, CMD_READ, PARAM_ADDRESS, 1, self.address];
                reply.push(checksum(&reply));
                self.out.extend(reply);
            }
            (CMD_WRITE, PARAM_BOOTLOADER) => {
                self.mode = Mode::Bootloader;
            }
            _ => {}
        }
    }

    fn handle_bootloader_command(&mut self, cmd: &[u8]) {
        match cmd {
            [stk::GET_SYNC, stk::EOP] => {
                self.sync_seen += 1;
                if self.sync_seen > self.sync_after {
                    self.out.extend([stk::RESP_IN_SYNC, stk::RESP_OK]);
                }
            }
            [stk::LOAD_ADDRESS, lo, hi, stk::EOP] => {
                self.word_address = u16::from_le_bytes([*lo, *hi]);
                self.out.extend([stk::RESP_IN_SYNC, stk::RESP_OK]);
            }
            [stk::PROG_PAGE, hi, lo, stk::MEMTYPE_FLASH, rest @ ..] => {
                let count = u16::from_be_bytes([*hi, *lo]) as usize;
                let data = &rest[..rest.len() - 1]; // trailing EOP
                assert_eq!(data.len(), count);
                if self.fail_program {
                    self.out.extend([stk::RESP_IN_SYNC, stk::RESP_FAILED]);
                    return;
                }
                let start = usize::from(self.word_address) * 2;
                self.flash[start..start + count].copy_from_slice(data);
                self.out.extend([stk::RESP_IN_SYNC, stk::RESP_OK]);
            }
            [stk::READ_PAGE, hi, lo, stk::MEMTYPE_FLASH, stk::EOP] => {
                let count = u16::from_be_bytes([*hi, *lo]) as usize;
                let start = usize::from(self.word_address) * 2;
                self.out.push(stk::RESP_IN_SYNC);
                self.out.extend_from_slice(&self.flash[start..start + count]);
                self.out.push(stk::RESP_OK);
            }
            [stk::READ_SIGNATURE, stk::EOP] => {
                self.out.push(stk::RESP_IN_SYNC);
                self.out.extend(self.signature);
                self.out.push(stk::RESP_OK);
            }
            [stk::GET_PARAMETER, parameter, stk::EOP] => {
                let value = match *parameter {
                    stk::PARM_SW_MAJOR => self.sw_version.0,
                    stk::PARM_SW_MINOR => self.sw_version.1,
                    _ => 0,
                };
                self.out.extend([stk::RESP_IN_SYNC, value, stk::RESP_OK]);
            }
            [stk::LEAVE_PROG_MODE, stk::EOP] => {
                self.leaves += 1;
                self.mode = Mode::Bus;
                self.out.extend([stk::RESP_IN_SYNC, stk::RESP_OK]);
            }
            // Anything else (stray bus frames included) is noise to a
            // real bootloader and gets dropped
            _ => {}
        }
    }
}

impl BusStream for SimDevice {
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        match self.mode {
            Mode::Bus => self.handle_bus_frame(buf),
            Mode::Bootloader => self.handle_bootloader_command(buf),
        }
        Ok(())
    }

    fn read_timeout(&mut self, buf: &mut [u8], _timeout: Duration) -> io::Result<usize> {
        let n = buf.len().min(self.out.len());
        buf[..n].copy_from_slice(&self.out[..n]);
        self.out.drain(..n);
        Ok(n)
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.out.clear();
        Ok(())
    }
}

fn fast_options() -> FlashOptions {
    FlashOptions {
        settle_delay: Duration::ZERO,
        command_delay: Duration::ZERO,
        ..Default::default()
    }
}

fn record_line(offset: u16, record_type: u8, data: &[u8]) -> String {
    let mut bytes = vec![
        data.len() as u8,
        (offset >> 8) as u8,
        (offset & 0xFF) as u8,
        record_type,
    ];
    bytes.extend_from_slice(data);
    let sum = checksum(&bytes);
    bytes.push((sum ^ 0xFF).wrapping_add(1));
    let hex: String = bytes.iter().map(|b| format!("{b:02X}")).collect();
    format!(":{hex}")
}

/// Build a 300-byte image spanning multiple 128-byte pages
fn test_image() -> MemoryImage {
    let data: Vec<u8> = (0..300u16).map(|i| (i % 251) as u8).collect();
    let mut lines = Vec::new();
    for (i, chunk) in data.chunks(16).enumerate() {
        lines.push(record_line((i * 16) as u16, 0x00, chunk));
    }
    lines.push(record_line(0, 0x01, &[]));
    MemoryImage::from_reader(io::Cursor::new(lines.join("\n"))).unwrap()
}

#[test]
fn program_writes_pages_and_leaves() {
    let mut client = BusClient::new(SimDevice::new(0x21));
    let image = test_image();

    firmware::program(&mut client, 0x21, &image, &fast_options()).unwrap();

    let device = client.stream_mut();
    assert_eq!(&device.flash[..image.len()], image.data());
    assert_eq!(device.leaves, 1);
    assert!(device.mode == Mode::Bus);
}

#[test]
fn verify_roundtrip_matches() {
    let mut client = BusClient::new(SimDevice::new(0x21));
    let image = test_image();

    firmware::program(&mut client, 0x21, &image, &fast_options()).unwrap();
    let report = firmware::verify(&mut client, 0x21, &image, &fast_options()).unwrap();

    assert!(report.matches());
    assert_eq!(report.bytes_checked, image.len());
    assert_eq!(client.stream_mut().leaves, 2);
}

#[test]
fn verify_reports_first_mismatch() {
    let mut client = BusClient::new(SimDevice::new(0x21));
    let image = test_image();

    firmware::program(&mut client, 0x21, &image, &fast_options()).unwrap();
    client.stream_mut().flash[5] ^= 0xFF;
    let report = firmware::verify(&mut client, 0x21, &image, &fast_options()).unwrap();

    assert!(!report.matches());
    assert_eq!(report.first_mismatch, Some(5));
}

#[test]
fn page_program_read_roundtrip_single_page() {
    let mut client = BusClient::new(SimDevice::new(0x21));
    let page: Vec<u8> = (0..PAGE_SIZE as u8).map(|i| i.wrapping_mul(3)).collect();
    let options = fast_options();

    let mut session =
        firmware::ProgrammingSession::enter(&mut client, 0x21, &options).unwrap();
    session.program_page(0x80, &page).unwrap();
    let read_back = session.read_page(0x80, page.len()).unwrap();
    session.leave().unwrap();

    assert_eq!(read_back, page);
    assert_eq!(client.stream_mut().leaves, 1);
}

#[test]
fn bootloader_info_reads_signature_and_version() {
    let mut client = BusClient::new(SimDevice::new(0x21));
    let info = firmware::bootloader_info(&mut client, 0x21, &fast_options()).unwrap();
    assert_eq!(info.signature, [0x1E, 0x95, 0x0F]);
    assert_eq!((info.sw_major, info.sw_minor), (4, 4));
    assert_eq!(client.stream_mut().leaves, 1);
}

#[test]
fn no_contact_fails_before_entering_bootloader() {
    let mut device = SimDevice::new(0x21);
    device.answer_contact = false;
    let mut client = BusClient::new(device);

    let err = firmware::bootloader_info(&mut client, 0x21, &fast_options()).unwrap_err();
    assert!(matches!(err, FlashError::NoContact(0x21)));
    assert!(client.stream_mut().mode == Mode::Bus);
    assert_eq!(client.stream_mut().leaves, 0);
}

#[test]
fn forced_sync_succeeds_once_device_answers() {
    let mut device = SimDevice::new(0x21);
    device.answer_contact = false; // stuck unit: normal protocol is gone
    device.sync_after = 9; // answers from the 10th probe on
    let mut client = BusClient::new(device);

    let options = FlashOptions { force_sync: true, ..fast_options() };
    let info = firmware::bootloader_info(&mut client, 0x21, &options).unwrap();
    assert_eq!(info.signature, [0x1E, 0x95, 0x0F]);
}

#[test]
fn forced_sync_exhausts_cleanly_when_device_never_answers() {
    let mut device = SimDevice::new(0x21);
    device.sync_after = u32::MAX;
    let mut client = BusClient::new(device);

    let options = FlashOptions { force_sync: true, sync_attempts: 5, ..fast_options() };
    let err = firmware::bootloader_info(&mut client, 0x21, &options).unwrap_err();
    assert!(matches!(err, FlashError::SyncFailed { attempts: 5 }));
}

#[test]
fn failed_page_program_still_leaves_programming_mode() {
    let mut device = SimDevice::new(0x21);
    device.fail_program = true;
    let mut client = BusClient::new(device);
    let image = test_image();

    let err = firmware::program(&mut client, 0x21, &image, &fast_options()).unwrap_err();
    assert!(matches!(err, FlashError::NotOk(_)));

    // The dropped session sent the leave command on the failure path
    let device = client.stream_mut();
    assert_eq!(device.leaves, 1);
    assert!(device.mode == Mode::Bus);
}
