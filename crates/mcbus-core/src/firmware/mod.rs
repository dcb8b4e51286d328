//! Firmware update engine
//!
//! Puts one unit into its bootloader, programs or verifies flash page by
//! page from an Intel HEX image, and always returns the unit to the normal
//! bus protocol afterwards.

pub mod bootloader;
pub mod hex;

use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

pub use bootloader::{stk, ProgrammingSession, MAX_PAGE_BYTES};
pub use hex::{HexParseError, HexRecord, MemoryImage, RecordType};

use crate::protocol::{BusClient, BusStream, ProtocolError};

/// Page size used when chunking an image for transfer
pub const PAGE_SIZE: usize = 128;

/// Errors from the firmware engine
#[derive(Error, Debug)]
pub enum FlashError {
    #[error("No contact with unit {0:#04x}")]
    NoContact(u8),

    #[error("Bootloader sync failed after {attempts} attempts")]
    SyncFailed { attempts: u32 },

    #[error("Short bootloader reply: expected {expected} bytes, got {got}")]
    ShortReply { expected: usize, got: usize },

    #[error("Bootloader reply not in sync: {0}")]
    NotInSync(String),

    #[error("Bootloader reply not OK: {0}")]
    NotOk(String),

    #[error("Page of {0} bytes exceeds the bootloader transfer limit")]
    PageTooLarge(usize),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Hex(#[from] HexParseError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Options controlling a programming session
#[derive(Debug, Clone)]
pub struct FlashOptions {
    /// Skip the contact check and probe for the bootloader for up to
    /// `sync_attempts` seconds; used to recover a unit stuck in its
    /// bootloader, with a human resetting the device while the loop runs
    pub force_sync: bool,
    /// Broadcast-silence every other unit before entering programming mode
    pub silence_others: bool,
    /// Bootloader boot time to wait before the sync handshake
    pub settle_delay: Duration,
    /// Attempts of the forced sync loop, one second each
    pub sync_attempts: u32,
    /// Bytes per page transfer
    pub page_size: usize,
    /// Pause between entering programming mode and bulk page I/O
    pub command_delay: Duration,
}

impl Default for FlashOptions {
    fn default() -> Self {
        Self {
            force_sync: false,
            silence_others: true,
            settle_delay: Duration::from_millis(500),
            sync_attempts: 30,
            page_size: PAGE_SIZE,
            command_delay: Duration::from_millis(200),
        }
    }
}

/// Signature and bootloader version of a unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BootloaderInfo {
    pub signature: [u8; 3],
    pub sw_major: u8,
    pub sw_minor: u8,
}

/// Result of comparing flash contents against an image
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    /// Bytes read back and compared
    pub bytes_checked: usize,
    /// Byte address of the first difference, if any
    pub first_mismatch: Option<usize>,
}

impl VerifyReport {
    /// True when flash matched the image byte for byte
    pub fn matches(&self) -> bool {
        self.first_mismatch.is_none()
    }
}

/// Read the device signature and bootloader version of one unit
pub fn bootloader_info<S: BusStream>(
    client: &mut BusClient<S>,
    address: u8,
    options: &FlashOptions,
) -> Result<BootloaderInfo, FlashError> {
    let mut session = ProgrammingSession::enter(client, address, options)?;
    std::thread::sleep(options.command_delay);
    let signature = session.read_signature()?;
    let (sw_major, sw_minor) = session.sw_version()?;
    session.leave()?;
    Ok(BootloaderInfo { signature, sw_major, sw_minor })
}

/// Program a unit's flash from a parsed image, page by page
pub fn program<S: BusStream>(
    client: &mut BusClient<S>,
    address: u8,
    image: &MemoryImage,
    options: &FlashOptions,
) -> Result<(), FlashError> {
    let mut session = ProgrammingSession::enter(client, address, options)?;
    std::thread::sleep(options.command_delay);

    info!(address, bytes = image.len(), "programming");
    for (page_address, page) in image.pages(options.page_size) {
        session.program_page(page_address, page)?;
        debug!(written = page_address + page.len(), total = image.len(), "progress");
    }
    session.leave()?;
    info!(address, "programming done");
    Ok(())
}

/// Read a unit's flash back and compare it against a parsed image
pub fn verify<S: BusStream>(
    client: &mut BusClient<S>,
    address: u8,
    image: &MemoryImage,
    options: &FlashOptions,
) -> Result<VerifyReport, FlashError> {
    let mut session = ProgrammingSession::enter(client, address, options)?;
    std::thread::sleep(options.command_delay);

    let mut read_back = Vec::with_capacity(image.len());
    for (page_address, page) in image.pages(options.page_size) {
        read_back.extend(session.read_page(page_address, page.len())?);
    }
    session.leave()?;

    let first_mismatch = image
        .data()
        .iter()
        .zip(read_back.iter())
        .position(|(a, b)| a != b)
        .or_else(|| (read_back.len() < image.len()).then_some(read_back.len()));

    Ok(VerifyReport { bytes_checked: read_back.len(), first_mismatch })
}
