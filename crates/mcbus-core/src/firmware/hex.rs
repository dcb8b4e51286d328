//! Intel HEX parsing
//!
//! Reads the standard text format (checksummed, offset-tagged `:` records)
//! into one contiguous memory image. Only single-segment images are
//! supported; gaps between data records are filled with 0xFF, the erased
//! flash value.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use thiserror::Error;

/// Errors from the Intel HEX parser, each naming the offending line
#[derive(Error, Debug)]
pub enum HexParseError {
    #[error("Line {line}: record does not start with ':'")]
    MissingColon { line: usize },

    #[error("Line {line}: invalid hex digits")]
    BadHexDigit { line: usize },

    #[error("Line {line}: record too short")]
    TooShort { line: usize },

    #[error("Line {line}: record checksum mismatch")]
    ChecksumMismatch { line: usize },

    #[error("Line {line}: declared data length does not match record")]
    LengthMismatch { line: usize },

    #[error("Line {line}: unhandled record type {record_type:#04x}")]
    UnknownRecordType { line: usize, record_type: u8 },

    #[error("Line {line}: data record overlaps already-loaded image")]
    NotContiguous { line: usize },

    #[error("Line {line}: record after end-of-file record")]
    DataAfterEof { line: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Kind of a HEX record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    /// 0x00: data bytes at an offset
    Data,
    /// 0x01: end of file, no records may follow
    EndOfFile,
    /// 0x03: segment address, accepted and ignored (single-segment images)
    ExtendedSegmentAddress,
}

/// One parsed HEX record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HexRecord {
    pub record_type: RecordType,
    pub offset: u16,
    pub data: Vec<u8>,
}

impl HexRecord {
    /// Parse one line; `line` is the 0-based line number used in errors
    pub fn parse(text: &str, line: usize) -> Result<Self, HexParseError> {
        let text = text.trim_end();
        let hex = text
            .strip_prefix(':')
            .ok_or(HexParseError::MissingColon { line })?;
        let bytes = decode_hex(hex, line)?;
        if bytes.len() < 5 {
            return Err(HexParseError::TooShort { line });
        }

        // Two's complement of the sum of everything before the final byte
        let expected =
            (crate::protocol::checksum(&bytes[..bytes.len() - 1]) ^ 0xFF).wrapping_add(1);
        if expected != bytes[bytes.len() - 1] {
            return Err(HexParseError::ChecksumMismatch { line });
        }

        let length = bytes[0] as usize;
        let offset = u16::from(bytes[1]) << 8 | u16::from(bytes[2]);
        let record_type = match bytes[3] {
            0x00 => RecordType::Data,
            0x01 => RecordType::EndOfFile,
            0x03 => RecordType::ExtendedSegmentAddress,
            other => {
                return Err(HexParseError::UnknownRecordType { line, record_type: other })
            }
        };
        let data = bytes[4..bytes.len() - 1].to_vec();
        if data.len() != length {
            return Err(HexParseError::LengthMismatch { line });
        }

        Ok(Self { record_type, offset, data })
    }
}

fn decode_hex(hex: &str, line: usize) -> Result<Vec<u8>, HexParseError> {
    if hex.len() % 2 != 0 || !hex.is_ascii() {
        return Err(HexParseError::BadHexDigit { line });
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&hex[i..i + 2], 16)
                .map_err(|_| HexParseError::BadHexDigit { line })
        })
        .collect()
}

/// A contiguous byte image built from ordered data records
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryImage {
    origin: u16,
    data: Vec<u8>,
}

impl MemoryImage {
    /// Parse a HEX file from disk
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, HexParseError> {
        Self::from_reader(BufReader::new(File::open(path)?))
    }

    /// Parse HEX records from any line source
    pub fn from_reader<R: BufRead>(reader: R) -> Result<Self, HexParseError> {
        let mut image = Self::default();
        let mut first_data = true;
        let mut eof_found = false;

        for (line_no, line) in reader.lines().enumerate() {
            let line = line?;
            if eof_found {
                return Err(HexParseError::DataAfterEof { line: line_no });
            }
            let record = HexRecord::parse(&line, line_no)?;
            match record.record_type {
                RecordType::EndOfFile => eof_found = true,
                RecordType::ExtendedSegmentAddress => {}
                RecordType::Data => {
                    if first_data {
                        image.origin = record.offset;
                        first_data = false;
                    }
                    let end = u32::from(image.origin) + image.data.len() as u32;
                    let offset = u32::from(record.offset);
                    if offset < end {
                        return Err(HexParseError::NotContiguous { line: line_no });
                    }
                    // Fill any hole before this record with erased flash
                    image.data.resize((offset - u32::from(image.origin)) as usize, 0xFF);
                    image.data.extend_from_slice(&record.data);
                }
            }
        }
        Ok(image)
    }

    /// Offset of the first data record
    pub fn origin(&self) -> u16 {
        self.origin
    }

    /// The image bytes
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Image length in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True for an image with no data records
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Iterate the image in page-sized chunks as `(byte_address, page)`.
    ///
    /// Programming always starts at flash address 0; the record origin only
    /// anchors gap filling during parsing.
    pub fn pages(&self, page_size: usize) -> impl Iterator<Item = (usize, &[u8])> {
        self.data
            .chunks(page_size.max(1))
            .enumerate()
            .map(move |(i, chunk)| (i * page_size.max(1), chunk))
    }
}
