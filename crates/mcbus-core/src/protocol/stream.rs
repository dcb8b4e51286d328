//! Byte stream abstraction
//!
//! The bus codec and the bootloader codec both run over the same duplex
//! byte stream; this trait is the capability they share. Timeouts are
//! per-call arguments rather than ambient stream state, so every operation
//! carries its own wait budget.

use serialport::SerialPort;
use std::io;
use std::time::{Duration, Instant};

/// A duplex byte stream with bounded reads
pub trait BusStream: Send {
    /// Write all bytes to the stream
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;

    /// Read up to `buf.len()` bytes, waiting at most `timeout`.
    ///
    /// Returns the number of bytes captured, which may be anything from 0
    /// (nothing arrived in time) to `buf.len()`. Never blocks past the
    /// budget.
    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize>;

    /// Discard any pending unread input
    fn clear_input(&mut self) -> io::Result<()>;
}

/// Serial port wrapper implementing [`BusStream`]
pub struct SerialChannel {
    port: Box<dyn SerialPort>,
}

impl SerialChannel {
    pub fn new(port: Box<dyn SerialPort>) -> Self {
        Self { port }
    }
}

impl BusStream for SerialChannel {
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.port.write_all(buf)?;
        self.port.flush()
    }

    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        let deadline = Instant::now() + timeout;
        let mut offset = 0;

        while offset < buf.len() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            // serialport enforces its own timeout per read call
            self.port
                .set_timeout(remaining)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

            match self.port.read(&mut buf[offset..]) {
                Ok(0) => break,
                Ok(n) => offset += n,
                Err(ref e)
                    if e.kind() == io::ErrorKind::TimedOut
                        || e.kind() == io::ErrorKind::WouldBlock =>
                {
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(offset)
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.port
            .clear(serialport::ClearBuffer::Input)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }
}
