//! Serial port handling
//!
//! Low-level serial port access for the bus.

use serialport::{SerialPort, SerialPortInfo, SerialPortType};
use std::time::Duration;

use super::{ProtocolError, DEFAULT_BAUD_RATE};

/// Information about an available serial port
#[derive(Debug, Clone)]
pub struct PortInfo {
    /// Port name (e.g., "/dev/ttyUSB0" or "COM3")
    pub name: String,

    /// USB vendor ID (if USB device)
    pub vid: Option<u16>,

    /// USB product ID (if USB device)
    pub pid: Option<u16>,

    /// Product name (if available)
    pub product: Option<String>,
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        let (vid, pid, product) = match info.port_type {
            SerialPortType::UsbPort(usb_info) => {
                (Some(usb_info.vid), Some(usb_info.pid), usb_info.product)
            }
            _ => (None, None, None),
        };

        Self { name: info.port_name, vid, pid, product }
    }
}

/// Sort key so ttyACM* ports come first, then ttyUSB*, then the rest,
/// each group ordered numerically by suffix
fn port_sort_key(name: &str) -> (u8, usize, String) {
    let basename = name.rsplit('/').next().unwrap_or(name);
    if let Some(rest) = basename.strip_prefix("ttyACM") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (0, num, basename.to_string());
    }
    if let Some(rest) = basename.strip_prefix("ttyUSB") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (1, num, basename.to_string());
    }
    (2, 0, basename.to_string())
}

/// List available serial ports in deterministic order
pub fn list_ports() -> Vec<PortInfo> {
    let mut ports: Vec<PortInfo> = serialport::available_ports()
        .unwrap_or_default()
        .into_iter()
        .map(PortInfo::from)
        .collect();
    ports.sort_by_key(|p| port_sort_key(&p.name));
    ports
}

/// Open a serial port for bus communication
pub fn open_port(name: &str, baud_rate: Option<u32>) -> Result<Box<dyn SerialPort>, ProtocolError> {
    let baud = baud_rate.unwrap_or(DEFAULT_BAUD_RATE);

    serialport::new(name, baud)
        .data_bits(serialport::DataBits::Eight)
        .parity(serialport::Parity::None)
        .stop_bits(serialport::StopBits::One)
        .timeout(Duration::from_millis(100))
        .open()
        .map_err(|e| match e.kind {
            serialport::ErrorKind::NoDevice => ProtocolError::PortNotFound(name.to_string()),
            _ => ProtocolError::Serial(e.to_string()),
        })
}
