// Licensed under the Apache-2.0 license

use std::io::Read;
use std::time::Duration;

use log::info;

use crate::adapter::{find_serial_device, AdapterId};
use crate::error::BenchError;

pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Default read timeout of the underlying port. The classifier checks its
/// deadlines and the cancel flag at least this often.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Source of the board's diagnostic output.
pub trait SerialLink {
    /// Opens the link. A read that waits longer than `poll_interval` must
    /// return `TimedOut` or `WouldBlock`; `Ok(0)` means the link is gone.
    fn open(&self, poll_interval: Duration) -> Result<Box<dyn Read + Send>, BenchError>;
}

/// UART exposed by the debug adapter over USB.
#[derive(Debug, Clone)]
pub struct UsbUart {
    pub path: String,
    pub baud_rate: u32,
}

impl UsbUart {
    /// The TS11 adapter exposes JTAG on interface 0 and the board UART on
    /// interface 1.
    pub const TS11_UART_INTERFACE: u8 = 1;

    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            baud_rate: DEFAULT_BAUD_RATE,
        }
    }

    pub fn find(adapter: &AdapterId, interface: Option<u8>) -> Result<Self, BenchError> {
        let path = find_serial_device(adapter.vid, adapter.pid, interface)?;
        info!("Using serial port {path} for adapter {adapter}");
        Ok(Self::new(path))
    }
}

impl SerialLink for UsbUart {
    fn open(&self, poll_interval: Duration) -> Result<Box<dyn Read + Send>, BenchError> {
        let mut port = serialport::new(&self.path, self.baud_rate)
            .timeout(poll_interval)
            .open_native()?;
        port.set_exclusive(true)?;
        Ok(Box::new(port))
    }
}
