// Licensed under the Apache-2.0 license

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::{Duration, Instant};

use log::{debug, error, warn};

use super::telnet::TelnetFilter;
use crate::error::ChannelError;

pub const DEFAULT_TELNET_PORT: u16 = 4444;
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

const PROMPT: u8 = b'>';
const BLINK_PHASE: Duration = Duration::from_millis(100);
const SPI_BUS_SIGNAL: &str = "Signal SPI_EN_BUS =";
const SPI_BUS_FREE: &str = "Signal SPI_EN_BUS = 000000";

/// Status LED color on the adapter, as a 3-bit RGB mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedColor {
    Black = 0,
    Red = 1,
    Green = 2,
    Yellow = 3,
    Blue = 4,
    Magenta = 5,
    Cyan = 6,
    White = 7,
}

impl LedColor {
    fn signals(self) -> [(&'static str, bool); 3] {
        let mask = self as u8;
        [
            ("LED_R", mask & 1 != 0),
            ("LED_G", mask & 2 != 0),
            ("LED_B", mask & 4 != 0),
        ]
    }
}

fn remaining(deadline: Instant) -> Option<Duration> {
    deadline
        .checked_duration_since(Instant::now())
        .filter(|d| !d.is_zero())
}

fn is_timeout(e: &std::io::Error) -> bool {
    matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

/// Line-oriented connection to the OpenOCD telnet command port.
///
/// Every call blocks for at most its deadline. Responses are matched by
/// substring, so unrelated output preceding the expected line is skipped.
pub struct OpenOcdChannel {
    stream: TcpStream,
    filter: TelnetFilter,
    pending: Vec<u8>,
    command_timeout: Duration,
}

impl OpenOcdChannel {
    /// Connects and waits for the first command prompt.
    pub fn connect(addr: SocketAddr, timeout: Duration) -> Result<Self, ChannelError> {
        let stream = TcpStream::connect_timeout(&addr, timeout).map_err(|e| match e.kind() {
            ErrorKind::ConnectionRefused => ChannelError::Refused,
            _ if is_timeout(&e) => ChannelError::Timeout(timeout, "connection"),
            _ => ChannelError::Io(e),
        })?;
        stream.set_nodelay(true)?;

        let mut channel = Self {
            stream,
            filter: TelnetFilter::new(),
            pending: vec![],
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        };
        channel.wait_for_prompt(timeout)?;
        debug!("Connected to OpenOCD at {addr}");
        Ok(channel)
    }

    pub fn set_command_timeout(&mut self, timeout: Duration) {
        self.command_timeout = timeout;
    }

    /// Reads more filtered payload into `pending`, waiting until `deadline`.
    fn fill(
        &mut self,
        deadline: Instant,
        what: &'static str,
        total: Duration,
    ) -> Result<(), ChannelError> {
        let mut buf = [0u8; 1024];
        loop {
            let left = remaining(deadline).ok_or(ChannelError::Timeout(total, what))?;
            self.stream.set_read_timeout(Some(left))?;
            match self.stream.read(&mut buf) {
                Ok(0) => return Err(ChannelError::Disconnected),
                Ok(n) => {
                    let before = self.pending.len();
                    self.filter.feed(&buf[..n], &mut self.pending);
                    if self.pending.len() > before {
                        return Ok(());
                    }
                }
                Err(e) if is_timeout(&e) || e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn wait_for_prompt(&mut self, timeout: Duration) -> Result<(), ChannelError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(pos) = self.pending.iter().position(|&b| b == PROMPT) {
                self.pending.drain(..=pos);
                return Ok(());
            }
            self.fill(deadline, "prompt", timeout)?;
        }
    }

    /// Writes one command line.
    pub fn send_command(&mut self, text: &str, timeout: Duration) -> Result<(), ChannelError> {
        debug!("openocd <- {text}");
        self.stream.set_write_timeout(Some(timeout))?;
        let mut line = text.trim_end().to_string();
        line.push('\n');
        let result = self
            .stream
            .write_all(line.as_bytes())
            .and_then(|_| self.stream.flush());
        match result {
            Ok(()) => Ok(()),
            Err(e) if is_timeout(&e) => Err(ChannelError::Timeout(timeout, "command send")),
            Err(e) if e.kind() == ErrorKind::BrokenPipe => Err(ChannelError::Disconnected),
            Err(e) => Err(e.into()),
        }
    }

    fn take_line(&mut self) -> Option<String> {
        let pos = self.pending.iter().position(|&b| b == b'\n')?;
        let raw: Vec<u8> = self.pending.drain(..=pos).collect();
        Some(String::from_utf8_lossy(&raw).trim_end().to_string())
    }

    /// Reads one response line, without its terminator.
    pub fn recv_line(&mut self, timeout: Duration) -> Result<String, ChannelError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(line) = self.take_line() {
                return Ok(line);
            }
            self.fill(deadline, "response line", timeout)?;
        }
    }

    /// Reads lines until one contains `needle`, and returns that line. The
    /// timeout covers the whole exchange, not each line.
    pub fn recv_until(&mut self, needle: &str, timeout: Duration) -> Result<String, ChannelError> {
        let deadline = Instant::now() + timeout;
        loop {
            let line = match self.take_line() {
                Some(line) => line,
                None => {
                    self.fill(deadline, "expected response", timeout)?;
                    continue;
                }
            };
            if !line.is_empty() {
                debug!("openocd -> {line}");
            }
            if line.contains(needle) {
                return Ok(line);
            }
        }
    }

    /// Sends a command and waits for the bridge to echo it back.
    pub fn command(&mut self, text: &str) -> bool {
        let timeout = self.command_timeout;
        if let Err(e) = self.send_command(text, timeout) {
            error!("Sending `{text}` to OpenOCD failed: {e}");
            return false;
        }
        match self.recv_until(text.trim(), timeout) {
            Ok(_) => true,
            Err(e) => {
                error!("No acknowledgement of `{text}` from OpenOCD: {e}");
                false
            }
        }
    }

    pub fn set_signal(&mut self, signal: &str, high: bool) -> bool {
        self.command(&format!("ftdi set_signal {signal} {}", u8::from(high)))
    }

    pub fn set_led(&mut self, color: LedColor) -> bool {
        color
            .signals()
            .iter()
            .fold(true, |ok, &(signal, on)| self.set_signal(signal, on) && ok)
    }

    pub fn blink_led(&mut self, color: LedColor, count: usize) -> bool {
        let mut ok = true;
        for _ in 0..count {
            ok &= self.set_led(color);
            std::thread::sleep(BLINK_PHASE);
            ok &= self.set_led(LedColor::Black);
            std::thread::sleep(BLINK_PHASE);
        }
        ok
    }

    pub fn initialize(&mut self) -> bool {
        self.command("init")
    }

    /// Drives the signal that connects this board to the shared SPI bus.
    pub fn set_spi_en(&mut self, enabled: bool) -> bool {
        self.set_signal("SPI_EN", enabled)
    }

    /// Asks whether any board currently drives the shared SPI bus. The
    /// bridge may take up to `timeout` to report the signal.
    pub fn is_spi_bus_free(&mut self, timeout: Duration) -> Result<bool, ChannelError> {
        self.send_command("ftdi get_signal SPI_EN_BUS", self.command_timeout)?;
        let line = self.recv_until(SPI_BUS_SIGNAL, timeout)?;
        Ok(line.contains(SPI_BUS_FREE))
    }

    pub fn set_platform_power(&mut self, on: bool) -> bool {
        self.set_signal("PLTF_PWR_EN", on)
    }

    pub fn disconnect(self) {
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            warn!("Closing the OpenOCD connection: {e}");
        }
    }
}
