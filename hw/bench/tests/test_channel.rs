// Licensed under the Apache-2.0 license

#[cfg(test)]
mod common;

use std::io::Write;
use std::net::{SocketAddr, TcpListener};
use std::path::Path;
use std::time::{Duration, Instant};

use common::{init_logger, MockBehavior, MockOpenOcd};
use hil_bench::openocd::{LedColor, OpenOcdChannel};
use hil_bench::{ChannelError, Platform, PlatformError, PlatformId};

const TIMEOUT: Duration = Duration::from_secs(5);

fn connect(mock: &MockOpenOcd) -> OpenOcdChannel {
    init_logger();
    OpenOcdChannel::connect(mock.addr(), TIMEOUT).unwrap()
}

#[test]
fn test_connect_refused() {
    let addr: SocketAddr = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };
    assert!(matches!(
        OpenOcdChannel::connect(addr, TIMEOUT),
        Err(ChannelError::Refused)
    ));
}

#[test]
fn test_command_is_acknowledged() {
    let mock = MockOpenOcd::start(MockBehavior::default());
    let mut channel = connect(&mock);
    assert!(channel.initialize());
    assert!(channel.set_platform_power(true));
    assert!(channel.set_spi_en(false));
    assert_eq!(
        mock.commands(),
        [
            "init",
            "ftdi set_signal PLTF_PWR_EN 1",
            "ftdi set_signal SPI_EN 0"
        ]
    );
}

#[test]
fn test_led_colors() {
    let mock = MockOpenOcd::start(MockBehavior::default());
    let mut channel = connect(&mock);
    assert!(channel.set_led(LedColor::Magenta));
    assert_eq!(
        mock.commands(),
        [
            "ftdi set_signal LED_R 1",
            "ftdi set_signal LED_G 0",
            "ftdi set_signal LED_B 1"
        ]
    );
}

#[test]
fn test_blink() {
    let mock = MockOpenOcd::start(MockBehavior::default());
    let mut channel = connect(&mock);
    assert!(channel.blink_led(LedColor::White, 3));
    let commands = mock.commands();
    assert_eq!(commands.len(), 3 * 2 * 3);
    assert_eq!(
        commands[3..6],
        [
            "ftdi set_signal LED_R 0",
            "ftdi set_signal LED_G 0",
            "ftdi set_signal LED_B 0"
        ]
    );
}

#[test]
fn test_spi_bus_state() {
    let free = MockOpenOcd::start(MockBehavior::default());
    assert!(connect(&free).is_spi_bus_free(TIMEOUT).unwrap());

    let busy = MockOpenOcd::start(MockBehavior {
        bus_busy: true,
        ..Default::default()
    });
    assert!(!connect(&busy).is_spi_bus_free(TIMEOUT).unwrap());
}

#[test]
fn test_unanswered_command_times_out() {
    let mock = MockOpenOcd::start(MockBehavior {
        ignore_prefix: Some("ftdi set_signal LED_G"),
        ..Default::default()
    });
    let mut channel = connect(&mock);
    channel.set_command_timeout(Duration::from_millis(300));

    let start = Instant::now();
    assert!(!channel.set_led(LedColor::Green));
    assert!(start.elapsed() < TIMEOUT);
    // The other two signals are still driven.
    assert_eq!(mock.commands().len(), 3);

    assert!(matches!(
        channel.recv_until("never", Duration::from_millis(200)),
        Err(ChannelError::Timeout(..))
    ));
}

#[test]
fn test_recv_line() {
    let mock = MockOpenOcd::start(MockBehavior::default());
    let mut channel = connect(&mock);
    channel.send_command("version", TIMEOUT).unwrap();
    assert_eq!(channel.recv_line(TIMEOUT).unwrap().trim(), "version");
}

#[test]
fn test_load_firmware() {
    let dir = tempfile::tempdir().unwrap();
    let firmware = dir.path().join("fw.elf");
    std::fs::write(&firmware, b"\x7fELF").unwrap();

    let mock = MockOpenOcd::start(MockBehavior::default());
    let mut channel = connect(&mock);
    let platform = PlatformId::Stm32F439zi.platform();
    platform.load_firmware(&mut channel, &firmware, TIMEOUT).unwrap();
    assert!(platform.reset(&mut channel));

    let expected = format!("program {} verify", firmware.canonicalize().unwrap().display());
    assert_eq!(mock.commands(), [expected.as_str(), "reset"]);
}

#[test]
fn test_unverified_firmware_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let firmware = dir.path().join("fw.elf");
    std::fs::write(&firmware, b"\x7fELF").unwrap();

    let mock = MockOpenOcd::start(MockBehavior {
        verify_fails: true,
        ..Default::default()
    });
    let mut channel = connect(&mock);
    let start = Instant::now();
    assert!(matches!(
        PlatformId::Stm32L432kc.platform().load_firmware(
            &mut channel,
            &firmware,
            Duration::from_millis(300)
        ),
        Err(PlatformError::VerifyFailed(ChannelError::Timeout(..)))
    ));
    assert!(start.elapsed() < TIMEOUT);
}

#[test]
fn test_load_missing_firmware() {
    let mock = MockOpenOcd::start(MockBehavior::default());
    let mut channel = connect(&mock);
    let platform = PlatformId::Stm32L432kc.platform();
    assert!(matches!(
        platform.load_firmware(&mut channel, Path::new("/nonexistent/fw.elf"), TIMEOUT),
        Err(PlatformError::Io(_))
    ));
    assert!(mock.commands().is_empty());
}

#[test]
fn test_disconnect_is_reported() {
    init_logger();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server = std::thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        stream.write_all(b"Open On-Chip Debugger\r\n> ").unwrap();
        // dropping the stream closes the connection
    });

    let mut channel = OpenOcdChannel::connect(addr, TIMEOUT).unwrap();
    server.join().unwrap();
    assert!(matches!(
        channel.recv_line(TIMEOUT),
        Err(ChannelError::Disconnected)
    ));
    assert!(!channel.initialize());
    channel.disconnect();
}
