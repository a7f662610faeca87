// Licensed under the Apache-2.0 license

//! One complete hardware test run.
//!
//! The run is sequenced by an explicit state machine. Every step either
//! advances it or aborts straight to `Failed`. Once the bench lock is held
//! the shutdown pass (LED, power off, bridge restart with the shutdown
//! configuration) always runs before the lock is given back.

use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use smlang::statemachine;

use crate::adapter::{load_adapter_id, AdapterId};
use crate::classifier::{MonitorEnd, SerialClassifier, TestVerdict};
use crate::error::{BenchError, ConfigError, LockError, SessionError};
use crate::lock::DeviceLock;
use crate::openocd::{
    LedColor, OpenOcdChannel, OpenOcdProcess, DEFAULT_COMMAND_TIMEOUT, TERMINATE_GRACE,
};
use crate::platform::{BoardPlatform, Platform, PlatformId};
use crate::serial::{SerialLink, POLL_INTERVAL};

pub const TRANSCRIPT_FILE: &str = "serial.log";

statemachine! {
    derive_states: [Clone, Copy, Debug],
    derive_events: [Clone, Copy, Debug],
    transitions: {
        *Init + LockTaken = LockAcquired,
        LockAcquired + BridgeStarted = BridgeLaunched,
        BridgeLaunched + ChannelOpen = Connected,
        Connected + BridgeReady = Initialized,
        Initialized + BusFree = BusChecked,
        BusChecked + PowerOn = Powered,
        Powered + FirmwareVerified = Flashed,
        Flashed + BoardReset = Monitoring,
        Monitoring + TestPassed = Passed,
        Monitoring + TestFailed = Failed,

        _ + Abort = Failed
    }
}

/// State machine extended variables.
pub struct SessionContext;

impl StateMachineContext for SessionContext {}

/// Inputs of a run as given by the operator.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub platform: String,
    pub firmware: PathBuf,
    pub work_dir: PathBuf,
    pub mapping_config: PathBuf,
    pub adapter_config: PathBuf,
    pub adapter_shutdown_config: PathBuf,
    pub message_timeout: Option<Duration>,
    pub total_timeout: Option<Duration>,
    pub openocd: Option<PathBuf>,
    pub lock_file: PathBuf,
    pub telnet_port: u16,
}

/// Fixed intervals of the run.
#[derive(Debug, Clone, Copy)]
pub struct Timings {
    /// Time OpenOCD gets to come up before it is checked and connected to.
    pub settle: Duration,
    pub connect: Duration,
    /// Acknowledgement of a single bridge command.
    pub command: Duration,
    /// Programming plus verification of a full image can take a while on
    /// the slower parts.
    pub verify: Duration,
    pub bus_query: Duration,
    /// How long the shutdown-only bridge may run before it is stopped.
    pub shutdown_wait: Duration,
    /// Time a bridge gets to exit after SIGTERM before it is killed.
    pub terminate_grace: Duration,
    /// Read timeout of the serial port.
    pub serial_poll: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            settle: Duration::from_secs(2),
            connect: Duration::from_secs(5),
            command: DEFAULT_COMMAND_TIMEOUT,
            verify: Duration::from_secs(30),
            bus_query: Duration::from_secs(30),
            shutdown_wait: Duration::from_secs(5),
            terminate_grace: TERMINATE_GRACE,
            serial_poll: POLL_INTERVAL,
        }
    }
}

/// Fully validated configuration of one run.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub platform: PlatformId,
    pub firmware: PathBuf,
    pub work_dir: PathBuf,
    pub adapter: AdapterId,
    pub adapter_config: PathBuf,
    pub adapter_shutdown_config: PathBuf,
    pub openocd: PathBuf,
    pub lock_file: PathBuf,
    pub telnet_port: u16,
    pub message_timeout: Option<Duration>,
    pub total_timeout: Option<Duration>,
    pub timings: Timings,
}

fn require_file(what: &'static str, path: &Path) -> Result<(), ConfigError> {
    if !path.exists() {
        Err(ConfigError::MissingFile {
            what,
            path: path.to_path_buf(),
        })
    } else if !path.is_file() {
        Err(ConfigError::NotAFile {
            what,
            path: path.to_path_buf(),
        })
    } else {
        Ok(())
    }
}

impl SessionConfig {
    /// Validates everything that can be checked without touching the bench.
    pub fn resolve(opts: RunOptions) -> Result<Self, BenchError> {
        let platform: PlatformId = opts.platform.parse()?;
        require_file("firmware", &opts.firmware)?;
        if opts.work_dir.is_file() {
            return Err(ConfigError::WorkDirIsFile(opts.work_dir).into());
        }
        require_file("adapter mapping", &opts.mapping_config)?;
        require_file("adapter configuration", &opts.adapter_config)?;
        require_file(
            "adapter shutdown configuration",
            &opts.adapter_shutdown_config,
        )?;
        let adapter = load_adapter_id(&opts.mapping_config, platform.name())?;
        let openocd = OpenOcdProcess::locate(opts.openocd.as_deref())?;

        Ok(Self {
            platform,
            firmware: opts.firmware.canonicalize()?,
            work_dir: opts.work_dir,
            adapter,
            adapter_config: opts.adapter_config,
            adapter_shutdown_config: opts.adapter_shutdown_config,
            openocd,
            lock_file: opts.lock_file,
            telnet_port: opts.telnet_port,
            message_timeout: opts.message_timeout,
            total_timeout: opts.total_timeout,
            timings: Timings::default(),
        })
    }

    fn adapter_args(&self, config: &Path) -> Vec<String> {
        let mut args = vec![
            "-f".to_string(),
            config.display().to_string(),
            "-c".to_string(),
            format!("ftdi vid_pid {:#x} {:#x}", self.adapter.vid, self.adapter.pid),
        ];
        if self.telnet_port != crate::openocd::DEFAULT_TELNET_PORT {
            args.push("-c".into());
            args.push(format!("telnet_port {}", self.telnet_port));
        }
        args
    }

    /// OpenOCD arguments for the test itself.
    pub fn bridge_args(&self, platform: &impl Platform) -> Vec<String> {
        let mut args = self.adapter_args(&self.adapter_config);
        args.extend(platform.launch_params());
        args
    }

    /// OpenOCD arguments for the shutdown-only pass.
    pub fn shutdown_args(&self) -> Vec<String> {
        self.adapter_args(&self.adapter_shutdown_config)
    }
}

/// Resources acquired along the way. Released in reverse order by the
/// shutdown pass.
#[derive(Default)]
struct Resources {
    lock: Option<DeviceLock>,
    bridge: Option<OpenOcdProcess>,
    channel: Option<OpenOcdChannel>,
    port: Option<Box<dyn Read + Send>>,
}

pub struct Session<S: SerialLink> {
    config: SessionConfig,
    platform: BoardPlatform,
    serial: S,
}

impl<S: SerialLink> Session<S> {
    pub fn new(config: SessionConfig, serial: S) -> Result<Self, BenchError> {
        std::fs::create_dir_all(&config.work_dir)?;
        Ok(Self {
            platform: config.platform.platform(),
            config,
            serial,
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Runs the test. `Ok` carries the verdict; errors are reserved for
    /// operator interrupts and failures that are not the firmware's fault.
    pub fn run(&mut self, cancel: &AtomicBool) -> Result<TestVerdict, SessionError> {
        let mut state_machine = StateMachine::new(SessionContext);
        let mut res = Resources::default();
        let mut fatal: Option<SessionError> = None;
        let mut interrupted = false;
        let mut prev_state = *state_machine.state();

        loop {
            let state = *state_machine.state();
            if state != prev_state {
                debug!("Session {prev_state:?} -> {state:?}");
                prev_state = state;
            }

            let event = match state {
                States::Passed | States::Failed => break,
                _ if cancel.load(Ordering::Relaxed) => {
                    warn!("Interrupted in state {state:?}");
                    interrupted = true;
                    Events::Abort
                }
                States::Init => self.take_lock(&mut res, &mut fatal),
                States::LockAcquired => self.launch_bridge(&mut res, cancel),
                States::BridgeLaunched => self.connect(&mut res),
                States::Connected => self.initialize(&mut res),
                States::Initialized => self.check_bus(&mut res),
                States::BusChecked => self.power_on(&mut res),
                States::Powered => self.flash(&mut res),
                States::Flashed => self.reset_board(&mut res, &mut fatal),
                States::Monitoring => {
                    let (event, end) = self.monitor(&mut res, cancel);
                    interrupted |= end == MonitorEnd::Interrupted;
                    event
                }
            };
            if state_machine.process_event(event).is_err() {
                error!("Invalid session transition {event:?} in state {state:?}");
                let _ = state_machine.process_event(Events::Abort);
            }
        }

        let verdict = match state_machine.state() {
            States::Passed => TestVerdict::Passed,
            _ => TestVerdict::Failed,
        };
        if res.lock.is_some() {
            self.shutdown(&mut res, verdict);
        }

        if interrupted {
            return Err(SessionError::Interrupted);
        }
        if let Some(e) = fatal {
            return Err(e);
        }
        info!("Test {verdict}");
        Ok(verdict)
    }

    fn take_lock(&self, res: &mut Resources, fatal: &mut Option<SessionError>) -> Events {
        match DeviceLock::acquire(&self.config.lock_file) {
            Ok(lock) => {
                res.lock = Some(lock);
                Events::LockTaken
            }
            Err(LockError::AlreadyLocked) => {
                error!("Device is in use by another test run");
                Events::Abort
            }
            Err(e) => {
                error!("Cannot take the device lock: {e}");
                *fatal = Some(BenchError::from(e).into());
                Events::Abort
            }
        }
    }

    fn launch_bridge(&self, res: &mut Resources, cancel: &AtomicBool) -> Events {
        let args = self.config.bridge_args(&self.platform);
        let mut bridge = match OpenOcdProcess::launch(&self.config.openocd, &args) {
            Ok(bridge) => bridge,
            Err(e) => {
                error!("Cannot start OpenOCD: {e}");
                return Events::Abort;
            }
        };
        bridge.set_terminate_grace(self.config.timings.terminate_grace);
        sleep_unless_cancelled(self.config.timings.settle, cancel);
        let running = bridge.is_running();
        res.bridge = Some(bridge);
        if !running {
            error!("OpenOCD exited during start-up, check the adapter connection");
            return Events::Abort;
        }
        Events::BridgeStarted
    }

    fn connect(&self, res: &mut Resources) -> Events {
        let addr = SocketAddr::from(([127, 0, 0, 1], self.config.telnet_port));
        match OpenOcdChannel::connect(addr, self.config.timings.connect) {
            Ok(mut channel) => {
                channel.set_command_timeout(self.config.timings.command);
                res.channel = Some(channel);
                Events::ChannelOpen
            }
            Err(e) => {
                error!("Cannot connect to OpenOCD at {addr}: {e}");
                Events::Abort
            }
        }
    }

    fn initialize(&self, res: &mut Resources) -> Events {
        let Some(channel) = res.channel.as_mut() else {
            return Events::Abort;
        };
        if !channel.initialize() {
            warn!("OpenOCD init was not acknowledged, continuing");
        }
        Events::BridgeReady
    }

    fn check_bus(&self, res: &mut Resources) -> Events {
        let Some(channel) = res.channel.as_mut() else {
            return Events::Abort;
        };
        match channel.is_spi_bus_free(self.config.timings.bus_query) {
            Ok(true) => Events::BusFree,
            Ok(false) => {
                error!(
                    "SPI bus is already occupied! Check that all other platform boards \
                     have SPI access disabled"
                );
                Events::Abort
            }
            Err(e) => {
                error!("Cannot query the SPI bus state: {e}");
                Events::Abort
            }
        }
    }

    fn power_on(&self, res: &mut Resources) -> Events {
        let Some(channel) = res.channel.as_mut() else {
            return Events::Abort;
        };
        if !channel.set_spi_en(true) {
            error!("Cannot connect the platform to the SPI bus");
            return Events::Abort;
        }
        if !channel.set_platform_power(true) {
            error!("Cannot power the platform");
            return Events::Abort;
        }
        if !(channel.blink_led(LedColor::White, 3) && channel.set_led(LedColor::White)) {
            warn!("Status LED did not respond");
        }
        Events::PowerOn
    }

    fn flash(&self, res: &mut Resources) -> Events {
        let Some(channel) = res.channel.as_mut() else {
            return Events::Abort;
        };
        let verify_timeout = self.config.timings.verify;
        match self
            .platform
            .load_firmware(channel, &self.config.firmware, verify_timeout)
        {
            Ok(()) => Events::FirmwareVerified,
            Err(e) => {
                error!("Loading firmware failed: {e}");
                Events::Abort
            }
        }
    }

    fn reset_board(&self, res: &mut Resources, fatal: &mut Option<SessionError>) -> Events {
        // The port is opened before the reset so no early output is lost.
        match self.serial.open(self.config.timings.serial_poll) {
            Ok(port) => res.port = Some(port),
            Err(e) => {
                error!("Cannot open the platform serial port: {e}");
                *fatal = Some(e.into());
                return Events::Abort;
            }
        }
        let Some(channel) = res.channel.as_mut() else {
            return Events::Abort;
        };
        if !self.platform.reset(channel) {
            error!("Platform reset failed");
            return Events::Abort;
        }
        Events::BoardReset
    }

    fn monitor(&self, res: &mut Resources, cancel: &AtomicBool) -> (Events, MonitorEnd) {
        let Some(mut port) = res.port.take() else {
            return (Events::Abort, MonitorEnd::PortClosed);
        };
        let transcript_path = self.config.work_dir.join(TRANSCRIPT_FILE);
        let mut transcript = match File::create(&transcript_path) {
            Ok(f) => Some(BufWriter::new(f)),
            Err(e) => {
                warn!("Cannot create {}: {e}", transcript_path.display());
                None
            }
        };

        let classifier =
            SerialClassifier::new(self.config.message_timeout, self.config.total_timeout);
        let report = classifier.run(
            &mut port,
            cancel,
            transcript.as_mut().map(|t| t as &mut dyn Write),
        );
        // An interrupted run has no verdict of its own, whatever was seen so far.
        let event = match (report.end, report.verdict()) {
            (MonitorEnd::Interrupted, _) => Events::Abort,
            (_, TestVerdict::Passed) => Events::TestPassed,
            (_, TestVerdict::Failed) => Events::TestFailed,
        };
        (event, report.end)
    }

    fn shutdown(&self, res: &mut Resources, verdict: TestVerdict) {
        info!("Shutting down the platform");
        res.port = None;
        if let Some(mut channel) = res.channel.take() {
            let color = match verdict {
                TestVerdict::Passed => LedColor::Green,
                TestVerdict::Failed => LedColor::Red,
            };
            if !channel.set_led(color) {
                warn!("Status LED did not respond");
            }
            if !channel.set_platform_power(false) {
                error!("Cannot power off the platform");
            }
            channel.disconnect();
        }
        if let Some(mut bridge) = res.bridge.take() {
            bridge.cleanup();
        }

        // Restarting the bridge with the shutdown configuration puts every
        // adapter signal back into its idle state.
        match OpenOcdProcess::launch(&self.config.openocd, self.config.shutdown_args()) {
            Ok(mut bridge) => {
                bridge.set_terminate_grace(self.config.timings.terminate_grace);
                if !bridge.wait_timeout(self.config.timings.shutdown_wait) {
                    debug!("Shutdown OpenOCD still running, stopping it");
                }
                bridge.cleanup();
            }
            Err(e) => error!("Cannot run the OpenOCD shutdown configuration: {e}"),
        }

        if let Some(mut lock) = res.lock.take() {
            lock.release();
        }
    }
}

fn sleep_unless_cancelled(duration: Duration, cancel: &AtomicBool) {
    let deadline = Instant::now() + duration;
    while !cancel.load(Ordering::Relaxed) {
        let Some(left) = deadline.checked_duration_since(Instant::now()) else {
            return;
        };
        std::thread::sleep(left.min(Duration::from_millis(50)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SessionConfig {
        SessionConfig {
            platform: PlatformId::Stm32L432kc,
            firmware: "/fw/test.elf".into(),
            work_dir: "/tmp/work".into(),
            adapter: AdapterId {
                vid: 0x0403,
                pid: 0x6011,
            },
            adapter_config: "/cfg/ts11-jtag.cfg".into(),
            adapter_shutdown_config: "/cfg/ts11-jtag-shutdown.cfg".into(),
            openocd: "/usr/bin/openocd".into(),
            lock_file: "/tmp/lock".into(),
            telnet_port: 4444,
            message_timeout: None,
            total_timeout: None,
            timings: Timings::default(),
        }
    }

    #[test]
    fn test_bridge_args() {
        let config = config();
        assert_eq!(
            config.bridge_args(&config.platform.platform()),
            [
                "-f",
                "/cfg/ts11-jtag.cfg",
                "-c",
                "ftdi vid_pid 0x403 0x6011",
                "-f",
                "target/stm32l4x.cfg",
                "-c",
                "transport select swd",
            ]
        );
    }

    #[test]
    fn test_shutdown_args_with_custom_port() {
        let mut config = config();
        config.telnet_port = 5555;
        assert_eq!(
            config.shutdown_args(),
            [
                "-f",
                "/cfg/ts11-jtag-shutdown.cfg",
                "-c",
                "ftdi vid_pid 0x403 0x6011",
                "-c",
                "telnet_port 5555",
            ]
        );
    }

    #[test]
    fn test_machine_aborts_from_any_state() {
        let mut sm = StateMachine::new(SessionContext);
        assert!(sm.process_event(Events::LockTaken).is_ok());
        assert!(sm.process_event(Events::BridgeStarted).is_ok());
        assert!(sm.process_event(Events::Abort).is_ok());
        assert_eq!(*sm.state(), States::Failed);
    }

    #[test]
    fn test_machine_rejects_skipped_steps() {
        let mut sm = StateMachine::new(SessionContext);
        assert!(sm.process_event(Events::FirmwareVerified).is_err());
        assert_eq!(*sm.state(), States::Init);
    }
}
