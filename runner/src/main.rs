// Licensed under the Apache-2.0 license

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::builder::PossibleValuesParser;
use clap::Parser;
use hil_bench::openocd::DEFAULT_TELNET_PORT;
use hil_bench::{
    PlatformId, RunOptions, Session, SessionConfig, SessionError, TestVerdict, UsbUart,
    DEFAULT_LOCK_PATH,
};
use log::{error, info, LevelFilter};
use simple_logger::SimpleLogger;

/// Directory holding the default adapter mapping and OpenOCD configurations.
static CONFIG_DIR: LazyLock<PathBuf> =
    LazyLock::new(|| Path::new(env!("CARGO_MANIFEST_DIR")).join("config"));

fn default_work_dir() -> PathBuf {
    std::env::current_dir()
        .unwrap_or_default()
        .join("build")
        .join("system_tests")
}

fn parse_seconds(s: &str) -> Result<Duration, String> {
    let secs: f64 = s
        .parse()
        .map_err(|_| format!("`{s}` is not a number of seconds"))?;
    Duration::try_from_secs_f64(secs)
        .map_err(|_| "timeout must be a non-negative number of seconds".to_string())
}

/// Loads a test firmware onto a selected platform and checks the results
/// via its serial port.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Platform to run the test firmware on
    #[arg(value_parser = PossibleValuesParser::new(PlatformId::NAMES))]
    platform_id: String,

    /// Firmware binary to load to the selected platform
    firmware: PathBuf,

    /// Working directory
    #[arg(long = "work_dir", default_value_os_t = default_work_dir())]
    work_dir: PathBuf,

    /// Platform to adapter mapping file
    #[arg(long = "mapping_config", default_value_os_t = CONFIG_DIR.join("adapter_mapping.csv"))]
    mapping_config: PathBuf,

    /// OpenOCD configuration of the debug adapter
    #[arg(long = "adapter_config", default_value_os_t = CONFIG_DIR.join("ts11-jtag.cfg"))]
    adapter_config: PathBuf,

    /// OpenOCD configuration that puts the adapter into its idle state
    #[arg(
        long = "adapter_shutdown_config",
        default_value_os_t = CONFIG_DIR.join("ts11-jtag-shutdown.cfg")
    )]
    adapter_shutdown_config: PathBuf,

    /// Maximum silence between two serial messages in seconds, 0 disables it
    #[arg(long, value_parser = parse_seconds, default_value = "0")]
    message_timeout: Duration,

    /// Maximum duration of the whole test in seconds, 0 disables it
    #[arg(long, value_parser = parse_seconds, default_value = "0")]
    total_timeout: Duration,

    /// OpenOCD executable, searched on PATH if not given
    #[arg(long, env = "OPENOCD")]
    openocd: Option<PathBuf>,

    /// Lock file guarding exclusive use of the bench
    #[arg(long = "lock_file", default_value = DEFAULT_LOCK_PATH)]
    lock_file: PathBuf,

    /// OpenOCD telnet command port
    #[arg(long = "telnet_port", default_value_t = DEFAULT_TELNET_PORT)]
    telnet_port: u16,

    /// Enable debug logging
    #[arg(short, long, default_value_t = false)]
    verbose: bool,
}

impl From<Cli> for RunOptions {
    fn from(cli: Cli) -> Self {
        RunOptions {
            platform: cli.platform_id,
            firmware: cli.firmware,
            work_dir: cli.work_dir,
            mapping_config: cli.mapping_config,
            adapter_config: cli.adapter_config,
            adapter_shutdown_config: cli.adapter_shutdown_config,
            message_timeout: Some(cli.message_timeout),
            total_timeout: Some(cli.total_timeout),
            openocd: cli.openocd,
            lock_file: cli.lock_file,
            telnet_port: cli.telnet_port,
        }
    }
}

fn run(cli: Cli, cancel: &AtomicBool) -> Result<TestVerdict> {
    let config = SessionConfig::resolve(cli.into()).context("invalid configuration")?;
    info!(
        "Testing {} on {} (adapter {})",
        config.firmware.display(),
        config.platform,
        config.adapter
    );
    let serial = UsbUart::find(&config.adapter, Some(UsbUart::TS11_UART_INTERFACE))
        .context("serial adapter not found, check the adapter connection")?;
    let mut session = Session::new(config, serial)?;
    Ok(session.run(cancel)?)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let level = if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    let _ = SimpleLogger::new().with_level(level).init();

    let cancel = Arc::new(AtomicBool::new(false));
    let handler_flag = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::Relaxed);
    }) {
        error!("Cannot install the interrupt handler: {e}");
        return ExitCode::from(2);
    }

    match run(cli, &cancel) {
        Ok(TestVerdict::Passed) => ExitCode::SUCCESS,
        Ok(TestVerdict::Failed) => {
            error!("Test unsuccessful!");
            ExitCode::from(1)
        }
        Err(e) => {
            if let Some(SessionError::Interrupted) = e.downcast_ref::<SessionError>() {
                info!("Interrupted by SIGINT");
            } else {
                error!("{e:#}");
            }
            ExitCode::from(2)
        }
    }
}
