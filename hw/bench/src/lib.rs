// Licensed under the Apache-2.0 license

//! Hardware-in-the-loop test bench control.
//!
//! A run takes the bench lock, brings up OpenOCD for the board's debug
//! adapter, flashes the firmware under test, resets the board and then
//! classifies its serial output into a pass/fail verdict.

pub mod adapter;
pub mod classifier;
mod error;
pub mod lock;
pub mod openocd;
pub mod platform;
pub mod serial;
pub mod session;

pub use adapter::{find_serial_device, load_adapter_id, AdapterId};
pub use classifier::{
    MonitorEnd, MonitorReport, SerialClassifier, SerialRecord, TestCounters, TestVerdict,
    MAX_RECORD_LEN, PLATFORM_LOG_TARGET,
};
pub use error::{BenchError, ChannelError, ConfigError, LockError, PlatformError, SessionError};
pub use lock::{DeviceLock, DEFAULT_LOCK_PATH};
pub use platform::{BoardPlatform, Platform, PlatformId};
pub use serial::{SerialLink, UsbUart};
pub use session::{RunOptions, Session, SessionConfig, Timings};
