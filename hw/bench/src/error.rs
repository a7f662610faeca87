// Licensed under the Apache-2.0 license

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Problems with the run configuration. All of these are detected before the
/// bench is touched.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown platform `{0}`")]
    UnknownPlatform(String),
    #[error("{what} not found: {}", .path.display())]
    MissingFile { what: &'static str, path: PathBuf },
    #[error("{what} is not a file: {}", .path.display())]
    NotAFile { what: &'static str, path: PathBuf },
    #[error("work directory path is a file: {}", .0.display())]
    WorkDirIsFile(PathBuf),
    #[error("malformed adapter mapping header `{0}`, expected `platform;vid;pid`")]
    MappingHeader(String),
    #[error("adapter mapping line {line}: {reason}")]
    MappingRow { line: usize, reason: String },
    #[error("platform `{0}` has no entry in the adapter mapping")]
    PlatformNotMapped(String),
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("device is locked by another process")]
    AlreadyLocked,
    #[error("no permission to use lock file {}", .0.display())]
    PermissionDenied(PathBuf),
    #[error("lock file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("debug bridge is not reachable")]
    Refused,
    #[error("timed out after {0:?} waiting for {1}")]
    Timeout(Duration, &'static str),
    #[error("debug bridge closed the connection")]
    Disconnected,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("debug bridge rejected `{0}`")]
    CommandFailed(String),
    #[error("firmware verification did not complete: {0}")]
    VerifyFailed(#[source] ChannelError),
    #[error("firmware image: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum BenchError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("{0} executable not found")]
    ToolNotFound(String),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error("no serial port for adapter {vid:04x}:{pid:04x} interface {interface:?}")]
    SerialNotFound {
        vid: u16,
        pid: u16,
        interface: Option<u8>,
    },
    #[error("serial port: {0}")]
    Serial(#[from] serialport::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("interrupted by operator")]
    Interrupted,
    #[error(transparent)]
    Bench(#[from] BenchError),
}
