// Licensed under the Apache-2.0 license

//! Board families the runner knows how to flash and reset.

mod stm32;

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

pub use stm32::{Stm32F4, Stm32L4};

use crate::error::{ConfigError, PlatformError};
use crate::openocd::OpenOcdChannel;

/// Board-specific operations on the debug bridge.
pub trait Platform {
    /// Extra OpenOCD arguments selecting the target and transport.
    fn launch_params(&self) -> Vec<String>;

    /// Programs and verifies `firmware`, waiting up to `verify_timeout` for
    /// the bridge to confirm the image.
    fn load_firmware(
        &self,
        channel: &mut OpenOcdChannel,
        firmware: &Path,
        verify_timeout: Duration,
    ) -> Result<(), PlatformError>;

    fn reset(&self, channel: &mut OpenOcdChannel) -> bool;
}

/// Identifier used on the command line and in the adapter mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformId {
    Stm32F439zi,
    Stm32L432kc,
}

impl PlatformId {
    pub const ALL: [PlatformId; 2] = [PlatformId::Stm32F439zi, PlatformId::Stm32L432kc];

    /// Names of `ALL`, in the same order.
    pub const NAMES: [&'static str; PlatformId::ALL.len()] = {
        let mut names = [""; PlatformId::ALL.len()];
        let mut i = 0;
        while i < names.len() {
            names[i] = PlatformId::ALL[i].name();
            i += 1;
        }
        names
    };

    pub const fn name(self) -> &'static str {
        match self {
            Self::Stm32F439zi => "stm32_f439zi",
            Self::Stm32L432kc => "stm32_l432kc",
        }
    }

    pub fn platform(self) -> BoardPlatform {
        self.into()
    }
}

impl fmt::Display for PlatformId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PlatformId {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|id| id.name() == s)
            .ok_or_else(|| ConfigError::UnknownPlatform(s.to_string()))
    }
}

pub enum BoardPlatform {
    Stm32F4(Stm32F4),
    Stm32L4(Stm32L4),
}

impl From<PlatformId> for BoardPlatform {
    fn from(value: PlatformId) -> Self {
        match value {
            PlatformId::Stm32F439zi => BoardPlatform::Stm32F4(Stm32F4),
            PlatformId::Stm32L432kc => BoardPlatform::Stm32L4(Stm32L4),
        }
    }
}

impl Platform for BoardPlatform {
    fn launch_params(&self) -> Vec<String> {
        match self {
            Self::Stm32F4(p) => p.launch_params(),
            Self::Stm32L4(p) => p.launch_params(),
        }
    }

    fn load_firmware(
        &self,
        channel: &mut OpenOcdChannel,
        firmware: &Path,
        verify_timeout: Duration,
    ) -> Result<(), PlatformError> {
        match self {
            Self::Stm32F4(p) => p.load_firmware(channel, firmware, verify_timeout),
            Self::Stm32L4(p) => p.load_firmware(channel, firmware, verify_timeout),
        }
    }

    fn reset(&self, channel: &mut OpenOcdChannel) -> bool {
        match self {
            Self::Stm32F4(p) => p.reset(channel),
            Self::Stm32L4(p) => p.reset(channel),
        }
    }
}
