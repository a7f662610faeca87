// Licensed under the Apache-2.0 license

use std::path::Path;
use std::time::Duration;

use log::info;

use super::Platform;
use crate::error::PlatformError;
use crate::openocd::OpenOcdChannel;

const VERIFIED: &str = "** Verified OK **";

fn load_firmware(
    channel: &mut OpenOcdChannel,
    firmware: &Path,
    verify_timeout: Duration,
) -> Result<(), PlatformError> {
    let firmware = firmware.canonicalize()?;
    let cmd = format!("program {} verify", firmware.display());
    info!("Flashing {}", firmware.display());
    if !channel.command(&cmd) {
        return Err(PlatformError::CommandFailed(cmd));
    }
    channel
        .recv_until(VERIFIED, verify_timeout)
        .map_err(PlatformError::VerifyFailed)?;
    info!("Firmware verified");
    Ok(())
}

fn reset(channel: &mut OpenOcdChannel) -> bool {
    channel.command("reset")
}

/// STM32F4 family, default transport.
#[derive(Debug, Default, Clone, Copy)]
pub struct Stm32F4;

impl Platform for Stm32F4 {
    fn launch_params(&self) -> Vec<String> {
        vec!["-f".into(), "target/stm32f4x.cfg".into()]
    }

    fn load_firmware(
        &self,
        channel: &mut OpenOcdChannel,
        firmware: &Path,
        verify_timeout: Duration,
    ) -> Result<(), PlatformError> {
        load_firmware(channel, firmware, verify_timeout)
    }

    fn reset(&self, channel: &mut OpenOcdChannel) -> bool {
        reset(channel)
    }
}

/// STM32L4 family, which is wired for SWD.
#[derive(Debug, Default, Clone, Copy)]
pub struct Stm32L4;

impl Platform for Stm32L4 {
    fn launch_params(&self) -> Vec<String> {
        vec![
            "-f".into(),
            "target/stm32l4x.cfg".into(),
            "-c".into(),
            "transport select swd".into(),
        ]
    }

    fn load_firmware(
        &self,
        channel: &mut OpenOcdChannel,
        firmware: &Path,
        verify_timeout: Duration,
    ) -> Result<(), PlatformError> {
        load_firmware(channel, firmware, verify_timeout)
    }

    fn reset(&self, channel: &mut OpenOcdChannel) -> bool {
        reset(channel)
    }
}
