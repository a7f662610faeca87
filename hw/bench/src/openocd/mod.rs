// Licensed under the Apache-2.0 license

//! OpenOCD process control and its telnet command channel.

mod channel;
mod process;
mod telnet;

pub use channel::{LedColor, OpenOcdChannel, DEFAULT_COMMAND_TIMEOUT, DEFAULT_TELNET_PORT};
pub use process::{OpenOcdProcess, OPENOCD_LOG_TARGET, TERMINATE_GRACE};
pub use telnet::TelnetFilter;
