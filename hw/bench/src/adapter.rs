// Licensed under the Apache-2.0 license

//! Adapter mapping file and USB serial port discovery.

use std::fmt;
use std::path::Path;

use log::debug;
use serialport::SerialPortType;

use crate::error::{BenchError, ConfigError};

const MAPPING_HEADER: [&str; 3] = ["platform", "vid", "pid"];

/// USB identity of the debug adapter wired to a platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdapterId {
    pub vid: u16,
    pub pid: u16,
}

impl fmt::Display for AdapterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vid, self.pid)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingEntry {
    pub platform: String,
    pub adapter: AdapterId,
}

fn parse_hex(field: &str, line: usize) -> Result<u16, ConfigError> {
    let digits = field
        .strip_prefix("0x")
        .or_else(|| field.strip_prefix("0X"))
        .unwrap_or(field);
    u16::from_str_radix(digits, 16).map_err(|_| ConfigError::MappingRow {
        line,
        reason: format!("`{field}` is not a 16-bit hex value"),
    })
}

fn split_fields(line: &str) -> Vec<&str> {
    line.split(';').map(str::trim).collect()
}

/// Parses the whole mapping. Every row is validated, even ones for other
/// platforms, so a broken file is reported no matter which board is tested.
pub fn parse_mapping(text: &str) -> Result<Vec<MappingEntry>, ConfigError> {
    let mut lines = text
        .lines()
        .enumerate()
        .map(|(i, l)| (i + 1, l.trim()))
        .filter(|(_, l)| !l.is_empty());

    match lines.next() {
        Some((_, header)) if split_fields(header) == MAPPING_HEADER => {}
        Some((_, header)) => return Err(ConfigError::MappingHeader(header.to_string())),
        None => return Err(ConfigError::MappingHeader(String::new())),
    }

    let mut entries = vec![];
    for (line, row) in lines {
        let fields = split_fields(row);
        if fields.len() != MAPPING_HEADER.len() {
            return Err(ConfigError::MappingRow {
                line,
                reason: format!("expected 3 fields, found {}", fields.len()),
            });
        }
        if fields[0].is_empty() {
            return Err(ConfigError::MappingRow {
                line,
                reason: "empty platform name".into(),
            });
        }
        entries.push(MappingEntry {
            platform: fields[0].to_string(),
            adapter: AdapterId {
                vid: parse_hex(fields[1], line)?,
                pid: parse_hex(fields[2], line)?,
            },
        });
    }
    Ok(entries)
}

/// Looks up the adapter for `platform`. The first matching row wins.
pub fn load_adapter_id(mapping: &Path, platform: &str) -> Result<AdapterId, ConfigError> {
    let text = std::fs::read_to_string(mapping).map_err(|_| ConfigError::MissingFile {
        what: "adapter mapping",
        path: mapping.to_path_buf(),
    })?;
    parse_mapping(&text)?
        .into_iter()
        .find(|e| e.platform == platform)
        .map(|e| e.adapter)
        .ok_or_else(|| ConfigError::PlatformNotMapped(platform.to_string()))
}

/// Finds the tty belonging to a USB device. `interface` narrows the match
/// for composite devices that expose several UARTs.
pub fn find_serial_device(
    vid: u16,
    pid: u16,
    interface: Option<u8>,
) -> Result<String, BenchError> {
    for port in serialport::available_ports()? {
        if let SerialPortType::UsbPort(info) = &port.port_type {
            debug!(
                "Candidate serial port {} ({:04x}:{:04x} if {:?})",
                port.port_name, info.vid, info.pid, info.interface
            );
            if info.vid == vid
                && info.pid == pid
                && (interface.is_none() || info.interface == interface)
            {
                return Ok(port.port_name);
            }
        }
    }
    Err(BenchError::SerialNotFound {
        vid,
        pid,
        interface,
    })
}
