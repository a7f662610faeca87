// Licensed under the Apache-2.0 license

//! Classification of the firmware's serial test output.
//!
//! The firmware reports over UART with `\r\n` terminated records of the form
//! `line_number;TYPE;content[;got;expected]`, where `TYPE` is one of `INFO`,
//! `WARNING`, `ERROR` or `SYSTEM`. `SYSTEM` records carry the assertion
//! results and the end-of-test marker:
//!
//! ```text
//! 12;INFO;starting handshake
//! 40;SYSTEM;ASSERT_OK
//! 41;SYSTEM;ASSERT_FAIL;0x0;0x1
//! 0;SYSTEM;TEST_FINISH
//! ```
//!
//! A run passes only if at least one assertion was reached and nothing
//! went wrong: no errors, warnings, failed assertions or communication
//! problems.

use std::fmt;
use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

/// Log target of everything the firmware itself says.
pub const PLATFORM_LOG_TARGET: &str = "platform";

const RECORD_TERMINATOR: &[u8] = b"\r\n";

/// Longest unterminated input kept while waiting for a record terminator.
pub const MAX_RECORD_LEN: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestVerdict {
    Passed,
    Failed,
}

impl fmt::Display for TestVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Passed => f.write_str("passed"),
            Self::Failed => f.write_str("failed"),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TestCounters {
    pub errors: u32,
    pub warnings: u32,
    pub failed_assertions: u32,
    pub comm_errors: u32,
    pub reached_assertion: bool,
}

impl TestCounters {
    pub fn verdict(&self) -> TestVerdict {
        if self.errors + self.warnings + self.failed_assertions + self.comm_errors > 0 {
            TestVerdict::Failed
        } else {
            TestVerdict::Passed
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Info,
    Warning,
    Error,
    System,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    Malformed(usize),
    UnknownType(String),
}

impl fmt::Display for RecordError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed(n) => write!(f, "malformed record with {n} field(s)"),
            Self::UnknownType(t) => write!(f, "unknown record type `{t}`"),
        }
    }
}

/// One decoded record. `got` and `expected` are only present on failed
/// assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialRecord {
    pub source_line_number: Option<i64>,
    pub kind: RecordKind,
    pub content: String,
    pub got: Option<String>,
    pub expected: Option<String>,
}

impl SerialRecord {
    pub fn parse(line: &str) -> Result<Self, RecordError> {
        let fields: Vec<&str> = line.split(';').map(str::trim).collect();
        if fields.len() < 3 {
            return Err(RecordError::Malformed(fields.len()));
        }
        let kind = match fields[1] {
            "INFO" => RecordKind::Info,
            "WARNING" => RecordKind::Warning,
            "ERROR" => RecordKind::Error,
            "SYSTEM" => RecordKind::System,
            other => return Err(RecordError::UnknownType(other.to_string())),
        };
        let content = fields[2].to_string();
        let failed_assertion = kind == RecordKind::System && content == "ASSERT_FAIL";
        let extra = |i: usize| {
            fields
                .get(i)
                .filter(|_| failed_assertion)
                .map(|s| s.to_string())
        };
        Ok(Self {
            source_line_number: fields[0].parse().ok(),
            kind,
            got: extra(3),
            expected: extra(4),
            content,
        })
    }

    fn location(&self) -> String {
        self.source_line_number
            .map_or_else(|| "?".to_string(), |n| n.to_string())
    }
}

/// Why monitoring stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorEnd {
    Finished,
    MessageTimeout,
    TotalTimeout,
    PortClosed,
    Interrupted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorReport {
    pub counters: TestCounters,
    pub end: MonitorEnd,
}

impl MonitorReport {
    /// An interrupted run never passes.
    pub fn verdict(&self) -> TestVerdict {
        match self.end {
            MonitorEnd::Interrupted => TestVerdict::Failed,
            _ => self.counters.verdict(),
        }
    }
}

enum Flow {
    Continue,
    Finish,
}

/// Decodes a record as ASCII, escaping anything else.
fn decode(raw: &[u8]) -> String {
    let mut line = String::with_capacity(raw.len());
    for &b in raw {
        if b.is_ascii() {
            line.push(b as char);
        } else {
            line.push_str(&format!("\\x{b:02x}"));
        }
    }
    line
}

#[derive(Debug, Clone, Default)]
pub struct SerialClassifier {
    message_timeout: Option<Duration>,
    total_timeout: Option<Duration>,
}

impl SerialClassifier {
    /// Zero durations disable the respective timeout.
    pub fn new(message_timeout: Option<Duration>, total_timeout: Option<Duration>) -> Self {
        Self {
            message_timeout: message_timeout.filter(|d| !d.is_zero()),
            total_timeout: total_timeout.filter(|d| !d.is_zero()),
        }
    }

    /// Monitors `port` until the firmware finishes, a timeout fires, the
    /// port goes away or `cancel` is set. Raw bytes are copied to
    /// `transcript` if given.
    ///
    /// `port` is expected to return `TimedOut` or `WouldBlock` periodically
    /// while idle so that deadlines are noticed.
    pub fn run(
        &self,
        port: &mut dyn Read,
        cancel: &AtomicBool,
        mut transcript: Option<&mut dyn Write>,
    ) -> MonitorReport {
        let mut counters = TestCounters::default();
        let start = Instant::now();
        let mut last_record = start;
        let mut pending: Vec<u8> = vec![];
        // Bytes of `pending` already known not to start a terminator.
        let mut scanned = 0;
        let mut buf = [0u8; 512];

        let end = 'monitor: loop {
            if cancel.load(Ordering::Relaxed) {
                warn!("Monitoring interrupted");
                break MonitorEnd::Interrupted;
            }
            if let Some(total) = self.total_timeout {
                if start.elapsed() >= total {
                    error!("Test did not finish within {total:?}");
                    counters.comm_errors += 1;
                    break MonitorEnd::TotalTimeout;
                }
            }
            if let Some(silence) = self.message_timeout {
                if last_record.elapsed() >= silence {
                    error!(
                        "No message received for {silence:?}. Check that the test output is \
                         correct and that TEST_FINISH is issued at the end of the test"
                    );
                    counters.comm_errors += 1;
                    break MonitorEnd::MessageTimeout;
                }
            }

            let n = match port.read(&mut buf) {
                Ok(0) => {
                    error!("Serial port closed before the test finished");
                    counters.comm_errors += 1;
                    break MonitorEnd::PortClosed;
                }
                Ok(n) => n,
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                    ) =>
                {
                    continue
                }
                Err(e) => {
                    error!("Serial port read failed: {e}");
                    counters.comm_errors += 1;
                    break MonitorEnd::PortClosed;
                }
            };

            if let Some(t) = transcript.as_mut() {
                if let Err(e) = t.write_all(&buf[..n]) {
                    warn!("Cannot write serial transcript, disabling it: {e}");
                    transcript = None;
                }
            }

            pending.extend_from_slice(&buf[..n]);
            loop {
                let Some(pos) = pending[scanned..]
                    .windows(RECORD_TERMINATOR.len())
                    .position(|w| w == RECORD_TERMINATOR)
                    .map(|pos| pos + scanned)
                else {
                    scanned = pending.len().saturating_sub(RECORD_TERMINATOR.len() - 1);
                    break;
                };
                let raw: Vec<u8> = pending.drain(..pos + RECORD_TERMINATOR.len()).collect();
                scanned = 0;
                last_record = Instant::now();
                let line = decode(&raw[..pos]);
                debug!("Received from serial: {line}");
                if let Flow::Finish = Self::dispatch(&line, &mut counters) {
                    break 'monitor MonitorEnd::Finished;
                }
            }

            if pending.len() > MAX_RECORD_LEN {
                error!(
                    "Discarding {} bytes without a record terminator, check the baud rate",
                    pending.len()
                );
                counters.comm_errors += 1;
                pending.clear();
                scanned = 0;
            }
        };

        if let Some(t) = transcript.as_mut() {
            let _ = t.flush();
        }

        if !counters.reached_assertion {
            error!("No assertion was reached during the test");
            counters.errors += 1;
        }

        info!("------ Stats ------");
        info!("Errors: {}", counters.errors);
        info!("Warnings: {}", counters.warnings);
        info!("Failed assertions: {}", counters.failed_assertions);
        info!("Communication errors: {}", counters.comm_errors);

        MonitorReport { counters, end }
    }

    fn dispatch(line: &str, counters: &mut TestCounters) -> Flow {
        let record = match SerialRecord::parse(line) {
            Ok(record) => record,
            Err(RecordError::Malformed(n)) => {
                error!("Line malformed ({n} field(s)): {line}");
                counters.comm_errors += 1;
                return Flow::Continue;
            }
            Err(e @ RecordError::UnknownType(_)) => {
                error!("Unknown message, {e}: {line}");
                counters.comm_errors += 1;
                return Flow::Continue;
            }
        };

        if record.source_line_number.is_none() {
            error!("Line number is not an integer: {line}");
            counters.comm_errors += 1;
        }

        let at = record.location();
        match record.kind {
            RecordKind::Info => info!(target: PLATFORM_LOG_TARGET, "[{at}] {}", record.content),
            RecordKind::Warning => {
                warn!(target: PLATFORM_LOG_TARGET, "[{at}] {}", record.content);
                counters.warnings += 1;
            }
            RecordKind::Error => {
                error!(target: PLATFORM_LOG_TARGET, "[{at}] {}", record.content);
                counters.errors += 1;
            }
            RecordKind::System => match record.content.as_str() {
                "ASSERT_OK" => {
                    info!("Assertion at [{at}] passed");
                    counters.reached_assertion = true;
                }
                "ASSERT_FAIL" => match (&record.got, &record.expected) {
                    (Some(got), Some(expected)) => {
                        error!("Assertion at [{at}] failed: got {got}, expected {expected}");
                        counters.failed_assertions += 1;
                        counters.reached_assertion = true;
                    }
                    _ => {
                        error!("Failed assertion at [{at}] is missing got/expected: {line}");
                        counters.comm_errors += 1;
                    }
                },
                "TEST_FINISH" => {
                    info!("Received TEST_FINISH, wrapping up");
                    return Flow::Finish;
                }
                other => {
                    error!("Unknown system message `{other}` at [{at}]");
                    counters.comm_errors += 1;
                }
            },
        }
        Flow::Continue
    }
}
