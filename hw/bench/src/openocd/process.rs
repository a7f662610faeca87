// Licensed under the Apache-2.0 license

use std::ffi::OsStr;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::os::unix::io::{FromRawFd, OwnedFd};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use nix::fcntl::OFlag;
use nix::sys::signal::{kill, Signal};
use nix::unistd::{pipe2, Pid};

use crate::error::BenchError;

pub const OPENOCD_LOG_TARGET: &str = "openocd";

/// How long a terminated bridge gets to exit before it is killed, unless
/// changed with [`OpenOcdProcess::set_terminate_grace`].
pub const TERMINATE_GRACE: Duration = Duration::from_secs(10);

const EXIT_POLL: Duration = Duration::from_millis(50);

/// A running OpenOCD instance. Its stdout and stderr are merged and forwarded
/// to the log by a reader thread that lives exactly as long as the process.
///
/// The process gets its own process group, so a Ctrl-C on the runner's
/// terminal does not reach it and the runner stays in charge of stopping it.
pub struct OpenOcdProcess {
    child: Child,
    reader: Option<JoinHandle<()>>,
    terminated: bool,
    terminate_grace: Duration,
}

impl OpenOcdProcess {
    /// Resolves the OpenOCD executable, either from an explicit path or by
    /// searching `PATH`.
    pub fn locate(executable: Option<&Path>) -> Result<PathBuf, BenchError> {
        let candidate = executable.map_or(OsStr::new("openocd"), Path::as_os_str);
        which::which(candidate)
            .map_err(|_| BenchError::ToolNotFound(candidate.to_string_lossy().into_owned()))
    }

    pub fn launch<I, S>(executable: &Path, args: I) -> Result<Self, BenchError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let (read_fd, write_fd) = pipe2(OFlag::O_CLOEXEC).map_err(std::io::Error::from)?;
        // SAFETY: both descriptors were just created by pipe2 and are owned here.
        let output = unsafe { File::from_raw_fd(read_fd) };
        let write_end = unsafe { OwnedFd::from_raw_fd(write_fd) };
        let stderr = write_end.try_clone()?;

        // The command, and with it our copies of the write end, is dropped at
        // the end of this block so the reader sees EOF once the child exits.
        let child = {
            let mut cmd = Command::new(executable);
            cmd.args(args)
                .stdin(Stdio::null())
                .stdout(Stdio::from(write_end))
                .stderr(Stdio::from(stderr))
                .process_group(0);
            info!("Starting {cmd:?}");
            cmd.spawn()?
        };

        let reader = std::thread::Builder::new()
            .name("openocd-output".into())
            .spawn(move || {
                let mut reader = BufReader::new(output);
                let mut line = vec![];
                loop {
                    line.clear();
                    match reader.read_until(b'\n', &mut line) {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {
                            let text = String::from_utf8_lossy(&line);
                            let text = text.trim_end();
                            if !text.trim().is_empty() {
                                debug!(target: OPENOCD_LOG_TARGET, "{text}");
                            }
                        }
                    }
                }
            })?;

        Ok(Self {
            child,
            reader: Some(reader),
            terminated: false,
            terminate_grace: TERMINATE_GRACE,
        })
    }

    pub fn id(&self) -> u32 {
        self.child.id()
    }

    pub fn set_terminate_grace(&mut self, grace: Duration) {
        self.terminate_grace = grace;
    }

    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Waits up to `timeout` for the process to exit by itself. Returns
    /// whether it has exited.
    pub fn wait_timeout(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    debug!("OpenOCD (pid {}) exited with {status}", self.child.id());
                    return true;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("Cannot query OpenOCD status: {e}");
                    return false;
                }
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(EXIT_POLL);
        }
    }

    /// Stops the process: SIGTERM, up to the terminate grace period, then SIGKILL. Joins the
    /// output reader. Safe to call more than once.
    pub fn cleanup(&mut self) {
        if self.terminated {
            return;
        }
        self.terminated = true;

        if self.is_running() {
            let pid = Pid::from_raw(self.child.id() as i32);
            debug!("Terminating OpenOCD (pid {pid})");
            if let Err(e) = kill(pid, Signal::SIGTERM) {
                warn!("Cannot signal OpenOCD (pid {pid}): {e}");
            }
            if !self.wait_timeout(self.terminate_grace) {
                warn!("OpenOCD (pid {pid}) ignored SIGTERM, killing it");
                let _ = self.child.kill();
            }
        }
        let _ = self.child.wait();

        if let Some(reader) = self.reader.take() {
            if reader.join().is_err() {
                warn!("OpenOCD output reader panicked");
            }
        }
    }
}

impl Drop for OpenOcdProcess {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locate_missing_tool() {
        let err = OpenOcdProcess::locate(Some(Path::new("/nonexistent/openocd"))).unwrap_err();
        assert!(matches!(err, BenchError::ToolNotFound(_)));
    }

    #[test]
    fn test_cleanup_terminates_and_is_idempotent() {
        let sleep = OpenOcdProcess::locate(Some(Path::new("sleep"))).unwrap();
        let mut process = OpenOcdProcess::launch(&sleep, ["30"]).unwrap();
        assert!(process.is_running());
        process.cleanup();
        assert!(!process.is_running());
        process.cleanup();
    }

    #[test]
    fn test_runs_in_own_process_group() {
        let sleep = OpenOcdProcess::locate(Some(Path::new("sleep"))).unwrap();
        let mut process = OpenOcdProcess::launch(&sleep, ["30"]).unwrap();
        let pid = Pid::from_raw(process.id() as i32);
        assert_eq!(nix::unistd::getpgid(Some(pid)).unwrap(), pid);
        assert_ne!(
            nix::unistd::getpgid(None).unwrap(),
            nix::unistd::getpgid(Some(pid)).unwrap()
        );
        process.cleanup();
    }

    #[test]
    fn test_kill_after_grace_period() {
        let sh = OpenOcdProcess::locate(Some(Path::new("sh"))).unwrap();
        let mut process =
            OpenOcdProcess::launch(&sh, ["-c", "trap '' TERM; while :; do sleep 1; done"]).unwrap();
        process.set_terminate_grace(Duration::from_millis(300));
        std::thread::sleep(Duration::from_millis(200));
        let start = Instant::now();
        process.cleanup();
        assert!(!process.is_running());
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_wait_for_self_exit() {
        let sh = OpenOcdProcess::locate(Some(Path::new("sh"))).unwrap();
        let mut process =
            OpenOcdProcess::launch(&sh, ["-c", "echo done; echo oops >&2"]).unwrap();
        assert!(process.wait_timeout(Duration::from_secs(5)));
        assert!(!process.is_running());
    }
}
