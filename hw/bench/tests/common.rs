// Licensed under the Apache-2.0 license
#![allow(dead_code)]

use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;

use log::LevelFilter;
use simple_logger::SimpleLogger;

pub const INVOCATION_LOG: &str = "invocations.log";

pub fn init_logger() {
    let _ = SimpleLogger::new().with_level(LevelFilter::Debug).init();
}

/// How the mock bridge answers.
#[derive(Clone, Default)]
pub struct MockBehavior {
    /// Report another board driving the shared SPI bus.
    pub bus_busy: bool,
    /// Commands starting with this prefix are swallowed without an echo.
    pub ignore_prefix: Option<&'static str>,
    /// Never report a verified image.
    pub verify_fails: bool,
}

/// Stand-in for the OpenOCD telnet command port.
pub struct MockOpenOcd {
    addr: SocketAddr,
    commands: Arc<Mutex<Vec<String>>>,
}

impl MockOpenOcd {
    pub fn start(behavior: MockBehavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let commands = Arc::new(Mutex::new(vec![]));
        let log = commands.clone();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                let behavior = behavior.clone();
                let log = log.clone();
                thread::spawn(move || serve(stream, &behavior, &log));
            }
        });
        Self { addr, commands }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

fn serve(mut stream: TcpStream, behavior: &MockBehavior, log: &Mutex<Vec<String>>) {
    // IAC WILL ECHO, IAC WILL SGA, IAC DO NAWS
    let mut greeting = vec![255, 251, 1, 255, 251, 3, 255, 253, 31];
    greeting.extend_from_slice(b"Open On-Chip Debugger\r\n> ");
    if stream.write_all(&greeting).is_err() {
        return;
    }

    let reader = BufReader::new(stream.try_clone().unwrap());
    for line in reader.lines() {
        let Ok(line) = line else { break };
        let cmd = line.trim().to_string();
        log.lock().unwrap().push(cmd.clone());

        if behavior
            .ignore_prefix
            .is_some_and(|prefix| cmd.starts_with(prefix))
        {
            continue;
        }

        let mut reply = format!("{cmd}\r\n");
        if cmd == "ftdi get_signal SPI_EN_BUS" {
            let value = if behavior.bus_busy { "000001" } else { "000000" };
            reply.push_str(&format!("Signal SPI_EN_BUS = {value}\r\n"));
        } else if cmd.starts_with("program ") {
            reply.push_str("** Programming Started **\r\n** Programming Finished **\r\n");
            if !behavior.verify_fails {
                reply.push_str("** Verify Started **\r\n** Verified OK **\r\n");
            }
        }
        reply.push_str("> ");
        if stream.write_all(reply.as_bytes()).is_err() {
            break;
        }
    }
}

fn write_fake_openocd(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("openocd");
    let log = dir.join(INVOCATION_LOG);
    fs::write(
        &path,
        format!("#!/bin/sh\necho \"$@\" >> \"{}\"\n{body}", log.display()),
    )
    .unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Writes an executable that records its arguments in `dir` and then idles
/// like a bridge would. The shutdown-only invocation exits right away.
pub fn fake_openocd(dir: &Path) -> PathBuf {
    write_fake_openocd(
        dir,
        "case \"$*\" in\n  *shutdown*) exit 0 ;;\nesac\nexec sleep 30\n",
    )
}

/// Like [`fake_openocd`], but every invocation exits immediately, as OpenOCD
/// does when the adapter is missing.
pub fn failing_openocd(dir: &Path) -> PathBuf {
    write_fake_openocd(dir, "exit 1\n")
}

/// A local port nothing listens on.
pub fn unused_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

pub fn invocations(dir: &Path) -> Vec<String> {
    fs::read_to_string(dir.join(INVOCATION_LOG))
        .map(|s| s.lines().map(str::to_string).collect())
        .unwrap_or_default()
}
