// qsnap - Breakpoint-driven VM snapshot capture
// Copyright (C) 2026 qsnap Team
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Client for the virtualization platform's text monitor.

use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::path::Path;
use std::time::Duration;

use crate::{CaptureError, CaptureResult};

/// Terminator the monitor prints once it is ready for the next command.
pub const PROMPT: &[u8] = b"\n(qemu) ";

const READ_CHUNK: usize = 4096;
const READ_TIMEOUT: Duration = Duration::from_millis(100);
const RETRY_SLEEP: Duration = Duration::from_millis(100);

/// Something that can write the guest's physical memory to a host file.
pub trait PhysicalMemoryPersister {
    /// Blocks until the whole image of `size` bytes has been written to `path`.
    fn persist_physical_memory(&mut self, path: &Path, size: u64) -> CaptureResult<()>;
}

pub struct MonitorClient {
    stream: TcpStream,
    buf: Vec<u8>,
}

impl MonitorClient {
    pub fn connect(addr: &str) -> CaptureResult<Self> {
        tracing::info!("Connecting to VM monitor at {}", addr);
        let stream = TcpStream::connect(addr)?;
        stream.set_read_timeout(Some(READ_TIMEOUT))?;
        let mut client = Self {
            stream,
            buf: Vec::new(),
        };
        client.wait_ready()?;
        Ok(client)
    }

    /// Read until the prompt shows up. Returns whatever preceded it.
    pub fn wait_ready(&mut self) -> CaptureResult<String> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some(pos) = find(&self.buf, PROMPT) {
                let output = String::from_utf8_lossy(&self.buf[..pos]).into_owned();
                self.buf.drain(..pos + PROMPT.len());
                return Ok(output);
            }
            match self.stream.read(&mut chunk) {
                Ok(0) => return Err(CaptureError::MonitorDisconnected),
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    std::thread::sleep(RETRY_SLEEP);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Send one command line and block until the monitor prompts again.
    pub fn send_command(&mut self, cmd: &str) -> CaptureResult<String> {
        tracing::debug!("monitor <- {}", cmd);
        self.stream.write_all(cmd.as_bytes())?;
        self.stream.write_all(b"\n")?;
        self.stream.flush()?;
        let output = self.wait_ready()?;
        if !output.trim().is_empty() {
            tracing::debug!("monitor -> {}", output.trim());
        }
        Ok(output)
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// The monitor splits arguments on whitespace and has no quoting.
fn monitor_arg(path: &Path) -> CaptureResult<&str> {
    path.to_str()
        .filter(|s| !s.is_empty() && !s.chars().any(char::is_whitespace))
        .ok_or_else(|| CaptureError::MonitorPath(path.to_path_buf()))
}

impl PhysicalMemoryPersister for MonitorClient {
    fn persist_physical_memory(&mut self, path: &Path, size: u64) -> CaptureResult<()> {
        let arg = monitor_arg(path)?;
        tracing::info!("Saving {:#x} bytes of physical memory to {:?}", size, path);
        self.send_command(&format!("pmemsave 0 {:#x} {}", size, arg))?;
        Ok(())
    }
}

/// Monitor endpoint that is only dialed when memory is actually persisted.
#[derive(Debug, Clone)]
pub struct QemuMonitor {
    addr: String,
}

impl QemuMonitor {
    pub fn new<S: Into<String>>(addr: S) -> Self {
        Self { addr: addr.into() }
    }
}

impl PhysicalMemoryPersister for QemuMonitor {
    fn persist_physical_memory(&mut self, path: &Path, size: u64) -> CaptureResult<()> {
        monitor_arg(path)?;
        MonitorClient::connect(&self.addr)?.persist_physical_memory(path, size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader};
    use std::net::TcpListener;
    use std::thread;

    fn fake_monitor<F>(script: F) -> (String, thread::JoinHandle<Vec<String>>)
    where
        F: FnOnce(&mut TcpStream, &mut BufReader<TcpStream>) -> Vec<String> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            script(&mut stream, &mut reader)
        });
        (addr, handle)
    }

    #[test]
    fn test_pmemsave_round_trip() {
        let (addr, handle) = fake_monitor(|stream, reader| {
            stream
                .write_all(b"QEMU 8.0.0 monitor - type 'help' for more information\n(qemu) ")
                .unwrap();
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            // Prompt split across writes.
            stream.write_all(b"\n(qe").unwrap();
            thread::sleep(Duration::from_millis(20));
            stream.write_all(b"mu) ").unwrap();
            vec![line]
        });

        let mut monitor = QemuMonitor::new(addr);
        monitor
            .persist_physical_memory(Path::new("/tmp/raw"), 0xffff_ffff)
            .unwrap();
        let lines = handle.join().unwrap();
        assert_eq!(lines, vec!["pmemsave 0 0xffffffff /tmp/raw\n".to_string()]);
    }

    #[test]
    fn test_disconnect_before_prompt() {
        let (addr, handle) = fake_monitor(|stream, _| {
            stream.write_all(b"QEMU 8.0.0 monitor").unwrap();
            Vec::new()
        });
        let err = MonitorClient::connect(&addr).err().unwrap();
        handle.join().unwrap();
        assert!(matches!(err, CaptureError::MonitorDisconnected));
    }

    #[test]
    fn test_disconnect_during_command() {
        let (addr, handle) = fake_monitor(|stream, reader| {
            stream.write_all(b"banner\n(qemu) ").unwrap();
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            vec![line]
        });
        let mut client = MonitorClient::connect(&addr).unwrap();
        let err = client
            .persist_physical_memory(Path::new("/tmp/raw"), 0x1000)
            .unwrap_err();
        handle.join().unwrap();
        assert!(matches!(err, CaptureError::MonitorDisconnected));
    }

    #[test]
    fn test_path_with_whitespace_is_rejected() {
        // Nothing listens here; the path is refused before dialing.
        let mut monitor = QemuMonitor::new("127.0.0.1:1");
        let err = monitor
            .persist_physical_memory(Path::new("/tmp/my work/raw"), 0x1000)
            .unwrap_err();
        assert!(matches!(err, CaptureError::MonitorPath(_)));
        assert_eq!(monitor_arg(Path::new("/tmp/work/raw")).unwrap(), "/tmp/work/raw");
    }
}
