use std::io::{Read, Write};
use std::net::TcpStream;

use qsnap_core::debug::{DebugSession, ExecutionControl, Register, StopEvent};
use qsnap_core::CaptureResult;

use crate::packet::{
    bytes_to_hex, decode_frame, decode_register, encode_packet, encode_register, error_code,
    hex_to_bytes, parse_stop_reply, Frame,
};
use crate::{RspError, RspResult};

/// Largest memory transfer per `m`/`M` packet.
pub const MAX_MEMORY_CHUNK: usize = 0x800;
const MAX_SEND_ATTEMPTS: usize = 3;
const INTERRUPT: u8 = 0x03;

pub struct RspClient {
    stream: TcpStream,
    buf: Vec<u8>,
    last_stop: Option<StopEvent>,
}

impl RspClient {
    /// Connect and query why the target is stopped.
    pub fn connect(addr: &str) -> RspResult<Self> {
        tracing::info!("Connecting to gdbstub at {}", addr);
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        let mut client = Self {
            stream,
            buf: Vec::new(),
            last_stop: None,
        };

        let features = client.request("qSupported:hwbreak+")?;
        tracing::debug!("Remote features: {}", features);
        let stop = client.request("?")?;
        client.last_stop = Some(parse_stop_reply(&stop)?);
        tracing::info!("Attached, target stopped ({:?})", client.last_stop);
        Ok(client)
    }

    pub fn last_stop(&self) -> Option<StopEvent> {
        self.last_stop
    }

    fn fill(&mut self) -> RspResult<()> {
        let mut chunk = [0u8; 4096];
        let n = self.stream.read(&mut chunk)?;
        if n == 0 {
            return Err(RspError::Disconnected);
        }
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(())
    }

    fn send_packet(&mut self, payload: &str) -> RspResult<()> {
        let packet = encode_packet(payload);
        for _ in 0..MAX_SEND_ATTEMPTS {
            tracing::trace!("-> {}", payload);
            self.stream.write_all(&packet)?;
            if self.read_ack()? {
                return Ok(());
            }
            tracing::debug!("Packet '{}' not acknowledged, resending", payload);
        }
        Err(RspError::Rejected(payload.to_string()))
    }

    fn read_ack(&mut self) -> RspResult<bool> {
        loop {
            while let Some(&b) = self.buf.first() {
                match b {
                    b'+' => {
                        self.buf.remove(0);
                        return Ok(true);
                    }
                    b'-' => {
                        self.buf.remove(0);
                        return Ok(false);
                    }
                    // A reply already started, the ack got lost.
                    b'$' => return Ok(true),
                    _ => {
                        self.buf.remove(0);
                    }
                }
            }
            self.fill()?;
        }
    }

    fn read_packet(&mut self) -> RspResult<String> {
        loop {
            let junk = self
                .buf
                .iter()
                .position(|&b| b == b'$')
                .unwrap_or(self.buf.len());
            self.buf.drain(..junk);

            match decode_frame(&self.buf) {
                Frame::Packet(payload, used) => {
                    self.buf.drain(..used);
                    self.stream.write_all(b"+")?;
                    tracing::trace!("<- {}", payload);
                    return Ok(payload);
                }
                Frame::Corrupt(used) => {
                    self.buf.drain(..used);
                    self.stream.write_all(b"-")?;
                }
                Frame::Incomplete => self.fill()?,
            }
        }
    }

    /// Next reply that is not console output.
    fn read_reply(&mut self) -> RspResult<String> {
        loop {
            let reply = self.read_packet()?;
            match reply.strip_prefix('O') {
                Some(hex) if reply != "OK" => {
                    if let Some(text) = hex_to_bytes(hex) {
                        tracing::info!("remote: {}", String::from_utf8_lossy(&text).trim_end());
                    }
                }
                _ => return Ok(reply),
            }
        }
    }

    fn request(&mut self, cmd: &str) -> RspResult<String> {
        self.send_packet(cmd)?;
        let reply = self.read_reply()?;
        if let Some(code) = error_code(&reply) {
            return Err(RspError::Remote {
                code,
                cmd: cmd.to_string(),
            });
        }
        Ok(reply)
    }

    fn expect_ok(&mut self, cmd: &str) -> RspResult<()> {
        match self.request(cmd)?.as_str() {
            "OK" => Ok(()),
            "" => Err(RspError::Unsupported(cmd.to_string())),
            other => Err(RspError::Unexpected {
                cmd: cmd.to_string(),
                reply: other.to_string(),
            }),
        }
    }

    fn read_stop(&mut self) -> RspResult<StopEvent> {
        let stop = parse_stop_reply(&self.read_reply()?)?;
        self.last_stop = Some(stop);
        Ok(stop)
    }

    fn read_chunk(&mut self, addr: u64, len: usize) -> RspResult<Vec<u8>> {
        let cmd = format!("m{:x},{:x}", addr, len);
        let reply = self.request(&cmd)?;
        match hex_to_bytes(&reply) {
            Some(bytes) if !bytes.is_empty() => Ok(bytes),
            _ => Err(RspError::Unexpected { cmd, reply }),
        }
    }
}

impl DebugSession for RspClient {
    fn read_register(&mut self, reg: Register) -> CaptureResult<u64> {
        let cmd = format!("p{:x}", reg.gdb_number());
        let reply = self.request(&cmd)?;
        match decode_register(&reply) {
            Some(value) => Ok(value),
            None => Err(RspError::Unexpected { cmd, reply }.into()),
        }
    }

    fn write_register(&mut self, reg: Register, value: u64) -> CaptureResult<()> {
        let cmd = format!(
            "P{:x}={}",
            reg.gdb_number(),
            encode_register(value, reg.width())
        );
        Ok(self.expect_ok(&cmd)?)
    }

    fn read_memory(&mut self, addr: u64, len: usize) -> CaptureResult<Vec<u8>> {
        let mut data = Vec::with_capacity(len);
        while data.len() < len {
            let want = (len - data.len()).min(MAX_MEMORY_CHUNK);
            let chunk = self.read_chunk(addr + data.len() as u64, want)?;
            data.extend_from_slice(&chunk[..chunk.len().min(want)]);
        }
        Ok(data)
    }

    fn write_memory(&mut self, addr: u64, data: &[u8]) -> CaptureResult<()> {
        for (i, chunk) in data.chunks(MAX_MEMORY_CHUNK).enumerate() {
            let at = addr + (i * MAX_MEMORY_CHUNK) as u64;
            let cmd = format!("M{:x},{:x}:{}", at, chunk.len(), bytes_to_hex(chunk));
            self.expect_ok(&cmd)?;
        }
        Ok(())
    }
}

impl ExecutionControl for RspClient {
    fn insert_breakpoint(&mut self, addr: u64) -> CaptureResult<()> {
        tracing::debug!("Inserting hardware breakpoint at {:#x}", addr);
        Ok(self.expect_ok(&format!("Z1,{:x},1", addr))?)
    }

    fn remove_breakpoint(&mut self, addr: u64) -> CaptureResult<()> {
        tracing::debug!("Removing hardware breakpoint at {:#x}", addr);
        Ok(self.expect_ok(&format!("z1,{:x},1", addr))?)
    }

    fn resume(&mut self) -> CaptureResult<()> {
        Ok(self.send_packet("c")?)
    }

    fn step(&mut self) -> CaptureResult<StopEvent> {
        self.send_packet("s")?;
        Ok(self.read_stop()?)
    }

    fn wait_for_stop(&mut self) -> CaptureResult<StopEvent> {
        Ok(self.read_stop()?)
    }

    fn interrupt(&mut self) -> CaptureResult<StopEvent> {
        self.stream.write_all(&[INTERRUPT])?;
        Ok(self.read_stop()?)
    }

    fn detach(&mut self) -> CaptureResult<()> {
        tracing::info!("Detaching from gdbstub");
        Ok(self.expect_ok("D")?)
    }
}
