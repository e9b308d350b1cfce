//! Narrow capability interface over a stopped debuggee.
//!
//! Everything the capture pipeline needs from a debugger goes through these
//! two traits: typed register and memory access, plus the handful of
//! execution-control primitives the driver loop uses.

use crate::{CaptureError, CaptureResult};

/// x86-64 registers, numbered as in the GDB remote protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Register {
    Rax = 0,
    Rbx,
    Rcx,
    Rdx,
    Rsi,
    Rdi,
    Rbp,
    Rsp,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
    Rip,
    Eflags,
    Cs,
    Ss,
    Ds,
    Es,
    Fs,
    Gs,
}

impl Register {
    pub fn gdb_number(self) -> usize {
        self as usize
    }

    /// Width of the register in the remote protocol, in bytes.
    pub fn width(self) -> usize {
        if self.gdb_number() <= Register::Rip.gdb_number() {
            8
        } else {
            4
        }
    }
}

/// State access on a halted target.
pub trait DebugSession {
    fn read_register(&mut self, reg: Register) -> CaptureResult<u64>;
    fn write_register(&mut self, reg: Register, value: u64) -> CaptureResult<()>;
    fn read_memory(&mut self, addr: u64, len: usize) -> CaptureResult<Vec<u8>>;
    fn write_memory(&mut self, addr: u64, data: &[u8]) -> CaptureResult<()>;

    fn read_u16(&mut self, addr: u64) -> CaptureResult<u16> {
        let b = self.read_memory(addr, 2)?;
        // Little Endian
        Ok(u16::from_le_bytes(exact(&b, addr)?))
    }

    fn read_u32(&mut self, addr: u64) -> CaptureResult<u32> {
        let b = self.read_memory(addr, 4)?;
        Ok(u32::from_le_bytes(exact(&b, addr)?))
    }

    fn read_u64(&mut self, addr: u64) -> CaptureResult<u64> {
        let b = self.read_memory(addr, 8)?;
        Ok(u64::from_le_bytes(exact(&b, addr)?))
    }
}

fn exact<const N: usize>(bytes: &[u8], addr: u64) -> CaptureResult<[u8; N]> {
    bytes
        .get(..N)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| {
            CaptureError::Debugger(format!(
                "short read at {:#x}: wanted {} bytes, got {}",
                addr,
                N,
                bytes.len()
            ))
        })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopEvent {
    Signal(u8),
    Exited(u8),
}

/// Execution control used by the capture driver and the CPU locator.
pub trait ExecutionControl: DebugSession {
    fn insert_breakpoint(&mut self, addr: u64) -> CaptureResult<()>;
    fn remove_breakpoint(&mut self, addr: u64) -> CaptureResult<()>;
    /// Resume without waiting for the next stop.
    fn resume(&mut self) -> CaptureResult<()>;
    fn step(&mut self) -> CaptureResult<StopEvent>;
    fn wait_for_stop(&mut self) -> CaptureResult<StopEvent>;
    /// Stop a running target and return the resulting stop.
    fn interrupt(&mut self) -> CaptureResult<StopEvent>;
    fn detach(&mut self) -> CaptureResult<()>;
}
