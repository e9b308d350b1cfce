pub mod capture;
pub mod cpu;
pub mod debug;
pub mod dump;
pub mod kernel;
pub mod monitor;
pub mod patch;
pub mod regs;
pub mod signal;
pub mod store;
pub mod target;

use std::path::PathBuf;
use std::time::Duration;


#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Debugger error: {0}")]
    Debugger(String),
    #[error("Target exited with status {0:#x}")]
    TargetExited(u8),
    #[error("VM monitor connection closed before the prompt was seen")]
    MonitorDisconnected,
    #[error("No CPU state dump appeared within {0:?}")]
    ExternalDumpTimeout(Duration),
    #[error("Pinning sequence trapped at {0:#x}, mlockall failed")]
    PinFailed(u64),
    #[error("Dump format invariant violated: {0}")]
    FormatInvariant(String),
    #[error("Raw memory image holds no full page ({0} bytes)")]
    EmptyImage(u64),
    #[error("Address store lock {0:?} is held by another writer")]
    StoreLocked(PathBuf),
    #[error("Path {0:?} cannot be passed to the VM monitor (whitespace or non-UTF-8)")]
    MonitorPath(PathBuf),
    #[error("Capture session received a stop before it was armed")]
    NotArmed,
}

pub type CaptureResult<T> = Result<T, CaptureError>;
