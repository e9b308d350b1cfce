// qsnap - Breakpoint-driven VM snapshot capture
// Copyright (C) 2026 qsnap Team
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! GDB Remote Serial Protocol client.
//!
//! Talks to a gdbstub over TCP (the virtualization platform's own stub for
//! the guest, or gdbserver for the host process) and exposes it through the
//! capture pipeline's debugger traits.
//!
//! Protocol reference: https://sourceware.org/gdb/onlinedocs/gdb/Remote-Protocol.html

pub mod client;
pub mod packet;

pub use client::RspClient;

use qsnap_core::CaptureError;

#[derive(Debug, thiserror::Error)]
pub enum RspError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("connection closed by the remote stub")]
    Disconnected,
    #[error("packet '{0}' rejected by the remote stub")]
    Rejected(String),
    #[error("remote error E{code:02x} for '{cmd}'")]
    Remote { code: u8, cmd: String },
    #[error("'{0}' is not supported by the remote stub")]
    Unsupported(String),
    #[error("unexpected reply '{reply}' to '{cmd}'")]
    Unexpected { cmd: String, reply: String },
}

pub type RspResult<T> = std::result::Result<T, RspError>;

impl From<RspError> for CaptureError {
    fn from(e: RspError) -> Self {
        CaptureError::Debugger(e.to_string())
    }
}
