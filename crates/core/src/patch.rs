use crate::debug::DebugSession;
use crate::{CaptureError, CaptureResult};
use std::ops::Range;

/// Original bytes under every patch written during a session.
///
/// The saved range always covers the union of all patched ranges. When a
/// later patch reaches outside it, only the newly uncovered bytes are read
/// (they are still pristine) and joined onto the saved buffer.
#[derive(Debug, Default)]
pub struct PatchTracker {
    start: Option<u64>,
    saved: Vec<u8>,
}

impl PatchTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn saved_range(&self) -> Option<Range<u64>> {
        self.start
            .map(|start| start..start + self.saved.len() as u64)
    }

    pub fn saved_bytes(&self) -> &[u8] {
        &self.saved
    }

    /// Write `bytes` at `addr`, remembering what was there first.
    pub fn patch(
        &mut self,
        dbg: &mut dyn DebugSession,
        addr: u64,
        bytes: &[u8],
    ) -> CaptureResult<()> {
        self.save(dbg, addr, bytes.len())?;
        dbg.write_memory(addr, bytes)
    }

    fn save(&mut self, dbg: &mut dyn DebugSession, addr: u64, len: usize) -> CaptureResult<()> {
        let end = addr.checked_add(len as u64).ok_or_else(|| {
            CaptureError::Debugger(format!("patch of {} bytes at {:#x} wraps the address space", len, addr))
        })?;
        let Some(range) = self.saved_range() else {
            tracing::debug!("Saving {} bytes at {:#x}", len, addr);
            self.saved = dbg.read_memory(addr, len)?;
            self.start = Some(addr);
            return Ok(());
        };

        if addr < range.start {
            let prefix_len = (range.start - addr) as usize;
            tracing::debug!(
                "Saving {} bytes from {:#x} to {:#x}",
                prefix_len,
                addr,
                range.start
            );
            let mut prefix = dbg.read_memory(addr, prefix_len)?;
            prefix.append(&mut self.saved);
            self.saved = prefix;
            self.start = Some(addr);
        }

        if end > range.end {
            let suffix_len = (end - range.end) as usize;
            tracing::debug!("Saving {} bytes after {:#x}", suffix_len, range.end);
            let suffix = dbg.read_memory(range.end, suffix_len)?;
            self.saved.extend_from_slice(&suffix);
        }

        Ok(())
    }

    /// Put every saved byte back, lowest address first. Returns the count.
    pub fn restore(&mut self, dbg: &mut dyn DebugSession) -> CaptureResult<usize> {
        let Some(start) = self.start.take() else {
            return Ok(0);
        };
        let saved = std::mem::take(&mut self.saved);
        tracing::info!("Restoring {} bytes at {:#x}", saved.len(), start);
        dbg.write_memory(start, &saved)?;
        Ok(saved.len())
    }
}
