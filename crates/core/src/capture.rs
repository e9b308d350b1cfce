//! Breakpoint-driven capture: the per-stop state machine and the loop that
//! feeds it debugger stops.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::debug::{DebugSession, ExecutionControl, Register, StopEvent};
use crate::dump::convert_raw_to_dmp;
use crate::kernel::TaskLayout;
use crate::monitor::PhysicalMemoryPersister;
use crate::patch::PatchTracker;
use crate::signal::{CompletionSignal, WaitOptions, REGS_FILE};
use crate::store::{AddressStore, SYMBOL_STORE_FILE};
use crate::target::SnapshotTarget;
use crate::{CaptureError, CaptureResult};

/// Name of the raw physical memory image inside the work directory.
pub const RAW_FILE: &str = "raw";

const SYS_MLOCKALL: u8 = 0x97;
const MCL_CURRENT_FUTURE: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Init,
    WaitIdentity,
    WaitHitCount,
    Pinning,
    Pinned,
    WaitExternalDump,
    Done,
}

/// What the driver should do with the target after a stop was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopAction {
    Resume,
    Halt,
}

#[derive(Debug, Clone)]
pub struct CaptureOptions {
    /// Only count stops while this process is current.
    pub identity: Option<TaskLayout>,
    pub hits_required: u32,
    pub memory_size: u64,
    /// Holds the register file, the address store and the raw image.
    pub work_dir: PathBuf,
    pub wait: WaitOptions,
    /// Additional store entries written on arming (kernel handlers).
    pub extra_addresses: BTreeMap<String, u64>,
}

impl CaptureOptions {
    pub fn new<P: Into<PathBuf>>(work_dir: P) -> Self {
        Self {
            identity: None,
            hits_required: 1,
            memory_size: qsnap_config::DEFAULT_MEMORY_SIZE,
            work_dir: work_dir.into(),
            wait: WaitOptions::default(),
            extra_addresses: BTreeMap::new(),
        }
    }
}

/// `mlockall(MCL_CURRENT | MCL_FUTURE)` wrapped so that every touched
/// register, the flags and the red zone survive. Traps on failure.
pub fn pin_sequence() -> Vec<u8> {
    let mut code = Vec::with_capacity(80);
    // lea rsp, [rsp-128]
    code.extend_from_slice(&[0x48, 0x8d, 0x64, 0x24, 0x80]);
    // pushfq
    code.push(0x9c);
    // rax rbx rcx rdx rbp rdi rsi
    code.extend_from_slice(&[0x50, 0x53, 0x51, 0x52, 0x55, 0x57, 0x56]);
    // r8..r15
    for r in 0x50..=0x57 {
        code.extend_from_slice(&[0x41, r]);
    }
    // mov rax, SYS_mlockall
    code.extend_from_slice(&[0x48, 0xc7, 0xc0, SYS_MLOCKALL, 0x00, 0x00, 0x00]);
    // mov rdi, MCL_CURRENT | MCL_FUTURE
    code.extend_from_slice(&[0x48, 0xc7, 0xc7, MCL_CURRENT_FUTURE, 0x00, 0x00, 0x00]);
    // syscall
    code.extend_from_slice(&[0x0f, 0x05]);
    // test eax, eax ; jz +1 ; int3
    code.extend_from_slice(&[0x85, 0xc0, 0x74, 0x01, 0xcc]);
    // r15..r8
    for r in (0x58..=0x5f).rev() {
        code.extend_from_slice(&[0x41, r]);
    }
    // rsi rdi rbp rdx rcx rbx rax
    code.extend_from_slice(&[0x5e, 0x5f, 0x5d, 0x5a, 0x59, 0x5b, 0x58]);
    // popfq
    code.push(0x9d);
    // lea rsp, [rsp+128]
    code.extend_from_slice(&[0x48, 0x8d, 0xa4, 0x24, 0x80, 0x00, 0x00, 0x00]);
    code
}

pub struct CaptureSession {
    options: CaptureOptions,
    target: SnapshotTarget,
    persister: Box<dyn PhysicalMemoryPersister>,
    signal: CompletionSignal,
    store: AddressStore,
    state: CaptureState,
    hits: u32,
    patches: PatchTracker,
}

impl CaptureSession {
    pub fn new(
        options: CaptureOptions,
        target: SnapshotTarget,
        persister: Box<dyn PhysicalMemoryPersister>,
    ) -> Self {
        let signal = CompletionSignal::in_dir(&options.work_dir);
        let store = AddressStore::in_dir(&options.work_dir);
        Self {
            options,
            target,
            persister,
            signal,
            store,
            state: CaptureState::Init,
            hits: 0,
            patches: PatchTracker::new(),
        }
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    pub fn hits(&self) -> u32 {
        self.hits
    }

    pub fn target(&self) -> &SnapshotTarget {
        &self.target
    }

    /// Prepare the target directory and the store, then start accepting stops.
    pub fn arm(&mut self) -> CaptureResult<()> {
        std::fs::create_dir_all(&self.options.work_dir)?;
        self.target.create_dirs()?;
        self.signal.clear()?;
        self.target.seed_store(&self.store)?;
        if !self.options.extra_addresses.is_empty() {
            self.store
                .merge_addresses(self.options.extra_addresses.clone())?;
        }

        self.state = if self.options.identity.is_some() {
            CaptureState::WaitIdentity
        } else {
            CaptureState::WaitHitCount
        };
        tracing::info!(
            "Capture armed for {} ({} hit(s) required)",
            self.target.program(),
            self.options.hits_required
        );
        Ok(())
    }

    /// Handle one stop at the snapshot breakpoint.
    pub fn on_stop(&mut self, dbg: &mut dyn DebugSession) -> CaptureResult<StopAction> {
        match self.state {
            CaptureState::Init => return Err(CaptureError::NotArmed),
            CaptureState::Done => {
                tracing::debug!("Snapshot already taken, ignoring stop");
                return Ok(StopAction::Resume);
            }
            _ => {}
        }

        if let Some(layout) = self.options.identity {
            let name = layout.current_process_name(dbg)?;
            if !name.contains(self.target.program()) {
                tracing::debug!("Current process is {:?}, resuming", name);
                return Ok(StopAction::Resume);
            }
            if self.state == CaptureState::WaitIdentity {
                self.state = CaptureState::WaitHitCount;
            }
        }

        self.hits += 1;
        if self.hits < self.options.hits_required {
            tracing::info!(
                "Breakpoint hit {}/{}, resuming",
                self.hits,
                self.options.hits_required
            );
            return Ok(StopAction::Resume);
        }

        if self.state != CaptureState::Pinning {
            self.pin(dbg)?;
            return Ok(StopAction::Resume);
        }

        let restored = self.patches.restore(dbg)?;
        tracing::debug!("Restored {} bytes of original code", restored);
        self.state = CaptureState::Pinned;

        self.finish()?;
        Ok(StopAction::Halt)
    }

    fn pin(&mut self, dbg: &mut dyn DebugSession) -> CaptureResult<()> {
        let code = pin_sequence();
        let rip = dbg.read_register(Register::Rip)?;
        let start = rip.checked_sub(code.len() as u64).ok_or_else(|| {
            CaptureError::Debugger(format!("no room for the pin sequence before {:#x}", rip))
        })?;
        tracing::info!("Injecting mlockall at {:#x} ({} bytes)", start, code.len());
        self.patches.patch(dbg, start, &code)?;
        dbg.write_register(Register::Rip, start)?;
        self.state = CaptureState::Pinning;
        Ok(())
    }

    fn finish(&mut self) -> CaptureResult<()> {
        self.state = CaptureState::WaitExternalDump;
        let token = self.signal.request()?;
        tracing::info!(
            "Waiting for the CPU state in {:?}",
            self.signal.regs_path()
        );
        self.signal.wait(&token, self.options.wait)?;

        let raw = absolute(&self.options.work_dir.join(RAW_FILE))?;
        self.persister
            .persist_physical_memory(&raw, self.options.memory_size)?;

        let dump = self.target.dump_path();
        convert_raw_to_dmp(&raw, &dump)?;

        let state_dir = self.target.state_dir();
        move_file(self.signal.regs_path(), &state_dir.join(REGS_FILE))?;
        move_file(self.store.path(), &state_dir.join(SYMBOL_STORE_FILE))?;

        self.state = CaptureState::Done;
        tracing::info!("Snapshot complete in {:?}", state_dir);
        Ok(())
    }
}

fn absolute(path: &Path) -> CaptureResult<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

fn move_file(from: &Path, to: &Path) -> CaptureResult<()> {
    tracing::info!("Moving {:?} to {:?}", from, to);
    if std::fs::rename(from, to).is_err() {
        std::fs::copy(from, to)?;
        std::fs::remove_file(from)?;
    }
    Ok(())
}

/// Drive `session` until the snapshot is taken. The breakpoint is a hardware
/// one so the guest code stays untouched while counting hits.
pub fn run_capture<E: ExecutionControl>(
    dbg: &mut E,
    session: &mut CaptureSession,
    breakpoint: u64,
) -> CaptureResult<()> {
    session.arm()?;
    dbg.insert_breakpoint(breakpoint)?;

    loop {
        if dbg.read_register(Register::Rip)? == breakpoint {
            dbg.remove_breakpoint(breakpoint)?;
            let event = dbg.step()?;
            dbg.insert_breakpoint(breakpoint)?;
            if let StopEvent::Exited(code) = event {
                return Err(CaptureError::TargetExited(code));
            }
        }

        dbg.resume()?;
        let event = dbg.wait_for_stop()?;
        if let StopEvent::Exited(code) = event {
            return Err(CaptureError::TargetExited(code));
        }

        let rip = dbg.read_register(Register::Rip)?;
        if rip != breakpoint {
            // Only reached when the stub reports the pin sequence's int3.
            // With hardware breakpoints alone a guest int3 is usually
            // delivered to the guest kernel as SIGTRAP instead, and a failed
            // mlockall then shows up as the breakpoint never being hit again.
            if session.state() == CaptureState::Pinning {
                return Err(CaptureError::PinFailed(rip));
            }
            tracing::warn!("Unexpected stop at {:#x} ({:?}), resuming", rip, event);
            continue;
        }

        if session.on_stop(dbg)? == StopAction::Halt {
            break;
        }
    }

    // The session stays attached so the guest remains stopped at the
    // snapshot point.
    dbg.remove_breakpoint(breakpoint)?;
    tracing::info!("Guest halted at {:#x}", breakpoint);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pin_sequence_shape() {
        let code = pin_sequence();
        assert_eq!(&code[..5], &[0x48, 0x8d, 0x64, 0x24, 0x80]);
        assert_eq!(code[5], 0x9c);
        assert!(code
            .windows(7)
            .any(|w| w == [0x48, 0xc7, 0xc0, 0x97, 0x00, 0x00, 0x00]));
        assert!(code.windows(2).any(|w| w == [0x0f, 0x05]));
        assert!(code.windows(5).any(|w| w == [0x85, 0xc0, 0x74, 0x01, 0xcc]));
        assert_eq!(code[code.len() - 9], 0x9d);
        assert_eq!(&code[code.len() - 8..], &[0x48, 0x8d, 0xa4, 0x24, 0x80, 0, 0, 0]);
    }

    #[test]
    fn test_pushes_and_pops_balance() {
        let code = pin_sequence();
        let pushes = code.iter().filter(|&&b| (0x50..=0x57).contains(&b)).count();
        let pops = code.iter().filter(|&&b| (0x58..=0x5f).contains(&b)).count();
        assert_eq!(pushes, pops);
        assert_eq!(pushes, 15);
    }
}
