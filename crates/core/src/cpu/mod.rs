//! Register file extraction from the host's live x86 CPU object.
//!
//! The host process is debugged like any other program; `CPUX86State` is
//! read field by field using offsets pinned in configuration.

use qsnap_config::{CpuLayout, CpuLocator, EnvLocation};

use crate::debug::{DebugSession, ExecutionControl, Register, StopEvent};
use crate::regs::{
    GlobalSegment, RegisterFile, Segment, APIC_BASE_DEFAULT, FPCW_DEFAULT, FPST_EMPTY,
    SFMASK_DEFAULT,
};
use crate::signal::{CompletionSignal, WaitOptions};
use crate::store::AddressStore;
use crate::{CaptureError, CaptureResult};

/// `SegmentCache { u32 selector; u64 base; u32 limit; u32 flags; }`
const SEG_SELECTOR: u64 = 0;
const SEG_BASE: u64 = 8;
const SEG_LIMIT: u64 = 16;
const SEG_FLAGS: u64 = 20;
const SEG_SIZE: u64 = 24;

// Indices into `segs[]`.
const R_ES: u64 = 0;
const R_CS: u64 = 1;
const R_SS: u64 = 2;
const R_DS: u64 = 3;
const R_FS: u64 = 4;
const R_GS: u64 = 5;

/// Host order of `regs[]`: rax rcx rdx rbx rsp rbp rsi rdi r8..r15.
const GPR_COUNT: u64 = 16;

#[derive(Debug, Clone, Copy)]
struct RawSegment {
    selector: u32,
    base: u64,
    limit: u32,
    flags: u32,
}

pub struct CpuStateExtractor<'a> {
    layout: &'a CpuLayout,
}

impl<'a> CpuStateExtractor<'a> {
    pub fn new(layout: &'a CpuLayout) -> Self {
        Self { layout }
    }

    /// Address of `CPUX86State` for the `CPUState` at `cpu_state`.
    pub fn env_address(&self, dbg: &mut dyn DebugSession, cpu_state: u64) -> CaptureResult<u64> {
        match self.layout.env {
            EnvLocation::Embedded(offset) => Ok(cpu_state.wrapping_add(offset)),
            EnvLocation::Pointer(offset) => dbg.read_u64(cpu_state.wrapping_add(offset)),
        }
    }

    fn segment(&self, dbg: &mut dyn DebugSession, addr: u64) -> CaptureResult<RawSegment> {
        Ok(RawSegment {
            selector: dbg.read_u32(addr + SEG_SELECTOR)?,
            base: dbg.read_u64(addr + SEG_BASE)?,
            limit: dbg.read_u32(addr + SEG_LIMIT)?,
            flags: dbg.read_u32(addr + SEG_FLAGS)?,
        })
    }

    fn cached(&self, dbg: &mut dyn DebugSession, addr: u64) -> CaptureResult<Segment> {
        let s = self.segment(dbg, addr)?;
        Ok(Segment::from_raw(s.selector, s.base, s.limit, s.flags))
    }

    fn table(&self, dbg: &mut dyn DebugSession, addr: u64) -> CaptureResult<GlobalSegment> {
        let s = self.segment(dbg, addr)?;
        Ok(GlobalSegment {
            base: s.base,
            limit: s.limit as u64,
        })
    }

    pub fn extract(&self, dbg: &mut dyn DebugSession, env: u64) -> CaptureResult<RegisterFile> {
        let l = self.layout;
        let at = |offset: u64| env.wrapping_add(offset);

        let bytes = dbg.read_memory(at(l.regs), (GPR_COUNT * 8) as usize)?;
        if bytes.len() < (GPR_COUNT * 8) as usize {
            return Err(CaptureError::Debugger(format!(
                "short read of general purpose registers at {:#x}",
                at(l.regs)
            )));
        }
        let gpr: Vec<u64> = bytes
            .chunks_exact(8)
            .map(|c| {
                let mut b = [0u8; 8];
                b.copy_from_slice(c);
                u64::from_le_bytes(b)
            })
            .collect();

        let seg = |i: u64| at(l.segs + i * SEG_SIZE);
        let tr = self.segment(dbg, at(l.tr))?;

        let regs = RegisterFile {
            rax: gpr[0],
            rcx: gpr[1],
            rdx: gpr[2],
            rbx: gpr[3],
            rsp: gpr[4],
            rbp: gpr[5],
            rsi: gpr[6],
            rdi: gpr[7],
            r8: gpr[8],
            r9: gpr[9],
            r10: gpr[10],
            r11: gpr[11],
            r12: gpr[12],
            r13: gpr[13],
            r14: gpr[14],
            r15: gpr[15],
            rip: dbg.read_u64(at(l.eip))?,
            rflags: dbg.read_u64(at(l.eflags))?,

            dr0: dbg.read_u64(at(l.dr))?,
            dr1: dbg.read_u64(at(l.dr + 8))?,
            dr2: dbg.read_u64(at(l.dr + 16))?,
            dr3: dbg.read_u64(at(l.dr + 24))?,
            dr6: dbg.read_u64(at(l.dr + 48))?,
            dr7: dbg.read_u64(at(l.dr + 56))?,

            es: self.cached(dbg, seg(R_ES))?,
            cs: self.cached(dbg, seg(R_CS))?,
            ss: self.cached(dbg, seg(R_SS))?,
            ds: self.cached(dbg, seg(R_DS))?,
            fs: self.cached(dbg, seg(R_FS))?,
            gs: self.cached(dbg, seg(R_GS))?,
            tr: Segment::task_register(tr.selector, tr.base, tr.limit, tr.flags),
            ldtr: self.cached(dbg, at(l.ldt))?,

            tsc: dbg.read_u64(at(l.tsc))?,
            sysenter_cs: dbg.read_u32(at(l.sysenter_cs))? as u64,
            sysenter_esp: dbg.read_u64(at(l.sysenter_esp))?,
            sysenter_eip: dbg.read_u64(at(l.sysenter_eip))?,
            pat: dbg.read_u64(at(l.pat))?,
            efer: dbg.read_u64(at(l.efer))?,
            star: dbg.read_u64(at(l.star))?,
            lstar: dbg.read_u64(at(l.lstar))?,
            cstar: dbg.read_u64(at(l.cstar))?,
            fmask: dbg.read_u64(at(l.fmask))?,
            kernel_gs_base: dbg.read_u64(at(l.kernel_gs_base))?,
            tsc_aux: dbg.read_u64(at(l.tsc_aux))?,
            mxcsr: dbg.read_u32(at(l.mxcsr))? as u64,

            cr0: dbg.read_u64(at(l.cr))?,
            cr2: dbg.read_u64(at(l.cr + 16))?,
            cr3: dbg.read_u64(at(l.cr + 24))?,
            cr4: dbg.read_u64(at(l.cr + 32))?,
            cr8: 0,
            xcr0: dbg.read_u64(at(l.xcr0))?,

            gdtr: self.table(dbg, at(l.gdt))?,
            idtr: self.table(dbg, at(l.idt))?,

            fpop: dbg.read_u16(at(l.fpop))? as u64,
            apic_base: APIC_BASE_DEFAULT,
            sfmask: SFMASK_DEFAULT,
            fpcw: FPCW_DEFAULT,
            fpsw: 0,
            fptw: 0,
            mxcsr_mask: 0,
            fpst: std::array::from_fn(|_| FPST_EMPTY.to_string()),
        };

        tracing::info!(
            "Extracted CPU state: rip={:#x} cr3={:#x} lstar={:#x}",
            regs.rip,
            regs.cr3,
            regs.lstar
        );
        Ok(regs)
    }
}

/// Find the host's `CPUState` for the guest's first CPU.
pub fn locate_cpu_state<E: ExecutionControl>(
    dbg: &mut E,
    locator: &CpuLocator,
) -> CaptureResult<u64> {
    match *locator {
        CpuLocator::Pointer(addr) => {
            let cpu = dbg.read_u64(addr)?;
            tracing::debug!("CPUState at {:#x} (via pointer at {:#x})", cpu, addr);
            Ok(cpu)
        }
        CpuLocator::Breakpoint(addr) => {
            dbg.insert_breakpoint(addr)?;
            dbg.resume()?;
            let event = dbg.wait_for_stop()?;
            dbg.remove_breakpoint(addr)?;
            if let StopEvent::Exited(code) = event {
                return Err(CaptureError::TargetExited(code));
            }
            let cpu = dbg.read_register(Register::Rdi)?;
            tracing::debug!("CPUState at {:#x} (first argument at {:#x})", cpu, addr);
            Ok(cpu)
        }
    }
}

/// Resolve the CPU while the guest still runs, let the host run until a
/// capture session posts its request, then stop the host and extract.
///
/// vCPU threads of a guest halted in its own gdbstub never enter the
/// execution loop, so a breakpoint locator only works before the request.
pub fn extract_on_request<E: ExecutionControl>(
    dbg: &mut E,
    locator: &CpuLocator,
    layout: &CpuLayout,
    signal: &CompletionSignal,
    opts: WaitOptions,
) -> CaptureResult<RegisterFile> {
    let extractor = CpuStateExtractor::new(layout);
    let cpu = locate_cpu_state(dbg, locator)?;
    let env = extractor.env_address(dbg, cpu)?;

    dbg.resume()?;
    let requested = signal.wait_for_request(opts);
    let event = dbg.interrupt()?;
    let token = requested?;
    if let StopEvent::Exited(code) = event {
        return Err(CaptureError::TargetExited(code));
    }
    tracing::info!("Capture request {} received, extracting", token);
    extractor.extract(dbg, env)
}

/// Hand the register file over to a waiting capture session.
pub fn publish(
    regs: &RegisterFile,
    signal: &CompletionSignal,
    store: &AddressStore,
) -> CaptureResult<()> {
    store.merge_addresses([("entry_syscall", regs.lstar)])?;
    regs.write_to(signal.regs_path())?;
    signal.complete()?;
    tracing::info!("Wrote CPU registers to {:?}", signal.regs_path());
    Ok(())
}
