use crate::debug::DebugSession;
use crate::CaptureResult;

/// Length of `task_struct::comm`.
pub const TASK_COMM_LEN: usize = 16;

/// Address-store keys and the guest kernel symbols they are resolved from.
pub const KERNEL_HANDLERS: [(&str, &str); 5] = [
    ("entry_syscall", "entry_SYSCALL_64"),
    ("asm_exc_page_fault", "asm_exc_page_fault"),
    ("asm_exc_divide_error", "asm_exc_divide_error"),
    ("force_sigsegv", "force_sigsegv"),
    ("page_fault_oops", "page_fault_oops"),
];

/// Offsets used to find the task running on CPU 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskLayout {
    /// Address of `__per_cpu_offset`.
    pub per_cpu_offset: u64,
    /// Per-cpu offset of `current_task`.
    pub current_task: u64,
    /// Offset of `comm` in `struct task_struct`.
    pub comm_offset: u64,
}

impl TaskLayout {
    pub fn current_task(&self, dbg: &mut dyn DebugSession) -> CaptureResult<u64> {
        let cpu_base = dbg.read_u64(self.per_cpu_offset)?;
        dbg.read_u64(cpu_base.wrapping_add(self.current_task))
    }

    pub fn current_process_name(&self, dbg: &mut dyn DebugSession) -> CaptureResult<String> {
        let task = self.current_task(dbg)?;
        let comm = dbg.read_memory(task.wrapping_add(self.comm_offset), TASK_COMM_LEN)?;
        let end = comm.iter().position(|&b| b == 0).unwrap_or(comm.len());
        Ok(String::from_utf8_lossy(&comm[..end]).into_owned())
    }
}
