// The slice of process state the VM core works against. Scheduling, ELF
// loading, and the rest of the process machinery live outside this crate.
use crate::memory::paging::{Pml4, Pml4Ref};
use crate::memory::spt::SupplementalPageTable;

/// Trap-time register state the fault resolver consumes. The full frame the
/// trap entry path saves is wider; only the user stack pointer matters here.
#[derive(Debug, Clone, Copy)]
pub struct InterruptFrame {
    pub rsp: u64,
}

impl InterruptFrame {
    pub fn new(rsp: u64) -> Self {
        Self { rsp }
    }
}

pub struct Process {
    pub pid: u32,
    pub pml4: Pml4Ref,
    pub spt: SupplementalPageTable,
}

impl Process {
    pub fn new(pid: u32) -> Self {
        Self {
            pid,
            pml4: Pml4::new_ref(),
            spt: SupplementalPageTable::new(),
        }
    }
}
