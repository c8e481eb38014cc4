mod vm_tests;

use x86_64::VirtAddr;

use crate::drivers::disk::RamDisk;
use crate::memory::swap::SECTORS_PER_SLOT;
use crate::memory::vm::VmCore;
use crate::process::{InterruptFrame, Process};

pub fn new_vm(pool_pages: usize, swap_slots: usize) -> VmCore {
    let disk = RamDisk::new((swap_slots * SECTORS_PER_SLOT) as u64);
    VmCore::new(Box::new(disk), pool_pages)
}

/// Store through the process's page table, resolving faults like the trap
/// handler would and retrying until the access goes through.
pub fn write_user(vm: &VmCore, proc: &mut Process, va: u64, data: &[u8]) {
    let frame = InterruptFrame::new(0);
    loop {
        let res = {
            let mut pml4 = proc.pml4.lock();
            pml4.write_user(VirtAddr::new(va), data)
        };
        match res {
            Ok(()) => return,
            Err(f) => assert!(
                vm.try_handle_fault(proc, &frame, f.addr, true, f.write, f.not_present),
                "unresolvable write fault at {:?}",
                f.addr
            ),
        }
    }
}

pub fn read_user(vm: &VmCore, proc: &mut Process, va: u64, buf: &mut [u8]) {
    let frame = InterruptFrame::new(0);
    loop {
        let res = {
            let mut pml4 = proc.pml4.lock();
            pml4.read_user(VirtAddr::new(va), buf)
        };
        match res {
            Ok(()) => return,
            Err(f) => assert!(
                vm.try_handle_fault(proc, &frame, f.addr, true, f.write, f.not_present),
                "unresolvable read fault at {:?}",
                f.addr
            ),
        }
    }
}

pub fn read_byte(vm: &VmCore, proc: &mut Process, va: u64) -> u8 {
    let mut buf = [0u8; 1];
    read_user(vm, proc, va, &mut buf);
    buf[0]
}
