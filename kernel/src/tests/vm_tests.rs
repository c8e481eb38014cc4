use x86_64::VirtAddr;

use crate::fs::File;
use crate::memory::mmap::do_mmap;
use crate::memory::page::{VmMarkers, VmTag, VmType};
use crate::memory::vm::vm_alloc_page;
use crate::memory::{MAX_STACK_SIZE, PAGE_SIZE, USER_STACK};
use crate::process::{InterruptFrame, Process};
use crate::tests::{new_vm, read_byte, read_user, write_user};

#[test]
fn stack_grows_on_fault_near_rsp() {
    let vm = new_vm(4, 8);
    let mut proc = Process::new(1);
    let rsp = 0x4747F000u64;
    let frame = InterruptFrame::new(rsp);

    assert!(vm.try_handle_fault(&mut proc, &frame, VirtAddr::new(rsp), true, true, true));

    let page = proc.spt.find(VirtAddr::new(rsp)).expect("no stack page");
    let page = page.lock();
    assert_eq!(page.tag(), VmTag::Anon);
    assert!(page.is_resident());
    assert!(page.writable);
    assert!(page.markers.contains(VmMarkers::MARKER_0));
    assert_eq!(proc.spt.len(), 1);
}

#[test]
fn stack_growth_claims_up_to_mapped_pages() {
    let vm = new_vm(8, 8);
    let mut proc = Process::new(1);
    let addr = USER_STACK - 3 * PAGE_SIZE as u64;
    let frame = InterruptFrame::new(addr);

    assert!(vm.try_handle_fault(&mut proc, &frame, VirtAddr::new(addr), true, true, true));
    assert_eq!(proc.spt.len(), 3);
    for i in 0..3 {
        let va = VirtAddr::new(addr + i * PAGE_SIZE as u64);
        assert!(proc.spt.find(va).unwrap().lock().is_resident());
    }
}

#[test]
fn faults_outside_the_stack_window_fail() {
    let vm = new_vm(4, 8);
    let mut proc = Process::new(1);

    // Below the 1 MiB window.
    let below = USER_STACK - MAX_STACK_SIZE - PAGE_SIZE as u64;
    let frame = InterruptFrame::new(below);
    assert!(!vm.try_handle_fault(&mut proc, &frame, VirtAddr::new(below), true, true, true));

    // Nowhere near the stack, no SPT entry.
    let frame = InterruptFrame::new(0x4747F000);
    assert!(!vm.try_handle_fault(&mut proc, &frame, VirtAddr::new(0x100000), true, false, true));
}

#[test]
fn stack_growth_requires_unmapped_rsp() {
    let vm = new_vm(4, 8);
    let mut proc = Process::new(1);
    let rsp = 0x4747F000u64;
    vm.claim_page(&mut proc, VirtAddr::new(rsp)).unwrap();

    // rsp's page is reserved, so a fault further down is not stack growth.
    let frame = InterruptFrame::new(rsp);
    assert!(!vm.try_handle_fault(
        &mut proc,
        &frame,
        VirtAddr::new(rsp - PAGE_SIZE as u64),
        true,
        true,
        true
    ));
}

#[test]
fn write_to_present_page_fails() {
    let vm = new_vm(4, 8);
    let mut proc = Process::new(1);
    let va = VirtAddr::new(0x100000);
    vm.claim_page(&mut proc, va).unwrap();

    let frame = InterruptFrame::new(0);
    assert!(!vm.try_handle_fault(&mut proc, &frame, va, true, true, false));
}

#[test]
fn write_fault_on_readonly_page_claims_it() {
    let vm = new_vm(4, 8);
    let mut proc = Process::new(1);
    let va = VirtAddr::new(0x100000);
    vm_alloc_page(&mut proc, VmType::ANON, va, false).unwrap();

    // Any fault on a reserved page claims it, writability aside; the
    // mapping comes up read-only.
    let frame = InterruptFrame::new(0);
    assert!(vm.try_handle_fault(&mut proc, &frame, va, true, true, true));
    let page = proc.spt.find(va).unwrap();
    assert!(page.lock().is_resident());
    assert!(proc.pml4.lock().is_mapped(va));

    // Retrying the store now traps as a write to a present page, which
    // the resolver refuses.
    let fault = {
        let mut pml4 = proc.pml4.lock();
        pml4.write_user(va, &[1]).unwrap_err()
    };
    assert!(!fault.not_present);
    assert!(!vm.try_handle_fault(
        &mut proc,
        &frame,
        fault.addr,
        true,
        fault.write,
        fault.not_present
    ));
}

#[test]
fn eviction_cycle_preserves_contents() {
    let vm = new_vm(4, 16);
    let mut proc = Process::new(1);
    let base = 0x200000u64;

    for i in 0..5u8 {
        let va = base + i as u64 * PAGE_SIZE as u64;
        vm_alloc_page(&mut proc, VmType::ANON, VirtAddr::new(va), true).unwrap();
        write_user(&vm, &mut proc, va, &[i + 1]);
    }
    // Five pages, four frames: someone got swapped out.
    assert_eq!(vm.free_frames(), 0);
    assert_eq!(vm.swap_slots_used(), 1);

    for i in 0..5u8 {
        let va = base + i as u64 * PAGE_SIZE as u64;
        assert_eq!(read_byte(&vm, &mut proc, va), i + 1);
    }
}

#[test]
fn swap_roundtrip_preserves_whole_page() {
    let vm = new_vm(1, 8);
    let mut proc = Process::new(1);
    let (a, b) = (0x200000u64, 0x201000u64);

    let mut image = vec![0u8; PAGE_SIZE];
    for (i, byte) in image.iter_mut().enumerate() {
        *byte = (i % 251) as u8;
    }
    vm_alloc_page(&mut proc, VmType::ANON, VirtAddr::new(a), true).unwrap();
    write_user(&vm, &mut proc, a, &image);

    // The pool has one frame; claiming b forces a out.
    vm.claim_page(&mut proc, VirtAddr::new(b)).unwrap();
    assert!(proc.spt.find(VirtAddr::new(a)).unwrap().lock().is_swapped_out());

    let mut back = vec![0u8; PAGE_SIZE];
    read_user(&vm, &mut proc, a, &mut back);
    assert_eq!(back, image);
    // The slot was released on swap-in.
    assert_eq!(vm.swap_slots_used(), 1); // b is now the swapped page
}

#[test]
fn fork_then_diverge() {
    let vm = new_vm(8, 8);
    let mut parent = Process::new(1);
    let mut child = Process::new(2);
    let va = 0x300000u64;

    vm_alloc_page(&mut parent, VmType::ANON, VirtAddr::new(va), true).unwrap();
    write_user(&vm, &mut parent, va, &[0x11]);

    vm.spt_copy(&mut child, &parent).unwrap();
    write_user(&vm, &mut child, va, &[0x22]);

    assert_eq!(read_byte(&vm, &mut parent, va), 0x11);
    assert_eq!(read_byte(&vm, &mut child, va), 0x22);

    // Distinct frames back the two copies.
    let pf = parent.spt.find(VirtAddr::new(va)).unwrap().lock().frame;
    let cf = child.spt.find(VirtAddr::new(va)).unwrap().lock().frame;
    assert_ne!(pf, cf);
}

#[test]
fn fork_copies_a_swapped_out_page() {
    let vm = new_vm(1, 8);
    let mut parent = Process::new(1);
    let mut child = Process::new(2);
    let (a, b) = (0x300000u64, 0x301000u64);

    let mut image = vec![0u8; PAGE_SIZE];
    for (i, byte) in image.iter_mut().enumerate() {
        *byte = (i % 199) as u8;
    }
    vm_alloc_page(&mut parent, VmType::ANON, VirtAddr::new(a), true).unwrap();
    write_user(&vm, &mut parent, a, &image);
    vm.claim_page(&mut parent, VirtAddr::new(b)).unwrap();
    assert!(parent.spt.find(VirtAddr::new(a)).unwrap().lock().is_swapped_out());

    vm.spt_copy(&mut child, &parent).unwrap();

    let mut back = vec![0u8; PAGE_SIZE];
    read_user(&vm, &mut child, a, &mut back);
    assert_eq!(back, image);
    // The parent's copy is still intact.
    read_user(&vm, &mut parent, a, &mut back);
    assert_eq!(back, image);
}

#[test]
fn fork_keeps_untouched_pages_lazy() {
    let vm = new_vm(4, 8);
    let mut parent = Process::new(1);
    let mut child = Process::new(2);
    let addr = VirtAddr::new(0x10000);
    let file = File::new(vec![b'A'; PAGE_SIZE]);

    do_mmap(&mut parent, addr, PAGE_SIZE, true, file, 0).unwrap();
    vm.spt_copy(&mut child, &parent).unwrap();

    let page = child.spt.find(addr).unwrap();
    assert_eq!(page.lock().tag(), VmTag::Uninit);
    assert_eq!(page.lock().eventual_tag(), VmTag::File);
    assert_eq!(read_byte(&vm, &mut child, 0x10000), b'A');
}

#[test]
fn exit_flushes_mappings_and_releases_resources() {
    let vm = new_vm(2, 8);
    let mut proc = Process::new(1);
    let file = File::new(vec![0u8; PAGE_SIZE]);

    // Anonymous pages, one of which ends up in swap.
    for va in [0x200000u64, 0x201000] {
        vm_alloc_page(&mut proc, VmType::ANON, VirtAddr::new(va), true).unwrap();
        write_user(&vm, &mut proc, va, &[0x5A]);
    }
    do_mmap(&mut proc, VirtAddr::new(0x10000), PAGE_SIZE, true, file.clone(), 0).unwrap();
    write_user(&vm, &mut proc, 0x10000, &[0xAB]);
    assert!(vm.swap_slots_used() > 0);

    vm.spt_kill(&mut proc);

    assert!(proc.spt.is_empty());
    assert_eq!(vm.free_frames(), vm.pool_pages());
    assert_eq!(vm.swap_slots_used(), 0);
    // The dirty mapping was written back on the way out.
    let mut buf = [0u8; 1];
    file.read_at(&mut buf, 0);
    assert_eq!(buf[0], 0xAB);
    assert_eq!(file.write_count(), 1);
}

#[test]
fn type_encoding_roundtrips() {
    let ty = VmType::ANON.with_markers(VmMarkers::MARKER_0);
    assert_eq!(ty.bits(), 0b1001);
    let back = VmType::from_bits(ty.bits()).unwrap();
    assert_eq!(back.tag, VmTag::Anon);
    assert!(back.markers.contains(VmMarkers::MARKER_0));
    assert_eq!(VmType::from_bits(0b111), None);
}

#[test]
fn claim_is_idempotent_for_resident_pages() {
    let vm = new_vm(2, 4);
    let mut proc = Process::new(1);
    let va = VirtAddr::new(0x400000);

    vm.claim_page(&mut proc, va).unwrap();
    write_user(&vm, &mut proc, 0x400000, &[9]);
    vm.claim_page(&mut proc, va).unwrap();
    assert_eq!(read_byte(&vm, &mut proc, 0x400000), 9);
    assert_eq!(vm.free_frames(), 1);
}

#[test]
fn global_core_installs_once() {
    use crate::drivers::disk::RamDisk;
    use crate::memory::vm::{vm, vm_init};

    let first = vm_init(Box::new(RamDisk::new(64)), 2);
    let again = vm_init(Box::new(RamDisk::new(64)), 2);
    assert!(core::ptr::eq(first, again));
    assert!(core::ptr::eq(first, vm()));
}
