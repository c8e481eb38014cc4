// Memory-mapped files: reserve a run of lazy file-backed pages, and tear a
// mapping down again with dirty-page writeback.
use log::debug;
use x86_64::VirtAddr;

use crate::fs::{File, FILE_LOCK};
use crate::memory::page::{file_segment_loader, LoadSegArgs, PageKind, VmType};
use crate::memory::vm::{vm_alloc_page_with_initializer, VmCore};
use crate::memory::{page_span, pg_ofs, pg_round_down, VmError, PAGE_SIZE};
use crate::process::Process;

/// Map `length` bytes of `file` starting at `offset` into the address space
/// at `addr`. Every page of the range must be unreserved. Returns the
/// mapping address.
pub fn do_mmap(
    proc: &mut Process,
    addr: VirtAddr,
    length: usize,
    writable: bool,
    file: File,
    offset: usize,
) -> Result<VirtAddr, VmError> {
    if pg_ofs(addr) != 0 || offset % PAGE_SIZE != 0 {
        return Err(VmError::Misaligned);
    }
    if length == 0 {
        return Err(VmError::BadSegment);
    }

    let pages = page_span(length);
    for i in 0..pages {
        let va = addr + (i * PAGE_SIZE) as u64;
        if proc.spt.find(va).is_some() {
            return Err(VmError::AddressInUse);
        }
    }

    let mut read_remaining = length;
    let mut ofs = offset;
    for i in 0..pages {
        let va = addr + (i * PAGE_SIZE) as u64;
        let read_bytes = read_remaining.min(PAGE_SIZE);
        let args = LoadSegArgs {
            file: file.clone(),
            offset: ofs,
            read_bytes,
            zero_bytes: PAGE_SIZE - read_bytes,
            segment_length: length,
        };
        if let Err(e) = vm_alloc_page_with_initializer(
            proc,
            VmType::FILE,
            va,
            writable,
            Some(file_segment_loader()),
            Some(args),
        ) {
            for j in 0..i {
                proc.spt.discard(addr + (j * PAGE_SIZE) as u64);
            }
            return Err(e);
        }
        read_remaining -= read_bytes;
        ofs += PAGE_SIZE;
    }

    let head = proc.spt.find(addr).ok_or(VmError::PageNotFound)?;
    head.lock().mmap_length = Some(length);
    proc.spt.register_mmap_head(addr);
    debug!("mmap: {} bytes at {:?} ({} pages)", length, addr, pages);
    Ok(addr)
}

/// Dismantle the mapping whose first page is at `addr`: write dirty resident
/// pages back to the file, then remove every page of the segment.
pub fn do_munmap(vm: &VmCore, proc: &mut Process, addr: VirtAddr) -> Result<(), VmError> {
    let addr = pg_round_down(addr);
    let head = proc.spt.find(addr).ok_or(VmError::PageNotFound)?;
    let length = head.lock().mmap_length.ok_or(VmError::PageNotFound)?;

    let mut remaining = length;
    let mut va = addr;
    while remaining > 0 {
        if let Some(page_ref) = proc.spt.find(va) {
            let page = page_ref.lock();
            if let (PageKind::File(fp), Some(slot)) = (&page.kind, page.frame) {
                let dirty = page
                    .pml4
                    .upgrade()
                    .map_or(false, |p| p.lock().is_dirty(page.va));
                if dirty {
                    let kva = vm.frame_kva(slot);
                    let buf =
                        unsafe { core::slice::from_raw_parts(kva as *const u8, PAGE_SIZE) };
                    let write_bytes = fp.args.read_bytes.min(remaining);
                    debug!(
                        "munmap: writing back {} bytes at file offset {}",
                        write_bytes, fp.args.offset
                    );
                    let _guard = FILE_LOCK.lock();
                    fp.args.file.write_at(&buf[..write_bytes], fp.args.offset);
                }
            }
            drop(page);
            proc.spt.remove(vm, va);
        }
        va += PAGE_SIZE as u64;
        remaining = remaining.saturating_sub(PAGE_SIZE);
    }
    Ok(())
}
