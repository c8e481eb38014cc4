// Per-process top-level page table. Mappings, accessed/dirty bits, and the
// user-copy path that observes them behave like the hardware walker; the
// actual radix tree is collapsed into an ordered index of 4 KiB entries.
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use spin::Mutex;
use x86_64::structures::paging::PageTableFlags;
use x86_64::VirtAddr;

use crate::memory::{pg_ofs, pg_round_down, PAGE_SIZE};

pub type Pml4Ref = Arc<Mutex<Pml4>>;

/// A data-access trap, in the shape the fault resolver consumes.
#[derive(Debug, Clone, Copy)]
pub struct PageFault {
    pub addr: VirtAddr,
    pub write: bool,
    pub not_present: bool,
}

#[derive(Debug, Clone, Copy)]
struct Pml4Entry {
    kva: usize,
    flags: PageTableFlags,
}

pub struct Pml4 {
    entries: BTreeMap<VirtAddr, Pml4Entry>,
}

impl Pml4 {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    pub fn new_ref() -> Pml4Ref {
        Arc::new(Mutex::new(Pml4::new()))
    }

    /// Install `va -> kva`. Fails if the slot is already mapped.
    pub fn set_page(&mut self, va: VirtAddr, kva: usize, writable: bool) -> bool {
        let va = pg_round_down(va);
        if self.entries.contains_key(&va) {
            return false;
        }
        let mut flags =
            PageTableFlags::PRESENT | PageTableFlags::USER_ACCESSIBLE;
        if writable {
            flags |= PageTableFlags::WRITABLE;
        }
        self.entries.insert(va, Pml4Entry { kva, flags });
        true
    }

    /// Remove the mapping for `va` and invalidate it. A later access through
    /// this table faults rather than reaching the old frame.
    pub fn clear_page(&mut self, va: VirtAddr) {
        self.entries.remove(&pg_round_down(va));
    }

    pub fn is_mapped(&self, va: VirtAddr) -> bool {
        self.entries.contains_key(&pg_round_down(va))
    }

    /// Kernel virtual address of the frame backing `va`, if mapped.
    pub fn translate(&self, va: VirtAddr) -> Option<usize> {
        self.entries
            .get(&pg_round_down(va))
            .map(|e| e.kva + pg_ofs(va) as usize)
    }

    pub fn flags(&self, va: VirtAddr) -> Option<PageTableFlags> {
        self.entries.get(&pg_round_down(va)).map(|e| e.flags)
    }

    pub fn is_accessed(&self, va: VirtAddr) -> bool {
        self.flags(va)
            .map_or(false, |f| f.contains(PageTableFlags::ACCESSED))
    }

    pub fn set_accessed(&mut self, va: VirtAddr, accessed: bool) {
        if let Some(e) = self.entries.get_mut(&pg_round_down(va)) {
            e.flags.set(PageTableFlags::ACCESSED, accessed);
        }
    }

    pub fn is_dirty(&self, va: VirtAddr) -> bool {
        self.flags(va)
            .map_or(false, |f| f.contains(PageTableFlags::DIRTY))
    }

    /// Copy out of user memory, marking each touched page accessed. Stops at
    /// the first unmapped page and reports the fault.
    pub fn read_user(&mut self, va: VirtAddr, buf: &mut [u8]) -> Result<(), PageFault> {
        self.user_copy(va, buf.len(), false, |kva, off, len, buf_off| unsafe {
            core::ptr::copy_nonoverlapping(
                (kva + off) as *const u8,
                buf[buf_off..].as_mut_ptr(),
                len,
            );
        })
    }

    /// Copy into user memory, marking each touched page accessed and dirty.
    /// Write access to a read-only mapping traps like the MMU would.
    pub fn write_user(&mut self, va: VirtAddr, data: &[u8]) -> Result<(), PageFault> {
        self.user_copy(va, data.len(), true, |kva, off, len, buf_off| unsafe {
            core::ptr::copy_nonoverlapping(
                data[buf_off..].as_ptr(),
                (kva + off) as *mut u8,
                len,
            );
        })
    }

    fn user_copy(
        &mut self,
        va: VirtAddr,
        len: usize,
        write: bool,
        mut copy: impl FnMut(usize, usize, usize, usize),
    ) -> Result<(), PageFault> {
        let mut cursor = va;
        let mut done = 0usize;
        while done < len {
            let page = pg_round_down(cursor);
            let off = pg_ofs(cursor) as usize;
            let chunk = (PAGE_SIZE - off).min(len - done);

            let entry = match self.entries.get_mut(&page) {
                Some(e) => e,
                None => {
                    return Err(PageFault {
                        addr: cursor,
                        write,
                        not_present: true,
                    })
                }
            };
            if write && !entry.flags.contains(PageTableFlags::WRITABLE) {
                return Err(PageFault {
                    addr: cursor,
                    write: true,
                    not_present: false,
                });
            }

            entry.flags |= PageTableFlags::ACCESSED;
            if write {
                entry.flags |= PageTableFlags::DIRTY;
            }
            copy(entry.kva, off, chunk, done);

            done += chunk;
            cursor = VirtAddr::new(cursor.as_u64() + chunk as u64);
        }
        Ok(())
    }
}
