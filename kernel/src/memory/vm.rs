// VmCore: the process-independent half of the virtual memory subsystem.
// Owns the user frame pool, the frame table, and the swap table; resolves
// page faults against the current process's SPT.
use alloc::boxed::Box;
use log::{debug, info};
use spin::{Mutex, MutexGuard, Once};
use x86_64::VirtAddr;

use crate::drivers::disk::DiskDriver;
use crate::memory::frame_allocator::UserPool;
use crate::memory::frame_table::FrameTable;
use crate::memory::mmap::do_munmap;
use crate::memory::page::{
    Initializer, LoadSegArgs, Page, PageKind, PageRef, VmMarkers, VmType,
};
use crate::memory::swap::SwapTable;
use crate::memory::{pg_round_down, VmError, MAX_STACK_SIZE, PAGE_SIZE, USER_STACK};
use crate::process::{InterruptFrame, Process};

pub struct VmCore {
    pool: Mutex<UserPool>,
    frames: Mutex<FrameTable>,
    swap: Mutex<SwapTable>,
}

impl VmCore {
    /// Bring up the subsystem: reserve the user frame pool and size the swap
    /// table off the swap device.
    pub fn new(swap_disk: Box<dyn DiskDriver>, pool_pages: usize) -> Self {
        let pool = UserPool::new(pool_pages);
        let frames = FrameTable::new(pool.base(), pool.pool_pages());
        let swap = SwapTable::new(swap_disk);
        info!(
            "vm: {} user frames, {} swap slots",
            pool_pages,
            swap.slot_count()
        );
        Self {
            pool: Mutex::new(pool),
            frames: Mutex::new(frames),
            swap: Mutex::new(swap),
        }
    }

    pub(crate) fn swap(&self) -> MutexGuard<'_, SwapTable> {
        self.swap.lock()
    }

    pub(crate) fn frame_kva(&self, slot: usize) -> usize {
        self.frames.lock().kva_of(slot)
    }

    /// Unregister the frame at `slot` and return it to the pool.
    pub(crate) fn release_frame(&self, slot: usize) {
        let frame = self.frames.lock().clear(slot);
        if let Some(frame) = frame {
            self.pool.lock().pfree(frame.kva);
        }
    }

    pub fn free_frames(&self) -> usize {
        self.pool.lock().free_pages()
    }

    pub fn pool_pages(&self) -> usize {
        self.pool.lock().pool_pages()
    }

    pub fn swap_slots_used(&self) -> usize {
        self.swap.lock().used_slots()
    }

    /// Obtain a frame slot with no page attached: a fresh frame from the
    /// pool, or, when the pool is dry, a clock victim whose page has been
    /// swapped out. The frame-table lock is dropped before the victim's
    /// writeback runs.
    fn get_frame(&self) -> Result<usize, VmError> {
        if let Some(kva) = self.pool.lock().palloc() {
            return Ok(self.frames.lock().install(kva));
        }
        let (slot, victim) = self
            .frames
            .lock()
            .select_victim()
            .ok_or(VmError::OutOfMemory)?;
        debug!("vm: evicting frame slot {}", slot);
        victim.lock().swap_out(self)?;
        Ok(slot)
    }

    /// Materialize `page`: obtain a frame, link the two, install the
    /// hardware mapping, and run the variant's swap-in. The mapping is
    /// observable before swap-in completes.
    fn claim(&self, page_ref: &PageRef) -> Result<(), VmError> {
        if page_ref.lock().is_resident() {
            return Ok(());
        }
        let slot = self.get_frame()?;
        let kva = self.frame_kva(slot);

        let mut page = page_ref.lock();
        page.frame = Some(slot);
        self.frames.lock().link(slot, page_ref.clone());

        let pml4 = page.pml4.upgrade().expect("claim: page table is gone");
        if !pml4.lock().set_page(page.va, kva, page.writable) {
            panic!("claim: page-table install failed at {:?}", page.va);
        }

        match page.swap_in(self, kva) {
            Ok(()) => Ok(()),
            Err(e) => {
                pml4.lock().clear_page(page.va);
                page.frame = None;
                drop(page);
                self.release_frame(slot);
                Err(e)
            }
        }
    }

    /// Allocate an anonymous page at `va` if none is reserved yet, then
    /// claim it immediately.
    pub fn claim_page(&self, proc: &mut Process, va: VirtAddr) -> Result<(), VmError> {
        let va = pg_round_down(va);
        if proc.spt.find(va).is_none() {
            vm_alloc_page(proc, VmType::ANON, va, true)?;
        }
        let page = proc.spt.find(va).ok_or(VmError::PageNotFound)?;
        self.claim(&page)
    }

    /// Resolve a data-access fault. Returns whether the access may be
    /// retried; a `false` escalates to process termination upstream.
    pub fn try_handle_fault(
        &self,
        proc: &mut Process,
        f: &InterruptFrame,
        addr: VirtAddr,
        _user: bool,
        write: bool,
        not_present: bool,
    ) -> bool {
        // Write to a present page: write-protection recovery is out of scope.
        if !not_present && write {
            return false;
        }

        let va = pg_round_down(addr);
        if let Some(page_ref) = proc.spt.find(va) {
            debug!("vm: fault at {:?}, claiming", addr);
            return self.claim(&page_ref).is_ok();
        }

        let stack_floor = USER_STACK - MAX_STACK_SIZE;
        let in_window = addr.as_u64() >= stack_floor && addr.as_u64() < USER_STACK;
        let rsp_page = pg_round_down(VirtAddr::new(f.rsp));
        if in_window && proc.spt.find(rsp_page).is_none() {
            return self.grow_stack(proc, va).is_ok();
        }

        debug!("vm: unresolvable fault at {:?}", addr);
        false
    }

    /// Extend the stack with claimed anonymous pages from `va` up to the
    /// first page that is already reserved.
    fn grow_stack(&self, proc: &mut Process, va: VirtAddr) -> Result<(), VmError> {
        debug!("vm: growing stack at {:?}", va);
        let mut cursor = va;
        while cursor.as_u64() < USER_STACK && proc.spt.find(cursor).is_none() {
            vm_alloc_page(
                proc,
                VmType::ANON.with_markers(VmMarkers::MARKER_0),
                cursor,
                true,
            )?;
            let page = proc.spt.find(cursor).ok_or(VmError::PageNotFound)?;
            self.claim(&page)?;
            cursor += PAGE_SIZE as u64;
        }
        Ok(())
    }

    /// Fork support: rebuild `src`'s SPT in `dst`, duplicating memory
    /// eagerly for every source page that has contents of its own.
    pub fn spt_copy(&self, dst: &mut Process, src: &Process) -> Result<(), VmError> {
        for (&va, src_ref) in src.spt.iter() {
            let src_page = src_ref.lock();
            let ty = VmType {
                tag: src_page.eventual_tag(),
                markers: src_page.markers,
            };
            let (init, aux) = src_page.initializer_pair();
            let writable = src_page.writable;
            let mmap_length = src_page.mmap_length;
            let needs_copy = src_page.is_resident() || src_page.is_swapped_out();
            let lazy = matches!(src_page.kind, PageKind::Uninit(_));
            drop(src_page);

            vm_alloc_page_with_initializer(dst, ty, va, writable, init, aux)?;
            let dst_ref = dst.spt.find(va).ok_or(VmError::PageNotFound)?;
            dst_ref.lock().mmap_length = mmap_length;

            if lazy || !needs_copy {
                // Uninitialized and file-resident-in-file sources stay lazy;
                // the child's first touch re-derives them.
                continue;
            }

            self.claim(&dst_ref)?;
            let dst_kva = {
                let d = dst_ref.lock();
                self.frame_kva(d.frame.ok_or(VmError::PageNotFound)?)
            };

            // The claim above may itself have evicted the source page, so
            // copy from wherever its bytes are now.
            let src_page = src_ref.lock();
            if let Some(sf) = src_page.frame {
                let src_kva = self.frame_kva(sf);
                unsafe {
                    core::ptr::copy_nonoverlapping(
                        src_kva as *const u8,
                        dst_kva as *mut u8,
                        PAGE_SIZE,
                    );
                }
            } else if let PageKind::Anon(a) = &src_page.kind {
                if let Some(slot) = a.swap_slot {
                    let buf = unsafe {
                        core::slice::from_raw_parts_mut(dst_kva as *mut u8, PAGE_SIZE)
                    };
                    self.swap().read_slot(slot, buf);
                }
            }
        }
        dst.spt.set_mmap_heads(src.spt.mmap_heads());
        Ok(())
    }

    /// Exit support: flush every mapping back to its file, then tear down
    /// the remaining descriptors. Frames and swap slots come back through
    /// the per-variant destroy.
    pub fn spt_kill(&self, proc: &mut Process) {
        for head in proc.spt.mmap_heads() {
            let _ = do_munmap(self, proc, head);
        }
        for va in proc.spt.addresses() {
            proc.spt.remove(self, va);
        }
    }
}

/// Reserve a page at `va` that will become `ty` on first touch. The
/// initializer (if any) populates the frame from `aux`.
pub fn vm_alloc_page_with_initializer(
    proc: &mut Process,
    ty: VmType,
    va: VirtAddr,
    writable: bool,
    init: Option<Initializer>,
    aux: Option<LoadSegArgs>,
) -> Result<(), VmError> {
    let va = pg_round_down(va);
    let page = Page::new_uninit(va, writable, ty, init, aux, &proc.pml4);
    proc.spt.insert(page)?;
    Ok(())
}

/// Reserve a page with no initializer; first touch zero-fills.
pub fn vm_alloc_page(
    proc: &mut Process,
    ty: VmType,
    va: VirtAddr,
    writable: bool,
) -> Result<(), VmError> {
    vm_alloc_page_with_initializer(proc, ty, va, writable, None, None)
}

static VM: Once<VmCore> = Once::new();

/// Install the global VM core. Called once at kernel bring-up, before the
/// first user process starts.
pub fn vm_init(swap_disk: Box<dyn DiskDriver>, pool_pages: usize) -> &'static VmCore {
    VM.call_once(|| VmCore::new(swap_disk, pool_pages))
}

pub fn vm() -> &'static VmCore {
    VM.get().expect("vm: not initialized")
}
