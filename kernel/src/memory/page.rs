// Page descriptors and the page lifecycle: a reserved virtual page starts
// uninitialized, becomes anonymous or file-backed on first touch, and then
// moves between its frame and swap (or its file) until destroyed.
use alloc::sync::{Arc, Weak};
use bitflags::bitflags;
use log::trace;
use spin::Mutex;
use x86_64::VirtAddr;

use crate::fs::{File, FILE_LOCK};
use crate::memory::paging::{Pml4, Pml4Ref};
use crate::memory::vm::VmCore;
use crate::memory::{VmError, PAGE_SIZE};

bitflags! {
    /// Auxiliary bits carried alongside the base page tag.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VmMarkers: u32 {
        const MARKER_0 = 1 << 3;
        const MARKER_1 = 1 << 4;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmTag {
    Uninit = 0,
    Anon = 1,
    File = 2,
}

/// Page type as the allocation surface encodes it: a base tag in the low
/// bits, independent marker flags above.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmType {
    pub tag: VmTag,
    pub markers: VmMarkers,
}

impl VmType {
    pub const ANON: VmType = VmType {
        tag: VmTag::Anon,
        markers: VmMarkers::empty(),
    };
    pub const FILE: VmType = VmType {
        tag: VmTag::File,
        markers: VmMarkers::empty(),
    };

    pub fn with_markers(self, markers: VmMarkers) -> Self {
        Self {
            tag: self.tag,
            markers: self.markers | markers,
        }
    }

    pub fn bits(self) -> u32 {
        self.tag as u32 | self.markers.bits()
    }

    pub fn from_bits(bits: u32) -> Option<Self> {
        let tag = match bits & 0b111 {
            0 => VmTag::Uninit,
            1 => VmTag::Anon,
            2 => VmTag::File,
            _ => return None,
        };
        Some(Self {
            tag,
            markers: VmMarkers::from_bits_truncate(bits),
        })
    }
}

/// Arguments for loading one page of a file segment: read `read_bytes` at
/// `offset`, zero the remaining `zero_bytes`. `segment_length` is the byte
/// length of the whole mapping the page belongs to.
#[derive(Clone)]
pub struct LoadSegArgs {
    pub file: File,
    pub offset: usize,
    pub read_bytes: usize,
    pub zero_bytes: usize,
    pub segment_length: usize,
}

/// Lazy initializer run on first touch to populate the fresh frame.
pub type Initializer =
    Arc<dyn Fn(usize, Option<&LoadSegArgs>) -> Result<(), VmError> + Send + Sync>;

pub struct UninitPage {
    pub target: VmTag,
    pub init: Option<Initializer>,
    pub aux: Option<LoadSegArgs>,
}

pub struct AnonPage {
    pub init: Option<Initializer>,
    pub aux: Option<LoadSegArgs>,
    pub swap_slot: Option<usize>,
    pub swapped_out: bool,
}

pub struct FilePage {
    pub init: Option<Initializer>,
    pub args: LoadSegArgs,
}

pub enum PageKind {
    Uninit(UninitPage),
    Anon(AnonPage),
    File(FilePage),
}

pub type PageRef = Arc<Mutex<Page>>;

pub struct Page {
    pub va: VirtAddr,
    pub writable: bool,
    pub markers: VmMarkers,
    /// Frame-table slot hosting this page; `Some` iff the page is resident.
    pub frame: Option<usize>,
    /// The owning process's top-level table. The process owns it, pages
    /// only refer to it.
    pub pml4: Weak<Mutex<Pml4>>,
    pub kind: PageKind,
    /// Set on the first page of a mapping: the byte length `do_munmap`
    /// dismantles.
    pub mmap_length: Option<usize>,
}

impl Page {
    pub fn new_uninit(
        va: VirtAddr,
        writable: bool,
        ty: VmType,
        init: Option<Initializer>,
        aux: Option<LoadSegArgs>,
        pml4: &Pml4Ref,
    ) -> Self {
        assert!(ty.tag != VmTag::Uninit, "allocating a page with no target type");
        Self {
            va,
            writable,
            markers: ty.markers,
            frame: None,
            pml4: Arc::downgrade(pml4),
            kind: PageKind::Uninit(UninitPage {
                target: ty.tag,
                init,
                aux,
            }),
            mmap_length: None,
        }
    }

    pub fn into_ref(self) -> PageRef {
        Arc::new(Mutex::new(self))
    }

    pub fn tag(&self) -> VmTag {
        match &self.kind {
            PageKind::Uninit(_) => VmTag::Uninit,
            PageKind::Anon(_) => VmTag::Anon,
            PageKind::File(_) => VmTag::File,
        }
    }

    /// The tag the page has, or will have once its first touch runs.
    pub fn eventual_tag(&self) -> VmTag {
        match &self.kind {
            PageKind::Uninit(u) => u.target,
            _ => self.tag(),
        }
    }

    pub fn is_resident(&self) -> bool {
        self.frame.is_some()
    }

    pub fn is_swapped_out(&self) -> bool {
        matches!(&self.kind, PageKind::Anon(a) if a.swapped_out)
    }

    /// The initializer and segment arguments a fork of this page needs, in
    /// whatever variant currently holds them.
    pub fn initializer_pair(&self) -> (Option<Initializer>, Option<LoadSegArgs>) {
        match &self.kind {
            PageKind::Uninit(u) => (u.init.clone(), u.aux.clone()),
            PageKind::Anon(a) => (a.init.clone(), a.aux.clone()),
            PageKind::File(f) => (f.init.clone(), Some(f.args.clone())),
        }
    }

    /// Bring the page's contents into the frame at `kva`. For an UNINIT page
    /// this is the first touch: the descriptor is rewritten in place into its
    /// post-init variant before the initializer populates the frame.
    pub fn swap_in(&mut self, vm: &VmCore, kva: usize) -> Result<(), VmError> {
        if matches!(self.kind, PageKind::Uninit(_)) {
            return self.first_touch(kva);
        }
        match &mut self.kind {
            PageKind::Uninit(_) => Err(VmError::BadSegment),
            PageKind::Anon(anon) => {
                let slot = anon.swap_slot.take().ok_or(VmError::BadSegment)?;
                trace!("swap in {:?} from slot {}", self.va, slot);
                let buf = unsafe { frame_slice_mut(kva) };
                let mut swap = vm.swap();
                swap.read_slot(slot, buf);
                swap.release_slot(slot);
                anon.swapped_out = false;
                Ok(())
            }
            PageKind::File(fp) => load_segment_page(kva, &fp.args),
        }
    }

    fn first_touch(&mut self, kva: usize) -> Result<(), VmError> {
        let (new_kind, init, aux) = match &self.kind {
            PageKind::Uninit(u) => match u.target {
                VmTag::Anon => (
                    PageKind::Anon(AnonPage {
                        init: u.init.clone(),
                        aux: u.aux.clone(),
                        swap_slot: None,
                        swapped_out: false,
                    }),
                    u.init.clone(),
                    u.aux.clone(),
                ),
                VmTag::File => {
                    let args = u.aux.clone().ok_or(VmError::BadSegment)?;
                    (
                        PageKind::File(FilePage {
                            init: u.init.clone(),
                            args,
                        }),
                        u.init.clone(),
                        u.aux.clone(),
                    )
                }
                VmTag::Uninit => return Err(VmError::BadSegment),
            },
            _ => return Err(VmError::BadSegment),
        };
        self.kind = new_kind;

        match init {
            Some(f) => f(kva, aux.as_ref()),
            None => match aux {
                Some(args) => load_segment_page(kva, &args),
                None => {
                    zero_frame(kva);
                    Ok(())
                }
            },
        }
    }

    /// Write the page's contents out of its frame so the frame can be
    /// reused. Anonymous pages go to a fresh swap slot; file-backed pages go
    /// back to their file, and only when dirty. The hardware mapping is
    /// invalidated before the frame is handed back.
    pub fn swap_out(&mut self, vm: &VmCore) -> Result<(), VmError> {
        let slot = self.frame.ok_or(VmError::IllegalAccess)?;
        let kva = vm.frame_kva(slot);
        match &mut self.kind {
            PageKind::Uninit(_) => Err(VmError::IllegalAccess),
            PageKind::Anon(anon) => {
                let buf = unsafe { frame_slice(kva) };
                let mut swap = vm.swap();
                let s = swap.acquire_slot();
                swap.write_slot(s, buf);
                drop(swap);
                trace!("swap out {:?} to slot {}", self.va, s);
                anon.swap_slot = Some(s);
                anon.swapped_out = true;
                self.frame = None;
                if let Some(pml4) = self.pml4.upgrade() {
                    pml4.lock().clear_page(self.va);
                }
                Ok(())
            }
            PageKind::File(fp) => {
                let dirty = self
                    .pml4
                    .upgrade()
                    .map_or(false, |p| p.lock().is_dirty(self.va));
                if dirty {
                    trace!("write back {:?} to file offset {}", self.va, fp.args.offset);
                    let buf = unsafe { frame_slice(kva) };
                    let _guard = FILE_LOCK.lock();
                    fp.args
                        .file
                        .write_at(&buf[..fp.args.read_bytes], fp.args.offset);
                }
                self.frame = None;
                if let Some(pml4) = self.pml4.upgrade() {
                    pml4.lock().clear_page(self.va);
                }
                Ok(())
            }
        }
    }

    /// Release everything the page owns: its frame and mapping, and any swap
    /// slot. The descriptor itself is dropped by the caller.
    pub fn destroy(&mut self, vm: &VmCore) {
        if let Some(slot) = self.frame.take() {
            if let Some(pml4) = self.pml4.upgrade() {
                pml4.lock().clear_page(self.va);
            }
            vm.release_frame(slot);
        }
        if let PageKind::Anon(anon) = &mut self.kind {
            if let Some(s) = anon.swap_slot.take() {
                vm.swap().release_slot(s);
                anon.swapped_out = false;
            }
        }
    }
}

/// Read one page of a file segment into the frame at `kva`, zeroing the
/// tail. Short reads are zero-filled as well.
pub fn load_segment_page(kva: usize, args: &LoadSegArgs) -> Result<(), VmError> {
    let _guard = FILE_LOCK.lock();
    args.file.seek(args.offset);
    let want = args.read_bytes.min(PAGE_SIZE);
    let buf = unsafe { core::slice::from_raw_parts_mut(kva as *mut u8, want) };
    let read = args.file.read(buf);
    unsafe { core::ptr::write_bytes((kva + read) as *mut u8, 0, PAGE_SIZE - read) };
    Ok(())
}

/// The standard lazy loader installed by `do_mmap`.
pub fn file_segment_loader() -> Initializer {
    Arc::new(|kva, aux| {
        let args = aux.ok_or(VmError::BadSegment)?;
        load_segment_page(kva, args)
    })
}

fn zero_frame(kva: usize) {
    unsafe { core::ptr::write_bytes(kva as *mut u8, 0, PAGE_SIZE) };
}

unsafe fn frame_slice(kva: usize) -> &'static [u8] {
    core::slice::from_raw_parts(kva as *const u8, PAGE_SIZE)
}

unsafe fn frame_slice_mut(kva: usize) -> &'static mut [u8] {
    core::slice::from_raw_parts_mut(kva as *mut u8, PAGE_SIZE)
}
