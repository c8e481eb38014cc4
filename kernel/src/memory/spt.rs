// Supplemental page table: the per-process index from virtual address to
// page descriptor, plus the list of mmap heads the exit path must flush.
// Point lookups go through a hash map keyed by the raw page address; a
// parallel ordered key set serves the va-ascending walk fork-copy depends
// on. The two indexes are updated together.
use alloc::collections::BTreeSet;
use alloc::vec::Vec;
use hashbrown::HashMap;
use x86_64::VirtAddr;

use crate::memory::page::{Page, PageRef};
use crate::memory::vm::VmCore;
use crate::memory::{pg_round_down, VmError};

pub struct SupplementalPageTable {
    pages: HashMap<u64, PageRef>,
    order: BTreeSet<VirtAddr>,
    mmap_heads: Vec<VirtAddr>,
}

impl SupplementalPageTable {
    pub fn new() -> Self {
        Self {
            pages: HashMap::new(),
            order: BTreeSet::new(),
            mmap_heads: Vec::new(),
        }
    }

    pub fn find(&self, va: VirtAddr) -> Option<PageRef> {
        self.pages.get(&pg_round_down(va).as_u64()).cloned()
    }

    /// Insert a new descriptor. Refuses to overwrite an occupied address.
    pub fn insert(&mut self, page: Page) -> Result<PageRef, VmError> {
        let va = pg_round_down(page.va);
        if self.pages.contains_key(&va.as_u64()) {
            return Err(VmError::AddressInUse);
        }
        let page_ref = page.into_ref();
        self.pages.insert(va.as_u64(), page_ref.clone());
        self.order.insert(va);
        Ok(page_ref)
    }

    /// Remove the descriptor at `va`, destroying it (frame, mapping, and
    /// swap slot are released). Returns whether a page was there.
    pub fn remove(&mut self, vm: &VmCore, va: VirtAddr) -> bool {
        let va = pg_round_down(va);
        match self.pages.remove(&va.as_u64()) {
            Some(page_ref) => {
                page_ref.lock().destroy(vm);
                self.order.remove(&va);
                self.mmap_heads.retain(|&h| h != va);
                true
            }
            None => false,
        }
    }

    /// Drop a descriptor that owns no resources yet (rollback of a partial
    /// reservation).
    pub(crate) fn discard(&mut self, va: VirtAddr) {
        let va = pg_round_down(va);
        self.pages.remove(&va.as_u64());
        self.order.remove(&va);
    }

    /// Pages in ascending `va` order.
    pub fn iter(&self) -> impl Iterator<Item = (&VirtAddr, &PageRef)> {
        self.order.iter().map(|va| {
            let page = self
                .pages
                .get(&va.as_u64())
                .expect("spt: index out of sync");
            (va, page)
        })
    }

    pub fn addresses(&self) -> Vec<VirtAddr> {
        self.order.iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn register_mmap_head(&mut self, va: VirtAddr) {
        self.mmap_heads.push(va);
    }

    pub fn mmap_heads(&self) -> Vec<VirtAddr> {
        self.mmap_heads.clone()
    }

    pub(crate) fn set_mmap_heads(&mut self, heads: Vec<VirtAddr>) {
        self.mmap_heads = heads;
    }
}
