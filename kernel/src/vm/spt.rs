// Supplemental Page Table (spec.md section 4.4). Grounded on
// `struct supplemental_page_table { struct hash spt_hash; }` plus
// `spt_find_page`/`spt_insert_page`/`spt_remove_page`/`spt_destroy`
// in vm.c/vm.h. A `BTreeMap` keyed by page-aligned virtual address
// gives the same lookup/insert/remove shape as the original hash
// table while staying ordered, which `munmap`'s forward write-back
// loop (section 4.5) relies on.
use crate::vm::config::page_round_down;
use crate::vm::error::{VmError, VmResult};
use crate::vm::page::PageDescriptor;
use crate::vm::pagetable::PageTableHandle;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use spin::Mutex;

pub struct SupplementalPageTable {
    pages: BTreeMap<u64, PageDescriptor>,
}

impl SupplementalPageTable {
    pub fn new() -> Self {
        Self {
            pages: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, page: PageDescriptor) -> VmResult<()> {
        let va = page_round_down(page.va);
        if self.pages.contains_key(&va) {
            return Err(VmError::AlreadyMapped);
        }
        self.pages.insert(va, page);
        Ok(())
    }

    pub fn find(&self, va: u64) -> Option<&PageDescriptor> {
        self.pages.get(&page_round_down(va))
    }

    pub fn find_mut(&mut self, va: u64) -> Option<&mut PageDescriptor> {
        self.pages.get_mut(&page_round_down(va))
    }

    pub fn contains(&self, va: u64) -> bool {
        self.pages.contains_key(&page_round_down(va))
    }

    pub fn remove(&mut self, va: u64) -> VmResult<PageDescriptor> {
        self.pages
            .remove(&page_round_down(va))
            .ok_or(VmError::NotFound)
    }

    /// Descriptors in ascending virtual-address order, as `munmap`'s
    /// write-back loop and fork's copy both require.
    pub fn iter(&self) -> impl Iterator<Item = (&u64, &PageDescriptor)> {
        self.pages.iter()
    }

    /// Tear down every descriptor: write back dirty content through
    /// `pt`, release any swap slot, and drop the entry. Order is
    /// unconstrained (spec.md section 4.8).
    pub fn destroy_all(&mut self, pt: &Arc<Mutex<PageTableHandle>>) {
        for (va, page) in self.pages.iter_mut() {
            if let Some(kva) = page.frame {
                page.destroy(Some((&mut *pt.lock(), *va)));
                crate::vm::frame::release_frame(kva, pt, *va);
            } else {
                page.destroy(None);
            }
        }
        self.pages.clear();
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::page::PageDescriptor;

    #[test_case]
    fn insert_rejects_duplicate_va() {
        let mut spt = SupplementalPageTable::new();
        spt.insert(PageDescriptor::new_anon(0x1000, true)).unwrap();
        let err = spt.insert(PageDescriptor::new_anon(0x1000, true));
        assert_eq!(err.unwrap_err(), VmError::AlreadyMapped);
    }

    #[test_case]
    fn find_uses_page_aligned_key() {
        let mut spt = SupplementalPageTable::new();
        spt.insert(PageDescriptor::new_anon(0x1000, true)).unwrap();
        assert!(spt.find(0x1080).is_some());
        assert!(spt.find(0x2000).is_none());
    }

    #[test_case]
    fn remove_missing_reports_not_found() {
        let mut spt = SupplementalPageTable::new();
        assert_eq!(spt.remove(0x3000).unwrap_err(), VmError::NotFound);
    }
}
