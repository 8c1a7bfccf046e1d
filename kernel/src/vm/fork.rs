// Copy-on-write fork / SPT copy (spec.md section 4.7). Grounded on
// `vm/vm.c`'s `supplemental_page_table_copy`, reshaped around this
// design's authoritative COW contract rather than the original's
// competing partial implementations (spec.md section 9, Open Question
// iii): a resident Anon page becomes genuinely shared — the frame
// gains a tenant only when the child actually faults on it, not here
// — while a still-lazy Uninit page is simply re-registered, since
// there is no frame yet for two descriptors to share. File pages are
// skipped outright; the caller re-establishes them through the
// child's own `mmap` calls against its MT (section 4.5).
use crate::vm::page::PageDescriptor;
use crate::vm::pagetable::{pt_set_writable, PageTableHandle};
use crate::vm::spt::SupplementalPageTable;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

/// Mirror `src` into `dst`. Leaves `dst` partially populated and
/// returns `false` if any registration fails (an `AlreadyMapped`
/// collision should not occur against a freshly created child SPT).
/// `src_pt` is the parent's hardware page table: every resident page
/// this shares must have its WRITABLE bit cleared there too (spec.md
/// section 4.7 step 4 / property 5), or a parent write before the
/// child's first fault would mutate the frame the child is about to
/// share without ever tripping a protection fault.
pub fn spt_copy(
    dst: &mut SupplementalPageTable,
    src: &mut SupplementalPageTable,
    src_pt: &Arc<Mutex<PageTableHandle>>,
) -> bool {
    let vas: Vec<u64> = src.iter().map(|(va, _)| *va).collect();
    for va in vas {
        let source = src.find_mut(va).expect("va just listed by iter");
        if source.is_file() {
            continue;
        }

        let child = if let Some(kva) = source.frame {
            source.mark_shared();
            pt_set_writable(&mut src_pt.lock(), va, false);
            PageDescriptor::new_cow_share(va, source.writable, kva)
        } else if let Some(init) = source.clone_uninit_for_fork() {
            PageDescriptor::new_uninit(va, source.writable, init)
        } else {
            // A resident page whose variant carries nothing to share
            // lazily (PageCache, deferred to a later phase per spec).
            continue;
        };

        if dst.insert(child).is_err() {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::page::PageDescriptor;

    fn fresh_pt() -> Arc<Mutex<PageTableHandle>> {
        Arc::new(Mutex::new(PageTableHandle::new()))
    }

    #[test_case]
    fn lazy_pages_are_reregistered_independently() {
        let mut src = SupplementalPageTable::new();
        src.insert(PageDescriptor::new_anon(0x1000, true)).unwrap();
        let mut dst = SupplementalPageTable::new();
        assert!(spt_copy(&mut dst, &mut src, &fresh_pt()));
        assert!(dst.contains(0x1000));
        assert!(dst.find(0x1000).unwrap().frame.is_none());
        assert!(!dst.find(0x1000).unwrap().shared);
        assert!(!src.find(0x1000).unwrap().shared);
    }

    #[test_case]
    fn resident_page_marks_both_sides_shared() {
        let mut src = SupplementalPageTable::new();
        src.insert(PageDescriptor::new_anon(0x2000, true)).unwrap();
        src.find_mut(0x2000).unwrap().frame = Some(0xABCD_0000);
        let mut dst = SupplementalPageTable::new();
        assert!(spt_copy(&mut dst, &mut src, &fresh_pt()));

        assert!(src.find(0x2000).unwrap().shared);
        let child = dst.find(0x2000).unwrap();
        assert!(child.shared);
        assert_eq!(child.cow_source(), Some(0xABCD_0000));
        assert!(child.frame.is_none());
    }

    #[test_case]
    fn resident_page_clears_parent_hardware_writable_bit() {
        let mut src = SupplementalPageTable::new();
        src.insert(PageDescriptor::new_anon(0x4000, true)).unwrap();
        src.find_mut(0x4000).unwrap().frame = Some(0xABCD_1000);
        let mut dst = SupplementalPageTable::new();
        let parent_pt = fresh_pt();
        {
            let mut pt = parent_pt.lock();
            assert!(crate::vm::pagetable::pt_map(&mut pt, 0x4000, 0xABCD_1000, true));
        }

        assert!(spt_copy(&mut dst, &mut src, &parent_pt));

        let mut pt = parent_pt.lock();
        assert_eq!(crate::vm::pagetable::pt_lookup(&mut pt, 0x4000), Some(0xABCD_1000));
        assert!(!crate::vm::pagetable::pt_is_writable(&mut pt, 0x4000));
    }

    #[test_case]
    fn file_pages_are_skipped() {
        use crate::vm::file::InMemoryFile;
        let mut src = SupplementalPageTable::new();
        let file = InMemoryFile::new(alloc::vec![0u8; 4096]);
        src.insert(PageDescriptor::new_file(0x3000, true, file, 0, 4096))
            .unwrap();
        let mut dst = SupplementalPageTable::new();
        assert!(spt_copy(&mut dst, &mut src, &fresh_pt()));
        assert!(!dst.contains(0x3000));
    }
}
