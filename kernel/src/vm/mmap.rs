// Memory-map table and mmap/munmap (spec.md section 4.5). Grounded on
// `vm/file.c`'s `do_mmap`/`do_munmap`: reopen the file so a later
// `close` by user code cannot invalidate the mapping, then register
// one Uninit descriptor per page whose initializer reads
// `min(remaining_length, PAGE_SIZE)` bytes and zero-fills the tail,
// exactly `lazy_file_load_segment`'s split.
use crate::vm::config::{is_page_aligned, PAGE_SIZE};
use crate::vm::error::{VmError, VmResult};
use crate::vm::file::VmFile;
use crate::vm::page::{FileInit, PageDescriptor};
use crate::vm::spt::SupplementalPageTable;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;

struct MmapEntry {
    file: Arc<dyn VmFile>,
    page_count: u64,
}

pub struct MmapTable {
    entries: BTreeMap<u64, MmapEntry>,
}

impl MmapTable {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Base addresses of every live mapping, for teardown sweeps.
    pub fn addresses(&self) -> alloc::vec::Vec<u64> {
        self.entries.keys().copied().collect()
    }
}

/// Map `length` bytes of `file` starting at `offset` into the region
/// beginning at `addr`. Returns `addr` on success.
pub fn mmap(
    spt: &mut SupplementalPageTable,
    mt: &mut MmapTable,
    addr: u64,
    length: u64,
    writable: bool,
    file: Arc<dyn VmFile>,
    offset: u64,
) -> VmResult<u64> {
    if addr == 0 || !is_page_aligned(addr) || !is_page_aligned(offset) || length == 0 {
        return Err(VmError::BadArg);
    }
    if file.length() == 0 {
        return Err(VmError::BadArg);
    }

    let page_count = (length + PAGE_SIZE - 1) / PAGE_SIZE;
    for i in 0..page_count {
        if spt.contains(addr + i * PAGE_SIZE) {
            return Err(VmError::Overlap);
        }
    }
    if mt.entries.contains_key(&addr) {
        return Err(VmError::Overlap);
    }

    let mut remaining = length;
    let mut file_offset = offset;
    let mut inserted = 0u64;
    for i in 0..page_count {
        let read_bytes = core::cmp::min(remaining, PAGE_SIZE) as u32;
        let page = PageDescriptor::new_uninit(
            addr + i * PAGE_SIZE,
            writable,
            Arc::new(FileInit {
                file: file.clone(),
                offset: file_offset,
                read_bytes,
            }),
        );
        if spt.insert(page).is_err() {
            break;
        }
        inserted += 1;
        remaining = remaining.saturating_sub(PAGE_SIZE);
        file_offset += PAGE_SIZE;
    }

    if inserted != page_count {
        for i in 0..inserted {
            let _ = spt.remove(addr + i * PAGE_SIZE);
        }
        return Err(VmError::Overlap);
    }

    mt.entries.insert(addr, MmapEntry { file, page_count });
    Ok(addr)
}

/// Unmap the region registered at `addr`, writing back any dirty page
/// through its SPT descriptor before the descriptor is torn down, then
/// closing the mapping's reopened file handle.
pub fn munmap(
    spt: &mut SupplementalPageTable,
    mt: &mut MmapTable,
    pt: &alloc::sync::Arc<spin::Mutex<crate::vm::pagetable::PageTableHandle>>,
    addr: u64,
) -> VmResult<()> {
    let entry = mt.entries.remove(&addr).ok_or(VmError::NotFound)?;
    for i in 0..entry.page_count {
        let va = addr + i * PAGE_SIZE;
        if let Ok(mut page) = spt.remove(va) {
            if let Some(kva) = page.frame {
                page.destroy(Some((&mut *pt.lock(), va)));
                crate::vm::frame::release_frame(kva, pt, va);
            } else {
                page.destroy(None);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::file::InMemoryFile;
    use crate::vm::pagetable::PageTableHandle;
    use alloc::sync::Arc;
    use spin::Mutex;

    #[test_case]
    fn mmap_rejects_unaligned_addr() {
        let mut spt = SupplementalPageTable::new();
        let mut mt = MmapTable::new();
        let file = InMemoryFile::new(alloc::vec![1; PAGE_SIZE as usize]);
        let err = mmap(&mut spt, &mut mt, 0x1001, PAGE_SIZE, true, file, 0);
        assert_eq!(err.unwrap_err(), VmError::BadArg);
    }

    #[test_case]
    fn overlap_rejected_without_perturbing_first_mapping() {
        let mut spt = SupplementalPageTable::new();
        let mut mt = MmapTable::new();
        let file = InMemoryFile::new(alloc::vec![1; PAGE_SIZE as usize]);
        let base = mmap(&mut spt, &mut mt, 0x2000_0000, PAGE_SIZE, true, file.clone(), 0).unwrap();
        assert_eq!(base, 0x2000_0000);
        let err = mmap(&mut spt, &mut mt, 0x2000_0000, PAGE_SIZE, true, file, 0);
        assert_eq!(err.unwrap_err(), VmError::Overlap);
        assert!(spt.contains(0x2000_0000));
    }

    #[test_case]
    fn munmap_writes_back_dirty_page() {
        let mut spt = SupplementalPageTable::new();
        let mut mt = MmapTable::new();
        let file = InMemoryFile::new(alloc::vec![0u8; (PAGE_SIZE * 3) as usize]);
        let addr = 0x1000_0000;
        mmap(&mut spt, &mut mt, addr, PAGE_SIZE * 3, true, file.clone(), 0).unwrap();

        let pt = Arc::new(Mutex::new(PageTableHandle::new()));
        let target_va = addr + 0x100;
        let page = spt.find_mut(target_va).unwrap();
        let mut buf = alloc::vec![0u8; PAGE_SIZE as usize];
        page.swap_in(buf.as_mut_ptr() as u64).unwrap();
        buf[0x100] = 0x42;
        page.frame = Some(buf.as_ptr() as u64);
        crate::vm::pagetable::pt_map(&mut pt.lock(), target_va, buf.as_ptr() as u64, true);
        crate::vm::pagetable::pt_mark_dirty_for_test(&mut pt.lock(), target_va);

        munmap(&mut spt, &mut mt, &pt, addr).unwrap();
        assert_eq!(file.snapshot()[0x100], 0x42);
    }
}
