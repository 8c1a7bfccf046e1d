// Hardware page-table bridge (spec.md section 6: pt_map/pt_unmap/pt_lookup/
// pt_is_dirty/pt_is_accessed/pt_set_accessed/pt_set_writable). Grounded on
// memory::paging's map_page/unmap_page/translate_addr, extended with the
// dirty/accessed-bit accessors the clock algorithm and write-back need.
use crate::vm::physalloc::PoolFrameAllocator;
use x86_64::structures::paging::mapper::MapToError;
use x86_64::structures::paging::{
    Mapper, OffsetPageTable, Page, PageTable, PageTableFlags, PhysFrame, Size4KiB, Translate,
};
use x86_64::{PhysAddr, VirtAddr};

/// The kernel's identity/offset mapping of all physical memory. A real
/// boot sequence derives this from the bootloader; the VM core only
/// needs it to construct transient `OffsetPageTable` views of a
/// process's page table.
pub const PHYS_MEM_OFFSET: u64 = 0;

/// Per-process hardware page table: the level-4 table owned by one
/// address space. `process::pcb::AddressSpace` holds one of these the
/// same way the teacher's `AddressSpace` holds `page_table: Box<PageTable>`.
pub struct PageTableHandle {
    table: alloc::boxed::Box<PageTable>,
}

impl PageTableHandle {
    pub fn new() -> Self {
        Self {
            table: alloc::boxed::Box::new(PageTable::new()),
        }
    }

    fn mapper(&mut self) -> OffsetPageTable<'_> {
        unsafe { OffsetPageTable::new(&mut self.table, VirtAddr::new(PHYS_MEM_OFFSET)) }
    }
}

/// Map `va` to `kva` with the given writability. `user` pages are always
/// user-accessible and present; `writable` selects the WRITABLE bit.
pub fn pt_map(pt: &mut PageTableHandle, va: u64, kva: u64, writable: bool) -> bool {
    let page = Page::<Size4KiB>::containing_address(VirtAddr::new(va));
    let frame = PhysFrame::containing_address(PhysAddr::new(kva));
    let mut flags = PageTableFlags::PRESENT | PageTableFlags::USER_ACCESSIBLE;
    if writable {
        flags |= PageTableFlags::WRITABLE;
    }
    let mut mapper = pt.mapper();
    let mut allocator = PoolFrameAllocator;
    match unsafe { mapper.map_to(page, frame, flags, &mut allocator) } {
        Ok(flush) => {
            flush.flush();
            true
        }
        Err(MapToError::PageAlreadyMapped(_)) => {
            // Re-mapping (e.g. restoring writability after a COW split)
            // goes through unmap+map rather than update_flags so that
            // the dirty/accessed bits reset consistently.
            let _ = pt_unmap(pt, va);
            let mut mapper = pt.mapper();
            match unsafe { mapper.map_to(page, frame, flags, &mut allocator) } {
                Ok(flush) => {
                    flush.flush();
                    true
                }
                Err(_) => false,
            }
        }
        Err(_) => false,
    }
}

/// Remove the mapping for `va`, if any. No-op if unmapped.
pub fn pt_unmap(pt: &mut PageTableHandle, va: u64) {
    let page = Page::<Size4KiB>::containing_address(VirtAddr::new(va));
    let mut mapper = pt.mapper();
    if let Ok((_, flush)) = mapper.unmap(page) {
        flush.flush();
    }
}

/// Physical (kernel-visible) address `va` currently maps to, or `None`.
pub fn pt_lookup(pt: &mut PageTableHandle, va: u64) -> Option<u64> {
    let mapper = pt.mapper();
    match mapper.translate_addr(VirtAddr::new(va)) {
        Some(addr) => Some(addr.as_u64()),
        None => None,
    }
}

fn entry_flags(pt: &mut PageTableHandle, va: u64) -> Option<PageTableFlags> {
    let mapper = pt.mapper();
    match mapper.translate(VirtAddr::new(va)) {
        x86_64::structures::paging::mapper::TranslateResult::Mapped { flags, .. } => Some(flags),
        _ => None,
    }
}

pub fn pt_is_dirty(pt: &mut PageTableHandle, va: u64) -> bool {
    entry_flags(pt, va)
        .map(|f| f.contains(PageTableFlags::DIRTY))
        .unwrap_or(false)
}

pub fn pt_is_accessed(pt: &mut PageTableHandle, va: u64) -> bool {
    entry_flags(pt, va)
        .map(|f| f.contains(PageTableFlags::ACCESSED))
        .unwrap_or(false)
}

pub fn pt_is_writable(pt: &mut PageTableHandle, va: u64) -> bool {
    entry_flags(pt, va)
        .map(|f| f.contains(PageTableFlags::WRITABLE))
        .unwrap_or(false)
}

pub fn pt_set_accessed(pt: &mut PageTableHandle, va: u64, accessed: bool) {
    if let Some(flags) = entry_flags(pt, va) {
        let mut new_flags = flags;
        new_flags.set(PageTableFlags::ACCESSED, accessed);
        set_flags(pt, va, new_flags);
    }
}

pub fn pt_set_writable(pt: &mut PageTableHandle, va: u64, writable: bool) {
    if let Some(flags) = entry_flags(pt, va) {
        let mut new_flags = flags;
        new_flags.set(PageTableFlags::WRITABLE, writable);
        set_flags(pt, va, new_flags);
    }
}

fn set_flags(pt: &mut PageTableHandle, va: u64, flags: PageTableFlags) {
    let page = Page::<Size4KiB>::containing_address(VirtAddr::new(va));
    let mut mapper = pt.mapper();
    unsafe {
        if let Ok(flush) = mapper.update_flags(page, flags) {
            flush.flush();
        }
    }
}

/// Test-only seam: flips the hardware dirty bit without going through
/// an actual CPU write, since tests can't safely fault through a
/// page table that isn't the live CR3.
#[cfg(test)]
pub fn pt_mark_dirty_for_test(pt: &mut PageTableHandle, va: u64) {
    if let Some(flags) = entry_flags(pt, va) {
        set_flags(pt, va, flags | PageTableFlags::DIRTY);
    }
}
