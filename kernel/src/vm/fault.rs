// Fault handler & claim protocol (spec.md section 4.6). Grounded on
// `vm/vm.c`'s `vm_try_handle_fault` plus the teacher's
// `interrupts.rs::page_fault_handler` / `memory/demand_paging.rs
// ::handle_page_fault` for the Rust surface shape: flags decoded from
// `PageFaultErrorCode`, faulting address from `Cr2::read()`.
use crate::process::pcb::AddressSpace;
use crate::vm::config::{
    is_kernel_address, page_round_down, PAGE_SIZE, STACK_FAULT_TOLERANCE, USER_STACK_LIMIT,
    USER_STACK_TOP,
};
use crate::vm::error::VmResult;
use crate::vm::frame::{self, EvictClient};
use crate::vm::page::PageDescriptor;
use crate::vm::pagetable::{pt_map, pt_set_writable, PageTableHandle};
use alloc::sync::Arc;
use spin::Mutex;

/// Writes a victim's content back through its owning descriptor before
/// the frame table reassigns it. A frame's sole tenant (eviction never
/// picks a shared one, see `vm::frame::evict`) may belong to the very
/// address space already locked by the fault this eviction serves —
/// the ordinary "fill the pool, then fault one more page" case — so
/// this client is handed that address space directly and compares
/// tenant identity by page-table pointer rather than unconditionally
/// re-resolving and re-locking through `process::owner_of_page_table`.
/// Re-locking an already-held `spin::Mutex` from the same thread
/// spins forever; routing the self case through the borrow we already
/// hold avoids that without giving up eviction of other processes'
/// frames, which is still safe to look up and lock normally.
struct OwnerEvictClient<'a> {
    self_page_table: Arc<Mutex<PageTableHandle>>,
    self_aspace: &'a mut AddressSpace,
}

impl<'a> EvictClient for OwnerEvictClient<'a> {
    fn on_evict(
        &mut self,
        va: u64,
        page_table: &Arc<Mutex<PageTableHandle>>,
        kva: u64,
    ) -> VmResult<()> {
        if Arc::ptr_eq(page_table, &self.self_page_table) {
            if let Some(page) = self.self_aspace.spt.find_mut(va) {
                page.swap_out(&mut page_table.lock(), va, kva)?;
                page.frame = None;
            }
            return Ok(());
        }

        let Some(address_space) = crate::process::owner_of_page_table(page_table) else {
            return Ok(());
        };
        let mut aspace = address_space.lock();
        if let Some(page) = aspace.spt.find_mut(va) {
            page.swap_out(&mut page_table.lock(), va, kva)?;
            page.frame = None;
        }
        Ok(())
    }
}

/// Claim a frame for the page at `va` and bring its content in,
/// installing the hardware mapping only once `swap_in` has populated
/// the frame. Writability is `page.writable AND NOT page.shared`: a
/// COW page stays read-only until the handler below splits it.
///
/// Looks `va` up again after any call that may run eviction instead of
/// holding one `&mut PageDescriptor` borrow across it: `obtain_frame`
/// can re-enter this same SPT (through `OwnerEvictClient`) to clear a
/// different, already-resident page's `frame` field, which the borrow
/// checker cannot prove disjoint from a long-lived borrow of `va`'s
/// own descriptor.
fn claim(aspace: &mut AddressSpace, va: u64) -> bool {
    let page_table = aspace.page_table.clone();

    let cow_source = aspace.spt.find(va).and_then(|p| p.cow_source());
    if let Some(source_kva) = cow_source {
        if frame::add_tenant(source_kva, page_table.clone(), va).is_err() {
            return false;
        }
        if !pt_map(&mut page_table.lock(), va, source_kva, false) {
            frame::release_frame(source_kva, &page_table, va);
            return false;
        }
        let page = aspace.spt.find_mut(va).expect("still present");
        page.finish_cow_share(source_kva);
        return true;
    }

    let kva = {
        let mut client = OwnerEvictClient {
            self_page_table: page_table.clone(),
            self_aspace: &mut *aspace,
        };
        match frame::obtain_frame(page_table.clone(), va, &mut client) {
            Ok(kva) => kva,
            Err(_) => return false,
        }
    };

    let page = aspace.spt.find_mut(va).expect("still present");
    if let Err(_) = page.swap_in(kva) {
        frame::release_frame(kva, &page_table, va);
        return false;
    }
    let writable = page.writable && !page.shared;
    if !pt_map(&mut page_table.lock(), va, kva, writable) {
        frame::release_frame(kva, &page_table, va);
        return false;
    }
    page.frame = Some(kva);
    true
}

/// Split a copy-on-write page on its first write: allocate a private
/// frame, copy the shared content, detach from the shared tenant list,
/// and restore writability. If the writer was the only remaining
/// tenant, skip the copy and simply restore writability in place
/// (spec.md section 4.7 step 4, last-sharer case).
fn cow_split(aspace: &mut AddressSpace, va: u64) -> bool {
    let page_table = aspace.page_table.clone();
    let Some(kva) = aspace.spt.find(va).and_then(|p| p.frame) else {
        return false;
    };

    if !frame::is_shared(kva) {
        let page = aspace.spt.find_mut(va).expect("just found");
        page.shared = false;
        pt_set_writable(&mut page_table.lock(), va, true);
        return true;
    }

    let new_kva = {
        let mut client = OwnerEvictClient {
            self_page_table: page_table.clone(),
            self_aspace: &mut *aspace,
        };
        match frame::obtain_frame(page_table.clone(), va, &mut client) {
            Ok(kva) => kva,
            Err(_) => return false,
        }
    };
    unsafe {
        core::ptr::copy_nonoverlapping(
            kva as *const u8,
            new_kva as *mut u8,
            PAGE_SIZE as usize,
        );
    }
    if !pt_map(&mut page_table.lock(), va, new_kva, true) {
        frame::release_frame(new_kva, &page_table, va);
        return false;
    }
    frame::release_frame(kva, &page_table, va);
    let page = aspace.spt.find_mut(va).expect("still present");
    page.frame = Some(new_kva);
    page.shared = false;
    true
}

/// Extend the stack downward to cover `target`, mapping every page
/// between `target` and the address space's current stack bottom.
/// Fails (without registering any page) if that would exceed
/// `USER_STACK_LIMIT` below `USER_STACK_TOP`.
fn grow_stack(aspace: &mut AddressSpace, target: u64) -> bool {
    let limit = USER_STACK_TOP.saturating_sub(USER_STACK_LIMIT) + PAGE_SIZE;
    if target < limit {
        return false;
    }
    let mut va = target;
    while va < aspace.stack_bottom {
        if aspace.spt.insert(PageDescriptor::new_anon(va, true)).is_err() {
            return false;
        }
        va += PAGE_SIZE;
    }
    aspace.stack_bottom = aspace.stack_bottom.min(target);
    true
}

/// Entry point called from the trap handler on every page fault in
/// user-accessible code. `rsp` is the faulting frame's stack pointer,
/// used for the stack-growth window test. Returns `false` when the
/// fault is unrecoverable; the caller terminates the process.
pub fn handle_fault(
    address_space: &Arc<Mutex<AddressSpace>>,
    addr: u64,
    rsp: u64,
    user: bool,
    write: bool,
    not_present: bool,
) -> bool {
    if user && is_kernel_address(addr) {
        return false;
    }

    let page_va = page_round_down(addr);
    let mut aspace = address_space.lock();

    if !aspace.spt.contains(page_va) {
        if rsp.saturating_sub(STACK_FAULT_TOLERANCE) <= addr {
            return grow_stack(&mut aspace, page_va);
        }
        return false;
    }

    let page = aspace.spt.find(page_va).expect("checked by contains");

    // A shared page is never *currently* writable regardless of its
    // declared permission — the hardware mapping was installed
    // read-only by the claim protocol precisely so a write traps here.
    let effectively_writable = page.writable && !page.shared;
    let shared = page.shared;
    if write && !effectively_writable {
        if shared {
            return cow_split(&mut aspace, page_va);
        }
        return false;
    }

    if not_present {
        return claim(&mut aspace, page_va);
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::frame::is_shared;
    use crate::vm::fork::spt_copy;
    use crate::vm::page::PageDescriptor;
    use crate::vm::pagetable::pt_lookup;
    use crate::vm::swap::RamSwapDisk;

    fn fresh_address_space() -> Arc<Mutex<AddressSpace>> {
        Arc::new(Mutex::new(AddressSpace::new()))
    }

    #[test_case]
    fn kernel_address_from_user_mode_fails() {
        frame::init_for_test(8);
        let aspace = fresh_address_space();
        assert!(!handle_fault(&aspace, crate::vm::config::KERNEL_BASE, 0, true, false, true));
    }

    #[test_case]
    fn unmapped_address_outside_stack_window_fails() {
        frame::init_for_test(8);
        let aspace = fresh_address_space();
        assert!(!handle_fault(&aspace, 0x4000_0000, 0x7FFF_FFFF_E000, false, false, true));
    }

    #[test_case]
    fn stack_growth_within_window_succeeds_and_fills_gap() {
        frame::init_for_test(8);
        let aspace = fresh_address_space();
        let sp = USER_STACK_TOP - 4 * PAGE_SIZE;
        let fault_addr = sp - 4;
        assert!(handle_fault(&aspace, fault_addr, sp, true, true, true));
        let a = aspace.lock();
        assert!(a.spt.contains(page_round_down(fault_addr)));
        assert!(a.spt.contains(USER_STACK_TOP));
    }

    #[test_case]
    fn demand_zero_page_claims_on_first_fault() {
        frame::init_for_test(8);
        let aspace = fresh_address_space();
        {
            let mut a = aspace.lock();
            a.spt.insert(PageDescriptor::new_anon(0x5000_0000, true)).unwrap();
        }
        assert!(handle_fault(&aspace, 0x5000_0040, USER_STACK_TOP, true, false, true));
        let mut a = aspace.lock();
        let pt = a.page_table.clone();
        assert!(pt_lookup(&mut pt.lock(), 0x5000_0000).is_some());
        assert!(a.spt.find(0x5000_0000).unwrap().frame.is_some());
    }

    #[test_case]
    fn write_to_read_only_non_shared_page_fails() {
        frame::init_for_test(8);
        let aspace = fresh_address_space();
        {
            let mut a = aspace.lock();
            a.spt.insert(PageDescriptor::new_anon(0x6000_0000, false)).unwrap();
        }
        assert!(!handle_fault(&aspace, 0x6000_0000, USER_STACK_TOP, true, true, false));
    }

    #[test_case]
    fn cow_write_splits_and_preserves_sibling() {
        crate::vm::swap::init(alloc::boxed::Box::new(RamSwapDisk::new(256)));
        frame::init_for_test(8);
        let parent = fresh_address_space();
        {
            let mut p = parent.lock();
            p.spt.insert(PageDescriptor::new_anon(0x7000_0000, true)).unwrap();
            assert!(claim(&mut p, 0x7000_0000));
        }

        let child = fresh_address_space();
        {
            let mut p = parent.lock();
            let mut c = child.lock();
            let parent_pt = p.page_table.clone();
            assert!(spt_copy(&mut c.spt, &mut p.spt, &parent_pt));
        }

        // Child's first fault installs the parent's existing frame
        // read-only via its `CowPending` descriptor, growing the
        // frame's tenant list instead of allocating or copying.
        assert!(handle_fault(&child, 0x7000_0040, USER_STACK_TOP, true, false, true));
        {
            let c = child.lock();
            let p = parent.lock();
            let child_kva = c.spt.find(0x7000_0000).unwrap().frame.unwrap();
            let parent_kva = p.spt.find(0x7000_0000).unwrap().frame.unwrap();
            assert_eq!(child_kva, parent_kva);
            assert!(is_shared(child_kva));
        }

        // Child writes: COW split gives it a private frame.
        assert!(handle_fault(&child, 0x7000_0000, USER_STACK_TOP, true, true, false));
        let c = child.lock();
        let p = parent.lock();
        let child_kva = c.spt.find(0x7000_0000).unwrap().frame.unwrap();
        let parent_kva = p.spt.find(0x7000_0000).unwrap().frame.unwrap();
        assert_ne!(child_kva, parent_kva);
        assert!(!is_shared(parent_kva));
    }

    #[test_case]
    fn anon_page_survives_eviction_and_refault() {
        crate::vm::swap::init(alloc::boxed::Box::new(RamSwapDisk::new(256)));
        frame::init_for_test(1);
        let aspace = fresh_address_space();
        {
            let mut a = aspace.lock();
            a.spt.insert(PageDescriptor::new_anon(0x8000_0000, true)).unwrap();
            a.spt.insert(PageDescriptor::new_anon(0x8000_1000, true)).unwrap();
        }

        assert!(handle_fault(&aspace, 0x8000_0000, USER_STACK_TOP, true, true, true));
        {
            let mut a = aspace.lock();
            let pt = a.page_table.clone();
            let kva = a.spt.find(0x8000_0000).unwrap().frame.unwrap();
            unsafe { *(kva as *mut u8) = 0xAB };
            crate::vm::pagetable::pt_mark_dirty_for_test(&mut pt.lock(), 0x8000_0000);
        }

        // The pool holds exactly one frame; claiming the second page
        // evicts the first through `OwnerEvictClient`, which must swap
        // its content out before the frame is reused.
        assert!(handle_fault(&aspace, 0x8000_1000, USER_STACK_TOP, true, true, true));
        {
            let a = aspace.lock();
            assert!(a.spt.find(0x8000_0000).unwrap().frame.is_none());
        }

        assert!(handle_fault(&aspace, 0x8000_0000, USER_STACK_TOP, true, false, true));
        let a = aspace.lock();
        let kva = a.spt.find(0x8000_0000).unwrap().frame.unwrap();
        assert_eq!(unsafe { *(kva as *const u8) }, 0xAB);
    }
}
