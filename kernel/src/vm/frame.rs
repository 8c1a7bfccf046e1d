// Physical frame table (spec.md section 4.2): one record per frame
// handed out by the physical allocator, holding the list of (address
// space, va) tenants currently mapping it and serving as the clock
// hand's scan order for eviction. Grounded on vm.c's `ft_hash` plus
// `vm_get_victim`/`vm_evict_frame` (a single hash table of frames,
// accessed-bit second-chance over one linear pass, dirty pages routed
// through the page's own swap_out before reclaim). Frames gain more
// than one tenant only through copy-on-write fork, which this source
// does not model; tenant lists are this crate's generalization of the
// original one-frame-one-page invariant.
use crate::vm::error::{VmError, VmResult};
use crate::vm::pagetable::PageTableHandle;
use crate::vm::physalloc;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use lazy_static::lazy_static;
use spin::Mutex;

/// One (address space, virtual address) pair currently mapping a frame.
#[derive(Clone)]
pub struct Tenant {
    pub page_table: Arc<Mutex<PageTableHandle>>,
    pub va: u64,
}

impl Tenant {
    pub fn new(page_table: Arc<Mutex<PageTableHandle>>, va: u64) -> Self {
        Self { page_table, va }
    }

    fn same_space(&self, other: &Arc<Mutex<PageTableHandle>>) -> bool {
        Arc::ptr_eq(&self.page_table, other)
    }
}

struct Frame {
    kva: u64,
    tenants: Vec<Tenant>,
}

/// Callback through which `FrameTable` asks the VM core to preserve a
/// victim's contents before the frame is reused. The frame table knows
/// nothing about page descriptors or swap; it only knows hardware
/// mappings and accessed/dirty bits.
pub trait EvictClient {
    fn on_evict(
        &mut self,
        va: u64,
        page_table: &Arc<Mutex<PageTableHandle>>,
        kva: u64,
    ) -> VmResult<()>;
}

struct FrameTable {
    frames: Vec<Frame>,
    index: BTreeMap<u64, usize>,
    hand: usize,
}

impl FrameTable {
    const fn empty() -> Self {
        Self {
            frames: Vec::new(),
            index: BTreeMap::new(),
            hand: 0,
        }
    }

    fn position_of(&self, kva: u64) -> Option<usize> {
        self.index.get(&kva).copied()
    }

    fn remove_by_kva(&mut self, kva: u64) -> Option<Frame> {
        let pos = self.index.remove(&kva)?;
        let removed = self.frames.swap_remove(pos);
        if pos < self.frames.len() {
            self.index.insert(self.frames[pos].kva, pos);
        }
        if self.hand > pos {
            self.hand -= 1;
        }
        if self.hand >= self.frames.len() {
            self.hand = 0;
        }
        Some(removed)
    }

    fn push(&mut self, frame: Frame) {
        let pos = self.frames.len();
        self.index.insert(frame.kva, pos);
        self.frames.push(frame);
    }
}

lazy_static! {
    static ref TABLE: Mutex<FrameTable> = Mutex::new(FrameTable::empty());
}

/// Reset the frame table and re-seed the physical pool with exactly
/// `n` frames, so a test can force eviction after `n` claims instead
/// of needing the whole machine's memory exhausted.
#[cfg(test)]
pub fn init_for_test(n: usize) {
    let mut table = TABLE.lock();
    table.frames.clear();
    table.index.clear();
    table.hand = 0;
    drop(table);
    physalloc::init_for_test(n);
}

/// Acquire a physical frame for `(page_table, va)`. Pulls a fresh page
/// from the pool when one is free; otherwise runs the clock algorithm
/// over resident frames, asking `client` to preserve the victim's
/// contents before the frame is handed to the new tenant.
pub fn obtain_frame(
    page_table: Arc<Mutex<PageTableHandle>>,
    va: u64,
    client: &mut dyn EvictClient,
) -> VmResult<u64> {
    if let Some(kva) = physalloc::palloc_user().map(|a| a.0) {
        let mut table = TABLE.lock();
        table.push(Frame {
            kva,
            tenants: alloc::vec![Tenant::new(page_table, va)],
        });
        return Ok(kva);
    }

    let kva = evict(client)?;
    unsafe {
        core::ptr::write_bytes(kva as *mut u8, 0, crate::vm::config::PAGE_SIZE as usize);
    }
    let mut table = TABLE.lock();
    table.push(Frame {
        kva,
        tenants: alloc::vec![Tenant::new(page_table, va)],
    });
    Ok(kva)
}

/// Add another tenant to a frame that is already resident, without
/// allocating: the copy-on-write fork path, where parent and child
/// share one physical frame until one of them writes.
pub fn add_tenant(kva: u64, page_table: Arc<Mutex<PageTableHandle>>, va: u64) -> VmResult<()> {
    let mut table = TABLE.lock();
    let pos = table.position_of(kva).ok_or(VmError::NotFound)?;
    table.frames[pos].tenants.push(Tenant::new(page_table, va));
    Ok(())
}

/// Detach one tenant from a frame. Frees the physical page back to the
/// pool once its last tenant is gone.
pub fn release_frame(kva: u64, page_table: &Arc<Mutex<PageTableHandle>>, va: u64) {
    let mut table = TABLE.lock();
    let Some(pos) = table.position_of(kva) else {
        return;
    };
    table.frames[pos]
        .tenants
        .retain(|t| !(t.same_space(page_table) && t.va == va));
    if table.frames[pos].tenants.is_empty() {
        table.remove_by_kva(kva);
        physalloc::pfree(physalloc::KernelAddr(kva));
    }
}

/// True once more than one (address space, va) pair maps `kva`.
pub fn is_shared(kva: u64) -> bool {
    let table = TABLE.lock();
    table
        .position_of(kva)
        .map(|pos| table.frames[pos].tenants.len() > 1)
        .unwrap_or(false)
}

fn any_tenant_accessed(frame: &Frame) -> bool {
    frame
        .tenants
        .iter()
        .any(|t| crate::vm::pagetable::pt_is_accessed(&mut t.page_table.lock(), t.va))
}

fn clear_all_accessed(frame: &Frame) {
    for t in &frame.tenants {
        crate::vm::pagetable::pt_set_accessed(&mut t.page_table.lock(), t.va, false);
    }
}

/// Run one clock sweep to pick and reclaim a victim frame, returning
/// its physical address for reuse. `client.on_evict` is called once
/// per tenant before the frame's bookkeeping is torn down, mirroring
/// vm_evict_frame's dirty-check-then-swap_out-then-clear order.
///
/// Frames with more than one tenant (COW-shared, per section 4.7) are
/// pinned against eviction: a shared frame is read-only and therefore
/// clean by construction, but evicting it would require the victim's
/// single swap slot to serve two independent descriptors, which this
/// design does not attempt. A fork-heavy workload that shares every
/// resident frame can legitimately exhaust physical memory; that is
/// `NoPhysical`, not a bug in the clock sweep.
fn evict(client: &mut dyn EvictClient) -> VmResult<u64> {
    let victim_kva = {
        let mut table = TABLE.lock();
        if table.frames.is_empty() {
            return Err(VmError::NoPhysical);
        }
        let len = table.frames.len();
        if table.hand >= len {
            table.hand = 0;
        }
        let mut scanned = 0;
        loop {
            if scanned >= 2 * len {
                return Err(VmError::NoPhysical);
            }
            let i = table.hand;
            table.hand = (table.hand + 1) % len;
            scanned += 1;
            if table.frames[i].tenants.len() > 1 {
                continue;
            }
            if any_tenant_accessed(&table.frames[i]) {
                clear_all_accessed(&table.frames[i]);
                continue;
            }
            break table.frames[i].kva;
        }
    };

    let tenants = {
        let table = TABLE.lock();
        let pos = table.position_of(victim_kva).ok_or(VmError::NotFound)?;
        table.frames[pos].tenants.clone()
    };
    for t in &tenants {
        client.on_evict(t.va, &t.page_table, victim_kva)?;
        crate::vm::pagetable::pt_unmap(&mut t.page_table.lock(), t.va);
    }

    let mut table = TABLE.lock();
    table.remove_by_kva(victim_kva);
    Ok(victim_kva)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::pagetable::PageTableHandle;

    struct NoopClient;
    impl EvictClient for NoopClient {
        fn on_evict(
            &mut self,
            _va: u64,
            _pt: &Arc<Mutex<PageTableHandle>>,
            _kva: u64,
        ) -> VmResult<()> {
            Ok(())
        }
    }

    #[test_case]
    fn obtain_then_release_returns_frame_to_pool() {
        let before = physalloc::free_frames();
        let pt = Arc::new(Mutex::new(PageTableHandle::new()));
        let kva = obtain_frame(pt.clone(), 0x1000, &mut NoopClient).unwrap();
        assert!(physalloc::free_frames() == before - 1);
        release_frame(kva, &pt, 0x1000);
        assert_eq!(physalloc::free_frames(), before);
    }

    #[test_case]
    fn eviction_preserves_victim_then_reassigns_frame() {
        init_for_test(2);
        struct RecordingClient {
            evicted: Vec<u64>,
        }
        impl EvictClient for RecordingClient {
            fn on_evict(
                &mut self,
                va: u64,
                _pt: &Arc<Mutex<PageTableHandle>>,
                _kva: u64,
            ) -> VmResult<()> {
                self.evicted.push(va);
                Ok(())
            }
        }

        let pt = Arc::new(Mutex::new(PageTableHandle::new()));
        let mut client = RecordingClient { evicted: Vec::new() };
        let first = obtain_frame(pt.clone(), 0x1000, &mut client).unwrap();
        let second = obtain_frame(pt.clone(), 0x2000, &mut client).unwrap();
        assert_eq!(physalloc::free_frames(), 0);

        let third = obtain_frame(pt.clone(), 0x3000, &mut client).unwrap();
        assert_eq!(client.evicted.len(), 1);
        assert!(third == first || third == second);

        let survivor = if third == first { second } else { first };
        release_frame(third, &pt, 0x3000);
        release_frame(survivor, &pt, if survivor == first { 0x1000 } else { 0x2000 });
    }

    #[test_case]
    fn shared_frame_tracks_all_tenants() {
        let pt_a = Arc::new(Mutex::new(PageTableHandle::new()));
        let pt_b = Arc::new(Mutex::new(PageTableHandle::new()));
        let kva = obtain_frame(pt_a.clone(), 0x2000, &mut NoopClient).unwrap();
        assert!(!is_shared(kva));
        add_tenant(kva, pt_b.clone(), 0x2000).unwrap();
        assert!(is_shared(kva));
        release_frame(kva, &pt_a, 0x2000);
        assert!(!is_shared(kva));
        release_frame(kva, &pt_b, 0x2000);
    }
}
