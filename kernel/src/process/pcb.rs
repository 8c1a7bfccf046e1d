// Process Control Block, trimmed to what the virtual-memory core
// needs. Grounded on `process::pcb::ProcessControlBlock`/`AddressSpace`,
// stripped of the Windows-NT-specific fields (`FileDescriptor`,
// `WaitReason`, scheduling priority/time-slice, security IDs) that
// have no bearing on §4's fault/fork/teardown paths — the VM core
// owns exactly a page table, an SPT, and an MT per process.
use crate::vm::config::{PAGE_SIZE, USER_STACK_TOP};
use crate::vm::mmap::MmapTable;
use crate::vm::pagetable::PageTableHandle;
use crate::vm::spt::SupplementalPageTable;
use alloc::sync::Arc;
use spin::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ProcessId(pub u64);

/// Everything the VM core needs to own per process: the hardware page
/// table plus the two software tables layered over it. Held behind an
/// `Arc<Mutex<_>>` so frame-table tenants and fork's child/parent pair
/// can each hold a handle without the VM core needing a scheduler.
pub struct AddressSpace {
    pub page_table: Arc<Mutex<PageTableHandle>>,
    pub spt: SupplementalPageTable,
    pub mt: MmapTable,
    /// Lowest address of the currently mapped stack region. Starts one
    /// page above `USER_STACK_TOP`, a sentinel meaning "no stack page
    /// mapped yet" so the first growth fault maps exactly one page.
    pub stack_bottom: u64,
}

impl AddressSpace {
    pub fn new() -> Self {
        Self {
            page_table: Arc::new(Mutex::new(PageTableHandle::new())),
            spt: SupplementalPageTable::new(),
            mt: MmapTable::new(),
            stack_bottom: USER_STACK_TOP + PAGE_SIZE,
        }
    }
}

pub struct ProcessControlBlock {
    pub pid: ProcessId,
    pub address_space: Arc<Mutex<AddressSpace>>,
    pub exit_code: Option<i32>,
}

impl ProcessControlBlock {
    pub fn new(pid: ProcessId) -> Self {
        Self {
            pid,
            address_space: Arc::new(Mutex::new(AddressSpace::new())),
            exit_code: None,
        }
    }
}
