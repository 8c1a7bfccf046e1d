// User virtual-memory core: per-process supplemental page table (SPT),
// physical frame table (FT), swap-slot allocator, memory-map table
// (MT), fault handler, and copy-on-write fork. See spec.md for the
// full module-by-module contract; this file is just the public façade
// the rest of the kernel (ELF loader, syscall layer, trap handler,
// process lifecycle) talks to.
pub mod config;
pub mod error;
pub mod fault;
pub mod file;
pub mod fork;
pub mod frame;
pub mod mmap;
pub mod page;
pub mod pagetable;
pub mod physalloc;
pub mod spt;
pub mod swap;

use crate::process::pcb::AddressSpace;
use crate::vm::error::VmResult;
use crate::vm::page::{InitFn, PageDescriptor};
use alloc::sync::Arc;

/// To the ELF loader / `mmap`: register an Uninit descriptor at `va`
/// whose content is produced by `init` on first fault (spec.md
/// section 6, "To the ELF loader / mmap").
pub fn register_lazy(
    address_space: &mut AddressSpace,
    va: u64,
    writable: bool,
    init: Arc<dyn InitFn>,
) -> VmResult<()> {
    address_space
        .spt
        .insert(PageDescriptor::new_uninit(va, writable, init))
}
