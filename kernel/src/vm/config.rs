// Constants shared across the virtual-memory core.

/// Bytes in one virtual/physical page.
pub const PAGE_SIZE: u64 = 4096;

/// Bytes in one disk sector.
pub const SECTOR_SIZE: u64 = 512;

/// Sectors consumed by one swapped-out page.
pub const SEC_WRITE_CNT: u64 = PAGE_SIZE / SECTOR_SIZE;

/// Tolerance below the user stack pointer within which an unmapped
/// fault is treated as stack growth rather than a bad access (the
/// "push-before-decrement" idiom on x86).
pub const STACK_FAULT_TOLERANCE: u64 = 8;

/// Maximum size the user stack is allowed to grow to, measured down
/// from its initial top. Not specified by the source; chosen here per
/// the commonly used default of 8 MiB.
pub const USER_STACK_LIMIT: u64 = 8 * 1024 * 1024;

/// Lowest address considered kernel space, matching `memory::KERNEL_BASE`.
pub const KERNEL_BASE: u64 = 0xFFFF_8000_0000_0000;

/// Top page of the user stack in a fresh address space, one page below
/// `memory::USER_SPACE_END` (0x0000_7FFF_FFFF_FFFF).
pub const USER_STACK_TOP: u64 = 0x0000_7FFF_FFFF_F000;

/// True if `addr` lies in the kernel's half of the address space.
pub const fn is_kernel_address(addr: u64) -> bool {
    addr >= KERNEL_BASE
}

/// Round `addr` down to the start of its containing page.
pub const fn page_round_down(addr: u64) -> u64 {
    addr & !(PAGE_SIZE - 1)
}

/// Round `addr` up to the start of the next page (no-op if already aligned).
pub const fn page_round_up(addr: u64) -> u64 {
    page_round_down(addr + PAGE_SIZE - 1)
}

/// True if `addr` is page-aligned.
pub const fn is_page_aligned(addr: u64) -> bool {
    addr & (PAGE_SIZE - 1) == 0
}
