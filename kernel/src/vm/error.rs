// Error kinds surfaced by the virtual-memory core (spec.md section 7).
use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// User-mode access to a kernel address, or an out-of-range virtual address.
    AddressInvalid,
    /// Fault at an address with no SPT entry and outside the stack-growth window.
    NoMapping,
    /// Write to a non-writable, non-shared page.
    ProtectionViolation,
    /// `palloc_user` is empty and eviction itself failed (e.g. swap is full).
    NoPhysical,
    /// Swap bitmap is exhausted during `swap_out`.
    NoSwap,
    /// Read/write mismatch against the backing file during a lazy load or write-back.
    FileIo,
    /// An `mmap` target range collides with an existing SPT entry.
    Overlap,
    /// Malformed `mmap` arguments (unaligned address/offset, zero length, empty file, ...).
    BadArg,
    /// `insert` on a virtual address already present in the SPT.
    AlreadyMapped,
    /// `remove`/`find` on a virtual address with no descriptor.
    NotFound,
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            VmError::AddressInvalid => "address invalid",
            VmError::NoMapping => "no mapping",
            VmError::ProtectionViolation => "protection violation",
            VmError::NoPhysical => "no physical memory available",
            VmError::NoSwap => "swap exhausted",
            VmError::FileIo => "file I/O error",
            VmError::Overlap => "overlapping mapping",
            VmError::BadArg => "bad argument",
            VmError::AlreadyMapped => "already mapped",
            VmError::NotFound => "not found",
        };
        f.write_str(msg)
    }
}

pub type VmResult<T> = Result<T, VmError>;
