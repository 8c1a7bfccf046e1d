// Page descriptor and its variants (spec.md section 4.3). Grounded on
// `vm/anon.c`/`vm/file.c`'s three-operation `page_operations` vtable,
// re-expressed as a tagged enum the way the teacher's
// `demand_paging::PageInfo`/`PageState` represents page state — a sum
// type instead of a C function-pointer struct.
use crate::vm::config::PAGE_SIZE;
use crate::vm::error::{VmError, VmResult};
use crate::vm::file::VmFile;
use crate::vm::pagetable::PageTableHandle;
use crate::vm::swap;
use alloc::sync::Arc;

/// What an Uninit page becomes once its initializer has run once.
pub enum UninitTarget {
    Anon,
    File {
        file: Arc<dyn VmFile>,
        offset: u64,
        read_bytes: u32,
    },
}

/// A lazy page's one-shot content producer. Writes into `dest` (the
/// page-sized slice backing the freshly claimed frame) and reports
/// what variant the descriptor should re-arm to.
pub trait InitFn: Send + Sync {
    fn run(&self, dest: &mut [u8]) -> VmResult<UninitTarget>;
}

/// `register_lazy`'s plain-Anon case: zero-fill, no file behind it.
pub struct ZeroInit;

impl InitFn for ZeroInit {
    fn run(&self, dest: &mut [u8]) -> VmResult<UninitTarget> {
        dest.fill(0);
        Ok(UninitTarget::Anon)
    }
}

/// The mmap/ELF-loader case: read `read_bytes` from `file` at `offset`,
/// zero-fill the remainder of the page.
pub struct FileInit {
    pub file: Arc<dyn VmFile>,
    pub offset: u64,
    pub read_bytes: u32,
}

impl InitFn for FileInit {
    fn run(&self, dest: &mut [u8]) -> VmResult<UninitTarget> {
        let read_bytes = self.read_bytes as usize;
        let n = self.file.read_at(self.offset, &mut dest[..read_bytes]);
        if n != read_bytes {
            return Err(VmError::FileIo);
        }
        dest[read_bytes..].fill(0);
        Ok(UninitTarget::File {
            file: self.file.clone(),
            offset: self.offset,
            read_bytes: self.read_bytes,
        })
    }
}

struct AnonState {
    swap_slot: Option<u64>,
}

struct FileState {
    file: Arc<dyn VmFile>,
    offset: u64,
    read_bytes: u32,
}

enum Variant {
    Uninit(Arc<dyn InitFn>),
    /// Child-of-fork sharing case (spec.md section 4.7 step 3): the
    /// descriptor has no content of its own yet. Its first claim does
    /// not run an initializer at all — `vm::fault` recognizes this
    /// variant, adds the child as a frame-table tenant of
    /// `source_kva`, and maps it in read-only, growing the parent
    /// frame's tenant list instead of copying its content.
    CowPending { source_kva: u64 },
    Anon(AnonState),
    File(FileState),
    PageCache,
}

/// One virtual page of one address space (spec.md section 4.3/4.4).
pub struct PageDescriptor {
    pub va: u64,
    pub writable: bool,
    pub shared: bool,
    pub frame: Option<u64>,
    variant: Variant,
}

impl PageDescriptor {
    pub fn new_uninit(va: u64, writable: bool, init: Arc<dyn InitFn>) -> Self {
        Self {
            va,
            writable,
            shared: false,
            frame: None,
            variant: Variant::Uninit(init),
        }
    }

    pub fn new_anon(va: u64, writable: bool) -> Self {
        Self {
            va,
            writable,
            shared: false,
            frame: None,
            variant: Variant::Anon(AnonState { swap_slot: None }),
        }
    }

    pub fn new_file(
        va: u64,
        writable: bool,
        file: Arc<dyn VmFile>,
        offset: u64,
        read_bytes: u32,
    ) -> Self {
        Self {
            va,
            writable,
            shared: false,
            frame: None,
            variant: Variant::File(FileState {
                file,
                offset,
                read_bytes,
            }),
        }
    }

    /// The sharing descriptor `vm::fork::spt_copy` installs for a
    /// resident Anon page: `shared` is already `true`, no frame yet.
    pub fn new_cow_share(va: u64, writable: bool, source_kva: u64) -> Self {
        Self {
            va,
            writable,
            shared: true,
            frame: None,
            variant: Variant::CowPending { source_kva },
        }
    }

    pub fn is_file(&self) -> bool {
        matches!(self.variant, Variant::File(_))
    }

    pub fn is_dirty_candidate(&self) -> bool {
        matches!(self.variant, Variant::File(_) | Variant::Anon(_))
    }

    /// The frame a `CowPending` descriptor is waiting to share, if any.
    pub fn cow_source(&self) -> Option<u64> {
        match &self.variant {
            Variant::CowPending { source_kva } => Some(*source_kva),
            _ => None,
        }
    }

    /// Finish a COW share claim: the descriptor now resides at `kva`
    /// as an ordinary (still-shared) Anon page.
    pub fn finish_cow_share(&mut self, kva: u64) {
        self.variant = Variant::Anon(AnonState { swap_slot: None });
        self.frame = Some(kva);
    }

    /// The lazy initializer backing an as-yet-unmaterialized page, for
    /// `vm::fork` to re-register an equivalent independent descriptor
    /// in the child when there is no frame yet to share.
    pub fn clone_uninit_for_fork(&self) -> Option<Arc<dyn InitFn>> {
        match &self.variant {
            Variant::Uninit(init) => Some(init.clone()),
            _ => None,
        }
    }

    pub fn mark_shared(&mut self) {
        self.shared = true;
    }

    /// Bring the page's content into the already-obtained frame at
    /// `kva`. Rearms `Uninit` into its target variant on success.
    pub fn swap_in(&mut self, kva: u64) -> VmResult<()> {
        let dest =
            unsafe { core::slice::from_raw_parts_mut(kva as *mut u8, PAGE_SIZE as usize) };
        match &mut self.variant {
            Variant::Uninit(init) => {
                let target = init.run(dest)?;
                self.variant = match target {
                    UninitTarget::Anon => Variant::Anon(AnonState { swap_slot: None }),
                    UninitTarget::File {
                        file,
                        offset,
                        read_bytes,
                    } => Variant::File(FileState {
                        file,
                        offset,
                        read_bytes,
                    }),
                };
                Ok(())
            }
            Variant::CowPending { .. } => {
                unreachable!("vm::fault claims CowPending without calling swap_in")
            }
            Variant::Anon(a) => {
                if let Some(slot) = a.swap_slot.take() {
                    swap::read(slot, dest);
                    swap::free(slot);
                }
                Ok(())
            }
            Variant::File(f) => {
                let read_bytes = f.read_bytes as usize;
                let n = f.file.read_at(f.offset, &mut dest[..read_bytes]);
                if n != read_bytes {
                    return Err(VmError::FileIo);
                }
                dest[read_bytes..].fill(0);
                Ok(())
            }
            Variant::PageCache => Err(VmError::NoMapping),
        }
    }

    /// Preserve the frame's content before it is reclaimed. `pt`/`va`
    /// give access to the hardware dirty bit; `kva` is the resident
    /// frame's address.
    pub fn swap_out(&mut self, pt: &mut PageTableHandle, va: u64, kva: u64) -> VmResult<()> {
        let src = unsafe { core::slice::from_raw_parts(kva as *const u8, PAGE_SIZE as usize) };
        match &mut self.variant {
            Variant::Uninit(_) | Variant::CowPending { .. } => {
                unreachable!("uninit/pending page is never resident with dirty state")
            }
            Variant::Anon(a) => {
                let slot = swap::alloc()?;
                swap::write(slot, src);
                a.swap_slot = Some(slot);
                Ok(())
            }
            Variant::File(f) => {
                if crate::vm::pagetable::pt_is_dirty(pt, va) {
                    let read_bytes = f.read_bytes as usize;
                    f.file.write_at(f.offset, &src[..read_bytes]);
                }
                Ok(())
            }
            Variant::PageCache => Err(VmError::NoMapping),
        }
    }

    /// Write back (if resident and dirty) and release any swap slot.
    /// Called once per descriptor during SPT teardown.
    pub fn destroy(&mut self, pt: Option<(&mut PageTableHandle, u64)>) {
        if let (Some(kva), Some((pt, va))) = (self.frame, pt) {
            if let Variant::File(f) = &self.variant {
                if crate::vm::pagetable::pt_is_dirty(pt, va) {
                    let src =
                        unsafe { core::slice::from_raw_parts(kva as *const u8, PAGE_SIZE as usize) };
                    let read_bytes = f.read_bytes as usize;
                    f.file.write_at(f.offset, &src[..read_bytes]);
                }
            }
        }
        if let Variant::Anon(a) = &mut self.variant {
            if let Some(slot) = a.swap_slot.take() {
                swap::free(slot);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::file::InMemoryFile;

    #[test_case]
    fn uninit_file_rearm_reads_content_and_zero_fills() {
        let file = InMemoryFile::new(alloc::vec![1, 2, 3, 4]);
        let mut page = PageDescriptor::new_uninit(
            0x1000,
            false,
            Arc::new(FileInit {
                file,
                offset: 0,
                read_bytes: 4,
            }),
        );
        let mut buf = alloc::vec![0xAAu8; PAGE_SIZE as usize];
        page.swap_in(buf.as_mut_ptr() as u64).unwrap();
        assert_eq!(&buf[..4], &[1, 2, 3, 4]);
        assert_eq!(buf[4], 0);
        assert!(page.is_file());
    }

    #[test_case]
    fn anon_swap_round_trip() {
        swap::init(alloc::boxed::Box::new(crate::vm::swap::RamSwapDisk::new(256)));
        let mut page = PageDescriptor::new_anon(0x2000, true);
        let mut buf = alloc::vec![0u8; PAGE_SIZE as usize];
        buf[10] = 0xAB;
        let mut pt = PageTableHandle::new();
        page.swap_out(&mut pt, 0x2000, buf.as_ptr() as u64).unwrap();
        let mut back = alloc::vec![0xFFu8; PAGE_SIZE as usize];
        page.swap_in(back.as_mut_ptr() as u64).unwrap();
        assert_eq!(back[10], 0xAB);
    }
}
