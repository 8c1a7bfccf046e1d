// Physical page pool backing the frame table (spec.md section 6,
// "From the physical allocator"). Grounded on
// memory::frame_allocator::BitmapFrameAllocator: a bitmap over physical
// page numbers, first-fit search starting from the slot after the last
// one handed out, wrapping around once.
use alloc::vec::Vec;
use lazy_static::lazy_static;
use spin::Mutex;
use x86_64::structures::paging::{FrameAllocator, FrameDeallocator, PhysFrame, Size4KiB};
use x86_64::PhysAddr;

pub struct KernelAddr(pub u64);

struct BitmapPool {
    bitmap: Vec<u64>,
    next_free: usize,
    total_frames: usize,
    free_frames: usize,
    base: u64,
}

impl BitmapPool {
    const fn empty() -> Self {
        Self {
            bitmap: Vec::new(),
            next_free: 0,
            total_frames: 0,
            free_frames: 0,
            base: 0,
        }
    }

    fn init(&mut self, base: u64, frame_count: usize) {
        self.base = base;
        self.total_frames = frame_count;
        self.free_frames = frame_count;
        let words = (frame_count + 63) / 64;
        self.bitmap = Vec::with_capacity(words);
        for _ in 0..words {
            self.bitmap.push(0);
        }
    }

    fn is_free(&self, n: usize) -> bool {
        self.bitmap[n / 64] & (1 << (n % 64)) == 0
    }

    fn mark_used(&mut self, n: usize) {
        self.bitmap[n / 64] |= 1 << (n % 64);
    }

    fn mark_free(&mut self, n: usize) {
        self.bitmap[n / 64] &= !(1 << (n % 64));
    }

    fn alloc(&mut self) -> Option<u64> {
        for n in self.next_free..self.total_frames {
            if self.is_free(n) {
                self.mark_used(n);
                self.next_free = n + 1;
                self.free_frames -= 1;
                return Some(self.base + (n as u64) * 4096);
            }
        }
        for n in 0..self.next_free {
            if self.is_free(n) {
                self.mark_used(n);
                self.next_free = n + 1;
                self.free_frames -= 1;
                return Some(self.base + (n as u64) * 4096);
            }
        }
        None
    }

    fn free(&mut self, addr: u64) {
        let n = ((addr - self.base) / 4096) as usize;
        self.mark_free(n);
        self.free_frames += 1;
    }
}

lazy_static! {
    static ref POOL: Mutex<BitmapPool> = Mutex::new(BitmapPool::empty());
}

/// Initialize the physical page pool from a contiguous usable region.
/// Must be called exactly once during boot before any `palloc_user` call.
pub fn init(base: u64, frame_count: usize) {
    POOL.lock().init(base, frame_count);
}

/// Allocate one zeroed physical page from the fixed user pool. Returns
/// `None` when the pool is exhausted (the caller, `FrameTable::obtain_frame`,
/// is responsible for invoking eviction in that case).
pub fn palloc_user() -> Option<KernelAddr> {
    let addr = POOL.lock().alloc()?;
    unsafe {
        core::ptr::write_bytes(addr as *mut u8, 0, 4096);
    }
    Some(KernelAddr(addr))
}

/// Release a page obtained from `palloc_user` back to the pool.
pub fn pfree(kva: KernelAddr) {
    POOL.lock().free(kva.0);
}

pub fn free_frames() -> usize {
    POOL.lock().free_frames
}

pub fn total_frames() -> usize {
    POOL.lock().total_frames
}

/// Re-seed the pool from a small heap-backed region so eviction tests
/// can force contention without waiting on real physical memory
/// exhaustion. Never used outside `#[cfg(test)]` callers.
#[cfg(test)]
pub fn init_for_test(frame_count: usize) {
    use alloc::boxed::Box;
    let bytes = frame_count * 4096;
    let region = Box::leak(alloc::vec![0u8; bytes].into_boxed_slice());
    POOL.lock().init(region.as_ptr() as u64, frame_count);
}

/// Adapter so the shared pool can also hand out frames for page-table
/// internal nodes via the `x86_64` mapper API.
pub struct PoolFrameAllocator;

unsafe impl FrameAllocator<Size4KiB> for PoolFrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame<Size4KiB>> {
        let kva = palloc_user()?;
        Some(PhysFrame::containing_address(PhysAddr::new(kva.0)))
    }
}

impl FrameDeallocator<Size4KiB> for PoolFrameAllocator {
    unsafe fn deallocate_frame(&mut self, frame: PhysFrame<Size4KiB>) {
        pfree(KernelAddr(frame.start_address().as_u64()));
    }
}
