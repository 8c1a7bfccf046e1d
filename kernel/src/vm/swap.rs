// Swap slot allocator (spec.md section 4.1). Grounded on anon.c's
// `swap_bitmap`/`swap_write`/`swap_read`: a bitmap over disk sectors,
// `bitmap_scan_and_flip` finds SEC_WRITE_CNT contiguous free sectors
// for one page, and each slot is written/read SECTOR_SIZE at a time.
// `SwapDisk` abstracts the backing disk the way `anon.c` abstracts
// `struct disk`, so the allocator's bookkeeping can be exercised
// against an in-memory double without real hardware.
use crate::vm::config::{PAGE_SIZE, SECTOR_SIZE, SEC_WRITE_CNT};
use crate::vm::error::{VmError, VmResult};
use alloc::vec::Vec;
use lazy_static::lazy_static;
use spin::Mutex;

/// A disk addressable by fixed-size sectors, as the swap allocator needs.
pub trait SwapDisk: Send {
    fn sector_count(&self) -> u64;
    fn read_sector(&mut self, sector: u64, buf: &mut [u8]);
    fn write_sector(&mut self, sector: u64, buf: &[u8]);
}

/// An in-memory stand-in for a swap partition, used by tests and by
/// any boot configuration without a real disk behind it.
pub struct RamSwapDisk {
    sectors: Vec<[u8; SECTOR_SIZE as usize]>,
}

impl RamSwapDisk {
    pub fn new(sector_count: u64) -> Self {
        Self {
            sectors: alloc::vec![[0u8; SECTOR_SIZE as usize]; sector_count as usize],
        }
    }
}

impl SwapDisk for RamSwapDisk {
    fn sector_count(&self) -> u64 {
        self.sectors.len() as u64
    }

    fn read_sector(&mut self, sector: u64, buf: &mut [u8]) {
        buf.copy_from_slice(&self.sectors[sector as usize]);
    }

    fn write_sector(&mut self, sector: u64, buf: &[u8]) {
        self.sectors[sector as usize].copy_from_slice(buf);
    }
}

struct SwapBitmap {
    bits: Vec<u64>,
    sector_count: u64,
}

impl SwapBitmap {
    const fn empty() -> Self {
        Self {
            bits: Vec::new(),
            sector_count: 0,
        }
    }

    fn init(&mut self, sector_count: u64) {
        let words = ((sector_count + 63) / 64) as usize;
        self.bits = alloc::vec![0u64; words];
        self.sector_count = sector_count;
    }

    fn get(&self, n: u64) -> bool {
        self.bits[(n / 64) as usize] & (1 << (n % 64)) != 0
    }

    fn set(&mut self, n: u64, value: bool) {
        let word = &mut self.bits[(n / 64) as usize];
        if value {
            *word |= 1 << (n % 64);
        } else {
            *word &= !(1 << (n % 64));
        }
    }

    /// Find SEC_WRITE_CNT contiguous clear bits and set them, mirroring
    /// `bitmap_scan_and_flip(swap_bitmap, 0, SEC_WRITE_CNT, false)`.
    fn scan_and_flip(&mut self) -> Option<u64> {
        if self.sector_count < SEC_WRITE_CNT {
            return None;
        }
        let mut start = 0u64;
        while start + SEC_WRITE_CNT <= self.sector_count {
            let mut ok = true;
            for i in 0..SEC_WRITE_CNT {
                if self.get(start + i) {
                    ok = false;
                    start += i + 1;
                    break;
                }
            }
            if ok {
                for i in 0..SEC_WRITE_CNT {
                    self.set(start + i, true);
                }
                return Some(start);
            }
        }
        None
    }

    fn clear_run(&mut self, sec_no: u64) {
        for i in 0..SEC_WRITE_CNT {
            self.set(sec_no + i, false);
        }
    }
}

lazy_static! {
    static ref SWAP: Mutex<SwapBitmap> = Mutex::new(SwapBitmap::empty());
    // Held only across the disk transfer itself, never across bitmap
    // index selection: `SWAP` and `DISK` are deliberately two locks so
    // a blocking sector read/write never stalls an unrelated alloc/free.
    static ref DISK: Mutex<Option<alloc::boxed::Box<dyn SwapDisk>>> = Mutex::new(None);
}

/// Install the backing disk. Must run once during boot before any
/// anonymous page is swapped out.
pub fn init(disk: alloc::boxed::Box<dyn SwapDisk>) {
    SWAP.lock().init(disk.sector_count());
    *DISK.lock() = Some(disk);
}

/// Reserve one page's worth of swap sectors. Returns the starting
/// sector number, or `VmError::NoSwap` when the disk is full.
pub fn alloc() -> VmResult<u64> {
    SWAP.lock().scan_and_flip().ok_or(VmError::NoSwap)
}

/// Release the sectors starting at `sec_no` back to the free pool.
pub fn free(sec_no: u64) {
    SWAP.lock().clear_run(sec_no);
}

/// Write one page (`PAGE_SIZE` bytes) to the run starting at `sec_no`.
/// Locks only the disk, not the bitmap: the slot was already reserved
/// by `alloc`, so no other caller can race this run.
pub fn write(sec_no: u64, page: &[u8]) {
    debug_assert_eq!(page.len() as u64, PAGE_SIZE);
    let mut guard = DISK.lock();
    let disk = guard.as_deref_mut().expect("swap disk not initialized");
    for i in 0..SEC_WRITE_CNT {
        let off = (i * SECTOR_SIZE) as usize;
        disk.write_sector(sec_no + i, &page[off..off + SECTOR_SIZE as usize]);
    }
}

/// Read one page's worth of data back from the run starting at `sec_no`.
pub fn read(sec_no: u64, page: &mut [u8]) {
    debug_assert_eq!(page.len() as u64, PAGE_SIZE);
    let mut guard = DISK.lock();
    let disk = guard.as_deref_mut().expect("swap disk not initialized");
    for i in 0..SEC_WRITE_CNT {
        let off = (i * SECTOR_SIZE) as usize;
        disk.read_sector(sec_no + i, &mut page[off..off + SECTOR_SIZE as usize]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(sectors: u64) {
        init(alloc::boxed::Box::new(RamSwapDisk::new(sectors)));
    }

    #[test_case]
    fn alloc_free_roundtrip() {
        setup(256);
        let sec = alloc().unwrap();
        let data = [7u8; PAGE_SIZE as usize];
        write(sec, &data);
        let mut back = [0u8; PAGE_SIZE as usize];
        read(sec, &mut back);
        assert_eq!(&data[..], &back[..]);
        free(sec);
    }

    #[test_case]
    fn exhaustion_reports_no_swap() {
        setup(SEC_WRITE_CNT);
        let first = alloc();
        assert!(first.is_ok());
        let second = alloc();
        assert_eq!(second, Err(VmError::NoSwap));
    }
}
