// Backing-file abstraction for file-mapped pages (spec.md section 4.3,
// File variant) and for `mmap` (section 4.5). Grounded on file.c's
// `file_reopen`/`file_seek`/`file_read`/`file_write`: each mapping
// reopens its own file handle so closing the mapper's fd does not
// sever pages still mapped from it.
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

/// A seekable, byte-addressed file a page can be lazily loaded from
/// and written back to. The real filesystem implements this trait on
/// its own file handle type; tests use `InMemoryFile`.
pub trait VmFile: Send + Sync {
    fn length(&self) -> u64;
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> usize;
    fn write_at(&self, offset: u64, buf: &[u8]) -> usize;
}

/// An in-memory file, standing in for the filesystem in tests the way
/// `RamSwapDisk` stands in for the swap disk.
pub struct InMemoryFile {
    data: Mutex<Vec<u8>>,
}

impl InMemoryFile {
    pub fn new(contents: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            data: Mutex::new(contents),
        })
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.data.lock().clone()
    }
}

impl VmFile for InMemoryFile {
    fn length(&self) -> u64 {
        self.data.lock().len() as u64
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> usize {
        let data = self.data.lock();
        let offset = offset as usize;
        if offset >= data.len() {
            return 0;
        }
        let n = core::cmp::min(buf.len(), data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        n
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> usize {
        let mut data = self.data.lock();
        let offset = offset as usize;
        if data.len() < offset + buf.len() {
            data.resize(offset + buf.len(), 0);
        }
        data[offset..offset + buf.len()].copy_from_slice(buf);
        buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn read_past_end_returns_zero() {
        let f = InMemoryFile::new(alloc::vec![1, 2, 3]);
        let mut buf = [0u8; 8];
        assert_eq!(f.read_at(10, &mut buf), 0);
    }

    #[test_case]
    fn write_extends_file() {
        let f = InMemoryFile::new(Vec::new());
        f.write_at(4, &[9, 9]);
        assert_eq!(f.length(), 6);
        assert_eq!(f.snapshot(), alloc::vec![0, 0, 0, 0, 9, 9]);
    }

    #[test_case]
    fn partial_read_at_tail() {
        let f = InMemoryFile::new(alloc::vec![1, 2, 3, 4, 5]);
        let mut buf = [0u8; 4];
        let n = f.read_at(3, &mut buf);
        assert_eq!(n, 2);
        assert_eq!(&buf[..2], &[4, 5]);
    }
}
