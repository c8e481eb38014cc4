// File handles consumed by the VM core. The on-disk filesystem lives outside
// this crate; a `File` here is the open-handle seam the lazy loader and the
// writeback paths go through.
use alloc::sync::Arc;
use alloc::vec::Vec;
use lazy_static::lazy_static;
use spin::Mutex;

lazy_static! {
    /// Process-wide filesystem lock. The lazy loader and the dirty-page
    /// writeback paths take it around file I/O to serialize against every
    /// other filesystem user.
    pub static ref FILE_LOCK: Mutex<()> = Mutex::new(());
}

struct FileInner {
    data: Vec<u8>,
    pos: usize,
    writes: u64,
}

/// An open file. Clones share the same underlying file, the way duplicated
/// handles share an inode.
#[derive(Clone)]
pub struct File {
    inner: Arc<Mutex<FileInner>>,
}

impl File {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(FileInner {
                data,
                pos: 0,
                writes: 0,
            })),
        }
    }

    pub fn length(&self) -> usize {
        self.inner.lock().data.len()
    }

    pub fn seek(&self, pos: usize) {
        self.inner.lock().pos = pos;
    }

    /// Read from the current position, advancing it. Returns the number of
    /// bytes actually read, which is short at end of file.
    pub fn read(&self, buf: &mut [u8]) -> usize {
        let mut inner = self.inner.lock();
        let pos = inner.pos;
        let avail = inner.data.len().saturating_sub(pos);
        let n = buf.len().min(avail);
        buf[..n].copy_from_slice(&inner.data[pos..pos + n]);
        inner.pos = pos + n;
        n
    }

    pub fn read_at(&self, buf: &mut [u8], offset: usize) -> usize {
        let inner = self.inner.lock();
        let avail = inner.data.len().saturating_sub(offset);
        let n = buf.len().min(avail);
        buf[..n].copy_from_slice(&inner.data[offset..offset + n]);
        n
    }

    /// Write at an absolute offset, extending the file if the write lands
    /// past the current end. Returns the number of bytes written.
    pub fn write_at(&self, data: &[u8], offset: usize) -> usize {
        let mut inner = self.inner.lock();
        let end = offset + data.len();
        if inner.data.len() < end {
            inner.data.resize(end, 0);
        }
        inner.data[offset..end].copy_from_slice(data);
        inner.writes += 1;
        data.len()
    }

    /// Number of `write_at` calls issued against this file.
    pub fn write_count(&self) -> u64 {
        self.inner.lock().writes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn read_advances_position() {
        let f = File::new(vec![1, 2, 3, 4, 5]);
        let mut buf = [0u8; 2];
        assert_eq!(f.read(&mut buf), 2);
        assert_eq!(buf, [1, 2]);
        assert_eq!(f.read(&mut buf), 2);
        assert_eq!(buf, [3, 4]);
        assert_eq!(f.read(&mut buf), 1);
        assert_eq!(buf[0], 5);
    }

    #[test]
    fn write_at_extends_and_counts() {
        let f = File::new(vec![0u8; 4]);
        assert_eq!(f.write_count(), 0);
        f.write_at(&[7, 7], 3);
        assert_eq!(f.length(), 5);
        assert_eq!(f.write_count(), 1);

        let mut buf = [0u8; 5];
        f.read_at(&mut buf, 0);
        assert_eq!(buf, [0, 0, 0, 7, 7]);
    }

    #[test]
    fn clones_share_contents() {
        let f = File::new(vec![0u8; 2]);
        let g = f.clone();
        g.write_at(&[9], 0);
        let mut buf = [0u8; 1];
        f.read_at(&mut buf, 0);
        assert_eq!(buf[0], 9);
    }
}
