//! The file-backed shared mapping under the buffer region.

use std::{
    fs, io,
    ops::{Deref, DerefMut},
    os::fd::AsRawFd,
    path::Path,
    ptr::NonNull,
    slice,
};

/// A writable `MAP_SHARED` mapping over a module's `.mmap3` file.
///
/// Shared means the kernel owns the pages: bytes the process managed to write
/// reach the file even when the process never exits cleanly, which is what
/// makes the in-flight block recoverable after a crash. The region is unmapped
/// on drop; the file itself stays behind for the next run.
pub(crate) struct Mmap {
    ptr: NonNull<u8>,
    len: usize,
}

impl Mmap {
    /// Maps `len` bytes of the file at `path`, creating missing directories and
    /// sizing the file as needed. `len` is rounded up to whole pages, so the
    /// mapped region can be slightly larger than requested.
    pub(crate) fn new(path: impl AsRef<Path>, len: usize) -> io::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let page = unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) } as usize;
        let len = len.div_ceil(page) * page;

        let file = fs::OpenOptions::new().read(true).write(true).create(true).open(path)?;
        if file.metadata()?.len() != len as u64 {
            file.set_len(len as u64)?;
        }

        // SAFETY: the descriptor is open for the duration of the call and the
        // whole requested range is backed by the file sized above.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let Some(ptr) = NonNull::new(ptr as *mut u8) else {
            return Err(io::Error::last_os_error());
        };

        // The mapping keeps the pages alive on its own; the descriptor drops here.
        Ok(Self { ptr, len })
    }

    /// The mapped length in bytes (a multiple of the page size).
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }
}

impl Deref for Mmap {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &Self::Target {
        // SAFETY: `ptr` and `len` describe the live mapping established in `new`.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl DerefMut for Mmap {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        // SAFETY: `ptr` and `len` describe the live mapping established in `new`.
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for Mmap {
    fn drop(&mut self) {
        // Nothing useful to do with a failure here.
        _ = unsafe { libc::munmap(self.ptr.as_ptr().cast(), self.len) };
    }
}

// SAFETY: the mapping is exclusively owned and mutation goes through `&mut`.
unsafe impl Send for Mmap {}
unsafe impl Sync for Mmap {}

#[cfg(test)]
mod tests {
    use std::{fs, io};

    use tempfile::tempdir;

    use crate::mmap::Mmap;

    #[test]
    fn test_region_persists_across_mappings() -> io::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("module.mmap3");

        let mut mapping = Mmap::new(&path, 100)?;
        assert!(mapping.len() >= 100);
        mapping[..4].copy_from_slice(&[0xAA, 0xBB, 0xCC, 0xDD]);
        drop(mapping);

        // A second mapping of the same file sees the previous run's bytes; this
        // is the property crash recovery stands on.
        let mapping = Mmap::new(&path, 100)?;
        assert_eq!(&mapping[..4], &[0xAA, 0xBB, 0xCC, 0xDD]);

        // The backing file matches the rounded-up mapping length.
        assert_eq!(fs::metadata(&path)?.len(), mapping.len() as u64);
        Ok(())
    }
}
