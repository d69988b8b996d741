//! Reference-counted dma-buf handle: descriptor, lazy mapping, logical
//! length, and CPU cache-sync brackets.
//!
//! A `DmaBuf` owns (or wraps) one kernel-backed buffer. Sharing is done by
//! putting it behind an `Arc` or a pool lease; the handle itself carries no
//! reference count. "Fake" handles have no real dma-buf behind them
//! (imported memory, memfd-backed allocations); cache sync is a no-op for
//! them since there is no device coherency to manage.

use crate::error::BufError;
use once_cell::sync::OnceCell;
use std::fmt;
use std::io;
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

// dma-buf sync ioctl, defined locally: _IOW('b', 0, struct dma_buf_sync).
const DMA_BUF_IOCTL_SYNC: libc::c_ulong = 0x4008_6200;

const DMA_BUF_SYNC_READ: u64 = 1 << 0;
const DMA_BUF_SYNC_WRITE: u64 = 2 << 0;
const DMA_BUF_SYNC_START: u64 = 0;
const DMA_BUF_SYNC_END: u64 = 1 << 2;

#[repr(C)]
struct DmaBufSyncArg {
    flags: u64,
}

/// Which way the CPU access goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDirection {
    Read,
    Write,
    ReadWrite,
}

impl SyncDirection {
    fn flag(self) -> u64 {
        match self {
            SyncDirection::Read => DMA_BUF_SYNC_READ,
            SyncDirection::Write => DMA_BUF_SYNC_WRITE,
            SyncDirection::ReadWrite => DMA_BUF_SYNC_READ | DMA_BUF_SYNC_WRITE,
        }
    }
}

/// Opening or closing the access bracket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Start,
    End,
}

impl SyncPhase {
    fn flag(self) -> u64 {
        match self {
            SyncPhase::Start => DMA_BUF_SYNC_START,
            SyncPhase::End => DMA_BUF_SYNC_END,
        }
    }
}

/// A live shared read/write mapping, unmapped on drop.
struct Mapping {
    ptr: NonNull<u8>,
    len: usize,
}

// The mapping is plain shared memory; the pointer is stable for the life of
// the handle and access synchronisation is the caller's affair (sync
// brackets plus whatever fencing the producer imposes).
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Drop for Mapping {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr().cast(), self.len);
        }
    }
}

/// One kernel-backed (or imported) buffer.
pub struct DmaBuf {
    fd: Option<OwnedFd>,
    /// Allocation size, page-rounded by the backend.
    size: usize,
    /// Logical content length, independent of the allocation size.
    len: AtomicUsize,
    map: OnceCell<Mapping>,
    fake: bool,
}

impl DmaBuf {
    pub(crate) fn from_fd(fd: OwnedFd, size: usize, fake: bool) -> DmaBuf {
        DmaBuf {
            fd: Some(fd),
            size,
            len: AtomicUsize::new(0),
            map: OnceCell::new(),
            fake,
        }
    }

    /// Wrap an externally owned descriptor, duplicating it. The handle is
    /// fake: reuse logic treats it as always compatible and sync is a no-op.
    pub fn import(fd: BorrowedFd<'_>, size: usize) -> Result<DmaBuf, BufError> {
        if size == 0 {
            return Err(BufError::ZeroSize);
        }
        let fd = fd.try_clone_to_owned().map_err(BufError::Io)?;
        Ok(DmaBuf::from_fd(fd, size, true))
    }

    /// Wrap an existing mapping with no descriptor behind it.
    ///
    /// # Safety
    ///
    /// `ptr..ptr+len` must be a live mapping obtained from `mmap`, not
    /// unmapped elsewhere; the handle unmaps it when dropped.
    pub unsafe fn import_mmap(ptr: NonNull<u8>, len: usize) -> DmaBuf {
        DmaBuf {
            fd: None,
            size: len,
            len: AtomicUsize::new(0),
            map: OnceCell::with_value(Mapping { ptr, len }),
            fake: true,
        }
    }

    /// The underlying descriptor, if there is one.
    pub fn fd(&self) -> Option<BorrowedFd<'_>> {
        self.fd.as_ref().map(|fd| fd.as_fd())
    }

    /// Allocation size (page-rounded).
    pub fn size(&self) -> usize {
        self.size
    }

    /// Logical content length.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn set_len(&self, len: usize) {
        self.len.store(len, Ordering::Relaxed);
    }

    /// No real kernel dma-buf behind this handle.
    pub fn is_fake(&self) -> bool {
        self.fake
    }

    /// Map the buffer shared read/write, lazily on first use. Idempotent;
    /// failure has no side effects and the call may be retried.
    pub fn map(&self) -> Result<NonNull<u8>, BufError> {
        let mapping = self.map.get_or_try_init(|| self.map_new())?;
        Ok(mapping.ptr)
    }

    fn map_new(&self) -> Result<Mapping, BufError> {
        let fd = self.fd.as_ref().ok_or(BufError::Unmappable)?;
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                self.size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_POPULATE,
                fd.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(BufError::Io(io::Error::last_os_error()));
        }
        NonNull::new(ptr.cast::<u8>())
            .map(|ptr| Mapping {
                ptr,
                len: self.size,
            })
            .ok_or(BufError::Unmappable)
    }

    /// Bracket CPU access with the dma-buf sync ioctl. Interruptions are
    /// retried; any other failure is returned for the caller to handle.
    /// No-op for fake handles.
    pub fn sync(&self, direction: SyncDirection, phase: SyncPhase) -> Result<(), BufError> {
        if self.fake {
            return Ok(());
        }
        let Some(fd) = self.fd.as_ref() else {
            return Ok(());
        };
        let arg = DmaBufSyncArg {
            flags: direction.flag() | phase.flag(),
        };
        loop {
            let rv = unsafe { libc::ioctl(fd.as_raw_fd(), DMA_BUF_IOCTL_SYNC, &arg) };
            if rv == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(BufError::Io(err));
            }
        }
    }

    /// Map (if needed) and open a CPU read bracket. Fails without issuing
    /// the sync ioctl when the buffer cannot be mapped.
    pub fn read_start(&self) -> Result<(), BufError> {
        self.map()?;
        self.sync(SyncDirection::Read, SyncPhase::Start)
    }

    pub fn read_end(&self) -> Result<(), BufError> {
        self.sync(SyncDirection::Read, SyncPhase::End)
    }

    pub fn write_start(&self) -> Result<(), BufError> {
        self.sync(SyncDirection::Write, SyncPhase::Start)
    }

    pub fn write_end(&self) -> Result<(), BufError> {
        self.sync(SyncDirection::Write, SyncPhase::End)
    }
}

impl fmt::Debug for DmaBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaBuf")
            .field("fd", &self.fd.as_ref().map(|fd| fd.as_raw_fd()))
            .field("size", &self.size)
            .field("len", &self.len())
            .field("fake", &self.fake)
            .field("mapped", &self.map.get().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_flags() {
        assert_eq!(
            SyncDirection::ReadWrite.flag(),
            DMA_BUF_SYNC_READ | DMA_BUF_SYNC_WRITE
        );
        assert_eq!(SyncPhase::Start.flag(), 0);
        assert_eq!(SyncPhase::End.flag(), DMA_BUF_SYNC_END);
    }

    #[test]
    fn test_import_rejects_zero_size() {
        let file = std::fs::File::open("/dev/null").unwrap();
        let fd = std::os::unix::io::AsFd::as_fd(&file);
        assert!(matches!(DmaBuf::import(fd, 0), Err(BufError::ZeroSize)));
    }

    #[test]
    fn test_import_is_fake_and_syncs_ok() {
        let file = std::fs::File::open("/dev/null").unwrap();
        let fd = std::os::unix::io::AsFd::as_fd(&file);
        let buf = DmaBuf::import(fd, 4096).unwrap();
        assert!(buf.is_fake());
        assert_eq!(buf.size(), 4096);
        // Fake handles never issue the ioctl.
        buf.write_start().unwrap();
        buf.write_end().unwrap();
    }

    #[test]
    fn test_len_is_independent_of_size() {
        let file = std::fs::File::open("/dev/null").unwrap();
        let fd = std::os::unix::io::AsFd::as_fd(&file);
        let buf = DmaBuf::import(fd, 4096).unwrap();
        assert_eq!(buf.len(), 0);
        buf.set_len(100);
        assert_eq!(buf.len(), 100);
        assert_eq!(buf.size(), 4096);
    }
}
