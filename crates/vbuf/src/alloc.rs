//! Allocator backends producing [`DmaBuf`] handles.
//!
//! Two interchangeable strategies behind one interface: real dma-heap
//! devices (first usable from an ordered well-known list), and an
//! anonymous-memory-file fallback for hosts without usable heaps. Both
//! round sizes up to whole pages.

use crate::dmabuf::DmaBuf;
use crate::error::BufError;
use std::ffi::CStr;
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::Arc;

/// Well-known dma-heap devices, tried in order.
const HEAP_PATHS: [&CStr; 3] = [
    c"/dev/dma_heap/vidbuf_cached",
    c"/dev/dma_heap/linux,cma",
    c"/dev/dma_heap/reserved",
];

// dma-heap allocation ioctl, defined locally:
// _IOWR('H', 0, struct dma_heap_allocation_data).
const DMA_HEAP_IOCTL_ALLOC: libc::c_ulong = 0xc018_4800;

#[repr(C)]
struct DmaHeapAllocationData {
    len: u64,
    fd: u32,
    fd_flags: u32,
    heap_flags: u64,
}

/// One allocation strategy. `size` arrives already page-rounded.
trait HeapBackend: Send + Sync {
    fn alloc(&self, size: usize) -> Result<DmaBuf, BufError>;
}

/// Kernel dma-heap device.
struct DmaHeap {
    dev: OwnedFd,
}

impl DmaHeap {
    fn open() -> Result<DmaHeap, BufError> {
        for path in HEAP_PATHS {
            let fd = loop {
                let fd = unsafe { libc::open(path.as_ptr(), libc::O_RDWR | libc::O_CLOEXEC) };
                if fd == -1 && io::Error::last_os_error().kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                break fd;
            };
            if fd != -1 {
                return Ok(DmaHeap {
                    dev: unsafe { OwnedFd::from_raw_fd(fd) },
                });
            }
        }
        eprintln!("[dmabuf] unable to open any dma-heap device");
        Err(BufError::NoHeapDevice)
    }
}

impl HeapBackend for DmaHeap {
    fn alloc(&self, size: usize) -> Result<DmaBuf, BufError> {
        let mut data = DmaHeapAllocationData {
            len: size as u64,
            fd: 0,
            fd_flags: libc::O_RDWR as u32,
            heap_flags: 0,
        };
        loop {
            let rv = unsafe { libc::ioctl(self.dev.as_raw_fd(), DMA_HEAP_IOCTL_ALLOC, &mut data) };
            if rv == 0 {
                break;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                eprintln!("[dmabuf] dma-heap alloc of {} bytes failed: {}", size, err);
                return Err(BufError::Io(err));
            }
        }
        let fd = unsafe { OwnedFd::from_raw_fd(data.fd as libc::c_int) };
        Ok(DmaBuf::from_fd(fd, data.len as usize, false))
    }
}

/// Anonymous memory file per allocation; handles are fake (no device
/// coherency to manage).
struct MemfdHeap;

impl HeapBackend for MemfdHeap {
    fn alloc(&self, size: usize) -> Result<DmaBuf, BufError> {
        let fd = unsafe { libc::memfd_create(c"vbuf".as_ptr(), libc::MFD_CLOEXEC) };
        if fd == -1 {
            return Err(BufError::Io(io::Error::last_os_error()));
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        if unsafe { libc::ftruncate(fd.as_raw_fd(), size as libc::off_t) } != 0 {
            return Err(BufError::Io(io::Error::last_os_error()));
        }
        Ok(DmaBuf::from_fd(fd, size, true))
    }
}

struct AllocShared {
    page_size: usize,
    backend: Box<dyn HeapBackend>,
}

/// Buffer allocator over one backend. Clones share the backend; it is
/// released when the last clone (including those held by pools) drops.
#[derive(Clone)]
pub struct BufAllocator {
    shared: Arc<AllocShared>,
}

impl BufAllocator {
    /// Allocate from the first usable kernel dma-heap device.
    pub fn dma_heap() -> Result<BufAllocator, BufError> {
        let backend = DmaHeap::open()?;
        Ok(BufAllocator {
            shared: Arc::new(AllocShared {
                page_size: probe_page_size(),
                backend: Box::new(backend),
            }),
        })
    }

    /// Allocate anonymous memory files instead of real dma-bufs.
    pub fn memfd() -> BufAllocator {
        BufAllocator {
            shared: Arc::new(AllocShared {
                page_size: probe_page_size(),
                backend: Box::new(MemfdHeap),
            }),
        }
    }

    pub fn page_size(&self) -> usize {
        self.shared.page_size
    }

    /// Allocate a buffer of at least `size` bytes, rounded up to whole
    /// pages. Zero-size requests are rejected.
    pub fn alloc(&self, size: usize) -> Result<DmaBuf, BufError> {
        if size == 0 {
            return Err(BufError::ZeroSize);
        }
        self.shared
            .backend
            .alloc(round_up(size, self.shared.page_size))
    }

    /// Keep `old` if it is already large enough, otherwise drop it and
    /// allocate afresh.
    pub fn realloc(&self, old: Option<DmaBuf>, size: usize) -> Result<DmaBuf, BufError> {
        if let Some(old) = old {
            if old.size() >= size && size > 0 {
                return Ok(old);
            }
        }
        self.alloc(size)
    }
}

fn probe_page_size() -> usize {
    let ps = unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) };
    let ps = if ps > 0 { ps as usize } else { 0 };
    // Clamp implausible or non-power-of-two answers to 4k.
    if (0x1000..=0x0100_0000).contains(&ps) && ps.is_power_of_two() {
        ps
    } else {
        0x1000
    }
}

fn round_up(size: usize, page: usize) -> usize {
    (size + page - 1) & !(page - 1)
}
