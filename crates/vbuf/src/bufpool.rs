//! Size-shaped dma-buf pool: first-fit recycling over a [`BufAllocator`].

use crate::alloc::BufAllocator;
use crate::dmabuf::DmaBuf;
use crate::pool::{Lease, Pool, PoolStrategy, ReuseScore};

/// Pool strategy whose shape is a byte size: any parked buffer at least that
/// large is a perfect match (first fit wins, as buffers from one allocator
/// are near-uniform), smaller buffers are rejected.
pub struct BufStrategy {
    allocator: BufAllocator,
}

impl PoolStrategy for BufStrategy {
    type Resource = DmaBuf;
    type Shape = usize;

    fn alloc(&self, size: &usize) -> Option<DmaBuf> {
        self.allocator.alloc(*size).ok()
    }

    fn reuse_score(&self, buf: &DmaBuf, size: &usize) -> ReuseScore {
        if *size > 0 && *size <= buf.size() {
            ReuseScore::Exact
        } else {
            ReuseScore::Reject
        }
    }
}

/// A reclaiming pool of dma-bufs.
pub type BufPool = Pool<BufStrategy>;

/// A leased dma-buf; clones share the buffer and the final drop parks it.
pub type BufLease = Lease<BufStrategy>;

impl BufAllocator {
    /// A pool of up to `capacity` buffers backed by this allocator.
    pub fn new_pool(&self, capacity: usize) -> BufPool {
        Pool::new(
            capacity,
            BufStrategy {
                allocator: self.clone(),
            },
        )
    }
}
