//! vbuf: dma-buf handles, allocator backends, and a reclaiming buffer pool.
//!
//! Decoded frames live in scarce kernel-backed buffers that are expensive to
//! allocate and must not be freed while other consumers still hold fences on
//! them. This crate provides the buffer handle ([`DmaBuf`]), two allocation
//! backends behind one interface ([`BufAllocator`]), a generic reclaiming
//! pool that recycles resources by intercepting their final release
//! ([`Pool`]/[`Lease`]), the size-shaped buffer pool built on it
//! ([`BufPool`]), and a fence-release watch driven by the `vbuf-reactor`
//! poll loop.

mod alloc;
mod bufpool;
mod dmabuf;
mod error;
pub mod fence;
mod pool;

pub use alloc::BufAllocator;
pub use bufpool::{BufLease, BufPool, BufStrategy};
pub use dmabuf::{DmaBuf, SyncDirection, SyncPhase};
pub use error::BufError;
pub use pool::{Lease, Pool, PoolStrategy, ReuseScore};
