//! Error type for buffer allocation and handle operations.

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BufError {
    /// Zero-sized allocations are rejected before reaching any backend.
    #[error("zero-sized buffer allocation")]
    ZeroSize,

    /// None of the well-known dma-heap devices could be opened.
    #[error("no usable dma-heap device")]
    NoHeapDevice,

    /// The handle has no descriptor and no pre-existing mapping.
    #[error("buffer is not mappable")]
    Unmappable,

    #[error(transparent)]
    Io(#[from] io::Error),
}
