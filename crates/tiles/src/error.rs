use std::fmt;

use atlas::TileAllocError;
use model::{TilePos, TilingError};
use thiserror::Error;

use crate::image_handle::ImageId;

/// Which allocator a failed tile request went to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TilePool {
    Color,
    Index,
}

impl fmt::Display for TilePool {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TilePool::Color => write!(formatter, "color"),
            TilePool::Index => write!(formatter, "index"),
        }
    }
}

/// A tile request that could not be met even after growing to the backing's layer limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{pool} tile allocation failed")]
pub struct TileAllocationFailure {
    pub pool: TilePool,
    #[source]
    pub source: TileAllocError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ImageAtlasError {
    #[error("mip chain is empty or its element sizes do not halve twice per element")]
    InvalidMipChain,
    #[error("mip chain of {0} elements exceeds the mip level limit")]
    MipChainTooLong(usize),
    #[error("mip element is not alive")]
    UnknownMipElement,
    #[error("image {0:?} is not alive")]
    UnknownImage(ImageId),
    #[error("texel or tile range lies outside the mip element")]
    TileRangeOutOfBounds,
    #[error("expected {expected} texels, got {actual}")]
    TexelCountMismatch { expected: usize, actual: usize },
    #[error("shared tile for ({}, {}) has a different allocated size", .0.x, .0.y)]
    SharedTileSizeMismatch(TilePos),
    #[error("tile ({}, {}) is assigned more than one content source", .0.x, .0.y)]
    DuplicateTile(TilePos),
    #[error("backing layer edge is {backing} texels, tier needs {tier}")]
    BackingSizeMismatch { backing: u32, tier: u32 },
    #[error(transparent)]
    Tiling(#[from] TilingError),
    #[error(transparent)]
    Allocation(#[from] TileAllocationFailure),
}
