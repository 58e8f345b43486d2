//! Tile grid arithmetic for a single mip element.
//!
//! A padded axis of logical size `S` is covered by tiles whose texel `0` sits at logical
//! `i * W - P`, where `W` is [`TILE_SIZE_WITHOUT_PADDING`] and `P` is [`TILE_PADDING`].
//! Every tile except the last carries padding on both sides. The last tile only carries
//! front padding and is trimmed to the exact number of texels needed to reach `S`.
//!
//! An element that fits inside a single tile is stored unpadded: texel `p` of the tile is
//! logical texel `p`.

use thiserror::Error;

use crate::{Extent2, TILE_PADDING, TILE_SIZE, TILE_SIZE_WITHOUT_PADDING, TilePos};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TilingError {
    #[error("image size must be at least one texel on each axis")]
    ZeroSize,
    #[error("unpadded tiling requires the image to fit in one tile, got {0} texels")]
    UnpaddedTooLarge(u32),
    #[error("tile ({x}, {y}) is outside the tile grid")]
    TileOutOfBounds { x: u32, y: u32 },
    #[error("tile range {begin}..{end} is empty or outside the tile grid")]
    InvalidTileRange { begin: u32, end: u32 },
    #[error("tile grid of {0} tiles exceeds the addressable range")]
    GridTooLarge(u64),
}

/// Texels a tile covers along one axis at some LOD, in logical coordinates of that LOD.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileSpan {
    pub start: i64,
    pub length: u32,
}

impl TileSpan {
    pub const fn end(self) -> i64 {
        self.start + self.length as i64
    }

    fn overlap(self, begin: u32, end: u32) -> Option<(u32, u32)> {
        let lo = self.start.max(i64::from(begin));
        let hi = self.end().min(i64::from(end));
        if lo >= hi {
            return None;
        }
        Some((lo as u32, hi as u32))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AxisTiling {
    size: u32,
    count: u32,
    remainder_exact: u32,
    padded: bool,
}

impl AxisTiling {
    pub fn padded(size: u32) -> Result<Self, TilingError> {
        if size == 0 {
            return Err(TilingError::ZeroSize);
        }
        let needed = u64::from(size) + u64::from(TILE_PADDING);
        let overflow = needed.saturating_sub(u64::from(TILE_SIZE));
        let count = 1 + overflow.div_ceil(u64::from(TILE_SIZE_WITHOUT_PADDING));
        let count = u32::try_from(count).map_err(|_| TilingError::GridTooLarge(count))?;
        let covered_before_last = u64::from(count - 1) * u64::from(TILE_SIZE_WITHOUT_PADDING);
        let remainder_exact = (needed - covered_before_last) as u32;
        Ok(Self {
            size,
            count,
            remainder_exact,
            padded: true,
        })
    }

    pub fn unpadded(size: u32) -> Result<Self, TilingError> {
        if size == 0 {
            return Err(TilingError::ZeroSize);
        }
        if size > TILE_SIZE {
            return Err(TilingError::UnpaddedTooLarge(size));
        }
        Ok(Self {
            size,
            count: 1,
            remainder_exact: size,
            padded: false,
        })
    }

    /// Tiling of the tiles `begin..end` of `self`, as used by sub mip elements that alias
    /// tiles of a larger element.
    pub fn sub_range(&self, begin: u32, end: u32) -> Result<Self, TilingError> {
        if begin >= end || end > self.count {
            return Err(TilingError::InvalidTileRange { begin, end });
        }
        if !self.padded {
            return Ok(*self);
        }
        let count = end - begin;
        let remainder_exact = if end == self.count {
            self.remainder_exact
        } else {
            TILE_SIZE
        };
        let size = remainder_exact + (count - 1) * TILE_SIZE_WITHOUT_PADDING - TILE_PADDING;
        Ok(Self {
            size,
            count,
            remainder_exact,
            padded: true,
        })
    }

    pub const fn size(&self) -> u32 {
        self.size
    }

    pub const fn count(&self) -> u32 {
        self.count
    }

    pub const fn is_padded(&self) -> bool {
        self.padded
    }

    pub const fn padding(&self) -> u32 {
        if self.padded { TILE_PADDING } else { 0 }
    }

    /// Exact size of the last tile, padding included.
    pub const fn remainder_size_exact(&self) -> u32 {
        self.remainder_exact
    }

    /// Size of the last tile as allocated, the exact size rounded up to a power of two.
    pub const fn remainder_size(&self) -> u32 {
        self.remainder_exact.next_power_of_two()
    }

    const fn is_last(&self, tile: u32) -> bool {
        tile + 1 == self.count
    }

    pub const fn tile_size_exact(&self, tile: u32) -> u32 {
        if self.is_last(tile) {
            self.remainder_exact
        } else {
            TILE_SIZE
        }
    }

    pub const fn tile_size(&self, tile: u32) -> u32 {
        if self.is_last(tile) {
            self.remainder_size()
        } else {
            TILE_SIZE
        }
    }

    pub const fn tile_size_without_padding(&self, tile: u32) -> u32 {
        if !self.padded {
            self.remainder_exact
        } else if self.is_last(tile) {
            self.remainder_exact - TILE_PADDING
        } else {
            TILE_SIZE_WITHOUT_PADDING
        }
    }

    pub fn tile_span(&self, tile: u32, lod: u32) -> TileSpan {
        let start = if self.padded {
            (i64::from(tile) * i64::from(TILE_SIZE_WITHOUT_PADDING) - i64::from(TILE_PADDING))
                >> lod
        } else {
            0
        };
        TileSpan {
            start,
            length: self.tile_size_exact(tile).div_ceil(1 << lod),
        }
    }

    /// Tile whose unpadded content owns logical texel `position` at LOD 0.
    pub fn tile_containing(&self, position: u32) -> u32 {
        if !self.padded {
            return 0;
        }
        (position / TILE_SIZE_WITHOUT_PADDING).min(self.count - 1)
    }

    /// Every tile whose texels, padding included, intersect `begin..end` at `lod`, paired
    /// with the intersected logical range.
    pub fn tiles_touching(
        &self,
        begin: u32,
        end: u32,
        lod: u32,
    ) -> impl Iterator<Item = (u32, u32, u32)> + '_ {
        let (first, last) = if begin >= end {
            (1, 0)
        } else if self.padded {
            // Rounding of shifted tile origins is absorbed by widening the candidate range.
            let inner = (TILE_SIZE_WITHOUT_PADDING >> lod).max(1);
            let padding = TILE_PADDING >> lod;
            let first = ((begin + padding) / inner).saturating_sub(1);
            let last = ((end - 1 + padding) / inner + 1).min(self.count - 1);
            (first, last)
        } else {
            (0, 0)
        };
        (first..=last).filter_map(move |tile| {
            let (lo, hi) = self.tile_span(tile, lod).overlap(begin, end)?;
            Some((tile, lo, hi))
        })
    }
}

/// Two-axis tile grid of one mip element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileGrid {
    x: AxisTiling,
    y: AxisTiling,
}

impl TileGrid {
    /// Grid for a freshly created element; unpadded only when a single tile holds it.
    pub fn new(size: Extent2) -> Result<Self, TilingError> {
        if size.is_empty() {
            return Err(TilingError::ZeroSize);
        }
        if size.fits_in_tile() {
            Self::from_axes(
                AxisTiling::unpadded(size.width)?,
                AxisTiling::unpadded(size.height)?,
            )
        } else {
            Self::from_axes(
                AxisTiling::padded(size.width)?,
                AxisTiling::padded(size.height)?,
            )
        }
    }

    fn from_axes(x: AxisTiling, y: AxisTiling) -> Result<Self, TilingError> {
        let total = u64::from(x.count()) * u64::from(y.count());
        if total > u64::from(u32::MAX) {
            return Err(TilingError::GridTooLarge(total));
        }
        Ok(Self { x, y })
    }

    /// Grid of the tiles in `min..max` (exclusive upper bound) of `self`.
    pub fn sub_grid(&self, min: TilePos, max: TilePos) -> Result<Self, TilingError> {
        Self::from_axes(self.x.sub_range(min.x, max.x)?, self.y.sub_range(min.y, max.y)?)
    }

    pub const fn x(&self) -> &AxisTiling {
        &self.x
    }

    pub const fn y(&self) -> &AxisTiling {
        &self.y
    }

    pub const fn size(&self) -> Extent2 {
        Extent2::new(self.x.size(), self.y.size())
    }

    pub const fn is_padded(&self) -> bool {
        self.x.is_padded()
    }

    pub const fn padding(&self) -> u32 {
        self.x.padding()
    }

    pub const fn tile_count(&self) -> TilePos {
        TilePos::new(self.x.count(), self.y.count())
    }

    pub const fn number_tiles(&self) -> usize {
        self.tile_count().area()
    }

    pub const fn remainder_size(&self) -> Extent2 {
        Extent2::new(self.x.remainder_size(), self.y.remainder_size())
    }

    pub const fn remainder_size_exact(&self) -> Extent2 {
        Extent2::new(self.x.remainder_size_exact(), self.y.remainder_size_exact())
    }

    pub fn tile_index(&self, tile: TilePos) -> Result<usize, TilingError> {
        if tile.x >= self.x.count() || tile.y >= self.y.count() {
            return Err(TilingError::TileOutOfBounds {
                x: tile.x,
                y: tile.y,
            });
        }
        Ok(tile.y as usize * self.x.count() as usize + tile.x as usize)
    }

    pub fn tile_pos(&self, index: usize) -> Result<TilePos, TilingError> {
        if index >= self.number_tiles() {
            return Err(TilingError::TileOutOfBounds {
                x: u32::MAX,
                y: u32::MAX,
            });
        }
        let row = self.x.count() as usize;
        Ok(TilePos::new((index % row) as u32, (index / row) as u32))
    }

    pub fn iter_tiles(&self) -> impl Iterator<Item = TilePos> + '_ {
        (0..self.y.count())
            .flat_map(move |y| (0..self.x.count()).map(move |x| TilePos::new(x, y)))
    }

    /// Exact texel extent of a tile, with or without its padding.
    pub const fn tile_size(&self, tile: TilePos, include_padding: bool) -> Extent2 {
        if include_padding {
            Extent2::new(self.x.tile_size_exact(tile.x), self.y.tile_size_exact(tile.y))
        } else {
            Extent2::new(
                self.x.tile_size_without_padding(tile.x),
                self.y.tile_size_without_padding(tile.y),
            )
        }
    }

    /// Power-of-two extent the tile occupies in its backing store.
    pub const fn allocated_tile_size(&self, tile: TilePos) -> Extent2 {
        Extent2::new(self.x.tile_size(tile.x), self.y.tile_size(tile.y))
    }
}
