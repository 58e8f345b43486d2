use model::{Extent2, TILE_SIZE, TILE_SIZE_WITHOUT_PADDING, TileGrid, TilePos};
use slotmap::new_key_type;

use crate::tile::{ColorTileId, IndexTileId};

new_key_type! {
    pub struct MipElementId;
}

/// Partition of an element's tiles. Shared tiles taken from another element count as `Color`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TileCategory {
    Color,
    Empty,
    White,
}

impl TileCategory {
    /// Value stored in the `category` lane of level one index texels.
    pub const fn index_code(self) -> u32 {
        match self {
            TileCategory::Color => 0,
            TileCategory::Empty => 1,
            TileCategory::White => 2,
        }
    }
}

/// One level of an index pyramid: a grid of index tiles covering `entries` index texels.
#[derive(Debug, Clone)]
pub(crate) struct IndexLevel {
    pub(crate) entries: Extent2,
    pub(crate) grid: TilePos,
    pub(crate) tiles: Vec<IndexTileId>,
}

impl IndexLevel {
    /// Index texels held by tile `(x, y)` of this level. Only the last row and column are partial.
    pub(crate) fn tile_entries(&self, x: u32, y: u32) -> Extent2 {
        Extent2::new(
            self.entries.width.saturating_sub(x * TILE_SIZE).min(TILE_SIZE),
            self.entries.height.saturating_sub(y * TILE_SIZE).min(TILE_SIZE),
        )
    }

    pub(crate) fn tile_at(&self, x: u32, y: u32) -> Option<IndexTileId> {
        if x >= self.grid.x || y >= self.grid.y {
            return None;
        }
        self.tiles
            .get(y as usize * self.grid.x as usize + x as usize)
            .copied()
    }
}

/// Tiling and index pyramid of two consecutive mip levels of an image.
#[derive(Debug)]
pub struct ImageMipElement {
    pub(crate) grid: TileGrid,
    pub(crate) tiles: Vec<ColorTileId>,
    pub(crate) categories: Vec<TileCategory>,
    pub(crate) index_levels: Vec<IndexLevel>,
    pub(crate) uses_scratch_index: bool,
    pub(crate) backings_allocated: bool,
    pub(crate) tile_allocation_failed: bool,
    pub(crate) ref_count: u32,
}

impl ImageMipElement {
    /// Logical size at the finer of the two LODs.
    pub fn size(&self) -> Extent2 {
        self.grid.size()
    }

    pub fn grid(&self) -> &TileGrid {
        &self.grid
    }

    pub fn is_padded(&self) -> bool {
        self.grid.is_padded()
    }

    pub fn tile_count(&self) -> TilePos {
        self.grid.tile_count()
    }

    pub fn remainder_size(&self) -> Extent2 {
        self.grid.remainder_size()
    }

    pub fn remainder_size_exact(&self) -> Extent2 {
        self.grid.remainder_size_exact()
    }

    /// Texel extent of a tile, or `None` for positions outside the grid.
    pub fn tile_size(&self, tile: TilePos, include_padding: bool) -> Option<Extent2> {
        self.grid.tile_index(tile).ok()?;
        Some(self.grid.tile_size(tile, include_padding))
    }

    pub fn tile_category(&self, tile: TilePos) -> Option<TileCategory> {
        let index = self.grid.tile_index(tile).ok()?;
        self.categories.get(index).copied()
    }

    pub fn tile_id(&self, tile: TilePos) -> Option<ColorTileId> {
        let index = self.grid.tile_index(tile).ok()?;
        self.tiles.get(index).copied()
    }

    fn tiles_in(&self, category: TileCategory) -> impl Iterator<Item = TilePos> + '_ {
        self.grid
            .iter_tiles()
            .zip(self.categories.iter())
            .filter_map(move |(tile, current)| (*current == category).then_some(tile))
    }

    pub fn empty_tiles(&self) -> impl Iterator<Item = TilePos> + '_ {
        self.tiles_in(TileCategory::Empty)
    }

    pub fn white_tiles(&self) -> impl Iterator<Item = TilePos> + '_ {
        self.tiles_in(TileCategory::White)
    }

    pub fn color_tiles(&self) -> impl Iterator<Item = TilePos> + '_ {
        self.tiles_in(TileCategory::Color)
    }

    /// LODs this element holds: two, or one when the finer LOD is already a single texel.
    pub fn number_mipmap_levels(&self) -> u32 {
        if self.size() == Extent2::square(1) { 1 } else { 2 }
    }

    pub fn number_index_levels(&self) -> u32 {
        if self.uses_scratch_index {
            1
        } else {
            self.index_levels.len() as u32
        }
    }

    /// Logical texels covered by one level one index texel.
    pub(crate) fn entry_span(&self) -> u32 {
        if self.grid.is_padded() {
            TILE_SIZE_WITHOUT_PADDING
        } else {
            TILE_SIZE
        }
    }

    /// Logical texels covered by one texel of the root index tile.
    pub fn ratio(&self) -> u32 {
        match self.number_index_levels() {
            0 => TILE_SIZE,
            levels => self.entry_span() * TILE_SIZE.pow(levels - 1),
        }
    }

    pub fn tile_allocation_failed(&self) -> bool {
        self.tile_allocation_failed
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }

    pub(crate) fn root_index_tile(&self) -> Option<IndexTileId> {
        self.index_levels.last()?.tiles.first().copied()
    }
}
