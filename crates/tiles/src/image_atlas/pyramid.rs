//! Index pyramid construction and lookup.
//!
//! Level one holds one entry per color tile plus one extra row and column. Entry `(i, j)` is the
//! physical texel of logical `(i * span, j * span)`, where `span` is the unpadded tile width, so
//! a lookup never has to special-case the last tile. Each level above holds the origins of the
//! index tiles of the level below, until a single root tile remains.

use log::{debug, trace, warn};
use model::{Extent2, TILE_SIZE, TileCoordinate, TilePos, ceil_log2};

use super::{ImageAtlas, allocate_with_growth};
use crate::backing::{ColorBacking, IndexBacking};
use crate::error::{ImageAtlasError, TileAllocationFailure, TilePool};
use crate::mip_element::{ImageMipElement, IndexLevel, MipElementId};
use crate::tile::{ColorTile, IndexTile, IndexTileId};
use crate::upload::Upload;
use crate::IndexTexel;

impl<C: ColorBacking, I: IndexBacking> ImageAtlas<C, I> {
    fn allocate_index_tile(
        &mut self,
        entries: Extent2,
    ) -> Result<IndexTileId, TileAllocationFailure> {
        let location = allocate_with_growth(
            &mut self.index_allocator,
            self.index_layer_limit,
            TilePool::Index,
            ceil_log2(entries.width),
            ceil_log2(entries.height),
        )?;
        Ok(self.index_tiles.insert(IndexTile::new(entries, location)))
    }

    fn allocate_index_level(
        &mut self,
        entries: Extent2,
    ) -> Result<IndexLevel, TileAllocationFailure> {
        let grid = TilePos::new(
            entries.width.div_ceil(TILE_SIZE),
            entries.height.div_ceil(TILE_SIZE),
        );
        let mut level = IndexLevel {
            entries,
            grid,
            tiles: Vec::with_capacity(grid.area()),
        };
        for y in 0..grid.y {
            for x in 0..grid.x {
                match self.allocate_index_tile(level.tile_entries(x, y)) {
                    Ok(id) => level.tiles.push(id),
                    Err(failure) => {
                        self.release_index_levels(vec![level]);
                        return Err(failure);
                    }
                }
            }
        }
        Ok(level)
    }

    fn upload_index_tile(&mut self, id: IndexTileId) {
        let Some(tile) = self.index_tiles.get(id) else {
            return;
        };
        trace!("queue index tile upload at {:?}", tile.location());
        self.uploads.push(Upload::IndexTexels {
            location: tile.location(),
            size: tile.size(),
            texels: tile.texels().to_vec(),
        });
    }

    /// Allocates every index tile of a multi-tile element and fills all levels above the first.
    /// Single-tile elements are indexed lazily by [`root_index_tile`](Self::root_index_tile).
    pub(super) fn build_index_pyramid(
        &mut self,
        mip: MipElementId,
    ) -> Result<(), TileAllocationFailure> {
        let Some(element) = self.mip_elements.get(mip) else {
            return Ok(());
        };
        let count = element.tile_count();
        if count == TilePos::new(1, 1) {
            return Ok(());
        }
        let mut entries = Extent2::new(count.x + 1, count.y + 1);
        let mut levels: Vec<IndexLevel> = Vec::new();
        loop {
            let level = match self.allocate_index_level(entries) {
                Ok(level) => level,
                Err(failure) => {
                    self.release_index_levels(levels);
                    return Err(failure);
                }
            };
            let grid = level.grid;
            levels.push(level);
            if grid == TilePos::new(1, 1) {
                break;
            }
            entries = Extent2::new(grid.x, grid.y);
        }

        for pair in levels.windows(2) {
            let (below, level) = (&pair[0], &pair[1]);
            for ty in 0..level.grid.y {
                for tx in 0..level.grid.x {
                    let Some(id) = level.tile_at(tx, ty) else {
                        continue;
                    };
                    let entries = level.tile_entries(tx, ty);
                    self.fill_upper_index_tile(id, tx, ty, entries, below);
                    self.upload_index_tile(id);
                }
            }
        }
        debug!(
            "index pyramid for {}x{} tiles: {} levels",
            count.x,
            count.y,
            levels.len()
        );
        if let Some(element) = self.mip_elements.get_mut(mip) {
            element.index_levels = levels;
        }
        Ok(())
    }

    fn fill_upper_index_tile(
        &mut self,
        id: IndexTileId,
        tx: u32,
        ty: u32,
        entries: Extent2,
        below: &IndexLevel,
    ) {
        let mut values = Vec::with_capacity(entries.texel_count());
        for ey in 0..entries.height {
            for ex in 0..entries.width {
                let child = below
                    .tile_at(tx * TILE_SIZE + ex, ty * TILE_SIZE + ey)
                    .and_then(|child| self.index_tiles.get(child))
                    .map(IndexTile::location);
                if let Some(location) = child {
                    values.push((ex, ey, IndexTexel::new(location, 0)));
                }
            }
        }
        if let Some(tile) = self.index_tiles.get_mut(id) {
            for (x, y, texel) in values {
                tile.set_entry(x, y, texel);
            }
        }
    }

    /// Writes the level one entries of an element from the current color tile locations.
    pub(super) fn write_color_index_entries(&mut self, mip: MipElementId) {
        let Some(element) = self.mip_elements.get(mip) else {
            return;
        };
        if element.uses_scratch_index {
            return;
        }
        let Some(level) = element.index_levels.first() else {
            return;
        };
        let count = element.tile_count();
        let span = element.entry_span();
        let padding = element.grid.padding();
        let mut updates = Vec::with_capacity(level.tiles.len());
        for ty in 0..level.grid.y {
            for tx in 0..level.grid.x {
                let Some(id) = level.tile_at(tx, ty) else {
                    continue;
                };
                let entries = level.tile_entries(tx, ty);
                let mut values = Vec::with_capacity(entries.texel_count());
                for ey in 0..entries.height {
                    for ex in 0..entries.width {
                        let (gx, gy) = (tx * TILE_SIZE + ex, ty * TILE_SIZE + ey);
                        let tile = TilePos::new(gx.min(count.x - 1), gy.min(count.y - 1));
                        let location = element
                            .tile_id(tile)
                            .and_then(|color| self.color_tiles.get(color))
                            .and_then(ColorTile::location);
                        let (Some(location), Some(category)) =
                            (location, element.tile_category(tile))
                        else {
                            continue;
                        };
                        let offset = location.offset(
                            (gx - tile.x) * span + padding,
                            (gy - tile.y) * span + padding,
                        );
                        values.push((ex, ey, IndexTexel::new(offset, category.index_code())));
                    }
                }
                updates.push((id, values));
            }
        }
        for (id, values) in updates {
            if let Some(tile) = self.index_tiles.get_mut(id) {
                for (x, y, texel) in values {
                    tile.set_entry(x, y, texel);
                }
            }
            self.upload_index_tile(id);
        }
    }

    /// Location of the element's root index tile. Single-tile elements get their index tile on
    /// the first call; if that allocation fails the scratch index tile is returned instead.
    pub fn root_index_tile(&mut self, mip: MipElementId) -> Result<TileCoordinate, ImageAtlasError> {
        let element = self
            .mip_elements
            .get(mip)
            .ok_or(ImageAtlasError::UnknownMipElement)?;
        if element.uses_scratch_index {
            return Ok(self.scratch_index_location);
        }
        if let Some(root) = element.root_index_tile() {
            return self
                .index_tiles
                .get(root)
                .map(IndexTile::location)
                .ok_or(ImageAtlasError::UnknownMipElement);
        }

        self.allocate_color_tile_backings(mip)?;
        if self
            .mip_elements
            .get(mip)
            .is_none_or(|element| element.uses_scratch_index)
        {
            return Ok(self.scratch_index_location);
        }
        let level = match self.allocate_index_level(Extent2::square(2)) {
            Ok(level) => level,
            Err(failure) => {
                warn!("{failure} ({}); single-tile element uses the scratch index", failure.source);
                return Ok(self.scratch_index_location);
            }
        };
        let root = level.tiles.first().copied();
        if let Some(element) = self.mip_elements.get_mut(mip) {
            element.index_levels.push(level);
        }
        self.write_color_index_entries(mip);
        debug!("created lazy index tile for single-tile mip element");
        root.and_then(|root| self.index_tiles.get(root))
            .map(IndexTile::location)
            .ok_or(ImageAtlasError::UnknownMipElement)
    }

    /// Walks the index pyramid the way a sampling shader does and returns the physical LOD 0
    /// texel holding logical texel `(x, y)`. `None` while the element has no index yet.
    pub fn resolve_texel(
        &self,
        mip: MipElementId,
        x: u32,
        y: u32,
    ) -> Result<Option<TileCoordinate>, ImageAtlasError> {
        let element = self
            .mip_elements
            .get(mip)
            .ok_or(ImageAtlasError::UnknownMipElement)?;
        let size = element.size();
        if x >= size.width || y >= size.height {
            return Err(ImageAtlasError::TileRangeOutOfBounds);
        }
        Ok(self.walk_index(element, x, y))
    }

    fn walk_index(&self, element: &ImageMipElement, x: u32, y: u32) -> Option<TileCoordinate> {
        let span = element.entry_span();
        if element.uses_scratch_index {
            let entry = self.index_tiles.get(self.scratch_index_tile)?.entry(0, 0)?;
            return Some(entry.location().offset(x % span, y % span));
        }
        let levels = &element.index_levels;
        let mut tile = self.index_tiles.get(element.root_index_tile()?)?;
        for level in (0..levels.len()).rev() {
            let entry_span = span * TILE_SIZE.pow(level as u32);
            let (gx, gy) = (x / entry_span, y / entry_span);
            let entry = tile.entry(gx % TILE_SIZE, gy % TILE_SIZE)?;
            if level == 0 {
                return Some(entry.location().offset(x - gx * span, y - gy * span));
            }
            // Entry `(gx, gy)` of this level is the origin of child tile `(gx, gy)`.
            tile = self.index_tiles.get(levels[level - 1].tile_at(gx, gy)?)?;
            debug_assert_eq!(tile.location(), entry.location());
        }
        None
    }
}
