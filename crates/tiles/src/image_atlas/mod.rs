//! Orchestration of tiles, mip elements and images.

mod pixels;
mod pyramid;

use atlas::{SlotTable, TileAllocError, TileAllocator};
use log::{debug, warn};
use model::{
    Extent2, LODS_PER_MIP_ELEMENT, MAX_MIP_LEVELS, TILE_SIZE, TileCoordinate, TileGrid, TilePos,
    TilingError, ceil_log2,
};
use slotmap::SlotMap;

use crate::backing::{ColorBacking, IndexBacking};
use crate::config::ImageAtlasConfig;
use crate::error::{ImageAtlasError, TileAllocationFailure, TilePool};
use crate::image_handle::{Colorspace, Image, ImageId};
use crate::mip_element::{ImageMipElement, IndexLevel, MipElementId, TileCategory};
use crate::tile::{ColorTile, ColorTileId, ColorTileKind, IndexTile, IndexTileId};
use crate::upload::{Upload, UploadQueue};
use crate::{IndexTexel, Rgba8};

/// A tile of a new element that aliases a tile of an existing element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SharedTile {
    pub position: TilePos,
    pub source: MipElementId,
    pub source_tile: TilePos,
}

/// Tiles of a new element that do not get fresh storage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TileContents {
    pub empty: Vec<TilePos>,
    pub white: Vec<TilePos>,
    pub shared: Vec<SharedTile>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AtlasStats {
    pub images: usize,
    pub mip_elements: usize,
    pub color_tiles: usize,
    pub backed_color_tiles: usize,
    pub index_tiles: usize,
    pub color_layers: u32,
    pub index_layers: u32,
    pub pending_uploads: usize,
}

pub struct ImageAtlas<C: ColorBacking, I: IndexBacking> {
    config: ImageAtlasConfig,
    color_backing: C,
    index_backing: I,
    color_allocator: TileAllocator,
    index_allocator: TileAllocator,
    color_layer_limit: u32,
    index_layer_limit: u32,

    color_tiles: SlotMap<ColorTileId, ColorTile>,
    index_tiles: SlotMap<IndexTileId, IndexTile>,
    mip_elements: SlotMap<MipElementId, ImageMipElement>,
    images: SlotTable<Image>,

    empty_tile: ColorTileId,
    white_tile: ColorTileId,
    failed_tile: ColorTileId,
    scratch_index_tile: IndexTileId,
    scratch_index_location: TileCoordinate,

    lock_count: u32,
    resources_unlock_count: u64,
    in_use_images: Vec<ImageId>,
    deferred_releases: Vec<ImageId>,

    uploads: UploadQueue<C::Source>,
    extra_color_layers: u32,
}

fn allocate_with_growth(
    allocator: &mut TileAllocator,
    layer_limit: u32,
    pool: TilePool,
    log2_width: u32,
    log2_height: u32,
) -> Result<TileCoordinate, TileAllocationFailure> {
    loop {
        match allocator.allocate_tile(log2_width, log2_height) {
            Ok(location) => return Ok(location),
            Err(TileAllocError::AtlasFull { .. }) if allocator.number_layers() < layer_limit => {
                let layers = allocator.number_layers() + 1;
                debug!("growing {pool} tile allocator to {layers} layers");
                allocator
                    .set_number_layers(layers)
                    .map_err(|source| TileAllocationFailure { pool, source })?;
            }
            Err(source) => return Err(TileAllocationFailure { pool, source }),
        }
    }
}

/// Backs one of the atlas-wide shared tiles and fills both of its LODs with `value`.
fn create_shared_tile<S>(
    allocator: &mut TileAllocator,
    layer_limit: u32,
    tiles: &mut SlotMap<ColorTileId, ColorTile>,
    uploads: &mut UploadQueue<S>,
    kind: ColorTileKind,
    value: Rgba8,
) -> Result<(ColorTileId, TileCoordinate), TileAllocationFailure> {
    let mut tile = ColorTile::reserved(Extent2::square(TILE_SIZE), kind);
    let (log2_width, log2_height) = tile.log2_size();
    let location =
        allocate_with_growth(allocator, layer_limit, TilePool::Color, log2_width, log2_height)?;
    tile.set_backing(location);
    for lod in 0..crate::backing::COLOR_BACKING_LODS {
        let size = Extent2::square(TILE_SIZE >> lod);
        uploads.push(Upload::ColorTexels {
            lod,
            location: location.at_lod(lod),
            size,
            texels: vec![value; size.texel_count()],
        });
    }
    Ok((tiles.insert(tile), location))
}

impl<C: ColorBacking, I: IndexBacking> ImageAtlas<C, I> {
    pub fn new(
        config: ImageAtlasConfig,
        mut color_backing: C,
        mut index_backing: I,
    ) -> Result<Self, ImageAtlasError> {
        for (backing, tier) in [
            (color_backing.width_height(), config.color_tier),
            (index_backing.width_height(), config.index_tier),
        ] {
            if backing != tier.edge_texels() {
                return Err(ImageAtlasError::BackingSizeMismatch {
                    backing,
                    tier: tier.edge_texels(),
                });
            }
        }
        let mut color_allocator = TileAllocator::new(config.color_tier, config.initial_color_layers)
            .map_err(|source| TileAllocationFailure {
                pool: TilePool::Color,
                source,
            })?;
        let mut index_allocator = TileAllocator::new(config.index_tier, config.initial_index_layers)
            .map_err(|source| TileAllocationFailure {
                pool: TilePool::Index,
                source,
            })?;
        color_backing.set_number_layers(color_allocator.number_layers());
        index_backing.set_number_layers(index_allocator.number_layers());
        let color_layer_limit = color_allocator
            .max_number_layers()
            .min(color_backing.max_number_layers());
        let index_layer_limit = index_allocator
            .max_number_layers()
            .min(index_backing.max_number_layers());

        let mut color_tiles = SlotMap::with_key();
        let mut uploads = UploadQueue::default();
        let mut shared = |kind, value| {
            create_shared_tile(
                &mut color_allocator,
                color_layer_limit,
                &mut color_tiles,
                &mut uploads,
                kind,
                value,
            )
        };
        let (empty_tile, empty_location) = shared(ColorTileKind::Empty, [0, 0, 0, 0])?;
        let (white_tile, _) = shared(ColorTileKind::White, [255, 255, 255, 255])?;
        let (failed_tile, failed_location) = shared(ColorTileKind::Failed, [255, 0, 255, 255])?;

        // Degraded elements resolve every texel through this tile to the placeholder.
        let scratch_entries = Extent2::square(2);
        let scratch_index_location = allocate_with_growth(
            &mut index_allocator,
            index_layer_limit,
            TilePool::Index,
            ceil_log2(scratch_entries.width),
            ceil_log2(scratch_entries.height),
        )?;
        let mut scratch = IndexTile::new(scratch_entries, scratch_index_location);
        let placeholder = if config.highlight_allocation_failures {
            failed_location
        } else {
            empty_location
        };
        for y in 0..scratch_entries.height {
            for x in 0..scratch_entries.width {
                scratch.set_entry(
                    x,
                    y,
                    IndexTexel::new(placeholder, TileCategory::Empty.index_code()),
                );
            }
        }
        uploads.push(Upload::IndexTexels {
            location: scratch_index_location,
            size: scratch.size(),
            texels: scratch.texels().to_vec(),
        });
        let mut index_tiles = SlotMap::with_key();
        let scratch_index_tile = index_tiles.insert(scratch);

        debug!(
            "image atlas created: color {:?} ({} layers), index {:?} ({} layers)",
            config.color_tier,
            color_allocator.number_layers(),
            config.index_tier,
            index_allocator.number_layers()
        );

        Ok(Self {
            config,
            color_backing,
            index_backing,
            color_allocator,
            index_allocator,
            color_layer_limit,
            index_layer_limit,
            color_tiles,
            index_tiles,
            mip_elements: SlotMap::with_key(),
            images: SlotTable::new(),
            empty_tile,
            white_tile,
            failed_tile,
            scratch_index_tile,
            scratch_index_location,
            lock_count: 0,
            resources_unlock_count: 0,
            in_use_images: Vec::new(),
            deferred_releases: Vec::new(),
            uploads,
            extra_color_layers: 0,
        })
    }

    pub fn config(&self) -> &ImageAtlasConfig {
        &self.config
    }

    pub fn color_backing(&self) -> &C {
        &self.color_backing
    }

    pub fn index_backing(&self) -> &I {
        &self.index_backing
    }

    pub fn color_allocator(&self) -> &TileAllocator {
        &self.color_allocator
    }

    pub fn index_allocator(&self) -> &TileAllocator {
        &self.index_allocator
    }

    pub fn empty_tile(&self) -> ColorTileId {
        self.empty_tile
    }

    pub fn white_tile(&self) -> ColorTileId {
        self.white_tile
    }

    pub fn failed_tile(&self) -> ColorTileId {
        self.failed_tile
    }

    pub fn scratch_index_tile(&self) -> IndexTileId {
        self.scratch_index_tile
    }

    /// Tile that replaces every tile of a degraded element.
    fn placeholder_tile(&self) -> ColorTileId {
        if self.config.highlight_allocation_failures {
            self.failed_tile
        } else {
            self.empty_tile
        }
    }

    pub fn color_tile(&self, id: ColorTileId) -> Option<&ColorTile> {
        self.color_tiles.get(id)
    }

    pub fn index_tile(&self, id: IndexTileId) -> Option<&IndexTile> {
        self.index_tiles.get(id)
    }

    pub fn mip_element(&self, id: MipElementId) -> Option<&ImageMipElement> {
        self.mip_elements.get(id)
    }

    /// Physical location of a tile of an element, once it is backed.
    pub fn tile_location(&self, mip: MipElementId, tile: TilePos) -> Option<TileCoordinate> {
        let id = self.mip_elements.get(mip)?.tile_id(tile)?;
        self.color_tiles.get(id)?.location()
    }

    /// Returns the image only while `id` still names it.
    pub fn fetch_image(&self, id: ImageId) -> Option<&Image> {
        self.images.get(id.0)
    }

    pub fn fetch_image_mut(&mut self, id: ImageId) -> Option<&mut Image> {
        self.images.get_mut(id.0)
    }

    pub fn stats(&self) -> AtlasStats {
        AtlasStats {
            images: self.images.len(),
            mip_elements: self.mip_elements.len(),
            color_tiles: self.color_tiles.len(),
            backed_color_tiles: self.color_allocator.allocated_tile_count(),
            index_tiles: self.index_tiles.len(),
            color_layers: self.color_backing.number_layers(),
            index_layers: self.index_backing.number_layers(),
            pending_uploads: self.uploads.len(),
        }
    }

    fn acquire_color_tile(&mut self, id: ColorTileId) {
        if let Some(tile) = self.color_tiles.get_mut(id) {
            tile.acquire();
        }
    }

    fn release_color_tile(&mut self, id: ColorTileId) {
        let Some(tile) = self.color_tiles.get_mut(id) else {
            return;
        };
        if !tile.release() {
            return;
        }
        let Some(tile) = self.color_tiles.remove(id) else {
            return;
        };
        let (log2_width, log2_height) = tile.log2_size();
        if let Some(location) = tile.location()
            && let Err(error) = self
                .color_allocator
                .release_tile(location, log2_width, log2_height)
        {
            log::error!("color tile release failed: {error}");
        }
    }

    fn release_index_tile(&mut self, id: IndexTileId) {
        debug_assert_ne!(id, self.scratch_index_tile);
        let Some(tile) = self.index_tiles.remove(id) else {
            return;
        };
        let (log2_width, log2_height) = tile.log2_size();
        if let Err(error) = self
            .index_allocator
            .release_tile(tile.location(), log2_width, log2_height)
        {
            log::error!("index tile release failed: {error}");
        }
    }

    fn release_index_levels(&mut self, levels: Vec<IndexLevel>) {
        for id in levels.into_iter().flat_map(|level| level.tiles) {
            self.release_index_tile(id);
        }
    }

    /// Creates an element of `size` whose tiles come from `contents` or get fresh, not yet
    /// backed storage. The caller owns one reference to the returned element.
    ///
    /// Exhausting the index allocator does not fail the call; the element is degraded instead.
    pub fn create_mip_element(
        &mut self,
        size: Extent2,
        contents: &TileContents,
    ) -> Result<MipElementId, ImageAtlasError> {
        let grid = TileGrid::new(size)?;
        let mut assigned: Vec<Option<(ColorTileId, TileCategory)>> =
            vec![None; grid.number_tiles()];
        let mut assign = |tile: TilePos,
                          value: (ColorTileId, TileCategory)|
         -> Result<(), ImageAtlasError> {
            let index = grid
                .tile_index(tile)
                .map_err(|_| ImageAtlasError::TileRangeOutOfBounds)?;
            if assigned[index].replace(value).is_some() {
                return Err(ImageAtlasError::DuplicateTile(tile));
            }
            Ok(())
        };
        for &tile in &contents.empty {
            assign(tile, (self.empty_tile, TileCategory::Empty))?;
        }
        for &tile in &contents.white {
            assign(tile, (self.white_tile, TileCategory::White))?;
        }
        for shared in &contents.shared {
            let source = self
                .mip_elements
                .get(shared.source)
                .ok_or(ImageAtlasError::UnknownMipElement)?;
            let (Some(id), Some(category)) = (
                source.tile_id(shared.source_tile),
                source.tile_category(shared.source_tile),
            ) else {
                return Err(ImageAtlasError::TileRangeOutOfBounds);
            };
            grid.tile_index(shared.position)
                .map_err(|_| ImageAtlasError::TileRangeOutOfBounds)?;
            let source_size = self.color_tiles.get(id).map(ColorTile::size);
            if category == TileCategory::Color
                && source_size != Some(grid.allocated_tile_size(shared.position))
            {
                return Err(ImageAtlasError::SharedTileSizeMismatch(shared.position));
            }
            assign(shared.position, (id, category))?;
        }

        let mut tiles = Vec::with_capacity(assigned.len());
        let mut categories = Vec::with_capacity(assigned.len());
        for (tile, slot) in grid.iter_tiles().zip(assigned) {
            match slot {
                Some((id, category)) => {
                    self.acquire_color_tile(id);
                    tiles.push(id);
                    categories.push(category);
                }
                None => {
                    let fresh = ColorTile::reserved(
                        grid.allocated_tile_size(tile),
                        ColorTileKind::Data,
                    );
                    tiles.push(self.color_tiles.insert(fresh));
                    categories.push(TileCategory::Color);
                }
            }
        }
        let id = self.mip_elements.insert(ImageMipElement {
            grid,
            tiles,
            categories,
            index_levels: Vec::new(),
            uses_scratch_index: false,
            backings_allocated: false,
            tile_allocation_failed: false,
            ref_count: 1,
        });
        if let Err(failure) = self.build_index_pyramid(id) {
            self.on_tile_allocation_failed(id, failure);
        }
        Ok(id)
    }

    /// Creates an element over the tiles `min..max` of `source`, sharing them by reference.
    pub fn create_sub_mip_element(
        &mut self,
        source: MipElementId,
        min: TilePos,
        max: TilePos,
    ) -> Result<MipElementId, ImageAtlasError> {
        let element = self
            .mip_elements
            .get(source)
            .ok_or(ImageAtlasError::UnknownMipElement)?;
        let grid = element
            .grid
            .sub_grid(min, max)
            .map_err(|_| ImageAtlasError::TileRangeOutOfBounds)?;
        let mut tiles = Vec::with_capacity(grid.number_tiles());
        let mut categories = Vec::with_capacity(grid.number_tiles());
        for tile in grid.iter_tiles() {
            let source_tile = TilePos::new(min.x + tile.x, min.y + tile.y);
            let (Some(id), Some(category)) = (
                element.tile_id(source_tile),
                element.tile_category(source_tile),
            ) else {
                return Err(ImageAtlasError::TileRangeOutOfBounds);
            };
            tiles.push(id);
            categories.push(category);
        }
        let tile_allocation_failed = element.tile_allocation_failed;
        for &id in &tiles {
            self.acquire_color_tile(id);
        }
        let id = self.mip_elements.insert(ImageMipElement {
            grid,
            tiles,
            categories,
            index_levels: Vec::new(),
            uses_scratch_index: false,
            backings_allocated: false,
            tile_allocation_failed,
            ref_count: 1,
        });
        if let Err(failure) = self.build_index_pyramid(id) {
            self.on_tile_allocation_failed(id, failure);
        }
        Ok(id)
    }

    pub fn acquire_mip_element(&mut self, id: MipElementId) -> Result<(), ImageAtlasError> {
        let element = self
            .mip_elements
            .get_mut(id)
            .ok_or(ImageAtlasError::UnknownMipElement)?;
        element.ref_count += 1;
        Ok(())
    }

    /// Drops one reference; the last one returns the element's tiles.
    pub fn release_mip_element(&mut self, id: MipElementId) -> Result<(), ImageAtlasError> {
        let element = self
            .mip_elements
            .get_mut(id)
            .ok_or(ImageAtlasError::UnknownMipElement)?;
        element.ref_count -= 1;
        if element.ref_count > 0 {
            return Ok(());
        }
        if let Some(element) = self.mip_elements.remove(id) {
            for tile in element.tiles {
                self.release_color_tile(tile);
            }
            self.release_index_levels(element.index_levels);
        }
        Ok(())
    }

    /// Backs every reserved color tile of the element. Idempotent.
    ///
    /// If the color allocator runs dry the element is degraded and the call still succeeds.
    pub fn allocate_color_tile_backings(&mut self, mip: MipElementId) -> Result<(), ImageAtlasError> {
        if !self.mip_elements.contains_key(mip) {
            return Err(ImageAtlasError::UnknownMipElement);
        }
        if let Err(failure) = self.back_color_tiles(mip) {
            self.on_tile_allocation_failed(mip, failure);
        }
        Ok(())
    }

    fn back_color_tiles(&mut self, mip: MipElementId) -> Result<(), TileAllocationFailure> {
        let Some(element) = self.mip_elements.get(mip) else {
            return Ok(());
        };
        if element.backings_allocated {
            return Ok(());
        }
        let tiles = element.tiles.clone();
        for id in tiles {
            let Some(tile) = self.color_tiles.get(id) else {
                continue;
            };
            if tile.location().is_some() {
                continue;
            }
            let (log2_width, log2_height) = tile.log2_size();
            let location = allocate_with_growth(
                &mut self.color_allocator,
                self.color_layer_limit,
                TilePool::Color,
                log2_width,
                log2_height,
            )?;
            if let Some(tile) = self.color_tiles.get_mut(id) {
                tile.set_backing(location);
            }
        }
        if let Some(element) = self.mip_elements.get_mut(mip) {
            element.backings_allocated = true;
        }
        self.write_color_index_entries(mip);
        Ok(())
    }

    /// Replaces every tile of the element with the placeholder tile and its index pyramid with
    /// the scratch index tile, so the element draws nothing instead of failing.
    fn on_tile_allocation_failed(&mut self, mip: MipElementId, failure: TileAllocationFailure) {
        let placeholder = self.placeholder_tile();
        let Some(element) = self.mip_elements.get_mut(mip) else {
            return;
        };
        let tile_count = element.tiles.len();
        warn!(
            "{failure} ({}); degrading {}x{} mip element",
            failure.source,
            element.grid.size().width,
            element.grid.size().height
        );
        let old_tiles = std::mem::replace(&mut element.tiles, vec![placeholder; tile_count]);
        let old_levels = std::mem::take(&mut element.index_levels);
        element.categories = vec![TileCategory::Empty; tile_count];
        element.uses_scratch_index = true;
        element.backings_allocated = true;
        element.tile_allocation_failed = true;
        for _ in 0..tile_count {
            self.acquire_color_tile(placeholder);
        }
        for id in old_tiles {
            self.release_color_tile(id);
        }
        self.release_index_levels(old_levels);
    }

    fn validate_mip_chain(&self, mip_chain: &[MipElementId]) -> Result<(), ImageAtlasError> {
        if mip_chain.is_empty() {
            return Err(ImageAtlasError::InvalidMipChain);
        }
        if mip_chain.len() > (MAX_MIP_LEVELS / LODS_PER_MIP_ELEMENT) as usize {
            return Err(ImageAtlasError::MipChainTooLong(mip_chain.len()));
        }
        let mut expected: Option<Extent2> = None;
        for &id in mip_chain {
            let element = self
                .mip_elements
                .get(id)
                .ok_or(ImageAtlasError::UnknownMipElement)?;
            if expected.is_some_and(|size| size != element.size()) {
                return Err(ImageAtlasError::InvalidMipChain);
            }
            expected = Some(element.size().at_lod(LODS_PER_MIP_ELEMENT));
        }
        Ok(())
    }

    fn insert_image(
        &mut self,
        mip_chain: Vec<MipElementId>,
        colorspace: Colorspace,
        offscreen_render_index: Option<u32>,
    ) -> Result<ImageId, ImageAtlasError> {
        self.validate_mip_chain(&mip_chain)?;
        let key = self.images.insert_with(|key| Image {
            id: ImageId(key),
            mip_chain: mip_chain.clone(),
            colorspace,
            opaque: false,
            default_use_prepadding: false,
            in_use_marker: 0,
            offscreen_render_index,
        });
        if offscreen_render_index.is_none() {
            for mip in mip_chain {
                self.allocate_color_tile_backings(mip)?;
            }
        }
        Ok(ImageId(key))
    }

    /// Wraps a mip chain into an image and backs all of its color tiles. The image takes over the
    /// caller's reference to every element; on error the references stay with the caller.
    pub fn create_image(
        &mut self,
        mip_chain: Vec<MipElementId>,
        colorspace: Colorspace,
    ) -> Result<ImageId, ImageAtlasError> {
        self.insert_image(mip_chain, colorspace, None)
    }

    /// Like [`create_image`](Self::create_image) for images the renderer draws into. Backing is
    /// deferred until [`mark_rendered_image_ready`](Self::mark_rendered_image_ready).
    pub fn create_rendered_image(
        &mut self,
        mip_chain: Vec<MipElementId>,
        colorspace: Colorspace,
        render_index: u32,
    ) -> Result<ImageId, ImageAtlasError> {
        self.insert_image(mip_chain, colorspace, Some(render_index))
    }

    /// Creates an image with a full mip chain down to a single texel.
    pub fn create_image_of_size(
        &mut self,
        size: Extent2,
        colorspace: Colorspace,
    ) -> Result<ImageId, ImageAtlasError> {
        if size.is_empty() {
            return Err(TilingError::ZeroSize.into());
        }
        let levels = (1 + ceil_log2(size.width.max(size.height))).min(MAX_MIP_LEVELS);
        let mut mip_chain = Vec::new();
        for element in 0..levels.div_ceil(LODS_PER_MIP_ELEMENT) {
            let element_size = size.at_lod(element * LODS_PER_MIP_ELEMENT);
            match self.create_mip_element(element_size, &TileContents::default()) {
                Ok(id) => mip_chain.push(id),
                Err(error) => {
                    self.release_mip_chain(&mip_chain);
                    return Err(error);
                }
            }
        }
        match self.create_image(mip_chain.clone(), colorspace) {
            Ok(id) => Ok(id),
            Err(error) => {
                self.release_mip_chain(&mip_chain);
                Err(error)
            }
        }
    }

    fn release_mip_chain(&mut self, mip_chain: &[MipElementId]) {
        for &id in mip_chain {
            if let Err(error) = self.release_mip_element(id) {
                log::error!("mip chain release failed: {error}");
            }
        }
    }

    /// Ends the renderer's exclusive ownership of a rendered image and backs its tiles.
    pub fn mark_rendered_image_ready(&mut self, id: ImageId) -> Result<(), ImageAtlasError> {
        let image = self
            .images
            .get_mut(id.0)
            .ok_or(ImageAtlasError::UnknownImage(id))?;
        image.offscreen_render_index = None;
        let mip_chain = image.mip_chain.clone();
        for mip in mip_chain {
            self.allocate_color_tile_backings(mip)?;
        }
        Ok(())
    }

    /// Whether any element of the image was degraded by a failed tile allocation.
    pub fn image_tile_allocation_failed(&self, id: ImageId) -> Option<bool> {
        let image = self.images.get(id.0)?;
        Some(image.mip_chain.iter().any(|&mip| {
            self.mip_elements
                .get(mip)
                .is_some_and(ImageMipElement::tile_allocation_failed)
        }))
    }

    /// Releases the image, or postpones the release to the end of the current lock epoch if the
    /// image was marked in use during it.
    pub fn release_image(&mut self, id: ImageId) -> Result<(), ImageAtlasError> {
        let image = self
            .images
            .get(id.0)
            .ok_or(ImageAtlasError::UnknownImage(id))?;
        if self.lock_count > 0 && image.in_use_at(self.resources_unlock_count) {
            if !self.deferred_releases.contains(&id) {
                debug!("deferring release of in-use image {id:?}");
                self.deferred_releases.push(id);
            }
            return Ok(());
        }
        self.destroy_image(id);
        Ok(())
    }

    fn destroy_image(&mut self, id: ImageId) {
        let Ok(image) = self.images.remove(id.0) else {
            return;
        };
        self.release_mip_chain(&image.mip_chain);
    }

    pub fn lock_resources(&mut self) {
        self.lock_count += 1;
    }

    /// Leaving the outermost lock ends the epoch: every in-use mark expires and deferred releases
    /// run.
    pub fn unlock_resources(&mut self) {
        debug_assert!(self.lock_count > 0, "unlock_resources without a matching lock");
        if self.lock_count == 0 {
            warn!("unlock_resources called without a matching lock");
            return;
        }
        self.lock_count -= 1;
        if self.lock_count > 0 {
            return;
        }
        self.resources_unlock_count += 1;
        self.in_use_images.clear();
        for id in std::mem::take(&mut self.deferred_releases) {
            self.destroy_image(id);
        }
    }

    /// Runs `scope` between a lock and its matching unlock.
    pub fn with_locked_resources<R>(&mut self, scope: impl FnOnce(&mut Self) -> R) -> R {
        self.lock_resources();
        let result = scope(self);
        self.unlock_resources();
        result
    }

    pub fn is_locked(&self) -> bool {
        self.lock_count > 0
    }

    pub fn resources_unlock_count(&self) -> u64 {
        self.resources_unlock_count
    }

    /// Images marked in use during the current epoch, rendered images excluded.
    pub fn images_in_use(&self) -> &[ImageId] {
        &self.in_use_images
    }

    /// Marks the image as used by the current lock epoch. Returns `false` for stale handles.
    pub fn mark_in_use(&mut self, id: ImageId) -> bool {
        debug_assert!(self.lock_count > 0, "mark_in_use outside a locked region");
        let unlock_count = self.resources_unlock_count;
        let Some(image) = self.images.get_mut(id.0) else {
            return false;
        };
        if !image.in_use_at(unlock_count) {
            image.in_use_marker = unlock_count + 1;
            if image.offscreen_render_index.is_none() {
                self.in_use_images.push(id);
            }
        }
        true
    }

    pub fn in_use(&self, id: ImageId) -> bool {
        self.images
            .get(id.0)
            .is_some_and(|image| image.in_use_at(self.resources_unlock_count))
    }

    /// Reserves room for `texels` more color texels, applied as extra layers on the next flush.
    pub fn extra_color_backing_texels(&mut self, texels: u64) {
        let per_layer = self.config.color_tier.layout().texels_per_layer();
        let layers = u32::try_from(texels.div_ceil(per_layer)).unwrap_or(u32::MAX);
        self.extra_color_layers = self.extra_color_layers.max(layers);
    }

    /// Grows the backings to the allocators' high-water marks, replays every queued upload in
    /// submission order and flushes both backings.
    pub fn flush(&mut self) {
        let (_, used_color_layers) = self.color_allocator.required_backing_size();
        let color_layers = used_color_layers
            .saturating_add(std::mem::take(&mut self.extra_color_layers))
            .min(self.color_backing.max_number_layers());
        if color_layers > self.color_backing.number_layers() {
            debug!("growing color backing to {color_layers} layers");
            self.color_backing.set_number_layers(color_layers);
        }
        let (_, index_layers) = self.index_allocator.required_backing_size();
        if index_layers > self.index_backing.number_layers() {
            debug!("growing index backing to {index_layers} layers");
            self.index_backing.set_number_layers(index_layers);
        }

        let pending = self.uploads.len();
        self.uploads
            .replay(&mut self.color_backing, &mut self.index_backing);
        self.color_backing.flush();
        self.index_backing.flush();
        debug!("flushed {pending} uploads: {:?}", self.stats());
    }
}

impl crate::CpuImageAtlas {
    /// Atlas over in-memory backings sized from `config`.
    pub fn new_cpu(config: ImageAtlasConfig) -> Result<Self, ImageAtlasError> {
        let color = crate::cpu::CpuColorBacking::new(
            config.color_tier.edge_texels(),
            config.color_tier.max_layers(),
            config.initial_color_layers,
        );
        let index = crate::cpu::CpuIndexBacking::new(
            config.index_tier.edge_texels(),
            config.index_tier.max_layers(),
            config.initial_index_layers,
        );
        Self::new(config, color, index)
    }
}
