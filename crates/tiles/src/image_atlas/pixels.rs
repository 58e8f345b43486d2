//! Queued texel writes into the tiles of a mip element.

use log::{trace, warn};
use model::{Extent2, LODS_PER_MIP_ELEMENT, TexelRect, TileCoordinate, TilePos};

use super::ImageAtlas;
use crate::backing::{BlitProcessing, BlitRegion, ColorBacking, DownsampleMode, IndexBacking};
use crate::error::ImageAtlasError;
use crate::image_handle::ImageId;
use crate::mip_element::{MipElementId, TileCategory};
use crate::tile::ColorTile;
use crate::upload::Upload;
use crate::Rgba8;

/// Part of a write that lands in one tile.
#[derive(Debug, Clone, Copy)]
struct TileTarget {
    /// Destination in the addressed LOD of the color backing.
    location: TileCoordinate,
    size: Extent2,
    /// Offset of this part from the origin of the written rectangle.
    offset: [u32; 2],
}

impl<C: ColorBacking, I: IndexBacking> ImageAtlas<C, I> {
    /// Splits `rect` at `lod` of the element into per-tile writes, padding included. Tiles without
    /// data of their own are skipped. `None` means the write is dropped.
    fn tile_targets(
        &mut self,
        mip: MipElementId,
        lod: u32,
        rect: TexelRect,
    ) -> Result<Option<Vec<TileTarget>>, ImageAtlasError> {
        let element = self
            .mip_elements
            .get(mip)
            .ok_or(ImageAtlasError::UnknownMipElement)?;
        let levels = element.number_mipmap_levels();
        debug_assert!(lod < levels, "write to LOD {lod} of a {levels}-level mip element");
        if lod >= levels {
            warn!("dropping write to LOD {lod} of a {levels}-level mip element");
            return Ok(None);
        }
        let level_size = element.size().at_lod(lod);
        if !TexelRect::from_extent(level_size).contains_rect(rect) {
            return Err(ImageAtlasError::TileRangeOutOfBounds);
        }
        if rect.is_empty() {
            return Ok(Some(Vec::new()));
        }

        self.allocate_color_tile_backings(mip)?;
        let element = self
            .mip_elements
            .get(mip)
            .ok_or(ImageAtlasError::UnknownMipElement)?;
        let grid = element.grid;
        let mut targets = Vec::new();
        for (ty, y0, y1) in grid.y().tiles_touching(rect.y, rect.bottom(), lod) {
            let span_y = grid.y().tile_span(ty, lod);
            for (tx, x0, x1) in grid.x().tiles_touching(rect.x, rect.right(), lod) {
                let tile = TilePos::new(tx, ty);
                if element.tile_category(tile) != Some(TileCategory::Color) {
                    trace!("skipping write to shared tile ({tx}, {ty})");
                    continue;
                }
                let Some(location) = element
                    .tile_id(tile)
                    .and_then(|id| self.color_tiles.get(id))
                    .and_then(ColorTile::location)
                else {
                    continue;
                };
                let span_x = grid.x().tile_span(tx, lod);
                targets.push(TileTarget {
                    location: location.at_lod(lod).offset(
                        (i64::from(x0) - span_x.start) as u32,
                        (i64::from(y0) - span_y.start) as u32,
                    ),
                    size: Extent2::new(x1 - x0, y1 - y0),
                    offset: [x0 - rect.x, y0 - rect.y],
                });
            }
        }
        trace!("write of {rect:?} at LOD {lod} touches {} tiles", targets.len());
        Ok(Some(targets))
    }

    /// Queues `texels` (row-major, `rect.width` per row) for `rect` at `lod` of the element,
    /// where `lod` is 0 or 1.
    pub fn set_element_pixels(
        &mut self,
        mip: MipElementId,
        lod: u32,
        rect: TexelRect,
        texels: &[Rgba8],
    ) -> Result<(), ImageAtlasError> {
        let expected = rect.size().texel_count();
        if texels.len() != expected {
            return Err(ImageAtlasError::TexelCountMismatch {
                expected,
                actual: texels.len(),
            });
        }
        let Some(targets) = self.tile_targets(mip, lod, rect)? else {
            return Ok(());
        };
        let row_pitch = rect.width as usize;
        for target in targets {
            let mut part = Vec::with_capacity(target.size.texel_count());
            for row in 0..target.size.height {
                let start = (target.offset[1] + row) as usize * row_pitch + target.offset[0] as usize;
                part.extend_from_slice(&texels[start..start + target.size.width as usize]);
            }
            self.uploads.push(Upload::ColorTexels {
                lod,
                location: target.location,
                size: target.size,
                texels: part,
            });
        }
        Ok(())
    }

    /// Queues a copy from `source` into `rect` at `lod` of the element.
    pub fn copy_element_pixels(
        &mut self,
        mip: MipElementId,
        lod: u32,
        rect: TexelRect,
        source: &C::Source,
        region: BlitRegion,
        processing: BlitProcessing,
    ) -> Result<(), ImageAtlasError> {
        let Some(targets) = self.tile_targets(mip, lod, rect)? else {
            return Ok(());
        };
        for target in targets {
            self.uploads.push(Upload::ColorCopy {
                lod,
                location: target.location,
                size: target.size,
                source: source.clone(),
                region: region.shifted(target.offset, 1),
                processing,
            });
        }
        Ok(())
    }

    /// Queues a 2:1 downsample of `source` into `rect` at `lod` of the element.
    pub fn downsample_element_pixels(
        &mut self,
        mip: MipElementId,
        lod: u32,
        rect: TexelRect,
        source: &C::Source,
        region: BlitRegion,
        mode: DownsampleMode,
    ) -> Result<(), ImageAtlasError> {
        let Some(targets) = self.tile_targets(mip, lod, rect)? else {
            return Ok(());
        };
        for target in targets {
            self.uploads.push(Upload::ColorDownsample {
                lod,
                location: target.location,
                size: target.size,
                source: source.clone(),
                region: region.shifted(target.offset, 2),
                mode,
            });
        }
        Ok(())
    }

    /// Element and element-relative LOD holding `lod` of the image.
    fn element_for_lod(
        &self,
        image: ImageId,
        lod: u32,
    ) -> Result<Option<(MipElementId, u32)>, ImageAtlasError> {
        let image_ref = self
            .images
            .get(image.0)
            .ok_or(ImageAtlasError::UnknownImage(image))?;
        let chain_index = (lod / LODS_PER_MIP_ELEMENT) as usize;
        let chain_len = image_ref.mip_chain.len();
        debug_assert!(chain_index < chain_len, "LOD {lod} beyond the image's mip chain");
        let Some(&mip) = image_ref.mip_chain.get(chain_index) else {
            warn!("dropping write to LOD {lod} of an image with {chain_len} mip elements");
            return Ok(None);
        };
        Ok(Some((mip, lod % LODS_PER_MIP_ELEMENT)))
    }

    pub fn set_pixels(
        &mut self,
        image: ImageId,
        lod: u32,
        rect: TexelRect,
        texels: &[Rgba8],
    ) -> Result<(), ImageAtlasError> {
        match self.element_for_lod(image, lod)? {
            Some((mip, lod)) => self.set_element_pixels(mip, lod, rect, texels),
            None => Ok(()),
        }
    }

    pub fn copy_pixels(
        &mut self,
        image: ImageId,
        lod: u32,
        rect: TexelRect,
        source: &C::Source,
        region: BlitRegion,
        processing: BlitProcessing,
    ) -> Result<(), ImageAtlasError> {
        match self.element_for_lod(image, lod)? {
            Some((mip, lod)) => {
                self.copy_element_pixels(mip, lod, rect, source, region, processing)
            }
            None => Ok(()),
        }
    }

    pub fn downsample_pixels(
        &mut self,
        image: ImageId,
        lod: u32,
        rect: TexelRect,
        source: &C::Source,
        region: BlitRegion,
        mode: DownsampleMode,
    ) -> Result<(), ImageAtlasError> {
        match self.element_for_lod(image, lod)? {
            Some((mip, lod)) => self.downsample_element_pixels(mip, lod, rect, source, region, mode),
            None => Ok(()),
        }
    }
}
