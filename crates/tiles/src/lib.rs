//! Image atlas: many logical images packed into a few layered textures.
//!
//! Every image is a chain of [`ImageMipElement`]s. An element is a grid of power-of-two color
//! tiles placed anywhere in the color backing, plus a pyramid of index tiles that maps the
//! element's logical texels to physical ones. Tile backing is allocated lazily, texel writes are
//! queued until [`ImageAtlas::flush`], and tiles may be shared between elements by reference
//! count.

mod backing;
mod config;
pub mod cpu;
mod error;
#[cfg(feature = "atlas-gpu")]
pub mod gpu;
mod image_atlas;
mod image_handle;
mod mip_element;
mod tile;
mod upload;

#[cfg(test)]
mod tests;

pub use backing::{
    BlitProcessing, BlitRegion, ColorBacking, DownsampleMode, IndexBacking, LayeredBacking,
};
pub use config::ImageAtlasConfig;
pub use error::{ImageAtlasError, TileAllocationFailure, TilePool};
pub use image_atlas::{AtlasStats, ImageAtlas, SharedTile, TileContents};
pub use image_handle::{Colorspace, Image, ImageId};
pub use mip_element::{ImageMipElement, MipElementId, TileCategory};
pub use tile::{ColorTile, ColorTileId, ColorTileKind, IndexTile, IndexTileId, TileBacking};

pub use atlas::AtlasTier;
pub use model::{
    Extent2, TILE_PADDING, TILE_SIZE, TILE_SIZE_WITHOUT_PADDING, TexelRect, TileCoordinate,
    TilePos,
};

/// One texel of the color backing.
pub type Rgba8 = [u8; 4];

/// One texel of the index backing: a physical texel position in the level below, plus the
/// [`TileCategory`] of the color tile it leads to (zero for upper index levels).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, bytemuck::Pod, bytemuck::Zeroable)]
pub struct IndexTexel {
    pub x: u32,
    pub y: u32,
    pub layer: u32,
    pub category: u32,
}

impl IndexTexel {
    pub const fn new(location: TileCoordinate, category: u32) -> Self {
        Self {
            x: location.x,
            y: location.y,
            layer: location.layer,
            category,
        }
    }

    pub const fn location(self) -> TileCoordinate {
        TileCoordinate::new(self.x, self.y, self.layer)
    }
}

/// Atlas backed by the in-memory reference backings.
pub type CpuImageAtlas = ImageAtlas<cpu::CpuColorBacking, cpu::CpuIndexBacking>;

#[cfg(feature = "atlas-gpu")]
pub type GpuImageAtlas = ImageAtlas<gpu::GpuColorBacking, gpu::GpuIndexBacking>;
