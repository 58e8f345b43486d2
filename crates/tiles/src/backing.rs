//! Interfaces of the layered texture stores that hold color and index texels.
//!
//! Locations passed to a backing are texel positions inside the addressed mip level of the
//! store, so a tile at LOD 0 location `(x, y)` is written at `(x >> 1, y >> 1)` for LOD 1.

use model::{Extent2, TexelRect, TileCoordinate};

use crate::{IndexTexel, Rgba8};

/// Number of mip levels a color backing keeps for every layer.
pub const COLOR_BACKING_LODS: u32 = 2;

pub trait LayeredBacking {
    /// Width and height of one layer at LOD 0.
    fn width_height(&self) -> u32;

    fn number_layers(&self) -> u32;

    /// Grows the backing to `layers`, clamped to [`max_number_layers`](Self::max_number_layers).
    /// Existing layer contents are preserved; shrinking is ignored.
    fn set_number_layers(&mut self, layers: u32);

    fn max_number_layers(&self) -> u32;

    /// Makes every write issued so far visible to consumers of the backing.
    fn flush(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlitProcessing {
    #[default]
    Copy,
    PremultiplyAlpha,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DownsampleMode {
    /// Average of the 2×2 source footprint.
    #[default]
    Box,
    /// Top-left texel of the 2×2 source footprint.
    Point,
}

/// Where a copy or downsample reads from.
///
/// Destination offset `(dx, dy)` reads the source at `src_location + (dx, dy)`, or
/// `src_location + (dy, dx)` with `permute_xy`; downsampling doubles the offset first. Every read
/// is clamped into `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlitRegion {
    pub src_location: [i32; 2],
    pub window: TexelRect,
    pub permute_xy: bool,
}

impl BlitRegion {
    pub const fn new(src_location: [i32; 2], window: TexelRect) -> Self {
        Self {
            src_location,
            window,
            permute_xy: false,
        }
    }

    pub const fn permuted(mut self) -> Self {
        self.permute_xy = true;
        self
    }

    /// Region seen by a destination sub-rectangle starting `offset` texels into the original one.
    pub const fn shifted(self, offset: [u32; 2], scale: u32) -> Self {
        let (dx, dy) = if self.permute_xy {
            (offset[1], offset[0])
        } else {
            (offset[0], offset[1])
        };
        Self {
            src_location: [
                self.src_location[0] + (dx * scale) as i32,
                self.src_location[1] + (dy * scale) as i32,
            ],
            window: self.window,
            permute_xy: self.permute_xy,
        }
    }

    /// Clamped source position read for destination offset `(dx, dy)` at `scale`, plus an
    /// extra footprint offset `(fx, fy)` in source space.
    pub fn source_texel(self, dx: u32, dy: u32, scale: u32, fx: u32, fy: u32) -> (u32, u32) {
        let (dx, dy) = if self.permute_xy { (dy, dx) } else { (dx, dy) };
        let x = i64::from(self.src_location[0]) + i64::from(dx * scale + fx);
        let y = i64::from(self.src_location[1]) + i64::from(dy * scale + fy);
        let min_x = i64::from(self.window.x);
        let min_y = i64::from(self.window.y);
        let max_x = i64::from(self.window.right()).max(min_x + 1) - 1;
        let max_y = i64::from(self.window.bottom()).max(min_y + 1) - 1;
        (x.clamp(min_x, max_x) as u32, y.clamp(min_y, max_y) as u32)
    }
}

pub trait ColorBacking: LayeredBacking {
    /// Source of copy and downsample operations.
    type Source: Clone;

    fn upload_texels(&mut self, lod: u32, location: TileCoordinate, size: Extent2, texels: &[Rgba8]);

    fn copy_pixels(
        &mut self,
        lod: u32,
        location: TileCoordinate,
        size: Extent2,
        source: &Self::Source,
        region: BlitRegion,
        processing: BlitProcessing,
    );

    fn downsample_pixels(
        &mut self,
        lod: u32,
        location: TileCoordinate,
        size: Extent2,
        source: &Self::Source,
        region: BlitRegion,
        mode: DownsampleMode,
    );
}

pub trait IndexBacking: LayeredBacking {
    fn upload_texels(&mut self, location: TileCoordinate, size: Extent2, texels: &[IndexTexel]);
}
