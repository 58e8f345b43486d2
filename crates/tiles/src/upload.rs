//! Texel writes queued between flushes.

use model::{Extent2, TileCoordinate};

use crate::backing::{BlitProcessing, BlitRegion, ColorBacking, DownsampleMode, IndexBacking};
use crate::{IndexTexel, Rgba8};

#[derive(Debug, Clone)]
pub(crate) enum Upload<S> {
    ColorTexels {
        lod: u32,
        location: TileCoordinate,
        size: Extent2,
        texels: Vec<Rgba8>,
    },
    ColorCopy {
        lod: u32,
        location: TileCoordinate,
        size: Extent2,
        source: S,
        region: BlitRegion,
        processing: BlitProcessing,
    },
    ColorDownsample {
        lod: u32,
        location: TileCoordinate,
        size: Extent2,
        source: S,
        region: BlitRegion,
        mode: DownsampleMode,
    },
    IndexTexels {
        location: TileCoordinate,
        size: Extent2,
        texels: Vec<IndexTexel>,
    },
}

/// Uploads in submission order.
#[derive(Debug)]
pub(crate) struct UploadQueue<S> {
    uploads: Vec<Upload<S>>,
}

impl<S> Default for UploadQueue<S> {
    fn default() -> Self {
        Self {
            uploads: Vec::new(),
        }
    }
}

impl<S> UploadQueue<S> {
    pub(crate) fn push(&mut self, upload: Upload<S>) {
        self.uploads.push(upload);
    }

    pub(crate) fn len(&self) -> usize {
        self.uploads.len()
    }

    /// Applies every queued upload in order and empties the queue.
    pub(crate) fn replay<C, I>(&mut self, color: &mut C, index: &mut I)
    where
        C: ColorBacking<Source = S>,
        I: IndexBacking,
    {
        for upload in self.uploads.drain(..) {
            match upload {
                Upload::ColorTexels {
                    lod,
                    location,
                    size,
                    texels,
                } => color.upload_texels(lod, location, size, &texels),
                Upload::ColorCopy {
                    lod,
                    location,
                    size,
                    source,
                    region,
                    processing,
                } => color.copy_pixels(lod, location, size, &source, region, processing),
                Upload::ColorDownsample {
                    lod,
                    location,
                    size,
                    source,
                    region,
                    mode,
                } => color.downsample_pixels(lod, location, size, &source, region, mode),
                Upload::IndexTexels {
                    location,
                    size,
                    texels,
                } => index.upload_texels(location, size, &texels),
            }
        }
    }
}
