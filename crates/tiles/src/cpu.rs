//! In-memory backings. They keep every texel on the CPU and can be read back, which makes
//! them the reference implementation for the GPU stores and the backend used in tests.

use std::sync::Arc;

use image::RgbaImage;
use model::{Extent2, TileCoordinate};

use crate::backing::{
    BlitProcessing, BlitRegion, COLOR_BACKING_LODS, ColorBacking, DownsampleMode, IndexBacking,
    LayeredBacking,
};
use crate::{IndexTexel, Rgba8};

#[derive(Debug, Clone)]
struct Layer<T> {
    lods: Vec<Vec<T>>,
}

#[derive(Debug)]
struct LayerStore<T> {
    edge: u32,
    lod_count: u32,
    max_layers: u32,
    layers: Vec<Layer<T>>,
    flush_count: usize,
}

impl<T: Copy + Default> LayerStore<T> {
    fn new(edge: u32, lod_count: u32, max_layers: u32, layers: u32) -> Self {
        let mut store = Self {
            edge,
            lod_count,
            max_layers,
            layers: Vec::new(),
            flush_count: 0,
        };
        store.grow(layers);
        store
    }

    fn grow(&mut self, layers: u32) {
        let layers = layers.min(self.max_layers);
        while (self.layers.len() as u32) < layers {
            let lods = (0..self.lod_count)
                .map(|lod| {
                    let edge = (self.edge >> lod) as usize;
                    vec![T::default(); edge * edge]
                })
                .collect();
            self.layers.push(Layer { lods });
        }
    }

    fn index(&self, lod: u32, x: u32, y: u32, layer: u32) -> Option<usize> {
        let edge = self.edge >> lod;
        if lod >= self.lod_count || x >= edge || y >= edge || layer >= self.layers.len() as u32 {
            return None;
        }
        Some(y as usize * edge as usize + x as usize)
    }

    fn get(&self, lod: u32, x: u32, y: u32, layer: u32) -> Option<T> {
        let index = self.index(lod, x, y, layer)?;
        Some(self.layers[layer as usize].lods[lod as usize][index])
    }

    /// Writes `size` texels produced by `texel(dx, dy)`; texels outside the store are dropped.
    fn write(
        &mut self,
        lod: u32,
        location: TileCoordinate,
        size: Extent2,
        mut texel: impl FnMut(u32, u32) -> T,
    ) {
        let mut dropped = 0usize;
        for dy in 0..size.height {
            for dx in 0..size.width {
                let value = texel(dx, dy);
                match self.index(lod, location.x + dx, location.y + dy, location.layer) {
                    Some(index) => {
                        self.layers[location.layer as usize].lods[lod as usize][index] = value
                    }
                    None => dropped += 1,
                }
            }
        }
        if dropped > 0 {
            log::warn!("dropped {dropped} texels written outside the backing at {location:?}");
        }
    }
}

/// Color texels for two LODs per layer.
#[derive(Debug)]
pub struct CpuColorBacking {
    store: LayerStore<Rgba8>,
}

impl CpuColorBacking {
    pub fn new(width_height: u32, max_layers: u32, initial_layers: u32) -> Self {
        Self {
            store: LayerStore::new(width_height, COLOR_BACKING_LODS, max_layers, initial_layers),
        }
    }

    pub fn texel(&self, lod: u32, x: u32, y: u32, layer: u32) -> Option<Rgba8> {
        self.store.get(lod, x, y, layer)
    }

    pub fn flush_count(&self) -> usize {
        self.store.flush_count
    }
}

fn source_texel(source: &RgbaImage, x: u32, y: u32) -> Rgba8 {
    let x = x.min(source.width().saturating_sub(1));
    let y = y.min(source.height().saturating_sub(1));
    source.get_pixel(x, y).0
}

fn premultiply(texel: Rgba8) -> Rgba8 {
    let alpha = u32::from(texel[3]);
    let scale = |channel: u8| ((u32::from(channel) * alpha + 127) / 255) as u8;
    [scale(texel[0]), scale(texel[1]), scale(texel[2]), texel[3]]
}

impl LayeredBacking for CpuColorBacking {
    fn width_height(&self) -> u32 {
        self.store.edge
    }

    fn number_layers(&self) -> u32 {
        self.store.layers.len() as u32
    }

    fn set_number_layers(&mut self, layers: u32) {
        self.store.grow(layers);
    }

    fn max_number_layers(&self) -> u32 {
        self.store.max_layers
    }

    fn flush(&mut self) {
        self.store.flush_count += 1;
    }
}

impl ColorBacking for CpuColorBacking {
    type Source = Arc<RgbaImage>;

    fn upload_texels(&mut self, lod: u32, location: TileCoordinate, size: Extent2, texels: &[Rgba8]) {
        if texels.len() != size.texel_count() {
            log::warn!(
                "upload of {} texels does not match a {}x{} region",
                texels.len(),
                size.width,
                size.height
            );
            return;
        }
        self.store.write(lod, location, size, |dx, dy| {
            texels[dy as usize * size.width as usize + dx as usize]
        });
    }

    fn copy_pixels(
        &mut self,
        lod: u32,
        location: TileCoordinate,
        size: Extent2,
        source: &Self::Source,
        region: BlitRegion,
        processing: BlitProcessing,
    ) {
        self.store.write(lod, location, size, |dx, dy| {
            let (x, y) = region.source_texel(dx, dy, 1, 0, 0);
            let texel = source_texel(source, x, y);
            match processing {
                BlitProcessing::Copy => texel,
                BlitProcessing::PremultiplyAlpha => premultiply(texel),
            }
        });
    }

    fn downsample_pixels(
        &mut self,
        lod: u32,
        location: TileCoordinate,
        size: Extent2,
        source: &Self::Source,
        region: BlitRegion,
        mode: DownsampleMode,
    ) {
        self.store.write(lod, location, size, |dx, dy| match mode {
            DownsampleMode::Point => {
                let (x, y) = region.source_texel(dx, dy, 2, 0, 0);
                source_texel(source, x, y)
            }
            DownsampleMode::Box => {
                let mut sum = [0u32; 4];
                for (fx, fy) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
                    let (x, y) = region.source_texel(dx, dy, 2, fx, fy);
                    let texel = source_texel(source, x, y);
                    for (total, channel) in sum.iter_mut().zip(texel) {
                        *total += u32::from(channel);
                    }
                }
                sum.map(|total| ((total + 2) / 4) as u8)
            }
        });
    }
}

/// Index texels, one LOD per layer.
#[derive(Debug)]
pub struct CpuIndexBacking {
    store: LayerStore<IndexTexel>,
}

impl CpuIndexBacking {
    pub fn new(width_height: u32, max_layers: u32, initial_layers: u32) -> Self {
        Self {
            store: LayerStore::new(width_height, 1, max_layers, initial_layers),
        }
    }

    pub fn texel(&self, x: u32, y: u32, layer: u32) -> Option<IndexTexel> {
        self.store.get(0, x, y, layer)
    }

    pub fn flush_count(&self) -> usize {
        self.store.flush_count
    }
}

impl LayeredBacking for CpuIndexBacking {
    fn width_height(&self) -> u32 {
        self.store.edge
    }

    fn number_layers(&self) -> u32 {
        self.store.layers.len() as u32
    }

    fn set_number_layers(&mut self, layers: u32) {
        self.store.grow(layers);
    }

    fn max_number_layers(&self) -> u32 {
        self.store.max_layers
    }

    fn flush(&mut self) {
        self.store.flush_count += 1;
    }
}

impl IndexBacking for CpuIndexBacking {
    fn upload_texels(&mut self, location: TileCoordinate, size: Extent2, texels: &[IndexTexel]) {
        if texels.len() != size.texel_count() {
            log::warn!(
                "index upload of {} texels does not match a {}x{} region",
                texels.len(),
                size.width,
                size.height
            );
            return;
        }
        self.store.write(0, location, size, |dx, dy| {
            texels[dy as usize * size.width as usize + dx as usize]
        });
    }
}
