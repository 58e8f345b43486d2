//! Backings on wgpu texture arrays.
//!
//! The color backing is an `Rgba8Unorm` array with two mip levels, the index backing an
//! `Rgba32Uint` array with one. Texel uploads go through `Queue::write_texture`; copies and
//! downsamples run a compute pass into a staging texture that is then copied into place. Work is
//! submitted in the order it was issued.

use log::{debug, info};
use model::{Extent2, TileCoordinate};
use thiserror::Error;
use wgpu::util::DeviceExt;

use crate::backing::{
    BlitProcessing, BlitRegion, COLOR_BACKING_LODS, ColorBacking, DownsampleMode, IndexBacking,
    LayeredBacking,
};
use crate::config::ImageAtlasConfig;
use crate::error::ImageAtlasError;
use crate::image_atlas::ImageAtlas;
use crate::{IndexTexel, Rgba8};

const COLOR_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;
const INDEX_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba32Uint;
const BLIT_WORKGROUP_SIZE: u32 = 8;

#[derive(Debug, Error)]
pub enum GpuInitError {
    #[error("no suitable GPU adapter: {0}")]
    Adapter(#[from] wgpu::RequestAdapterError),
    #[error("GPU device request failed: {0}")]
    Device(#[from] wgpu::RequestDeviceError),
}

/// Device and queue shared by both backings.
#[derive(Debug, Clone)]
pub struct GpuContext {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
}

impl GpuContext {
    pub fn new(device: wgpu::Device, queue: wgpu::Queue) -> Self {
        Self { device, queue }
    }

    /// Blocks on adapter and device creation.
    pub fn request(label: &'static str) -> Result<Self, GpuInitError> {
        pollster::block_on(async {
            let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
                backends: wgpu::Backends::all(),
                ..Default::default()
            });
            let adapter = instance
                .request_adapter(&wgpu::RequestAdapterOptions {
                    power_preference: wgpu::PowerPreference::LowPower,
                    compatible_surface: None,
                    force_fallback_adapter: false,
                })
                .await?;
            let (device, queue) = adapter
                .request_device(&wgpu::DeviceDescriptor {
                    label: Some(label),
                    required_features: wgpu::Features::empty(),
                    required_limits: adapter.limits(),
                    experimental_features: wgpu::ExperimentalFeatures::disabled(),
                    memory_hints: wgpu::MemoryHints::Performance,
                    trace: wgpu::Trace::Off,
                })
                .await?;
            info!("image atlas device: {:?}", adapter.get_info().name);
            Ok(Self { device, queue })
        })
    }
}

/// Uniform block of `blit.wgsl`.
#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct BlitParams {
    src_location: [i32; 2],
    window_min: [i32; 2],
    window_max: [i32; 2],
    size: [u32; 2],
    scale: u32,
    permute_xy: u32,
    operation: u32,
    _padding: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlitOperation {
    Copy = 0,
    Premultiply = 1,
    Box = 2,
    Point = 3,
}

impl BlitParams {
    fn new(region: BlitRegion, size: Extent2, scale: u32, operation: BlitOperation) -> Self {
        let window = region.window;
        let min = [window.x as i32, window.y as i32];
        Self {
            src_location: region.src_location,
            window_min: min,
            window_max: [
                (window.right() as i32 - 1).max(min[0]),
                (window.bottom() as i32 - 1).max(min[1]),
            ],
            size: [size.width, size.height],
            scale,
            permute_xy: u32::from(region.permute_xy),
            operation: operation as u32,
            _padding: 0,
        }
    }
}

#[derive(Debug)]
struct BlitPipeline {
    layout: wgpu::BindGroupLayout,
    pipeline: wgpu::ComputePipeline,
}

impl BlitPipeline {
    fn new(device: &wgpu::Device) -> Self {
        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("image_atlas.blit"),
            source: wgpu::ShaderSource::Wgsl(include_str!("blit.wgsl").into()),
        });
        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("image_atlas.blit_layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: false },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::StorageTexture {
                        access: wgpu::StorageTextureAccess::WriteOnly,
                        format: COLOR_FORMAT,
                        view_dimension: wgpu::TextureViewDimension::D2,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("image_atlas.blit_pipeline_layout"),
            bind_group_layouts: &[&layout],
            immediate_size: 0,
        });
        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("image_atlas.blit_pipeline"),
            layout: Some(&pipeline_layout),
            module: &module,
            entry_point: Some("main"),
            compilation_options: wgpu::PipelineCompilationOptions::default(),
            cache: None,
        });
        Self { layout, pipeline }
    }
}

/// Texture array that grows by reallocation, keeping the contents of existing layers.
#[derive(Debug)]
struct LayeredTexture {
    label: &'static str,
    format: wgpu::TextureFormat,
    usage: wgpu::TextureUsages,
    edge: u32,
    mip_level_count: u32,
    max_layers: u32,
    layers: u32,
    texture: wgpu::Texture,
    flush_count: usize,
}

impl LayeredTexture {
    fn new(
        device: &wgpu::Device,
        label: &'static str,
        format: wgpu::TextureFormat,
        usage: wgpu::TextureUsages,
        edge: u32,
        mip_level_count: u32,
        max_layers: u32,
        layers: u32,
    ) -> Self {
        let max_layers = max_layers.min(device.limits().max_texture_array_layers);
        let layers = layers.clamp(1, max_layers.max(1));
        let texture = Self::create(device, label, format, usage, edge, mip_level_count, layers);
        Self {
            label,
            format,
            usage,
            edge,
            mip_level_count,
            max_layers,
            layers,
            texture,
            flush_count: 0,
        }
    }

    fn create(
        device: &wgpu::Device,
        label: &'static str,
        format: wgpu::TextureFormat,
        usage: wgpu::TextureUsages,
        edge: u32,
        mip_level_count: u32,
        layers: u32,
    ) -> wgpu::Texture {
        device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: wgpu::Extent3d {
                width: edge,
                height: edge,
                depth_or_array_layers: layers,
            },
            mip_level_count,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage,
            view_formats: &[],
        })
    }

    /// Records copies of every existing layer into a larger replacement texture.
    fn grow(&mut self, device: &wgpu::Device, encoder: &mut wgpu::CommandEncoder, layers: u32) {
        let layers = layers.min(self.max_layers);
        if layers <= self.layers {
            return;
        }
        let texture = Self::create(
            device,
            self.label,
            self.format,
            self.usage,
            self.edge,
            self.mip_level_count,
            layers,
        );
        for mip_level in 0..self.mip_level_count {
            let edge = (self.edge >> mip_level).max(1);
            encoder.copy_texture_to_texture(
                wgpu::TexelCopyTextureInfo {
                    texture: &self.texture,
                    mip_level,
                    origin: wgpu::Origin3d::ZERO,
                    aspect: wgpu::TextureAspect::All,
                },
                wgpu::TexelCopyTextureInfo {
                    texture: &texture,
                    mip_level,
                    origin: wgpu::Origin3d::ZERO,
                    aspect: wgpu::TextureAspect::All,
                },
                wgpu::Extent3d {
                    width: edge,
                    height: edge,
                    depth_or_array_layers: self.layers,
                },
            );
        }
        debug!("{} grew from {} to {layers} layers", self.label, self.layers);
        self.texture = texture;
        self.layers = layers;
    }

    fn array_view(&self) -> wgpu::TextureView {
        self.texture.create_view(&wgpu::TextureViewDescriptor {
            label: Some(self.label),
            dimension: Some(wgpu::TextureViewDimension::D2Array),
            ..Default::default()
        })
    }
}

fn texel_destination(
    texture: &wgpu::Texture,
    lod: u32,
    location: TileCoordinate,
) -> wgpu::TexelCopyTextureInfo<'_> {
    wgpu::TexelCopyTextureInfo {
        texture,
        mip_level: lod,
        origin: wgpu::Origin3d {
            x: location.x,
            y: location.y,
            z: location.layer,
        },
        aspect: wgpu::TextureAspect::All,
    }
}

const fn extent(size: Extent2) -> wgpu::Extent3d {
    wgpu::Extent3d {
        width: size.width,
        height: size.height,
        depth_or_array_layers: 1,
    }
}

/// Color texels in an `Rgba8Unorm` texture array with two mip levels.
#[derive(Debug)]
pub struct GpuColorBacking {
    context: GpuContext,
    store: LayeredTexture,
    blit: BlitPipeline,
    encoder: Option<wgpu::CommandEncoder>,
}

impl GpuColorBacking {
    pub fn new(context: GpuContext, width_height: u32, max_layers: u32, initial_layers: u32) -> Self {
        let store = LayeredTexture::new(
            &context.device,
            "image_atlas.color",
            COLOR_FORMAT,
            wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::COPY_DST
                | wgpu::TextureUsages::COPY_SRC,
            width_height,
            COLOR_BACKING_LODS,
            max_layers,
            initial_layers,
        );
        let blit = BlitPipeline::new(&context.device);
        Self {
            context,
            store,
            blit,
            encoder: None,
        }
    }

    pub fn texture(&self) -> &wgpu::Texture {
        &self.store.texture
    }

    /// `D2Array` view over both LODs for sampling.
    pub fn array_view(&self) -> wgpu::TextureView {
        self.store.array_view()
    }

    pub fn flush_count(&self) -> usize {
        self.store.flush_count
    }

    fn encoder(&mut self) -> &mut wgpu::CommandEncoder {
        let device = &self.context.device;
        self.encoder.get_or_insert_with(|| {
            device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("image_atlas.color_encoder"),
            })
        })
    }

    /// Submits recorded commands so that queue writes issued next land after them.
    fn submit_recorded(&mut self) {
        if let Some(encoder) = self.encoder.take() {
            self.context.queue.submit(Some(encoder.finish()));
        }
    }

    fn blit(
        &mut self,
        lod: u32,
        location: TileCoordinate,
        size: Extent2,
        source: &wgpu::Texture,
        params: BlitParams,
    ) {
        if size.is_empty() {
            return;
        }
        let device = &self.context.device;
        let staging = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("image_atlas.blit_staging"),
            size: extent(size),
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: COLOR_FORMAT,
            usage: wgpu::TextureUsages::STORAGE_BINDING | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let source_view = source.create_view(&wgpu::TextureViewDescriptor {
            label: Some("image_atlas.blit_source"),
            dimension: Some(wgpu::TextureViewDimension::D2),
            base_mip_level: 0,
            mip_level_count: Some(1),
            ..Default::default()
        });
        let staging_view = staging.create_view(&wgpu::TextureViewDescriptor::default());
        let uniforms = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("image_atlas.blit_params"),
            contents: bytemuck::bytes_of(&params),
            usage: wgpu::BufferUsages::UNIFORM,
        });
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("image_atlas.blit_bind_group"),
            layout: &self.blit.layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(&source_view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(&staging_view),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: uniforms.as_entire_binding(),
                },
            ],
        });

        let pipeline = self.blit.pipeline.clone();
        let target = self.store.texture.clone();
        let encoder = self.encoder();
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("image_atlas.blit_pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(
                size.width.div_ceil(BLIT_WORKGROUP_SIZE),
                size.height.div_ceil(BLIT_WORKGROUP_SIZE),
                1,
            );
        }
        encoder.copy_texture_to_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &staging,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            texel_destination(&target, lod, location),
            extent(size),
        );
    }
}

impl LayeredBacking for GpuColorBacking {
    fn width_height(&self) -> u32 {
        self.store.edge
    }

    fn number_layers(&self) -> u32 {
        self.store.layers
    }

    fn set_number_layers(&mut self, layers: u32) {
        if layers <= self.store.layers {
            return;
        }
        let device = self.context.device.clone();
        let mut encoder = self.encoder.take().unwrap_or_else(|| {
            device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("image_atlas.color_encoder"),
            })
        });
        self.store.grow(&device, &mut encoder, layers);
        self.encoder = Some(encoder);
        self.submit_recorded();
    }

    fn max_number_layers(&self) -> u32 {
        self.store.max_layers
    }

    fn flush(&mut self) {
        self.submit_recorded();
        self.store.flush_count += 1;
    }
}

impl ColorBacking for GpuColorBacking {
    type Source = wgpu::Texture;

    fn upload_texels(&mut self, lod: u32, location: TileCoordinate, size: Extent2, texels: &[Rgba8]) {
        if texels.len() != size.texel_count() || size.is_empty() {
            log::warn!(
                "upload of {} texels does not match a {}x{} region",
                texels.len(),
                size.width,
                size.height
            );
            return;
        }
        self.submit_recorded();
        self.context.queue.write_texture(
            texel_destination(&self.store.texture, lod, location),
            bytemuck::cast_slice(texels),
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(size.width * 4),
                rows_per_image: Some(size.height),
            },
            extent(size),
        );
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
        let operation = match processing {
            BlitProcessing::Copy => BlitOperation::Copy,
            BlitProcessing::PremultiplyAlpha => BlitOperation::Premultiply,
        };
        let params = BlitParams::new(region, size, 1, operation);
        self.blit(lod, location, size, source, params);
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
        let operation = match mode {
            DownsampleMode::Box => BlitOperation::Box,
            DownsampleMode::Point => BlitOperation::Point,
        };
        let params = BlitParams::new(region, size, 2, operation);
        self.blit(lod, location, size, source, params);
    }
}

/// Index texels in an `Rgba32Uint` texture array.
#[derive(Debug)]
pub struct GpuIndexBacking {
    context: GpuContext,
    store: LayeredTexture,
}

impl GpuIndexBacking {
    pub fn new(context: GpuContext, width_height: u32, max_layers: u32, initial_layers: u32) -> Self {
        let store = LayeredTexture::new(
            &context.device,
            "image_atlas.index",
            INDEX_FORMAT,
            wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::COPY_DST
                | wgpu::TextureUsages::COPY_SRC,
            width_height,
            1,
            max_layers,
            initial_layers,
        );
        Self { context, store }
    }

    pub fn texture(&self) -> &wgpu::Texture {
        &self.store.texture
    }

    pub fn array_view(&self) -> wgpu::TextureView {
        self.store.array_view()
    }

    pub fn flush_count(&self) -> usize {
        self.store.flush_count
    }
}

impl LayeredBacking for GpuIndexBacking {
    fn width_height(&self) -> u32 {
        self.store.edge
    }

    fn number_layers(&self) -> u32 {
        self.store.layers
    }

    fn set_number_layers(&mut self, layers: u32) {
        if layers <= self.store.layers {
            return;
        }
        let mut encoder = self
            .context
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("image_atlas.index_grow"),
            });
        self.store.grow(&self.context.device, &mut encoder, layers);
        self.context.queue.submit(Some(encoder.finish()));
    }

    fn max_number_layers(&self) -> u32 {
        self.store.max_layers
    }

    fn flush(&mut self) {
        self.context.queue.submit(std::iter::empty());
        self.store.flush_count += 1;
    }
}

impl IndexBacking for GpuIndexBacking {
    fn upload_texels(&mut self, location: TileCoordinate, size: Extent2, texels: &[IndexTexel]) {
        if texels.len() != size.texel_count() || size.is_empty() {
            log::warn!(
                "index upload of {} texels does not match a {}x{} region",
                texels.len(),
                size.width,
                size.height
            );
            return;
        }
        self.context.queue.write_texture(
            texel_destination(&self.store.texture, 0, location),
            bytemuck::cast_slice(texels),
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(size.width * size_of::<IndexTexel>() as u32),
                rows_per_image: Some(size.height),
            },
            extent(size),
        );
    }
}

impl crate::GpuImageAtlas {
    /// Atlas over texture arrays on `context`, sized from `config`.
    pub fn new_gpu(context: &GpuContext, config: ImageAtlasConfig) -> Result<Self, ImageAtlasError> {
        let color = GpuColorBacking::new(
            context.clone(),
            config.color_tier.edge_texels(),
            config.color_tier.max_layers(),
            config.initial_color_layers,
        );
        let index = GpuIndexBacking::new(
            context.clone(),
            config.index_tier.edge_texels(),
            config.index_tier.max_layers(),
            config.initial_index_layers,
        );
        ImageAtlas::new(config, color, index)
    }
}
