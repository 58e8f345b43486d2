use std::sync::Arc;

use ::image::RgbaImage;

use super::*;

const RED: Rgba8 = [255, 0, 0, 255];
const GREEN: Rgba8 = [0, 255, 0, 255];

fn tiny_atlas() -> CpuImageAtlas {
    atlas_with(ImageAtlasConfig::tiny())
}

fn atlas_with(config: ImageAtlasConfig) -> CpuImageAtlas {
    let _ = env_logger::builder().is_test(true).try_init();
    CpuImageAtlas::new_cpu(config).expect("create cpu image atlas")
}

fn image_with_element(atlas: &mut CpuImageAtlas, size: Extent2) -> (ImageId, MipElementId) {
    let mip = atlas
        .create_mip_element(size, &TileContents::default())
        .expect("create mip element");
    let image = atlas
        .create_image(vec![mip], Colorspace::Linear)
        .expect("create image");
    (image, mip)
}

fn color_at(atlas: &CpuImageAtlas, mip: MipElementId, x: u32, y: u32) -> Rgba8 {
    let texel = atlas
        .resolve_texel(mip, x, y)
        .expect("resolve texel")
        .expect("element is indexed");
    atlas
        .color_backing()
        .texel(0, texel.x, texel.y, texel.layer)
        .expect("resolved texel lies inside the color backing")
}

#[test]
fn solid_red_image_resolves_through_index_root() {
    let mut atlas = tiny_atlas();
    let image = atlas
        .create_image_of_size(Extent2::square(300), Colorspace::Srgb)
        .expect("create 300x300 image");
    let mip = atlas.fetch_image(image).expect("live image").mip_chain()[0];

    atlas
        .set_pixels(
            image,
            0,
            TexelRect::new(0, 0, 300, 300),
            &vec![RED; 300 * 300],
        )
        .expect("set pixels");
    atlas.flush();

    let element = atlas.mip_element(mip).expect("live element");
    assert_eq!(element.tile_count(), TilePos::new(3, 3));
    assert_eq!(element.remainder_size_exact(), Extent2::square(54));
    assert_eq!(element.remainder_size(), Extent2::square(64));
    for interior in [TilePos::new(0, 0), TilePos::new(1, 0), TilePos::new(0, 1), TilePos::new(1, 1)] {
        assert_eq!(element.tile_size(interior, true), Some(Extent2::square(128)));
        assert_eq!(element.tile_size(interior, false), Some(Extent2::square(124)));
    }
    assert_eq!(element.tile_size(TilePos::new(2, 1), true), Some(Extent2::new(54, 128)));
    assert_eq!(element.tile_size(TilePos::new(1, 2), false), Some(Extent2::new(124, 52)));
    assert_eq!(element.tile_size(TilePos::new(2, 2), false), Some(Extent2::square(52)));
    assert_eq!(element.tile_size(TilePos::new(3, 0), false), None);
    assert_eq!(element.number_index_levels(), 1);
    assert_eq!(element.ratio(), TILE_SIZE_WITHOUT_PADDING);

    let center_tile = atlas
        .tile_location(mip, TilePos::new(1, 1))
        .expect("center tile is backed");
    let resolved = atlas
        .resolve_texel(mip, 150, 150)
        .expect("resolve")
        .expect("indexed");
    assert_eq!(resolved, center_tile.offset(28, 28));
    assert_eq!(color_at(&atlas, mip, 150, 150), RED);

    let root = atlas.root_index_tile(mip).expect("root index tile");
    let entry = atlas
        .index_backing()
        .texel(root.x + 1, root.y + 1, root.layer)
        .expect("root entry");
    assert_eq!(entry.location(), center_tile.offset(TILE_PADDING, TILE_PADDING));
    assert_eq!(entry.category, TileCategory::Color.index_code());

    // Front padding at the image border is never written.
    let corner = atlas
        .tile_location(mip, TilePos::new(0, 0))
        .expect("corner tile is backed");
    let backing = atlas.color_backing();
    assert_eq!(backing.texel(0, corner.x, corner.y, corner.layer), Some([0; 4]));
    assert_eq!(backing.texel(0, corner.x + 127, corner.y + 127, corner.layer), Some(RED));
}

#[test]
fn writes_split_across_tile_boundary_and_padding() {
    let mut atlas = tiny_atlas();
    let (image, mip) = image_with_element(&mut atlas, Extent2::square(300));
    let texels: Vec<Rgba8> = (120..128u8).map(|x| [x, 7, 0, 255]).collect();
    atlas
        .set_pixels(image, 0, TexelRect::new(120, 10, 8, 1), &texels)
        .expect("set pixels");
    atlas.flush();

    for x in 120..128u32 {
        assert_eq!(color_at(&atlas, mip, x, 10), [x as u8, 7, 0, 255], "texel {x}");
    }
    // Logical 124 and 125 are also the trailing padding of the first tile.
    let first = atlas
        .tile_location(mip, TilePos::new(0, 0))
        .expect("first tile is backed");
    for x in [124u32, 125] {
        assert_eq!(
            atlas
                .color_backing()
                .texel(0, first.x + x + TILE_PADDING, first.y + 12, first.layer),
            Some([x as u8, 7, 0, 255])
        );
    }
}

#[test]
fn set_pixels_rejects_bad_input() {
    let mut atlas = tiny_atlas();
    let (image, _) = image_with_element(&mut atlas, Extent2::square(40));
    assert_eq!(
        atlas.set_pixels(image, 0, TexelRect::new(0, 0, 2, 2), &[RED; 3]),
        Err(ImageAtlasError::TexelCountMismatch {
            expected: 4,
            actual: 3
        })
    );
    assert_eq!(
        atlas.set_pixels(image, 1, TexelRect::new(19, 0, 2, 1), &[RED; 2]),
        Err(ImageAtlasError::TileRangeOutOfBounds)
    );
}

#[test]
fn shared_tile_outlives_one_owner() {
    let mut atlas = tiny_atlas();
    let shared_tiles = atlas.color_allocator().allocated_tile_count();
    let first = atlas
        .create_mip_element(Extent2::square(300), &TileContents::default())
        .expect("first element");
    atlas
        .allocate_color_tile_backings(first)
        .expect("back first element");
    assert_eq!(atlas.color_allocator().allocated_tile_count(), shared_tiles + 9);

    let center = TilePos::new(1, 1);
    let shared_id = atlas
        .mip_element(first)
        .and_then(|element| element.tile_id(center))
        .expect("center tile");
    let location = atlas.tile_location(first, center).expect("center location");
    let contents = TileContents {
        shared: vec![SharedTile {
            position: center,
            source: first,
            source_tile: center,
        }],
        ..TileContents::default()
    };
    let second = atlas
        .create_mip_element(Extent2::square(300), &contents)
        .expect("second element");
    assert_eq!(atlas.color_tile(shared_id).map(ColorTile::ref_count), Some(2));
    atlas
        .allocate_color_tile_backings(second)
        .expect("back second element");
    assert_eq!(atlas.color_allocator().allocated_tile_count(), shared_tiles + 17);

    atlas.release_mip_element(first).expect("release first");
    assert_eq!(atlas.color_allocator().allocated_tile_count(), shared_tiles + 9);
    assert_eq!(atlas.tile_location(second, center), Some(location));
    assert_eq!(atlas.color_tile(shared_id).map(ColorTile::ref_count), Some(1));

    atlas.release_mip_element(second).expect("release second");
    assert_eq!(atlas.color_allocator().allocated_tile_count(), shared_tiles);
    assert!(atlas.color_tile(shared_id).is_none());
    assert_eq!(
        atlas.release_mip_element(second),
        Err(ImageAtlasError::UnknownMipElement)
    );
}

#[test]
fn shared_tile_must_match_allocated_size() {
    let mut atlas = tiny_atlas();
    let source = atlas
        .create_mip_element(Extent2::square(300), &TileContents::default())
        .expect("source element");
    let contents = TileContents {
        shared: vec![SharedTile {
            position: TilePos::new(1, 1),
            source,
            source_tile: TilePos::new(2, 2),
        }],
        ..TileContents::default()
    };
    assert_eq!(
        atlas.create_mip_element(Extent2::square(300), &contents),
        Err(ImageAtlasError::SharedTileSizeMismatch(TilePos::new(1, 1)))
    );
}

#[test]
fn degenerate_tiles_partition_the_grid() {
    let mut atlas = tiny_atlas();
    let contents = TileContents {
        empty: vec![TilePos::new(0, 0), TilePos::new(2, 2)],
        white: vec![TilePos::new(1, 0)],
        ..TileContents::default()
    };
    let mip = atlas
        .create_mip_element(Extent2::square(300), &contents)
        .expect("element with degenerate tiles");
    let element = atlas.mip_element(mip).expect("live element");
    let empty: Vec<_> = element.empty_tiles().collect();
    let white: Vec<_> = element.white_tiles().collect();
    assert_eq!(empty, vec![TilePos::new(0, 0), TilePos::new(2, 2)]);
    assert_eq!(white, vec![TilePos::new(1, 0)]);
    assert_eq!(element.color_tiles().count(), 6);
    assert_eq!(element.tile_id(TilePos::new(2, 2)), Some(atlas.empty_tile()));
    assert_eq!(element.tile_id(TilePos::new(1, 0)), Some(atlas.white_tile()));

    let duplicate = TileContents {
        empty: vec![TilePos::new(0, 0)],
        white: vec![TilePos::new(0, 0)],
        ..TileContents::default()
    };
    assert_eq!(
        atlas.create_mip_element(Extent2::square(300), &duplicate),
        Err(ImageAtlasError::DuplicateTile(TilePos::new(0, 0)))
    );
    let outside = TileContents {
        empty: vec![TilePos::new(3, 0)],
        ..TileContents::default()
    };
    assert_eq!(
        atlas.create_mip_element(Extent2::square(300), &outside),
        Err(ImageAtlasError::TileRangeOutOfBounds)
    );
}

#[test]
fn writes_to_degenerate_tiles_are_skipped() {
    let mut atlas = tiny_atlas();
    let contents = TileContents {
        white: vec![TilePos::new(0, 0)],
        ..TileContents::default()
    };
    let mip = atlas
        .create_mip_element(Extent2::square(300), &contents)
        .expect("element");
    atlas
        .set_element_pixels(mip, 0, TexelRect::new(10, 10, 1, 1), &[GREEN])
        .expect("write into shared white tile");
    atlas.flush();
    assert_eq!(color_at(&atlas, mip, 10, 10), [255; 4]);
}

#[test]
fn stale_image_ids_do_not_resolve() {
    let mut atlas = tiny_atlas();
    let first = atlas
        .create_image_of_size(Extent2::square(10), Colorspace::Linear)
        .expect("first image");
    atlas.release_image(first).expect("release first");
    let second = atlas
        .create_image_of_size(Extent2::square(12), Colorspace::Linear)
        .expect("second image");

    assert_eq!(second.slot(), first.slot());
    assert_ne!(second.generation(), first.generation());
    assert!(atlas.fetch_image(first).is_none());
    assert_eq!(atlas.fetch_image(second).map(Image::id), Some(second));
    assert_eq!(
        atlas.release_image(first),
        Err(ImageAtlasError::UnknownImage(first))
    );
}

#[test]
fn seventeen_by_seventeen_tiles_use_one_index_level() {
    let mut atlas = tiny_atlas();
    let index_tiles = atlas.stats().index_tiles;
    let mip = atlas
        .create_mip_element(Extent2::square(2000), &TileContents::default())
        .expect("17x17 tile element");
    let element = atlas.mip_element(mip).expect("live element");
    assert_eq!(element.tile_count(), TilePos::new(17, 17));
    assert_eq!(element.number_index_levels(), 1);
    assert_eq!(element.ratio(), TILE_SIZE_WITHOUT_PADDING);
    assert_eq!(atlas.stats().index_tiles, index_tiles + 1);
}

#[test]
fn wide_element_builds_two_index_levels() {
    let mut atlas = tiny_atlas();
    let (image, mip) = image_with_element(&mut atlas, Extent2::new(128 * 124, 100));
    let element = atlas.mip_element(mip).expect("live element");
    assert_eq!(element.tile_count(), TilePos::new(128, 1));
    assert_eq!(element.number_index_levels(), 2);
    assert_eq!(element.ratio(), TILE_SIZE_WITHOUT_PADDING * TILE_SIZE);

    atlas
        .set_pixels(image, 0, TexelRect::new(15000, 50, 1, 1), &[GREEN])
        .expect("set pixel");
    atlas.flush();
    let tile = atlas
        .tile_location(mip, TilePos::new(120, 0))
        .expect("tile 120 is backed");
    assert_eq!(
        atlas.resolve_texel(mip, 15000, 50).expect("resolve"),
        Some(tile.offset(122, 52))
    );
    assert_eq!(color_at(&atlas, mip, 15000, 50), GREEN);
}

#[test]
fn lookups_descend_into_later_child_index_tiles() {
    let mut atlas = tiny_atlas();
    let (image, mip) = image_with_element(&mut atlas, Extent2::new(20000, 100));
    let element = atlas.mip_element(mip).expect("live element");
    assert_eq!(element.tile_count(), TilePos::new(162, 1));
    assert_eq!(element.number_index_levels(), 2);

    // Texel 18000 lies in color tile 145, indexed by the second level one index tile.
    atlas
        .set_pixels(image, 0, TexelRect::new(18000, 50, 1, 1), &[GREEN])
        .expect("set pixel");
    atlas.flush();
    let tile = atlas
        .tile_location(mip, TilePos::new(145, 0))
        .expect("tile 145 is backed");
    assert_eq!(
        atlas.resolve_texel(mip, 18000, 50).expect("resolve"),
        Some(tile.offset(22, 52))
    );
    assert_eq!(color_at(&atlas, mip, 18000, 50), GREEN);
    assert_eq!(color_at(&atlas, mip, 19999, 99), [0; 4]);
}

#[test]
fn single_tile_index_is_created_on_first_root_query() {
    let mut atlas = tiny_atlas();
    let (image, mip) = image_with_element(&mut atlas, Extent2::new(100, 60));
    let index_tiles = atlas.stats().index_tiles;
    let element = atlas.mip_element(mip).expect("live element");
    assert!(!element.is_padded());
    assert_eq!(element.number_index_levels(), 0);
    assert_eq!(element.ratio(), TILE_SIZE);
    assert_eq!(atlas.resolve_texel(mip, 0, 0), Ok(None));

    let root = atlas.root_index_tile(mip).expect("lazy root");
    assert_eq!(atlas.stats().index_tiles, index_tiles + 1);
    assert_eq!(atlas.root_index_tile(mip), Ok(root));
    assert_eq!(atlas.stats().index_tiles, index_tiles + 1);
    let element = atlas.mip_element(mip).expect("live element");
    assert_eq!(element.number_index_levels(), 1);
    assert_eq!(element.ratio(), TILE_SIZE);

    atlas
        .set_pixels(image, 0, TexelRect::new(99, 59, 1, 1), &[GREEN])
        .expect("set pixel");
    atlas.flush();
    let tile = atlas
        .tile_location(mip, TilePos::new(0, 0))
        .expect("tile is backed");
    assert_eq!(atlas.resolve_texel(mip, 99, 59), Ok(Some(tile.offset(99, 59))));
    assert_eq!(color_at(&atlas, mip, 99, 59), GREEN);
}

#[test]
fn in_use_lasts_until_outermost_unlock() {
    let mut atlas = tiny_atlas();
    let image = atlas
        .create_image_of_size(Extent2::square(32), Colorspace::Linear)
        .expect("image");
    assert!(!atlas.in_use(image));

    atlas.lock_resources();
    atlas.lock_resources();
    assert!(atlas.mark_in_use(image));
    assert!(atlas.mark_in_use(image));
    assert_eq!(atlas.images_in_use(), &[image]);
    atlas.unlock_resources();
    assert!(atlas.in_use(image));
    atlas.unlock_resources();

    assert!(!atlas.in_use(image));
    assert!(atlas.images_in_use().is_empty());
    assert_eq!(atlas.resources_unlock_count(), 1);

    let marked = atlas.with_locked_resources(|atlas| {
        atlas.mark_in_use(image);
        atlas.in_use(image)
    });
    assert!(marked);
    assert!(!atlas.in_use(image));
    assert!(!atlas.is_locked());
}

#[test]
fn release_of_in_use_image_waits_for_unlock() {
    let mut atlas = tiny_atlas();
    let image = atlas
        .create_image_of_size(Extent2::square(64), Colorspace::Linear)
        .expect("image");
    atlas.lock_resources();
    atlas.mark_in_use(image);
    atlas.release_image(image).expect("deferred release");
    assert!(atlas.fetch_image(image).is_some());
    atlas.unlock_resources();
    assert!(atlas.fetch_image(image).is_none());
    assert_eq!(atlas.stats().images, 0);
    assert_eq!(atlas.stats().mip_elements, 0);
}

#[test]
fn rendered_images_defer_backing_and_tracking() {
    let mut atlas = tiny_atlas();
    let mip = atlas
        .create_mip_element(Extent2::square(200), &TileContents::default())
        .expect("element");
    let image = atlas
        .create_rendered_image(vec![mip], Colorspace::Linear, 3)
        .expect("rendered image");
    assert_eq!(atlas.tile_location(mip, TilePos::new(0, 0)), None);
    assert_eq!(
        atlas.fetch_image(image).and_then(Image::offscreen_render_index),
        Some(3)
    );

    atlas.with_locked_resources(|atlas| {
        assert!(atlas.mark_in_use(image));
        assert!(atlas.in_use(image));
        assert!(atlas.images_in_use().is_empty());
    });

    atlas.mark_rendered_image_ready(image).expect("mark ready");
    assert!(atlas.tile_location(mip, TilePos::new(0, 0)).is_some());
    assert_eq!(
        atlas.fetch_image(image).and_then(Image::offscreen_render_index),
        None
    );
}

#[test]
fn color_exhaustion_degrades_instead_of_failing() {
    let mut atlas = tiny_atlas();
    let shared_tiles = atlas.color_allocator().allocated_tile_count();
    let (image, mip) = image_with_element(&mut atlas, Extent2::square(2000));

    assert_eq!(atlas.image_tile_allocation_failed(image), Some(true));
    let element = atlas.mip_element(mip).expect("live element");
    assert!(element.tile_allocation_failed());
    assert_eq!(element.color_tiles().count(), 0);
    assert!(
        element
            .grid()
            .iter_tiles()
            .all(|tile| element.tile_id(tile) == Some(atlas.empty_tile()))
    );
    assert_eq!(element.number_index_levels(), 1);
    assert_eq!(atlas.color_allocator().allocated_tile_count(), shared_tiles);
    assert_eq!(atlas.stats().index_tiles, 1);

    let scratch = atlas
        .index_tile(atlas.scratch_index_tile())
        .map(IndexTile::location)
        .expect("scratch index tile");
    assert_eq!(atlas.root_index_tile(mip), Ok(scratch));
    let empty = atlas
        .color_tile(atlas.empty_tile())
        .and_then(ColorTile::location)
        .expect("empty tile is backed");
    assert_eq!(atlas.resolve_texel(mip, 1000, 0), Ok(Some(empty.offset(8, 0))));

    atlas
        .set_pixels(image, 0, TexelRect::new(0, 0, 1, 1), &[RED])
        .expect("writes to a degraded image are dropped");
    atlas.flush();
    assert_eq!(color_at(&atlas, mip, 0, 0), [0; 4]);

    let (healthy, _) = image_with_element(&mut atlas, Extent2::square(300));
    assert_eq!(atlas.image_tile_allocation_failed(healthy), Some(false));
}

#[test]
fn highlighted_failures_use_the_failed_tile() {
    let mut atlas = atlas_with(ImageAtlasConfig {
        highlight_allocation_failures: true,
        ..ImageAtlasConfig::tiny()
    });
    let (_, mip) = image_with_element(&mut atlas, Extent2::square(2000));
    atlas.flush();
    let element = atlas.mip_element(mip).expect("live element");
    assert_eq!(element.tile_id(TilePos::new(5, 5)), Some(atlas.failed_tile()));
    assert_eq!(color_at(&atlas, mip, 700, 700), [255, 0, 255, 255]);
}

#[test]
fn copy_and_downsample_read_cpu_source() {
    let mut atlas = tiny_atlas();
    let (image, mip) = image_with_element(&mut atlas, Extent2::square(300));
    let source = Arc::new(RgbaImage::from_fn(300, 300, |x, y| {
        ::image::Rgba([x as u8, y as u8, 0, 255])
    }));
    let window = TexelRect::new(0, 0, 300, 300);

    atlas
        .copy_pixels(
            image,
            0,
            window,
            &source,
            BlitRegion::new([0, 0], window),
            BlitProcessing::Copy,
        )
        .expect("copy");
    atlas
        .downsample_pixels(
            image,
            1,
            TexelRect::new(0, 0, 150, 150),
            &source,
            BlitRegion::new([0, 0], window),
            DownsampleMode::Box,
        )
        .expect("downsample");
    atlas.flush();

    assert_eq!(color_at(&atlas, mip, 200, 130), [200, 130, 0, 255]);

    let element = atlas.mip_element(mip).expect("live element");
    let span_x = element.grid().x().tile_span(1, 1);
    let span_y = element.grid().y().tile_span(0, 1);
    let tile = atlas
        .tile_location(mip, TilePos::new(1, 0))
        .expect("tile is backed")
        .at_lod(1);
    let x = (70 - span_x.start) as u32;
    let y = (10 - span_y.start) as u32;
    assert_eq!(
        atlas.color_backing().texel(1, tile.x + x, tile.y + y, tile.layer),
        Some([141, 21, 0, 255])
    );
}

#[test]
fn sub_element_aliases_source_tiles() {
    let mut atlas = tiny_atlas();
    let (_, source) = image_with_element(&mut atlas, Extent2::square(1000));
    let sub = atlas
        .create_sub_mip_element(source, TilePos::new(1, 1), TilePos::new(3, 3))
        .expect("sub element");
    let element = atlas.mip_element(sub).expect("live sub element");
    assert_eq!(element.size(), Extent2::square(250));
    assert_eq!(
        element.tile_id(TilePos::new(0, 0)),
        atlas
            .mip_element(source)
            .and_then(|source| source.tile_id(TilePos::new(1, 1)))
    );

    atlas
        .set_element_pixels(sub, 0, TexelRect::new(10, 10, 1, 1), &[GREEN])
        .expect("write through sub element");
    atlas.flush();
    assert_eq!(color_at(&atlas, source, 134, 134), GREEN);
    assert_eq!(color_at(&atlas, sub, 10, 10), GREEN);
}

#[test]
fn full_mip_chain_reaches_one_texel() {
    let mut atlas = tiny_atlas();
    let image = atlas
        .create_image_of_size(Extent2::square(300), Colorspace::Linear)
        .expect("300x300 image");
    let chain = atlas.fetch_image(image).expect("live image").mip_chain().to_vec();
    let sizes: Vec<_> = chain
        .iter()
        .filter_map(|&mip| atlas.mip_element(mip).map(ImageMipElement::size))
        .collect();
    assert_eq!(
        sizes,
        [300, 75, 19, 5, 2].map(Extent2::square).to_vec()
    );

    let image = atlas
        .create_image_of_size(Extent2::square(256), Colorspace::Linear)
        .expect("256x256 image");
    let chain = atlas.fetch_image(image).expect("live image").mip_chain().to_vec();
    let last = chain.last().and_then(|&mip| atlas.mip_element(mip));
    assert_eq!(last.map(ImageMipElement::number_mipmap_levels), Some(1));
    assert_eq!(chain.len(), 5);
}

#[test]
fn mip_chain_is_validated() {
    let mut atlas = tiny_atlas();
    assert_eq!(
        atlas.create_image(Vec::new(), Colorspace::Linear),
        Err(ImageAtlasError::InvalidMipChain)
    );
    let base = atlas
        .create_mip_element(Extent2::square(64), &TileContents::default())
        .expect("base");
    let wrong = atlas
        .create_mip_element(Extent2::square(32), &TileContents::default())
        .expect("wrong size");
    assert_eq!(
        atlas.create_image(vec![base, wrong], Colorspace::Linear),
        Err(ImageAtlasError::InvalidMipChain)
    );
    let next = atlas
        .create_mip_element(Extent2::square(16), &TileContents::default())
        .expect("next");
    assert!(atlas.create_image(vec![base, next], Colorspace::Linear).is_ok());
}

#[test]
fn flush_grows_backing_for_reserved_texels() {
    let mut atlas = tiny_atlas();
    let edge = u64::from(atlas.config().color_tier.edge_texels());
    assert_eq!(atlas.stats().color_layers, 1);
    atlas.extra_color_backing_texels(edge * edge + 1);
    atlas.flush();
    assert_eq!(atlas.stats().color_layers, 3);
    assert_eq!(atlas.stats().pending_uploads, 0);
    assert_eq!(atlas.color_backing().flush_count(), 1);
    assert_eq!(atlas.index_backing().flush_count(), 1);

    atlas.flush();
    assert_eq!(atlas.stats().color_layers, 3);
}

/// Atlas whose index backing cannot grow past its first layer.
fn atlas_with_one_index_layer() -> CpuImageAtlas {
    let _ = env_logger::builder().is_test(true).try_init();
    let config = ImageAtlasConfig::tiny();
    let color = cpu::CpuColorBacking::new(
        config.color_tier.edge_texels(),
        config.color_tier.max_layers(),
        config.initial_color_layers,
    );
    let index = cpu::CpuIndexBacking::new(config.index_tier.edge_texels(), 1, 1);
    ImageAtlas::new(config, color, index).expect("create atlas with one index layer")
}

/// Takes all but `spare` free blocks of the index layer with 127x127-tile elements, whose single
/// index tile of 128x128 entries fills a block. The block holding the scratch tile stays partial.
fn fill_index_blocks(atlas: &mut CpuImageAtlas, spare: usize) -> Vec<MipElementId> {
    let blocks = atlas.index_allocator().layout().tiles_per_layer() as usize;
    let mut elements = Vec::new();
    for _ in 1..blocks - spare {
        let mip = atlas
            .create_mip_element(Extent2::square(15748), &TileContents::default())
            .expect("create mip element");
        let element = atlas.mip_element(mip).expect("live element");
        assert_eq!(element.tile_count(), TilePos::new(127, 127));
        assert!(!element.tile_allocation_failed());
        assert_eq!(element.number_index_levels(), 1);
        elements.push(mip);
    }
    assert_eq!(atlas.index_allocator().allocated_tile_count(), blocks - spare);
    elements
}

#[test]
fn index_exhaustion_degrades_the_element() {
    let mut atlas = atlas_with_one_index_layer();
    let _full = fill_index_blocks(&mut atlas, 1);
    let index_tiles = atlas.index_allocator().allocated_tile_count();

    // Level one needs two full index tiles; only the first one finds room and is given back.
    let mip = atlas
        .create_mip_element(Extent2::new(31498, 15748), &TileContents::default())
        .expect("exhaustion degrades instead of failing");
    let element = atlas.mip_element(mip).expect("live element");
    assert_eq!(element.tile_count(), TilePos::new(254, 127));
    assert!(element.tile_allocation_failed());
    assert_eq!(element.color_tiles().count(), 0);
    assert_eq!(element.empty_tiles().count(), 254 * 127);
    assert!(
        element
            .grid()
            .iter_tiles()
            .all(|tile| element.tile_id(tile) == Some(atlas.empty_tile()))
    );
    assert_eq!(element.number_index_levels(), 1);
    assert_eq!(atlas.index_allocator().allocated_tile_count(), index_tiles);
    assert_eq!(atlas.index_allocator().number_layers(), 1);

    let scratch = atlas
        .index_tile(atlas.scratch_index_tile())
        .map(IndexTile::location)
        .expect("scratch index tile");
    assert_eq!(atlas.root_index_tile(mip), Ok(scratch));
    let empty = atlas
        .color_tile(atlas.empty_tile())
        .and_then(ColorTile::location)
        .expect("empty tile is backed");
    assert_eq!(atlas.resolve_texel(mip, 300, 5), Ok(Some(empty.offset(52, 5))));
}

#[test]
fn single_tile_root_falls_back_to_scratch_when_index_is_full() {
    let mut atlas = atlas_with_one_index_layer();
    let _full = fill_index_blocks(&mut atlas, 0);
    let scratch = atlas
        .index_tile(atlas.scratch_index_tile())
        .map(IndexTile::location)
        .expect("scratch index tile");

    // Each lazy root takes one 2x2 cell of the partial block next to the scratch tile.
    let cells = (TILE_SIZE as usize / 2).pow(2);
    let mut indexed = Vec::new();
    for _ in 1..cells {
        let mip = atlas
            .create_mip_element(Extent2::square(1), &TileContents::default())
            .expect("create single-tile element");
        assert_ne!(atlas.root_index_tile(mip), Ok(scratch));
        indexed.push(mip);
    }

    let mip = atlas
        .create_mip_element(Extent2::square(1), &TileContents::default())
        .expect("create single-tile element");
    assert_eq!(atlas.root_index_tile(mip), Ok(scratch));
    let element = atlas.mip_element(mip).expect("live element");
    assert!(!element.tile_allocation_failed());
    assert_eq!(element.number_index_levels(), 0);
    assert_eq!(atlas.resolve_texel(mip, 0, 0), Ok(None));

    atlas
        .release_mip_element(indexed[0])
        .expect("release indexed element");
    let root = atlas.root_index_tile(mip).expect("root after release");
    assert_ne!(root, scratch);
    let element = atlas.mip_element(mip).expect("live element");
    assert_eq!(element.number_index_levels(), 1);
    let tile = atlas
        .tile_location(mip, TilePos::new(0, 0))
        .expect("tile is backed");
    assert_eq!(atlas.resolve_texel(mip, 0, 0), Ok(Some(tile)));
}
