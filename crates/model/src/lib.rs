use static_assertions::const_assert;

mod tiling;

pub use tiling::{AxisTiling, TileGrid, TileSpan, TilingError};

pub const TILE_SIZE_LOG2: u32 = 7;
pub const TILE_SIZE: u32 = 1 << TILE_SIZE_LOG2;
pub const TILE_PADDING: u32 = 2;
pub const TILE_SIZE_WITHOUT_PADDING: u32 = TILE_SIZE - 2 * TILE_PADDING;
/// Smallest edge the tile allocator hands out; keeps LOD 1 of a tile at least one texel wide.
pub const MIN_TILE_SIZE_LOG2: u32 = 1;
pub const MAX_MIP_LEVELS: u32 = 16;
/// Each mip element stores two consecutive LODs.
pub const LODS_PER_MIP_ELEMENT: u32 = 2;

const_assert!(TILE_SIZE.is_power_of_two());
const_assert!(TILE_PADDING % 2 == 0);
const_assert!(4 * TILE_PADDING < TILE_SIZE);
const_assert!(TILE_SIZE_WITHOUT_PADDING % 2 == 0);
const_assert!(MIN_TILE_SIZE_LOG2 <= TILE_SIZE_LOG2);
const_assert!(MAX_MIP_LEVELS % LODS_PER_MIP_ELEMENT == 0);

/// Position of a tile inside a tile grid, or a grid dimension.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct TilePos {
    pub x: u32,
    pub y: u32,
}

impl TilePos {
    pub const fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }

    pub const fn area(self) -> usize {
        self.x as usize * self.y as usize
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct Extent2 {
    pub width: u32,
    pub height: u32,
}

impl Extent2 {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub const fn square(edge: u32) -> Self {
        Self {
            width: edge,
            height: edge,
        }
    }

    pub const fn is_empty(self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub const fn texel_count(self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Size of the next coarser LOD, rounding up so no LOD collapses to zero.
    pub const fn half_rounded_up(self) -> Self {
        Self {
            width: self.width.div_ceil(2),
            height: self.height.div_ceil(2),
        }
    }

    pub const fn at_lod(self, lod: u32) -> Self {
        let mut size = self;
        let mut remaining = lod;
        while remaining > 0 {
            size = size.half_rounded_up();
            remaining -= 1;
        }
        size
    }

    pub const fn fits_in_tile(self) -> bool {
        self.width <= TILE_SIZE && self.height <= TILE_SIZE
    }
}

/// Axis aligned texel rectangle, `[x, x + width) × [y, y + height)`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct TexelRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl TexelRect {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub const fn from_extent(size: Extent2) -> Self {
        Self::new(0, 0, size.width, size.height)
    }

    pub const fn size(self) -> Extent2 {
        Extent2::new(self.width, self.height)
    }

    pub const fn is_empty(self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub const fn right(self) -> u32 {
        self.x + self.width
    }

    pub const fn bottom(self) -> u32 {
        self.y + self.height
    }

    pub fn contains(self, x: u32, y: u32) -> bool {
        x >= self.x && y >= self.y && x < self.right() && y < self.bottom()
    }

    pub fn contains_rect(self, other: TexelRect) -> bool {
        other.x >= self.x
            && other.y >= self.y
            && other.right() <= self.right()
            && other.bottom() <= self.bottom()
    }

    pub fn intersection(self, other: TexelRect) -> Option<TexelRect> {
        let x0 = self.x.max(other.x);
        let y0 = self.y.max(other.y);
        let x1 = self.right().min(other.right());
        let y1 = self.bottom().min(other.bottom());
        if x0 >= x1 || y0 >= y1 {
            return None;
        }
        Some(TexelRect::new(x0, y0, x1 - x0, y1 - y0))
    }
}

/// Texel origin of a tile inside a layered backing store.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct TileCoordinate {
    pub x: u32,
    pub y: u32,
    pub layer: u32,
}

impl TileCoordinate {
    pub const fn new(x: u32, y: u32, layer: u32) -> Self {
        Self { x, y, layer }
    }

    pub const fn offset(self, dx: u32, dy: u32) -> Self {
        Self {
            x: self.x + dx,
            y: self.y + dy,
            layer: self.layer,
        }
    }

    /// Location of the same texel block at a coarser LOD of the backing.
    pub const fn at_lod(self, lod: u32) -> Self {
        Self {
            x: self.x >> lod,
            y: self.y >> lod,
            layer: self.layer,
        }
    }
}

pub const fn ceil_log2(value: u32) -> u32 {
    if value <= 1 {
        0
    } else {
        u32::BITS - (value - 1).leading_zeros()
    }
}
