//! Tier-based sizing of atlas layers.
//!
//! Every tier is a power-of-two number of full tiles per layer edge and a power-of-two hard
//! limit on texture array layers. The tier name is the log2 of the full-tile capacity:
//! - Tiny8:    8×8 tiles × 4 layers = 256 tiles
//! - Small11:  16×16 tiles × 8 layers = 2,048 tiles
//! - Medium14: 32×32 tiles × 16 layers = 16,384 tiles

use model::{TILE_SIZE, TILE_SIZE_LOG2};

/// A power-of-2 unsigned 16-bit value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pow2U16(u16);

impl Pow2U16 {
    /// Panics (at compile time when used in const context) if `value` is not a power of 2.
    pub const fn new(value: u16) -> Self {
        assert!(
            value != 0 && (value & (value - 1)) == 0,
            "value must be a non-zero power of 2"
        );
        Pow2U16(value)
    }

    pub const fn get_u32(self) -> u32 {
        self.0 as u32
    }

    pub const fn log2(self) -> u32 {
        self.0.trailing_zeros()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierAtlasLayout {
    /// Full tiles along each edge of a layer.
    tiles_per_edge: Pow2U16,
    /// Hard limit on texture array layers.
    max_layers: Pow2U16,
}

impl TierAtlasLayout {
    pub const fn tiles_per_edge(self) -> u32 {
        self.tiles_per_edge.get_u32()
    }

    /// Width and height of one layer in texels.
    pub const fn edge_texels(self) -> u32 {
        self.tiles_per_edge.get_u32() * TILE_SIZE
    }

    pub const fn edge_texels_log2(self) -> u32 {
        self.tiles_per_edge.log2() + TILE_SIZE_LOG2
    }

    pub const fn tiles_per_layer(self) -> u32 {
        let n = self.tiles_per_edge.get_u32();
        n * n
    }

    pub const fn texels_per_layer(self) -> u64 {
        let edge = self.edge_texels() as u64;
        edge * edge
    }

    pub const fn max_layers(self) -> u32 {
        self.max_layers.get_u32()
    }

    pub const fn capacity_tiles(self) -> u32 {
        self.tiles_per_layer() * self.max_layers()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AtlasTier {
    /// 8×8 tiles × 4 layers (2^8)
    Tiny8,
    /// 16×16 tiles × 8 layers (2^11)
    Small11,
    /// 32×32 tiles × 16 layers (2^14)
    #[default]
    Medium14,
    /// 64×64 tiles × 32 layers (2^17)
    Large17,
    /// 128×128 tiles × 64 layers (2^20)
    Huge20,
}

impl AtlasTier {
    pub const fn layout(self) -> TierAtlasLayout {
        let (tiles_per_edge, max_layers) = match self {
            AtlasTier::Tiny8 => (8, 4),
            AtlasTier::Small11 => (16, 8),
            AtlasTier::Medium14 => (32, 16),
            AtlasTier::Large17 => (64, 32),
            AtlasTier::Huge20 => (128, 64),
        };
        TierAtlasLayout {
            tiles_per_edge: Pow2U16::new(tiles_per_edge),
            max_layers: Pow2U16::new(max_layers),
        }
    }

    pub const fn capacity_tiles(self) -> u32 {
        self.layout().capacity_tiles()
    }

    pub const fn edge_texels(self) -> u32 {
        self.layout().edge_texels()
    }

    pub const fn max_layers(self) -> u32 {
        self.layout().max_layers()
    }
}
