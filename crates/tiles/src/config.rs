use atlas::AtlasTier;

/// Construction parameters of an [`ImageAtlas`](crate::ImageAtlas).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageAtlasConfig {
    pub color_tier: AtlasTier,
    pub index_tier: AtlasTier,
    pub initial_color_layers: u32,
    pub initial_index_layers: u32,
    /// Degraded elements point at a magenta tile instead of the transparent one.
    pub highlight_allocation_failures: bool,
}

impl ImageAtlasConfig {
    pub const fn tiny() -> Self {
        Self {
            color_tier: AtlasTier::Tiny8,
            index_tier: AtlasTier::Tiny8,
            initial_color_layers: 1,
            initial_index_layers: 1,
            highlight_allocation_failures: false,
        }
    }

    pub const fn medium() -> Self {
        Self {
            color_tier: AtlasTier::Medium14,
            index_tier: AtlasTier::Small11,
            initial_color_layers: 1,
            initial_index_layers: 1,
            highlight_allocation_failures: false,
        }
    }
}

impl Default for ImageAtlasConfig {
    fn default() -> Self {
        Self::medium()
    }
}
