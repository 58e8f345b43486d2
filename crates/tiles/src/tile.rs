use model::{Extent2, TileCoordinate, ceil_log2};
use slotmap::new_key_type;

use crate::IndexTexel;

new_key_type! {
    pub struct ColorTileId;
    pub struct IndexTileId;
}

/// Physical placement of a tile. A tile starts `Reserved` and becomes `Backed` at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileBacking {
    Reserved,
    Backed(TileCoordinate),
}

/// What a color tile holds. Everything except `Data` is one of the atlas-wide shared tiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColorTileKind {
    Data,
    Empty,
    White,
    Failed,
}

#[derive(Debug)]
pub struct ColorTile {
    size: Extent2,
    kind: ColorTileKind,
    backing: TileBacking,
    ref_count: u32,
}

impl ColorTile {
    pub(crate) fn reserved(size: Extent2, kind: ColorTileKind) -> Self {
        debug_assert!(size.width.is_power_of_two() && size.height.is_power_of_two());
        Self {
            size,
            kind,
            backing: TileBacking::Reserved,
            ref_count: 1,
        }
    }

    /// Allocated extent, a power of two on both axes.
    pub fn size(&self) -> Extent2 {
        self.size
    }

    pub fn log2_size(&self) -> (u32, u32) {
        (ceil_log2(self.size.width), ceil_log2(self.size.height))
    }

    pub fn kind(&self) -> ColorTileKind {
        self.kind
    }

    pub fn backing(&self) -> TileBacking {
        self.backing
    }

    pub fn location(&self) -> Option<TileCoordinate> {
        match self.backing {
            TileBacking::Reserved => None,
            TileBacking::Backed(location) => Some(location),
        }
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }

    /// Records the allocated location. Returns `false` if the tile was already backed.
    pub(crate) fn set_backing(&mut self, location: TileCoordinate) -> bool {
        if let TileBacking::Backed(existing) = self.backing {
            debug_assert_eq!(existing, location, "tile location never changes");
            return false;
        }
        self.backing = TileBacking::Backed(location);
        true
    }

    pub(crate) fn acquire(&mut self) {
        self.ref_count += 1;
    }

    /// Drops one reference; returns `true` when it was the last one.
    pub(crate) fn release(&mut self) -> bool {
        debug_assert!(self.ref_count > 0, "color tile released too often");
        self.ref_count = self.ref_count.saturating_sub(1);
        self.ref_count == 0
    }
}

/// One node of an index pyramid, holding `entries` coordinates into the level below.
#[derive(Debug)]
pub struct IndexTile {
    size: Extent2,
    entries: Extent2,
    location: TileCoordinate,
    texels: Vec<IndexTexel>,
}

impl IndexTile {
    pub(crate) fn new(entries: Extent2, location: TileCoordinate) -> Self {
        let size = Extent2::new(
            entries.width.next_power_of_two(),
            entries.height.next_power_of_two(),
        );
        Self {
            size,
            entries,
            location,
            texels: vec![IndexTexel::default(); size.texel_count()],
        }
    }

    pub fn size(&self) -> Extent2 {
        self.size
    }

    pub fn log2_size(&self) -> (u32, u32) {
        (ceil_log2(self.size.width), ceil_log2(self.size.height))
    }

    pub fn entries(&self) -> Extent2 {
        self.entries
    }

    pub fn location(&self) -> TileCoordinate {
        self.location
    }

    pub fn texels(&self) -> &[IndexTexel] {
        &self.texels
    }

    pub fn entry(&self, x: u32, y: u32) -> Option<IndexTexel> {
        if x >= self.size.width || y >= self.size.height {
            return None;
        }
        self.texels
            .get(y as usize * self.size.width as usize + x as usize)
            .copied()
    }

    pub(crate) fn set_entry(&mut self, x: u32, y: u32, texel: IndexTexel) {
        let index = y as usize * self.size.width as usize + x as usize;
        if let Some(slot) = self.texels.get_mut(index) {
            *slot = texel;
        }
    }
}
