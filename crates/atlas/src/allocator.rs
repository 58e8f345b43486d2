//! Grid allocator of power-of-two tiles over growable texture array layers.
//!
//! Each layer is divided into blocks of `TILE_SIZE × TILE_SIZE` texels. A full-size tile takes
//! a whole block. Smaller tiles are packed into partially used blocks at offsets aligned to their
//! own size, with occupancy tracked at a granularity of `2^MIN_TILE_SIZE_LOG2` texels so that the
//! half-resolution mip of every tile still owns at least one texel.

use std::collections::HashMap;

use bitvec::prelude::*;
use thiserror::Error;

use model::{MIN_TILE_SIZE_LOG2, TILE_SIZE, TILE_SIZE_LOG2, TileCoordinate};

use crate::tier::{AtlasTier, TierAtlasLayout};

const CELL_LOG2: u32 = MIN_TILE_SIZE_LOG2;
const CELLS_PER_EDGE: usize = (TILE_SIZE >> CELL_LOG2) as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TileAllocError {
    #[error("no room for a {width}x{height} tile in {layers} layer(s)")]
    AtlasFull { width: u32, height: u32, layers: u32 },
    #[error("tile of 2^{log2_width}x2^{log2_height} texels exceeds the tile size")]
    TileTooLarge { log2_width: u32, log2_height: u32 },
    #[error("requested {requested} layers but the tier allows {max}")]
    LayerLimitExceeded { requested: u32, max: u32 },
    #[error("no tile is allocated at {0:?}")]
    UnknownTile(TileCoordinate),
}

#[derive(Debug, Clone)]
enum Block {
    Free,
    Full,
    Partial(BitBox<u64, Lsb0>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Allocation {
    log2_width: u32,
    log2_height: u32,
}

impl Allocation {
    const fn cells(self) -> (usize, usize) {
        (
            1 << (self.log2_width - CELL_LOG2),
            1 << (self.log2_height - CELL_LOG2),
        )
    }

    const fn is_full_block(self) -> bool {
        self.log2_width == TILE_SIZE_LOG2 && self.log2_height == TILE_SIZE_LOG2
    }
}

#[derive(Debug)]
struct Layer {
    blocks: Vec<Block>,
    tile_count: u32,
}

#[derive(Debug)]
pub struct TileAllocator {
    layout: TierAtlasLayout,
    layers: Vec<Layer>,
    allocations: HashMap<TileCoordinate, Allocation>,
}

impl TileAllocator {
    pub fn new(tier: AtlasTier, initial_layers: u32) -> Result<Self, TileAllocError> {
        let mut allocator = Self {
            layout: tier.layout(),
            layers: Vec::new(),
            allocations: HashMap::new(),
        };
        allocator.set_number_layers(initial_layers.max(1))?;
        Ok(allocator)
    }

    pub const fn layout(&self) -> TierAtlasLayout {
        self.layout
    }

    pub fn number_layers(&self) -> u32 {
        self.layers.len() as u32
    }

    pub const fn max_number_layers(&self) -> u32 {
        self.layout.max_layers()
    }

    /// Grows to `layers` layers. Requests below the current count are ignored.
    pub fn set_number_layers(&mut self, layers: u32) -> Result<(), TileAllocError> {
        let max = self.layout.max_layers();
        if layers > max {
            return Err(TileAllocError::LayerLimitExceeded {
                requested: layers,
                max,
            });
        }
        let blocks = self.layout.tiles_per_layer() as usize;
        while self.layers.len() < layers as usize {
            self.layers.push(Layer {
                blocks: vec![Block::Free; blocks],
                tile_count: 0,
            });
        }
        Ok(())
    }

    /// Edge of a layer in texels and the number of layers that hold at least one tile.
    pub fn required_backing_size(&self) -> (u32, u32) {
        let used = self
            .layers
            .iter()
            .rposition(|layer| layer.tile_count > 0)
            .map_or(0, |index| index as u32 + 1);
        (self.layout.edge_texels(), used)
    }

    pub fn allocated_tile_count(&self) -> usize {
        self.allocations.len()
    }

    pub fn allocate_tile(
        &mut self,
        log2_width: u32,
        log2_height: u32,
    ) -> Result<TileCoordinate, TileAllocError> {
        if log2_width > TILE_SIZE_LOG2 || log2_height > TILE_SIZE_LOG2 {
            return Err(TileAllocError::TileTooLarge {
                log2_width,
                log2_height,
            });
        }
        let allocation = Allocation {
            log2_width: log2_width.max(CELL_LOG2),
            log2_height: log2_height.max(CELL_LOG2),
        };
        let tiles_per_edge = self.layout.tiles_per_edge();
        for (layer_index, layer) in self.layers.iter_mut().enumerate() {
            let Some((block_index, cell)) = place_in_layer(layer, allocation) else {
                continue;
            };
            layer.tile_count += 1;
            let block_index = block_index as u32;
            let coordinate = TileCoordinate::new(
                (block_index % tiles_per_edge) * TILE_SIZE + ((cell.0 as u32) << CELL_LOG2),
                (block_index / tiles_per_edge) * TILE_SIZE + ((cell.1 as u32) << CELL_LOG2),
                layer_index as u32,
            );
            self.allocations.insert(coordinate, allocation);
            return Ok(coordinate);
        }
        Err(TileAllocError::AtlasFull {
            width: 1 << allocation.log2_width,
            height: 1 << allocation.log2_height,
            layers: self.number_layers(),
        })
    }

    /// Frees the tile of `2^log2_width × 2^log2_height` texels at `coordinate`. A release that
    /// does not match the live allocation at that spot is rejected and frees nothing.
    pub fn release_tile(
        &mut self,
        coordinate: TileCoordinate,
        log2_width: u32,
        log2_height: u32,
    ) -> Result<(), TileAllocError> {
        let requested = Allocation {
            log2_width: log2_width.max(CELL_LOG2),
            log2_height: log2_height.max(CELL_LOG2),
        };
        let allocation = match self.allocations.get(&coordinate) {
            Some(&allocation) if allocation == requested => allocation,
            _ => return Err(TileAllocError::UnknownTile(coordinate)),
        };
        self.allocations.remove(&coordinate);
        let tiles_per_edge = self.layout.tiles_per_edge();
        let layer = &mut self.layers[coordinate.layer as usize];
        layer.tile_count -= 1;
        let block_index =
            ((coordinate.y / TILE_SIZE) * tiles_per_edge + coordinate.x / TILE_SIZE) as usize;
        let block = &mut layer.blocks[block_index];
        if allocation.is_full_block() {
            *block = Block::Free;
            return Ok(());
        }
        let Block::Partial(bits) = block else {
            log::error!("released sub-tile at {coordinate:?} lives in an unpartitioned block");
            return Ok(());
        };
        let cell = (
            ((coordinate.x % TILE_SIZE) >> CELL_LOG2) as usize,
            ((coordinate.y % TILE_SIZE) >> CELL_LOG2) as usize,
        );
        mark_cells(bits, cell, allocation.cells(), false);
        if bits.not_any() {
            *block = Block::Free;
        }
        Ok(())
    }
}

fn place_in_layer(layer: &mut Layer, allocation: Allocation) -> Option<(usize, (usize, usize))> {
    let cells = allocation.cells();
    if !allocation.is_full_block() {
        for (index, block) in layer.blocks.iter_mut().enumerate() {
            if let Block::Partial(bits) = block
                && let Some(cell) = find_free_cells(bits, cells)
            {
                mark_cells(bits, cell, cells, true);
                return Some((index, cell));
            }
        }
    }
    let index = layer
        .blocks
        .iter()
        .position(|block| matches!(block, Block::Free))?;
    if allocation.is_full_block() {
        layer.blocks[index] = Block::Full;
    } else {
        let mut bits = bitbox![u64, Lsb0; 0; CELLS_PER_EDGE * CELLS_PER_EDGE];
        mark_cells(&mut bits, (0, 0), cells, true);
        layer.blocks[index] = Block::Partial(bits);
    }
    Some((index, (0, 0)))
}

fn find_free_cells(bits: &BitSlice<u64, Lsb0>, cells: (usize, usize)) -> Option<(usize, usize)> {
    for y in (0..CELLS_PER_EDGE).step_by(cells.1) {
        for x in (0..CELLS_PER_EDGE).step_by(cells.0) {
            let free = (y..y + cells.1).all(|row| {
                let start = row * CELLS_PER_EDGE + x;
                bits[start..start + cells.0].not_any()
            });
            if free {
                return Some((x, y));
            }
        }
    }
    None
}

fn mark_cells(
    bits: &mut BitSlice<u64, Lsb0>,
    origin: (usize, usize),
    cells: (usize, usize),
    value: bool,
) {
    for row in origin.1..origin.1 + cells.1 {
        let start = row * CELLS_PER_EDGE + origin.0;
        bits[start..start + cells.0].fill(value);
    }
}
