//! Physical tile placement for layered atlas textures.
//!
//! [`TileAllocator`] hands out power-of-two tiles inside the layers of a texture array,
//! [`AtlasTier`] fixes the layer edge and the hard layer limit, and [`SlotTable`] provides the
//! generational slot bookkeeping used for image handles.

mod allocator;
mod id;
mod slots;
mod tier;

pub use allocator::{TileAllocError, TileAllocator};
pub use id::{GenerationId, GenerationTag, Id, SlotId, SlotTag};
pub use slots::{IdError, SlotKey, SlotTable};
pub use tier::{AtlasTier, Pow2U16, TierAtlasLayout};
