use atlas::SlotKey;

use crate::mip_element::MipElementId;

/// Generational image handle. A handle to a released image never resolves again, even after its
/// slot is reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageId(pub(crate) SlotKey);

impl ImageId {
    pub fn slot(self) -> u32 {
        self.0.slot().raw()
    }

    pub fn generation(self) -> u32 {
        self.0.generation().raw()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Colorspace {
    #[default]
    Linear,
    Srgb,
}

#[derive(Debug)]
pub struct Image {
    pub(crate) id: ImageId,
    pub(crate) mip_chain: Vec<MipElementId>,
    pub(crate) colorspace: Colorspace,
    pub(crate) opaque: bool,
    pub(crate) default_use_prepadding: bool,
    pub(crate) in_use_marker: u64,
    pub(crate) offscreen_render_index: Option<u32>,
}

impl Image {
    pub fn id(&self) -> ImageId {
        self.id
    }

    /// Element `n` holds LODs `2n` and `2n + 1`.
    pub fn mip_chain(&self) -> &[MipElementId] {
        &self.mip_chain
    }

    pub fn colorspace(&self) -> Colorspace {
        self.colorspace
    }

    pub fn opaque(&self) -> bool {
        self.opaque
    }

    pub fn set_opaque(&mut self, opaque: bool) {
        self.opaque = opaque;
    }

    pub fn default_use_prepadding(&self) -> bool {
        self.default_use_prepadding
    }

    pub fn set_default_use_prepadding(&mut self, value: bool) {
        self.default_use_prepadding = value;
    }

    /// Set for images the renderer draws into; they are not tracked by lock epochs until the
    /// renderer marks them ready.
    pub fn offscreen_render_index(&self) -> Option<u32> {
        self.offscreen_render_index
    }

    /// Whether the image was marked in use during the lock epoch numbered `unlock_count`.
    pub(crate) fn in_use_at(&self, unlock_count: u64) -> bool {
        self.in_use_marker > unlock_count
    }
}
