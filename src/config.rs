//! Engine tunables. Loading them from an environment is the embedder's business;
//! the engine only reads them.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::device::FenceKind;

/// Bytes of GPU memory assumed per display pixel before the driver starts paging.
pub const BEFORE_PAGING_CONSTANT: usize = 600;

/// Estimates how many texture bytes a device can hold before paging, from its display size.
#[inline]
pub fn bytes_before_paging(width: usize, height: usize, pixel_ratio: f32) -> usize {
    let pixels = (width * height) as f32 * pixel_ratio;
    (pixels as usize) * BEFORE_PAGING_CONSTANT
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct Flags {
    /// Caps the device's maximum texture size. `None` uses the device limit.
    pub max_texture_size: Option<usize>,
    /// Longest edge allowed for textures only 1 (2 if packed) texel thick.
    /// `None` allows any, unless [`Flags::auto_squarify_narrow_texture`] is set.
    pub max_size_for_narrow_texture: Option<usize>,
    /// Limits narrow textures to half of the maximum texture size.
    pub auto_squarify_narrow_texture: bool,
    /// Lets programs opt in to packed layouts. When off they run unpacked.
    pub pack: bool,
    /// Overrides the detected fp32 render capability.
    pub render_float32: Option<bool>,
    /// Overrides the detected float download capability.
    pub download_float: Option<bool>,
    /// Overrides the detected fence mechanism.
    pub fence: Option<FenceKind>,
    /// Tensors at most this large, not yet on the device, are bound as uniforms.
    pub size_upload_uniform: usize,
    /// Allocated bytes above which released textures are deleted instead of pooled.
    /// `None` never deletes.
    pub delete_texture_threshold: Option<usize>,
    /// Lets programs that opt in pass shapes as uniforms.
    pub use_shape_uniforms: bool,
    /// Fails uploads and reads of values a half float device cannot represent.
    pub check_numerical_problems: bool,
    /// Allocated bytes above which a memory warning is logged once.
    pub memory_warning_bytes: usize,
}

impl Default for Flags {
    fn default() -> Self {
        Self {
            max_texture_size: None,
            max_size_for_narrow_texture: None,
            auto_squarify_narrow_texture: false,
            pack: true,
            render_float32: None,
            download_float: None,
            fence: None,
            size_upload_uniform: 4,
            delete_texture_threshold: None,
            use_shape_uniforms: false,
            check_numerical_problems: false,
            memory_warning_bytes: bytes_before_paging(1920, 1080, 1.0),
        }
    }
}

impl Flags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_texture_size(mut self, size: usize) -> Self {
        self.max_texture_size = Some(size);
        self
    }

    pub fn max_size_for_narrow_texture(mut self, size: usize) -> Self {
        self.max_size_for_narrow_texture = Some(size);
        self
    }

    pub fn auto_squarify_narrow_texture(mut self, enable: bool) -> Self {
        self.auto_squarify_narrow_texture = enable;
        self
    }

    pub fn pack(mut self, enable: bool) -> Self {
        self.pack = enable;
        self
    }

    pub fn render_float32(mut self, enable: bool) -> Self {
        self.render_float32 = Some(enable);
        self
    }

    pub fn download_float(mut self, enable: bool) -> Self {
        self.download_float = Some(enable);
        self
    }

    pub fn fence(mut self, kind: FenceKind) -> Self {
        self.fence = Some(kind);
        self
    }

    pub fn size_upload_uniform(mut self, size: usize) -> Self {
        self.size_upload_uniform = size;
        self
    }

    pub fn delete_texture_threshold(mut self, bytes: Option<usize>) -> Self {
        self.delete_texture_threshold = bytes;
        self
    }

    pub fn use_shape_uniforms(mut self, enable: bool) -> Self {
        self.use_shape_uniforms = enable;
        self
    }

    pub fn check_numerical_problems(mut self, enable: bool) -> Self {
        self.check_numerical_problems = enable;
        self
    }

    pub fn memory_warning_bytes(mut self, bytes: usize) -> Self {
        self.memory_warning_bytes = bytes;
        self
    }
}
