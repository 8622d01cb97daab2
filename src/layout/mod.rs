//! Maps logical tensor shapes onto 2-D textures.
//!
//! Unpacked textures store one value per texel in row-major order. Packed textures store the
//! 2×2 block `(r, c), (r, c+1), (r+1, c), (r+1, c+1)` of one batch in the four channels of a
//! texel; texels are ordered by batch, then row pair, then column pair. Both orders are flat,
//! so the planned [`PhysicalShape`] only has to be large enough to hold them.

use derive_more::Display;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::shape::Shape;

pub mod texel;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LayoutError {
    #[error("requested texture size [{rows}x{cols}] greater than the device maximum [{max}x{max}]")]
    ResourceLimitExceeded { rows: usize, cols: usize, max: usize },
}

/// Rows and columns of the logical texture backing a tensor.
///
/// For packed tensors these count scalars; see [`PhysicalShape::texels`] for the texture itself.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[display("[{rows}, {cols}]")]
pub struct PhysicalShape {
    pub rows: usize,
    pub cols: usize,
}

impl PhysicalShape {
    #[inline]
    pub const fn new(rows: usize, cols: usize) -> Self {
        Self { rows, cols }
    }

    /// Dimensions of the texture in texels.
    #[inline]
    pub const fn texels(self, packed: bool) -> Self {
        match packed {
            true => Self::new(self.rows.div_ceil(2), self.cols.div_ceil(2)),
            false => self,
        }
    }

    #[inline]
    pub const fn size(self) -> usize {
        self.rows * self.cols
    }
}

/// Device limits consulted by [`plan_layout`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureLimits {
    pub max_texture_size: usize,
    pub max_size_for_narrow_texture: usize,
}

impl TextureLimits {
    #[inline]
    pub const fn new(max_texture_size: usize) -> Self {
        Self {
            max_texture_size,
            max_size_for_narrow_texture: usize::MAX,
        }
    }
}

/// What a texture is used for. Decides its [`PhysicalFormat`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum TextureUsage {
    #[default]
    Render,
    Upload,
    Pixels,
    Download,
}

/// Texel format of a pooled texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum PhysicalFormat {
    UnpackedF16,
    UnpackedF32,
    PackedF16,
    PackedF32,
    PackedU8,
}

impl PhysicalFormat {
    /// Picks the format for a texture of `usage`.
    pub fn new(usage: TextureUsage, packed: bool, render_float32: bool) -> Self {
        match (usage, packed) {
            (TextureUsage::Render, true) if render_float32 => Self::PackedF32,
            (TextureUsage::Render, true) => Self::PackedF16,
            (TextureUsage::Render, false) if render_float32 => Self::UnpackedF32,
            (TextureUsage::Render, false) => Self::UnpackedF16,
            (TextureUsage::Upload, true) => Self::PackedF32,
            (TextureUsage::Upload, false) => Self::UnpackedF32,
            (TextureUsage::Pixels | TextureUsage::Download, _) => Self::PackedU8,
        }
    }

    /// Number of channels in one texel. Unpacked formats carry `unpacked_channels`.
    #[inline]
    pub const fn channels(self, unpacked_channels: usize) -> usize {
        match self {
            Self::UnpackedF16 | Self::UnpackedF32 => unpacked_channels,
            Self::PackedF16 | Self::PackedF32 | Self::PackedU8 => 4,
        }
    }

    #[inline]
    pub const fn bytes_per_channel(self) -> usize {
        match self {
            Self::UnpackedF16 | Self::PackedF16 => 2,
            Self::UnpackedF32 | Self::PackedF32 => 4,
            Self::PackedU8 => 1,
        }
    }

    #[inline]
    pub const fn bytes_per_texel(self, unpacked_channels: usize) -> usize {
        self.channels(unpacked_channels) * self.bytes_per_channel()
    }
}

/// Bytes taken by a texture of `shape` in `format`.
#[inline]
pub fn texture_bytes(
    shape: PhysicalShape,
    format: PhysicalFormat,
    packed: bool,
    unpacked_channels: usize,
) -> usize {
    shape.texels(packed).size() * format.bytes_per_texel(unpacked_channels)
}

/// Product of every dimension but the innermost two.
#[inline]
pub fn batch_dim(shape: &[usize]) -> usize {
    match shape.len() {
        0..=2 => 1,
        n => shape[..n - 2].iter().product(),
    }
}

/// The innermost two dimensions, with missing ones as 1.
#[inline]
pub fn rows_cols(shape: &[usize]) -> (usize, usize) {
    match shape {
        [] => (1, 1),
        [cols] => (1, *cols),
        [.., rows, cols] => (*rows, *cols),
    }
}

/// Packed geometry of a shape: `(batch, texels per logical row, texels per batch)`.
#[inline]
pub fn packed_geometry(shape: &[usize]) -> (usize, usize, usize) {
    let (rows, cols) = rows_cols(shape);
    let row_texels = cols.div_ceil(2);
    (batch_dim(shape), row_texels, rows.div_ceil(2) * row_texels)
}

/// Near-square `(rows, cols)` holding at least `size` cells.
pub fn squarish(size: usize) -> (usize, usize) {
    let width = (size as f64).sqrt().ceil() as usize;
    match width {
        0 => (0, 0),
        width => (width, size.div_ceil(width)),
    }
}

#[inline]
fn nearest_larger_even(x: usize) -> usize {
    x + x % 2
}

/// Picks the texture shape for a tensor of `shape`.
///
/// Fails with [`LayoutError::ResourceLimitExceeded`] when no layout fits the device.
pub fn plan_layout(
    shape: &[usize],
    packed: bool,
    limits: TextureLimits,
) -> Result<PhysicalShape, LayoutError> {
    let mut max = limits.max_texture_size;
    let mut max_narrow = limits.max_size_for_narrow_texture;

    let mut shape = shape.to_vec();
    if packed {
        max = max.saturating_mul(2);
        max_narrow = max_narrow.saturating_mul(2);

        // a dangling row or column still takes a full texel
        let len = shape.len();
        for (axis, d) in shape.iter_mut().enumerate() {
            if axis + 2 >= len {
                *d = nearest_larger_even(*d);
            }
        }
        if len == 1 {
            shape.insert(0, 2);
        }
    }

    if shape.len() != 2 {
        shape = Shape::from(shape).squeeze().0;
    }
    let size: usize = shape.iter().product();

    let planned = match shape[..] {
        [] | [_] if size <= max => Some((1, size)),
        [r, c] if r <= max && c <= max => Some((r, c)),
        [a, b, c] if a * b <= max && c <= max => Some((a * b, c)),
        [a, b, c] if a <= max && b * c <= max => Some((a, b * c)),
        [a, b, c, d] if a * b * c <= max && d <= max => Some((a * b * c, d)),
        [a, b, c, d] if a <= max && b * c * d <= max => Some((a, b * c * d)),
        _ => None,
    };

    let narrow = planned.is_some_and(|(r, c)| {
        let thin = if packed { 2 } else { 1 };
        r.max(c) > max_narrow && r.min(c) <= thin && r.min(c) > 0
    });

    let (rows, cols) = match planned {
        Some(planned) if !narrow => planned,
        _ if packed => {
            let (rows, cols) = rows_cols(&shape);
            let (rows, cols) = squarish(batch_dim(&shape) * (rows / 2) * (cols / 2));
            (rows * 2, cols * 2)
        }
        _ => squarish(size),
    };

    let shape = PhysicalShape::new(rows, cols);
    let texels = shape.texels(packed);
    let max = limits.max_texture_size;
    if texels.rows > max || texels.cols > max {
        return Err(LayoutError::ResourceLimitExceeded {
            rows: texels.rows,
            cols: texels.cols,
            max,
        });
    }
    Ok(shape)
}

/// Returns `true` if a packed texture laid out for `a` can be read as `b` without moving data.
pub fn is_reshape_free(a: &[usize], b: &[usize]) -> bool {
    let a = &a[a.len().saturating_sub(2)..];
    let b = &b[b.len().saturating_sub(2)..];

    if a == b {
        return true;
    }
    if a.is_empty() || b.is_empty() {
        return true;
    }
    if a.contains(&0) || b.contains(&0) {
        return true;
    }

    let even = |x: usize| x % 2 == 0;
    if a.len() != b.len() {
        let (a_cols, b_cols) = (a[a.len() - 1], b[b.len() - 1]);
        if a_cols == b_cols {
            return true;
        }
        if even(a_cols) && even(b_cols) && (a[0] == 1 || b[0] == 1) {
            return true;
        }
    }
    a.len() == 2 && b.len() == 2 && a[1] == b[1] && even(a[0]) && even(b[0])
}
