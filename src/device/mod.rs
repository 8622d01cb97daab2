//! Raw device primitives. A [`Device`] knows nothing about tensors: it creates textures and
//! programs, draws the quad, and moves pixels.

use derive_more::Display;
use itertools::Itertools;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::layout::PhysicalFormat;

pub use gpu::{Gpu, GpuBuildError, GpuBuilder};

pub mod gpu;
#[cfg(test)]
pub mod mock;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display)]
#[display("texture#{_0}")]
pub struct TextureId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[display("program#{_0}")]
pub struct ProgramId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[display("fence#{_0}")]
pub struct FenceId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[display("pixels#{_0}")]
pub struct PixelBufferId(pub usize);

/// Positions (xyz) and texture coordinates (uv) of the full-viewport quad.
#[rustfmt::skip]
pub const QUAD_VERTICES: [f32; 20] = [
    -1.0,  1.0, 0.0, 0.0, 1.0,
    -1.0, -1.0, 0.0, 0.0, 0.0,
     1.0,  1.0, 0.0, 1.0, 1.0,
     1.0, -1.0, 0.0, 1.0, 0.0,
];

/// Two triangles covering the quad.
pub const QUAD_INDICES: [u16; 6] = [0, 1, 2, 2, 1, 3];

#[derive(Debug, Display, Clone)]
pub enum DeviceError {
    #[display("failed to create {resource}: {reason}")]
    ResourceCreationFailed {
        resource: &'static str,
        reason: String,
    },
    #[display("failed to compile program {label}: {message}\n{source}")]
    LinkOrCompileFailure {
        label: String,
        message: String,
        /// The full source with the offending line marked.
        source: String,
    },
    #[display("unknown device handle: {_0}")]
    UnknownHandle(String),
    #[display("device error: {_0}")]
    Backend(String),
}

impl std::error::Error for DeviceError {}

/// How completion of submitted work is detected.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum FenceKind {
    /// A GPU-side fence signaled when prior work retires.
    #[default]
    Native,
    /// A timestamp query whose resolved result becomes readable when prior work retires.
    TimerQuery,
    /// No mechanism; every fence counts as signaled.
    Immediate,
}

/// What the device can do. Queried once per device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub max_texture_size: usize,
    /// Single channel float textures can be rendered to.
    pub single_channel_float: bool,
    /// 32-bit float textures can be rendered to; otherwise 16-bit ones are.
    pub render_float32: bool,
    /// Float textures can be read back directly.
    pub download_float: bool,
    pub native_fence: bool,
    pub timer_query: bool,
}

impl Capabilities {
    /// Channels of an unpacked float texel.
    #[inline]
    pub const fn unpacked_channels(&self) -> usize {
        match self.single_channel_float {
            true => 1,
            false => 4,
        }
    }

    /// Picks the best available fence mechanism.
    #[inline]
    pub const fn fence(&self) -> FenceKind {
        match (self.native_fence, self.timer_query) {
            (true, _) => FenceKind::Native,
            (false, true) => FenceKind::TimerQuery,
            (false, false) => FenceKind::Immediate,
        }
    }
}

/// Texel format of a device texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum TextureFormat {
    R16Float,
    R32Float,
    Rgba16Float,
    Rgba32Float,
    Rgba8Unorm,
}

impl TextureFormat {
    pub const fn new(format: PhysicalFormat, unpacked_channels: usize) -> Self {
        match (format, unpacked_channels) {
            (PhysicalFormat::UnpackedF16, 1) => Self::R16Float,
            (PhysicalFormat::UnpackedF32, 1) => Self::R32Float,
            (PhysicalFormat::UnpackedF16, _) | (PhysicalFormat::PackedF16, _) => Self::Rgba16Float,
            (PhysicalFormat::UnpackedF32, _) | (PhysicalFormat::PackedF32, _) => Self::Rgba32Float,
            (PhysicalFormat::PackedU8, _) => Self::Rgba8Unorm,
        }
    }

    #[inline]
    pub const fn channels(self) -> usize {
        match self {
            Self::R16Float | Self::R32Float => 1,
            Self::Rgba16Float | Self::Rgba32Float | Self::Rgba8Unorm => 4,
        }
    }

    #[inline]
    pub const fn bytes_per_texel(self) -> usize {
        match self {
            Self::R16Float => 2,
            Self::R32Float | Self::Rgba8Unorm => 4,
            Self::Rgba16Float => 8,
            Self::Rgba32Float => 16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
}

/// Shader stages and binding counts of a program.
#[derive(Debug, Clone, Copy)]
pub struct ProgramDesc<'a> {
    pub label: &'a str,
    pub vertex: &'a str,
    pub fragment: &'a str,
    /// Number of textures bound after the uniform block.
    pub textures: usize,
    /// Size in bytes of the uniform block.
    pub uniform_size: usize,
}

/// A rectangle in texels.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Everything one quad draw needs.
#[derive(Debug, Clone, Copy)]
pub struct DrawCall<'a> {
    pub program: ProgramId,
    pub target: TextureId,
    pub viewport: Rect,
    pub scissor: Rect,
    /// Input textures, one per texture unit.
    pub textures: &'a [TextureId],
    /// The uniform block.
    pub uniforms: &'a [u8],
}

/// Primitives of one graphics device.
///
/// Calls are made from a single thread; implementors may use interior mutability freely.
pub trait Device {
    fn capabilities(&self) -> Capabilities;

    fn create_texture(&self, desc: TextureDesc) -> Result<TextureId, DeviceError>;
    /// Replaces the whole contents of a texture with tightly packed texel data.
    fn upload_texture(&self, texture: TextureId, data: &[u8]) -> Result<(), DeviceError>;
    fn delete_texture(&self, texture: TextureId);

    /// Compiles both stages and links them.
    fn create_program(&self, desc: &ProgramDesc) -> Result<ProgramId, DeviceError>;
    fn delete_program(&self, program: ProgramId);

    /// Draws the quad with `program` into `target`.
    fn draw(&self, call: &DrawCall) -> Result<(), DeviceError>;

    /// Starts copying the whole texture into a host-visible pixel buffer.
    fn read_pixels(&self, texture: TextureId) -> Result<PixelBufferId, DeviceError>;
    /// Returns the tightly packed texel bytes of a pixel buffer and frees it.
    /// Blocks if the copy has not completed.
    fn map_pixels(&self, buffer: PixelBufferId) -> Result<Vec<u8>, DeviceError>;
    /// Frees a pixel buffer that will never be mapped.
    fn delete_pixels(&self, buffer: PixelBufferId);

    fn create_fence(&self, kind: FenceKind) -> Result<FenceId, DeviceError>;
    /// Non-blocking check of a fence.
    fn poll_fence(&self, fence: FenceId) -> Result<bool, DeviceError>;
    fn delete_fence(&self, fence: FenceId);

    /// Blocks until all submitted work has completed.
    fn wait(&self) -> Result<(), DeviceError>;
}

/// Numbers every line of `source` and marks `line` (1-based).
pub fn annotate_source(source: &str, line: Option<usize>) -> String {
    let width = source.lines().count().to_string().len();
    source
        .lines()
        .enumerate()
        .map(|(index, text)| {
            let number = index + 1;
            let marker = match Some(number) == line {
                true => ">>>",
                false => "   ",
            };
            format!("{marker} {number:>width$} | {text}")
        })
        .join("\n")
}
