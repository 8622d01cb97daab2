use derive_more::{Display, From};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::{layout::TextureUsage, shape::Shape};

/// WGSL type of a uniform member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum UniformType {
    #[display("f32")]
    F32,
    #[display("vec2<f32>")]
    Vec2,
    #[display("vec3<f32>")]
    Vec3,
    #[display("vec4<f32>")]
    Vec4,
    #[display("i32")]
    I32,
    #[display("vec2<i32>")]
    IVec2,
    #[display("vec3<i32>")]
    IVec3,
    #[display("vec4<i32>")]
    IVec4,
    /// Small tensor values, four per element.
    #[display("array<vec4<f32>, {_0}>")]
    Array(usize),
}

impl UniformType {
    /// Integer vector holding a shape of `rank` dimensions (1 to 4).
    #[inline]
    pub const fn shape(rank: usize) -> Self {
        match rank {
            0 | 1 => Self::I32,
            2 => Self::IVec2,
            3 => Self::IVec3,
            _ => Self::IVec4,
        }
    }

    #[inline]
    pub const fn size(self) -> usize {
        match self {
            Self::F32 | Self::I32 => 4,
            Self::Vec2 | Self::IVec2 => 8,
            Self::Vec3 | Self::IVec3 => 12,
            Self::Vec4 | Self::IVec4 => 16,
            Self::Array(len) => 16 * len,
        }
    }

    /// Alignment in the uniform address space.
    #[inline]
    pub const fn align(self) -> usize {
        match self {
            Self::F32 | Self::I32 => 4,
            Self::Vec2 | Self::IVec2 => 8,
            Self::Vec3 | Self::IVec3 | Self::Vec4 | Self::IVec4 | Self::Array(_) => 16,
        }
    }
}

/// A uniform a program declares for itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct UniformDecl {
    pub name: String,
    pub ty: UniformType,
}

impl UniformDecl {
    pub fn new(name: impl Into<String>, ty: UniformType) -> Self {
        let name = name.into();
        Self { name, ty }
    }
}

#[derive(Debug, Clone, PartialEq, From)]
pub enum UniformValue {
    F32(f32),
    Vec2([f32; 2]),
    Vec3([f32; 3]),
    Vec4([f32; 4]),
    I32(i32),
    IVec2([i32; 2]),
    IVec3([i32; 3]),
    IVec4([i32; 4]),
    #[from(skip)]
    Array(Vec<f32>),
}

impl UniformValue {
    pub fn ty(&self) -> UniformType {
        match self {
            Self::F32(_) => UniformType::F32,
            Self::Vec2(_) => UniformType::Vec2,
            Self::Vec3(_) => UniformType::Vec3,
            Self::Vec4(_) => UniformType::Vec4,
            Self::I32(_) => UniformType::I32,
            Self::IVec2(_) => UniformType::IVec2,
            Self::IVec3(_) => UniformType::IVec3,
            Self::IVec4(_) => UniformType::IVec4,
            Self::Array(x) => UniformType::Array(x.len().div_ceil(4).max(1)),
        }
    }

    /// Integer vector holding `shape`.
    pub fn shape(shape: &[usize]) -> Self {
        let dim = |axis: usize| shape.get(axis).copied().unwrap_or(1) as i32;
        match shape.len() {
            0 | 1 => Self::I32(dim(0)),
            2 => Self::IVec2([dim(0), dim(1)]),
            3 => Self::IVec3([dim(0), dim(1), dim(2)]),
            _ => Self::IVec4([dim(0), dim(1), dim(2), dim(3)]),
        }
    }

    /// Little-endian bytes as laid out in the uniform block.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Self::F32(x) => x.to_le_bytes().to_vec(),
            Self::Vec2(x) => bytemuck::cast_slice(x).to_vec(),
            Self::Vec3(x) => bytemuck::cast_slice(x).to_vec(),
            Self::Vec4(x) => bytemuck::cast_slice(x).to_vec(),
            Self::I32(x) => x.to_le_bytes().to_vec(),
            Self::IVec2(x) => bytemuck::cast_slice(x).to_vec(),
            Self::IVec3(x) => bytemuck::cast_slice(x).to_vec(),
            Self::IVec4(x) => bytemuck::cast_slice(x).to_vec(),
            Self::Array(x) => {
                let mut data = x.clone();
                data.resize(self.ty().size() / size_of::<f32>(), 0.0);
                bytemuck::cast_slice(&data).to_vec()
            }
        }
    }
}

/// A kernel: a fragment shader body plus the shape contract of its inputs and output.
///
/// The body is WGSL defining `fn op_main()`. It may call:
/// - `get_output_coords()` for the logical coordinates this invocation writes,
/// - `get_<name>(...)` and `get_<name>_at_out_coords()` for every input,
/// - `get_channel(texel, vec2<i32>(row, col))` and `get_channel_1d(texel, col)` with packed inputs,
/// - `set_output(value)`, with an `f32`, or a `vec4<f32>` block for packed outputs,
/// - `u.<name>` for custom uniforms, and `u.nan_value` / `u.infinity_value`.
pub trait GpgpuProgram {
    /// Identity of the program; also the label of the compiled device program.
    fn name(&self) -> &str;
    /// Names of the inputs, in the order they are passed to the engine.
    fn variable_names(&self) -> Vec<&str>;
    fn output_shape(&self) -> Shape;
    fn user_code(&self) -> String;

    /// Reads inputs in packed layouts when [`Flags::pack`](crate::Flags::pack) allows it.
    ///
    /// The engine runs the program unpacked otherwise, so a body asking for packing must also
    /// compile against the unpacked helpers.
    fn packed_inputs(&self) -> bool {
        false
    }

    /// Writes a packed output when [`Flags::pack`](crate::Flags::pack) allows it.
    fn packed_output(&self) -> bool {
        false
    }

    fn output_usage(&self) -> TextureUsage {
        TextureUsage::Render
    }

    /// Lets one compiled program serve many shapes by passing them as uniforms.
    fn enable_shape_uniforms(&self) -> bool {
        false
    }

    fn custom_uniforms(&self) -> Vec<UniformDecl> {
        vec![]
    }

    /// Distinguishes otherwise identical programs, e.g. by a constant baked into the body.
    fn user_key(&self) -> String {
        String::new()
    }
}
