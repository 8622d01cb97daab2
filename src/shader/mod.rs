//! WGSL fragment programs assembled from typed fragments.
//!
//! A program is laid out in a fixed order: the prologue, the uniform block and texture
//! bindings, the output coordinate function, one sampler per input, the caller's body and the
//! entry point. Shape constants are either baked into the source or read from uniforms; the
//! [`ProgramKey`] of a program captures exactly what is baked.

use std::fmt::Write;

use itertools::Itertools;
use thiserror::Error;

use crate::{
    layout::PhysicalShape,
    shape::{Shape, broadcast_dims},
};

pub use program::{GpgpuProgram, UniformDecl, UniformType, UniformValue};

pub mod coords;
pub mod program;
pub mod prologue;
pub mod sampler;

use coords::{Dims, MAX_RANK};

/// Highest rank for which shapes may be passed as uniforms.
pub const MAX_UNIFORM_SHAPE_RANK: usize = 4;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ShaderError {
    #[error("rank {rank} of {name} is not supported (max {MAX_RANK})")]
    UnsupportedRank { name: String, rank: usize },
    #[error("invalid variable name: {0:?}")]
    InvalidName(String),
    #[error("program {program} expects {expected} inputs, got {found}")]
    InputCount {
        program: String,
        expected: usize,
        found: usize,
    },
}

/// How one input is bound to a program.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InputInfo {
    pub name: String,
    /// Logical shape as seen by the program.
    pub shape: Shape,
    /// Logical texture shape of the bound texture; for slices, the texture of the origin.
    pub tex_shape: PhysicalShape,
    pub packed: bool,
    /// Values are passed in a uniform array instead of a texture.
    pub uniform: bool,
    /// A flat offset is added to every index, for slice views.
    pub offset: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OutputInfo {
    pub shape: Shape,
    pub tex_shape: PhysicalShape,
    pub packed: bool,
}

/// What fills a member of the uniform block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UniformRole {
    Nan,
    Infinity,
    /// Values of the input at this index.
    Values(usize),
    Offset(usize),
    Shape(usize),
    TexShape(usize),
    OutShape,
    OutTexShape,
    /// The custom uniform at this index.
    Custom(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniformField {
    pub name: String,
    pub ty: UniformType,
    pub role: UniformRole,
    /// Byte offset in the uniform block.
    pub offset: usize,
}

/// Members of the uniform block, laid out by the uniform address space rules.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UniformLayout {
    fields: Vec<UniformField>,
    size: usize,
}

impl UniformLayout {
    pub fn new(members: impl IntoIterator<Item = (String, UniformType, UniformRole)>) -> Self {
        let mut fields = vec![];
        let mut end: usize = 0;
        let mut align = 4;
        for (name, ty, role) in members {
            let offset = end.next_multiple_of(ty.align());
            end = offset + ty.size();
            align = align.max(ty.align());
            fields.push(UniformField {
                name,
                ty,
                role,
                offset,
            });
        }
        let size = end.next_multiple_of(align);
        Self { fields, size }
    }

    #[inline]
    pub fn fields(&self) -> &[UniformField] {
        &self.fields
    }

    /// Size in bytes of the whole block.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn get(&self, name: &str) -> Option<&UniformField> {
        self.fields.iter().find(|field| field.name == name)
    }

    /// Declaration of the `Uniforms` struct and its binding.
    pub fn declaration(&self) -> String {
        let mut source = "struct Uniforms {\n".to_string();
        for field in &self.fields {
            let _ = writeln!(source, "    {}: {},", field.name, field.ty);
        }
        source.push_str("}\n\n@group(0) @binding(0) var<uniform> u: Uniforms;\n");
        source
    }

    /// Writes `value` into the slot of `field` in `buffer`.
    pub fn write(field: &UniformField, value: &UniformValue, buffer: &mut [u8]) {
        let bytes = value.to_bytes();
        let len = bytes.len().min(field.ty.size());
        buffer[field.offset..field.offset + len].copy_from_slice(&bytes[..len]);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FragmentKind {
    Prologue,
    Bindings,
    OutputCoords,
    Sampler,
    Body,
    Entry,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub kind: FragmentKind,
    pub code: String,
}

/// A complete program, immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderSource {
    fragments: Vec<Fragment>,
    text: String,
    uniforms: UniformLayout,
    textures: Vec<usize>,
    shape_uniforms: bool,
}

impl ShaderSource {
    fn new(
        fragments: Vec<Fragment>,
        uniforms: UniformLayout,
        textures: Vec<usize>,
        shape_uniforms: bool,
    ) -> Self {
        let text = fragments.iter().map(|x| x.code.as_str()).join("\n");
        Self {
            fragments,
            text,
            uniforms,
            textures,
            shape_uniforms,
        }
    }

    /// The fragment stage.
    #[inline]
    pub fn fragment(&self) -> &str {
        &self.text
    }

    /// The vertex stage.
    #[inline]
    pub fn vertex(&self) -> &'static str {
        prologue::VERTEX
    }

    pub fn fragments(&self) -> &[Fragment] {
        &self.fragments
    }

    /// Code of every fragment of `kind`, joined.
    pub fn code(&self, kind: FragmentKind) -> String {
        self.fragments
            .iter()
            .filter(|x| x.kind == kind)
            .map(|x| x.code.as_str())
            .join("\n")
    }

    #[inline]
    pub fn uniforms(&self) -> &UniformLayout {
        &self.uniforms
    }

    /// Indices of the inputs bound as textures, in binding order starting at 1.
    #[inline]
    pub fn textures(&self) -> &[usize] {
        &self.textures
    }

    #[inline]
    pub fn shape_uniforms(&self) -> bool {
        self.shape_uniforms
    }
}

/// Returns `true` if shapes of this dispatch are passed as uniforms rather than baked.
pub fn use_shape_uniforms(
    program: &dyn GpgpuProgram,
    inputs: &[InputInfo],
    output: &OutputInfo,
    enabled: bool,
) -> bool {
    enabled
        && program.enable_shape_uniforms()
        && output.shape.len() <= MAX_UNIFORM_SHAPE_RANK
        && inputs
            .iter()
            .all(|input| input.shape.len() <= MAX_UNIFORM_SHAPE_RANK)
}

/// The part of a [`ProgramKey`] describing one input.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InputKey {
    pub rank: usize,
    pub packed: bool,
    pub uniform: bool,
    pub offset: bool,
    pub broadcast: Vec<usize>,
    /// Present only when baked into the source.
    pub shape: Option<Shape>,
    pub tex_shape: Option<PhysicalShape>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OutputKey {
    pub rank: usize,
    pub packed: bool,
    pub shape: Option<Shape>,
    pub tex_shape: Option<PhysicalShape>,
}

/// Identifies the source a dispatch would compile to.
///
/// Carries no device capabilities: [`compile`] never reads them. Capabilities only pick texture
/// formats, and the device keeps one pipeline per target format under a single program.
/// Whether an input is bound as a uniform does depend on them, and is part of [`InputKey`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProgramKey {
    pub name: String,
    pub user_key: String,
    pub code: String,
    pub inputs: Vec<InputKey>,
    pub output: OutputKey,
    pub shape_uniforms: bool,
    pub custom: Vec<UniformDecl>,
}

impl ProgramKey {
    pub fn new(
        program: &dyn GpgpuProgram,
        inputs: &[InputInfo],
        output: &OutputInfo,
        shape_uniforms: bool,
    ) -> Self {
        let inputs = inputs
            .iter()
            .map(|input| {
                let baked = !shape_uniforms || input.uniform;
                InputKey {
                    rank: input.shape.len(),
                    packed: input.packed,
                    uniform: input.uniform,
                    offset: input.offset,
                    broadcast: broadcast_dims(&input.shape, &output.shape),
                    shape: baked.then(|| input.shape.clone()),
                    tex_shape: (baked && !input.uniform).then_some(input.tex_shape),
                }
            })
            .collect();
        let output = OutputKey {
            rank: output.shape.len(),
            packed: output.packed,
            shape: (!shape_uniforms).then(|| output.shape.clone()),
            tex_shape: (!shape_uniforms).then_some(output.tex_shape),
        };
        Self {
            name: program.name().to_string(),
            user_key: program.user_key(),
            code: program.user_code(),
            inputs,
            output,
            shape_uniforms,
            custom: program.custom_uniforms(),
        }
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    let head = chars
        .next()
        .is_some_and(|x| x.is_ascii_alphabetic() || x == '_');
    head && chars.all(|x| x.is_ascii_alphanumeric() || x == '_') && name != "u" && name != "_"
}

fn dims(prefix: &str, shape: &[usize], texels: PhysicalShape, uniform: bool) -> Dims {
    match uniform {
        true => Dims::uniform(prefix, shape.len()),
        false => Dims::baked(shape, texels),
    }
}

/// Assembles the fragment stage of `program` for the given inputs and output.
pub fn compile(
    program: &dyn GpgpuProgram,
    inputs: &[InputInfo],
    output: &OutputInfo,
    shape_uniforms: bool,
) -> Result<ShaderSource, ShaderError> {
    let expected = program.variable_names().len();
    if expected != inputs.len() {
        return Err(ShaderError::InputCount {
            program: program.name().to_string(),
            expected,
            found: inputs.len(),
        });
    }
    if let Some(input) = inputs.iter().find(|input| !is_identifier(&input.name)) {
        return Err(ShaderError::InvalidName(input.name.clone()));
    }
    let ranks = inputs
        .iter()
        .map(|input| (input.name.as_str(), input.shape.len()))
        .chain(std::iter::once(("output", output.shape.len())));
    for (name, rank) in ranks {
        if rank > MAX_RANK {
            let name = name.to_string();
            return Err(ShaderError::UnsupportedRank { name, rank });
        }
    }

    let shape_uniforms = use_shape_uniforms(program, inputs, output, shape_uniforms);
    let custom = program.custom_uniforms();
    for decl in &custom {
        if !is_identifier(&decl.name) {
            return Err(ShaderError::InvalidName(decl.name.clone()));
        }
    }

    let mut members = vec![
        ("nan_value".to_string(), UniformType::F32, UniformRole::Nan),
        ("infinity_value".to_string(), UniformType::F32, UniformRole::Infinity),
    ];
    for (index, input) in inputs.iter().enumerate() {
        let name = &input.name;
        if input.uniform {
            let len = input.shape.iter().product::<usize>().div_ceil(4).max(1);
            let ty = UniformType::Array(len);
            members.push((format!("{name}_values"), ty, UniformRole::Values(index)));
        }
        if input.offset && !input.packed {
            let role = UniformRole::Offset(index);
            members.push((format!("offset_{name}"), UniformType::I32, role));
        }
        if shape_uniforms && !input.uniform {
            let rank = input.shape.len();
            if rank > 0 {
                let ty = UniformType::shape(rank);
                members.push((format!("{name}_shape"), ty, UniformRole::Shape(index)));
            }
            let role = UniformRole::TexShape(index);
            members.push((format!("{name}_tex_shape"), UniformType::IVec2, role));
        }
    }
    if shape_uniforms {
        let rank = output.shape.len();
        if rank > 0 {
            let ty = UniformType::shape(rank);
            members.push(("out_shape".into(), ty, UniformRole::OutShape));
        }
        let role = UniformRole::OutTexShape;
        members.push(("out_tex_shape".into(), UniformType::IVec2, role));
    }
    for (index, decl) in custom.iter().enumerate() {
        members.push((decl.name.clone(), decl.ty, UniformRole::Custom(index)));
    }
    let uniforms = UniformLayout::new(members);

    let textures = inputs
        .iter()
        .enumerate()
        .filter(|(_, input)| !input.uniform)
        .map(|(index, _)| index)
        .collect_vec();
    let mut bindings = uniforms.declaration();
    for (binding, &index) in textures.iter().enumerate() {
        let name = &inputs[index].name;
        let binding = binding + 1;
        let _ = writeln!(
            bindings,
            "@group(0) @binding({binding}) var tex_{name}: texture_2d<f32>;"
        );
    }

    let any_packed = output.packed || inputs.iter().any(|input| input.packed);
    let mut fragments = vec![
        Fragment {
            kind: FragmentKind::Prologue,
            code: prologue::prologue(output.packed, any_packed),
        },
        Fragment {
            kind: FragmentKind::Bindings,
            code: bindings,
        },
    ];

    let out_texels = output.tex_shape.texels(output.packed);
    let out_dims = dims("out", &output.shape, out_texels, shape_uniforms);
    fragments.push(Fragment {
        kind: FragmentKind::OutputCoords,
        code: coords::output_coords(&out_dims, output.packed)?,
    });

    for input in inputs {
        let texels = input.tex_shape.texels(input.packed);
        let uniform = shape_uniforms && !input.uniform;
        let dims = dims(&input.name, &input.shape, texels, uniform);
        fragments.push(Fragment {
            kind: FragmentKind::Sampler,
            code: sampler::sampler(input, &dims, &output.shape)?,
        });
    }

    fragments.push(Fragment {
        kind: FragmentKind::Body,
        code: program.user_code(),
    });
    fragments.push(Fragment {
        kind: FragmentKind::Entry,
        code: prologue::ENTRY.to_string(),
    });

    Ok(ShaderSource::new(
        fragments,
        uniforms,
        textures,
        shape_uniforms,
    ))
}
