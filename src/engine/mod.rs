//! Tensor data, program dispatch and host transfers.
//!
//! Tensor contents live in buckets addressed by [`DataId`]. A bucket holds host values, a
//! pooled texture, or a view into the texture of another bucket, and is released when its
//! reference count drops to zero. [`Engine::run_program`] drives one dispatch: inputs are
//! bound as textures or uniform arrays (repacked first if the program wants another layout),
//! the program is fetched from the cache, the output texture is acquired from the pool, and
//! the quad is drawn. Reads are fenced and resolved in issuance order by [`Engine::tick`].

use std::{cell::RefCell, collections::VecDeque, rc::Rc, time::Duration};

use derive_more::Display;
use itertools::{Itertools, zip_eq};
use thiserror::Error;

use crate::{
    cache::{CompiledProgram, ProgramCache},
    config::Flags,
    context::DeviceContext,
    device::{Device, DeviceError, TextureId},
    layout::{
        LayoutError, PhysicalFormat, PhysicalShape, TextureUsage, is_reshape_free, plan_layout,
        texel::{encode_packed, encode_unpacked},
    },
    num::{DataType, Values, representable_in_f16},
    platform::Instant,
    pool::{PoolMemory, TexturePool},
    shader::{
        self, GpgpuProgram, InputInfo, OutputInfo, ProgramKey, ShaderError, UniformLayout,
        UniformRole, UniformType, UniformValue,
    },
    shape::{Shape, flat_index, is_slice_contiguous, unravel},
};

pub use programs::{
    CopyProgram, EncodeFloatProgram, PackProgram, ReshapePackedProgram, UnpackProgram,
};
pub use readback::ReadFuture;

pub mod programs;
pub mod readback;

use readback::{PendingRead, Reader};

#[derive(Debug, Error, Clone)]
pub enum EngineError {
    #[error(transparent)]
    Layout(#[from] LayoutError),
    #[error(transparent)]
    Shader(#[from] ShaderError),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("the value {0} cannot be represented on this device")]
    NumericRepresentation(f32),
    #[error("unknown tensor data: {0}")]
    UnknownData(DataId),
    #[error("shape mismatch: expected {expected} elements, found {found}")]
    ShapeMismatch { expected: usize, found: usize },
    #[error("cannot view tensor of shape {shape} at {begin:?} with size {size:?}")]
    Slice {
        shape: Shape,
        begin: Vec<usize>,
        size: Vec<usize>,
    },
    #[error("uniform {name} expects a value of type {expected}")]
    UniformMismatch { name: String, expected: UniformType },
    #[error("read abandoned before completion")]
    ReadAbandoned,
}

/// Index of a bucket. Never reused within one engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display)]
#[display("data#{_0}")]
pub struct DataId(usize);

/// A view of a bucket: what callers hold and pass around.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorInfo {
    pub id: DataId,
    pub shape: Shape,
    pub dtype: DataType,
}

impl TensorInfo {
    #[inline]
    pub fn size(&self) -> usize {
        self.shape.size()
    }
}

/// Representations a dispatch reads its inputs in and writes its output in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Packing {
    inputs: bool,
    output: bool,
}

impl Packing {
    /// What `program` asks for.
    fn of(program: &dyn GpgpuProgram) -> Self {
        Self {
            inputs: program.packed_inputs(),
            output: program.packed_output(),
        }
    }

    /// What `program` asks for, unless packing is disabled.
    fn allowed(program: &dyn GpgpuProgram, pack: bool) -> Self {
        let Self { inputs, output } = Self::of(program);
        Self {
            inputs: inputs && pack,
            output: output && pack,
        }
    }
}

/// A pooled texture owned by a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureData {
    pub texture: TextureId,
    pub shape: PhysicalShape,
    pub usage: TextureUsage,
    pub packed: bool,
}

/// Marks a bucket as a view into the texture of `origin`, starting at a flat element offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceInfo {
    pub flat_offset: usize,
    pub origin: DataId,
}

#[derive(Debug)]
pub struct TensorData {
    pub shape: Shape,
    pub dtype: DataType,
    pub values: Option<Values>,
    pub texture: Option<TextureData>,
    pub slice: Option<SliceInfo>,
    pub ref_count: usize,
    /// Present while a read is in flight; every reader receives its result.
    readers: Option<Vec<Reader>>,
    /// Dropped by its last owner while a read was in flight.
    released: bool,
}

impl TensorData {
    fn new(shape: Shape, dtype: DataType) -> Self {
        Self {
            shape,
            dtype,
            values: None,
            texture: None,
            slice: None,
            ref_count: 1,
            readers: None,
            released: false,
        }
    }

    #[inline]
    pub fn is_on_device(&self) -> bool {
        self.texture.is_some() || self.slice.is_some()
    }

    #[inline]
    pub fn is_packed(&self) -> bool {
        self.texture.is_some_and(|x| x.packed)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MemoryInfo {
    pub pool: PoolMemory,
    /// Live buckets.
    pub buckets: usize,
    pub programs: usize,
    pub pending_reads: usize,
}

/// Time spent moving data between host and device.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    pub upload: Duration,
    pub download: Duration,
    pub uploads: usize,
    pub downloads: usize,
}

/// How one input is bound for a draw.
#[derive(Debug, Clone)]
struct Binding {
    info: InputInfo,
    texture: Option<TextureId>,
    /// Values of a uniform-backed input.
    values: Option<Vec<f32>>,
    offset: usize,
}

fn fits(value: &UniformValue, ty: UniformType) -> bool {
    match (value, ty) {
        (UniformValue::Array(values), UniformType::Array(len)) => values.len() <= len * 4,
        (value, ty) => value.ty() == ty,
    }
}

fn check_representable(values: &[f32]) -> Result<(), EngineError> {
    match values.iter().find(|&&x| !representable_in_f16(x)) {
        Some(&x) => Err(EngineError::NumericRepresentation(x)),
        None => Ok(()),
    }
}

/// Picks the elements of the block at `begin` of extent `size`.
fn gather(values: &Values, shape: &[usize], begin: &[usize], size: &[usize]) -> Values {
    let count: usize = size.iter().product();
    let indices = (0..count)
        .map(|index| {
            let coords = zip_eq(unravel(size, index), begin)
                .map(|(coord, begin)| coord + begin)
                .collect_vec();
            flat_index(shape, &coords)
        })
        .collect_vec();
    match values {
        Values::F32(x) => Values::F32(indices.iter().map(|&i| x[i]).collect()),
        Values::I32(x) => Values::I32(indices.iter().map(|&i| x[i]).collect()),
        Values::Bool(x) => Values::Bool(indices.iter().map(|&i| x[i]).collect()),
    }
}

#[derive(Debug)]
struct EngineInner {
    context: DeviceContext,
    pool: TexturePool,
    cache: ProgramCache,
    data: Vec<Option<TensorData>>,
    pending: VecDeque<PendingRead>,
    timings: Timings,
}

impl EngineInner {
    fn bucket(&self, id: DataId) -> Result<&TensorData, EngineError> {
        match self.data.get(id.0) {
            Some(Some(data)) if !data.released => Ok(data),
            _ => Err(EngineError::UnknownData(id)),
        }
    }

    fn bucket_mut(&mut self, id: DataId) -> Result<&mut TensorData, EngineError> {
        match self.data.get_mut(id.0) {
            Some(Some(data)) if !data.released => Ok(data),
            _ => Err(EngineError::UnknownData(id)),
        }
    }

    fn insert(&mut self, data: TensorData) -> DataId {
        self.data.push(Some(data));
        DataId(self.data.len() - 1)
    }

    fn numerics_checked(&self) -> bool {
        self.context.flags().check_numerical_problems && !self.context.capabilities().render_float32
    }

    fn write(&mut self, values: Values, shape: Shape) -> Result<TensorInfo, EngineError> {
        if values.len() != shape.size() {
            return Err(EngineError::ShapeMismatch {
                expected: shape.size(),
                found: values.len(),
            });
        }
        if self.numerics_checked() {
            check_representable(&values.to_f32())?;
        }
        let dtype = values.data_type();
        let mut data = TensorData::new(shape.clone(), dtype);
        data.values = Some(values);
        let id = self.insert(data);
        Ok(TensorInfo { id, shape, dtype })
    }

    /// Moves host values of `id` into a texture of the given layout. Host values are dropped.
    #[cfg_attr(feature = "trace", tracing::instrument(skip(self)))]
    fn upload(&mut self, id: DataId, packed: bool) -> Result<(), EngineError> {
        let data = self.bucket(id)?;
        if data.is_on_device() {
            return Ok(());
        }
        let values = data.values.as_ref().ok_or(EngineError::UnknownData(id))?;
        let values = values.to_f32();
        let shape = data.shape.clone();

        let start = Instant::now();
        let usage = TextureUsage::Upload;
        let tex_shape = plan_layout(&shape, packed, self.context.limits())?;
        let texels = match packed {
            true => encode_packed(&values, &shape, tex_shape.texels(true).size()),
            false => encode_unpacked(&values, self.context.unpacked_channels(), tex_shape.size()),
        };

        let texture = self.pool.acquire(&self.context, tex_shape, usage, packed)?;
        let render_float32 = self.context.capabilities().render_float32;
        let format = PhysicalFormat::new(usage, packed, render_float32);
        if let Err(err) = self.context.upload_texture(texture, format, &texels) {
            self.pool.release(&self.context, texture, tex_shape, usage, packed);
            return Err(err.into());
        }
        log::debug!("upload {id} of {shape} into {texture}");

        let data = self.bucket_mut(id)?;
        data.texture = Some(TextureData {
            texture,
            shape: tex_shape,
            usage,
            packed,
        });
        data.values = None;

        self.timings.upload += start.elapsed();
        self.timings.uploads += 1;
        Ok(())
    }

    /// Frees the resources of a bucket and removes it.
    fn release(&mut self, id: DataId) {
        let Some(data) = self.data.get_mut(id.0).and_then(Option::take) else {
            return;
        };
        if let Some(texture) = data.texture {
            let TextureData {
                texture,
                shape,
                usage,
                packed,
            } = texture;
            self.pool.release(&self.context, texture, shape, usage, packed);
        }
        if let Some(slice) = data.slice {
            if let Err(err) = self.dispose(slice.origin) {
                log::warn!("cannot release origin of {id}: {err}");
            }
        }
    }

    fn dispose(&mut self, id: DataId) -> Result<(), EngineError> {
        let data = self.bucket_mut(id)?;
        data.ref_count = data.ref_count.saturating_sub(1);
        if data.ref_count > 0 {
            return Ok(());
        }
        if data.readers.is_some() {
            log::debug!("defer release of {id} until its read completes");
            data.released = true;
            return Ok(());
        }
        self.release(id);
        Ok(())
    }

    fn dispose_all(&mut self, ids: impl IntoIterator<Item = DataId>) {
        for id in ids {
            if let Err(err) = self.dispose(id) {
                log::warn!("{err}");
            }
        }
    }

    fn check_custom(
        program: &dyn GpgpuProgram,
        custom: &[UniformValue],
    ) -> Result<(), EngineError> {
        for (index, decl) in program.custom_uniforms().into_iter().enumerate() {
            match custom.get(index) {
                Some(value) if fits(value, decl.ty) => {}
                _ => {
                    return Err(EngineError::UniformMismatch {
                        name: decl.name,
                        expected: decl.ty,
                    });
                }
            }
        }
        Ok(())
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip_all, fields(program = program.name())))]
    fn run_program(
        &mut self,
        program: &dyn GpgpuProgram,
        packing: Packing,
        inputs: &[TensorInfo],
        dtype: DataType,
        custom: &[UniformValue],
    ) -> Result<TensorInfo, EngineError> {
        let names = program.variable_names();
        if names.len() != inputs.len() {
            return Err(ShaderError::InputCount {
                program: program.name().to_string(),
                expected: names.len(),
                found: inputs.len(),
            }
            .into());
        }
        Self::check_custom(program, custom)?;

        let shape = program.output_shape();
        if shape.size() == 0 {
            let mut data = TensorData::new(shape.clone(), dtype);
            data.values = Some(Values::from_f32(dtype, &[]));
            let id = self.insert(data);
            return Ok(TensorInfo { id, shape, dtype });
        }

        // fails before anything is allocated
        let packed = packing.output;
        let tex_shape = plan_layout(&shape, packed, self.context.limits())?;
        let output = OutputInfo {
            shape: shape.clone(),
            tex_shape,
            packed,
        };

        let mut temporaries = vec![];
        let result = self.dispatch(program, packing, inputs, &output, custom, &mut temporaries);
        self.dispose_all(temporaries);
        let texture = result?;

        let mut data = TensorData::new(shape.clone(), dtype);
        data.texture = Some(TextureData {
            texture,
            shape: tex_shape,
            usage: program.output_usage(),
            packed,
        });
        let id = self.insert(data);
        Ok(TensorInfo { id, shape, dtype })
    }

    fn dispatch(
        &mut self,
        program: &dyn GpgpuProgram,
        packing: Packing,
        inputs: &[TensorInfo],
        output: &OutputInfo,
        custom: &[UniformValue],
        temporaries: &mut Vec<DataId>,
    ) -> Result<TextureId, EngineError> {
        let bindings = program
            .variable_names()
            .into_iter()
            .zip_eq(inputs)
            .map(|(name, input)| self.bind_input(name, input, packing.inputs, temporaries))
            .collect::<Result<Vec<_>, _>>()?;
        let infos = bindings.iter().map(|x| x.info.clone()).collect_vec();
        let compiled = self.compile(program, &infos, output)?;

        let usage = program.output_usage();
        let texture = self
            .pool
            .acquire(&self.context, output.tex_shape, usage, output.packed)?;
        match self.draw(&compiled, &bindings, output, custom, texture) {
            Ok(()) => Ok(texture),
            Err(err) => {
                let context = &self.context;
                self.pool
                    .release(context, texture, output.tex_shape, usage, output.packed);
                Err(err)
            }
        }
    }

    /// Returns the compiled program for a dispatch, compiling it on a cache miss.
    fn compile(
        &mut self,
        program: &dyn GpgpuProgram,
        inputs: &[InputInfo],
        output: &OutputInfo,
    ) -> Result<Rc<CompiledProgram>, EngineError> {
        let enabled = self.context.flags().use_shape_uniforms;
        let shape_uniforms = shader::use_shape_uniforms(program, inputs, output, enabled);
        let key = ProgramKey::new(program, inputs, output, shape_uniforms);
        let context = &self.context;
        self.cache.get_or_compile(key, |key| {
            let source = shader::compile(program, inputs, output, enabled)?;
            let id = context.create_program(program.name(), &source)?;
            Ok(CompiledProgram::new(id, source, key.clone()))
        })
    }

    /// Brings an input into the representation a program reads, and describes its binding.
    fn bind_input(
        &mut self,
        name: &str,
        input: &TensorInfo,
        packed_inputs: bool,
        temporaries: &mut Vec<DataId>,
    ) -> Result<Binding, EngineError> {
        let size = input.size();

        let data = self.bucket(input.id)?;
        if !data.is_on_device() {
            let values = data.values.as_ref().ok_or(EngineError::UnknownData(input.id))?;
            let limit = self.context.flags().size_upload_uniform;
            let render_float32 = self.context.capabilities().render_float32;
            if !packed_inputs && size <= limit && render_float32 {
                return Ok(Binding {
                    info: InputInfo {
                        name: name.to_string(),
                        shape: input.shape.clone(),
                        tex_shape: PhysicalShape::new(1, size.max(1)),
                        packed: false,
                        uniform: true,
                        offset: false,
                    },
                    texture: None,
                    values: Some(values.to_f32()),
                    offset: 0,
                });
            }
            if packed_inputs {
                self.bucket_mut(input.id)?.shape = input.shape.clone();
            }
            self.upload(input.id, packed_inputs)?;
        }

        let mut input = input.clone();
        let data = self.bucket(input.id)?;
        let (packed, shape) = (data.is_packed(), data.shape.clone());
        if packed != packed_inputs {
            let (inputs, dtype) = ([input.clone()], input.dtype);
            let temp = match packed {
                true => {
                    let program = UnpackProgram::new(input.shape.clone());
                    self.run_program(&program, Packing::of(&program), &inputs, dtype, &[])?
                }
                false => {
                    let program = PackProgram::new(input.shape.clone());
                    self.run_program(&program, Packing::of(&program), &inputs, dtype, &[])?
                }
            };
            temporaries.push(temp.id);
            input = temp;
        } else if packed && !is_reshape_free(&shape, &input.shape) {
            let view = TensorInfo {
                id: input.id,
                shape,
                dtype: input.dtype,
            };
            let temp = self.reshape_packed(&view, &input.shape)?;
            temporaries.push(temp.id);
            input = temp;
        }

        let data = self.bucket(input.id)?;
        let binding = match (data.slice, data.texture) {
            (Some(slice), _) => {
                let origin = self.bucket(slice.origin)?;
                let texture = origin.texture.ok_or(EngineError::UnknownData(slice.origin))?;
                Binding {
                    info: InputInfo {
                        name: name.to_string(),
                        shape: input.shape,
                        tex_shape: texture.shape,
                        packed: false,
                        uniform: false,
                        offset: true,
                    },
                    texture: Some(texture.texture),
                    values: None,
                    offset: slice.flat_offset,
                }
            }
            (None, Some(texture)) => Binding {
                info: InputInfo {
                    name: name.to_string(),
                    shape: input.shape,
                    tex_shape: texture.shape,
                    packed: texture.packed,
                    uniform: false,
                    offset: false,
                },
                texture: Some(texture.texture),
                values: None,
                offset: 0,
            },
            (None, None) => return Err(EngineError::UnknownData(input.id)),
        };
        Ok(binding)
    }

    /// Describes an input as [`Self::bind_input`] would bind it, without touching the device.
    fn plan_input(
        &self,
        name: &str,
        input: &TensorInfo,
        packed: bool,
    ) -> Result<InputInfo, EngineError> {
        let size = input.size();
        let limits = self.context.limits();
        let data = self.bucket(input.id)?;

        let mut info = InputInfo {
            name: name.to_string(),
            shape: input.shape.clone(),
            tex_shape: PhysicalShape::new(1, size.max(1)),
            packed,
            uniform: false,
            offset: false,
        };
        match (data.slice, data.texture) {
            (None, None) => {
                let limit = self.context.flags().size_upload_uniform;
                let render_float32 = self.context.capabilities().render_float32;
                // unpacked uploads are laid out by the stored shape
                let stored = if packed { &input.shape } else { &data.shape };
                match !packed && size <= limit && render_float32 {
                    true => info.uniform = true,
                    false => info.tex_shape = plan_layout(stored, packed, limits)?,
                }
            }
            (Some(slice), _) if !packed => {
                let origin = self.bucket(slice.origin)?;
                let texture = origin.texture.ok_or(EngineError::UnknownData(slice.origin))?;
                info.tex_shape = texture.shape;
                info.offset = true;
            }
            (None, Some(texture)) if texture.packed == packed => {
                info.tex_shape = match !packed || is_reshape_free(&data.shape, &input.shape) {
                    true => texture.shape,
                    false => plan_layout(&programs::view_3d(&input.shape), true, limits)?,
                };
            }
            _ => info.tex_shape = plan_layout(&input.shape, packed, limits)?,
        }
        Ok(info)
    }

    fn draw(
        &self,
        compiled: &CompiledProgram,
        bindings: &[Binding],
        output: &OutputInfo,
        custom: &[UniformValue],
        texture: TextureId,
    ) -> Result<(), EngineError> {
        let texels = |shape: PhysicalShape| UniformValue::IVec2([shape.rows as i32, shape.cols as i32]);

        let locations = compiled.locations();
        let mut uniforms = vec![0; locations.size];
        for field in &locations.fields {
            let value = match field.role {
                UniformRole::Nan => UniformValue::F32(f32::NAN),
                UniformRole::Infinity => UniformValue::F32(f32::INFINITY),
                UniformRole::Values(index) => {
                    UniformValue::Array(bindings[index].values.clone().unwrap_or_default())
                }
                UniformRole::Offset(index) => UniformValue::I32(bindings[index].offset as i32),
                UniformRole::Shape(index) => UniformValue::shape(&bindings[index].info.shape),
                UniformRole::TexShape(index) => {
                    let info = &bindings[index].info;
                    texels(info.tex_shape.texels(info.packed))
                }
                UniformRole::OutShape => UniformValue::shape(&output.shape),
                UniformRole::OutTexShape => texels(output.tex_shape.texels(output.packed)),
                UniformRole::Custom(index) => {
                    custom
                        .get(index)
                        .cloned()
                        .ok_or_else(|| EngineError::UniformMismatch {
                            name: field.name.clone(),
                            expected: field.ty,
                        })?
                }
            };
            UniformLayout::write(field, &value, &mut uniforms);
        }

        let context = &self.context;
        context.bind_program(compiled.program);
        context.bind_output(texture, output.tex_shape.texels(output.packed));
        let result = (|| {
            for (unit, &index) in compiled.source.textures().iter().enumerate() {
                let binding = &bindings[index];
                let texture = binding.texture.ok_or_else(|| {
                    DeviceError::Backend(format!("input {} has no texture", binding.info.name))
                })?;
                context.bind_input(unit, texture);
            }
            context.set_uniforms(uniforms);
            context.execute_program()
        })();
        context.unbind_output();
        Ok(result?)
    }

    /// Rearranges packed data viewed as `input` into the packed layout of `shape`.
    fn reshape_packed(&mut self, input: &TensorInfo, shape: &Shape) -> Result<TensorInfo, EngineError> {
        let program = ReshapePackedProgram::new(&input.shape, shape);
        let view = TensorInfo {
            id: input.id,
            shape: program.input_shape(),
            dtype: input.dtype,
        };
        let output = self.run_program(&program, Packing::of(&program), &[view], input.dtype, &[])?;
        // the 3-D layout is the layout of `shape`
        self.bucket_mut(output.id)?.shape = shape.clone();
        Ok(TensorInfo {
            id: output.id,
            shape: shape.clone(),
            dtype: input.dtype,
        })
    }

    fn reshape(&mut self, input: &TensorInfo, shape: Shape) -> Result<TensorInfo, EngineError> {
        if shape.size() != input.size() {
            return Err(EngineError::ShapeMismatch {
                expected: input.size(),
                found: shape.size(),
            });
        }
        let data = self.bucket(input.id)?;
        if data.is_packed() && !is_reshape_free(&data.shape, &shape) {
            let view = TensorInfo {
                id: input.id,
                shape: data.shape.clone(),
                dtype: input.dtype,
            };
            return self.reshape_packed(&view, &shape);
        }
        self.bucket_mut(input.id)?.ref_count += 1;
        Ok(TensorInfo {
            id: input.id,
            shape,
            dtype: input.dtype,
        })
    }

    fn shallow_slice(
        &mut self,
        input: &TensorInfo,
        begin: &[usize],
        size: &[usize],
    ) -> Result<TensorInfo, EngineError> {
        let shape = &input.shape;
        let rank = shape.len();
        let error = || EngineError::Slice {
            shape: shape.clone(),
            begin: begin.to_vec(),
            size: size.to_vec(),
        };
        let valid = begin.len() == rank
            && size.len() == rank
            && (0..rank).all(|axis| begin[axis] + size[axis] <= shape[axis]);
        if !valid {
            return Err(error());
        }

        let dtype = input.dtype;
        let sliced: Shape = size.into();
        let data = self.bucket(input.id)?;
        if !data.is_on_device() {
            let values = data.values.as_ref().ok_or(EngineError::UnknownData(input.id))?;
            let values = gather(values, shape, begin, size);
            let mut data = TensorData::new(sliced.clone(), dtype);
            data.values = Some(values);
            let id = self.insert(data);
            return Ok(TensorInfo {
                id,
                shape: sliced,
                dtype,
            });
        }
        if data.is_packed() || !is_slice_contiguous(shape, begin, size) {
            return Err(error());
        }

        let offset = flat_index(shape, begin);
        let (origin, base) = match data.slice {
            Some(slice) => (slice.origin, slice.flat_offset),
            None => (input.id, 0),
        };
        self.bucket_mut(origin)?.ref_count += 1;

        let mut data = TensorData::new(sliced.clone(), dtype);
        data.slice = Some(SliceInfo {
            flat_offset: base + offset,
            origin,
        });
        let id = self.insert(data);
        log::debug!("{id} views {origin} at {}", base + offset);
        Ok(TensorInfo {
            id,
            shape: sliced,
            dtype,
        })
    }

    fn compile_only(
        &mut self,
        program: &dyn GpgpuProgram,
        inputs: &[TensorInfo],
    ) -> Result<(), EngineError> {
        let names = program.variable_names();
        if names.len() != inputs.len() {
            return Err(ShaderError::InputCount {
                program: program.name().to_string(),
                expected: names.len(),
                found: inputs.len(),
            }
            .into());
        }
        let shape = program.output_shape();
        let packing = self.packing(program);
        let output = OutputInfo {
            tex_shape: plan_layout(&shape, packing.output, self.context.limits())?,
            shape,
            packed: packing.output,
        };
        let infos = names
            .iter()
            .zip_eq(inputs)
            .map(|(name, input)| self.plan_input(name, input, packing.inputs))
            .collect::<Result<Vec<_>, _>>()?;
        self.compile(program, &infos, &output)?;
        Ok(())
    }

    /// Packing of a caller's program under the configured flags.
    #[inline]
    fn packing(&self, program: &dyn GpgpuProgram) -> Packing {
        Packing::allowed(program, self.context.flags().pack)
    }

    fn memory(&self) -> MemoryInfo {
        MemoryInfo {
            pool: self.pool.memory(),
            buckets: self.data.iter().flatten().count(),
            programs: self.cache.len(),
            pending_reads: self.pending.len(),
        }
    }

    fn teardown(&mut self) {
        for read in self.pending.drain(..) {
            self.context.delete_fence(read.fence);
            self.context.delete_pixels(read.pixels);
        }
        self.data.iter_mut().for_each(|x| *x = None);
        self.cache.dispose(&self.context);
        self.pool.dispose(&self.context);
    }
}

/// The execution engine. Clones share one device context, texture pool and program cache.
///
/// The engine is confined to one thread; every operation runs to completion except reads,
/// which resolve through [`ReadFuture`].
#[derive(Debug, Clone)]
pub struct Engine(Rc<RefCell<EngineInner>>);

impl Engine {
    pub fn new(device: impl Device + 'static, flags: Flags) -> Self {
        Self::from_context(DeviceContext::new(device, flags))
    }

    pub fn from_context(context: DeviceContext) -> Self {
        let inner = EngineInner {
            context,
            pool: TexturePool::new(),
            cache: ProgramCache::new(),
            data: vec![],
            pending: VecDeque::new(),
            timings: Timings::default(),
        };
        Self(Rc::new(RefCell::new(inner)))
    }

    pub fn flags(&self) -> Flags {
        self.0.borrow().context.flags().clone()
    }

    /// Stores host values. They stay on the host until a program needs them on the device.
    pub fn write(
        &self,
        values: impl Into<Values>,
        shape: impl Into<Shape>,
    ) -> Result<TensorInfo, EngineError> {
        self.0.borrow_mut().write(values.into(), shape.into())
    }

    /// Moves the host values of `info` into an unpacked texture, if not on the device yet.
    pub fn upload(&self, info: &TensorInfo) -> Result<(), EngineError> {
        self.0.borrow_mut().upload(info.id, false)
    }

    /// Reads the values of `info`. Resolves once the device has produced them.
    pub fn read(&self, info: &TensorInfo) -> ReadFuture {
        let receiver = self.0.borrow_mut().read(info.id);
        ReadFuture::new(self.clone(), receiver)
    }

    /// Reads the values of `info`, blocking until the device has finished all submitted work.
    pub fn read_sync(&self, info: &TensorInfo) -> Result<Values, EngineError> {
        let mut inner = self.0.borrow_mut();
        let receiver = inner.read(info.id);
        if receiver.is_empty() {
            inner.context.wait()?;
            inner.tick();
        }
        receiver.try_recv().unwrap_or(Err(EngineError::ReadAbandoned))
    }

    /// Resolves every read whose fence has completed, in issuance order.
    pub fn tick(&self) -> usize {
        self.0.borrow_mut().tick()
    }

    /// Drops one reference to the data of `info`.
    pub fn dispose(&self, info: &TensorInfo) -> Result<(), EngineError> {
        self.0.borrow_mut().dispose(info.id)
    }

    pub fn inc_ref(&self, info: &TensorInfo) -> Result<(), EngineError> {
        self.0.borrow_mut().bucket_mut(info.id)?.ref_count += 1;
        Ok(())
    }

    pub fn ref_count(&self, info: &TensorInfo) -> Result<usize, EngineError> {
        Ok(self.0.borrow().bucket(info.id)?.ref_count)
    }

    /// A view of a contiguous block of `info` without copying.
    /// Data still on the host is sliced on the host instead.
    pub fn shallow_slice(
        &self,
        info: &TensorInfo,
        begin: &[usize],
        size: &[usize],
    ) -> Result<TensorInfo, EngineError> {
        self.0.borrow_mut().shallow_slice(info, begin, size)
    }

    /// Views `info` with another shape of the same size.
    /// Packed data whose layout would change is rearranged on the device.
    pub fn reshape(
        &self,
        info: &TensorInfo,
        shape: impl Into<Shape>,
    ) -> Result<TensorInfo, EngineError> {
        self.0.borrow_mut().reshape(info, shape.into())
    }

    /// Runs `program` over `inputs`, producing a new tensor of `dtype`.
    ///
    /// `custom` holds one value per custom uniform the program declares, in order.
    pub fn run_program(
        &self,
        program: &dyn GpgpuProgram,
        inputs: &[TensorInfo],
        dtype: DataType,
        custom: &[UniformValue],
    ) -> Result<TensorInfo, EngineError> {
        let mut inner = self.0.borrow_mut();
        let packing = inner.packing(program);
        inner.run_program(program, packing, inputs, dtype, custom)
    }

    /// Compiles the program a dispatch of `program` over `inputs` would use, without running it.
    pub fn compile_only(
        &self,
        program: &dyn GpgpuProgram,
        inputs: &[TensorInfo],
    ) -> Result<(), EngineError> {
        self.0.borrow_mut().compile_only(program, inputs)
    }

    /// Number of programs compiled so far.
    pub fn compile_count(&self) -> usize {
        self.0.borrow().cache.compile_count()
    }

    pub fn memory(&self) -> MemoryInfo {
        self.0.borrow().memory()
    }

    pub fn timings(&self) -> Timings {
        self.0.borrow().timings
    }

    /// Deletes every program and texture. Pending reads are abandoned.
    pub fn teardown(&self) {
        self.0.borrow_mut().teardown()
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use itertools::Itertools;

    use super::{Engine, EngineError};
    use crate::{
        config::Flags,
        device::{
            Device, FenceKind,
            mock::{Invocation, MockDevice, Texel},
        },
        layout::{
            LayoutError,
            texel::{decode_packed, encode_packed},
        },
        num::{DataType, Values},
        shader::{GpgpuProgram, UniformDecl, UniformType},
        shape::Shape,
    };

    struct AddScalar {
        shape: Shape,
        shape_uniforms: bool,
    }

    impl AddScalar {
        fn new(shape: impl Into<Shape>) -> Self {
            let shape = shape.into();
            let shape_uniforms = false;
            Self {
                shape,
                shape_uniforms,
            }
        }
    }

    impl GpgpuProgram for AddScalar {
        fn name(&self) -> &str {
            "add_scalar"
        }

        fn variable_names(&self) -> Vec<&str> {
            vec!["x"]
        }

        fn output_shape(&self) -> Shape {
            self.shape.clone()
        }

        fn user_code(&self) -> String {
            "fn op_main() {\n    set_output(get_x_at_out_coords() + u.scalar);\n}\n".into()
        }

        fn enable_shape_uniforms(&self) -> bool {
            self.shape_uniforms
        }

        fn custom_uniforms(&self) -> Vec<UniformDecl> {
            vec![UniformDecl::new("scalar", UniformType::F32)]
        }
    }

    fn add_scalar(call: &Invocation) -> Vec<Texel> {
        let scalar = call.f32("scalar");
        let offset = call.i32("offset_x").max(0) as usize;
        match call.inputs.first() {
            Some(input) => input
                .iter()
                .skip(offset)
                .map(|x| [x[0] + scalar, 0.0, 0.0, 0.0])
                .collect(),
            None => vec![[call.f32("x_values") + scalar, 0.0, 0.0, 0.0]; call.texels()],
        }
    }

    struct Double(Shape);

    impl GpgpuProgram for Double {
        fn name(&self) -> &str {
            "double"
        }

        fn variable_names(&self) -> Vec<&str> {
            vec!["x"]
        }

        fn output_shape(&self) -> Shape {
            self.0.clone()
        }

        fn user_code(&self) -> String {
            "fn op_main() {\n    set_output(get_x_at_out_coords() * 2.0);\n}\n".into()
        }

        fn packed_inputs(&self) -> bool {
            true
        }

        fn packed_output(&self) -> bool {
            true
        }
    }

    fn setup(flags: Flags) -> (Engine, MockDevice) {
        let device = MockDevice::new();
        device.emulate("add_scalar", add_scalar);
        (Engine::new(device.clone(), flags), device)
    }

    fn range(len: usize) -> Vec<f32> {
        (0..len).map(|x| x as f32).collect()
    }

    #[test]
    fn test_round_trip() -> Result<(), Box<dyn Error>> {
        let (engine, _) = setup(Flags::new());
        let shapes: [&[usize]; 7] = [
            &[],
            &[7],
            &[3, 4],
            &[2, 3, 5],
            &[2, 1, 3, 4],
            &[2, 2, 1, 3, 2],
            &[1, 2, 2, 1, 3, 2],
        ];
        for shape in shapes {
            let size = shape.iter().product::<usize>();
            let floats: Vec<f32> = (0..size).map(|_| fastrand::f32() * 200.0 - 100.0).collect();
            let ints: Vec<i32> = (0..size).map(|_| fastrand::i32(-1000..1000)).collect();
            let bools: Vec<bool> = (0..size).map(|_| fastrand::bool()).collect();
            for values in [Values::from(floats), ints.into(), bools.into()] {
                let x = engine.write(values.clone(), shape)?;
                assert_eq!(engine.read_sync(&x)?, values);
                engine.upload(&x)?;
                assert_eq!(engine.read_sync(&x)?, values, "{shape:?}");
                engine.dispose(&x)?;
            }
        }
        assert_eq!(engine.memory().buckets, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_read_async() -> Result<(), Box<dyn Error>> {
        let device = MockDevice::new().fence_delay(3);
        let engine = Engine::new(device.clone(), Flags::new());
        let values = range(12);
        let x = engine.write(values.clone(), [3, 4])?;
        engine.upload(&x)?;

        let a = engine.read(&x);
        let b = engine.read(&x);
        assert_eq!(device.fences_alive(), 1);

        // released only once the read completes
        engine.dispose(&x)?;
        assert_eq!(engine.memory().pool.used_textures, 1);

        let (a, b) = tokio::join!(a, b);
        assert_eq!(a?, Values::from(values.clone()));
        assert_eq!(b?, Values::from(values));
        assert_eq!(device.fences_alive(), 0);

        let memory = engine.memory();
        assert_eq!(memory.buckets, 0);
        assert_eq!(memory.pool.used_textures, 0);
        assert_eq!(memory.pool.free_textures, 1);
        assert!(matches!(engine.ref_count(&x), Err(EngineError::UnknownData(_))));
        assert_eq!(engine.timings().downloads, 1);
        Ok(())
    }

    #[test]
    fn test_abandoned_read() -> Result<(), Box<dyn Error>> {
        let device = MockDevice::new().fence_delay(2);
        let engine = Engine::new(device.clone(), Flags::new());
        let x = engine.write(range(6), [6])?;
        engine.upload(&x)?;

        drop(engine.read(&x));
        assert_eq!(engine.memory().pending_reads, 1);
        assert_eq!(engine.read_sync(&x)?, range(6).into());
        assert_eq!(engine.memory().pending_reads, 0);
        assert_eq!(device.fences_alive(), 0);
        Ok(())
    }

    #[test]
    fn test_add_scalar() -> Result<(), Box<dyn Error>> {
        let (engine, device) = setup(Flags::new());
        let x = engine.write(range(13)[1..].to_vec(), [3, 4])?;
        let program = AddScalar::new([3, 4]);
        let expected: Vec<f32> = (11..=22).map(|x| x as f32).collect();

        let y = engine.run_program(&program, &[x.clone()], DataType::F32, &[10.0f32.into()])?;
        assert_eq!(engine.read_sync(&y)?, expected.clone().into());
        let z = engine.run_program(&program, &[x.clone()], DataType::F32, &[10.0f32.into()])?;
        assert_eq!(engine.read_sync(&z)?, expected.into());

        assert_eq!(engine.compile_count(), 1);
        assert_eq!(device.programs_created(), 1);
        assert_eq!(device.uploads(), 1);

        let err = engine.run_program(&program, &[x.clone()], DataType::F32, &[1i32.into()]);
        assert!(matches!(err, Err(EngineError::UniformMismatch { .. })));
        let err = engine.run_program(&program, &[x], DataType::F32, &[]);
        assert!(matches!(err, Err(EngineError::UniformMismatch { .. })));
        Ok(())
    }

    #[test]
    fn test_uniform_input() -> Result<(), Box<dyn Error>> {
        let (engine, device) = setup(Flags::new());
        let x = engine.write(vec![5.0f32], Shape::scalar())?;
        let program = AddScalar::new(Shape::scalar());
        let y = engine.run_program(&program, &[x], DataType::F32, &[1.5f32.into()])?;
        assert_eq!(device.uploads(), 0);
        assert_eq!(engine.read_sync(&y)?, vec![6.5f32].into());
        Ok(())
    }

    #[test]
    fn test_shape_uniforms() -> Result<(), Box<dyn Error>> {
        let (engine, _) = setup(Flags::new().use_shape_uniforms(true));
        for shape in [[3, 4], [5, 6]] {
            let size = shape[0] * shape[1];
            let x = engine.write(range(size), shape)?;
            let mut program = AddScalar::new(shape);
            program.shape_uniforms = true;
            let y = engine.run_program(&program, &[x], DataType::F32, &[1.0f32.into()])?;
            let expected: Vec<f32> = (1..=size).map(|x| x as f32).collect();
            assert_eq!(engine.read_sync(&y)?, expected.into());
        }
        assert_eq!(engine.compile_count(), 1);
        Ok(())
    }

    #[test]
    fn test_half_output() -> Result<(), Box<dyn Error>> {
        let (engine, _) = setup(Flags::new().render_float32(false));
        let x = engine.write(vec![1, 2, 3, 4, 5, 6], [2, 3])?;
        let y = engine.run_program(&AddScalar::new([2, 3]), &[x], DataType::I32, &[0.5f32.into()])?;
        assert_eq!(engine.read_sync(&y)?, vec![2, 3, 4, 5, 6, 7].into());
        Ok(())
    }

    #[test]
    fn test_numerical_problems() {
        let flags = Flags::new()
            .render_float32(false)
            .check_numerical_problems(true);
        let (engine, _) = setup(flags);
        let err = engine.write(vec![1.0e6f32], [1]);
        assert!(matches!(err, Err(EngineError::NumericRepresentation(_))));
        assert!(engine.write(vec![1.0f32, 0.0, -2.5], [3]).is_ok());

        let (engine, _) = setup(Flags::new().check_numerical_problems(true));
        assert!(engine.write(vec![1.0e6f32], [1]).is_ok());
    }

    #[test]
    fn test_resource_limit() -> Result<(), Box<dyn Error>> {
        let (engine, device) = setup(Flags::new());
        let x = engine.write(range(8), [8])?;
        let program = AddScalar::new([50000, 50000]);
        let err = engine.run_program(&program, &[x], DataType::F32, &[10.0f32.into()]);
        assert!(matches!(
            err,
            Err(EngineError::Layout(LayoutError::ResourceLimitExceeded { .. }))
        ));
        assert_eq!(device.textures_created(), 0);
        assert_eq!(engine.compile_count(), 0);
        Ok(())
    }

    #[test]
    fn test_slices() -> Result<(), Box<dyn Error>> {
        let (engine, device) = setup(Flags::new());
        let x = engine.write(range(12), [4, 3])?;

        // still on the host
        let host = engine.shallow_slice(&x, &[1, 1], &[2, 2])?;
        assert_eq!(engine.read_sync(&host)?, vec![4.0f32, 5.0, 7.0, 8.0].into());
        assert_eq!(engine.ref_count(&x)?, 1);

        engine.upload(&x)?;
        let created = device.textures_created();
        let s = engine.shallow_slice(&x, &[1, 0], &[2, 3])?;
        assert_eq!(engine.ref_count(&x)?, 2);
        assert_eq!(device.textures_created(), created);

        // views of views share the origin
        let t = engine.shallow_slice(&s, &[1, 0], &[1, 3])?;
        assert_eq!(engine.ref_count(&x)?, 3);
        assert_eq!(engine.ref_count(&s)?, 1);

        assert_eq!(engine.read_sync(&s)?, range(9)[3..].to_vec().into());
        assert_eq!(engine.read_sync(&t)?, range(9)[6..].to_vec().into());

        engine.dispose(&t)?;
        engine.dispose(&s)?;
        assert_eq!(engine.ref_count(&x)?, 1);

        let err = engine.shallow_slice(&x, &[0, 1], &[2, 2]);
        assert!(matches!(err, Err(EngineError::Slice { .. })));
        let err = engine.shallow_slice(&x, &[3, 0], &[2, 3]);
        assert!(matches!(err, Err(EngineError::Slice { .. })));

        engine.dispose(&x)?;
        assert!(matches!(engine.dispose(&x), Err(EngineError::UnknownData(_))));
        Ok(())
    }

    #[test]
    fn test_slice_input() -> Result<(), Box<dyn Error>> {
        let (engine, _) = setup(Flags::new());
        let x = engine.write(range(12), [4, 3])?;
        engine.upload(&x)?;
        let s = engine.shallow_slice(&x, &[2, 0], &[2, 3])?;
        // a slice is bound with the texture of its origin and an offset
        let y = engine.run_program(&AddScalar::new([2, 3]), &[s], DataType::F32, &[0.0f32.into()])?;
        assert_eq!(engine.read_sync(&y)?, range(12)[6..].to_vec().into());
        Ok(())
    }

    #[test]
    fn test_float_encoding() -> Result<(), Box<dyn Error>> {
        let (engine, device) = setup(Flags::new().download_float(false));
        let values = vec![-1.5f32, 3.25, 1.0e-3, 65504.0, -0.0, 1.0e30];
        let x = engine.write(values.clone(), [2, 3])?;
        engine.upload(&x)?;
        assert_eq!(engine.read_sync(&x)?, values.into());
        assert_eq!(device.draws(), vec!["encode_float".to_string()]);
        // the encoded texture goes back to the pool
        assert_eq!(engine.memory().pool.used_textures, 1);
        Ok(())
    }

    #[test]
    fn test_packed() -> Result<(), Box<dyn Error>> {
        let (engine, device) = setup(Flags::new());
        device.emulate("double", |call| {
            call.inputs[0].iter().map(|x| x.map(|x| x * 2.0)).collect()
        });
        device.emulate("unpack", |call| {
            let flat: Vec<f32> = call.inputs[0].iter().flatten().copied().collect();
            let values = decode_packed(&flat, &[3, 5]);
            values.into_iter().map(|x| [x, 0.0, 0.0, 0.0]).collect()
        });
        device.emulate("reshape_packed", |call| {
            let flat: Vec<f32> = call.inputs[0].iter().flatten().copied().collect();
            let values = decode_packed(&flat, &[1, 3, 5]);
            let texels = encode_packed(&values, &[1, 5, 3], call.texels());
            texels.chunks_exact(4).map(|x| [x[0], x[1], x[2], x[3]]).collect()
        });

        let values = range(15);
        let doubled: Vec<f32> = values.iter().map(|x| x * 2.0).collect();
        let x = engine.write(values, [3, 5])?;

        // uploaded straight into a packed texture
        let y = engine.run_program(&Double([3, 5].into()), &[x], DataType::F32, &[])?;
        assert_eq!(engine.read_sync(&y)?, doubled.clone().into());
        assert_eq!(device.draws(), vec!["double".to_string()]);

        // unpacked for an unpacked program; the temporary is released
        let program = AddScalar::new([3, 5]);
        let z = engine.run_program(&program, &[y.clone()], DataType::F32, &[1.0f32.into()])?;
        let expected: Vec<f32> = doubled.iter().map(|x| x + 1.0).collect();
        assert_eq!(engine.read_sync(&z)?, expected.into());
        assert!(device.draws().contains(&"unpack".to_string()));
        assert_eq!(engine.memory().buckets, 3);

        let r = engine.reshape(&y, [5, 3])?;
        assert_ne!(r.id, y.id);
        assert_eq!(engine.read_sync(&r)?, doubled.into());

        let free = engine.reshape(&y, [1, 3, 5])?;
        assert_eq!(free.id, y.id);
        assert_eq!(engine.ref_count(&y)?, 2);

        let err = engine.reshape(&y, [4, 4]);
        assert!(matches!(err, Err(EngineError::ShapeMismatch { expected: 15, found: 16 })));
        let err = engine.shallow_slice(&y, &[0, 0], &[1, 5]);
        assert!(matches!(err, Err(EngineError::Slice { .. })));
        Ok(())
    }

    #[test]
    fn test_pack_disabled() -> Result<(), Box<dyn Error>> {
        let (engine, device) = setup(Flags::new().pack(false));
        device.emulate("double", |call| {
            call.inputs[0].iter().map(|x| [x[0] * 2.0, 0.0, 0.0, 0.0]).collect()
        });

        let values = range(15);
        let doubled: Vec<f32> = values.iter().map(|x| x * 2.0).collect();
        let x = engine.write(values, [3, 5])?;
        let program = Double([3, 5].into());
        let y = engine.run_program(&program, &[x], DataType::F32, &[])?;
        assert_eq!(engine.read_sync(&y)?, doubled.clone().into());

        // no layout conversions on the way in or out
        assert_eq!(device.draws(), vec!["double".to_string()]);
        assert_eq!(device.programs_created(), 1);

        // chained runs stay unpacked and reuse the program
        let z = engine.run_program(&program, &[y], DataType::F32, &[])?;
        let expected: Vec<f32> = doubled.iter().map(|x| x * 2.0).collect();
        assert_eq!(engine.read_sync(&z)?, expected.into());
        engine.compile_only(&program, &[z])?;
        assert_eq!(engine.compile_count(), 1);
        assert!(!device.draws().iter().any(|x| x.contains("pack")));
        Ok(())
    }

    #[tokio::test]
    async fn test_timer_query_fence() -> Result<(), Box<dyn Error>> {
        let mut capabilities = Device::capabilities(&MockDevice::new());
        capabilities.native_fence = false;
        capabilities.timer_query = true;
        let device = MockDevice::new().capabilities(capabilities).fence_delay(1);
        let engine = Engine::new(device.clone(), Flags::new());
        let x = engine.write(range(6), [6])?;
        engine.upload(&x)?;

        let read = engine.read(&x);
        // the query result lags the copy by one poll
        assert_eq!(engine.tick(), 0);
        assert_eq!(engine.tick(), 0);
        assert_eq!(read.await?, range(6).into());
        assert_eq!(device.fence_kinds(), vec![FenceKind::TimerQuery]);
        assert_eq!(device.fences_alive(), 0);

        // requested without support, a native fence stands in
        let device = MockDevice::new();
        let engine = Engine::new(device.clone(), Flags::new().fence(FenceKind::TimerQuery));
        let x = engine.write(range(6), [6])?;
        engine.upload(&x)?;
        assert_eq!(engine.read_sync(&x)?, range(6).into());
        assert_eq!(device.fence_kinds(), vec![FenceKind::Native]);
        Ok(())
    }

    #[test]
    fn test_teardown_pending_reads() -> Result<(), Box<dyn Error>> {
        let device = MockDevice::new().fence_delay(5);
        let engine = Engine::new(device.clone(), Flags::new());
        let x = engine.write(range(8), [8])?;
        engine.upload(&x)?;
        let y = engine.write(range(9), [3, 3])?;
        engine.upload(&y)?;

        let _a = engine.read(&x);
        let _b = engine.read(&y);
        assert_eq!(engine.tick(), 0);
        assert_eq!(device.pixels_alive(), 2);
        assert_eq!(device.fences_alive(), 2);

        engine.teardown();
        assert_eq!(device.pixels_alive(), 0);
        assert_eq!(device.fences_alive(), 0);
        assert_eq!(device.textures_alive(), 0);
        Ok(())
    }

    #[test]
    fn test_compile_only() -> Result<(), Box<dyn Error>> {
        let (engine, device) = setup(Flags::new());
        let x = engine.write(range(12), [3, 4])?;
        let program = AddScalar::new([3, 4]);
        engine.compile_only(&program, &[x.clone()])?;
        assert_eq!(engine.compile_count(), 1);
        assert_eq!(device.textures_created(), 0);
        assert!(device.draws().is_empty());

        engine.run_program(&program, &[x], DataType::F32, &[0.0f32.into()])?;
        assert_eq!(engine.compile_count(), 1);
        Ok(())
    }

    #[test]
    fn test_source_ignores_capabilities() -> Result<(), Box<dyn Error>> {
        let mut fragments = vec![];
        for (single_channel_float, render_float32) in [(true, true), (false, false), (true, false)] {
            let mut capabilities = Device::capabilities(&MockDevice::new());
            capabilities.single_channel_float = single_channel_float;
            capabilities.render_float32 = render_float32;
            let device = MockDevice::new().capabilities(capabilities);
            let engine = Engine::new(device.clone(), Flags::new());
            let x = engine.write(range(12), [3, 4])?;
            engine.upload(&x)?;
            engine.compile_only(&AddScalar::new([3, 4]), &[x])?;
            fragments.extend(device.fragments());
        }
        assert_eq!(fragments.len(), 3);
        assert!(fragments.iter().all_equal());
        Ok(())
    }

    #[test]
    fn test_empty_and_teardown() -> Result<(), Box<dyn Error>> {
        let (engine, device) = setup(Flags::new());
        let x = engine.write(Vec::<f32>::new(), [0, 3])?;
        let y = engine.run_program(&AddScalar::new([0, 3]), &[x], DataType::F32, &[0.0f32.into()])?;
        assert_eq!(engine.read_sync(&y)?, Vec::<f32>::new().into());
        assert_eq!(device.textures_created(), 0);

        let err = engine.write(vec![1.0f32, 2.0], [3]);
        assert!(matches!(err, Err(EngineError::ShapeMismatch { expected: 3, found: 2 })));

        let z = engine.write(range(8), [8])?;
        engine.upload(&z)?;
        let _ = engine.read(&z);
        assert_eq!(device.pixels_alive(), 1);
        engine.teardown();
        assert_eq!(device.textures_alive(), 0);
        assert_eq!(device.fences_alive(), 0);
        assert_eq!(device.pixels_alive(), 0);
        assert_eq!(engine.memory().buckets, 0);
        Ok(())
    }
}
