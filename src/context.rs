//! The single device context every dispatch goes through.

use std::cell::{OnceCell, Ref, RefCell};

use half::f16;

use crate::{
    config::Flags,
    device::{
        Capabilities, Device, DeviceError, DrawCall, FenceId, FenceKind, PixelBufferId,
        ProgramDesc, ProgramId, Rect, TextureDesc, TextureFormat, TextureId, annotate_source,
    },
    layout::{PhysicalFormat, PhysicalShape, TextureLimits},
    shader::ShaderSource,
};

/// Device state set up by the binding steps of a dispatch and consumed by the draw.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BoundState {
    pub program: Option<ProgramId>,
    pub target: Option<TextureId>,
    pub viewport: Rect,
    pub scissor: Rect,
    /// Texture units, in binding order.
    pub units: Vec<Option<TextureId>>,
    pub uniforms: Vec<u8>,
}

pub struct DeviceContext {
    device: Box<dyn Device>,
    flags: Flags,
    capabilities: OnceCell<Capabilities>,
    state: RefCell<BoundState>,
}

impl std::fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceContext")
            .field("flags", &self.flags)
            .field("capabilities", &self.capabilities)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// Parses and validates WGSL, reporting failures against the annotated source.
fn validate(label: &str, source: &str) -> Result<(), DeviceError> {
    let failure = |message: String, line: Option<u32>| DeviceError::LinkOrCompileFailure {
        label: label.to_string(),
        message,
        source: annotate_source(source, line.map(|x| x as usize)),
    };

    let module = naga::front::wgsl::parse_str(source).map_err(|err| {
        let line = err.location(source).map(|x| x.line_number);
        failure(err.message().to_string(), line)
    })?;
    let mut validator = naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::default(),
    );
    validator.validate(&module).map_err(|err| {
        let line = err.location(source).map(|x| x.line_number);
        failure(err.as_inner().to_string(), line)
    })?;
    Ok(())
}

/// Serializes float texel data into the byte layout of `format`.
pub fn texel_bytes(format: TextureFormat, texels: &[f32]) -> Vec<u8> {
    match format {
        TextureFormat::R16Float | TextureFormat::Rgba16Float => texels
            .iter()
            .flat_map(|&x| f16::from_f32(x).to_le_bytes())
            .collect(),
        TextureFormat::R32Float | TextureFormat::Rgba32Float => {
            bytemuck::cast_slice(texels).to_vec()
        }
        TextureFormat::Rgba8Unorm => texels
            .iter()
            .map(|x| (x.clamp(0.0, 1.0) * 255.0).round() as u8)
            .collect(),
    }
}

impl DeviceContext {
    pub fn new(device: impl Device + 'static, flags: Flags) -> Self {
        Self {
            device: Box::new(device),
            flags,
            capabilities: OnceCell::new(),
            state: Default::default(),
        }
    }

    #[inline]
    pub fn flags(&self) -> &Flags {
        &self.flags
    }

    /// Device capabilities with configured overrides applied. Queried on first use.
    pub fn capabilities(&self) -> Capabilities {
        *self.capabilities.get_or_init(|| {
            let mut capabilities = self.device.capabilities();
            if let Some(max) = self.flags.max_texture_size {
                capabilities.max_texture_size = capabilities.max_texture_size.min(max);
            }
            if let Some(render_float32) = self.flags.render_float32 {
                capabilities.render_float32 = render_float32;
            }
            if let Some(download_float) = self.flags.download_float {
                capabilities.download_float = download_float;
            }
            log::debug!("device capabilities: {capabilities:?}");
            capabilities
        })
    }

    pub fn limits(&self) -> TextureLimits {
        let max_texture_size = self.capabilities().max_texture_size;
        let max_size_for_narrow_texture = match self.flags.max_size_for_narrow_texture {
            Some(max) => max,
            None if self.flags.auto_squarify_narrow_texture => max_texture_size / 2,
            None => usize::MAX,
        };
        TextureLimits {
            max_texture_size,
            max_size_for_narrow_texture,
        }
    }

    #[inline]
    pub fn unpacked_channels(&self) -> usize {
        self.capabilities().unpacked_channels()
    }

    /// Best fence mechanism available, unless configured otherwise.
    pub fn fence_kind(&self) -> FenceKind {
        self.flags
            .fence
            .unwrap_or_else(|| self.capabilities().fence())
    }

    /// The single place device errors pass through on their way to the caller.
    pub fn check_error<T>(&self, result: Result<T, DeviceError>) -> Result<T, DeviceError> {
        if let Err(err) = &result {
            log::error!("{err}");
        }
        result
    }

    pub fn texture_format(&self, format: PhysicalFormat) -> TextureFormat {
        TextureFormat::new(format, self.unpacked_channels())
    }

    pub fn create_texture(
        &self,
        shape: PhysicalShape,
        format: PhysicalFormat,
        packed: bool,
    ) -> Result<TextureId, DeviceError> {
        let texels = shape.texels(packed);
        let desc = TextureDesc {
            width: texels.cols as u32,
            height: texels.rows as u32,
            format: self.texture_format(format),
        };
        self.check_error(self.device.create_texture(desc))
    }

    /// Uploads float texel data, converting it to the texture's format.
    pub fn upload_texture(
        &self,
        texture: TextureId,
        format: PhysicalFormat,
        texels: &[f32],
    ) -> Result<(), DeviceError> {
        let data = texel_bytes(self.texture_format(format), texels);
        self.check_error(self.device.upload_texture(texture, &data))
    }

    pub fn delete_texture(&self, texture: TextureId) {
        let mut state = self.state.borrow_mut();
        if state.target == Some(texture) {
            state.target = None;
        }
        for unit in state.units.iter_mut().filter(|x| **x == Some(texture)) {
            *unit = None;
        }
        self.device.delete_texture(texture);
    }

    /// Validates and creates a program. Failures carry the annotated source.
    pub fn create_program(
        &self,
        label: &str,
        source: &ShaderSource,
    ) -> Result<ProgramId, DeviceError> {
        self.check_error(validate(label, source.vertex()))?;
        self.check_error(validate(label, source.fragment()))?;
        let desc = ProgramDesc {
            label,
            vertex: source.vertex(),
            fragment: source.fragment(),
            textures: source.textures().len(),
            uniform_size: source.uniforms().size(),
        };
        self.check_error(self.device.create_program(&desc))
    }

    pub fn delete_program(&self, program: ProgramId) {
        let mut state = self.state.borrow_mut();
        if state.program == Some(program) {
            state.program = None;
        }
        self.device.delete_program(program);
    }

    pub fn bind_program(&self, program: ProgramId) {
        self.state.borrow_mut().program = Some(program);
    }

    /// Makes `texture` the render target, with viewport and scissor covering exactly its texels.
    pub fn bind_output(&self, texture: TextureId, texels: PhysicalShape) {
        let rect = Rect {
            x: 0,
            y: 0,
            width: texels.cols as u32,
            height: texels.rows as u32,
        };
        let mut state = self.state.borrow_mut();
        state.target = Some(texture);
        state.viewport = rect;
        state.scissor = rect;
    }

    pub fn unbind_output(&self) {
        let mut state = self.state.borrow_mut();
        state.target = None;
        state.units.clear();
    }

    pub fn bind_input(&self, unit: usize, texture: TextureId) {
        let mut state = self.state.borrow_mut();
        if state.units.len() <= unit {
            state.units.resize(unit + 1, None);
        }
        state.units[unit] = Some(texture);
    }

    pub fn set_uniforms(&self, uniforms: Vec<u8>) {
        self.state.borrow_mut().uniforms = uniforms;
    }

    #[inline]
    pub fn bound(&self) -> Ref<'_, BoundState> {
        self.state.borrow()
    }

    /// Draws the quad with everything bound.
    pub fn execute_program(&self) -> Result<(), DeviceError> {
        let state = self.state.borrow();
        let missing = |what: &str| DeviceError::Backend(format!("no {what} bound"));
        let program = state.program.ok_or_else(|| missing("program"))?;
        let target = state.target.ok_or_else(|| missing("output"))?;
        let textures = state
            .units
            .iter()
            .enumerate()
            .map(|(unit, texture)| texture.ok_or_else(|| missing(&format!("texture unit {unit}"))))
            .collect::<Result<Vec<_>, _>>()?;
        let call = DrawCall {
            program,
            target,
            viewport: state.viewport,
            scissor: state.scissor,
            textures: &textures,
            uniforms: &state.uniforms,
        };
        self.check_error(self.device.draw(&call))
    }

    pub fn read_pixels(&self, texture: TextureId) -> Result<PixelBufferId, DeviceError> {
        self.check_error(self.device.read_pixels(texture))
    }

    pub fn map_pixels(&self, buffer: PixelBufferId) -> Result<Vec<u8>, DeviceError> {
        self.check_error(self.device.map_pixels(buffer))
    }

    pub fn delete_pixels(&self, buffer: PixelBufferId) {
        self.device.delete_pixels(buffer);
    }

    pub fn create_fence(&self) -> Result<FenceId, DeviceError> {
        self.check_error(self.device.create_fence(self.fence_kind()))
    }

    pub fn poll_fence(&self, fence: FenceId) -> Result<bool, DeviceError> {
        self.check_error(self.device.poll_fence(fence))
    }

    pub fn delete_fence(&self, fence: FenceId) {
        self.device.delete_fence(fence);
    }

    pub fn wait(&self) -> Result<(), DeviceError> {
        self.check_error(self.device.wait())
    }
}
