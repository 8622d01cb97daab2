//! An in-memory [`Device`] for tests. Programs are emulated on the host by label.

use std::{cell::RefCell, rc::Rc};

use half::f16;
use rustc_hash::FxHashMap as HashMap;

use super::{
    Capabilities, Device, DeviceError, DrawCall, FenceId, FenceKind, PixelBufferId, ProgramDesc,
    ProgramId, TextureDesc, TextureFormat, TextureId,
};

pub type Texel = [f32; 4];

/// Host view of one draw, handed to an emulator.
pub struct Invocation<'a> {
    pub label: &'a str,
    /// Texels of every bound input texture, all four channels (missing channels are 0).
    pub inputs: Vec<Vec<Texel>>,
    pub target: TextureDesc,
    offsets: &'a HashMap<String, u32>,
    uniforms: &'a [u8],
}

impl Invocation<'_> {
    fn bytes(&self, name: &str) -> Option<[u8; 4]> {
        let offset = *self.offsets.get(name)? as usize;
        let bytes = self.uniforms.get(offset..offset + 4)?;
        Some([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    /// Reads a scalar float uniform; 0 if absent.
    pub fn f32(&self, name: &str) -> f32 {
        self.bytes(name).map(f32::from_le_bytes).unwrap_or_default()
    }

    /// Reads a scalar integer uniform; 0 if absent.
    pub fn i32(&self, name: &str) -> i32 {
        self.bytes(name).map(i32::from_le_bytes).unwrap_or_default()
    }

    #[inline]
    pub fn texels(&self) -> usize {
        (self.target.width * self.target.height) as usize
    }
}

pub type Emulator = Rc<dyn Fn(&Invocation) -> Vec<Texel>>;

#[derive(Debug, Clone)]
struct MockTexture {
    desc: TextureDesc,
    data: Vec<Texel>,
}

#[derive(Debug, Clone)]
struct MockProgram {
    label: String,
    offsets: HashMap<String, u32>,
}

struct MockState {
    capabilities: Capabilities,
    textures: HashMap<TextureId, MockTexture>,
    programs: HashMap<ProgramId, MockProgram>,
    pixels: HashMap<PixelBufferId, Vec<u8>>,
    /// Polls left before each fence signals.
    fences: HashMap<FenceId, usize>,
    /// Kind of every fence created, after fallback.
    fence_kinds: Vec<FenceKind>,
    emulators: HashMap<String, Emulator>,
    fence_delay: usize,
    next: usize,
    textures_created: usize,
    programs_created: usize,
    /// Fragment source of every program created, in order.
    fragments: Vec<String>,
    uploads: usize,
    draws: Vec<String>,
}

/// A shared handle to the mock; clones observe the same device.
#[derive(Clone)]
pub struct MockDevice(Rc<RefCell<MockState>>);

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDevice {
    pub fn new() -> Self {
        let capabilities = Capabilities {
            max_texture_size: 16384,
            single_channel_float: true,
            render_float32: true,
            download_float: true,
            native_fence: true,
            timer_query: false,
        };
        let state = MockState {
            capabilities,
            textures: Default::default(),
            programs: Default::default(),
            pixels: Default::default(),
            fences: Default::default(),
            fence_kinds: vec![],
            emulators: Default::default(),
            fence_delay: 0,
            next: 0,
            textures_created: 0,
            programs_created: 0,
            fragments: vec![],
            uploads: 0,
            draws: vec![],
        };
        let device = Self(Rc::new(RefCell::new(state)));
        device.emulate("copy", copy);
        device.emulate("encode_float", encode_float);
        device
    }

    pub fn capabilities(self, capabilities: Capabilities) -> Self {
        self.0.borrow_mut().capabilities = capabilities;
        self
    }

    /// Number of polls a fence stays unsignaled.
    pub fn fence_delay(self, polls: usize) -> Self {
        self.0.borrow_mut().fence_delay = polls;
        self
    }

    /// Registers the host emulation of programs labeled `label`.
    pub fn emulate(&self, label: &str, f: impl Fn(&Invocation) -> Vec<Texel> + 'static) {
        let f: Emulator = Rc::new(f);
        self.0.borrow_mut().emulators.insert(label.to_string(), f);
    }

    pub fn textures_created(&self) -> usize {
        self.0.borrow().textures_created
    }

    pub fn textures_alive(&self) -> usize {
        self.0.borrow().textures.len()
    }

    pub fn programs_created(&self) -> usize {
        self.0.borrow().programs_created
    }

    pub fn fragments(&self) -> Vec<String> {
        self.0.borrow().fragments.clone()
    }

    pub fn uploads(&self) -> usize {
        self.0.borrow().uploads
    }

    /// Labels of every program drawn, in order.
    pub fn draws(&self) -> Vec<String> {
        self.0.borrow().draws.clone()
    }

    pub fn fences_alive(&self) -> usize {
        self.0.borrow().fences.len()
    }

    pub fn fence_kinds(&self) -> Vec<FenceKind> {
        self.0.borrow().fence_kinds.clone()
    }

    pub fn pixels_alive(&self) -> usize {
        self.0.borrow().pixels.len()
    }

    /// Texels currently stored in `texture`.
    pub fn texels(&self, texture: TextureId) -> Option<Vec<Texel>> {
        self.0.borrow().textures.get(&texture).map(|x| x.data.clone())
    }

    fn next_handle(&self) -> usize {
        let mut state = self.0.borrow_mut();
        let handle = state.next;
        state.next += 1;
        handle
    }
}

/// Copies channel 0 of every texel, shifted by the `offset_x` uniform of a slice input.
pub fn copy(call: &Invocation) -> Vec<Texel> {
    let offset = call.i32("offset_x").max(0) as usize;
    let input = &call.inputs[0];
    (0..call.texels())
        .map(|index| {
            let value = input.get(index + offset).map(|x| x[0]).unwrap_or_default();
            [value, 0.0, 0.0, 0.0]
        })
        .collect()
}

/// Writes the IEEE bytes of channel 0 of every texel into the four normalized channels.
pub fn encode_float(call: &Invocation) -> Vec<Texel> {
    let input = &call.inputs[0];
    (0..call.texels())
        .map(|index| {
            let value = input.get(index).map(|x| x[0]).unwrap_or_default();
            value.to_le_bytes().map(|x| x as f32 / 255.0)
        })
        .collect()
}

fn to_texels(format: TextureFormat, bytes: &[u8]) -> Vec<Texel> {
    let channels = format.channels();
    let values: Vec<f32> = match format {
        TextureFormat::R16Float | TextureFormat::Rgba16Float => bytes
            .chunks_exact(2)
            .map(|x| f16::from_le_bytes([x[0], x[1]]).to_f32())
            .collect(),
        TextureFormat::R32Float | TextureFormat::Rgba32Float => bytemuck::pod_collect_to_vec(bytes),
        TextureFormat::Rgba8Unorm => bytes.iter().map(|&x| x as f32 / 255.0).collect(),
    };
    values
        .chunks_exact(channels)
        .map(|x| {
            let mut texel = [0.0; 4];
            texel[..channels].copy_from_slice(x);
            texel
        })
        .collect()
}

fn from_texels(format: TextureFormat, texels: &[Texel]) -> Vec<u8> {
    let channels = format.channels();
    let values = texels.iter().flat_map(|x| x[..channels].iter().copied());
    match format {
        TextureFormat::R16Float | TextureFormat::Rgba16Float => values
            .flat_map(|x| f16::from_f32(x).to_le_bytes())
            .collect(),
        TextureFormat::R32Float | TextureFormat::Rgba32Float => {
            values.flat_map(|x| x.to_le_bytes()).collect()
        }
        TextureFormat::Rgba8Unorm => values
            .map(|x| (x.clamp(0.0, 1.0) * 255.0).round() as u8)
            .collect(),
    }
}

/// Byte offsets of the members of the uniform block of a WGSL module.
fn uniform_offsets(label: &str, source: &str) -> Result<HashMap<String, u32>, DeviceError> {
    let module =
        naga::front::wgsl::parse_str(source).map_err(|err| DeviceError::LinkOrCompileFailure {
            label: label.to_string(),
            message: err.emit_to_string(source),
            source: source.to_string(),
        })?;
    let offsets = module
        .global_variables
        .iter()
        .filter(|(_, var)| var.space == naga::AddressSpace::Uniform)
        .flat_map(|(_, var)| match &module.types[var.ty].inner {
            naga::TypeInner::Struct { members, .. } => members.clone(),
            _ => vec![],
        })
        .filter_map(|member| Some((member.name?, member.offset)))
        .collect();
    Ok(offsets)
}

impl Device for MockDevice {
    fn capabilities(&self) -> Capabilities {
        self.0.borrow().capabilities
    }

    fn create_texture(&self, desc: TextureDesc) -> Result<TextureId, DeviceError> {
        let max = self.0.borrow().capabilities.max_texture_size as u32;
        if desc.width > max || desc.height > max {
            return Err(DeviceError::ResourceCreationFailed {
                resource: "texture",
                reason: format!("{}x{} exceeds {max}", desc.width, desc.height),
            });
        }
        let id = TextureId(self.next_handle());
        let data = vec![[0.0; 4]; (desc.width * desc.height) as usize];
        let mut state = self.0.borrow_mut();
        state.textures.insert(id, MockTexture { desc, data });
        state.textures_created += 1;
        Ok(id)
    }

    fn upload_texture(&self, texture: TextureId, data: &[u8]) -> Result<(), DeviceError> {
        let mut state = self.0.borrow_mut();
        state.uploads += 1;
        let texture = state
            .textures
            .get_mut(&texture)
            .ok_or_else(|| DeviceError::UnknownHandle(texture.to_string()))?;
        let expected = (texture.desc.width * texture.desc.height) as usize
            * texture.desc.format.bytes_per_texel();
        if data.len() != expected {
            return Err(DeviceError::Backend(format!(
                "upload of {} bytes into a texture of {expected}",
                data.len()
            )));
        }
        texture.data = to_texels(texture.desc.format, data);
        Ok(())
    }

    fn delete_texture(&self, texture: TextureId) {
        self.0.borrow_mut().textures.remove(&texture);
    }

    fn create_program(&self, desc: &ProgramDesc) -> Result<ProgramId, DeviceError> {
        let offsets = uniform_offsets(desc.label, desc.fragment)?;
        let id = ProgramId(self.next_handle());
        let program = MockProgram {
            label: desc.label.to_string(),
            offsets,
        };
        let mut state = self.0.borrow_mut();
        state.programs.insert(id, program);
        state.programs_created += 1;
        state.fragments.push(desc.fragment.to_string());
        Ok(id)
    }

    fn delete_program(&self, program: ProgramId) {
        self.0.borrow_mut().programs.remove(&program);
    }

    fn draw(&self, call: &DrawCall) -> Result<(), DeviceError> {
        let (program, target, inputs, emulator) = {
            let state = self.0.borrow();
            let unknown = |id: String| DeviceError::UnknownHandle(id);
            let program = state
                .programs
                .get(&call.program)
                .cloned()
                .ok_or_else(|| unknown(call.program.to_string()))?;
            let target = state
                .textures
                .get(&call.target)
                .map(|x| x.desc)
                .ok_or_else(|| unknown(call.target.to_string()))?;
            let inputs = call
                .textures
                .iter()
                .map(|id| match state.textures.get(id) {
                    Some(texture) => Ok(texture.data.clone()),
                    None => Err(unknown(id.to_string())),
                })
                .collect::<Result<Vec<_>, _>>()?;
            let emulator = state.emulators.get(&program.label).cloned().ok_or_else(|| {
                DeviceError::Backend(format!("no emulation for program {}", program.label))
            })?;
            (program, target, inputs, emulator)
        };

        let invocation = Invocation {
            label: &program.label,
            inputs,
            target,
            offsets: &program.offsets,
            uniforms: call.uniforms,
        };
        let mut data = emulator(&invocation);
        data.resize(invocation.texels(), [0.0; 4]);

        // round through the target format so precision matches a real device
        let data = to_texels(target.format, &from_texels(target.format, &data));

        let mut state = self.0.borrow_mut();
        state.draws.push(program.label);
        if let Some(texture) = state.textures.get_mut(&call.target) {
            texture.data = data;
        }
        Ok(())
    }

    fn read_pixels(&self, texture: TextureId) -> Result<PixelBufferId, DeviceError> {
        let bytes = {
            let state = self.0.borrow();
            let texture = state
                .textures
                .get(&texture)
                .ok_or_else(|| DeviceError::UnknownHandle(texture.to_string()))?;
            from_texels(texture.desc.format, &texture.data)
        };
        let id = PixelBufferId(self.next_handle());
        self.0.borrow_mut().pixels.insert(id, bytes);
        Ok(id)
    }

    fn map_pixels(&self, buffer: PixelBufferId) -> Result<Vec<u8>, DeviceError> {
        self.0
            .borrow_mut()
            .pixels
            .remove(&buffer)
            .ok_or_else(|| DeviceError::UnknownHandle(buffer.to_string()))
    }

    fn delete_pixels(&self, buffer: PixelBufferId) {
        self.0.borrow_mut().pixels.remove(&buffer);
    }

    fn create_fence(&self, kind: FenceKind) -> Result<FenceId, DeviceError> {
        let id = FenceId(self.next_handle());
        let mut state = self.0.borrow_mut();
        let kind = match kind {
            FenceKind::TimerQuery if !state.capabilities.timer_query => FenceKind::Native,
            kind => kind,
        };
        // a query result lands one poll after the work it follows
        let delay = match kind {
            FenceKind::Immediate => 0,
            FenceKind::Native => state.fence_delay,
            FenceKind::TimerQuery => state.fence_delay + 1,
        };
        state.fences.insert(id, delay);
        state.fence_kinds.push(kind);
        Ok(id)
    }

    fn poll_fence(&self, fence: FenceId) -> Result<bool, DeviceError> {
        let mut state = self.0.borrow_mut();
        let remaining = state
            .fences
            .get_mut(&fence)
            .ok_or_else(|| DeviceError::UnknownHandle(fence.to_string()))?;
        match remaining {
            0 => Ok(true),
            n => {
                *n -= 1;
                Ok(false)
            }
        }
    }

    fn delete_fence(&self, fence: FenceId) {
        self.0.borrow_mut().fences.remove(&fence);
    }

    fn wait(&self) -> Result<(), DeviceError> {
        let mut state = self.0.borrow_mut();
        state.fences.values_mut().for_each(|x| *x = 0);
        Ok(())
    }
}
