use std::{
    cell::{Cell, RefCell},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use rustc_hash::FxHashMap as HashMap;
use thiserror::Error;
use wgpu::util::DeviceExt;

use super::{
    Capabilities, Device, DeviceError, DeviceId, DrawCall, FenceId, FenceKind, PixelBufferId,
    ProgramDesc, ProgramId, QUAD_INDICES, QUAD_VERTICES, TextureDesc, TextureFormat, TextureId,
};
use crate::platform;

impl From<TextureFormat> for wgpu::TextureFormat {
    fn from(value: TextureFormat) -> Self {
        match value {
            TextureFormat::R16Float => wgpu::TextureFormat::R16Float,
            TextureFormat::R32Float => wgpu::TextureFormat::R32Float,
            TextureFormat::Rgba16Float => wgpu::TextureFormat::Rgba16Float,
            TextureFormat::Rgba32Float => wgpu::TextureFormat::Rgba32Float,
            TextureFormat::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
        }
    }
}

#[derive(Debug)]
struct Texture {
    texture: wgpu::Texture,
    desc: TextureDesc,
}

#[derive(Debug)]
struct Program {
    label: String,
    vertex: wgpu::ShaderModule,
    fragment: wgpu::ShaderModule,
    layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
    /// Render pipelines, one per target format.
    pipelines: HashMap<TextureFormat, wgpu::RenderPipeline>,
}

#[derive(Debug)]
struct PixelBuffer {
    buffer: wgpu::Buffer,
    desc: TextureDesc,
    padded_bytes_per_row: u32,
    receiver: flume::Receiver<Result<(), wgpu::BufferAsyncError>>,
}

/// A timestamp written after all prior work, resolved and copied into a mappable buffer.
///
/// The mapping completes once the timestamp is available.
#[derive(Debug)]
struct TimerQuery {
    #[allow(unused)]
    set: wgpu::QuerySet,
    resolve: wgpu::Buffer,
    staging: wgpu::Buffer,
}

#[derive(Debug)]
struct Fence {
    signaled: Arc<AtomicBool>,
    query: Option<TimerQuery>,
}

/// A [`Device`] backed by `wgpu` render pipelines.
///
/// Works on every `wgpu` backend, including WebGL2 which has no compute shaders.
#[allow(unused)]
pub struct Gpu {
    /// The unique identifier of the device.
    id: uid::Id<DeviceId>,
    /// Handle to a WebGPU device.
    device: wgpu::Device,
    /// The WebGPU command queue.
    queue: wgpu::Queue,
    /// Capabilities detected at build time.
    capabilities: Capabilities,
    /// The full-viewport quad.
    vertices: wgpu::Buffer,
    indices: wgpu::Buffer,
    textures: RefCell<HashMap<TextureId, Texture>>,
    programs: RefCell<HashMap<ProgramId, Program>>,
    pixels: RefCell<HashMap<PixelBufferId, PixelBuffer>>,
    fences: RefCell<HashMap<FenceId, Fence>>,
    next: Cell<usize>,
}

impl std::fmt::Debug for Gpu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gpu")
            .field("id", &self.id)
            .field("capabilities", &self.capabilities)
            .finish_non_exhaustive()
    }
}

/// Features a timer query fence needs.
const TIMER_QUERY_FEATURES: wgpu::Features = wgpu::Features::TIMESTAMP_QUERY
    .union(wgpu::Features::TIMESTAMP_QUERY_INSIDE_ENCODERS);

pub struct GpuBuilder {
    pub adapter: wgpu::Adapter,
    pub features: wgpu::Features,
    pub limits: wgpu::Limits,
}

#[derive(Debug, Error)]
pub enum GpuBuildError {
    #[error("failed to request adaptor")]
    RequestAdapterError(#[from] wgpu::RequestAdapterError),
    #[error("failed to request device")]
    RequestDeviceError(#[from] wgpu::RequestDeviceError),
}

impl GpuBuilder {
    pub fn new(adapter: wgpu::Adapter) -> Self {
        let features = adapter.features() & TIMER_QUERY_FEATURES;
        let limits = wgpu::Limits::downlevel_webgl2_defaults().using_resolution(adapter.limits());
        Self {
            adapter,
            features,
            limits,
        }
    }

    pub async fn build(self) -> Result<Gpu, GpuBuildError> {
        let Self {
            adapter,
            features,
            limits,
        } = self;

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: None,
                required_features: features,
                required_limits: limits.clone(),
                memory_hints: wgpu::MemoryHints::Performance,
                trace: wgpu::Trace::Off,
            })
            .await?;
        device.on_uncaptured_error(Box::new(|error| {
            log::error!("uncaptured device error: {error}")
        }));

        let renderable = |format: wgpu::TextureFormat| {
            adapter
                .get_texture_format_features(format)
                .allowed_usages
                .contains(wgpu::TextureUsages::RENDER_ATTACHMENT)
        };
        let copyable = adapter
            .get_texture_format_features(wgpu::TextureFormat::Rgba32Float)
            .allowed_usages
            .contains(wgpu::TextureUsages::COPY_SRC);
        let capabilities = Capabilities {
            max_texture_size: limits.max_texture_dimension_2d as usize,
            single_channel_float: renderable(wgpu::TextureFormat::R32Float)
                && renderable(wgpu::TextureFormat::R16Float),
            render_float32: renderable(wgpu::TextureFormat::Rgba32Float),
            download_float: copyable,
            native_fence: cfg!(not(target_arch = "wasm32")),
            timer_query: features.contains(TIMER_QUERY_FEATURES),
        };
        log::info!("gpu capabilities: {capabilities:?}");

        let vertices = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("quad_vertices"),
            contents: bytemuck::cast_slice(&QUAD_VERTICES),
            usage: wgpu::BufferUsages::VERTEX,
        });
        let indices = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("quad_indices"),
            contents: bytemuck::cast_slice(&QUAD_INDICES),
            usage: wgpu::BufferUsages::INDEX,
        });

        Ok(Gpu {
            id: uid::Id::new(),
            device,
            queue,
            capabilities,
            vertices,
            indices,
            textures: Default::default(),
            programs: Default::default(),
            pixels: Default::default(),
            fences: Default::default(),
            next: Cell::new(0),
        })
    }

    pub fn limits(mut self, limits: wgpu::Limits) -> Self {
        self.limits = limits;
        self
    }

    pub fn features(mut self, features: wgpu::Features) -> Self {
        self.features = features;
        self
    }
}

/// Row pitch and total size of a buffer receiving a copy of a texture.
fn staging_layout(desc: TextureDesc) -> (u32, wgpu::BufferAddress) {
    let bytes_per_row = desc.width * desc.format.bytes_per_texel() as u32;
    let padded_bytes_per_row = bytes_per_row.next_multiple_of(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT);
    let rows = desc.height.max(1) as wgpu::BufferAddress;
    let size = padded_bytes_per_row as wgpu::BufferAddress * rows;
    (padded_bytes_per_row, size)
}

impl Gpu {
    #[inline]
    fn next_handle(&self) -> usize {
        let handle = self.next.get();
        self.next.set(handle + 1);
        handle
    }

    /// Runs `f` inside a validation error scope and reports the first error raised.
    #[cfg(not(target_arch = "wasm32"))]
    fn validate<T>(&self, f: impl FnOnce() -> T) -> (T, Option<wgpu::Error>) {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let output = f();
        let error = platform::block_on(self.device.pop_error_scope()).flatten();
        (output, error)
    }

    /// Error scopes cannot be awaited synchronously here; errors reach the uncaptured handler.
    #[cfg(target_arch = "wasm32")]
    fn validate<T>(&self, f: impl FnOnce() -> T) -> (T, Option<wgpu::Error>) {
        (f(), None)
    }

    /// Writes a timestamp behind all submitted work and maps its resolved value.
    fn timer_query(&self, signaled: Arc<AtomicBool>) -> Result<TimerQuery, DeviceError> {
        let size = wgpu::QUERY_SIZE as wgpu::BufferAddress;
        let (query, error) = self.validate(|| {
            let set = self.device.create_query_set(&wgpu::QuerySetDescriptor {
                label: Some("fence"),
                ty: wgpu::QueryType::Timestamp,
                count: 1,
            });
            let resolve = self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("fence_resolve"),
                size,
                usage: wgpu::BufferUsages::QUERY_RESOLVE | wgpu::BufferUsages::COPY_SRC,
                mapped_at_creation: false,
            });
            let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("fence_staging"),
                size,
                usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            });

            let mut encoder = self.device.create_command_encoder(&Default::default());
            encoder.write_timestamp(&set, 0);
            encoder.resolve_query_set(&set, 0..1, &resolve, 0);
            encoder.copy_buffer_to_buffer(&resolve, 0, &staging, 0, size);
            self.queue.submit(Some(encoder.finish()));
            TimerQuery {
                set,
                resolve,
                staging,
            }
        });
        if let Some(error) = error {
            return Err(DeviceError::ResourceCreationFailed {
                resource: "timer query",
                reason: error.to_string(),
            });
        }

        query
            .staging
            .slice(..)
            .map_async(wgpu::MapMode::Read, move |result| {
                if let Err(err) = result {
                    log::warn!("timer query fence failed to map: {err}");
                }
                signaled.store(true, Ordering::Release)
            });
        Ok(query)
    }

    fn pipeline(
        &self,
        program: &mut Program,
        format: TextureFormat,
    ) -> Result<wgpu::RenderPipeline, DeviceError> {
        if let Some(pipeline) = program.pipelines.get(&format) {
            return Ok(pipeline.clone());
        }

        let (pipeline, error) = self.validate(|| {
            self.device
                .create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                    label: Some(&program.label),
                    layout: Some(&program.pipeline_layout),
                    vertex: wgpu::VertexState {
                        module: &program.vertex,
                        entry_point: Some("vs_main"),
                        compilation_options: Default::default(),
                        buffers: &[wgpu::VertexBufferLayout {
                            array_stride: 5 * size_of::<f32>() as wgpu::BufferAddress,
                            step_mode: wgpu::VertexStepMode::Vertex,
                            attributes: &wgpu::vertex_attr_array![0 => Float32x3, 1 => Float32x2],
                        }],
                    },
                    primitive: wgpu::PrimitiveState::default(),
                    depth_stencil: None,
                    multisample: wgpu::MultisampleState::default(),
                    fragment: Some(wgpu::FragmentState {
                        module: &program.fragment,
                        entry_point: Some("fs_main"),
                        compilation_options: Default::default(),
                        targets: &[Some(wgpu::ColorTargetState {
                            format: format.into(),
                            blend: None,
                            write_mask: wgpu::ColorWrites::ALL,
                        })],
                    }),
                    multiview: None,
                    cache: None,
                })
        });
        if let Some(error) = error {
            return Err(DeviceError::LinkOrCompileFailure {
                label: program.label.clone(),
                message: error.to_string(),
                source: String::new(),
            });
        }

        program.pipelines.insert(format, pipeline.clone());
        Ok(pipeline)
    }
}

impl Device for Gpu {
    #[inline]
    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn create_texture(&self, desc: TextureDesc) -> Result<TextureId, DeviceError> {
        let (texture, error) = self.validate(|| {
            self.device.create_texture(&wgpu::TextureDescriptor {
                label: None,
                size: wgpu::Extent3d {
                    width: desc.width.max(1),
                    height: desc.height.max(1),
                    depth_or_array_layers: 1,
                },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: desc.format.into(),
                usage: wgpu::TextureUsages::TEXTURE_BINDING
                    | wgpu::TextureUsages::RENDER_ATTACHMENT
                    | wgpu::TextureUsages::COPY_DST
                    | wgpu::TextureUsages::COPY_SRC,
                view_formats: &[],
            })
        });
        if let Some(error) = error {
            return Err(DeviceError::ResourceCreationFailed {
                resource: "texture",
                reason: error.to_string(),
            });
        }

        let id = TextureId(self.next_handle());
        self.textures
            .borrow_mut()
            .insert(id, Texture { texture, desc });
        Ok(id)
    }

    fn upload_texture(&self, texture: TextureId, data: &[u8]) -> Result<(), DeviceError> {
        let textures = self.textures.borrow();
        let Texture { texture, desc } = textures
            .get(&texture)
            .ok_or_else(|| DeviceError::UnknownHandle(texture.to_string()))?;

        let bytes_per_row = desc.width * desc.format.bytes_per_texel() as u32;
        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            data,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(bytes_per_row),
                rows_per_image: Some(desc.height),
            },
            wgpu::Extent3d {
                width: desc.width,
                height: desc.height,
                depth_or_array_layers: 1,
            },
        );
        Ok(())
    }

    fn delete_texture(&self, texture: TextureId) {
        if let Some(Texture { texture, .. }) = self.textures.borrow_mut().remove(&texture) {
            texture.destroy();
        }
    }

    fn create_program(&self, desc: &ProgramDesc) -> Result<ProgramId, DeviceError> {
        let failure = |error: wgpu::Error, source: &str| DeviceError::LinkOrCompileFailure {
            label: desc.label.to_string(),
            message: error.to_string(),
            source: super::annotate_source(source, None),
        };

        let module = |source: &str| {
            self.validate(|| {
                self.device
                    .create_shader_module(wgpu::ShaderModuleDescriptor {
                        label: Some(desc.label),
                        source: wgpu::ShaderSource::Wgsl(source.into()),
                    })
            })
        };
        let (vertex, error) = module(desc.vertex);
        if let Some(error) = error {
            return Err(failure(error, desc.vertex));
        }
        let (fragment, error) = module(desc.fragment);
        if let Some(error) = error {
            return Err(failure(error, desc.fragment));
        }

        let uniforms = wgpu::BindGroupLayoutEntry {
            binding: 0,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };
        let textures = (0..desc.textures).map(|index| wgpu::BindGroupLayoutEntry {
            binding: index as u32 + 1,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Texture {
                sample_type: wgpu::TextureSampleType::Float { filterable: false },
                view_dimension: wgpu::TextureViewDimension::D2,
                multisampled: false,
            },
            count: None,
        });
        let entries: Vec<_> = std::iter::once(uniforms).chain(textures).collect();

        let layout = self
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some(desc.label),
                entries: &entries,
            });
        let pipeline_layout = self
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(desc.label),
                bind_group_layouts: &[&layout],
                push_constant_ranges: &[],
            });

        let id = ProgramId(self.next_handle());
        let program = Program {
            label: desc.label.to_string(),
            vertex,
            fragment,
            layout,
            pipeline_layout,
            pipelines: HashMap::default(),
        };
        self.programs.borrow_mut().insert(id, program);
        Ok(id)
    }

    fn delete_program(&self, program: ProgramId) {
        self.programs.borrow_mut().remove(&program);
    }

    fn draw(&self, call: &DrawCall) -> Result<(), DeviceError> {
        let textures = self.textures.borrow();
        let mut programs = self.programs.borrow_mut();

        let unknown = |id: String| DeviceError::UnknownHandle(id);
        let program = programs
            .get_mut(&call.program)
            .ok_or_else(|| unknown(call.program.to_string()))?;
        let target = textures
            .get(&call.target)
            .ok_or_else(|| unknown(call.target.to_string()))?;
        let pipeline = self.pipeline(program, target.desc.format)?;

        let views = call
            .textures
            .iter()
            .map(|id| match textures.get(id) {
                Some(texture) => Ok(texture.texture.create_view(&Default::default())),
                None => Err(unknown(id.to_string())),
            })
            .collect::<Result<Vec<_>, _>>()?;

        // uniform blocks may not be empty
        let mut contents = call.uniforms.to_vec();
        contents.resize(contents.len().max(16).next_multiple_of(16), 0);
        let uniforms = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(&program.label),
                contents: &contents,
                usage: wgpu::BufferUsages::UNIFORM,
            });

        let entries: Vec<_> = std::iter::once(wgpu::BindGroupEntry {
            binding: 0,
            resource: uniforms.as_entire_binding(),
        })
        .chain(views.iter().enumerate().map(|(index, view)| {
            wgpu::BindGroupEntry {
                binding: index as u32 + 1,
                resource: wgpu::BindingResource::TextureView(view),
            }
        }))
        .collect();
        let bindings = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(&program.label),
            layout: &program.layout,
            entries: &entries,
        });

        let target = target.texture.create_view(&Default::default());
        let mut encoder = self.device.create_command_encoder(&Default::default());
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some(&program.label),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &target,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Load,
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });

            let viewport = call.viewport;
            pass.set_viewport(
                viewport.x as f32,
                viewport.y as f32,
                viewport.width as f32,
                viewport.height as f32,
                0.0,
                1.0,
            );
            let scissor = call.scissor;
            pass.set_scissor_rect(scissor.x, scissor.y, scissor.width, scissor.height);
            pass.set_pipeline(&pipeline);
            pass.set_bind_group(0, &bindings, &[]);
            pass.set_vertex_buffer(0, self.vertices.slice(..));
            pass.set_index_buffer(self.indices.slice(..), wgpu::IndexFormat::Uint16);
            pass.draw_indexed(0..QUAD_INDICES.len() as u32, 0, 0..1);
        }
        self.queue.submit(Some(encoder.finish()));
        Ok(())
    }

    fn read_pixels(&self, texture: TextureId) -> Result<PixelBufferId, DeviceError> {
        let textures = self.textures.borrow();
        let Texture { texture, desc } = textures
            .get(&texture)
            .ok_or_else(|| DeviceError::UnknownHandle(texture.to_string()))?;
        let desc = *desc;

        let (padded_bytes_per_row, size) = staging_layout(desc);
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("read_pixels"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = self.device.create_command_encoder(&Default::default());
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &buffer,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_bytes_per_row),
                    rows_per_image: Some(desc.height),
                },
            },
            wgpu::Extent3d {
                width: desc.width,
                height: desc.height,
                depth_or_array_layers: 1,
            },
        );
        self.queue.submit(Some(encoder.finish()));

        let (sender, receiver) = flume::bounded(1);
        buffer
            .slice(..)
            .map_async(wgpu::MapMode::Read, move |result| _ = sender.send(result));

        let id = PixelBufferId(self.next_handle());
        let pixels = PixelBuffer {
            buffer,
            desc,
            padded_bytes_per_row,
            receiver,
        };
        self.pixels.borrow_mut().insert(id, pixels);
        Ok(id)
    }

    fn map_pixels(&self, buffer: PixelBufferId) -> Result<Vec<u8>, DeviceError> {
        let PixelBuffer {
            buffer,
            desc,
            padded_bytes_per_row,
            receiver,
        } = self
            .pixels
            .borrow_mut()
            .remove(&buffer)
            .ok_or_else(|| DeviceError::UnknownHandle(buffer.to_string()))?;

        if receiver.is_empty() {
            self.wait()?;
        }
        receiver
            .recv()
            .map_err(|err| DeviceError::Backend(err.to_string()))?
            .map_err(|err| DeviceError::Backend(err.to_string()))?;

        let bytes_per_row = (desc.width as usize) * desc.format.bytes_per_texel();
        let data = {
            let range = buffer.slice(..).get_mapped_range();
            range
                .chunks(padded_bytes_per_row as usize)
                .take(desc.height as usize)
                .flat_map(|row| row[..bytes_per_row].iter().copied())
                .collect()
        };
        buffer.unmap();
        buffer.destroy();
        Ok(data)
    }

    fn delete_pixels(&self, buffer: PixelBufferId) {
        if let Some(PixelBuffer { buffer, .. }) = self.pixels.borrow_mut().remove(&buffer) {
            buffer.destroy();
        }
    }

    fn create_fence(&self, kind: FenceKind) -> Result<FenceId, DeviceError> {
        let signaled = Arc::new(AtomicBool::new(false));
        let kind = match kind {
            FenceKind::TimerQuery if !self.capabilities.timer_query => {
                log::warn!("timer queries unavailable, fencing natively");
                FenceKind::Native
            }
            kind => kind,
        };
        let query = match kind {
            FenceKind::Immediate => {
                signaled.store(true, Ordering::Release);
                None
            }
            FenceKind::Native => {
                let signaled = signaled.clone();
                self.queue
                    .on_submitted_work_done(move || signaled.store(true, Ordering::Release));
                None
            }
            FenceKind::TimerQuery => Some(self.timer_query(signaled.clone())?),
        };
        let id = FenceId(self.next_handle());
        self.fences.borrow_mut().insert(id, Fence { signaled, query });
        Ok(id)
    }

    fn poll_fence(&self, fence: FenceId) -> Result<bool, DeviceError> {
        let signaled = self
            .fences
            .borrow()
            .get(&fence)
            .map(|fence| fence.signaled.clone())
            .ok_or_else(|| DeviceError::UnknownHandle(fence.to_string()))?;
        if !signaled.load(Ordering::Acquire) {
            self.device
                .poll(wgpu::PollType::Poll)
                .map_err(|err| DeviceError::Backend(err.to_string()))?;
        }
        Ok(signaled.load(Ordering::Acquire))
    }

    fn delete_fence(&self, fence: FenceId) {
        let fence = self.fences.borrow_mut().remove(&fence);
        if let Some(Fence {
            query: Some(query), ..
        }) = fence
        {
            query.resolve.destroy();
            query.staging.destroy();
        }
    }

    fn wait(&self) -> Result<(), DeviceError> {
        self.device
            .poll(wgpu::PollType::Wait)
            .map(|_| ())
            .map_err(|err| DeviceError::Backend(err.to_string()))
    }
}
