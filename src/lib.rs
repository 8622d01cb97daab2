//! `weft` executes tensor programs on GPUs that are only reachable through render pipelines.
//!
//! Tensors are laid out in 2-D float textures, and every operation is a fragment program drawn
//! over a full-viewport quad into the texture of its output.
//!
//! ## Key Components
//! 1. **Layout** ([`layout`]): maps logical shapes onto textures, unpacked (one value per texel)
//!    or packed (a 2×2 block per texel), within the device's texture limits.
//! 2. **Shaders** ([`shader`]): assembles WGSL programs from a kernel body ([`GpgpuProgram`])
//!    plus generated coordinate and sampler functions.
//! 3. **Device** ([`device`], [`context`]): a narrow [`Device`] trait with a `wgpu` backend, and
//!    the single context that binds programs, targets and inputs.
//! 4. **Resources** ([`pool`], [`cache`]): textures are pooled by shape and format, programs are
//!    compiled once per key.
//! 5. **Engine** ([`engine`]): reference-counted tensor data, dispatch, slicing, reshaping and
//!    fenced reads.
//!
//! The engine is single threaded. Reads resolve through futures that any executor can drive.

pub mod cache;
pub mod config;
pub mod context;
pub mod device;
pub mod engine;
pub mod layout;
pub mod num;
pub mod platform;
pub mod pool;
pub mod shader;
pub mod shape;

pub use config::Flags;
pub use device::{Device, DeviceError, Gpu, GpuBuilder};
pub use engine::{DataId, Engine, EngineError, ReadFuture, TensorInfo};
pub use num::{DataType, Values};
pub use shader::{GpgpuProgram, UniformDecl, UniformType, UniformValue};
pub use shape::Shape;
