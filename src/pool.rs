//! Reuse of device textures.

use derive_more::Display;
use itertools::Itertools;
use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};

use crate::{
    context::DeviceContext,
    device::{DeviceError, TextureId},
    layout::{PhysicalFormat, PhysicalShape, TextureUsage, texture_bytes},
};

/// Textures are interchangeable iff their keys are equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[display("{shape}:{format}:{}", if *packed { "packed" } else { "unpacked" })]
pub struct PoolKey {
    pub shape: PhysicalShape,
    pub format: PhysicalFormat,
    pub packed: bool,
}

/// A snapshot of pool usage.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolMemory {
    pub allocated_bytes: usize,
    pub free_bytes: usize,
    pub used_textures: usize,
    pub free_textures: usize,
}

#[derive(Debug, Default)]
pub struct TexturePool {
    free: HashMap<PoolKey, Vec<TextureId>>,
    used: HashMap<PoolKey, HashSet<TextureId>>,
    allocated_bytes: usize,
    free_bytes: usize,
    warned: bool,
}

impl TexturePool {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(
        context: &DeviceContext,
        shape: PhysicalShape,
        usage: TextureUsage,
        packed: bool,
    ) -> PoolKey {
        let render_float32 = context.capabilities().render_float32;
        let format = PhysicalFormat::new(usage, packed, render_float32);
        PoolKey {
            shape,
            format,
            packed,
        }
    }

    fn bytes(context: &DeviceContext, key: PoolKey) -> usize {
        texture_bytes(key.shape, key.format, key.packed, context.unpacked_channels())
    }

    /// Hands out a texture of the given key, reusing a free one when possible.
    pub fn acquire(
        &mut self,
        context: &DeviceContext,
        shape: PhysicalShape,
        usage: TextureUsage,
        packed: bool,
    ) -> Result<TextureId, DeviceError> {
        let key = Self::key(context, shape, usage, packed);
        let bytes = Self::bytes(context, key);

        if let Some(texture) = self.free.get_mut(&key).and_then(Vec::pop) {
            log::debug!("reuse {texture} for {key}");
            self.free_bytes -= bytes;
            self.used.entry(key).or_default().insert(texture);
            return Ok(texture);
        }

        let texture = context.create_texture(shape, key.format, packed)?;
        log::debug!("create {texture} for {key}");
        self.allocated_bytes += bytes;
        self.used.entry(key).or_default().insert(texture);

        let warning = context.flags().memory_warning_bytes;
        if !self.warned && self.allocated_bytes > warning {
            let megabytes = self.allocated_bytes as f64 / 1024.0 / 1024.0;
            log::warn!("high memory usage in GPU: {megabytes:.2} MB, most likely due to a memory leak");
            self.warned = true;
        }
        Ok(texture)
    }

    /// Returns a texture to the pool, or deletes it when above the deletion threshold.
    pub fn release(
        &mut self,
        context: &DeviceContext,
        texture: TextureId,
        shape: PhysicalShape,
        usage: TextureUsage,
        packed: bool,
    ) {
        let key = Self::key(context, shape, usage, packed);
        let bytes = Self::bytes(context, key);

        let known = self.used.get_mut(&key).is_some_and(|used| used.remove(&texture));
        if !known {
            log::warn!("cannot release {texture}: not in use as {key}");
            return;
        }

        match context.flags().delete_texture_threshold {
            Some(threshold) if self.allocated_bytes > threshold => {
                log::debug!("delete {texture} of {key}");
                context.delete_texture(texture);
                self.allocated_bytes -= bytes;
            }
            _ => {
                self.free.entry(key).or_default().push(texture);
                self.free_bytes += bytes;
            }
        }
    }

    #[inline]
    pub fn num_used_textures(&self) -> usize {
        self.used.values().map(HashSet::len).sum()
    }

    #[inline]
    pub fn num_free_textures(&self) -> usize {
        self.free.values().map(Vec::len).sum()
    }

    #[inline]
    pub fn allocated_bytes(&self) -> usize {
        self.allocated_bytes
    }

    #[inline]
    pub fn free_bytes(&self) -> usize {
        self.free_bytes
    }

    pub fn memory(&self) -> PoolMemory {
        PoolMemory {
            allocated_bytes: self.allocated_bytes,
            free_bytes: self.free_bytes,
            used_textures: self.num_used_textures(),
            free_textures: self.num_free_textures(),
        }
    }

    /// Deletes every texture, in use or not.
    pub fn dispose(&mut self, context: &DeviceContext) {
        let free = self.free.drain().flat_map(|(_, x)| x);
        let used = self.used.drain().flat_map(|(_, x)| x);
        for texture in free.chain(used).sorted() {
            context.delete_texture(texture);
        }
        self.allocated_bytes = 0;
        self.free_bytes = 0;
    }
}
