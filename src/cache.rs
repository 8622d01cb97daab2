//! Compiled programs, at most one per key.

use std::{cell::OnceCell, rc::Rc};

use rustc_hash::FxHashMap as HashMap;

use crate::{
    context::DeviceContext,
    device::ProgramId,
    shader::{ProgramKey, ShaderSource, UniformField},
};

/// Where every uniform of a program lives in its uniform block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniformLocations {
    pub fields: Vec<UniformField>,
    pub size: usize,
}

#[derive(Debug)]
pub struct CompiledProgram {
    pub program: ProgramId,
    pub source: ShaderSource,
    pub key: ProgramKey,
    locations: OnceCell<UniformLocations>,
}

impl CompiledProgram {
    pub fn new(program: ProgramId, source: ShaderSource, key: ProgramKey) -> Self {
        Self {
            program,
            source,
            key,
            locations: OnceCell::new(),
        }
    }

    /// Resolves the uniform locations on first use.
    pub fn locations(&self) -> &UniformLocations {
        self.locations.get_or_init(|| {
            let uniforms = self.source.uniforms();
            UniformLocations {
                fields: uniforms.fields().to_vec(),
                size: uniforms.size(),
            }
        })
    }

    #[inline]
    pub fn is_resolved(&self) -> bool {
        self.locations.get().is_some()
    }
}

#[derive(Debug, Default)]
pub struct ProgramCache {
    programs: HashMap<ProgramKey, Rc<CompiledProgram>>,
    compiles: usize,
}

impl ProgramCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the program of `key`, running `compile` only if it is not cached yet.
    /// A failed compilation leaves the cache untouched.
    pub fn get_or_compile<E>(
        &mut self,
        key: ProgramKey,
        compile: impl FnOnce(&ProgramKey) -> Result<CompiledProgram, E>,
    ) -> Result<Rc<CompiledProgram>, E> {
        if let Some(program) = self.programs.get(&key) {
            return Ok(program.clone());
        }
        log::debug!("compile program {}", key.name);
        let program = Rc::new(compile(&key)?);
        self.compiles += 1;
        self.programs.insert(key, program.clone());
        Ok(program)
    }

    /// Number of compilations so far.
    #[inline]
    pub fn compile_count(&self) -> usize {
        self.compiles
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.programs.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.programs.is_empty()
    }

    /// Deletes every program.
    pub fn dispose(&mut self, context: &DeviceContext) {
        for (_, program) in self.programs.drain() {
            context.delete_program(program.program);
        }
    }
}
