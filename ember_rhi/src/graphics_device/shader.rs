/// Shader trait, shader stages and bytecode hashing

use std::any::Any;
use std::hash::Hasher;
use bitflags::bitflags;
use rustc_hash::FxHasher;

/// Pipeline stage a shader module is compiled for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Fragment,
    Compute,
}

bitflags! {
    /// Set of shader stages (push constant and descriptor visibility)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ShaderStageFlags: u32 {
        const VERTEX = 1 << 0;
        const FRAGMENT = 1 << 1;
        const COMPUTE = 1 << 2;
        const VERTEX_FRAGMENT = Self::VERTEX.bits() | Self::FRAGMENT.bits();
        const ALL = Self::VERTEX.bits() | Self::FRAGMENT.bits() | Self::COMPUTE.bits();
    }
}

impl From<ShaderStage> for ShaderStageFlags {
    fn from(stage: ShaderStage) -> Self {
        match stage {
            ShaderStage::Vertex => ShaderStageFlags::VERTEX,
            ShaderStage::Fragment => ShaderStageFlags::FRAGMENT,
            ShaderStage::Compute => ShaderStageFlags::COMPUTE,
        }
    }
}

/// Descriptor for creating a shader
#[derive(Debug, Clone, Copy)]
pub struct ShaderDesc<'a> {
    /// SPIR-V bytecode
    pub code: &'a [u8],
    pub stage: ShaderStage,
    /// Entry point function name (usually "main")
    pub entry_point: &'a str,
}

/// Shader module trait
///
/// The stage is fixed at construction. Shaders are consumed by pipelines.
pub trait Shader: Send + Sync {
    fn stage(&self) -> ShaderStage;

    fn entry_point(&self) -> &str;

    /// Hash of the bytecode, stable for identical input (pipeline cache key)
    fn content_hash(&self) -> u64;

    /// Downcast support for backends
    fn as_any(&self) -> &dyn Any;
}

/// FxHash of a bytecode blob
pub fn content_hash(code: &[u8]) -> u64 {
    let mut hasher = FxHasher::default();
    hasher.write(code);
    hasher.write_usize(code.len());
    hasher.finish()
}

#[cfg(test)]
#[path = "shader_tests.rs"]
mod tests;
