/// Descriptor set layouts and descriptor sets

use std::any::Any;
use std::sync::Arc;
use crate::error::{Error, Result};
use crate::graphics_device::{Buffer, Texture, Sampler, ShaderStageFlags};

/// Kind of resource bound at a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorType {
    UniformBuffer,
    StorageBuffer,
    CombinedImageSampler,
}

/// One binding slot of a set layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorBinding {
    pub binding: u32,
    pub descriptor_type: DescriptorType,
    /// Array size (1 for a plain binding)
    pub count: u32,
    pub stages: ShaderStageFlags,
}

/// Descriptor for creating a descriptor set layout
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DescriptorSetLayoutDesc {
    pub bindings: Vec<DescriptorBinding>,
}

impl DescriptorSetLayoutDesc {
    /// Binding numbers must be unique
    pub fn validate(&self) -> Result<()> {
        for (i, a) in self.bindings.iter().enumerate() {
            if self.bindings[i + 1..].iter().any(|b| b.binding == a.binding) {
                return Err(Error::InvalidResource(format!("duplicate descriptor binding {}", a.binding)));
            }
        }
        Ok(())
    }

    pub fn find(&self, binding: u32) -> Option<&DescriptorBinding> {
        self.bindings.iter().find(|b| b.binding == binding)
    }
}

/// Descriptor set layout trait
pub trait DescriptorSetLayout: Send + Sync {
    fn desc(&self) -> &DescriptorSetLayoutDesc;

    /// Downcast support for backends
    fn as_any(&self) -> &dyn Any;
}

/// Descriptor set trait
///
/// Writes are applied immediately. The set returns to the pool on drop.
pub trait DescriptorSet: Send + Sync {
    fn layout(&self) -> &Arc<dyn DescriptorSetLayout>;

    fn update_uniform_buffer(&self, binding: u32, buffer: &Arc<dyn Buffer>, offset: u64, range: u64) -> Result<()>;

    fn update_storage_buffer(&self, binding: u32, buffer: &Arc<dyn Buffer>, offset: u64, range: u64) -> Result<()>;

    /// Bind a texture that is expected to be in SHADER_READ_ONLY layout
    fn update_combined_image_sampler(&self, binding: u32, texture: &Arc<dyn Texture>, sampler: &Arc<dyn Sampler>) -> Result<()>;

    /// Downcast support for backends
    fn as_any(&self) -> &dyn Any;
}

/// Check that `binding` exists in `layout` with the expected type
pub fn check_binding(layout: &DescriptorSetLayoutDesc, binding: u32, expected: DescriptorType) -> Result<()> {
    match layout.find(binding) {
        None => Err(Error::InvalidResource(format!("binding {} is not part of the set layout", binding))),
        Some(b) if b.descriptor_type != expected => Err(Error::InvalidResource(format!(
            "binding {} is {:?}, not {:?}", binding, b.descriptor_type, expected
        ))),
        Some(_) => Ok(()),
    }
}

#[cfg(test)]
#[path = "descriptor_tests.rs"]
mod tests;
