/// Descriptor set layouts and descriptor sets
///
/// Sets are allocated from the device's shared pool (created with
/// FREE_DESCRIPTOR_SET) and returned to it individually on drop.

use ember_rhi::ember::{Error, Result};
use ember_rhi::ember::render::{
    check_binding, Buffer as RhiBuffer, DescriptorSet as RhiDescriptorSet,
    DescriptorSetLayout as RhiDescriptorSetLayout, DescriptorSetLayoutDesc, DescriptorType,
    Sampler as RhiSampler, Texture as RhiTexture,
};
use ember_rhi::{engine_err, engine_warn};
use ash::vk;
use std::any::Any;
use std::sync::Arc;

use crate::vulkan_buffer::Buffer;
use crate::vulkan_context::GpuContext;
use crate::vulkan_format::{descriptor_type_to_vk, stage_flags_to_vk};
use crate::vulkan_sampler::Sampler;
use crate::vulkan_texture::Texture;

const LOG_SOURCE: &str = "ember::vulkan::DescriptorSet";

// ===== LAYOUT =====

/// Vulkan descriptor set layout
pub struct DescriptorSetLayout {
    ctx: Arc<GpuContext>,
    pub(crate) layout: vk::DescriptorSetLayout,
    desc: DescriptorSetLayoutDesc,
}

impl DescriptorSetLayout {
    pub(crate) fn create(ctx: &Arc<GpuContext>, desc: &DescriptorSetLayoutDesc) -> Result<Self> {
        desc.validate()?;
        let bindings: Vec<vk::DescriptorSetLayoutBinding> = desc.bindings.iter()
            .map(|b| vk::DescriptorSetLayoutBinding::default()
                .binding(b.binding)
                .descriptor_type(descriptor_type_to_vk(b.descriptor_type))
                .descriptor_count(b.count.max(1))
                .stage_flags(stage_flags_to_vk(b.stages)))
            .collect();
        let create_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
        let layout = unsafe { ctx.device.create_descriptor_set_layout(&create_info, None) }
            .map_err(|e| engine_err!(LOG_SOURCE, "Failed to create descriptor set layout: {:?}", e))?;
        Ok(Self { ctx: Arc::clone(ctx), layout, desc: desc.clone() })
    }

    pub fn handle(&self) -> vk::DescriptorSetLayout {
        self.layout
    }

    /// Downcast an RHI layout created by this backend
    pub(crate) fn from_rhi(layout: &dyn RhiDescriptorSetLayout) -> Result<&DescriptorSetLayout> {
        layout.as_any().downcast_ref::<DescriptorSetLayout>()
            .ok_or_else(|| Error::InvalidResource("descriptor set layout was not created by the Vulkan backend".to_string()))
    }
}

impl RhiDescriptorSetLayout for DescriptorSetLayout {
    fn desc(&self) -> &DescriptorSetLayoutDesc {
        &self.desc
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        unsafe { self.ctx.device.destroy_descriptor_set_layout(self.layout, None) };
    }
}

// ===== SET =====

/// Vulkan descriptor set
pub struct DescriptorSet {
    ctx: Arc<GpuContext>,
    pub(crate) set: vk::DescriptorSet,
    layout: Arc<dyn RhiDescriptorSetLayout>,
}

impl DescriptorSet {
    pub(crate) fn allocate(ctx: &Arc<GpuContext>, layout: &Arc<dyn RhiDescriptorSetLayout>) -> Result<Self> {
        let set_layouts = [DescriptorSetLayout::from_rhi(layout.as_ref())?.layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(ctx.descriptor_pool)
            .set_layouts(&set_layouts);
        let sets = {
            let _guard = ctx.lock_descriptor_pool()?;
            unsafe { ctx.device.allocate_descriptor_sets(&alloc_info) }
        }
        .map_err(|e| engine_err!(LOG_SOURCE, "Failed to allocate descriptor set: {:?}", e))?;
        let set = sets.into_iter().next()
            .ok_or_else(|| Error::AllocationFailed("descriptor pool returned no set".to_string()))?;
        Ok(Self { ctx: Arc::clone(ctx), set, layout: Arc::clone(layout) })
    }

    pub fn handle(&self) -> vk::DescriptorSet {
        self.set
    }

    /// Downcast an RHI descriptor set created by this backend
    pub(crate) fn from_rhi(set: &dyn RhiDescriptorSet) -> Result<&DescriptorSet> {
        set.as_any().downcast_ref::<DescriptorSet>()
            .ok_or_else(|| Error::InvalidResource("descriptor set was not created by the Vulkan backend".to_string()))
    }

    fn write_buffer(
        &self,
        binding: u32,
        descriptor_type: DescriptorType,
        buffer: &dyn RhiBuffer,
        offset: u64,
        range: u64,
    ) -> Result<()> {
        check_binding(self.layout.desc(), binding, descriptor_type)?;
        if offset.checked_add(range).map_or(true, |end| end > buffer.size()) {
            return Err(Error::InvalidResource(format!(
                "descriptor range {}+{} exceeds buffer size {}", offset, range, buffer.size()
            )));
        }
        let buffer_info = [vk::DescriptorBufferInfo {
            buffer: Buffer::from_rhi(buffer)?.buffer,
            offset,
            range,
        }];
        let write = vk::WriteDescriptorSet::default()
            .dst_set(self.set)
            .dst_binding(binding)
            .descriptor_type(descriptor_type_to_vk(descriptor_type))
            .buffer_info(&buffer_info);
        unsafe { self.ctx.device.update_descriptor_sets(&[write], &[]) };
        Ok(())
    }
}

impl RhiDescriptorSet for DescriptorSet {
    fn layout(&self) -> &Arc<dyn RhiDescriptorSetLayout> {
        &self.layout
    }

    fn update_uniform_buffer(&self, binding: u32, buffer: &Arc<dyn RhiBuffer>, offset: u64, range: u64) -> Result<()> {
        self.write_buffer(binding, DescriptorType::UniformBuffer, buffer.as_ref(), offset, range)
    }

    fn update_storage_buffer(&self, binding: u32, buffer: &Arc<dyn RhiBuffer>, offset: u64, range: u64) -> Result<()> {
        self.write_buffer(binding, DescriptorType::StorageBuffer, buffer.as_ref(), offset, range)
    }

    fn update_combined_image_sampler(
        &self,
        binding: u32,
        texture: &Arc<dyn RhiTexture>,
        sampler: &Arc<dyn RhiSampler>,
    ) -> Result<()> {
        check_binding(self.layout.desc(), binding, DescriptorType::CombinedImageSampler)?;
        let image_info = [vk::DescriptorImageInfo {
            sampler: Sampler::from_rhi(sampler.as_ref())?.sampler,
            image_view: Texture::from_rhi(texture.as_ref())?.view,
            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }];
        let write = vk::WriteDescriptorSet::default()
            .dst_set(self.set)
            .dst_binding(binding)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .image_info(&image_info);
        unsafe { self.ctx.device.update_descriptor_sets(&[write], &[]) };
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for DescriptorSet {
    fn drop(&mut self) {
        let Ok(_guard) = self.ctx.lock_descriptor_pool() else {
            engine_warn!(LOG_SOURCE, "Descriptor set leaked: pool lock poisoned");
            return;
        };
        if let Err(e) = unsafe { self.ctx.device.free_descriptor_sets(self.ctx.descriptor_pool, &[self.set]) } {
            engine_warn!(LOG_SOURCE, "Failed to free descriptor set: {:?}", e);
        }
    }
}
