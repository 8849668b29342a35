/// Sampler - Vulkan implementation of the Sampler trait

use ember_rhi::ember::{Error, Result};
use ember_rhi::ember::render::{Sampler as RhiSampler, SamplerDesc};
use ember_rhi::engine_err;
use ash::vk;
use std::any::Any;
use std::sync::Arc;

use crate::vulkan_context::GpuContext;
use crate::vulkan_format::{
    address_mode_to_vk, border_color_to_vk, compare_op_to_vk, filter_to_vk, mipmap_mode_to_vk,
};

/// Vulkan sampler implementation
pub struct Sampler {
    ctx: Arc<GpuContext>,
    pub(crate) sampler: vk::Sampler,
    desc: SamplerDesc,
}

/// Requested anisotropy limited to what the device supports; `None` when disabled
pub(crate) fn effective_anisotropy(requested: Option<f32>, device_max: f32) -> Option<f32> {
    requested
        .filter(|&a| a > 1.0 && device_max > 1.0)
        .map(|a| a.min(device_max))
}

impl Sampler {
    pub(crate) fn create(ctx: &Arc<GpuContext>, desc: &SamplerDesc) -> Result<Self> {
        let mut create_info = vk::SamplerCreateInfo::default()
            .mag_filter(filter_to_vk(desc.mag_filter))
            .min_filter(filter_to_vk(desc.min_filter))
            .mipmap_mode(mipmap_mode_to_vk(desc.mipmap_mode))
            .address_mode_u(address_mode_to_vk(desc.address_u))
            .address_mode_v(address_mode_to_vk(desc.address_v))
            .address_mode_w(address_mode_to_vk(desc.address_w))
            .mip_lod_bias(0.0)
            .min_lod(desc.min_lod)
            .max_lod(desc.max_lod.max(desc.min_lod))
            .border_color(border_color_to_vk(desc.border_color))
            .unnormalized_coordinates(false);

        create_info = match desc.compare_op {
            Some(op) => create_info.compare_enable(true).compare_op(compare_op_to_vk(op)),
            None => create_info.compare_enable(false).compare_op(vk::CompareOp::ALWAYS),
        };

        create_info = match effective_anisotropy(desc.max_anisotropy, ctx.limits.max_sampler_anisotropy) {
            Some(anisotropy) => create_info.anisotropy_enable(true).max_anisotropy(anisotropy),
            None => create_info.anisotropy_enable(false).max_anisotropy(1.0),
        };

        let sampler = unsafe { ctx.device.create_sampler(&create_info, None) }
            .map_err(|e| engine_err!("ember::vulkan::Sampler", "Failed to create sampler: {:?}", e))?;

        Ok(Self { ctx: Arc::clone(ctx), sampler, desc: desc.clone() })
    }

    pub fn handle(&self) -> vk::Sampler {
        self.sampler
    }

    /// Downcast an RHI sampler created by this backend
    pub(crate) fn from_rhi(sampler: &dyn RhiSampler) -> Result<&Sampler> {
        sampler.as_any().downcast_ref::<Sampler>()
            .ok_or_else(|| Error::InvalidResource("sampler was not created by the Vulkan backend".to_string()))
    }
}

impl RhiSampler for Sampler {
    fn desc(&self) -> &SamplerDesc {
        &self.desc
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        unsafe { self.ctx.device.destroy_sampler(self.sampler, None) };
    }
}

#[cfg(test)]
#[path = "vulkan_sampler_tests.rs"]
mod tests;
