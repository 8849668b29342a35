/// Fallback textures and sampler used when a material lacks its own

use std::sync::Arc;
use crate::error::Result;
use crate::graphics_device::{
    GraphicsDevice, Texture, Sampler, TextureDesc, TextureFormat, TextureUsage, SamplerDesc,
};

/// 1x1 fallback textures plus a linear/repeat sampler
///
/// Created explicitly from a device and dropped by its owner, before the device.
pub struct DefaultResources {
    pub white: Arc<dyn Texture>,
    pub black: Arc<dyn Texture>,
    /// Tangent-space (0, 0, 1) normal
    pub flat_normal: Arc<dyn Texture>,
    pub sampler: Arc<dyn Sampler>,
}

impl DefaultResources {
    pub const WHITE: [u8; 4] = [255, 255, 255, 255];
    pub const BLACK: [u8; 4] = [0, 0, 0, 255];
    pub const FLAT_NORMAL: [u8; 4] = [128, 128, 255, 255];

    pub fn new(device: &mut dyn GraphicsDevice) -> Result<Self> {
        let white = Self::pixel(device, "default_white", Self::WHITE)?;
        let black = Self::pixel(device, "default_black", Self::BLACK)?;
        let flat_normal = Self::pixel(device, "default_flat_normal", Self::FLAT_NORMAL)?;
        let sampler = device.create_sampler(SamplerDesc::default())?;

        crate::engine_debug!("ember::DefaultResources", "Default textures and sampler created");
        Ok(Self { white, black, flat_normal, sampler })
    }

    fn pixel(device: &mut dyn GraphicsDevice, name: &str, rgba: [u8; 4]) -> Result<Arc<dyn Texture>> {
        let desc = TextureDesc::new_2d(1, 1, TextureFormat::R8G8B8A8_UNORM, TextureUsage::SAMPLED | TextureUsage::TRANSFER_DST)
            .with_name(name);
        device.create_and_upload_texture(desc, &rgba)
    }
}

#[cfg(test)]
#[path = "default_resources_tests.rs"]
mod tests;
