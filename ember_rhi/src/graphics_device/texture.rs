/// Texture trait, texture descriptor, image layouts and subresource ranges

use std::any::Any;
use bitflags::bitflags;

/// Texture pixel format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(non_camel_case_types)]
pub enum TextureFormat {
    R8_UNORM,
    R8G8_UNORM,
    R8G8B8A8_SRGB,
    R8G8B8A8_UNORM,
    B8G8R8A8_SRGB,
    B8G8R8A8_UNORM,
    R16G16B16A16_SFLOAT,
    R32G32B32A32_SFLOAT,
    D16_UNORM,
    D32_FLOAT,
    D24_UNORM_S8_UINT,
    D32_FLOAT_S8_UINT,
}

impl TextureFormat {
    /// Returns true for depth (and depth/stencil) formats
    pub fn is_depth(&self) -> bool {
        matches!(
            self,
            TextureFormat::D16_UNORM
                | TextureFormat::D32_FLOAT
                | TextureFormat::D24_UNORM_S8_UINT
                | TextureFormat::D32_FLOAT_S8_UINT
        )
    }

    /// Returns true if the format carries a stencil aspect
    pub fn has_stencil(&self) -> bool {
        matches!(self, TextureFormat::D24_UNORM_S8_UINT | TextureFormat::D32_FLOAT_S8_UINT)
    }

    /// Bytes per texel, used to validate upload sizes
    pub fn bytes_per_pixel(&self) -> u32 {
        match self {
            TextureFormat::R8_UNORM => 1,
            TextureFormat::R8G8_UNORM | TextureFormat::D16_UNORM => 2,
            TextureFormat::R8G8B8A8_SRGB
            | TextureFormat::R8G8B8A8_UNORM
            | TextureFormat::B8G8R8A8_SRGB
            | TextureFormat::B8G8R8A8_UNORM
            | TextureFormat::D32_FLOAT
            | TextureFormat::D24_UNORM_S8_UINT => 4,
            TextureFormat::R16G16B16A16_SFLOAT | TextureFormat::D32_FLOAT_S8_UINT => 8,
            TextureFormat::R32G32B32A32_SFLOAT => 16,
        }
    }
}

bitflags! {
    /// Texture usage flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TextureUsage: u32 {
        /// Sampled in shaders
        const SAMPLED = 1 << 0;
        /// Color render target
        const COLOR_ATTACHMENT = 1 << 1;
        /// Depth/stencil render target
        const DEPTH_STENCIL_ATTACHMENT = 1 << 2;
        /// Source of copy operations
        const TRANSFER_SRC = 1 << 3;
        /// Destination of copy operations (uploads)
        const TRANSFER_DST = 1 << 4;
        /// Storage image
        const STORAGE = 1 << 5;
    }
}

// ===== TEXTURE DESC =====

/// Descriptor for creating a 2D texture (optionally mipmapped or layered)
#[derive(Debug, Clone)]
pub struct TextureDesc {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Pixel format
    pub format: TextureFormat,
    /// Usage flags
    pub usage: TextureUsage,
    /// Number of mip levels (at least 1)
    pub mip_levels: u32,
    /// Number of array layers (at least 1)
    pub array_layers: u32,
    /// Name used in logs and leak reports
    pub debug_name: String,
}

impl TextureDesc {
    /// Single-mip, single-layer texture
    pub fn new_2d(width: u32, height: u32, format: TextureFormat, usage: TextureUsage) -> Self {
        Self {
            width,
            height,
            format,
            usage,
            mip_levels: 1,
            array_layers: 1,
            debug_name: String::new(),
        }
    }

    /// Builder-style debug name
    pub fn with_name(mut self, name: &str) -> Self {
        self.debug_name = name.to_string();
        self
    }

    /// Byte size of mip 0 for one layer
    pub fn level0_size(&self) -> u64 {
        self.width as u64 * self.height as u64 * self.format.bytes_per_pixel() as u64
    }
}

// ===== TEXTURE INFO =====

/// Read-only properties of a created texture
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureInfo {
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub usage: TextureUsage,
    pub mip_levels: u32,
    pub array_layers: u32,
}

impl TextureInfo {
    /// Returns true if this texture is a texture array (array_layers > 1)
    pub fn is_array(&self) -> bool {
        self.array_layers > 1
    }

    /// Range covering every mip and layer
    pub fn full_range(&self) -> SubresourceRange {
        SubresourceRange::whole(self.mip_levels, self.array_layers)
    }
}

impl From<&TextureDesc> for TextureInfo {
    fn from(desc: &TextureDesc) -> Self {
        Self {
            width: desc.width,
            height: desc.height,
            format: desc.format,
            usage: desc.usage,
            mip_levels: desc.mip_levels.max(1),
            array_layers: desc.array_layers.max(1),
        }
    }
}

// ===== LAYOUTS =====

/// Image layout tracked per subresource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ImageLayout {
    #[default]
    Undefined,
    General,
    ColorAttachment,
    DepthStencilAttachment,
    DepthStencilReadOnly,
    ShaderReadOnly,
    TransferSrc,
    TransferDst,
    PresentSrc,
}

/// Contiguous range of mips and layers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubresourceRange {
    pub base_mip: u32,
    pub mip_count: u32,
    pub base_layer: u32,
    pub layer_count: u32,
}

impl SubresourceRange {
    /// Exactly one mip of one layer
    pub fn single(mip: u32, layer: u32) -> Self {
        Self { base_mip: mip, mip_count: 1, base_layer: layer, layer_count: 1 }
    }

    /// Every mip and layer of a texture
    pub fn whole(mip_levels: u32, array_layers: u32) -> Self {
        Self { base_mip: 0, mip_count: mip_levels, base_layer: 0, layer_count: array_layers }
    }

    /// Iterate (mip, layer) pairs, mip-major
    pub fn iter(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        (self.base_mip..self.base_mip.saturating_add(self.mip_count)).flat_map(move |mip| {
            (self.base_layer..self.base_layer.saturating_add(self.layer_count)).map(move |layer| (mip, layer))
        })
    }
}

// ===== TEXTURE TRAIT =====

/// Texture resource trait
///
/// Implemented by backend texture types. The image is destroyed on drop,
/// unless it belongs to the swapchain.
pub trait Texture: Send + Sync {
    /// Read-only properties of this texture
    fn info(&self) -> &TextureInfo;

    /// Returns true for presentable images owned by the swapchain
    fn is_swapchain_image(&self) -> bool;

    /// Currently tracked layout of one subresource
    fn layout(&self, mip: u32, layer: u32) -> ImageLayout;

    /// Downcast support for backends
    fn as_any(&self) -> &dyn Any;
}

#[cfg(test)]
#[path = "texture_tests.rs"]
mod tests;
