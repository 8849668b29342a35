/// Texture - Vulkan implementation of the Texture trait
///
/// Tracks the current layout of every (mip, layer) subresource so command
/// lists can issue exact transitions, and caches single-subresource views
/// for use as rendering attachments.

use ember_rhi::ember::{Error, Result};
use ember_rhi::ember::render::{
    Buffer as _, BufferDesc, BufferUsage, ImageLayout, MemoryType, SubresourceRange, Texture as RhiTexture,
    TextureDesc, TextureFormat, TextureInfo, TextureUsage,
};
use ember_rhi::{engine_err, engine_warn};
use ash::vk;
use rustc_hash::FxHashMap;
use std::any::Any;
use std::sync::{Arc, Mutex, OnceLock};

use crate::vulkan_buffer::Buffer;
use crate::vulkan_context::GpuContext;
use crate::vulkan_format::{
    aspect_mask, image_layout_to_vk, subresource_range_to_vk, texture_format_to_vk, texture_usage_to_vk,
};
use crate::vulkan_memory::MemoryAllocation;
use crate::vulkan_sync::{create_image_memory_barrier, layout_transition_scope};
use crate::vulkan_transfer::{UploadState, UploadTicket};

const LOG_SOURCE: &str = "ember::vulkan::Texture";

// ===== LAYOUT TRACKING =====

/// Current layout of every subresource, mip-major
pub struct ImageLayoutState {
    mip_levels: u32,
    array_layers: u32,
    layouts: Mutex<Vec<ImageLayout>>,
}

impl ImageLayoutState {
    pub fn new(mip_levels: u32, array_layers: u32, initial: ImageLayout) -> Self {
        let mip_levels = mip_levels.max(1);
        let array_layers = array_layers.max(1);
        Self {
            mip_levels,
            array_layers,
            layouts: Mutex::new(vec![initial; (mip_levels * array_layers) as usize]),
        }
    }

    fn index(&self, mip: u32, layer: u32) -> Option<usize> {
        (mip < self.mip_levels && layer < self.array_layers)
            .then(|| (mip * self.array_layers + layer) as usize)
    }

    /// Layout of one subresource; out-of-range subresources read as Undefined
    pub fn get(&self, mip: u32, layer: u32) -> ImageLayout {
        let Some(index) = self.index(mip, layer) else {
            return ImageLayout::Undefined;
        };
        self.layouts.lock().map(|l| l[index]).unwrap_or_default()
    }

    /// Set every subresource of `range` to `layout`
    pub fn set(&self, range: SubresourceRange, layout: ImageLayout) {
        let Ok(mut layouts) = self.layouts.lock() else {
            return;
        };
        for (mip, layer) in range.iter() {
            if let Some(index) = self.index(mip, layer) {
                layouts[index] = layout;
            }
        }
    }

    /// Record a move of `range` to `new`; returns (mip, layer, old layout) for each subresource that changes
    pub fn transition(&self, range: SubresourceRange, new: ImageLayout) -> Result<Vec<(u32, u32, ImageLayout)>> {
        let mip_end = range.base_mip.checked_add(range.mip_count);
        let layer_end = range.base_layer.checked_add(range.layer_count);
        if range.mip_count == 0
            || range.layer_count == 0
            || mip_end.map_or(true, |end| end > self.mip_levels)
            || layer_end.map_or(true, |end| end > self.array_layers)
        {
            return Err(Error::InvalidResource(format!(
                "subresource range {:?} outside {} mips x {} layers",
                range, self.mip_levels, self.array_layers
            )));
        }
        let mut layouts = self.layouts.lock()
            .map_err(|_| Error::BackendError("layout tracker lock poisoned".to_string()))?;
        let mut changed = Vec::new();
        for (mip, layer) in range.iter() {
            let index = (mip * self.array_layers + layer) as usize;
            let old = layouts[index];
            if old != new {
                changed.push((mip, layer, old));
                layouts[index] = new;
            }
        }
        Ok(changed)
    }
}

// ===== TEXTURE =====

/// Vulkan texture implementation
pub struct Texture {
    ctx: Arc<GpuContext>,
    pub(crate) image: vk::Image,
    /// View over every mip and layer, used for sampling
    pub(crate) view: vk::ImageView,
    allocation: Option<MemoryAllocation>,
    /// False for swapchain images, which belong to the swapchain
    owns_image: bool,
    info: TextureInfo,
    format: vk::Format,
    pub(crate) aspect: vk::ImageAspectFlags,
    pub(crate) layouts: Arc<ImageLayoutState>,
    subresource_views: Mutex<FxHashMap<(u32, u32), vk::ImageView>>,
    /// Set by `create_and_upload`
    upload: OnceLock<UploadTicket>,
}

fn create_view(
    ctx: &GpuContext,
    image: vk::Image,
    format: vk::Format,
    view_type: vk::ImageViewType,
    range: vk::ImageSubresourceRange,
) -> Result<vk::ImageView> {
    let view_info = vk::ImageViewCreateInfo::default()
        .image(image)
        .view_type(view_type)
        .format(format)
        .subresource_range(range);
    unsafe { ctx.device.create_image_view(&view_info, None) }
        .map_err(|e| engine_err!(LOG_SOURCE, "Failed to create image view: {:?}", e))
}

impl Texture {
    /// Create an image with memory from the memory manager, in Undefined layout
    pub(crate) fn create(ctx: &Arc<GpuContext>, desc: &TextureDesc) -> Result<Self> {
        if desc.width == 0 || desc.height == 0 {
            return Err(Error::InvalidResource(format!(
                "texture '{}' has zero extent {}x{}", desc.debug_name, desc.width, desc.height
            )));
        }
        let info = TextureInfo::from(desc);
        let format = texture_format_to_vk(desc.format);
        let aspect = aspect_mask(desc.format);

        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D { width: desc.width, height: desc.height, depth: 1 })
            .mip_levels(info.mip_levels)
            .array_layers(info.array_layers)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(texture_usage_to_vk(desc.usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = unsafe { ctx.device.create_image(&image_info, None) }
            .map_err(|e| engine_err!(LOG_SOURCE, "Failed to create texture image {}x{}: {:?}", desc.width, desc.height, e))?;

        let requirements = unsafe { ctx.device.get_image_memory_requirements(image) };
        let allocation = match ctx.memory.allocate_for_requirements(requirements, MemoryType::DeviceLocal, &desc.debug_name) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { ctx.device.destroy_image(image, None) };
                return Err(e);
            }
        };
        if let Err(e) = unsafe { ctx.device.bind_image_memory(image, allocation.memory(), allocation.offset()) } {
            unsafe { ctx.device.destroy_image(image, None) };
            let _ = ctx.memory.deallocate(allocation);
            return Err(engine_err!(LOG_SOURCE, "Failed to bind texture memory: {:?}", e));
        }

        let view_type = if info.is_array() { vk::ImageViewType::TYPE_2D_ARRAY } else { vk::ImageViewType::TYPE_2D };
        let view = match create_view(ctx, image, format, view_type, subresource_range_to_vk(info.full_range(), aspect)) {
            Ok(view) => view,
            Err(e) => {
                unsafe { ctx.device.destroy_image(image, None) };
                let _ = ctx.memory.deallocate(allocation);
                return Err(e);
            }
        };

        ctx.set_debug_name(image, &desc.debug_name);
        Ok(Self {
            ctx: Arc::clone(ctx),
            image,
            view,
            allocation: Some(allocation),
            owns_image: true,
            layouts: Arc::new(ImageLayoutState::new(info.mip_levels, info.array_layers, ImageLayout::Undefined)),
            info,
            format,
            aspect,
            subresource_views: Mutex::new(FxHashMap::default()),
            upload: OnceLock::new(),
        })
    }

    /// Wrap a swapchain image; the image itself is never destroyed by the wrapper
    pub(crate) fn from_swapchain_image(
        ctx: &Arc<GpuContext>,
        image: vk::Image,
        format: TextureFormat,
        width: u32,
        height: u32,
    ) -> Result<Self> {
        let vk_format = texture_format_to_vk(format);
        let aspect = vk::ImageAspectFlags::COLOR;
        let info = TextureInfo {
            width,
            height,
            format,
            usage: TextureUsage::COLOR_ATTACHMENT | TextureUsage::TRANSFER_DST,
            mip_levels: 1,
            array_layers: 1,
        };
        let view = create_view(ctx, image, vk_format, vk::ImageViewType::TYPE_2D, subresource_range_to_vk(info.full_range(), aspect))?;
        Ok(Self {
            ctx: Arc::clone(ctx),
            image,
            view,
            allocation: None,
            owns_image: false,
            layouts: Arc::new(ImageLayoutState::new(1, 1, ImageLayout::Undefined)),
            info,
            format: vk_format,
            aspect,
            subresource_views: Mutex::new(FxHashMap::default()),
            upload: OnceLock::new(),
        })
    }

    /// State of the initial upload; `None` for textures created without data
    pub fn upload_state(&self) -> Option<UploadState> {
        self.upload.get().map(UploadTicket::state)
    }

    pub fn handle(&self) -> vk::Image {
        self.image
    }

    /// Downcast an RHI texture created by this backend
    pub(crate) fn from_rhi(texture: &dyn RhiTexture) -> Result<&Texture> {
        texture.as_any().downcast_ref::<Texture>()
            .ok_or_else(|| Error::InvalidResource("texture was not created by the Vulkan backend".to_string()))
    }

    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    pub fn aspect(&self) -> vk::ImageAspectFlags {
        self.aspect
    }

    pub fn owns_image(&self) -> bool {
        self.owns_image
    }

    pub fn layout_state(&self) -> &ImageLayoutState {
        &self.layouts
    }

    /// 2D view of exactly one (mip, layer), created on first use
    pub fn subresource_view(&self, mip: u32, layer: u32) -> Result<vk::ImageView> {
        if mip >= self.info.mip_levels || layer >= self.info.array_layers {
            return Err(Error::InvalidResource(format!(
                "subresource ({}, {}) outside {} mips x {} layers",
                mip, layer, self.info.mip_levels, self.info.array_layers
            )));
        }
        if self.info.mip_levels == 1 && self.info.array_layers == 1 {
            return Ok(self.view);
        }
        let mut views = self.subresource_views.lock()
            .map_err(|_| Error::BackendError("view cache lock poisoned".to_string()))?;
        if let Some(&view) = views.get(&(mip, layer)) {
            return Ok(view);
        }
        let range = subresource_range_to_vk(SubresourceRange::single(mip, layer), self.aspect);
        let view = create_view(&self.ctx, self.image, self.format, vk::ImageViewType::TYPE_2D, range)?;
        views.insert((mip, layer), view);
        Ok(view)
    }

    /// Image barriers moving `range` to `new_layout` from each subresource's tracked layout
    pub(crate) fn transition_barriers(
        &self,
        range: SubresourceRange,
        new_layout: ImageLayout,
    ) -> Result<Vec<vk::ImageMemoryBarrier2<'static>>> {
        let changes = self.layouts.transition(range, new_layout)?;
        Ok(image_barriers(self.image, self.aspect, &changes, new_layout))
    }
}

/// One barrier per changed subresource, scoped by the layout transition table
pub(crate) fn image_barriers(
    image: vk::Image,
    aspect: vk::ImageAspectFlags,
    changes: &[(u32, u32, ImageLayout)],
    new_layout: ImageLayout,
) -> Vec<vk::ImageMemoryBarrier2<'static>> {
    changes.iter().map(|&(mip, layer, old)| {
        create_image_memory_barrier(
            layout_transition_scope(old, new_layout),
            image,
            image_layout_to_vk(old),
            image_layout_to_vk(new_layout),
            subresource_range_to_vk(SubresourceRange::single(mip, layer), aspect),
        )
    }).collect()
}

impl RhiTexture for Texture {
    fn info(&self) -> &TextureInfo {
        &self.info
    }

    fn is_swapchain_image(&self) -> bool {
        !self.owns_image
    }

    fn layout(&self, mip: u32, layer: u32) -> ImageLayout {
        self.layouts.get(mip, layer)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for Texture {
    fn drop(&mut self) {
        unsafe {
            if let Ok(mut views) = self.subresource_views.lock() {
                for (_, view) in views.drain() {
                    self.ctx.device.destroy_image_view(view, None);
                }
            }
            self.ctx.device.destroy_image_view(self.view, None);
            if self.owns_image {
                self.ctx.device.destroy_image(self.image, None);
            }
        }
        if let Some(allocation) = self.allocation.take() {
            if let Err(e) = self.ctx.memory.deallocate(allocation) {
                engine_warn!(LOG_SOURCE, "Texture memory not returned: {}", e);
            }
        }
    }
}

/// Create a sampled texture and queue a staged upload of mip 0 of every layer
///
/// `data` holds the layers back to back. Every subresource ends in
/// ShaderReadOnly; mips above 0 are transitioned without content.
pub(crate) fn create_and_upload(ctx: &Arc<GpuContext>, desc: &TextureDesc, data: &[u8]) -> Result<Arc<Texture>> {
    let layers = desc.array_layers.max(1);
    let expected = desc.level0_size() * layers as u64;
    if data.len() as u64 != expected {
        return Err(Error::InvalidResource(format!(
            "texture '{}' expects {} bytes of mip 0 data, got {}",
            desc.debug_name, expected, data.len()
        )));
    }

    let mut upload_desc = desc.clone();
    upload_desc.usage |= TextureUsage::SAMPLED | TextureUsage::TRANSFER_DST;
    let texture = Arc::new(Texture::create(ctx, &upload_desc)?);

    let staging_desc = BufferDesc::new(expected, BufferUsage::TRANSFER_SRC)
        .with_memory_type(MemoryType::HostVisible)
        .with_name(&format!("{} (staging)", desc.debug_name));
    let staging = Arc::new(Buffer::create(ctx, &staging_desc, vk::BufferUsageFlags::empty())?);
    staging.update(0, data)?;

    // The device flushes transfers before it submits any command list, so the tracker can move ahead now
    let info = texture.info.clone();
    let mip0 = SubresourceRange { base_mip: 0, mip_count: 1, base_layer: 0, layer_count: layers };
    let to_transfer = texture.layouts.transition(mip0, ImageLayout::TransferDst)?;
    let to_sampled = texture.layouts.transition(info.full_range(), ImageLayout::ShaderReadOnly)?;

    let (src, dst, aspect) = (staging.buffer, texture.image, texture.aspect);
    let extent = vk::Extent3D { width: info.width, height: info.height, depth: 1 };
    let device = ctx.device.clone();
    let sync = Arc::clone(&ctx.sync);
    let keep_alive = Arc::clone(&texture);

    let ticket = ctx.transfer.queue_upload(
        move |cmd| unsafe {
            sync.pipeline_barrier(cmd, &[], &[], &image_barriers(dst, aspect, &to_transfer, ImageLayout::TransferDst));
            let region = vk::BufferImageCopy::default()
                .image_subresource(vk::ImageSubresourceLayers {
                    aspect_mask: aspect,
                    mip_level: 0,
                    base_array_layer: 0,
                    layer_count: layers,
                })
                .image_extent(extent);
            device.cmd_copy_buffer_to_image(cmd, src, dst, vk::ImageLayout::TRANSFER_DST_OPTIMAL, &[region]);
            sync.pipeline_barrier(cmd, &[], &[], &image_barriers(dst, aspect, &to_sampled, ImageLayout::ShaderReadOnly));
        },
        move || {
            drop(staging);
            drop(keep_alive);
        },
    );
    let _ = texture.upload.set(ticket);

    Ok(texture)
}

#[cfg(test)]
#[path = "vulkan_texture_tests.rs"]
mod tests;
