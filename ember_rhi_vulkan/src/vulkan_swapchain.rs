/// Swapchain - presentable images, their wrappers and per-image semaphores
///
/// Every swapchain image is wrapped in a `Texture` with `owns_image = false`,
/// so its layout is tracked like any other attachment. Each image carries its
/// own render-finished semaphore, signaled by the frame submission and waited
/// on by present.

use ember_rhi::ember::{Error, Result};
use ember_rhi::ember::render::TextureFormat;
use ember_rhi::{engine_debug, engine_error, engine_info};
use ash::vk;
use std::sync::Arc;

use crate::vulkan_context::{native_error, GpuContext, GpuQueue};
use crate::vulkan_format::vk_to_texture_format;
use crate::vulkan_sync::{Semaphore, SemaphoreDesc};
use crate::vulkan_texture::Texture;

const LOG_SOURCE: &str = "ember::vulkan::Swapchain";

/// Outcome of `vkAcquireNextImageKHR`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AcquireOutcome {
    Image { index: u32, suboptimal: bool },
    OutOfDate,
}

/// Outcome of `vkQueuePresentKHR`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PresentOutcome {
    Presented,
    /// Presented, but the swapchain no longer matches the surface exactly
    Suboptimal,
    OutOfDate,
}

impl PresentOutcome {
    pub(crate) fn needs_recreate(&self) -> bool {
        !matches!(self, PresentOutcome::Presented)
    }
}

// ===== SURFACE PROPERTY SELECTION =====

/// Preferred sRGB BGRA/RGBA, otherwise the first format the RHI can express
pub(crate) fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<(vk::SurfaceFormatKHR, TextureFormat)> {
    const PREFERRED: [vk::Format; 2] = [vk::Format::B8G8R8A8_SRGB, vk::Format::R8G8B8A8_SRGB];
    PREFERRED.iter()
        .find_map(|&wanted| formats.iter().find(|f| f.format == wanted && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR))
        .or_else(|| formats.iter().find(|f| vk_to_texture_format(f.format).is_some()))
        .and_then(|&f| vk_to_texture_format(f.format).map(|format| (f, format)))
}

/// Surface extent, or the window size clamped to the surface limits when the surface leaves it open
pub(crate) fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, width: u32, height: u32) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        return caps.current_extent;
    }
    vk::Extent2D {
        width: width.clamp(caps.min_image_extent.width, caps.max_image_extent.width),
        height: height.clamp(caps.min_image_extent.height, caps.max_image_extent.height),
    }
}

/// One more than the minimum, capped by the maximum (0 means unbounded)
pub(crate) fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = caps.min_image_count + 1;
    if caps.max_image_count > 0 {
        count.min(caps.max_image_count)
    } else {
        count
    }
}

// ===== SWAPCHAIN =====

/// Vulkan swapchain
pub(crate) struct Swapchain {
    ctx: Arc<GpuContext>,
    loader: ash::khr::swapchain::Device,
    surface_loader: ash::khr::surface::Instance,
    /// Owned by the device, which outlives the swapchain
    surface: vk::SurfaceKHR,
    swapchain: vk::SwapchainKHR,
    format: TextureFormat,
    extent: vk::Extent2D,
    images: Vec<Arc<Texture>>,
    render_finished: Vec<Semaphore>,
}

struct SwapchainParts {
    swapchain: vk::SwapchainKHR,
    format: TextureFormat,
    extent: vk::Extent2D,
    images: Vec<Arc<Texture>>,
    render_finished: Vec<Semaphore>,
}

impl Swapchain {
    pub(crate) fn new(
        ctx: &Arc<GpuContext>,
        instance: &ash::Instance,
        surface_loader: ash::khr::surface::Instance,
        surface: vk::SurfaceKHR,
        width: u32,
        height: u32,
    ) -> Result<Self> {
        let loader = ash::khr::swapchain::Device::new(instance, &ctx.device);
        let parts = Self::build(ctx, &loader, &surface_loader, surface, width, height, vk::SwapchainKHR::null())?;
        engine_info!(LOG_SOURCE, "Swapchain created: {}x{} {:?}, {} images",
            parts.extent.width, parts.extent.height, parts.format, parts.images.len());
        Ok(Self {
            ctx: Arc::clone(ctx),
            loader,
            surface_loader,
            surface,
            swapchain: parts.swapchain,
            format: parts.format,
            extent: parts.extent,
            images: parts.images,
            render_finished: parts.render_finished,
        })
    }

    fn build(
        ctx: &Arc<GpuContext>,
        loader: &ash::khr::swapchain::Device,
        surface_loader: &ash::khr::surface::Instance,
        surface: vk::SurfaceKHR,
        width: u32,
        height: u32,
        old_swapchain: vk::SwapchainKHR,
    ) -> Result<SwapchainParts> {
        let caps = unsafe { surface_loader.get_physical_device_surface_capabilities(ctx.physical_device, surface) }
            .map_err(|e| native_error("vkGetPhysicalDeviceSurfaceCapabilitiesKHR", e))?;
        let formats = unsafe { surface_loader.get_physical_device_surface_formats(ctx.physical_device, surface) }
            .map_err(|e| native_error("vkGetPhysicalDeviceSurfaceFormatsKHR", e))?;
        let (surface_format, format) = choose_surface_format(&formats).ok_or_else(|| {
            engine_error!(LOG_SOURCE, "No supported surface format among {:?}", formats);
            Error::InitializationFailed("no supported surface format".to_string())
        })?;
        let extent = choose_extent(&caps, width, height);

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface)
            .min_image_count(choose_image_count(&caps))
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(vk::PresentModeKHR::FIFO)
            .clipped(true)
            .old_swapchain(old_swapchain);
        let swapchain = unsafe { loader.create_swapchain(&create_info, None) }
            .map_err(|e| native_error("vkCreateSwapchainKHR", e))?;

        let wrap = || -> Result<(Vec<Arc<Texture>>, Vec<Semaphore>)> {
            let handles = unsafe { loader.get_swapchain_images(swapchain) }
                .map_err(|e| native_error("vkGetSwapchainImagesKHR", e))?;
            let mut images = Vec::with_capacity(handles.len());
            let mut render_finished = Vec::with_capacity(handles.len());
            for image in handles {
                images.push(Arc::new(Texture::from_swapchain_image(ctx, image, format, extent.width, extent.height)?));
                render_finished.push(Semaphore::new(&ctx.sync, SemaphoreDesc::binary())?);
            }
            Ok((images, render_finished))
        };
        match wrap() {
            Ok((images, render_finished)) => Ok(SwapchainParts { swapchain, format, extent, images, render_finished }),
            Err(e) => {
                unsafe { loader.destroy_swapchain(swapchain, None) };
                Err(e)
            }
        }
    }

    /// Replace the swapchain with one matching the surface's current size
    ///
    /// The caller must have waited for the device to be idle.
    pub(crate) fn rebuild(&mut self, width: u32, height: u32) -> Result<()> {
        let parts = Self::build(&self.ctx, &self.loader, &self.surface_loader, self.surface, width, height, self.swapchain)?;
        // Old wrappers destroy their views before the old swapchain goes away
        self.images = parts.images;
        self.render_finished = parts.render_finished;
        unsafe { self.loader.destroy_swapchain(self.swapchain, None) };
        self.swapchain = parts.swapchain;
        self.format = parts.format;
        self.extent = parts.extent;
        engine_debug!(LOG_SOURCE, "Swapchain rebuilt: {}x{}", self.extent.width, self.extent.height);
        Ok(())
    }

    pub(crate) fn acquire(&self, image_available: vk::Semaphore, timeout_ns: u64) -> Result<AcquireOutcome> {
        let result = unsafe {
            self.loader.acquire_next_image(self.swapchain, timeout_ns, image_available, vk::Fence::null())
        };
        match result {
            Ok((index, suboptimal)) => Ok(AcquireOutcome::Image { index, suboptimal }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
            Err(e) => {
                engine_error!(LOG_SOURCE, "vkAcquireNextImageKHR failed: {:?}", e);
                Err(native_error("vkAcquireNextImageKHR", e))
            }
        }
    }

    /// Present `image_index` once its render-finished semaphore is signaled
    pub(crate) fn present(&self, queue: &GpuQueue, image_index: u32) -> Result<PresentOutcome> {
        let wait_semaphores = [self.render_finished_semaphore(image_index)?];
        let swapchains = [self.swapchain];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);
        let result = {
            let _guard = queue.lock()?;
            unsafe { self.loader.queue_present(queue.handle, &present_info) }
        };
        match result {
            Ok(false) => Ok(PresentOutcome::Presented),
            Ok(true) | Err(vk::Result::SUBOPTIMAL_KHR) => Ok(PresentOutcome::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::OutOfDate),
            Err(e) => {
                engine_error!(LOG_SOURCE, "vkQueuePresentKHR failed: {:?}", e);
                Err(native_error("vkQueuePresentKHR", e))
            }
        }
    }

    pub(crate) fn image(&self, index: u32) -> Result<&Arc<Texture>> {
        self.images.get(index as usize)
            .ok_or_else(|| Error::InvalidOperation(format!("swapchain image {} out of {}", index, self.images.len())))
    }

    pub(crate) fn render_finished_semaphore(&self, index: u32) -> Result<vk::Semaphore> {
        self.render_finished.get(index as usize)
            .map(Semaphore::handle)
            .ok_or_else(|| Error::InvalidOperation(format!("swapchain image {} out of {}", index, self.images.len())))
    }

    pub(crate) fn image_count(&self) -> usize {
        self.images.len()
    }

    pub(crate) fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub(crate) fn format(&self) -> TextureFormat {
        self.format
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        self.images.clear();
        self.render_finished.clear();
        unsafe { self.loader.destroy_swapchain(self.swapchain, None) };
    }
}

#[cfg(test)]
#[path = "vulkan_swapchain_tests.rs"]
mod tests;
