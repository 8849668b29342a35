/// VulkanGraphicsDevice - Vulkan implementation of the GraphicsDevice trait
///
/// Owns the instance, surface, logical device, swapchain, depth buffer and
/// the per-slot frame objects. Memory, sync and transfer managers plus the
/// queues are shared with every resource through `Arc<GpuContext>`.

use ember_rhi::ember::{Error, Result};
use ember_rhi::ember::render::{
    Buffer as RhiBuffer, BufferDesc, CommandList as RhiCommandList, ComputePipelineDesc, DescriptorSet as RhiDescriptorSet,
    DescriptorSetLayout as RhiDescriptorSetLayout, DescriptorSetLayoutDesc, DescriptorType, FrameBegin,
    GraphicsDevice, GraphicsDeviceConfig, GraphicsDeviceStats, Pipeline as RhiPipeline, PipelineDesc,
    RenderWindow, Sampler as RhiSampler, SamplerDesc, Shader as RhiShader, ShaderDesc, Texture as RhiTexture,
    TextureDesc, TextureFormat, TextureUsage,
};
use ember_rhi::{engine_debug, engine_error, engine_info, engine_warn};
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::sync::{Arc, Mutex};

use crate::debug;
use crate::vulkan_buffer::{self, Buffer};
use crate::vulkan_command_list::CommandList;
use crate::vulkan_context::{native_error, GpuContext, GpuQueue};
use crate::vulkan_descriptor_set::{DescriptorSet, DescriptorSetLayout};
use crate::vulkan_format::{descriptor_type_to_vk, texture_format_to_vk};
use crate::vulkan_frame::{FrameResources, FrameScheduler, FrameState};
use crate::vulkan_memory::{MemoryManager, VulkanMemoryBackend};
use crate::vulkan_pipeline::Pipeline;
use crate::vulkan_sampler::Sampler;
use crate::vulkan_shader::Shader;
use crate::vulkan_swapchain::{AcquireOutcome, Swapchain};
use crate::vulkan_sync::{Fence, SubmitBatch, SyncManager};
use crate::vulkan_texture::{self, Texture};
use crate::vulkan_transfer::{TransferManager, VulkanTransferBackend};

const LOG_SOURCE: &str = "ember::vulkan::GraphicsDevice";

/// Descriptors of each type in the device pool, and the pool's set limit
pub(crate) const DESCRIPTORS_PER_TYPE: u32 = 1000;

/// Depth formats in order of preference
const DEPTH_FORMAT_CANDIDATES: [TextureFormat; 4] = [
    TextureFormat::D32_FLOAT,
    TextureFormat::D32_FLOAT_S8_UINT,
    TextureFormat::D24_UNORM_S8_UINT,
    TextureFormat::D16_UNORM,
];

// ============================================================================
// SELECTION HELPERS
// ============================================================================

/// Requested API version as a Vulkan version number; 1.3 is the minimum
pub(crate) fn api_version(requested: (u32, u32)) -> Result<u32> {
    if requested < (1, 3) {
        return Err(Error::InitializationFailed(format!(
            "Vulkan {}.{} requested, 1.3 is required for dynamic rendering and synchronization2",
            requested.0, requested.1
        )));
    }
    Ok(vk::make_api_version(0, requested.0, requested.1, 0))
}

/// Preference of a physical device type; higher is better
pub(crate) fn device_type_rank(device_type: vk::PhysicalDeviceType) -> u32 {
    match device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 4,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 3,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 2,
        vk::PhysicalDeviceType::CPU => 1,
        _ => 0,
    }
}

/// First candidate usable as an optimal-tiling depth attachment
pub(crate) fn choose_depth_format(supports_depth_attachment: impl Fn(TextureFormat) -> bool) -> Option<TextureFormat> {
    DEPTH_FORMAT_CANDIDATES.into_iter().find(|&format| supports_depth_attachment(format))
}

/// Index of the dedicated transfer queue within the graphics family, if the family has a second queue
pub(crate) fn transfer_queue_index(family_queue_count: u32) -> Option<u32> {
    (family_queue_count >= 2).then_some(1)
}

/// One pool size entry per descriptor type
pub(crate) fn descriptor_pool_sizes() -> Vec<vk::DescriptorPoolSize> {
    [DescriptorType::UniformBuffer, DescriptorType::StorageBuffer, DescriptorType::CombinedImageSampler]
        .into_iter()
        .map(|ty| vk::DescriptorPoolSize { ty: descriptor_type_to_vk(ty), descriptor_count: DESCRIPTORS_PER_TYPE })
        .collect()
}

/// Poll until the drawable area is non-zero (the window may be minimized)
pub(crate) fn wait_for_drawable_size(mut size: impl FnMut() -> (u32, u32), mut wait: impl FnMut()) -> (u32, u32) {
    loop {
        let (width, height) = size();
        if width > 0 && height > 0 {
            return (width, height);
        }
        wait();
    }
}

struct PhysicalDeviceChoice {
    physical_device: vk::PhysicalDevice,
    properties: vk::PhysicalDeviceProperties,
    family_index: u32,
    family_queue_count: u32,
    sampler_anisotropy: bool,
    depth_format: TextureFormat,
}

/// Check a physical device against what the backend needs; `None` if unusable
unsafe fn evaluate_physical_device(
    instance: &ash::Instance,
    surface_loader: &ash::khr::surface::Instance,
    surface: vk::SurfaceKHR,
    physical_device: vk::PhysicalDevice,
) -> Option<PhysicalDeviceChoice> {
    let properties = instance.get_physical_device_properties(physical_device);
    let name = properties.device_name_as_c_str().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    if (vk::api_version_major(properties.api_version), vk::api_version_minor(properties.api_version)) < (1, 3) {
        engine_debug!(LOG_SOURCE, "Skipping '{}': Vulkan 1.3 not supported", name);
        return None;
    }

    let extensions = instance.enumerate_device_extension_properties(physical_device).ok()?;
    let has_swapchain = extensions.iter().any(|ext| ext.extension_name_as_c_str().is_ok_and(|n| n == ash::khr::swapchain::NAME));
    if !has_swapchain {
        engine_debug!(LOG_SOURCE, "Skipping '{}': no swapchain extension", name);
        return None;
    }

    let mut features12 = vk::PhysicalDeviceVulkan12Features::default();
    let mut features13 = vk::PhysicalDeviceVulkan13Features::default();
    let sampler_anisotropy = {
        let mut features = vk::PhysicalDeviceFeatures2::default()
            .push_next(&mut features12)
            .push_next(&mut features13);
        instance.get_physical_device_features2(physical_device, &mut features);
        features.features.sampler_anisotropy == vk::TRUE
    };
    if features12.timeline_semaphore != vk::TRUE
        || features13.synchronization2 != vk::TRUE
        || features13.dynamic_rendering != vk::TRUE
    {
        engine_debug!(LOG_SOURCE, "Skipping '{}': missing timeline semaphores, synchronization2 or dynamic rendering", name);
        return None;
    }

    // One family must both draw and present: frames are submitted and presented on the same queue
    let families = instance.get_physical_device_queue_family_properties(physical_device);
    let (family_index, family) = families.iter().enumerate().find(|(index, family)| {
        family.queue_flags.contains(vk::QueueFlags::GRAPHICS)
            && surface_loader
                .get_physical_device_surface_support(physical_device, *index as u32, surface)
                .unwrap_or(false)
    })?;

    let depth_format = choose_depth_format(|format| {
        instance
            .get_physical_device_format_properties(physical_device, texture_format_to_vk(format))
            .optimal_tiling_features
            .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
    })?;

    Some(PhysicalDeviceChoice {
        physical_device,
        properties,
        family_index: family_index as u32,
        family_queue_count: family.queue_count,
        sampler_anisotropy,
        depth_format,
    })
}

// ============================================================================
// PARTIAL CONSTRUCTION
// ============================================================================

/// Native objects created before the device value exists; destroyed on early return
#[derive(Default)]
struct InitGuard {
    instance: Option<ash::Instance>,
    debug_messenger: Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
    surface: Option<(ash::khr::surface::Instance, vk::SurfaceKHR)>,
    device: Option<ash::Device>,
}

impl InitGuard {
    /// Ownership has moved to the device value
    fn disarm(&mut self) {
        self.instance = None;
        self.debug_messenger = None;
        self.surface = None;
        self.device = None;
    }
}

impl Drop for InitGuard {
    fn drop(&mut self) {
        unsafe {
            if let Some(device) = self.device.take() {
                device.destroy_device(None);
            }
            if let Some((loader, messenger)) = self.debug_messenger.take() {
                debug::cleanup_debug_config();
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            if let Some((loader, surface)) = self.surface.take() {
                loader.destroy_surface(surface, None);
            }
            if let Some(instance) = self.instance.take() {
                instance.destroy_instance(None);
            }
        }
    }
}

#[cfg(feature = "vulkan-validation")]
fn create_debug_messenger(
    entry: &ash::Entry,
    instance: &ash::Instance,
    config: &GraphicsDeviceConfig,
) -> Result<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)> {
    debug::init_debug_config(debug::Config {
        severity: config.debug_severity,
        output: config.debug_output.clone(),
        message_filter: config.debug_message_filter,
        break_on_error: config.break_on_error,
        panic_on_error: config.panic_on_error,
        enable_stats: config.enable_validation_stats,
    });

    let loader = ash::ext::debug_utils::Instance::new(entry, instance);
    let info = vk::DebugUtilsMessengerCreateInfoEXT::default()
        .message_severity(debug::severity_flags(config.debug_severity))
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(debug::vulkan_debug_callback));
    let messenger = unsafe { loader.create_debug_utils_messenger(&info, None) }.map_err(|e| {
        debug::cleanup_debug_config();
        engine_error!(LOG_SOURCE, "Failed to create debug messenger: {:?}", e);
        Error::InitializationFailed(format!("Failed to create debug messenger: {:?}", e))
    })?;
    Ok((loader, messenger))
}

#[cfg(not(feature = "vulkan-validation"))]
fn create_debug_messenger(
    _entry: &ash::Entry,
    _instance: &ash::Instance,
    _config: &GraphicsDeviceConfig,
) -> Result<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)> {
    Err(Error::InitializationFailed("built without the vulkan-validation feature".to_string()))
}

fn init_failed(what: &str, e: impl std::fmt::Debug) -> Error {
    engine_error!(LOG_SOURCE, "{}: {:?}", what, e);
    Error::InitializationFailed(format!("{}: {:?}", what, e))
}

// ============================================================================
// DEVICE
// ============================================================================

/// Swapchain-dependent objects and the frame loop state
struct Presentation {
    swapchain: Swapchain,
    depth_buffer: Arc<Texture>,
    frames: Vec<FrameResources>,
    scheduler: FrameScheduler<Fence>,
}

fn no_presentation() -> Error {
    Error::InvalidOperation("graphics device has no swapchain".to_string())
}

fn create_depth_buffer(ctx: &Arc<GpuContext>, format: TextureFormat, extent: vk::Extent2D) -> Result<Arc<Texture>> {
    let mut desc = TextureDesc::new_2d(extent.width, extent.height, format, TextureUsage::DEPTH_STENCIL_ATTACHMENT);
    desc.debug_name = "depth_buffer".to_string();
    Ok(Arc::new(Texture::create(ctx, &desc)?))
}

/// Vulkan graphics device
pub struct VulkanGraphicsDevice {
    window: Arc<dyn RenderWindow>,
    _entry: ash::Entry,
    instance: ash::Instance,
    debug_messenger: Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
    surface_loader: ash::khr::surface::Instance,
    surface: vk::SurfaceKHR,
    ctx: Arc<GpuContext>,
    presentation: Option<Presentation>,
    depth_format: TextureFormat,
    /// Set by a suboptimal acquire or `resize`; honored at the next present
    needs_recreate: bool,
    swapchain_recreations: u64,
}

impl VulkanGraphicsDevice {
    /// Create the device, its swapchain and frame objects for `window`
    pub fn new(window: Arc<dyn RenderWindow>, config: GraphicsDeviceConfig) -> Result<Self> {
        if config.max_frames_in_flight == 0 {
            return Err(Error::InitializationFailed("max_frames_in_flight must be at least 1".to_string()));
        }
        let api_version = api_version(config.api_version)?;
        let validation = cfg!(feature = "vulkan-validation") && config.enable_validation_layers;
        if config.enable_validation_layers && !validation {
            engine_warn!(LOG_SOURCE, "Validation requested but the vulkan-validation feature is disabled");
        }

        let entry = unsafe { ash::Entry::load() }.map_err(|e| init_failed("Failed to load Vulkan library", e))?;
        let mut guard = InitGuard::default();

        // ===== INSTANCE =====
        let display_handle = window.display_handle().map_err(|e| init_failed("Failed to get display handle", e))?;
        let window_handle = window.window_handle().map_err(|e| init_failed("Failed to get window handle", e))?;

        let app_name = std::ffi::CString::new(config.app_name.as_str()).unwrap_or_default();
        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(c"Ember")
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(api_version);

        let mut extension_names = ash_window::enumerate_required_extensions(display_handle.as_raw())
            .map_err(|e| init_failed("Failed to get required extensions", e))?
            .to_vec();
        let layer_names = if validation {
            extension_names.push(ash::ext::debug_utils::NAME.as_ptr());
            vec![c"VK_LAYER_KHRONOS_validation".as_ptr()]
        } else {
            Vec::new()
        };
        let instance_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_layer_names(&layer_names)
            .enabled_extension_names(&extension_names);
        let instance = unsafe { entry.create_instance(&instance_info, None) }
            .map_err(|e| init_failed("Failed to create Vulkan instance", e))?;
        guard.instance = Some(instance.clone());

        if validation {
            guard.debug_messenger = Some(create_debug_messenger(&entry, &instance, &config)?);
        }

        // ===== SURFACE =====
        let surface = unsafe {
            ash_window::create_surface(&entry, &instance, display_handle.as_raw(), window_handle.as_raw(), None)
        }
        .map_err(|e| init_failed("Failed to create surface", e))?;
        let surface_loader = ash::khr::surface::Instance::new(&entry, &instance);
        guard.surface = Some((surface_loader.clone(), surface));

        // ===== PHYSICAL DEVICE =====
        let physical_devices = unsafe { instance.enumerate_physical_devices() }
            .map_err(|e| init_failed("Failed to enumerate physical devices", e))?;
        let choice = physical_devices
            .into_iter()
            .filter_map(|pd| unsafe { evaluate_physical_device(&instance, &surface_loader, surface, pd) })
            .max_by_key(|choice| device_type_rank(choice.properties.device_type))
            .ok_or_else(|| init_failed("No suitable GPU", "Vulkan 1.3 with a graphics+present queue is required"))?;
        let device_name = choice.properties.device_name_as_c_str()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        engine_info!(LOG_SOURCE, "Using GPU '{}' ({:?}), depth format {:?}",
            device_name, choice.properties.device_type, choice.depth_format);

        // ===== LOGICAL DEVICE =====
        let transfer_index = transfer_queue_index(choice.family_queue_count);
        let queue_priorities = [1.0, 1.0];
        let queue_count = if transfer_index.is_some() { 2 } else { 1 };
        let queue_infos = [vk::DeviceQueueCreateInfo::default()
            .queue_family_index(choice.family_index)
            .queue_priorities(&queue_priorities[..queue_count])];
        let device_extensions = [ash::khr::swapchain::NAME.as_ptr()];
        let enabled_features = vk::PhysicalDeviceFeatures::default().sampler_anisotropy(choice.sampler_anisotropy);
        let mut enabled12 = vk::PhysicalDeviceVulkan12Features::default().timeline_semaphore(true);
        let mut enabled13 = vk::PhysicalDeviceVulkan13Features::default()
            .synchronization2(true)
            .dynamic_rendering(true);
        let device_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&device_extensions)
            .enabled_features(&enabled_features)
            .push_next(&mut enabled12)
            .push_next(&mut enabled13);
        let device = unsafe { instance.create_device(choice.physical_device, &device_info, None) }
            .map_err(|e| init_failed("Failed to create logical device", e))?;
        guard.device = Some(device.clone());

        let graphics_queue = Arc::new(GpuQueue::new(
            unsafe { device.get_device_queue(choice.family_index, 0) },
            choice.family_index,
        ));
        let transfer_queue = match transfer_index {
            Some(index) => Arc::new(GpuQueue::new(unsafe { device.get_device_queue(choice.family_index, index) }, choice.family_index)),
            None => Arc::clone(&graphics_queue),
        };

        // ===== SHARED CONTEXT =====
        let mut limits = choice.properties.limits;
        if !choice.sampler_anisotropy {
            limits.max_sampler_anisotropy = 1.0;
        }
        let ctx = Self::create_context(&instance, &device, &choice, limits, &config, graphics_queue, transfer_queue, validation)?;

        // The device value owns everything from here on; Drop handles a partial presentation
        let debug_messenger = guard.debug_messenger.take();
        guard.disarm();
        let mut this = Self {
            window,
            _entry: entry,
            instance,
            debug_messenger,
            surface_loader,
            surface,
            ctx,
            presentation: None,
            depth_format: choice.depth_format,
            needs_recreate: false,
            swapchain_recreations: 0,
        };
        this.presentation = Some(this.create_presentation(config.max_frames_in_flight)?);

        let extent = this.swapchain_extent();
        engine_info!(LOG_SOURCE, "Graphics device ready: {}x{}, {} frames in flight, validation {}",
            extent.0, extent.1, config.max_frames_in_flight, if validation { "on" } else { "off" });
        Ok(this)
    }

    #[allow(clippy::too_many_arguments)]
    fn create_context(
        instance: &ash::Instance,
        device: &ash::Device,
        choice: &PhysicalDeviceChoice,
        limits: vk::PhysicalDeviceLimits,
        config: &GraphicsDeviceConfig,
        graphics_queue: Arc<GpuQueue>,
        transfer_queue: Arc<GpuQueue>,
        validation: bool,
    ) -> Result<Arc<GpuContext>> {
        let memory_properties = unsafe { instance.get_physical_device_memory_properties(choice.physical_device) };
        let memory = MemoryManager::initialize(
            Box::new(VulkanMemoryBackend::new(device.clone(), memory_properties)),
            config.memory.clone(),
        )?;
        let sync = Arc::new(SyncManager::new(device.clone(), config.sync.clone()));
        let transfer_backend = VulkanTransferBackend::new(device.clone(), Arc::clone(&sync), Arc::clone(&transfer_queue))?;
        let transfer = TransferManager::new(Box::new(transfer_backend), config.sync.default_timeout_ns);

        let pool_sizes = descriptor_pool_sizes();
        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .pool_sizes(&pool_sizes)
            .max_sets(DESCRIPTORS_PER_TYPE);
        let descriptor_pool = match unsafe { device.create_descriptor_pool(&pool_info, None) } {
            Ok(pool) => pool,
            Err(e) => {
                transfer.shutdown();
                return Err(init_failed("Failed to create descriptor pool", e));
            }
        };

        let debug_utils = validation.then(|| ash::ext::debug_utils::Device::new(instance, device));
        Ok(Arc::new(GpuContext {
            device: device.clone(),
            physical_device: choice.physical_device,
            limits,
            memory,
            sync,
            transfer,
            graphics_queue,
            transfer_queue,
            descriptor_pool,
            descriptor_pool_lock: Mutex::new(()),
            debug_utils,
        }))
    }

    fn create_presentation(&self, max_frames_in_flight: usize) -> Result<Presentation> {
        let (width, height) = wait_for_drawable_size(|| self.window.pixel_size(), || self.window.wait_events());
        let swapchain = Swapchain::new(&self.ctx, &self.instance, self.surface_loader.clone(), self.surface, width, height)?;
        let depth_buffer = create_depth_buffer(&self.ctx, self.depth_format, swapchain.extent())?;
        let frames = (0..max_frames_in_flight)
            .map(|_| FrameResources::new(&self.ctx))
            .collect::<Result<Vec<_>>>()?;
        let fences = (0..max_frames_in_flight)
            .map(|_| Fence::new(&self.ctx.sync, true))
            .collect::<Result<Vec<_>>>()?;
        let scheduler = FrameScheduler::new(fences, self.ctx.sync.default_timeout())?;
        Ok(Presentation { swapchain, depth_buffer, frames, scheduler })
    }

    /// Wait for a drawable window, drain the GPU and rebuild the swapchain and depth buffer
    fn recreate_swapchain(&mut self) -> Result<()> {
        let (width, height) = wait_for_drawable_size(|| self.window.pixel_size(), || self.window.wait_events());
        self.wait_idle()?;

        let presentation = self.presentation.as_mut().ok_or_else(no_presentation)?;
        presentation.swapchain.rebuild(width, height)?;
        presentation.depth_buffer = create_depth_buffer(&self.ctx, self.depth_format, presentation.swapchain.extent())?;

        self.needs_recreate = false;
        self.swapchain_recreations += 1;
        let extent = presentation.swapchain.extent();
        engine_info!(LOG_SOURCE, "Swapchain recreated: {}x{} ({} images)",
            extent.width, extent.height, presentation.swapchain.image_count());
        Ok(())
    }

    /// Shared GPU context, for backend-specific extensions
    pub fn context(&self) -> &Arc<GpuContext> {
        &self.ctx
    }

    /// State of the frame in progress
    pub fn frame_state(&self) -> FrameState {
        self.presentation.as_ref().map_or(FrameState::Idle, |p| p.scheduler.state())
    }

    pub fn max_frames_in_flight(&self) -> usize {
        self.presentation.as_ref().map_or(0, |p| p.scheduler.max_frames_in_flight())
    }
}

impl GraphicsDevice for VulkanGraphicsDevice {
    // ===== RESOURCES =====

    fn create_buffer(&mut self, desc: BufferDesc) -> Result<Arc<dyn RhiBuffer>> {
        Ok(Arc::new(Buffer::create(&self.ctx, &desc, vk::BufferUsageFlags::empty())?))
    }

    fn create_and_upload_buffer(&mut self, desc: BufferDesc, data: &[u8]) -> Result<Arc<dyn RhiBuffer>> {
        Ok(vulkan_buffer::create_and_upload(&self.ctx, &desc, data)?)
    }

    fn create_texture_2d(&mut self, desc: TextureDesc) -> Result<Arc<dyn RhiTexture>> {
        Ok(Arc::new(Texture::create(&self.ctx, &desc)?))
    }

    fn create_and_upload_texture(&mut self, desc: TextureDesc, data: &[u8]) -> Result<Arc<dyn RhiTexture>> {
        Ok(vulkan_texture::create_and_upload(&self.ctx, &desc, data)?)
    }

    fn create_sampler(&mut self, desc: SamplerDesc) -> Result<Arc<dyn RhiSampler>> {
        Ok(Arc::new(Sampler::create(&self.ctx, &desc)?))
    }

    fn create_shader(&mut self, desc: ShaderDesc) -> Result<Arc<dyn RhiShader>> {
        Ok(Arc::new(Shader::create(&self.ctx, &desc)?))
    }

    fn create_graphics_pipeline(&mut self, desc: PipelineDesc) -> Result<Arc<dyn RhiPipeline>> {
        Ok(Arc::new(Pipeline::create(&self.ctx, &desc)?))
    }

    fn create_compute_pipeline(&mut self, desc: ComputePipelineDesc) -> Result<Arc<dyn RhiPipeline>> {
        Ok(Arc::new(Pipeline::create_compute(&self.ctx, &desc)?))
    }

    fn create_descriptor_set_layout(&mut self, desc: DescriptorSetLayoutDesc) -> Result<Arc<dyn RhiDescriptorSetLayout>> {
        Ok(Arc::new(DescriptorSetLayout::create(&self.ctx, &desc)?))
    }

    fn allocate_descriptor_set(&mut self, layout: &Arc<dyn RhiDescriptorSetLayout>) -> Result<Arc<dyn RhiDescriptorSet>> {
        Ok(Arc::new(DescriptorSet::allocate(&self.ctx, layout)?))
    }

    // ===== COMMANDS =====

    fn create_command_list(&mut self) -> Result<Box<dyn RhiCommandList>> {
        let presentation = self.presentation.as_mut().ok_or_else(no_presentation)?;
        if presentation.scheduler.state() != FrameState::ImageAcquired {
            return Err(Error::InvalidOperation(format!(
                "create_command_list needs an acquired frame (state {:?})", presentation.scheduler.state()
            )));
        }
        let slot = presentation.scheduler.current_slot();
        let command_buffer = presentation.frames[slot].next_command_buffer()?;
        Ok(Box::new(CommandList::new(&self.ctx, command_buffer, slot)))
    }

    fn submit_command_lists(&mut self, command_lists: &[&dyn RhiCommandList]) -> Result<()> {
        if command_lists.is_empty() {
            return Err(Error::InvalidOperation("submit with no command lists".to_string()));
        }
        // Uploads queued mid-frame must land before commands that read them
        self.ctx.transfer.submit_transfers()?;
        let presentation = self.presentation.as_mut().ok_or_else(no_presentation)?;
        let fence = presentation.scheduler.submission_fence()?.handle();
        let slot = presentation.scheduler.current_slot();
        let image_index = presentation.scheduler.image_index().ok_or_else(|| {
            Error::InvalidOperation("submit without an acquired swapchain image".to_string())
        })?;

        let mut command_buffers = Vec::with_capacity(command_lists.len());
        for list in command_lists {
            let list = list.as_any().downcast_ref::<CommandList>().ok_or_else(|| {
                Error::InvalidResource("command list was not created by the Vulkan device".to_string())
            })?;
            if list.frame_slot() != slot {
                return Err(Error::InvalidOperation(format!(
                    "command list from frame slot {} submitted in slot {}", list.frame_slot(), slot
                )));
            }
            command_buffers.push(list.submittable()?);
        }

        let batch = SubmitBatch::new(command_buffers)
            .wait(
                presentation.frames[slot].image_available.handle(),
                vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                0,
            )
            .signal(
                presentation.swapchain.render_finished_semaphore(image_index)?,
                vk::PipelineStageFlags2::ALL_COMMANDS,
                0,
            );
        self.ctx.sync.queue_submit2(&self.ctx.graphics_queue, &[batch], fence)?;
        presentation.scheduler.mark_submitted()
    }

    // ===== FRAME =====

    fn begin_frame(&mut self) -> Result<FrameBegin> {
        // Uploads queued since the last frame land before this frame's commands
        self.ctx.transfer.submit_transfers()?;

        let timeout = self.ctx.sync.default_timeout();
        let Presentation { swapchain, frames, scheduler, .. } = self.presentation.as_mut().ok_or_else(no_presentation)?;
        let slot = scheduler.current_slot();
        let image_available = frames[slot].image_available.handle();
        let mut suboptimal = false;
        let begin = scheduler.begin(|| match swapchain.acquire(image_available, timeout)? {
            AcquireOutcome::Image { index, suboptimal: s } => {
                suboptimal = s;
                Ok(Some(index))
            }
            AcquireOutcome::OutOfDate => Ok(None),
        })?;

        match begin {
            FrameBegin::Skipped => {
                engine_debug!(LOG_SOURCE, "Swapchain out of date at acquire; frame skipped");
                self.recreate_swapchain()?;
            }
            FrameBegin::Ready => {
                frames[slot].reset()?;
                if suboptimal {
                    self.needs_recreate = true;
                }
            }
        }
        Ok(begin)
    }

    fn present(&mut self) -> Result<()> {
        let Presentation { swapchain, scheduler, .. } = self.presentation.as_mut().ok_or_else(no_presentation)?;
        let queue = &self.ctx.graphics_queue;
        let outcome = scheduler.present(|index| swapchain.present(queue, index))?;
        if outcome.needs_recreate() || self.needs_recreate {
            engine_debug!(LOG_SOURCE, "Recreating swapchain after present ({:?})", outcome);
            self.recreate_swapchain()?;
        }
        Ok(())
    }

    fn abandon_frame(&mut self) -> Result<()> {
        let presentation = self.presentation.as_mut().ok_or_else(no_presentation)?;
        if presentation.scheduler.state() != FrameState::ImageAcquired {
            return Ok(());
        }
        // Empty batch: consumes the acquire semaphore and signals the slot fence
        let fence = presentation.scheduler.submission_fence()?.handle();
        let slot = presentation.scheduler.current_slot();
        let batch = SubmitBatch::new(Vec::new()).wait(
            presentation.frames[slot].image_available.handle(),
            vk::PipelineStageFlags2::ALL_COMMANDS,
            0,
        );
        self.ctx.sync.queue_submit2(&self.ctx.graphics_queue, &[batch], fence)?;
        presentation.scheduler.abandon()?;

        // The image stays acquired until the swapchain that owns it is replaced
        engine_warn!(LOG_SOURCE, "Frame abandoned on slot {}; rebuilding swapchain", slot);
        self.recreate_swapchain()
    }

    fn current_back_buffer(&self) -> Result<Arc<dyn RhiTexture>> {
        let presentation = self.presentation.as_ref().ok_or_else(no_presentation)?;
        let index = presentation.scheduler.image_index().ok_or_else(|| {
            Error::InvalidOperation("no swapchain image acquired; call begin_frame first".to_string())
        })?;
        let image: Arc<dyn RhiTexture> = Arc::clone(presentation.swapchain.image(index)?) as Arc<dyn RhiTexture>;
        Ok(image)
    }

    fn depth_buffer(&self) -> Option<Arc<dyn RhiTexture>> {
        self.presentation.as_ref().map(|p| Arc::clone(&p.depth_buffer) as Arc<dyn RhiTexture>)
    }

    fn current_frame_index(&self) -> usize {
        self.presentation.as_ref().map_or(0, |p| p.scheduler.current_slot())
    }

    fn resize(&mut self, width: u32, height: u32) {
        engine_debug!(LOG_SOURCE, "Resize requested: {}x{}", width, height);
        self.needs_recreate = true;
    }

    fn swapchain_extent(&self) -> (u32, u32) {
        self.presentation.as_ref().map_or((0, 0), |p| {
            let extent = p.swapchain.extent();
            (extent.width, extent.height)
        })
    }

    fn swapchain_format(&self) -> TextureFormat {
        self.presentation.as_ref().map_or(TextureFormat::B8G8R8A8_SRGB, |p| p.swapchain.format())
    }

    fn depth_format(&self) -> TextureFormat {
        self.depth_format
    }

    // ===== SYNC =====

    fn flush_transfers(&self) -> Result<()> {
        self.ctx.transfer.submit_transfers()
    }

    fn wait_idle(&self) -> Result<()> {
        // vkDeviceWaitIdle needs every queue externally synchronized
        let _graphics = self.ctx.graphics_queue.lock()?;
        let _transfer = if Arc::ptr_eq(&self.ctx.graphics_queue, &self.ctx.transfer_queue) {
            None
        } else {
            Some(self.ctx.transfer_queue.lock()?)
        };
        unsafe { self.ctx.device.device_wait_idle() }.map_err(|e| {
            engine_error!(LOG_SOURCE, "vkDeviceWaitIdle failed: {:?}", e);
            native_error("vkDeviceWaitIdle", e)
        })
    }

    fn stats(&self) -> GraphicsDeviceStats {
        let counters = self.presentation.as_ref().map(|p| p.scheduler.counters()).unwrap_or_default();
        GraphicsDeviceStats {
            frames_begun: counters.frames_begun,
            frames_presented: counters.frames_presented,
            frames_skipped: counters.frames_skipped,
            frames_abandoned: counters.frames_abandoned,
            swapchain_recreations: self.swapchain_recreations,
            memory: self.ctx.memory.stats(),
            sync: self.ctx.sync.stats(),
            validation: debug::get_validation_stats(),
        }
    }
}

impl Drop for VulkanGraphicsDevice {
    fn drop(&mut self) {
        if let Err(e) = self.wait_idle() {
            engine_warn!(LOG_SOURCE, "wait_idle failed during teardown: {}", e);
        }

        // Pending uploads and their cleanups release buffers that hold the context
        self.ctx.transfer.shutdown();

        // Swapchain, depth buffer, frame pools and fences, in field order
        self.presentation = None;

        let outstanding = Arc::strong_count(&self.ctx) - 1;
        if outstanding > 0 {
            engine_warn!(LOG_SOURCE, "{} GPU resources still alive at device teardown", outstanding);
        }

        unsafe {
            self.ctx.device.destroy_descriptor_pool(self.ctx.descriptor_pool, None);
            self.ctx.memory.shutdown();
            self.ctx.device.destroy_device(None);

            if let Some((loader, messenger)) = self.debug_messenger.take() {
                debug::cleanup_debug_config();
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            self.surface_loader.destroy_surface(self.surface, None);
            self.instance.destroy_instance(None);
        }
        engine_info!(LOG_SOURCE, "Graphics device destroyed");
    }
}

#[cfg(test)]
#[path = "vulkan_graphics_device_tests.rs"]
mod tests;
