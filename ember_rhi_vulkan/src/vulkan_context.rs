/// GpuContext - shared GPU state for all Vulkan objects
///
/// Every resource keeps an `Arc<GpuContext>` instead of duplicating device,
/// memory manager and queue references.
///
/// Native device and instance destruction is handled by `VulkanGraphicsDevice::drop`,
/// which controls the teardown order; this type never destroys anything itself.

use ash::vk;
use ember_rhi::ember::{Error, Result};
use std::ffi::CString;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::vulkan_memory::MemoryManager;
use crate::vulkan_sync::SyncManager;
use crate::vulkan_transfer::TransferManager;

/// Map a native result code to an RHI error
pub(crate) fn native_error(operation: &str, result: vk::Result) -> Error {
    match result {
        vk::Result::ERROR_DEVICE_LOST => Error::DeviceLost,
        vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => Error::OutOfMemory,
        vk::Result::TIMEOUT => Error::Timeout(operation.to_string()),
        other => Error::NativeError { operation: operation.to_string(), code: other.as_raw() },
    }
}

/// A device queue with its own submission lock
pub struct GpuQueue {
    pub handle: vk::Queue,
    pub family_index: u32,
    submit_lock: Mutex<()>,
}

impl GpuQueue {
    pub fn new(handle: vk::Queue, family_index: u32) -> Self {
        Self { handle, family_index, submit_lock: Mutex::new(()) }
    }

    /// Hold for the duration of any `vkQueueSubmit*` / `vkQueueWaitIdle` / present on this queue
    pub fn lock(&self) -> Result<MutexGuard<'_, ()>> {
        self.submit_lock
            .lock()
            .map_err(|_| Error::BackendError("queue submit lock poisoned".to_string()))
    }

    pub fn wait_idle(&self, device: &ash::Device) -> Result<()> {
        let _guard = self.lock()?;
        unsafe { device.queue_wait_idle(self.handle) }.map_err(|e| native_error("vkQueueWaitIdle", e))
    }
}

/// Shared GPU context for all Vulkan resources
pub struct GpuContext {
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub limits: vk::PhysicalDeviceLimits,

    pub memory: MemoryManager,
    pub sync: Arc<SyncManager>,
    pub transfer: TransferManager,

    pub graphics_queue: Arc<GpuQueue>,
    /// Second queue of the graphics family when available, otherwise the graphics queue
    pub transfer_queue: Arc<GpuQueue>,

    /// Pool every descriptor set is allocated from (FREE_DESCRIPTOR_SET)
    pub descriptor_pool: vk::DescriptorPool,
    /// Held around every allocate/free on `descriptor_pool`
    pub(crate) descriptor_pool_lock: Mutex<()>,

    pub(crate) debug_utils: Option<ash::ext::debug_utils::Device>,
}

impl GpuContext {
    pub(crate) fn lock_descriptor_pool(&self) -> Result<MutexGuard<'_, ()>> {
        self.descriptor_pool_lock
            .lock()
            .map_err(|_| Error::BackendError("descriptor pool lock poisoned".to_string()))
    }

    /// Attach a debug name to a native object (no-op without validation layers)
    pub fn set_debug_name<H: vk::Handle>(&self, handle: H, name: &str) {
        let Some(debug_utils) = &self.debug_utils else {
            return;
        };
        if name.is_empty() {
            return;
        }
        let Ok(name) = CString::new(name) else {
            return;
        };
        let info = vk::DebugUtilsObjectNameInfoEXT::default()
            .object_handle(handle)
            .object_name(name.as_c_str());
        // Naming is best effort
        let _ = unsafe { debug_utils.set_debug_utils_object_name(&info) };
    }
}
