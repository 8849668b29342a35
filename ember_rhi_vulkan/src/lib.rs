/*!
# Ember RHI - Vulkan Backend

Vulkan implementation of the `ember_rhi` graphics device contract, built on
`ash` with Vulkan 1.3 (dynamic rendering, synchronization2, timeline semaphores).

## Architecture

- **VulkanGraphicsDevice**: instance, device, swapchain and the frame loop
- **MemoryManager**: pooled sub-allocation of device memory (Linear, FreeList, Buddy, Hybrid)
- **SyncManager**: semaphores, fences, barriers and `vkQueueSubmit2`
- **TransferManager**: batched staging uploads with deferred cleanup
- **Buffer / Texture / Sampler / Shader / Pipeline / DescriptorSet**: RHI resources
- **CommandList**: recording with per-subresource attachment layout tracking

Validation layers and the debug messenger are compiled in with the
`vulkan-validation` feature and enabled at runtime by
`GraphicsDeviceConfig::enable_validation_layers`.

## Example

```no_run
use std::sync::Arc;
use ember_rhi::ember::{GraphicsDevice, GraphicsDeviceConfig};
use ember_rhi_vulkan::ember::VulkanGraphicsDevice;

# fn run(window: Arc<winit::window::Window>) -> ember_rhi::ember::Result<()> {
let mut device = VulkanGraphicsDevice::new(window, GraphicsDeviceConfig::default())?;
device.wait_idle()?;
# Ok(())
# }
```
*/

mod vulkan_context;
mod vulkan_format;
mod vulkan_memory;
mod vulkan_sync;
mod vulkan_transfer;
mod vulkan_buffer;
mod vulkan_texture;
mod vulkan_sampler;
mod vulkan_shader;
mod vulkan_descriptor_set;
mod vulkan_pipeline;
mod vulkan_command_list;
mod vulkan_swapchain;
mod vulkan_frame;
mod vulkan_graphics_device;
#[cfg_attr(not(feature = "vulkan-validation"), allow(dead_code))]
mod debug;

/// Main ember namespace module for the Vulkan backend
pub mod ember {
    pub use crate::vulkan_graphics_device::VulkanGraphicsDevice;
    pub use crate::vulkan_context::{GpuContext, GpuQueue};

    // Subsystems
    pub use crate::vulkan_memory::{MemoryAllocation, MemoryBackend, MemoryManager, VulkanMemoryBackend};
    pub use crate::vulkan_sync::{
        create_buffer_memory_barrier, create_image_memory_barrier, create_memory_barrier, layout_transition_scope,
        semaphore_submit_info, BarrierScope, Fence, FenceApi, Semaphore, SemaphoreDesc, SemaphoreType, SubmitBatch,
        SyncManager,
    };
    pub use crate::vulkan_transfer::{
        CleanupFn, ImmediateCommand, TransferBackend, TransferFn, TransferManager, UploadState, UploadTicket,
        VulkanTransferBackend,
    };
    pub use crate::vulkan_frame::{FrameCounters, FrameScheduler, FrameState};

    // Resources
    pub use crate::vulkan_buffer::Buffer;
    pub use crate::vulkan_texture::{ImageLayoutState, Texture};
    pub use crate::vulkan_sampler::Sampler;
    pub use crate::vulkan_shader::Shader;
    pub use crate::vulkan_pipeline::Pipeline;
    pub use crate::vulkan_descriptor_set::{DescriptorSet, DescriptorSetLayout};
    pub use crate::vulkan_command_list::{CommandList, RecordingState};

    // Validation reporting
    pub use crate::debug::{get_validation_stats, print_validation_stats_report};
}
