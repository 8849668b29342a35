/// GraphicsDevice trait - resource factory and frame lifecycle

use std::sync::Arc;

use crate::error::Result;
use crate::graphics_device::{
    Buffer, Texture, Sampler, Shader, Pipeline, CommandList, DescriptorSetLayout, DescriptorSet,
    BufferDesc, TextureDesc, SamplerDesc, ShaderDesc, PipelineDesc, ComputePipelineDesc, DescriptorSetLayoutDesc,
    TextureFormat, ValidationStats,
};

/// Result of `GraphicsDevice::begin_frame`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameBegin {
    /// An image was acquired; record, submit and present
    Ready,
    /// The swapchain was recreated; skip this frame
    Skipped,
}

/// Memory manager counters
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MemoryStats {
    pub pool_count: usize,
    /// Bytes reserved by all pools
    pub total_reserved: u64,
    /// Bytes handed out to live allocations
    pub total_used: u64,
    pub peak_used: u64,
    pub allocation_count: usize,
    pub largest_free_block: u64,
    /// Share of free bytes outside each pool's largest free block (0 when nothing is free)
    pub fragmentation: f32,
}

/// Synchronization layer counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncStats {
    pub live_semaphores: u32,
    pub live_fences: u32,
    pub semaphores_created: u64,
    pub fences_created: u64,
    pub barriers: u64,
    pub submits: u64,
    pub wait_time_ns: u64,
    pub signal_time_ns: u64,
}

/// Device-wide counters
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct GraphicsDeviceStats {
    pub frames_begun: u64,
    pub frames_presented: u64,
    pub frames_skipped: u64,
    pub frames_abandoned: u64,
    pub swapchain_recreations: u64,
    pub memory: MemoryStats,
    pub sync: SyncStats,
    pub validation: ValidationStats,
}

/// Main graphics device trait
///
/// The central factory for GPU resources and the owner of the frame loop.
/// Implemented by backend devices (e.g., VulkanGraphicsDevice).
///
/// Frame protocol: `begin_frame` -> `create_command_list` / record ->
/// `submit_command_list` -> `present`, or `abandon_frame` after a failure.
pub trait GraphicsDevice: Send + Sync {
    // ===== RESOURCES =====

    /// Create a buffer backed by the memory manager
    fn create_buffer(&mut self, desc: BufferDesc) -> Result<Arc<dyn Buffer>>;

    /// Create a device-local buffer and queue a staged upload of `data`
    ///
    /// The copy lands on the next transfer flush (at the latest, the next
    /// `submit_command_list` or `begin_frame`). The staging buffer lives until the copy completes.
    fn create_and_upload_buffer(&mut self, desc: BufferDesc, data: &[u8]) -> Result<Arc<dyn Buffer>>;

    /// Create an uninitialized 2D texture
    fn create_texture_2d(&mut self, desc: TextureDesc) -> Result<Arc<dyn Texture>>;

    /// Create a 2D texture and upload mip 0 of every layer
    ///
    /// `data` holds `array_layers` tightly packed level-0 images. Every
    /// subresource ends in SHADER_READ_ONLY.
    fn create_and_upload_texture(&mut self, desc: TextureDesc, data: &[u8]) -> Result<Arc<dyn Texture>>;

    fn create_sampler(&mut self, desc: SamplerDesc) -> Result<Arc<dyn Sampler>>;

    /// Create a shader from SPIR-V bytecode
    fn create_shader(&mut self, desc: ShaderDesc) -> Result<Arc<dyn Shader>>;

    fn create_graphics_pipeline(&mut self, desc: PipelineDesc) -> Result<Arc<dyn Pipeline>>;

    /// Create a compute pipeline from one compute shader
    fn create_compute_pipeline(&mut self, desc: ComputePipelineDesc) -> Result<Arc<dyn Pipeline>>;

    fn create_descriptor_set_layout(&mut self, desc: DescriptorSetLayoutDesc) -> Result<Arc<dyn DescriptorSetLayout>>;

    /// Allocate a set from the device descriptor pool
    fn allocate_descriptor_set(&mut self, layout: &Arc<dyn DescriptorSetLayout>) -> Result<Arc<dyn DescriptorSet>>;

    // ===== COMMANDS =====

    /// Allocate a command list from the current frame slot's pool
    ///
    /// Valid until the slot is reused `max_frames_in_flight` frames later.
    fn create_command_list(&mut self) -> Result<Box<dyn CommandList>>;

    /// Submit one ended command list for the current frame
    fn submit_command_list(&mut self, command_list: &dyn CommandList) -> Result<()> {
        self.submit_command_lists(&[command_list])
    }

    /// Submit several ended command lists in one submission
    fn submit_command_lists(&mut self, command_lists: &[&dyn CommandList]) -> Result<()>;

    // ===== FRAME =====

    /// Wait for the frame slot, acquire a swapchain image and reset the slot
    fn begin_frame(&mut self) -> Result<FrameBegin>;

    /// Present the current image and advance to the next frame slot
    fn present(&mut self) -> Result<()>;

    /// Give up a frame that cannot be submitted or presented
    ///
    /// Releases the acquired image and the slot so the next `begin_frame`
    /// starts clean. Does nothing when no frame is open.
    fn abandon_frame(&mut self) -> Result<()>;

    /// Swapchain image acquired by the last successful `begin_frame`
    fn current_back_buffer(&self) -> Result<Arc<dyn Texture>>;

    /// Depth buffer matching the swapchain extent
    fn depth_buffer(&self) -> Option<Arc<dyn Texture>>;

    /// Index of the current frame slot in `[0, max_frames_in_flight)`
    fn current_frame_index(&self) -> usize;

    /// Request a swapchain rebuild before the next present
    fn resize(&mut self, width: u32, height: u32);

    fn swapchain_extent(&self) -> (u32, u32);

    fn swapchain_format(&self) -> TextureFormat;

    fn depth_format(&self) -> TextureFormat;

    // ===== SYNC =====

    /// Submit every pending transfer and wait for completion
    fn flush_transfers(&self) -> Result<()>;

    /// Wait for all GPU work to complete
    fn wait_idle(&self) -> Result<()>;

    fn stats(&self) -> GraphicsDeviceStats;
}
