/// Frame pacing and per-slot frame resources
///
/// A frame moves through `Idle -> ImageAcquired -> CommandsSubmitted -> Presented`.
/// Each of the `max_frames_in_flight` slots owns a fence; beginning a frame
/// waits on the slot's fence, so the CPU is never more than that many frames
/// ahead of the GPU.

use ember_rhi::ember::{Error, Result};
use ember_rhi::ember::render::FrameBegin;
use ember_rhi::{engine_debug, engine_err};
use ash::vk;
use std::sync::Arc;

use crate::vulkan_context::GpuContext;
use crate::vulkan_sync::{FenceApi, Semaphore, SemaphoreDesc};

const LOG_SOURCE: &str = "ember::vulkan::Frame";

// ============================================================================
// FRAME SCHEDULER
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Idle,
    ImageAcquired,
    CommandsSubmitted,
    Presented,
}

/// Frame counters kept by the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameCounters {
    pub frames_begun: u64,
    pub frames_presented: u64,
    pub frames_skipped: u64,
    pub frames_abandoned: u64,
}

/// Frame state machine over one fence per frame slot
pub struct FrameScheduler<F: FenceApi> {
    fences: Vec<F>,
    current: usize,
    state: FrameState,
    image_index: Option<u32>,
    timeout_ns: u64,
    counters: FrameCounters,
}

impl<F: FenceApi> FrameScheduler<F> {
    /// `fences` must be created signaled, one per frame slot
    pub fn new(fences: Vec<F>, timeout_ns: u64) -> Result<Self> {
        if fences.is_empty() {
            return Err(Error::InitializationFailed("frame scheduler needs at least one frame slot".to_string()));
        }
        Ok(Self {
            fences,
            current: 0,
            state: FrameState::Idle,
            image_index: None,
            timeout_ns,
            counters: FrameCounters::default(),
        })
    }

    pub fn max_frames_in_flight(&self) -> usize {
        self.fences.len()
    }

    pub fn current_slot(&self) -> usize {
        self.current
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    /// Swapchain image acquired for the frame in progress
    pub fn image_index(&self) -> Option<u32> {
        self.image_index
    }

    pub fn counters(&self) -> FrameCounters {
        self.counters
    }

    fn reject(&self, operation: &str) -> Error {
        Error::InvalidOperation(format!("{} not allowed in frame state {:?}", operation, self.state))
    }

    /// Wait for the slot, then acquire an image through `acquire`
    ///
    /// `acquire` returns `None` when the swapchain had to be recreated; the
    /// frame is then skipped and the slot fence stays signaled. Otherwise the
    /// fence is reset and the frame is ready for recording.
    pub fn begin(&mut self, acquire: impl FnOnce() -> Result<Option<u32>>) -> Result<FrameBegin> {
        if !matches!(self.state, FrameState::Idle | FrameState::Presented) {
            return Err(self.reject("begin_frame"));
        }
        self.fences[self.current].wait(self.timeout_ns)?;

        match acquire()? {
            None => {
                self.counters.frames_skipped += 1;
                self.state = FrameState::Idle;
                engine_debug!(LOG_SOURCE, "Frame skipped on slot {}", self.current);
                Ok(FrameBegin::Skipped)
            }
            Some(index) => {
                self.fences[self.current].reset()?;
                self.image_index = Some(index);
                self.state = FrameState::ImageAcquired;
                self.counters.frames_begun += 1;
                Ok(FrameBegin::Ready)
            }
        }
    }

    /// Fence the frame's submission signals; only one submission per frame
    pub fn submission_fence(&self) -> Result<&F> {
        if self.state != FrameState::ImageAcquired {
            return Err(self.reject("submit"));
        }
        Ok(&self.fences[self.current])
    }

    pub fn mark_submitted(&mut self) -> Result<()> {
        if self.state != FrameState::ImageAcquired {
            return Err(self.reject("submit"));
        }
        self.state = FrameState::CommandsSubmitted;
        Ok(())
    }

    /// Present through `present` and advance to the next slot
    ///
    /// The slot advances even when presenting fails: the submitted work
    /// still signals the slot fence.
    pub fn present<T>(&mut self, present: impl FnOnce(u32) -> Result<T>) -> Result<T> {
        let (FrameState::CommandsSubmitted, Some(index)) = (self.state, self.image_index) else {
            return Err(self.reject("present"));
        };
        let result = present(index);
        self.state = FrameState::Presented;
        self.image_index = None;
        self.current = (self.current + 1) % self.fences.len();
        if result.is_ok() {
            self.counters.frames_presented += 1;
        }
        result
    }

    /// Return an acquired frame to Idle without presenting
    ///
    /// The caller must already have submitted work that signals the slot fence
    /// and consumes the acquire semaphore. The slot is not advanced.
    pub fn abandon(&mut self) -> Result<()> {
        if self.state != FrameState::ImageAcquired {
            return Err(self.reject("abandon_frame"));
        }
        self.state = FrameState::Idle;
        self.image_index = None;
        self.counters.frames_abandoned += 1;
        engine_debug!(LOG_SOURCE, "Frame abandoned on slot {}", self.current);
        Ok(())
    }

    /// Wait for every slot's fence
    pub fn wait_all(&self) -> Result<()> {
        self.fences.iter().try_for_each(|f| f.wait(self.timeout_ns))
    }
}

// ============================================================================
// FRAME RESOURCES
// ============================================================================

/// Command pool, recycled command buffers and acquire semaphore of one frame slot
pub(crate) struct FrameResources {
    ctx: Arc<GpuContext>,
    pool: vk::CommandPool,
    command_buffers: Vec<vk::CommandBuffer>,
    /// Buffers before this index are in use by the current frame
    next_command_buffer: usize,
    pub(crate) image_available: Semaphore,
}

impl FrameResources {
    pub(crate) fn new(ctx: &Arc<GpuContext>) -> Result<Self> {
        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(ctx.graphics_queue.family_index)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let pool = unsafe { ctx.device.create_command_pool(&pool_info, None) }
            .map_err(|e| engine_err!(LOG_SOURCE, "Failed to create frame command pool: {:?}", e))?;
        let image_available = match Semaphore::new(&ctx.sync, SemaphoreDesc::binary()) {
            Ok(semaphore) => semaphore,
            Err(e) => {
                unsafe { ctx.device.destroy_command_pool(pool, None) };
                return Err(e);
            }
        };
        Ok(Self {
            ctx: Arc::clone(ctx),
            pool,
            command_buffers: Vec::new(),
            next_command_buffer: 0,
            image_available,
        })
    }

    /// Reset the pool; every buffer becomes available again
    pub(crate) fn reset(&mut self) -> Result<()> {
        unsafe { self.ctx.device.reset_command_pool(self.pool, vk::CommandPoolResetFlags::empty()) }
            .map_err(|e| engine_err!(LOG_SOURCE, "Failed to reset frame command pool: {:?}", e))?;
        self.next_command_buffer = 0;
        Ok(())
    }

    /// A command buffer in the initial state, reused when possible
    pub(crate) fn next_command_buffer(&mut self) -> Result<vk::CommandBuffer> {
        if let Some(&buffer) = self.command_buffers.get(self.next_command_buffer) {
            self.next_command_buffer += 1;
            return Ok(buffer);
        }
        let allocate_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffer = unsafe { self.ctx.device.allocate_command_buffers(&allocate_info) }
            .map_err(|e| engine_err!(LOG_SOURCE, "Failed to allocate command buffer: {:?}", e))?
            .into_iter()
            .next()
            .ok_or_else(|| Error::AllocationFailed("command pool returned no command buffer".to_string()))?;
        self.command_buffers.push(buffer);
        self.next_command_buffer = self.command_buffers.len();
        Ok(buffer)
    }
}

impl Drop for FrameResources {
    fn drop(&mut self) {
        // Destroying the pool frees its command buffers
        unsafe { self.ctx.device.destroy_command_pool(self.pool, None) };
    }
}

#[cfg(test)]
#[path = "vulkan_frame_tests.rs"]
mod tests;
