/// Synchronization layer - semaphores, fences, synchronization2 barriers and submission
///
/// `SyncManager` owns the counters and configuration shared by every sync object;
/// `Semaphore` and `Fence` keep an `Arc` to it and destroy their native handle on drop.

use ash::vk;
use ember_rhi::ember::{Error, Result};
use ember_rhi::ember::render::{ImageLayout, SyncConfig, SyncStats};
use ember_rhi::{engine_error, engine_warn};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::vulkan_context::{native_error, GpuQueue};

const LOG_SOURCE: &str = "ember::vulkan::Sync";

// ===== COUNTERS =====

/// Live-object caps and cumulative counters
#[derive(Default)]
pub(crate) struct SyncCounters {
    live_semaphores: AtomicU32,
    live_fences: AtomicU32,
    semaphores_created: AtomicU64,
    fences_created: AtomicU64,
    barriers: AtomicU64,
    submits: AtomicU64,
    wait_time_ns: AtomicU64,
    signal_time_ns: AtomicU64,
}

impl SyncCounters {
    fn acquire(live: &AtomicU32, max: u32) -> bool {
        live.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1)).is_ok()
    }

    fn release(live: &AtomicU32) {
        let _ = live.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    pub(crate) fn acquire_semaphore(&self, max: u32) -> Result<()> {
        if !Self::acquire(&self.live_semaphores, max) {
            return Err(Error::InvalidOperation(format!("semaphore limit reached ({})", max)));
        }
        self.semaphores_created.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub(crate) fn release_semaphore(&self) {
        Self::release(&self.live_semaphores);
    }

    pub(crate) fn acquire_fence(&self, max: u32) -> Result<()> {
        if !Self::acquire(&self.live_fences, max) {
            return Err(Error::InvalidOperation(format!("fence limit reached ({})", max)));
        }
        self.fences_created.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub(crate) fn release_fence(&self) {
        Self::release(&self.live_fences);
    }

    pub(crate) fn add_barriers(&self, count: u64) {
        self.barriers.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn add_submit(&self) {
        self.submits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_wait_time(&self, since: Instant) {
        self.wait_time_ns.fetch_add(since.elapsed().as_nanos() as u64, Ordering::Relaxed);
    }

    pub(crate) fn add_signal_time(&self, since: Instant) {
        self.signal_time_ns.fetch_add(since.elapsed().as_nanos() as u64, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> SyncStats {
        SyncStats {
            live_semaphores: self.live_semaphores.load(Ordering::Acquire),
            live_fences: self.live_fences.load(Ordering::Acquire),
            semaphores_created: self.semaphores_created.load(Ordering::Relaxed),
            fences_created: self.fences_created.load(Ordering::Relaxed),
            barriers: self.barriers.load(Ordering::Relaxed),
            submits: self.submits.load(Ordering::Relaxed),
            wait_time_ns: self.wait_time_ns.load(Ordering::Relaxed),
            signal_time_ns: self.signal_time_ns.load(Ordering::Relaxed),
        }
    }
}

// ===== SYNC MANAGER =====

/// Device-wide synchronization services
pub struct SyncManager {
    device: ash::Device,
    config: SyncConfig,
    counters: SyncCounters,
}

impl SyncManager {
    pub fn new(device: ash::Device, config: SyncConfig) -> Self {
        Self { device, config, counters: SyncCounters::default() }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn default_timeout(&self) -> u64 {
        self.config.default_timeout_ns
    }

    pub fn stats(&self) -> SyncStats {
        self.counters.snapshot()
    }

    pub(crate) fn counters(&self) -> &SyncCounters {
        &self.counters
    }

    /// Record one `vkCmdPipelineBarrier2` covering all given barriers (nothing when all are empty)
    pub fn pipeline_barrier(
        &self,
        cmd: vk::CommandBuffer,
        memory: &[vk::MemoryBarrier2<'_>],
        buffer: &[vk::BufferMemoryBarrier2<'_>],
        image: &[vk::ImageMemoryBarrier2<'_>],
    ) {
        let count = memory.len() + buffer.len() + image.len();
        if count == 0 {
            return;
        }
        let dependency = vk::DependencyInfo::default()
            .memory_barriers(memory)
            .buffer_memory_barriers(buffer)
            .image_memory_barriers(image);
        unsafe { self.device.cmd_pipeline_barrier2(cmd, &dependency) };
        self.counters.add_barriers(count as u64);
    }

    /// Submit every batch in one `vkQueueSubmit2` call under the queue's submit lock
    pub fn queue_submit2(&self, queue: &GpuQueue, batches: &[SubmitBatch], fence: vk::Fence) -> Result<()> {
        let command_infos: Vec<Vec<vk::CommandBufferSubmitInfo>> = batches.iter()
            .map(|b| b.command_buffers.iter()
                .map(|&cmd| vk::CommandBufferSubmitInfo::default().command_buffer(cmd))
                .collect())
            .collect();
        let submits: Vec<vk::SubmitInfo2> = batches.iter().zip(&command_infos)
            .map(|(batch, commands)| vk::SubmitInfo2::default()
                .command_buffer_infos(commands)
                .wait_semaphore_infos(&batch.wait_semaphores)
                .signal_semaphore_infos(&batch.signal_semaphores))
            .collect();

        let result = {
            let _guard = queue.lock()?;
            unsafe { self.device.queue_submit2(queue.handle, &submits, fence) }
        };

        match result {
            Ok(()) => {
                self.counters.add_submit();
                Ok(())
            }
            Err(vk::Result::ERROR_DEVICE_LOST) => {
                engine_error!(LOG_SOURCE, "vkQueueSubmit2 reported device lost");
                Err(Error::DeviceLost)
            }
            Err(e) => {
                engine_error!(LOG_SOURCE, "vkQueueSubmit2 failed: {:?}", e);
                Err(Error::SubmissionFailed(format!("vkQueueSubmit2: {:?}", e)))
            }
        }
    }
}

// ===== SEMAPHORES =====

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SemaphoreType {
    #[default]
    Binary,
    Timeline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SemaphoreDesc {
    pub semaphore_type: SemaphoreType,
    /// Starting counter of a timeline semaphore
    pub initial_value: u64,
}

impl SemaphoreDesc {
    pub fn binary() -> Self {
        Self::default()
    }

    pub fn timeline(initial_value: u64) -> Self {
        Self { semaphore_type: SemaphoreType::Timeline, initial_value }
    }
}

/// Whether a host signal of `value` must reach the driver; timeline counters never go backwards
pub(crate) fn needs_signal(current: u64, value: u64) -> Result<bool> {
    if value < current {
        return Err(Error::InvalidOperation(format!(
            "timeline signal {} below current value {}", value, current
        )));
    }
    Ok(value > current)
}

/// Binary or timeline semaphore
pub struct Semaphore {
    sync: Arc<SyncManager>,
    semaphore: vk::Semaphore,
    semaphore_type: SemaphoreType,
}

impl Semaphore {
    pub fn new(sync: &Arc<SyncManager>, desc: SemaphoreDesc) -> Result<Self> {
        if desc.semaphore_type == SemaphoreType::Timeline && !sync.config.enable_timeline_semaphores {
            return Err(Error::InvalidOperation("timeline semaphores are disabled".to_string()));
        }
        sync.counters.acquire_semaphore(sync.config.max_semaphores)?;

        let mut type_info = vk::SemaphoreTypeCreateInfo::default()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(desc.initial_value);
        let mut create_info = vk::SemaphoreCreateInfo::default();
        if desc.semaphore_type == SemaphoreType::Timeline {
            create_info = create_info.push_next(&mut type_info);
        }

        match unsafe { sync.device.create_semaphore(&create_info, None) } {
            Ok(semaphore) => Ok(Self { sync: Arc::clone(sync), semaphore, semaphore_type: desc.semaphore_type }),
            Err(e) => {
                sync.counters.release_semaphore();
                Err(native_error("vkCreateSemaphore", e))
            }
        }
    }

    pub fn handle(&self) -> vk::Semaphore {
        self.semaphore
    }

    pub fn semaphore_type(&self) -> SemaphoreType {
        self.semaphore_type
    }

    fn require_timeline(&self, operation: &str) -> Result<()> {
        if self.semaphore_type != SemaphoreType::Timeline {
            return Err(Error::InvalidOperation(format!("{} on a binary semaphore", operation)));
        }
        Ok(())
    }

    /// Host-side signal of a timeline semaphore
    ///
    /// Fails when `value` is below the current counter; signaling the current
    /// value again does nothing.
    pub fn signal(&self, value: u64) -> Result<()> {
        self.require_timeline("signal")?;
        if !needs_signal(self.value()?, value)? {
            return Ok(());
        }
        let start = Instant::now();
        let info = vk::SemaphoreSignalInfo::default().semaphore(self.semaphore).value(value);
        let result = unsafe { self.sync.device.signal_semaphore(&info) };
        self.sync.counters.add_signal_time(start);
        result.map_err(|e| native_error("vkSignalSemaphore", e))
    }

    /// Block until the timeline counter reaches `value`
    pub fn wait(&self, value: u64, timeout_ns: u64) -> Result<()> {
        self.require_timeline("wait")?;
        let semaphores = [self.semaphore];
        let values = [value];
        let info = vk::SemaphoreWaitInfo::default().semaphores(&semaphores).values(&values);
        let start = Instant::now();
        let result = unsafe { self.sync.device.wait_semaphores(&info, timeout_ns) };
        self.sync.counters.add_wait_time(start);
        result.map_err(|e| match e {
            vk::Result::TIMEOUT => Error::Timeout(format!("timeline semaphore wait for {}", value)),
            other => native_error("vkWaitSemaphores", other),
        })
    }

    /// Current timeline counter
    pub fn value(&self) -> Result<u64> {
        self.require_timeline("value")?;
        unsafe { self.sync.device.get_semaphore_counter_value(self.semaphore) }
            .map_err(|e| native_error("vkGetSemaphoreCounterValue", e))
    }

    /// Wait or signal entry for `SubmitBatch` (`value` is ignored by binary semaphores)
    pub fn submit_info(&self, stage_mask: vk::PipelineStageFlags2, value: u64) -> vk::SemaphoreSubmitInfo<'static> {
        semaphore_submit_info(self.semaphore, stage_mask, value)
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        unsafe { self.sync.device.destroy_semaphore(self.semaphore, None) };
        self.sync.counters.release_semaphore();
    }
}

pub fn semaphore_submit_info(
    semaphore: vk::Semaphore,
    stage_mask: vk::PipelineStageFlags2,
    value: u64,
) -> vk::SemaphoreSubmitInfo<'static> {
    vk::SemaphoreSubmitInfo::default()
        .semaphore(semaphore)
        .stage_mask(stage_mask)
        .value(value)
}

// ===== FENCES =====

/// Host-visible completion signal, as needed by the frame scheduler
pub trait FenceApi {
    fn wait(&self, timeout_ns: u64) -> Result<()>;
    fn reset(&self) -> Result<()>;
    fn is_signaled(&self) -> Result<bool>;
}

pub struct Fence {
    sync: Arc<SyncManager>,
    fence: vk::Fence,
}

impl Fence {
    pub fn new(sync: &Arc<SyncManager>, signaled: bool) -> Result<Self> {
        sync.counters.acquire_fence(sync.config.max_fences)?;
        let flags = if signaled { vk::FenceCreateFlags::SIGNALED } else { vk::FenceCreateFlags::empty() };
        match unsafe { sync.device.create_fence(&vk::FenceCreateInfo::default().flags(flags), None) } {
            Ok(fence) => Ok(Self { sync: Arc::clone(sync), fence }),
            Err(e) => {
                sync.counters.release_fence();
                Err(native_error("vkCreateFence", e))
            }
        }
    }

    pub fn handle(&self) -> vk::Fence {
        self.fence
    }
}

impl FenceApi for Fence {
    fn wait(&self, timeout_ns: u64) -> Result<()> {
        let start = Instant::now();
        let result = unsafe { self.sync.device.wait_for_fences(&[self.fence], true, timeout_ns) };
        self.sync.counters.add_wait_time(start);
        match result {
            Ok(()) => Ok(()),
            Err(vk::Result::TIMEOUT) => {
                engine_warn!(LOG_SOURCE, "Fence wait timed out after {} ns", timeout_ns);
                Err(Error::Timeout("fence wait".to_string()))
            }
            Err(e) => Err(native_error("vkWaitForFences", e)),
        }
    }

    fn reset(&self) -> Result<()> {
        unsafe { self.sync.device.reset_fences(&[self.fence]) }.map_err(|e| native_error("vkResetFences", e))
    }

    fn is_signaled(&self) -> Result<bool> {
        unsafe { self.sync.device.get_fence_status(self.fence) }.map_err(|e| native_error("vkGetFenceStatus", e))
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        unsafe { self.sync.device.destroy_fence(self.fence, None) };
        self.sync.counters.release_fence();
    }
}

// ===== BARRIERS =====

/// Source and destination halves of a synchronization2 dependency
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarrierScope {
    pub src_stage: vk::PipelineStageFlags2,
    pub src_access: vk::AccessFlags2,
    pub dst_stage: vk::PipelineStageFlags2,
    pub dst_access: vk::AccessFlags2,
}

impl BarrierScope {
    pub const fn new(
        src_stage: vk::PipelineStageFlags2,
        src_access: vk::AccessFlags2,
        dst_stage: vk::PipelineStageFlags2,
        dst_access: vk::AccessFlags2,
    ) -> Self {
        Self { src_stage, src_access, dst_stage, dst_access }
    }

    /// ALL_COMMANDS with MEMORY_READ | MEMORY_WRITE on both sides
    pub const fn full() -> Self {
        let access = vk::AccessFlags2::from_raw(
            vk::AccessFlags2::MEMORY_READ.as_raw() | vk::AccessFlags2::MEMORY_WRITE.as_raw(),
        );
        Self::new(vk::PipelineStageFlags2::ALL_COMMANDS, access, vk::PipelineStageFlags2::ALL_COMMANDS, access)
    }
}

pub fn create_memory_barrier(scope: BarrierScope) -> vk::MemoryBarrier2<'static> {
    vk::MemoryBarrier2::default()
        .src_stage_mask(scope.src_stage)
        .src_access_mask(scope.src_access)
        .dst_stage_mask(scope.dst_stage)
        .dst_access_mask(scope.dst_access)
}

pub fn create_buffer_memory_barrier(
    scope: BarrierScope,
    buffer: vk::Buffer,
    offset: u64,
    size: u64,
) -> vk::BufferMemoryBarrier2<'static> {
    vk::BufferMemoryBarrier2::default()
        .src_stage_mask(scope.src_stage)
        .src_access_mask(scope.src_access)
        .dst_stage_mask(scope.dst_stage)
        .dst_access_mask(scope.dst_access)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .buffer(buffer)
        .offset(offset)
        .size(size)
}

pub fn create_image_memory_barrier(
    scope: BarrierScope,
    image: vk::Image,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
    range: vk::ImageSubresourceRange,
) -> vk::ImageMemoryBarrier2<'static> {
    vk::ImageMemoryBarrier2::default()
        .src_stage_mask(scope.src_stage)
        .src_access_mask(scope.src_access)
        .dst_stage_mask(scope.dst_stage)
        .dst_access_mask(scope.dst_access)
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(range)
}

/// Stage and access masks for a layout transition
///
/// Pairs outside the table get `BarrierScope::full()`.
pub fn layout_transition_scope(old: ImageLayout, new: ImageLayout) -> BarrierScope {
    use vk::AccessFlags2 as A;
    use vk::PipelineStageFlags2 as S;
    use ImageLayout::*;

    let fragment_tests = S::EARLY_FRAGMENT_TESTS | S::LATE_FRAGMENT_TESTS;
    let depth_rw = A::DEPTH_STENCIL_ATTACHMENT_READ | A::DEPTH_STENCIL_ATTACHMENT_WRITE;

    match (old, new) {
        (Undefined, TransferDst) => BarrierScope::new(S::NONE, A::NONE, S::TRANSFER, A::TRANSFER_WRITE),
        (TransferDst, ShaderReadOnly) => BarrierScope::new(S::TRANSFER, A::TRANSFER_WRITE, S::FRAGMENT_SHADER, A::SHADER_READ),
        (Undefined | PresentSrc, ColorAttachment) => BarrierScope::new(
            S::COLOR_ATTACHMENT_OUTPUT, A::NONE,
            S::COLOR_ATTACHMENT_OUTPUT, A::COLOR_ATTACHMENT_READ | A::COLOR_ATTACHMENT_WRITE,
        ),
        (ShaderReadOnly, ColorAttachment) => BarrierScope::new(
            S::FRAGMENT_SHADER, A::SHADER_READ,
            S::COLOR_ATTACHMENT_OUTPUT, A::COLOR_ATTACHMENT_WRITE,
        ),
        (ColorAttachment, PresentSrc) => BarrierScope::new(
            S::COLOR_ATTACHMENT_OUTPUT, A::COLOR_ATTACHMENT_WRITE,
            S::BOTTOM_OF_PIPE, A::NONE,
        ),
        (ColorAttachment, ShaderReadOnly) => BarrierScope::new(
            S::COLOR_ATTACHMENT_OUTPUT, A::COLOR_ATTACHMENT_WRITE,
            S::FRAGMENT_SHADER, A::SHADER_READ,
        ),
        (Undefined, DepthStencilAttachment) => BarrierScope::new(fragment_tests, A::NONE, fragment_tests, depth_rw),
        (ShaderReadOnly, DepthStencilAttachment) => BarrierScope::new(S::FRAGMENT_SHADER, A::SHADER_READ, fragment_tests, depth_rw),
        (DepthStencilAttachment, ShaderReadOnly) => BarrierScope::new(
            S::LATE_FRAGMENT_TESTS, A::DEPTH_STENCIL_ATTACHMENT_WRITE,
            S::FRAGMENT_SHADER, A::SHADER_READ,
        ),
        (TransferDst, TransferSrc) => BarrierScope::new(S::TRANSFER, A::TRANSFER_WRITE, S::TRANSFER, A::TRANSFER_READ),
        (TransferSrc, ShaderReadOnly) => BarrierScope::new(S::TRANSFER, A::TRANSFER_READ, S::FRAGMENT_SHADER, A::SHADER_READ),
        (Undefined, ShaderReadOnly) => BarrierScope::new(S::NONE, A::NONE, S::FRAGMENT_SHADER, A::SHADER_READ),
        _ => BarrierScope::full(),
    }
}

// ===== SUBMISSION =====

/// One `VkSubmitInfo2`: command buffers plus semaphores to wait on and signal
#[derive(Debug, Clone, Default)]
pub struct SubmitBatch {
    pub command_buffers: Vec<vk::CommandBuffer>,
    pub wait_semaphores: Vec<vk::SemaphoreSubmitInfo<'static>>,
    pub signal_semaphores: Vec<vk::SemaphoreSubmitInfo<'static>>,
}

impl SubmitBatch {
    pub fn new(command_buffers: Vec<vk::CommandBuffer>) -> Self {
        Self { command_buffers, ..Default::default() }
    }

    pub fn wait(mut self, semaphore: vk::Semaphore, stage: vk::PipelineStageFlags2, value: u64) -> Self {
        self.wait_semaphores.push(semaphore_submit_info(semaphore, stage, value));
        self
    }

    pub fn signal(mut self, semaphore: vk::Semaphore, stage: vk::PipelineStageFlags2, value: u64) -> Self {
        self.signal_semaphores.push(semaphore_submit_info(semaphore, stage, value));
        self
    }
}

#[cfg(test)]
#[path = "vulkan_sync_tests.rs"]
mod tests;
