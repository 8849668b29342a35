/// TransferManager - deferred GPU uploads on the transfer queue
///
/// Recording closures are queued from any thread and replayed into one shared
/// command buffer by `submit_transfers`. Cleanup closures (staging buffer
/// release, ticket completion) run once the GPU has finished the batch.
///
/// Lock order: the submit lock (which owns the backend) is taken before the
/// queue lock, never after.

use ash::vk;
use ember_rhi::ember::{Error, Result};
use ember_rhi::{engine_debug, engine_error, engine_warn};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::vulkan_context::{native_error, GpuQueue};
use crate::vulkan_sync::{SubmitBatch, SyncManager};

const LOG_SOURCE: &str = "ember::vulkan::TransferManager";

/// Records transfer commands; may run again if its batch is resubmitted
pub type TransferFn = Box<dyn Fn(vk::CommandBuffer) + Send>;

/// Runs once after the batch that preceded it has completed
pub type CleanupFn = Box<dyn FnOnce() + Send>;

// ===== NATIVE SEAM =====

/// Native command buffer, fence and queue operations used by the transfer manager
pub trait TransferBackend: Send {
    /// Reset and begin the shared command buffer
    fn begin(&mut self) -> Result<vk::CommandBuffer>;
    fn end(&mut self, cmd: vk::CommandBuffer) -> Result<()>;
    /// Submit `cmd`, signaling the transfer fence
    fn submit(&mut self, cmd: vk::CommandBuffer) -> Result<()>;
    fn wait_fence(&mut self, timeout_ns: u64) -> Result<()>;
    fn reset_fence(&mut self) -> Result<()>;
    fn wait_queue_idle(&mut self) -> Result<()>;
    /// Replace the fence with a new one
    fn recreate_fence(&mut self, signaled: bool) -> Result<()>;
    /// Release native objects; called once from `TransferManager::shutdown`
    fn destroy(&mut self);
}

/// `TransferBackend` over the device's transfer queue
pub struct VulkanTransferBackend {
    device: ash::Device,
    sync: Arc<SyncManager>,
    queue: Arc<GpuQueue>,
    command_pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
    fence: vk::Fence,
}

impl VulkanTransferBackend {
    pub fn new(device: ash::Device, sync: Arc<SyncManager>, queue: Arc<GpuQueue>) -> Result<Self> {
        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue.family_index)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);
        let command_pool = unsafe { device.create_command_pool(&pool_info, None) }
            .map_err(|e| native_error("vkCreateCommandPool", e))?;

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let command_buffer = match unsafe { device.allocate_command_buffers(&alloc_info) } {
            Ok(buffers) => buffers[0],
            Err(e) => {
                unsafe { device.destroy_command_pool(command_pool, None) };
                return Err(native_error("vkAllocateCommandBuffers", e));
            }
        };

        let fence_info = vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED);
        let fence = match unsafe { device.create_fence(&fence_info, None) } {
            Ok(fence) => fence,
            Err(e) => {
                unsafe { device.destroy_command_pool(command_pool, None) };
                return Err(native_error("vkCreateFence", e));
            }
        };

        Ok(Self { device, sync, queue, command_pool, command_buffer, fence })
    }
}

impl TransferBackend for VulkanTransferBackend {
    fn begin(&mut self) -> Result<vk::CommandBuffer> {
        unsafe {
            self.device.reset_command_pool(self.command_pool, vk::CommandPoolResetFlags::empty())
                .map_err(|e| native_error("vkResetCommandPool", e))?;
            let begin_info = vk::CommandBufferBeginInfo::default()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            self.device.begin_command_buffer(self.command_buffer, &begin_info)
                .map_err(|e| native_error("vkBeginCommandBuffer", e))?;
        }
        Ok(self.command_buffer)
    }

    fn end(&mut self, cmd: vk::CommandBuffer) -> Result<()> {
        unsafe { self.device.end_command_buffer(cmd) }.map_err(|e| native_error("vkEndCommandBuffer", e))
    }

    fn submit(&mut self, cmd: vk::CommandBuffer) -> Result<()> {
        self.sync.queue_submit2(&self.queue, &[SubmitBatch::new(vec![cmd])], self.fence)
    }

    fn wait_fence(&mut self, timeout_ns: u64) -> Result<()> {
        match unsafe { self.device.wait_for_fences(&[self.fence], true, timeout_ns) } {
            Ok(()) => Ok(()),
            Err(vk::Result::TIMEOUT) => Err(Error::Timeout("transfer fence".to_string())),
            Err(e) => Err(native_error("vkWaitForFences", e)),
        }
    }

    fn reset_fence(&mut self) -> Result<()> {
        unsafe { self.device.reset_fences(&[self.fence]) }.map_err(|e| native_error("vkResetFences", e))
    }

    fn wait_queue_idle(&mut self) -> Result<()> {
        self.queue.wait_idle(&self.device)
    }

    fn recreate_fence(&mut self, signaled: bool) -> Result<()> {
        let flags = if signaled { vk::FenceCreateFlags::SIGNALED } else { vk::FenceCreateFlags::empty() };
        let fence = unsafe { self.device.create_fence(&vk::FenceCreateInfo::default().flags(flags), None) }
            .map_err(|e| native_error("vkCreateFence", e))?;
        unsafe { self.device.destroy_fence(self.fence, None) };
        self.fence = fence;
        Ok(())
    }

    fn destroy(&mut self) {
        unsafe {
            self.device.destroy_fence(self.fence, None);
            // Frees the command buffer too
            self.device.destroy_command_pool(self.command_pool, None);
        }
        self.fence = vk::Fence::null();
        self.command_pool = vk::CommandPool::null();
    }
}

// ===== UPLOAD TICKETS =====

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    Uploading,
    Ready,
    Failed,
}

const UPLOADING: u8 = 0;
const READY: u8 = 1;
const FAILED: u8 = 2;

/// Shared completion state of one queued upload
#[derive(Debug, Clone)]
pub struct UploadTicket {
    state: Arc<AtomicU8>,
}

impl UploadTicket {
    fn new() -> Self {
        Self { state: Arc::new(AtomicU8::new(UPLOADING)) }
    }

    pub fn state(&self) -> UploadState {
        match self.state.load(Ordering::Acquire) {
            UPLOADING => UploadState::Uploading,
            READY => UploadState::Ready,
            _ => UploadState::Failed,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state() == UploadState::Ready
    }

    fn transition(&self, to: u8) -> bool {
        self.state.compare_exchange(UPLOADING, to, Ordering::AcqRel, Ordering::Acquire).is_ok()
    }

    /// Uploading -> Failed. Returns false if the upload already finished either way.
    pub fn mark_failed(&self) -> bool {
        self.transition(FAILED)
    }

    fn mark_ready(&self) -> bool {
        self.transition(READY)
    }
}

// ===== TRANSFER MANAGER =====

/// Work waiting for the next batch
///
/// Transfers and cleanups share one lock, so a cleanup is never taken into a
/// batch that precedes the transfer it was queued with.
#[derive(Default)]
struct Queued {
    transfers: Vec<TransferFn>,
    cleanups: Vec<CleanupFn>,
    /// Tickets of the uploads in `transfers`
    tickets: Vec<UploadTicket>,
}

/// Backend plus the cleanups of a submitted batch not yet seen complete
struct Submitter {
    backend: Box<dyn TransferBackend>,
    in_flight: Vec<CleanupFn>,
    in_flight_tickets: Vec<UploadTicket>,
}

impl Submitter {
    /// Wait for a batch whose earlier completion wait failed, then release its resources
    fn settle(&mut self, timeout_ns: u64) -> Result<()> {
        if self.in_flight.is_empty() {
            return Ok(());
        }
        self.backend.wait_fence(timeout_ns)?;
        self.in_flight_tickets.clear();
        for cleanup in std::mem::take(&mut self.in_flight) {
            cleanup();
        }
        Ok(())
    }
}

pub struct TransferManager {
    queued: Mutex<Queued>,
    /// Also the submit lock
    submitter: Mutex<Submitter>,
    timeout_ns: u64,
    shut_down: AtomicBool,
}

impl TransferManager {
    pub fn new(backend: Box<dyn TransferBackend>, timeout_ns: u64) -> Self {
        Self {
            queued: Mutex::new(Queued::default()),
            submitter: Mutex::new(Submitter { backend, in_flight: Vec::new(), in_flight_tickets: Vec::new() }),
            timeout_ns,
            shut_down: AtomicBool::new(false),
        }
    }

    fn lock_submitter(&self) -> Result<MutexGuard<'_, Submitter>> {
        self.submitter.lock().map_err(|_| Error::BackendError("transfer submit lock poisoned".to_string()))
    }

    fn lock_queued(&self) -> Result<MutexGuard<'_, Queued>> {
        self.queued.lock().map_err(|_| Error::BackendError("transfer queue lock poisoned".to_string()))
    }

    /// Queue a recording closure for the next `submit_transfers`
    pub fn queue_transfer<F>(&self, record: F)
    where
        F: Fn(vk::CommandBuffer) + Send + 'static,
    {
        if self.shut_down.load(Ordering::Acquire) {
            engine_warn!(LOG_SOURCE, "Transfer queued after shutdown; dropped");
            return;
        }
        match self.lock_queued() {
            Ok(mut queued) => queued.transfers.push(Box::new(record)),
            Err(e) => engine_error!(LOG_SOURCE, "Dropping transfer: {}", e),
        }
    }

    /// Run `cleanup` after the batch holding every transfer queued so far has completed
    pub fn register_cleanup_callback<F>(&self, cleanup: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.shut_down.load(Ordering::Acquire) {
            // Nothing left to wait for
            cleanup();
            return;
        }
        match self.lock_queued() {
            Ok(mut queued) => queued.cleanups.push(Box::new(cleanup)),
            Err(e) => engine_error!(LOG_SOURCE, "Dropping cleanup callback: {}", e),
        }
    }

    /// Queue a recording closure and its cleanup; the ticket turns Ready after the cleanup ran
    ///
    /// Both land in the same batch. If the batch is dropped unsubmitted the ticket turns Failed.
    pub fn queue_upload<R, C>(&self, record: R, cleanup: C) -> UploadTicket
    where
        R: Fn(vk::CommandBuffer) + Send + 'static,
        C: FnOnce() + Send + 'static,
    {
        let ticket = UploadTicket::new();
        if self.shut_down.load(Ordering::Acquire) {
            engine_warn!(LOG_SOURCE, "Upload queued after shutdown; dropped");
            ticket.mark_failed();
            cleanup();
            return ticket;
        }

        let done = ticket.clone();
        let cleanup: CleanupFn = Box::new(move || {
            cleanup();
            done.mark_ready();
        });
        match self.lock_queued() {
            Ok(mut queued) => {
                queued.transfers.push(Box::new(record));
                queued.cleanups.push(cleanup);
                queued.tickets.push(ticket.clone());
            }
            Err(e) => {
                engine_error!(LOG_SOURCE, "Dropping upload: {}", e);
                ticket.mark_failed();
                cleanup();
            }
        }
        ticket
    }

    pub fn pending_count(&self) -> usize {
        self.lock_queued().map(|q| q.transfers.len()).unwrap_or(0)
    }

    pub fn pending_cleanup_count(&self) -> usize {
        self.lock_queued().map(|q| q.cleanups.len()).unwrap_or(0)
    }

    /// Cleanups of a submitted batch whose completion has not been observed yet
    pub fn in_flight_cleanup_count(&self) -> usize {
        self.lock_submitter().map(|s| s.in_flight.len()).unwrap_or(0)
    }

    /// Put a failed batch back in front of anything queued since
    fn requeue(&self, batch: Queued) -> Result<()> {
        let mut queued = self.lock_queued()?;
        let newer = std::mem::replace(&mut *queued, batch);
        queued.transfers.extend(newer.transfers);
        queued.cleanups.extend(newer.cleanups);
        queued.tickets.extend(newer.tickets);
        Ok(())
    }

    /// Record every queued closure into one command buffer, submit it and wait
    ///
    /// Cleanups run after the fence signals. On a failed submission the batch is
    /// put back at the front of the queue and `SubmissionFailed` is returned.
    /// If the completion wait fails, the batch's cleanups are kept until a later
    /// wait on the same fence succeeds.
    pub fn submit_transfers(&self) -> Result<()> {
        let mut submitter = self.lock_submitter()?;
        submitter.settle(self.timeout_ns)?;

        let batch = std::mem::take(&mut *self.lock_queued()?);
        if batch.transfers.is_empty() {
            // The previous batch was waited on before its submit lock was released
            for cleanup in batch.cleanups {
                cleanup();
            }
            return Ok(());
        }

        let count = batch.transfers.len();
        let backend = &mut submitter.backend;
        let recorded = backend.wait_fence(self.timeout_ns).and_then(|()| {
            let cmd = backend.begin()?;
            for record in &batch.transfers {
                record(cmd);
            }
            backend.end(cmd)?;
            backend.reset_fence()?;
            Ok(cmd)
        });
        let cmd = match recorded {
            Ok(cmd) => cmd,
            Err(e) => {
                engine_error!(LOG_SOURCE, "Recording {} transfers failed: {}", count, e);
                self.requeue(batch)?;
                return Err(e);
            }
        };

        if let Err(e) = backend.submit(cmd) {
            engine_error!(LOG_SOURCE, "Submitting {} transfers failed: {}", count, e);
            if e == Error::DeviceLost {
                for ticket in &batch.tickets {
                    ticket.mark_failed();
                }
                return Err(e);
            }
            if let Err(idle) = backend.wait_queue_idle() {
                engine_warn!(LOG_SOURCE, "Queue idle after failed submit: {}", idle);
            }
            if let Err(fence) = backend.recreate_fence(true) {
                engine_error!(LOG_SOURCE, "Transfer fence could not be recreated: {}", fence);
                return Err(Error::DeviceLost);
            }
            self.requeue(batch)?;
            return Err(Error::SubmissionFailed(format!("{} transfers re-queued: {}", count, e)));
        }

        let Queued { transfers, cleanups, tickets } = batch;
        drop(transfers);
        if let Err(e) = backend.wait_fence(self.timeout_ns) {
            engine_error!(LOG_SOURCE, "Waiting for {} transfers failed: {}; cleanups deferred", count, e);
            submitter.in_flight = cleanups;
            submitter.in_flight_tickets = tickets;
            return Err(e);
        }
        for cleanup in cleanups {
            cleanup();
        }
        engine_debug!(LOG_SOURCE, "Flushed {} transfers", count);
        Ok(())
    }

    /// Begin a one-shot command buffer that is submitted and waited on
    ///
    /// The returned guard holds the submit lock until it is submitted or dropped.
    pub fn immediate_command(&self) -> Result<ImmediateCommand<'_>> {
        let mut submitter = self.lock_submitter()?;
        submitter.settle(self.timeout_ns)?;
        submitter.backend.wait_fence(self.timeout_ns)?;
        let cmd = submitter.backend.begin()?;
        Ok(ImmediateCommand { submitter, cmd, timeout_ns: self.timeout_ns, submitted: false })
    }

    /// Record with `record`, submit and block until the GPU is done
    pub fn submit_immediate<F>(&self, record: F) -> Result<()>
    where
        F: FnOnce(vk::CommandBuffer),
    {
        let command = self.immediate_command()?;
        record(command.command_buffer());
        command.submit()
    }

    /// Flush what can be flushed, drop the rest and release native objects
    ///
    /// Uploads that never reached the GPU end Failed. Staging resources of a
    /// batch still in flight are released only after the queue is idle.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.submit_transfers() {
            engine_warn!(LOG_SOURCE, "Final transfer flush failed: {}", e);
        }

        let dropped = self.lock_queued().map(|mut q| std::mem::take(&mut *q)).unwrap_or_default();
        if !dropped.transfers.is_empty() {
            engine_warn!(LOG_SOURCE, "Dropped {} unsubmitted transfers at shutdown", dropped.transfers.len());
        }
        for ticket in &dropped.tickets {
            ticket.mark_failed();
        }

        if let Ok(mut submitter) = self.lock_submitter() {
            if submitter.settle(self.timeout_ns).is_err() {
                if let Err(e) = submitter.backend.wait_queue_idle() {
                    engine_warn!(LOG_SOURCE, "Transfer queue not idle at shutdown: {}", e);
                    for ticket in &submitter.in_flight_tickets {
                        ticket.mark_failed();
                    }
                }
                submitter.in_flight_tickets.clear();
                for cleanup in std::mem::take(&mut submitter.in_flight) {
                    cleanup();
                }
            }
            submitter.backend.destroy();
        }
        // Unsubmitted transfers never touched their staging resources
        for cleanup in dropped.cleanups {
            cleanup();
        }
    }
}

/// One-shot command buffer holding the transfer submit lock
pub struct ImmediateCommand<'a> {
    submitter: MutexGuard<'a, Submitter>,
    cmd: vk::CommandBuffer,
    timeout_ns: u64,
    submitted: bool,
}

impl ImmediateCommand<'_> {
    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.cmd
    }

    /// End, submit and wait for completion
    pub fn submit(mut self) -> Result<()> {
        self.submitted = true;
        let timeout_ns = self.timeout_ns;
        let cmd = self.cmd;
        let backend = &mut self.submitter.backend;
        backend.end(cmd)?;
        backend.reset_fence()?;
        if let Err(e) = backend.submit(cmd) {
            if e != Error::DeviceLost && backend.recreate_fence(true).is_err() {
                return Err(Error::DeviceLost);
            }
            return Err(e);
        }
        backend.wait_fence(timeout_ns)
    }
}

impl Drop for ImmediateCommand<'_> {
    fn drop(&mut self) {
        if !self.submitted {
            // The next begin resets the pool
            engine_debug!(LOG_SOURCE, "Immediate command discarded without submit");
        }
    }
}

#[cfg(test)]
#[path = "vulkan_transfer_tests.rs"]
mod tests;
