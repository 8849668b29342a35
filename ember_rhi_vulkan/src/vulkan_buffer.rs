/// Buffer - Vulkan implementation of the Buffer trait

use ember_rhi::ember::{Error, Result};
use ember_rhi::ember::render::{Buffer as RhiBuffer, BufferDesc, BufferUsage, MemoryType};
use ember_rhi::{engine_err, engine_warn};
use ash::vk;
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use crate::vulkan_context::GpuContext;
use crate::vulkan_format::{buffer_usage_dst_scope, buffer_usage_to_vk};
use crate::vulkan_memory::MemoryAllocation;
use crate::vulkan_sync::{create_buffer_memory_barrier, BarrierScope};
use crate::vulkan_transfer::{UploadState, UploadTicket};

const LOG_SOURCE: &str = "ember::vulkan::Buffer";

/// Vulkan buffer implementation
pub struct Buffer {
    ctx: Arc<GpuContext>,
    pub(crate) buffer: vk::Buffer,
    allocation: Option<MemoryAllocation>,
    size: u64,
    usage: BufferUsage,
    memory_type: MemoryType,
    mapped: AtomicBool,
    /// Set by `create_and_upload`
    upload: OnceLock<UploadTicket>,
}

impl Buffer {
    /// Create a buffer and bind it to memory from the memory manager
    ///
    /// `extra_usage` is OR-ed into the usage derived from `desc` (e.g. TRANSFER_DST for uploads).
    pub(crate) fn create(ctx: &Arc<GpuContext>, desc: &BufferDesc, extra_usage: vk::BufferUsageFlags) -> Result<Self> {
        if desc.size == 0 {
            return Err(Error::InvalidResource(format!("buffer '{}' has zero size", desc.debug_name)));
        }

        let create_info = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(buffer_usage_to_vk(desc.usage) | extra_usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { ctx.device.create_buffer(&create_info, None) }
            .map_err(|e| engine_err!(LOG_SOURCE, "Failed to create buffer of size {} bytes: {:?}", desc.size, e))?;

        let requirements = unsafe { ctx.device.get_buffer_memory_requirements(buffer) };
        let allocation = match ctx.memory.allocate_for_requirements(requirements, desc.memory_type, &desc.debug_name) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { ctx.device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        if let Err(e) = unsafe { ctx.device.bind_buffer_memory(buffer, allocation.memory(), allocation.offset()) } {
            unsafe { ctx.device.destroy_buffer(buffer, None) };
            let _ = ctx.memory.deallocate(allocation);
            return Err(engine_err!(LOG_SOURCE, "Failed to bind buffer memory: {:?}", e));
        }

        ctx.set_debug_name(buffer, &desc.debug_name);
        Ok(Self {
            ctx: Arc::clone(ctx),
            buffer,
            allocation: Some(allocation),
            size: desc.size,
            usage: desc.usage,
            memory_type: desc.memory_type,
            mapped: AtomicBool::new(false),
            upload: OnceLock::new(),
        })
    }

    /// State of the initial upload; `None` for buffers created without data
    pub fn upload_state(&self) -> Option<UploadState> {
        self.upload.get().map(UploadTicket::state)
    }

    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    /// Downcast an RHI buffer created by this backend
    pub(crate) fn from_rhi(buffer: &dyn RhiBuffer) -> Result<&Buffer> {
        buffer.as_any().downcast_ref::<Buffer>()
            .ok_or_else(|| Error::InvalidResource("buffer was not created by the Vulkan backend".to_string()))
    }

    fn allocation(&self) -> Result<&MemoryAllocation> {
        self.allocation.as_ref().ok_or_else(|| Error::InvalidResource("buffer has no memory".to_string()))
    }

    /// Flush a write to non-coherent (HostCached) memory
    fn flush(&self, allocation: &MemoryAllocation, offset: u64) -> Result<()> {
        if self.memory_type != MemoryType::HostCached {
            return Ok(());
        }
        let atom = self.ctx.limits.non_coherent_atom_size.max(1);
        let start = (allocation.offset() + offset) / atom * atom;
        let range = vk::MappedMemoryRange::default()
            .memory(allocation.memory())
            .offset(start)
            .size(vk::WHOLE_SIZE);
        unsafe { self.ctx.device.flush_mapped_memory_ranges(&[range]) }
            .map_err(|e| engine_err!(LOG_SOURCE, "Failed to flush mapped buffer range: {:?}", e))
    }
}

impl RhiBuffer for Buffer {
    fn size(&self) -> u64 {
        self.size
    }

    fn usage(&self) -> BufferUsage {
        self.usage
    }

    fn memory_type(&self) -> MemoryType {
        self.memory_type
    }

    fn map(&self) -> Result<*mut u8> {
        let allocation = self.allocation()?;
        let ptr = self.ctx.memory.map(allocation)?;
        self.mapped.store(true, Ordering::Release);
        Ok(ptr)
    }

    fn unmap(&self) {
        if let Some(allocation) = &self.allocation {
            self.ctx.memory.unmap(allocation);
        }
        self.mapped.store(false, Ordering::Release);
    }

    fn is_mapped(&self) -> bool {
        self.mapped.load(Ordering::Acquire)
    }

    fn update(&self, offset: u64, data: &[u8]) -> Result<()> {
        let end = offset.checked_add(data.len() as u64);
        if end.map_or(true, |end| end > self.size) {
            return Err(Error::InvalidResource(format!(
                "buffer update of {} bytes at offset {} exceeds size {}",
                data.len(), offset, self.size
            )));
        }
        let allocation = self.allocation()?;
        let base = self.ctx.memory.map(allocation)?;
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), base.add(offset as usize), data.len());
        }
        self.flush(allocation, offset)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        unsafe { self.ctx.device.destroy_buffer(self.buffer, None) };
        if let Some(allocation) = self.allocation.take() {
            if let Err(e) = self.ctx.memory.deallocate(allocation) {
                engine_warn!(LOG_SOURCE, "Buffer memory not returned: {}", e);
            }
        }
    }
}

/// Create a device-local buffer and queue a staged copy of `data` into it
///
/// The copy is followed by a barrier toward the stages implied by `desc.usage`.
/// The staging buffer and a keep-alive reference to the destination are
/// released by the cleanup once the transfer has completed.
pub(crate) fn create_and_upload(ctx: &Arc<GpuContext>, desc: &BufferDesc, data: &[u8]) -> Result<Arc<Buffer>> {
    if data.is_empty() || data.len() as u64 > desc.size {
        return Err(Error::InvalidResource(format!(
            "upload of {} bytes into buffer '{}' of {} bytes",
            data.len(), desc.debug_name, desc.size
        )));
    }

    let device_desc = desc.clone().with_memory_type(MemoryType::DeviceLocal);
    let buffer = Arc::new(Buffer::create(ctx, &device_desc, vk::BufferUsageFlags::TRANSFER_DST)?);

    let staging_desc = BufferDesc::new(data.len() as u64, BufferUsage::TRANSFER_SRC)
        .with_memory_type(MemoryType::HostVisible)
        .with_name(&format!("{} (staging)", desc.debug_name));
    let staging = Arc::new(Buffer::create(ctx, &staging_desc, vk::BufferUsageFlags::empty())?);
    staging.update(0, data)?;

    let (dst_stage, dst_access) = buffer_usage_dst_scope(desc.usage);
    let scope = BarrierScope::new(
        vk::PipelineStageFlags2::TRANSFER,
        vk::AccessFlags2::TRANSFER_WRITE,
        dst_stage,
        dst_access,
    );
    let size = data.len() as u64;
    let (src, dst) = (staging.buffer, buffer.buffer);
    let device = ctx.device.clone();
    let sync = Arc::clone(&ctx.sync);

    let keep_alive = Arc::clone(&buffer);
    let ticket = ctx.transfer.queue_upload(
        move |cmd| unsafe {
            let region = vk::BufferCopy { src_offset: 0, dst_offset: 0, size };
            device.cmd_copy_buffer(cmd, src, dst, &[region]);
            sync.pipeline_barrier(cmd, &[], &[create_buffer_memory_barrier(scope, dst, 0, size)], &[]);
        },
        move || {
            drop(staging);
            drop(keep_alive);
        },
    );
    let _ = buffer.upload.set(ticket);

    Ok(buffer)
}
