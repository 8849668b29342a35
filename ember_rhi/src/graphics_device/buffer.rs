/// Buffer trait, buffer descriptor and vertex data formats

use std::any::Any;
use bitflags::bitflags;
use crate::error::Result;

bitflags! {
    /// Buffer usage flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BufferUsage: u32 {
        /// Vertex buffer
        const VERTEX = 1 << 0;
        /// Index buffer
        const INDEX = 1 << 1;
        /// Uniform buffer
        const UNIFORM = 1 << 2;
        /// Storage buffer
        const STORAGE = 1 << 3;
        /// Source of copy operations (staging)
        const TRANSFER_SRC = 1 << 4;
        /// Destination of copy operations
        const TRANSFER_DST = 1 << 5;
        /// Indirect draw arguments
        const INDIRECT = 1 << 6;
    }
}

/// Memory class requested for a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MemoryType {
    /// GPU-only memory (fastest for the GPU, not mappable)
    #[default]
    DeviceLocal,
    /// CPU-writable, coherent memory (staging, per-frame uniforms)
    HostVisible,
    /// CPU-readable, cached memory (readback)
    HostCached,
}

impl MemoryType {
    /// All memory types, in pool creation order
    pub const ALL: [MemoryType; 3] = [MemoryType::DeviceLocal, MemoryType::HostVisible, MemoryType::HostCached];

    /// Returns true if the CPU can map this memory
    pub fn is_host_visible(&self) -> bool {
        !matches!(self, MemoryType::DeviceLocal)
    }
}

/// Descriptor for creating a buffer
#[derive(Debug, Clone, Default)]
pub struct BufferDesc {
    /// Size in bytes
    pub size: u64,
    /// Buffer usage
    pub usage: BufferUsage,
    /// Memory class backing the buffer
    pub memory_type: MemoryType,
    /// Name used in logs and leak reports
    pub debug_name: String,
}

impl BufferDesc {
    /// Descriptor with default memory type and no debug name
    pub fn new(size: u64, usage: BufferUsage) -> Self {
        Self { size, usage, ..Default::default() }
    }

    /// Builder-style memory type override
    pub fn with_memory_type(mut self, memory_type: MemoryType) -> Self {
        self.memory_type = memory_type;
        self
    }

    /// Builder-style debug name
    pub fn with_name(mut self, name: &str) -> Self {
        self.debug_name = name.to_string();
        self
    }
}

/// Buffer data format for vertex attributes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(non_camel_case_types)]
pub enum BufferFormat {
    R32_SFLOAT,
    R32G32_SFLOAT,
    R32G32B32_SFLOAT,
    R32G32B32A32_SFLOAT,
    R32_UINT,
    R32G32_UINT,
    R32G32B32A32_UINT,
    R32_SINT,
    R16G16_SFLOAT,
    R16G16B16A16_SFLOAT,
    R8G8B8A8_UNORM,
    R8G8B8A8_UINT,
}

impl BufferFormat {
    /// Size in bytes of one element
    pub fn size_bytes(&self) -> u32 {
        match self {
            BufferFormat::R32_SFLOAT | BufferFormat::R32_UINT | BufferFormat::R32_SINT => 4,
            BufferFormat::R16G16_SFLOAT | BufferFormat::R8G8B8A8_UNORM | BufferFormat::R8G8B8A8_UINT => 4,
            BufferFormat::R32G32_SFLOAT | BufferFormat::R32G32_UINT => 8,
            BufferFormat::R16G16B16A16_SFLOAT => 8,
            BufferFormat::R32G32B32_SFLOAT => 12,
            BufferFormat::R32G32B32A32_SFLOAT | BufferFormat::R32G32B32A32_UINT => 16,
        }
    }
}

/// Buffer resource trait
///
/// Implemented by backend buffer types. The native buffer and its memory are
/// released when the last reference is dropped.
pub trait Buffer: Send + Sync {
    /// Size in bytes
    fn size(&self) -> u64;

    /// Usage flags the buffer was created with
    fn usage(&self) -> BufferUsage;

    /// Memory class backing the buffer
    fn memory_type(&self) -> MemoryType;

    /// Map the buffer for CPU access
    ///
    /// Idempotent: mapping an already mapped buffer returns the same pointer.
    /// Fails for device-local buffers.
    fn map(&self) -> Result<*mut u8>;

    /// Release the CPU mapping (the backing pool may stay persistently mapped)
    fn unmap(&self);

    /// Returns true between `map` and `unmap`
    fn is_mapped(&self) -> bool;

    /// Copy `data` into the buffer at `offset` (host-visible buffers only)
    fn update(&self, offset: u64, data: &[u8]) -> Result<()>;

    /// Downcast support for backends
    fn as_any(&self) -> &dyn Any;
}

/// Write a slice of plain-old-data values into a host-visible buffer
pub fn update_typed<T: bytemuck::Pod>(buffer: &dyn Buffer, offset: u64, data: &[T]) -> Result<()> {
    buffer.update(offset, bytemuck::cast_slice(data))
}

#[cfg(test)]
#[path = "buffer_tests.rs"]
mod tests;
