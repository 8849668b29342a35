/// MemoryManager - pooled GPU memory sub-allocation
///
/// Each pool is one native `VkDeviceMemory` carved into allocations. Free space
/// is kept as a list of blocks sorted by offset; used ranges plus free blocks
/// always cover `[0, total_size)` exactly. Host-visible pools are mapped once
/// at creation and stay mapped until shutdown.

use ash::vk;
use ember_rhi::ember::{Error, Result};
use ember_rhi::ember::render::{AllocationStrategy, MemoryManagerConfig, MemoryStats, MemoryType};
use ember_rhi::{engine_debug, engine_error, engine_info, engine_warn};
use rustc_hash::FxHashMap;
use std::ptr::NonNull;
use std::sync::{Mutex, MutexGuard};

use crate::vulkan_context::native_error;
use crate::vulkan_format::memory_type_flags;

const LOG_SOURCE: &str = "ember::vulkan::MemoryManager";

// ===== NATIVE SEAM =====

/// Native memory operations used by the manager
pub trait MemoryBackend: Send {
    /// Index of a memory type with the properties of `memory_type`, restricted to `type_bits`
    fn find_memory_type_index(&self, memory_type: MemoryType, type_bits: u32) -> Option<u32>;

    fn allocate_memory(&self, size: u64, memory_type_index: u32) -> Result<vk::DeviceMemory>;

    /// Map the whole memory object
    fn map_memory(&self, memory: vk::DeviceMemory, size: u64) -> Result<*mut u8>;

    fn free_memory(&self, memory: vk::DeviceMemory);
}

/// `MemoryBackend` over a Vulkan logical device
pub struct VulkanMemoryBackend {
    device: ash::Device,
    properties: vk::PhysicalDeviceMemoryProperties,
}

impl VulkanMemoryBackend {
    pub fn new(device: ash::Device, properties: vk::PhysicalDeviceMemoryProperties) -> Self {
        Self { device, properties }
    }
}

impl MemoryBackend for VulkanMemoryBackend {
    fn find_memory_type_index(&self, memory_type: MemoryType, type_bits: u32) -> Option<u32> {
        let wanted = memory_type_flags(memory_type);
        (0..self.properties.memory_type_count).find(|&i| {
            type_bits & (1 << i) != 0
                && self.properties.memory_types[i as usize].property_flags.contains(wanted)
        })
    }

    fn allocate_memory(&self, size: u64, memory_type_index: u32) -> Result<vk::DeviceMemory> {
        let info = vk::MemoryAllocateInfo::default()
            .allocation_size(size)
            .memory_type_index(memory_type_index);
        unsafe { self.device.allocate_memory(&info, None) }.map_err(|e| native_error("vkAllocateMemory", e))
    }

    fn map_memory(&self, memory: vk::DeviceMemory, size: u64) -> Result<*mut u8> {
        unsafe { self.device.map_memory(memory, 0, size, vk::MemoryMapFlags::empty()) }
            .map(|ptr| ptr as *mut u8)
            .map_err(|e| native_error("vkMapMemory", e))
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        unsafe { self.device.free_memory(memory, None) };
    }
}

// ===== ALLOCATION =====

/// Persistent CPU mapping of a host-visible pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MappedPtr(NonNull<u8>);

// The pointer targets driver-owned memory that outlives every allocation made
// from it; access is coordinated by the owners of the allocations.
unsafe impl Send for MappedPtr {}
unsafe impl Sync for MappedPtr {}

impl MappedPtr {
    fn new(ptr: *mut u8) -> Option<Self> {
        NonNull::new(ptr).map(MappedPtr)
    }

    fn offset(self, offset: u64) -> Self {
        // In bounds: offset < pool size, which is the mapped length
        MappedPtr(unsafe { NonNull::new_unchecked(self.0.as_ptr().add(offset as usize)) })
    }

    pub(crate) fn as_ptr(self) -> *mut u8 {
        self.0.as_ptr()
    }
}

/// A sub-range `[offset, offset + size)` of one pool
///
/// Not `Clone`: it is handed back exactly once through `MemoryManager::deallocate`.
#[derive(Debug)]
pub struct MemoryAllocation {
    id: u64,
    memory: vk::DeviceMemory,
    offset: u64,
    size: u64,
    memory_type: MemoryType,
    mapped: Option<MappedPtr>,
}

impl MemoryAllocation {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Native memory object of the owning pool
    pub fn memory(&self) -> vk::DeviceMemory {
        self.memory
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Rounded size actually reserved
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn memory_type(&self) -> MemoryType {
        self.memory_type
    }

    /// CPU address of the first byte, for host-visible allocations
    pub fn mapped_ptr(&self) -> Option<*mut u8> {
        self.mapped.map(MappedPtr::as_ptr)
    }
}

// ===== POOL =====

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FreeBlock {
    pub offset: u64,
    pub size: u64,
}

impl FreeBlock {
    fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// `None` when the aligned value does not fit in a `u64`
pub(crate) fn align_up(value: u64, alignment: u64) -> Option<u64> {
    debug_assert!(alignment.is_power_of_two());
    Some(value.checked_add(alignment - 1)? & !(alignment - 1))
}

/// Reservation of one buddy allocation
fn buddy_size(size: u64, alignment: u64) -> Option<u64> {
    size.max(alignment).checked_next_power_of_two()
}

/// Free-block bookkeeping of one native memory object
pub(crate) struct MemoryPool {
    pub memory: vk::DeviceMemory,
    pub memory_type: MemoryType,
    pub memory_type_index: u32,
    pub total_size: u64,
    pub used_size: u64,
    pub free_blocks: Vec<FreeBlock>,
    mapped: Option<MappedPtr>,
}

impl MemoryPool {
    pub(crate) fn new(memory: vk::DeviceMemory, memory_type: MemoryType, memory_type_index: u32, total_size: u64) -> Self {
        Self {
            memory,
            memory_type,
            memory_type_index,
            total_size,
            used_size: 0,
            free_blocks: vec![FreeBlock { offset: 0, size: total_size }],
            mapped: None,
        }
    }

    /// Aligned start inside `block` if `size` fits there
    fn fit(block: &FreeBlock, size: u64, alignment: u64) -> Option<u64> {
        let start = align_up(block.offset, alignment)?;
        (start.checked_add(size)? <= block.end()).then_some(start)
    }

    /// Index of the block chosen by `strategy`, with the aligned start
    fn select(&self, size: u64, alignment: u64, strategy: AllocationStrategy) -> Option<(usize, u64)> {
        let fits = || {
            self.free_blocks.iter().enumerate()
                .filter_map(move |(i, b)| Self::fit(b, size, alignment).map(|start| (i, start)))
        };
        // Blocks are sorted by offset, so `min_by_key` on size keeps the lowest offset on ties
        let best_fit = || fits().min_by_key(|&(i, _)| self.free_blocks[i].size);

        match strategy {
            AllocationStrategy::Linear => fits().next(),
            AllocationStrategy::FreeList => best_fit(),
            AllocationStrategy::Hybrid => fits()
                .filter(|&(i, _)| self.free_blocks[i].size <= size.saturating_mul(2))
                .min_by_key(|&(i, _)| self.free_blocks[i].size)
                .or_else(|| fits().next()),
            AllocationStrategy::Buddy => {
                let need = buddy_size(size, alignment)?;
                self.free_blocks.iter().enumerate()
                    .filter_map(|(i, b)| Self::fit(b, need, need).map(|start| (i, start)))
                    .min_by_key(|&(i, _)| self.free_blocks[i].size)
            }
        }
    }

    pub(crate) fn can_allocate(&self, size: u64, alignment: u64, strategy: AllocationStrategy) -> bool {
        self.select(size, alignment, strategy).is_some()
    }

    fn insert_free(&mut self, offset: u64, size: u64) {
        if size == 0 {
            return;
        }
        let pos = self.free_blocks.partition_point(|b| b.offset < offset);
        self.free_blocks.insert(pos, FreeBlock { offset, size });
    }

    /// Carve `size` bytes; returns (offset, reserved size)
    pub(crate) fn allocate(&mut self, size: u64, alignment: u64, strategy: AllocationStrategy) -> Option<(u64, u64)> {
        let (index, start) = self.select(size, alignment, strategy)?;
        let block = self.free_blocks.remove(index);

        let reserved = if strategy == AllocationStrategy::Buddy {
            // `select` already found a fitting buddy block
            let need = buddy_size(size, alignment).unwrap_or(size);
            // Largest naturally aligned power-of-two block at `start`
            let mut span = need;
            while let Some(double) = span.checked_mul(2) {
                if start % double != 0 || start.checked_add(double).map_or(true, |end| end > block.end()) {
                    break;
                }
                span = double;
            }
            self.insert_free(block.offset, start - block.offset);
            self.insert_free(start + span, block.end() - (start + span));
            while span > need {
                span /= 2;
                self.insert_free(start + span, span);
            }
            need
        } else {
            self.insert_free(block.offset, start - block.offset);
            self.insert_free(start + size, block.end() - (start + size));
            size
        };

        self.used_size += reserved;
        Some((start, reserved))
    }

    /// Return a range and merge touching free blocks
    pub(crate) fn free(&mut self, offset: u64, size: u64) {
        self.used_size = self.used_size.saturating_sub(size);
        self.free_blocks.push(FreeBlock { offset, size });
        self.coalesce();
    }

    pub(crate) fn coalesce(&mut self) {
        self.free_blocks.sort_by_key(|b| b.offset);
        let mut merged: Vec<FreeBlock> = Vec::with_capacity(self.free_blocks.len());
        for block in self.free_blocks.drain(..) {
            match merged.last_mut() {
                Some(last) if last.end() == block.offset => last.size += block.size,
                _ => merged.push(block),
            }
        }
        self.free_blocks = merged;
    }

    pub(crate) fn free_size(&self) -> u64 {
        self.free_blocks.iter().map(|b| b.size).sum()
    }

    pub(crate) fn largest_free_block(&self) -> u64 {
        self.free_blocks.iter().map(|b| b.size).max().unwrap_or(0)
    }

    /// Free blocks are sorted, disjoint, in bounds, and with `used_size` they cover the pool
    pub(crate) fn is_consistent(&self) -> bool {
        let sorted_disjoint = self.free_blocks.windows(2).all(|w| w[0].end() <= w[1].offset);
        let in_bounds = self.free_blocks.iter().all(|b| b.size > 0 && b.end() <= self.total_size);
        sorted_disjoint && in_bounds && self.free_size() + self.used_size == self.total_size
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.used_size == 0
    }
}

// ===== MANAGER =====

struct TrackedAllocation {
    size: u64,
    memory_type: MemoryType,
    debug_name: String,
}

struct MemoryManagerState {
    backend: Box<dyn MemoryBackend>,
    config: MemoryManagerConfig,
    pools: Vec<MemoryPool>,
    next_id: u64,
    live: FxHashMap<u64, TrackedAllocation>,
    allocation_count: usize,
    peak_used: u64,
    last_error: Option<String>,
    shut_down: bool,
}

impl MemoryManagerState {
    fn fail(&mut self, message: String) -> Error {
        engine_error!(LOG_SOURCE, "{}", message);
        self.last_error = Some(message.clone());
        Error::AllocationFailed(message)
    }

    fn total_used(&self) -> u64 {
        self.pools.iter().map(|p| p.used_size).sum()
    }

    fn create_pool(&mut self, memory_type: MemoryType, type_bits: u32, size: u64) -> Result<usize> {
        if size > self.config.max_pool_size {
            return Err(self.fail(format!(
                "{:?} pool of {} bytes exceeds max_pool_size ({})",
                memory_type, size, self.config.max_pool_size
            )));
        }
        let Some(type_index) = self.backend.find_memory_type_index(memory_type, type_bits) else {
            return Err(self.fail(format!("no native memory type for {:?} (type bits {:#x})", memory_type, type_bits)));
        };

        let memory = match self.backend.allocate_memory(size, type_index) {
            Ok(memory) => memory,
            Err(e) => return Err(self.fail(format!("native allocation of {} bytes for {:?} failed: {}", size, memory_type, e))),
        };

        let mut pool = MemoryPool::new(memory, memory_type, type_index, size);
        if memory_type.is_host_visible() {
            match self.backend.map_memory(memory, size) {
                Ok(ptr) => pool.mapped = MappedPtr::new(ptr),
                Err(e) => {
                    self.backend.free_memory(memory);
                    return Err(self.fail(format!("mapping {:?} pool failed: {}", memory_type, e)));
                }
            }
        }

        engine_debug!(LOG_SOURCE, "Created {:?} pool #{} ({} bytes, type index {})",
            memory_type, self.pools.len(), size, type_index);
        self.pools.push(pool);
        Ok(self.pools.len() - 1)
    }

    fn allocate(&mut self, size: u64, alignment: u64, memory_type: MemoryType, type_bits: u32, debug_name: &str) -> Result<MemoryAllocation> {
        if self.shut_down {
            return Err(self.fail("allocation after shutdown".to_string()));
        }
        if size == 0 {
            return Err(self.fail(format!("zero-sized allocation '{}'", debug_name)));
        }

        let alignment = alignment.max(self.config.alignment);
        let strategy = self.config.strategy;
        let aligned = align_up(size.max(self.config.min_allocation_size), alignment)
            .filter(|&aligned| strategy != AllocationStrategy::Buddy || buddy_size(aligned, alignment).is_some());
        let Some(size) = aligned else {
            return Err(self.fail(format!("allocation '{}' of {} bytes overflows the address range", debug_name, size)));
        };

        let candidate = self.pools.iter().position(|p| {
            p.memory_type == memory_type
                && type_bits & (1 << p.memory_type_index) != 0
                && p.can_allocate(size, alignment, strategy)
        });

        let pool_index = match candidate {
            Some(index) => index,
            None => {
                let required = if strategy == AllocationStrategy::Buddy { buddy_size(size, alignment).unwrap_or(size) } else { size };
                let pool_size = required.max(self.config.default_pool_size);
                self.create_pool(memory_type, type_bits, pool_size)?
            }
        };

        let pool = &mut self.pools[pool_index];
        let Some((offset, reserved)) = pool.allocate(size, alignment, strategy) else {
            return Err(self.fail(format!("{} bytes for '{}' do not fit in a fresh {:?} pool", size, debug_name, memory_type)));
        };
        let memory = pool.memory;
        let mapped = pool.mapped.map(|base| base.offset(offset));

        let id = self.next_id;
        self.next_id += 1;
        self.allocation_count += 1;
        if self.config.enable_memory_tracking || self.config.enable_leak_detection {
            self.live.insert(id, TrackedAllocation { size: reserved, memory_type, debug_name: debug_name.to_string() });
        }
        self.peak_used = self.peak_used.max(self.total_used());

        Ok(MemoryAllocation { id, memory, offset, size: reserved, memory_type, mapped })
    }

    fn release_pools(&mut self) {
        for pool in self.pools.drain(..) {
            // Unmapped implicitly by vkFreeMemory
            self.backend.free_memory(pool.memory);
        }
    }
}

/// Pooled GPU memory allocator shared by every resource of a device
///
/// All state sits behind one mutex.
pub struct MemoryManager {
    state: Mutex<MemoryManagerState>,
}

impl MemoryManager {
    /// Validate `config` and create one pool per memory type the backend supports
    pub fn initialize(backend: Box<dyn MemoryBackend>, config: MemoryManagerConfig) -> Result<Self> {
        if config.default_pool_size == 0 || config.max_pool_size == 0 {
            return Err(Error::InitializationFailed("memory pool sizes must be non-zero".to_string()));
        }
        if config.max_pool_size < config.default_pool_size {
            return Err(Error::InitializationFailed(format!(
                "max_pool_size ({}) is smaller than default_pool_size ({})",
                config.max_pool_size, config.default_pool_size
            )));
        }
        if !config.alignment.is_power_of_two() {
            return Err(Error::InitializationFailed(format!("alignment {} is not a power of two", config.alignment)));
        }

        let mut state = MemoryManagerState {
            backend,
            config,
            pools: Vec::new(),
            next_id: 1,
            live: FxHashMap::default(),
            allocation_count: 0,
            peak_used: 0,
            last_error: None,
            shut_down: false,
        };

        for memory_type in MemoryType::ALL {
            if state.backend.find_memory_type_index(memory_type, u32::MAX).is_none() {
                engine_debug!(LOG_SOURCE, "{:?} memory not available on this device", memory_type);
                continue;
            }
            if let Err(e) = state.create_pool(memory_type, u32::MAX, state.config.default_pool_size) {
                state.release_pools();
                return Err(Error::InitializationFailed(format!("initial {:?} pool: {}", memory_type, e)));
            }
        }

        engine_info!(LOG_SOURCE, "Memory manager initialized ({:?}, {} pools of {} bytes)",
            state.config.strategy, state.pools.len(), state.config.default_pool_size);
        Ok(Self { state: Mutex::new(state) })
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryManagerState>> {
        self.state.lock().map_err(|_| {
            engine_error!(LOG_SOURCE, "memory manager lock poisoned");
            Error::BackendError("memory manager lock poisoned".to_string())
        })
    }

    /// Allocate `size` bytes of `memory_type` memory
    ///
    /// The size is rounded up to `min_allocation_size` and to the configured
    /// alignment. A new pool is created when no existing one can hold it.
    pub fn allocate(&self, size: u64, memory_type: MemoryType, debug_name: &str) -> Result<MemoryAllocation> {
        self.lock()?.allocate(size, 1, memory_type, u32::MAX, debug_name)
    }

    /// Allocate for a native resource, honoring its alignment and memory type bits
    pub fn allocate_for_requirements(
        &self,
        requirements: vk::MemoryRequirements,
        memory_type: MemoryType,
        debug_name: &str,
    ) -> Result<MemoryAllocation> {
        self.lock()?.allocate(
            requirements.size,
            requirements.alignment.max(1),
            memory_type,
            requirements.memory_type_bits,
            debug_name,
        )
    }

    /// Return an allocation to its pool
    pub fn deallocate(&self, allocation: MemoryAllocation) -> Result<()> {
        let mut state = self.lock()?;
        if state.shut_down {
            // Pools are gone; nothing to return the range to
            return Ok(());
        }
        let Some(pool) = state.pools.iter_mut().find(|p| p.memory == allocation.memory) else {
            let message = format!("allocation #{} does not belong to any pool", allocation.id);
            engine_error!(LOG_SOURCE, "{}", message);
            state.last_error = Some(message.clone());
            return Err(Error::InvalidResource(message));
        };
        pool.free(allocation.offset, allocation.size);
        state.live.remove(&allocation.id);
        state.allocation_count = state.allocation_count.saturating_sub(1);
        Ok(())
    }

    /// CPU pointer to the allocation (pools stay mapped, so this never maps)
    pub fn map(&self, allocation: &MemoryAllocation) -> Result<*mut u8> {
        allocation.mapped_ptr().ok_or_else(|| {
            Error::InvalidOperation(format!("{:?} allocation #{} is not host-visible", allocation.memory_type, allocation.id))
        })
    }

    /// No-op: host-visible pools remain persistently mapped
    pub fn unmap(&self, _allocation: &MemoryAllocation) {}

    pub fn stats(&self) -> MemoryStats {
        let Ok(state) = self.lock() else {
            return MemoryStats::default();
        };
        let total_free: u64 = state.pools.iter().map(MemoryPool::free_size).sum();
        let largest_per_pool: u64 = state.pools.iter().map(MemoryPool::largest_free_block).sum();
        let largest_free_block = state.pools.iter().map(MemoryPool::largest_free_block).max().unwrap_or(0);
        MemoryStats {
            pool_count: state.pools.len(),
            total_reserved: state.pools.iter().map(|p| p.total_size).sum(),
            total_used: state.total_used(),
            peak_used: state.peak_used,
            allocation_count: state.allocation_count,
            largest_free_block,
            // Share of free space outside each pool's largest block
            fragmentation: if total_free == 0 { 0.0 } else { 1.0 - largest_per_pool as f32 / total_free as f32 },
        }
    }

    /// Message of the most recent failure
    pub fn last_error(&self) -> Option<String> {
        self.lock().ok().and_then(|s| s.last_error.clone())
    }

    pub fn config(&self) -> MemoryManagerConfig {
        self.lock().map(|s| s.config.clone()).unwrap_or_default()
    }

    /// Debug names of live allocations, sorted by id
    pub fn live_allocations(&self) -> Vec<(u64, String, u64)> {
        let Ok(state) = self.lock() else {
            return Vec::new();
        };
        let mut live: Vec<_> = state.live.iter().map(|(id, t)| (*id, t.debug_name.clone(), t.size)).collect();
        live.sort_by_key(|(id, _, _)| *id);
        live
    }

    /// Verify the partition invariant of every pool
    pub fn check_consistency(&self) -> Result<()> {
        let state = self.lock()?;
        for (i, pool) in state.pools.iter().enumerate() {
            if !pool.is_consistent() {
                return Err(Error::BackendError(format!(
                    "pool #{} broken: used {} + free {} != total {}",
                    i, pool.used_size, pool.free_size(), pool.total_size
                )));
            }
        }
        Ok(())
    }

    /// Report leaks and free every pool. Safe to call more than once.
    pub fn shutdown(&self) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        if state.shut_down {
            return;
        }

        if state.config.enable_leak_detection && !state.live.is_empty() {
            let mut leaks: Vec<_> = state.live.iter().collect();
            leaks.sort_by_key(|(id, _)| **id);
            for (id, leak) in leaks {
                engine_warn!(LOG_SOURCE, "Leaked allocation #{} '{}' ({} bytes, {:?})",
                    id, leak.debug_name, leak.size, leak.memory_type);
            }
        }

        let pools = state.pools.len();
        let empty = state.pools.iter().filter(|p| p.is_empty()).count();
        state.release_pools();
        state.live.clear();
        state.shut_down = true;
        engine_info!(LOG_SOURCE, "Memory manager shut down ({} pools released, {} still in use)", pools, pools - empty);
    }
}

impl Drop for MemoryManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
#[path = "vulkan_memory_tests.rs"]
mod tests;
