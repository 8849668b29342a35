//! Unit tests for the memory manager
//!
//! A fake backend hands out fake memory handles backed by host buffers, so no GPU is needed.

use super::*;
use ash::vk::Handle;
use std::sync::Arc;

// ============================================================================
// FAKE BACKEND
// ============================================================================

#[derive(Default)]
struct FakeState {
    next_handle: u64,
    /// (handle, type index, size) of every native allocation
    allocated: Vec<(u64, u32, u64)>,
    freed: Vec<u64>,
    host_memory: Vec<(u64, Box<[u8]>)>,
    fail_allocations: bool,
}

/// DeviceLocal lives in type indices 0 and 2, host-visible memory in 1
#[derive(Clone, Default)]
struct FakeBackend {
    state: Arc<Mutex<FakeState>>,
}

impl FakeBackend {
    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }
}

impl MemoryBackend for FakeBackend {
    fn find_memory_type_index(&self, memory_type: MemoryType, type_bits: u32) -> Option<u32> {
        let candidates: &[u32] = match memory_type {
            MemoryType::DeviceLocal => &[0, 2],
            MemoryType::HostVisible => &[1],
            MemoryType::HostCached => &[],
        };
        candidates.iter().copied().find(|i| type_bits & (1 << i) != 0)
    }

    fn allocate_memory(&self, size: u64, memory_type_index: u32) -> Result<vk::DeviceMemory> {
        let mut state = self.state();
        if state.fail_allocations {
            return Err(Error::OutOfMemory);
        }
        state.next_handle += 1;
        let handle = state.next_handle;
        state.allocated.push((handle, memory_type_index, size));
        Ok(vk::DeviceMemory::from_raw(handle))
    }

    fn map_memory(&self, memory: vk::DeviceMemory, size: u64) -> Result<*mut u8> {
        let mut state = self.state();
        let mut buffer = vec![0u8; size as usize].into_boxed_slice();
        let ptr = buffer.as_mut_ptr();
        state.host_memory.push((memory.as_raw(), buffer));
        Ok(ptr)
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        self.state().freed.push(memory.as_raw());
    }
}

fn small_config(strategy: AllocationStrategy) -> MemoryManagerConfig {
    MemoryManagerConfig {
        default_pool_size: 4096,
        max_pool_size: 16384,
        strategy,
        min_allocation_size: 16,
        alignment: 16,
        enable_leak_detection: true,
        enable_memory_tracking: true,
    }
}

fn manager(strategy: AllocationStrategy) -> (MemoryManager, FakeBackend) {
    let backend = FakeBackend::default();
    let manager = MemoryManager::initialize(Box::new(backend.clone()), small_config(strategy)).unwrap();
    (manager, backend)
}

/// Allocations 256 / 512 / 128 / 128 / 3072 fill the DeviceLocal pool;
/// freeing the 512 and the second 128 leaves holes at 256 (512 bytes) and 896 (128 bytes).
fn two_holes(manager: &MemoryManager) -> Vec<MemoryAllocation> {
    let sizes = [256, 512, 128, 128, 3072];
    let mut allocations: Vec<_> = sizes.iter()
        .map(|&s| manager.allocate(s, MemoryType::DeviceLocal, "filler").unwrap())
        .collect();
    assert_eq!(allocations.iter().map(|a| a.offset()).collect::<Vec<_>>(), vec![0, 256, 768, 896, 1024]);
    let d = allocations.remove(3);
    let b = allocations.remove(1);
    manager.deallocate(d).unwrap();
    manager.deallocate(b).unwrap();
    allocations
}

// ============================================================================
// INITIALIZATION
// ============================================================================

#[test]
fn test_initialize_creates_pool_per_supported_type() {
    let (manager, backend) = manager(AllocationStrategy::FreeList);
    let stats = manager.stats();
    // HostCached is not supported by the fake
    assert_eq!(stats.pool_count, 2);
    assert_eq!(stats.total_reserved, 8192);
    assert_eq!(stats.total_used, 0);
    // Only the host-visible pool is mapped
    assert_eq!(backend.state().host_memory.len(), 1);
}

#[test]
fn test_initialize_rejects_bad_config() {
    let mut config = small_config(AllocationStrategy::Linear);
    config.alignment = 24;
    assert!(matches!(
        MemoryManager::initialize(Box::new(FakeBackend::default()), config),
        Err(Error::InitializationFailed(_))
    ));

    let mut config = small_config(AllocationStrategy::Linear);
    config.max_pool_size = 1024;
    assert!(MemoryManager::initialize(Box::new(FakeBackend::default()), config).is_err());
}

#[test]
fn test_initialize_fails_when_native_allocation_fails() {
    let backend = FakeBackend::default();
    backend.state().fail_allocations = true;
    let result = MemoryManager::initialize(Box::new(backend), small_config(AllocationStrategy::Linear));
    assert!(matches!(result, Err(Error::InitializationFailed(_))));
}

// ============================================================================
// SIZE AND ALIGNMENT
// ============================================================================

#[test]
fn test_allocation_size_is_rounded() {
    let (manager, _backend) = manager(AllocationStrategy::FreeList);
    let tiny = manager.allocate(1, MemoryType::DeviceLocal, "tiny").unwrap();
    assert_eq!(tiny.size(), 16);
    let odd = manager.allocate(33, MemoryType::DeviceLocal, "odd").unwrap();
    assert_eq!(odd.size(), 48);
    assert_eq!(odd.offset(), 16);
    manager.check_consistency().unwrap();
}

#[test]
fn test_align_up_reports_overflow() {
    assert_eq!(align_up(0, 16), Some(0));
    assert_eq!(align_up(17, 16), Some(32));
    assert_eq!(align_up(u64::MAX - 4, 16), None);
}

#[test]
fn test_huge_request_fails_without_panicking() {
    for strategy in [
        AllocationStrategy::Linear,
        AllocationStrategy::FreeList,
        AllocationStrategy::Buddy,
        AllocationStrategy::Hybrid,
    ] {
        let (manager, _backend) = manager(strategy);
        let result = manager.allocate(u64::MAX - 4, MemoryType::DeviceLocal, "huge");
        assert!(matches!(result, Err(Error::AllocationFailed(_))), "{:?}", strategy);
        assert!(manager.last_error().unwrap().contains("huge"));
        manager.check_consistency().unwrap();
    }

    // Aligns fine but has no power-of-two reservation
    let (manager, _backend) = manager(AllocationStrategy::Buddy);
    assert!(matches!(manager.allocate((1 << 63) + 1, MemoryType::DeviceLocal, "buddy"), Err(Error::AllocationFailed(_))));
}

#[test]
fn test_fit_near_address_limit_is_rejected() {
    let mut pool = MemoryPool::new(vk::DeviceMemory::null(), MemoryType::DeviceLocal, 0, u64::MAX);
    pool.free_blocks = vec![FreeBlock { offset: u64::MAX - 8, size: 8 }];
    pool.used_size = u64::MAX - 8;
    assert_eq!(pool.allocate(16, 16, AllocationStrategy::FreeList), None);
    assert_eq!(pool.allocate(u64::MAX, 1, AllocationStrategy::Linear), None);
}

#[test]
fn test_zero_size_is_rejected() {
    let (manager, _backend) = manager(AllocationStrategy::FreeList);
    assert!(matches!(manager.allocate(0, MemoryType::DeviceLocal, "zero"), Err(Error::AllocationFailed(_))));
    assert!(manager.last_error().is_some());
}

#[test]
fn test_requirements_alignment_returns_padding() {
    let (manager, _backend) = manager(AllocationStrategy::FreeList);
    let _head = manager.allocate(16, MemoryType::DeviceLocal, "head").unwrap();

    let requirements = vk::MemoryRequirements { size: 100, alignment: 1024, memory_type_bits: u32::MAX };
    let aligned = manager.allocate_for_requirements(requirements, MemoryType::DeviceLocal, "aligned").unwrap();
    assert_eq!(aligned.offset(), 1024);
    assert_eq!(aligned.size(), 1024);

    // The padding [16, 1024) is still allocatable
    let filler = manager.allocate(512, MemoryType::DeviceLocal, "padding").unwrap();
    assert_eq!(filler.offset(), 16);
    manager.check_consistency().unwrap();
}

#[test]
fn test_requirements_type_bits_select_pool() {
    let (manager, backend) = manager(AllocationStrategy::FreeList);
    // Only type index 2 is allowed; the initial DeviceLocal pool uses index 0
    let requirements = vk::MemoryRequirements { size: 64, alignment: 16, memory_type_bits: 1 << 2 };
    let allocation = manager.allocate_for_requirements(requirements, MemoryType::DeviceLocal, "restricted").unwrap();

    assert_eq!(manager.stats().pool_count, 3);
    let state = backend.state();
    let (handle, type_index, _) = *state.allocated.last().unwrap();
    assert_eq!(type_index, 2);
    assert_eq!(allocation.memory().as_raw(), handle);
}

#[test]
fn test_requirements_with_unsupported_type_bits_fail() {
    let (manager, _backend) = manager(AllocationStrategy::FreeList);
    let requirements = vk::MemoryRequirements { size: 64, alignment: 16, memory_type_bits: 1 << 5 };
    assert!(matches!(
        manager.allocate_for_requirements(requirements, MemoryType::DeviceLocal, "nowhere"),
        Err(Error::AllocationFailed(_))
    ));
}

// ============================================================================
// STRATEGIES
// ============================================================================

#[test]
fn test_linear_takes_first_hole() {
    let (manager, _backend) = manager(AllocationStrategy::Linear);
    let _keep = two_holes(&manager);
    let a = manager.allocate(100, MemoryType::DeviceLocal, "a").unwrap();
    assert_eq!(a.offset(), 256);
}

#[test]
fn test_free_list_takes_smallest_hole() {
    let (manager, _backend) = manager(AllocationStrategy::FreeList);
    let _keep = two_holes(&manager);
    let a = manager.allocate(100, MemoryType::DeviceLocal, "a").unwrap();
    assert_eq!(a.offset(), 896);
    // Too big for the small hole
    let b = manager.allocate(200, MemoryType::DeviceLocal, "b").unwrap();
    assert_eq!(b.offset(), 256);
    manager.check_consistency().unwrap();
}

#[test]
fn test_free_list_tie_breaks_on_lowest_offset() {
    let mut pool = MemoryPool::new(vk::DeviceMemory::null(), MemoryType::DeviceLocal, 0, 1024);
    pool.free_blocks = vec![
        FreeBlock { offset: 100, size: 64 },
        FreeBlock { offset: 300, size: 64 },
        FreeBlock { offset: 600, size: 424 },
    ];
    pool.used_size = 1024 - 64 - 64 - 424;
    let (offset, _) = pool.allocate(32, 4, AllocationStrategy::FreeList).unwrap();
    assert_eq!(offset, 100);
    assert!(pool.is_consistent());
}

#[test]
fn test_hybrid_prefers_close_fit_then_falls_back_to_first_fit() {
    let (manager, _backend) = manager(AllocationStrategy::Hybrid);
    let _keep = two_holes(&manager);
    // 112 bytes: the 128-byte hole is a close fit
    let a = manager.allocate(100, MemoryType::DeviceLocal, "a").unwrap();
    assert_eq!(a.offset(), 896);
    // 208 bytes: no hole within 2x, first fit by offset
    let b = manager.allocate(200, MemoryType::DeviceLocal, "b").unwrap();
    assert_eq!(b.offset(), 256);
}

#[test]
fn test_buddy_splits_by_halving() {
    let mut pool = MemoryPool::new(vk::DeviceMemory::null(), MemoryType::DeviceLocal, 0, 1024);
    let (offset, reserved) = pool.allocate(100, 16, AllocationStrategy::Buddy).unwrap();
    assert_eq!((offset, reserved), (0, 128));
    assert_eq!(pool.free_blocks, vec![
        FreeBlock { offset: 128, size: 128 },
        FreeBlock { offset: 256, size: 256 },
        FreeBlock { offset: 512, size: 512 },
    ]);

    // Smallest buddy that holds 64 is the 128 one
    let (offset, reserved) = pool.allocate(60, 16, AllocationStrategy::Buddy).unwrap();
    assert_eq!((offset, reserved), (128, 64));
    assert!(pool.free_blocks.contains(&FreeBlock { offset: 192, size: 64 }));
    assert!(pool.is_consistent());

    pool.free(0, 128);
    pool.free(128, 64);
    assert_eq!(pool.free_blocks, vec![FreeBlock { offset: 0, size: 1024 }]);
}

#[test]
fn test_buddy_non_power_of_two_pool_keeps_tail_free() {
    let mut pool = MemoryPool::new(vk::DeviceMemory::null(), MemoryType::DeviceLocal, 0, 1000);
    let (offset, reserved) = pool.allocate(16, 16, AllocationStrategy::Buddy).unwrap();
    assert_eq!((offset, reserved), (0, 16));
    assert!(pool.free_blocks.contains(&FreeBlock { offset: 512, size: 488 }));
    assert!(pool.is_consistent());
}

#[test]
fn test_every_strategy_keeps_pool_partition() {
    for strategy in [
        AllocationStrategy::Linear,
        AllocationStrategy::FreeList,
        AllocationStrategy::Buddy,
        AllocationStrategy::Hybrid,
    ] {
        let (manager, _backend) = manager(strategy);
        let mut live: Vec<MemoryAllocation> = Vec::new();
        let mut seed: u64 = 0x2545F4914F6CDD1D;

        for step in 0..400 {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let roll = (seed >> 33) as usize;
            if roll % 3 == 0 && !live.is_empty() {
                let victim = live.swap_remove(roll % live.len());
                manager.deallocate(victim).unwrap();
            } else {
                let size = 1 + (roll % 700) as u64;
                live.push(manager.allocate(size, MemoryType::DeviceLocal, "churn").unwrap());
            }
            manager.check_consistency().unwrap_or_else(|e| panic!("{:?} step {}: {}", strategy, step, e));
        }

        // No two live allocations overlap within a pool
        for (i, a) in live.iter().enumerate() {
            for b in &live[i + 1..] {
                if a.memory() == b.memory() {
                    assert!(a.offset() + a.size() <= b.offset() || b.offset() + b.size() <= a.offset());
                }
            }
        }

        for allocation in live.drain(..) {
            manager.deallocate(allocation).unwrap();
        }
        assert_eq!(manager.stats().total_used, 0);
        assert_eq!(manager.stats().fragmentation, 0.0);
    }
}

// ============================================================================
// FREE AND COALESCE
// ============================================================================

#[test]
fn test_free_coalesces_neighbours() {
    let (manager, _backend) = manager(AllocationStrategy::Linear);
    let a = manager.allocate(1024, MemoryType::DeviceLocal, "a").unwrap();
    let b = manager.allocate(1024, MemoryType::DeviceLocal, "b").unwrap();
    let c = manager.allocate(1024, MemoryType::DeviceLocal, "c").unwrap();

    let device_local_blocks = |m: &MemoryManager| m.state.lock().unwrap().pools[0].free_blocks.clone();

    manager.deallocate(a).unwrap();
    manager.deallocate(c).unwrap();
    assert_eq!(device_local_blocks(&manager), vec![
        FreeBlock { offset: 0, size: 1024 },
        FreeBlock { offset: 2048, size: 2048 },
    ]);
    manager.deallocate(b).unwrap();
    assert_eq!(device_local_blocks(&manager), vec![FreeBlock { offset: 0, size: 4096 }]);
}

#[test]
fn test_two_allocations_then_free_restores_whole_pool() {
    let backend = FakeBackend::default();
    let config = MemoryManagerConfig { default_pool_size: 1024, ..small_config(AllocationStrategy::FreeList) };
    let manager = MemoryManager::initialize(Box::new(backend), config).unwrap();

    let first = manager.allocate(100, MemoryType::DeviceLocal, "first").unwrap();
    assert_eq!((first.offset(), first.size()), (0, 112));
    let second = manager.allocate(200, MemoryType::DeviceLocal, "second").unwrap();
    assert_eq!((second.offset(), second.size()), (112, 208));
    assert_eq!(first.memory(), second.memory());

    manager.deallocate(first).unwrap();
    manager.deallocate(second).unwrap();
    let blocks = manager.state.lock().unwrap().pools[0].free_blocks.clone();
    assert_eq!(blocks, vec![FreeBlock { offset: 0, size: 1024 }]);
    assert_eq!(manager.stats().total_used, 0);
}

#[test]
fn test_contiguous_blocks_coalesce_in_any_free_order() {
    let sizes = [64u64, 128, 32, 256];
    let mut orders = Vec::new();
    for a in 0..4 {
        for b in 0..4 {
            for c in 0..4 {
                for d in 0..4 {
                    let order = [a, b, c, d];
                    if (0..4).all(|i| order.contains(&i)) {
                        orders.push(order);
                    }
                }
            }
        }
    }
    assert_eq!(orders.len(), 24);

    for order in orders {
        let mut pool = MemoryPool::new(vk::DeviceMemory::null(), MemoryType::DeviceLocal, 0, 480);
        let ranges: Vec<(u64, u64)> = sizes.iter()
            .map(|&size| pool.allocate(size, 16, AllocationStrategy::Linear).unwrap())
            .collect();
        assert!(pool.free_blocks.is_empty());

        for &i in &order {
            let (offset, size) = ranges[i];
            pool.free(offset, size);
            assert!(pool.is_consistent(), "order {:?}", order);
        }
        assert_eq!(pool.free_blocks, vec![FreeBlock { offset: 0, size: 480 }], "order {:?}", order);
        assert_eq!(pool.used_size, 0);
    }
}

#[test]
fn test_coalesce_is_idempotent() {
    let mut pool = MemoryPool::new(vk::DeviceMemory::null(), MemoryType::DeviceLocal, 0, 300);
    pool.free_blocks = vec![
        FreeBlock { offset: 200, size: 100 },
        FreeBlock { offset: 0, size: 100 },
        FreeBlock { offset: 100, size: 50 },
    ];
    pool.used_size = 50;
    pool.coalesce();
    let once = pool.free_blocks.clone();
    pool.coalesce();
    assert_eq!(pool.free_blocks, once);
    assert_eq!(once, vec![FreeBlock { offset: 0, size: 150 }, FreeBlock { offset: 200, size: 100 }]);
    assert!(pool.is_consistent());
}

#[test]
fn test_deallocate_foreign_allocation_fails() {
    let (manager, _backend) = manager(AllocationStrategy::FreeList);
    let foreign = MemoryAllocation {
        id: 999,
        memory: vk::DeviceMemory::from_raw(0xdead),
        offset: 0,
        size: 16,
        memory_type: MemoryType::DeviceLocal,
        mapped: None,
    };
    assert!(matches!(manager.deallocate(foreign), Err(Error::InvalidResource(_))));
    assert!(manager.last_error().unwrap().contains("#999"));
}

// ============================================================================
// POOL GROWTH
// ============================================================================

#[test]
fn test_new_pool_when_full() {
    let (manager, _backend) = manager(AllocationStrategy::FreeList);
    let first = manager.allocate(4096, MemoryType::DeviceLocal, "fills pool").unwrap();
    let second = manager.allocate(16, MemoryType::DeviceLocal, "needs new pool").unwrap();
    assert_ne!(first.memory(), second.memory());
    assert_eq!(manager.stats().pool_count, 3);
}

#[test]
fn test_oversized_request_gets_dedicated_pool() {
    let (manager, backend) = manager(AllocationStrategy::FreeList);
    let big = manager.allocate(10000, MemoryType::DeviceLocal, "big").unwrap();
    assert_eq!(big.offset(), 0);
    assert_eq!(backend.state().allocated.last().unwrap().2, 10000);
}

#[test]
fn test_request_over_max_pool_size_fails() {
    let (manager, _backend) = manager(AllocationStrategy::FreeList);
    let result = manager.allocate(20000, MemoryType::DeviceLocal, "huge");
    assert!(matches!(result, Err(Error::AllocationFailed(_))));
    assert!(manager.last_error().unwrap().contains("max_pool_size"));
    assert_eq!(manager.stats().pool_count, 2);
}

#[test]
fn test_unsupported_memory_type_fails() {
    let (manager, _backend) = manager(AllocationStrategy::FreeList);
    assert!(matches!(
        manager.allocate(64, MemoryType::HostCached, "cached"),
        Err(Error::AllocationFailed(_))
    ));
}

// ============================================================================
// MAPPING
// ============================================================================

#[test]
fn test_host_visible_allocations_are_mapped_at_offset() {
    let (manager, backend) = manager(AllocationStrategy::Linear);
    let _first = manager.allocate(64, MemoryType::HostVisible, "first").unwrap();
    let second = manager.allocate(64, MemoryType::HostVisible, "second").unwrap();
    assert_eq!(second.offset(), 64);

    let ptr = manager.map(&second).unwrap();
    unsafe { *ptr = 0xAB };
    manager.unmap(&second);

    let state = backend.state();
    let (_, host) = &state.host_memory[0];
    assert_eq!(host[64], 0xAB);
}

#[test]
fn test_device_local_map_fails() {
    let (manager, _backend) = manager(AllocationStrategy::Linear);
    let allocation = manager.allocate(64, MemoryType::DeviceLocal, "gpu only").unwrap();
    assert!(allocation.mapped_ptr().is_none());
    assert!(matches!(manager.map(&allocation), Err(Error::InvalidOperation(_))));
}

// ============================================================================
// STATS, TRACKING AND SHUTDOWN
// ============================================================================

#[test]
fn test_stats_track_peak_and_count() {
    let (manager, _backend) = manager(AllocationStrategy::FreeList);
    let a = manager.allocate(1000, MemoryType::DeviceLocal, "a").unwrap();
    let b = manager.allocate(1000, MemoryType::HostVisible, "b").unwrap();
    assert_eq!(manager.stats().allocation_count, 2);
    assert_eq!(manager.stats().total_used, 2016);

    manager.deallocate(a).unwrap();
    manager.deallocate(b).unwrap();
    let stats = manager.stats();
    assert_eq!(stats.allocation_count, 0);
    assert_eq!(stats.total_used, 0);
    assert_eq!(stats.peak_used, 2016);
}

#[test]
fn test_fragmentation_reflects_split_free_space() {
    let (manager, _backend) = manager(AllocationStrategy::Linear);
    let _keep = two_holes(&manager);
    // Free space: 512 + 128 in the DeviceLocal pool, 4096 in the HostVisible pool
    let stats = manager.stats();
    assert_eq!(stats.largest_free_block, 4096);
    assert!(stats.fragmentation > 0.0 && stats.fragmentation < 1.0);
}

#[test]
fn test_live_allocations_keep_debug_names() {
    let (manager, _backend) = manager(AllocationStrategy::FreeList);
    let a = manager.allocate(64, MemoryType::DeviceLocal, "vertex buffer").unwrap();
    let _b = manager.allocate(64, MemoryType::DeviceLocal, "index buffer").unwrap();
    manager.deallocate(a).unwrap();

    let live = manager.live_allocations();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].1, "index buffer");
}

#[test]
fn test_shutdown_frees_every_pool_once() {
    let (manager, backend) = manager(AllocationStrategy::FreeList);
    let _leak = manager.allocate(64, MemoryType::DeviceLocal, "leaked").unwrap();
    manager.allocate(8000, MemoryType::DeviceLocal, "second pool").unwrap();

    manager.shutdown();
    manager.shutdown();
    assert_eq!(backend.state().freed.len(), 3);
    assert!(manager.live_allocations().is_empty());

    // Allocation after shutdown is refused
    assert!(manager.allocate(16, MemoryType::DeviceLocal, "late").is_err());
}

#[test]
fn test_drop_releases_pools() {
    let (manager, backend) = manager(AllocationStrategy::FreeList);
    drop(manager);
    let state = backend.state();
    let mut allocated: Vec<u64> = state.allocated.iter().map(|(h, _, _)| *h).collect();
    let mut freed = state.freed.clone();
    allocated.sort();
    freed.sort();
    assert_eq!(allocated, freed);
}
