use super::*;
use crate::graphics_device::mock_graphics_device::MockBuffer;

// ============================================================================
// BufferUsage / MemoryType
// ============================================================================

#[test]
fn test_buffer_usage_combinations() {
    let usage = BufferUsage::VERTEX | BufferUsage::TRANSFER_DST;
    assert!(usage.contains(BufferUsage::VERTEX));
    assert!(usage.contains(BufferUsage::TRANSFER_DST));
    assert!(!usage.contains(BufferUsage::INDEX));
    assert_eq!(BufferUsage::default(), BufferUsage::empty());
}

#[test]
fn test_memory_type_host_visibility() {
    assert!(!MemoryType::DeviceLocal.is_host_visible());
    assert!(MemoryType::HostVisible.is_host_visible());
    assert!(MemoryType::HostCached.is_host_visible());
    assert_eq!(MemoryType::default(), MemoryType::DeviceLocal);
}

// ============================================================================
// BufferDesc
// ============================================================================

#[test]
fn test_buffer_desc_builder() {
    let desc = BufferDesc::new(256, BufferUsage::UNIFORM)
        .with_memory_type(MemoryType::HostVisible)
        .with_name("camera_ubo");

    assert_eq!(desc.size, 256);
    assert_eq!(desc.usage, BufferUsage::UNIFORM);
    assert_eq!(desc.memory_type, MemoryType::HostVisible);
    assert_eq!(desc.debug_name, "camera_ubo");
}

// ============================================================================
// BufferFormat
// ============================================================================

#[test]
fn test_buffer_format_sizes() {
    assert_eq!(BufferFormat::R32_SFLOAT.size_bytes(), 4);
    assert_eq!(BufferFormat::R32G32_SFLOAT.size_bytes(), 8);
    assert_eq!(BufferFormat::R32G32B32_SFLOAT.size_bytes(), 12);
    assert_eq!(BufferFormat::R32G32B32A32_SFLOAT.size_bytes(), 16);
    assert_eq!(BufferFormat::R8G8B8A8_UNORM.size_bytes(), 4);
    assert_eq!(BufferFormat::R16G16B16A16_SFLOAT.size_bytes(), 8);
}

// ============================================================================
// update_typed
// ============================================================================

#[test]
fn test_update_typed_writes_pod_bytes() {
    let buffer = MockBuffer::new(BufferDesc::new(16, BufferUsage::UNIFORM).with_memory_type(MemoryType::HostVisible));
    update_typed(&buffer, 4, &[1.0f32, 2.0f32]).unwrap();

    let bytes = buffer.contents();
    assert_eq!(&bytes[4..8], &1.0f32.to_ne_bytes());
    assert_eq!(&bytes[8..12], &2.0f32.to_ne_bytes());
}

#[test]
fn test_map_is_idempotent_on_mock() {
    let buffer = MockBuffer::new(BufferDesc::new(64, BufferUsage::UNIFORM).with_memory_type(MemoryType::HostVisible));
    let first = buffer.map().unwrap();
    let second = buffer.map().unwrap();
    assert_eq!(first, second);
    assert!(buffer.is_mapped());
    buffer.unmap();
    assert!(!buffer.is_mapped());
}

#[test]
fn test_map_device_local_fails() {
    let buffer = MockBuffer::new(BufferDesc::new(64, BufferUsage::VERTEX));
    assert!(buffer.map().is_err());
    assert!(buffer.update(0, &[1, 2, 3]).is_err());
}
