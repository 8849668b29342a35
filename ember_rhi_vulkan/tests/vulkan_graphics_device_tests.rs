//! Integration tests for VulkanGraphicsDevice
//!
//! These tests drive the device through the GraphicsDevice trait on a real GPU.
//! All tests require a GPU and are marked with #[ignore].
//!
//! Run with: cargo test --test vulkan_graphics_device_tests -- --ignored

use std::sync::Arc;

use ember_rhi::ember::render::{
    update_typed, BufferDesc, BufferUsage, DescriptorBinding, DescriptorSetLayoutDesc, DescriptorType, ImageLayout,
    MemoryType, Rect2D, RenderingAttachment, SamplerDesc, ShaderStageFlags, TextureDesc, TextureFormat,
    TextureUsage,
};
use ember_rhi::ember::{FrameBegin, GraphicsDevice, GraphicsDeviceConfig};
use ember_rhi_vulkan::ember::{Buffer, FrameState, Semaphore, SemaphoreDesc, Texture, UploadState, VulkanGraphicsDevice};
use winit::event_loop::EventLoop;
use winit::window::Window;

/// Helper to create a hidden test window
#[allow(deprecated)]
fn create_test_window() -> (Arc<Window>, EventLoop<()>) {
    let event_loop = EventLoop::new().unwrap();
    let window_attrs = Window::default_attributes()
        .with_title("Ember Vulkan Test")
        .with_inner_size(winit::dpi::PhysicalSize::new(800, 600))
        .with_visible(false);
    let window = event_loop.create_window(window_attrs).unwrap();
    (Arc::new(window), event_loop)
}

fn create_device(window: &Arc<Window>) -> VulkanGraphicsDevice {
    let config = GraphicsDeviceConfig { enable_validation_layers: false, ..Default::default() };
    VulkanGraphicsDevice::new(window.clone(), config).unwrap()
}

/// Record and present one frame that clears the back buffer
fn render_clear_frame(device: &mut VulkanGraphicsDevice) -> FrameBegin {
    let begin = device.begin_frame().unwrap();
    if begin == FrameBegin::Skipped {
        return begin;
    }

    let back_buffer = device.current_back_buffer().unwrap();
    let depth = device.depth_buffer().unwrap();
    let (width, height) = device.swapchain_extent();

    let mut cmd = device.create_command_list().unwrap();
    cmd.begin().unwrap();
    cmd.begin_rendering(
        &[RenderingAttachment::color(back_buffer.clone(), [0.1, 0.2, 0.3, 1.0])],
        Some(&RenderingAttachment::depth(depth, 1.0)),
        Rect2D::from_extent(width, height),
    )
    .unwrap();
    cmd.end_rendering().unwrap();
    cmd.end().unwrap();

    assert_eq!(back_buffer.layout(0, 0), ImageLayout::PresentSrc);
    device.submit_command_list(cmd.as_ref()).unwrap();
    assert_eq!(device.frame_state(), FrameState::CommandsSubmitted);
    device.present().unwrap();
    begin
}

// ============================================================================
// DEVICE TESTS
// ============================================================================

#[test]
#[ignore] // Requires GPU
fn test_vulkan_device_creation() {
    let (window, _event_loop) = create_test_window();
    let device = create_device(&window);

    assert_eq!(device.swapchain_extent(), (800, 600));
    assert!(device.depth_format().is_depth());
    assert_eq!(device.max_frames_in_flight(), 2);
    assert_eq!(device.frame_state(), FrameState::Idle);
    device.wait_idle().unwrap();
}

#[test]
#[ignore] // Requires GPU
fn test_vulkan_rejects_old_api_version() {
    let (window, _event_loop) = create_test_window();
    let config = GraphicsDeviceConfig { api_version: (1, 2), enable_validation_layers: false, ..Default::default() };
    assert!(VulkanGraphicsDevice::new(window.clone(), config).is_err());
}

// ============================================================================
// BUFFER TESTS
// ============================================================================

#[test]
#[ignore] // Requires GPU
fn test_vulkan_host_visible_buffer_update() {
    let (window, _event_loop) = create_test_window();
    let mut device = create_device(&window);

    let desc = BufferDesc::new(256, BufferUsage::UNIFORM)
        .with_memory_type(MemoryType::HostVisible)
        .with_name("test_uniforms");
    let buffer = device.create_buffer(desc).unwrap();
    assert_eq!(buffer.size(), 256);
    assert_eq!(buffer.memory_type(), MemoryType::HostVisible);

    let values: [f32; 4] = [1.0, 2.0, 3.0, 4.0];
    update_typed(buffer.as_ref(), 0, &values).unwrap();

    let ptr = buffer.map().unwrap();
    assert!(buffer.is_mapped());
    let bytes = unsafe { std::slice::from_raw_parts(ptr, 16) };
    assert_eq!(bytes, bytemuck::cast_slice::<f32, u8>(&values));
    buffer.unmap();
}

#[test]
#[ignore] // Requires GPU
fn test_vulkan_update_out_of_range_fails() {
    let (window, _event_loop) = create_test_window();
    let mut device = create_device(&window);

    let desc = BufferDesc::new(16, BufferUsage::UNIFORM).with_memory_type(MemoryType::HostVisible);
    let buffer = device.create_buffer(desc).unwrap();
    assert!(buffer.update(8, &[0u8; 16]).is_err());
}

#[test]
#[ignore] // Requires GPU
fn test_vulkan_upload_vertex_buffer() {
    let (window, _event_loop) = create_test_window();
    let mut device = create_device(&window);

    let vertices: [[f32; 3]; 3] = [[0.0, -0.5, 0.0], [0.5, 0.5, 0.0], [-0.5, 0.5, 0.0]];
    let desc = BufferDesc::new(36, BufferUsage::VERTEX | BufferUsage::TRANSFER_DST).with_name("triangle");
    let buffer = device.create_and_upload_buffer(desc, bytemuck::cast_slice(&vertices)).unwrap();
    assert_eq!(buffer.memory_type(), MemoryType::DeviceLocal);

    device.flush_transfers().unwrap();
    let stats = device.stats();
    assert!(stats.memory.total_used >= 36);
    assert!(stats.memory.allocation_count >= 1);
}

#[test]
#[ignore] // Requires GPU
fn test_vulkan_buffer_upload_state() {
    let (window, _event_loop) = create_test_window();
    let mut device = create_device(&window);

    let plain = device.create_buffer(BufferDesc::new(16, BufferUsage::VERTEX)).unwrap();
    assert_eq!(plain.as_any().downcast_ref::<Buffer>().unwrap().upload_state(), None);

    let uploaded = device
        .create_and_upload_buffer(BufferDesc::new(16, BufferUsage::VERTEX), &[7u8; 16])
        .unwrap();
    let uploaded = uploaded.as_any().downcast_ref::<Buffer>().unwrap();
    assert_eq!(uploaded.upload_state(), Some(UploadState::Uploading));

    device.flush_transfers().unwrap();
    assert_eq!(uploaded.upload_state(), Some(UploadState::Ready));
}

// ============================================================================
// TEXTURE TESTS
// ============================================================================

#[test]
#[ignore] // Requires GPU
fn test_vulkan_texture_upload_ends_shader_read_only() {
    let (window, _event_loop) = create_test_window();
    let mut device = create_device(&window);

    let desc = TextureDesc::new_2d(4, 4, TextureFormat::R8G8B8A8_UNORM, TextureUsage::SAMPLED | TextureUsage::TRANSFER_DST)
        .with_name("checker");
    let pixels = vec![255u8; 4 * 4 * 4];
    let texture = device.create_and_upload_texture(desc, &pixels).unwrap();
    device.flush_transfers().unwrap();

    assert_eq!(texture.info().width, 4);
    assert!(!texture.is_swapchain_image());
    assert_eq!(texture.layout(0, 0), ImageLayout::ShaderReadOnly);
}

#[test]
#[ignore] // Requires GPU
fn test_vulkan_mid_frame_upload_lands_before_frame_submit() {
    let (window, _event_loop) = create_test_window();
    let mut device = create_device(&window);
    assert_eq!(device.begin_frame().unwrap(), FrameBegin::Ready);

    let desc = TextureDesc::new_2d(2, 2, TextureFormat::R8G8B8A8_UNORM, TextureUsage::SAMPLED | TextureUsage::TRANSFER_DST);
    let texture = device.create_and_upload_texture(desc, &[128u8; 16]).unwrap();
    let uploaded = texture.as_any().downcast_ref::<Texture>().unwrap();
    assert_eq!(uploaded.upload_state(), Some(UploadState::Uploading));

    let back_buffer = device.current_back_buffer().unwrap();
    let (width, height) = device.swapchain_extent();
    let mut cmd = device.create_command_list().unwrap();
    cmd.begin().unwrap();
    cmd.begin_rendering(
        &[RenderingAttachment::color(back_buffer, [0.0; 4])],
        None,
        Rect2D::from_extent(width, height),
    )
    .unwrap();
    cmd.end_rendering().unwrap();
    cmd.end().unwrap();
    device.submit_command_list(cmd.as_ref()).unwrap();

    assert_eq!(uploaded.upload_state(), Some(UploadState::Ready));
    device.present().unwrap();
    device.wait_idle().unwrap();
}

#[test]
#[ignore] // Requires GPU
fn test_vulkan_texture_upload_wrong_size_fails() {
    let (window, _event_loop) = create_test_window();
    let mut device = create_device(&window);

    let desc = TextureDesc::new_2d(4, 4, TextureFormat::R8G8B8A8_UNORM, TextureUsage::SAMPLED | TextureUsage::TRANSFER_DST);
    assert!(device.create_and_upload_texture(desc, &[0u8; 12]).is_err());
}

// ============================================================================
// DESCRIPTOR TESTS
// ============================================================================

#[test]
#[ignore] // Requires GPU
fn test_vulkan_descriptor_set_binding() {
    let (window, _event_loop) = create_test_window();
    let mut device = create_device(&window);

    let layout = device
        .create_descriptor_set_layout(DescriptorSetLayoutDesc {
            bindings: vec![
                DescriptorBinding { binding: 0, descriptor_type: DescriptorType::UniformBuffer, count: 1, stages: ShaderStageFlags::VERTEX },
                DescriptorBinding { binding: 1, descriptor_type: DescriptorType::CombinedImageSampler, count: 1, stages: ShaderStageFlags::FRAGMENT },
            ],
        })
        .unwrap();
    let set = device.allocate_descriptor_set(&layout).unwrap();

    let uniforms = device
        .create_buffer(BufferDesc::new(64, BufferUsage::UNIFORM).with_memory_type(MemoryType::HostVisible))
        .unwrap();
    let texture = device
        .create_and_upload_texture(
            TextureDesc::new_2d(1, 1, TextureFormat::R8G8B8A8_UNORM, TextureUsage::SAMPLED | TextureUsage::TRANSFER_DST),
            &[255, 255, 255, 255],
        )
        .unwrap();
    let sampler = device.create_sampler(SamplerDesc::default()).unwrap();
    device.flush_transfers().unwrap();

    set.update_uniform_buffer(0, &uniforms, 0, 64).unwrap();
    set.update_combined_image_sampler(1, &texture, &sampler).unwrap();
    // Wrong descriptor type for the binding
    assert!(set.update_uniform_buffer(1, &uniforms, 0, 64).is_err());
}

// ============================================================================
// SYNC TESTS
// ============================================================================

#[test]
#[ignore] // Requires GPU
fn test_vulkan_timeline_signal_rejects_lower_value() {
    let (window, _event_loop) = create_test_window();
    let device = create_device(&window);

    let timeline = Semaphore::new(&device.context().sync, SemaphoreDesc::timeline(0)).unwrap();
    timeline.signal(5).unwrap();
    assert!(timeline.signal(3).is_err());
    timeline.signal(5).unwrap();
    assert_eq!(timeline.value().unwrap(), 5);
}

// ============================================================================
// FRAME TESTS
// ============================================================================

#[test]
#[ignore] // Requires GPU
fn test_vulkan_full_frame() {
    let (window, _event_loop) = create_test_window();
    let mut device = create_device(&window);

    assert_eq!(render_clear_frame(&mut device), FrameBegin::Ready);
    assert_eq!(device.frame_state(), FrameState::Presented);
    assert_eq!(device.current_frame_index(), 1);

    let stats = device.stats();
    assert_eq!(stats.frames_begun, 1);
    assert_eq!(stats.frames_presented, 1);
    assert!(stats.sync.submits >= 1);
    device.wait_idle().unwrap();
}

#[test]
#[ignore] // Requires GPU
fn test_vulkan_frames_rotate_slots() {
    let (window, _event_loop) = create_test_window();
    let mut device = create_device(&window);

    for _ in 0..5 {
        render_clear_frame(&mut device);
    }
    assert_eq!(device.current_frame_index(), 5 % device.max_frames_in_flight());
    device.wait_idle().unwrap();
}

#[test]
#[ignore] // Requires GPU
fn test_vulkan_command_list_outside_frame_fails() {
    let (window, _event_loop) = create_test_window();
    let mut device = create_device(&window);

    assert!(device.create_command_list().is_err());
    assert!(device.present().is_err());
}

#[test]
#[ignore] // Requires GPU
fn test_vulkan_abandoned_frame_releases_slot() {
    let (window, _event_loop) = create_test_window();
    let mut device = create_device(&window);

    assert_eq!(device.begin_frame().unwrap(), FrameBegin::Ready);
    assert!(device.begin_frame().is_err());
    device.abandon_frame().unwrap();
    assert_eq!(device.frame_state(), FrameState::Idle);

    assert_eq!(render_clear_frame(&mut device), FrameBegin::Ready);
    let stats = device.stats();
    assert_eq!(stats.frames_abandoned, 1);
    assert!(stats.swapchain_recreations >= 1);
    device.wait_idle().unwrap();
}

#[test]
#[ignore] // Requires GPU
fn test_vulkan_resize_recreates_swapchain() {
    let (window, _event_loop) = create_test_window();
    let mut device = create_device(&window);

    render_clear_frame(&mut device);
    device.resize(640, 480);
    render_clear_frame(&mut device);

    assert!(device.stats().swapchain_recreations >= 1);
    device.wait_idle().unwrap();
}
