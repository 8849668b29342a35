//! Unit tests for default resources

use super::*;
use crate::graphics_device::mock_graphics_device::MockGraphicsDevice;
use crate::graphics_device::{AddressMode, Filter, ImageLayout};

#[test]
fn test_default_resources_created_ready_to_sample() {
    let mut device = MockGraphicsDevice::new();
    let defaults = DefaultResources::new(&mut device).unwrap();

    for texture in [&defaults.white, &defaults.black, &defaults.flat_normal] {
        assert_eq!(texture.info().width, 1);
        assert_eq!(texture.info().height, 1);
        assert_eq!(texture.layout(0, 0), ImageLayout::ShaderReadOnly);
    }
    assert_eq!(device.created_textures, 3);
    assert_eq!(device.uploaded_bytes, 12);
}

#[test]
fn test_default_sampler_is_linear_repeat() {
    let mut device = MockGraphicsDevice::new();
    let defaults = DefaultResources::new(&mut device).unwrap();
    let desc = defaults.sampler.desc();
    assert_eq!(desc.mag_filter, Filter::Linear);
    assert_eq!(desc.address_u, AddressMode::Repeat);
}
