//! Unit tests for descriptor

use super::*;

fn layout() -> DescriptorSetLayoutDesc {
    DescriptorSetLayoutDesc {
        bindings: vec![
            DescriptorBinding { binding: 0, descriptor_type: DescriptorType::UniformBuffer, count: 1, stages: ShaderStageFlags::VERTEX },
            DescriptorBinding { binding: 1, descriptor_type: DescriptorType::CombinedImageSampler, count: 1, stages: ShaderStageFlags::FRAGMENT },
        ],
    }
}

#[test]
fn test_validate_rejects_duplicates() {
    assert!(layout().validate().is_ok());
    let mut dup = layout();
    dup.bindings[1].binding = 0;
    assert!(matches!(dup.validate(), Err(Error::InvalidResource(_))));
}

#[test]
fn test_check_binding() {
    let layout = layout();
    assert!(check_binding(&layout, 0, DescriptorType::UniformBuffer).is_ok());
    assert!(check_binding(&layout, 1, DescriptorType::UniformBuffer).is_err());
    assert!(check_binding(&layout, 7, DescriptorType::StorageBuffer).is_err());
}
