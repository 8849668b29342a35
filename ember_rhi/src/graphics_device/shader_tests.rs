//! Unit tests for shader

use super::*;

#[test]
fn test_content_hash_is_stable() {
    let code = [0x03u8, 0x02, 0x23, 0x07, 1, 2, 3, 4];
    assert_eq!(content_hash(&code), content_hash(&code));
}

#[test]
fn test_content_hash_differs_for_different_code() {
    assert_ne!(content_hash(&[1, 2, 3, 4]), content_hash(&[1, 2, 3, 5]));
    assert_ne!(content_hash(&[0, 0, 0, 0]), content_hash(&[0, 0, 0, 0, 0, 0, 0, 0]));
}

#[test]
fn test_stage_to_flags() {
    assert_eq!(ShaderStageFlags::from(ShaderStage::Vertex), ShaderStageFlags::VERTEX);
    assert!(ShaderStageFlags::ALL.contains(ShaderStageFlags::from(ShaderStage::Compute)));
    assert_eq!(
        ShaderStageFlags::VERTEX_FRAGMENT,
        ShaderStageFlags::VERTEX | ShaderStageFlags::FRAGMENT
    );
}
