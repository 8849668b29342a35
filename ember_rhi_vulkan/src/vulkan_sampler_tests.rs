//! Unit tests for sampler

use super::*;

#[test]
fn test_anisotropy_disabled_when_not_requested() {
    assert_eq!(effective_anisotropy(None, 16.0), None);
    assert_eq!(effective_anisotropy(Some(1.0), 16.0), None);
}

#[test]
fn test_anisotropy_clamped_to_device_limit() {
    assert_eq!(effective_anisotropy(Some(16.0), 8.0), Some(8.0));
    assert_eq!(effective_anisotropy(Some(4.0), 16.0), Some(4.0));
}

#[test]
fn test_anisotropy_unsupported_device() {
    assert_eq!(effective_anisotropy(Some(16.0), 1.0), None);
}
