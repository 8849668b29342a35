//! Unit tests for error.rs
//!
//! Display/Debug output of every variant and the fatal classification.

use super::*;

// ============================================================================
// ERROR DISPLAY TESTS
// ============================================================================

#[test]
fn test_backend_error_display() {
    let err = Error::BackendError("vkCreateInstance exploded".to_string());
    let display = format!("{}", err);
    assert!(display.contains("Backend error"));
    assert!(display.contains("vkCreateInstance exploded"));
}

#[test]
fn test_out_of_memory_display() {
    assert_eq!(format!("{}", Error::OutOfMemory), "Out of GPU memory");
}

#[test]
fn test_native_error_keeps_code_verbatim() {
    let err = Error::NativeError {
        operation: "vkCreateGraphicsPipelines".to_string(),
        code: -1000012000,
    };
    let display = format!("{}", err);
    assert!(display.contains("vkCreateGraphicsPipelines"));
    assert!(display.contains("-1000012000"));
}

#[test]
fn test_allocation_failed_display() {
    let err = Error::AllocationFailed("request exceeds max pool size".to_string());
    assert_eq!(format!("{}", err), "Allocation failed: request exceeds max pool size");
}

#[test]
fn test_submission_and_timeout_display() {
    let submit = Error::SubmissionFailed("queue rejected batch".to_string());
    assert!(format!("{}", submit).starts_with("Submission failed"));

    let timeout = Error::Timeout("frame fence".to_string());
    assert!(format!("{}", timeout).contains("frame fence"));
}

#[test]
fn test_invalid_operation_display() {
    let err = Error::InvalidOperation("draw outside begin/end".to_string());
    assert!(format!("{}", err).contains("Invalid operation"));
}

// ============================================================================
// ERROR TRAIT IMPLEMENTATIONS
// ============================================================================

#[test]
fn test_error_is_std_error() {
    let err = Error::DeviceLost;
    let _: &dyn std::error::Error = &err;
}

#[test]
fn test_error_debug() {
    assert!(format!("{:?}", Error::OutOfMemory).contains("OutOfMemory"));
    assert!(format!("{:?}", Error::DeviceLost).contains("DeviceLost"));
    assert!(format!("{:?}", Error::InvalidResource("x".to_string())).contains("InvalidResource"));
}

#[test]
fn test_error_clone_and_eq() {
    let err = Error::InitializationFailed("no suitable GPU".to_string());
    assert_eq!(err.clone(), err);
}

// ============================================================================
// FATAL CLASSIFICATION
// ============================================================================

#[test]
fn test_only_device_lost_is_fatal() {
    assert!(Error::DeviceLost.is_fatal());
    assert!(!Error::SubmissionFailed("retry".to_string()).is_fatal());
    assert!(!Error::AllocationFailed("cap".to_string()).is_fatal());
    assert!(!Error::OutOfMemory.is_fatal());
}

#[test]
fn test_result_alias() {
    fn failing() -> Result<u32> {
        Err(Error::Timeout("wait".to_string()))
    }
    assert!(failing().is_err());
}
