//! Error types for the Ember RHI
//!
//! One error enum is shared by the contract crate and every backend. Native
//! result codes are carried verbatim in [`Error::NativeError`] so callers can
//! report exactly what the driver returned.

use std::fmt;

/// Result type for Ember RHI operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ember RHI errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Backend-specific error (Vulkan, etc.)
    BackendError(String),

    /// Out of GPU memory (reported by the driver)
    OutOfMemory,

    /// Invalid resource (wrong kind, foreign backend object, out of range...)
    InvalidResource(String),

    /// Initialization failed (instance, device, swapchain, subsystems)
    InitializationFailed(String),

    /// A native call failed; `code` is the raw API result value
    NativeError {
        /// Name of the failing native operation (e.g. "vkCreateGraphicsPipelines")
        operation: String,
        /// Raw native result code
        code: i32,
    },

    /// Memory manager could not satisfy a request (pool cap, unknown type, exhaustion)
    AllocationFailed(String),

    /// A queue submission failed (retryable)
    SubmissionFailed(String),

    /// Operation not allowed in the current state (e.g. recording outside begin/end)
    InvalidOperation(String),

    /// A fence or semaphore wait timed out
    Timeout(String),

    /// The device was lost; not recoverable
    DeviceLost,
}

impl Error {
    /// Returns true if the error must terminate the render loop
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::DeviceLost)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::BackendError(msg) => write!(f, "Backend error: {}", msg),
            Error::OutOfMemory => write!(f, "Out of GPU memory"),
            Error::InvalidResource(msg) => write!(f, "Invalid resource: {}", msg),
            Error::InitializationFailed(msg) => write!(f, "Initialization failed: {}", msg),
            Error::NativeError { operation, code } => {
                write!(f, "{} failed with native result {}", operation, code)
            }
            Error::AllocationFailed(msg) => write!(f, "Allocation failed: {}", msg),
            Error::SubmissionFailed(msg) => write!(f, "Submission failed: {}", msg),
            Error::InvalidOperation(msg) => write!(f, "Invalid operation: {}", msg),
            Error::Timeout(msg) => write!(f, "Timed out: {}", msg),
            Error::DeviceLost => write!(f, "Device lost"),
        }
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
