//! Rendering error types
//!
//! Backend-agnostic error taxonomy for the video interface. Backend errors
//! (Vulkan result codes and the like) are logged where they occur and
//! surfaced here in a generic form, so callers never depend on a specific
//! graphics API's error types.

use thiserror::Error;

/// High-level rendering error types
///
/// The variants follow the engine's failure policy: initialization and
/// allocation failures are not recoverable mid-session, per-frame failures
/// abandon the frame and the loop continues, and bad names or stale
/// handles are soft no-ops.
#[derive(Error, Debug)]
pub enum RenderError {
    /// Renderer or backend initialization failed during setup
    #[error("Renderer initialization failed: {0}")]
    InitializationFailed(String),

    /// A per-frame operation failed; the current frame is abandoned
    #[error("Rendering failed: {0}")]
    RenderingFailed(String),

    /// Resource creation or upload failed
    #[error("Resource creation failed: {0}")]
    ResourceCreationFailed(String),

    /// A handle refers to a resource that no longer exists
    #[error("Resource not found: {kind}")]
    ResourceNotFound {
        /// The resource category the stale handle belongs to
        kind: &'static str,
    },

    /// A descriptor set or binding name did not match the pipeline
    #[error("Unknown name: {0}")]
    UnknownName(String),

    /// The operation is invalid for the resource's creation flags or state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// The active backend does not implement the requested feature
    #[error("Unsupported by backend: {0}")]
    Unsupported(&'static str),

    /// Backend-specific error occurred
    #[error("Backend error: {0}")]
    BackendError(String),
}

/// Result type for rendering operations
pub type RenderResult<T> = Result<T, RenderError>;
