//! Window collaborator seam
//!
//! The engine never creates windows. Whatever windowing layer the host
//! application uses implements [`RenderSurface`] to hand the video backend
//! the two things it needs: the current drawable size (for swapchain
//! extent selection) and the native handles Vulkan surface creation
//! requires.

use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

/// Access to the host window from the video backend
///
/// Implementations are expected to report the post-resize drawable size;
/// the backend compares it against the swapchain extent during
/// recreation.
pub trait RenderSurface {
    /// Current drawable size in pixels `(width, height)`
    fn drawable_size(&self) -> (u32, u32);

    /// Native display handle for Vulkan surface creation
    fn raw_display_handle(&self) -> RawDisplayHandle;

    /// Native window handle for Vulkan surface creation
    fn raw_window_handle(&self) -> RawWindowHandle;
}
