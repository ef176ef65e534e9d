//! Opaque resource handles
//!
//! Handles are generational slotmap keys: cheap to copy, safe to hold
//! across resource destruction (a stale handle is a soft error, never a
//! dangling pointer), and meaningless outside the backend that issued
//! them.

use slotmap::new_key_type;

new_key_type! {
    /// Handle to a GPU texture (image + view + sampler)
    pub struct TextureHandle;

    /// Handle to a vertex or index buffer
    pub struct BufferHandle;

    /// Handle to a loaded shader (parsed shader binary + backend modules)
    pub struct ShaderHandle;

    /// Handle to a framebuffer (render pass + attachments)
    pub struct FramebufferHandle;

    /// Handle to a graphics or compute pipeline
    pub struct PipelineHandle;
}
