//! Backend abstraction for the video subsystem
//!
//! [`VideoBackend`] is the single seam between engine/client code and a
//! concrete graphics API. It is selected once at init time and used as a
//! trait object everywhere else, so backends can be swapped without
//! recompiling callers. All resources are referred to through the opaque
//! generational handles in [`handles`].

pub mod descriptors;
pub mod flags;
pub mod handles;

pub use descriptors::{
    hash_name, BindingDesc, BindingKind, DescriptorSetDesc, PipelineDesc, ShaderStages,
    VertexAttribute, VertexAttributeType, VertexInputRate, VertexLayout,
};
pub use flags::{BufferFlags, FramebufferFlags, PipelineFlags, PrimitiveTopology, TextureFlags};
pub use handles::{BufferHandle, FramebufferHandle, PipelineHandle, ShaderHandle, TextureHandle};

use serde::{Deserialize, Serialize};

use crate::render::error::RenderResult;

/// Selectable video backend APIs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VideoApi {
    /// Vulkan backend (primary)
    Vulkan,
    /// OpenGL backend; currently resolves to the stub backend
    OpenGl,
    /// CPU-side stub backend for headless use and tests
    Null,
}

/// Pixel format of a texture or framebuffer attachment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PixelFormat {
    /// 8-bit RGBA, linear
    #[default]
    Rgba8,
    /// 8-bit BGRA, matching the preferred swapchain format
    Bgra8,
    /// 32-bit float depth
    Depth32Float,
}

impl PixelFormat {
    /// Whether this format is a depth format
    pub fn is_depth(self) -> bool {
        matches!(self, Self::Depth32Float)
    }

    /// Bytes per pixel
    pub fn bytes_per_pixel(self) -> usize {
        4
    }
}

/// One framebuffer attachment description
#[derive(Debug, Clone, Copy)]
pub struct AttachmentDesc {
    /// Pixel format; a depth format classifies the attachment as the
    /// framebuffer's depth attachment (at most one per framebuffer)
    pub format: PixelFormat,
}

/// Texture creation description
#[derive(Debug, Clone, Copy)]
pub struct TextureDesc {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Pixel format
    pub format: PixelFormat,
    /// Sampler flags
    pub flags: TextureFlags,
}

/// Region for a device-side texture-to-texture copy
///
/// Offsets are given in the engine's Y-down convention; backends whose
/// native framebuffer origin differs (OpenGL) flip internally so the same
/// region names the same texels on every backend.
#[derive(Debug, Clone, Copy)]
pub struct TextureRegion {
    /// Source offset `(x, y)`
    pub src_offset: (i32, i32),
    /// Destination offset `(x, y)`
    pub dst_offset: (i32, i32),
    /// Extent `(width, height)` of the copied region
    pub size: (u32, u32),
}

/// The video backend contract
///
/// One instance exists per renderer; all calls come from the single host
/// thread driving the frame loop. Methods that record commands are only
/// valid between `begin_frame` and `end_frame`. Destruction methods are
/// infallible from the caller's perspective: while a frame is in flight
/// they defer the actual teardown, and stale handles are logged no-ops.
pub trait VideoBackend {
    /// Which API this backend implements
    fn api(&self) -> VideoApi;

    /// Number of frames that may be in flight simultaneously
    fn frames_in_flight(&self) -> usize;

    /// Index of the frame-in-flight slot currently recording, in
    /// `[0, frames_in_flight)`
    fn current_frame(&self) -> usize;

    /// Whether a frame is currently being recorded
    fn in_frame(&self) -> bool;

    /// Wait for the current slot's fence, acquire the next presentable
    /// image (recreating the swapchain if it is stale) and begin command
    /// recording
    fn begin_frame(&mut self) -> RenderResult<()>;

    /// Flush pending host writes, submit, present, drain deferred
    /// destructions and advance the frame index
    fn end_frame(&mut self) -> RenderResult<()>;

    /// Ask for the swapchain (and everything sized to it) to be rebuilt at
    /// the next `begin_frame`; idempotent
    fn request_swapchain_recreation(&mut self);

    /// Current swapchain extent `(width, height)`
    fn swapchain_extent(&self) -> (u32, u32);

    /// Block until all submitted GPU work has retired
    fn wait_idle(&self);

    // --- Framebuffers ---

    /// The swapchain-backed framebuffer created at init time
    fn default_framebuffer(&self) -> FramebufferHandle;

    /// Create a framebuffer with the given attachments
    fn create_framebuffer(
        &mut self,
        flags: FramebufferFlags,
        size: (u32, u32),
        attachments: &[AttachmentDesc],
    ) -> RenderResult<FramebufferHandle>;

    /// Rebuild the framebuffer in place at a new size, preserving identity
    fn resize_framebuffer(
        &mut self,
        framebuffer: FramebufferHandle,
        size: (u32, u32),
    ) -> RenderResult<()>;

    /// Destroy a framebuffer (deferred while a frame is in flight)
    fn destroy_framebuffer(&mut self, framebuffer: FramebufferHandle);

    /// Reported size of the framebuffer
    fn framebuffer_size(&self, framebuffer: FramebufferHandle) -> RenderResult<(u32, u32)>;

    /// Begin the framebuffer's render pass in the current frame
    fn begin_framebuffer(&mut self, framebuffer: FramebufferHandle) -> RenderResult<()>;

    /// End the framebuffer's render pass; headless attachments become
    /// sampleable afterwards
    fn end_framebuffer(&mut self, framebuffer: FramebufferHandle) -> RenderResult<()>;

    /// Currently-sampleable texture for a headless framebuffer attachment
    fn framebuffer_attachment(
        &mut self,
        framebuffer: FramebufferHandle,
        attachment: u32,
    ) -> RenderResult<TextureHandle>;

    // --- Shaders ---

    /// Parse a shader binary (see [`crate::render::shader_format`]) and
    /// create the backend's shader modules from it
    fn create_shader(&mut self, bytes: &[u8]) -> RenderResult<ShaderHandle>;

    /// Destroy a shader
    fn destroy_shader(&mut self, shader: ShaderHandle);

    // --- Pipelines ---

    /// Compile a graphics or compute pipeline
    fn create_pipeline(&mut self, desc: &PipelineDesc) -> RenderResult<PipelineHandle>;

    /// Tear down and rebuild the pipeline in place from its stored
    /// creation description (after a resize or shader change)
    fn recreate_pipeline(&mut self, pipeline: PipelineHandle) -> RenderResult<()>;

    /// Destroy a pipeline (deferred while a frame is in flight)
    fn destroy_pipeline(&mut self, pipeline: PipelineHandle);

    /// Bind the pipeline for subsequent draws or dispatches
    fn bind_pipeline(&mut self, pipeline: PipelineHandle) -> RenderResult<()>;

    /// Bind the current frame's concrete descriptor set instance for the
    /// named logical set to the given pipeline-layout slot
    fn bind_descriptor_set(
        &mut self,
        pipeline: PipelineHandle,
        set_name: &str,
        slot: u32,
    ) -> RenderResult<()>;

    /// Queue a uniform write, looked up by set and binding name. The write
    /// is fanned out to every frame-in-flight's update queue so the value
    /// persists across frames until overwritten.
    fn update_uniform(
        &mut self,
        pipeline: PipelineHandle,
        set_name: &str,
        binding_name: &str,
        data: &[u8],
    ) -> RenderResult<()>;

    // --- Buffers ---

    /// Create a vertex buffer; `BufferFlags::DYNAMIC` selects persistently
    /// mapped memory, otherwise contents are staged once and immutable
    fn create_vertex_buffer(&mut self, flags: BufferFlags, data: &[u8])
        -> RenderResult<BufferHandle>;

    /// Queue an update of a dynamic vertex buffer; rejected for buffers
    /// created without `BufferFlags::DYNAMIC`
    fn update_vertex_buffer(
        &mut self,
        buffer: BufferHandle,
        offset: u64,
        data: &[u8],
    ) -> RenderResult<()>;

    /// Create an index buffer; `BufferFlags::INDEX_32` selects 32-bit
    /// elements. Always a staged, static upload.
    fn create_index_buffer(&mut self, flags: BufferFlags, data: &[u8])
        -> RenderResult<BufferHandle>;

    /// Destroy a buffer (deferred while a frame is in flight)
    fn destroy_buffer(&mut self, buffer: BufferHandle);

    /// Bind a vertex buffer for subsequent draws
    fn bind_vertex_buffer(&mut self, buffer: BufferHandle) -> RenderResult<()>;

    /// Bind an index buffer for subsequent indexed draws
    fn bind_index_buffer(&mut self, buffer: BufferHandle) -> RenderResult<()>;

    // --- Textures ---

    /// Create a texture from tightly-packed pixel data
    fn create_texture(&mut self, desc: &TextureDesc, pixels: &[u8]) -> RenderResult<TextureHandle>;

    /// Destroy a texture (deferred while a frame is in flight)
    fn destroy_texture(&mut self, texture: TextureHandle);

    /// Size of a texture `(width, height)`
    fn texture_size(&self, texture: TextureHandle) -> RenderResult<(u32, u32)>;

    /// Device-side copy of a region between two textures
    fn copy_texture(
        &mut self,
        src: TextureHandle,
        dst: TextureHandle,
        region: &TextureRegion,
    ) -> RenderResult<()>;

    /// Read a texture's pixels back to the host (tightly packed)
    fn read_texture(&mut self, texture: TextureHandle) -> RenderResult<Vec<u8>>;

    // --- Drawing ---

    /// Draw non-indexed geometry with the bound pipeline and vertex buffer
    fn draw(&mut self, vertex_count: u32, instance_count: u32) -> RenderResult<()>;

    /// Draw indexed geometry with the bound pipeline and buffers
    fn draw_indexed(&mut self, index_count: u32, instance_count: u32) -> RenderResult<()>;

    /// Dispatch the bound compute pipeline
    fn dispatch(&mut self, groups_x: u32, groups_y: u32, groups_z: u32) -> RenderResult<()>;
}
