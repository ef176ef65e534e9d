//! Creation flags for video resources

use bitflags::bitflags;

bitflags! {
    /// Rasterization state flags for pipeline creation
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PipelineFlags: u32 {
        /// Enable depth testing and depth writes
        const DEPTH_TEST = 1 << 0;
        /// Cull back faces
        const CULL_BACK = 1 << 1;
        /// Treat clockwise winding as front-facing (default is CCW)
        const FRONT_FACE_CW = 1 << 2;
        /// Enable standard alpha blending on colour attachments
        const BLEND = 1 << 3;
        /// Make the scissor rectangle dynamic command state
        const DYNAMIC_SCISSOR = 1 << 4;
    }
}

bitflags! {
    /// Buffer creation flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BufferFlags: u32 {
        /// Keep the buffer persistently host-mapped so it can be updated
        /// every frame; without this flag contents are uploaded once
        /// through a staging buffer and become immutable
        const DYNAMIC = 1 << 0;
        /// Index buffers only: 32-bit indices instead of 16-bit
        const INDEX_32 = 1 << 1;
    }
}

bitflags! {
    /// Framebuffer creation flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FramebufferFlags: u32 {
        /// Offscreen target: attachments are replicated per frame-in-flight
        /// and sampleable as textures, instead of being swapchain-backed
        const HEADLESS = 1 << 0;
        /// Auto-resize to the window's drawable size on swapchain recreation
        const FIT_WINDOW = 1 << 1;
    }
}

bitflags! {
    /// Texture sampler flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TextureFlags: u32 {
        /// Nearest-neighbour filtering instead of linear
        const FILTER_NEAREST = 1 << 0;
        /// Clamp addressing instead of repeat
        const CLAMP_TO_EDGE = 1 << 1;
    }
}

/// Primitive assembly topology for graphics pipelines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrimitiveTopology {
    /// Independent triangles
    #[default]
    TriangleList,
    /// Triangle strip
    TriangleStrip,
    /// Independent line segments
    LineList,
    /// Points
    PointList,
}
