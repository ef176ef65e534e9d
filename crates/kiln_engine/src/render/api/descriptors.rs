//! Description types for pipelines, vertex layouts and descriptor sets
//!
//! These are plain host-side descriptions handed to
//! [`super::VideoBackend::create_pipeline`]. Backends deep-copy whatever
//! they need from them at creation time so pipelines can later be
//! recreated in place without touching caller-owned memory again.

use super::handles::{FramebufferHandle, TextureHandle};
use super::ShaderHandle;
use crate::render::api::flags::{PipelineFlags, PrimitiveTopology};
use bitflags::bitflags;

/// Stable 64-bit FNV-1a hash of a descriptor or set name
///
/// Descriptor identities are looked up by hash both at runtime and inside
/// the shader binary's bind table, so the hash must not change between
/// builds or std releases.
pub const fn hash_name(name: &str) -> u64 {
    let bytes = name.as_bytes();
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    let mut i = 0;
    while i < bytes.len() {
        hash ^= bytes[i] as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        i += 1;
    }
    hash
}

bitflags! {
    /// Shader stages a descriptor binding is visible to
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ShaderStages: u32 {
        /// Vertex stage
        const VERTEX = 1 << 0;
        /// Fragment stage
        const FRAGMENT = 1 << 1;
        /// Compute stage
        const COMPUTE = 1 << 2;
    }
}

/// Scalar/vector type of a single vertex attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VertexAttributeType {
    /// One 32-bit float
    F32,
    /// Two 32-bit floats
    Vec2,
    /// Three 32-bit floats
    Vec3,
    /// Four 32-bit floats
    Vec4,
}

impl VertexAttributeType {
    /// Size of the attribute in bytes
    pub fn size(self) -> u32 {
        match self {
            Self::F32 => 4,
            Self::Vec2 => 8,
            Self::Vec3 => 12,
            Self::Vec4 => 16,
        }
    }
}

/// Whether vertex data advances per vertex or per instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VertexInputRate {
    /// Advance per vertex
    #[default]
    Vertex,
    /// Advance per instance
    Instance,
}

/// One named attribute within a vertex layout
#[derive(Debug, Clone)]
pub struct VertexAttribute {
    /// Attribute name as it appears in the shader interface
    pub name: String,
    /// Shader input location
    pub location: u32,
    /// Byte offset within the vertex stride
    pub offset: u32,
    /// Component type
    pub ty: VertexAttributeType,
}

/// Vertex buffer binding description
#[derive(Debug, Clone, Default)]
pub struct VertexLayout {
    /// Byte stride between consecutive elements
    pub stride: u32,
    /// Per-vertex or per-instance stepping
    pub rate: VertexInputRate,
    /// Attributes read from each element
    pub attributes: Vec<VertexAttribute>,
}

/// What a descriptor binding points at
#[derive(Debug, Clone)]
pub enum BindingKind {
    /// A uniform buffer of the given byte size, replicated per
    /// frame-in-flight with its own persistently-mapped backing store
    UniformBuffer {
        /// Size of the uniform block in bytes
        size: u64,
    },
    /// A sampled texture
    Texture(TextureHandle),
    /// A headless framebuffer attachment sampled as a texture; resolves to
    /// the current frame-in-flight's image at bind time
    FramebufferAttachment {
        /// The headless framebuffer that owns the attachment
        framebuffer: FramebufferHandle,
        /// Attachment index within that framebuffer
        attachment: u32,
    },
}

/// One named binding inside a descriptor set
#[derive(Debug, Clone)]
pub struct BindingDesc {
    /// Binding name, hashed for lookup
    pub name: String,
    /// What the binding references
    pub kind: BindingKind,
    /// Stages that read the binding
    pub stages: ShaderStages,
}

/// A named descriptor set: a group of bindings bound atomically
#[derive(Debug, Clone)]
pub struct DescriptorSetDesc {
    /// Set name, hashed for lookup
    pub name: String,
    /// Bindings in declaration order; the index is the binding slot
    pub bindings: Vec<BindingDesc>,
}

impl DescriptorSetDesc {
    /// Count `(uniform_buffers, samplers)` across the set's bindings
    pub fn descriptor_counts(&self) -> (u32, u32) {
        let mut uniforms = 0;
        let mut samplers = 0;
        for binding in &self.bindings {
            match binding.kind {
                BindingKind::UniformBuffer { .. } => uniforms += 1,
                BindingKind::Texture(_) | BindingKind::FramebufferAttachment { .. } => {
                    samplers += 1
                }
            }
        }
        (uniforms, samplers)
    }
}

/// Full description of a graphics or compute pipeline
#[derive(Debug, Clone)]
pub struct PipelineDesc {
    /// Rasterization flags (ignored for compute shaders)
    pub flags: PipelineFlags,
    /// Primitive topology (ignored for compute shaders)
    pub topology: PrimitiveTopology,
    /// The shader the pipeline executes
    pub shader: ShaderHandle,
    /// Target framebuffer for render-pass compatibility (ignored for compute)
    pub framebuffer: FramebufferHandle,
    /// Vertex input layout; `None` for vertex-free or compute pipelines
    pub vertex_layout: Option<VertexLayout>,
    /// Descriptor sets in slot order
    pub sets: Vec<DescriptorSetDesc>,
}

impl PipelineDesc {
    /// Count `(uniform_buffers, samplers)` across all descriptor sets,
    /// used to size the pipeline's shared descriptor pool
    pub fn descriptor_counts(&self) -> (u32, u32) {
        self.sets.iter().fold((0, 0), |(u, s), set| {
            let (du, ds) = set.descriptor_counts();
            (u + du, s + ds)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_name_stable() {
        // Reference FNV-1a 64 values; these are part of the shader binary
        // format and must never change.
        assert_eq!(hash_name(""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(hash_name("a"), 0xaf63_dc4c_8601_ec8c);
        assert_ne!(hash_name("camera"), hash_name("material"));
    }

    #[test]
    fn test_descriptor_counts() {
        let set = DescriptorSetDesc {
            name: "frame".into(),
            bindings: vec![
                BindingDesc {
                    name: "camera".into(),
                    kind: BindingKind::UniformBuffer { size: 128 },
                    stages: ShaderStages::VERTEX,
                },
                BindingDesc {
                    name: "lighting".into(),
                    kind: BindingKind::UniformBuffer { size: 64 },
                    stages: ShaderStages::FRAGMENT,
                },
                BindingDesc {
                    name: "albedo".into(),
                    kind: BindingKind::Texture(TextureHandle::default()),
                    stages: ShaderStages::FRAGMENT,
                },
            ],
        };
        assert_eq!(set.descriptor_counts(), (2, 1));
    }

    #[test]
    fn test_attribute_sizes() {
        assert_eq!(VertexAttributeType::F32.size(), 4);
        assert_eq!(VertexAttributeType::Vec4.size(), 16);
    }
}
