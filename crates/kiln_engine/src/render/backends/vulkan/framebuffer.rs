//! Framebuffer management
//!
//! Render passes, attachment storage and `vk::Framebuffer` objects
//! following RAII principles. A framebuffer is either backed by the
//! swapchain (one `vk::Framebuffer` per swapchain image over a shared
//! depth buffer) or headless (attachments replicated once per frame in
//! flight so the previous frame's output stays sampleable while the
//! current one is recorded).

use ash::{vk, Device, Instance};

use super::context::{VulkanError, VulkanResult};
use super::texture::{vk_aspect, vk_format, VulkanTexture};
use crate::render::api::{AttachmentDesc, FramebufferFlags, TextureFlags, TextureHandle};

/// Render pass wrapper with RAII cleanup
pub struct RenderPass {
    device: Device,
    render_pass: vk::RenderPass,
}

impl RenderPass {
    /// Build a render pass over the given attachment list
    ///
    /// Attachment indices in the pass match the order of `attachments`; at
    /// most one entry may be a depth format. `color_format` overrides the
    /// Vulkan format used for the color attachments, which the default
    /// framebuffer uses to match whatever surface format the swapchain
    /// negotiated. `present` selects swapchain layouts (`UNDEFINED` to
    /// `PRESENT_SRC_KHR`); headless passes keep color attachments in
    /// `COLOR_ATTACHMENT_OPTIMAL` and rely on explicit barriers around the
    /// pass for sampling.
    pub fn new(
        device: Device,
        attachments: &[AttachmentDesc],
        color_format: Option<vk::Format>,
        present: bool,
    ) -> VulkanResult<Self> {
        let mut descriptions = Vec::with_capacity(attachments.len());
        let mut color_refs = Vec::new();
        let mut depth_ref = None;

        for (index, desc) in attachments.iter().enumerate() {
            if desc.format.is_depth() {
                if depth_ref.is_some() {
                    return Err(VulkanError::InvalidOperation {
                        reason: "framebuffer has more than one depth attachment".to_string(),
                    });
                }
                descriptions.push(
                    vk::AttachmentDescription::builder()
                        .format(vk_format(desc.format))
                        .samples(vk::SampleCountFlags::TYPE_1)
                        .load_op(vk::AttachmentLoadOp::CLEAR)
                        .store_op(vk::AttachmentStoreOp::DONT_CARE)
                        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                        .initial_layout(vk::ImageLayout::UNDEFINED)
                        .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                        .build(),
                );
                depth_ref = Some(vk::AttachmentReference {
                    attachment: index as u32,
                    layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                });
            } else {
                let (initial_layout, final_layout) = if present {
                    (vk::ImageLayout::UNDEFINED, vk::ImageLayout::PRESENT_SRC_KHR)
                } else {
                    (
                        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                    )
                };
                descriptions.push(
                    vk::AttachmentDescription::builder()
                        .format(color_format.unwrap_or_else(|| vk_format(desc.format)))
                        .samples(vk::SampleCountFlags::TYPE_1)
                        .load_op(vk::AttachmentLoadOp::CLEAR)
                        .store_op(vk::AttachmentStoreOp::STORE)
                        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                        .initial_layout(initial_layout)
                        .final_layout(final_layout)
                        .build(),
                );
                color_refs.push(vk::AttachmentReference {
                    attachment: index as u32,
                    layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                });
            }
        }

        let mut subpass = vk::SubpassDescription::builder()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs);
        if let Some(ref depth) = depth_ref {
            subpass = subpass.depth_stencil_attachment(depth);
        }
        let subpasses = [subpass.build()];

        let mut src_stage = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT;
        let mut dst_access = vk::AccessFlags::COLOR_ATTACHMENT_WRITE;
        if depth_ref.is_some() {
            src_stage |= vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS;
            dst_access |= vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE;
        }
        let dependencies = [vk::SubpassDependency::builder()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(src_stage)
            .src_access_mask(vk::AccessFlags::empty())
            .dst_stage_mask(src_stage)
            .dst_access_mask(dst_access)
            .build()];

        let create_info = vk::RenderPassCreateInfo::builder()
            .attachments(&descriptions)
            .subpasses(&subpasses)
            .dependencies(&dependencies);

        let render_pass = unsafe {
            device
                .create_render_pass(&create_info, None)
                .map_err(VulkanError::Api)?
        };

        Ok(Self {
            device,
            render_pass,
        })
    }

    /// Get the render pass handle
    pub fn handle(&self) -> vk::RenderPass {
        self.render_pass
    }
}

impl Drop for RenderPass {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_render_pass(self.render_pass, None);
        }
    }
}

/// Framebuffer wrapper with RAII cleanup
pub struct Framebuffer {
    device: Device,
    framebuffer: vk::Framebuffer,
}

impl Framebuffer {
    /// Create a new framebuffer
    pub fn new(
        device: Device,
        render_pass: vk::RenderPass,
        attachments: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> VulkanResult<Self> {
        let framebuffer_create_info = vk::FramebufferCreateInfo::builder()
            .render_pass(render_pass)
            .attachments(attachments)
            .width(extent.width)
            .height(extent.height)
            .layers(1);

        let framebuffer = unsafe {
            device
                .create_framebuffer(&framebuffer_create_info, None)
                .map_err(VulkanError::Api)?
        };

        Ok(Self {
            device,
            framebuffer,
        })
    }

    /// Get the framebuffer handle
    pub fn handle(&self) -> vk::Framebuffer {
        self.framebuffer
    }
}

impl Drop for Framebuffer {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_framebuffer(self.framebuffer, None);
        }
    }
}

/// One frame-in-flight replica of a headless framebuffer's attachments
pub struct OffscreenFrame {
    /// Attachment images, indexed like the creation descriptions
    pub attachments: Vec<VulkanTexture>,
    /// Framebuffer over this replica's views
    pub framebuffer: Framebuffer,
}

impl OffscreenFrame {
    /// Allocate one replica's attachments and its framebuffer
    pub fn new(
        device: Device,
        instance: &Instance,
        physical_device: vk::PhysicalDevice,
        render_pass: vk::RenderPass,
        size: (u32, u32),
        descs: &[AttachmentDesc],
    ) -> VulkanResult<Self> {
        let mut attachments = Vec::with_capacity(descs.len());
        for desc in descs {
            let usage = if desc.format.is_depth() {
                vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT
            } else {
                vk::ImageUsageFlags::COLOR_ATTACHMENT
                    | vk::ImageUsageFlags::SAMPLED
                    | vk::ImageUsageFlags::TRANSFER_SRC
                    | vk::ImageUsageFlags::TRANSFER_DST
            };
            attachments.push(VulkanTexture::new(
                device.clone(),
                instance,
                physical_device,
                size.0,
                size.1,
                desc.format,
                TextureFlags::CLAMP_TO_EDGE,
                usage,
            )?);
        }

        let views: Vec<vk::ImageView> = attachments.iter().map(|a| a.view()).collect();
        let framebuffer = Framebuffer::new(
            device,
            render_pass,
            &views,
            vk::Extent2D {
                width: size.0,
                height: size.1,
            },
        )?;

        Ok(Self {
            attachments,
            framebuffer,
        })
    }
}

/// Attachment storage variants of a [`FramebufferResource`]
pub enum AttachmentStore {
    /// Swapchain-backed: one framebuffer per swapchain image, sharing one
    /// depth buffer when the attachment list asked for one
    Swapchain {
        /// Shared depth buffer
        depth: Option<VulkanTexture>,
        /// One framebuffer per swapchain image view
        framebuffers: Vec<Framebuffer>,
    },
    /// Headless: attachments replicated per frame in flight
    Offscreen {
        /// Replicas, indexed by frame-in-flight slot
        frames: Vec<OffscreenFrame>,
        /// Pre-issued texture handles, `views[frame][attachment]`, aliasing
        /// the replica attachments in the backend's texture table
        views: Vec<Vec<TextureHandle>>,
    },
}

/// A framebuffer as tracked by the backend
pub struct FramebufferResource {
    /// Creation flags
    pub flags: FramebufferFlags,
    /// Current size in pixels
    pub size: (u32, u32),
    /// Attachment descriptions, kept for resize and pipeline creation
    pub attachment_descs: Vec<AttachmentDesc>,
    /// Render pass all this framebuffer's pipelines render with
    pub render_pass: RenderPass,
    /// Swapchain or offscreen storage
    pub store: AttachmentStore,
}

impl FramebufferResource {
    /// Clear values in attachment order, colors from the configured clear
    /// color and depth cleared to the far plane
    pub fn clear_values(&self, clear_color: [f32; 4]) -> Vec<vk::ClearValue> {
        self.attachment_descs
            .iter()
            .map(|desc| {
                if desc.format.is_depth() {
                    vk::ClearValue {
                        depth_stencil: vk::ClearDepthStencilValue {
                            depth: 1.0,
                            stencil: 0,
                        },
                    }
                } else {
                    vk::ClearValue {
                        color: vk::ClearColorValue {
                            float32: clear_color,
                        },
                    }
                }
            })
            .collect()
    }

    /// The `vk::Framebuffer` to render into this frame
    ///
    /// Swapchain-backed framebuffers select by acquired image index,
    /// headless ones by frame-in-flight slot.
    pub fn target(&self, image_index: usize, frame_index: usize) -> vk::Framebuffer {
        match &self.store {
            AttachmentStore::Swapchain { framebuffers, .. } => {
                framebuffers[image_index].handle()
            }
            AttachmentStore::Offscreen { frames, .. } => frames[frame_index].framebuffer.handle(),
        }
    }

    /// Whether this framebuffer is headless
    pub fn is_headless(&self) -> bool {
        matches!(self.store, AttachmentStore::Offscreen { .. })
    }
}

/// Record barriers taking a replica's color attachments from their last
/// layout into `COLOR_ATTACHMENT_OPTIMAL` before the render pass begins
pub fn record_attachment_acquire(
    device: &Device,
    cmd: vk::CommandBuffer,
    frame: &mut OffscreenFrame,
) {
    for attachment in &mut frame.attachments {
        if attachment.format().is_depth() {
            continue;
        }
        super::texture::record_transition(
            device,
            cmd,
            attachment.image(),
            vk_aspect(attachment.format()),
            attachment.layout(),
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        );
        attachment.set_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
    }
}

/// Record barriers making a replica's color attachments sampleable after
/// the render pass ends
pub fn record_attachment_release(
    device: &Device,
    cmd: vk::CommandBuffer,
    frame: &mut OffscreenFrame,
) {
    for attachment in &mut frame.attachments {
        if attachment.format().is_depth() {
            continue;
        }
        super::texture::record_transition(
            device,
            cmd,
            attachment.image(),
            vk_aspect(attachment.format()),
            attachment.layout(),
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        );
        attachment.set_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
    }
}
