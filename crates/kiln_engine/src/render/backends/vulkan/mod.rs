//! Vulkan implementation of the video backend
//!
//! Owns the Vulkan context, swapchain, per-frame synchronization and every
//! GPU resource, keyed by the generational handles from
//! [`crate::render::api::handles`]. The frame loop follows the classic
//! frames-in-flight scheme: each slot has its own command buffer, fence
//! and semaphore pair, host writes are queued per slot and flushed only
//! once the slot's fence has been waited, and destructions requested
//! mid-frame are deferred until after present.

mod buffer;
mod commands;
mod context;
mod framebuffer;
mod pipeline;
mod swapchain;
mod sync;
mod texture;

pub use context::{VulkanContext, VulkanError, VulkanResult};

use ash::vk;
use slotmap::SlotMap;

use crate::render::api::{
    AttachmentDesc, BindingKind, BufferFlags, BufferHandle, FramebufferFlags, FramebufferHandle,
    PipelineDesc, PipelineHandle, PixelFormat, ShaderHandle, TextureDesc, TextureFlags,
    TextureHandle, TextureRegion, VideoApi, VideoBackend, hash_name,
};
use crate::render::config::RendererConfig;
use crate::render::error::{RenderError, RenderResult};
use crate::render::frame::{DeferredFreeQueue, FrameUpdateQueues};
use crate::render::surface::RenderSurface;

use buffer::{BufferKind, DeviceBuffer, GeometryBuffer};
use commands::CommandPool;
use framebuffer::{
    AttachmentStore, Framebuffer, FramebufferResource, OffscreenFrame, RenderPass,
};
use pipeline::{PipelineEnv, VulkanPipeline, VulkanShader};
use swapchain::Swapchain;
use sync::FrameSync;
use texture::{vk_aspect, VulkanTexture};

/// A texture table entry: either an owned image or an alias of a headless
/// framebuffer's attachment replica
enum TextureEntry {
    /// A texture created through `create_texture`
    Owned(VulkanTexture),
    /// Pre-issued view of one attachment replica; the image itself lives
    /// in the framebuffer's store
    AttachmentView {
        framebuffer: FramebufferHandle,
        attachment: u32,
        replica: usize,
    },
}

/// Resources parked until the in-flight frame has been presented
enum DeferredResource {
    Texture(VulkanTexture),
    Buffer(GeometryBuffer),
    Shader(VulkanShader),
    Pipeline(VulkanPipeline),
    Framebuffer(FramebufferResource),
}

/// Destination of a queued host write
#[derive(Debug, Clone, PartialEq)]
enum WriteTarget {
    /// A dynamic vertex buffer
    Buffer(BufferHandle),
    /// One uniform binding's per-frame backing store, pre-resolved to
    /// indices so the flush is a straight array walk
    Uniform {
        pipeline: PipelineHandle,
        set: usize,
        uniform: usize,
    },
}

/// Where to record a texture's post-copy layout
enum LayoutSlot {
    Texture(TextureHandle),
    Attachment(FramebufferHandle, usize, usize),
}

/// Image info gathered for a device-side copy
struct CopyTarget {
    image: vk::Image,
    format: PixelFormat,
    layout: vk::ImageLayout,
    size: (u32, u32),
    slot: LayoutSlot,
}

fn init_err(e: VulkanError) -> RenderError {
    RenderError::InitializationFailed(e.to_string())
}

fn frame_err(e: VulkanError) -> RenderError {
    RenderError::RenderingFailed(e.to_string())
}

fn res_err(e: VulkanError) -> RenderError {
    RenderError::ResourceCreationFailed(e.to_string())
}

/// The Vulkan video backend
///
/// Field order matters: resource tables drop before the swapchain and the
/// swapchain before the context, after the explicit `wait_idle` in `Drop`.
pub struct VulkanBackend {
    frames_in_flight: usize,
    current_frame: usize,
    in_frame: bool,
    image_index: u32,
    swapchain_stale: bool,
    clear_color: [f32; 4],
    vsync: bool,

    frame_sync: Vec<FrameSync>,
    /// Whether each slot's fence was armed by a real submission; waiting on
    /// a fence that was never submitted after a failed frame would hang
    submitted: Vec<bool>,
    command_buffers: Vec<vk::CommandBuffer>,

    active_framebuffer: Option<FramebufferHandle>,
    bound_pipeline: Option<PipelineHandle>,

    updates: FrameUpdateQueues<WriteTarget>,
    deferred: DeferredFreeQueue<DeferredResource>,

    textures: SlotMap<TextureHandle, TextureEntry>,
    buffers: SlotMap<BufferHandle, GeometryBuffer>,
    shaders: SlotMap<ShaderHandle, VulkanShader>,
    pipelines: SlotMap<PipelineHandle, VulkanPipeline>,
    framebuffers: SlotMap<FramebufferHandle, FramebufferResource>,
    default_framebuffer: FramebufferHandle,

    swapchain: Swapchain,
    command_pool: CommandPool,
    context: VulkanContext,
}

impl VulkanBackend {
    /// Initialize the backend over the given window surface
    pub fn new(surface: &dyn RenderSurface, config: &RendererConfig) -> RenderResult<Self> {
        let config = config.clone().sanitized();
        let context = VulkanContext::new(surface, config.validation).map_err(init_err)?;
        let device = context.raw_device();

        let command_pool = CommandPool::new(device.clone(), context.device.graphics_family)
            .map_err(init_err)?;

        let (width, height) = surface.drawable_size();
        let swapchain = Swapchain::new(
            context.instance(),
            device.clone(),
            context.surface,
            &context.surface_loader,
            &context.physical_device,
            vk::Extent2D { width, height },
            config.vsync,
            vk::SwapchainKHR::null(),
        )
        .map_err(init_err)?;

        let frames_in_flight = config.frames_in_flight;
        let command_buffers = command_pool
            .allocate_command_buffers(frames_in_flight as u32)
            .map_err(init_err)?;
        let mut frame_sync = Vec::with_capacity(frames_in_flight);
        for _ in 0..frames_in_flight {
            frame_sync.push(FrameSync::new(device.clone()).map_err(init_err)?);
        }

        let mut backend = Self {
            frames_in_flight,
            current_frame: 0,
            in_frame: false,
            image_index: 0,
            swapchain_stale: false,
            clear_color: config.clear_color,
            vsync: config.vsync,
            frame_sync,
            submitted: vec![false; frames_in_flight],
            command_buffers,
            active_framebuffer: None,
            bound_pipeline: None,
            updates: FrameUpdateQueues::new(frames_in_flight),
            deferred: DeferredFreeQueue::new(),
            textures: SlotMap::with_key(),
            buffers: SlotMap::with_key(),
            shaders: SlotMap::with_key(),
            pipelines: SlotMap::with_key(),
            framebuffers: SlotMap::with_key(),
            default_framebuffer: FramebufferHandle::default(),
            swapchain,
            command_pool,
            context,
        };

        backend.create_default_framebuffer().map_err(init_err)?;

        log::info!(
            "Vulkan backend initialized: {}x{}, {} frames in flight",
            backend.swapchain.extent().width,
            backend.swapchain.extent().height,
            frames_in_flight
        );
        Ok(backend)
    }

    fn create_default_framebuffer(&mut self) -> VulkanResult<()> {
        let descs = vec![
            AttachmentDesc {
                format: PixelFormat::Bgra8,
            },
            AttachmentDesc {
                format: PixelFormat::Depth32Float,
            },
        ];
        let render_pass = RenderPass::new(
            self.context.raw_device(),
            &descs,
            Some(self.swapchain.format().format),
            true,
        )?;
        let store = self.build_swapchain_store(render_pass.handle(), &descs)?;
        let extent = self.swapchain.extent();

        self.default_framebuffer = self.framebuffers.insert(FramebufferResource {
            flags: FramebufferFlags::FIT_WINDOW,
            size: (extent.width, extent.height),
            attachment_descs: descs,
            render_pass,
            store,
        });
        Ok(())
    }

    /// Build the swapchain-backed attachment store: one `vk::Framebuffer`
    /// per swapchain image over a shared depth buffer
    fn build_swapchain_store(
        &self,
        render_pass: vk::RenderPass,
        descs: &[AttachmentDesc],
    ) -> VulkanResult<AttachmentStore> {
        let device = self.context.raw_device();
        let extent = self.swapchain.extent();

        let depth = descs
            .iter()
            .find(|d| d.format.is_depth())
            .map(|d| {
                VulkanTexture::new(
                    device.clone(),
                    self.context.instance(),
                    self.context.physical_device.device,
                    extent.width,
                    extent.height,
                    d.format,
                    TextureFlags::empty(),
                    vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
                )
            })
            .transpose()?;

        let mut framebuffers = Vec::with_capacity(self.swapchain.image_count());
        for &image_view in self.swapchain.image_views() {
            let views: Vec<vk::ImageView> = descs
                .iter()
                .map(|d| {
                    if d.format.is_depth() {
                        depth.as_ref().map(|t| t.view()).unwrap_or_default()
                    } else {
                        image_view
                    }
                })
                .collect();
            framebuffers.push(Framebuffer::new(
                device.clone(),
                render_pass,
                &views,
                extent,
            )?);
        }

        Ok(AttachmentStore::Swapchain {
            depth,
            framebuffers,
        })
    }

    /// Rebuild the swapchain and everything sized to it
    fn recreate_swapchain(&mut self) -> RenderResult<()> {
        self.context.wait_idle();

        let extent = self.swapchain.extent();
        let new_swapchain = Swapchain::new(
            self.context.instance(),
            self.context.raw_device(),
            self.context.surface,
            &self.context.surface_loader,
            &self.context.physical_device,
            extent,
            self.vsync,
            self.swapchain.handle(),
        )
        .map_err(frame_err)?;
        // The old swapchain must outlive creation of its replacement.
        let _retired = std::mem::replace(&mut self.swapchain, new_swapchain);
        drop(_retired);

        let new_extent = self.swapchain.extent();

        // Default framebuffer keeps its render pass (the surface format
        // does not change across resizes) but gets fresh attachments.
        let default = self.default_framebuffer;
        let (render_pass_handle, descs) = {
            let fb = self
                .framebuffers
                .get(default)
                .expect("default framebuffer always exists");
            (fb.render_pass.handle(), fb.attachment_descs.clone())
        };
        let store = self
            .build_swapchain_store(render_pass_handle, &descs)
            .map_err(frame_err)?;
        if let Some(fb) = self.framebuffers.get_mut(default) {
            fb.store = store;
            fb.size = (new_extent.width, new_extent.height);
        }

        // Headless framebuffers tracking the window size follow it.
        let fit: Vec<FramebufferHandle> = self
            .framebuffers
            .iter()
            .filter(|(handle, fb)| {
                *handle != default
                    && fb.is_headless()
                    && fb.flags.contains(FramebufferFlags::FIT_WINDOW)
            })
            .map(|(handle, _)| handle)
            .collect();
        for handle in fit {
            self.rebuild_offscreen(handle, (new_extent.width, new_extent.height))?;
        }

        log::debug!(
            "Swapchain recreated at {}x{}",
            new_extent.width,
            new_extent.height
        );
        Ok(())
    }

    /// Replace a headless framebuffer's attachment replicas at a new size,
    /// keeping its render pass, identity and pre-issued view handles
    fn rebuild_offscreen(
        &mut self,
        handle: FramebufferHandle,
        size: (u32, u32),
    ) -> RenderResult<()> {
        let device = self.context.raw_device();
        let instance = self.context.instance();
        let physical_device = self.context.physical_device.device;

        let fb = self
            .framebuffers
            .get_mut(handle)
            .ok_or(RenderError::ResourceNotFound {
                kind: "framebuffer",
            })?;
        let render_pass = fb.render_pass.handle();

        let mut frames = Vec::with_capacity(self.frames_in_flight);
        for _ in 0..self.frames_in_flight {
            frames.push(
                OffscreenFrame::new(
                    device.clone(),
                    instance,
                    physical_device,
                    render_pass,
                    size,
                    &fb.attachment_descs,
                )
                .map_err(res_err)?,
            );
        }

        match &mut fb.store {
            AttachmentStore::Offscreen {
                frames: old_frames, ..
            } => {
                *old_frames = frames;
                fb.size = size;
                Ok(())
            }
            AttachmentStore::Swapchain { .. } => Err(RenderError::InvalidOperation(
                "cannot resize the swapchain-backed framebuffer directly".to_string(),
            )),
        }
    }

    fn flush_updates(&mut self) {
        for write in self.updates.drain(self.current_frame) {
            match write.target {
                WriteTarget::Buffer(handle) => match self.buffers.get(handle) {
                    Some(buffer) => {
                        if let Err(e) = buffer
                            .buffer
                            .write_bytes(write.offset as usize, &write.data)
                        {
                            log::error!("Queued buffer write failed: {e}");
                        }
                    }
                    None => log::debug!("Dropping queued write to a destroyed buffer"),
                },
                WriteTarget::Uniform {
                    pipeline,
                    set,
                    uniform,
                } => match self.pipelines.get(pipeline) {
                    Some(p) => {
                        if let Err(e) = p.write_uniform(
                            set,
                            uniform,
                            self.current_frame,
                            write.offset as usize,
                            &write.data,
                        ) {
                            log::error!("Queued uniform write failed: {e}");
                        }
                    }
                    None => log::debug!("Dropping queued write to a destroyed pipeline"),
                },
            }
        }
    }

    fn command_buffer(&self) -> vk::CommandBuffer {
        self.command_buffers[self.current_frame]
    }

    fn submit_and_present(&mut self) -> RenderResult<()> {
        let device = self.context.raw_device();
        let cmd = self.command_buffer();
        unsafe {
            device
                .end_command_buffer(cmd)
                .map_err(VulkanError::Api)
                .map_err(frame_err)?;
        }

        let sync = &self.frame_sync[self.current_frame];
        sync.in_flight.reset().map_err(frame_err)?;

        let wait_semaphores = [sync.image_available.handle()];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let command_buffers = [cmd];
        let signal_semaphores = [sync.render_finished.handle()];
        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            device
                .queue_submit(
                    self.context.device.graphics_queue,
                    &[submit_info.build()],
                    sync.in_flight.handle(),
                )
                .map_err(VulkanError::Api)
                .map_err(frame_err)?;
        }
        self.submitted[self.current_frame] = true;

        let swapchains = [self.swapchain.handle()];
        let image_indices = [self.image_index];
        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&signal_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let present = unsafe {
            self.swapchain
                .loader()
                .queue_present(self.context.device.present_queue, &present_info)
        };
        match present {
            Ok(suboptimal) => {
                if suboptimal {
                    self.swapchain_stale = true;
                }
                Ok(())
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                self.swapchain_stale = true;
                Ok(())
            }
            Err(e) => Err(frame_err(VulkanError::Api(e))),
        }
    }

    fn require_frame(&self) -> RenderResult<()> {
        if self.in_frame {
            Ok(())
        } else {
            Err(RenderError::InvalidOperation(
                "operation is only valid between begin_frame and end_frame".to_string(),
            ))
        }
    }

    fn build_pipeline(&self, desc: &PipelineDesc) -> RenderResult<VulkanPipeline> {
        let shader = self
            .shaders
            .get(desc.shader)
            .ok_or(RenderError::ResourceNotFound { kind: "shader" })?;
        let fb = self
            .framebuffers
            .get(desc.framebuffer)
            .ok_or(RenderError::ResourceNotFound {
                kind: "framebuffer",
            })?;
        let color_count = fb
            .attachment_descs
            .iter()
            .filter(|d| !d.format.is_depth())
            .count();

        let env = PipelineEnv {
            device: self.context.raw_device(),
            instance: self.context.instance(),
            physical_device: self.context.physical_device.device,
            frames_in_flight: self.frames_in_flight,
        };
        let textures = &self.textures;
        let framebuffers = &self.framebuffers;
        let resolve = |kind: &BindingKind, frame: usize| {
            resolve_image_binding(textures, framebuffers, kind, frame)
        };

        VulkanPipeline::new(
            &env,
            desc,
            shader,
            fb.render_pass.handle(),
            vk::Extent2D {
                width: fb.size.0,
                height: fb.size.1,
            },
            color_count,
            &resolve,
        )
        .map_err(res_err)
    }

    fn resolve_copy_target(&self, handle: TextureHandle) -> RenderResult<CopyTarget> {
        match self.textures.get(handle) {
            Some(TextureEntry::Owned(t)) => Ok(CopyTarget {
                image: t.image(),
                format: t.format(),
                layout: t.layout(),
                size: (t.extent().width, t.extent().height),
                slot: LayoutSlot::Texture(handle),
            }),
            Some(TextureEntry::AttachmentView {
                framebuffer,
                attachment,
                replica,
            }) => {
                let fb = self
                    .framebuffers
                    .get(*framebuffer)
                    .ok_or(RenderError::ResourceNotFound {
                        kind: "framebuffer",
                    })?;
                match &fb.store {
                    AttachmentStore::Offscreen { frames, .. } => {
                        let t = &frames[*replica].attachments[*attachment as usize];
                        Ok(CopyTarget {
                            image: t.image(),
                            format: t.format(),
                            layout: t.layout(),
                            size: (t.extent().width, t.extent().height),
                            slot: LayoutSlot::Attachment(
                                *framebuffer,
                                *attachment as usize,
                                *replica,
                            ),
                        })
                    }
                    AttachmentStore::Swapchain { .. } => Err(RenderError::InvalidOperation(
                        "swapchain attachments cannot be copied".to_string(),
                    )),
                }
            }
            None => Err(RenderError::ResourceNotFound { kind: "texture" }),
        }
    }

    fn store_layout(&mut self, slot: &LayoutSlot, layout: vk::ImageLayout) {
        match slot {
            LayoutSlot::Texture(handle) => {
                if let Some(TextureEntry::Owned(t)) = self.textures.get_mut(*handle) {
                    t.set_layout(layout);
                }
            }
            LayoutSlot::Attachment(fb, attachment, replica) => {
                if let Some(FramebufferResource {
                    store: AttachmentStore::Offscreen { frames, .. },
                    ..
                }) = self.framebuffers.get_mut(*fb)
                {
                    frames[*replica].attachments[*attachment].set_layout(layout);
                }
            }
        }
    }
}

/// Resolve a texture binding to a view and sampler for one frame slot
fn resolve_image_binding(
    textures: &SlotMap<TextureHandle, TextureEntry>,
    framebuffers: &SlotMap<FramebufferHandle, FramebufferResource>,
    kind: &BindingKind,
    frame: usize,
) -> Option<(vk::ImageView, vk::Sampler)> {
    match kind {
        BindingKind::Texture(handle) => match textures.get(*handle)? {
            TextureEntry::Owned(t) => Some((t.view(), t.sampler()?)),
            TextureEntry::AttachmentView {
                framebuffer,
                attachment,
                replica,
            } => attachment_view(framebuffers, *framebuffer, *attachment as usize, *replica),
        },
        BindingKind::FramebufferAttachment {
            framebuffer,
            attachment,
        } => attachment_view(framebuffers, *framebuffer, *attachment as usize, frame),
        BindingKind::UniformBuffer { .. } => None,
    }
}

fn attachment_view(
    framebuffers: &SlotMap<FramebufferHandle, FramebufferResource>,
    framebuffer: FramebufferHandle,
    attachment: usize,
    replica: usize,
) -> Option<(vk::ImageView, vk::Sampler)> {
    let fb = framebuffers.get(framebuffer)?;
    match &fb.store {
        AttachmentStore::Offscreen { frames, .. } => {
            let t = frames.get(replica)?.attachments.get(attachment)?;
            Some((t.view(), t.sampler()?))
        }
        AttachmentStore::Swapchain { .. } => None,
    }
}

impl VideoBackend for VulkanBackend {
    fn api(&self) -> VideoApi {
        VideoApi::Vulkan
    }

    fn frames_in_flight(&self) -> usize {
        self.frames_in_flight
    }

    fn current_frame(&self) -> usize {
        self.current_frame
    }

    fn in_frame(&self) -> bool {
        self.in_frame
    }

    fn begin_frame(&mut self) -> RenderResult<()> {
        if self.in_frame {
            return Err(RenderError::InvalidOperation(
                "begin_frame called while a frame is already recording".to_string(),
            ));
        }

        loop {
            if self.swapchain_stale {
                self.recreate_swapchain()?;
                self.swapchain_stale = false;
            }

            // Only wait fences that a submission actually armed; a fence
            // from an abandoned frame would never signal.
            if self.submitted[self.current_frame] {
                self.frame_sync[self.current_frame]
                    .in_flight
                    .wait(u64::MAX)
                    .map_err(frame_err)?;
                self.submitted[self.current_frame] = false;
            }

            let acquire = unsafe {
                self.swapchain.loader().acquire_next_image(
                    self.swapchain.handle(),
                    u64::MAX,
                    self.frame_sync[self.current_frame].image_available.handle(),
                    vk::Fence::null(),
                )
            };
            match acquire {
                Ok((index, suboptimal)) => {
                    if suboptimal {
                        // Render this frame, rebuild before the next one.
                        self.swapchain_stale = true;
                    }
                    self.image_index = index;
                    break;
                }
                Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                    self.swapchain_stale = true;
                    continue;
                }
                Err(e) => return Err(frame_err(VulkanError::Api(e))),
            }
        }

        let device = self.context.raw_device();
        let cmd = self.command_buffer();
        unsafe {
            device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
                .map_err(VulkanError::Api)
                .map_err(frame_err)?;
            let begin_info = vk::CommandBufferBeginInfo::builder();
            device
                .begin_command_buffer(cmd, &begin_info)
                .map_err(VulkanError::Api)
                .map_err(frame_err)?;
        }

        self.in_frame = true;
        self.active_framebuffer = None;
        self.bound_pipeline = None;
        Ok(())
    }

    fn end_frame(&mut self) -> RenderResult<()> {
        self.require_frame()?;
        if self.active_framebuffer.is_some() {
            return Err(RenderError::InvalidOperation(
                "end_frame called with a framebuffer still active".to_string(),
            ));
        }

        // The slot's fence was waited in begin_frame, so its mapped memory
        // is safe to touch now.
        self.flush_updates();

        // Past this point the frame is over either way: a failed submit or
        // present abandons it, the error is reported, and the next
        // begin_frame starts clean (an unarmed fence is never waited).
        let result = self.submit_and_present();
        if let Err(e) = &result {
            log::warn!("Frame {} abandoned: {e}", self.current_frame);
        }

        drop(self.deferred.drain());

        self.current_frame = (self.current_frame + 1) % self.frames_in_flight;
        self.in_frame = false;
        result
    }

    fn request_swapchain_recreation(&mut self) {
        self.swapchain_stale = true;
    }

    fn swapchain_extent(&self) -> (u32, u32) {
        let extent = self.swapchain.extent();
        (extent.width, extent.height)
    }

    fn wait_idle(&self) {
        self.context.wait_idle();
    }

    fn default_framebuffer(&self) -> FramebufferHandle {
        self.default_framebuffer
    }

    fn create_framebuffer(
        &mut self,
        flags: FramebufferFlags,
        size: (u32, u32),
        attachments: &[AttachmentDesc],
    ) -> RenderResult<FramebufferHandle> {
        if !flags.contains(FramebufferFlags::HEADLESS) {
            return Err(RenderError::InvalidOperation(
                "only headless framebuffers can be created; the swapchain framebuffer exists from init"
                    .to_string(),
            ));
        }
        if attachments.is_empty() {
            return Err(RenderError::InvalidOperation(
                "framebuffer needs at least one attachment".to_string(),
            ));
        }

        let device = self.context.raw_device();
        let render_pass =
            RenderPass::new(device.clone(), attachments, None, false).map_err(res_err)?;

        let mut frames = Vec::with_capacity(self.frames_in_flight);
        for _ in 0..self.frames_in_flight {
            frames.push(
                OffscreenFrame::new(
                    device.clone(),
                    self.context.instance(),
                    self.context.physical_device.device,
                    render_pass.handle(),
                    size,
                    attachments,
                )
                .map_err(res_err)?,
            );
        }

        let handle = self.framebuffers.insert(FramebufferResource {
            flags,
            size,
            attachment_descs: attachments.to_vec(),
            render_pass,
            store: AttachmentStore::Offscreen {
                frames,
                views: Vec::new(),
            },
        });

        // Pre-issue one texture handle per replica per attachment so
        // attachment sampling and copies go through the ordinary table.
        let mut views = Vec::with_capacity(self.frames_in_flight);
        for replica in 0..self.frames_in_flight {
            let mut replica_views = Vec::with_capacity(attachments.len());
            for attachment in 0..attachments.len() {
                replica_views.push(self.textures.insert(TextureEntry::AttachmentView {
                    framebuffer: handle,
                    attachment: attachment as u32,
                    replica,
                }));
            }
            views.push(replica_views);
        }
        if let Some(FramebufferResource {
            store: AttachmentStore::Offscreen { views: slot, .. },
            ..
        }) = self.framebuffers.get_mut(handle)
        {
            *slot = views;
        }

        Ok(handle)
    }

    fn resize_framebuffer(
        &mut self,
        framebuffer: FramebufferHandle,
        size: (u32, u32),
    ) -> RenderResult<()> {
        self.context.wait_idle();
        self.rebuild_offscreen(framebuffer, size)
    }

    fn destroy_framebuffer(&mut self, framebuffer: FramebufferHandle) {
        if framebuffer == self.default_framebuffer {
            log::warn!("Ignoring destroy of the default framebuffer");
            return;
        }
        match self.framebuffers.remove(framebuffer) {
            Some(fb) => {
                if let AttachmentStore::Offscreen { ref views, .. } = fb.store {
                    for replica in views {
                        for &view in replica {
                            self.textures.remove(view);
                        }
                    }
                }
                if self.in_frame {
                    self.deferred
                        .push(self.current_frame, DeferredResource::Framebuffer(fb));
                }
            }
            None => log::warn!("destroy_framebuffer: stale handle"),
        }
    }

    fn framebuffer_size(&self, framebuffer: FramebufferHandle) -> RenderResult<(u32, u32)> {
        self.framebuffers
            .get(framebuffer)
            .map(|fb| fb.size)
            .ok_or(RenderError::ResourceNotFound {
                kind: "framebuffer",
            })
    }

    fn begin_framebuffer(&mut self, framebuffer: FramebufferHandle) -> RenderResult<()> {
        self.require_frame()?;
        if self.active_framebuffer.is_some() {
            return Err(RenderError::InvalidOperation(
                "render passes cannot nest".to_string(),
            ));
        }

        let device = self.context.raw_device();
        let cmd = self.command_buffer();
        let current_frame = self.current_frame;
        let image_index = self.image_index as usize;
        let clear_color = self.clear_color;

        let fb = self
            .framebuffers
            .get_mut(framebuffer)
            .ok_or(RenderError::ResourceNotFound {
                kind: "framebuffer",
            })?;

        if let AttachmentStore::Offscreen { frames, .. } = &mut fb.store {
            framebuffer::record_attachment_acquire(&device, cmd, &mut frames[current_frame]);
        }

        let clear_values = fb.clear_values(clear_color);
        let render_area = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: vk::Extent2D {
                width: fb.size.0,
                height: fb.size.1,
            },
        };
        let begin_info = vk::RenderPassBeginInfo::builder()
            .render_pass(fb.render_pass.handle())
            .framebuffer(fb.target(image_index, current_frame))
            .render_area(render_area)
            .clear_values(&clear_values);

        unsafe {
            device.cmd_begin_render_pass(cmd, &begin_info, vk::SubpassContents::INLINE);
        }

        self.active_framebuffer = Some(framebuffer);
        Ok(())
    }

    fn end_framebuffer(&mut self, framebuffer: FramebufferHandle) -> RenderResult<()> {
        self.require_frame()?;
        if self.active_framebuffer != Some(framebuffer) {
            return Err(RenderError::InvalidOperation(
                "end_framebuffer does not match the active framebuffer".to_string(),
            ));
        }

        let device = self.context.raw_device();
        let cmd = self.command_buffer();
        unsafe {
            device.cmd_end_render_pass(cmd);
        }

        let current_frame = self.current_frame;
        if let Some(FramebufferResource {
            store: AttachmentStore::Offscreen { frames, .. },
            ..
        }) = self.framebuffers.get_mut(framebuffer)
        {
            framebuffer::record_attachment_release(&device, cmd, &mut frames[current_frame]);
        }

        self.active_framebuffer = None;
        Ok(())
    }

    fn framebuffer_attachment(
        &mut self,
        framebuffer: FramebufferHandle,
        attachment: u32,
    ) -> RenderResult<TextureHandle> {
        let fb = self
            .framebuffers
            .get(framebuffer)
            .ok_or(RenderError::ResourceNotFound {
                kind: "framebuffer",
            })?;
        match &fb.store {
            AttachmentStore::Offscreen { views, .. } => views
                .get(self.current_frame)
                .and_then(|replica| replica.get(attachment as usize).copied())
                .ok_or(RenderError::ResourceNotFound { kind: "attachment" }),
            AttachmentStore::Swapchain { .. } => Err(RenderError::InvalidOperation(
                "swapchain attachments cannot be sampled".to_string(),
            )),
        }
    }

    fn create_shader(&mut self, bytes: &[u8]) -> RenderResult<ShaderHandle> {
        let shader = VulkanShader::new(self.context.raw_device(), bytes).map_err(res_err)?;
        Ok(self.shaders.insert(shader))
    }

    fn destroy_shader(&mut self, shader: ShaderHandle) {
        match self.shaders.remove(shader) {
            Some(s) => {
                if self.in_frame {
                    self.deferred
                        .push(self.current_frame, DeferredResource::Shader(s));
                }
            }
            None => log::warn!("destroy_shader: stale handle"),
        }
    }

    fn create_pipeline(&mut self, desc: &PipelineDesc) -> RenderResult<PipelineHandle> {
        let pipeline = self.build_pipeline(desc)?;
        Ok(self.pipelines.insert(pipeline))
    }

    fn recreate_pipeline(&mut self, pipeline: PipelineHandle) -> RenderResult<()> {
        let desc = self
            .pipelines
            .get(pipeline)
            .ok_or(RenderError::ResourceNotFound { kind: "pipeline" })?
            .desc
            .clone();
        let rebuilt = self.build_pipeline(&desc)?;
        self.context.wait_idle();
        if let Some(slot) = self.pipelines.get_mut(pipeline) {
            *slot = rebuilt;
        }
        Ok(())
    }

    fn destroy_pipeline(&mut self, pipeline: PipelineHandle) {
        match self.pipelines.remove(pipeline) {
            Some(p) => {
                if self.in_frame {
                    self.deferred
                        .push(self.current_frame, DeferredResource::Pipeline(p));
                }
                if self.bound_pipeline == Some(pipeline) {
                    self.bound_pipeline = None;
                }
            }
            None => log::warn!("destroy_pipeline: stale handle"),
        }
    }

    fn bind_pipeline(&mut self, pipeline: PipelineHandle) -> RenderResult<()> {
        self.require_frame()?;
        let p = self
            .pipelines
            .get(pipeline)
            .ok_or(RenderError::ResourceNotFound { kind: "pipeline" })?;
        let device = self.context.raw_device();
        unsafe {
            device.cmd_bind_pipeline(self.command_buffer(), p.bind_point(), p.pipeline);
        }
        self.bound_pipeline = Some(pipeline);
        Ok(())
    }

    fn bind_descriptor_set(
        &mut self,
        pipeline: PipelineHandle,
        set_name: &str,
        slot: u32,
    ) -> RenderResult<()> {
        self.require_frame()?;
        let p = self
            .pipelines
            .get(pipeline)
            .ok_or(RenderError::ResourceNotFound { kind: "pipeline" })?;
        let set_index = p
            .set_index(hash_name(set_name))
            .ok_or_else(|| RenderError::UnknownName(set_name.to_string()))?;
        let set = p.sets[set_index].sets[self.current_frame];

        let device = self.context.raw_device();
        unsafe {
            device.cmd_bind_descriptor_sets(
                self.command_buffer(),
                p.bind_point(),
                p.layout,
                slot,
                &[set],
                &[],
            );
        }
        Ok(())
    }

    fn update_uniform(
        &mut self,
        pipeline: PipelineHandle,
        set_name: &str,
        binding_name: &str,
        data: &[u8],
    ) -> RenderResult<()> {
        let p = self
            .pipelines
            .get(pipeline)
            .ok_or(RenderError::ResourceNotFound { kind: "pipeline" })?;
        let (set, uniform) = p
            .find_uniform(hash_name(set_name), hash_name(binding_name))
            .ok_or_else(|| {
                RenderError::UnknownName(format!("{set_name}.{binding_name}"))
            })?;

        // Fan out to every slot so the value persists whichever frame
        // executes next; each slot applies it once its fence has retired.
        self.updates.push_all(
            WriteTarget::Uniform {
                pipeline,
                set,
                uniform,
            },
            0,
            data,
        );
        Ok(())
    }

    fn create_vertex_buffer(
        &mut self,
        flags: BufferFlags,
        data: &[u8],
    ) -> RenderResult<BufferHandle> {
        let device = self.context.raw_device();
        let buffer = if flags.contains(BufferFlags::DYNAMIC) {
            let buffer = DeviceBuffer::new_mapped(
                device,
                self.context.instance(),
                self.context.physical_device.device,
                data.len().max(1) as vk::DeviceSize,
                vk::BufferUsageFlags::VERTEX_BUFFER,
            )
            .map_err(res_err)?;
            buffer.write_bytes(0, data).map_err(res_err)?;
            buffer
        } else {
            DeviceBuffer::new_device_local(
                device,
                self.context.instance(),
                self.context.physical_device.device,
                &self.command_pool,
                self.context.device.graphics_queue,
                vk::BufferUsageFlags::VERTEX_BUFFER,
                data,
            )
            .map_err(res_err)?
        };

        Ok(self.buffers.insert(GeometryBuffer {
            buffer,
            kind: BufferKind::Vertex,
            flags,
            element_count: 0,
            index_type: vk::IndexType::UINT16,
        }))
    }

    fn update_vertex_buffer(
        &mut self,
        buffer: BufferHandle,
        offset: u64,
        data: &[u8],
    ) -> RenderResult<()> {
        let entry = self
            .buffers
            .get(buffer)
            .ok_or(RenderError::ResourceNotFound { kind: "buffer" })?;
        if !entry.flags.contains(BufferFlags::DYNAMIC) {
            log::warn!("Rejecting update of a static vertex buffer");
            return Err(RenderError::InvalidOperation(
                "buffer was not created with BufferFlags::DYNAMIC".to_string(),
            ));
        }
        if offset + data.len() as u64 > entry.buffer.size() {
            return Err(RenderError::InvalidOperation(format!(
                "write of {} bytes at offset {} exceeds buffer size {}",
                data.len(),
                offset,
                entry.buffer.size()
            )));
        }

        if self.in_frame {
            self.updates.push(
                self.current_frame,
                WriteTarget::Buffer(buffer),
                offset,
                data.to_vec(),
            );
        } else {
            entry.buffer.write_bytes(offset as usize, data).map_err(frame_err)?;
        }
        Ok(())
    }

    fn create_index_buffer(
        &mut self,
        flags: BufferFlags,
        data: &[u8],
    ) -> RenderResult<BufferHandle> {
        let (index_type, index_size) = if flags.contains(BufferFlags::INDEX_32) {
            (vk::IndexType::UINT32, 4)
        } else {
            (vk::IndexType::UINT16, 2)
        };

        let buffer = DeviceBuffer::new_device_local(
            self.context.raw_device(),
            self.context.instance(),
            self.context.physical_device.device,
            &self.command_pool,
            self.context.device.graphics_queue,
            vk::BufferUsageFlags::INDEX_BUFFER,
            data,
        )
        .map_err(res_err)?;

        Ok(self.buffers.insert(GeometryBuffer {
            buffer,
            kind: BufferKind::Index,
            flags,
            element_count: (data.len() / index_size) as u32,
            index_type,
        }))
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        match self.buffers.remove(buffer) {
            Some(b) => {
                if self.in_frame {
                    self.deferred
                        .push(self.current_frame, DeferredResource::Buffer(b));
                }
            }
            None => log::warn!("destroy_buffer: stale handle"),
        }
    }

    fn bind_vertex_buffer(&mut self, buffer: BufferHandle) -> RenderResult<()> {
        self.require_frame()?;
        let entry = self
            .buffers
            .get(buffer)
            .ok_or(RenderError::ResourceNotFound { kind: "buffer" })?;
        if entry.kind != BufferKind::Vertex {
            return Err(RenderError::InvalidOperation(
                "bind_vertex_buffer called with an index buffer".to_string(),
            ));
        }
        let device = self.context.raw_device();
        unsafe {
            device.cmd_bind_vertex_buffers(
                self.command_buffer(),
                0,
                &[entry.buffer.handle()],
                &[0],
            );
        }
        Ok(())
    }

    fn bind_index_buffer(&mut self, buffer: BufferHandle) -> RenderResult<()> {
        self.require_frame()?;
        let entry = self
            .buffers
            .get(buffer)
            .ok_or(RenderError::ResourceNotFound { kind: "buffer" })?;
        if entry.kind != BufferKind::Index {
            return Err(RenderError::InvalidOperation(
                "bind_index_buffer called with a vertex buffer".to_string(),
            ));
        }
        let device = self.context.raw_device();
        unsafe {
            device.cmd_bind_index_buffer(
                self.command_buffer(),
                entry.buffer.handle(),
                0,
                entry.index_type,
            );
        }
        Ok(())
    }

    fn create_texture(
        &mut self,
        desc: &TextureDesc,
        pixels: &[u8],
    ) -> RenderResult<TextureHandle> {
        let texture = VulkanTexture::from_pixels(
            self.context.raw_device(),
            self.context.instance(),
            self.context.physical_device.device,
            &self.command_pool,
            self.context.device.graphics_queue,
            desc.width,
            desc.height,
            desc.format,
            desc.flags,
            pixels,
        )
        .map_err(res_err)?;
        Ok(self.textures.insert(TextureEntry::Owned(texture)))
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        match self.textures.get(texture) {
            Some(TextureEntry::Owned(_)) => {
                if let Some(TextureEntry::Owned(t)) = self.textures.remove(texture) {
                    if self.in_frame {
                        self.deferred
                            .push(self.current_frame, DeferredResource::Texture(t));
                    }
                }
            }
            Some(TextureEntry::AttachmentView { .. }) => {
                log::warn!("Attachment views are destroyed with their framebuffer");
            }
            None => log::warn!("destroy_texture: stale handle"),
        }
    }

    fn texture_size(&self, texture: TextureHandle) -> RenderResult<(u32, u32)> {
        let target = self.resolve_copy_target(texture)?;
        Ok(target.size)
    }

    fn copy_texture(
        &mut self,
        src: TextureHandle,
        dst: TextureHandle,
        region: &TextureRegion,
    ) -> RenderResult<()> {
        let src_target = self.resolve_copy_target(src)?;
        let dst_target = self.resolve_copy_target(dst)?;

        let (sx, sy) = region.src_offset;
        let (dx, dy) = region.dst_offset;
        let (w, h) = region.size;
        if sx < 0
            || sy < 0
            || dx < 0
            || dy < 0
            || sx as u32 + w > src_target.size.0
            || sy as u32 + h > src_target.size.1
            || dx as u32 + w > dst_target.size.0
            || dy as u32 + h > dst_target.size.1
        {
            return Err(RenderError::InvalidOperation(
                "copy region exceeds texture bounds".to_string(),
            ));
        }

        let src_aspect = vk_aspect(src_target.format);
        let dst_aspect = vk_aspect(dst_target.format);
        // Freshly created attachment replicas start undefined; leave them
        // sampleable rather than undefined afterwards.
        let src_final = if src_target.layout == vk::ImageLayout::UNDEFINED {
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        } else {
            src_target.layout
        };
        let dst_final = if dst_target.layout == vk::ImageLayout::UNDEFINED {
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        } else {
            dst_target.layout
        };

        let copy = vk::ImageCopy::builder()
            .src_subresource(vk::ImageSubresourceLayers {
                aspect_mask: src_aspect,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            })
            .src_offset(vk::Offset3D { x: sx, y: sy, z: 0 })
            .dst_subresource(vk::ImageSubresourceLayers {
                aspect_mask: dst_aspect,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            })
            .dst_offset(vk::Offset3D { x: dx, y: dy, z: 0 })
            .extent(vk::Extent3D {
                width: w,
                height: h,
                depth: 1,
            })
            .build();

        let src_image = src_target.image;
        let dst_image = dst_target.image;
        let src_layout = src_target.layout;
        let dst_layout = dst_target.layout;
        self.command_pool
            .one_time_submit(self.context.device.graphics_queue, |device, cmd| {
                texture::record_transition(
                    device,
                    cmd,
                    src_image,
                    src_aspect,
                    src_layout,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                );
                texture::record_transition(
                    device,
                    cmd,
                    dst_image,
                    dst_aspect,
                    dst_layout,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                );
                unsafe {
                    device.cmd_copy_image(
                        cmd,
                        src_image,
                        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                        dst_image,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &[copy],
                    );
                }
                texture::record_transition(
                    device,
                    cmd,
                    src_image,
                    src_aspect,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    src_final,
                );
                texture::record_transition(
                    device,
                    cmd,
                    dst_image,
                    dst_aspect,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    dst_final,
                );
            })
            .map_err(frame_err)?;

        self.store_layout(&src_target.slot, src_final);
        self.store_layout(&dst_target.slot, dst_final);
        Ok(())
    }

    fn read_texture(&mut self, texture: TextureHandle) -> RenderResult<Vec<u8>> {
        let instance = self.context.instance();
        let physical_device = self.context.physical_device.device;
        let queue = self.context.device.graphics_queue;
        let command_pool = &self.command_pool;

        match self.textures.get_mut(texture) {
            Some(TextureEntry::Owned(t)) => t
                .read_back(instance, physical_device, command_pool, queue)
                .map_err(frame_err),
            Some(TextureEntry::AttachmentView {
                framebuffer,
                attachment,
                replica,
            }) => {
                let (framebuffer, attachment, replica) = (*framebuffer, *attachment, *replica);
                match self.framebuffers.get_mut(framebuffer) {
                    Some(FramebufferResource {
                        store: AttachmentStore::Offscreen { frames, .. },
                        ..
                    }) => frames[replica].attachments[attachment as usize]
                        .read_back(instance, physical_device, command_pool, queue)
                        .map_err(frame_err),
                    _ => Err(RenderError::ResourceNotFound {
                        kind: "framebuffer",
                    }),
                }
            }
            None => Err(RenderError::ResourceNotFound { kind: "texture" }),
        }
    }

    fn draw(&mut self, vertex_count: u32, instance_count: u32) -> RenderResult<()> {
        self.require_frame()?;
        if self.active_framebuffer.is_none() {
            return Err(RenderError::InvalidOperation(
                "draw outside of a framebuffer pass".to_string(),
            ));
        }
        let device = self.context.raw_device();
        unsafe {
            device.cmd_draw(self.command_buffer(), vertex_count, instance_count.max(1), 0, 0);
        }
        Ok(())
    }

    fn draw_indexed(&mut self, index_count: u32, instance_count: u32) -> RenderResult<()> {
        self.require_frame()?;
        if self.active_framebuffer.is_none() {
            return Err(RenderError::InvalidOperation(
                "draw outside of a framebuffer pass".to_string(),
            ));
        }
        let device = self.context.raw_device();
        unsafe {
            device.cmd_draw_indexed(
                self.command_buffer(),
                index_count,
                instance_count.max(1),
                0,
                0,
                0,
            );
        }
        Ok(())
    }

    fn dispatch(&mut self, groups_x: u32, groups_y: u32, groups_z: u32) -> RenderResult<()> {
        self.require_frame()?;
        if self.active_framebuffer.is_some() {
            return Err(RenderError::InvalidOperation(
                "dispatch inside a framebuffer pass".to_string(),
            ));
        }
        let device = self.context.raw_device();
        unsafe {
            device.cmd_dispatch(self.command_buffer(), groups_x, groups_y, groups_z);
        }
        Ok(())
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        // All resources are torn down by field drop order after the GPU
        // has gone idle.
        self.context.wait_idle();
        drop(self.deferred.drain());
    }
}
