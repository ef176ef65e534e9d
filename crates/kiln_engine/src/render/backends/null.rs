//! CPU stub backend
//!
//! Implements the full [`VideoBackend`] contract against host memory: the
//! frame-in-flight lifecycle, per-frame attachment replication, the
//! dynamic/static buffer rules, uniform fan-out and deferred destruction
//! all behave exactly as specified, with pixel stores standing in for GPU
//! images. Used for headless runs, as the placeholder behind the OpenGL
//! API selection, and as the vehicle for lifecycle tests that must run
//! without a GPU.

use slotmap::SlotMap;

use crate::render::api::{
    AttachmentDesc, BindingKind, BufferFlags, BufferHandle, FramebufferFlags, FramebufferHandle,
    PipelineDesc, PipelineHandle, PixelFormat, ShaderHandle, TextureDesc, TextureHandle,
    TextureRegion, VideoApi, VideoBackend,
};
use crate::render::api::hash_name;
use crate::render::error::{RenderError, RenderResult};
use crate::render::frame::{DeferredFreeQueue, FrameUpdateQueues};
use crate::render::shader_format::{self, ShaderHeader};

/// Simulated swapchain image count for the default framebuffer
const SWAPCHAIN_IMAGES: usize = 3;

fn pack_clear_color(color: [f32; 4]) -> [u8; 4] {
    let mut out = [0u8; 4];
    for (byte, channel) in out.iter_mut().zip(color) {
        *byte = (channel.clamp(0.0, 1.0) * 255.0) as u8;
    }
    out
}

struct NullAttachment {
    format: PixelFormat,
    /// One pixel store per frame-in-flight (headless) or per swapchain
    /// image (default framebuffer)
    images: Vec<Vec<u8>>,
    /// Pre-issued view handles, one per replica (headless only)
    views: Vec<TextureHandle>,
}

struct NullFramebuffer {
    flags: FramebufferFlags,
    size: (u32, u32),
    attachments: Vec<NullAttachment>,
}

impl NullFramebuffer {
    fn headless(&self) -> bool {
        self.flags.contains(FramebufferFlags::HEADLESS)
    }

    fn allocate_images(&mut self, replicas: usize) {
        let (width, height) = self.size;
        let len = (width as usize) * (height as usize) * 4;
        for attachment in &mut self.attachments {
            attachment.images = (0..replicas).map(|_| vec![0u8; len]).collect();
        }
    }
}

enum TextureBacking {
    Owned(Vec<u8>),
    /// Sampleable view of one replica of a headless framebuffer attachment
    AttachmentView {
        framebuffer: FramebufferHandle,
        attachment: u32,
        replica: usize,
    },
}

struct NullTexture {
    size: (u32, u32),
    backing: TextureBacking,
}

struct NullBuffer {
    flags: BufferFlags,
    data: Vec<u8>,
}

struct NullUniform {
    name_hash: u64,
    /// One copy per frame-in-flight
    per_frame: Vec<Vec<u8>>,
}

struct NullSet {
    name_hash: u64,
    uniforms: Vec<NullUniform>,
    bound_slot: Option<u32>,
}

struct NullPipeline {
    desc: PipelineDesc,
    sets: Vec<NullSet>,
}

/// Tagged union of resources awaiting deferred destruction
enum NullResource {
    Texture(NullTexture),
    Framebuffer(NullFramebuffer),
    Pipeline(NullPipeline),
    Buffer(NullBuffer),
}

/// Destination of a queued host write
#[derive(Debug, Clone, PartialEq)]
enum WriteTarget {
    Buffer(BufferHandle),
    Uniform {
        pipeline: PipelineHandle,
        set: usize,
        binding: usize,
    },
}

/// The stub backend
pub struct NullBackend {
    frames_in_flight: usize,
    current_frame: usize,
    in_frame: bool,
    clear_color: [f32; 4],
    drawable_size: (u32, u32),
    recreate_requested: bool,
    default_framebuffer: FramebufferHandle,

    textures: SlotMap<TextureHandle, NullTexture>,
    buffers: SlotMap<BufferHandle, NullBuffer>,
    shaders: SlotMap<ShaderHandle, ShaderHeader>,
    framebuffers: SlotMap<FramebufferHandle, NullFramebuffer>,
    pipelines: SlotMap<PipelineHandle, NullPipeline>,

    updates: FrameUpdateQueues<WriteTarget>,
    deferred: DeferredFreeQueue<NullResource>,

    bound_pipeline: Option<PipelineHandle>,
    bound_vertex_buffer: Option<BufferHandle>,
    bound_index_buffer: Option<BufferHandle>,
    active_framebuffer: Option<FramebufferHandle>,
    draw_calls: u64,
    fail_next_submission: bool,
}

impl NullBackend {
    /// Create a stub backend with the given frame-in-flight count and
    /// simulated drawable size
    pub fn new(frames_in_flight: usize, drawable_size: (u32, u32), clear_color: [f32; 4]) -> Self {
        let mut backend = Self {
            frames_in_flight,
            current_frame: 0,
            in_frame: false,
            clear_color,
            drawable_size,
            recreate_requested: false,
            default_framebuffer: FramebufferHandle::default(),
            textures: SlotMap::with_key(),
            buffers: SlotMap::with_key(),
            shaders: SlotMap::with_key(),
            framebuffers: SlotMap::with_key(),
            pipelines: SlotMap::with_key(),
            updates: FrameUpdateQueues::new(frames_in_flight),
            deferred: DeferredFreeQueue::new(),
            bound_pipeline: None,
            bound_vertex_buffer: None,
            bound_index_buffer: None,
            active_framebuffer: None,
            draw_calls: 0,
            fail_next_submission: false,
        };

        // Default framebuffer: swapchain-backed, auto-fit, one colour
        // attachment per simulated swapchain image.
        let mut framebuffer = NullFramebuffer {
            flags: FramebufferFlags::FIT_WINDOW,
            size: drawable_size,
            attachments: vec![NullAttachment {
                format: PixelFormat::Bgra8,
                images: Vec::new(),
                views: Vec::new(),
            }],
        };
        framebuffer.allocate_images(SWAPCHAIN_IMAGES);
        backend.default_framebuffer = backend.framebuffers.insert(framebuffer);
        log::info!(
            "Initialized stub video backend ({}x{}, {} frames in flight)",
            drawable_size.0,
            drawable_size.1,
            frames_in_flight
        );
        backend
    }

    /// Change the simulated drawable size and request recreation, as a
    /// window resize would
    pub fn set_drawable_size(&mut self, size: (u32, u32)) {
        self.drawable_size = size;
        self.recreate_requested = true;
    }

    /// Pending deferred destructions (lifecycle tests)
    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    /// Draws recorded since init (lifecycle tests)
    pub fn draw_call_count(&self) -> u64 {
        self.draw_calls
    }

    /// Simulate a failed queue submission at the next end_frame
    /// (lifecycle tests)
    pub fn fail_next_submission(&mut self) {
        self.fail_next_submission = true;
    }

    /// A frame slot's stored copy of a uniform (lifecycle tests)
    pub fn uniform_data(
        &self,
        pipeline: PipelineHandle,
        set_name: &str,
        binding_name: &str,
        frame: usize,
    ) -> Option<&[u8]> {
        let pipeline = self.pipelines.get(pipeline)?;
        let set = pipeline
            .sets
            .iter()
            .find(|s| s.name_hash == hash_name(set_name))?;
        let uniform = set
            .uniforms
            .iter()
            .find(|u| u.name_hash == hash_name(binding_name))?;
        uniform.per_frame.get(frame).map(Vec::as_slice)
    }

    /// Raw contents of a buffer (lifecycle tests)
    pub fn buffer_data(&self, buffer: BufferHandle) -> Option<&[u8]> {
        self.buffers.get(buffer).map(|b| b.data.as_slice())
    }

    fn recreate_fit_framebuffers(&mut self) {
        let size = self.drawable_size;
        for (_, framebuffer) in &mut self.framebuffers {
            if framebuffer.flags.contains(FramebufferFlags::FIT_WINDOW) {
                framebuffer.size = size;
                let replicas = if framebuffer.headless() {
                    self.frames_in_flight
                } else {
                    SWAPCHAIN_IMAGES
                };
                framebuffer.allocate_images(replicas);
            }
        }
        log::debug!("Stub swapchain recreated at {}x{}", size.0, size.1);
    }

    fn flush_updates(&mut self) {
        for write in self.updates.drain(self.current_frame) {
            match write.target {
                WriteTarget::Buffer(handle) => {
                    if let Some(buffer) = self.buffers.get_mut(handle) {
                        let start = write.offset as usize;
                        let end = start + write.data.len();
                        if end <= buffer.data.len() {
                            buffer.data[start..end].copy_from_slice(&write.data);
                        } else {
                            log::error!("Queued buffer write out of bounds, dropped");
                        }
                    }
                }
                WriteTarget::Uniform {
                    pipeline,
                    set,
                    binding,
                } => {
                    if let Some(pipeline) = self.pipelines.get_mut(pipeline) {
                        if let Some(uniform) =
                            pipeline.sets.get_mut(set).and_then(|s| s.uniforms.get_mut(binding))
                        {
                            let copy = &mut uniform.per_frame[self.current_frame];
                            let len = write.data.len().min(copy.len());
                            copy[..len].copy_from_slice(&write.data[..len]);
                        }
                    }
                }
            }
        }
    }

    fn defer_or_drop(&mut self, resource: NullResource) {
        if self.in_frame {
            self.deferred.push(self.current_frame, resource);
        }
        // Otherwise drop immediately.
    }

    fn attachment_pixels_mut(
        framebuffers: &mut SlotMap<FramebufferHandle, NullFramebuffer>,
        framebuffer: FramebufferHandle,
        attachment: u32,
        replica: usize,
    ) -> RenderResult<(&mut Vec<u8>, (u32, u32))> {
        let fb = framebuffers
            .get_mut(framebuffer)
            .ok_or(RenderError::ResourceNotFound {
                kind: "framebuffer",
            })?;
        let size = fb.size;
        let store = fb
            .attachments
            .get_mut(attachment as usize)
            .and_then(|a| a.images.get_mut(replica))
            .ok_or(RenderError::ResourceNotFound { kind: "attachment" })?;
        Ok((store, size))
    }

    fn resolve_texture(&self, handle: TextureHandle) -> RenderResult<(Vec<u8>, (u32, u32))> {
        let texture = self
            .textures
            .get(handle)
            .ok_or(RenderError::ResourceNotFound { kind: "texture" })?;
        match &texture.backing {
            TextureBacking::Owned(pixels) => Ok((pixels.clone(), texture.size)),
            TextureBacking::AttachmentView {
                framebuffer,
                attachment,
                replica,
            } => {
                let fb = self
                    .framebuffers
                    .get(*framebuffer)
                    .ok_or(RenderError::ResourceNotFound {
                        kind: "framebuffer",
                    })?;
                let pixels = fb
                    .attachments
                    .get(*attachment as usize)
                    .and_then(|a| a.images.get(*replica))
                    .ok_or(RenderError::ResourceNotFound { kind: "attachment" })?;
                Ok((pixels.clone(), fb.size))
            }
        }
    }
}

impl VideoBackend for NullBackend {
    fn api(&self) -> VideoApi {
        VideoApi::Null
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
                "begin_frame while a frame is already recording".into(),
            ));
        }
        if self.recreate_requested {
            self.recreate_fit_framebuffers();
            self.recreate_requested = false;
        }
        self.in_frame = true;
        Ok(())
    }

    fn end_frame(&mut self) -> RenderResult<()> {
        if !self.in_frame {
            return Err(RenderError::InvalidOperation(
                "end_frame without begin_frame".into(),
            ));
        }
        // Flush this slot's queued writes (submission point), "present",
        // then destroy everything freed during the frame. A failed
        // submission abandons the frame; the backend stays usable.
        self.flush_updates();
        let result = if self.fail_next_submission {
            self.fail_next_submission = false;
            Err(RenderError::RenderingFailed(
                "simulated submission failure".into(),
            ))
        } else {
            Ok(())
        };
        if let Err(e) = &result {
            log::warn!("Frame {} abandoned: {e}", self.current_frame);
        }
        self.in_frame = false;
        drop(self.deferred.drain());
        self.current_frame = (self.current_frame + 1) % self.frames_in_flight;
        result
    }

    fn request_swapchain_recreation(&mut self) {
        self.recreate_requested = true;
    }

    fn swapchain_extent(&self) -> (u32, u32) {
        self.drawable_size
    }

    fn wait_idle(&self) {}

    fn default_framebuffer(&self) -> FramebufferHandle {
        self.default_framebuffer
    }

    fn create_framebuffer(
        &mut self,
        flags: FramebufferFlags,
        size: (u32, u32),
        attachments: &[AttachmentDesc],
    ) -> RenderResult<FramebufferHandle> {
        let depth_count = attachments.iter().filter(|a| a.format.is_depth()).count();
        if depth_count > 1 {
            return Err(RenderError::ResourceCreationFailed(
                "framebuffer may have at most one depth attachment".into(),
            ));
        }

        let mut framebuffer = NullFramebuffer {
            flags,
            size,
            attachments: attachments
                .iter()
                .map(|desc| NullAttachment {
                    format: desc.format,
                    images: Vec::new(),
                    views: Vec::new(),
                })
                .collect(),
        };
        let replicas = if framebuffer.headless() {
            self.frames_in_flight
        } else {
            SWAPCHAIN_IMAGES
        };
        framebuffer.allocate_images(replicas);
        let handle = self.framebuffers.insert(framebuffer);

        // Headless attachments are sampleable: issue one view handle per
        // replica up front so get_attachment never allocates.
        if flags.contains(FramebufferFlags::HEADLESS) {
            for attachment in 0..attachments.len() {
                let views: Vec<TextureHandle> = (0..replicas)
                    .map(|replica| {
                        self.textures.insert(NullTexture {
                            size,
                            backing: TextureBacking::AttachmentView {
                                framebuffer: handle,
                                attachment: attachment as u32,
                                replica,
                            },
                        })
                    })
                    .collect();
                self.framebuffers[handle].attachments[attachment].views = views;
            }
        }
        Ok(handle)
    }

    fn resize_framebuffer(
        &mut self,
        framebuffer: FramebufferHandle,
        size: (u32, u32),
    ) -> RenderResult<()> {
        let frames_in_flight = self.frames_in_flight;
        let fb = self
            .framebuffers
            .get_mut(framebuffer)
            .ok_or(RenderError::ResourceNotFound {
                kind: "framebuffer",
            })?;
        if !fb.headless() {
            return Err(RenderError::InvalidOperation(
                "cannot resize the swapchain-backed framebuffer directly".into(),
            ));
        }
        fb.size = size;
        fb.allocate_images(frames_in_flight);
        // View handles keep their identity; they index into the new stores.
        for attachment in &mut fb.attachments {
            for view in &attachment.views.clone() {
                if let Some(texture) = self.textures.get_mut(*view) {
                    texture.size = size;
                }
            }
        }
        Ok(())
    }

    fn destroy_framebuffer(&mut self, framebuffer: FramebufferHandle) {
        if framebuffer == self.default_framebuffer {
            log::error!("Refusing to destroy the default framebuffer");
            return;
        }
        match self.framebuffers.remove(framebuffer) {
            Some(fb) => {
                for attachment in &fb.attachments {
                    for view in &attachment.views {
                        self.textures.remove(*view);
                    }
                }
                self.defer_or_drop(NullResource::Framebuffer(fb));
            }
            None => log::error!("destroy_framebuffer: stale handle"),
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
        if !self.in_frame {
            return Err(RenderError::InvalidOperation(
                "begin_framebuffer outside a frame".into(),
            ));
        }
        let current_frame = self.current_frame;
        let clear = pack_clear_color(self.clear_color);
        let fb = self
            .framebuffers
            .get_mut(framebuffer)
            .ok_or(RenderError::ResourceNotFound {
                kind: "framebuffer",
            })?;
        // Clear the replica this frame renders to; the default framebuffer
        // models the acquired swapchain image with the frame index.
        let replica = if fb.headless() {
            current_frame
        } else {
            current_frame % SWAPCHAIN_IMAGES
        };
        for attachment in &mut fb.attachments {
            if attachment.format.is_depth() {
                continue;
            }
            if let Some(image) = attachment.images.get_mut(replica) {
                for pixel in image.chunks_exact_mut(4) {
                    pixel.copy_from_slice(&clear);
                }
            }
        }
        self.active_framebuffer = Some(framebuffer);
        Ok(())
    }

    fn end_framebuffer(&mut self, framebuffer: FramebufferHandle) -> RenderResult<()> {
        if self.active_framebuffer != Some(framebuffer) {
            return Err(RenderError::InvalidOperation(
                "end_framebuffer does not match the active framebuffer".into(),
            ));
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
        if !fb.headless() {
            return Err(RenderError::InvalidOperation(
                "default framebuffer attachments are not sampleable".into(),
            ));
        }
        fb.attachments
            .get(attachment as usize)
            .and_then(|a| a.views.get(self.current_frame))
            .copied()
            .ok_or(RenderError::ResourceNotFound { kind: "attachment" })
    }

    fn create_shader(&mut self, bytes: &[u8]) -> RenderResult<ShaderHandle> {
        let header = shader_format::decode(bytes)
            .map_err(|e| RenderError::ResourceCreationFailed(e.to_string()))?;
        Ok(self.shaders.insert(header))
    }

    fn destroy_shader(&mut self, shader: ShaderHandle) {
        if self.shaders.remove(shader).is_none() {
            log::error!("destroy_shader: stale handle");
        }
    }

    fn create_pipeline(&mut self, desc: &PipelineDesc) -> RenderResult<PipelineHandle> {
        if !self.shaders.contains_key(desc.shader) {
            return Err(RenderError::ResourceNotFound { kind: "shader" });
        }
        let is_compute = self.shaders[desc.shader].is_compute();
        if !is_compute && !self.framebuffers.contains_key(desc.framebuffer) {
            return Err(RenderError::ResourceNotFound {
                kind: "framebuffer",
            });
        }

        let sets = desc
            .sets
            .iter()
            .map(|set| NullSet {
                name_hash: hash_name(&set.name),
                bound_slot: None,
                uniforms: set
                    .bindings
                    .iter()
                    .filter_map(|binding| match binding.kind {
                        BindingKind::UniformBuffer { size } => Some(NullUniform {
                            name_hash: hash_name(&binding.name),
                            per_frame: (0..self.frames_in_flight)
                                .map(|_| vec![0u8; size as usize])
                                .collect(),
                        }),
                        _ => None,
                    })
                    .collect(),
            })
            .collect();

        Ok(self.pipelines.insert(NullPipeline {
            desc: desc.clone(),
            sets,
        }))
    }

    fn recreate_pipeline(&mut self, pipeline: PipelineHandle) -> RenderResult<()> {
        // Rebuild from the stored description; uniform contents reset as
        // the backing stores are recreated.
        let desc = self
            .pipelines
            .get(pipeline)
            .map(|p| p.desc.clone())
            .ok_or(RenderError::ResourceNotFound { kind: "pipeline" })?;
        let rebuilt = self.create_pipeline(&desc)?;
        let rebuilt = self.pipelines.remove(rebuilt).expect("just inserted");
        self.pipelines[pipeline] = rebuilt;
        Ok(())
    }

    fn destroy_pipeline(&mut self, pipeline: PipelineHandle) {
        match self.pipelines.remove(pipeline) {
            Some(p) => self.defer_or_drop(NullResource::Pipeline(p)),
            None => log::error!("destroy_pipeline: stale handle"),
        }
        if self.bound_pipeline == Some(pipeline) {
            self.bound_pipeline = None;
        }
    }

    fn bind_pipeline(&mut self, pipeline: PipelineHandle) -> RenderResult<()> {
        if !self.pipelines.contains_key(pipeline) {
            return Err(RenderError::ResourceNotFound { kind: "pipeline" });
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
        let p = self
            .pipelines
            .get_mut(pipeline)
            .ok_or(RenderError::ResourceNotFound { kind: "pipeline" })?;
        let hash = hash_name(set_name);
        match p.sets.iter_mut().find(|s| s.name_hash == hash) {
            Some(set) => {
                set.bound_slot = Some(slot);
                Ok(())
            }
            None => {
                log::error!("bind_descriptor_set: unknown set '{}'", set_name);
                Err(RenderError::UnknownName(set_name.to_string()))
            }
        }
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
        let set_hash = hash_name(set_name);
        let binding_hash = hash_name(binding_name);
        let Some((set_index, set)) = p
            .sets
            .iter()
            .enumerate()
            .find(|(_, s)| s.name_hash == set_hash)
        else {
            log::error!("update_uniform: unknown set '{}'", set_name);
            return Err(RenderError::UnknownName(set_name.to_string()));
        };
        let Some(binding_index) = set
            .uniforms
            .iter()
            .position(|u| u.name_hash == binding_hash)
        else {
            log::error!("update_uniform: unknown uniform '{}'", binding_name);
            return Err(RenderError::UnknownName(binding_name.to_string()));
        };

        // Fan out to every slot: the value applies going forward.
        self.updates.push_all(
            WriteTarget::Uniform {
                pipeline,
                set: set_index,
                binding: binding_index,
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
        Ok(self.buffers.insert(NullBuffer {
            flags,
            data: data.to_vec(),
        }))
    }

    fn update_vertex_buffer(
        &mut self,
        buffer: BufferHandle,
        offset: u64,
        data: &[u8],
    ) -> RenderResult<()> {
        let b = self
            .buffers
            .get(buffer)
            .ok_or(RenderError::ResourceNotFound { kind: "buffer" })?;
        if !b.flags.contains(BufferFlags::DYNAMIC) {
            log::error!("update_vertex_buffer on a static buffer");
            return Err(RenderError::InvalidOperation(
                "buffer was not created with BufferFlags::DYNAMIC".into(),
            ));
        }
        self.updates.push(
            self.current_frame,
            WriteTarget::Buffer(buffer),
            offset,
            data.to_vec(),
        );
        Ok(())
    }

    fn create_index_buffer(
        &mut self,
        flags: BufferFlags,
        data: &[u8],
    ) -> RenderResult<BufferHandle> {
        // Index buffers are always static uploads.
        Ok(self.buffers.insert(NullBuffer {
            flags: flags & !BufferFlags::DYNAMIC,
            data: data.to_vec(),
        }))
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        match self.buffers.remove(buffer) {
            Some(b) => self.defer_or_drop(NullResource::Buffer(b)),
            None => log::error!("destroy_buffer: stale handle"),
        }
    }

    fn bind_vertex_buffer(&mut self, buffer: BufferHandle) -> RenderResult<()> {
        if !self.buffers.contains_key(buffer) {
            return Err(RenderError::ResourceNotFound { kind: "buffer" });
        }
        self.bound_vertex_buffer = Some(buffer);
        Ok(())
    }

    fn bind_index_buffer(&mut self, buffer: BufferHandle) -> RenderResult<()> {
        if !self.buffers.contains_key(buffer) {
            return Err(RenderError::ResourceNotFound { kind: "buffer" });
        }
        self.bound_index_buffer = Some(buffer);
        Ok(())
    }

    fn create_texture(&mut self, desc: &TextureDesc, pixels: &[u8]) -> RenderResult<TextureHandle> {
        let expected = desc.width as usize * desc.height as usize * desc.format.bytes_per_pixel();
        if pixels.len() != expected {
            return Err(RenderError::ResourceCreationFailed(format!(
                "texture data is {} bytes, expected {}",
                pixels.len(),
                expected
            )));
        }
        Ok(self.textures.insert(NullTexture {
            size: (desc.width, desc.height),
            backing: TextureBacking::Owned(pixels.to_vec()),
        }))
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        match self.textures.remove(texture) {
            Some(t) => self.defer_or_drop(NullResource::Texture(t)),
            None => log::error!("destroy_texture: stale handle"),
        }
    }

    fn texture_size(&self, texture: TextureHandle) -> RenderResult<(u32, u32)> {
        let t = self
            .textures
            .get(texture)
            .ok_or(RenderError::ResourceNotFound { kind: "texture" })?;
        match &t.backing {
            TextureBacking::Owned(_) => Ok(t.size),
            TextureBacking::AttachmentView { framebuffer, .. } => {
                self.framebuffer_size(*framebuffer)
            }
        }
    }

    fn copy_texture(
        &mut self,
        src: TextureHandle,
        dst: TextureHandle,
        region: &TextureRegion,
    ) -> RenderResult<()> {
        let (src_pixels, src_size) = self.resolve_texture(src)?;
        let (width, height) = region.size;
        if region.src_offset.0 < 0
            || region.src_offset.1 < 0
            || region.dst_offset.0 < 0
            || region.dst_offset.1 < 0
        {
            return Err(RenderError::InvalidOperation(
                "copy region exceeds texture bounds".into(),
            ));
        }

        enum DstBacking {
            Owned((u32, u32)),
            View(FramebufferHandle, u32, usize),
        }
        let dst_backing = {
            let t = self
                .textures
                .get(dst)
                .ok_or(RenderError::ResourceNotFound { kind: "texture" })?;
            match &t.backing {
                TextureBacking::Owned(_) => DstBacking::Owned(t.size),
                TextureBacking::AttachmentView {
                    framebuffer,
                    attachment,
                    replica,
                } => DstBacking::View(*framebuffer, *attachment, *replica),
            }
        };
        let copy_rows = |dst_pixels: &mut Vec<u8>, dst_size: (u32, u32)| -> RenderResult<()> {
            for row in 0..height {
                let sx = region.src_offset.0 as u32;
                let sy = region.src_offset.1 as u32 + row;
                let dx = region.dst_offset.0 as u32;
                let dy = region.dst_offset.1 as u32 + row;
                if sx + width > src_size.0
                    || sy >= src_size.1
                    || dx + width > dst_size.0
                    || dy >= dst_size.1
                {
                    return Err(RenderError::InvalidOperation(
                        "texture copy region out of bounds".into(),
                    ));
                }
                let src_start = ((sy * src_size.0 + sx) * 4) as usize;
                let dst_start = ((dy * dst_size.0 + dx) * 4) as usize;
                let len = (width * 4) as usize;
                let src_row = src_pixels[src_start..src_start + len].to_vec();
                dst_pixels[dst_start..dst_start + len].copy_from_slice(&src_row);
            }
            Ok(())
        };

        match dst_backing {
            DstBacking::Owned(dst_size) => {
                let Some(NullTexture {
                    backing: TextureBacking::Owned(pixels),
                    ..
                }) = self.textures.get_mut(dst)
                else {
                    unreachable!()
                };
                copy_rows(pixels, dst_size)
            }
            DstBacking::View(framebuffer, attachment, replica) => {
                let (pixels, size) = Self::attachment_pixels_mut(
                    &mut self.framebuffers,
                    framebuffer,
                    attachment,
                    replica,
                )?;
                copy_rows(pixels, size)
            }
        }
    }

    fn read_texture(&mut self, texture: TextureHandle) -> RenderResult<Vec<u8>> {
        self.resolve_texture(texture).map(|(pixels, _)| pixels)
    }

    fn draw(&mut self, _vertex_count: u32, _instance_count: u32) -> RenderResult<()> {
        if !self.in_frame || self.bound_pipeline.is_none() {
            return Err(RenderError::InvalidOperation(
                "draw requires an active frame and a bound pipeline".into(),
            ));
        }
        self.draw_calls += 1;
        Ok(())
    }

    fn draw_indexed(&mut self, _index_count: u32, _instance_count: u32) -> RenderResult<()> {
        if !self.in_frame
            || self.bound_pipeline.is_none()
            || self.bound_index_buffer.is_none()
        {
            return Err(RenderError::InvalidOperation(
                "draw_indexed requires an active frame, pipeline and index buffer".into(),
            ));
        }
        self.draw_calls += 1;
        Ok(())
    }

    fn dispatch(&mut self, _x: u32, _y: u32, _z: u32) -> RenderResult<()> {
        if !self.in_frame || self.bound_pipeline.is_none() {
            return Err(RenderError::InvalidOperation(
                "dispatch requires an active frame and a bound pipeline".into(),
            ));
        }
        self.draw_calls += 1;
        Ok(())
    }
}
