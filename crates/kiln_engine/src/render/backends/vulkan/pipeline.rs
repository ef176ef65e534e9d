//! Pipeline and descriptor set management
//!
//! Each pipeline owns its descriptor pool, per-set layouts, one concrete
//! descriptor set per logical set per frame in flight, and the
//! persistently-mapped uniform buffers those sets point at. Descriptor
//! identities are resolved by FNV-1a name hash, matching the shader
//! binary's bind table.

use ash::{vk, Device, Instance};
use std::ffi::CString;
use std::io::Cursor;

use super::buffer::DeviceBuffer;
use super::context::{VulkanError, VulkanResult};
use crate::render::api::{
    hash_name, BindingDesc, BindingKind, PipelineDesc, PipelineFlags, PrimitiveTopology,
    ShaderStages, VertexAttributeType, VertexInputRate,
};
use crate::render::shader_format::{self, ShaderSpans};

/// Shader modules for one pipeline kind
pub enum ShaderModules {
    /// Vertex + fragment pair
    Raster {
        /// Vertex stage module
        vert: vk::ShaderModule,
        /// Fragment stage module
        frag: vk::ShaderModule,
    },
    /// Single compute module
    Compute(vk::ShaderModule),
}

/// Compiled shader modules with RAII cleanup
pub struct VulkanShader {
    device: Device,
    modules: ShaderModules,
}

impl VulkanShader {
    /// Decode a shader binary and create modules from its SPIR-V spans
    pub fn new(device: Device, bytes: &[u8]) -> VulkanResult<Self> {
        let header = shader_format::decode(bytes).map_err(|e| VulkanError::InvalidOperation {
            reason: e.to_string(),
        })?;

        let modules = match header.spans {
            ShaderSpans::Raster(spans) => {
                let vert = create_module(&device, spans.vert_spv.slice(bytes).unwrap())?;
                let frag = match create_module(&device, spans.frag_spv.slice(bytes).unwrap()) {
                    Ok(frag) => frag,
                    Err(e) => {
                        unsafe { device.destroy_shader_module(vert, None) };
                        return Err(e);
                    }
                };
                ShaderModules::Raster { vert, frag }
            }
            ShaderSpans::Compute(spans) => {
                ShaderModules::Compute(create_module(&device, spans.spv.slice(bytes).unwrap())?)
            }
        };

        Ok(Self { device, modules })
    }

    /// Whether this is a compute shader
    pub fn is_compute(&self) -> bool {
        matches!(self.modules, ShaderModules::Compute(_))
    }

    /// Access the modules
    pub fn modules(&self) -> &ShaderModules {
        &self.modules
    }
}

impl Drop for VulkanShader {
    fn drop(&mut self) {
        unsafe {
            match self.modules {
                ShaderModules::Raster { vert, frag } => {
                    self.device.destroy_shader_module(vert, None);
                    self.device.destroy_shader_module(frag, None);
                }
                ShaderModules::Compute(module) => {
                    self.device.destroy_shader_module(module, None);
                }
            }
        }
    }
}

fn create_module(device: &Device, spv: &[u8]) -> VulkanResult<vk::ShaderModule> {
    let words = ash::util::read_spv(&mut Cursor::new(spv)).map_err(|e| {
        VulkanError::InvalidOperation {
            reason: format!("invalid SPIR-V: {e}"),
        }
    })?;
    let create_info = vk::ShaderModuleCreateInfo::builder().code(&words);
    unsafe {
        device
            .create_shader_module(&create_info, None)
            .map_err(VulkanError::Api)
    }
}

/// One uniform-buffer binding's per-frame backing stores
pub struct UniformBinding {
    /// Binding slot within the set
    pub binding: u32,
    /// Hash of the binding name
    pub name_hash: u64,
    /// Uniform block size in bytes
    pub size: u64,
    /// Persistently-mapped buffer per frame in flight
    pub buffers: Vec<DeviceBuffer>,
}

/// One logical descriptor set instantiated per frame in flight
pub struct PipelineSet {
    /// Hash of the set name
    pub name_hash: u64,
    /// Set layout, owned by this set
    pub layout: vk::DescriptorSetLayout,
    /// Concrete descriptor set per frame in flight
    pub sets: Vec<vk::DescriptorSet>,
    /// Uniform-buffer bindings with their backing stores
    pub uniforms: Vec<UniformBinding>,
}

/// Shared construction context for pipeline creation
pub struct PipelineEnv<'a> {
    /// Logical device
    pub device: Device,
    /// Instance, for memory-type queries
    pub instance: &'a Instance,
    /// Physical device, for memory-type queries
    pub physical_device: vk::PhysicalDevice,
    /// Frames in flight, sizing the per-frame replication
    pub frames_in_flight: usize,
}

/// A compiled pipeline plus everything its descriptors point at
pub struct VulkanPipeline {
    device: Device,
    /// The creation description, kept verbatim for in-place recreation
    pub desc: PipelineDesc,
    /// Pipeline handle
    pub pipeline: vk::Pipeline,
    /// Pipeline layout
    pub layout: vk::PipelineLayout,
    /// Descriptor pool all this pipeline's sets come from
    pub pool: vk::DescriptorPool,
    /// Logical sets, in layout slot order
    pub sets: Vec<PipelineSet>,
    /// Whether this is a compute pipeline
    pub is_compute: bool,
}

impl VulkanPipeline {
    /// Compile a pipeline and build its descriptor state
    ///
    /// `resolve_image` maps a texture or framebuffer-attachment binding to
    /// the view and sampler for the given frame-in-flight slot; the
    /// backend resolves through its resource tables.
    pub fn new(
        env: &PipelineEnv<'_>,
        desc: &PipelineDesc,
        shader: &VulkanShader,
        render_pass: vk::RenderPass,
        extent: vk::Extent2D,
        color_attachment_count: usize,
        resolve_image: &dyn Fn(&BindingKind, usize) -> Option<(vk::ImageView, vk::Sampler)>,
    ) -> VulkanResult<Self> {
        let device = env.device.clone();
        let is_compute = shader.is_compute();

        // Built up field by field so that if a later step fails, Drop
        // releases whatever already exists (destroying a null handle is a
        // no-op, and the uniform buffers clean themselves up).
        let mut pipeline = Self {
            device: device.clone(),
            desc: desc.clone(),
            pipeline: vk::Pipeline::null(),
            layout: vk::PipelineLayout::null(),
            pool: vk::DescriptorPool::null(),
            sets: Vec::with_capacity(desc.sets.len()),
            is_compute,
        };

        for set_desc in &desc.sets {
            let mut uniforms = Vec::new();
            for (binding, binding_desc) in set_desc.bindings.iter().enumerate() {
                if let BindingKind::UniformBuffer { size } = binding_desc.kind {
                    let mut buffers = Vec::with_capacity(env.frames_in_flight);
                    for _ in 0..env.frames_in_flight {
                        buffers.push(DeviceBuffer::new_mapped(
                            device.clone(),
                            env.instance,
                            env.physical_device,
                            size.max(1),
                            vk::BufferUsageFlags::UNIFORM_BUFFER,
                        )?);
                    }
                    uniforms.push(UniformBinding {
                        binding: binding as u32,
                        name_hash: hash_name(&binding_desc.name),
                        size,
                        buffers,
                    });
                }
            }

            let layout = create_set_layout(&device, &set_desc.bindings)?;
            pipeline.sets.push(PipelineSet {
                name_hash: hash_name(&set_desc.name),
                layout,
                sets: Vec::new(),
                uniforms,
            });
        }

        let set_layouts: Vec<_> = pipeline.sets.iter().map(|s| s.layout).collect();
        let layout_create_info =
            vk::PipelineLayoutCreateInfo::builder().set_layouts(&set_layouts);
        pipeline.layout = unsafe {
            device
                .create_pipeline_layout(&layout_create_info, None)
                .map_err(VulkanError::Api)?
        };

        // One pool sized for every set replicated per frame in flight.
        let (uniform_count, sampler_count) = desc.descriptor_counts();
        let frames = env.frames_in_flight as u32;
        let mut pool_sizes = Vec::new();
        if uniform_count > 0 {
            pool_sizes.push(vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: uniform_count * frames,
            });
        }
        if sampler_count > 0 {
            pool_sizes.push(vk::DescriptorPoolSize {
                ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                descriptor_count: sampler_count * frames,
            });
        }

        if !desc.sets.is_empty() {
            let pool_create_info = vk::DescriptorPoolCreateInfo::builder()
                .pool_sizes(&pool_sizes)
                .max_sets(desc.sets.len() as u32 * frames);
            pipeline.pool = unsafe {
                device
                    .create_descriptor_pool(&pool_create_info, None)
                    .map_err(VulkanError::Api)?
            };
        }

        for (set_index, set) in pipeline.sets.iter_mut().enumerate() {
            let layouts = vec![set.layout; env.frames_in_flight];
            let alloc_info = vk::DescriptorSetAllocateInfo::builder()
                .descriptor_pool(pipeline.pool)
                .set_layouts(&layouts);
            set.sets = unsafe {
                device
                    .allocate_descriptor_sets(&alloc_info)
                    .map_err(VulkanError::Api)?
            };

            for frame in 0..env.frames_in_flight {
                write_set(
                    &device,
                    set.sets[frame],
                    &desc.sets[set_index].bindings,
                    &set.uniforms,
                    frame,
                    resolve_image,
                )?;
            }
        }

        pipeline.pipeline = if is_compute {
            create_compute_pipeline(&device, shader, pipeline.layout)?
        } else {
            create_graphics_pipeline(
                &device,
                desc,
                shader,
                pipeline.layout,
                render_pass,
                extent,
                color_attachment_count,
            )?
        };

        Ok(pipeline)
    }

    /// Index of the logical set with the given name hash
    pub fn set_index(&self, set_hash: u64) -> Option<usize> {
        self.sets.iter().position(|s| s.name_hash == set_hash)
    }

    /// Locate a uniform binding as `(set_index, uniform_index)`
    pub fn find_uniform(&self, set_hash: u64, binding_hash: u64) -> Option<(usize, usize)> {
        let set_index = self.set_index(set_hash)?;
        let uniform_index = self.sets[set_index]
            .uniforms
            .iter()
            .position(|u| u.name_hash == binding_hash)?;
        Some((set_index, uniform_index))
    }

    /// Write into one frame's backing store for a uniform binding
    pub fn write_uniform(
        &self,
        set_index: usize,
        uniform_index: usize,
        frame: usize,
        offset: usize,
        data: &[u8],
    ) -> VulkanResult<()> {
        self.sets[set_index].uniforms[uniform_index].buffers[frame].write_bytes(offset, data)
    }

    /// Bind point for command recording
    pub fn bind_point(&self) -> vk::PipelineBindPoint {
        if self.is_compute {
            vk::PipelineBindPoint::COMPUTE
        } else {
            vk::PipelineBindPoint::GRAPHICS
        }
    }
}

impl Drop for VulkanPipeline {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_pipeline(self.pipeline, None);
            self.device.destroy_pipeline_layout(self.layout, None);
            for set in &self.sets {
                self.device.destroy_descriptor_set_layout(set.layout, None);
            }
            if self.pool != vk::DescriptorPool::null() {
                self.device.destroy_descriptor_pool(self.pool, None);
            }
        }
    }
}

fn vk_stages(stages: ShaderStages) -> vk::ShaderStageFlags {
    let mut out = vk::ShaderStageFlags::empty();
    if stages.contains(ShaderStages::VERTEX) {
        out |= vk::ShaderStageFlags::VERTEX;
    }
    if stages.contains(ShaderStages::FRAGMENT) {
        out |= vk::ShaderStageFlags::FRAGMENT;
    }
    if stages.contains(ShaderStages::COMPUTE) {
        out |= vk::ShaderStageFlags::COMPUTE;
    }
    out
}

fn create_set_layout(
    device: &Device,
    bindings: &[BindingDesc],
) -> VulkanResult<vk::DescriptorSetLayout> {
    let layout_bindings: Vec<vk::DescriptorSetLayoutBinding> = bindings
        .iter()
        .enumerate()
        .map(|(index, binding)| {
            let ty = match binding.kind {
                BindingKind::UniformBuffer { .. } => vk::DescriptorType::UNIFORM_BUFFER,
                BindingKind::Texture(_) | BindingKind::FramebufferAttachment { .. } => {
                    vk::DescriptorType::COMBINED_IMAGE_SAMPLER
                }
            };
            vk::DescriptorSetLayoutBinding::builder()
                .binding(index as u32)
                .descriptor_type(ty)
                .descriptor_count(1)
                .stage_flags(vk_stages(binding.stages))
                .build()
        })
        .collect();

    let create_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&layout_bindings);
    unsafe {
        device
            .create_descriptor_set_layout(&create_info, None)
            .map_err(VulkanError::Api)
    }
}

fn write_set(
    device: &Device,
    set: vk::DescriptorSet,
    bindings: &[BindingDesc],
    uniforms: &[UniformBinding],
    frame: usize,
    resolve_image: &dyn Fn(&BindingKind, usize) -> Option<(vk::ImageView, vk::Sampler)>,
) -> VulkanResult<()> {
    // Info structs must outlive the write list.
    let mut buffer_infos = Vec::new();
    let mut image_infos = Vec::new();
    enum Pending {
        Buffer(u32, usize),
        Image(u32, usize),
    }
    let mut pending = Vec::with_capacity(bindings.len());

    for (index, binding) in bindings.iter().enumerate() {
        match &binding.kind {
            BindingKind::UniformBuffer { size } => {
                let uniform = uniforms
                    .iter()
                    .find(|u| u.binding == index as u32)
                    .ok_or_else(|| VulkanError::InvalidOperation {
                        reason: format!("no backing store for uniform '{}'", binding.name),
                    })?;
                buffer_infos.push(vk::DescriptorBufferInfo {
                    buffer: uniform.buffers[frame].handle(),
                    offset: 0,
                    range: (*size).max(1),
                });
                pending.push(Pending::Buffer(index as u32, buffer_infos.len() - 1));
            }
            kind => {
                let (view, sampler) =
                    resolve_image(kind, frame).ok_or_else(|| VulkanError::InvalidOperation {
                        reason: format!("binding '{}' references a missing texture", binding.name),
                    })?;
                image_infos.push(vk::DescriptorImageInfo {
                    sampler,
                    image_view: view,
                    image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                });
                pending.push(Pending::Image(index as u32, image_infos.len() - 1));
            }
        }
    }

    let writes: Vec<vk::WriteDescriptorSet> = pending
        .iter()
        .map(|p| match *p {
            Pending::Buffer(binding, info) => vk::WriteDescriptorSet::builder()
                .dst_set(set)
                .dst_binding(binding)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                .buffer_info(std::slice::from_ref(&buffer_infos[info]))
                .build(),
            Pending::Image(binding, info) => vk::WriteDescriptorSet::builder()
                .dst_set(set)
                .dst_binding(binding)
                .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .image_info(std::slice::from_ref(&image_infos[info]))
                .build(),
        })
        .collect();

    unsafe {
        device.update_descriptor_sets(&writes, &[]);
    }
    Ok(())
}

fn vk_attribute_format(ty: VertexAttributeType) -> vk::Format {
    match ty {
        VertexAttributeType::F32 => vk::Format::R32_SFLOAT,
        VertexAttributeType::Vec2 => vk::Format::R32G32_SFLOAT,
        VertexAttributeType::Vec3 => vk::Format::R32G32B32_SFLOAT,
        VertexAttributeType::Vec4 => vk::Format::R32G32B32A32_SFLOAT,
    }
}

fn vk_topology(topology: PrimitiveTopology) -> vk::PrimitiveTopology {
    match topology {
        PrimitiveTopology::TriangleList => vk::PrimitiveTopology::TRIANGLE_LIST,
        PrimitiveTopology::TriangleStrip => vk::PrimitiveTopology::TRIANGLE_STRIP,
        PrimitiveTopology::LineList => vk::PrimitiveTopology::LINE_LIST,
        PrimitiveTopology::PointList => vk::PrimitiveTopology::POINT_LIST,
    }
}

fn create_compute_pipeline(
    device: &Device,
    shader: &VulkanShader,
    layout: vk::PipelineLayout,
) -> VulkanResult<vk::Pipeline> {
    let module = match shader.modules() {
        ShaderModules::Compute(module) => *module,
        ShaderModules::Raster { .. } => {
            return Err(VulkanError::InvalidOperation {
                reason: "raster shader used for a compute pipeline".to_string(),
            })
        }
    };

    let entry = CString::new("main").unwrap();
    let stage = vk::PipelineShaderStageCreateInfo::builder()
        .stage(vk::ShaderStageFlags::COMPUTE)
        .module(module)
        .name(&entry)
        .build();

    let create_info = vk::ComputePipelineCreateInfo::builder()
        .stage(stage)
        .layout(layout);

    let pipelines = unsafe {
        device
            .create_compute_pipelines(vk::PipelineCache::null(), &[create_info.build()], None)
            .map_err(|(_, e)| VulkanError::Api(e))?
    };
    Ok(pipelines[0])
}

fn create_graphics_pipeline(
    device: &Device,
    desc: &PipelineDesc,
    shader: &VulkanShader,
    layout: vk::PipelineLayout,
    render_pass: vk::RenderPass,
    extent: vk::Extent2D,
    color_attachment_count: usize,
) -> VulkanResult<vk::Pipeline> {
    let (vert, frag) = match shader.modules() {
        ShaderModules::Raster { vert, frag } => (*vert, *frag),
        ShaderModules::Compute(_) => {
            return Err(VulkanError::InvalidOperation {
                reason: "compute shader used for a graphics pipeline".to_string(),
            })
        }
    };

    let entry = CString::new("main").unwrap();
    let stages = [
        vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::VERTEX)
            .module(vert)
            .name(&entry)
            .build(),
        vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::FRAGMENT)
            .module(frag)
            .name(&entry)
            .build(),
    ];

    let mut binding_descriptions = Vec::new();
    let mut attribute_descriptions = Vec::new();
    if let Some(ref vertex_layout) = desc.vertex_layout {
        binding_descriptions.push(
            vk::VertexInputBindingDescription::builder()
                .binding(0)
                .stride(vertex_layout.stride)
                .input_rate(match vertex_layout.rate {
                    VertexInputRate::Vertex => vk::VertexInputRate::VERTEX,
                    VertexInputRate::Instance => vk::VertexInputRate::INSTANCE,
                })
                .build(),
        );
        for attribute in &vertex_layout.attributes {
            attribute_descriptions.push(
                vk::VertexInputAttributeDescription::builder()
                    .binding(0)
                    .location(attribute.location)
                    .format(vk_attribute_format(attribute.ty))
                    .offset(attribute.offset)
                    .build(),
            );
        }
    }
    let vertex_input = vk::PipelineVertexInputStateCreateInfo::builder()
        .vertex_binding_descriptions(&binding_descriptions)
        .vertex_attribute_descriptions(&attribute_descriptions);

    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
        .topology(vk_topology(desc.topology))
        .primitive_restart_enable(false);

    let viewports = [vk::Viewport {
        x: 0.0,
        y: 0.0,
        width: extent.width as f32,
        height: extent.height as f32,
        min_depth: 0.0,
        max_depth: 1.0,
    }];
    let scissors = [vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent,
    }];
    let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
        .viewports(&viewports)
        .scissors(&scissors);

    let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
        .depth_clamp_enable(false)
        .rasterizer_discard_enable(false)
        .polygon_mode(vk::PolygonMode::FILL)
        .line_width(1.0)
        .cull_mode(if desc.flags.contains(PipelineFlags::CULL_BACK) {
            vk::CullModeFlags::BACK
        } else {
            vk::CullModeFlags::NONE
        })
        .front_face(if desc.flags.contains(PipelineFlags::FRONT_FACE_CW) {
            vk::FrontFace::CLOCKWISE
        } else {
            vk::FrontFace::COUNTER_CLOCKWISE
        })
        .depth_bias_enable(false);

    let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
        .sample_shading_enable(false)
        .rasterization_samples(vk::SampleCountFlags::TYPE_1);

    let depth_enabled = desc.flags.contains(PipelineFlags::DEPTH_TEST);
    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
        .depth_test_enable(depth_enabled)
        .depth_write_enable(depth_enabled)
        .depth_compare_op(vk::CompareOp::LESS)
        .depth_bounds_test_enable(false)
        .stencil_test_enable(false);

    let blend_enabled = desc.flags.contains(PipelineFlags::BLEND);
    let blend_attachment = vk::PipelineColorBlendAttachmentState::builder()
        .color_write_mask(vk::ColorComponentFlags::RGBA)
        .blend_enable(blend_enabled)
        .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
        .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
        .color_blend_op(vk::BlendOp::ADD)
        .src_alpha_blend_factor(vk::BlendFactor::ONE)
        .dst_alpha_blend_factor(vk::BlendFactor::ZERO)
        .alpha_blend_op(vk::BlendOp::ADD)
        .build();
    let blend_attachments = vec![blend_attachment; color_attachment_count.max(1)];
    let color_blending =
        vk::PipelineColorBlendStateCreateInfo::builder().attachments(&blend_attachments);

    let mut dynamic_states = Vec::new();
    if desc.flags.contains(PipelineFlags::DYNAMIC_SCISSOR) {
        dynamic_states.push(vk::DynamicState::SCISSOR);
    }
    let dynamic_state =
        vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

    let create_info = vk::GraphicsPipelineCreateInfo::builder()
        .stages(&stages)
        .vertex_input_state(&vertex_input)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterizer)
        .multisample_state(&multisampling)
        .depth_stencil_state(&depth_stencil)
        .color_blend_state(&color_blending)
        .dynamic_state(&dynamic_state)
        .layout(layout)
        .render_pass(render_pass)
        .subpass(0);

    let pipelines = unsafe {
        device
            .create_graphics_pipelines(vk::PipelineCache::null(), &[create_info.build()], None)
            .map_err(|(_, e)| VulkanError::Api(e))?
    };
    Ok(pipelines[0])
}
