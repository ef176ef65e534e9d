//! Vulkan texture management
//!
//! Images, views and samplers with RAII cleanup. Texture contents are
//! uploaded through a staging buffer; each texture tracks its current
//! image layout so copies and readbacks can transition in and out of
//! `TRANSFER_*` layouts and restore the previous state.

use ash::{vk, Device, Instance};

use super::buffer::{find_memory_type, DeviceBuffer};
use super::commands::CommandPool;
use super::context::{VulkanError, VulkanResult};
use crate::render::api::{PixelFormat, TextureFlags};

/// Translate an engine pixel format to the Vulkan format used for it
pub fn vk_format(format: PixelFormat) -> vk::Format {
    match format {
        PixelFormat::Rgba8 => vk::Format::R8G8B8A8_UNORM,
        PixelFormat::Bgra8 => vk::Format::B8G8R8A8_UNORM,
        PixelFormat::Depth32Float => vk::Format::D32_SFLOAT,
    }
}

/// Image aspect for an engine pixel format
pub fn vk_aspect(format: PixelFormat) -> vk::ImageAspectFlags {
    if format.is_depth() {
        vk::ImageAspectFlags::DEPTH
    } else {
        vk::ImageAspectFlags::COLOR
    }
}

/// Vulkan texture with image, view, sampler and layout tracking
pub struct VulkanTexture {
    device: Device,
    image: vk::Image,
    memory: vk::DeviceMemory,
    view: vk::ImageView,
    sampler: Option<vk::Sampler>,
    extent: vk::Extent2D,
    format: PixelFormat,
    layout: vk::ImageLayout,
}

impl VulkanTexture {
    /// Create an image with bound memory, a view over it, and a sampler
    /// unless the format is depth
    pub fn new(
        device: Device,
        instance: &Instance,
        physical_device: vk::PhysicalDevice,
        width: u32,
        height: u32,
        format: PixelFormat,
        flags: TextureFlags,
        usage: vk::ImageUsageFlags,
    ) -> VulkanResult<Self> {
        let image_create_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width,
                height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .format(vk_format(format))
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .samples(vk::SampleCountFlags::TYPE_1);

        let image = unsafe {
            device
                .create_image(&image_create_info, None)
                .map_err(VulkanError::Api)?
        };

        let memory_requirements = unsafe { device.get_image_memory_requirements(image) };
        let memory_type_index = find_memory_type(
            instance,
            physical_device,
            memory_requirements.memory_type_bits,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;

        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(memory_requirements.size)
            .memory_type_index(memory_type_index);

        let memory = unsafe {
            device
                .allocate_memory(&alloc_info, None)
                .map_err(VulkanError::Api)?
        };

        unsafe {
            device
                .bind_image_memory(image, memory, 0)
                .map_err(VulkanError::Api)?;
        }

        let view_create_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(vk_format(format))
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk_aspect(format),
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });

        let view = unsafe {
            device
                .create_image_view(&view_create_info, None)
                .map_err(VulkanError::Api)?
        };

        let sampler = if format.is_depth() {
            None
        } else {
            let filter = if flags.contains(TextureFlags::FILTER_NEAREST) {
                vk::Filter::NEAREST
            } else {
                vk::Filter::LINEAR
            };
            let address_mode = if flags.contains(TextureFlags::CLAMP_TO_EDGE) {
                vk::SamplerAddressMode::CLAMP_TO_EDGE
            } else {
                vk::SamplerAddressMode::REPEAT
            };

            let sampler_create_info = vk::SamplerCreateInfo::builder()
                .mag_filter(filter)
                .min_filter(filter)
                .address_mode_u(address_mode)
                .address_mode_v(address_mode)
                .address_mode_w(address_mode)
                .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
                .mipmap_mode(vk::SamplerMipmapMode::NEAREST);

            Some(unsafe {
                device
                    .create_sampler(&sampler_create_info, None)
                    .map_err(VulkanError::Api)?
            })
        };

        Ok(Self {
            device,
            image,
            memory,
            view,
            sampler,
            extent: vk::Extent2D { width, height },
            format,
            layout: vk::ImageLayout::UNDEFINED,
        })
    }

    /// Create a sampled texture from tightly-packed pixel data
    pub fn from_pixels(
        device: Device,
        instance: &Instance,
        physical_device: vk::PhysicalDevice,
        command_pool: &CommandPool,
        queue: vk::Queue,
        width: u32,
        height: u32,
        format: PixelFormat,
        flags: TextureFlags,
        pixels: &[u8],
    ) -> VulkanResult<Self> {
        let expected = width as usize * height as usize * format.bytes_per_pixel();
        if pixels.len() != expected {
            return Err(VulkanError::InvalidOperation {
                reason: format!(
                    "texture data is {} bytes, expected {} for {}x{}",
                    pixels.len(),
                    expected,
                    width,
                    height
                ),
            });
        }

        let mut texture = Self::new(
            device.clone(),
            instance,
            physical_device,
            width,
            height,
            format,
            flags,
            vk::ImageUsageFlags::TRANSFER_DST
                | vk::ImageUsageFlags::TRANSFER_SRC
                | vk::ImageUsageFlags::SAMPLED,
        )?;

        let staging = DeviceBuffer::new_mapped(
            device,
            instance,
            physical_device,
            pixels.len() as vk::DeviceSize,
            vk::BufferUsageFlags::TRANSFER_SRC,
        )?;
        staging.write_bytes(0, pixels)?;

        let image = texture.image;
        let aspect = vk_aspect(format);
        command_pool.one_time_submit(queue, |device, cmd| {
            record_transition(
                device,
                cmd,
                image,
                aspect,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            );

            let region = vk::BufferImageCopy::builder()
                .buffer_offset(0)
                .buffer_row_length(0)
                .buffer_image_height(0)
                .image_subresource(vk::ImageSubresourceLayers {
                    aspect_mask: aspect,
                    mip_level: 0,
                    base_array_layer: 0,
                    layer_count: 1,
                })
                .image_offset(vk::Offset3D { x: 0, y: 0, z: 0 })
                .image_extent(vk::Extent3D {
                    width,
                    height,
                    depth: 1,
                });
            unsafe {
                device.cmd_copy_buffer_to_image(
                    cmd,
                    staging.handle(),
                    image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[region.build()],
                );
            }

            record_transition(
                device,
                cmd,
                image,
                aspect,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            );
        })?;
        texture.layout = vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL;

        Ok(texture)
    }

    /// Get the image handle
    pub fn image(&self) -> vk::Image {
        self.image
    }

    /// Get the image view
    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    /// Get the sampler, present for all non-depth textures
    pub fn sampler(&self) -> Option<vk::Sampler> {
        self.sampler
    }

    /// Get the extent
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Get the pixel format
    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// Current tracked layout
    pub fn layout(&self) -> vk::ImageLayout {
        self.layout
    }

    /// Record the tracked layout after an externally recorded transition
    /// (render pass final layouts, barriers recorded by the frame loop)
    pub fn set_layout(&mut self, layout: vk::ImageLayout) {
        self.layout = layout;
    }

    /// Synchronously transition to a new layout
    pub fn transition(
        &mut self,
        command_pool: &CommandPool,
        queue: vk::Queue,
        new_layout: vk::ImageLayout,
    ) -> VulkanResult<()> {
        if self.layout == new_layout {
            return Ok(());
        }
        let image = self.image;
        let aspect = vk_aspect(self.format);
        let old_layout = self.layout;
        command_pool.one_time_submit(queue, |device, cmd| {
            record_transition(device, cmd, image, aspect, old_layout, new_layout);
        })?;
        self.layout = new_layout;
        Ok(())
    }

    /// Read the full image back to the host, tightly packed
    pub fn read_back(
        &mut self,
        instance: &Instance,
        physical_device: vk::PhysicalDevice,
        command_pool: &CommandPool,
        queue: vk::Queue,
    ) -> VulkanResult<Vec<u8>> {
        let byte_len =
            self.extent.width as usize * self.extent.height as usize * self.format.bytes_per_pixel();
        let staging = DeviceBuffer::new_mapped(
            self.device.clone(),
            instance,
            physical_device,
            byte_len as vk::DeviceSize,
            vk::BufferUsageFlags::TRANSFER_DST,
        )?;

        let restore_layout = self.layout;
        self.transition(command_pool, queue, vk::ImageLayout::TRANSFER_SRC_OPTIMAL)?;

        let image = self.image;
        let aspect = vk_aspect(self.format);
        let extent = self.extent;
        command_pool.one_time_submit(queue, |device, cmd| {
            let region = vk::BufferImageCopy::builder()
                .buffer_offset(0)
                .buffer_row_length(0)
                .buffer_image_height(0)
                .image_subresource(vk::ImageSubresourceLayers {
                    aspect_mask: aspect,
                    mip_level: 0,
                    base_array_layer: 0,
                    layer_count: 1,
                })
                .image_offset(vk::Offset3D { x: 0, y: 0, z: 0 })
                .image_extent(vk::Extent3D {
                    width: extent.width,
                    height: extent.height,
                    depth: 1,
                });
            unsafe {
                device.cmd_copy_image_to_buffer(
                    cmd,
                    image,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    staging.handle(),
                    &[region.build()],
                );
            }
        })?;

        if restore_layout != vk::ImageLayout::UNDEFINED {
            self.transition(command_pool, queue, restore_layout)?;
        }

        staging.read_bytes(byte_len)
    }
}

impl Drop for VulkanTexture {
    fn drop(&mut self) {
        unsafe {
            if let Some(sampler) = self.sampler {
                self.device.destroy_sampler(sampler, None);
            }
            self.device.destroy_image_view(self.view, None);
            self.device.destroy_image(self.image, None);
            self.device.free_memory(self.memory, None);
        }
    }
}

/// Record an image memory barrier for a layout transition
pub fn record_transition(
    device: &Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    aspect: vk::ImageAspectFlags,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
) {
    let (src_access, src_stage) = access_for_layout(old_layout);
    let (dst_access, dst_stage) = access_for_layout(new_layout);

    let barrier = vk::ImageMemoryBarrier::builder()
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: aspect,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        })
        .src_access_mask(src_access)
        .dst_access_mask(dst_access);

    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            src_stage,
            dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier.build()],
        );
    }
}

fn access_for_layout(layout: vk::ImageLayout) -> (vk::AccessFlags, vk::PipelineStageFlags) {
    match layout {
        vk::ImageLayout::UNDEFINED => (
            vk::AccessFlags::empty(),
            vk::PipelineStageFlags::TOP_OF_PIPE,
        ),
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => (
            vk::AccessFlags::TRANSFER_READ,
            vk::PipelineStageFlags::TRANSFER,
        ),
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => (
            vk::AccessFlags::TRANSFER_WRITE,
            vk::PipelineStageFlags::TRANSFER,
        ),
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => (
            vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
        ),
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => (
            vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        ),
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL => (
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
        ),
        _ => (
            vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
            vk::PipelineStageFlags::ALL_COMMANDS,
        ),
    }
}
