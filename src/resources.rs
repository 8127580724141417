//! Resource construction capability: images, cubemaps, buffers and blocking submits.
//!
//! The environment map only ever talks to the GPU through [`ResourceConstructor`] (plus the
//! descriptor encoder and pass recorder), so it can be driven by a fake in tests.

use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;

use crate::cubemap_math::CUBE_FACE_COUNT;
use crate::transfer;
use crate::vulkan_context::VulkanContext;

// ===========================================================================
// Resource types
// ===========================================================================

/// GPU image with its default view and allocation.
pub struct AllocatedImage {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub allocation: Option<Allocation>,
    pub extent: vk::Extent3D,
    pub format: vk::Format,
    pub mip_levels: u32,
    pub array_layers: u32,
}

impl AllocatedImage {
    /// Side length of mip `mip` of a square image.
    pub fn side_at_mip(&self, mip: u32) -> u32 {
        (self.extent.width >> mip).max(1)
    }
}

/// GPU buffer with its allocation and, when requested, its device address.
pub struct AllocatedBuffer {
    pub buffer: vk::Buffer,
    pub allocation: Option<Allocation>,
    pub size: vk::DeviceSize,
    pub address: vk::DeviceAddress,
}

// ===========================================================================
// Capability
// ===========================================================================

/// Generic resource primitives owned by the surrounding engine.
pub trait ResourceConstructor {
    /// Upload `data` into a new 2D image, optionally building a full mip chain.
    /// The image ends in SHADER_READ_ONLY_OPTIMAL.
    fn create_image(
        &mut self,
        data: &[u8],
        extent: vk::Extent3D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        mipmapped: bool,
    ) -> Result<AllocatedImage, String>;

    /// Create an uninitialised cube image (6 layers) with a CUBE view over all mips.
    /// `mip_levels` of 1 means no chain. The image ends in GENERAL.
    fn create_cubemap(
        &mut self,
        extent: vk::Extent3D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        mip_levels: u32,
    ) -> Result<AllocatedImage, String>;

    /// A CUBE view of a single mip of `image`.
    fn create_cubemap_mip_view(
        &mut self,
        image: &AllocatedImage,
        mip: u32,
    ) -> Result<vk::ImageView, String>;

    fn destroy_image_view(&mut self, view: vk::ImageView);

    fn destroy_image(&mut self, image: AllocatedImage);

    /// Linear sampler with trilinear mip filtering and no LOD clamp.
    fn create_sampler(&mut self) -> Result<vk::Sampler, String>;

    fn destroy_sampler(&mut self, sampler: vk::Sampler);

    fn create_buffer(
        &mut self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> Result<AllocatedBuffer, String>;

    /// Copy `bytes` into a host-visible buffer at `offset`.
    fn write_buffer(
        &mut self,
        buffer: &mut AllocatedBuffer,
        offset: vk::DeviceSize,
        bytes: &[u8],
    ) -> Result<(), String>;

    /// Read `len` bytes from a host-visible buffer at `offset`.
    fn read_buffer(
        &self,
        buffer: &AllocatedBuffer,
        offset: vk::DeviceSize,
        len: usize,
    ) -> Result<Vec<u8>, String>;

    fn destroy_buffer(&mut self, buffer: AllocatedBuffer);

    /// Start recording an immediate submit. The buffer must go back through
    /// [`ResourceConstructor::submit_immediate`].
    fn begin_immediate(&mut self) -> Result<vk::CommandBuffer, String>;

    /// Submit a recorded immediate buffer and block until the GPU has finished it.
    fn submit_immediate(&mut self, cmd: vk::CommandBuffer) -> Result<(), String>;

    fn wait_idle(&mut self) -> Result<(), String>;

    /// Copy one mip of a GENERAL-layout cube into `buffer` and wait for it.
    fn copy_cubemap_mip_to_buffer(
        &mut self,
        image: &AllocatedImage,
        mip: u32,
        buffer: &AllocatedBuffer,
    ) -> Result<(), String>;
}

// ===========================================================================
// Vulkan implementation
// ===========================================================================

impl VulkanContext {
    fn allocate_image(
        &mut self,
        image_info: &vk::ImageCreateInfo,
        name: &str,
    ) -> Result<(vk::Image, Allocation), String> {
        let image = unsafe {
            self.device
                .create_image(image_info, None)
                .map_err(|e| format!("Failed to create image '{}': {:?}", name, e))?
        };

        let requirements = unsafe { self.device.get_image_memory_requirements(image) };

        let allocation = self
            .allocator_mut()?
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location: MemoryLocation::GpuOnly,
                linear: false,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| format!("Failed to allocate image memory '{}': {:?}", name, e))?;

        unsafe {
            self.device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
                .map_err(|e| format!("Failed to bind image memory '{}': {:?}", name, e))?;
        }

        Ok((image, allocation))
    }

    fn create_view(
        &self,
        image: vk::Image,
        view_type: vk::ImageViewType,
        format: vk::Format,
        base_mip_level: u32,
        level_count: u32,
        layer_count: u32,
    ) -> Result<vk::ImageView, String> {
        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(view_type)
            .format(format)
            .components(vk::ComponentMapping::default())
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .base_mip_level(base_mip_level)
                    .level_count(level_count)
                    .base_array_layer(0)
                    .layer_count(layer_count),
            );

        unsafe {
            self.device
                .create_image_view(&view_info, None)
                .map_err(|e| format!("Failed to create image view: {:?}", e))
        }
    }
}

impl ResourceConstructor for VulkanContext {
    fn create_image(
        &mut self,
        data: &[u8],
        extent: vk::Extent3D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        mipmapped: bool,
    ) -> Result<AllocatedImage, String> {
        let mip_levels = if mipmapped {
            transfer::mip_level_count(extent.width, extent.height)
        } else {
            1
        };

        let mut full_usage = usage | vk::ImageUsageFlags::TRANSFER_DST;
        if mipmapped {
            full_usage |= vk::ImageUsageFlags::TRANSFER_SRC;
        }

        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(extent)
            .mip_levels(mip_levels)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(full_usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let (image, allocation) = self.allocate_image(&image_info, "equirect_image")?;

        let mut staging = self.create_buffer(
            data.len() as u64,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
            "image_staging",
        )?;
        self.write_buffer(&mut staging, 0, data)?;

        let filter = if self.supports_linear_blit(format) {
            vk::Filter::LINEAR
        } else {
            vk::Filter::NEAREST
        };

        let cmd = self.begin_immediate()?;

        transfer::cmd_transition_image_layers(
            &self.device, cmd, image,
            vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::AccessFlags::empty(), vk::AccessFlags::TRANSFER_WRITE,
            vk::PipelineStageFlags::TOP_OF_PIPE, vk::PipelineStageFlags::TRANSFER,
            0, mip_levels, 1,
        );

        let region = vk::BufferImageCopy::default()
            .buffer_offset(0)
            .buffer_row_length(0)
            .buffer_image_height(0)
            .image_subresource(
                vk::ImageSubresourceLayers::default()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .mip_level(0)
                    .base_array_layer(0)
                    .layer_count(1),
            )
            .image_offset(vk::Offset3D::default())
            .image_extent(extent);

        unsafe {
            self.device.cmd_copy_buffer_to_image(
                cmd,
                staging.buffer,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );
        }

        transfer::cmd_generate_mipmaps(
            &self.device,
            cmd,
            image,
            extent.width,
            extent.height,
            mip_levels,
            1,
            filter,
        );

        let submitted = self.submit_immediate(cmd);
        self.destroy_buffer(staging);
        submitted?;

        let view = self.create_view(
            image,
            vk::ImageViewType::TYPE_2D,
            format,
            0,
            mip_levels,
            1,
        )?;

        Ok(AllocatedImage {
            image,
            view,
            allocation: Some(allocation),
            extent,
            format,
            mip_levels,
            array_layers: 1,
        })
    }

    fn create_cubemap(
        &mut self,
        extent: vk::Extent3D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        mip_levels: u32,
    ) -> Result<AllocatedImage, String> {
        let full_chain = transfer::mip_level_count(extent.width, extent.height);
        if mip_levels == 0 || mip_levels > full_chain {
            return Err(format!(
                "Cubemap of side {} cannot have {} mips",
                extent.width, mip_levels
            ));
        }

        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(extent)
            .mip_levels(mip_levels)
            .array_layers(CUBE_FACE_COUNT)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .flags(vk::ImageCreateFlags::CUBE_COMPATIBLE);

        let (image, allocation) = self.allocate_image(&image_info, "cubemap")?;

        let cmd = self.begin_immediate()?;
        transfer::cmd_transition_image_layers(
            &self.device, cmd, image,
            vk::ImageLayout::UNDEFINED, vk::ImageLayout::GENERAL,
            vk::AccessFlags::empty(), vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
            vk::PipelineStageFlags::TOP_OF_PIPE, vk::PipelineStageFlags::COMPUTE_SHADER,
            0, mip_levels, CUBE_FACE_COUNT,
        );
        self.submit_immediate(cmd)?;

        let view = self.create_view(
            image,
            vk::ImageViewType::CUBE,
            format,
            0,
            mip_levels,
            CUBE_FACE_COUNT,
        )?;

        Ok(AllocatedImage {
            image,
            view,
            allocation: Some(allocation),
            extent,
            format,
            mip_levels,
            array_layers: CUBE_FACE_COUNT,
        })
    }

    fn create_cubemap_mip_view(
        &mut self,
        image: &AllocatedImage,
        mip: u32,
    ) -> Result<vk::ImageView, String> {
        if mip >= image.mip_levels {
            return Err(format!(
                "Mip {} out of range for a {}-mip cubemap",
                mip, image.mip_levels
            ));
        }
        self.create_view(
            image.image,
            vk::ImageViewType::CUBE,
            image.format,
            mip,
            1,
            CUBE_FACE_COUNT,
        )
    }

    fn destroy_image_view(&mut self, view: vk::ImageView) {
        unsafe { self.device.destroy_image_view(view, None) };
    }

    fn destroy_image(&mut self, mut image: AllocatedImage) {
        unsafe {
            self.device.destroy_image_view(image.view, None);
        }
        if let Some(alloc) = image.allocation.take() {
            if let Ok(allocator) = self.allocator_mut() {
                let _ = allocator.free(alloc);
            }
        }
        unsafe {
            self.device.destroy_image(image.image, None);
        }
    }

    fn create_sampler(&mut self) -> Result<vk::Sampler, String> {
        let sampler_info = vk::SamplerCreateInfo::default()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::REPEAT)
            .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .min_lod(0.0)
            .max_lod(vk::LOD_CLAMP_NONE);

        unsafe {
            self.device
                .create_sampler(&sampler_info, None)
                .map_err(|e| format!("Failed to create sampler: {:?}", e))
        }
    }

    fn destroy_sampler(&mut self, sampler: vk::Sampler) {
        unsafe { self.device.destroy_sampler(sampler, None) };
    }

    fn create_buffer(
        &mut self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> Result<AllocatedBuffer, String> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe {
            self.device
                .create_buffer(&buffer_info, None)
                .map_err(|e| format!("Failed to create buffer '{}': {:?}", name, e))?
        };

        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let allocation = self
            .allocator_mut()?
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location,
                linear: true,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| format!("Failed to allocate buffer memory '{}': {:?}", name, e))?;

        unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
                .map_err(|e| format!("Failed to bind buffer memory '{}': {:?}", name, e))?;
        }

        let address = if usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS) {
            unsafe {
                self.device
                    .get_buffer_device_address(&vk::BufferDeviceAddressInfo::default().buffer(buffer))
            }
        } else {
            0
        };

        Ok(AllocatedBuffer {
            buffer,
            allocation: Some(allocation),
            size,
            address,
        })
    }

    fn write_buffer(
        &mut self,
        buffer: &mut AllocatedBuffer,
        offset: vk::DeviceSize,
        bytes: &[u8],
    ) -> Result<(), String> {
        let mapped = buffer
            .allocation
            .as_mut()
            .and_then(|a| a.mapped_slice_mut())
            .ok_or("Buffer is not host-visible")?;

        let start = offset as usize;
        let end = start + bytes.len();
        if end > mapped.len() {
            return Err(format!(
                "Buffer write out of range: {}..{} of {}",
                start,
                end,
                mapped.len()
            ));
        }
        mapped[start..end].copy_from_slice(bytes);
        Ok(())
    }

    fn read_buffer(
        &self,
        buffer: &AllocatedBuffer,
        offset: vk::DeviceSize,
        len: usize,
    ) -> Result<Vec<u8>, String> {
        let mapped = buffer
            .allocation
            .as_ref()
            .and_then(|a| a.mapped_slice())
            .ok_or("Buffer is not host-visible")?;

        let start = offset as usize;
        let end = start + len;
        if end > mapped.len() {
            return Err(format!(
                "Mapped slice too small: {} < {}",
                mapped.len(),
                end
            ));
        }
        Ok(mapped[start..end].to_vec())
    }

    fn destroy_buffer(&mut self, mut buffer: AllocatedBuffer) {
        if let Some(alloc) = buffer.allocation.take() {
            if let Ok(allocator) = self.allocator_mut() {
                let _ = allocator.free(alloc);
            }
        }
        unsafe {
            self.device.destroy_buffer(buffer.buffer, None);
        }
    }

    fn begin_immediate(&mut self) -> Result<vk::CommandBuffer, String> {
        self.begin_immediate_commands()
    }

    fn submit_immediate(&mut self, cmd: vk::CommandBuffer) -> Result<(), String> {
        self.end_immediate(cmd)
    }

    fn wait_idle(&mut self) -> Result<(), String> {
        unsafe {
            self.device
                .device_wait_idle()
                .map_err(|e| format!("Failed to wait for device idle: {:?}", e))
        }
    }

    fn copy_cubemap_mip_to_buffer(
        &mut self,
        image: &AllocatedImage,
        mip: u32,
        buffer: &AllocatedBuffer,
    ) -> Result<(), String> {
        let side = image.side_at_mip(mip);
        let needed = (transfer::cube_face_byte_stride(side) * CUBE_FACE_COUNT as usize) as u64;
        if buffer.size < needed {
            return Err(format!(
                "Readback buffer holds {} bytes, mip {} needs {}",
                buffer.size, mip, needed
            ));
        }

        let cmd = self.begin_immediate()?;
        transfer::cmd_copy_cubemap_mip_to_buffer(
            &self.device,
            cmd,
            image.image,
            mip,
            side,
            buffer.buffer,
        );
        self.submit_immediate(cmd)
    }
}
