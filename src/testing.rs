//! In-memory stand-ins for the GPU backend and the compute passes.

use ash::vk::{self, Handle};
use glam::Vec4;
use gpu_allocator::MemoryLocation;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use crate::convolution::ConvolutionJob;
use crate::cubemap_math::CUBE_FACE_COUNT;
use crate::descriptor_buffer::{DescriptorData, DescriptorEncoder};
use crate::hdr::{self, HdrImage};
use crate::layouts::LayoutCache;
use crate::passes::EnvironmentPasses;
use crate::projector::ProjectionJob;
use crate::resources::{AllocatedBuffer, AllocatedImage, ResourceConstructor};
use crate::transfer;

pub const FAKE_LAYOUT_SIZE: vk::DeviceSize = 40;
pub const FAKE_DESCRIPTOR_ALIGNMENT: vk::DeviceSize = 64;
const FAKE_DESCRIPTOR_SIZE: usize = 32;

#[derive(Debug, Clone, PartialEq)]
pub enum FakeEvent {
    CreateImage { width: u32, height: u32, mip_levels: u32 },
    CreateCubemap { side: u32, mip_levels: u32 },
    CreateView { mip: u32 },
    DestroyView(vk::ImageView),
    DestroyImage(vk::Image),
    CreateSampler(vk::Sampler),
    DestroySampler(vk::Sampler),
    CreateBuffer { size: vk::DeviceSize },
    DestroyBuffer(vk::Buffer),
    Submit,
    WaitIdle,
    CopyCubemapMip { mip: u32 },
}

pub struct FakeGpu {
    pub events: Vec<FakeEvent>,
    next_handle: u64,
    memory: HashMap<u64, Vec<u8>>,
    live_views: HashSet<u64>,
    live_images: HashSet<u64>,
    recording: Option<vk::CommandBuffer>,
    submits: usize,
    /// Zero-based index of a submit that reports a fence timeout.
    pub failing_submit: Option<usize>,
}

impl FakeGpu {
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            next_handle: 1,
            memory: HashMap::new(),
            live_views: HashSet::new(),
            live_images: HashSet::new(),
            recording: None,
            submits: 0,
            failing_submit: None,
        }
    }

    fn handle(&mut self) -> u64 {
        let h = self.next_handle;
        self.next_handle += 1;
        h
    }

    pub fn live_view_count(&self) -> usize {
        self.live_views.len()
    }

    pub fn live_image_count(&self) -> usize {
        self.live_images.len()
    }

    pub fn live_buffer_count(&self) -> usize {
        self.memory.len()
    }

    /// The view (or address) handle encoded at `offset` of a descriptor table.
    pub fn encoded_view_at(&self, buffer: &AllocatedBuffer, offset: vk::DeviceSize) -> Option<u64> {
        let bytes = self.memory.get(&buffer.buffer.as_raw())?;
        let start = offset as usize;
        let raw: [u8; 8] = bytes.get(start..start + 8)?.try_into().ok()?;
        Some(u64::from_le_bytes(raw))
    }

    fn new_image(&mut self, extent: vk::Extent3D, mip_levels: u32, layers: u32) -> AllocatedImage {
        let image = self.handle();
        let view = self.handle();
        self.live_images.insert(image);
        self.live_views.insert(view);
        AllocatedImage {
            image: vk::Image::from_raw(image),
            view: vk::ImageView::from_raw(view),
            allocation: None,
            extent,
            format: vk::Format::R32G32B32A32_SFLOAT,
            mip_levels,
            array_layers: layers,
        }
    }
}

impl ResourceConstructor for FakeGpu {
    fn create_image(
        &mut self,
        data: &[u8],
        extent: vk::Extent3D,
        _format: vk::Format,
        _usage: vk::ImageUsageFlags,
        mipmapped: bool,
    ) -> Result<AllocatedImage, String> {
        let expected = extent.width as usize * extent.height as usize * transfer::RGBA32F_TEXEL_BYTES;
        if data.len() != expected {
            return Err(format!("upload of {} bytes, expected {}", data.len(), expected));
        }
        let mip_levels = if mipmapped {
            transfer::mip_level_count(extent.width, extent.height)
        } else {
            1
        };
        self.events.push(FakeEvent::CreateImage {
            width: extent.width,
            height: extent.height,
            mip_levels,
        });
        Ok(self.new_image(extent, mip_levels, 1))
    }

    fn create_cubemap(
        &mut self,
        extent: vk::Extent3D,
        _format: vk::Format,
        _usage: vk::ImageUsageFlags,
        mip_levels: u32,
    ) -> Result<AllocatedImage, String> {
        if mip_levels == 0 || mip_levels > transfer::mip_level_count(extent.width, extent.height) {
            return Err(format!("bad mip count {}", mip_levels));
        }
        self.events.push(FakeEvent::CreateCubemap {
            side: extent.width,
            mip_levels,
        });
        Ok(self.new_image(extent, mip_levels, CUBE_FACE_COUNT))
    }

    fn create_cubemap_mip_view(
        &mut self,
        image: &AllocatedImage,
        mip: u32,
    ) -> Result<vk::ImageView, String> {
        if mip >= image.mip_levels {
            return Err(format!("mip {} out of range", mip));
        }
        let view = self.handle();
        self.live_views.insert(view);
        self.events.push(FakeEvent::CreateView { mip });
        Ok(vk::ImageView::from_raw(view))
    }

    fn destroy_image_view(&mut self, view: vk::ImageView) {
        self.live_views.remove(&view.as_raw());
        self.events.push(FakeEvent::DestroyView(view));
    }

    fn destroy_image(&mut self, image: AllocatedImage) {
        self.live_views.remove(&image.view.as_raw());
        self.live_images.remove(&image.image.as_raw());
        self.events.push(FakeEvent::DestroyImage(image.image));
    }

    fn create_sampler(&mut self) -> Result<vk::Sampler, String> {
        let sampler = vk::Sampler::from_raw(self.handle());
        self.events.push(FakeEvent::CreateSampler(sampler));
        Ok(sampler)
    }

    fn destroy_sampler(&mut self, sampler: vk::Sampler) {
        self.events.push(FakeEvent::DestroySampler(sampler));
    }

    fn create_buffer(
        &mut self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        _location: MemoryLocation,
        _name: &str,
    ) -> Result<AllocatedBuffer, String> {
        let raw = self.handle();
        self.memory.insert(raw, vec![0; size as usize]);
        self.events.push(FakeEvent::CreateBuffer { size });
        let address = if usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS) {
            raw << 32
        } else {
            0
        };
        Ok(AllocatedBuffer {
            buffer: vk::Buffer::from_raw(raw),
            allocation: None,
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
        let memory = self
            .memory
            .get_mut(&buffer.buffer.as_raw())
            .ok_or("write to a destroyed buffer")?;
        let start = offset as usize;
        let dst = memory
            .get_mut(start..start + bytes.len())
            .ok_or("buffer write out of range")?;
        dst.copy_from_slice(bytes);
        Ok(())
    }

    fn read_buffer(
        &self,
        buffer: &AllocatedBuffer,
        offset: vk::DeviceSize,
        len: usize,
    ) -> Result<Vec<u8>, String> {
        let memory = self
            .memory
            .get(&buffer.buffer.as_raw())
            .ok_or("read from a destroyed buffer")?;
        let start = offset as usize;
        memory
            .get(start..start + len)
            .map(|b| b.to_vec())
            .ok_or_else(|| "buffer read out of range".to_string())
    }

    fn destroy_buffer(&mut self, buffer: AllocatedBuffer) {
        self.memory.remove(&buffer.buffer.as_raw());
        self.events.push(FakeEvent::DestroyBuffer(buffer.buffer));
    }

    fn begin_immediate(&mut self) -> Result<vk::CommandBuffer, String> {
        if self.recording.is_some() {
            return Err("immediate command buffer already recording".to_string());
        }
        let cmd = vk::CommandBuffer::from_raw(self.handle());
        self.recording = Some(cmd);
        Ok(cmd)
    }

    fn submit_immediate(&mut self, cmd: vk::CommandBuffer) -> Result<(), String> {
        if self.recording != Some(cmd) {
            return Err("submit of a command buffer that is not recording".to_string());
        }
        self.recording = None;
        self.events.push(FakeEvent::Submit);
        let index = self.submits;
        self.submits += 1;
        if self.failing_submit == Some(index) {
            return Err("Immediate submit fence wait timed out".to_string());
        }
        Ok(())
    }

    fn wait_idle(&mut self) -> Result<(), String> {
        self.events.push(FakeEvent::WaitIdle);
        Ok(())
    }

    /// Fills layer `i` with the value `i` in every channel.
    fn copy_cubemap_mip_to_buffer(
        &mut self,
        image: &AllocatedImage,
        mip: u32,
        buffer: &AllocatedBuffer,
    ) -> Result<(), String> {
        let side = image.side_at_mip(mip);
        let stride = transfer::cube_face_byte_stride(side);
        let memory = self
            .memory
            .get_mut(&buffer.buffer.as_raw())
            .ok_or("copy into a destroyed buffer")?;
        if memory.len() < stride * CUBE_FACE_COUNT as usize {
            return Err("readback buffer too small".to_string());
        }
        for (face, chunk) in memory.chunks_exact_mut(stride).take(CUBE_FACE_COUNT as usize).enumerate() {
            let value = (face as f32).to_le_bytes();
            for texel in chunk.chunks_exact_mut(4) {
                texel.copy_from_slice(&value);
            }
        }
        self.events.push(FakeEvent::CopyCubemapMip { mip });
        Ok(())
    }
}

impl DescriptorEncoder for FakeGpu {
    fn descriptor_set_layout_size(&self, _layout: vk::DescriptorSetLayout) -> vk::DeviceSize {
        FAKE_LAYOUT_SIZE
    }

    fn descriptor_set_layout_binding_offset(
        &self,
        _layout: vk::DescriptorSetLayout,
        binding: u32,
    ) -> vk::DeviceSize {
        binding as vk::DeviceSize * FAKE_DESCRIPTOR_SIZE as vk::DeviceSize
    }

    fn descriptor_offset_alignment(&self) -> vk::DeviceSize {
        FAKE_DESCRIPTOR_ALIGNMENT
    }

    fn descriptor_size(&self, _ty: vk::DescriptorType) -> usize {
        FAKE_DESCRIPTOR_SIZE
    }

    /// Bytes 0..8 hold the view handle (or buffer address), byte 8 the descriptor type.
    fn encode_descriptor(&self, data: &DescriptorData, out: &mut [u8]) -> Result<(), String> {
        if out.len() != FAKE_DESCRIPTOR_SIZE {
            return Err(format!("descriptor slice of {} bytes", out.len()));
        }
        let payload = match *data {
            DescriptorData::CombinedImageSampler { view, .. } => view.as_raw(),
            DescriptorData::StorageImage { view, .. } => view.as_raw(),
            DescriptorData::UniformBuffer { address, .. } => address,
        };
        out[..8].copy_from_slice(&payload.to_le_bytes());
        out[8] = data.descriptor_type().as_raw() as u8;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PassRecord {
    Projection(ProjectionJob),
    Convolution(ConvolutionJob),
}

#[derive(Default)]
pub struct FakePasses {
    records: RefCell<Vec<PassRecord>>,
}

impl FakePasses {
    pub fn records(&self) -> Vec<PassRecord> {
        self.records.borrow().clone()
    }
}

impl EnvironmentPasses for FakePasses {
    fn record_projection(&self, _cmd: vk::CommandBuffer, job: &ProjectionJob) {
        self.records.borrow_mut().push(PassRecord::Projection(*job));
    }

    fn record_convolution(&self, _cmd: vk::CommandBuffer, job: &ConvolutionJob) {
        self.records.borrow_mut().push(PassRecord::Convolution(job.clone()));
    }
}

pub fn fake_layouts() -> LayoutCache {
    LayoutCache::from_handles(
        vk::DescriptorSetLayout::from_raw(0xE0),
        vk::DescriptorSetLayout::from_raw(0xE1),
        vk::DescriptorSetLayout::from_raw(0xE2),
    )
}

/// Write a smooth gradient panorama to `dir/name`.
pub fn write_panorama(dir: &Path, name: &str, width: u32, height: u32) -> PathBuf {
    let path = dir.join(name);
    let image = HdrImage::from_fn(width, height, |x, y| {
        Vec4::new(
            x as f32 / width as f32,
            y as f32 / height as f32,
            0.25,
            1.0,
        )
    });
    hdr::save_hdr(&path, width, height, &image.pixels).expect("write panorama");
    path
}
