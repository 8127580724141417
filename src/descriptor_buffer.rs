//! Descriptor tables in device memory (`VK_EXT_descriptor_buffer`).
//!
//! A [`DescriptorBuffer`] is a fixed-capacity array of descriptor sets that all share one set
//! layout. Each slot is `descriptor_buffer_size` bytes; a shader selects a slot by binding the
//! buffer and setting the offset `slot * descriptor_buffer_size`.

use ash::vk;
use gpu_allocator::MemoryLocation;
use log::{debug, warn};

use crate::resources::{AllocatedBuffer, ResourceConstructor};
use crate::vulkan_context::VulkanContext;

// ===========================================================================
// Descriptor encoding capability
// ===========================================================================

/// One descriptor to write into a table slot. Entry `i` of a slice goes to binding `i`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DescriptorData {
    CombinedImageSampler {
        sampler: vk::Sampler,
        view: vk::ImageView,
        layout: vk::ImageLayout,
    },
    StorageImage {
        view: vk::ImageView,
        layout: vk::ImageLayout,
    },
    UniformBuffer {
        address: vk::DeviceAddress,
        range: vk::DeviceSize,
    },
}

impl DescriptorData {
    pub fn descriptor_type(&self) -> vk::DescriptorType {
        match self {
            DescriptorData::CombinedImageSampler { .. } => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            DescriptorData::StorageImage { .. } => vk::DescriptorType::STORAGE_IMAGE,
            DescriptorData::UniformBuffer { .. } => vk::DescriptorType::UNIFORM_BUFFER,
        }
    }
}

/// Layout queries and descriptor encoding from the descriptor buffer extension.
pub trait DescriptorEncoder {
    fn descriptor_set_layout_size(&self, layout: vk::DescriptorSetLayout) -> vk::DeviceSize;

    fn descriptor_set_layout_binding_offset(
        &self,
        layout: vk::DescriptorSetLayout,
        binding: u32,
    ) -> vk::DeviceSize;

    /// `descriptorBufferOffsetAlignment` of the device.
    fn descriptor_offset_alignment(&self) -> vk::DeviceSize;

    /// Encoded size in bytes of one descriptor of type `ty`.
    fn descriptor_size(&self, ty: vk::DescriptorType) -> usize;

    /// Encode `data` into `out`, which must be exactly `descriptor_size` bytes.
    fn encode_descriptor(&self, data: &DescriptorData, out: &mut [u8]) -> Result<(), String>;
}

impl DescriptorEncoder for VulkanContext {
    fn descriptor_set_layout_size(&self, layout: vk::DescriptorSetLayout) -> vk::DeviceSize {
        unsafe {
            self.descriptor_buffer_loader
                .get_descriptor_set_layout_size(layout)
        }
    }

    fn descriptor_set_layout_binding_offset(
        &self,
        layout: vk::DescriptorSetLayout,
        binding: u32,
    ) -> vk::DeviceSize {
        unsafe {
            self.descriptor_buffer_loader
                .get_descriptor_set_layout_binding_offset(layout, binding)
        }
    }

    fn descriptor_offset_alignment(&self) -> vk::DeviceSize {
        self.descriptor_buffer_properties
            .descriptor_buffer_offset_alignment
    }

    fn descriptor_size(&self, ty: vk::DescriptorType) -> usize {
        let props = &self.descriptor_buffer_properties;
        match ty {
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER => props.combined_image_sampler_descriptor_size,
            vk::DescriptorType::STORAGE_IMAGE => props.storage_image_descriptor_size,
            vk::DescriptorType::SAMPLED_IMAGE => props.sampled_image_descriptor_size,
            vk::DescriptorType::SAMPLER => props.sampler_descriptor_size,
            vk::DescriptorType::UNIFORM_BUFFER => props.uniform_buffer_descriptor_size,
            vk::DescriptorType::STORAGE_BUFFER => props.storage_buffer_descriptor_size,
            _ => 0,
        }
    }

    fn encode_descriptor(&self, data: &DescriptorData, out: &mut [u8]) -> Result<(), String> {
        let ty = data.descriptor_type();
        let expected = self.descriptor_size(ty);
        if out.len() != expected {
            return Err(format!(
                "Descriptor {:?} needs {} bytes, got {}",
                ty,
                expected,
                out.len()
            ));
        }

        match *data {
            DescriptorData::CombinedImageSampler {
                sampler,
                view,
                layout,
            } => {
                let image_info = vk::DescriptorImageInfo::default()
                    .sampler(sampler)
                    .image_view(view)
                    .image_layout(layout);
                let get_info = vk::DescriptorGetInfoEXT::default()
                    .ty(ty)
                    .data(vk::DescriptorDataEXT {
                        p_combined_image_sampler: &image_info,
                    });
                unsafe { self.descriptor_buffer_loader.get_descriptor(&get_info, out) };
            }
            DescriptorData::StorageImage { view, layout } => {
                let image_info = vk::DescriptorImageInfo::default()
                    .image_view(view)
                    .image_layout(layout);
                let get_info = vk::DescriptorGetInfoEXT::default()
                    .ty(ty)
                    .data(vk::DescriptorDataEXT {
                        p_storage_image: &image_info,
                    });
                unsafe { self.descriptor_buffer_loader.get_descriptor(&get_info, out) };
            }
            DescriptorData::UniformBuffer { address, range } => {
                let address_info = vk::DescriptorAddressInfoEXT::default()
                    .address(address)
                    .range(range)
                    .format(vk::Format::UNDEFINED);
                let get_info = vk::DescriptorGetInfoEXT::default()
                    .ty(ty)
                    .data(vk::DescriptorDataEXT {
                        p_uniform_buffer: &address_info,
                    });
                unsafe { self.descriptor_buffer_loader.get_descriptor(&get_info, out) };
            }
        }
        Ok(())
    }
}

// ===========================================================================
// Descriptor tables
// ===========================================================================

/// What a table may hold, which decides its buffer usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorBufferKind {
    /// Samplers and combined image samplers (plus any resource descriptor).
    Sampler,
    /// Resource descriptors only: storage images, uniform and storage buffers.
    Uniform,
}

impl DescriptorBufferKind {
    pub fn usage(self) -> vk::BufferUsageFlags {
        match self {
            DescriptorBufferKind::Sampler => {
                vk::BufferUsageFlags::SAMPLER_DESCRIPTOR_BUFFER_EXT
                    | vk::BufferUsageFlags::RESOURCE_DESCRIPTOR_BUFFER_EXT
                    | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
            }
            DescriptorBufferKind::Uniform => {
                vk::BufferUsageFlags::RESOURCE_DESCRIPTOR_BUFFER_EXT
                    | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
            }
        }
    }
}

/// Everything a pass needs to bind one slot of a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorBinding {
    pub address: vk::DeviceAddress,
    pub usage: vk::BufferUsageFlags,
    pub offset: vk::DeviceSize,
}

impl DescriptorBinding {
    pub fn binding_info(&self) -> vk::DescriptorBufferBindingInfoEXT<'static> {
        vk::DescriptorBufferBindingInfoEXT::default()
            .address(self.address)
            .usage(self.usage)
    }
}

pub fn align_up(value: vk::DeviceSize, alignment: vk::DeviceSize) -> vk::DeviceSize {
    if alignment <= 1 {
        return value;
    }
    value.div_ceil(alignment) * alignment
}

pub struct DescriptorBuffer {
    kind: DescriptorBufferKind,
    layout: vk::DescriptorSetLayout,
    buffer: AllocatedBuffer,
    descriptor_buffer_size: vk::DeviceSize,
    capacity: usize,
    // true = occupied; grows up to `capacity`
    slots: Vec<bool>,
    name: String,
}

impl DescriptorBuffer {
    /// Allocate a host-visible table with room for `capacity` sets of `layout`.
    pub fn new<G: ResourceConstructor + DescriptorEncoder>(
        gpu: &mut G,
        layout: vk::DescriptorSetLayout,
        kind: DescriptorBufferKind,
        capacity: usize,
        name: &str,
    ) -> Result<Self, String> {
        if capacity == 0 {
            return Err(format!("Descriptor buffer '{}' needs a capacity of at least 1", name));
        }

        let descriptor_buffer_size = align_up(
            gpu.descriptor_set_layout_size(layout),
            gpu.descriptor_offset_alignment(),
        );
        let size = descriptor_buffer_size * capacity as vk::DeviceSize;

        let buffer = gpu.create_buffer(size, kind.usage(), MemoryLocation::CpuToGpu, name)?;

        debug!(
            "Descriptor buffer '{}': {} slots of {} bytes",
            name, capacity, descriptor_buffer_size
        );

        Ok(Self {
            kind,
            layout,
            buffer,
            descriptor_buffer_size,
            capacity,
            slots: Vec::with_capacity(capacity),
            name: name.to_string(),
        })
    }

    /// Write a new set into the lowest free slot (or a fresh one) and return its index.
    pub fn setup_data<G: ResourceConstructor + DescriptorEncoder>(
        &mut self,
        gpu: &mut G,
        data: &[DescriptorData],
    ) -> Result<usize, String> {
        let index = match self.slots.iter().position(|occupied| !occupied) {
            Some(free) => free,
            None if self.slots.len() < self.capacity => {
                self.slots.push(false);
                self.slots.len() - 1
            }
            None => {
                return Err(format!(
                    "Descriptor buffer '{}' is full ({} slots)",
                    self.name, self.capacity
                ))
            }
        };

        self.write_slot(gpu, data, index)?;
        self.slots[index] = true;
        Ok(index)
    }

    /// Overwrite the set in an occupied slot.
    pub fn set_data<G: ResourceConstructor + DescriptorEncoder>(
        &mut self,
        gpu: &mut G,
        data: &[DescriptorData],
        index: usize,
    ) -> Result<(), String> {
        if !self.is_occupied(index) {
            return Err(format!(
                "Descriptor buffer '{}': slot {} is not in use",
                self.name, index
            ));
        }
        self.write_slot(gpu, data, index)
    }

    /// Mark a slot reusable. The bytes are left in place.
    pub fn free_descriptor_buffer(&mut self, index: usize) {
        match self.slots.get_mut(index) {
            Some(occupied) if *occupied => *occupied = false,
            _ => warn!(
                "Descriptor buffer '{}': slot {} freed while not in use",
                self.name, index
            ),
        }
    }

    fn write_slot<G: ResourceConstructor + DescriptorEncoder>(
        &mut self,
        gpu: &mut G,
        data: &[DescriptorData],
        index: usize,
    ) -> Result<(), String> {
        let slot_offset = self.descriptor_buffer_size * index as vk::DeviceSize;

        for (binding, descriptor) in data.iter().enumerate() {
            if self.kind == DescriptorBufferKind::Uniform
                && descriptor.descriptor_type() == vk::DescriptorType::COMBINED_IMAGE_SAMPLER
            {
                return Err(format!(
                    "Descriptor buffer '{}' cannot hold combined image samplers",
                    self.name
                ));
            }

            let mut bytes = vec![0u8; gpu.descriptor_size(descriptor.descriptor_type())];
            gpu.encode_descriptor(descriptor, &mut bytes)?;

            let offset = slot_offset
                + gpu.descriptor_set_layout_binding_offset(self.layout, binding as u32);
            if offset + bytes.len() as vk::DeviceSize > slot_offset + self.descriptor_buffer_size {
                return Err(format!(
                    "Descriptor buffer '{}': binding {} overflows its slot",
                    self.name, binding
                ));
            }
            gpu.write_buffer(&mut self.buffer, offset, &bytes)?;
        }
        Ok(())
    }

    pub fn is_occupied(&self, index: usize) -> bool {
        self.slots.get(index).copied().unwrap_or(false)
    }

    pub fn occupied_count(&self) -> usize {
        self.slots.iter().filter(|occupied| **occupied).count()
    }

    /// Aligned size of one slot.
    pub fn descriptor_buffer_size(&self) -> vk::DeviceSize {
        self.descriptor_buffer_size
    }

    pub fn get_descriptor_buffer_binding_info(&self) -> vk::DescriptorBufferBindingInfoEXT<'static> {
        vk::DescriptorBufferBindingInfoEXT::default()
            .address(self.buffer.address)
            .usage(self.kind.usage())
    }

    /// Bind parameters for an occupied slot.
    pub fn binding(&self, index: usize) -> Result<DescriptorBinding, String> {
        if !self.is_occupied(index) {
            return Err(format!(
                "Descriptor buffer '{}': slot {} is not in use",
                self.name, index
            ));
        }
        Ok(DescriptorBinding {
            address: self.buffer.address,
            usage: self.kind.usage(),
            offset: self.descriptor_buffer_size * index as vk::DeviceSize,
        })
    }

    pub fn destroy<G: ResourceConstructor>(self, gpu: &mut G) {
        gpu.destroy_buffer(self.buffer);
    }

    #[cfg(test)]
    pub(crate) fn buffer(&self) -> &AllocatedBuffer {
        &self.buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeGpu, FAKE_DESCRIPTOR_ALIGNMENT, FAKE_LAYOUT_SIZE};
    use ash::vk::Handle;

    fn storage(raw: u64) -> DescriptorData {
        DescriptorData::StorageImage {
            view: vk::ImageView::from_raw(raw),
            layout: vk::ImageLayout::GENERAL,
        }
    }

    fn table(gpu: &mut FakeGpu, capacity: usize) -> DescriptorBuffer {
        DescriptorBuffer::new(
            gpu,
            vk::DescriptorSetLayout::from_raw(1),
            DescriptorBufferKind::Uniform,
            capacity,
            "test",
        )
        .unwrap()
    }

    #[test]
    fn stride_is_layout_size_rounded_to_alignment() {
        let mut gpu = FakeGpu::new();
        let db = table(&mut gpu, 4);
        assert_eq!(
            db.descriptor_buffer_size(),
            align_up(FAKE_LAYOUT_SIZE, FAKE_DESCRIPTOR_ALIGNMENT)
        );
        assert_eq!(db.descriptor_buffer_size() % FAKE_DESCRIPTOR_ALIGNMENT, 0);
        assert_eq!(db.buffer().size, db.descriptor_buffer_size() * 4);
    }

    #[test]
    fn setup_appends_then_reuses_lowest_freed_slot() {
        let mut gpu = FakeGpu::new();
        let mut db = table(&mut gpu, 4);
        assert_eq!(db.setup_data(&mut gpu, &[storage(10)]).unwrap(), 0);
        assert_eq!(db.setup_data(&mut gpu, &[storage(11)]).unwrap(), 1);
        assert_eq!(db.setup_data(&mut gpu, &[storage(12)]).unwrap(), 2);

        db.free_descriptor_buffer(2);
        db.free_descriptor_buffer(1);
        assert_eq!(db.setup_data(&mut gpu, &[storage(13)]).unwrap(), 1);
        assert_eq!(db.setup_data(&mut gpu, &[storage(14)]).unwrap(), 2);
        assert_eq!(db.occupied_count(), 3);
    }

    #[test]
    fn exceeding_capacity_is_an_error() {
        let mut gpu = FakeGpu::new();
        let mut db = table(&mut gpu, 2);
        db.setup_data(&mut gpu, &[storage(1)]).unwrap();
        db.setup_data(&mut gpu, &[storage(2)]).unwrap();
        assert!(db.setup_data(&mut gpu, &[storage(3)]).is_err());
    }

    #[test]
    fn set_data_requires_an_occupied_slot() {
        let mut gpu = FakeGpu::new();
        let mut db = table(&mut gpu, 2);
        assert!(db.set_data(&mut gpu, &[storage(1)], 0).is_err());

        db.setup_data(&mut gpu, &[storage(1)]).unwrap();
        db.set_data(&mut gpu, &[storage(7)], 0).unwrap();
        db.free_descriptor_buffer(0);
        assert!(db.set_data(&mut gpu, &[storage(8)], 0).is_err());
    }

    #[test]
    fn free_is_idempotent() {
        let mut gpu = FakeGpu::new();
        let mut db = table(&mut gpu, 2);
        db.setup_data(&mut gpu, &[storage(1)]).unwrap();
        db.free_descriptor_buffer(0);
        db.free_descriptor_buffer(0);
        db.free_descriptor_buffer(9);
        assert_eq!(db.occupied_count(), 0);
        assert_eq!(db.setup_data(&mut gpu, &[storage(2)]).unwrap(), 0);
    }

    #[test]
    fn descriptors_land_at_slot_offset() {
        let mut gpu = FakeGpu::new();
        let mut db = table(&mut gpu, 3);
        db.setup_data(&mut gpu, &[storage(0xAA)]).unwrap();
        db.setup_data(&mut gpu, &[storage(0xBB)]).unwrap();
        db.set_data(&mut gpu, &[storage(0xCC)], 0).unwrap();

        let stride = db.descriptor_buffer_size();
        assert_eq!(gpu.encoded_view_at(db.buffer(), 0), Some(0xCC));
        assert_eq!(gpu.encoded_view_at(db.buffer(), stride), Some(0xBB));
        assert_eq!(db.binding(1).unwrap().offset, stride);
        assert!(db.binding(2).is_err());
    }

    #[test]
    fn resource_table_rejects_combined_samplers() {
        let mut gpu = FakeGpu::new();
        let mut db = table(&mut gpu, 1);
        let combined = DescriptorData::CombinedImageSampler {
            sampler: vk::Sampler::from_raw(3),
            view: vk::ImageView::from_raw(4),
            layout: vk::ImageLayout::GENERAL,
        };
        assert!(db.setup_data(&mut gpu, &[combined]).is_err());
    }

    #[test]
    fn kind_decides_buffer_usage() {
        assert!(DescriptorBufferKind::Sampler
            .usage()
            .contains(vk::BufferUsageFlags::SAMPLER_DESCRIPTOR_BUFFER_EXT));
        assert!(!DescriptorBufferKind::Uniform
            .usage()
            .contains(vk::BufferUsageFlags::SAMPLER_DESCRIPTOR_BUFFER_EXT));
    }
}
