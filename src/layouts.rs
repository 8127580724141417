//! Descriptor-set and pipeline layouts shared by every environment map in the process.

use ash::vk;

/// Single-binding compute layout entry for a descriptor of type `ty`.
fn compute_binding(ty: vk::DescriptorType) -> vk::DescriptorSetLayoutBinding<'static> {
    vk::DescriptorSetLayoutBinding::default()
        .binding(0)
        .descriptor_type(ty)
        .descriptor_count(1)
        .stage_flags(vk::ShaderStageFlags::COMPUTE)
}

/// Create a one-binding set layout usable from a descriptor buffer.
pub unsafe fn create_descriptor_buffer_set_layout(
    device: &ash::Device,
    ty: vk::DescriptorType,
) -> Result<vk::DescriptorSetLayout, String> {
    let bindings = [compute_binding(ty)];
    let layout_info = vk::DescriptorSetLayoutCreateInfo::default()
        .flags(vk::DescriptorSetLayoutCreateFlags::DESCRIPTOR_BUFFER_EXT)
        .bindings(&bindings);

    device
        .create_descriptor_set_layout(&layout_info, None)
        .map_err(|e| format!("Failed to create {:?} descriptor set layout: {:?}", ty, e))
}

/// Pipeline layout over `set_layouts` (set i = element i) with one compute push-constant range.
pub unsafe fn create_pipeline_layout(
    device: &ash::Device,
    set_layouts: &[vk::DescriptorSetLayout],
    push_constant_size: u32,
) -> Result<vk::PipelineLayout, String> {
    let push_ranges = [vk::PushConstantRange::default()
        .stage_flags(vk::ShaderStageFlags::COMPUTE)
        .offset(0)
        .size(push_constant_size)];

    let layout_info = vk::PipelineLayoutCreateInfo::default()
        .set_layouts(set_layouts)
        .push_constant_ranges(&push_ranges);

    device
        .create_pipeline_layout(&layout_info, None)
        .map_err(|e| format!("Failed to create pipeline layout: {:?}", e))
}

/// The three set layouts the projection and convolution passes bind.
///
/// Built once and handed to every `EnvironmentMap` by reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutCache {
    /// Combined image sampler over the equirectangular image.
    pub equirect_sampler: vk::DescriptorSetLayout,
    /// Storage image over a cube (whole image or a single mip).
    pub cube_storage: vk::DescriptorSetLayout,
    /// Combined image sampler over a cube.
    pub cube_sampler: vk::DescriptorSetLayout,
}

impl LayoutCache {
    pub fn new(device: &ash::Device) -> Result<Self, String> {
        unsafe {
            let equirect_sampler = create_descriptor_buffer_set_layout(
                device,
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            )?;
            let cube_storage =
                match create_descriptor_buffer_set_layout(device, vk::DescriptorType::STORAGE_IMAGE) {
                    Ok(layout) => layout,
                    Err(e) => {
                        device.destroy_descriptor_set_layout(equirect_sampler, None);
                        return Err(e);
                    }
                };
            let cube_sampler = match create_descriptor_buffer_set_layout(
                device,
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            ) {
                Ok(layout) => layout,
                Err(e) => {
                    device.destroy_descriptor_set_layout(cube_storage, None);
                    device.destroy_descriptor_set_layout(equirect_sampler, None);
                    return Err(e);
                }
            };

            Ok(Self {
                equirect_sampler,
                cube_storage,
                cube_sampler,
            })
        }
    }

    /// Wrap existing handles without touching a device.
    pub fn from_handles(
        equirect_sampler: vk::DescriptorSetLayout,
        cube_storage: vk::DescriptorSetLayout,
        cube_sampler: vk::DescriptorSetLayout,
    ) -> Self {
        Self {
            equirect_sampler,
            cube_storage,
            cube_sampler,
        }
    }

    /// Sets for the projection pass: 0 = equirect sampler, 1 = cube storage.
    pub fn projection_sets(&self) -> [vk::DescriptorSetLayout; 2] {
        [self.equirect_sampler, self.cube_storage]
    }

    /// Sets for the convolution pass: 0 = cube sampler, 1 = cube storage.
    pub fn convolution_sets(&self) -> [vk::DescriptorSetLayout; 2] {
        [self.cube_sampler, self.cube_storage]
    }

    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_descriptor_set_layout(self.cube_sampler, None);
            device.destroy_descriptor_set_layout(self.cube_storage, None);
            device.destroy_descriptor_set_layout(self.equirect_sampler, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[test]
    fn bindings_are_single_compute_slots() {
        let b = compute_binding(vk::DescriptorType::STORAGE_IMAGE);
        assert_eq!(b.binding, 0);
        assert_eq!(b.descriptor_count, 1);
        assert_eq!(b.stage_flags, vk::ShaderStageFlags::COMPUTE);
        assert_eq!(b.descriptor_type, vk::DescriptorType::STORAGE_IMAGE);
    }

    #[test]
    fn pass_set_orders() {
        let cache = LayoutCache::from_handles(
            vk::DescriptorSetLayout::from_raw(1),
            vk::DescriptorSetLayout::from_raw(2),
            vk::DescriptorSetLayout::from_raw(3),
        );
        assert_eq!(cache.projection_sets(), [cache.equirect_sampler, cache.cube_storage]);
        assert_eq!(cache.convolution_sets(), [cache.cube_sampler, cache.cube_storage]);
    }
}
