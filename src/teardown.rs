//! Ordered release of GPU resources, last acquired first released.

use ash::vk;
use log::debug;

use crate::descriptor_buffer::DescriptorBuffer;
use crate::resources::{AllocatedImage, ResourceConstructor};

pub enum OwnedResource {
    Sampler(vk::Sampler),
    DescriptorBuffer(DescriptorBuffer),
    Image(AllocatedImage),
}

impl OwnedResource {
    fn label(&self) -> &'static str {
        match self {
            OwnedResource::Sampler(_) => "sampler",
            OwnedResource::DescriptorBuffer(_) => "descriptor buffer",
            OwnedResource::Image(_) => "image",
        }
    }

    fn release<G: ResourceConstructor>(self, gpu: &mut G) {
        match self {
            OwnedResource::Sampler(s) => gpu.destroy_sampler(s),
            OwnedResource::DescriptorBuffer(db) => db.destroy(gpu),
            OwnedResource::Image(img) => gpu.destroy_image(img),
        }
    }
}

#[derive(Default)]
pub struct Teardown {
    resources: Vec<OwnedResource>,
}

impl Teardown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, resource: OwnedResource) {
        self.resources.push(resource);
    }

    /// Release everything in reverse push order. The device must be idle.
    pub fn run<G: ResourceConstructor>(mut self, gpu: &mut G) {
        debug!("Releasing {} resources", self.resources.len());
        while let Some(resource) = self.resources.pop() {
            debug!("Releasing {}", resource.label());
            resource.release(gpu);
        }
    }
}
