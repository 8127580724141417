//! The two compute passes behind a recording seam.

use ash::vk;
use log::info;
use std::path::Path;

use crate::convolution::{ConvolutionEngine, ConvolutionJob, CONVOLUTION_SHADER};
use crate::layouts::LayoutCache;
use crate::projector::{EquirectProjector, ProjectionJob, PROJECTOR_SHADER};
use crate::vulkan_context::VulkanContext;

/// Records the projection and convolution work into a caller-owned command buffer.
pub trait EnvironmentPasses {
    fn record_projection(&self, cmd: vk::CommandBuffer, job: &ProjectionJob);

    fn record_convolution(&self, cmd: vk::CommandBuffer, job: &ConvolutionJob);
}

pub struct ComputePasses {
    device: ash::Device,
    loader: ash::ext::descriptor_buffer::Device,
    projector: EquirectProjector,
    convolution: ConvolutionEngine,
}

impl ComputePasses {
    /// Build both pipelines from the SPIR-V in `shader_dir`. A missing shader is an error.
    pub fn new(ctx: &VulkanContext, layouts: &LayoutCache, shader_dir: &Path) -> Result<Self, String> {
        let projector = EquirectProjector::new(&ctx.device, layouts, &shader_dir.join(PROJECTOR_SHADER))?;
        let convolution =
            match ConvolutionEngine::new(&ctx.device, layouts, &shader_dir.join(CONVOLUTION_SHADER)) {
                Ok(c) => c,
                Err(e) => {
                    projector.destroy(&ctx.device);
                    return Err(e);
                }
            };

        info!("Compute pipelines created from {}", shader_dir.display());

        Ok(Self {
            device: ctx.device.clone(),
            loader: ctx.descriptor_buffer_loader.clone(),
            projector,
            convolution,
        })
    }

    pub fn destroy(&self) {
        self.convolution.destroy(&self.device);
        self.projector.destroy(&self.device);
    }
}

impl EnvironmentPasses for ComputePasses {
    fn record_projection(&self, cmd: vk::CommandBuffer, job: &ProjectionJob) {
        self.projector.record(&self.device, &self.loader, cmd, job);
    }

    fn record_convolution(&self, cmd: vk::CommandBuffer, job: &ConvolutionJob) {
        self.convolution.record(&self.device, &self.loader, cmd, job);
    }
}
