//! Diffuse irradiance and specular prefilter convolution into the prefiltered cube array.
//!
//! Each mip of the array gets its own dispatch. Mip `diffuse_mip` holds the Lambertian
//! irradiance (roughness sentinel `-1.0`); every other mip holds a GGX prefilter whose roughness
//! skips over the diffuse mip, so mips `0..N` span roughness `0..=1` over `N - 1` steps.

use ash::vk;
use bytemuck::{Pod, Zeroable};

use crate::descriptor_buffer::DescriptorBinding;
use crate::layouts::{self, LayoutCache};
use crate::projector::{cmd_bind_two_sets, dispatch_groups};
use crate::shader;
use crate::transfer;

pub const CONVOLUTION_SHADER: &str = "cube_convolve.comp.spv";

/// Roughness value that selects the irradiance branch of the shader.
pub const DIFFUSE_ROUGHNESS: f32 = -1.0;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct ConvolutionPushConstants {
    pub roughness: f32,
    pub image_width: u32,
    pub image_height: u32,
    pub sample_count: u32,
    pub sample_delta: f32,
}

/// Roughness written to `mip` of a `mip_count`-level array whose diffuse mip is `diffuse_mip`.
pub fn mip_roughness(mip: u32, mip_count: u32, diffuse_mip: u32) -> f32 {
    if mip == diffuse_mip {
        return DIFFUSE_ROUGHNESS;
    }
    let j = if mip < diffuse_mip { mip } else { mip - 1 };
    j as f32 / (mip_count - 2) as f32
}

pub fn mip_side(base: u32, mip: u32) -> u32 {
    (base >> mip).max(1)
}

/// A transient per-mip target of the convolution pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MipSlot {
    pub mip: u32,
    pub side: u32,
    pub roughness: f32,
    pub view: vk::ImageView,
    /// Slot of `view` in the cube storage table.
    pub descriptor_index: usize,
    pub storage: DescriptorBinding,
}

impl MipSlot {
    pub fn is_diffuse(&self) -> bool {
        self.roughness < 0.0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConvolutionJob {
    /// Set 0: the raw cube as a combined image sampler.
    pub source: DescriptorBinding,
    pub mips: Vec<MipSlot>,
    pub sample_delta: f32,
    pub sample_count: u32,
}

pub struct ConvolutionEngine {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
}

impl ConvolutionEngine {
    pub fn new(
        device: &ash::Device,
        cache: &LayoutCache,
        shader_path: &std::path::Path,
    ) -> Result<Self, String> {
        let layout = unsafe {
            layouts::create_pipeline_layout(
                device,
                &cache.convolution_sets(),
                std::mem::size_of::<ConvolutionPushConstants>() as u32,
            )?
        };

        let pipeline = match shader::create_compute_pipeline(device, shader_path, layout) {
            Ok(p) => p,
            Err(e) => {
                unsafe { device.destroy_pipeline_layout(layout, None) };
                return Err(e);
            }
        };

        Ok(Self { pipeline, layout })
    }

    /// Record one dispatch per mip, separated by compute barriers.
    pub fn record(
        &self,
        device: &ash::Device,
        loader: &ash::ext::descriptor_buffer::Device,
        cmd: vk::CommandBuffer,
        job: &ConvolutionJob,
    ) {
        transfer::cmd_compute_barrier(device, cmd);
        unsafe {
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::COMPUTE, self.pipeline);
        }

        for slot in &job.mips {
            let push = ConvolutionPushConstants {
                roughness: slot.roughness,
                image_width: slot.side,
                image_height: slot.side,
                sample_count: job.sample_count,
                sample_delta: job.sample_delta,
            };
            let [gx, gy, gz] = dispatch_groups(slot.side);

            cmd_bind_two_sets(loader, cmd, self.layout, &job.source, &slot.storage);
            unsafe {
                device.cmd_push_constants(
                    cmd,
                    self.layout,
                    vk::ShaderStageFlags::COMPUTE,
                    0,
                    bytemuck::bytes_of(&push),
                );
                device.cmd_dispatch(cmd, gx, gy, gz);
            }
            transfer::cmd_compute_barrier(device, cmd);
        }
    }

    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_pipeline(self.pipeline, None);
            device.destroy_pipeline_layout(self.layout, None);
        }
    }
}

/// CPU versions of the two shader kernels, over an environment given as a radiance function.
pub mod reference {
    use glam::Vec3;
    use std::f32::consts::{FRAC_PI_2, PI, TAU};

    use crate::cubemap_math::{hammersley, importance_sample_ggx, tangent_to_world};

    /// Cosine-weighted hemisphere sum around `n` with angular step `sample_delta`.
    pub fn diffuse_irradiance(env: impl Fn(Vec3) -> Vec3, n: Vec3, sample_delta: f32) -> Vec3 {
        let mut irradiance = Vec3::ZERO;
        let mut count = 0u32;

        let mut phi = 0.0f32;
        while phi < TAU {
            let mut theta = 0.0f32;
            while theta < FRAC_PI_2 {
                let tangent = Vec3::new(
                    theta.sin() * phi.cos(),
                    theta.sin() * phi.sin(),
                    theta.cos(),
                );
                let dir = tangent_to_world(n, tangent);
                irradiance += env(dir) * theta.cos() * theta.sin();
                count += 1;
                theta += sample_delta;
            }
            phi += sample_delta;
        }

        PI * irradiance / count.max(1) as f32
    }

    /// GGX prefilter around `n` with `V = N`, weighted by `N.L`.
    pub fn prefilter_specular(
        env: impl Fn(Vec3) -> Vec3,
        n: Vec3,
        roughness: f32,
        sample_count: u32,
    ) -> Vec3 {
        let mut color = Vec3::ZERO;
        let mut total_weight = 0.0f32;

        for i in 0..sample_count {
            let h = importance_sample_ggx(hammersley(i, sample_count), n, roughness);
            let l = (2.0 * n.dot(h) * h - n).normalize();
            let n_dot_l = n.dot(l);
            if n_dot_l > 0.0 {
                color += env(l) * n_dot_l;
                total_weight += n_dot_l;
            }
        }

        if total_weight > 0.0 {
            color / total_weight
        } else {
            color
        }
    }
}

#[cfg(test)]
mod tests {
    use super::reference::*;
    use super::*;
    use glam::Vec3;

    #[test]
    fn mip_roughness_skips_the_diffuse_mip() {
        let expected = [0.0, 0.125, 0.25, 0.375, 0.5, -1.0, 0.625, 0.75, 0.875, 1.0];
        for (mip, want) in expected.iter().enumerate() {
            assert_eq!(mip_roughness(mip as u32, 10, 5), *want, "mip {}", mip);
        }
    }

    #[test]
    fn mip_roughness_is_strictly_increasing_outside_diffuse() {
        let values: Vec<f32> = (0..10)
            .filter(|&m| m != 5)
            .map(|m| mip_roughness(m, 10, 5))
            .collect();
        assert!(values.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(values.first(), Some(&0.0));
        assert_eq!(values.last(), Some(&1.0));
    }

    #[test]
    fn mip_sides_halve_down_to_one() {
        assert_eq!(mip_side(512, 0), 512);
        assert_eq!(mip_side(512, 5), 16);
        assert_eq!(mip_side(512, 9), 1);
        assert_eq!(mip_side(4, 7), 1);
    }

    #[test]
    fn push_constants_are_packed() {
        assert_eq!(std::mem::size_of::<ConvolutionPushConstants>(), 20);
    }

    #[test]
    fn constant_environment_stays_constant() {
        let env = |_: Vec3| Vec3::splat(2.0);
        for n in [Vec3::Y, -Vec3::X, Vec3::new(0.3, -0.4, 0.8).normalize()] {
            let e = diffuse_irradiance(env, n, 0.025);
            assert!((e - Vec3::splat(2.0)).abs().max_element() < 0.05, "{:?}", e);

            for roughness in [0.0, 0.5, 1.0] {
                let s = prefilter_specular(env, n, roughness, 256);
                assert!((s - Vec3::splat(2.0)).abs().max_element() < 1e-3);
            }
        }
    }

    #[test]
    fn half_lit_sky_irradiance() {
        let sky = |d: Vec3| if d.y > 0.0 { Vec3::ONE } else { Vec3::ZERO };
        let up = diffuse_irradiance(sky, Vec3::Y, 0.025);
        let down = diffuse_irradiance(sky, -Vec3::Y, 0.025);
        let side = diffuse_irradiance(sky, Vec3::X, 0.025);
        assert!((up.x - 1.0).abs() < 0.05, "{:?}", up);
        assert!(down.x < 1e-3);
        assert!((side.x - 0.5).abs() < 0.05, "{:?}", side);
    }

    #[test]
    fn smooth_prefilter_returns_the_mirror_direction() {
        let env = |d: Vec3| d.max(Vec3::ZERO);
        let n = Vec3::new(0.6, 0.8, 0.0);
        let s = prefilter_specular(env, n, 0.0, 64);
        assert!((s - n).length() < 1e-3);
    }
}
