//! Equirectangular panorama to cubemap projection.
//!
//! One compute dispatch writes all six faces of the raw cube. The host-side
//! [`project_reference`] runs the same per-texel mapping on the CPU.

use ash::vk;
use bytemuck::{Pod, Zeroable};

use crate::cubemap_math::{self, CUBE_FACE_COUNT};
use crate::descriptor_buffer::DescriptorBinding;
use crate::hdr::HdrImage;
use crate::layouts::{self, LayoutCache};
use crate::shader;
use crate::transfer;

pub const PROJECTOR_SHADER: &str = "equirect_to_cube.comp.spv";

/// Local workgroup size of both compute shaders in x and y.
pub const WORKGROUP_SIZE: u32 = 16;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct ProjectorPushConstants {
    pub flip_y: u32,
}

/// Everything one projection dispatch reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProjectionJob {
    /// Set 0: the equirectangular combined image sampler.
    pub equirect: DescriptorBinding,
    /// Set 1: the raw cube as a storage image.
    pub storage: DescriptorBinding,
    pub side: u32,
    pub flip_y: bool,
}

/// Cube side for an equirectangular source of the given width.
pub fn cube_side_for_width(width: u32) -> Result<u32, String> {
    if width == 0 || width % 4 != 0 {
        return Err(format!(
            "Equirectangular width {} is not a positive multiple of 4",
            width
        ));
    }
    Ok(width / 4)
}

/// Workgroup counts covering a `side` x `side` x 6 cube.
pub fn dispatch_groups(side: u32) -> [u32; 3] {
    let groups = side.div_ceil(WORKGROUP_SIZE);
    [groups, groups, CUBE_FACE_COUNT]
}

/// Bind two descriptor buffers as sets 0 and 1 of a compute pipeline.
pub(crate) fn cmd_bind_two_sets(
    loader: &ash::ext::descriptor_buffer::Device,
    cmd: vk::CommandBuffer,
    layout: vk::PipelineLayout,
    set0: &DescriptorBinding,
    set1: &DescriptorBinding,
) {
    let infos = [set0.binding_info(), set1.binding_info()];
    unsafe {
        loader.cmd_bind_descriptor_buffers(cmd, &infos);
        loader.cmd_set_descriptor_buffer_offsets(
            cmd,
            vk::PipelineBindPoint::COMPUTE,
            layout,
            0,
            &[0, 1],
            &[set0.offset, set1.offset],
        );
    }
}

pub struct EquirectProjector {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
}

impl EquirectProjector {
    pub fn new(
        device: &ash::Device,
        cache: &LayoutCache,
        shader_path: &std::path::Path,
    ) -> Result<Self, String> {
        let layout = unsafe {
            layouts::create_pipeline_layout(
                device,
                &cache.projection_sets(),
                std::mem::size_of::<ProjectorPushConstants>() as u32,
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

    /// Record the projection into `cmd`, fenced by compute barriers on both sides.
    pub fn record(
        &self,
        device: &ash::Device,
        loader: &ash::ext::descriptor_buffer::Device,
        cmd: vk::CommandBuffer,
        job: &ProjectionJob,
    ) {
        let push = ProjectorPushConstants {
            flip_y: job.flip_y as u32,
        };
        let [gx, gy, gz] = dispatch_groups(job.side);

        transfer::cmd_compute_barrier(device, cmd);
        unsafe {
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::COMPUTE, self.pipeline);
        }
        cmd_bind_two_sets(loader, cmd, self.layout, &job.equirect, &job.storage);
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

    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_pipeline(self.pipeline, None);
            device.destroy_pipeline_layout(self.layout, None);
        }
    }
}

/// CPU projection of `source` onto six `side` x `side` RGBA faces in layer order.
pub fn project_reference(source: &HdrImage, side: u32, flip_y: bool) -> Vec<Vec<f32>> {
    (0..CUBE_FACE_COUNT)
        .map(|face| {
            let mut texels = Vec::with_capacity(side as usize * side as usize * 4);
            for y in 0..side {
                for x in 0..side {
                    let dir = cubemap_math::face_direction(face, x, y, side);
                    let uv = cubemap_math::direction_to_equirect_uv(dir, flip_y);
                    texels.extend_from_slice(&cubemap_math::sample_equirect(source, uv).to_array());
                }
            }
            texels
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec4;

    const COLOURS: [Vec4; 6] = [
        Vec4::new(1.0, 0.0, 0.0, 1.0),
        Vec4::new(0.0, 1.0, 0.0, 1.0),
        Vec4::new(0.0, 0.0, 1.0, 1.0),
        Vec4::new(1.0, 1.0, 0.0, 1.0),
        Vec4::new(0.0, 1.0, 1.0, 1.0),
        Vec4::new(1.0, 0.0, 1.0, 1.0),
    ];

    /// Panorama where every texel holds the colour of the cube face its direction hits.
    fn six_colour_panorama(width: u32, height: u32) -> HdrImage {
        HdrImage::from_fn(width, height, |x, y| {
            let u = (x as f32 + 0.5) / width as f32;
            let v = (y as f32 + 0.5) / height as f32;
            let phi = (u - 0.5) * std::f32::consts::TAU;
            let theta = v * std::f32::consts::PI;
            let dir = glam::Vec3::new(
                theta.sin() * phi.cos(),
                theta.cos(),
                theta.sin() * phi.sin(),
            );
            COLOURS[cubemap_math::dominant_face(dir) as usize]
        })
    }

    fn texel(face: &[f32], side: u32, x: u32, y: u32) -> Vec4 {
        let i = ((y * side + x) * 4) as usize;
        Vec4::from_slice(&face[i..i + 4])
    }

    #[test]
    fn cube_side_is_quarter_width() {
        assert_eq!(cube_side_for_width(4096).unwrap(), 1024);
        assert_eq!(cube_side_for_width(256).unwrap(), 64);
    }

    #[test]
    fn cube_side_rejects_non_multiple_of_four() {
        assert!(cube_side_for_width(1026).is_err());
        assert!(cube_side_for_width(0).is_err());
    }

    #[test]
    fn dispatch_covers_partial_groups() {
        assert_eq!(dispatch_groups(1024), [64, 64, 6]);
        assert_eq!(dispatch_groups(20), [2, 2, 6]);
        assert_eq!(dispatch_groups(1), [1, 1, 6]);
    }

    #[test]
    fn faces_land_in_layer_order() {
        let pano = six_colour_panorama(256, 128);
        let side = 16;
        let faces = project_reference(&pano, side, false);
        assert_eq!(faces.len(), 6);
        for (i, face) in faces.iter().enumerate() {
            // Face centres are far from any seam
            let c = texel(face, side, side / 2, side / 2);
            assert!((c - COLOURS[i]).length() < 1e-3, "face {} centre {:?}", i, c);
        }
    }

    #[test]
    fn flip_y_mirrors_lateral_faces_and_swaps_poles() {
        let pano = HdrImage::from_fn(64, 32, |x, y| Vec4::new(x as f32, y as f32, 0.5, 1.0));
        let side = 8;
        let plain = project_reference(&pano, side, false);
        let flipped = project_reference(&pano, side, true);

        for face in [0usize, 1, 4, 5] {
            for y in 0..side {
                for x in 0..side {
                    let a = texel(&flipped[face], side, x, y);
                    let b = texel(&plain[face], side, x, side - 1 - y);
                    assert!((a - b).length() < 1e-3, "face {} ({}, {})", face, x, y);
                }
            }
        }

        // +Y under flip looks where -Y looked, rows reversed
        for y in 0..side {
            for x in 0..side {
                let a = texel(&flipped[2], side, x, y);
                let b = texel(&plain[3], side, x, side - 1 - y);
                assert!((a - b).length() < 1e-3);
            }
        }
    }

    #[test]
    fn reference_projection_is_deterministic() {
        let pano = six_colour_panorama(64, 32);
        assert_eq!(project_reference(&pano, 8, true), project_reference(&pano, 8, true));
    }
}
