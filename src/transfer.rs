//! Command recording helpers for layout transitions, mip chains and cube readback, plus the
//! host-side split of a read-back cube mip into its six faces.

use ash::vk;

use crate::cubemap_math::CUBE_FACE_COUNT;

/// Bytes per texel of the R32G32B32A32_SFLOAT images this crate works with.
pub const RGBA32F_TEXEL_BYTES: usize = 16;

/// Number of mips in a full chain for a `width` x `height` image: `floor(log2(max)) + 1`.
pub fn mip_level_count(width: u32, height: u32) -> u32 {
    32 - width.max(height).max(1).leading_zeros()
}

/// Byte size of one RGBA32F cube face of the given side.
pub fn cube_face_byte_stride(side: u32) -> usize {
    side as usize * side as usize * RGBA32F_TEXEL_BYTES
}

/// Split a tightly packed read-back of one cube mip into six faces of RGBA floats,
/// in the cube's native layer order (+X, -X, +Y, -Y, +Z, -Z).
pub fn split_cube_faces(bytes: &[u8], side: u32) -> Result<Vec<Vec<f32>>, String> {
    let stride = cube_face_byte_stride(side);
    let expected = stride * CUBE_FACE_COUNT as usize;
    if bytes.len() < expected {
        return Err(format!(
            "Cube readback too small: {} bytes, expected {} for side {}",
            bytes.len(),
            expected,
            side
        ));
    }

    Ok(bytes[..expected]
        .chunks_exact(stride)
        .map(bytemuck::pod_collect_to_vec::<u8, f32>)
        .collect())
}

/// Record a layout transition over a mip/layer range of a color image.
#[allow(clippy::too_many_arguments)]
pub fn cmd_transition_image_layers(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
    src_access: vk::AccessFlags,
    dst_access: vk::AccessFlags,
    src_stage: vk::PipelineStageFlags,
    dst_stage: vk::PipelineStageFlags,
    base_mip_level: u32,
    level_count: u32,
    layer_count: u32,
) {
    let barrier = vk::ImageMemoryBarrier::default()
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(
            vk::ImageSubresourceRange::default()
                .aspect_mask(vk::ImageAspectFlags::COLOR)
                .base_mip_level(base_mip_level)
                .level_count(level_count)
                .base_array_layer(0)
                .layer_count(layer_count),
        )
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
            &[barrier],
        );
    }
}

/// Global memory barrier between dependent compute passes, including writes made by an
/// earlier submission.
pub fn cmd_compute_barrier(device: &ash::Device, cmd: vk::CommandBuffer) {
    let barrier = vk::MemoryBarrier::default()
        .src_access_mask(vk::AccessFlags::SHADER_WRITE | vk::AccessFlags::TRANSFER_WRITE)
        .dst_access_mask(vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE);

    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::COMPUTE_SHADER | vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::COMPUTE_SHADER,
            vk::DependencyFlags::empty(),
            &[barrier],
            &[],
            &[],
        );
    }
}

/// Build a full mip chain by successive blits from mip 0.
///
/// Expects every mip in TRANSFER_DST_OPTIMAL with mip 0 already written; leaves every mip in
/// SHADER_READ_ONLY_OPTIMAL.
#[allow(clippy::too_many_arguments)]
pub fn cmd_generate_mipmaps(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    width: u32,
    height: u32,
    mip_levels: u32,
    layer_count: u32,
    filter: vk::Filter,
) {
    let mut src_width = width as i32;
    let mut src_height = height as i32;

    for mip in 1..mip_levels {
        cmd_transition_image_layers(
            device, cmd, image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            vk::AccessFlags::TRANSFER_WRITE, vk::AccessFlags::TRANSFER_READ,
            vk::PipelineStageFlags::TRANSFER, vk::PipelineStageFlags::TRANSFER,
            mip - 1, 1, layer_count,
        );

        let dst_width = (src_width / 2).max(1);
        let dst_height = (src_height / 2).max(1);

        let blit = vk::ImageBlit::default()
            .src_subresource(
                vk::ImageSubresourceLayers::default()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .mip_level(mip - 1)
                    .base_array_layer(0)
                    .layer_count(layer_count),
            )
            .src_offsets([
                vk::Offset3D::default(),
                vk::Offset3D { x: src_width, y: src_height, z: 1 },
            ])
            .dst_subresource(
                vk::ImageSubresourceLayers::default()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .mip_level(mip)
                    .base_array_layer(0)
                    .layer_count(layer_count),
            )
            .dst_offsets([
                vk::Offset3D::default(),
                vk::Offset3D { x: dst_width, y: dst_height, z: 1 },
            ]);

        unsafe {
            device.cmd_blit_image(
                cmd,
                image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[blit],
                filter,
            );
        }

        cmd_transition_image_layers(
            device, cmd, image,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::AccessFlags::TRANSFER_READ, vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::TRANSFER, vk::PipelineStageFlags::COMPUTE_SHADER,
            mip - 1, 1, layer_count,
        );

        src_width = dst_width;
        src_height = dst_height;
    }

    // Last mip was only ever a blit destination
    cmd_transition_image_layers(
        device, cmd, image,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        vk::AccessFlags::TRANSFER_WRITE, vk::AccessFlags::SHADER_READ,
        vk::PipelineStageFlags::TRANSFER, vk::PipelineStageFlags::COMPUTE_SHADER,
        mip_levels - 1, 1, layer_count,
    );
}

/// Record a copy of one mip of a cube image (all six layers, GENERAL layout) into `buffer`.
///
/// Faces land back to back in layer order, each `cube_face_byte_stride(side)` bytes.
pub fn cmd_copy_cubemap_mip_to_buffer(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    mip: u32,
    side: u32,
    buffer: vk::Buffer,
) {
    let before = vk::MemoryBarrier::default()
        .src_access_mask(vk::AccessFlags::SHADER_WRITE)
        .dst_access_mask(vk::AccessFlags::TRANSFER_READ);

    let region = vk::BufferImageCopy::default()
        .buffer_offset(0)
        .buffer_row_length(0)
        .buffer_image_height(0)
        .image_subresource(
            vk::ImageSubresourceLayers::default()
                .aspect_mask(vk::ImageAspectFlags::COLOR)
                .mip_level(mip)
                .base_array_layer(0)
                .layer_count(CUBE_FACE_COUNT),
        )
        .image_offset(vk::Offset3D { x: 0, y: 0, z: 0 })
        .image_extent(vk::Extent3D {
            width: side,
            height: side,
            depth: 1,
        });

    let after = vk::MemoryBarrier::default()
        .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
        .dst_access_mask(vk::AccessFlags::HOST_READ);

    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::COMPUTE_SHADER,
            vk::PipelineStageFlags::TRANSFER,
            vk::DependencyFlags::empty(),
            &[before],
            &[],
            &[],
        );

        device.cmd_copy_image_to_buffer(
            cmd,
            image,
            vk::ImageLayout::GENERAL,
            buffer,
            &[region],
        );

        device.cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::HOST,
            vk::DependencyFlags::empty(),
            &[after],
            &[],
            &[],
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mip_level_count_matches_log2_floor_plus_one() {
        assert_eq!(mip_level_count(1, 1), 1);
        assert_eq!(mip_level_count(512, 512), 10);
        assert_eq!(mip_level_count(4096, 2048), 13);
        assert_eq!(mip_level_count(300, 17), 9);
    }

    #[test]
    fn face_stride_is_side_squared_times_sixteen() {
        assert_eq!(cube_face_byte_stride(1024), 1024 * 1024 * 4 * 4);
        assert_eq!(cube_face_byte_stride(1), 16);
    }

    #[test]
    fn split_keeps_layer_order() {
        let side = 2u32;
        let mut bytes = Vec::new();
        for face in 0..6u32 {
            for _ in 0..(side * side * 4) {
                bytes.extend_from_slice(&(face as f32).to_le_bytes());
            }
        }

        let faces = split_cube_faces(&bytes, side).unwrap();
        assert_eq!(faces.len(), 6);
        for (index, face) in faces.iter().enumerate() {
            assert_eq!(face.len(), 16);
            assert!(face.iter().all(|&v| v == index as f32));
        }
    }

    #[test]
    fn split_rejects_short_readback() {
        let bytes = vec![0u8; cube_face_byte_stride(4) * 5];
        assert!(split_cube_faces(&bytes, 4).is_err());
    }
}
