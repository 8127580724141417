//! Environment map lifecycle: load a panorama, project it to a cube, convolve the cube into the
//! prefiltered diffuse/specular array, and keep the descriptor tables pointing at the results
//! across reloads.

use ash::vk;
use gpu_allocator::MemoryLocation;
use log::{info, warn};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::config::{BakeConfig, BakeSettings, PrefilteredLayout};
use crate::convolution::{self, ConvolutionJob, MipSlot};
use crate::cubemap_math::CUBE_FACE_COUNT;
use crate::descriptor_buffer::{DescriptorBuffer, DescriptorBufferKind, DescriptorData, DescriptorEncoder};
use crate::hdr::{self, HdrImage};
use crate::layouts::LayoutCache;
use crate::passes::EnvironmentPasses;
use crate::projector::{self, ProjectionJob};
use crate::resources::{AllocatedImage, ResourceConstructor};
use crate::teardown::{OwnedResource, Teardown};
use crate::transfer;

pub const CUBE_FORMAT: vk::Format = vk::Format::R32G32B32A32_SFLOAT;

/// Slot of the raw cube in the storage and sampled cube tables.
pub const RAW_CUBEMAP_SLOT: usize = 0;
/// Slot of the prefiltered array in the sampled cube table.
pub const PREFILTERED_SLOT: usize = 1;

fn cube_usage() -> vk::ImageUsageFlags {
    vk::ImageUsageFlags::TRANSFER_SRC
        | vk::ImageUsageFlags::TRANSFER_DST
        | vk::ImageUsageFlags::SAMPLED
        | vk::ImageUsageFlags::STORAGE
}

fn square_extent(side: u32) -> vk::Extent3D {
    vk::Extent3D {
        width: side,
        height: side,
        depth: 1,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvironmentState {
    Uninitialized,
    FirstTimeSetup,
    Ready,
    Reloading,
}

pub struct EnvironmentMap<'a, G, P>
where
    G: ResourceConstructor + DescriptorEncoder,
    P: EnvironmentPasses,
{
    gpu: &'a mut G,
    passes: &'a P,
    prefiltered_layout: PrefilteredLayout,
    settings: BakeSettings,
    state: EnvironmentState,

    sampler: vk::Sampler,
    equirect_table: DescriptorBuffer,
    storage_table: DescriptorBuffer,
    cubemap_table: DescriptorBuffer,

    equirect_path: PathBuf,
    equirect_image: Option<AllocatedImage>,
    raw_cubemap: Option<AllocatedImage>,
    prefiltered: Option<AllocatedImage>,
    cubemap_resolution: u32,
}

impl<'a, G, P> EnvironmentMap<'a, G, P>
where
    G: ResourceConstructor + DescriptorEncoder,
    P: EnvironmentPasses,
{
    /// Create the tables, load the default panorama and bake it. Any failure here is fatal.
    pub fn new(
        gpu: &'a mut G,
        passes: &'a P,
        layouts: &LayoutCache,
        config: &BakeConfig,
    ) -> Result<Self, String> {
        let prefiltered_layout = config.prefiltered_layout();

        let sampler = gpu.create_sampler()?;
        let equirect_table = DescriptorBuffer::new(
            gpu,
            layouts.equirect_sampler,
            DescriptorBufferKind::Sampler,
            1,
            "equirect_descriptors",
        )?;
        let storage_table = DescriptorBuffer::new(
            gpu,
            layouts.cube_storage,
            DescriptorBufferKind::Uniform,
            1 + prefiltered_layout.mip_levels as usize,
            "cubemap_storage_descriptors",
        )?;
        let cubemap_table = DescriptorBuffer::new(
            gpu,
            layouts.cube_sampler,
            DescriptorBufferKind::Sampler,
            2,
            "cubemap_descriptors",
        )?;

        let mut map = Self {
            gpu,
            passes,
            prefiltered_layout,
            settings: config.settings(),
            state: EnvironmentState::Uninitialized,
            sampler,
            equirect_table,
            storage_table,
            cubemap_table,
            equirect_path: config.default_equirect_path.clone(),
            equirect_image: None,
            raw_cubemap: None,
            prefiltered: None,
            cubemap_resolution: 0,
        };

        map.state = EnvironmentState::FirstTimeSetup;
        let default_path = config.default_equirect_path.clone();
        let setup = map
            .load_equirectangular(&default_path)
            .and_then(|_| map.load_cubemap());

        match setup {
            Ok(()) => Ok(map),
            Err(e) => {
                map.destroy();
                Err(e)
            }
        }
    }

    // ========================================================================
    // Loading
    // ========================================================================

    /// Decode `path` and replace the equirectangular image with it.
    ///
    /// Returns `Ok(false)` without touching the GPU if the file cannot be decoded or has an
    /// unusable width. During first-time setup that case is an error instead.
    pub fn load_equirectangular(&mut self, path: &Path) -> Result<bool, String> {
        let first_time = self.state == EnvironmentState::FirstTimeSetup;

        let decoded = hdr::load_hdr(path).and_then(|image| {
            projector::cube_side_for_width(image.width)?;
            Ok(image)
        });

        let source = match decoded {
            Ok(image) => image,
            Err(e) if first_time => {
                return Err(format!(
                    "Failed to load initial equirectangular image {}: {}",
                    path.display(),
                    e
                ));
            }
            Err(e) => {
                warn!("Failed to load equirectangular image: {}", e);
                return Ok(false);
            }
        };

        info!(
            "Loaded equirectangular image {}: {}x{}",
            path.display(),
            source.width,
            source.height
        );

        if !first_time {
            self.state = EnvironmentState::Reloading;
        }
        self.upload_equirectangular(&source, first_time)?;
        self.equirect_path = path.to_path_buf();
        Ok(true)
    }

    fn upload_equirectangular(&mut self, source: &HdrImage, first_time: bool) -> Result<(), String> {
        if let Some(old) = self.equirect_image.take() {
            self.gpu.destroy_image(old);
        }

        let image = self.gpu.create_image(
            source.as_bytes(),
            vk::Extent3D {
                width: source.width,
                height: source.height,
                depth: 1,
            },
            CUBE_FORMAT,
            vk::ImageUsageFlags::SAMPLED,
            true,
        )?;

        let descriptor = [DescriptorData::CombinedImageSampler {
            sampler: self.sampler,
            view: image.view,
            layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }];
        self.equirect_image = Some(image);

        if first_time {
            let index = self.equirect_table.setup_data(&mut *self.gpu, &descriptor)?;
            expect_slot("equirect", index, 0)?;
        } else {
            self.equirect_table.set_data(&mut *self.gpu, &descriptor, 0)?;
        }
        Ok(())
    }

    /// Rebuild the raw cube from the current panorama and reconvolve the prefiltered array.
    ///
    /// Outside first-time setup the map is `Reloading` until the bake completes, and stays there
    /// if it fails.
    pub fn load_cubemap(&mut self) -> Result<(), String> {
        let first_time = self.state == EnvironmentState::FirstTimeSetup;
        if !first_time {
            self.state = EnvironmentState::Reloading;
        }
        let start = Instant::now();

        let width = self
            .equirect_image
            .as_ref()
            .map(|img| img.extent.width)
            .ok_or("No equirectangular image loaded")?;
        let side = projector::cube_side_for_width(width)?;
        self.cubemap_resolution = side;

        // Raw cube, recreated since the resolution may have changed
        if let Some(old) = self.raw_cubemap.take() {
            self.gpu.destroy_image(old);
        }
        let raw = self
            .gpu
            .create_cubemap(square_extent(side), CUBE_FORMAT, cube_usage(), 1)?;
        let storage = [DescriptorData::StorageImage {
            view: raw.view,
            layout: vk::ImageLayout::GENERAL,
        }];
        let sampled = [DescriptorData::CombinedImageSampler {
            sampler: self.sampler,
            view: raw.view,
            layout: vk::ImageLayout::GENERAL,
        }];
        self.raw_cubemap = Some(raw);

        if first_time {
            let index = self.storage_table.setup_data(&mut *self.gpu, &storage)?;
            expect_slot("cubemap storage", index, RAW_CUBEMAP_SLOT)?;
            let index = self.cubemap_table.setup_data(&mut *self.gpu, &sampled)?;
            expect_slot("cubemap", index, RAW_CUBEMAP_SLOT)?;
        } else {
            self.storage_table
                .set_data(&mut *self.gpu, &storage, RAW_CUBEMAP_SLOT)?;
            self.cubemap_table
                .set_data(&mut *self.gpu, &sampled, RAW_CUBEMAP_SLOT)?;
        }

        let job = ProjectionJob {
            equirect: self.equirect_table.binding(0)?,
            storage: self.storage_table.binding(RAW_CUBEMAP_SLOT)?,
            side,
            flip_y: self.settings.flip_y(),
        };
        let cmd = self.gpu.begin_immediate()?;
        self.passes.record_projection(cmd, &job);
        self.gpu.submit_immediate(cmd)?;

        let cubemap_time = start.elapsed().as_secs_f32();
        info!("Cubemap created in {:.3} s", cubemap_time);

        if first_time {
            let layout = self.prefiltered_layout;
            let prefiltered = self.gpu.create_cubemap(
                square_extent(layout.base_extent),
                CUBE_FORMAT,
                cube_usage(),
                layout.mip_levels,
            )?;
            let sampled = [DescriptorData::CombinedImageSampler {
                sampler: self.sampler,
                view: prefiltered.view,
                layout: vk::ImageLayout::GENERAL,
            }];
            self.prefiltered = Some(prefiltered);
            let index = self.cubemap_table.setup_data(&mut *self.gpu, &sampled)?;
            expect_slot("cubemap", index, PREFILTERED_SLOT)?;
        }

        let convolve_start = Instant::now();
        self.convolve()?;
        info!(
            "Specular and diffuse maps created in {:.3} s",
            convolve_start.elapsed().as_secs_f32()
        );
        info!(
            "Total cubemap load time: {:.3} s",
            start.elapsed().as_secs_f32()
        );

        self.state = EnvironmentState::Ready;
        Ok(())
    }

    /// Hot reload: a new panorama followed by a full rebake.
    pub fn reload(&mut self, path: &Path) -> Result<bool, String> {
        if !self.load_equirectangular(path)? {
            return Ok(false);
        }
        self.load_cubemap()?;
        Ok(true)
    }

    /// One dispatch per mip of the prefiltered array, through transient per-mip views.
    fn convolve(&mut self) -> Result<(), String> {
        let mut mips: Vec<MipSlot> = Vec::with_capacity(self.prefiltered_layout.mip_levels as usize);
        let result = self.build_mip_slots(&mut mips).and_then(|_| {
            let job = ConvolutionJob {
                source: self.cubemap_table.binding(RAW_CUBEMAP_SLOT)?,
                mips: mips.clone(),
                sample_delta: self.settings.sample_delta(),
                sample_count: self.settings.sample_count(),
            };
            let cmd = self.gpu.begin_immediate()?;
            self.passes.record_convolution(cmd, &job);
            self.gpu.submit_immediate(cmd)
        });

        // A failed submit may leave the dispatches in flight
        if result.is_err() {
            if let Err(e) = self.gpu.wait_idle() {
                warn!("{}", e);
            }
        }
        for slot in &mips {
            self.storage_table
                .free_descriptor_buffer(slot.descriptor_index);
            self.gpu.destroy_image_view(slot.view);
        }
        result
    }

    fn build_mip_slots(&mut self, mips: &mut Vec<MipSlot>) -> Result<(), String> {
        let layout = self.prefiltered_layout;
        let prefiltered = self
            .prefiltered
            .as_ref()
            .ok_or("Prefiltered cubemap has not been created")?;

        for mip in 0..layout.mip_levels {
            let view = self.gpu.create_cubemap_mip_view(prefiltered, mip)?;
            let descriptor = [DescriptorData::StorageImage {
                view,
                layout: vk::ImageLayout::GENERAL,
            }];
            let index = match self.storage_table.setup_data(&mut *self.gpu, &descriptor) {
                Ok(index) => index,
                Err(e) => {
                    self.gpu.destroy_image_view(view);
                    return Err(e);
                }
            };
            let slot = MipSlot {
                mip,
                side: convolution::mip_side(layout.base_extent, mip),
                roughness: convolution::mip_roughness(mip, layout.mip_levels, layout.diffuse_mip),
                view,
                descriptor_index: index,
                storage: self.storage_table.binding(index)?,
            };
            mips.push(slot);
        }
        Ok(())
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn equirectangular_descriptor_buffer(&self) -> &DescriptorBuffer {
        &self.equirect_table
    }

    /// Slot 0 is the raw cube, slot 1 the prefiltered array.
    pub fn cubemap_descriptor_buffer(&self) -> &DescriptorBuffer {
        &self.cubemap_table
    }

    pub fn state(&self) -> EnvironmentState {
        self.state
    }

    pub fn cubemap_resolution(&self) -> u32 {
        self.cubemap_resolution
    }

    pub fn equirect_path(&self) -> &Path {
        &self.equirect_path
    }

    pub fn prefiltered_layout(&self) -> PrefilteredLayout {
        self.prefiltered_layout
    }

    pub fn settings(&self) -> BakeSettings {
        self.settings
    }

    /// Knobs take effect on the next `load_cubemap`. The setters keep them in range.
    pub fn settings_mut(&mut self) -> &mut BakeSettings {
        &mut self.settings
    }

    // ========================================================================
    // Export
    // ========================================================================

    /// Write the six faces of the raw cube as `cubemap_face_{i}.hdr`.
    pub fn save_cubemap(&mut self, dir: &Path) -> Result<Vec<PathBuf>, String> {
        let image = self.raw_cubemap.as_ref().ok_or("No cubemap loaded")?;
        let (side, faces) = read_cube_mip(&mut *self.gpu, image, 0)?;
        write_faces(dir, "cubemap_face", side, &faces)
    }

    /// Write the diffuse irradiance mip as `diffuse_irradiance_face_{i}.hdr`.
    pub fn save_diffuse_irradiance(&mut self, dir: &Path) -> Result<Vec<PathBuf>, String> {
        let image = self
            .prefiltered
            .as_ref()
            .ok_or("Prefiltered cubemap has not been created")?;
        let (side, faces) =
            read_cube_mip(&mut *self.gpu, image, self.prefiltered_layout.diffuse_mip)?;
        write_faces(dir, "diffuse_irradiance_face", side, &faces)
    }

    /// Write one specular mip as `specular_mip_{mip}_face_{i}.hdr`.
    pub fn save_specular_mip(&mut self, dir: &Path, mip: u32) -> Result<Vec<PathBuf>, String> {
        let layout = self.prefiltered_layout;
        if mip >= layout.mip_levels || mip == layout.diffuse_mip {
            return Err(format!(
                "Mip {} is not a specular mip of the {}-mip prefiltered array",
                mip, layout.mip_levels
            ));
        }
        let image = self
            .prefiltered
            .as_ref()
            .ok_or("Prefiltered cubemap has not been created")?;
        let (side, faces) = read_cube_mip(&mut *self.gpu, image, mip)?;
        write_faces(dir, &format!("specular_mip_{}_face", mip), side, &faces)
    }

    /// Specular mip indices of the prefiltered array, in ascending roughness.
    pub fn specular_mips(&self) -> Vec<u32> {
        (0..self.prefiltered_layout.mip_levels)
            .filter(|&m| m != self.prefiltered_layout.diffuse_mip)
            .collect()
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Wait for the device, then release everything this map owns.
    pub fn destroy(self) {
        let Self {
            gpu,
            sampler,
            equirect_table,
            storage_table,
            cubemap_table,
            equirect_image,
            raw_cubemap,
            prefiltered,
            ..
        } = self;

        if let Err(e) = gpu.wait_idle() {
            warn!("{}", e);
        }

        let mut teardown = Teardown::new();
        teardown.push(OwnedResource::Sampler(sampler));
        teardown.push(OwnedResource::DescriptorBuffer(storage_table));
        teardown.push(OwnedResource::DescriptorBuffer(cubemap_table));
        teardown.push(OwnedResource::DescriptorBuffer(equirect_table));
        for image in [equirect_image, raw_cubemap, prefiltered].into_iter().flatten() {
            teardown.push(OwnedResource::Image(image));
        }
        teardown.run(gpu);

        info!("Environment map destroyed");
    }
}

fn expect_slot(table: &str, index: usize, expected: usize) -> Result<(), String> {
    if index != expected {
        return Err(format!(
            "{} descriptor landed in slot {}, expected {}",
            table, index, expected
        ));
    }
    Ok(())
}

/// Copy one mip of a cube to the host and split it into faces.
fn read_cube_mip<G: ResourceConstructor>(
    gpu: &mut G,
    image: &AllocatedImage,
    mip: u32,
) -> Result<(u32, Vec<Vec<f32>>), String> {
    let side = image.side_at_mip(mip);
    let size = transfer::cube_face_byte_stride(side) * CUBE_FACE_COUNT as usize;

    let staging = gpu.create_buffer(
        size as vk::DeviceSize,
        vk::BufferUsageFlags::TRANSFER_DST,
        MemoryLocation::GpuToCpu,
        "cubemap_readback",
    )?;

    let bytes = gpu
        .copy_cubemap_mip_to_buffer(image, mip, &staging)
        .and_then(|_| gpu.read_buffer(&staging, 0, size));
    gpu.destroy_buffer(staging);

    let faces = transfer::split_cube_faces(&bytes?, side)?;
    Ok((side, faces))
}

fn write_faces(
    dir: &Path,
    prefix: &str,
    side: u32,
    faces: &[Vec<f32>],
) -> Result<Vec<PathBuf>, String> {
    fs::create_dir_all(dir)
        .map_err(|e| format!("Failed to create output directory {}: {}", dir.display(), e))?;

    let mut written = Vec::with_capacity(faces.len());
    for (i, face) in faces.iter().enumerate() {
        let path = dir.join(format!("{}_{}.hdr", prefix, i));
        hdr::save_hdr(&path, side, side, face)?;
        written.push(path);
    }
    info!("Saved {} faces of {}x{} to {}", faces.len(), side, side, dir.display());
    Ok(written)
}
