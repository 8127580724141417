//! Bake image-based-lighting maps from an equirectangular HDR panorama with Vulkan compute.
//!
//! The panorama is projected onto a cube, then the cube is convolved into a prefiltered cube
//! array holding GGX specular mips and a Lambertian irradiance mip.

pub mod brdf_lut;
pub mod config;
pub mod convolution;
pub mod cubemap_math;
pub mod descriptor_buffer;
pub mod environment_map;
pub mod hdr;
pub mod layouts;
pub mod passes;
pub mod projector;
pub mod resources;
pub mod shader;
pub mod teardown;
pub mod transfer;
pub mod vulkan_context;

#[cfg(test)]
pub(crate) mod testing;
