//! SPIR-V loading and compute pipeline creation.

use ash::vk;
use std::fs;
use std::path::Path;

/// The SPIR-V magic number (little-endian).
const SPIRV_MAGIC: u32 = 0x07230203;

/// Read a SPIR-V binary file and return its contents as a Vec<u32>.
///
/// Validates the magic number and alignment.
pub fn load_spirv(path: &Path) -> Result<Vec<u32>, String> {
    let bytes = fs::read(path).map_err(|e| format!("Failed to read {:?}: {}", path, e))?;
    parse_spirv(&bytes).map_err(|e| format!("{:?}: {}", path, e))
}

fn parse_spirv(bytes: &[u8]) -> Result<Vec<u32>, String> {
    if bytes.len() < 4 {
        return Err("file too small to be valid SPIR-V".to_string());
    }

    if bytes.len() % 4 != 0 {
        return Err(format!("file size {} is not a multiple of 4", bytes.len()));
    }

    let words: Vec<u32> = bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();

    if words[0] != SPIRV_MAGIC {
        return Err(format!(
            "bad SPIR-V magic 0x{:08X} (expected 0x{:08X})",
            words[0], SPIRV_MAGIC
        ));
    }

    Ok(words)
}

/// Create a VkShaderModule from SPIR-V words.
pub fn create_shader_module(device: &ash::Device, code: &[u32]) -> Result<vk::ShaderModule, String> {
    let create_info = vk::ShaderModuleCreateInfo::default().code(code);

    unsafe {
        device
            .create_shader_module(&create_info, None)
            .map_err(|e| format!("Failed to create shader module: {:?}", e))
    }
}

/// Detect the shader stage from a filename's extension pattern.
pub fn detect_stage(filename: &str) -> Result<vk::ShaderStageFlags, String> {
    let lower = filename.to_lowercase();
    if lower.ends_with(".comp.spv") {
        Ok(vk::ShaderStageFlags::COMPUTE)
    } else if lower.ends_with(".vert.spv") {
        Ok(vk::ShaderStageFlags::VERTEX)
    } else if lower.ends_with(".frag.spv") {
        Ok(vk::ShaderStageFlags::FRAGMENT)
    } else {
        Err(format!(
            "Cannot detect shader stage from filename: {}",
            filename
        ))
    }
}

/// Load `path` and build a descriptor-buffer compute pipeline on `layout`.
pub fn create_compute_pipeline(
    device: &ash::Device,
    path: &Path,
    layout: vk::PipelineLayout,
) -> Result<vk::Pipeline, String> {
    let filename = path
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_default();
    if detect_stage(&filename)? != vk::ShaderStageFlags::COMPUTE {
        return Err(format!("{:?} is not a compute shader", path));
    }

    let code = load_spirv(path)?;
    let module = create_shader_module(device, &code)?;

    let stage = vk::PipelineShaderStageCreateInfo::default()
        .stage(vk::ShaderStageFlags::COMPUTE)
        .module(module)
        .name(c"main");

    let create_info = vk::ComputePipelineCreateInfo::default()
        .flags(vk::PipelineCreateFlags::DESCRIPTOR_BUFFER_EXT)
        .stage(stage)
        .layout(layout);

    let result = unsafe {
        device.create_compute_pipelines(vk::PipelineCache::null(), &[create_info], None)
    };

    // The module is only needed during pipeline creation
    unsafe { device.destroy_shader_module(module, None) };

    result
        .map(|pipelines| pipelines[0])
        .map_err(|(_, e)| format!("Failed to create compute pipeline {:?}: {:?}", path, e))
}
