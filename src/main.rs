//! CLI entry point for the IBL baker.
//!
//! Loads a panorama, bakes the cube, irradiance and specular maps on the GPU, optionally
//! hot-reloads further panoramas, and writes the requested products as Radiance files.

use clap::Parser;
use log::{error, info, warn};
use std::fs;
use std::path::{Path, PathBuf};

use ibl_bake::brdf_lut::{self, BRDF_LUT_SAMPLES, BRDF_LUT_SIZE};
use ibl_bake::config::BakeConfig;
use ibl_bake::environment_map::EnvironmentMap;
use ibl_bake::hdr;
use ibl_bake::layouts::LayoutCache;
use ibl_bake::passes::ComputePasses;
use ibl_bake::resources::ResourceConstructor;
use ibl_bake::vulkan_context::VulkanContext;

/// Bake image-based-lighting cubemaps from an equirectangular HDR panorama.
#[derive(Parser)]
#[command(name = "ibl-bake", about = "Equirectangular HDR to IBL cubemaps on Vulkan compute")]
struct Args {
    /// Equirectangular .hdr to load at startup. Defaults to the configured asset.
    input: Option<PathBuf>,

    /// JSON configuration file. Command-line flags override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory for saved faces and the BRDF table.
    #[arg(long)]
    output: Option<PathBuf>,

    /// Directory holding equirect_to_cube.comp.spv and cube_convolve.comp.spv.
    #[arg(long)]
    shader_dir: Option<PathBuf>,

    /// Mirror the panorama vertically before projecting.
    #[arg(long)]
    flip_y: bool,

    /// Angular step of the diffuse hemisphere sum (0.005 to 0.5).
    #[arg(long)]
    sample_delta: Option<f32>,

    /// GGX samples per specular texel (1 to 2048).
    #[arg(long)]
    sample_count: Option<u32>,

    /// Save the six faces of the raw cubemap.
    #[arg(long)]
    save_raw: bool,

    /// Save the six faces of the diffuse irradiance mip.
    #[arg(long)]
    save_diffuse: bool,

    /// Save the six faces of every specular mip.
    #[arg(long)]
    save_specular: bool,

    /// Save the split-sum BRDF integration table.
    #[arg(long)]
    save_lut: bool,

    /// Side length of the BRDF table.
    #[arg(long, default_value_t = BRDF_LUT_SIZE)]
    lut_size: u32,

    /// Panoramas to hot-reload after startup, in order. Saves apply to the last one loaded.
    #[arg(long)]
    reload: Vec<PathBuf>,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    if let Err(e) = run(args) {
        error!("Error: {}", e);
        std::process::exit(1);
    }
}

fn build_config(args: &Args) -> Result<BakeConfig, String> {
    let mut config = match &args.config {
        Some(path) => BakeConfig::load(path)?,
        None => BakeConfig::default(),
    };

    if let Some(input) = &args.input {
        config.default_equirect_path = input.clone();
    }
    if let Some(output) = &args.output {
        config.output_dir = output.clone();
    }
    if let Some(shader_dir) = &args.shader_dir {
        config.shader_dir = shader_dir.clone();
    }
    if args.flip_y {
        config.flip_y = true;
    }
    if let Some(delta) = args.sample_delta {
        config.diffuse_sample_delta = delta;
    }
    if let Some(count) = args.sample_count {
        config.specular_sample_count = count;
    }

    config.validate()?;
    Ok(config)
}

fn run(args: Args) -> Result<(), String> {
    let config = build_config(&args)?;

    info!("Input: {}", config.default_equirect_path.display());
    info!("Shaders: {}", config.shader_dir.display());
    info!("Output: {}", config.output_dir.display());

    if args.save_lut {
        save_brdf_lut(&config.output_dir, args.lut_size)?;
    }

    let mut ctx = VulkanContext::new()?;
    let layouts = LayoutCache::new(&ctx.device)?;
    let passes = match ComputePasses::new(&ctx, &layouts, &config.shader_dir) {
        Ok(p) => p,
        Err(e) => {
            layouts.destroy(&ctx.device);
            ctx.destroy();
            return Err(e);
        }
    };

    let result = bake(&mut ctx, &passes, &layouts, &config, &args);

    if let Err(e) = ctx.wait_idle() {
        warn!("{}", e);
    }
    passes.destroy();
    layouts.destroy(&ctx.device);
    ctx.destroy();

    result
}

fn bake(
    ctx: &mut VulkanContext,
    passes: &ComputePasses,
    layouts: &LayoutCache,
    config: &BakeConfig,
    args: &Args,
) -> Result<(), String> {
    let mut env = EnvironmentMap::new(ctx, passes, layouts, config)?;

    let result = reload_and_save(&mut env, config, args);
    env.destroy();
    result
}

fn reload_and_save(
    env: &mut EnvironmentMap<'_, VulkanContext, ComputePasses>,
    config: &BakeConfig,
    args: &Args,
) -> Result<(), String> {
    for path in &args.reload {
        if !env.reload(path)? {
            warn!(
                "Keeping {} after failed reload of {}",
                env.equirect_path().display(),
                path.display()
            );
        }
    }

    let out = &config.output_dir;
    if args.save_raw {
        env.save_cubemap(out)?;
    }
    if args.save_diffuse {
        env.save_diffuse_irradiance(out)?;
    }
    if args.save_specular {
        for mip in env.specular_mips() {
            env.save_specular_mip(out, mip)?;
        }
    }
    Ok(())
}

fn save_brdf_lut(dir: &Path, size: u32) -> Result<(), String> {
    if size == 0 {
        return Err("BRDF table size must be positive".to_string());
    }
    fs::create_dir_all(dir)
        .map_err(|e| format!("Failed to create output directory {}: {}", dir.display(), e))?;

    let lut = brdf_lut::generate_brdf_lut(size, BRDF_LUT_SAMPLES);
    let path = dir.join("brdf_lut.hdr");
    hdr::save_hdr(&path, lut.width, lut.height, &lut.pixels)?;
    info!("Saved {}x{} BRDF table to {}", size, size, path.display());
    Ok(())
}
