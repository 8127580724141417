//! Bake configuration: an optional JSON file overlaid by command-line flags.

use log::warn;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_EQUIRECT_PATH: &str = "src_images/dam_bridge_4k.hdr";
pub const PREFILTERED_BASE_EXTENT: u32 = 512;
pub const PREFILTERED_MIP_LEVELS: u32 = 10;
pub const DIFFUSE_IRRADIANCE_MIP_LEVEL: u32 = 5;

pub const SAMPLE_DELTA_RANGE: (f32, f32) = (0.005, 0.5);
pub const SAMPLE_COUNT_RANGE: (u32, u32) = (1, 2048);
pub const DEFAULT_SAMPLE_DELTA: f32 = 0.025;
pub const DEFAULT_SAMPLE_COUNT: u32 = 1024;

/// File-level configuration. Every field is optional in the JSON.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BakeConfig {
    pub default_equirect_path: PathBuf,
    pub shader_dir: PathBuf,
    pub output_dir: PathBuf,
    pub flip_y: bool,
    pub diffuse_sample_delta: f32,
    pub specular_sample_count: u32,
    pub prefiltered_base_extent: u32,
    pub prefiltered_mip_levels: u32,
    pub diffuse_mip_level: u32,
}

impl Default for BakeConfig {
    fn default() -> Self {
        Self {
            default_equirect_path: PathBuf::from(DEFAULT_EQUIRECT_PATH),
            shader_dir: PathBuf::from("shaders"),
            output_dir: PathBuf::from("output"),
            flip_y: false,
            diffuse_sample_delta: DEFAULT_SAMPLE_DELTA,
            specular_sample_count: DEFAULT_SAMPLE_COUNT,
            prefiltered_base_extent: PREFILTERED_BASE_EXTENT,
            prefiltered_mip_levels: PREFILTERED_MIP_LEVELS,
            diffuse_mip_level: DIFFUSE_IRRADIANCE_MIP_LEVEL,
        }
    }
}

impl BakeConfig {
    /// Load a JSON config file.
    pub fn load(path: &Path) -> Result<Self, String> {
        let content = fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config {}: {}", path.display(), e))?;
        Self::from_json(&content)
            .map_err(|e| format!("Failed to parse config {}: {}", path.display(), e))
    }

    pub fn from_json(content: &str) -> Result<Self, String> {
        let config: Self = serde_json::from_str(content).map_err(|e| e.to_string())?;
        config.validate()?;
        Ok(config)
    }

    /// Reject prefiltered-array shapes the convolution cannot honour.
    pub fn validate(&self) -> Result<(), String> {
        if self.prefiltered_mip_levels < 3 {
            return Err(format!(
                "prefiltered_mip_levels must be at least 3, got {}",
                self.prefiltered_mip_levels
            ));
        }
        if self.diffuse_mip_level >= self.prefiltered_mip_levels {
            return Err(format!(
                "diffuse_mip_level {} is outside the {}-mip prefiltered array",
                self.diffuse_mip_level, self.prefiltered_mip_levels
            ));
        }
        let full_chain = 32 - self.prefiltered_base_extent.max(1).leading_zeros();
        if self.prefiltered_mip_levels > full_chain {
            return Err(format!(
                "prefiltered_base_extent {} only has {} mips, {} requested",
                self.prefiltered_base_extent, full_chain, self.prefiltered_mip_levels
            ));
        }
        Ok(())
    }

    /// Shape of the prefiltered array.
    pub fn prefiltered_layout(&self) -> PrefilteredLayout {
        PrefilteredLayout {
            base_extent: self.prefiltered_base_extent,
            mip_levels: self.prefiltered_mip_levels,
            diffuse_mip: self.diffuse_mip_level,
        }
    }

    pub fn settings(&self) -> BakeSettings {
        BakeSettings::new(
            self.flip_y,
            self.diffuse_sample_delta,
            self.specular_sample_count,
        )
    }
}

/// Fixed shape of the combined diffuse/specular cube array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrefilteredLayout {
    pub base_extent: u32,
    pub mip_levels: u32,
    pub diffuse_mip: u32,
}

impl Default for PrefilteredLayout {
    fn default() -> Self {
        BakeConfig::default().prefiltered_layout()
    }
}

/// Knobs read on every `load_cubemap`, adjustable between reloads.
///
/// The sampling knobs only change through setters that keep them inside
/// [`SAMPLE_DELTA_RANGE`] and [`SAMPLE_COUNT_RANGE`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BakeSettings {
    flip_y: bool,
    sample_delta: f32,
    sample_count: u32,
}

impl BakeSettings {
    /// Build settings, clamping the sampling knobs into their supported ranges.
    pub fn new(flip_y: bool, sample_delta: f32, sample_count: u32) -> Self {
        let mut settings = Self {
            flip_y,
            sample_delta: DEFAULT_SAMPLE_DELTA,
            sample_count: DEFAULT_SAMPLE_COUNT,
        };
        settings.set_sample_delta(sample_delta);
        settings.set_sample_count(sample_count);
        settings
    }

    pub fn flip_y(&self) -> bool {
        self.flip_y
    }

    pub fn sample_delta(&self) -> f32 {
        self.sample_delta
    }

    pub fn sample_count(&self) -> u32 {
        self.sample_count
    }

    pub fn set_flip_y(&mut self, flip_y: bool) {
        self.flip_y = flip_y;
    }

    /// NaN keeps the current value.
    pub fn set_sample_delta(&mut self, sample_delta: f32) {
        if sample_delta.is_nan() {
            warn!(
                "Diffuse sample delta NaN ignored, keeping {}",
                self.sample_delta
            );
            return;
        }
        let clamped = sample_delta.clamp(SAMPLE_DELTA_RANGE.0, SAMPLE_DELTA_RANGE.1);
        if clamped != sample_delta {
            warn!("Diffuse sample delta {} clamped to {}", sample_delta, clamped);
        }
        self.sample_delta = clamped;
    }

    pub fn set_sample_count(&mut self, sample_count: u32) {
        let clamped = sample_count.clamp(SAMPLE_COUNT_RANGE.0, SAMPLE_COUNT_RANGE.1);
        if clamped != sample_count {
            warn!("Specular sample count {} clamped to {}", sample_count, clamped);
        }
        self.sample_count = clamped;
    }
}

impl Default for BakeSettings {
    fn default() -> Self {
        BakeConfig::default().settings()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_yields_defaults() {
        let config = BakeConfig::from_json("{}").unwrap();
        assert_eq!(config.default_equirect_path, PathBuf::from(DEFAULT_EQUIRECT_PATH));
        assert_eq!(config.prefiltered_layout(), PrefilteredLayout {
            base_extent: 512,
            mip_levels: 10,
            diffuse_mip: 5,
        });
        assert!(!config.flip_y);
    }

    #[test]
    fn partial_json_overrides_fields() {
        let config =
            BakeConfig::from_json(r#"{ "flip_y": true, "specular_sample_count": 64 }"#).unwrap();
        assert!(config.flip_y);
        assert_eq!(config.specular_sample_count, 64);
        assert_eq!(config.diffuse_sample_delta, 0.025);
    }

    #[test]
    fn diffuse_mip_outside_array_is_rejected() {
        assert!(BakeConfig::from_json(r#"{ "diffuse_mip_level": 10 }"#).is_err());
    }

    #[test]
    fn mip_count_beyond_chain_is_rejected() {
        let json = r#"{ "prefiltered_base_extent": 64, "prefiltered_mip_levels": 10 }"#;
        assert!(BakeConfig::from_json(json).is_err());
    }

    #[test]
    fn settings_are_clamped() {
        let settings = BakeSettings::new(true, 5.0, 100_000);
        assert_eq!(settings.sample_delta(), 0.5);
        assert_eq!(settings.sample_count(), 2048);

        let settings = BakeSettings::new(false, 0.0, 0);
        assert_eq!(settings.sample_delta(), 0.005);
        assert_eq!(settings.sample_count(), 1);
    }

    #[test]
    fn nan_sample_delta_is_rejected() {
        let settings = BakeSettings::new(false, f32::NAN, 64);
        assert_eq!(settings.sample_delta(), DEFAULT_SAMPLE_DELTA);

        let mut settings = BakeSettings::new(false, 0.1, 64);
        settings.set_sample_delta(f32::NAN);
        assert_eq!(settings.sample_delta(), 0.1);
    }

    #[test]
    fn setters_clamp_like_the_constructor() {
        let mut settings = BakeSettings::default();
        settings.set_sample_delta(0.0);
        settings.set_sample_count(0);
        settings.set_flip_y(true);
        assert_eq!(settings.sample_delta(), SAMPLE_DELTA_RANGE.0);
        assert_eq!(settings.sample_count(), SAMPLE_COUNT_RANGE.0);
        assert!(settings.flip_y());

        settings.set_sample_delta(f32::INFINITY);
        assert_eq!(settings.sample_delta(), SAMPLE_DELTA_RANGE.1);
    }
}
