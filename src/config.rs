use std::path::Path;

use image::Rgba;
use serde::{Deserialize, Serialize};

use crate::canvas::{DEFAULT_MAX_PIXELS, storage_pixels};
use crate::error::{EngineError, Result};
use crate::io::RasterFormat;

/// Engine defaults, loadable from TOML. Missing keys fall back to `Default`.
///
/// ```toml
/// width = 1920
/// height = 1080
/// background_color = [255, 255, 255, 255]
/// export_format = "png"
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub width: u32,
    pub height: u32,
    /// Straight RGBA used by background layers on create, clear and resize growth.
    pub background_color: [u8; 4],
    pub background_name: String,
    /// New layers are named "<prefix> <n>".
    pub default_layer_prefix: String,
    pub export_format: RasterFormat,
    /// JPEG quality 1-100.
    pub export_quality: u8,
    /// Largest surface (in pixels) a layer may allocate.
    pub max_pixels: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            width: 800,
            height: 600,
            background_color: [255, 255, 255, 255],
            background_name: "Background".to_string(),
            default_layer_prefix: "Layer".to_string(),
            export_format: RasterFormat::Png,
            export_quality: 90,
            max_pixels: DEFAULT_MAX_PIXELS,
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&text)?;
        log::info!("loaded engine config from {}", path.display());
        Ok(config)
    }

    pub fn background(&self) -> Rgba<u8> {
        Rgba(self.background_color)
    }

    fn validate(&self) -> Result<()> {
        if !(1..=100).contains(&self.export_quality) {
            return Err(EngineError::Config(format!(
                "export_quality must be 1-100, got {}",
                self.export_quality
            )));
        }
        if storage_pixels(self.width, self.height) > self.max_pixels {
            return Err(EngineError::Config(format!(
                "{}×{} canvas exceeds max_pixels ({})",
                self.width, self.height, self.max_pixels
            )));
        }
        Ok(())
    }
}
