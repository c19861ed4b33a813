use std::fs::File;
use std::io::{BufReader, BufWriter, Cursor, Read};
use std::path::Path;

use image::codecs::bmp::BmpEncoder;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::{ColorType, DynamicImage, ImageEncoder, RgbaImage};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Encoded raster formats a layer snapshot can be written as.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RasterFormat {
    #[default]
    Png,
    /// Lossy; alpha is dropped.
    Jpeg,
    Bmp,
}

impl RasterFormat {
    pub fn is_lossless(&self) -> bool {
        !matches!(self, RasterFormat::Jpeg)
    }
}

/// Raster input accepted by `load_raster`.
#[derive(Clone, Debug, PartialEq)]
pub enum RasterSource {
    /// Any still-image format the `image` crate can sniff (PNG, JPEG, BMP, WebP).
    Encoded(Vec<u8>),
    /// Straight RGBA8, row-major, `width * height * 4` bytes.
    Raw { width: u32, height: u32, pixels: Vec<u8> },
}

impl From<RgbaImage> for RasterSource {
    fn from(img: RgbaImage) -> Self {
        let (width, height) = img.dimensions();
        RasterSource::Raw { width, height, pixels: img.into_raw() }
    }
}

/// Encode an RGBA image into `format`. Quality only applies to JPEG (clamped to 1..=100).
pub fn encode_raster(image: &RgbaImage, format: RasterFormat, quality: u8) -> Result<Vec<u8>> {
    let (w, h) = image.dimensions();
    if w == 0 || h == 0 {
        return Err(EngineError::Encode(format!("cannot encode a {w}×{h} surface")));
    }
    let mut out = Vec::new();
    let res = match format {
        RasterFormat::Png => PngEncoder::new(&mut out).write_image(image.as_raw(), w, h, ColorType::Rgba8),
        RasterFormat::Jpeg => {
            let rgb = DynamicImage::ImageRgba8(image.clone()).to_rgb8();
            JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100)).write_image(
                rgb.as_raw(),
                w,
                h,
                ColorType::Rgb8,
            )
        }
        RasterFormat::Bmp => BmpEncoder::new(&mut out).write_image(image.as_raw(), w, h, ColorType::Rgba8),
    };
    res.map_err(|e| EngineError::Encode(e.to_string()))?;
    Ok(out)
}

/// Decode a raster source to straight RGBA8.
pub fn decode_raster(source: &RasterSource) -> Result<RgbaImage> {
    match source {
        RasterSource::Encoded(bytes) => {
            if bytes.is_empty() {
                return Err(EngineError::Decode("empty raster".into()));
            }
            let img = image::load_from_memory(bytes).map_err(|e| EngineError::Decode(e.to_string()))?;
            Ok(img.to_rgba8())
        }
        RasterSource::Raw { width, height, pixels } => {
            let expected = *width as usize * *height as usize * 4;
            if pixels.len() != expected {
                return Err(EngineError::Decode(format!(
                    "raw raster is {} bytes, expected {expected} for {width}×{height}",
                    pixels.len()
                )));
            }
            RgbaImage::from_raw(*width, *height, pixels.clone())
                .ok_or_else(|| EngineError::Decode("raw raster does not fit its dimensions".into()))
        }
    }
}

// ============================================================================
// LAYER TRANSPORT
// ============================================================================

/// One exported layer: modifiers plus an encoded snapshot of its surface.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LayerRecord {
    pub name: String,
    pub visible: bool,
    pub opacity: f32,
    /// Canvas-style blend mode name (e.g. "multiply").
    pub blend_mode: String,
    pub locked: bool,
    pub raster: Vec<u8>,
}

/// Magic header for the layer document container.
const DOCUMENT_MAGIC: &str = "LYR1";
/// Maximum supported canvas dimension in pixels (per axis).
const MAX_CANVAS_DIM: u32 = 32_768;
/// Maximum number of layers in a document.
const MAX_LAYERS: usize = 256;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LayerDocument {
    magic: String,
    pub width: u32,
    pub height: u32,
    pub active_layer_index: usize,
    pub layers: Vec<LayerRecord>,
}

impl LayerDocument {
    pub fn new(width: u32, height: u32, active_layer_index: usize, layers: Vec<LayerRecord>) -> Self {
        Self { magic: DOCUMENT_MAGIC.to_string(), width, height, active_layer_index, layers }
    }

    fn validate(&self) -> Result<()> {
        if self.magic != DOCUMENT_MAGIC {
            return Err(EngineError::InvalidFormat(format!("unknown magic '{}'", self.magic)));
        }
        if self.width > MAX_CANVAS_DIM || self.height > MAX_CANVAS_DIM {
            return Err(EngineError::InvalidFormat(format!(
                "canvas {}×{} exceeds the {MAX_CANVAS_DIM} pixel limit",
                self.width, self.height
            )));
        }
        if self.layers.is_empty() || self.layers.len() > MAX_LAYERS {
            return Err(EngineError::InvalidFormat(format!(
                "document has {} layers (expected 1..={MAX_LAYERS})",
                self.layers.len()
            )));
        }
        Ok(())
    }
}

/// Serialize + write a document to disk.
pub fn write_document(doc: &LayerDocument, path: &Path) -> Result<()> {
    let file = File::create(path)?;
    let writer = BufWriter::new(file);
    bincode::serialize_into(writer, doc)?;
    Ok(())
}

/// Read and validate a document from disk.
pub fn read_document(path: &Path) -> Result<LayerDocument> {
    let mut raw = Vec::new();
    BufReader::new(File::open(path)?).read_to_end(&mut raw)?;
    // bincode encodes a String as an 8-byte length prefix + UTF-8 data, so the
    // 4-char magic lives at bytes 8..12.
    if raw.len() < 12 {
        return Err(EngineError::InvalidFormat("file too small".into()));
    }
    let magic = std::str::from_utf8(&raw[8..12]).unwrap_or("");
    if magic != DOCUMENT_MAGIC {
        return Err(EngineError::InvalidFormat(format!("unknown magic '{magic}'")));
    }
    let doc: LayerDocument = bincode::deserialize_from(Cursor::new(raw))?;
    doc.validate()?;
    Ok(doc)
}
