use std::fmt;

use image::{Rgba, RgbaImage};
use uuid::Uuid;

use crate::blend::{BlendMode, composite_onto};
use crate::canvas::{DEFAULT_MAX_PIXELS, TiledImage};
use crate::error::Result;
use crate::io::{RasterFormat, RasterSource, decode_raster, encode_raster};
use crate::ops::shapes::{Primitive, StrokeStyle, draw_primitive};

/// Stable, process-local layer identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LayerId(Uuid);

impl LayerId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Initial modifiers for a new layer.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LayerOptions {
    pub visible: bool,
    pub opacity: f32,
    pub blend_mode: BlendMode,
    pub locked: bool,
}

impl Default for LayerOptions {
    fn default() -> Self {
        Self { visible: true, opacity: 1.0, blend_mode: BlendMode::SourceOver, locked: false }
    }
}

/// One raster surface plus its visual modifiers.
///
/// A layer knows nothing about its neighbours; ordering and compositing are the
/// stack's job.
#[derive(Clone, Debug)]
pub struct Layer {
    id: LayerId,
    name: String,
    surface: TiledImage,
    visible: bool,
    locked: bool,
    opacity: f32,
    blend_mode: BlendMode,
    is_background: bool,
    background_color: Rgba<u8>,
    max_pixels: u64,
    /// Latest decode issued for this layer; older results are stale.
    decode_generation: u64,
}

impl Layer {
    /// Transparent layer of the given size.
    pub fn new(name: impl Into<String>, width: u32, height: u32, options: LayerOptions) -> Result<Self> {
        Self::with_limit(name, width, height, options, DEFAULT_MAX_PIXELS)
    }

    pub(crate) fn with_limit(
        name: impl Into<String>,
        width: u32,
        height: u32,
        options: LayerOptions,
        max_pixels: u64,
    ) -> Result<Self> {
        let surface = TiledImage::try_new(width, height, max_pixels)?;
        let mut layer = Self {
            id: LayerId::new(),
            name: name.into(),
            surface,
            visible: options.visible,
            locked: options.locked,
            opacity: 1.0,
            blend_mode: options.blend_mode,
            is_background: false,
            background_color: Rgba([255, 255, 255, 255]),
            max_pixels,
            decode_generation: 0,
        };
        layer.set_opacity(options.opacity);
        Ok(layer)
    }

    /// Background layer, filled with `color`.
    pub(crate) fn background(
        name: impl Into<String>,
        width: u32,
        height: u32,
        color: Rgba<u8>,
        max_pixels: u64,
    ) -> Result<Self> {
        let mut layer = Self::with_limit(name, width, height, LayerOptions::default(), max_pixels)?;
        layer.is_background = true;
        layer.background_color = color;
        layer.surface.fill(color);
        Ok(layer)
    }

    /// Copy with a fresh id. Raster and modifiers are shared copy-on-write;
    /// the background flag is never propagated.
    pub(crate) fn duplicate(&self, name: impl Into<String>) -> Self {
        let mut copy = self.clone();
        copy.id = LayerId::new();
        copy.name = name.into();
        copy.is_background = false;
        copy.decode_generation = 0;
        copy
    }

    // ---- getters ------------------------------------------------------------

    pub fn id(&self) -> LayerId { self.id }
    pub fn name(&self) -> &str { &self.name }
    pub fn is_visible(&self) -> bool { self.visible }
    pub fn is_locked(&self) -> bool { self.locked }
    pub fn opacity(&self) -> f32 { self.opacity }
    pub fn blend_mode(&self) -> BlendMode { self.blend_mode }
    pub fn is_background(&self) -> bool { self.is_background }
    pub fn width(&self) -> u32 { self.surface.width() }
    pub fn height(&self) -> u32 { self.surface.height() }
    pub fn surface(&self) -> &TiledImage { &self.surface }
    pub fn decode_generation(&self) -> u64 { self.decode_generation }

    pub fn pixel(&self, x: u32, y: u32) -> Rgba<u8> {
        *self.surface.get_pixel(x, y)
    }

    // ---- modifiers ----------------------------------------------------------

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn set_visible(&mut self, visible: bool) {
        self.visible = visible;
    }

    pub fn show(&mut self) {
        self.visible = true;
    }

    pub fn hide(&mut self) {
        self.visible = false;
    }

    pub fn set_locked(&mut self, locked: bool) {
        self.locked = locked;
    }

    pub fn lock(&mut self) {
        self.locked = true;
    }

    pub fn unlock(&mut self) {
        self.locked = false;
    }

    /// Clamped to `[0, 1]`; NaN is ignored.
    pub fn set_opacity(&mut self, opacity: f32) {
        if opacity.is_nan() {
            log::warn!("ignoring NaN opacity for layer '{}'", self.name);
            return;
        }
        self.opacity = opacity.clamp(0.0, 1.0);
    }

    pub fn set_blend_mode(&mut self, mode: BlendMode) {
        self.blend_mode = mode;
    }

    /// Parse and apply a canvas-style mode name. On error the previous mode is kept.
    pub fn set_blend_mode_name(&mut self, name: &str) -> Result<()> {
        self.blend_mode = name.parse()?;
        Ok(())
    }

    // ---- surface ------------------------------------------------------------

    /// Reset to transparent, or to the background colour for background layers.
    pub fn clear(&mut self) {
        if self.is_background {
            self.surface.fill(self.background_color);
        } else {
            self.surface.clear();
        }
    }

    /// Resize anchored at the origin, keeping the overlapping content.
    pub fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        let surface = self.resized_surface(width, height)?;
        self.install_surface(surface);
        Ok(())
    }

    /// The surface this layer would have after `resize`, without touching it.
    pub(crate) fn resized_surface(&self, width: u32, height: u32) -> Result<TiledImage> {
        let fill = self.is_background.then_some(self.background_color);
        self.surface.resized(width, height, fill, self.max_pixels)
    }

    pub(crate) fn install_surface(&mut self, surface: TiledImage) {
        self.surface = surface;
    }

    /// Rasterize a primitive. Returns false (and leaves the surface alone)
    /// when the layer is locked or nothing was touched.
    pub fn draw(&mut self, primitive: &Primitive, style: &StrokeStyle) -> bool {
        if self.locked {
            log::warn!("draw rejected: layer '{}' is locked", self.name);
            return false;
        }
        draw_primitive(&mut self.surface, primitive, style)
    }

    /// Encode the current surface.
    pub fn snapshot_raster(&self, format: RasterFormat, quality: u8) -> Result<Vec<u8>> {
        encode_raster(&self.surface.to_rgba_image(), format, quality)
    }

    /// Decode `source` and replace the surface with it (blocking).
    /// On error the prior content is kept.
    pub fn load_raster(&mut self, source: &RasterSource) -> Result<()> {
        let image = decode_raster(source)?;
        let generation = self.begin_decode();
        self.apply_decoded(generation, &image);
        Ok(())
    }

    /// Issue a new decode generation; any result from an older one will be discarded.
    pub fn begin_decode(&mut self) -> u64 {
        self.decode_generation += 1;
        self.decode_generation
    }

    /// Clear and draw `image` at the origin if `generation` is still the latest.
    pub fn apply_decoded(&mut self, generation: u64, image: &RgbaImage) -> bool {
        if generation != self.decode_generation {
            log::warn!(
                "discarding stale decode {} for layer '{}' (latest {})",
                generation,
                self.name,
                self.decode_generation
            );
            return false;
        }
        let src = TiledImage::from_rgba_image_sized(image, self.width(), self.height());
        self.clear();
        composite_onto(&mut self.surface, &src, BlendMode::SourceOver, 1.0);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;

    const RED: Rgba<u8> = Rgba([255, 0, 0, 255]);
    const WHITE: Rgba<u8> = Rgba([255, 255, 255, 255]);

    fn rect(x: f32, y: f32, w: f32, h: f32) -> Primitive {
        Primitive::Rect { x, y, width: w, height: h }
    }

    #[test]
    fn new_layer_is_transparent_with_defaults() {
        let layer = Layer::new("Layer 2", 32, 16, LayerOptions::default()).unwrap();
        assert_eq!((layer.width(), layer.height()), (32, 16));
        assert!(layer.is_visible());
        assert!(!layer.is_locked());
        assert_eq!(layer.opacity(), 1.0);
        assert_eq!(layer.blend_mode(), BlendMode::SourceOver);
        assert!(!layer.is_background());
        assert_eq!(layer.pixel(3, 3)[3], 0);
    }

    #[test]
    fn oversized_layer_fails_to_allocate() {
        let err = Layer::with_limit("big", 1000, 1000, LayerOptions::default(), 10_000).unwrap_err();
        assert!(matches!(err, EngineError::Allocation { width: 1000, height: 1000 }));
    }

    #[test]
    fn background_clears_to_its_colour() {
        let mut bg = Layer::background("Background", 8, 8, WHITE, DEFAULT_MAX_PIXELS).unwrap();
        assert_eq!(bg.pixel(0, 0), WHITE);
        bg.draw(&rect(0.0, 0.0, 8.0, 8.0), &StrokeStyle::fill(RED));
        assert_eq!(bg.pixel(4, 4), RED);
        bg.clear();
        assert_eq!(bg.pixel(4, 4), WHITE);
    }

    #[test]
    fn opacity_is_clamped_and_nan_ignored() {
        let mut layer = Layer::new("l", 1, 1, LayerOptions::default()).unwrap();
        layer.set_opacity(1.5);
        assert_eq!(layer.opacity(), 1.0);
        layer.set_opacity(-0.5);
        assert_eq!(layer.opacity(), 0.0);
        layer.set_opacity(0.25);
        layer.set_opacity(f32::NAN);
        assert_eq!(layer.opacity(), 0.25);
    }

    #[test]
    fn invalid_blend_name_keeps_previous_mode() {
        let mut layer = Layer::new("l", 1, 1, LayerOptions::default()).unwrap();
        layer.set_blend_mode_name("multiply").unwrap();
        assert!(layer.set_blend_mode_name("sparkle").is_err());
        assert_eq!(layer.blend_mode(), BlendMode::Multiply);
    }

    #[test]
    fn locked_layer_rejects_drawing() {
        let mut layer = Layer::new("l", 16, 16, LayerOptions { locked: true, ..Default::default() }).unwrap();
        assert!(!layer.draw(&rect(0.0, 0.0, 8.0, 8.0), &StrokeStyle::fill(RED)));
        assert!(layer.surface().is_empty());
        layer.unlock();
        assert!(layer.draw(&rect(0.0, 0.0, 8.0, 8.0), &StrokeStyle::fill(RED)));
        assert_eq!(layer.pixel(2, 2), RED);
    }

    #[test]
    fn resize_keeps_overlap_and_background_fills_growth() {
        let mut bg = Layer::background("Background", 10, 10, WHITE, DEFAULT_MAX_PIXELS).unwrap();
        bg.draw(&rect(0.0, 0.0, 4.0, 4.0), &StrokeStyle::fill(RED));
        bg.resize(20, 5).unwrap();
        assert_eq!((bg.width(), bg.height()), (20, 5));
        assert_eq!(bg.pixel(1, 1), RED);
        assert_eq!(bg.pixel(15, 2), WHITE);

        let mut top = Layer::new("top", 10, 10, LayerOptions::default()).unwrap();
        top.draw(&rect(0.0, 0.0, 4.0, 4.0), &StrokeStyle::fill(RED));
        top.resize(0, 0).unwrap();
        top.resize(12, 12).unwrap();
        assert_eq!(top.pixel(1, 1)[3], 0);
    }

    #[test]
    fn duplicate_copies_content_but_not_identity() {
        let mut bg = Layer::background("Background", 8, 8, WHITE, DEFAULT_MAX_PIXELS).unwrap();
        bg.set_opacity(0.5);
        bg.lock();
        let copy = bg.duplicate("Background Copy");
        assert_ne!(copy.id(), bg.id());
        assert!(!copy.is_background());
        assert!(copy.is_locked());
        assert_eq!(copy.opacity(), 0.5);
        assert_eq!(copy.pixel(3, 3), WHITE);
    }

    #[test]
    fn snapshot_and_load_round_trip() {
        let mut layer = Layer::new("l", 12, 12, LayerOptions::default()).unwrap();
        layer.draw(&rect(2.0, 2.0, 5.0, 5.0), &StrokeStyle::fill(RED));
        let png = layer.snapshot_raster(RasterFormat::Png, 100).unwrap();

        let mut other = Layer::new("o", 12, 12, LayerOptions { locked: true, ..Default::default() }).unwrap();
        other.load_raster(&RasterSource::Encoded(png)).unwrap();
        assert_eq!(other.surface().to_rgba_image(), layer.surface().to_rgba_image());
    }

    #[test]
    fn failed_load_keeps_prior_content() {
        let mut layer = Layer::new("l", 8, 8, LayerOptions::default()).unwrap();
        layer.draw(&rect(0.0, 0.0, 8.0, 8.0), &StrokeStyle::fill(RED));
        assert!(layer.load_raster(&RasterSource::Encoded(vec![1, 2, 3])).is_err());
        assert_eq!(layer.pixel(4, 4), RED);
    }

    #[test]
    fn stale_decode_is_discarded() {
        let mut layer = Layer::new("l", 4, 4, LayerOptions::default()).unwrap();
        let old = layer.begin_decode();
        let new = layer.begin_decode();
        let red = RgbaImage::from_pixel(4, 4, RED);
        assert!(!layer.apply_decoded(old, &red));
        assert!(layer.surface().is_empty());
        assert!(layer.apply_decoded(new, &red));
        assert_eq!(layer.pixel(0, 0), RED);
    }

    #[test]
    fn decoded_image_is_cropped_to_the_surface() {
        let mut layer = Layer::new("l", 4, 4, LayerOptions::default()).unwrap();
        let generation = layer.begin_decode();
        assert!(layer.apply_decoded(generation, &RgbaImage::from_pixel(10, 2, RED)));
        assert_eq!(layer.pixel(3, 1), RED);
        assert_eq!(layer.pixel(3, 2)[3], 0);
    }
}
