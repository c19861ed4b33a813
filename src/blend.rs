//! Blend modes and the per-pixel compositing math.
//!
//! Surfaces hold straight (non-premultiplied) RGBA8. A layer's opacity is
//! multiplied into the source alpha *before* the blend mode sees it, and the
//! same [`blend_pixel`] runs for rendering, merge-down, drawing and raster
//! loading, so every path agrees on the result.
//!
//! Separable and non-separable modes follow the W3C Compositing Level 1
//! formulas composited with source-over. The Porter-Duff operators use the
//! usual `Fa`/`Fb` factors.

use std::fmt;
use std::str::FromStr;

use image::{Rgba, RgbaImage};
use rayon::prelude::*;

use crate::canvas::{CHUNK_SIZE, TRANSPARENT, TiledImage};
use crate::error::EngineError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum BlendMode {
    #[default]
    SourceOver,
    SourceIn,
    SourceOut,
    SourceAtop,
    DestinationOver,
    DestinationIn,
    DestinationOut,
    DestinationAtop,
    Lighter,
    Copy,
    Xor,
    Multiply,
    Screen,
    Overlay,
    Darken,
    Lighten,
    ColorDodge,
    ColorBurn,
    HardLight,
    SoftLight,
    Difference,
    Exclusion,
    Hue,
    Saturation,
    Color,
    Luminosity,
}

impl BlendMode {
    /// Every supported mode, in stable code order.
    pub fn all() -> &'static [BlendMode] {
        &[
            BlendMode::SourceOver,
            BlendMode::SourceIn,
            BlendMode::SourceOut,
            BlendMode::SourceAtop,
            BlendMode::DestinationOver,
            BlendMode::DestinationIn,
            BlendMode::DestinationOut,
            BlendMode::DestinationAtop,
            BlendMode::Lighter,
            BlendMode::Copy,
            BlendMode::Xor,
            BlendMode::Multiply,
            BlendMode::Screen,
            BlendMode::Overlay,
            BlendMode::Darken,
            BlendMode::Lighten,
            BlendMode::ColorDodge,
            BlendMode::ColorBurn,
            BlendMode::HardLight,
            BlendMode::SoftLight,
            BlendMode::Difference,
            BlendMode::Exclusion,
            BlendMode::Hue,
            BlendMode::Saturation,
            BlendMode::Color,
            BlendMode::Luminosity,
        ]
    }

    /// Canonical name, as used by the export format.
    pub fn name(&self) -> &'static str {
        match self {
            BlendMode::SourceOver => "source-over",
            BlendMode::SourceIn => "source-in",
            BlendMode::SourceOut => "source-out",
            BlendMode::SourceAtop => "source-atop",
            BlendMode::DestinationOver => "destination-over",
            BlendMode::DestinationIn => "destination-in",
            BlendMode::DestinationOut => "destination-out",
            BlendMode::DestinationAtop => "destination-atop",
            BlendMode::Lighter => "lighter",
            BlendMode::Copy => "copy",
            BlendMode::Xor => "xor",
            BlendMode::Multiply => "multiply",
            BlendMode::Screen => "screen",
            BlendMode::Overlay => "overlay",
            BlendMode::Darken => "darken",
            BlendMode::Lighten => "lighten",
            BlendMode::ColorDodge => "color-dodge",
            BlendMode::ColorBurn => "color-burn",
            BlendMode::HardLight => "hard-light",
            BlendMode::SoftLight => "soft-light",
            BlendMode::Difference => "difference",
            BlendMode::Exclusion => "exclusion",
            BlendMode::Hue => "hue",
            BlendMode::Saturation => "saturation",
            BlendMode::Color => "color",
            BlendMode::Luminosity => "luminosity",
        }
    }

    /// Convert to a stable u8 for binary serialization
    pub fn to_u8(&self) -> u8 {
        Self::all()
            .iter()
            .position(|m| m == self)
            .unwrap_or(0) as u8
    }

    /// Reconstruct from a u8. Unknown codes are an error, not `SourceOver`.
    pub fn from_u8(v: u8) -> Result<Self, EngineError> {
        Self::all()
            .get(v as usize)
            .copied()
            .ok_or_else(|| EngineError::InvalidBlendMode(format!("code {}", v)))
    }

    /// Whether a fully transparent source pixel leaves the backdrop untouched.
    ///
    /// When false, the operator must visit every pixel of the canvas, not just
    /// the places where the source has content.
    pub fn preserves_backdrop(&self) -> bool {
        !matches!(
            self,
            BlendMode::SourceIn
                | BlendMode::SourceOut
                | BlendMode::DestinationIn
                | BlendMode::DestinationAtop
                | BlendMode::Copy
        )
    }
}

impl fmt::Display for BlendMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BlendMode {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = s.trim().to_ascii_lowercase();
        if key == "normal" {
            return Ok(BlendMode::SourceOver);
        }
        Self::all()
            .iter()
            .copied()
            .find(|m| m.name() == key)
            .ok_or_else(|| EngineError::InvalidBlendMode(s.to_string()))
    }
}

// ============================================================================
// PER-PIXEL MATH
// ============================================================================

#[inline]
fn unit(c: u8) -> f32 {
    c as f32 / 255.0
}

#[inline]
fn to_u8(v: f32) -> u8 {
    (v.clamp(0.0, 1.0) * 255.0 + 0.5) as u8
}

/// Composite `top` over `base` with `mode`, scaling `top`'s alpha by `opacity`.
pub fn blend_pixel(base: Rgba<u8>, top: Rgba<u8>, mode: BlendMode, opacity: f32) -> Rgba<u8> {
    let opacity = if opacity.is_nan() { 0.0 } else { opacity.clamp(0.0, 1.0) };

    // Fast path: transparent top pixel under an operator that keeps the backdrop
    if (top[3] == 0 || opacity <= 0.0) && mode.preserves_backdrop() {
        return base;
    }

    // Fast path: source-over, full opacity, opaque top pixel: just overwrite
    if mode == BlendMode::SourceOver && opacity >= 1.0 && top[3] == 255 {
        return top;
    }

    let ab = unit(base[3]);
    let as_ = unit(top[3]) * opacity;
    let cb = [unit(base[0]), unit(base[1]), unit(base[2])];
    let cs = [unit(top[0]), unit(top[1]), unit(top[2])];

    if mode == BlendMode::Lighter {
        let ao = (as_ + ab).min(1.0);
        if ao <= 0.0 {
            return TRANSPARENT;
        }
        let ch = |i: usize| ((as_ * cs[i] + ab * cb[i]).min(1.0) / ao).min(1.0);
        return Rgba([to_u8(ch(0)), to_u8(ch(1)), to_u8(ch(2)), to_u8(ao)]);
    }

    let (fa, fb, src) = match mode {
        BlendMode::SourceOver => (1.0, 1.0 - as_, cs),
        BlendMode::SourceIn => (ab, 0.0, cs),
        BlendMode::SourceOut => (1.0 - ab, 0.0, cs),
        BlendMode::SourceAtop => (ab, 1.0 - as_, cs),
        BlendMode::DestinationOver => (1.0 - ab, 1.0, cs),
        BlendMode::DestinationIn => (0.0, as_, cs),
        BlendMode::DestinationOut => (0.0, 1.0 - as_, cs),
        BlendMode::DestinationAtop => (1.0 - ab, as_, cs),
        BlendMode::Copy => (1.0, 0.0, cs),
        BlendMode::Xor => (1.0 - ab, 1.0 - as_, cs),
        BlendMode::Lighter => (1.0, 1.0, cs),
        _ => {
            // Mix the blended colour with the source by backdrop coverage,
            // then composite source-over.
            let blended = blend_color(mode, cb, cs);
            let mixed = [
                (1.0 - ab) * cs[0] + ab * blended[0],
                (1.0 - ab) * cs[1] + ab * blended[1],
                (1.0 - ab) * cs[2] + ab * blended[2],
            ];
            (1.0, 1.0 - as_, mixed)
        }
    };

    let ao = as_ * fa + ab * fb;
    if ao <= 0.0 {
        return TRANSPARENT;
    }
    let ch = |i: usize| (as_ * fa * src[i] + ab * fb * cb[i]) / ao;
    Rgba([to_u8(ch(0)), to_u8(ch(1)), to_u8(ch(2)), to_u8(ao)])
}

/// The blend function `B(Cb, Cs)` for the colour-mixing modes.
fn blend_color(mode: BlendMode, cb: [f32; 3], cs: [f32; 3]) -> [f32; 3] {
    let sep = |f: fn(f32, f32) -> f32| [f(cb[0], cs[0]), f(cb[1], cs[1]), f(cb[2], cs[2])];
    match mode {
        BlendMode::Multiply => sep(|b, s| b * s),
        BlendMode::Screen => sep(screen_channel),
        BlendMode::Overlay => sep(|b, s| hard_light_channel(s, b)),
        BlendMode::Darken => sep(f32::min),
        BlendMode::Lighten => sep(f32::max),
        BlendMode::ColorDodge => sep(color_dodge_channel),
        BlendMode::ColorBurn => sep(color_burn_channel),
        BlendMode::HardLight => sep(hard_light_channel),
        BlendMode::SoftLight => sep(soft_light_channel),
        BlendMode::Difference => sep(|b, s| (b - s).abs()),
        BlendMode::Exclusion => sep(|b, s| b + s - 2.0 * b * s),
        BlendMode::Hue => set_lum(set_sat(cs, sat(cb)), lum(cb)),
        BlendMode::Saturation => set_lum(set_sat(cb, sat(cs)), lum(cb)),
        BlendMode::Color => set_lum(cs, lum(cb)),
        BlendMode::Luminosity => set_lum(cb, lum(cs)),
        _ => cs,
    }
}

fn screen_channel(base: f32, top: f32) -> f32 {
    base + top - base * top
}

fn hard_light_channel(base: f32, top: f32) -> f32 {
    if top <= 0.5 {
        base * 2.0 * top
    } else {
        screen_channel(base, 2.0 * top - 1.0)
    }
}

fn color_dodge_channel(base: f32, top: f32) -> f32 {
    if base <= 0.0 {
        0.0
    } else if top >= 1.0 {
        1.0
    } else {
        (base / (1.0 - top)).min(1.0)
    }
}

fn color_burn_channel(base: f32, top: f32) -> f32 {
    if base >= 1.0 {
        1.0
    } else if top <= 0.0 {
        0.0
    } else {
        1.0 - ((1.0 - base) / top).min(1.0)
    }
}

/// W3C Soft Light formula.
fn soft_light_channel(base: f32, top: f32) -> f32 {
    if top <= 0.5 {
        base - (1.0 - 2.0 * top) * base * (1.0 - base)
    } else {
        let d = if base <= 0.25 {
            ((16.0 * base - 12.0) * base + 4.0) * base
        } else {
            base.sqrt()
        };
        base + (2.0 * top - 1.0) * (d - base)
    }
}

// ---- non-separable helpers ---------------------------------------------------

fn lum(c: [f32; 3]) -> f32 {
    0.3 * c[0] + 0.59 * c[1] + 0.11 * c[2]
}

fn clip_color(c: [f32; 3]) -> [f32; 3] {
    let l = lum(c);
    let n = c[0].min(c[1]).min(c[2]);
    let x = c[0].max(c[1]).max(c[2]);
    let mut out = c;
    if n < 0.0 {
        for v in &mut out {
            *v = l + (*v - l) * l / (l - n);
        }
    }
    if x > 1.0 {
        for v in &mut out {
            *v = l + (*v - l) * (1.0 - l) / (x - l);
        }
    }
    out
}

fn set_lum(c: [f32; 3], l: f32) -> [f32; 3] {
    let d = l - lum(c);
    clip_color([c[0] + d, c[1] + d, c[2] + d])
}

fn sat(c: [f32; 3]) -> f32 {
    c[0].max(c[1]).max(c[2]) - c[0].min(c[1]).min(c[2])
}

fn set_sat(c: [f32; 3], s: f32) -> [f32; 3] {
    let max = c[0].max(c[1]).max(c[2]);
    let min = c[0].min(c[1]).min(c[2]);
    if max <= min {
        return [0.0; 3];
    }
    let scale = |v: f32| (v - min) * s / (max - min);
    [scale(c[0]), scale(c[1]), scale(c[2])]
}

// ============================================================================
// SURFACE COMPOSITING
// ============================================================================

/// Composite `src` onto `dst` (same dimensions) with `mode` and `opacity`.
///
/// Work is split per chunk and run in parallel with rayon. For operators
/// that keep the backdrop under transparent source pixels, only the chunks
/// `src` populates are visited; the others visit the whole grid.
pub fn composite_onto(dst: &mut TiledImage, src: &TiledImage, mode: BlendMode, opacity: f32) {
    debug_assert_eq!(
        (dst.width(), dst.height()),
        (src.width(), src.height()),
        "composite requires matching surface sizes"
    );
    let opacity = if opacity.is_nan() { 0.0 } else { opacity.clamp(0.0, 1.0) };
    let preserves = mode.preserves_backdrop();
    if preserves && opacity <= 0.0 {
        return;
    }

    let keys: Vec<(u32, u32)> = if preserves {
        src.chunk_keys().collect()
    } else {
        dst.all_chunk_keys().collect()
    };

    let base_img = &*dst;
    let chunk_results: Vec<(u32, u32, Option<RgbaImage>)> = keys
        .par_iter()
        .map(|&(cx, cy)| {
            let base = base_img.get_chunk(cx, cy);
            let top = src.get_chunk(cx, cy);
            if base.is_none() && top.is_none() {
                return (cx, cy, None);
            }
            let (cw, ch) = base_img.chunk_extent(cx, cy);
            let mut out = RgbaImage::new(CHUNK_SIZE, CHUNK_SIZE);
            let mut has_content = false;
            for ly in 0..ch {
                for lx in 0..cw {
                    let b = base.map(|c| *c.get_pixel(lx, ly)).unwrap_or(TRANSPARENT);
                    let t = top.map(|c| *c.get_pixel(lx, ly)).unwrap_or(TRANSPARENT);
                    let px = blend_pixel(b, t, mode, opacity);
                    if px[3] != 0 {
                        has_content = true;
                    }
                    out.put_pixel(lx, ly, px);
                }
            }
            (cx, cy, has_content.then_some(out))
        })
        .collect();

    for (cx, cy, chunk) in chunk_results {
        dst.replace_chunk(cx, cy, chunk);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canvas::DEFAULT_MAX_PIXELS;

    const WHITE: Rgba<u8> = Rgba([255, 255, 255, 255]);
    const RED: Rgba<u8> = Rgba([255, 0, 0, 255]);
    const BLUE: Rgba<u8> = Rgba([0, 0, 255, 255]);

    #[test]
    fn names_round_trip_and_unknown_is_rejected() {
        for mode in BlendMode::all() {
            assert_eq!(mode.name().parse::<BlendMode>().unwrap(), *mode);
            assert_eq!(BlendMode::from_u8(mode.to_u8()).unwrap(), *mode);
        }
        assert_eq!("normal".parse::<BlendMode>().unwrap(), BlendMode::SourceOver);
        assert!(matches!("sparkle".parse::<BlendMode>(), Err(EngineError::InvalidBlendMode(_))));
        assert!(BlendMode::from_u8(200).is_err());
    }

    #[test]
    fn half_opacity_red_over_white_is_pink() {
        let out = blend_pixel(WHITE, RED, BlendMode::SourceOver, 0.5);
        assert_eq!(out, Rgba([255, 128, 128, 255]));
    }

    #[test]
    fn difference_is_not_commutative_over_backdrop() {
        let red_then_blue = blend_pixel(blend_pixel(WHITE, RED, BlendMode::SourceOver, 1.0), BLUE, BlendMode::Difference, 1.0);
        assert_eq!(red_then_blue, Rgba([255, 0, 255, 255]));
        let blue_diff_on_white = blend_pixel(WHITE, BLUE, BlendMode::Difference, 1.0);
        assert_eq!(blue_diff_on_white, Rgba([255, 255, 0, 255]));
    }

    #[test]
    fn porter_duff_operators() {
        let half_red = Rgba([255, 0, 0, 128]);
        assert_eq!(blend_pixel(BLUE, RED, BlendMode::Copy, 1.0), RED);
        assert_eq!(blend_pixel(BLUE, TRANSPARENT, BlendMode::Copy, 1.0), TRANSPARENT);
        assert_eq!(blend_pixel(BLUE, RED, BlendMode::DestinationOver, 1.0), BLUE);
        assert_eq!(blend_pixel(TRANSPARENT, RED, BlendMode::SourceIn, 1.0), TRANSPARENT);
        assert_eq!(blend_pixel(BLUE, RED, BlendMode::SourceIn, 1.0), RED);
        assert_eq!(blend_pixel(BLUE, RED, BlendMode::DestinationOut, 1.0), TRANSPARENT);
        assert_eq!(blend_pixel(BLUE, RED, BlendMode::Xor, 1.0), TRANSPARENT);
        let out = blend_pixel(BLUE, half_red, BlendMode::DestinationIn, 1.0);
        assert_eq!(out[2], 255);
        assert_eq!(out[3], 128);
    }

    #[test]
    fn lighter_adds_and_clamps() {
        let out = blend_pixel(Rgba([200, 10, 0, 255]), Rgba([100, 10, 0, 255]), BlendMode::Lighter, 1.0);
        assert_eq!(out, Rgba([255, 20, 0, 255]));
    }

    #[test]
    fn separable_modes_on_opaque_pixels() {
        let grey = Rgba([128, 128, 128, 255]);
        assert_eq!(blend_pixel(WHITE, grey, BlendMode::Multiply, 1.0), grey);
        assert_eq!(blend_pixel(grey, WHITE, BlendMode::Screen, 1.0), WHITE);
        assert_eq!(blend_pixel(RED, BLUE, BlendMode::Darken, 1.0), Rgba([0, 0, 0, 255]));
        assert_eq!(blend_pixel(RED, BLUE, BlendMode::Lighten, 1.0), Rgba([255, 0, 255, 255]));
        assert_eq!(blend_pixel(WHITE, WHITE, BlendMode::Exclusion, 1.0), Rgba([0, 0, 0, 255]));
    }

    #[test]
    fn luminosity_of_white_onto_colour_is_white() {
        let out = blend_pixel(RED, WHITE, BlendMode::Luminosity, 1.0);
        assert_eq!(out, WHITE);
        // Hue of a grey source keeps the backdrop's luminance and is grey.
        let out = blend_pixel(RED, Rgba([10, 10, 10, 255]), BlendMode::Hue, 1.0);
        assert_eq!(out[0], out[1]);
        assert_eq!(out[1], out[2]);
    }

    #[test]
    fn blend_over_transparent_backdrop_returns_source() {
        let half_blue = Rgba([0, 0, 255, 100]);
        for mode in [BlendMode::Multiply, BlendMode::Difference, BlendMode::Overlay] {
            assert_eq!(blend_pixel(TRANSPARENT, half_blue, mode, 1.0), half_blue);
        }
    }

    #[test]
    fn destructive_operator_visits_empty_chunks() {
        let mut dst = TiledImage::try_new_filled(130, 10, WHITE, DEFAULT_MAX_PIXELS).unwrap();
        let mut src = TiledImage::try_new(130, 10, DEFAULT_MAX_PIXELS).unwrap();
        src.put_pixel(1, 1, RED);

        composite_onto(&mut dst, &src, BlendMode::SourceIn, 1.0);
        assert_eq!(*dst.get_pixel(1, 1), RED);
        assert_eq!(*dst.get_pixel(100, 5), TRANSPARENT);
        assert_eq!(dst.chunk_count(), 1);
    }

    #[test]
    fn zero_opacity_source_over_is_skipped() {
        let mut dst = TiledImage::try_new_filled(8, 8, WHITE, DEFAULT_MAX_PIXELS).unwrap();
        let src = TiledImage::try_new_filled(8, 8, RED, DEFAULT_MAX_PIXELS).unwrap();
        composite_onto(&mut dst, &src, BlendMode::SourceOver, 0.0);
        assert_eq!(*dst.get_pixel(4, 4), WHITE);
    }
}
