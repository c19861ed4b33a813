use image::Rgba;
use rayon::prelude::*;

use crate::blend::{BlendMode, blend_pixel};
use crate::canvas::{TRANSPARENT, TiledImage};

/// Miter joins longer than this multiple of the half line width fall back to bevel.
const MITER_LIMIT: f32 = 10.0;

#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    fn midpoint(self, other: Point) -> Point {
        Point::new((self.x + other.x) * 0.5, (self.y + other.y) * 0.5)
    }
}

/// Drawing primitives a layer can rasterize onto its own surface.
#[derive(Clone, Debug, PartialEq)]
pub enum Primitive {
    Line { x1: f32, y1: f32, x2: f32, y2: f32 },
    Rect { x: f32, y: f32, width: f32, height: f32 },
    Circle { cx: f32, cy: f32, radius: f32 },
    Ellipse { cx: f32, cy: f32, rx: f32, ry: f32 },
    /// Polyline; filled only when `closed`.
    Path { points: Vec<Point>, closed: bool },
    /// Stroke through the midpoints of consecutive points using quadratic curves.
    SmoothPath { points: Vec<Point> },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum LineCap {
    Butt,
    #[default]
    Round,
    Square,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum LineJoin {
    Miter,
    #[default]
    Round,
    Bevel,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Shadow {
    pub color: Rgba<u8>,
    /// Blur extent in pixels (0 = hard shadow).
    pub blur: f32,
    pub offset_x: f32,
    pub offset_y: f32,
}

/// Style parameters for a single draw call.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StrokeStyle {
    pub stroke: Option<Rgba<u8>>,
    pub fill: Option<Rgba<u8>>,
    pub line_width: f32,
    pub cap: LineCap,
    pub join: LineJoin,
    pub global_alpha: f32,
    /// Operator used to put the primitive onto the layer.
    pub composite: BlendMode,
    pub shadow: Option<Shadow>,
}

impl Default for StrokeStyle {
    fn default() -> Self {
        Self {
            stroke: Some(Rgba([0, 0, 0, 255])),
            fill: None,
            line_width: 1.0,
            cap: LineCap::Round,
            join: LineJoin::Round,
            global_alpha: 1.0,
            composite: BlendMode::SourceOver,
            shadow: None,
        }
    }
}

impl StrokeStyle {
    pub fn stroke(color: Rgba<u8>, line_width: f32) -> Self {
        Self { stroke: Some(color), line_width, ..Self::default() }
    }

    pub fn fill(color: Rgba<u8>) -> Self {
        Self { stroke: None, fill: Some(color), ..Self::default() }
    }
}

// ============================================================================
// SDF functions: return signed distance (negative = inside)
// ============================================================================

/// SDF for a box centred at origin with half-extents (hx, hy).
#[inline]
fn sdf_box(px: f32, py: f32, hx: f32, hy: f32) -> f32 {
    let dx = px.abs() - hx;
    let dy = py.abs() - hy;
    let outside = (dx.max(0.0) * dx.max(0.0) + dy.max(0.0) * dy.max(0.0)).sqrt();
    let inside = dx.max(dy).min(0.0);
    outside + inside
}

/// SDF for an ellipse (approximation).
#[inline]
fn sdf_ellipse(px: f32, py: f32, rx: f32, ry: f32) -> f32 {
    let nx = px / rx;
    let ny = py / ry;
    let len = (nx * nx + ny * ny).sqrt();
    if len < 1e-8 {
        return -rx.min(ry);
    }
    let scale = (rx * rx * ny * ny + ry * ry * nx * nx).sqrt() / (rx * ry * len);
    (len - 1.0) / scale
}

/// Signed distance to a simple polygon (even-odd inside test).
fn sdf_polygon(verts: &[Point], px: f32, py: f32) -> f32 {
    let n = verts.len();
    let mut d = (px - verts[0].x).powi(2) + (py - verts[0].y).powi(2);
    let mut s: f32 = 1.0;
    let mut j = n - 1;
    for i in 0..n {
        let ex = verts[j].x - verts[i].x;
        let ey = verts[j].y - verts[i].y;
        let wx = px - verts[i].x;
        let wy = py - verts[i].y;
        let len2 = ex * ex + ey * ey;
        let t = if len2 > 0.0 { ((wx * ex + wy * ey) / len2).clamp(0.0, 1.0) } else { 0.0 };
        let bx = wx - ex * t;
        let by = wy - ey * t;
        d = d.min(bx * bx + by * by);
        // Winding contribution (crossing test)
        let c1 = py >= verts[i].y;
        let c2 = py < verts[j].y;
        let c3 = ex * wy > ey * wx;
        if (c1 && c2 && c3) || (!c1 && !c2 && !c3) {
            s = -s;
        }
        j = i;
    }
    s * d.sqrt()
}

/// Distance from the stroke outline of segment `a→b` with the given end caps.
fn sdf_segment(px: f32, py: f32, a: Point, b: Point, half: f32, start: LineCap, end: LineCap) -> f32 {
    let dx = b.x - a.x;
    let dy = b.y - a.y;
    let len = (dx * dx + dy * dy).sqrt();
    if len < 1e-6 {
        return match start {
            LineCap::Round => ((px - a.x).powi(2) + (py - a.y).powi(2)).sqrt() - half,
            LineCap::Square => sdf_box(px - a.x, py - a.y, half, half),
            LineCap::Butt => f32::INFINITY,
        };
    }
    let (ux, uy) = (dx / len, dy / len);
    let along = (px - a.x) * ux + (py - a.y) * uy;
    let across = -(px - a.x) * uy + (py - a.y) * ux;

    let cap_dist = |cap: LineCap, beyond: f32, across: f32| match cap {
        LineCap::Round => (beyond * beyond + across * across).sqrt() - half,
        LineCap::Square => (beyond - half).max(across.abs() - half),
        LineCap::Butt => beyond.max(across.abs() - half),
    };

    if along < 0.0 {
        cap_dist(start, -along, across)
    } else if along > len {
        cap_dist(end, along - len, across)
    } else {
        let side = across.abs() - half;
        // Square caps extend the body past the endpoints; measure against that.
        match (start, end) {
            (LineCap::Square, _) | (_, LineCap::Square) => {
                let pre = if start == LineCap::Square { -along - half } else { f32::NEG_INFINITY };
                let post = if end == LineCap::Square { along - len - half } else { f32::NEG_INFINITY };
                side.max(pre).max(post)
            }
            _ => side,
        }
    }
}

#[inline]
fn smoothstep(edge0: f32, edge1: f32, x: f32) -> f32 {
    let t = ((x - edge0) / (edge1 - edge0)).clamp(0.0, 1.0);
    t * t * (3.0 - 2.0 * t)
}

/// Anti-aliased coverage of a signed distance at a pixel centre.
#[inline]
fn coverage(d: f32) -> f32 {
    smoothstep(0.5, -0.5, d)
}

// ============================================================================
// COVERAGE MASKS
// ============================================================================

/// Per-pixel coverage over a canvas-clipped rectangle.
#[derive(Clone)]
struct Mask {
    x0: u32,
    y0: u32,
    w: u32,
    h: u32,
    data: Vec<f32>,
}

impl Mask {
    /// Mask covering `[min, max]` in canvas space, clipped to the canvas.
    fn new(min_x: f32, min_y: f32, max_x: f32, max_y: f32, canvas_w: u32, canvas_h: u32) -> Option<Self> {
        if !(min_x.is_finite() && min_y.is_finite() && max_x.is_finite() && max_y.is_finite()) {
            return None;
        }
        let x0 = min_x.floor().max(0.0) as u32;
        let y0 = min_y.floor().max(0.0) as u32;
        let x1 = (max_x.ceil().max(0.0) as u32).min(canvas_w);
        let y1 = (max_y.ceil().max(0.0) as u32).min(canvas_h);
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        let (w, h) = (x1 - x0, y1 - y0);
        Some(Self { x0, y0, w, h, data: vec![0.0; w as usize * h as usize] })
    }

    /// Max-accumulate `coverage(sdf(px, py))` for pixels whose centres fall in the
    /// given canvas-space box. Rows are processed in parallel.
    fn accumulate<F>(&mut self, bounds: (f32, f32, f32, f32), sdf: F)
    where
        F: Fn(f32, f32) -> f32 + Sync,
    {
        let (min_x, min_y, max_x, max_y) = bounds;
        let x0 = self.x0;
        let y0 = self.y0;
        let col_start = ((min_x.floor() - x0 as f32).max(0.0) as usize).min(self.w as usize);
        let col_end = ((max_x.ceil() - x0 as f32).max(0.0) as usize).min(self.w as usize);
        let row_start = ((min_y.floor() - y0 as f32).max(0.0) as usize).min(self.h as usize);
        let row_end = ((max_y.ceil() - y0 as f32).max(0.0) as usize).min(self.h as usize);
        if col_start >= col_end || row_start >= row_end {
            return;
        }

        self.data
            .par_chunks_mut(self.w as usize)
            .enumerate()
            .skip(row_start)
            .take(row_end - row_start)
            .for_each(|(row, row_buf)| {
                let py = (y0 + row as u32) as f32 + 0.5;
                for (col, cell) in row_buf.iter_mut().enumerate().take(col_end).skip(col_start) {
                    let px = (x0 + col as u32) as f32 + 0.5;
                    let c = coverage(sdf(px, py));
                    if c > *cell {
                        *cell = c;
                    }
                }
            });
    }

    fn accumulate_all<F>(&mut self, sdf: F)
    where
        F: Fn(f32, f32) -> f32 + Sync,
    {
        let bounds = (
            self.x0 as f32,
            self.y0 as f32,
            (self.x0 + self.w) as f32,
            (self.y0 + self.h) as f32,
        );
        self.accumulate(bounds, sdf);
    }

    #[inline]
    fn at(&self, x: i64, y: i64) -> f32 {
        if x < self.x0 as i64 || y < self.y0 as i64 {
            return 0.0;
        }
        let (lx, ly) = ((x - self.x0 as i64) as u32, (y - self.y0 as i64) as u32);
        if lx >= self.w || ly >= self.h {
            return 0.0;
        }
        self.data[(ly * self.w + lx) as usize]
    }

    fn union(&self, other: &Mask) -> Mask {
        let mut out = self.clone();
        for (a, b) in out.data.iter_mut().zip(&other.data) {
            *a = a.max(*b);
        }
        out
    }

    /// Separable box blur with the given radius, done twice for a softer falloff.
    fn blur(&mut self, radius: u32) {
        if radius == 0 {
            return;
        }
        let (w, h) = (self.w as usize, self.h as usize);
        let r = radius as i64;
        for _ in 0..2 {
            let src = self.data.clone();
            for y in 0..h {
                for x in 0..w {
                    let mut sum = 0.0;
                    for k in -r..=r {
                        let sx = x as i64 + k;
                        if sx >= 0 && (sx as usize) < w {
                            sum += src[y * w + sx as usize];
                        }
                    }
                    self.data[y * w + x] = sum / (2 * r + 1) as f32;
                }
            }
            let src = self.data.clone();
            for y in 0..h {
                for x in 0..w {
                    let mut sum = 0.0;
                    for k in -r..=r {
                        let sy = y as i64 + k;
                        if sy >= 0 && (sy as usize) < h {
                            sum += src[sy as usize * w + x];
                        }
                    }
                    self.data[y * w + x] = sum / (2 * r + 1) as f32;
                }
            }
        }
    }
}

// ============================================================================
// GEOMETRY
// ============================================================================

/// Flatten a quadratic Bézier into `out` (excluding the start point).
fn flatten_quad(p0: Point, ctrl: Point, p1: Point, out: &mut Vec<Point>) {
    let chord = ((p1.x - p0.x).powi(2) + (p1.y - p0.y).powi(2)).sqrt()
        + ((ctrl.x - p0.x).powi(2) + (ctrl.y - p0.y).powi(2)).sqrt();
    let steps = ((chord / 2.0).ceil() as usize).clamp(2, 64);
    for i in 1..=steps {
        let t = i as f32 / steps as f32;
        let mt = 1.0 - t;
        out.push(Point::new(
            mt * mt * p0.x + 2.0 * mt * t * ctrl.x + t * t * p1.x,
            mt * mt * p0.y + 2.0 * mt * t * ctrl.y + t * t * p1.y,
        ));
    }
}

/// Polyline for a smooth path: quadratic curves through consecutive midpoints,
/// ending on the last point.
pub(crate) fn smooth_polyline(points: &[Point]) -> Vec<Point> {
    let n = points.len();
    let mut out = Vec::with_capacity(n * 8);
    if n < 2 {
        return out;
    }
    out.push(points[0]);
    if n == 2 {
        out.push(points[1]);
        return out;
    }
    let mut current = points[0];
    for i in 1..n - 2 {
        let mid = points[i].midpoint(points[i + 1]);
        flatten_quad(current, points[i], mid, &mut out);
        current = mid;
    }
    flatten_quad(current, points[n - 2], points[n - 1], &mut out);
    out
}

fn bounds_of(points: &[Point]) -> (f32, f32, f32, f32) {
    points.iter().fold(
        (f32::MAX, f32::MAX, f32::MIN, f32::MIN),
        |(a, b, c, d), p| (a.min(p.x), b.min(p.y), c.max(p.x), d.max(p.y)),
    )
}

fn pad((a, b, c, d): (f32, f32, f32, f32), by: f32) -> (f32, f32, f32, f32) {
    (a - by, b - by, c + by, d + by)
}

/// Join geometry at vertex `v` between incoming `prev→v` and outgoing `v→next`.
fn stroke_join(mask: &mut Mask, prev: Point, v: Point, next: Point, half: f32, join: LineJoin) {
    let reach = half * MITER_LIMIT + 1.0;
    let bounds = (v.x - reach, v.y - reach, v.x + reach, v.y + reach);
    if join == LineJoin::Round {
        mask.accumulate(pad((v.x, v.y, v.x, v.y), half + 1.0), |px, py| {
            ((px - v.x).powi(2) + (py - v.y).powi(2)).sqrt() - half
        });
        return;
    }
    let d0 = (v.x - prev.x, v.y - prev.y);
    let d1 = (next.x - v.x, next.y - v.y);
    let l0 = (d0.0 * d0.0 + d0.1 * d0.1).sqrt();
    let l1 = (d1.0 * d1.0 + d1.1 * d1.1).sqrt();
    if l0 < 1e-6 || l1 < 1e-6 {
        return;
    }
    let n0 = (-d0.1 / l0, d0.0 / l0);
    let n1 = (-d1.1 / l1, d1.0 / l1);
    let cross = d0.0 * d1.1 - d0.1 * d1.0;
    if cross.abs() < 1e-6 {
        return;
    }
    // Outer side of the turn.
    let s = if cross > 0.0 { -1.0 } else { 1.0 };
    let p0 = Point::new(v.x + s * half * n0.0, v.y + s * half * n0.1);
    let p1 = Point::new(v.x + s * half * n1.0, v.y + s * half * n1.1);

    let mut poly = vec![v, p0, p1];
    if join == LineJoin::Miter {
        let mx = n0.0 + n1.0;
        let my = n0.1 + n1.1;
        let ml = (mx * mx + my * my).sqrt();
        if ml > 1e-6 {
            let (ux, uy) = (mx / ml, my / ml);
            let cos_half = ux * n0.0 + uy * n0.1;
            if cos_half > 1e-6 && 1.0 / cos_half <= MITER_LIMIT {
                let reach = half / cos_half;
                let tip = Point::new(v.x + s * ux * reach, v.y + s * uy * reach);
                poly = vec![v, p0, tip, p1];
            }
        }
    }
    let pb = pad(bounds_of(&poly), 1.0);
    let clipped = (pb.0.max(bounds.0), pb.1.max(bounds.1), pb.2.min(bounds.2), pb.3.min(bounds.3));
    mask.accumulate(clipped, |px, py| sdf_polygon(&poly, px, py));
}

/// Accumulate the stroke of a polyline (open or closed) into `mask`.
fn stroke_polyline(mask: &mut Mask, points: &[Point], closed: bool, style: &StrokeStyle) {
    let half = style.line_width.max(0.0) * 0.5;
    if half <= 0.0 || points.len() < 2 {
        return;
    }
    let n = points.len();
    let seg_count = if closed { n } else { n - 1 };
    let cap_pad = half * std::f32::consts::SQRT_2 + 1.0;

    for i in 0..seg_count {
        let a = points[i];
        let b = points[(i + 1) % n];
        let start = if !closed && i == 0 { style.cap } else { LineCap::Butt };
        let end = if !closed && i == seg_count - 1 { style.cap } else { LineCap::Butt };
        let bounds = pad(bounds_of(&[a, b]), cap_pad);
        mask.accumulate(bounds, |px, py| sdf_segment(px, py, a, b, half, start, end));
    }

    let interior: Box<dyn Iterator<Item = usize>> = if closed {
        Box::new(0..n)
    } else {
        Box::new(1..n - 1)
    };
    for i in interior {
        let prev = points[(i + n - 1) % n];
        let next = points[(i + 1) % n];
        stroke_join(mask, prev, points[i], next, half, style.join);
    }
}

/// Outline extent of a primitive (without stroke padding), or `None` if it is empty.
fn primitive_bounds(primitive: &Primitive) -> Option<(f32, f32, f32, f32)> {
    match primitive {
        Primitive::Line { x1, y1, x2, y2 } => Some(bounds_of(&[Point::new(*x1, *y1), Point::new(*x2, *y2)])),
        Primitive::Rect { x, y, width, height } => {
            Some((x.min(x + width), y.min(y + height), x.max(x + width), y.max(y + height)))
        }
        Primitive::Circle { cx, cy, radius } => {
            let r = radius.abs();
            Some((cx - r, cy - r, cx + r, cy + r))
        }
        Primitive::Ellipse { cx, cy, rx, ry } => {
            let (rx, ry) = (rx.abs(), ry.abs());
            Some((cx - rx, cy - ry, cx + rx, cy + ry))
        }
        Primitive::Path { points, .. } | Primitive::SmoothPath { points } => {
            if points.len() < 2 { None } else { Some(bounds_of(points)) }
        }
    }
}

/// Coverage masks `(fill, stroke)` for a primitive on a `canvas_w × canvas_h` surface.
fn rasterize(primitive: &Primitive, style: &StrokeStyle, canvas_w: u32, canvas_h: u32) -> Option<(Mask, Mask)> {
    let outline = primitive_bounds(primitive)?;
    let reach = style.line_width.max(0.0) * 0.5 * MITER_LIMIT + 2.0;
    let (a, b, c, d) = pad(outline, reach);
    let empty = Mask::new(a, b, c, d, canvas_w, canvas_h)?;
    let mut fill = empty.clone();
    let mut stroke = empty;
    let half = style.line_width.max(0.0) * 0.5;

    match primitive {
        Primitive::Line { x1, y1, x2, y2 } => {
            if style.stroke.is_some() {
                stroke_polyline(&mut stroke, &[Point::new(*x1, *y1), Point::new(*x2, *y2)], false, style);
            }
        }
        Primitive::Rect { x, y, width, height } => {
            let (rx0, ry0, rx1, ry1) = (x.min(x + width), y.min(y + height), x.max(x + width), y.max(y + height));
            let (hx, hy) = ((rx1 - rx0) * 0.5, (ry1 - ry0) * 0.5);
            let (cx, cy) = (rx0 + hx, ry0 + hy);
            if style.fill.is_some() && hx > 0.0 && hy > 0.0 {
                fill.accumulate(pad((rx0, ry0, rx1, ry1), 1.0), |px, py| sdf_box(px - cx, py - cy, hx, hy));
            }
            if style.stroke.is_some() {
                let corners = [
                    Point::new(rx0, ry0),
                    Point::new(rx1, ry0),
                    Point::new(rx1, ry1),
                    Point::new(rx0, ry1),
                ];
                stroke_polyline(&mut stroke, &corners, true, style);
            }
        }
        Primitive::Circle { cx, cy, radius } => {
            let r = radius.abs();
            let (cx, cy) = (*cx, *cy);
            if style.fill.is_some() && r > 0.0 {
                fill.accumulate_all(|px, py| ((px - cx).powi(2) + (py - cy).powi(2)).sqrt() - r);
            }
            if style.stroke.is_some() && half > 0.0 {
                stroke.accumulate_all(|px, py| (((px - cx).powi(2) + (py - cy).powi(2)).sqrt() - r).abs() - half);
            }
        }
        Primitive::Ellipse { cx, cy, rx, ry } => {
            let (rx, ry) = (rx.abs(), ry.abs());
            let (cx, cy) = (*cx, *cy);
            if rx > 0.0 && ry > 0.0 {
                if style.fill.is_some() {
                    fill.accumulate_all(|px, py| sdf_ellipse(px - cx, py - cy, rx, ry));
                }
                if style.stroke.is_some() && half > 0.0 {
                    stroke.accumulate_all(|px, py| sdf_ellipse(px - cx, py - cy, rx, ry).abs() - half);
                }
            }
        }
        Primitive::Path { points, closed } => {
            if *closed && style.fill.is_some() && points.len() >= 3 {
                fill.accumulate_all(|px, py| sdf_polygon(points, px, py));
            }
            if style.stroke.is_some() {
                stroke_polyline(&mut stroke, points, *closed, style);
            }
        }
        Primitive::SmoothPath { points } => {
            if style.stroke.is_some() {
                let line = smooth_polyline(points);
                stroke_polyline(&mut stroke, &line, false, style);
            }
        }
    }
    Some((fill, stroke))
}

/// Put `color` through `mask` onto `surface` with the style's operator.
/// Returns true if any pixel was visited.
fn paint_mask(surface: &mut TiledImage, mask: &Mask, color: Rgba<u8>, style: &StrokeStyle) -> bool {
    let alpha_scale = style.global_alpha.clamp(0.0, 1.0);
    let preserves = style.composite.preserves_backdrop();
    let mut touched = false;
    for ly in 0..mask.h {
        for lx in 0..mask.w {
            let cov = mask.data[(ly * mask.w + lx) as usize];
            if cov <= 0.001 && preserves {
                continue;
            }
            let x = mask.x0 + lx;
            let y = mask.y0 + ly;
            let a = (color[3] as f32 * cov * alpha_scale).round().clamp(0.0, 255.0) as u8;
            let src = if a == 0 { TRANSPARENT } else { Rgba([color[0], color[1], color[2], a]) };
            let base = *surface.get_pixel(x, y);
            surface.put_pixel(x, y, blend_pixel(base, src, style.composite, 1.0));
            touched = true;
        }
    }
    touched
}

/// Rasterize `primitive` onto `surface`: shadow first, then fill, then stroke.
/// Returns true if the surface was touched.
pub fn draw_primitive(surface: &mut TiledImage, primitive: &Primitive, style: &StrokeStyle) -> bool {
    let (w, h) = (surface.width(), surface.height());
    let Some((fill, stroke)) = rasterize(primitive, style, w, h) else {
        return false;
    };

    let mut touched = false;
    if let Some(shadow) = style.shadow.filter(|s| s.color[3] > 0) {
        let shape = fill.union(&stroke);
        let blur = shadow.blur.max(0.0).ceil() as u32;
        let (ox, oy) = (shadow.offset_x.round() as i64, shadow.offset_y.round() as i64);
        let grow = blur as f32 * 2.0 + 1.0;
        if let Some(mut shade) = Mask::new(
            (shape.x0 as i64 + ox) as f32 - grow,
            (shape.y0 as i64 + oy) as f32 - grow,
            ((shape.x0 + shape.w) as i64 + ox) as f32 + grow,
            ((shape.y0 + shape.h) as i64 + oy) as f32 + grow,
            w,
            h,
        ) {
            for ly in 0..shade.h {
                for lx in 0..shade.w {
                    let x = (shade.x0 + lx) as i64 - ox;
                    let y = (shade.y0 + ly) as i64 - oy;
                    shade.data[(ly * shade.w + lx) as usize] = shape.at(x, y);
                }
            }
            shade.blur(blur / 2);
            touched |= paint_mask(surface, &shade, shadow.color, style);
        }
    }
    if let Some(color) = style.fill {
        touched |= paint_mask(surface, &fill, color, style);
    }
    if let Some(color) = style.stroke {
        touched |= paint_mask(surface, &stroke, color, style);
    }
    touched
}
