use std::sync::Arc;

use image::{Rgba, RgbaImage};
use rayon::prelude::*;

use crate::error::{EngineError, Result};

// ============================================================================
// TILED IMAGE – sparse 64×64 chunk storage (Vec-indexed for speed)
// ============================================================================

pub const CHUNK_SIZE: u32 = 64;

/// Upper bound on surface area (pixels) unless the engine config overrides it.
pub const DEFAULT_MAX_PIXELS: u64 = 256_000_000;

pub(crate) const TRANSPARENT: Rgba<u8> = Rgba([0, 0, 0, 0]);

/// A pixel with zero alpha, returned by reference for missing chunks.
static TRANSPARENT_PIXEL: Rgba<u8> = TRANSPARENT;

/// Pixels of chunk storage a fully populated `width × height` image holds.
/// Edge chunks count at full size, so this is the area rounded up to whole chunks.
pub fn storage_pixels(width: u32, height: u32) -> u64 {
    let cols = width.div_ceil(CHUNK_SIZE) as u64;
    let rows = height.div_ceil(CHUNK_SIZE) as u64;
    cols * rows * (CHUNK_SIZE as u64 * CHUNK_SIZE as u64)
}

/// Sparse tiled RGBA8 surface (straight alpha) backed by a flat
/// `Vec<Option<Arc<RgbaImage>>>`. Chunk coordinates map to a flat index via
/// `cy * chunks_per_row + cx`.
///
/// Chunks are wrapped in `Arc` for copy-on-write semantics: `clone()` only
/// bumps reference counts, and mutations go through `Arc::make_mut` so only
/// the touched chunk is copied. A missing chunk is fully transparent.
///
/// Edge chunks are always allocated at full `CHUNK_SIZE`; pixels past the
/// image bounds are padding and are never read back.
#[derive(Clone)]
pub struct TiledImage {
    width: u32,
    height: u32,
    chunks_per_row: u32,
    chunks: Vec<Option<Arc<RgbaImage>>>,
}

impl std::fmt::Debug for TiledImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TiledImage")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("chunks", &self.chunk_count())
            .finish()
    }
}

impl TiledImage {
    // ---- construction -------------------------------------------------------

    /// Create an empty (fully transparent) tiled image, refusing sizes whose
    /// chunk storage exceeds `max_pixels` or whose chunk table cannot be reserved.
    ///
    /// Zero-width or zero-height images are valid and hold no chunks.
    pub fn try_new(width: u32, height: u32, max_pixels: u64) -> Result<Self> {
        if storage_pixels(width, height) > max_pixels {
            return Err(EngineError::Allocation { width, height });
        }
        let chunks_per_row = width.div_ceil(CHUNK_SIZE);
        let rows = height.div_ceil(CHUNK_SIZE);
        let count = chunks_per_row as usize * rows as usize;

        let mut chunks = Vec::new();
        chunks
            .try_reserve_exact(count)
            .map_err(|_| EngineError::Allocation { width, height })?;
        chunks.resize(count, None);

        Ok(Self { width, height, chunks_per_row, chunks })
    }

    /// Like [`try_new`](Self::try_new) but pre-filled with `color`.
    /// A transparent fill costs nothing.
    pub fn try_new_filled(width: u32, height: u32, color: Rgba<u8>, max_pixels: u64) -> Result<Self> {
        let mut img = Self::try_new(width, height, max_pixels)?;
        if color[3] > 0 {
            img.fill(color);
        }
        Ok(img)
    }

    /// Blank image for dimensions that were already validated by a layer.
    pub(crate) fn blank(width: u32, height: u32) -> Self {
        let chunks_per_row = width.div_ceil(CHUNK_SIZE);
        let rows = height.div_ceil(CHUNK_SIZE);
        Self {
            width,
            height,
            chunks_per_row,
            chunks: vec![None; chunks_per_row as usize * rows as usize],
        }
    }

    /// Import from a flat `RgbaImage`.  Only non-transparent chunks are stored.
    pub fn from_rgba_image(src: &RgbaImage) -> Self {
        Self::from_rgba_image_sized(src, src.width(), src.height())
    }

    /// Import `src` anchored at the origin into a `width × height` image.
    /// Source pixels outside the target are cropped, missing ones are transparent.
    /// Chunk conversion is parallelised with rayon.
    pub fn from_rgba_image_sized(src: &RgbaImage, width: u32, height: u32) -> Self {
        let mut img = Self::blank(width, height);
        let copy_w = width.min(src.width());
        let copy_h = height.min(src.height());
        if copy_w == 0 || copy_h == 0 {
            return img;
        }

        let chunks_x = copy_w.div_ceil(CHUNK_SIZE);
        let chunks_y = copy_h.div_ceil(CHUNK_SIZE);
        let src_w = src.width();
        let src_raw = src.as_raw();

        let coords: Vec<(u32, u32)> = (0..chunks_y)
            .flat_map(|cy| (0..chunks_x).map(move |cx| (cx, cy)))
            .collect();

        let chunk_results: Vec<(u32, u32, Option<Arc<RgbaImage>>)> = coords
            .into_par_iter()
            .map(|(cx, cy)| {
                let base_x = cx * CHUNK_SIZE;
                let base_y = cy * CHUNK_SIZE;
                let cw = CHUNK_SIZE.min(copy_w - base_x);
                let ch = CHUNK_SIZE.min(copy_h - base_y);
                let chunk_stride = CHUNK_SIZE as usize * 4;
                let mut chunk_data = vec![0u8; chunk_stride * CHUNK_SIZE as usize];
                let mut has_content = false;

                for ly in 0..ch {
                    let src_start = ((base_y + ly) as usize * src_w as usize + base_x as usize) * 4;
                    let dst_start = ly as usize * chunk_stride;
                    let byte_len = cw as usize * 4;
                    let row = &src_raw[src_start..src_start + byte_len];
                    chunk_data[dst_start..dst_start + byte_len].copy_from_slice(row);

                    if !has_content {
                        has_content = row.chunks_exact(4).any(|px| px[3] != 0);
                    }
                }

                let chunk = if has_content {
                    RgbaImage::from_raw(CHUNK_SIZE, CHUNK_SIZE, chunk_data).map(Arc::new)
                } else {
                    None
                };
                (cx, cy, chunk)
            })
            .collect();

        for (cx, cy, chunk) in chunk_results {
            let idx = img.flat_index(cx, cy);
            img.chunks[idx] = chunk;
        }
        img
    }

    /// Flatten back to a contiguous `RgbaImage`.
    pub fn to_rgba_image(&self) -> RgbaImage {
        let mut out = RgbaImage::new(self.width, self.height);
        self.copy_chunks_into(&mut out);
        out
    }

    /// Flatten into a caller-owned buffer, reallocating only on a size mismatch.
    pub fn write_into(&self, out: &mut RgbaImage) {
        if out.dimensions() != (self.width, self.height) {
            *out = RgbaImage::new(self.width, self.height);
        } else {
            for b in out.iter_mut() {
                *b = 0;
            }
        }
        self.copy_chunks_into(out);
    }

    fn copy_chunks_into(&self, out: &mut RgbaImage) {
        let out_stride = self.width as usize * 4;
        let out_raw: &mut [u8] = out;
        for (cx, cy) in self.chunk_keys() {
            if let Some(chunk) = self.get_chunk(cx, cy) {
                let base_x = cx * CHUNK_SIZE;
                let base_y = cy * CHUNK_SIZE;
                let (cw, ch) = self.chunk_extent(cx, cy);
                let cw = cw as usize;
                let chunk_raw = chunk.as_raw();
                let chunk_stride = CHUNK_SIZE as usize * 4;
                for ly in 0..ch as usize {
                    let src_start = ly * chunk_stride;
                    let dst_start = (base_y as usize + ly) * out_stride + base_x as usize * 4;
                    out_raw[dst_start..dst_start + cw * 4]
                        .copy_from_slice(&chunk_raw[src_start..src_start + cw * 4]);
                }
            }
        }
    }

    /// Copy of this image at a new size, anchored at the origin.
    ///
    /// The overlapping region is preserved exactly. Content past the new
    /// bounds is dropped; newly exposed area is `fill` (or transparent).
    /// Chunks that lie wholly inside the retained region are shared, not copied.
    pub fn resized(&self, new_w: u32, new_h: u32, fill: Option<Rgba<u8>>, max_pixels: u64) -> Result<Self> {
        let mut out = Self::try_new(new_w, new_h, max_pixels)?;
        let keep_w = self.width.min(new_w);
        let keep_h = self.height.min(new_h);
        let fill = fill.filter(|c| c[3] > 0);
        let (new_cpr, new_rows) = out.chunk_grid();
        let (old_cpr, old_rows) = self.chunk_grid();

        for cy in 0..new_rows {
            for cx in 0..new_cpr {
                let base_x = cx * CHUNK_SIZE;
                let base_y = cy * CHUNK_SIZE;
                let (cw, ch) = out.chunk_extent(cx, cy);
                let old = if cx < old_cpr && cy < old_rows {
                    self.chunks[self.flat_index(cx, cy)].clone()
                } else {
                    None
                };
                let idx = out.flat_index(cx, cy);

                let inside_kept = base_x + cw <= keep_w && base_y + ch <= keep_h;
                if inside_kept {
                    out.chunks[idx] = old;
                    continue;
                }
                if old.is_none() && fill.is_none() {
                    continue;
                }

                let mut chunk = RgbaImage::new(CHUNK_SIZE, CHUNK_SIZE);
                let mut has_content = false;
                for ly in 0..ch {
                    for lx in 0..cw {
                        let x = base_x + lx;
                        let y = base_y + ly;
                        let px = if x < keep_w && y < keep_h {
                            old.as_ref().map(|c| *c.get_pixel(lx, ly)).unwrap_or(TRANSPARENT)
                        } else {
                            fill.unwrap_or(TRANSPARENT)
                        };
                        if px[3] != 0 {
                            has_content = true;
                        }
                        chunk.put_pixel(lx, ly, px);
                    }
                }
                if has_content {
                    out.chunks[idx] = Some(Arc::new(chunk));
                }
            }
        }
        Ok(out)
    }

    // ---- indexing helpers ----------------------------------------------------

    #[inline(always)]
    fn flat_index(&self, cx: u32, cy: u32) -> usize {
        (cy * self.chunks_per_row + cx) as usize
    }

    #[inline(always)]
    fn chunk_coord(x: u32, y: u32) -> (u32, u32) { (x / CHUNK_SIZE, y / CHUNK_SIZE) }

    #[inline(always)]
    fn local(x: u32, y: u32) -> (u32, u32) { (x % CHUNK_SIZE, y % CHUNK_SIZE) }

    /// Chunk grid size as `(columns, rows)`.
    pub fn chunk_grid(&self) -> (u32, u32) {
        (self.chunks_per_row, self.height.div_ceil(CHUNK_SIZE))
    }

    /// Width and height of the in-bounds part of chunk `(cx, cy)`.
    #[inline]
    pub fn chunk_extent(&self, cx: u32, cy: u32) -> (u32, u32) {
        (
            CHUNK_SIZE.min(self.width.saturating_sub(cx * CHUNK_SIZE)),
            CHUNK_SIZE.min(self.height.saturating_sub(cy * CHUNK_SIZE)),
        )
    }

    // ---- pixel access -------------------------------------------------------

    /// Read a pixel (returns `&TRANSPARENT_PIXEL` for missing chunks or out of bounds).
    #[inline]
    pub fn get_pixel(&self, x: u32, y: u32) -> &Rgba<u8> {
        if x >= self.width || y >= self.height { return &TRANSPARENT_PIXEL; }
        let (cx, cy) = Self::chunk_coord(x, y);
        let (lx, ly) = Self::local(x, y);
        let idx = self.flat_index(cx, cy);
        self.chunks[idx].as_ref()
            .map(|c| c.get_pixel(lx, ly))
            .unwrap_or(&TRANSPARENT_PIXEL)
    }

    /// Write a pixel (creates the chunk on demand, COW-clones if shared).
    /// Out-of-bounds writes are ignored.
    #[inline]
    pub fn put_pixel(&mut self, x: u32, y: u32, pixel: Rgba<u8>) {
        if x >= self.width || y >= self.height { return; }
        let (cx, cy) = Self::chunk_coord(x, y);
        let (lx, ly) = Self::local(x, y);
        let idx = self.flat_index(cx, cy);
        if pixel[3] == 0 && self.chunks[idx].is_none() {
            return;
        }
        let arc = self.chunks[idx]
            .get_or_insert_with(|| Arc::new(RgbaImage::new(CHUNK_SIZE, CHUNK_SIZE)));
        Arc::make_mut(arc).put_pixel(lx, ly, pixel);
    }

    /// Read-only access to a chunk (if it exists).
    pub fn get_chunk(&self, cx: u32, cy: u32) -> Option<&RgbaImage> {
        if cx >= self.chunks_per_row { return None; }
        let idx = self.flat_index(cx, cy);
        self.chunks.get(idx).and_then(|c| c.as_deref())
    }

    /// Replace (or drop, with `None`) the chunk at the given chunk coordinate.
    pub fn replace_chunk(&mut self, cx: u32, cy: u32, chunk: Option<RgbaImage>) {
        if cx >= self.chunks_per_row { return; }
        let idx = self.flat_index(cx, cy);
        if idx < self.chunks.len() {
            self.chunks[idx] = chunk.map(Arc::new);
        }
    }

    /// Iterator over populated chunk coordinates.
    pub fn chunk_keys(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        let cpr = self.chunks_per_row;
        self.chunks.iter().enumerate().filter_map(move |(i, slot)| {
            slot.as_ref().map(|_| ((i as u32) % cpr, (i as u32) / cpr))
        })
    }

    /// Iterator over every chunk coordinate of the grid, populated or not.
    pub fn all_chunk_keys(&self) -> impl Iterator<Item = (u32, u32)> {
        let (cpr, rows) = self.chunk_grid();
        (0..rows).flat_map(move |cy| (0..cpr).map(move |cx| (cx, cy)))
    }

    /// Number of populated chunks.
    pub fn chunk_count(&self) -> usize {
        self.chunks.iter().filter(|c| c.is_some()).count()
    }

    /// True when no pixel has non-zero alpha.
    pub fn is_empty(&self) -> bool {
        self.chunk_keys().all(|(cx, cy)| {
            let (cw, ch) = self.chunk_extent(cx, cy);
            self.get_chunk(cx, cy).is_none_or(|chunk| {
                (0..ch).all(|ly| (0..cw).all(|lx| chunk.get_pixel(lx, ly)[3] == 0))
            })
        })
    }

    // ---- bulk operations ----------------------------------------------------

    /// Fill every in-bounds pixel with `color`.
    pub fn fill(&mut self, color: Rgba<u8>) {
        if color[3] == 0 {
            self.clear();
            return;
        }
        let mut template = RgbaImage::new(CHUNK_SIZE, CHUNK_SIZE);
        for pixel in template.pixels_mut() {
            *pixel = color;
        }
        let template = Arc::new(template);
        for slot in &mut self.chunks {
            *slot = Some(Arc::clone(&template));
        }
    }

    /// Drop all chunks (make the image fully transparent).
    pub fn clear(&mut self) {
        for slot in &mut self.chunks {
            *slot = None;
        }
    }

    /// Width accessor (matches `RgbaImage::width()`).
    pub fn width(&self) -> u32 { self.width }

    /// Height accessor (matches `RgbaImage::height()`).
    pub fn height(&self) -> u32 { self.height }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RED: Rgba<u8> = Rgba([255, 0, 0, 255]);
    const WHITE: Rgba<u8> = Rgba([255, 255, 255, 255]);

    #[test]
    fn new_image_is_transparent_and_sparse() {
        let img = TiledImage::try_new(130, 70, DEFAULT_MAX_PIXELS).unwrap();
        assert_eq!(img.chunk_grid(), (3, 2));
        assert_eq!(img.chunk_count(), 0);
        assert!(img.is_empty());
        assert_eq!(*img.get_pixel(129, 69), TRANSPARENT);
    }

    #[test]
    fn oversized_allocation_is_rejected() {
        let err = TiledImage::try_new(100, 100, 9_999).unwrap_err();
        assert!(matches!(err, EngineError::Allocation { width: 100, height: 100 }));
    }

    #[test]
    fn limit_counts_whole_chunks() {
        assert_eq!(storage_pixels(0, 500), 0);
        assert_eq!(storage_pixels(1, 1), 4096);
        assert_eq!(storage_pixels(65, 64), 8192);

        let err = TiledImage::try_new(64_000, 1, 100_000).unwrap_err();
        assert!(matches!(err, EngineError::Allocation { width: 64_000, height: 1 }));
        assert!(TiledImage::try_new(64, 64, 4096).is_ok());
        assert!(TiledImage::try_new(65, 64, 4096).is_err());
    }

    #[test]
    fn resize_respects_chunk_storage_limit() {
        let img = TiledImage::try_new(10, 10, 4096).unwrap();
        assert!(img.resized(64_000, 1, None, 100_000).is_err());
        assert!(img.resized(64, 64, None, 4096).is_ok());
    }

    #[test]
    fn zero_sized_image_is_valid() {
        let img = TiledImage::try_new(0, 40, DEFAULT_MAX_PIXELS).unwrap();
        assert_eq!(img.chunk_count(), 0);
        assert_eq!(img.to_rgba_image().dimensions(), (0, 40));
    }

    #[test]
    fn put_and_get_round_through_chunks() {
        let mut img = TiledImage::try_new(200, 200, DEFAULT_MAX_PIXELS).unwrap();
        img.put_pixel(70, 130, RED);
        assert_eq!(*img.get_pixel(70, 130), RED);
        assert_eq!(img.chunk_count(), 1);
        // Out of bounds writes are dropped.
        img.put_pixel(500, 0, RED);
        assert_eq!(img.chunk_count(), 1);
    }

    #[test]
    fn flat_conversion_preserves_pixels() {
        let mut flat = RgbaImage::new(90, 65);
        flat.put_pixel(0, 0, RED);
        flat.put_pixel(89, 64, WHITE);
        let tiled = TiledImage::from_rgba_image(&flat);
        assert_eq!(tiled.chunk_count(), 2);
        assert_eq!(tiled.to_rgba_image(), flat);
    }

    #[test]
    fn sized_import_crops_and_pads() {
        let mut flat = RgbaImage::new(10, 10);
        flat.put_pixel(9, 9, RED);
        flat.put_pixel(2, 2, RED);
        let tiled = TiledImage::from_rgba_image_sized(&flat, 5, 20);
        assert_eq!(*tiled.get_pixel(2, 2), RED);
        assert_eq!(*tiled.get_pixel(4, 15), TRANSPARENT);
        assert_eq!((tiled.width(), tiled.height()), (5, 20));
    }

    #[test]
    fn resize_keeps_overlap_and_fills_new_area() {
        let mut img = TiledImage::try_new(100, 100, DEFAULT_MAX_PIXELS).unwrap();
        img.put_pixel(10, 10, RED);
        img.put_pixel(90, 90, RED);

        let grown = img.resized(150, 120, Some(WHITE), DEFAULT_MAX_PIXELS).unwrap();
        assert_eq!(*grown.get_pixel(10, 10), RED);
        assert_eq!(*grown.get_pixel(90, 90), RED);
        assert_eq!(*grown.get_pixel(50, 50), TRANSPARENT);
        assert_eq!(*grown.get_pixel(120, 10), WHITE);
        assert_eq!(*grown.get_pixel(10, 110), WHITE);

        let shrunk = grown.resized(50, 50, None, DEFAULT_MAX_PIXELS).unwrap();
        assert_eq!(*shrunk.get_pixel(10, 10), RED);
        // Regrowing must not resurrect cropped pixels from chunk padding.
        let regrown = shrunk.resized(100, 100, None, DEFAULT_MAX_PIXELS).unwrap();
        assert_eq!(*regrown.get_pixel(90, 90), TRANSPARENT);
        assert_eq!(*regrown.get_pixel(10, 10), RED);
    }

    #[test]
    fn resize_to_and_from_zero() {
        let img = TiledImage::try_new_filled(64, 64, RED, DEFAULT_MAX_PIXELS).unwrap();
        let zero = img.resized(0, 0, None, DEFAULT_MAX_PIXELS).unwrap();
        assert_eq!(zero.chunk_count(), 0);
        let back = zero.resized(8, 8, Some(WHITE), DEFAULT_MAX_PIXELS).unwrap();
        assert_eq!(*back.get_pixel(3, 3), WHITE);
    }

    #[test]
    fn write_into_reuses_matching_buffer() {
        let img = TiledImage::try_new_filled(4, 4, RED, DEFAULT_MAX_PIXELS).unwrap();
        let mut buf = RgbaImage::new(4, 4);
        buf.put_pixel(0, 0, WHITE);
        img.write_into(&mut buf);
        assert_eq!(*buf.get_pixel(0, 0), RED);

        let blank = TiledImage::try_new(4, 4, DEFAULT_MAX_PIXELS).unwrap();
        blank.write_into(&mut buf);
        assert_eq!(*buf.get_pixel(0, 0), TRANSPARENT);
    }
}
