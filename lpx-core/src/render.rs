//! Inverse mapping: LP image → raster, for debug display.
//!
//! Each output pixel is classified with the closed-form spiral kernel
//! and painted with its cell's packed value. Rendering a scan of the
//! same frame at scale 1 reproduces a low-frequency filtered version
//! of the source, up to the scan's integer-division rounding.

use std::sync::Arc;

use crate::error::LpxError;
use crate::lp_image::LpImage;
use crate::spiral::{cell_array_offset, cell_index_of, period_matches};
use crate::tables::ScanTables;

/// Cell value that marks "do not paint"; the pixel stays background
/// black.
pub const SKIP_CELL: u32 = 0x0020_0400;

// ── Raster ───────────────────────────────────────────────────────

/// A rendered frame of `0x00RRGGBB` pixels (bit-identical to the
/// packed cell layout).
pub struct Raster {
    width: u32,
    height: u32,
    pixels: Vec<u32>,
}

impl Raster {
    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Row-major packed pixels.
    pub fn pixels(&self) -> &[u32] {
        &self.pixels
    }

    /// Pixel at `(x, y)`, or 0 outside the raster.
    pub fn pixel(&self, x: u32, y: u32) -> u32 {
        if x < self.width && y < self.height {
            self.pixels[(y * self.width + x) as usize]
        } else {
            0
        }
    }

    /// Expand into tightly packed RGB bytes (for PNG encoding).
    pub fn to_rgb_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.pixels.len() * 3);
        for &px in &self.pixels {
            out.push((px >> 16 & 0xFF) as u8);
            out.push((px >> 8 & 0xFF) as u8);
            out.push((px & 0xFF) as u8);
        }
        out
    }
}

// ── Renderer ─────────────────────────────────────────────────────

/// Renders LP images whose spiral period matches a registered set of
/// scan tables.
pub struct Renderer {
    tables: Vec<Arc<ScanTables>>,
    workers: usize,
}

impl Renderer {
    pub fn new() -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get().saturating_sub(1).max(1))
            .unwrap_or(1);
        Self {
            tables: Vec::new(),
            workers,
        }
    }

    /// Register scan tables; images are matched to them by spiral
    /// period.
    pub fn set_scan_tables(&mut self, tables: Arc<ScanTables>) -> Result<(), LpxError> {
        if !(0.1..=1000.0).contains(&tables.spiral_per()) {
            return Err(LpxError::InvalidTables(format!(
                "spiral period {} outside [0.1, 1000]",
                tables.spiral_per()
            )));
        }
        self.tables
            .retain(|t| !period_matches(t.spiral_per(), tables.spiral_per()));
        self.tables.push(tables);
        Ok(())
    }

    pub fn has_scan_tables(&self, spiral_per: f32) -> bool {
        self.tables
            .iter()
            .any(|t| period_matches(t.spiral_per(), spiral_per))
    }

    /// Render `image` into a `width × height` raster.
    ///
    /// `scale` of 1 reproduces the scanned geometry; larger values
    /// zoom in by shifting the cell-array offset a whole number of
    /// spiral periods.
    pub fn render(
        &self,
        image: &LpImage,
        width: u32,
        height: u32,
        scale: f32,
    ) -> Result<Raster, LpxError> {
        if image.length() == 0 {
            return Err(LpxError::InvalidFrame("image has no cells".into()));
        }
        let spiral_per = image.spiral_per();
        if !self.has_scan_tables(spiral_per) {
            return Err(LpxError::InvalidTables(format!(
                "no scan tables registered for period {spiral_per}"
            )));
        }

        let w_scale = width as f32 / image.width().max(1) as f32;
        let h_scale = height as f32 / image.height().max(1) as f32;
        let scale_factor = w_scale.max(h_scale) * scale;
        let cell_offset = cell_array_offset(scale_factor, spiral_per);

        let ctx = RenderContext {
            cells: image.cells(),
            max_len: image.length() as i32,
            spiral_per,
            cell_offset,
            center_x: (width / 2) as i32,
            center_y: (height / 2) as i32,
            width: width as usize,
        };

        let mut pixels = vec![0u32; width as usize * height as usize];
        let rows_per_band = (height as usize).div_ceil(self.workers).max(1);

        std::thread::scope(|scope| {
            for (band, chunk) in pixels.chunks_mut(rows_per_band * width as usize).enumerate() {
                let ctx = &ctx;
                scope.spawn(move || ctx.render_rows(band * rows_per_band, chunk));
            }
        });

        Ok(Raster {
            width,
            height,
            pixels,
        })
    }
}

impl Default for Renderer {
    fn default() -> Self {
        Self::new()
    }
}

struct RenderContext<'a> {
    cells: &'a [u32],
    max_len: i32,
    spiral_per: f32,
    cell_offset: i32,
    center_x: i32,
    center_y: i32,
    width: usize,
}

impl RenderContext<'_> {
    fn render_rows(&self, first_row: usize, chunk: &mut [u32]) {
        for (i, px) in chunk.iter_mut().enumerate() {
            let x = (i % self.width) as i32;
            let y = (first_row + i / self.width) as i32;

            let rel_x = (x - self.center_x) as f32;
            let rel_y = (y - self.center_y) as f32;

            let mut cell = cell_index_of(rel_x, rel_y, self.spiral_per);
            if cell < 0 || cell >= self.max_len {
                cell = 0;
            }

            let mut i_cell = self.cell_offset + cell;
            if i_cell < 0 || i_cell >= self.max_len {
                i_cell = cell;
            }

            let value = self.cells[i_cell as usize];
            if value == SKIP_CELL {
                continue;
            }
            *px = value;
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lp_image::{pack_bgr, unpack_bgr};
    use crate::scan::Scanner;
    use crate::source::Frame;
    use crate::testutil::spiral_tables;

    fn uniform_frame(width: u32, height: u32, bgr: [u8; 3]) -> Frame {
        let mut data = Vec::with_capacity(width as usize * height as usize * 3);
        for _ in 0..width * height {
            data.extend_from_slice(&bgr);
        }
        Frame::new(width, height, 3, data).unwrap()
    }

    #[test]
    fn requires_matching_tables() {
        let tables = Arc::new(spiral_tables(256, 7.5, 5, 100));
        let scanner = Scanner::new(Arc::clone(&tables)).unwrap();
        let image = scanner
            .scan(&uniform_frame(64, 48, [1, 2, 3]), 32.0, 24.0)
            .unwrap();

        let renderer = Renderer::new();
        assert!(matches!(
            renderer.render(&image, 64, 48, 1.0),
            Err(LpxError::InvalidTables(_))
        ));
    }

    #[test]
    fn scan_then_render_reproduces_uniform_frame() {
        let tables = Arc::new(spiral_tables(256, 7.5, 5, 100));
        let scanner = Scanner::new(Arc::clone(&tables)).unwrap();
        let color = [40u8, 128, 255];
        let frame = uniform_frame(128, 96, color);
        let image = scanner.scan(&frame, 64.0, 48.0).unwrap();

        let mut renderer = Renderer::new();
        renderer.set_scan_tables(tables).unwrap();
        let raster = renderer.render(&image, 128, 96, 1.0).unwrap();

        let expected = pack_bgr(color[2], color[1], color[0]);
        assert_eq!(raster.pixel(64, 48), expected, "centre pixel differs");

        // Mean of the inner 40×40 region within ±2 per channel.
        let (mut sr, mut sg, mut sb, mut n) = (0u64, 0u64, 0u64, 0u64);
        for y in 28..68 {
            for x in 44..84 {
                let (r, g, b) = unpack_bgr(raster.pixel(x, y));
                sr += r as u64;
                sg += g as u64;
                sb += b as u64;
                n += 1;
            }
        }
        let (mr, mg, mb) = (sr / n, sg / n, sb / n);
        assert!((mr as i64 - color[2] as i64).abs() <= 2, "mean r {mr}");
        assert!((mg as i64 - color[1] as i64).abs() <= 2, "mean g {mg}");
        assert!((mb as i64 - color[0] as i64).abs() <= 2, "mean b {mb}");
    }

    #[test]
    fn skip_marker_leaves_background_black() {
        let tables = Arc::new(spiral_tables(256, 7.5, 5, 100));
        let scanner = Scanner::new(Arc::clone(&tables)).unwrap();
        let mut image = scanner
            .scan(&uniform_frame(64, 48, [9, 9, 9]), 32.0, 24.0)
            .unwrap();
        for cell in image.cells_mut().iter_mut() {
            *cell = SKIP_CELL;
        }

        let mut renderer = Renderer::new();
        renderer.set_scan_tables(tables).unwrap();
        let raster = renderer.render(&image, 64, 48, 1.0).unwrap();
        assert!(raster.pixels().iter().all(|&p| p == 0));
    }

    #[test]
    fn forward_tables_agree_with_closed_form() {
        // Every scan-map pixel classified by the tables must land
        // within one cell of the closed form (hexagonal tie-break
        // tolerance).
        let tables = Arc::new(spiral_tables(128, 7.5, 4, 60));
        let cache = crate::scan::ScanCache::build(&tables);
        let half = tables.map_width() / 2;

        for y in (0..128).step_by(3) {
            for x in (0..128).step_by(3) {
                let via_tables = cache
                    .cell_index((y * 128 + x) as i64)
                    .expect("pixel inside map");
                let direct = cell_index_of((x - half) as f32, (y - half) as f32, 7.5)
                    .clamp(0, tables.last_cell_index());
                assert!(
                    (via_tables - direct).abs() <= 1,
                    "tables {via_tables} vs closed form {direct} at ({x}, {y})"
                );
            }
        }
    }
}
