//! The log-polar image: one frame's cell buffer plus scan geometry.
//!
//! Cells are packed BGR (`B | G<<8 | R<<16`, low byte blue) so a cell
//! value is bit-identical to a `0x00RRGGBB` raster pixel. The image
//! also owns the per-cell accumulators the scanner fills during the
//! peripheral pass; they are atomic so the scan worker threads need
//! no mutex.
//!
//! ## File format
//!
//! Header, 8 × `i32` little-endian:
//! ```text
//! total_length  8 + length
//! length        cells stored in the body
//! n_max_cells   cell capacity (last_cell_index + 1)
//! spiral_per    integer part; the fractional 0.5 is implicit
//! width         source frame width in pixels
//! height        source frame height in pixels
//! x_ofs         fixation x offset × 1e5
//! y_ofs         fixation y offset × 1e5
//! ```
//! Body: `length × u32` packed cells.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::error::LpxError;
use crate::tables::ScanTables;

/// Pack a BGR triple into a single cell value.
#[inline]
pub fn pack_bgr(r: u8, g: u8, b: u8) -> u32 {
    b as u32 | (g as u32) << 8 | (r as u32) << 16
}

/// Unpack a cell value into `(r, g, b)`.
#[inline]
pub fn unpack_bgr(cell: u32) -> (u8, u8, u8) {
    (
        (cell >> 16 & 0xFF) as u8,
        (cell >> 8 & 0xFF) as u8,
        (cell & 0xFF) as u8,
    )
}

/// A log-polar image: `n_max_cells` packed BGR cells plus the
/// geometry of the scan that produced it.
pub struct LpImage {
    length: usize,
    n_max_cells: usize,
    spiral_per: f32,
    width: u32,
    height: u32,
    x_ofs: f32,
    y_ofs: f32,
    cells: Vec<u32>,
    // Scratch for the scanner's peripheral pass; reset between scans.
    acc_r: Vec<AtomicU32>,
    acc_g: Vec<AtomicU32>,
    acc_b: Vec<AtomicU32>,
    count: Vec<AtomicU32>,
}

fn zeroed_atomics(len: usize) -> Vec<AtomicU32> {
    (0..len).map(|_| AtomicU32::new(0)).collect()
}

impl LpImage {
    /// Allocate an image sized to the given scan tables.
    ///
    /// Cells and accumulators are zeroed. Fails with `InvalidTables`
    /// when the tables describe no cells or a degenerate period.
    pub fn new(tables: &Arc<ScanTables>, width: u32, height: u32) -> Result<Self, LpxError> {
        if tables.last_cell_index() <= 0 {
            return Err(LpxError::InvalidTables(format!(
                "non-positive last cell index {}",
                tables.last_cell_index()
            )));
        }
        if tables.spiral_per() < 0.1 {
            return Err(LpxError::InvalidTables(format!(
                "degenerate spiral period {}",
                tables.spiral_per()
            )));
        }
        let n_max_cells = tables.last_cell_index() as usize + 1;
        Ok(Self {
            length: 0,
            n_max_cells,
            spiral_per: tables.spiral_per(),
            width,
            height,
            x_ofs: 0.0,
            y_ofs: 0.0,
            cells: vec![0; n_max_cells],
            acc_r: zeroed_atomics(n_max_cells),
            acc_g: zeroed_atomics(n_max_cells),
            acc_b: zeroed_atomics(n_max_cells),
            count: zeroed_atomics(n_max_cells),
        })
    }

    /// Assemble an image from decoded wire or file parts.
    pub(crate) fn from_parts(
        length: usize,
        n_max_cells: usize,
        spiral_per: f32,
        width: u32,
        height: u32,
        x_ofs: f32,
        y_ofs: f32,
        mut cells: Vec<u32>,
    ) -> Self {
        let n_max_cells = n_max_cells.max(length);
        cells.resize(n_max_cells, 0);
        Self {
            length,
            n_max_cells,
            spiral_per,
            width,
            height,
            x_ofs,
            y_ofs,
            cells,
            acc_r: zeroed_atomics(n_max_cells),
            acc_g: zeroed_atomics(n_max_cells),
            acc_b: zeroed_atomics(n_max_cells),
            count: zeroed_atomics(n_max_cells),
        }
    }

    /// Number of valid cells.
    pub fn length(&self) -> usize {
        self.length
    }

    /// Cell capacity, `last_cell_index + 1`.
    pub fn max_cells(&self) -> usize {
        self.n_max_cells
    }

    /// Spiral period inherited from the scan tables.
    pub fn spiral_per(&self) -> f32 {
        self.spiral_per
    }

    /// Source frame width in pixels.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Source frame height in pixels.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Fixation offset from frame centre, in pixels.
    pub fn offset(&self) -> (f32, f32) {
        (self.x_ofs, self.y_ofs)
    }

    pub fn set_offset(&mut self, x: f32, y: f32) {
        self.x_ofs = x;
        self.y_ofs = y;
    }

    pub(crate) fn set_length(&mut self, length: usize) {
        self.length = length.min(self.n_max_cells);
    }

    /// The packed cell buffer.
    pub fn cells(&self) -> &[u32] {
        &self.cells
    }

    /// Value of one cell, or 0 for an out-of-range index.
    pub fn cell_value(&self, index: i32) -> u32 {
        if index >= 0 && (index as usize) < self.cells.len() {
            self.cells[index as usize]
        } else {
            0
        }
    }

    // ── Scanner access ───────────────────────────────────────────
    //
    // The scanner owns the image mutably for the fovea pass and the
    // finalise step, and shares the accumulators immutably (they are
    // atomic) across its worker threads.

    pub(crate) fn cells_mut(&mut self) -> &mut [u32] {
        &mut self.cells
    }

    pub(crate) fn accumulators(&self) -> (&[AtomicU32], &[AtomicU32], &[AtomicU32], &[AtomicU32]) {
        (&self.acc_r, &self.acc_g, &self.acc_b, &self.count)
    }

    /// Zero every accumulator. O(cells), run once per scan.
    pub(crate) fn reset_accumulators(&self) {
        for i in 0..self.n_max_cells {
            self.acc_r[i].store(0, Ordering::Relaxed);
            self.acc_g[i].store(0, Ordering::Relaxed);
            self.acc_b[i].store(0, Ordering::Relaxed);
            self.count[i].store(0, Ordering::Relaxed);
        }
    }

    pub(crate) fn set_dimensions(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
    }

    /// Turn the accumulated sums into averaged cell values.
    ///
    /// Cells with no contributing pixels stay black, except fovea
    /// cells, which keep the value the direct fovea pass wrote.
    /// Integer division truncates, which keeps the result
    /// deterministic regardless of worker-thread ordering.
    pub(crate) fn finalize_from_accumulators(&mut self, last_fovea_index: i32) {
        for i in 0..self.n_max_cells {
            let n = self.count[i].load(Ordering::Relaxed);
            if n > 0 {
                let r = self.acc_r[i].load(Ordering::Relaxed) / n;
                let g = self.acc_g[i].load(Ordering::Relaxed) / n;
                let b = self.acc_b[i].load(Ordering::Relaxed) / n;
                self.cells[i] = pack_bgr(r as u8, g as u8, b as u8);
            } else if i as i32 > last_fovea_index {
                self.cells[i] = 0;
            }
        }
        self.length = self.n_max_cells;
    }

    // ── Persistence ──────────────────────────────────────────────

    /// Write the image to `path` in the portable binary format.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), LpxError> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);

        let header = [
            8 + self.length as i32,
            self.length as i32,
            self.n_max_cells as i32,
            self.spiral_per as i32,
            self.width as i32,
            self.height as i32,
            (self.x_ofs * 100_000.0) as i32,
            (self.y_ofs * 100_000.0) as i32,
        ];
        for v in header {
            writer.write_all(&v.to_le_bytes())?;
        }
        for cell in &self.cells[..self.length] {
            writer.write_all(&cell.to_le_bytes())?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Load an image previously written by [`save`](Self::save).
    pub fn load(path: impl AsRef<Path>) -> Result<Self, LpxError> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);

        let mut header = [0i32; 8];
        let mut buf = [0u8; 4];
        for v in header.iter_mut() {
            reader.read_exact(&mut buf)?;
            *v = i32::from_le_bytes(buf);
        }

        let length = header[1];
        let n_max_cells = header[2];
        let spiral_per = header[3] as f32 + 0.5;
        if length < 0 || n_max_cells < 0 {
            return Err(LpxError::InvalidTables(format!(
                "negative cell count in image header ({length}, {n_max_cells})"
            )));
        }
        if spiral_per < 0.1 {
            return Err(LpxError::InvalidTables(format!(
                "degenerate spiral period {spiral_per} in image header"
            )));
        }

        let mut bytes = vec![0u8; length as usize * 4];
        reader.read_exact(&mut bytes)?;
        let cells = bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        Ok(Self::from_parts(
            length as usize,
            n_max_cells as usize,
            spiral_per,
            header[4].max(0) as u32,
            header[5].max(0) as u32,
            header[6] as f32 * 1e-5,
            header[7] as f32 * 1e-5,
            cells,
        ))
    }
}

impl Clone for LpImage {
    /// Clones the cell buffer and geometry; the scratch accumulators
    /// start zeroed in the copy.
    fn clone(&self) -> Self {
        Self {
            length: self.length,
            n_max_cells: self.n_max_cells,
            spiral_per: self.spiral_per,
            width: self.width,
            height: self.height,
            x_ofs: self.x_ofs,
            y_ofs: self.y_ofs,
            cells: self.cells.clone(),
            acc_r: zeroed_atomics(self.n_max_cells),
            acc_g: zeroed_atomics(self.n_max_cells),
            acc_b: zeroed_atomics(self.n_max_cells),
            count: zeroed_atomics(self.n_max_cells),
        }
    }
}

impl std::fmt::Debug for LpImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LpImage")
            .field("length", &self.length)
            .field("n_max_cells", &self.n_max_cells)
            .field("spiral_per", &self.spiral_per)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("x_ofs", &self.x_ofs)
            .field("y_ofs", &self.y_ofs)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::tiny_tables;

    #[test]
    fn pack_unpack_bit_exact() {
        let cell = pack_bgr(0x12, 0x34, 0x56);
        assert_eq!(cell, 0x0012_3456);
        assert_eq!(unpack_bgr(cell), (0x12, 0x34, 0x56));

        assert_eq!(pack_bgr(255, 0, 0), 0x00FF_0000);
        assert_eq!(pack_bgr(0, 0, 255), 0x0000_00FF);
    }

    #[test]
    fn new_sizes_to_tables() {
        let tables = Arc::new(tiny_tables());
        let img = LpImage::new(&tables, 64, 48).unwrap();
        assert_eq!(img.max_cells(), tables.last_cell_index() as usize + 1);
        assert!(img.cells().iter().all(|&c| c == 0));
    }

    #[test]
    fn save_load_roundtrip() {
        let tables = Arc::new(tiny_tables());
        let mut img = LpImage::new(&tables, 64, 48).unwrap();
        img.set_length(img.max_cells());
        img.set_offset(12.25, -3.5);
        let n = img.max_cells();
        for (i, cell) in img.cells_mut().iter_mut().enumerate() {
            *cell = pack_bgr((i % 256) as u8, ((i * 7) % 256) as u8, ((i * 13) % 256) as u8);
        }
        assert!(n > 0);

        let file = tempfile::NamedTempFile::new().unwrap();
        img.save(file.path()).unwrap();
        let loaded = LpImage::load(file.path()).unwrap();

        assert_eq!(loaded.length(), img.length());
        assert_eq!(loaded.max_cells(), img.max_cells());
        assert_eq!(loaded.spiral_per(), img.spiral_per());
        assert_eq!(loaded.width(), 64);
        assert_eq!(loaded.height(), 48);
        let (x, y) = loaded.offset();
        assert!((x - 12.25).abs() < 1e-4);
        assert!((y + 3.5).abs() < 1e-4);
        assert_eq!(loaded.cells()[..loaded.length()], img.cells()[..img.length()]);
    }

    #[test]
    fn cell_value_bounds() {
        let tables = Arc::new(tiny_tables());
        let img = LpImage::new(&tables, 64, 48).unwrap();
        assert_eq!(img.cell_value(-1), 0);
        assert_eq!(img.cell_value(img.max_cells() as i32), 0);
    }
}
