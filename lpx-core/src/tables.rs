//! Precomputed scan tables: the pixel → cell spatial index.
//!
//! Tables are generated offline and loaded from a little-endian
//! binary file. After a successful load the structure is immutable
//! and is shared across the pipeline behind an `Arc`.
//!
//! ## File format
//!
//! Header, 7 × `i32` little-endian:
//! ```text
//! total_length     (informational)
//! map_width        side of the square scan map, in pixels
//! spiral_per_int   spiral period minus the implicit 0.5
//! length           entries in each outer-pixel array
//! inner_length     entries in the fovea position array
//! last_fovea_index highest cell index treated as fovea
//! last_cell_index  highest valid cell index
//! ```
//!
//! Body:
//! ```text
//! outer_pixel_index    length × i32
//! outer_pixel_cell_idx length × i32
//! inner_cells          inner_length × (i32 x, i32 y)
//! ```

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use tracing::info;

use crate::error::LpxError;

/// Position of a fovea pixel in scan-map coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionPair {
    pub x: i32,
    pub y: i32,
}

/// Immutable pixel → cell mapping loaded from a scan-table file.
///
/// `inner_cells` drives the fovea pass; `outer_pixel_index` /
/// `outer_pixel_cell_idx` are parallel ascending arrays from which
/// the cell index of any scan-map pixel can be recovered by ordered
/// predecessor search (or, in practice, through [`ScanCache`]).
///
/// [`ScanCache`]: crate::ScanCache
#[derive(Debug, Clone)]
pub struct ScanTables {
    map_width: i32,
    spiral_per: f32,
    last_fovea_index: i32,
    last_cell_index: i32,
    outer_pixel_index: Vec<i32>,
    outer_pixel_cell_idx: Vec<i32>,
    inner_cells: Vec<PositionPair>,
}

fn read_i32(reader: &mut impl Read) -> Result<i32, LpxError> {
    let mut buf = [0u8; 4];
    reader
        .read_exact(&mut buf)
        .map_err(|e| LpxError::InvalidTables(format!("short read in header: {e}")))?;
    Ok(i32::from_le_bytes(buf))
}

fn read_i32_array(reader: &mut impl Read, len: usize, what: &str) -> Result<Vec<i32>, LpxError> {
    let mut bytes = vec![0u8; len * 4];
    reader
        .read_exact(&mut bytes)
        .map_err(|e| LpxError::InvalidTables(format!("short read in {what}: {e}")))?;
    Ok(bytes
        .chunks_exact(4)
        .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

impl ScanTables {
    /// Load scan tables from a binary file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, LpxError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            LpxError::InvalidTables(format!("cannot open {}: {e}", path.display()))
        })?;
        let tables = Self::from_reader(&mut BufReader::new(file))?;
        info!(
            path = %path.display(),
            map_width = tables.map_width,
            spiral_per = tables.spiral_per,
            cells = tables.last_cell_index + 1,
            "loaded scan tables"
        );
        Ok(tables)
    }

    /// Parse scan tables from any byte stream.
    pub fn from_reader(reader: &mut impl Read) -> Result<Self, LpxError> {
        let _total_length = read_i32(reader)?;
        let map_width = read_i32(reader)?;
        let spiral_per_int = read_i32(reader)?;
        let length = read_i32(reader)?;
        let inner_length = read_i32(reader)?;
        let last_fovea_index = read_i32(reader)?;
        let last_cell_index = read_i32(reader)?;

        // The period is stored as an integer with an implicit +0.5.
        let spiral_per = spiral_per_int as f32 + 0.5;
        if !(0.1..=1000.0).contains(&spiral_per) {
            return Err(LpxError::InvalidTables(format!(
                "spiral period {spiral_per} outside [0.1, 1000]"
            )));
        }

        if map_width <= 0 {
            return Err(LpxError::InvalidTables(format!(
                "non-positive map width {map_width}"
            )));
        }
        if length < 0 || inner_length < 0 {
            return Err(LpxError::InvalidTables(format!(
                "negative array length ({length}, {inner_length})"
            )));
        }

        let outer_pixel_index = read_i32_array(reader, length as usize, "outer pixel index")?;
        let outer_pixel_cell_idx =
            read_i32_array(reader, length as usize, "outer pixel cell index")?;
        let inner_raw = read_i32_array(reader, inner_length as usize * 2, "inner cells")?;
        let inner_cells = inner_raw
            .chunks_exact(2)
            .map(|c| PositionPair { x: c[0], y: c[1] })
            .collect();

        Ok(Self {
            map_width,
            spiral_per,
            last_fovea_index,
            last_cell_index,
            outer_pixel_index,
            outer_pixel_cell_idx,
            inner_cells,
        })
    }

    /// Assemble tables from already-parsed parts. Used by test
    /// fixture builders; real tables come from [`ScanTables::load`].
    #[allow(clippy::too_many_arguments)]
    pub fn from_parts(
        map_width: i32,
        spiral_per: f32,
        last_fovea_index: i32,
        last_cell_index: i32,
        outer_pixel_index: Vec<i32>,
        outer_pixel_cell_idx: Vec<i32>,
        inner_cells: Vec<PositionPair>,
    ) -> Result<Self, LpxError> {
        if !(0.1..=1000.0).contains(&spiral_per) {
            return Err(LpxError::InvalidTables(format!(
                "spiral period {spiral_per} outside [0.1, 1000]"
            )));
        }
        if outer_pixel_index.len() != outer_pixel_cell_idx.len() {
            return Err(LpxError::InvalidTables(
                "outer pixel arrays differ in length".into(),
            ));
        }
        Ok(Self {
            map_width,
            spiral_per,
            last_fovea_index,
            last_cell_index,
            outer_pixel_index,
            outer_pixel_cell_idx,
            inner_cells,
        })
    }

    /// Side of the square scan map, in pixels.
    pub fn map_width(&self) -> i32 {
        self.map_width
    }

    /// Fractional spiral period (cells per revolution).
    pub fn spiral_per(&self) -> f32 {
        self.spiral_per
    }

    /// Highest cell index treated as fovea.
    pub fn last_fovea_index(&self) -> i32 {
        self.last_fovea_index
    }

    /// Highest valid cell index.
    pub fn last_cell_index(&self) -> i32 {
        self.last_cell_index
    }

    /// Scan-map pixel indices at which the cell index changes value.
    pub fn outer_pixel_index(&self) -> &[i32] {
        &self.outer_pixel_index
    }

    /// Cell indices at the [`outer_pixel_index`](Self::outer_pixel_index) boundaries.
    pub fn outer_pixel_cell_idx(&self) -> &[i32] {
        &self.outer_pixel_cell_idx
    }

    /// Fovea pixel positions, centred at `(map_width/2, map_width/2)`.
    pub fn inner_cells(&self) -> &[PositionPair] {
        &self.inner_cells
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn encode(
        map_width: i32,
        spiral_per_int: i32,
        outer: &[(i32, i32)],
        inner: &[(i32, i32)],
        last_fovea: i32,
        last_cell: i32,
    ) -> Vec<u8> {
        let mut buf = Vec::new();
        let header = [
            7 + outer.len() as i32 * 2 + inner.len() as i32 * 2,
            map_width,
            spiral_per_int,
            outer.len() as i32,
            inner.len() as i32,
            last_fovea,
            last_cell,
        ];
        for v in header {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        for (idx, _) in outer {
            buf.extend_from_slice(&idx.to_le_bytes());
        }
        for (_, cell) in outer {
            buf.extend_from_slice(&cell.to_le_bytes());
        }
        for (x, y) in inner {
            buf.extend_from_slice(&x.to_le_bytes());
            buf.extend_from_slice(&y.to_le_bytes());
        }
        buf
    }

    #[test]
    fn load_roundtrip() {
        let bytes = encode(
            100,
            7,
            &[(0, 3), (10, 4), (25, 5)],
            &[(50, 50), (51, 50)],
            2,
            5,
        );
        let tables = ScanTables::from_reader(&mut bytes.as_slice()).unwrap();

        assert_eq!(tables.map_width(), 100);
        assert_eq!(tables.spiral_per(), 7.5);
        assert_eq!(tables.last_fovea_index(), 2);
        assert_eq!(tables.last_cell_index(), 5);
        assert_eq!(tables.outer_pixel_index(), &[0, 10, 25]);
        assert_eq!(tables.outer_pixel_cell_idx(), &[3, 4, 5]);
        assert_eq!(
            tables.inner_cells(),
            &[
                PositionPair { x: 50, y: 50 },
                PositionPair { x: 51, y: 50 }
            ]
        );
    }

    #[test]
    fn rejects_short_file() {
        let bytes = encode(100, 7, &[(0, 3), (10, 4)], &[(50, 50)], 1, 4);
        let truncated = &bytes[..bytes.len() - 5];
        let err = ScanTables::from_reader(&mut &truncated[..]).unwrap_err();
        assert!(matches!(err, LpxError::InvalidTables(_)));
    }

    #[test]
    fn rejects_out_of_range_period() {
        let bytes = encode(100, 5000, &[(0, 3)], &[(50, 50)], 1, 4);
        let err = ScanTables::from_reader(&mut bytes.as_slice()).unwrap_err();
        assert!(matches!(err, LpxError::InvalidTables(_)));
    }

    #[test]
    fn load_from_disk() {
        let bytes = encode(64, 7, &[(0, 2), (5, 3)], &[(32, 32)], 1, 3);
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&bytes).unwrap();

        let tables = ScanTables::load(file.path()).unwrap();
        assert_eq!(tables.map_width(), 64);
        assert_eq!(tables.spiral_per(), 7.5);
    }

    #[test]
    fn missing_file_is_invalid_tables() {
        let err = ScanTables::load("/nonexistent/tables.sct").unwrap_err();
        assert!(matches!(err, LpxError::InvalidTables(_)));
    }
}
