//! Synthetic scan-table fixtures shared by the test suites.
//!
//! Real tables are multi-megabyte generated artefacts; the suites
//! instead build small consistent ones. `spiral_tables` derives the
//! forward mapping from the closed-form spiral geometry, so the scan
//! and the renderer agree by construction.

use crate::spiral::{cell_index_of, R0, SV_A, TWO_PI};
use crate::tables::{PositionPair, ScanTables};

/// Hand-written miniature tables: 16×16 map, period 7.5, three fovea
/// cells, ten cells total. Enough for buffer and format tests where
/// the geometry does not matter.
pub fn tiny_tables() -> ScanTables {
    ScanTables::from_parts(
        16,
        7.5,
        2,
        9,
        vec![0, 40, 80, 120, 160, 200, 240],
        vec![3, 4, 5, 6, 7, 8, 9],
        vec![
            PositionPair { x: 8, y: 8 },
            PositionPair { x: 9, y: 8 },
            PositionPair { x: 8, y: 9 },
        ],
    )
    .expect("static fixture is valid")
}

/// Build tables whose outer mapping is derived from
/// [`cell_index_of`] over a `map_width²` scan map.
///
/// Every pixel is classified with the closed form and boundaries are
/// run-length encoded exactly the way real table files store them.
/// Fovea positions are placed on the approximate spiral centres of
/// cells `0..=fovea_cells`.
pub fn spiral_tables(
    map_width: i32,
    spiral_per: f32,
    fovea_cells: i32,
    total_cells: i32,
) -> ScanTables {
    let half = map_width / 2;

    let mut outer_pixel_index = Vec::new();
    let mut outer_pixel_cell_idx = Vec::new();
    let mut prev = i32::MIN;
    for k in 0..map_width {
        for j in 0..map_width {
            let cell = cell_index_of((j - half) as f32, (k - half) as f32, spiral_per)
                .clamp(0, total_cells);
            if cell != prev {
                outer_pixel_index.push(k * map_width + j);
                outer_pixel_cell_idx.push(cell);
                prev = cell;
            }
        }
    }

    let growth = SV_A / spiral_per + 1.0;
    let inner_cells = (0..=fovea_cells)
        .map(|i| {
            let radius = R0 * growth.powf(i as f32 / spiral_per);
            let angle = TWO_PI * (i as f32 % spiral_per) / spiral_per;
            PositionPair {
                x: half + (radius * angle.cos()).round() as i32,
                y: half + (radius * angle.sin()).round() as i32,
            }
        })
        .collect();

    ScanTables::from_parts(
        map_width,
        spiral_per,
        fovea_cells,
        total_cells,
        outer_pixel_index,
        outer_pixel_cell_idx,
        inner_cells,
    )
    .expect("derived fixture is valid")
}
