//! Log-spiral geometry shared by the scanner and the renderer.
//!
//! Cells are laid out on a logarithmic spiral with `spiralPer` cells
//! per revolution. The forward direction (pixel → cell) is served by
//! the precomputed scan tables; the closed form here is the inverse
//! used by the renderer, and the two must agree to within one cell at
//! region boundaries.

use std::f32::consts::PI;

/// Full turn in radians.
pub const TWO_PI: f32 = 2.0 * PI;

const ONE_THIRD: f32 = 1.0 / 3.0;

/// Spiral construction constant for hexagonal cells, `π·√3`.
pub const SV_A: f32 = 5.441_398_1;

/// Radius in pixels to the centre of the cell at absolute angle zero.
pub const R0: f32 = 0.455;

/// Epsilon for spiral-period comparisons.
pub const PERIOD_EPSILON: f32 = 0.001;

/// Near-equality for fractional spiral periods.
pub fn period_matches(a: f32, b: f32) -> bool {
    (a - b).abs() < PERIOD_EPSILON
}

/// Index of the cell containing the point `(x, y)` relative to the
/// spiral centre.
///
/// The nominal period index comes from the log-radius; a within-cell
/// classification then sorts the point into one of five hexagonal
/// sub-regions and adjusts the index by `0`, `+1`, `+⌊p⌋`, or
/// `+⌊p⌋+1`. Callers must clamp the result to their cell range —
/// points inside `r0` or far outside the spiral produce out-of-range
/// indices.
pub fn cell_index_of(x: f32, y: f32, spiral_per: f32) -> i32 {
    if x == 0.0 && y == 0.0 {
        return 0;
    }

    let spiral_per = spiral_per.floor() + 0.5;

    let radius = (x * x + y * y).sqrt();
    let angle = y.atan2(x);

    let pitch = 1.0 / spiral_per;
    // Fixup for round-off so the low angular boundary lands in-cell.
    let pitch_ang = 0.999_999_99 * TWO_PI * pitch;
    let inv_pitch_ang = 1.0 / pitch_ang;

    let ang = if angle < 0.0 { angle + TWO_PI } else { angle };

    let arg = ang * inv_pitch_ang;
    let j = 2.0 * arg - 0.000_000_1;
    let sv_a_pitch_1 = SV_A * pitch + 1.0;

    let i_per = (((4.0 * PI * (radius / R0).ln() / sv_a_pitch_1.ln()) * inv_pitch_ang - j)
        * pitch
        * 0.5) as i32;

    let i_per_2_spiral_per = ((i_per * 2) as f32 * spiral_per) as i32;

    // Half-period index.
    let i_cell_2 = i_per_2_spiral_per + j as i32;

    let abs_ang = 0.5 * (i_per_2_spiral_per as f32 + j) * pitch_ang;

    // Absolute angle on the half-cell boundary below `abs_ang`.
    let ang1 = 0.5 * i_cell_2 as f32 * pitch_ang;

    // Radius through the cell centres at this angle, and at the next
    // spiral period out.
    let r1 = R0 * sv_a_pitch_1.powf(abs_ang / TWO_PI);
    let r2 = r1 * sv_a_pitch_1;
    let s_2 = (r2 - r1) * ONE_THIRD;

    let mut i_cell = i_cell_2 / 2;

    let dr = radius - r1;
    let da = abs_ang - ang1;

    if dr < s_2 {
        // Region 1: inner band of the bounding cell.
        return i_cell;
    }

    if dr < 2.0 * s_2 {
        let width = PI * pitch;
        let bound = width * (dr - s_2) / s_2;

        if i_cell_2 % 2 > 0 {
            // Upper half-cell: region 4 spills into the next period.
            if da >= width - bound {
                i_cell += spiral_per as i32 + 1;
            }
        } else if da < bound {
            // Lower half-cell, region 5.
            i_cell += spiral_per as i32;
        }
        i_cell
    } else if i_cell_2 % 2 > 0 {
        i_cell + spiral_per as i32 + 1
    } else {
        i_cell + spiral_per as i32
    }
}

/// Outermost radius of a spiral holding `length` cells.
pub fn spiral_radius(length: i32, spiral_per: f32) -> f32 {
    let revs = length as f32 / spiral_per;
    R0 * ((SV_A / spiral_per) + 1.0).powf(revs)
}

/// Cell-array offset applied when rendering at `scale_factor`,
/// snapped to whole spiral periods.
pub fn cell_array_offset(scale_factor: f32, spiral_per: f32) -> i32 {
    let sp = spiral_per.floor() as i32;

    let ofs = -spiral_per * scale_factor.ln() / ((SV_A / spiral_per) + 1.0).ln();
    let mut ofs = (spiral_per * (ofs / spiral_per).round()).floor();

    if sp % 2 == 0 {
        ofs -= sp as f32;
    }
    ofs as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_is_cell_zero() {
        assert_eq!(cell_index_of(0.0, 0.0, 63.5), 0);
    }

    #[test]
    fn index_grows_with_radius() {
        let p = 63.5;
        let near = cell_index_of(5.0, 0.0, p);
        let mid = cell_index_of(50.0, 0.0, p);
        let far = cell_index_of(300.0, 0.0, p);
        assert!(near < mid, "near={near} mid={mid}");
        assert!(mid < far, "mid={mid} far={far}");
    }

    #[test]
    fn full_revolution_advances_one_period() {
        // Two points at the same angle, one spiral period apart in
        // radius, must differ by roughly one period of cells.
        let p = 63.5;
        let a = (SV_A / p) + 1.0;
        let r = 40.0f32;
        let inner = cell_index_of(r, 0.0, p);
        let outer = cell_index_of(r * a, 0.0, p);
        let diff = outer - inner;
        assert!(
            (diff - p as i32).abs() <= 1,
            "period step was {diff}, expected ~{}",
            p as i32
        );
    }

    #[test]
    fn spiral_radius_monotonic() {
        let p = 63.5;
        assert!(spiral_radius(1000, p) < spiral_radius(2000, p));
        assert!(spiral_radius(63000, p) > 100.0);
    }

    #[test]
    fn unit_scale_has_zero_offset_for_odd_period() {
        // floor(63.5) is odd, so no parity correction applies.
        assert_eq!(cell_array_offset(1.0, 63.5), 0);
    }

    #[test]
    fn even_period_parity_correction() {
        assert_eq!(cell_array_offset(1.0, 62.5), -62);
    }
}
