use std::sync::OnceLock;

use crate::masked_image::DISTANCE_SCALE;

/// Control points of the piecewise-linear distance-to-similarity curve, at `k/100` fractions
/// of the table length.
const BASE: [f64; 11] = [
    1.0, 0.99, 0.96, 0.83, 0.38, 0.11, 0.02, 0.005, 0.0006, 0.0001, 0.0,
];

static TABLE: OnceLock<Vec<f64>> = OnceLock::new();

/// The process-wide distance -> similarity-weight lookup table, built on first use.
///
/// `OnceLock::get_or_init` makes a race between two first-callers benign: both observe the
/// same `&'static` table, and the closure runs at most once.
pub fn table() -> &'static [f64] {
    TABLE.get_or_init(build_table)
}

fn build_table() -> Vec<f64> {
    let length = (DISTANCE_SCALE + 1) as usize;
    let mut table = vec![0.0; length];
    for (i, value) in table.iter_mut().enumerate() {
        let t = i as f64 / length as f64;
        let j = (100.0 * t) as usize;
        let k = j + 1;
        let vj = if j < 11 { BASE[j] } else { 0.0 };
        let vk = if k < 11 { BASE[k] } else { 0.0 };
        *value = vj + (100.0 * t - j as f64) * (vk - vj);
    }
    table
}

/// Similarity weight in `[0, 1]` for a scaled patch distance.
pub fn weight(distance: i32) -> f64 {
    let table = table();
    table[distance.clamp(0, DISTANCE_SCALE) as usize]
}
