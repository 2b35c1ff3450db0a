//! Stencil kernel (host rendition)
//!
//! Implements the per-cell diffusion update used by the CPU backend. The GPU
//! backend runs the same arithmetic, in the same order, from
//! `shaders/heat_step.wgsl`.
//!
//! # Update rule
//!
//! ```text
//! static cell:   next = state[i]
//! otherwise:     acc     = inner·state[i] + Σ outer·state[n]   (contributing n)
//!                contrib = inner          + Σ outer            (contributing n)
//!                next    = clamp(acc / contrib, 0, 1)
//! ```
//!
//! Neighbours are visited above, below, left, right. A neighbour contributes
//! unless it is an Insulator. `inner` is not renormalized for cells with fewer
//! than four contributing neighbours.

use crate::world::CellFlags;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// How the kernel decides whether a neighbour contributes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StencilVariant {
    /// Test the neighbour's `INSULATOR` bit on every step
    Naive,
    /// Read the precomputed `SUPPORTS_*` bits of the cell itself
    #[default]
    Packed,
}

impl StencilVariant {
    /// Stable lowercase name, matches the serde and CLI spelling
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Naive => "naive",
            Self::Packed => "packed",
        }
    }
}

impl std::fmt::Display for StencilVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StencilVariant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "naive" => Ok(Self::Naive),
            "packed" => Ok(Self::Packed),
            other => Err(format!("unknown stencil variant '{other}' (naive|packed)")),
        }
    }
}

/// Per-step kernel weights
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StencilWeights {
    /// Fraction of a cell's own value retained per step
    pub inner: f32,
    /// Fraction spread to each contributing neighbour per step
    pub outer: f32,
}

impl StencilWeights {
    /// Derive weights from the diffusion coefficient and timestep
    #[must_use]
    pub fn new(alpha: f32, dt: f32) -> Self {
        let outer = alpha * dt;
        let inner = 1.0 - outer / 4.0;
        Self { inner, outer }
    }
}

/// Precomputed contribution bits, listed above, below, left, right
const NEIGHBOUR_BITS: [u32; 4] = [
    CellFlags::SUPPORTS_ABOVE,
    CellFlags::SUPPORTS_BELOW,
    CellFlags::SUPPORTS_LEFT,
    CellFlags::SUPPORTS_RIGHT,
];

#[inline(always)]
fn neighbour_indices(index: usize, width: usize) -> [usize; 4] {
    [index - width, index + width, index - 1, index + 1]
}

/// Normalize and clamp to [0, 1]
///
/// `contrib` is zero when `alpha * dt == 4` and every neighbour insulates, or
/// for some negative `dt`. `x / 0` then saturates by the sign of `x` and
/// `0 / 0` settles at 0.
#[inline(always)]
fn finish(acc: f32, contrib: f32) -> f32 {
    let value = acc / contrib;
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Next value of one cell, checking neighbour insulation live
///
/// `index` must not be a border cell unless that cell is static.
#[inline]
#[must_use]
pub fn step_cell_naive(
    index: usize,
    width: usize,
    weights: StencilWeights,
    state: &[f32],
    properties: &[u32],
) -> f32 {
    if CellFlags::is_static(properties[index]) {
        return state[index];
    }

    let mut contrib = weights.inner;
    let mut acc = weights.inner * state[index];
    for nb in neighbour_indices(index, width) {
        if properties[nb] & CellFlags::INSULATOR == 0 {
            contrib += weights.outer;
            acc += weights.outer * state[nb];
        }
    }
    finish(acc, contrib)
}

/// Next value of one cell, using the precomputed neighbour mask
///
/// `mask` must come from [`super::pack_neighbor_mask`].
#[inline]
#[must_use]
pub fn step_cell_packed(
    index: usize,
    width: usize,
    weights: StencilWeights,
    state: &[f32],
    mask: &[u32],
) -> f32 {
    let bits = mask[index];
    if CellFlags::is_static(bits) {
        return state[index];
    }

    let mut contrib = weights.inner;
    let mut acc = weights.inner * state[index];
    for (nb, bit) in neighbour_indices(index, width).into_iter().zip(NEIGHBOUR_BITS) {
        if bits & bit != 0 {
            contrib += weights.outer;
            acc += weights.outer * state[nb];
        }
    }
    finish(acc, contrib)
}

/// Apply one step to every cell, row-parallel
///
/// Reads only `state` and writes only `dest`; the two slices cannot alias.
pub fn step_grid(
    variant: StencilVariant,
    weights: StencilWeights,
    width: usize,
    state: &[f32],
    properties: &[u32],
    dest: &mut [f32],
) {
    dest.par_chunks_mut(width)
        .enumerate()
        .for_each(|(y, row)| {
            let base = y * width;
            for (x, cell) in row.iter_mut().enumerate() {
                *cell = match variant {
                    StencilVariant::Naive => {
                        step_cell_naive(base + x, width, weights, state, properties)
                    }
                    StencilVariant::Packed => {
                        step_cell_packed(base + x, width, weights, state, properties)
                    }
                };
            }
        });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::pack_neighbor_mask;
    use approx::assert_relative_eq;

    /// 3x3 grid, Fixed border at 0, centre at 1
    fn hot_centre() -> (Vec<f32>, Vec<u32>) {
        let mut state = vec![0.0; 9];
        let mut props = vec![CellFlags::FIXED; 9];
        state[4] = 1.0;
        props[4] = 0;
        (state, props)
    }

    #[test]
    fn test_weights_from_alpha_dt() {
        let w = StencilWeights::new(1.0, 0.25);
        assert_eq!(w.outer, 0.25);
        assert_eq!(w.inner, 0.9375);
    }

    #[test]
    fn test_single_hot_cell() {
        let (state, props) = hot_centre();
        let weights = StencilWeights::new(1.0, 0.25);
        let next = step_cell_naive(4, 3, weights, &state, &props);
        assert_relative_eq!(next, 0.9375 / 1.9375, epsilon = 1e-6);
        assert_relative_eq!(next, 0.48387, epsilon = 1e-4);
    }

    #[test]
    fn test_static_cells_are_copied() {
        let (mut state, props) = hot_centre();
        state[0] = 0.3;
        let weights = StencilWeights::new(1.0, 0.25);
        assert_eq!(step_cell_naive(0, 3, weights, &state, &props), 0.3);
        assert_eq!(step_cell_packed(0, 3, weights, &state, &props), 0.3);
    }

    #[test]
    fn test_insulated_neighbour_is_ignored() {
        // 3x4 grid: interior cells (1,1) and (1,2); (1,2) is a hot insulator
        let width = 3;
        let mut state = vec![0.0; 12];
        let mut props = vec![CellFlags::FIXED; 12];
        props[4] = 0;
        props[7] = CellFlags::INSULATOR;
        state[4] = 0.5;
        state[7] = 1.0;

        let weights = StencilWeights::new(1.0, 0.25);
        let next = step_cell_naive(4, width, weights, &state, &props);
        // three contributors at 0, inner weight unchanged
        let expected = (0.9375 * 0.5) / (0.9375 + 3.0 * 0.25);
        assert_relative_eq!(next, expected, epsilon = 1e-6);

        let mask = pack_neighbor_mask(3, 4, &props);
        assert_eq!(step_cell_packed(4, width, weights, &state, &mask), next);
    }

    #[test]
    fn test_result_is_clamped() {
        let (_, props) = hot_centre();
        // Out-of-range Fixed neighbours pull the average above one
        let mut state = vec![5.0_f32; 9];
        let weights = StencilWeights::new(1.0, 0.25);
        assert_eq!(step_cell_naive(4, 3, weights, &state, &props), 1.0);

        state.iter_mut().for_each(|v| *v = -2.0);
        assert_eq!(step_cell_naive(4, 3, weights, &state, &props), 0.0);
    }

    #[test]
    fn test_zero_total_weight_never_yields_nan() {
        // 3x3 interior cell whose four neighbours all insulate
        let mut props = vec![CellFlags::INSULATOR; 9];
        props[4] = 0;
        let mask = pack_neighbor_mask(3, 3, &props);
        // alpha * dt == 4 leaves inner at exactly zero
        let weights = StencilWeights::new(1.0, 4.0);
        assert_eq!(weights.inner, 0.0);

        let state = vec![0.5_f32; 9];
        assert_eq!(step_cell_naive(4, 3, weights, &state, &props), 0.0);
        assert_eq!(step_cell_packed(4, 3, weights, &state, &mask), 0.0);
    }

    #[test]
    fn test_step_grid_variants_agree() {
        let width = 6;
        let height = 5;
        let mut props = vec![0_u32; width * height];
        let mut state = vec![0.0_f32; width * height];
        for y in 0..height {
            for x in 0..width {
                let i = y * width + x;
                if x == 0 || y == 0 || x == width - 1 || y == height - 1 {
                    props[i] = CellFlags::FIXED;
                }
                state[i] = ((x * 7 + y * 3) % 10) as f32 / 10.0;
            }
        }
        props[2 * width + 3] = CellFlags::INSULATOR;

        let weights = StencilWeights::new(0.4, 0.5);
        let mask = pack_neighbor_mask(width as u32, height as u32, &props);
        let mut naive = vec![0.0; width * height];
        let mut packed = vec![0.0; width * height];
        step_grid(StencilVariant::Naive, weights, width, &state, &props, &mut naive);
        step_grid(StencilVariant::Packed, weights, width, &state, &mask, &mut packed);
        assert_eq!(naive, packed);
    }

    #[test]
    fn test_variant_parses() {
        assert_eq!("naive".parse::<StencilVariant>(), Ok(StencilVariant::Naive));
        assert_eq!("packed".parse::<StencilVariant>(), Ok(StencilVariant::Packed));
        assert!("fast".parse::<StencilVariant>().is_err());
        assert_eq!(StencilVariant::default().to_string(), "packed");
    }
}
