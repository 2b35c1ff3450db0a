//! Neighbour-mask precomputation for the packed stencil variant
//!
//! Whether a neighbour contributes depends only on the static property layout,
//! so it is evaluated once per run here instead of once per cell per step in
//! the kernel.

use crate::world::CellFlags;
use rayon::prelude::*;

/// Augment a property array with per-direction contribution bits
///
/// Every interior, non-Fixed, non-Insulator cell gets `SUPPORTS_ABOVE`,
/// `SUPPORTS_BELOW`, `SUPPORTS_LEFT` and `SUPPORTS_RIGHT` set iff the
/// corresponding neighbour is not an Insulator. Stale direction bits on such
/// cells are cleared first. Border cells and static cells are returned
/// unchanged.
///
/// # Panics
///
/// Panics if `properties.len() != width * height`.
#[must_use]
pub fn pack_neighbor_mask(width: u32, height: u32, properties: &[u32]) -> Vec<u32> {
    let w = width as usize;
    let h = height as usize;
    assert_eq!(properties.len(), w * h, "property array does not match grid");

    let mut packed = properties.to_vec();
    if w < 3 || h < 3 {
        // No interior cells
        return packed;
    }

    let contributes = |i: usize| properties[i] & CellFlags::INSULATOR == 0;

    packed
        .par_chunks_mut(w)
        .enumerate()
        .skip(1)
        .take(h - 2)
        .for_each(|(y, row)| {
            for x in 1..w - 1 {
                let bits = row[x];
                if CellFlags::is_static(bits) {
                    continue;
                }
                let index = y * w + x;
                let mut mask = bits & !CellFlags::SUPPORTS_ALL;
                if contributes(index - w) {
                    mask |= CellFlags::SUPPORTS_ABOVE;
                }
                if contributes(index + w) {
                    mask |= CellFlags::SUPPORTS_BELOW;
                }
                if contributes(index - 1) {
                    mask |= CellFlags::SUPPORTS_LEFT;
                }
                if contributes(index + 1) {
                    mask |= CellFlags::SUPPORTS_RIGHT;
                }
                row[x] = mask;
            }
        });

    packed
}
