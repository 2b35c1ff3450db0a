//! Demo world generation
//!
//! Builds well-formed worlds for benchmarking and manual runs: a Fixed border
//! held at zero, a hot Fixed source, a cold Fixed sink and a few seeded random
//! insulating walls.

use super::grid::{CellFlags, HeatWorld};
use crate::error::HeatError;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Parameters for [`generate_world`]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeneratorConfig {
    /// Grid width in cells (at least 3)
    pub width: u32,
    /// Grid height in cells (at least 3)
    pub height: u32,
    /// Diffusion coefficient
    pub alpha: f32,
    /// Number of insulating wall segments
    pub walls: u32,
    /// RNG seed, identical seeds give identical worlds
    pub seed: u64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            width: 64,
            height: 64,
            alpha: 0.1,
            walls: 4,
            seed: 42,
        }
    }
}

/// Generate a well-formed demo world
///
/// # Errors
///
/// Returns [`HeatError::InputValidity`] if the grid has no interior
/// (`width < 3` or `height < 3`).
pub fn generate_world(config: &GeneratorConfig) -> Result<HeatWorld, HeatError> {
    let GeneratorConfig {
        width,
        height,
        alpha,
        walls,
        seed,
    } = *config;
    if width < 3 || height < 3 {
        return Err(HeatError::InputValidity(format!(
            "generated worlds need an interior, got {width}x{height}"
        )));
    }

    let mut world = HeatWorld::bordered(width, height, alpha);
    let mut rng = StdRng::seed_from_u64(seed);

    // Walls first so the source and sink always land on top of them
    for _ in 0..walls {
        let horizontal = rng.random_bool(0.5);
        let (span, across) = if horizontal {
            (width - 2, height - 2)
        } else {
            (height - 2, width - 2)
        };
        let fixed = 1 + rng.random_range(0..across);
        let start = 1 + rng.random_range(0..span);
        let len = rng.random_range(1..=span.div_ceil(2));
        let end = (start + len).min(span + 1);
        for along in start..end {
            let (x, y) = if horizontal {
                (along, fixed)
            } else {
                (fixed, along)
            };
            world.set_properties(x, y, CellFlags::INSULATOR);
        }
    }

    let source = (width / 4).max(1);
    let sink = (width - 1 - width / 4).min(width - 2);
    let mid = height / 2;
    world.set_properties(source, mid, CellFlags::FIXED);
    world.set(source, mid, 1.0);
    world.set_properties(sink, mid, CellFlags::FIXED);
    world.set(sink, mid, 0.0);

    Ok(world)
}
