//! Heat world grid model
//!
//! Stores the per-cell state and property bitmask as two parallel flat arrays
//! in row-major order (`index = y * width + x`).

use crate::error::HeatError;
use serde::{Deserialize, Serialize};

/// Per-cell property bits
///
/// The low two bits come from the input world. The four `SUPPORTS_*` bits are
/// only ever set by [`crate::solver::pack_neighbor_mask`] and are never part of
/// a saved world.
pub struct CellFlags;

impl CellFlags {
    /// Cell value never changes (boundary or heat source)
    pub const FIXED: u32 = 0x1;
    /// Cell never changes and never contributes heat to its neighbours
    pub const INSULATOR: u32 = 0x2;
    /// Neighbour at `index - width` contributes
    pub const SUPPORTS_ABOVE: u32 = 0x4;
    /// Neighbour at `index + width` contributes
    pub const SUPPORTS_BELOW: u32 = 0x8;
    /// Neighbour at `index - 1` contributes
    pub const SUPPORTS_LEFT: u32 = 0x10;
    /// Neighbour at `index + 1` contributes
    pub const SUPPORTS_RIGHT: u32 = 0x20;

    /// All four neighbour-contribution bits
    pub const SUPPORTS_ALL: u32 =
        Self::SUPPORTS_ABOVE | Self::SUPPORTS_BELOW | Self::SUPPORTS_LEFT | Self::SUPPORTS_RIGHT;

    /// True if a cell with these properties is never updated by a step
    #[inline(always)]
    #[must_use]
    pub const fn is_static(properties: u32) -> bool {
        properties & (Self::FIXED | Self::INSULATOR) != 0
    }
}

/// A rectangular heat-diffusion world
///
/// `properties` is immutable while a stepping run is in progress; only `state`
/// and `t` change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeatWorld {
    /// Grid width in cells
    pub width: u32,
    /// Grid height in cells
    pub height: u32,
    /// Cell values in row-major order, nominally in `[0, 1]`
    pub state: Vec<f32>,
    /// Cell property bitmasks (see [`CellFlags`])
    pub properties: Vec<u32>,
    /// Diffusion coefficient
    pub alpha: f32,
    /// Accumulated simulated time
    pub t: f32,
}

/// Cell count of a `width × height` grid, computed in `usize`
#[inline]
pub(crate) fn cells_in(width: u32, height: u32) -> usize {
    width as usize * height as usize
}

impl HeatWorld {
    /// Build a world from raw arrays
    ///
    /// # Errors
    ///
    /// Returns [`HeatError::InputValidity`] if either array length differs from
    /// `width * height`.
    pub fn new(
        width: u32,
        height: u32,
        state: Vec<f32>,
        properties: Vec<u32>,
        alpha: f32,
    ) -> Result<Self, HeatError> {
        let world = Self {
            width,
            height,
            state,
            properties,
            alpha,
            t: 0.0,
        };
        world.check_dimensions()?;
        Ok(world)
    }

    /// Create an all-zero world whose border cells are marked Fixed
    ///
    /// Interior cells start at zero with no properties. This is the usual
    /// starting point for hand-built test worlds.
    #[must_use]
    pub fn bordered(width: u32, height: u32, alpha: f32) -> Self {
        let cells = cells_in(width, height);
        let mut world = Self {
            width,
            height,
            state: vec![0.0; cells],
            properties: vec![0; cells],
            alpha,
            t: 0.0,
        };
        for y in 0..height {
            for x in 0..width {
                if world.is_border(x, y) {
                    let idx = world.index(x, y);
                    world.properties[idx] = CellFlags::FIXED;
                }
            }
        }
        world
    }

    /// Number of cells in the grid
    #[must_use]
    pub fn cell_count(&self) -> usize {
        cells_in(self.width, self.height)
    }

    /// Row-major index of `(x, y)`
    #[inline]
    #[must_use]
    pub fn index(&self, x: u32, y: u32) -> usize {
        y as usize * self.width as usize + x as usize
    }

    /// True if `(x, y)` lies on the outer ring of the grid
    #[inline]
    #[must_use]
    pub fn is_border(&self, x: u32, y: u32) -> bool {
        x == 0 || y == 0 || x + 1 == self.width || y + 1 == self.height
    }

    /// Get the state value at grid position
    ///
    /// # Panics
    ///
    /// Panics if coordinates are out of bounds
    #[must_use]
    pub fn get(&self, x: u32, y: u32) -> f32 {
        assert!(
            x < self.width && y < self.height,
            "Coordinates out of bounds"
        );
        self.state[self.index(x, y)]
    }

    /// Set the state value at grid position
    ///
    /// # Panics
    ///
    /// Panics if coordinates are out of bounds
    pub fn set(&mut self, x: u32, y: u32, value: f32) {
        assert!(
            x < self.width && y < self.height,
            "Coordinates out of bounds"
        );
        let idx = self.index(x, y);
        self.state[idx] = value;
    }

    /// Replace the property bits at grid position
    ///
    /// # Panics
    ///
    /// Panics if coordinates are out of bounds
    pub fn set_properties(&mut self, x: u32, y: u32, properties: u32) {
        assert!(
            x < self.width && y < self.height,
            "Coordinates out of bounds"
        );
        let idx = self.index(x, y);
        self.properties[idx] = properties;
    }

    fn check_dimensions(&self) -> Result<(), HeatError> {
        if self.width == 0 || self.height == 0 {
            return Err(HeatError::InputValidity(format!(
                "grid must have at least one cell, got {}x{}",
                self.width, self.height
            )));
        }
        let cells = self.cell_count();
        if self.state.len() != cells {
            return Err(HeatError::InputValidity(format!(
                "state has {} entries but a {}x{} grid needs {cells}",
                self.state.len(),
                self.width,
                self.height
            )));
        }
        if self.properties.len() != cells {
            return Err(HeatError::InputValidity(format!(
                "properties has {} entries but a {}x{} grid needs {cells}",
                self.properties.len(),
                self.width,
                self.height
            )));
        }
        Ok(())
    }

    /// Check every precondition the stencil kernel relies on
    ///
    /// The kernel reads all four neighbours of every non-static cell without
    /// bounds checks, so every border cell must be Fixed or Insulator.
    ///
    /// # Errors
    ///
    /// Returns [`HeatError::InputValidity`] describing the first violation.
    pub fn validate(&self) -> Result<(), HeatError> {
        self.check_dimensions()?;
        if !self.alpha.is_finite() {
            return Err(HeatError::InputValidity(format!(
                "alpha must be finite, got {}",
                self.alpha
            )));
        }
        for y in 0..self.height {
            for x in 0..self.width {
                if !self.is_border(x, y) {
                    continue;
                }
                let props = self.properties[self.index(x, y)];
                if !CellFlags::is_static(props) {
                    return Err(HeatError::InputValidity(format!(
                        "border cell ({x}, {y}) is neither Fixed nor Insulator"
                    )));
                }
            }
        }
        Ok(())
    }
}
