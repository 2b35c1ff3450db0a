//! Heat Diffusion Simulation Core Library
//!
//! Steps a 2-D heat-diffusion field on a rectangular grid with an explicit
//! five-point stencil. The per-cell update runs on a GPU through wgpu compute
//! shaders or on the CPU through rayon, behind the same `ComputeBackend` API.
//!
//! ## Layout
//!
//! - [`world`]: the grid model, world files and a demo world generator
//! - [`solver`]: stencil kernel, neighbour-mask packing, step orchestration
//!   and the compute backends
//! - [`config`]: backend, strategy and variant selection
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use heat_sim_core::{generate_world, step_world, GeneratorConfig};
//!
//! let mut world = generate_world(&GeneratorConfig::default())?;
//! let report = step_world(&mut world, 0.1, 1000)?;
//! println!("{} steps on {}", report.steps, report.backend);
//! # Ok::<(), heat_sim_core::HeatError>(())
//! ```

pub mod config;
pub mod error;
pub mod solver;
pub mod world;

// Re-export the public API
pub use config::{BackendPreference, RunConfig};
pub use error::HeatError;
pub use solver::{
    create_backend, pack_neighbor_mask, ComputeBackend, CpuBackend, DispatchStrategy, RunPhase,
    StencilVariant, StepOrchestrator, StepReport,
};
pub use world::{
    generate_world, load_world, read_world, save_world, write_world, CellFlags, GeneratorConfig,
    HeatWorld, WorldFormat,
};

/// Advance `world` by `n` steps of `dt` with automatic backend selection
///
/// Uses the resident ping-pong strategy and the packed stencil variant.
///
/// # Errors
///
/// Returns [`HeatError::InputValidity`] for a malformed world or timestep and
/// any backend error raised while stepping.
pub fn step_world(world: &mut HeatWorld, dt: f32, n: u32) -> Result<StepReport, HeatError> {
    step_world_with(&RunConfig::default(), world, dt, n)
}

/// Advance `world` by `n` steps of `dt` using the backend, strategy and
/// variant in `config`
///
/// # Errors
///
/// Returns [`HeatError::Configuration`] if the requested backend is
/// unavailable, [`HeatError::InputValidity`] for a malformed world or
/// timestep, and any backend error raised while stepping.
pub fn step_world_with(
    config: &RunConfig,
    world: &mut HeatWorld,
    dt: f32,
    n: u32,
) -> Result<StepReport, HeatError> {
    // Reject bad input before paying for device setup
    world.validate()?;
    let mut backend = create_backend(config, world.width, world.height)?;
    StepOrchestrator::new(&mut backend)
        .with_strategy(config.strategy)
        .with_variant(config.variant)
        .run(world, dt, n)
}
