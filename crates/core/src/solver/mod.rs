//! Heat diffusion solver module
//!
//! This module provides the stencil kernel, the neighbour-mask precomputation,
//! the step orchestrator and the compute backends it drives. The core
//! abstraction is the `ComputeBackend` trait, which has both CPU and GPU
//! implementations.
//!
//! # Feature Flags
//!
//! - `gpu` (default): Enables GPU acceleration via wgpu. Disable with `--no-default-features`
//!   for environments without GPU access.
//!
//! # Backend Selection
//!
//! With [`BackendPreference::Auto`] the best available backend is chosen:
//! 1. Try GPU (if `gpu` feature enabled, hardware available and the grid fits)
//! 2. Fall back to CPU (always available)
//!
//! # Example
//!
//! ```rust,no_run
//! use heat_sim_core::solver::{create_backend, StepOrchestrator};
//! use heat_sim_core::{HeatWorld, RunConfig};
//!
//! let mut world = HeatWorld::bordered(64, 64, 0.1);
//! let config = RunConfig::default();
//! let mut backend = create_backend(&config, world.width, world.height)?;
//! StepOrchestrator::new(&mut backend).run(&mut world, 0.1, 100)?;
//! # Ok::<(), heat_sim_core::HeatError>(())
//! ```

mod context;
mod cpu;
mod kernel;
mod orchestrator;
mod packing;
pub mod profiler;
#[allow(clippy::module_name_repetitions)]
mod r#trait;

#[cfg(feature = "gpu")]
mod gpu;

// Re-exports
pub use context::GpuInitResult;
pub use cpu::CpuBackend;
pub use kernel::{step_cell_naive, step_cell_packed, step_grid, StencilVariant, StencilWeights};
pub use orchestrator::{DispatchStrategy, RunPhase, StepOrchestrator, StepReport};
pub use packing::pack_neighbor_mask;
pub use profiler::ProfilerScope;
pub use r#trait::{BufferId, BufferKind, ComputeBackend, Event, KernelLaunch};

#[cfg(feature = "gpu")]
pub use context::GpuContext;
#[cfg(feature = "gpu")]
pub use gpu::{load_kernel_source, GpuBackend, KERNEL_FILE_NAME};

use crate::config::{BackendPreference, RunConfig};
use crate::error::HeatError;
use tracing::info;

#[cfg(feature = "gpu")]
use tracing::warn;

/// Create a compute backend for a `width × height` grid
///
/// - [`BackendPreference::Cpu`] always yields a [`CpuBackend`].
/// - [`BackendPreference::Gpu`] yields a GPU backend or fails.
/// - [`BackendPreference::Auto`] tries the GPU and falls back to the CPU with
///   a logged reason. An explicitly requested adapter that does not exist is
///   still an error.
///
/// # Errors
///
/// Returns [`HeatError::Configuration`] when a required GPU cannot be set up,
/// and [`HeatError::Compilation`] when the kernel does not build.
pub fn create_backend(
    config: &RunConfig,
    width: u32,
    height: u32,
) -> Result<Box<dyn ComputeBackend>, HeatError> {
    match config.backend {
        BackendPreference::Cpu => {
            info!("Using CPU backend ({}x{} grid)", width, height);
            Ok(Box::new(CpuBackend::new()))
        }
        BackendPreference::Gpu => create_gpu_backend(config, width, height),
        BackendPreference::Auto => auto_backend(config, width, height),
    }
}

#[cfg(feature = "gpu")]
fn create_gpu_backend(
    config: &RunConfig,
    width: u32,
    height: u32,
) -> Result<Box<dyn ComputeBackend>, HeatError> {
    let gpu_context = GpuContext::with_adapter(config.adapter_index).into_context()?;
    if !gpu_context.can_allocate(width, height) {
        return Err(HeatError::Configuration(format!(
            "GPU '{}' cannot hold a {}x{} grid",
            gpu_context.adapter_name(),
            width,
            height
        )));
    }
    info!(
        "Using GPU backend: {} ({}x{} grid)",
        gpu_context.adapter_name(),
        width,
        height
    );
    let backend = GpuBackend::with_kernel_dir(gpu_context, config.kernel_dir.as_deref())?;
    Ok(Box::new(backend))
}

#[cfg(not(feature = "gpu"))]
fn create_gpu_backend(
    _config: &RunConfig,
    _width: u32,
    _height: u32,
) -> Result<Box<dyn ComputeBackend>, HeatError> {
    Err(HeatError::Configuration(
        "GPU backend requested but the gpu feature is disabled".to_string(),
    ))
}

#[cfg(feature = "gpu")]
fn auto_backend(
    config: &RunConfig,
    width: u32,
    height: u32,
) -> Result<Box<dyn ComputeBackend>, HeatError> {
    match GpuContext::with_adapter(config.adapter_index) {
        GpuInitResult::Success(gpu_context) => {
            if gpu_context.can_allocate(width, height) {
                info!(
                    "Using GPU backend: {} ({}x{} grid)",
                    gpu_context.adapter_name(),
                    width,
                    height
                );
                let backend =
                    GpuBackend::with_kernel_dir(gpu_context, config.kernel_dir.as_deref())?;
                return Ok(Box::new(backend));
            }
            warn!(
                "GPU has insufficient memory for {}x{} grid, falling back to CPU",
                width, height
            );
        }
        GpuInitResult::NoGpuFound => {
            info!("No GPU found, using CPU backend");
        }
        result @ GpuInitResult::AdapterNotFound { .. } => {
            // An explicit adapter choice is never silently ignored
            return Err(HeatError::Configuration(
                result.failure_reason().unwrap_or_default(),
            ));
        }
        GpuInitResult::InitFailed {
            adapter_name,
            error,
        } => {
            warn!(
                "GPU '{}' found but failed to initialize: {}. Falling back to CPU.",
                adapter_name, error
            );
        }
    }

    Ok(Box::new(CpuBackend::new()))
}

#[cfg(not(feature = "gpu"))]
fn auto_backend(
    _config: &RunConfig,
    width: u32,
    height: u32,
) -> Result<Box<dyn ComputeBackend>, HeatError> {
    info!(
        "GPU feature disabled, using CPU backend ({}x{} grid)",
        width, height
    );
    Ok(Box::new(CpuBackend::new()))
}
