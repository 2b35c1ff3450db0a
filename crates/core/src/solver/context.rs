//! GPU context and initialization
//!
//! This module handles GPU adapter discovery, selection and device creation.
//! It distinguishes between "no GPU found" (expected on some systems),
//! "requested adapter does not exist" (a configuration mistake) and
//! "GPU found but failed to initialize" (potential driver issue).

use crate::error::HeatError;

/// Result of GPU initialization attempt
#[derive(Debug)]
pub enum GpuInitResult {
    /// GPU initialized successfully
    #[cfg(feature = "gpu")]
    Success(GpuContext),
    /// No GPU adapter found (silent fallback to CPU)
    NoGpuFound,
    /// An explicit adapter index was requested but does not exist
    AdapterNotFound {
        /// Requested adapter index
        index: usize,
        /// Number of adapters actually present
        available: usize,
    },
    /// GPU found but initialization failed (log warning, fallback to CPU)
    InitFailed {
        /// Name of the adapter that failed
        adapter_name: String,
        /// Error message
        error: String,
    },
}

impl GpuInitResult {
    /// Human-readable reason why no context was produced, `None` on success
    #[must_use]
    pub fn failure_reason(&self) -> Option<String> {
        match self {
            #[cfg(feature = "gpu")]
            Self::Success(_) => None,
            Self::NoGpuFound => Some("no compatible GPU adapter found".to_string()),
            Self::AdapterNotFound { index, available } => Some(format!(
                "adapter {index} requested but only {available} adapter(s) present"
            )),
            Self::InitFailed {
                adapter_name,
                error,
            } => Some(format!(
                "GPU '{adapter_name}' found but failed to initialize: {error}"
            )),
        }
    }

    /// Convert into a context, treating every failure as fatal
    ///
    /// # Errors
    ///
    /// Returns [`HeatError::Configuration`] unless initialization succeeded.
    #[cfg(feature = "gpu")]
    pub fn into_context(self) -> Result<GpuContext, HeatError> {
        match self {
            Self::Success(context) => Ok(context),
            other => Err(HeatError::Configuration(
                other.failure_reason().unwrap_or_default(),
            )),
        }
    }

    /// Convert into a context, treating every failure as fatal
    ///
    /// # Errors
    ///
    /// Always returns [`HeatError::Configuration`]: GPU support is compiled out.
    #[cfg(not(feature = "gpu"))]
    pub fn into_context(self) -> Result<std::convert::Infallible, HeatError> {
        Err(HeatError::Configuration(
            self.failure_reason()
                .unwrap_or_else(|| "GPU feature disabled".to_string()),
        ))
    }
}

// All GPU-specific code is conditionally compiled only when "gpu" feature is enabled
#[cfg(feature = "gpu")]
mod gpu_impl {
    use super::GpuInitResult;
    use tracing::{debug, info};

    /// Workgroup edge length, must match `@workgroup_size` in `heat_step.wgsl`
    pub const WORKGROUP_SIZE: u32 = 16;

    /// GPU context managing device and queue
    ///
    /// Wraps wgpu device and queue along with adapter information.
    #[derive(Debug)]
    pub struct GpuContext {
        device: wgpu::Device,
        queue: wgpu::Queue,
        adapter_info: wgpu::AdapterInfo,
    }

    impl GpuContext {
        /// Initialize GPU context on the preferred high-performance adapter
        ///
        /// # Returns
        ///
        /// - `GpuInitResult::Success` - GPU ready to use
        /// - `GpuInitResult::NoGpuFound` - No compatible GPU adapter
        /// - `GpuInitResult::InitFailed` - GPU found but initialization failed
        #[allow(clippy::new_ret_no_self)]
        pub fn new() -> GpuInitResult {
            Self::with_adapter(None)
        }

        /// Initialize GPU context, optionally on a specific adapter
        ///
        /// With `Some(index)` the adapter is picked from the enumeration order
        /// logged at debug level; with `None` wgpu picks a high-performance
        /// adapter.
        pub fn with_adapter(adapter_index: Option<usize>) -> GpuInitResult {
            info!("Attempting to initialize GPU context");

            let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
                backends: wgpu::Backends::all(),
                ..Default::default()
            });

            let adapters = instance.enumerate_adapters(wgpu::Backends::all());
            debug!("Found {} adapter(s)", adapters.len());
            for (i, adapter) in adapters.iter().enumerate() {
                let adapter_info = adapter.get_info();
                debug!(
                    "  Adapter {} : {} ({:?}, {:?})",
                    i, adapter_info.name, adapter_info.backend, adapter_info.device_type
                );
            }

            let adapter = if let Some(index) = adapter_index {
                let available = adapters.len();
                if let Some(a) = adapters.into_iter().nth(index) {
                    debug!("Choosing adapter {}", index);
                    a
                } else {
                    return GpuInitResult::AdapterNotFound { index, available };
                }
            } else if let Some(a) =
                pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
                    power_preference: wgpu::PowerPreference::HighPerformance,
                    compatible_surface: None,
                    force_fallback_adapter: false,
                }))
            {
                debug!("Found GPU adapter: {}", a.get_info().name);
                a
            } else {
                debug!("No GPU adapter found");
                return GpuInitResult::NoGpuFound;
            };

            let adapter_info = adapter.get_info();
            let adapter_name = adapter_info.name.clone();

            // Try to create device - this can fail even with a valid adapter
            match pollster::block_on(adapter.request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("HeatSim GPU"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::default(),
                    memory_hints: wgpu::MemoryHints::Performance,
                },
                None,
            )) {
                Ok((device, queue)) => {
                    info!("GPU context initialized successfully: {}", adapter_name);
                    GpuInitResult::Success(Self {
                        device,
                        queue,
                        adapter_info,
                    })
                }
                Err(e) => {
                    debug!("Failed to create GPU device: {}", e);
                    GpuInitResult::InitFailed {
                        adapter_name,
                        error: e.to_string(),
                    }
                }
            }
        }

        /// Get adapter name for logging
        #[must_use]
        pub fn adapter_name(&self) -> &str {
            &self.adapter_info.name
        }

        /// Check if GPU has enough memory for a grid of the given size
        ///
        /// A run needs two state buffers, one property buffer and one staging
        /// buffer, each `width * height * 4` bytes.
        #[must_use]
        pub fn can_allocate(&self, width: u32, height: u32) -> bool {
            let buffer_bytes = 4 * u64::from(width) * u64::from(height);
            let limits = self.device.limits();

            // Each buffer must fit in a single binding
            if buffer_bytes > u64::from(limits.max_storage_buffer_binding_size)
                || buffer_bytes > limits.max_buffer_size
            {
                return false;
            }

            // Dispatch grid must fit in the workgroup count limit
            let max_groups = limits.max_compute_workgroups_per_dimension;
            width.div_ceil(WORKGROUP_SIZE) <= max_groups
                && height.div_ceil(WORKGROUP_SIZE) <= max_groups
        }

        /// Get reference to wgpu device
        #[must_use]
        pub fn device(&self) -> &wgpu::Device {
            &self.device
        }

        /// Get reference to wgpu queue
        #[must_use]
        pub fn queue(&self) -> &wgpu::Queue {
            &self.queue
        }
    }

}

// Re-export GpuContext only when GPU feature is enabled
#[cfg(feature = "gpu")]
pub use gpu_impl::{GpuContext, WORKGROUP_SIZE};
