//! Compute backend trait definition
//!
//! This module defines the `ComputeBackend` trait, the small device API the
//! step orchestrator drives. Both the CPU and GPU backends implement it.
//!
//! Buffers are referred to by [`BufferId`] handles owned by the backend, so
//! swapping the roles of two buffers never copies their contents. Transfers and
//! dispatches return an [`Event`] that later operations may declare as a
//! dependency.

use super::kernel::{StencilVariant, StencilWeights};
use crate::error::HeatError;

/// Handle to a backend-owned device buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u32);

/// Completion token for a transfer or dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Event(pub u64);

/// Element type of a device buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
    /// `f32` cell values
    State,
    /// `u32` property bitmasks or packed neighbour masks
    Properties,
}

/// Arguments for one kernel dispatch over a `width × height` index space
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KernelLaunch {
    /// Which neighbour test the kernel performs
    pub variant: StencilVariant,
    /// Retention and spread weights
    pub weights: StencilWeights,
    /// Grid width in cells
    pub width: u32,
    /// Grid height in cells
    pub height: u32,
    /// Pre-step state, read only
    pub state: BufferId,
    /// Property or packed mask buffer, read only
    pub properties: BufferId,
    /// Post-step state, written for every cell
    pub dest: BufferId,
}

impl KernelLaunch {
    /// Number of work items in the launch
    #[must_use]
    pub fn cell_count(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

/// Device API consumed by the step orchestrator
///
/// Implementations must execute operations in an order consistent with the
/// declared dependencies: a dispatch never observes a buffer before the upload
/// or dispatch it depends on has completed.
pub trait ComputeBackend {
    /// Human-readable backend name for logs
    fn name(&self) -> &str;

    /// Check if this is the GPU backend
    ///
    /// # Returns
    ///
    /// `true` if GPU-accelerated, `false` if CPU-only
    fn is_gpu_accelerated(&self) -> bool;

    /// Allocate a device buffer holding `len` elements of `kind`
    ///
    /// # Errors
    ///
    /// Returns [`HeatError::Transfer`] if the device cannot provide the memory.
    fn allocate(&mut self, kind: BufferKind, len: usize) -> Result<BufferId, HeatError>;

    /// Copy host cell values into a state buffer
    ///
    /// # Errors
    ///
    /// Returns [`HeatError::Transfer`] on unknown buffers or length/kind mismatch.
    fn upload_state(&mut self, buffer: BufferId, data: &[f32]) -> Result<Event, HeatError>;

    /// Copy host property bits into a properties buffer
    ///
    /// # Errors
    ///
    /// Returns [`HeatError::Transfer`] on unknown buffers or length/kind mismatch.
    fn upload_properties(&mut self, buffer: BufferId, data: &[u32]) -> Result<Event, HeatError>;

    /// Run the stencil kernel once per cell after `depends_on` completes
    ///
    /// # Errors
    ///
    /// Returns [`HeatError::Dispatch`] if the launch is malformed (unknown or
    /// aliasing buffers, wrong sizes) or the device reports a failure.
    fn dispatch(&mut self, launch: &KernelLaunch, depends_on: &[Event])
        -> Result<Event, HeatError>;

    /// Copy a state buffer back to the host once `depends_on` completes
    ///
    /// Blocks until the data is available in `out`.
    ///
    /// # Errors
    ///
    /// Returns [`HeatError::Transfer`] on unknown buffers, length mismatch or a
    /// failed read-back.
    fn download_state(
        &mut self,
        buffer: BufferId,
        depends_on: &[Event],
        out: &mut [f32],
    ) -> Result<(), HeatError>;

    /// Block until `event` has completed
    ///
    /// # Errors
    ///
    /// Returns [`HeatError::Dispatch`] if the event is unknown or the device
    /// was lost while waiting.
    fn wait(&mut self, event: Event) -> Result<(), HeatError>;

    /// Free a buffer handed out by [`ComputeBackend::allocate`]
    ///
    /// The handle is dead afterwards and its slot may be reused by a later
    /// allocation.
    ///
    /// # Errors
    ///
    /// Returns [`HeatError::Transfer`] if the buffer is unknown or was already
    /// released.
    fn release(&mut self, buffer: BufferId) -> Result<(), HeatError>;
}

impl<B: ComputeBackend + ?Sized> ComputeBackend for Box<B> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn is_gpu_accelerated(&self) -> bool {
        (**self).is_gpu_accelerated()
    }

    fn allocate(&mut self, kind: BufferKind, len: usize) -> Result<BufferId, HeatError> {
        (**self).allocate(kind, len)
    }

    fn upload_state(&mut self, buffer: BufferId, data: &[f32]) -> Result<Event, HeatError> {
        (**self).upload_state(buffer, data)
    }

    fn upload_properties(&mut self, buffer: BufferId, data: &[u32]) -> Result<Event, HeatError> {
        (**self).upload_properties(buffer, data)
    }

    fn dispatch(
        &mut self,
        launch: &KernelLaunch,
        depends_on: &[Event],
    ) -> Result<Event, HeatError> {
        (**self).dispatch(launch, depends_on)
    }

    fn download_state(
        &mut self,
        buffer: BufferId,
        depends_on: &[Event],
        out: &mut [f32],
    ) -> Result<(), HeatError> {
        (**self).download_state(buffer, depends_on, out)
    }

    fn wait(&mut self, event: Event) -> Result<(), HeatError> {
        (**self).wait(event)
    }

    fn release(&mut self, buffer: BufferId) -> Result<(), HeatError> {
        (**self).release(buffer)
    }
}
