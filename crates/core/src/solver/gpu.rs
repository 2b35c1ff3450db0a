//! GPU compute backend
//!
//! This module provides a GPU implementation of the `ComputeBackend` trait using
//! wgpu compute shaders and storage buffers. This backend is only available when
//! the `gpu` feature is enabled.
//!
//! # Shader Files
//!
//! The stencil lives in `shaders/heat_step.wgsl` with one entry point per
//! variant (`step_naive`, `step_packed`). It is embedded at build time and can
//! be replaced at run time by pointing `kernel_dir` at a directory holding a
//! file of the same name.
//!
//! # Ordering
//!
//! Every transfer and dispatch is its own queue submission and the wgpu queue
//! executes submissions in order, so a dependency on an earlier [`Event`] is
//! always satisfied. Host-side waits drain the queue.

use super::context::{GpuContext, WORKGROUP_SIZE};
use super::kernel::StencilVariant;
use super::r#trait::{BufferId, BufferKind, ComputeBackend, Event, KernelLaunch};
use crate::error::HeatError;
use bytemuck::{Pod, Zeroable};
use std::borrow::Cow;
use std::path::Path;
use tracing::{debug, trace};
use wgpu::util::DeviceExt;

/// File name of the stencil source, embedded or inside a kernel directory
pub const KERNEL_FILE_NAME: &str = "heat_step.wgsl";

const EMBEDDED_KERNEL: &str = include_str!("shaders/heat_step.wgsl");

/// Load the stencil source, from `dir` when given, else the embedded copy
///
/// # Errors
///
/// Returns [`HeatError::Configuration`] if `dir/heat_step.wgsl` cannot be read.
pub fn load_kernel_source(dir: Option<&Path>) -> Result<Cow<'static, str>, HeatError> {
    let Some(dir) = dir else {
        return Ok(Cow::Borrowed(EMBEDDED_KERNEL));
    };
    let path = dir.join(KERNEL_FILE_NAME);
    debug!("Loading kernel source from {}", path.display());
    std::fs::read_to_string(&path).map(Cow::Owned).map_err(|e| {
        HeatError::Configuration(format!(
            "couldn't load kernel source from {}: {e}",
            path.display()
        ))
    })
}

/// Stencil shader parameters (must match WGSL struct layout)
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
struct StepParams {
    inner: f32,
    outer: f32,
    width: u32,
    height: u32,
}

#[derive(Debug)]
struct GpuBuffer {
    kind: BufferKind,
    len: usize,
    buffer: wgpu::Buffer,
}

/// GPU compute backend using wgpu compute shaders
///
/// Owns the device, both stencil pipelines and every storage buffer handed out
/// through [`ComputeBackend::allocate`]. A single staging buffer is grown on
/// demand for read-back.
#[derive(Debug)]
pub struct GpuBackend {
    context: GpuContext,
    label: String,

    naive_pipeline: wgpu::ComputePipeline,
    packed_pipeline: wgpu::ComputePipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    params_buffer: wgpu::Buffer,

    buffers: Vec<Option<GpuBuffer>>,
    staging: Option<wgpu::Buffer>,
    issued_events: u64,
}

impl GpuBackend {
    /// Build both stencil pipelines from `kernel_source`
    ///
    /// # Errors
    ///
    /// Returns [`HeatError::Compilation`] with the shader compiler's
    /// diagnostics if the source does not build.
    pub fn new(context: GpuContext, kernel_source: &str) -> Result<Self, HeatError> {
        let device = context.device();
        let label = format!("gpu ({})", context.adapter_name());

        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Heat Step Shader"),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(kernel_source)),
        });

        let info = pollster::block_on(shader.get_compilation_info());
        let diagnostics: Vec<String> = info
            .messages
            .iter()
            .filter(|m| matches!(m.message_type, wgpu::CompilationMessageType::Error))
            .map(|m| match &m.location {
                Some(loc) => format!("{}:{}: {}", loc.line_number, loc.line_position, m.message),
                None => m.message.clone(),
            })
            .collect();
        if !diagnostics.is_empty() {
            // Drain the scope so it does not leak into later operations
            let _ = pollster::block_on(device.pop_error_scope());
            return Err(HeatError::Compilation(diagnostics.join("\n")));
        }

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Heat Step Bind Group Layout"),
            entries: &[
                // params (binding 0)
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                // world_state (binding 1)
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: true },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                // world_properties (binding 2)
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: true },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                // next_state (binding 3)
                wgpu::BindGroupLayoutEntry {
                    binding: 3,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: false },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Heat Step Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let create_pipeline = |entry_point: &str| {
            device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(entry_point),
                layout: Some(&pipeline_layout),
                module: &shader,
                entry_point: Some(entry_point),
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                cache: None,
            })
        };
        let naive_pipeline = create_pipeline("step_naive");
        let packed_pipeline = create_pipeline("step_packed");

        if let Some(err) = pollster::block_on(device.pop_error_scope()) {
            return Err(HeatError::Compilation(err.to_string()));
        }

        let params_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Heat Step Params"),
            contents: bytemuck::bytes_of(&StepParams::zeroed()),
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        });

        debug!("Built heat step pipelines on {}", context.adapter_name());

        Ok(Self {
            context,
            label,
            naive_pipeline,
            packed_pipeline,
            bind_group_layout,
            params_buffer,
            buffers: Vec::new(),
            staging: None,
            issued_events: 0,
        })
    }

    /// Build the backend from the embedded or directory-provided kernel
    ///
    /// # Errors
    ///
    /// Returns [`HeatError::Configuration`] if the kernel directory cannot be
    /// read, or [`HeatError::Compilation`] if the source does not build.
    pub fn with_kernel_dir(context: GpuContext, dir: Option<&Path>) -> Result<Self, HeatError> {
        let source = load_kernel_source(dir)?;
        Self::new(context, &source)
    }

    /// Adapter this backend runs on
    #[must_use]
    pub fn adapter_name(&self) -> &str {
        self.context.adapter_name()
    }

    /// Number of live device buffers, allocated and not yet released
    #[must_use]
    pub fn buffer_count(&self) -> usize {
        self.buffers.iter().flatten().count()
    }

    fn next_event(&mut self) -> Event {
        let event = Event(self.issued_events);
        self.issued_events += 1;
        event
    }

    fn check_events(&self, events: &[Event]) -> Result<(), String> {
        match events.iter().find(|e| e.0 >= self.issued_events) {
            Some(unknown) => Err(format!("dependency on unknown event {}", unknown.0)),
            None => Ok(()),
        }
    }

    fn buffer(&self, id: BufferId, kind: BufferKind, len: usize) -> Option<&GpuBuffer> {
        self.buffers
            .get(id.0 as usize)
            .and_then(Option::as_ref)
            .filter(|b| b.kind == kind && b.len == len)
    }

    fn upload(
        &mut self,
        id: BufferId,
        kind: BufferKind,
        bytes: &[u8],
        len: usize,
    ) -> Result<Event, HeatError> {
        let target = self.buffer(id, kind, len).ok_or_else(|| {
            HeatError::Transfer(format!(
                "buffer {} is not a {kind:?} buffer of {len} cells",
                id.0
            ))
        })?;

        let device = self.context.device();
        let queue = self.context.queue();
        device.push_error_scope(wgpu::ErrorFilter::Validation);
        queue.write_buffer(&target.buffer, 0, bytes);
        queue.submit(std::iter::empty());
        if let Some(err) = pollster::block_on(device.pop_error_scope()) {
            return Err(HeatError::Transfer(err.to_string()));
        }

        let event = self.next_event();
        trace!("gpu: uploaded {:?} buffer {} as event {}", kind, id.0, event.0);
        Ok(event)
    }

    fn ensure_staging(&mut self, size: u64) {
        if self.staging.as_ref().is_some_and(|b| b.size() >= size) {
            return;
        }
        self.staging = Some(self.context.device().create_buffer(&wgpu::BufferDescriptor {
            label: Some("Heat Step Staging"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        }));
    }
}

impl ComputeBackend for GpuBackend {
    fn name(&self) -> &str {
        &self.label
    }

    fn is_gpu_accelerated(&self) -> bool {
        true
    }

    fn allocate(&mut self, kind: BufferKind, len: usize) -> Result<BufferId, HeatError> {
        // Reuse the first released slot
        let slot = self
            .buffers
            .iter()
            .position(Option::is_none)
            .unwrap_or(self.buffers.len());
        let id = u32::try_from(slot)
            .map_err(|_| HeatError::Transfer("buffer table exhausted".to_string()))?;
        if len == 0 {
            return Err(HeatError::Transfer("cannot allocate an empty buffer".to_string()));
        }
        let size = (len as u64) * 4;
        let limits = self.context.device().limits();
        if size > u64::from(limits.max_storage_buffer_binding_size) || size > limits.max_buffer_size
        {
            return Err(HeatError::Transfer(format!(
                "{size} byte buffer exceeds device binding limit"
            )));
        }

        let device = self.context.device();
        device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(match kind {
                BufferKind::State => "Heat State",
                BufferKind::Properties => "Heat Properties",
            }),
            size,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        if let Some(err) = pollster::block_on(device.pop_error_scope()) {
            return Err(HeatError::Transfer(err.to_string()));
        }

        let entry = Some(GpuBuffer { kind, len, buffer });
        if slot == self.buffers.len() {
            self.buffers.push(entry);
        } else {
            self.buffers[slot] = entry;
        }
        trace!("gpu: allocated {:?} buffer {} ({} cells)", kind, id, len);
        Ok(BufferId(id))
    }

    fn upload_state(&mut self, buffer: BufferId, data: &[f32]) -> Result<Event, HeatError> {
        self.upload(buffer, BufferKind::State, bytemuck::cast_slice(data), data.len())
    }

    fn upload_properties(&mut self, buffer: BufferId, data: &[u32]) -> Result<Event, HeatError> {
        self.upload(
            buffer,
            BufferKind::Properties,
            bytemuck::cast_slice(data),
            data.len(),
        )
    }

    fn dispatch(
        &mut self,
        launch: &KernelLaunch,
        depends_on: &[Event],
    ) -> Result<Event, HeatError> {
        self.check_events(depends_on).map_err(HeatError::Dispatch)?;
        if launch.state == launch.dest {
            return Err(HeatError::Dispatch(format!(
                "state and destination alias buffer {}",
                launch.dest.0
            )));
        }
        let cells = launch.cell_count();
        if cells == 0 {
            return Err(HeatError::Dispatch("empty launch grid".to_string()));
        }
        let lookup = |role: &str, id: BufferId, kind: BufferKind| {
            self.buffer(id, kind, cells).ok_or_else(|| {
                HeatError::Dispatch(format!(
                    "{role} buffer {} is not a buffer of {cells} cells of the right kind",
                    id.0
                ))
            })
        };
        let state = lookup("state", launch.state, BufferKind::State)?;
        let properties = lookup("properties", launch.properties, BufferKind::Properties)?;
        let dest = lookup("destination", launch.dest, BufferKind::State)?;

        let device = self.context.device();
        let queue = self.context.queue();
        let params = StepParams {
            inner: launch.weights.inner,
            outer: launch.weights.outer,
            width: launch.width,
            height: launch.height,
        };

        device.push_error_scope(wgpu::ErrorFilter::Validation);
        // Staged before this submission, so earlier dispatches keep their weights
        queue.write_buffer(&self.params_buffer, 0, bytemuck::bytes_of(&params));

        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Heat Step Bind Group"),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: self.params_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: state.buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: properties.buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: dest.buffer.as_entire_binding(),
                },
            ],
        });

        let pipeline = match launch.variant {
            StencilVariant::Naive => &self.naive_pipeline,
            StencilVariant::Packed => &self.packed_pipeline,
        };

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Heat Step Encoder"),
        });
        {
            let mut compute_pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("Heat Step Pass"),
                timestamp_writes: None,
            });
            compute_pass.set_pipeline(pipeline);
            compute_pass.set_bind_group(0, &bind_group, &[]);
            compute_pass.dispatch_workgroups(
                launch.width.div_ceil(WORKGROUP_SIZE),
                launch.height.div_ceil(WORKGROUP_SIZE),
                1,
            );
        }
        queue.submit(std::iter::once(encoder.finish()));

        if let Some(err) = pollster::block_on(device.pop_error_scope()) {
            return Err(HeatError::Dispatch(err.to_string()));
        }

        let event = self.next_event();
        trace!(
            "gpu: dispatched {} kernel {} -> {} as event {}",
            launch.variant,
            launch.state.0,
            launch.dest.0,
            event.0
        );
        Ok(event)
    }

    fn download_state(
        &mut self,
        buffer: BufferId,
        depends_on: &[Event],
        out: &mut [f32],
    ) -> Result<(), HeatError> {
        self.check_events(depends_on).map_err(HeatError::Transfer)?;
        if self.buffer(buffer, BufferKind::State, out.len()).is_none() {
            return Err(HeatError::Transfer(format!(
                "buffer {} is not a State buffer of {} cells",
                buffer.0,
                out.len()
            )));
        }
        if out.is_empty() {
            return Ok(());
        }
        let size = (out.len() as u64) * 4;
        self.ensure_staging(size);

        let (Some(src), Some(staging)) = (
            self.buffers.get(buffer.0 as usize).and_then(Option::as_ref),
            self.staging.as_ref(),
        ) else {
            return Err(HeatError::Transfer("staging buffer unavailable".to_string()));
        };
        let device = self.context.device();
        let queue = self.context.queue();

        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Heat State Readback Encoder"),
        });
        encoder.copy_buffer_to_buffer(&src.buffer, 0, staging, 0, size);
        let index = queue.submit(std::iter::once(encoder.finish()));

        // Map and read
        let buffer_slice = staging.slice(..size);
        let (tx, rx) = std::sync::mpsc::channel();
        buffer_slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        let _ = device.poll(wgpu::Maintain::WaitForSubmissionIndex(index));

        let mapped = rx
            .recv()
            .map_err(|e| HeatError::Transfer(format!("read-back never completed: {e}")))
            .and_then(|r| r.map_err(|e| HeatError::Transfer(format!("read-back failed: {e}"))));
        if let Some(err) = pollster::block_on(device.pop_error_scope()) {
            return Err(HeatError::Transfer(err.to_string()));
        }
        mapped?;

        {
            let data = buffer_slice.get_mapped_range();
            out.copy_from_slice(bytemuck::cast_slice(&data));
        }
        staging.unmap();
        trace!("gpu: downloaded state buffer {}", buffer.0);
        Ok(())
    }

    fn wait(&mut self, event: Event) -> Result<(), HeatError> {
        self.check_events(&[event]).map_err(HeatError::Dispatch)?;
        // Submissions complete in order, so draining the queue covers `event`
        let _ = self.context.device().poll(wgpu::Maintain::Wait);
        Ok(())
    }

    fn release(&mut self, buffer: BufferId) -> Result<(), HeatError> {
        match self.buffers.get_mut(buffer.0 as usize).and_then(Option::take) {
            Some(released) => {
                // Dropping defers the free until queued work using it finishes
                trace!("gpu: released {:?} buffer {}", released.kind, buffer.0);
                Ok(())
            }
            None => Err(HeatError::Transfer(format!(
                "cannot release unknown buffer {}",
                buffer.0
            ))),
        }
    }
}
