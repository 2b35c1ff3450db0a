//! CPU compute backend
//!
//! This module provides a CPU implementation of the `ComputeBackend` trait
//! using `Vec` buffers and Rayon for parallelism. This backend is always
//! available and serves as a fallback when GPU acceleration is not available.
//!
//! Every operation completes before it returns, so events are only checked for
//! having been issued; dependency order is the call order.

use super::kernel::step_grid;
use super::r#trait::{BufferId, BufferKind, ComputeBackend, Event, KernelLaunch};
use crate::error::HeatError;
use tracing::trace;

#[derive(Debug)]
enum CpuBuffer {
    State(Vec<f32>),
    Properties(Vec<u32>),
}

impl CpuBuffer {
    fn kind(&self) -> BufferKind {
        match self {
            Self::State(_) => BufferKind::State,
            Self::Properties(_) => BufferKind::Properties,
        }
    }

    fn len(&self) -> usize {
        match self {
            Self::State(v) => v.len(),
            Self::Properties(v) => v.len(),
        }
    }
}

/// Rayon-backed compute backend
#[derive(Debug, Default)]
pub struct CpuBackend {
    buffers: Vec<Option<CpuBuffer>>,
    issued_events: u64,
}

impl CpuBackend {
    /// Create an empty CPU backend
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live buffers, allocated and not yet released
    #[must_use]
    pub fn buffer_count(&self) -> usize {
        self.buffers.iter().flatten().count()
    }

    fn next_event(&mut self) -> Event {
        let event = Event(self.issued_events);
        self.issued_events += 1;
        event
    }

    fn check_events(&self, events: &[Event]) -> Result<(), HeatError> {
        match events.iter().find(|e| e.0 >= self.issued_events) {
            Some(unknown) => Err(HeatError::Dispatch(format!(
                "dependency on unknown event {}",
                unknown.0
            ))),
            None => Ok(()),
        }
    }

    fn buffer(&self, id: BufferId) -> Option<&CpuBuffer> {
        self.buffers.get(id.0 as usize).and_then(Option::as_ref)
    }

    fn buffer_mut(&mut self, id: BufferId) -> Option<&mut CpuBuffer> {
        self.buffers.get_mut(id.0 as usize).and_then(Option::as_mut)
    }
}

impl ComputeBackend for CpuBackend {
    fn name(&self) -> &str {
        "cpu"
    }

    fn is_gpu_accelerated(&self) -> bool {
        false
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
        let buffer = match kind {
            BufferKind::State => CpuBuffer::State(vec![0.0; len]),
            BufferKind::Properties => CpuBuffer::Properties(vec![0; len]),
        };
        if slot == self.buffers.len() {
            self.buffers.push(Some(buffer));
        } else {
            self.buffers[slot] = Some(buffer);
        }
        trace!("cpu: allocated {:?} buffer {} ({} cells)", kind, id, len);
        Ok(BufferId(id))
    }

    fn upload_state(&mut self, buffer: BufferId, data: &[f32]) -> Result<Event, HeatError> {
        match self.buffer_mut(buffer) {
            Some(CpuBuffer::State(dst)) if dst.len() == data.len() => dst.copy_from_slice(data),
            other => {
                let found = other.map(|b| (b.kind(), b.len()));
                return Err(transfer_mismatch(buffer, BufferKind::State, data.len(), found));
            }
        }
        Ok(self.next_event())
    }

    fn upload_properties(&mut self, buffer: BufferId, data: &[u32]) -> Result<Event, HeatError> {
        match self.buffer_mut(buffer) {
            Some(CpuBuffer::Properties(dst)) if dst.len() == data.len() => {
                dst.copy_from_slice(data);
            }
            other => {
                let found = other.map(|b| (b.kind(), b.len()));
                return Err(transfer_mismatch(
                    buffer,
                    BufferKind::Properties,
                    data.len(),
                    found,
                ));
            }
        }
        Ok(self.next_event())
    }

    fn dispatch(
        &mut self,
        launch: &KernelLaunch,
        depends_on: &[Event],
    ) -> Result<Event, HeatError> {
        self.check_events(depends_on)?;
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
        let width = launch.width as usize;

        let mut dest = match self.buffer_mut(launch.dest) {
            Some(CpuBuffer::State(v)) if v.len() == cells => std::mem::take(v),
            _ => return Err(launch_mismatch("destination", launch.dest, cells)),
        };
        let result = match (self.buffer(launch.state), self.buffer(launch.properties)) {
            (Some(CpuBuffer::State(state)), Some(CpuBuffer::Properties(props)))
                if state.len() == cells && props.len() == cells =>
            {
                step_grid(launch.variant, launch.weights, width, state, props, &mut dest);
                Ok(())
            }
            (Some(CpuBuffer::State(state)), _) if state.len() == cells => {
                Err(launch_mismatch("properties", launch.properties, cells))
            }
            _ => Err(launch_mismatch("state", launch.state, cells)),
        };
        // Always hand the destination back, even when the launch was rejected
        if let Some(CpuBuffer::State(v)) = self.buffer_mut(launch.dest) {
            *v = dest;
        }
        result?;

        let event = self.next_event();
        trace!(
            "cpu: dispatched {} kernel {} -> {} as event {}",
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
        self.check_events(depends_on)
            .map_err(|e| HeatError::Transfer(e.to_string()))?;
        match self.buffer(buffer) {
            Some(CpuBuffer::State(src)) if src.len() == out.len() => {
                out.copy_from_slice(src);
                Ok(())
            }
            other => {
                let found = other.map(|b| (b.kind(), b.len()));
                Err(transfer_mismatch(buffer, BufferKind::State, out.len(), found))
            }
        }
    }

    fn wait(&mut self, event: Event) -> Result<(), HeatError> {
        self.check_events(&[event])
    }

    fn release(&mut self, buffer: BufferId) -> Result<(), HeatError> {
        match self.buffers.get_mut(buffer.0 as usize).and_then(Option::take) {
            Some(released) => {
                trace!("cpu: released {:?} buffer {}", released.kind(), buffer.0);
                Ok(())
            }
            None => Err(HeatError::Transfer(format!(
                "cannot release unknown buffer {}",
                buffer.0
            ))),
        }
    }
}

fn transfer_mismatch(
    id: BufferId,
    expected: BufferKind,
    len: usize,
    found: Option<(BufferKind, usize)>,
) -> HeatError {
    match found {
        None => HeatError::Transfer(format!("unknown buffer {}", id.0)),
        Some((kind, found_len)) => HeatError::Transfer(format!(
            "buffer {} is {kind:?}[{found_len}], transfer expects {expected:?}[{len}]",
            id.0
        )),
    }
}

fn launch_mismatch(role: &str, id: BufferId, cells: usize) -> HeatError {
    HeatError::Dispatch(format!(
        "{role} buffer {} is not a buffer of {cells} cells of the right kind",
        id.0
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::kernel::{StencilVariant, StencilWeights};

    fn launch(state: BufferId, properties: BufferId, dest: BufferId) -> KernelLaunch {
        KernelLaunch {
            variant: StencilVariant::Naive,
            weights: StencilWeights::new(1.0, 0.25),
            width: 3,
            height: 3,
            state,
            properties,
            dest,
        }
    }

    #[test]
    fn test_upload_dispatch_download() {
        let mut cpu = CpuBackend::new();
        let props = cpu.allocate(BufferKind::Properties, 9).unwrap();
        let a = cpu.allocate(BufferKind::State, 9).unwrap();
        let b = cpu.allocate(BufferKind::State, 9).unwrap();

        let mut state = vec![0.0_f32; 9];
        state[4] = 1.0;
        let mut bits = vec![crate::world::CellFlags::FIXED; 9];
        bits[4] = 0;

        let e0 = cpu.upload_properties(props, &bits).unwrap();
        let e1 = cpu.upload_state(a, &state).unwrap();
        let e2 = cpu.dispatch(&launch(a, props, b), &[e0, e1]).unwrap();

        let mut out = vec![0.0; 9];
        cpu.download_state(b, &[e2], &mut out).unwrap();
        assert!((out[4] - 0.9375 / 1.9375).abs() < 1e-6);
        assert_eq!(out[0], 0.0);
        assert_eq!(cpu.buffer_count(), 3);
    }

    #[test]
    fn test_aliasing_launch_rejected() {
        let mut cpu = CpuBackend::new();
        let props = cpu.allocate(BufferKind::Properties, 9).unwrap();
        let a = cpu.allocate(BufferKind::State, 9).unwrap();
        let err = cpu.dispatch(&launch(a, props, a), &[]).unwrap_err();
        assert!(matches!(err, HeatError::Dispatch(_)));
    }

    #[test]
    fn test_kind_mismatch_rejected() {
        let mut cpu = CpuBackend::new();
        let props = cpu.allocate(BufferKind::Properties, 9).unwrap();
        assert!(matches!(
            cpu.upload_state(props, &[0.0; 9]),
            Err(HeatError::Transfer(_))
        ));
        let a = cpu.allocate(BufferKind::State, 9).unwrap();
        assert!(matches!(
            cpu.upload_state(a, &[0.0; 8]),
            Err(HeatError::Transfer(_))
        ));
        // Properties swapped with state in a launch
        let b = cpu.allocate(BufferKind::State, 9).unwrap();
        assert!(matches!(
            cpu.dispatch(&launch(a, b, props), &[]),
            Err(HeatError::Dispatch(_))
        ));
    }

    #[test]
    fn test_rejected_launch_keeps_destination() {
        let mut cpu = CpuBackend::new();
        let a = cpu.allocate(BufferKind::State, 9).unwrap();
        let b = cpu.allocate(BufferKind::State, 9).unwrap();
        cpu.upload_state(b, &[0.5; 9]).unwrap();
        // `a` used as properties
        assert!(cpu.dispatch(&launch(a, a, b), &[]).is_err());

        let mut out = vec![0.0; 9];
        cpu.download_state(b, &[], &mut out).unwrap();
        assert_eq!(out, vec![0.5; 9]);
    }

    #[test]
    fn test_released_slot_is_reused() {
        let mut cpu = CpuBackend::new();
        let a = cpu.allocate(BufferKind::State, 9).unwrap();
        let b = cpu.allocate(BufferKind::State, 9).unwrap();
        cpu.release(a).unwrap();
        assert_eq!(cpu.buffer_count(), 1);

        // Released handles are dead until the slot is handed out again
        assert!(matches!(
            cpu.upload_state(a, &[0.0; 9]),
            Err(HeatError::Transfer(_))
        ));
        assert!(matches!(cpu.release(a), Err(HeatError::Transfer(_))));

        let c = cpu.allocate(BufferKind::Properties, 4).unwrap();
        assert_eq!(c, a);
        assert_ne!(c, b);
        assert_eq!(cpu.buffer_count(), 2);
    }

    #[test]
    fn test_unknown_event_rejected() {
        let mut cpu = CpuBackend::new();
        assert!(matches!(cpu.wait(Event(3)), Err(HeatError::Dispatch(_))));
        assert!(matches!(
            cpu.download_state(BufferId(0), &[Event(0)], &mut []),
            Err(HeatError::Transfer(_))
        ));
    }
}
