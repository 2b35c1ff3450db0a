//! Transfer, dispatch and failure behaviour of the step orchestrator
//!
//! A recording backend wraps the CPU backend and logs every call so the
//! dependency chain and transfer counts of each strategy can be checked.

use heat_sim_core::solver::{BufferId, BufferKind, Event, KernelLaunch, RunPhase};
use heat_sim_core::{
    pack_neighbor_mask, CellFlags, ComputeBackend, CpuBackend, DispatchStrategy, HeatError,
    HeatWorld, StencilVariant, StepOrchestrator,
};

#[ctor::ctor]
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Clone, PartialEq)]
enum Op {
    UploadState {
        buffer: BufferId,
        event: Event,
    },
    UploadProperties {
        buffer: BufferId,
        data: Vec<u32>,
        event: Event,
    },
    Dispatch {
        launch: KernelLaunch,
        depends_on: Vec<Event>,
        event: Event,
    },
    Download {
        buffer: BufferId,
        depends_on: Vec<Event>,
    },
    Wait {
        event: Event,
    },
    Release {
        buffer: BufferId,
    },
}

/// CPU backend that logs every operation and can fail on demand
#[derive(Default)]
struct RecordingBackend {
    inner: CpuBackend,
    ops: Vec<Op>,
    fail_dispatch: Option<usize>,
    fail_download: bool,
}

impl RecordingBackend {
    fn failing_dispatch(index: usize) -> Self {
        Self {
            fail_dispatch: Some(index),
            ..Self::default()
        }
    }

    fn dispatches(&self) -> Vec<(KernelLaunch, Vec<Event>, Event)> {
        self.ops
            .iter()
            .filter_map(|op| match op {
                Op::Dispatch {
                    launch,
                    depends_on,
                    event,
                } => Some((*launch, depends_on.clone(), *event)),
                _ => None,
            })
            .collect()
    }

    fn count(&self, pred: impl Fn(&Op) -> bool) -> usize {
        self.ops.iter().filter(|op| pred(op)).count()
    }

    /// Operations issued before the run started releasing its buffers
    fn stepping_ops(&self) -> &[Op] {
        let end = self
            .ops
            .iter()
            .position(|op| matches!(op, Op::Wait { .. } | Op::Release { .. }))
            .unwrap_or(self.ops.len());
        &self.ops[..end]
    }
}

impl ComputeBackend for RecordingBackend {
    fn name(&self) -> &str {
        "recording"
    }

    fn is_gpu_accelerated(&self) -> bool {
        false
    }

    fn allocate(&mut self, kind: BufferKind, len: usize) -> Result<BufferId, HeatError> {
        self.inner.allocate(kind, len)
    }

    fn upload_state(&mut self, buffer: BufferId, data: &[f32]) -> Result<Event, HeatError> {
        let event = self.inner.upload_state(buffer, data)?;
        self.ops.push(Op::UploadState { buffer, event });
        Ok(event)
    }

    fn upload_properties(&mut self, buffer: BufferId, data: &[u32]) -> Result<Event, HeatError> {
        let event = self.inner.upload_properties(buffer, data)?;
        self.ops.push(Op::UploadProperties {
            buffer,
            data: data.to_vec(),
            event,
        });
        Ok(event)
    }

    fn dispatch(
        &mut self,
        launch: &KernelLaunch,
        depends_on: &[Event],
    ) -> Result<Event, HeatError> {
        let issued = self
            .ops
            .iter()
            .filter(|op| matches!(op, Op::Dispatch { .. }))
            .count();
        if self.fail_dispatch == Some(issued) {
            return Err(HeatError::Dispatch("injected failure".to_string()));
        }
        let event = self.inner.dispatch(launch, depends_on)?;
        self.ops.push(Op::Dispatch {
            launch: *launch,
            depends_on: depends_on.to_vec(),
            event,
        });
        Ok(event)
    }

    fn download_state(
        &mut self,
        buffer: BufferId,
        depends_on: &[Event],
        out: &mut [f32],
    ) -> Result<(), HeatError> {
        if self.fail_download {
            return Err(HeatError::Transfer("injected failure".to_string()));
        }
        self.inner.download_state(buffer, depends_on, out)?;
        self.ops.push(Op::Download {
            buffer,
            depends_on: depends_on.to_vec(),
        });
        Ok(())
    }

    fn wait(&mut self, event: Event) -> Result<(), HeatError> {
        self.inner.wait(event)?;
        self.ops.push(Op::Wait { event });
        Ok(())
    }

    fn release(&mut self, buffer: BufferId) -> Result<(), HeatError> {
        self.inner.release(buffer)?;
        self.ops.push(Op::Release { buffer });
        Ok(())
    }
}

fn test_world() -> HeatWorld {
    let mut world = HeatWorld::bordered(6, 5, 0.4);
    world.set(2, 2, 1.0);
    world.set(3, 1, 0.5);
    world.set_properties(3, 3, CellFlags::INSULATOR);
    world
}

#[test]
fn read_back_transfers_every_step() {
    let mut backend = RecordingBackend::default();
    let mut world = test_world();
    let report = StepOrchestrator::new(&mut backend)
        .with_strategy(DispatchStrategy::ReadBackEveryStep)
        .run(&mut world, 0.2, 4)
        .unwrap();

    assert_eq!(report.state_uploads, 4);
    assert_eq!(report.downloads, 4);
    assert_eq!(
        backend.count(|op| matches!(op, Op::UploadState { .. })),
        4
    );
    assert_eq!(backend.count(|op| matches!(op, Op::Download { .. })), 4);
    assert_eq!(
        backend.count(|op| matches!(op, Op::UploadProperties { .. })),
        1
    );

    // Every dispatch waits on the upload right before it, every download on
    // the dispatch right before it
    for pair in backend.ops.windows(2) {
        match pair {
            [Op::UploadState { event, .. }, Op::Dispatch { depends_on, .. }] => {
                assert!(depends_on.contains(event));
            }
            [Op::Dispatch { event, launch, .. }, Op::Download { depends_on, buffer }] => {
                assert_eq!(depends_on, &vec![*event]);
                assert_eq!(*buffer, launch.dest);
            }
            _ => {}
        }
    }
}

#[test]
fn resident_transfers_once() {
    let mut backend = RecordingBackend::default();
    let mut world = test_world();
    let report = StepOrchestrator::new(&mut backend)
        .with_strategy(DispatchStrategy::ResidentPingPong)
        .run(&mut world, 0.2, 5)
        .unwrap();

    assert_eq!(report.uploads(), 2);
    assert_eq!(report.downloads, 1);
    assert_eq!(report.dispatches, 5);
    assert_eq!(backend.count(|op| matches!(op, Op::Download { .. })), 1);

    let dispatches = backend.dispatches();
    assert_eq!(dispatches.len(), 5);

    // First dispatch waits on both uploads
    let uploads: Vec<Event> = backend
        .ops
        .iter()
        .filter_map(|op| match op {
            Op::UploadState { event, .. } | Op::UploadProperties { event, .. } => Some(*event),
            _ => None,
        })
        .collect();
    for event in &uploads {
        assert!(dispatches[0].1.contains(event));
    }

    // Later dispatches chain on the previous one and swap buffer roles
    for pair in dispatches.windows(2) {
        let (prev_launch, _, prev_event) = &pair[0];
        let (launch, depends_on, _) = &pair[1];
        assert_eq!(depends_on, &vec![*prev_event]);
        assert_eq!(launch.state, prev_launch.dest);
        assert_eq!(launch.dest, prev_launch.state);
        assert_ne!(launch.state, launch.dest);
    }

    // The final download reads what the last dispatch wrote
    let (last_launch, _, last_event) = dispatches.last().unwrap();
    match backend.stepping_ops().last().unwrap() {
        Op::Download { buffer, depends_on } => {
            assert_eq!(buffer, &last_launch.dest);
            assert_eq!(depends_on, &vec![*last_event]);
        }
        other => panic!("expected final download, got {other:?}"),
    }
}

#[test]
fn variant_selects_uploaded_properties() {
    let world = test_world();

    let mut backend = RecordingBackend::default();
    StepOrchestrator::new(&mut backend)
        .with_variant(StencilVariant::Naive)
        .run(&mut world.clone(), 0.1, 1)
        .unwrap();
    let naive_upload = backend.ops.iter().find_map(|op| match op {
        Op::UploadProperties { data, .. } => Some(data.clone()),
        _ => None,
    });
    assert_eq!(naive_upload.as_ref(), Some(&world.properties));

    let mut backend = RecordingBackend::default();
    StepOrchestrator::new(&mut backend)
        .with_variant(StencilVariant::Packed)
        .run(&mut world.clone(), 0.1, 1)
        .unwrap();
    let packed_upload = backend.ops.iter().find_map(|op| match op {
        Op::UploadProperties { data, .. } => Some(data.clone()),
        _ => None,
    });
    assert_eq!(
        packed_upload,
        Some(pack_neighbor_mask(world.width, world.height, &world.properties))
    );
}

#[test]
fn resident_failure_keeps_pre_run_world() {
    let mut backend = RecordingBackend::failing_dispatch(3);
    let mut world = test_world();
    world.t = 1.5;
    let before = world.clone();

    let mut orchestrator =
        StepOrchestrator::new(&mut backend).with_strategy(DispatchStrategy::ResidentPingPong);
    let err = orchestrator.run(&mut world, 0.2, 6).unwrap_err();

    assert!(matches!(err, HeatError::Dispatch(_)));
    assert_eq!(
        orchestrator.phase(),
        RunPhase::Stepping {
            completed: 3,
            total: 6
        }
    );
    assert_eq!(world, before);

    // The host blocks on the last accepted dispatch before freeing anything
    let (_, _, last_event) = *backend.dispatches().last().unwrap();
    let cleanup = &backend.ops[backend.stepping_ops().len()..];
    assert_eq!(cleanup[0], Op::Wait { event: last_event });
    assert_eq!(
        cleanup
            .iter()
            .filter(|op| matches!(op, Op::Release { .. }))
            .count(),
        3
    );
    assert_eq!(backend.inner.buffer_count(), 0);
}

#[test]
fn read_back_failure_keeps_last_completed_step() {
    let mut expected = test_world();
    let mut cpu = CpuBackend::new();
    StepOrchestrator::new(&mut cpu)
        .with_strategy(DispatchStrategy::ReadBackEveryStep)
        .run(&mut expected, 0.2, 2)
        .unwrap();

    let mut backend = RecordingBackend::failing_dispatch(2);
    let mut world = test_world();
    let err = StepOrchestrator::new(&mut backend)
        .with_strategy(DispatchStrategy::ReadBackEveryStep)
        .run(&mut world, 0.2, 5)
        .unwrap_err();

    assert!(matches!(err, HeatError::Dispatch(_)));
    assert_eq!(world.state, expected.state);
    assert_eq!(world.t, expected.t);
}

#[test]
fn resident_download_failure_surfaces() {
    let mut backend = RecordingBackend {
        fail_download: true,
        ..RecordingBackend::default()
    };
    let mut world = test_world();
    let before = world.clone();
    let err = StepOrchestrator::new(&mut backend)
        .run(&mut world, 0.2, 3)
        .unwrap_err();
    assert!(matches!(err, HeatError::Transfer(_)));
    assert_eq!(world, before);
    assert_eq!(backend.inner.buffer_count(), 0);
}

#[test]
fn reused_backend_does_not_accumulate_buffers() {
    let mut backend = RecordingBackend::default();
    let mut world = test_world();
    for _ in 0..5 {
        StepOrchestrator::new(&mut backend)
            .run(&mut world, 0.1, 2)
            .unwrap();
        assert_eq!(backend.inner.buffer_count(), 0);
    }
    assert_eq!(backend.count(|op| matches!(op, Op::Release { .. })), 15);

    // Freed slots are handed out again, so ids stay within the first run's three
    let ids: std::collections::BTreeSet<BufferId> = backend
        .ops
        .iter()
        .filter_map(|op| match op {
            Op::Release { buffer } => Some(*buffer),
            _ => None,
        })
        .collect();
    assert_eq!(ids.len(), 3);
}

#[test]
fn boxed_backend_drives_the_same_run() {
    let mut boxed: Box<dyn ComputeBackend> = Box::new(CpuBackend::new());
    let mut direct = CpuBackend::new();
    let mut a = test_world();
    let mut b = test_world();

    StepOrchestrator::new(&mut boxed).run(&mut a, 0.3, 7).unwrap();
    StepOrchestrator::new(&mut direct).run(&mut b, 0.3, 7).unwrap();
    assert_eq!(a, b);
}
