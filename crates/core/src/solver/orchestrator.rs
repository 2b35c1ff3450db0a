//! Step orchestration
//!
//! Drives `n` stencil steps over a [`ComputeBackend`], owning the two state
//! buffers and the dependency chain between transfers and dispatches.
//!
//! # Strategies
//!
//! - [`DispatchStrategy::ReadBackEveryStep`]: every step uploads the host
//!   state, dispatches, and downloads the result before swapping host arrays.
//!   `world.state` and `world.t` advance after every step.
//! - [`DispatchStrategy::ResidentPingPong`]: properties and state are uploaded
//!   once, each dispatch depends on the previous one and the two device buffers
//!   trade roles by index. One download at the end commits `state` and `t`
//!   together.

use super::kernel::{StencilVariant, StencilWeights};
use super::packing::pack_neighbor_mask;
use super::profiler::ProfilerScope;
use super::r#trait::{BufferId, BufferKind, ComputeBackend, Event, KernelLaunch};
use crate::error::HeatError;
use crate::world::HeatWorld;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// How state moves between host and backend across steps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DispatchStrategy {
    /// Upload, dispatch and download on every step
    ReadBackEveryStep,
    /// Keep state on the backend and ping-pong two buffers
    #[default]
    ResidentPingPong,
}

impl DispatchStrategy {
    /// Stable lowercase name, matches the CLI spelling
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ReadBackEveryStep => "read-back",
            Self::ResidentPingPong => "resident",
        }
    }
}

impl std::fmt::Display for DispatchStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DispatchStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read-back" | "read-back-every-step" => Ok(Self::ReadBackEveryStep),
            "resident" | "resident-ping-pong" => Ok(Self::ResidentPingPong),
            other => Err(format!(
                "unknown dispatch strategy '{other}' (resident|read-back)"
            )),
        }
    }
}

/// Progress of an orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunPhase {
    /// No run started
    #[default]
    Idle,
    /// A run is in progress, or stopped here on failure
    Stepping {
        /// Steps dispatched so far
        completed: u32,
        /// Steps requested
        total: u32,
    },
    /// The last run finished and its results were committed
    Done,
}

/// Summary of one [`StepOrchestrator::run`]
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StepReport {
    /// Name of the backend that ran the steps
    pub backend: String,
    /// Strategy used
    pub strategy: DispatchStrategy,
    /// Stencil variant used
    pub variant: StencilVariant,
    /// Steps completed
    pub steps: u32,
    /// Property buffer uploads
    pub property_uploads: u32,
    /// State buffer uploads
    pub state_uploads: u32,
    /// State buffer downloads
    pub downloads: u32,
    /// Kernel dispatches
    pub dispatches: u32,
    /// Wall-clock time of the run
    pub elapsed: Duration,
}

impl StepReport {
    /// Total host-to-backend transfers
    #[must_use]
    pub fn uploads(&self) -> u32 {
        self.property_uploads + self.state_uploads
    }
}

/// Device buffers for one run
struct RunBuffers {
    properties: BufferId,
    state: [BufferId; 2],
    /// Upload of the property layout, the first dispatch depends on it
    properties_ready: Event,
}

impl RunBuffers {
    fn ids(&self) -> [BufferId; 3] {
        [self.properties, self.state[0], self.state[1]]
    }
}

/// Drives stepping runs on a borrowed backend
///
/// Every run allocates its three buffers on the backend and releases them
/// before returning, on success and on failure, so one backend can serve any
/// number of runs.
pub struct StepOrchestrator<'b, B: ComputeBackend + ?Sized> {
    backend: &'b mut B,
    strategy: DispatchStrategy,
    variant: StencilVariant,
    phase: RunPhase,
    /// Most recent operation the host has not yet blocked on
    in_flight: Option<Event>,
}

impl<'b, B: ComputeBackend + ?Sized> StepOrchestrator<'b, B> {
    /// Orchestrator with the default strategy and variant
    pub fn new(backend: &'b mut B) -> Self {
        Self {
            backend,
            strategy: DispatchStrategy::default(),
            variant: StencilVariant::default(),
            phase: RunPhase::Idle,
            in_flight: None,
        }
    }

    /// Select the dispatch strategy
    #[must_use]
    pub fn with_strategy(mut self, strategy: DispatchStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Select the stencil variant
    #[must_use]
    pub fn with_variant(mut self, variant: StencilVariant) -> Self {
        self.variant = variant;
        self
    }

    /// Current phase
    #[must_use]
    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    /// Advance `world` by `n` steps of `dt`
    ///
    /// Validates `dt` and the world before touching the backend. `n == 0`
    /// performs no backend operations and leaves the world unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`HeatError::InputValidity`] for a malformed world or a
    /// non-finite `dt`, and any backend error raised during the run. On a
    /// backend error the world keeps its pre-run state in resident mode and
    /// the last completed step in read-back mode. The run's buffers are
    /// released either way.
    pub fn run(
        &mut self,
        world: &mut HeatWorld,
        dt: f32,
        n: u32,
    ) -> Result<StepReport, HeatError> {
        if !dt.is_finite() {
            return Err(HeatError::InputValidity(format!(
                "timestep must be finite, got {dt}"
            )));
        }
        world.validate()?;

        let scope = ProfilerScope::new("step run");
        let mut report = StepReport {
            backend: self.backend.name().to_string(),
            strategy: self.strategy,
            variant: self.variant,
            ..StepReport::default()
        };

        self.phase = RunPhase::Stepping {
            completed: 0,
            total: n,
        };
        if n > 0 {
            debug!(
                "Stepping {}x{} world: dt={}, n={}, {} / {} on {}",
                world.width,
                world.height,
                dt,
                n,
                self.strategy,
                self.variant,
                report.backend
            );
            let weights = StencilWeights::new(world.alpha, dt);
            let buffers = self.prepare(world, &mut report)?;
            let stepped = match self.strategy {
                DispatchStrategy::ReadBackEveryStep => {
                    self.run_read_back(world, &buffers, weights, dt, n, &mut report)
                }
                DispatchStrategy::ResidentPingPong => {
                    self.run_resident(world, &buffers, weights, dt, n, &mut report)
                }
            };
            if let Err(e) = stepped {
                self.abandon(&buffers.ids());
                return Err(e);
            }
            self.release_buffers(&buffers.ids())?;
        }
        self.phase = RunPhase::Done;

        report.elapsed = scope.elapsed();
        info!(
            "Ran {} step(s) on {}: {} upload(s), {} download(s) in {:.3} ms",
            report.steps,
            report.backend,
            report.uploads(),
            report.downloads,
            report.elapsed.as_secs_f64() * 1000.0
        );
        Ok(report)
    }

    /// Allocate the three run buffers and upload the property layout
    ///
    /// Anything allocated before a failure is released again.
    fn prepare(
        &mut self,
        world: &HeatWorld,
        report: &mut StepReport,
    ) -> Result<RunBuffers, HeatError> {
        let cells = world.cell_count();
        let mut allocated = Vec::with_capacity(3);
        for kind in [BufferKind::Properties, BufferKind::State, BufferKind::State] {
            match self.backend.allocate(kind, cells) {
                Ok(id) => allocated.push(id),
                Err(e) => {
                    self.abandon(&allocated);
                    return Err(e);
                }
            }
        }
        let properties = allocated[0];
        let state = [allocated[1], allocated[2]];

        let bits: Cow<'_, [u32]> = match self.variant {
            StencilVariant::Naive => Cow::Borrowed(&world.properties),
            StencilVariant::Packed => Cow::Owned(pack_neighbor_mask(
                world.width,
                world.height,
                &world.properties,
            )),
        };
        let properties_ready = match self.backend.upload_properties(properties, &bits) {
            Ok(event) => event,
            Err(e) => {
                self.abandon(&allocated);
                return Err(e);
            }
        };
        self.in_flight = Some(properties_ready);
        report.property_uploads += 1;
        debug!(
            "Allocated properties buffer {} and state buffers {} / {}",
            properties.0, state[0].0, state[1].0
        );

        Ok(RunBuffers {
            properties,
            state,
            properties_ready,
        })
    }

    /// Release run buffers, reporting the first failure
    fn release_buffers(&mut self, ids: &[BufferId]) -> Result<(), HeatError> {
        let mut first_error = None;
        for &id in ids {
            if let Err(e) = self.backend.release(id) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Clean up after a failure; the failure itself is what the caller sees
    ///
    /// Blocks on the last issued operation so nothing still queued reads a
    /// buffer being released.
    fn abandon(&mut self, ids: &[BufferId]) {
        if let Some(event) = self.in_flight.take() {
            if let Err(e) = self.backend.wait(event) {
                warn!("Waiting on event {} after a failed run: {}", event.0, e);
            }
        }
        if let Err(e) = self.release_buffers(ids) {
            warn!("Releasing run buffers after a failed run: {}", e);
        }
    }

    fn launch(
        &self,
        world: &HeatWorld,
        weights: StencilWeights,
        src: BufferId,
        dest: BufferId,
        properties: BufferId,
    ) -> KernelLaunch {
        KernelLaunch {
            variant: self.variant,
            weights,
            width: world.width,
            height: world.height,
            state: src,
            properties,
            dest,
        }
    }

    fn run_read_back(
        &mut self,
        world: &mut HeatWorld,
        buffers: &RunBuffers,
        weights: StencilWeights,
        dt: f32,
        n: u32,
        report: &mut StepReport,
    ) -> Result<(), HeatError> {
        let [input, output] = buffers.state;
        let launch = self.launch(world, weights, input, output, buffers.properties);
        let mut scratch = vec![0.0_f32; world.cell_count()];

        for step in 0..n {
            let uploaded = self.backend.upload_state(input, &world.state)?;
            self.in_flight = Some(uploaded);
            report.state_uploads += 1;

            let executed = self
                .backend
                .dispatch(&launch, &[buffers.properties_ready, uploaded])?;
            self.in_flight = Some(executed);
            report.dispatches += 1;

            self.backend
                .download_state(output, &[executed], &mut scratch)?;
            self.in_flight = None;
            report.downloads += 1;

            std::mem::swap(&mut world.state, &mut scratch);
            world.t += dt;

            report.steps += 1;
            self.phase = RunPhase::Stepping {
                completed: step + 1,
                total: n,
            };
            trace!("read-back step {} complete, t={}", step + 1, world.t);
        }
        Ok(())
    }

    fn run_resident(
        &mut self,
        world: &mut HeatWorld,
        buffers: &RunBuffers,
        weights: StencilWeights,
        dt: f32,
        n: u32,
        report: &mut StepReport,
    ) -> Result<(), HeatError> {
        let mut current = 0_usize;

        let uploaded = self.backend.upload_state(buffers.state[current], &world.state)?;
        self.in_flight = Some(uploaded);
        report.state_uploads += 1;

        let first = [buffers.properties_ready, uploaded];
        let mut last = uploaded;
        let mut t = world.t;
        for step in 0..n {
            let launch = self.launch(
                world,
                weights,
                buffers.state[current],
                buffers.state[1 - current],
                buffers.properties,
            );
            // Each dispatch reads what the previous one wrote
            let previous = [last];
            let depends_on: &[Event] = if step == 0 { &first } else { &previous };
            last = self.backend.dispatch(&launch, depends_on)?;
            self.in_flight = Some(last);
            report.dispatches += 1;

            current = 1 - current;
            t += dt;
            self.phase = RunPhase::Stepping {
                completed: step + 1,
                total: n,
            };
            trace!("resident step {} issued as event {}", step + 1, last.0);
        }

        let mut result = vec![0.0_f32; world.cell_count()];
        self.backend
            .download_state(buffers.state[current], &[last], &mut result)?;
        self.in_flight = None;
        report.downloads += 1;

        world.state = result;
        world.t = t;
        report.steps = n;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::CpuBackend;
    use crate::world::CellFlags;
    use approx::assert_relative_eq;

    fn hot_centre() -> HeatWorld {
        let mut world = HeatWorld::bordered(3, 3, 1.0);
        world.set(1, 1, 1.0);
        world
    }

    #[test]
    fn test_strategy_parses() {
        assert_eq!(
            "read-back".parse::<DispatchStrategy>(),
            Ok(DispatchStrategy::ReadBackEveryStep)
        );
        assert_eq!(
            "resident".parse::<DispatchStrategy>(),
            Ok(DispatchStrategy::ResidentPingPong)
        );
        assert!("eager".parse::<DispatchStrategy>().is_err());
        assert_eq!(DispatchStrategy::default().to_string(), "resident");
    }

    #[test]
    fn test_single_step_example() {
        for strategy in [
            DispatchStrategy::ReadBackEveryStep,
            DispatchStrategy::ResidentPingPong,
        ] {
            let mut cpu = CpuBackend::new();
            let mut world = hot_centre();
            let mut orchestrator = StepOrchestrator::new(&mut cpu).with_strategy(strategy);
            let report = orchestrator.run(&mut world, 0.25, 1).unwrap();

            assert_eq!(report.steps, 1);
            assert_eq!(orchestrator.phase(), RunPhase::Done);
            assert_relative_eq!(world.get(1, 1), 0.9375 / 1.9375, epsilon = 1e-6);
            assert_eq!(world.get(0, 0), 0.0);
            assert_eq!(world.t, 0.25);
        }
    }

    #[test]
    fn test_zero_steps_is_a_no_op() {
        let mut cpu = CpuBackend::new();
        let mut world = hot_centre();
        let before = world.clone();
        let report = StepOrchestrator::new(&mut cpu)
            .run(&mut world, 0.1, 0)
            .unwrap();
        assert_eq!(world, before);
        assert_eq!(report.uploads(), 0);
        assert_eq!(report.downloads, 0);
        assert_eq!(cpu.buffer_count(), 0);
    }

    #[test]
    fn test_transfer_counts() {
        let mut cpu = CpuBackend::new();
        let mut world = hot_centre();
        let report = StepOrchestrator::new(&mut cpu)
            .with_strategy(DispatchStrategy::ReadBackEveryStep)
            .run(&mut world, 0.1, 5)
            .unwrap();
        assert_eq!(report.state_uploads, 5);
        assert_eq!(report.property_uploads, 1);
        assert_eq!(report.downloads, 5);
        assert_eq!(report.dispatches, 5);

        let mut cpu = CpuBackend::new();
        let report = StepOrchestrator::new(&mut cpu)
            .run(&mut world, 0.1, 5)
            .unwrap();
        assert_eq!(report.uploads(), 2);
        assert_eq!(report.downloads, 1);
        assert_eq!(report.dispatches, 5);
    }

    #[test]
    fn test_repeated_runs_release_their_buffers() {
        let mut cpu = CpuBackend::new();
        let mut world = hot_centre();
        for strategy in [
            DispatchStrategy::ResidentPingPong,
            DispatchStrategy::ReadBackEveryStep,
            DispatchStrategy::ResidentPingPong,
        ] {
            StepOrchestrator::new(&mut cpu)
                .with_strategy(strategy)
                .run(&mut world, 0.1, 3)
                .unwrap();
            assert_eq!(cpu.buffer_count(), 0);
        }
        assert_relative_eq!(world.t, 0.9, epsilon = 1e-6);
    }

    #[test]
    fn test_invalid_world_rejected_before_stepping() {
        let mut cpu = CpuBackend::new();
        let mut world = hot_centre();
        world.set_properties(0, 1, 0);
        let err = StepOrchestrator::new(&mut cpu)
            .run(&mut world, 0.1, 3)
            .unwrap_err();
        assert!(matches!(err, HeatError::InputValidity(_)));
        assert_eq!(cpu.buffer_count(), 0);
    }

    #[test]
    fn test_non_finite_dt_rejected() {
        let mut cpu = CpuBackend::new();
        let mut world = hot_centre();
        let mut orchestrator = StepOrchestrator::new(&mut cpu);
        assert!(matches!(
            orchestrator.run(&mut world, f32::NAN, 1),
            Err(HeatError::InputValidity(_))
        ));
        assert_eq!(orchestrator.phase(), RunPhase::Idle);
    }

    #[test]
    fn test_insulator_is_unchanged() {
        let mut world = HeatWorld::bordered(5, 5, 0.5);
        world.set(2, 2, 0.7);
        world.set_properties(2, 2, CellFlags::INSULATOR);
        world.set(1, 1, 1.0);

        let mut cpu = CpuBackend::new();
        StepOrchestrator::new(&mut cpu)
            .with_variant(StencilVariant::Naive)
            .run(&mut world, 0.2, 10)
            .unwrap();
        assert_eq!(world.get(2, 2), 0.7);
    }
}
