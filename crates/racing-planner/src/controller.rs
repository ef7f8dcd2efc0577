//! MPC control loop
//!
//! Main interface of the crate. Called once per control tick with the latest
//! perception output, it:
//! - keeps a world model of gates and obstacles, bridging perception gaps
//! - tracks gate progress and decides whether to replan, at most once every
//!   `replanning_frequency` ticks
//! - selects the cost weights, builds the horizon reference and runs the solver
//! - validates the command and falls back to the previous one when the solve
//!   did not succeed

use std::collections::{BTreeMap, BTreeSet};

use log::{debug, info, warn};
use nalgebra::Vector3;
use thiserror::Error;

use racing_core::dynamics::{position_of, DroneState};
use racing_core::geometry::{GateState, ObstacleState};

use crate::config::{ConfigError, ControllerConfig};
use crate::flight_log::{FlightLogError, FlightRecorder};
use crate::ocp::Command;
use crate::planner::{PlannerPhase, PlanningError, ReplanReason, TrajectoryPlanner};
use crate::solver::{MpcSolver, SolveResult, SolveStatus, SolverBuilder};
use crate::trajectory::Trajectory;
use crate::warm_start::{Horizon, WarmStart, WarmStartError};
use crate::weights::{CostWeights, WeightScheduler};

/// Fatal controller errors
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),
    #[error("Planning failed with no trajectory to hold: {0}")]
    Planning(#[from] PlanningError),
    #[error("Flight log error: {0}")]
    FlightLog(#[from] FlightLogError),
    #[error("Warm start error: {0}")]
    WarmStart(#[from] WarmStartError),
}

/// Health flag sent along with every command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlStatus {
    Nominal,
    /// A fallback is in effect
    Degraded,
}

/// Why the output is degraded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DegradedReason {
    /// The solve did not succeed; the previous command was repeated
    Solver(SolveStatus),
    /// The solver returned a non-finite command
    InvalidCommand,
    /// The drone state was not finite, no solve was attempted
    InvalidState,
    /// Replanning failed, the previous trajectory is kept
    PlanningFailed,
}

/// Perception input for one tick
#[derive(Debug, Clone)]
pub struct Observation {
    pub state: DroneState,
    pub gates: Vec<GateState>,
    pub obstacles: Vec<ObstacleState>,
    /// Next gate to fly through; `None` once the course is complete
    pub target_gate: Option<usize>,
}

/// Per-tick controller output
#[derive(Debug, Clone)]
pub struct ControlOutput {
    pub command: Command,
    pub status: ControlStatus,
    pub reason: Option<DegradedReason>,
    /// Some gate or obstacle was missing and its last known pose was reused
    pub perception_gap: bool,
    /// A new trajectory was installed this tick
    pub replanned: bool,
    pub solve_status: Option<SolveStatus>,
}

/// Commanded and produced thrust/attitude between ticks
#[derive(Debug, Clone, Copy)]
struct ActuationState {
    thrust: f64,
    thrust_cmd: f64,
    rpy_cmd: Vector3<f64>,
}

impl ActuationState {
    fn from_command(command: &Command) -> Self {
        Self {
            thrust: command.thrust,
            thrust_cmd: command.thrust,
            rpy_cmd: command.rpy,
        }
    }

    /// Apply a new command; the produced thrust follows the previous one
    /// through the first-order lag over one tick
    fn apply(&mut self, command: &Command, dt: f64, time_constant: f64) {
        let decay = if time_constant > 0.0 { (-dt / time_constant).exp() } else { 0.0 };
        self.thrust = self.thrust_cmd + (self.thrust - self.thrust_cmd) * decay;
        self.thrust_cmd = command.thrust;
        self.rpy_cmd = command.rpy;
    }
}

/// Last known gate and obstacle geometry
#[derive(Debug, Clone, Default)]
struct WorldModel {
    gates: BTreeMap<usize, GateState>,
    obstacles: BTreeMap<usize, ObstacleState>,
}

impl WorldModel {
    /// Merge an observation; returns whether anything known was missing
    fn update(&mut self, gates: &[GateState], obstacles: &[ObstacleState]) -> bool {
        let known_gates: BTreeSet<usize> = self.gates.keys().copied().collect();
        let known_obstacles: BTreeSet<usize> = self.obstacles.keys().copied().collect();

        let mut seen_gates = BTreeSet::new();
        for gate in gates.iter().filter(|g| g.is_finite()) {
            seen_gates.insert(gate.index);
            self.gates.insert(gate.index, gate.clone());
        }
        let mut seen_obstacles = BTreeSet::new();
        for obstacle in obstacles.iter().filter(|o| o.is_finite()) {
            seen_obstacles.insert(obstacle.index);
            self.obstacles.insert(obstacle.index, obstacle.clone());
        }

        !known_gates.is_subset(&seen_gates) || !known_obstacles.is_subset(&seen_obstacles)
    }

    fn gates(&self) -> Vec<GateState> {
        self.gates.values().cloned().collect()
    }

    fn obstacles(&self) -> Vec<ObstacleState> {
        self.obstacles.values().cloned().collect()
    }

    fn final_gate(&self) -> Option<&GateState> {
        self.gates.values().next_back()
    }

    fn clear(&mut self) {
        self.gates.clear();
        self.obstacles.clear();
    }
}

/// Receding-horizon gate-racing controller
pub struct MpcController {
    config: ControllerConfig,
    planner: TrajectoryPlanner,
    scheduler: WeightScheduler,
    solver: MpcSolver,
    warm_start: WarmStart,
    /// Guess loaded from `solver.warm_start_file`, reused on episode reset
    initial_guess: Option<Horizon>,
    world: WorldModel,
    recorder: FlightRecorder,
    trajectory: Trajectory,
    tick: u64,
    last_replan_tick: u64,
    replan_count: u64,
    replan_pending: Option<ReplanReason>,
    target_gate: Option<usize>,
    gates_passed: usize,
    finished: bool,
    last_command: Command,
    actuation: ActuationState,
    last_result: Option<SolveResult>,
}

impl MpcController {
    /// Create a controller and plan the initial trajectory
    ///
    /// Fails if the configuration is invalid, the warm start file cannot be
    /// read, or no trajectory can be planned from the first observation.
    pub fn new(config: ControllerConfig, initial: &Observation) -> Result<Self, ControllerError> {
        config.validate()?;

        let n = config.horizon.num_steps;
        let (warm_start, initial_guess) = match &config.solver.warm_start_file {
            Some(path) => {
                let warm = WarmStart::from_file(path, n)?;
                let guess = warm.guess().cloned();
                info!("Loaded initial guess from {}", path.display());
                (warm, guess)
            }
            None => (WarmStart::new(n), None),
        };

        let solver = SolverBuilder::from_config(&config).build();
        let default_command = solver.default_command();
        let mut planner = TrajectoryPlanner::new(config.planner.clone(), config.replanning.clone());
        let mut world = WorldModel::default();
        world.update(&initial.gates, &initial.obstacles);
        let trajectory = initial_trajectory(&mut planner, &world, initial)?;

        Ok(Self {
            scheduler: WeightScheduler::from_config(&config.weights, &config.replanning),
            recorder: FlightRecorder::new(config.flight_log.clone()),
            config,
            planner,
            solver,
            warm_start,
            initial_guess,
            world,
            trajectory,
            tick: 0,
            last_replan_tick: 0,
            replan_count: 0,
            replan_pending: None,
            target_gate: initial.target_gate,
            gates_passed: 0,
            finished: initial.target_gate.is_none(),
            last_command: default_command,
            actuation: ActuationState::from_command(&default_command),
            last_result: None,
        })
    }

    /// Run one control tick
    pub fn step(&mut self, observation: &Observation) -> ControlOutput {
        let tick = self.tick;
        self.tick += 1;

        let perception_gap = self.world.update(&observation.gates, &observation.obstacles);
        if perception_gap {
            warn!("Tick {}: perception gap, reusing last known geometry", tick);
        }
        self.update_progress(observation.target_gate);

        let state = &observation.state;
        if !state.is_finite() {
            warn!("Tick {}: non-finite drone state, repeating last command", tick);
            self.warm_start.invalidate();
            return self.fallback_output(None, DegradedReason::InvalidState, perception_gap, false);
        }

        let gates = self.world.gates();
        let obstacles = self.world.obstacles();
        let (replanned, planning_failed) = self.maybe_replan(tick, state, &gates);

        // Solve
        let weights = self.scheduler.next_weights();
        let result = self.solve(tick, state, &weights, &gates, &obstacles);
        let solve_status = Some(result.status);

        let reference = self.trajectory.position_at(self.trajectory_time(tick));
        self.recorder.record(reference, state.position);

        let output = if result.status.is_success() {
            if result.command.is_finite() {
                let bounds = *self.solver.command_bounds();
                let command = if result.command.within(&bounds) {
                    result.command
                } else {
                    debug!("Tick {}: clamping command {:?}", tick, result.command);
                    result.command.clamped(&bounds)
                };
                if let Err(e) = self.warm_start.load(&result.horizon) {
                    warn!("Discarding warm start: {}", e);
                    self.warm_start.invalidate();
                }
                self.emit(command);
                let reason = planning_failed.then_some(DegradedReason::PlanningFailed);
                ControlOutput {
                    command,
                    status: if reason.is_some() { ControlStatus::Degraded } else { ControlStatus::Nominal },
                    reason,
                    perception_gap,
                    replanned,
                    solve_status,
                }
            } else {
                warn!("Tick {}: solver returned a non-finite command", tick);
                self.warm_start.invalidate();
                self.fallback_output(solve_status, DegradedReason::InvalidCommand, perception_gap, replanned)
            }
        } else {
            warn!(
                "Tick {}: solve ended with {:?} after {} iterations, repeating last command",
                tick, result.status, result.statistics.nlp_iterations
            );
            self.warm_start.invalidate();
            self.fallback_output(solve_status, DegradedReason::Solver(result.status), perception_gap, replanned)
        };

        self.last_result = Some(result);
        output
    }

    /// Reset for a new episode and plan from `initial`
    ///
    /// Flushes the flight log of the finished episode.
    pub fn episode_reset(&mut self, initial: &Observation) -> Result<(), ControllerError> {
        self.recorder.flush()?;

        self.tick = 0;
        self.last_replan_tick = 0;
        self.replan_count = 0;
        self.replan_pending = None;
        self.target_gate = initial.target_gate;
        self.gates_passed = 0;
        self.finished = initial.target_gate.is_none();
        self.last_result = None;

        self.scheduler.reset();
        self.planner.reset();
        self.solver.reset();
        self.last_command = self.solver.default_command();
        self.actuation = ActuationState::from_command(&self.last_command);

        self.warm_start.invalidate();
        if let Some(guess) = &self.initial_guess {
            self.warm_start.load(guess)?;
        }

        self.world.clear();
        self.world.update(&initial.gates, &initial.obstacles);
        self.trajectory = initial_trajectory(&mut self.planner, &self.world, initial)?;
        info!("Episode reset");
        Ok(())
    }

    /// Persist the flight log of the current run
    pub fn flush_flight_log(&mut self) -> Result<(), ControllerError> {
        self.recorder.flush()?;
        Ok(())
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Number of ticks run so far
    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn trajectory(&self) -> &Trajectory {
        &self.trajectory
    }

    pub fn phase(&self) -> PlannerPhase {
        self.planner.phase()
    }

    pub fn last_replan_tick(&self) -> u64 {
        self.last_replan_tick
    }

    pub fn replan_count(&self) -> u64 {
        self.replan_count
    }

    pub fn gates_passed(&self) -> usize {
        self.gates_passed
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Course completed with every known gate passed
    pub fn flight_successful(&self) -> bool {
        self.finished && self.gates_passed >= self.world.gates.len()
    }

    pub fn last_command(&self) -> Command {
        self.last_command
    }

    pub fn last_solve(&self) -> Option<&SolveResult> {
        self.last_result.as_ref()
    }

    pub fn solver(&self) -> &MpcSolver {
        &self.solver
    }

    pub fn solver_mut(&mut self) -> &mut MpcSolver {
        &mut self.solver
    }

    /// Positions predicted by the last solve
    pub fn predicted_path(&self) -> Vec<Vector3<f64>> {
        self.last_result
            .as_ref()
            .map(|r| r.horizon.states.iter().map(position_of).collect())
            .unwrap_or_default()
    }

    /// Active trajectory sampled at `samples` evenly spaced times
    pub fn reference_path(&self, samples: usize) -> Vec<Vector3<f64>> {
        let duration = self.trajectory.duration();
        let denom = samples.saturating_sub(1).max(1) as f64;
        (0..samples)
            .map(|i| self.trajectory.position_at(duration * i as f64 / denom))
            .collect()
    }

    /// Seconds since the active trajectory started
    fn trajectory_time(&self, tick: u64) -> f64 {
        tick.saturating_sub(self.trajectory.generated_at_tick) as f64 * self.config.tick_period()
    }

    fn update_progress(&mut self, target: Option<usize>) {
        if target == self.target_gate {
            return;
        }
        match (self.target_gate, target) {
            (Some(previous), Some(next)) if next > previous => self.gates_passed += next - previous,
            (Some(_), None) => {
                self.gates_passed += 1;
                self.finished = true;
            }
            _ => {}
        }
        info!("Target gate {:?} -> {:?} ({} passed)", self.target_gate, target, self.gates_passed);
        self.target_gate = target;
        self.replan_pending = (!self.finished).then_some(ReplanReason::GateAdvanced { gate: target });
    }

    /// Extension and replanning; returns (replanned, planning_failed)
    ///
    /// Both hand-offs are gated by `replanning_frequency`; a due extension
    /// waits for the next allowed tick.
    fn maybe_replan(&mut self, tick: u64, state: &DroneState, gates: &[GateState]) -> (bool, bool) {
        let elapsed = self.trajectory_time(tick);
        let due = tick.saturating_sub(self.last_replan_tick) >= self.config.replanning.replanning_frequency;

        let final_gate = self.world.final_gate();
        if self
            .planner
            .should_extend(&self.trajectory, elapsed, state, self.target_gate, final_gate)
        {
            if !due {
                return (false, false);
            }
            return match self.planner.extend(state, Some(&self.trajectory), tick) {
                Ok(trajectory) => {
                    self.install(trajectory, tick);
                    (true, false)
                }
                Err(e) => {
                    warn!("Tick {}: extension failed, keeping trajectory: {}", tick, e);
                    self.last_replan_tick = tick;
                    (false, true)
                }
            };
        }

        let (Some(target), true) = (self.target_gate, due) else {
            return (false, false);
        };
        if self.planner.phase() == PlannerPhase::Extending {
            return (false, false);
        }
        let reason = self.replan_pending.take().or_else(|| {
            self.planner
                .replan_reason(state, &self.trajectory, elapsed, gates, self.target_gate)
        });
        let Some(reason) = reason else {
            return (false, false);
        };

        self.planner.begin_replan(reason);
        match self.planner.generate(gates, target, state, Some(&self.trajectory), tick) {
            Ok(trajectory) => {
                info!("Tick {}: replanned ({:?})", tick, reason);
                self.install(trajectory, tick);
                (true, false)
            }
            Err(e) => {
                warn!("Tick {}: replanning failed, keeping previous trajectory: {}", tick, e);
                self.planner.abort_replan();
                self.last_replan_tick = tick;
                (false, true)
            }
        }
    }

    fn install(&mut self, trajectory: Trajectory, tick: u64) {
        self.trajectory = trajectory;
        self.last_replan_tick = tick;
        self.replan_count += 1;
        self.planner.commit();
        self.scheduler.notify_replan();
        self.warm_start.invalidate();
    }

    fn solve(
        &mut self,
        tick: u64,
        state: &DroneState,
        weights: &CostWeights,
        gates: &[GateState],
        obstacles: &[ObstacleState],
    ) -> SolveResult {
        let n = self.solver.num_steps();
        let reference = self.trajectory.reference_horizon(
            self.trajectory_time(tick),
            n,
            self.solver.dt(),
            self.config.dynamics.hover_thrust(),
        );
        let a = &self.actuation;
        let x0 = self.solver.model().pack_state(state, a.thrust, a.thrust_cmd, &a.rpy_cmd);

        self.warm_start.advance();
        self.solver.update_environment(gates, obstacles);
        self.solver.solve(&x0, &reference, weights, &self.warm_start)
    }

    fn emit(&mut self, command: Command) {
        self.actuation.apply(
            &command,
            self.config.tick_period(),
            self.config.dynamics.thrust_time_constant,
        );
        self.last_command = command;
    }

    fn fallback_output(
        &mut self,
        solve_status: Option<SolveStatus>,
        reason: DegradedReason,
        perception_gap: bool,
        replanned: bool,
    ) -> ControlOutput {
        let command = self.last_command;
        self.emit(command);
        ControlOutput {
            command,
            status: ControlStatus::Degraded,
            reason: Some(reason),
            perception_gap,
            replanned,
            solve_status,
        }
    }
}

/// First trajectory of an episode; a stop-and-hold when the course is already done
fn initial_trajectory(
    planner: &mut TrajectoryPlanner,
    world: &WorldModel,
    initial: &Observation,
) -> Result<Trajectory, PlanningError> {
    match initial.target_gate {
        Some(target) => planner.generate(&world.gates(), target, &initial.state, None, 0),
        None => planner.extend(&initial.state, None, 0),
    }
}
