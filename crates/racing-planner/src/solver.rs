//! MPC solver
//!
//! Gauss-Newton SQP over the single-shooting input sequence `U = [u₀ … u_{N−1}]`.
//! Each iteration rolls the model out with RK4, condenses the state
//! sensitivities `∂xₖ/∂U` into a dense Hessian/gradient, solves the
//! box-constrained QP for the step and backtracks on the penalised cost.
//!
//! Failures never panic or return `Err`: they come back as a [`SolveStatus`]
//! in the [`SolveResult`], together with the last command that came out of a
//! successful solve.

use std::time::Instant;

use log::{debug, warn};
use nalgebra::{DMatrix, DVector};

use racing_core::dynamics::{
    position_of, AttitudeModel, AttitudeModelParams, InputVector, StateMatrix, StateVector, NU, NX,
};
use racing_core::geometry::{CollisionModel, GateState, ObstacleState};

use crate::config::{CollisionConfig, ControllerConfig, HorizonConfig, SolverConfig};
use crate::constraints::ConstraintSet;
use crate::ocp::{
    input_cost, state_weight_diagonal, tracking_cost, Command, CommandBounds, InputBounds, ReferencePoint,
};
use crate::qp::{BoxQp, QpError, QpOptions};
use crate::warm_start::{Horizon, WarmStart};
use crate::weights::CostWeights;

/// Armijo constant of the outer line search
const ARMIJO: f64 = 1e-4;
/// Step halvings tried before declaring a stall
const LINE_SEARCH_STEPS: usize = 5;
/// Relative diagonal shift applied when the condensed Hessian is not positive definite
const REGULARIZATION: f64 = 1e-8;

/// Outcome of a solve
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolveStatus {
    /// Converged within tolerance
    Success,
    /// Iteration cap or time budget hit before convergence
    MaxIterationsReached,
    /// Predicted horizon penetrates a gate or obstacle
    Infeasible,
    /// Non-finite values or a failed factorisation
    NumericalFailure,
}

impl SolveStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, SolveStatus::Success)
    }
}

/// Solution statistics from solver
#[derive(Debug, Clone, Default)]
pub struct SolveStatistics {
    /// Number of SQP iterations
    pub nlp_iterations: usize,
    /// Total QP iterations across SQP steps
    pub qp_iterations: usize,
    /// Total solve time [ms]
    pub solve_time_ms: f64,
    /// Final penalised cost
    pub cost: f64,
    /// Infinity norm of the last SQP step
    pub step_norm: f64,
    /// Smallest predicted clearance over the horizon [m]
    pub min_clearance: f64,
    /// Whether the wall-clock budget ended the solve
    pub timed_out: bool,
}

/// Limits for a single solve call
#[derive(Debug, Clone)]
pub struct SolveOptions {
    pub max_nlp_iterations: usize,
    pub max_qp_iterations: usize,
    pub tolerance: f64,
    pub qp_tolerance: f64,
    pub max_solve_time_ms: Option<f64>,
    pub verbose: bool,
}

impl SolveOptions {
    pub fn from_config(config: &SolverConfig) -> Self {
        Self {
            max_nlp_iterations: config.max_nlp_iterations,
            max_qp_iterations: config.max_qp_iterations,
            tolerance: config.tolerance,
            qp_tolerance: config.qp_tolerance,
            max_solve_time_ms: config.max_solve_time_ms,
            verbose: config.verbose,
        }
    }
}

impl Default for SolveOptions {
    fn default() -> Self {
        Self::from_config(&SolverConfig::default())
    }
}

/// Result of [`MpcSolver::solve`]
#[derive(Debug, Clone)]
pub struct SolveResult {
    pub status: SolveStatus,
    /// Command for the current tick
    pub command: Command,
    /// Predicted states and inputs over the horizon
    pub horizon: Horizon,
    pub statistics: SolveStatistics,
}

/// Receding-horizon MPC solver
#[derive(Debug, Clone)]
pub struct MpcSolver {
    model: AttitudeModel,
    num_steps: usize,
    dt: f64,
    options: SolveOptions,
    input_bounds: InputBounds,
    command_bounds: CommandBounds,
    collision: CollisionModel,
    collision_config: CollisionConfig,
    terminal_scale: f64,
    default_thrust: f64,
    gates: Vec<GateState>,
    obstacles: Vec<ObstacleState>,
    last_command: Option<Command>,
}

impl MpcSolver {
    pub fn num_steps(&self) -> usize {
        self.num_steps
    }

    /// Shooting interval [s]
    pub fn dt(&self) -> f64 {
        self.dt
    }

    pub fn model(&self) -> &AttitudeModel {
        &self.model
    }

    pub fn options(&self) -> &SolveOptions {
        &self.options
    }

    pub fn set_solve_options(&mut self, options: SolveOptions) {
        self.options = options;
    }

    pub fn command_bounds(&self) -> &CommandBounds {
        &self.command_bounds
    }

    /// Command used before any solve has succeeded
    pub fn default_command(&self) -> Command {
        Command::level(self.default_thrust)
    }

    /// Command from the last successful solve
    pub fn last_command(&self) -> Option<Command> {
        self.last_command
    }

    /// Forget the last successful command
    pub fn reset(&mut self) {
        self.last_command = None;
    }

    /// Replace the gate/obstacle geometry used for constraints
    pub fn update_environment(&mut self, gates: &[GateState], obstacles: &[ObstacleState]) {
        self.gates.clear();
        self.gates.extend_from_slice(gates);
        self.obstacles.clear();
        self.obstacles.extend_from_slice(obstacles);
    }

    /// Solve the OCP from `x0`
    ///
    /// `reference` should hold N+1 nodes; shorter references are padded with
    /// their last node. Starts from the warm start guess when it is valid,
    /// otherwise from zero command rates.
    pub fn solve(
        &mut self,
        x0: &StateVector,
        reference: &[ReferencePoint],
        weights: &CostWeights,
        warm_start: &WarmStart,
    ) -> SolveResult {
        let start = Instant::now();
        let n = self.num_steps;
        let mut stats = SolveStatistics::default();

        let reference = self.pad_reference(reference, x0);
        let inputs_ok = x0.iter().all(|v| v.is_finite())
            && weights.is_valid()
            && reference.iter().all(|r| r.target_state().iter().all(|v| v.is_finite()));
        if !inputs_ok {
            warn!("Solver received non-finite state, reference or weights");
            stats.solve_time_ms = elapsed_ms(start);
            return self.finish(SolveStatus::NumericalFailure, Horizon::cold(x0, n), stats);
        }

        let mut u = match warm_start.guess() {
            Some(guess) if guess.num_steps() == n && guess.is_finite() => {
                stack_inputs(guess.inputs.iter().map(|u| self.input_bounds.clamp(u)))
            }
            _ => DVector::zeros(n * NU),
        };

        let anchors: Vec<_> = std::iter::once(position_of(x0))
            .chain(reference.iter().map(|r| r.position))
            .collect();
        let constraints = ConstraintSet::select(
            &self.collision,
            &self.collision_config,
            self.command_bounds,
            &self.gates,
            &self.obstacles,
            &anchors,
        );
        let q = state_weight_diagonal(weights, 1.0);
        let q_terminal = state_weight_diagonal(weights, self.terminal_scale);
        let problem = Problem {
            reference: &reference,
            q: &q,
            q_terminal: &q_terminal,
            weights,
            constraints: &constraints,
        };

        let mut states = self.rollout(x0, &u);
        let mut cost = self.cost(&states, &u, &problem);
        let mut converged = false;
        let mut numerical_failure = !cost.is_finite();

        while !numerical_failure && stats.nlp_iterations < self.options.max_nlp_iterations {
            if let Some(budget) = self.options.max_solve_time_ms {
                if elapsed_ms(start) > budget {
                    stats.timed_out = true;
                    break;
                }
            }
            stats.nlp_iterations += 1;

            let (hessian, gradient) = self.condense(&states, &u, &problem);
            let lower = DVector::from_fn(n * NU, |i, _| self.input_bounds.lower[i % NU] - u[i]);
            let upper = DVector::from_fn(n * NU, |i, _| self.input_bounds.upper[i % NU] - u[i]);
            let qp_options = QpOptions {
                max_iterations: self.options.max_qp_iterations,
                tolerance: self.options.qp_tolerance,
            };
            let qp = BoxQp { hessian: &hessian, gradient: &gradient, lower: &lower, upper: &upper };
            let solution = match qp.solve(None, &qp_options) {
                Ok(solution) => solution,
                Err(QpError::NotPositiveDefinite) => {
                    let shift = REGULARIZATION * (1.0 + hessian.diagonal().amax());
                    let regularized = &hessian + DMatrix::identity(n * NU, n * NU) * shift;
                    let qp = BoxQp { hessian: &regularized, ..qp };
                    match qp.solve(None, &qp_options) {
                        Ok(solution) => solution,
                        Err(e) => {
                            warn!("QP failed after regularisation: {}", e);
                            numerical_failure = true;
                            break;
                        }
                    }
                }
                Err(e) => {
                    warn!("QP failed: {}", e);
                    numerical_failure = true;
                    break;
                }
            };
            stats.qp_iterations += solution.iterations;

            let step = solution.x;
            let step_norm = step.amax();
            stats.step_norm = step_norm;
            if !step_norm.is_finite() {
                numerical_failure = true;
                break;
            }
            // Only a converged QP step certifies stationarity
            if step_norm < self.options.tolerance {
                converged = solution.converged;
                break;
            }

            // Backtracking on the penalised cost
            let slope = gradient.dot(&step).min(0.0);
            let mut alpha = 1.0;
            let mut accepted = false;
            for _ in 0..LINE_SEARCH_STEPS {
                let trial = &u + &step * alpha;
                let trial_states = self.rollout(x0, &trial);
                let trial_cost = self.cost(&trial_states, &trial, &problem);
                if trial_cost.is_finite() && trial_cost <= cost + ARMIJO * alpha * slope {
                    u = trial;
                    states = trial_states;
                    cost = trial_cost;
                    accepted = true;
                    break;
                }
                alpha *= 0.5;
            }

            if self.options.verbose {
                debug!(
                    "SQP iter {}: cost {:.6e}, |d| {:.3e}, alpha {:.3}, QP iters {}",
                    stats.nlp_iterations, cost, step_norm, alpha, solution.iterations
                );
            }

            if !accepted {
                // Stalled: accept only if the step was already small
                converged = solution.converged && step_norm <= self.options.tolerance.sqrt();
                break;
            }
        }

        stats.cost = cost;
        stats.min_clearance = states
            .iter()
            .skip(1)
            .map(|x| constraints.clearance(&position_of(x)).distance)
            .fold(f64::INFINITY, f64::min);
        stats.solve_time_ms = elapsed_ms(start);

        let horizon = Horizon {
            states,
            inputs: (0..n).map(|k| input_at(&u, k)).collect(),
        };
        let status = if numerical_failure || !horizon.is_finite() || !cost.is_finite() {
            SolveStatus::NumericalFailure
        } else if stats.min_clearance < -self.collision_config.infeasibility_tolerance {
            SolveStatus::Infeasible
        } else if !converged {
            SolveStatus::MaxIterationsReached
        } else {
            SolveStatus::Success
        };

        if self.options.verbose {
            debug!(
                "Solve finished: {:?} after {} SQP / {} QP iterations in {:.2} ms",
                status, stats.nlp_iterations, stats.qp_iterations, stats.solve_time_ms
            );
        }
        self.finish(status, horizon, stats)
    }

    fn finish(&mut self, status: SolveStatus, horizon: Horizon, statistics: SolveStatistics) -> SolveResult {
        let command = if status.is_success() {
            let command = horizon
                .states
                .get(1)
                .map(Command::from_state)
                .unwrap_or_else(|| self.default_command());
            self.last_command = Some(command);
            command
        } else {
            self.last_command.unwrap_or_else(|| self.default_command())
        };
        SolveResult {
            status,
            command,
            horizon,
            statistics,
        }
    }

    /// Exactly N+1 reference nodes
    fn pad_reference(&self, reference: &[ReferencePoint], x0: &StateVector) -> Vec<ReferencePoint> {
        let n = self.num_steps;
        let fill = reference
            .last()
            .copied()
            .unwrap_or_else(|| ReferencePoint::hover(position_of(x0), self.default_thrust));
        reference
            .iter()
            .copied()
            .chain(std::iter::repeat(fill))
            .take(n + 1)
            .collect()
    }

    fn rollout(&self, x0: &StateVector, u: &DVector<f64>) -> Vec<StateVector> {
        let mut states = Vec::with_capacity(self.num_steps + 1);
        states.push(*x0);
        for k in 0..self.num_steps {
            let next = self.model.step(&states[k], &input_at(u, k), self.dt);
            states.push(next);
        }
        states
    }

    fn cost(&self, states: &[StateVector], u: &DVector<f64>, problem: &Problem) -> f64 {
        let n = self.num_steps;
        let mut cost = 0.0;
        for k in 1..=n {
            let q = if k == n { problem.q_terminal } else { problem.q };
            cost += tracking_cost(&states[k], &problem.reference[k], q);
            cost += problem.constraints.evaluate(&states[k]).penalty;
        }
        for k in 0..n {
            cost += input_cost(&input_at(u, k), problem.weights);
        }
        cost
    }

    /// Gauss-Newton Hessian and gradient of the cost with respect to U
    fn condense(&self, states: &[StateVector], u: &DVector<f64>, problem: &Problem) -> (DMatrix<f64>, DVector<f64>) {
        let n = self.num_steps;
        let dim = n * NU;
        let mut hessian = DMatrix::zeros(dim, dim);
        let mut gradient = DVector::zeros(dim);

        // ∂xₖ/∂U; only the first k·NU columns are non-zero
        let mut sensitivity = DMatrix::<f64>::zeros(NX, dim);
        for k in 0..n {
            let (a, b) = self.model.step_jacobians(&states[k], &input_at(u, k), self.dt);
            let a = DMatrix::from_column_slice(NX, NX, a.as_slice());
            let b = DMatrix::from_column_slice(NX, NU, b.as_slice());

            let cols = k * NU;
            let mut next = DMatrix::zeros(NX, dim);
            if cols > 0 {
                next.columns_mut(0, cols).copy_from(&(&a * sensitivity.columns(0, cols)));
            }
            next.columns_mut(cols, NU).copy_from(&b);
            sensitivity = next;

            let x = &states[k + 1];
            let q = if k + 1 == n { problem.q_terminal } else { problem.q };
            let penalty = problem.constraints.linearize(x);
            let residual = (x - problem.reference[k + 1].target_state()).component_mul(q) + penalty.gradient;
            let weight: StateMatrix = StateMatrix::from_diagonal(q) + penalty.hessian;

            let m = cols + NU;
            let s = sensitivity.columns(0, m);
            let st = s.transpose();
            let weight = DMatrix::from_column_slice(NX, NX, weight.as_slice());
            let residual = DVector::from_column_slice(residual.as_slice());

            let mut block = hessian.view_mut((0, 0), (m, m));
            block += &st * (&weight * &s);
            let mut rows = gradient.rows_mut(0, m);
            rows += &st * &residual;
        }

        let r = problem.weights.r;
        for i in 0..dim {
            hessian[(i, i)] += r;
            gradient[i] += r * u[i];
        }
        (hessian, gradient)
    }
}

/// Per-solve problem data shared by cost and condensing
struct Problem<'a> {
    reference: &'a [ReferencePoint],
    q: &'a StateVector,
    q_terminal: &'a StateVector,
    weights: &'a CostWeights,
    constraints: &'a ConstraintSet,
}

fn input_at(u: &DVector<f64>, k: usize) -> InputVector {
    InputVector::from_iterator(u.rows(k * NU, NU).iter().copied())
}

fn stack_inputs(inputs: impl Iterator<Item = InputVector>) -> DVector<f64> {
    let flat: Vec<f64> = inputs.flat_map(|u| u.iter().copied().collect::<Vec<_>>()).collect();
    DVector::from_vec(flat)
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

/// Builder for [`MpcSolver`]
pub struct SolverBuilder {
    horizon: HorizonConfig,
    solver: SolverConfig,
    collision: CollisionConfig,
    dynamics: AttitudeModelParams,
}

impl SolverBuilder {
    pub fn new(horizon: HorizonConfig) -> Self {
        Self {
            horizon,
            solver: SolverConfig::default(),
            collision: CollisionConfig::default(),
            dynamics: AttitudeModelParams::default(),
        }
    }

    pub fn from_config(config: &ControllerConfig) -> Self {
        Self::new(config.horizon.clone())
            .with_solver_config(config.solver.clone())
            .with_collision(config.collision.clone())
            .with_dynamics(config.dynamics.clone())
    }

    pub fn with_solver_config(mut self, solver: SolverConfig) -> Self {
        self.solver = solver;
        self
    }

    pub fn with_collision(mut self, collision: CollisionConfig) -> Self {
        self.collision = collision;
        self
    }

    pub fn with_dynamics(mut self, dynamics: AttitudeModelParams) -> Self {
        self.dynamics = dynamics;
        self
    }

    pub fn build(self) -> MpcSolver {
        let default_thrust = self.solver.default_thrust.unwrap_or_else(|| self.dynamics.hover_thrust());
        MpcSolver {
            model: AttitudeModel::new(self.dynamics),
            num_steps: self.horizon.num_steps,
            dt: self.horizon.dt(),
            options: SolveOptions::from_config(&self.solver),
            input_bounds: InputBounds::from_config(&self.solver),
            command_bounds: CommandBounds::from_config(&self.solver),
            collision: self.collision.collision_model(),
            collision_config: self.collision,
            terminal_scale: self.solver.terminal_scale,
            default_thrust,
            gates: Vec::new(),
            obstacles: Vec::new(),
            last_command: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Vector3;
    use racing_core::dynamics::{idx, DroneState};

    fn solver() -> MpcSolver {
        SolverBuilder::new(HorizonConfig { num_steps: 20, horizon_time: 0.8 })
            .with_solver_config(SolverConfig {
                max_nlp_iterations: 50,
                ..Default::default()
            })
            .build()
    }

    fn hover_state(solver: &MpcSolver, position: Vector3<f64>) -> StateVector {
        let thrust = solver.default_command().thrust;
        solver
            .model()
            .pack_state(&DroneState::at_rest(position), thrust, thrust, &Vector3::zeros())
    }

    fn reference(solver: &MpcSolver, position: Vector3<f64>) -> Vec<ReferencePoint> {
        vec![ReferencePoint::hover(position, solver.default_command().thrust); solver.num_steps() + 1]
    }

    #[test]
    fn test_hover_is_already_optimal() {
        let mut s = solver();
        let p = Vector3::new(0.0, 0.0, 1.0);
        let x0 = hover_state(&s, p);
        let result = s.solve(&x0, &reference(&s, p), &CostWeights::default(), &WarmStart::new(20));
        assert_eq!(result.status, SolveStatus::Success);
        assert_eq!(result.statistics.nlp_iterations, 1);
        assert_relative_eq!(result.command.thrust, s.default_command().thrust, epsilon = 1e-9);
        assert_relative_eq!(result.command.rpy.norm(), 0.0, epsilon = 1e-9);
        assert_eq!(result.horizon.states.len(), 21);
        assert_eq!(result.horizon.inputs.len(), 20);
    }

    #[test]
    fn test_tilts_towards_reference() {
        let mut s = solver();
        let x0 = hover_state(&s, Vector3::new(0.0, 0.0, 1.0));
        let target = Vector3::new(0.15, 0.0, 1.0);
        let result = s.solve(&x0, &reference(&s, target), &CostWeights::default(), &WarmStart::new(20));
        assert_eq!(result.status, SolveStatus::Success);
        // Positive pitch accelerates along +x
        assert!(result.command.rpy.y > 0.0, "pitch command {}", result.command.rpy.y);
        assert_eq!(s.last_command(), Some(result.command));
        let end = position_of(result.horizon.states.last().unwrap());
        assert!(end.x > 0.0);
    }

    #[test]
    fn test_inner_iteration_cap_is_not_success() {
        let build = |max_qp_iterations| {
            SolverBuilder::new(HorizonConfig { num_steps: 20, horizon_time: 0.8 })
                .with_solver_config(SolverConfig {
                    max_nlp_iterations: 50,
                    max_qp_iterations,
                    tolerance: 1e6,
                    qp_tolerance: 1e-6,
                    ..Default::default()
                })
                .build()
        };
        let start = Vector3::new(0.0, 0.0, 1.0);
        let target = Vector3::new(3.0, 0.0, 1.0);

        // Any step passes the outer tolerance, so only the QP can refuse
        let mut capped = build(1);
        let x0 = hover_state(&capped, start);
        let result = capped.solve(&x0, &reference(&capped, target), &CostWeights::default(), &WarmStart::new(20));
        assert_eq!(result.status, SolveStatus::MaxIterationsReached);
        assert_eq!(result.statistics.qp_iterations, result.statistics.nlp_iterations);

        let mut full = build(500);
        let result = full.solve(&x0, &reference(&full, target), &CostWeights::default(), &WarmStart::new(20));
        assert_eq!(result.status, SolveStatus::Success);
        assert_eq!(result.statistics.nlp_iterations, 1);
    }

    #[test]
    fn test_infeasible_start_reports_status_and_default_command() {
        let mut s = solver();
        let p = Vector3::new(0.0, 0.0, 1.0);
        let config = CollisionConfig::default();
        s.update_environment(&[], &[config.obstacle(0, p)]);
        let x0 = hover_state(&s, p);
        let result = s.solve(&x0, &reference(&s, p), &CostWeights::default(), &WarmStart::new(20));
        assert_eq!(result.status, SolveStatus::Infeasible);
        assert_eq!(result.command, s.default_command());
        assert!(result.statistics.min_clearance < 0.0);
    }

    #[test]
    fn test_iteration_cap_repeats_last_good_command() {
        let mut s = solver();
        let p = Vector3::new(0.0, 0.0, 1.0);
        let x0 = hover_state(&s, p);
        let good = s.solve(&x0, &reference(&s, p), &CostWeights::default(), &WarmStart::new(20));
        assert!(good.status.is_success());

        s.set_solve_options(SolveOptions {
            max_nlp_iterations: 1,
            tolerance: 0.0,
            ..s.options().clone()
        });
        let far = reference(&s, Vector3::new(1.0, 1.0, 1.5));
        let capped = s.solve(&x0, &far, &CostWeights::default(), &WarmStart::new(20));
        assert_eq!(capped.status, SolveStatus::MaxIterationsReached);
        assert_eq!(capped.statistics.nlp_iterations, 1);
        assert_eq!(capped.command, good.command);
    }

    #[test]
    fn test_non_finite_state_is_numerical_failure() {
        let mut s = solver();
        let mut x0 = hover_state(&s, Vector3::new(0.0, 0.0, 1.0));
        x0[idx::VEL] = f64::NAN;
        let result = s.solve(&x0, &reference(&s, Vector3::zeros()), &CostWeights::default(), &WarmStart::new(20));
        assert_eq!(result.status, SolveStatus::NumericalFailure);
        assert!(result.command.is_finite());
    }

    #[test]
    fn test_short_reference_is_padded() {
        let mut s = solver();
        let p = Vector3::new(0.0, 0.0, 1.0);
        let x0 = hover_state(&s, p);
        let short = vec![ReferencePoint::hover(p, s.default_command().thrust); 3];
        let result = s.solve(&x0, &short, &CostWeights::default(), &WarmStart::new(20));
        assert_eq!(result.status, SolveStatus::Success);
    }
}
