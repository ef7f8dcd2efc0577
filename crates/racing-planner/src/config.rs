//! Controller configuration
//!
//! Every numeric parameter of the planner, weight scheduler, solver and
//! control loop. Loaded once at startup from TOML; `control_frequency` and
//! the `[horizon]` table are required, everything else falls back to the
//! defaults below.

use std::path::{Path, PathBuf};

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use racing_core::dynamics::AttitudeModelParams;
use racing_core::geometry::{BodyModel, CollisionModel, FrameModel, GateState, ObstacleState};

use crate::weights::{CostWeights, WeightPreset};

/// Configuration errors (fatal at startup)
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read configuration file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid { field, reason: reason.into() }
}

/// Main controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Control loop frequency [Hz]
    pub control_frequency: f64,
    /// MPC horizon
    pub horizon: HorizonConfig,
    /// Replanning triggers and weight blending
    #[serde(default)]
    pub replanning: ReplanningConfig,
    /// Waypoint generation
    #[serde(default)]
    pub planner: PlannerConfig,
    /// Cost weights
    #[serde(default)]
    pub weights: WeightsConfig,
    /// Collision geometry and soft-constraint penalties
    #[serde(default)]
    pub collision: CollisionConfig,
    /// Solver limits and bounds
    #[serde(default)]
    pub solver: SolverConfig,
    /// Identified vehicle model
    #[serde(default)]
    pub dynamics: AttitudeModelParams,
    /// Flight log persistence
    #[serde(default)]
    pub flight_log: FlightLogConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            control_frequency: 50.0,
            horizon: HorizonConfig::default(),
            replanning: ReplanningConfig::default(),
            planner: PlannerConfig::default(),
            weights: WeightsConfig::default(),
            collision: CollisionConfig::default(),
            solver: SolverConfig::default(),
            dynamics: AttitudeModelParams::default(),
            flight_log: FlightLogConfig::default(),
        }
    }
}

impl ControllerConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Control tick period [s]
    pub fn tick_period(&self) -> f64 {
        1.0 / self.control_frequency
    }

    /// Reject values the controller cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.control_frequency > 0.0) {
            return Err(invalid("control_frequency", "must be positive"));
        }
        if self.horizon.num_steps == 0 {
            return Err(invalid("horizon.num_steps", "must be at least 1"));
        }
        if !(self.horizon.horizon_time > 0.0) {
            return Err(invalid("horizon.horizon_time", "must be positive"));
        }

        let r = &self.replanning;
        if r.replanning_frequency == 0 {
            return Err(invalid("replanning.replanning_frequency", "must be at least 1 tick"));
        }
        if !(r.weight_adjustment_duration_ratio > 0.0) {
            return Err(invalid("replanning.weight_adjustment_duration_ratio", "must be positive"));
        }
        if !(r.q_pos_replanning_factor > 0.0) {
            return Err(invalid("replanning.q_pos_replanning_factor", "must be positive"));
        }
        if r.deviation_threshold < 0.0 || r.near_gate_threshold < 0.0 {
            return Err(invalid("replanning.deviation_threshold", "thresholds must be non-negative"));
        }

        let p = &self.planner;
        let s = &p.speeds;
        for (field, v) in [
            ("planner.speeds.base_speed", s.base_speed),
            ("planner.speeds.high_speed", s.high_speed),
            ("planner.speeds.approach_speed", s.approach_speed),
            ("planner.speeds.exit_speed", s.exit_speed),
        ] {
            if !(v > 0.0) {
                return Err(invalid(field, "speeds must be positive"));
            }
        }
        if !(p.min_segment_duration > 0.0) {
            return Err(invalid("planner.min_segment_duration", "must be positive"));
        }
        if p.final_extension_points == 0 {
            return Err(invalid("planner.final_extension_points", "the final gate needs an extension point"));
        }
        for (field, table) in [
            ("planner.approach_distance", &p.approach_distance),
            ("planner.exit_distance", &p.exit_distance),
        ] {
            if table.default < 0.0 || table.overrides.iter().any(|d| *d < 0.0) {
                return Err(invalid(field, "distances must be non-negative"));
            }
        }

        let c = &self.solver;
        if c.max_nlp_iterations == 0 || c.max_qp_iterations == 0 {
            return Err(invalid("solver.max_nlp_iterations", "iteration caps must be at least 1"));
        }
        if c.thrust_bounds[0] >= c.thrust_bounds[1] {
            return Err(invalid("solver.thrust_bounds", "lower bound must be below upper bound"));
        }
        if !(c.attitude_limit > 0.0) || !(c.thrust_rate_limit > 0.0) || !(c.attitude_rate_limit > 0.0) {
            return Err(invalid("solver.attitude_limit", "limits must be positive"));
        }
        if c.tolerance < 0.0 {
            return Err(invalid("solver.tolerance", "must be non-negative"));
        }

        let col = &self.collision;
        if col.body_radius < 0.0 || col.body_length < 0.0 || col.bar_radius < 0.0 {
            return Err(invalid("collision.body_radius", "dimensions must be non-negative"));
        }
        Ok(())
    }
}

/// Horizon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HorizonConfig {
    /// Number of shooting intervals N
    pub num_steps: usize,
    /// Total horizon time [s]
    pub horizon_time: f64,
}

impl Default for HorizonConfig {
    fn default() -> Self {
        Self {
            num_steps: 60,
            horizon_time: 2.0,
        }
    }
}

impl HorizonConfig {
    /// Shooting interval [s]
    pub fn dt(&self) -> f64 {
        self.horizon_time / self.num_steps as f64
    }
}

/// Replanning triggers and post-replan weight blending
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplanningConfig {
    /// Minimum number of ticks between two replans
    pub replanning_frequency: u64,
    /// Tracking deviation that triggers a replan [m]
    pub deviation_threshold: f64,
    /// Looser deviation threshold while well aligned with the next gate [m]
    pub near_gate_threshold: f64,
    /// Distance to the next gate within which the looser threshold applies [m]
    pub near_gate_distance: f64,
    /// Minimum cosine between velocity and gate direction to count as aligned
    pub alignment_threshold: f64,
    /// Observed gate displacement that triggers a replan [m]
    pub gate_shift_threshold: f64,
    /// Fraction of the replanning interval over which weights relax to steady
    pub weight_adjustment_duration_ratio: f64,
    /// Position-weight multiplier applied right after a replan
    pub q_pos_replanning_factor: f64,
}

impl Default for ReplanningConfig {
    fn default() -> Self {
        Self {
            replanning_frequency: 5,
            deviation_threshold: 0.25,
            near_gate_threshold: 0.45,
            near_gate_distance: 0.6,
            alignment_threshold: 0.8,
            gate_shift_threshold: 0.05,
            weight_adjustment_duration_ratio: 0.6,
            q_pos_replanning_factor: 2.0,
        }
    }
}

impl ReplanningConfig {
    /// Number of ticks over which replanning weights relax back to steady
    pub fn weight_adjustment_ticks(&self) -> f64 {
        self.weight_adjustment_duration_ratio * self.replanning_frequency as f64
    }
}

/// Per-gate parameter table
///
/// `overrides[i]` applies to gate `i`; any index beyond the table uses
/// `default`. Out-of-range lookups are a defined fallback, not an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerGate<T> {
    pub default: T,
    #[serde(default)]
    pub overrides: Vec<T>,
}

impl<T: Copy> PerGate<T> {
    pub fn uniform(default: T) -> Self {
        Self { default, overrides: Vec::new() }
    }

    pub fn with_overrides(default: T, overrides: Vec<T>) -> Self {
        Self { default, overrides }
    }

    /// Value for gate `index`
    pub fn get(&self, index: usize) -> T {
        if index < self.overrides.len() {
            self.overrides[index]
        } else {
            self.default
        }
    }

    /// Whether gate `index` has its own value
    pub fn has_override(&self, index: usize) -> bool {
        index < self.overrides.len()
    }
}

/// Speed profile used for time allocation [m/s]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeedProfile {
    /// Cruise speed between gates
    pub base_speed: f64,
    /// Speed on long straight transitions
    pub high_speed: f64,
    /// Speed on the approach into and through a gate
    pub approach_speed: f64,
    /// Speed leaving a gate
    pub exit_speed: f64,
    /// Transition segments longer than this use `high_speed` [m]
    pub high_speed_distance: f64,
}

impl Default for SpeedProfile {
    fn default() -> Self {
        Self {
            base_speed: 1.2,
            high_speed: 1.8,
            approach_speed: 0.9,
            exit_speed: 1.2,
            high_speed_distance: 1.0,
        }
    }
}

/// Blending of the observed velocity into a freshly generated trajectory
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MomentumConfig {
    /// Speed above which the blend is applied [m/s]
    pub velocity_threshold: f64,
    /// Time window carried along the current velocity [s]
    pub blend_time: f64,
    /// Upper bound on the distance of the blend segment [m]
    pub max_distance: f64,
}

impl Default for MomentumConfig {
    fn default() -> Self {
        Self {
            velocity_threshold: 0.4,
            blend_time: 0.3,
            max_distance: 0.4,
        }
    }
}

/// Waypoint generation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    /// Distance of the first approach point before the gate [m]
    pub approach_distance: PerGate<f64>,
    /// Distance of the last exit point behind the gate [m]
    pub exit_distance: PerGate<f64>,
    /// Height offset of the approach points [m]
    pub approach_height_offset: PerGate<f64>,
    /// Height offset of the exit points [m]
    pub exit_height_offset: PerGate<f64>,
    /// Gate-local shift [lateral, along-normal, vertical] of all waypoints of a gate [m]
    pub gate_offset: PerGate<Vector3<f64>>,
    /// Approach waypoints per gate
    pub approach_points: usize,
    /// Exit waypoints per intermediate gate
    pub exit_points: usize,
    /// Transition waypoints between an exit and the next approach
    pub transition_points: usize,
    /// Extension waypoints after the final gate
    pub final_extension_points: usize,
    /// Speed profile
    pub speeds: SpeedProfile,
    /// Minimum time allocated to reach a gate from the previous one [s]
    pub min_gate_duration: f64,
    /// Minimum total trajectory duration [s]
    pub min_total_duration: f64,
    /// Minimum duration of any segment [s]
    pub min_segment_duration: f64,
    /// Momentum blending
    pub momentum: MomentumConfig,
    /// Time to come to rest on the terminal extension [s]
    pub terminal_stop_time: f64,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            approach_distance: PerGate::uniform(0.3),
            exit_distance: PerGate::uniform(0.3),
            approach_height_offset: PerGate::uniform(0.0),
            exit_height_offset: PerGate::uniform(0.0),
            gate_offset: PerGate::uniform(Vector3::zeros()),
            approach_points: 2,
            exit_points: 1,
            transition_points: 1,
            final_extension_points: 1,
            speeds: SpeedProfile::default(),
            min_gate_duration: 0.8,
            min_total_duration: 2.0,
            min_segment_duration: 0.02,
            momentum: MomentumConfig::default(),
            terminal_stop_time: 1.0,
        }
    }
}

/// Cost weight selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WeightsConfig {
    /// Tuning preset for the steady bundle
    pub preset: WeightPreset,
    /// Explicit steady bundle; overrides the preset when present
    pub steady: Option<CostWeights>,
}

impl Default for WeightsConfig {
    fn default() -> Self {
        Self {
            preset: WeightPreset::Balanced,
            steady: None,
        }
    }
}

impl WeightsConfig {
    /// Steady-tracking weight bundle
    pub fn steady_weights(&self) -> CostWeights {
        self.steady.unwrap_or_else(|| CostWeights::preset(self.preset))
    }
}

/// Collision geometry and soft-constraint penalties
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollisionConfig {
    /// Radius of obstacle poles [m]
    pub obstacle_radius: f64,
    /// Default half size of a gate aperture [m]
    pub gate_half_size: f64,
    /// Radius of the gate frame bars [m]
    pub bar_radius: f64,
    /// Length of the gate frame bars [m]
    pub bar_length: f64,
    /// Horizontal semi-axis of the drone envelope [m]
    pub body_radius: f64,
    /// Vertical extent of the drone envelope [m]
    pub body_length: f64,
    /// Obstacle indices excluded from collision checks
    pub ignored_obstacles: Vec<usize>,
    /// Only geometry this close to the horizon is constrained [m]
    pub constraint_range: f64,
    /// Linear slack penalty
    pub penalty_linear: f64,
    /// Quadratic slack penalty
    pub penalty_quadratic: f64,
    /// Penetration beyond which a solution counts as infeasible [m]
    pub infeasibility_tolerance: f64,
}

impl Default for CollisionConfig {
    fn default() -> Self {
        Self {
            obstacle_radius: 0.1,
            gate_half_size: 0.225,
            bar_radius: 0.05,
            bar_length: 0.7,
            body_radius: 0.05,
            body_length: 0.06,
            ignored_obstacles: Vec::new(),
            constraint_range: 1.5,
            penalty_linear: 50.0,
            penalty_quadratic: 5000.0,
            infeasibility_tolerance: 0.05,
        }
    }
}

impl CollisionConfig {
    /// Collision model built from this configuration
    pub fn collision_model(&self) -> CollisionModel {
        CollisionModel::new(
            BodyModel { radius: self.body_radius, length: self.body_length },
            FrameModel { bar_radius: self.bar_radius, bar_length: self.bar_length },
            self.ignored_obstacles.iter().copied(),
        )
    }

    /// Gate with the configured nominal aperture
    pub fn gate(&self, index: usize, position: Vector3<f64>, yaw: f64) -> GateState {
        GateState::new(index, position, yaw, self.gate_half_size)
    }

    /// Obstacle with the configured radius
    pub fn obstacle(&self, index: usize, position: Vector3<f64>) -> ObstacleState {
        ObstacleState::new(index, position, self.obstacle_radius)
    }
}

/// Solver limits, tolerances and bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    /// Outer (SQP) iteration cap
    pub max_nlp_iterations: usize,
    /// Inner (QP) iteration cap per SQP step
    pub max_qp_iterations: usize,
    /// SQP step tolerance (infinity norm)
    pub tolerance: f64,
    /// QP projected-gradient tolerance
    pub qp_tolerance: f64,
    /// Wall-clock budget per solve [ms]; `None` relies on the iteration caps alone
    pub max_solve_time_ms: Option<f64>,
    /// Log per-iteration detail
    pub verbose: bool,
    /// Commanded thrust used before any command exists; hover thrust when absent
    pub default_thrust: Option<f64>,
    /// Commanded thrust bounds [min, max]
    pub thrust_bounds: [f64; 2],
    /// Bound on commanded roll/pitch/yaw [rad]
    pub attitude_limit: f64,
    /// Bound on the thrust-command rate input [1/s]
    pub thrust_rate_limit: f64,
    /// Bound on the attitude-command rate inputs [rad/s]
    pub attitude_rate_limit: f64,
    /// Terminal cost multiplier
    pub terminal_scale: f64,
    /// Initial guess for the very first solve (npz with `states`/`inputs`)
    pub warm_start_file: Option<PathBuf>,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            max_nlp_iterations: 20,
            max_qp_iterations: 25,
            tolerance: 1e-4,
            qp_tolerance: 1e-9,
            max_solve_time_ms: None,
            verbose: false,
            default_thrust: None,
            thrust_bounds: [0.1, 0.55],
            attitude_limit: 0.5,
            thrust_rate_limit: 10.0,
            attitude_rate_limit: 10.0,
            terminal_scale: 2.0,
            warm_start_file: None,
        }
    }
}

/// Flight log persistence
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlightLogConfig {
    /// Record and persist planned/actual trajectories
    pub enabled: bool,
    /// Output directory
    pub directory: PathBuf,
    /// File name suffix, e.g. `_level2`
    pub suffix: String,
}

impl Default for FlightLogConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            directory: PathBuf::from("flight_logs"),
            suffix: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_per_gate_fallback() {
        let table = PerGate::with_overrides(0.3, vec![0.2, 0.3, 0.2, 0.1]);
        assert_relative_eq!(table.get(0), 0.2);
        assert_relative_eq!(table.get(3), 0.1);
        // Out of range is a defined fallback
        assert_relative_eq!(table.get(4), 0.3);
        assert_relative_eq!(table.get(usize::MAX), 0.3);
        assert!(table.has_override(3));
        assert!(!table.has_override(4));
    }

    #[test]
    fn test_horizon_dt() {
        let horizon = HorizonConfig::default();
        assert_eq!(horizon.num_steps, 60);
        assert_relative_eq!(horizon.dt(), 2.0 / 60.0);
    }

    #[test]
    fn test_minimal_toml_uses_defaults() {
        let config = ControllerConfig::from_toml_str(
            r#"
            control_frequency = 50.0

            [horizon]
            num_steps = 30
            horizon_time = 1.5
            "#,
        )
        .unwrap();
        assert_eq!(config.horizon.num_steps, 30);
        assert_eq!(config.replanning.replanning_frequency, 5);
        assert_relative_eq!(config.planner.exit_distance.get(7), 0.3);
    }

    #[test]
    fn test_per_gate_tables_from_toml() {
        let config = ControllerConfig::from_toml_str(
            r#"
            control_frequency = 50.0

            [horizon]
            num_steps = 30
            horizon_time = 1.5

            [planner.approach_distance]
            default = 0.25
            overrides = [0.2, 0.3, 0.2, 0.1]

            [planner.exit_distance]
            default = 0.3
            overrides = [0.4, 0.15, 0.25, 5.0]

            [planner.gate_offset]
            default = [0.0, 0.0, 0.0]
            overrides = [[0.0, 0.0, 0.0], [0.05, 0.0, -0.02]]

            [weights]
            preset = "aggressive"
            "#,
        )
        .unwrap();
        assert_relative_eq!(config.planner.approach_distance.get(1), 0.3);
        assert_relative_eq!(config.planner.exit_distance.get(3), 5.0);
        assert_relative_eq!(config.planner.gate_offset.get(1).x, 0.05);
        assert_relative_eq!(config.planner.gate_offset.get(2).z, 0.0);
        assert_eq!(config.weights.preset, WeightPreset::Aggressive);
    }

    #[test]
    fn test_missing_required_parameter_is_an_error() {
        let result = ControllerConfig::from_toml_str(
            r#"
            [horizon]
            num_steps = 30
            horizon_time = 1.5
            "#,
        );
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let mut config = ControllerConfig::default();
        config.replanning.weight_adjustment_duration_ratio = 0.0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { .. })));

        let mut config = ControllerConfig::default();
        config.solver.thrust_bounds = [0.5, 0.2];
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { .. })));

        assert!(ControllerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_weight_adjustment_ticks() {
        let r = ReplanningConfig {
            replanning_frequency: 10,
            weight_adjustment_duration_ratio: 0.5,
            ..Default::default()
        };
        assert_relative_eq!(r.weight_adjustment_ticks(), 5.0);
    }
}
