//! Soft path constraints for the OCP
//!
//! Every constraint is written as `h(x) ≥ 0`:
//! - clearance to each gate frame bar and each non-ignored obstacle
//! - commanded thrust within `[f_min, f_max]`
//! - commanded roll/pitch/yaw within `±limit`
//!
//! Violations `v = max(0, −h)` are charged with the slack penalty
//! `φ(v) = z·v + ½·Z·v²`. The solver uses its Gauss-Newton model
//! (gradient `−(z + Z·v)∇h`, Hessian `Z·∇h∇hᵀ`).

use nalgebra::Vector3;

use racing_core::dynamics::{idx, position_of, StateMatrix, StateVector};
use racing_core::geometry::{
    frame_bar_clearance, obstacle_clearance, Clearance, CollisionModel, FrameBar, GateState, ObstacleState,
};

use crate::config::CollisionConfig;
use crate::ocp::CommandBounds;

/// Finite-difference step for clearance gradients [m]
const GRADIENT_STEP: f64 = 1e-6;

/// Slack penalty weights
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PenaltyWeights {
    /// Linear weight z
    pub linear: f64,
    /// Quadratic weight Z
    pub quadratic: f64,
}

impl PenaltyWeights {
    pub fn value(&self, violation: f64) -> f64 {
        self.linear * violation + 0.5 * self.quadratic * violation * violation
    }
}

/// Result of constraint evaluation
#[derive(Debug, Clone, Default)]
pub struct ConstraintEvaluation {
    /// Penalty value
    pub penalty: f64,
    /// Largest violation (0 if all satisfied)
    pub max_violation: f64,
    /// Number of violated constraints
    pub violated: usize,
}

impl ConstraintEvaluation {
    fn add(&mut self, h: f64, weights: &PenaltyWeights) {
        if h < 0.0 {
            let v = -h;
            self.penalty += weights.value(v);
            self.max_violation = self.max_violation.max(v);
            self.violated += 1;
        }
    }

    pub fn all_satisfied(&self) -> bool {
        self.violated == 0
    }
}

/// Gauss-Newton model of the penalty at one state
#[derive(Debug, Clone)]
pub struct PenaltyModel {
    pub gradient: StateVector,
    pub hessian: StateMatrix,
}

impl PenaltyModel {
    fn zero() -> Self {
        Self {
            gradient: StateVector::zeros(),
            hessian: StateMatrix::zeros(),
        }
    }

    fn add(&mut self, h: f64, dh: &StateVector, weights: &PenaltyWeights) {
        if h < 0.0 {
            let v = -h;
            self.gradient -= dh * (weights.linear + weights.quadratic * v);
            self.hessian += dh * dh.transpose() * weights.quadratic;
        }
    }
}

/// Constraint set for one solve
///
/// Holds only the gates and obstacles within range of the horizon.
#[derive(Debug, Clone)]
pub struct ConstraintSet {
    model: CollisionModel,
    gates: Vec<GateState>,
    obstacles: Vec<ObstacleState>,
    bounds: CommandBounds,
    weights: PenaltyWeights,
}

impl ConstraintSet {
    /// Select the geometry within `config.constraint_range` of any anchor point
    pub fn select(
        model: &CollisionModel,
        config: &CollisionConfig,
        bounds: CommandBounds,
        gates: &[GateState],
        obstacles: &[ObstacleState],
        anchors: &[Vector3<f64>],
    ) -> Self {
        let range = config.constraint_range;
        let near = |p: &Vector3<f64>, extent: f64, horizontal: bool| {
            anchors.iter().any(|a| {
                let mut d = p - a;
                if horizontal {
                    d.z = 0.0;
                }
                d.norm() - extent <= range
            })
        };

        let gates = gates
            .iter()
            .filter(|g| {
                let extent = g.half_width.max(g.half_height) + model.frame.bar_length;
                near(&g.position, extent, false)
            })
            .cloned()
            .collect();
        let obstacles = model
            .active_obstacles(obstacles)
            .filter(|o| near(&o.position, o.radius, true))
            .cloned()
            .collect();

        Self {
            model: model.clone(),
            gates,
            obstacles,
            bounds,
            weights: PenaltyWeights {
                linear: config.penalty_linear,
                quadratic: config.penalty_quadratic,
            },
        }
    }

    pub fn gates(&self) -> &[GateState] {
        &self.gates
    }

    pub fn obstacles(&self) -> &[ObstacleState] {
        &self.obstacles
    }

    /// Minimum clearance against the selected geometry
    pub fn clearance(&self, position: &Vector3<f64>) -> Clearance {
        self.model.min_clearance(position, &self.gates, &self.obstacles)
    }

    /// Penalty and violation summary at a state
    pub fn evaluate(&self, x: &StateVector) -> ConstraintEvaluation {
        let mut eval = ConstraintEvaluation::default();
        let p = position_of(x);
        self.for_each_clearance(&p, |h| eval.add(h, &self.weights));
        self.for_each_bound(x, |h, _, _| eval.add(h, &self.weights));
        eval
    }

    /// Gauss-Newton penalty model at a state
    pub fn linearize(&self, x: &StateVector) -> PenaltyModel {
        let mut model = PenaltyModel::zero();
        let p = position_of(x);

        let mut values = Vec::new();
        self.for_each_clearance(&p, |h| values.push(h));
        if values.iter().any(|h| *h < 0.0) {
            // Central differences, one position axis at a time
            let mut plus = Vec::with_capacity(values.len());
            let mut minus = Vec::with_capacity(values.len());
            let mut grads = vec![StateVector::zeros(); values.len()];
            for axis in 0..3 {
                let mut e = Vector3::zeros();
                e[axis] = GRADIENT_STEP;
                plus.clear();
                minus.clear();
                self.for_each_clearance(&(p + e), |h| plus.push(h));
                self.for_each_clearance(&(p - e), |h| minus.push(h));
                for (j, g) in grads.iter_mut().enumerate() {
                    g[idx::POS + axis] = (plus[j] - minus[j]) / (2.0 * GRADIENT_STEP);
                }
            }
            for (h, dh) in values.iter().zip(&grads) {
                model.add(*h, dh, &self.weights);
            }
        }

        self.for_each_bound(x, |h, i, sign| {
            let mut dh = StateVector::zeros();
            dh[i] = sign;
            model.add(h, &dh, &self.weights);
        });
        model
    }

    /// Calls `f(h)` for every clearance constraint, in a fixed order
    fn for_each_clearance(&self, p: &Vector3<f64>, mut f: impl FnMut(f64)) {
        for obstacle in &self.obstacles {
            f(obstacle_clearance(&self.model.body, p, obstacle));
        }
        for gate in &self.gates {
            for bar in FrameBar::ALL {
                f(frame_bar_clearance(&self.model.body, &self.model.frame, p, gate, bar));
            }
        }
    }

    /// Calls `f(h, state_index, dh/dx_i)` for every command bound
    fn for_each_bound(&self, x: &StateVector, mut f: impl FnMut(f64, usize, f64)) {
        let [lo, hi] = self.bounds.thrust;
        let thrust = x[idx::THRUST_CMD];
        f(thrust - lo, idx::THRUST_CMD, 1.0);
        f(hi - thrust, idx::THRUST_CMD, -1.0);
        for i in idx::RPY_CMD..idx::RPY_CMD + 3 {
            f(self.bounds.attitude - x[i], i, -1.0);
            f(self.bounds.attitude + x[i], i, 1.0);
        }
    }
}
