//! Cost weights and the post-replan weight scheduler
//!
//! Right after a replan the position weight is raised by a configured factor
//! and then relaxed linearly back to the steady bundle:
//!
//! ```text
//! W(k) = W_replan + (W_steady − W_replan) · min(k / K, 1),   K = ratio · replanning_frequency
//! ```

use serde::{Deserialize, Serialize};

use crate::config::{ReplanningConfig, WeightsConfig};

/// Tuning presets for the steady bundle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WeightPreset {
    Conservative,
    Balanced,
    Aggressive,
}

/// Stage cost weights (diagonal, shared by every axis of a group)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CostWeights {
    /// Position tracking
    pub q_pos: f64,
    /// Velocity tracking
    pub q_vel: f64,
    /// Roll/pitch/yaw regularisation
    pub q_rpy: f64,
    /// Thrust tracking (around the reference thrust)
    pub q_thrust: f64,
    /// Commanded thrust/attitude regularisation
    pub q_cmd: f64,
    /// Input-rate penalty
    pub r: f64,
}

impl CostWeights {
    pub fn preset(preset: WeightPreset) -> Self {
        match preset {
            WeightPreset::Conservative => Self {
                q_pos: 6.0,
                q_vel: 2.0,
                q_rpy: 1.0,
                q_thrust: 0.01,
                q_cmd: 1.0,
                r: 0.3,
            },
            WeightPreset::Balanced => Self {
                q_pos: 10.0,
                q_vel: 1.0,
                q_rpy: 0.5,
                q_thrust: 0.01,
                q_cmd: 0.5,
                r: 0.1,
            },
            WeightPreset::Aggressive => Self {
                q_pos: 20.0,
                q_vel: 0.5,
                q_rpy: 0.2,
                q_thrust: 0.01,
                q_cmd: 0.2,
                r: 0.02,
            },
        }
    }

    /// Same bundle with the position weight scaled
    pub fn with_position_factor(&self, factor: f64) -> Self {
        Self {
            q_pos: self.q_pos * factor,
            ..*self
        }
    }

    /// Component-wise linear interpolation, `alpha` = 0 gives `self`
    pub fn lerp(&self, other: &Self, alpha: f64) -> Self {
        let mix = |a: f64, b: f64| a + (b - a) * alpha;
        Self {
            q_pos: mix(self.q_pos, other.q_pos),
            q_vel: mix(self.q_vel, other.q_vel),
            q_rpy: mix(self.q_rpy, other.q_rpy),
            q_thrust: mix(self.q_thrust, other.q_thrust),
            q_cmd: mix(self.q_cmd, other.q_cmd),
            r: mix(self.r, other.r),
        }
    }

    pub fn is_valid(&self) -> bool {
        [self.q_pos, self.q_vel, self.q_rpy, self.q_thrust, self.q_cmd, self.r]
            .iter()
            .all(|w| w.is_finite() && *w >= 0.0)
    }
}

impl Default for CostWeights {
    fn default() -> Self {
        Self::preset(WeightPreset::Balanced)
    }
}

/// Scheduler mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightMode {
    /// Steady tracking
    Steady,
    /// Relaxing from the replanning bundle
    Blending { elapsed_ticks: u64 },
}

/// Selects the cost weights for each control tick
#[derive(Debug, Clone)]
pub struct WeightScheduler {
    steady: CostWeights,
    replanning: CostWeights,
    /// Blend window length [ticks]
    blend_ticks: f64,
    mode: WeightMode,
}

impl WeightScheduler {
    pub fn new(steady: CostWeights, q_pos_factor: f64, blend_ticks: f64) -> Self {
        Self {
            steady,
            replanning: steady.with_position_factor(q_pos_factor),
            blend_ticks,
            mode: WeightMode::Steady,
        }
    }

    pub fn from_config(weights: &WeightsConfig, replanning: &ReplanningConfig) -> Self {
        Self::new(
            weights.steady_weights(),
            replanning.q_pos_replanning_factor,
            replanning.weight_adjustment_ticks(),
        )
    }

    pub fn steady(&self) -> &CostWeights {
        &self.steady
    }

    pub fn replanning(&self) -> &CostWeights {
        &self.replanning
    }

    pub fn mode(&self) -> WeightMode {
        self.mode
    }

    /// Weights `elapsed` ticks after a replan
    pub fn weights_at(&self, elapsed: u64) -> CostWeights {
        let k = elapsed as f64;
        if k >= self.blend_ticks {
            return self.steady;
        }
        if elapsed == 0 {
            return self.replanning;
        }
        self.replanning.lerp(&self.steady, k / self.blend_ticks)
    }

    /// Weights for the current tick; advances the blend counter
    pub fn next_weights(&mut self) -> CostWeights {
        match self.mode {
            WeightMode::Steady => self.steady,
            WeightMode::Blending { elapsed_ticks } => {
                let weights = self.weights_at(elapsed_ticks);
                let next = elapsed_ticks + 1;
                self.mode = if next as f64 >= self.blend_ticks {
                    WeightMode::Steady
                } else {
                    WeightMode::Blending { elapsed_ticks: next }
                };
                weights
            }
        }
    }

    /// A new trajectory was committed
    pub fn notify_replan(&mut self) {
        self.mode = WeightMode::Blending { elapsed_ticks: 0 };
    }

    pub fn reset(&mut self) {
        self.mode = WeightMode::Steady;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn scheduler() -> WeightScheduler {
        WeightScheduler::new(CostWeights::default(), 2.0, 4.0)
    }

    #[test]
    fn test_replanning_bundle_scales_position_only() {
        let s = scheduler();
        assert_relative_eq!(s.replanning().q_pos, 20.0);
        assert_relative_eq!(s.replanning().q_vel, s.steady().q_vel);
        assert_relative_eq!(s.replanning().r, s.steady().r);
    }

    #[test]
    fn test_blend_endpoints_are_exact() {
        let s = scheduler();
        assert_eq!(s.weights_at(0), *s.replanning());
        assert_eq!(s.weights_at(4), *s.steady());
        assert_eq!(s.weights_at(100), *s.steady());
    }

    #[test]
    fn test_blend_is_linear() {
        let s = scheduler();
        let mid = s.weights_at(2);
        assert_relative_eq!(mid.q_pos, 15.0);
        assert!(s.weights_at(1).q_pos > s.weights_at(3).q_pos);
    }

    #[test]
    fn test_next_weights_walks_the_blend() {
        let mut s = scheduler();
        assert_eq!(s.next_weights(), *s.steady());

        s.notify_replan();
        let first = s.next_weights();
        assert_eq!(first, *s.replanning());
        for _ in 0..3 {
            s.next_weights();
        }
        assert_eq!(s.mode(), WeightMode::Steady);
        assert_eq!(s.next_weights(), *s.steady());
    }

    #[test]
    fn test_fractional_blend_window() {
        // 0.6 × 5 ticks: steady from tick 3 on
        let s = WeightScheduler::new(CostWeights::default(), 2.0, 3.0);
        assert!(s.weights_at(2).q_pos > s.steady().q_pos);
        assert_eq!(s.weights_at(3), *s.steady());
    }

    #[test]
    fn test_presets_are_ordered_by_aggressiveness() {
        let c = CostWeights::preset(WeightPreset::Conservative);
        let b = CostWeights::preset(WeightPreset::Balanced);
        let a = CostWeights::preset(WeightPreset::Aggressive);
        assert!(c.q_pos < b.q_pos && b.q_pos < a.q_pos);
        assert!(c.r > b.r && b.r > a.r);
        assert!(a.is_valid() && b.is_valid() && c.is_valid());
    }
}
