//! Time-parameterised reference trajectories
//!
//! A [`Trajectory`] is an immutable sequence of timed waypoints through the
//! gate course. It is sampled with a cubic Hermite spline: a waypoint's
//! velocity hint is its tangent when present, otherwise a Catmull-Rom tangent
//! from its neighbours is used. After the last waypoint the reference holds
//! position.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use racing_core::geometry::GateState;

use crate::ocp::ReferencePoint;
use crate::planner::PlanningError;

/// Gate-relative role of a waypoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WaypointPhase {
    /// Lining up in front of a gate
    Approach,
    /// Centre of the gate aperture
    ThroughGate,
    /// Leaving a gate towards the next one
    Exit,
    /// Between gates, or from the drone to the first gate
    Transition,
    /// Past the final gate
    Extension,
}

/// A timed point on the reference
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Waypoint {
    /// Position [m]
    pub position: Vector3<f64>,
    /// Desired velocity at this point [m/s]
    pub velocity: Option<Vector3<f64>>,
    /// Arrival time from trajectory start [s]
    pub time: f64,
    pub phase: WaypointPhase,
    /// Gate this waypoint belongs to
    pub gate: Option<usize>,
}

/// Position and velocity sampled from a trajectory
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrajectorySample {
    pub position: Vector3<f64>,
    pub velocity: Vector3<f64>,
}

/// Reference trajectory through the course
#[derive(Debug, Clone)]
pub struct Trajectory {
    waypoints: Vec<Waypoint>,
    /// Control tick at which the trajectory was generated
    pub generated_at_tick: u64,
    /// Version of the gate geometry this trajectory was built from
    pub gate_version: u64,
    /// Gate positions (by index) used for generation
    pub gate_positions: Vec<(usize, Vector3<f64>)>,
    /// First gate the trajectory flies through
    pub start_gate: Option<usize>,
}

impl Trajectory {
    /// Build a trajectory, checking that waypoint times strictly increase
    pub fn new(
        waypoints: Vec<Waypoint>,
        generated_at_tick: u64,
        gate_version: u64,
        gates: &[GateState],
        start_gate: Option<usize>,
    ) -> Result<Self, PlanningError> {
        if waypoints.is_empty() {
            return Err(PlanningError::EmptyTrajectory);
        }
        for (i, pair) in waypoints.windows(2).enumerate() {
            if !(pair[1].time > pair[0].time) {
                return Err(PlanningError::NonMonotonicTiming(i + 1));
            }
        }
        if waypoints
            .iter()
            .any(|w| !w.time.is_finite() || w.position.iter().any(|v| !v.is_finite()))
        {
            return Err(PlanningError::NonFiniteWaypoint);
        }
        Ok(Self {
            waypoints,
            generated_at_tick,
            gate_version,
            gate_positions: gates.iter().map(|g| (g.index, g.position)).collect(),
            start_gate,
        })
    }

    pub fn waypoints(&self) -> &[Waypoint] {
        &self.waypoints
    }

    /// Total duration [s]
    pub fn duration(&self) -> f64 {
        self.waypoints.last().map_or(0.0, |w| w.time)
    }

    /// Time at which the first waypoint with `phase` is reached
    pub fn phase_time(&self, phase: WaypointPhase) -> Option<f64> {
        self.waypoints.iter().find(|w| w.phase == phase).map(|w| w.time)
    }

    /// Time of the through-gate waypoint of `gate`
    pub fn gate_time(&self, gate: usize) -> Option<f64> {
        self.waypoints
            .iter()
            .find(|w| w.phase == WaypointPhase::ThroughGate && w.gate == Some(gate))
            .map(|w| w.time)
    }

    /// Whether this trajectory flies through `gate`
    pub fn covers_gate(&self, gate: usize) -> bool {
        self.gate_time(gate).is_some()
    }

    /// Position at `t` seconds after trajectory start
    pub fn position_at(&self, t: f64) -> Vector3<f64> {
        self.sample(t).position
    }

    /// Position and velocity at `t` seconds after trajectory start
    pub fn sample(&self, t: f64) -> TrajectorySample {
        let n = self.waypoints.len();
        let first = &self.waypoints[0];
        let last = &self.waypoints[n - 1];
        if n == 1 || t >= last.time {
            return TrajectorySample { position: last.position, velocity: Vector3::zeros() };
        }
        if t <= first.time {
            return TrajectorySample {
                position: first.position,
                velocity: self.tangent(0),
            };
        }

        // Segment [i, i+1] containing t
        let i = self.waypoints.partition_point(|w| w.time <= t) - 1;
        let (w0, w1) = (&self.waypoints[i], &self.waypoints[i + 1]);
        let h = w1.time - w0.time;
        let s = (t - w0.time) / h;
        let (m0, m1) = (self.tangent(i) * h, self.tangent(i + 1) * h);

        let s2 = s * s;
        let s3 = s2 * s;
        let position = w0.position * (2.0 * s3 - 3.0 * s2 + 1.0)
            + m0 * (s3 - 2.0 * s2 + s)
            + w1.position * (-2.0 * s3 + 3.0 * s2)
            + m1 * (s3 - s2);
        let velocity = (w0.position * (6.0 * s2 - 6.0 * s)
            + m0 * (3.0 * s2 - 4.0 * s + 1.0)
            + w1.position * (-6.0 * s2 + 6.0 * s)
            + m1 * (3.0 * s2 - 2.0 * s))
            / h;
        TrajectorySample { position, velocity }
    }

    /// Spline tangent at waypoint `i`
    fn tangent(&self, i: usize) -> Vector3<f64> {
        let w = &self.waypoints[i];
        if let Some(v) = w.velocity {
            return v;
        }
        let n = self.waypoints.len();
        if i == 0 || i + 1 == n {
            // Rest at the ends
            return Vector3::zeros();
        }
        let (prev, next) = (&self.waypoints[i - 1], &self.waypoints[i + 1]);
        (next.position - prev.position) / (next.time - prev.time)
    }

    /// N+1 reference nodes starting `t0` seconds into the trajectory
    pub fn reference_horizon(&self, t0: f64, num_steps: usize, dt: f64, thrust: f64) -> Vec<ReferencePoint> {
        (0..=num_steps)
            .map(|k| {
                let sample = self.sample(t0 + k as f64 * dt);
                ReferencePoint {
                    position: sample.position,
                    velocity: sample.velocity,
                    thrust,
                    yaw: 0.0,
                }
            })
            .collect()
    }

    /// Largest displacement of a gate this trajectory was built from
    ///
    /// Only gates at or after `from_gate` that are still observed are compared.
    pub fn max_gate_shift(&self, gates: &[GateState], from_gate: usize) -> Option<(usize, f64)> {
        self.gate_positions
            .iter()
            .filter(|(index, _)| *index >= from_gate)
            .filter_map(|(index, planned)| {
                gates
                    .iter()
                    .find(|g| g.index == *index)
                    .map(|g| (*index, (g.position - planned).norm()))
            })
            .fold(None, |best: Option<(usize, f64)>, cur| match best {
                Some(b) if b.1 >= cur.1 => Some(b),
                _ => Some(cur),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn waypoint(x: f64, time: f64, velocity: Option<Vector3<f64>>) -> Waypoint {
        Waypoint {
            position: Vector3::new(x, 0.0, 1.0),
            velocity,
            time,
            phase: WaypointPhase::Transition,
            gate: None,
        }
    }

    fn line() -> Trajectory {
        Trajectory::new(
            vec![
                waypoint(0.0, 0.0, None),
                waypoint(1.0, 1.0, None),
                waypoint(2.0, 2.0, None),
            ],
            0,
            0,
            &[],
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_sample_hits_waypoints() {
        let traj = line();
        for w in traj.waypoints() {
            assert_relative_eq!(traj.position_at(w.time), w.position, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_sample_uses_catmull_rom_tangent() {
        let traj = line();
        let mid = traj.sample(1.0);
        // Central tangent: (2 - 0) / (2 - 0)
        assert_relative_eq!(mid.velocity.x, 1.0, epsilon = 1e-12);
        // Ends come to rest
        assert_relative_eq!(traj.sample(0.0).velocity.norm(), 0.0);
    }

    #[test]
    fn test_sample_holds_after_end() {
        let traj = line();
        let after = traj.sample(10.0);
        assert_relative_eq!(after.position.x, 2.0);
        assert_relative_eq!(after.velocity.norm(), 0.0);
    }

    #[test]
    fn test_velocity_hint_is_tangent() {
        let traj = Trajectory::new(
            vec![
                waypoint(0.0, 0.0, Some(Vector3::new(2.0, 0.0, 0.0))),
                waypoint(1.0, 1.0, None),
            ],
            0,
            0,
            &[],
            None,
        )
        .unwrap();
        assert_relative_eq!(traj.sample(0.0).velocity.x, 2.0);
        let early = traj.sample(1e-6);
        assert_relative_eq!(early.velocity.x, 2.0, epsilon = 1e-4);
    }

    #[test]
    fn test_rejects_non_increasing_times() {
        let result = Trajectory::new(
            vec![waypoint(0.0, 0.0, None), waypoint(1.0, 0.0, None)],
            0,
            0,
            &[],
            None,
        );
        assert!(matches!(result, Err(PlanningError::NonMonotonicTiming(1))));
    }

    #[test]
    fn test_reference_horizon_length() {
        let traj = line();
        let reference = traj.reference_horizon(0.5, 10, 0.1, 0.3);
        assert_eq!(reference.len(), 11);
        assert_relative_eq!(reference[0].position, traj.position_at(0.5));
        assert_relative_eq!(reference[10].position, traj.position_at(1.5));
        assert_relative_eq!(reference[3].thrust, 0.3);
    }

    #[test]
    fn test_gate_shift_against_snapshot() {
        let gates = vec![
            GateState::new(0, Vector3::new(0.0, 1.0, 1.0), 0.0, 0.225),
            GateState::new(1, Vector3::new(1.0, 2.0, 1.0), 0.0, 0.225),
        ];
        let traj = Trajectory::new(vec![waypoint(0.0, 0.0, None)], 0, 0, &gates, Some(0)).unwrap();
        let mut moved = gates.clone();
        moved[1].position.x += 0.1;
        let (gate, shift) = traj.max_gate_shift(&moved, 0).unwrap();
        assert_eq!(gate, 1);
        assert_relative_eq!(shift, 0.1, epsilon = 1e-12);
        // Gates already passed are ignored
        let (_, shift) = traj.max_gate_shift(&moved, 2).unwrap_or((0, 0.0));
        assert_relative_eq!(shift, 0.0);
    }
}
