//! Gate-sequence trajectory planner
//!
//! Builds the reference the MPC tracks: a timed waypoint sequence running
//! from the drone through every upcoming gate. Each gate contributes approach
//! points in front of the aperture, a through-gate point with a velocity hint
//! along the passage direction, and exit points behind it. Gate-specific
//! distances, height offsets and positional shifts come from per-gate tables.
//!
//! The planner also owns the replanning state machine:
//!
//! ```text
//!   Tracking ──should_replan / gate advance──▶ Replanning
//!   Replanning ──trajectory committed──▶ Tracking
//!   Tracking ──final gate exit passed──▶ Extending (stop and hold)
//! ```

use log::{debug, info};
use nalgebra::Vector3;
use thiserror::Error;

use racing_core::dynamics::DroneState;
use racing_core::geometry::GateState;
use racing_core::up;

use crate::config::{PlannerConfig, ReplanningConfig};
use crate::trajectory::{Trajectory, Waypoint, WaypointPhase};

/// Planning errors
#[derive(Debug, Error, PartialEq)]
pub enum PlanningError {
    #[error("No gates to plan through")]
    NoGates,
    #[error("Gate index {0} appears more than once")]
    DuplicateGate(usize),
    #[error("Gate indices out of course order: {previous} listed before {next}")]
    NonMonotonicGates { previous: usize, next: usize },
    #[error("Gate {0} has a non-finite pose")]
    NonFiniteGate(usize),
    #[error("Drone state is not finite")]
    NonFiniteState,
    #[error("Target gate {target} is beyond the last observed gate {last}")]
    TargetOutOfRange { target: usize, last: usize },
    #[error("Waypoint times are not strictly increasing at waypoint {0}")]
    NonMonotonicTiming(usize),
    #[error("Trajectory has a non-finite waypoint")]
    NonFiniteWaypoint,
    #[error("Trajectory has no waypoints")]
    EmptyTrajectory,
}

/// Replanning state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlannerPhase {
    /// Following the committed trajectory
    Tracking,
    /// A new trajectory is being generated
    Replanning,
    /// Course finished, holding on the terminal extension
    Extending,
}

/// Why a replan was requested
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReplanReason {
    /// Tracking error exceeded the active threshold
    Deviation { deviation: f64, threshold: f64 },
    /// A gate moved since the trajectory was built
    GateMoved { gate: usize, shift: f64 },
    /// The target gate advanced
    GateAdvanced { gate: Option<usize> },
}

/// Gate-sequence trajectory planner
#[derive(Debug, Clone)]
pub struct TrajectoryPlanner {
    config: PlannerConfig,
    replanning: ReplanningConfig,
    phase: PlannerPhase,
}

impl TrajectoryPlanner {
    pub fn new(config: PlannerConfig, replanning: ReplanningConfig) -> Self {
        Self {
            config,
            replanning,
            phase: PlannerPhase::Tracking,
        }
    }

    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    pub fn phase(&self) -> PlannerPhase {
        self.phase
    }

    /// Tracking → Replanning
    pub fn begin_replan(&mut self, reason: ReplanReason) {
        if self.phase == PlannerPhase::Tracking {
            debug!("Replanning: {:?}", reason);
            self.phase = PlannerPhase::Replanning;
        }
    }

    /// Replanning → Tracking once a new trajectory is installed
    pub fn commit(&mut self) {
        if self.phase == PlannerPhase::Replanning {
            self.phase = PlannerPhase::Tracking;
        }
    }

    /// Replanning → Tracking without a new trajectory
    pub fn abort_replan(&mut self) {
        self.commit();
    }

    pub fn reset(&mut self) {
        self.phase = PlannerPhase::Tracking;
    }

    /// Generate a trajectory through every gate from `target_gate` on
    ///
    /// `gates` must be listed in course order. The gate version is carried
    /// over from `previous` unless the observed gate geometry changed.
    pub fn generate(
        &self,
        gates: &[GateState],
        target_gate: usize,
        state: &DroneState,
        previous: Option<&Trajectory>,
        tick: u64,
    ) -> Result<Trajectory, PlanningError> {
        validate_gates(gates)?;
        if !state.is_finite() {
            return Err(PlanningError::NonFiniteState);
        }
        let upcoming: Vec<&GateState> = gates.iter().filter(|g| g.index >= target_gate).collect();
        if upcoming.is_empty() {
            let last = gates.last().map_or(0, |g| g.index);
            return Err(PlanningError::TargetOutOfRange { target: target_gate, last });
        }
        let final_gate = gates.last().map(|g| g.index);

        let mut waypoints = vec![Waypoint {
            position: state.position,
            velocity: Some(state.velocity),
            time: 0.0,
            phase: WaypointPhase::Transition,
            gate: None,
        }];

        for (k, gate) in upcoming.iter().enumerate() {
            let is_final = Some(gate.index) == final_gate;
            self.push_gate_section(&mut waypoints, gate, k == 0, is_final, state);
        }

        let momentum = self.insert_momentum_waypoint(&mut waypoints, state);
        self.allocate_times(&mut waypoints, momentum.then_some(state.speed()));

        let gate_version = match previous {
            Some(prev) if same_geometry(prev, gates) => prev.gate_version,
            Some(prev) => prev.gate_version + 1,
            None => 0,
        };

        let trajectory = Trajectory::new(waypoints, tick, gate_version, gates, Some(upcoming[0].index))?;
        debug!(
            "Generated trajectory: {} waypoints, {:.2} s, gates {}..={}",
            trajectory.waypoints().len(),
            trajectory.duration(),
            upcoming[0].index,
            upcoming[upcoming.len() - 1].index
        );
        Ok(trajectory)
    }

    /// Stop-and-hold trajectory for the end of the course
    ///
    /// Decelerates uniformly along the current velocity over the configured
    /// stop time, then holds position.
    pub fn extend(&mut self, state: &DroneState, previous: Option<&Trajectory>, tick: u64) -> Result<Trajectory, PlanningError> {
        if !state.is_finite() {
            return Err(PlanningError::NonFiniteState);
        }
        let stop_time = self.config.terminal_stop_time.max(self.config.min_segment_duration);
        let stop = state.position + state.velocity * (0.5 * stop_time);

        let mut waypoints = vec![
            Waypoint {
                position: state.position,
                velocity: Some(state.velocity),
                time: 0.0,
                phase: WaypointPhase::Extension,
                gate: None,
            },
            Waypoint {
                position: stop,
                velocity: Some(Vector3::zeros()),
                time: stop_time,
                phase: WaypointPhase::Extension,
                gate: None,
            },
        ];
        if stop_time < self.config.min_total_duration {
            waypoints.push(Waypoint {
                position: stop,
                velocity: Some(Vector3::zeros()),
                time: self.config.min_total_duration,
                phase: WaypointPhase::Extension,
                gate: None,
            });
        }

        let (gate_version, gates) = match previous {
            Some(prev) => (prev.gate_version, prev.gate_positions.clone()),
            None => (0, Vec::new()),
        };
        let mut trajectory = Trajectory::new(waypoints, tick, gate_version, &[], None)?;
        trajectory.gate_positions = gates;

        if self.phase != PlannerPhase::Extending {
            info!("Course complete, extending with a {:.2} s stop", stop_time);
        }
        self.phase = PlannerPhase::Extending;
        Ok(trajectory)
    }

    /// Whether the drone has flown the final gate's extension segment
    ///
    /// A trajectory through the final gate is tracked to its last waypoint,
    /// reached either in time or by distance past the gate plane. A
    /// `target_gate` of `None` (course complete) only extends right away when
    /// the active trajectory does not cover the final gate.
    pub fn should_extend(
        &self,
        trajectory: &Trajectory,
        elapsed: f64,
        state: &DroneState,
        target_gate: Option<usize>,
        final_gate: Option<&GateState>,
    ) -> bool {
        if self.phase == PlannerPhase::Extending {
            return false;
        }
        let Some(last) = final_gate.filter(|g| trajectory.covers_gate(g.index)) else {
            return target_gate.is_none();
        };
        if target_gate.map_or(false, |t| t != last.index) {
            return false;
        }
        elapsed >= trajectory.duration()
            || last.along_normal(&state.position) >= self.config.exit_distance.get(last.index)
    }

    /// Whether the drone is close to `gate` and flying towards it
    pub fn is_approaching_gate(&self, state: &DroneState, gate: &GateState) -> bool {
        let to_gate = gate.position - state.position;
        let distance = to_gate.norm();
        let speed = state.speed();
        if distance > self.replanning.near_gate_distance || speed < 1e-6 {
            return false;
        }
        if distance < 1e-9 {
            return true;
        }
        state.velocity.dot(&to_gate) / (speed * distance) > self.replanning.alignment_threshold
    }

    /// Deviation threshold in effect for this state
    pub fn deviation_threshold(&self, state: &DroneState, next_gate: Option<&GateState>) -> f64 {
        match next_gate {
            Some(gate) if self.is_approaching_gate(state, gate) => self.replanning.near_gate_threshold,
            _ => self.replanning.deviation_threshold,
        }
    }

    /// Reason to replan, if any
    ///
    /// `elapsed` is the time since the trajectory started. Compares the
    /// actual position with the expected one, and the observed upcoming gates
    /// with the ones the trajectory was built from.
    pub fn replan_reason(
        &self,
        state: &DroneState,
        trajectory: &Trajectory,
        elapsed: f64,
        gates: &[GateState],
        target_gate: Option<usize>,
    ) -> Option<ReplanReason> {
        if self.phase == PlannerPhase::Extending {
            return None;
        }
        let next_gate = target_gate.and_then(|t| gates.iter().find(|g| g.index == t));
        let threshold = self.deviation_threshold(state, next_gate);
        let deviation = (state.position - trajectory.position_at(elapsed)).norm();
        if deviation > threshold {
            return Some(ReplanReason::Deviation { deviation, threshold });
        }

        let from_gate = target_gate?;
        match trajectory.max_gate_shift(gates, from_gate) {
            Some((gate, shift)) if shift > self.replanning.gate_shift_threshold => {
                Some(ReplanReason::GateMoved { gate, shift })
            }
            _ => None,
        }
    }

    pub fn should_replan(
        &self,
        state: &DroneState,
        trajectory: &Trajectory,
        elapsed: f64,
        gates: &[GateState],
        target_gate: Option<usize>,
    ) -> bool {
        self.replan_reason(state, trajectory, elapsed, gates, target_gate).is_some()
    }

    /// Approach, through-gate and exit waypoints for one gate
    fn push_gate_section(
        &self,
        waypoints: &mut Vec<Waypoint>,
        gate: &GateState,
        first: bool,
        is_final: bool,
        state: &DroneState,
    ) {
        let cfg = &self.config;
        let i = gate.index;
        let normal = gate.normal();
        let center = gate.local_to_world(&cfg.gate_offset.get(i));

        let approach_distance = cfg.approach_distance.get(i);
        let approach_height = cfg.approach_height_offset.get(i);
        let approach: Vec<Vector3<f64>> = (0..cfg.approach_points)
            .map(|j| {
                let frac = (cfg.approach_points - j) as f64 / cfg.approach_points as f64;
                center - normal * (approach_distance * frac) + up() * (approach_height * frac)
            })
            // Approach points the drone has already flown past are dropped
            .filter(|p| !first || (p - state.position).dot(&normal) > 0.0)
            .collect();

        // Transition points from the previous exit to this gate
        if !first {
            if let Some(prev) = waypoints.last().map(|w| w.position) {
                let target = approach.first().copied().unwrap_or(center);
                let n = cfg.transition_points;
                for j in 1..=n {
                    let alpha = j as f64 / (n + 1) as f64;
                    waypoints.push(Waypoint {
                        position: prev + (target - prev) * alpha,
                        velocity: None,
                        time: 0.0,
                        phase: WaypointPhase::Transition,
                        gate: Some(i),
                    });
                }
            }
        }

        waypoints.extend(approach.into_iter().map(|position| Waypoint {
            position,
            velocity: None,
            time: 0.0,
            phase: WaypointPhase::Approach,
            gate: Some(i),
        }));

        waypoints.push(Waypoint {
            position: center,
            velocity: Some(normal * cfg.speeds.approach_speed),
            time: 0.0,
            phase: WaypointPhase::ThroughGate,
            gate: Some(i),
        });

        // The final gate has no next approach, so it only gets extension points
        let exit_distance = cfg.exit_distance.get(i);
        let exit_height = cfg.exit_height_offset.get(i);
        let (count, phase) = if is_final {
            (cfg.final_extension_points, WaypointPhase::Extension)
        } else {
            (cfg.exit_points, WaypointPhase::Exit)
        };
        for j in 1..=count {
            let frac = j as f64 / count as f64;
            waypoints.push(Waypoint {
                position: center + normal * (exit_distance * frac) + up() * (exit_height * frac),
                velocity: None,
                time: 0.0,
                phase,
                gate: Some(i),
            });
        }
    }

    /// Carry the observed velocity into the start of the trajectory
    ///
    /// Returns whether a momentum waypoint was inserted at index 1.
    fn insert_momentum_waypoint(&self, waypoints: &mut Vec<Waypoint>, state: &DroneState) -> bool {
        let m = &self.config.momentum;
        let speed = state.speed();
        if speed <= m.velocity_threshold || waypoints.len() < 2 {
            return false;
        }
        let direction = state.velocity / speed;
        let next = waypoints[1].position;
        let distance = (speed * m.blend_time)
            .min(m.max_distance)
            .min(0.5 * (next - state.position).norm());
        if distance < 1e-6 {
            return false;
        }

        let position = state.position + direction * distance;
        let towards_next = (next - position).try_normalize(1e-9).unwrap_or(direction);
        let hint = (state.velocity + towards_next * speed) * 0.5;
        waypoints.insert(
            1,
            Waypoint {
                position,
                velocity: Some(hint),
                time: 0.0,
                phase: WaypointPhase::Transition,
                gate: None,
            },
        );
        true
    }

    /// Fill in arrival times from the speed profile
    ///
    /// `momentum_speed` is the speed used for the momentum segment, if one
    /// was inserted.
    fn allocate_times(&self, waypoints: &mut [Waypoint], momentum_speed: Option<f64>) {
        let cfg = &self.config;
        let speeds = &cfg.speeds;

        // durations[k] is the time from waypoint k-1 to waypoint k
        let mut durations = vec![0.0; waypoints.len()];
        for k in 1..waypoints.len() {
            let d = (waypoints[k].position - waypoints[k - 1].position).norm();
            let speed = match (k, momentum_speed) {
                (1, Some(v)) => v,
                _ => match waypoints[k].phase {
                    WaypointPhase::Approach | WaypointPhase::ThroughGate => speeds.approach_speed,
                    WaypointPhase::Exit | WaypointPhase::Extension => speeds.exit_speed,
                    WaypointPhase::Transition if d > speeds.high_speed_distance => speeds.high_speed,
                    WaypointPhase::Transition => speeds.base_speed,
                },
            };
            durations[k] = (d / speed).max(cfg.min_segment_duration);
        }

        // Gate-to-gate floor
        let through: Vec<usize> = waypoints
            .iter()
            .enumerate()
            .filter(|(_, w)| w.phase == WaypointPhase::ThroughGate)
            .map(|(k, _)| k)
            .collect();
        for pair in through.windows(2) {
            let section = &mut durations[pair[0] + 1..=pair[1]];
            let total: f64 = section.iter().sum();
            if total < cfg.min_gate_duration {
                let scale = cfg.min_gate_duration / total;
                section.iter_mut().for_each(|d| *d *= scale);
            }
        }

        let total: f64 = durations.iter().sum();
        if total > 0.0 && total < cfg.min_total_duration {
            let scale = cfg.min_total_duration / total;
            durations.iter_mut().for_each(|d| *d *= scale);
        }

        let mut t = 0.0;
        for (w, d) in waypoints.iter_mut().zip(durations) {
            t += d;
            w.time = t;
        }
        // Rescaled sums can land an ulp short of the floor
        if let [_, .., last] = waypoints {
            last.time = last.time.max(cfg.min_total_duration);
        }
    }
}

/// Gates must be finite, unique and listed in course order
pub fn validate_gates(gates: &[GateState]) -> Result<(), PlanningError> {
    if gates.is_empty() {
        return Err(PlanningError::NoGates);
    }
    for gate in gates {
        if !gate.is_finite() {
            return Err(PlanningError::NonFiniteGate(gate.index));
        }
    }
    for pair in gates.windows(2) {
        if pair[1].index == pair[0].index {
            return Err(PlanningError::DuplicateGate(pair[0].index));
        }
        if pair[1].index < pair[0].index {
            return Err(PlanningError::NonMonotonicGates {
                previous: pair[0].index,
                next: pair[1].index,
            });
        }
    }
    Ok(())
}

fn same_geometry(trajectory: &Trajectory, gates: &[GateState]) -> bool {
    trajectory.gate_positions.len() == gates.len()
        && trajectory
            .gate_positions
            .iter()
            .zip(gates)
            .all(|((index, position), gate)| *index == gate.index && *position == gate.position)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PerGate;
    use approx::assert_relative_eq;

    fn course() -> Vec<GateState> {
        vec![
            GateState::new(0, Vector3::new(0.0, 1.0, 1.0), 0.0, 0.225),
            GateState::new(1, Vector3::new(1.0, 2.5, 1.2), 0.0, 0.225),
            GateState::new(2, Vector3::new(0.0, 4.0, 1.0), 0.0, 0.225),
        ]
    }

    fn planner() -> TrajectoryPlanner {
        TrajectoryPlanner::new(PlannerConfig::default(), ReplanningConfig::default())
    }

    fn start() -> DroneState {
        DroneState::at_rest(Vector3::new(0.0, 0.0, 1.0))
    }

    #[test]
    fn test_waypoints_cover_every_gate() {
        let traj = planner().generate(&course(), 0, &start(), None, 0).unwrap();
        for gate in course() {
            let through = traj
                .waypoints()
                .iter()
                .find(|w| w.phase == WaypointPhase::ThroughGate && w.gate == Some(gate.index))
                .unwrap();
            assert_relative_eq!(through.position, gate.position, epsilon = 1e-12);
            assert_relative_eq!(through.velocity.unwrap(), gate.normal() * 0.9, epsilon = 1e-12);
        }
        assert_eq!(traj.start_gate, Some(0));
    }

    #[test]
    fn test_times_strictly_increase() {
        let traj = planner().generate(&course(), 0, &start(), None, 0).unwrap();
        for pair in traj.waypoints().windows(2) {
            assert!(pair[1].time > pair[0].time);
        }
        assert!(traj.duration() >= PlannerConfig::default().min_total_duration);
    }

    #[test]
    fn test_min_gate_duration_floor() {
        let mut config = PlannerConfig::default();
        config.min_gate_duration = 5.0;
        let planner = TrajectoryPlanner::new(config, ReplanningConfig::default());
        let traj = planner.generate(&course(), 0, &start(), None, 0).unwrap();
        let t0 = traj.gate_time(0).unwrap();
        let t1 = traj.gate_time(1).unwrap();
        assert_relative_eq!(t1 - t0, 5.0, epsilon = 1e-9);
    }

    #[test]
    fn test_final_gate_gets_extension_points() {
        let mut config = PlannerConfig::default();
        config.exit_points = 2;
        config.transition_points = 1;
        config.final_extension_points = 1;
        config.exit_distance = PerGate::with_overrides(0.3, vec![0.3, 0.3, 2.0]);
        let planner = TrajectoryPlanner::new(config, ReplanningConfig::default());
        let traj = planner.generate(&course(), 0, &start(), None, 0).unwrap();

        let exits_after = |gate: usize| {
            traj.waypoints()
                .iter()
                .filter(|w| w.gate == Some(gate) && matches!(w.phase, WaypointPhase::Exit | WaypointPhase::Extension))
                .count()
        };
        assert_eq!(exits_after(0), 2);
        assert_eq!(exits_after(2), 1);

        let last = traj.waypoints().last().unwrap();
        assert_eq!(last.phase, WaypointPhase::Extension);
        assert_relative_eq!(last.position, course()[2].position + Vector3::new(0.0, 2.0, 0.0), epsilon = 1e-12);
    }

    #[test]
    fn test_gate_offset_shifts_section() {
        let mut config = PlannerConfig::default();
        config.gate_offset = PerGate::with_overrides(Vector3::zeros(), vec![Vector3::zeros(), Vector3::new(0.1, 0.0, -0.05)]);
        let planner = TrajectoryPlanner::new(config, ReplanningConfig::default());
        let traj = planner.generate(&course(), 0, &start(), None, 0).unwrap();
        let through = traj
            .waypoints()
            .iter()
            .find(|w| w.phase == WaypointPhase::ThroughGate && w.gate == Some(1))
            .unwrap();
        assert_relative_eq!(through.position, Vector3::new(1.1, 2.5, 1.15), epsilon = 1e-12);
    }

    #[test]
    fn test_target_gate_skips_passed_gates() {
        let traj = planner().generate(&course(), 1, &start(), None, 7).unwrap();
        assert!(!traj.covers_gate(0));
        assert!(traj.covers_gate(1) && traj.covers_gate(2));
        assert_eq!(traj.generated_at_tick, 7);
    }

    #[test]
    fn test_invalid_gate_sequences() {
        let p = planner();
        assert_eq!(p.generate(&[], 0, &start(), None, 0).unwrap_err(), PlanningError::NoGates);

        let mut gates = course();
        gates.swap(0, 1);
        assert!(matches!(
            p.generate(&gates, 0, &start(), None, 0),
            Err(PlanningError::NonMonotonicGates { previous: 1, next: 0 })
        ));

        let mut gates = course();
        gates[1].index = 0;
        assert_eq!(p.generate(&gates, 0, &start(), None, 0).unwrap_err(), PlanningError::DuplicateGate(0));

        assert!(matches!(
            p.generate(&course(), 3, &start(), None, 0),
            Err(PlanningError::TargetOutOfRange { target: 3, last: 2 })
        ));
    }

    #[test]
    fn test_momentum_waypoint_follows_velocity() {
        let mut state = start();
        state.velocity = Vector3::new(1.0, 0.0, 0.0);
        let traj = planner().generate(&course(), 0, &state, None, 0).unwrap();
        let w = traj.waypoints();
        assert_relative_eq!(w[0].velocity.unwrap(), state.velocity);
        // Momentum point lies along the current velocity
        let offset = w[1].position - state.position;
        assert!(offset.x > 0.0);
        assert_relative_eq!(offset.y, 0.0, epsilon = 1e-12);
        assert!(offset.norm() <= PlannerConfig::default().momentum.max_distance + 1e-12);
        // Reference starts out moving with the drone
        assert_relative_eq!(traj.sample(0.0).velocity, state.velocity, epsilon = 1e-12);
    }

    #[test]
    fn test_no_momentum_waypoint_when_slow() {
        let mut state = start();
        state.velocity = Vector3::new(0.1, 0.0, 0.0);
        let traj = planner().generate(&course(), 0, &state, None, 0).unwrap();
        assert_eq!(traj.waypoints()[1].phase, WaypointPhase::Approach);
    }

    #[test]
    fn test_gate_version_follows_geometry() {
        let p = planner();
        let first = p.generate(&course(), 0, &start(), None, 0).unwrap();
        let same = p.generate(&course(), 0, &start(), Some(&first), 5).unwrap();
        assert_eq!(same.gate_version, first.gate_version);
        let mut moved = course();
        moved[2].position.z += 0.2;
        let next = p.generate(&moved, 0, &start(), Some(&first), 10).unwrap();
        assert_eq!(next.gate_version, first.gate_version + 1);
    }

    #[test]
    fn test_state_machine_transitions() {
        let mut p = planner();
        assert_eq!(p.phase(), PlannerPhase::Tracking);
        p.begin_replan(ReplanReason::GateAdvanced { gate: Some(1) });
        assert_eq!(p.phase(), PlannerPhase::Replanning);
        p.commit();
        assert_eq!(p.phase(), PlannerPhase::Tracking);

        let mut state = start();
        state.velocity = Vector3::new(0.0, 1.0, 0.0);
        let hold = p.extend(&state, None, 100).unwrap();
        assert_eq!(p.phase(), PlannerPhase::Extending);
        assert_relative_eq!(hold.sample(100.0).velocity.norm(), 0.0);
        assert!(hold.position_at(hold.duration()).y > state.position.y);
        // No replans while extending
        let far = DroneState::at_rest(Vector3::new(10.0, 10.0, 1.0));
        assert!(!p.should_replan(&far, &hold, 0.0, &course(), None));
    }

    #[test]
    fn test_should_extend_after_final_exit() {
        let p = planner();
        let gates = course();
        let last = &gates[2];
        let traj = p.generate(&gates, 2, &start(), None, 0).unwrap();
        let end = traj.duration();
        let exit = PlannerConfig::default().exit_distance.get(2);

        assert!(!p.should_extend(&traj, end - 0.01, &start(), Some(2), Some(last)));
        assert!(p.should_extend(&traj, end, &start(), Some(2), Some(last)));
        assert!(!p.should_extend(&traj, 100.0, &start(), Some(1), Some(last)));

        // Course complete: the final exit is still flown
        let mut through = DroneState::at_rest(last.position + last.normal() * 0.05);
        through.velocity = last.normal() * 1.5;
        assert!(!p.should_extend(&traj, 0.5, &through, None, Some(last)));
        let past = DroneState::at_rest(last.position + last.normal() * (exit + 0.01));
        assert!(p.should_extend(&traj, 0.5, &past, None, Some(last)));

        // Nothing left to track
        let mut hold_planner = planner();
        let hold = hold_planner.extend(&start(), None, 0).unwrap();
        assert!(p.should_extend(&hold, 0.0, &start(), None, Some(last)));
        assert!(!hold_planner.should_extend(&hold, 0.0, &start(), None, Some(last)));
    }

    #[test]
    fn test_looser_threshold_near_gate() {
        let p = planner();
        let gate = &course()[0];
        let mut state = DroneState::at_rest(Vector3::new(0.0, 0.6, 1.0));
        state.velocity = Vector3::new(0.0, 1.0, 0.0);
        assert!(p.is_approaching_gate(&state, gate));
        assert_relative_eq!(p.deviation_threshold(&state, Some(gate)), 0.45);

        state.velocity = Vector3::new(1.0, 0.0, 0.0);
        assert!(!p.is_approaching_gate(&state, gate));
        assert_relative_eq!(p.deviation_threshold(&state, Some(gate)), 0.25);
    }
}
