//! Signed clearance between the drone body and gates/obstacles

use std::collections::BTreeSet;

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::math::yaw_rotation;

/// Observed gate pose
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateState {
    /// Ordinal index along the course
    pub index: usize,
    /// Aperture centre [m]
    pub position: Vector3<f64>,
    /// Yaw of the gate frame [rad]
    pub yaw: f64,
    /// Half width of the aperture, centre to bar axis [m]
    pub half_width: f64,
    /// Half height of the aperture, centre to bar axis [m]
    pub half_height: f64,
}

impl GateState {
    pub fn new(index: usize, position: Vector3<f64>, yaw: f64, half_size: f64) -> Self {
        Self {
            index,
            position,
            yaw,
            half_width: half_size,
            half_height: half_size,
        }
    }

    /// Direction of passage through the aperture (gate-local +y)
    ///
    /// The frame spans the gate-local x-z plane, so the opening faces ±y.
    pub fn normal(&self) -> Vector3<f64> {
        Vector3::new(-self.yaw.sin(), self.yaw.cos(), 0.0)
    }

    /// Transform a gate-local offset [lateral, along-normal, vertical] to world
    pub fn local_to_world(&self, offset: &Vector3<f64>) -> Vector3<f64> {
        self.position + yaw_rotation(self.yaw) * offset
    }

    /// Signed distance of `point` along the passage direction
    ///
    /// Negative before the gate, positive once past it.
    pub fn along_normal(&self, point: &Vector3<f64>) -> f64 {
        (point - self.position).dot(&self.normal())
    }

    pub fn is_finite(&self) -> bool {
        self.position.iter().all(|v| v.is_finite())
            && self.yaw.is_finite()
            && self.half_width.is_finite()
            && self.half_height.is_finite()
    }
}

/// Observed obstacle (vertical pole)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObstacleState {
    /// Obstacle index
    pub index: usize,
    /// Position of the pole axis [m] (z ignored)
    pub position: Vector3<f64>,
    /// Pole radius [m]
    pub radius: f64,
}

impl ObstacleState {
    pub fn new(index: usize, position: Vector3<f64>, radius: f64) -> Self {
        Self { index, position, radius }
    }

    pub fn is_finite(&self) -> bool {
        self.position.iter().all(|v| v.is_finite()) && self.radius.is_finite()
    }
}

/// Ellipsoidal drone envelope
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BodyModel {
    /// Horizontal semi-axis [m]
    pub radius: f64,
    /// Full vertical extent [m]
    pub length: f64,
}

impl Default for BodyModel {
    fn default() -> Self {
        Self { radius: 0.05, length: 0.06 }
    }
}

impl BodyModel {
    /// Semi-axes (x, y, z)
    pub fn semi_axes(&self) -> Vector3<f64> {
        Vector3::new(self.radius, self.radius, self.length / 2.0)
    }
}

/// Cross-section of the bars making up a gate frame
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FrameModel {
    /// Thickness radius of a bar [m]
    pub bar_radius: f64,
    /// Length of a bar [m]
    pub bar_length: f64,
}

impl Default for FrameModel {
    fn default() -> Self {
        Self { bar_radius: 0.05, bar_length: 0.7 }
    }
}

/// One side of a gate frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrameBar {
    Right,
    Top,
    Left,
    Bottom,
}

impl FrameBar {
    pub const ALL: [FrameBar; 4] = [FrameBar::Right, FrameBar::Top, FrameBar::Left, FrameBar::Bottom];

    /// Bar centre and semi-axes in the gate-local frame
    fn local_ellipsoid(&self, gate: &GateState, frame: &FrameModel) -> (Vector3<f64>, Vector3<f64>) {
        let r = frame.bar_radius;
        let half = frame.bar_length / 2.0;
        match self {
            FrameBar::Right => (Vector3::new(gate.half_width, 0.0, 0.0), Vector3::new(r, r, half)),
            FrameBar::Left => (Vector3::new(-gate.half_width, 0.0, 0.0), Vector3::new(r, r, half)),
            FrameBar::Top => (Vector3::new(0.0, 0.0, gate.half_height), Vector3::new(half, r, r)),
            FrameBar::Bottom => (Vector3::new(0.0, 0.0, -gate.half_height), Vector3::new(half, r, r)),
        }
    }
}

/// Geometry that constrains the drone most
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClearanceSource {
    Obstacle { index: usize },
    GateFrame { gate: usize, bar: FrameBar },
}

/// Minimum clearance and what causes it
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Clearance {
    /// Signed clearance [m]; +∞ when nothing is checked
    pub distance: f64,
    /// Closest constraining geometry
    pub source: Option<ClearanceSource>,
}

impl Clearance {
    pub fn unconstrained() -> Self {
        Self { distance: f64::INFINITY, source: None }
    }

    fn keep_min(&mut self, distance: f64, source: ClearanceSource) {
        if distance < self.distance {
            self.distance = distance;
            self.source = Some(source);
        }
    }
}

/// Clearance from a vertical pole
///
/// Horizontal distance to the pole axis minus the pole radius and the body's
/// horizontal semi-axis. Exactly zero on contact.
pub fn obstacle_clearance(body: &BodyModel, position: &Vector3<f64>, obstacle: &ObstacleState) -> f64 {
    let dx = position.x - obstacle.position.x;
    let dy = position.y - obstacle.position.y;
    dx.hypot(dy) - (obstacle.radius + body.radius)
}

/// Clearance from a single frame bar
///
/// The bar ellipsoid is inflated by the body semi-axes; the clearance is the
/// distance from the drone to the inflated surface measured along the ray
/// from the ellipsoid centre.
pub fn frame_bar_clearance(
    body: &BodyModel,
    frame: &FrameModel,
    position: &Vector3<f64>,
    gate: &GateState,
    bar: FrameBar,
) -> f64 {
    let (centre, axes) = bar.local_ellipsoid(gate, frame);
    let axes = axes + body.semi_axes();
    let rot = yaw_rotation(gate.yaw);
    let local = rot.transpose() * (position - gate.position) - centre;

    let scaled = Vector3::new(local.x / axes.x, local.y / axes.y, local.z / axes.z).norm();
    let dist = local.norm();
    if scaled < 1e-12 {
        return -axes.min();
    }
    dist * (1.0 - 1.0 / scaled)
}

/// Minimum clearance over the four bars of one gate
pub fn gate_clearance(
    body: &BodyModel,
    frame: &FrameModel,
    position: &Vector3<f64>,
    gate: &GateState,
) -> (f64, FrameBar) {
    FrameBar::ALL
        .iter()
        .map(|&bar| (frame_bar_clearance(body, frame, position, gate, bar), bar))
        .fold((f64::INFINITY, FrameBar::Right), |best, cur| if cur.0 < best.0 { cur } else { best })
}

/// Collision model: body envelope, gate frame and obstacle exclusion list
#[derive(Debug, Clone, Default)]
pub struct CollisionModel {
    pub body: BodyModel,
    pub frame: FrameModel,
    ignored_obstacles: BTreeSet<usize>,
}

impl CollisionModel {
    pub fn new(body: BodyModel, frame: FrameModel, ignored_obstacles: impl IntoIterator<Item = usize>) -> Self {
        Self {
            body,
            frame,
            ignored_obstacles: ignored_obstacles.into_iter().collect(),
        }
    }

    /// Whether an obstacle index is excluded from collision checks
    pub fn is_ignored(&self, obstacle_index: usize) -> bool {
        self.ignored_obstacles.contains(&obstacle_index)
    }

    /// Obstacles that take part in collision checks
    pub fn active_obstacles<'a>(
        &'a self,
        obstacles: &'a [ObstacleState],
    ) -> impl Iterator<Item = &'a ObstacleState> + 'a {
        obstacles.iter().filter(move |o| !self.is_ignored(o.index))
    }

    /// Minimum signed clearance against all gates and non-ignored obstacles
    pub fn min_clearance(
        &self,
        position: &Vector3<f64>,
        gates: &[GateState],
        obstacles: &[ObstacleState],
    ) -> Clearance {
        let mut result = Clearance::unconstrained();
        for obstacle in self.active_obstacles(obstacles) {
            result.keep_min(
                obstacle_clearance(&self.body, position, obstacle),
                ClearanceSource::Obstacle { index: obstacle.index },
            );
        }
        for gate in gates {
            let (d, bar) = gate_clearance(&self.body, &self.frame, position, gate);
            result.keep_min(d, ClearanceSource::GateFrame { gate: gate.index, bar });
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f64::consts::FRAC_PI_2;

    fn gate() -> GateState {
        GateState::new(0, Vector3::new(0.0, 0.0, 1.0), 0.0, 0.225)
    }

    #[test]
    fn test_gate_normal_follows_yaw() {
        let mut g = gate();
        assert_relative_eq!(g.normal(), Vector3::new(0.0, 1.0, 0.0), epsilon = 1e-12);
        g.yaw = FRAC_PI_2;
        assert_relative_eq!(g.normal(), Vector3::new(-1.0, 0.0, 0.0), epsilon = 1e-12);
    }

    #[test]
    fn test_gate_centre_is_clear() {
        let body = BodyModel::default();
        let frame = FrameModel::default();
        let (d, _) = gate_clearance(&body, &frame, &Vector3::new(0.0, 0.0, 1.0), &gate());
        assert!(d > 0.0, "aperture centre must be clear, got {}", d);
    }

    #[test]
    fn test_gate_bar_is_blocked() {
        let body = BodyModel::default();
        let frame = FrameModel::default();
        let g = gate();
        let on_bar = Vector3::new(g.half_width, 0.0, 1.0);
        let (d, bar) = gate_clearance(&body, &frame, &on_bar, &g);
        assert!(d < 0.0);
        assert_eq!(bar, FrameBar::Right);
    }

    #[test]
    fn test_bar_surface_has_zero_clearance() {
        let body = BodyModel::default();
        let frame = FrameModel::default();
        let g = gate();
        // Along the passage direction from the right bar centre
        let reach = frame.bar_radius + body.radius;
        let p = Vector3::new(g.half_width, reach, 1.0);
        let d = frame_bar_clearance(&body, &frame, &p, &g, FrameBar::Right);
        assert_relative_eq!(d, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_ignored_obstacle_is_skipped() {
        let model = CollisionModel::new(BodyModel::default(), FrameModel::default(), [1]);
        let obstacles = vec![
            ObstacleState::new(0, Vector3::new(5.0, 0.0, 0.0), 0.1),
            ObstacleState::new(1, Vector3::new(0.0, 0.0, 0.0), 0.1),
        ];
        let c = model.min_clearance(&Vector3::new(0.0, 0.0, 1.0), &[], &obstacles);
        assert_eq!(c.source, Some(ClearanceSource::Obstacle { index: 0 }));
        assert!(c.distance > 4.0);
    }

    #[test]
    fn test_nothing_to_check_is_unconstrained() {
        let model = CollisionModel::default();
        let c = model.min_clearance(&Vector3::zeros(), &[], &[]);
        assert!(c.distance.is_infinite());
        assert!(c.source.is_none());
    }
}
