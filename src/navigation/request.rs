use crate::error::NavError;
use graphnav_shared::{NavigationStatus, Quaternion, Se3Pose};

/// One navigation invocation
#[derive(Debug, Clone, PartialEq)]
pub enum NavigationRequest {
    /// Waypoint id, annotation name or short code
    ToWaypoint(String),
    /// Waypoint tokens traversed in order
    Route(Vec<String>),
    ToAnchoredPose(AnchorGoal),
}

/// Goal orientation as given by the caller
#[derive(Debug, Clone, PartialEq)]
pub enum Orientation {
    /// Radians about the vertical axis
    Yaw(f64),
    Quaternion(Quaternion),
}

impl Orientation {
    pub fn to_quaternion(&self) -> Quaternion {
        match self {
            Orientation::Yaw(yaw) => Quaternion::from_yaw(*yaw),
            Orientation::Quaternion(q) => q.clone(),
        }
    }
}

/// Seed-frame goal with optional height and orientation
///
/// Missing `z` takes the robot's current seed-frame height; missing
/// orientation is identity.
#[derive(Debug, Clone, PartialEq)]
pub struct AnchorGoal {
    pub x: f64,
    pub y: f64,
    pub z: Option<f64>,
    pub orientation: Option<Orientation>,
}

impl AnchorGoal {
    pub fn planar(x: f64, y: f64) -> Self {
        Self {
            x,
            y,
            z: None,
            orientation: None,
        }
    }
}

impl TryFrom<&[f64]> for AnchorGoal {
    type Error = NavError;

    /// `[x, y]`, `[x, y, yaw]`, `[x, y, z, yaw]` or `[x, y, z, qw, qx, qy, qz]`
    fn try_from(values: &[f64]) -> Result<Self, Self::Error> {
        let goal = match *values {
            [x, y] => AnchorGoal::planar(x, y),
            [x, y, yaw] => AnchorGoal {
                x,
                y,
                z: None,
                orientation: Some(Orientation::Yaw(yaw)),
            },
            [x, y, z, yaw] => AnchorGoal {
                x,
                y,
                z: Some(z),
                orientation: Some(Orientation::Yaw(yaw)),
            },
            [x, y, z, qw, qx, qy, qz] => AnchorGoal {
                x,
                y,
                z: Some(z),
                orientation: Some(Orientation::Quaternion(Quaternion {
                    x: qx,
                    y: qy,
                    z: qz,
                    w: qw,
                })),
            },
            _ => {
                return Err(NavError::InvalidGoal(format!(
                    "expected 2, 3, 4 or 7 components, got {}",
                    values.len()
                )))
            }
        };

        if [goal.x, goal.y].iter().chain(goal.z.iter()).any(|v| !v.is_finite()) {
            return Err(NavError::InvalidGoal("non-finite coordinate".into()));
        }
        Ok(goal)
    }
}

/// Why a navigation ended without reaching its goal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Lost,
    Stuck,
    Impaired,
    /// The robot returned no command handle
    NoCommand,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure(FailureKind),
}

impl Outcome {
    pub fn is_success(self) -> bool {
        self == Outcome::Success
    }
}

/// Result of one poll iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    InProgress,
    Finished(Outcome),
}

/// Terminal or not, for one feedback status
pub fn classify(status: NavigationStatus) -> StepStatus {
    match status {
        NavigationStatus::StatusReachedGoal => StepStatus::Finished(Outcome::Success),
        NavigationStatus::StatusLost => StepStatus::Finished(Outcome::Failure(FailureKind::Lost)),
        NavigationStatus::StatusStuck => {
            StepStatus::Finished(Outcome::Failure(FailureKind::Stuck))
        }
        NavigationStatus::StatusRobotImpaired => {
            StepStatus::Finished(Outcome::Failure(FailureKind::Impaired))
        }
        _ => StepStatus::InProgress,
    }
}

/// Seed-frame position and heading reported as feedback
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlanarPose {
    pub x: f64,
    pub y: f64,
    pub yaw: f64,
}

impl From<&Se3Pose> for PlanarPose {
    fn from(pose: &Se3Pose) -> Self {
        let position = pose.position_or_origin();
        Self {
            x: position.x,
            y: position.y,
            yaw: pose.rotation_or_identity().yaw(),
        }
    }
}
