//! GraphNav Shared Types
//!
//! This crate provides the map and wire types, the frame codec and the motor
//! power state machine shared by the navigation client and the robot
//! simulator.

pub mod codec;
pub mod state_machine;

use std::time::{SystemTime, UNIX_EPOCH};

// Include the generated protobuf types
pub mod proto {
    include!(concat!(env!("OUT_DIR"), "/graphnav.rs"));
}

// Re-export commonly used types at crate root
pub use proto::*;

/// Get current timestamp in milliseconds since Unix epoch
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Timing parameters for the navigation loop
pub mod timing {
    /// Wait between issuing a navigation command and polling its feedback
    pub const POLL_INTERVAL_MS: u64 = 500;

    /// Duration each navigation command stays valid on the robot
    pub const COMMAND_DURATION_SECS: f64 = 1.0;

    /// Wait between robot state reads while motors power on
    pub const POWER_POLL_INTERVAL_MS: u64 = 250;

    /// Give up waiting for motor power after this long
    pub const POWER_ON_TIMEOUT_MS: u64 = 10_000;

    /// Lease keep-alive period
    pub const LEASE_RETAIN_INTERVAL_MS: u64 = 1_000;

    /// A lease not retained for this long may be taken by another client
    pub const LEASE_EXPIRY_MS: u64 = 5_000;

    /// Localization search window around a waypoint guess
    pub const LOCALIZE_MAX_DISTANCE_M: f64 = 0.2;
    pub const LOCALIZE_MAX_YAW_DEG: f64 = 20.0;
}

impl Vec3 {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }
}

impl Quaternion {
    pub fn identity() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            z: 0.0,
            w: 1.0,
        }
    }

    /// Rotation of `yaw` radians about the vertical axis
    pub fn from_yaw(yaw: f64) -> Self {
        let half = yaw * 0.5;
        Self {
            x: 0.0,
            y: 0.0,
            z: half.sin(),
            w: half.cos(),
        }
    }

    /// Heading about the vertical axis (ZYX convention)
    pub fn yaw(&self) -> f64 {
        let siny_cosp = 2.0 * (self.w * self.z + self.x * self.y);
        let cosy_cosp = 1.0 - 2.0 * (self.y * self.y + self.z * self.z);
        siny_cosp.atan2(cosy_cosp)
    }
}

impl Se3Pose {
    pub fn new(position: Vec3, rotation: Quaternion) -> Self {
        Self {
            position: Some(position),
            rotation: Some(rotation),
        }
    }

    pub fn position_or_origin(&self) -> Vec3 {
        self.position.clone().unwrap_or_default()
    }

    pub fn rotation_or_identity(&self) -> Quaternion {
        self.rotation.clone().unwrap_or_else(Quaternion::identity)
    }
}

impl Waypoint {
    /// Annotation name, empty when the waypoint was recorded without one
    pub fn name(&self) -> &str {
        self.annotations.as_ref().map(|a| a.name.as_str()).unwrap_or("")
    }
}

impl EdgeId {
    pub fn new(from_waypoint: impl Into<String>, to_waypoint: impl Into<String>) -> Self {
        Self {
            from_waypoint: from_waypoint.into(),
            to_waypoint: to_waypoint.into(),
        }
    }
}

impl Graph {
    /// Whether the graph carries any seed-frame anchors
    pub fn has_anchors(&self) -> bool {
        self.anchoring
            .as_ref()
            .map(|a| !a.anchors.is_empty())
            .unwrap_or(false)
    }
}

impl Localization {
    /// The robot is localized when it reports a current waypoint
    pub fn is_localized(&self) -> bool {
        !self.waypoint_id.is_empty()
    }
}

impl LocalizationState {
    /// Current waypoint id, if localized
    pub fn waypoint_id(&self) -> Option<&str> {
        self.localization
            .as_ref()
            .filter(|l| l.is_localized())
            .map(|l| l.waypoint_id.as_str())
    }

    /// Seed-frame body pose, if localized
    pub fn seed_pose(&self) -> Option<&Se3Pose> {
        self.localization
            .as_ref()
            .filter(|l| l.is_localized())
            .and_then(|l| l.seed_tform_body.as_ref())
    }
}

impl RpcError {
    pub fn new(code: RpcErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl RpcResponse {
    pub fn ack() -> Self {
        Self {
            reply: Some(rpc_response::Reply::Ack(Empty {})),
        }
    }

    pub fn error(code: RpcErrorCode, message: impl Into<String>) -> Self {
        Self {
            reply: Some(rpc_response::Reply::Error(RpcError::new(code, message))),
        }
    }

    pub fn reply(reply: rpc_response::Reply) -> Self {
        Self { reply: Some(reply) }
    }
}

impl RpcEnvelope {
    pub fn request(request_id: u64, call: rpc_request::Call) -> Self {
        Self {
            request_id,
            request: Some(RpcRequest { call: Some(call) }),
            response: None,
        }
    }

    pub fn response(request_id: u64, response: RpcResponse) -> Self {
        Self {
            request_id,
            request: None,
            response: Some(response),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::FRAC_PI_2;

    #[test]
    fn test_quaternion_yaw_roundtrip() {
        let q = Quaternion::from_yaw(FRAC_PI_2);
        assert!((q.yaw() - FRAC_PI_2).abs() < 1e-9);
        assert!((Quaternion::identity().yaw()).abs() < 1e-12);
    }

    #[test]
    fn test_graph_anchors() {
        let mut graph = Graph::default();
        assert!(!graph.has_anchors());

        graph.anchoring = Some(Anchoring::default());
        assert!(!graph.has_anchors());

        graph.anchoring = Some(Anchoring {
            anchors: vec![Anchor {
                id: "wp-a".into(),
                seed_tform_waypoint: None,
            }],
        });
        assert!(graph.has_anchors());
    }

    #[test]
    fn test_localization_state_accessors() {
        let mut state = LocalizationState::default();
        assert!(state.waypoint_id().is_none());

        state.localization = Some(Localization {
            waypoint_id: "wp-a".into(),
            waypoint_tform_body: None,
            seed_tform_body: Some(Se3Pose::new(Vec3::new(1.0, 2.0, 0.3), Quaternion::identity())),
        });
        assert_eq!(state.waypoint_id(), Some("wp-a"));
        assert_eq!(state.seed_pose().map(|p| p.position_or_origin().z), Some(0.3));
    }

    #[test]
    fn test_error_response() {
        let response = RpcResponse::error(RpcErrorCode::ErrorAlreadyClaimed, "held");
        match response.reply {
            Some(rpc_response::Reply::Error(e)) => {
                assert_eq!(e.code, RpcErrorCode::ErrorAlreadyClaimed as i32);
                assert_eq!(e.message, "held");
            }
            other => panic!("unexpected reply: {:?}", other),
        }
    }
}
