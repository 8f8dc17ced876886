//! Remote robot service abstraction
//!
//! The navigation core talks to the robot only through [`RobotClient`]. The
//! TCP implementation lives in [`rpc`]; tests use the scripted mock.

#[cfg(test)]
pub mod mock;
mod rpc;

pub use rpc::RpcRobotClient;

use async_trait::async_trait;
use graphnav_shared::codec::CodecError;
use graphnav_shared::{
    Graph, Lease, LocalizationState, NavigationStatus, RobotState, Route, Se3Pose,
    SetLocalizationRequest, Snapshot, UploadGraphResponse,
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors returned by remote calls
#[derive(Error, Debug)]
pub enum RobotError {
    #[error("Resource already claimed by another client")]
    AlreadyClaimed,

    #[error("Robot rejected {call}: {message}")]
    Rejected { call: &'static str, message: String },

    #[error("Connection to robot closed")]
    Disconnected,

    #[error("No response to {call} within {waited:?}")]
    Timeout { call: &'static str, waited: Duration },

    #[error("Unexpected response to {0}")]
    UnexpectedResponse(&'static str),

    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Id of an in-flight navigation command on the robot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandHandle(u32);

impl CommandHandle {
    /// The robot reports "no command" as id 0
    pub fn from_wire(id: u32) -> Option<Self> {
        (id != 0).then_some(Self(id))
    }

    pub fn id(self) -> u32 {
        self.0
    }
}

/// Wire form of an optional handle
pub fn handle_to_wire(handle: Option<CommandHandle>) -> u32 {
    handle.map(CommandHandle::id).unwrap_or(0)
}

/// Calls exposed by the robot's navigation, power, state and lease services
#[async_trait]
pub trait RobotClient: Send + Sync {
    async fn get_localization_state(&self) -> Result<LocalizationState, RobotError>;

    async fn set_localization(&self, request: &SetLocalizationRequest) -> Result<(), RobotError>;

    /// `None` when the robot holds no graph
    async fn download_graph(&self) -> Result<Option<Graph>, RobotError>;

    async fn upload_graph(
        &self,
        graph: &Graph,
        generate_new_anchoring: bool,
    ) -> Result<UploadGraphResponse, RobotError>;

    async fn upload_waypoint_snapshot(&self, snapshot: &Snapshot) -> Result<(), RobotError>;

    async fn upload_edge_snapshot(&self, snapshot: &Snapshot) -> Result<(), RobotError>;

    /// Issue or continue a navigate-to-waypoint command
    async fn navigate_to(
        &self,
        waypoint_id: &str,
        cmd_duration_secs: f64,
        command: Option<CommandHandle>,
    ) -> Result<Option<CommandHandle>, RobotError>;

    /// Issue or continue a navigate-to-seed-pose command
    async fn navigate_to_anchor(
        &self,
        seed_tform_goal: &Se3Pose,
        cmd_duration_secs: f64,
        command: Option<CommandHandle>,
    ) -> Result<Option<CommandHandle>, RobotError>;

    async fn navigate_route(
        &self,
        route: &Route,
        cmd_duration_secs: f64,
    ) -> Result<Option<CommandHandle>, RobotError>;

    async fn navigation_feedback(
        &self,
        command: CommandHandle,
    ) -> Result<NavigationStatus, RobotError>;

    async fn clear_graph(&self) -> Result<(), RobotError>;

    async fn get_robot_state(&self) -> Result<RobotState, RobotError>;

    async fn power_on_motors(&self) -> Result<(), RobotError>;

    /// Sit the robot down, then cut motor power
    async fn safe_power_off_motors(&self) -> Result<(), RobotError>;

    /// Must-acquire: fails with [`RobotError::AlreadyClaimed`] if held elsewhere
    async fn acquire_lease(&self) -> Result<Lease, RobotError>;

    async fn retain_lease(&self, lease: &Lease) -> Result<(), RobotError>;

    async fn return_lease(&self, lease: &Lease) -> Result<(), RobotError>;
}

pub type SharedRobot = Arc<dyn RobotClient>;
