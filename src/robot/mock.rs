//! Scripted in-process robot for tests

use super::{CommandHandle, RobotClient, RobotError};
use async_trait::async_trait;
use graphnav_shared::{
    Graph, Lease, Localization, LocalizationState, MotorPowerState, NavigationStatus, Quaternion,
    RobotState, Route, Se3Pose, SetLocalizationRequest, Snapshot, UploadGraphResponse, Vec3,
};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

/// Everything the mock remembers; tests read and tweak it through [`MockRobot::state`]
pub struct MockState {
    pub localization: LocalizationState,
    pub motor_power: MotorPowerState,
    /// State reads before a power-on completes; `None` never completes
    pub power_on_delay: Option<u32>,
    power_on_remaining: Option<u32>,

    /// Feedback statuses handed out in order; `StatusFollowingRoute` once empty
    pub feedback: VecDeque<NavigationStatus>,
    pub return_no_command: bool,
    pub fail_navigation: bool,
    next_command: u32,

    pub graph: Option<Graph>,
    pub unknown_waypoint_snapshots: Vec<String>,
    pub unknown_edge_snapshots: Vec<String>,

    pub lease_held: bool,

    // Call log
    pub power_on_calls: u32,
    pub power_off_calls: u32,
    pub navigate_calls: u32,
    pub feedback_calls: u32,
    pub upload_anchoring_flags: Vec<bool>,
    pub uploaded_waypoint_snapshots: Vec<String>,
    pub uploaded_edge_snapshots: Vec<String>,
    pub set_localization_requests: Vec<SetLocalizationRequest>,
    pub issued_handles: Vec<Option<CommandHandle>>,
    pub last_anchor_goal: Option<Se3Pose>,
    pub last_route: Option<Route>,
    pub clear_graph_calls: u32,
    pub lease_acquires: u32,
    pub lease_retains: u32,
    pub lease_returns: u32,
}

pub struct MockRobot {
    state: Mutex<MockState>,
}

impl MockRobot {
    /// Motors off, not localized, no graph
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                localization: LocalizationState::default(),
                motor_power: MotorPowerState::StateOff,
                power_on_delay: Some(1),
                power_on_remaining: None,
                feedback: VecDeque::new(),
                return_no_command: false,
                fail_navigation: false,
                next_command: 0,
                graph: None,
                unknown_waypoint_snapshots: Vec::new(),
                unknown_edge_snapshots: Vec::new(),
                lease_held: false,
                power_on_calls: 0,
                power_off_calls: 0,
                navigate_calls: 0,
                feedback_calls: 0,
                upload_anchoring_flags: Vec::new(),
                uploaded_waypoint_snapshots: Vec::new(),
                uploaded_edge_snapshots: Vec::new(),
                set_localization_requests: Vec::new(),
                issued_handles: Vec::new(),
                last_anchor_goal: None,
                last_route: None,
                clear_graph_calls: 0,
                lease_acquires: 0,
                lease_retains: 0,
                lease_returns: 0,
            }),
        }
    }

    pub fn powered_on(self) -> Self {
        self.state().motor_power = MotorPowerState::StateOn;
        self
    }

    pub fn with_feedback(self, statuses: &[NavigationStatus]) -> Self {
        self.state().feedback = statuses.iter().copied().collect();
        self
    }

    /// Localized at `waypoint_id` with the given seed-frame pose
    pub fn localized_at(self, waypoint_id: &str, x: f64, y: f64, z: f64, yaw: f64) -> Self {
        self.state().localization = LocalizationState {
            localization: Some(Localization {
                waypoint_id: waypoint_id.to_string(),
                waypoint_tform_body: Some(Se3Pose::new(Vec3::default(), Quaternion::identity())),
                seed_tform_body: Some(Se3Pose::new(
                    Vec3::new(x, y, z),
                    Quaternion::from_yaw(yaw),
                )),
            }),
            odom_tform_body: Some(Se3Pose::new(Vec3::default(), Quaternion::identity())),
            timestamp_ms: 0,
        };
        self
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    fn issue(&self, command: Option<CommandHandle>) -> Result<Option<CommandHandle>, RobotError> {
        let mut state = self.state();
        state.navigate_calls += 1;
        state.issued_handles.push(command);
        if state.fail_navigation {
            return Err(RobotError::Rejected {
                call: "navigate",
                message: "scripted failure".into(),
            });
        }
        if state.return_no_command {
            return Ok(None);
        }
        match command {
            Some(handle) => Ok(Some(handle)),
            None => {
                state.next_command += 1;
                Ok(CommandHandle::from_wire(state.next_command))
            }
        }
    }
}

#[async_trait]
impl RobotClient for MockRobot {
    async fn get_localization_state(&self) -> Result<LocalizationState, RobotError> {
        Ok(self.state().localization.clone())
    }

    async fn set_localization(&self, request: &SetLocalizationRequest) -> Result<(), RobotError> {
        self.state().set_localization_requests.push(request.clone());
        Ok(())
    }

    async fn download_graph(&self) -> Result<Option<Graph>, RobotError> {
        Ok(self.state().graph.clone())
    }

    async fn upload_graph(
        &self,
        graph: &Graph,
        generate_new_anchoring: bool,
    ) -> Result<UploadGraphResponse, RobotError> {
        let mut state = self.state();
        state.upload_anchoring_flags.push(generate_new_anchoring);
        state.graph = Some(graph.clone());
        Ok(UploadGraphResponse {
            unknown_waypoint_snapshot_ids: state.unknown_waypoint_snapshots.clone(),
            unknown_edge_snapshot_ids: state.unknown_edge_snapshots.clone(),
        })
    }

    async fn upload_waypoint_snapshot(&self, snapshot: &Snapshot) -> Result<(), RobotError> {
        self.state()
            .uploaded_waypoint_snapshots
            .push(snapshot.id.clone());
        Ok(())
    }

    async fn upload_edge_snapshot(&self, snapshot: &Snapshot) -> Result<(), RobotError> {
        self.state().uploaded_edge_snapshots.push(snapshot.id.clone());
        Ok(())
    }

    async fn navigate_to(
        &self,
        _waypoint_id: &str,
        _cmd_duration_secs: f64,
        command: Option<CommandHandle>,
    ) -> Result<Option<CommandHandle>, RobotError> {
        self.issue(command)
    }

    async fn navigate_to_anchor(
        &self,
        seed_tform_goal: &Se3Pose,
        _cmd_duration_secs: f64,
        command: Option<CommandHandle>,
    ) -> Result<Option<CommandHandle>, RobotError> {
        self.state().last_anchor_goal = Some(seed_tform_goal.clone());
        self.issue(command)
    }

    async fn navigate_route(
        &self,
        route: &Route,
        _cmd_duration_secs: f64,
    ) -> Result<Option<CommandHandle>, RobotError> {
        self.state().last_route = Some(route.clone());
        self.issue(None)
    }

    async fn navigation_feedback(
        &self,
        _command: CommandHandle,
    ) -> Result<NavigationStatus, RobotError> {
        let mut state = self.state();
        state.feedback_calls += 1;
        Ok(state
            .feedback
            .pop_front()
            .unwrap_or(NavigationStatus::StatusFollowingRoute))
    }

    async fn clear_graph(&self) -> Result<(), RobotError> {
        let mut state = self.state();
        state.clear_graph_calls += 1;
        state.graph = None;
        Ok(())
    }

    async fn get_robot_state(&self) -> Result<RobotState, RobotError> {
        let mut state = self.state();
        if state.motor_power == MotorPowerState::StatePoweringOn {
            match state.power_on_remaining {
                Some(0) => state.motor_power = MotorPowerState::StateOn,
                Some(n) => state.power_on_remaining = Some(n - 1),
                None => {}
            }
        }
        Ok(RobotState {
            motor_power_state: state.motor_power.into(),
            odom_tform_body: None,
        })
    }

    async fn power_on_motors(&self) -> Result<(), RobotError> {
        let mut state = self.state();
        state.power_on_calls += 1;
        state.motor_power = MotorPowerState::StatePoweringOn;
        state.power_on_remaining = state.power_on_delay;
        Ok(())
    }

    async fn safe_power_off_motors(&self) -> Result<(), RobotError> {
        let mut state = self.state();
        state.power_off_calls += 1;
        state.motor_power = MotorPowerState::StateOff;
        state.power_on_remaining = None;
        Ok(())
    }

    async fn acquire_lease(&self) -> Result<Lease, RobotError> {
        let mut state = self.state();
        if state.lease_held {
            return Err(RobotError::AlreadyClaimed);
        }
        state.lease_held = true;
        state.lease_acquires += 1;
        Ok(Lease {
            resource: "body".into(),
            sequence: state.lease_acquires as u64,
            owner: "test".into(),
        })
    }

    async fn retain_lease(&self, _lease: &Lease) -> Result<(), RobotError> {
        self.state().lease_retains += 1;
        Ok(())
    }

    async fn return_lease(&self, _lease: &Lease) -> Result<(), RobotError> {
        let mut state = self.state();
        state.lease_held = false;
        state.lease_returns += 1;
        Ok(())
    }
}
