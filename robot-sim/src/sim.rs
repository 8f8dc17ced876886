//! Simulated robot navigation service
//!
//! Answers every RPC with state held in memory: a graph with snapshot
//! bookkeeping, motors that take a few state reads to power on, an expiring
//! lease, and a body that steps toward navigation goals on each command.

use graphnav_shared::rpc_request::Call;
use graphnav_shared::rpc_response::Reply;
use graphnav_shared::{
    timing, CommandResponse, FiducialInit, Graph, GraphResponse, Lease, LeaseRequest,
    LeaseResponse, Localization, LocalizationState, MotorPowerState, NavigationFeedbackResponse,
    NavigationStatus, Quaternion, RobotState, RpcErrorCode, RpcResponse, Se3Pose,
    SetLocalizationRequest, UploadGraphRequest, UploadGraphResponse, Vec3,
};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

/// State reads a power-on takes to complete
const POWER_ON_READS: u32 = 2;

/// Commands a waypoint or route navigation takes to arrive
const WAYPOINT_STEPS: u32 = 3;

/// Distance covered per anchored navigation command
const ANCHOR_STEP_M: f64 = 0.25;

const GOAL_TOLERANCE_M: f64 = 0.05;

/// Spacing of generated anchors along the seed x axis
const GENERATED_ANCHOR_SPACING_M: f64 = 1.0;

#[derive(Debug, Clone, Copy, Default)]
struct BodyPose {
    x: f64,
    y: f64,
    z: f64,
    yaw: f64,
}

impl BodyPose {
    fn from_se3(pose: &Se3Pose) -> Self {
        let position = pose.position_or_origin();
        Self {
            x: position.x,
            y: position.y,
            z: position.z,
            yaw: pose.rotation_or_identity().yaw(),
        }
    }

    fn to_se3(self) -> Se3Pose {
        Se3Pose::new(
            Vec3::new(self.x, self.y, self.z),
            Quaternion::from_yaw(self.yaw),
        )
    }
}

#[derive(Debug, Clone)]
enum Motion {
    /// Waypoint or route: arrives at `target` after the remaining commands
    Waypoint { target: String, remaining: u32 },
    Anchor { goal: BodyPose },
}

#[derive(Debug)]
struct ActiveCommand {
    motion: Motion,
    reached: bool,
}

struct HeldLease {
    lease: Lease,
    retained_at_ms: u64,
}

#[derive(Default)]
pub struct SimRobot {
    graph: Option<Graph>,
    waypoint_snapshots: HashSet<String>,
    edge_snapshots: HashSet<String>,
    /// Seed-frame pose of every anchored waypoint
    anchors: HashMap<String, BodyPose>,

    motor: Option<MotorPowerState>,
    power_on_reads_left: u32,

    lease: Option<HeldLease>,
    lease_sequence: u64,

    localized_at: Option<String>,
    pose: BodyPose,

    commands: HashMap<u32, ActiveCommand>,
    next_command: u32,
    /// Route most recently commanded, so re-issuing it continues the command
    active_route: Option<(Vec<String>, u32)>,
}

fn error(code: RpcErrorCode, message: impl Into<String>) -> RpcResponse {
    RpcResponse::error(code, message)
}

impl SimRobot {
    pub fn new() -> Self {
        Self {
            motor: Some(MotorPowerState::StateOff),
            ..Default::default()
        }
    }

    fn motor(&self) -> MotorPowerState {
        self.motor.unwrap_or(MotorPowerState::StateOff)
    }

    /// Answer one request at wall-clock time `now_ms`
    pub fn handle(&mut self, call: Call, now_ms: u64) -> RpcResponse {
        match call {
            Call::GetLocalizationState(_) => {
                RpcResponse::reply(Reply::LocalizationState(self.localization_state(now_ms)))
            }
            Call::SetLocalization(request) => self.set_localization(&request),
            Call::DownloadGraph(_) => RpcResponse::reply(Reply::Graph(GraphResponse {
                graph: self.graph.clone(),
            })),
            Call::UploadGraph(request) => self.upload_graph(request),
            Call::UploadWaypointSnapshot(snapshot) => {
                debug!("[SIM] Waypoint snapshot {} ({} bytes)", snapshot.id, snapshot.data.len());
                self.waypoint_snapshots.insert(snapshot.id);
                RpcResponse::ack()
            }
            Call::UploadEdgeSnapshot(snapshot) => {
                debug!("[SIM] Edge snapshot {} ({} bytes)", snapshot.id, snapshot.data.len());
                self.edge_snapshots.insert(snapshot.id);
                RpcResponse::ack()
            }
            Call::NavigateTo(request) => {
                if let Some(rejection) = self.check_can_move(now_ms) {
                    return rejection;
                }
                if !self.has_waypoint(&request.waypoint_id) {
                    return error(RpcErrorCode::ErrorNotFound, "unknown waypoint");
                }
                let motion = Motion::Waypoint {
                    target: request.waypoint_id,
                    remaining: WAYPOINT_STEPS,
                };
                self.issue(request.command_id, motion)
            }
            Call::NavigateToAnchor(request) => {
                if let Some(rejection) = self.check_can_move(now_ms) {
                    return rejection;
                }
                let Some(goal) = request.seed_tform_goal.as_ref() else {
                    return error(RpcErrorCode::ErrorInvalidRequest, "missing goal");
                };
                let motion = Motion::Anchor {
                    goal: BodyPose::from_se3(goal),
                };
                self.issue(request.command_id, motion)
            }
            Call::NavigateRoute(request) => {
                if let Some(rejection) = self.check_can_move(now_ms) {
                    return rejection;
                }
                let route = request.route.unwrap_or_default();
                let Some(target) = route.waypoint_ids.last().cloned() else {
                    return error(RpcErrorCode::ErrorInvalidRequest, "empty route");
                };
                if let Some(missing) = route.waypoint_ids.iter().find(|id| !self.has_waypoint(id)) {
                    return error(RpcErrorCode::ErrorNotFound, format!("unknown waypoint {missing}"));
                }
                // Same route again continues the running command
                let continuing = match &self.active_route {
                    Some((ids, id)) if *ids == route.waypoint_ids => *id,
                    _ => 0,
                };
                let steps = WAYPOINT_STEPS.max(route.edge_ids.len() as u32);
                let response = self.issue(
                    continuing,
                    Motion::Waypoint {
                        target,
                        remaining: steps,
                    },
                );
                if let Some(Reply::Command(c)) = &response.reply {
                    self.active_route = Some((route.waypoint_ids, c.command_id));
                }
                response
            }
            Call::NavigationFeedback(request) => {
                let status = match self.commands.get(&request.command_id) {
                    Some(command) if command.reached => NavigationStatus::StatusReachedGoal,
                    Some(_) => NavigationStatus::StatusFollowingRoute,
                    None => NavigationStatus::StatusUnknown,
                };
                RpcResponse::reply(Reply::Feedback(NavigationFeedbackResponse {
                    status: status.into(),
                }))
            }
            Call::ClearGraph(_) => {
                info!("[SIM] Graph cleared");
                self.graph = None;
                self.anchors.clear();
                self.waypoint_snapshots.clear();
                self.edge_snapshots.clear();
                self.localized_at = None;
                self.commands.clear();
                self.active_route = None;
                RpcResponse::ack()
            }
            Call::GetRobotState(_) => {
                if self.motor() == MotorPowerState::StatePoweringOn {
                    if self.power_on_reads_left == 0 {
                        info!("[SIM] Motors on");
                        self.motor = Some(MotorPowerState::StateOn);
                    } else {
                        self.power_on_reads_left -= 1;
                    }
                }
                RpcResponse::reply(Reply::RobotState(RobotState {
                    motor_power_state: self.motor().into(),
                    odom_tform_body: Some(self.pose.to_se3()),
                }))
            }
            Call::PowerOnMotors(_) => {
                if !self.lease_active(now_ms) {
                    return error(RpcErrorCode::ErrorNoLease, "lease required");
                }
                if matches!(
                    self.motor(),
                    MotorPowerState::StateOff | MotorPowerState::StatePoweringOff
                ) {
                    info!("[SIM] Powering on");
                    self.motor = Some(MotorPowerState::StatePoweringOn);
                    self.power_on_reads_left = POWER_ON_READS;
                }
                RpcResponse::ack()
            }
            Call::SafePowerOffMotors(_) => {
                if !self.lease_active(now_ms) {
                    return error(RpcErrorCode::ErrorNoLease, "lease required");
                }
                info!("[SIM] Sitting down, motors off");
                self.motor = Some(MotorPowerState::StateOff);
                self.commands.clear();
                self.active_route = None;
                RpcResponse::ack()
            }
            Call::AcquireLease(request) => self.acquire_lease(&request, now_ms),
            Call::RetainLease(request) => match self.held_matches(&request) {
                Some(held) => {
                    held.retained_at_ms = now_ms;
                    RpcResponse::ack()
                }
                None => error(RpcErrorCode::ErrorNoLease, "lease not held"),
            },
            Call::ReturnLease(request) => {
                if self.held_matches(&request).is_some() {
                    info!("[SIM] Lease returned by {}", request.client_name);
                    self.lease = None;
                }
                RpcResponse::ack()
            }
        }
    }

    fn has_waypoint(&self, id: &str) -> bool {
        self.graph
            .as_ref()
            .map(|g| g.waypoints.iter().any(|w| w.id == id))
            .unwrap_or(false)
    }

    fn lease_active(&self, now_ms: u64) -> bool {
        self.lease
            .as_ref()
            .map(|held| now_ms.saturating_sub(held.retained_at_ms) < timing::LEASE_EXPIRY_MS)
            .unwrap_or(false)
    }

    fn held_matches(&mut self, request: &LeaseRequest) -> Option<&mut HeldLease> {
        let wanted = request.lease.as_ref()?;
        self.lease.as_mut().filter(|held| held.lease == *wanted)
    }

    fn check_can_move(&self, now_ms: u64) -> Option<RpcResponse> {
        if !self.lease_active(now_ms) {
            return Some(error(RpcErrorCode::ErrorNoLease, "lease required"));
        }
        if self.motor() != MotorPowerState::StateOn {
            return Some(error(RpcErrorCode::ErrorPoweredOff, "motors are off"));
        }
        if self.localized_at.is_none() {
            return Some(error(RpcErrorCode::ErrorInvalidRequest, "not localized"));
        }
        None
    }

    fn acquire_lease(&mut self, request: &LeaseRequest, now_ms: u64) -> RpcResponse {
        if self.lease_active(now_ms) {
            let owner = self
                .lease
                .as_ref()
                .map(|held| held.lease.owner.clone())
                .unwrap_or_default();
            warn!("[SIM] {} wants the lease held by {}", request.client_name, owner);
            return error(
                RpcErrorCode::ErrorAlreadyClaimed,
                format!("lease held by {owner}"),
            );
        }

        self.lease_sequence += 1;
        let lease = Lease {
            resource: "body".into(),
            sequence: self.lease_sequence,
            owner: request.client_name.clone(),
        };
        info!("[SIM] Lease #{} granted to {}", lease.sequence, lease.owner);
        self.lease = Some(HeldLease {
            lease: lease.clone(),
            retained_at_ms: now_ms,
        });
        RpcResponse::reply(Reply::Lease(LeaseResponse { lease: Some(lease) }))
    }

    fn upload_graph(&mut self, request: UploadGraphRequest) -> RpcResponse {
        let Some(graph) = request.graph else {
            return error(RpcErrorCode::ErrorInvalidRequest, "missing graph");
        };

        self.anchors.clear();
        if request.generate_new_anchoring {
            for (i, waypoint) in graph.waypoints.iter().enumerate() {
                let pose = BodyPose {
                    x: i as f64 * GENERATED_ANCHOR_SPACING_M,
                    ..Default::default()
                };
                self.anchors.insert(waypoint.id.clone(), pose);
            }
        } else if let Some(anchoring) = &graph.anchoring {
            for anchor in &anchoring.anchors {
                let pose = anchor
                    .seed_tform_waypoint
                    .as_ref()
                    .map(BodyPose::from_se3)
                    .unwrap_or_default();
                self.anchors.insert(anchor.id.clone(), pose);
            }
        }

        let unknown_waypoint_snapshot_ids: Vec<String> = graph
            .waypoints
            .iter()
            .map(|w| w.snapshot_id.clone())
            .filter(|id| !id.is_empty() && !self.waypoint_snapshots.contains(id))
            .collect();
        let unknown_edge_snapshot_ids: Vec<String> = graph
            .edges
            .iter()
            .map(|e| e.snapshot_id.clone())
            .filter(|id| !id.is_empty() && !self.edge_snapshots.contains(id))
            .collect();

        info!(
            "[SIM] Graph uploaded: {} waypoints, {} edges, {} + {} snapshots missing",
            graph.waypoints.len(),
            graph.edges.len(),
            unknown_waypoint_snapshot_ids.len(),
            unknown_edge_snapshot_ids.len()
        );

        // Localization does not survive a new map
        if self
            .localized_at
            .as_ref()
            .map(|id| !graph.waypoints.iter().any(|w| &w.id == id))
            .unwrap_or(false)
        {
            self.localized_at = None;
        }
        self.graph = Some(graph);

        RpcResponse::reply(Reply::UploadGraph(UploadGraphResponse {
            unknown_waypoint_snapshot_ids,
            unknown_edge_snapshot_ids,
        }))
    }

    fn set_localization(&mut self, request: &SetLocalizationRequest) -> RpcResponse {
        let Some(graph) = &self.graph else {
            return error(RpcErrorCode::ErrorInvalidRequest, "no graph");
        };

        let fiducial = FiducialInit::try_from(request.fiducial_init)
            .unwrap_or(FiducialInit::FiducialInitUnknown);
        let waypoint_id = match fiducial {
            FiducialInit::FiducialInitNearest | FiducialInit::FiducialInitNearestAtTarget => {
                match graph.waypoints.first() {
                    Some(w) => w.id.clone(),
                    None => return error(RpcErrorCode::ErrorNotFound, "no fiducial in view"),
                }
            }
            _ => {
                let guess = request
                    .initial_guess
                    .as_ref()
                    .map(|g| g.waypoint_id.clone())
                    .unwrap_or_default();
                if !graph.waypoints.iter().any(|w| w.id == guess) {
                    return error(RpcErrorCode::ErrorNotFound, "unknown waypoint");
                }
                guess
            }
        };

        self.pose = self.anchors.get(&waypoint_id).copied().unwrap_or_default();
        info!("[SIM] Localized at {}", waypoint_id);
        self.localized_at = Some(waypoint_id);
        RpcResponse::ack()
    }

    fn localization_state(&self, now_ms: u64) -> LocalizationState {
        let localization = self.localized_at.as_ref().map(|id| Localization {
            waypoint_id: id.clone(),
            waypoint_tform_body: Some(Se3Pose::new(Vec3::default(), Quaternion::identity())),
            seed_tform_body: Some(self.pose.to_se3()),
        });
        LocalizationState {
            localization,
            odom_tform_body: Some(self.pose.to_se3()),
            timestamp_ms: now_ms,
        }
    }

    /// Start or continue a command and advance the body by one step
    fn issue(&mut self, command_id: u32, motion: Motion) -> RpcResponse {
        let id = if self.commands.contains_key(&command_id) {
            command_id
        } else {
            self.next_command += 1;
            self.commands.insert(
                self.next_command,
                ActiveCommand {
                    motion,
                    reached: false,
                },
            );
            self.next_command
        };

        self.advance(id);
        RpcResponse::reply(Reply::Command(CommandResponse { command_id: id }))
    }

    fn advance(&mut self, id: u32) {
        let Some(command) = self.commands.get_mut(&id) else {
            return;
        };
        if command.reached {
            return;
        }

        match &mut command.motion {
            Motion::Waypoint { target, remaining } => {
                *remaining = remaining.saturating_sub(1);
                if *remaining == 0 {
                    command.reached = true;
                    self.pose = self.anchors.get(target.as_str()).copied().unwrap_or(self.pose);
                    self.localized_at = Some(target.clone());
                }
            }
            Motion::Anchor { goal } => {
                let (dx, dy) = (goal.x - self.pose.x, goal.y - self.pose.y);
                let distance = dx.hypot(dy);
                if distance <= ANCHOR_STEP_M.max(GOAL_TOLERANCE_M) {
                    self.pose = *goal;
                    command.reached = true;
                } else {
                    let scale = ANCHOR_STEP_M / distance;
                    self.pose.x += dx * scale;
                    self.pose.y += dy * scale;
                    self.pose.yaw = dy.atan2(dx);
                }
            }
        }
        debug!(
            "[SIM] cmd={} pose=({:.2}, {:.2}) yaw={:.2}",
            id, self.pose.x, self.pose.y, self.pose.yaw
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use graphnav_shared::{Edge, EdgeId, Empty, NavigateToAnchorRequest, Waypoint};

    fn graph() -> Graph {
        let waypoint = |id: &str| Waypoint {
            id: id.into(),
            snapshot_id: format!("snap-{id}"),
            annotations: None,
        };
        Graph {
            waypoints: vec![waypoint("wp-a-1"), waypoint("wp-b-2")],
            edges: vec![Edge {
                id: Some(EdgeId::new("wp-a-1", "wp-b-2")),
                snapshot_id: "esnap-1".into(),
            }],
            anchoring: None,
        }
    }

    fn lease_request(lease: Option<Lease>) -> LeaseRequest {
        LeaseRequest {
            client_name: "test".into(),
            lease,
        }
    }

    fn take_lease(sim: &mut SimRobot, now: u64) -> Lease {
        match sim.handle(Call::AcquireLease(lease_request(None)), now).reply {
            Some(Reply::Lease(LeaseResponse { lease: Some(lease) })) => lease,
            other => panic!("no lease: {:?}", other),
        }
    }

    fn is_error(response: &RpcResponse, code: RpcErrorCode) -> bool {
        matches!(&response.reply, Some(Reply::Error(e)) if e.code == code as i32)
    }

    #[test]
    fn test_lease_exclusive_until_expiry() {
        let mut sim = SimRobot::new();
        let lease = take_lease(&mut sim, 0);

        let second = sim.handle(Call::AcquireLease(lease_request(None)), 1_000);
        assert!(is_error(&second, RpcErrorCode::ErrorAlreadyClaimed));

        // Retaining keeps it alive past the original expiry
        sim.handle(Call::RetainLease(lease_request(Some(lease.clone()))), 4_000);
        let third = sim.handle(Call::AcquireLease(lease_request(None)), 8_000);
        assert!(is_error(&third, RpcErrorCode::ErrorAlreadyClaimed));

        // Not retained for longer than the expiry: up for grabs
        let fresh = take_lease(&mut sim, 4_000 + timing::LEASE_EXPIRY_MS);
        assert_eq!(fresh.sequence, lease.sequence + 1);
    }

    #[test]
    fn test_upload_reports_only_unknown_snapshots() {
        let mut sim = SimRobot::new();
        let upload = |sim: &mut SimRobot| match sim
            .handle(
                Call::UploadGraph(UploadGraphRequest {
                    graph: Some(graph()),
                    generate_new_anchoring: true,
                }),
                0,
            )
            .reply
        {
            Some(Reply::UploadGraph(response)) => response,
            other => panic!("unexpected {:?}", other),
        };

        let first = upload(&mut sim);
        assert_eq!(first.unknown_waypoint_snapshot_ids.len(), 2);
        assert_eq!(first.unknown_edge_snapshot_ids, vec!["esnap-1".to_string()]);

        sim.handle(
            Call::UploadWaypointSnapshot(graphnav_shared::Snapshot {
                id: "snap-wp-a-1".into(),
                data: vec![],
            }),
            0,
        );
        let second = upload(&mut sim);
        assert_eq!(
            second.unknown_waypoint_snapshot_ids,
            vec!["snap-wp-b-2".to_string()]
        );
    }

    #[test]
    fn test_power_on_takes_state_reads() {
        let mut sim = SimRobot::new();
        let refused = sim.handle(Call::PowerOnMotors(Empty {}), 0);
        assert!(is_error(&refused, RpcErrorCode::ErrorNoLease));

        take_lease(&mut sim, 0);
        sim.handle(Call::PowerOnMotors(Empty {}), 0);

        let mut reads = 0;
        loop {
            reads += 1;
            let state = match sim.handle(Call::GetRobotState(Empty {}), 0).reply {
                Some(Reply::RobotState(state)) => state,
                other => panic!("unexpected {:?}", other),
            };
            if state.motor_power_state == MotorPowerState::StateOn as i32 {
                break;
            }
            assert!(reads < 10);
        }
        assert_eq!(reads, POWER_ON_READS + 1);
    }

    #[test]
    fn test_anchor_navigation_steps_to_goal() {
        let mut sim = SimRobot::new();
        take_lease(&mut sim, 0);
        sim.handle(
            Call::UploadGraph(UploadGraphRequest {
                graph: Some(graph()),
                generate_new_anchoring: true,
            }),
            0,
        );
        sim.handle(
            Call::SetLocalization(SetLocalizationRequest {
                fiducial_init: FiducialInit::FiducialInitNearest.into(),
                ..Default::default()
            }),
            0,
        );
        sim.motor = Some(MotorPowerState::StateOn);

        let goal = Se3Pose::new(Vec3::new(1.0, 0.0, 0.0), Quaternion::identity());
        let mut command_id = 0;
        let mut issued = 0;
        loop {
            let response = sim.handle(
                Call::NavigateToAnchor(NavigateToAnchorRequest {
                    seed_tform_goal: Some(goal.clone()),
                    cmd_duration_secs: 1.0,
                    command_id,
                }),
                0,
            );
            command_id = match response.reply {
                Some(Reply::Command(c)) => c.command_id,
                other => panic!("unexpected {:?}", other),
            };
            issued += 1;

            let feedback = sim.handle(
                Call::NavigationFeedback(graphnav_shared::NavigationFeedbackRequest { command_id }),
                0,
            );
            if let Some(Reply::Feedback(f)) = feedback.reply {
                if f.status == NavigationStatus::StatusReachedGoal as i32 {
                    break;
                }
            }
            assert!(issued < 10, "never arrived");
        }

        assert_eq!(issued, 4);
        assert!((sim.pose.x - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_navigation_needs_power() {
        let mut sim = SimRobot::new();
        take_lease(&mut sim, 0);
        let response = sim.handle(
            Call::NavigateToAnchor(NavigateToAnchorRequest::default()),
            0,
        );
        assert!(is_error(&response, RpcErrorCode::ErrorPoweredOff));
    }
}
