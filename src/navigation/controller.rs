//! Navigation controller
//!
//! Turns a navigation request into a sequence of remote calls. Every navigate
//! operation shares the same poll loop:
//!
//! 1. read localization for feedback
//! 2. issue or continue the command, threading the previous handle
//! 3. wait one poll interval
//! 4. read feedback for the handle and classify it
//!
//! Resolution and validation happen before the first remote call. A remote
//! failure ends the operation; it is never retried here.

use super::request::{
    classify, AnchorGoal, FailureKind, NavigationRequest, Orientation, Outcome, PlanarPose,
    StepStatus,
};
use crate::config::NavigationConfig;
use crate::error::{NavError, Result};
use crate::graph::{build_route, GraphStore, UploadResult};
use crate::power::PowerLifecycle;
use crate::robot::{CommandHandle, RobotClient, RobotError, SharedRobot};
use graphnav_shared::{
    timing, FiducialInit, Localization, LocalizationState, Quaternion, Route, Se3Pose,
    SetLocalizationRequest, Vec3,
};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{OwnedRwLockReadGuard, RwLock};
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// State of one navigation operation
///
/// Created per operation and threaded through the poll loop, so concurrent
/// operations never share it.
#[derive(Debug, Default, Clone)]
pub struct OperationContext {
    /// This operation turned the motors on
    pub powered_on_here: bool,
    /// The robot got lost and has to be sat down
    pub must_settle: bool,
    /// Last seed-frame pose read during the loop
    pub last_pose: Option<PlanarPose>,
    /// Handle of the in-flight command
    pub command: Option<CommandHandle>,
    /// Commands issued so far
    pub iterations: u32,
}

impl OperationContext {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Seed-frame goal ready for stepping
///
/// Keeps the graph read-locked while it lives, so the map cannot be cleared
/// or replaced under an anchored navigation.
pub struct AnchorTarget {
    pub pose: Se3Pose,
    _graph: OwnedRwLockReadGuard<GraphStore>,
}

/// A command ready to send, after resolution
enum NavCommand {
    ToWaypoint(String),
    Route(Route),
    ToAnchor(Se3Pose),
}

impl NavCommand {
    async fn issue(
        &self,
        robot: &dyn RobotClient,
        cmd_duration_secs: f64,
        handle: Option<CommandHandle>,
    ) -> std::result::Result<Option<CommandHandle>, RobotError> {
        match self {
            NavCommand::ToWaypoint(id) => robot.navigate_to(id, cmd_duration_secs, handle).await,
            // Routes are re-issued whole; the robot picks up where it is
            NavCommand::Route(route) => robot.navigate_route(route, cmd_duration_secs).await,
            NavCommand::ToAnchor(pose) => {
                robot
                    .navigate_to_anchor(pose, cmd_duration_secs, handle)
                    .await
            }
        }
    }
}

pub struct NavigationController {
    robot: SharedRobot,
    graph: Arc<RwLock<GraphStore>>,
    power: PowerLifecycle,
    config: NavigationConfig,
}

impl NavigationController {
    pub fn new(robot: SharedRobot, graph: Arc<RwLock<GraphStore>>, config: NavigationConfig) -> Self {
        let power = PowerLifecycle::new(robot.clone(), &config);
        Self {
            robot,
            graph,
            power,
            config,
        }
    }

    pub fn robot(&self) -> &SharedRobot {
        &self.robot
    }

    pub fn config(&self) -> &NavigationConfig {
        &self.config
    }

    pub fn power(&self) -> &PowerLifecycle {
        &self.power
    }

    pub fn graph(&self) -> &Arc<RwLock<GraphStore>> {
        &self.graph
    }

    // ---- Graph management ----

    /// Load a recorded graph from disk, replacing the cached one
    pub async fn load_graph(&self, dir: &Path) -> Result<usize> {
        let mut graph = self.graph.write().await;
        Ok(graph.load(dir).await?.waypoints.len())
    }

    pub async fn upload_graph(&self) -> Result<UploadResult> {
        self.graph.read().await.upload(self.robot.as_ref()).await
    }

    /// Download and list the graph currently on the robot
    pub async fn refresh_graph(&self) -> Result<usize> {
        self.graph
            .write()
            .await
            .refresh_from_robot(self.robot.as_ref())
            .await
    }

    /// Clear the robot's graph and drop the cached copy
    pub async fn clear_graph(&self) -> Result<()> {
        let mut graph = self.graph.write().await;
        self.robot.clear_graph().await?;
        graph.clear();
        info!("[NAV] Graph cleared");
        Ok(())
    }

    pub async fn get_localization_state(&self) -> Result<LocalizationState> {
        Ok(self.robot.get_localization_state().await?)
    }

    /// Localize assuming the robot stands at `token`
    pub async fn localize_at_waypoint(&self, token: &str) -> Result<String> {
        let waypoint_id = self.graph.read().await.resolve_waypoint(token)?;
        let robot_state = self.robot.get_robot_state().await?;

        let request = SetLocalizationRequest {
            initial_guess: Some(Localization {
                waypoint_id: waypoint_id.clone(),
                waypoint_tform_body: Some(Se3Pose::new(Vec3::default(), Quaternion::identity())),
                seed_tform_body: None,
            }),
            ko_tform_body: robot_state.odom_tform_body,
            max_distance: timing::LOCALIZE_MAX_DISTANCE_M,
            max_yaw: timing::LOCALIZE_MAX_YAW_DEG.to_radians(),
            fiducial_init: FiducialInit::FiducialInitNoFiducial.into(),
        };
        self.robot.set_localization(&request).await?;

        info!("[NAV] Localized at waypoint {}", waypoint_id);
        Ok(waypoint_id)
    }

    /// Localize on the nearest visible fiducial
    pub async fn localize_at_fiducial(&self) -> Result<()> {
        let robot_state = self.robot.get_robot_state().await?;

        let request = SetLocalizationRequest {
            initial_guess: None,
            ko_tform_body: robot_state.odom_tform_body,
            max_distance: 0.0,
            max_yaw: 0.0,
            fiducial_init: FiducialInit::FiducialInitNearest.into(),
        };
        self.robot.set_localization(&request).await?;

        info!("[NAV] Localized on nearest fiducial");
        Ok(())
    }

    // ---- Navigation ----

    /// Run any request to its terminal outcome
    pub async fn execute(
        &self,
        request: &NavigationRequest,
        ctx: &mut OperationContext,
    ) -> Result<Outcome> {
        match request {
            NavigationRequest::ToWaypoint(token) => self.navigate_to_waypoint(token, ctx).await,
            NavigationRequest::Route(tokens) => self.navigate_route(tokens, ctx).await,
            NavigationRequest::ToAnchoredPose(goal) => self.navigate_to_anchor(goal, ctx).await,
        }
    }

    pub async fn navigate_to_waypoint(
        &self,
        token: &str,
        ctx: &mut OperationContext,
    ) -> Result<Outcome> {
        // Held for the whole operation so the graph cannot be swapped underneath
        let graph = self.graph.read().await;
        let waypoint_id = graph.resolve_waypoint(token)?;

        self.power_on(ctx).await?;
        info!("[NAV] Navigating to waypoint {}", waypoint_id);
        self.run_loop(NavCommand::ToWaypoint(waypoint_id), ctx)
            .await
    }

    pub async fn navigate_route(
        &self,
        tokens: &[String],
        ctx: &mut OperationContext,
    ) -> Result<Outcome> {
        let graph = self.graph.read().await;
        if !graph.is_loaded() {
            return Err(NavError::NoGraph);
        }

        let waypoint_ids = tokens
            .iter()
            .map(|token| graph.resolve_waypoint(token))
            .collect::<Result<Vec<_>>>()?;
        let route = build_route(graph.adjacency(), &waypoint_ids)?;

        self.power_on(ctx).await?;
        info!(
            "[NAV] Navigating route of {} waypoints ({} edges)",
            route.waypoint_ids.len(),
            route.edge_ids.len()
        );
        self.run_loop(NavCommand::Route(route), ctx).await
    }

    /// Continuous anchored-pose navigation
    pub async fn navigate_to_anchor(
        &self,
        goal: &AnchorGoal,
        ctx: &mut OperationContext,
    ) -> Result<Outcome> {
        let target = self.prepare_anchor(goal, ctx).await?;
        self.run_loop(NavCommand::ToAnchor(target.pose.clone()), ctx)
            .await
    }

    /// Fill in goal defaults and power on, ready for [`Self::step_to_anchor`]
    pub async fn prepare_anchor(
        &self,
        goal: &AnchorGoal,
        ctx: &mut OperationContext,
    ) -> Result<AnchorTarget> {
        let graph = self.graph.clone().read_owned().await;
        if !graph.is_loaded() {
            return Err(NavError::NoGraph);
        }

        let z = match goal.z {
            Some(z) => z,
            None => {
                let state = self.robot.get_localization_state().await?;
                state
                    .seed_pose()
                    .ok_or(NavError::NotLocalized)?
                    .position_or_origin()
                    .z
            }
        };
        let rotation = goal
            .orientation
            .as_ref()
            .map(Orientation::to_quaternion)
            .unwrap_or_else(Quaternion::identity);
        let pose = Se3Pose::new(Vec3::new(goal.x, goal.y, z), rotation);

        self.power_on(ctx).await?;
        ctx.command = None;
        info!(
            "[NAV] Navigating to seed pose ({:.2}, {:.2}, {:.2})",
            goal.x, goal.y, z
        );
        Ok(AnchorTarget {
            pose,
            _graph: graph,
        })
    }

    /// One poll iteration toward an anchored pose
    pub async fn step_to_anchor(
        &self,
        target: &AnchorTarget,
        ctx: &mut OperationContext,
    ) -> Result<StepStatus> {
        self.poll_iteration(&NavCommand::ToAnchor(target.pose.clone()), ctx)
            .await
    }

    /// End-of-operation power cleanup
    ///
    /// Sits the robot down if it got lost; otherwise powers off only when
    /// this operation powered on and the policy asks for it.
    pub async fn finish(&self, ctx: &OperationContext) -> Result<()> {
        if ctx.must_settle {
            warn!("[NAV] Robot lost, sitting down");
            return self.power.ensure_off().await.map(|_| ());
        }
        if !self.config.power_off_on_completion {
            debug!("[NAV] Leaving motors on");
            return Ok(());
        }
        self.power.release(ctx.powered_on_here).await
    }

    async fn power_on(&self, ctx: &mut OperationContext) -> Result<()> {
        self.power.ensure_on(&mut ctx.powered_on_here).await?;
        Ok(())
    }

    async fn run_loop(&self, command: NavCommand, ctx: &mut OperationContext) -> Result<Outcome> {
        ctx.command = None;
        loop {
            if let StepStatus::Finished(outcome) = self.poll_iteration(&command, ctx).await? {
                return Ok(outcome);
            }
        }
    }

    async fn poll_iteration(
        &self,
        command: &NavCommand,
        ctx: &mut OperationContext,
    ) -> Result<StepStatus> {
        let localization = self.robot.get_localization_state().await?;
        if let Some(pose) = localization.seed_pose() {
            ctx.last_pose = Some(PlanarPose::from(pose));
        }

        let handle = command
            .issue(self.robot.as_ref(), self.config.cmd_duration_secs, ctx.command)
            .await?;
        ctx.command = handle;
        ctx.iterations += 1;

        let Some(handle) = handle else {
            warn!("[NAV] Robot returned no command");
            return Ok(StepStatus::Finished(Outcome::Failure(FailureKind::NoCommand)));
        };

        sleep(self.config.poll_interval()).await;

        let status = self.robot.navigation_feedback(handle).await?;
        debug!(
            "[NAV] #{} cmd={} status={:?} pose={:?}",
            ctx.iterations,
            handle.id(),
            status,
            ctx.last_pose
        );

        let step = classify(status);
        match step {
            StepStatus::Finished(Outcome::Success) => info!("[NAV] Goal reached"),
            StepStatus::Finished(Outcome::Failure(kind)) => {
                warn!("[NAV] Navigation failed: {:?}", kind);
                if kind == FailureKind::Lost {
                    ctx.must_settle = true;
                }
            }
            StepStatus::InProgress => {}
        }
        Ok(step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::store::fixtures;
    use crate::robot::mock::MockRobot;
    use graphnav_shared::NavigationStatus::*;
    use std::f64::consts::FRAC_PI_2;
    use std::time::Duration;

    fn fast_config() -> NavigationConfig {
        NavigationConfig {
            poll_interval_ms: 1,
            power_poll_interval_ms: 1,
            power_on_timeout_ms: 200,
            lease_retain_interval_ms: 5,
            ..Default::default()
        }
    }

    async fn controller(mock: &Arc<MockRobot>) -> NavigationController {
        let store = fixtures::loaded_store(false).await;
        NavigationController::new(mock.clone(), Arc::new(RwLock::new(store)), fast_config())
    }

    #[tokio::test]
    async fn test_loop_until_reached() {
        let mock = Arc::new(
            MockRobot::new()
                .powered_on()
                .with_feedback(&[StatusFollowingRoute, StatusFollowingRoute, StatusReachedGoal]),
        );
        let nav = controller(&mock).await;
        let mut ctx = OperationContext::new();

        let outcome = nav.navigate_to_waypoint("dock", &mut ctx).await.unwrap();
        assert_eq!(outcome, Outcome::Success);
        assert_eq!(ctx.iterations, 3);

        let state = mock.state();
        assert_eq!(state.navigate_calls, 3);
        // First issue starts a command, later ones continue it
        let first = CommandHandle::from_wire(1);
        assert_eq!(state.issued_handles, vec![None, first, first]);
    }

    #[tokio::test]
    async fn test_loop_stops_when_lost() {
        let mock = Arc::new(
            MockRobot::new()
                .powered_on()
                .with_feedback(&[StatusFollowingRoute, StatusLost]),
        );
        let nav = controller(&mock).await;
        let mut ctx = OperationContext::new();

        let outcome = nav.navigate_to_waypoint("hall", &mut ctx).await.unwrap();
        assert_eq!(outcome, Outcome::Failure(FailureKind::Lost));
        assert_eq!(ctx.iterations, 2);
        assert!(ctx.must_settle);

        // Lost robots are sat down even when someone else powered them
        nav.finish(&ctx).await.unwrap();
        assert_eq!(mock.state().power_off_calls, 1);
    }

    #[tokio::test]
    async fn test_missing_handle_fails_without_feedback_call() {
        let mock = Arc::new(MockRobot::new().powered_on());
        mock.state().return_no_command = true;
        let nav = controller(&mock).await;
        let mut ctx = OperationContext::new();

        let outcome = nav.navigate_to_waypoint("dock", &mut ctx).await.unwrap();
        assert_eq!(outcome, Outcome::Failure(FailureKind::NoCommand));
        assert_eq!(mock.state().feedback_calls, 0);
    }

    #[tokio::test]
    async fn test_remote_failure_aborts() {
        let mock = Arc::new(MockRobot::new().powered_on());
        mock.state().fail_navigation = true;
        let nav = controller(&mock).await;
        let mut ctx = OperationContext::new();

        let result = nav.navigate_to_waypoint("dock", &mut ctx).await;
        assert!(matches!(result, Err(NavError::Remote(_))));
        assert_eq!(mock.state().navigate_calls, 1);
    }

    #[tokio::test]
    async fn test_resolution_errors_make_no_remote_calls() {
        let mock = Arc::new(MockRobot::new());
        let nav = controller(&mock).await;
        let mut ctx = OperationContext::new();

        assert!(matches!(
            nav.navigate_to_waypoint("lab", &mut ctx).await,
            Err(NavError::AmbiguousWaypoint { .. })
        ));

        let tokens = vec!["dock".to_string(), "ef".to_string()];
        assert!(matches!(
            nav.navigate_route(&tokens, &mut ctx).await,
            Err(NavError::NoEdge { .. })
        ));

        let state = mock.state();
        assert_eq!(state.power_on_calls, 0);
        assert_eq!(state.navigate_calls, 0);
    }

    #[tokio::test]
    async fn test_route_and_conditional_power_off() {
        let mock = Arc::new(MockRobot::new().with_feedback(&[StatusReachedGoal]));
        let nav = controller(&mock).await;
        let mut ctx = OperationContext::new();

        let tokens = vec!["dock".to_string(), "hall".to_string(), "ef".to_string()];
        let outcome = nav.navigate_route(&tokens, &mut ctx).await.unwrap();
        assert_eq!(outcome, Outcome::Success);
        assert!(ctx.powered_on_here);

        let edges = mock
            .state()
            .last_route
            .as_ref()
            .map(|r| r.edge_ids.len());
        assert_eq!(edges, Some(2));

        nav.finish(&ctx).await.unwrap();
        assert_eq!(mock.state().power_on_calls, 1);
        assert_eq!(mock.state().power_off_calls, 1);
    }

    #[tokio::test]
    async fn test_power_off_policy_can_be_disabled() {
        let mock = Arc::new(MockRobot::new().with_feedback(&[StatusReachedGoal]));
        let store = fixtures::loaded_store(false).await;
        let config = NavigationConfig {
            power_off_on_completion: false,
            ..fast_config()
        };
        let nav = NavigationController::new(mock.clone(), Arc::new(RwLock::new(store)), config);
        let mut ctx = OperationContext::new();

        nav.navigate_to_waypoint("dock", &mut ctx).await.unwrap();
        nav.finish(&ctx).await.unwrap();
        assert_eq!(mock.state().power_off_calls, 0);
    }

    #[tokio::test]
    async fn test_anchor_defaults() {
        let mock = Arc::new(
            MockRobot::new()
                .powered_on()
                .localized_at("alpha-bravo-0001", 0.0, 0.0, 0.7, 0.0),
        );
        let nav = controller(&mock).await;
        let mut ctx = OperationContext::new();

        let target = nav
            .prepare_anchor(&AnchorGoal::planar(1.5, -2.0), &mut ctx)
            .await
            .unwrap();
        let position = target.pose.position_or_origin();
        assert_eq!((position.x, position.y, position.z), (1.5, -2.0, 0.7));
        assert_eq!(target.pose.rotation_or_identity(), Quaternion::identity());

        let goal = AnchorGoal {
            orientation: Some(Orientation::Yaw(FRAC_PI_2)),
            ..AnchorGoal::planar(1.0, 1.0)
        };
        let target = nav.prepare_anchor(&goal, &mut ctx).await.unwrap();
        let rotation = target.pose.rotation_or_identity();
        assert!((rotation.z - (FRAC_PI_2 / 2.0).sin()).abs() < 1e-9);
        assert!((rotation.yaw() - FRAC_PI_2).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_anchor_needs_localization_for_default_z() {
        let mock = Arc::new(MockRobot::new().powered_on());
        let nav = controller(&mock).await;
        let mut ctx = OperationContext::new();

        assert!(matches!(
            nav.prepare_anchor(&AnchorGoal::planar(1.0, 1.0), &mut ctx).await,
            Err(NavError::NotLocalized)
        ));

        // Explicit z needs no localization
        let goal = AnchorGoal {
            z: Some(0.1),
            ..AnchorGoal::planar(1.0, 1.0)
        };
        assert!(nav.prepare_anchor(&goal, &mut ctx).await.is_ok());
    }

    #[tokio::test]
    async fn test_single_step_anchor() {
        let mock = Arc::new(
            MockRobot::new()
                .powered_on()
                .localized_at("alpha-bravo-0001", 0.2, 0.1, 0.0, 0.3)
                .with_feedback(&[StatusFollowingRoute, StatusReachedGoal]),
        );
        let nav = controller(&mock).await;
        let mut ctx = OperationContext::new();

        let target = nav
            .prepare_anchor(&AnchorGoal::planar(3.0, 0.0), &mut ctx)
            .await
            .unwrap();

        assert_eq!(
            nav.step_to_anchor(&target, &mut ctx).await.unwrap(),
            StepStatus::InProgress
        );
        let pose = ctx.last_pose.expect("pose read");
        assert!((pose.x - 0.2).abs() < 1e-9);
        assert!((pose.yaw - 0.3).abs() < 1e-9);

        assert_eq!(
            nav.step_to_anchor(&target, &mut ctx).await.unwrap(),
            StepStatus::Finished(Outcome::Success)
        );
        assert_eq!(mock.state().last_anchor_goal, Some(target.pose.clone()));
    }

    #[tokio::test]
    async fn test_execute_dispatch() {
        let mock = Arc::new(
            MockRobot::new()
                .powered_on()
                .localized_at("alpha-bravo-0001", 0.0, 0.0, 0.0, 0.0)
                .with_feedback(&[StatusReachedGoal, StatusStuck, StatusRobotImpaired]),
        );
        let nav = controller(&mock).await;

        let requests = [
            NavigationRequest::ToWaypoint("ef".into()),
            NavigationRequest::Route(vec!["hall".into(), "dock".into()]),
            NavigationRequest::ToAnchoredPose(AnchorGoal::planar(1.0, 0.0)),
        ];
        let mut outcomes = Vec::new();
        for request in &requests {
            let mut ctx = OperationContext::new();
            outcomes.push(nav.execute(request, &mut ctx).await.unwrap());
        }

        assert_eq!(
            outcomes,
            vec![
                Outcome::Success,
                Outcome::Failure(FailureKind::Stuck),
                Outcome::Failure(FailureKind::Impaired),
            ]
        );
    }

    #[tokio::test]
    async fn test_clear_graph_invalidates_cache() {
        let mock = Arc::new(MockRobot::new());
        let nav = controller(&mock).await;

        nav.clear_graph().await.unwrap();
        assert_eq!(mock.state().clear_graph_calls, 1);
        assert!(!nav.graph().read().await.is_loaded());

        let mut ctx = OperationContext::new();
        assert!(matches!(
            nav.navigate_to_waypoint("dock", &mut ctx).await,
            Err(NavError::NoGraph)
        ));
    }

    #[tokio::test]
    async fn test_anchor_target_holds_graph() {
        let mock = Arc::new(
            MockRobot::new()
                .powered_on()
                .localized_at("alpha-bravo-0001", 0.0, 0.0, 0.0, 0.0),
        );
        let nav = controller(&mock).await;
        let mut ctx = OperationContext::new();

        let target = nav
            .prepare_anchor(&AnchorGoal::planar(1.0, 0.0), &mut ctx)
            .await
            .unwrap();

        // Clearing waits until the anchored navigation lets go of the map
        assert!(tokio::time::timeout(Duration::from_millis(20), nav.clear_graph())
            .await
            .is_err());
        assert_eq!(mock.state().clear_graph_calls, 0);
        assert!(nav.graph().read().await.is_loaded());

        drop(target);
        nav.clear_graph().await.unwrap();
        assert_eq!(mock.state().clear_graph_calls, 1);
    }

    #[tokio::test]
    async fn test_localize_at_waypoint() {
        let mock = Arc::new(MockRobot::new());
        let nav = controller(&mock).await;

        assert_eq!(
            nav.localize_at_waypoint("dock").await.unwrap(),
            "alpha-bravo-0001"
        );
        nav.localize_at_fiducial().await.unwrap();

        let state = mock.state();
        let by_waypoint = &state.set_localization_requests[0];
        assert_eq!(
            by_waypoint.initial_guess.as_ref().map(|g| g.waypoint_id.as_str()),
            Some("alpha-bravo-0001")
        );
        assert!((by_waypoint.max_distance - 0.2).abs() < 1e-9);
        assert!((by_waypoint.max_yaw - 20f64.to_radians()).abs() < 1e-9);
        assert_eq!(
            by_waypoint.fiducial_init,
            FiducialInit::FiducialInitNoFiducial as i32
        );

        let by_fiducial = &state.set_localization_requests[1];
        assert!(by_fiducial.initial_guess.is_none());
        assert_eq!(
            by_fiducial.fiducial_init,
            FiducialInit::FiducialInitNearest as i32
        );
    }
}
