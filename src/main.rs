mod config;
mod error;
mod graph;
mod lease;
mod navigation;
mod power;
mod robot;
mod task;

use anyhow::Context;
use config::ClientConfig;
use error::NavError;
use graph::GraphStore;
use lease::LeaseManager;
use navigation::{AnchorGoal, NavigationController, NavigationRequest, OperationContext};
use robot::{RpcRobotClient, SharedRobot};
use std::path::PathBuf;
use std::sync::Arc;
use task::GoalServer;
use tokio::sync::RwLock;

use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => ClientConfig::load(&PathBuf::from(path))?,
        None => ClientConfig::default(),
    };

    info!("GraphNav client starting");
    info!("  Robot: {}", config.robot.address);
    info!("  Graph: {}", config.graph.upload_path.display());

    let robot: SharedRobot = Arc::new(
        RpcRobotClient::connect(&config.robot)
            .await
            .context("Robot connection failed")?,
    );

    let graph = Arc::new(RwLock::new(GraphStore::new()));
    let controller = Arc::new(NavigationController::new(
        robot.clone(),
        graph,
        config.navigation.clone(),
    ));
    let leases = Arc::new(LeaseManager::new(
        robot.clone(),
        config.navigation.lease_retain_interval(),
    ));

    // Map setup and waypoint navigation run under one lease
    let guard = match leases.acquire().await {
        Ok(guard) => guard,
        Err(NavError::LeaseUnavailable) => {
            error!("[MAIN] Robot lease is held by another client");
            return Err(NavError::LeaseUnavailable).context("Cannot command the robot");
        }
        Err(e) => return Err(e).context("Lease acquisition failed"),
    };
    let prepared = prepare_and_tour(&controller, &config).await;
    if let Err(e) = guard.release().await {
        warn!("[MAIN] Failed to return lease: {}", e);
    }
    prepared.context("Mission setup failed")?;

    run_goals(&controller, &leases, &config.mission.goals).await;

    info!("GraphNav client done");
    Ok(())
}

/// Load, upload and localize, then visit configured waypoints and route
async fn prepare_and_tour(
    controller: &NavigationController,
    config: &ClientConfig,
) -> Result<(), NavError> {
    if config.graph.clear_before_upload {
        controller.clear_graph().await?;
    }

    controller.load_graph(&config.graph.upload_path).await?;
    let upload = controller.upload_graph().await?;
    info!(
        "[MAIN] Graph uploaded ({} waypoint and {} edge snapshots sent)",
        upload.waypoint_snapshots_sent, upload.edge_snapshots_sent
    );

    controller.refresh_graph().await?;

    if config.graph.localize_with_fiducial {
        controller.localize_at_fiducial().await?;
    } else if let Some(waypoint) = &config.graph.initial_waypoint {
        controller.localize_at_waypoint(waypoint).await?;
    }

    let localization = controller.get_localization_state().await?;
    match localization.waypoint_id() {
        Some(id) => info!("[MAIN] Localized at {}", id),
        None => warn!("[MAIN] Robot is not localized"),
    }

    let mut requests: Vec<NavigationRequest> = config
        .mission
        .waypoints
        .iter()
        .map(|token| NavigationRequest::ToWaypoint(token.clone()))
        .collect();
    if !config.mission.route.is_empty() {
        requests.push(NavigationRequest::Route(config.mission.route.clone()));
    }

    // One power session across the whole tour
    let mut ctx = OperationContext::new();
    let mut result = Ok(());
    for request in &requests {
        match controller.execute(request, &mut ctx).await {
            Ok(outcome) if outcome.is_success() => {
                info!("[MAIN] {:?} complete", request);
            }
            Ok(outcome) => {
                warn!("[MAIN] {:?} ended with {:?}", request, outcome);
                break;
            }
            Err(e) => {
                error!("[MAIN] {:?} failed: {}", request, e);
                result = Err(e);
                break;
            }
        }
    }

    let cleanup = controller.finish(&ctx).await;
    result.and(cleanup)
}

/// Run each anchored goal through the goal server, one at a time
async fn run_goals(
    controller: &Arc<NavigationController>,
    leases: &Arc<LeaseManager>,
    goals: &[Vec<f64>],
) {
    if goals.is_empty() {
        return;
    }

    let server = GoalServer::new(controller.clone(), leases.clone());

    for (index, components) in goals.iter().enumerate() {
        let goal = match AnchorGoal::try_from(components.as_slice()) {
            Ok(goal) => goal,
            Err(e) => {
                warn!("[MAIN] Skipping goal {}: {}", index + 1, e);
                continue;
            }
        };

        let mut handle = server.submit(goal).await;
        let interrupted = loop {
            tokio::select! {
                feedback = handle.next_feedback() => match feedback {
                    Some(pose) => info!(
                        "[MAIN] Goal {} at ({:.2}, {:.2}) yaw {:.2}",
                        handle.id, pose.x, pose.y, pose.yaw
                    ),
                    None => break false,
                },
                _ = tokio::signal::ctrl_c() => {
                    warn!("[MAIN] Interrupted, cancelling goal {}", handle.id);
                    handle.cancel();
                    break true;
                }
            }
        };

        let id = handle.id;
        let result = handle.result().await;
        if result.success() {
            info!("[MAIN] Goal {} reached", id);
        } else {
            warn!("[MAIN] Goal {} finished: {:?}", id, result);
        }

        if interrupted {
            break;
        }
    }

    server.shutdown().await;
}
