//! Cancellable anchored-pose navigation task
//!
//! Drives the single-step anchored navigation once per poll iteration and
//! checks for cancellation between steps. The lease is held for the whole
//! run and released on every exit path.

use crate::error::NavError;
use crate::lease::LeaseManager;
use crate::navigation::{
    AnchorGoal, FailureKind, NavigationController, OperationContext, Outcome, PlanarPose,
    StepStatus,
};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Why a task did not succeed
#[derive(Debug, Clone, PartialEq)]
pub enum TaskFailure {
    /// Another holder has the lease; worth retrying later
    LeaseUnavailable,
    /// The robot reported a terminal failure
    Terminal(FailureKind),
    /// Any other error, already logged
    Error(String),
}

/// Terminal result of a task
#[derive(Debug, Clone, PartialEq)]
pub enum TaskResult {
    Succeeded,
    Failed(TaskFailure),
    Cancelled,
}

impl TaskResult {
    pub fn success(&self) -> bool {
        matches!(self, TaskResult::Succeeded)
    }
}

/// Cancellation flag shared between a goal's owner and its task
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Resolves once cancellation is requested; never if the token is gone
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    if cancel.wait_for(|c| *c).await.is_err() {
        std::future::pending::<()>().await;
    }
}

pub struct NavigationTask {
    controller: Arc<NavigationController>,
    leases: Arc<LeaseManager>,
    goal: AnchorGoal,
}

impl NavigationTask {
    pub fn new(
        controller: Arc<NavigationController>,
        leases: Arc<LeaseManager>,
        goal: AnchorGoal,
    ) -> Self {
        Self {
            controller,
            leases,
            goal,
        }
    }

    /// Run to a terminal result
    ///
    /// Feedback is offered at most once per iteration and dropped if the
    /// receiver is not keeping up.
    pub async fn run(
        self,
        mut cancel: watch::Receiver<bool>,
        feedback: mpsc::Sender<PlanarPose>,
    ) -> TaskResult {
        let guard = match self.leases.acquire().await {
            Ok(guard) => guard,
            Err(NavError::LeaseUnavailable) => {
                return TaskResult::Failed(TaskFailure::LeaseUnavailable)
            }
            Err(e) => {
                warn!("[TASK] Lease acquisition failed: {}", e);
                return TaskResult::Failed(TaskFailure::Error(e.to_string()));
            }
        };

        let mut ctx = OperationContext::new();
        let result = self.drive(&mut cancel, &feedback, &mut ctx).await;

        if let Err(e) = self.controller.finish(&ctx).await {
            warn!("[TASK] Power cleanup failed: {}", e);
        }
        if let Err(e) = guard.release().await {
            warn!("[TASK] Lease return failed: {}", e);
        }

        info!("[TASK] Finished after {} steps: {:?}", ctx.iterations, result);
        result
    }

    async fn drive(
        &self,
        cancel: &mut watch::Receiver<bool>,
        feedback: &mpsc::Sender<PlanarPose>,
        ctx: &mut OperationContext,
    ) -> TaskResult {
        if *cancel.borrow() {
            info!("[TASK] Cancelled before start");
            return TaskResult::Cancelled;
        }

        let prepared = tokio::select! {
            biased;
            _ = cancelled(cancel) => return TaskResult::Cancelled,
            prepared = self.controller.prepare_anchor(&self.goal, ctx) => prepared,
        };
        let target = match prepared {
            Ok(target) => target,
            Err(e) => return failed(e),
        };

        loop {
            if *cancel.borrow() {
                info!("[TASK] Cancelled");
                return TaskResult::Cancelled;
            }

            let step = tokio::select! {
                biased;
                _ = cancelled(cancel) => {
                    info!("[TASK] Cancelled mid-step");
                    return TaskResult::Cancelled;
                }
                step = self.controller.step_to_anchor(&target, ctx) => step,
            };

            let status = match step {
                Ok(status) => status,
                Err(e) => return failed(e),
            };

            if let Some(pose) = ctx.last_pose {
                if feedback.try_send(pose).is_err() {
                    debug!("[TASK] Feedback dropped");
                }
            }

            match status {
                StepStatus::InProgress => {}
                StepStatus::Finished(Outcome::Success) => return TaskResult::Succeeded,
                StepStatus::Finished(Outcome::Failure(kind)) => {
                    return TaskResult::Failed(TaskFailure::Terminal(kind))
                }
            }
        }
    }
}

fn failed(error: NavError) -> TaskResult {
    warn!("[TASK] Navigation error: {}", error);
    match error {
        NavError::LeaseUnavailable => TaskResult::Failed(TaskFailure::LeaseUnavailable),
        other => TaskResult::Failed(TaskFailure::Error(other.to_string())),
    }
}
