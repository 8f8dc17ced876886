//! Goal server: hosts navigation tasks behind a goal/feedback/result/cancel
//! surface, independent of whatever transport carries the goals.

use super::executor::{CancelToken, NavigationTask, TaskFailure, TaskResult};
use crate::lease::LeaseManager;
use crate::navigation::{AnchorGoal, NavigationController, PlanarPose};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

const FEEDBACK_BUFFER: usize = 32;

/// A goal that has been accepted and is still running
struct ActiveGoal {
    cancel: CancelToken,
    task: JoinHandle<()>,
}

/// Caller's side of an accepted goal
pub struct GoalHandle {
    pub id: u64,
    cancel: CancelToken,
    feedback: mpsc::Receiver<PlanarPose>,
    result: oneshot::Receiver<TaskResult>,
}

impl GoalHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Next feedback pose; `None` once the goal has finished
    pub async fn next_feedback(&mut self) -> Option<PlanarPose> {
        self.feedback.recv().await
    }

    pub async fn result(self) -> TaskResult {
        self.result.await.unwrap_or_else(|_| {
            TaskResult::Failed(TaskFailure::Error("goal ended without a result".into()))
        })
    }
}

pub struct GoalServer {
    controller: Arc<NavigationController>,
    leases: Arc<LeaseManager>,
    next_goal_id: AtomicU64,
    active: Arc<Mutex<HashMap<u64, ActiveGoal>>>,
}

impl GoalServer {
    pub fn new(controller: Arc<NavigationController>, leases: Arc<LeaseManager>) -> Self {
        Self {
            controller,
            leases,
            next_goal_id: AtomicU64::new(0),
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Accept a goal and start running it
    ///
    /// Every goal is accepted. Goals that find the lease taken fail right
    /// away with [`TaskFailure::LeaseUnavailable`] instead of queueing.
    pub async fn submit(&self, goal: AnchorGoal) -> GoalHandle {
        let id = self.next_goal_id.fetch_add(1, Ordering::SeqCst) + 1;
        info!(
            "[TASK] Goal {} accepted: ({:.2}, {:.2})",
            id, goal.x, goal.y
        );

        let cancel = CancelToken::new();
        let (feedback_tx, feedback_rx) = mpsc::channel(FEEDBACK_BUFFER);
        let (result_tx, result_rx) = oneshot::channel();

        let task = NavigationTask::new(self.controller.clone(), self.leases.clone(), goal);
        let cancel_rx = cancel.subscribe();

        // Hold the map until the entry is in, so a fast goal cannot remove
        // itself before it was added
        let mut active = self.active.lock().await;
        let registry = self.active.clone();
        let handle = tokio::spawn(async move {
            let result = match tokio::spawn(task.run(cancel_rx, feedback_tx)).await {
                Ok(result) => result,
                Err(e) => {
                    error!("[TASK] Goal {} aborted: {}", id, e);
                    TaskResult::Failed(TaskFailure::Error(e.to_string()))
                }
            };
            registry.lock().await.remove(&id);
            info!("[TASK] Goal {} result: {:?}", id, result);
            let _ = result_tx.send(result);
        });
        active.insert(
            id,
            ActiveGoal {
                cancel: cancel.clone(),
                task: handle,
            },
        );

        GoalHandle {
            id,
            cancel,
            feedback: feedback_rx,
            result: result_rx,
        }
    }

    /// Request cancellation of one goal; false if it is not running
    pub async fn cancel(&self, id: u64) -> bool {
        match self.active.lock().await.get(&id) {
            Some(goal) => {
                info!("[TASK] Cancel requested for goal {}", id);
                goal.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn active_count(&self) -> usize {
        self.active.lock().await.len()
    }

    /// Cancel every running goal and wait for all of them
    pub async fn shutdown(&self) {
        let goals: Vec<ActiveGoal> = self.active.lock().await.drain().map(|(_, g)| g).collect();
        if goals.is_empty() {
            return;
        }
        info!("[TASK] Shutting down {} goals", goals.len());

        for goal in &goals {
            goal.cancel.cancel();
        }
        for joined in join_all(goals.into_iter().map(|g| g.task)).await {
            if let Err(e) = joined {
                warn!("[TASK] Goal task failed to join: {}", e);
            }
        }
    }
}
