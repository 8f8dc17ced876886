//! Scoped robot lease with keep-alive
//!
//! A [`LeaseGuard`] is the only way to hold the lease. It retains the lease in
//! the background and returns it on `release`, or from `Drop` if the holder
//! unwinds without releasing.

use crate::error::{NavError, Result};
use crate::robot::{RobotError, SharedRobot};
use graphnav_shared::Lease;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

/// Hands out the robot lease to at most one holder at a time
pub struct LeaseManager {
    robot: SharedRobot,
    /// In-process exclusion, checked before asking the robot
    local: Arc<Mutex<()>>,
    retain_interval: Duration,
}

impl LeaseManager {
    pub fn new(robot: SharedRobot, retain_interval: Duration) -> Self {
        Self {
            robot,
            local: Arc::new(Mutex::new(())),
            retain_interval,
        }
    }

    /// Claim the lease without waiting
    ///
    /// Fails with [`NavError::LeaseUnavailable`] if another holder in this
    /// process or another client of the robot has it.
    pub async fn acquire(&self) -> Result<LeaseGuard> {
        let local = self.local.clone().try_lock_owned().map_err(|_| {
            warn!("[LEASE] Lease already held by another operation");
            NavError::LeaseUnavailable
        })?;

        let lease = match self.robot.acquire_lease().await {
            Ok(lease) => lease,
            Err(RobotError::AlreadyClaimed) => {
                warn!("[LEASE] Lease claimed by another client");
                return Err(NavError::LeaseUnavailable);
            }
            Err(e) => return Err(e.into()),
        };
        info!("[LEASE] Acquired {} #{}", lease.resource, lease.sequence);

        let keepalive = spawn_keepalive(self.robot.clone(), lease.clone(), self.retain_interval);

        Ok(LeaseGuard {
            robot: self.robot.clone(),
            lease: Some(lease),
            keepalive,
            local: Some(local),
        })
    }
}

fn spawn_keepalive(robot: SharedRobot, lease: Lease, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        // First tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match robot.retain_lease(&lease).await {
                Ok(()) => debug!("[LEASE] Retained #{}", lease.sequence),
                Err(e) => warn!("[LEASE] Retain failed: {}", e),
            }
        }
    })
}

/// Held lease; dropping it returns the lease on the runtime
pub struct LeaseGuard {
    robot: SharedRobot,
    lease: Option<Lease>,
    keepalive: JoinHandle<()>,
    local: Option<OwnedMutexGuard<()>>,
}

impl LeaseGuard {
    pub fn lease(&self) -> Option<&Lease> {
        self.lease.as_ref()
    }

    /// Stop the keep-alive and hand the lease back to the robot
    pub async fn release(mut self) -> Result<()> {
        self.keepalive.abort();
        if let Some(lease) = self.lease.take() {
            self.robot.return_lease(&lease).await?;
            info!("[LEASE] Returned #{}", lease.sequence);
        }
        Ok(())
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.keepalive.abort();

        let Some(lease) = self.lease.take() else {
            return;
        };

        match Handle::try_current() {
            Ok(handle) => {
                let robot = self.robot.clone();
                // Keep local exclusion until the robot has the lease back
                let local = self.local.take();
                handle.spawn(async move {
                    match robot.return_lease(&lease).await {
                        Ok(()) => info!("[LEASE] Returned #{} on drop", lease.sequence),
                        Err(e) => warn!("[LEASE] Return on drop failed: {}", e),
                    }
                    drop(local);
                });
            }
            Err(_) => {
                warn!(
                    "[LEASE] Lease #{} dropped outside the runtime; left to expire",
                    lease.sequence
                );
            }
        }
    }
}
