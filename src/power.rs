//! Motor power lifecycle
//!
//! Wraps the robot's power calls with confirmation polling and idempotent
//! no-ops. A power-on issued here is recorded in the caller's flag before
//! the command goes out, so it is undone even when the confirmation wait is
//! cut short by a timeout or a dropped future.

use crate::config::NavigationConfig;
use crate::error::{NavError, Result};
use crate::robot::SharedRobot;
use graphnav_shared::state_machine::{PowerEvent, PowerState, PowerStateMachine, TransitionResult};
use graphnav_shared::MotorPowerState;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

/// What `ensure_on` / `ensure_off` had to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerTransition {
    AlreadyOn,
    PoweredOn,
    AlreadyOff,
    PoweredOff,
}

pub struct PowerLifecycle {
    robot: SharedRobot,
    fsm: RwLock<PowerStateMachine>,
    poll_interval: Duration,
    timeout: Duration,
}

impl PowerLifecycle {
    pub fn new(robot: SharedRobot, config: &NavigationConfig) -> Self {
        Self {
            robot,
            fsm: RwLock::new(PowerStateMachine::new()),
            poll_interval: config.power_poll_interval(),
            timeout: config.power_on_timeout(),
        }
    }

    /// Last observed state
    pub async fn state(&self) -> PowerState {
        self.fsm.read().await.state()
    }

    /// Read the robot's motor state and fold it into the state machine
    pub async fn observe(&self) -> Result<PowerState> {
        let robot_state = self.robot.get_robot_state().await?;
        let motor = MotorPowerState::try_from(robot_state.motor_power_state)
            .unwrap_or(MotorPowerState::StateUnknown);

        let mut fsm = self.fsm.write().await;
        let from = fsm.state();
        match fsm.process_event(PowerEvent::Observed(motor)) {
            TransitionResult::Success(to) => {
                info!("[POWER] {:?} -> {:?}", from, to);
            }
            TransitionResult::Unchanged(_) => {}
            TransitionResult::Invalid { from, .. } => {
                warn!("[POWER] Robot reported {:?}; keeping {:?}", motor, from);
            }
        }
        Ok(fsm.state())
    }

    /// Power the motors on unless they already are
    ///
    /// Sets `powered_on_here` just before the power-on command is sent, then
    /// polls until the robot reports On or the power-on timeout elapses. On
    /// timeout the state is left as last observed.
    pub async fn ensure_on(&self, powered_on_here: &mut bool) -> Result<PowerTransition> {
        let mut issued = false;
        match self.observe().await? {
            PowerState::On => {
                debug!("[POWER] Motors already on");
                return Ok(PowerTransition::AlreadyOn);
            }
            PowerState::TransitioningOn => {
                info!("[POWER] Motors already powering on, waiting");
            }
            PowerState::Off | PowerState::TransitioningOff => {
                self.fsm
                    .write()
                    .await
                    .process_event(PowerEvent::PowerOnRequested);
                info!("[POWER] Powering on motors");
                *powered_on_here = true;
                self.robot.power_on_motors().await?;
                issued = true;
            }
        }

        let deadline = Instant::now() + self.timeout;
        loop {
            sleep(self.poll_interval).await;

            if self.observe().await? == PowerState::On {
                info!("[POWER] Motors on");
                break;
            }
            if Instant::now() >= deadline {
                warn!("[POWER] Motors not on after {:?}", self.timeout);
                return Err(NavError::Timeout {
                    what: "motor power on",
                    waited: self.timeout,
                });
            }
        }

        Ok(if issued {
            PowerTransition::PoweredOn
        } else {
            PowerTransition::AlreadyOn
        })
    }

    /// Sit the robot down and cut power unless already off
    ///
    /// Does not wait for the robot to report Off.
    pub async fn ensure_off(&self) -> Result<PowerTransition> {
        match self.observe().await? {
            PowerState::Off | PowerState::TransitioningOff => {
                debug!("[POWER] Motors already off");
                Ok(PowerTransition::AlreadyOff)
            }
            PowerState::On | PowerState::TransitioningOn => {
                self.fsm
                    .write()
                    .await
                    .process_event(PowerEvent::PowerOffRequested);
                info!("[POWER] Safe power off");
                self.robot.safe_power_off_motors().await?;
                Ok(PowerTransition::PoweredOff)
            }
        }
    }

    /// End-of-operation cleanup: power off only what this client powered on
    pub async fn release(&self, powered_on_here: bool) -> Result<()> {
        if !powered_on_here {
            debug!("[POWER] Leaving motor power as found");
            return Ok(());
        }
        self.ensure_off().await.map(|_| ())
    }
}
