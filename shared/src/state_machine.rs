//! Motor Power State Machine
//!
//! Tracks the last known motor power state of the robot and validates the
//! transitions requested by the client.

use crate::MotorPowerState;

/// Power state as seen by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    Off,
    TransitioningOn,
    On,
    TransitioningOff,
}

impl PowerState {
    /// Map a reported motor state; `None` for unknown or error reports
    pub fn from_motor(state: MotorPowerState) -> Option<Self> {
        match state {
            MotorPowerState::StateOff => Some(PowerState::Off),
            MotorPowerState::StateOn => Some(PowerState::On),
            MotorPowerState::StatePoweringOn => Some(PowerState::TransitioningOn),
            MotorPowerState::StatePoweringOff => Some(PowerState::TransitioningOff),
            MotorPowerState::StateUnknown | MotorPowerState::StateError => None,
        }
    }
}

/// Events that can trigger state transitions
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PowerEvent {
    /// Client issued a power-on command
    PowerOnRequested,
    /// Client issued a safe power-off command
    PowerOffRequested,
    /// Robot state read back from the robot
    Observed(MotorPowerState),
}

/// Result of a state transition attempt
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionResult {
    /// State changed
    Success(PowerState),
    /// Event accepted, state already satisfied it
    Unchanged(PowerState),
    /// Transition was invalid from current state
    Invalid { from: PowerState, event: PowerEvent },
}

#[derive(Debug)]
pub struct PowerStateMachine {
    current_state: PowerState,
}

impl Default for PowerStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl PowerStateMachine {
    /// Create a new state machine in Off state
    pub fn new() -> Self {
        Self {
            current_state: PowerState::Off,
        }
    }

    pub fn state(&self) -> PowerState {
        self.current_state
    }

    pub fn is_on(&self) -> bool {
        self.current_state == PowerState::On
    }

    /// Process an event and return the transition result
    pub fn process_event(&mut self, event: PowerEvent) -> TransitionResult {
        let next = match event {
            // Robot reports always win over what we asked for
            PowerEvent::Observed(motor) => match PowerState::from_motor(motor) {
                Some(state) => state,
                None => {
                    return TransitionResult::Invalid {
                        from: self.current_state,
                        event,
                    }
                }
            },
            _ => match self.get_next_state(&event) {
                Some(state) => state,
                None => {
                    return TransitionResult::Invalid {
                        from: self.current_state,
                        event,
                    }
                }
            },
        };

        if next == self.current_state {
            TransitionResult::Unchanged(next)
        } else {
            self.current_state = next;
            TransitionResult::Success(next)
        }
    }

    /// Get the next state for a command event, if the transition is valid
    fn get_next_state(&self, event: &PowerEvent) -> Option<PowerState> {
        use PowerEvent::*;
        use PowerState::*;

        match (self.current_state, event) {
            (Off | TransitioningOff, PowerOnRequested) => Some(TransitioningOn),
            (TransitioningOn | On, PowerOnRequested) => Some(self.current_state),

            (On | TransitioningOn, PowerOffRequested) => Some(TransitioningOff),
            (TransitioningOff | Off, PowerOffRequested) => Some(self.current_state),

            _ => None,
        }
    }
}
