//! Navigation requests and the controller that runs them

pub mod controller;
pub mod request;

pub use controller::{AnchorTarget, NavigationController, OperationContext};
pub use request::{
    classify, AnchorGoal, FailureKind, NavigationRequest, Orientation, Outcome, PlanarPose,
    StepStatus,
};
