//! Cancellable navigation tasks and the goal server hosting them

pub mod executor;
pub mod server;

pub use executor::{CancelToken, NavigationTask, TaskFailure, TaskResult};
pub use server::{GoalHandle, GoalServer};
