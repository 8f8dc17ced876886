//! Error types for the navigation client

use crate::robot::RobotError;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Failures of a navigation operation
///
/// Resolution and validation errors are raised before any remote call is
/// made. Remote errors end the current operation only.
#[derive(Error, Debug)]
pub enum NavError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: prost::DecodeError,
    },

    #[error("No graph loaded")]
    NoGraph,

    #[error("Waypoint not found: {0}")]
    WaypointNotFound(String),

    #[error("Waypoint '{token}' is ambiguous: {candidates:?}")]
    AmbiguousWaypoint {
        token: String,
        candidates: Vec<String>,
    },

    #[error("No edge between waypoints {from} and {to}")]
    NoEdge { from: String, to: String },

    #[error("Route needs at least one waypoint")]
    EmptyRoute,

    #[error("Robot is not localized to the graph")]
    NotLocalized,

    #[error("Robot lease is held by another client")]
    LeaseUnavailable,

    #[error("Snapshot {0} requested by the robot was not loaded")]
    SnapshotNotLoaded(String),

    #[error("Invalid goal: {0}")]
    InvalidGoal(String),

    #[error("Timed out after {waited:?} waiting for {what}")]
    Timeout { what: &'static str, waited: Duration },

    #[error("Remote call failed: {0}")]
    Remote(#[from] RobotError),
}

pub type Result<T> = std::result::Result<T, NavError>;
