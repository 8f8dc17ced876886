//! Configuration loading for the navigation client

use anyhow::{Context, Result};
use graphnav_shared::timing;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub robot: RobotConnectionConfig,
    #[serde(default)]
    pub graph: GraphConfig,
    #[serde(default)]
    pub navigation: NavigationConfig,
    #[serde(default)]
    pub mission: MissionConfig,
}

/// Robot service connection settings
#[derive(Clone, Debug, Deserialize)]
pub struct RobotConnectionConfig {
    /// Robot navigation service address (default: 127.0.0.1:50051)
    #[serde(default = "default_address")]
    pub address: String,

    /// Connection timeout in milliseconds (default: 5000)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Per-request response timeout in milliseconds (default: 10000)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    /// Name reported when claiming the lease
    #[serde(default = "default_client_name")]
    pub client_name: String,
}

/// Recorded map settings
#[derive(Clone, Debug, Deserialize)]
pub struct GraphConfig {
    /// Directory holding `graph`, `waypoint_snapshots/` and `edge_snapshots/`
    #[serde(default = "default_upload_path")]
    pub upload_path: PathBuf,

    /// Waypoint the robot stands at when the client starts
    #[serde(default)]
    pub initial_waypoint: Option<String>,

    /// Localize on the nearest fiducial instead of a waypoint
    #[serde(default)]
    pub localize_with_fiducial: bool,

    /// Clear the robot's graph before uploading
    #[serde(default)]
    pub clear_before_upload: bool,
}

/// Navigation loop timing and power policy
#[derive(Clone, Debug, Deserialize)]
pub struct NavigationConfig {
    /// Wait between issuing a command and reading its feedback (default: 500)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Validity of each issued navigation command (default: 1.0)
    #[serde(default = "default_cmd_duration")]
    pub cmd_duration_secs: f64,

    /// Wait between state reads while motors power on (default: 250)
    #[serde(default = "default_power_poll_interval")]
    pub power_poll_interval_ms: u64,

    /// Give up on motor power after this long (default: 10000)
    #[serde(default = "default_power_on_timeout")]
    pub power_on_timeout_ms: u64,

    /// Lease keep-alive period (default: 1000)
    #[serde(default = "default_lease_retain_interval")]
    pub lease_retain_interval_ms: u64,

    /// Power the robot back off after an operation that powered it on
    #[serde(default = "default_power_off_on_completion")]
    pub power_off_on_completion: bool,
}

/// What to do once the map is uploaded
#[derive(Clone, Debug, Default, Deserialize)]
pub struct MissionConfig {
    /// Waypoints to visit one by one (ids, names or short codes)
    #[serde(default)]
    pub waypoints: Vec<String>,

    /// Waypoints to traverse as a single route
    #[serde(default)]
    pub route: Vec<String>,

    /// Seed-frame goals, each `[x, y]`, `[x, y, yaw]`, `[x, y, z, yaw]` or
    /// `[x, y, z, qw, qx, qy, qz]`
    #[serde(default)]
    pub goals: Vec<Vec<f64>>,
}

impl Default for RobotConnectionConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            connect_timeout_ms: default_connect_timeout(),
            request_timeout_ms: default_request_timeout(),
            client_name: default_client_name(),
        }
    }
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            upload_path: default_upload_path(),
            initial_waypoint: None,
            localize_with_fiducial: false,
            clear_before_upload: false,
        }
    }
}

impl Default for NavigationConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            cmd_duration_secs: default_cmd_duration(),
            power_poll_interval_ms: default_power_poll_interval(),
            power_on_timeout_ms: default_power_on_timeout(),
            lease_retain_interval_ms: default_lease_retain_interval(),
            power_off_on_completion: default_power_off_on_completion(),
        }
    }
}

impl NavigationConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn power_poll_interval(&self) -> Duration {
        Duration::from_millis(self.power_poll_interval_ms)
    }

    pub fn power_on_timeout(&self) -> Duration {
        Duration::from_millis(self.power_on_timeout_ms)
    }

    pub fn lease_retain_interval(&self) -> Duration {
        Duration::from_millis(self.lease_retain_interval_ms)
    }
}

impl RobotConnectionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

// Default value functions
fn default_address() -> String {
    "127.0.0.1:50051".to_string()
}
fn default_connect_timeout() -> u64 {
    5000
}
fn default_request_timeout() -> u64 {
    10_000
}
fn default_client_name() -> String {
    "graphnav-client".to_string()
}
fn default_upload_path() -> PathBuf {
    PathBuf::from("downloaded_graph")
}
fn default_poll_interval() -> u64 {
    timing::POLL_INTERVAL_MS
}
fn default_cmd_duration() -> f64 {
    timing::COMMAND_DURATION_SECS
}
fn default_power_poll_interval() -> u64 {
    timing::POWER_POLL_INTERVAL_MS
}
fn default_power_on_timeout() -> u64 {
    timing::POWER_ON_TIMEOUT_MS
}
fn default_lease_retain_interval() -> u64 {
    timing::LEASE_RETAIN_INTERVAL_MS
}
fn default_power_off_on_completion() -> bool {
    true
}

impl ClientConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: ClientConfig = toml::from_str(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        Ok(config)
    }
}
