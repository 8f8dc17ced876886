//! In-memory graph and snapshot store
//!
//! Holds the currently loaded map, the snapshot blobs referenced by it and
//! the derived lookup views (annotation index, edge adjacency).

use super::route::Adjacency;
use crate::error::{NavError, Result};
use crate::robot::RobotClient;
use graphnav_shared::{Graph, Snapshot, SnapshotHeader, Waypoint};
use prost::Message;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const GRAPH_FILE: &str = "graph";
const WAYPOINT_SNAPSHOT_DIR: &str = "waypoint_snapshots";
const EDGE_SNAPSHOT_DIR: &str = "edge_snapshots";

/// What an upload sent and whether the robot ended up localized
#[derive(Debug, Clone, PartialEq)]
pub struct UploadResult {
    pub waypoint_snapshots_sent: usize,
    pub edge_snapshots_sent: usize,
    pub localized: bool,
}

#[derive(Debug, Default)]
pub struct GraphStore {
    graph: Option<Graph>,
    waypoint_snapshots: HashMap<String, Snapshot>,
    edge_snapshots: HashMap<String, Snapshot>,
    /// Annotation name -> waypoint id, `None` when several waypoints share the name
    annotations: BTreeMap<String, Option<String>>,
    adjacency: Adjacency,
}

impl GraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_loaded(&self) -> bool {
        self.graph.is_some()
    }

    pub fn graph(&self) -> Option<&Graph> {
        self.graph.as_ref()
    }

    /// Read `dir/graph` and every snapshot it references
    ///
    /// Replaces whatever was held before, but only once everything has been
    /// read; a failed load leaves the previous graph in place.
    pub async fn load(&mut self, dir: &Path) -> Result<&Graph> {
        let graph_path = dir.join(GRAPH_FILE);
        let graph: Graph = decode_file(&graph_path).await?;

        let mut waypoint_snapshots = HashMap::new();
        for waypoint in &graph.waypoints {
            if waypoint.snapshot_id.is_empty() {
                continue;
            }
            let path = dir.join(WAYPOINT_SNAPSHOT_DIR).join(&waypoint.snapshot_id);
            let snapshot = read_snapshot(&path, &waypoint.snapshot_id).await?;
            waypoint_snapshots.insert(waypoint.snapshot_id.clone(), snapshot);
        }

        let mut edge_snapshots = HashMap::new();
        for edge in &graph.edges {
            if edge.snapshot_id.is_empty() {
                continue;
            }
            let path = dir.join(EDGE_SNAPSHOT_DIR).join(&edge.snapshot_id);
            let snapshot = read_snapshot(&path, &edge.snapshot_id).await?;
            edge_snapshots.insert(edge.snapshot_id.clone(), snapshot);
        }

        info!(
            "[GRAPH] Loaded {} waypoints, {} edges from {} ({} + {} snapshots)",
            graph.waypoints.len(),
            graph.edges.len(),
            dir.display(),
            waypoint_snapshots.len(),
            edge_snapshots.len()
        );

        self.waypoint_snapshots = waypoint_snapshots;
        self.edge_snapshots = edge_snapshots;
        Ok(self.replace_graph(graph))
    }

    /// Send the graph, then only the snapshots the robot reports missing
    pub async fn upload(&self, robot: &dyn RobotClient) -> Result<UploadResult> {
        let graph = self.graph.as_ref().ok_or(NavError::NoGraph)?;

        // Without anchors the robot has to compute a seed frame itself
        let generate_new_anchoring = !graph.has_anchors();
        info!(
            "[GRAPH] Uploading graph (generate_new_anchoring={})",
            generate_new_anchoring
        );
        let response = robot.upload_graph(graph, generate_new_anchoring).await?;

        for id in &response.unknown_waypoint_snapshot_ids {
            let snapshot = self
                .waypoint_snapshots
                .get(id)
                .ok_or_else(|| NavError::SnapshotNotLoaded(id.clone()))?;
            debug!("[GRAPH] Uploading waypoint snapshot {}", id);
            robot.upload_waypoint_snapshot(snapshot).await?;
        }

        for id in &response.unknown_edge_snapshot_ids {
            let snapshot = self
                .edge_snapshots
                .get(id)
                .ok_or_else(|| NavError::SnapshotNotLoaded(id.clone()))?;
            debug!("[GRAPH] Uploading edge snapshot {}", id);
            robot.upload_edge_snapshot(snapshot).await?;
        }

        let localized = robot
            .get_localization_state()
            .await?
            .waypoint_id()
            .is_some();
        if !localized {
            warn!("[GRAPH] Upload complete; robot is not localized to the graph yet");
        }

        Ok(UploadResult {
            waypoint_snapshots_sent: response.unknown_waypoint_snapshot_ids.len(),
            edge_snapshots_sent: response.unknown_edge_snapshot_ids.len(),
            localized,
        })
    }

    /// Replace the cached graph with the one currently on the robot
    ///
    /// Returns the number of waypoints downloaded; an empty robot clears the
    /// store.
    pub async fn refresh_from_robot(&mut self, robot: &dyn RobotClient) -> Result<usize> {
        let Some(graph) = robot.download_graph().await? else {
            warn!("[GRAPH] Robot holds no graph");
            self.clear();
            return Ok(0);
        };

        let localization = robot.get_localization_state().await?;
        let current = localization.waypoint_id().unwrap_or("");

        // Snapshots stay cached by id
        let count = graph.waypoints.len();
        self.replace_graph(graph);
        self.log_listing(current);
        Ok(count)
    }

    /// Drop the cached graph and its snapshots
    pub fn clear(&mut self) {
        self.graph = None;
        self.waypoint_snapshots.clear();
        self.edge_snapshots.clear();
        self.annotations.clear();
        self.adjacency.clear();
    }

    /// Map a user token to a waypoint id
    ///
    /// Tried in order: literal id, annotation name, two-character short code.
    pub fn resolve_waypoint(&self, token: &str) -> Result<String> {
        let graph = self.graph.as_ref().ok_or(NavError::NoGraph)?;

        if graph.waypoints.iter().any(|w| w.id == token) {
            return Ok(token.to_string());
        }

        let named: Vec<&Waypoint> = graph
            .waypoints
            .iter()
            .filter(|w| !token.is_empty() && w.name() == token)
            .collect();
        match named.as_slice() {
            [one] => return Ok(one.id.clone()),
            [] => {}
            many => {
                return Err(NavError::AmbiguousWaypoint {
                    token: token.to_string(),
                    candidates: many.iter().map(|w| w.id.clone()).collect(),
                })
            }
        }

        if token.chars().count() == 2 {
            let coded: Vec<&Waypoint> = graph
                .waypoints
                .iter()
                .filter(|w| short_code(&w.id).as_deref() == Some(token))
                .collect();
            match coded.as_slice() {
                [one] => return Ok(one.id.clone()),
                [] => {}
                many => {
                    return Err(NavError::AmbiguousWaypoint {
                        token: token.to_string(),
                        candidates: many.iter().map(|w| w.id.clone()).collect(),
                    })
                }
            }
        }

        Err(NavError::WaypointNotFound(token.to_string()))
    }

    /// Annotation index and destination-keyed edge adjacency
    pub fn listing(&self) -> (&BTreeMap<String, Option<String>>, &Adjacency) {
        (&self.annotations, &self.adjacency)
    }

    pub fn adjacency(&self) -> &Adjacency {
        &self.adjacency
    }

    fn replace_graph(&mut self, graph: Graph) -> &Graph {
        self.annotations.clear();
        self.adjacency.clear();

        for waypoint in &graph.waypoints {
            let name = waypoint.name();
            if name.is_empty() {
                continue;
            }
            self.annotations
                .entry(name.to_string())
                .and_modify(|id| *id = None)
                .or_insert_with(|| Some(waypoint.id.clone()));
        }

        for edge in &graph.edges {
            if let Some(id) = &edge.id {
                self.adjacency
                    .entry(id.to_waypoint.clone())
                    .or_default()
                    .push(id.from_waypoint.clone());
            }
        }

        self.graph.insert(graph)
    }

    fn log_listing(&self, current_waypoint: &str) {
        let Some(graph) = &self.graph else {
            return;
        };

        let mut waypoints: Vec<&Waypoint> = graph.waypoints.iter().collect();
        waypoints.sort_by(|a, b| a.name().cmp(b.name()).then_with(|| a.id.cmp(&b.id)));

        info!("[GRAPH] {} waypoints:", waypoints.len());
        for waypoint in waypoints {
            let marker = if waypoint.id == current_waypoint { "->" } else { "  " };
            info!(
                "[GRAPH] {} {:>2} {:<24} {}",
                marker,
                short_code(&waypoint.id).unwrap_or_default(),
                waypoint.name(),
                waypoint.id
            );
        }

        let edge_count: usize = self.adjacency.values().map(Vec::len).sum();
        info!("[GRAPH] {} edges:", edge_count);
        for (to, froms) in &self.adjacency {
            for from in froms {
                info!("[GRAPH]    {} -> {}", from, to);
            }
        }
    }
}

/// First letters of the first two dash-separated tokens of an id
///
/// Only ids with more than two tokens have a short code.
pub fn short_code(id: &str) -> Option<String> {
    let tokens: Vec<&str> = id.split('-').collect();
    if tokens.len() <= 2 {
        return None;
    }
    let first = tokens[0].chars().next()?;
    let second = tokens[1].chars().next()?;
    Some([first, second].iter().collect())
}

async fn read_file(path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(path).await.map_err(|source| NavError::Io {
        path: path.to_path_buf(),
        source,
    })
}

async fn decode_file<M: Message + Default>(path: &Path) -> Result<M> {
    let bytes = read_file(path).await?;
    M::decode(bytes.as_slice()).map_err(|source| NavError::Parse {
        path: PathBuf::from(path),
        source,
    })
}

/// Read a snapshot blob, checking its header parses
async fn read_snapshot(path: &Path, expected_id: &str) -> Result<Snapshot> {
    let data = read_file(path).await?;
    let header = SnapshotHeader::decode(data.as_slice()).map_err(|source| NavError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    if header.id != expected_id {
        warn!(
            "[GRAPH] Snapshot {} declares id {:?}",
            path.display(),
            header.id
        );
    }
    Ok(Snapshot {
        id: expected_id.to_string(),
        data,
    })
}
