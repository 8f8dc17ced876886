//! Route matching over the recorded edge adjacency

use crate::error::{NavError, Result};
use graphnav_shared::{EdgeId, Route};
use std::collections::BTreeMap;

/// Recorded edges keyed by destination: `to_waypoint -> [from_waypoint]`
pub type Adjacency = BTreeMap<String, Vec<String>>;

/// Find an edge connecting `a` and `b` in either direction
///
/// Returns the edge in its recorded orientation. When a graph carries more
/// than one edge for the pair, the first one found wins.
pub fn find_edge(adjacency: &Adjacency, a: &str, b: &str) -> Option<EdgeId> {
    for (to, froms) in adjacency {
        for from in froms {
            if (to == a && from == b) || (to == b && from == a) {
                return Some(EdgeId::new(from.as_str(), to.as_str()));
            }
        }
    }
    None
}

/// Build a route through `waypoint_ids` in order
///
/// Fails on the first consecutive pair with no edge; nothing partial is
/// returned.
pub fn build_route(adjacency: &Adjacency, waypoint_ids: &[String]) -> Result<Route> {
    if waypoint_ids.is_empty() {
        return Err(NavError::EmptyRoute);
    }

    let mut edge_ids = Vec::with_capacity(waypoint_ids.len() - 1);
    for pair in waypoint_ids.windows(2) {
        let edge = find_edge(adjacency, &pair[0], &pair[1]).ok_or_else(|| NavError::NoEdge {
            from: pair[0].clone(),
            to: pair[1].clone(),
        })?;
        edge_ids.push(edge);
    }

    Ok(Route {
        waypoint_ids: waypoint_ids.to_vec(),
        edge_ids,
    })
}
