//! Recorded map: storage, waypoint resolution and route matching

pub mod route;
pub mod store;

pub use route::{build_route, find_edge, Adjacency};
pub use store::{short_code, GraphStore, UploadResult};
