//! Graph building blocks shared by every optimizer
//!
//! - [`graph`]: generic vertex/edge container with integer ids
//! - [`dijkstra`]: shortest paths, spanning trees and tree visitors
//! - [`pose_graph`]: pose payloads, edge measurements and propagation along trees

pub mod dijkstra;
pub mod graph;
pub mod pose_graph;
