//! Text graph files.
//!
//! Four record types are understood, one per line:
//!
//! ```text
//! VERTEX2 id x y θ
//! EDGE2   id1 id2 x y θ  i00 i01 i11 i22 i02 i12
//! VERTEX3 id x y z roll pitch yaw
//! EDGE3   id1 id2 x y z roll pitch yaw  <21 upper-triangular entries, row-major>
//! ```
//!
//! `VERTEX` and `EDGE` are accepted as aliases of the 2D tags. Lines starting with `#` are
//! comments and unknown tags are skipped.

use crate::core::graph::{GraphResult, VertexId};
use crate::core::pose_graph::PoseGraph;
use crate::manifold::{PoseManifold, SE2, SE3};
use nalgebra::DMatrix;
use std::collections::BTreeMap;
use thiserror::Error;

pub mod text;

pub use text::{TextGraphLoader, TextGraphWriter};

/// Errors that can occur while reading or writing graph files
#[derive(Error, Debug)]
pub enum IoError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error at line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("Invalid number format at line {line}: {value}")]
    InvalidNumber { line: usize, value: String },

    #[error("Missing required fields at line {line}")]
    MissingFields { line: usize },

    #[error("Unsupported file format: {0}")]
    UnsupportedFormat(String),
}

pub type IoResult<T> = Result<T, IoError>;

/// Text representation of a pose type.
pub trait TextPose: PoseManifold {
    /// Accepted vertex tags; the first one is written.
    const VERTEX_TAGS: &'static [&'static str];
    /// Accepted edge tags; the first one is written.
    const EDGE_TAGS: &'static [&'static str];
    /// Number of pose fields on a line.
    const POSE_FIELDS: usize;

    fn from_fields(fields: &[f64]) -> Self;

    fn to_fields(&self) -> Vec<f64>;

    fn information_from_fields(fields: &[f64]) -> DMatrix<f64>;

    fn information_to_fields(information: &DMatrix<f64>) -> Vec<f64>;

    /// Number of information fields on an edge line.
    fn information_fields() -> usize {
        Self::DOF * (Self::DOF + 1) / 2
    }
}

/// 2D information entries in file order.
const SE2_INFORMATION_ORDER: [(usize, usize); 6] = [(0, 0), (0, 1), (1, 1), (2, 2), (0, 2), (1, 2)];

impl TextPose for SE2 {
    const VERTEX_TAGS: &'static [&'static str] = &["VERTEX2", "VERTEX"];
    const EDGE_TAGS: &'static [&'static str] = &["EDGE2", "EDGE"];
    const POSE_FIELDS: usize = 3;

    fn from_fields(fields: &[f64]) -> Self {
        SE2::from_xy_angle(fields[0], fields[1], fields[2])
    }

    fn to_fields(&self) -> Vec<f64> {
        vec![self.x(), self.y(), self.angle()]
    }

    fn information_from_fields(fields: &[f64]) -> DMatrix<f64> {
        let mut information = DMatrix::zeros(3, 3);
        for (&(r, c), &value) in SE2_INFORMATION_ORDER.iter().zip(fields) {
            information[(r, c)] = value;
            information[(c, r)] = value;
        }
        information
    }

    fn information_to_fields(information: &DMatrix<f64>) -> Vec<f64> {
        SE2_INFORMATION_ORDER
            .iter()
            .map(|&(r, c)| information[(r, c)])
            .collect()
    }
}

impl TextPose for SE3 {
    const VERTEX_TAGS: &'static [&'static str] = &["VERTEX3"];
    const EDGE_TAGS: &'static [&'static str] = &["EDGE3"];
    const POSE_FIELDS: usize = 6;

    fn from_fields(fields: &[f64]) -> Self {
        SE3::from_translation_euler(fields[0], fields[1], fields[2], fields[3], fields[4], fields[5])
    }

    fn to_fields(&self) -> Vec<f64> {
        let t = self.translation();
        let (roll, pitch, yaw) = self.euler_angles();
        vec![t.x, t.y, t.z, roll, pitch, yaw]
    }

    fn information_from_fields(fields: &[f64]) -> DMatrix<f64> {
        let mut information = DMatrix::zeros(6, 6);
        let mut values = fields.iter();
        for r in 0..6 {
            for c in r..6 {
                let value = values.next().copied().unwrap_or_default();
                information[(r, c)] = value;
                information[(c, r)] = value;
            }
        }
        information
    }

    fn information_to_fields(information: &DMatrix<f64>) -> Vec<f64> {
        (0..6)
            .flat_map(|r| (r..6).map(move |c| (r, c)))
            .map(|(r, c)| information[(r, c)])
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VertexRecord<M: PoseManifold> {
    pub id: VertexId,
    pub pose: M,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EdgeRecord<M: PoseManifold> {
    pub from: VertexId,
    pub to: VertexId,
    pub mean: M,
    pub information: DMatrix<f64>,
}

impl<M: PoseManifold> EdgeRecord<M> {
    /// The same constraint stated from the lower id.
    pub fn normalized(self) -> Self {
        if self.from <= self.to {
            return self;
        }
        Self {
            from: self.to,
            to: self.from,
            mean: self.mean.inverse(),
            information: self.information,
        }
    }
}

/// Records of a graph file, in file order.
#[derive(Debug, Clone)]
pub struct GraphFile<M: PoseManifold> {
    pub vertices: Vec<VertexRecord<M>>,
    pub edges: Vec<EdgeRecord<M>>,
    index: BTreeMap<VertexId, usize>,
}

impl<M: PoseManifold> Default for GraphFile<M> {
    fn default() -> Self {
        Self {
            vertices: Vec::new(),
            edges: Vec::new(),
            index: BTreeMap::new(),
        }
    }
}

impl<M: PoseManifold> GraphFile<M> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains_vertex(&self, id: VertexId) -> bool {
        self.index.contains_key(&id)
    }

    /// Append a vertex. A repeated id overwrites the earlier pose and returns `false`.
    pub fn push_vertex(&mut self, record: VertexRecord<M>) -> bool {
        match self.index.get(&record.id) {
            Some(&slot) => {
                self.vertices[slot].pose = record.pose;
                false
            }
            None => {
                self.index.insert(record.id, self.vertices.len());
                self.vertices.push(record);
                true
            }
        }
    }

    pub fn push_edge(&mut self, record: EdgeRecord<M>) {
        self.edges.push(record);
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Edges stated from the lower id, ordered by `(higher id, lower id)`. This is the
    /// order in which an online run discovers them.
    pub fn sorted_edges(&self) -> Vec<EdgeRecord<M>> {
        let mut edges: Vec<_> = self.edges.iter().cloned().map(EdgeRecord::normalized).collect();
        edges.sort_by_key(|e| (e.to, e.from));
        edges
    }

    /// Build a pose graph with unit vertex information.
    pub fn into_graph(self) -> GraphResult<PoseGraph<M>> {
        let mut graph = PoseGraph::new();
        let unit = DMatrix::identity(M::DOF, M::DOF);
        for vertex in self.vertices {
            graph.add_pose_vertex(vertex.id, vertex.pose, &unit)?;
        }
        for edge in self.edges {
            graph.add_pose_edge(edge.from, edge.to, edge.mean, edge.information)?;
        }
        Ok(graph)
    }
}
