use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use thiserror::Error;

/// Unique identifier for vertices in a graph
pub type VertexId = usize;

/// Identifier for edges, allocated by the owning graph
pub type EdgeId = usize;

/// Structural errors raised by graph mutations. A failed mutation leaves the graph untouched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("Duplicate vertex ID: {0}")]
    DuplicateVertex(VertexId),

    #[error("Vertex {0} does not exist")]
    MissingVertex(VertexId),

    #[error("Edge {0} does not exist")]
    MissingEdge(EdgeId),

    #[error("Self-loop on vertex {0} is not allowed")]
    SelfLoop(VertexId),
}

pub type GraphResult<T> = Result<T, GraphError>;

/// Edge payloads that can be traversed against their direction.
pub trait Revertible {
    /// Swap the payload into the opposite direction. Applying it twice is the identity.
    fn revert(&mut self);
}

/// A vertex record: id, incident edges and the user payload.
#[derive(Debug, Clone)]
pub struct Vertex<V> {
    id: VertexId,
    edges: BTreeSet<EdgeId>,
    /// Selection flag for partial output, ignored by the solvers
    pub mark: bool,
    pub data: V,
}

impl<V> Vertex<V> {
    pub fn id(&self) -> VertexId {
        self.id
    }

    pub fn edges(&self) -> &BTreeSet<EdgeId> {
        &self.edges
    }

    pub fn degree(&self) -> usize {
        self.edges.len()
    }
}

/// An edge record with ordered endpoints.
#[derive(Debug, Clone)]
pub struct Edge<E> {
    id: EdgeId,
    from: VertexId,
    to: VertexId,
    pub mark: bool,
    pub data: E,
}

impl<E> Edge<E> {
    pub fn id(&self) -> EdgeId {
        self.id
    }

    pub fn from(&self) -> VertexId {
        self.from
    }

    pub fn to(&self) -> VertexId {
        self.to
    }

    /// The endpoint opposite to `vertex`, if `vertex` is an endpoint.
    pub fn other(&self, vertex: VertexId) -> Option<VertexId> {
        if vertex == self.from {
            Some(self.to)
        } else if vertex == self.to {
            Some(self.from)
        } else {
            None
        }
    }

    /// True if the edge joins `a` and `b` in either direction.
    pub fn connects(&self, a: VertexId, b: VertexId) -> bool {
        (self.from == a && self.to == b) || (self.from == b && self.to == a)
    }
}

/// Generic vertex/edge container.
///
/// Vertices are indexed by id and iterate in ascending id order; edges iterate in
/// insertion order. Every edge's endpoints are present in the vertex map.
#[derive(Debug, Clone)]
pub struct Graph<V, E> {
    vertices: BTreeMap<VertexId, Vertex<V>>,
    edges: BTreeMap<EdgeId, Edge<E>>,
    next_edge_id: EdgeId,
}

impl<V, E> Default for Graph<V, E> {
    fn default() -> Self {
        Self {
            vertices: BTreeMap::new(),
            edges: BTreeMap::new(),
            next_edge_id: 0,
        }
    }
}

impl<V, E> Graph<V, E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a vertex. Fails if the id is taken.
    pub fn add_vertex(&mut self, id: VertexId, data: V) -> GraphResult<&mut Vertex<V>> {
        if self.vertices.contains_key(&id) {
            return Err(GraphError::DuplicateVertex(id));
        }
        Ok(self.vertices.entry(id).or_insert(Vertex {
            id,
            edges: BTreeSet::new(),
            mark: false,
            data,
        }))
    }

    /// Insert an edge between two existing, distinct vertices.
    pub fn add_edge(&mut self, from: VertexId, to: VertexId, data: E) -> GraphResult<EdgeId> {
        if from == to {
            return Err(GraphError::SelfLoop(from));
        }
        for id in [from, to] {
            if !self.vertices.contains_key(&id) {
                return Err(GraphError::MissingVertex(id));
            }
        }

        let id = self.next_edge_id;
        self.next_edge_id += 1;
        for v in [from, to] {
            if let Some(vertex) = self.vertices.get_mut(&v) {
                vertex.edges.insert(id);
            }
        }
        self.edges.insert(
            id,
            Edge {
                id,
                from,
                to,
                mark: false,
                data,
            },
        );
        Ok(id)
    }

    /// Detach and return an edge.
    pub fn remove_edge(&mut self, id: EdgeId) -> Option<Edge<E>> {
        let edge = self.edges.remove(&id)?;
        for v in [edge.from, edge.to] {
            if let Some(vertex) = self.vertices.get_mut(&v) {
                vertex.edges.remove(&id);
            }
        }
        Some(edge)
    }

    /// Remove a vertex after removing all of its incident edges.
    pub fn remove_vertex(&mut self, id: VertexId) -> Option<Vertex<V>> {
        let incident: Vec<EdgeId> = self.vertices.get(&id)?.edges.iter().copied().collect();
        for edge in incident {
            self.remove_edge(edge);
        }
        self.vertices.remove(&id)
    }

    pub fn clear(&mut self) {
        self.vertices.clear();
        self.edges.clear();
    }

    pub fn vertex(&self, id: VertexId) -> Option<&Vertex<V>> {
        self.vertices.get(&id)
    }

    pub fn vertex_mut(&mut self, id: VertexId) -> Option<&mut Vertex<V>> {
        self.vertices.get_mut(&id)
    }

    pub fn edge(&self, id: EdgeId) -> Option<&Edge<E>> {
        self.edges.get(&id)
    }

    pub fn edge_mut(&mut self, id: EdgeId) -> Option<&mut Edge<E>> {
        self.edges.get_mut(&id)
    }

    pub fn contains_vertex(&self, id: VertexId) -> bool {
        self.vertices.contains_key(&id)
    }

    pub fn vertices(&self) -> impl Iterator<Item = &Vertex<V>> {
        self.vertices.values()
    }

    pub fn vertices_mut(&mut self) -> impl Iterator<Item = &mut Vertex<V>> {
        self.vertices.values_mut()
    }

    pub fn edges(&self) -> impl Iterator<Item = &Edge<E>> {
        self.edges.values()
    }

    pub fn edges_mut(&mut self) -> impl Iterator<Item = &mut Edge<E>> {
        self.edges.values_mut()
    }

    pub fn vertex_ids(&self) -> impl Iterator<Item = VertexId> + '_ {
        self.vertices.keys().copied()
    }

    pub fn edge_ids(&self) -> impl Iterator<Item = EdgeId> + '_ {
        self.edges.keys().copied()
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    /// Edges running from `from` to `to` (directed).
    pub fn connecting_edges(&self, from: VertexId, to: VertexId) -> Vec<EdgeId> {
        let Some(vertex) = self.vertices.get(&from) else {
            return Vec::new();
        };
        vertex
            .edges
            .iter()
            .filter(|e| {
                self.edges
                    .get(e)
                    .is_some_and(|edge| edge.from == from && edge.to == to)
            })
            .copied()
            .collect()
    }

    /// Edges joining `a` and `b` in either direction.
    pub fn edges_between(&self, a: VertexId, b: VertexId) -> Vec<EdgeId> {
        let mut found = self.connecting_edges(a, b);
        found.extend(self.connecting_edges(b, a));
        found
    }

    pub fn neighbors(&self, id: VertexId) -> BTreeSet<VertexId> {
        let Some(vertex) = self.vertices.get(&id) else {
            return BTreeSet::new();
        };
        vertex
            .edges
            .iter()
            .filter_map(|e| self.edges.get(e).and_then(|edge| edge.other(id)))
            .collect()
    }
}

impl<V, E: Revertible> Graph<V, E> {
    /// Flip an edge's direction together with its payload.
    pub fn revert_edge(&mut self, id: EdgeId) -> GraphResult<()> {
        let edge = self.edges.get_mut(&id).ok_or(GraphError::MissingEdge(id))?;
        std::mem::swap(&mut edge.from, &mut edge.to);
        edge.data.revert();
        Ok(())
    }
}

impl<V, E> fmt::Display for Graph<V, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Graph [ vertices: {}, edges: {} ]",
            self.vertices.len(),
            self.edges.len()
        )
    }
}
