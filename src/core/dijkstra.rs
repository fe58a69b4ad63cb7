//! Dijkstra shortest paths over a [`Graph`] with pluggable edge costs.
//!
//! The search result is an adjacency map holding, for every reached vertex, its parent,
//! the edge to the parent and the distance from the source. [`Dijkstra::compute_tree`]
//! turns the parent links into children sets, after which
//! [`Dijkstra::visit_adjacency_map`] walks the tree breadth first. The walk is how poses
//! and covariances are propagated along the tree.

use crate::core::graph::{Edge, EdgeId, Graph, Vertex, VertexId};
use std::cmp::Ordering;
use std::collections::{BTreeSet, BinaryHeap, HashMap, VecDeque};

/// Relaxations that improve a distance by less than this are ignored.
pub const DEFAULT_CONDITIONER: f64 = 1e-3;

/// Cost of traversing an edge. Infinite costs make an edge impassable.
pub trait CostFunction<V, E> {
    fn cost(&self, edge: &Edge<E>, from: &Vertex<V>, to: &Vertex<V>) -> f64;
}

impl<V, E, F> CostFunction<V, E> for F
where
    F: Fn(&Edge<E>, &Vertex<V>, &Vertex<V>) -> f64,
{
    fn cost(&self, edge: &Edge<E>, from: &Vertex<V>, to: &Vertex<V>) -> f64 {
        self(edge, from, to)
    }
}

/// Every edge costs 1, so distances count hops.
#[derive(Debug, Clone, Copy, Default)]
pub struct UniformCost;

impl<V, E> CostFunction<V, E> for UniformCost {
    fn cost(&self, _edge: &Edge<E>, _from: &Vertex<V>, _to: &Vertex<V>) -> f64 {
        1.0
    }
}

/// Uniform cost restricted to a set of edges; everything else is impassable.
#[derive(Debug, Clone, Copy)]
pub struct ActiveSubsetCost<'a> {
    active: &'a BTreeSet<EdgeId>,
}

impl<'a> ActiveSubsetCost<'a> {
    pub fn new(active: &'a BTreeSet<EdgeId>) -> Self {
        Self { active }
    }
}

impl<V, E> CostFunction<V, E> for ActiveSubsetCost<'_> {
    fn cost(&self, edge: &Edge<E>, _from: &Vertex<V>, _to: &Vertex<V>) -> f64 {
        if self.active.contains(&edge.id()) {
            1.0
        } else {
            f64::INFINITY
        }
    }
}

/// Per-vertex search state.
#[derive(Debug, Clone, PartialEq)]
pub struct AdjacencyMapEntry {
    vertex: VertexId,
    parent: Option<VertexId>,
    edge: Option<EdgeId>,
    distance: f64,
    children: BTreeSet<VertexId>,
}

impl AdjacencyMapEntry {
    fn new(vertex: VertexId, parent: Option<VertexId>, edge: Option<EdgeId>, distance: f64) -> Self {
        Self {
            vertex,
            parent,
            edge,
            distance,
            children: BTreeSet::new(),
        }
    }

    pub fn vertex(&self) -> VertexId {
        self.vertex
    }

    pub fn parent(&self) -> Option<VertexId> {
        self.parent
    }

    pub fn edge(&self) -> Option<EdgeId> {
        self.edge
    }

    pub fn distance(&self) -> f64 {
        self.distance
    }

    pub fn children(&self) -> &BTreeSet<VertexId> {
        &self.children
    }
}

pub type AdjacencyMap = HashMap<VertexId, AdjacencyMapEntry>;

#[derive(Clone, Copy, Debug)]
struct QueueEntry {
    distance: f64,
    vertex: VertexId,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueueEntry {}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed for a min-heap; ties broken by id for a deterministic order
        other
            .distance
            .total_cmp(&self.distance)
            .then_with(|| other.vertex.cmp(&self.vertex))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Reusable Dijkstra search state.
#[derive(Debug, Default)]
pub struct Dijkstra {
    adjacency_map: AdjacencyMap,
    visited: Vec<VertexId>,
    queue: BinaryHeap<QueueEntry>,
}

impl Dijkstra {
    pub fn new() -> Self {
        Self::default()
    }

    /// Single-source search. Returns the number of reached vertices.
    ///
    /// A relaxation is accepted only if `candidate + conditioner < current` and
    /// `candidate < max_distance`. With `directed`, edges are only followed from their
    /// `from` endpoint.
    pub fn shortest_paths<V, E>(
        &mut self,
        graph: &Graph<V, E>,
        source: VertexId,
        cost: &impl CostFunction<V, E>,
        max_distance: f64,
        conditioner: f64,
        directed: bool,
    ) -> usize {
        self.shortest_paths_from(graph, &[source], cost, max_distance, conditioner, directed)
    }

    /// Multi-source search: every source starts at distance 0.
    pub fn shortest_paths_from<V, E>(
        &mut self,
        graph: &Graph<V, E>,
        sources: &[VertexId],
        cost: &impl CostFunction<V, E>,
        max_distance: f64,
        conditioner: f64,
        directed: bool,
    ) -> usize {
        self.adjacency_map.clear();
        self.visited.clear();
        self.queue.clear();

        for &source in sources {
            if graph.contains_vertex(source) {
                self.adjacency_map
                    .insert(source, AdjacencyMapEntry::new(source, None, None, 0.0));
                self.queue.push(QueueEntry {
                    distance: 0.0,
                    vertex: source,
                });
            }
        }

        let mut settled = BTreeSet::new();
        while let Some(QueueEntry { distance, vertex }) = self.queue.pop() {
            if !settled.insert(vertex) {
                continue;
            }
            self.visited.push(vertex);
            let Some(u) = graph.vertex(vertex) else {
                continue;
            };

            for &edge_id in u.edges() {
                let Some(edge) = graph.edge(edge_id) else {
                    continue;
                };
                if directed && edge.from() != vertex {
                    continue;
                }
                let Some(target) = edge.other(vertex) else {
                    continue;
                };
                let Some(z) = graph.vertex(target) else {
                    continue;
                };

                let edge_cost = cost.cost(edge, u, z);
                if !edge_cost.is_finite() {
                    continue;
                }
                let candidate = distance + edge_cost;
                let current = self
                    .adjacency_map
                    .get(&target)
                    .map_or(f64::INFINITY, |entry| entry.distance);

                if candidate + conditioner < current && candidate < max_distance {
                    self.adjacency_map.insert(
                        target,
                        AdjacencyMapEntry::new(target, Some(vertex), Some(edge_id), candidate),
                    );
                    self.queue.push(QueueEntry {
                        distance: candidate,
                        vertex: target,
                    });
                }
            }
        }
        self.visited.len()
    }

    pub fn adjacency_map(&self) -> &AdjacencyMap {
        &self.adjacency_map
    }

    pub fn adjacency_map_mut(&mut self) -> &mut AdjacencyMap {
        &mut self.adjacency_map
    }

    /// Vertices reached by the last search, in non-decreasing distance order.
    pub fn visited(&self) -> &[VertexId] {
        &self.visited
    }

    pub fn distance(&self, vertex: VertexId) -> Option<f64> {
        self.adjacency_map.get(&vertex).map(|e| e.distance)
    }

    /// Rebuild the children sets from the parent links.
    pub fn compute_tree(map: &mut AdjacencyMap) {
        for entry in map.values_mut() {
            entry.children.clear();
        }
        let links: Vec<(VertexId, VertexId)> = map
            .values()
            .filter_map(|entry| entry.parent.map(|p| (p, entry.vertex)))
            .collect();
        for (parent, child) in links {
            if let Some(entry) = map.get_mut(&parent) {
                entry.children.insert(child);
            }
        }
    }

    /// Breadth-first walk of the tree rooted at `root`.
    ///
    /// `action(vertex, parent, edge_to_parent)` is invoked once per node, root first
    /// (with no parent), in non-decreasing depth order.
    pub fn visit_adjacency_map(
        root: VertexId,
        map: &AdjacencyMap,
        mut action: impl FnMut(VertexId, Option<VertexId>, Option<EdgeId>),
    ) {
        let Some(root_entry) = map.get(&root) else {
            return;
        };
        action(root, None, None);

        let mut queue: VecDeque<&AdjacencyMapEntry> = VecDeque::from([root_entry]);
        while let Some(entry) = queue.pop_front() {
            for child in &entry.children {
                if let Some(child_entry) = map.get(child) {
                    action(*child, child_entry.parent, child_entry.edge);
                    queue.push_back(child_entry);
                }
            }
        }
    }

    /// Vertices reachable from any seed within `max_distance`.
    pub fn connected_subset<V, E>(
        &mut self,
        graph: &Graph<V, E>,
        seeds: &[VertexId],
        cost: &impl CostFunction<V, E>,
        max_distance: f64,
    ) -> BTreeSet<VertexId> {
        self.shortest_paths_from(graph, seeds, cost, max_distance, DEFAULT_CONDITIONER, false);
        self.visited.iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 4 vertices, 5 weighted edges.
    fn weighted_graph() -> Graph<(), f64> {
        let mut g = Graph::new();
        for id in 0..4 {
            g.add_vertex(id, ()).unwrap();
        }
        for (from, to, w) in [
            (0, 1, 1.0),
            (0, 2, 4.0),
            (1, 2, 2.0),
            (1, 3, 6.0),
            (2, 3, 3.0),
        ] {
            g.add_edge(from, to, w).unwrap();
        }
        g
    }

    fn weight(edge: &Edge<f64>, _: &Vertex<()>, _: &Vertex<()>) -> f64 {
        edge.data
    }

    #[test]
    fn test_shortest_paths_match_hand_computed_distances() {
        let g = weighted_graph();
        let mut dijkstra = Dijkstra::new();
        let reached =
            dijkstra.shortest_paths(&g, 0, &weight, f64::MAX, DEFAULT_CONDITIONER, false);
        assert_eq!(reached, 4);
        assert_eq!(dijkstra.distance(0), Some(0.0));
        assert!((dijkstra.distance(1).unwrap() - 1.0).abs() < 1e-12);
        assert!((dijkstra.distance(2).unwrap() - 3.0).abs() < 1e-12);
        assert!((dijkstra.distance(3).unwrap() - 6.0).abs() < 1e-12);
        assert_eq!(dijkstra.adjacency_map()[&3].parent(), Some(2));
        assert_eq!(dijkstra.adjacency_map()[&2].parent(), Some(1));
        assert_eq!(dijkstra.visited(), &[0, 1, 2, 3]);
    }

    #[test]
    fn test_shortest_paths_respects_max_distance() {
        let g = weighted_graph();
        let mut dijkstra = Dijkstra::new();
        dijkstra.shortest_paths(&g, 0, &weight, 5.0, DEFAULT_CONDITIONER, false);
        assert!(dijkstra.distance(3).is_none());
        assert_eq!(dijkstra.visited().len(), 3);
    }

    #[test]
    fn test_shortest_paths_directed() {
        let g = weighted_graph();
        let mut dijkstra = Dijkstra::new();
        let reached = dijkstra.shortest_paths(&g, 3, &weight, f64::MAX, DEFAULT_CONDITIONER, true);
        assert_eq!(reached, 1);
        let reached =
            dijkstra.shortest_paths(&g, 3, &weight, f64::MAX, DEFAULT_CONDITIONER, false);
        assert_eq!(reached, 4);
    }

    #[test]
    fn test_uniform_cost_counts_hops() {
        let g = weighted_graph();
        let mut dijkstra = Dijkstra::new();
        dijkstra.shortest_paths(&g, 0, &UniformCost, f64::MAX, DEFAULT_CONDITIONER, false);
        assert_eq!(dijkstra.distance(3), Some(2.0));
    }

    #[test]
    fn test_active_subset_cost_blocks_other_edges() {
        let g = weighted_graph();
        let active: BTreeSet<EdgeId> = g.connecting_edges(0, 1).into_iter().collect();
        let mut dijkstra = Dijkstra::new();
        let reached = dijkstra.shortest_paths(
            &g,
            0,
            &ActiveSubsetCost::new(&active),
            f64::MAX,
            DEFAULT_CONDITIONER,
            false,
        );
        assert_eq!(reached, 2);
    }

    #[test]
    fn test_visit_adjacency_map_is_breadth_first() {
        let g = weighted_graph();
        let mut dijkstra = Dijkstra::new();
        dijkstra.shortest_paths(&g, 0, &UniformCost, f64::MAX, DEFAULT_CONDITIONER, false);
        let map = dijkstra.adjacency_map_mut();
        Dijkstra::compute_tree(map);
        assert_eq!(map[&0].children(), &BTreeSet::from([1, 2]));

        let mut order = Vec::new();
        Dijkstra::visit_adjacency_map(0, dijkstra.adjacency_map(), |v, parent, edge| {
            order.push((v, parent, edge.is_some()));
        });
        assert_eq!(order[0], (0, None, false));
        assert_eq!(order.len(), 4);
        let depth: Vec<f64> = order
            .iter()
            .map(|(v, _, _)| dijkstra.distance(*v).unwrap())
            .collect();
        assert!(depth.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_connected_subset() {
        let mut g = weighted_graph();
        g.add_vertex(10, ()).unwrap();
        let mut dijkstra = Dijkstra::new();
        let subset = dijkstra.connected_subset(&g, &[0], &UniformCost, f64::MAX);
        assert_eq!(subset, BTreeSet::from([0, 1, 2, 3]));
        let subset = dijkstra.connected_subset(&g, &[10, 3], &UniformCost, 1.5);
        assert_eq!(subset, BTreeSet::from([1, 2, 3, 10]));
    }
}
