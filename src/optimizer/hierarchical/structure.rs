//! Structure maintenance: taint propagation, removal of stale clusters, re-clustering of
//! the open vertices and annotation of the coarse edges.

use super::{ClusterLinks, HierarchicalOptimizer, Level};
use crate::core::dijkstra::{DEFAULT_CONDITIONER, Dijkstra, UniformCost};
use crate::core::graph::{EdgeId, GraphError, VertexId};
use crate::manifold::PoseManifold;
use crate::optimizer::{GraphOptimizer, OptimizerError, OptimizerResult};
use nalgebra::DMatrix;
use std::collections::BTreeSet;
use tracing::{trace, warn};

/// Information assigned to a coarse edge whose covariance is not positive definite.
const PLACEHOLDER_INFORMATION: f64 = 1e-9;

/// Rotational diagonal of a freshly created coarse edge, before annotation.
const INITIAL_ROTATIONAL_INFORMATION: f64 = 5.0;

impl<M: PoseManifold> HierarchicalOptimizer<M> {
    /// Mark the ancestors of `id` on `level` for rebuilding. Bottom vertices are never
    /// flagged themselves.
    pub(super) fn taint(&mut self, level: usize, id: VertexId) {
        let mut current = Some((level, id));
        while let Some((l, v)) = current {
            let Some(links) = self.levels.get_mut(l).and_then(|lvl| lvl.links.get_mut(&v)) else {
                break;
            };
            if l > 0 {
                links.tainted = true;
            }
            current = links.parent.map(|parent| (l + 1, parent));
        }
    }

    /// Release the whole subtree below `id`. Former island seeds are remembered so the
    /// next clustering prefers them.
    fn detach_children(&mut self, level: usize, id: VertexId) {
        let mut stack = vec![(level, id)];
        while let Some((l, v)) = stack.pop() {
            let children = match self.levels[l].links.get_mut(&v) {
                Some(links) => {
                    links.lower_root = None;
                    std::mem::take(&mut links.children)
                }
                None => continue,
            };
            if l == 0 {
                continue;
            }
            let lower = &mut self.levels[l - 1];
            for child in children {
                let Some(links) = lower.links.get_mut(&child) else {
                    continue;
                };
                if links.root == Some(child) {
                    lower.previous_roots.insert(child);
                }
                links.root = None;
                links.parent = None;
                links.edge_to_root = None;
                links.distance_to_root = 0.0;
                stack.push((l - 1, child));
            }
        }
    }

    /// Remove a vertex of an upper level together with its edges and links.
    fn remove_cluster(&mut self, level: usize, id: VertexId) -> OptimizerResult<()> {
        let incident: Vec<EdgeId> = self.levels[level]
            .graph()
            .vertex(id)
            .map(|v| v.edges().iter().copied().collect())
            .unwrap_or_default();
        for edge in incident {
            self.remove_level_edge(level, edge)?;
        }

        let parent = self.levels[level].links.get(&id).and_then(|links| links.parent);
        if let (Some(parent), Some(upper)) = (parent, self.levels.get_mut(level + 1)) {
            if let Some(cluster) = upper.links.get_mut(&parent) {
                cluster.children.remove(&id);
                if cluster.lower_root == Some(id) {
                    cluster.lower_root = None;
                }
            }
        }
        self.detach_children(level, id);

        let target = &mut self.levels[level];
        target.links.remove(&id);
        target.previous_roots.remove(&id);
        target.optimizer.remove_vertex(id)
    }

    /// Remove, top-down, every upper vertex that is tainted or lost its lower root.
    pub(super) fn cleanup_tainted(&mut self) -> OptimizerResult<()> {
        for level in (1..self.levels.len()).rev() {
            let stale: Vec<VertexId> = self.levels[level]
                .links
                .iter()
                .filter(|(_, links)| links.tainted || links.lower_root.is_none())
                .map(|(&id, _)| id)
                .collect();
            if !stale.is_empty() {
                trace!(level, count = stale.len(), "removing stale clusters");
            }
            for id in stale {
                self.remove_cluster(level, id)?;
            }
        }
        Ok(())
    }

    /// Rebuild the hierarchy above the bottom level.
    ///
    /// A non-incremental update drops every upper level first. An incremental update only
    /// replaces the clusters invalidated since the last call.
    pub fn update_structure(&mut self, incremental: bool) -> OptimizerResult<()> {
        if self.levels.len() < 2 {
            return Ok(());
        }
        if !incremental {
            for level in self.levels.iter_mut().skip(1) {
                level.clear();
            }
            let bottom = &mut self.levels[0];
            for links in bottom.links.values_mut() {
                *links = ClusterLinks::default();
            }
            bottom.previous_roots.clear();
        }
        self.cleanup_tainted()?;
        for level in 1..self.levels.len() {
            self.cluster_level(level)?;
        }
        Ok(())
    }

    fn cluster_level(&mut self, level: usize) -> OptimizerResult<()> {
        let created = {
            let (below, above) = self.levels.split_at_mut(level);
            partition_open_vertices(&mut below[level - 1], &mut above[0])?
        };
        self.connect_clusters(level, &created)
    }

    /// Add and annotate a coarse edge for every pair of neighbouring clusters touching the
    /// newly created ones.
    fn connect_clusters(&mut self, level: usize, created: &[VertexId]) -> OptimizerResult<()> {
        let mut candidates = Vec::new();
        {
            let upper = &self.levels[level];
            let lower = &self.levels[level - 1];
            for &cluster in created {
                for child in upper.children(cluster) {
                    let Some(vertex) = lower.graph().vertex(child) else {
                        continue;
                    };
                    for &edge_id in vertex.edges() {
                        let Some(edge) = lower.graph().edge(edge_id) else {
                            continue;
                        };
                        let parent_of = |v: VertexId| lower.links.get(&v).and_then(|l| l.parent);
                        if let (Some(p1), Some(p2)) = (parent_of(edge.from()), parent_of(edge.to())) {
                            if p1 != p2 {
                                candidates.push((p1, p2));
                            }
                        }
                    }
                }
            }
        }

        let mut information = DMatrix::identity(M::DOF, M::DOF);
        for k in M::DIM..M::DOF {
            information[(k, k)] = INITIAL_ROTATIONAL_INFORMATION;
        }
        let iterations = self.config.edge_annotation_iterations;
        for (p1, p2) in candidates {
            let graph = self.levels[level].graph();
            if !graph.edges_between(p1, p2).is_empty() {
                continue;
            }
            let (Some(a), Some(b)) = (graph.pose(p1), graph.pose(p2)) else {
                continue;
            };
            let mean = a.between(b);
            let edge = self.add_level_edge(level, p1, p2, mean, information.clone())?;
            self.annotate_edge(level, edge, iterations, 0.0, false)?;
        }
        Ok(())
    }

    /// Re-estimate a coarse edge on `level` from the level below.
    ///
    /// The union of both clusters is solved with the `from` cluster's seed as the gauge;
    /// the resulting relative pose of the seeds becomes the mean and the inverse of the
    /// `to` seed's covariance the information. Lower poses are restored afterwards.
    pub fn annotate_edge(
        &mut self,
        level: usize,
        edge: EdgeId,
        iterations: usize,
        lambda: f64,
        init: bool,
    ) -> OptimizerResult<()> {
        if level == 0 || level >= self.levels.len() {
            return Err(OptimizerError::Hierarchy(format!(
                "cannot annotate an edge on level {level}"
            )));
        }
        let upper = &self.levels[level];
        let (from, to) = {
            let e = upper.graph().edge(edge).ok_or(GraphError::MissingEdge(edge))?;
            (e.from(), e.to())
        };
        let missing_root = |v: VertexId| {
            OptimizerError::Hierarchy(format!("vertex {v} on level {level} has no lower root"))
        };
        let lower_from = upper.lower_root(from).ok_or_else(|| missing_root(from))?;
        let lower_to = upper.lower_root(to).ok_or_else(|| missing_root(to))?;
        let mut region = upper.children(from);
        region.extend(upper.children(to));

        let lower = &mut self.levels[level - 1].optimizer;
        lower.backup_subset(&region)?;
        let solved = lower.optimize_subset(lower_from, &region, iterations, lambda, init, Some(lower_to));
        let mean = match (lower.pose(lower_from), lower.pose(lower_to)) {
            (Some(a), Some(b)) => Some(a.between(b)),
            _ => None,
        };
        lower.restore_subset(&region)?;
        let solved = solved?;
        let mean = mean.ok_or(OptimizerError::InvalidVertex(lower_to))?;

        let information = match solved.other_covariance {
            Some(covariance) => annotation_information::<M>(&covariance, level, edge),
            None => DMatrix::identity(M::DOF, M::DOF),
        };
        self.refine_level_edge(level, edge, mean, information)
    }
}

/// Information of an annotated edge, or the placeholder if the covariance is unusable.
fn annotation_information<M: PoseManifold>(
    covariance: &DMatrix<f64>,
    level: usize,
    edge: EdgeId,
) -> DMatrix<f64> {
    let placeholder = || DMatrix::identity(M::DOF, M::DOF) * PLACEHOLDER_INFORMATION;
    let det = covariance.determinant();
    if !(det.is_finite() && det > 0.0) {
        warn!(level, edge, det, "annotation covariance is not positive definite");
        return placeholder();
    }
    covariance.clone().try_inverse().unwrap_or_else(placeholder)
}

/// Partition the unclustered vertices of `lower` into islands and create one `upper`
/// vertex per island. Returns the ids of the created vertices.
fn partition_open_vertices<M: PoseManifold>(
    lower: &mut Level<M>,
    upper: &mut Level<M>,
) -> OptimizerResult<Vec<VertexId>> {
    let mut open: BTreeSet<VertexId> = lower
        .links
        .iter()
        .filter(|(_, links)| links.root.is_none())
        .map(|(&id, _)| id)
        .collect();
    let mut open_roots: BTreeSet<VertexId> =
        open.intersection(&lower.previous_roots).copied().collect();
    let mut created = Vec::new();
    let mut dijkstra = Dijkstra::new();

    while let Some(&first) = open.iter().next() {
        let seed = open_roots.iter().next().copied().unwrap_or(first);
        open.remove(&seed);
        open_roots.remove(&seed);
        lower.previous_roots.remove(&seed);

        let vertex = lower
            .graph()
            .vertex(seed)
            .ok_or(OptimizerError::InvalidVertex(seed))?;
        let (pose, covariance) = (vertex.data.pose.clone(), vertex.data.covariance.clone());
        upper.optimizer.add_vertex_with_covariance(seed, pose, covariance)?;
        upper.links.insert(
            seed,
            ClusterLinks {
                lower_root: Some(seed),
                children: BTreeSet::from([seed]),
                ..ClusterLinks::default()
            },
        );
        if let Some(links) = lower.links.get_mut(&seed) {
            links.root = Some(seed);
            links.parent = Some(seed);
            links.distance_to_root = 0.0;
            links.edge_to_root = None;
        }
        created.push(seed);

        dijkstra.shortest_paths(
            lower.graph(),
            seed,
            &UniformCost,
            upper.max_distance,
            DEFAULT_CONDITIONER,
            false,
        );
        let map = dijkstra.adjacency_map();
        let mut order: Vec<(f64, VertexId)> = dijkstra
            .visited()
            .iter()
            .filter_map(|v| map.get(v).map(|entry| (entry.distance(), *v)))
            .collect();
        order.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

        for (distance, v) in order {
            let Some(entry) = map.get(&v) else {
                continue;
            };
            let Some(previous) = entry.parent() else {
                continue;
            };
            let unclustered = lower.links.get(&v).is_some_and(|l| l.root.is_none());
            let joins_island = lower
                .links
                .get(&previous)
                .is_some_and(|l| l.root == Some(seed));
            if !(unclustered && joins_island) {
                continue;
            }
            if let Some(links) = lower.links.get_mut(&v) {
                links.root = Some(seed);
                links.parent = Some(seed);
                links.distance_to_root = distance;
                links.edge_to_root = entry.edge();
            }
            open.remove(&v);
            open_roots.remove(&v);
            lower.previous_roots.remove(&v);
            if let Some(cluster) = upper.links.get_mut(&seed) {
                cluster.children.insert(v);
            }
        }
    }
    Ok(created)
}
