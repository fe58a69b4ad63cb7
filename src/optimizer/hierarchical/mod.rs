//! Hierarchical pose-graph optimizer.
//!
//! The bottom level holds the user's graph. Every upper level is a coarse graph whose
//! vertices stand for clusters of the level below: a cluster is an island of vertices
//! within a bounded hop distance of its seed, and the upper vertex shares the seed's id.
//! Coarse edges connect neighbouring clusters and are annotated with the relative pose
//! and covariance obtained by solving the union of both clusters.
//!
//! - [`structure`]: taints, cleanup and re-clustering of the levels
//! - [`batch`]: V-cycles (annotate bottom-up, relax top-down)
//! - [`incremental`]: bounded updates after new vertices arrive

use crate::core::graph::{EdgeId, GraphError, VertexId};
use crate::core::pose_graph::{PoseGraph, PoseVertex};
use crate::manifold::PoseManifold;
use crate::optimizer::chol::{CholConfig, CholOptimizer};
use crate::optimizer::{
    GraphOptimizer, OptimizationStatus, OptimizationSummary, OptimizerError, OptimizerResult,
};
use nalgebra::DMatrix;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;
use tracing::{debug, info};

pub mod batch;
pub mod incremental;
pub mod structure;

/// Configuration of [`HierarchicalOptimizer`].
#[derive(Debug, Clone)]
pub struct HierarchicalConfig {
    /// Total number of levels, bottom included. One level means plain Cholesky.
    pub levels: usize,
    /// Clustering hop distance used by every upper level
    pub max_distance: f64,
    /// Per-level override of `max_distance`, indexed from the first upper level
    pub level_max_distances: Vec<f64>,
    pub translational_threshold: f64,
    pub rotational_threshold: f64,
    pub global_incremental_iterations: usize,
    pub down_incremental_iterations: usize,
    pub edge_annotation_iterations: usize,
    /// Relax every moved cluster after an incremental top-level solve
    pub propagate_down: bool,
    /// Top-level chi2 change that triggers an incremental global solve
    pub chi2_drift_threshold: f64,
    pub chol: CholConfig,
}

impl Default for HierarchicalConfig {
    fn default() -> Self {
        Self {
            levels: 3,
            max_distance: 3.0,
            level_max_distances: Vec::new(),
            translational_threshold: 0.1,
            rotational_threshold: 0.05,
            global_incremental_iterations: 3,
            down_incremental_iterations: 3,
            edge_annotation_iterations: 5,
            propagate_down: false,
            chi2_drift_threshold: 0.0,
            chol: CholConfig::default(),
        }
    }
}

impl HierarchicalConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_levels(mut self, levels: usize) -> Self {
        self.levels = levels;
        self
    }

    pub fn with_max_distance(mut self, distance: f64) -> Self {
        self.max_distance = distance;
        self
    }

    pub fn with_level_max_distances(mut self, distances: Vec<f64>) -> Self {
        self.level_max_distances = distances;
        self
    }

    pub fn with_thresholds(mut self, translational: f64, rotational: f64) -> Self {
        self.translational_threshold = translational;
        self.rotational_threshold = rotational;
        self
    }

    pub fn with_incremental_iterations(mut self, global: usize, down: usize) -> Self {
        self.global_incremental_iterations = global;
        self.down_incremental_iterations = down;
        self
    }

    pub fn with_edge_annotation_iterations(mut self, iterations: usize) -> Self {
        self.edge_annotation_iterations = iterations;
        self
    }

    pub fn with_propagate_down(mut self, propagate: bool) -> Self {
        self.propagate_down = propagate;
        self
    }

    pub fn with_chi2_drift_threshold(mut self, threshold: f64) -> Self {
        self.chi2_drift_threshold = threshold;
        self
    }

    pub fn with_chol(mut self, chol: CholConfig) -> Self {
        self.chol = chol;
        self
    }

    /// Clustering distance of upper level `level` (1-based).
    pub fn max_distance_for(&self, level: usize) -> f64 {
        level
            .checked_sub(1)
            .and_then(|k| self.level_max_distances.get(k).copied())
            .unwrap_or(self.max_distance)
    }
}

/// Links of one vertex to the levels above and below.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClusterLinks {
    /// Seed of the island this vertex belongs to (same level)
    pub root: Option<VertexId>,
    /// Vertex on the level above that represents the island
    pub parent: Option<VertexId>,
    /// Members of this vertex's island on the level below
    pub children: BTreeSet<VertexId>,
    /// Seed of that island on the level below
    pub lower_root: Option<VertexId>,
    pub distance_to_root: f64,
    pub edge_to_root: Option<EdgeId>,
    /// Marked for removal by the next structure update
    pub tainted: bool,
}

/// One level of the hierarchy.
#[derive(Debug)]
pub struct Level<M: PoseManifold> {
    optimizer: CholOptimizer<M>,
    links: BTreeMap<VertexId, ClusterLinks>,
    previous_roots: BTreeSet<VertexId>,
    cached_chi2: f64,
    last_optimized_chi2: f64,
    max_distance: f64,
}

impl<M: PoseManifold> Level<M> {
    fn new(config: CholConfig, max_distance: f64, initial_chi2: f64) -> Self {
        Self {
            optimizer: CholOptimizer::new(config),
            links: BTreeMap::new(),
            previous_roots: BTreeSet::new(),
            cached_chi2: initial_chi2,
            last_optimized_chi2: initial_chi2,
            max_distance,
        }
    }

    pub fn graph(&self) -> &PoseGraph<M> {
        self.optimizer.graph()
    }

    pub fn optimizer(&self) -> &CholOptimizer<M> {
        &self.optimizer
    }

    pub fn links(&self, id: VertexId) -> Option<&ClusterLinks> {
        self.links.get(&id)
    }

    pub fn all_links(&self) -> &BTreeMap<VertexId, ClusterLinks> {
        &self.links
    }

    /// Ids of former island seeds that lost their cluster.
    pub fn previous_roots(&self) -> &BTreeSet<VertexId> {
        &self.previous_roots
    }

    /// Running chi2 of the level, maintained by every mutation.
    pub fn cached_chi2(&self) -> f64 {
        self.cached_chi2
    }

    pub fn last_optimized_chi2(&self) -> f64 {
        self.last_optimized_chi2
    }

    pub fn max_distance(&self) -> f64 {
        self.max_distance
    }

    fn children(&self, id: VertexId) -> BTreeSet<VertexId> {
        self.links
            .get(&id)
            .map(|links| links.children.clone())
            .unwrap_or_default()
    }

    fn lower_root(&self, id: VertexId) -> Option<VertexId> {
        self.links.get(&id).and_then(|links| links.lower_root)
    }

    fn clear(&mut self) {
        self.optimizer.clear();
        self.links.clear();
        self.previous_roots.clear();
        self.cached_chi2 = 0.0;
        self.last_optimized_chi2 = 0.0;
    }
}

/// Multi-level optimizer over a bottom pose graph.
#[derive(Debug)]
pub struct HierarchicalOptimizer<M: PoseManifold> {
    levels: Vec<Level<M>>,
    config: HierarchicalConfig,
}

impl<M: PoseManifold> Default for HierarchicalOptimizer<M> {
    fn default() -> Self {
        Self::new(HierarchicalConfig::default())
    }
}

impl<M: PoseManifold> HierarchicalOptimizer<M> {
    pub fn new(config: HierarchicalConfig) -> Self {
        let count = config.levels.max(1);
        let mut levels = Vec::with_capacity(count);
        levels.push(Level::new(config.chol.clone(), 0.0, 0.0));
        for level in 1..count {
            let chol = config.chol.clone().with_guess_on_edges(false);
            levels.push(Level::new(chol, config.max_distance_for(level), 1.0));
        }
        Self { levels, config }
    }

    /// Wrap an existing bottom graph. Poses are kept as they are.
    pub fn with_graph(graph: PoseGraph<M>, config: HierarchicalConfig) -> Self {
        let mut optimizer = Self::new(config);
        let bottom = &mut optimizer.levels[0];
        bottom.links = graph
            .vertex_ids()
            .map(|id| (id, ClusterLinks::default()))
            .collect();
        bottom.cached_chi2 = graph.total_chi2();
        bottom.last_optimized_chi2 = bottom.cached_chi2;
        bottom.optimizer = CholOptimizer::with_graph(graph, optimizer.config.chol.clone());
        optimizer
    }

    pub fn config(&self) -> &HierarchicalConfig {
        &self.config
    }

    pub fn levels(&self) -> &[Level<M>] {
        &self.levels
    }

    pub fn level(&self, level: usize) -> Option<&Level<M>> {
        self.levels.get(level)
    }

    pub fn level_count(&self) -> usize {
        self.levels.len()
    }

    pub fn set_guess_on_edges(&mut self, guess: bool) {
        self.levels[0].optimizer.set_guess_on_edges(guess);
    }

    /// True if the children of level `level` partition the vertices of `level - 1` and
    /// every parent link points back at a cluster containing the vertex.
    pub fn is_partition(&self, level: usize) -> bool {
        if level == 0 || level >= self.levels.len() {
            return false;
        }
        let upper = &self.levels[level];
        let lower = &self.levels[level - 1];

        let mut covered = 0usize;
        for (id, links) in &upper.links {
            if !upper.graph().contains_vertex(*id) {
                return false;
            }
            if links.lower_root.is_none_or(|root| !links.children.contains(&root)) {
                return false;
            }
            covered += links.children.len();
        }
        if covered != lower.graph().vertex_count() {
            return false;
        }
        lower.graph().vertex_ids().all(|v| {
            lower
                .links
                .get(&v)
                .and_then(|links| links.parent)
                .and_then(|parent| upper.links.get(&parent))
                .is_some_and(|cluster| cluster.children.contains(&v))
        })
    }

    /// Insert a plain edge on an upper level.
    fn add_level_edge(
        &mut self,
        level: usize,
        from: VertexId,
        to: VertexId,
        mean: M,
        information: DMatrix<f64>,
    ) -> OptimizerResult<EdgeId> {
        let target = &mut self.levels[level];
        let id = target
            .optimizer
            .graph_mut()
            .add_pose_edge(from, to, mean, information)?;
        target.cached_chi2 += target.graph().edge_chi2(id).unwrap_or(0.0);
        Ok(id)
    }

    fn refine_level_edge(
        &mut self,
        level: usize,
        edge: EdgeId,
        mean: M,
        information: DMatrix<f64>,
    ) -> OptimizerResult<()> {
        let target = &mut self.levels[level];
        let before = target
            .graph()
            .edge_chi2(edge)
            .ok_or(GraphError::MissingEdge(edge))?;
        target.optimizer.refine_edge(edge, mean, information)?;
        let after = target.graph().edge_chi2(edge).unwrap_or(0.0);
        target.cached_chi2 += after - before;
        Ok(())
    }

    fn remove_level_edge(&mut self, level: usize, edge: EdgeId) -> OptimizerResult<()> {
        let target = &mut self.levels[level];
        let chi2 = target
            .graph()
            .edge_chi2(edge)
            .ok_or(GraphError::MissingEdge(edge))?;
        target.cached_chi2 -= chi2;
        target.last_optimized_chi2 -= chi2;
        target.optimizer.remove_edge(edge)
    }

    /// Seed a fresh bottom leaf from its only measurement.
    fn seed_leaf(&mut self, from: VertexId, to: VertexId, mean: &M) -> OptimizerResult<()> {
        let graph = self.levels[0].optimizer.graph_mut();
        let is_leaf = graph
            .vertex(to)
            .is_some_and(|v| v.degree() == 1 && !v.data.fixed);
        if !is_leaf {
            return Ok(());
        }
        if let Some(pose) = graph.pose(from).map(|p| p.compose(mean)) {
            graph.set_pose(to, pose)?;
        }
        Ok(())
    }
}

impl<M: PoseManifold> GraphOptimizer<M> for HierarchicalOptimizer<M> {
    fn graph(&self) -> &PoseGraph<M> {
        self.levels[0].graph()
    }

    fn vertex_mut(&mut self, id: VertexId) -> Option<&mut PoseVertex<M>> {
        self.levels[0].optimizer.vertex_mut(id)
    }

    fn initialize(&mut self, root: Option<VertexId>) -> bool {
        self.levels[0].optimizer.initialize(root)
    }

    fn optimize(&mut self, iterations: usize, online: bool) -> OptimizerResult<OptimizationSummary> {
        if self.levels.len() == 1 {
            return self.levels[0].optimizer.optimize(iterations, online);
        }
        let start = Instant::now();
        let initial_chi2 = self.chi2();
        if self.graph().vertex_count() < 2 {
            return Ok(OptimizationSummary::nothing_to_optimize(
                initial_chi2,
                self.graph().vertex_count(),
                self.graph().edge_count(),
            ));
        }

        let (status, performed) = if online {
            self.optimize_incremental()?;
            (OptimizationStatus::IncrementalUpdate, 1)
        } else {
            self.optimize_batch(iterations)?;
            (OptimizationStatus::Completed, iterations)
        };

        let summary = OptimizationSummary {
            status,
            initial_chi2,
            final_chi2: self.chi2(),
            iterations: performed,
            successful_steps: 0,
            unsuccessful_steps: 0,
            vertices: self.graph().vertex_count(),
            edges: self.graph().edge_count(),
            total_time: start.elapsed(),
        };
        let sizes: Vec<usize> = self.levels.iter().map(|l| l.graph().vertex_count()).collect();
        if online {
            debug!(?sizes, final_chi2 = summary.final_chi2, "incremental update finished");
        } else {
            info!(
                ?sizes,
                iterations,
                initial_chi2 = summary.initial_chi2,
                final_chi2 = summary.final_chi2,
                "hierarchical batch optimization finished"
            );
        }
        Ok(summary)
    }

    fn add_vertex(
        &mut self,
        id: VertexId,
        pose: M,
        information: &DMatrix<f64>,
    ) -> OptimizerResult<()> {
        let bottom = &mut self.levels[0];
        bottom.optimizer.add_vertex(id, pose, information)?;
        bottom.links.insert(id, ClusterLinks::default());
        Ok(())
    }

    fn add_edge(
        &mut self,
        from: VertexId,
        to: VertexId,
        mean: M,
        information: DMatrix<f64>,
    ) -> OptimizerResult<EdgeId> {
        let bottom = &mut self.levels[0];
        let replaced: f64 = bottom
            .graph()
            .edges_between(from, to)
            .iter()
            .filter_map(|&e| bottom.graph().edge_chi2(e))
            .sum();
        let id = bottom.optimizer.add_edge(from, to, mean.clone(), information)?;
        self.seed_leaf(from, to, &mean)?;
        self.taint(0, from);
        self.taint(0, to);
        let bottom = &mut self.levels[0];
        bottom.cached_chi2 += bottom.graph().edge_chi2(id).unwrap_or(0.0) - replaced;
        Ok(id)
    }

    fn refine_edge(
        &mut self,
        edge: EdgeId,
        mean: M,
        information: DMatrix<f64>,
    ) -> OptimizerResult<()> {
        self.refine_level_edge(0, edge, mean, information)
    }

    fn remove_edge(&mut self, edge: EdgeId) -> OptimizerResult<()> {
        let (from, to) = {
            let e = self.graph().edge(edge).ok_or(GraphError::MissingEdge(edge))?;
            (e.from(), e.to())
        };
        self.taint(0, from);
        self.taint(0, to);
        self.remove_level_edge(0, edge)
    }

    fn remove_vertex(&mut self, id: VertexId) -> OptimizerResult<()> {
        let incident: Vec<EdgeId> = self
            .graph()
            .vertex(id)
            .ok_or(GraphError::MissingVertex(id))?
            .edges()
            .iter()
            .copied()
            .collect();
        self.taint(0, id);
        for edge in incident {
            self.remove_edge(edge)?;
        }

        let parent = self.levels[0].links.remove(&id).and_then(|links| links.parent);
        if let (Some(parent), Some(upper)) = (parent, self.levels.get_mut(1)) {
            if let Some(cluster) = upper.links.get_mut(&parent) {
                cluster.children.remove(&id);
                if cluster.lower_root == Some(id) {
                    cluster.lower_root = None;
                }
            }
        }
        self.levels[0].previous_roots.remove(&id);
        self.levels[0].optimizer.remove_vertex(id)
    }

    fn marginal_covariance(
        &mut self,
        root: VertexId,
        other: VertexId,
    ) -> OptimizerResult<DMatrix<f64>> {
        self.levels[0].optimizer.marginal_covariance(root, other)
    }
}
