//! Single-level sparse Cholesky pose-graph optimizer.
//!
//! Each iteration linearizes the active edges, accumulates the normal equations per
//! vertex block, factorizes them with a cached symbolic analysis and retracts every
//! indexed vertex by its block of the solution.

use crate::core::dijkstra::{ActiveSubsetCost, DEFAULT_CONDITIONER, Dijkstra};
use crate::core::graph::{EdgeId, GraphError, VertexId};
use crate::core::pose_graph::{ErrorMode, PoseEdge, PoseGraph, PoseVertex, invert_or_pseudo};
use crate::linalg::{BlockSystem, SparseCholeskySolver, split_solution};
use crate::manifold::PoseManifold;
use crate::optimizer::{
    DampingMode, GraphOptimizer, OptimizationStatus, OptimizationSummary, OptimizerError,
    OptimizerResult,
};
use nalgebra::{DMatrix, DVector};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;
use tracing::{debug, error};

/// Configuration of [`CholOptimizer`].
#[derive(Debug, Clone)]
pub struct CholConfig {
    pub error_mode: ErrorMode,
    pub damping: DampingMode,
    /// Initial Levenberg-Marquardt damping
    pub initial_damping: f64,
    pub min_damping: f64,
    pub max_damping: f64,
    /// Damping multiplier after a rejected step
    pub damping_increase: f64,
    /// Damping multiplier after an accepted step
    pub damping_decrease: f64,
    /// Seed a new leaf vertex from its first measurement
    pub guess_on_edges: bool,
    /// Gauss-Newton iterations used to fuse parallel measurements
    pub fusion_iterations: usize,
    /// Dijkstra bound used when initializing a subset from observations
    pub init_max_distance: f64,
}

impl Default for CholConfig {
    fn default() -> Self {
        Self {
            error_mode: ErrorMode::Manifold,
            damping: DampingMode::GaussNewton,
            initial_damping: 1e-3,
            min_damping: 1e-12,
            max_damping: 1e12,
            damping_increase: 10.0,
            damping_decrease: 0.3,
            guess_on_edges: false,
            fusion_iterations: 3,
            init_max_distance: f64::MAX / 2.0,
        }
    }
}

impl CholConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_error_mode(mut self, mode: ErrorMode) -> Self {
        self.error_mode = mode;
        self
    }

    pub fn with_damping(mut self, damping: DampingMode) -> Self {
        self.damping = damping;
        self
    }

    pub fn with_initial_damping(mut self, damping: f64) -> Self {
        self.initial_damping = damping;
        self
    }

    pub fn with_damping_bounds(mut self, min: f64, max: f64) -> Self {
        self.min_damping = min;
        self.max_damping = max;
        self
    }

    pub fn with_damping_factors(mut self, increase: f64, decrease: f64) -> Self {
        self.damping_increase = increase;
        self.damping_decrease = decrease;
        self
    }

    pub fn with_guess_on_edges(mut self, guess: bool) -> Self {
        self.guess_on_edges = guess;
        self
    }

    pub fn with_fusion_iterations(mut self, iterations: usize) -> Self {
        self.fusion_iterations = iterations;
        self
    }

    pub fn with_init_max_distance(mut self, distance: f64) -> Self {
        self.init_max_distance = distance;
        self
    }
}

/// Outcome of [`CholOptimizer::optimize_subset`].
#[derive(Debug, Clone, Default)]
pub struct SubsetResult {
    pub iterations: usize,
    pub successful_steps: usize,
    pub unsuccessful_steps: usize,
    /// Covariance of the requested `other` vertex after the last iteration
    pub other_covariance: Option<DMatrix<f64>>,
}

/// Sparse Gauss-Newton / Levenberg-Marquardt optimizer over a single pose graph.
///
/// Parallel measurements between the same pair of vertices are fused into one edge on
/// insertion, so the graph never holds more than one edge per unordered pair.
#[derive(Debug)]
pub struct CholOptimizer<M: PoseManifold> {
    graph: PoseGraph<M>,
    config: CholConfig,
    root: Option<VertexId>,
    /// Dense index -> vertex id for the running solve
    index: Vec<VertexId>,
    active_edges: BTreeSet<EdgeId>,
    system: BlockSystem,
    solver: SparseCholeskySolver,
    damping: f64,
    stored_poses: Vec<M>,
}

impl<M: PoseManifold> Default for CholOptimizer<M> {
    fn default() -> Self {
        Self::new(CholConfig::default())
    }
}

impl<M: PoseManifold> CholOptimizer<M> {
    pub fn new(config: CholConfig) -> Self {
        let damping = config.initial_damping;
        Self {
            graph: PoseGraph::new(),
            config,
            root: None,
            index: Vec::new(),
            active_edges: BTreeSet::new(),
            system: BlockSystem::new(M::DOF, 0),
            solver: SparseCholeskySolver::new(),
            damping,
            stored_poses: Vec::new(),
        }
    }

    /// Wrap an existing graph.
    pub fn with_graph(graph: PoseGraph<M>, config: CholConfig) -> Self {
        let mut optimizer = Self::new(config);
        optimizer.graph = graph;
        optimizer
    }

    pub fn config(&self) -> &CholConfig {
        &self.config
    }

    pub fn set_guess_on_edges(&mut self, guess: bool) {
        self.config.guess_on_edges = guess;
    }

    pub fn root(&self) -> Option<VertexId> {
        self.root
    }

    pub fn into_graph(self) -> PoseGraph<M> {
        self.graph
    }

    /// Raw graph access for owners that keep their own bookkeeping.
    pub(crate) fn graph_mut(&mut self) -> &mut PoseGraph<M> {
        &mut self.graph
    }

    /// Drop every vertex and edge.
    pub fn clear(&mut self) {
        self.graph.clear();
        self.root = None;
        self.index.clear();
        self.active_edges.clear();
        self.solver.reset();
    }

    /// Add a vertex with an explicit covariance.
    pub fn add_vertex_with_covariance(
        &mut self,
        id: VertexId,
        pose: M,
        covariance: DMatrix<f64>,
    ) -> OptimizerResult<()> {
        self.graph.add_vertex(id, PoseVertex::new(pose, covariance))?;
        Ok(())
    }

    /// Rigidly move `vset` so that `root` lands on `new_root_pose`.
    pub fn transform_subset(&mut self, root: VertexId, vset: &BTreeSet<VertexId>, new_root_pose: &M) {
        let Some(root_pose) = self.graph.pose(root) else {
            return;
        };
        let transform = new_root_pose.compose(&root_pose.inverse());
        for &id in vset {
            if let Some(vertex) = self.graph.vertex_mut(id) {
                vertex.data.pose = transform.compose(&vertex.data.pose);
            }
        }
    }

    /// Initialize the free members of `vset` from the measurements, keeping every other
    /// pose as it is.
    pub fn initialize_with_observations(
        &mut self,
        root: VertexId,
        vset: &BTreeSet<VertexId>,
    ) -> OptimizerResult<()> {
        self.optimize_subset(root, vset, 0, 0.0, true, None)?;
        Ok(())
    }

    /// Optimize the vertices of `vset` with `root` held as the gauge.
    ///
    /// Edges leaving the set are kept with weight `lambda` and edges touching the root or
    /// a fixed vertex with full weight. When `other` is given and indexed, its covariance
    /// relative to `root` is returned from the last iteration.
    pub fn optimize_subset(
        &mut self,
        root: VertexId,
        vset: &BTreeSet<VertexId>,
        iterations: usize,
        lambda: f64,
        init: bool,
        other: Option<VertexId>,
    ) -> OptimizerResult<SubsetResult> {
        let mut result = SubsetResult::default();
        if vset.len() <= 1 {
            return Ok(result);
        }
        if !self.graph.contains_vertex(root) {
            return Err(OptimizerError::InvalidVertex(root));
        }

        self.build_index(root, vset);
        if self.index.is_empty() {
            self.clear_index();
            return Ok(result);
        }
        self.solver.reset();
        self.compute_active_edges(root);
        if init {
            self.initialize_active_subset(root);
        }

        let outcome = self.iterate(root, iterations, lambda, other, &mut result);
        self.clear_index();
        outcome.map(|_| result)
    }

    fn build_index(&mut self, root: VertexId, vset: &BTreeSet<VertexId>) {
        self.index.clear();
        for &id in vset {
            if id == root {
                continue;
            }
            let Some(vertex) = self.graph.vertex_mut(id) else {
                continue;
            };
            if vertex.data.fixed {
                continue;
            }
            vertex.data.temp_index = Some(self.index.len());
            self.index.push(id);
        }
    }

    fn clear_index(&mut self) {
        for &id in &self.index {
            if let Some(vertex) = self.graph.vertex_mut(id) {
                vertex.data.temp_index = None;
            }
        }
        self.index.clear();
        self.active_edges.clear();
    }

    fn compute_active_edges(&mut self, root: VertexId) {
        self.active_edges.clear();
        for id in self.index.iter().copied().chain(std::iter::once(root)) {
            if let Some(vertex) = self.graph.vertex(id) {
                self.active_edges.extend(vertex.edges().iter().copied());
            }
        }
    }

    /// Propagate poses along a spanning tree of the active edges, then restore every
    /// endpoint that is not being optimized.
    fn initialize_active_subset(&mut self, root: VertexId) {
        let mut saved: BTreeMap<VertexId, M> = BTreeMap::new();
        for &edge_id in &self.active_edges {
            let Some(edge) = self.graph.edge(edge_id) else {
                continue;
            };
            for id in [edge.from(), edge.to()] {
                if let Some(pose) = self.graph.pose(id) {
                    saved.entry(id).or_insert_with(|| pose.clone());
                }
            }
        }

        let cost = ActiveSubsetCost::new(&self.active_edges);
        let mut dijkstra = Dijkstra::new();
        dijkstra.shortest_paths(
            &self.graph,
            root,
            &cost,
            self.config.init_max_distance,
            DEFAULT_CONDITIONER,
            false,
        );
        Dijkstra::compute_tree(dijkstra.adjacency_map_mut());
        self.graph.propagate_poses(root, dijkstra.adjacency_map());

        for (id, pose) in saved {
            if let Some(vertex) = self.graph.vertex_mut(id) {
                if vertex.data.temp_index.is_none() {
                    vertex.data.pose = pose;
                }
            }
        }
    }

    fn iterate(
        &mut self,
        root: VertexId,
        iterations: usize,
        lambda: f64,
        other: Option<VertexId>,
        result: &mut SubsetResult,
    ) -> OptimizerResult<()> {
        for iteration in 0..iterations {
            self.build_linear_system(root, lambda);

            match self.config.damping {
                DampingMode::GaussNewton => {
                    self.solve_and_update(0.0)?;
                }
                DampingMode::LevenbergMarquardt => {
                    let before = self.graph.chi2_of(&self.active_edges);
                    self.store_poses();
                    self.solve_and_update(self.damping)?;
                    let after = self.graph.chi2_of(&self.active_edges);
                    if after > before {
                        self.restore_poses();
                        self.damping = (self.damping * self.config.damping_increase)
                            .min(self.config.max_damping);
                        result.unsuccessful_steps += 1;
                    } else {
                        self.damping = (self.damping * self.config.damping_decrease)
                            .max(self.config.min_damping);
                        result.successful_steps += 1;
                    }
                }
            }
            result.iterations += 1;

            if tracing::enabled!(tracing::Level::DEBUG) {
                debug!(
                    iteration,
                    chi2 = self.graph.chi2_of(&self.active_edges),
                    vertices = self.index.len(),
                    "subset iteration"
                );
            }

            if iteration + 1 == iterations {
                result.other_covariance = self.other_covariance(other)?;
            }
        }
        Ok(())
    }

    fn other_covariance(&self, other: Option<VertexId>) -> OptimizerResult<Option<DMatrix<f64>>> {
        let Some(other) = other else {
            return Ok(None);
        };
        let Some(vertex) = self.graph.vertex(other) else {
            return Err(OptimizerError::InvalidVertex(other));
        };
        let Some(index) = vertex.data.temp_index else {
            return Ok(None);
        };
        let block = self.solver.inverse_block(index, M::DOF)?;
        Ok(Some(M::transform_covariance(&block, &vertex.data.pose)))
    }

    fn build_linear_system(&mut self, root: VertexId, lambda: f64) {
        self.system.reset(self.index.len());
        for &edge_id in &self.active_edges {
            let Some(edge) = self.graph.edge(edge_id) else {
                continue;
            };
            let (Some(from), Some(to)) = (self.graph.vertex(edge.from()), self.graph.vertex(edge.to()))
            else {
                continue;
            };
            let i = from.data.temp_index;
            let j = to.data.temp_index;
            if i.is_none() && j.is_none() {
                continue;
            }

            let touches_gauge = edge.from() == root
                || edge.to() == root
                || from.data.fixed
                || to.data.fixed;
            let weight = if touches_gauge { 1.0 } else { lambda };

            let linearization = edge
                .data
                .linearize(&from.data.pose, &to.data.pose, self.config.error_mode);
            let mut omega = edge.data.information().clone();
            if i.is_none() || j.is_none() {
                omega *= weight;
            }
            let residual = -&linearization.error;
            let omega_r = &omega * &residual;

            let a_t = linearization.jacobian_from.transpose();
            let b_t = linearization.jacobian_to.transpose();
            if let Some(i) = i {
                self.system.add_rhs(i, &(&a_t * &omega_r));
                self.system
                    .add_diagonal(i, &(&a_t * &omega * &linearization.jacobian_from));
            }
            if let Some(j) = j {
                self.system.add_rhs(j, &(&b_t * &omega_r));
                self.system
                    .add_diagonal(j, &(&b_t * &omega * &linearization.jacobian_to));
            }
            if let (Some(i), Some(j)) = (i, j) {
                self.system
                    .add_off_diagonal(i, j, &(&a_t * &omega * &linearization.jacobian_to));
            }
        }
    }

    fn solve_and_update(&mut self, mu: f64) -> OptimizerResult<()> {
        if mu > 0.0 {
            self.system.add_to_diagonal(mu);
        }
        self.factorize_current()?;
        let solution = self.solver.solve(&self.system.rhs_matrix())?;
        for (k, step) in split_solution(&solution, M::DOF).into_iter().enumerate() {
            let id = self.index[k];
            if let Some(vertex) = self.graph.vertex_mut(id) {
                vertex.data.pose = vertex.data.pose.retract(&step);
            }
        }
        Ok(())
    }

    fn factorize_current(&mut self) -> OptimizerResult<()> {
        let matrix = self.system.to_sparse()?;
        if let Err(e) = self.solver.factorize(&matrix) {
            self.log_failure(&e.to_string());
            return Err(OptimizerError::Factorization(e.to_string()));
        }
        Ok(())
    }

    fn log_failure(&self, reason: &str) {
        error!(
            reason,
            dimension = self.system.dimension(),
            off_diagonal_blocks = self.system.off_diagonal_count(),
            active_edges = self.active_edges.len(),
            chi2 = self.graph.chi2_of(&self.active_edges),
            "Cholesky factorization of the normal equations failed"
        );
        if tracing::enabled!(tracing::Level::DEBUG) {
            for (k, id) in self.index.iter().enumerate() {
                debug!(
                    vertex = id,
                    diagonal = %self.system.diagonal_block(k),
                    rhs = %self.system.rhs_block(k),
                    "failing block"
                );
            }
        }
    }

    fn store_poses(&mut self) {
        self.stored_poses.clear();
        for &id in &self.index {
            if let Some(pose) = self.graph.pose(id) {
                self.stored_poses.push(pose.clone());
            }
        }
    }

    fn restore_poses(&mut self) {
        for (&id, pose) in self.index.iter().zip(self.stored_poses.drain(..)) {
            if let Some(vertex) = self.graph.vertex_mut(id) {
                vertex.data.pose = pose;
            }
        }
    }

    /// Fuse the measurement `from -> to` into the existing edge `existing`.
    fn fuse_edge(
        &mut self,
        existing: EdgeId,
        from: VertexId,
        to: VertexId,
        mean: M,
        information: DMatrix<f64>,
    ) -> OptimizerResult<()> {
        let edge = self
            .graph
            .edge(existing)
            .ok_or(GraphError::MissingEdge(existing))?;
        let (edge_from, edge_to) = (edge.from(), edge.to());
        let original = edge.data.clone();
        let same_direction = edge_to == to && edge_from == from;
        let incoming = PoseEdge::new(mean, information);

        let endpoints: BTreeSet<VertexId> = [edge_from, edge_to].into_iter().collect();
        self.backup_subset(&endpoints)?;
        self.graph.set_pose(edge_from, M::identity())?;
        self.graph.set_pose(edge_to, original.mean().clone())?;

        let fused = self.fusion_solve(edge_from, edge_to, &original, &incoming, same_direction);
        self.restore_subset(&endpoints)?;
        let (mean, information) = fused?;
        self.graph.refine_edge(existing, mean, information)?;
        Ok(())
    }

    fn fusion_solve(
        &mut self,
        edge_from: VertexId,
        edge_to: VertexId,
        original: &PoseEdge<M>,
        incoming: &PoseEdge<M>,
        same_direction: bool,
    ) -> OptimizerResult<(M, DMatrix<f64>)> {
        let mode = self.config.error_mode;
        let mut covariance = DMatrix::identity(M::DOF, M::DOF);
        for _ in 0..self.config.fusion_iterations.max(1) {
            let from_pose = self.graph.pose(edge_from).ok_or(GraphError::MissingVertex(edge_from))?;
            let to_pose = self.graph.pose(edge_to).ok_or(GraphError::MissingVertex(edge_to))?;

            let mut hessian = DMatrix::zeros(M::DOF, M::DOF);
            let mut rhs = DVector::zeros(M::DOF);

            let lin = original.linearize(from_pose, to_pose, mode);
            let b_t = lin.jacobian_to.transpose();
            rhs += &b_t * original.information() * (-&lin.error);
            hessian += &b_t * original.information() * &lin.jacobian_to;

            let (jacobian, error) = if same_direction {
                let lin = incoming.linearize(from_pose, to_pose, mode);
                (lin.jacobian_to, lin.error)
            } else {
                let lin = incoming.linearize(to_pose, from_pose, mode);
                (lin.jacobian_from, lin.error)
            };
            let j_t = jacobian.transpose();
            rhs += &j_t * incoming.information() * (-&error);
            hessian += &j_t * incoming.information() * &jacobian;

            covariance = hessian.try_inverse().ok_or_else(|| {
                OptimizerError::Factorization(format!(
                    "fusion system between {edge_from} and {edge_to} is singular"
                ))
            })?;
            let step = &covariance * rhs;
            let updated = to_pose.retract(&step);
            self.graph.set_pose(edge_to, updated)?;
        }

        let from_pose = self.graph.pose(edge_from).ok_or(GraphError::MissingVertex(edge_from))?;
        let to_pose = self.graph.pose(edge_to).ok_or(GraphError::MissingVertex(edge_to))?;
        let mean = from_pose.between(to_pose);
        let information = invert_or_pseudo(&M::transform_covariance(&covariance, to_pose));
        Ok((mean, information))
    }
}

impl<M: PoseManifold> GraphOptimizer<M> for CholOptimizer<M> {
    fn graph(&self) -> &PoseGraph<M> {
        &self.graph
    }

    fn vertex_mut(&mut self, id: VertexId) -> Option<&mut PoseVertex<M>> {
        self.graph.vertex_mut(id).map(|v| &mut v.data)
    }

    fn initialize(&mut self, root: Option<VertexId>) -> bool {
        match root {
            Some(id) if self.graph.contains_vertex(id) => {
                self.root = Some(id);
                true
            }
            _ => {
                self.root = None;
                false
            }
        }
    }

    fn optimize(&mut self, iterations: usize, _online: bool) -> OptimizerResult<OptimizationSummary> {
        let start = Instant::now();
        let initial_chi2 = self.graph.total_chi2();
        let vertices = self.graph.vertex_count();
        let edges = self.graph.edge_count();

        let root = self
            .root
            .filter(|r| self.graph.contains_vertex(*r))
            .or_else(|| self.graph.vertex_ids().next());
        let Some(root) = root else {
            return Ok(OptimizationSummary::nothing_to_optimize(initial_chi2, 0, 0));
        };
        let all: BTreeSet<VertexId> = self.graph.vertex_ids().collect();
        self.damping = self.config.initial_damping;
        let guess = self.config.guess_on_edges;
        let result = self.optimize_subset(root, &all, iterations, 0.0, guess, None)?;

        let summary = OptimizationSummary {
            status: if result.iterations == 0 && iterations > 0 {
                OptimizationStatus::NothingToOptimize
            } else {
                OptimizationStatus::Completed
            },
            initial_chi2,
            final_chi2: self.graph.total_chi2(),
            iterations: result.iterations,
            successful_steps: result.successful_steps,
            unsuccessful_steps: result.unsuccessful_steps,
            vertices,
            edges,
            total_time: start.elapsed(),
        };
        debug!(
            root,
            iterations = summary.iterations,
            initial_chi2 = summary.initial_chi2,
            final_chi2 = summary.final_chi2,
            "Cholesky optimization finished"
        );
        Ok(summary)
    }

    fn add_vertex(
        &mut self,
        id: VertexId,
        pose: M,
        information: &DMatrix<f64>,
    ) -> OptimizerResult<()> {
        self.graph.add_pose_vertex(id, pose, information)?;
        Ok(())
    }

    fn add_edge(
        &mut self,
        from: VertexId,
        to: VertexId,
        mean: M,
        information: DMatrix<f64>,
    ) -> OptimizerResult<EdgeId> {
        if let Some(&existing) = self.graph.edges_between(from, to).first() {
            self.fuse_edge(existing, from, to, mean, information)?;
            return Ok(existing);
        }

        let id = self.graph.add_pose_edge(from, to, mean.clone(), information)?;
        if self.config.guess_on_edges {
            let seeded = self
                .graph
                .vertex(to)
                .is_some_and(|v| v.degree() == 1 && !v.data.fixed);
            if seeded {
                if let Some(from_pose) = self.graph.pose(from) {
                    let pose = from_pose.compose(&mean);
                    self.graph.set_pose(to, pose)?;
                }
            }
        }
        Ok(id)
    }

    fn refine_edge(
        &mut self,
        edge: EdgeId,
        mean: M,
        information: DMatrix<f64>,
    ) -> OptimizerResult<()> {
        self.graph.refine_edge(edge, mean, information)?;
        Ok(())
    }

    fn remove_edge(&mut self, edge: EdgeId) -> OptimizerResult<()> {
        self.graph
            .remove_edge(edge)
            .map(|_| ())
            .ok_or(OptimizerError::Graph(GraphError::MissingEdge(edge)))
    }

    fn remove_vertex(&mut self, id: VertexId) -> OptimizerResult<()> {
        if self.root == Some(id) {
            self.root = None;
        }
        self.graph
            .remove_vertex(id)
            .map(|_| ())
            .ok_or(OptimizerError::Graph(GraphError::MissingVertex(id)))
    }

    fn marginal_covariance(
        &mut self,
        root: VertexId,
        other: VertexId,
    ) -> OptimizerResult<DMatrix<f64>> {
        if !self.graph.contains_vertex(root) {
            return Err(OptimizerError::InvalidVertex(root));
        }
        let all: BTreeSet<VertexId> = self.graph.vertex_ids().collect();
        self.build_index(root, &all);
        let indexed = self
            .graph
            .vertex(other)
            .is_some_and(|v| v.data.temp_index.is_some());
        if !indexed {
            self.clear_index();
            return Err(OptimizerError::InvalidVertex(other));
        }
        self.solver.reset();
        self.compute_active_edges(root);
        self.build_linear_system(root, 0.0);

        let outcome = self.factorize_current().and_then(|_| self.other_covariance(Some(other)));
        self.clear_index();
        outcome?.ok_or(OptimizerError::InvalidVertex(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifold::SE2;
    use std::f64::consts::PI;

    fn diag(values: &[f64]) -> DMatrix<f64> {
        DMatrix::from_diagonal(&DVector::from_row_slice(values))
    }

    fn chain_optimizer(poses: &[SE2], step: SE2) -> CholOptimizer<SE2> {
        let mut optimizer = CholOptimizer::default();
        let info = DMatrix::identity(3, 3);
        for (id, pose) in poses.iter().enumerate() {
            optimizer.add_vertex(id, *pose, &info).unwrap();
        }
        for id in 1..poses.len() {
            optimizer.add_edge(id - 1, id, step, info.clone()).unwrap();
        }
        optimizer
    }

    fn circle_pose(k: usize, n: usize) -> SE2 {
        let theta = 2.0 * PI * k as f64 / n as f64;
        SE2::from_xy_angle(5.0 * theta.cos(), 5.0 * theta.sin(), theta + PI / 2.0)
    }

    fn loop_optimizer(config: CholConfig, noise: f64) -> CholOptimizer<SE2> {
        let n = 10;
        let mut optimizer = CholOptimizer::new(config);
        let info = DMatrix::identity(3, 3);
        for k in 0..n {
            let truth = circle_pose(k, n);
            let pose = if k == 0 {
                truth
            } else {
                let s = (k as f64 * 1.7).sin();
                truth.compose(&SE2::from_xy_angle(noise * s, -noise * s, 0.4 * noise * s))
            };
            optimizer.add_vertex(k, pose, &info).unwrap();
        }
        for k in 0..n {
            let next = (k + 1) % n;
            let mean = circle_pose(k, n).between(&circle_pose(next, n));
            optimizer.add_edge(k, next, mean, info.clone()).unwrap();
        }
        optimizer.set_fixed(0, true).unwrap();
        optimizer
    }

    #[test]
    fn test_chain_converges_to_measurements() {
        let poses = [
            SE2::identity(),
            SE2::from_xy_angle(0.9, 0.1, 0.05),
            SE2::from_xy_angle(2.1, -0.1, -0.05),
        ];
        let mut optimizer = chain_optimizer(&poses, SE2::from_xy_angle(1.0, 0.0, 0.0));
        let summary = optimizer.optimize(10, false).unwrap();
        assert_eq!(summary.iterations, 10);
        assert!(summary.final_chi2 < 1e-12);

        let p2 = optimizer.pose(2).unwrap();
        assert!((p2.x() - 2.0).abs() < 1e-6);
        assert!(p2.y().abs() < 1e-6);
        assert!(p2.angle().abs() < 1e-6);
        assert_eq!(optimizer.pose(0).unwrap(), &SE2::identity());
    }

    #[test]
    fn test_loop_closure_with_fixed_vertex() {
        let mut optimizer = loop_optimizer(CholConfig::default(), 0.1);
        let initial = optimizer.chi2();
        assert!(initial > 1e-4);
        optimizer.optimize(10, false).unwrap();
        assert!(optimizer.chi2() < 1e-10);
        assert_eq!(optimizer.pose(0).unwrap(), &circle_pose(0, 10));
        let p5 = optimizer.pose(5).unwrap();
        let truth = circle_pose(5, 10);
        assert!((p5.x() - truth.x()).abs() < 1e-5);
        assert!((p5.y() - truth.y()).abs() < 1e-5);
    }

    #[test]
    fn test_levenberg_marquardt_never_increases_chi2() {
        let config = CholConfig::new().with_damping(DampingMode::LevenbergMarquardt);
        let mut optimizer = loop_optimizer(config, 0.3);
        let initial = optimizer.chi2();
        let summary = optimizer.optimize(8, false).unwrap();
        assert_eq!(summary.successful_steps + summary.unsuccessful_steps, 8);
        assert!(summary.successful_steps > 0);
        assert!(summary.final_chi2 <= initial);
        assert!(summary.final_chi2 < 1e-3);
    }

    #[test]
    fn test_fusion_adds_information() {
        let mut optimizer = CholOptimizer::<SE2>::default();
        let info = DMatrix::identity(3, 3);
        optimizer.add_vertex(0, SE2::identity(), &info).unwrap();
        optimizer.add_vertex(1, SE2::identity(), &info).unwrap();
        let mean = SE2::from_xy_angle(1.0, 0.5, 0.3);
        let first = optimizer.add_edge(0, 1, mean, diag(&[1.0, 2.0, 3.0])).unwrap();
        let second = optimizer.add_edge(0, 1, mean, diag(&[4.0, 5.0, 6.0])).unwrap();
        assert_eq!(first, second);
        assert_eq!(optimizer.graph().edge_count(), 1);

        let edge = optimizer.graph().edge(first).unwrap();
        let expected = diag(&[5.0, 7.0, 9.0]);
        for (a, b) in edge.data.information().iter().zip(expected.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
        assert!((edge.data.mean().x() - 1.0).abs() < 1e-9);
        assert!((edge.data.mean().angle() - 0.3).abs() < 1e-9);
        // Endpoints are restored after fusion
        assert_eq!(optimizer.pose(1).unwrap(), &SE2::identity());
        assert!(!optimizer.graph().vertex(1).unwrap().data.has_backup());
    }

    #[test]
    fn test_fusion_of_reversed_measurement_keeps_mean() {
        let mut optimizer = CholOptimizer::<SE2>::default();
        let info = DMatrix::identity(3, 3);
        optimizer.add_vertex(0, SE2::identity(), &info).unwrap();
        optimizer.add_vertex(1, SE2::identity(), &info).unwrap();
        let mean = SE2::from_xy_angle(2.0, -1.0, 0.7);
        let id = optimizer.add_edge(0, 1, mean, info.clone()).unwrap();
        let fused = optimizer.add_edge(1, 0, mean.inverse(), info.clone()).unwrap();
        assert_eq!(id, fused);

        let edge = optimizer.graph().edge(id).unwrap();
        assert_eq!(edge.from(), 0);
        assert!((edge.data.mean().x() - 2.0).abs() < 1e-9);
        assert!((edge.data.mean().y() + 1.0).abs() < 1e-9);
        assert!((edge.data.mean().angle() - 0.7).abs() < 1e-9);
        assert!(edge.data.information_det() > 1.0);
    }

    #[test]
    fn test_guess_on_edges_seeds_leaf() {
        let mut optimizer =
            CholOptimizer::<SE2>::new(CholConfig::new().with_guess_on_edges(true));
        let info = DMatrix::identity(3, 3);
        optimizer.add_vertex(0, SE2::from_xy_angle(1.0, 1.0, PI / 2.0), &info).unwrap();
        optimizer.add_vertex(1, SE2::identity(), &info).unwrap();
        optimizer
            .add_edge(0, 1, SE2::from_xy_angle(1.0, 0.0, 0.0), info.clone())
            .unwrap();
        let p1 = optimizer.pose(1).unwrap();
        assert!((p1.x() - 1.0).abs() < 1e-12);
        assert!((p1.y() - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_marginal_covariance_of_chain() {
        let poses = [SE2::identity(); 3];
        let mut optimizer = chain_optimizer(&poses, SE2::identity());
        let covariance = optimizer.marginal_covariance(0, 2).unwrap();
        for r in 0..3 {
            for c in 0..3 {
                let expected = if r == c { 2.0 } else { 0.0 };
                assert!((covariance[(r, c)] - expected).abs() < 1e-9);
            }
        }
        assert!(matches!(
            optimizer.marginal_covariance(0, 0),
            Err(OptimizerError::InvalidVertex(0))
        ));
        assert!(optimizer.graph().vertices().all(|v| v.data.temp_index.is_none()));
    }

    #[test]
    fn test_optimize_subset_reports_other_covariance() {
        let poses = [SE2::identity(); 3];
        let mut optimizer = chain_optimizer(&poses, SE2::identity());
        let all: BTreeSet<VertexId> = [0, 1, 2].into_iter().collect();
        let result = optimizer.optimize_subset(0, &all, 2, 0.0, false, Some(1)).unwrap();
        let covariance = result.other_covariance.unwrap();
        assert!((covariance[(0, 0)] - 1.0).abs() < 1e-9);

        let single: BTreeSet<VertexId> = [1].into_iter().collect();
        let result = optimizer.optimize_subset(0, &single, 2, 0.0, false, None).unwrap();
        assert_eq!(result.iterations, 0);
    }

    #[test]
    fn test_initialize_with_observations_restores_outside_vertices() {
        let poses = [SE2::identity(); 4];
        let mut optimizer = chain_optimizer(&poses, SE2::from_xy_angle(1.0, 0.0, 0.0));
        let subset: BTreeSet<VertexId> = [0, 1, 2].into_iter().collect();
        optimizer.initialize_with_observations(0, &subset).unwrap();
        assert!((optimizer.pose(2).unwrap().x() - 2.0).abs() < 1e-12);
        assert_eq!(optimizer.pose(3).unwrap(), &SE2::identity());
    }

    #[test]
    fn test_transform_subset_moves_rigidly() {
        let poses = [
            SE2::identity(),
            SE2::from_xy_angle(1.0, 0.0, 0.0),
            SE2::from_xy_angle(2.0, 0.0, 0.0),
        ];
        let mut optimizer = chain_optimizer(&poses, SE2::from_xy_angle(1.0, 0.0, 0.0));
        let chi2 = optimizer.chi2();
        let subset: BTreeSet<VertexId> = [0, 1, 2].into_iter().collect();
        optimizer.transform_subset(0, &subset, &SE2::from_xy_angle(0.0, 0.0, PI / 2.0));
        let p2 = optimizer.pose(2).unwrap();
        assert!(p2.x().abs() < 1e-12);
        assert!((p2.y() - 2.0).abs() < 1e-12);
        assert!((optimizer.chi2() - chi2).abs() < 1e-12);
    }

    #[test]
    fn test_disconnected_vertex_fails_factorization() {
        let mut optimizer = CholOptimizer::<SE2>::default();
        let info = DMatrix::identity(3, 3);
        optimizer.add_vertex(0, SE2::identity(), &info).unwrap();
        optimizer.add_vertex(1, SE2::identity(), &info).unwrap();
        let result = optimizer.optimize(1, false);
        assert!(matches!(result, Err(OptimizerError::Factorization(_))));
        assert!(optimizer.graph().vertices().all(|v| v.data.temp_index.is_none()));
    }

    #[test]
    fn test_initialize_and_remove_root() {
        let poses = [SE2::identity(); 2];
        let mut optimizer = chain_optimizer(&poses, SE2::identity());
        assert!(!optimizer.initialize(Some(7)));
        assert_eq!(optimizer.root(), None);
        assert!(optimizer.initialize(Some(1)));
        optimizer.remove_vertex(1).unwrap();
        assert_eq!(optimizer.root(), None);
        assert_eq!(optimizer.graph().edge_count(), 0);
        assert!(optimizer.remove_vertex(1).is_err());
    }

    #[test]
    fn test_backup_and_restore_roundtrip() {
        let poses = [SE2::identity(); 3];
        let mut optimizer = chain_optimizer(&poses, SE2::from_xy_angle(1.0, 0.0, 0.0));
        optimizer.backup().unwrap();
        assert!(matches!(optimizer.backup(), Err(OptimizerError::BackupOccupied(0))));
        optimizer.optimize(3, false).unwrap();
        assert!(optimizer.pose(2).unwrap().x() > 1.0);
        optimizer.restore().unwrap();
        assert_eq!(optimizer.pose(2).unwrap(), &SE2::identity());
        assert!(matches!(optimizer.restore(), Err(OptimizerError::NoBackup(0))));
    }

    #[test]
    fn test_chi2_statistics_sorted_descending() {
        let poses = [
            SE2::identity(),
            SE2::from_xy_angle(1.0, 0.0, 0.0),
            SE2::from_xy_angle(3.0, 0.0, 0.0),
        ];
        let optimizer = chain_optimizer(&poses, SE2::from_xy_angle(1.0, 0.0, 0.0));
        let stats = optimizer.chi2_statistics();
        assert_eq!(stats.len(), 2);
        assert!(stats[0].1 >= stats[1].1);
        assert_eq!(stats[0].0, 1);

        let errors = optimizer.error_statistics(None);
        assert!((errors.max_translational - 1.0).abs() < 1e-12);
        assert!((errors.average_translational - 0.5).abs() < 1e-12);
    }
}
