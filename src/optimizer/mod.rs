//! Pose-graph optimizers.
//!
//! - [`CholOptimizer`]: single-level sparse Gauss-Newton (optionally Levenberg-Marquardt)
//! - [`HierarchicalOptimizer`]: multi-level clustering with coarse-edge annotation, batch
//!   V-cycles and bounded incremental updates
//!
//! Both implement [`GraphOptimizer`], which carries the shared chi2 accounting and the
//! pose backup/restore helpers.

use crate::core::graph::{EdgeId, GraphError, VertexId};
use crate::core::pose_graph::{PoseGraph, PoseVertex};
use crate::linalg::LinAlgError;
use crate::manifold::PoseManifold;
use nalgebra::DMatrix;
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub mod chol;
pub mod hierarchical;

pub use crate::core::pose_graph::ErrorMode;
pub use chol::{CholConfig, CholOptimizer, SubsetResult};
pub use hierarchical::{ClusterLinks, HierarchicalConfig, HierarchicalOptimizer, Level};

/// Step control of the single-level solver
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum DampingMode {
    /// Plain Gauss-Newton steps
    #[default]
    GaussNewton,
    /// Damped steps that are rolled back if they raise chi2
    LevenbergMarquardt,
}

impl fmt::Display for DampingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DampingMode::GaussNewton => write!(f, "Gauss-Newton"),
            DampingMode::LevenbergMarquardt => write!(f, "Levenberg-Marquardt"),
        }
    }
}

/// Optimizer specific error types
#[derive(Debug, Clone, Error)]
pub enum OptimizerError {
    /// The normal equations could not be factorized
    #[error("Cholesky factorization failed: {0}")]
    Factorization(String),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    LinearAlgebra(#[from] LinAlgError),

    #[error("Backup slot of vertex {0} is already occupied")]
    BackupOccupied(VertexId),

    #[error("Vertex {0} has no backup to restore")]
    NoBackup(VertexId),

    /// The vertex is missing or cannot play the requested role
    #[error("Invalid vertex {0}")]
    InvalidVertex(VertexId),

    /// Broken cluster links between levels
    #[error("Hierarchy error: {0}")]
    Hierarchy(String),
}

/// Result type for optimizer operations
pub type OptimizerResult<T> = Result<T, OptimizerError>;

/// Status of an optimization call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptimizationStatus {
    /// All requested iterations ran
    Completed,
    /// The graph had nothing to optimize
    NothingToOptimize,
    /// An incremental update ran without a global solve
    IncrementalUpdate,
}

impl fmt::Display for OptimizationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptimizationStatus::Completed => write!(f, "Completed"),
            OptimizationStatus::NothingToOptimize => write!(f, "Nothing to optimize"),
            OptimizationStatus::IncrementalUpdate => write!(f, "Incremental update"),
        }
    }
}

/// Summary of one `optimize` call.
#[derive(Debug, Clone)]
pub struct OptimizationSummary {
    pub status: OptimizationStatus,
    pub initial_chi2: f64,
    pub final_chi2: f64,
    pub iterations: usize,
    /// Levenberg-Marquardt steps kept
    pub successful_steps: usize,
    /// Levenberg-Marquardt steps rolled back
    pub unsuccessful_steps: usize,
    pub vertices: usize,
    pub edges: usize,
    pub total_time: Duration,
}

impl OptimizationSummary {
    pub(crate) fn nothing_to_optimize(chi2: f64, vertices: usize, edges: usize) -> Self {
        Self {
            status: OptimizationStatus::NothingToOptimize,
            initial_chi2: chi2,
            final_chi2: chi2,
            iterations: 0,
            successful_steps: 0,
            unsuccessful_steps: 0,
            vertices,
            edges,
            total_time: Duration::ZERO,
        }
    }
}

impl fmt::Display for OptimizationSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Pose Graph Optimization Summary ===")?;
        writeln!(f, "Status:                    {}", self.status)?;
        writeln!(f, "Vertices / edges:          {} / {}", self.vertices, self.edges)?;
        writeln!(f, "Initial chi2:              {:.6e}", self.initial_chi2)?;
        writeln!(f, "Final chi2:                {:.6e}", self.final_chi2)?;
        writeln!(
            f,
            "Chi2 reduction:            {:.6e} ({:.2}%)",
            self.initial_chi2 - self.final_chi2,
            100.0 * (self.initial_chi2 - self.final_chi2) / self.initial_chi2.max(1e-12)
        )?;
        writeln!(f, "Iterations:                {}", self.iterations)?;
        if self.successful_steps + self.unsuccessful_steps > 0 {
            writeln!(
                f,
                "Accepted / rejected steps: {} / {}",
                self.successful_steps, self.unsuccessful_steps
            )?;
        }
        writeln!(f, "Total time:                {:?}", self.total_time)?;
        Ok(())
    }
}

/// Aggregated absolute residuals over a set of edges.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ErrorStatistics {
    pub average_rotational: f64,
    pub average_translational: f64,
    pub max_rotational: f64,
    pub max_translational: f64,
}

/// Shared interface of the pose-graph optimizers.
///
/// Structural mutations go through the optimizer so it can keep its bookkeeping
/// (fusion of parallel edges, chi2 caches, cluster taints) consistent. Poses may be edited
/// directly through [`GraphOptimizer::vertex_mut`].
pub trait GraphOptimizer<M: PoseManifold> {
    /// The graph the caller works with (the bottom level for hierarchical optimizers).
    fn graph(&self) -> &PoseGraph<M>;

    fn vertex_mut(&mut self, id: VertexId) -> Option<&mut PoseVertex<M>>;

    /// Select the gauge vertex. Returns false, and clears the selection, if it does not exist.
    fn initialize(&mut self, root: Option<VertexId>) -> bool;

    /// Run a batch solve, or an incremental update when `online` is set.
    fn optimize(&mut self, iterations: usize, online: bool) -> OptimizerResult<OptimizationSummary>;

    fn add_vertex(&mut self, id: VertexId, pose: M, information: &DMatrix<f64>)
    -> OptimizerResult<()>;

    /// Add a measurement. A measurement between already connected vertices is fused into
    /// the existing edge, whose id is returned.
    fn add_edge(
        &mut self,
        from: VertexId,
        to: VertexId,
        mean: M,
        information: DMatrix<f64>,
    ) -> OptimizerResult<EdgeId>;

    fn refine_edge(&mut self, edge: EdgeId, mean: M, information: DMatrix<f64>)
    -> OptimizerResult<()>;

    fn remove_edge(&mut self, edge: EdgeId) -> OptimizerResult<()>;

    fn remove_vertex(&mut self, id: VertexId) -> OptimizerResult<()>;

    /// Covariance of `other` relative to `root`, expressed in the residual frame of the
    /// `root -> other` relation. Poses are left untouched.
    fn marginal_covariance(&mut self, root: VertexId, other: VertexId)
    -> OptimizerResult<DMatrix<f64>>;

    fn pose(&self, id: VertexId) -> Option<&M> {
        self.graph().pose(id)
    }

    /// Total chi2 of the graph.
    fn chi2(&self) -> f64 {
        self.graph().total_chi2()
    }

    fn edge_chi2(&self, edge: EdgeId) -> Option<f64> {
        self.graph().edge_chi2(edge)
    }

    /// `(rotational, translational)` norms of `(from⁻¹ · to) · mean⁻¹`.
    fn abs_error(&self, edge: EdgeId) -> Option<(f64, f64)> {
        let graph = self.graph();
        let e = graph.edge(edge)?;
        let from = graph.pose(e.from())?;
        let to = graph.pose(e.to())?;
        let delta = from.between(to).compose(&e.data.mean().inverse());
        Some((delta.rotation_vector().norm(), delta.translation_vector().norm()))
    }

    /// Per-edge chi2, largest first.
    fn chi2_statistics(&self) -> Vec<(EdgeId, f64)> {
        let graph = self.graph();
        let mut stats: Vec<(EdgeId, f64)> = graph
            .edge_ids()
            .filter_map(|id| graph.edge_chi2(id).map(|chi2| (id, chi2)))
            .collect();
        stats.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        stats
    }

    /// Average and maximum absolute errors over `edges`, or over the whole graph.
    fn error_statistics(&self, edges: Option<&BTreeSet<EdgeId>>) -> ErrorStatistics {
        let ids: Vec<EdgeId> = match edges {
            Some(set) => set.iter().copied().collect(),
            None => self.graph().edge_ids().collect(),
        };
        let mut stats = ErrorStatistics::default();
        let mut count = 0usize;
        for (rotational, translational) in ids.into_iter().filter_map(|id| self.abs_error(id)) {
            stats.max_rotational = stats.max_rotational.max(rotational);
            stats.max_translational = stats.max_translational.max(translational);
            stats.average_rotational += rotational;
            stats.average_translational += translational;
            count += 1;
        }
        if count > 0 {
            stats.average_rotational /= count as f64;
            stats.average_translational /= count as f64;
        }
        stats
    }

    fn set_fixed(&mut self, id: VertexId, fixed: bool) -> OptimizerResult<()> {
        let vertex = self.vertex_mut(id).ok_or(OptimizerError::InvalidVertex(id))?;
        vertex.fixed = fixed;
        Ok(())
    }

    /// Back up every pose.
    fn backup(&mut self) -> OptimizerResult<()> {
        let ids: BTreeSet<VertexId> = self.graph().vertex_ids().collect();
        self.backup_subset(&ids)
    }

    /// Restore every pose.
    fn restore(&mut self) -> OptimizerResult<()> {
        let ids: BTreeSet<VertexId> = self.graph().vertex_ids().collect();
        self.restore_subset(&ids)
    }

    fn backup_subset(&mut self, ids: &BTreeSet<VertexId>) -> OptimizerResult<()> {
        for &id in ids {
            let vertex = self.vertex_mut(id).ok_or(OptimizerError::InvalidVertex(id))?;
            if !vertex.backup() {
                return Err(OptimizerError::BackupOccupied(id));
            }
        }
        Ok(())
    }

    fn restore_subset(&mut self, ids: &BTreeSet<VertexId>) -> OptimizerResult<()> {
        for &id in ids {
            let vertex = self.vertex_mut(id).ok_or(OptimizerError::InvalidVertex(id))?;
            if !vertex.restore() {
                return Err(OptimizerError::NoBackup(id));
            }
        }
        Ok(())
    }
}
