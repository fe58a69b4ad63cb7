//! Pose graphs: vertices carry poses on a [`PoseManifold`], edges carry relative-pose
//! measurements with information matrices.

use crate::core::dijkstra::{AdjacencyMap, CostFunction, Dijkstra};
use crate::core::graph::{Edge, EdgeId, Graph, GraphError, GraphResult, Revertible, Vertex, VertexId};
use crate::manifold::{Linearization, PoseManifold};
use nalgebra::DMatrix;

/// How edge residuals are linearized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorMode {
    /// `e = to_vector(Z⁻¹ · Tᵢ⁻¹ · Tⱼ)` with exact Jacobians
    #[default]
    Manifold,
    /// Global-frame first-order residual
    Linearized,
}

/// Inverse with a pseudo-inverse fallback for singular input.
pub(crate) fn invert_or_pseudo(matrix: &DMatrix<f64>) -> DMatrix<f64> {
    matrix.clone().try_inverse().unwrap_or_else(|| {
        matrix
            .clone()
            .pseudo_inverse(1e-12)
            .unwrap_or_else(|_| DMatrix::zeros(matrix.nrows(), matrix.ncols()))
    })
}

/// Per-vertex payload.
#[derive(Debug, Clone)]
pub struct PoseVertex<M: PoseManifold> {
    pub pose: M,
    /// Marginal covariance of the pose, filled by propagation or by the optimizer
    pub covariance: DMatrix<f64>,
    /// Held constant by the optimizers
    pub fixed: bool,
    /// Dense index into the linear system, valid during a single solve
    pub temp_index: Option<usize>,
    backup: Option<M>,
}

impl<M: PoseManifold> PoseVertex<M> {
    pub fn new(pose: M, covariance: DMatrix<f64>) -> Self {
        Self {
            pose,
            covariance,
            fixed: false,
            temp_index: None,
            backup: None,
        }
    }

    /// Store the current pose in the backup slot. Returns false if the slot is taken.
    pub fn backup(&mut self) -> bool {
        if self.backup.is_some() {
            return false;
        }
        self.backup = Some(self.pose.clone());
        true
    }

    /// Restore and clear the backup slot. Returns false if there is nothing to restore.
    pub fn restore(&mut self) -> bool {
        match self.backup.take() {
            Some(pose) => {
                self.pose = pose;
                true
            }
            None => false,
        }
    }

    pub fn has_backup(&self) -> bool {
        self.backup.is_some()
    }
}

impl<M: PoseManifold> Default for PoseVertex<M> {
    fn default() -> Self {
        Self::new(M::identity(), DMatrix::identity(M::DOF, M::DOF))
    }
}

/// Per-edge payload: the measurement and its cached derived quantities.
#[derive(Debug, Clone)]
pub struct PoseEdge<M: PoseManifold> {
    mean: M,
    information: DMatrix<f64>,
    covariance: DMatrix<f64>,
    information_det: f64,
    covariance_det: f64,
    reverse_mean: M,
    reverse_information: DMatrix<f64>,
    reverse_covariance: DMatrix<f64>,
    reverse_information_det: f64,
    reverse_covariance_det: f64,
}

impl<M: PoseManifold> PoseEdge<M> {
    pub fn new(mean: M, information: DMatrix<f64>) -> Self {
        let dof = M::DOF;
        let mut edge = Self {
            mean: M::identity(),
            information: DMatrix::identity(dof, dof),
            covariance: DMatrix::identity(dof, dof),
            information_det: 1.0,
            covariance_det: 1.0,
            reverse_mean: M::identity(),
            reverse_information: DMatrix::identity(dof, dof),
            reverse_covariance: DMatrix::identity(dof, dof),
            reverse_information_det: 1.0,
            reverse_covariance_det: 1.0,
        };
        edge.set_attributes(mean, information);
        edge
    }

    /// Replace the measurement and recompute every cached value.
    pub fn set_attributes(&mut self, mean: M, information: DMatrix<f64>) {
        self.covariance = invert_or_pseudo(&information);
        self.information_det = information.determinant();
        self.covariance_det = 1.0 / self.information_det;
        self.reverse_mean = mean.inverse();
        // The residual of the reverted edge has the same information to first order
        self.reverse_information = information.clone();
        self.reverse_covariance = self.covariance.clone();
        self.reverse_information_det = self.information_det;
        self.reverse_covariance_det = self.covariance_det;
        self.mean = mean;
        self.information = information;
    }

    pub fn mean(&self) -> &M {
        &self.mean
    }

    pub fn information(&self) -> &DMatrix<f64> {
        &self.information
    }

    pub fn covariance(&self) -> &DMatrix<f64> {
        &self.covariance
    }

    pub fn information_det(&self) -> f64 {
        self.information_det
    }

    pub fn covariance_det(&self) -> f64 {
        self.covariance_det
    }

    pub fn reverse_mean(&self) -> &M {
        &self.reverse_mean
    }

    /// Mean seen from the `from` side (`forward`) or from the `to` side.
    pub fn mean_in_direction(&self, forward: bool) -> &M {
        if forward {
            &self.mean
        } else {
            &self.reverse_mean
        }
    }

    pub fn covariance_in_direction(&self, forward: bool) -> &DMatrix<f64> {
        if forward {
            &self.covariance
        } else {
            &self.reverse_covariance
        }
    }

    /// Residual and Jacobians at the given endpoint poses.
    pub fn linearize(&self, from: &M, to: &M, mode: ErrorMode) -> Linearization {
        match mode {
            ErrorMode::Manifold => M::manifold_error(from, to, &self.mean),
            ErrorMode::Linearized => M::linearized_error(from, to, &self.mean),
        }
    }

    /// `eᵀ Ω e` with `e = to_vector(Z⁻¹ · from⁻¹ · to)`.
    pub fn chi2(&self, from: &M, to: &M) -> f64 {
        let e = M::relative_error(from, to, &self.mean);
        e.dot(&(&self.information * &e))
    }
}

impl<M: PoseManifold> Revertible for PoseEdge<M> {
    fn revert(&mut self) {
        std::mem::swap(&mut self.mean, &mut self.reverse_mean);
        std::mem::swap(&mut self.information, &mut self.reverse_information);
        std::mem::swap(&mut self.covariance, &mut self.reverse_covariance);
        std::mem::swap(&mut self.information_det, &mut self.reverse_information_det);
        std::mem::swap(&mut self.covariance_det, &mut self.reverse_covariance_det);
    }
}

pub type PoseGraph<M> = Graph<PoseVertex<M>, PoseEdge<M>>;

/// Length of the edge's translational component.
#[derive(Debug, Clone, Copy, Default)]
pub struct PathLengthCost;

impl<M: PoseManifold> CostFunction<PoseVertex<M>, PoseEdge<M>> for PathLengthCost {
    fn cost(
        &self,
        edge: &Edge<PoseEdge<M>>,
        _from: &Vertex<PoseVertex<M>>,
        _to: &Vertex<PoseVertex<M>>,
    ) -> f64 {
        edge.data.mean().translation_vector().norm()
    }
}

/// Determinant of the edge covariance.
#[derive(Debug, Clone, Copy, Default)]
pub struct CovarianceDetCost;

impl<M: PoseManifold> CostFunction<PoseVertex<M>, PoseEdge<M>> for CovarianceDetCost {
    fn cost(
        &self,
        edge: &Edge<PoseEdge<M>>,
        _from: &Vertex<PoseVertex<M>>,
        _to: &Vertex<PoseVertex<M>>,
    ) -> f64 {
        edge.data.covariance_det()
    }
}

impl<M: PoseManifold> Graph<PoseVertex<M>, PoseEdge<M>> {
    /// Add a vertex whose covariance is the inverse of `information`.
    pub fn add_pose_vertex(
        &mut self,
        id: VertexId,
        pose: M,
        information: &DMatrix<f64>,
    ) -> GraphResult<&mut Vertex<PoseVertex<M>>> {
        self.add_vertex(id, PoseVertex::new(pose, invert_or_pseudo(information)))
    }

    pub fn add_pose_edge(
        &mut self,
        from: VertexId,
        to: VertexId,
        mean: M,
        information: DMatrix<f64>,
    ) -> GraphResult<EdgeId> {
        self.add_edge(from, to, PoseEdge::new(mean, information))
    }

    pub fn pose(&self, id: VertexId) -> Option<&M> {
        self.vertex(id).map(|v| &v.data.pose)
    }

    pub fn set_pose(&mut self, id: VertexId, pose: M) -> GraphResult<()> {
        let vertex = self.vertex_mut(id).ok_or(GraphError::MissingVertex(id))?;
        vertex.data.pose = pose;
        Ok(())
    }

    pub fn refine_edge(&mut self, id: EdgeId, mean: M, information: DMatrix<f64>) -> GraphResult<()> {
        let edge = self.edge_mut(id).ok_or(GraphError::MissingEdge(id))?;
        edge.data.set_attributes(mean, information);
        Ok(())
    }

    /// Chi2 of one edge at the current poses.
    pub fn edge_chi2(&self, id: EdgeId) -> Option<f64> {
        let edge = self.edge(id)?;
        let from = self.pose(edge.from())?;
        let to = self.pose(edge.to())?;
        Some(edge.data.chi2(from, to))
    }

    /// Sum of the chi2 of all edges.
    pub fn total_chi2(&self) -> f64 {
        self.edge_ids().filter_map(|id| self.edge_chi2(id)).sum()
    }

    /// Chi2 summed over a set of edges.
    pub fn chi2_of<'a>(&self, edges: impl IntoIterator<Item = &'a EdgeId>) -> f64 {
        edges
            .into_iter()
            .filter_map(|id| self.edge_chi2(*id))
            .sum()
    }

    /// Set every non-fixed vertex of the tree to `parent · mean`, walking from `root`.
    ///
    /// `map` must hold a Dijkstra tree (see [`Dijkstra::compute_tree`]).
    pub fn propagate_poses(&mut self, root: VertexId, map: &AdjacencyMap) {
        Dijkstra::visit_adjacency_map(root, map, |v, parent, edge| {
            let (Some(parent), Some(edge)) = (parent, edge) else {
                return;
            };
            if self.vertex(v).is_none_or(|vertex| vertex.data.fixed) {
                return;
            }
            let Some(step) = self.oriented_mean(edge, parent) else {
                return;
            };
            let Some(parent_pose) = self.pose(parent) else {
                return;
            };
            let pose = parent_pose.compose(&step);
            if let Some(vertex) = self.vertex_mut(v) {
                vertex.data.pose = pose;
            }
        });
    }

    /// First-order covariance propagation along the tree: the root gets zero
    /// covariance, children get `Jx Σp Jxᵀ + Ju Σe Juᵀ`.
    pub fn propagate_covariances(&mut self, root: VertexId, map: &AdjacencyMap) {
        Dijkstra::visit_adjacency_map(root, map, |v, parent, edge| {
            let (Some(parent), Some(edge_id)) = (parent, edge) else {
                if let Some(vertex) = self.vertex_mut(v) {
                    vertex.data.covariance = DMatrix::zeros(M::DOF, M::DOF);
                }
                return;
            };
            let Some(edge) = self.edge(edge_id) else {
                return;
            };
            let forward = edge.from() == parent;
            let step = edge.data.mean_in_direction(forward).clone();
            let edge_covariance = edge.data.covariance_in_direction(forward).clone();
            let Some(parent_vertex) = self.vertex(parent) else {
                return;
            };
            let (jx, ju) = M::motion_jacobians(&parent_vertex.data.pose, &step);
            let covariance = &jx * &parent_vertex.data.covariance * jx.transpose()
                + &ju * edge_covariance * ju.transpose();
            if let Some(vertex) = self.vertex_mut(v) {
                vertex.data.covariance = covariance;
            }
        });
    }

    /// Edge mean expressed from `start` towards the other endpoint.
    pub fn oriented_mean(&self, edge: EdgeId, start: VertexId) -> Option<M> {
        let edge = self.edge(edge)?;
        Some(edge.data.mean_in_direction(edge.from() == start).clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::dijkstra::{DEFAULT_CONDITIONER, UniformCost};
    use crate::manifold::SE2;

    fn chain(n: usize) -> PoseGraph<SE2> {
        let mut g = PoseGraph::new();
        let info = DMatrix::identity(3, 3);
        for id in 0..n {
            g.add_pose_vertex(id, SE2::identity(), &info).unwrap();
        }
        for id in 1..n {
            g.add_pose_edge(id - 1, id, SE2::from_xy_angle(1.0, 0.0, 0.1), info.clone())
                .unwrap();
        }
        g
    }

    #[test]
    fn test_set_attributes_caches_inverse() {
        let info = DMatrix::from_diagonal(&nalgebra::DVector::from_vec(vec![4.0, 2.0, 10.0]));
        let edge = PoseEdge::new(SE2::from_xy_angle(1.0, 2.0, 0.3), info);
        assert!((edge.covariance()[(0, 0)] - 0.25).abs() < 1e-12);
        assert!((edge.information_det() - 80.0).abs() < 1e-9);
        assert!((edge.covariance_det() - 1.0 / 80.0).abs() < 1e-12);
        let identity = edge.mean().compose(edge.reverse_mean());
        assert!(identity.translation().norm() < 1e-12);
    }

    #[test]
    fn test_revert_twice_is_identity() {
        let info = DMatrix::from_diagonal(&nalgebra::DVector::from_vec(vec![1.0, 2.0, 3.0]));
        let mut edge = PoseEdge::new(SE2::from_xy_angle(1.0, -1.0, 0.5), info.clone());
        let original = edge.mean().clone();
        edge.revert();
        assert!((edge.mean().x() - original.x()).abs() > 1e-6);
        edge.revert();
        assert_eq!(edge.mean(), &original);
        assert_eq!(edge.information(), &info);
    }

    #[test]
    fn test_chi2_zero_on_consistent_poses() {
        let mut g = chain(3);
        g.set_pose(1, SE2::from_xy_angle(1.0, 0.0, 0.1)).unwrap();
        let p1 = *g.pose(1).unwrap();
        g.set_pose(2, p1.compose(&SE2::from_xy_angle(1.0, 0.0, 0.1)))
            .unwrap();
        assert!(g.total_chi2() < 1e-18);

        g.set_pose(2, SE2::identity()).unwrap();
        assert!(g.total_chi2() > 0.1);
    }

    #[test]
    fn test_chi2_matches_weighted_residual() {
        let info = DMatrix::from_diagonal(&nalgebra::DVector::from_vec(vec![2.0, 2.0, 2.0]));
        let edge = PoseEdge::new(SE2::identity(), info);
        let chi2 = edge.chi2(&SE2::identity(), &SE2::from_xy_angle(1.0, 0.0, 0.0));
        assert!((chi2 - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_propagate_poses_along_tree() {
        let mut g = chain(4);
        g.vertex_mut(3).unwrap().data.fixed = true;
        let mut dijkstra = Dijkstra::new();
        dijkstra.shortest_paths(&g, 0, &UniformCost, f64::MAX, DEFAULT_CONDITIONER, false);
        Dijkstra::compute_tree(dijkstra.adjacency_map_mut());
        g.propagate_poses(0, dijkstra.adjacency_map());

        let step = SE2::from_xy_angle(1.0, 0.0, 0.1);
        let expected = step.compose(&step);
        let p2 = g.pose(2).unwrap();
        assert!((p2.x() - expected.x()).abs() < 1e-12);
        assert!((p2.angle() - 0.2).abs() < 1e-12);
        assert_eq!(g.pose(3).unwrap(), &SE2::identity());
    }

    #[test]
    fn test_propagate_poses_against_edge_direction() {
        let mut g = chain(3);
        let mut dijkstra = Dijkstra::new();
        dijkstra.shortest_paths(&g, 2, &UniformCost, f64::MAX, DEFAULT_CONDITIONER, false);
        Dijkstra::compute_tree(dijkstra.adjacency_map_mut());
        g.propagate_poses(2, dijkstra.adjacency_map());
        let inv = SE2::from_xy_angle(1.0, 0.0, 0.1).inverse();
        let p1 = g.pose(1).unwrap();
        assert!((p1.x() - inv.x()).abs() < 1e-12);
        assert!((p1.y() - inv.y()).abs() < 1e-12);
    }

    #[test]
    fn test_propagate_covariances_grow_along_chain() {
        let mut g = chain(4);
        let mut dijkstra = Dijkstra::new();
        dijkstra.shortest_paths(&g, 0, &UniformCost, f64::MAX, DEFAULT_CONDITIONER, false);
        Dijkstra::compute_tree(dijkstra.adjacency_map_mut());
        g.propagate_poses(0, dijkstra.adjacency_map());
        g.propagate_covariances(0, dijkstra.adjacency_map());

        let trace = |id| g.vertex(id).unwrap().data.covariance.trace();
        assert_eq!(trace(0), 0.0);
        assert!(trace(1) > 0.0);
        assert!(trace(2) > trace(1));
        assert!(trace(3) > trace(2));
    }

    #[test]
    fn test_vertex_backup_slot() {
        let mut v = PoseVertex::<SE2>::default();
        assert!(!v.restore());
        assert!(v.backup());
        assert!(!v.backup());
        v.pose = SE2::from_xy_angle(5.0, 0.0, 0.0);
        assert!(v.restore());
        assert_eq!(v.pose, SE2::identity());
        assert!(!v.has_backup());
    }

    #[test]
    fn test_cost_functions() {
        let g = chain(2);
        let edge = g.edges().next().unwrap();
        let (a, b) = (g.vertex(0).unwrap(), g.vertex(1).unwrap());
        assert!((PathLengthCost.cost(edge, a, b) - 1.0).abs() < 1e-12);
        assert!((CovarianceDetCost.cost(edge, a, b) - 1.0).abs() < 1e-12);
    }
}
