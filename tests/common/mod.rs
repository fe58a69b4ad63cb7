//! Synthetic pose graphs shared by the integration tests.

#![allow(dead_code)]

use hog_solver::core::graph::VertexId;
use hog_solver::core::pose_graph::PoseGraph;
use hog_solver::manifold::{PoseManifold, SE2};
use hog_solver::optimizer::GraphOptimizer;
use nalgebra::DMatrix;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f64::consts::FRAC_PI_2;

/// Ground truth and noisy measurements of a robot driving laps around a square.
pub struct SquareLaps {
    pub truth: Vec<SE2>,
    /// `(from, to, measurement)` with `from < to`, odometry first for every `to`
    pub edges: Vec<(VertexId, VertexId, SE2)>,
    pub lap_length: usize,
}

impl SquareLaps {
    /// `laps` laps around a square with `side` unit steps per side. Odometry is perturbed
    /// with uniform noise of half-width `noise`; revisits of the same corner pose are
    /// exact loop closures.
    pub fn generate(laps: usize, side: usize, noise: f64, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let lap_length = 4 * side;
        let count = laps * lap_length + 1;

        let mut truth = Vec::with_capacity(count);
        truth.push(SE2::identity());
        let mut edges = Vec::new();
        for k in 1..count {
            let turn = if k % side == 0 { FRAC_PI_2 } else { 0.0 };
            let step = SE2::from_xy_angle(1.0, 0.0, turn);
            let previous = truth[k - 1].clone();
            truth.push(previous.compose(&step));

            let perturbation = SE2::from_xy_angle(
                rng.random_range(-noise..=noise),
                rng.random_range(-noise..=noise),
                rng.random_range(-noise..=noise) * 0.5,
            );
            edges.push((k - 1, k, step.compose(&perturbation)));
            if k >= lap_length {
                edges.push((k - lap_length, k, SE2::identity()));
            }
        }
        Self {
            truth,
            edges,
            lap_length,
        }
    }

    pub fn vertex_count(&self) -> usize {
        self.truth.len()
    }

    /// A graph initialized by chaining the noisy odometry.
    pub fn odometry_graph(&self) -> PoseGraph<SE2> {
        let mut graph = PoseGraph::new();
        let info = information();
        let mut pose = SE2::identity();
        graph.add_pose_vertex(0, pose.clone(), &info).unwrap();
        for (from, to, mean) in &self.edges {
            if to - from == 1 {
                pose = pose.compose(mean);
                graph.add_pose_vertex(*to, pose.clone(), &info).unwrap();
            }
        }
        for (from, to, mean) in &self.edges {
            graph.add_pose_edge(*from, *to, mean.clone(), info.clone()).unwrap();
        }
        graph
    }

    /// Feed vertex after vertex into an optimizer, running an online update every
    /// `update` vertices and once at the end.
    pub fn feed<O: GraphOptimizer<SE2>>(&self, optimizer: &mut O, update: usize) {
        let info = information();
        optimizer.add_vertex(0, SE2::identity(), &info).unwrap();
        let mut pending = 0;
        for (from, to, mean) in &self.edges {
            if !optimizer.graph().contains_vertex(*to) {
                if pending >= update {
                    optimizer.optimize(1, true).unwrap();
                    pending = 0;
                }
                optimizer.add_vertex(*to, SE2::identity(), &info).unwrap();
                pending += 1;
            }
            optimizer.add_edge(*from, *to, mean.clone(), info.clone()).unwrap();
        }
        optimizer.optimize(1, true).unwrap();
    }

    /// Largest translational distance between an estimate and the ground truth, after
    /// aligning both on vertex 0.
    pub fn max_translation_error(&self, graph: &PoseGraph<SE2>) -> f64 {
        let Some(anchor) = graph.pose(0) else {
            return f64::INFINITY;
        };
        let anchor_inverse = anchor.inverse();
        self.truth
            .iter()
            .enumerate()
            .filter_map(|(id, truth)| {
                let estimate = anchor_inverse.compose(graph.pose(id)?);
                Some(truth.between(&estimate).translation_vector().norm())
            })
            .fold(0.0, f64::max)
    }
}

pub fn information() -> DMatrix<f64> {
    DMatrix::identity(3, 3)
}

/// A straight chain `0 - 1 - ... - (n-1)` of unit steps with every pose at the identity.
pub fn identity_chain<O: GraphOptimizer<SE2>>(optimizer: &mut O, n: usize) {
    let info = information();
    for id in 0..n {
        optimizer.add_vertex(id, SE2::identity(), &info).unwrap();
    }
    for id in 1..n {
        optimizer
            .add_edge(id - 1, id, SE2::from_xy_angle(1.0, 0.0, 0.0), info.clone())
            .unwrap();
    }
    for id in 0..n {
        optimizer.vertex_mut(id).unwrap().pose = SE2::identity();
    }
}
