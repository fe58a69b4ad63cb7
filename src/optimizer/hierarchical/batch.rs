//! Batch optimization: V-cycles over the full hierarchy.

use super::HierarchicalOptimizer;
use crate::core::graph::VertexId;
use crate::manifold::PoseManifold;
use crate::optimizer::{GraphOptimizer, OptimizerResult};
use std::collections::BTreeSet;
use tracing::{debug, error};

/// Iterations used by both halves of a V-cycle.
const VCYCLE_ITERATIONS: usize = 3;

impl<M: PoseManifold> HierarchicalOptimizer<M> {
    /// Rebuild the hierarchy from scratch and run `iterations` V-cycles.
    pub fn optimize_batch(&mut self, iterations: usize) -> OptimizerResult<()> {
        self.update_structure(false)?;
        for cycle in 0..iterations {
            self.bottom_to_top(VCYCLE_ITERATIONS, 0.0)?;
            self.top_to_bottom(VCYCLE_ITERATIONS, 1.0)?;
            if tracing::enabled!(tracing::Level::DEBUG) {
                debug!(cycle, chi2 = self.chi2(), "V-cycle finished");
            }
        }
        Ok(())
    }

    /// Annotate every coarse edge level by level, then solve the top level with its
    /// poses initialized from the annotated measurements.
    pub fn bottom_to_top(&mut self, iterations: usize, lambda: f64) -> OptimizerResult<()> {
        let top = self.levels.len() - 1;
        for level in 1..=top {
            let edges: Vec<_> = self.levels[level].graph().edge_ids().collect();
            for edge in edges {
                self.annotate_edge(level, edge, iterations, lambda, false)?;
            }
        }
        if top == 0 {
            return Ok(());
        }

        let optimizer = &mut self.levels[top].optimizer;
        let Some(root) = optimizer.graph().vertex_ids().next() else {
            return Ok(());
        };
        optimizer.initialize(Some(root));
        let all: BTreeSet<VertexId> = optimizer.graph().vertex_ids().collect();
        optimizer.optimize_subset(root, &all, iterations * 3, lambda, true, None)?;
        Ok(())
    }

    /// Push the upper solution down: every cluster is moved onto its parent's pose,
    /// re-initialized from its measurements and relaxed with boundary weight `lambda`.
    pub fn top_to_bottom(&mut self, iterations: usize, lambda: f64) -> OptimizerResult<()> {
        for level in (1..self.levels.len()).rev() {
            let clusters: Vec<(VertexId, BTreeSet<VertexId>, M)> = {
                let upper = &self.levels[level];
                upper
                    .graph()
                    .vertices()
                    .filter_map(|v| {
                        let root = upper.lower_root(v.id())?;
                        Some((root, upper.children(v.id()), v.data.pose.clone()))
                    })
                    .collect()
            };

            let lower = &mut self.levels[level - 1].optimizer;
            let mut covered = 0;
            for (root, children, pose) in &clusters {
                lower.transform_subset(*root, children, pose);
                lower.initialize_with_observations(*root, children)?;
                covered += children.len();
            }
            let expected = lower.graph().vertex_count();
            if covered != expected {
                error!(
                    level,
                    covered, expected, "clusters do not partition the level below"
                );
            }
            for (root, children, _) in &clusters {
                lower.optimize_subset(*root, children, iterations, lambda, true, None)?;
            }
        }
        Ok(())
    }
}
