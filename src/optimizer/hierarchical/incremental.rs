//! Incremental optimization: after new vertices arrive only the affected clusters are
//! rebuilt, the top level is re-solved when its chi2 drifted, and the correction is
//! propagated down along the ancestor chains of the new vertices.

use super::HierarchicalOptimizer;
use crate::core::graph::VertexId;
use crate::manifold::PoseManifold;
use crate::optimizer::{GraphOptimizer, OptimizerResult};
use std::collections::BTreeSet;
use tracing::{debug, trace};

impl<M: PoseManifold> HierarchicalOptimizer<M> {
    /// One incremental step. Only the bottom vertices that were unclustered before the
    /// structure update get their neighbourhood propagated; vertices released from
    /// tainted clusters are re-clustered and follow their new top ancestors. Returns the
    /// propagated vertices.
    pub fn optimize_incremental(&mut self) -> OptimizerResult<Vec<VertexId>> {
        let updated = self.pending_vertices();

        self.update_structure(true)?;
        self.optimize_levels()?;

        let mut top_ancestors = BTreeSet::new();
        for &vertex in &updated {
            let chain = self.ancestor_chain(vertex);
            self.propagate_to_neighbourhood(&chain)?;
            if chain.len() == self.levels.len() {
                if let Some(&top) = chain.last() {
                    top_ancestors.insert(top);
                }
            }
        }

        let top = self.levels.len() - 1;
        for ancestor in top_ancestors {
            self.propagate_subtree(top, ancestor)?;
        }
        Ok(updated)
    }

    /// Bottom vertices that have not been clustered yet.
    pub fn pending_vertices(&self) -> Vec<VertexId> {
        self.levels[0]
            .links
            .iter()
            .filter(|(_, links)| links.root.is_none())
            .map(|(&id, _)| id)
            .collect()
    }

    /// Re-solve the top level if its chi2 drifted since the last solve, then move every
    /// cluster whose parent moved by more than the thresholds. Returns whether the top
    /// level was solved.
    pub fn optimize_levels(&mut self) -> OptimizerResult<bool> {
        let top = self.levels.len() - 1;
        let drift_threshold = self.config.chi2_drift_threshold;
        let level = &mut self.levels[top];
        let drift = (level.cached_chi2 - level.last_optimized_chi2).abs();
        if drift <= drift_threshold {
            trace!(drift, "top level unchanged, skipping global solve");
            return Ok(false);
        }

        level
            .optimizer
            .optimize(self.config.global_incremental_iterations, false)?;
        let chi2 = level.optimizer.chi2();
        level.cached_chi2 = chi2;
        level.last_optimized_chi2 = chi2;
        debug!(drift, chi2, "top level re-solved");

        for lower_level in (0..top).rev() {
            let moved: Vec<(VertexId, BTreeSet<VertexId>, M)> = {
                let upper = &self.levels[lower_level + 1];
                let lower = &self.levels[lower_level];
                upper
                    .graph()
                    .vertices()
                    .filter_map(|v| {
                        let root = upper.lower_root(v.id())?;
                        let root_pose = lower.graph().pose(root)?;
                        let delta = v.data.pose.between(root_pose);
                        let still = delta.translation_vector().amax()
                            < self.config.translational_threshold
                            && delta.rotation_vector().amax() < self.config.rotational_threshold;
                        (!still).then(|| (root, upper.children(v.id()), v.data.pose.clone()))
                    })
                    .collect()
            };

            let lower = &mut self.levels[lower_level].optimizer;
            for (root, children, pose) in &moved {
                lower.transform_subset(*root, children, pose);
            }
            if self.config.propagate_down {
                let iterations = self.config.down_incremental_iterations;
                for (root, children, _) in &moved {
                    lower.optimize_subset(*root, children, iterations, 1.0, false, None)?;
                }
            }
        }
        Ok(true)
    }

    /// `[vertex, parent, grandparent, ...]` from the bottom up, stopping at the first
    /// missing link.
    fn ancestor_chain(&self, vertex: VertexId) -> Vec<VertexId> {
        let mut chain = vec![vertex];
        while chain.len() < self.levels.len() {
            let level = chain.len() - 1;
            let parent = self.levels[level]
                .links
                .get(&chain[level])
                .and_then(|links| links.parent);
            match parent {
                Some(parent) => chain.push(parent),
                None => break,
            }
        }
        chain
    }

    /// Walking down the chain, align the clusters around each ancestor with their parents
    /// and relax them together.
    fn propagate_to_neighbourhood(&mut self, chain: &[VertexId]) -> OptimizerResult<()> {
        let iterations = self.config.down_incremental_iterations;
        for level in (0..chain.len().saturating_sub(1)).rev() {
            let parent = chain[level + 1];
            let upper = &self.levels[level + 1];
            let Some(gauge) = upper.lower_root(parent) else {
                continue;
            };
            let Some(vertex) = upper.graph().vertex(parent) else {
                continue;
            };
            let mut neighbourhood: BTreeSet<VertexId> = vertex
                .edges()
                .iter()
                .filter_map(|&e| upper.graph().edge(e))
                .flat_map(|edge| [edge.from(), edge.to()])
                .collect();
            neighbourhood.insert(parent);

            let mut region = BTreeSet::new();
            let mut moves = Vec::with_capacity(neighbourhood.len());
            for cluster in neighbourhood {
                let (Some(root), Some(pose)) = (upper.lower_root(cluster), upper.graph().pose(cluster))
                else {
                    continue;
                };
                let children = upper.children(cluster);
                region.extend(children.iter().copied());
                moves.push((root, children, pose.clone()));
            }

            let lower = &mut self.levels[level].optimizer;
            for (root, children, pose) in &moves {
                lower.transform_subset(*root, children, pose);
            }
            lower.optimize_subset(gauge, &region, iterations, 1.0, false, None)?;
        }
        Ok(())
    }

    /// Align and relax every cluster of the subtree below `id`, depth first.
    fn propagate_subtree(&mut self, level: usize, id: VertexId) -> OptimizerResult<()> {
        let iterations = self.config.down_incremental_iterations;
        let mut stack = vec![(level, id)];
        while let Some((l, v)) = stack.pop() {
            if l == 0 {
                continue;
            }
            let upper = &self.levels[l];
            let (Some(root), Some(pose)) = (upper.lower_root(v), upper.graph().pose(v).cloned())
            else {
                continue;
            };
            let children = upper.children(v);

            let lower = &mut self.levels[l - 1].optimizer;
            lower.transform_subset(root, &children, &pose);
            lower.optimize_subset(root, &children, iterations, 1.0, false, None)?;
            stack.extend(children.iter().rev().map(|&c| (l - 1, c)));
        }
        Ok(())
    }
}
