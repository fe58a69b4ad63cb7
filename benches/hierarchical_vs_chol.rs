//! Flat batch Cholesky against online hierarchical ingestion on a synthetic grid world.
//!
//! The robot sweeps a `size × size` grid row by row twice. Odometry is perturbed with
//! seeded uniform noise, and every cell visited on the second sweep is closed against the
//! first visit.

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use hog_solver::core::pose_graph::PoseGraph;
use hog_solver::manifold::{PoseManifold, SE2};
use hog_solver::optimizer::{
    CholConfig, CholOptimizer, GraphOptimizer, HierarchicalConfig, HierarchicalOptimizer,
};
use nalgebra::DMatrix;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::f64::consts::PI;
use std::time::Duration;

struct GridWorld {
    initial: Vec<SE2>,
    edges: Vec<(usize, usize, SE2)>,
}

fn grid_world(size: usize, seed: u64) -> GridWorld {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut cells = Vec::new();
    for _sweep in 0..2 {
        for row in 0..size {
            for col in 0..size {
                let col = if row % 2 == 0 { col } else { size - 1 - col };
                cells.push((col as f64, row as f64));
            }
        }
    }

    let truth: Vec<SE2> = cells
        .iter()
        .enumerate()
        .map(|(k, &(x, y))| {
            let heading = cells
                .get(k + 1)
                .map(|&(nx, ny)| (ny - y).atan2(nx - x))
                .unwrap_or(0.0);
            SE2::from_xy_angle(x, y, heading)
        })
        .collect();

    let mut edges = Vec::new();
    let mut initial = vec![SE2::identity()];
    let mut first_visit: HashMap<(i64, i64), usize> = HashMap::new();
    first_visit.insert((cells[0].0 as i64, cells[0].1 as i64), 0);
    for k in 1..truth.len() {
        let noise = SE2::from_xy_angle(
            rng.random_range(-0.05..0.05),
            rng.random_range(-0.05..0.05),
            rng.random_range(-0.02..0.02) * PI,
        );
        let odometry = truth[k - 1].between(&truth[k]).compose(&noise);
        initial.push(initial[k - 1].compose(&odometry));
        edges.push((k - 1, k, odometry));

        let cell = (cells[k].0 as i64, cells[k].1 as i64);
        match first_visit.get(&cell) {
            Some(&earlier) if earlier + 1 < k => {
                edges.push((earlier, k, truth[earlier].between(&truth[k])));
            }
            Some(_) => {}
            None => {
                first_visit.insert(cell, k);
            }
        }
    }
    GridWorld { initial, edges }
}

fn batch_graph(world: &GridWorld) -> PoseGraph<SE2> {
    let info = DMatrix::identity(3, 3);
    let mut graph = PoseGraph::new();
    for (id, pose) in world.initial.iter().enumerate() {
        let _ = graph.add_pose_vertex(id, pose.clone(), &info);
    }
    for (from, to, mean) in &world.edges {
        let _ = graph.add_pose_edge(*from, *to, mean.clone(), info.clone());
    }
    graph
}

fn ingest<O: GraphOptimizer<SE2>>(optimizer: &mut O, world: &GridWorld, update: usize) {
    let info = DMatrix::identity(3, 3);
    let _ = optimizer.add_vertex(0, SE2::identity(), &info);
    let mut pending = 0;
    for (from, to, mean) in &world.edges {
        if !optimizer.graph().contains_vertex(*to) {
            if pending >= update {
                let _ = optimizer.optimize(1, true);
                pending = 0;
            }
            let _ = optimizer.add_vertex(*to, SE2::identity(), &info);
            pending += 1;
        }
        let _ = optimizer.add_edge(*from, *to, mean.clone(), info.clone());
    }
    let _ = optimizer.optimize(1, true);
}

fn benchmark_batch_chol(c: &mut Criterion) {
    let mut group = c.benchmark_group("batch_chol");
    group.measurement_time(Duration::from_secs(10));
    group.sample_size(10);

    for size in [8usize, 16] {
        let world = grid_world(size, 42);
        group.bench_with_input(
            BenchmarkId::new("gauss_newton", format!("{size}x{size}")),
            &world,
            |b, world| {
                b.iter(|| {
                    let mut optimizer =
                        CholOptimizer::with_graph(batch_graph(world), CholConfig::default());
                    let _ = optimizer.optimize(5, false);
                    black_box(optimizer.chi2())
                });
            },
        );
    }

    group.finish();
}

fn benchmark_online_ingestion(c: &mut Criterion) {
    let mut group = c.benchmark_group("online_ingestion");
    group.measurement_time(Duration::from_secs(10));
    group.sample_size(10);

    for size in [8usize, 16] {
        let world = grid_world(size, 42);
        group.bench_with_input(
            BenchmarkId::new("hierarchical", format!("{size}x{size}")),
            &world,
            |b, world| {
                b.iter(|| {
                    let mut optimizer =
                        HierarchicalOptimizer::<SE2>::new(HierarchicalConfig::default());
                    ingest(&mut optimizer, world, 10);
                    black_box(optimizer.chi2())
                });
            },
        );
        group.bench_with_input(
            BenchmarkId::new("flat", format!("{size}x{size}")),
            &world,
            |b, world| {
                b.iter(|| {
                    let config = CholConfig::new().with_guess_on_edges(true);
                    let mut optimizer = CholOptimizer::<SE2>::new(config);
                    ingest(&mut optimizer, world, 10);
                    black_box(optimizer.chi2())
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, benchmark_batch_chol, benchmark_online_ingestion);
criterion_main!(benches);
