//! Text graph files written by the writer are read back unchanged by the loader.

#![allow(clippy::unwrap_used)]

mod common;

use common::SquareLaps;
use hog_solver::core::pose_graph::PoseGraph;
use hog_solver::io::{IoError, TextGraphLoader, TextGraphWriter};
use hog_solver::manifold::{PoseManifold, SE2, SE3};
use hog_solver::optimizer::{CholConfig, CholOptimizer, GraphOptimizer};
use nalgebra::DMatrix;
use std::io::Write;
use tempfile::NamedTempFile;

#[test]
fn test_planar_graph_roundtrip() -> Result<(), IoError> {
    let data = SquareLaps::generate(2, 3, 0.05, 17);
    let graph = data.odometry_graph();

    let file = NamedTempFile::new()?;
    TextGraphWriter::write(&graph, file.path(), false)?;
    let loaded = TextGraphLoader::load::<SE2, _>(file.path())?;

    assert_eq!(loaded.vertex_count(), graph.vertex_count());
    assert_eq!(loaded.edge_count(), graph.edge_count());
    for record in &loaded.vertices {
        let original = graph.pose(record.id).unwrap();
        assert!(original.between(&record.pose).to_vector().norm() < 1e-12);
    }

    let reloaded = loaded.into_graph().unwrap();
    assert!((reloaded.total_chi2() - graph.total_chi2()).abs() < 1e-9);
    Ok(())
}

#[test]
fn test_spatial_graph_roundtrip() -> Result<(), IoError> {
    let mut graph = PoseGraph::<SE3>::new();
    let info = DMatrix::identity(6, 6);
    let poses = [
        SE3::identity(),
        SE3::from_translation_euler(1.0, 0.5, -0.2, 0.1, 0.2, -0.3),
        SE3::from_translation_euler(2.0, 1.0, 0.3, -0.4, 0.1, 1.2),
    ];
    for (id, pose) in poses.iter().enumerate() {
        graph.add_pose_vertex(id, pose.clone(), &info).unwrap();
    }
    let mut edge_info = DMatrix::identity(6, 6) * 4.0;
    edge_info[(0, 3)] = 0.5;
    edge_info[(3, 0)] = 0.5;
    graph
        .add_pose_edge(0, 1, poses[0].between(&poses[1]), edge_info.clone())
        .unwrap();
    graph
        .add_pose_edge(2, 0, poses[2].between(&poses[0]), info.clone())
        .unwrap();

    let file = NamedTempFile::new()?;
    TextGraphWriter::write(&graph, file.path(), false)?;
    let loaded = TextGraphLoader::load::<SE3, _>(file.path())?;

    for (record, pose) in loaded.vertices.iter().zip(&poses) {
        assert!(pose.between(&record.pose).to_vector().norm() < 1e-9);
    }
    let sequential = &loaded.edges[0];
    assert_eq!((sequential.from, sequential.to), (0, 1));
    assert!((&sequential.information - &edge_info).amax() < 1e-12);

    // The loop edge is stated from the lower id on disk
    let closure = &loaded.edges[1];
    assert_eq!((closure.from, closure.to), (0, 2));
    assert!(poses[0].between(&poses[2]).between(&closure.mean).to_vector().norm() < 1e-9);
    Ok(())
}

#[test]
fn test_optimized_graph_survives_roundtrip() -> Result<(), IoError> {
    let data = SquareLaps::generate(2, 4, 0.05, 2);
    let mut optimizer = CholOptimizer::with_graph(data.odometry_graph(), CholConfig::default());
    optimizer.optimize(10, false).unwrap();
    let chi2 = optimizer.chi2();

    let file = NamedTempFile::new()?;
    TextGraphWriter::write(optimizer.graph(), file.path(), false)?;
    let reloaded = TextGraphLoader::load::<SE2, _>(file.path())?
        .into_graph()
        .unwrap();
    assert!((reloaded.total_chi2() - chi2).abs() < 1e-9 * chi2.max(1.0));
    Ok(())
}

#[test]
fn test_sorted_edges_replay_order() -> Result<(), IoError> {
    let mut file = NamedTempFile::new()?;
    writeln!(file, "VERTEX2 0 0 0 0")?;
    writeln!(file, "VERTEX2 1 1 0 0")?;
    writeln!(file, "VERTEX2 2 2 0 0")?;
    writeln!(file, "EDGE2 2 0 -2 0 0 1 0 1 1 0 0")?;
    writeln!(file, "EDGE2 1 2 1 0 0 1 0 1 1 0 0")?;
    writeln!(file, "EDGE2 0 1 1 0 0 1 0 1 1 0 0")?;

    let loaded = TextGraphLoader::load::<SE2, _>(file.path())?;
    let order: Vec<_> = loaded.sorted_edges().iter().map(|e| (e.from, e.to)).collect();
    assert_eq!(order, vec![(0, 1), (0, 2), (1, 2)]);
    assert!((loaded.sorted_edges()[1].mean.x() - 2.0).abs() < 1e-12);
    Ok(())
}
