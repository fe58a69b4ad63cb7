use std::path::PathBuf;
use std::time::{Duration, Instant};

use clap::{Parser, ValueEnum};
use hog_solver::core::graph::VertexId;
use hog_solver::{HogResult, init_logger};
use hog_solver::io::{EdgeRecord, TextGraphLoader, TextGraphWriter, TextPose};
use hog_solver::manifold::{SE2, SE3};
use hog_solver::optimizer::{
    CholConfig, CholOptimizer, DampingMode, ErrorMode, GraphOptimizer, HierarchicalConfig,
    HierarchicalOptimizer, OptimizerError,
};
use nalgebra::DMatrix;
use tracing::{Level, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Strategy {
    /// Hierarchical Cholesky (HOG-Man)
    Hchol,
    /// Flat sparse Cholesky
    Chol,
}

#[derive(Parser)]
#[command(name = "hog_optimize")]
#[command(about = "Optimize 2D and 3D pose graphs, incrementally or in batch")]
struct Args {
    /// Graph file with VERTEX2/EDGE2 or VERTEX3/EDGE3 records
    input: PathBuf,

    /// Write the optimized graph to this file
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Iterations per optimize call
    #[arg(short, long, default_value = "10")]
    iterations: usize,

    #[arg(long, value_enum, default_value_t = Strategy::Hchol)]
    strategy: Strategy,

    /// Number of hierarchy levels, bottom included
    #[arg(long, default_value = "3")]
    levels: usize,

    /// Clustering radius in hops
    #[arg(long, default_value = "2.0")]
    max_distance: f64,

    /// Load the whole graph and optimize once instead of replaying it
    #[arg(long)]
    batch: bool,

    /// Optimize every N new vertices while replaying
    #[arg(long, default_value = "10")]
    update: usize,

    /// Seed the initial guess from the edges in batch mode
    #[arg(long)]
    guess: bool,

    /// Use Levenberg-Marquardt damping
    #[arg(long)]
    lm: bool,

    /// Use the linearized error instead of the manifold error
    #[arg(long)]
    linearized: bool,

    /// Pose dimension; detected from the file tags when omitted
    #[arg(long, value_parser = clap::value_parser!(u8).range(2..=3))]
    dimension: Option<u8>,

    /// Write the current graph here if a factorization fails
    #[arg(long)]
    failure_dump: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

struct ReplayStats {
    optimizations: usize,
    time: Duration,
}

fn main() -> HogResult<()> {
    let args = Args::parse();
    init_logger(if args.verbose { Level::DEBUG } else { Level::INFO });

    let dimension = match args.dimension {
        Some(dimension) => usize::from(dimension),
        None => TextGraphLoader::detect_dimension(&args.input)?,
    };

    info!("Optimizer started, parameter summary:");
    info!("  strategy     = {:?}", args.strategy);
    info!("  dimension    = {dimension}");
    info!("  iterations   = {}", args.iterations);
    info!("  update       = {}", args.update);
    info!("  incremental  = {}", !args.batch);
    info!("  guess        = {}", args.guess);
    info!("  damping      = {}", damping(&args));
    info!("  input        = {}", args.input.display());

    match dimension {
        3 => run::<SE3>(&args),
        _ => run::<SE2>(&args),
    }
}

fn damping(args: &Args) -> DampingMode {
    if args.lm {
        DampingMode::LevenbergMarquardt
    } else {
        DampingMode::GaussNewton
    }
}

fn chol_config(args: &Args) -> CholConfig {
    let mode = if args.linearized {
        ErrorMode::Linearized
    } else {
        ErrorMode::Manifold
    };
    CholConfig::new()
        .with_error_mode(mode)
        .with_damping(damping(args))
        .with_guess_on_edges(!args.batch || args.guess)
}

fn hierarchical_config(args: &Args) -> HierarchicalConfig {
    HierarchicalConfig::new()
        .with_levels(args.levels)
        .with_max_distance(args.max_distance)
        .with_chol(chol_config(args))
}

fn run<M: TextPose>(args: &Args) -> HogResult<()> {
    let file = TextGraphLoader::load::<M, _>(&args.input)?;
    info!(
        "Loaded {} vertices and {} edges",
        file.vertex_count(),
        file.edge_count()
    );

    let edges = if args.batch {
        Vec::new()
    } else {
        file.sorted_edges()
    };

    let mut optimizer: Box<dyn GraphOptimizer<M>> = if args.batch {
        if args.strategy == Strategy::Hchol {
            warn!("hierarchical batch mode is supported but slower than flat Cholesky");
        }
        let graph = file.into_graph()?;
        match args.strategy {
            Strategy::Hchol => Box::new(HierarchicalOptimizer::with_graph(
                graph,
                hierarchical_config(args),
            )),
            Strategy::Chol => Box::new(CholOptimizer::with_graph(graph, chol_config(args))),
        }
    } else {
        match args.strategy {
            Strategy::Hchol => Box::new(HierarchicalOptimizer::<M>::new(hierarchical_config(args))),
            Strategy::Chol => Box::new(CholOptimizer::<M>::new(chol_config(args))),
        }
    };

    let outcome = if args.batch {
        optimize_batch(optimizer.as_mut(), args.iterations)
    } else {
        replay(optimizer.as_mut(), &edges, args).map(|stats| {
            info!(
                "Replay finished: {} updates, cumulative time {:?}",
                stats.optimizations, stats.time
            );
        })
    };

    if let Err(err) = outcome {
        error!("optimization failed: {err}");
        if let (OptimizerError::Factorization(_), Some(path)) = (&err, &args.failure_dump) {
            TextGraphWriter::write(optimizer.graph(), path, false)?;
            error!("graph written to {}", path.display());
        }
        return Err(err.into());
    }

    println!(
        "nodes= {}\t edges= {}\t chi2= {:.6e}",
        optimizer.graph().vertex_count(),
        optimizer.graph().edge_count(),
        optimizer.chi2()
    );

    if let Some(path) = &args.output {
        TextGraphWriter::write(optimizer.graph(), path, false)?;
        info!("Optimized graph written to {}", path.display());
    }
    Ok(())
}

fn optimize_batch<M: TextPose>(
    optimizer: &mut dyn GraphOptimizer<M>,
    iterations: usize,
) -> Result<(), OptimizerError> {
    // Recompute the cached edge quantities from the loaded measurements
    let edges: Vec<_> = optimizer
        .graph()
        .edges()
        .map(|e| (e.id(), e.data.mean().clone(), e.data.information().clone()))
        .collect();
    for (id, mean, information) in edges {
        optimizer.refine_edge(id, mean, information)?;
    }

    let Some(root) = optimizer.graph().vertex_ids().next() else {
        warn!("empty graph, nothing to optimize");
        return Ok(());
    };
    if !optimizer.initialize(Some(root)) {
        return Err(OptimizerError::InvalidVertex(root));
    }
    info!("initial chi2 = {:.6e}", optimizer.chi2());
    let summary = optimizer.optimize(iterations, false)?;
    println!("{summary}");
    Ok(())
}

/// Feed the edges in discovery order, adding unknown vertices at the identity. Before an
/// edge that reaches past the highest known id, the optimizer runs if at least `update`
/// vertices arrived since the last run.
fn replay<M: TextPose>(
    optimizer: &mut dyn GraphOptimizer<M>,
    edges: &[EdgeRecord<M>],
    args: &Args,
) -> Result<ReplayStats, OptimizerError> {
    let unit = DMatrix::identity(M::DOF, M::DOF);
    let mut stats = ReplayStats {
        optimizations: 0,
        time: Duration::ZERO,
    };
    let mut max_id: Option<VertexId> = None;
    let mut pending = 0;
    let mut freshly_optimized = false;

    let mut k = 0;
    while k < edges.len() {
        let edge = &edges[k];
        let reaches_past = max_id.is_some_and(|max| max < edge.from.max(edge.to));
        if reaches_past && !freshly_optimized {
            if pending >= args.update {
                run_update(optimizer, &mut stats, args)?;
                pending = 0;
            }
            freshly_optimized = true;
            continue;
        }
        freshly_optimized = false;

        for id in [edge.from, edge.to] {
            if !optimizer.graph().contains_vertex(id) {
                optimizer.add_vertex(id, M::identity(), &unit)?;
                pending += 1;
                max_id = Some(max_id.map_or(id, |max| max.max(id)));
            }
        }
        optimizer.add_edge(edge.from, edge.to, edge.mean.clone(), edge.information.clone())?;
        k += 1;
    }

    if pending > 0 {
        run_update(optimizer, &mut stats, args)?;
    }
    Ok(stats)
}

fn run_update<M: TextPose>(
    optimizer: &mut dyn GraphOptimizer<M>,
    stats: &mut ReplayStats,
    args: &Args,
) -> Result<(), OptimizerError> {
    let start = Instant::now();
    let summary = optimizer.optimize(args.iterations, true)?;
    stats.time += start.elapsed();
    stats.optimizations += 1;
    if args.verbose {
        info!(
            "nodes= {}\t edges= {}\t chi2= {:.6e}\t time= {:?}\t cumTime= {:?}",
            summary.vertices, summary.edges, summary.final_chi2, summary.total_time, stats.time
        );
    }
    Ok(())
}
