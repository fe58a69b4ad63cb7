//! Hierarchical pose-graph optimization for 2D and 3D SLAM back ends.
//!
//! [`CholOptimizer`] solves a pose graph with sparse Cholesky Gauss-Newton or
//! Levenberg-Marquardt steps. [`HierarchicalOptimizer`] keeps a stack of coarser graphs on
//! top of it and refines only the part of the map that changed.

pub mod core;
pub mod error;
pub mod io;
pub mod linalg;
pub mod logger;
pub mod manifold;
pub mod optimizer;

pub use error::{HogError, HogResult};
pub use io::{GraphFile, IoError, TextGraphLoader, TextGraphWriter, TextPose};
pub use logger::init_logger;
pub use manifold::{PoseManifold, SE2, SE3};
pub use optimizer::{
    CholConfig, CholOptimizer, DampingMode, ErrorMode, GraphOptimizer, HierarchicalConfig,
    HierarchicalOptimizer, OptimizationSummary, OptimizerError,
};
