//! Sparse solve adapter.
//!
//! The optimizers accumulate their normal equations per vertex block in a
//! [`BlockSystem`], convert it into a symmetric `faer` sparse matrix and hand it to
//! [`SparseCholeskySolver`], which caches the symbolic factorization while the sparsity
//! pattern stays the same.

use faer::sparse::{SparseColMat, Triplet};
use nalgebra::{DMatrix, DVector};
use std::collections::BTreeMap;
use thiserror::Error;

pub mod cholesky;

pub use cholesky::SparseCholeskySolver;

/// Type alias for sparse matrices using faer
pub type SparseMatrix = SparseColMat<usize, f64>;

/// Type alias for faer matrices (used for vectors)
pub type FaerMatrix = faer::Mat<f64>;

/// Linear algebra specific error types
#[derive(Debug, Clone, Error)]
pub enum LinAlgError {
    /// Numeric or symbolic Cholesky factorization failed
    #[error("Matrix factorization failed: {0}")]
    FactorizationFailed(String),

    /// A solve was requested before a successful factorization
    #[error("Solver is not factorized")]
    NotFactorized,

    /// Sparse matrix creation from triplets failed
    #[error("Sparse matrix creation failed: {0}")]
    SparseMatrixCreation(String),

    /// Invalid input provided to linear solver
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Result type for linear algebra operations
pub type LinAlgResult<T> = Result<T, LinAlgError>;

/// Block-structured symmetric normal equations `H Δx = b`.
///
/// Diagonal blocks are indexed by the dense vertex index; off-diagonal blocks are keyed
/// by `(row, col)` with `row < col` and mirrored when the sparse matrix is assembled.
#[derive(Debug, Clone)]
pub struct BlockSystem {
    block_size: usize,
    diagonal: Vec<DMatrix<f64>>,
    off_diagonal: BTreeMap<(usize, usize), DMatrix<f64>>,
    rhs: Vec<DVector<f64>>,
}

impl BlockSystem {
    pub fn new(block_size: usize, num_blocks: usize) -> Self {
        let mut system = Self {
            block_size,
            diagonal: Vec::new(),
            off_diagonal: BTreeMap::new(),
            rhs: Vec::new(),
        };
        system.reset(num_blocks);
        system
    }

    /// Zero every block and resize to `num_blocks`.
    pub fn reset(&mut self, num_blocks: usize) {
        let d = self.block_size;
        self.diagonal.clear();
        self.diagonal.resize(num_blocks, DMatrix::zeros(d, d));
        self.rhs.clear();
        self.rhs.resize(num_blocks, DVector::zeros(d));
        self.off_diagonal.clear();
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn num_blocks(&self) -> usize {
        self.diagonal.len()
    }

    pub fn dimension(&self) -> usize {
        self.block_size * self.diagonal.len()
    }

    pub fn add_diagonal(&mut self, index: usize, block: &DMatrix<f64>) {
        self.diagonal[index] += block;
    }

    /// Accumulate `H[row, col]`; the transposed block is implied.
    pub fn add_off_diagonal(&mut self, row: usize, col: usize, block: &DMatrix<f64>) {
        let d = self.block_size;
        if row < col {
            *self
                .off_diagonal
                .entry((row, col))
                .or_insert_with(|| DMatrix::zeros(d, d)) += block;
        } else {
            *self
                .off_diagonal
                .entry((col, row))
                .or_insert_with(|| DMatrix::zeros(d, d)) += block.transpose();
        }
    }

    pub fn add_rhs(&mut self, index: usize, block: &DVector<f64>) {
        self.rhs[index] += block;
    }

    /// Add `mu` to every diagonal entry.
    pub fn add_to_diagonal(&mut self, mu: f64) {
        for block in &mut self.diagonal {
            for k in 0..self.block_size {
                block[(k, k)] += mu;
            }
        }
    }

    pub fn diagonal_block(&self, index: usize) -> &DMatrix<f64> {
        &self.diagonal[index]
    }

    pub fn rhs_block(&self, index: usize) -> &DVector<f64> {
        &self.rhs[index]
    }

    /// Number of stored off-diagonal blocks.
    pub fn off_diagonal_count(&self) -> usize {
        self.off_diagonal.len()
    }

    /// Full symmetric sparse matrix.
    pub fn to_sparse(&self) -> LinAlgResult<SparseMatrix> {
        let d = self.block_size;
        let n = self.dimension();
        let mut triplets =
            Vec::with_capacity(d * d * (self.diagonal.len() + 2 * self.off_diagonal.len()));

        for (index, block) in self.diagonal.iter().enumerate() {
            let base = index * d;
            for r in 0..d {
                for c in 0..d {
                    triplets.push(Triplet::new(base + r, base + c, block[(r, c)]));
                }
            }
        }
        for (&(row, col), block) in &self.off_diagonal {
            let (row_base, col_base) = (row * d, col * d);
            for r in 0..d {
                for c in 0..d {
                    let value = block[(r, c)];
                    triplets.push(Triplet::new(row_base + r, col_base + c, value));
                    triplets.push(Triplet::new(col_base + c, row_base + r, value));
                }
            }
        }

        SparseColMat::try_new_from_triplets(n, n, &triplets)
            .map_err(|e| LinAlgError::SparseMatrixCreation(format!("{e:?}")))
    }

    /// Right-hand side as a single column.
    pub fn rhs_matrix(&self) -> FaerMatrix {
        let d = self.block_size;
        FaerMatrix::from_fn(self.dimension(), 1, |i, _| self.rhs[i / d][i % d])
    }

    /// Dense copy of the system matrix.
    pub fn to_dense(&self) -> DMatrix<f64> {
        let d = self.block_size;
        let mut dense = DMatrix::zeros(self.dimension(), self.dimension());
        for (index, block) in self.diagonal.iter().enumerate() {
            dense.view_mut((index * d, index * d), (d, d)).copy_from(block);
        }
        for (&(row, col), block) in &self.off_diagonal {
            dense.view_mut((row * d, col * d), (d, d)).copy_from(block);
            dense
                .view_mut((col * d, row * d), (d, d))
                .copy_from(&block.transpose());
        }
        dense
    }
}

/// Split a solution column into per-block vectors.
pub fn split_solution(solution: &FaerMatrix, block_size: usize) -> Vec<DVector<f64>> {
    let blocks = solution.nrows() / block_size;
    (0..blocks)
        .map(|b| DVector::from_fn(block_size, |k, _| solution[(b * block_size + k, 0)]))
        .collect()
}
