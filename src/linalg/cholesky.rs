use faer::Side;
use faer::linalg::solvers::Solve;
use faer::sparse::linalg::solvers::{Llt, SymbolicLlt};
use nalgebra::DMatrix;

use super::{FaerMatrix, LinAlgError, LinAlgResult, SparseMatrix};

/// Sparse LLᵀ solver with a cached symbolic factorization.
///
/// The symbolic analysis is computed on the first factorization after [`reset`] and
/// reused as long as the matrix dimension and non-zero count are unchanged.
///
/// [`reset`]: SparseCholeskySolver::reset
#[derive(Default)]
pub struct SparseCholeskySolver {
    symbolic_pattern: Option<SymbolicLlt<usize>>,
    pattern_shape: Option<(usize, usize)>,
    factor: Option<Llt<usize, f64>>,
}

impl std::fmt::Debug for SparseCholeskySolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SparseCholeskySolver")
            .field("pattern_shape", &self.pattern_shape)
            .field("factorized", &self.factor.is_some())
            .finish()
    }
}

impl SparseCholeskySolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop the cached symbolic analysis and the numeric factor.
    pub fn reset(&mut self) {
        self.symbolic_pattern = None;
        self.pattern_shape = None;
        self.factor = None;
    }

    pub fn has_symbolic(&self) -> bool {
        self.symbolic_pattern.is_some()
    }

    /// Numeric factorization of `matrix`, reusing the symbolic analysis when possible.
    pub fn factorize(&mut self, matrix: &SparseMatrix) -> LinAlgResult<()> {
        self.factor = None;
        let shape = (matrix.nrows(), matrix.symbolic().compute_nnz());
        if self.pattern_shape != Some(shape) {
            self.symbolic_pattern = None;
        }

        let symbolic = match &self.symbolic_pattern {
            Some(symbolic) => symbolic.clone(),
            None => {
                let symbolic = SymbolicLlt::try_new(matrix.symbolic(), Side::Lower)
                    .map_err(|e| LinAlgError::FactorizationFailed(format!("{e:?}")))?;
                self.symbolic_pattern = Some(symbolic.clone());
                self.pattern_shape = Some(shape);
                symbolic
            }
        };

        let llt = Llt::try_new_with_symbolic(symbolic, matrix.as_ref(), Side::Lower)
            .map_err(|e| LinAlgError::FactorizationFailed(format!("{e:?}")))?;
        self.factor = Some(llt);
        Ok(())
    }

    /// Solve with the current factor.
    pub fn solve(&self, rhs: &FaerMatrix) -> LinAlgResult<FaerMatrix> {
        let factor = self.factor.as_ref().ok_or(LinAlgError::NotFactorized)?;
        Ok(factor.solve(rhs.as_ref()))
    }

    /// The `block_size x block_size` diagonal block of the inverse matrix at `block_index`.
    pub fn inverse_block(&self, block_index: usize, block_size: usize) -> LinAlgResult<DMatrix<f64>> {
        let factor = self.factor.as_ref().ok_or(LinAlgError::NotFactorized)?;
        let n = self.pattern_shape.map_or(0, |(n, _)| n);
        let base = block_index * block_size;
        if base + block_size > n {
            return Err(LinAlgError::InvalidInput(format!(
                "block {block_index} of size {block_size} exceeds dimension {n}"
            )));
        }
        let unit_columns =
            FaerMatrix::from_fn(n, block_size, |i, j| if i == base + j { 1.0 } else { 0.0 });
        let columns = factor.solve(unit_columns.as_ref());
        Ok(DMatrix::from_fn(block_size, block_size, |r, c| {
            columns[(base + r, c)]
        }))
    }
}
