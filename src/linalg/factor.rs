use std::fmt;

use faer::linalg::solvers::Solve;
use faer::sparse::linalg::solvers::Lu;
use faer::Mat;
use nalgebra::{DMatrix, DVector, Dyn, LU};

use super::SparseMatrix;
use crate::error::LinalgError;

/// Maximum number of sweeps of the 1-norm estimator
const CONDEST_MAX_ITERATIONS: usize = 5;

/// Sparse LU factorization of a square matrix.
///
/// Keeps the factorized matrix around so that condition estimates can be
/// computed on demand.
pub struct SparseLu {
    n: usize,
    matrix: SparseMatrix,
    lu: Lu<usize, f64>,
    lu_transpose: Option<Lu<usize, f64>>,
}

impl SparseLu {
    pub fn new(matrix: &SparseMatrix) -> Result<Self, LinalgError> {
        if matrix.nrows() != matrix.ncols() {
            return Err(LinalgError::Shape {
                expected: (matrix.nrows(), matrix.nrows()),
                actual: (matrix.nrows(), matrix.ncols()),
            });
        }
        let lu = Self::factorize(matrix, false)?;
        Ok(Self {
            n: matrix.nrows(),
            matrix: matrix.clone(),
            lu,
            lu_transpose: None,
        })
    }

    fn factorize(matrix: &SparseMatrix, transpose: bool) -> Result<Lu<usize, f64>, LinalgError> {
        let faer_matrix = matrix.to_faer(transpose)?;
        faer_matrix
            .as_ref()
            .sp_lu()
            .map_err(|e| LinalgError::Factorization(format!("{e:?}")))
    }

    fn solve_with(lu: &Lu<usize, f64>, rhs: &DVector<f64>) -> Result<DVector<f64>, LinalgError> {
        let b = Mat::from_fn(rhs.len(), 1, |i, _| rhs[i]);
        let out = lu.solve(b.as_ref());
        let x = DVector::from_fn(rhs.len(), |i, _| out[(i, 0)]);
        if x.iter().all(|v| v.is_finite()) {
            Ok(x)
        } else {
            Err(LinalgError::Singular)
        }
    }

    pub fn solve(&self, rhs: &DVector<f64>) -> Result<DVector<f64>, LinalgError> {
        Self::solve_with(&self.lu, rhs)
    }

    /// Solve `Aᵀ x = rhs`
    pub fn solve_transpose(&mut self, rhs: &DVector<f64>) -> Result<DVector<f64>, LinalgError> {
        if self.lu_transpose.is_none() {
            self.lu_transpose = Some(Self::factorize(&self.matrix, true)?);
        }
        match &self.lu_transpose {
            Some(lu) => Self::solve_with(lu, rhs),
            None => Err(LinalgError::Singular),
        }
    }

    /// Reciprocal pivot growth `min |u_ii| / max |u_ii|` of a partial
    /// pivoting LU; zero for an empty or zero matrix
    pub fn rcond(&self) -> f64 {
        if self.n == 0 {
            return 0.0;
        }
        let u = self.matrix.to_dense().lu().u();
        let (min, max) = u
            .diagonal()
            .iter()
            .fold((f64::INFINITY, 0.0_f64), |(min, max), d| (min.min(d.abs()), max.max(d.abs())));
        if max == 0.0 || !min.is_finite() {
            0.0
        } else {
            min / max
        }
    }

    /// 1-norm condition number estimate (Hager's method)
    pub fn condest(&mut self) -> f64 {
        let norm = self.matrix.norm1();
        if norm == 0.0 {
            return f64::INFINITY;
        }
        let n = self.n;
        let mut x = DVector::from_element(n, 1.0 / n as f64);
        let mut estimate = 0.0;
        for iteration in 0..CONDEST_MAX_ITERATIONS {
            let y = match self.solve(&x) {
                Ok(y) => y,
                Err(_) => return f64::INFINITY,
            };
            estimate = y.iter().map(|v| v.abs()).sum::<f64>();
            let xi = y.map(|v| if v >= 0.0 { 1.0 } else { -1.0 });
            let z = match self.solve_transpose(&xi) {
                Ok(z) => z,
                Err(_) => return f64::INFINITY,
            };
            let (jmax, zmax) = z
                .iter()
                .enumerate()
                .fold((0, 0.0), |(bj, bv), (j, v)| if v.abs() > bv { (j, v.abs()) } else { (bj, bv) });
            if iteration > 0 && zmax <= z.dot(&x) {
                break;
            }
            x = DVector::zeros(n);
            x[jmax] = 1.0;
        }
        norm * estimate
    }
}

impl fmt::Debug for SparseLu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SparseLu")
            .field("n", &self.n)
            .field("nnz", &self.matrix.nnz())
            .finish()
    }
}

/// A factorized iteration matrix
#[derive(Debug)]
pub enum Factorization {
    /// Dense LU, also used for band matrices
    Dense(LU<f64, Dyn, Dyn>),
    Sparse(SparseLu),
    /// Diagonal approximation
    Diagonal(DVector<f64>),
}

impl Factorization {
    pub fn dense(matrix: DMatrix<f64>) -> Result<Self, LinalgError> {
        let lu = matrix.lu();
        if !lu.is_invertible() {
            return Err(LinalgError::Singular);
        }
        Ok(Factorization::Dense(lu))
    }

    pub fn sparse(matrix: &SparseMatrix) -> Result<Self, LinalgError> {
        Ok(Factorization::Sparse(SparseLu::new(matrix)?))
    }

    pub fn diagonal(diagonal: DVector<f64>) -> Result<Self, LinalgError> {
        if diagonal.iter().any(|d| *d == 0.0 || !d.is_finite()) {
            return Err(LinalgError::Singular);
        }
        Ok(Factorization::Diagonal(diagonal))
    }

    pub fn solve(&self, rhs: &DVector<f64>) -> Result<DVector<f64>, LinalgError> {
        match self {
            Factorization::Dense(lu) => lu.solve(rhs).ok_or(LinalgError::Singular),
            Factorization::Sparse(lu) => lu.solve(rhs),
            Factorization::Diagonal(d) => Ok(rhs.component_div(d)),
        }
    }

    pub fn solve_in_place(&self, rhs: &mut DVector<f64>) -> Result<(), LinalgError> {
        let x = self.solve(rhs)?;
        rhs.copy_from(&x);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_sparse_solve_matches_dense() {
        let dense = DMatrix::from_row_slice(3, 3, &[4.0, 1.0, 0.0, 1.0, 3.0, 1.0, 0.0, 1.0, 2.0]);
        let rhs = DVector::from_vec(vec![1.0, 2.0, 3.0]);
        let sparse = Factorization::sparse(&SparseMatrix::from_dense(&dense)).unwrap();
        let reference = Factorization::dense(dense).unwrap();
        assert_relative_eq!(sparse.solve(&rhs).unwrap(), reference.solve(&rhs).unwrap(), epsilon = 1e-12);
    }

    #[test]
    fn test_condest_of_diagonal() {
        let dense = DMatrix::from_diagonal(&DVector::from_vec(vec![1.0, 1e-3, 10.0]));
        let mut lu = SparseLu::new(&SparseMatrix::from_dense(&dense)).unwrap();
        assert_relative_eq!(lu.condest(), 1e4, epsilon = 1e-6);
        assert!(lu.rcond() > 0.0);
    }

    #[test]
    fn test_rank_one_direction_is_not_missed() {
        // A e = 2 e is well resolved, the ill-conditioning sits in (1, -1)
        let dense = DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 1.0, 1.0 + 1e-14]);
        let mut lu = SparseLu::new(&SparseMatrix::from_dense(&dense)).unwrap();
        assert!(lu.rcond() < 1e-12);
        assert!(lu.condest() > 1e13);

        let identity = DMatrix::<f64>::identity(3, 3);
        let lu = SparseLu::new(&SparseMatrix::from_dense(&identity)).unwrap();
        assert_relative_eq!(lu.rcond(), 1.0);
    }

    #[test]
    fn test_transpose_solve() {
        let dense = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 0.0, 1.0]);
        let mut lu = SparseLu::new(&SparseMatrix::from_dense(&dense)).unwrap();
        let x = lu.solve_transpose(&DVector::from_vec(vec![1.0, 4.0])).unwrap();
        assert_relative_eq!(dense.transpose() * x, DVector::from_vec(vec![1.0, 4.0]), epsilon = 1e-12);
    }

    #[test]
    fn test_singular_dense_rejected() {
        assert!(Factorization::dense(DMatrix::zeros(2, 2)).is_err());
        assert!(Factorization::diagonal(DVector::from_vec(vec![1.0, 0.0])).is_err());
    }
}
