use faer::sparse::{SparseColMat, Triplet};
use nalgebra::{DMatrix, DVector};

use crate::error::LinalgError;

/// Compressed sparse column matrix with a fixed sparsity pattern.
///
/// The pattern is set at construction; model callbacks only write values.
#[derive(Debug, Clone, PartialEq)]
pub struct SparseMatrix {
    nrows: usize,
    ncols: usize,
    col_ptr: Vec<usize>,
    row_idx: Vec<usize>,
    values: Vec<f64>,
}

impl SparseMatrix {
    /// Zero-valued matrix with the given pattern
    pub fn new(
        nrows: usize,
        ncols: usize,
        col_ptr: Vec<usize>,
        row_idx: Vec<usize>,
    ) -> Result<Self, LinalgError> {
        let bad = |reason: &str| LinalgError::Factorization(format!("invalid CSC pattern: {reason}"));
        if col_ptr.len() != ncols + 1 || col_ptr[0] != 0 {
            return Err(bad("column pointer length"));
        }
        if col_ptr.windows(2).any(|w| w[0] > w[1]) {
            return Err(bad("column pointers must be non-decreasing"));
        }
        if col_ptr[ncols] != row_idx.len() {
            return Err(bad("last column pointer must equal the number of nonzeros"));
        }
        for col in 0..ncols {
            let rows = &row_idx[col_ptr[col]..col_ptr[col + 1]];
            if rows.iter().any(|&r| r >= nrows) || rows.windows(2).any(|w| w[0] >= w[1]) {
                return Err(bad("row indices must be in range and strictly increasing"));
            }
        }
        let nnz = row_idx.len();
        Ok(Self {
            nrows,
            ncols,
            col_ptr,
            row_idx,
            values: vec![0.0; nnz],
        })
    }

    /// Fully populated pattern of an `n x n` matrix
    pub fn dense_pattern(n: usize) -> Self {
        let col_ptr = (0..=n).map(|c| c * n).collect();
        let row_idx = (0..n).flat_map(|_| 0..n).collect();
        Self {
            nrows: n,
            ncols: n,
            col_ptr,
            row_idx,
            values: vec![0.0; n * n],
        }
    }

    /// Pattern of the nonzero entries of `dense`, with its values
    pub fn from_dense(dense: &DMatrix<f64>) -> Self {
        let (nrows, ncols) = dense.shape();
        let mut col_ptr = Vec::with_capacity(ncols + 1);
        let mut row_idx = Vec::new();
        let mut values = Vec::new();
        col_ptr.push(0);
        for col in 0..ncols {
            for row in 0..nrows {
                let v = dense[(row, col)];
                if v != 0.0 {
                    row_idx.push(row);
                    values.push(v);
                }
            }
            col_ptr.push(row_idx.len());
        }
        Self {
            nrows,
            ncols,
            col_ptr,
            row_idx,
            values,
        }
    }

    pub fn nrows(&self) -> usize {
        self.nrows
    }

    pub fn ncols(&self) -> usize {
        self.ncols
    }

    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    pub fn col_ptr(&self) -> &[usize] {
        &self.col_ptr
    }

    pub fn row_idx(&self) -> &[usize] {
        &self.row_idx
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut [f64] {
        &mut self.values
    }

    /// `(row, value)` of the stored entries of column `col`
    pub fn column_entries(&self, col: usize) -> impl Iterator<Item = (usize, f64)> + '_ {
        let range = if col < self.ncols {
            self.col_ptr[col]..self.col_ptr[col + 1]
        } else {
            0..0
        };
        self.row_idx[range.clone()].iter().copied().zip(self.values[range].iter().copied())
    }

    pub fn zero(&mut self) {
        self.values.iter_mut().for_each(|v| *v = 0.0);
    }

    fn position(&self, row: usize, col: usize) -> Option<usize> {
        if col >= self.ncols {
            return None;
        }
        let start = self.col_ptr[col];
        let rows = &self.row_idx[start..self.col_ptr[col + 1]];
        rows.binary_search(&row).ok().map(|i| start + i)
    }

    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.position(row, col).map_or(0.0, |i| self.values[i])
    }

    pub fn set(&mut self, row: usize, col: usize, value: f64) -> Result<(), LinalgError> {
        let i = self
            .position(row, col)
            .ok_or(LinalgError::NotInPattern { row, col })?;
        self.values[i] = value;
        Ok(())
    }

    /// Copy values of a dense matrix into the pattern, ignoring entries outside it
    pub fn assign_from_dense(&mut self, dense: &DMatrix<f64>) {
        for col in 0..self.ncols {
            for idx in self.col_ptr[col]..self.col_ptr[col + 1] {
                self.values[idx] = dense[(self.row_idx[idx], col)];
            }
        }
    }

    pub fn to_dense(&self) -> DMatrix<f64> {
        let mut out = DMatrix::zeros(self.nrows, self.ncols);
        for col in 0..self.ncols {
            for idx in self.col_ptr[col]..self.col_ptr[col + 1] {
                out[(self.row_idx[idx], col)] += self.values[idx];
            }
        }
        out
    }

    /// `A * x`
    pub fn matvec(&self, x: &DVector<f64>) -> DVector<f64> {
        let mut out = DVector::zeros(self.nrows);
        for col in 0..self.ncols {
            let xc = x[col];
            if xc == 0.0 {
                continue;
            }
            for idx in self.col_ptr[col]..self.col_ptr[col + 1] {
                out[self.row_idx[idx]] += self.values[idx] * xc;
            }
        }
        out
    }

    /// `Aᵀ * x`
    pub fn transpose_matvec(&self, x: &DVector<f64>) -> DVector<f64> {
        let mut out = DVector::zeros(self.ncols);
        for col in 0..self.ncols {
            out[col] = (self.col_ptr[col]..self.col_ptr[col + 1])
                .map(|idx| self.values[idx] * x[self.row_idx[idx]])
                .sum();
        }
        out
    }

    pub fn scale(&mut self, factor: f64) {
        self.values.iter_mut().for_each(|v| *v *= factor);
    }

    /// Largest absolute column sum
    pub fn norm1(&self) -> f64 {
        (0..self.ncols)
            .map(|col| {
                (self.col_ptr[col]..self.col_ptr[col + 1])
                    .map(|idx| self.values[idx].abs())
                    .sum::<f64>()
            })
            .fold(0.0, f64::max)
    }

    fn triplets(&self, transpose: bool) -> Vec<Triplet<usize, usize, f64>> {
        let mut triplets = Vec::with_capacity(self.nnz());
        for col in 0..self.ncols {
            for idx in self.col_ptr[col]..self.col_ptr[col + 1] {
                let row = self.row_idx[idx];
                let (r, c) = if transpose { (col, row) } else { (row, col) };
                triplets.push(Triplet::new(r, c, self.values[idx]));
            }
        }
        triplets
    }

    /// Convert into a faer matrix, optionally transposed
    pub fn to_faer(&self, transpose: bool) -> Result<SparseColMat<usize, f64>, LinalgError> {
        let (nrows, ncols) = if transpose {
            (self.ncols, self.nrows)
        } else {
            (self.nrows, self.ncols)
        };
        SparseColMat::try_new_from_triplets(nrows, ncols, &self.triplets(transpose))
            .map_err(|_| LinalgError::Factorization("failed to assemble sparse matrix".into()))
    }

    /// `M - gamma * A` for a diagonal `M`, with the diagonal added to the pattern
    pub fn shifted(&self, mass: &DVector<f64>, gamma: f64) -> SparseMatrix {
        let mut col_ptr = Vec::with_capacity(self.ncols + 1);
        let mut row_idx = Vec::with_capacity(self.nnz() + self.ncols);
        let mut values = Vec::with_capacity(self.nnz() + self.ncols);
        col_ptr.push(0);
        for col in 0..self.ncols {
            let mut diagonal_seen = false;
            for idx in self.col_ptr[col]..self.col_ptr[col + 1] {
                let row = self.row_idx[idx];
                if row > col && !diagonal_seen {
                    row_idx.push(col);
                    values.push(mass[col]);
                    diagonal_seen = true;
                }
                let mut v = -gamma * self.values[idx];
                if row == col {
                    v += mass[col];
                    diagonal_seen = true;
                }
                row_idx.push(row);
                values.push(v);
            }
            if !diagonal_seen && col < self.nrows {
                row_idx.push(col);
                values.push(mass[col]);
            }
            col_ptr.push(row_idx.len());
        }
        SparseMatrix {
            nrows: self.nrows,
            ncols: self.ncols,
            col_ptr,
            row_idx,
            values,
        }
    }
}
