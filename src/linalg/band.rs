use nalgebra::{DMatrix, DVector};

/// Square band matrix with `ubw` super- and `lbw` sub-diagonals.
///
/// Entry `(i, j)` is stored at `data[(ubw + i - j) + (ubw + lbw + 1) * j]`.
#[derive(Debug, Clone, PartialEq)]
pub struct BandMatrix {
    n: usize,
    ubw: usize,
    lbw: usize,
    data: Vec<f64>,
}

impl BandMatrix {
    pub fn zeros(n: usize, ubw: usize, lbw: usize) -> Self {
        Self {
            n,
            ubw,
            lbw,
            data: vec![0.0; (ubw + lbw + 1) * n],
        }
    }

    /// Band part of `dense`; entries outside the band are dropped
    pub fn from_dense(dense: &DMatrix<f64>, ubw: usize, lbw: usize) -> Self {
        let n = dense.nrows();
        let mut band = Self::zeros(n, ubw, lbw);
        for j in 0..n {
            for i in j.saturating_sub(ubw)..(j + lbw + 1).min(n) {
                let slot = band.slot(i, j);
                band.data[slot] = dense[(i, j)];
            }
        }
        band
    }

    pub fn n(&self) -> usize {
        self.n
    }

    pub fn bandwidths(&self) -> (usize, usize) {
        (self.ubw, self.lbw)
    }

    pub fn in_band(&self, i: usize, j: usize) -> bool {
        i < self.n && j < self.n && i + self.ubw >= j && j + self.lbw >= i
    }

    fn slot(&self, i: usize, j: usize) -> usize {
        (self.ubw + i - j) + (self.ubw + self.lbw + 1) * j
    }

    pub fn get(&self, i: usize, j: usize) -> f64 {
        if self.in_band(i, j) {
            self.data[self.slot(i, j)]
        } else {
            0.0
        }
    }

    /// Set an entry; returns `false` if `(i, j)` lies outside the band
    pub fn set(&mut self, i: usize, j: usize, value: f64) -> bool {
        if !self.in_band(i, j) {
            return false;
        }
        let slot = self.slot(i, j);
        self.data[slot] = value;
        true
    }

    pub fn to_dense(&self) -> DMatrix<f64> {
        DMatrix::from_fn(self.n, self.n, |i, j| self.get(i, j))
    }

    pub fn matvec(&self, x: &DVector<f64>) -> DVector<f64> {
        let mut out = DVector::zeros(self.n);
        for j in 0..self.n {
            for i in j.saturating_sub(self.ubw)..(j + self.lbw + 1).min(self.n) {
                out[i] += self.data[self.slot(i, j)] * x[j];
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tridiagonal_roundtrip() {
        let dense = DMatrix::from_row_slice(3, 3, &[2.0, -1.0, 7.0, -1.0, 2.0, -1.0, 0.0, -1.0, 2.0]);
        let band = BandMatrix::from_dense(&dense, 1, 1);
        assert_eq!(band.get(0, 2), 0.0);
        assert_eq!(band.get(1, 0), -1.0);
        for (i, j) in [(0, 0), (0, 1), (1, 1), (1, 2), (2, 1), (2, 2)] {
            assert_eq!(band.get(i, j), dense[(i, j)]);
        }
        let x = DVector::from_vec(vec![1.0, 1.0, 1.0]);
        assert_eq!(band.matvec(&x), DVector::from_vec(vec![1.0, 0.0, 1.0]));
        assert!(!band.clone().set(0, 2, 1.0));
    }
}
