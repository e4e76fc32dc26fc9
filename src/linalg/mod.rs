//! Numeric containers and factorizations.
//!
//! Dense vectors and matrices come from `nalgebra`. This module adds the
//! pieces the simulator needs on top of it:
//! - [`NamedArray`]: multi-dimensional result arrays with named axes
//! - [`SparseMatrix`]: compressed sparse column matrices with a fixed pattern
//! - [`BandMatrix`]: banded storage for narrow Jacobians
//! - [`Factorization`]: LU factorizations behind one solve interface

mod array;
mod band;
mod factor;
mod sparse;

pub use array::*;
pub use band::*;
pub use factor::*;
pub use sparse::*;

use nalgebra::DVector;

/// Weighted root-mean-square norm with weights `1 / (rtol * |x| + atol)`
pub fn wrms_norm(v: &DVector<f64>, x: &DVector<f64>, rtol: f64, atol: f64) -> f64 {
    if v.is_empty() {
        return 0.0;
    }
    let sum: f64 = v
        .iter()
        .zip(x.iter())
        .map(|(vi, xi)| {
            let w = vi / (rtol * xi.abs() + atol);
            w * w
        })
        .sum();
    (sum / v.len() as f64).sqrt()
}

/// Sum of absolute values
pub fn norm1(v: &DVector<f64>) -> f64 {
    v.iter().map(|x| x.abs()).sum()
}
