use nalgebra::{DMatrix, DVector};

use crate::error::Result;
use crate::utils::constants::FD_RELATIVE_STEP;

pub(crate) fn step_size(value: f64) -> f64 {
    FD_RELATIVE_STEP * value.abs().max(1.0)
}

/// Central difference Jacobian of `f` at `x`
pub(crate) fn jacobian<F>(n_out: usize, x: &[f64], mut f: F) -> Result<DMatrix<f64>>
where
    F: FnMut(&[f64]) -> Result<DVector<f64>>,
{
    let mut jac = DMatrix::zeros(n_out, x.len());
    let mut xp = x.to_vec();
    for j in 0..x.len() {
        let column = derivative(x[j], |v| {
            xp[j] = v;
            f(&xp)
        })?;
        xp[j] = x[j];
        jac.set_column(j, &column);
    }
    Ok(jac)
}

/// Central difference derivative of the vector function `f` at the scalar `v`
pub(crate) fn derivative<F>(v: f64, mut f: F) -> Result<DVector<f64>>
where
    F: FnMut(f64) -> Result<DVector<f64>>,
{
    let step = step_size(v);
    let plus = f(v + step)?;
    let minus = f(v - step)?;
    Ok((plus - minus) / (2.0 * step))
}
