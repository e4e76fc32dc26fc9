//! Variable-step BDF coefficients, local error estimates and step size
//! control.
//!
//! An order-m step interpolates the new value and the m previous ones by a
//! polynomial and requires its derivative at the new point to match `f`:
//!
//! ```text
//! x_n = beta * h_n * f(t_n, x_n) + sum(alpha_j * x_{n-1-j}; j=0,...,m-1)
//! ```
//!
//! The weights are the derivatives of the Lagrange basis at `t_n`, taken on
//! the actual (non-uniform) time grid.
//!
//! # References
//!
//! - Hairer, E., & Wanner, G. (1996). "Solving Ordinary Differential
//!   Equations II: Stiff and Differential-Algebraic Problems". Springer.
//! - Byrne, G. D., & Hindmarsh, A. C. (1975). "A Polyalgorithm for the
//!   Numerical Solution of Ordinary Differential Equations". ACM TOMS.

use nalgebra::DVector;

use crate::linalg::wrms_norm;
use crate::utils::constants::{
    SOL_BETA, SOL_SCALE_CONV_FAIL, SOL_SCALE_MAX, SOL_SCALE_MAX_HIGH_ORDER, SOL_SCALE_MIN, TOLERANCE,
};

/// Coefficients `(beta, alpha)` of an order-`order` step.
///
/// `timesteps` holds `[h_n, h_{n-1}, ...]` (most recent first, any common
/// sign); the order is capped by its length. `alpha[j]` weighs the value
/// `j + 1` points before the new one.
pub fn compute_bdf_coefficients(order: usize, timesteps: &[f64]) -> (f64, Vec<f64>) {
    let order = order.min(timesteps.len());
    if order <= 1 {
        return (1.0, vec![1.0]);
    }

    // interpolation nodes in units of h_n, the new point at 0
    let h = timesteps[0];
    let mut nodes = Vec::with_capacity(order + 1);
    let mut tau = 0.0;
    nodes.push(tau);
    for step in &timesteps[..order] {
        tau -= step / h;
        nodes.push(tau);
    }

    let weight_new: f64 = nodes[1..].iter().map(|node| -1.0 / node).sum();
    let alpha = (1..=order)
        .map(|j| {
            let numerator: f64 = (1..=order).filter(|&m| m != j).map(|m| -nodes[m]).product();
            let denominator: f64 = (0..=order).filter(|&m| m != j).map(|m| nodes[j] - nodes[m]).product();
            -numerator / (denominator * weight_new)
        })
        .collect();
    (1.0 / weight_new, alpha)
}

/// Local error estimate of an order-`order` step, `None` if the history is
/// too short.
///
/// `times[0]`/`values[0]` is the new point, the rest the accepted history,
/// newest first. Order 1 compares with the explicit Euler predictor built
/// from `slope`, the derivative at `values[1]`. Higher orders use the
/// divided difference over `order + 2` points, `order! h^(order+1) x[t_n, ...]`.
pub fn local_error_estimate(
    order: usize,
    times: &[f64],
    values: &[&DVector<f64>],
    slope: &DVector<f64>,
) -> Option<DVector<f64>> {
    if values.len() < 2 {
        return None;
    }
    let h = times.first()? - times.get(1)?;
    if order <= 1 {
        return Some(values[0] - (values[1] + slope * h));
    }

    let points = order + 2;
    if times.len() < points || values.len() < points {
        return None;
    }
    let mut table: Vec<DVector<f64>> = values[..points].iter().map(|v| (*v).clone()).collect();
    for level in 1..points {
        for i in 0..points - level {
            table[i] = (&table[i] - &table[i + 1]) / (times[i] - times[i + level]);
        }
    }
    let factorial: f64 = (1..=order).map(|k| k as f64).product();
    Some(&table[0] * (factorial * h.powi(order as i32 + 1)))
}

/// Limit a step size factor to the range allowed at `order`
pub fn clamp_factor(factor: f64, order: usize) -> f64 {
    let max = if order >= 3 { SOL_SCALE_MAX_HIGH_ORDER } else { SOL_SCALE_MAX };
    factor.clamp(SOL_SCALE_MIN, max)
}

/// Error test and step size proposal
#[derive(Debug, Clone, Copy)]
pub struct ErrorController {
    pub rtol: f64,
    pub atol: f64,
    beta: f64,
}

impl ErrorController {
    pub fn new(rtol: f64, atol: f64) -> Self {
        Self {
            rtol,
            atol,
            beta: SOL_BETA,
        }
    }

    /// Max norm of the truncation error `tr` scaled by `atol + rtol * |x|`
    pub fn error_norm(&self, tr: &[f64], x: &[f64]) -> f64 {
        tr.iter()
            .zip(x)
            .map(|(e, xi)| (e / (self.atol + self.rtol * xi.abs())).abs())
            .fold(0.0, f64::max)
    }

    /// Step size factor that would bring the error norm to the safety
    /// target. `exponent` is the order of the error estimate in `h`.
    pub fn factor(&self, error_norm: f64, exponent: usize) -> f64 {
        self.beta / error_norm.max(TOLERANCE).powf(1.0 / exponent as f64)
    }

    /// Clamped step size factor after a rejected or accepted step
    pub fn rescale(&self, error_norm: f64, exponent: usize, order: usize) -> f64 {
        clamp_factor(self.factor(error_norm, exponent), order)
    }
}

/// Step size and order bookkeeping of one integration direction.
///
/// Step sizes are magnitudes; the caller applies the direction.
#[derive(Debug, Clone)]
pub struct StepControl {
    /// Proposed size of the next step, zero if it has to be estimated
    pub h: f64,
    pub order: usize,
    max_order: usize,
    steps_at_order: usize,
    stldet: bool,
}

impl StepControl {
    pub fn new(max_order: usize, stldet: bool) -> Self {
        Self {
            h: 0.0,
            order: 1,
            max_order: max_order.clamp(1, 5),
            steps_at_order: 0,
            stldet,
        }
    }

    /// Forget the history after a discontinuity
    pub fn restart(&mut self) {
        self.h = 0.0;
        self.order = 1;
        self.steps_at_order = 0;
    }

    /// Order usable with `past` accepted points behind the current one.
    ///
    /// An order-m step needs m points for the formula and one more for its
    /// error estimate.
    pub fn usable_order(&self, past: usize) -> usize {
        self.order.min(past).max(1)
    }

    /// Step size towards a target `span` away and whether the step lands on it.
    ///
    /// A target slightly further than one step is reached in two equal steps.
    pub fn propose(&self, span: f64) -> (f64, bool) {
        if self.h >= span {
            (span, true)
        } else if self.h > 0.5 * span {
            (0.5 * span, false)
        } else {
            (self.h, false)
        }
    }

    /// Whether the next accepted step may change the order
    pub fn order_change_due(&self, order: usize) -> bool {
        self.steps_at_order + 1 > order
    }

    pub fn reject(&mut self, h: f64, rescale: f64, failures: usize, order: usize) {
        self.h = h * rescale;
        self.steps_at_order = 0;
        if failures >= 3 {
            self.order = 1;
        } else if self.stldet && order >= 3 && failures >= 2 {
            // repeated failures at high order are a sign of a stability limit
            self.order = 2;
        }
    }

    pub fn convergence_failure(&mut self, h: f64) {
        self.h = h * SOL_SCALE_CONV_FAIL;
    }

    /// Update after an accepted step of size `h` and order `order`.
    ///
    /// `lower`, `current` and `higher` are the unclamped step size factors
    /// the orders `order - 1`, `order` and `order + 1` would allow; the order
    /// with the largest factor is used for the next step.
    pub fn accept(
        &mut self,
        h: f64,
        clamped: bool,
        order: usize,
        lower: Option<f64>,
        current: f64,
        higher: Option<f64>,
    ) {
        let (mut next_order, mut factor) = (order, current);
        if let Some(lower) = lower.filter(|&f| order > 1 && f > factor) {
            next_order = order - 1;
            factor = lower;
        }
        if let Some(higher) = higher.filter(|&f| order < self.max_order && f > factor) {
            next_order = order + 1;
            factor = higher;
        }
        if next_order == order {
            self.steps_at_order += 1;
        } else {
            self.steps_at_order = 0;
        }
        self.order = next_order;
        let proposal = h * clamp_factor(factor, next_order);
        self.h = if clamped { proposal.max(self.h) } else { proposal };
    }
}

/// Initial step size from the scaled sizes of the state and its derivative
pub fn initial_step(x: &DVector<f64>, dx: &DVector<f64>, rtol: f64, atol: f64, span: f64) -> f64 {
    let d0 = wrms_norm(x, x, rtol, atol);
    let d1 = wrms_norm(dx, x, rtol, atol);
    let h0 = if d0 < 1e-5 || d1 < 1e-5 {
        1e-6 * span
    } else {
        0.01 * d0 / d1
    };
    h0.min(span)
}

/// Exponent of the error estimate of a step of order `order`
pub fn error_exponent(order: usize) -> usize {
    order.max(1) + 1
}

/// Cubic Hermite interpolation of `x` on `[t0, t1]`, returning value and
/// derivative at `t`
pub fn hermite(
    t: f64,
    (t0, x0, dx0): (f64, &DVector<f64>, &DVector<f64>),
    (t1, x1, dx1): (f64, &DVector<f64>, &DVector<f64>),
) -> (DVector<f64>, DVector<f64>) {
    let h = t1 - t0;
    if h == 0.0 {
        return (x1.clone(), dx1.clone());
    }
    let s = (t - t0) / h;
    let s2 = s * s;
    let s3 = s2 * s;
    let h00 = 2.0 * s3 - 3.0 * s2 + 1.0;
    let h10 = s3 - 2.0 * s2 + s;
    let h01 = -2.0 * s3 + 3.0 * s2;
    let h11 = s3 - s2;
    let value = x0 * h00 + dx0 * (h10 * h) + x1 * h01 + dx1 * (h11 * h);

    let d00 = (6.0 * s2 - 6.0 * s) / h;
    let d10 = 3.0 * s2 - 4.0 * s + 1.0;
    let d01 = (-6.0 * s2 + 6.0 * s) / h;
    let d11 = 3.0 * s2 - 2.0 * s;
    let derivative = x0 * d00 + dx0 * d10 + x1 * d01 + dx1 * d11;
    (value, derivative)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_bdf_coefficients_order_1() {
        let (beta, alpha) = compute_bdf_coefficients(1, &[1.0]);
        assert_relative_eq!(beta, 1.0, epsilon = 1e-7);
        assert_eq!(alpha.len(), 1);
        assert_relative_eq!(alpha[0], 1.0, epsilon = 1e-7);
    }

    #[test]
    fn test_bdf_coefficients_order_2() {
        let (beta, alpha) = compute_bdf_coefficients(2, &[1.0, 1.0]);
        assert_relative_eq!(beta, 2.0 / 3.0, epsilon = 1e-7);
        assert_eq!(alpha.len(), 2);
        assert_relative_eq!(alpha[0], 4.0 / 3.0, epsilon = 1e-7);
        assert_relative_eq!(alpha[1], -1.0 / 3.0, epsilon = 1e-7);
    }

    #[test]
    fn test_order_limited_by_history() {
        let (beta, alpha) = compute_bdf_coefficients(5, &[0.5, 0.5, 0.5]);
        assert_relative_eq!(beta, 6.0 / 11.0, epsilon = 1e-7);
        assert_eq!(alpha.len(), 3);
    }

    #[test]
    fn test_variable_step_coefficients_are_exact_for_quadratics() {
        // x(t) = t^2 with x_n at t = 0.5, history at 0.0 and -1.0
        let (beta, alpha) = compute_bdf_coefficients(2, &[0.5, 1.0]);
        let x_new = 0.25;
        let f_new = 1.0;
        let history = [0.0, 1.0];
        let predicted = beta * 0.5 * f_new + alpha[0] * history[0] + alpha[1] * history[1];
        assert_relative_eq!(predicted, x_new, epsilon = 1e-12);
    }

    #[test]
    fn test_rescale_is_clamped() {
        let controller = ErrorController::new(1e-6, 1e-8);
        assert_eq!(controller.rescale(0.0, 2, 1), SOL_SCALE_MAX);
        assert_eq!(controller.rescale(1e12, 2, 1), SOL_SCALE_MIN);
        assert_eq!(controller.rescale(0.0, 4, 4), SOL_SCALE_MAX_HIGH_ORDER);
    }

    #[test]
    fn test_backward_steps_give_same_coefficients() {
        let (beta, alpha) = compute_bdf_coefficients(3, &[0.2, 0.4, 0.4]);
        let (beta_b, alpha_b) = compute_bdf_coefficients(3, &[-0.2, -0.4, -0.4]);
        assert_relative_eq!(beta, beta_b, epsilon = 1e-14);
        for (a, b) in alpha.iter().zip(&alpha_b) {
            assert_relative_eq!(*a, *b, epsilon = 1e-12);
        }
        // consistency: the weights of a constant sum to one
        assert_relative_eq!(alpha.iter().sum::<f64>(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_local_error_of_exact_steps_vanishes() {
        // x' = 1 is integrated exactly at order 1
        let x0 = DVector::from_element(1, 1.0);
        let x1 = DVector::from_element(1, 1.5);
        let ones = DVector::from_element(1, 1.0);
        let tr = local_error_estimate(1, &[0.5, 0.0], &[&x1, &x0], &ones).unwrap();
        assert_relative_eq!(tr[0], 0.0, epsilon = 1e-14);

        // a quadratic has no third divided difference
        let times = [0.5, 0.0, -0.5, -1.5];
        let squares: Vec<DVector<f64>> = times.iter().map(|t| DVector::from_element(1, t * t)).collect();
        let values: Vec<&DVector<f64>> = squares.iter().collect();
        let tr = local_error_estimate(2, &times, &values, &ones).unwrap();
        assert_relative_eq!(tr[0], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_local_error_scales_with_leading_derivative() {
        // x = t^3 on a unit grid: x[t_n, ..., t_{n-3}] = 1, estimate = 2! h^3
        let times = [3.0, 2.0, 1.0, 0.0];
        let cubes: Vec<DVector<f64>> = times.iter().map(|t| DVector::from_element(1, t * t * t)).collect();
        let values: Vec<&DVector<f64>> = cubes.iter().collect();
        let slope = DVector::zeros(1);
        let tr = local_error_estimate(2, &times, &values, &slope).unwrap();
        assert_relative_eq!(tr[0], 2.0, epsilon = 1e-12);
        // order 3 needs five points
        assert!(local_error_estimate(3, &times, &values, &slope).is_none());
    }

    #[test]
    fn test_step_control_lands_on_target() {
        let mut control = StepControl::new(5, true);
        control.h = 0.4;
        assert_eq!(control.propose(0.3), (0.3, true));
        assert_eq!(control.propose(0.6), (0.3, false));
        assert_eq!(control.propose(2.0), (0.4, false));

        control.accept(0.4, false, 1, None, 1.5, None);
        assert_eq!(control.order, 1);
        assert_relative_eq!(control.h, 0.6);
        control.accept(0.6, false, 1, None, 1.5, Some(3.0));
        assert_eq!(control.order, 2);
        assert_relative_eq!(control.h, 1.2);
        control.reject(0.9, 0.5, 3, 2);
        assert_eq!(control.order, 1);
        assert_relative_eq!(control.h, 0.45);
    }

    #[test]
    fn test_order_follows_largest_factor() {
        let mut control = StepControl::new(3, false);
        control.order = 2;
        control.accept(1.0, false, 2, Some(1.1), 1.0, Some(0.9));
        assert_eq!(control.order, 1);
        control.order = 3;
        // no order above the maximum
        control.accept(1.0, false, 3, Some(0.5), 1.0, Some(5.0));
        assert_eq!(control.order, 3);
        assert_relative_eq!(control.h, 1.0);
        control.accept(1.0, false, 3, None, 4.0, None);
        assert_relative_eq!(control.h, SOL_SCALE_MAX_HIGH_ORDER);
    }

    #[test]
    fn test_hermite_reproduces_cubic() {
        let f = |t: f64| t * t * t - t;
        let df = |t: f64| 3.0 * t * t - 1.0;
        let x0 = DVector::from_element(1, f(1.0));
        let d0 = DVector::from_element(1, df(1.0));
        let x1 = DVector::from_element(1, f(2.0));
        let d1 = DVector::from_element(1, df(2.0));
        let (value, derivative) = hermite(1.3, (1.0, &x0, &d0), (2.0, &x1, &d1));
        assert_relative_eq!(value[0], f(1.3), epsilon = 1e-12);
        assert_relative_eq!(derivative[0], df(1.3), epsilon = 1e-12);
    }
}
