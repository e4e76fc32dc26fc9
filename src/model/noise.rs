//! Gaussian noise model used when a model supplies no objective callbacks.
//!
//! The negative log-likelihood of a measurement `m` of a simulated value `y`
//! with standard deviation `sigma` is
//!
//! ```text
//! J = 0.5 * ln(2 * pi * sigma^2) + 0.5 * ((y - m) / sigma)^2
//! ```

use std::f64::consts::PI;

/// Negative log-likelihood of a single measurement
pub fn gaussian_nllh(y: f64, sigma: f64, m: f64) -> f64 {
    let r = (y - m) / sigma;
    0.5 * (2.0 * PI * sigma * sigma).ln() + 0.5 * r * r
}

/// Derivative of [`gaussian_nllh`] w.r.t. the simulated value
pub fn gaussian_nllh_dy(y: f64, sigma: f64, m: f64) -> f64 {
    (y - m) / (sigma * sigma)
}

/// Derivative of [`gaussian_nllh`] w.r.t. the standard deviation
pub fn gaussian_nllh_dsigma(y: f64, sigma: f64, m: f64) -> f64 {
    let r = y - m;
    1.0 / sigma - r * r / (sigma * sigma * sigma)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_derivatives_match_finite_differences() {
        let (y, sigma, m) = (1.3, 0.7, 0.9);
        let eps = 1e-6;
        let dy = (gaussian_nllh(y + eps, sigma, m) - gaussian_nllh(y - eps, sigma, m)) / (2.0 * eps);
        let ds = (gaussian_nllh(y, sigma + eps, m) - gaussian_nllh(y, sigma - eps, m)) / (2.0 * eps);
        assert_relative_eq!(gaussian_nllh_dy(y, sigma, m), dy, epsilon = 1e-8);
        assert_relative_eq!(gaussian_nllh_dsigma(y, sigma, m), ds, epsilon = 1e-8);
    }

    #[test]
    fn test_minimum_at_measurement() {
        let sigma: f64 = 2.0;
        assert_relative_eq!(gaussian_nllh(3.0, sigma, 3.0), 0.5 * (2.0 * PI * 4.0).ln());
        assert_eq!(gaussian_nllh_dy(3.0, sigma, 3.0), 0.0);
    }
}
