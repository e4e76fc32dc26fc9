//! Experimental conditions of a single run.

use serde::{Deserialize, Serialize};

/// Timepoints, parameters and constants of a run.
///
/// Parameters are given in the scale selected by
/// [`SimulationSettings::pscale`](crate::SimulationSettings).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conditions {
    /// Start time
    pub t0: f64,
    /// Output timepoints, non-decreasing and not before `t0`
    pub ts: Vec<f64>,
    /// Model parameters (scaled)
    pub p: Vec<f64>,
    /// Constants
    pub k: Vec<f64>,
    /// Indices of the parameters for which sensitivities are computed
    pub plist: Vec<usize>,
    /// Initial state overriding the model's initial state function
    #[serde(default)]
    pub x0: Option<Vec<f64>>,
    /// Initial sensitivities (nx * nplist, parameter-major) overriding the
    /// model's sensitivity seeding
    #[serde(default)]
    pub sx0: Option<Vec<f64>>,
}

impl Conditions {
    /// Conditions selecting sensitivities for all parameters
    pub fn new(ts: Vec<f64>, p: Vec<f64>) -> Self {
        let plist = (0..p.len()).collect();
        Self {
            t0: 0.0,
            ts,
            p,
            k: Vec::new(),
            plist,
            x0: None,
            sx0: None,
        }
    }

    pub fn with_constants(mut self, k: Vec<f64>) -> Self {
        self.k = k;
        self
    }

    pub fn with_plist(mut self, plist: Vec<usize>) -> Self {
        self.plist = plist;
        self
    }

    pub fn with_t0(mut self, t0: f64) -> Self {
        self.t0 = t0;
        self
    }

    pub fn nt(&self) -> usize {
        self.ts.len()
    }

    pub fn nplist(&self) -> usize {
        self.plist.len()
    }
}
