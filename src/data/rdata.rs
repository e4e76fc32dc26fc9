use sensim_types::{ModelDimensions, SensitivityOrder, SimulationSettings};

use super::Warning;
use crate::linalg::NamedArray;
use crate::solvers::SolverCounters;

/// Per-timepoint solver diagnostics; counters are cumulative
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostics {
    pub numsteps: Vec<usize>,
    pub numrhsevals: Vec<usize>,
    pub numerrtestfails: Vec<usize>,
    pub numnonlinsolvconvfails: Vec<usize>,
    /// Order of the last step
    pub order: Vec<usize>,
}

impl Diagnostics {
    pub fn new(nt: usize) -> Self {
        Self {
            numsteps: vec![0; nt],
            numrhsevals: vec![0; nt],
            numerrtestfails: vec![0; nt],
            numnonlinsolvconvfails: vec![0; nt],
            order: vec![0; nt],
        }
    }

    pub fn record(&mut self, it: usize, counters: &SolverCounters) {
        self.numsteps[it] = counters.steps;
        self.numrhsevals[it] = counters.rhs_evals;
        self.numerrtestfails[it] = counters.error_test_failures;
        self.numnonlinsolvconvfails[it] = counters.convergence_failures;
        self.order[it] = counters.order;
    }
}

/// How the steady state was reached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SteadyStateMethod {
    Newton,
    /// Time integration alone reached the steady state
    Simulation,
    /// Newton converged after a stretch of time integration
    NewtonAfterSimulation,
}

/// Outcome of preequilibration
#[derive(Debug, Clone, PartialEq)]
pub struct SteadyStateInfo {
    pub method: SteadyStateMethod,
    /// Total number of Newton steps over all attempts
    pub newton_steps: usize,
    /// Time integrated in the simulation fallback
    pub simulation_time: f64,
    /// Weighted RMS norm of the right-hand side at the steady state
    pub wrms: f64,
    pub x: Vec<f64>,
}

/// Results of a run.
///
/// Per-timepoint arrays have time as the fastest axis, event arrays the
/// event occurrence. Values that were never computed stay `NaN`.
/// Sensitivity arrays have a parameter axis of length zero when the run did
/// not compute them.
#[derive(Debug, Clone)]
pub struct ReturnData {
    pub ts: Vec<f64>,

    pub x: NamedArray<2>,
    pub sx: NamedArray<3>,
    pub y: NamedArray<2>,
    pub sigmay: NamedArray<2>,
    pub sy: NamedArray<3>,
    pub ssigmay: NamedArray<3>,

    pub z: NamedArray<2>,
    pub sigmaz: NamedArray<2>,
    pub rz: NamedArray<2>,
    pub sz: NamedArray<3>,
    pub ssigmaz: NamedArray<3>,
    pub srz: NamedArray<3>,

    /// Log-likelihood, `NaN` without experimental data
    pub llh: f64,
    pub sllh: Vec<f64>,
    /// Second-order gradient, `[objective, parameter]`
    pub s2llh: NamedArray<2>,

    /// Right-hand side at the final timepoint
    pub xdot: Vec<f64>,
    /// Jacobian at the final timepoint
    pub jacobian: NamedArray<2>,

    /// Recorded occurrences per event
    pub nroots: Vec<usize>,
    pub diagnostics: Diagnostics,
    pub diagnostics_b: Diagnostics,
    pub steady_state: Option<SteadyStateInfo>,
    pub warnings: Vec<Warning>,
}

impl ReturnData {
    pub fn new(
        dims: &ModelDimensions,
        ts: &[f64],
        nplist: usize,
        settings: &SimulationSettings,
        has_data: bool,
    ) -> Self {
        let nt = ts.len();
        let nan = f64::NAN;
        let sensitivities = settings.computes_sensitivities();
        let state_sensitivities =
            settings.is_forward() || (sensitivities && settings.sensi == SensitivityOrder::Second);
        let ns = if state_sensitivities { nplist } else { 0 };
        let nsigma = if sensitivities { nplist } else { 0 };
        let gradient = if has_data && sensitivities { 0.0 } else { nan };
        let nj2 = if settings.sensi == SensitivityOrder::Second {
            dims.nj.saturating_sub(1)
        } else {
            0
        };

        Self {
            ts: ts.to_vec(),
            x: NamedArray::filled(["time", "state"], [nt, dims.nx], nan),
            sx: NamedArray::filled(["time", "state", "parameter"], [nt, dims.nx, ns], nan),
            y: NamedArray::filled(["time", "observable"], [nt, dims.ny], nan),
            sigmay: NamedArray::filled(["time", "observable"], [nt, dims.ny], nan),
            sy: NamedArray::filled(["time", "observable", "parameter"], [nt, dims.ny, ns], nan),
            ssigmay: NamedArray::filled(["time", "observable", "parameter"], [nt, dims.ny, nsigma], nan),
            z: NamedArray::filled(["event", "eventobs"], [dims.nmaxevent, dims.nz], nan),
            sigmaz: NamedArray::filled(["event", "eventobs"], [dims.nmaxevent, dims.nz], nan),
            rz: NamedArray::filled(["event", "eventobs"], [dims.nmaxevent, dims.nz], nan),
            sz: NamedArray::filled(["event", "eventobs", "parameter"], [dims.nmaxevent, dims.nz, ns], nan),
            ssigmaz: NamedArray::filled(
                ["event", "eventobs", "parameter"],
                [dims.nmaxevent, dims.nz, nsigma],
                nan,
            ),
            srz: NamedArray::filled(["event", "eventobs", "parameter"], [dims.nmaxevent, dims.nz, ns], nan),
            llh: if has_data { 0.0 } else { nan },
            sllh: vec![gradient; if sensitivities { nplist } else { 0 }],
            s2llh: NamedArray::filled(["objective", "parameter"], [nj2, nplist], gradient),
            xdot: vec![nan; dims.nx],
            jacobian: NamedArray::filled(["row", "col"], [dims.nx, dims.nx], nan),
            nroots: vec![0; dims.ne],
            diagnostics: Diagnostics::new(nt),
            diagnostics_b: Diagnostics::new(nt),
            steady_state: None,
            warnings: Vec::new(),
        }
    }

    pub fn nt(&self) -> usize {
        self.ts.len()
    }

    /// Whether state sensitivities are part of the result
    pub fn has_state_sensitivities(&self) -> bool {
        self.sx.shape()[2] > 0
    }

    /// State at timepoint `it`
    pub fn state(&self, it: usize) -> Vec<f64> {
        (0..self.x.shape()[1]).map(|ix| self.x[[it, ix]]).collect()
    }

    /// Observables at timepoint `it`
    pub fn observables(&self, it: usize) -> Vec<f64> {
        (0..self.y.shape()[1]).map(|iy| self.y[[it, iy]]).collect()
    }

    /// Mark the objective and its gradients as invalid after a failure
    pub fn invalidate(&mut self) {
        self.llh = f64::NAN;
        self.sllh.iter_mut().for_each(|v| *v = f64::NAN);
        self.s2llh.fill(f64::NAN);
    }

    /// Whether `id` was raised at least once
    pub fn has_warning(&self, id: &str) -> bool {
        self.warnings.iter().any(|w| w.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sensim_types::SensitivityMethod;

    #[test]
    fn test_shapes_follow_settings() {
        let dims = ModelDimensions::new(2, 3).with_observables(1).with_events(1, 1);
        let settings = SimulationSettings {
            sensi: SensitivityOrder::First,
            ..SimulationSettings::default()
        };
        let rdata = ReturnData::new(&dims, &[0.0, 1.0], 3, &settings, false);
        assert_eq!(rdata.sx.shape(), [2, 2, 3]);
        assert!(rdata.has_state_sensitivities());
        assert!(rdata.llh.is_nan());
        assert!(rdata.sllh.iter().all(|v| v.is_nan()));
        assert_eq!(rdata.z.shape(), [10, 1]);

        let plain = SimulationSettings::default();
        let rdata = ReturnData::new(&dims, &[0.0, 1.0], 3, &plain, true);
        assert_eq!(rdata.sx.shape(), [2, 2, 0]);
        assert!(rdata.sllh.is_empty());
        assert_eq!(rdata.llh, 0.0);
    }

    #[test]
    fn test_adjoint_first_order_has_no_state_sensitivities() {
        let dims = ModelDimensions::new(2, 1);
        let settings = SimulationSettings {
            sensi_method: SensitivityMethod::Adjoint,
            sensi: SensitivityOrder::First,
            ..SimulationSettings::default()
        };
        let mut rdata = ReturnData::new(&dims, &[1.0], 1, &settings, true);
        assert!(!rdata.has_state_sensitivities());
        assert_eq!(rdata.sllh, vec![0.0]);
        rdata.invalidate();
        assert!(rdata.llh.is_nan() && rdata.sllh[0].is_nan());
    }
}
