//! Solver and sensitivity settings.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// Linear multistep method family of the integrator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinearMultistepMethod {
    /// Adams-Moulton (non-stiff)
    Adams,
    /// Backward differentiation formulas (stiff)
    Bdf,
}

impl Default for LinearMultistepMethod {
    fn default() -> Self {
        LinearMultistepMethod::Bdf
    }
}

/// Nonlinear corrector iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NonlinearSolverIteration {
    /// Fixed-point iteration
    Functional,
    /// Newton iteration with the attached linear solver
    Newton,
}

impl Default for NonlinearSolverIteration {
    fn default() -> Self {
        NonlinearSolverIteration::Newton
    }
}

/// Linear solver attached to the Newton corrector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinearSolver {
    Dense,
    Band,
    LapackDense,
    LapackBand,
    Diag,
    /// Scaled preconditioned GMRES
    Spgmr,
    /// Scaled preconditioned Bi-CGStab
    Spbcg,
    /// Scaled preconditioned TFQMR
    Sptfqmr,
    /// Sparse direct LU
    Klu,
}

impl Default for LinearSolver {
    fn default() -> Self {
        LinearSolver::Dense
    }
}

impl LinearSolver {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinearSolver::Dense => "dense",
            LinearSolver::Band => "band",
            LinearSolver::LapackDense => "lapack-dense",
            LinearSolver::LapackBand => "lapack-band",
            LinearSolver::Diag => "diag",
            LinearSolver::Spgmr => "spgmr",
            LinearSolver::Spbcg => "spbcg",
            LinearSolver::Sptfqmr => "sptfqmr",
            LinearSolver::Klu => "klu",
        }
    }

    /// Krylov solvers that only need Jacobian-vector products
    pub fn is_iterative(&self) -> bool {
        matches!(
            self,
            LinearSolver::Spgmr | LinearSolver::Spbcg | LinearSolver::Sptfqmr
        )
    }
}

/// How parameter sensitivities are computed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SensitivityMethod {
    None,
    /// Forward sensitivity analysis
    Forward,
    /// Adjoint sensitivity analysis
    Adjoint,
}

impl Default for SensitivityMethod {
    fn default() -> Self {
        SensitivityMethod::Forward
    }
}

/// Requested derivative order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SensitivityOrder {
    None,
    First,
    Second,
}

impl Default for SensitivityOrder {
    fn default() -> Self {
        SensitivityOrder::None
    }
}

/// Transformation applied to the parameters handed to the simulator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParameterScaling {
    None,
    /// Parameters are given as log10(p)
    Log10,
    /// Parameters are given as ln(p)
    Ln,
}

impl Default for ParameterScaling {
    fn default() -> Self {
        ParameterScaling::None
    }
}

impl ParameterScaling {
    /// Map a scaled value back to linear space
    pub fn unscale(&self, value: f64) -> f64 {
        match self {
            ParameterScaling::None => value,
            ParameterScaling::Log10 => 10f64.powf(value),
            ParameterScaling::Ln => value.exp(),
        }
    }

    /// Map a linear value into the scaled space
    pub fn scale(&self, value: f64) -> f64 {
        match self {
            ParameterScaling::None => value,
            ParameterScaling::Log10 => value.log10(),
            ParameterScaling::Ln => value.ln(),
        }
    }
}

/// Newton damping strategy for the steady-state solver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NewtonDampingMode {
    Off,
    On,
}

impl Default for NewtonDampingMode {
    fn default() -> Self {
        NewtonDampingMode::On
    }
}

/// Settings of the Newton steady-state solver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NewtonSettings {
    /// Maximum number of Newton steps per attempt
    pub max_steps: usize,

    /// Maximum number of linear iterations (iterative linear solvers only)
    pub max_linear_steps: usize,

    /// Damping strategy
    pub damping_mode: NewtonDampingMode,

    /// Smallest damping factor before the attempt is abandoned
    pub damping_factor_lower_bound: f64,

    /// Compute the steady state by Newton's method before the forward run
    pub preequilibration: bool,

    /// Absolute tolerance of the steady-state criterion
    pub atol: f64,

    /// Relative tolerance of the steady-state criterion
    pub rtol: f64,
}

impl Default for NewtonSettings {
    fn default() -> Self {
        Self {
            max_steps: 40,
            max_linear_steps: 0,
            damping_mode: NewtonDampingMode::On,
            damping_factor_lower_bound: 1e-8,
            preequilibration: false,
            atol: 1e-16,
            rtol: 1e-8,
        }
    }
}

/// Simulation settings, read-only for the duration of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationSettings {
    /// Integrator family
    pub lmm: LinearMultistepMethod,

    /// Corrector iteration
    pub iter: NonlinearSolverIteration,

    /// Linear solver of the corrector
    pub linear_solver: LinearSolver,

    /// Relative tolerance of states and sensitivities
    pub rtol: f64,

    /// Absolute tolerance of states and sensitivities
    pub atol: f64,

    /// Relative tolerance of adjoint quadratures
    pub quad_rtol: f64,

    /// Absolute tolerance of adjoint quadratures
    pub quad_atol: f64,

    /// Maximum number of internal steps per output interval
    pub max_steps: usize,

    /// Maximum integration order
    pub max_order: usize,

    /// Stability limit detection for BDF orders >= 3
    pub stldet: bool,

    /// Sensitivity method
    pub sensi_method: SensitivityMethod,

    /// Sensitivity order
    pub sensi: SensitivityOrder,

    /// Scaling of the supplied parameters
    pub pscale: ParameterScaling,

    /// Newton steady-state settings
    pub newton: NewtonSettings,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            lmm: LinearMultistepMethod::Bdf,
            iter: NonlinearSolverIteration::Newton,
            linear_solver: LinearSolver::Dense,
            rtol: 1e-8,
            atol: 1e-16,
            quad_rtol: 1e-8,
            quad_atol: 1e-12,
            max_steps: 10_000,
            max_order: 5,
            stldet: true,
            sensi_method: SensitivityMethod::Forward,
            sensi: SensitivityOrder::None,
            pscale: ParameterScaling::None,
            newton: NewtonSettings::default(),
        }
    }
}

impl SimulationSettings {
    /// Settings with the given tolerances and otherwise default values
    pub fn with_tolerances(rtol: f64, atol: f64) -> Self {
        Self {
            rtol,
            atol,
            quad_rtol: rtol,
            ..Self::default()
        }
    }

    /// Whether any sensitivities are requested
    pub fn computes_sensitivities(&self) -> bool {
        self.sensi > SensitivityOrder::None && self.sensi_method != SensitivityMethod::None
    }

    pub fn is_forward(&self) -> bool {
        self.computes_sensitivities() && self.sensi_method == SensitivityMethod::Forward
    }

    pub fn is_adjoint(&self) -> bool {
        self.computes_sensitivities() && self.sensi_method == SensitivityMethod::Adjoint
    }

    /// Check value ranges that do not depend on the model
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("rtol", self.rtol),
            ("quad_rtol", self.quad_rtol),
            ("newton.rtol", self.newton.rtol),
        ];
        for (field, value) in positive {
            if !(value > 0.0 && value.is_finite()) {
                return Err(ConfigError::InvalidValue {
                    field,
                    reason: format!("expected a positive finite value, got {value}"),
                });
            }
        }
        let non_negative = [
            ("atol", self.atol),
            ("quad_atol", self.quad_atol),
            ("newton.atol", self.newton.atol),
        ];
        for (field, value) in non_negative {
            if !(value >= 0.0 && value.is_finite()) {
                return Err(ConfigError::InvalidValue {
                    field,
                    reason: format!("expected a non-negative finite value, got {value}"),
                });
            }
        }
        if self.max_steps == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_steps",
                reason: "must be at least 1".to_string(),
            });
        }
        if !(1..=5).contains(&self.max_order) {
            return Err(ConfigError::InvalidValue {
                field: "max_order",
                reason: format!("BDF order must be in 1..=5, got {}", self.max_order),
            });
        }
        if !(self.newton.damping_factor_lower_bound > 0.0
            && self.newton.damping_factor_lower_bound < 1.0)
        {
            return Err(ConfigError::InvalidValue {
                field: "newton.damping_factor_lower_bound",
                reason: "must lie in (0, 1)".to_string(),
            });
        }
        Ok(())
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let settings: Self = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let settings = SimulationSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.lmm, LinearMultistepMethod::Bdf);
        assert_eq!(settings.linear_solver, LinearSolver::Dense);
        assert!(!settings.computes_sensitivities());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let settings =
            SimulationSettings::from_json(r#"{ "rtol": 1e-6, "sensi": "First" }"#).unwrap();
        assert_eq!(settings.rtol, 1e-6);
        assert_eq!(settings.atol, 1e-16);
        assert!(settings.is_forward());
        assert_eq!(settings.newton.max_steps, 40);
    }

    #[test]
    fn test_invalid_tolerance_rejected() {
        let err = SimulationSettings::from_json(r#"{ "rtol": -1.0 }"#).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { field: "rtol", .. }));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let settings = SimulationSettings {
            sensi_method: SensitivityMethod::Adjoint,
            sensi: SensitivityOrder::First,
            pscale: ParameterScaling::Log10,
            ..SimulationSettings::default()
        };
        settings.save(&path).unwrap();
        assert_eq!(SimulationSettings::load(&path).unwrap(), settings);
    }

    #[test]
    fn test_parameter_scaling() {
        assert!((ParameterScaling::Log10.unscale(2.0) - 100.0).abs() < 1e-12);
        assert!((ParameterScaling::Ln.unscale(ParameterScaling::Ln.scale(3.0)) - 3.0).abs() < 1e-15);
        assert_eq!(ParameterScaling::None.scale(-4.0), -4.0);
    }
}
