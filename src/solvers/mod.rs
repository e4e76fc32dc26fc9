//! Integrator adapter and the built-in BDF engine.
//!
//! The simulation drivers only talk to the [`Integrator`] trait: advance to
//! a time, report roots, reinitialize after events, and replay the forward
//! trajectory backwards for the adjoint problem. [`BdfIntegrator`] is the
//! implementation shipped with the crate:
//! - variable-step, variable-order BDF (orders 1-5) with coefficients
//!   computed from the step history
//! - Newton or functional corrector, dense/band/diagonal/sparse linear algebra
//! - mass-matrix DAEs with consistent initial derivatives
//! - staggered direct forward sensitivities
//! - root finding on Hermite interpolants
//! - backward integration of adjoint states and quadratures

mod adjoint;
mod bdf;
mod engine;
mod linear;
mod trajectory;

pub use bdf::{compute_bdf_coefficients, hermite, ErrorController};
pub use engine::BdfIntegrator;
pub use trajectory::{Trajectory, TrajectoryPoint};

use nalgebra::{DMatrix, DVector};
use sensim_types::{LinearMultistepMethod, LinearSolver, NonlinearSolverIteration, SimulationSettings};

use crate::error::{Result, SimulationError};
use crate::model::{Model, ModelContext};

/// Outcome of advancing the integrator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolveStatus {
    /// The requested output time was reached
    Success,
    /// A root function changed sign; the integrator stopped at the root
    Root,
    /// Root finding cannot make progress at the current point
    RootsClustered,
}

/// Cumulative solver statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SolverCounters {
    pub steps: usize,
    pub rhs_evals: usize,
    pub error_test_failures: usize,
    pub convergence_failures: usize,
    /// Order of the last accepted step
    pub order: usize,
}

/// Capability contract of a stiff integrator.
///
/// Heaviside indicators are owned by the caller and passed to every call
/// that evaluates the model.
pub trait Integrator {
    /// Set the initial point and compute consistent derivatives
    fn init(&mut self, ctx: &ModelContext<'_>, heaviside: &[f64], t0: f64, x0: &DVector<f64>) -> Result<()>;

    /// Activate forward sensitivities, one column per parameter in `plist`
    fn sens_init(&mut self, ctx: &ModelContext<'_>, heaviside: &[f64], sx0: &DMatrix<f64>) -> Result<()>;

    /// Activate root finding on the model's `ne` root functions
    fn root_init(&mut self, ctx: &ModelContext<'_>, heaviside: &[f64], ne: usize) -> Result<()>;

    /// Record the forward trajectory for a later backward pass
    fn adj_init(&mut self);

    /// Never step past `tstop`
    fn set_stop_time(&mut self, tstop: f64);

    /// Advance towards `tout`
    fn solve(&mut self, ctx: &ModelContext<'_>, heaviside: &[f64], tout: f64) -> Result<SolveStatus>;

    fn t(&self) -> f64;
    fn x(&self) -> &DVector<f64>;
    fn dx(&self) -> &DVector<f64>;
    fn sx(&self) -> &DMatrix<f64>;

    /// Crossing direction per root function after [`SolveStatus::Root`]:
    /// `1` rising, `-1` falling, `0` no crossing
    fn root_info(&self) -> &[i32];

    fn disable_roots(&mut self);

    /// Restart from a new state at `t`
    fn reinit(&mut self, t: f64, x: &DVector<f64>, dx: &DVector<f64>);

    fn sens_reinit(&mut self, sx: &DMatrix<f64>);

    /// Make derivatives (and algebraic states) consistent at the current point
    fn calc_ic(&mut self, ctx: &ModelContext<'_>, heaviside: &[f64]) -> Result<()>;

    fn counters(&self) -> SolverCounters;

    /// Start the backward problem at the current forward time
    fn setup_b(
        &mut self,
        ctx: &ModelContext<'_>,
        heaviside: &[f64],
        xb0: &DVector<f64>,
        xqb0: &DVector<f64>,
    ) -> Result<()>;

    /// Integrate the adjoint states and quadratures backwards to `tout`
    fn solve_b(&mut self, ctx: &ModelContext<'_>, heaviside: &[f64], tout: f64) -> Result<()>;

    fn t_b(&self) -> f64;
    fn xb(&self) -> &DVector<f64>;
    fn xqb(&self) -> &DVector<f64>;

    fn reinit_b(&mut self, t: f64, xb: &DVector<f64>);
    fn quad_reinit_b(&mut self, xqb: &DVector<f64>);

    /// Recompute adjoint derivatives after a reinitialization
    fn calc_ic_b(&mut self, ctx: &ModelContext<'_>, heaviside: &[f64]) -> Result<()>;

    fn counters_b(&self) -> SolverCounters;
}

/// Create the integrator selected by `settings` for `model`
pub fn create_integrator(settings: &SimulationSettings, model: &Model) -> Result<Box<dyn Integrator>> {
    if settings.lmm == LinearMultistepMethod::Adams {
        return Err(SimulationError::setup(
            "Adams-Moulton integration is not supported, use BDF",
        ));
    }
    match settings.linear_solver {
        LinearSolver::Dense | LinearSolver::Band | LinearSolver::Diag | LinearSolver::Klu => {}
        other if other.is_iterative() => {
            return Err(SimulationError::setup(format!(
                "iterative linear solver {} is not supported",
                other.as_str()
            )))
        }
        other => {
            return Err(SimulationError::setup(format!(
                "linear solver {} is not supported",
                other.as_str()
            )))
        }
    }
    if model.is_dae() {
        if settings.iter == NonlinearSolverIteration::Functional {
            return Err(SimulationError::setup(
                "functional iteration cannot solve algebraic equations",
            ));
        }
        if settings.is_adjoint() {
            return Err(SimulationError::setup(
                "adjoint sensitivities are not available for DAE models",
            ));
        }
    }
    log::debug!(
        "creating BDF integrator for {} (linear solver {}, rtol {}, atol {})",
        model.name(),
        settings.linear_solver.as_str(),
        settings.rtol,
        settings.atol
    );
    Ok(Box::new(BdfIntegrator::new(settings, model)))
}
