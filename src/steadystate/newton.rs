//! Linear solvers for Newton steps on the steady-state equation.
//!
//! Every step solves `J(x) Δ = -f(x)` with a fresh factorization. The dense
//! and sparse variants only differ in the storage of the Jacobian and the
//! factorization routine.

use nalgebra::{DMatrix, DVector};
use sensim_types::LinearSolver;

use crate::error::{Result, SimulationError};
use crate::linalg::{Factorization, SparseLu, SparseMatrix};
use crate::model::ModelContext;
use crate::utils::constants::{
    NEWTON_FACTORIZATION_FAILED, NEWTON_NOT_IMPLEMENTED, NEWTON_SOLVE_FAILED, UNIT_ROUNDOFF,
};

fn factorization_failed(function: &'static str) -> impl FnOnce(crate::error::LinalgError) -> SimulationError {
    move |err| {
        log::debug!("{function}: {err}");
        SimulationError::NewtonFailure {
            code: NEWTON_FACTORIZATION_FAILED,
            function,
        }
    }
}

fn solve_failed(function: &'static str) -> SimulationError {
    SimulationError::NewtonFailure {
        code: NEWTON_SOLVE_FAILED,
        function,
    }
}

/// Threshold of the reciprocal condition number below which the expensive
/// estimate is consulted
fn singularity_precision() -> f64 {
    UNIT_ROUNDOFF.powf(2.0 / 3.0)
}

/// Linear algebra of the Newton iteration
pub trait NewtonSolver {
    /// Evaluate and factorize the Jacobian at `(t, x)`
    fn prepare_linear_system(
        &mut self,
        ctx: &ModelContext<'_>,
        heaviside: &[f64],
        t: f64,
        x: &DVector<f64>,
    ) -> Result<()>;

    /// Evaluate and factorize the adjoint Jacobian at `(t, x)`
    fn prepare_linear_system_b(
        &mut self,
        ctx: &ModelContext<'_>,
        heaviside: &[f64],
        t: f64,
        x: &DVector<f64>,
    ) -> Result<()>;

    /// Overwrite `rhs` with the solution of the prepared system
    fn solve_linear_system(&self, rhs: &mut DVector<f64>) -> Result<()>;

    /// Whether the last prepared Jacobian is numerically singular
    fn is_singular(&mut self) -> bool;

    /// Newton step: `delta` holds `f(x)` on entry and `Δ` with
    /// `J Δ = -f(x)` on exit
    fn get_step(
        &mut self,
        ctx: &ModelContext<'_>,
        heaviside: &[f64],
        t: f64,
        x: &DVector<f64>,
        delta: &mut DVector<f64>,
    ) -> Result<()> {
        self.prepare_linear_system(ctx, heaviside, t, x)?;
        delta.neg_mut();
        self.solve_linear_system(delta)
    }

    /// Steady-state sensitivities `sx = -J⁻¹ ∂f/∂p`, one column per entry
    /// of `plist`
    fn compute_newton_sensis(
        &mut self,
        ctx: &ModelContext<'_>,
        heaviside: &[f64],
        t: f64,
        x: &DVector<f64>,
    ) -> Result<DMatrix<f64>> {
        self.prepare_linear_system(ctx, heaviside, t, x)?;
        let dx = vec![0.0; x.len()];
        let pt = ctx.point(t, x.as_slice(), &dx, heaviside);
        let sparse = ctx.dxdotdp_sparse(&pt)?;
        let dense = match sparse {
            Some(_) => None,
            None => Some(ctx.dxdotdp(&pt)?),
        };
        if self.is_singular() {
            ctx.warn(
                "NEWTON_SINGULAR",
                "Jacobian is singular at the steady state, sensitivities may be inaccurate",
            );
        }
        let mut sx = DMatrix::zeros(x.len(), ctx.nplist());
        for (col, &ip) in ctx.plist().iter().enumerate() {
            let mut rhs = match &dense {
                Some(dxdotdp) => -dxdotdp.column(col).into_owned(),
                None => DVector::zeros(x.len()),
            };
            if let Some(dxdotdp) = &sparse {
                for (row, value) in dxdotdp.column_entries(ip) {
                    rhs[row] -= value;
                }
            }
            self.solve_linear_system(&mut rhs)?;
            sx.set_column(col, &rhs);
        }
        Ok(sx)
    }
}

/// Create the Newton solver matching the integrator's linear solver
pub fn get_solver(linear_solver: LinearSolver, nx: usize) -> Result<Box<dyn NewtonSolver>> {
    match linear_solver {
        LinearSolver::Dense => Ok(Box::new(NewtonSolverDense::new(nx))),
        LinearSolver::Klu => Ok(Box::new(NewtonSolverSparse::new(nx))),
        other => {
            log::debug!("no Newton solver for linear solver {}", other.as_str());
            Err(SimulationError::NewtonFailure {
                code: NEWTON_NOT_IMPLEMENTED,
                function: "get_solver",
            })
        }
    }
}

/// Dense LU on the full `nx x nx` Jacobian
#[derive(Debug)]
pub struct NewtonSolverDense {
    jacobian: DMatrix<f64>,
    lu: Option<Factorization>,
}

impl NewtonSolverDense {
    pub fn new(nx: usize) -> Self {
        Self {
            jacobian: DMatrix::zeros(nx, nx),
            lu: None,
        }
    }

    fn factorize(&mut self, function: &'static str) -> Result<()> {
        self.lu = None;
        let lu = Factorization::dense(self.jacobian.clone()).map_err(factorization_failed(function))?;
        self.lu = Some(lu);
        Ok(())
    }
}

impl NewtonSolver for NewtonSolverDense {
    fn prepare_linear_system(
        &mut self,
        ctx: &ModelContext<'_>,
        heaviside: &[f64],
        t: f64,
        x: &DVector<f64>,
    ) -> Result<()> {
        let dx = vec![0.0; x.len()];
        self.jacobian = ctx.jacobian(&ctx.point(t, x.as_slice(), &dx, heaviside))?;
        self.factorize("prepare_linear_system")
    }

    fn prepare_linear_system_b(
        &mut self,
        ctx: &ModelContext<'_>,
        heaviside: &[f64],
        t: f64,
        x: &DVector<f64>,
    ) -> Result<()> {
        let dx = vec![0.0; x.len()];
        self.jacobian = ctx.jacobian_b(&ctx.point(t, x.as_slice(), &dx, heaviside))?;
        self.factorize("prepare_linear_system_b")
    }

    fn solve_linear_system(&self, rhs: &mut DVector<f64>) -> Result<()> {
        let lu = self.lu.as_ref().ok_or_else(|| solve_failed("solve_linear_system"))?;
        lu.solve_in_place(rhs).map_err(|_| solve_failed("solve_linear_system"))
    }

    /// Dense LU has no condition estimate; the test runs on a sparse copy
    fn is_singular(&mut self) -> bool {
        let mut sparse = NewtonSolverSparse::from_jacobian(SparseMatrix::from_dense(&self.jacobian));
        sparse.is_singular()
    }
}

/// Sparse LU on the compressed-column Jacobian
#[derive(Debug)]
pub struct NewtonSolverSparse {
    jacobian: SparseMatrix,
    lu: Option<SparseLu>,
}

impl NewtonSolverSparse {
    pub fn new(nx: usize) -> Self {
        Self {
            jacobian: SparseMatrix::dense_pattern(nx),
            lu: None,
        }
    }

    fn from_jacobian(jacobian: SparseMatrix) -> Self {
        let lu = SparseLu::new(&jacobian).ok();
        Self { jacobian, lu }
    }

    fn factorize(&mut self, function: &'static str) -> Result<()> {
        self.lu = None;
        let lu = SparseLu::new(&self.jacobian).map_err(factorization_failed(function))?;
        self.lu = Some(lu);
        Ok(())
    }
}

impl NewtonSolver for NewtonSolverSparse {
    fn prepare_linear_system(
        &mut self,
        ctx: &ModelContext<'_>,
        heaviside: &[f64],
        t: f64,
        x: &DVector<f64>,
    ) -> Result<()> {
        let dx = vec![0.0; x.len()];
        self.jacobian = ctx.jacobian_sparse(&ctx.point(t, x.as_slice(), &dx, heaviside))?;
        self.factorize("prepare_linear_system")
    }

    fn prepare_linear_system_b(
        &mut self,
        ctx: &ModelContext<'_>,
        heaviside: &[f64],
        t: f64,
        x: &DVector<f64>,
    ) -> Result<()> {
        let dx = vec![0.0; x.len()];
        let jb = ctx.jacobian_b(&ctx.point(t, x.as_slice(), &dx, heaviside))?;
        self.jacobian = SparseMatrix::from_dense(&jb);
        self.factorize("prepare_linear_system_b")
    }

    fn solve_linear_system(&self, rhs: &mut DVector<f64>) -> Result<()> {
        let lu = self.lu.as_ref().ok_or_else(|| solve_failed("solve_linear_system"))?;
        let solution = lu.solve(rhs).map_err(|_| solve_failed("solve_linear_system"))?;
        rhs.copy_from(&solution);
        Ok(())
    }

    /// Cheap reciprocal condition check first, 1-norm estimate only if
    /// that one is inconclusive. A matrix that cannot be factorized is
    /// singular.
    fn is_singular(&mut self) -> bool {
        let Some(lu) = self.lu.as_mut() else {
            return true;
        };
        let precision = singularity_precision();
        if lu.rcond() < precision {
            return lu.condest() > 1.0 / precision;
        }
        false
    }
}
