use nalgebra::{DMatrix, DVector};
use sensim_types::{NewtonDampingMode, SimulationSettings};

use super::newton::{get_solver, NewtonSolver};
use crate::data::{SteadyStateInfo, SteadyStateMethod};
use crate::error::{Result, SimulationError};
use crate::linalg::wrms_norm;
use crate::model::ModelContext;
use crate::solvers::create_integrator;
use crate::utils::constants::{
    NEWTON_DAMPING_FAILED, NEWTON_NOT_CONVERGED, STEADY_STATE_MAX_CHUNKS, STEADY_STATE_MAX_TIME,
};

/// Search for a state with `f(x) = 0`.
///
/// Newton's method is tried first. If it fails, the system is integrated
/// forward in time until the right-hand side becomes small; if that does
/// not settle either, Newton's method gets a second chance from the
/// integrated state.
pub struct SteadyStateProblem<'s> {
    settings: &'s SimulationSettings,
    t: f64,
    x: DVector<f64>,
    newton_steps: usize,
    simulation_time: f64,
}

impl<'s> SteadyStateProblem<'s> {
    pub fn new(settings: &'s SimulationSettings, t: f64, x0: DVector<f64>) -> Self {
        Self {
            settings,
            t,
            x: x0,
            newton_steps: 0,
            simulation_time: 0.0,
        }
    }

    pub fn x(&self) -> &DVector<f64> {
        &self.x
    }

    /// Weighted norm of the right-hand side at the current state
    fn residual(&self, ctx: &ModelContext<'_>, heaviside: &[f64]) -> Result<(DVector<f64>, f64)> {
        let dx = vec![0.0; self.x.len()];
        let xdot = ctx.xdot(&ctx.point(self.t, self.x.as_slice(), &dx, heaviside))?;
        let newton = &self.settings.newton;
        let wrms = wrms_norm(&xdot, &self.x, newton.rtol, newton.atol);
        Ok((xdot, wrms))
    }

    /// Find the steady state, trying Newton, simulation and Newton again
    pub fn work(&mut self, ctx: &ModelContext<'_>, heaviside: &[f64]) -> Result<SteadyStateInfo> {
        let mut solver = get_solver(self.settings.linear_solver, self.x.len())?;
        let method = match self.apply_newtons_method(ctx, heaviside, solver.as_mut()) {
            Ok(()) => SteadyStateMethod::Newton,
            Err(first) => {
                log::info!("Newton's method failed ({first}), integrating towards the steady state");
                if self.simulate(ctx, heaviside)? {
                    SteadyStateMethod::Simulation
                } else {
                    self.apply_newtons_method(ctx, heaviside, solver.as_mut())?;
                    SteadyStateMethod::NewtonAfterSimulation
                }
            }
        };
        let (_, wrms) = self.residual(ctx, heaviside)?;
        log::debug!(
            "steady state reached by {method:?} after {} Newton steps, wrms {wrms:.3e}",
            self.newton_steps
        );
        Ok(SteadyStateInfo {
            method,
            newton_steps: self.newton_steps,
            simulation_time: self.simulation_time,
            wrms,
            x: self.x.iter().copied().collect(),
        })
    }

    /// Damped Newton iteration.
    ///
    /// A step that does not decrease the residual norm is retracted and
    /// retried with a quarter of the damping factor; accepted steps double
    /// it again, up to one.
    pub fn apply_newtons_method(
        &mut self,
        ctx: &ModelContext<'_>,
        heaviside: &[f64],
        solver: &mut dyn NewtonSolver,
    ) -> Result<()> {
        let newton = &self.settings.newton;
        let damping = newton.damping_mode == NewtonDampingMode::On;
        let (mut xdot, mut wrms) = self.residual(ctx, heaviside)?;
        let mut converged = wrms < 1.0;
        let mut gamma = 1.0;
        let mut delta = DVector::zeros(self.x.len());
        let mut new_step = true;
        let mut steps = 0;

        while !converged && steps < newton.max_steps {
            if new_step {
                delta.copy_from(&xdot);
                solver.get_step(ctx, heaviside, self.t, &self.x, &mut delta)?;
            }
            let x_old = self.x.clone();
            self.x.axpy(gamma, &delta, 1.0);
            let (xdot_new, wrms_new) = self.residual(ctx, heaviside)?;

            if wrms_new < wrms || !damping {
                xdot = xdot_new;
                wrms = wrms_new;
                converged = wrms < 1.0;
                steps += 1;
                new_step = true;
                if damping {
                    gamma = (2.0 * gamma).min(1.0);
                }
            } else {
                self.x = x_old;
                gamma /= 4.0;
                new_step = false;
                if gamma < newton.damping_factor_lower_bound {
                    self.newton_steps += steps;
                    return Err(SimulationError::NewtonFailure {
                        code: NEWTON_DAMPING_FAILED,
                        function: "apply_newtons_method",
                    });
                }
            }
            log::trace!("Newton step {steps}: wrms {wrms:.3e}, damping {gamma}");
        }
        self.newton_steps += steps;
        if converged {
            Ok(())
        } else {
            Err(SimulationError::NewtonFailure {
                code: NEWTON_NOT_CONVERGED,
                function: "apply_newtons_method",
            })
        }
    }

    /// Integrate in growing chunks until the residual norm drops below one.
    ///
    /// Returns whether the steady state was reached within the time and
    /// chunk limits; the state is advanced either way.
    pub fn simulate(&mut self, ctx: &ModelContext<'_>, heaviside: &[f64]) -> Result<bool> {
        let mut integrator = create_integrator(self.settings, ctx.model())?;
        integrator.init(ctx, heaviside, self.t, &self.x)?;
        let t_start = self.t;
        let mut horizon = 1.0;
        for _ in 0..STEADY_STATE_MAX_CHUNKS {
            let tout = t_start + horizon;
            integrator.solve(ctx, heaviside, tout)?;
            self.x = integrator.x().clone();
            self.simulation_time = integrator.t() - t_start;
            let (_, wrms) = self.residual(ctx, heaviside)?;
            if wrms < 1.0 {
                return Ok(true);
            }
            if horizon >= STEADY_STATE_MAX_TIME {
                break;
            }
            horizon = (horizon * 10.0).min(STEADY_STATE_MAX_TIME);
        }
        log::info!("no steady state within t = {} by simulation", self.simulation_time);
        Ok(false)
    }

    /// Sensitivities of the steady state w.r.t. the parameters in `plist`
    pub fn sensitivities(&self, ctx: &ModelContext<'_>, heaviside: &[f64]) -> Result<DMatrix<f64>> {
        let mut solver = get_solver(self.settings.linear_solver, self.x.len())?;
        solver.compute_newton_sensis(ctx, heaviside, self.t, &self.x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Model;
    use approx::assert_relative_eq;
    use sensim_types::{LinearSolver, ModelDimensions};

    fn settings() -> SimulationSettings {
        let mut settings = SimulationSettings::with_tolerances(1e-8, 1e-10);
        settings.newton.atol = 1e-10;
        settings
    }

    /// Production `p0` and degradation `x^2`, steady state `sqrt(p0)`
    fn saturating() -> Model {
        Model::builder(
            "saturating",
            ModelDimensions::new(1, 1),
            |x0, _, _, _| {
                x0[0] = 0.1;
                Ok(())
            },
            |xdot, pt| {
                xdot[0] = pt.p[0] - pt.x[0] * pt.x[0];
                Ok(())
            },
        )
        .build()
        .unwrap()
    }

    #[test]
    fn test_newton_finds_steady_state() {
        let model = saturating();
        let ctx = ModelContext::new(&model, vec![4.0], vec![], vec![0]).unwrap();
        let settings = settings();
        let mut problem = SteadyStateProblem::new(&settings, 0.0, DVector::from_element(1, 1.0));
        let info = problem.work(&ctx, &[]).unwrap();
        assert_eq!(info.method, SteadyStateMethod::Newton);
        assert_relative_eq!(info.x[0], 2.0, epsilon = 1e-8);
        assert!(info.wrms < 1.0 && info.newton_steps > 0);

        // d sqrt(p) / dp = 1 / (2 sqrt(p))
        let sx = problem.sensitivities(&ctx, &[]).unwrap();
        assert_relative_eq!(sx[(0, 0)], 0.25, epsilon = 1e-6);
    }

    #[test]
    fn test_simulation_fallback() {
        // Newton from x = 0 hits a singular Jacobian; integration does not
        let model = saturating();
        let ctx = ModelContext::new(&model, vec![4.0], vec![], vec![0]).unwrap();
        let settings = settings();
        let mut problem = SteadyStateProblem::new(&settings, 0.0, DVector::zeros(1));
        let info = problem.work(&ctx, &[]).unwrap();
        assert_ne!(info.method, SteadyStateMethod::Newton);
        assert!(info.simulation_time > 0.0);
        assert_relative_eq!(info.x[0], 2.0, max_relative = 1e-6);
    }

    #[test]
    fn test_damping_lower_bound() {
        // Undamped Newton on atan diverges from |x| > 1.39
        let model = Model::builder(
            "atan",
            ModelDimensions::new(1, 0),
            |_, _, _, _| Ok(()),
            |xdot, pt| {
                xdot[0] = -pt.x[0].atan();
                Ok(())
            },
        )
        .build()
        .unwrap();
        let ctx = ModelContext::new(&model, vec![], vec![], vec![]).unwrap();
        let settings = settings();
        let mut solver = get_solver(LinearSolver::Dense, 1).unwrap();
        let mut problem = SteadyStateProblem::new(&settings, 0.0, DVector::from_element(1, 5.0));
        problem.apply_newtons_method(&ctx, &[], solver.as_mut()).unwrap();
        assert_relative_eq!(problem.x()[0], 0.0, epsilon = 1e-9);

        let mut undamped = settings.clone();
        undamped.newton.damping_mode = NewtonDampingMode::Off;
        let mut problem = SteadyStateProblem::new(&undamped, 0.0, DVector::from_element(1, 5.0));
        assert!(problem.apply_newtons_method(&ctx, &[], solver.as_mut()).is_err());
    }
}
