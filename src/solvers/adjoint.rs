//! Backward integration of adjoint states and quadratures.
//!
//! The adjoint system `xB' = JB xB` and the quadratures `xQB' = qBdot` are
//! integrated from the final time towards `t0` with the same variable-order
//! BDF formulas as the forward problem, using negative step sizes. The
//! forward state is read from the recorded trajectory, one segment between
//! two discontinuities at a time.

use std::collections::VecDeque;

use nalgebra::DVector;

use super::bdf::{compute_bdf_coefficients, error_exponent, initial_step, local_error_estimate, StepControl};
use super::engine::BdfIntegrator;
use super::linear;
use super::SolverCounters;
use crate::error::{Result, SimulationError};
use crate::model::ModelContext;
use crate::utils::constants::{
    MAX_CONVERGENCE_FAILURES, MAX_ERROR_TEST_FAILURES, STATUS_CONV_FAILURE, STATUS_ERR_FAILURE, STATUS_ILL_INPUT,
    STATUS_TOO_MUCH_WORK, UNIT_ROUNDOFF,
};

#[derive(Debug, Clone)]
struct BackwardPoint {
    t: f64,
    xb: DVector<f64>,
    xbdot: DVector<f64>,
    xqb: DVector<f64>,
    xqbdot: DVector<f64>,
}

/// State of the backward problem
#[derive(Debug, Clone)]
pub(super) struct BackwardState {
    current: BackwardPoint,
    past: VecDeque<BackwardPoint>,
    control: StepControl,
    /// Derivatives at the current point need to be recomputed
    stale: bool,
    pub(super) counters: SolverCounters,
}

impl BackwardState {
    pub(super) fn new(nx: usize) -> Self {
        Self::start(0.0, DVector::zeros(nx), DVector::zeros(0), 1, false)
    }

    pub(super) fn start(t: f64, xb: DVector<f64>, xqb: DVector<f64>, max_order: usize, stldet: bool) -> Self {
        let (nx, nq) = (xb.len(), xqb.len());
        Self {
            current: BackwardPoint {
                t,
                xb,
                xbdot: DVector::zeros(nx),
                xqb,
                xqbdot: DVector::zeros(nq),
            },
            past: VecDeque::new(),
            control: StepControl::new(max_order, stldet),
            stale: true,
            counters: SolverCounters::default(),
        }
    }

    pub(super) fn t(&self) -> f64 {
        self.current.t
    }

    pub(super) fn xb(&self) -> &DVector<f64> {
        &self.current.xb
    }

    pub(super) fn xqb(&self) -> &DVector<f64> {
        &self.current.xqb
    }

    pub(super) fn reinit(&mut self, t: f64, xb: &DVector<f64>) {
        self.current.t = t;
        self.current.xb = xb.clone();
        self.mark_stale();
    }

    pub(super) fn quad_reinit(&mut self, xqb: &DVector<f64>) {
        self.current.xqb = xqb.clone();
        self.mark_stale();
    }

    pub(super) fn mark_stale(&mut self) {
        self.stale = true;
        self.past.clear();
        self.control.restart();
    }

    fn points(&self) -> impl Iterator<Item = &BackwardPoint> {
        std::iter::once(&self.current).chain(self.past.iter())
    }

    /// Signed step sizes `[h, t_n - t_{n-1}, ...]`, all negative
    fn timesteps(&self, h: f64, order: usize) -> Vec<f64> {
        let mut steps = Vec::with_capacity(order);
        steps.push(h);
        let mut t = self.current.t;
        for point in self.past.iter().take(order.saturating_sub(1)) {
            steps.push(t - point.t);
            t = point.t;
        }
        steps
    }

    fn combine(&self, alpha: &[f64], value: impl Fn(&BackwardPoint) -> &DVector<f64>) -> DVector<f64> {
        let mut out = DVector::zeros(value(&self.current).len());
        for (a, point) in alpha.iter().zip(self.points()) {
            out += value(point) * *a;
        }
        out
    }
}

impl BdfIntegrator {
    fn forward_state(&self, segment: usize, t: f64) -> Result<(DVector<f64>, DVector<f64>)> {
        self.trajectory
            .interpolate(segment, t)
            .ok_or(SimulationError::IntegrationFailureB {
                code: STATUS_ILL_INPUT,
                t,
            })
    }

    fn backward_derivatives(&mut self, ctx: &ModelContext<'_>, heaviside: &[f64], segment: usize) -> Result<()> {
        let t = self.backward.current.t;
        let (x, dx) = self.forward_state(segment, t)?;
        let pt = ctx.point(t, x.as_slice(), dx.as_slice(), heaviside);
        let jacobian_b = ctx.jacobian_b(&pt)?;
        let state = &mut self.backward.current;
        state.xbdot = &jacobian_b * &state.xb;
        state.xqbdot = ctx.qbdot(&pt, &state.xb)?;
        self.backward.counters.rhs_evals += 1;
        Ok(())
    }

    pub(super) fn solve_backward(&mut self, ctx: &ModelContext<'_>, heaviside: &[f64], tout: f64) -> Result<()> {
        let t_start = self.backward.current.t;
        if tout >= t_start {
            return Ok(());
        }
        let segment = self
            .trajectory
            .segment_for(tout, t_start)
            .ok_or(SimulationError::IntegrationFailureB {
                code: STATUS_ILL_INPUT,
                t: t_start,
            })?;
        if self.backward.stale {
            self.backward_derivatives(ctx, heaviside, segment)?;
            self.backward.stale = false;
        }
        let mut steps = 0;
        while self.backward.current.t > tout {
            if steps >= self.max_steps {
                return Err(SimulationError::IntegrationFailureB {
                    code: STATUS_TOO_MUCH_WORK,
                    t: self.backward.current.t,
                });
            }
            self.step_backward(ctx, heaviside, segment, tout)?;
            steps += 1;
        }
        Ok(())
    }

    /// One accepted step towards `tout`; the adjoint system is linear so the
    /// corrector is a single linear solve
    fn step_backward(&mut self, ctx: &ModelContext<'_>, heaviside: &[f64], segment: usize, tout: f64) -> Result<()> {
        let mut error_failures = 0;
        let mut convergence_failures = 0;
        loop {
            let state = &self.backward;
            let t = state.current.t;
            let span = t - tout;
            let mut control = state.control.clone();
            if control.h <= 0.0 {
                control.h = initial_step(
                    &state.current.xb,
                    &state.current.xbdot,
                    self.controller.rtol,
                    self.controller.atol,
                    span,
                );
            }
            let (magnitude, clamped) = control.propose(span);
            if !clamped && magnitude <= 10.0 * UNIT_ROUNDOFF * t.abs() {
                return Err(SimulationError::IntegrationFailureB {
                    code: STATUS_ERR_FAILURE,
                    t,
                });
            }
            let h = -magnitude;
            let t_new = if clamped { tout } else { t + h };
            let order = control.usable_order(state.past.len());
            let timesteps = state.timesteps(h, order);
            let (beta, alpha) = compute_bdf_coefficients(order, &timesteps);
            let gamma = beta * h;
            let a = state.combine(&alpha, |p| &p.xb);
            let aq = state.combine(&alpha, |p| &p.xqb);

            let (x, dx) = self.forward_state(segment, t_new)?;
            let pt = ctx.point(t_new, x.as_slice(), dx.as_slice(), heaviside);
            let jacobian_b = ctx.jacobian_b(&pt)?;
            let solved = linear::assemble_adjoint(&jacobian_b, gamma, self.linear_solver)
                .and_then(|factorization| factorization.solve(&a).map_err(SimulationError::from));
            let xb = match solved {
                Ok(xb) => xb,
                Err(SimulationError::Linalg(_)) => {
                    self.backward.counters.convergence_failures += 1;
                    convergence_failures += 1;
                    if convergence_failures >= MAX_CONVERGENCE_FAILURES {
                        return Err(SimulationError::IntegrationFailureB {
                            code: STATUS_CONV_FAILURE,
                            t,
                        });
                    }
                    control.convergence_failure(magnitude);
                    self.backward.control = control;
                    continue;
                }
                Err(e) => return Err(e),
            };
            let xbdot = (&xb - &a) / gamma;
            let xqbdot = ctx.qbdot(&pt, &xb)?;
            let xqb = &aq + &xqbdot * gamma;
            self.backward.counters.rhs_evals += 1;
            let point = BackwardPoint {
                t: t_new,
                xb,
                xbdot,
                xqb,
                xqbdot,
            };

            let error = self
                .backward_error(order, &point)
                .ok_or(SimulationError::IntegrationFailureB {
                    code: STATUS_ERR_FAILURE,
                    t,
                })?;
            if error > 1.0 {
                self.backward.counters.error_test_failures += 1;
                error_failures += 1;
                if error_failures >= MAX_ERROR_TEST_FAILURES {
                    return Err(SimulationError::IntegrationFailureB {
                        code: STATUS_ERR_FAILURE,
                        t,
                    });
                }
                let rescale = self.controller.rescale(error, error_exponent(order), order);
                control.reject(magnitude, rescale, error_failures, order);
                self.backward.control = control;
                continue;
            }
            let factor = |order: usize, error: Option<f64>| error.map(|e| self.controller.factor(e, error_exponent(order)));
            let (lower, higher) = if control.order_change_due(order) {
                let lower = (order > 1).then(|| self.backward_error(order - 1, &point)).flatten();
                let higher = (order < self.max_order).then(|| self.backward_error(order + 1, &point)).flatten();
                (factor(order - 1, lower), factor(order + 1, higher))
            } else {
                (None, None)
            };
            let current = self.controller.factor(error, error_exponent(order));
            control.accept(magnitude, clamped, order, lower, current, higher);

            let state = &mut self.backward;
            state.control = control;
            state.counters.steps += 1;
            state.counters.order = order;
            let previous = std::mem::replace(&mut state.current, point);
            state.past.push_front(previous);
            state.past.truncate(self.max_order + 1);
            return Ok(());
        }
    }

    /// Scaled error of adjoint states and quadratures, `None` if the history
    /// is too short for `order`
    fn backward_error(&self, order: usize, point: &BackwardPoint) -> Option<f64> {
        let state = &self.backward;
        let times: Vec<f64> = std::iter::once(point).chain(state.points()).map(|p| p.t).collect();
        let xb_values: Vec<&DVector<f64>> = std::iter::once(point).chain(state.points()).map(|p| &p.xb).collect();
        let tr = local_error_estimate(order, &times, &xb_values, &state.current.xbdot)?;
        let xb_error = self.controller.error_norm(tr.as_slice(), point.xb.as_slice());

        let xqb_values: Vec<&DVector<f64>> = std::iter::once(point).chain(state.points()).map(|p| &p.xqb).collect();
        let tr = local_error_estimate(order, &times, &xqb_values, &state.current.xqbdot)?;
        let xqb_error = self.quad_controller.error_norm(tr.as_slice(), point.xqb.as_slice());
        Some(xb_error.max(xqb_error))
    }
}

#[cfg(test)]
mod tests {
    use super::super::Integrator;
    use super::*;
    use crate::model::Model;
    use approx::assert_relative_eq;
    use sensim_types::{ModelDimensions, SensitivityMethod, SensitivityOrder, SimulationSettings};

    #[test]
    fn test_backward_decay_quadrature() {
        // x' = -k x, x(0) = 1; with xB(T) = 1 the adjoint is xB(t) = exp(-k (T - t))
        // and xQB(0) = ∫ xB * (-x) dt = -T exp(-k T)
        let model = Model::builder(
            "decay",
            ModelDimensions::new(1, 1),
            |x0, _, _, _| {
                x0[0] = 1.0;
                Ok(())
            },
            |xdot, pt| {
                xdot[0] = -pt.p[0] * pt.x[0];
                Ok(())
            },
        )
        .build()
        .unwrap();
        let settings = SimulationSettings {
            sensi: SensitivityOrder::First,
            sensi_method: SensitivityMethod::Adjoint,
            ..SimulationSettings::with_tolerances(1e-10, 1e-12)
        };
        let k = 0.7;
        let ctx = ModelContext::new(&model, vec![k], vec![], vec![0]).unwrap();
        let mut integrator = BdfIntegrator::new(&settings, &model);
        integrator.init(&ctx, &[], 0.0, &DVector::from_element(1, 1.0)).unwrap();
        integrator.adj_init();
        integrator.solve(&ctx, &[], 2.0).unwrap();

        integrator
            .setup_b(&ctx, &[], &DVector::from_element(1, 1.0), &DVector::zeros(1))
            .unwrap();
        integrator.solve_b(&ctx, &[], 1.0).unwrap();
        assert_relative_eq!(integrator.t_b(), 1.0);
        assert_relative_eq!(integrator.xb()[0], (-k * 1.0f64).exp(), max_relative = 1e-5);
        integrator.solve_b(&ctx, &[], 0.0).unwrap();
        assert_relative_eq!(integrator.xb()[0], (-k * 2.0f64).exp(), max_relative = 1e-5);
        assert_relative_eq!(integrator.xqb()[0], -2.0 * (-k * 2.0f64).exp(), max_relative = 1e-4);
        assert!(integrator.counters_b().steps > 0);
    }
}
