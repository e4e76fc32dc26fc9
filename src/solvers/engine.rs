//! Variable-step, variable-order BDF integrator with root finding and
//! staggered forward sensitivities.
//!
//! Each step solves the corrector equation
//!
//! ```text
//! M (x_n - a_n) = γ f(t_n, x_n),   a_n = Σ α_j x_{n-1-j},   γ = β h_n
//! ```
//!
//! with `M = diag(id)`, so algebraic states satisfy `0 = f` at every step.
//! Sensitivities are advanced after the state with the Jacobian at the new
//! point. Root functions are monitored between steps and located on the
//! Hermite interpolant of the last step.

use std::collections::VecDeque;

use nalgebra::{DMatrix, DVector};
use sensim_types::{LinearSolver, NonlinearSolverIteration, SimulationSettings};

use super::adjoint::BackwardState;
use super::bdf::{
    compute_bdf_coefficients, error_exponent, hermite, initial_step, local_error_estimate, ErrorController, StepControl,
};
use super::linear;
use super::trajectory::{Trajectory, TrajectoryPoint};
use super::{Integrator, SolveStatus, SolverCounters};
use crate::error::{Result, SimulationError};
use crate::linalg::{wrms_norm, Factorization};
use crate::model::{Model, ModelContext};
use crate::utils::constants::{
    IC_MAX_ITERATIONS, IC_TOLERANCE, MAX_CONVERGENCE_FAILURES, MAX_ERROR_TEST_FAILURES,
    NEWTON_CORRECTOR_TOLERANCE, NEWTON_MAX_CORRECTOR_ITERATIONS, ROOT_MAX_ITERATIONS, ROOT_TOLERANCE_FACTOR,
    STATUS_CONV_FAILURE, STATUS_ERR_FAILURE, STATUS_TOO_MUCH_WORK, UNIT_ROUNDOFF,
};

/// Accepted solution point
#[derive(Debug, Clone)]
struct HistoryPoint {
    t: f64,
    x: DVector<f64>,
    dx: DVector<f64>,
    sx: DMatrix<f64>,
    sdx: DMatrix<f64>,
}

impl HistoryPoint {
    fn new(t: f64, x: DVector<f64>, nplist: usize) -> Self {
        let nx = x.len();
        Self {
            t,
            x,
            dx: DVector::zeros(nx),
            sx: DMatrix::zeros(nx, nplist),
            sdx: DMatrix::zeros(nx, nplist),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct RootState {
    enabled: bool,
    /// Root function values at the current point
    values: DVector<f64>,
    /// Sign of every root function before the next crossing, 0 if unknown
    signs: Vec<f64>,
    info: Vec<i32>,
    check_clustered: bool,
}

fn crossed(sign: f64, value: f64) -> bool {
    sign != 0.0 && (value == 0.0 || value.signum() != sign)
}

/// Built-in stiff integrator
pub struct BdfIntegrator {
    pub(super) controller: ErrorController,
    pub(super) quad_controller: ErrorController,
    iteration: NonlinearSolverIteration,
    pub(super) linear_solver: LinearSolver,
    pub(super) max_steps: usize,
    pub(super) max_order: usize,
    pub(super) stldet: bool,
    /// Diagonal of the mass matrix: 1 for differential, 0 for algebraic states
    mass: DVector<f64>,

    current: HistoryPoint,
    /// Previous points, most recent first
    past: VecDeque<HistoryPoint>,
    control: StepControl,
    tstop: Option<f64>,
    sensitivities: bool,
    counters: SolverCounters,
    roots: RootState,

    record: bool,
    pub(super) trajectory: Trajectory,
    pub(super) backward: BackwardState,
}

impl BdfIntegrator {
    pub fn new(settings: &SimulationSettings, model: &Model) -> Self {
        let nx = model.dims().nx;
        Self {
            controller: ErrorController::new(settings.rtol, settings.atol),
            quad_controller: ErrorController::new(settings.quad_rtol, settings.quad_atol),
            iteration: settings.iter,
            linear_solver: settings.linear_solver,
            max_steps: settings.max_steps,
            max_order: settings.max_order,
            stldet: settings.stldet,
            mass: DVector::from_column_slice(model.id()),
            current: HistoryPoint::new(0.0, DVector::zeros(nx), 0),
            past: VecDeque::new(),
            control: StepControl::new(settings.max_order, settings.stldet),
            tstop: None,
            sensitivities: false,
            counters: SolverCounters::default(),
            roots: RootState::default(),
            record: false,
            trajectory: Trajectory::default(),
            backward: BackwardState::new(nx),
        }
    }

    /// Recorded forward trajectory
    pub fn trajectory(&self) -> &Trajectory {
        &self.trajectory
    }

    fn algebraic_split(&self) -> (Vec<usize>, Vec<usize>) {
        (0..self.mass.len()).partition(|&i| self.mass[i] != 0.0)
    }

    fn is_dae(&self) -> bool {
        self.mass.iter().any(|&m| m == 0.0)
    }

    fn points(&self) -> impl Iterator<Item = &HistoryPoint> {
        std::iter::once(&self.current).chain(self.past.iter())
    }

    fn trajectory_point(&self) -> TrajectoryPoint {
        TrajectoryPoint {
            t: self.current.t,
            x: self.current.x.clone(),
            dx: self.current.dx.clone(),
        }
    }

    /// Step sizes `[h, t_n - t_{n-1}, ...]` for an order `order` step
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

    fn combine(&self, alpha: &[f64]) -> DVector<f64> {
        let mut out = DVector::zeros(self.current.x.len());
        for (a, point) in alpha.iter().zip(self.points()) {
            out += &point.x * *a;
        }
        out
    }

    fn combine_sensitivities(&self, alpha: &[f64]) -> DMatrix<f64> {
        let mut out = DMatrix::zeros(self.current.sx.nrows(), self.current.sx.ncols());
        for (a, point) in alpha.iter().zip(self.points()) {
            out += &point.sx * *a;
        }
        out
    }

    // ---------------------------------------------------------------------
    // Single step
    // ---------------------------------------------------------------------

    fn step(&mut self, ctx: &ModelContext<'_>, heaviside: &[f64], tend: f64) -> Result<()> {
        let mut error_failures = 0;
        let mut convergence_failures = 0;
        loop {
            let t = self.current.t;
            let span = tend - t;
            if self.control.h <= 0.0 {
                self.control.h = initial_step(
                    &self.current.x,
                    &self.current.dx,
                    self.controller.rtol,
                    self.controller.atol,
                    span,
                );
            }
            let (h, clamped) = self.control.propose(span);
            if !clamped && h <= 10.0 * UNIT_ROUNDOFF * t.abs() {
                return Err(SimulationError::IntegrationFailure {
                    code: STATUS_ERR_FAILURE,
                    t,
                });
            }
            let t_new = if clamped { tend } else { t + h };
            let order = self.control.usable_order(self.past.len());
            let timesteps = self.timesteps(h, order);
            let (beta, alpha) = compute_bdf_coefficients(order, &timesteps);
            let gamma = beta * h;
            let a = self.combine(&alpha);
            let predictor = &self.current.x + &self.current.dx * h;

            let point = match self.correct(ctx, heaviside, t_new, gamma, &a, predictor)? {
                Some((x, dx)) => self.sensitivity_step(ctx, heaviside, t_new, gamma, &alpha, x, dx)?,
                None => None,
            };
            let Some(point) = point else {
                self.counters.convergence_failures += 1;
                convergence_failures += 1;
                if convergence_failures >= MAX_CONVERGENCE_FAILURES {
                    return Err(SimulationError::IntegrationFailure {
                        code: STATUS_CONV_FAILURE,
                        t,
                    });
                }
                self.control.convergence_failure(h);
                continue;
            };

            let error = self
                .local_error(order, &point)
                .ok_or(SimulationError::IntegrationFailure {
                    code: STATUS_ERR_FAILURE,
                    t,
                })?;
            if error > 1.0 {
                self.counters.error_test_failures += 1;
                error_failures += 1;
                if error_failures >= MAX_ERROR_TEST_FAILURES {
                    return Err(SimulationError::IntegrationFailure {
                        code: STATUS_ERR_FAILURE,
                        t,
                    });
                }
                let rescale = self.controller.rescale(error, error_exponent(order), order);
                self.control.reject(h, rescale, error_failures, order);
                continue;
            }

            let factor = |order: usize, error: Option<f64>| error.map(|e| self.controller.factor(e, error_exponent(order)));
            let (lower, higher) = if self.control.order_change_due(order) {
                let lower = (order > 1).then(|| self.local_error(order - 1, &point)).flatten();
                let higher = (order < self.max_order).then(|| self.local_error(order + 1, &point)).flatten();
                (factor(order - 1, lower), factor(order + 1, higher))
            } else {
                (None, None)
            };
            let current = self.controller.factor(error, error_exponent(order));
            self.control.accept(h, clamped, order, lower, current, higher);
            self.counters.steps += 1;
            self.counters.order = order;

            let previous = std::mem::replace(&mut self.current, point);
            self.past.push_front(previous);
            self.past.truncate(self.max_order + 1);
            return Ok(());
        }
    }

    /// Solve the corrector equation; `None` if the iteration did not converge
    fn correct(
        &mut self,
        ctx: &ModelContext<'_>,
        heaviside: &[f64],
        t: f64,
        gamma: f64,
        a: &DVector<f64>,
        mut x: DVector<f64>,
    ) -> Result<Option<(DVector<f64>, DVector<f64>)>> {
        let (rtol, atol) = (self.controller.rtol, self.controller.atol);
        let factorization = match self.iteration {
            NonlinearSolverIteration::Newton => {
                let dx = (&x - a) / gamma;
                let pt = ctx.point(t, x.as_slice(), dx.as_slice(), heaviside);
                match linear::assemble(ctx, &pt, &self.mass, gamma, self.linear_solver) {
                    Ok(factorization) => Some(factorization),
                    Err(SimulationError::Linalg(e)) => {
                        log::debug!("iteration matrix at t = {t} is singular: {e}");
                        return Ok(None);
                    }
                    Err(e) => return Err(e),
                }
            }
            NonlinearSolverIteration::Functional => None,
        };

        for _ in 0..NEWTON_MAX_CORRECTOR_ITERATIONS {
            let dx = (&x - a) / gamma;
            let f = ctx.xdot(&ctx.point(t, x.as_slice(), dx.as_slice(), heaviside))?;
            self.counters.rhs_evals += 1;
            let delta = match &factorization {
                Some(factorization) => {
                    let residual = (&x - a).component_mul(&self.mass) - f * gamma;
                    match factorization.solve(&(-residual)) {
                        Ok(delta) => delta,
                        Err(_) => return Ok(None),
                    }
                }
                None => a + f * gamma - &x,
            };
            x += &delta;
            if wrms_norm(&delta, &x, rtol, atol) <= NEWTON_CORRECTOR_TOLERANCE {
                let dx = (&x - a) / gamma;
                return Ok(Some((x, dx)));
            }
        }
        Ok(None)
    }

    /// Advance the sensitivities to the corrected point `(x, dx)`.
    ///
    /// Solves `(M - γJ) s = M Σ α_j s_j + γ ∂f/∂p` column by column.
    #[allow(clippy::too_many_arguments)]
    fn sensitivity_step(
        &mut self,
        ctx: &ModelContext<'_>,
        heaviside: &[f64],
        t: f64,
        gamma: f64,
        alpha: &[f64],
        x: DVector<f64>,
        dx: DVector<f64>,
    ) -> Result<Option<HistoryPoint>> {
        let nplist = if self.sensitivities { self.current.sx.ncols() } else { 0 };
        let mut point = HistoryPoint::new(t, x, nplist);
        point.dx = dx;
        if nplist == 0 {
            return Ok(Some(point));
        }
        let pt = ctx.point(t, point.x.as_slice(), point.dx.as_slice(), heaviside);
        let factorization = match linear::assemble(ctx, &pt, &self.mass, gamma, self.linear_solver) {
            Ok(factorization) => factorization,
            Err(SimulationError::Linalg(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        let dxdotdp = ctx.dxdotdp(&pt)?;
        let combined = self.combine_sensitivities(alpha);
        for ip in 0..nplist {
            let history = combined.column(ip).into_owned();
            let rhs = history.component_mul(&self.mass) + dxdotdp.column(ip) * gamma;
            let s = match factorization.solve(&rhs) {
                Ok(s) => s,
                Err(_) => return Ok(None),
            };
            let sdot = (&s - &history) / gamma;
            point.sx.set_column(ip, &s);
            point.sdx.set_column(ip, &sdot);
        }
        Ok(Some(point))
    }

    /// Scaled local error of `point` estimated for an order `order` step,
    /// `None` if the history is too short; algebraic components are excluded
    fn local_error(&self, order: usize, point: &HistoryPoint) -> Option<f64> {
        let times: Vec<f64> = std::iter::once(point).chain(self.points()).map(|p| p.t).collect();
        let states: Vec<&DVector<f64>> = std::iter::once(point).chain(self.points()).map(|p| &p.x).collect();
        let tr = local_error_estimate(order, &times, &states, &self.current.dx)?;
        let mut error = self
            .controller
            .error_norm(tr.component_mul(&self.mass).as_slice(), point.x.as_slice());

        for ip in 0..point.sx.ncols() {
            let columns: Vec<DVector<f64>> = std::iter::once(point)
                .chain(self.points())
                .map(|p| p.sx.column(ip).into_owned())
                .collect();
            let values: Vec<&DVector<f64>> = columns.iter().collect();
            let slope = self.current.sdx.column(ip).into_owned();
            let tr = local_error_estimate(order, &times, &values, &slope)?;
            let column_error = self
                .controller
                .error_norm(tr.component_mul(&self.mass).as_slice(), columns[0].as_slice());
            error = error.max(column_error);
        }
        Some(error)
    }

    // ---------------------------------------------------------------------
    // Consistent initial conditions
    // ---------------------------------------------------------------------

    /// Solve `0 = f_a(x_d, x_a)` for the algebraic states
    fn consistent_algebraic_states(&mut self, ctx: &ModelContext<'_>, heaviside: &[f64]) -> Result<()> {
        let (_, algebraic) = self.algebraic_split();
        let t = self.current.t;
        for _ in 0..IC_MAX_ITERATIONS {
            let x = &self.current.x;
            let pt = ctx.point(t, x.as_slice(), self.current.dx.as_slice(), heaviside);
            let f = ctx.xdot(&pt)?;
            self.counters.rhs_evals += 1;
            let jacobian = ctx.jacobian(&pt)?;
            let jaa = DMatrix::from_fn(algebraic.len(), algebraic.len(), |r, c| {
                jacobian[(algebraic[r], algebraic[c])]
            });
            let residual = DVector::from_iterator(algebraic.len(), algebraic.iter().map(|&i| -f[i]));
            let delta = Factorization::dense(jaa)?.solve(&residual)?;
            let xa = DVector::from_iterator(algebraic.len(), algebraic.iter().map(|&i| x[i]));
            for (k, &i) in algebraic.iter().enumerate() {
                self.current.x[i] += delta[k];
            }
            if wrms_norm(&delta, &xa, self.controller.rtol, self.controller.atol) <= IC_TOLERANCE {
                return Ok(());
            }
        }
        log::debug!("algebraic states at t = {t} did not reach the consistency tolerance");
        Ok(())
    }

    /// Derivatives of states and sensitivities at the current point.
    ///
    /// Algebraic components follow from differentiating `0 = f_a`.
    fn consistent_derivatives(&mut self, ctx: &ModelContext<'_>, heaviside: &[f64]) -> Result<()> {
        let t = self.current.t;
        let pt = ctx.point(t, self.current.x.as_slice(), self.current.dx.as_slice(), heaviside);
        let f = ctx.xdot(&pt)?;
        self.counters.rhs_evals += 1;
        let dae = self.is_dae();
        let nplist = if self.sensitivities { self.current.sx.ncols() } else { 0 };
        if !dae && nplist == 0 {
            self.current.dx = f;
            return Ok(());
        }

        let jacobian = ctx.jacobian(&pt)?;
        let dxdotdp = if nplist > 0 { ctx.dxdotdp(&pt)? } else { DMatrix::zeros(f.len(), 0) };
        let (differential, algebraic) = self.algebraic_split();
        let jaa = DMatrix::from_fn(algebraic.len(), algebraic.len(), |r, c| {
            jacobian[(algebraic[r], algebraic[c])]
        });
        let jaa = if dae { Some(Factorization::dense(jaa)?) } else { None };

        // rows of the algebraic block that follow from the differential ones
        let complete = |v: &mut DVector<f64>, forcing: Option<&DVector<f64>>| -> Result<()> {
            let Some(jaa) = &jaa else { return Ok(()) };
            let rhs = DVector::from_iterator(
                algebraic.len(),
                algebraic.iter().map(|&r| {
                    let coupled: f64 = differential.iter().map(|&c| jacobian[(r, c)] * v[c]).sum();
                    -(coupled + forcing.map_or(0.0, |g| g[r]))
                }),
            );
            let solution = jaa.solve(&rhs)?;
            for (k, &i) in algebraic.iter().enumerate() {
                v[i] = solution[k];
            }
            Ok(())
        };

        let mut dx = f;
        complete(&mut dx, None)?;
        for ip in 0..nplist {
            let forcing = dxdotdp.column(ip).into_owned();
            let mut s = self.current.sx.column(ip).into_owned();
            complete(&mut s, Some(&forcing))?;
            let mut sdot = &jacobian * &s + &forcing;
            complete(&mut sdot, None)?;
            self.current.sx.set_column(ip, &s);
            self.current.sdx.set_column(ip, &sdot);
        }
        self.current.dx = dx;
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Roots
    // ---------------------------------------------------------------------

    fn root_values(
        &self,
        ctx: &ModelContext<'_>,
        heaviside: &[f64],
        t: f64,
        x: &DVector<f64>,
        dx: &DVector<f64>,
    ) -> Result<DVector<f64>> {
        ctx.root(&ctx.point(t, x.as_slice(), dx.as_slice(), heaviside))
    }

    fn refresh_root_signs(&mut self, ctx: &ModelContext<'_>, heaviside: &[f64]) -> Result<()> {
        let values = self.root_values(ctx, heaviside, self.current.t, &self.current.x, &self.current.dx)?;
        for (sign, &value) in self.roots.signs.iter_mut().zip(values.iter()) {
            if value != 0.0 {
                *sign = value.signum();
            }
        }
        self.roots.values = values;
        Ok(())
    }

    /// A root function that is zero at the current point and stays zero
    /// along the current derivative
    fn roots_clustered(&self, ctx: &ModelContext<'_>, heaviside: &[f64]) -> Result<bool> {
        if !self.roots.values.iter().any(|&g| g == 0.0) {
            return Ok(false);
        }
        let t = self.current.t;
        let delta = ROOT_TOLERANCE_FACTOR * UNIT_ROUNDOFF * (t.abs() + self.control.h.abs()).max(1.0);
        let x = &self.current.x + &self.current.dx * delta;
        let ahead = self.root_values(ctx, heaviside, t + delta, &x, &self.current.dx)?;
        Ok(self
            .roots
            .values
            .iter()
            .zip(ahead.iter())
            .any(|(&g, &g_ahead)| g == 0.0 && g_ahead == 0.0))
    }

    /// Check the last step for sign changes and stop at the first root
    fn locate_roots(&mut self, ctx: &ModelContext<'_>, heaviside: &[f64]) -> Result<bool> {
        let values = self.root_values(ctx, heaviside, self.current.t, &self.current.x, &self.current.dx)?;
        let signs = self.roots.signs.clone();
        let any_crossed = |g: &DVector<f64>, signs: &[f64]| signs.iter().zip(g.iter()).any(|(&s, &v)| crossed(s, v));
        let Some(previous) = self.past.front() else {
            self.roots.values = values;
            return Ok(false);
        };
        if !any_crossed(&values, signs.as_slice()) {
            for (sign, &value) in self.roots.signs.iter_mut().zip(values.iter()) {
                if value != 0.0 {
                    *sign = value.signum();
                }
            }
            self.roots.values = values;
            return Ok(false);
        }

        let (t0, t1) = (previous.t, self.current.t);
        let interpolate = |t: f64| {
            hermite(
                t,
                (t0, &previous.x, &previous.dx),
                (t1, &self.current.x, &self.current.dx),
            )
        };
        let tolerance = ROOT_TOLERANCE_FACTOR * UNIT_ROUNDOFF * (t1.abs() + (t1 - t0).abs());

        // Illinois-weighted regula falsi on the earliest crossing
        let (mut ta, mut tb) = (t0, t1);
        let (mut ga, mut gb) = (self.roots.values.clone(), values);
        let mut sa = signs;
        let (mut wa, mut wb) = (1.0, 1.0);
        let mut last_moved: Option<bool> = None;
        let mut iterations = 0;
        while tb - ta > tolerance && iterations < ROOT_MAX_ITERATIONS {
            iterations += 1;
            let mut tm = tb;
            for i in 0..gb.len() {
                if !crossed(sa[i], gb[i]) {
                    continue;
                }
                let (a, b) = (ga[i] * wa, gb[i] * wb);
                let candidate = if a == b { 0.5 * (ta + tb) } else { tb - b * (tb - ta) / (b - a) };
                tm = tm.min(candidate);
            }
            let margin = 0.5 * tolerance;
            let tm = tm.clamp(ta + margin, tb - margin);
            let (x, dx) = interpolate(tm);
            let gm = self.root_values(ctx, heaviside, tm, &x, &dx)?;
            if any_crossed(&gm, sa.as_slice()) {
                tb = tm;
                gb = gm;
                wb = 1.0;
                if last_moved == Some(true) {
                    wa *= 0.5;
                }
                last_moved = Some(true);
            } else {
                ta = tm;
                for (sign, &value) in sa.iter_mut().zip(gm.iter()) {
                    if value != 0.0 {
                        *sign = value.signum();
                    }
                }
                ga = gm;
                wa = 1.0;
                if last_moved == Some(false) {
                    wb *= 0.5;
                }
                last_moved = Some(false);
            }
        }

        for i in 0..gb.len() {
            let hit = crossed(sa[i], gb[i]);
            self.roots.info[i] = match (hit, sa[i] < 0.0) {
                (false, _) => 0,
                (true, true) => 1,
                (true, false) => -1,
            };
            self.roots.signs[i] = if gb[i] != 0.0 {
                gb[i].signum()
            } else if hit {
                -sa[i]
            } else {
                sa[i]
            };
        }

        if tb < t1 {
            let (x, dx) = interpolate(tb);
            let mut point = HistoryPoint::new(tb, x, self.current.sx.ncols());
            point.dx = dx;
            for ip in 0..point.sx.ncols() {
                let (s, sdot) = hermite(
                    tb,
                    (
                        t0,
                        &previous.sx.column(ip).into_owned(),
                        &previous.sdx.column(ip).into_owned(),
                    ),
                    (
                        t1,
                        &self.current.sx.column(ip).into_owned(),
                        &self.current.sdx.column(ip).into_owned(),
                    ),
                );
                point.sx.set_column(ip, &s);
                point.sdx.set_column(ip, &sdot);
            }
            self.current = point;
        }
        self.past.clear();
        self.roots.values = gb;
        if self.record {
            self.trajectory.push(self.trajectory_point());
        }
        log::debug!("root found at t = {tb}: {:?}", self.roots.info);
        Ok(true)
    }
}

impl Integrator for BdfIntegrator {
    fn init(&mut self, ctx: &ModelContext<'_>, heaviside: &[f64], t0: f64, x0: &DVector<f64>) -> Result<()> {
        self.current = HistoryPoint::new(t0, x0.clone(), 0);
        self.past.clear();
        self.control.restart();
        self.sensitivities = false;
        self.counters = SolverCounters::default();
        self.roots = RootState::default();
        self.record = false;
        self.trajectory.clear();
        self.calc_ic(ctx, heaviside)
    }

    fn sens_init(&mut self, ctx: &ModelContext<'_>, heaviside: &[f64], sx0: &DMatrix<f64>) -> Result<()> {
        SimulationError::check_len("initial sensitivity rows", self.current.x.len(), sx0.nrows())?;
        self.sensitivities = true;
        self.current.sx = sx0.clone();
        self.current.sdx = DMatrix::zeros(sx0.nrows(), sx0.ncols());
        self.consistent_derivatives(ctx, heaviside)
    }

    fn root_init(&mut self, ctx: &ModelContext<'_>, heaviside: &[f64], ne: usize) -> Result<()> {
        self.roots = RootState {
            enabled: ne > 0,
            values: DVector::zeros(ne),
            signs: vec![0.0; ne],
            info: vec![0; ne],
            check_clustered: false,
        };
        if ne > 0 {
            self.refresh_root_signs(ctx, heaviside)?;
        }
        Ok(())
    }

    fn adj_init(&mut self) {
        self.record = true;
        self.trajectory.clear();
        self.trajectory.start_segment(self.trajectory_point());
    }

    fn set_stop_time(&mut self, tstop: f64) {
        self.tstop = Some(tstop);
    }

    fn solve(&mut self, ctx: &ModelContext<'_>, heaviside: &[f64], tout: f64) -> Result<SolveStatus> {
        self.roots.info.iter_mut().for_each(|v| *v = 0);
        if self.roots.enabled && self.roots.check_clustered {
            self.roots.check_clustered = false;
            if self.roots_clustered(ctx, heaviside)? {
                return Ok(SolveStatus::RootsClustered);
            }
        }
        let tend = match self.tstop {
            Some(tstop) if tstop > self.current.t => tout.min(tstop),
            _ => tout,
        };
        let mut steps = 0;
        while self.current.t < tend {
            if steps >= self.max_steps {
                return Err(SimulationError::IntegrationFailure {
                    code: STATUS_TOO_MUCH_WORK,
                    t: self.current.t,
                });
            }
            self.step(ctx, heaviside, tend)?;
            steps += 1;
            if self.roots.enabled && self.locate_roots(ctx, heaviside)? {
                return Ok(SolveStatus::Root);
            }
            if self.record {
                self.trajectory.push(self.trajectory_point());
            }
        }
        Ok(SolveStatus::Success)
    }

    fn t(&self) -> f64 {
        self.current.t
    }

    fn x(&self) -> &DVector<f64> {
        &self.current.x
    }

    fn dx(&self) -> &DVector<f64> {
        &self.current.dx
    }

    fn sx(&self) -> &DMatrix<f64> {
        &self.current.sx
    }

    fn root_info(&self) -> &[i32] {
        &self.roots.info
    }

    fn disable_roots(&mut self) {
        self.roots.enabled = false;
    }

    fn reinit(&mut self, t: f64, x: &DVector<f64>, dx: &DVector<f64>) {
        self.current.t = t;
        self.current.x = x.clone();
        self.current.dx = dx.clone();
        self.past.clear();
        self.control.restart();
    }

    fn sens_reinit(&mut self, sx: &DMatrix<f64>) {
        self.current.sx = sx.clone();
        self.current.sdx = DMatrix::zeros(sx.nrows(), sx.ncols());
    }

    fn calc_ic(&mut self, ctx: &ModelContext<'_>, heaviside: &[f64]) -> Result<()> {
        if self.is_dae() {
            self.consistent_algebraic_states(ctx, heaviside)?;
        }
        self.consistent_derivatives(ctx, heaviside)?;
        self.past.clear();
        self.control.restart();
        if self.roots.enabled {
            self.refresh_root_signs(ctx, heaviside)?;
            self.roots.check_clustered = true;
        }
        if self.record {
            self.trajectory.start_segment(self.trajectory_point());
        }
        Ok(())
    }

    fn counters(&self) -> SolverCounters {
        self.counters
    }

    fn setup_b(
        &mut self,
        _ctx: &ModelContext<'_>,
        _heaviside: &[f64],
        xb0: &DVector<f64>,
        xqb0: &DVector<f64>,
    ) -> Result<()> {
        self.backward = BackwardState::start(self.current.t, xb0.clone(), xqb0.clone(), self.max_order, self.stldet);
        Ok(())
    }

    fn solve_b(&mut self, ctx: &ModelContext<'_>, heaviside: &[f64], tout: f64) -> Result<()> {
        self.solve_backward(ctx, heaviside, tout)
    }

    fn t_b(&self) -> f64 {
        self.backward.t()
    }

    fn xb(&self) -> &DVector<f64> {
        self.backward.xb()
    }

    fn xqb(&self) -> &DVector<f64> {
        self.backward.xqb()
    }

    fn reinit_b(&mut self, t: f64, xb: &DVector<f64>) {
        self.backward.reinit(t, xb);
    }

    fn quad_reinit_b(&mut self, xqb: &DVector<f64>) {
        self.backward.quad_reinit(xqb);
    }

    fn calc_ic_b(&mut self, _ctx: &ModelContext<'_>, _heaviside: &[f64]) -> Result<()> {
        // derivatives depend on the forward segment and are refreshed by the next solve
        self.backward.mark_stale();
        Ok(())
    }

    fn counters_b(&self) -> SolverCounters {
        self.backward.counters
    }
}
