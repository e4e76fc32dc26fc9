//! Forward pass over the output timepoints.
//!
//! [`ForwardProblem`] drives the integrator from `t0` through every output
//! timepoint, stops at roots to apply event resets, and collects states,
//! observables, event outputs and the objective into [`ReturnData`]. With
//! forward sensitivities the objective gradient is accumulated on the way;
//! for adjoint sensitivities everything the backward pass needs to replay
//! the discontinuities is kept.

use nalgebra::{DMatrix, DVector};
use sensim_types::SimulationSettings;

use crate::data::{ExpData, ReturnData};
use crate::error::{Result, SimulationError};
use crate::model::{ModelContext, NoiseArgs};
use crate::solvers::{create_integrator, Integrator, SolveStatus};

/// A recorded state discontinuity, replayed in reverse by the backward pass
#[derive(Debug, Clone)]
pub struct Discontinuity {
    pub t: f64,
    /// Crossing direction per event: 1 rising, -1 falling, 0 none
    pub root_info: Vec<i32>,
    /// State before the reset
    pub x: DVector<f64>,
    pub dx: DVector<f64>,
    /// Right-hand side after the reset
    pub xdot: DVector<f64>,
    /// Right-hand side before the reset
    pub xdot_old: DVector<f64>,
    /// Event output slot written at this discontinuity, per event
    pub slots: Vec<Option<usize>>,
}

/// Heaviside indicators at the start point: 0 for negative, 1 for positive
/// root functions
pub fn initial_heaviside(ctx: &ModelContext<'_>, t0: f64, x0: &DVector<f64>) -> Result<Vec<f64>> {
    let ne = ctx.dims().ne;
    let mut heaviside = vec![0.0; ne];
    if ne == 0 {
        return Ok(heaviside);
    }
    let dx = vec![0.0; x0.len()];
    let roots = ctx.root(&ctx.point(t0, x0.as_slice(), &dx, &heaviside))?;
    for (ie, &g) in roots.iter().enumerate() {
        if g == 0.0 {
            return Err(SimulationError::StartedInEvent { ie });
        }
        heaviside[ie] = if g > 0.0 { 1.0 } else { 0.0 };
    }
    Ok(heaviside)
}

/// Which objective a set of measurements contributes to
#[derive(Debug, Clone, Copy)]
enum Term {
    Observable,
    EventObservable,
    EventRegularization,
}

impl Term {
    fn value(self, ctx: &ModelContext<'_>, i: usize, args: &NoiseArgs<'_>) -> Result<DVector<f64>> {
        match self {
            Term::Observable => ctx.jy(i, args),
            Term::EventObservable => ctx.jz(i, args),
            Term::EventRegularization => ctx.jrz(i, args),
        }
    }

    fn dvalue(self, ctx: &ModelContext<'_>, i: usize, args: &NoiseArgs<'_>) -> Result<DMatrix<f64>> {
        match self {
            Term::Observable => ctx.djydy(i, args),
            Term::EventObservable => ctx.djzdz(i, args),
            Term::EventRegularization => ctx.djrzdz(i, args),
        }
    }

    fn dsigma(self, ctx: &ModelContext<'_>, i: usize, args: &NoiseArgs<'_>) -> Result<DMatrix<f64>> {
        match self {
            Term::Observable => ctx.djydsigma(i, args),
            Term::EventObservable => ctx.djzdsigma(i, args),
            Term::EventRegularization => ctx.djrzdsigma(i, args),
        }
    }
}

/// Objective summed over measured entries with its partials w.r.t. the
/// simulated values and the standard deviations, `nj x n` each
struct Objective {
    value: DVector<f64>,
    dvalue: DMatrix<f64>,
    dsigma: DMatrix<f64>,
}

impl Objective {
    fn evaluate(
        ctx: &ModelContext<'_>,
        term: Term,
        values: &DVector<f64>,
        sigma: &DVector<f64>,
        measured: &[(usize, f64)],
        gradient: bool,
    ) -> Result<Self> {
        let nj = ctx.dims().nj;
        let n = values.len();
        let mut objective = Objective {
            value: DVector::zeros(nj),
            dvalue: DMatrix::zeros(nj, n),
            dsigma: DMatrix::zeros(nj, n),
        };
        for &(i, measurement) in measured {
            let args = NoiseArgs {
                values: values.as_slice(),
                sigma: sigma.as_slice(),
                measurement,
                p: ctx.p(),
                k: ctx.k(),
            };
            objective.value += term.value(ctx, i, &args)?;
            if gradient {
                objective.dvalue += term.dvalue(ctx, i, &args)?;
                objective.dsigma += term.dsigma(ctx, i, &args)?;
            }
        }
        Ok(objective)
    }

    /// `(dJ/dx, dJ/dp)` given the derivatives of the values and sigmas
    fn chain(
        &self,
        dvdx: &DMatrix<f64>,
        dvdp: &DMatrix<f64>,
        dsigmadp: &DMatrix<f64>,
    ) -> (DMatrix<f64>, DMatrix<f64>) {
        (&self.dvalue * dvdx, &self.dvalue * dvdp + &self.dsigma * dsigmadp)
    }
}

pub struct ForwardProblem<'a> {
    ctx: &'a ModelContext<'a>,
    settings: &'a SimulationSettings,
    edata: Option<&'a ExpData>,
    pub(crate) integrator: Box<dyn Integrator>,

    t0: f64,
    t: f64,
    x: DVector<f64>,
    dx: DVector<f64>,
    sx: DMatrix<f64>,
    pub(crate) sx0: DMatrix<f64>,
    heaviside: Vec<f64>,
    /// Event time sensitivities of the last primary event
    stau: DVector<f64>,
    last_root: Option<f64>,

    pub(crate) discontinuities: Vec<Discontinuity>,
    /// `dJy/dx` per timepoint, `nj x nx`
    pub(crate) data_gradients: Vec<DMatrix<f64>>,
    /// `dJz/dx` per event and output slot
    pub(crate) event_gradients: Vec<Vec<Option<DMatrix<f64>>>>,
    /// `dJrz/dx` of the final-time regularization
    pub(crate) terminal_gradient: DMatrix<f64>,
}

impl<'a> ForwardProblem<'a> {
    /// Set up the integrator at `(t0, x0)` with initial sensitivities `sx0`
    pub fn new(
        ctx: &'a ModelContext<'a>,
        settings: &'a SimulationSettings,
        edata: Option<&'a ExpData>,
        t0: f64,
        nt: usize,
        x0: DVector<f64>,
        sx0: DMatrix<f64>,
    ) -> Result<Self> {
        let dims = ctx.dims();
        let heaviside = initial_heaviside(ctx, t0, &x0)?;
        let mut integrator = create_integrator(settings, ctx.model())?;
        integrator.init(ctx, &heaviside, t0, &x0)?;
        if settings.is_forward() {
            integrator.sens_init(ctx, &heaviside, &sx0)?;
        }
        if dims.ne > 0 {
            integrator.root_init(ctx, &heaviside, dims.ne)?;
        }
        if settings.is_adjoint() {
            integrator.adj_init();
        }

        let nplist = ctx.nplist();
        let sx = if settings.is_forward() {
            integrator.sx().clone()
        } else {
            DMatrix::zeros(dims.nx, 0)
        };
        Ok(Self {
            ctx,
            settings,
            edata,
            t0,
            t: integrator.t(),
            x: integrator.x().clone(),
            dx: integrator.dx().clone(),
            sx,
            sx0,
            heaviside,
            stau: DVector::zeros(nplist),
            last_root: None,
            integrator,
            discontinuities: Vec::new(),
            data_gradients: vec![DMatrix::zeros(dims.nj, dims.nx); nt],
            event_gradients: vec![vec![None; dims.nmaxevent]; dims.ne],
            terminal_gradient: DMatrix::zeros(dims.nj, dims.nx),
        })
    }

    pub fn t(&self) -> f64 {
        self.t
    }

    pub fn x(&self) -> &DVector<f64> {
        &self.x
    }

    pub fn heaviside(&self) -> &[f64] {
        &self.heaviside
    }

    pub fn discontinuities(&self) -> &[Discontinuity] {
        &self.discontinuities
    }

    /// Integrate through all timepoints of `rdata`
    pub fn work(&mut self, rdata: &mut ReturnData) -> Result<()> {
        for it in 0..rdata.nt() {
            let tout = rdata.ts[it];
            if self.settings.is_forward() {
                self.integrator.set_stop_time(tout);
            }
            while self.t < tout {
                let status = self.integrator.solve(self.ctx, &self.heaviside, tout)?;
                self.sync();
                match status {
                    SolveStatus::Success => {}
                    SolveStatus::Root => self.handle_event(rdata, None)?,
                    SolveStatus::RootsClustered => {
                        self.integrator.disable_roots();
                        self.ctx.warn(
                            "ROOTS_CLUSTERED",
                            format!("roots are clustered at t = {}, disabling root finding", self.t),
                        );
                    }
                }
            }
            self.handle_data_point(it, rdata)?;
        }
        if self.ctx.dims().ne > 0 {
            self.fill_events(rdata)?;
        }
        self.store_final(rdata)
    }

    /// Right-hand side and Jacobian at the current point
    pub fn store_final(&self, rdata: &mut ReturnData) -> Result<()> {
        let pt = self.ctx.point(self.t, self.x.as_slice(), self.dx.as_slice(), &self.heaviside);
        let xdot = self.ctx.xdot(&pt)?;
        let jacobian = self.ctx.jacobian(&pt)?;
        rdata.xdot = xdot.iter().copied().collect();
        for row in 0..jacobian.nrows() {
            for col in 0..jacobian.ncols() {
                rdata.jacobian[[row, col]] = jacobian[(row, col)];
            }
        }
        Ok(())
    }

    fn sync(&mut self) {
        self.t = self.integrator.t();
        self.x.copy_from(self.integrator.x());
        self.dx.copy_from(self.integrator.dx());
        if self.settings.is_forward() {
            self.sx.copy_from(self.integrator.sx());
        }
    }

    /// Apply the resets of the events in `secondary`, or of the roots the
    /// integrator stopped at when `None`.
    ///
    /// Resets can make further root functions change sign at the same time;
    /// those are handled recursively before the integrator is restarted.
    fn handle_event(&mut self, rdata: &mut ReturnData, secondary: Option<Vec<i32>>) -> Result<()> {
        let ctx = self.ctx;
        let dims = ctx.dims();
        let primary = secondary.is_none();
        let root_info = match secondary {
            Some(found) => found,
            None => self.integrator.root_info().to_vec(),
        };
        let t = self.t;

        if primary {
            if self.last_root == Some(t) {
                return Err(SimulationError::EventStuck { t });
            }
            self.last_root = Some(t);
        }

        let pre = ctx.point(t, self.x.as_slice(), self.dx.as_slice(), &self.heaviside);
        let root_values = ctx.root(&pre)?;
        let xdot_old = ctx.xdot(&pre)?;
        if primary && self.settings.is_forward() {
            for ie in rising(&root_info) {
                self.stau = ctx.stau(ie, &pre, &self.sx, &xdot_old)?;
            }
        }

        let mut slots = vec![None; dims.ne];
        for ie in rising(&root_info) {
            if rdata.nroots[ie] < dims.nmaxevent {
                slots[ie] = Some(self.event_output(ie, rdata)?);
            }
        }

        let x_old = self.x.clone();
        let dx_old = self.dx.clone();
        for (h, &direction) in self.heaviside.iter_mut().zip(&root_info) {
            *h += f64::from(direction);
        }
        for ie in rising(&root_info) {
            let pt = ctx.point(t, self.x.as_slice(), self.dx.as_slice(), &self.heaviside);
            let bolus = ctx.deltax(ie, &pt, &xdot_old, &xdot_old)?;
            self.x += bolus;
        }
        let post = ctx.point(t, self.x.as_slice(), self.dx.as_slice(), &self.heaviside);
        let xdot = ctx.xdot(&post)?;

        let capacity = dims.max_discontinuities();
        if self.discontinuities.len() < capacity {
            self.discontinuities.push(Discontinuity {
                t,
                root_info: root_info.clone(),
                x: x_old.clone(),
                dx: dx_old.clone(),
                xdot: xdot.clone(),
                xdot_old: xdot_old.clone(),
                slots,
            });
        } else {
            ctx.warn(
                "TOO_MUCH_EVENT",
                format!("event at t = {t} exceeds the capacity of {capacity} recorded discontinuities"),
            );
        }

        if self.settings.is_forward() {
            let pt = ctx.point(t, x_old.as_slice(), dx_old.as_slice(), &self.heaviside);
            for ie in rising(&root_info) {
                let jump = ctx.deltasx(ie, &pt, &xdot, &xdot_old, &self.sx, &self.stau)?;
                self.sx += jump;
            }
        }

        let post = ctx.point(t, self.x.as_slice(), self.dx.as_slice(), &self.heaviside);
        let new_values = ctx.root(&post)?;
        let mut found = vec![0; dims.ne];
        for ie in 0..dims.ne {
            if root_info[ie] == 0 && root_values[ie] * new_values[ie] < 0.0 {
                found[ie] = if root_values[ie] < new_values[ie] { 1 } else { -1 };
            }
        }
        if found.iter().any(|&d| d != 0) {
            log::debug!("secondary events {found:?} at t = {t}");
            self.handle_event(rdata, Some(found))?;
        }

        if primary {
            self.integrator.reinit(t, &self.x, &self.dx);
            if self.settings.is_forward() {
                self.integrator.sens_reinit(&self.sx);
            }
            self.integrator.calc_ic(ctx, &self.heaviside)?;
            self.sync();
        }
        Ok(())
    }

    /// Standard deviations of event observables at occurrence `slot`; data
    /// overrides the model's values. Also returns which ones came from data.
    fn event_sigma(&self, slot: usize) -> Result<(DVector<f64>, Vec<bool>)> {
        let dims = self.ctx.dims();
        let mut sigma = self.ctx.sigma_z(self.t)?;
        let mut given = vec![false; dims.nz];
        if let Some(edata) = self.edata {
            for iz in 0..dims.nztrue {
                let s = edata.sigmaz(slot, iz);
                if !s.is_nan() {
                    sigma[iz] = s;
                    given[iz] = true;
                }
            }
        }
        Ok((sigma, given))
    }

    fn event_measurements(&self, slot: usize, entries: &[usize]) -> Vec<(usize, f64)> {
        let Some(edata) = self.edata else { return Vec::new() };
        entries
            .iter()
            .filter(|&&iz| iz < self.ctx.dims().nztrue)
            .map(|&iz| (iz, edata.mz(slot, iz)))
            .filter(|(_, m)| !m.is_nan())
            .collect()
    }

    fn event_entries(&self, ie: usize) -> Vec<usize> {
        let z2event = self.ctx.model().z2event();
        (0..self.ctx.dims().nz).filter(|&iz| z2event[iz] == ie).collect()
    }

    /// Record the event observables of event `ie` and their objective;
    /// returns the output slot
    fn event_output(&mut self, ie: usize, rdata: &mut ReturnData) -> Result<usize> {
        let ctx = self.ctx;
        let slot = rdata.nroots[ie];
        let entries = self.event_entries(ie);
        let pt = ctx.point(self.t, self.x.as_slice(), self.dx.as_slice(), &self.heaviside);
        let z = ctx.z(ie, &pt)?;
        let rz = ctx.rz(ie, &pt)?;
        let (sigma, given) = self.event_sigma(slot)?;
        for &iz in &entries {
            rdata.z[[slot, iz]] = z[iz];
            rdata.rz[[slot, iz]] = rz[iz];
            rdata.sigmaz[[slot, iz]] = sigma[iz];
        }

        let sensitivities = self.settings.computes_sensitivities();
        let measured = self.event_measurements(slot, &entries);
        let objective = Objective::evaluate(ctx, Term::EventObservable, &z, &sigma, &measured, sensitivities)?;
        if self.edata.is_some() {
            rdata.llh -= objective.value[0];
        }

        if sensitivities {
            let dzdx = ctx.dzdx(ie, &pt)?;
            let dzdp = ctx.dzdp(ie, &pt)?;
            let dsigmazdp = masked_rows(ctx.dsigma_zdp(self.t)?, &given);
            if self.settings.is_forward() {
                let sz = &dzdx * &self.sx + &dzdp;
                let srz = ctx.drzdx(ie, &pt)? * &self.sx + ctx.drzdp(ie, &pt)?;
                for &iz in &entries {
                    for ip in 0..ctx.nplist() {
                        rdata.sz[[slot, iz, ip]] = sz[(iz, ip)];
                        rdata.srz[[slot, iz, ip]] = srz[(iz, ip)];
                    }
                }
            }
            for &iz in &entries {
                for ip in 0..ctx.nplist() {
                    rdata.ssigmaz[[slot, iz, ip]] = dsigmazdp[(iz, ip)];
                }
            }
            if self.edata.is_some() {
                let (djdx, djdp) = objective.chain(&dzdx, &dzdp, &dsigmazdp);
                self.accumulate_gradient(rdata, &djdx, &djdp);
                if self.settings.is_adjoint() {
                    self.event_gradients[ie][slot] = Some(djdx);
                }
            }
        }
        rdata.nroots[ie] += 1;
        Ok(slot)
    }

    /// Record the regularization of events that did not use up all their
    /// output slots, evaluated at the final time
    fn fill_events(&mut self, rdata: &mut ReturnData) -> Result<()> {
        let ctx = self.ctx;
        let dims = ctx.dims();
        for ie in 0..dims.ne {
            let slot = rdata.nroots[ie];
            if slot >= dims.nmaxevent {
                continue;
            }
            let entries = self.event_entries(ie);
            let pt = ctx.point(self.t, self.x.as_slice(), self.dx.as_slice(), &self.heaviside);
            let rz = ctx.rz(ie, &pt)?;
            let (sigma, given) = self.event_sigma(slot)?;
            for &iz in &entries {
                rdata.rz[[slot, iz]] = rz[iz];
                rdata.sigmaz[[slot, iz]] = sigma[iz];
            }

            let sensitivities = self.settings.computes_sensitivities();
            let measured = self.event_measurements(slot, &entries);
            let objective =
                Objective::evaluate(ctx, Term::EventRegularization, &rz, &sigma, &measured, sensitivities)?;
            if self.edata.is_some() {
                rdata.llh -= objective.value[0];
            }
            if !sensitivities {
                continue;
            }

            let drzdx = ctx.drzdx(ie, &pt)?;
            let drzdp = ctx.drzdp(ie, &pt)?;
            let dsigmazdp = masked_rows(ctx.dsigma_zdp(self.t)?, &given);
            if self.settings.is_forward() {
                let srz = &drzdx * &self.sx + &drzdp;
                for &iz in &entries {
                    for ip in 0..ctx.nplist() {
                        rdata.srz[[slot, iz, ip]] = srz[(iz, ip)];
                    }
                }
            }
            for &iz in &entries {
                for ip in 0..ctx.nplist() {
                    rdata.ssigmaz[[slot, iz, ip]] = dsigmazdp[(iz, ip)];
                }
            }
            if self.edata.is_some() {
                let (djdx, djdp) = objective.chain(&drzdx, &drzdp, &dsigmazdp);
                self.accumulate_gradient(rdata, &djdx, &djdp);
                if self.settings.is_adjoint() {
                    self.terminal_gradient += djdx;
                }
            }
        }
        Ok(())
    }

    /// Store states, observables and the data objective at timepoint `it`
    fn handle_data_point(&mut self, it: usize, rdata: &mut ReturnData) -> Result<()> {
        let ctx = self.ctx;
        let dims = ctx.dims();
        let t = self.t;
        for ix in 0..dims.nx {
            rdata.x[[it, ix]] = self.x[ix];
        }
        if rdata.ts[it] > self.t0 {
            rdata.diagnostics.record(it, &self.integrator.counters());
        }
        if self.settings.is_forward() {
            for ix in 0..dims.nx {
                for ip in 0..ctx.nplist() {
                    rdata.sx[[it, ix, ip]] = self.sx[(ix, ip)];
                }
            }
        }
        if dims.ny == 0 {
            return Ok(());
        }

        let pt = ctx.point(t, self.x.as_slice(), self.dx.as_slice(), &self.heaviside);
        let y = ctx.y(&pt)?;
        let mut sigma = ctx.sigma_y(t)?;
        let mut given = vec![false; dims.ny];
        let mut measured = Vec::new();
        if let Some(edata) = self.edata {
            for iy in 0..dims.nytrue {
                let s = edata.sigmay(it, iy);
                if !s.is_nan() {
                    sigma[iy] = s;
                    given[iy] = true;
                }
                let m = edata.my(it, iy);
                if !m.is_nan() {
                    measured.push((iy, m));
                }
            }
        }
        for iy in 0..dims.ny {
            rdata.y[[it, iy]] = y[iy];
            rdata.sigmay[[it, iy]] = sigma[iy];
        }

        let sensitivities = self.settings.computes_sensitivities();
        let objective = Objective::evaluate(ctx, Term::Observable, &y, &sigma, &measured, sensitivities)?;
        if self.edata.is_some() {
            rdata.llh -= objective.value[0];
        }
        if !sensitivities {
            return Ok(());
        }

        let dydx = ctx.dydx(&pt)?;
        let dydp = ctx.dydp(&pt)?;
        let dsigmaydp = masked_rows(ctx.dsigma_ydp(t)?, &given);
        for iy in 0..dims.ny {
            for ip in 0..ctx.nplist() {
                rdata.ssigmay[[it, iy, ip]] = dsigmaydp[(iy, ip)];
            }
        }
        if self.settings.is_forward() {
            let sy = &dydx * &self.sx + &dydp;
            for iy in 0..dims.ny {
                for ip in 0..ctx.nplist() {
                    rdata.sy[[it, iy, ip]] = sy[(iy, ip)];
                }
            }
        }
        if self.edata.is_some() {
            let (djdx, djdp) = objective.chain(&dydx, &dydp, &dsigmaydp);
            self.accumulate_gradient(rdata, &djdx, &djdp);
            if self.settings.is_adjoint() {
                self.data_gradients[it] = djdx;
            }
        }
        Ok(())
    }

    /// Subtract an objective gradient from `sllh` and `s2llh`.
    ///
    /// Forward sensitivities give the full gradient `dJ/dx sx + dJ/dp`; with
    /// adjoints only the explicit part is added here.
    fn accumulate_gradient(&self, rdata: &mut ReturnData, djdx: &DMatrix<f64>, djdp: &DMatrix<f64>) {
        let total = if self.settings.is_forward() {
            djdx * &self.sx + djdp
        } else {
            djdp.clone()
        };
        subtract_gradient(rdata, &total);
    }
}

/// Subtract an `nj x nplist` objective gradient: the first row from `sllh`,
/// the others from `s2llh`
pub(crate) fn subtract_gradient(rdata: &mut ReturnData, gradient: &DMatrix<f64>) {
    for (ip, value) in rdata.sllh.iter_mut().enumerate() {
        *value -= gradient[(0, ip)];
    }
    for ij in 1..gradient.nrows() {
        for ip in 0..gradient.ncols() {
            if let Some(value) = rdata.s2llh.get_mut([ij - 1, ip]) {
                *value -= gradient[(ij, ip)];
            }
        }
    }
}

pub(crate) fn rising(root_info: &[i32]) -> impl Iterator<Item = usize> + '_ {
    root_info.iter().enumerate().filter(|&(_, &d)| d == 1).map(|(ie, _)| ie)
}

/// Zero the rows whose standard deviation came from data
fn masked_rows(mut m: DMatrix<f64>, given: &[bool]) -> DMatrix<f64> {
    for (row, _) in given.iter().enumerate().filter(|&(_, &g)| g) {
        m.row_mut(row).fill(0.0);
    }
    m
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Model;
    use approx::assert_relative_eq;
    use sensim_types::{ModelDimensions, SensitivityMethod, SensitivityOrder};
    use std::f64::consts::PI;

    fn decay() -> Model {
        Model::builder(
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
        .unwrap()
    }

    fn forward_settings() -> SimulationSettings {
        SimulationSettings {
            sensi: SensitivityOrder::First,
            sensi_method: SensitivityMethod::Forward,
            ..SimulationSettings::with_tolerances(1e-10, 1e-12)
        }
    }

    /// Harmonic oscillator `(sin 2πt, cos 2πt)` with a root at `x1 = 0.5`
    fn oscillator(nmaxevent: usize) -> Model {
        let dims = ModelDimensions::new(2, 0).with_events(1, 1).with_max_events(nmaxevent);
        Model::builder(
            "oscillator",
            dims,
            |x0, _, _, _| {
                x0[0] = 0.0;
                x0[1] = 1.0;
                Ok(())
            },
            |xdot, pt| {
                xdot[0] = 2.0 * PI * pt.x[1];
                xdot[1] = -2.0 * PI * pt.x[0];
                Ok(())
            },
        )
        .root(|g, pt| {
            g[0] = pt.x[0] - 0.5;
            Ok(())
        })
        .z(|z, _, pt| {
            z[0] = pt.t;
            Ok(())
        })
        .z2event(vec![0])
        .build()
        .unwrap()
    }

    #[test]
    fn test_linear_decay_with_sensitivities() {
        let model = decay();
        let p = 0.5;
        let ctx = ModelContext::new(&model, vec![p], vec![], vec![0]).unwrap();
        let settings = forward_settings();
        let ts = [0.0, 1.0, 2.0, 5.0];
        let mut rdata = ReturnData::new(model.dims(), &ts, 1, &settings, false);
        let x0 = ctx.x0(0.0).unwrap();
        let sx0 = ctx.sx0(0.0, &x0).unwrap();
        let mut problem = ForwardProblem::new(&ctx, &settings, None, 0.0, ts.len(), x0, sx0).unwrap();
        problem.work(&mut rdata).unwrap();

        for (it, &t) in ts.iter().enumerate() {
            assert_relative_eq!(rdata.x[[it, 0]], (-p * t).exp(), max_relative = 1e-6);
            assert_relative_eq!(rdata.sx[[it, 0, 0]], -t * (-p * t).exp(), epsilon = 1e-6);
        }
        assert!(rdata.llh.is_nan());
        assert_relative_eq!(rdata.xdot[0], -p * rdata.x[[3, 0]], max_relative = 1e-8);
        assert_relative_eq!(rdata.jacobian[[0, 0]], -p);
        assert!(rdata.diagnostics.numsteps[3] > rdata.diagnostics.numsteps[1]);
        assert_eq!(rdata.diagnostics.numsteps[0], 0);
    }

    /// `x' = 1` crossing `x = 1` at `t = 1`; the reset adds nothing
    fn ramp() -> Model {
        Model::builder(
            "ramp",
            ModelDimensions::new(1, 0).with_events(1, 0),
            |_, _, _, _| Ok(()),
            |xdot, _| {
                xdot[0] = 1.0;
                Ok(())
            },
        )
        .root(|g, pt| {
            g[0] = pt.x[0] - 1.0;
            Ok(())
        })
        .deltax(|delta, _, _, _| {
            delta[0] = 0.0;
            Ok(())
        })
        .build()
        .unwrap()
    }

    #[test]
    fn test_zero_bolus_counts_root() {
        let model = ramp();
        let ctx = ModelContext::new(&model, vec![], vec![], vec![]).unwrap();
        let settings = SimulationSettings::with_tolerances(1e-10, 1e-12);
        let ts = [0.0, 0.5, 2.0];
        let mut rdata = ReturnData::new(model.dims(), &ts, 0, &settings, false);
        let x0 = ctx.x0(0.0).unwrap();
        let mut problem = ForwardProblem::new(&ctx, &settings, None, 0.0, ts.len(), x0, DMatrix::zeros(1, 0)).unwrap();
        assert_eq!(problem.heaviside(), &[0.0]);
        problem.work(&mut rdata).unwrap();

        assert_relative_eq!(rdata.x[[2, 0]], 2.0, max_relative = 1e-8);
        assert_eq!(rdata.nroots, vec![1]);
        assert_eq!(problem.heaviside(), &[1.0]);
        assert_eq!(problem.discontinuities().len(), 1);
        assert_relative_eq!(problem.discontinuities()[0].t, 1.0, epsilon = 1e-8);
    }

    #[test]
    fn test_repeated_root_at_same_time_is_stuck() {
        let model = ramp();
        let ctx = ModelContext::new(&model, vec![], vec![], vec![]).unwrap();
        let settings = SimulationSettings::with_tolerances(1e-10, 1e-12);
        let ts = [0.0, 2.0];
        let mut rdata = ReturnData::new(model.dims(), &ts, 0, &settings, false);
        let x0 = ctx.x0(0.0).unwrap();
        let mut problem = ForwardProblem::new(&ctx, &settings, None, 0.0, ts.len(), x0, DMatrix::zeros(1, 0)).unwrap();

        let status = problem.integrator.solve(&ctx, &problem.heaviside, 2.0).unwrap();
        assert!(matches!(status, SolveStatus::Root));
        problem.sync();
        problem.handle_event(&mut rdata, None).unwrap();
        assert_eq!(rdata.nroots, vec![1]);

        match problem.handle_event(&mut rdata, None) {
            Err(SimulationError::EventStuck { t }) => assert_relative_eq!(t, 1.0, epsilon = 1e-8),
            other => panic!("expected a stuck event, got {other:?}"),
        }
        assert_eq!(rdata.nroots, vec![1]);
    }

    #[test]
    fn test_event_overflow_warns() {
        // rising crossings at 1/12, 13/12, 25/12, falling ones at 5/12, 17/12
        let model = oscillator(1);
        let ctx = ModelContext::new(&model, vec![], vec![], vec![]).unwrap();
        let settings = SimulationSettings::with_tolerances(1e-10, 1e-12);
        let ts = [0.0, 2.2];
        let mut rdata = ReturnData::new(model.dims(), &ts, 0, &settings, false);
        let x0 = ctx.x0(0.0).unwrap();
        let mut problem = ForwardProblem::new(&ctx, &settings, None, 0.0, ts.len(), x0, DMatrix::zeros(2, 0)).unwrap();
        problem.work(&mut rdata).unwrap();
        rdata.warnings = ctx.take_warnings();

        assert_eq!(rdata.nroots, vec![1]);
        assert_relative_eq!(rdata.z[[0, 0]], 1.0 / 12.0, epsilon = 1e-6);
        assert_eq!(problem.discontinuities().len(), 1);
        assert!(rdata.has_warning("TOO_MUCH_EVENT"));
        // three rising and two falling crossings
        assert_eq!(problem.heaviside(), &[1.0]);
    }

    #[test]
    fn test_later_slots_stay_nan() {
        let model = oscillator(4);
        let ctx = ModelContext::new(&model, vec![], vec![], vec![]).unwrap();
        let settings = SimulationSettings::with_tolerances(1e-10, 1e-12);
        let ts = [0.0, 1.5];
        let mut rdata = ReturnData::new(model.dims(), &ts, 0, &settings, false);
        let x0 = ctx.x0(0.0).unwrap();
        let mut problem = ForwardProblem::new(&ctx, &settings, None, 0.0, ts.len(), x0, DMatrix::zeros(2, 0)).unwrap();
        problem.work(&mut rdata).unwrap();

        assert_eq!(rdata.nroots, vec![2]);
        assert_relative_eq!(rdata.z[[0, 0]], 1.0 / 12.0, epsilon = 1e-6);
        assert_relative_eq!(rdata.z[[1, 0]], 13.0 / 12.0, epsilon = 1e-6);
        assert!(rdata.z[[2, 0]].is_nan() && rdata.z[[3, 0]].is_nan());
        // the final-time regularization fills the next slot only
        assert_relative_eq!(rdata.rz[[2, 0]], (2.0 * PI * 1.5).sin() - 0.5, epsilon = 1e-6);
        assert!(rdata.rz[[3, 0]].is_nan());
        // falling crossings at 5/12 and 17/12 are discontinuities as well
        assert_eq!(problem.discontinuities().len(), 4);
        assert!(ctx.take_warnings().is_empty());
    }

    #[test]
    fn test_started_in_event() {
        let dims = ModelDimensions::new(1, 0).with_events(1, 0);
        let model = Model::builder(
            "touching",
            dims,
            |_, _, _, _| Ok(()),
            |xdot, _| {
                xdot[0] = 1.0;
                Ok(())
            },
        )
        .root(|g, pt| {
            g[0] = pt.x[0];
            Ok(())
        })
        .build()
        .unwrap();
        let ctx = ModelContext::new(&model, vec![], vec![], vec![]).unwrap();
        let result = initial_heaviside(&ctx, 0.0, &DVector::zeros(1));
        assert!(matches!(result, Err(SimulationError::StartedInEvent { ie: 0 })));
    }
}
