//! Backward pass for adjoint sensitivities.
//!
//! Starting from the objective gradient at the last timepoint, the adjoint
//! state is integrated back to `t0`. Data points and recorded
//! discontinuities are visited in reverse order of the forward pass: data
//! points add their `dJy/dx`, discontinuities apply the adjoint jumps and
//! undo the Heaviside updates. The gradient follows from the adjoint state
//! and quadratures at `t0`.

use nalgebra::{DMatrix, DVector};

use crate::data::ReturnData;
use crate::error::Result;
use crate::forward::{rising, subtract_gradient, Discontinuity, ForwardProblem};
use crate::model::ModelContext;

pub struct BackwardProblem<'a> {
    ctx: &'a ModelContext<'a>,
    heaviside: Vec<f64>,
    t: f64,
    xb: DVector<f64>,
    xqb: DVector<f64>,
}

impl<'a> BackwardProblem<'a> {
    /// Start at the final point of a completed forward pass
    pub fn new(ctx: &'a ModelContext<'a>, fwd: &ForwardProblem<'_>) -> Self {
        let dims = ctx.dims();
        Self {
            ctx,
            heaviside: fwd.heaviside().to_vec(),
            t: fwd.t(),
            xb: DVector::zeros(dims.nx),
            xqb: DVector::zeros(dims.nj * ctx.nplist()),
        }
    }

    pub fn heaviside(&self) -> &[f64] {
        &self.heaviside
    }

    pub fn xb(&self) -> &DVector<f64> {
        &self.xb
    }

    pub fn xqb(&self) -> &DVector<f64> {
        &self.xqb
    }

    /// Integrate back to `t0` and subtract the adjoint gradient from
    /// `rdata.sllh` and `rdata.s2llh`
    pub fn work(&mut self, fwd: &mut ForwardProblem<'_>, t0: f64, rdata: &mut ReturnData) -> Result<()> {
        let ctx = self.ctx;
        let nxtrue = ctx.dims().nxtrue;
        let nt = rdata.nt();
        if nt == 0 {
            return Ok(());
        }

        add_objective_gradient(&mut self.xb, &fwd.data_gradients[nt - 1], nxtrue);
        add_objective_gradient(&mut self.xb, &fwd.terminal_gradient, nxtrue);
        fwd.integrator.setup_b(ctx, &self.heaviside, &self.xb, &self.xqb)?;
        self.t = fwd.integrator.t_b();
        rdata.diagnostics_b.record(nt - 1, &fwd.integrator.counters_b());

        let mut points = nt - 1;
        let mut events = fwd.discontinuities.len();
        loop {
            let t_point = (points > 0).then(|| rdata.ts[points - 1]);
            let t_event = (events > 0).then(|| fwd.discontinuities[events - 1].t);
            let tnext = match (t_point, t_event) {
                (Some(a), Some(b)) => a.max(b),
                (Some(a), None) | (None, Some(a)) => a,
                (None, None) => break,
            };
            if tnext < self.t {
                self.solve_to(fwd, tnext)?;
            }

            // the data point was recorded after any reset at the same time
            if t_point == Some(tnext) {
                let it = points - 1;
                add_objective_gradient(&mut self.xb, &fwd.data_gradients[it], nxtrue);
                rdata.diagnostics_b.record(it, &fwd.integrator.counters_b());
                points -= 1;
            } else {
                let disc = &fwd.discontinuities[events - 1];
                self.handle_event(disc, &fwd.event_gradients)?;
                events -= 1;
            }

            fwd.integrator.reinit_b(self.t, &self.xb);
            fwd.integrator.quad_reinit_b(&self.xqb);
            fwd.integrator.calc_ic_b(ctx, &self.heaviside)?;
        }

        if self.t > t0 {
            self.solve_to(fwd, t0)?;
        }
        log::debug!("backward pass reached t0 = {t0} after {} steps", fwd.integrator.counters_b().steps);

        let gradient = self.initial_gradient(&fwd.sx0);
        subtract_gradient(rdata, &gradient);
        Ok(())
    }

    fn solve_to(&mut self, fwd: &mut ForwardProblem<'_>, tout: f64) -> Result<()> {
        fwd.integrator.solve_b(self.ctx, &self.heaviside, tout)?;
        self.t = fwd.integrator.t_b();
        self.xb.copy_from(fwd.integrator.xb());
        self.xqb.copy_from(fwd.integrator.xqb());
        Ok(())
    }

    /// Adjoint jumps of a discontinuity, in reverse
    fn handle_event(&mut self, disc: &Discontinuity, event_gradients: &[Vec<Option<DMatrix<f64>>>]) -> Result<()> {
        let ctx = self.ctx;
        let nxtrue = ctx.dims().nxtrue;
        let pt = ctx.point(disc.t, disc.x.as_slice(), disc.dx.as_slice(), &self.heaviside);
        let xb_post = self.xb.clone();
        for ie in rising(&disc.root_info) {
            self.xb += ctx.deltaxb(ie, &pt, &disc.xdot, &disc.xdot_old, &xb_post)?;
            self.xqb += ctx.deltaqb(ie, &pt, &disc.xdot, &disc.xdot_old, &xb_post)?;
            let recorded = disc.slots[ie].and_then(|slot| event_gradients[ie][slot].as_ref());
            if let Some(djzdx) = recorded {
                add_objective_gradient(&mut self.xb, djzdx, nxtrue);
            }
        }
        for (h, &direction) in self.heaviside.iter_mut().zip(&disc.root_info) {
            *h -= f64::from(direction);
        }
        Ok(())
    }

    /// `xB(t0)ᵀ sx0 + xQB(t0)` per objective component, `nj x nplist`
    fn initial_gradient(&self, sx0: &DMatrix<f64>) -> DMatrix<f64> {
        let dims = self.ctx.dims();
        let (nj, nxtrue) = (dims.nj, dims.nxtrue);
        let nplist = self.ctx.nplist();
        DMatrix::from_fn(nj, nplist, |ij, ip| {
            let through_state: f64 = (0..nxtrue)
                .map(|ix| {
                    if ij == 0 {
                        self.xb[ix] * sx0[(ix, ip)]
                    } else {
                        self.xb[ix + ij * nxtrue] * sx0[(ix, ip)] + self.xb[ix] * sx0[(ix + ij * nxtrue, ip)]
                    }
                })
                .sum();
            through_state + self.xqb[ij + ip * nj]
        })
    }
}

/// Add an `nj x nx` objective gradient to the adjoint state, objective
/// component `iJ` going to the block `iJ * nxtrue..`
fn add_objective_gradient(xb: &mut DVector<f64>, gradient: &DMatrix<f64>, nxtrue: usize) {
    for ij in 0..gradient.nrows() {
        for ix in 0..nxtrue {
            if let Some(value) = xb.get_mut(ix + ij * nxtrue) {
                *value += gradient[(ij, ix)];
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::ExpData;
    use crate::model::Model;
    use approx::assert_relative_eq;
    use sensim_types::{ModelDimensions, SensitivityMethod, SensitivityOrder, SimulationSettings};

    fn settings(method: SensitivityMethod) -> SimulationSettings {
        SimulationSettings {
            sensi: SensitivityOrder::First,
            sensi_method: method,
            ..SimulationSettings::with_tolerances(1e-10, 1e-12)
        }
    }

    /// `x' = -p0 x`, `x(0) = p1`, observed directly
    fn decay() -> Model {
        Model::builder(
            "decay",
            ModelDimensions::new(1, 2).with_observables(1),
            |x0, _, p, _| {
                x0[0] = p[1];
                Ok(())
            },
            |xdot, pt| {
                xdot[0] = -pt.p[0] * pt.x[0];
                Ok(())
            },
        )
        .y(|y, pt| {
            y[0] = pt.x[0];
            Ok(())
        })
        .build()
        .unwrap()
    }

    fn gradient(model: &Model, method: SensitivityMethod, edata: &ExpData, ts: &[f64]) -> (f64, Vec<f64>) {
        let ctx = ModelContext::new(model, vec![0.8, 2.0], vec![], vec![0, 1]).unwrap();
        let settings = settings(method);
        let mut rdata = ReturnData::new(model.dims(), ts, 2, &settings, true);
        let x0 = ctx.x0(0.0).unwrap();
        let sx0 = ctx.sx0(0.0, &x0).unwrap();
        let mut fwd = ForwardProblem::new(&ctx, &settings, Some(edata), 0.0, ts.len(), x0, sx0).unwrap();
        fwd.work(&mut rdata).unwrap();
        if settings.is_adjoint() {
            let mut bwd = BackwardProblem::new(&ctx, &fwd);
            bwd.work(&mut fwd, 0.0, &mut rdata).unwrap();
        }
        (rdata.llh, rdata.sllh)
    }

    #[test]
    fn test_adjoint_matches_forward_gradient() {
        let model = decay();
        let ts = [0.0, 0.5, 1.0, 3.0];
        let edata = ExpData::from_observables(
            &[vec![2.1], vec![1.3], vec![0.95], vec![0.2]],
            &[vec![0.1], vec![0.1], vec![0.2], vec![0.1]],
        )
        .unwrap();
        let (llh_f, sllh_f) = gradient(&model, SensitivityMethod::Forward, &edata, &ts);
        let (llh_a, sllh_a) = gradient(&model, SensitivityMethod::Adjoint, &edata, &ts);
        assert_relative_eq!(llh_f, llh_a, max_relative = 1e-8);
        for (f, a) in sllh_f.iter().zip(&sllh_a) {
            assert_relative_eq!(*f, *a, max_relative = 1e-4, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_heaviside_restored_after_replay() {
        // x' = 1 with a root at x = 1 and x = 2.5
        let dims = ModelDimensions::new(1, 1).with_events(2, 0).with_observables(1);
        let model = Model::builder(
            "ramp",
            dims,
            |_, _, _, _| Ok(()),
            |xdot, pt| {
                xdot[0] = pt.p[0];
                Ok(())
            },
        )
        .root(|g, pt| {
            g[0] = pt.x[0] - 1.0;
            g[1] = pt.x[0] - 2.5;
            Ok(())
        })
        .y(|y, pt| {
            y[0] = pt.x[0];
            Ok(())
        })
        .build()
        .unwrap();
        let ctx = ModelContext::new(&model, vec![1.0], vec![], vec![0]).unwrap();
        let settings = settings(SensitivityMethod::Adjoint);
        let ts = [0.0, 2.0, 3.0];
        let mut edata = ExpData::for_model(model.dims(), ts.len());
        edata.set_measurement(2, 0, 3.2, 0.5);
        let mut rdata = ReturnData::new(model.dims(), &ts, 1, &settings, true);
        let x0 = ctx.x0(0.0).unwrap();
        let sx0 = ctx.sx0(0.0, &x0).unwrap();
        let mut fwd = ForwardProblem::new(&ctx, &settings, Some(&edata), 0.0, ts.len(), x0, sx0).unwrap();
        let initial = fwd.heaviside().to_vec();
        fwd.work(&mut rdata).unwrap();
        assert_eq!(fwd.heaviside(), &[1.0, 1.0]);

        let mut bwd = BackwardProblem::new(&ctx, &fwd);
        bwd.work(&mut fwd, 0.0, &mut rdata).unwrap();
        assert_eq!(bwd.heaviside(), initial.as_slice());
        // x(3) = 3 p, so dJ/dp = 3 (3 p - m) / sigma^2
        assert_relative_eq!(rdata.sllh[0], -3.0 * (3.0 - 3.2) / 0.25, max_relative = 1e-4);
    }
}
