//! Entry point of a single run.

use nalgebra::{DMatrix, DVector};
use sensim_types::{Conditions, ModelDimensions, SensitivityOrder, SimulationSettings};

use crate::backward::BackwardProblem;
use crate::chain_rule::{apply_chain_rule, recover_augmented_sensitivities};
use crate::data::{ExpData, ReturnData};
use crate::error::{Result, SimulationError, SimulationFailure};
use crate::forward::{initial_heaviside, ForwardProblem};
use crate::model::{Model, ModelContext};
use crate::steadystate::SteadyStateProblem;

/// Simulate `model` under `conditions`, computing the sensitivities and
/// objective requested in `settings`.
///
/// On failure the return data written up to that point is handed back with
/// the error; the objective and its gradients are set to `NaN`.
pub fn run_simulation(
    model: &Model,
    conditions: &Conditions,
    settings: &SimulationSettings,
    edata: Option<&ExpData>,
) -> std::result::Result<ReturnData, SimulationFailure> {
    let dims = model.dims();
    let mut rdata = ReturnData::new(dims, &conditions.ts, conditions.nplist(), settings, edata.is_some());

    let result = check_inputs(dims, conditions, settings, edata).and_then(|()| {
        if dims.nx == 0 {
            return Ok(());
        }
        let p = conditions.p.iter().map(|&v| settings.pscale.unscale(v)).collect();
        let ctx = ModelContext::new(model, p, conditions.k.clone(), conditions.plist.clone())?;
        let outcome = simulate(&ctx, conditions, settings, edata, &mut rdata);
        rdata.warnings.extend(ctx.take_warnings());
        outcome
    });

    match result {
        Ok(()) => {
            log::debug!("{}: llh = {}", model.name(), rdata.llh);
            Ok(rdata)
        }
        Err(error) => {
            log::error!("{}: simulation failed: {error}", model.name());
            rdata.invalidate();
            Err(SimulationFailure {
                error,
                rdata: Box::new(rdata),
            })
        }
    }
}

fn check_inputs(
    dims: &ModelDimensions,
    conditions: &Conditions,
    settings: &SimulationSettings,
    edata: Option<&ExpData>,
) -> Result<()> {
    settings.validate()?;
    SimulationError::check_len("parameters", dims.np, conditions.p.len())?;
    SimulationError::check_len("constants", dims.nk, conditions.k.len())?;
    if let Some(&ip) = conditions.plist.iter().find(|&&ip| ip >= dims.np) {
        return Err(SimulationError::setup(format!("plist refers to unknown parameter {ip}")));
    }
    if conditions.ts.windows(2).any(|w| w[1] < w[0]) {
        return Err(SimulationError::setup("timepoints must be non-decreasing"));
    }
    if conditions.ts.first().is_some_and(|&t| t < conditions.t0) {
        return Err(SimulationError::setup("timepoints must not precede t0"));
    }
    if let Some(x0) = &conditions.x0 {
        SimulationError::check_len("initial state", dims.nx, x0.len())?;
    }
    if let Some(sx0) = &conditions.sx0 {
        SimulationError::check_len("initial sensitivities", dims.nx * conditions.nplist(), sx0.len())?;
    }
    if let Some(edata) = edata {
        edata.check(dims, conditions.nt())?;
    }
    Ok(())
}

fn simulate(
    ctx: &ModelContext<'_>,
    conditions: &Conditions,
    settings: &SimulationSettings,
    edata: Option<&ExpData>,
    rdata: &mut ReturnData,
) -> Result<()> {
    let dims = ctx.dims();
    let t0 = conditions.t0;
    let nplist = ctx.nplist();
    let sensitivities = settings.computes_sensitivities();

    let mut x0 = match &conditions.x0 {
        Some(x0) => DVector::from_column_slice(x0),
        None => ctx.x0(t0)?,
    };
    let mut sx0 = match (&conditions.sx0, sensitivities) {
        (Some(sx0), true) => DMatrix::from_column_slice(dims.nx, nplist, sx0),
        (None, true) => ctx.sx0(t0, &x0)?,
        (_, false) => DMatrix::zeros(dims.nx, nplist),
    };

    if settings.newton.preequilibration {
        let heaviside = initial_heaviside(ctx, t0, &x0)?;
        let mut steady_state = SteadyStateProblem::new(settings, t0, x0);
        let info = steady_state.work(ctx, &heaviside)?;
        if sensitivities {
            sx0 = steady_state.sensitivities(ctx, &heaviside)?;
        }
        x0 = steady_state.x().clone();
        log::info!("preequilibrated by {:?} (wrms {:.3e})", info.method, info.wrms);
        rdata.steady_state = Some(info);
    }

    let mut fwd = ForwardProblem::new(ctx, settings, edata, t0, conditions.nt(), x0, sx0)?;
    if let Err(error) = fwd.work(rdata) {
        if let Err(inner) = fwd.store_final(rdata) {
            log::debug!("no final right-hand side after the failure: {inner}");
        }
        return Err(error);
    }

    if settings.is_adjoint() && edata.is_some() {
        let mut bwd = BackwardProblem::new(ctx, &fwd);
        bwd.work(&mut fwd, t0, rdata)?;
    }

    if settings.is_adjoint() && settings.sensi == SensitivityOrder::Second {
        recover_augmented_sensitivities(dims, ctx.plist(), rdata);
    }
    apply_chain_rule(settings, dims, ctx.p(), ctx.k(), ctx.plist(), edata.is_some(), rdata);
    Ok(())
}
