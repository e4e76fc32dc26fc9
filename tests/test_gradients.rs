//! Objective gradient consistency tests
//!
//! The log-likelihood gradient is computed three ways and compared:
//! forward sensitivities, adjoint sensitivities and central finite
//! differences of the log-likelihood. The models include state resets at
//! time-triggered and state-triggered events so that the sensitivity and
//! adjoint jumps are exercised.

use approx::assert_relative_eq;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use sensim::{
    run_simulation, Conditions, ExpData, Model, ModelDimensions, ParameterScaling, SecondOrderMode,
    SensitivityMethod, SensitivityOrder, SimulationSettings,
};

/// Decay with a unit dose at t = p2:
/// x' = -p0 x, x(0) = p1, x -> x + 1 when t crosses p2
fn dosing() -> Model {
    Model::builder(
        "dosing",
        ModelDimensions::new(1, 3).with_observables(1).with_events(1, 0),
        |x0, _, p, _| {
            x0[0] = p[1];
            Ok(())
        },
        |xdot, pt| {
            xdot[0] = -pt.p[0] * pt.x[0];
            Ok(())
        },
    )
    .root(|g, pt| {
        g[0] = pt.t - pt.p[2];
        Ok(())
    })
    .deltax(|delta, _, _, _| {
        delta[0] = 1.0;
        Ok(())
    })
    .y(|y, pt| {
        y[0] = pt.x[0];
        Ok(())
    })
    .build()
    .unwrap()
}

/// Growth with division: x' = p0 x, x(0) = 1, x -> x / 2 when x crosses p1
fn division() -> Model {
    Model::builder(
        "division",
        ModelDimensions::new(1, 2).with_observables(1).with_events(1, 1),
        |x0, _, _, _| {
            x0[0] = 1.0;
            Ok(())
        },
        |xdot, pt| {
            xdot[0] = pt.p[0] * pt.x[0];
            Ok(())
        },
    )
    .root(|g, pt| {
        g[0] = pt.x[0] - pt.p[1];
        Ok(())
    })
    .deltax(|delta, _, pt, _| {
        delta[0] = -0.5 * pt.x[0];
        Ok(())
    })
    .y(|y, pt| {
        y[0] = pt.x[0];
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

fn settings(method: SensitivityMethod, pscale: ParameterScaling) -> SimulationSettings {
    SimulationSettings {
        sensi: SensitivityOrder::First,
        sensi_method: method,
        pscale,
        ..SimulationSettings::with_tolerances(1e-11, 1e-13)
    }
}

/// Synthetic data with reproducible noise
fn synthetic_data(model: &Model, conditions: &Conditions, sigma: f64, seed: u64) -> ExpData {
    let truth = run_simulation(model, conditions, &SimulationSettings::with_tolerances(1e-10, 1e-12), None).unwrap();
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let noise = Normal::new(0.0, sigma).unwrap();
    let mut edata = ExpData::for_model(model.dims(), conditions.nt());
    for it in 0..conditions.nt() {
        // leave some measurements out
        if rng.gen_bool(0.85) {
            edata.set_measurement(it, 0, truth.y[[it, 0]] + noise.sample(&mut rng), sigma);
        }
    }
    edata
}

fn llh(model: &Model, conditions: &Conditions, pscale: ParameterScaling, edata: &ExpData) -> f64 {
    let settings = SimulationSettings {
        pscale,
        ..SimulationSettings::with_tolerances(1e-12, 1e-14)
    };
    run_simulation(model, conditions, &settings, Some(edata)).unwrap().llh
}

/// Central differences of the log-likelihood in the scaled parameters
fn finite_difference_gradient(
    model: &Model,
    conditions: &Conditions,
    pscale: ParameterScaling,
    edata: &ExpData,
) -> Vec<f64> {
    let step = 1e-5;
    (0..conditions.p.len())
        .map(|ip| {
            let mut up = conditions.clone();
            let mut down = conditions.clone();
            up.p[ip] += step;
            down.p[ip] -= step;
            (llh(model, &up, pscale, edata) - llh(model, &down, pscale, edata)) / (2.0 * step)
        })
        .collect()
}

fn assert_gradients_agree(model: &Model, conditions: &Conditions, pscale: ParameterScaling, edata: &ExpData) {
    let forward = run_simulation(model, conditions, &settings(SensitivityMethod::Forward, pscale), Some(edata))
        .unwrap();
    let adjoint = run_simulation(model, conditions, &settings(SensitivityMethod::Adjoint, pscale), Some(edata))
        .unwrap();
    let fd = finite_difference_gradient(model, conditions, pscale, edata);

    assert_relative_eq!(forward.llh, adjoint.llh, max_relative = 1e-8);
    for ip in 0..fd.len() {
        assert_relative_eq!(forward.sllh[ip], fd[ip], max_relative = 1e-3, epsilon = 1e-4);
        assert_relative_eq!(adjoint.sllh[ip], fd[ip], max_relative = 1e-3, epsilon = 1e-4);
        assert_relative_eq!(forward.sllh[ip], adjoint.sllh[ip], max_relative = 1e-3, epsilon = 1e-5);
    }
}

/// x' = -p0 x, x(0) = p1, observed directly
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

/// `decay` augmented with its own sensitivities `s_k = dx/dp_k`; the
/// objective carries `dJ/dp_k` along as components `1..=2`
fn decay_with_sensitivities() -> Model {
    let dims = ModelDimensions::new(1, 2)
        .with_observables(1)
        .augmented(SecondOrderMode::Full, 3);
    Model::builder(
        "decay_o2",
        dims,
        |x0, _, p, _| {
            x0[0] = p[1];
            x0[1] = 0.0;
            x0[2] = 1.0;
            Ok(())
        },
        |xdot, pt| {
            let (p0, x) = (pt.p[0], pt.x);
            xdot[0] = -p0 * x[0];
            xdot[1] = -p0 * x[1] - x[0];
            xdot[2] = -p0 * x[2];
            Ok(())
        },
    )
    .jacobian(|jac, pt| {
        let p0 = pt.p[0];
        jac.fill(0.0);
        jac[(0, 0)] = -p0;
        jac[(1, 0)] = -1.0;
        jac[(1, 1)] = -p0;
        jac[(2, 2)] = -p0;
        Ok(())
    })
    .dxdotdp(|out, ip, pt| {
        if ip == 0 {
            out[0] = -pt.x[0];
            out[1] = -pt.x[1];
            out[2] = -pt.x[2];
        }
        Ok(())
    })
    .qbdot(|out, ip, pt, xb| {
        if ip == 0 {
            out[0] = xb[0] * pt.x[0];
            out[1] = xb[0] * pt.x[1] + xb[1] * pt.x[0];
            out[2] = xb[0] * pt.x[2] + xb[2] * pt.x[0];
        }
        Ok(())
    })
    .y(|y, pt| {
        y.copy_from_slice(&pt.x[..3]);
        Ok(())
    })
    .jy(|out, iy, args| {
        let sigma = args.sigma[iy];
        let r = args.values[iy] - args.measurement;
        out[0] = 0.5 * (2.0 * std::f64::consts::PI * sigma * sigma).ln() + 0.5 * (r / sigma).powi(2);
        out[1] = r / (sigma * sigma) * args.values[1];
        out[2] = r / (sigma * sigma) * args.values[2];
        Ok(())
    })
    .djydy(|out, iy, args| {
        let s2 = args.sigma[iy] * args.sigma[iy];
        let r = args.values[iy] - args.measurement;
        out.fill(0.0);
        out[(0, 0)] = r / s2;
        out[(1, 0)] = args.values[1] / s2;
        out[(1, 1)] = r / s2;
        out[(2, 0)] = args.values[2] / s2;
        out[(2, 2)] = r / s2;
        Ok(())
    })
    .build()
    .unwrap()
}

#[test]
fn test_decay_gradients_agree() {
    let model = decay();
    let conditions = Conditions::new(vec![0.0, 0.5, 1.0, 2.0, 4.0], vec![0.6, 1.5]);
    let edata = synthetic_data(&model, &conditions, 0.1, 1);
    assert_gradients_agree(&model, &conditions, ParameterScaling::None, &edata);
}

#[test]
fn test_dosing_gradients_agree() {
    let model = dosing();
    let conditions = Conditions::new(vec![0.5, 1.0, 1.5, 2.5, 3.0], vec![0.6, 2.0, 1.2]);
    let edata = synthetic_data(&model, &conditions, 0.05, 2);
    assert_gradients_agree(&model, &conditions, ParameterScaling::None, &edata);
}

#[test]
fn test_dosing_analytic_solution() {
    let model = dosing();
    let (p0, p1, p2) = (0.6, 2.0, 1.2);
    let conditions = Conditions::new(vec![1.0, 2.0, 3.0], vec![p0, p1, p2]);
    let settings = settings(SensitivityMethod::Forward, ParameterScaling::None);
    let rdata = run_simulation(&model, &conditions, &settings, None).unwrap();

    assert_eq!(rdata.nroots, vec![1]);
    for (it, &t) in rdata.ts.iter().enumerate() {
        let mut x = p1 * (-p0 * t).exp();
        let mut dxdp2 = 0.0;
        if t > p2 {
            x += (-p0 * (t - p2)).exp();
            dxdp2 = p0 * (-p0 * (t - p2)).exp();
        }
        assert_relative_eq!(rdata.x[[it, 0]], x, max_relative = 1e-6);
        assert_relative_eq!(rdata.sx[[it, 0, 2]], dxdp2, epsilon = 1e-5);
        assert_relative_eq!(rdata.sx[[it, 0, 1]], (-p0 * t).exp(), max_relative = 1e-6);
    }
}

#[test]
fn test_division_gradients_agree() {
    let model = division();
    let conditions = Conditions::new(vec![0.25, 0.5, 1.0, 1.25, 1.5], vec![0.8, 2.0]);
    let mut edata = synthetic_data(&model, &conditions, 0.1, 3);
    // division time ln(2) / 0.8
    edata.set_event_measurement(0, 0, 0.85, 0.05);
    assert_gradients_agree(&model, &conditions, ParameterScaling::None, &edata);
}

#[test]
fn test_log10_gradient_matches_finite_differences() {
    let model = division();
    let conditions = Conditions::new(vec![0.25, 0.5, 1.0, 1.5], vec![0.8f64.log10(), 2.0f64.log10()]);
    let unscaled = Conditions::new(conditions.ts.clone(), vec![0.8, 2.0]);
    let edata = synthetic_data(&model, &unscaled, 0.1, 4);
    assert_gradients_agree(&model, &conditions, ParameterScaling::Log10, &edata);

    // the scaled gradient is the unscaled one times p ln 10
    let scaled = run_simulation(
        &model,
        &conditions,
        &settings(SensitivityMethod::Forward, ParameterScaling::Log10),
        Some(&edata),
    )
    .unwrap();
    let plain = run_simulation(
        &model,
        &unscaled,
        &settings(SensitivityMethod::Forward, ParameterScaling::None),
        Some(&edata),
    )
    .unwrap();
    assert_relative_eq!(scaled.llh, plain.llh, max_relative = 1e-8);
    for (ip, &p) in unscaled.p.iter().enumerate() {
        let back = scaled.sllh[ip] / (p * std::f64::consts::LN_10);
        assert_relative_eq!(back, plain.sllh[ip], max_relative = 1e-8);
        assert_relative_eq!(scaled.sx[[2, 0, ip]] / (p * std::f64::consts::LN_10), plain.sx[[2, 0, ip]], max_relative = 1e-8);
    }
}

#[test]
fn test_sigma_from_data_has_no_sensitivity() {
    let model = dosing();
    let conditions = Conditions::new(vec![0.5, 2.0], vec![0.6, 2.0, 1.2]);
    let mut edata = ExpData::for_model(model.dims(), 2);
    edata.set_measurement(0, 0, 1.4, 0.2);
    edata.set_measurement(1, 0, 1.0, f64::NAN);
    let rdata = run_simulation(
        &model,
        &conditions,
        &settings(SensitivityMethod::Forward, ParameterScaling::None),
        Some(&edata),
    )
    .unwrap();
    assert_eq!(rdata.sigmay[[0, 0]], 0.2);
    // missing sigma falls back to the model's default of 1
    assert_eq!(rdata.sigmay[[1, 0]], 1.0);
    assert!((0..3).all(|ip| rdata.ssigmay[[0, 0, ip]] == 0.0));
}

#[test]
fn test_dose_at_measurement_time() {
    // the dose lands exactly on the second timepoint, whose measurement sees
    // the dosed state
    let model = dosing();
    let (p0, p1) = (0.6, 2.0);
    let conditions = Conditions::new(vec![0.5, 1.0, 2.0], vec![p0, p1, 1.0]);
    let mut edata = ExpData::for_model(model.dims(), 3);
    edata.set_measurement(0, 0, 1.5, 0.1);
    edata.set_measurement(1, 0, 2.0, 0.1);
    edata.set_measurement(2, 0, 1.4, 0.1);
    let pscale = ParameterScaling::None;
    let forward = run_simulation(&model, &conditions, &settings(SensitivityMethod::Forward, pscale), Some(&edata))
        .unwrap();
    let adjoint = run_simulation(&model, &conditions, &settings(SensitivityMethod::Adjoint, pscale), Some(&edata))
        .unwrap();

    assert_relative_eq!(forward.x[[1, 0]], p1 * (-p0).exp() + 1.0, max_relative = 1e-8);
    assert_relative_eq!(forward.sx[[1, 0, 2]], p0, max_relative = 1e-6);
    assert_relative_eq!(forward.llh, adjoint.llh, max_relative = 1e-8);
    for ip in 0..3 {
        assert_relative_eq!(forward.sllh[ip], adjoint.sllh[ip], max_relative = 1e-4, epsilon = 1e-5);
    }
    // x(1) jumps in the dose time, so only the rate and the initial amount
    // have a central difference
    let fd = finite_difference_gradient(&model, &conditions, pscale, &edata);
    for ip in 0..2 {
        assert_relative_eq!(forward.sllh[ip], fd[ip], max_relative = 1e-3, epsilon = 1e-4);
    }
}

#[test]
fn test_second_order_matches_differenced_gradient() {
    let ts = vec![0.5, 1.0, 2.0, 4.0];
    let measurements = [(1.5, 0.2), (1.0, 0.2), (0.55, 0.1), (0.12, 0.1)];
    let p = [0.7, 2.0];

    let model = decay_with_sensitivities();
    let mut edata = ExpData::for_model(model.dims(), ts.len());
    for (it, &(m, sigma)) in measurements.iter().enumerate() {
        edata.set_measurement(it, 0, m, sigma);
    }
    let second = SimulationSettings {
        sensi: SensitivityOrder::Second,
        ..settings(SensitivityMethod::Forward, ParameterScaling::None)
    };
    let rdata = run_simulation(&model, &Conditions::new(ts.clone(), p.to_vec()), &second, Some(&edata)).unwrap();
    assert_eq!(rdata.s2llh.shape(), [2, 2]);

    // Hessian column ip from central differences of the first-order gradient
    let plain = decay();
    let mut plain_data = ExpData::for_model(plain.dims(), ts.len());
    for (it, &(m, sigma)) in measurements.iter().enumerate() {
        plain_data.set_measurement(it, 0, m, sigma);
    }
    let first = settings(SensitivityMethod::Forward, ParameterScaling::None);
    let gradient = |p: Vec<f64>| {
        run_simulation(&plain, &Conditions::new(ts.clone(), p), &first, Some(&plain_data))
            .unwrap()
            .sllh
    };
    let step = 1e-4;
    for ip in 0..2 {
        let mut up = p.to_vec();
        let mut down = p.to_vec();
        up[ip] += step;
        down[ip] -= step;
        let (g_up, g_down) = (gradient(up), gradient(down));
        for k in 0..2 {
            let fd = (g_up[k] - g_down[k]) / (2.0 * step);
            assert_relative_eq!(rdata.s2llh[[k, ip]], fd, max_relative = 1e-3, epsilon = 1e-3);
        }
    }

    // the leading component is the ordinary gradient
    let reference = gradient(p.to_vec());
    for ip in 0..2 {
        assert_relative_eq!(rdata.sllh[ip], reference[ip], max_relative = 1e-6, epsilon = 1e-8);
    }
}
