//! Simulate a two-state conversion chain and print states and sensitivities.
//!
//! Usage: `sensim [settings.json]`

use std::process::ExitCode;

use sensim::{run_simulation, Conditions, Model, ModelDimensions, SensitivityOrder, SimulationSettings};

/// `x1' = -p0 x1`, `x2' = p0 x1 - p1 x2`
fn conversion_chain() -> sensim::Result<Model> {
    Model::builder(
        "conversion_chain",
        ModelDimensions::new(2, 2).with_observables(1),
        |x0, _, _, _| {
            x0[0] = 1.0;
            x0[1] = 0.0;
            Ok(())
        },
        |xdot, pt| {
            xdot[0] = -pt.p[0] * pt.x[0];
            xdot[1] = pt.p[0] * pt.x[0] - pt.p[1] * pt.x[1];
            Ok(())
        },
    )
    .y(|y, pt| {
        y[0] = pt.x[1];
        Ok(())
    })
    .build()
}

fn main() -> ExitCode {
    env_logger::init();

    let settings = match std::env::args().nth(1) {
        Some(path) => match SimulationSettings::load(&path) {
            Ok(settings) => settings,
            Err(e) => {
                eprintln!("cannot read settings from {path}: {e}");
                return ExitCode::FAILURE;
            }
        },
        None => SimulationSettings {
            sensi: SensitivityOrder::First,
            ..SimulationSettings::default()
        },
    };

    let model = match conversion_chain() {
        Ok(model) => model,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };
    let ts: Vec<f64> = (0..=10).map(|i| 0.5 * f64::from(i)).collect();
    let conditions = Conditions::new(ts, vec![1.0, 1.0]);

    let rdata = match run_simulation(&model, &conditions, &settings, None) {
        Ok(rdata) => rdata,
        Err(failure) => {
            eprintln!("{failure}");
            return ExitCode::FAILURE;
        }
    };

    println!("{:>6} {:>12} {:>12} {:>12}", "t", "x1", "x2", "dx2/dp0");
    for (it, t) in rdata.ts.iter().enumerate() {
        let sensitivity = if rdata.has_state_sensitivities() {
            rdata.sx[[it, 1, 0]]
        } else {
            f64::NAN
        };
        println!(
            "{t:>6.2} {:>12.6} {:>12.6} {:>12.6}",
            rdata.x[[it, 0]],
            rdata.x[[it, 1]],
            sensitivity
        );
    }
    // one JSON object per warning on stderr
    for warning in &rdata.warnings {
        match serde_json::to_string(warning) {
            Ok(line) => eprintln!("{line}"),
            Err(_) => eprintln!("{warning}"),
        }
    }
    ExitCode::SUCCESS
}
