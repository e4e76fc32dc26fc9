//! Simulation benchmarks
//!
//! Compares the cost of plain simulation, forward sensitivities and adjoint
//! sensitivities on a linear chain of first-order conversions.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use sensim::{
    run_simulation, Conditions, ExpData, LinearSolver, Model, ModelDimensions, SensitivityMethod, SensitivityOrder,
    SimulationSettings,
};

/// x0' = -p0 x0, xi' = p(i-1) x(i-1) - pi xi, observing the last state
fn chain(n: usize) -> Model {
    Model::builder(
        "chain",
        ModelDimensions::new(n, n).with_observables(1),
        |x0, _, _, _| {
            x0[0] = 1.0;
            Ok(())
        },
        |xdot, pt| {
            for i in 0..pt.x.len() {
                let inflow = if i == 0 { 0.0 } else { pt.p[i - 1] * pt.x[i - 1] };
                xdot[i] = inflow - pt.p[i] * pt.x[i];
            }
            Ok(())
        },
    )
    .jacobian(|j, pt| {
        for i in 0..pt.x.len() {
            j[(i, i)] = -pt.p[i];
            if i > 0 {
                j[(i, i - 1)] = pt.p[i - 1];
            }
        }
        Ok(())
    })
    .y(|y, pt| {
        y[0] = pt.x[pt.x.len() - 1];
        Ok(())
    })
    .build()
    .expect("valid chain model")
}

fn data(model: &Model, conditions: &Conditions) -> ExpData {
    let mut edata = ExpData::for_model(model.dims(), conditions.nt());
    for it in 0..conditions.nt() {
        edata.set_measurement(it, 0, 0.1, 0.05);
    }
    edata
}

fn bench_sensitivity_methods(c: &mut Criterion) {
    let mut group = c.benchmark_group("Chain simulation");
    let ts: Vec<f64> = (0..=20).map(|i| 0.5 * f64::from(i)).collect();

    for size in [2, 5, 10, 20].iter() {
        let model = chain(*size);
        let conditions = Conditions::new(ts.clone(), vec![0.7; *size]);
        let edata = data(&model, &conditions);

        let plain = SimulationSettings::default();
        group.bench_with_input(BenchmarkId::new("no_sensitivities", size), size, |b, _| {
            b.iter(|| black_box(run_simulation(&model, &conditions, &plain, Some(&edata)).map(|r| r.llh)));
        });

        for (name, method) in [("forward", SensitivityMethod::Forward), ("adjoint", SensitivityMethod::Adjoint)] {
            let settings = SimulationSettings {
                sensi: SensitivityOrder::First,
                sensi_method: method,
                ..SimulationSettings::default()
            };
            group.bench_with_input(BenchmarkId::new(name, size), size, |b, _| {
                b.iter(|| black_box(run_simulation(&model, &conditions, &settings, Some(&edata)).map(|r| r.llh)));
            });
        }
    }

    group.finish();
}

/// Dense against sparse linear algebra for a larger chain
fn bench_linear_solvers(c: &mut Criterion) {
    let n = 40;
    let model = chain(n);
    let conditions = Conditions::new(vec![0.0, 5.0, 10.0], vec![0.7; n]);

    for (name, solver) in [("dense", LinearSolver::Dense), ("klu", LinearSolver::Klu)] {
        let settings = SimulationSettings {
            linear_solver: solver,
            ..SimulationSettings::default()
        };
        c.bench_function(&format!("chain n=40 {name}"), |b| {
            b.iter(|| black_box(run_simulation(&model, &conditions, &settings, None).map(|r| r.x[[2, n - 1]])));
        });
    }
}

criterion_group!(benches, bench_sensitivity_methods, bench_linear_solvers);
criterion_main!(benches);
