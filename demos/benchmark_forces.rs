use anisoap_calc::core::domain::Configuration;
use anisoap_calc::engine::calculator::{Backend, Calculator, Property};
use anisoap_calc::engine::config::CalculatorConfig;
use anisoap_calc::engine::descriptor::{EllipsoidDescriptor, EllipsoidHypers, Precision, TrackedEllipsoidDescriptor};
use anisoap_calc::engine::model::{EnergyModel, LinearRegressor};
use nalgebra::Point3;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::sync::Arc;
use std::time::Instant;

fn random_frame(n: usize, box_size: f64, rng: &mut ChaCha8Rng) -> Configuration {
    let species = (0..n).map(|i| if i % 2 == 0 { 6 } else { 1 }).collect();
    let positions = (0..n)
        .map(|_| {
            Point3::new(
                rng.gen_range(0.0..box_size),
                rng.gen_range(0.0..box_size),
                rng.gen_range(0.0..box_size),
            )
        })
        .collect();
    let quats: Vec<[f64; 4]> = (0..n)
        .map(|_| [rng.gen_range(0.1..1.0), rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0)])
        .collect();
    let axes: Vec<[f64; 3]> = (0..n)
        .map(|_| [rng.gen_range(0.8..2.0), rng.gen_range(0.8..2.0), rng.gen_range(0.8..2.0)])
        .collect();
    Configuration::new(species, positions)
        .with_orientations(&quats)
        .with_semi_axes(&axes)
}

fn time_forces(label: &str, calc: &mut Calculator, frame: &Configuration) {
    let start = Instant::now();
    let result = calc.calculate(frame, &[Property::Energy, Property::Forces]);
    let duration = start.elapsed();
    match result {
        Ok(r) => println!("{label:<24} {duration:>12?}  E = {:.6}", r.energy.unwrap_or(f64::NAN)),
        Err(e) => println!("{label:<24} failed: {e}"),
    }
}

fn main() {
    let mut rng = ChaCha8Rng::seed_from_u64(7);
    let frame = random_frame(64, 12.0, &mut rng);

    let hypers = EllipsoidHypers {
        species: vec![1, 6],
        ..Default::default()
    };
    let descriptor = match EllipsoidDescriptor::new(hypers) {
        Ok(d) => d,
        Err(e) => {
            eprintln!("bad hypers: {e}");
            return;
        }
    };
    let coef = (0..descriptor.n_features()).map(|_| rng.gen_range(-0.1..0.1)).collect();
    let model = EnergyModel::with_regressor(Arc::new(LinearRegressor::new(coef, -3.0)));

    let fd = CalculatorConfig {
        finite_difference: true,
        cache: false,
        ..Default::default()
    };
    let numeric = Backend::Numeric(Arc::new(descriptor.clone()));
    let tracked = Backend::Differentiable(Arc::new(TrackedEllipsoidDescriptor::new(
        descriptor,
        Precision::Double,
    )));

    let runs = [
        ("finite differences", numeric.clone(), fd.clone()),
        ("parallel finite diff.", numeric, CalculatorConfig { parallel_fd: true, ..fd.clone() }),
        ("reverse mode", tracked, fd),
    ];
    for (label, backend, config) in runs {
        match Calculator::new(backend, model.clone(), config) {
            Ok(mut calc) => time_forces(label, &mut calc, &frame),
            Err(e) => println!("{label:<24} failed: {e}"),
        }
    }
}
