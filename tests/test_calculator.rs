mod common;

use std::sync::Arc;

use anisoap_calc::core::domain::Configuration;
use anisoap_calc::engine::calculator::{Backend, Calculator, Property};
use anisoap_calc::engine::config::CalculatorConfig;
use anisoap_calc::engine::descriptor::{EllipsoidDescriptor, EllipsoidHypers};
use anisoap_calc::engine::model::{EnergyModel, FnRegressor, LinearRegressor, Regressor};
use anisoap_calc::error::CalcError;
use common::{dimer, next_up, single_atom, CountingDescriptor, CountingRegressor};
use nalgebra::{DMatrix, DVector};

fn constant_model(value: f64) -> EnergyModel {
    EnergyModel::with_regressor(Arc::new(FnRegressor::new("constant", move |_x: &DVector<f64>| {
        Ok(value)
    })))
}

fn stub_calculator(descriptor: &Arc<CountingDescriptor>, model: EnergyModel, config: CalculatorConfig) -> Calculator {
    Calculator::new(Backend::Numeric(descriptor.clone()), model, config).unwrap()
}

fn ellipsoid_calculator() -> Calculator {
    let descriptor = EllipsoidDescriptor::new(EllipsoidHypers::default()).unwrap();
    Calculator::new(
        Backend::Numeric(Arc::new(descriptor)),
        EnergyModel::stub(),
        CalculatorConfig::default(),
    )
    .unwrap()
}

#[test]
fn test_single_atom_constant_model() {
    let descriptor = Arc::new(CountingDescriptor::new(vec![1.0, 2.0]));
    let mut calc = stub_calculator(&descriptor, constant_model(0.5), CalculatorConfig::default());

    let results = calc.calculate(&single_atom(), &[Property::Energy]).unwrap();
    assert_eq!(results.energy, Some(0.5));
    assert!(results.forces.is_none());
}

#[test]
fn test_stub_model_sums_features() {
    let descriptor = Arc::new(CountingDescriptor::new(vec![1.0, 2.0]));
    let mut calc = stub_calculator(&descriptor, EnergyModel::stub(), CalculatorConfig::default());
    assert_eq!(calc.energy(&single_atom()).unwrap(), 3.0);
}

#[test]
fn test_cache_hit_skips_descriptor() {
    let descriptor = Arc::new(CountingDescriptor::new(vec![1.0, 2.0]));
    let regressor = Arc::new(CountingRegressor::new(|x: &DVector<f64>| x.sum()));
    let model = EnergyModel::with_regressor(regressor.clone());
    let mut calc = stub_calculator(&descriptor, model, CalculatorConfig::default());
    let frame = dimer();

    let first = calc.calculate(&frame, &[Property::Energy]).unwrap().clone();
    let second = calc.calculate(&frame, &[Property::Energy]).unwrap().clone();

    assert_eq!(first, second);
    assert_eq!(first.energy, Some(3.0));
    assert_eq!(descriptor.calls(), 1);
    assert_eq!(regressor.calls(), 1);
}

#[test]
fn test_no_cache_is_deterministic() {
    let descriptor = Arc::new(CountingDescriptor::new(vec![0.1, 0.2, 0.3]));
    let config = CalculatorConfig {
        cache: false,
        ..Default::default()
    };
    let mut calc = stub_calculator(&descriptor, EnergyModel::stub(), config);
    let frame = dimer();

    let a = calc.energy(&frame).unwrap();
    let b = calc.energy(&frame).unwrap();
    assert_eq!(a.to_bits(), b.to_bits());
    assert_eq!(descriptor.calls(), 2);
}

#[test]
fn test_single_ulp_change_invalidates_cache() {
    let descriptor = Arc::new(CountingDescriptor::new(vec![1.0]));
    let mut calc = stub_calculator(&descriptor, EnergyModel::stub(), CalculatorConfig::default());
    let frame = dimer();
    calc.energy(&frame).unwrap();

    for atom in 0..frame.len() {
        for axis in 0..3 {
            let mut moved = frame.clone();
            moved.set_coordinate(atom, axis, next_up(frame.coordinate(atom, axis)));
            let before = descriptor.calls();
            calc.energy(&moved).unwrap();
            assert_eq!(descriptor.calls(), before + 1, "atom {atom} axis {axis}");
            // Back to the original so each displacement is a single-coordinate change.
            calc.energy(&frame).unwrap();
        }
    }
}

#[test]
fn test_species_change_invalidates_cache() {
    let descriptor = Arc::new(CountingDescriptor::new(vec![1.0]));
    let mut calc = stub_calculator(&descriptor, EnergyModel::stub(), CalculatorConfig::default());
    let frame = dimer();
    calc.energy(&frame).unwrap();

    let mut swapped = frame.clone();
    swapped.species = vec![8, 1];
    calc.energy(&swapped).unwrap();
    assert_eq!(descriptor.calls(), 2);
}

#[test]
fn test_cache_requires_requested_properties() {
    let descriptor = Arc::new(CountingDescriptor::new(vec![1.0]));
    let config = CalculatorConfig {
        finite_difference: true,
        ..Default::default()
    };
    let mut calc = stub_calculator(&descriptor, EnergyModel::stub(), config);
    let frame = dimer();

    calc.calculate(&frame, &[Property::Energy]).unwrap();
    assert_eq!(descriptor.calls(), 1);

    // Forces were not stored yet: energy + 6N displaced evaluations.
    let results = calc
        .calculate(&frame, &[Property::Energy, Property::Forces])
        .unwrap();
    assert!(results.forces.is_some());
    assert_eq!(descriptor.calls(), 2 + 6 * frame.len());

    // Energy alone is now served from the stored results.
    calc.calculate(&frame, &[Property::Energy]).unwrap();
    assert_eq!(descriptor.calls(), 2 + 6 * frame.len());
}

#[test]
fn test_forces_without_capability_touch_nothing() {
    let descriptor = Arc::new(CountingDescriptor::new(vec![1.0, 2.0]));
    let regressor = Arc::new(CountingRegressor::new(|x: &DVector<f64>| x.sum()));
    let model = EnergyModel::with_regressor(regressor.clone());
    let mut calc = stub_calculator(&descriptor, model, CalculatorConfig::default());
    assert!(!calc.supports_forces());

    let err = calc
        .calculate(&dimer(), &[Property::Energy, Property::Forces])
        .unwrap_err();
    assert!(matches!(err, CalcError::CapabilityMismatch(_)));
    assert_eq!(descriptor.calls(), 0);
    assert_eq!(regressor.calls(), 0);
    assert!(calc.results().is_empty());
}

#[test]
fn test_unsupported_property() {
    let descriptor = Arc::new(CountingDescriptor::new(vec![1.0]));
    let mut calc = stub_calculator(&descriptor, EnergyModel::stub(), CalculatorConfig::default());

    let err = calc
        .calculate(&dimer(), &[Property::Energy, Property::Stress])
        .unwrap_err();
    assert!(matches!(err, CalcError::UnsupportedProperty(ref p) if p == "stress"));

    let err = calc.calculate_named(&dimer(), &["energy", "magmom"]).unwrap_err();
    assert!(matches!(err, CalcError::UnsupportedProperty(ref p) if p == "magmom"));
    assert_eq!(descriptor.calls(), 0);

    let results = calc.calculate_named(&dimer(), &["energy"]).unwrap();
    assert_eq!(results.energy, Some(1.0));
}

#[test]
fn test_missing_orientation_names_frame_and_key() {
    let mut calc = ellipsoid_calculator();
    let err = calc.calculate(&dimer(), &[Property::Energy]).unwrap_err();

    assert!(err.is_validation());
    let message = err.to_string();
    assert!(message.contains("frame at index 0"), "{message}");
    assert!(message.contains("missing a required attribute 'c_q'"), "{message}");
}

#[test]
fn test_orientation_shape_mismatch() {
    let mut calc = ellipsoid_calculator();
    let mut frame = dimer();
    frame.orientations = Some(DMatrix::from_element(2, 3, 0.5));

    let err = calc.calculate(&frame, &[Property::Energy]).unwrap_err();
    match err {
        CalcError::ShapeMismatch {
            frame,
            attribute,
            expected,
            found,
        } => {
            assert_eq!(frame, 0);
            assert_eq!(attribute, "c_q");
            assert_eq!(expected, (2, 4));
            assert_eq!(found, (2, 3));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_missing_shape_uses_defaults() {
    let mut calc = ellipsoid_calculator();
    let frame = dimer().with_orientations(&[[1.0, 0.0, 0.0, 0.0]; 2]);
    let implicit = calc.energy(&frame).unwrap();

    let explicit = frame.clone().with_semi_axes(&[[1.0, 1.0, 1.0]; 2]);
    calc.reset();
    assert_eq!(calc.energy(&explicit).unwrap(), implicit);
}

#[test]
fn test_failure_keeps_previous_results() {
    let descriptor = Arc::new(CountingDescriptor::new(vec![2.0]));
    let mut calc = stub_calculator(&descriptor, EnergyModel::stub(), CalculatorConfig::default());
    let frame = dimer();
    let stored = calc.calculate(&frame, &[Property::Energy]).unwrap().clone();

    let broken = Configuration::new(vec![1], frame.positions.clone());
    let err = calc.calculate(&broken, &[Property::Energy]).unwrap_err();
    assert!(matches!(err, CalcError::InvalidConfiguration { .. }));
    assert_eq!(calc.results(), &stored);

    // The fingerprint survived too: the original frame is still a cache hit.
    let calls = descriptor.calls();
    calc.calculate(&frame, &[Property::Energy]).unwrap();
    assert_eq!(descriptor.calls(), calls);
}

#[test]
fn test_model_errors_are_wrapped() {
    let descriptor = Arc::new(CountingDescriptor::new(vec![1.0]));
    let failing: Arc<dyn Regressor> = Arc::new(FnRegressor::new("failing", |_x: &DVector<f64>| {
        anyhow::bail!("model exploded")
    }));
    let mut calc = stub_calculator(&descriptor, EnergyModel::with_regressor(failing), CalculatorConfig::default());

    let err = calc.calculate(&dimer(), &[Property::Energy]).unwrap_err();
    assert!(matches!(err, CalcError::Computation { stage: "energy model", .. }));
    assert!(!err.is_validation());
    assert!(calc.results().is_empty());
}

#[test]
fn test_output_scaling() {
    let regressor: Arc<dyn Regressor> = Arc::new(LinearRegressor::new(vec![0.5, 0.5], 1.0));
    let descriptor = Arc::new(CountingDescriptor::new(vec![1.0, 3.0]));
    let config = CalculatorConfig {
        energy_scale: -2.0,
        ..Default::default()
    };
    let mut calc = stub_calculator(&descriptor, EnergyModel::with_regressor(regressor), config);
    assert_eq!(calc.energy(&single_atom()).unwrap(), -6.0);
}

#[test]
fn test_reset_forgets_cache() {
    let descriptor = Arc::new(CountingDescriptor::new(vec![1.0]));
    let mut calc = stub_calculator(&descriptor, EnergyModel::stub(), CalculatorConfig::default());
    let frame = dimer();

    calc.energy(&frame).unwrap();
    calc.reset();
    assert!(calc.results().is_empty());
    calc.energy(&frame).unwrap();
    assert_eq!(descriptor.calls(), 2);
}

#[test]
fn test_invalid_config_is_rejected() {
    let descriptor = Arc::new(CountingDescriptor::new(vec![1.0]));
    let config = CalculatorConfig {
        fd_step: -1.0,
        ..Default::default()
    };
    let err = Calculator::new(Backend::Numeric(descriptor), EnergyModel::stub(), config).unwrap_err();
    assert!(matches!(err, CalcError::Config(_)));
}
