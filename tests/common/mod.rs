#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anisoap_calc::core::domain::Configuration;
use anisoap_calc::engine::descriptor::{Descriptor, FnDescriptor};
use anisoap_calc::engine::model::Regressor;
use anyhow::Result;
use nalgebra::{DMatrix, DVector, Point3};

/// Returns a fixed feature vector and counts how often it was asked.
pub struct CountingDescriptor {
    pub features: Vec<f64>,
    pub calls: Arc<AtomicUsize>,
}

impl CountingDescriptor {
    pub fn new(features: Vec<f64>) -> Self {
        Self {
            features,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Descriptor for CountingDescriptor {
    fn describe(&self, _config: &Configuration) -> Result<DVector<f64>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(DVector::from_vec(self.features.clone()))
    }

    fn name(&self) -> &str {
        "counting stub"
    }
}

/// Atomic numbers as features; blind to positions.
pub fn species_descriptor() -> impl Descriptor {
    FnDescriptor::new("species", |config: &Configuration| {
        Ok(DVector::from_iterator(
            config.len(),
            config.species.iter().map(|&z| z as f64),
        ))
    })
}

/// Flattened Cartesian coordinates as features.
pub fn coordinate_descriptor() -> impl Descriptor {
    FnDescriptor::new("coordinates", |config: &Configuration| {
        Ok(DVector::from_iterator(
            3 * config.len(),
            config.positions.iter().flat_map(|p| [p.x, p.y, p.z]),
        ))
    })
}

/// Regressor with a caller-supplied body that counts its invocations.
pub struct CountingRegressor<F> {
    pub func: F,
    pub calls: Arc<AtomicUsize>,
}

impl<F> CountingRegressor<F>
where
    F: Fn(&DVector<f64>) -> f64 + Send + Sync,
{
    pub fn new(func: F) -> Self {
        Self {
            func,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl<F> Regressor for CountingRegressor<F>
where
    F: Fn(&DVector<f64>) -> f64 + Send + Sync,
{
    fn n_features(&self) -> Option<usize> {
        None
    }

    fn predict(&self, rows: &DMatrix<f64>) -> Result<DVector<f64>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(DVector::from_iterator(
            rows.nrows(),
            (0..rows.nrows()).map(|i| (self.func)(&rows.row(i).transpose())),
        ))
    }

    fn name(&self) -> &str {
        "counting regressor"
    }
}

// --- Frames ---

pub fn single_atom() -> Configuration {
    Configuration::new(vec![1], vec![Point3::origin()])
}

pub fn dimer() -> Configuration {
    Configuration::new(
        vec![1, 8],
        vec![Point3::new(0.0, 0.0, 0.0), Point3::new(0.0, 0.0, 0.96)],
    )
}

/// A small non-symmetric ellipsoid cluster with explicit orientations and shapes.
pub fn ellipsoid_cluster() -> Configuration {
    Configuration::new(
        vec![6, 1, 6, 1],
        vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.7, 0.3, -0.2),
            Point3::new(-0.4, 2.1, 0.5),
            Point3::new(0.9, -1.2, 1.6),
        ],
    )
    .with_orientations(&[
        [1.0, 0.0, 0.0, 0.0],
        [0.9, 0.1, -0.3, 0.2],
        [0.5, 0.5, 0.5, 0.5],
        [0.2, -0.7, 0.1, 0.6],
    ])
    .with_semi_axes(&[
        [2.0, 1.0, 1.0],
        [1.2, 0.8, 0.8],
        [1.5, 1.5, 0.7],
        [1.0, 1.3, 0.9],
    ])
}

/// Smallest representable step away from `x`.
pub fn next_up(x: f64) -> f64 {
    if x == 0.0 {
        f64::from_bits(1)
    } else if x > 0.0 {
        f64::from_bits(x.to_bits() + 1)
    } else {
        f64::from_bits(x.to_bits() - 1)
    }
}
