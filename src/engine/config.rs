use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::engine::calculator::{Backend, Calculator};
use crate::engine::descriptor::{EllipsoidDescriptor, EllipsoidHypers, Precision, TrackedEllipsoidDescriptor};
use crate::engine::forces::DEFAULT_FD_STEP;
use crate::engine::model::{EnergyModel, LazyRegressor, Regressor};
use crate::error::CalcError;

/// Which descriptor/model representation the calculator runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Plain numeric features; forces only through finite differences.
    #[default]
    Numeric,
    /// Gradient-tracking features; forces from one reverse-mode pass.
    Differentiable,
}

/// Evaluation knobs of a [`Calculator`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalculatorConfig {
    /// Allow finite-difference forces on the numeric backend.
    pub finite_difference: bool,
    /// Skip recomputation when species and positions are bit-identical to the last call.
    pub cache: bool,
    /// Finite-difference displacement (Å).
    pub fd_step: f64,
    /// Evaluate finite-difference displacements on the rayon pool.
    pub parallel_fd: bool,
    /// Multiplies the raw model output before it is stored.
    pub energy_scale: f64,
    /// Multiplies raw forces before they are stored.
    pub force_scale: f64,
}

impl Default for CalculatorConfig {
    fn default() -> Self {
        Self {
            finite_difference: false,
            cache: true,
            fd_step: DEFAULT_FD_STEP,
            parallel_fd: false,
            energy_scale: 1.0,
            force_scale: 1.0,
        }
    }
}

impl CalculatorConfig {
    pub fn validate(&self) -> Result<(), CalcError> {
        if !(self.fd_step.is_finite() && self.fd_step > 0.0) {
            return Err(CalcError::Config(format!(
                "fd_step must be positive, got {}",
                self.fd_step
            )));
        }
        for (name, value) in [
            ("energy_scale", self.energy_scale),
            ("force_scale", self.force_scale),
        ] {
            if !value.is_finite() {
                return Err(CalcError::Config(format!("{name} must be finite, got {value}")));
            }
        }
        Ok(())
    }
}

/// Everything needed to assemble a calculator from a JSON file.
///
/// ```json
/// {
///   "backend": "differentiable",
///   "precision": "double",
///   "model": "lr.json",
///   "descriptor": { "species": [1, 6], "cutoff": 6.0 },
///   "calculator": { "cache": true, "energy_scale": 1.0 }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub backend: BackendKind,
    pub precision: Precision,
    /// Linear-model artifact; the stub model is used when absent.
    pub model: Option<PathBuf>,
    pub descriptor: EllipsoidHypers,
    pub calculator: CalculatorConfig,
}

impl RunConfig {
    pub fn from_json_str(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("Malformed run configuration")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Could not read configuration {}", path.display()))?;
        Self::from_json_str(&text).with_context(|| format!("Invalid configuration {}", path.display()))
    }

    /// Builds the built-in ellipsoid backend of the requested kind.
    pub fn backend(&self) -> Result<Backend, CalcError> {
        let descriptor = EllipsoidDescriptor::new(self.descriptor.clone())?;
        Ok(match self.backend {
            BackendKind::Numeric => Backend::Numeric(Arc::new(descriptor)),
            BackendKind::Differentiable => Backend::Differentiable(Arc::new(
                TrackedEllipsoidDescriptor::new(descriptor, self.precision),
            )),
        })
    }

    /// The energy model, sharing `shared` when given, else lazily loading `self.model`.
    pub fn energy_model(&self, shared: Option<Arc<dyn Regressor>>) -> EnergyModel {
        match (shared, &self.model) {
            (Some(regressor), _) => EnergyModel::with_regressor(regressor),
            (None, Some(path)) => EnergyModel::with_regressor(Arc::new(LazyRegressor::new(path.clone()))),
            (None, None) => EnergyModel::stub(),
        }
    }

    pub fn build(&self) -> Result<Calculator, CalcError> {
        Calculator::new(self.backend()?, self.energy_model(None), self.calculator.clone())
    }
}
