//! On-disk form of a fitted linear regressor.
//!
//! The artifact is JSON exported from a scikit-learn style linear model:
//!
//! ```json
//! { "coef": [0.12, -0.40, ...], "intercept": -1.7, "n_features_in": 168 }
//! ```
//!
//! `coef` may also be a single-row nested array and `intercept` a one-element array,
//! which is how multi-output estimators such as `RidgeCV` store them.

use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::engine::model::LinearRegressor;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Coefficients {
    Flat(Vec<f64>),
    Rows(Vec<Vec<f64>>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Intercept {
    Scalar(f64),
    Array(Vec<f64>),
}

impl Default for Intercept {
    fn default() -> Self {
        Intercept::Scalar(0.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearArtifact {
    pub coef: Coefficients,
    #[serde(default)]
    pub intercept: Intercept,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n_features_in: Option<usize>,
}

impl LinearArtifact {
    pub fn from_json_str(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("Malformed linear model artifact")
    }

    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize linear model artifact")
    }

    pub fn into_regressor(self) -> Result<LinearRegressor> {
        let coef = match self.coef {
            Coefficients::Flat(c) => c,
            Coefficients::Rows(mut rows) => {
                if rows.len() != 1 {
                    bail!("expected a single-output model, found {} coefficient rows", rows.len());
                }
                rows.remove(0)
            }
        };
        let intercept = match self.intercept {
            Intercept::Scalar(v) => v,
            Intercept::Array(v) if v.len() == 1 => v[0],
            Intercept::Array(v) => bail!("expected one intercept, found {}", v.len()),
        };

        if coef.is_empty() {
            bail!("linear model has no coefficients");
        }
        if let Some(n) = self.n_features_in {
            if n != coef.len() {
                bail!(
                    "n_features_in is {} but {} coefficients were stored",
                    n,
                    coef.len()
                );
            }
        }
        if coef.iter().any(|c| !c.is_finite()) || !intercept.is_finite() {
            bail!("linear model contains non-finite parameters");
        }

        Ok(LinearRegressor::new(coef, intercept))
    }
}

impl From<&LinearRegressor> for LinearArtifact {
    fn from(model: &LinearRegressor) -> Self {
        Self {
            coef: Coefficients::Flat(model.coef().iter().copied().collect()),
            intercept: Intercept::Scalar(model.intercept()),
            n_features_in: Some(model.coef().len()),
        }
    }
}

pub fn load_linear_regressor(path: &Path) -> Result<LinearRegressor> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Could not read model artifact at {}", path.display()))?;
    LinearArtifact::from_json_str(&text)
        .and_then(LinearArtifact::into_regressor)
        .with_context(|| format!("Invalid model artifact {}", path.display()))
}

pub fn save_linear_regressor(model: &LinearRegressor, path: &Path) -> Result<()> {
    let text = LinearArtifact::from(model).to_json_string()?;
    fs::write(path, text)
        .with_context(|| format!("Could not write model artifact to {}", path.display()))
}
