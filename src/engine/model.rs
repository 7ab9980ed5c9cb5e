use std::borrow::Cow;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use log::{debug, info, warn};
use nalgebra::{DMatrix, DVector};
use parking_lot::Mutex;

use crate::core::autodiff::{Tape, Var};
use crate::error::CalcError;
use crate::io::artifact;

/// Scale applied to the feature sum when no regressor is configured.
pub const DEFAULT_STUB_SCALE: f64 = 1.0;

/// A fitted regression function: one scalar per input row.
/// Implementations must be Thread-Safe (Sync).
pub trait Regressor: Send + Sync {
    /// Input width the regressor was trained on, if fixed.
    fn n_features(&self) -> Option<usize>;

    /// `rows` is `n_samples x n_features`; returns `n_samples` predictions.
    fn predict(&self, rows: &DMatrix<f64>) -> Result<DVector<f64>>;

    /// The differentiable view of this regressor, if it has one.
    fn as_differentiable(&self) -> Option<&dyn DifferentiableRegressor> {
        None
    }

    fn name(&self) -> &str;
}

/// A regressor that can be evaluated on tape variables.
pub trait DifferentiableRegressor: Send + Sync {
    /// `features` already has the regressor's input width.
    fn predict_tracked<'t>(&self, tape: &'t Tape, features: &[Var<'t>]) -> Result<Var<'t>>;
}

// --- Linear model ---

/// `energy = features · coef + intercept`
#[derive(Debug, Clone, PartialEq)]
pub struct LinearRegressor {
    coef: DVector<f64>,
    intercept: f64,
}

impl LinearRegressor {
    pub fn new(coef: Vec<f64>, intercept: f64) -> Self {
        Self {
            coef: DVector::from_vec(coef),
            intercept,
        }
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        artifact::load_linear_regressor(path)
    }

    pub fn coef(&self) -> &DVector<f64> {
        &self.coef
    }

    pub fn intercept(&self) -> f64 {
        self.intercept
    }
}

impl Regressor for LinearRegressor {
    fn n_features(&self) -> Option<usize> {
        Some(self.coef.len())
    }

    fn predict(&self, rows: &DMatrix<f64>) -> Result<DVector<f64>> {
        if rows.ncols() != self.coef.len() {
            bail!(
                "linear model expects {} features, got {}",
                self.coef.len(),
                rows.ncols()
            );
        }
        Ok(rows * &self.coef + DVector::from_element(rows.nrows(), self.intercept))
    }

    fn as_differentiable(&self) -> Option<&dyn DifferentiableRegressor> {
        Some(self)
    }

    fn name(&self) -> &str {
        "linear"
    }
}

impl DifferentiableRegressor for LinearRegressor {
    fn predict_tracked<'t>(&self, tape: &'t Tape, features: &[Var<'t>]) -> Result<Var<'t>> {
        if features.len() != self.coef.len() {
            bail!(
                "linear model expects {} features, got {}",
                self.coef.len(),
                features.len()
            );
        }
        let energy = features
            .iter()
            .zip(self.coef.iter())
            .fold(tape.var(self.intercept), |acc, (&f, &c)| acc + f * c);
        Ok(energy)
    }
}

// --- Closure adapter ---

/// Wraps any `Fn(&DVector<f64>) -> Result<f64>` as a (non-differentiable) [`Regressor`].
pub struct FnRegressor<F> {
    name: String,
    width: Option<usize>,
    func: F,
}

impl<F> FnRegressor<F>
where
    F: Fn(&DVector<f64>) -> Result<f64> + Send + Sync,
{
    pub fn new(name: &str, func: F) -> Self {
        Self {
            name: name.to_string(),
            width: None,
            func,
        }
    }

    pub fn with_width(mut self, width: usize) -> Self {
        self.width = Some(width);
        self
    }
}

impl<F> Regressor for FnRegressor<F>
where
    F: Fn(&DVector<f64>) -> Result<f64> + Send + Sync,
{
    fn n_features(&self) -> Option<usize> {
        self.width
    }

    fn predict(&self, rows: &DMatrix<f64>) -> Result<DVector<f64>> {
        let mut out = DVector::zeros(rows.nrows());
        for i in 0..rows.nrows() {
            let x: DVector<f64> = rows.row(i).transpose();
            out[i] = (self.func)(&x)?;
        }
        Ok(out)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

// --- Lazily loaded artifact ---

/// A linear model read from disk on first use and kept for the lifetime of the handle.
///
/// Share one `Arc<LazyRegressor>` between calculators to load the artifact once per
/// process; tests can pass any other [`Regressor`] instead.
pub struct LazyRegressor {
    path: PathBuf,
    loaded: Mutex<Option<Arc<LinearRegressor>>>,
}

impl LazyRegressor {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            loaded: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.lock().is_some()
    }

    /// Returns the loaded model, reading the artifact if this is the first call.
    pub fn get(&self) -> Result<Arc<LinearRegressor>> {
        let mut slot = self.loaded.lock();
        if let Some(model) = slot.as_ref() {
            return Ok(Arc::clone(model));
        }
        let model = Arc::new(LinearRegressor::from_path(&self.path)?);
        info!(
            "Loaded linear model from {} ({} features)",
            self.path.display(),
            model.coef().len()
        );
        *slot = Some(Arc::clone(&model));
        Ok(model)
    }
}

impl Regressor for LazyRegressor {
    fn n_features(&self) -> Option<usize> {
        // A failed load reports no width here; predict() surfaces the load error.
        self.get().ok().and_then(|m| m.n_features())
    }

    fn predict(&self, rows: &DMatrix<f64>) -> Result<DVector<f64>> {
        self.get()?.predict(rows)
    }

    fn as_differentiable(&self) -> Option<&dyn DifferentiableRegressor> {
        Some(self)
    }

    fn name(&self) -> &str {
        "linear (lazy)"
    }
}

impl DifferentiableRegressor for LazyRegressor {
    fn predict_tracked<'t>(&self, tape: &'t Tape, features: &[Var<'t>]) -> Result<Var<'t>> {
        self.get()?.predict_tracked(tape, features)
    }
}

// --- Energy model ---

/// Maps a feature vector to a scalar energy through an optional regressor.
///
/// Without a regressor the energy is `stub_scale * sum(features)`, which keeps the
/// pipeline runnable (and differentiable) without a trained artifact. Feature vectors
/// whose length differs from the regressor's width are zero-padded or truncated unless
/// `strict_width` is set.
#[derive(Clone)]
pub struct EnergyModel {
    regressor: Option<Arc<dyn Regressor>>,
    stub_scale: f64,
    strict_width: bool,
    width_warned: Arc<AtomicBool>,
}

impl Default for EnergyModel {
    fn default() -> Self {
        Self::stub()
    }
}

impl fmt::Debug for EnergyModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnergyModel")
            .field("regressor", &self.name())
            .field("stub_scale", &self.stub_scale)
            .field("strict_width", &self.strict_width)
            .finish()
    }
}

impl EnergyModel {
    pub fn stub() -> Self {
        Self {
            regressor: None,
            stub_scale: DEFAULT_STUB_SCALE,
            strict_width: false,
            width_warned: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_regressor(regressor: Arc<dyn Regressor>) -> Self {
        Self {
            regressor: Some(regressor),
            ..Self::stub()
        }
    }

    pub fn stub_scale(mut self, scale: f64) -> Self {
        self.stub_scale = scale;
        self
    }

    /// Treat any width mismatch as a [`CalcError::FeatureWidth`] instead of reshaping.
    pub fn strict_width(mut self, strict: bool) -> Self {
        self.strict_width = strict;
        self
    }

    pub fn name(&self) -> &str {
        match &self.regressor {
            Some(r) => r.name(),
            None => "stub",
        }
    }

    pub fn regressor(&self) -> Option<&Arc<dyn Regressor>> {
        self.regressor.as_ref()
    }

    /// True when [`EnergyModel::predict_tracked`] can run.
    pub fn is_differentiable(&self) -> bool {
        match &self.regressor {
            Some(r) => r.as_differentiable().is_some(),
            None => true,
        }
    }

    pub fn predict(&self, features: &DVector<f64>) -> Result<f64, CalcError> {
        let energy = match &self.regressor {
            None => features.sum() * self.stub_scale,
            Some(regressor) => {
                let x = match regressor.n_features() {
                    Some(width) if width != features.len() => {
                        self.check_width(features.len(), width)?;
                        Cow::Owned(fit_width(features, width))
                    }
                    _ => Cow::Borrowed(features),
                };
                let rows = DMatrix::from_row_slice(1, x.len(), x.as_slice());
                let y = regressor
                    .predict(&rows)
                    .map_err(|e| CalcError::computation("energy model", e))?;
                if y.len() != 1 {
                    return Err(CalcError::computation(
                        "energy model",
                        anyhow!("expected one prediction, got {}", y.len()),
                    ));
                }
                y[0]
            }
        };
        ensure_finite(energy)
    }

    pub fn predict_tracked<'t>(
        &self,
        tape: &'t Tape,
        features: &[Var<'t>],
    ) -> Result<Var<'t>, CalcError> {
        let energy = match &self.regressor {
            None => {
                let sum = features
                    .iter()
                    .fold(tape.var(0.0), |acc, &f| acc + f);
                sum * self.stub_scale
            }
            Some(regressor) => {
                let diff = regressor.as_differentiable().ok_or_else(|| {
                    CalcError::CapabilityMismatch(format!(
                        "regressor '{}' does not support gradient tracking",
                        regressor.name()
                    ))
                })?;
                let x = match regressor.n_features() {
                    Some(width) if width != features.len() => {
                        self.check_width(features.len(), width)?;
                        Cow::Owned(fit_width_tracked(tape, features, width))
                    }
                    _ => Cow::Borrowed(features),
                };
                diff.predict_tracked(tape, &x)
                    .map_err(|e| CalcError::computation("energy model", e))?
            }
        };
        ensure_finite(energy.value())?;
        Ok(energy)
    }

    fn check_width(&self, found: usize, expected: usize) -> Result<(), CalcError> {
        if self.strict_width {
            return Err(CalcError::FeatureWidth { expected, found });
        }
        let action = if found < expected {
            "padding with zeros"
        } else {
            "truncating trailing features"
        };
        if !self.width_warned.swap(true, Ordering::Relaxed) {
            warn!(
                "Descriptor produced {} features but model '{}' expects {}; {}",
                found,
                self.name(),
                expected,
                action
            );
        } else {
            debug!("Feature width {} -> {}: {}", found, expected, action);
        }
        Ok(())
    }
}

/// Zero-pads or truncates `features` to `width`.
pub fn fit_width(features: &DVector<f64>, width: usize) -> DVector<f64> {
    DVector::from_fn(width, |i, _| features.get(i).copied().unwrap_or(0.0))
}

/// Tape counterpart of [`fit_width`]; padding entries are constants.
pub fn fit_width_tracked<'t>(tape: &'t Tape, features: &[Var<'t>], width: usize) -> Vec<Var<'t>> {
    let mut out: Vec<Var<'t>> = features.iter().take(width).copied().collect();
    while out.len() < width {
        out.push(tape.var(0.0));
    }
    out
}

fn ensure_finite(energy: f64) -> Result<f64, CalcError> {
    if energy.is_finite() {
        Ok(energy)
    } else {
        Err(CalcError::computation(
            "energy model",
            anyhow!("prediction is not finite ({energy})"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fit_width_pads_and_truncates() {
        let x = DVector::from_vec(vec![1.0, 2.0, 3.0]);
        assert_eq!(fit_width(&x, 5).as_slice(), &[1.0, 2.0, 3.0, 0.0, 0.0]);
        assert_eq!(fit_width(&x, 2).as_slice(), &[1.0, 2.0]);
    }

    #[test]
    fn test_stub_is_scaled_sum() {
        let model = EnergyModel::stub().stub_scale(0.5);
        let x = DVector::from_vec(vec![1.0, 2.0, 3.0]);
        assert_eq!(model.predict(&x).unwrap(), 3.0);
        assert!(model.is_differentiable());
    }

    #[test]
    fn test_linear_model_reshapes_input() {
        let lr: Arc<dyn Regressor> = Arc::new(LinearRegressor::new(vec![1.0, 10.0, 100.0], 0.25));
        let model = EnergyModel::with_regressor(lr);

        let short = DVector::from_vec(vec![2.0]);
        assert_eq!(model.predict(&short).unwrap(), 2.25);

        let long = DVector::from_vec(vec![1.0, 1.0, 1.0, 7.0]);
        assert_eq!(model.predict(&long).unwrap(), 111.25);
    }

    #[test]
    fn test_strict_width_rejects_mismatch() {
        let lr: Arc<dyn Regressor> = Arc::new(LinearRegressor::new(vec![1.0, 1.0], 0.0));
        let model = EnergyModel::with_regressor(lr).strict_width(true);
        let err = model.predict(&DVector::from_vec(vec![1.0])).unwrap_err();
        assert!(matches!(err, CalcError::FeatureWidth { expected: 2, found: 1 }));
    }

    #[test]
    fn test_tracked_linear_gradient_is_coefficients() {
        let lr: Arc<dyn Regressor> = Arc::new(LinearRegressor::new(vec![2.0, -3.0], 1.0));
        let model = EnergyModel::with_regressor(lr);

        let tape = Tape::new();
        let f = [tape.var(0.5), tape.var(4.0)];
        let e = model.predict_tracked(&tape, &f).unwrap();
        assert_eq!(e.value(), 1.0 + 1.0 - 12.0);

        let grad = e.backward();
        assert_eq!(grad.wrt(&f[0]), 2.0);
        assert_eq!(grad.wrt(&f[1]), -3.0);
    }

    #[test]
    fn test_tracked_padding_and_truncation() {
        let wide: Arc<dyn Regressor> = Arc::new(LinearRegressor::new(vec![2.0, -3.0, 5.0, 7.0], 1.0));
        let narrow: Arc<dyn Regressor> = Arc::new(LinearRegressor::new(vec![2.0], 1.0));

        let tape = Tape::new();
        let f = [tape.var(0.5), tape.var(4.0)];

        // Zero padding adds nothing to the value or to the real features' gradient.
        let e = EnergyModel::with_regressor(wide).predict_tracked(&tape, &f).unwrap();
        assert_eq!(e.value(), 1.0 + 1.0 - 12.0);
        let grad = e.backward();
        assert_eq!(grad.wrt(&f[0]), 2.0);
        assert_eq!(grad.wrt(&f[1]), -3.0);

        // Truncated features do not reach the energy.
        let e = EnergyModel::with_regressor(narrow).predict_tracked(&tape, &f).unwrap();
        assert_eq!(e.value(), 2.0);
        let grad = e.backward();
        assert_eq!(grad.wrt(&f[0]), 2.0);
        assert_eq!(grad.wrt(&f[1]), 0.0);
    }

    #[test]
    fn test_fit_width_tracked_pads_with_fresh_zeros() {
        let tape = Tape::new();
        let f = [tape.var(1.5)];
        let out = fit_width_tracked(&tape, &f, 3);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].value(), 1.5);
        assert!(out[1..].iter().all(|v| v.value() == 0.0));

        // Padding is independent of the inputs.
        let grad = (out[1] * 4.0 + out[2] * 9.0).backward();
        assert_eq!(grad.wrt(&f[0]), 0.0);
        assert_eq!(fit_width_tracked(&tape, &f, 0).len(), 0);
    }

    #[test]
    fn test_closure_regressor_is_not_differentiable() {
        let r: Arc<dyn Regressor> = Arc::new(FnRegressor::new("const", |_x: &DVector<f64>| Ok(0.5)));
        let model = EnergyModel::with_regressor(r);
        assert!(!model.is_differentiable());

        let tape = Tape::new();
        let f = [tape.var(1.0)];
        assert!(matches!(
            model.predict_tracked(&tape, &f),
            Err(CalcError::CapabilityMismatch(_))
        ));
    }

    #[test]
    fn test_non_finite_prediction_is_an_error() {
        let r: Arc<dyn Regressor> = Arc::new(FnRegressor::new("nan", |_x: &DVector<f64>| Ok(f64::NAN)));
        let err = EnergyModel::with_regressor(r)
            .predict(&DVector::from_vec(vec![1.0]))
            .unwrap_err();
        assert!(matches!(err, CalcError::Computation { .. }));
    }
}
