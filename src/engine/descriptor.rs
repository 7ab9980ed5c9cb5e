use anyhow::Result;
use nalgebra::DVector;
use serde::{Deserialize, Serialize};

use crate::core::autodiff::{Real, Tape, Var};
use crate::core::domain::{Configuration, DEFAULT_SEMI_AXES};
use crate::core::geometry;
use crate::error::CalcError;

/// The calculator evaluates one frame at a time; validation errors name this index.
pub const SINGLE_FRAME: usize = 0;

/// Plain-numeric descriptor transform.
/// Implementations must be Thread-Safe (Sync).
pub trait Descriptor: Send + Sync {
    /// Maps a configuration to a flat feature vector.
    fn describe(&self, config: &Configuration) -> Result<DVector<f64>>;

    fn name(&self) -> &str;
}

/// Gradient-tracking descriptor transform.
///
/// `positions` are the tape leaves for the configuration's coordinates (one triple per
/// particle, same order). Returned features must be computed from them so that a backward
/// pass reaches the positions.
pub trait TrackedDescriptor: Send + Sync {
    fn describe_tracked<'t>(
        &self,
        tape: &'t Tape,
        config: &Configuration,
        positions: &[[Var<'t>; 3]],
    ) -> Result<Vec<Var<'t>>>;

    fn name(&self) -> &str;
}

/// Numeric precision of a tracked descriptor's output features.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    #[default]
    Double,
    /// Feature values are rounded to `f32`; gradients pass straight through.
    Single,
}

// --- Closure adapters ---

/// Wraps any `Fn(&Configuration) -> Result<DVector<f64>>` as a [`Descriptor`].
pub struct FnDescriptor<F> {
    name: String,
    func: F,
}

impl<F> FnDescriptor<F>
where
    F: Fn(&Configuration) -> Result<DVector<f64>> + Send + Sync,
{
    pub fn new(name: &str, func: F) -> Self {
        Self {
            name: name.to_string(),
            func,
        }
    }
}

impl<F> Descriptor for FnDescriptor<F>
where
    F: Fn(&Configuration) -> Result<DVector<f64>> + Send + Sync,
{
    fn describe(&self, config: &Configuration) -> Result<DVector<f64>> {
        (self.func)(config)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

// --- Ellipsoidal pair density ---

/// Hyper-parameters of [`EllipsoidDescriptor`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EllipsoidHypers {
    /// Species channels. Empty means a single channel shared by all species.
    pub species: Vec<u32>,
    /// Number of Gaussian radial functions per channel.
    pub n_radial: usize,
    /// Pair cutoff (Å).
    pub cutoff: f64,
    /// Width of each radial Gaussian, in units of the reduced distance.
    pub gaussian_width: f64,
    /// Used for frames without a semi-axes attribute.
    pub default_semi_axes: [f64; 3],
}

impl Default for EllipsoidHypers {
    fn default() -> Self {
        Self {
            species: Vec::new(),
            n_radial: 6,
            cutoff: 7.0,
            gaussian_width: 1.5,
            default_semi_axes: DEFAULT_SEMI_AXES,
        }
    }
}

/// Smooth anisotropic pair density over ellipsoidal particles.
///
/// For every pair `i < j` closer than the cutoff, the separation `r` is reduced by the
/// mean of the two ellipsoids' extents along the pair axis, `x = r / σ_ij`, and
/// accumulated into Gaussian bins `exp(-(x - μ_n)² / 2w²)` weighted by a cosine cutoff.
/// One block of `n_radial` bins exists per unordered species pair.
#[derive(Debug, Clone)]
pub struct EllipsoidDescriptor {
    hypers: EllipsoidHypers,
    species: Vec<u32>,
    centres: Vec<f64>,
}

impl EllipsoidDescriptor {
    pub fn new(hypers: EllipsoidHypers) -> Result<Self, CalcError> {
        if hypers.n_radial == 0 {
            return Err(CalcError::Config("n_radial must be at least 1".into()));
        }
        if !(hypers.cutoff.is_finite() && hypers.cutoff > 0.0) {
            return Err(CalcError::Config(format!("invalid cutoff {}", hypers.cutoff)));
        }
        if !(hypers.gaussian_width.is_finite() && hypers.gaussian_width > 0.0) {
            return Err(CalcError::Config(format!(
                "invalid gaussian_width {}",
                hypers.gaussian_width
            )));
        }
        if hypers
            .default_semi_axes
            .iter()
            .any(|a| !(a.is_finite() && *a > 0.0))
        {
            return Err(CalcError::Config(format!(
                "default semi-axes must be positive, got {:?}",
                hypers.default_semi_axes
            )));
        }

        let mut species = hypers.species.clone();
        species.sort_unstable();
        species.dedup();

        let step = hypers.cutoff / hypers.n_radial as f64;
        let centres = (0..hypers.n_radial).map(|n| n as f64 * step).collect();

        Ok(Self {
            hypers,
            species,
            centres,
        })
    }

    pub fn hypers(&self) -> &EllipsoidHypers {
        &self.hypers
    }

    fn n_channels(&self) -> usize {
        let m = self.species.len().max(1);
        m * (m + 1) / 2
    }

    pub fn n_features(&self) -> usize {
        self.n_channels() * self.hypers.n_radial
    }

    fn species_slot(&self, frame: usize, z: u32) -> Result<usize, CalcError> {
        if self.species.is_empty() {
            return Ok(0);
        }
        self.species
            .binary_search(&z)
            .map_err(|_| CalcError::InvalidConfiguration {
                frame,
                reason: format!(
                    "species {z} is not one of the descriptor channels {:?}",
                    self.species
                ),
            })
    }

    /// Index of the unordered pair (a, b) in the upper triangle of an m x m table.
    fn channel(&self, a: usize, b: usize) -> usize {
        let (a, b) = if a <= b { (a, b) } else { (b, a) };
        let m = self.species.len().max(1);
        a * m - a * a.saturating_sub(1) / 2 + (b - a)
    }

    /// The descriptor body, shared by the plain and the tracked variant.
    pub fn compute<S: Real>(
        &self,
        config: &Configuration,
        frame: usize,
        positions: &[[S; 3]],
        zero: S,
    ) -> Result<Vec<S>, CalcError> {
        config.validate_layout(frame)?;
        if positions.len() != config.len() {
            return Err(CalcError::InvalidConfiguration {
                frame,
                reason: format!(
                    "{} coordinate triples given for {} particles",
                    positions.len(),
                    config.len()
                ),
            });
        }
        let ellipsoids = config.ellipsoids(frame, self.hypers.default_semi_axes)?;
        let slots = config
            .species
            .iter()
            .map(|&z| self.species_slot(frame, z))
            .collect::<Result<Vec<_>, _>>()?;

        let n_radial = self.hypers.n_radial;
        let cutoff = self.hypers.cutoff;
        let cutoff_sq = cutoff * cutoff;
        let inv_width = 1.0 / self.hypers.gaussian_width;

        let mut features = vec![zero; self.n_features()];

        for i in 0..positions.len() {
            for j in (i + 1)..positions.len() {
                let d = [
                    positions[j][0] - positions[i][0],
                    positions[j][1] - positions[i][1],
                    positions[j][2] - positions[i][2],
                ];
                let r_sq = d[0] * d[0] + d[1] * d[1] + d[2] * d[2];
                let r_sq_value = r_sq.value();
                // Coincident particles have no pair axis; skip them along with distant ones.
                if r_sq_value >= cutoff_sq || r_sq_value == 0.0 {
                    continue;
                }

                let r = r_sq.sqrt();
                let u = [d[0] / r, d[1] / r, d[2] / r];
                let (e_i, e_j) = (&ellipsoids[i], &ellipsoids[j]);
                let sigma = (geometry::projected_extent(&e_i.rotation, &e_i.semi_axes, &u)
                    + geometry::projected_extent(&e_j.rotation, &e_j.semi_axes, &u))
                    * 0.5;
                let x = r / sigma;
                let fc = geometry::cosine_cutoff(r, cutoff);

                let base = self.channel(slots[i], slots[j]) * n_radial;
                for (k, &mu) in self.centres.iter().enumerate() {
                    let t = (x - mu) * inv_width;
                    let g = (t * t * -0.5).exp();
                    features[base + k] = features[base + k] + g * fc;
                }
            }
        }

        Ok(features)
    }
}

impl Descriptor for EllipsoidDescriptor {
    fn describe(&self, config: &Configuration) -> Result<DVector<f64>> {
        let positions: Vec<[f64; 3]> = config.positions.iter().map(|p| [p.x, p.y, p.z]).collect();
        let features = self.compute(config, SINGLE_FRAME, &positions, 0.0)?;
        Ok(DVector::from_vec(features))
    }

    fn name(&self) -> &str {
        "ellipsoid-pair-density"
    }
}

/// Gradient-tracking wrapper around [`EllipsoidDescriptor`].
#[derive(Debug, Clone)]
pub struct TrackedEllipsoidDescriptor {
    inner: EllipsoidDescriptor,
    precision: Precision,
}

impl TrackedEllipsoidDescriptor {
    pub fn new(inner: EllipsoidDescriptor, precision: Precision) -> Self {
        Self { inner, precision }
    }

    pub fn inner(&self) -> &EllipsoidDescriptor {
        &self.inner
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }
}

impl TrackedDescriptor for TrackedEllipsoidDescriptor {
    fn describe_tracked<'t>(
        &self,
        tape: &'t Tape,
        config: &Configuration,
        positions: &[[Var<'t>; 3]],
    ) -> Result<Vec<Var<'t>>> {
        let features = self
            .inner
            .compute(config, SINGLE_FRAME, positions, tape.var(0.0))?;
        Ok(match self.precision {
            Precision::Double => features,
            Precision::Single => features.into_iter().map(Var::round_to_f32).collect(),
        })
    }

    fn name(&self) -> &str {
        "ellipsoid-pair-density (tracked)"
    }
}
