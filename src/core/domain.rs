use nalgebra::{DMatrix, Matrix3, Point3};
use serde::{Deserialize, Serialize};

use crate::core::geometry;
use crate::error::CalcError;

// --- Attribute Keys ---

/// Per-particle orientation quaternion `(w, x, y, z)`.
pub const ORIENTATION_KEY: &str = "c_q";
/// Per-particle ellipsoid semi-axis lengths `(a, b, c)`.
pub const SEMI_AXES_KEY: &str = "c_diameter";

pub const ORIENTATION_WIDTH: usize = 4;
pub const SEMI_AXES_WIDTH: usize = 3;

/// Semi-axes synthesized for frames that carry no shape attribute.
pub const DEFAULT_SEMI_AXES: [f64; 3] = [1.0, 1.0, 1.0];

// --- The Core Entity ---

/// A single frame: species, Cartesian positions (Å) and optional per-particle attributes.
///
/// Attribute matrices hold one row per particle. Their shape is not enforced on
/// construction; descriptors validate it when they consume the frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    pub species: Vec<u32>,
    pub positions: Vec<Point3<f64>>,
    pub orientations: Option<DMatrix<f64>>,
    pub semi_axes: Option<DMatrix<f64>>,
}

/// A validated ellipsoidal particle: body-to-lab rotation plus semi-axes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ellipsoid {
    pub rotation: Matrix3<f64>,
    pub semi_axes: [f64; 3],
}

impl Configuration {
    pub fn new(species: Vec<u32>, positions: Vec<Point3<f64>>) -> Self {
        Self {
            species,
            positions,
            orientations: None,
            semi_axes: None,
        }
    }

    pub fn with_orientations(mut self, rows: &[[f64; 4]]) -> Self {
        self.orientations = Some(rows_to_matrix(rows));
        self
    }

    pub fn with_semi_axes(mut self, rows: &[[f64; 3]]) -> Self {
        self.semi_axes = Some(rows_to_matrix(rows));
        self
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn coordinate(&self, atom: usize, axis: usize) -> f64 {
        self.positions[atom].coords[axis]
    }

    pub fn set_coordinate(&mut self, atom: usize, axis: usize, value: f64) {
        self.positions[atom].coords[axis] = value;
    }

    /// Checks the invariants every evaluation relies on: at least one particle, one
    /// species per position, finite coordinates.
    pub fn validate_layout(&self, frame: usize) -> Result<(), CalcError> {
        if self.is_empty() {
            return Err(CalcError::InvalidConfiguration {
                frame,
                reason: "configuration contains no particles".into(),
            });
        }
        if self.species.len() != self.positions.len() {
            return Err(CalcError::InvalidConfiguration {
                frame,
                reason: format!(
                    "{} species given for {} positions",
                    self.species.len(),
                    self.positions.len()
                ),
            });
        }
        if let Some(atom) = self
            .positions
            .iter()
            .position(|p| p.coords.iter().any(|c| !c.is_finite()))
        {
            return Err(CalcError::InvalidConfiguration {
                frame,
                reason: format!("position of particle {atom} is not finite"),
            });
        }
        Ok(())
    }

    /// Resolves every particle into an [`Ellipsoid`].
    ///
    /// Orientation is mandatory and must be exactly `(N, 4)`; missing semi-axes are
    /// replaced by `default_semi_axes`, present ones must be `(N, 3)` and positive.
    pub fn ellipsoids(
        &self,
        frame: usize,
        default_semi_axes: [f64; 3],
    ) -> Result<Vec<Ellipsoid>, CalcError> {
        let n = self.len();

        let orientations =
            self.orientations
                .as_ref()
                .ok_or_else(|| CalcError::MissingAttribute {
                    frame,
                    attribute: ORIENTATION_KEY.to_string(),
                })?;
        check_shape(frame, ORIENTATION_KEY, orientations, (n, ORIENTATION_WIDTH))?;

        if let Some(axes) = &self.semi_axes {
            check_shape(frame, SEMI_AXES_KEY, axes, (n, SEMI_AXES_WIDTH))?;
        }

        let mut out = Vec::with_capacity(n);
        for i in 0..n {
            let q = [
                orientations[(i, 0)],
                orientations[(i, 1)],
                orientations[(i, 2)],
                orientations[(i, 3)],
            ];
            let rotation = geometry::rotation_from_quaternion(q).ok_or_else(|| {
                CalcError::InvalidAttribute {
                    frame,
                    attribute: ORIENTATION_KEY.to_string(),
                    reason: format!("row {i} is not a valid quaternion: {q:?}"),
                }
            })?;

            let semi_axes = match &self.semi_axes {
                Some(axes) => {
                    let row = [axes[(i, 0)], axes[(i, 1)], axes[(i, 2)]];
                    if row.iter().any(|a| !(a.is_finite() && *a > 0.0)) {
                        return Err(CalcError::InvalidAttribute {
                            frame,
                            attribute: SEMI_AXES_KEY.to_string(),
                            reason: format!("row {i} has non-positive semi-axes: {row:?}"),
                        });
                    }
                    row
                }
                None => default_semi_axes,
            };

            out.push(Ellipsoid {
                rotation,
                semi_axes,
            });
        }
        Ok(out)
    }
}

fn check_shape(
    frame: usize,
    attribute: &str,
    matrix: &DMatrix<f64>,
    expected: (usize, usize),
) -> Result<(), CalcError> {
    let found = matrix.shape();
    if found != expected {
        return Err(CalcError::ShapeMismatch {
            frame,
            attribute: attribute.to_string(),
            expected,
            found,
        });
    }
    Ok(())
}

fn rows_to_matrix<const W: usize>(rows: &[[f64; W]]) -> DMatrix<f64> {
    DMatrix::from_fn(rows.len(), W, |i, j| rows[i][j])
}
