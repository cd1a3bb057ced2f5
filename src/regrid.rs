//! # Regridding
//!
//! Moves fields from the regular 0.25° latitude/longitude grid to the reduced
//! Gaussian grid of the model.
//!
//! Two steps are involved:
//!
//! 1. [`roll_longitude`] re-centres the longitude origin. The feed publishes
//!    rows starting at 180°W; after a circular shift by half the row width the
//!    first column sits on the Greenwich meridian.
//! 2. [`Regridder`] interpolates bilinearly onto the target points. The
//!    stencil (four source indices and weights per target point) depends only
//!    on the two grid definitions, so it is computed once per run and reused
//!    for every field.

use crate::grid::{ReducedGaussianGrid, RegularLatLonGrid};
use ndarray::{Array1, Array2, ArrayView2, s};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegridError {
    #[error("Field shape {actual:?} does not match source grid shape {expected:?}")]
    ShapeMismatch {
        expected: (usize, usize),
        actual: (usize, usize),
    },
}

/// Circular left shift of every row by half the row width.
///
/// For even widths the shift is its own inverse: rolling twice returns the
/// input unchanged.
pub fn roll_longitude(values: ArrayView2<f64>) -> Array2<f64> {
    let (rows, columns) = values.dim();
    let shift = columns / 2;
    let mut rolled = Array2::zeros((rows, columns));
    rolled
        .slice_mut(s![.., ..columns - shift])
        .assign(&values.slice(s![.., shift..]));
    rolled
        .slice_mut(s![.., columns - shift..])
        .assign(&values.slice(s![.., ..shift]));
    rolled
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Stencil {
    cells: [(usize, usize); 4],
    weights: [f64; 4],
}

impl Stencil {
    fn apply(&self, values: &ArrayView2<f64>) -> f64 {
        self.cells
            .iter()
            .zip(self.weights.iter())
            .map(|(&cell, &weight)| weight * values[cell])
            .sum()
    }
}

/// Precomputed bilinear interpolation from a regular grid to a reduced
/// Gaussian grid.
#[derive(Debug, Clone)]
pub struct Regridder {
    source: RegularLatLonGrid,
    target_name: String,
    stencils: Vec<Stencil>,
}

impl Regridder {
    pub fn new(source: &RegularLatLonGrid, target: &ReducedGaussianGrid) -> Self {
        let stencils = target
            .points()
            .map(|(lat, lon)| stencil_for(source, lat, lon))
            .collect();

        Self {
            source: *source,
            target_name: target.name().to_string(),
            stencils,
        }
    }

    pub fn source(&self) -> &RegularLatLonGrid {
        &self.source
    }

    pub fn target_name(&self) -> &str {
        &self.target_name
    }

    /// Number of points produced per field.
    pub fn target_size(&self) -> usize {
        self.stencils.len()
    }

    /// Interpolates one field (already re-centred) onto the target grid.
    pub fn interpolate(&self, values: ArrayView2<f64>) -> Result<Array1<f64>, RegridError> {
        let expected = self.source.shape();
        if values.dim() != expected {
            return Err(RegridError::ShapeMismatch {
                expected,
                actual: values.dim(),
            });
        }

        Ok(self
            .stencils
            .iter()
            .map(|stencil| stencil.apply(&values))
            .collect())
    }
}

/// One-shot regrid. Prefer a shared [`Regridder`] when more than one field is
/// moved between the same pair of grids.
pub fn regrid(
    values: ArrayView2<f64>,
    source: &RegularLatLonGrid,
    target: &ReducedGaussianGrid,
) -> Result<Array1<f64>, RegridError> {
    Regridder::new(source, target).interpolate(values)
}

fn stencil_for(source: &RegularLatLonGrid, lat: f64, lon: f64) -> Stencil {
    let (nlat, nlon) = source.shape();

    let y = ((90.0 - lat) / source.dlat).clamp(0.0, (nlat - 1) as f64);
    let i0 = (y.floor() as usize).min(nlat - 2);
    let wy = y - i0 as f64;

    let x = lon.rem_euclid(360.0) / source.dlon;
    let x0 = x.floor();
    let wx = x - x0;
    let j0 = (x0 as usize) % nlon;
    let j1 = (j0 + 1) % nlon;

    Stencil {
        cells: [(i0, j0), (i0, j1), (i0 + 1, j0), (i0 + 1, j1)],
        weights: [
            (1.0 - wy) * (1.0 - wx),
            (1.0 - wy) * wx,
            wy * (1.0 - wx),
            wy * wx,
        ],
    }
}
