//! # Grid Geometry
//!
//! Descriptions of the two grids the pipeline moves data between:
//!
//! - [`RegularLatLonGrid`]: the global regular latitude/longitude grid the
//!   open-data feed publishes (0.25° x 0.25°, 721 x 1440 points). After
//!   longitude re-centring the first row is 90°N and the first column 0°E.
//! - [`ReducedGaussianGrid`]: the latitude-banded grid the forecast model was
//!   trained on (N320 by default). Latitudes are Gaussian latitudes and each
//!   band carries its own number of equally spaced points.
//!
//! Grid definitions are pure geometry; nothing here looks at field values.

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use thiserror::Error;

/// Minimum number of points on the polar bands of a classic reduced grid.
pub const CLASSIC_MIN_POINTS: usize = 18;

/// Points per latitude of the operational N320 grid, pole to equator.
const N320_PL: [usize; 320] = [
    18, 25, 36, 40, 45, 50, 60, 64, 72, 75, 90, 90,
    96, 108, 120, 120, 125, 135, 135, 144, 150, 160, 162, 180,
    180, 180, 192, 200, 200, 216, 216, 225, 225, 240, 240, 243,
    250, 270, 270, 270, 288, 288, 288, 300, 320, 320, 320, 320,
    360, 360, 360, 360, 360, 360, 375, 375, 375, 384, 400, 400,
    400, 405, 432, 432, 432, 432, 450, 450, 450, 480, 480, 480,
    480, 480, 486, 500, 500, 500, 512, 512, 540, 540, 540, 540,
    576, 576, 576, 576, 576, 576, 576, 600, 600, 600, 600, 625,
    625, 625, 625, 625, 640, 640, 648, 648, 675, 675, 675, 675,
    675, 720, 720, 720, 720, 720, 720, 720, 720, 729, 729, 750,
    750, 750, 750, 768, 768, 768, 800, 800, 800, 800, 800, 800,
    800, 810, 810, 864, 864, 864, 864, 864, 864, 864, 864, 864,
    864, 864, 900, 900, 900, 900, 900, 900, 900, 900, 960, 960,
    960, 960, 960, 960, 960, 960, 960, 960, 960, 960, 960, 972,
    972, 972, 1000, 1000, 1000, 1000, 1000, 1000, 1000, 1024, 1024, 1024,
    1024, 1024, 1024, 1080, 1080, 1080, 1080, 1080, 1080, 1080, 1080, 1080,
    1080, 1080, 1080, 1080, 1080, 1080, 1080, 1125, 1125, 1125, 1125, 1125,
    1125, 1125, 1125, 1125, 1125, 1125, 1125, 1125, 1125, 1152, 1152, 1152,
    1152, 1152, 1152, 1152, 1152, 1152, 1200, 1200, 1200, 1200, 1200, 1200,
    1200, 1200, 1200, 1200, 1200, 1200, 1200, 1200, 1200, 1200, 1200, 1200,
    1200, 1215, 1215, 1215, 1215, 1215, 1215, 1215, 1250, 1250, 1250, 1250,
    1250, 1250, 1250, 1250, 1250, 1250, 1250, 1250, 1250, 1250, 1250, 1250,
    1250, 1250, 1250, 1250, 1280, 1280, 1280, 1280, 1280, 1280, 1280, 1280,
    1280, 1280, 1280, 1280, 1280, 1280, 1280, 1280, 1280, 1280, 1280, 1280,
    1280, 1280, 1280, 1280, 1280, 1280, 1280, 1280, 1280, 1280, 1280, 1280,
    1280, 1280, 1280, 1280, 1280, 1280, 1280, 1280, 1280, 1280, 1280, 1280,
    1280, 1280, 1280, 1280, 1280, 1280, 1280, 1280,
];

/// Errors raised while building a grid definition
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GridError {
    #[error("Invalid grid increment {0}: 180 and 360 must be whole multiples of it")]
    InvalidIncrement(f64),

    #[error("Unknown grid name '{0}', expected N<number> or O<number>")]
    UnknownGrid(String),

    #[error("Invalid points-per-latitude table: {0}")]
    InvalidPl(String),
}

pub type GridResult<T> = Result<T, GridError>;

/// Global regular latitude/longitude grid.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegularLatLonGrid {
    /// Latitude increment in degrees
    pub dlat: f64,
    /// Longitude increment in degrees
    pub dlon: f64,
}

impl RegularLatLonGrid {
    pub fn new(dlat: f64, dlon: f64) -> GridResult<Self> {
        let grid = Self { dlat, dlon };
        grid.validate()?;
        Ok(grid)
    }

    /// The 0.25° grid of the open-data feed.
    pub fn quarter_degree() -> Self {
        Self {
            dlat: 0.25,
            dlon: 0.25,
        }
    }

    pub fn validate(&self) -> GridResult<()> {
        if !(self.dlat > 0.0 && self.dlat <= 90.0) || !is_whole(180.0 / self.dlat) {
            return Err(GridError::InvalidIncrement(self.dlat));
        }
        if !(self.dlon > 0.0 && self.dlon <= 180.0) || !is_whole(360.0 / self.dlon) {
            return Err(GridError::InvalidIncrement(self.dlon));
        }
        Ok(())
    }

    pub fn nlat(&self) -> usize {
        (180.0 / self.dlat).round() as usize + 1
    }

    pub fn nlon(&self) -> usize {
        (360.0 / self.dlon).round() as usize
    }

    /// Shape of a field on this grid as (rows, columns).
    pub fn shape(&self) -> (usize, usize) {
        (self.nlat(), self.nlon())
    }

    pub fn latitude(&self, row: usize) -> f64 {
        90.0 - row as f64 * self.dlat
    }

    pub fn longitude(&self, column: usize) -> f64 {
        column as f64 * self.dlon
    }
}

impl Default for RegularLatLonGrid {
    fn default() -> Self {
        Self::quarter_degree()
    }
}

/// Reduced Gaussian grid: Gaussian latitudes from north to south, each with
/// `pl[k]` points starting at 0°E.
#[derive(Debug, Clone, PartialEq)]
pub struct ReducedGaussianGrid {
    name: String,
    latitudes: Vec<f64>,
    pl: Vec<usize>,
}

impl ReducedGaussianGrid {
    /// Octahedral grid `O<n>`: 20 points on the polar bands, 4 more per band
    /// towards the equator.
    pub fn octahedral(n: usize) -> GridResult<Self> {
        if n == 0 {
            return Err(GridError::UnknownGrid("O0".to_string()));
        }
        let north: Vec<usize> = (0..n).map(|i| 20 + 4 * i).collect();
        Self::build(format!("O{}", n), north)
    }

    /// Classic reduced grid `N<n>` with the operational band sizes.
    ///
    /// N320 (542080 points) is tabulated. Other resolutions fall back to
    /// [`ReducedGaussianGrid::classic`].
    pub fn operational(n: usize) -> GridResult<Self> {
        match n {
            320 => Self::build("N320".to_string(), N320_PL.to_vec()),
            _ => Self::classic(n),
        }
    }

    /// Classic reduced grid `N<n>` built from a rule.
    ///
    /// Band sizes follow the cosine law `4n cos(lat)`, rounded up to the next
    /// FFT-friendly count (factors 2, 3 and 5) with a floor of
    /// [`CLASSIC_MIN_POINTS`]. ECMWF's published tables were tuned by hand on
    /// top of this rule, so the totals differ slightly from theirs.
    pub fn classic(n: usize) -> GridResult<Self> {
        if n == 0 {
            return Err(GridError::UnknownGrid("N0".to_string()));
        }
        let full = 4 * n;
        let floor = CLASSIC_MIN_POINTS.min(full);
        let north: Vec<usize> = gaussian_latitudes(n)
            .iter()
            .take(n)
            .map(|lat| {
                let raw = (full as f64 * lat.to_radians().cos()).ceil() as usize;
                next_smooth(raw.max(floor)).min(full)
            })
            .collect();
        Self::build(format!("N{}", n), north)
    }

    /// Grid from the northern half of a points-per-latitude table (`n`
    /// entries, pole to equator). The southern half mirrors it.
    pub fn from_half_pl(north: Vec<usize>) -> GridResult<Self> {
        check_pl(&north)?;
        Self::build(custom_name(north.len()), north)
    }

    /// Grid from a full points-per-latitude table (`2n` entries, north to
    /// south). The table must be symmetric about the equator.
    pub fn from_full_pl(pl: Vec<usize>) -> GridResult<Self> {
        check_pl(&pl)?;
        if pl.len() % 2 != 0 {
            return Err(GridError::InvalidPl(format!(
                "full table has an odd number of bands ({})",
                pl.len()
            )));
        }
        if !is_symmetric(&pl) {
            return Err(GridError::InvalidPl(
                "full table is not symmetric about the equator".to_string(),
            ));
        }
        let north = pl[..pl.len() / 2].to_vec();
        Self::build(custom_name(north.len()), north)
    }

    /// Parses `N<n>` (classic, see [`ReducedGaussianGrid::operational`]) or
    /// `O<n>` (octahedral).
    pub fn from_name(name: &str) -> GridResult<Self> {
        let trimmed = name.trim();
        let mut chars = trimmed.chars();
        let kind = chars.next().map(|c| c.to_ascii_uppercase());
        let number = chars
            .as_str()
            .parse::<usize>()
            .map_err(|_| GridError::UnknownGrid(name.to_string()))?;

        match kind {
            Some('N') => Self::operational(number),
            Some('O') => Self::octahedral(number),
            _ => Err(GridError::UnknownGrid(name.to_string())),
        }
    }

    fn build(name: String, north: Vec<usize>) -> GridResult<Self> {
        let n = north.len();
        let latitudes = gaussian_latitudes(n);
        let mut pl = north.clone();
        pl.extend(north.iter().rev());
        Ok(Self {
            name,
            latitudes,
            pl,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of latitude bands between a pole and the equator.
    pub fn gaussian_number(&self) -> usize {
        self.latitudes.len() / 2
    }

    pub fn latitudes(&self) -> &[f64] {
        &self.latitudes
    }

    pub fn pl(&self) -> &[usize] {
        &self.pl
    }

    /// Total number of grid points.
    pub fn size(&self) -> usize {
        self.pl.iter().sum()
    }

    /// Iterates grid points as (latitude, longitude) in storage order.
    pub fn points(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.latitudes
            .iter()
            .zip(self.pl.iter())
            .flat_map(|(&lat, &count)| {
                (0..count).map(move |m| (lat, 360.0 * m as f64 / count as f64))
            })
    }

    /// Latitude and longitude arrays aligned with flattened field values.
    pub fn latlons(&self) -> (Vec<f64>, Vec<f64>) {
        self.points().unzip()
    }
}

/// Target grid as written in configuration: a grid name or an explicit
/// points-per-latitude table.
///
/// A table lists every band from north to south unless `half: true`, in
/// which case it lists the northern half only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TargetGridSpec {
    Named(String),
    Table {
        pl: Vec<usize>,
        #[serde(default)]
        half: bool,
    },
}

impl TargetGridSpec {
    pub fn build(&self) -> GridResult<ReducedGaussianGrid> {
        match self {
            TargetGridSpec::Named(name) => ReducedGaussianGrid::from_name(name),
            TargetGridSpec::Table { pl, half: true } => {
                ReducedGaussianGrid::from_half_pl(pl.clone())
            }
            TargetGridSpec::Table { pl, half: false } => {
                ReducedGaussianGrid::from_full_pl(pl.clone())
            }
        }
    }
}

impl Default for TargetGridSpec {
    fn default() -> Self {
        TargetGridSpec::Named("N320".to_string())
    }
}

/// Gaussian latitudes in degrees, north to south, for Gaussian number `n`
/// (`2n` latitudes: the roots of the Legendre polynomial of degree `2n`).
pub fn gaussian_latitudes(n: usize) -> Vec<f64> {
    let degree = 2 * n;
    let mut north = Vec::with_capacity(n);

    for i in 0..n {
        let mut x = (PI * (i as f64 + 0.75) / (degree as f64 + 0.5)).cos();
        for _ in 0..100 {
            let (p, dp) = legendre(degree, x);
            let dx = p / dp;
            x -= dx;
            if dx.abs() < 1e-15 {
                break;
            }
        }
        north.push(x.asin().to_degrees());
    }

    let mut latitudes = north.clone();
    latitudes.extend(north.iter().rev().map(|lat| -lat));
    latitudes
}

/// Legendre polynomial of degree `n` and its derivative at `x`.
fn legendre(n: usize, x: f64) -> (f64, f64) {
    let mut previous = 1.0;
    let mut current = x;
    for k in 2..=n {
        let k = k as f64;
        let next = ((2.0 * k - 1.0) * x * current - (k - 1.0) * previous) / k;
        previous = current;
        current = next;
    }
    let derivative = n as f64 * (x * current - previous) / (x * x - 1.0);
    (current, derivative)
}

fn next_smooth(mut n: usize) -> usize {
    while !is_smooth(n) {
        n += 1;
    }
    n
}

fn is_smooth(n: usize) -> bool {
    if n == 0 {
        return false;
    }
    let mut rest = n;
    for factor in [2, 3, 5] {
        while rest % factor == 0 {
            rest /= factor;
        }
    }
    rest == 1
}

fn check_pl(pl: &[usize]) -> GridResult<()> {
    if pl.is_empty() {
        return Err(GridError::InvalidPl("table is empty".to_string()));
    }
    if let Some(position) = pl.iter().position(|&count| count == 0) {
        return Err(GridError::InvalidPl(format!(
            "band {} has no points",
            position
        )));
    }
    Ok(())
}

/// Tables from configuration carry no standard name.
fn custom_name(n: usize) -> String {
    format!("custom-{}", 2 * n)
}

fn is_symmetric(pl: &[usize]) -> bool {
    pl.iter().eq(pl.iter().rev())
}

fn is_whole(x: f64) -> bool {
    (x - x.round()).abs() < 1e-9
}
