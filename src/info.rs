//! # Grid and Catalog Information
//!
//! Structured descriptions of the target grid and of the fields a catalog
//! produces, printable as text, JSON, YAML or CSV.

use crate::assemble::expected_fields;
use crate::catalog::ParameterCatalog;
use crate::grid::{ReducedGaussianGrid, RegularLatLonGrid};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// One latitude band of a reduced grid
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BandInfo {
    pub index: usize,
    pub latitude: f64,
    pub points: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridInfo {
    pub name: String,
    pub gaussian_number: usize,
    pub total_points: usize,
    pub source_shape: (usize, usize),
    pub northernmost_latitude: f64,
    pub bands: Vec<BandInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogInfo {
    pub raw_fields: usize,
    pub model_fields: Vec<String>,
}

pub fn grid_info(source: &RegularLatLonGrid, target: &ReducedGaussianGrid) -> GridInfo {
    let bands = target
        .latitudes()
        .iter()
        .zip(target.pl())
        .enumerate()
        .map(|(index, (&latitude, &points))| BandInfo {
            index,
            latitude,
            points,
        })
        .collect();

    GridInfo {
        name: target.name().to_string(),
        gaussian_number: target.gaussian_number(),
        total_points: target.size(),
        source_shape: source.shape(),
        northernmost_latitude: target.latitudes().first().copied().unwrap_or(0.0),
        bands,
    }
}

pub fn catalog_info(catalog: &ParameterCatalog) -> Result<CatalogInfo> {
    let model_fields = expected_fields(catalog)
        .context("Failed to derive model fields from catalog")?
        .into_iter()
        .collect();
    Ok(CatalogInfo {
        raw_fields: catalog.raw_field_names().len(),
        model_fields,
    })
}

/// Print grid info in human-readable format; `detailed` lists every band.
pub fn print_grid_info_human(info: &GridInfo, detailed: bool) {
    println!("Target grid {}:", info.name);
    println!("  Gaussian number: {}", info.gaussian_number);
    println!("  Latitude bands: {}", info.bands.len());
    println!("  Points: {}", info.total_points);
    println!(
        "  Source grid: {} x {}",
        info.source_shape.0, info.source_shape.1
    );
    println!("  Northernmost latitude: {:.6}", info.northernmost_latitude);
    if detailed {
        for band in &info.bands {
            println!("    {:>5} {:>11.6} {:>6}", band.index, band.latitude, band.points);
        }
    }
}

pub fn print_grid_info_json(info: &GridInfo) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(info)?);
    Ok(())
}

pub fn print_grid_info_yaml(info: &GridInfo) -> Result<()> {
    let yaml = serde_yaml::to_string(info).context("Failed to serialize grid info to YAML")?;
    println!("{}", yaml);
    Ok(())
}

/// Bands as CSV
pub fn print_grid_info_csv(info: &GridInfo) {
    println!("band,latitude,points");
    for band in &info.bands {
        println!("{},{},{}", band.index, band.latitude, band.points);
    }
}

pub fn print_catalog_info_human(info: &CatalogInfo) {
    println!("Raw fields fetched: {}", info.raw_fields);
    println!("Model input fields: {}", info.model_fields.len());
    for chunk in info.model_fields.chunks(10) {
        println!("  {}", chunk.join(" "));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grid_info_matches_grid() {
        let target = ReducedGaussianGrid::octahedral(8).unwrap();
        let info = grid_info(&RegularLatLonGrid::quarter_degree(), &target);
        assert_eq!(info.name, "O8");
        assert_eq!(info.bands.len(), 16);
        assert_eq!(info.total_points, target.size());
        assert_eq!(info.bands.iter().map(|b| b.points).sum::<usize>(), info.total_points);
        assert_eq!(info.source_shape, (721, 1440));
        assert!(info.northernmost_latitude > 0.0);
    }

    #[test]
    fn test_grid_info_serializes() -> Result<()> {
        let target = ReducedGaussianGrid::from_half_pl(vec![4, 8])?;
        let info = grid_info(&RegularLatLonGrid::quarter_degree(), &target);
        let yaml = serde_yaml::to_string(&info)?;
        let parsed: GridInfo = serde_yaml::from_str(&yaml)?;
        assert_eq!(parsed.bands.len(), 4);
        assert_eq!(parsed.total_points, 24);
        Ok(())
    }

    #[test]
    fn test_catalog_info() -> Result<()> {
        let info = catalog_info(&ParameterCatalog::default())?;
        assert_eq!(info.raw_fields, 94);
        assert_eq!(info.model_fields.len(), 94);
        assert!(info.model_fields.contains(&"swvl1".to_string()));
        Ok(())
    }
}
