use crate::analytics::{summarize_ward_blocking, WardSummary};
use crate::data::Catalog;
use anyhow::{Context, Result};
use rayon::prelude::*;
use serde::Serialize;
use std::io::Write;
use std::path::Path;
use tracing::info;

/// One CSV line per ward.
#[derive(Debug, Serialize)]
pub struct ReportRow {
    pub ward_id: usize,
    pub ward_no: String,
    pub name: String,
    pub area_km2: f64,
    pub schools: usize,
    pub school_density: f64,
    pub trees: usize,
    pub mean_elevation_m: Option<f64>,
    pub dominant_species: String,
}

impl From<&WardSummary> for ReportRow {
    fn from(summary: &WardSummary) -> Self {
        Self {
            ward_id: summary.ward_id,
            ward_no: summary.number.clone().unwrap_or_default(),
            name: summary.name.clone(),
            area_km2: summary.area_km2,
            schools: summary.schools,
            school_density: (summary.school_density * 100.0).round() / 100.0,
            trees: summary.trees,
            mean_elevation_m: summary.mean_elevation.map(|z| (z * 10.0).round() / 10.0),
            dominant_species: summary.dominant_species().map(|s| s.name.clone()).unwrap_or_default(),
        }
    }
}

/// Summarizes every ward in parallel, in ward order.
pub fn summarize_all(catalog: &Catalog) -> Vec<WardSummary> {
    catalog.wards.par_iter()
        .map(|ward| summarize_ward_blocking(catalog, ward))
        .collect()
}

pub fn write_report<W: Write>(summaries: &[WardSummary], out: W) -> Result<()> {
    let mut writer = csv::Writer::from_writer(out);
    for summary in summaries {
        writer.serialize(ReportRow::from(summary))?;
    }
    writer.flush()?;
    Ok(())
}

pub fn generate_report(catalog: &Catalog, output: &Path) -> Result<()> {
    let summaries = summarize_all(catalog);
    let file = std::fs::File::create(output)
        .with_context(|| format!("Failed to create {}", output.display()))?;
    write_report(&summaries, file)?;
    info!("Wrote {} ward summaries to {}", summaries.len(), output.display());
    Ok(())
}
