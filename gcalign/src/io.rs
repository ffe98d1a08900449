use std::fs::File;
use std::io::{BufReader, BufWriter};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::align::clique::{MissingPeakRecord, PeakClique};

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("I/O error while accessing alignment results: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to (de)serialize alignment results: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Flat export row for one clique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliqueRow {
    pub members: Vec<usize>,
    pub mean_x: f64,
    pub mean_y: f64,
}

impl From<&PeakClique> for CliqueRow {
    fn from(c: &PeakClique) -> Self {
        CliqueRow {
            members: c.members.clone(),
            mean_x: c.mean_x,
            mean_y: c.mean_y,
        }
    }
}

/// Flat export row for one missing-peak record; the contributing seed
/// spectra are stored as parallel m/z / intensity vectors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissingPeakRow {
    pub mean_x: f64,
    pub mean_y: f64,
    pub search_dx: f64,
    pub search_dy: f64,
    pub absent_chromatograms: Vec<usize>,
    pub seed_mz: Vec<Vec<f64>>,
    pub seed_intensity: Vec<Vec<f64>>,
}

impl From<&MissingPeakRecord> for MissingPeakRow {
    fn from(r: &MissingPeakRecord) -> Self {
        MissingPeakRow {
            mean_x: r.mean_x,
            mean_y: r.mean_y,
            search_dx: r.search_dx,
            search_dy: r.search_dy,
            absent_chromatograms: r.absent_chromatograms.clone(),
            seed_mz: r.seed_spectra.iter().map(|s| s.mz.clone()).collect(),
            seed_intensity: r.seed_spectra.iter().map(|s| s.intensity.clone()).collect(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AlignmentFile {
    pub version: u32,
    pub num_chromatograms: usize,
    pub cliques: Vec<CliqueRow>,
    pub missing: Vec<MissingPeakRow>,
}

impl AlignmentFile {
    pub fn new(
        num_chromatograms: usize,
        cliques: &[PeakClique],
        missing: &[MissingPeakRecord],
    ) -> Self {
        Self {
            version: 1,
            num_chromatograms,
            cliques: cliques.iter().map(CliqueRow::from).collect(),
            missing: missing.iter().map(MissingPeakRow::from).collect(),
        }
    }
}

// --- JSON (human-readable) ---
pub fn save_json(
    path: &str,
    num_chromatograms: usize,
    cliques: &[PeakClique],
    missing: &[MissingPeakRecord],
) -> Result<(), ExportError> {
    let f = BufWriter::new(File::create(path)?);
    let file = AlignmentFile::new(num_chromatograms, cliques, missing);
    serde_json::to_writer_pretty(f, &file)?;
    Ok(())
}

pub fn load_json(path: &str) -> Result<AlignmentFile, ExportError> {
    let f = BufReader::new(File::open(path)?);
    Ok(serde_json::from_reader(f)?)
}
