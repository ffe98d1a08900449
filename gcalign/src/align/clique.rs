use serde::{Deserialize, Serialize};

use gccore::data::spectrum::MassSpectrum;

use crate::align::matching::{AlignError, PeakMatchRow};
use crate::resolve::area::PeakArea;

/// Multiplier turning the largest observed positional spread of a slot into
/// the search radius hint of its missing-peak record.
pub const SEARCH_RADIUS_FACTOR: f64 = 1.25;

/// One analyte resolved in every chromatogram of the experiment: per
/// chromatogram the index of the matched peak, plus the mean seed position.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PeakClique {
    pub members: Vec<usize>,
    pub mean_x: f64,
    pub mean_y: f64,
}

/// An analyte that went undetected in at least one chromatogram. Mean
/// position and search radii are computed from the present peaks only and
/// parameterize a targeted re-search around the expected location; the
/// contributing seed spectra identify what to look for.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MissingPeakRecord {
    pub mean_x: f64,
    pub mean_y: f64,
    pub search_dx: f64,
    pub search_dy: f64,
    pub absent_chromatograms: Vec<usize>,
    pub seed_spectra: Vec<MassSpectrum>,
}

/// Largest pairwise absolute difference of the values, i.e. max - min;
/// 0 with fewer than two values.
fn max_pairwise_delta(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    max - min
}

/// Reduces the correspondence table to cliques and missing-peak records.
///
/// A fully present row yields exactly one clique; a row with k >= 1 absent
/// entries yields exactly one missing-peak record whose absent list has
/// length k. A row with no present entries cannot exist in a well-formed
/// table and is rejected as [`AlignError::InvalidMatchRow`] rather than
/// averaged into garbage.
pub fn assemble_cliques(
    rows: &[PeakMatchRow],
    chromatograms: &[Vec<PeakArea>],
) -> Result<(Vec<PeakClique>, Vec<MissingPeakRecord>), AlignError> {
    let count = chromatograms.len();
    let mut cliques = Vec::new();
    let mut missing = Vec::new();

    for row in rows {
        if row.entries.len() != count {
            return Err(AlignError::RowLength {
                expected: count,
                found: row.entries.len(),
            });
        }

        let mut xs: Vec<f64> = Vec::new();
        let mut ys: Vec<f64> = Vec::new();
        let mut spectra: Vec<&MassSpectrum> = Vec::new();
        for (chromatogram, peak) in row.present() {
            let area = chromatograms[chromatogram]
                .get(peak)
                .ok_or(AlignError::UnknownPeak { chromatogram, peak })?;
            xs.push(area.seed.x as f64);
            ys.push(area.seed.y as f64);
            spectra.push(&area.seed_spectrum);
        }

        if xs.is_empty() {
            return Err(AlignError::InvalidMatchRow);
        }

        let mean_x = xs.iter().sum::<f64>() / xs.len() as f64;
        let mean_y = ys.iter().sum::<f64>() / ys.len() as f64;

        if row.is_complete() {
            cliques.push(PeakClique {
                members: row.entries.iter().map(|e| e.unwrap_or_default()).collect(),
                mean_x,
                mean_y,
            });
        } else {
            missing.push(MissingPeakRecord {
                mean_x,
                mean_y,
                search_dx: SEARCH_RADIUS_FACTOR * max_pairwise_delta(&xs),
                search_dy: SEARCH_RADIUS_FACTOR * max_pairwise_delta(&ys),
                absent_chromatograms: row.absent_chromatograms(),
                seed_spectra: spectra.into_iter().cloned().collect(),
            });
        }
    }

    Ok((cliques, missing))
}
