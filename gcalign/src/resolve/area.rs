use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;

use gccore::data::grid::GridPoint;
use gccore::data::spectrum::MassSpectrum;

#[derive(Debug, Error)]
pub enum BoundaryError {
    #[error("cannot reconstruct a boundary from an empty point set")]
    EmptyRegion,
}

/// Recomputes the outer contour of a peak region. Must be invoked after every
/// region mutation before the area is handed to any consumer.
pub trait BoundaryReconstructor: Send + Sync {
    fn recompute(&self, points: &[GridPoint]) -> Result<Vec<GridPoint>, BoundaryError>;
}

/// Default contour: the region points missing at least one 4-neighbour inside
/// the region, ordered counter-clockwise by angle around the region centroid
/// (ties by coordinate). A single-point region is its own boundary.
#[derive(Clone, Copy, Debug, Default)]
pub struct EdgeTraceBoundary;

impl BoundaryReconstructor for EdgeTraceBoundary {
    fn recompute(&self, points: &[GridPoint]) -> Result<Vec<GridPoint>, BoundaryError> {
        if points.is_empty() {
            return Err(BoundaryError::EmptyRegion);
        }

        let lookup: BTreeSet<GridPoint> = points.iter().copied().collect();
        let mut edge: Vec<GridPoint> = lookup
            .iter()
            .copied()
            .filter(|p| {
                !(lookup.contains(&GridPoint::new(p.x - 1, p.y))
                    && lookup.contains(&GridPoint::new(p.x + 1, p.y))
                    && lookup.contains(&GridPoint::new(p.x, p.y - 1))
                    && lookup.contains(&GridPoint::new(p.x, p.y + 1)))
            })
            .collect();

        let n = lookup.len() as f64;
        let cx = lookup.iter().map(|p| p.x as f64).sum::<f64>() / n;
        let cy = lookup.iter().map(|p| p.y as f64).sum::<f64>() / n;

        edge.sort_by(|a, b| {
            let ang_a = (a.y as f64 - cy).atan2(a.x as f64 - cx);
            let ang_b = (b.y as f64 - cy).atan2(b.x as f64 - cx);
            ang_a.total_cmp(&ang_b).then_with(|| a.cmp(b))
        });

        Ok(edge)
    }
}

/// One candidate peak of a chromatogram: the seed it was grown from, the grid
/// points currently assigned to it, and the reconstructed outer contour.
///
/// Seed, seed spectrum and seed apex intensity are fixed at construction; the
/// region and boundary are rewritten by conflict resolution, always as a
/// complete pair via [`PeakArea::commit_region`]. Point spectra stay owned by
/// the scan grid; the region keeps only the apex intensity per point.
#[derive(Clone, Debug)]
pub struct PeakArea {
    pub seed: GridPoint,
    pub seed_spectrum: MassSpectrum,
    pub seed_intensity: f64,
    region: BTreeMap<GridPoint, f64>,
    boundary: Vec<GridPoint>,
    merged: bool,
}

impl PeakArea {
    /// A fresh area owning nothing but its seed cell.
    pub fn new(seed: GridPoint, seed_spectrum: MassSpectrum, seed_intensity: f64) -> Self {
        let mut region = BTreeMap::new();
        region.insert(seed, seed_intensity);
        PeakArea {
            seed,
            seed_spectrum,
            seed_intensity,
            region,
            boundary: vec![seed],
            merged: false,
        }
    }

    /// An area with an upstream-grown region. The seed cell is inserted if the
    /// growing stage did not record it; the boundary is reconstructed before
    /// the area is returned.
    pub fn with_region(
        seed: GridPoint,
        seed_spectrum: MassSpectrum,
        seed_intensity: f64,
        points: impl IntoIterator<Item = (GridPoint, f64)>,
        reconstructor: &dyn BoundaryReconstructor,
    ) -> Result<Self, BoundaryError> {
        let mut region: BTreeMap<GridPoint, f64> = points.into_iter().collect();
        region.entry(seed).or_insert(seed_intensity);

        let coords: Vec<GridPoint> = region.keys().copied().collect();
        let boundary = reconstructor.recompute(&coords)?;

        Ok(PeakArea {
            seed,
            seed_spectrum,
            seed_intensity,
            region,
            boundary,
            merged: false,
        })
    }

    pub fn region(&self) -> &BTreeMap<GridPoint, f64> {
        &self.region
    }

    pub fn boundary(&self) -> &[GridPoint] {
        &self.boundary
    }

    pub fn contains(&self, p: GridPoint) -> bool {
        self.region.contains_key(&p)
    }

    pub fn point_count(&self) -> usize {
        self.region.len()
    }

    pub fn is_merged(&self) -> bool {
        self.merged
    }

    /// Swaps in a fully rebuilt region/boundary pair. The caller guarantees
    /// the pair is consistent and was computed in full before the swap, so a
    /// failed rebuild never leaves the area half-updated.
    pub fn commit_region(&mut self, region: BTreeMap<GridPoint, f64>, boundary: Vec<GridPoint>) {
        debug_assert!(region.contains_key(&self.seed));
        self.region = region;
        self.boundary = boundary;
    }

    /// Marks the area as absorbed by another peak. Its points have already
    /// moved to the absorbing area; the emptied area is dropped from the peak
    /// list at compaction.
    pub fn mark_merged(&mut self) {
        self.merged = true;
        self.region.clear();
        self.boundary.clear();
    }
}
