use serde::{Deserialize, Serialize};

use crate::data::spectrum::MassSpectrum;

/// One cell of the acquisition grid: `x` is the modulation (first-dimension)
/// index, `y` the scan offset within that modulation (second dimension).
///
/// Ordered by `x`, then `y`, which is the canonical iteration order whenever
/// point sets have to be walked deterministically.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GridPoint {
    pub x: i32,
    pub y: i32,
}

impl GridPoint {
    pub fn new(x: i32, y: i32) -> Self {
        GridPoint { x, y }
    }
}

/// Random access to the raw scans of one chromatogram.
///
/// Lookups are synchronous and may be backed by anything from an in-memory
/// table to a paging file reader; callers that loop over many points should
/// cache. A `None` result means the cell holds no spectrum and is not an
/// error.
pub trait ScanGrid: Send + Sync {
    fn spectrum_at(&self, p: GridPoint) -> Option<&MassSpectrum>;

    /// Number of second-dimension scans per modulation.
    fn offsets_per_modulation(&self) -> usize;

    /// Number of modulations (first-dimension extent).
    fn modulations(&self) -> usize;
}

/// Row-major in-memory scan grid, `modulations x offsets_per_modulation`.
#[derive(Clone, Debug, Default)]
pub struct DenseScanGrid {
    spectra: Vec<Option<MassSpectrum>>,
    modulations: usize,
    offsets_per_modulation: usize,
}

impl DenseScanGrid {
    pub fn new(modulations: usize, offsets_per_modulation: usize) -> Self {
        DenseScanGrid {
            spectra: vec![None; modulations * offsets_per_modulation],
            modulations,
            offsets_per_modulation,
        }
    }

    #[inline]
    fn index_of(&self, p: GridPoint) -> Option<usize> {
        if p.x < 0 || p.y < 0 {
            return None;
        }
        let (x, y) = (p.x as usize, p.y as usize);
        if x >= self.modulations || y >= self.offsets_per_modulation {
            return None;
        }
        Some(x * self.offsets_per_modulation + y)
    }

    /// Places a spectrum at `p`, replacing any previous one. Out-of-bounds
    /// coordinates are ignored.
    pub fn insert(&mut self, p: GridPoint, spectrum: MassSpectrum) {
        if let Some(i) = self.index_of(p) {
            self.spectra[i] = Some(spectrum);
        }
    }

    pub fn intensity_at(&self, p: GridPoint) -> f64 {
        self.spectrum_at(p).map_or(0.0, |s| s.total_intensity())
    }
}

impl ScanGrid for DenseScanGrid {
    fn spectrum_at(&self, p: GridPoint) -> Option<&MassSpectrum> {
        self.index_of(p).and_then(|i| self.spectra[i].as_ref())
    }

    fn offsets_per_modulation(&self) -> usize {
        self.offsets_per_modulation
    }

    fn modulations(&self) -> usize {
        self.modulations
    }
}
