use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use gccore::algorithm::affinity::PeakAffinity;

use crate::resolve::area::PeakArea;

#[derive(Debug, Error)]
pub enum AlignError {
    #[error("correspondence search was cancelled")]
    Cancelled,
    #[error("reference chromatogram index {reference} out of range for {count} chromatograms")]
    ReferenceOutOfRange { reference: usize, count: usize },
    #[error("match row has no present entries")]
    InvalidMatchRow,
    #[error("match row has {found} entries, expected {expected}")]
    RowLength { expected: usize, found: usize },
    #[error("match row references peak {peak} of chromatogram {chromatogram}, which does not exist")]
    UnknownPeak { chromatogram: usize, peak: usize },
}

/// Scores how likely two peaks from different chromatograms are the same
/// analyte. Higher is more similar; symmetry is not required, only the two
/// independent argmax searches are ever combined.
pub trait PeakSimilarity: Send + Sync {
    fn sim(&self, a: &PeakArea, b: &PeakArea) -> f64;
}

/// Default cross-chromatogram similarity: the peak affinity of the two seed
/// spectra, evaluated at the seeds' scaled positional deltas (the same
/// scaling the in-chromatogram reassignment uses).
#[derive(Clone, Debug)]
pub struct SeedSimilarity<A: PeakAffinity> {
    pub affinity: A,
    pub offsets_per_modulation: usize,
    pub position_scale: f64,
}

impl<A: PeakAffinity> SeedSimilarity<A> {
    pub fn new(affinity: A, offsets_per_modulation: usize) -> Self {
        SeedSimilarity {
            affinity,
            offsets_per_modulation,
            position_scale: 0.01,
        }
    }
}

impl<A: PeakAffinity> PeakSimilarity for SeedSimilarity<A> {
    fn sim(&self, a: &PeakArea, b: &PeakArea) -> f64 {
        let dx = (a.seed.x - b.seed.x).abs() as f64
            * self.offsets_per_modulation as f64
            * self.position_scale;
        let dy = (a.seed.y - b.seed.y).abs() as f64 * self.position_scale;
        self.affinity.score(dx, dy, &a.seed_spectrum, &b.seed_spectrum)
    }
}

/// Cooperative cancellation handle for long pair searches. Flip it from any
/// thread (a timeout timer, a UI) and the running search returns
/// [`AlignError::Cancelled`] without emitting partial rows.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// For every peak of `a`, the index of its highest-`sim` peak in `b`, ties
/// resolved to the lowest index. `None` entries only occur when `b` is empty.
pub fn best_hits(a: &[PeakArea], b: &[PeakArea], sim: &dyn PeakSimilarity) -> Vec<Option<usize>> {
    a.iter()
        .map(|p| {
            let mut best: Option<(usize, f64)> = None;
            for (j, q) in b.iter().enumerate() {
                let s = sim.sim(p, q);
                match best {
                    Some((_, bs)) if s <= bs => {}
                    _ => best = Some((j, s)),
                }
            }
            best.map(|(j, _)| j)
        })
        .collect()
}

/// Reciprocal best hits between two peak lists: `(i, j)` is kept iff `j` is
/// `i`'s argmax in `b` and `i` is `j`'s argmax in `a`. Output is ordered by
/// `i`.
pub fn bidirectional_hits(
    a: &[PeakArea],
    b: &[PeakArea],
    sim: &dyn PeakSimilarity,
) -> Vec<(usize, usize)> {
    let forward = best_hits(a, b, sim);
    let backward = best_hits(b, a, sim);

    forward
        .iter()
        .enumerate()
        .filter_map(|(i, &hit)| {
            let j = hit?;
            (backward[j] == Some(i)).then_some((i, j))
        })
        .collect()
}

/// One correspondence slot across an experiment: per chromatogram either the
/// index of the participating peak in that chromatogram's final peak list, or
/// `None` where the analyte was not matched.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeakMatchRow {
    pub entries: Vec<Option<usize>>,
}

impl PeakMatchRow {
    pub fn present(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(c, e)| e.map(|p| (c, p)))
    }

    pub fn absent_chromatograms(&self) -> Vec<usize> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(c, e)| e.is_none().then_some(c))
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.entries.iter().all(|e| e.is_some())
    }
}

/// Builds the correspondence table for an experiment: one row per peak of the
/// reference chromatogram, with the entry for every other chromatogram taken
/// from the reciprocal best hits of that (reference, other) pair.
///
/// Every peak list must be final (post-resolution, compacted) before this is
/// called. Pair tables are computed in parallel; the row assembly itself is
/// sequential and deterministic. Cancellation is checked per chromatogram
/// pair and discards everything.
pub fn match_rows(
    chromatograms: &[Vec<PeakArea>],
    reference: usize,
    sim: &dyn PeakSimilarity,
    cancel: &CancelToken,
) -> Result<Vec<PeakMatchRow>, AlignError> {
    let count = chromatograms.len();
    if reference >= count {
        return Err(AlignError::ReferenceOutOfRange { reference, count });
    }
    let ref_peaks = &chromatograms[reference];

    let pair_maps: Vec<Option<HashMap<usize, usize>>> = (0..count)
        .into_par_iter()
        .map(|c| {
            if c == reference || cancel.is_cancelled() {
                return None;
            }
            let hits = bidirectional_hits(ref_peaks, &chromatograms[c], sim);
            Some(hits.into_iter().collect::<HashMap<usize, usize>>())
        })
        .collect();

    if cancel.is_cancelled() {
        return Err(AlignError::Cancelled);
    }

    let rows = (0..ref_peaks.len())
        .map(|p| {
            let entries = (0..count)
                .map(|c| {
                    if c == reference {
                        Some(p)
                    } else {
                        pair_maps[c].as_ref().and_then(|m| m.get(&p).copied())
                    }
                })
                .collect();
            PeakMatchRow { entries }
        })
        .collect();

    Ok(rows)
}
