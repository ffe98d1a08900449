use std::collections::BTreeMap;

use itertools::Itertools;
use log::{debug, warn};
use rayon::prelude::*;
use thiserror::Error;

use gccore::algorithm::affinity::PeakAffinity;
use gccore::data::grid::{GridPoint, ScanGrid};
use gccore::data::spectrum::MassSpectrum;

use crate::resolve::area::{BoundaryError, BoundaryReconstructor, PeakArea};
use crate::resolve::overlap::overlap_groups;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("boundary reconstruction failed for peak {peak}: {source}")]
    Boundary { peak: usize, source: BoundaryError },
}

/// Knobs for conflict resolution.
#[derive(Clone, Debug)]
pub struct ResolveOpts {
    /// Groups whose minimum pairwise seed affinity falls below this are split
    /// into distinct analytes; at or above it the group is one over-split
    /// peak and gets merged.
    pub merge_threshold: f64,
    /// Scale applied to positional deltas before scoring: a point at
    /// first-dimension distance d contributes
    /// `d * offsets_per_modulation * position_scale`, a second-dimension
    /// distance contributes `d * position_scale`.
    pub position_scale: f64,
}

impl Default for ResolveOpts {
    fn default() -> Self {
        Self {
            merge_threshold: 0.995,
            position_scale: 0.01,
        }
    }
}

/// What the resolver decided to do with one overlap group.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GroupDecision {
    Separate,
    Merge,
}

/// Minimum pairwise seed-spectrum affinity over the group, scored with zero
/// positional deltas. The minimum governs: one strongly dissimilar pair marks
/// the group as genuinely distinct analytes no matter how alike the rest are.
fn min_seed_affinity(peaks: &[PeakArea], group: &[usize], affinity: &dyn PeakAffinity) -> f64 {
    group
        .iter()
        .tuple_combinations::<(_, _)>()
        .map(|(&i, &j)| affinity.score(0.0, 0.0, &peaks[i].seed_spectrum, &peaks[j].seed_spectrum))
        .fold(f64::INFINITY, f64::min)
}

#[inline]
fn scaled_deltas(p: GridPoint, seed: GridPoint, offsets_per_modulation: usize, position_scale: f64) -> (f64, f64) {
    let dx = (p.x - seed.x).abs() as f64 * offsets_per_modulation as f64 * position_scale;
    let dy = (p.y - seed.y).abs() as f64 * position_scale;
    (dx, dy)
}

/// Re-partitions the union of the group's points among its members.
///
/// Every member keeps its own seed cell up front; every other point goes to
/// the member whose seed spectrum scores strictly highest against the point's
/// spectrum at the scaled positional deltas, the earliest member in group
/// order winning exact ties. A point whose spectrum is missing from the grid
/// is scored against an empty spectrum.
///
/// The new regions and boundaries are built completely before any member is
/// touched, so a boundary failure leaves the whole group unchanged.
fn separate_group(
    peaks: &mut [PeakArea],
    group: &[usize],
    grid: &dyn ScanGrid,
    affinity: &dyn PeakAffinity,
    reconstructor: &dyn BoundaryReconstructor,
    opts: &ResolveOpts,
) -> Result<(), ResolveError> {
    let offsets = grid.offsets_per_modulation();
    let empty = MassSpectrum::default();

    // union of all points currently owned by the group, sorted by coordinate
    let mut union: BTreeMap<GridPoint, f64> = BTreeMap::new();
    for &i in group {
        union.extend(peaks[i].region().iter().map(|(&p, &v)| (p, v)));
    }

    let mut regions: Vec<BTreeMap<GridPoint, f64>> = group
        .iter()
        .map(|&i| {
            let seed = peaks[i].seed;
            let apex = union.get(&seed).copied().unwrap_or(peaks[i].seed_intensity);
            BTreeMap::from([(seed, apex)])
        })
        .collect();

    for (&p, &intensity) in &union {
        if group.iter().any(|&i| peaks[i].seed == p) {
            continue;
        }

        let spectrum = match grid.spectrum_at(p) {
            Some(s) => s,
            None => {
                warn!("no spectrum at ({}, {}); scoring against an empty spectrum", p.x, p.y);
                &empty
            }
        };

        let mut winner = 0usize;
        let mut best = f64::NEG_INFINITY;
        for (slot, &i) in group.iter().enumerate() {
            let (dx, dy) = scaled_deltas(p, peaks[i].seed, offsets, opts.position_scale);
            let score = affinity.score(dx, dy, &peaks[i].seed_spectrum, spectrum);
            if score > best {
                best = score;
                winner = slot;
            }
        }
        regions[winner].insert(p, intensity);
    }

    // reconstruct boundaries for the members whose region actually changed,
    // all of them before the first commit
    let mut rebuilt: Vec<Option<(BTreeMap<GridPoint, f64>, Vec<GridPoint>)>> =
        Vec::with_capacity(group.len());
    for (slot, &i) in group.iter().enumerate() {
        if &regions[slot] == peaks[i].region() {
            rebuilt.push(None);
            continue;
        }
        let coords: Vec<GridPoint> = regions[slot].keys().copied().collect();
        let boundary = reconstructor
            .recompute(&coords)
            .map_err(|source| ResolveError::Boundary { peak: i, source })?;
        rebuilt.push(Some((std::mem::take(&mut regions[slot]), boundary)));
    }

    for (&i, update) in group.iter().zip(rebuilt) {
        if let Some((region, boundary)) = update {
            peaks[i].commit_region(region, boundary);
        }
    }

    Ok(())
}

/// Collapses the group into its most intense member. The absorber is the
/// member with the greatest seed apex intensity (lowest group index on ties);
/// every other member's points move into it and the donors are flagged for
/// compaction.
fn merge_group(
    peaks: &mut [PeakArea],
    group: &[usize],
    reconstructor: &dyn BoundaryReconstructor,
) -> Result<(), ResolveError> {
    let mut absorber = 0usize;
    for (slot, &i) in group.iter().enumerate() {
        if peaks[i].seed_intensity > peaks[group[absorber]].seed_intensity {
            absorber = slot;
        }
    }
    let absorber_idx = group[absorber];

    let mut region: BTreeMap<GridPoint, f64> = BTreeMap::new();
    for &i in group {
        region.extend(peaks[i].region().iter().map(|(&p, &v)| (p, v)));
    }

    let coords: Vec<GridPoint> = region.keys().copied().collect();
    let boundary = reconstructor
        .recompute(&coords)
        .map_err(|source| ResolveError::Boundary { peak: absorber_idx, source })?;

    peaks[absorber_idx].commit_region(region, boundary);
    for &i in group {
        if i != absorber_idx {
            peaks[i].mark_merged();
        }
    }

    Ok(())
}

/// Resolves one overlap group in place. Groups of one are a no-op; the
/// returned decision is what was applied.
pub fn resolve_group(
    peaks: &mut [PeakArea],
    group: &[usize],
    grid: &dyn ScanGrid,
    affinity: &dyn PeakAffinity,
    reconstructor: &dyn BoundaryReconstructor,
    opts: &ResolveOpts,
) -> Result<Option<GroupDecision>, ResolveError> {
    if group.len() < 2 {
        return Ok(None);
    }

    let min_score = min_seed_affinity(peaks, group, affinity);
    let decision = if min_score < opts.merge_threshold {
        GroupDecision::Separate
    } else {
        GroupDecision::Merge
    };
    debug!(
        "group {:?}: min seed affinity {:.4} -> {:?}",
        group, min_score, decision
    );

    match decision {
        GroupDecision::Separate => separate_group(peaks, group, grid, affinity, reconstructor, opts)?,
        GroupDecision::Merge => merge_group(peaks, group, reconstructor)?,
    }

    Ok(Some(decision))
}

/// Full per-chromatogram pass: cluster overlapping areas, resolve every
/// group, then compact the peak list (absorbed areas are removed). The peak
/// list must be complete and stable before the call; nothing may append to it
/// concurrently.
pub fn resolve_chromatogram(
    peaks: &mut Vec<PeakArea>,
    grid: &dyn ScanGrid,
    affinity: &dyn PeakAffinity,
    reconstructor: &dyn BoundaryReconstructor,
    opts: &ResolveOpts,
) -> Result<(), ResolveError> {
    let groups = overlap_groups(peaks);
    for group in &groups {
        resolve_group(peaks, group, grid, affinity, reconstructor, opts)?;
    }
    peaks.retain(|p| !p.is_merged());
    Ok(())
}

/// Resolves many chromatograms, one worker per chromatogram. Chromatograms
/// share no mutable state; the error of the first failing chromatogram (by
/// slice order) is returned.
pub fn resolve_chromatograms(
    chromatograms: &mut [Vec<PeakArea>],
    grids: &[&dyn ScanGrid],
    affinity: &dyn PeakAffinity,
    reconstructor: &dyn BoundaryReconstructor,
    opts: &ResolveOpts,
) -> Result<(), ResolveError> {
    debug_assert_eq!(chromatograms.len(), grids.len());

    let mut results: Vec<Result<(), ResolveError>> = Vec::new();
    chromatograms
        .par_iter_mut()
        .zip(grids.par_iter())
        .map(|(peaks, grid)| resolve_chromatogram(peaks, *grid, affinity, reconstructor, opts))
        .collect_into_vec(&mut results);

    results.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolve::area::EdgeTraceBoundary;
    use gccore::data::grid::DenseScanGrid;
    use std::collections::BTreeSet;

    /// Affinity keyed on the base peak of each spectrum: two spectra agree
    /// iff their base-peak m/z match, and positional deltas only break ties.
    struct BasePeakAffinity {
        table: Vec<((i64, i64), f64)>,
    }

    impl BasePeakAffinity {
        fn new(entries: &[((f64, f64), f64)]) -> Self {
            let table = entries
                .iter()
                .map(|&((a, b), s)| ((a.round() as i64, b.round() as i64), s))
                .collect();
            BasePeakAffinity { table }
        }

        fn lookup(&self, a: i64, b: i64) -> Option<f64> {
            self.table
                .iter()
                .find(|&&((x, y), _)| (x == a && y == b) || (x == b && y == a))
                .map(|&(_, s)| s)
        }
    }

    impl PeakAffinity for BasePeakAffinity {
        fn score(&self, dx: f64, dy: f64, a: &MassSpectrum, b: &MassSpectrum) -> f64 {
            let (ka, _) = a.base_peak().unwrap_or((0.0, 0.0));
            let (kb, _) = b.base_peak().unwrap_or((0.0, 0.0));
            let (ka, kb) = (ka.round() as i64, kb.round() as i64);
            let spectral = if ka == kb {
                1.0
            } else {
                self.lookup(ka, kb).unwrap_or(0.0)
            };
            spectral * (-(dx + dy)).exp()
        }
    }

    fn spectrum(mz: f64) -> MassSpectrum {
        MassSpectrum::new(vec![mz], vec![100.0])
    }

    fn block_area(seed: GridPoint, half: i32, mz: f64, apex: f64) -> PeakArea {
        let points = (-half..=half).flat_map(|dx| {
            (-half..=half).map(move |dy| (GridPoint::new(seed.x + dx, seed.y + dy), apex / 2.0))
        });
        PeakArea::with_region(seed, spectrum(mz), apex, points, &EdgeTraceBoundary).unwrap()
    }

    fn grid_for(peaks: &[PeakArea], modulations: usize, offsets: usize) -> DenseScanGrid {
        let mut grid = DenseScanGrid::new(modulations, offsets);
        for peak in peaks {
            for (&p, _) in peak.region() {
                // each cell carries the spectrum of the nearest seed, the seed
                // cell carries the seed spectrum itself
                let d_own = (p.x - peak.seed.x).abs() + (p.y - peak.seed.y).abs();
                let closer = peaks.iter().any(|other| {
                    (p.x - other.seed.x).abs() + (p.y - other.seed.y).abs() < d_own
                });
                if !closer {
                    grid.insert(p, peak.seed_spectrum.clone());
                }
            }
        }
        grid
    }

    fn owned_points(peaks: &[PeakArea], group: &[usize]) -> BTreeSet<GridPoint> {
        group
            .iter()
            .flat_map(|&i| peaks[i].region().keys().copied())
            .collect()
    }

    #[test]
    fn test_minimum_governs_group_decision() {
        // pairwise seed scores: A-B 0.80, A-C 0.999, B-C 0.85; the 0.80 pair
        // forces separation even though A-C alone looks like a merge
        let affinity = BasePeakAffinity::new(&[
            ((73.0, 147.0), 0.80),
            ((73.0, 221.0), 0.999),
            ((147.0, 221.0), 0.85),
        ]);
        let peaks = vec![
            block_area(GridPoint::new(4, 4), 2, 73.0, 100.0),
            block_area(GridPoint::new(6, 4), 2, 147.0, 90.0),
            block_area(GridPoint::new(5, 6), 2, 221.0, 80.0),
        ];
        let min = min_seed_affinity(&peaks, &[0, 1, 2], &affinity);
        assert!((min - 0.80).abs() < 1e-9);

        let mut peaks = peaks;
        let grid = grid_for(&peaks, 16, 16);
        let decision = resolve_group(
            &mut peaks,
            &[0, 1, 2],
            &grid,
            &affinity,
            &EdgeTraceBoundary,
            &ResolveOpts::default(),
        )
        .unwrap();
        assert_eq!(decision, Some(GroupDecision::Separate));
        assert!(peaks.iter().all(|p| !p.is_merged()));
    }

    #[test]
    fn test_merge_keeps_most_intense_seed() {
        let affinity = BasePeakAffinity::new(&[((73.0, 74.0), 0.999)]);
        let mut peaks = vec![
            block_area(GridPoint::new(4, 4), 2, 73.0, 120.0),
            block_area(GridPoint::new(5, 5), 2, 74.0, 340.0),
        ];
        let before = owned_points(&peaks, &[0, 1]);
        let grid = grid_for(&peaks, 16, 16);

        let decision = resolve_group(
            &mut peaks,
            &[0, 1],
            &grid,
            &affinity,
            &EdgeTraceBoundary,
            &ResolveOpts::default(),
        )
        .unwrap();
        assert_eq!(decision, Some(GroupDecision::Merge));

        assert!(peaks[0].is_merged());
        assert!(!peaks[1].is_merged());
        assert_eq!(peaks[1].seed, GridPoint::new(5, 5));
        assert_eq!(owned_points(&peaks, &[1]), before);

        peaks.retain(|p| !p.is_merged());
        assert_eq!(peaks.len(), 1);
        assert_eq!(peaks[0].seed_intensity, 340.0);
    }

    #[test]
    fn test_separation_conserves_points() {
        let affinity = BasePeakAffinity::new(&[((73.0, 147.0), 0.5)]);
        let mut peaks = vec![
            block_area(GridPoint::new(4, 4), 2, 73.0, 100.0),
            block_area(GridPoint::new(6, 6), 2, 147.0, 90.0),
        ];
        let before = owned_points(&peaks, &[0, 1]);
        let grid = grid_for(&peaks, 16, 16);

        let decision = resolve_group(
            &mut peaks,
            &[0, 1],
            &grid,
            &affinity,
            &EdgeTraceBoundary,
            &ResolveOpts::default(),
        )
        .unwrap();
        assert_eq!(decision, Some(GroupDecision::Separate));

        let after = owned_points(&peaks, &[0, 1]);
        assert_eq!(before, after);
        let total: usize = peaks.iter().map(|p| p.point_count()).sum();
        assert_eq!(total, before.len());

        // both survivors keep their seeds
        assert!(peaks[0].contains(GridPoint::new(4, 4)));
        assert!(peaks[1].contains(GridPoint::new(6, 6)));
    }

    #[test]
    fn test_resolution_is_idempotent() {
        let affinity = BasePeakAffinity::new(&[((73.0, 147.0), 0.5)]);
        let mut peaks = vec![
            block_area(GridPoint::new(4, 4), 2, 73.0, 100.0),
            block_area(GridPoint::new(6, 6), 2, 147.0, 90.0),
        ];
        let grid = grid_for(&peaks, 16, 16);

        resolve_chromatogram(&mut peaks, &grid, &affinity, &EdgeTraceBoundary, &ResolveOpts::default())
            .unwrap();

        let regroups = overlap_groups(&peaks);
        assert!(regroups.iter().all(|g| g.len() == 1));
    }

    #[test]
    fn test_singleton_group_is_untouched() {
        let affinity = BasePeakAffinity::new(&[]);
        let mut peaks = vec![block_area(GridPoint::new(4, 4), 2, 73.0, 100.0)];
        let before = peaks[0].clone();
        let grid = grid_for(&peaks, 16, 16);

        let decision = resolve_group(
            &mut peaks,
            &[0],
            &grid,
            &affinity,
            &EdgeTraceBoundary,
            &ResolveOpts::default(),
        )
        .unwrap();
        assert_eq!(decision, None);
        assert_eq!(peaks[0].region(), before.region());
    }

    #[test]
    fn test_separation_is_deterministic() {
        let affinity = BasePeakAffinity::new(&[((73.0, 147.0), 0.5)]);
        let build = || {
            vec![
                block_area(GridPoint::new(4, 4), 3, 73.0, 100.0),
                block_area(GridPoint::new(6, 5), 3, 147.0, 90.0),
            ]
        };

        let mut first = build();
        let grid = grid_for(&first, 16, 16);
        resolve_chromatogram(&mut first, &grid, &affinity, &EdgeTraceBoundary, &ResolveOpts::default())
            .unwrap();

        let mut second = build();
        resolve_chromatogram(&mut second, &grid, &affinity, &EdgeTraceBoundary, &ResolveOpts::default())
            .unwrap();

        for (a, b) in first.iter().zip(second.iter()) {
            assert_eq!(a.region(), b.region());
            assert_eq!(a.boundary(), b.boundary());
        }
    }

    #[test]
    fn test_randomized_resolution_is_deterministic() {
        use rand::prelude::*;

        let build = |seed: u64| {
            let mut rng = StdRng::seed_from_u64(seed);
            let mz_choices = [73.0, 91.0, 147.0, 207.0];
            let mut peaks = Vec::new();
            for _ in 0..12 {
                let seed_pt = GridPoint::new(rng.gen_range(3..27), rng.gen_range(3..27));
                let half = rng.gen_range(1..=3);
                let mz = mz_choices[rng.gen_range(0..mz_choices.len())];
                let apex = rng.gen_range(50.0..500.0);
                peaks.push(block_area(seed_pt, half, mz, apex));
            }
            peaks
        };

        let affinity = BasePeakAffinity::new(&[
            ((73.0, 91.0), 0.3),
            ((73.0, 147.0), 0.5),
            ((73.0, 207.0), 0.2),
            ((91.0, 147.0), 0.4),
            ((91.0, 207.0), 0.6),
            ((147.0, 207.0), 0.1),
        ]);

        let mut first = build(7);
        let grid = grid_for(&first, 32, 32);
        let before = owned_points(&first, &(0..first.len()).collect::<Vec<_>>());
        resolve_chromatogram(&mut first, &grid, &affinity, &EdgeTraceBoundary, &ResolveOpts::default())
            .unwrap();

        let mut second = build(7);
        resolve_chromatogram(&mut second, &grid, &affinity, &EdgeTraceBoundary, &ResolveOpts::default())
            .unwrap();

        assert_eq!(first.len(), second.len());
        for (a, b) in first.iter().zip(second.iter()) {
            assert_eq!(a.seed, b.seed);
            assert_eq!(a.region(), b.region());
            assert_eq!(a.boundary(), b.boundary());
        }

        // no grid point appeared or vanished across the whole pass
        let after = owned_points(&first, &(0..first.len()).collect::<Vec<_>>());
        assert_eq!(before, after);
    }

    #[test]
    fn test_default_stack_end_to_end() {
        use crate::align::clique::assemble_cliques;
        use crate::align::matching::{match_rows, CancelToken, SeedSimilarity};
        use gccore::algorithm::affinity::SpectralAffinity;

        let analyte_a = MassSpectrum::new(vec![73.0, 147.0], vec![100.0, 50.0]);
        let analyte_b = MassSpectrum::new(vec![91.0, 207.0], vec![80.0, 40.0]);
        let analyte_c = MassSpectrum::new(vec![255.0], vec![60.0]);

        let block = |seed: GridPoint, spectrum: &MassSpectrum, apex: f64| {
            let points = (-1..=1).flat_map(|dx| {
                (-1..=1).map(move |dy| (GridPoint::new(seed.x + dx, seed.y + dy), apex / 2.0))
            });
            PeakArea::with_region(seed, spectrum.clone(), apex, points, &EdgeTraceBoundary).unwrap()
        };

        let mut chromatograms = vec![
            vec![
                block(GridPoint::new(5, 5), &analyte_a, 200.0),
                block(GridPoint::new(12, 9), &analyte_b, 150.0),
                block(GridPoint::new(20, 3), &analyte_c, 90.0),
            ],
            vec![
                block(GridPoint::new(6, 5), &analyte_a, 210.0),
                block(GridPoint::new(13, 9), &analyte_b, 140.0),
            ],
        ];

        let grids: Vec<DenseScanGrid> = chromatograms
            .iter()
            .map(|peaks| {
                let mut grid = DenseScanGrid::new(32, 16);
                for peak in peaks {
                    for (&p, _) in peak.region() {
                        grid.insert(p, peak.seed_spectrum.clone());
                    }
                }
                grid
            })
            .collect();
        let grid_refs: Vec<&dyn ScanGrid> = grids.iter().map(|g| g as &dyn ScanGrid).collect();

        let affinity = SpectralAffinity::default();
        resolve_chromatograms(
            &mut chromatograms,
            &grid_refs,
            &affinity,
            &EdgeTraceBoundary,
            &ResolveOpts::default(),
        )
        .unwrap();
        assert_eq!(chromatograms[0].len(), 3);
        assert_eq!(chromatograms[1].len(), 2);

        let sim = SeedSimilarity::new(SpectralAffinity::default(), 16);
        let rows = match_rows(&chromatograms, 0, &sim, &CancelToken::new()).unwrap();
        assert_eq!(rows.len(), 3);

        let (cliques, missing) = assemble_cliques(&rows, &chromatograms).unwrap();
        assert_eq!(cliques.len(), 2);
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].absent_chromatograms, vec![1]);
        assert_eq!(missing[0].mean_x, 20.0);
        assert_eq!(missing[0].seed_spectra, vec![analyte_c]);
    }

    #[test]
    fn test_parallel_chromatograms_match_sequential() {
        let affinity = BasePeakAffinity::new(&[((73.0, 147.0), 0.5)]);
        let build = || {
            vec![
                block_area(GridPoint::new(4, 4), 2, 73.0, 100.0),
                block_area(GridPoint::new(6, 6), 2, 147.0, 90.0),
            ]
        };

        let mut sequential = vec![build(), build()];
        let grid_a = grid_for(&sequential[0], 16, 16);
        let grid_b = grid_for(&sequential[1], 16, 16);
        for (peaks, grid) in sequential.iter_mut().zip([&grid_a, &grid_b]) {
            resolve_chromatogram(peaks, grid, &affinity, &EdgeTraceBoundary, &ResolveOpts::default())
                .unwrap();
        }

        let mut parallel = vec![build(), build()];
        resolve_chromatograms(
            &mut parallel,
            &[&grid_a, &grid_b],
            &affinity,
            &EdgeTraceBoundary,
            &ResolveOpts::default(),
        )
        .unwrap();

        for (a, b) in sequential.iter().zip(parallel.iter()) {
            assert_eq!(a.len(), b.len());
            for (pa, pb) in a.iter().zip(b.iter()) {
                assert_eq!(pa.region(), pb.region());
            }
        }
    }
}
