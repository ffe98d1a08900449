use itertools::{EitherOrBoth, Itertools};

use crate::data::spectrum::MassSpectrum;

/// Scores how well two peak candidates agree, from their scaled positional
/// offsets and their mass spectra. Higher is more similar.
///
/// Called with zero deltas on two seed spectra, the same function serves as
/// the pairwise distinctness metric for the separate-or-merge decision.
/// Implementations are free to be asymmetric; consumers must not assume a
/// metric (no symmetry, no triangle inequality).
pub trait PeakAffinity: Send + Sync {
    fn score(&self, dx_scaled: f64, dy_scaled: f64, a: &MassSpectrum, b: &MassSpectrum) -> f64;
}

/// Knobs for [`SpectralAffinity`]. Defaults keep every signal and bin m/z to
/// one decimal place, which is coarse enough to absorb calibration jitter
/// between neighbouring cells.
#[derive(Clone, Debug)]
pub struct SpectralAffinityOpts {
    /// Decimal places m/z values are binned to before comparison.
    pub resolution: i32,
    /// Signals below this intensity are dropped before binning.
    pub noise_floor: f64,
    /// Scale of the exponential positional decay; the spectral score is
    /// multiplied by `exp(-(dx_scaled + dy_scaled) / decay_scale)`.
    pub decay_scale: f64,
}

impl Default for SpectralAffinityOpts {
    fn default() -> Self {
        Self {
            resolution: 1,
            noise_floor: 0.0,
            decay_scale: 1.0,
        }
    }
}

/// Default affinity: cosine similarity of the binned spectra, damped by an
/// exponential penalty on the positional offset. Identical spectra at zero
/// offset score 1.0.
#[derive(Clone, Debug, Default)]
pub struct SpectralAffinity {
    pub opts: SpectralAffinityOpts,
}

impl SpectralAffinity {
    pub fn new(opts: SpectralAffinityOpts) -> Self {
        SpectralAffinity { opts }
    }

    fn prepared(&self, s: &MassSpectrum) -> MassSpectrum {
        let filtered = if self.opts.noise_floor > 0.0 {
            s.filter_ranged(f64::MIN, f64::MAX, self.opts.noise_floor, f64::MAX)
        } else {
            s.clone()
        };
        filtered.to_resolution(self.opts.resolution)
    }
}

/// Cosine over two sparse spectra with strictly increasing m/z vectors.
/// Signals present in only one of the two contribute to its norm alone.
fn sparse_cosine(a: &MassSpectrum, b: &MassSpectrum) -> f64 {
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;

    let pairs_a = a.mz.iter().zip(a.intensity.iter());
    let pairs_b = b.mz.iter().zip(b.intensity.iter());

    for merged in pairs_a.merge_join_by(pairs_b, |(mz_a, _), (mz_b, _)| mz_a.total_cmp(mz_b)) {
        match merged {
            EitherOrBoth::Both((_, ia), (_, ib)) => {
                dot += ia * ib;
                norm_a += ia * ia;
                norm_b += ib * ib;
            }
            EitherOrBoth::Left((_, ia)) => norm_a += ia * ia,
            EitherOrBoth::Right((_, ib)) => norm_b += ib * ib,
        }
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a.sqrt() * norm_b.sqrt())
    }
}

impl PeakAffinity for SpectralAffinity {
    fn score(&self, dx_scaled: f64, dy_scaled: f64, a: &MassSpectrum, b: &MassSpectrum) -> f64 {
        let spectral = sparse_cosine(&self.prepared(a), &self.prepared(b));
        if spectral == 0.0 {
            return 0.0;
        }

        let offset = dx_scaled.abs() + dy_scaled.abs();
        if offset == 0.0 {
            return spectral;
        }
        let scale = self.opts.decay_scale.max(f64::EPSILON);
        spectral * (-offset / scale).exp()
    }
}
