use std::collections::BTreeMap;
use std::fmt;
use std::fmt::{Display, Formatter};

use itertools::izip;
use serde::{Deserialize, Serialize};

/// Represents a mass spectrum recorded at one point of the acquisition grid.
///
/// # Description
///
/// `MassSpectrum` holds m/z values and their intensities as two parallel
/// vectors. An empty spectrum is valid; it is what callers substitute for a
/// failed raw-data lookup.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MassSpectrum {
    pub mz: Vec<f64>,
    pub intensity: Vec<f64>,
}

impl MassSpectrum {
    /// Constructs a new `MassSpectrum`.
    ///
    /// # Arguments
    ///
    /// * `mz` - A vector of m/z values.
    /// * `intensity` - A vector of intensity values corresponding to the m/z values.
    ///
    /// # Example
    ///
    /// ```rust
    /// # use gccore::data::spectrum::MassSpectrum;
    /// let spectrum = MassSpectrum::new(vec![100.0, 200.0], vec![10.0, 20.0]);
    /// assert_eq!(spectrum.mz, vec![100.0, 200.0]);
    /// assert_eq!(spectrum.intensity, vec![10.0, 20.0]);
    /// ```
    pub fn new(mz: Vec<f64>, intensity: Vec<f64>) -> Self {
        debug_assert_eq!(mz.len(), intensity.len());
        MassSpectrum { mz, intensity }
    }

    pub fn len(&self) -> usize {
        self.mz.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mz.is_empty()
    }

    pub fn total_intensity(&self) -> f64 {
        self.intensity.iter().sum()
    }

    /// Returns the (m/z, intensity) pair of the most intense signal, or `None`
    /// for an empty spectrum. Ties resolve to the lowest m/z.
    ///
    /// # Example
    ///
    /// ```rust
    /// # use gccore::data::spectrum::MassSpectrum;
    /// let spectrum = MassSpectrum::new(vec![100.0, 200.0, 300.0], vec![10.0, 45.0, 45.0]);
    /// assert_eq!(spectrum.base_peak(), Some((200.0, 45.0)));
    /// ```
    pub fn base_peak(&self) -> Option<(f64, f64)> {
        let mut best: Option<(f64, f64)> = None;
        for (&mz, &inten) in izip!(&self.mz, &self.intensity) {
            match best {
                Some((_, bi)) if inten <= bi => {}
                _ => best = Some((mz, inten)),
            }
        }
        best
    }

    /// Keeps only signals inside the given m/z and intensity ranges.
    pub fn filter_ranged(&self, mz_min: f64, mz_max: f64, intensity_min: f64, intensity_max: f64) -> Self {
        let mut mz_vec: Vec<f64> = Vec::new();
        let mut intensity_vec: Vec<f64> = Vec::new();

        for (&mz, &intensity) in izip!(&self.mz, &self.intensity) {
            if mz_min <= mz && mz <= mz_max && intensity >= intensity_min && intensity <= intensity_max {
                mz_vec.push(mz);
                intensity_vec.push(intensity);
            }
        }
        MassSpectrum::new(mz_vec, intensity_vec)
    }

    /// Bins the spectrum's m/z values to a given resolution and sums the intensities.
    ///
    /// # Arguments
    ///
    /// * `resolution` - The desired resolution in terms of decimal places. For instance, a resolution of 2
    ///   would bin m/z values to two decimal places.
    ///
    /// # Returns
    ///
    /// A new `MassSpectrum` where m/z values are binned according to the given resolution.
    ///
    /// # Example
    ///
    /// ```rust
    /// # use gccore::data::spectrum::MassSpectrum;
    /// let spectrum = MassSpectrum::new(vec![100.123, 100.121, 100.131], vec![10.0, 20.0, 30.0]);
    /// let binned = spectrum.to_resolution(2);
    /// assert_eq!(binned.mz, vec![100.12, 100.13]);
    /// assert_eq!(binned.intensity, vec![30.0, 30.0]);
    /// ```
    pub fn to_resolution(&self, resolution: i32) -> Self {
        let mut binned: BTreeMap<i64, f64> = BTreeMap::new();
        let factor = 10f64.powi(resolution);

        for (&mz, &inten) in izip!(&self.mz, &self.intensity) {
            let key = (mz * factor).round() as i64;
            *binned.entry(key).or_insert(0.0) += inten;
        }

        let mz: Vec<f64> = binned.keys().map(|&key| key as f64 / factor).collect();
        let intensity: Vec<f64> = binned.values().cloned().collect();

        MassSpectrum::new(mz, intensity)
    }
}

impl Display for MassSpectrum {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.base_peak() {
            Some((mz, inten)) => write!(
                f,
                "MassSpectrum(num_signals: {}, base_peak: ({}, {}))",
                self.len(),
                mz,
                inten
            ),
            None => write!(f, "MassSpectrum(empty)"),
        }
    }
}
