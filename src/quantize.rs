//! Sample statistics and fixed-point quantization of float volumes.

use ndarray::{Array3, Zip};
use rayon::prelude::*;
use serde::Serialize;

/// Largest stored value of the unsigned 16-bit range.
pub const U16_LEVELS: f64 = 65535.0;

/// Narrowest window ever reported.
const MIN_WINDOW_WIDTH: f64 = 1e-3;

/// Minimum and maximum over the finite samples.
pub fn finite_range<'a>(samples: impl IntoIterator<Item = &'a f32>) -> Option<(f64, f64)> {
    samples
        .into_iter()
        .filter(|v| v.is_finite())
        .map(|&v| f64::from(v))
        .fold(None, |acc, v| match acc {
            Some((lo, hi)) => Some((f64::min(lo, v), f64::max(hi, v))),
            None => Some((v, v)),
        })
}

/// Percentile `q` (0..=100) of ascending `sorted`, interpolating linearly
/// between the two closest ranks.
pub fn percentile(sorted: &[f64], q: f64) -> Option<f64> {
    let last = sorted.len().checked_sub(1)?;
    let rank = (q.clamp(0.0, 100.0) / 100.0) * last as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let fraction = rank - lo as f64;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * fraction)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct WindowLevel {
    pub center: f64,
    pub width: f64,
}

impl WindowLevel {
    pub fn from_range(min: f64, max: f64) -> Self {
        Self {
            center: (min + max) / 2.0,
            width: MIN_WINDOW_WIDTH.max(max - min),
        }
    }

    /// Display default spanning the 1st to 99th percentile of the finite
    /// samples. Falls back to the full range when those coincide, and to
    /// `0..1` when nothing is finite.
    pub fn from_percentiles(data: &Array3<f32>) -> Self {
        let mut finite: Vec<f64> = data
            .iter()
            .filter(|v| v.is_finite())
            .map(|&v| f64::from(v))
            .collect();
        if finite.is_empty() {
            return Self::from_range(0.0, 1.0);
        }
        finite.par_sort_unstable_by(f64::total_cmp);

        let (Some(p1), Some(p99)) = (percentile(&finite, 1.0), percentile(&finite, 99.0)) else {
            return Self::from_range(0.0, 1.0);
        };
        if p1 == p99 {
            let (min, max) = (finite[0], finite[finite.len() - 1]);
            return Self::from_range(min, max);
        }
        Self::from_range(p1, p99)
    }
}

/// A float volume mapped onto the unsigned 16-bit range.
/// `original ≈ stored * slope + intercept`.
#[derive(Debug, Clone)]
pub struct Quantized {
    pub data: Array3<u16>,
    pub slope: f64,
    pub intercept: f64,
    pub min: f64,
    pub max: f64,
}

impl Quantized {
    /// Quantize over the finite range. Non-finite samples store 0. A
    /// constant volume uses `value..value + 1` so it still restores to its
    /// value; an empty one uses `0..1`.
    pub fn from_volume_data(data: &Array3<f32>) -> Self {
        let (min, max) = match finite_range(data.iter()) {
            Some((lo, hi)) if lo != hi => (lo, hi),
            Some((lo, _)) => (lo, lo + 1.0),
            None => (0.0, 1.0),
        };
        let slope = match (max - min) / U16_LEVELS {
            s if s > 0.0 && s.is_finite() => s,
            _ => 1.0,
        };
        let intercept = min;

        let mut stored = Array3::<u16>::zeros(data.dim());
        Zip::from(&mut stored).and(data).par_for_each(|out, &v| {
            if v.is_finite() {
                *out = ((f64::from(v) - intercept) / slope).round().clamp(0.0, U16_LEVELS) as u16;
            }
        });

        Self {
            data: stored,
            slope,
            intercept,
            min,
            max,
        }
    }

    pub fn window(&self) -> WindowLevel {
        WindowLevel::from_range(self.min, self.max)
    }

    pub fn restore(&self) -> Array3<f32> {
        self.data
            .mapv(|v| (f64::from(v) * self.slope + self.intercept) as f32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn percentile_interpolates_between_ranks() {
        let sorted: Vec<f64> = (0..=10).map(f64::from).collect();
        assert_relative_eq!(percentile(&sorted, 1.0).unwrap(), 0.1);
        assert_relative_eq!(percentile(&sorted, 99.0).unwrap(), 9.9);
        assert_relative_eq!(percentile(&sorted, 50.0).unwrap(), 5.0);
        assert_eq!(percentile(&[], 50.0), None);
        assert_eq!(percentile(&[4.0], 99.0), Some(4.0));
    }

    #[test]
    fn quantization_round_trip_stays_within_one_level() {
        let data = Array3::from_shape_fn((3, 4, 5), |(k, j, i)| {
            -1000.0 + 37.3 * (i + 5 * j + 20 * k) as f32
        });
        let quantized = Quantized::from_volume_data(&data);
        let (min, max) = (quantized.min, quantized.max);
        assert_relative_eq!(min, -1000.0);
        assert_relative_eq!(quantized.slope, (max - min) / U16_LEVELS);
        assert_eq!(quantized.data[[0, 0, 0]], 0);
        assert_eq!(quantized.data[[2, 3, 4]], u16::MAX);

        let tolerance = (max - min) / U16_LEVELS;
        for (restored, original) in quantized.restore().iter().zip(data.iter()) {
            assert!((f64::from(*restored) - f64::from(*original)).abs() <= tolerance);
        }
    }

    #[test]
    fn non_finite_samples_store_zero() {
        let mut data = Array3::from_elem((1, 2, 2), 5.0f32);
        data[[0, 0, 1]] = 10.0;
        data[[0, 1, 0]] = f32::NAN;
        let quantized = Quantized::from_volume_data(&data);
        assert_eq!(quantized.data[[0, 1, 0]], 0);
        assert_eq!((quantized.min, quantized.max), (5.0, 10.0));
    }

    #[test]
    fn constant_volume_keeps_its_value() {
        let quantized = Quantized::from_volume_data(&Array3::from_elem((2, 2, 2), 3.0f32));
        assert_eq!((quantized.min, quantized.max), (3.0, 4.0));
        assert_eq!(quantized.window(), WindowLevel { center: 3.5, width: 1.0 });

        // A CT entirely outside the primary's field of view is all air.
        let air = Quantized::from_volume_data(&Array3::from_elem((2, 3, 3), -1000.0f32));
        assert_eq!(air.intercept, -1000.0);
        assert!(air.data.iter().all(|&v| v == 0));
        assert!(air.restore().iter().all(|&v| v == -1000.0));
    }

    #[test]
    fn empty_volume_uses_unit_range() {
        let quantized = Quantized::from_volume_data(&Array3::from_elem((1, 2, 2), f32::NAN));
        assert_eq!((quantized.min, quantized.max), (0.0, 1.0));
        assert_eq!(quantized.intercept, 0.0);
    }

    #[test]
    fn window_defaults_follow_percentiles() {
        let data = Array3::from_shape_fn((1, 1, 101), |(_, _, i)| i as f32);
        let window = WindowLevel::from_percentiles(&data);
        assert_relative_eq!(window.center, 50.0);
        assert_relative_eq!(window.width, 98.0);

        let flat = Array3::from_elem((1, 2, 2), 7.0f32);
        assert_eq!(
            WindowLevel::from_percentiles(&flat),
            WindowLevel { center: 7.0, width: 1e-3 }
        );

        let empty = Array3::from_elem((1, 1, 2), f32::NAN);
        assert_eq!(
            WindowLevel::from_percentiles(&empty),
            WindowLevel { center: 0.5, width: 1.0 }
        );
    }
}
