//! Turn a registration artifact into the transform the resampler needs.
//!
//! Registration objects do not say whether they map moving→fixed or the
//! other way round. Resolution runs in a fixed order:
//!
//! 1. load the artifact and flatten it,
//! 2. optionally invert it once into the moving→fixed convention,
//! 3. probe the fixed bounds with moving points to pick a direction,
//! 4. invert the moving→fixed result into output→input for resampling.
//!
//! Inversion failures never abort; the transform is used as given and the
//! fallback is recorded in [`Diagnostics`].

use std::path::PathBuf;

use nalgebra::Vector3;

use super::flatten::flatten;
use super::io::read_transform_file;
use super::{AffineTransform, SpatialTransform};
use crate::diagnostics::{Diagnostics, InversionOutcome, InversionStage, TraceEvent};
use crate::error::Result;
use crate::volume::Volume;

/// Slack for points landing exactly on the fixed bounding box.
const BOUNDS_EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq)]
pub enum TransformSource {
    /// Registration matrix, 16 values row-major, fixed→moving.
    Matrix(Vec<f64>),
    File { path: PathBuf, invert: bool },
}

#[derive(Debug, Clone)]
pub struct ResolvedTransform {
    pub moving_to_fixed: SpatialTransform,
    /// What the resampler applies to output (fixed grid) points.
    pub output_to_input: SpatialTransform,
}

pub struct TransformResolver;

impl TransformResolver {
    pub fn resolve(
        fixed: &Volume,
        moving: &Volume,
        source: &TransformSource,
        diagnostics: &mut Diagnostics,
    ) -> Result<ResolvedTransform> {
        let loaded = Self::load(source, diagnostics)?;
        let moving_to_fixed = Self::pick_moving_to_fixed(fixed, moving, loaded, diagnostics);
        let output_to_input = Self::invert_or_keep(&moving_to_fixed, InversionStage::Resample, diagnostics);
        Ok(ResolvedTransform {
            moving_to_fixed,
            output_to_input,
        })
    }

    /// Read and flatten the artifact, then apply the initial inversion:
    /// always for a matrix, and for files when `invert` is set.
    pub fn load(source: &TransformSource, diagnostics: &mut Diagnostics) -> Result<SpatialTransform> {
        let (raw, invert) = match source {
            TransformSource::Matrix(values) => (
                SpatialTransform::Affine(AffineTransform::from_row_major(values)?),
                true,
            ),
            TransformSource::File { path, invert } => (read_transform_file(path)?, *invert),
        };

        let flattened = Self::flatten(&raw, diagnostics);
        Ok(if invert {
            Self::invert_or_keep(&flattened, InversionStage::Initial, diagnostics)
        } else {
            flattened
        })
    }

    pub fn flatten(transform: &SpatialTransform, diagnostics: &mut Diagnostics) -> SpatialTransform {
        if !matches!(transform, SpatialTransform::Composite(_)) {
            return transform.clone();
        }
        let flattened = flatten(transform);
        diagnostics.record(TraceEvent::Flattened {
            input: transform.name(),
            output: flattened.transform.name(),
            leaves: flattened.leaves,
        });
        flattened.transform
    }

    /// Keep `transform` or its inverse, whichever lands more probe points of
    /// the moving volume inside the fixed bounds. Ties keep `transform`.
    pub fn pick_moving_to_fixed(
        fixed: &Volume,
        moving: &Volume,
        transform: SpatialTransform,
        diagnostics: &mut Diagnostics,
    ) -> SpatialTransform {
        let bounds = fixed.bounds();
        let probes = Self::probe_points(moving);

        let forward = Self::score(&bounds, &probes, &transform);
        let inverse = transform.try_invert().ok();
        let inverse_score = inverse
            .as_ref()
            .map_or(-1, |inverse| Self::score(&bounds, &probes, inverse));

        let inverted = inverse_score > forward;
        diagnostics.record(TraceEvent::DirectionProbe {
            forward,
            inverse: inverse_score,
            inverted,
        });

        match inverse {
            Some(inverse) if inverted => inverse,
            _ => transform,
        }
    }

    /// Centre voxel plus four extreme corners of `volume`, in world space.
    pub fn probe_points(volume: &Volume) -> [Vector3<f64>; 5] {
        let (nx, ny, nz) = volume.size();
        let last = |n: usize| n.saturating_sub(1) as f64;
        let (x, y, z) = (last(nx), last(ny), last(nz));
        [
            ((nx / 2) as f64, (ny / 2) as f64, (nz / 2) as f64),
            (0.0, 0.0, 0.0),
            (x, 0.0, 0.0),
            (0.0, y, 0.0),
            (x, y, z),
        ]
        .map(|(i, j, k)| volume.index_to_world(Vector3::new(i, j, k)))
    }

    pub fn score(
        bounds: &(Vector3<f64>, Vector3<f64>),
        probes: &[Vector3<f64>],
        transform: &SpatialTransform,
    ) -> i32 {
        let (min, max) = bounds;
        probes
            .iter()
            .map(|probe| transform.apply(*probe))
            .filter(|point| {
                (0..3).all(|axis| {
                    point[axis] >= min[axis] - BOUNDS_EPSILON
                        && point[axis] <= max[axis] + BOUNDS_EPSILON
                })
            })
            .count() as i32
    }

    fn invert_or_keep(
        transform: &SpatialTransform,
        stage: InversionStage,
        diagnostics: &mut Diagnostics,
    ) -> SpatialTransform {
        match transform.try_invert() {
            Ok(inverse) => {
                diagnostics.record(TraceEvent::Inversion {
                    stage,
                    outcome: InversionOutcome::Applied,
                });
                inverse
            }
            Err(err) => {
                diagnostics.record(TraceEvent::Inversion {
                    stage,
                    outcome: InversionOutcome::KeptOriginal {
                        reason: err.to_string(),
                    },
                });
                transform.clone()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::tests::{Squash, translation};
    use crate::volume::tests::cube;
    use approx::assert_relative_eq;
    use std::sync::Arc;

    /// Fixed at the origin, moving 100 mm along x: moving→fixed is a -100 shift.
    fn shifted_pair() -> (Volume, Volume) {
        (
            cube(10, 0.0, Vector3::zeros()),
            cube(10, 0.0, Vector3::new(100.0, 0.0, 0.0)),
        )
    }

    #[test]
    fn correct_direction_scores_at_least_its_inverse() {
        let (fixed, moving) = shifted_pair();
        let mut diagnostics = Diagnostics::new();
        let picked = TransformResolver::pick_moving_to_fixed(
            &fixed,
            &moving,
            translation(-100.0, 0.0, 0.0),
            &mut diagnostics,
        );
        let (forward, inverse, inverted) = diagnostics.direction_probe().unwrap();
        assert!(forward >= inverse);
        assert_eq!((forward, inverse, inverted), (5, 0, false));
        assert_relative_eq!(picked.apply(Vector3::zeros()), Vector3::new(-100.0, 0.0, 0.0));
    }

    #[test]
    fn true_inverse_input_gets_inverted() {
        let (fixed, moving) = shifted_pair();
        let mut diagnostics = Diagnostics::new();
        let picked = TransformResolver::pick_moving_to_fixed(
            &fixed,
            &moving,
            translation(100.0, 0.0, 0.0),
            &mut diagnostics,
        );
        assert_eq!(diagnostics.direction_probe(), Some((0, 5, true)));
        assert_relative_eq!(picked.apply(Vector3::zeros()), Vector3::new(-100.0, 0.0, 0.0));
    }

    #[test]
    fn ties_keep_the_given_direction() {
        let (fixed, _) = shifted_pair();
        let mut diagnostics = Diagnostics::new();
        let far = cube(10, 0.0, Vector3::new(0.0, 500.0, 0.0));
        TransformResolver::pick_moving_to_fixed(
            &fixed,
            &far,
            translation(1.0, 0.0, 0.0),
            &mut diagnostics,
        );
        assert_eq!(diagnostics.direction_probe(), Some((0, 0, false)));
    }

    #[test]
    fn non_invertible_transform_scores_inverse_as_minus_one() {
        let (fixed, moving) = shifted_pair();
        let mut diagnostics = Diagnostics::new();
        let squash = SpatialTransform::Opaque(Arc::new(Squash));
        TransformResolver::pick_moving_to_fixed(&fixed, &moving, squash, &mut diagnostics);
        let (_, inverse, inverted) = diagnostics.direction_probe().unwrap();
        assert_eq!(inverse, -1);
        assert!(!inverted);
    }

    #[test]
    fn matrix_sources_are_inverted_then_resolved_for_resampling() {
        // Registration matrix maps fixed→moving: +100 along x.
        let (fixed, moving) = shifted_pair();
        let mut values = vec![0.0; 16];
        for i in [0, 5, 10, 15] {
            values[i] = 1.0;
        }
        values[3] = 100.0;

        let mut diagnostics = Diagnostics::new();
        let resolved = TransformResolver::resolve(
            &fixed,
            &moving,
            &TransformSource::Matrix(values),
            &mut diagnostics,
        )
        .unwrap();

        assert_relative_eq!(
            resolved.moving_to_fixed.apply(Vector3::new(100.0, 0.0, 0.0)),
            Vector3::zeros()
        );
        assert_relative_eq!(
            resolved.output_to_input.apply(Vector3::zeros()),
            Vector3::new(100.0, 0.0, 0.0)
        );
        assert_eq!(
            diagnostics.inversions(InversionStage::Initial),
            vec![&InversionOutcome::Applied]
        );
        assert_eq!(
            diagnostics.inversions(InversionStage::Resample),
            vec![&InversionOutcome::Applied]
        );
        assert_eq!(diagnostics.direction_probe(), Some((5, 0, false)));
    }

    #[test]
    fn failed_resample_inversion_falls_back_to_given_transform() {
        let mut diagnostics = Diagnostics::new();
        let squash = SpatialTransform::Opaque(Arc::new(Squash));
        let kept =
            TransformResolver::invert_or_keep(&squash, InversionStage::Resample, &mut diagnostics);
        assert_eq!(kept.name(), "Squash");
        assert!(matches!(
            diagnostics.inversions(InversionStage::Resample).as_slice(),
            [InversionOutcome::KeptOriginal { .. }]
        ));
    }

    #[test]
    fn file_sources_honour_the_invert_flag() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reg.json");
        std::fs::write(
            &path,
            r#"{"type": "composite", "children": [
                {"type": "identity"},
                {"type": "translation", "offset": [0, 0, 7]}
            ]}"#,
        )
        .unwrap();

        for (invert, expected_z) in [(true, -7.0), (false, 7.0)] {
            let mut diagnostics = Diagnostics::new();
            let loaded = TransformResolver::load(
                &TransformSource::File {
                    path: path.clone(),
                    invert,
                },
                &mut diagnostics,
            )
            .unwrap();
            assert_relative_eq!(loaded.apply(Vector3::zeros()).z, expected_z);
            assert!(matches!(
                diagnostics.events.first(),
                Some(TraceEvent::Flattened { leaves: 1, .. })
            ));
            assert_eq!(
                diagnostics.inversions(InversionStage::Initial).len(),
                usize::from(invert)
            );
        }
    }
}
