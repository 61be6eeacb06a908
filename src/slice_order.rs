//! Ordering of an unordered stack of slices along the series normal.

use std::path::{Path, PathBuf};

use dicom::object::OpenFileOptions;
use dicom_dictionary_std::tags;
use nalgebra::Vector3;
use rayon::prelude::*;
use serde::Serialize;
use tracing::debug;

use crate::diagnostics::{Diagnostics, TraceEvent};
use crate::error::{FusionError, Result};
use crate::header::SpatialInfo;
use crate::slice::Slice;

/// Depths closer than this share a sort key and keep their input order.
const DEPTH_TOLERANCE: f64 = 1e-6;

/// Slices of one series in canonical (ascending depth) order.
#[derive(Debug, Clone)]
pub struct OrderedSeries {
    pub label: String,
    pub normal: Vector3<f64>,
    pub slices: Vec<Slice>,
    pub depths: Vec<f64>,
}

impl OrderedSeries {
    pub fn len(&self) -> usize {
        self.slices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderedFile {
    pub path: PathBuf,
    pub depth: f64,
}

pub struct SliceOrderResolver;

impl SliceOrderResolver {
    /// Sort `slices` ascending by `dot(position, normal)`, with the normal
    /// taken from the first slice. Ties keep their relative input order.
    pub fn order(
        label: &str,
        slices: Vec<Slice>,
        diagnostics: &mut Diagnostics,
    ) -> Result<OrderedSeries> {
        let first = slices
            .first()
            .ok_or_else(|| FusionError::NoValidSlices(label.to_string()))?;
        let normal = first.spatial.normal()?;

        for slice in &slices {
            if !slice.spatial.is_orthonormal() {
                diagnostics.record(TraceEvent::NonOrthonormalOrientation {
                    source: slice.source.clone(),
                });
            }
        }

        let mut keyed: Vec<(f64, Slice)> = slices
            .into_iter()
            .map(|slice| (slice.spatial.depth(&normal), slice))
            .collect();
        Self::sort_by_depth(&mut keyed);

        let (depths, mut slices): (Vec<_>, Vec<_>) = keyed.into_iter().unzip();
        for (index, slice) in slices.iter_mut().enumerate() {
            slice.instance_index = index;
        }

        debug!(
            series = label,
            count = slices.len(),
            first = depths.first().copied(),
            last = depths.last().copied(),
            "ordered slices"
        );

        Ok(OrderedSeries {
            label: label.to_string(),
            normal,
            slices,
            depths,
        })
    }

    /// Order files by reading only their headers. Files that cannot be
    /// placed in space are skipped and recorded.
    pub fn order_files(
        label: &str,
        paths: &[impl AsRef<Path> + Sync],
        diagnostics: &mut Diagnostics,
    ) -> Result<Vec<OrderedFile>> {
        let headers: Vec<(PathBuf, Result<SpatialInfo>)> = paths
            .par_iter()
            .map(|path| {
                let path = path.as_ref().to_path_buf();
                let spatial = Self::read_spatial(&path);
                (path, spatial)
            })
            .collect();

        let mut placed = Vec::with_capacity(headers.len());
        for (path, spatial) in headers {
            match spatial {
                Ok(spatial) => placed.push((path, spatial)),
                Err(err) => diagnostics.record(TraceEvent::SliceSkipped {
                    series: label.to_string(),
                    source: path.display().to_string(),
                    reason: err.to_string(),
                }),
            }
        }

        let normal = placed
            .first()
            .ok_or_else(|| FusionError::NoValidSlices(label.to_string()))?
            .1
            .normal()?;

        let mut keyed: Vec<(f64, PathBuf)> = placed
            .into_iter()
            .map(|(path, spatial)| (spatial.depth(&normal), path))
            .collect();
        Self::sort_by_depth(&mut keyed);

        Ok(keyed
            .into_iter()
            .map(|(depth, path)| OrderedFile { path, depth })
            .collect())
    }

    fn read_spatial(path: &Path) -> Result<SpatialInfo> {
        let object = OpenFileOptions::new()
            .read_until(tags::PIXEL_DATA)
            .open_file(path)?;
        SpatialInfo::read(&*object, &path.display().to_string())
    }

    fn sort_by_depth<T>(keyed: &mut [(f64, T)]) {
        // Vec::sort_by_key is stable, so equal keys keep input order.
        keyed.sort_by_key(|(depth, _)| (depth / DEPTH_TOLERANCE).round() as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slice::SampleBuffer;
    use approx::assert_relative_eq;
    use nalgebra::Vector2;
    use ndarray::Array2;

    fn slice_at(source: &str, position: Vector3<f64>) -> Slice {
        let spatial = SpatialInfo {
            position,
            row_dir: Vector3::x(),
            col_dir: Vector3::y(),
            spacing: Vector2::new(1.0, 1.0),
        };
        Slice::new(source, spatial, SampleBuffer::F32(Array2::zeros((2, 2))))
    }

    fn sources(series: &OrderedSeries) -> Vec<&str> {
        series.slices.iter().map(|s| s.source.as_str()).collect()
    }

    #[test]
    fn two_slices_order_by_depth_regardless_of_input_order() {
        let mut diagnostics = Diagnostics::new();
        let forward = vec![
            slice_at("a", Vector3::new(0.0, 0.0, 0.0)),
            slice_at("b", Vector3::new(0.0, 0.0, 5.0)),
        ];
        let backward: Vec<_> = forward.iter().rev().cloned().collect();

        for input in [forward, backward] {
            let ordered = SliceOrderResolver::order("primary", input, &mut diagnostics).unwrap();
            assert_eq!(ordered.depths, vec![0.0, 5.0]);
            assert_eq!(sources(&ordered), vec!["a", "b"]);
            assert_eq!(ordered.slices[1].instance_index, 1);
        }
    }

    #[test]
    fn depths_are_non_decreasing_and_order_independent() {
        let mut diagnostics = Diagnostics::new();
        let positions = [7.5, -2.0, 3.25, 10.0, 0.0, -8.0];
        let slices: Vec<_> = positions
            .iter()
            .enumerate()
            .map(|(i, z)| slice_at(&format!("s{i}"), Vector3::new(1.0, 2.0, *z)))
            .collect();
        let reversed: Vec<_> = slices.iter().rev().cloned().collect();

        let a = SliceOrderResolver::order("s", slices, &mut diagnostics).unwrap();
        let b = SliceOrderResolver::order("s", reversed, &mut diagnostics).unwrap();

        assert!(a.depths.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(sources(&a), sources(&b));
    }

    #[test]
    fn oblique_normal_projects_positions() {
        let mut diagnostics = Diagnostics::new();
        let c = std::f64::consts::FRAC_1_SQRT_2;
        let mut slices = vec![
            slice_at("far", Vector3::new(0.0, 10.0, 10.0)),
            slice_at("near", Vector3::new(0.0, 0.0, 0.0)),
        ];
        for slice in &mut slices {
            slice.spatial.col_dir = Vector3::new(0.0, c, -c);
        }
        let ordered = SliceOrderResolver::order("s", slices, &mut diagnostics).unwrap();
        // normal = x × (0, c, -c) = (0, c, c)
        assert_relative_eq!(ordered.normal, Vector3::new(0.0, c, c), epsilon = 1e-12);
        assert_eq!(sources(&ordered), vec!["near", "far"]);
        assert_relative_eq!(ordered.depths[1], 20.0 * c, epsilon = 1e-9);
    }

    #[test]
    fn duplicate_depths_keep_input_order() {
        let mut diagnostics = Diagnostics::new();
        let slices = vec![
            slice_at("x", Vector3::new(0.0, 0.0, 1.0)),
            slice_at("y", Vector3::new(5.0, 0.0, 1.0 + 1e-8)),
            slice_at("z", Vector3::new(0.0, 0.0, 0.0)),
        ];
        let ordered = SliceOrderResolver::order("s", slices, &mut diagnostics).unwrap();
        assert_eq!(sources(&ordered), vec!["z", "x", "y"]);
    }

    #[test]
    fn single_slice_is_returned_unchanged() {
        let mut diagnostics = Diagnostics::new();
        let ordered = SliceOrderResolver::order(
            "s",
            vec![slice_at("only", Vector3::new(3.0, 4.0, 5.0))],
            &mut diagnostics,
        )
        .unwrap();
        assert_eq!(sources(&ordered), vec!["only"]);
        assert_eq!(ordered.depths, vec![5.0]);
    }

    #[test]
    fn empty_series_is_an_error() {
        let mut diagnostics = Diagnostics::new();
        let err = SliceOrderResolver::order("secondary", Vec::new(), &mut diagnostics).unwrap_err();
        assert!(matches!(err, FusionError::NoValidSlices(label) if label == "secondary"));
    }

    #[test]
    fn skewed_orientation_is_recorded_not_fatal() {
        let mut diagnostics = Diagnostics::new();
        let mut slice = slice_at("skew", Vector3::zeros());
        slice.spatial.col_dir = Vector3::new(0.2, 1.0, 0.0);
        SliceOrderResolver::order("s", vec![slice], &mut diagnostics).unwrap();
        assert!(matches!(
            diagnostics.events.as_slice(),
            [TraceEvent::NonOrthonormalOrientation { source }] if source == "skew"
        ));
    }
}
