//! Single-plane extraction and the compact preview payload.

use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use image::{ImageBuffer, Luma};
use ndarray::{Array2, ArrayView2, Zip};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{FusionError, Result};
use crate::volume::Volume;

/// One encoded plane: float32 samples, row-major, base64.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreviewPlane {
    pub width: usize,
    pub height: usize,
    pub min: f64,
    pub max: f64,
    pub data: String,
}

/// Primary plane, resampled secondary plane and their even blend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlendedPreview {
    pub slice_index: i64,
    pub primary: PreviewPlane,
    pub secondary: PreviewPlane,
    pub blend: PreviewPlane,
}

pub struct SliceExtractor;

impl SliceExtractor {
    pub fn extract_plane(volume: &Volume, index: i64) -> Result<ArrayView2<'_, f32>> {
        let (depth, _, _) = volume.dim();
        usize::try_from(index)
            .ok()
            .and_then(|plane| volume.plane(plane))
            .ok_or(FusionError::IndexOutOfRange { index, depth })
    }

    /// Replace non-finite samples with the finite minimum and encode.
    /// A constant plane reports `max = min + 1`; a plane with no finite
    /// samples encodes as zeros over `[0, 1]`.
    pub fn encode(plane: &ArrayView2<'_, f32>) -> PreviewPlane {
        let (height, width) = plane.dim();
        let range = plane
            .iter()
            .filter(|v| v.is_finite())
            .fold(None, |acc: Option<(f32, f32)>, &v| match acc {
                Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
                None => Some((v, v)),
            });

        let (clean, min, max) = match range {
            Some((lo, hi)) => {
                let clean: Vec<f32> = plane
                    .iter()
                    .map(|&v| if v.is_finite() { v } else { lo })
                    .collect();
                let (min, mut max) = (f64::from(lo), f64::from(hi));
                if is_close(min, max) {
                    max = min + 1.0;
                }
                (clean, min, max)
            }
            None => (vec![0.0; width * height], 0.0, 1.0),
        };

        debug!(width, height, min, max, "encoded preview plane");
        PreviewPlane {
            width,
            height,
            min,
            max,
            data: STANDARD.encode(bytemuck::cast_slice::<f32, u8>(&clean)),
        }
    }

    /// Even blend of two planes of the same shape.
    pub fn blend(a: &ArrayView2<'_, f32>, b: &ArrayView2<'_, f32>) -> Result<Array2<f32>> {
        if a.dim() != b.dim() {
            return Err(FusionError::InconsistentGeometry(format!(
                "cannot blend planes of shape {:?} and {:?}",
                a.dim(),
                b.dim()
            )));
        }
        Ok(Zip::from(a).and(b).map_collect(|&x, &y| x * 0.5 + y * 0.5))
    }

    /// Primary, secondary and blended payloads for one plane index of two
    /// volumes sharing a grid.
    pub fn blended_preview(
        primary: &Volume,
        resampled: &Volume,
        index: i64,
    ) -> Result<BlendedPreview> {
        let secondary = Self::extract_plane(resampled, index)?;
        let primary_plane = Self::extract_plane(primary, index)?;
        let blend = Self::blend(&primary_plane, &secondary)?;
        Ok(BlendedPreview {
            slice_index: index,
            primary: Self::encode(&primary_plane),
            secondary: Self::encode(&secondary),
            blend: Self::encode(&blend.view()),
        })
    }
}

// Relative closeness at 1e-9.
fn is_close(a: f64, b: f64) -> bool {
    (a - b).abs() <= 1e-9 * a.abs().max(b.abs())
}

impl PreviewPlane {
    pub fn decode(&self) -> Result<Array2<f32>> {
        let bytes = STANDARD
            .decode(&self.data)
            .map_err(|err| FusionError::PixelData(format!("invalid preview payload: {err}")))?;
        if bytes.len() != self.width * self.height * size_of::<f32>() {
            return Err(FusionError::PixelData(format!(
                "preview payload holds {} bytes, expected {}x{} float32 samples",
                bytes.len(),
                self.width,
                self.height
            )));
        }
        let samples: Vec<f32> = bytemuck::pod_collect_to_vec(&bytes);
        Array2::from_shape_vec((self.height, self.width), samples)
            .map_err(|err| FusionError::PixelData(err.to_string()))
    }

    #[inline]
    fn normalize_to_u8(value: f32, min: f64, max: f64) -> u8 {
        (((f64::from(value) - min) / (max - min)) * 255.0).clamp(0.0, 255.0) as u8
    }

    /// 8-bit greyscale rendering over the payload's `min..max`.
    pub fn to_image(&self) -> Result<ImageBuffer<Luma<u8>, Vec<u8>>> {
        let samples = self.decode()?;
        let (min, max) = (self.min, self.max);
        let pixel_data: Vec<u8> = samples
            .par_iter()
            .map(|&v| Self::normalize_to_u8(v, min, max))
            .collect();
        ImageBuffer::from_raw(self.width as u32, self.height as u32, pixel_data)
            .ok_or_else(|| FusionError::PixelData("preview image buffer size mismatch".into()))
    }

    pub fn save_png(&self, path: &Path) -> Result<()> {
        self.to_image()?
            .save_with_format(path, image::ImageFormat::Png)
            .map_err(|err| FusionError::Io(std::io::Error::other(err)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::VolumeGeometry;
    use crate::volume::tests::cube;
    use approx::assert_relative_eq;
    use nalgebra::Vector3;
    use ndarray::{Array3, array};

    #[test]
    fn decoding_reproduces_finite_samples() {
        let plane = array![[1.5f32, -2.25, 3.0], [4.0, 1e-7, -1000.0]];
        let encoded = SliceExtractor::encode(&plane.view());
        assert_eq!((encoded.width, encoded.height), (3, 2));
        assert_eq!((encoded.min, encoded.max), (-1000.0, 4.0));
        assert_eq!(encoded.decode().unwrap(), plane);
    }

    #[test]
    fn non_finite_samples_become_the_finite_minimum() {
        let plane = array![[f32::NAN, 5.0], [f32::INFINITY, -3.0], [f32::NEG_INFINITY, 2.0]];
        let decoded = SliceExtractor::encode(&plane.view()).decode().unwrap();
        assert_eq!(decoded, array![[-3.0, 5.0], [-3.0, -3.0], [-3.0, 2.0]]);
        assert!(decoded.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn constant_and_empty_planes_get_a_unit_range() {
        let constant = SliceExtractor::encode(&Array2::from_elem((2, 2), 7.0f32).view());
        assert_eq!((constant.min, constant.max), (7.0, 8.0));

        let empty = SliceExtractor::encode(&Array2::from_elem((2, 3), f32::NAN).view());
        assert_eq!((empty.min, empty.max), (0.0, 1.0));
        assert!(empty.decode().unwrap().iter().all(|v| *v == 0.0));
    }

    #[test]
    fn plane_index_outside_depth_is_rejected() {
        let volume = cube(4, 0.0, Vector3::zeros());
        let err = SliceExtractor::extract_plane(&volume, 4).unwrap_err();
        assert_eq!(err.to_string(), "sliceIndex 4 not in [0,3]");
        assert!(SliceExtractor::extract_plane(&volume, 3).is_ok());
        assert!(matches!(
            SliceExtractor::extract_plane(&volume, -1),
            Err(FusionError::IndexOutOfRange { index: -1, depth: 4 })
        ));
    }

    #[test]
    fn blended_preview_averages_planes() {
        let primary = cube(3, 100.0, Vector3::zeros());
        let secondary = cube(3, 300.0, Vector3::zeros());
        let preview = SliceExtractor::blended_preview(&primary, &secondary, 1).unwrap();
        assert_eq!(preview.slice_index, 1);
        assert!(preview.blend.decode().unwrap().iter().all(|v| *v == 200.0));

        let json = serde_json::to_value(&preview).unwrap();
        assert_eq!(json["sliceIndex"], 1);
        assert_eq!(json["primary"]["width"], 3);
    }

    #[test]
    fn blending_mismatched_planes_fails() {
        let a = Array2::<f32>::zeros((2, 2));
        let b = Array2::<f32>::zeros((2, 3));
        assert!(SliceExtractor::blend(&a.view(), &b.view()).is_err());
    }

    #[test]
    fn renders_greyscale_png() {
        let volume = Volume::new(
            Array3::from_shape_fn((1, 2, 2), |(_, j, i)| (i + 2 * j) as f32),
            VolumeGeometry::axis_aligned(Vector3::zeros(), Vector3::new(1.0, 1.0, 1.0)),
        )
        .unwrap();
        let plane = SliceExtractor::encode(&SliceExtractor::extract_plane(&volume, 0).unwrap());
        let image = plane.to_image().unwrap();
        assert_eq!(image.dimensions(), (2, 2));
        assert_eq!(image.get_pixel(0, 0).0, [0]);
        assert_eq!(image.get_pixel(1, 1).0, [255]);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("preview.png");
        plane.save_png(&path).unwrap();
        let reloaded = image::open(&path).unwrap().to_luma8();
        assert_relative_eq!(reloaded.get_pixel(0, 1).0[0] as f32, 170.0, epsilon = 1.0);
    }
}
