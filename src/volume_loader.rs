use crate::diagnostics::{Diagnostics, TraceEvent};
use crate::enums::Modality;
use crate::error::{FusionError, Result};
use crate::header::{SeriesFields, SpatialInfo};
use crate::slice::{SampleBuffer, Slice};
use crate::slice_order::{OrderedSeries, SliceOrderResolver};
use crate::volume::{Volume, VolumeGeometry};

use dicom::{
    object::{FileDicomObject, InMemDicomObject, open_file},
    pixeldata::{ConvertOptions, PixelDecoder, VoiLutOption},
};
use nalgebra::{Matrix3, Vector3};
use ndarray::{Array3, s};
use rayon::prelude::*;
use std::{fs, path::Path};
use tracing::info;

fn pixel_error(err: impl std::fmt::Display) -> FusionError {
    FusionError::PixelData(err.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StoredKind {
    I16,
    I32,
    F32,
}

/// Relative tolerance when deciding whether slice gaps are uniform.
const GAP_TOLERANCE: f64 = 1e-3;

pub struct VolumeLoader;

impl VolumeLoader {
    /// Load a volume from file paths. Files are decoded in parallel; files
    /// that cannot be read or placed are skipped and recorded.
    pub fn load_from_file_paths(
        label: &str,
        paths: &[impl AsRef<Path> + Sync],
        diagnostics: &mut Diagnostics,
    ) -> Result<Volume> {
        let decoded: Vec<_> = paths
            .par_iter()
            .map(|path| {
                let path = path.as_ref();
                let source = path.display().to_string();
                let slice = open_file(path)
                    .map_err(FusionError::from)
                    .and_then(|object| Self::slice_from_dicom_object(&object, &source));
                (source, slice)
            })
            .collect();

        let slices = Self::keep_valid(label, decoded, diagnostics);
        Self::load_from_slices(label, slices, diagnostics)
    }

    /// Load a volume from DICOM objects already in memory.
    pub fn load_from_dicom_objects(
        label: &str,
        dicom_objects: &[FileDicomObject<InMemDicomObject>],
        diagnostics: &mut Diagnostics,
    ) -> Result<Volume> {
        let decoded: Vec<_> = dicom_objects
            .par_iter()
            .enumerate()
            .map(|(index, object)| {
                let source = format!("{label}[{index}]");
                let slice = Self::slice_from_dicom_object(object, &source);
                (source, slice)
            })
            .collect();

        let slices = Self::keep_valid(label, decoded, diagnostics);
        Self::load_from_slices(label, slices, diagnostics)
    }

    /// Load a volume from a directory containing .dcm files
    pub fn load_from_directory(
        label: &str,
        path: impl AsRef<Path>,
        diagnostics: &mut Diagnostics,
    ) -> Result<Volume> {
        let paths: Vec<_> = fs::read_dir(path.as_ref())?
            .filter_map(std::result::Result::ok)
            .map(|entry| entry.path())
            .filter(|path| {
                path.extension()
                    .and_then(|s| s.to_str())
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("dcm"))
            })
            .collect();

        if paths.is_empty() {
            return Err(FusionError::NoValidSlices(label.to_string()));
        }

        Self::load_from_file_paths(label, &paths, diagnostics)
    }

    /// Order `slices` along their normal and stack them depth-major.
    pub fn load_from_slices(
        label: &str,
        slices: Vec<Slice>,
        diagnostics: &mut Diagnostics,
    ) -> Result<Volume> {
        let series = SliceOrderResolver::order(label, slices, diagnostics)?;
        Self::load_from_ordered(series, diagnostics)
    }

    /// Build a volume from an already ordered series.
    pub fn load_from_ordered(series: OrderedSeries, diagnostics: &mut Diagnostics) -> Result<Volume> {
        Self::validate_dimensions(&series)?;

        let first = &series.slices[0];
        let (spacing_z, uniform) = Self::infer_slice_spacing(&series, diagnostics);
        let geometry = VolumeGeometry {
            origin: first.spatial.position,
            spacing: Vector3::new(first.spatial.spacing.x, first.spatial.spacing.y, spacing_z),
            direction: Matrix3::from_columns(&[
                first.spatial.row_dir,
                first.spatial.col_dir,
                series.normal,
            ]),
        };
        let fields = first.fields.clone();
        let modality = fields
            .modality
            .as_deref()
            .map(Modality::parse)
            .unwrap_or_default();

        info!(
            series = %series.label,
            modality = fields.modality.as_deref().unwrap_or("unknown"),
            description = fields.series_description.as_deref().unwrap_or("(no description)"),
            series_uid = fields.series_instance_uid.as_deref().unwrap_or("unknown"),
            frame_of_reference = fields.frame_of_reference_uid.as_deref().unwrap_or("unknown"),
            normal = ?series.normal.as_slice(),
            first_depth = series.depths.first().copied(),
            last_depth = series.depths.last().copied(),
            slices = series.len(),
            "loaded series"
        );

        let volume_array = Self::build_volume_array(&series.slices);
        Ok(Volume::new(volume_array, geometry)?
            .with_modality(modality)
            .with_fields(fields)
            .with_spacing_uniform(uniform))
    }

    fn keep_valid(
        label: &str,
        decoded: Vec<(String, Result<Slice>)>,
        diagnostics: &mut Diagnostics,
    ) -> Vec<Slice> {
        decoded
            .into_iter()
            .filter_map(|(source, slice)| match slice {
                Ok(slice) => Some(slice),
                Err(err) => {
                    diagnostics.record(TraceEvent::SliceSkipped {
                        series: label.to_string(),
                        source,
                        reason: err.to_string(),
                    });
                    None
                }
            })
            .collect()
    }

    fn slice_from_dicom_object(
        dicom_object: &FileDicomObject<InMemDicomObject>,
        source: &str,
    ) -> Result<Slice> {
        let spatial = SpatialInfo::read(&**dicom_object, source)?;
        let fields = SeriesFields::read(&**dicom_object);
        let samples = Self::decode_image(dicom_object, &fields)?;
        Ok(Slice::new(source, spatial, samples).with_fields(fields))
    }

    // Modality LUT (rescale slope/intercept) is applied, VOI windowing is not.
    fn decode_image(
        dicom_object: &FileDicomObject<InMemDicomObject>,
        fields: &SeriesFields,
    ) -> Result<SampleBuffer> {
        let pixel_data = dicom_object.decode_pixel_data().map_err(pixel_error)?;
        let options = ConvertOptions::new().with_voi_lut(VoiLutOption::Identity);

        let samples = match Self::stored_kind(fields) {
            StoredKind::I16 => SampleBuffer::I16(
                pixel_data
                    .to_ndarray_with_options::<i16>(&options)
                    .map_err(pixel_error)?
                    .slice_move(s![0, .., .., 0]),
            ),
            StoredKind::I32 => SampleBuffer::I32(
                pixel_data
                    .to_ndarray_with_options::<i32>(&options)
                    .map_err(pixel_error)?
                    .slice_move(s![0, .., .., 0]),
            ),
            StoredKind::F32 => SampleBuffer::F32(
                pixel_data
                    .to_ndarray_with_options::<f32>(&options)
                    .map_err(pixel_error)?
                    .slice_move(s![0, .., .., 0]),
            ),
        };
        Ok(samples)
    }

    /// Signed single-channel samples with an identity rescale keep their
    /// integer type; everything else is decoded to float.
    fn stored_kind(fields: &SeriesFields) -> StoredKind {
        let identity_rescale = fields.rescale_slope.is_none_or(|slope| slope == 1.0)
            && fields.rescale_intercept.is_none_or(|intercept| intercept == 0.0);
        let single_channel = fields.samples_per_pixel.is_none_or(|n| n == 1);
        if !identity_rescale || !single_channel || fields.pixel_representation != Some(1) {
            return StoredKind::F32;
        }
        match fields.bits_allocated {
            Some(16) => StoredKind::I16,
            Some(32) => StoredKind::I32,
            _ => StoredKind::F32,
        }
    }

    fn validate_dimensions(series: &OrderedSeries) -> Result<()> {
        let first = series
            .slices
            .first()
            .ok_or_else(|| FusionError::NoValidSlices(series.label.clone()))?;
        let first_dim = (first.rows, first.columns);
        if let Some(odd) = series
            .slices
            .iter()
            .find(|slice| (slice.rows, slice.columns) != first_dim)
        {
            return Err(FusionError::InconsistentGeometry(format!(
                "{} is {}x{} but {} is {}x{}",
                odd.source, odd.rows, odd.columns, first.source, first_dim.0, first_dim.1
            )));
        }
        Ok(())
    }

    /// Median of consecutive depth differences, and whether every gap agrees
    /// with it. Irregular gaps are not resampled.
    fn infer_slice_spacing(series: &OrderedSeries, diagnostics: &mut Diagnostics) -> (f64, bool) {
        let mut gaps: Vec<f64> = series.depths.windows(2).map(|w| w[1] - w[0]).collect();
        let fallback = series.slices[0]
            .fields
            .slice_thickness
            .filter(|t| *t > 0.0)
            .unwrap_or(1.0);
        if gaps.is_empty() {
            return (fallback, true);
        }

        gaps.sort_by(f64::total_cmp);
        let mid = gaps.len() / 2;
        let median = if gaps.len() % 2 == 0 {
            (gaps[mid - 1] + gaps[mid]) / 2.0
        } else {
            gaps[mid]
        };
        let (min_gap, max_gap) = (gaps[0], gaps[gaps.len() - 1]);
        let tolerance = GAP_TOLERANCE * median.abs().max(1.0);
        let uniform = (max_gap - median).abs() <= tolerance && (median - min_gap).abs() <= tolerance;
        if !uniform {
            diagnostics.record(TraceEvent::NonUniformSpacing {
                series: series.label.clone(),
                median,
                min_gap,
                max_gap,
            });
        }

        if median > f64::EPSILON {
            (median, uniform)
        } else {
            // Stacked duplicates; a zero gap would make the grid singular.
            (fallback, false)
        }
    }

    fn build_volume_array(slices: &[Slice]) -> Array3<f32> {
        let height = slices[0].rows;
        let width = slices[0].columns;
        let depth = slices.len();
        let mut volume = Array3::<f32>::zeros((depth, height, width));

        for (i, slice) in slices.iter().enumerate() {
            volume.slice_mut(s![i, .., ..]).assign(&slice.samples.to_f32());
        }

        volume
    }
}
