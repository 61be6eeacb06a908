//! Spatial and identifying fields of a single slice header.
//!
//! Headers are read through [`HeaderSource`] so the same parsing applies to
//! DICOM objects loaded from disk and to plain tag/value maps.

use std::collections::HashMap;

use dicom::core::Tag;
use dicom::object::InMemDicomObject;
use dicom_dictionary_std::tags;
use nalgebra::{Vector2, Vector3};

use crate::error::{FusionError, Result};

const NORMAL_EPSILON: f64 = 1e-6;
const ORTHONORMAL_TOLERANCE: f64 = 1e-3;

/// Anything that can hand out the textual value of a tag.
pub trait HeaderSource {
    fn text(&self, tag: Tag) -> Option<String>;
}

impl HeaderSource for InMemDicomObject {
    fn text(&self, tag: Tag) -> Option<String> {
        let value = self.element(tag).ok()?.to_str().ok()?;
        let value = value.trim_matches(|c: char| c == '\0' || c.is_whitespace());
        (!value.is_empty()).then(|| value.to_string())
    }
}

impl HeaderSource for HashMap<Tag, String> {
    fn text(&self, tag: Tag) -> Option<String> {
        self.get(&tag)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }
}

/// Parse a multi-valued numeric field. Both `\` and `,` are accepted as
/// delimiters; returns `None` if any component is not a number.
pub fn parse_numbers(raw: &str) -> Option<Vec<f64>> {
    raw.replace(',', "\\")
        .split('\\')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| part.parse::<f64>().ok())
        .collect()
}

fn numbers<H: HeaderSource + ?Sized>(header: &H, tag: Tag) -> Option<Vec<f64>> {
    header.text(tag).and_then(|raw| parse_numbers(&raw))
}

fn number<H: HeaderSource + ?Sized>(header: &H, tag: Tag) -> Option<f64> {
    numbers(header, tag).and_then(|values| values.first().copied())
}

/// Placement of one slice in patient space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpatialInfo {
    pub position: Vector3<f64>,
    pub row_dir: Vector3<f64>,
    pub col_dir: Vector3<f64>,
    /// Spacing along `row_dir` (between columns) then along `col_dir` (between rows).
    pub spacing: Vector2<f64>,
}

impl SpatialInfo {
    pub fn read<H: HeaderSource + ?Sized>(header: &H, source_id: &str) -> Result<Self> {
        let missing = |tag| FusionError::MissingField {
            tag,
            source_id: source_id.to_string(),
        };

        let position = numbers(header, tags::IMAGE_POSITION_PATIENT)
            .filter(|values| values.len() >= 3)
            .ok_or_else(|| missing(tags::IMAGE_POSITION_PATIENT))?;
        let orientation = numbers(header, tags::IMAGE_ORIENTATION_PATIENT)
            .filter(|values| values.len() >= 6)
            .ok_or_else(|| missing(tags::IMAGE_ORIENTATION_PATIENT))?;

        // Pixel Spacing is stored as (row spacing, column spacing).
        let spacing = numbers(header, tags::PIXEL_SPACING)
            .filter(|values| values.len() >= 2)
            .map(|values| Vector2::new(values[1], values[0]))
            .unwrap_or_else(|| Vector2::new(1.0, 1.0));

        Ok(Self {
            position: Vector3::new(position[0], position[1], position[2]),
            row_dir: Vector3::new(orientation[0], orientation[1], orientation[2]),
            col_dir: Vector3::new(orientation[3], orientation[4], orientation[5]),
            spacing,
        })
    }

    /// Unit normal of the slice plane, `normalize(row × col)`.
    pub fn normal(&self) -> Result<Vector3<f64>> {
        let normal = self.row_dir.cross(&self.col_dir);
        let norm = normal.norm();
        if norm < NORMAL_EPSILON {
            return Err(FusionError::DegenerateOrientation(format!(
                "row {:?} and column {:?} are parallel",
                self.row_dir.as_slice(),
                self.col_dir.as_slice()
            )));
        }
        Ok(normal / norm)
    }

    pub fn is_orthonormal(&self) -> bool {
        (self.row_dir.norm() - 1.0).abs() <= ORTHONORMAL_TOLERANCE
            && (self.col_dir.norm() - 1.0).abs() <= ORTHONORMAL_TOLERANCE
            && self.row_dir.dot(&self.col_dir).abs() <= ORTHONORMAL_TOLERANCE
    }

    /// Signed distance of the slice along `normal`.
    pub fn depth(&self, normal: &Vector3<f64>) -> f64 {
        self.position.dot(normal)
    }
}

/// Identifying and display fields shared by a series, taken from one header.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SeriesFields {
    pub modality: Option<String>,
    pub series_instance_uid: Option<String>,
    pub study_instance_uid: Option<String>,
    pub frame_of_reference_uid: Option<String>,
    pub patient_id: Option<String>,
    pub series_description: Option<String>,
    pub window_center: Vec<f64>,
    pub window_width: Vec<f64>,
    pub rescale_slope: Option<f64>,
    pub rescale_intercept: Option<f64>,
    pub photometric_interpretation: Option<String>,
    pub samples_per_pixel: Option<u16>,
    pub bits_allocated: Option<u16>,
    pub bits_stored: Option<u16>,
    pub high_bit: Option<u16>,
    pub pixel_representation: Option<u16>,
    pub slice_thickness: Option<f64>,
}

impl SeriesFields {
    pub fn read<H: HeaderSource + ?Sized>(header: &H) -> Self {
        let small = |tag| {
            number(header, tag)
                .filter(|v| v.fract() == 0.0)
                .and_then(|v| u16::try_from(v as i64).ok())
        };
        Self {
            modality: header.text(tags::MODALITY),
            series_instance_uid: header.text(tags::SERIES_INSTANCE_UID),
            study_instance_uid: header.text(tags::STUDY_INSTANCE_UID),
            frame_of_reference_uid: header.text(tags::FRAME_OF_REFERENCE_UID),
            patient_id: header.text(tags::PATIENT_ID),
            series_description: header.text(tags::SERIES_DESCRIPTION),
            window_center: numbers(header, tags::WINDOW_CENTER).unwrap_or_default(),
            window_width: numbers(header, tags::WINDOW_WIDTH).unwrap_or_default(),
            rescale_slope: number(header, tags::RESCALE_SLOPE),
            rescale_intercept: number(header, tags::RESCALE_INTERCEPT),
            photometric_interpretation: header.text(tags::PHOTOMETRIC_INTERPRETATION),
            samples_per_pixel: small(tags::SAMPLES_PER_PIXEL),
            bits_allocated: small(tags::BITS_ALLOCATED),
            bits_stored: small(tags::BITS_STORED),
            high_bit: small(tags::HIGH_BIT),
            pixel_representation: small(tags::PIXEL_REPRESENTATION),
            slice_thickness: number(header, tags::SLICE_THICKNESS),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use approx::assert_relative_eq;

    pub(crate) fn axial_header(z: f64) -> HashMap<Tag, String> {
        HashMap::from([
            (tags::IMAGE_POSITION_PATIENT, format!("0\\0\\{z}")),
            (tags::IMAGE_ORIENTATION_PATIENT, "1\\0\\0\\0\\1\\0".to_string()),
            (tags::PIXEL_SPACING, "0.5\\0.75".to_string()),
            (tags::MODALITY, "CT".to_string()),
        ])
    }

    #[test]
    fn reads_position_orientation_and_spacing() {
        let info = SpatialInfo::read(&axial_header(12.5), "slice").unwrap();
        assert_relative_eq!(info.position.z, 12.5);
        assert_relative_eq!(info.row_dir, Vector3::x());
        assert_relative_eq!(info.col_dir, Vector3::y());
        // column spacing first
        assert_relative_eq!(info.spacing, Vector2::new(0.75, 0.5));
        assert_relative_eq!(info.normal().unwrap(), Vector3::z());
        assert!(info.is_orthonormal());
    }

    #[test]
    fn accepts_comma_delimited_values() {
        assert_eq!(
            parse_numbers(" 1.0, -2\\3 "),
            Some(vec![1.0, -2.0, 3.0])
        );
        assert_eq!(parse_numbers("1\\abc"), None);
    }

    #[test]
    fn missing_position_is_reported() {
        let mut header = axial_header(0.0);
        header.remove(&tags::IMAGE_POSITION_PATIENT);
        let err = SpatialInfo::read(&header, "a.dcm").unwrap_err();
        assert!(matches!(
            err,
            FusionError::MissingField { tag, .. } if tag == tags::IMAGE_POSITION_PATIENT
        ));
    }

    #[test]
    fn parallel_direction_cosines_are_degenerate() {
        let mut header = axial_header(0.0);
        header.insert(tags::IMAGE_ORIENTATION_PATIENT, "1\\0\\0\\1\\0\\0".into());
        let info = SpatialInfo::read(&header, "a.dcm").unwrap();
        assert!(matches!(
            info.normal(),
            Err(FusionError::DegenerateOrientation(_))
        ));
    }

    #[test]
    fn skewed_cosines_are_not_orthonormal() {
        let mut header = axial_header(0.0);
        header.insert(tags::IMAGE_ORIENTATION_PATIENT, "1\\0\\0\\0.1\\1\\0".into());
        let info = SpatialInfo::read(&header, "a.dcm").unwrap();
        assert!(!info.is_orthonormal());
        assert!(info.normal().is_ok());
    }

    #[test]
    fn out_of_range_small_integers_are_dropped() {
        let mut header = axial_header(0.0);
        header.insert(tags::BITS_ALLOCATED, "16".into());
        header.insert(tags::BITS_STORED, "70000".into());
        header.insert(tags::HIGH_BIT, "-1".into());
        header.insert(tags::SAMPLES_PER_PIXEL, "1.5".into());
        let fields = SeriesFields::read(&header);
        assert_eq!(fields.bits_allocated, Some(16));
        assert_eq!(fields.bits_stored, None);
        assert_eq!(fields.high_bit, None);
        assert_eq!(fields.samples_per_pixel, None);
    }

    #[test]
    fn series_fields_parse_multi_valued_window() {
        let mut header = axial_header(0.0);
        header.insert(tags::WINDOW_CENTER, "40\\400".into());
        header.insert(tags::WINDOW_WIDTH, "350\\1500".into());
        header.insert(tags::RESCALE_SLOPE, "1".into());
        header.insert(tags::BITS_ALLOCATED, "16".into());
        let fields = SeriesFields::read(&header);
        assert_eq!(fields.modality.as_deref(), Some("CT"));
        assert_eq!(fields.window_center, vec![40.0, 400.0]);
        assert_eq!(fields.window_width, vec![350.0, 1500.0]);
        assert_eq!(fields.rescale_slope, Some(1.0));
        assert_eq!(fields.bits_allocated, Some(16));
        assert_eq!(fields.rescale_intercept, None);
    }
}
