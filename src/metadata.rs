//! Series-level metadata for a derived (fused) series.
//!
//! Requests carry a `metadata` block with patient, study, primary-series,
//! secondary-series and derived-series sections using DICOM keyword names.
//! Missing fields are inherited from the loaded headers, and what is still
//! missing is generated or defaulted. The result is one immutable
//! [`DerivedSeriesMetadata`] shared by every written plane.

use std::collections::BTreeMap;

use dicom::core::Tag;
use dicom::core::dictionary::DataDictionary;
use dicom_dictionary_std::StandardDataDictionary;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::Settings;
use crate::enums::Modality;
use crate::header::{SeriesFields, parse_numbers};
use crate::quantize::{Quantized, WindowLevel};
use crate::volume::Volume;

const DEFAULT_IMAGE_TYPE: [&str; 3] = ["DERIVED", "SECONDARY", "FUSED"];
const DEFAULT_SERIES_DESCRIPTION: &str = "Fusion Secondary";
const DEFAULT_PHOTOMETRIC: &str = "MONOCHROME2";

/// Longest Decimal String value.
const DS_MAX_LEN: usize = 16;

/// `<root>.<random 128-bit decimal>`.
pub fn generate_uid(root: &str) -> String {
    format!("{root}.{}", Uuid::new_v4().as_u128())
}

/// Decimal String rendering of `value`, at most 16 characters.
/// Non-finite values have no rendering.
pub fn format_ds(value: f64) -> Option<String> {
    if !value.is_finite() {
        return None;
    }
    let plain = value.to_string();
    if plain.len() <= DS_MAX_LEN {
        return Some(plain);
    }
    let fixed = (0..=15).rev().map(|precision| {
        let text = format!("{value:.precision$}");
        if text.contains('.') {
            text.trim_end_matches('0').trim_end_matches('.').to_string()
        } else {
            text
        }
    });
    fixed
        .filter(|text| text.len() <= DS_MAX_LEN)
        .find(|text| text.parse::<f64>().is_ok_and(|parsed| parsed != 0.0))
        .or_else(|| {
            (0..=10)
                .rev()
                .map(|precision| format!("{value:.precision$e}"))
                .find(|text| text.len() <= DS_MAX_LEN)
        })
}

/// Backslash-joined Decimal Strings, skipping non-finite values.
pub fn format_ds_multi(values: &[f64]) -> Option<String> {
    let parts: Vec<String> = values.iter().filter_map(|v| format_ds(*v)).collect();
    (!parts.is_empty()).then(|| parts.join("\\"))
}

/// Text form of a loosely typed JSON metadata value. Nulls and non-finite
/// numbers have none; lists are backslash-joined.
pub fn loose_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        Value::Bool(flag) => Some(flag.to_string()),
        Value::Number(number) => match number.as_i64() {
            Some(integer) => Some(integer.to_string()),
            None => number.as_f64().and_then(format_ds),
        },
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().filter_map(loose_text).collect();
            (!parts.is_empty()).then(|| parts.join("\\"))
        }
        Value::Object(_) => Some(value.to_string()),
    }
}

fn loose_numbers<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<f64>, D::Error> {
    fn collect(value: &Value, out: &mut Vec<f64>) {
        match value {
            Value::Number(number) => out.extend(number.as_f64()),
            Value::String(text) => out.extend(parse_numbers(text).unwrap_or_default()),
            Value::Array(items) => items.iter().for_each(|item| collect(item, out)),
            _ => {}
        }
    }
    let mut out = Vec::new();
    collect(&Value::deserialize(deserializer)?, &mut out);
    Ok(out.into_iter().filter(|v| v.is_finite()).collect())
}

fn loose_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
    Ok(loose_numbers(deserializer)?.first().copied())
}

fn loose_integer<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u16>, D::Error> {
    Ok(loose_number(deserializer)?
        .filter(|v| v.fract() == 0.0 && (0.0..=f64::from(u16::MAX)).contains(v))
        .map(|v| v as u16))
}

fn loose_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(loose_text(&Value::deserialize(deserializer)?).filter(|text| !text.is_empty()))
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct PatientInfo {
    #[serde(deserialize_with = "loose_string")]
    pub patient_name: Option<String>,
    #[serde(rename = "PatientID", deserialize_with = "loose_string")]
    pub patient_id: Option<String>,
    #[serde(deserialize_with = "loose_string")]
    pub patient_birth_date: Option<String>,
    #[serde(deserialize_with = "loose_string")]
    pub patient_sex: Option<String>,
    #[serde(deserialize_with = "loose_string")]
    pub patient_age: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct StudyInfo {
    #[serde(rename = "StudyInstanceUID", deserialize_with = "loose_string")]
    pub study_instance_uid: Option<String>,
    #[serde(deserialize_with = "loose_string")]
    pub study_date: Option<String>,
    #[serde(deserialize_with = "loose_string")]
    pub study_time: Option<String>,
    #[serde(deserialize_with = "loose_string")]
    pub accession_number: Option<String>,
    #[serde(deserialize_with = "loose_string")]
    pub referring_physician_name: Option<String>,
}

/// Description of a source (primary or secondary) series.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SeriesInfo {
    #[serde(deserialize_with = "loose_string")]
    pub modality: Option<String>,
    #[serde(rename = "SeriesInstanceUID", deserialize_with = "loose_string")]
    pub series_instance_uid: Option<String>,
    #[serde(rename = "FrameOfReferenceUID", deserialize_with = "loose_string")]
    pub frame_of_reference_uid: Option<String>,
    #[serde(deserialize_with = "loose_string")]
    pub series_description: Option<String>,
    #[serde(deserialize_with = "loose_numbers")]
    pub window_center: Vec<f64>,
    #[serde(deserialize_with = "loose_numbers")]
    pub window_width: Vec<f64>,
    #[serde(deserialize_with = "loose_number")]
    pub rescale_slope: Option<f64>,
    #[serde(deserialize_with = "loose_number")]
    pub rescale_intercept: Option<f64>,
    #[serde(deserialize_with = "loose_string")]
    pub photometric_interpretation: Option<String>,
    #[serde(deserialize_with = "loose_integer")]
    pub samples_per_pixel: Option<u16>,
}

impl SeriesInfo {
    /// Fill absent identifying and display fields from a loaded header.
    /// Rescale values are not taken from headers: loaded samples already
    /// have them applied.
    pub fn inherit(&mut self, fields: &SeriesFields) {
        fill(&mut self.modality, &fields.modality);
        fill(&mut self.series_instance_uid, &fields.series_instance_uid);
        fill(&mut self.frame_of_reference_uid, &fields.frame_of_reference_uid);
        fill(&mut self.series_description, &fields.series_description);
        fill(&mut self.photometric_interpretation, &fields.photometric_interpretation);
        if self.samples_per_pixel.is_none() {
            self.samples_per_pixel = fields.samples_per_pixel;
        }
        if self.window_center.is_empty() && self.window_width.is_empty() {
            self.window_center = fields.window_center.clone();
            self.window_width = fields.window_width.clone();
        }
    }
}

fn fill(target: &mut Option<String>, source: &Option<String>) {
    if target.is_none() {
        target.clone_from(source);
    }
}

/// Overrides for the series being written.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct DerivedSeriesInfo {
    #[serde(rename = "SeriesInstanceUID", deserialize_with = "loose_string")]
    pub series_instance_uid: Option<String>,
    #[serde(deserialize_with = "loose_string")]
    pub series_description: Option<String>,
    pub series_number: Option<Value>,
    pub image_type: Option<Value>,
    #[serde(deserialize_with = "loose_numbers")]
    pub window_center: Vec<f64>,
    #[serde(deserialize_with = "loose_numbers")]
    pub window_width: Vec<f64>,
    #[serde(deserialize_with = "loose_number")]
    pub rescale_slope: Option<f64>,
    #[serde(deserialize_with = "loose_number")]
    pub rescale_intercept: Option<f64>,
    #[serde(deserialize_with = "loose_string")]
    pub derivation_description: Option<String>,
    #[serde(rename = "ReferencedSeriesInstanceUID", deserialize_with = "loose_string")]
    pub referenced_series_instance_uid: Option<String>,
    pub additional_tags: BTreeMap<String, Value>,
}

/// The `metadata` block of an export request.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MetadataInput {
    pub patient: PatientInfo,
    pub study: StudyInfo,
    pub primary_series: SeriesInfo,
    pub secondary_series: SeriesInfo,
    pub derived_series: DerivedSeriesInfo,
    #[serde(deserialize_with = "loose_number")]
    pub slice_thickness: Option<f64>,
    #[serde(deserialize_with = "loose_number")]
    pub spacing_between_slices: Option<f64>,
}

impl MetadataInput {
    /// Fill gaps from the loaded primary and secondary headers.
    pub fn inherit(&mut self, primary: &SeriesFields, secondary: &SeriesFields) {
        self.primary_series.inherit(primary);
        self.secondary_series.inherit(secondary);
        fill(&mut self.patient.patient_id, &primary.patient_id);
        fill(&mut self.study.study_instance_uid, &primary.study_instance_uid);
    }

    /// Modality of the written series: secondary, else primary, else CT.
    pub fn modality(&self) -> Modality {
        self.secondary_series
            .modality
            .as_deref()
            .or(self.primary_series.modality.as_deref())
            .map(Modality::parse)
            .unwrap_or_default()
    }
}

/// Stored sample layout of the written planes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PixelEncoding {
    pub bits_allocated: u16,
    pub bits_stored: u16,
    pub high_bit: u16,
    pub pixel_representation: u16,
}

impl PixelEncoding {
    pub const UINT16: Self = Self {
        bits_allocated: 16,
        bits_stored: 16,
        high_bit: 15,
        pixel_representation: 0,
    };

    pub const FLOAT32: Self = Self {
        bits_allocated: 32,
        bits_stored: 32,
        high_bit: 31,
        pixel_representation: 0,
    };
}

/// Everything shared by the planes of one derived series.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DerivedSeriesMetadata {
    pub modality: String,
    #[serde(rename = "sopClassUID")]
    pub sop_class_uid: String,
    pub image_type: Vec<String>,
    #[serde(rename = "studyInstanceUID")]
    pub study_instance_uid: String,
    #[serde(rename = "seriesInstanceUID")]
    pub series_instance_uid: String,
    #[serde(rename = "frameOfReferenceUID")]
    pub frame_of_reference_uid: String,
    pub series_description: String,
    pub series_number: i32,
    #[serde(skip)]
    pub patient: PatientInfo,
    #[serde(skip)]
    pub study: StudyInfo,
    pub window_center: Vec<f64>,
    pub window_width: Vec<f64>,
    pub rescale_slope: f64,
    pub rescale_intercept: f64,
    pub photometric_interpretation: String,
    pub samples_per_pixel: u16,
    pub encoding: PixelEncoding,
    /// Row spacing then column spacing.
    pub pixel_spacing: [f64; 2],
    pub slice_thickness: f64,
    pub spacing_between_slices: f64,
    pub derivation_description: Option<String>,
    #[serde(rename = "referencedSeriesInstanceUID")]
    pub referenced_series_instance_uid: Option<String>,
    #[serde(skip)]
    pub additional_tags: Vec<(Tag, String)>,
}

pub struct MetadataSynthesizer;

impl MetadataSynthesizer {
    /// Build the shared metadata for `resampled`. `input` should already have
    /// inherited header fields. When `quantized` is given its slope and
    /// intercept are always used, and its range becomes the window unless the
    /// derived block sets one.
    pub fn synthesize(
        input: &MetadataInput,
        resampled: &Volume,
        quantized: Option<&Quantized>,
        settings: &Settings,
    ) -> DerivedSeriesMetadata {
        let derived = &input.derived_series;
        let secondary = &input.secondary_series;
        let modality = input.modality();

        let (window_center, window_width) = Self::window(input, resampled, quantized);
        let (rescale_slope, rescale_intercept) = match quantized {
            Some(q) => (q.slope, q.intercept),
            None => (
                derived.rescale_slope.or(secondary.rescale_slope).unwrap_or(1.0),
                derived.rescale_intercept.or(secondary.rescale_intercept).unwrap_or(0.0),
            ),
        };

        let spacing = resampled.geometry().spacing;
        let metadata = DerivedSeriesMetadata {
            sop_class_uid: modality.sop_class_uid().to_string(),
            modality: modality.code().to_string(),
            image_type: derived
                .image_type
                .as_ref()
                .map(Self::image_type)
                .filter(|values| !values.is_empty())
                .unwrap_or_else(|| DEFAULT_IMAGE_TYPE.map(String::from).to_vec()),
            study_instance_uid: input
                .study
                .study_instance_uid
                .clone()
                .unwrap_or_else(|| settings.generate_uid()),
            series_instance_uid: derived
                .series_instance_uid
                .clone()
                .unwrap_or_else(|| settings.generate_uid()),
            frame_of_reference_uid: input
                .primary_series
                .frame_of_reference_uid
                .clone()
                .unwrap_or_else(|| settings.generate_uid()),
            series_description: derived
                .series_description
                .clone()
                .unwrap_or_else(|| DEFAULT_SERIES_DESCRIPTION.to_string()),
            series_number: Self::series_number(derived.series_number.as_ref(), settings),
            patient: input.patient.clone(),
            study: input.study.clone(),
            window_center,
            window_width,
            rescale_slope,
            rescale_intercept,
            photometric_interpretation: secondary
                .photometric_interpretation
                .clone()
                .unwrap_or_else(|| DEFAULT_PHOTOMETRIC.to_string()),
            samples_per_pixel: secondary.samples_per_pixel.unwrap_or(1),
            encoding: if quantized.is_some() {
                PixelEncoding::UINT16
            } else {
                PixelEncoding::FLOAT32
            },
            pixel_spacing: [spacing.y, spacing.x],
            slice_thickness: input.slice_thickness.unwrap_or(spacing.z),
            spacing_between_slices: input.spacing_between_slices.unwrap_or(spacing.z),
            derivation_description: derived.derivation_description.clone(),
            referenced_series_instance_uid: derived
                .referenced_series_instance_uid
                .clone()
                .or_else(|| input.primary_series.series_instance_uid.clone()),
            additional_tags: Self::additional_tags(&derived.additional_tags),
        };

        debug!(
            series = %metadata.series_instance_uid,
            study = %metadata.study_instance_uid,
            frame_of_reference = %metadata.frame_of_reference_uid,
            modality = %metadata.modality,
            "synthesized derived series metadata"
        );
        metadata
    }

    /// Derived override, then the quantized range, then the secondary
    /// series, then the 1st..99th percentile of the resampled data.
    fn window(
        input: &MetadataInput,
        resampled: &Volume,
        quantized: Option<&Quantized>,
    ) -> (Vec<f64>, Vec<f64>) {
        let derived = &input.derived_series;
        let secondary = &input.secondary_series;
        let fallback = || match quantized {
            Some(q) => q.window(),
            None => WindowLevel::from_percentiles(resampled.data()),
        };

        let mut computed = None;
        let mut pick = |explicit: &[f64], inherited: &[f64], of: fn(&WindowLevel) -> f64| {
            if !explicit.is_empty() {
                explicit.to_vec()
            } else if quantized.is_none() && !inherited.is_empty() {
                inherited.to_vec()
            } else {
                vec![of(computed.get_or_insert_with(fallback))]
            }
        };
        let center = pick(&derived.window_center, &secondary.window_center, |w| w.center);
        let width = pick(&derived.window_width, &secondary.window_width, |w| w.width);
        (center, width)
    }

    fn series_number(value: Option<&Value>, settings: &Settings) -> i32 {
        let parsed = value.and_then(|value| match value {
            Value::Number(number) => number
                .as_i64()
                .or_else(|| number.as_f64().filter(|v| v.fract() == 0.0).map(|v| v as i64)),
            Value::String(text) => text.trim().parse::<i64>().ok(),
            _ => None,
        });
        match parsed.and_then(|n| i32::try_from(n).ok()) {
            Some(number) => number,
            None => {
                if value.is_some_and(|v| !v.is_null()) {
                    warn!(?value, "ignoring unusable SeriesNumber");
                }
                settings.default_series_number
            }
        }
    }

    fn image_type(value: &Value) -> Vec<String> {
        match value {
            Value::Array(items) => items.iter().filter_map(loose_text).collect(),
            other => loose_text(other)
                .map(|text| text.split('\\').map(String::from).collect())
                .unwrap_or_default(),
        }
    }

    fn additional_tags(tags: &BTreeMap<String, Value>) -> Vec<(Tag, String)> {
        tags.iter()
            .filter_map(|(key, value)| match (parse_tag(key), loose_text(value)) {
                (Some(tag), Some(text)) => Some((tag, text)),
                (None, _) => {
                    warn!(key, "skipping additional tag with unrecognised key");
                    None
                }
                (Some(_), None) => None,
            })
            .collect()
    }
}

/// Parse `gggg|eeee`, `(gggg,eeee)`, `ggggeeee` or a dictionary keyword.
pub fn parse_tag(key: &str) -> Option<Tag> {
    let hex: String = key
        .chars()
        .filter(|c| !matches!(c, '(' | ')' | ',' | '|' | ' '))
        .collect();
    if hex.len() == 8 && hex.chars().all(|c| c.is_ascii_hexdigit()) {
        let group = u16::from_str_radix(&hex[..4], 16).ok()?;
        let element = u16::from_str_radix(&hex[4..], 16).ok()?;
        return Some(Tag(group, element));
    }
    StandardDataDictionary
        .by_name(key.trim())
        .map(|entry| entry.tag.inner())
}
