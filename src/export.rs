//! Writing a resampled volume as a derived DICOM series.
//!
//! Each plane becomes `dicom/slice_NNNN.dcm` (Explicit VR Little Endian)
//! under the output root, carrying the shared [`DerivedSeriesMetadata`]
//! plus its own UID, instance number and position. A `manifest.json`
//! summarising the series is written next to the `dicom` directory.
//!
//! Planes are written into a staging directory that replaces `dicom` only
//! once every plane succeeded, so a failed export leaves no partial series.

use std::fs;
use std::path::{Path, PathBuf};

use dicom::core::dictionary::DataDictionary;
use dicom::core::value::DataSetSequence;
use dicom::core::{DataElement, PrimitiveValue, Tag, VR};
use dicom::object::{FileMetaTableBuilder, InMemDicomObject};
use dicom::transfer_syntax::entries::EXPLICIT_VR_LITTLE_ENDIAN;
use dicom_dictionary_std::{StandardDataDictionary, tags};
use nalgebra::Vector3;
use ndarray::{Array3, s};
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::diagnostics::Diagnostics;
use crate::error::{FusionError, Result};
use crate::metadata::{DerivedSeriesMetadata, format_ds, format_ds_multi};
use crate::volume::Volume;

pub const DICOM_DIR: &str = "dicom";
pub const MANIFEST_FILE: &str = "manifest.json";
const STAGING_SUFFIX: &str = ".partial";

/// Stored samples of the series being written.
#[derive(Debug, Clone, Copy)]
pub enum ExportPixels<'a> {
    Float32(&'a Array3<f32>),
    UInt16(&'a Array3<u16>),
}

impl ExportPixels<'_> {
    fn dim(&self) -> (usize, usize, usize) {
        match self {
            ExportPixels::Float32(data) => data.dim(),
            ExportPixels::UInt16(data) => data.dim(),
        }
    }

    fn plane_element(&self, index: usize) -> DataElement<InMemDicomObject> {
        match self {
            ExportPixels::Float32(data) => {
                let samples: Vec<f32> = data.slice(s![index, .., ..]).iter().copied().collect();
                DataElement::new(
                    tags::FLOAT_PIXEL_DATA,
                    VR::OF,
                    PrimitiveValue::F32(samples.into()),
                )
            }
            ExportPixels::UInt16(data) => {
                let samples: Vec<u16> = data.slice(s![index, .., ..]).iter().copied().collect();
                DataElement::new(tags::PIXEL_DATA, VR::OW, PrimitiveValue::U16(samples.into()))
            }
        }
    }
}

/// One written plane.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceRecord {
    pub index: usize,
    #[serde(rename = "sopInstanceUID")]
    pub sop_instance_uid: String,
    pub file_name: String,
    pub file_path: PathBuf,
    pub instance_number: usize,
    pub image_position_patient: [f64; 3],
    pub slice_location: f64,
    pub window_center: Vec<f64>,
    pub window_width: Vec<f64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportManifest {
    pub ok: bool,
    pub modality: String,
    pub series_description: String,
    #[serde(rename = "studyInstanceUID")]
    pub study_instance_uid: String,
    #[serde(rename = "seriesInstanceUID")]
    pub series_instance_uid: String,
    #[serde(rename = "frameOfReferenceUID")]
    pub frame_of_reference_uid: String,
    pub slice_count: usize,
    pub rows: usize,
    pub columns: usize,
    pub pixel_spacing: [f64; 2],
    pub image_orientation_patient: [f64; 6],
    pub image_position_patient_first: [f64; 3],
    pub image_position_patient_last: [f64; 3],
    pub window_center: Vec<f64>,
    pub window_width: Vec<f64>,
    pub rescale_slope: f64,
    pub rescale_intercept: f64,
    pub spacing_uniform: bool,
    pub output_directory: PathBuf,
    pub manifest_path: PathBuf,
    pub instances: Vec<InstanceRecord>,
    pub diagnostics: Diagnostics,
}

pub struct SeriesWriter<'a> {
    volume: &'a Volume,
    pixels: ExportPixels<'a>,
    metadata: &'a DerivedSeriesMetadata,
    settings: &'a Settings,
}

impl<'a> SeriesWriter<'a> {
    /// `volume` supplies the grid; `pixels` must match its shape.
    pub fn new(
        volume: &'a Volume,
        pixels: ExportPixels<'a>,
        metadata: &'a DerivedSeriesMetadata,
        settings: &'a Settings,
    ) -> Result<Self> {
        if pixels.dim() != volume.dim() {
            return Err(FusionError::InconsistentGeometry(format!(
                "export samples {:?} do not match grid {:?}",
                pixels.dim(),
                volume.dim()
            )));
        }
        Ok(Self {
            volume,
            pixels,
            metadata,
            settings,
        })
    }

    /// Write every plane and the manifest under `output_root`.
    pub fn write(&self, output_root: &Path, diagnostics: Diagnostics) -> Result<ExportManifest> {
        let dicom_dir = output_root.join(DICOM_DIR);

        let (depth, rows, columns) = self.volume.dim();
        info!(
            series = %self.metadata.series_instance_uid,
            planes = depth,
            directory = %dicom_dir.display(),
            "writing derived series"
        );

        let instances = write_staged(&dicom_dir, |staging| {
            (0..depth)
                .into_par_iter()
                .map(|index| self.write_plane(staging, &dicom_dir, index))
                .collect::<Result<Vec<_>>>()
        })?;

        let geometry = self.volume.geometry();
        let (row_dir, col_dir) = (geometry.row_dir(), geometry.col_dir());
        let first = self.plane_position(0);
        let last = self.plane_position(depth.saturating_sub(1));
        let manifest_path = output_root.join(MANIFEST_FILE);

        let manifest = ExportManifest {
            ok: true,
            modality: self.metadata.modality.clone(),
            series_description: self.metadata.series_description.clone(),
            study_instance_uid: self.metadata.study_instance_uid.clone(),
            series_instance_uid: self.metadata.series_instance_uid.clone(),
            frame_of_reference_uid: self.metadata.frame_of_reference_uid.clone(),
            slice_count: depth,
            rows,
            columns,
            pixel_spacing: self.metadata.pixel_spacing,
            image_orientation_patient: [
                row_dir.x, row_dir.y, row_dir.z, col_dir.x, col_dir.y, col_dir.z,
            ],
            image_position_patient_first: first.into(),
            image_position_patient_last: last.into(),
            window_center: self.metadata.window_center.clone(),
            window_width: self.metadata.window_width.clone(),
            rescale_slope: self.metadata.rescale_slope,
            rescale_intercept: self.metadata.rescale_intercept,
            spacing_uniform: self.volume.spacing_uniform(),
            output_directory: dicom_dir,
            manifest_path: manifest_path.clone(),
            instances,
            diagnostics,
        };

        fs::write(&manifest_path, serde_json::to_string_pretty(&manifest)?)?;
        Ok(manifest)
    }

    fn plane_position(&self, index: usize) -> Vector3<f64> {
        self.volume.index_to_world(Vector3::new(0.0, 0.0, index as f64))
    }

    /// Writes into `staging`; the record points at the published `dicom_dir`.
    fn write_plane(
        &self,
        staging: &Path,
        dicom_dir: &Path,
        index: usize,
    ) -> Result<InstanceRecord> {
        let sop_instance_uid = self.settings.generate_uid();
        let position = self.plane_position(index);
        let file_name = format!("slice_{index:04}.dcm");
        let staged_path = staging.join(&file_name);

        let object = self.plane_object(index, &sop_instance_uid, &position);
        let file_object = object
            .with_meta(
                FileMetaTableBuilder::new()
                    .transfer_syntax(EXPLICIT_VR_LITTLE_ENDIAN.uid())
                    .media_storage_sop_class_uid(self.metadata.sop_class_uid.as_str())
                    .media_storage_sop_instance_uid(sop_instance_uid.as_str()),
            )
            .map_err(|err| FusionError::DicomWrite(err.to_string()))?;
        file_object
            .write_to_file(&staged_path)
            .map_err(|err| FusionError::DicomWrite(format!("{}: {err}", staged_path.display())))?;
        debug!(file = %staged_path.display(), "wrote plane {index}");

        Ok(InstanceRecord {
            index,
            sop_instance_uid,
            file_path: dicom_dir.join(&file_name),
            file_name,
            instance_number: index + 1,
            image_position_patient: position.into(),
            slice_location: position.z,
            window_center: self.metadata.window_center.clone(),
            window_width: self.metadata.window_width.clone(),
        })
    }

    /// Shared tags, per-plane tags, overrides, then samples.
    fn plane_object(
        &self,
        index: usize,
        sop_instance_uid: &str,
        position: &Vector3<f64>,
    ) -> InMemDicomObject {
        let meta = self.metadata;
        let (_, rows, columns) = self.volume.dim();
        let geometry = self.volume.geometry();
        let (row_dir, col_dir) = (geometry.row_dir(), geometry.col_dir());

        let mut object = InMemDicomObject::new_empty();
        let mut put_text = |tag: Tag, vr: VR, value: &str| {
            object.put(DataElement::new(tag, vr, PrimitiveValue::from(value)));
        };

        put_text(tags::SOP_CLASS_UID, VR::UI, &meta.sop_class_uid);
        put_text(tags::SOP_INSTANCE_UID, VR::UI, sop_instance_uid);
        put_text(tags::IMAGE_TYPE, VR::CS, &meta.image_type.join("\\"));
        put_text(tags::MODALITY, VR::CS, &meta.modality);
        put_text(tags::SERIES_DESCRIPTION, VR::LO, &meta.series_description);

        let patient = &meta.patient;
        let study = &meta.study;
        let or_empty = |value: &Option<String>| value.clone().unwrap_or_default();
        put_text(tags::PATIENT_NAME, VR::PN, &or_empty(&patient.patient_name));
        put_text(tags::PATIENT_ID, VR::LO, &or_empty(&patient.patient_id));
        put_text(tags::PATIENT_BIRTH_DATE, VR::DA, &or_empty(&patient.patient_birth_date));
        put_text(tags::PATIENT_SEX, VR::CS, &or_empty(&patient.patient_sex));
        if let Some(age) = &patient.patient_age {
            put_text(tags::PATIENT_AGE, VR::AS, age);
        }
        put_text(tags::STUDY_DATE, VR::DA, &or_empty(&study.study_date));
        put_text(tags::STUDY_TIME, VR::TM, &or_empty(&study.study_time));
        put_text(tags::ACCESSION_NUMBER, VR::SH, &or_empty(&study.accession_number));
        put_text(
            tags::REFERRING_PHYSICIAN_NAME,
            VR::PN,
            &or_empty(&study.referring_physician_name),
        );

        put_text(tags::STUDY_INSTANCE_UID, VR::UI, &meta.study_instance_uid);
        put_text(tags::SERIES_INSTANCE_UID, VR::UI, &meta.series_instance_uid);
        put_text(tags::SERIES_NUMBER, VR::IS, &meta.series_number.to_string());
        put_text(tags::FRAME_OF_REFERENCE_UID, VR::UI, &meta.frame_of_reference_uid);
        put_text(tags::INSTANCE_NUMBER, VR::IS, &(index + 1).to_string());

        let decimals = |values: &[f64]| format_ds_multi(values);
        if let Some(text) = decimals(position.as_slice()) {
            put_text(tags::IMAGE_POSITION_PATIENT, VR::DS, &text);
        }
        let orientation = [row_dir.x, row_dir.y, row_dir.z, col_dir.x, col_dir.y, col_dir.z];
        if let Some(text) = decimals(&orientation) {
            put_text(tags::IMAGE_ORIENTATION_PATIENT, VR::DS, &text);
        }
        if let Some(text) = format_ds(position.z) {
            put_text(tags::SLICE_LOCATION, VR::DS, &text);
        }
        if let Some(text) = decimals(&meta.pixel_spacing) {
            put_text(tags::PIXEL_SPACING, VR::DS, &text);
        }
        if let Some(text) = format_ds(meta.slice_thickness) {
            put_text(tags::SLICE_THICKNESS, VR::DS, &text);
        }
        if let Some(text) = format_ds(meta.spacing_between_slices) {
            put_text(tags::SPACING_BETWEEN_SLICES, VR::DS, &text);
        }
        if let Some(text) = decimals(&meta.window_center) {
            put_text(tags::WINDOW_CENTER, VR::DS, &text);
        }
        if let Some(text) = decimals(&meta.window_width) {
            put_text(tags::WINDOW_WIDTH, VR::DS, &text);
        }
        if let Some(text) = format_ds(meta.rescale_intercept) {
            put_text(tags::RESCALE_INTERCEPT, VR::DS, &text);
        }
        if let Some(text) = format_ds(meta.rescale_slope) {
            put_text(tags::RESCALE_SLOPE, VR::DS, &text);
        }
        put_text(
            tags::PHOTOMETRIC_INTERPRETATION,
            VR::CS,
            &meta.photometric_interpretation,
        );
        if let Some(description) = &meta.derivation_description {
            put_text(tags::DERIVATION_DESCRIPTION, VR::ST, description);
        }

        let encoding = meta.encoding;
        for (tag, value) in [
            (tags::SAMPLES_PER_PIXEL, meta.samples_per_pixel),
            (tags::ROWS, rows as u16),
            (tags::COLUMNS, columns as u16),
            (tags::BITS_ALLOCATED, encoding.bits_allocated),
            (tags::BITS_STORED, encoding.bits_stored),
            (tags::HIGH_BIT, encoding.high_bit),
            (tags::PIXEL_REPRESENTATION, encoding.pixel_representation),
        ] {
            object.put(DataElement::new(tag, VR::US, PrimitiveValue::from(value)));
        }

        if let Some(referenced) = &meta.referenced_series_instance_uid {
            let item = InMemDicomObject::from_element_iter([DataElement::new(
                tags::SERIES_INSTANCE_UID,
                VR::UI,
                PrimitiveValue::from(referenced.as_str()),
            )]);
            object.put(DataElement::new(
                tags::REFERENCED_SERIES_SEQUENCE,
                VR::SQ,
                DataSetSequence::from(vec![item]),
            ));
        }

        for (tag, value) in &meta.additional_tags {
            object.put(DataElement::new(
                *tag,
                additional_tag_vr(*tag),
                PrimitiveValue::from(value.as_str()),
            ));
        }

        object.put(self.pixels.plane_element(index));
        object
    }
}

/// Run `write` against a fresh staging directory next to `target`, then
/// replace `target` with it. On failure the staging directory is removed
/// and `target` is left as it was.
fn write_staged<T>(target: &Path, write: impl FnOnce(&Path) -> Result<T>) -> Result<T> {
    let mut staging_name = target.file_name().unwrap_or_default().to_os_string();
    staging_name.push(STAGING_SUFFIX);
    let staging = target.with_file_name(staging_name);
    if staging.exists() {
        fs::remove_dir_all(&staging)?;
    }
    fs::create_dir_all(&staging)?;

    let written = match write(&staging) {
        Ok(written) => written,
        Err(err) => {
            if let Err(cleanup) = fs::remove_dir_all(&staging) {
                warn!(
                    staging = %staging.display(),
                    "could not remove staging directory: {cleanup}"
                );
            }
            return Err(err);
        }
    };

    if target.exists() {
        fs::remove_dir_all(target)?;
    }
    fs::rename(&staging, target)?;
    Ok(written)
}

/// Dictionary VR when it is a text VR, otherwise LO.
fn additional_tag_vr(tag: Tag) -> VR {
    let vr = StandardDataDictionary
        .by_tag(tag)
        .map(|entry| entry.vr.relaxed())
        .unwrap_or(VR::LO);
    match vr {
        VR::AE | VR::AS | VR::CS | VR::DA | VR::DS | VR::DT | VR::IS | VR::LO | VR::LT
        | VR::PN | VR::SH | VR::ST | VR::TM | VR::UC | VR::UI | VR::UR | VR::UT => vr,
        _ => VR::LO,
    }
}
