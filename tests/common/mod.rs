//! Synthetic single-frame series written to a temporary directory.

use std::path::{Path, PathBuf};

use dicom::core::{DataElement, PrimitiveValue, VR};
use dicom::object::{FileMetaTableBuilder, InMemDicomObject};
use dicom::transfer_syntax::entries::EXPLICIT_VR_LITTLE_ENDIAN;
use dicom_dictionary_std::{tags, uids};

pub const ROWS: usize = 3;
pub const COLUMNS: usize = 4;
pub const DEPTHS: [f64; 4] = [20.0, 22.5, 25.0, 27.5];

pub fn identity() -> Vec<f64> {
    let mut values = vec![0.0; 16];
    for i in [0, 5, 10, 15] {
        values[i] = 1.0;
    }
    values
}

/// Axial series on a 0.5 x 0.8 mm grid at [`DEPTHS`].
pub struct SyntheticSeries {
    pub modality: &'static str,
    pub series_uid: &'static str,
    pub intercept: f64,
    /// Stored value at (slice, row, column).
    pub stored: fn(usize, usize, usize) -> u16,
}

impl SyntheticSeries {
    /// Modality value the loader should produce at (slice, row, column).
    pub fn value(&self, slice: usize, row: usize, column: usize) -> f32 {
        ((self.stored)(slice, row, column) as f64 + self.intercept) as f32
    }

    /// Write one file per slice, in reverse depth order, so readers have to
    /// sort them.
    pub fn write(&self, dir: &Path) -> Vec<PathBuf> {
        DEPTHS
            .iter()
            .enumerate()
            .rev()
            .map(|(slice, depth)| {
                let path = dir.join(format!("{}_{slice}.dcm", self.modality.to_lowercase()));
                self.write_slice(&path, slice, *depth);
                path
            })
            .collect()
    }

    fn write_slice(&self, path: &Path, slice: usize, depth: f64) {
        let sop_instance_uid = format!("{}.{}", self.series_uid, slice + 1);
        let mut object = InMemDicomObject::new_empty();
        let mut put = |tag, vr, value: PrimitiveValue| {
            object.put(DataElement::new(tag, vr, value));
        };

        put(tags::SOP_CLASS_UID, VR::UI, uids::CT_IMAGE_STORAGE.into());
        put(tags::SOP_INSTANCE_UID, VR::UI, sop_instance_uid.as_str().into());
        put(tags::MODALITY, VR::CS, self.modality.into());
        put(tags::PATIENT_ID, VR::LO, "SYN-001".into());
        put(tags::PATIENT_NAME, VR::PN, "Synthetic^Patient".into());
        put(tags::STUDY_INSTANCE_UID, VR::UI, "1.2.826.0.1.3680043.8.498.1".into());
        put(tags::SERIES_INSTANCE_UID, VR::UI, self.series_uid.into());
        put(tags::FRAME_OF_REFERENCE_UID, VR::UI, "1.2.826.0.1.3680043.8.498.2".into());
        put(tags::SERIES_DESCRIPTION, VR::LO, format!("synthetic {}", self.modality).into());
        put(tags::INSTANCE_NUMBER, VR::IS, (slice + 1).to_string().into());
        put(
            tags::IMAGE_POSITION_PATIENT,
            VR::DS,
            format!("-10\\5\\{depth}").into(),
        );
        put(tags::IMAGE_ORIENTATION_PATIENT, VR::DS, "1\\0\\0\\0\\1\\0".into());
        put(tags::PIXEL_SPACING, VR::DS, "0.8\\0.5".into());
        put(tags::SLICE_THICKNESS, VR::DS, "2.5".into());
        put(tags::RESCALE_INTERCEPT, VR::DS, self.intercept.to_string().into());
        put(tags::RESCALE_SLOPE, VR::DS, "1".into());
        put(tags::PHOTOMETRIC_INTERPRETATION, VR::CS, "MONOCHROME2".into());
        for (tag, value) in [
            (tags::SAMPLES_PER_PIXEL, 1u16),
            (tags::ROWS, ROWS as u16),
            (tags::COLUMNS, COLUMNS as u16),
            (tags::BITS_ALLOCATED, 16),
            (tags::BITS_STORED, 16),
            (tags::HIGH_BIT, 15),
            (tags::PIXEL_REPRESENTATION, 0),
        ] {
            put(tag, VR::US, PrimitiveValue::from(value));
        }
        let samples: Vec<u16> = (0..ROWS)
            .flat_map(|row| (0..COLUMNS).map(move |column| (row, column)))
            .map(|(row, column)| (self.stored)(slice, row, column))
            .collect();
        put(tags::PIXEL_DATA, VR::OW, PrimitiveValue::U16(samples.into()));

        object
            .with_meta(
                FileMetaTableBuilder::new()
                    .transfer_syntax(EXPLICIT_VR_LITTLE_ENDIAN.uid())
                    .media_storage_sop_class_uid(uids::CT_IMAGE_STORAGE)
                    .media_storage_sop_instance_uid(sop_instance_uid.as_str()),
            )
            .expect("should have built file meta")
            .write_to_file(path)
            .expect("should have written synthetic slice");
    }
}

pub fn ct() -> SyntheticSeries {
    SyntheticSeries {
        modality: "CT",
        series_uid: "1.2.826.0.1.3680043.8.498.10",
        intercept: -1024.0,
        stored: |slice, row, column| 1000 + (slice * 100 + row * 10 + column) as u16,
    }
}

pub fn mr() -> SyntheticSeries {
    SyntheticSeries {
        modality: "MR",
        series_uid: "1.2.826.0.1.3680043.8.498.20",
        intercept: 0.0,
        stored: |slice, row, column| 7 + (slice * 50 + row * COLUMNS + column) as u16,
    }
}
