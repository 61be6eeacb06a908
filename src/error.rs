use dicom::core::Tag;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FusionError {
    #[error("Missing required field {tag} in {source_id}")]
    MissingField { tag: Tag, source_id: String },

    #[error("Degenerate slice orientation: {0}")]
    DegenerateOrientation(String),

    #[error("Inconsistent slice geometry: {0}")]
    InconsistentGeometry(String),

    #[error("Transform is not invertible: {0}")]
    NotInvertible(String),

    #[error("sliceIndex {index} not in [0,{}]", .depth.saturating_sub(1))]
    IndexOutOfRange { index: i64, depth: usize },

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("No valid DICOM slices found for {0}")]
    NoValidSlices(String),

    #[error("Malformed transform: {0}")]
    TransformParse(String),

    #[error("Pixel data error: {0}")]
    PixelData(String),

    #[error("DICOM write error: {0}")]
    DicomWrite(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("DICOM error: {0}")]
    DicomRead(#[from] dicom::object::ReadError),
}

impl FusionError {
    /// Stable name used in structured error payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MissingField { .. } => "missing_field",
            Self::DegenerateOrientation(_) => "degenerate_orientation",
            Self::InconsistentGeometry(_) => "inconsistent_geometry",
            Self::NotInvertible(_) => "not_invertible",
            Self::IndexOutOfRange { .. } => "index_out_of_range",
            Self::InvalidConfiguration(_) => "invalid_configuration",
            Self::NoValidSlices(_) => "no_valid_slices",
            Self::TransformParse(_) => "transform_parse",
            Self::PixelData(_) => "pixel_data",
            Self::DicomWrite(_) => "dicom_write",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
            Self::DicomRead(_) => "dicom_read",
        }
    }
}

pub type Result<T, E = FusionError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_error_reports_last_valid_index() {
        let err = FusionError::IndexOutOfRange { index: 9, depth: 4 };
        assert_eq!(err.to_string(), "sliceIndex 9 not in [0,3]");
        assert_eq!(err.kind(), "index_out_of_range");
    }

    #[test]
    fn missing_field_names_the_tag() {
        let err = FusionError::MissingField {
            tag: Tag(0x0020, 0x0032),
            source_id: "a.dcm".into(),
        };
        assert!(err.to_string().contains("(0020,0032)"));
    }
}
