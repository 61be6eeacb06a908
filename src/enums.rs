use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Interpolation {
    Nearest,
    #[default]
    Linear,
}

// Anything other than "nearest" resamples linearly.
impl From<&str> for Interpolation {
    fn from(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("nearest") {
            Interpolation::Nearest
        } else {
            Interpolation::Linear
        }
    }
}

impl From<String> for Interpolation {
    fn from(value: String) -> Self {
        Interpolation::from(value.as_str())
    }
}

impl From<Interpolation> for String {
    fn from(value: Interpolation) -> Self {
        match value {
            Interpolation::Nearest => "nearest".into(),
            Interpolation::Linear => "linear".into(),
        }
    }
}

const CT_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.2";
const MR_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.4";
const CBCT_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.13";
const PET_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.128";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Modality {
    #[default]
    Ct,
    Pet,
    Mr,
    Cbct,
    Other(String),
}

impl Modality {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_uppercase().as_str() {
            "CT" => Modality::Ct,
            "PT" | "PET" => Modality::Pet,
            "MR" => Modality::Mr,
            "CBCT" => Modality::Cbct,
            other => Modality::Other(other.to_string()),
        }
    }

    pub fn code(&self) -> &str {
        match self {
            Modality::Ct => "CT",
            Modality::Pet => "PT",
            Modality::Mr => "MR",
            Modality::Cbct => "CBCT",
            Modality::Other(code) => code,
        }
    }

    /// Storage SOP class used for planes derived from this modality.
    pub fn sop_class_uid(&self) -> &'static str {
        match self {
            Modality::Ct | Modality::Other(_) => CT_IMAGE_STORAGE,
            Modality::Pet => PET_IMAGE_STORAGE,
            Modality::Mr => MR_IMAGE_STORAGE,
            Modality::Cbct => CBCT_IMAGE_STORAGE,
        }
    }

    /// Value written where the moving volume has no support: air for CT,
    /// zero otherwise so hot colormaps on non-negative data get no bright border.
    pub fn outside_fill_value(&self) -> f32 {
        match self {
            Modality::Ct => -1000.0,
            _ => 0.0,
        }
    }
}
