//! Request contracts and process settings.
//!
//! Requests are JSON documents with camelCase keys. Settings come from
//! environment variables.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer};
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::enums::Interpolation;
use crate::error::{FusionError, Result};
use crate::metadata::{MetadataInput, generate_uid};
use crate::transform::TransformSource;

const DEFAULT_UID_ROOT: &str = "2.25";
const DEFAULT_SERIES_NUMBER: i32 = 9901;

/// Longest root that still leaves room for a 128-bit suffix in 64 characters.
const MAX_UID_ROOT_LEN: usize = 24;

/// Process-wide settings
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// Organisation root of generated UIDs
    pub uid_root: String,
    /// Series number used when a request does not set a usable one
    pub default_series_number: i32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            uid_root: DEFAULT_UID_ROOT.to_string(),
            default_series_number: DEFAULT_SERIES_NUMBER,
        }
    }
}

impl Settings {
    /// Load settings from environment variables
    pub fn from_env() -> Self {
        let mut settings = Self::default();

        if let Ok(root) = env::var("FUSEBOX_UID_ROOT") {
            if is_valid_uid_root(&root) {
                settings.uid_root = root;
            } else {
                warn!(root, "ignoring invalid FUSEBOX_UID_ROOT");
            }
        }
        if let Ok(val) = env::var("FUSEBOX_DEFAULT_SERIES_NUMBER")
            && let Ok(number) = val.trim().parse()
        {
            settings.default_series_number = number;
        }

        settings
    }

    pub fn generate_uid(&self) -> String {
        generate_uid(&self.uid_root)
    }
}

fn is_valid_uid_root(root: &str) -> bool {
    !root.is_empty()
        && root.len() <= MAX_UID_ROOT_LEN
        && root
            .split('.')
            .all(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_digit()))
}

/// Transform and interpolation fields shared by every request.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransformRequest {
    /// 16 values, row-major. `null` reads as absent.
    #[serde(deserialize_with = "null_as_empty")]
    pub transform: Vec<f64>,
    pub transform_file: Option<PathBuf>,
    pub invert_transform_file: bool,
    pub interpolation: Interpolation,
}

fn null_as_empty<'de, D>(deserializer: D) -> std::result::Result<Vec<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<f64>>::deserialize(deserializer)?.unwrap_or_default())
}

impl Default for TransformRequest {
    fn default() -> Self {
        Self {
            transform: Vec::new(),
            transform_file: None,
            invert_transform_file: true,
            interpolation: Interpolation::default(),
        }
    }
}

impl TransformRequest {
    /// A transform file takes precedence over a matrix.
    pub fn source(&self) -> Result<TransformSource> {
        if let Some(path) = &self.transform_file {
            return Ok(TransformSource::File {
                path: path.clone(),
                invert: self.invert_transform_file,
            });
        }
        if self.transform.is_empty() {
            return Err(FusionError::InvalidConfiguration(
                "Either transform or transformFile must be provided".into(),
            ));
        }
        if self.transform.len() != 16 || !self.transform.iter().all(|v| v.is_finite()) {
            return Err(FusionError::InvalidConfiguration(format!(
                "transform must hold 16 finite values, got {}",
                self.transform.len()
            )));
        }
        Ok(TransformSource::Matrix(self.transform.clone()))
    }
}

fn require_series(primary: &[PathBuf], secondary: &[PathBuf]) -> Result<()> {
    if primary.is_empty() || secondary.is_empty() {
        return Err(FusionError::InvalidConfiguration(
            "primary and secondary file lists required".into(),
        ));
    }
    Ok(())
}

/// Read and deserialize a request document.
pub fn from_path<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PreviewConfig {
    pub primary: Vec<PathBuf>,
    pub secondary: Vec<PathBuf>,
    #[serde(flatten)]
    pub transform: TransformRequest,
    pub slice_index: i64,
    pub include_primary: bool,
    /// Also render the returned plane as an 8-bit PNG here.
    pub preview_image: Option<PathBuf>,
}

impl PreviewConfig {
    /// Checks that need no file access. Returns the transform source.
    pub fn validate(&self) -> Result<TransformSource> {
        require_series(&self.primary, &self.secondary)?;
        self.transform.source()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExportConfig {
    pub primary: Vec<PathBuf>,
    pub secondary: Vec<PathBuf>,
    #[serde(flatten)]
    pub transform: TransformRequest,
    pub output_directory: Option<PathBuf>,
    pub metadata: MetadataInput,
    #[serde(rename = "scaleToUInt16")]
    pub scale_to_uint16: bool,
}

impl ExportConfig {
    /// Checks that need no file access. Returns the transform source and
    /// the output root.
    pub fn validate(&self) -> Result<(TransformSource, PathBuf)> {
        require_series(&self.primary, &self.secondary)?;
        let source = self.transform.source()?;
        let output = self
            .output_directory
            .clone()
            .filter(|dir| !dir.as_os_str().is_empty())
            .ok_or_else(|| FusionError::InvalidConfiguration("outputDirectory required".into()))?;
        Ok((source, output))
    }
}
