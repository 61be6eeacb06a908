//! Preview and export as single blocking invocations.
//!
//! Both run load → order → resolve transform → resample, then either encode
//! one plane or write the whole derived series. Any stage failing ends the
//! invocation; callers turn the error into an `{ok: false, error}` payload
//! with [`respond`].

use std::path::Path;

use serde::Serialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::config::{ExportConfig, PreviewConfig, Settings};
use crate::diagnostics::Diagnostics;
use crate::enums::{Interpolation, Modality};
use crate::error::{FusionError, Result};
use crate::export::{ExportManifest, ExportPixels, SeriesWriter};
use crate::extract::{BlendedPreview, PreviewPlane, SliceExtractor};
use crate::metadata::{MetadataInput, MetadataSynthesizer};
use crate::quantize::Quantized;
use crate::resampler::{ResampleRequest, Resampler};
use crate::transform::{TransformResolver, TransformSource};
use crate::volume::Volume;
use crate::volume_loader::VolumeLoader;

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum PreviewPayload {
    Single(PreviewPlane),
    Blended(BlendedPreview),
}

#[derive(Debug, Clone, Serialize)]
pub struct PreviewResponse {
    pub ok: bool,
    #[serde(flatten)]
    pub payload: PreviewPayload,
    pub diagnostics: Diagnostics,
}

/// Primary volume and the secondary resampled onto its grid.
#[derive(Debug)]
pub struct Fused {
    pub primary: Volume,
    pub resampled: Volume,
}

/// Load both series, resolve the transform and resample the secondary onto
/// the primary grid. `fill_value` overrides the modality default.
pub fn fuse(
    primary: &[impl AsRef<Path> + Sync],
    secondary: &[impl AsRef<Path> + Sync],
    source: &TransformSource,
    interpolation: Interpolation,
    fill_value: Option<f32>,
    diagnostics: &mut Diagnostics,
) -> Result<Fused> {
    info!(
        primary = primary.len(),
        secondary = secondary.len(),
        "loading series"
    );
    let primary = VolumeLoader::load_from_file_paths("primary", primary, diagnostics)?;
    let secondary = VolumeLoader::load_from_file_paths("secondary", secondary, diagnostics)?;

    let resolved = TransformResolver::resolve(&primary, &secondary, source, diagnostics)?;
    info!(
        moving_to_fixed = %resolved.moving_to_fixed.name(),
        resample_with = %resolved.output_to_input.name(),
        "transform resolved"
    );

    let mut request =
        ResampleRequest::new(&primary, &secondary, &resolved.output_to_input, interpolation);
    if let Some(fill_value) = fill_value {
        request = request.with_fill_value(fill_value);
    }
    let resampled = Resampler::resample(&request)?;
    info!(size = ?resampled.size(), "resampling complete");

    Ok(Fused { primary, resampled })
}

pub fn run_preview(config: &PreviewConfig) -> Result<PreviewResponse> {
    let source = config.validate()?;
    let mut diagnostics = Diagnostics::new();
    let fused = fuse(
        &config.primary,
        &config.secondary,
        &source,
        config.transform.interpolation,
        None,
        &mut diagnostics,
    )?;

    let index = config.slice_index;
    let payload = if config.include_primary {
        PreviewPayload::Blended(SliceExtractor::blended_preview(
            &fused.primary,
            &fused.resampled,
            index,
        )?)
    } else {
        let plane = SliceExtractor::extract_plane(&fused.resampled, index)?;
        PreviewPayload::Single(SliceExtractor::encode(&plane))
    };

    if let Some(path) = &config.preview_image {
        let rendered = match &payload {
            PreviewPayload::Single(plane) => plane,
            PreviewPayload::Blended(blended) => &blended.blend,
        };
        rendered.save_png(path)?;
        info!(path = %path.display(), "wrote preview image");
    }

    Ok(PreviewResponse {
        ok: true,
        payload,
        diagnostics,
    })
}

pub fn run_export(config: &ExportConfig, settings: &Settings) -> Result<ExportManifest> {
    let (source, output_root) = config.validate()?;
    let mut diagnostics = Diagnostics::new();

    // An explicit secondary modality in the request decides the fill value.
    let fill_value = config
        .metadata
        .secondary_series
        .modality
        .as_deref()
        .map(|code| Modality::parse(code).outside_fill_value());
    let fused = fuse(
        &config.primary,
        &config.secondary,
        &source,
        config.transform.interpolation,
        fill_value,
        &mut diagnostics,
    )?;

    let mut metadata: MetadataInput = config.metadata.clone();
    metadata.inherit(&fused.primary.fields, &fused.resampled.fields);

    let quantized = config
        .scale_to_uint16
        .then(|| Quantized::from_volume_data(fused.resampled.data()));
    if let Some(q) = &quantized {
        info!(min = q.min, max = q.max, slope = q.slope, "quantized to unsigned 16-bit");
    }
    let derived =
        MetadataSynthesizer::synthesize(&metadata, &fused.resampled, quantized.as_ref(), settings);

    let pixels = match &quantized {
        Some(q) => ExportPixels::UInt16(&q.data),
        None => ExportPixels::Float32(fused.resampled.data()),
    };
    let manifest = SeriesWriter::new(&fused.resampled, pixels, &derived, settings)?
        .write(&output_root, diagnostics)?;
    info!(
        series = %manifest.series_instance_uid,
        slices = manifest.slice_count,
        manifest = %manifest.manifest_path.display(),
        "export complete"
    );
    Ok(manifest)
}

/// Success payload, or `{ok: false, error, kind}`.
pub fn respond<T: Serialize>(result: Result<T>) -> Value {
    match result.and_then(|payload| Ok(serde_json::to_value(payload)?)) {
        Ok(value) => value,
        Err(err) => {
            warn!(kind = err.kind(), "request failed: {err}");
            error_payload(&err)
        }
    }
}

pub fn error_payload(err: &FusionError) -> Value {
    json!({
        "ok": false,
        "error": err.to_string(),
        "kind": err.kind(),
    })
}
