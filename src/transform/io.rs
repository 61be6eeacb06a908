//! Reading serialized transforms.
//!
//! Two formats are understood: ITK's text transform files (`.tfm`, `.txt`)
//! and a JSON document describing a nested transform tree (`.json`).

use std::fs;
use std::path::Path;

use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

use super::{AffineKind, AffineTransform, MAX_NESTING, SpatialTransform};
use crate::error::{FusionError, Result};

pub fn read_transform_file(path: &Path) -> Result<SpatialTransform> {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);
    match extension.as_deref() {
        Some("h5" | "hdf5") => Err(FusionError::InvalidConfiguration(format!(
            "{}: HDF5 transform containers are not supported, export as .tfm or .json",
            path.display()
        ))),
        Some("json") => {
            let document: TransformDocument = serde_json::from_str(&fs::read_to_string(path)?)?;
            document.into_transform()
        }
        _ => parse_itk_text(&fs::read_to_string(path)?),
    }
}

/// Nested transform description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransformDocument {
    Identity,
    /// Row-major 4×4 homogeneous matrix.
    Affine {
        matrix: Vec<f64>,
    },
    Translation {
        offset: [f64; 3],
    },
    /// Children applied in list order.
    Composite {
        children: Vec<TransformDocument>,
    },
}

impl TransformDocument {
    pub fn into_transform(self) -> Result<SpatialTransform> {
        self.convert(0)
    }

    fn convert(self, depth: usize) -> Result<SpatialTransform> {
        if depth > MAX_NESTING {
            return Err(FusionError::TransformParse(format!(
                "composite nesting deeper than {MAX_NESTING}"
            )));
        }
        Ok(match self {
            TransformDocument::Identity => SpatialTransform::identity(),
            TransformDocument::Affine { matrix } => AffineTransform::from_row_major(&matrix)
                .map(SpatialTransform::Affine)
                .map_err(|err| FusionError::TransformParse(err.to_string()))?,
            TransformDocument::Translation { offset } => SpatialTransform::Affine(
                AffineTransform::translation(Vector3::from(offset)),
            ),
            TransformDocument::Composite { children } => SpatialTransform::Composite(
                children
                    .into_iter()
                    .map(|child| child.convert(depth + 1))
                    .collect::<Result<_>>()?,
            ),
        })
    }
}

#[derive(Debug, Default)]
struct ItkRecord {
    type_name: String,
    parameters: Vec<f64>,
    fixed_parameters: Vec<f64>,
}

/// Parse an ITK text transform file.
///
/// A leading `CompositeTransform` owns every record that follows it. ITK
/// applies a composite queue back to front, so the children are reversed to
/// keep [`SpatialTransform::Composite`]'s in-order semantics.
pub fn parse_itk_text(text: &str) -> Result<SpatialTransform> {
    let records = read_records(text)?;
    let Some((first, rest)) = records.split_first() else {
        return Err(FusionError::TransformParse("no transforms found".into()));
    };

    if base_name(&first.type_name)? == "CompositeTransform" {
        let children = rest
            .iter()
            .rev()
            .map(record_to_transform)
            .collect::<Result<Vec<_>>>()?;
        return Ok(SpatialTransform::Composite(children));
    }
    if !rest.is_empty() {
        return Err(FusionError::TransformParse(format!(
            "{} transforms without a CompositeTransform header",
            records.len()
        )));
    }
    record_to_transform(first)
}

fn read_records(text: &str) -> Result<Vec<ItkRecord>> {
    let mut records: Vec<ItkRecord> = Vec::new();
    for line in text.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            return Err(FusionError::TransformParse(format!("unexpected line `{line}`")));
        };
        let value = value.trim();
        match key.trim() {
            "Transform" => records.push(ItkRecord {
                type_name: value.to_string(),
                ..ItkRecord::default()
            }),
            "Parameters" => current(&mut records, key)?.parameters = parse_values(value)?,
            "FixedParameters" => {
                current(&mut records, key)?.fixed_parameters = parse_values(value)?
            }
            other => {
                return Err(FusionError::TransformParse(format!("unknown key `{other}`")));
            }
        }
    }
    Ok(records)
}

fn current<'a>(records: &'a mut [ItkRecord], key: &str) -> Result<&'a mut ItkRecord> {
    records
        .last_mut()
        .ok_or_else(|| FusionError::TransformParse(format!("`{key}` before any `Transform:`")))
}

fn parse_values(raw: &str) -> Result<Vec<f64>> {
    raw.split_whitespace()
        .map(|value| {
            value
                .parse::<f64>()
                .map_err(|_| FusionError::TransformParse(format!("bad number `{value}`")))
        })
        .collect()
}

/// `AffineTransform_double_3_3` → `AffineTransform`, rejecting non-3D types.
fn base_name(type_name: &str) -> Result<&str> {
    let mut parts = type_name.split('_');
    let base = parts.next().unwrap_or_default();
    let dimensions: Vec<&str> = parts.skip(1).collect();
    if !dimensions.is_empty() && dimensions.iter().any(|d| *d != "3") {
        return Err(FusionError::TransformParse(format!(
            "{type_name} is not a 3D transform"
        )));
    }
    Ok(base)
}

fn record_to_transform(record: &ItkRecord) -> Result<SpatialTransform> {
    let name = base_name(&record.type_name)?;
    let p = &record.parameters;
    let center = fixed_center(&record.fixed_parameters);
    let expect = |count: usize| -> Result<()> {
        if p.len() == count {
            Ok(())
        } else {
            Err(FusionError::TransformParse(format!(
                "{name} expects {count} parameters, got {}",
                p.len()
            )))
        }
    };

    let affine = match name {
        "IdentityTransform" => AffineTransform::identity(),
        "TranslationTransform" => {
            expect(3)?;
            AffineTransform::translation(Vector3::new(p[0], p[1], p[2]))
        }
        "ScaleTransform" => {
            expect(3)?;
            let matrix = Matrix3::from_diagonal(&Vector3::new(p[0], p[1], p[2]));
            AffineTransform::about_center(matrix, Vector3::zeros(), center, AffineKind::Scale)
        }
        "AffineTransform" | "MatrixOffsetTransformBase" => {
            expect(12)?;
            let matrix = Matrix3::from_row_slice(&p[..9]);
            let translation = Vector3::new(p[9], p[10], p[11]);
            AffineTransform::about_center(matrix, translation, center, AffineKind::Affine)
        }
        "Euler3DTransform" => {
            expect(6)?;
            let zyx = record.fixed_parameters.get(3).is_some_and(|flag| *flag != 0.0);
            let matrix = AffineTransform::euler(Vector3::new(p[0], p[1], p[2]), zyx);
            let translation = Vector3::new(p[3], p[4], p[5]);
            AffineTransform::about_center(matrix, translation, center, AffineKind::Euler3D)
        }
        "VersorRigid3DTransform" => {
            expect(6)?;
            let matrix = AffineTransform::versor(Vector3::new(p[0], p[1], p[2]));
            let translation = Vector3::new(p[3], p[4], p[5]);
            AffineTransform::about_center(matrix, translation, center, AffineKind::VersorRigid3D)
        }
        "Similarity3DTransform" => {
            expect(7)?;
            let matrix = AffineTransform::versor(Vector3::new(p[0], p[1], p[2])) * p[6];
            let translation = Vector3::new(p[3], p[4], p[5]);
            AffineTransform::about_center(matrix, translation, center, AffineKind::Similarity3D)
        }
        "CompositeTransform" => {
            return Err(FusionError::TransformParse(
                "nested CompositeTransform records are not supported in text files".into(),
            ));
        }
        other => {
            return Err(FusionError::TransformParse(format!(
                "unsupported transform type {other}"
            )));
        }
    };
    Ok(SpatialTransform::Affine(affine))
}

fn fixed_center(fixed: &[f64]) -> Vector3<f64> {
    match fixed {
        [x, y, z, ..] => Vector3::new(*x, *y, *z),
        _ => Vector3::zeros(),
    }
}
