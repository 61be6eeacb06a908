use nalgebra::{Matrix3, Quaternion, Rotation3, UnitQuaternion, Vector3};
use serde::Serialize;

use super::IDENTITY_TOLERANCE;
use crate::error::{FusionError, Result};

const SINGULAR_DETERMINANT: f64 = 1e-12;

/// Which parametrisation an affine came from. Kept for diagnostics only;
/// every kind is applied as `matrix * p + translation`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AffineKind {
    Identity,
    Translation,
    Scale,
    Euler3D,
    VersorRigid3D,
    Similarity3D,
    Affine,
}

impl AffineKind {
    pub fn name(&self) -> &'static str {
        match self {
            AffineKind::Identity => "IdentityTransform",
            AffineKind::Translation => "TranslationTransform",
            AffineKind::Scale => "ScaleTransform",
            AffineKind::Euler3D => "Euler3DTransform",
            AffineKind::VersorRigid3D => "VersorRigid3DTransform",
            AffineKind::Similarity3D => "Similarity3DTransform",
            AffineKind::Affine => "AffineTransform",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AffineTransform {
    pub matrix: Matrix3<f64>,
    pub translation: Vector3<f64>,
    pub kind: AffineKind,
}

impl AffineTransform {
    pub fn new(matrix: Matrix3<f64>, translation: Vector3<f64>) -> Self {
        Self {
            matrix,
            translation,
            kind: AffineKind::Affine,
        }
    }

    pub fn identity() -> Self {
        Self {
            matrix: Matrix3::identity(),
            translation: Vector3::zeros(),
            kind: AffineKind::Identity,
        }
    }

    pub fn translation(offset: Vector3<f64>) -> Self {
        Self {
            matrix: Matrix3::identity(),
            translation: offset,
            kind: AffineKind::Translation,
        }
    }

    pub fn with_kind(mut self, kind: AffineKind) -> Self {
        self.kind = kind;
        self
    }

    /// `y = M (x - c) + c + t`, folded into a plain matrix and offset.
    pub fn about_center(
        matrix: Matrix3<f64>,
        translation: Vector3<f64>,
        center: Vector3<f64>,
        kind: AffineKind,
    ) -> Self {
        Self {
            matrix,
            translation: translation + center - matrix * center,
            kind,
        }
    }

    /// 4×4 homogeneous matrix, row-major. The last row is ignored.
    pub fn from_row_major(values: &[f64]) -> Result<Self> {
        if values.len() != 16 {
            return Err(FusionError::InvalidConfiguration(format!(
                "transform must contain 16 values, got {}",
                values.len()
            )));
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(FusionError::InvalidConfiguration(
                "transform contains non-finite values".into(),
            ));
        }
        let matrix = Matrix3::new(
            values[0], values[1], values[2], values[4], values[5], values[6], values[8],
            values[9], values[10],
        );
        let translation = Vector3::new(values[3], values[7], values[11]);
        Ok(Self::new(matrix, translation))
    }

    #[rustfmt::skip]
    pub fn to_row_major(&self) -> [f64; 16] {
        let m = &self.matrix;
        let t = &self.translation;
        [
            m[(0, 0)], m[(0, 1)], m[(0, 2)], t.x,
            m[(1, 0)], m[(1, 1)], m[(1, 2)], t.y,
            m[(2, 0)], m[(2, 1)], m[(2, 2)], t.z,
            0.0, 0.0, 0.0, 1.0,
        ]
    }

    /// Rotation about x, y and z (radians). ITK composes these as
    /// `Rz·Rx·Ry` unless `zyx` is set, in which case `Rz·Ry·Rx`.
    pub fn euler(angles: Vector3<f64>, zyx: bool) -> Matrix3<f64> {
        let rx = Rotation3::from_axis_angle(&Vector3::x_axis(), angles.x);
        let ry = Rotation3::from_axis_angle(&Vector3::y_axis(), angles.y);
        let rz = Rotation3::from_axis_angle(&Vector3::z_axis(), angles.z);
        let rotation = if zyx { rz * ry * rx } else { rz * rx * ry };
        rotation.into_inner()
    }

    /// Rotation from the vector part of a unit quaternion.
    pub fn versor(vector: Vector3<f64>) -> Matrix3<f64> {
        let w = (1.0 - vector.norm_squared()).max(0.0).sqrt();
        let quaternion = Quaternion::new(w, vector.x, vector.y, vector.z);
        UnitQuaternion::from_quaternion(quaternion)
            .to_rotation_matrix()
            .into_inner()
    }

    pub fn apply(&self, point: Vector3<f64>) -> Vector3<f64> {
        self.matrix * point + self.translation
    }

    pub fn try_invert(&self) -> Result<Self> {
        let determinant = self.matrix.determinant();
        let inverse = (determinant.abs() > SINGULAR_DETERMINANT)
            .then(|| self.matrix.try_inverse())
            .flatten()
            .ok_or_else(|| {
                FusionError::NotInvertible(format!(
                    "{} matrix is singular (det {determinant:e})",
                    self.kind.name()
                ))
            })?;
        Ok(Self {
            matrix: inverse,
            translation: -(inverse * self.translation),
            kind: self.kind,
        })
    }

    pub fn is_identity(&self) -> bool {
        (self.matrix - Matrix3::identity()).amax() <= IDENTITY_TOLERANCE
            && self.translation.amax() <= IDENTITY_TOLERANCE
    }
}
