//! Spatial transforms between physical coordinate spaces.
//!
//! Registration artifacts arrive either as a 4×4 matrix or as a serialized
//! transform tree. Both end up as a [`SpatialTransform`]: a closed set of
//! variants that can map points and, where possible, be inverted.

pub mod affine;
pub mod flatten;
pub mod io;
pub mod resolver;

use std::fmt;
use std::sync::Arc;

use nalgebra::Vector3;
use serde::Serialize;

use crate::error::{FusionError, Result};

pub use affine::{AffineKind, AffineTransform};
pub use resolver::{ResolvedTransform, TransformResolver, TransformSource};

/// Deepest composite nesting that is read, flattened or described.
pub const MAX_NESTING: usize = 10;

/// Tolerance below which parameters count as identity.
pub const IDENTITY_TOLERANCE: f64 = 1e-6;

/// A mapping the crate cannot look inside, such as a dense deformation
/// field supplied by a caller.
pub trait PointMapping: fmt::Debug + Send + Sync {
    fn name(&self) -> &str;

    fn apply(&self, point: Vector3<f64>) -> Vector3<f64>;

    /// Best-effort inverse.
    fn try_invert(&self) -> Option<Arc<dyn PointMapping>> {
        None
    }

    fn is_identity(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone)]
pub enum SpatialTransform {
    Affine(AffineTransform),
    /// Children are applied in list order.
    Composite(Vec<SpatialTransform>),
    Opaque(Arc<dyn PointMapping>),
}

impl SpatialTransform {
    pub fn identity() -> Self {
        SpatialTransform::Affine(AffineTransform::identity())
    }

    pub fn name(&self) -> String {
        match self {
            SpatialTransform::Affine(affine) => affine.kind.name().to_string(),
            SpatialTransform::Composite(children) => {
                format!("CompositeTransform({})", children.len())
            }
            SpatialTransform::Opaque(mapping) => mapping.name().to_string(),
        }
    }

    /// Walks composites with an explicit stack, so nesting depth is not
    /// limited by the call stack.
    pub fn apply(&self, point: Vector3<f64>) -> Vector3<f64> {
        let mut point = point;
        let mut pending = vec![self];
        while let Some(transform) = pending.pop() {
            match transform {
                SpatialTransform::Affine(affine) => point = affine.apply(point),
                SpatialTransform::Composite(children) => pending.extend(children.iter().rev()),
                SpatialTransform::Opaque(mapping) => point = mapping.apply(point),
            }
        }
        point
    }

    /// Composites nested deeper than [`MAX_NESTING`] are not inverted.
    pub fn try_invert(&self) -> Result<SpatialTransform> {
        self.try_invert_at(0)
    }

    fn try_invert_at(&self, depth: usize) -> Result<SpatialTransform> {
        match self {
            SpatialTransform::Affine(affine) => affine.try_invert().map(SpatialTransform::Affine),
            SpatialTransform::Composite(_) if depth >= MAX_NESTING => Err(
                FusionError::NotInvertible(format!("composite nesting deeper than {MAX_NESTING}")),
            ),
            SpatialTransform::Composite(children) => children
                .iter()
                .rev()
                .map(|child| child.try_invert_at(depth + 1))
                .collect::<Result<Vec<_>>>()
                .map(SpatialTransform::Composite),
            SpatialTransform::Opaque(mapping) => mapping
                .try_invert()
                .map(SpatialTransform::Opaque)
                .ok_or_else(|| {
                    FusionError::NotInvertible(format!("{} has no inverse", mapping.name()))
                }),
        }
    }

    pub fn is_identity(&self) -> bool {
        let mut pending = vec![self];
        while let Some(transform) = pending.pop() {
            let leaf_is_identity = match transform {
                SpatialTransform::Affine(affine) => affine.is_identity(),
                SpatialTransform::Composite(children) => {
                    pending.extend(children);
                    true
                }
                SpatialTransform::Opaque(mapping) => mapping.is_identity(),
            };
            if !leaf_is_identity {
                return false;
            }
        }
        true
    }

    pub fn as_affine(&self) -> Option<&AffineTransform> {
        match self {
            SpatialTransform::Affine(affine) => Some(affine),
            _ => None,
        }
    }

    /// Non-identity leaves in application order.
    pub fn meaningful_leaves(&self) -> Vec<&SpatialTransform> {
        fn collect<'a>(
            transform: &'a SpatialTransform,
            depth: usize,
            out: &mut Vec<&'a SpatialTransform>,
        ) {
            match transform {
                SpatialTransform::Composite(children) if depth < MAX_NESTING => {
                    for child in children {
                        collect(child, depth + 1, out);
                    }
                }
                other if !other.is_identity() => out.push(other),
                _ => {}
            }
        }

        let mut leaves = Vec::new();
        collect(self, 0, &mut leaves);
        leaves
    }

    pub fn describe(&self) -> TransformSummary {
        self.describe_at(0)
    }

    fn describe_at(&self, depth: usize) -> TransformSummary {
        let mut summary = TransformSummary {
            kind: self.name(),
            matrix4x4: self.as_affine().map(AffineTransform::to_row_major),
            ..TransformSummary::default()
        };
        if let SpatialTransform::Composite(children) = self {
            summary.child_count = Some(children.len());
            if depth < SUMMARY_DEPTH {
                summary.children = children
                    .iter()
                    .take(SUMMARY_CHILDREN)
                    .map(|child| child.describe_at(depth + 1))
                    .collect();
                summary.truncated_children = children.len().saturating_sub(SUMMARY_CHILDREN);
            }
            summary.meaningful = self
                .meaningful_leaves()
                .into_iter()
                .take(SUMMARY_CHILDREN)
                .map(|leaf| leaf.describe_at(SUMMARY_DEPTH))
                .collect();
        }
        summary
    }

    /// Summary of this transform and, when it exists, its inverse.
    pub fn inspect(&self) -> TransformInspection {
        TransformInspection {
            transform: self.describe(),
            inverse: self.try_invert().ok().map(|inverse| inverse.describe()),
        }
    }
}

const SUMMARY_DEPTH: usize = 5;
const SUMMARY_CHILDREN: usize = 5;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformSummary {
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matrix4x4: Option<[f64; 16]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub child_count: Option<usize>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TransformSummary>,
    #[serde(skip_serializing_if = "is_zero")]
    pub truncated_children: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub meaningful: Vec<TransformSummary>,
}

fn is_zero(value: &usize) -> bool {
    *value == 0
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransformInspection {
    pub transform: TransformSummary,
    pub inverse: Option<TransformSummary>,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Matrix3;

    /// Test mapping that shifts points and knows its own inverse.
    #[derive(Debug)]
    pub(crate) struct Shift(pub Vector3<f64>);

    impl PointMapping for Shift {
        fn name(&self) -> &str {
            "Shift"
        }

        fn apply(&self, point: Vector3<f64>) -> Vector3<f64> {
            point + self.0
        }

        fn try_invert(&self) -> Option<Arc<dyn PointMapping>> {
            Some(Arc::new(Shift(-self.0)))
        }
    }

    /// Test mapping with no inverse.
    #[derive(Debug)]
    pub(crate) struct Squash;

    impl PointMapping for Squash {
        fn name(&self) -> &str {
            "Squash"
        }

        fn apply(&self, point: Vector3<f64>) -> Vector3<f64> {
            Vector3::new(point.x, point.y, 0.0)
        }
    }

    pub(crate) fn translation(x: f64, y: f64, z: f64) -> SpatialTransform {
        SpatialTransform::Affine(AffineTransform::translation(Vector3::new(x, y, z)))
    }

    #[test]
    fn composite_applies_children_in_order() {
        let scale = SpatialTransform::Affine(AffineTransform::new(
            Matrix3::from_diagonal_element(2.0),
            Vector3::zeros(),
        ));
        let composite = SpatialTransform::Composite(vec![translation(1.0, 0.0, 0.0), scale]);
        // (0 + 1) * 2
        assert_relative_eq!(composite.apply(Vector3::zeros()), Vector3::new(2.0, 0.0, 0.0));

        let inverse = composite.try_invert().unwrap();
        assert_relative_eq!(
            inverse.apply(Vector3::new(2.0, 0.0, 0.0)),
            Vector3::zeros(),
            epsilon = 1e-12
        );
    }

    #[test]
    fn opaque_without_inverse_is_not_invertible() {
        let composite = SpatialTransform::Composite(vec![
            translation(1.0, 2.0, 3.0),
            SpatialTransform::Opaque(Arc::new(Squash)),
        ]);
        assert!(matches!(
            composite.try_invert(),
            Err(FusionError::NotInvertible(_))
        ));

        let shift = SpatialTransform::Opaque(Arc::new(Shift(Vector3::new(0.0, 0.0, 4.0))));
        let back = shift.try_invert().unwrap();
        assert_relative_eq!(back.apply(Vector3::new(0.0, 0.0, 4.0)), Vector3::zeros());
    }

    fn nest(transform: SpatialTransform, layers: usize) -> SpatialTransform {
        (0..layers).fold(transform, |inner, _| SpatialTransform::Composite(vec![inner]))
    }

    #[test]
    fn inversion_is_bounded_by_nesting_depth() {
        let shallow = nest(translation(1.0, 0.0, 0.0), MAX_NESTING);
        let back = shallow.try_invert().unwrap();
        assert_relative_eq!(back.apply(Vector3::new(1.0, 0.0, 0.0)), Vector3::zeros());

        let deep = nest(translation(1.0, 0.0, 0.0), MAX_NESTING + 1);
        assert!(matches!(deep.try_invert(), Err(FusionError::NotInvertible(_))));
    }

    #[test]
    fn deep_trees_still_apply_and_test_identity() {
        let deep = nest(translation(0.0, 3.0, 0.0), 4 * MAX_NESTING);
        assert_relative_eq!(deep.apply(Vector3::zeros()), Vector3::new(0.0, 3.0, 0.0));
        assert!(!deep.is_identity());
        assert!(nest(SpatialTransform::identity(), 4 * MAX_NESTING).is_identity());
    }

    #[test]
    fn meaningful_leaves_skip_identities_at_any_depth() {
        let nested = SpatialTransform::Composite(vec![
            SpatialTransform::identity(),
            SpatialTransform::Composite(vec![
                SpatialTransform::Composite(vec![translation(0.0, 0.0, 5.0)]),
                SpatialTransform::identity(),
            ]),
        ]);
        let leaves = nested.meaningful_leaves();
        assert_eq!(leaves.len(), 1);
        assert_eq!(leaves[0].name(), "TranslationTransform");
        assert!(!nested.is_identity());
    }

    #[test]
    fn inspection_includes_inverse_matrix() {
        let inspection = translation(1.0, 2.0, 3.0).inspect();
        let forward = inspection.transform.matrix4x4.unwrap();
        let inverse = inspection.inverse.unwrap().matrix4x4.unwrap();
        assert_eq!(forward[3], 1.0);
        assert_eq!(inverse[3], -1.0);
        assert_eq!(inverse[11], -3.0);
    }

    #[test]
    fn summary_truncates_wide_composites() {
        let wide = SpatialTransform::Composite(
            (0..8).map(|i| translation(i as f64 + 1.0, 0.0, 0.0)).collect(),
        );
        let summary = wide.describe();
        assert_eq!(summary.child_count, Some(8));
        assert_eq!(summary.children.len(), 5);
        assert_eq!(summary.truncated_children, 3);
    }
}
