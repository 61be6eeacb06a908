//! Collapse identity-padded composite trees.
//!
//! Authoring tools routinely wrap one meaningful affine in several layers of
//! identity composites. Inverting or probing such trees as-is is unreliable,
//! so they are reduced to the smallest equivalent transform first.

use super::{MAX_NESTING, SpatialTransform};

#[derive(Debug, Clone)]
pub struct Flattened {
    pub transform: SpatialTransform,
    /// Non-identity leaves found while descending.
    pub leaves: usize,
}

/// Flatten `transform`:
///
/// * identity children are dropped at every level (down to [`MAX_NESTING`]),
/// * no remaining leaves yields the identity,
/// * one remaining leaf is returned directly,
/// * otherwise the affine leaf applied last is preferred, falling back to a
///   single composite of the leaves.
///
/// A registration's transform queue is applied back to front, so the leaf
/// applied last is the front of that queue, the first record of an ITK file.
///
/// Non-composite transforms are returned unchanged.
pub fn flatten(transform: &SpatialTransform) -> Flattened {
    let SpatialTransform::Composite(children) = transform else {
        return Flattened {
            transform: transform.clone(),
            leaves: usize::from(!transform.is_identity()),
        };
    };

    let mut leaves = Vec::new();
    collect_leaves(children, 1, &mut leaves);
    let count = leaves.len();

    let transform = match count {
        0 => SpatialTransform::identity(),
        1 => leaves.remove(0),
        _ => leaves
            .iter()
            .rev()
            .find(|leaf| matches!(leaf, SpatialTransform::Affine(_)))
            .cloned()
            .unwrap_or(SpatialTransform::Composite(leaves)),
    };

    Flattened {
        transform,
        leaves: count,
    }
}

fn collect_leaves(children: &[SpatialTransform], depth: usize, out: &mut Vec<SpatialTransform>) {
    for child in children {
        if child.is_identity() {
            continue;
        }
        match child {
            SpatialTransform::Composite(grandchildren) if depth < MAX_NESTING => {
                collect_leaves(grandchildren, depth + 1, out)
            }
            // Beyond the nesting bound the subtree is kept as one opaque step.
            other => out.push(other.clone()),
        }
    }
}
