//! Pull moving-volume values onto the fixed grid.

use nalgebra::Vector3;
use ndarray::{Array3, Zip};
use tracing::info;

use crate::enums::Interpolation;
use crate::error::Result;
use crate::interpolator::Interpolator;
use crate::transform::SpatialTransform;
use crate::volume::Volume;

/// Everything one resampling pass needs. The transform maps output (fixed
/// grid) points to input (moving volume) points.
#[derive(Debug, Clone, Copy)]
pub struct ResampleRequest<'a> {
    pub fixed: &'a Volume,
    pub moving: &'a Volume,
    pub transform: &'a SpatialTransform,
    pub interpolation: Interpolation,
    pub fill_value: f32,
}

impl<'a> ResampleRequest<'a> {
    /// Request with the moving modality's outside value (air for CT, 0 otherwise).
    pub fn new(
        fixed: &'a Volume,
        moving: &'a Volume,
        transform: &'a SpatialTransform,
        interpolation: Interpolation,
    ) -> Self {
        Self {
            fixed,
            moving,
            transform,
            interpolation,
            fill_value: moving.modality.outside_fill_value(),
        }
    }

    pub fn with_fill_value(mut self, fill_value: f32) -> Self {
        self.fill_value = fill_value;
        self
    }
}

pub struct Resampler;

impl Resampler {
    /// Resample into a float volume on the fixed grid. The result carries the
    /// moving volume's modality and series fields.
    pub fn resample(request: &ResampleRequest<'_>) -> Result<Volume> {
        let ResampleRequest {
            fixed,
            moving,
            transform,
            interpolation,
            fill_value,
        } = *request;

        info!(
            transform = %transform.name(),
            fixed = ?fixed.size(),
            moving = ?moving.size(),
            ?interpolation,
            fill_value,
            "resampling"
        );

        let source = moving.data().view();
        let mut output = Array3::<f32>::zeros(fixed.dim());
        Zip::indexed(&mut output).par_for_each(|(k, j, i), value| {
            let world = fixed.index_to_world(Vector3::new(i as f64, j as f64, k as f64));
            let index = moving.world_to_index(transform.apply(world));
            *value = if Interpolator::is_inside(&source, &index) {
                Interpolator::sample(&source, &index, interpolation)
            } else {
                fill_value
            };
        });

        Ok(fixed
            .with_grid_of(output)?
            .with_modality(moving.modality.clone())
            .with_fields(moving.fields.clone()))
    }
}
