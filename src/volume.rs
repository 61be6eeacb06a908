use nalgebra::{Matrix3, Vector3};
use ndarray::{Array3, ArrayView2, s};

use crate::enums::Modality;
use crate::error::{FusionError, Result};
use crate::header::SeriesFields;

/// Physical placement of a voxel grid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VolumeGeometry {
    /// World position of voxel (0, 0, 0).
    pub origin: Vector3<f64>,
    /// Spacing along the row, column and slice axes.
    pub spacing: Vector3<f64>,
    /// Columns are the row direction, column direction and slice normal.
    pub direction: Matrix3<f64>,
}

impl VolumeGeometry {
    pub fn axis_aligned(origin: Vector3<f64>, spacing: Vector3<f64>) -> Self {
        Self {
            origin,
            spacing,
            direction: Matrix3::identity(),
        }
    }

    pub fn row_dir(&self) -> Vector3<f64> {
        self.direction.column(0).into_owned()
    }

    pub fn col_dir(&self) -> Vector3<f64> {
        self.direction.column(1).into_owned()
    }

    pub fn normal(&self) -> Vector3<f64> {
        self.direction.column(2).into_owned()
    }
}

/// Dense sample grid with its index-to-world mapping. Immutable once built.
#[derive(Debug, Clone)]
pub struct Volume {
    data: Array3<f32>,
    geometry: VolumeGeometry,
    index_to_world: Matrix3<f64>,
    world_to_index: Matrix3<f64>,
    spacing_uniform: bool,
    pub modality: Modality,
    pub fields: SeriesFields,
}

impl Volume {
    pub fn new(data: Array3<f32>, geometry: VolumeGeometry) -> Result<Self> {
        let index_to_world = geometry.direction * Matrix3::from_diagonal(&geometry.spacing);
        let world_to_index = index_to_world.try_inverse().ok_or_else(|| {
            FusionError::DegenerateOrientation(format!(
                "index-to-world mapping is singular (spacing {:?})",
                geometry.spacing.as_slice()
            ))
        })?;
        Ok(Self {
            data,
            geometry,
            index_to_world,
            world_to_index,
            spacing_uniform: true,
            modality: Modality::default(),
            fields: SeriesFields::default(),
        })
    }

    pub fn with_modality(mut self, modality: Modality) -> Self {
        self.modality = modality;
        self
    }

    pub fn with_fields(mut self, fields: SeriesFields) -> Self {
        self.fields = fields;
        self
    }

    pub(crate) fn with_spacing_uniform(mut self, uniform: bool) -> Self {
        self.spacing_uniform = uniform;
        self
    }

    /// Get the dimensions of the volume (depth, height, width)
    pub fn dim(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    /// Number of voxels along the row, column and slice axes (x, y, z).
    pub fn size(&self) -> (usize, usize, usize) {
        let (depth, height, width) = self.data.dim();
        (width, height, depth)
    }

    /// Get a reference to the underlying data
    pub fn data(&self) -> &Array3<f32> {
        &self.data
    }

    pub fn into_data(self) -> Array3<f32> {
        self.data
    }

    pub fn geometry(&self) -> &VolumeGeometry {
        &self.geometry
    }

    /// Whether every inter-slice gap matched the spacing used for the grid.
    /// When false the slice axis of the mapping is only approximate.
    pub fn spacing_uniform(&self) -> bool {
        self.spacing_uniform
    }

    /// `origin + i*row_dir*sx + j*col_dir*sy + k*normal*sz`
    pub fn index_to_world(&self, index: Vector3<f64>) -> Vector3<f64> {
        self.geometry.origin + self.index_to_world * index
    }

    /// Continuous (i, j, k) index of a world point.
    pub fn world_to_index(&self, point: Vector3<f64>) -> Vector3<f64> {
        self.world_to_index * (point - self.geometry.origin)
    }

    /// World positions of the eight corner voxels.
    pub fn corners(&self) -> [Vector3<f64>; 8] {
        let (nx, ny, nz) = self.size();
        let last = |n: usize| n.saturating_sub(1) as f64;
        let (x, y, z) = (last(nx), last(ny), last(nz));
        [
            (0.0, 0.0, 0.0),
            (x, 0.0, 0.0),
            (0.0, y, 0.0),
            (0.0, 0.0, z),
            (x, y, 0.0),
            (x, 0.0, z),
            (0.0, y, z),
            (x, y, z),
        ]
        .map(|(i, j, k)| self.index_to_world(Vector3::new(i, j, k)))
    }

    /// Axis-aligned world bounding box of the voxel centres.
    pub fn bounds(&self) -> (Vector3<f64>, Vector3<f64>) {
        let corners = self.corners();
        corners.iter().skip(1).fold(
            (corners[0], corners[0]),
            |(min, max), corner| (min.inf(corner), max.sup(corner)),
        )
    }

    pub fn plane(&self, index: usize) -> Option<ArrayView2<'_, f32>> {
        self.is_valid_index(index)
            .then(|| self.data.slice(s![index, .., ..]))
    }

    fn is_valid_index(&self, index: usize) -> bool {
        index < self.data.dim().0
    }

    /// A volume sharing this one's grid but holding `data`.
    pub fn with_grid_of(&self, data: Array3<f32>) -> Result<Self> {
        if data.dim() != self.data.dim() {
            return Err(FusionError::InconsistentGeometry(format!(
                "data {:?} does not match grid {:?}",
                data.dim(),
                self.data.dim()
            )));
        }
        Ok(Self {
            data,
            geometry: self.geometry,
            index_to_world: self.index_to_world,
            world_to_index: self.world_to_index,
            spacing_uniform: self.spacing_uniform,
            modality: self.modality.clone(),
            fields: self.fields.clone(),
        })
    }
}
