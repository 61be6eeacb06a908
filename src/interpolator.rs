use nalgebra::Vector3;
use ndarray::ArrayView3;

use crate::enums::Interpolation;

pub(crate) struct Interpolator;

impl Interpolator {
    /// A continuous (i, j, k) index lies inside the sampled support when it
    /// is within half a voxel of the outermost voxel centres.
    #[inline]
    pub(crate) fn is_inside(volume: &ArrayView3<f32>, index: &Vector3<f64>) -> bool {
        let (depth, height, width) = volume.dim();
        [width, height, depth]
            .iter()
            .enumerate()
            .all(|(axis, &n)| index[axis] >= -0.5 && index[axis] < n as f64 - 0.5)
    }

    #[inline]
    pub(crate) fn sample(
        volume: &ArrayView3<f32>,
        index: &Vector3<f64>,
        interpolation: Interpolation,
    ) -> f32 {
        match interpolation {
            Interpolation::Nearest => Self::nearest(volume, index),
            Interpolation::Linear => Self::trilinear_interpolate(volume, index),
        }
    }

    #[inline]
    pub(crate) fn nearest(volume: &ArrayView3<f32>, index: &Vector3<f64>) -> f32 {
        let (depth, height, width) = volume.dim();
        let round = |c: f64, n: usize| ((c + 0.5).floor().max(0.0) as usize).min(n - 1);
        volume[[
            round(index.z, depth),
            round(index.y, height),
            round(index.x, width),
        ]]
    }

    #[inline]
    pub(crate) fn trilinear_interpolate(volume: &ArrayView3<f32>, index: &Vector3<f64>) -> f32 {
        let (depth, height, width) = volume.dim();

        // Lower neighbour, upper neighbour and fractional offset along one axis.
        let axis = |c: f64, n: usize| {
            let c0 = (c.floor().max(0.0) as usize).min(n - 1);
            let c1 = (c0 + 1).min(n - 1);
            let d = (c - c0 as f64).clamp(0.0, 1.0) as f32;
            (c0, c1, d)
        };
        let (x0, x1, dx) = axis(index.x, width);
        let (y0, y1, dy) = axis(index.y, height);
        let (z0, z1, dz) = axis(index.z, depth);
        let one_minus_dx = 1.0 - dx;
        let one_minus_dy = 1.0 - dy;

        let bilinear = |z: usize| {
            let v00 = volume[[z, y0, x0]];
            let v01 = volume[[z, y0, x1]];
            let v10 = volume[[z, y1, x0]];
            let v11 = volume[[z, y1, x1]];

            let v0 = v00.mul_add(one_minus_dx, v01 * dx);
            let v1 = v10.mul_add(one_minus_dx, v11 * dx);

            v0.mul_add(one_minus_dy, v1 * dy)
        };

        bilinear(z0).mul_add(1.0 - dz, bilinear(z1) * dz)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::Array3;

    /// Value = i + 10 j + 100 k, which trilinear interpolation reproduces exactly.
    fn ramp() -> Array3<f32> {
        Array3::from_shape_fn((3, 4, 5), |(k, j, i)| (i + 10 * j + 100 * k) as f32)
    }

    #[test]
    fn trilinear_reproduces_linear_ramp() {
        let data = ramp();
        let view = data.view();
        let value = Interpolator::trilinear_interpolate(&view, &Vector3::new(1.5, 2.25, 0.5));
        assert_relative_eq!(value, 1.5 + 22.5 + 50.0, epsilon = 1e-4);
    }

    #[test]
    fn trilinear_at_voxel_centres_returns_samples() {
        let data = ramp();
        let view = data.view();
        assert_eq!(
            Interpolator::trilinear_interpolate(&view, &Vector3::new(4.0, 3.0, 2.0)),
            234.0
        );
    }

    #[test]
    fn nearest_rounds_to_closest_voxel() {
        let data = ramp();
        let view = data.view();
        assert_eq!(Interpolator::nearest(&view, &Vector3::new(1.49, 2.51, 0.2)), 31.0);
        assert_eq!(Interpolator::nearest(&view, &Vector3::new(-0.4, 0.0, 0.0)), 0.0);
    }

    #[test]
    fn support_extends_half_a_voxel() {
        let data = ramp();
        let view = data.view();
        assert!(Interpolator::is_inside(&view, &Vector3::new(-0.5, 0.0, 0.0)));
        assert!(Interpolator::is_inside(&view, &Vector3::new(4.49, 3.49, 2.49)));
        assert!(!Interpolator::is_inside(&view, &Vector3::new(4.5, 0.0, 0.0)));
        assert!(!Interpolator::is_inside(&view, &Vector3::new(0.0, -0.51, 0.0)));
    }
}
