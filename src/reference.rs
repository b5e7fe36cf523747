//! CPU versions of the neighborhood kernels.
//!
//! Neighbors are addressed the way the generated shaders address them:
//! one voxel per step and clamped to the volume edge.

use ndarray::{Array3, ArrayView3, Zip};

use crate::kernel::Kernel;
use crate::volume::VoxelData;

pub struct CpuReference;

impl CpuReference {
    /// Runs a `Filter` or `Bilateral` kernel over `data`. Other kernels
    /// return `None`.
    pub fn apply(kernel: &Kernel, data: &VoxelData) -> Option<Array3<f32>> {
        let values = match data {
            VoxelData::Integer(values) => values.mapv(f32::from),
            VoxelData::Float(values) => values.clone(),
        };
        match *kernel {
            Kernel::Filter { radius, sigma } => Some(Self::gaussian(values.view(), radius, sigma)),
            Kernel::Bilateral {
                radius,
                sigma_spatial,
                sigma_range,
            } => Some(Self::bilateral(
                values.view(),
                radius,
                sigma_spatial,
                sigma_range,
            )),
            Kernel::Synthetic { .. } | Kernel::Transform => None,
        }
    }

    pub fn gaussian(values: ArrayView3<'_, f32>, radius: u32, sigma: f32) -> Array3<f32> {
        Self::convolve(values, radius, |offset, _, _| {
            (-offset / (2.0 * sigma * sigma)).exp()
        })
    }

    pub fn bilateral(
        values: ArrayView3<'_, f32>,
        radius: u32,
        sigma_spatial: f32,
        sigma_range: f32,
    ) -> Array3<f32> {
        Self::convolve(values, radius, |offset, neighbor, center| {
            Self::normal_density(offset.sqrt(), sigma_spatial)
                * Self::normal_density(neighbor - center, sigma_range)
        })
    }

    #[inline]
    fn normal_density(x: f32, sigma: f32) -> f32 {
        (-(x * x) / (2.0 * sigma * sigma)).exp() / ((2.0 * std::f32::consts::PI).sqrt() * sigma)
    }

    #[inline]
    fn clamped(index: usize, step: i64, len: usize) -> usize {
        (index as i64 + step).clamp(0, len as i64 - 1) as usize
    }

    /// Normalized weighted sum over the `(2r+1)^3` neighborhood. `weight`
    /// receives the squared offset length, the neighbor and the center value.
    fn convolve(
        values: ArrayView3<'_, f32>,
        radius: u32,
        weight: impl Fn(f32, f32, f32) -> f32 + Sync,
    ) -> Array3<f32> {
        let (depth, height, width) = values.dim();
        let radius = i64::from(radius);
        let mut result = Array3::zeros(values.dim());
        Zip::indexed(&mut result).par_for_each(|(z, y, x), out| {
            let center = values[[z, y, x]];
            let mut total = 0.0;
            let mut weights = 0.0;
            for k in -radius..=radius {
                for j in -radius..=radius {
                    for i in -radius..=radius {
                        let neighbor = values[[
                            Self::clamped(z, k, depth),
                            Self::clamped(y, j, height),
                            Self::clamped(x, i, width),
                        ]];
                        let w = weight((i * i + j * j + k * k) as f32, neighbor, center);
                        total += w * neighbor;
                        weights += w;
                    }
                }
            }
            *out = if weights > 0.0 { total / weights } else { center };
        });
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_volumes_are_fixed_points() {
        let values = Array3::from_elem((3, 4, 5), 7.0f32);
        let filtered = CpuReference::gaussian(values.view(), 1, 1.0);
        assert!(filtered.iter().all(|v| (v - 7.0).abs() < 1e-5));
        let smoothed = CpuReference::bilateral(values.view(), 2, 1.5, 10.0);
        assert!(smoothed.iter().all(|v| (v - 7.0).abs() < 1e-5));
    }

    #[test]
    fn gaussian_spreads_an_impulse_symmetrically() {
        let mut values = Array3::zeros((3, 3, 3));
        values[[1, 1, 1]] = 27.0f32;
        let filtered = CpuReference::gaussian(values.view(), 1, 1.0);
        assert!(filtered[[1, 1, 1]] > filtered[[1, 1, 0]]);
        assert!((filtered[[1, 1, 0]] - filtered[[1, 1, 2]]).abs() < 1e-5);
        assert!((filtered[[0, 1, 1]] - filtered[[1, 0, 1]]).abs() < 1e-5);
    }

    #[test]
    fn bilateral_keeps_edges_sharper_than_gaussian() {
        let mut values = Array3::zeros((1, 1, 8));
        for x in 4..8 {
            values[[0, 0, x]] = 1000.0f32;
        }
        let blurred = CpuReference::gaussian(values.view(), 2, 2.0);
        let preserved = CpuReference::bilateral(values.view(), 2, 2.0, 50.0);
        assert!(preserved[[0, 0, 3]] < blurred[[0, 0, 3]]);
        assert!(preserved[[0, 0, 3]] < 1.0);
    }

    #[test]
    fn only_neighborhood_kernels_have_a_reference() {
        let data = VoxelData::Integer(Array3::from_elem((1, 2, 2), 3));
        assert!(CpuReference::apply(&Kernel::synthetic(1.0, 1.0), &data).is_none());
        let filtered = CpuReference::apply(&Kernel::filter(1, 1.0), &data).unwrap();
        assert_eq!(filtered.dim(), (1, 2, 2));
        assert!(filtered.iter().all(|v| (v - 3.0).abs() < 1e-4));
    }
}
