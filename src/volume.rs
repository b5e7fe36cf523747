use glam::{Mat3, Mat4, Vec3};
use image::ImageBuffer;
use image::Luma;
use ndarray::Array3;
use ndarray::ArrayView2;
use ndarray::s;
use rayon::prelude::*;

use crate::enums::Representation;
use crate::error::ReadbackError;

/// Voxel storage in `(depth, height, width)` order.
#[derive(Clone, Debug, PartialEq)]
pub enum VoxelData {
    Integer(Array3<i16>),
    Float(Array3<f32>),
}

impl VoxelData {
    pub fn representation(&self) -> Representation {
        match self {
            VoxelData::Integer(_) => Representation::Integer,
            VoxelData::Float(_) => Representation::Float,
        }
    }

    /// Get the dimensions of the volume (depth, height, width)
    pub fn dim(&self) -> (usize, usize, usize) {
        match self {
            VoxelData::Integer(data) => data.dim(),
            VoxelData::Float(data) => data.dim(),
        }
    }

    /// Zero-filled storage of the given representation.
    pub fn zeros(representation: Representation, shape: (usize, usize, usize)) -> Self {
        match representation {
            Representation::Integer => VoxelData::Integer(Array3::zeros(shape)),
            Representation::Float => VoxelData::Float(Array3::zeros(shape)),
        }
    }

    /// Copies into row-major order if the arrays are laid out differently.
    pub(crate) fn into_standard_layout(self) -> Self {
        match self {
            VoxelData::Integer(data) if !data.is_standard_layout() => {
                VoxelData::Integer(data.as_standard_layout().into_owned())
            }
            VoxelData::Float(data) if !data.is_standard_layout() => {
                VoxelData::Float(data.as_standard_layout().into_owned())
            }
            other => other,
        }
    }

    /// All voxels as bytes, slice after slice.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            VoxelData::Integer(data) => data.as_slice().map(bytemuck::cast_slice),
            VoxelData::Float(data) => data.as_slice().map(bytemuck::cast_slice),
        }
    }

    /// One depth slice as bytes, for writing a rendered slice in place.
    pub fn slice_bytes_mut(&mut self, index: usize) -> Result<&mut [u8], ReadbackError> {
        let (depth, height, width) = self.dim();
        if index >= depth {
            return Err(ReadbackError::SliceOutOfRange { index, depth });
        }
        let range = index * height * width..(index + 1) * height * width;
        let bytes: Option<&mut [u8]> = match self {
            VoxelData::Integer(data) => data
                .as_slice_mut()
                .map(|values| bytemuck::cast_slice_mut(&mut values[range])),
            VoxelData::Float(data) => data
                .as_slice_mut()
                .map(|values| bytemuck::cast_slice_mut(&mut values[range])),
        };
        bytes.ok_or(ReadbackError::NonContiguous)
    }
}

/// Placement of the voxel grid in patient space.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VolumeGeometry {
    /// Voxel size in millimetres along (x, y, z).
    pub spacing: Vec3,
    /// Patient position of the first voxel's center.
    pub origin: Vec3,
    /// Row, column and slice direction cosines as matrix columns.
    pub direction: Mat3,
}

impl Default for VolumeGeometry {
    fn default() -> Self {
        Self {
            spacing: Vec3::ONE,
            origin: Vec3::ZERO,
            direction: Mat3::IDENTITY,
        }
    }
}

impl VolumeGeometry {
    /// Maps voxel indices (x, y, z) to patient millimetres.
    pub fn pixel_to_patient(&self) -> Mat4 {
        let columns = Mat3::from_cols(
            self.direction.x_axis * self.spacing.x,
            self.direction.y_axis * self.spacing.y,
            self.direction.z_axis * self.spacing.z,
        );
        Mat4::from_cols(
            columns.x_axis.extend(0.0),
            columns.y_axis.extend(0.0),
            columns.z_axis.extend(0.0),
            self.origin.extend(1.0),
        )
    }

    pub fn patient_to_pixel(&self) -> Mat4 {
        self.pixel_to_patient().inverse()
    }

    /// Rotation part used to carry voxel-space gradients into patient space.
    pub fn normal_pixel_to_patient(&self) -> Mat3 {
        Mat3::from_mat4(self.pixel_to_patient()).inverse().transpose()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Volume {
    pub data: VoxelData,
    pub geometry: VolumeGeometry,
}

impl Volume {
    pub fn new(data: VoxelData, geometry: VolumeGeometry) -> Self {
        Self {
            data: data.into_standard_layout(),
            geometry,
        }
    }

    /// Get the dimensions of the volume (depth, height, width)
    pub fn dim(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    #[inline]
    fn window_to_u8(value: f32, center: f32, width: f32) -> u8 {
        let low = center - width / 2.0;
        ((value - low) / width.max(f32::EPSILON) * 255.0).clamp(0.0, 255.0) as u8
    }

    fn slice_to_image<T>(
        slice: ArrayView2<'_, T>,
        map: impl Fn(&T) -> u8 + Send + Sync,
    ) -> Option<ImageBuffer<Luma<u8>, Vec<u8>>>
    where
        T: Sync,
    {
        let (height, width) = slice.dim();
        let pixel_data: Vec<u8> = slice.into_par_iter().map(map).collect();
        ImageBuffer::from_raw(width as u32, height as u32, pixel_data)
    }

    /// One axial slice windowed to 8-bit grayscale. `None` for an index past
    /// the last slice.
    pub fn slice_image(
        &self,
        index: usize,
        window_center: f32,
        window_width: f32,
    ) -> Option<ImageBuffer<Luma<u8>, Vec<u8>>> {
        if index >= self.dim().0 {
            return None;
        }
        match &self.data {
            VoxelData::Integer(data) => Self::slice_to_image(data.slice(s![index, .., ..]), |&v| {
                Self::window_to_u8(f32::from(v), window_center, window_width)
            }),
            VoxelData::Float(data) => Self::slice_to_image(data.slice(s![index, .., ..]), |&v| {
                Self::window_to_u8(v, window_center, window_width)
            }),
        }
    }
}
