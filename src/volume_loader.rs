use crate::{
    enums::SortBy,
    volume::{Volume, VolumeGeometry, VoxelData},
};

use dicom::{
    object::{FileDicomObject, InMemDicomObject, open_file},
    pixeldata::{ConvertOptions, PixelDecoder, VoiLutOption},
};
use dicom_dictionary_std::tags;
use glam::{Mat3, Vec3};
use ndarray::{Array2, Array3, s};
use rayon::prelude::*;
use std::{fs, path::Path};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum VolumeLoaderError {
    #[error("No valid DICOM images found")]
    NoValidImages,

    #[error("Inconsistent image dimensions")]
    InconsistentDimensions,

    #[error("Missing spacing information")]
    MissingSpacing,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("DICOM error: {0}")]
    Dicom(#[from] dicom::object::ReadError),
}

/// One decoded slice with the attributes used to order and place it.
struct Slice {
    order: Option<f32>,
    position: Option<Vec3>,
    image: Array2<i16>,
}

pub struct VolumeLoader;

impl VolumeLoader {
    /// Load a source-authored integer volume from DICOM objects
    ///
    /// Slices are decoded in parallel with the modality rescale applied and no
    /// VOI window, so the voxels keep their stored units.
    ///
    /// # Errors
    ///
    /// Returns error if no valid images found, dimensions are inconsistent or
    /// no spacing can be determined
    pub fn load_from_dicom_objects(
        dicom_objects: &[FileDicomObject<InMemDicomObject>],
        sort_by: SortBy,
    ) -> Result<Volume, VolumeLoaderError> {
        let mut slices: Vec<_> = dicom_objects
            .par_iter()
            .filter_map(|dicom_object| Self::extract_slice(dicom_object, sort_by))
            .collect();

        if slices.is_empty() {
            return Err(VolumeLoaderError::NoValidImages);
        }
        if slices.len() < dicom_objects.len() {
            warn!(
                skipped = dicom_objects.len() - slices.len(),
                "some DICOM objects carried no decodable image"
            );
        }

        Self::sort_slices(&mut slices, sort_by);
        Self::validate_dimensions(&slices)?;

        let geometry = Self::get_geometry(dicom_objects, &slices)?;
        let volume_array = Self::build_volume_array(&slices);
        debug!(
            dimensions = ?volume_array.dim(),
            spacing = ?geometry.spacing,
            origin = ?geometry.origin,
            "DICOM series loaded"
        );

        Ok(Volume::new(VoxelData::Integer(volume_array), geometry))
    }

    /// Load a volume from file paths
    pub fn load_from_file_paths(
        paths: &[impl AsRef<Path> + Sync],
        sort_by: SortBy,
    ) -> Result<Volume, VolumeLoaderError> {
        let objects: Result<Vec<_>, _> = paths
            .par_iter()
            .map(|path| open_file(path.as_ref()))
            .collect();

        Self::load_from_dicom_objects(&objects?, sort_by)
    }

    /// Load a volume from a directory containing .dcm files
    pub fn load_from_directory(
        path: impl AsRef<Path>,
        sort_by: SortBy,
    ) -> Result<Volume, VolumeLoaderError> {
        let paths: Vec<_> = fs::read_dir(path.as_ref())?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| {
                path.extension()
                    .and_then(|s| s.to_str())
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("dcm"))
            })
            .collect();

        if paths.is_empty() {
            return Err(VolumeLoaderError::NoValidImages);
        }

        Self::load_from_file_paths(&paths, sort_by)
    }

    fn extract_slice(
        dicom_object: &FileDicomObject<InMemDicomObject>,
        sort_by: SortBy,
    ) -> Option<Slice> {
        let order = Self::get_sort_order(dicom_object, sort_by)?;
        let image = Self::decode_image(dicom_object)?;
        Some(Slice {
            order,
            position: Self::get_position(dicom_object),
            image,
        })
    }

    fn get_sort_order(
        dicom_object: &FileDicomObject<InMemDicomObject>,
        sort_by: SortBy,
    ) -> Option<Option<f32>> {
        match sort_by {
            SortBy::ImagePositionPatient => {
                let pos = dicom_object
                    .element(tags::IMAGE_POSITION_PATIENT)
                    .ok()?
                    .to_multi_float32()
                    .ok()?;
                Some(pos.get(2).copied())
            }
            SortBy::TablePosition => {
                let pos = dicom_object
                    .element(tags::TABLE_POSITION)
                    .ok()?
                    .to_float32()
                    .ok();
                Some(pos)
            }
            SortBy::InstanceNumber => {
                let num = dicom_object
                    .element(tags::INSTANCE_NUMBER)
                    .ok()?
                    .to_int::<i32>()
                    .ok()
                    .map(|n| n as f32);
                Some(num)
            }
            SortBy::None => Some(Some(0.0)),
        }
    }

    fn get_position(dicom_object: &FileDicomObject<InMemDicomObject>) -> Option<Vec3> {
        let pos = dicom_object
            .element(tags::IMAGE_POSITION_PATIENT)
            .ok()?
            .to_multi_float32()
            .ok()?;
        (pos.len() >= 3).then(|| Vec3::new(pos[0], pos[1], pos[2]))
    }

    fn decode_image(dicom_object: &FileDicomObject<InMemDicomObject>) -> Option<Array2<i16>> {
        let pixel_data = dicom_object.decode_pixel_data().ok()?;
        let options = ConvertOptions::new().with_voi_lut(VoiLutOption::Identity);
        pixel_data
            .to_ndarray_with_options::<i16>(&options)
            .ok()
            .map(|arr| arr.slice_move(s![0, .., .., 0]))
    }

    fn sort_slices(slices: &mut [Slice], sort_by: SortBy) {
        if !matches!(sort_by, SortBy::None) {
            slices.sort_by(|a, b| {
                a.order
                    .partial_cmp(&b.order)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        }

        if matches!(sort_by, SortBy::ImagePositionPatient) {
            slices.reverse();
        }
    }

    fn validate_dimensions(slices: &[Slice]) -> Result<(), VolumeLoaderError> {
        let first_dim = slices[0].image.dim();
        if slices.iter().any(|slice| slice.image.dim() != first_dim) {
            return Err(VolumeLoaderError::InconsistentDimensions);
        }
        Ok(())
    }

    fn build_volume_array(slices: &[Slice]) -> Array3<i16> {
        let (height, width) = slices[0].image.dim();
        let depth = slices.len();
        let mut volume = Array3::<i16>::zeros((depth, height, width));

        for (i, slice) in slices.iter().enumerate() {
            volume.slice_mut(s![i, .., ..]).assign(&slice.image);
        }

        volume
    }

    /// Row and column direction cosines, identity axes when absent.
    fn get_orientation(dicom_objects: &[FileDicomObject<InMemDicomObject>]) -> (Vec3, Vec3) {
        dicom_objects
            .iter()
            .find_map(|dicom_object| {
                let cosines = dicom_object
                    .element(tags::IMAGE_ORIENTATION_PATIENT)
                    .ok()?
                    .to_multi_float32()
                    .ok()?;
                (cosines.len() >= 6).then(|| {
                    (
                        Vec3::new(cosines[0], cosines[1], cosines[2]).normalize_or(Vec3::X),
                        Vec3::new(cosines[3], cosines[4], cosines[5]).normalize_or(Vec3::Y),
                    )
                })
            })
            .unwrap_or((Vec3::X, Vec3::Y))
    }

    /// Spacing, origin and direction of the sorted series. The slice step
    /// comes from consecutive positions and falls back to the slice
    /// thickness for single slices or missing positions.
    fn get_geometry(
        dicom_objects: &[FileDicomObject<InMemDicomObject>],
        slices: &[Slice],
    ) -> Result<VolumeGeometry, VolumeLoaderError> {
        let (row, column) = Self::get_orientation(dicom_objects);
        let mut normal = row.cross(column).normalize_or(Vec3::Z);

        let pixel_spacing = dicom_objects
            .iter()
            .find_map(|dicom_object| {
                let spacing = dicom_object
                    .element(tags::PIXEL_SPACING)
                    .ok()?
                    .to_multi_float32()
                    .ok()?;
                (spacing.len() >= 2).then(|| (spacing[0], spacing[1]))
            })
            .ok_or(VolumeLoaderError::MissingSpacing)?;

        let step = match (
            slices.first().and_then(|slice| slice.position),
            slices.get(1).and_then(|slice| slice.position),
        ) {
            (Some(first), Some(second)) if (second - first).dot(normal).abs() > f32::EPSILON => {
                let step = (second - first).dot(normal);
                if step < 0.0 {
                    normal = -normal;
                }
                Some(step.abs())
            }
            _ => dicom_objects.iter().find_map(|dicom_object| {
                dicom_object
                    .element(tags::SLICE_THICKNESS)
                    .ok()?
                    .to_float32()
                    .ok()
            }),
        };
        let step = step.ok_or(VolumeLoaderError::MissingSpacing)?;

        Ok(VolumeGeometry {
            // pixel spacing lists the row step (y) before the column step (x)
            spacing: Vec3::new(pixel_spacing.1, pixel_spacing.0, step),
            origin: slices
                .first()
                .and_then(|slice| slice.position)
                .unwrap_or(Vec3::ZERO),
            direction: Mat3::from_cols(row, column, normal),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slice(order: f32, value: i16) -> Slice {
        Slice {
            order: Some(order),
            position: Some(Vec3::new(0.0, 0.0, order)),
            image: Array2::from_elem((2, 3), value),
        }
    }

    #[test]
    fn positions_sort_from_head_to_feet() {
        let mut slices = vec![slice(1.0, 1), slice(3.0, 3), slice(2.0, 2)];
        VolumeLoader::sort_slices(&mut slices, SortBy::ImagePositionPatient);
        let orders: Vec<_> = slices.iter().map(|slice| slice.order).collect();
        assert_eq!(orders, vec![Some(3.0), Some(2.0), Some(1.0)]);
    }

    #[test]
    fn unsorted_series_keep_their_order() {
        let mut slices = vec![slice(2.0, 2), slice(1.0, 1)];
        VolumeLoader::sort_slices(&mut slices, SortBy::None);
        assert_eq!(slices[0].order, Some(2.0));
    }

    #[test]
    fn stacks_slices_along_depth() {
        let slices = vec![slice(0.0, 5), slice(1.0, -7)];
        let volume = VolumeLoader::build_volume_array(&slices);
        assert_eq!(volume.dim(), (2, 2, 3));
        assert_eq!(volume[[0, 1, 2]], 5);
        assert_eq!(volume[[1, 0, 0]], -7);
    }

    #[test]
    fn rejects_mixed_slice_sizes() {
        let mut slices = vec![slice(0.0, 0)];
        slices.push(Slice {
            order: None,
            position: None,
            image: Array2::zeros((4, 4)),
        });
        assert!(matches!(
            VolumeLoader::validate_dimensions(&slices),
            Err(VolumeLoaderError::InconsistentDimensions)
        ));
    }

    #[test]
    fn empty_object_list_has_no_images() {
        assert!(matches!(
            VolumeLoader::load_from_dicom_objects(&[], SortBy::InstanceNumber),
            Err(VolumeLoaderError::NoValidImages)
        ));
    }
}
