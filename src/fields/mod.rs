//! GPU-backed 3D arrays that generators read from and render into.

mod image;
mod transform;

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU32, Ordering};

pub use image::ImageField;
pub use transform::TransformField;

use crate::context::{GpuContext, TextureHandle};
use crate::enums::Representation;
use crate::error::GpuError;
use crate::generator::GeneratorId;
use crate::shader::{SamplingDescriptor, ShaderFunction};
use crate::uniforms::{UniformDecl, UniformType, Uniforms};
use crate::volume::{VolumeGeometry, VoxelData};

static NEXT_FIELD_ID: AtomicU32 = AtomicU32::new(1);

/// Stable identity of a field. Generated shader symbols carry it as a suffix.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldId(u32);

impl FieldId {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// A process-unique id.
    pub fn next() -> Self {
        Self(NEXT_FIELD_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u32 {
        self.0
    }

    /// `name` suffixed with this id, as it appears in shader source.
    pub fn namespaced(self, name: &str) -> String {
        format!("{name}_{}", self.0)
    }
}

impl fmt::Display for FieldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Fields are shared between the application and every generator that binds them.
pub type FieldRef = Rc<RefCell<dyn Field>>;

pub trait Field {
    fn id(&self) -> FieldId;

    /// `[width, height, depth]` in voxels.
    fn dimensions(&self) -> [u32; 3];

    fn representation(&self) -> Representation;

    /// Format of the texture allocated by [`Field::upload_to_texture`].
    fn texture_format(&self) -> wgpu::TextureFormat;

    fn texture(&self) -> Option<TextureHandle>;

    /// Whether the texture is missing or older than the field's contents.
    fn needs_update(&self) -> bool;

    /// Brings the texture up to date. Returns `true` when anything was
    /// allocated or written.
    fn upload_to_texture(&mut self, ctx: &mut dyn GpuContext) -> Result<bool, GpuError>;

    fn sampling_descriptor(&self) -> SamplingDescriptor;

    /// Values for the uniforms declared by the sampling descriptor, keyed by
    /// their namespaced names.
    fn uniforms(&self) -> Uniforms;

    /// The generator that writes this field, if any.
    fn generator(&self) -> Option<GeneratorId>;

    fn set_generator(&mut self, generator: Option<GeneratorId>);

    /// Host storage that receives rendered slices. `None` for fields that
    /// live only on the GPU.
    fn generated_data_mut(&mut self) -> Option<&mut VoxelData> {
        None
    }

    /// Frees the texture.
    fn release(&mut self, ctx: &mut dyn GpuContext);
}

/// Uniforms every field declares to place its grid in patient space.
fn geometry_declarations() -> Vec<UniformDecl> {
    vec![
        UniformDecl::new("visible", UniformType::Int),
        UniformDecl::new("patient_to_pixel", UniformType::Mat4),
        UniformDecl::new("pixel_to_patient", UniformType::Mat4),
        UniformDecl::new("normal_pixel_to_patient", UniformType::Mat3),
        UniformDecl::new("pixel_dimensions", UniformType::Vec3I),
    ]
}

fn geometry_uniforms(
    id: FieldId,
    visible: bool,
    geometry: &VolumeGeometry,
    dimensions: [u32; 3],
) -> Uniforms {
    let [width, height, depth] = dimensions;
    let mut uniforms = Uniforms::new();
    uniforms.insert(id.namespaced("visible"), i32::from(visible).into());
    uniforms.insert(id.namespaced("patient_to_pixel"), geometry.patient_to_pixel().into());
    uniforms.insert(id.namespaced("pixel_to_patient"), geometry.pixel_to_patient().into());
    uniforms.insert(
        id.namespaced("normal_pixel_to_patient"),
        geometry.normal_pixel_to_patient().into(),
    );
    uniforms.insert(
        id.namespaced("pixel_dimensions"),
        glam::IVec3::new(width as i32, height as i32, depth as i32).into(),
    );
    uniforms
}

/// Conversions between patient millimetres and texture coordinates. Voxel
/// centers sit at `(index + 0.5) / dimensions`.
fn geometry_functions() -> Vec<ShaderFunction> {
    vec![
        ShaderFunction::new(
            "patient_to_texture",
            "point: vec3<f32>",
            "vec3<f32>",
            "    let pixel = (${patient_to_pixel} * vec4<f32>(point, 1.0)).xyz;
    return (pixel + vec3<f32>(0.5)) / vec3<f32>(${pixel_dimensions});
",
        ),
        ShaderFunction::new(
            "texture_to_patient",
            "stp: vec3<f32>",
            "vec3<f32>",
            "    let pixel = stp * vec3<f32>(${pixel_dimensions}) - vec3<f32>(0.5);
    return (${pixel_to_patient} * vec4<f32>(pixel, 1.0)).xyz;
",
        ),
    ]
}

/// Shader condition that is true when `stp` lies outside the texture or the
/// field is hidden.
const TRIVIAL_REJECT: &str = "${visible} == 0 || any(stp < vec3<f32>(0.0)) || any(stp > vec3<f32>(1.0))";

/// Picks the texture format for a representation, honoring an override.
pub(crate) fn checked_format(
    representation: Representation,
    format: wgpu::TextureFormat,
) -> Result<wgpu::TextureFormat, crate::error::FieldError> {
    use wgpu::TextureFormat as T;
    let supported = match representation {
        Representation::Integer => matches!(format, T::R16Sint | T::R32Sint | T::Rgba32Sint),
        Representation::Float => matches!(format, T::R16Float | T::R32Float | T::Rgba32Float),
    };
    if supported {
        Ok(format)
    } else {
        Err(crate::error::FieldError::UnsupportedTextureFormat(format))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespaces_symbols_with_the_id() {
        assert_eq!(FieldId::new(12).namespaced("pixel_to_patient"), "pixel_to_patient_12");
    }

    #[test]
    fn generated_ids_are_distinct() {
        assert_ne!(FieldId::next(), FieldId::next());
    }

    #[test]
    fn formats_follow_representation() {
        assert!(checked_format(Representation::Integer, wgpu::TextureFormat::R32Sint).is_ok());
        assert!(checked_format(Representation::Integer, wgpu::TextureFormat::R32Float).is_err());
        assert!(checked_format(Representation::Float, wgpu::TextureFormat::Rgba32Float).is_ok());
    }
}
