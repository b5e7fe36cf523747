use glam::Mat4;
use tracing::debug;

use super::{
    Field, FieldId, TRIVIAL_REJECT, checked_format, geometry_declarations, geometry_functions,
    geometry_uniforms,
};
use crate::context::{GpuContext, TextureDescriptor, TextureHandle};
use crate::enums::Representation;
use crate::error::{FieldError, GpuError, ReadbackError};
use crate::generator::{FormatMode, GeneratorId};
use crate::readback::{convert_pixels, read_format_of};
use crate::shader::{SamplingDescriptor, ShaderFunction};
use crate::uniforms::{UniformDecl, UniformType, Uniforms};
use crate::volume::{Volume, VoxelData};

/// A scalar volume placed in patient space.
///
/// Source-authored image fields upload their voxels. Once a generator claims
/// the field, uploads only allocate the texture and rendered slices are read
/// back into the voxel storage.
pub struct ImageField {
    id: FieldId,
    volume: Volume,
    format: wgpu::TextureFormat,
    texture: Option<TextureHandle>,
    allocated: Option<(wgpu::TextureFormat, [u32; 3])>,
    needs_update: bool,
    generator: Option<GeneratorId>,
    visible: bool,
    patient_transform: Mat4,
    window_center: f32,
    window_width: f32,
}

fn default_format(representation: Representation) -> wgpu::TextureFormat {
    match representation {
        Representation::Integer => wgpu::TextureFormat::R16Sint,
        Representation::Float => wgpu::TextureFormat::R32Float,
    }
}

fn value_range(data: &VoxelData) -> Option<(f32, f32)> {
    let fold = |range: Option<(f32, f32)>, value: f32| match range {
        Some((low, high)) => Some((low.min(value), high.max(value))),
        None => Some((value, value)),
    };
    match data {
        VoxelData::Integer(values) => values.iter().map(|&v| f32::from(v)).fold(None, fold),
        VoxelData::Float(values) => values.iter().copied().fold(None, fold),
    }
}

impl ImageField {
    /// Wraps `volume`. The window spans the value range of the data.
    pub fn new(id: FieldId, volume: Volume) -> Self {
        let (low, high) = value_range(&volume.data).unwrap_or((0.0, 1.0));
        Self {
            id,
            format: default_format(volume.data.representation()),
            volume,
            texture: None,
            allocated: None,
            needs_update: true,
            generator: None,
            visible: true,
            patient_transform: Mat4::IDENTITY,
            window_center: (low + high) / 2.0,
            window_width: (high - low).max(1.0),
        }
    }

    /// A zero-filled field shaped like `template`, to be filled by a generator.
    pub fn derived_from(id: FieldId, template: &Volume) -> Self {
        let data = VoxelData::zeros(template.data.representation(), template.dim());
        let mut field = Self::new(id, Volume::new(data, template.geometry));
        if let Some((low, high)) = value_range(&template.data) {
            field.set_window((low + high) / 2.0, (high - low).max(1.0));
        }
        field
    }

    /// Uses `format` for the texture instead of the single-channel default.
    pub fn with_texture_format(mut self, format: wgpu::TextureFormat) -> Result<Self, FieldError> {
        self.set_texture_format(format)?;
        Ok(self)
    }

    pub fn set_texture_format(&mut self, format: wgpu::TextureFormat) -> Result<(), FieldError> {
        self.format = checked_format(self.representation(), format)?;
        self.needs_update = true;
        Ok(())
    }

    pub fn volume(&self) -> &Volume {
        &self.volume
    }

    /// Replaces the voxels of a source-authored field.
    pub fn set_data(&mut self, data: VoxelData) -> Result<(), FieldError> {
        if self.generator.is_some() {
            return Err(FieldError::GeneratorAuthored(self.id));
        }
        if data.dim() != self.volume.dim() {
            return Err(FieldError::ShapeMismatch {
                expected: self.volume.dim(),
                found: data.dim(),
            });
        }
        if data.representation() != self.representation() {
            return Err(FieldError::RepresentationMismatch {
                expected: self.representation(),
                found: data.representation(),
            });
        }
        self.volume.data = data.into_standard_layout();
        self.needs_update = true;
        Ok(())
    }

    pub fn set_visible(&mut self, visible: bool) {
        self.visible = visible;
    }

    /// Extra patient-space transform applied to sample points.
    pub fn set_patient_transform(&mut self, transform: Mat4) {
        self.patient_transform = transform;
    }

    pub fn set_window(&mut self, center: f32, width: f32) {
        self.window_center = center;
        self.window_width = width;
    }

    pub fn window(&self) -> (f32, f32) {
        (self.window_center, self.window_width)
    }

    fn upload_voxels(&self, ctx: &mut dyn GpuContext, texture: TextureHandle) -> Result<(), GpuError> {
        let target = read_format_of(self.format).ok_or(GpuError::UnsupportedFormat(self.format))?;
        let source = FormatMode::for_representation(self.representation()).read_format;
        let bytes = self.volume.data.as_bytes().ok_or(ReadbackError::NonContiguous)?;
        if source == target {
            return ctx.write_texture(texture, bytes);
        }
        let pixels = bytes.len() / source.bytes_per_pixel();
        let mut converted = vec![0; pixels * target.bytes_per_pixel()];
        convert_pixels(bytes, source, &mut converted, target)?;
        ctx.write_texture(texture, &converted)
    }
}

impl Field for ImageField {
    fn id(&self) -> FieldId {
        self.id
    }

    fn dimensions(&self) -> [u32; 3] {
        let (depth, height, width) = self.volume.dim();
        [width as u32, height as u32, depth as u32]
    }

    fn representation(&self) -> Representation {
        self.volume.data.representation()
    }

    fn texture_format(&self) -> wgpu::TextureFormat {
        self.format
    }

    fn texture(&self) -> Option<TextureHandle> {
        self.texture
    }

    fn needs_update(&self) -> bool {
        self.needs_update
    }

    fn upload_to_texture(&mut self, ctx: &mut dyn GpuContext) -> Result<bool, GpuError> {
        if !self.needs_update {
            return Ok(false);
        }
        let dimensions = self.dimensions();
        let current = self.texture;
        let texture = match current {
            Some(texture) if self.allocated == Some((self.format, dimensions)) => texture,
            stale => {
                if let Some(texture) = stale {
                    ctx.delete_texture(texture);
                    self.texture = None;
                }
                let label = format!("image field {}", self.id);
                let texture = ctx.create_texture(&TextureDescriptor {
                    label: &label,
                    dimensions,
                    format: self.format,
                })?;
                self.texture = Some(texture);
                self.allocated = Some((self.format, dimensions));
                texture
            }
        };
        // generator-authored fields are filled by rendering
        if self.generator.is_none() {
            self.upload_voxels(ctx, texture)?;
        }
        self.needs_update = false;
        debug!(
            field = %self.id,
            format = ?self.format,
            with_data = self.generator.is_none(),
            "image field uploaded"
        );
        Ok(true)
    }

    fn sampling_descriptor(&self) -> SamplingDescriptor {
        let mut uniforms = geometry_declarations();
        uniforms.extend([
            UniformDecl::new("patient_transform", UniformType::Mat4),
            UniformDecl::new("window_center", UniformType::Float),
            UniformDecl::new("window_width", UniformType::Float),
        ]);
        let mut functions = geometry_functions();
        functions.push(ShaderFunction::new(
            "transform_point",
            "point: vec3<f32>",
            "vec3<f32>",
            "    return (${patient_transform} * vec4<f32>(point, 1.0)).xyz;\n",
        ));
        let sample_body = format!(
            "    let stp = ${{patient_to_texture}}(${{transform_point}}(point));
    if ({TRIVIAL_REJECT}) {{
        return FieldSample(0.0, vec3<f32>(0.0), 0.0);
    }}
    let texel_size = vec3<f32>(1.0) / vec3<f32>(${{pixel_dimensions}});
    let dx = vec3<f32>(texel_size.x, 0.0, 0.0);
    let dy = vec3<f32>(0.0, texel_size.y, 0.0);
    let dz = vec3<f32>(0.0, 0.0, texel_size.z);
    let gradient = 0.5 * vec3<f32>(
        ${{texel}}(stp + dx).r - ${{texel}}(stp - dx).r,
        ${{texel}}(stp + dy).r - ${{texel}}(stp - dy).r,
        ${{texel}}(stp + dz).r - ${{texel}}(stp - dz).r,
    );
    let magnitude = length(gradient);
    var normal = vec3<f32>(0.0);
    if (magnitude > 0.0) {{
        normal = normalize(${{normal_pixel_to_patient}} * gradient);
    }}
    return FieldSample(${{texel}}(stp).r, normal, magnitude);
"
        );
        SamplingDescriptor {
            uniforms,
            functions,
            sample_body,
        }
    }

    fn uniforms(&self) -> Uniforms {
        let mut uniforms = geometry_uniforms(
            self.id,
            self.visible,
            &self.volume.geometry,
            self.dimensions(),
        );
        uniforms.insert(
            self.id.namespaced("patient_transform"),
            self.patient_transform.into(),
        );
        uniforms.insert(self.id.namespaced("window_center"), self.window_center.into());
        uniforms.insert(self.id.namespaced("window_width"), self.window_width.into());
        uniforms
    }

    fn generator(&self) -> Option<GeneratorId> {
        self.generator
    }

    fn set_generator(&mut self, generator: Option<GeneratorId>) {
        if self.generator.is_some() && generator.is_none() {
            // source data is authoritative again
            self.needs_update = true;
        }
        self.generator = generator;
    }

    fn generated_data_mut(&mut self) -> Option<&mut VoxelData> {
        self.generator.is_some().then_some(&mut self.volume.data)
    }

    fn release(&mut self, ctx: &mut dyn GpuContext) {
        if let Some(texture) = self.texture.take() {
            ctx.delete_texture(texture);
        }
        self.allocated = None;
        self.needs_update = true;
    }
}

#[cfg(test)]
mod tests {
    use ndarray::Array3;

    use super::*;
    use crate::uniforms::UniformValue;
    use crate::volume::VolumeGeometry;

    fn field(values: Array3<i16>) -> ImageField {
        ImageField::new(
            FieldId::new(3),
            Volume::new(VoxelData::Integer(values), VolumeGeometry::default()),
        )
    }

    #[test]
    fn dimensions_are_width_height_depth() {
        let field = field(Array3::zeros((2, 3, 5)));
        assert_eq!(field.dimensions(), [5, 3, 2]);
        assert_eq!(field.texture_format(), wgpu::TextureFormat::R16Sint);
    }

    #[test]
    fn window_spans_the_data() {
        let mut values = Array3::zeros((1, 1, 2));
        values[[0, 0, 0]] = -1000;
        values[[0, 0, 1]] = 3000;
        assert_eq!(field(values).window(), (1000.0, 4000.0));
    }

    #[test]
    fn uniforms_are_namespaced() {
        let uniforms = field(Array3::zeros((2, 3, 5))).uniforms();
        assert_eq!(uniforms.get("visible_3"), Some(&UniformValue::Int(1)));
        assert_eq!(
            uniforms.get("pixel_dimensions_3"),
            Some(&UniformValue::Vec3I([5, 3, 2]))
        );
        assert!(uniforms.contains_key("normal_pixel_to_patient_3"));
        assert_eq!(uniforms.len(), 8);
    }

    #[test]
    fn descriptor_declares_every_uniform_it_publishes() {
        let field = field(Array3::zeros((2, 3, 5)));
        let declared: Vec<_> = field
            .sampling_descriptor()
            .uniforms
            .iter()
            .map(|uniform| field.id().namespaced(&uniform.name))
            .collect();
        for name in field.uniforms().keys() {
            assert!(declared.contains(name), "{name} is not declared");
        }
    }

    #[test]
    fn claimed_fields_reject_source_data() {
        let mut field = field(Array3::zeros((2, 3, 5)));
        field.set_generator(Some(GeneratorId::next()));
        assert_eq!(
            field.set_data(VoxelData::Integer(Array3::zeros((2, 3, 5)))),
            Err(FieldError::GeneratorAuthored(FieldId::new(3)))
        );
        assert!(field.generated_data_mut().is_some());
    }

    #[test]
    fn source_data_keeps_its_shape() {
        let mut field = field(Array3::zeros((2, 3, 5)));
        assert!(matches!(
            field.set_data(VoxelData::Integer(Array3::zeros((2, 3, 4)))),
            Err(FieldError::ShapeMismatch { .. })
        ));
        assert!(field.generated_data_mut().is_none());
    }

    #[test]
    fn texture_format_must_match_representation() {
        let field = field(Array3::zeros((1, 1, 1)));
        assert!(matches!(
            field.with_texture_format(wgpu::TextureFormat::R32Float),
            Err(FieldError::UnsupportedTextureFormat(_))
        ));
    }
}
