use ndarray::Array4;
use tracing::debug;

use super::{
    Field, FieldId, TRIVIAL_REJECT, geometry_declarations, geometry_functions, geometry_uniforms,
};
use crate::context::{GpuContext, TextureDescriptor, TextureHandle};
use crate::enums::Representation;
use crate::error::{FieldError, GpuError};
use crate::generator::GeneratorId;
use crate::shader::SamplingDescriptor;
use crate::uniforms::Uniforms;
use crate::volume::VolumeGeometry;

/// A grid of displacement vectors in patient millimetres, as produced by a
/// deformable registration. Lives only on the GPU once uploaded.
pub struct TransformField {
    id: FieldId,
    /// `(depth, height, width, 3)`
    displacements: Array4<f32>,
    geometry: VolumeGeometry,
    texture: Option<TextureHandle>,
    needs_update: bool,
    generator: Option<GeneratorId>,
    visible: bool,
}

impl TransformField {
    pub fn new(id: FieldId, displacements: Array4<f32>, geometry: VolumeGeometry) -> Self {
        Self {
            id,
            displacements: displacements.as_standard_layout().into_owned(),
            geometry,
            texture: None,
            needs_update: true,
            generator: None,
            visible: true,
        }
    }

    pub fn set_displacements(&mut self, displacements: Array4<f32>) -> Result<(), FieldError> {
        if self.generator.is_some() {
            return Err(FieldError::GeneratorAuthored(self.id));
        }
        if displacements.dim() != self.displacements.dim() {
            let (d, h, w, _) = self.displacements.dim();
            let (fd, fh, fw, _) = displacements.dim();
            return Err(FieldError::ShapeMismatch {
                expected: (d, h, w),
                found: (fd, fh, fw),
            });
        }
        self.displacements = displacements.as_standard_layout().into_owned();
        self.needs_update = true;
        Ok(())
    }

    pub fn set_visible(&mut self, visible: bool) {
        self.visible = visible;
    }

    /// Displacements padded to four components per texel.
    fn texels(&self) -> Vec<f32> {
        self.displacements
            .rows()
            .into_iter()
            .flat_map(|vector| [vector[0], vector[1], vector[2], 0.0])
            .collect()
    }
}

impl Field for TransformField {
    fn id(&self) -> FieldId {
        self.id
    }

    fn dimensions(&self) -> [u32; 3] {
        let (depth, height, width, _) = self.displacements.dim();
        [width as u32, height as u32, depth as u32]
    }

    fn representation(&self) -> Representation {
        Representation::Float
    }

    fn texture_format(&self) -> wgpu::TextureFormat {
        wgpu::TextureFormat::Rgba32Float
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
        let texture = match self.texture {
            Some(texture) => texture,
            None => {
                let label = format!("transform field {}", self.id);
                let texture = ctx.create_texture(&TextureDescriptor {
                    label: &label,
                    dimensions: self.dimensions(),
                    format: self.texture_format(),
                })?;
                self.texture = Some(texture);
                texture
            }
        };
        // only transfer the grid if no generator fills it in
        if self.generator.is_none() {
            ctx.write_texture(texture, bytemuck::cast_slice(&self.texels()))?;
        }
        self.needs_update = false;
        debug!(field = %self.id, with_data = self.generator.is_none(), "transform field uploaded");
        Ok(true)
    }

    fn sampling_descriptor(&self) -> SamplingDescriptor {
        SamplingDescriptor {
            uniforms: geometry_declarations(),
            functions: geometry_functions(),
            sample_body: format!(
                "    let stp = ${{patient_to_texture}}(point);
    if ({TRIVIAL_REJECT}) {{
        return FieldSample(0.0, vec3<f32>(0.0), 0.0);
    }}
    let displacement = ${{texel}}(stp).xyz;
    let magnitude = length(displacement);
    return FieldSample(magnitude, displacement, magnitude);
"
            ),
        }
    }

    fn uniforms(&self) -> Uniforms {
        geometry_uniforms(self.id, self.visible, &self.geometry, self.dimensions())
    }

    fn generator(&self) -> Option<GeneratorId> {
        self.generator
    }

    fn set_generator(&mut self, generator: Option<GeneratorId>) {
        if self.generator.is_some() && generator.is_none() {
            self.needs_update = true;
        }
        self.generator = generator;
    }

    fn release(&mut self, ctx: &mut dyn GpuContext) {
        if let Some(texture) = self.texture.take() {
            ctx.delete_texture(texture);
        }
        self.needs_update = true;
    }
}
