#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use ndarray::Array3;
use volume_generators::context::{
    BufferHandle, DrawCall, FramebufferHandle, GpuContext, ProgramHandle, ProgramLayout,
    ShaderHandle, TextureDescriptor, TextureHandle,
};
use volume_generators::enums::{FramebufferStatus, Representation, ShaderStage};
use volume_generators::generator::GeneratorId;
use volume_generators::readback::{ReadFormat, convert_pixels, read_format_of};
use volume_generators::shader::SamplingDescriptor;
use volume_generators::uniforms::Uniforms;
use volume_generators::{
    Field, FieldId, FieldRef, GpuError, ImageField, Volume, VolumeGeometry, VoxelData,
};

pub struct MockTexture {
    pub dimensions: [u32; 3],
    pub format: wgpu::TextureFormat,
    pub data: Vec<u8>,
}

#[derive(Default)]
struct MockFramebuffer {
    attachments: Vec<Option<(TextureHandle, u32)>>,
    draw_buffers: Vec<usize>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Calls {
    pub texture_creates: usize,
    pub texture_writes: usize,
    pub compiles: usize,
    pub links: usize,
    pub draws: usize,
    pub native_format_queries: usize,
    pub reads: usize,
}

/// Records every call and emulates a pass-through kernel: each draw copies
/// the current layer of the texture on unit 0 into every attachment.
///
/// Shaders are checked with naga, so compile errors are real.
#[derive(Default)]
pub struct MockContext {
    next: u64,
    pub textures: HashMap<TextureHandle, MockTexture>,
    shaders: HashMap<ShaderHandle, ShaderStage>,
    programs: HashMap<ProgramHandle, ProgramLayout>,
    framebuffers: HashMap<FramebufferHandle, MockFramebuffer>,
    buffers: HashMap<BufferHandle, Vec<u8>>,
    /// Replaces the layout reported for every attachment.
    native_read_format: Option<Option<ReadFormat>>,
    forced_status: Option<FramebufferStatus>,
    link_error: Option<String>,
    pub calls: Calls,
    pub last_uniforms: Vec<u8>,
    pub last_textures: Vec<Option<TextureHandle>>,
    pub read_formats: Vec<ReadFormat>,
}

impl MockContext {
    /// Reports `format` as the native read layout of every attachment;
    /// `None` reports no usable layout.
    pub fn with_native_read_format(mut self, format: Option<ReadFormat>) -> Self {
        self.native_read_format = Some(format);
        self
    }

    pub fn with_forced_status(mut self, status: FramebufferStatus) -> Self {
        self.forced_status = Some(status);
        self
    }

    pub fn with_link_error(mut self, log: &str) -> Self {
        self.link_error = Some(log.to_owned());
        self
    }

    fn id(&mut self) -> u64 {
        self.next += 1;
        self.next
    }

    pub fn live_programs(&self) -> usize {
        self.programs.len()
    }

    pub fn live_shaders(&self) -> usize {
        self.shaders.len()
    }

    pub fn live_framebuffers(&self) -> usize {
        self.framebuffers.len()
    }

    pub fn live_buffers(&self) -> usize {
        self.buffers.len()
    }

    fn layer(&self, texture: TextureHandle, layer: u32) -> Option<(&[u8], ReadFormat)> {
        let texture = self.textures.get(&texture)?;
        let format = read_format_of(texture.format)?;
        let [width, height, _] = texture.dimensions;
        let size = width as usize * height as usize * format.bytes_per_pixel();
        let start = layer as usize * size;
        Some((texture.data.get(start..start + size)?, format))
    }

    fn attachment(&self, framebuffer: FramebufferHandle, attachment: usize) -> Option<(TextureHandle, u32)> {
        self.framebuffers
            .get(&framebuffer)?
            .attachments
            .get(attachment)
            .copied()
            .flatten()
    }
}

impl GpuContext for MockContext {
    fn create_texture(
        &mut self,
        descriptor: &TextureDescriptor<'_>,
    ) -> Result<TextureHandle, GpuError> {
        let format =
            read_format_of(descriptor.format).ok_or(GpuError::UnsupportedFormat(descriptor.format))?;
        let [width, height, depth] = descriptor.dimensions;
        let handle = TextureHandle(self.id());
        self.calls.texture_creates += 1;
        self.textures.insert(
            handle,
            MockTexture {
                dimensions: descriptor.dimensions,
                format: descriptor.format,
                data: vec![0; (width * height * depth) as usize * format.bytes_per_pixel()],
            },
        );
        Ok(handle)
    }

    fn write_texture(&mut self, texture: TextureHandle, data: &[u8]) -> Result<(), GpuError> {
        let target = self
            .textures
            .get_mut(&texture)
            .ok_or(GpuError::UnknownHandle { kind: "texture", id: texture.0 })?;
        assert_eq!(target.data.len(), data.len(), "texture write size");
        target.data.copy_from_slice(data);
        self.calls.texture_writes += 1;
        Ok(())
    }

    fn delete_texture(&mut self, texture: TextureHandle) {
        self.textures.remove(&texture);
    }

    fn create_vertex_buffer(&mut self, _label: &str, data: &[u8]) -> Result<BufferHandle, GpuError> {
        let handle = BufferHandle(self.id());
        self.buffers.insert(handle, data.to_vec());
        Ok(handle)
    }

    fn delete_buffer(&mut self, buffer: BufferHandle) {
        self.buffers.remove(&buffer);
    }

    fn compile_shader(&mut self, stage: ShaderStage, source: &str) -> Result<ShaderHandle, String> {
        self.calls.compiles += 1;
        let module = naga::front::wgsl::parse_str(source).map_err(|err| err.emit_to_string(source))?;
        naga::valid::Validator::new(
            naga::valid::ValidationFlags::all(),
            naga::valid::Capabilities::default(),
        )
        .validate(&module)
        .map_err(|err| err.emit_to_string(source))?;
        let handle = ShaderHandle(self.id());
        self.shaders.insert(handle, stage);
        Ok(handle)
    }

    fn delete_shader(&mut self, shader: ShaderHandle) {
        self.shaders.remove(&shader);
    }

    fn link_program(
        &mut self,
        vertex: ShaderHandle,
        fragment: ShaderHandle,
        layout: &ProgramLayout,
    ) -> Result<ProgramHandle, String> {
        self.calls.links += 1;
        if let Some(log) = &self.link_error {
            return Err(log.clone());
        }
        assert_eq!(self.shaders.get(&vertex), Some(&ShaderStage::Vertex));
        assert_eq!(self.shaders.get(&fragment), Some(&ShaderStage::Fragment));
        let handle = ProgramHandle(self.id());
        self.programs.insert(handle, layout.clone());
        Ok(handle)
    }

    fn delete_program(&mut self, program: ProgramHandle) {
        self.programs.remove(&program);
    }

    fn create_framebuffer(&mut self) -> Result<FramebufferHandle, GpuError> {
        let handle = FramebufferHandle(self.id());
        self.framebuffers.insert(handle, MockFramebuffer::default());
        Ok(handle)
    }

    fn delete_framebuffer(&mut self, framebuffer: FramebufferHandle) {
        self.framebuffers.remove(&framebuffer);
    }

    fn attach_texture_layer(
        &mut self,
        framebuffer: FramebufferHandle,
        attachment: usize,
        texture: Option<TextureHandle>,
        layer: u32,
    ) -> Result<(), GpuError> {
        let target = self
            .framebuffers
            .get_mut(&framebuffer)
            .ok_or(GpuError::UnknownHandle { kind: "framebuffer", id: framebuffer.0 })?;
        if target.attachments.len() <= attachment {
            target.attachments.resize(attachment + 1, None);
        }
        target.attachments[attachment] = texture.map(|texture| (texture, layer));
        Ok(())
    }

    fn set_draw_buffers(
        &mut self,
        framebuffer: FramebufferHandle,
        attachments: &[usize],
    ) -> Result<(), GpuError> {
        let target = self
            .framebuffers
            .get_mut(&framebuffer)
            .ok_or(GpuError::UnknownHandle { kind: "framebuffer", id: framebuffer.0 })?;
        target.draw_buffers = attachments.to_vec();
        Ok(())
    }

    fn framebuffer_status(
        &mut self,
        framebuffer: FramebufferHandle,
    ) -> Result<FramebufferStatus, GpuError> {
        if let Some(status) = self.forced_status {
            return Ok(status);
        }
        let target = self
            .framebuffers
            .get(&framebuffer)
            .ok_or(GpuError::UnknownHandle { kind: "framebuffer", id: framebuffer.0 })?;
        let complete = !target.draw_buffers.is_empty()
            && target.draw_buffers.iter().all(|&index| {
                target.attachments.get(index).copied().flatten().is_some()
            });
        Ok(if complete {
            FramebufferStatus::Complete
        } else {
            FramebufferStatus::IncompleteMissingAttachment
        })
    }

    fn draw(&mut self, call: &DrawCall<'_>) -> Result<(), GpuError> {
        let layout = self
            .programs
            .get(&call.program)
            .ok_or(GpuError::UnknownHandle { kind: "program", id: call.program.0 })?;
        assert_eq!(call.uniforms.len(), layout.uniforms.size());
        assert_eq!(call.textures.len(), layout.input_units);
        assert!(self.buffers.contains_key(&call.vertex_buffer));
        self.calls.draws += 1;
        self.last_uniforms = call.uniforms.to_vec();
        self.last_textures = call.textures.to_vec();

        let draw_buffers = self.framebuffers[&call.framebuffer].draw_buffers.clone();
        for index in draw_buffers {
            let Some((target, layer)) = self.attachment(call.framebuffer, index) else {
                continue;
            };
            let Some(target_format) = self.textures.get(&target).and_then(|t| read_format_of(t.format)) else {
                continue;
            };
            let [width, height, _] = self.textures[&target].dimensions;
            let size = width as usize * height as usize * target_format.bytes_per_pixel();
            let mut pixels = vec![0u8; size];
            let source = call
                .textures
                .first()
                .copied()
                .flatten()
                .and_then(|source| self.layer(source, layer));
            if let Some((bytes, format)) = source {
                if bytes.len() / format.bytes_per_pixel() == size / target_format.bytes_per_pixel() {
                    convert_pixels(bytes, format, &mut pixels, target_format)?;
                }
            }
            let start = layer as usize * size;
            if let Some(texture) = self.textures.get_mut(&target) {
                texture.data[start..start + size].copy_from_slice(&pixels);
            }
        }
        Ok(())
    }

    fn implementation_read_format(
        &mut self,
        framebuffer: FramebufferHandle,
        attachment: usize,
    ) -> Option<ReadFormat> {
        self.calls.native_format_queries += 1;
        if let Some(format) = self.native_read_format {
            return format;
        }
        let (texture, _) = self.attachment(framebuffer, attachment)?;
        read_format_of(self.textures.get(&texture)?.format)
    }

    fn read_pixels(
        &mut self,
        framebuffer: FramebufferHandle,
        attachment: usize,
        size: [u32; 2],
        format: ReadFormat,
        destination: &mut [u8],
    ) -> Result<(), GpuError> {
        self.calls.reads += 1;
        self.read_formats.push(format);
        let (texture, layer) = self
            .attachment(framebuffer, attachment)
            .ok_or(GpuError::Validation(format!("attachment {attachment} is empty")))?;
        assert_eq!(self.textures[&texture].dimensions[..2], size[..]);
        let (bytes, native) = self
            .layer(texture, layer)
            .ok_or(GpuError::Validation("layer out of range".to_owned()))?;
        convert_pixels(bytes, native, destination, format)?;
        Ok(())
    }
}

pub fn shared<F: Field + 'static>(field: F) -> (Rc<RefCell<F>>, FieldRef) {
    let field = Rc::new(RefCell::new(field));
    let erased: FieldRef = field.clone();
    (field, erased)
}

pub fn constant_integer_volume(shape: (usize, usize, usize), value: i16) -> Volume {
    Volume::new(
        VoxelData::Integer(Array3::from_elem(shape, value)),
        VolumeGeometry::default(),
    )
}

pub fn ramp_float_volume(shape: (usize, usize, usize)) -> Volume {
    Volume::new(
        VoxelData::Float(Array3::from_shape_fn(shape, |(z, y, x)| {
            (z * 10_000 + y * 100 + x) as f32 * 0.5
        })),
        VolumeGeometry::default(),
    )
}

pub fn image_field(id: u32, volume: Volume) -> ImageField {
    ImageField::new(FieldId::new(id), volume)
}

/// A field without a texture whose sampling body is given verbatim.
pub struct ScriptedField {
    pub id: FieldId,
    pub dimensions: [u32; 3],
    pub representation: Representation,
    pub sample_body: String,
    generator: Option<GeneratorId>,
}

impl ScriptedField {
    pub fn new(id: u32, representation: Representation, sample_body: &str) -> Self {
        Self {
            id: FieldId::new(id),
            dimensions: [4, 4, 2],
            representation,
            sample_body: sample_body.to_owned(),
            generator: None,
        }
    }

    pub fn valid(id: u32, representation: Representation) -> Self {
        Self::new(
            id,
            representation,
            "    return FieldSample(0.0, vec3<f32>(0.0), 0.0);\n",
        )
    }

    pub fn broken(id: u32, representation: Representation) -> Self {
        Self::new(
            id,
            representation,
            "    return FieldSample(missing_value, vec3<f32>(0.0), 0.0);\n",
        )
    }
}

impl Field for ScriptedField {
    fn id(&self) -> FieldId {
        self.id
    }

    fn dimensions(&self) -> [u32; 3] {
        self.dimensions
    }

    fn representation(&self) -> Representation {
        self.representation
    }

    fn texture_format(&self) -> wgpu::TextureFormat {
        match self.representation {
            Representation::Integer => wgpu::TextureFormat::R16Sint,
            Representation::Float => wgpu::TextureFormat::R32Float,
        }
    }

    fn texture(&self) -> Option<TextureHandle> {
        None
    }

    fn needs_update(&self) -> bool {
        false
    }

    fn upload_to_texture(&mut self, _ctx: &mut dyn GpuContext) -> Result<bool, GpuError> {
        Ok(false)
    }

    fn sampling_descriptor(&self) -> SamplingDescriptor {
        SamplingDescriptor {
            sample_body: self.sample_body.clone(),
            ..Default::default()
        }
    }

    fn uniforms(&self) -> Uniforms {
        Uniforms::new()
    }

    fn generator(&self) -> Option<GeneratorId> {
        self.generator
    }

    fn set_generator(&mut self, generator: Option<GeneratorId>) {
        self.generator = generator;
    }

    fn release(&mut self, _ctx: &mut dyn GpuContext) {}
}
