//! [`GpuContext`] on top of `wgpu`.
//!
//! Framebuffers are emulated: a framebuffer records which texture layer each
//! color attachment points at. Every draw renders into one 2D target per
//! attachment and copies the result into the attached layer, because not
//! every backend honors `depth_slice` on 3D views. Compile diagnostics come
//! from naga, which wgpu uses internally as well.

use std::collections::HashMap;
use std::num::NonZeroU64;

use futures::executor::block_on;
use tracing::{debug, info, trace};
use wgpu::util::DeviceExt;
use wgpu::{PollType, TextureFormat};

use crate::context::{
    BufferHandle, DrawCall, FramebufferHandle, GpuContext, ProgramHandle, ProgramLayout,
    QuadGeometry, ShaderHandle, TextureDescriptor, TextureHandle,
};
use crate::enums::{FramebufferStatus, Representation, ShaderStage};
use crate::error::{GpuError, ReadbackError};
use crate::readback::{ReadFormat, convert_pixels, read_format_of};

struct GpuTexture {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    dimensions: [u32; 3],
    format: TextureFormat,
}

/// 2D color target a slice is drawn into before it lands in its layer.
struct SliceTarget {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    format: TextureFormat,
    size: [u32; 2],
}

impl SliceTarget {
    fn new(device: &wgpu::Device, format: TextureFormat, size: [u32; 2]) -> Self {
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("slice target"),
            size: wgpu::Extent3d {
                width: size[0],
                height: size[1],
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        Self {
            texture,
            view,
            format,
            size,
        }
    }
}

struct CompiledShader {
    stage: ShaderStage,
    module: wgpu::ShaderModule,
}

struct LinkedProgram {
    pipeline: wgpu::RenderPipeline,
    uniform_layout: wgpu::BindGroupLayout,
    texture_layout: wgpu::BindGroupLayout,
    uniform_buffer: wgpu::Buffer,
    layout: ProgramLayout,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Attachment {
    texture: TextureHandle,
    layer: u32,
}

#[derive(Default)]
struct Framebuffer {
    attachments: Vec<Option<Attachment>>,
    draw_buffers: Vec<usize>,
    /// Per attachment, reused while format and size stay the same.
    targets: Vec<Option<SliceTarget>>,
}

pub struct WgpuContext {
    adapter: wgpu::Adapter,
    device: wgpu::Device,
    queue: wgpu::Queue,
    adapter_info: wgpu::AdapterInfo,
    sampler: wgpu::Sampler,
    placeholders: HashMap<Representation, GpuTexture>,
    next_handle: u64,
    textures: HashMap<TextureHandle, GpuTexture>,
    buffers: HashMap<BufferHandle, wgpu::Buffer>,
    shaders: HashMap<ShaderHandle, CompiledShader>,
    programs: HashMap<ProgramHandle, LinkedProgram>,
    framebuffers: HashMap<FramebufferHandle, Framebuffer>,
}

fn unknown(kind: &'static str, id: u64) -> GpuError {
    GpuError::UnknownHandle { kind, id }
}

fn sample_type(representation: Representation) -> wgpu::TextureSampleType {
    match representation {
        Representation::Integer => wgpu::TextureSampleType::Sint,
        Representation::Float => wgpu::TextureSampleType::Float { filterable: false },
    }
}

impl WgpuContext {
    /// Requests an adapter and a device with default limits.
    pub async fn new() -> Result<Self, GpuError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                force_fallback_adapter: false,
                compatible_surface: None,
            })
            .await?;
        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("volume generators"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default(),
                ..Default::default()
            })
            .await?;
        Ok(Self::from_adapter(adapter, device, queue))
    }

    /// Wraps a device created from `adapter`. The adapter decides which
    /// formats outputs may use.
    pub fn from_adapter(adapter: wgpu::Adapter, device: wgpu::Device, queue: wgpu::Queue) -> Self {
        let adapter_info = adapter.get_info();
        info!(
            adapter = %adapter_info.name,
            backend = ?adapter_info.backend,
            "GPU adapter selected"
        );
        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("field sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Nearest,
            min_filter: wgpu::FilterMode::Nearest,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });
        Self {
            adapter,
            device,
            queue,
            adapter_info,
            sampler,
            placeholders: HashMap::new(),
            next_handle: 1,
            textures: HashMap::new(),
            buffers: HashMap::new(),
            shaders: HashMap::new(),
            programs: HashMap::new(),
            framebuffers: HashMap::new(),
        }
    }

    pub fn adapter_info(&self) -> &wgpu::AdapterInfo {
        &self.adapter_info
    }

    /// Whether the adapter can draw into `format`.
    pub fn renders_to(&self, format: TextureFormat) -> bool {
        self.adapter
            .get_texture_format_features(format)
            .allowed_usages
            .contains(wgpu::TextureUsages::RENDER_ATTACHMENT)
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_handle;
        self.next_handle += 1;
        id
    }

    fn allocate(&self, label: &str, dimensions: [u32; 3], format: TextureFormat) -> GpuTexture {
        let [width, height, depth] = dimensions;
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: depth,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D3,
            format,
            usage: wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::COPY_DST
                | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        GpuTexture {
            texture,
            view,
            dimensions,
            format,
        }
    }

    /// 1x1x1 texture bound to units whose field has no texture.
    fn placeholder(&mut self, representation: Representation) -> &GpuTexture {
        if !self.placeholders.contains_key(&representation) {
            let format = match representation {
                Representation::Integer => TextureFormat::R32Sint,
                Representation::Float => TextureFormat::R32Float,
            };
            let texture = self.allocate("unbound unit", [1, 1, 1], format);
            self.placeholders.insert(representation, texture);
        }
        &self.placeholders[&representation]
    }

    /// Runs `operation` inside a validation error scope.
    fn validated<T>(&self, operation: impl FnOnce() -> T) -> Result<T, String> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let value = operation();
        match block_on(self.device.pop_error_scope()) {
            Some(error) => Err(error.to_string()),
            None => Ok(value),
        }
    }

    fn attachment(
        &self,
        framebuffer: FramebufferHandle,
        attachment: usize,
    ) -> Result<(Attachment, &GpuTexture), GpuError> {
        let target = self
            .framebuffers
            .get(&framebuffer)
            .ok_or_else(|| unknown("framebuffer", framebuffer.0))?
            .attachments
            .get(attachment)
            .copied()
            .flatten()
            .ok_or(GpuError::Validation(format!(
                "attachment {attachment} has no texture"
            )))?;
        let texture = self
            .textures
            .get(&target.texture)
            .ok_or_else(|| unknown("texture", target.texture.0))?;
        Ok((target, texture))
    }

    fn bind_textures(
        &mut self,
        program: ProgramHandle,
        textures: &[Option<TextureHandle>],
    ) -> Result<wgpu::BindGroup, GpuError> {
        let linked = self
            .programs
            .get(&program)
            .ok_or_else(|| unknown("program", program.0))?;
        let representation = linked.layout.representation;
        let units = linked.layout.input_units;
        if textures.iter().take(units).any(Option::is_none) {
            self.placeholder(representation);
        }
        let linked = &self.programs[&program];

        let mut views = Vec::with_capacity(units);
        for unit in 0..units {
            let view = match textures.get(unit).copied().flatten() {
                Some(handle) => {
                    &self
                        .textures
                        .get(&handle)
                        .ok_or_else(|| unknown("texture", handle.0))?
                        .view
                }
                None => &self.placeholders[&representation].view,
            };
            views.push(view);
        }
        let mut entries = vec![wgpu::BindGroupEntry {
            binding: 0,
            resource: wgpu::BindingResource::Sampler(&self.sampler),
        }];
        entries.extend(views.iter().enumerate().map(|(unit, view)| wgpu::BindGroupEntry {
            binding: unit as u32 + 1,
            resource: wgpu::BindingResource::TextureView(view),
        }));
        Ok(self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("input textures"),
            layout: &linked.texture_layout,
            entries: &entries,
        }))
    }
}

impl GpuContext for WgpuContext {
    fn create_texture(
        &mut self,
        descriptor: &TextureDescriptor<'_>,
    ) -> Result<TextureHandle, GpuError> {
        if read_format_of(descriptor.format).is_none() {
            return Err(GpuError::UnsupportedFormat(descriptor.format));
        }
        let texture = self.allocate(descriptor.label, descriptor.dimensions, descriptor.format);
        let handle = TextureHandle(self.next_id());
        debug!(
            texture = handle.0,
            label = descriptor.label,
            dimensions = ?descriptor.dimensions,
            format = ?descriptor.format,
            "texture created"
        );
        self.textures.insert(handle, texture);
        Ok(handle)
    }

    fn write_texture(&mut self, texture: TextureHandle, data: &[u8]) -> Result<(), GpuError> {
        let target = self
            .textures
            .get(&texture)
            .ok_or_else(|| unknown("texture", texture.0))?;
        let [width, height, depth] = target.dimensions;
        let texel_size = target
            .format
            .block_copy_size(None)
            .ok_or(GpuError::UnsupportedFormat(target.format))?;
        let expected = (width * height * depth * texel_size) as usize;
        if data.len() != expected {
            return Err(ReadbackError::SizeMismatch {
                expected,
                found: data.len(),
            }
            .into());
        }
        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &target.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            data,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(width * texel_size),
                rows_per_image: Some(height),
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: depth,
            },
        );
        Ok(())
    }

    fn delete_texture(&mut self, texture: TextureHandle) {
        if let Some(removed) = self.textures.remove(&texture) {
            removed.texture.destroy();
        }
    }

    fn create_vertex_buffer(&mut self, label: &str, data: &[u8]) -> Result<BufferHandle, GpuError> {
        let buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents: data,
                usage: wgpu::BufferUsages::VERTEX,
            });
        let handle = BufferHandle(self.next_id());
        self.buffers.insert(handle, buffer);
        Ok(handle)
    }

    fn delete_buffer(&mut self, buffer: BufferHandle) {
        if let Some(removed) = self.buffers.remove(&buffer) {
            removed.destroy();
        }
    }

    fn compile_shader(&mut self, stage: ShaderStage, source: &str) -> Result<ShaderHandle, String> {
        let module = naga::front::wgsl::parse_str(source).map_err(|err| err.emit_to_string(source))?;
        naga::valid::Validator::new(
            naga::valid::ValidationFlags::all(),
            naga::valid::Capabilities::default(),
        )
        .validate(&module)
        .map_err(|err| err.emit_to_string(source))?;

        let label = format!("{stage} stage");
        let module = self.validated(|| {
            self.device
                .create_shader_module(wgpu::ShaderModuleDescriptor {
                    label: Some(&label),
                    source: wgpu::ShaderSource::Wgsl(source.into()),
                })
        })?;
        let handle = ShaderHandle(self.next_id());
        self.shaders.insert(handle, CompiledShader { stage, module });
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
        let stage_module = |handle: ShaderHandle, stage: ShaderStage| {
            match self.shaders.get(&handle) {
                Some(shader) if shader.stage == stage => Ok(&shader.module),
                Some(shader) => Err(format!(
                    "shader {} is a {} stage, expected {stage}",
                    handle.0, shader.stage
                )),
                None => Err(format!("unknown shader {}", handle.0)),
            }
        };
        let vertex_module = stage_module(vertex, ShaderStage::Vertex)?;
        let fragment_module = stage_module(fragment, ShaderStage::Fragment)?;
        let uniform_size = layout.uniforms.size() as u64;

        let linked = self.validated(|| {
            let uniform_layout =
                self.device
                    .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                        label: Some("uniforms"),
                        entries: &[wgpu::BindGroupLayoutEntry {
                            binding: 0,
                            visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                            ty: wgpu::BindingType::Buffer {
                                ty: wgpu::BufferBindingType::Uniform,
                                has_dynamic_offset: false,
                                min_binding_size: NonZeroU64::new(uniform_size),
                            },
                            count: None,
                        }],
                    });

            let mut texture_entries = vec![wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::NonFiltering),
                count: None,
            }];
            texture_entries.extend((0..layout.input_units).map(|unit| {
                wgpu::BindGroupLayoutEntry {
                    binding: unit as u32 + 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: sample_type(layout.representation),
                        view_dimension: wgpu::TextureViewDimension::D3,
                        multisampled: false,
                    },
                    count: None,
                }
            }));
            let texture_layout =
                self.device
                    .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                        label: Some("input textures"),
                        entries: &texture_entries,
                    });

            let pipeline_layout =
                self.device
                    .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                        label: Some("generator pipeline layout"),
                        bind_group_layouts: &[&uniform_layout, &texture_layout],
                        push_constant_ranges: &[],
                    });

            let targets: Vec<_> = layout
                .targets
                .iter()
                .map(|&format| {
                    Some(wgpu::ColorTargetState {
                        format,
                        blend: None,
                        write_mask: wgpu::ColorWrites::ALL,
                    })
                })
                .collect();

            let pipeline = self
                .device
                .create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                    label: Some("generator pipeline"),
                    layout: Some(&pipeline_layout),
                    vertex: wgpu::VertexState {
                        module: vertex_module,
                        entry_point: Some("main"),
                        compilation_options: Default::default(),
                        buffers: &[wgpu::VertexBufferLayout {
                            array_stride: QuadGeometry::STRIDE,
                            step_mode: wgpu::VertexStepMode::Vertex,
                            attributes: &wgpu::vertex_attr_array![0 => Float32x2, 1 => Float32x2],
                        }],
                    },
                    fragment: Some(wgpu::FragmentState {
                        module: fragment_module,
                        entry_point: Some("main"),
                        compilation_options: Default::default(),
                        targets: &targets,
                    }),
                    primitive: wgpu::PrimitiveState {
                        topology: wgpu::PrimitiveTopology::TriangleStrip,
                        ..Default::default()
                    },
                    depth_stencil: None,
                    multisample: wgpu::MultisampleState::default(),
                    multiview: None,
                    cache: None,
                });

            let uniform_buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("uniform block"),
                size: uniform_size,
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            });

            LinkedProgram {
                pipeline,
                uniform_layout,
                texture_layout,
                uniform_buffer,
                layout: layout.clone(),
            }
        })?;

        let handle = ProgramHandle(self.next_id());
        debug!(
            program = handle.0,
            targets = layout.targets.len(),
            inputs = layout.input_units,
            "program linked"
        );
        self.programs.insert(handle, linked);
        Ok(handle)
    }

    fn delete_program(&mut self, program: ProgramHandle) {
        if let Some(removed) = self.programs.remove(&program) {
            removed.uniform_buffer.destroy();
        }
    }

    fn create_framebuffer(&mut self) -> Result<FramebufferHandle, GpuError> {
        let handle = FramebufferHandle(self.next_id());
        self.framebuffers.insert(handle, Framebuffer::default());
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
            .ok_or_else(|| unknown("framebuffer", framebuffer.0))?;
        if target.attachments.len() <= attachment {
            target.attachments.resize(attachment + 1, None);
        }
        target.attachments[attachment] = texture.map(|texture| Attachment { texture, layer });
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
            .ok_or_else(|| unknown("framebuffer", framebuffer.0))?;
        target.draw_buffers = attachments.to_vec();
        Ok(())
    }

    fn framebuffer_status(
        &mut self,
        framebuffer: FramebufferHandle,
    ) -> Result<FramebufferStatus, GpuError> {
        let target = self
            .framebuffers
            .get(&framebuffer)
            .ok_or_else(|| unknown("framebuffer", framebuffer.0))?;
        if target.draw_buffers.is_empty() {
            return Ok(FramebufferStatus::IncompleteMissingAttachment);
        }
        if target.draw_buffers.len() > self.device.limits().max_color_attachments as usize {
            return Ok(FramebufferStatus::Unsupported);
        }
        let mut size = None;
        for &index in &target.draw_buffers {
            let Some(attachment) = target.attachments.get(index).copied().flatten() else {
                return Ok(FramebufferStatus::IncompleteMissingAttachment);
            };
            let Some(texture) = self.textures.get(&attachment.texture) else {
                return Ok(FramebufferStatus::IncompleteAttachment);
            };
            let [width, height, depth] = texture.dimensions;
            if attachment.layer >= depth {
                return Ok(FramebufferStatus::IncompleteAttachment);
            }
            if read_format_of(texture.format).is_none() || !self.renders_to(texture.format) {
                return Ok(FramebufferStatus::Unsupported);
            }
            match size {
                Some(size) if size != [width, height] => {
                    return Ok(FramebufferStatus::IncompleteDimensions);
                }
                _ => size = Some([width, height]),
            }
        }
        Ok(FramebufferStatus::Complete)
    }

    fn draw(&mut self, call: &DrawCall<'_>) -> Result<(), GpuError> {
        let input_textures = self.bind_textures(call.program, call.textures)?;

        let mut layers = Vec::new();
        let draw_buffers = self
            .framebuffers
            .get(&call.framebuffer)
            .ok_or_else(|| unknown("framebuffer", call.framebuffer.0))?
            .draw_buffers
            .clone();
        for index in draw_buffers {
            let (attachment, texture) = self.attachment(call.framebuffer, index)?;
            let [width, height, _] = texture.dimensions;
            layers.push((index, attachment, texture.format, [width, height]));
        }
        let framebuffer = self
            .framebuffers
            .get_mut(&call.framebuffer)
            .ok_or_else(|| unknown("framebuffer", call.framebuffer.0))?;
        for &(index, _, format, size) in &layers {
            if framebuffer.targets.len() <= index {
                framebuffer.targets.resize_with(index + 1, || None);
            }
            let slot = &mut framebuffer.targets[index];
            if !slot
                .as_ref()
                .is_some_and(|target| target.format == format && target.size == size)
            {
                *slot = Some(SliceTarget::new(&self.device, format, size));
            }
        }

        let linked = self
            .programs
            .get(&call.program)
            .ok_or_else(|| unknown("program", call.program.0))?;
        if call.uniforms.len() != linked.layout.uniforms.size() {
            return Err(ReadbackError::SizeMismatch {
                expected: linked.layout.uniforms.size(),
                found: call.uniforms.len(),
            }
            .into());
        }
        let framebuffer = &self.framebuffers[&call.framebuffer];
        let vertex_buffer = self
            .buffers
            .get(&call.vertex_buffer)
            .ok_or_else(|| unknown("buffer", call.vertex_buffer.0))?;

        let mut color_attachments = Vec::with_capacity(layers.len());
        let mut copies = Vec::with_capacity(layers.len());
        for &(index, attachment, _, size) in &layers {
            let Some(target) = framebuffer.targets[index].as_ref() else {
                return Err(GpuError::Validation(format!(
                    "attachment {index} has no slice target"
                )));
            };
            let volume = self
                .textures
                .get(&attachment.texture)
                .ok_or_else(|| unknown("texture", attachment.texture.0))?;
            color_attachments.push(Some(wgpu::RenderPassColorAttachment {
                view: &target.view,
                depth_slice: None,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT),
                    store: wgpu::StoreOp::Store,
                },
            }));
            copies.push((&target.texture, &volume.texture, attachment.layer, size));
        }

        self.queue
            .write_buffer(&linked.uniform_buffer, 0, call.uniforms);
        let [width, height] = call.viewport;

        let submitted = self.validated(|| {
            let uniforms = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("uniforms"),
                layout: &linked.uniform_layout,
                entries: &[wgpu::BindGroupEntry {
                    binding: 0,
                    resource: linked.uniform_buffer.as_entire_binding(),
                }],
            });
            let mut encoder = self
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("slice encoder"),
                });
            {
                let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                    label: Some("slice pass"),
                    color_attachments: &color_attachments,
                    depth_stencil_attachment: None,
                    timestamp_writes: None,
                    occlusion_query_set: None,
                });
                pass.set_pipeline(&linked.pipeline);
                pass.set_bind_group(0, &uniforms, &[]);
                pass.set_bind_group(1, &input_textures, &[]);
                pass.set_vertex_buffer(0, vertex_buffer.slice(..));
                pass.set_viewport(0.0, 0.0, width as f32, height as f32, 0.0, 1.0);
                pass.draw(0..call.vertex_count, 0..1);
            }
            for &(source, destination, layer, [width, height]) in &copies {
                encoder.copy_texture_to_texture(
                    wgpu::TexelCopyTextureInfo {
                        texture: source,
                        mip_level: 0,
                        origin: wgpu::Origin3d::ZERO,
                        aspect: wgpu::TextureAspect::All,
                    },
                    wgpu::TexelCopyTextureInfo {
                        texture: destination,
                        mip_level: 0,
                        origin: wgpu::Origin3d { x: 0, y: 0, z: layer },
                        aspect: wgpu::TextureAspect::All,
                    },
                    wgpu::Extent3d {
                        width,
                        height,
                        depth_or_array_layers: 1,
                    },
                );
            }
            self.queue.submit(Some(encoder.finish()));
        });
        submitted.map_err(GpuError::Validation)?;
        trace!(program = call.program.0, width, height, "slice drawn");
        Ok(())
    }

    fn implementation_read_format(
        &mut self,
        framebuffer: FramebufferHandle,
        attachment: usize,
    ) -> Option<ReadFormat> {
        let (_, texture) = self.attachment(framebuffer, attachment).ok()?;
        read_format_of(texture.format)
    }

    fn read_pixels(
        &mut self,
        framebuffer: FramebufferHandle,
        attachment: usize,
        size: [u32; 2],
        format: ReadFormat,
        destination: &mut [u8],
    ) -> Result<(), GpuError> {
        let (target, texture) = self.attachment(framebuffer, attachment)?;
        let native = read_format_of(texture.format).ok_or(GpuError::UnsupportedFormat(texture.format))?;
        let [width, height] = size;

        let unpadded_bytes_per_row = width * native.bytes_per_pixel() as u32;
        let alignment = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
        let padded_bytes_per_row = unpadded_bytes_per_row.div_ceil(alignment) * alignment;
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("readback staging"),
            size: u64::from(padded_bytes_per_row) * u64::from(height),
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("readback encoder"),
            });
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &texture.texture,
                mip_level: 0,
                origin: wgpu::Origin3d {
                    x: 0,
                    y: 0,
                    z: target.layer,
                },
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &staging,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_bytes_per_row),
                    rows_per_image: Some(height),
                },
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        self.queue.submit(Some(encoder.finish()));

        let buffer_slice = staging.slice(..);
        let (sender, receiver) = futures::channel::oneshot::channel();
        buffer_slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        let _ = self.device.poll(PollType::Wait {
            submission_index: None,
            timeout: None,
        });
        block_on(receiver)
            .map_err(|err| GpuError::BufferMapping(err.to_string()))?
            .map_err(|err| GpuError::BufferMapping(err.to_string()))?;

        let mapped = buffer_slice.get_mapped_range();
        let mut pixels = Vec::with_capacity((unpadded_bytes_per_row * height) as usize);
        for row in mapped.chunks_exact(padded_bytes_per_row as usize) {
            pixels.extend_from_slice(&row[..unpadded_bytes_per_row as usize]);
        }
        drop(mapped);
        staging.unmap();

        convert_pixels(&pixels, native, destination, format)?;
        Ok(())
    }
}
