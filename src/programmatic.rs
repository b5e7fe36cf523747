//! Generator that fills its outputs by rendering a kernel one depth slice at
//! a time.

use std::time::Duration;

use tracing::{debug, error, info, instrument, trace};
use web_time::Instant;

use crate::context::{
    BufferHandle, DrawCall, FramebufferHandle, GpuContext, ProgramHandle, ProgramLayout,
    QuadGeometry, ShaderHandle, TextureHandle,
};
use crate::enums::{FramebufferStatus, ShaderStage};
use crate::error::{CodegenError, GeneratorError};
use crate::fields::FieldRef;
use crate::generator::{Generator, GeneratorId, GeneratorOptions, annotate_source};
use crate::kernel::Kernel;
use crate::readback::{ReadPath, ReadbackCache, ReadbackStats, convert_pixels};
use crate::shader::{AssembledProgram, FieldContribution, assemble};
use crate::uniforms::{SLICE_UNIFORM, UniformBlock, UniformValue, Uniforms};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GeneratorState {
    /// No program has been linked yet.
    Unbuilt,
    Built,
    /// Fields or kernel changed since the last successful build.
    Stale,
}

/// Summary of one [`ProgrammaticGenerator::generate`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GenerationReport {
    pub slices: u32,
    /// Outputs with host storage that received every slice.
    pub outputs_read_back: usize,
    pub elapsed: Duration,
}

struct LinkedProgram {
    handle: ProgramHandle,
    vertex: ShaderHandle,
    fragment: ShaderHandle,
    layout: ProgramLayout,
}

pub struct ProgrammaticGenerator {
    base: Generator,
    kernel: Kernel,
    /// Uniforms set by the caller, reapplied over kernel-derived values.
    overrides: Uniforms,
    state: GeneratorState,
    program: Option<LinkedProgram>,
    sources: Option<AssembledProgram>,
    framebuffer: Option<FramebufferHandle>,
    quad: Option<BufferHandle>,
    readback: ReadbackCache,
}

fn check_inputs(kernel: &Kernel, inputs: &[FieldRef]) -> Result<(), GeneratorError> {
    if inputs.len() < kernel.required_inputs() {
        return Err(GeneratorError::MissingInputs {
            kernel: kernel.label(),
            expected: kernel.required_inputs(),
            found: inputs.len(),
        });
    }
    Ok(())
}

fn compile_failure(stage: ShaderStage, log: String, source: &str) -> GeneratorError {
    let annotated_source = annotate_source(source);
    error!(%stage, %log, "shader compilation failed\n{annotated_source}");
    GeneratorError::ShaderCompile {
        stage,
        log,
        annotated_source,
    }
}

impl ProgrammaticGenerator {
    /// Configures the base generator. Uniforms given in `options` or through
    /// [`set_uniform`](Self::set_uniform) take precedence over the ones the
    /// kernel derives from its inputs, also after the inputs or the kernel
    /// change.
    pub fn new(mut options: GeneratorOptions, kernel: Kernel) -> Result<Self, GeneratorError> {
        check_inputs(&kernel, &options.input_fields)?;
        let overrides = options.uniforms.clone();
        let mut uniforms = kernel.derive_uniforms(&options.input_fields);
        uniforms.append(&mut options.uniforms);
        options.uniforms = uniforms;
        let base = Generator::configure(options)?;
        Ok(Self {
            base,
            kernel,
            overrides,
            state: GeneratorState::Unbuilt,
            program: None,
            sources: None,
            framebuffer: None,
            quad: None,
            readback: ReadbackCache::default(),
        })
    }

    pub fn id(&self) -> GeneratorId {
        self.base.id()
    }

    pub fn base(&self) -> &Generator {
        &self.base
    }

    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    pub fn state(&self) -> GeneratorState {
        self.state
    }

    /// Source of the last assembled vertex stage, even if it failed to compile.
    pub fn vertex_source(&self) -> Option<&str> {
        self.sources
            .as_ref()
            .map(|sources| sources.vertex_source.as_str())
    }

    pub fn fragment_source(&self) -> Option<&str> {
        self.sources
            .as_ref()
            .map(|sources| sources.fragment_source.as_str())
    }

    pub fn readback_stats(&self) -> ReadbackStats {
        self.readback.stats()
    }

    pub fn set_uniform(&mut self, name: impl Into<String>, value: impl Into<UniformValue>) {
        let name = name.into();
        let value = value.into();
        self.overrides.insert(name.clone(), value);
        self.base.set_uniform(name, value);
    }

    fn rederive_uniforms(&mut self) {
        let derived = self.kernel.derive_uniforms(self.base.input_fields());
        self.base.merge_uniforms(derived);
        self.base.merge_uniforms(self.overrides.clone());
    }

    fn mark_stale(&mut self) {
        if self.state == GeneratorState::Built {
            self.state = GeneratorState::Stale;
        }
    }

    pub fn set_input_fields(&mut self, inputs: Vec<FieldRef>) -> Result<(), GeneratorError> {
        check_inputs(&self.kernel, &inputs)?;
        self.base.replace_inputs(inputs)?;
        self.rederive_uniforms();
        self.mark_stale();
        Ok(())
    }

    pub fn set_output_fields(&mut self, outputs: Vec<FieldRef>) -> Result<(), GeneratorError> {
        self.base.replace_outputs(outputs)?;
        self.readback.reset();
        self.mark_stale();
        Ok(())
    }

    pub fn set_kernel(&mut self, kernel: Kernel) -> Result<(), GeneratorError> {
        check_inputs(&kernel, self.base.input_fields())?;
        self.kernel = kernel;
        self.rederive_uniforms();
        self.mark_stale();
        Ok(())
    }

    fn discard_program(&mut self, ctx: &mut dyn GpuContext) {
        if let Some(program) = self.program.take() {
            ctx.delete_program(program.handle);
            ctx.delete_shader(program.vertex);
            ctx.delete_shader(program.fragment);
            self.mark_stale();
        }
    }

    /// Uploads inputs and allocates outputs whose textures are missing or old.
    fn upload_dirty_fields(&self, ctx: &mut dyn GpuContext) -> Result<usize, GeneratorError> {
        let mut uploaded = 0;
        for field in self.base.input_fields().iter().chain(self.base.output_fields()) {
            let mut field = field.borrow_mut();
            if field.needs_update() && field.upload_to_texture(ctx)? {
                uploaded += 1;
            }
        }
        Ok(uploaded)
    }

    /// Assembles, compiles and links the program for the current fields and
    /// kernel. On failure the previous program is gone and the generator is
    /// not `Built`.
    #[instrument(skip_all, fields(generator = %self.base.id(), kernel = self.kernel.label()))]
    pub fn rebuild_program(&mut self, ctx: &mut dyn GpuContext) -> Result<(), GeneratorError> {
        self.discard_program(ctx);

        let contributions: Vec<FieldContribution> = self
            .base
            .input_fields()
            .iter()
            .enumerate()
            .map(|(unit, field)| {
                let field = field.borrow();
                FieldContribution {
                    id: field.id(),
                    unit,
                    descriptor: field.sampling_descriptor(),
                }
            })
            .collect();
        let outputs = self.base.output_fields();
        let assembled = assemble(self.base.mode(), &self.kernel, &contributions, outputs.len())?;
        let layout = ProgramLayout {
            representation: self.base.representation(),
            input_units: contributions.len(),
            targets: outputs
                .iter()
                .map(|field| field.borrow().texture_format())
                .collect(),
            uniforms: assembled.uniforms.clone(),
        };
        let sources = self.sources.insert(assembled);

        let vertex = ctx
            .compile_shader(ShaderStage::Vertex, &sources.vertex_source)
            .map_err(|log| compile_failure(ShaderStage::Vertex, log, &sources.vertex_source))?;
        let fragment = match ctx.compile_shader(ShaderStage::Fragment, &sources.fragment_source) {
            Ok(fragment) => fragment,
            Err(log) => {
                ctx.delete_shader(vertex);
                return Err(compile_failure(
                    ShaderStage::Fragment,
                    log,
                    &sources.fragment_source,
                ));
            }
        };
        let handle = match ctx.link_program(vertex, fragment, &layout) {
            Ok(handle) => handle,
            Err(log) => {
                ctx.delete_shader(vertex);
                ctx.delete_shader(fragment);
                error!(%log, "program link failed");
                return Err(GeneratorError::ProgramLink { log });
            }
        };
        self.program = Some(LinkedProgram {
            handle,
            vertex,
            fragment,
            layout,
        });

        if self.quad.is_none() {
            let vertices = QuadGeometry::FULL_SCREEN.vertex_data();
            self.quad = Some(ctx.create_vertex_buffer("full screen quad", bytemuck::cast_slice(&vertices))?);
        }
        if self.framebuffer.is_none() {
            self.framebuffer = Some(ctx.create_framebuffer()?);
        }
        let uploaded = self.upload_dirty_fields(ctx)?;

        self.state = GeneratorState::Built;
        info!(uploaded, "program built");
        Ok(())
    }

    /// Fills a uniform block for the current program: generator uniforms
    /// first, then each input's uniforms.
    pub fn bind_uniforms(&self) -> Result<UniformBlock, GeneratorError> {
        let program = self.program.as_ref().ok_or(GeneratorError::ProgramNotBuilt)?;
        let layout = &program.layout.uniforms;
        let mut block = layout.new_block();
        let mut bind = |name: &str, value: &UniformValue| {
            let Some(location) = layout.location(name) else {
                trace!(name, "uniform not used by the program");
                return;
            };
            if let Err(mismatch) = block.write(location, value) {
                error!(
                    name,
                    declared = ?mismatch.declared,
                    given = ?mismatch.given,
                    "uniform type mismatch, value skipped"
                );
            }
        };
        for (name, value) in self.base.uniforms() {
            bind(name, value);
        }
        for field in self.base.input_fields() {
            for (name, value) in field.borrow().uniforms() {
                bind(&name, &value);
            }
        }
        Ok(block)
    }

    /// Texture per input unit. Inputs that changed since the build are
    /// uploaded first; an input without a texture leaves its unit empty.
    pub fn bind_input_textures(
        &mut self,
        ctx: &mut dyn GpuContext,
    ) -> Result<Vec<Option<TextureHandle>>, GeneratorError> {
        let mut textures = Vec::with_capacity(self.base.input_fields().len());
        for field in self.base.input_fields() {
            let mut field = field.borrow_mut();
            if field.needs_update() {
                field.upload_to_texture(ctx)?;
            }
            textures.push(field.texture());
        }
        Ok(textures)
    }

    /// Renders every depth slice into the outputs and reads each one back
    /// into outputs that keep host storage. Returns how many outputs were
    /// read back.
    pub fn generate_slices(
        &mut self,
        ctx: &mut dyn GpuContext,
        uniforms: &mut UniformBlock,
        textures: &[Option<TextureHandle>],
    ) -> Result<usize, GeneratorError> {
        let program = self.program.as_ref().ok_or(GeneratorError::ProgramNotBuilt)?;
        let framebuffer = self.framebuffer.ok_or(GeneratorError::ProgramNotBuilt)?;
        let quad = self.quad.ok_or(GeneratorError::ProgramNotBuilt)?;
        let slice_location = program.layout.uniforms.location(SLICE_UNIFORM).ok_or(
            CodegenError::UnresolvedSymbol {
                symbol: SLICE_UNIFORM.to_owned(),
            },
        )?;
        let mode = *self.base.mode();
        let outputs = self.base.output_fields();
        let first = outputs.first().ok_or(GeneratorError::NoOutputFields)?;
        let [width, height, depth] = first.borrow().dimensions();
        let pixels = width as usize * height as usize;
        let output_textures: Vec<_> = outputs.iter().map(|field| field.borrow().texture()).collect();
        let draw_buffers: Vec<usize> = (0..outputs.len()).collect();
        let vertex_count = QuadGeometry::FULL_SCREEN.vertex_count();

        let mut read_back = vec![false; outputs.len()];
        for slice in 0..depth {
            let coordinate = (0.5 + slice as f32) / depth as f32;
            if let Err(mismatch) = uniforms.write(slice_location, &UniformValue::Float(coordinate)) {
                error!(declared = ?mismatch.declared, "slice uniform has the wrong type");
            }
            for (attachment, texture) in output_textures.iter().enumerate() {
                ctx.attach_texture_layer(framebuffer, attachment, *texture, slice)?;
            }
            ctx.set_draw_buffers(framebuffer, &draw_buffers)?;
            let status = ctx.framebuffer_status(framebuffer)?;
            if status != FramebufferStatus::Complete {
                error!(status = status.name(), slice, "framebuffer incomplete");
                return Err(GeneratorError::FramebufferIncomplete {
                    reason: status.name(),
                });
            }
            ctx.draw(&DrawCall {
                program: program.handle,
                framebuffer,
                viewport: [width, height],
                vertex_buffer: quad,
                vertex_count,
                uniforms: uniforms.as_bytes(),
                textures,
            })?;

            for (attachment, output) in outputs.iter().enumerate() {
                let mut output = output.borrow_mut();
                let Some(data) = output.generated_data_mut() else {
                    continue;
                };
                let path = self.readback.negotiate(attachment, mode.read_format, || {
                    ctx.implementation_read_format(framebuffer, attachment)
                });
                let destination = data.slice_bytes_mut(slice as usize)?;
                match path {
                    ReadPath::Native => {
                        ctx.read_pixels(
                            framebuffer,
                            attachment,
                            [width, height],
                            mode.read_format,
                            destination,
                        )?;
                        self.readback.record_native_read();
                    }
                    ReadPath::Fallback => {
                        let buffer = self.readback.fallback_buffer(
                            attachment,
                            mode.representation,
                            mode.fallback_components,
                            pixels,
                        );
                        ctx.read_pixels(
                            framebuffer,
                            attachment,
                            [width, height],
                            mode.fallback_format,
                            buffer.as_bytes_mut(),
                        )?;
                        // keep only the first component of each pixel
                        convert_pixels(
                            buffer.as_bytes_mut(),
                            mode.fallback_format,
                            destination,
                            mode.read_format,
                        )?;
                    }
                }
                read_back[attachment] = true;
            }
        }
        Ok(read_back.into_iter().filter(|done| *done).count())
    }

    /// Renders the outputs, rebuilding the program first if needed.
    #[instrument(skip_all, fields(generator = %self.base.id()))]
    pub fn generate(&mut self, ctx: &mut dyn GpuContext) -> Result<GenerationReport, GeneratorError> {
        let start = Instant::now();
        if self.state != GeneratorState::Built {
            self.rebuild_program(ctx)?;
        }
        let mut uniforms = self.bind_uniforms()?;
        let textures = self.bind_input_textures(ctx)?;
        let outputs_read_back = self.generate_slices(ctx, &mut uniforms, &textures)?;
        let slices = self
            .base
            .output_fields()
            .first()
            .map_or(0, |field| field.borrow().dimensions()[2]);
        let report = GenerationReport {
            slices,
            outputs_read_back,
            elapsed: start.elapsed(),
        };
        debug!(
            slices,
            outputs_read_back,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "generation finished"
        );
        Ok(report)
    }

    /// Frees the program, framebuffer and quad, and gives up the claim on the
    /// output fields.
    pub fn dispose(mut self, ctx: &mut dyn GpuContext) {
        self.discard_program(ctx);
        if let Some(framebuffer) = self.framebuffer.take() {
            ctx.delete_framebuffer(framebuffer);
        }
        if let Some(quad) = self.quad.take() {
            ctx.delete_buffer(quad);
        }
        self.base.release_outputs();
        debug!(generator = %self.base.id(), "generator disposed");
    }
}
