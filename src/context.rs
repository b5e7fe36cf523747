//! The seam between the generation pipeline and the graphics driver.
//!
//! Resources are referred to by opaque handles so a generator never holds a
//! borrow of the context between calls. [`WgpuContext`](crate::WgpuContext)
//! is the production implementation.

use crate::enums::{FramebufferStatus, Representation, ShaderStage};
use crate::error::GpuError;
use crate::readback::ReadFormat;
use crate::uniforms::UniformLayout;

macro_rules! handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u64);
    };
}

handle!(
    /// A 3D texture owned by a field.
    TextureHandle
);
handle!(ShaderHandle);
handle!(ProgramHandle);
handle!(FramebufferHandle);
handle!(BufferHandle);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TextureDescriptor<'a> {
    pub label: &'a str,
    /// `[width, height, depth]`
    pub dimensions: [u32; 3],
    pub format: wgpu::TextureFormat,
}

/// Everything a linked program needs besides its two stages.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProgramLayout {
    pub representation: Representation,
    /// Number of input texture units, bound at 1..=n after the sampler.
    pub input_units: usize,
    /// One format per color target, in attachment order.
    pub targets: Vec<wgpu::TextureFormat>,
    pub uniforms: UniformLayout,
}

/// A quad covering clip space, drawn as a four-vertex triangle strip.
///
/// Framebuffer rows run top-down, so the texture coordinates are flipped
/// vertically to keep row `y` of the output aligned with row `y` of the input.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct QuadGeometry {
    pub positions: [[f32; 2]; 4],
    pub texture_coordinates: [[f32; 2]; 4],
}

impl QuadGeometry {
    pub const FULL_SCREEN: QuadGeometry = QuadGeometry {
        positions: [[-1.0, -1.0], [1.0, -1.0], [-1.0, 1.0], [1.0, 1.0]],
        texture_coordinates: [[0.0, 1.0], [1.0, 1.0], [0.0, 0.0], [1.0, 0.0]],
    };

    /// Bytes per vertex: position then texture coordinate.
    pub const STRIDE: u64 = 16;

    pub fn vertex_count(&self) -> u32 {
        self.positions.len() as u32
    }

    /// Interleaved `[x, y, s, t]` floats.
    pub fn vertex_data(&self) -> Vec<f32> {
        self.positions
            .iter()
            .zip(&self.texture_coordinates)
            .flat_map(|(position, coordinate)| [position[0], position[1], coordinate[0], coordinate[1]])
            .collect()
    }
}

/// One full-screen draw into the current attachments of a framebuffer.
#[derive(Clone, Copy, Debug)]
pub struct DrawCall<'a> {
    pub program: ProgramHandle,
    pub framebuffer: FramebufferHandle,
    /// `[width, height]`
    pub viewport: [u32; 2],
    pub vertex_buffer: BufferHandle,
    pub vertex_count: u32,
    /// Contents of the uniform block.
    pub uniforms: &'a [u8],
    /// Texture per input unit. `None` leaves the unit without a texture.
    pub textures: &'a [Option<TextureHandle>],
}

pub trait GpuContext {
    fn create_texture(&mut self, descriptor: &TextureDescriptor<'_>)
    -> Result<TextureHandle, GpuError>;

    /// Replaces the whole texture with tightly packed texels in the texture's
    /// format, slice after slice.
    fn write_texture(&mut self, texture: TextureHandle, data: &[u8]) -> Result<(), GpuError>;

    fn delete_texture(&mut self, texture: TextureHandle);

    fn create_vertex_buffer(&mut self, label: &str, data: &[u8]) -> Result<BufferHandle, GpuError>;

    fn delete_buffer(&mut self, buffer: BufferHandle);

    /// Compiles one stage. The error is the driver's diagnostic log.
    fn compile_shader(&mut self, stage: ShaderStage, source: &str)
    -> Result<ShaderHandle, String>;

    fn delete_shader(&mut self, shader: ShaderHandle);

    /// Links two compiled stages. The error is the driver's diagnostic log.
    fn link_program(
        &mut self,
        vertex: ShaderHandle,
        fragment: ShaderHandle,
        layout: &ProgramLayout,
    ) -> Result<ProgramHandle, String>;

    fn delete_program(&mut self, program: ProgramHandle);

    fn create_framebuffer(&mut self) -> Result<FramebufferHandle, GpuError>;

    fn delete_framebuffer(&mut self, framebuffer: FramebufferHandle);

    /// Points color attachment `attachment` at depth layer `layer` of
    /// `texture`, or detaches it.
    fn attach_texture_layer(
        &mut self,
        framebuffer: FramebufferHandle,
        attachment: usize,
        texture: Option<TextureHandle>,
        layer: u32,
    ) -> Result<(), GpuError>;

    /// Attachments that receive fragment outputs, in output location order.
    fn set_draw_buffers(
        &mut self,
        framebuffer: FramebufferHandle,
        attachments: &[usize],
    ) -> Result<(), GpuError>;

    fn framebuffer_status(
        &mut self,
        framebuffer: FramebufferHandle,
    ) -> Result<FramebufferStatus, GpuError>;

    fn draw(&mut self, call: &DrawCall<'_>) -> Result<(), GpuError>;

    /// Layout in which `attachment` can be read without conversion.
    fn implementation_read_format(
        &mut self,
        framebuffer: FramebufferHandle,
        attachment: usize,
    ) -> Option<ReadFormat>;

    /// Reads the current layer of `attachment` into `destination`, tightly
    /// packed in `format`.
    fn read_pixels(
        &mut self,
        framebuffer: FramebufferHandle,
        attachment: usize,
        size: [u32; 2],
        format: ReadFormat,
        destination: &mut [u8],
    ) -> Result<(), GpuError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quad_flips_texture_rows() {
        let data = QuadGeometry::FULL_SCREEN.vertex_data();
        assert_eq!(data.len(), 16);
        // top-left corner of clip space samples the first texture row
        assert_eq!(&data[8..12], &[-1.0, 1.0, 0.0, 0.0]);
        assert_eq!(
            QuadGeometry::STRIDE as usize,
            4 * std::mem::size_of::<f32>()
        );
    }
}
