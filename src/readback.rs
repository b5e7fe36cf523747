//! Pixel read formats, format conversion and the per-attachment readback
//! negotiation used by the slice loop.

use std::fmt;

use half::f16;
use tracing::info;

use crate::enums::{PixelFormat, PixelType, Representation};
use crate::error::ReadbackError;

/// A `(format, type)` pair describing how pixels are laid out in a read.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ReadFormat {
    pub format: PixelFormat,
    pub ty: PixelType,
}

impl ReadFormat {
    pub const fn new(format: PixelFormat, ty: PixelType) -> Self {
        Self { format, ty }
    }

    pub fn components(&self) -> usize {
        self.format.components()
    }

    pub fn bytes_per_pixel(&self) -> usize {
        self.format.components() * self.ty.size()
    }
}

impl fmt::Display for ReadFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.format.name(), self.ty.name())
    }
}

/// Native read layout of a texture format, `None` for formats the pipeline
/// never renders to.
pub fn read_format_of(format: wgpu::TextureFormat) -> Option<ReadFormat> {
    use wgpu::TextureFormat as T;
    let read = match format {
        T::R16Sint => ReadFormat::new(PixelFormat::RedInteger, PixelType::Short),
        T::R32Sint => ReadFormat::new(PixelFormat::RedInteger, PixelType::Int),
        T::R16Float => ReadFormat::new(PixelFormat::Red, PixelType::HalfFloat),
        T::R32Float => ReadFormat::new(PixelFormat::Red, PixelType::Float),
        T::Rgba16Sint => ReadFormat::new(PixelFormat::RgbaInteger, PixelType::Short),
        T::Rgba32Sint => ReadFormat::new(PixelFormat::RgbaInteger, PixelType::Int),
        T::Rgba16Float => ReadFormat::new(PixelFormat::Rgba, PixelType::HalfFloat),
        T::Rgba32Float => ReadFormat::new(PixelFormat::Rgba, PixelType::Float),
        _ => return None,
    };
    Some(read)
}

fn read_component(bytes: &[u8], ty: PixelType, index: usize) -> f64 {
    let start = index * ty.size();
    let bytes = &bytes[start..start + ty.size()];
    match ty {
        PixelType::Short => f64::from(bytemuck::pod_read_unaligned::<i16>(bytes)),
        PixelType::Int => f64::from(bytemuck::pod_read_unaligned::<i32>(bytes)),
        PixelType::Float => f64::from(bytemuck::pod_read_unaligned::<f32>(bytes)),
        PixelType::HalfFloat => {
            f16::from_bits(bytemuck::pod_read_unaligned::<u16>(bytes)).to_f64()
        }
    }
}

fn write_component(bytes: &mut [u8], ty: PixelType, index: usize, value: f64) {
    let start = index * ty.size();
    let target = &mut bytes[start..start + ty.size()];
    match ty {
        PixelType::Short => target.copy_from_slice(bytemuck::bytes_of(&(value as i16))),
        PixelType::Int => target.copy_from_slice(bytemuck::bytes_of(&(value as i32))),
        PixelType::Float => target.copy_from_slice(bytemuck::bytes_of(&(value as f32))),
        PixelType::HalfFloat => {
            target.copy_from_slice(bytemuck::bytes_of(&f16::from_f64(value).to_bits()))
        }
    }
}

/// Converts tightly packed pixels between read layouts.
///
/// Integer and floating point layouts never convert into each other. Missing
/// components are filled with 0, alpha with 1.
pub fn convert_pixels(
    src: &[u8],
    from: ReadFormat,
    dst: &mut [u8],
    to: ReadFormat,
) -> Result<(), ReadbackError> {
    if from.format.is_integer() != to.format.is_integer()
        || from.ty.is_integer() != to.ty.is_integer()
    {
        return Err(ReadbackError::IncompatibleFormats { from, to });
    }
    if src.len() % from.bytes_per_pixel() != 0 {
        return Err(ReadbackError::SizeMismatch {
            expected: src.len() - src.len() % from.bytes_per_pixel(),
            found: src.len(),
        });
    }
    let pixels = src.len() / from.bytes_per_pixel();
    let expected = pixels * to.bytes_per_pixel();
    if dst.len() != expected {
        return Err(ReadbackError::SizeMismatch {
            expected,
            found: dst.len(),
        });
    }
    if from == to {
        dst.copy_from_slice(src);
        return Ok(());
    }

    let (from_components, to_components) = (from.components(), to.components());
    for pixel in 0..pixels {
        for component in 0..to_components {
            let value = if component < from_components {
                read_component(src, from.ty, pixel * from_components + component)
            } else if component == 3 {
                1.0
            } else {
                0.0
            };
            write_component(dst, to.ty, pixel * to_components + component, value);
        }
    }
    Ok(())
}

/// Widened scratch storage for one attachment.
#[derive(Debug)]
pub enum FallbackBuffer {
    Integer(Vec<i32>),
    Float(Vec<f32>),
}

impl FallbackBuffer {
    fn new(representation: Representation, components: usize, pixels: usize) -> Self {
        match representation {
            Representation::Integer => FallbackBuffer::Integer(vec![0; components * pixels]),
            Representation::Float => FallbackBuffer::Float(vec![0.0; components * pixels]),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            FallbackBuffer::Integer(values) => values.len(),
            FallbackBuffer::Float(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        match self {
            FallbackBuffer::Integer(values) => bytemuck::cast_slice_mut(values),
            FallbackBuffer::Float(values) => bytemuck::cast_slice_mut(values),
        }
    }
}

/// Which read path an attachment uses once negotiated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadPath {
    Native,
    Fallback,
}

/// Counters exposed for diagnostics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReadbackStats {
    pub negotiations: usize,
    pub native_reads: usize,
    pub fallback_reads: usize,
    pub fallback_allocations: usize,
}

/// Per-attachment negotiation outcome and fallback buffers of one generator.
#[derive(Debug, Default)]
pub(crate) struct ReadbackCache {
    paths: Vec<Option<ReadPath>>,
    buffers: Vec<Option<FallbackBuffer>>,
    stats: ReadbackStats,
}

impl ReadbackCache {
    /// Forgets every negotiation and buffer, used when the outputs change.
    pub(crate) fn reset(&mut self) {
        self.paths.clear();
        self.buffers.clear();
    }

    pub(crate) fn stats(&self) -> ReadbackStats {
        self.stats
    }

    /// Returns the cached path for `attachment`, asking the driver only the
    /// first time.
    pub(crate) fn negotiate(
        &mut self,
        attachment: usize,
        expected: ReadFormat,
        native: impl FnOnce() -> Option<ReadFormat>,
    ) -> ReadPath {
        if self.paths.len() <= attachment {
            self.paths.resize(attachment + 1, None);
        }
        if let Some(path) = self.paths[attachment] {
            return path;
        }
        self.stats.negotiations += 1;
        let native = native();
        let path = if native == Some(expected) {
            ReadPath::Native
        } else {
            info!(
                attachment,
                native = %native.map_or_else(|| "none".to_owned(), |n| n.to_string()),
                expected = %expected,
                "framebuffer read not supported, using slower fallback method"
            );
            ReadPath::Fallback
        };
        self.paths[attachment] = Some(path);
        path
    }

    pub(crate) fn record_native_read(&mut self) {
        self.stats.native_reads += 1;
    }

    /// Fallback buffer for `attachment`, allocated on first use.
    pub(crate) fn fallback_buffer(
        &mut self,
        attachment: usize,
        representation: Representation,
        components: usize,
        pixels: usize,
    ) -> &mut FallbackBuffer {
        if self.buffers.len() <= attachment {
            self.buffers.resize_with(attachment + 1, || None);
        }
        let slot = &mut self.buffers[attachment];
        let fits = slot
            .as_ref()
            .is_some_and(|buffer| buffer.len() == components * pixels);
        if !fits {
            self.stats.fallback_allocations += 1;
            *slot = Some(FallbackBuffer::new(representation, components, pixels));
        }
        self.stats.fallback_reads += 1;
        slot.get_or_insert_with(|| FallbackBuffer::new(representation, components, pixels))
    }
}
