//! Error types for generation, shader assembly, readback and the GPU context.

use thiserror::Error;

use crate::enums::{Representation, ShaderStage};
use crate::fields::FieldId;
use crate::readback::ReadFormat;

#[derive(Debug, Error)]
pub enum GeneratorError {
    #[error("could not compile {stage} shader: {log}")]
    ShaderCompile {
        stage: ShaderStage,
        log: String,
        /// Full stage source, each line prefixed by its number.
        annotated_source: String,
    },

    #[error("could not link program: {log}")]
    ProgramLink { log: String },

    #[error("incomplete framebuffer: {reason}")]
    FramebufferIncomplete { reason: &'static str },

    #[error("no program has been built")]
    ProgramNotBuilt,

    #[error("a generator needs at least one output field")]
    NoOutputFields,

    #[error("kernel {kernel} needs {expected} input fields, {found} bound")]
    MissingInputs {
        kernel: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("field id {0} is bound more than once")]
    DuplicateFieldId(FieldId),

    #[error("field {0} is already written by another generator")]
    FieldAlreadyClaimed(FieldId),

    #[error("output field {field} has dimensions {found:?}, expected {expected:?}")]
    MismatchedOutputDimensions {
        field: FieldId,
        expected: [u32; 3],
        found: [u32; 3],
    },

    #[error("field {field} is {found} but the generator works in {expected}")]
    RepresentationMismatch {
        field: FieldId,
        expected: Representation,
        found: Representation,
    },

    #[error(transparent)]
    Codegen(#[from] CodegenError),

    #[error(transparent)]
    Gpu(#[from] GpuError),

    #[error(transparent)]
    Readback(#[from] ReadbackError),

    #[error(transparent)]
    Field(#[from] FieldError),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodegenError {
    #[error("unresolved shader symbol `{symbol}`")]
    UnresolvedSymbol { symbol: String },

    #[error("unterminated `${{` token in shader template")]
    UnterminatedToken,

    #[error("shader symbol `{0}` is declared twice")]
    DuplicateSymbol(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReadbackError {
    #[error("cannot convert pixels from {from} to {to}")]
    IncompatibleFormats { from: ReadFormat, to: ReadFormat },

    #[error("pixel buffer holds {found} bytes, expected {expected}")]
    SizeMismatch { expected: usize, found: usize },

    #[error("slice {index} is outside a volume of depth {depth}")]
    SliceOutOfRange { index: usize, depth: usize },

    #[error("host storage is not contiguous")]
    NonContiguous,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FieldError {
    #[error("field {0} is filled by its generator and cannot take source data")]
    GeneratorAuthored(FieldId),

    #[error("data of shape {found:?} does not fit a field of shape {expected:?}")]
    ShapeMismatch {
        expected: (usize, usize, usize),
        found: (usize, usize, usize),
    },

    #[error("data is {found} but the field holds {expected} voxels")]
    RepresentationMismatch {
        expected: Representation,
        found: Representation,
    },

    #[error("texture format {0:?} cannot hold this field")]
    UnsupportedTextureFormat(wgpu::TextureFormat),
}

/// Errors raised by a [`GpuContext`](crate::context::GpuContext) implementation.
#[derive(Debug, Error)]
pub enum GpuError {
    #[error("failed to request GPU adapter: {0}")]
    AdapterNotFound(#[from] wgpu::RequestAdapterError),

    #[error("failed to request GPU device: {0}")]
    DeviceRequestFailed(#[from] wgpu::RequestDeviceError),

    #[error("unknown {kind} handle {id}")]
    UnknownHandle { kind: &'static str, id: u64 },

    #[error("texture format {0:?} cannot be read back")]
    UnsupportedFormat(wgpu::TextureFormat),

    #[error("buffer mapping failed: {0}")]
    BufferMapping(String),

    #[error("driver rejected the operation: {0}")]
    Validation(String),

    #[error(transparent)]
    Readback(#[from] ReadbackError),

    #[error(transparent)]
    Field(#[from] FieldError),
}
