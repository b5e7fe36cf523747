//! Numeric representation, field bookkeeping and construction-time checks
//! shared by every generator.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use crate::enums::{PixelFormat, PixelType, Representation};
use crate::error::GeneratorError;
use crate::fields::FieldRef;
use crate::readback::ReadFormat;
use crate::uniforms::{UniformValue, Uniforms};

static NEXT_GENERATOR_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a generator, recorded on the output fields it claims.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GeneratorId(u64);

impl GeneratorId {
    pub(crate) fn next() -> Self {
        Self(NEXT_GENERATOR_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for GeneratorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "generator-{}", self.0)
    }
}

/// Shader types and read layouts that follow from the representation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FormatMode {
    pub representation: Representation,
    /// WGSL type of every input texture binding.
    pub sampler_type: &'static str,
    /// Element type written to every color target.
    pub buffer_type: &'static str,
    /// Layout of one slice in a field's host backing store.
    pub read_format: ReadFormat,
    /// Widened layout requested when the native read does not match.
    pub fallback_format: ReadFormat,
    pub fallback_components: usize,
}

impl FormatMode {
    pub const INTEGER: FormatMode = FormatMode {
        representation: Representation::Integer,
        sampler_type: "texture_3d<i32>",
        buffer_type: "i32",
        read_format: ReadFormat::new(PixelFormat::RedInteger, PixelType::Short),
        fallback_format: ReadFormat::new(PixelFormat::RgbaInteger, PixelType::Int),
        fallback_components: 4,
    };

    pub const FLOAT: FormatMode = FormatMode {
        representation: Representation::Float,
        sampler_type: "texture_3d<f32>",
        buffer_type: "f32",
        read_format: ReadFormat::new(PixelFormat::Red, PixelType::Float),
        fallback_format: ReadFormat::new(PixelFormat::Rgba, PixelType::Float),
        fallback_components: 4,
    };

    pub fn for_representation(representation: Representation) -> Self {
        match representation {
            Representation::Integer => Self::INTEGER,
            Representation::Float => Self::FLOAT,
        }
    }

    /// Size in bytes of one backing store element.
    pub fn element_size(&self) -> usize {
        self.read_format.ty.size()
    }
}

/// Recognized construction options.
#[derive(Default)]
pub struct GeneratorOptions {
    pub input_fields: Vec<FieldRef>,
    pub output_fields: Vec<FieldRef>,
    pub uniforms: Uniforms,
    pub integer_representation: bool,
}

/// State every generator holds independently of its kernel.
pub struct Generator {
    id: GeneratorId,
    mode: FormatMode,
    uniforms: Uniforms,
    inputs: Vec<FieldRef>,
    outputs: Vec<FieldRef>,
}

impl Generator {
    /// Validates the field lists and claims the output fields. Does not touch
    /// the GPU.
    pub fn configure(options: GeneratorOptions) -> Result<Self, GeneratorError> {
        let representation = if options.integer_representation {
            Representation::Integer
        } else {
            Representation::Float
        };
        let id = GeneratorId::next();
        let mode = FormatMode::for_representation(representation);
        validate_fields(id, &mode, &options.input_fields, &options.output_fields)?;
        claim(id, &options.output_fields);
        debug!(
            %id,
            %representation,
            inputs = options.input_fields.len(),
            outputs = options.output_fields.len(),
            "generator configured"
        );
        Ok(Self {
            id,
            mode,
            uniforms: options.uniforms,
            inputs: options.input_fields,
            outputs: options.output_fields,
        })
    }

    pub fn id(&self) -> GeneratorId {
        self.id
    }

    pub fn mode(&self) -> &FormatMode {
        &self.mode
    }

    pub fn representation(&self) -> Representation {
        self.mode.representation
    }

    pub fn uniforms(&self) -> &Uniforms {
        &self.uniforms
    }

    pub fn set_uniform(&mut self, name: impl Into<String>, value: impl Into<UniformValue>) {
        self.uniforms.insert(name.into(), value.into());
    }

    pub(crate) fn merge_uniforms(&mut self, uniforms: Uniforms) {
        self.uniforms.extend(uniforms);
    }

    pub fn input_fields(&self) -> &[FieldRef] {
        &self.inputs
    }

    pub fn output_fields(&self) -> &[FieldRef] {
        &self.outputs
    }

    pub(crate) fn replace_inputs(&mut self, inputs: Vec<FieldRef>) -> Result<(), GeneratorError> {
        validate_fields(self.id, &self.mode, &inputs, &self.outputs)?;
        self.inputs = inputs;
        Ok(())
    }

    pub(crate) fn replace_outputs(&mut self, outputs: Vec<FieldRef>) -> Result<(), GeneratorError> {
        release(self.id, &self.outputs);
        if let Err(err) = validate_fields(self.id, &self.mode, &self.inputs, &outputs) {
            claim(self.id, &self.outputs);
            return Err(err);
        }
        claim(self.id, &outputs);
        self.outputs = outputs;
        Ok(())
    }

    /// Drops the claim on every output field.
    pub(crate) fn release_outputs(&mut self) {
        release(self.id, &self.outputs);
    }
}

fn claim(id: GeneratorId, outputs: &[FieldRef]) {
    for field in outputs {
        field.borrow_mut().set_generator(Some(id));
    }
}

fn release(id: GeneratorId, outputs: &[FieldRef]) {
    for field in outputs {
        let mut field = field.borrow_mut();
        if field.generator() == Some(id) {
            field.set_generator(None);
        }
    }
}

fn validate_fields(
    id: GeneratorId,
    mode: &FormatMode,
    inputs: &[FieldRef],
    outputs: &[FieldRef],
) -> Result<(), GeneratorError> {
    let first = outputs.first().ok_or(GeneratorError::NoOutputFields)?;
    let expected = first.borrow().dimensions();

    let mut seen = HashSet::new();
    for field in inputs.iter().chain(outputs) {
        let field = field.borrow();
        if !seen.insert(field.id()) {
            return Err(GeneratorError::DuplicateFieldId(field.id()));
        }
        if field.representation() != mode.representation {
            return Err(GeneratorError::RepresentationMismatch {
                field: field.id(),
                expected: mode.representation,
                found: field.representation(),
            });
        }
    }

    for field in outputs {
        let field = field.borrow();
        if field.generator().is_some_and(|owner| owner != id) {
            return Err(GeneratorError::FieldAlreadyClaimed(field.id()));
        }
        if field.dimensions() != expected {
            return Err(GeneratorError::MismatchedOutputDimensions {
                field: field.id(),
                expected,
                found: field.dimensions(),
            });
        }
    }
    Ok(())
}

/// Prefixes every line with its 1-based number.
pub fn annotate_source(source: &str) -> String {
    let width = source.lines().count().max(1).to_string().len();
    source
        .lines()
        .enumerate()
        .map(|(index, line)| format!("{:>width$}: {line}\n", index + 1))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use ndarray::Array3;

    use super::*;
    use crate::fields::{FieldId, ImageField};
    use crate::volume::{Volume, VolumeGeometry, VoxelData};

    fn field(id: u32, shape: (usize, usize, usize), integer: bool) -> FieldRef {
        let data = if integer {
            VoxelData::Integer(Array3::zeros(shape))
        } else {
            VoxelData::Float(Array3::zeros(shape))
        };
        Rc::new(RefCell::new(ImageField::new(
            FieldId::new(id),
            Volume::new(data, VolumeGeometry::default()),
        )))
    }

    #[test]
    fn integer_mode_reads_shorts_and_widens_to_ints() {
        let mode = FormatMode::for_representation(Representation::Integer);
        assert_eq!(mode.sampler_type, "texture_3d<i32>");
        assert_eq!(mode.read_format.to_string(), "RED_INTEGER/SHORT");
        assert_eq!(mode.fallback_format.to_string(), "RGBA_INTEGER/INT");
        assert_eq!(mode.fallback_components, 4);
        assert_eq!(mode.element_size(), 2);
    }

    #[test]
    fn configure_claims_outputs() {
        let output = field(2, (2, 4, 4), false);
        let generator = Generator::configure(GeneratorOptions {
            input_fields: vec![field(1, (2, 4, 4), false)],
            output_fields: vec![output.clone()],
            ..Default::default()
        })
        .unwrap();
        assert_eq!(output.borrow().generator(), Some(generator.id()));
    }

    #[test]
    fn rejects_missing_outputs() {
        let result = Generator::configure(GeneratorOptions {
            input_fields: vec![field(1, (2, 4, 4), false)],
            ..Default::default()
        });
        assert!(matches!(result, Err(GeneratorError::NoOutputFields)));
    }

    #[test]
    fn rejects_colliding_ids() {
        let result = Generator::configure(GeneratorOptions {
            input_fields: vec![field(7, (2, 4, 4), false)],
            output_fields: vec![field(7, (2, 4, 4), false)],
            ..Default::default()
        });
        assert!(matches!(
            result,
            Err(GeneratorError::DuplicateFieldId(id)) if id == FieldId::new(7)
        ));
    }

    #[test]
    fn rejects_mixed_representations() {
        let result = Generator::configure(GeneratorOptions {
            input_fields: vec![field(1, (2, 4, 4), false)],
            output_fields: vec![field(2, (2, 4, 4), true)],
            integer_representation: true,
            ..Default::default()
        });
        assert!(matches!(
            result,
            Err(GeneratorError::RepresentationMismatch { found: Representation::Float, .. })
        ));
    }

    #[test]
    fn rejects_outputs_of_different_sizes() {
        let result = Generator::configure(GeneratorOptions {
            output_fields: vec![field(1, (2, 4, 4), false), field(2, (3, 4, 4), false)],
            ..Default::default()
        });
        assert!(matches!(
            result,
            Err(GeneratorError::MismatchedOutputDimensions { found: [4, 4, 3], .. })
        ));
    }

    #[test]
    fn a_field_has_one_writer() {
        let output = field(2, (2, 4, 4), false);
        let _first = Generator::configure(GeneratorOptions {
            output_fields: vec![output.clone()],
            ..Default::default()
        })
        .unwrap();
        let second = Generator::configure(GeneratorOptions {
            output_fields: vec![output],
            ..Default::default()
        });
        assert!(matches!(second, Err(GeneratorError::FieldAlreadyClaimed(_))));
    }

    #[test]
    fn annotates_each_line() {
        let annotated = annotate_source("fn a() {}\nfn b() {}\n".repeat(5).as_str());
        let lines: Vec<_> = annotated.lines().collect();
        assert_eq!(lines.len(), 10);
        assert_eq!(lines[0], " 1: fn a() {}");
        assert_eq!(lines[9], "10: fn b() {}");
    }
}
