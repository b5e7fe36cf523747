//! Renders the vertex and fragment WGSL of a generator from typed per-field
//! sampling descriptors and the kernel body.
//!
//! Every field contributes uniforms, helper functions and a
//! `sample_field` body. Bodies refer to their own symbols as `${name}`; the
//! assembler rewrites those into names suffixed with the field id, so two
//! fields never share a symbol. Kernel bodies reach an input's symbols with
//! `${inputN.name}` and their own uniforms with `${name}`.

use std::collections::HashSet;
use std::fmt::Write as _;

use tracing::trace;

use crate::enums::Representation;
use crate::error::CodegenError;
use crate::fields::FieldId;
use crate::generator::FormatMode;
use crate::kernel::Kernel;
use crate::uniforms::{SLICE_UNIFORM, UniformDecl, UniformLayout, UniformType};

/// Token that resolves to the field's texture fetch function.
pub const TEXEL_TOKEN: &str = "texel";
/// Name of the mandatory sampling function of every field.
pub const SAMPLE_FUNCTION: &str = "sample_field";

/// A helper function declared by a field.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShaderFunction {
    pub name: String,
    /// WGSL parameter list without parentheses.
    pub parameters: String,
    pub return_type: String,
    pub body: String,
}

impl ShaderFunction {
    pub fn new(
        name: impl Into<String>,
        parameters: impl Into<String>,
        return_type: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            parameters: parameters.into(),
            return_type: return_type.into(),
            body: body.into(),
        }
    }
}

/// What a field contributes to a program.
///
/// `sample_body` is the body of `fn sample_field(point: vec3<f32>) -> FieldSample`,
/// where `point` is in patient coordinates.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SamplingDescriptor {
    pub uniforms: Vec<UniformDecl>,
    pub functions: Vec<ShaderFunction>,
    pub sample_body: String,
}

/// A descriptor bound to the field and texture unit it belongs to.
#[derive(Clone, Debug)]
pub struct FieldContribution {
    pub id: FieldId,
    pub unit: usize,
    pub descriptor: SamplingDescriptor,
}

/// Output of [`assemble`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AssembledProgram {
    pub vertex_source: String,
    pub fragment_source: String,
    pub uniforms: UniformLayout,
}

/// Expands every `${symbol}` in `template` through `resolve`.
pub fn render_template(
    template: &str,
    mut resolve: impl FnMut(&str) -> Option<String>,
) -> Result<String, CodegenError> {
    let mut rendered = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        rendered.push_str(&rest[..start]);
        let token = &rest[start + 2..];
        let end = token.find('}').ok_or(CodegenError::UnterminatedToken)?;
        let symbol = token[..end].trim();
        let replacement = resolve(symbol).ok_or_else(|| CodegenError::UnresolvedSymbol {
            symbol: symbol.to_owned(),
        })?;
        rendered.push_str(&replacement);
        rest = &token[end + 1..];
    }
    rendered.push_str(rest);
    Ok(rendered)
}

/// Formats a float so WGSL parses it as `f32`.
pub(crate) fn wgsl_float(value: f32) -> String {
    let text = format!("{value:?}");
    if text.contains(['.', 'e', 'E']) {
        text
    } else {
        format!("{text}.0")
    }
}

struct FieldSymbols<'a> {
    contribution: &'a FieldContribution,
}

impl FieldSymbols<'_> {
    fn resolve(&self, symbol: &str) -> Option<String> {
        let contribution = self.contribution;
        if symbol == TEXEL_TOKEN {
            return Some(format!("fetch_input{}", contribution.unit));
        }
        if symbol == SAMPLE_FUNCTION
            || contribution
                .descriptor
                .functions
                .iter()
                .any(|function| function.name == symbol)
        {
            return Some(contribution.id.namespaced(symbol));
        }
        contribution
            .descriptor
            .uniforms
            .iter()
            .any(|uniform| uniform.name == symbol)
            .then(|| format!("uniforms.{}", contribution.id.namespaced(symbol)))
    }
}

fn fetch_function(unit: usize, representation: Representation) -> String {
    match representation {
        Representation::Float => format!(
            "fn fetch_input{unit}(stp: vec3<f32>) -> vec4<f32> {{\n    \
             return textureSampleLevel(input_texture{unit}, input_sampler, stp, 0.0);\n}}\n"
        ),
        Representation::Integer => format!(
            "fn fetch_input{unit}(stp: vec3<f32>) -> vec4<f32> {{\n    \
             let size = vec3<i32>(textureDimensions(input_texture{unit}));\n    \
             let coordinate = clamp(vec3<i32>(floor(stp * vec3<f32>(size))), vec3<i32>(0), size - vec3<i32>(1));\n    \
             return vec4<f32>(textureLoad(input_texture{unit}, coordinate, 0));\n}}\n"
        ),
    }
}

const VARYINGS: &str = "struct VertexOutput {
    @builtin(position) position: vec4<f32>,
    @location(0) texture_coordinate: vec3<f32>,
}
";

const FIELD_SAMPLE: &str = "struct FieldSample {
    value: f32,
    normal: vec3<f32>,
    gradient_magnitude: f32,
}
";

fn uniform_block(layout: &UniformLayout) -> String {
    format!(
        "{}@group(0) @binding(0) var<uniform> uniforms: Uniforms;\n",
        layout.wgsl_struct()
    )
}

fn vertex_source(layout: &UniformLayout) -> String {
    format!(
        "{}\n{VARYINGS}
struct VertexInput {{
    @location(0) position: vec2<f32>,
    @location(1) texture_coordinate: vec2<f32>,
}}

@vertex
fn main(attributes: VertexInput) -> VertexOutput {{
    var result: VertexOutput;
    result.position = vec4<f32>(attributes.position, 0.0, 1.0);
    result.texture_coordinate = vec3<f32>(attributes.texture_coordinate, uniforms.{SLICE_UNIFORM});
    return result;
}}
",
        uniform_block(layout)
    )
}

fn render_contribution(contribution: &FieldContribution) -> Result<String, CodegenError> {
    let symbols = FieldSymbols { contribution };
    let resolve = |symbol: &str| symbols.resolve(symbol);
    let id = contribution.id;
    let mut source = format!("// field {id}\n");
    for function in &contribution.descriptor.functions {
        let body = render_template(&function.body, resolve)?;
        let _ = write!(
            source,
            "fn {}({}) -> {} {{\n{}}}\n\n",
            id.namespaced(&function.name),
            function.parameters,
            function.return_type,
            body
        );
    }
    let body = render_template(&contribution.descriptor.sample_body, resolve)?;
    let _ = write!(
        source,
        "fn {}(point: vec3<f32>) -> FieldSample {{\n{}}}\n\n",
        id.namespaced(SAMPLE_FUNCTION),
        body
    );
    Ok(source)
}

/// Builds both stages. Uniform order is the slice, then the kernel's
/// declarations, then every input's declarations in input order.
pub fn assemble(
    mode: &FormatMode,
    kernel: &Kernel,
    inputs: &[FieldContribution],
    targets: usize,
) -> Result<AssembledProgram, CodegenError> {
    let kernel_uniforms = kernel.uniform_declarations();
    let mut declarations = vec![UniformDecl::new(SLICE_UNIFORM, UniformType::Float)];
    declarations.extend(kernel_uniforms.iter().cloned());

    let mut functions = HashSet::new();
    for contribution in inputs {
        let descriptor = &contribution.descriptor;
        declarations.extend(descriptor.uniforms.iter().map(|uniform| {
            UniformDecl::new(contribution.id.namespaced(&uniform.name), uniform.ty)
        }));
        let names = descriptor
            .functions
            .iter()
            .map(|function| function.name.as_str())
            .chain([SAMPLE_FUNCTION]);
        for name in names {
            let symbol = contribution.id.namespaced(name);
            if !functions.insert(symbol.clone()) {
                return Err(CodegenError::DuplicateSymbol(symbol));
            }
        }
    }
    let layout = UniformLayout::new(&declarations)?;

    let kernel_resolve = |symbol: &str| -> Option<String> {
        if let Some((input, name)) = symbol.split_once('.') {
            let index: usize = input.strip_prefix("input")?.parse().ok()?;
            let contribution = inputs.get(index)?;
            return FieldSymbols { contribution }.resolve(name);
        }
        (symbol == SLICE_UNIFORM || kernel_uniforms.iter().any(|uniform| uniform.name == symbol))
            .then(|| format!("uniforms.{symbol}"))
    };

    let mut fragment = format!("alias Buffer = {};\n\n", mode.buffer_type);
    fragment.push_str(&uniform_block(&layout));
    fragment.push('\n');
    fragment.push_str(VARYINGS);
    fragment.push('\n');
    fragment.push_str(FIELD_SAMPLE);
    fragment.push('\n');
    fragment.push_str("@group(1) @binding(0) var input_sampler: sampler;\n");
    for contribution in inputs {
        let _ = writeln!(
            fragment,
            "@group(1) @binding({}) var input_texture{}: {};",
            contribution.unit + 1,
            contribution.unit,
            mode.sampler_type
        );
    }
    fragment.push('\n');
    for contribution in inputs {
        fragment.push_str(&fetch_function(contribution.unit, mode.representation));
        fragment.push('\n');
    }
    fragment.push_str(&render_template(&kernel.header_source(), kernel_resolve)?);
    fragment.push('\n');
    for contribution in inputs {
        fragment.push_str(&render_contribution(contribution)?);
    }
    fragment.push_str("struct FragmentOutput {\n");
    for target in 0..targets {
        let _ = writeln!(
            fragment,
            "    @location({target}) output{target}: vec4<Buffer>,"
        );
    }
    fragment.push_str("}\n\n");
    fragment.push_str(&render_template(
        &kernel.compute_source(targets),
        kernel_resolve,
    )?);

    trace!(
        kernel = kernel.label(),
        inputs = inputs.len(),
        targets,
        uniform_bytes = layout.size(),
        "shader assembled"
    );
    Ok(AssembledProgram {
        vertex_source: vertex_source(&layout),
        fragment_source: fragment,
        uniforms: layout,
    })
}
